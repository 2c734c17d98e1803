//! Plugin server: shared state, builder and the Unix socket listener.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{AttachOptions, ServerConfig};
use crate::loader::{PluginLoader, ProcessLoader};
use crate::plugin::Plugin;
use crate::registry::PluginRegistry;
use crate::session::Session;
use crate::store::PluginStore;
use crate::Result;

/// State shared by every session of one server.
pub(crate) struct Shared {
    pub(crate) registry: PluginRegistry,
    pub(crate) store: Arc<PluginStore>,
    pub(crate) loader: Arc<dyn PluginLoader>,
    pub(crate) config: ServerConfig,
}

/// Builder for a [`Server`].
///
/// Defaults: the store from [`PluginStore::open_default`], the
/// [`ProcessLoader`], a one second error grace and upload verification on.
///
/// # Example
///
/// ```no_run
/// use stoic::{PluginContext, PluginResult, Server};
/// use std::io::Write;
///
/// let server = Server::builder()
///     .plugin("hello", |ctx: &mut PluginContext, _: &[String]| -> PluginResult {
///         writeln!(ctx.stdout(), "hello")?;
///         Ok(0)
///     })
///     .build()
///     .expect("plugin store");
/// ```
#[must_use = "a ServerBuilder does nothing until .build() is called"]
pub struct ServerBuilder {
    registry: PluginRegistry,
    store: Option<Arc<PluginStore>>,
    loader: Arc<dyn PluginLoader>,
    config: ServerConfig,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Uses `store` for uploaded plugins.
    pub fn store(mut self, store: impl Into<Arc<PluginStore>>) -> Self {
        self.store = Some(store.into());
        self
    }

    /// Registers a builtin plugin under `name`.
    pub fn plugin(mut self, name: impl Into<String>, plugin: impl Plugin + 'static) -> Self {
        self.registry.register(name, plugin);
        self
    }

    /// Sets how uploaded plugins are turned into runnable bodies.
    pub fn loader(mut self, loader: impl PluginLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Sets the delay between reporting a fatal error and closing (default: 1 s).
    pub const fn error_grace(mut self, grace: Duration) -> Self {
        self.config.error_grace = grace;
        self
    }

    /// Enables or disables SHA-256 verification of uploads (default: on).
    pub const fn verify_uploads(mut self, verify: bool) -> Self {
        self.config.verify_uploads = verify;
        self
    }

    /// Overrides the version name sent in the handshake.
    pub fn version_name(mut self, name: impl Into<String>) -> Self {
        self.config.version_name = name.into();
        self
    }

    /// Sets the attach details reported by `stoic-status`.
    pub fn attach(mut self, options: AttachOptions) -> Self {
        self.config.attach = options;
        self
    }

    /// Builds the [`Server`], installing the builtin plugins.
    pub fn build(mut self) -> Result<Server> {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(PluginStore::open_default()?),
        };
        self.registry
            .install_builtins(&self.config.version_name, &self.config.attach.attached_via);
        debug!(root = %store.root().display(), plugins = ?self.registry, "server configured");

        Ok(Server {
            shared: Arc::new(Shared {
                registry: self.registry,
                store,
                loader: self.loader,
                config: self.config,
            }),
        })
    }
}

/// Serves plugin sessions.
///
/// Cheap to clone; clones share the registry, store and configuration.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.shared.registry)
            .field("store", &self.shared.store)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Returns a new [`ServerBuilder`] with default settings.
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            registry: PluginRegistry::new(),
            store: None,
            loader: Arc::new(ProcessLoader),
            config: ServerConfig::default(),
        }
    }

    /// Configuration shared by this server's sessions.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Store holding uploaded plugins.
    pub fn store(&self) -> &PluginStore {
        &self.shared.store
    }

    /// Runs one session over an already established connection.
    ///
    /// Returns when the client disconnects, after a plugin has run, or on a
    /// fatal error (which is reported to the client first).
    pub fn serve_connection<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        Session::new(&self.shared, reader, writer).run()
    }
}

#[cfg(unix)]
mod unix {
    use std::io::{self, BufReader};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::Path;
    use std::thread;

    use tracing::{error, info, warn};

    use super::Server;
    use crate::Result;

    impl Server {
        /// Binds a Unix socket at `path`, replacing a stale socket file.
        pub fn bind(path: impl AsRef<Path>) -> Result<UnixListener> {
            let path = path.as_ref();
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Ok(UnixListener::bind(path)?)
        }

        /// Accepts connections forever, one session thread per connection.
        pub fn serve(&self, listener: &UnixListener) -> Result<()> {
            info!(addr = ?listener.local_addr().ok(), "accepting plugin connections");
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let server = self.clone();
                thread::Builder::new()
                    .name("stoic-plugin".to_owned())
                    .spawn(move || {
                        if let Err(e) = server.serve_stream(stream) {
                            error!("session error: {e}");
                        }
                    })?;
            }
            Ok(())
        }

        /// Runs one session over a connected Unix stream.
        pub fn serve_stream(&self, stream: UnixStream) -> Result<()> {
            let reader = BufReader::new(stream.try_clone()?);
            self.serve_connection(reader, stream)
        }
    }
}
