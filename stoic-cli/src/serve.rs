//! `stoic serve`: accept plugin sessions on a Unix socket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Arguments for `stoic serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Socket path to listen on. A stale socket file is replaced.
    #[arg(long, short = 's')]
    socket: PathBuf,

    /// Plugin store directory [default: $STOIC_HOME or the platform data dir].
    #[arg(long)]
    store: Option<PathBuf>,

    /// Directory holding the `options.json` written by the attaching tool.
    #[arg(long)]
    options_dir: Option<PathBuf>,

    /// Accept uploads without checking their SHA-256.
    #[arg(long)]
    no_verify: bool,

    /// Milliseconds to wait after reporting a fatal session error.
    #[arg(long, default_value_t = 1000)]
    error_grace_ms: u64,
}

#[cfg(unix)]
pub fn serve(args: ServeArgs) -> Result<i32> {
    use anyhow::Context;
    use stoic::{AttachOptions, PluginStore, Server};

    let attach = match &args.options_dir {
        Some(dir) => AttachOptions::load(dir)
            .with_context(|| format!("loading attach options from {}", dir.display()))?,
        None => AttachOptions::new("cli"),
    };

    let mut builder = Server::builder()
        .attach(attach)
        .verify_uploads(!args.no_verify)
        .error_grace(Duration::from_millis(args.error_grace_ms));
    if let Some(dir) = args.store {
        builder = builder.store(PluginStore::open(dir)?);
    }
    let server = builder.build()?;

    let listener = Server::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    tracing::info!(
        socket = %args.socket.display(),
        store = %server.store().root().display(),
        "stoic server ready"
    );
    server.serve(&listener)?;
    Ok(0)
}

#[cfg(not(unix))]
pub fn serve(_args: ServeArgs) -> Result<i32> {
    anyhow::bail!("serving plugins requires Unix domain sockets")
}
