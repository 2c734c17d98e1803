//! Server side of one connection.
//!
//! A session handles exactly one handshake, any number of uploads and at
//! most one plugin run. Its thread owns the [`MessageReader`]; the plugin
//! body runs on its own thread and shares the [`MessageWriter`] through an
//! `Arc`.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use stoic_proto::{
    Failed, FailureCode, InboundStream, LoadPlugin, MessageReader, MessageWriter, OutboundStream,
    PROTOCOL_VERSION, Payload, PayloadTag, PipeWriter, PluginFinished, ProtocolError, STDERR,
    STDIN, STDOUT, StartPlugin, Succeeded, pipe,
};
use tracing::{debug, error, info, warn};

use crate::plugin::{Plugin, PluginContext, run_plugin};
use crate::server::Shared;
use crate::store::sha256_hex;
use crate::{Error, Result};

pub(crate) struct Session<'a, R, W: Write> {
    shared: &'a Shared,
    reader: MessageReader<R>,
    writer: Arc<MessageWriter<W>>,
    /// Raised when the session gives up while a plugin is still running.
    cancelled: Arc<AtomicBool>,
}

impl<'a, R, W> Session<'a, R, W>
where
    R: Read,
    W: Write + Send + 'static,
{
    pub(crate) fn new(shared: &'a Shared, reader: R, writer: W) -> Self {
        Self {
            shared,
            reader: MessageReader::new(reader),
            writer: Arc::new(MessageWriter::new(writer)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the session to completion.
    ///
    /// Fatal errors are reported to the peer before returning, followed by
    /// the configured grace delay.
    pub(crate) fn run(mut self) -> Result<()> {
        let result = self
            .verify_protocol_version()
            .and_then(|()| self.dispatch());
        if let Err(e) = &result {
            self.abort(e);
        }
        result
    }

    fn verify_protocol_version(&mut self) -> Result<()> {
        let message = self.reader.consume_next()?;
        let request_id = message.request_id;
        let Payload::VerifyProtocolVersion(verify) = message.payload else {
            return Err(Error::UnexpectedMessage(format!(
                "{} before protocol version check",
                message.payload
            )));
        };

        if verify.protocol_version != PROTOCOL_VERSION {
            let detail = format!(
                "protocol version mismatch: server speaks {PROTOCOL_VERSION}, client sent {}",
                verify.protocol_version
            );
            self.writer.write_response(
                request_id,
                Failed::new(FailureCode::Unspecified, detail),
                true,
            )?;
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                received: verify.protocol_version,
            });
        }

        let ours = &self.shared.config.version_name;
        if verify.version_name != *ours {
            warn!(
                client = %verify.version_name,
                server = %ours,
                "version name differs, continuing with protocol {PROTOCOL_VERSION}"
            );
        }

        self.writer.write_response(
            request_id,
            Succeeded {
                message: format!("Protocol version {PROTOCOL_VERSION} verified"),
            },
            true,
        )?;
        Ok(())
    }

    /// Handles uploads until a plugin has run or the client is done.
    fn dispatch(&mut self) -> Result<()> {
        loop {
            let tag = match self.reader.peek_next() {
                Ok(message) => message.payload.tag(),
                Err(e) if e.is_closed() => {
                    info!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            match tag {
                PayloadTag::LoadPlugin => self.load_plugin()?,
                PayloadTag::StartPlugin => {
                    if self.start_plugin()? {
                        return Ok(());
                    }
                }
                other => {
                    debug!(?other, "no further plugin requests, ending session");
                    return Ok(());
                }
            }
        }
    }

    fn load_plugin(&mut self) -> Result<()> {
        let descriptor = self.reader.consume_next()?;
        let request_id = descriptor.request_id;
        if !descriptor.is_request() || descriptor.is_complete() {
            return Err(Error::UnexpectedMessage(format!(
                "plugin descriptor on request {request_id} must be an incomplete request"
            )));
        }
        let Payload::LoadPlugin(load) = descriptor.payload else {
            return Err(Error::UnexpectedMessage(descriptor.payload.to_string()));
        };

        let code = self.reader.consume_next()?;
        let code_is_request = code.is_request();
        let bytes = match code.payload {
            Payload::Raw(bytes) if code_is_request && code.request_id == request_id => bytes,
            other => {
                return Err(Error::UnexpectedMessage(format!(
                    "{other} on request {} while expecting plugin code for request {request_id}",
                    code.request_id
                )));
            }
        };

        match self.store_upload(&load, &bytes) {
            Ok(()) => self.writer.write_response(
                request_id,
                Succeeded {
                    message: "Plugin loaded".to_owned(),
                },
                true,
            )?,
            Err(e @ Error::InvalidIdentity(_)) => {
                warn!(sha = %load.plugin_sha, "rejecting upload: {e}");
                self.writer.write_response(
                    request_id,
                    Failed::new(FailureCode::Unspecified, e.to_string()),
                    true,
                )?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn store_upload(&self, load: &LoadPlugin, bytes: &[u8]) -> Result<()> {
        if self.shared.config.verify_uploads {
            let actual = sha256_hex(bytes);
            if actual != load.plugin_sha {
                return Err(Error::InvalidIdentity(format!(
                    "plugin sha {}: uploaded bytes hash to {actual}",
                    load.plugin_sha
                )));
            }
        }
        let path = self
            .shared
            .store
            .store(load.plugin_name.as_deref(), &load.plugin_sha, bytes)?;
        info!(path = %path.display(), size = bytes.len(), "stored plugin");
        Ok(())
    }

    /// Returns `true` once a plugin has run to completion.
    fn start_plugin(&mut self) -> Result<bool> {
        let message = self.reader.consume_next()?;
        let request_id = message.request_id;
        let Payload::StartPlugin(start) = message.payload else {
            return Err(Error::UnexpectedMessage(message.payload.to_string()));
        };

        let plugin = match self.resolve(&start) {
            Ok(Some(plugin)) => plugin,
            Ok(None) => {
                let label = plugin_label(&start);
                info!(plugin = %label, "plugin not available");
                self.writer.write_response(
                    request_id,
                    Failed::new(FailureCode::PluginMissing, format!("plugin {label} not found")),
                    true,
                )?;
                return Ok(false);
            }
            Err(e @ Error::Load { .. }) => {
                warn!("{e}");
                self.writer.write_response(
                    request_id,
                    Failed::new(FailureCode::Unspecified, e.to_string()),
                    true,
                )?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let label = plugin_label(&start);
        self.writer.open_stdout_for_writing();
        self.writer.open_stderr_for_writing();
        let stdout = OutboundStream::new(Arc::clone(&self.writer), STDOUT);
        let stderr = OutboundStream::new(Arc::clone(&self.writer), STDERR);
        let (stdin_tx, stdin_rx) = pipe();
        let mut ctx = PluginContext::new(start.env, stdin_rx, stdout, stderr)
            .with_min_log_level(start.min_log_level)
            .with_cancel_flag(Arc::clone(&self.cancelled));
        let args = start.plugin_args;

        self.writer.write_response(
            request_id,
            Succeeded {
                message: "Plugin started".to_owned(),
            },
            true,
        )?;
        info!(plugin = %label, ?args, "plugin started");

        let writer = Arc::clone(&self.writer);
        let handle = thread::Builder::new()
            .name(format!("stoic-{label}"))
            .spawn(move || {
                let exit_code = run_plugin(&*plugin, &mut ctx, &args);
                // Closes stdout and stderr before the exit code goes out.
                drop(ctx);
                writer.write_one_way(PluginFinished { exit_code }, None, true)?;
                Ok::<_, Error>(exit_code)
            })?;

        self.pump_stdin(stdin_tx)?;

        let exit_code = handle
            .join()
            .map_err(|_| io::Error::other("plugin thread panicked"))??;
        info!(plugin = %label, exit_code, "plugin finished");
        Ok(true)
    }

    fn resolve(&self, start: &StartPlugin) -> Result<Option<Arc<dyn Plugin>>> {
        if let Some(sha) = &start.plugin_sha {
            let name = start.plugin_name.as_deref();
            if !self.shared.store.exists(name, sha) {
                return Ok(None);
            }
            let path = self.shared.store.path(name, sha)?;
            return self
                .shared
                .loader
                .load(name.unwrap_or(sha), &path)
                .map(Some);
        }
        match &start.plugin_name {
            Some(name) => Ok(self.shared.registry.get(name)),
            None => Err(Error::InvalidDispatch),
        }
    }

    /// Feeds stdin frames into the plugin until the client closes stdin.
    fn pump_stdin(&mut self, mut pipe: PipeWriter) -> Result<()> {
        let mut stdin = InboundStream::new(&mut self.reader, STDIN);
        let copied = io::copy(&mut stdin, &mut pipe)?;
        debug!(bytes = copied, "stdin closed by client");
        Ok(())
    }

    fn abort(&self, e: &Error) {
        error!("session failed: {e}");
        self.cancelled.store(true, Ordering::SeqCst);

        // A version mismatch was already answered with `Failed`.
        if !matches!(e, Error::VersionMismatch { .. }) {
            let notice = ProtocolError {
                message: e.to_string(),
            };
            if let Err(write_err) = self.writer.write_one_way(notice, None, true) {
                debug!("could not report protocol error: {write_err}");
            }
        }
        thread::sleep(self.shared.config.error_grace);
    }
}

/// Human-readable plugin identity for logs and failure messages.
fn plugin_label(start: &StartPlugin) -> String {
    match (&start.plugin_name, &start.plugin_sha) {
        (Some(name), _) => name.clone(),
        (None, Some(sha)) => sha.clone(),
        (None, None) => "<unnamed>".to_owned(),
    }
}
