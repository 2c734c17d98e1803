//! Client side of the plugin protocol.
//!
//! Starts one plugin per connection, uploading its code first when the
//! server asks for it, and relays the plugin's standard streams.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use stoic_proto::{
    FailureCode, LoadPlugin, LogLevel, MessageReader, MessageWriter, PROTOCOL_VERSION, Payload,
    STDERR, STDIN, STDOUT, StartPlugin, VerifyProtocolVersion,
};
use tracing::{debug, info};

use crate::config::VERSION_NAME;
use crate::store::sha256_hex;
use crate::{Error, Result};

const STDIN_CHUNK: usize = 8 * 1024;

/// Plugin code to send when the server does not have it yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// File name the server stores the code under.
    pub name: String,
    /// Lowercase hex SHA-256 of `bytes`.
    pub sha: String,
    /// Plugin code.
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Wraps `bytes`, computing their content hash.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            sha: sha256_hex(&bytes),
            bytes,
        }
    }
}

/// What to run on the server.
#[derive(Debug, Clone)]
pub struct Invocation {
    plugin_name: Option<String>,
    plugin_sha: Option<String>,
    upload: Option<Upload>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    min_log_level: LogLevel,
}

impl Invocation {
    /// Runs a plugin registered on the server under `name`.
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            plugin_name: Some(name.into()),
            plugin_sha: None,
            upload: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            min_log_level: LogLevel::default(),
        }
    }

    /// Runs uploaded code, sending it only if the server lacks it.
    pub fn uploaded(upload: Upload) -> Self {
        Self {
            plugin_name: Some(upload.name.clone()),
            plugin_sha: Some(upload.sha.clone()),
            upload: Some(upload),
            ..Self::builtin(String::new())
        }
    }

    /// Sets the plugin arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable visible to the plugin.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the minimum log level passed to the plugin.
    #[must_use]
    pub const fn min_log_level(mut self, level: LogLevel) -> Self {
        self.min_log_level = level;
        self
    }

    fn start_request(&self) -> StartPlugin {
        StartPlugin {
            plugin_name: self.plugin_name.clone(),
            plugin_sha: self.plugin_sha.clone(),
            plugin_args: self.args.clone(),
            min_log_level: self.min_log_level,
            env: self.env.clone(),
        }
    }

    fn label(&self) -> &str {
        self.plugin_name
            .as_deref()
            .or(self.plugin_sha.as_deref())
            .unwrap_or_default()
    }
}

/// A connection to a plugin server.
#[derive(Debug)]
pub struct Client<R, W> {
    reader: MessageReader<R>,
    writer: Arc<MessageWriter<W>>,
    version_name: String,
}

#[cfg(unix)]
impl Client<io::BufReader<std::os::unix::net::UnixStream>, std::os::unix::net::UnixStream> {
    /// Connects to a server listening on the Unix socket at `path`.
    pub fn connect(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        let reader = io::BufReader::new(stream.try_clone()?);
        Ok(Self::new(reader, stream))
    }
}

impl<R, W> Client<R, W>
where
    R: Read,
    W: Write + Send + 'static,
{
    /// Wraps an established connection.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: MessageReader::new(reader),
            writer: Arc::new(MessageWriter::new(writer)),
            version_name: VERSION_NAME.to_owned(),
        }
    }

    /// Overrides the version name sent in the handshake.
    #[must_use]
    pub fn with_version_name(mut self, name: impl Into<String>) -> Self {
        self.version_name = name.into();
        self
    }

    /// Runs `invocation` to completion and returns the plugin's exit code.
    ///
    /// `stdin` is forwarded on a background thread for as long as the
    /// plugin runs; plugin output is written to `stdout` and `stderr`.
    pub fn run(
        mut self,
        invocation: &Invocation,
        stdin: impl Read + Send + 'static,
        stdout: &mut impl Write,
        stderr: &mut impl Write,
    ) -> Result<i32> {
        // Both requests go out before either response is read.
        let verify_id = self.writer.write_request(
            VerifyProtocolVersion {
                protocol_version: PROTOCOL_VERSION,
                version_name: self.version_name.clone(),
            },
            None,
            true,
        )?;
        let start_id = self
            .writer
            .write_request(invocation.start_request(), None, true)?;

        self.expect_success(verify_id)?;
        match self.expect_success(start_id) {
            Ok(_) => {}
            Err(Error::Rejected {
                code: FailureCode::PluginMissing,
                message,
            }) => {
                let Some(upload) = &invocation.upload else {
                    return Err(Error::PluginMissing(format!("{}: {message}", invocation.label())));
                };
                info!(name = %upload.name, sha = %upload.sha, "server lacks plugin, uploading");
                self.upload(upload)?;
                let retry_id = self
                    .writer
                    .write_request(invocation.start_request(), None, true)?;
                self.expect_success(retry_id)?;
            }
            Err(e) => return Err(e),
        }

        let gate = Arc::new(StdinGate::new(Arc::clone(&self.writer)));
        self.forward_stdin(stdin, Arc::clone(&gate))?;
        let exit_code = self.relay_output(stdout, stderr)?;

        gate.close()?;
        Ok(exit_code)
    }

    /// Sends `LoadPlugin` followed by the code on the same request id.
    fn upload(&mut self, upload: &Upload) -> Result<()> {
        let id = self.writer.write_request(
            LoadPlugin {
                plugin_name: Some(upload.name.clone()),
                plugin_sha: upload.sha.clone(),
            },
            None,
            false,
        )?;
        self.writer
            .write_request(upload.bytes.clone(), Some(id), true)?;
        self.expect_success(id)?;
        Ok(())
    }

    /// Reads the response to `request_id` and returns its message.
    fn expect_success(&mut self, request_id: i32) -> Result<String> {
        let message = self.reader.consume_next()?;
        match message.payload {
            Payload::ProtocolError(e) => Err(Error::Remote(e.message)),
            _ if !message.is_response() || message.request_id != request_id => {
                Err(Error::UnexpectedMessage(format!(
                    "{} on request {} while awaiting response to {request_id}",
                    message.payload, message.request_id
                )))
            }
            Payload::Succeeded(ok) => {
                debug!(request_id, "{}", ok.message);
                Ok(ok.message)
            }
            Payload::Failed(failed) => Err(Error::Rejected {
                code: failed.code(),
                message: failed.message,
            }),
            other => Err(Error::UnexpectedMessage(other.to_string())),
        }
    }

    /// Forwards local input as stdin frames until it ends or the run does.
    fn forward_stdin(
        &self,
        mut input: impl Read + Send + 'static,
        gate: Arc<StdinGate<W>>,
    ) -> Result<()> {
        self.writer.open_stdin_for_writing();
        thread::Builder::new()
            .name("stoic-stdin".to_owned())
            .spawn(move || {
                let mut buf = vec![0u8; STDIN_CHUNK];
                loop {
                    let n = match input.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("local stdin failed: {e}");
                            break;
                        }
                    };
                    match gate.send(&buf[..n]) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            debug!("forwarding stdin failed: {e}");
                            return;
                        }
                    }
                }
                if let Err(e) = gate.close() {
                    debug!("closing stdin failed: {e}");
                }
            })?;
        Ok(())
    }

    /// Copies plugin output until `PluginFinished` and returns its exit code.
    fn relay_output(&mut self, stdout: &mut impl Write, stderr: &mut impl Write) -> Result<i32> {
        loop {
            let message = self.reader.consume_next()?;
            let complete = message.is_complete();
            match message.payload {
                Payload::Raw(bytes) if message.request_id == STDOUT => {
                    stdout.write_all(&bytes)?;
                    if complete {
                        stdout.flush()?;
                    }
                }
                Payload::Raw(bytes) if message.request_id == STDERR => {
                    stderr.write_all(&bytes)?;
                    if complete {
                        stderr.flush()?;
                    }
                }
                Payload::PluginFinished(finished) => {
                    stdout.flush()?;
                    stderr.flush()?;
                    info!(exit_code = finished.exit_code, "plugin finished");
                    return Ok(finished.exit_code);
                }
                Payload::ProtocolError(e) => return Err(Error::Remote(e.message)),
                other => {
                    return Err(Error::UnexpectedMessage(format!(
                        "{other} on request {} while relaying plugin output",
                        message.request_id
                    )));
                }
            }
        }
    }
}

/// Stdin frames on one connection: chunks until closed, then exactly one
/// completion frame, whichever thread gets there first.
struct StdinGate<W: Write> {
    writer: Arc<MessageWriter<W>>,
    closed: Mutex<bool>,
}

impl<W: Write> StdinGate<W> {
    fn new(writer: Arc<MessageWriter<W>>) -> Self {
        Self {
            writer,
            closed: Mutex::new(false),
        }
    }

    /// Writes `chunk` unless stdin is already closed. Returns `false` if it was.
    fn send(&self, chunk: &[u8]) -> Result<bool> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Ok(false);
        }
        self.writer.write_one_way(chunk.to_vec(), Some(STDIN), false)?;
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if !*closed {
            *closed = true;
            self.writer.write_one_way(Vec::new(), Some(STDIN), true)?;
        }
        Ok(())
    }
}
