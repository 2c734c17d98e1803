//! Plugin bodies and the context they run in.
//!
//! A plugin is handed an explicit [`PluginContext`] carrying its environment
//! and standard streams; nothing is reached through ambient thread state.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use stoic_proto::LogLevel;
use tracing::warn;

/// Exit code reported for any plugin failure other than [`PluginError::Exit`].
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Outcome of a plugin body: an exit code or a failure.
pub type PluginResult = Result<i32, PluginError>;

/// Failures raised by a plugin body.
///
/// These never end the session: [`PluginError::Exit`] becomes the reported
/// exit code verbatim, everything else is printed to the plugin's stderr and
/// reported as [`FAILURE_EXIT_CODE`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The plugin asked to exit with this code.
    #[error("plugin exited with code {0}")]
    Exit(i32),

    /// I/O on one of the plugin's streams failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    /// Builds a [`PluginError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A runnable plugin body.
///
/// Builtins are registered by name; uploaded plugins are produced by a
/// [`PluginLoader`](crate::PluginLoader).
pub trait Plugin: Send + Sync {
    /// Runs the plugin to completion and returns its exit code.
    fn run(&self, ctx: &mut PluginContext, args: &[String]) -> PluginResult;
}

impl<F> Plugin for F
where
    F: Fn(&mut PluginContext, &[String]) -> PluginResult + Send + Sync,
{
    fn run(&self, ctx: &mut PluginContext, args: &[String]) -> PluginResult {
        self(ctx, args)
    }
}

/// Environment and standard streams of one plugin run.
pub struct PluginContext {
    env: BTreeMap<String, String>,
    stdin: Box<dyn Read + Send>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    min_log_level: LogLevel,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("env", &self.env)
            .field("min_log_level", &self.min_log_level)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    /// Creates a context around the given environment and streams.
    pub fn new(
        env: BTreeMap<String, String>,
        stdin: impl Read + Send + 'static,
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self {
            env,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            min_log_level: LogLevel::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the threshold used by [`PluginContext::log`].
    #[must_use]
    pub const fn with_min_log_level(mut self, level: LogLevel) -> Self {
        self.min_log_level = level;
        self
    }

    /// Shares a cancellation flag with the owner of the run.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Environment passed with the start request.
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Looks a variable up in the request environment, then the process's.
    pub fn getenv(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// The plugin's standard input.
    pub fn stdin(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.stdin
    }

    /// Takes ownership of standard input, leaving an empty reader behind.
    ///
    /// Useful for pumping input on a thread that may outlive the run.
    pub fn take_stdin(&mut self) -> Box<dyn Read + Send> {
        std::mem::replace(&mut self.stdin, Box::new(io::empty()))
    }

    /// The plugin's standard output.
    pub fn stdout(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.stdout
    }

    /// The plugin's standard error.
    pub fn stderr(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.stderr
    }

    /// Borrows stdin, stdout and stderr at once.
    pub fn split(
        &mut self,
    ) -> (
        &mut (dyn Read + Send),
        &mut (dyn Write + Send),
        &mut (dyn Write + Send),
    ) {
        (&mut *self.stdin, &mut *self.stdout, &mut *self.stderr)
    }

    /// Minimum log level requested by the caller.
    pub const fn min_log_level(&self) -> LogLevel {
        self.min_log_level
    }

    /// Writes `message` to stderr if `level` meets the requested minimum.
    pub fn log(&mut self, level: LogLevel, message: &str) -> io::Result<()> {
        if level.meets(self.min_log_level) {
            writeln!(self.stderr, "{message}")?;
        }
        Ok(())
    }

    /// Whether the session gave up on this run.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Handle to the cancellation flag, for watchers on other threads.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

/// Runs `plugin` and maps its outcome to an exit code.
///
/// Failures other than an explicit exit, including panics, are described on
/// the plugin's stderr and reported as [`FAILURE_EXIT_CODE`].
pub fn run_plugin(plugin: &dyn Plugin, ctx: &mut PluginContext, args: &[String]) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| plugin.run(ctx, args)));
    let description = match outcome {
        Ok(Ok(code) | Err(PluginError::Exit(code))) => return code,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("plugin panicked: {}", panic_message(&*payload)),
    };

    warn!("plugin failed: {description}");
    if let Err(e) = writeln!(ctx.stderr(), "{description}") {
        warn!("could not report plugin failure on stderr: {e}");
    }
    FAILURE_EXIT_CODE
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
