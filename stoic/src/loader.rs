//! Turning stored plugin artifacts into runnable bodies.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::plugin::{Plugin, PluginContext, PluginResult};
use crate::{Error, Result};

/// How often a running child is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Materializes an uploaded plugin from its stored artifact.
///
/// How code is loaded is host specific; the session only needs a
/// [`Plugin`] back.
pub trait PluginLoader: Send + Sync {
    /// Loads the artifact at `artifact`, stored under plugin name `name`.
    fn load(&self, name: &str, artifact: &Path) -> Result<Arc<dyn Plugin>>;
}

/// Runs stored artifacts as child processes.
///
/// The child gets the plugin arguments and the request environment, and its
/// stdin/stdout/stderr are wired to the plugin context's streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLoader;

impl PluginLoader for ProcessLoader {
    fn load(&self, name: &str, artifact: &Path) -> Result<Arc<dyn Plugin>> {
        if !artifact.is_file() {
            return Err(Error::Load {
                name: name.to_owned(),
                reason: format!("{} is not a file", artifact.display()),
            });
        }
        Ok(Arc::new(ProcessPlugin {
            program: artifact.to_path_buf(),
        }))
    }
}

/// A plugin body backed by an executable file.
#[derive(Debug)]
struct ProcessPlugin {
    program: PathBuf,
}

impl Plugin for ProcessPlugin {
    fn run(&self, ctx: &mut PluginContext, args: &[String]) -> PluginResult {
        let mut child = Command::new(&self.program)
            .args(args)
            .envs(ctx.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        debug!(program = %self.program.display(), pid = child.id(), "spawned plugin process");

        // Input may keep flowing after the child exits, so it is pumped on a
        // detached thread that ends with the input stream.
        if let Some(mut child_stdin) = child.stdin.take() {
            let mut input = ctx.take_stdin();
            std::thread::spawn(move || {
                if let Err(e) = io::copy(&mut input, &mut child_stdin) {
                    debug!("plugin process stdin closed: {e}");
                }
            });
        }

        let (Some(mut child_stdout), Some(mut child_stderr)) =
            (child.stdout.take(), child.stderr.take())
        else {
            return Err(io::Error::other("plugin process pipes missing").into());
        };

        let cancelled = ctx.cancel_flag();
        let (_, out, err) = ctx.split();
        let status = std::thread::scope(|s| {
            s.spawn(move || forward(&mut child_stdout, out));
            s.spawn(move || forward(&mut child_stderr, err));
            wait(&mut child, &cancelled)
        })?;

        Ok(status.code().unwrap_or(-1))
    }
}

fn forward(from: &mut impl Read, to: &mut (dyn Write + Send)) {
    if let Err(e) = io::copy(from, to) {
        debug!("plugin process output dropped: {e}");
    }
}

/// Waits for `child`, killing it if the run is cancelled.
fn wait(child: &mut Child, cancelled: &AtomicBool) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancelled.load(Ordering::SeqCst) {
            debug!(pid = child.id(), "killing cancelled plugin process");
            child.kill()?;
            return child.wait();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
