//! `stoic run`: start a plugin on a server.
//!
//! Usage: `stoic run [OPTIONS] --socket PATH PLUGIN [ARG...]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use stoic::{Invocation, LogLevel, Upload};

/// Arguments for `stoic run`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Server socket path.
    #[arg(long, short = 's')]
    socket: PathBuf,

    /// Plugin file to upload if the server does not have it yet.
    ///
    /// PLUGIN then names the stored file.
    #[arg(long)]
    upload: Option<PathBuf>,

    /// Set environment variables for the plugin (KEY=VALUE).
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Minimum log level passed to the plugin.
    #[arg(long, default_value_t = LogLevel::default())]
    log_level: LogLevel,

    /// Builtin name, or the name of the uploaded file.
    plugin: String,

    /// Arguments passed to the plugin.
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,
}

impl RunArgs {
    fn invocation(&self) -> Result<Invocation> {
        let mut invocation = match &self.upload {
            Some(path) => {
                let bytes =
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                Invocation::uploaded(Upload::new(&self.plugin, bytes))
            }
            None => Invocation::builtin(&self.plugin),
        };
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid --env {pair:?}, expected KEY=VALUE"))?;
            invocation = invocation.env(key, value);
        }
        Ok(invocation
            .args(self.args.iter().cloned())
            .min_log_level(self.log_level))
    }
}

#[cfg(unix)]
pub fn run(args: RunArgs) -> Result<i32> {
    use stoic::Client;

    let invocation = args.invocation()?;
    let client = Client::connect(&args.socket)
        .with_context(|| format!("connecting to {}", args.socket.display()))?;
    let code = client.run(
        &invocation,
        std::io::stdin(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )?;
    Ok(code)
}

#[cfg(not(unix))]
pub fn run(args: RunArgs) -> Result<i32> {
    let _ = args.invocation()?;
    anyhow::bail!("running plugins requires Unix domain sockets")
}
