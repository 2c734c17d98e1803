//! CLI for stoic plugin servers.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;
mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stoic", version, about = "Run plugins inside a long-running process")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve plugin sessions on a Unix socket.
    Serve(serve::ServeArgs),

    /// Run a plugin on a server and exit with its exit code.
    Run(run::RunArgs),

    /// Print the content hash a plugin file is stored under.
    Sha {
        /// Plugin file.
        path: PathBuf,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STOIC_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("stoic: {e:#}");
            std::process::exit(1);
        }
    }
}

impl Cli {
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Serve(args) => serve::serve(args),
            Command::Run(args) => run::run(args),
            Command::Sha { path } => {
                let bytes =
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                println!("{}", stoic::sha256_hex(&bytes));
                Ok(0)
            }
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "stoic", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}
