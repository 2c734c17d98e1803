//! Run short-lived plugins inside a long-running host process.
//!
//! A [`Server`] accepts connections and runs one plugin per connection:
//! either a builtin registered with [`ServerBuilder::plugin`], or uploaded
//! code kept in a content-addressed [`PluginStore`] and materialized by a
//! [`PluginLoader`]. A [`Client`] drives the other end, uploading code
//! only when the server reports it missing.
//!
//! # Quick start
//!
//! ```no_run
//! use std::io::{self, Write};
//!
//! use stoic::{Client, Invocation, PluginContext, PluginResult, Server};
//!
//! # fn main() -> stoic::Result<()> {
//! let server = Server::builder()
//!     .plugin("hello", |ctx: &mut PluginContext, args: &[String]| -> PluginResult {
//!         writeln!(ctx.stdout(), "hello {}", args.join(" "))?;
//!         Ok(0)
//!     })
//!     .build()?;
//!
//! let listener = Server::bind("/tmp/stoic.sock")?;
//! std::thread::spawn(move || server.serve(&listener));
//!
//! let code = Client::connect("/tmp/stoic.sock")?.run(
//!     &Invocation::builtin("hello").args(["world"]),
//!     io::empty(),
//!     &mut io::stdout(),
//!     &mut io::stderr(),
//! )?;
//! assert_eq!(code, 0);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod loader;
mod plugin;
mod registry;
mod server;
mod session;
mod store;

pub use client::{Client, Invocation, Upload};
pub use config::{AttachOptions, DEFAULT_ERROR_GRACE, ServerConfig, VERSION_NAME};
pub use error::{Error, Result};
pub use loader::{PluginLoader, ProcessLoader};
pub use plugin::{
    FAILURE_EXIT_CODE, Plugin, PluginContext, PluginError, PluginResult, run_plugin,
};
pub use registry::{LIST, NOOP, PluginRegistry, STATUS};
pub use server::{Server, ServerBuilder};
pub use stoic_proto::{FailureCode, LogLevel, PROTOCOL_VERSION, ProtoError};
pub use store::{PluginStore, sha256_hex};
