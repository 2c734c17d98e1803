//! Server configuration and attach options.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stoic_proto::PROTOCOL_VERSION;

use crate::{Error, Result};

/// Version name exchanged during the handshake.
pub const VERSION_NAME: &str = env!("CARGO_PKG_VERSION");

/// Delay after sending `ProtocolError` before the connection is dropped.
pub const DEFAULT_ERROR_GRACE: Duration = Duration::from_secs(1);

const OPTIONS_FILE: &str = "options.json";

/// How the server came to be running, as recorded by whoever started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOptions {
    /// Protocol version the starter expects the server to speak.
    #[serde(rename = "stoicProtocolVersion")]
    pub protocol_version: i32,
    /// Attach mechanism, reported by `stoic-status`.
    pub attached_via: String,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self::new("embedded")
    }
}

impl AttachOptions {
    /// Options for the current protocol version.
    pub fn new(attached_via: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            attached_via: attached_via.into(),
        }
    }

    /// Loads `options.json` from `stoic_dir`.
    ///
    /// Fails if the file was written for another protocol version.
    pub fn load(stoic_dir: &Path) -> Result<Self> {
        let data = fs::read_to_string(stoic_dir.join(OPTIONS_FILE))?;
        let options: Self = serde_json::from_str(&data)?;
        if options.protocol_version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                received: options.protocol_version,
            });
        }
        Ok(options)
    }

    /// Writes `options.json` into `stoic_dir`.
    pub fn save(&self, stoic_dir: &Path) -> Result<()> {
        fs::create_dir_all(stoic_dir)?;
        let data = serde_json::to_string_pretty(self)?;
        fs::write(stoic_dir.join(OPTIONS_FILE), data)?;
        Ok(())
    }
}

/// Per-server settings handed to every session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Version name compared (for diagnostics only) during the handshake.
    pub version_name: String,
    /// Delay after a fatal error before the session returns.
    pub error_grace: Duration,
    /// Recompute the SHA-256 of uploads and reject mismatches.
    pub verify_uploads: bool,
    /// Attach details reported by `stoic-status`.
    pub attach: AttachOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version_name: VERSION_NAME.to_owned(),
            error_grace: DEFAULT_ERROR_GRACE,
            verify_uploads: true,
            attach: AttachOptions::default(),
        }
    }
}
