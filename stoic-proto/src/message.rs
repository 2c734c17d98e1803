//! Protocol message types and their payload tags.
//!
//! Structured payloads are JSON so new optional fields can be added without
//! touching the binary frame layout. [`Payload::Raw`] bytes travel verbatim.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Flags, Frame};
use crate::error::{ProtoError, Result};

/// Protocol version, compared for exact equality during the handshake.
pub const PROTOCOL_VERSION: i32 = 5;

/// Reserved stream id for plugin standard input.
pub const STDIN: i32 = 0;
/// Reserved stream id for plugin standard output.
pub const STDOUT: i32 = 1;
/// Reserved stream id for plugin standard error.
pub const STDERR: i32 = 2;
/// First id handed out by request id allocation.
pub const FIRST_ALLOCATED_ID: i32 = 3;

/// Wire tag selecting a payload's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum PayloadTag {
    /// Untyped bytes.
    Raw = 1,
    /// [`VerifyProtocolVersion`].
    VerifyProtocolVersion = 2,
    /// [`StartPlugin`].
    StartPlugin = 3,
    /// [`LoadPlugin`].
    LoadPlugin = 4,
    /// [`PluginFinished`].
    PluginFinished = 5,
    /// [`Succeeded`].
    Succeeded = 6,
    /// [`Failed`].
    Failed = 7,
    /// [`ProtocolError`].
    ProtocolError = 8,
}

impl TryFrom<u32> for PayloadTag {
    type Error = ProtoError;

    fn try_from(tag: u32) -> Result<Self> {
        Ok(match tag {
            1 => Self::Raw,
            2 => Self::VerifyProtocolVersion,
            3 => Self::StartPlugin,
            4 => Self::LoadPlugin,
            5 => Self::PluginFinished,
            6 => Self::Succeeded,
            7 => Self::Failed,
            8 => Self::ProtocolError,
            other => return Err(ProtoError::UnknownPayloadTag(other)),
        })
    }
}

/// Failure codes carried by [`Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FailureCode {
    /// Generic failure, including a protocol version mismatch.
    Unspecified,
    /// The requested plugin is not available; upload it and retry.
    PluginMissing,
}

impl FailureCode {
    /// Integer carried on the wire.
    pub const fn code(self) -> i32 {
        match self {
            Self::Unspecified => 0,
            Self::PluginMissing => 1,
        }
    }

    /// Maps a wire code back, treating unknown codes as [`Self::Unspecified`].
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::PluginMissing,
            _ => Self::Unspecified,
        }
    }
}

/// Minimum log level requested for a plugin run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum LogLevel {
    /// Everything.
    Verbose,
    /// Debug and above.
    #[default]
    Debug,
    /// Info and above.
    Info,
    /// Warnings and errors.
    Warn,
    /// Errors only.
    Error,
    /// Assertion failures only.
    Assert,
}

impl LogLevel {
    /// Whether a message at `self` passes a `minimum` threshold.
    pub fn meets(self, minimum: Self) -> bool {
        self >= minimum
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verbose => "VERBOSE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Assert => "ASSERT",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VERBOSE" => Ok(Self::Verbose),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "ASSERT" => Ok(Self::Assert),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// First request of every session: protocol version handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyProtocolVersion {
    /// Sender's [`PROTOCOL_VERSION`].
    pub protocol_version: i32,
    /// Sender's build version name, compared for diagnostics only.
    #[serde(rename = "stoicVersionName")]
    pub version_name: String,
}

/// Requests that a plugin be started.
///
/// `plugin_sha` selects an uploaded plugin; otherwise `plugin_name` selects
/// a builtin. At least one of them is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPlugin {
    /// Builtin name, or the file name of an uploaded plugin.
    pub plugin_name: Option<String>,
    /// Content hash of an uploaded plugin.
    pub plugin_sha: Option<String>,
    /// Arguments passed to the plugin body.
    pub plugin_args: Vec<String>,
    /// Minimum log level for the plugin run.
    pub min_log_level: LogLevel,
    /// Extra environment visible to the plugin.
    pub env: BTreeMap<String, String>,
}

/// Descriptor frame of a plugin upload; the code follows as a raw frame
/// on the same request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPlugin {
    /// File name under which the code is stored.
    pub plugin_name: Option<String>,
    /// Content hash keying the plugin store.
    pub plugin_sha: String,
}

/// One-way notification that the plugin body returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginFinished {
    /// Plugin exit code.
    pub exit_code: i32,
}

/// Positive response to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Succeeded {
    /// Human-readable detail.
    pub message: String,
}

/// Negative response to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failed {
    /// Wire value of a [`FailureCode`].
    pub failure_code: i32,
    /// Human-readable detail.
    pub message: String,
}

impl Failed {
    /// Builds a failure with the given code.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            failure_code: code.code(),
            message: message.into(),
        }
    }

    /// The failure code, with unknown values mapped to `Unspecified`.
    pub const fn code(&self) -> FailureCode {
        FailureCode::from_code(self.failure_code)
    }
}

/// One-way notice that the sender hit a fatal session error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Description of the failure.
    pub message: String,
}

/// Decoded payload, one variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Payload {
    /// Untyped bytes: stream data or plugin code.
    Raw(Vec<u8>),
    /// See [`VerifyProtocolVersion`].
    VerifyProtocolVersion(VerifyProtocolVersion),
    /// See [`StartPlugin`].
    StartPlugin(StartPlugin),
    /// See [`LoadPlugin`].
    LoadPlugin(LoadPlugin),
    /// See [`PluginFinished`].
    PluginFinished(PluginFinished),
    /// See [`Succeeded`].
    Succeeded(Succeeded),
    /// See [`Failed`].
    Failed(Failed),
    /// See [`ProtocolError`].
    ProtocolError(ProtocolError),
}

impl Payload {
    /// Wire tag for this payload.
    pub const fn tag(&self) -> PayloadTag {
        match self {
            Self::Raw(_) => PayloadTag::Raw,
            Self::VerifyProtocolVersion(_) => PayloadTag::VerifyProtocolVersion,
            Self::StartPlugin(_) => PayloadTag::StartPlugin,
            Self::LoadPlugin(_) => PayloadTag::LoadPlugin,
            Self::PluginFinished(_) => PayloadTag::PluginFinished,
            Self::Succeeded(_) => PayloadTag::Succeeded,
            Self::Failed(_) => PayloadTag::Failed,
            Self::ProtocolError(_) => PayloadTag::ProtocolError,
        }
    }

    /// Serializes the payload body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Raw(bytes) => bytes.clone(),
            Self::VerifyProtocolVersion(m) => serde_json::to_vec(m)?,
            Self::StartPlugin(m) => serde_json::to_vec(m)?,
            Self::LoadPlugin(m) => serde_json::to_vec(m)?,
            Self::PluginFinished(m) => serde_json::to_vec(m)?,
            Self::Succeeded(m) => serde_json::to_vec(m)?,
            Self::Failed(m) => serde_json::to_vec(m)?,
            Self::ProtocolError(m) => serde_json::to_vec(m)?,
        })
    }

    /// Decodes a payload body according to its wire tag.
    pub fn from_bytes(tag: u32, bytes: Vec<u8>) -> Result<Self> {
        Ok(match PayloadTag::try_from(tag)? {
            PayloadTag::Raw => Self::Raw(bytes),
            PayloadTag::VerifyProtocolVersion => {
                Self::VerifyProtocolVersion(serde_json::from_slice(&bytes)?)
            }
            PayloadTag::StartPlugin => Self::StartPlugin(serde_json::from_slice(&bytes)?),
            PayloadTag::LoadPlugin => Self::LoadPlugin(serde_json::from_slice(&bytes)?),
            PayloadTag::PluginFinished => Self::PluginFinished(serde_json::from_slice(&bytes)?),
            PayloadTag::Succeeded => Self::Succeeded(serde_json::from_slice(&bytes)?),
            PayloadTag::Failed => Self::Failed(serde_json::from_slice(&bytes)?),
            PayloadTag::ProtocolError => Self::ProtocolError(serde_json::from_slice(&bytes)?),
        })
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) => write!(f, "Raw({} bytes)", bytes.len()),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

macro_rules! payload_from {
    ($($ty:ident),* $(,)?) => {$(
        impl From<$ty> for Payload {
            fn from(msg: $ty) -> Self {
                Self::$ty(msg)
            }
        }
    )*};
}

payload_from!(
    VerifyProtocolVersion,
    StartPlugin,
    LoadPlugin,
    PluginFinished,
    Succeeded,
    Failed,
    ProtocolError,
);

/// A decoded frame: flags, request id and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Request/response/completion bits.
    pub flags: Flags,
    /// Exchange or stream this frame belongs to.
    pub request_id: i32,
    /// Typed payload.
    pub payload: Payload,
}

impl Message {
    /// Whether the message is a request.
    pub const fn is_request(&self) -> bool {
        self.flags.is_request()
    }

    /// Whether the message is a response.
    pub const fn is_response(&self) -> bool {
        self.flags.is_response()
    }

    /// Whether no further frames follow on this request id.
    pub const fn is_complete(&self) -> bool {
        self.flags.is_complete()
    }

    /// Encodes the message into a frame.
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame {
            flags: self.flags,
            request_id: self.request_id,
            tag: self.payload.tag() as u32,
            payload: self.payload.to_bytes()?,
        })
    }

    /// Decodes a frame's payload by its tag.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        Ok(Self {
            flags: frame.flags,
            request_id: frame.request_id,
            payload: Payload::from_bytes(frame.tag, frame.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        let cases: Vec<(Payload, u32)> = vec![
            (Payload::Raw(vec![1]), 1),
            (
                VerifyProtocolVersion {
                    protocol_version: PROTOCOL_VERSION,
                    version_name: "1.0".into(),
                }
                .into(),
                2,
            ),
            (
                LoadPlugin {
                    plugin_name: Some("p".into()),
                    plugin_sha: "ab".into(),
                }
                .into(),
                4,
            ),
            (PluginFinished { exit_code: 0 }.into(), 5),
            (Succeeded { message: "ok".into() }.into(), 6),
            (Failed::new(FailureCode::PluginMissing, "gone").into(), 7),
            (ProtocolError { message: "bad".into() }.into(), 8),
        ];
        for (payload, tag) in cases {
            assert_eq!(payload.tag() as u32, tag);
            let decoded = Payload::from_bytes(tag, payload.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn start_plugin_uses_wire_field_names() {
        let msg = StartPlugin {
            plugin_name: Some("stoic-status".into()),
            plugin_sha: None,
            plugin_args: vec!["-v".into()],
            min_log_level: LogLevel::Info,
            env: BTreeMap::from([("K".into(), "V".into())]),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&Payload::from(msg).to_bytes().unwrap()).unwrap();
        assert_eq!(json["pluginName"], "stoic-status");
        assert_eq!(json["pluginSha"], serde_json::Value::Null);
        assert_eq!(json["pluginArgs"][0], "-v");
        assert_eq!(json["minLogLevel"], "INFO");
        assert_eq!(json["env"]["K"], "V");
    }

    #[test]
    fn decodes_handshake_from_peer_json() {
        let bytes = br#"{"protocolVersion":5,"stoicVersionName":"0.7.0"}"#.to_vec();
        let payload = Payload::from_bytes(2, bytes).unwrap();
        assert_eq!(
            payload,
            Payload::VerifyProtocolVersion(VerifyProtocolVersion {
                protocol_version: 5,
                version_name: "0.7.0".into(),
            })
        );
    }

    #[test]
    fn raw_payload_is_verbatim() {
        let payload = Payload::Raw(b"{not json".to_vec());
        assert_eq!(payload.to_bytes().unwrap(), b"{not json");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            Payload::from_bytes(42, Vec::new()),
            Err(ProtoError::UnknownPayloadTag(42))
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            Payload::from_bytes(6, b"{".to_vec()),
            Err(ProtoError::Json(_))
        ));
    }

    #[test]
    fn unknown_failure_code_is_unspecified() {
        let failed = Failed {
            failure_code: 99,
            message: String::new(),
        };
        assert_eq!(failed.code(), FailureCode::Unspecified);
        assert_eq!(
            Failed::new(FailureCode::PluginMissing, "").code(),
            FailureCode::PluginMissing
        );
    }

    #[test]
    fn log_levels_order() {
        assert!(LogLevel::Error.meets(LogLevel::Debug));
        assert!(!LogLevel::Verbose.meets(LogLevel::Info));
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("ASSERT".parse::<LogLevel>().unwrap(), LogLevel::Assert);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Info.to_string(), "INFO");
    }
}
