//! Wire protocol for driving stoic plugins over a byte stream.
//!
//! Frames carry a big-endian header (`size`, `flags`, `request id`,
//! `payload tag`) and a payload that is either JSON or raw bytes. Requests,
//! responses and one-way messages are multiplexed over one connection, with
//! ids `0`/`1`/`2` reserved for the plugin's standard streams.

mod codec;
mod error;
mod message;
mod mux;
mod stream;

pub use codec::{Flags, Frame, HEADER_LEN, MAX_FRAME, decode, encode};
pub use error::{ProtoError, Result};
pub use message::{
    FIRST_ALLOCATED_ID, Failed, FailureCode, LoadPlugin, LogLevel, Message, PROTOCOL_VERSION,
    Payload, PayloadTag, PluginFinished, ProtocolError, STDERR, STDIN, STDOUT, StartPlugin,
    Succeeded, VerifyProtocolVersion,
};
pub use mux::{MessageReader, MessageWriter};
pub use stream::{InboundStream, OutboundStream, PipeReader, PipeWriter, pipe};
