//! Byte-stream adapters over one-way stream frames.
//!
//! Outbound, every write becomes one incomplete one-way frame on the
//! stream's id and closing sends an empty frame marked complete. Inbound,
//! the frames of one stream id are read back as bytes until the complete
//! frame arrives.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::debug;

use crate::message::{Message, Payload};
use crate::mux::{MessageReader, MessageWriter};

/// A [`Write`] sink that emits stream frames on a shared writer.
///
/// Dropping the sink closes the stream.
#[derive(Debug)]
pub struct OutboundStream<W: Write> {
    writer: Arc<MessageWriter<W>>,
    stream_id: i32,
    closed: bool,
}

impl<W: Write> OutboundStream<W> {
    /// Creates a sink writing frames tagged with `stream_id`.
    pub const fn new(writer: Arc<MessageWriter<W>>, stream_id: i32) -> Self {
        Self {
            writer,
            stream_id,
            closed: false,
        }
    }

    /// Stream id this sink writes to.
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Sends the completion frame. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .write_one_way(Vec::new(), Some(self.stream_id), true)?;
        Ok(())
    }
}

impl<W: Write> Write for OutboundStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stream {} is closed", self.stream_id),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.writer
            .write_one_way(buf.to_vec(), Some(self.stream_id), false)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write> Drop for OutboundStream<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(stream_id = self.stream_id, "closing stream failed: {e}");
        }
    }
}

/// A [`Read`] source over the raw frames of one stream id.
///
/// Yields end-of-stream once a frame marked complete has been read. Any
/// other message on the connection is an error: the caller owns the reader
/// for the life of the stream.
#[derive(Debug)]
pub struct InboundStream<'a, R> {
    reader: &'a mut MessageReader<R>,
    stream_id: i32,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<'a, R: Read> InboundStream<'a, R> {
    /// Reads frames for `stream_id` from `reader`.
    pub const fn new(reader: &'a mut MessageReader<R>, stream_id: i32) -> Self {
        Self {
            reader,
            stream_id,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Whether the completion frame has been observed.
    pub const fn is_done(&self) -> bool {
        self.done
    }

    fn refill(&mut self) -> io::Result<()> {
        let Message {
            flags,
            request_id,
            payload,
        } = self.reader.consume_next()?;

        let bytes = match payload {
            Payload::Raw(bytes) if request_id == self.stream_id => bytes,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "unexpected {other} on request {request_id} while reading stream {}",
                        self.stream_id
                    ),
                ));
            }
        };
        if flags.is_complete() {
            debug!(stream_id = self.stream_id, "stream closed by peer");
            self.done = true;
        }
        self.buf = bytes;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for InboundStream<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            if self.done {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Creates an in-memory pipe that hands chunks from one thread to another.
///
/// Dropping the [`PipeWriter`] is end-of-stream for the [`PipeReader`].
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

/// Sending end of [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    /// Bytes written after the reader is gone are discarded.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() && self.tx.send(buf.to_vec()).is_err() {
            debug!("pipe reader dropped, discarding {} bytes", buf.len());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving end of [`pipe`]; blocks until data or end-of-stream.
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
