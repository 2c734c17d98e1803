//! Message multiplexer: a shared writer and a peekable reader.
//!
//! Request ids correlate frames of one logical exchange. Ids `0`, `1` and
//! `2` are the standard streams and are opened explicitly; every other id is
//! allocated monotonically from `3` by whichever side starts the exchange.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::codec::{self, Flags};
use crate::error::Result;
use crate::message::{FIRST_ALLOCATED_ID, Message, Payload, STDERR, STDIN, STDOUT};

/// Writing half of a connection.
///
/// All methods take `&self`; frames are serialized through an internal lock
/// so stream relays and responses can share one writer from many threads
/// (wrap it in an `Arc`).
#[derive(Debug)]
pub struct MessageWriter<W> {
    /// The underlying stream; holding the lock means owning the wire.
    inner: Mutex<W>,
    /// Next id handed out by [`MessageWriter::allocate_request_id`].
    next_id: AtomicI32,
    /// Ids with frames written but no completion yet.
    open: Mutex<BTreeSet<i32>>,
}

impl<W: Write> MessageWriter<W> {
    /// Wraps a byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
            next_id: AtomicI32::new(FIRST_ALLOCATED_ID),
            open: Mutex::new(BTreeSet::new()),
        }
    }

    /// Unwraps the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh request id. Never returns a reserved stream id.
    pub fn allocate_request_id(&self) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open_ids().insert(id);
        id
    }

    /// Marks stdin as open; done by the side that pushes plugin input.
    pub fn open_stdin_for_writing(&self) {
        self.open_ids().insert(STDIN);
    }

    /// Marks stdout as open; done by the side running the plugin.
    pub fn open_stdout_for_writing(&self) {
        self.open_ids().insert(STDOUT);
    }

    /// Marks stderr as open; done by the side running the plugin.
    pub fn open_stderr_for_writing(&self) {
        self.open_ids().insert(STDERR);
    }

    /// Returns `true` if `request_id` is open and not yet completed.
    pub fn is_open(&self, request_id: i32) -> bool {
        self.open_ids().contains(&request_id)
    }

    /// Writes a request frame and returns its id.
    ///
    /// `None` allocates a new id. Pass `complete = false` when more frames
    /// for the same request follow.
    pub fn write_request(
        &self,
        payload: impl Into<Payload>,
        request_id: Option<i32>,
        complete: bool,
    ) -> Result<i32> {
        let id = request_id.unwrap_or_else(|| self.allocate_request_id());
        self.write_frame(Flags::REQUEST | Flags::completion(complete), id, payload.into())?;
        Ok(id)
    }

    /// Writes a response to the earlier request `request_id`.
    pub fn write_response(
        &self,
        request_id: i32,
        payload: impl Into<Payload>,
        complete: bool,
    ) -> Result<()> {
        self.write_frame(
            Flags::RESPONSE | Flags::completion(complete),
            request_id,
            payload.into(),
        )
    }

    /// Writes a one-way frame (neither request nor response) and returns its id.
    pub fn write_one_way(
        &self,
        payload: impl Into<Payload>,
        request_id: Option<i32>,
        complete: bool,
    ) -> Result<i32> {
        let id = request_id.unwrap_or_else(|| self.allocate_request_id());
        self.write_frame(Flags::completion(complete), id, payload.into())?;
        Ok(id)
    }

    fn write_frame(&self, flags: Flags, request_id: i32, payload: Payload) -> Result<()> {
        debug!(request_id, ?flags, %payload, "writing frame");
        let message = Message {
            flags,
            request_id,
            payload,
        };
        let frame = message.to_frame()?;

        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            codec::encode(&mut *inner, &frame)?;
        }

        let mut open = self.open_ids();
        if flags.is_complete() {
            open.remove(&request_id);
        } else {
            open.insert(request_id);
        }
        Ok(())
    }

    fn open_ids(&self) -> MutexGuard<'_, BTreeSet<i32>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reading half of a connection with a one-message lookahead.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    /// Message decoded by [`MessageReader::peek_next`] and not yet consumed.
    next: Option<Message>,
}

impl<R: Read> MessageReader<R> {
    /// Wraps a byte source.
    pub const fn new(inner: R) -> Self {
        Self { inner, next: None }
    }

    /// Returns the next message without consuming it.
    ///
    /// Repeated calls return the same message until
    /// [`MessageReader::consume_next`] is called.
    pub fn peek_next(&mut self) -> Result<&Message> {
        let message = match self.next.take() {
            Some(message) => message,
            None => self.read_next()?,
        };
        Ok(self.next.insert(message))
    }

    /// Returns the next message and clears the lookahead.
    pub fn consume_next(&mut self) -> Result<Message> {
        match self.next.take() {
            Some(message) => Ok(message),
            None => self.read_next(),
        }
    }

    fn read_next(&mut self) -> Result<Message> {
        let frame = codec::decode(&mut self.inner)?;
        let message = Message::from_frame(frame)?;
        debug!(
            request_id = message.request_id,
            flags = ?message.flags,
            payload = %message.payload,
            "read frame"
        );
        Ok(message)
    }
}
