//! Outbound side of the channel.
//!
//! Commands are built in a scratch buffer and handed to the transport in one
//! piece on flush. The session holds its lock from the first append to the
//! flush, so frames from concurrent submitters never interleave.

use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;

use crate::buffer::SgList;
use crate::error::SessionError;

/// Byte sink for outbound frames.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl<W: Write + Send> Transport for W {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}

/// Scratch buffer plus the transport it drains into.
pub struct OutputChannel<T> {
    transport: T,
    buf: Vec<u8>,
}

impl<T: Transport> OutputChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buf: Vec::new(),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends the bincode encoding of a header or control block.
    pub fn append_encoded<S: Serialize>(&mut self, value: &S) -> Result<(), SessionError> {
        bincode::serialize_into(&mut self.buf, value)?;
        Ok(())
    }

    /// Appends the contents of a caller buffer.
    pub fn append_sg(&mut self, list: &SgList) {
        list.gather_into(&mut self.buf);
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drops anything appended since the last flush.
    pub fn discard(&mut self) {
        self.buf.clear();
    }

    /// Sends the buffered bytes and flushes the transport.
    ///
    /// The scratch buffer is cleared even when sending fails, so a partial
    /// frame is never prepended to the next command.
    pub fn flush(&mut self) -> io::Result<()> {
        let result = self
            .transport
            .send(&self.buf)
            .and_then(|()| self.transport.flush());
        self.buf.clear();
        result
    }
}

/// In-process transport delivering each flushed frame over a channel.
///
/// Useful for tests and for backends living in the same process.
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelTransport {
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            pending: Vec::new(),
        }
    }

    /// Creates a transport together with the receiving end.
    pub fn pair() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }
}

impl Write for ChannelTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.pending);
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))
    }
}
