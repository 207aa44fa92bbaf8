//! In-flight request descriptors.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::SgList;
use crate::error::CompletionResult;
use crate::protocol::{CommandCode, SECTOR_SIZE};
use crate::wait::Rendezvous;

/// Wire identifier correlating a request with its response.
pub type RequestId = i32;

/// Completion callback. Runs exactly once, never under the session lock.
pub type Completion = Box<dyn FnOnce(CompletionResult) + Send + 'static>;

/// One element of a batched write.
pub struct WriteRequest {
    pub sector: i64,
    pub buffer: SgList,
    pub completion: Completion,
}

impl WriteRequest {
    pub fn new<F>(sector: i64, buffer: SgList, completion: F) -> Self
    where
        F: FnOnce(CompletionResult) + Send + 'static,
    {
        Self {
            sector,
            buffer,
            completion: Box::new(completion),
        }
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("sector", &self.sector)
            .field("len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// How a read reports back once its response is dispatched.
pub(crate) enum ReadCompletion {
    /// Asynchronous caller: the dispatcher runs the callback.
    Callback(Completion),
    /// Synchronous caller: the dispatcher resolves the rendezvous and the
    /// waiting caller picks up the result.
    Waiter(Arc<Rendezvous>),
}

/// Sector range covered by one sub-request of a batched write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub sector: i64,
    pub nb_sectors: i32,
}

pub(crate) enum RequestKind {
    Read {
        sector: i64,
        nb_sectors: i32,
        buffer: SgList,
        completion: ReadCompletion,
    },
    /// Completions already ran at submission; only the extents remain for
    /// diagnostics.
    Write { extents: Vec<Extent> },
}

pub(crate) struct RequestDescriptor {
    pub(crate) id: RequestId,
    pub(crate) kind: RequestKind,
    pub(crate) submitted_at: Instant,
}

impl RequestDescriptor {
    pub(crate) fn new(id: RequestId, kind: RequestKind) -> Self {
        Self {
            id,
            kind,
            submitted_at: Instant::now(),
        }
    }

    pub(crate) fn command(&self) -> CommandCode {
        match self.kind {
            RequestKind::Read { .. } => CommandCode::Read,
            RequestKind::Write { .. } => CommandCode::Write,
        }
    }
}

/// Number of whole sectors in `len` bytes, if `len` is a positive multiple of
/// the sector size that fits the wire field.
pub(crate) fn whole_sectors(len: usize) -> Option<i32> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return None;
    }
    i32::try_from(len / SECTOR_SIZE).ok()
}
