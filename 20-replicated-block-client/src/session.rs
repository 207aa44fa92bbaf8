//! Client session: request submission and control commands.
//!
//! A [`Session`] is created when the virtual device attaches and lives until
//! it detaches. One mutex guards everything that submitters and the
//! dispatcher share:
//!
//! - the identifier counter,
//! - the [`PendingTable`],
//! - the outbound scratch buffer and transport,
//! - the registered commit-acknowledgment handler and statistics.
//!
//! A submitter holds the lock from allocating an id until its frame is
//! flushed, so frames never interleave and an id is never handed out while a
//! descriptor with that id is still pending. Completions always run after the
//! lock is released.
//!
//! # Write durability
//!
//! Batched writes complete optimistically: every sub-request's completion
//! runs with success as soon as the frame is flushed, before the backend has
//! acknowledged anything. The later WRITE response only retires the
//! descriptor. Durability is signalled separately, per epoch: the caller
//! sends [`Session::epoch_commit`] and the backend answers with COMMIT_ACK,
//! which runs the handler registered with [`Session::set_commit_ack_handler`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::buffer::SgList;
use crate::config::SessionConfig;
use crate::error::{CompletionResult, RequestError, SessionError};
use crate::output::{OutputChannel, Transport};
use crate::protocol::{CONTROL_BLOCK_LEN, CommandCode, CommandHeader, ControlBlock, SECTOR_SIZE};
use crate::request::{
    Completion, Extent, ReadCompletion, RequestDescriptor, RequestId, RequestKind, WriteRequest,
    whole_sectors,
};
use crate::table::PendingTable;
use crate::wait::{EventLoop, ReadTicket, Rendezvous};

/// Process-wide callback for COMMIT_ACK frames.
pub type CommitAckHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Counters kept by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub reads: u64,
    pub write_batches: u64,
    pub write_sub_requests: u64,
    pub commits: u64,
    pub commit_acks: u64,
    pub epoch_ticks: u64,
    pub ft_notifications: u64,
    /// Responses dropped because no pending request matched their id.
    pub unknown_responses: u64,
}

pub(crate) struct Shared<T> {
    next_id: RequestId,
    pub(crate) table: PendingTable,
    output: OutputChannel<T>,
    pub(crate) commit_ack: Option<CommitAckHandler>,
    pub(crate) stats: SessionStats,
}

impl<T: Transport> Shared<T> {
    /// Next identifier, shared by reads and batched writes.
    ///
    /// Wraps from `i32::MAX` to 1 and skips 0 (used by control commands) and
    /// any id that is still pending.
    fn allocate_id(&mut self) -> RequestId {
        loop {
            self.next_id = if self.next_id == RequestId::MAX {
                1
            } else {
                self.next_id + 1
            };
            if self.next_id != 0 && !self.table.contains(self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Builds one frame in the scratch buffer and flushes it.
    fn transmit<F>(&mut self, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut OutputChannel<T>) -> Result<(), SessionError>,
    {
        if let Err(err) = build(&mut self.output) {
            self.output.discard();
            return Err(err);
        }
        self.output.flush()?;
        Ok(())
    }

    fn insert(&mut self, descriptor: RequestDescriptor) -> Result<(), SessionError> {
        self.table
            .insert(descriptor)
            .map_err(|rejected| SessionError::DuplicateId(rejected.id))
    }
}

pub struct Session<T: Transport> {
    shared: Mutex<Shared<T>>,
    /// Signalled whenever a descriptor leaves the pending table.
    retired: Condvar,
    config: SessionConfig,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            shared: Mutex::new(Shared {
                next_id: config.initial_id,
                table: PendingTable::new(),
                output: OutputChannel::new(transport),
                commit_ack: None,
                stats: SessionStats::default(),
            }),
            retired: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the descriptor for `id`, counting a miss as an unknown
    /// response.
    pub(crate) fn retire(&self, id: RequestId) -> Option<RequestDescriptor> {
        let mut shared = self.lock();
        let found = shared.table.take(id);
        match found {
            Some(_) => self.retired.notify_all(),
            None => shared.stats.unknown_responses += 1,
        }
        found
    }

    /// Registers the handler run for every COMMIT_ACK frame, replacing any
    /// previous one.
    pub fn set_commit_ack_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().commit_ack = Some(Arc::new(handler));
    }

    /// Submits an asynchronous read of `nb_sectors` starting at `sector`.
    ///
    /// The dispatcher copies the response into `buffer` and then runs
    /// `completion`. An error return means nothing was sent and `completion`
    /// will never run.
    pub fn submit_read<F>(
        &self,
        sector: i64,
        nb_sectors: i32,
        buffer: SgList,
        completion: F,
    ) -> Result<RequestId, SessionError>
    where
        F: FnOnce(CompletionResult) + Send + 'static,
    {
        let completion: Completion = Box::new(completion);
        self.submit_read_with(sector, nb_sectors, buffer, ReadCompletion::Callback(completion))
    }

    /// Submits a read whose result is collected through the returned ticket.
    pub fn submit_read_waiting(
        &self,
        sector: i64,
        nb_sectors: i32,
        buffer: SgList,
    ) -> Result<ReadTicket, SessionError> {
        let rendezvous = Arc::new(Rendezvous::new());
        let id = self.submit_read_with(
            sector,
            nb_sectors,
            buffer.clone(),
            ReadCompletion::Waiter(Arc::clone(&rendezvous)),
        )?;
        Ok(ReadTicket::new(id, buffer, rendezvous))
    }

    fn submit_read_with(
        &self,
        sector: i64,
        nb_sectors: i32,
        buffer: SgList,
        completion: ReadCompletion,
    ) -> Result<RequestId, SessionError> {
        let needed = sector_bytes(nb_sectors)?;
        let len = buffer.len();
        if len < needed {
            return Err(SessionError::BufferTooSmall { len, needed });
        }

        let control = ControlBlock::new(sector, nb_sectors);
        let mut shared = self.lock();
        let id = shared.allocate_id();
        shared.insert(RequestDescriptor::new(
            id,
            RequestKind::Read {
                sector,
                nb_sectors,
                buffer,
                completion,
            },
        ))?;

        let header = CommandHeader::new(CommandCode::Read, id, CONTROL_BLOCK_LEN as i32, 1);
        if let Err(err) = shared.transmit(|out| {
            out.append_encoded(&header)?;
            out.append_encoded(&control)
        }) {
            shared.table.take(id);
            self.retired.notify_all();
            warn!(id, sector, nb_sectors, error = %err, "failed to send read");
            return Err(err);
        }
        shared.stats.reads += 1;
        drop(shared);

        debug!(id, sector, nb_sectors, "sent read");
        Ok(id)
    }

    /// Reads synchronously, spinning `event_loop` until the response arrives.
    pub fn read_blocking<E: EventLoop>(
        &self,
        sector: i64,
        nb_sectors: i32,
        event_loop: &mut E,
    ) -> Result<Vec<u8>, SessionError> {
        let buffer = SgList::zeroed(sector_bytes(nb_sectors)?);
        let ticket = self.submit_read_waiting(sector, nb_sectors, buffer)?;
        Ok(ticket.wait_polling(event_loop)?.to_vec())
    }

    /// Reads through a oneshot channel resolved by the dispatcher.
    pub async fn read_async(&self, sector: i64, nb_sectors: i32) -> Result<Vec<u8>, SessionError> {
        let buffer = SgList::zeroed(sector_bytes(nb_sectors)?);
        let (tx, rx) = oneshot::channel();
        self.submit_read(sector, nb_sectors, buffer.clone(), move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| SessionError::Disconnected)??;
        Ok(buffer.to_vec())
    }

    /// Sends a batch of writes as one WRITE frame under a single id.
    ///
    /// Every completion in the batch runs before this returns: with success
    /// once the frame is flushed, or with the failure otherwise. The backend's
    /// WRITE response later retires the descriptor without running them again.
    pub fn submit_multiwrite(&self, batch: Vec<WriteRequest>) -> Result<RequestId, SessionError> {
        let outcome = self.send_write_batch(&batch);
        let status = match &outcome {
            Ok(_) => Ok(()),
            Err(err) => Err(RequestError::from(err)),
        };
        for request in batch {
            (request.completion)(status.clone());
        }
        outcome
    }

    fn send_write_batch(&self, batch: &[WriteRequest]) -> Result<RequestId, SessionError> {
        if batch.is_empty() {
            return Err(SessionError::EmptyBatch);
        }

        let mut extents = Vec::with_capacity(batch.len());
        let mut payload_len = 0usize;
        for request in batch {
            let len = request.buffer.len();
            let nb_sectors = whole_sectors(len).ok_or(SessionError::UnalignedWrite { len })?;
            extents.push(Extent {
                sector: request.sector,
                nb_sectors,
            });
            payload_len += CONTROL_BLOCK_LEN + len;
        }
        let wire_len =
            i32::try_from(payload_len).map_err(|_| SessionError::PayloadTooLarge(payload_len))?;
        let num_reqs =
            u32::try_from(batch.len()).map_err(|_| SessionError::PayloadTooLarge(payload_len))?;

        let mut shared = self.lock();
        let id = shared.allocate_id();
        shared.insert(RequestDescriptor::new(
            id,
            RequestKind::Write {
                extents: extents.clone(),
            },
        ))?;

        let header = CommandHeader::new(CommandCode::Write, id, wire_len, num_reqs);
        if let Err(err) = shared.transmit(|out| {
            out.append_encoded(&header)?;
            for (request, extent) in batch.iter().zip(&extents) {
                out.append_encoded(&ControlBlock::new(extent.sector, extent.nb_sectors))?;
                out.append_sg(&request.buffer);
            }
            Ok(())
        }) {
            shared.table.take(id);
            self.retired.notify_all();
            warn!(id, sub_requests = batch.len(), error = %err, "failed to send write batch");
            return Err(err);
        }
        shared.stats.write_batches += 1;
        shared.stats.write_sub_requests += extents.len() as u64;
        drop(shared);

        for extent in &extents {
            debug!(id, sector = extent.sector, nb_sectors = extent.nb_sectors, "sent write");
        }
        Ok(id)
    }

    /// Periodic epoch tick.
    pub fn epoch_timer(&self) -> Result<(), SessionError> {
        self.send_control(CommandCode::EpochTimer)
    }

    /// Asks the backend to commit the current epoch. Answered by COMMIT_ACK.
    pub fn epoch_commit(&self) -> Result<(), SessionError> {
        self.send_control(CommandCode::Commit)
    }

    /// Fault-tolerance notification.
    pub fn notify_ft(&self) -> Result<(), SessionError> {
        self.send_control(CommandCode::FtNotify)
    }

    fn send_control(&self, command: CommandCode) -> Result<(), SessionError> {
        let mut shared = self.lock();
        let result = shared.transmit(|out| out.append_encoded(&CommandHeader::control(command)));
        match &result {
            Ok(()) => {
                match command {
                    CommandCode::EpochTimer => shared.stats.epoch_ticks += 1,
                    CommandCode::Commit => shared.stats.commits += 1,
                    CommandCode::FtNotify => shared.stats.ft_notifications += 1,
                    _ => {}
                }
                debug!(?command, "sent control command");
            }
            Err(err) => warn!(?command, error = %err, "failed to send control command"),
        }
        result
    }

    pub fn pending_count(&self) -> usize {
        self.lock().table.len()
    }

    /// Ids of requests still awaiting a response, in ascending order.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.lock().table.ids()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().table.contains(id)
    }

    /// Blocks until no request is pending or `timeout` elapses. Returns
    /// whether the table is empty. Nothing is cancelled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let shared = self.lock();
        let (shared, _) = self
            .retired
            .wait_timeout_while(shared, timeout, |shared| !shared.table.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        shared.table.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        self.lock().stats
    }

    /// Checks that the session can be torn down.
    ///
    /// Requests cannot be cancelled, so any request still pending here is
    /// reported as an error rather than silently dropped.
    pub fn close(&self) -> Result<(), SessionError> {
        let shared = self.lock();
        if shared.table.is_empty() {
            return Ok(());
        }
        Err(SessionError::OutstandingRequests {
            ids: shared.table.ids(),
        })
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !shared.table.is_empty() {
            error!(
                pending = ?shared.table.ids(),
                "session dropped with requests in flight"
            );
        }
    }
}

fn sector_bytes(nb_sectors: i32) -> Result<usize, SessionError> {
    match usize::try_from(nb_sectors) {
        Ok(n) if n > 0 => Ok(n * SECTOR_SIZE),
        _ => Err(SessionError::InvalidSectorCount(nb_sectors)),
    }
}
