//! Response dispatcher.
//!
//! Handles one inbound frame at a time:
//!
//! 1. COMMIT_ACK runs the registered commit handler. It carries no request
//!    id and never touches the pending table.
//! 2. Anything else is matched by id. Lookup and removal happen in one step
//!    under the session lock, so a response retires its descriptor exactly
//!    once even when several threads dispatch.
//! 3. A WRITE descriptor is simply dropped: its completions already ran at
//!    submission.
//! 4. A READ descriptor has its buffer filled and its completion (callback or
//!    waiting caller) resolved. Any other response to a read fails it with
//!    [`RequestError::UnexpectedResponse`] and leaves the buffer alone.
//!
//! A frame that matches nothing is logged and dropped; the session carries
//! on.

use tracing::{debug, warn};

use crate::buffer::SgList;
use crate::config::LengthPolicy;
use crate::error::{CompletionResult, DispatchError, RequestError};
use crate::output::Transport;
use crate::protocol::{CommandCode, CommandHeader, Frame, SECTOR_SIZE};
use crate::request::{ReadCompletion, RequestKind};
use crate::session::Session;
use crate::wait::DispatchScope;

impl<T: Transport> Session<T> {
    /// Dispatches one complete frame delivered by the transport.
    pub fn on_frame_received(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        let frame = Frame::decode(bytes).inspect_err(|err| {
            warn!(error = %err, "dropping undecodable frame");
        })?;
        self.dispatch(frame)
    }

    pub fn dispatch(&self, frame: Frame) -> Result<(), DispatchError> {
        let _scope = DispatchScope::enter();
        let header = frame.header;
        debug!(
            command = header.command,
            id = header.id,
            payload_len = header.payload_len,
            "received frame"
        );

        let command = header.code().inspect_err(|err| {
            warn!(id = header.id, error = %err, "dropping frame");
        })?;

        if command == CommandCode::CommitAck {
            self.acknowledge_commit();
            return Ok(());
        }

        let Some(descriptor) = self.retire(header.id) else {
            warn!(id = header.id, ?command, "no pending request for response, dropping frame");
            return Err(DispatchError::UnknownRequest(header.id));
        };

        if descriptor.command() != command {
            warn!(
                id = header.id,
                expected = ?descriptor.command(),
                got = ?command,
                "response command does not match request"
            );
        }

        let elapsed = descriptor.submitted_at.elapsed();
        match descriptor.kind {
            RequestKind::Write { extents } => {
                debug!(
                    id = descriptor.id,
                    sub_requests = extents.len(),
                    ?elapsed,
                    "write acknowledged"
                );
            }
            RequestKind::Read {
                sector,
                nb_sectors,
                buffer,
                completion,
            } => {
                let result = if command == CommandCode::Read {
                    self.fill_read(&header, &frame.payload, nb_sectors, &buffer)
                } else {
                    Err(RequestError::UnexpectedResponse { command })
                };
                debug!(
                    id = descriptor.id,
                    sector,
                    nb_sectors,
                    ?elapsed,
                    ok = result.is_ok(),
                    "read completed"
                );
                match completion {
                    ReadCompletion::Callback(callback) => callback(result),
                    ReadCompletion::Waiter(rendezvous) => rendezvous.resolve(result),
                }
            }
        }
        Ok(())
    }

    fn acknowledge_commit(&self) {
        let handler = {
            let mut shared = self.lock();
            shared.stats.commit_acks += 1;
            shared.commit_ack.clone()
        };
        match handler {
            Some(handler) => handler(),
            None => debug!("commit acknowledged with no handler registered"),
        }
    }

    /// Validates a READ response and copies its payload into the caller's
    /// buffer.
    fn fill_read(
        &self,
        header: &CommandHeader,
        payload: &[u8],
        nb_sectors: i32,
        buffer: &SgList,
    ) -> CompletionResult {
        if header.payload_len < 0 {
            return Err(RequestError::Remote {
                code: header.payload_len,
            });
        }

        let expected = usize::try_from(nb_sectors).unwrap_or(0) * SECTOR_SIZE;
        let actual = payload.len();
        if actual != expected {
            warn!(id = header.id, expected, actual, "read response length mismatch");
            if self.config().length_policy == LengthPolicy::Strict {
                return Err(RequestError::LengthMismatch { expected, actual });
            }
        }

        buffer.scatter(payload);
        Ok(())
    }
}
