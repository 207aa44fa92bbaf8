//! Client side of a block replication protocol.
//!
//! A virtual block device forwards reads, writes and epoch checkpoints to a
//! remote backend over a byte stream and carries on without waiting. This
//! crate correlates outstanding requests with their responses and runs the
//! right completion for each one.
//!
//! # Completion model
//!
//! - **Reads** complete when their response arrives: through a callback, a
//!   blocking [`wait::ReadTicket`], or [`session::Session::read_async`].
//! - **Writes** complete optimistically, as soon as the frame is flushed.
//!   Their acknowledgment only retires the request.
//! - **Durability** is per epoch: [`session::Session::epoch_commit`] is
//!   answered by a COMMIT_ACK frame, delivered to a session-wide handler.
//!
//! # Modules
//!
//! - [`protocol`]: frame layout, codec and stream reassembly
//! - [`output`]: outbound scratch buffer and transports
//! - [`buffer`]: scatter-gather buffers shared with the caller
//! - [`request`]: request descriptors and write batch entries
//! - [`session`]: submission, control commands, teardown
//! - [`dispatch`]: matching responses to pending requests
//! - [`wait`]: synchronous waits and the event loop seam
//! - [`runtime`]: TCP connection, dispatcher and epoch ticker threads
//! - [`config`]: session and client settings
//! - [`error`]: error and status types

pub mod buffer;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod output;
pub mod protocol;
pub mod request;
pub mod runtime;
pub mod session;
mod table;
pub mod wait;
