//! Transport wiring for a session.
//!
//! Two ways to feed inbound bytes to the dispatcher:
//!
//! - **Dispatcher thread** ([`connect`]): a background thread reads the
//!   backend socket, reassembles frames and dispatches them. Callers block on
//!   [`ReadTicket::wait`](crate::wait::ReadTicket::wait) or use callbacks.
//! - **Inbound pump** ([`InboundPump`]): an [`EventLoop`] over a channel of
//!   byte chunks, stepped by the caller itself. This is the single-threaded
//!   mode used with [`Session::read_blocking`].
//!
//! [`connect`] also starts an optional epoch ticker thread that sends
//! EPOCH_TIMER at a fixed interval, and turns COMMIT_ACK frames into
//! [`CommitAck`] notifications. The notification channel holds at most
//! [`COMMIT_ACK_BACKLOG`] entries; further acks are dropped until the
//! receiver catches up.
//!
//! Once the dispatcher thread exits no response can arrive, so
//! [`ClientHandle::read`] fails with [`SessionError::Disconnected`] instead
//! of waiting forever. The request itself stays pending.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, unbounded};
use tracing::{debug, error, info, warn};

use crate::buffer::SgList;
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::output::Transport;
use crate::protocol::{FrameDecoder, SECTOR_SIZE};
use crate::request::WriteRequest;
use crate::session::Session;
use crate::wait::EventLoop;

/// Capacity of the [`CommitAck`] channel returned by [`connect`].
pub const COMMIT_ACK_BACKLOG: usize = 64;

/// How often blocked callers re-check that the dispatcher is still running.
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Notification that the backend made an epoch durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitAck {
    /// Number of acknowledgments received so far, starting at 1.
    pub epoch: u64,
}

#[derive(Default)]
struct AckCounter {
    count: Mutex<u64>,
    changed: Condvar,
}

impl AckCounter {
    fn bump(&self) -> u64 {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.changed.notify_all();
        *count
    }

    fn current(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the count exceeds `seen`; `None` on timeout.
    fn wait_past(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .changed
            .wait_timeout_while(count, timeout, |count| *count <= seen)
            .unwrap_or_else(PoisonError::into_inner);
        (*count > seen).then_some(*count)
    }
}

/// Handle to a session connected to a backend over TCP.
pub struct ClientHandle {
    session: Arc<Session<TcpStream>>,
    stream: TcpStream,
    acks: Arc<AckCounter>,
    connected: Arc<AtomicBool>,
    drain_timeout: Duration,
    shutdown_tx: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

/// Connects to the backend and starts the dispatcher thread.
///
/// Returns the handle plus a receiver that gets one [`CommitAck`] per
/// COMMIT_ACK frame.
pub fn connect(config: ClientConfig) -> Result<(ClientHandle, Receiver<CommitAck>)> {
    let stream = TcpStream::connect(&config.server)
        .with_context(|| format!("failed to connect to {}", config.server))?;
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
    let reader = stream.try_clone().context("failed to clone socket for reading")?;
    let control = stream.try_clone().context("failed to clone socket for shutdown")?;

    let session = Arc::new(Session::new(stream, config.session.clone()));
    let acks = Arc::new(AckCounter::default());
    let (ack_tx, ack_rx) = bounded(COMMIT_ACK_BACKLOG);
    {
        let acks = Arc::clone(&acks);
        session.set_commit_ack_handler(move || {
            let epoch = acks.bump();
            if let Err(TrySendError::Full(_)) = ack_tx.try_send(CommitAck { epoch }) {
                debug!(epoch, "commit ack receiver is full, dropping notification");
            }
        });
    }

    let connected = Arc::new(AtomicBool::new(true));
    let dispatcher = spawn_dispatcher(
        Arc::clone(&session),
        Arc::clone(&connected),
        reader,
        config.read_chunk,
        config.session.max_payload,
    )?;

    let (shutdown_tx, shutdown_rx) = unbounded();
    let ticker = match config.epoch_interval() {
        Some(interval) => Some(spawn_epoch_ticker(Arc::clone(&session), interval, shutdown_rx)?),
        None => None,
    };

    info!(server = %config.server, "connected to block backend");
    Ok((
        ClientHandle {
            session,
            stream: control,
            acks,
            connected,
            drain_timeout: config.drain_timeout(),
            shutdown_tx: Some(shutdown_tx),
            dispatcher: Some(dispatcher),
            ticker,
        },
        ack_rx,
    ))
}

impl ClientHandle {
    pub fn session(&self) -> &Arc<Session<TcpStream>> {
        &self.session
    }

    /// Whether the dispatcher thread is still reading responses.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Reads `nb_sectors` starting at `sector`, blocking until the response
    /// is dispatched or the connection is lost.
    pub fn read(&self, sector: i64, nb_sectors: i32) -> Result<Vec<u8>> {
        let len = usize::try_from(nb_sectors).unwrap_or(0) * SECTOR_SIZE;
        let ticket = self
            .session
            .submit_read_waiting(sector, nb_sectors, SgList::zeroed(len))?;
        loop {
            let connected = self.is_connected();
            let wait = if connected {
                LIVENESS_POLL
            } else {
                Duration::ZERO
            };
            if let Some(buffer) = ticket.wait_timeout(wait)? {
                return Ok(buffer.to_vec());
            }
            if !connected {
                warn!(id = ticket.id(), sector, "connection lost before read completed");
                return Err(SessionError::Disconnected.into());
            }
        }
    }

    /// Waits up to `timeout` for every in-flight response. Returns whether
    /// the pending table drained. Gives up early once the dispatcher exits.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.is_connected() {
                return self.session.pending_count() == 0;
            }
            if self.session.wait_idle(remaining.min(LIVENESS_POLL)) {
                return true;
            }
        }
    }

    /// Writes `data` at `sector`. Returns once the frame is on the wire.
    pub fn write(&self, sector: i64, data: Vec<u8>) -> Result<()> {
        // The same status is returned by submit_multiwrite.
        let request = WriteRequest::new(sector, SgList::from_vec(data), |_| {});
        self.session.submit_multiwrite(vec![request])?;
        Ok(())
    }

    /// Sends COMMIT and waits for the backend's acknowledgment.
    pub fn commit(&self, timeout: Duration) -> Result<CommitAck> {
        let seen = self.acks.current();
        self.session.epoch_commit()?;
        let epoch = self
            .acks
            .wait_past(seen, timeout)
            .ok_or_else(|| anyhow!("no commit acknowledgment within {timeout:?}"))?;
        Ok(CommitAck { epoch })
    }

    pub fn tick(&self) -> Result<()> {
        Ok(self.session.epoch_timer()?)
    }

    pub fn notify_ft(&self) -> Result<()> {
        Ok(self.session.notify_ft()?)
    }

    /// Waits for in-flight responses, stops the background threads and
    /// checks that nothing is left pending.
    pub fn shutdown(mut self) -> Result<()> {
        if !self.drain(self.drain_timeout) {
            warn!(
                pending = ?self.session.pending_ids(),
                "responses still outstanding at shutdown"
            );
        }
        self.stop();
        if let Some(ticker) = self.ticker.take() {
            ticker
                .join()
                .map_err(|_| anyhow!("epoch ticker thread panicked"))?;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher
                .join()
                .map_err(|_| anyhow!("dispatcher thread panicked"))?;
        }
        self.session.close()?;
        info!("session closed");
        Ok(())
    }

    fn stop(&mut self) {
        self.shutdown_tx.take();
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                warn!(error = %err, "failed to shut down backend socket");
            }
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.stop();
        }
    }
}

/// Reads `reader` until end of stream, dispatching every complete frame.
pub fn run_dispatcher<T: Transport, R: Read>(
    session: &Session<T>,
    reader: &mut R,
    read_chunk: usize,
    max_payload: usize,
) -> Result<(), SessionError> {
    let mut decoder = FrameDecoder::new(max_payload);
    let mut buf = vec![0u8; read_chunk.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        decoder.extend(&buf[..n]);
        dispatch_buffered(session, &mut decoder)?;
    }
}

fn dispatch_buffered<T: Transport>(
    session: &Session<T>,
    decoder: &mut FrameDecoder,
) -> Result<(), SessionError> {
    while let Some(frame) = decoder.next_frame()? {
        // Dropped frames are logged by the dispatcher.
        let _ = session.dispatch(frame);
    }
    Ok(())
}

fn spawn_dispatcher<T, R>(
    session: Arc<Session<T>>,
    connected: Arc<AtomicBool>,
    mut reader: R,
    read_chunk: usize,
    max_payload: usize,
) -> Result<JoinHandle<()>>
where
    T: Transport + 'static,
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("blk-dispatch".to_string())
        .spawn(move || {
            match run_dispatcher(&session, &mut reader, read_chunk, max_payload) {
                Ok(()) => info!("backend closed the connection"),
                Err(err) => error!(error = %err, "dispatcher stopped"),
            }
            connected.store(false, Ordering::SeqCst);
        })
        .context("failed to spawn dispatcher thread")
}

/// Sends EPOCH_TIMER every `interval` until `shutdown` fires or disconnects.
fn spawn_epoch_ticker<T: Transport + 'static>(
    session: Arc<Session<T>>,
    interval: Duration,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("blk-epoch-timer".to_string())
        .spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                let timeout = interval
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::ZERO);

                crossbeam_channel::select! {
                    recv(shutdown) -> _ => break,
                    default(timeout) => {}
                }

                if last_tick.elapsed() >= interval {
                    // Failures are logged by the session; a dead transport
                    // ends the ticker.
                    if session.epoch_timer().is_err() {
                        break;
                    }
                    last_tick = Instant::now();
                }
            }
        })
        .context("failed to spawn epoch ticker")
}

/// Event loop over a channel of inbound byte chunks.
pub struct InboundPump<T: Transport> {
    session: Arc<Session<T>>,
    inbound: Receiver<Vec<u8>>,
    decoder: FrameDecoder,
}

impl<T: Transport> InboundPump<T> {
    pub fn new(session: Arc<Session<T>>, inbound: Receiver<Vec<u8>>) -> Self {
        let decoder = FrameDecoder::new(session.config().max_payload);
        Self {
            session,
            inbound,
            decoder,
        }
    }
}

impl<T: Transport> EventLoop for InboundPump<T> {
    fn poll_once(&mut self, blocking: bool) -> Result<bool, SessionError> {
        let chunk = if blocking {
            match self.inbound.recv() {
                Ok(chunk) => chunk,
                Err(_) => return Ok(false),
            }
        } else {
            match self.inbound.try_recv() {
                Ok(chunk) => chunk,
                Err(TryRecvError::Empty) => return Ok(true),
                Err(TryRecvError::Disconnected) => return Ok(false),
            }
        };
        self.decoder.extend(&chunk);
        dispatch_buffered(&self.session, &mut self.decoder)?;
        Ok(true)
    }
}
