//! Synchronous waiting on reads.
//!
//! A read submitted without a completion callback gets a [`Rendezvous`]
//! instead. The dispatcher resolves it when the response arrives and the
//! caller collects the result through its [`ReadTicket`], either by blocking
//! on a condition variable (a separate thread runs the dispatcher) or by
//! spinning an [`EventLoop`] itself (single-threaded runtimes).
//!
//! Neither kind of wait may run on the dispatcher's own call stack: the
//! response it waits for could never be delivered. Waits started from inside
//! a completion fail with [`SessionError::ReentrantWait`].

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::buffer::SgList;
use crate::error::{CompletionResult, SessionError};
use crate::request::RequestId;

/// Lifecycle of a synchronous read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState {
    /// Submitted; no response and no blocked caller yet.
    Pending,
    /// A caller is blocked on the condition variable.
    AwaitingCaller,
    /// The dispatcher has delivered the result.
    Ready(CompletionResult),
    /// The caller has collected the result.
    Completed,
}

/// Meeting point between the dispatcher and a synchronous caller.
#[derive(Debug)]
pub struct Rendezvous {
    state: Mutex<WaitState>,
    ready: Condvar,
}

impl Rendezvous {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Pending),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WaitState {
        self.lock().clone()
    }

    pub(crate) fn resolve(&self, result: CompletionResult) {
        *self.lock() = WaitState::Ready(result);
        self.ready.notify_all();
    }

    /// Collects the result if the dispatcher has delivered it.
    pub fn try_take(&self) -> Option<CompletionResult> {
        take_ready(&mut self.lock())
    }

    /// Blocks until the result is delivered.
    pub fn wait(&self) -> CompletionResult {
        let mut state = self.lock();
        loop {
            if let Some(result) = take_ready(&mut state) {
                return result;
            }
            *state = WaitState::AwaitingCaller;
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletionResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(result) = take_ready(&mut state) {
                return Some(result);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            *state = WaitState::AwaitingCaller;
            state = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn take_ready(state: &mut WaitState) -> Option<CompletionResult> {
    if !matches!(state, WaitState::Ready(_)) {
        return None;
    }
    match std::mem::replace(state, WaitState::Completed) {
        WaitState::Ready(result) => Some(result),
        _ => None,
    }
}

/// Drives the transport forward while a caller waits.
pub trait EventLoop {
    /// Runs one iteration, blocking for input if `blocking` is set.
    ///
    /// Returns `Ok(false)` once no further input can ever arrive.
    fn poll_once(&mut self, blocking: bool) -> Result<bool, SessionError>;
}

/// Handle to a read submitted without a completion callback.
#[derive(Debug)]
pub struct ReadTicket {
    id: RequestId,
    buffer: SgList,
    rendezvous: Arc<Rendezvous>,
}

impl ReadTicket {
    pub(crate) fn new(id: RequestId, buffer: SgList, rendezvous: Arc<Rendezvous>) -> Self {
        Self {
            id,
            buffer,
            rendezvous,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> WaitState {
        self.rendezvous.state()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), WaitState::Ready(_))
    }

    /// Blocks on the condition variable until the response is dispatched.
    pub fn wait(self) -> Result<SgList, SessionError> {
        ensure_not_dispatching()?;
        self.rendezvous.wait()?;
        Ok(self.buffer)
    }

    /// Blocks for at most `timeout`; `Ok(None)` means the response has not
    /// arrived yet and the ticket can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<SgList>, SessionError> {
        ensure_not_dispatching()?;
        match self.rendezvous.wait_timeout(timeout) {
            Some(result) => {
                result?;
                Ok(Some(self.buffer.clone()))
            }
            None => Ok(None),
        }
    }

    /// Spins `event_loop` until the response is dispatched.
    pub fn wait_polling<E: EventLoop>(self, event_loop: &mut E) -> Result<SgList, SessionError> {
        ensure_not_dispatching()?;
        loop {
            if let Some(result) = self.rendezvous.try_take() {
                result?;
                return Ok(self.buffer);
            }
            if !event_loop.poll_once(true)? {
                return Err(SessionError::Disconnected);
            }
        }
    }
}

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running the dispatcher until dropped.
pub(crate) struct DispatchScope {
    previous: bool,
}

impl DispatchScope {
    pub(crate) fn enter() -> Self {
        let previous = IN_DISPATCH.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(self.previous));
    }
}

fn ensure_not_dispatching() -> Result<(), SessionError> {
    if IN_DISPATCH.with(Cell::get) {
        return Err(SessionError::ReentrantWait);
    }
    Ok(())
}
