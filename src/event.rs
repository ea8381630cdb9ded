//! Async events and join barriers
//!
//! An `AsyncEvent` stands for one submitted operation. It is completed
//! exactly once, usually by the worker thread that performed the I/O, and
//! runs its listeners synchronously on that thread. An `AsyncEventSet`
//! counts outstanding members and lets a caller block on them or attach a
//! listener for when the last one lands.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{ProgrammingError, ResultCode};
use crate::types::{EventId, SessionId};
use crate::worker::Workers;

/// Opaque result payload carried by an event
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Listener invoked with the completed event and its payload
pub type Listener = Box<dyn FnOnce(&AsyncEvent, Option<&Payload>) + Send + 'static>;

thread_local! {
    // Depth of listener dispatch on this thread; wait() refuses to block while > 0.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

fn dispatching() -> bool {
    DISPATCH_DEPTH.with(|d| d.get() > 0)
}

enum EventState {
    Pending(Vec<Listener>),
    Completed {
        result: ResultCode,
        payload: Option<Payload>,
    },
}

struct EventInner {
    id: EventId,
    session: Option<SessionId>,
    state: Mutex<EventState>,
}

/// One outstanding asynchronous operation
///
/// Cheap to clone; all clones refer to the same event.
#[derive(Clone)]
pub struct AsyncEvent {
    inner: Arc<EventInner>,
}

impl std::fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("id", &self.inner.id)
            .field("result", &self.result())
            .finish()
    }
}

impl AsyncEvent {
    /// Create a new, incomplete event with no listeners
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an event owned by a session
    pub fn for_session(session: SessionId) -> Self {
        Self::build(Some(session))
    }

    /// Create an event that is already completed
    pub fn completed(result: ResultCode) -> Self {
        let event = Self::new();
        *event.inner.state.lock() = EventState::Completed {
            result,
            payload: None,
        };
        event
    }

    fn build(session: Option<SessionId>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: EventId::new(),
                session,
                state: Mutex::new(EventState::Pending(Vec::new())),
            }),
        }
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    pub fn session(&self) -> Option<SessionId> {
        self.inner.session
    }

    /// Store the result and run every registered listener in order
    ///
    /// Listeners run on the calling thread. Completing twice is a
    /// programming error: it is logged and rejected, the first result stays.
    pub fn complete(
        &self,
        result: ResultCode,
        payload: Option<Payload>,
    ) -> Result<(), ProgrammingError> {
        if self.try_complete(result, payload) {
            Ok(())
        } else {
            error!("event {} completed twice", self.inner.id);
            Err(ProgrammingError::AlreadyCompleted(self.inner.id))
        }
    }

    /// Complete unless already completed. Returns whether this call won.
    ///
    /// For completions that deliberately race (timer gates, cancellation).
    pub fn try_complete(&self, result: ResultCode, payload: Option<Payload>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            let listeners = match &mut *state {
                EventState::Completed { .. } => return false,
                EventState::Pending(listeners) => std::mem::take(listeners),
            };
            *state = EventState::Completed {
                result,
                payload: payload.clone(),
            };
            listeners
        };

        debug!(
            "event {} completed with {:?}, {} listener(s)",
            self.inner.id,
            result,
            listeners.len()
        );
        for listener in listeners {
            self.run_listener(listener, payload.as_ref());
        }
        true
    }

    /// Register a listener
    ///
    /// If the event is already completed the listener runs immediately on
    /// the calling thread, before this returns.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&AsyncEvent, Option<&Payload>) + Send + 'static,
    {
        let payload = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                EventState::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                EventState::Completed { payload, .. } => payload.clone(),
            }
        };
        self.run_listener(Box::new(listener), payload.as_ref());
    }

    fn run_listener(&self, listener: Listener, payload: Option<&Payload>) {
        let _guard = DispatchGuard::enter();
        if catch_unwind(AssertUnwindSafe(|| listener(self, payload))).is_err() {
            error!("listener of event {} panicked", self.inner.id);
        }
    }

    /// Result code, or None while still pending
    pub fn result(&self) -> Option<ResultCode> {
        match &*self.inner.state.lock() {
            EventState::Pending(_) => None,
            EventState::Completed { result, .. } => Some(*result),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.result().is_some()
    }

    /// Payload downcast to `T`, if completed with one of that type
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &*self.inner.state.lock() {
            EventState::Completed {
                payload: Some(payload),
                ..
            } => payload.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl Default for AsyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

type SetListener = Box<dyn FnOnce() + Send + 'static>;

struct SetState {
    members: Vec<AsyncEvent>,
    remaining: usize,
    listeners: Vec<SetListener>,
    satisfied: bool,
}

struct SetInner {
    state: Mutex<SetState>,
    cond: Condvar,
}

/// Join barrier over a group of async events
///
/// Satisfaction is observed by `wait()` or `add_listener()`; once either
/// has seen the count at zero the set is spent and rejects new members.
#[derive(Clone)]
pub struct AsyncEventSet {
    inner: Arc<SetInner>,
}

impl AsyncEventSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SetInner {
                state: Mutex::new(SetState {
                    members: Vec::new(),
                    remaining: 0,
                    listeners: Vec::new(),
                    satisfied: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Add a member; counts toward the barrier even if already completed
    pub fn add(&self, event: &AsyncEvent) -> Result<(), ProgrammingError> {
        {
            let mut state = self.inner.state.lock();
            if state.satisfied {
                return Err(ProgrammingError::SetSatisfied);
            }
            state.remaining += 1;
            state.members.push(event.clone());
        }

        let inner = Arc::clone(&self.inner);
        event.add_listener(move |_, _| SetInner::member_done(&inner));
        Ok(())
    }

    /// Block until every member has completed
    ///
    /// Must not be called from a thread responsible for completing a
    /// member. Inside any event or set listener (and so inside signal
    /// subscribers published from one) waiting on a set with pending
    /// members is rejected; a set already at zero returns at once.
    pub fn wait(&self) -> Result<(), ProgrammingError> {
        let mut state = self.inner.state.lock();
        if state.remaining > 0 && dispatching() {
            return Err(ProgrammingError::WaitInsideListener);
        }
        while state.remaining > 0 {
            self.inner.cond.wait(&mut state);
        }
        state.satisfied = true;
        Ok(())
    }

    /// Wait at most `timeout`; returns false if the timer fired first
    ///
    /// Races this set against a timer on `workers` through a gate event
    /// that whichever side finishes first completes.
    pub fn wait_timeout(
        &self,
        workers: &Workers,
        timeout: Duration,
    ) -> Result<bool, ProgrammingError> {
        let gate = AsyncEvent::new();
        let race = AsyncEventSet::new();
        race.add(&gate)?;

        let on_done = gate.clone();
        self.add_listener(move || {
            on_done.try_complete(ResultCode::Success, None);
        });
        let on_timer = gate.clone();
        workers.after(timeout, move || {
            on_timer.try_complete(ResultCode::Cancelled, None);
        });

        race.wait()?;
        Ok(gate.result() == Some(ResultCode::Success))
    }

    /// Run `listener` once all members have completed, without blocking
    ///
    /// Runs immediately on the calling thread if the count is already zero.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.remaining > 0 {
                state.listeners.push(Box::new(listener));
                return;
            }
            state.satisfied = true;
        }
        run_set_listener(Box::new(listener));
    }

    /// Members not yet completed
    pub fn remaining(&self) -> usize {
        self.inner.state.lock().remaining
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member events in insertion order
    pub fn members(&self) -> Vec<AsyncEvent> {
        self.inner.state.lock().members.clone()
    }
}

impl Default for AsyncEventSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SetInner {
    fn member_done(inner: &Arc<SetInner>) {
        let listeners = {
            let mut state = inner.state.lock();
            debug_assert!(state.remaining > 0, "event set count underflow");
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 {
                return;
            }
            inner.cond.notify_all();
            if state.listeners.is_empty() {
                return;
            }
            state.satisfied = true;
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            run_set_listener(listener);
        }
    }
}

/// Run a set listener as part of dispatch, isolating panics
fn run_set_listener(listener: SetListener) {
    let _guard = DispatchGuard::enter();
    if catch_unwind(AssertUnwindSafe(listener)).is_err() {
        error!("event set listener panicked");
    }
}
