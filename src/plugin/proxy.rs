/*!

[PluginProxy]: the FIFO scheduler sitting between one or more
[crate::session::AuthSession]s and a single worker subprocess, per
spec §4.5.

 */
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::method_cache::MethodCache;
use crate::plugin::host::PluginWorker;
use crate::plugin::protocol::{PluginState, Request, Signal};

/// The state machine state of one session, as seen by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Active,
    AwaitingUser,
    AwaitingRefresh,
    Done,
    Canceled,
}

pub type ReadyCallback = Box<dyn FnMut(std::result::Result<MethodCache, Error>) + Send>;
pub type StateCallback = Box<dyn Fn(PluginState, String) + Send>;
pub type StoreCallback = Box<dyn Fn(MethodCache) + Send>;

struct Session {
    id: u64,
    state: SessionState,
    request: Request,
    ready_cb: ReadyCallback,
    state_cb: StateCallback,
    store_cb: StoreCallback,
}

/// Single-worker-per-proxy FIFO scheduler. Not `Sync` by construction —
/// callers share it behind a `Mutex` (see [ProxyRegistry]), matching the
/// single-threaded cooperative event loop of spec §5.
pub struct PluginProxy {
    worker: Box<dyn PluginWorker>,
    mechanisms: Vec<String>,
    queue: VecDeque<Session>,
    active: Option<Session>,
    dead: bool,
    idle_timeout: Option<Duration>,
    idle_since: Option<Instant>,
}

impl PluginProxy {
    pub fn new(worker: Box<dyn PluginWorker>, mechanisms: Vec<String>, idle_timeout: Option<Duration>) -> Self {
        PluginProxy {
            worker,
            mechanisms,
            queue: VecDeque::new(),
            active: None,
            dead: false,
            idle_timeout,
            idle_since: Some(Instant::now()),
        }
    }

    pub fn advertised_mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// True if idle for at least `idle_timeout` — the embedder's cue to
    /// terminate the worker and drop its `Arc` so the registry's next
    /// sweep reclaims it. This crate has no event loop of its own to call
    /// it on a schedule; the embedding daemon's tick is expected to.
    pub fn should_evict(&self, now: Instant) -> bool {
        match (self.idle_timeout, self.idle_since) {
            (Some(timeout), Some(since)) => self.is_idle() && now.duration_since(since) >= timeout,
            _ => false,
        }
    }

    fn mark_busy(&mut self) {
        self.idle_since = None;
    }

    fn mark_idle(&mut self) {
        self.idle_since = Some(Instant::now());
    }

    pub fn state_of(&self, session_id: u64) -> Option<SessionState> {
        if let Some(active) = &self.active {
            if active.id == session_id {
                return Some(active.state);
            }
        }
        self.queue.iter().find(|s| s.id == session_id).map(|s| s.state)
    }

    /// Submits `request` on behalf of `session_id`. If the proxy is idle,
    /// the request is dispatched to the worker immediately; if this
    /// session is already the active one, it takes the continuation
    /// fast-path; otherwise it's queued FIFO.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        session_id: u64,
        request: Request,
        ready_cb: ReadyCallback,
        state_cb: StateCallback,
        store_cb: StoreCallback,
    ) -> Result<()> {
        if self.dead {
            return Err(Error::PluginCrashed);
        }
        let is_continuation = self.active.as_ref().is_some_and(|a| a.id == session_id);
        if is_continuation {
            self.send_and_pump(session_id, request)?;
            return Ok(());
        }
        let session = Session {
            id: session_id,
            state: SessionState::Queued,
            request,
            ready_cb,
            state_cb,
            store_cb,
        };
        self.queue.push_back(session);
        if self.active.is_none() {
            self.activate_next()?;
        }
        Ok(())
    }

    /// Pops the next queued session (if any), marks it `Active`, and
    /// dispatches its stashed request to the worker.
    fn activate_next(&mut self) -> Result<()> {
        let Some(mut session) = self.queue.pop_front() else { return Ok(()) };
        session.state = SessionState::Active;
        let id = session.id;
        let request = session.request.clone();
        self.mark_busy();
        self.active = Some(session);
        self.send_and_pump(id, request)
    }

    fn send_and_pump(&mut self, session_id: u64, request: Request) -> Result<()> {
        if let Err(e) = self.worker.send(&request) {
            self.fail_active_and_drain(session_id, Error::PluginCrashed);
            return Err(e);
        }
        self.pump(session_id)
    }

    /// Reads signals from the worker until the conversation either pauses
    /// (continuation fast-path, user action, refresh) or terminates
    /// (response_final, error), at which point the next queued request
    /// (if any) is dispatched.
    fn pump(&mut self, session_id: u64) -> Result<()> {
        loop {
            match self.worker.recv() {
                Err(e) => {
                    self.fail_active_and_drain(session_id, Error::PluginCrashed);
                    return Err(e);
                }
                Ok(None) => {
                    self.fail_active_and_drain(session_id, Error::PluginCrashed);
                    return Ok(());
                }
                Ok(Some(signal)) => match signal {
                    Signal::Response { data } => {
                        self.call_ready(session_id, Ok(data));
                        return Ok(());
                    }
                    Signal::ResponseFinal { data } => {
                        self.call_ready(session_id, Ok(data));
                        self.finish_active_and_advance();
                        return Ok(());
                    }
                    Signal::Store { data } => {
                        if let Some(active) = &self.active {
                            if active.id == session_id {
                                (active.store_cb)(data);
                            }
                        }
                    }
                    Signal::UserActionRequired { ui_data } => {
                        self.set_active_state(session_id, SessionState::AwaitingUser);
                        self.call_state(session_id, PluginState::UserPending, String::new());
                        self.call_ready(session_id, Ok(ui_data));
                        return Ok(());
                    }
                    Signal::Refreshed { ui_data } => {
                        self.set_active_state(session_id, SessionState::AwaitingRefresh);
                        self.call_state(session_id, PluginState::Refreshing, String::new());
                        self.call_ready(session_id, Ok(ui_data));
                        return Ok(());
                    }
                    Signal::StatusChanged { state, message } => {
                        self.call_state(session_id, state, message);
                    }
                    Signal::Error { kind, message } => {
                        self.call_ready(session_id, Err(kind.into_error(message)));
                        self.finish_active_and_advance();
                        return Ok(());
                    }
                },
            }
        }
    }

    fn set_active_state(&mut self, session_id: u64, state: SessionState) {
        if let Some(active) = &mut self.active {
            if active.id == session_id {
                active.state = state;
            }
        }
    }

    fn call_ready(&mut self, session_id: u64, result: std::result::Result<MethodCache, Error>) {
        if let Some(active) = &mut self.active {
            if active.id == session_id {
                (active.ready_cb)(result);
            }
        }
    }

    fn call_state(&self, session_id: u64, state: PluginState, message: String) {
        if let Some(active) = &self.active {
            if active.id == session_id {
                (active.state_cb)(state, message);
            }
        }
    }

    fn finish_active_and_advance(&mut self) {
        self.active = None;
        self.mark_idle();
        // `activate_next` itself drives the worker; errors there already
        // deliver through the usual ready_cb/drain path, so swallow them
        // here rather than propagating into a signal-handling call site
        // that has nothing further to return to.
        let _ = self.activate_next();
    }

    /// Cancels `session_id`. If queued, it's removed and synthesizes
    /// `SessionCanceled` synchronously. If active, forwards `Cancel` to
    /// the worker; the resulting error arrives asynchronously via the
    /// normal signal path.
    pub fn cancel(&mut self, session_id: u64) -> Result<()> {
        if let Some(pos) = self.queue.iter().position(|s| s.id == session_id) {
            let mut session = self.queue.remove(pos).unwrap();
            session.state = SessionState::Canceled;
            (session.ready_cb)(Err(Error::SessionCanceled));
            return Ok(());
        }
        if self.active.as_ref().is_some_and(|a| a.id == session_id) {
            return self.send_and_pump(session_id, Request::Cancel);
        }
        Ok(())
    }

    fn fail_active_and_drain(&mut self, crashing_session: u64, err: Error) {
        self.dead = true;
        if let Some(active) = &mut self.active {
            if active.id == crashing_session {
                (active.ready_cb)(Err(err.clone()));
            }
        }
        self.active = None;
        while let Some(session) = self.queue.pop_front() {
            let mut session = session;
            (session.ready_cb)(Err(err.clone()));
            session.state = SessionState::Done;
        }
    }
}

/// Keyed by method name, mirroring a Weak-reference registry so that a
/// proxy with no remaining live handles is dropped (and its worker
/// killed) automatically rather than kept alive by the registry itself.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: DashMap<String, Weak<Mutex<PluginProxy>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live proxy for `method`, or calls `spawn` to create a
    /// fresh one (e.g. after the previous one crashed or was evicted).
    pub fn get_or_spawn(
        &self,
        method: &str,
        spawn: impl FnOnce() -> Result<PluginProxy>,
    ) -> Result<Arc<Mutex<PluginProxy>>> {
        if let Some(weak) = self.proxies.get(method) {
            if let Some(arc) = weak.upgrade() {
                if !arc.lock().unwrap().is_dead() {
                    return Ok(arc);
                }
            }
        }
        // The stale entry (if any) is about to be replaced below; sweep
        // here rather than on every lookup so a live registry still sheds
        // other methods' dead/dropped proxies as it grows.
        self.sweep();
        let proxy = Arc::new(Mutex::new(spawn()?));
        self.proxies.insert(method.to_string(), Arc::downgrade(&proxy));
        Ok(proxy)
    }

    /// Drops dead or no-longer-referenced entries.
    pub fn sweep(&self) {
        self.proxies.retain(|_, weak| weak.upgrade().is_some_and(|arc| !arc.lock().unwrap().is_dead()));
    }
}
