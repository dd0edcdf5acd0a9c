//! Engine - the event loop driver
//!
//! The loop owns a scheduled-call queue and a marker registry behind one
//! mutex. `run()` holds the lock for the whole run except while idle:
//! - waiting for the next call more than `wake_tolerance_ms` away happens on
//!   a condvar, so worker threads can lock, mutate and wake the loop early
//! - the sub-tolerance residual is waited out with spin_sleep, lock released
//!
//! Calls run to completion on the loop thread and get a `LoopCtx` that
//! mutates the already-locked state. Other threads go through a
//! `LoopHandle`. On the loop thread, while `run()` is active, a
//! `LoopHandle` never takes the lock: `abort()` is deferred to the next
//! iteration and every other operation fails with
//! `UsageError::HandleOnLoopThread`.

use crate::clock::{self, Ts};
use crate::done::{Done, DoneState, DoneTracker, DEFAULT_TAG};
use crate::error::{
    format_failure, CallError, CallResult, Completion, Failure, Outcome, UsageError,
};
use crate::rng::DetRng;
use crate::scheduler::{SchedHandle, SchedQueue};
use parking_lot::{Condvar, Mutex, MutexGuard};
use spin_sleep::SpinSleeper;
use std::fmt::Display;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default deadline of a marker without an explicit timeout.
pub const DEFAULT_DONE_TIMEOUT_MS: u64 = 2000;
/// Default jitter, in percent of the requested delay.
pub const DEFAULT_JITTER_PCT: u32 = 50;
/// Conventional delay for a call that just needs to happen "a bit later".
pub const DEFAULT_CALL_DELAY_MS: i64 = 100;

/// A queued call.
pub type Callback = Box<dyn FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static>;

fn boxed<F>(f: F) -> Callback
where
    F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
{
    Box::new(f)
}

/// Configuration for a loop.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub default_timeout_ms: u64,
    pub jitter_pct: u32,
    /// Jitter seed; `None` seeds from the clock.
    pub seed: Option<String>,
    /// A call is fired once it is at most this far in the future.
    pub wake_tolerance_ms: i64,
    /// Timeout handlers running further than this from their deadline warn.
    pub late_warning_ms: i64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_DONE_TIMEOUT_MS,
            jitter_pct: DEFAULT_JITTER_PCT,
            seed: None,
            wake_tolerance_ms: 2,
            late_warning_ms: 10,
        }
    }
}

impl LoopConfig {
    /// Defaults, overridden by `TESTLOOP_DEFAULT_DONE_TIMEOUT`,
    /// `TESTLOOP_JITTER_PCT` and `TESTLOOP_SEED`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_parse("TESTLOOP_DEFAULT_DONE_TIMEOUT") {
            config.default_timeout_ms = ms;
        }
        if let Some(pct) = env_parse("TESTLOOP_JITTER_PCT") {
            config.jitter_pct = pct;
        }
        if let Ok(seed) = std::env::var("TESTLOOP_SEED") {
            config.seed = Some(seed);
        }
        config
    }
}

fn env_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(name, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

/// State shared between the loop thread and worker threads.
pub struct LoopState {
    queue: SchedQueue<Callback>,
    dones: DoneTracker,
    completion: Completion,
    error: Option<String>,
    error_tag: Option<String>,
    failure: Option<Failure>,
    /// Usage error raised off the loop thread, returned by `run()`.
    fatal: Option<UsageError>,
    jitter_pct: u32,
    late_warning_ms: i64,
    running: bool,
}

impl LoopState {
    fn new(config: &LoopConfig, dones: DoneTracker) -> Self {
        Self {
            queue: SchedQueue::new(DetRng::from_seed(config.seed.as_deref())),
            dones,
            completion: Completion::NotComplete,
            error: None,
            error_tag: None,
            failure: None,
            fatal: None,
            jitter_pct: config.jitter_pct,
            late_warning_ms: config.late_warning_ms,
            running: false,
        }
    }

    /// Queue `f` to run `delay_ms` from now with the loop's default jitter.
    ///
    /// A negative delay chains: the call runs `|delay_ms|` after the previous
    /// chained call's target, not after "now".
    pub fn schedule<F>(&mut self, delay_ms: i64, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        let pct = self.jitter_pct;
        self.schedule_with_jitter(delay_ms, pct, f)
    }

    /// Queue `f` "a bit later" (`DEFAULT_CALL_DELAY_MS`).
    pub fn schedule_default<F>(&mut self, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.schedule(DEFAULT_CALL_DELAY_MS, f)
    }

    /// Like `schedule`, with an explicit jitter percentage (0 disables it).
    pub fn schedule_with_jitter<F>(&mut self, delay_ms: i64, jitter_pct: u32, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        let (handle, ts) = self.queue.schedule(delay_ms, jitter_pct, boxed(f));
        trace!(
            delay_ms,
            jitter_pct,
            in_ms = ts - clock::now_ms(),
            "call scheduled"
        );
        handle
    }

    /// Cancel a pending call. Returns false if it already ran.
    pub fn cancel(&mut self, handle: SchedHandle) -> bool {
        self.queue.cancel(handle)
    }

    /// Register a marker. While running, its deadline is anchored right away.
    pub fn add_done(&mut self, done: Done) -> Result<(), UsageError> {
        self.dones.register(done)?;
        if self.running {
            self.arm_dones(clock::now_ms());
        }
        Ok(())
    }

    pub fn resolve(&mut self, tag: &str) -> Result<(), UsageError> {
        match self.dones.resolve(tag, &mut self.queue)? {
            None => {
                debug!(tag, "done() -> success");
                Ok(())
            }
            Some(failure) => self.record_failure(Some(tag), failure),
        }
    }

    /// Resolve the implicit `_default` marker.
    pub fn resolve_default(&mut self) -> Result<(), UsageError> {
        self.require_default()?;
        self.resolve(DEFAULT_TAG)
    }

    /// Fail a marker explicitly. The first failure wins.
    pub fn fail(&mut self, tag: &str, msg: impl Into<String>) -> Result<(), UsageError> {
        if tag.is_empty() {
            return Err(UsageError::EmptyTag);
        }
        self.record_failure(Some(tag), Failure::Explicit(msg.into()))
    }

    pub fn fail_default(&mut self, msg: impl Into<String>) -> Result<(), UsageError> {
        self.require_default()?;
        self.fail(DEFAULT_TAG, msg)
    }

    /// Stop the loop; pending calls are discarded. No-op once terminal.
    pub fn abort(&mut self) {
        if self.completion.is_terminal() {
            return;
        }
        debug!("loop aborted");
        self.completion = Completion::Aborted;
    }

    pub fn set_jitter_pct(&mut self, pct: u32) {
        self.jitter_pct = pct;
    }

    pub fn jitter_pct(&self) -> u32 {
        self.jitter_pct
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn done_state(&self, tag: &str) -> Option<DoneState> {
        self.dones.state(tag)
    }

    pub fn pending_calls(&self) -> usize {
        self.queue.len()
    }

    fn require_default(&self) -> Result<(), UsageError> {
        if self.dones.contains(DEFAULT_TAG) {
            Ok(())
        } else {
            Err(UsageError::NoDefaultDone)
        }
    }

    fn set_fatal(&mut self, err: UsageError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    fn record_failure(&mut self, tag: Option<&str>, failure: Failure) -> Result<(), UsageError> {
        if let Some(tag) = tag {
            self.dones.mark_error(tag)?;
        }
        let msg = format_failure(tag, &failure);
        if self.completion.is_terminal() {
            debug!(completion = %self.completion, %msg, "failure after completion ignored");
            return Ok(());
        }
        debug!(%msg, "loop failed");
        self.completion = Completion::Error;
        self.error = Some(msg);
        self.error_tag = tag.map(str::to_string);
        self.failure = Some(failure);
        Ok(())
    }

    fn arm_dones(&mut self, now: Ts) {
        let queue = &mut self.queue;
        self.dones.anchor_all(now, |tag, deadline| {
            let tag = tag.to_string();
            queue.schedule_at(
                deadline,
                boxed(move |ctx| {
                    ctx.on_timeout(&tag, deadline);
                    Ok(())
                }),
            )
        });
    }

    fn on_timeout(&mut self, tag: &str, deadline: Ts) {
        let offset = (clock::now_ms() - deadline).abs();
        trace!(tag, offset, "done() timeout handler executed");
        if offset > self.late_warning_ms {
            warn!(
                tag,
                offset,
                "done() timeout handler executed more than {} ms from its deadline; \
                 normal if paused in a debugger",
                self.late_warning_ms
            );
        }
        let result = match self.dones.state(tag) {
            Some(DoneState::Pending) => self.record_failure(Some(tag), Failure::Timeout),
            // Resolution normally cancels the timeout; this covers the race.
            Some(_) => {
                trace!(tag, "done() timeout handler: already resolved");
                Ok(())
            }
            None => self.record_failure(
                None,
                Failure::Explicit(format!(
                    "Internal error: done() timeout handler could not find done item '{}'",
                    tag
                )),
            ),
        };
        if let Err(e) = result {
            self.set_fatal(e);
        }
    }

    fn outcome(&self, elapsed_ms: i64) -> Outcome {
        Outcome {
            completion: self.completion,
            error: self.error.clone(),
            error_tag: self.error_tag.clone(),
            failure: self.failure.clone(),
            elapsed_ms,
        }
    }
}

struct Shared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    /// Thread inside `run()`, if any.
    loop_thread: Mutex<Option<ThreadId>>,
    /// Abort requested from the loop thread, applied on the next iteration.
    abort_requested: AtomicBool,
}

impl Shared {
    fn on_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }
}

/// Marks the current thread as the loop thread until dropped.
struct LoopThreadGuard<'a>(&'a Shared);

impl<'a> LoopThreadGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        *shared.loop_thread.lock() = Some(thread::current().id());
        Self(shared)
    }
}

impl Drop for LoopThreadGuard<'_> {
    fn drop(&mut self) {
        *self.0.loop_thread.lock() = None;
    }
}

/// What a call sees while it runs on the loop thread.
pub struct LoopCtx<'a> {
    state: &'a mut LoopState,
    shared: &'a Arc<Shared>,
}

impl LoopCtx<'_> {
    /// Handle for worker threads spawned from this call.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(self.shared),
        }
    }
}

impl Deref for LoopCtx<'_> {
    type Target = LoopState;

    fn deref(&self) -> &LoopState {
        self.state
    }
}

impl DerefMut for LoopCtx<'_> {
    fn deref_mut(&mut self) -> &mut LoopState {
        self.state
    }
}

/// Thread-safe access to a loop from outside its calls.
///
/// Each operation takes the loop lock (so it only proceeds while the loop is
/// idle) and wakes the loop afterwards. Usage errors are returned and also
/// reported by `run()`.
///
/// Inside a call the loop already holds the lock; there every operation but
/// `abort()` returns `UsageError::HandleOnLoopThread`.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut LoopState) -> Result<R, UsageError>,
    ) -> Result<R, UsageError> {
        if self.shared.on_loop_thread() {
            return Err(UsageError::HandleOnLoopThread);
        }
        let mut state = self.shared.state.lock();
        let result = f(&mut *state);
        if let Err(e) = &result {
            state.set_fatal(e.clone());
        }
        drop(state);
        self.shared.wakeup.notify_all();
        result
    }

    pub fn resolve(&self, tag: &str) -> Result<(), UsageError> {
        self.with_state(|s| s.resolve(tag))
    }

    pub fn resolve_default(&self) -> Result<(), UsageError> {
        self.with_state(|s| s.resolve_default())
    }

    pub fn fail(&self, tag: &str, msg: impl Into<String>) -> Result<(), UsageError> {
        self.with_state(|s| s.fail(tag, msg))
    }

    pub fn fail_default(&self, msg: impl Into<String>) -> Result<(), UsageError> {
        self.with_state(|s| s.fail_default(msg))
    }

    pub fn schedule<F>(&self, delay_ms: i64, f: F) -> Result<SchedHandle, UsageError>
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.with_state(|s| Ok(s.schedule(delay_ms, f)))
    }

    pub fn schedule_with_jitter<F>(
        &self,
        delay_ms: i64,
        jitter_pct: u32,
        f: F,
    ) -> Result<SchedHandle, UsageError>
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.with_state(|s| Ok(s.schedule_with_jitter(delay_ms, jitter_pct, f)))
    }

    /// Stop the loop. Callable from any thread; on the loop thread it takes
    /// effect once the current call returns.
    pub fn abort(&self) {
        if self.shared.on_loop_thread() {
            self.shared.abort_requested.store(true, Ordering::SeqCst);
            return;
        }
        self.shared.state.lock().abort();
        self.shared.wakeup.notify_all();
    }

    pub fn completion(&self) -> Result<Completion, UsageError> {
        self.with_state(|s| Ok(s.completion()))
    }

    pub fn done_state(&self, tag: &str) -> Result<Option<DoneState>, UsageError> {
        self.with_state(|s| Ok(s.done_state(tag)))
    }
}

/// A single-use event loop.
pub struct EventLoop {
    shared: Arc<Shared>,
    sleeper: SpinSleeper,
    wake_tolerance_ms: i64,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Loop with the implicit `_default` marker and default configuration.
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Loop with the implicit `_default` marker.
    pub fn with_config(config: LoopConfig) -> Self {
        let dones = DoneTracker::with_default(config.default_timeout_ms);
        Self::from_parts(&config, dones)
    }

    /// Loop with an explicit list of markers and no `_default`.
    pub fn with_dones(dones: Vec<Done>) -> Result<Self, UsageError> {
        Self::with_config_and_dones(LoopConfig::default(), dones)
    }

    pub fn with_config_and_dones(config: LoopConfig, dones: Vec<Done>) -> Result<Self, UsageError> {
        let mut tracker = DoneTracker::new(config.default_timeout_ms);
        for done in dones {
            tracker.register(done)?;
        }
        Ok(Self::from_parts(&config, tracker))
    }

    fn from_parts(config: &LoopConfig, dones: DoneTracker) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::new(config, dones)),
                wakeup: Condvar::new(),
                loop_thread: Mutex::new(None),
                abort_requested: AtomicBool::new(false),
            }),
            sleeper: SpinSleeper::default(),
            wake_tolerance_ms: config.wake_tolerance_ms,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn schedule<F>(&self, delay_ms: i64, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.shared.state.lock().schedule(delay_ms, f)
    }

    pub fn schedule_default<F>(&self, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.shared.state.lock().schedule_default(f)
    }

    pub fn schedule_with_jitter<F>(&self, delay_ms: i64, jitter_pct: u32, f: F) -> SchedHandle
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.shared
            .state
            .lock()
            .schedule_with_jitter(delay_ms, jitter_pct, f)
    }

    pub fn add_done(&self, done: Done) -> Result<(), UsageError> {
        self.shared.state.lock().add_done(done)
    }

    pub fn set_jitter_pct(&self, pct: u32) {
        self.shared.state.lock().set_jitter_pct(pct);
    }

    /// Anchor all marker deadlines to now and drive calls until the loop
    /// reaches a terminal state or runs out of calls.
    ///
    /// Test failures are reported in the returned `Outcome`; `Err` means the
    /// test itself misused the loop.
    pub fn run(self) -> Result<Outcome, UsageError> {
        let EventLoop {
            shared,
            sleeper,
            wake_tolerance_ms,
        } = self;
        let mut state = shared.state.lock();
        let started = clock::now_ms();
        state.arm_dones(started);
        if state.queue.is_empty() {
            return Err(UsageError::NothingToRun);
        }
        state.running = true;
        debug!(
            calls = state.queue.len(),
            dones = state.dones.len(),
            "loop started"
        );

        let driven = {
            let _loop_thread = LoopThreadGuard::enter(&shared);
            drive(&shared, &mut state, &sleeper, wake_tolerance_ms)
        };
        state.running = false;
        driven?;

        match state.completion {
            Completion::NotComplete => state.completion = Completion::Success,
            Completion::Aborted => state.dones.abort_pending(),
            _ => {}
        }
        let discarded = state.queue.len();
        if discarded > 0 {
            trace!(discarded, "discarding pending calls");
            state.queue.clear();
        }
        let outcome = state.outcome(clock::now_ms() - started);
        debug!(completion = %outcome.completion, elapsed_ms = outcome.elapsed_ms, "loop finished");
        Ok(outcome)
    }
}

fn drive(
    shared: &Arc<Shared>,
    state: &mut MutexGuard<'_, LoopState>,
    sleeper: &SpinSleeper,
    wake_tolerance_ms: i64,
) -> Result<(), UsageError> {
    loop {
        if let Some(err) = state.fatal.take() {
            return Err(err);
        }
        if shared.abort_requested.swap(false, Ordering::SeqCst) {
            state.abort();
        }
        if state.completion.is_terminal() {
            return Ok(());
        }
        let Some(ts) = state.queue.peek_next_timestamp() else {
            return Ok(());
        };

        let to_sleep = ts - clock::now_ms();
        if to_sleep > wake_tolerance_ms {
            trace!(to_sleep, pending = state.queue.len(), "sleeping before next event");
            shared
                .wakeup
                .wait_for(state, Duration::from_millis(to_sleep as u64));
            continue;
        }
        if to_sleep > 0 {
            MutexGuard::unlocked(state, || {
                sleeper.sleep(Duration::from_millis(to_sleep as u64))
            });
            continue;
        }

        let Some((_, call)) = state.queue.pop_earliest() else {
            return Ok(());
        };
        let result = {
            let mut ctx = LoopCtx {
                state: &mut **state,
                shared,
            };
            call(&mut ctx)
        };
        match result {
            Ok(()) => {}
            Err(CallError::Usage(e)) => return Err(e),
            Err(CallError::Bailout(msg)) => state.record_failure(None, Failure::Bailout(msg))?,
        }
    }
}
