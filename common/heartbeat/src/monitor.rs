//! Periodic liveness probe with an acknowledgment deadline.

use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HeartbeatError;
use crate::metrics;

/// Probe invoked once per tick. Its prompt return is the acknowledgment.
pub type ProbeCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    /// No probe registered yet.
    Uninitialized,
    /// Probe registered, ticking loop not started.
    Configured,
    /// Ticking loop running.
    Running,
    /// Scope cancelled. Terminal, the verdict is frozen.
    Stopped,
}

/// Watchdog over a single probe callback.
///
/// Every `signal_interval` the probe is issued on the blocking pool and an
/// acknowledgment deadline of `ack_timeout` is armed. The monitor is alive
/// once a probe returns before its deadline, and stops being alive when a
/// probe is still outstanding at its deadline. A late return does not
/// restore liveness, the next acknowledged tick does.
///
/// Clones share the same state. The ticking loop is bound to a child of the
/// token given at construction: cancelling that token (or any ancestor)
/// stops it and freezes the verdict.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    signal_interval: Duration,
    ack_timeout: Duration,
    probe: OnceLock<ProbeCallback>,
    alive: AtomicBool,
    started: AtomicBool,
    token: CancellationToken,
    finished: CancellationToken,
}

enum Wake {
    Cancelled,
    Tick,
    Returned(Result<(), JoinError>),
    AckTimeout,
}

impl HeartbeatMonitor {
    /// Create a monitor scoped to a child of `parent`. Nothing runs until [`start`](Self::start).
    pub fn new(parent: &CancellationToken, signal_interval: Duration, ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                signal_interval,
                ack_timeout,
                probe: OnceLock::new(),
                alive: AtomicBool::new(false),
                started: AtomicBool::new(false),
                token: parent.child_token(),
                finished: CancellationToken::new(),
            }),
        }
    }

    /// Register the probe. Only the first registration is kept, and only
    /// before the monitor is started.
    pub fn set_callback<F>(&self, probe: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!("Heartbeat: probe registered after start, ignoring");
            return;
        }
        if self.inner.probe.set(Arc::new(probe)).is_err() {
            warn!("Heartbeat: probe already registered, ignoring");
        }
    }

    /// Spawn the ticking loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), HeartbeatError> {
        validate_timing(self.inner.signal_interval, self.inner.ack_timeout)?;
        let probe = self
            .inner
            .probe
            .get()
            .cloned()
            .ok_or(HeartbeatError::MissingCallback)?;
        let runtime = Handle::try_current().map_err(|_| HeartbeatError::NoRuntime)?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(HeartbeatError::AlreadyStarted);
        }

        let inner = self.inner.clone();
        runtime.spawn(inner.run(probe));
        Ok(())
    }

    /// Current verdict. Lock-free, valid in every state.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// False once the monitor's scope has been cancelled.
    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    pub fn state(&self) -> MonitorState {
        if !self.inner.started.load(Ordering::SeqCst) {
            if self.inner.probe.get().is_some() {
                MonitorState::Configured
            } else {
                MonitorState::Uninitialized
            }
        } else if self.inner.token.is_cancelled() {
            MonitorState::Stopped
        } else {
            MonitorState::Running
        }
    }

    pub fn signal_interval(&self) -> Duration {
        self.inner.signal_interval
    }

    pub fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout
    }

    /// Resolves once the ticking loop has exited, or immediately if it was never started.
    pub async fn stopped(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.finished.cancelled().await
    }
}

impl fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("signal_interval", &self.inner.signal_interval)
            .field("ack_timeout", &self.inner.ack_timeout)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl MonitorInner {
    async fn run(self: Arc<Self>, probe: ProbeCallback) {
        // Marks the loop as finished on every exit path, panics included.
        let _finished = self.finished.clone().drop_guard();

        debug!(
            signal_interval_secs = self.signal_interval.as_secs_f64(),
            ack_timeout_secs = self.ack_timeout.as_secs_f64(),
            "Heartbeat: ticking loop started"
        );

        let mut ticker = time::interval_at(
            Instant::now() + self.signal_interval,
            self.signal_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut outstanding: Option<JoinHandle<()>> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                biased;

                _ = self.token.cancelled() => Wake::Cancelled,
                joined = join_outstanding(&mut outstanding) => Wake::Returned(joined),
                _ = sleep_until(deadline) => Wake::AckTimeout,
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Tick => {
                    if outstanding.is_some() {
                        debug!("Heartbeat: previous probe still outstanding, skipping tick");
                        continue;
                    }
                    let probe = probe.clone();
                    deadline = Some(Instant::now() + self.ack_timeout);
                    outstanding = Some(tokio::task::spawn_blocking(move || probe()));
                    metrics::emit_probe_issued();
                }
                Wake::Returned(joined) => {
                    outstanding = None;
                    let in_time = deadline.take().is_some();
                    match joined {
                        Ok(()) if in_time => self.set_alive(true),
                        Ok(()) => info!("Heartbeat: late probe returned, waiting for next tick"),
                        Err(e) => {
                            warn!(error = %e, "Heartbeat: probe failed");
                            self.set_alive(false);
                        }
                    }
                }
                Wake::AckTimeout => {
                    deadline = None;
                    warn!(
                        ack_timeout_secs = self.ack_timeout.as_secs_f64(),
                        "Heartbeat: probe not acknowledged in time"
                    );
                    metrics::emit_ack_timeout();
                    self.set_alive(false);
                }
            }
        }

        debug!(
            alive = self.alive.load(Ordering::Acquire),
            "Heartbeat: ticking loop stopped"
        );
    }

    fn set_alive(&self, alive: bool) {
        let previous = self.alive.swap(alive, Ordering::AcqRel);
        if previous != alive {
            info!(alive, "Heartbeat: liveness changed");
        }
        metrics::emit_alive(alive);
    }
}

pub(crate) fn validate_timing(
    signal_interval: Duration,
    ack_timeout: Duration,
) -> Result<(), HeartbeatError> {
    if signal_interval.is_zero() {
        return Err(HeartbeatError::InvalidInterval);
    }
    if ack_timeout.is_zero() {
        return Err(HeartbeatError::InvalidAckTimeout);
    }
    Ok(())
}

async fn join_outstanding(outstanding: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match outstanding {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};

    const INTERVAL: Duration = Duration::from_millis(50);
    const ACK: Duration = Duration::from_millis(200);

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        assert_or_retry_for_duration(check, Duration::from_secs(5)).await
    }

    async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !check() && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check())
    }

    /// Asserts `check` holds on every sample taken over `period`.
    async fn assert_holds_for<F>(check: F, period: Duration)
    where
        F: Fn() -> bool,
    {
        let until = Instant::now() + period;
        while Instant::now() < until {
            assert!(check());
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Probe that blocks while `stuck` is set, until a release is sent or
    /// the sender is dropped.
    struct StickyProbe {
        stuck: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        release: mpsc::Sender<()>,
    }

    impl StickyProbe {
        fn install(monitor: &HeartbeatMonitor, stuck: bool) -> Self {
            let (release, gate) = mpsc::channel::<()>();
            let gate = Mutex::new(gate);
            let stuck = Arc::new(AtomicBool::new(stuck));
            let calls = Arc::new(AtomicUsize::new(0));

            let (probe_stuck, probe_calls) = (stuck.clone(), calls.clone());
            monitor.set_callback(move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                if probe_stuck.load(Ordering::SeqCst) {
                    drop(gate.lock().unwrap().recv());
                }
            });

            Self {
                stuck,
                calls,
                release,
            }
        }
    }

    #[tokio::test]
    async fn defaults_to_not_alive() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        assert!(!monitor.is_alive());
        assert_eq!(monitor.state(), MonitorState::Uninitialized);

        monitor.set_callback(|| {});
        assert!(!monitor.is_alive());
        assert_eq!(monitor.state(), MonitorState::Configured);
    }

    #[tokio::test]
    async fn start_requires_a_callback() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        assert_eq!(monitor.start(), Err(HeartbeatError::MissingCallback));
        assert_eq!(monitor.state(), MonitorState::Uninitialized);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        monitor.set_callback(|| {});
        assert_eq!(monitor.start(), Ok(()));
        assert_eq!(monitor.start(), Err(HeartbeatError::AlreadyStarted));
        assert_eq!(monitor.state(), MonitorState::Running);
        root.cancel();
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        monitor.set_callback(|| {});
        assert_eq!(monitor.start(), Err(HeartbeatError::NoRuntime));
        assert_eq!(monitor.state(), MonitorState::Configured);
    }

    #[tokio::test]
    async fn zero_timing_is_rejected_before_spawning() {
        let root = CancellationToken::new();

        let monitor = HeartbeatMonitor::new(&root, Duration::ZERO, ACK);
        monitor.set_callback(|| {});
        assert_eq!(monitor.start(), Err(HeartbeatError::InvalidInterval));
        assert_eq!(monitor.state(), MonitorState::Configured);
        // nothing was spawned, so there is no loop to wait for
        time::timeout(Duration::from_secs(1), monitor.stopped())
            .await
            .unwrap();

        let monitor = HeartbeatMonitor::new(&root, INTERVAL, Duration::ZERO);
        monitor.set_callback(|| {});
        assert_eq!(monitor.start(), Err(HeartbeatError::InvalidAckTimeout));
        assert_eq!(monitor.state(), MonitorState::Configured);
        assert!(!monitor.is_alive());
    }

    #[tokio::test]
    async fn only_first_callback_is_kept() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        monitor.set_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        monitor.set_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        monitor.start().unwrap();

        assert_or_retry(|| first.load(Ordering::SeqCst) >= 2).await;
        assert_eq!(second.load(Ordering::SeqCst), 0);
        root.cancel();
    }

    #[tokio::test]
    async fn prompt_probe_keeps_monitor_alive() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let probe = StickyProbe::install(&monitor, false);
        monitor.start().unwrap();

        // Not alive before the first tick has been acknowledged
        assert!(!monitor.is_alive());

        assert_or_retry(|| monitor.is_alive()).await;
        assert_holds_for(|| monitor.is_alive(), INTERVAL * 8).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 8);
        root.cancel();
    }

    #[tokio::test]
    async fn stuck_probe_flips_to_not_alive() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let probe = StickyProbe::install(&monitor, false);
        monitor.start().unwrap();
        assert_or_retry(|| monitor.is_alive()).await;

        probe.stuck.store(true, Ordering::SeqCst);
        let wedged_at = Instant::now();
        let calls_before = probe.calls.load(Ordering::SeqCst);

        assert_or_retry(|| !monitor.is_alive()).await;
        // The wedged probe is issued at most one interval after the switch,
        // and the verdict only flips after its full acknowledgment window.
        assert!(wedged_at.elapsed() >= ACK - INTERVAL);
        assert!(wedged_at.elapsed() < ACK + INTERVAL * 4);

        // No new probes are issued while one is outstanding, and the verdict stays down
        let calls_wedged = probe.calls.load(Ordering::SeqCst);
        assert!(calls_wedged <= calls_before + 1);
        assert_holds_for(|| !monitor.is_alive(), ACK * 2).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls_wedged);

        root.cancel();
        drop(probe.release);
    }

    #[tokio::test]
    async fn wedged_first_probe_is_never_alive() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let probe = StickyProbe::install(&monitor, true);
        monitor.start().unwrap();

        assert_holds_for(|| !monitor.is_alive(), INTERVAL + ACK * 2).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        root.cancel();
        drop(probe.release);
    }

    #[tokio::test]
    async fn late_probe_recovers_on_next_tick() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let probe = StickyProbe::install(&monitor, true);
        monitor.start().unwrap();

        assert_or_retry(|| probe.calls.load(Ordering::SeqCst) == 1).await;
        time::sleep(ACK + INTERVAL).await;
        assert!(!monitor.is_alive());

        probe.stuck.store(false, Ordering::SeqCst);
        probe.release.send(()).unwrap();

        assert_or_retry(|| monitor.is_alive()).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        root.cancel();
    }

    #[tokio::test]
    async fn panicking_probe_is_not_alive() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.set_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("probe exploded");
        });
        monitor.start().unwrap();

        assert_or_retry(|| calls.load(Ordering::SeqCst) >= 3).await;
        assert!(!monitor.is_alive());
        assert_eq!(monitor.state(), MonitorState::Running);
        root.cancel();
    }

    #[tokio::test]
    async fn cancellation_freezes_the_verdict() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        let probe = StickyProbe::install(&monitor, false);
        monitor.start().unwrap();
        assert_or_retry(|| monitor.is_alive()).await;

        root.cancel();
        time::timeout(Duration::from_secs(1), monitor.stopped())
            .await
            .expect("ticking loop did not stop");
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!monitor.is_active());

        // No more ticks, and the last verdict survives well past the ack window
        let calls = probe.calls.load(Ordering::SeqCst);
        assert_holds_for(|| monitor.is_alive(), ACK * 2).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn stopped_resolves_immediately_when_never_started() {
        let root = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&root, INTERVAL, ACK);
        time::timeout(Duration::from_millis(100), monitor.stopped())
            .await
            .expect("stopped() should not wait for a loop that never ran");
    }
}
