use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::detector::Detector;
use crate::error::{DetectError, ErrorKind};
use crate::models::ConnectionState;
use crate::task::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    Idle,
    Probing,
    Connected,
    Backoff,
    /// Permissions are missing; no probes run until they are granted.
    Blocked,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Init,
    Manual,
    Timer,
    CommandFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshOutcome {
    Connected,
    Disconnected,
    /// Another cycle was already in flight.
    Coalesced,
    Blocked,
    /// The scheduler was torn down before or during the cycle.
    Inactive,
}

/// Resets the in-flight flag when a cycle ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    detector: Detector,
    config: SchedulerConfig,
    app_endpoints: Vec<String>,
    active: AtomicBool,
    in_flight: AtomicBool,
    state: watch::Sender<ConnectionState>,
    phase: watch::Sender<SchedulerPhase>,
    /// Cancelled on teardown; every cycle races its awaits against it.
    cancel: Mutex<CancellationToken>,
    timer: Mutex<Option<TaskHandle>>,
    command_cycle: Mutex<Option<TaskHandle>>,
}

/// Drives detection cycles: on init, on demand, and on a timer whose period
/// depends on whether the device is currently connected.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(detector: Detector, config: SchedulerConfig, app_endpoints: Vec<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        let (phase, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                detector,
                config,
                app_endpoints,
                active: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                state,
                phase,
                cancel: Mutex::new(CancellationToken::new()),
                timer: Mutex::new(None),
                command_cycle: Mutex::new(None),
            }),
        }
    }

    /// Starts the periodic loop, which runs its first cycle immediately.
    pub fn init(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = {
            let mut cancel = lock(&self.inner.cancel);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };
        info!(
            endpoints = ?self.inner.app_endpoints,
            rounds = self.inner.config.rounds,
            "Connection scheduler started"
        );

        let inner = Arc::clone(&self.inner);
        let timer = TaskHandle::spawn_child("connection-timer", &token, move |cancel| async move {
            let mut trigger = Trigger::Init;
            loop {
                let blocked = *inner.phase.borrow() == SchedulerPhase::Blocked;
                if !blocked || inner.detector.has_permissions() {
                    inner.run_cycle(trigger).await;
                }
                trigger = Trigger::Timer;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.next_delay()) => {}
                }
                if !inner.is_active() {
                    break;
                }
            }
        });
        *lock(&self.inner.timer) = Some(timer);
    }

    /// Stops the timer and cancels every cycle still in flight, including
    /// manual refreshes and command-failure re-probes.
    pub fn teardown(&self) {
        // The flag flips under the phase lock so no phase lands after `Stopped`.
        let mut stopped = false;
        self.inner.phase.send_if_modified(|phase| {
            stopped = self.inner.active.swap(false, Ordering::SeqCst);
            if stopped {
                *phase = SchedulerPhase::Stopped;
            }
            stopped
        });
        if !stopped {
            return;
        }
        lock(&self.inner.cancel).cancel();
        for slot in [&self.inner.timer, &self.inner.command_cycle] {
            if let Some(mut task) = lock(slot).take() {
                task.cancel();
            }
        }
        info!("Connection scheduler stopped");
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub async fn request_cycle(&self, trigger: Trigger) -> RefreshOutcome {
        self.inner.run_cycle(trigger).await
    }

    /// Manual refresh. `true` only if this call ran a cycle that ended connected.
    pub async fn refresh_connection(&self) -> bool {
        self.request_cycle(Trigger::Manual).await == RefreshOutcome::Connected
    }

    /// Hint from the control side that a command did not get through.
    pub fn report_command_failure(&self, reason: &str) {
        if !self.is_active() {
            return;
        }
        let mut slot = lock(&self.inner.command_cycle);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(reason, "command-failure re-probe already pending");
            return;
        }
        warn!(reason, "Command failure reported, re-probing device");
        let inner = Arc::clone(&self.inner);
        let token = lock(&self.inner.cancel).clone();
        *slot = Some(TaskHandle::spawn_child("command-failure-cycle", &token, move |_| async move {
            inner.run_cycle(Trigger::CommandFailure).await;
        }));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SchedulerPhase> {
        self.inner.phase.subscribe()
    }

    pub fn detector(&self) -> &Detector {
        &self.inner.detector
    }
}

/// `None` if `cancel` fired before `fut` completed.
async fn unless_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn next_delay(&self) -> Duration {
        let millis = match *self.phase.borrow() {
            SchedulerPhase::Connected => self.config.health_check_interval_ms,
            _ => self.config.retry_interval_ms,
        };
        Duration::from_millis(millis)
    }

    /// The active flag is read under the channel's lock, so a write either
    /// lands before teardown or not at all.
    fn set_phase(&self, phase: SchedulerPhase) -> bool {
        let mut applied = false;
        self.phase.send_if_modified(|current| {
            if !self.is_active() {
                return false;
            }
            applied = true;
            if *current == phase {
                return false;
            }
            info!("Connection phase {:?} -> {:?}", *current, phase);
            *current = phase;
            true
        });
        applied
    }

    fn publish(&self, state: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|current| {
            if !self.is_active() {
                return false;
            }
            *current = state;
            applied = true;
            true
        });
        applied
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }


    fn block(&self) -> RefreshOutcome {
        let network_info = self.state.borrow().network_info.clone();
        if !self.publish(ConnectionState::errored(ErrorKind::PermissionDenied, network_info))
            || !self.set_phase(SchedulerPhase::Blocked)
        {
            return RefreshOutcome::Inactive;
        }
        warn!("Detection blocked: required permissions missing");
        RefreshOutcome::Blocked
    }

    async fn pause(&self, cancel: &CancellationToken, millis: u64) -> bool {
        if millis > 0 {
            let sleep = tokio::time::sleep(Duration::from_millis(millis));
            if unless_cancelled(cancel, sleep).await.is_none() {
                return false;
            }
        }
        self.is_active()
    }

    async fn run_cycle(&self, trigger: Trigger) -> RefreshOutcome {
        let cancel = self.cancel_token();
        if !self.is_active() || cancel.is_cancelled() {
            return RefreshOutcome::Inactive;
        }
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!(?trigger, "detection cycle already in flight");
            return RefreshOutcome::Coalesced;
        };
        if !self.detector.has_permissions() {
            return self.block();
        }

        debug!(?trigger, "detection cycle starting");
        let checking = self.state.borrow().checking();
        if !self.publish(checking) || !self.set_phase(SchedulerPhase::Probing) {
            return RefreshOutcome::Inactive;
        }

        let mut last: Option<ConnectionState> = None;
        'rounds: for round in 0..self.config.rounds.max(1) {
            if round > 0 && !self.pause(&cancel, self.config.round_delay_ms).await {
                return RefreshOutcome::Inactive;
            }
            for (i, endpoint) in self.app_endpoints.iter().enumerate() {
                if i > 0 && !self.pause(&cancel, self.config.endpoint_delay_ms).await {
                    return RefreshOutcome::Inactive;
                }

                let detected = unless_cancelled(&cancel, self.detector.detect(endpoint)).await;
                let state = match detected {
                    Some(Ok(state)) => state,
                    Some(Err(DetectError::PermissionDenied)) => return self.block(),
                    None => {
                        debug!(endpoint = %endpoint, "detection cancelled by teardown");
                        return RefreshOutcome::Inactive;
                    }
                };
                if !self.is_active() {
                    debug!("discarding detection result after teardown");
                    return RefreshOutcome::Inactive;
                }

                let connected = state.is_connected();
                let link_ok = state.is_link_ok;
                last = Some(state);
                if connected {
                    break 'rounds;
                }
                // Retrying the device makes no sense while on the wrong network.
                if !link_ok {
                    break 'rounds;
                }
            }
            debug!(round = round + 1, "detection round failed");
        }

        let state = last.unwrap_or_else(|| ConnectionState::errored(ErrorKind::NetworkFailure, None));
        let connected = state.is_connected();
        let quality = state.connection_quality;
        if !self.publish(state) {
            return RefreshOutcome::Inactive;
        }

        let phase = if connected {
            SchedulerPhase::Connected
        } else {
            SchedulerPhase::Backoff
        };
        if !self.set_phase(phase) {
            return RefreshOutcome::Inactive;
        }
        if connected {
            RefreshOutcome::Connected
        } else {
            debug!(?quality, retry_ms = self.config.retry_interval_ms, "device not ready, backing off");
            RefreshOutcome::Disconnected
        }
    }
}
