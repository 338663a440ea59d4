use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::export::SessionExporter;
use crate::models::{ConnectionState, EventKind, SessionData, SessionEvent, SessionMode};
use crate::task::TaskHandle;

const TICK: Duration = Duration::from_secs(1);
const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Started(SessionMode),
    Tick { duration_secs: u64 },
    Event(SessionEvent),
    Ended { duration_secs: u64 },
}

type ForceUpdateCallback = Arc<dyn Fn(u64) + Send + Sync>;

struct ActiveSession {
    generation: u64,
    started: Instant,
    data: SessionData,
    ticker: TaskHandle,
}

#[derive(Default)]
struct SessionSlots {
    current: Option<ActiveSession>,
    last: Option<SessionData>,
    generation: u64,
}

struct Inner {
    slots: Mutex<SessionSlots>,
    exporter: Arc<dyn SessionExporter>,
    connectivity: watch::Receiver<ConnectionState>,
    updates: broadcast::Sender<SessionUpdate>,
    force_update: Mutex<Option<ForceUpdateCallback>>,
    torn_down: AtomicBool,
}

/// Owns the single logged session: at most one active at a time, events
/// appended only while active, data frozen and exported when it ends.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn event(kind: EventKind, title: impl Into<String>, detail: impl Into<String>) -> SessionEvent {
    SessionEvent {
        timestamp: Utc::now(),
        kind,
        title: title.into(),
        detail: detail.into(),
    }
}

fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl SessionManager {
    pub fn new(exporter: Arc<dyn SessionExporter>, connectivity: watch::Receiver<ConnectionState>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(SessionSlots::default()),
                exporter,
                connectivity,
                updates,
                force_update: Mutex::new(None),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, SessionSlots> {
        self.inner.slots()
    }

    /// Starts a session even when the device is unreachable; it is then
    /// logged in [`SessionMode::Offline`].
    pub fn start_session(&self) -> Result<SessionData, SessionError> {
        if self.inner.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        let mode = if self.inner.connectivity.borrow().is_connected() {
            SessionMode::Online
        } else {
            SessionMode::Offline
        };

        let mut slots = self.slots();
        if slots.current.is_some() {
            return Err(SessionError::SessionAlreadyActive);
        }

        let detail = match mode {
            SessionMode::Online => "Device connected",
            SessionMode::Offline => "Device not connected; commands will not be dispatched",
        };
        let data = SessionData {
            start_time: Utc::now(),
            end_time: None,
            duration_secs: 0,
            mode,
            events: vec![event(EventKind::Session, "Session Started", detail)],
        };

        slots.generation += 1;
        let generation = slots.generation;
        let ticker = self.spawn_ticker(generation);
        slots.current = Some(ActiveSession {
            generation,
            started: Instant::now(),
            data: data.clone(),
            ticker,
        });
        drop(slots);

        info!(?mode, "Session started");
        let _ = self.inner.updates.send(SessionUpdate::Started(mode));
        Ok(data)
    }

    /// Freezes the session and hands it to the exporter without waiting for it.
    pub fn end_session(&self) -> Result<SessionData, SessionError> {
        if self.inner.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        let mut slots = self.slots();
        let Some(mut session) = slots.current.take() else {
            return Err(SessionError::NoActiveSession);
        };
        session.ticker.cancel();

        let duration_secs = session
            .data
            .duration_secs
            .max(session.started.elapsed().as_secs());
        let mut data = session.data;
        data.duration_secs = duration_secs;
        data.events.push(event(
            EventKind::Session,
            "Session Ended",
            format!("Duration {}", format_duration(duration_secs)),
        ));
        data.end_time = Some(Utc::now());
        slots.last = Some(data.clone());
        drop(slots);

        info!(duration_secs, events = data.events.len(), "Session ended");
        let _ = self.inner.updates.send(SessionUpdate::Ended { duration_secs });

        let exporter = Arc::clone(&self.inner.exporter);
        let snapshot = data.clone();
        tokio::spawn(async move {
            if let Err(e) = exporter.export_session(snapshot).await {
                error!("Session export failed: {:#}", e);
            }
        });
        Ok(data)
    }

    /// Returns `false` when no session is active; the alert is dropped.
    pub fn add_session_alert(&self, kind: EventKind, title: &str, detail: &str) -> bool {
        if self.inner.is_torn_down() {
            return false;
        }
        let mut slots = self.slots();
        let Some(session) = slots.current.as_mut() else {
            debug!(title, "alert dropped, no active session");
            return false;
        };
        let entry = event(kind, title, detail);
        session.data.events.push(entry.clone());
        drop(slots);

        let _ = self.inner.updates.send(SessionUpdate::Event(entry));
        true
    }

    pub fn is_active(&self) -> bool {
        self.slots().current.is_some()
    }

    pub fn current(&self) -> Option<SessionData> {
        self.slots().current.as_ref().map(|s| s.data.clone())
    }

    pub fn last_session(&self) -> Option<SessionData> {
        self.slots().last.clone()
    }

    pub fn duration_secs(&self) -> u64 {
        let slots = self.slots();
        match (&slots.current, &slots.last) {
            (Some(session), _) => session.data.duration_secs,
            (None, Some(last)) => last.duration_secs,
            (None, None) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }

    /// Single-slot tick callback; registering again replaces the previous one.
    /// Prefer [`SessionManager::subscribe`] when several listeners need ticks.
    pub fn register_force_update_callback<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.inner.force_update() = Some(Arc::new(callback));
    }

    pub fn clear_force_update_callback(&self) {
        self.inner.force_update().take();
    }

    /// Rejects every later mutation. An active session is discarded without
    /// being exported.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let discarded = self.slots().current.take();
        if let Some(mut session) = discarded {
            session.ticker.cancel();
            warn!(
                duration_secs = session.data.duration_secs,
                events = session.data.events.len(),
                "Active session discarded at teardown"
            );
        }
        self.clear_force_update_callback();
        info!("Session manager torn down");
    }

    fn spawn_ticker(&self, generation: u64) -> TaskHandle {
        let inner = Arc::downgrade(&self.inner);
        TaskHandle::spawn("session-ticker", move |cancel| async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if cancel.is_cancelled() || !Inner::tick(&inner, generation) {
                    break;
                }
            }
        })
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, SessionSlots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn force_update(&self) -> MutexGuard<'_, Option<ForceUpdateCallback>> {
        self.force_update.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Returns `false` once the ticker should stop.
    fn tick(weak: &Weak<Inner>, generation: u64) -> bool {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        if inner.is_torn_down() {
            return false;
        }

        let duration_secs = {
            let mut slots = inner.slots();
            let Some(session) = slots.current.as_mut().filter(|s| s.generation == generation) else {
                return false;
            };
            let elapsed = session.started.elapsed().as_secs();
            session.data.duration_secs = session.data.duration_secs.max(elapsed);
            session.data.duration_secs
        };

        let _ = inner.updates.send(SessionUpdate::Tick { duration_secs });
        // Released before the call so the callback may re-register or clear itself.
        let callback = inner.force_update().clone();
        if let Some(callback) = callback {
            callback(duration_secs);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectionStatus;
    use crate::testing::RecordingExporter;
    use std::sync::atomic::AtomicU64;

    fn manager(exporter: Arc<RecordingExporter>) -> (SessionManager, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::default());
        (SessionManager::new(exporter, rx), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_side_effects() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        let first = sessions.start_session().unwrap();

        assert_eq!(sessions.start_session(), Err(SessionError::SessionAlreadyActive));
        assert_eq!(sessions.current().unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn end_without_session_fails() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        assert_eq!(sessions.end_session(), Err(SessionError::NoActiveSession));
        assert!(sessions.last_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exported_log_is_start_alert_end() {
        let exporter = Arc::new(RecordingExporter::default());
        let (sessions, _conn) = manager(exporter.clone());

        sessions.start_session().unwrap();
        assert!(sessions.add_session_alert(EventKind::Info, "X", "Y"));
        sessions.end_session().unwrap();
        exporter.notify.notified().await;

        let exported = exporter.exported();
        assert_eq!(exported.len(), 1);
        let titles: Vec<_> = exported[0].events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Session Started", "X", "Session Ended"]);
        assert_eq!(exported[0].events[1].detail, "Y");
        assert!(exported[0]
            .events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_ticks_then_freezes() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        sessions.start_session().unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(sessions.duration_secs(), 3);

        let ended = sessions.end_session().unwrap();
        assert_eq!(ended.duration_secs, 3);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sessions.duration_secs(), 3);
        assert_eq!(sessions.last_session().unwrap().duration_secs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn alerts_while_idle_are_dropped() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        assert!(!sessions.add_session_alert(EventKind::Warning, "early", ""));

        sessions.start_session().unwrap();
        assert_eq!(sessions.current().unwrap().events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_update_slot_is_replaced() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        let old = Arc::new(AtomicU64::new(0));
        let new = Arc::new(AtomicU64::new(0));

        let counter = old.clone();
        sessions.register_force_update_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sessions.start_session().unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(old.load(Ordering::SeqCst), 2);

        let counter = new.clone();
        sessions.register_force_update_callback(move |secs| {
            counter.store(secs, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(old.load(Ordering::SeqCst), 2);
        assert_eq!(new.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_callback_can_clear_itself() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let handle = sessions.clone();
        sessions.register_force_update_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            handle.clear_force_update_callback();
        });
        sessions.start_session().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.duration_secs(), 3);

        let counter = hits.clone();
        let handle = sessions.clone();
        sessions.register_force_update_callback(move |secs| {
            counter.store(secs * 10, Ordering::SeqCst);
            handle.register_force_update_callback(|_| {});
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 40);
        assert_eq!(sessions.duration_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_lifecycle_and_ticks() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        let mut updates = sessions.subscribe();

        sessions.start_session().unwrap();
        assert_eq!(updates.recv().await.unwrap(), SessionUpdate::Started(SessionMode::Offline));
        assert_eq!(updates.recv().await.unwrap(), SessionUpdate::Tick { duration_secs: 1 });

        sessions.end_session().unwrap();
        assert_eq!(updates.recv().await.unwrap(), SessionUpdate::Ended { duration_secs: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn connected_device_starts_online_session() {
        let (sessions, conn) = manager(Arc::new(RecordingExporter::default()));
        conn.send_replace(ConnectionState {
            detection_status: DetectionStatus::Connected,
            ..ConnectionState::default()
        });

        assert_eq!(sessions.start_session().unwrap().mode, SessionMode::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_export_does_not_reopen_session() {
        let exporter = Arc::new(RecordingExporter::failing());
        let (sessions, _conn) = manager(exporter.clone());

        sessions.start_session().unwrap();
        sessions.end_session().unwrap();
        exporter.notify.notified().await;

        assert!(!sessions.is_active());
        assert!(sessions.last_session().unwrap().end_time.is_some());
        assert!(sessions.start_session().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_rejects_mutations() {
        let exporter = Arc::new(RecordingExporter::default());
        let (sessions, _conn) = manager(exporter.clone());
        sessions.start_session().unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        sessions.teardown();

        assert_eq!(sessions.start_session(), Err(SessionError::TornDown));
        assert_eq!(sessions.end_session(), Err(SessionError::TornDown));
        assert!(!sessions.add_session_alert(EventKind::Info, "late", ""));
        assert!(exporter.exported().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_discards_the_active_session() {
        let (sessions, _conn) = manager(Arc::new(RecordingExporter::default()));
        sessions.start_session().unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        sessions.teardown();

        assert!(!sessions.is_active());
        assert!(sessions.current().is_none());
        assert!(sessions.last_session().is_none());

        let mut updates = sessions.subscribe();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
