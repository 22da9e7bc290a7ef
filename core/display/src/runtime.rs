//! Display event loop.
//!
//! Everything that changes what a screen shows arrives as a [`RuntimeEvent`] on
//! one channel: broadcast frames from the subscription thread, operator input,
//! and results from short-lived extension worker threads. A single tick
//! deadline drives time-based work: the slow re-check while locked and the
//! one-second countdown while unlocked.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use baylock_core::{
    fitting_options, gap_until_next, session_event, should_trigger, ActiveSession, BookingStore,
    ExtensionFlow, LockReconciler, ManualOverride, Transition,
};
use baylock_protocol::{
    AccessAction, Broadcast, BroadcastFrame, DisplayConfig, ExtendResult, ExtensionOptions,
    Snapshot,
};
use chrono::{Duration, Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::daemon_client::DaemonApi;
use crate::surface::DisplaySurface;

const COUNTDOWN_TICK_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInput {
    Select(u32),
    Confirm,
    Dismiss,
    Quit,
}

#[derive(Debug)]
pub enum RuntimeEvent {
    Frame(BroadcastFrame),
    Resynced(Snapshot),
    Disconnected(String),
    Input(UserInput),
    OptionsLoaded {
        booking_id: String,
        result: Result<ExtensionOptions, String>,
    },
    Extended {
        booking_id: String,
        minutes: u32,
        result: Result<ExtendResult, String>,
    },
}

pub struct DisplayRuntime<S: DisplaySurface> {
    display_id: u32,
    primary: bool,
    config: Option<DisplayConfig>,
    store: BookingStore,
    manual: ManualOverride,
    last_seq: Option<u64>,
    reconciler: LockReconciler,
    flow: ExtensionFlow,
    daemon: Arc<dyn DaemonApi>,
    surface: S,
    events: Sender<RuntimeEvent>,
}

impl<S: DisplaySurface> DisplayRuntime<S> {
    /// `primary` displays start the extension prompt; the others mirror it.
    pub fn new(
        display_id: u32,
        primary: bool,
        daemon: Arc<dyn DaemonApi>,
        surface: S,
        events: Sender<RuntimeEvent>,
    ) -> Self {
        Self {
            display_id,
            primary,
            config: None,
            store: BookingStore::new(),
            manual: ManualOverride::inactive(),
            last_seq: None,
            reconciler: LockReconciler::new(),
            flow: ExtensionFlow::new(),
            daemon,
            surface,
            events,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn store(&self) -> &BookingStore {
        &self.store
    }

    pub fn reconciler(&self) -> &LockReconciler {
        &self.reconciler
    }

    pub fn flow(&self) -> &ExtensionFlow {
        &self.flow
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Current tick period, derived from the lock state.
    pub fn tick_interval(&self) -> StdDuration {
        match self.reconciler.is_locked() {
            Some(false) => StdDuration::from_secs(COUNTDOWN_TICK_SECS),
            _ => StdDuration::from_secs(
                self.config
                    .as_ref()
                    .map(|c| c.recheck_secs.max(1))
                    .unwrap_or(5),
            ),
        }
    }

    /// Runs until `rx` disconnects or the operator quits.
    pub fn run(&mut self, rx: Receiver<RuntimeEvent>) {
        let mut next_tick = Instant::now() + self.tick_interval();
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            let was_locked = self.reconciler.is_locked();
            match rx.recv_timeout(wait) {
                Ok(RuntimeEvent::Input(UserInput::Quit)) => {
                    info!(display_id = self.display_id, "Display runtime stopping");
                    return;
                }
                Ok(event) => self.handle(event, now()),
                Err(RecvTimeoutError::Timeout) => {
                    self.tick(now());
                    next_tick = Instant::now() + self.tick_interval();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
            if self.reconciler.is_locked() != was_locked {
                next_tick = Instant::now() + self.tick_interval();
            }
        }
    }

    pub fn handle(&mut self, event: RuntimeEvent, now: NaiveDateTime) {
        match event {
            RuntimeEvent::Frame(frame) => self.on_frame(frame, now),
            RuntimeEvent::Resynced(snapshot) => {
                self.apply_snapshot(snapshot);
                self.reconcile(now);
            }
            RuntimeEvent::Disconnected(reason) => {
                warn!(display_id = self.display_id, reason = %reason, "Lost daemon subscription; running on local copy");
            }
            RuntimeEvent::Input(input) => self.on_input(input, now),
            RuntimeEvent::OptionsLoaded { booking_id, result } => {
                self.on_options(&booking_id, result, now)
            }
            RuntimeEvent::Extended {
                booking_id,
                minutes,
                result,
            } => self.on_extended(&booking_id, minutes, result, now),
        }
    }

    /// Time-based work: countdown, relock at zero, re-check, extension timers.
    pub fn tick(&mut self, now: NaiveDateTime) {
        if let Some(session) = self.reconciler.active_session() {
            if session.has_elapsed(now) {
                let transition = self.reconciler.force_lock();
                info!(display_id = self.display_id, "Countdown reached zero");
                self.apply_transition(transition, now);
                // A back-to-back booking takes over at the same instant.
                self.reconcile(now);
            } else if let Some(remaining) = session.remaining(now) {
                self.surface.update_countdown(remaining);
            }
        } else {
            self.reconcile(now);
        }

        if let Some(settings) = self.config.as_ref().map(|c| c.extension.clone()) {
            let display_for = Duration::seconds(settings.result_display_secs as i64);
            if self.flow.expire(now, display_for) {
                self.surface.show_extension(&self.flow.snapshot(None));
            }
            if self.primary
                && should_trigger(
                    &settings,
                    &self.flow,
                    self.reconciler.active_session(),
                    self.store.bookings(),
                    now,
                )
            {
                self.start_extension(now);
            }
        }
    }

    fn on_frame(&mut self, frame: BroadcastFrame, now: NaiveDateTime) {
        if let Some(last) = self.last_seq {
            if frame.seq <= last {
                debug!(seq = frame.seq, last, "Ignoring replayed broadcast");
                return;
            }
            if frame.seq > last + 1 {
                warn!(seq = frame.seq, last, "Broadcast gap; resyncing");
                self.resync(now);
                return;
            }
        }
        self.last_seq = Some(frame.seq);

        match frame.message {
            Broadcast::BookingsSnapshot { loaded, bookings } => {
                if loaded {
                    self.store.replace_all(bookings);
                } else {
                    self.store.clear();
                }
            }
            Broadcast::BookingDelta { action, booking } => self.store.apply_delta(action, booking),
            Broadcast::OverrideChanged { state } => {
                self.manual = ManualOverride::from_wire(&state);
            }
            Broadcast::ExtensionStateChanged { snapshot } => {
                if snapshot.origin_display != Some(self.display_id)
                    && self.flow.apply_remote(&snapshot, now)
                {
                    self.surface.show_extension(&snapshot);
                }
                return;
            }
            Broadcast::BringToFront => {
                self.surface.bring_to_front();
                return;
            }
        }
        self.reconcile(now);
    }

    fn resync(&mut self, now: NaiveDateTime) {
        match self.daemon.snapshot() {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot);
                self.reconcile(now);
            }
            Err(err) => {
                // Forget the position so the next frame is accepted as-is.
                warn!(error = %err, "Resync failed");
                self.last_seq = None;
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        info!(
            display_id = self.display_id,
            seq = snapshot.seq,
            bookings = snapshot.bookings.len(),
            "Applied daemon snapshot"
        );
        if snapshot.config.is_some() {
            self.config = snapshot.config;
        }
        if snapshot.loaded {
            self.store.replace_all(snapshot.bookings);
        } else {
            self.store.clear();
        }
        self.manual = ManualOverride::from_wire(&snapshot.override_state);
        self.last_seq = Some(snapshot.seq);
    }

    fn reconcile(&mut self, now: NaiveDateTime) {
        let bay_id = self.config.as_ref().map(|c| c.bay_id.clone());
        let transition = self
            .reconciler
            .reconcile(bay_id.as_deref(), &self.store, &self.manual, now);
        self.apply_transition(transition, now);
    }

    fn apply_transition(&mut self, transition: Transition, now: NaiveDateTime) {
        match &transition {
            Transition::Uninitialized | Transition::None => return,
            Transition::Locked { .. } => {
                info!(display_id = self.display_id, "Bay locked");
                self.surface.show_locked();
                self.surface.bring_to_front();
            }
            Transition::Unlocked { started } => {
                info!(display_id = self.display_id, session = ?started, "Bay unlocked");
                self.surface.show_unlocked(started, started.remaining(now));
            }
            Transition::SessionChanged { started, .. } => {
                info!(display_id = self.display_id, session = ?started, "Session changed");
                self.surface.show_unlocked(started, started.remaining(now));
            }
            Transition::SessionUpdated { session } => {
                debug!(display_id = self.display_id, "Session updated in place");
                if let Some(remaining) = session.remaining(now) {
                    self.surface.update_countdown(remaining);
                }
            }
        }

        if let Some(ended) = transition.ended() {
            self.report(AccessAction::SessionEnded, ended);
        }
        if let Some(started) = transition.started() {
            self.report(AccessAction::SessionStarted, started);
        }

        if self.flow.sync_with_session(self.reconciler.active_session()) {
            self.surface.show_extension(&self.flow.snapshot(None));
        }
    }

    fn report(&self, action: AccessAction, session: &ActiveSession) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        let Some(event) = session_event(action, session, &config.bay_id, &config.location_id)
        else {
            return;
        };
        if let Err(err) = self.daemon.log_access(&event) {
            warn!(error = %err, action = ?action, "Failed to report access event");
        }
    }

    fn on_input(&mut self, input: UserInput, now: NaiveDateTime) {
        let changed = match input {
            UserInput::Select(minutes) => self.flow.select(minutes, now),
            UserInput::Dismiss => self.flow.dismiss(now),
            UserInput::Confirm => match self.flow.confirm(now) {
                Some((booking_id, minutes)) => {
                    self.spawn_extend(booking_id, minutes);
                    true
                }
                None => false,
            },
            UserInput::Quit => false,
        };
        if changed {
            self.publish_flow();
        } else {
            debug!(?input, stage = ?self.flow.stage(), "Input ignored");
        }
    }

    fn start_extension(&mut self, now: NaiveDateTime) {
        let Some(booking_id) = self.flow.booking_id().map(str::to_string) else {
            return;
        };
        if !self.flow.begin_loading(&booking_id, now) {
            return;
        }
        info!(booking_id = %booking_id, "Offering session extension");
        self.publish_flow();

        let daemon = Arc::clone(&self.daemon);
        let events = self.events.clone();
        thread::spawn(move || {
            let result = daemon.extension_options(&booking_id);
            let _ = events.send(RuntimeEvent::OptionsLoaded { booking_id, result });
        });
    }

    fn spawn_extend(&self, booking_id: String, minutes: u32) {
        info!(booking_id = %booking_id, minutes, "Extending session");
        let daemon = Arc::clone(&self.daemon);
        let events = self.events.clone();
        thread::spawn(move || {
            let result = daemon.extend_booking(&booking_id, minutes);
            let _ = events.send(RuntimeEvent::Extended {
                booking_id,
                minutes,
                result,
            });
        });
    }

    fn on_options(
        &mut self,
        booking_id: &str,
        result: Result<ExtensionOptions, String>,
        now: NaiveDateTime,
    ) {
        let changed = match result {
            Ok(offered) => {
                let gap = self
                    .reconciler
                    .active_session()
                    .and_then(ActiveSession::booking)
                    .filter(|booking| booking.id == booking_id)
                    .and_then(|booking| gap_until_next(booking, self.store.bookings(), now));
                let settings = self
                    .config
                    .as_ref()
                    .map(|c| c.extension.clone())
                    .unwrap_or_default();
                let options = fitting_options(&offered.options, &settings, gap);
                self.flow.options_loaded(booking_id, options, offered.card, now)
            }
            Err(err) => {
                warn!(booking_id, error = %err, "Failed to load extension options");
                self.flow.failed(booking_id, "Extension is unavailable right now", now)
            }
        };
        if changed {
            self.publish_flow();
        }
    }

    fn on_extended(
        &mut self,
        booking_id: &str,
        minutes: u32,
        result: Result<ExtendResult, String>,
        now: NaiveDateTime,
    ) {
        match result {
            Ok(outcome) => {
                if !self.flow.extend_succeeded(booking_id, now) {
                    debug!(booking_id, "Stale extension result ignored");
                    return;
                }
                info!(booking_id, minutes, "Session extended");
                let new_end = outcome
                    .booking
                    .as_ref()
                    .filter(|b| b.id == booking_id)
                    .map(|b| b.end_time.clone())
                    .or(outcome.new_end_time);
                self.publish_flow();
                if let Some(end) = new_end {
                    // Local echo until the daemon's delta lands.
                    self.store.set_end_time(booking_id, &end);
                    self.reconcile(now);
                }
            }
            Err(err) => {
                warn!(booking_id, minutes, error = %err, "Extension failed");
                if self.flow.failed(booking_id, err, now) {
                    self.publish_flow();
                }
            }
        }
    }

    fn publish_flow(&mut self) {
        let snapshot = self.flow.snapshot(Some(self.display_id));
        self.surface.show_extension(&snapshot);
        if let Err(err) = self.daemon.publish_extension_state(&snapshot) {
            warn!(error = %err, "Failed to publish extension state");
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use baylock_protocol::{
        AccessEvent, Booking, BookingStatus, CardInfo, DeltaAction, ExtensionOption,
        ExtensionSettings, ExtensionSnapshot, ExtensionStage, OverrideState,
    };
    use chrono::NaiveDate;
    use std::sync::mpsc;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Shown {
        Locked,
        Unlocked(String),
        Countdown(i64),
        Extension(ExtensionStage),
        Front,
    }

    #[derive(Default)]
    struct RecordingSurface {
        shown: Vec<Shown>,
    }

    impl DisplaySurface for RecordingSurface {
        fn show_locked(&mut self) {
            self.shown.push(Shown::Locked);
        }
        fn show_unlocked(&mut self, session: &ActiveSession, _remaining: Option<Duration>) {
            let label = session
                .booking()
                .map(|b| b.id.clone())
                .unwrap_or_else(|| "override".to_string());
            self.shown.push(Shown::Unlocked(label));
        }
        fn update_countdown(&mut self, remaining: Duration) {
            self.shown.push(Shown::Countdown(remaining.num_seconds()));
        }
        fn show_extension(&mut self, snapshot: &ExtensionSnapshot) {
            self.shown.push(Shown::Extension(snapshot.stage));
        }
        fn bring_to_front(&mut self) {
            self.shown.push(Shown::Front);
        }
    }

    #[derive(Default)]
    struct FakeDaemon {
        snapshot: Mutex<Snapshot>,
        access: Mutex<Vec<AccessEvent>>,
        published: Mutex<Vec<ExtensionSnapshot>>,
        options: Mutex<ExtensionOptions>,
        options_error: Mutex<Option<String>>,
        options_calls: Mutex<u32>,
    }

    impl DaemonApi for FakeDaemon {
        fn snapshot(&self) -> Result<Snapshot, String> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
        fn log_access(&self, event: &AccessEvent) -> Result<(), String> {
            self.access.lock().unwrap().push(event.clone());
            Ok(())
        }
        fn publish_extension_state(&self, snapshot: &ExtensionSnapshot) -> Result<(), String> {
            self.published.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
        fn extension_options(&self, _booking_id: &str) -> Result<ExtensionOptions, String> {
            *self.options_calls.lock().unwrap() += 1;
            match self.options_error.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(self.options.lock().unwrap().clone()),
            }
        }
        fn extend_booking(&self, _booking_id: &str, minutes: u32) -> Result<ExtendResult, String> {
            Ok(ExtendResult {
                success: true,
                booking: None,
                new_end_time: Some(format!("2:{:02} PM", minutes)),
            })
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn booking(id: &str, start: &str, end: &str) -> Booking {
        Booking {
            id: id.to_string(),
            bay_id: "bay-2".to_string(),
            user_id: Some("u-1".to_string()),
            start_time: start.to_string(),
            end_time: end.to_string(),
            status: BookingStatus::Confirmed,
            user_name: None,
        }
    }

    fn display_config() -> DisplayConfig {
        DisplayConfig {
            bay_id: "bay-2".to_string(),
            location_id: "loc-1".to_string(),
            recheck_secs: 5,
            extension: ExtensionSettings::default(),
        }
    }

    fn snapshot(seq: u64, bookings: Vec<Booking>) -> Snapshot {
        Snapshot {
            seq,
            config: Some(display_config()),
            loaded: true,
            bookings,
            override_state: OverrideState::default(),
        }
    }

    fn runtime(
        primary: bool,
    ) -> (
        DisplayRuntime<RecordingSurface>,
        Arc<FakeDaemon>,
        Receiver<RuntimeEvent>,
    ) {
        let daemon = Arc::new(FakeDaemon::default());
        let (tx, rx) = mpsc::channel();
        let rt = DisplayRuntime::new(0, primary, daemon.clone(), RecordingSurface::default(), tx);
        (rt, daemon, rx)
    }

    fn frame(seq: u64, message: Broadcast) -> RuntimeEvent {
        RuntimeEvent::Frame(BroadcastFrame { seq, message })
    }

    #[test]
    fn nothing_is_evaluated_before_config_arrives() {
        let (mut rt, _, _) = runtime(false);
        rt.tick(at(13, 30, 0));
        assert!(rt.reconciler().state().is_none());
        assert!(rt.surface().shown.is_empty());
    }

    #[test]
    fn snapshot_unlocks_and_reports_once() {
        let (mut rt, daemon, _) = runtime(false);
        let snap = snapshot(3, vec![booking("a", "1:00 PM", "2:00 PM")]);
        rt.handle(RuntimeEvent::Resynced(snap.clone()), at(13, 30, 0));
        rt.handle(RuntimeEvent::Resynced(snap), at(13, 30, 1));

        assert_eq!(rt.surface().shown, vec![Shown::Unlocked("a".to_string())]);
        let access = daemon.access.lock().unwrap();
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].action, AccessAction::SessionStarted);
        assert_eq!(rt.tick_interval(), StdDuration::from_secs(1));
    }

    #[test]
    fn countdown_zero_forces_lock() {
        let (mut rt, daemon, _) = runtime(false);
        rt.handle(
            RuntimeEvent::Resynced(snapshot(1, vec![booking("a", "1:00 PM", "2:00 PM")])),
            at(13, 59, 58),
        );
        rt.tick(at(13, 59, 59));
        rt.tick(at(14, 0, 0));

        assert_eq!(
            rt.surface().shown,
            vec![
                Shown::Unlocked("a".to_string()),
                Shown::Countdown(1),
                Shown::Locked,
                Shown::Front,
            ]
        );
        assert_eq!(rt.reconciler().is_locked(), Some(true));
        assert_eq!(daemon.access.lock().unwrap().len(), 2);
        assert_eq!(rt.tick_interval(), StdDuration::from_secs(5));
    }

    #[test]
    fn delta_frames_apply_in_order_and_gaps_resync() {
        let (mut rt, daemon, _) = runtime(false);
        rt.handle(RuntimeEvent::Resynced(snapshot(1, Vec::new())), at(15, 10, 0));
        assert_eq!(rt.surface().shown, vec![Shown::Locked, Shown::Front]);

        rt.handle(
            frame(
                2,
                Broadcast::BookingDelta {
                    action: DeltaAction::Add,
                    booking: booking("w", "3:00 PM", "4:00 PM"),
                },
            ),
            at(15, 10, 1),
        );
        assert_eq!(rt.reconciler().is_locked(), Some(false));

        // A replay of seq 2 is ignored.
        rt.handle(frame(2, Broadcast::BringToFront), at(15, 10, 2));
        assert_eq!(rt.last_seq(), Some(2));

        *daemon.snapshot.lock().unwrap() = snapshot(9, Vec::new());
        rt.handle(frame(4, Broadcast::BringToFront), at(15, 10, 3));
        assert_eq!(rt.last_seq(), Some(9));
        assert_eq!(rt.reconciler().is_locked(), Some(true));
    }

    #[test]
    fn override_frame_unlocks_without_access_events() {
        let (mut rt, daemon, _) = runtime(false);
        rt.handle(RuntimeEvent::Resynced(snapshot(1, Vec::new())), at(9, 0, 0));
        rt.handle(
            frame(
                2,
                Broadcast::OverrideChanged {
                    state: OverrideState {
                        unlocked: true,
                        end_time: None,
                    },
                },
            ),
            at(9, 0, 1),
        );
        assert_eq!(rt.reconciler().is_locked(), Some(false));
        assert!(daemon.access.lock().unwrap().is_empty());
    }

    fn offered_options() -> ExtensionOptions {
        ExtensionOptions {
            options: vec![
                ExtensionOption {
                    minutes: 15,
                    price_formatted: "$10.00".to_string(),
                },
                ExtensionOption {
                    minutes: 30,
                    price_formatted: "$20.00".to_string(),
                },
            ],
            card: Some(CardInfo {
                brand: "visa".to_string(),
                last4: "4242".to_string(),
            }),
        }
    }

    /// Drives a primary display from the trigger up to a confirmed 15 minute
    /// extension whose payment call is in flight.
    fn confirm_fifteen_minutes(
        rt: &mut DisplayRuntime<RecordingSurface>,
        daemon: &FakeDaemon,
        rx: &Receiver<RuntimeEvent>,
    ) {
        *daemon.options.lock().unwrap() = offered_options();
        rt.handle(
            RuntimeEvent::Resynced(snapshot(
                1,
                vec![
                    booking("a", "1:00 PM", "2:00 PM"),
                    booking("b", "2:20 PM", "3:00 PM"),
                ],
            )),
            at(13, 56, 0),
        );
        rt.tick(at(13, 56, 1));
        assert_eq!(rt.flow().stage(), ExtensionStage::Loading);

        let loaded = rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
        rt.handle(loaded, at(13, 56, 2));
        assert_eq!(rt.flow().stage(), ExtensionStage::Showing);
        // 30 minutes does not fit before the 2:20 booking.
        assert_eq!(rt.flow().options().len(), 1);

        rt.handle(RuntimeEvent::Input(UserInput::Select(15)), at(13, 56, 3));
        rt.handle(RuntimeEvent::Input(UserInput::Confirm), at(13, 56, 4));
        assert_eq!(rt.flow().stage(), ExtensionStage::Processing);
    }

    fn published_stages(daemon: &FakeDaemon) -> Vec<ExtensionStage> {
        daemon
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.stage)
            .collect()
    }

    #[test]
    fn primary_runs_extension_to_success() {
        let (mut rt, daemon, rx) = runtime(true);
        confirm_fifteen_minutes(&mut rt, &daemon, &rx);

        let extended = rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
        rt.handle(extended, at(13, 56, 5));
        assert_eq!(rt.store().get("a").unwrap().end_time, "2:15 PM");
        assert_eq!(rt.flow().stage(), ExtensionStage::Success);
        assert_eq!(rt.reconciler().is_locked(), Some(false));

        rt.tick(at(13, 56, 7));
        assert_eq!(rt.flow().stage(), ExtensionStage::Success);
        rt.tick(at(13, 56, 10));
        assert_eq!(rt.flow().stage(), ExtensionStage::Idle);

        assert_eq!(
            published_stages(&daemon),
            vec![
                ExtensionStage::Loading,
                ExtensionStage::Showing,
                ExtensionStage::Confirming,
                ExtensionStage::Processing,
                ExtensionStage::Success,
            ]
        );
    }

    #[test]
    fn success_survives_delta_arriving_before_payment_result() {
        let (mut rt, daemon, rx) = runtime(true);
        confirm_fifteen_minutes(&mut rt, &daemon, &rx);
        let extended = rx.recv_timeout(StdDuration::from_secs(5)).unwrap();

        rt.handle(
            frame(
                2,
                Broadcast::BookingDelta {
                    action: DeltaAction::Add,
                    booking: booking("a", "1:00 PM", "2:15 PM"),
                },
            ),
            at(13, 56, 5),
        );
        assert_eq!(rt.flow().stage(), ExtensionStage::Processing);

        rt.handle(extended, at(13, 56, 5));
        assert_eq!(rt.flow().stage(), ExtensionStage::Success);
        assert_eq!(
            published_stages(&daemon).last(),
            Some(&ExtensionStage::Success)
        );
        assert!(rt
            .surface()
            .shown
            .contains(&Shown::Extension(ExtensionStage::Success)));
    }

    #[test]
    fn failed_option_lookup_is_not_retried() {
        let (mut rt, daemon, rx) = runtime(true);
        *daemon.options_error.lock().unwrap() = Some("503".to_string());
        rt.handle(
            RuntimeEvent::Resynced(snapshot(1, vec![booking("a", "1:00 PM", "2:00 PM")])),
            at(13, 56, 0),
        );
        rt.tick(at(13, 56, 0));
        let failed = rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
        rt.handle(failed, at(13, 56, 1));
        assert_eq!(rt.flow().stage(), ExtensionStage::Declined);

        for second in (5..60).step_by(5) {
            rt.tick(at(13, 56, second));
        }
        assert_eq!(*daemon.options_calls.lock().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(rt.flow().stage(), ExtensionStage::Declined);
        assert_eq!(
            published_stages(&daemon),
            vec![ExtensionStage::Loading, ExtensionStage::Declined]
        );
    }

    #[test]
    fn back_to_back_booking_takes_over_at_countdown_zero() {
        let (mut rt, daemon, _) = runtime(false);
        rt.handle(
            RuntimeEvent::Resynced(snapshot(
                1,
                vec![
                    booking("a", "1:00 PM", "2:00 PM"),
                    booking("b", "2:00 PM", "3:00 PM"),
                ],
            )),
            at(13, 59, 59),
        );
        rt.tick(at(14, 0, 0));

        assert_eq!(
            rt.surface().shown,
            vec![
                Shown::Unlocked("a".to_string()),
                Shown::Locked,
                Shown::Front,
                Shown::Unlocked("b".to_string()),
            ]
        );
        assert_eq!(rt.reconciler().is_locked(), Some(false));
        let actions: Vec<AccessAction> = daemon
            .access
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AccessAction::SessionStarted,
                AccessAction::SessionEnded,
                AccessAction::SessionStarted,
            ]
        );
    }

    #[test]
    fn secondary_mirrors_but_never_triggers() {
        let (mut rt, daemon, _) = runtime(false);
        rt.handle(
            RuntimeEvent::Resynced(snapshot(1, vec![booking("a", "1:00 PM", "2:00 PM")])),
            at(13, 56, 0),
        );
        rt.tick(at(13, 56, 1));
        assert_eq!(rt.flow().stage(), ExtensionStage::Idle);

        let remote = ExtensionSnapshot {
            booking_id: Some("a".to_string()),
            stage: ExtensionStage::Loading,
            origin_display: Some(7),
            ..ExtensionSnapshot::default()
        };
        rt.handle(
            frame(2, Broadcast::ExtensionStateChanged { snapshot: remote }),
            at(13, 56, 2),
        );
        assert_eq!(rt.flow().stage(), ExtensionStage::Loading);
        assert!(daemon.published.lock().unwrap().is_empty());
    }

    #[test]
    fn own_extension_echo_is_ignored() {
        let (mut rt, _, _) = runtime(false);
        rt.handle(
            RuntimeEvent::Resynced(snapshot(1, vec![booking("a", "1:00 PM", "2:00 PM")])),
            at(13, 56, 0),
        );
        let echo = ExtensionSnapshot {
            booking_id: Some("a".to_string()),
            stage: ExtensionStage::Showing,
            origin_display: Some(0),
            ..ExtensionSnapshot::default()
        };
        rt.handle(
            frame(2, Broadcast::ExtensionStateChanged { snapshot: echo }),
            at(13, 56, 1),
        );
        assert_eq!(rt.flow().stage(), ExtensionStage::Idle);
    }

    #[test]
    fn stale_options_after_relock_are_ignored() {
        let (mut rt, daemon, _) = runtime(true);
        rt.handle(
            RuntimeEvent::Resynced(snapshot(1, vec![booking("a", "1:00 PM", "2:00 PM")])),
            at(13, 59, 0),
        );
        rt.tick(at(14, 0, 0));
        assert_eq!(rt.reconciler().is_locked(), Some(true));

        rt.handle(
            RuntimeEvent::OptionsLoaded {
                booking_id: "a".to_string(),
                result: Ok(ExtensionOptions::default()),
            },
            at(14, 0, 1),
        );
        assert_eq!(rt.flow().stage(), ExtensionStage::Idle);
        assert!(daemon.published.lock().unwrap().is_empty());
    }
}
