//! Canonical kiosk state owned by the daemon.
//!
//! One mutex guards the booking store, the manual override, the broadcast
//! registry, and the access ledger. Every mutation publishes its broadcast
//! before the lock is released, so displays see changes in the order they
//! were applied. Upstream HTTP calls never run under the lock.

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use baylock_core::{AccessLedger, BookingStore, KioskConfig};
use baylock_protocol::{
    AccessEvent, Booking, BookingUpdate, Broadcast, BroadcastFrame, DeltaAction, ErrorInfo,
    ExtendResult, ExtensionOptions, ExtensionSnapshot, OverrideState, SetOverrideParams, Snapshot,
    UnlockDoorParams,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;

use crate::broadcast::Broadcaster;
use crate::cache::{self, CachedBookings};
use crate::relay::{self, DoorRelay, UnlockOutcome};
use crate::upstream::{BookingService, UpstreamError};

pub struct SharedState {
    config: KioskConfig,
    service: Arc<dyn BookingService>,
    relay: Arc<dyn DoorRelay>,
    cache_path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    store: BookingStore,
    /// Day the store's time labels belong to.
    store_date: Option<NaiveDate>,
    refresh_due: bool,
    override_state: OverrideState,
    override_generation: u64,
    seq: u64,
    broadcaster: Broadcaster,
    ledger: AccessLedger,
    last_refresh: Option<DateTime<Utc>>,
}

impl Inner {
    fn publish(&mut self, message: Broadcast) -> u64 {
        self.seq += 1;
        let frame = BroadcastFrame {
            seq: self.seq,
            message,
        };
        self.broadcaster.publish(&frame);
        self.seq
    }

    /// Empties a store holding an earlier day's bookings so their labels are
    /// never read against today's date.
    fn roll_over(&mut self, today: NaiveDate) -> bool {
        match self.store_date {
            Some(date) if date != today => {
                tracing::info!(stale = %date, %today, count = self.store.len(), "Dropping bookings from an earlier day");
                self.store.clear();
                self.store_date = None;
                self.refresh_due = true;
                self.publish(Broadcast::BookingsSnapshot {
                    loaded: false,
                    bookings: Vec::new(),
                });
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self, config: &KioskConfig) -> Snapshot {
        Snapshot {
            seq: self.seq,
            config: Some(config.display_config()),
            loaded: self.store.is_loaded(),
            bookings: self.store.bookings().to_vec(),
            override_state: self.override_state.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub seq: u64,
    pub bay_id: String,
    pub loaded: bool,
    pub bookings: usize,
    pub subscribers: usize,
    pub displays: Vec<u32>,
    pub override_active: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl SharedState {
    pub fn new(
        config: KioskConfig,
        service: Arc<dyn BookingService>,
        relay: Arc<dyn DoorRelay>,
        cache_path: Option<PathBuf>,
    ) -> Self {
        let mut inner = Inner::default();
        if let Some(path) = cache_path.as_ref() {
            let today = Local::now().date_naive();
            match cache::load(path, &config.bay_id, today) {
                Ok(Some(bookings)) => {
                    tracing::info!(count = bookings.len(), "Loaded bookings from offline cache");
                    inner.store.replace_all(bookings);
                    inner.store_date = Some(today);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "Failed to load offline cache"),
            }
        }

        Self {
            config,
            service,
            relay,
            cache_path,
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &KioskConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot(&self.config)
    }

    /// Registers a display. The snapshot and the registration are taken under
    /// the same lock so the first streamed frame is `snapshot.seq + 1`.
    pub fn subscribe(&self, display_id: u32) -> (Snapshot, Receiver<String>) {
        let mut inner = self.lock();
        let rx = inner.broadcaster.subscribe(display_id);
        (inner.snapshot(&self.config), rx)
    }

    pub fn health(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            seq: inner.seq,
            bay_id: self.config.bay_id.clone(),
            loaded: inner.store.is_loaded(),
            bookings: inner.store.len(),
            subscribers: inner.broadcaster.len(),
            displays: inner.broadcaster.display_ids(),
            override_active: inner.override_state.unlocked,
            last_refresh: inner.last_refresh,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bookings
    // ─────────────────────────────────────────────────────────────────────

    /// Applies an authoritative snapshot. Pushes for another bay are ignored.
    pub fn replace_bookings(&self, bay_id: &str, bookings: Vec<Booking>, source: &str) -> bool {
        if bay_id != self.config.bay_id {
            tracing::info!(bay_id, ours = %self.config.bay_id, source, "Ignoring bookings for another bay");
            return false;
        }
        let mut inner = self.lock();
        inner.store.replace_all(bookings);
        inner.store_date = Some(Local::now().date_naive());
        inner.refresh_due = false;
        let loaded = inner.store.is_loaded();
        let bookings = inner.store.bookings().to_vec();
        tracing::info!(count = bookings.len(), source, "Bookings replaced");
        inner.publish(Broadcast::BookingsSnapshot { loaded, bookings });
        if source != "push" && source != "cache" {
            inner.last_refresh = Some(Utc::now());
        }
        self.persist(&inner.store);
        true
    }

    pub fn apply_update(&self, update: BookingUpdate) -> bool {
        if update.bay_id != self.config.bay_id {
            tracing::info!(bay_id = %update.bay_id, "Ignoring booking update for another bay");
            return false;
        }
        let today = Local::now().date_naive();
        let mut inner = self.lock();
        inner.roll_over(today);
        inner.store_date = Some(today);
        tracing::info!(
            action = ?update.action,
            booking_id = %update.booking.id,
            start = %update.booking.start_time,
            end = %update.booking.end_time,
            "Booking update"
        );
        inner
            .store
            .apply_delta(update.action, update.booking.clone());
        inner.publish(Broadcast::BookingDelta {
            action: update.action,
            booking: update.booking,
        });
        self.persist(&inner.store);
        true
    }

    /// Drops every booking, tells displays, and removes the offline cache. The
    /// caller follows up with a refresh.
    pub fn clear_cache(&self) -> u64 {
        let mut inner = self.lock();
        inner.store.clear();
        inner.store_date = None;
        if let Some(path) = self.cache_path.as_ref() {
            if let Err(err) = cache::remove(path) {
                tracing::warn!(error = %err, "Failed to remove offline cache");
            }
        }
        tracing::info!("Booking cache cleared");
        inner.publish(Broadcast::BookingsSnapshot {
            loaded: false,
            bookings: Vec::new(),
        })
    }

    /// Pulls today's bookings from the service and applies them as a snapshot.
    pub fn refresh_from_service(&self) -> Result<usize, UpstreamError> {
        let today = Local::now().date_naive();
        let bookings = self.service.fetch_bookings(today)?;
        let count = bookings.len();
        self.replace_bookings(&self.config.bay_id, bookings, "refresh");
        Ok(count)
    }

    /// Clears bookings left from an earlier day. Returns true while a pull for
    /// `today` is still owed.
    pub fn roll_over_day(&self, today: NaiveDate) -> bool {
        let mut inner = self.lock();
        inner.roll_over(today);
        inner.refresh_due
    }

    fn persist(&self, store: &BookingStore) {
        let Some(path) = self.cache_path.as_ref() else {
            return;
        };
        let now = Local::now().naive_local();
        let mut pruned = store.clone();
        pruned.prune_expired(now);
        let cached = CachedBookings {
            bay_id: self.config.bay_id.clone(),
            date: now.date(),
            bookings: pruned.bookings().to_vec(),
        };
        if let Err(err) = cache::save(path, &cached) {
            tracing::warn!(error = %err, "Failed to persist offline cache");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Manual override
    // ─────────────────────────────────────────────────────────────────────

    pub fn override_state(&self) -> OverrideState {
        self.lock().override_state.clone()
    }

    /// Replaces the override and arms its expiry timer when it has an end.
    pub fn set_override(
        self: &Arc<Self>,
        params: &SetOverrideParams,
        now: DateTime<Utc>,
    ) -> Result<OverrideState, ErrorInfo> {
        let end_time = params.resolve_end_time(now);
        if let Some(end) = end_time {
            if end <= now {
                return Err(ErrorInfo::new("invalid_end_time", "end_time is in the past"));
            }
        }
        let state = OverrideState {
            unlocked: params.unlocked,
            end_time,
        };

        let generation = {
            let mut inner = self.lock();
            inner.override_generation += 1;
            inner.override_state = state.clone();
            inner.publish(Broadcast::OverrideChanged {
                state: state.clone(),
            });
            inner.override_generation
        };
        tracing::info!(unlocked = state.unlocked, end_time = ?state.end_time, generation, "Manual override set");

        if let Some(end) = end_time {
            self.arm_override_timer(generation, end);
        }
        Ok(state)
    }

    fn arm_override_timer(self: &Arc<Self>, generation: u64, end: DateTime<Utc>) {
        let delay = (end - Utc::now()).to_std().unwrap_or_default();
        let state = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(delay);
            state.expire_override_if_due(generation);
        });
    }

    /// Clears the override armed as `generation`. A timer from a superseded
    /// override finds a newer generation and does nothing.
    pub fn expire_override_if_due(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.override_generation != generation || !inner.override_state.unlocked {
            tracing::debug!(generation, current = inner.override_generation, "Stale override timer");
            return false;
        }
        inner.override_generation += 1;
        inner.override_state = OverrideState::default();
        inner.publish(Broadcast::OverrideChanged {
            state: OverrideState::default(),
        });
        tracing::info!(generation, "Manual override expired");
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Displays
    // ─────────────────────────────────────────────────────────────────────

    pub fn bring_to_front(&self) -> u64 {
        self.lock().publish(Broadcast::BringToFront)
    }

    pub fn publish_extension_state(&self, snapshot: ExtensionSnapshot) -> u64 {
        tracing::debug!(
            stage = ?snapshot.stage,
            booking_id = ?snapshot.booking_id,
            origin = ?snapshot.origin_display,
            "Extension state published"
        );
        self.lock()
            .publish(Broadcast::ExtensionStateChanged { snapshot })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reporting and upstream proxies
    // ─────────────────────────────────────────────────────────────────────

    /// De-duplicates a display's access event and forwards it in the
    /// background. Returns whether it was forwarded.
    pub fn log_access(&self, event: AccessEvent) -> bool {
        let admitted = self.lock().ledger.admit(&event);
        if !admitted {
            tracing::debug!(action = ?event.action, booking_id = ?event.booking_id, "Duplicate access event dropped");
            return false;
        }
        tracing::info!(action = ?event.action, booking_id = ?event.booking_id, "Access event");
        self.forward_access(event);
        true
    }

    fn forward_access(&self, event: AccessEvent) {
        let service = Arc::clone(&self.service);
        thread::spawn(move || {
            if let Err(err) = service.log_access(&event) {
                tracing::warn!(error = %err, action = ?event.action, "Failed to report access event");
            }
        });
    }

    pub fn heartbeat(&self) -> Result<(), UpstreamError> {
        self.service.heartbeat()
    }

    pub fn extension_options(&self, booking_id: &str) -> Result<ExtensionOptions, UpstreamError> {
        self.service.extension_options(booking_id)
    }

    /// Extends a booking and mirrors the new end time into the store so every
    /// display picks it up before the service's own push arrives.
    pub fn extend_booking(&self, booking_id: &str, minutes: u32) -> Result<ExtendResult, UpstreamError> {
        let result = self.service.extend_booking(booking_id, minutes)?;
        tracing::info!(booking_id, minutes, new_end = ?result.new_end_time, "Booking extended");

        let mut inner = self.lock();
        let echoed = result
            .booking
            .clone()
            .filter(|booking| booking.id == booking_id);
        let updated = match (echoed, result.new_end_time.as_deref()) {
            (Some(booking), _) => Some(booking),
            (None, Some(end)) => {
                let mut booking = inner.store.get(booking_id).cloned();
                if let Some(booking) = booking.as_mut() {
                    booking.end_time = end.to_string();
                }
                booking
            }
            (None, None) => None,
        };
        if let Some(booking) = updated {
            inner.store.upsert(booking.clone());
            inner.publish(Broadcast::BookingDelta {
                action: DeltaAction::Add,
                booking,
            });
            self.persist(&inner.store);
        }
        Ok(result)
    }

    /// Fires the door relay for this bay and reports the outcome.
    pub fn unlock_door(&self, params: &UnlockDoorParams) -> Result<UnlockOutcome, ErrorInfo> {
        if params.bay_id != self.config.bay_id {
            return Err(ErrorInfo::new(
                "wrong_bay",
                format!(
                    "Unlock command is for bay {}, but we are bay {}",
                    params.bay_id, self.config.bay_id
                ),
            ));
        }
        let outcome = relay::unlock_door(
            self.relay.as_ref(),
            params,
            &self.config.bay_id,
            &self.config.location_id,
        );
        self.log_access(outcome.event.clone());
        Ok(outcome)
    }
}
