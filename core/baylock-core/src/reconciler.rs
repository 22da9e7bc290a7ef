//! Lock state reconciliation.
//!
//! Decides, for a given instant, whether the bay is locked, and turns changes in
//! that decision into transitions the display runtime acts on.
//!
//! # Priority
//!
//! 1. A manual override in effect unlocks unconditionally.
//! 2. Otherwise a confirmed booking for this bay whose window contains `now`
//!    (start inclusive, end exclusive) unlocks.
//! 3. Otherwise the bay is locked. An empty or unloaded store locks.
//!
//! # Hysteresis
//!
//! [`LockReconciler::reconcile`] only reports a lock/unlock transition when the
//! locked boolean flips. A change in the active session while staying unlocked
//! is reported separately so callers never toggle the lock UI for it, and
//! re-evaluating unchanged inputs yields [`Transition::None`].

use baylock_protocol::Booking;
use chrono::{Duration, NaiveDateTime};
use tracing::warn;

use crate::manual_override::ManualOverride;
use crate::schedule::{parse_today, Window};
use crate::store::BookingStore;

/// What justifies an unlocked bay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSession {
    Booking(Booking),
    Override { ends_at: Option<NaiveDateTime> },
}

impl ActiveSession {
    pub fn booking(&self) -> Option<&Booking> {
        match self {
            ActiveSession::Booking(booking) => Some(booking),
            ActiveSession::Override { .. } => None,
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, ActiveSession::Override { .. })
    }

    /// When this session stops justifying an unlock. `None` for an indefinite
    /// override or a booking whose end label no longer parses.
    pub fn ends_at(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            ActiveSession::Booking(booking) => parse_today(&booking.end_time, now).ok(),
            ActiveSession::Override { ends_at } => *ends_at,
        }
    }

    pub fn remaining(&self, now: NaiveDateTime) -> Option<Duration> {
        self.ends_at(now).map(|end| end - now)
    }

    /// True once the countdown for this session has run out.
    pub fn has_elapsed(&self, now: NaiveDateTime) -> bool {
        self.remaining(now)
            .map_or(false, |remaining| remaining <= Duration::zero())
    }

    fn same_identity(&self, other: &ActiveSession) -> bool {
        match (self, other) {
            (ActiveSession::Booking(a), ActiveSession::Booking(b)) => a.id == b.id,
            (ActiveSession::Override { .. }, ActiveSession::Override { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked(ActiveSession),
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked)
    }

    pub fn session(&self) -> Option<&ActiveSession> {
        match self {
            LockState::Locked => None,
            LockState::Unlocked(session) => Some(session),
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Bay identity is not known yet; nothing was evaluated.
    Uninitialized,
    /// Desired state equals current state.
    None,
    /// Bay went from unlocked (or unknown) to locked.
    Locked { ended: Option<ActiveSession> },
    /// Bay went from locked (or unknown) to unlocked.
    Unlocked { started: ActiveSession },
    /// Still unlocked, but for a different session.
    SessionChanged {
        ended: ActiveSession,
        started: ActiveSession,
    },
    /// Still unlocked for the same session whose details changed (e.g. an
    /// extended end time).
    SessionUpdated { session: ActiveSession },
}

impl Transition {
    /// Session that ended with this transition, if any.
    pub fn ended(&self) -> Option<&ActiveSession> {
        match self {
            Transition::Locked { ended } => ended.as_ref(),
            Transition::SessionChanged { ended, .. } => Some(ended),
            _ => None,
        }
    }

    /// Session that started with this transition, if any.
    pub fn started(&self) -> Option<&ActiveSession> {
        match self {
            Transition::Unlocked { started } => Some(started),
            Transition::SessionChanged { started, .. } => Some(started),
            _ => None,
        }
    }

    /// Whether the lock/unlock presentation has to change.
    pub fn toggles_lock(&self) -> bool {
        matches!(self, Transition::Locked { .. } | Transition::Unlocked { .. })
    }
}

/// Finds the confirmed booking for `bay_id` whose window contains `now`.
///
/// Overlapping confirmed bookings violate an upstream invariant; the earliest
/// start wins, then the lowest id.
pub fn active_booking<'a>(
    bay_id: &str,
    bookings: &'a [Booking],
    now: NaiveDateTime,
) -> Option<&'a Booking> {
    let mut matches: Vec<(NaiveDateTime, &Booking)> = Vec::new();
    for booking in bookings {
        if booking.bay_id != bay_id || !booking.is_confirmed() {
            continue;
        }
        match Window::parse(&booking.start_time, &booking.end_time, now) {
            Ok(window) if window.contains(now) => matches.push((window.start, booking)),
            Ok(_) => {}
            Err(err) => {
                warn!(booking_id = %booking.id, error = %err, "Skipping unusable booking");
            }
        }
    }

    if matches.len() > 1 {
        warn!(
            bay_id,
            count = matches.len(),
            ids = ?matches.iter().map(|(_, b)| b.id.as_str()).collect::<Vec<_>>(),
            "Overlapping confirmed bookings; picking earliest start"
        );
    }

    matches
        .into_iter()
        .min_by(|(a_start, a), (b_start, b)| a_start.cmp(b_start).then_with(|| a.id.cmp(&b.id)))
        .map(|(_, booking)| booking)
}

/// Computes the state the bay should be in at `now`.
pub fn desired_state(
    bay_id: &str,
    store: &BookingStore,
    manual: &ManualOverride,
    now: NaiveDateTime,
) -> LockState {
    if manual.is_in_effect(now) {
        return LockState::Unlocked(ActiveSession::Override {
            ends_at: manual.ends_at,
        });
    }

    match active_booking(bay_id, store.bookings(), now) {
        Some(booking) => LockState::Unlocked(ActiveSession::Booking(booking.clone())),
        None => LockState::Locked,
    }
}

/// Holds the last applied lock state for one display.
#[derive(Debug, Default)]
pub struct LockReconciler {
    state: Option<LockState>,
}

impl LockReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first evaluation with a known bay.
    pub fn state(&self) -> Option<&LockState> {
        self.state.as_ref()
    }

    pub fn is_locked(&self) -> Option<bool> {
        self.state.as_ref().map(LockState::is_locked)
    }

    pub fn active_session(&self) -> Option<&ActiveSession> {
        self.state.as_ref().and_then(LockState::session)
    }

    /// Re-evaluates and applies the desired state.
    pub fn reconcile(
        &mut self,
        bay_id: Option<&str>,
        store: &BookingStore,
        manual: &ManualOverride,
        now: NaiveDateTime,
    ) -> Transition {
        let Some(bay_id) = bay_id else {
            return Transition::Uninitialized;
        };
        let desired = desired_state(bay_id, store, manual, now);
        self.apply(desired)
    }

    /// Locks immediately; used when the session countdown reaches zero.
    pub fn force_lock(&mut self) -> Transition {
        match self.state {
            Some(LockState::Unlocked(_)) => self.apply(LockState::Locked),
            _ => Transition::None,
        }
    }

    fn apply(&mut self, desired: LockState) -> Transition {
        let previous = self.state.take();
        let transition = match (previous, &desired) {
            (None, LockState::Locked) => Transition::Locked { ended: None },
            (None, LockState::Unlocked(session)) => Transition::Unlocked {
                started: session.clone(),
            },
            (Some(LockState::Locked), LockState::Locked) => Transition::None,
            (Some(LockState::Locked), LockState::Unlocked(session)) => Transition::Unlocked {
                started: session.clone(),
            },
            (Some(LockState::Unlocked(current)), LockState::Locked) => Transition::Locked {
                ended: Some(current),
            },
            (Some(LockState::Unlocked(current)), LockState::Unlocked(next)) => {
                if !current.same_identity(next) {
                    Transition::SessionChanged {
                        ended: current,
                        started: next.clone(),
                    }
                } else if current != *next {
                    Transition::SessionUpdated {
                        session: next.clone(),
                    }
                } else {
                    Transition::None
                }
            }
        };
        self.state = Some(desired);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baylock_protocol::BookingStatus;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn booking(id: &str, start: &str, end: &str) -> Booking {
        Booking {
            id: id.to_string(),
            bay_id: "bay-1".to_string(),
            user_id: Some("user-1".to_string()),
            start_time: start.to_string(),
            end_time: end.to_string(),
            status: BookingStatus::Confirmed,
            user_name: None,
        }
    }

    fn store(bookings: Vec<Booking>) -> BookingStore {
        BookingStore::from_snapshot(bookings)
    }

    #[test]
    fn booking_in_window_unlocks() {
        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let state = desired_state("bay-1", &s, &ManualOverride::inactive(), at(13, 30));
        match state {
            LockState::Unlocked(ActiveSession::Booking(b)) => assert_eq!(b.id, "a"),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn end_boundary_locks_and_start_boundary_unlocks() {
        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let none = ManualOverride::inactive();
        assert!(desired_state("bay-1", &s, &none, at(14, 0)).is_locked());
        assert!(!desired_state("bay-1", &s, &none, at(13, 0)).is_locked());
    }

    #[test]
    fn unconfirmed_and_foreign_bookings_are_ignored() {
        let mut cancelled = booking("a", "1:00 PM", "2:00 PM");
        cancelled.status = BookingStatus::Other("pending".to_string());
        let mut other_bay = booking("b", "1:00 PM", "2:00 PM");
        other_bay.bay_id = "bay-9".to_string();
        let s = store(vec![cancelled, other_bay]);
        assert!(desired_state("bay-1", &s, &ManualOverride::inactive(), at(13, 30)).is_locked());
    }

    #[test]
    fn malformed_booking_is_skipped_not_fatal() {
        let s = store(vec![
            booking("bad", "soon", "later"),
            booking("good", "1:00 PM", "2:00 PM"),
        ]);
        let state = desired_state("bay-1", &s, &ManualOverride::inactive(), at(13, 30));
        assert_eq!(state.session().and_then(ActiveSession::booking).unwrap().id, "good");
    }

    #[test]
    fn override_wins_with_zero_bookings() {
        let s = BookingStore::new();
        let state = desired_state("bay-1", &s, &ManualOverride::indefinite(), at(3, 0));
        assert_eq!(state, LockState::Unlocked(ActiveSession::Override { ends_at: None }));
    }

    #[test]
    fn overlap_picks_earliest_start_then_lowest_id() {
        let s = store(vec![
            booking("z", "1:30 PM", "3:00 PM"),
            booking("b", "1:00 PM", "2:00 PM"),
            booking("a", "1:00 PM", "2:30 PM"),
        ]);
        let picked = active_booking("bay-1", s.bookings(), at(13, 45)).unwrap();
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn unknown_bay_performs_no_evaluation() {
        let mut reconciler = LockReconciler::new();
        let t = reconciler.reconcile(None, &BookingStore::new(), &ManualOverride::indefinite(), at(12, 0));
        assert_eq!(t, Transition::Uninitialized);
        assert!(reconciler.state().is_none());
    }

    #[test]
    fn first_evaluation_emits_initial_state() {
        let mut reconciler = LockReconciler::new();
        let t = reconciler.reconcile(Some("bay-1"), &BookingStore::new(), &ManualOverride::inactive(), at(12, 0));
        assert_eq!(t, Transition::Locked { ended: None });
        assert_eq!(reconciler.is_locked(), Some(true));
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let none = ManualOverride::inactive();
        let mut reconciler = LockReconciler::new();

        assert!(matches!(
            reconciler.reconcile(Some("bay-1"), &s, &none, at(13, 30)),
            Transition::Unlocked { .. }
        ));
        assert_eq!(reconciler.reconcile(Some("bay-1"), &s, &none, at(13, 30)), Transition::None);
        assert_eq!(reconciler.reconcile(Some("bay-1"), &s, &none, at(13, 31)), Transition::None);
    }

    #[test]
    fn extended_end_time_is_an_in_place_update() {
        let none = ManualOverride::inactive();
        let mut reconciler = LockReconciler::new();
        reconciler.reconcile(Some("bay-1"), &store(vec![booking("a", "1:00 PM", "2:00 PM")]), &none, at(13, 55));

        let extended = store(vec![booking("a", "1:00 PM", "2:30 PM")]);
        let t = reconciler.reconcile(Some("bay-1"), &extended, &none, at(13, 56));
        match t {
            Transition::SessionUpdated { session } => {
                assert_eq!(session.booking().unwrap().end_time, "2:30 PM");
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert!(!reconciler.reconcile(Some("bay-1"), &extended, &none, at(13, 57)).toggles_lock());
    }

    #[test]
    fn clearing_override_during_booking_changes_session_without_relock() {
        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let mut reconciler = LockReconciler::new();
        reconciler.reconcile(Some("bay-1"), &s, &ManualOverride::indefinite(), at(13, 30));

        let t = reconciler.reconcile(Some("bay-1"), &s, &ManualOverride::inactive(), at(13, 30));
        assert!(matches!(
            t,
            Transition::SessionChanged {
                ended: ActiveSession::Override { .. },
                started: ActiveSession::Booking(_)
            }
        ));
        assert!(!t.toggles_lock());
    }

    #[test]
    fn booking_ending_relocks() {
        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let none = ManualOverride::inactive();
        let mut reconciler = LockReconciler::new();
        reconciler.reconcile(Some("bay-1"), &s, &none, at(13, 59));

        let t = reconciler.reconcile(Some("bay-1"), &s, &none, at(14, 0));
        match t {
            Transition::Locked { ended: Some(ActiveSession::Booking(b)) } => assert_eq!(b.id, "a"),
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn force_lock_only_acts_when_unlocked() {
        let mut reconciler = LockReconciler::new();
        assert_eq!(reconciler.force_lock(), Transition::None);

        let s = store(vec![booking("a", "1:00 PM", "2:00 PM")]);
        reconciler.reconcile(Some("bay-1"), &s, &ManualOverride::inactive(), at(13, 0));
        assert!(matches!(reconciler.force_lock(), Transition::Locked { ended: Some(_) }));
        assert_eq!(reconciler.force_lock(), Transition::None);
    }

    #[test]
    fn elapsed_session_detection() {
        let session = ActiveSession::Booking(booking("a", "1:00 PM", "2:00 PM"));
        assert!(!session.has_elapsed(at(13, 59)));
        assert!(session.has_elapsed(at(14, 0)));
        assert!(!ActiveSession::Override { ends_at: None }.has_elapsed(at(23, 59)));
    }
}
