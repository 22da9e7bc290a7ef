//! In-memory booking store for the current day.
//!
//! The daemon owns the canonical instance; each display keeps a copy fed by the
//! broadcast stream. Both apply the same keyed mutations, so replaying a delta
//! or a snapshot twice leaves the store unchanged.

use baylock_protocol::{Booking, DeltaAction};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::schedule::parse_today;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStore {
    bookings: Vec<Booking>,
    loaded: bool,
}

impl BookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a loaded store from a snapshot.
    pub fn from_snapshot(bookings: Vec<Booking>) -> Self {
        let mut store = Self::new();
        store.replace_all(bookings);
        store
    }

    /// Authoritative replace; later duplicates of an id win.
    pub fn replace_all(&mut self, bookings: Vec<Booking>) {
        self.bookings.clear();
        for booking in bookings {
            self.upsert(booking);
        }
        self.loaded = true;
    }

    /// Inserts when `id` is new, otherwise overwrites in place.
    pub fn upsert(&mut self, booking: Booking) {
        match self.position(&booking.id) {
            Some(index) => self.bookings[index] = booking,
            None => self.bookings.push(booking),
        }
    }

    /// Deletes by id; returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) => {
                self.bookings.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn apply_delta(&mut self, action: DeltaAction, booking: Booking) {
        match action {
            DeltaAction::Add => self.upsert(booking),
            DeltaAction::Remove => {
                self.remove(&booking.id);
            }
        }
    }

    /// Drops every booking and forgets that a snapshot was ever received.
    pub fn clear(&mut self) {
        self.bookings.clear();
        self.loaded = false;
    }

    /// Removes bookings whose end has already passed. Bookings with labels
    /// that do not parse are kept so the caller can still log them.
    pub fn prune_expired(&mut self, now: NaiveDateTime) -> usize {
        let before = self.bookings.len();
        self.bookings
            .retain(|booking| match parse_today(&booking.end_time, now) {
                Ok(end) => end > now,
                Err(_) => true,
            });
        before - self.bookings.len()
    }

    /// Patches the local copy's end time. Used for the display-side echo of a
    /// granted extension; the next authoritative push overwrites it.
    pub fn set_end_time(&mut self, id: &str, end_time: &str) -> bool {
        match self.position(id) {
            Some(index) => {
                self.bookings[index].end_time = end_time.to_string();
                true
            }
            None => false,
        }
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn get(&self, id: &str) -> Option<&Booking> {
        self.bookings.iter().find(|booking| booking.id == id)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn confirmed_for_bay<'a>(&'a self, bay_id: &'a str) -> impl Iterator<Item = &'a Booking> {
        self.bookings
            .iter()
            .filter(move |booking| booking.bay_id == bay_id && booking.is_confirmed())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.bookings.iter().position(|booking| booking.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baylock_protocol::BookingStatus;
    use chrono::NaiveDate;

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

    #[test]
    fn upsert_then_remove_restores_prior_state() {
        let mut store = BookingStore::from_snapshot(vec![booking("a", "1:00 PM", "2:00 PM")]);
        let before = store.clone();

        store.upsert(booking("b", "3:00 PM", "4:00 PM"));
        assert_eq!(store.len(), 2);
        assert!(store.remove("b"));

        assert_eq!(store, before);
    }

    #[test]
    fn upsert_overwrites_in_place() {
        let mut store = BookingStore::from_snapshot(vec![
            booking("a", "1:00 PM", "2:00 PM"),
            booking("b", "3:00 PM", "4:00 PM"),
        ]);
        store.upsert(booking("a", "1:00 PM", "2:30 PM"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.bookings()[0].id, "a");
        assert_eq!(store.bookings()[0].end_time, "2:30 PM");
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut store = BookingStore::from_snapshot(vec![booking("a", "1:00 PM", "2:00 PM")]);
        assert!(!store.remove("zzz"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replace_all_marks_loaded_and_dedupes() {
        let mut store = BookingStore::new();
        assert!(!store.is_loaded());
        store.replace_all(vec![
            booking("a", "1:00 PM", "2:00 PM"),
            booking("a", "1:00 PM", "3:00 PM"),
        ]);
        assert!(store.is_loaded());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().end_time, "3:00 PM");
    }

    #[test]
    fn clear_forgets_loaded_flag() {
        let mut store = BookingStore::from_snapshot(vec![booking("a", "1:00 PM", "2:00 PM")]);
        store.clear();
        assert!(store.is_empty());
        assert!(!store.is_loaded());
    }

    #[test]
    fn delta_actions_map_to_upsert_and_remove() {
        let mut store = BookingStore::new();
        store.apply_delta(DeltaAction::Add, booking("a", "1:00 PM", "2:00 PM"));
        store.apply_delta(DeltaAction::Add, booking("a", "1:00 PM", "2:00 PM"));
        assert_eq!(store.len(), 1);
        store.apply_delta(DeltaAction::Remove, booking("a", "1:00 PM", "2:00 PM"));
        assert!(store.is_empty());
    }

    #[test]
    fn prune_drops_finished_bookings() {
        let now = NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap();
        let mut store = BookingStore::from_snapshot(vec![
            booking("past", "1:00 PM", "2:00 PM"),
            booking("next", "2:00 PM", "3:00 PM"),
            booking("bad", "whenever", "later"),
        ]);
        assert_eq!(store.prune_expired(now), 1);
        assert!(store.get("past").is_none());
        assert!(store.get("next").is_some());
        assert!(store.get("bad").is_some());
    }

    #[test]
    fn confirmed_for_bay_filters_status_and_bay() {
        let mut other_bay = booking("b", "1:00 PM", "2:00 PM");
        other_bay.bay_id = "bay-2".to_string();
        let mut cancelled = booking("c", "1:00 PM", "2:00 PM");
        cancelled.status = BookingStatus::Other("cancelled".to_string());
        let store = BookingStore::from_snapshot(vec![
            booking("a", "1:00 PM", "2:00 PM"),
            other_bay,
            cancelled,
        ]);

        let ids: Vec<&str> = store
            .confirmed_for_bay("bay-1")
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a"]);
    }
}
