//! Session extension upsell.
//!
//! A small state machine layered on the lock reconciler. It only ever runs for a
//! real booking (never a manual override) and is re-armed whenever the governing
//! booking changes identity or end time, or the bay re-locks.
//!
//! ```text
//! idle -> loading -> showing -> confirming -> processing -> success|error -> idle
//!            |          |            |
//!            +----------+------------+--> declined
//! ```
//!
//! Network calls are made by the caller. Every completion carries the booking id
//! it was started for and is ignored when the flow has since moved on.

use baylock_protocol::{
    Booking, CardInfo, ExtensionOption, ExtensionSettings, ExtensionSnapshot, ExtensionStage,
};
use chrono::{Duration, NaiveDateTime};

use crate::reconciler::ActiveSession;
use crate::schedule::{parse_today, Window};

/// Time until the next confirmed booking for the bay starts after `current`
/// ends. `None` when nothing follows today.
pub fn gap_until_next(
    current: &Booking,
    bookings: &[Booking],
    now: NaiveDateTime,
) -> Option<Duration> {
    let current_window = Window::parse(&current.start_time, &current.end_time, now).ok()?;
    bookings
        .iter()
        .filter(|b| b.id != current.id && b.bay_id == current.bay_id && b.is_confirmed())
        .filter_map(|b| parse_today(&b.start_time, now).ok())
        .filter(|start| *start > current_window.start)
        .map(|start| start - current_window.end)
        .min()
}

/// Whether the upsell should start now.
pub fn should_trigger(
    settings: &ExtensionSettings,
    flow: &ExtensionFlow,
    session: Option<&ActiveSession>,
    bookings: &[Booking],
    now: NaiveDateTime,
) -> bool {
    if !settings.enabled || flow.stage() != ExtensionStage::Idle {
        return false;
    }
    let Some(booking) = session.and_then(ActiveSession::booking) else {
        return false;
    };
    if booking.user_id.is_none() || !booking.is_confirmed() {
        return false;
    }
    let Ok(end) = parse_today(&booking.end_time, now) else {
        return false;
    };

    let remaining = end - now;
    let threshold = Duration::minutes(i64::from(settings.trigger_minutes));
    if remaining <= Duration::zero() || remaining > threshold {
        return false;
    }

    let min_gap = Duration::minutes(i64::from(settings.min_gap_minutes));
    match gap_until_next(booking, bookings, now) {
        Some(gap) => gap >= min_gap,
        None => true,
    }
}

/// Keeps the offered options that are enabled locally and fit before the next
/// booking.
pub fn fitting_options(
    offered: &[ExtensionOption],
    settings: &ExtensionSettings,
    gap: Option<Duration>,
) -> Vec<ExtensionOption> {
    offered
        .iter()
        .filter(|option| settings.options.contains(&option.minutes))
        .filter(|option| {
            gap.map_or(true, |gap| Duration::minutes(i64::from(option.minutes)) <= gap)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionFlow {
    booking_id: Option<String>,
    booking_end: Option<String>,
    stage: ExtensionStage,
    options: Vec<ExtensionOption>,
    card: Option<CardInfo>,
    selected: Option<u32>,
    message: Option<String>,
    stage_since: Option<NaiveDateTime>,
}

impl ExtensionFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ExtensionStage {
        self.stage
    }

    pub fn booking_id(&self) -> Option<&str> {
        self.booking_id.as_deref()
    }

    pub fn options(&self) -> &[ExtensionOption] {
        &self.options
    }

    pub fn card(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Back to idle, keeping the tracked booking.
    pub fn reset(&mut self) {
        self.stage = ExtensionStage::Idle;
        self.options.clear();
        self.card = None;
        self.selected = None;
        self.message = None;
        self.stage_since = None;
    }

    /// Re-arms the flow when the governing booking changes. Returns true when
    /// an in-progress prompt was discarded.
    ///
    /// A new end time for the tracked booking while a payment is processing or
    /// its confirmation is showing is the extension landing; the flow keeps its
    /// stage and [`ExtensionFlow::expire`] returns it to idle.
    pub fn sync_with_session(&mut self, session: Option<&ActiveSession>) -> bool {
        let (id, end) = match session.and_then(ActiveSession::booking) {
            Some(booking) => (Some(booking.id.clone()), Some(booking.end_time.clone())),
            None => (None, None),
        };
        if id == self.booking_id && end == self.booking_end {
            return false;
        }
        if id.is_some()
            && id == self.booking_id
            && matches!(
                self.stage,
                ExtensionStage::Processing | ExtensionStage::Success
            )
        {
            self.booking_end = end;
            return false;
        }
        let was_busy = self.stage != ExtensionStage::Idle;
        self.booking_id = id;
        self.booking_end = end;
        self.reset();
        was_busy
    }

    pub fn begin_loading(&mut self, booking_id: &str, now: NaiveDateTime) -> bool {
        if self.stage != ExtensionStage::Idle || !self.tracks(booking_id) {
            return false;
        }
        self.enter(ExtensionStage::Loading, now);
        true
    }

    /// Applies fetched options. `options` must already be filtered with
    /// [`fitting_options`].
    pub fn options_loaded(
        &mut self,
        booking_id: &str,
        options: Vec<ExtensionOption>,
        card: Option<CardInfo>,
        now: NaiveDateTime,
    ) -> bool {
        if !self.expects(ExtensionStage::Loading, booking_id) {
            return false;
        }
        if options.is_empty() {
            self.message = Some("No extension options available".to_string());
            self.enter(ExtensionStage::Declined, now);
        } else if card.is_none() {
            self.message = Some("No payment method on file".to_string());
            self.enter(ExtensionStage::Declined, now);
        } else {
            self.options = options;
            self.card = card;
            self.enter(ExtensionStage::Showing, now);
        }
        true
    }

    pub fn select(&mut self, minutes: u32, now: NaiveDateTime) -> bool {
        if !matches!(
            self.stage,
            ExtensionStage::Showing | ExtensionStage::Confirming
        ) {
            return false;
        }
        if !self.options.iter().any(|option| option.minutes == minutes) {
            return false;
        }
        self.selected = Some(minutes);
        self.enter(ExtensionStage::Confirming, now);
        true
    }

    /// Moves to processing and returns the call to make.
    pub fn confirm(&mut self, now: NaiveDateTime) -> Option<(String, u32)> {
        if self.stage != ExtensionStage::Confirming {
            return None;
        }
        let booking_id = self.booking_id.clone()?;
        let minutes = self.selected?;
        self.enter(ExtensionStage::Processing, now);
        Some((booking_id, minutes))
    }

    pub fn dismiss(&mut self, now: NaiveDateTime) -> bool {
        if !matches!(
            self.stage,
            ExtensionStage::Showing | ExtensionStage::Confirming
        ) {
            return false;
        }
        self.enter(ExtensionStage::Declined, now);
        true
    }

    pub fn extend_succeeded(&mut self, booking_id: &str, now: NaiveDateTime) -> bool {
        if !self.expects(ExtensionStage::Processing, booking_id) {
            return false;
        }
        self.message = self
            .selected
            .map(|minutes| format!("Session extended by {} minutes", minutes));
        self.enter(ExtensionStage::Success, now);
        true
    }

    /// Records a failed options lookup or payment.
    ///
    /// A failed lookup declines the offer for this booking, so an unreachable
    /// service is not polled again until the end time changes or the bay
    /// re-locks. A failed payment shows an error that times out to idle.
    pub fn failed(&mut self, booking_id: &str, message: impl Into<String>, now: NaiveDateTime) -> bool {
        if !self.tracks(booking_id) {
            return false;
        }
        let next = match self.stage {
            ExtensionStage::Loading => ExtensionStage::Declined,
            ExtensionStage::Processing => ExtensionStage::Error,
            _ => return false,
        };
        self.message = Some(message.into());
        self.enter(next, now);
        true
    }

    /// Returns success/error to idle once they have been shown long enough.
    pub fn expire(&mut self, now: NaiveDateTime, display_for: Duration) -> bool {
        if !matches!(self.stage, ExtensionStage::Success | ExtensionStage::Error) {
            return false;
        }
        match self.stage_since {
            Some(since) if now - since >= display_for => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, origin_display: Option<u32>) -> ExtensionSnapshot {
        ExtensionSnapshot {
            booking_id: self.booking_id.clone(),
            stage: self.stage,
            options: self.options.clone(),
            card: self.card.clone(),
            selected: self.selected,
            message: self.message.clone(),
            origin_display,
        }
    }

    /// Mirrors another display's flow for the same booking.
    pub fn apply_remote(&mut self, snapshot: &ExtensionSnapshot, now: NaiveDateTime) -> bool {
        if snapshot.booking_id.is_none() || snapshot.booking_id != self.booking_id {
            return false;
        }
        if snapshot.stage == self.stage
            && snapshot.options == self.options
            && snapshot.selected == self.selected
        {
            return false;
        }
        self.options = snapshot.options.clone();
        self.card = snapshot.card.clone();
        self.selected = snapshot.selected;
        self.message = snapshot.message.clone();
        self.enter(snapshot.stage, now);
        true
    }

    fn tracks(&self, booking_id: &str) -> bool {
        self.booking_id.as_deref() == Some(booking_id)
    }

    fn expects(&self, stage: ExtensionStage, booking_id: &str) -> bool {
        self.stage == stage && self.tracks(booking_id)
    }

    fn enter(&mut self, stage: ExtensionStage, now: NaiveDateTime) {
        self.stage = stage;
        self.stage_since = Some(now);
    }
}
