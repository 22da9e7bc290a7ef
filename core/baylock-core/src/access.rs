//! Session access events and cross-display de-duplication.
//!
//! Every display runs its own reconciler, so each one observes the same session
//! boundary. The daemon funnels their reports through an [`AccessLedger`] so the
//! booking service sees one `session_started` and one `session_ended` per
//! session no matter how many screens are attached.

use baylock_protocol::{AccessAction, AccessEvent};

use crate::reconciler::ActiveSession;

pub const KIOSK_USER_AGENT: &str = "Kiosk";

/// Builds a session boundary event. Manual-override sessions are never
/// reported.
pub fn session_event(
    action: AccessAction,
    session: &ActiveSession,
    bay_id: &str,
    location_id: &str,
) -> Option<AccessEvent> {
    let booking = session.booking()?;
    Some(AccessEvent {
        action,
        success: true,
        bay_id: bay_id.to_string(),
        location_id: location_id.to_string(),
        booking_id: Some(booking.id.clone()),
        user_id: booking.user_id.clone(),
        error_message: None,
        response_time_ms: None,
        user_agent: Some(KIOSK_USER_AGENT.to_string()),
        metadata: None,
    })
}

#[derive(Debug, Default)]
pub struct AccessLedger {
    open: Option<String>,
    last_ended: Option<String>,
}

impl AccessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `event` should be forwarded upstream.
    pub fn admit(&mut self, event: &AccessEvent) -> bool {
        let booking_id = event.booking_id.clone();
        match event.action {
            AccessAction::SessionStarted => {
                if booking_id.is_some() && self.open == booking_id {
                    return false;
                }
                if self.last_ended == booking_id {
                    self.last_ended = None;
                }
                self.open = booking_id;
                true
            }
            AccessAction::SessionEnded => {
                if booking_id.is_some() && self.last_ended == booking_id {
                    return false;
                }
                if self.open == booking_id {
                    self.open = None;
                }
                self.last_ended = booking_id;
                true
            }
            AccessAction::DoorUnlockSuccess | AccessAction::DoorUnlockFailure => true,
        }
    }

    pub fn open_session(&self) -> Option<&str> {
        self.open.as_deref()
    }
}
