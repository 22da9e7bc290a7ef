//! Admin-initiated unconditional unlock.

use baylock_protocol::OverrideState;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// Override as seen by the reconciler, in local wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManualOverride {
    pub active: bool,
    /// `None` while active means indefinite until explicitly cleared.
    pub ends_at: Option<NaiveDateTime>,
}

impl ManualOverride {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn indefinite() -> Self {
        Self {
            active: true,
            ends_at: None,
        }
    }

    pub fn until(ends_at: NaiveDateTime) -> Self {
        Self {
            active: true,
            ends_at: Some(ends_at),
        }
    }

    /// True while the override unlocks the bay at `now`.
    ///
    /// A finite override stops applying the instant its end is reached, even if
    /// the daemon's expiry broadcast has not arrived yet.
    pub fn is_in_effect(&self, now: NaiveDateTime) -> bool {
        self.active && self.ends_at.map_or(true, |end| now < end)
    }

    pub fn from_wire(state: &OverrideState) -> Self {
        Self {
            active: state.unlocked,
            ends_at: state
                .end_time
                .map(|end| end.with_timezone(&Local).naive_local()),
        }
    }

    pub fn to_wire(&self) -> OverrideState {
        OverrideState {
            unlocked: self.active,
            end_time: self.ends_at.and_then(local_to_utc),
        }
    }
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
