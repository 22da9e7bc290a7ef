//! IPC protocol types and validation for baylock-daemon.
//!
//! This crate is shared by the daemon and its displays to prevent schema drift.
//! The daemon remains the authority on validation, but displays and operator
//! tools reuse the same types to construct valid requests and to decode the
//! broadcast stream.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_OVERRIDE_MINUTES: u32 = 24 * 60;
pub const MAX_DOOR_UNLOCK_SECS: u32 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetConfig,
    GetSnapshot,
    Subscribe,
    PushBookings,
    PushBookingUpdate,
    GetOverride,
    SetOverride,
    ClearCache,
    RefreshBookings,
    LogAccess,
    BringToFront,
    GetExtensionOptions,
    ExtendBooking,
    PublishExtensionState,
    UnlockDoor,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(id.into()),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bookings
// ═══════════════════════════════════════════════════════════════════════════════

/// Booking status as reported by the booking service.
///
/// Only `confirmed` bookings take part in lock and extension decisions; every
/// other status is carried through verbatim so it can be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BookingStatus {
    Confirmed,
    Other(String),
}

impl From<String> for BookingStatus {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("confirmed") {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Other(value)
        }
    }
}

impl From<BookingStatus> for String {
    fn from(status: BookingStatus) -> Self {
        match status {
            BookingStatus::Confirmed => "confirmed".to_string(),
            BookingStatus::Other(value) => value,
        }
    }
}

/// One reserved time window for one bay.
///
/// `start_time` and `end_time` are wall-clock labels for today ("1:00 PM");
/// they are interpreted by `baylock_core::schedule`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub bay_id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub user_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub status: BookingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    fn validate(&self) -> Result<(), ErrorInfo> {
        if self.id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_booking", "booking id is required"));
        }
        if self.bay_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_booking",
                format!("booking {} is missing bayId", self.id),
            ));
        }
        Ok(())
    }
}

/// Full snapshot pushed by the booking service (`bookings_updated`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingsPush {
    #[serde(deserialize_with = "string_or_number")]
    pub bay_id: String,
    #[serde(default)]
    pub bookings: Vec<Booking>,
}

impl BookingsPush {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.bay_id, "bayId")?;
        for booking in &self.bookings {
            booking.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaAction {
    Add,
    Remove,
}

/// Incremental update pushed by the booking service (`booking_update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingUpdate {
    #[serde(deserialize_with = "string_or_number")]
    pub bay_id: String,
    pub action: DeltaAction,
    pub booking: Booking,
}

impl BookingUpdate {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.bay_id, "bayId")?;
        self.booking.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manual override
// ═══════════════════════════════════════════════════════════════════════════════

/// Admin override as exchanged on the wire and broadcast to displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideState {
    pub unlocked: bool,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetOverrideParams {
    pub unlocked: bool,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

impl SetOverrideParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.end_time.is_some() && self.duration_minutes.is_some() {
            return Err(ErrorInfo::new(
                "invalid_params",
                "end_time and duration_minutes are mutually exclusive",
            ));
        }
        if !self.unlocked && (self.end_time.is_some() || self.duration_minutes.is_some()) {
            return Err(ErrorInfo::new(
                "invalid_params",
                "an end time only applies when unlocking",
            ));
        }
        if let Some(minutes) = self.duration_minutes {
            if minutes == 0 || minutes > MAX_OVERRIDE_MINUTES {
                return Err(ErrorInfo::new(
                    "invalid_duration",
                    format!(
                        "duration_minutes must be between 1 and {}",
                        MAX_OVERRIDE_MINUTES
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Resolves the requested expiry against `now`.
    pub fn resolve_end_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.unlocked {
            return None;
        }
        match (self.end_time, self.duration_minutes) {
            (Some(end), _) => Some(end),
            (None, Some(minutes)) => Some(now + chrono::Duration::minutes(i64::from(minutes))),
            (None, None) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Access reporting
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    SessionStarted,
    SessionEnded,
    DoorUnlockSuccess,
    DoorUnlockFailure,
}

/// Payload posted to `{api}/logs/access`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub action: AccessAction,
    pub success: bool,
    pub bay_id: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AccessEvent {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.bay_id, "bay_id")?;
        require_str(&self.location_id, "location_id")?;
        match self.action {
            AccessAction::SessionStarted | AccessAction::SessionEnded => {
                require_string(&self.booking_id, "booking_id")
            }
            AccessAction::DoorUnlockSuccess | AccessAction::DoorUnlockFailure => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session extension
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionOption {
    pub minutes: u32,
    pub price_formatted: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfo {
    pub brand: String,
    pub last4: String,
}

/// Response of `{api}/bookings/{id}/extension-options`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionOptions {
    #[serde(default)]
    pub options: Vec<ExtensionOption>,
    #[serde(default)]
    pub card: Option<CardInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionOptionsParams {
    pub booking_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtendParams {
    pub booking_id: String,
    pub minutes: u32,
}

impl ExtendParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.booking_id, "booking_id")?;
        if self.minutes == 0 {
            return Err(ErrorInfo::new("invalid_params", "minutes must be positive"));
        }
        Ok(())
    }
}

/// Result of a successful extension; `booking` carries the new end time when
/// the service echoes it back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub booking: Option<Booking>,
    #[serde(default)]
    pub new_end_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStage {
    #[default]
    Idle,
    Loading,
    Showing,
    Confirming,
    Processing,
    Success,
    Error,
    Declined,
}

/// Extension sub-flow state shared across displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSnapshot {
    #[serde(default)]
    pub booking_id: Option<String>,
    pub stage: ExtensionStage,
    #[serde(default)]
    pub options: Vec<ExtensionOption>,
    #[serde(default)]
    pub card: Option<CardInfo>,
    #[serde(default)]
    pub selected: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub origin_display: Option<u32>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Device relay
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote `unlock` command for the door relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockDoorParams {
    #[serde(deserialize_with = "string_or_number")]
    pub bay_id: String,
    pub duration: u32,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub booking_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub location_id: Option<String>,
}

impl UnlockDoorParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.bay_id, "bayId")?;
        if self.duration == 0 || self.duration > MAX_DOOR_UNLOCK_SECS {
            return Err(ErrorInfo::new(
                "invalid_duration",
                format!("duration must be between 1 and {} seconds", MAX_DOOR_UNLOCK_SECS),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Display configuration, snapshots, broadcasts
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionSettings {
    pub enabled: bool,
    pub trigger_minutes: u32,
    pub options: Vec<u32>,
    pub min_gap_minutes: u32,
    pub result_display_secs: u64,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_minutes: 5,
            options: vec![15, 30, 45, 60],
            min_gap_minutes: 15,
            result_display_secs: 5,
        }
    }
}

/// The subset of kiosk configuration a display needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub bay_id: String,
    pub location_id: String,
    pub recheck_secs: u64,
    pub extension: ExtensionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribeParams {
    pub display_id: u32,
}

/// Canonical state as seen by a newly connected display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    #[serde(default)]
    pub config: Option<DisplayConfig>,
    pub loaded: bool,
    pub bookings: Vec<Booking>,
    #[serde(rename = "override")]
    pub override_state: OverrideState,
}

/// One message on the display broadcast stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    BookingsSnapshot {
        loaded: bool,
        bookings: Vec<Booking>,
    },
    BookingDelta {
        action: DeltaAction,
        booking: Booking,
    },
    OverrideChanged {
        #[serde(rename = "override")]
        state: OverrideState,
    },
    ExtensionStateChanged {
        snapshot: ExtensionSnapshot,
    },
    BringToFront,
}

/// A broadcast stamped with the daemon's sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub seq: u64,
    pub message: Broadcast,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parsing helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Decodes request params into `T`, mapping failures to `invalid_params`.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>, what: &str) -> Result<T, ErrorInfo> {
    let params = params
        .ok_or_else(|| ErrorInfo::new("invalid_params", format!("{} payload is required", what)))?;
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", what, err),
        )
    })
}

pub fn parse_bookings_push(params: Option<Value>) -> Result<BookingsPush, ErrorInfo> {
    let push: BookingsPush = parse_params(params, "bookings")?;
    push.validate()?;
    Ok(push)
}

pub fn parse_booking_update(params: Option<Value>) -> Result<BookingUpdate, ErrorInfo> {
    let update: BookingUpdate = parse_params(params, "booking update")?;
    update.validate()?;
    Ok(update)
}

pub fn parse_set_override(params: Option<Value>) -> Result<SetOverrideParams, ErrorInfo> {
    let parsed: SetOverrideParams = parse_params(params, "override")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_access_event(params: Option<Value>) -> Result<AccessEvent, ErrorInfo> {
    let event: AccessEvent = parse_params(params, "access event")?;
    event.validate()?;
    Ok(event)
}

pub fn parse_unlock_door(params: Option<Value>) -> Result<UnlockDoorParams, ErrorInfo> {
    let parsed: UnlockDoorParams = parse_params(params, "unlock")?;
    parsed.validate()?;
    Ok(parsed)
}

fn require_str(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(candidate) => require_str(candidate, field),
        None => Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        )),
    }
}

// The booking service emits numeric ids for some records.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
