//! Door relay control (Shelly Gen2 RPC).
//!
//! An unlock switches the relay off with `toggle_after`, so the device itself
//! re-locks after the requested duration. Calls are never retried.

use std::time::{Duration, Instant};

use baylock_protocol::{AccessAction, AccessEvent, UnlockDoorParams};
use serde_json::{json, Value};

use baylock_core::KIOSK_USER_AGENT;

const RELAY_TIMEOUT_SECS: u64 = 5;
const UNLOCK_METHOD: &str = "email_link";

/// Answer from the device; `body` is kept verbatim for the access log.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Value,
}

pub trait DoorRelay: Send + Sync {
    fn address(&self) -> &str;
    /// Sends one RPC payload and returns the raw answer.
    fn call(&self, request: &Value) -> Result<RelayResponse, String>;
}

pub struct ShellyRelay {
    ip: String,
    http_client: reqwest::blocking::Client,
}

impl ShellyRelay {
    pub fn new(ip: impl Into<String>) -> Result<Self, String> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(RELAY_TIMEOUT_SECS))
            .build()
            .map_err(|err| format!("Failed to build relay client: {}", err))?;
        Ok(Self {
            ip: ip.into(),
            http_client,
        })
    }
}

impl DoorRelay for ShellyRelay {
    fn address(&self) -> &str {
        &self.ip
    }

    fn call(&self, request: &Value) -> Result<RelayResponse, String> {
        let response = self
            .http_client
            .post(rpc_url(&self.ip))
            .json(request)
            .send()
            .map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().unwrap_or(Value::Null);
        Ok(RelayResponse { status, body })
    }
}

pub fn rpc_url(ip: &str) -> String {
    format!("http://{}/rpc", ip)
}

pub fn switch_request(duration_secs: u32) -> Value {
    json!({
        "id": 1,
        "method": "Switch.Set",
        "params": { "id": 0, "on": false, "toggle_after": duration_secs }
    })
}

/// Outcome of one unlock attempt, ready to report.
#[derive(Debug, Clone)]
pub struct UnlockOutcome {
    pub event: AccessEvent,
}

impl UnlockOutcome {
    pub fn succeeded(&self) -> bool {
        self.event.success
    }

    pub fn error(&self) -> Option<&str> {
        self.event.error_message.as_deref()
    }
}

/// Fires the relay and builds the matching `door_unlock_*` access event.
pub fn unlock_door(
    relay: &dyn DoorRelay,
    params: &UnlockDoorParams,
    bay_id: &str,
    default_location_id: &str,
) -> UnlockOutcome {
    let request = switch_request(params.duration);
    let url = rpc_url(relay.address());
    let started = Instant::now();
    let result = relay.call(&request).and_then(|response| {
        if response.status != 200 {
            return Err(format!("Relay responded with status {}", response.status));
        }
        if let Some(error) = response.body.get("error") {
            return Err(error.to_string());
        }
        Ok(response.body)
    });
    let response_time_ms = started.elapsed().as_millis() as u64;

    let location_id = params
        .location_id
        .clone()
        .unwrap_or_else(|| default_location_id.to_string());
    let mut event = AccessEvent {
        action: AccessAction::DoorUnlockSuccess,
        success: true,
        bay_id: bay_id.to_string(),
        location_id,
        booking_id: params.booking_id.clone(),
        user_id: None,
        error_message: None,
        response_time_ms: Some(response_time_ms),
        user_agent: Some(KIOSK_USER_AGENT.to_string()),
        metadata: None,
    };

    match result {
        Ok(body) => {
            tracing::info!(duration = params.duration, response_time_ms, "Door unlocked");
            event.metadata = Some(json!({
                "ip_address": relay.address(),
                "unlock_method": UNLOCK_METHOD,
                "unlock_duration": params.duration,
                "shelly_url": url,
                "shelly_request": request,
                "shelly_response": body,
            }));
        }
        Err(message) => {
            tracing::warn!(error = %message, duration = params.duration, "Door unlock failed");
            event.action = AccessAction::DoorUnlockFailure;
            event.success = false;
            event.error_message = Some(message.clone());
            event.metadata = Some(json!({
                "ip_address": relay.address(),
                "unlock_method": UNLOCK_METHOD,
                "unlock_duration": params.duration,
                "attempted_url": url,
                "attempted_request": request,
                "error_details": message,
            }));
        }
    }

    UnlockOutcome { event }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRelay;
    use super::*;

    fn params(duration: u32) -> UnlockDoorParams {
        UnlockDoorParams {
            bay_id: "bay-1".to_string(),
            duration,
            booking_id: Some("b-7".to_string()),
            location_id: None,
        }
    }

    #[test]
    fn success_reports_door_unlock_success() {
        let relay = FakeRelay::ok();
        let outcome = unlock_door(&relay, &params(8), "bay-1", "loc-1");

        assert!(outcome.succeeded());
        assert_eq!(outcome.event.action, AccessAction::DoorUnlockSuccess);
        assert_eq!(outcome.event.location_id, "loc-1");
        assert_eq!(outcome.event.booking_id.as_deref(), Some("b-7"));

        let calls = relay.calls.lock().unwrap();
        assert_eq!(calls[0]["params"]["toggle_after"], 8);
        assert_eq!(calls[0]["params"]["on"], false);
    }

    #[test]
    fn error_field_in_body_is_a_failure() {
        let relay = FakeRelay::answering(Ok(RelayResponse {
            status: 200,
            body: json!({"error": {"code": -103, "message": "busy"}}),
        }));
        let outcome = unlock_door(&relay, &params(5), "bay-1", "loc-1");
        assert!(!outcome.succeeded());
        assert_eq!(outcome.event.action, AccessAction::DoorUnlockFailure);
        assert!(outcome.error().unwrap_or_default().contains("busy"));
    }

    #[test]
    fn non_200_and_transport_errors_fail_without_retry() {
        let relay = FakeRelay::answering(Ok(RelayResponse {
            status: 500,
            body: Value::Null,
        }));
        assert!(!unlock_door(&relay, &params(5), "bay-1", "loc-1").succeeded());

        let relay = FakeRelay::answering(Err("connection refused".to_string()));
        let outcome = unlock_door(&relay, &params(5), "bay-1", "loc-1");
        assert_eq!(outcome.error(), Some("connection refused"));
        assert_eq!(relay.calls.lock().unwrap().len(), 1);
    }
}
