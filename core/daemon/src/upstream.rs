//! HTTP client for the booking service.
//!
//! Every call is blocking and made outside the state lock. Reporting calls
//! (access logs, heartbeats) are fire-and-forget: callers log failures at
//! `warn` and move on.

use std::time::Duration;

use baylock_core::KioskConfig;
use baylock_protocol::{AccessEvent, Booking, ExtendResult, ExtensionOptions};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("baylock-daemon/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP client could not be built: {0}")]
    Client(String),

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} responded with status {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl UpstreamError {
    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::Client(_) => "upstream_client",
            UpstreamError::Transport { .. } => "upstream_unreachable",
            UpstreamError::Status { .. } => "upstream_status",
            UpstreamError::Decode { .. } => "upstream_decode",
        }
    }
}

/// Operations the daemon needs from the booking service.
pub trait BookingService: Send + Sync {
    /// Full list of today's bookings for this bay.
    fn fetch_bookings(&self, date: NaiveDate) -> Result<Vec<Booking>, UpstreamError>;
    fn log_access(&self, event: &AccessEvent) -> Result<(), UpstreamError>;
    fn heartbeat(&self) -> Result<(), UpstreamError>;
    fn extension_options(&self, booking_id: &str) -> Result<ExtensionOptions, UpstreamError>;
    fn extend_booking(&self, booking_id: &str, minutes: u32) -> Result<ExtendResult, UpstreamError>;
}

pub struct HttpBookingService {
    api_base_url: String,
    bay_id: String,
    location_id: String,
    http_client: reqwest::blocking::Client,
}

impl HttpBookingService {
    pub fn new(config: &KioskConfig) -> Result<Self, UpstreamError> {
        let http_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| UpstreamError::Client(err.to_string()))?;

        Ok(Self {
            api_base_url: config.api_base().to_string(),
            bay_id: config.bay_id.clone(),
            location_id: config.location_id.clone(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn send(
        &self,
        url: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, UpstreamError> {
        let response = request.send().map_err(|err| UpstreamError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .ok()
                .and_then(|body| error_message(&body))
                .unwrap_or_else(|| status.to_string());
            return Err(UpstreamError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    fn decode<T: DeserializeOwned>(
        url: &str,
        response: reqwest::blocking::Response,
    ) -> Result<T, UpstreamError> {
        response.json().map_err(|err| UpstreamError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

impl BookingService for HttpBookingService {
    fn fetch_bookings(&self, date: NaiveDate) -> Result<Vec<Booking>, UpstreamError> {
        let url = self.url("/bookings");
        let date = date.format("%Y-%m-%d").to_string();
        let request = self.http_client.get(&url).query(&[
            ("locationId", self.location_id.as_str()),
            ("bayId", self.bay_id.as_str()),
            ("date", date.as_str()),
        ]);
        let response = self.send(&url, request)?;
        let body: BookingsBody = Self::decode(&url, response)?;
        Ok(body.into_bookings())
    }

    fn log_access(&self, event: &AccessEvent) -> Result<(), UpstreamError> {
        let url = self.url("/logs/access");
        self.send(&url, self.http_client.post(&url).json(event))?;
        Ok(())
    }

    fn heartbeat(&self) -> Result<(), UpstreamError> {
        let url = self.url(&format!("/bays/{}/heartbeat", self.bay_id));
        self.send(&url, self.http_client.post(&url).json(&json!({})))?;
        Ok(())
    }

    fn extension_options(&self, booking_id: &str) -> Result<ExtensionOptions, UpstreamError> {
        let url = self.url(&format!("/bookings/{}/extension-options", booking_id));
        let response = self.send(&url, self.http_client.get(&url))?;
        Self::decode(&url, response)
    }

    fn extend_booking(&self, booking_id: &str, minutes: u32) -> Result<ExtendResult, UpstreamError> {
        let url = self.url(&format!("/bookings/{}/extend", booking_id));
        let payload = json!({
            "extensionMinutes": minutes,
            "locationId": self.location_id,
            "bayId": self.bay_id,
        });
        let response = self.send(&url, self.http_client.post(&url).json(&payload))?;
        let body: serde_json::Value = Self::decode(&url, response)?;
        extend_result(&url, body)
    }
}

/// The service answers either a bare array or `{ "bookings": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum BookingsBody {
    List(Vec<Booking>),
    Wrapped { bookings: Vec<Booking> },
}

impl BookingsBody {
    fn into_bookings(self) -> Vec<Booking> {
        match self {
            BookingsBody::List(bookings) => bookings,
            BookingsBody::Wrapped { bookings } => bookings,
        }
    }
}

/// A 2xx answer is a success unless the body says `"success": false`.
fn extend_result(url: &str, body: serde_json::Value) -> Result<ExtendResult, UpstreamError> {
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        return Err(UpstreamError::Status {
            url: url.to_string(),
            status: 200,
            message: error_message(&body.to_string())
                .unwrap_or_else(|| "extension was rejected".to_string()),
        });
    }
    let mut result: ExtendResult =
        serde_json::from_value(body).map_err(|err| UpstreamError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?;
    result.success = true;
    Ok(result)
}

/// Pulls `message` or `error` out of a JSON error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookings_body_accepts_both_shapes() {
        let bare = r#"[{"id":1,"bayId":"bay-1","startTime":"1:00 PM","endTime":"2:00 PM","status":"confirmed"}]"#;
        let wrapped = r#"{"bookings":[{"id":"1","bayId":"bay-1","startTime":"1:00 PM","endTime":"2:00 PM","status":"confirmed"}]}"#;

        let a: BookingsBody = serde_json::from_str(bare).expect("bare");
        let b: BookingsBody = serde_json::from_str(wrapped).expect("wrapped");
        assert_eq!(a.into_bookings(), b.into_bookings());
    }

    #[test]
    fn error_message_prefers_message_field() {
        assert_eq!(
            error_message(r#"{"message":"bay offline","error":"x"}"#).as_deref(),
            Some("bay offline")
        );
        assert_eq!(
            error_message(r#"{"error":"card declined"}"#).as_deref(),
            Some("card declined")
        );
        assert_eq!(error_message("<html>"), None);
    }

    #[test]
    fn extend_result_honours_explicit_failure() {
        let ok = extend_result("u", json!({"newEndTime": "2:30 PM"})).expect("ok");
        assert!(ok.success);
        assert_eq!(ok.new_end_time.as_deref(), Some("2:30 PM"));

        let err = extend_result("u", json!({"success": false, "error": "card declined"}))
            .unwrap_err();
        assert!(err.to_string().contains("card declined"));
    }

    #[test]
    fn error_codes_are_stable() {
        let err = UpstreamError::Status {
            url: "http://x".to_string(),
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.code(), "upstream_status");
    }
}
