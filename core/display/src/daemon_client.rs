//! Client for the baylock daemon socket.
//!
//! One request per connection, newline-delimited JSON. The subscription is the
//! exception: it keeps its connection open and streams broadcast frames, and
//! reconnects with a fresh snapshot whenever the daemon goes away.

use baylock_core::config;
use baylock_protocol::{
    AccessEvent, BroadcastFrame, ExtendResult, ExtensionOptions, ExtensionSnapshot, Method,
    Request, Response, Snapshot, MAX_REQUEST_BYTES,
};
use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::runtime::RuntimeEvent;

const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
/// Extension calls wait on the booking service behind the daemon.
const UPSTREAM_TIMEOUT_SECS: u64 = 35;
const RECONNECT_MIN_MS: u64 = 250;
const RECONNECT_MAX_MS: u64 = 5_000;

/// What the display runtime needs from the daemon.
pub trait DaemonApi: Send + Sync {
    fn snapshot(&self) -> Result<Snapshot, String>;
    fn log_access(&self, event: &AccessEvent) -> Result<(), String>;
    fn publish_extension_state(&self, snapshot: &ExtensionSnapshot) -> Result<(), String>;
    fn extension_options(&self, booking_id: &str) -> Result<ExtensionOptions, String>;
    fn extend_booking(&self, booking_id: &str, minutes: u32) -> Result<ExtendResult, String>;
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self::new(config::socket_path()?))
    }

    /// Sends one request and returns its `data` payload.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, String> {
        self.call_with_timeout(method, params, Duration::from_millis(READ_TIMEOUT_MS))
    }

    pub fn call_as<T: DeserializeOwned>(&self, method: Method, params: Option<Value>) -> Result<T, String> {
        let data = self.call(method, params)?;
        serde_json::from_value(data).map_err(|err| format!("Unexpected daemon payload: {}", err))
    }

    fn call_with_timeout(
        &self,
        method: Method,
        params: Option<Value>,
        read_timeout: Duration,
    ) -> Result<Value, String> {
        let request = Request::new(method, make_request_id(method), params);
        let mut stream = self.connect()?;
        let _ = stream.set_read_timeout(Some(read_timeout));
        write_request(&mut stream, &request)?;
        let response = read_response(&mut stream)?;
        into_data(response)
    }

    fn connect(&self) -> Result<UnixStream, String> {
        let stream = UnixStream::connect(&self.socket)
            .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }

    /// Opens a subscription; the first line is the snapshot response.
    pub fn subscribe(&self, display_id: u32) -> Result<(Snapshot, Subscription), String> {
        let request = Request::new(
            Method::Subscribe,
            make_request_id(Method::Subscribe),
            Some(json!({ "display_id": display_id })),
        );
        let mut stream = self.connect()?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        write_request(&mut stream, &request)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|err| format!("Failed to read subscribe response: {}", err))?;
        let response: Response = serde_json::from_str(line.trim_end())
            .map_err(|err| format!("Failed to parse subscribe response: {}", err))?;
        let snapshot: Snapshot = serde_json::from_value(into_data(response)?)
            .map_err(|err| format!("Unexpected snapshot payload: {}", err))?;

        // Frames may be minutes apart.
        let _ = reader.get_ref().set_read_timeout(None);
        Ok((snapshot, Subscription { reader }))
    }
}

impl DaemonApi for DaemonClient {
    fn snapshot(&self) -> Result<Snapshot, String> {
        self.call_as(Method::GetSnapshot, None)
    }

    fn log_access(&self, event: &AccessEvent) -> Result<(), String> {
        let params = serde_json::to_value(event)
            .map_err(|err| format!("Failed to serialize access event: {}", err))?;
        self.call(Method::LogAccess, Some(params)).map(|_| ())
    }

    fn publish_extension_state(&self, snapshot: &ExtensionSnapshot) -> Result<(), String> {
        let params = serde_json::to_value(snapshot)
            .map_err(|err| format!("Failed to serialize extension state: {}", err))?;
        self.call(Method::PublishExtensionState, Some(params))
            .map(|_| ())
    }

    fn extension_options(&self, booking_id: &str) -> Result<ExtensionOptions, String> {
        let data = self.call_with_timeout(
            Method::GetExtensionOptions,
            Some(json!({ "booking_id": booking_id })),
            Duration::from_secs(UPSTREAM_TIMEOUT_SECS),
        )?;
        serde_json::from_value(data).map_err(|err| format!("Unexpected options payload: {}", err))
    }

    fn extend_booking(&self, booking_id: &str, minutes: u32) -> Result<ExtendResult, String> {
        let data = self.call_with_timeout(
            Method::ExtendBooking,
            Some(json!({ "booking_id": booking_id, "minutes": minutes })),
            Duration::from_secs(UPSTREAM_TIMEOUT_SECS),
        )?;
        serde_json::from_value(data).map_err(|err| format!("Unexpected extend payload: {}", err))
    }
}

pub struct Subscription {
    reader: BufReader<UnixStream>,
}

impl Subscription {
    /// Blocks for the next frame. `Ok(None)` once the daemon closes the stream.
    pub fn next_frame(&mut self) -> Result<Option<BroadcastFrame>, String> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|err| format!("Failed to read broadcast: {}", err))?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line.trim_end())
                .map(Some)
                .map_err(|err| format!("Failed to parse broadcast: {}", err));
        }
    }
}

/// Keeps a subscription alive for the lifetime of the runtime, feeding every
/// snapshot and frame into `events`. Exits once the runtime stops listening.
pub fn spawn_subscription(
    client: DaemonClient,
    display_id: u32,
    events: Sender<RuntimeEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut backoff = RECONNECT_MIN_MS;
        loop {
            match client.subscribe(display_id) {
                Ok((snapshot, mut subscription)) => {
                    backoff = RECONNECT_MIN_MS;
                    if events.send(RuntimeEvent::Resynced(snapshot)).is_err() {
                        return;
                    }
                    let reason = loop {
                        match subscription.next_frame() {
                            Ok(Some(frame)) => {
                                if events.send(RuntimeEvent::Frame(frame)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break "daemon closed the stream".to_string(),
                            Err(err) => break err,
                        }
                    };
                    if events.send(RuntimeEvent::Disconnected(reason)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, backoff_ms = backoff, "Subscribe failed");
                }
            }
            thread::sleep(Duration::from_millis(backoff));
            backoff = (backoff * 2).min(RECONNECT_MAX_MS);
        }
    })
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), String> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

fn make_request_id(method: Method) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!(
        "{:?}-{}-{}-{:x}",
        method,
        Utc::now().timestamp_millis(),
        std::process::id(),
        rand
    )
}
