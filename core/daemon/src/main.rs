//! baylock daemon entrypoint.
//!
//! A single-writer service for one golf bay: it owns today's bookings and the
//! manual override, streams every change to the display processes, and is the
//! only process that talks to the booking service and the door relay.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use chrono::Local;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use baylock_core::config::{self, KioskConfig};
use baylock_core::KioskError;
use baylock_protocol::{
    parse_access_event, parse_booking_update, parse_bookings_push, parse_params,
    parse_set_override, parse_unlock_door, ErrorInfo, ExtendParams, ExtensionOptionsParams,
    ExtensionSnapshot, Method, Request, Response, SubscribeParams, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use serde::Serialize;

mod broadcast;
mod cache;
mod relay;
mod state;
mod upstream;

use relay::ShellyRelay;
use state::SharedState;
use upstream::HttpBookingService;

const READ_TIMEOUT_SECS: u64 = 2;
const WRITE_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 4096;
const DAY_WATCH_SECS: u64 = 30;

fn main() {
    init_logging();

    let config = match load_kiosk_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Kiosk configuration unavailable");
            std::process::exit(1);
        }
    };

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let service = match HttpBookingService::new(&config) {
        Ok(service) => service,
        Err(err) => {
            error!(error = %err, "Failed to initialize booking service client");
            std::process::exit(1);
        }
    };
    let relay = match ShellyRelay::new(config.relay_ip.trim()) {
        Ok(relay) => relay,
        Err(err) => {
            error!(error = %err, "Failed to initialize door relay client");
            std::process::exit(1);
        }
    };

    let cache_path = match config::cache_path() {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %err, "Offline cache disabled");
            None
        }
    };

    info!(
        path = %socket_path.display(),
        bay_id = %config.bay_id,
        location_id = %config.location_id,
        "baylock daemon started"
    );

    let timing = config.timing.clone();
    let shared_state = Arc::new(SharedState::new(
        config,
        Arc::new(service),
        Arc::new(relay),
        cache_path,
    ));
    spawn_refresh_loop(
        Arc::clone(&shared_state),
        Duration::from_secs(timing.refresh_hours * 60 * 60),
    );
    spawn_heartbeat_loop(
        Arc::clone(&shared_state),
        Duration::from_secs(timing.heartbeat_minutes * 60),
    );
    spawn_day_watch(Arc::clone(&shared_state), Duration::from_secs(DAY_WATCH_SECS));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

/// Loads the kiosk config, dropping an example next to the expected path the
/// first time so the installer has something to edit.
fn load_kiosk_config() -> Result<KioskConfig, String> {
    let path = config::config_path()?;
    match config::load_config(&path) {
        Ok(config) => Ok(config),
        Err(KioskError::ConfigMissing(path)) => {
            match config::write_example_config(&path) {
                Ok(true) => warn!(path = %path.display(), "Wrote example kiosk config; edit it and restart"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "Failed to write example kiosk config"),
            }
            Err(KioskError::ConfigMissing(path).to_string())
        }
        Err(err) => Err(err.to_string()),
    }
}

/// Pulls bookings once at startup and then every `interval`. This heals any
/// pushes missed while the service connection was down.
fn spawn_refresh_loop(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        match state.refresh_from_service() {
            Ok(count) => info!(count, "Periodic booking refresh"),
            Err(err) => warn!(error = %err, "Periodic booking refresh failed"),
        }
        thread::sleep(interval);
    });
}

/// Drops yesterday's bookings shortly after midnight and pulls the new day.
/// Until that pull succeeds the store stays unloaded and the bay stays locked.
fn spawn_day_watch(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if state.roll_over_day(Local::now().date_naive()) {
            match state.refresh_from_service() {
                Ok(count) => info!(count, "Pulled bookings for the new day"),
                Err(err) => warn!(error = %err, "New-day booking pull failed"),
            }
        }
    });
}

fn spawn_heartbeat_loop(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        if let Err(err) = state.heartbeat() {
            warn!(error = %err, "Heartbeat failed");
        }
        thread::sleep(interval);
    });
}

fn init_logging() {
    let debug_enabled = env::var("BAYLOCK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.method == Method::Subscribe && request.protocol_version == PROTOCOL_VERSION {
        stream_broadcasts(stream, request, state);
        return;
    }
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

/// Answers a subscribe with the current snapshot, then forwards every
/// broadcast frame until the display goes away.
fn stream_broadcasts(mut stream: UnixStream, request: Request, state: Arc<SharedState>) {
    let params: SubscribeParams = match parse_params(request.params, "subscribe") {
        Ok(params) => params,
        Err(err) => {
            let _ = write_response(&mut stream, Response::error_with_info(request.id, err));
            return;
        }
    };

    let (snapshot, rx) = state.subscribe(params.display_id);
    info!(display_id = params.display_id, seq = snapshot.seq, "Display connected");
    let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
    if write_response(&mut stream, ok_json(request.id, &snapshot)).is_err() {
        return;
    }

    for line in rx {
        let sent = stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .and_then(|_| stream.flush());
        if let Err(err) = sent {
            info!(display_id = params.display_id, error = %err, "Display disconnected");
            break;
        }
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(value) = serde_json::to_value(state.health()) {
                data["state"] = value;
            }
            Response::ok(id, data)
        }
        Method::GetConfig => ok_json(id, &state.config().display_config()),
        Method::GetSnapshot => ok_json(id, &state.snapshot()),
        Method::Subscribe => Response::error(
            id,
            "invalid_request",
            "subscribe must be the only request on its connection",
        ),
        Method::PushBookings => match parse_bookings_push(params) {
            Ok(push) => {
                let count = push.bookings.len();
                let applied = state.replace_bookings(&push.bay_id, push.bookings, "push");
                Response::ok(id, serde_json::json!({ "applied": applied, "count": count }))
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::PushBookingUpdate => match parse_booking_update(params) {
            Ok(update) => {
                let applied = state.apply_update(update);
                Response::ok(id, serde_json::json!({ "applied": applied }))
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetOverride => ok_json(id, &state.override_state()),
        Method::SetOverride => {
            let parsed = match parse_set_override(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.set_override(&parsed, chrono::Utc::now()) {
                Ok(value) => ok_json(id, &value),
                Err(err) => Response::error_with_info(id, err),
            }
        }
        Method::ClearCache => {
            let seq = state.clear_cache();
            let refresher = Arc::clone(&state);
            thread::spawn(move || {
                if let Err(err) = refresher.refresh_from_service() {
                    warn!(error = %err, "Resync after cache clear failed");
                }
            });
            Response::ok(id, serde_json::json!({ "cleared": true, "seq": seq }))
        }
        Method::RefreshBookings => match state.refresh_from_service() {
            Ok(count) => Response::ok(id, serde_json::json!({ "count": count })),
            Err(err) => Response::error(id, err.code(), err.to_string()),
        },
        Method::LogAccess => match parse_access_event(params) {
            Ok(event) => {
                let forwarded = state.log_access(event);
                Response::ok(id, serde_json::json!({ "forwarded": forwarded }))
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::BringToFront => {
            let seq = state.bring_to_front();
            Response::ok(id, serde_json::json!({ "seq": seq }))
        }
        Method::GetExtensionOptions => {
            let parsed: ExtensionOptionsParams = match parse_params(params, "extension options") {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.extension_options(&parsed.booking_id) {
                Ok(options) => ok_json(id, &options),
                Err(err) => Response::error(id, err.code(), err.to_string()),
            }
        }
        Method::ExtendBooking => {
            let parsed: ExtendParams = match parse_params(params, "extend") {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            if let Err(err) = parsed.validate() {
                return Response::error_with_info(id, err);
            }
            match state.extend_booking(&parsed.booking_id, parsed.minutes) {
                Ok(result) => ok_json(id, &result),
                Err(err) => Response::error(id, err.code(), err.to_string()),
            }
        }
        Method::PublishExtensionState => {
            let snapshot: ExtensionSnapshot = match parse_params(params, "extension state") {
                Ok(snapshot) => snapshot,
                Err(err) => return Response::error_with_info(id, err),
            };
            let seq = state.publish_extension_state(snapshot);
            Response::ok(id, serde_json::json!({ "seq": seq }))
        }
        Method::UnlockDoor => {
            let parsed = match parse_unlock_door(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.unlock_door(&parsed) {
                Ok(outcome) if outcome.succeeded() => Response::ok(
                    id,
                    serde_json::json!({ "success": true, "message": "Door unlocked successfully" }),
                ),
                Ok(outcome) => Response::error(
                    id,
                    "relay_failed",
                    outcome.error().unwrap_or("relay failed").to_string(),
                ),
                Err(err) => Response::error_with_info(id, err),
            }
        }
    }
}

fn ok_json<T: Serialize>(id: Option<String>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
