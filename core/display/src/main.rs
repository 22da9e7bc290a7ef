//! baylock-display: one kiosk screen, plus admin commands against the daemon.
//!
//! ## Subcommands
//!
//! - `run`: Drive a display until stdin closes or `quit` is typed
//! - `override`: Set, clear or inspect the manual override
//! - `push`: Send a booking snapshot or delta from a JSON file
//! - `clear-cache`, `refresh`, `status`, `bring-to-front`: one-shot admin calls

mod daemon_client;
mod logging;
mod runtime;
mod surface;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::sync::Arc;

use baylock_protocol::{Method, SetOverrideParams};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::daemon_client::{spawn_subscription, DaemonClient};
use crate::runtime::DisplayRuntime;
use crate::surface::{spawn_stdin_reader, TerminalSurface};

#[derive(Parser)]
#[command(name = "baylock-display")]
#[command(about = "Golf bay kiosk display")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a display attached to the local daemon
    Run {
        /// Index of this screen; extension prompts are tagged with it
        #[arg(long, default_value_t = 0)]
        display_id: u32,

        /// Offer session extensions from this screen
        #[arg(long)]
        primary: bool,
    },

    /// Manage the manual override
    Override {
        #[command(subcommand)]
        action: OverrideAction,
    },

    /// Push bookings from a JSON file, as the booking service would
    Push {
        /// File holding `{bayId, bookings}`, or `{bayId, action, booking}` with --delta
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Treat the file as a single add/remove update
        #[arg(long)]
        delta: bool,
    },

    /// Drop cached bookings and pull a fresh schedule
    ClearCache,

    /// Pull today's bookings from the booking service now
    Refresh,

    /// Print daemon health
    Status,

    /// Raise every display to the foreground
    BringToFront,
}

#[derive(Subcommand)]
enum OverrideAction {
    /// Unlock the bay regardless of bookings
    Set {
        /// Unlock for this many minutes
        #[arg(long, conflicts_with = "until")]
        minutes: Option<u32>,

        /// Unlock until this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Return the bay to booking control
    Clear,

    /// Print the current override
    Status,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let client = match DaemonClient::from_env() {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "Cannot locate daemon socket");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            display_id,
            primary,
        } => {
            run_display(client, display_id, primary);
            return;
        }
        Commands::Override { action } => match action {
            OverrideAction::Set { minutes, until } => set_override(&client, true, minutes, until),
            OverrideAction::Clear => set_override(&client, false, None, None),
            OverrideAction::Status => client.call(Method::GetOverride, None),
        },
        Commands::Push { file, delta } => push_file(&client, &file, delta),
        Commands::ClearCache => client.call(Method::ClearCache, None),
        Commands::Refresh => client.call(Method::RefreshBookings, None),
        Commands::Status => client.call(Method::GetHealth, None),
        Commands::BringToFront => client.call(Method::BringToFront, None),
    };

    match result {
        Ok(data) => print_json(&data),
        Err(err) => {
            tracing::error!(error = %err, "Daemon request failed");
            process::exit(1);
        }
    }
}

fn run_display(client: DaemonClient, display_id: u32, primary: bool) {
    tracing::info!(display_id, primary, "Starting display");
    let (tx, rx) = mpsc::channel();

    spawn_subscription(client.clone(), display_id, tx.clone());
    spawn_stdin_reader(tx.clone());

    let surface = TerminalSurface::stdout(display_id);
    let mut runtime = DisplayRuntime::new(display_id, primary, Arc::new(client), surface, tx);
    runtime.run(rx);
}

fn set_override(
    client: &DaemonClient,
    unlocked: bool,
    minutes: Option<u32>,
    until: Option<DateTime<Utc>>,
) -> Result<Value, String> {
    let params = SetOverrideParams {
        unlocked,
        end_time: until,
        duration_minutes: minutes,
    };
    let params = serde_json::to_value(params).map_err(|err| err.to_string())?;
    client.call(Method::SetOverride, Some(params))
}

fn push_file(client: &DaemonClient, file: &Path, delta: bool) -> Result<Value, String> {
    let content = fs_err::read_to_string(file).map_err(|err| err.to_string())?;
    let params: Value = serde_json::from_str(&content)
        .map_err(|err| format!("{} is not valid JSON: {}", file.display(), err))?;
    let method = if delta {
        Method::PushBookingUpdate
    } else {
        Method::PushBookings
    };
    client.call(method, Some(params))
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => tracing::warn!(error = %err, "Failed to render daemon response"),
    }
}
