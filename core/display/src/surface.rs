//! Presentation seam for a physical screen.
//!
//! The kiosk UI itself lives outside this crate; the runtime only tells a
//! [`DisplaySurface`] what to show. [`TerminalSurface`] renders to a line
//! writer and is what `baylock-display run` uses on a headless box.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::Sender;
use std::thread;

use baylock_core::ActiveSession;
use baylock_protocol::{ExtensionSnapshot, ExtensionStage};
use chrono::Duration;

use crate::runtime::{RuntimeEvent, UserInput};

pub trait DisplaySurface {
    fn show_locked(&mut self);
    fn show_unlocked(&mut self, session: &ActiveSession, remaining: Option<Duration>);
    fn update_countdown(&mut self, remaining: Duration);
    fn show_extension(&mut self, snapshot: &ExtensionSnapshot);
    fn bring_to_front(&mut self);
}

/// `mm:ss`, or `h:mm:ss` past an hour. Negative durations clamp to zero.
pub fn format_countdown(remaining: Duration) -> String {
    let total = remaining.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

pub struct TerminalSurface<W: Write> {
    display_id: u32,
    out: W,
    last_countdown: Option<String>,
}

impl TerminalSurface<io::Stdout> {
    pub fn stdout(display_id: u32) -> Self {
        Self::new(display_id, io::stdout())
    }
}

impl<W: Write> TerminalSurface<W> {
    pub fn new(display_id: u32, out: W) -> Self {
        Self {
            display_id,
            out,
            last_countdown: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        if let Err(err) = writeln!(self.out, "[display {}] {}", self.display_id, text) {
            tracing::warn!(error = %err, "Failed to write to terminal surface");
        }
        let _ = self.out.flush();
    }
}

impl<W: Write> DisplaySurface for TerminalSurface<W> {
    fn show_locked(&mut self) {
        self.last_countdown = None;
        self.line("LOCKED: please book this bay to play");
    }

    fn show_unlocked(&mut self, session: &ActiveSession, remaining: Option<Duration>) {
        let who = match session {
            ActiveSession::Booking(booking) => format!(
                "booking {}{}",
                booking.id,
                booking
                    .user_name
                    .as_deref()
                    .map(|name| format!(" ({})", name))
                    .unwrap_or_default()
            ),
            ActiveSession::Override { .. } => "manual override".to_string(),
        };
        let time = remaining
            .map(format_countdown)
            .unwrap_or_else(|| "no end time".to_string());
        self.line(&format!("UNLOCKED: {} [{}]", who, time));
    }

    fn update_countdown(&mut self, remaining: Duration) {
        let text = format_countdown(remaining);
        // Only minute changes are worth a line on a terminal.
        let minute = text.rsplit_once(':').map(|(head, _)| head.to_string());
        if minute != self.last_countdown {
            self.line(&format!("time remaining {}", text));
            self.last_countdown = minute;
        }
    }

    fn show_extension(&mut self, snapshot: &ExtensionSnapshot) {
        let text = match snapshot.stage {
            ExtensionStage::Idle => return,
            ExtensionStage::Loading => "Checking extension options...".to_string(),
            ExtensionStage::Showing => {
                let choices: Vec<String> = snapshot
                    .options
                    .iter()
                    .map(|o| format!("{} min ({})", o.minutes, o.price_formatted))
                    .collect();
                let card = snapshot
                    .card
                    .as_ref()
                    .map(|c| format!(" on {} ending {}", c.brand, c.last4))
                    .unwrap_or_default();
                format!(
                    "Extend your session{}? {} | `select N`, `dismiss`",
                    card,
                    choices.join(", ")
                )
            }
            ExtensionStage::Confirming => format!(
                "Extend by {} minutes? `confirm` or `dismiss`",
                snapshot.selected.unwrap_or_default()
            ),
            ExtensionStage::Processing => "Processing payment...".to_string(),
            ExtensionStage::Success | ExtensionStage::Error | ExtensionStage::Declined => snapshot
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", snapshot.stage)),
        };
        self.line(&text);
    }

    fn bring_to_front(&mut self) {
        tracing::debug!(display_id = self.display_id, "Bring to front");
    }
}

/// Parses one line typed at the kiosk terminal.
pub fn parse_input(line: &str) -> Option<UserInput> {
    let mut words = line.split_whitespace();
    match words.next()?.to_ascii_lowercase().as_str() {
        "select" | "s" => words.next()?.parse().ok().map(UserInput::Select),
        "confirm" | "c" | "yes" => Some(UserInput::Confirm),
        "dismiss" | "d" | "no" => Some(UserInput::Dismiss),
        "quit" | "exit" => Some(UserInput::Quit),
        _ => None,
    }
}

/// Forwards stdin commands to the runtime until stdin closes.
pub fn spawn_stdin_reader(events: Sender<RuntimeEvent>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_input(&line) {
                Some(input) => {
                    if events.send(RuntimeEvent::Input(input)).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::info!(input = %line.trim(), "Unrecognised command"),
            }
        }
    });
}
