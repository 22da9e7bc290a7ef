//! # baylock-core
//!
//! Booking reconciliation and lock state for a single golf bay.
//!
//! This crate has no I/O beyond reading the kiosk configuration. The daemon
//! owns the canonical [`BookingStore`] and override; every display process
//! keeps a broadcast copy and runs its own [`LockReconciler`] against it.
//!
//! ## Design Principles
//!
//! - **Local wall clock**: booking labels are `h:mm AM/PM` with no zone, so all
//!   reconciliation happens on `chrono::NaiveDateTime`.
//! - **Fail locked**: an unknown, empty, or unloaded store always locks.
//! - **Explicit time**: every decision takes `now` as an argument.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use baylock_core::{BookingStore, LockReconciler, ManualOverride};
//!
//! let mut reconciler = LockReconciler::new();
//! let transition = reconciler.reconcile(Some("bay-3"), &store, &ManualOverride::inactive(), now);
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod extension;
pub mod manual_override;
pub mod reconciler;
pub mod schedule;
pub mod store;

pub use access::{session_event, AccessLedger, KIOSK_USER_AGENT};
pub use config::{load_config, KioskConfig, TimingConfig};
pub use error::{KioskError, Result};
pub use extension::{fitting_options, gap_until_next, should_trigger, ExtensionFlow};
pub use manual_override::ManualOverride;
pub use reconciler::{active_booking, desired_state, ActiveSession, LockReconciler, LockState, Transition};
pub use schedule::{parse_time_of_day, parse_today, Window};
pub use store::BookingStore;
