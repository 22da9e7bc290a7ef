//! Offline booking cache.
//!
//! The last snapshot is written to `~/.baylock/bookings-cache.json` after every
//! store change so a restart without network still locks and unlocks correctly
//! until the first push. A cache from another day or another bay is ignored.

use chrono::NaiveDate;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::Path;

use baylock_core::{KioskError, Result};
use baylock_protocol::Booking;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBookings {
    pub bay_id: String,
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

fn io_error(context: &str, source: std::io::Error) -> KioskError {
    KioskError::Io {
        context: context.to_string(),
        source,
    }
}

/// Returns the cached bookings when they belong to `bay_id` on `today`.
pub fn load(path: &Path, bay_id: &str, today: NaiveDate) -> Result<Option<Vec<Booking>>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error("reading booking cache", err)),
    };

    let cached: CachedBookings =
        serde_json::from_slice(&data).map_err(|source| KioskError::Json {
            context: format!("parsing {}", path.display()),
            source,
        })?;
    if cached.bay_id != bay_id || cached.date != today {
        tracing::info!(
            cached_bay = %cached.bay_id,
            cached_date = %cached.date,
            "Ignoring stale booking cache"
        );
        return Ok(None);
    }
    Ok(Some(cached.bookings))
}

pub fn save(path: &Path, cached: &CachedBookings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error("creating booking cache dir", err))?;
    }

    let payload = serde_json::to_vec_pretty(cached).map_err(|source| KioskError::Json {
        context: "serializing booking cache".to_string(),
        source,
    })?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| io_error("writing booking cache", err))?;
    fs::rename(&tmp_path, path).map_err(|err| io_error("committing booking cache", err))?;
    Ok(())
}

pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("removing booking cache", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baylock_protocol::BookingStatus;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, d).unwrap()
    }

    fn cached(bay_id: &str, date: NaiveDate) -> CachedBookings {
        CachedBookings {
            bay_id: bay_id.to_string(),
            date,
            bookings: vec![Booking {
                id: "b1".to_string(),
                bay_id: bay_id.to_string(),
                user_id: None,
                start_time: "9:00 AM".to_string(),
                end_time: "10:00 AM".to_string(),
                status: BookingStatus::Confirmed,
                user_name: None,
            }],
        }
    }

    #[test]
    fn todays_cache_for_this_bay_is_loaded() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("cache.json");
        save(&path, &cached("bay-1", day(4))).expect("save");

        let loaded = load(&path, "bay-1", day(4)).expect("load").expect("present");
        assert_eq!(loaded.len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn stale_or_foreign_cache_is_ignored() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("cache.json");
        save(&path, &cached("bay-1", day(4))).expect("save");

        assert_eq!(load(&path, "bay-1", day(5)).expect("load"), None);
        assert_eq!(load(&path, "bay-2", day(4)).expect("load"), None);
    }

    #[test]
    fn corrupt_cache_reports_json_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("cache.json");
        std::fs::write(&path, b"{not json").expect("write");

        let err = load(&path, "bay-1", day(4)).unwrap_err();
        assert!(matches!(err, KioskError::Json { .. }));
    }

    #[test]
    fn missing_cache_is_not_an_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("cache.json");
        assert_eq!(load(&path, "bay-1", day(4)).expect("load"), None);
        assert!(remove(&path).is_ok());
    }
}
