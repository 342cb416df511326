//! # Latest-File Discovery
//!
//! The data logger writes one file per day into a fixed FTP directory and
//! names it after the date (`day150226.dat`, `day15022026.dat`) or, on older
//! firmware, after a running index (`day1.dat` ... `day10.dat`). The device
//! clock is not trusted, so the file to fetch is chosen from what the server
//! actually lists rather than computed from "today".
//!
//! ## Selection Rules:
//! - A name qualifies when it starts with `day`, ends with `.dat` (both
//!   case-insensitive) and has at least one digit in between.
//! - The digits of the middle segment form the [`SortKey`]: six digits are
//!   `DDMMYY`, eight digits are `DDMMYYYY`, any other count is a plain index.
//! - Valid keys always beat unparseable ones, dates beat indices, and ties
//!   fall back to a case-insensitive comparison of the names.
//!
//! Every candidate and the final choice are logged, so the decision can be
//! reconstructed from the log alone.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use super::ftp_source::TransferError;

/// Case-insensitive prefix every data file carries.
pub const FILE_PREFIX: &str = "day";
/// Case-insensitive extension every data file carries.
pub const FILE_EXTENSION: &str = ".dat";

/// # Discovery Error
///
/// A recoverable failure to pick a file; the scheduler answers it with the
/// retry interval.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The listing call itself failed.
    #[error("Listing of {dir} failed: {reason}")]
    Listing {
        /// The directory that was listed.
        dir: String,
        /// The transfer error text.
        reason: String,
    },

    /// The listing was empty or nothing in it matched `day*.dat`.
    #[error("No day*.dat candidates found in {dir}")]
    NoCandidates {
        /// The directory that was searched.
        dir: String,
    },
}

/// # Listing Provider
///
/// Returns the raw, newline-delimited entries of a remote directory.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    /// Lists `dir`. Entries may be bare names or full paths.
    async fn list(&self, dir: &str) -> Result<String, TransferError>;
}

/// # Sort Key
///
/// The value derived from a file name. Variant order is significant: the
/// derived `Ord` ranks `Unparseable < Index < Date`, and dates compare as
/// `(year, month, day)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortKey {
    /// No usable digits, an index that overflows, or an impossible date.
    Unparseable,
    /// A plain running number (`day7.dat`).
    Index(u64),
    /// A calendar date (`day150226.dat` → 2026-02-15).
    Date {
        /// Four-digit year.
        year: u32,
        /// Month, 1-12.
        month: u32,
        /// Day of month, 1-31.
        day: u32,
    },
}

impl SortKey {
    /// Derives the key from the middle segment of a name (the part between
    /// the prefix and the extension). Non-digit characters are ignored.
    pub fn derive(middle: &str) -> SortKey {
        let digits: String = middle.chars().filter(|c| c.is_ascii_digit()).collect();
        match digits.len() {
            0 => SortKey::Unparseable,
            6 => date_key(&digits[4..6], &digits[2..4], &digits[0..2], 2000),
            8 => date_key(&digits[4..8], &digits[2..4], &digits[0..2], 0),
            _ => digits
                .parse::<u64>()
                .map(SortKey::Index)
                .unwrap_or(SortKey::Unparseable),
        }
    }
}

fn date_key(year: &str, month: &str, day: &str, century: u32) -> SortKey {
    let parsed = (year.parse::<u32>(), month.parse::<u32>(), day.parse::<u32>());
    match parsed {
        (Ok(year), Ok(month), Ok(day)) => {
            let year = century + year;
            match NaiveDate::from_ymd_opt(year as i32, month, day) {
                Some(_) => SortKey::Date { year, month, day },
                None => SortKey::Unparseable,
            }
        }
        _ => SortKey::Unparseable,
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Unparseable => write!(f, "unparseable"),
            SortKey::Index(index) => write!(f, "index {}", index),
            SortKey::Date { year, month, day } => {
                write!(f, "date {:04}-{:02}-{:02}", year, month, day)
            }
        }
    }
}

/// # Candidate
///
/// A qualifying remote file name together with its derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The bare file name as listed by the server.
    pub name: String,
    /// The key used for ordering.
    pub key: SortKey,
}

impl Candidate {
    /// Builds a candidate from a listing entry, or `None` when the entry does
    /// not qualify. Any directory part of the entry is dropped.
    pub fn parse(entry: &str) -> Option<Candidate> {
        let entry = entry.trim();
        let name = entry.rsplit('/').next().unwrap_or(entry);
        let middle = qualifying_middle(name)?;
        if !middle.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(Candidate {
            name: name.to_string(),
            key: SortKey::derive(middle),
        })
    }
}

fn qualifying_middle(name: &str) -> Option<&str> {
    let min_len = FILE_PREFIX.len() + FILE_EXTENSION.len();
    if name.len() <= min_len {
        return None;
    }
    let prefix = name.get(..FILE_PREFIX.len())?;
    let extension = name.get(name.len() - FILE_EXTENSION.len()..)?;
    if !prefix.eq_ignore_ascii_case(FILE_PREFIX) || !extension.eq_ignore_ascii_case(FILE_EXTENSION) {
        return None;
    }
    name.get(FILE_PREFIX.len()..name.len() - FILE_EXTENSION.len())
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.name.to_lowercase().cmp(&other.name.to_lowercase()))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Picks the latest candidate out of a raw listing of `dir`.
pub fn select_latest(listing: &str, dir: &str) -> Result<Candidate, DiscoveryError> {
    let mut seen = 0usize;
    let mut best: Option<Candidate> = None;

    for candidate in listing.lines().filter_map(Candidate::parse) {
        seen += 1;
        log::info!("Discovery candidate in {}: {} ({})", dir, candidate.name, candidate.key);
        best = match best {
            Some(current) if current >= candidate => Some(current),
            _ => Some(candidate),
        };
    }

    match best {
        Some(choice) => {
            log::info!(
                "Discovery selected {} ({}) out of {} candidate(s) in {}",
                choice.name,
                choice.key,
                seen,
                dir
            );
            Ok(choice)
        }
        None => Err(DiscoveryError::NoCandidates {
            dir: dir.to_string(),
        }),
    }
}

/// Joins a remote directory and a file name with exactly one `/`.
pub fn remote_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// # File Discovery
///
/// Lists a remote directory through a [`ListingProvider`] and selects the
/// latest data file in it.
pub struct FileDiscovery {
    /// Where the directory entries come from.
    provider: Arc<dyn ListingProvider>,
}

impl FileDiscovery {
    /// Creates a discovery over the given listing provider.
    pub fn new(provider: Arc<dyn ListingProvider>) -> Self {
        Self { provider }
    }

    /// Lists `dir` and returns the latest candidate in it.
    pub async fn select_latest(&self, dir: &str) -> Result<Candidate, DiscoveryError> {
        let listing = self
            .provider
            .list(dir)
            .await
            .map_err(|e| DiscoveryError::Listing {
                dir: dir.to_string(),
                reason: e.to_string(),
            })?;
        select_latest(&listing, dir)
    }

    /// Lists `dir` and returns the full remote path of the latest file.
    pub async fn discover(&self, dir: &str) -> Result<String, DiscoveryError> {
        let choice = self.select_latest(dir).await?;
        Ok(remote_path(dir, &choice.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: &str = "/CFDisk/mindata/";

    fn pick(names: &[&str]) -> Result<Candidate, DiscoveryError> {
        select_latest(&names.join("\n"), DIR)
    }

    #[test]
    fn picks_latest_short_date() {
        let chosen = pick(&["day150226.dat", "day310126.dat", "day010126.dat"]).unwrap();
        assert_eq!(chosen.name, "day150226.dat");
        assert_eq!(chosen.key, SortKey::Date { year: 2026, month: 2, day: 15 });
    }

    #[test]
    fn compares_year_before_month_and_day() {
        let chosen = pick(&["day311225.dat", "day010126.dat", "day300625.dat"]).unwrap();
        assert_eq!(chosen.name, "day010126.dat");
    }

    #[test]
    fn understands_long_dates() {
        let chosen = pick(&["day15022026.dat", "day31121999.dat"]).unwrap();
        assert_eq!(chosen.key, SortKey::Date { year: 2026, month: 2, day: 15 });
    }

    #[test]
    fn indices_compare_numerically() {
        let names: Vec<String> = (1..=10).map(|i| format!("day{}.dat", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let chosen = pick(&refs).unwrap();
        assert_eq!(chosen.name, "day10.dat");
        assert_eq!(chosen.key, SortKey::Index(10));
    }

    #[test]
    fn matching_is_case_insensitive_and_strips_paths() {
        let listing = "/CFDisk/mindata/DAY020126.DAT\r\n  day010126.dat  \r\n";
        let chosen = select_latest(listing, DIR).unwrap();
        assert_eq!(chosen.name, "DAY020126.DAT");
    }

    #[test]
    fn ignores_non_qualifying_names() {
        let chosen = pick(&["dayabc.dat", "day010126.txt", "log010126.dat", "day.dat", "day5.dat"]).unwrap();
        assert_eq!(chosen.name, "day5.dat");
    }

    #[test]
    fn reports_directory_when_nothing_qualifies() {
        let err = pick(&["readme.txt", "dayx.dat"]).unwrap_err();
        match &err {
            DiscoveryError::NoCandidates { dir } => assert_eq!(dir, DIR),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains(DIR));
        assert!(matches!(select_latest("", DIR), Err(DiscoveryError::NoCandidates { .. })));
    }

    #[test]
    fn valid_keys_beat_unparseable_ones() {
        // 13th month: six digits but not a date.
        let chosen = pick(&["day011326.dat", "day3.dat"]).unwrap();
        assert_eq!(chosen.name, "day3.dat");
        assert_eq!(SortKey::derive("011326"), SortKey::Unparseable);
        // Index overflowing u64.
        assert_eq!(SortKey::derive("99999999999999999999999"), SortKey::Unparseable);
    }

    #[test]
    fn ties_fall_back_to_case_insensitive_names() {
        let chosen = pick(&["day_b_010126.dat", "day_A_010126.dat"]).unwrap();
        assert_eq!(chosen.name, "day_b_010126.dat");
    }

    #[test]
    fn key_order_is_total() {
        let date = SortKey::Date { year: 2024, month: 1, day: 1 };
        assert!(SortKey::Unparseable < SortKey::Index(0));
        assert!(SortKey::Index(u64::MAX) < date);
        assert!(date < SortKey::Date { year: 2024, month: 1, day: 2 });
    }

    #[test]
    fn joins_remote_paths() {
        assert_eq!(remote_path("/CFDisk/mindata/", "day1.dat"), "/CFDisk/mindata/day1.dat");
        assert_eq!(remote_path("/CFDisk/mindata", "day1.dat"), "/CFDisk/mindata/day1.dat");
        assert_eq!(remote_path("", "day1.dat"), "day1.dat");
    }

    struct FixedListing(Result<&'static str, &'static str>);

    #[async_trait]
    impl ListingProvider for FixedListing {
        async fn list(&self, _dir: &str) -> Result<String, TransferError> {
            self.0
                .map(str::to_string)
                .map_err(|e| TransferError::Protocol(e.to_string()))
        }
    }

    #[tokio::test]
    async fn discovery_wraps_listing_failures() {
        let discovery = FileDiscovery::new(Arc::new(FixedListing(Err("550 no such directory"))));
        let err = discovery.select_latest(DIR).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Listing { .. }));
        assert!(err.to_string().contains("550"));

        let discovery = FileDiscovery::new(Arc::new(FixedListing(Ok("day1.dat\nday2.dat"))));
        assert_eq!(discovery.select_latest(DIR).await.unwrap().name, "day2.dat");
        assert_eq!(discovery.discover(DIR).await.unwrap(), "/CFDisk/mindata/day2.dat");
    }
}
