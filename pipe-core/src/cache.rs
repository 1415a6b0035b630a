// Step cache
// Successful step results keyed by step id, user-wide (deliberately not
// scoped per pipeline), with duration or wall-clock expiry

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Paths;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Single,
    Strings,
    SubRuns,
}

/// A cached step result. Lifetime is independent of any run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub step_id: String,
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    /// Captured stdout; empty for sensitive steps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default)]
    pub sensitive: bool,
    pub run_type: RunType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_outputs: Vec<SubEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default)]
    pub sensitive: bool,
    pub exit_code: i32,
}

/// One JSON file per step id under the cache root. Atomic rename is the
/// only cross-process defense: a concurrent writer may win the rename,
/// which is acceptable because the cache is purely an optimization.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.cache.clone(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, step_id: &str) -> PathBuf {
        self.dir.join(format!("{step_id}.json"))
    }

    pub fn save(&self, entry: &Entry) -> Result<()> {
        let path = self.path(&entry.step_id);
        let data = serde_json::to_string_pretty(entry).map_err(|e| Error::CacheIo {
            step: entry.step_id.clone(),
            op: "serializing",
            source: std::io::Error::other(e),
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|source| Error::CacheIo {
            step: entry.step_id.clone(),
            op: "writing",
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| Error::CacheIo {
            step: entry.step_id.clone(),
            op: "renaming",
            source,
        })
    }

    /// Read the entry for a step id. A missing file is `Ok(None)`, not an
    /// error; a corrupt one is an error the caller degrades to a warning.
    pub fn load(&self, step_id: &str) -> Result<Option<Entry>> {
        let data = match std::fs::read_to_string(self.path(step_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::CacheIo {
                    step: step_id.to_string(),
                    op: "reading",
                    source,
                })
            }
        };
        let entry = serde_json::from_str(&data).map_err(|e| Error::CacheIo {
            step: step_id.to_string(),
            op: "parsing",
            source: std::io::Error::other(e),
        })?;
        Ok(Some(entry))
    }

    pub fn clear(&self, step_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(step_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::CacheIo {
                step: step_id.to_string(),
                op: "clearing",
                source,
            }),
        }
    }

    pub fn clear_all(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(Error::CacheIo {
                    step: String::new(),
                    op: "listing",
                    source,
                })
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                std::fs::remove_file(&path).map_err(|source| Error::CacheIo {
                    step: path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string(),
                    op: "clearing",
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// All readable entries, sorted by step id. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<Entry>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::CacheIo {
                    step: String::new(),
                    op: "listing",
                    source,
                })
            }
        };

        let mut result = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(step_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(Some(e)) = self.load(step_id) {
                result.push(e);
            }
        }
        result.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(result)
    }
}

/// Validity at `now`: no expiry, or strictly before it.
pub fn is_valid(entry: &Entry, now: DateTime<Utc>) -> bool {
    match entry.expires_at {
        None => true,
        Some(expires_at) => now < expires_at,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ExpiryError(String);

/// Parse an `expire_after` setting relative to `from` (the caching time).
///
/// Two shapes are accepted:
///
///   - a duration like `90m` or `1h30m` built from `s`, `m`, `h`, and `d`
///     components (summed),
///   - an absolute wall-clock time `HH:MM`, optionally followed by an IANA
///     zone name (default UTC), meaning the next occurrence of that time at
///     or after `from`.
///
/// Empty means "never expires".
pub fn parse_expiry(
    expr: &str,
    from: DateTime<Utc>,
) -> std::result::Result<Option<DateTime<Utc>>, ExpiryError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(None);
    }

    if let Some(duration) = parse_duration(expr) {
        return Ok(Some(from + duration));
    }

    if let Some(expires_at) = parse_clock_time(expr, from)? {
        return Ok(Some(expires_at));
    }

    Err(ExpiryError(format!(
        "expected a duration like \"1h30m\" or a time like \"18:10 UTC\", got {expr:?}"
    )))
}

/// `(Ns|Nm|Nh|Nd)+` with the components summed. Returns `None` when the
/// string is not entirely made of such components.
fn parse_duration(expr: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut seen_component = false;

    for c in expr.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return None;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        total = total
            + match c {
                's' => Duration::seconds(n),
                'm' => Duration::minutes(n),
                'h' => Duration::hours(n),
                'd' => Duration::days(n),
                _ => return None,
            };
        seen_component = true;
    }

    if !digits.is_empty() || !seen_component {
        return None;
    }
    Some(total)
}

/// `HH:MM[ TZ]`: the next occurrence of that wall-clock time in the given
/// zone at or after `from`. Returns `Ok(None)` when the string does not
/// look like a clock time at all; a bad zone name is a hard error.
fn parse_clock_time(
    expr: &str,
    from: DateTime<Utc>,
) -> std::result::Result<Option<DateTime<Utc>>, ExpiryError> {
    let mut parts = expr.splitn(2, ' ');
    let clock = parts.next().unwrap_or_default();
    let zone = parts.next().map(str::trim);

    let Ok(time) = NaiveTime::parse_from_str(clock, "%H:%M") else {
        return Ok(None);
    };

    let tz = match zone {
        None => Tz::UTC,
        Some(name) => {
            Tz::from_str(name).map_err(|_| ExpiryError(format!("unknown time zone {name:?}")))?
        }
    };

    let local_from = from.with_timezone(&tz);
    let mut date = local_from.date_naive();
    // DST gaps can make a wall-clock time unrepresentable for a day;
    // advance until it resolves.
    for _ in 0..3 {
        if let Some(candidate) = tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
        {
            if candidate >= from {
                return Ok(Some(candidate));
            }
        }
        date = date.succ_opt().ok_or_else(|| {
            ExpiryError(format!("cannot compute next occurrence of {expr:?}"))
        })?;
    }
    Err(ExpiryError(format!(
        "cannot compute next occurrence of {expr:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(step_id: &str) -> Entry {
        Entry {
            step_id: step_id.to_string(),
            cached_at: Utc::now(),
            expires_at: None,
            exit_code: 0,
            output: "hello\n".into(),
            sensitive: false,
            run_type: RunType::Single,
            sub_outputs: Vec::new(),
        }
    }

    fn store() -> (tempfile::TempDir, CacheStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::with_dir(tmp.path());
        (tmp, store)
    }

    #[test]
    fn save_load_round_trip() {
        let (_tmp, store) = store();
        store.save(&entry("build")).unwrap();
        let loaded = store.load("build").unwrap().unwrap();
        assert_eq!(loaded.step_id, "build");
        assert_eq!(loaded.output, "hello\n");
        assert_eq!(loaded.run_type, RunType::Single);
    }

    #[test]
    fn load_missing_is_none() {
        let (_tmp, store) = store();
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn clear_and_clear_all() {
        let (_tmp, store) = store();
        store.save(&entry("a")).unwrap();
        store.save(&entry("b")).unwrap();

        store.clear("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
        assert!(store.load("b").unwrap().is_some());

        store.clear_all().unwrap();
        assert!(store.list().unwrap().is_empty());

        // clearing a missing entry is fine
        store.clear("a").unwrap();
    }

    #[test]
    fn list_sorted_skips_corrupt() {
        let (tmp, store) = store();
        store.save(&entry("zeta")).unwrap();
        store.save(&entry("alpha")).unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{not json").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|e| e.step_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn validity() {
        let now = Utc::now();
        let mut e = entry("x");
        assert!(is_valid(&e, now));

        e.expires_at = Some(now + Duration::hours(1));
        assert!(is_valid(&e, now));

        e.expires_at = Some(now - Duration::seconds(1));
        assert!(!is_valid(&e, now));

        // boundary: expiry equal to now is expired
        e.expires_at = Some(now);
        assert!(!is_valid(&e, now));
    }

    #[test]
    fn expiry_durations() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_expiry("1h", from).unwrap(),
            Some(from + Duration::hours(1))
        );
        assert_eq!(
            parse_expiry("90m", from).unwrap(),
            Some(from + Duration::minutes(90))
        );
        assert_eq!(
            parse_expiry("1h30m", from).unwrap(),
            Some(from + Duration::minutes(90))
        );
        assert_eq!(
            parse_expiry("2d12h", from).unwrap(),
            Some(from + Duration::hours(60))
        );
        assert_eq!(
            parse_expiry("45s", from).unwrap(),
            Some(from + Duration::seconds(45))
        );
    }

    #[test]
    fn expiry_empty_never_expires() {
        assert_eq!(parse_expiry("", Utc::now()).unwrap(), None);
        assert_eq!(parse_expiry("   ", Utc::now()).unwrap(), None);
    }

    #[test]
    fn expiry_clock_time_same_day() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let expires = parse_expiry("18:10", from).unwrap().unwrap();
        assert_eq!(expires, Utc.with_ymd_and_hms(2024, 3, 1, 18, 10, 0).unwrap());
    }

    #[test]
    fn expiry_clock_time_rolls_to_next_day() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        let expires = parse_expiry("18:10", from).unwrap().unwrap();
        assert_eq!(expires, Utc.with_ymd_and_hms(2024, 3, 2, 18, 10, 0).unwrap());
    }

    #[test]
    fn expiry_clock_time_at_exactly_from_is_kept() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 18, 10, 0).unwrap();
        let expires = parse_expiry("18:10", from).unwrap().unwrap();
        assert_eq!(expires, from);
    }

    #[test]
    fn expiry_clock_time_with_zone() {
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        // 09:00 America/New_York is 13:00 UTC during DST
        let expires = parse_expiry("09:00 America/New_York", from).unwrap().unwrap();
        assert_eq!(expires, Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn expiry_invalid_inputs() {
        let from = Utc::now();
        assert!(parse_expiry("soon", from).is_err());
        assert!(parse_expiry("1x", from).is_err());
        assert!(parse_expiry("h1", from).is_err());
        assert!(parse_expiry("18:10 Mars/Olympus", from).is_err());
        assert!(parse_expiry("25:99", from).is_err());
    }

    #[test]
    fn cached_at_never_after_expiry() {
        // duration expiries are always at or after cached_at
        let from = Utc::now();
        for expr in ["0s", "1s", "1h", "1d"] {
            let expires = parse_expiry(expr, from).unwrap().unwrap();
            assert!(from <= expires, "{expr}: {from} > {expires}");
        }
    }
}
