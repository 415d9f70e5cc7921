//! TAI-UTC clock service: downloads and caches IETF-format leap second
//! bulletins so EDI timestamps can carry the correct TAI offset.
//!
//! Sources are tried in order: the bulletin already in memory, the on-disk
//! cache (under an advisory file lock), then each configured URL. The
//! first call to [`ClockTai::get_offset`] blocks until a bulletin is found;
//! afterwards a background refresh runs once per hour.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use thiserror::Error;

/// Offset between the NTP epoch (1900) and the Unix epoch (1970):
/// `timestamp_unix = timestamp_ntp - NTP_UNIX_OFFSET`.
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// According to the Filesystem Hierarchy Standard, data in /var/tmp "must
/// not be deleted when the system is booted".
pub const TAI_CACHE_LOCATION: &str = "/var/tmp/holyrood-leap-seconds.cache";

/// The IETF stopped serving leap-seconds.list in late 2023; the TZ
/// distribution still carries it.
pub const DEFAULT_BULLETIN_URLS: &[&str] =
    &["https://raw.githubusercontent.com/eggert/tz/master/leap-seconds.list"];

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const REFRESH_RETRY_INTERVAL: Duration = Duration::from_secs(3600);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

static RE_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^([0-9]+)\s+([0-9]+)\s+#").unwrap());
static RE_EXPIRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#@\s+([0-9]+)").unwrap());

#[derive(Debug, Error)]
pub enum TaiClockError {
    #[error("TAI-UTC bulletin download from {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("no data in TAI bulletin")]
    NoData,

    #[error("unreasonable TAI-UTC offset {0}")]
    UnreasonableOffset(i32),

    #[error("no usable TAI bulletin found in cache or URLs")]
    NoUsableBulletin,

    #[error("cannot store an artificial bulletin to cache")]
    OverrideNotCacheable,

    #[error("parameter '{0}' is read-only")]
    ReadOnlyParameter(String),

    #[error("parameter '{0}' does not exist")]
    UnknownParameter(String),

    #[error("invalid value for parameter '{parameter}': {value}")]
    BadParameterValue { parameter: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed summary of a bulletin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulletinState {
    pub valid: bool,
    /// Unix seconds at which the bulletin expires.
    pub expires_at: i64,
    /// TAI-UTC in seconds.
    pub offset: i32,
}

impl BulletinState {
    pub fn expires_in(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    pub fn usable(&self, now: i64) -> bool {
        self.valid && self.expires_in(now) > 0
    }
}

/// Read the TAI offset from the entry lines of an IETF bulletin, e.g.
/// `3692217600 37 # 1 Jan 2017`. Entries whose NTP timestamp lies in the
/// future announce an upcoming leap second and are ignored.
fn parse_ietf_bulletin(bulletin: &str, now: i64) -> Result<i32, TaiClockError> {
    let mut offset = None;

    for capture in RE_ENTRY.captures_iter(bulletin) {
        let ntp_timestamp: i64 = match capture[1].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let entry_offset: i32 = match capture[2].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };

        if ntp_timestamp - NTP_UNIX_OFFSET < now {
            offset = Some(entry_offset);
        }
    }

    let offset = offset.ok_or(TaiClockError::NoData)?;

    // With the current evolution of the offset we will reach 500 long
    // after DAB gets replaced by another standard.
    if !(0..=500).contains(&offset) {
        return Err(TaiClockError::UnreasonableOffset(offset));
    }
    Ok(offset)
}

#[derive(Debug, Clone)]
enum BulletinData {
    Text(String),
    Override { offset: i32, expires_at: i64 },
}

/// One bulletin with its provenance: downloaded text, cache-file text, or
/// a manual override.
#[derive(Debug, Clone)]
pub struct Bulletin {
    source: String,
    data: BulletinData,
}

impl Bulletin {
    fn empty() -> Self {
        Bulletin {
            source: String::new(),
            data: BulletinData::Text(String::new()),
        }
    }

    pub fn from_text(source: &str, text: &str) -> Self {
        Bulletin {
            source: source.to_owned(),
            data: BulletinData::Text(text.to_owned()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn download_from_url(url: &str) -> Result<Self, TaiClockError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| TaiClockError::DownloadFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;

        let text = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| TaiClockError::DownloadFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(Bulletin::from_text(url, &text))
    }

    /// Read the cache file under an exclusive advisory lock.
    pub fn load_from_file(path: &Path) -> Result<Self, TaiClockError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from_raw_os_error(errno as i32))?;

        let mut text = String::new();
        locked.read_to_string(&mut text)?;

        Ok(Bulletin::from_text(&path.to_string_lossy(), &text))
    }

    /// Rewrite the cache file under the same lock the readers take.
    pub fn store_to_cache(&self, path: &Path) -> Result<(), TaiClockError> {
        let text = match &self.data {
            BulletinData::Text(text) => text,
            BulletinData::Override { .. } => return Err(TaiClockError::OverrideNotCacheable),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from_raw_os_error(errno as i32))?;

        locked.set_len(0)?;
        locked.seek(SeekFrom::Start(0))?;
        locked.write_all(text.as_bytes())?;
        debug!("TAI-UTC bulletin cache updated");
        Ok(())
    }

    /// Synthetic bulletin used by the manual override; ten years is
    /// equivalent to infinity here.
    pub fn create_with_fixed_offset(offset: i32, now: i64) -> Self {
        Bulletin {
            source: "manual override".to_owned(),
            data: BulletinData::Override {
                offset,
                expires_at: now + 10 * 365 * 24 * 3600,
            },
        }
    }

    /// Changing the URL list expires an override so the source selection
    /// no longer prefers it.
    pub fn clear_expiry_if_overridden(&mut self, now: i64) {
        if let BulletinData::Override { expires_at, .. } = &mut self.data {
            *expires_at = now;
        }
    }

    /// Parse expiry (`#@ <NTP seconds>`) and offset out of the bulletin.
    pub fn state(&self, now: i64) -> BulletinState {
        match &self.data {
            BulletinData::Override { offset, expires_at } => BulletinState {
                valid: true,
                expires_at: *expires_at,
                offset: *offset,
            },
            BulletinData::Text(text) => {
                let mut state = BulletinState::default();

                let Some(capture) = RE_EXPIRY.captures(text) else {
                    return state;
                };
                let Ok(expiry_ntp) = capture[1].parse::<i64>() else {
                    return state;
                };

                state.expires_at = expiry_ntp - NTP_UNIX_OFFSET;
                match parse_ietf_bulletin(text, now) {
                    Ok(offset) => {
                        state.offset = offset;
                        state.valid = true;
                    }
                    Err(e) => {
                        warn!("Could not parse bulletin from {}: {}", self.source, e);
                    }
                }
                state
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

type RefreshResult = Result<(Bulletin, BulletinState), TaiClockError>;

struct Inner {
    bulletin: Bulletin,
    state: Option<BulletinState>,
    /// None forces a refresh on the next call.
    state_last_updated: Option<Instant>,
    bulletin_urls: Vec<String>,
    cache_path: PathBuf,
    refresh: Option<Receiver<RefreshResult>>,
}

/// The clock service. All state sits behind one lock; `get_offset` blocks
/// only on the very first call.
pub struct ClockTai {
    inner: Mutex<Inner>,
}

impl ClockTai {
    pub fn new(bulletin_urls: Vec<String>) -> Self {
        Self::with_cache_path(bulletin_urls, PathBuf::from(TAI_CACHE_LOCATION))
    }

    /// The cache location is injectable for tests.
    pub fn with_cache_path(bulletin_urls: Vec<String>, cache_path: PathBuf) -> Self {
        let urls = if bulletin_urls.is_empty() {
            debug!("Initialising default TAI Bulletin URLs");
            DEFAULT_BULLETIN_URLS.iter().map(|s| s.to_string()).collect()
        } else {
            debug!("Initialising user-configured TAI Bulletin URLs");
            bulletin_urls
        };
        debug!("ClockTAI uses bulletin URL: '{}'", urls.join("|"));

        ClockTai {
            inner: Mutex::new(Inner {
                bulletin: Bulletin::empty(),
                state: None,
                state_last_updated: None,
                bulletin_urls: urls,
                cache_path,
                refresh: None,
            }),
        }
    }

    /// Walk the source hierarchy until a bulletin is usable; fall back to
    /// a valid but expired bulletin with a warning.
    fn get_valid_offset(
        bulletin: &Bulletin,
        urls: &[String],
        cache_path: &Path,
        now: i64,
    ) -> RefreshResult {
        let state = bulletin.state(now);
        if state.usable(now) {
            return Ok((bulletin.clone(), state));
        }

        let mut candidates = vec![bulletin.clone()];

        if let Ok(cache_bulletin) = Bulletin::load_from_file(cache_path) {
            let cache_state = cache_bulletin.state(now);
            if cache_state.usable(now) {
                return Ok((cache_bulletin, cache_state));
            }
            candidates.push(cache_bulletin);
        }

        for url in urls {
            match Bulletin::download_from_url(url) {
                Ok(new_bulletin) => {
                    let new_state = new_bulletin.state(now);
                    if new_state.usable(now) {
                        if let Err(e) = new_bulletin.store_to_cache(cache_path) {
                            warn!("TAI-UTC bulletin cache write failed: {}", e);
                        }
                        debug!(
                            "Loaded valid TAI Bulletin from {} giving offset={}",
                            url, new_state.offset
                        );
                        return Ok((new_bulletin, new_state));
                    }
                    debug!("Skipping invalid TAI bulletin from {}", url);
                    candidates.push(new_bulletin);
                }
                Err(e) => {
                    warn!("TAI-UTC offset could not be retrieved from {}: {}", url, e);
                }
            }
        }

        // Maybe a valid but expired bulletin is available. Prefer the one
        // expiring last.
        candidates.sort_by_key(|b| std::cmp::Reverse(b.state(now).expires_at));
        for candidate in candidates {
            let state = candidate.state(now);
            if state.valid {
                warn!(
                    "Taking TAI-UTC offset from expired bulletin from {}: {}s expired {}s ago",
                    candidate.source(),
                    state.offset,
                    -state.expires_in(now)
                );
                return Ok((candidate, state));
            }
        }

        Err(TaiClockError::NoUsableBulletin)
    }

    /// Current TAI-UTC offset in seconds. The first call blocks until a
    /// bulletin is found; subsequent calls return the cached offset and
    /// dispatch an hourly background refresh.
    pub fn get_offset(&self) -> Result<i32, TaiClockError> {
        let time_now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if inner.state.is_none() {
            // First time: block until we know the offset.
            let (bulletin, state) = Self::get_valid_offset(
                &inner.bulletin,
                &inner.bulletin_urls,
                &inner.cache_path,
                unix_now(),
            )?;
            inner.bulletin = bulletin;
            inner.state = Some(state);
            inner.state_last_updated = Some(time_now);
            info!("Initialised TAI-UTC offset to {}s.", state.offset);
        }

        let refresh_due = match inner.state_last_updated {
            Some(at) => at + REFRESH_INTERVAL < time_now,
            None => true,
        };

        if refresh_due {
            // Leap seconds are announced months in advance, so refreshing
            // hourly is generous already.
            match inner.refresh.take() {
                Some(receiver) => match receiver.try_recv() {
                    Ok(Ok((bulletin, state))) => {
                        inner.bulletin = bulletin;
                        inner.state = Some(state);
                        inner.state_last_updated = Some(time_now);
                        info!("Updated TAI-UTC offset to {}s.", state.offset);
                    }
                    Ok(Err(e)) => {
                        warn!("TAI-UTC refresh failed ({}), will retry in an hour", e);
                        inner.state_last_updated =
                            Some(time_now + REFRESH_RETRY_INTERVAL - REFRESH_INTERVAL);
                    }
                    Err(TryRecvError::Empty) => {
                        // not ready yet
                        inner.refresh = Some(receiver);
                    }
                    Err(TryRecvError::Disconnected) => {}
                },
                None => {
                    debug!("Trying to refresh TAI bulletin");
                    let (tx, rx) = std::sync::mpsc::channel();
                    let bulletin = inner.bulletin.clone();
                    let urls = inner.bulletin_urls.clone();
                    let cache_path = inner.cache_path.clone();
                    thread::Builder::new()
                        .name("tai-refresh".to_owned())
                        .spawn(move || {
                            let result = Self::get_valid_offset(
                                &bulletin,
                                &urls,
                                &cache_path,
                                unix_now(),
                            );
                            let _ = tx.send(result);
                        })?;
                    inner.refresh = Some(rx);
                }
            }
        }

        inner
            .state
            .map(|s| s.offset)
            .ok_or(TaiClockError::NoUsableBulletin)
    }

    pub fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), TaiClockError> {
        match parameter {
            "expiry" | "expires_at" => {
                Err(TaiClockError::ReadOnlyParameter(parameter.to_owned()))
            }
            "tai_utc_offset" => {
                let offset: i32 =
                    value
                        .parse()
                        .map_err(|_| TaiClockError::BadParameterValue {
                            parameter: parameter.to_owned(),
                            value: value.to_owned(),
                        })?;
                let bulletin = Bulletin::create_with_fixed_offset(offset, unix_now());
                warn!("ClockTAI: manually overriding TAI-UTC offset to {}", offset);

                let mut inner = self.inner.lock().unwrap();
                inner.state = Some(bulletin.state(unix_now()));
                inner.bulletin = bulletin;
                inner.state_last_updated = Some(Instant::now());
                Ok(())
            }
            "url" => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.bulletin_urls =
                        value.split('|').map(|s| s.trim().to_owned()).collect();
                    inner.state_last_updated = None;
                    inner.bulletin.clear_expiry_if_overridden(unix_now());
                }
                info!("ClockTAI: triggering a reload from URLs");
                Ok(())
            }
            _ => Err(TaiClockError::UnknownParameter(parameter.to_owned())),
        }
    }

    pub fn get_parameter(&self, parameter: &str) -> Result<String, TaiClockError> {
        let inner = self.inner.lock().unwrap();
        let now = unix_now();
        match parameter {
            "expiry" => Ok(inner.bulletin.state(now).expires_in(now).to_string()),
            "expires_at" => Ok(inner.bulletin.state(now).expires_at.to_string()),
            "tai_utc_offset" => inner
                .state
                .map(|s| s.offset.to_string())
                .ok_or_else(|| TaiClockError::UnknownParameter(parameter.to_owned())),
            "url" => Ok(inner.bulletin_urls.join("|")),
            _ => Err(TaiClockError::UnknownParameter(parameter.to_owned())),
        }
    }

    /// Statistics snapshot for the external monitoring surface.
    pub fn get_all_values(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let now = unix_now();
        let state = inner.bulletin.state(now);

        json!({
            "tai_utc_offset": state.offset,
            // negative when expired, 0 when invalid
            "expiry": state.expires_in(now),
            "expires_at": if state.valid {
                serde_json::Value::from(state.expires_at)
            } else {
                serde_json::Value::Null
            },
            "url": inner.bulletin_urls.join("|"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2017-01-15, between the last published leap second and the example
    // bulletin's expiry
    const NOW: i64 = 1_484_438_400;

    const SAMPLE: &str = "\
# Sample extract
3676924800\t36\t# 1 Jul 2015
3692217600\t37\t# 1 Jan 2017
#@\t3707596800
";

    #[test]
    fn parse_offset_and_expiry() {
        let bulletin = Bulletin::from_text("test", SAMPLE);
        let state = bulletin.state(NOW);

        assert!(state.valid);
        assert_eq!(state.offset, 37);
        assert_eq!(state.expires_at, 3_707_596_800 - NTP_UNIX_OFFSET);
        assert_eq!(state.expires_at, 1_498_608_000);
        assert!(state.usable(NOW));
    }

    #[test]
    fn parsing_is_idempotent() {
        let bulletin = Bulletin::from_text("test", SAMPLE);
        assert_eq!(bulletin.state(NOW), bulletin.state(NOW));
    }

    #[test]
    fn future_entries_are_ignored() {
        let text = format!("{}4000000000\t38\t# future\n", SAMPLE);
        let bulletin = Bulletin::from_text("test", &text);
        assert_eq!(bulletin.state(NOW).offset, 37);
    }

    #[test]
    fn expired_bulletin_is_valid_but_not_usable() {
        let bulletin = Bulletin::from_text("test", SAMPLE);
        let now_2024 = 1_704_067_200;
        let state = bulletin.state(now_2024);
        assert!(state.valid);
        assert!(!state.usable(now_2024));
        assert!(state.expires_in(now_2024) < 0);
    }

    #[test]
    fn bulletin_without_expiry_is_invalid() {
        let bulletin = Bulletin::from_text("test", "3692217600\t37\t# 1 Jan 2017\n");
        assert!(!bulletin.state(NOW).valid);
    }

    #[test]
    fn bulletin_without_entries_is_invalid() {
        let bulletin = Bulletin::from_text("test", "#@\t3707596800\n");
        assert!(!bulletin.state(NOW).valid);
    }

    #[test]
    fn unreasonable_offset_rejected() {
        assert!(matches!(
            parse_ietf_bulletin("3692217600\t501\t# bogus\n", NOW),
            Err(TaiClockError::UnreasonableOffset(501))
        ));
    }

    #[test]
    fn override_expires_in_ten_years() {
        let bulletin = Bulletin::create_with_fixed_offset(39, NOW);
        let state = bulletin.state(NOW);
        assert!(state.usable(NOW));
        assert_eq!(state.offset, 39);
        assert_eq!(state.expires_at, NOW + 10 * 365 * 24 * 3600);

        let mut bulletin = bulletin;
        bulletin.clear_expiry_if_overridden(NOW);
        assert!(!bulletin.state(NOW).usable(NOW));
    }

    #[test]
    fn cache_round_trip_under_lock() {
        let path = std::env::temp_dir().join(format!(
            "holyrood-tai-test-{}.cache",
            std::process::id()
        ));
        let bulletin = Bulletin::from_text("test", SAMPLE);
        bulletin.store_to_cache(&path).unwrap();

        let loaded = Bulletin::load_from_file(&path).unwrap();
        assert_eq!(loaded.state(NOW), bulletin.state(NOW));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn cache_preferred_over_network() {
        // A usable cache must satisfy the fallback chain before any URL
        // is contacted; the unresolvable URL would otherwise error.
        let path = std::env::temp_dir().join(format!(
            "holyrood-tai-fallback-{}.cache",
            std::process::id()
        ));
        Bulletin::from_text("test", SAMPLE)
            .store_to_cache(&path)
            .unwrap();

        let urls = vec!["http://invalid.invalid/leap".to_owned()];
        let (bulletin, state) =
            ClockTai::get_valid_offset(&Bulletin::empty(), &urls, &path, NOW).unwrap();

        assert_eq!(state.offset, 37);
        assert_eq!(bulletin.source(), path.to_string_lossy());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn manual_override_through_parameters() {
        let clock = ClockTai::with_cache_path(
            vec!["http://invalid.invalid/leap".to_owned()],
            std::env::temp_dir().join("holyrood-tai-nonexistent.cache"),
        );
        clock.set_parameter("tai_utc_offset", "37").unwrap();
        assert_eq!(clock.get_offset().unwrap(), 37);
        assert_eq!(clock.get_parameter("tai_utc_offset").unwrap(), "37");

        assert!(matches!(
            clock.set_parameter("expiry", "1"),
            Err(TaiClockError::ReadOnlyParameter(_))
        ));
    }
}
