//! Simple logging module with macros.

use std::fmt::Display;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

impl Level {
    /// Parses a level name as accepted by `CF_LOG`. `off` yields `None`.
    pub fn parse(name: &str) -> Result<Option<Level>, String> {
        match name.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Some(Level::Info)),
            "warn" => Ok(Some(Level::Warn)),
            "error" => Ok(Some(Level::Error)),
            "off" => Ok(None),
            other => Err(format!("unknown log level '{other}'")),
        }
    }

    fn color(self) -> Option<Color> {
        match self {
            Level::Info => None,
            Level::Warn => Some(Color::Yellow),
            Level::Error => Some(Color::Red),
        }
    }
}

/// Converts days since Unix epoch to (year, month, day).
fn days_to_date(days: u64) -> (u32, u32, u32) {
    // Algorithm based on Howard Hinnant's date algorithms
    let z = days as i64 + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y as u32, m, d)
}

/// Messages below this level are dropped. Above `Error` silences everything.
pub static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Sets the minimum level logged; `None` turns logging off.
pub fn set_min_level(level: Option<Level>) {
    let value = level.map_or(u8::MAX, |level| level as u8);
    MIN_LEVEL.store(value, Ordering::Relaxed);
}

fn enabled(level: Level) -> bool {
    level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

/// `YYYY-MM-DD hh:mm:ss.mmm` (UTC) for a time since the Unix epoch.
fn timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day) = days_to_date(secs / 86400);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        since_epoch.subsec_millis()
    )
}

/// Internal logging function. Use the `info!`, `warn!`, or `error!` macros instead.
#[doc(hidden)]
pub fn log(level: Level, message: &str) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let mut spec = ColorSpec::new();
    spec.set_fg(level.color()).set_bold(level != Level::Info);
    let _ = stderr.set_color(&spec);
    let _ = writeln!(stderr, "{} [{:5}] {}", timestamp(now), level, message);
    let _ = stderr.reset();
}

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Info, &format!($($arg)*), );
        }
    }};
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Warn, &format!($($arg)*))
        }
    }};
}

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Error, &format!($($arg)*))
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn level_display() {
        assert_eq!(format!("{}", Level::Info), "INFO");
        assert_eq!(format!("{}", Level::Warn), "WARN");
        assert_eq!(format!("{}", Level::Error), "ERROR");
        assert_eq!(format!("[{:5}]", Level::Info), "[INFO ]");
    }

    #[test]
    fn level_parse() {
        assert_eq!(Level::parse("warn"), Ok(Some(Level::Warn)));
        assert_eq!(Level::parse(" ERROR "), Ok(Some(Level::Error)));
        assert_eq!(Level::parse("off"), Ok(None));
        assert!(Level::parse("verbose").is_err());
    }

    #[test]
    fn min_level_filters() {
        set_min_level(Some(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(enabled(Level::Error));
        set_min_level(None);
        assert!(!enabled(Level::Error));
        set_min_level(Some(Level::Info));
        assert!(enabled(Level::Info));
    }

    #[test]
    fn days_to_date_handles_leap_days() {
        assert_eq!(days_to_date(0), (1970, 1, 1));
        assert_eq!(days_to_date(19723), (2024, 1, 1));
        assert_eq!(days_to_date(19782), (2024, 2, 29));
    }

    #[test]
    fn timestamp_is_utc_with_millis() {
        let at = Duration::from_millis(19782 * 86_400_000 + 13 * 3_600_000 + 5 * 60_000 + 9_042);
        assert_eq!(timestamp(at), "2024-02-29 13:05:09.042");
        assert_eq!(timestamp(Duration::ZERO), "1970-01-01 00:00:00.000");
    }

    #[test]
    fn only_problems_are_colored() {
        assert_eq!(Level::Info.color(), None);
        assert_eq!(Level::Warn.color(), Some(Color::Yellow));
        assert_eq!(Level::Error.color(), Some(Color::Red));
    }
}
