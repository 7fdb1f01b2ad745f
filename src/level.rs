//! Severity levels attached to telemetry records.
//!
//! `FemtoLevel` doubles as the minimum-severity threshold configured on the
//! engine. Two levels sit outside the ordinary severity ladder:
//! [`FemtoLevel::Analytics`] marks analytics events, which the threshold never
//! filters, and [`FemtoLevel::None`], which disables everything when used as
//! a threshold and is never persisted when used on a record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FemtoLevel {
    #[default]
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
    Analytics = 5,
    None = 6,
}

/// Error returned when a level name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown level {0:?}; expected debug, info, warn, error, fatal, analytics or none")]
pub struct ParseLevelError(pub String);

impl FemtoLevel {
    /// Lowercase name used on the wire and in configuration files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Analytics => "analytics",
            Self::None => "none",
        }
    }

    /// Convert a value previously produced by `self as u8`.
    ///
    /// Out-of-range values map to [`FemtoLevel::None`] so a corrupted
    /// threshold fails closed.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            3 => Self::Error,
            4 => Self::Fatal,
            5 => Self::Analytics,
            _ => Self::None,
        }
    }

    /// Decide whether a record at `self` survives the `threshold`.
    ///
    /// # Examples
    ///
    /// ```
    /// use femtotelemetry::FemtoLevel;
    ///
    /// assert!(FemtoLevel::Error.passes(FemtoLevel::Warn));
    /// assert!(!FemtoLevel::Info.passes(FemtoLevel::Warn));
    /// assert!(FemtoLevel::Analytics.passes(FemtoLevel::Fatal));
    /// assert!(!FemtoLevel::Fatal.passes(FemtoLevel::None));
    /// ```
    pub fn passes(self, threshold: FemtoLevel) -> bool {
        match (self, threshold) {
            (_, Self::None) | (Self::None, _) => false,
            (Self::Analytics, _) => true,
            (level, threshold) => level >= threshold,
        }
    }
}

impl fmt::Display for FemtoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FemtoLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" | "critical" => Ok(Self::Fatal),
            "analytics" => Ok(Self::Analytics),
            "none" | "off" => Ok(Self::None),
            _ => Err(ParseLevelError(s.to_owned())),
        }
    }
}

impl From<log::Level> for FemtoLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace | log::Level::Debug => Self::Debug,
            log::Level::Info => Self::Info,
            log::Level::Warn => Self::Warn,
            log::Level::Error => Self::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FemtoLevel::Debug, FemtoLevel::Debug, true)]
    #[case(FemtoLevel::Debug, FemtoLevel::Warn, false)]
    #[case(FemtoLevel::Info, FemtoLevel::Warn, false)]
    #[case(FemtoLevel::Warn, FemtoLevel::Warn, true)]
    #[case(FemtoLevel::Fatal, FemtoLevel::Error, true)]
    #[case(FemtoLevel::Analytics, FemtoLevel::Fatal, true)]
    #[case(FemtoLevel::Analytics, FemtoLevel::None, false)]
    #[case(FemtoLevel::None, FemtoLevel::Debug, false)]
    #[case(FemtoLevel::Error, FemtoLevel::None, false)]
    fn threshold_filtering(
        #[case] level: FemtoLevel,
        #[case] threshold: FemtoLevel,
        #[case] expected: bool,
    ) {
        assert_eq!(level.passes(threshold), expected);
    }

    #[rstest]
    #[case("WARNING", FemtoLevel::Warn)]
    #[case(" info ", FemtoLevel::Info)]
    #[case("critical", FemtoLevel::Fatal)]
    #[case("off", FemtoLevel::None)]
    fn parses_aliases(#[case] input: &str, #[case] expected: FemtoLevel) {
        assert_eq!(input.parse::<FemtoLevel>(), Ok(expected));
    }

    #[test]
    fn rejects_unknown_names() {
        let err = "loud".parse::<FemtoLevel>().unwrap_err();
        assert_eq!(err, ParseLevelError("loud".into()));
    }

    #[test]
    fn u8_round_trip_covers_every_level() {
        for level in [
            FemtoLevel::Debug,
            FemtoLevel::Info,
            FemtoLevel::Warn,
            FemtoLevel::Error,
            FemtoLevel::Fatal,
            FemtoLevel::Analytics,
            FemtoLevel::None,
        ] {
            assert_eq!(FemtoLevel::from_u8(level as u8), level);
        }
        assert_eq!(FemtoLevel::from_u8(200), FemtoLevel::None);
    }
}
