// =============================================================================
// Interval Calendar — canonical bucket boundaries per candle interval
// =============================================================================
//
// Pure functions only. Every candle in the system is keyed by the start of
// its bucket, and that start is always an exact multiple of the interval's
// duration (seconds since the UNIX epoch).
// =============================================================================

use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The fixed set of candle intervals the pipeline builds simultaneously.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    /// All supported intervals, shortest first.
    pub const ALL: [Interval; 7] = [
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H4,
        Interval::D1,
    ];

    /// Bucket width in seconds.
    pub const fn duration_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Resolution string understood by the upstream historical provider.
    pub const fn provider_resolution(self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::M30 => "30",
            Self::H1 => "60",
            Self::H4 => "240",
            Self::D1 => "D",
        }
    }

    /// Map a chart resolution (`"1"`, `"60"`, `"D"`, ...) or a plain label
    /// (`"1h"`) onto an interval.
    pub fn from_resolution(resolution: &str) -> Result<Self> {
        let r = resolution.trim();
        let iv = match r.to_ascii_uppercase().as_str() {
            "1" => Self::M1,
            "5" => Self::M5,
            "15" => Self::M15,
            "30" => Self::M30,
            "60" => Self::H1,
            "240" => Self::H4,
            "D" | "1D" | "1440" => Self::D1,
            _ => return r.parse(),
        };
        Ok(iv)
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|iv| iv.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unsupported interval label: {s:?}"))
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Start of the bucket containing `timestamp_secs`.
///
/// Uses Euclidean division so timestamps before the epoch still floor
/// downwards onto a multiple of the interval duration.
pub fn bucket_start(timestamp_secs: i64, interval: Interval) -> i64 {
    let d = interval.duration_secs();
    timestamp_secs.div_euclid(d) * d
}

/// Exclusive end of the bucket that starts at `bucket_start`.
pub fn bucket_end(bucket_start: i64, interval: Interval) -> i64 {
    bucket_start + interval.duration_secs()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_multiples_of_duration() {
        let ts = 1_700_000_123;
        for iv in Interval::ALL {
            let start = bucket_start(ts, iv);
            assert_eq!(start % iv.duration_secs(), 0, "{iv}");
            assert!(start <= ts && ts < bucket_end(start, iv), "{iv}");
        }
    }

    #[test]
    fn one_minute_rollover_boundaries() {
        assert_eq!(bucket_start(0, Interval::M1), 0);
        assert_eq!(bucket_start(59, Interval::M1), 0);
        assert_eq!(bucket_start(60, Interval::M1), 60);
        assert_eq!(bucket_start(65, Interval::M1), 60);
    }

    #[test]
    fn negative_timestamps_floor_downwards() {
        assert_eq!(bucket_start(-1, Interval::M1), -60);
        assert_eq!(bucket_start(-60, Interval::M1), -60);
    }

    #[test]
    fn daily_bucket_is_utc_midnight() {
        // 2023-11-14T22:13:20Z
        assert_eq!(bucket_start(1_700_000_000, Interval::D1), 1_699_920_000);
    }

    #[test]
    fn parse_labels_and_resolutions() {
        assert_eq!("4h".parse::<Interval>().unwrap(), Interval::H4);
        assert_eq!("1D".parse::<Interval>().unwrap(), Interval::D1);
        assert_eq!(Interval::from_resolution("60").unwrap(), Interval::H1);
        assert_eq!(Interval::from_resolution("D").unwrap(), Interval::D1);
        assert_eq!(Interval::from_resolution("15m").unwrap(), Interval::M15);
        assert!(Interval::from_resolution("2h").is_err());
        assert!("7m".parse::<Interval>().is_err());
    }

    #[test]
    fn provider_resolution_roundtrips() {
        for iv in Interval::ALL {
            assert_eq!(Interval::from_resolution(iv.provider_resolution()).unwrap(), iv);
        }
    }

    #[test]
    fn serde_uses_labels() {
        let json = serde_json::to_string(&Interval::M30).unwrap();
        assert_eq!(json, "\"30m\"");
        let iv: Interval = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(iv, Interval::H1);
    }
}
