use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::SyncError;

/// Milliseconds between the Unix epoch and 2015-01-01T00:00:00Z.
const UPSTREAM_EPOCH_MS: u64 = 1_420_070_400_000;

/// Upstream-assigned 64-bit identifier. Ordering follows creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(u64);

impl Snowflake {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation("empty id".to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| SyncError::Validation(format!("malformed id: {raw:?}")))
    }

    pub fn created_at(self) -> DateTime<Utc> {
        let millis = (self.0 >> 22) + UPSTREAM_EPOCH_MS;
        Utc.timestamp_millis_opt(millis as i64)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake id as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Snowflake(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(Snowflake)
                    .map_err(|_| E::custom(format!("negative id: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Snowflake::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_and_non_numeric() {
        assert!(matches!(
            Snowflake::parse(""),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            Snowflake::parse("abc"),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            Snowflake::parse("-5"),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(Snowflake::parse(" 42 ").unwrap(), Snowflake::new(42));
    }

    #[test]
    fn ordering_is_numeric_not_lexicographic() {
        let small: Snowflake = "99".parse().unwrap();
        let large: Snowflake = "100".parse().unwrap();
        assert!(small < large);
    }

    #[test]
    fn full_width_ids_survive_json() {
        let id = Snowflake::new(u64::MAX);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", u64::MAX));
        let back: Snowflake = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let from_number: Snowflake = serde_json::from_str("175928847299117063").unwrap();
        assert_eq!(from_number.get(), 175_928_847_299_117_063);
    }

    #[test]
    fn created_at_decodes_high_bits() {
        let id = Snowflake::new(175_928_847_299_117_063);
        assert_eq!(id.created_at().to_rfc3339(), "2016-04-30T11:18:25.796+00:00");
        assert_eq!(Snowflake::new(0).created_at().timestamp_millis(), 1_420_070_400_000);
    }
}
