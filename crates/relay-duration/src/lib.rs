//! Duration (de)serialization for relay config structs.
//!
//! Accepts either a human-readable string (`"30s"`, `"2m"`) or a raw u64 of
//! milliseconds on the way in; always serializes back out as milliseconds
//! so round-tripping through `deserialize`/`serialize` is stable.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        Millis(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Serde helper for `Option<Duration>` fields, same accepted shapes.
pub mod option {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            None,
            String(String),
            Millis(u64),
        }
        match Option::<Helper>::deserialize(deserializer)? {
            None | Some(Helper::None) => Ok(None),
            Some(Helper::String(s)) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
            Some(Helper::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        }
    }

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}
