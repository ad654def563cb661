//! Shared serialization/deserialization utilities for configuration

/// Duration fields written as seconds
///
/// Serializes `std::time::Duration` as whole seconds. Deserializes either an
/// integer number of seconds or a string with a unit suffix (`"250ms"`,
/// `"10s"`, `"30m"`, `"1h"`), so probe intervals read naturally in TOML.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "dc_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds or a suffixed string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("seconds as an integer, or a string like \"10s\", \"30m\", \"250ms\"")
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse(value).ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    fn parse(value: &str) -> Option<Duration> {
        let value = value.trim();
        let split = value.find(|c: char| !c.is_ascii_digit())?;
        let (digits, unit) = value.split_at(split);
        let amount: u64 = digits.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
            "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
            _ => None,
        }
    }
}
