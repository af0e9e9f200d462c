use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ConfigError;

/// Developer identity as typed by the user.
///
/// Always a non-empty ASCII digit string. Leading zeros are significant and
/// the value is never converted to an integer for storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeveloperId(String);

impl DeveloperId {
    pub const SHARED: &'static str = "0";

    pub fn shared() -> Self {
        Self(Self::SHARED.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self(raw.to_string()));
        }
        Err(ConfigError::InvalidDeveloperId(raw.to_string()))
    }

    pub fn from_number(n: u64) -> Self {
        Self(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `"0"`, `"00"`, ... all select the shared infrastructure.
    pub fn is_shared(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    /// Host port offset for developer-isolated infrastructure.
    pub fn port_offset(&self) -> u32 {
        self.0
            .parse::<u32>()
            .map(|n| n.saturating_mul(100))
            .unwrap_or(u32::MAX)
    }
}

impl Default for DeveloperId {
    fn default() -> Self {
        Self::shared()
    }
}

impl fmt::Display for DeveloperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DeveloperId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct DeveloperIdVisitor;

impl<'de> Visitor<'de> for DeveloperIdVisitor {
    type Value = DeveloperId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative digit string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        DeveloperId::parse(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(DeveloperId::from_number(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(DeveloperId::from_number)
            .map_err(|_| E::custom(ConfigError::InvalidDeveloperId(v.to_string())))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
            return Ok(DeveloperId::from_number(v as u64));
        }
        Err(E::custom(ConfigError::InvalidDeveloperId(v.to_string())))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(DeveloperId::shared())
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(DeveloperId::shared())
    }
}

impl<'de> Deserialize<'de> for DeveloperId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DeveloperIdVisitor)
    }
}
