use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// How long the server retains a query's sync state after its last
/// subscriber drops, when the client doesn't say otherwise.
pub const DEFAULT_TTL_MS: u64 = 300_000;

/// Ttl is a retention hint: an explicit duration in milliseconds, or the
/// `"default"` sentinel resolved by [`DEFAULT_TTL_MS`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Ttl {
    #[default]
    Default,
    Millis(u64),
}

impl Ttl {
    pub fn as_millis(&self) -> u64 {
        match self {
            Ttl::Default => DEFAULT_TTL_MS,
            Ttl::Millis(ms) => *ms,
        }
    }
}

impl From<u64> for Ttl {
    fn from(ms: u64) -> Self {
        Ttl::Millis(ms)
    }
}

impl Serialize for Ttl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Ttl::Default => serializer.serialize_str("default"),
            Ttl::Millis(ms) => serializer.serialize_u64(*ms),
        }
    }
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Millis(u64),
            Sentinel(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(Ttl::Millis(ms)),
            Repr::Sentinel(s) if s == "default" => Ok(Ttl::Default),
            Repr::Sentinel(s) => Err(serde::de::Error::custom(format!(
                "invalid ttl '{s}': expected a duration in milliseconds or \"default\""
            ))),
        }
    }
}
