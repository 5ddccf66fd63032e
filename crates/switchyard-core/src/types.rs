//! Shared types used across Switchyard crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Traffic share in whole percent (0-100).
pub type Percent = u8;

/// Identifier of a registered service environment.
///
/// The set is closed: two blue-green slots, a canary slot, and numbered
/// replicas for high-availability layouts. Serialized as a lowercase string
/// (`"primary"`, `"replica-2"`) so it can key JSON and TOML maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EnvironmentId {
    Primary,
    Secondary,
    Canary,
    Replica(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown environment id: {0:?}")]
pub struct ParseEnvironmentIdError(pub String);

impl EnvironmentId {
    /// The conventional peer for blue-green pairs.
    pub fn peer(&self) -> Option<Self> {
        match self {
            EnvironmentId::Primary => Some(EnvironmentId::Secondary),
            EnvironmentId::Secondary => Some(EnvironmentId::Primary),
            _ => None,
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentId::Primary => f.write_str("primary"),
            EnvironmentId::Secondary => f.write_str("secondary"),
            EnvironmentId::Canary => f.write_str("canary"),
            EnvironmentId::Replica(n) => write!(f, "replica-{n}"),
        }
    }
}

impl FromStr for EnvironmentId {
    type Err = ParseEnvironmentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(EnvironmentId::Primary),
            "secondary" => Ok(EnvironmentId::Secondary),
            "canary" => Ok(EnvironmentId::Canary),
            other => other
                .strip_prefix("replica-")
                .and_then(|n| n.parse::<u8>().ok())
                .map(EnvironmentId::Replica)
                .ok_or_else(|| ParseEnvironmentIdError(s.to_string())),
        }
    }
}

impl TryFrom<String> for EnvironmentId {
    type Error = ParseEnvironmentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EnvironmentId> for String {
    fn from(id: EnvironmentId) -> Self {
        id.to_string()
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_known_ids() {
        assert_eq!("primary".parse::<EnvironmentId>(), Ok(EnvironmentId::Primary));
        assert_eq!("Secondary".parse::<EnvironmentId>(), Ok(EnvironmentId::Secondary));
        assert_eq!("canary".parse::<EnvironmentId>(), Ok(EnvironmentId::Canary));
        assert_eq!("replica-3".parse::<EnvironmentId>(), Ok(EnvironmentId::Replica(3)));
    }

    #[test]
    fn rejects_unknown_ids() {
        assert!("blue".parse::<EnvironmentId>().is_err());
        assert!("replica-".parse::<EnvironmentId>().is_err());
        assert!("replica-999".parse::<EnvironmentId>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        for id in [
            EnvironmentId::Primary,
            EnvironmentId::Secondary,
            EnvironmentId::Canary,
            EnvironmentId::Replica(7),
        ] {
            assert_eq!(id.to_string().parse::<EnvironmentId>(), Ok(id));
        }
    }

    #[test]
    fn usable_as_json_map_key() {
        let mut weights = BTreeMap::new();
        weights.insert(EnvironmentId::Primary, 75u8);
        weights.insert(EnvironmentId::Secondary, 25u8);

        let json = serde_json::to_string(&weights).unwrap();
        assert_eq!(json, r#"{"primary":75,"secondary":25}"#);

        let back: BTreeMap<EnvironmentId, u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, weights);
    }

    #[test]
    fn peers() {
        assert_eq!(EnvironmentId::Primary.peer(), Some(EnvironmentId::Secondary));
        assert_eq!(EnvironmentId::Canary.peer(), None);
    }
}
