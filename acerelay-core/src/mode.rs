//! Which engine the relay talks to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Selects the engine backend at startup.
///
/// Development mode swaps the engine HTTP API for the in-process simulated
/// engine, so the whole relay runs offline behind the same interfaces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Engine HTTP API at the configured base URL
    #[default]
    #[value(alias = "prod")]
    Production,
    /// Simulated engine emitting synthetic MPEG-TS
    #[value(alias = "dev")]
    Development,
}

impl RuntimeMode {
    pub fn is_development(self) -> bool {
        self == Self::Development
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    /// Short description of the engine backing this mode, for startup logs.
    pub fn engine_label(self) -> &'static str {
        match self {
            Self::Production => "engine HTTP API",
            Self::Development => "simulated engine",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
        })
    }
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(s, true)
            .map_err(|_| format!("invalid runtime mode '{s}', expected production or development"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing_accepts_aliases() {
        assert_eq!("prod".parse::<RuntimeMode>(), Ok(RuntimeMode::Production));
        assert_eq!(
            "Development".parse::<RuntimeMode>(),
            Ok(RuntimeMode::Development)
        );
        assert_eq!("dev".parse::<RuntimeMode>(), Ok(RuntimeMode::Development));
        assert!("staging".parse::<RuntimeMode>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for mode in [RuntimeMode::Production, RuntimeMode::Development] {
            assert_eq!(mode.to_string().parse::<RuntimeMode>(), Ok(mode));
        }
        assert!(RuntimeMode::default().is_production());
    }
}
