//! Batching rules, loaded from the environment or deserialized.

use std::env;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const WINDOW_VAR: &str = "COALESCE_WINDOW";
pub const MAX_KEYS_VAR: &str = "COALESCE_MAX_KEYS";

/// When an open window closes and its batch is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Window {
    /// Close once every handle that joined the window has been polled and the
    /// driving handle comes around again: all resolvers that were willing to
    /// submit work this tick have done so.
    #[default]
    Tick,

    /// Close a fixed time after the window was opened. Use this when
    /// resolvers run as separate tasks on several threads.
    Delay(Duration),
}

impl FromStr for Window {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("tick") {
            return Ok(Window::Tick);
        }

        let (digits, scale): (&str, fn(u64) -> Duration) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, Duration::from_millis)
        } else if let Some(us) = s.strip_suffix("us") {
            (us, Duration::from_micros)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, Duration::from_secs)
        } else {
            return Err("expected `tick` or a duration such as `5ms`".to_owned());
        };

        digits
            .trim()
            .parse::<u64>()
            .map(|n| Window::Delay(scale(n)))
            .map_err(|err| err.to_string())
    }
}

impl TryFrom<String> for Window {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Window::Tick => f.write_str("tick"),
            Window::Delay(delay) => write!(f, "{}us", delay.as_micros()),
        }
    }
}

impl From<Window> for String {
    fn from(window: Window) -> Self {
        window.to_string()
    }
}

/// BatchRules defines the batching behavior shared by every loader created
/// from a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRules {
    pub window: Window,

    /// If set, a window is dispatched as soon as it holds this many distinct
    /// keys, regardless of `window`.
    pub max_keys: Option<NonZeroUsize>,
}

impl BatchRules {
    /// Load batching rules from `COALESCE_WINDOW` and `COALESCE_MAX_KEYS`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let mut rules = BatchRules::default();

        if let Some(value) = lookup(WINDOW_VAR) {
            rules.window = value
                .parse()
                .map_err(|reason| ConfigurationError::InvalidSetting {
                    name: WINDOW_VAR,
                    value: value.clone(),
                    reason,
                })?;
        }

        if let Some(value) = lookup(MAX_KEYS_VAR) {
            let max_keys = value
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|err| ConfigurationError::InvalidSetting {
                    name: MAX_KEYS_VAR,
                    value: value.clone(),
                    reason: err.to_string(),
                })?;
            rules.max_keys = Some(max_keys);
        }

        Ok(rules)
    }
}
