use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::LaunchError;

/// How launch latency is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Measurement {
    /// Launch without timing.
    #[default]
    None,
    /// Bracket every launch with a pair of timestamped events.
    Events,
    /// Run the device profiler around every launch.
    Profiler,
}

impl Measurement {
    pub fn as_str(self) -> &'static str {
        match self {
            Measurement::None => "none",
            Measurement::Events => "events",
            Measurement::Profiler => "profiler",
        }
    }

    pub fn is_timed(self) -> bool {
        !matches!(self, Measurement::None)
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Measurement {
    type Err = LaunchError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "none" => Ok(Measurement::None),
            "events" => Ok(Measurement::Events),
            "profiler" => Ok(Measurement::Profiler),
            other => Err(LaunchError::contract(format!(
                "unsupported time measurement value: {other}"
            ))),
        }
    }
}

/// Per-run launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Launches per batch; also the number of valid samples a timed run must produce.
    pub iterations: u32,
    pub measurement: Measurement,
    /// Record a timing shortfall as a warning instead of failing.
    pub keep_going: bool,
    pub max_attempts: usize,
}

impl Default for LaunchOptions {
    /// Defaults honor `RECIPERUN_TIME_MEASUREMENT`, `RECIPERUN_KEEP_GOING` and
    /// `RECIPERUN_MAX_TIMING_ATTEMPTS`.
    fn default() -> Self {
        Self {
            iterations: 1,
            measurement: env::time_measurement(),
            keep_going: env::keep_going(),
            max_attempts: env::max_timing_attempts(),
        }
    }
}

impl LaunchOptions {
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurement = measurement;
        self
    }

    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for measurement in [Measurement::None, Measurement::Events, Measurement::Profiler] {
            assert_eq!(measurement.as_str().parse::<Measurement>().unwrap(), measurement);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "cycles".parse::<Measurement>().unwrap_err();
        assert!(err.to_string().contains("cycles"));
        assert!("Events".parse::<Measurement>().is_err());
    }
}
