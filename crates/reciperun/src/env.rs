use std::env;
use std::sync::OnceLock;

use crate::runtime::Measurement;

/// Launch attempts the timing sampler makes before giving up.
pub(crate) const DEFAULT_MAX_TIMING_ATTEMPTS: usize = 100;

static RECIPERUN_KEEP_GOING: OnceLock<bool> = OnceLock::new();
static RECIPERUN_TIME_MEASUREMENT: OnceLock<Measurement> = OnceLock::new();
static RECIPERUN_MAX_TIMING_ATTEMPTS: OnceLock<usize> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_attempts(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|attempts| *attempts > 0)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn keep_going() -> bool {
    *RECIPERUN_KEEP_GOING.get_or_init(|| {
        non_empty_var("RECIPERUN_KEEP_GOING").is_some_and(|value| parse_bool(&value))
    })
}

pub(crate) fn time_measurement() -> Measurement {
    *RECIPERUN_TIME_MEASUREMENT.get_or_init(|| {
        let Some(value) = non_empty_var("RECIPERUN_TIME_MEASUREMENT") else {
            return Measurement::None;
        };
        match value.trim().parse::<Measurement>() {
            Ok(measurement) => measurement,
            Err(err) => {
                tracing::warn!(%err, "ignoring RECIPERUN_TIME_MEASUREMENT");
                Measurement::None
            }
        }
    })
}

pub(crate) fn max_timing_attempts() -> usize {
    *RECIPERUN_MAX_TIMING_ATTEMPTS.get_or_init(|| {
        non_empty_var("RECIPERUN_MAX_TIMING_ATTEMPTS")
            .and_then(|value| parse_attempts(&value))
            .unwrap_or(DEFAULT_MAX_TIMING_ATTEMPTS)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values_are_case_insensitive() {
        assert!(parse_bool("YES"));
        assert!(parse_bool(" on "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }

    #[test]
    fn zero_attempts_fall_back_to_default() {
        assert_eq!(parse_attempts("7"), Some(7));
        assert_eq!(parse_attempts("0"), None);
        assert_eq!(parse_attempts("many"), None);
    }
}
