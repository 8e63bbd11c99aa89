//! Latency sampling: elapsed-time polling, outlier filtering and escalating retries.

use crate::device::{ElapsedTimeError, TraceEvent};
use crate::error::{LaunchError, LaunchResult};
use crate::runtime::measurement::{LaunchOptions, Measurement};
use crate::runtime::outcome::LaunchOutcome;

/// Samples further than this fraction from the batch median are outliers.
pub const VARIANCE_THRESHOLD: f64 = 0.3;

/// Iteration growth is capped at this multiple of the requested count.
pub const MAX_ITERATION_GROWTH: u32 = 10;

/// Trace events whose name starts with this prefix mark device activity.
pub const BUSY_EVENT_PREFIX: &str = "Busy";

/// Filters one batch of durations.
///
/// A sample above `max_valid_ns` invalidates the whole batch. Exact zeros are dropped, as are
/// samples outside `[0.7, 1.3] * median`. Input order is preserved.
pub fn filter_elapsed_times(durations: Vec<f64>, max_valid_ns: u64) -> Vec<f64> {
    if durations.is_empty() {
        return durations;
    }
    let mut sorted = durations.clone();
    let median_index = sorted.len() / 2;
    let (_, median, _) = sorted.select_nth_unstable_by(median_index, f64::total_cmp);
    let median = *median;
    let low = (1.0 - VARIANCE_THRESHOLD) * median;
    let high = (1.0 + VARIANCE_THRESHOLD) * median;

    let mut kept = Vec::with_capacity(durations.len());
    for duration in durations {
        if duration > max_valid_ns as f64 {
            return Vec::new();
        }
        if duration == 0.0 || duration < low || duration > high {
            continue;
        }
        kept.push(duration);
    }
    kept
}

/// Collects elapsed-time samples.
///
/// An unavailable sample is skipped; any other failure discards the batch.
pub fn poll_elapsed_times<I>(samples: I) -> Vec<f64>
where
    I: IntoIterator<Item = Result<u64, ElapsedTimeError>>,
{
    let mut times = Vec::new();
    for sample in samples {
        match sample {
            Ok(ns) => times.push(ns as f64),
            Err(ElapsedTimeError::Unavailable) => continue,
            Err(err) => {
                tracing::debug!(%err, "discarding timing batch");
                return Vec::new();
            }
        }
    }
    times
}

/// Span between the first and last busy events, converted from microseconds to nanoseconds.
pub fn busy_span_ns(events: &[TraceEvent]) -> f64 {
    let mut range: Option<(f64, f64)> = None;
    for event in events
        .iter()
        .filter(|event| event.name.starts_with(BUSY_EVENT_PREFIX))
    {
        let ts = event.timestamp_us;
        range = Some(match range {
            None => (ts, ts),
            Some((first, last)) => (first.min(ts), last.max(ts)),
        });
    }
    range.map_or(0.0, |(first, last)| 1e3 * (last - first))
}

/// Samples produced by one batch of launches.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSamples {
    /// Supersedes earlier batches.
    Replace(Vec<f64>),
    /// Adds to earlier batches.
    Extend(Vec<f64>),
}

/// Launches a batch of iterations under a measurement strategy.
pub trait BatchLauncher {
    fn launch_batch(
        &mut self,
        measurement: Measurement,
        iterations: u32,
    ) -> LaunchResult<BatchSamples>;
}

/// Drives batches until enough valid samples exist or the attempt budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSampler {
    iterations: u32,
    measurement: Measurement,
    keep_going: bool,
    max_attempts: usize,
}

impl TimingSampler {
    pub fn new(options: &LaunchOptions) -> Self {
        Self {
            iterations: options.iterations,
            measurement: options.measurement,
            keep_going: options.keep_going,
            max_attempts: options.max_attempts.max(1),
        }
    }

    /// Valid samples a run must produce; zero when untimed.
    pub fn min_required(&self) -> usize {
        if self.measurement.is_timed() {
            self.iterations as usize
        } else {
            0
        }
    }

    pub fn run<L>(&self, launcher: &mut L, outcome: &mut LaunchOutcome) -> LaunchResult<()>
    where
        L: BatchLauncher + ?Sized,
    {
        let requested = self.iterations;
        let min_required = self.min_required();
        let mut iterations = requested;
        let mut attempt = 0usize;
        let mut durations = Vec::new();
        loop {
            if attempt > 0 && self.measurement == Measurement::Events {
                iterations = iterations
                    .saturating_mul(2)
                    .min(requested.saturating_mul(MAX_ITERATION_GROWTH));
            }
            match launcher.launch_batch(self.measurement, iterations)? {
                BatchSamples::Replace(samples) => durations = samples,
                BatchSamples::Extend(samples) => durations.extend(samples),
            }
            attempt += 1;
            if attempt >= self.max_attempts || durations.len() >= min_required {
                break;
            }
            tracing::debug!(
                attempt,
                iterations,
                valid = durations.len(),
                min_required,
                "too few valid samples, relaunching"
            );
        }

        let shortfall = durations.len() < min_required;
        outcome.durations_ns = durations;
        outcome.iterations = iterations;
        outcome.attempts = attempt;
        if shortfall {
            let detail = format!(
                "{} valid samples after {attempt} attempts, {min_required} required",
                outcome.durations_ns.len()
            );
            if !self.keep_going {
                return Err(LaunchError::TimingShortfall(detail));
            }
            outcome.warn(format!("failed to capture device run time: {detail}"));
        }
        if iterations != requested {
            outcome.warn(format!(
                "failed to capture run time of few iterations, requested iterations count: {}, actual iterations count: {}, valid iteration count: {}, launch attempts: {}",
                requested,
                iterations,
                outcome.durations_ns.len(),
                attempt
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedLauncher {
        batches: Vec<BatchSamples>,
        requested: Vec<u32>,
    }

    impl BatchLauncher for ScriptedLauncher {
        fn launch_batch(
            &mut self,
            _measurement: Measurement,
            iterations: u32,
        ) -> LaunchResult<BatchSamples> {
            self.requested.push(iterations);
            if self.batches.is_empty() {
                return Ok(BatchSamples::Replace(Vec::new()));
            }
            Ok(self.batches.remove(0))
        }
    }

    fn options(measurement: Measurement) -> LaunchOptions {
        LaunchOptions {
            iterations: 4,
            measurement,
            keep_going: false,
            max_attempts: 100,
        }
    }

    #[test]
    fn filter_drops_zeros_and_outliers() {
        let kept = filter_elapsed_times(vec![100.0, 0.0, 105.0, 400.0, 95.0], 1_000);
        assert_eq!(kept, vec![100.0, 105.0, 95.0]);
    }

    #[test]
    fn filter_rejects_batch_above_wall_clock() {
        assert!(filter_elapsed_times(vec![100.0, 2_000.0, 100.0], 1_000).is_empty());
    }

    #[test]
    fn poll_skips_unavailable_and_aborts_on_failure() {
        let polled = poll_elapsed_times(vec![Ok(10), Err(ElapsedTimeError::Unavailable), Ok(12)]);
        assert_eq!(polled, vec![10.0, 12.0]);
        let failed = poll_elapsed_times(vec![
            Ok(10),
            Err(ElapsedTimeError::Failed("bad".into())),
            Ok(12),
        ]);
        assert!(failed.is_empty());
    }

    #[test]
    fn busy_span_ignores_other_events() {
        let events = vec![
            TraceEvent { name: "Launch".into(), timestamp_us: 0.5 },
            TraceEvent { name: "Busy:engine0".into(), timestamp_us: 2.0 },
            TraceEvent { name: "Busy:engine1".into(), timestamp_us: 1.0 },
            TraceEvent { name: "Busy:engine0".into(), timestamp_us: 3.5 },
        ];
        assert_eq!(busy_span_ns(&events), 2_500.0);
        assert_eq!(busy_span_ns(&events[..1]), 0.0);
    }

    #[test]
    fn events_double_iterations_until_enough_samples() {
        let mut launcher = ScriptedLauncher {
            batches: vec![
                BatchSamples::Replace(vec![1.0; 3]),
                BatchSamples::Replace(vec![1.0; 2]),
                BatchSamples::Replace(vec![1.0; 16]),
            ],
            requested: Vec::new(),
        };
        let mut outcome = LaunchOutcome::default();
        TimingSampler::new(&options(Measurement::Events))
            .run(&mut launcher, &mut outcome)
            .unwrap();
        assert_eq!(launcher.requested, vec![4, 8, 16]);
        assert_eq!(outcome.durations_ns.len(), 16);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("requested iterations count: 4"));
    }

    #[test]
    fn growth_is_capped_at_ten_times() {
        let mut launcher = ScriptedLauncher {
            batches: Vec::new(),
            requested: Vec::new(),
        };
        let mut outcome = LaunchOutcome::default();
        let err = TimingSampler::new(&options(Measurement::Events).with_max_attempts(6))
            .run(&mut launcher, &mut outcome)
            .unwrap_err();
        assert!(matches!(err, LaunchError::TimingShortfall(_)));
        assert_eq!(launcher.requested, vec![4, 8, 16, 32, 40, 40]);
    }

    #[test]
    fn keep_going_turns_shortfall_into_warning() {
        let mut launcher = ScriptedLauncher {
            batches: Vec::new(),
            requested: Vec::new(),
        };
        let mut outcome = LaunchOutcome::default();
        TimingSampler::new(
            &options(Measurement::Events)
                .with_max_attempts(2)
                .with_keep_going(true),
        )
        .run(&mut launcher, &mut outcome)
        .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings[0].starts_with("failed to capture device run time"));
    }

    #[test]
    fn profiler_accumulates_without_growth() {
        let mut launcher = ScriptedLauncher {
            batches: vec![
                BatchSamples::Extend(vec![5.0; 3]),
                BatchSamples::Extend(vec![5.0; 3]),
            ],
            requested: Vec::new(),
        };
        let mut outcome = LaunchOutcome::default();
        TimingSampler::new(&options(Measurement::Profiler))
            .run(&mut launcher, &mut outcome)
            .unwrap();
        assert_eq!(launcher.requested, vec![4, 4]);
        assert_eq!(outcome.durations_ns.len(), 6);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn untimed_runs_launch_once() {
        let mut launcher = ScriptedLauncher {
            batches: vec![BatchSamples::Extend(Vec::new())],
            requested: Vec::new(),
        };
        let mut outcome = LaunchOutcome::default();
        TimingSampler::new(&options(Measurement::None))
            .run(&mut launcher, &mut outcome)
            .unwrap();
        assert_eq!(launcher.requested, vec![4]);
        assert_eq!(outcome.attempts, 1);
    }
}
