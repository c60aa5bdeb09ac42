//! The sampling loop.
//!
//! One cycle = sample both sensors, emit the result. Cycles run strictly one
//! after another; after each the loop sleeps for whatever is left of the
//! interval (nothing, if the cycle overran it). Cycle failures are logged and
//! never leave the loop. Only a cleared `running` flag ends it.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::emitter::{EmitError, EmitReport, Emitter, Transport};
use crate::sample::{SampleSet, Sampler};
use crate::sensor::{IndoorSensor, OutdoorSensor};

/// Granularity at which sleeps check for shutdown.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Result of a successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub sample: SampleSet,
    pub emit: EmitReport,
    pub elapsed: Duration,
}

/// A cycle whose transmission failed. The sample is dropped after logging.
#[derive(Debug, Error)]
#[error("emit failed: {source}")]
pub struct CycleError {
    pub sample: SampleSet,
    #[source]
    pub source: EmitError,
}

/// Time to sleep after a cycle that took `elapsed`.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Sleeps for `duration` in short slices, returning early once `running` is
/// cleared. Returns the final value of `running`.
pub fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let mut remaining = duration;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    running.load(Ordering::SeqCst)
}

/// Runs `init` until it succeeds, at most `retries` extra times, waiting
/// `delay` in between. Returns the last error once attempts are exhausted or
/// shutdown was requested.
pub fn init_with_retry<E: Display>(
    what: &str,
    retries: u32,
    delay: Duration,
    running: &AtomicBool,
    mut init: impl FnMut() -> Result<(), E>,
) -> Result<(), E> {
    let mut attempt = 0;
    loop {
        match init() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries && running.load(Ordering::SeqCst) => {
                attempt += 1;
                warn!(
                    "{} unavailable: {}. Retrying in {:?} ({}/{})",
                    what, e, delay, attempt, retries
                );
                sleep_while_running(delay, running);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drives the sample-and-emit cycle at a fixed interval.
pub struct Scheduler<I: IndoorSensor, O: OutdoorSensor, T: Transport> {
    sampler: Sampler<I, O>,
    emitter: Emitter<T>,
    interval: Duration,
    cycles: u64,
    failed_cycles: u64,
}

impl<I: IndoorSensor, O: OutdoorSensor, T: Transport> Scheduler<I, O, T> {
    pub fn new(sampler: Sampler<I, O>, emitter: Emitter<T>, interval: Duration) -> Self {
        Self {
            sampler,
            emitter,
            interval,
            cycles: 0,
            failed_cycles: 0,
        }
    }

    /// Number of cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Number of cycles whose emit failed.
    pub fn failed_cycles(&self) -> u64 {
        self.failed_cycles
    }

    pub fn emitter(&self) -> &Emitter<T> {
        &self.emitter
    }

    pub fn emitter_mut(&mut self) -> &mut Emitter<T> {
        &mut self.emitter
    }

    /// Runs one sample-and-emit cycle.
    pub fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let started = Instant::now();
        self.cycles += 1;

        let sample = self.sampler.sample();
        match self.emitter.emit(&sample) {
            Ok(emit) => Ok(CycleReport {
                sample,
                emit,
                elapsed: started.elapsed(),
            }),
            Err(source) => {
                self.failed_cycles += 1;
                Err(CycleError { sample, source })
            }
        }
    }

    /// Runs cycles until `running` is cleared.
    ///
    /// The current cycle always completes; a pending sleep is cut short.
    pub fn run(&mut self, running: &AtomicBool) {
        info!(
            "Sampling every {:?} ({} + {})",
            self.interval,
            self.sampler.indoor().describe(),
            self.sampler.outdoor().describe()
        );

        while running.load(Ordering::SeqCst) {
            let started = Instant::now();

            match self.run_cycle() {
                Ok(report) => {
                    for reading in &report.sample.readings {
                        trace!(
                            "{} = {} {}",
                            reading.quantity.default_name(),
                            reading.value,
                            reading.quantity.unit()
                        );
                    }
                    debug!(
                        "Cycle #{}: {} reading(s), {} metric(s) in {} datagram(s), {:?}",
                        self.cycles,
                        report.sample.len(),
                        report.emit.metrics,
                        report.emit.datagrams,
                        report.elapsed
                    );
                }
                Err(e) => warn!(
                    "Cycle #{}: {} ({} reading(s) dropped)",
                    self.cycles,
                    e,
                    e.sample.len()
                ),
            }

            let delay = next_delay(self.interval, started.elapsed());
            if delay.is_zero() {
                debug!("Cycle #{} overran the interval", self.cycles);
            }
            sleep_while_running(delay, running);
        }

        info!(
            "Sampling stopped after {} cycle(s), {} failed",
            self.cycles, self.failed_cycles
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmitterConfig;
    use crate::emitter::UdpTransport;
    use crate::emitter::tests::RecordingTransport;
    use crate::sample::tests::{indoor_ok, outdoor_ok, read_failure, sampler};
    use std::sync::Arc;

    /// Clears the running flag after `limit` sends.
    struct StopAfter {
        running: Arc<AtomicBool>,
        limit: usize,
        sent: usize,
    }

    impl Transport for StopAfter {
        fn send(&mut self, _payload: &[u8], _deadline: Instant) -> Result<(), EmitError> {
            self.sent += 1;
            if self.sent >= self.limit {
                self.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn test_cycle_emits_all_readings() {
        let emitter = Emitter::new(
            &EmitterConfig::new("graphite"),
            RecordingTransport::default(),
        );
        let mut scheduler = Scheduler::new(
            sampler(indoor_ok(), outdoor_ok()),
            emitter,
            Duration::from_secs(5),
        );

        let report = scheduler.run_cycle().unwrap();
        assert_eq!(report.sample.len(), 4);
        assert_eq!(report.emit.metrics, 4);

        let payload = &scheduler.emitter().transport().payloads[0];
        assert!(payload.contains("atmo.temperature_indoor:21.5|g"));
        assert!(payload.contains("atmo.pressure:1013.2|g"));
        assert!(payload.contains("atmo.humidity:45.0|g"));
        assert!(payload.contains("atmo.temperature_outdoor:15.0|g"));
    }

    #[test]
    fn test_cycle_with_both_sensors_failing_is_ok() {
        let emitter = Emitter::new(
            &EmitterConfig::new("graphite"),
            RecordingTransport::default(),
        );
        let mut scheduler = Scheduler::new(
            sampler(Err(read_failure()), Err(read_failure())),
            emitter,
            Duration::from_secs(5),
        );

        let report = scheduler.run_cycle().unwrap();
        assert!(report.sample.is_empty());
        assert_eq!(report.emit.metrics, 0);
        assert!(scheduler.emitter().transport().payloads.is_empty());
    }

    #[test]
    fn test_emit_failure_is_isolated_to_its_cycle() {
        let transport = RecordingTransport {
            fail_timeout: Some(Duration::from_secs(1)),
            ..RecordingTransport::default()
        };
        let emitter = Emitter::new(&EmitterConfig::new("graphite"), transport);
        let mut scheduler = Scheduler::new(
            sampler(indoor_ok(), outdoor_ok()),
            emitter,
            Duration::from_secs(5),
        );

        let err = scheduler.run_cycle().unwrap_err();
        assert_eq!(err.sample.len(), 4);
        assert!(matches!(err.source, EmitError::Timeout { .. }));
        assert_eq!(scheduler.failed_cycles(), 1);

        // Collector reachable again: the next tick goes through, nothing is replayed.
        scheduler.emitter_mut().transport_mut().fail_timeout = None;
        scheduler.run_cycle().unwrap();
        assert_eq!(scheduler.emitter().transport().payloads.len(), 1);
        assert_eq!(scheduler.cycles(), 2);
    }

    #[test]
    fn test_timed_out_emit_keeps_the_next_tick_on_schedule() {
        fn stalled(_host: &str, _port: u16) -> std::io::Result<Vec<std::net::SocketAddr>> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(Vec::new())
        }

        let interval = Duration::from_millis(1000);
        let config = EmitterConfig {
            timeout: Duration::from_millis(100),
            ..EmitterConfig::new("graphite.local")
        };
        let transport = UdpTransport::with_resolver(&config, stalled);
        let mut scheduler = Scheduler::new(
            sampler(indoor_ok(), outdoor_ok()),
            Emitter::new(&config, transport),
            interval,
        );

        let started = Instant::now();
        let err = scheduler.run_cycle().unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err.source, EmitError::Timeout { .. }));
        assert!(elapsed < Duration::from_millis(600));
        assert!(next_delay(interval, elapsed) > Duration::ZERO);

        // The lookup is still in flight; the next tick times out on its own budget.
        let started = Instant::now();
        assert!(scheduler.run_cycle().is_err());
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(scheduler.failed_cycles(), 2);
    }

    #[test]
    fn test_run_until_stopped() {
        let running = Arc::new(AtomicBool::new(true));
        let transport = StopAfter {
            running: running.clone(),
            limit: 3,
            sent: 0,
        };
        let emitter = Emitter::new(&EmitterConfig::new("graphite"), transport);
        let mut scheduler = Scheduler::new(
            sampler(indoor_ok(), outdoor_ok()),
            emitter,
            Duration::from_millis(10),
        );

        scheduler.run(&running);
        assert_eq!(scheduler.cycles(), 3);
        assert_eq!(scheduler.failed_cycles(), 0);
    }

    #[test]
    fn test_run_survives_failing_cycles() {
        let running = Arc::new(AtomicBool::new(true));
        let transport = StopAfter {
            running: running.clone(),
            limit: 2,
            sent: 0,
        };
        let emitter = Emitter::new(&EmitterConfig::new("graphite"), transport);
        // Indoor fails every tick; outdoor still gets through.
        let mut scheduler = Scheduler::new(
            sampler(Err(read_failure()), outdoor_ok()),
            emitter,
            Duration::from_millis(10),
        );

        scheduler.run(&running);
        assert_eq!(scheduler.cycles(), 2);
    }

    #[test]
    fn test_next_delay() {
        let interval = Duration::from_secs(5);
        assert_eq!(
            next_delay(interval, Duration::from_millis(1200)),
            Duration::from_millis(3800)
        );
        assert_eq!(next_delay(interval, Duration::from_secs(7)), Duration::ZERO);
    }

    #[test]
    fn test_sleep_returns_early_on_shutdown() {
        let running = AtomicBool::new(false);
        let started = Instant::now();
        assert!(!sleep_while_running(Duration::from_secs(10), &running));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_init_with_retry_succeeds_eventually() {
        let running = AtomicBool::new(true);
        let mut attempts = 0;
        let result = init_with_retry("sensor", 2, Duration::from_millis(1), &running, || {
            attempts += 1;
            if attempts < 3 { Err("not ready") } else { Ok(()) }
        });

        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_init_with_retry_gives_up() {
        let running = AtomicBool::new(true);
        let mut attempts = 0;
        let result = init_with_retry("sensor", 1, Duration::from_millis(1), &running, || {
            attempts += 1;
            Err::<(), _>("not found")
        });

        assert_eq!(result, Err("not found"));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_init_without_retries_fails_immediately() {
        let running = AtomicBool::new(true);
        let mut attempts = 0;
        let result = init_with_retry("sensor", 0, Duration::from_secs(60), &running, || {
            attempts += 1;
            Err::<(), _>("not found")
        });

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
