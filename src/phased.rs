//! Two-phase Power/Throughput protocol.
//!
//! The Power phase runs one canonical stream (every kind once, in catalog
//! order) and scores its responsiveness from the geometric mean of the
//! per-kind times. The Throughput phase runs `streams` canonical streams
//! concurrently and scores the work completed per unit of wall-clock time.
//! The composite metric is the geometric mean of the two scores and only
//! exists when both phases completed.

use crate::db::DB;
use crate::error::{AttemptError, ConfigError, Phase, PhaseError, PhasedError};
use crate::runner::TransactionRunner;
use crate::workload::TransactionCatalog;

use log::{error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Durations shorter than this are rounded up so the geometric mean stays
/// defined.
pub const MIN_TIMED_INTERVAL: Duration = Duration::from_micros(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PhasedConfig {
    /// Concurrent streams in the Throughput phase.
    pub streams: usize,
    pub scale_factor: f64,
    /// Seconds per reporting unit, 3600 for per-hour metrics.
    pub normalization: f64,
    pub attempt_timeout: Option<Duration>,
    pub seed: Option<u64>,
}

impl PhasedConfig {
    pub fn new(streams: usize, scale_factor: f64) -> Self {
        PhasedConfig {
            streams,
            scale_factor,
            normalization: 3600.0,
            attempt_timeout: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        for (name, value) in [
            ("scale_factor", self.scale_factor),
            ("normalization", self.normalization),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidParam {
                    name: name.to_string(),
                    reason: format!("must be positive, got {}", value),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    PowerRunning,
    PowerDone,
    ThroughputRunning,
    ThroughputDone,
    Composite,
    Reported,
    Failed,
}

/// Per-kind execution times of one canonical stream, in catalog order.
#[derive(Debug, Clone)]
pub struct StreamTimings {
    pub stream: usize,
    pub timings: Vec<(String, Duration)>,
    pub elapsed: Duration,
}

impl StreamTimings {
    /// Geometric mean of the per-kind times, in seconds.
    pub fn geometric_mean(&self) -> f64 {
        let seconds: Vec<f64> = self.timings.iter().map(|(_, d)| d.as_secs_f64()).collect();
        geometric_mean(&seconds)
    }
}

#[derive(Debug, Clone)]
pub struct PowerResult {
    pub stream: StreamTimings,
    pub geometric_mean: f64,
    pub metric: f64,
}

#[derive(Debug, Clone)]
pub struct ThroughputResult {
    pub streams: Vec<StreamTimings>,
    pub elapsed: Duration,
    pub metric: f64,
}

#[derive(Debug, Clone)]
pub struct PhasedReport {
    pub scale_factor: f64,
    pub kinds: usize,
    pub power: PowerResult,
    pub throughput: ThroughputResult,
    pub composite: f64,
}

/// `(∏ d_i)^(1/K)`, computed in log space.
pub fn geometric_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let floor = MIN_TIMED_INTERVAL.as_secs_f64();
    let sum: f64 = values.iter().map(|v| v.max(floor).ln()).sum();
    (sum / values.len() as f64).exp()
}

pub fn power_metric(normalization: f64, scale_factor: f64, geometric_mean: f64) -> f64 {
    normalization * scale_factor / geometric_mean
}

pub fn throughput_metric(streams: usize, kinds: usize, normalization: f64, elapsed: Duration) -> f64 {
    let seconds = elapsed.max(MIN_TIMED_INTERVAL).as_secs_f64();
    (streams * kinds) as f64 * normalization / seconds
}

pub fn composite_metric(power: f64, throughput: f64) -> f64 {
    (power * throughput).sqrt()
}

pub struct PhasedBenchmark<D: DB> {
    runner: TransactionRunner<D>,
    config: PhasedConfig,
    state: PhaseState,
    history: Vec<PhaseState>,
}

impl<D: DB> PhasedBenchmark<D> {
    pub fn new(
        db: Arc<D>,
        catalog: Arc<TransactionCatalog<D::Conn>>,
        config: PhasedConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if catalog.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        Ok(PhasedBenchmark {
            runner: TransactionRunner::new(db, catalog, config.attempt_timeout),
            config,
            state: PhaseState::Idle,
            history: vec![PhaseState::Idle],
        })
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// Every state the run has passed through, starting with `Idle`.
    pub fn history(&self) -> &[PhaseState] {
        &self.history
    }

    fn transition(&mut self, state: PhaseState) {
        info!("phase {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn fail(&mut self, e: PhaseError) -> PhaseError {
        error!("{}", e);
        self.transition(PhaseState::Failed);
        e
    }

    /// Runs both phases. A benchmark runs at most once.
    pub async fn run(&mut self) -> Result<PhasedReport, PhasedError> {
        if self.state != PhaseState::Idle {
            return Err(PhasedError::AlreadyStarted(self.state));
        }
        let mut rng = match self.config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let kinds = self.runner.catalog().len();
        let h = self.config.normalization;

        self.transition(PhaseState::PowerRunning);
        info!("Power test: 1 stream of {} transactions", kinds);
        let stream_rng = SmallRng::seed_from_u64(rng.gen());
        let power_stream = match run_stream(self.runner.clone(), Phase::Power, 0, stream_rng).await {
            Ok(timings) => timings,
            Err(e) => return Err(self.fail(e).into()),
        };
        let g = power_stream.geometric_mean();
        let power = PowerResult {
            metric: power_metric(h, self.config.scale_factor, g),
            geometric_mean: g,
            stream: power_stream,
        };
        info!(
            "Power test finished in {:.2}s, geometric mean {:.4}s",
            power.stream.elapsed.as_secs_f64(),
            g
        );
        self.transition(PhaseState::PowerDone);

        self.transition(PhaseState::ThroughputRunning);
        let streams = self.config.streams;
        info!("Throughput test: {} streams", streams);
        let start = Instant::now();
        let mut threads = vec![];
        for stream in 1..=streams {
            let stream_rng = SmallRng::seed_from_u64(rng.gen());
            threads.push(tokio::spawn(run_stream(
                self.runner.clone(),
                Phase::Throughput,
                stream,
                stream_rng,
            )));
        }
        let mut results = Vec::with_capacity(streams);
        for (i, t) in threads.into_iter().enumerate() {
            let result = t.await.unwrap_or_else(|e| {
                Err(PhaseError {
                    phase: Phase::Throughput,
                    stream: i + 1,
                    kind: "stream".to_string(),
                    source: AttemptError::Panicked(e.to_string()),
                })
            });
            results.push(result);
        }
        let elapsed = start.elapsed();
        let mut completed = Vec::with_capacity(streams);
        for result in results {
            match result {
                Ok(timings) => completed.push(timings),
                Err(e) => return Err(self.fail(e).into()),
            }
        }
        let throughput = ThroughputResult {
            metric: throughput_metric(streams, kinds, h, elapsed),
            streams: completed,
            elapsed,
        };
        info!(
            "Throughput test finished in {:.2}s",
            throughput.elapsed.as_secs_f64()
        );
        self.transition(PhaseState::ThroughputDone);

        self.transition(PhaseState::Composite);
        let report = PhasedReport {
            scale_factor: self.config.scale_factor,
            kinds,
            composite: composite_metric(power.metric, throughput.metric),
            power,
            throughput,
        };
        self.transition(PhaseState::Reported);
        Ok(report)
    }
}

/// Runs every kind once, in catalog order, on one dedicated connection.
async fn run_stream<D: DB>(
    runner: TransactionRunner<D>,
    phase: Phase,
    stream: usize,
    mut rng: SmallRng,
) -> Result<StreamTimings, PhaseError> {
    let catalog = runner.catalog();
    let failed = |kind: &str, source: AttemptError| PhaseError {
        phase,
        stream,
        kind: kind.to_string(),
        source,
    };

    info!("Stream {}: starting", stream);
    let start = Instant::now();
    let mut conn = runner.connect().await.map_err(|e| failed("connect", e))?;
    let mut timings = Vec::with_capacity(catalog.len());
    for (index, kind) in catalog.kinds().iter().enumerate() {
        let (_, elapsed) = runner
            .run_kind(index, &mut conn, &mut rng)
            .await
            .map_err(|e| failed(kind.name(), e))?;
        let elapsed = elapsed.max(MIN_TIMED_INTERVAL);
        info!(
            "Stream {}: {} finished in {:.3}s",
            stream,
            kind.name(),
            elapsed.as_secs_f64()
        );
        timings.push((kind.name().to_string(), elapsed));
    }
    drop(conn);
    Ok(StreamTimings {
        stream,
        timings,
        elapsed: start.elapsed(),
    })
}

impl fmt::Display for PhasedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[POWER], Streams, 1")?;
        writeln!(f, "[POWER], RunTime(ms), {}", self.power.stream.elapsed.as_millis())?;
        writeln!(f, "[POWER], GeometricMean(s), {:.6}", self.power.geometric_mean)?;
        writeln!(f, "[POWER], Metric@{}, {:.2}", self.scale_factor, self.power.metric)?;
        for (name, elapsed) in &self.power.stream.timings {
            writeln!(f, "[POWER], {}(ms), {:.3}", name, elapsed.as_secs_f64() * 1000.0)?;
        }
        writeln!(f, "[THROUGHPUT], Streams, {}", self.throughput.streams.len())?;
        writeln!(f, "[THROUGHPUT], RunTime(ms), {}", self.throughput.elapsed.as_millis())?;
        for stream in &self.throughput.streams {
            writeln!(
                f,
                "[THROUGHPUT], Stream{}(ms), {}",
                stream.stream,
                stream.elapsed.as_millis()
            )?;
        }
        writeln!(
            f,
            "[THROUGHPUT], Metric@{}, {:.2}",
            self.scale_factor, self.throughput.metric
        )?;
        writeln!(f, "[COMPOSITE], Metric@{}, {:.2}", self.scale_factor, self.composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::SimulatedProperties;
    use crate::simulated::{Simulated, SimulatedConn, SimulatedTransaction};
    use crate::workload::Transaction;

    fn simulated(millis: u64) -> Arc<dyn Transaction<SimulatedConn>> {
        Arc::new(SimulatedTransaction::new(Duration::from_millis(millis)))
    }

    fn benchmark(
        db: Simulated,
        catalog: TransactionCatalog<SimulatedConn>,
        streams: usize,
    ) -> PhasedBenchmark<Simulated> {
        let config = PhasedConfig {
            seed: Some(9),
            ..PhasedConfig::new(streams, 1.0)
        };
        PhasedBenchmark::new(Arc::new(db), Arc::new(catalog), config).unwrap()
    }

    fn phase_error(result: Result<PhasedReport, PhasedError>) -> PhaseError {
        match result {
            Err(PhasedError::Phase(e)) => e,
            other => panic!("expected a phase failure, got {:?}", other.map(|r| r.composite)),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.0)
    }

    #[test]
    fn test_geometric_mean_of_equal_durations() {
        for d in [0.1, 2.5, 37.0] {
            let timings = StreamTimings {
                stream: 0,
                timings: (1..=22).map(|q| (format!("Q{}", q), Duration::from_secs_f64(d))).collect(),
                elapsed: Duration::ZERO,
            };
            let g = timings.geometric_mean();
            assert!(close(g, d), "geometric mean {} != {}", g, d);
            assert!(close(power_metric(3600.0, 10.0, g), 36000.0 / d));
        }
    }

    #[test]
    fn test_geometric_mean_of_mixed_durations() {
        assert!(close(geometric_mean(&[1.0, 4.0]), 2.0));
        assert!(close(geometric_mean(&[2.0, 8.0, 4.0]), 4.0));
        assert_eq!(geometric_mean(&[]), 0.0);
        assert!(geometric_mean(&[0.0, 1.0]) > 0.0);
    }

    #[test]
    fn test_composite_metric() {
        assert_eq!(composite_metric(100.0, 400.0), 200.0);
        assert_eq!(
            throughput_metric(4, 22, 3600.0, Duration::from_secs(3600)),
            88.0
        );
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(PhasedConfig::new(0, 1.0).validate(), Err(ConfigError::ZeroConcurrency));
        assert!(PhasedConfig::new(2, 0.0).validate().is_err());
        assert!(PhasedConfig {
            normalization: -1.0,
            ..PhasedConfig::new(2, 1.0)
        }
        .validate()
        .is_err());
        assert!(PhasedConfig::new(2, 1.0).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_protocol() {
        let catalog = TransactionCatalog::builder()
            .kind("Q1", 1.0, simulated(200))
            .kind("Q2", 1.0, simulated(200))
            .kind("Q3", 1.0, simulated(200))
            .build()
            .unwrap();
        let mut benchmark = benchmark(Simulated::default(), catalog, 4);
        let report = benchmark.run().await.unwrap();

        assert!((report.power.geometric_mean - 0.2).abs() < 0.005);
        assert!((report.power.metric - 3600.0 / 0.2).abs() < 100.0);
        let names: Vec<_> = report.power.stream.timings.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Q1", "Q2", "Q3"]);

        // Four streams of 3 * 200ms run side by side.
        assert_eq!(report.throughput.streams.len(), 4);
        assert!(report.throughput.elapsed >= Duration::from_millis(600));
        assert!(report.throughput.elapsed < Duration::from_millis(700));
        let expected = 4.0 * 3.0 * 3600.0 / report.throughput.elapsed.as_secs_f64();
        assert!(close(report.throughput.metric, expected));
        assert!(close(
            report.composite,
            (report.power.metric * report.throughput.metric).sqrt()
        ));

        assert_eq!(benchmark.state(), PhaseState::Reported);
        assert_eq!(
            benchmark.history(),
            &[
                PhaseState::Idle,
                PhaseState::PowerRunning,
                PhaseState::PowerDone,
                PhaseState::ThroughputRunning,
                PhaseState::ThroughputDone,
                PhaseState::Composite,
                PhaseState::Reported,
            ]
        );
        assert!(report.to_string().contains("[COMPOSITE], Metric@1,"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_failure_aborts_the_run() {
        let failing: Arc<dyn Transaction<SimulatedConn>> = Arc::new(
            SimulatedTransaction::new(Duration::from_millis(10)).with_abort_probability(1.0),
        );
        let catalog = TransactionCatalog::builder()
            .kind("Q1", 1.0, simulated(10))
            .kind("Q2", 1.0, failing)
            .kind("Q3", 1.0, simulated(10))
            .build()
            .unwrap();
        let db = Arc::new(Simulated::default());
        let mut benchmark = PhasedBenchmark::new(
            db.clone(),
            Arc::new(catalog),
            PhasedConfig::new(2, 1.0),
        )
        .unwrap();
        let err = phase_error(benchmark.run().await);

        assert_eq!(err.phase, Phase::Power);
        assert_eq!(err.stream, 0);
        assert_eq!(err.kind, "Q2");
        assert!(matches!(err.source, AttemptError::Collaborator(_)));
        assert_eq!(benchmark.state(), PhaseState::Failed);
        assert!(!benchmark.history().contains(&PhaseState::ThroughputRunning));
        // The throughput phase never acquired a connection.
        assert_eq!(db.connections(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_database_fails_the_power_phase() {
        let db = Simulated::new(&SimulatedProperties {
            connect_failure_probability: 1.0,
        })
        .unwrap();
        let catalog = TransactionCatalog::builder()
            .kind("Q1", 1.0, simulated(0))
            .build()
            .unwrap();
        let err = phase_error(benchmark(db, catalog, 2).run().await);
        assert_eq!(err.phase, Phase::Power);
        assert_eq!(err.kind, "connect");
        assert!(matches!(err.source, AttemptError::ResourceAcquisition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_use_separate_connections() {
        let db = Arc::new(Simulated::default());
        let catalog = TransactionCatalog::builder()
            .kind("Q1", 1.0, simulated(5))
            .kind("Q2", 1.0, simulated(5))
            .build()
            .unwrap();
        let mut benchmark =
            PhasedBenchmark::new(db.clone(), Arc::new(catalog), PhasedConfig::new(3, 1.0)).unwrap();
        benchmark.run().await.unwrap();
        // One for the power stream, one per throughput stream.
        assert_eq!(db.connections(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected() {
        let catalog = TransactionCatalog::builder()
            .kind("Q1", 1.0, simulated(5))
            .build()
            .unwrap();
        let mut benchmark = benchmark(Simulated::default(), catalog, 2);
        benchmark.run().await.unwrap();
        let history = benchmark.history().to_vec();

        let result = benchmark.run().await;
        assert!(matches!(
            result,
            Err(PhasedError::AlreadyStarted(PhaseState::Reported))
        ));
        assert_eq!(benchmark.state(), PhaseState::Reported);
        assert_eq!(benchmark.history(), history.as_slice());
    }
}
