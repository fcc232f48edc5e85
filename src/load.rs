use crate::db::DB;
use crate::error::ConfigError;
use crate::generator::{Generator, WeightedPool, DEFAULT_RESOLUTION};
use crate::metrics::{MetricsAggregator, RunReport};
use crate::runner::{Attempt, TransactionRunner};
use crate::workload::TransactionCatalog;

use log::{error, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{channel, Sender};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    pub concurrency: usize,
    pub duration: Duration,
    pub weight_resolution: u32,
    /// Off by default: without it a hung transaction holds its slot forever.
    pub attempt_timeout: Option<Duration>,
    /// How long to wait for any completion before reporting an engine stall.
    pub stall_interval: Duration,
    pub seed: Option<u64>,
}

impl LoadConfig {
    pub fn new(concurrency: usize, duration: Duration) -> Self {
        LoadConfig {
            concurrency,
            duration,
            weight_resolution: DEFAULT_RESOLUTION,
            attempt_timeout: None,
            stall_interval: Duration::from_secs(1),
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.duration.is_zero() {
            return Err(ConfigError::NonPositiveDuration);
        }
        Ok(())
    }
}

/// Closed-loop load generator. Keeps exactly `concurrency` attempts in
/// flight: each slot submits its next attempt as soon as the previous one
/// completes, until the deadline passes. In-flight attempts are never
/// interrupted, so the run ends with a short drain.
pub struct LoadGenerator<D: DB> {
    runner: TransactionRunner<D>,
    pool: Arc<WeightedPool>,
    config: LoadConfig,
}

impl<D: DB> LoadGenerator<D> {
    pub fn new(
        db: Arc<D>,
        catalog: Arc<TransactionCatalog<D::Conn>>,
        config: LoadConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = WeightedPool::build(&catalog, config.weight_resolution)?;
        let runner = TransactionRunner::new(db, catalog, config.attempt_timeout);
        Ok(LoadGenerator {
            runner,
            pool: Arc::new(pool),
            config,
        })
    }

    pub async fn run(&self) -> RunReport {
        let concurrency = self.config.concurrency;
        let mut aggregator = MetricsAggregator::new(self.runner.catalog(), self.config.duration);
        let mut rng = match self.config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        info!(
            "Starting benchmark with {} workers for {:?}",
            concurrency, self.config.duration
        );
        let start = Instant::now();
        let deadline = start + self.config.duration;

        let (tx, mut rx) = channel(concurrency);
        let mut threads = vec![];
        for slot in 0..concurrency {
            let slot_rng = SmallRng::seed_from_u64(rng.gen());
            threads.push(tokio::spawn(run_slot(
                self.runner.clone(),
                self.pool.clone(),
                slot,
                deadline,
                slot_rng,
                tx.clone(),
            )));
        }
        drop(tx);

        loop {
            match tokio::time::timeout(self.config.stall_interval, rx.recv()).await {
                Ok(Some(attempt)) => aggregator.record(&attempt),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "engine stall: no attempt completed within {:?} ({:.1}s into the run)",
                        self.config.stall_interval,
                        start.elapsed().as_secs_f64()
                    );
                    aggregator.record_stall();
                }
            }
        }
        for t in threads {
            if let Err(e) = t.await {
                error!("worker task failed: {}", e);
            }
        }

        let elapsed = start.elapsed();
        let report = aggregator.finalize(concurrency, elapsed);
        info!(
            "Benchmark finished: {} attempts, {:.2} ops/sec, {:.2}% aborts, {:.2}s with drain",
            report.total,
            report.throughput,
            report.abort_rate,
            elapsed.as_secs_f64()
        );
        report
    }
}

/// One concurrency slot. It always submits at least one attempt, then
/// refills itself until the deadline.
async fn run_slot<D: DB>(
    runner: TransactionRunner<D>,
    pool: Arc<WeightedPool>,
    slot: usize,
    deadline: Instant,
    mut rng: SmallRng,
    results: Sender<Attempt>,
) {
    loop {
        let kind = pool.next_value(&mut rng);
        let attempt_rng = SmallRng::seed_from_u64(rng.gen());
        let attempt = runner.attempt(slot, kind, attempt_rng).await;
        if results.send(attempt).await.is_err() {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
    }
}
