use crate::runner::Attempt;
use crate::workload::{Outcome, TransactionCatalog};

use hdrhistogram::Histogram;
use std::fmt;
use std::time::Duration;

/// Per-kind running totals.
#[derive(Debug, Clone)]
pub struct KindStats {
    pub name: String,
    pub count: u64,
    pub aborts: u64,
    pub rollbacks: u64,
    pub total_latency: Duration,
    pub last_error: Option<String>,
    latencies: Histogram<u64>,
}

impl KindStats {
    fn new(name: &str) -> Self {
        KindStats {
            name: name.to_string(),
            count: 0,
            aborts: 0,
            rollbacks: 0,
            total_latency: Duration::ZERO,
            last_error: None,
            // Auto-resizing histogram; only an invalid precision fails here.
            latencies: Histogram::<u64>::new(3).expect("histogram creation"),
        }
    }

    fn percentile(&self, quantile: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latencies.value_at_quantile(quantile))
    }
}

/// Global counters plus one bucket per catalog kind.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    pub total: u64,
    pub successes: u64,
    pub rollbacks: u64,
    pub aborts: u64,
    pub kinds: Vec<KindStats>,
}

impl RunningStats {
    /// Committed plus intentionally rolled back.
    pub fn successful(&self) -> u64 {
        self.successes + self.rollbacks
    }
}

/// Folds completed attempts into running totals. Owned by a single task, so
/// updates are serialized without locking.
pub struct MetricsAggregator {
    stats: RunningStats,
    duration: Duration,
    stalls: u64,
}

impl MetricsAggregator {
    /// `duration` is the nominal test duration that throughput is computed
    /// over.
    pub fn new<C>(catalog: &TransactionCatalog<C>, duration: Duration) -> Self {
        let kinds = catalog.kinds().iter().map(|k| KindStats::new(k.name())).collect();
        MetricsAggregator {
            stats: RunningStats {
                kinds,
                ..RunningStats::default()
            },
            duration,
            stalls: 0,
        }
    }

    pub fn record(&mut self, attempt: &Attempt) {
        let stats = &mut self.stats;
        stats.total += 1;
        match attempt.outcome {
            Outcome::Success => stats.successes += 1,
            Outcome::RollbackOk => stats.rollbacks += 1,
            Outcome::Abort => stats.aborts += 1,
        }

        let Some(kind) = stats.kinds.get_mut(attempt.kind) else {
            return;
        };
        kind.count += 1;
        kind.total_latency += attempt.latency;
        let micros = u64::try_from(attempt.latency.as_micros()).unwrap_or(u64::MAX);
        kind.latencies.saturating_record(micros);
        match attempt.outcome {
            Outcome::Abort => {
                kind.aborts += 1;
                kind.last_error = attempt.error.as_ref().map(|e| e.to_string());
            }
            Outcome::RollbackOk => kind.rollbacks += 1,
            Outcome::Success => {}
        }
    }

    pub fn record_stall(&mut self) {
        self.stalls += 1;
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// `elapsed` is the actual wall-clock span, drain tail included.
    pub fn finalize(self, concurrency: usize, elapsed: Duration) -> RunReport {
        let stats = self.stats;
        let seconds = self.duration.as_secs_f64();
        let throughput = if seconds > 0.0 {
            stats.successful() as f64 / seconds
        } else {
            0.0
        };
        let mut kinds: Vec<KindReport> = stats
            .kinds
            .iter()
            .map(|k| KindReport {
                name: k.name.clone(),
                count: k.count,
                aborts: k.aborts,
                rollbacks: k.rollbacks,
                abort_rate: abort_rate(k.aborts, k.count),
                avg_latency: if k.count > 0 {
                    k.total_latency / k.count as u32
                } else {
                    Duration::ZERO
                },
                p50_latency: k.percentile(0.50),
                p95_latency: k.percentile(0.95),
                p99_latency: k.percentile(0.99),
                max_latency: Duration::from_micros(k.latencies.max()),
                last_error: k.last_error.clone(),
            })
            .collect();
        kinds.sort_by(|a, b| a.name.cmp(&b.name));

        RunReport {
            concurrency,
            duration: self.duration,
            elapsed,
            total: stats.total,
            successes: stats.successes,
            rollbacks: stats.rollbacks,
            aborts: stats.aborts,
            throughput,
            abort_rate: abort_rate(stats.aborts, stats.total),
            stalls: self.stalls,
            kinds,
        }
    }
}

/// Percentage of aborted attempts, 0 when nothing ran.
pub fn abort_rate(aborts: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        aborts as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct KindReport {
    pub name: String,
    pub count: u64,
    pub aborts: u64,
    pub rollbacks: u64,
    pub abort_rate: f64,
    pub avg_latency: Duration,
    pub p50_latency: Duration,
    pub p95_latency: Duration,
    pub p99_latency: Duration,
    pub max_latency: Duration,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub concurrency: usize,
    /// Nominal test duration.
    pub duration: Duration,
    /// Actual span including the drain tail.
    pub elapsed: Duration,
    pub total: u64,
    pub successes: u64,
    pub rollbacks: u64,
    pub aborts: u64,
    /// Successful attempts (commits and intentional rollbacks) per second.
    pub throughput: f64,
    pub abort_rate: f64,
    pub stalls: u64,
    /// Sorted by name.
    pub kinds: Vec<KindReport>,
}

impl RunReport {
    pub fn kind(&self, name: &str) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.name == name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[OVERALL], ThreadCount, {}", self.concurrency)?;
        writeln!(f, "[OVERALL], RunTime(ms), {}", self.duration.as_millis())?;
        writeln!(f, "[OVERALL], Elapsed(ms), {}", self.elapsed.as_millis())?;
        writeln!(f, "[OVERALL], Operations, {}", self.total)?;
        writeln!(f, "[OVERALL], Committed, {}", self.successes)?;
        writeln!(f, "[OVERALL], RolledBack, {}", self.rollbacks)?;
        writeln!(f, "[OVERALL], Aborts, {}", self.aborts)?;
        writeln!(f, "[OVERALL], Throughput(ops/sec), {:.2}", self.throughput)?;
        writeln!(f, "[OVERALL], AbortRate(%), {:.2}", self.abort_rate)?;
        writeln!(f, "[OVERALL], EngineStalls, {}", self.stalls)?;
        for kind in &self.kinds {
            let section = kind.name.to_uppercase();
            writeln!(f, "[{}], Operations, {}", section, kind.count)?;
            writeln!(f, "[{}], Aborts, {}", section, kind.aborts)?;
            writeln!(f, "[{}], RolledBack, {}", section, kind.rollbacks)?;
            writeln!(f, "[{}], AbortRate(%), {:.2}", section, kind.abort_rate)?;
            writeln!(
                f,
                "[{}], AverageLatency(us), {}",
                section,
                kind.avg_latency.as_micros()
            )?;
            writeln!(
                f,
                "[{}], 95thPercentileLatency(us), {}",
                section,
                kind.p95_latency.as_micros()
            )?;
            writeln!(
                f,
                "[{}], 99thPercentileLatency(us), {}",
                section,
                kind.p99_latency.as_micros()
            )?;
            writeln!(f, "[{}], MaxLatency(us), {}", section, kind.max_latency.as_micros())?;
            if let Some(error) = &kind.last_error {
                writeln!(f, "[{}], LastError, {}", section, error)?;
            }
        }
        Ok(())
    }
}
