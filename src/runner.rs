use crate::db::DB;
use crate::error::AttemptError;
use crate::workload::{Completion, InputSet, Outcome, TransactionCatalog};

use futures::FutureExt;
use log::debug;
use rand::rngs::SmallRng;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One completed execution of a transaction kind.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Concurrency slot (or stream) the attempt ran in.
    pub slot: usize,
    /// Catalog index of the kind.
    pub kind: usize,
    pub started: Instant,
    pub finished: Instant,
    /// Connection acquisition plus execution. Input generation is excluded.
    pub latency: Duration,
    pub outcome: Outcome,
    pub error: Option<AttemptError>,
}

/// Runs single transactions against a database: acquires a connection,
/// generates inputs, executes, and classifies what happened.
pub struct TransactionRunner<D: DB> {
    db: Arc<D>,
    catalog: Arc<TransactionCatalog<D::Conn>>,
    attempt_timeout: Option<Duration>,
}

impl<D: DB> Clone for TransactionRunner<D> {
    fn clone(&self) -> Self {
        TransactionRunner {
            db: self.db.clone(),
            catalog: self.catalog.clone(),
            attempt_timeout: self.attempt_timeout,
        }
    }
}

impl<D: DB> TransactionRunner<D> {
    pub fn new(
        db: Arc<D>,
        catalog: Arc<TransactionCatalog<D::Conn>>,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        TransactionRunner {
            db,
            catalog,
            attempt_timeout,
        }
    }

    pub fn catalog(&self) -> &TransactionCatalog<D::Conn> {
        &self.catalog
    }

    pub async fn connect(&self) -> Result<D::Conn, AttemptError> {
        guard(self.db.connect(), None, AttemptError::ResourceAcquisition).await
    }

    async fn generate_inputs(
        &self,
        kind: usize,
        conn: &mut D::Conn,
        rng: &mut SmallRng,
    ) -> Result<InputSet, AttemptError> {
        let transaction = self.catalog.kinds()[kind].transaction();
        guard(
            transaction.generate_inputs(conn, rng),
            None,
            AttemptError::InputGeneration,
        )
        .await
    }

    /// Executes `kind`, returning the result and how long execution took,
    /// whether or not it succeeded.
    async fn execute(
        &self,
        kind: usize,
        conn: &mut D::Conn,
        inputs: InputSet,
    ) -> (Result<Completion, AttemptError>, Duration) {
        let transaction = self.catalog.kinds()[kind].transaction();
        let start = Instant::now();
        let result = guard(
            transaction.execute(conn, inputs),
            self.attempt_timeout,
            AttemptError::Collaborator,
        )
        .await;
        (result, start.elapsed())
    }

    /// Generates inputs for `kind` on `conn` and executes it, returning the
    /// completion and the execution time.
    pub async fn run_kind(
        &self,
        kind: usize,
        conn: &mut D::Conn,
        rng: &mut SmallRng,
    ) -> Result<(Completion, Duration), AttemptError> {
        let inputs = self.generate_inputs(kind, conn, rng).await?;
        let (result, elapsed) = self.execute(kind, conn, inputs).await;
        Ok((result?, elapsed))
    }

    /// Runs one full attempt. Never fails: every error becomes an abort.
    pub async fn attempt(&self, slot: usize, kind: usize, mut rng: SmallRng) -> Attempt {
        let started = Instant::now();
        let (latency, result) = match self.connect().await {
            Ok(mut conn) => {
                let acquired = started.elapsed();
                let (result, elapsed) = match self.generate_inputs(kind, &mut conn, &mut rng).await {
                    Ok(inputs) => self.execute(kind, &mut conn, inputs).await,
                    Err(e) => (Err(e), Duration::ZERO),
                };
                // Release before the attempt is reported.
                drop(conn);
                (acquired + elapsed, result)
            }
            Err(e) => (started.elapsed(), Err(e)),
        };
        let (outcome, error) = match result {
            Ok(completion) => (Outcome::from(completion), None),
            Err(e) => (Outcome::Abort, Some(e)),
        };
        let attempt = Attempt {
            slot,
            kind,
            started,
            finished: Instant::now(),
            latency,
            outcome,
            error,
        };
        debug!(
            "  {:<20} | {:<12} | {:.2} ms",
            self.catalog.kinds()[kind].name(),
            attempt.outcome,
            attempt.latency.as_secs_f64() * 1000.0
        );
        attempt
    }
}

/// Awaits a collaborator future, turning errors, panics and an exceeded
/// `timeout` into an `AttemptError`.
async fn guard<T, F>(
    fut: F,
    timeout: Option<Duration>,
    classify: fn(String) -> AttemptError,
) -> Result<T, AttemptError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let fut = AssertUnwindSafe(fut).catch_unwind();
    let caught = match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| AttemptError::TimedOut(limit))?,
        None => fut.await,
    };
    match caught {
        Ok(result) => result.map_err(|e| classify(format!("{:#}", e))),
        Err(panic) => Err(AttemptError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
