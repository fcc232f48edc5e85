use crate::phased::PhaseState;
use std::time::Duration;
use thiserror::Error;

/// Problems with the run configuration. These are fatal and reported
/// before any attempt is submitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("transaction catalog is empty")]
    EmptyCatalog,

    #[error("transaction `{0}` is declared more than once")]
    DuplicateKind(String),

    #[error("transaction `{name}` has weight {weight}, below the minimum of {min}")]
    InvalidWeight { name: String, weight: f64, min: f64 },

    #[error("weights expand to {entries} pool entries, above the limit of {max}")]
    PoolTooLarge { entries: f64, max: usize },

    #[error("weight resolution must be at least 10, got {0}")]
    InvalidResolution(u32),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("test duration must be positive")]
    NonPositiveDuration,

    #[error("invalid isolation level `{0}`")]
    InvalidIsolationLevel(String),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("{0} is an invalid database name")]
    UnknownDatabase(String),
}

/// Why a single attempt was classified as an abort.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    #[error("could not acquire resource: {0}")]
    ResourceAcquisition(String),

    #[error("input generation failed: {0}")]
    InputGeneration(String),

    #[error("{0}")]
    Collaborator(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("collaborator panicked: {0}")]
    Panicked(String),
}

/// A canonical stream did not complete, which invalidates its phase.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{phase} phase failed in stream {stream} at `{kind}`: {source}")]
pub struct PhaseError {
    pub phase: Phase,
    pub stream: usize,
    pub kind: String,
    pub source: AttemptError,
}

/// Why a phased run produced no report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhasedError {
    #[error("phased run already started, state is {0:?}")]
    AlreadyStarted(PhaseState),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Power,
    Throughput,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Power => write!(f, "power"),
            Phase::Throughput => write!(f, "throughput"),
        }
    }
}
