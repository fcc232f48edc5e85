mod catalog;

pub use catalog::{CatalogBuilder, TransactionCatalog, TransactionKind};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rand::rngs::SmallRng;
use std::collections::HashMap;
use std::fmt;

/// How a transaction finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    /// The transaction chose to roll back. This is part of the workload
    /// and counts as successful work.
    RolledBack,
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    RollbackOk,
    Abort,
}

impl From<Completion> for Outcome {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Committed => Outcome::Success,
            Completion::RolledBack => Outcome::RollbackOk,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::RollbackOk => "rollback_ok",
            Outcome::Abort => "abort",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    List(Vec<Value>),
}

/// Inputs produced for one execution of a transaction kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSet {
    pub params: HashMap<String, Value>,
    /// Roll the transaction back instead of committing it.
    pub rollback: bool,
}

impl InputSet {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// A kind of unit of work the driver can submit against a connection of
/// type `C`.
#[async_trait]
pub trait Transaction<C>: Send + Sync {
    /// Builds inputs for one execution. Lookups must be read-only and go
    /// through `conn`, which belongs to the calling attempt alone.
    async fn generate_inputs(&self, conn: &mut C, rng: &mut SmallRng) -> Result<InputSet>;

    /// Runs the unit of work. Returning `Ok` means the transaction was
    /// committed (or deliberately rolled back) before returning.
    async fn execute(&self, conn: &mut C, inputs: InputSet) -> Result<Completion>;
}
