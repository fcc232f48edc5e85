use crate::error::ConfigError;
use anyhow::Result;
use async_trait::async_trait;
use std::str::FromStr;

/// A data store the driver runs transactions against.
///
/// Every attempt (and every canonical stream) calls `connect` for its own
/// connection and holds it exclusively. Dropping the connection releases it,
/// so release happens on every exit path.
#[async_trait]
pub trait DB: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Simulated,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(db: &str) -> Result<Self, Self::Err> {
        match db {
            "postgres" => Ok(Backend::Postgres),
            "simulated" => Ok(Backend::Simulated),
            db => Err(ConfigError::UnknownDatabase(db.to_string())),
        }
    }
}
