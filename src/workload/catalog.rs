use super::Transaction;
use crate::error::ConfigError;
use std::collections::HashSet;
use std::sync::Arc;

pub struct TransactionKind<C> {
    name: String,
    weight: f64,
    transaction: Arc<dyn Transaction<C>>,
}

impl<C> TransactionKind<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn transaction(&self) -> &Arc<dyn Transaction<C>> {
        &self.transaction
    }
}

/// The set of transaction kinds a run draws from. Declaration order is the
/// canonical order used by phased runs.
pub struct TransactionCatalog<C> {
    kinds: Vec<TransactionKind<C>>,
}

impl<C> TransactionCatalog<C> {
    pub fn builder() -> CatalogBuilder<C> {
        CatalogBuilder { kinds: Vec::new() }
    }

    pub fn kinds(&self) -> &[TransactionKind<C>] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

pub struct CatalogBuilder<C> {
    kinds: Vec<TransactionKind<C>>,
}

impl<C> CatalogBuilder<C> {
    pub fn kind(
        mut self,
        name: impl Into<String>,
        weight: f64,
        transaction: Arc<dyn Transaction<C>>,
    ) -> Self {
        self.kinds.push(TransactionKind {
            name: name.into(),
            weight,
            transaction,
        });
        self
    }

    pub fn build(self) -> Result<TransactionCatalog<C>, ConfigError> {
        if self.kinds.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        let mut seen = HashSet::new();
        for kind in &self.kinds {
            if !seen.insert(kind.name.as_str()) {
                return Err(ConfigError::DuplicateKind(kind.name.clone()));
            }
            if !kind.weight.is_finite() || kind.weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    name: kind.name.clone(),
                    weight: kind.weight,
                    min: 0.0,
                });
            }
        }
        Ok(TransactionCatalog { kinds: self.kinds })
    }
}
