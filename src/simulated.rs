use crate::db::DB;
use crate::error::ConfigError;
use crate::generator::{Generator, ValueGenerator};
use crate::properties::{check_probability, Properties, SimulatedProperties};
use crate::workload::{Completion, InputSet, Transaction, TransactionCatalog};

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-process stand-in for a data store. Transactions sleep for their
/// configured latency, so runs exercise the driver without a database.
pub struct Simulated {
    connect_failure_probability: f64,
    next_id: AtomicU64,
}

#[derive(Debug)]
pub struct SimulatedConn {
    pub id: u64,
}

impl Simulated {
    pub fn new(props: &SimulatedProperties) -> Result<Self, ConfigError> {
        check_probability(
            "connect_failure_probability",
            props.connect_failure_probability,
        )?;
        Ok(Simulated {
            connect_failure_probability: props.connect_failure_probability,
            next_id: AtomicU64::new(0),
        })
    }

    /// Number of connections handed out so far.
    pub fn connections(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl Default for Simulated {
    fn default() -> Self {
        Simulated {
            connect_failure_probability: 0.0,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DB for Simulated {
    type Conn = SimulatedConn;

    async fn connect(&self) -> Result<SimulatedConn> {
        let p = self.connect_failure_probability;
        if p > 0.0 && rand::thread_rng().gen_bool(p) {
            bail!("connection refused");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(SimulatedConn { id })
    }
}

pub struct SimulatedTransaction {
    latency: Duration,
    rollback_probability: f64,
    abort_probability: f64,
    params: Vec<(String, ValueGenerator)>,
}

impl SimulatedTransaction {
    pub fn new(latency: Duration) -> Self {
        SimulatedTransaction {
            latency,
            rollback_probability: 0.0,
            abort_probability: 0.0,
            params: Vec::new(),
        }
    }

    pub fn with_rollback_probability(mut self, p: f64) -> Self {
        self.rollback_probability = p;
        self
    }

    pub fn with_abort_probability(mut self, p: f64) -> Self {
        self.abort_probability = p;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, gen: ValueGenerator) -> Self {
        self.params.push((name.into(), gen));
        self
    }
}

#[async_trait]
impl Transaction<SimulatedConn> for SimulatedTransaction {
    async fn generate_inputs(
        &self,
        _conn: &mut SimulatedConn,
        rng: &mut SmallRng,
    ) -> Result<InputSet> {
        let mut inputs = InputSet::default();
        for (name, gen) in &self.params {
            inputs.params.insert(name.clone(), gen.next_value(rng));
        }
        inputs.rollback = self.rollback_probability > 0.0 && rng.gen_bool(self.rollback_probability);
        Ok(inputs)
    }

    async fn execute(&self, conn: &mut SimulatedConn, inputs: InputSet) -> Result<Completion> {
        let p = self.abort_probability;
        let fail = p > 0.0 && rand::thread_rng().gen_bool(p);
        tokio::time::sleep(self.latency).await;
        if fail {
            bail!(
                "could not serialize access due to concurrent update (conn {})",
                conn.id
            );
        }
        if inputs.rollback {
            return Ok(Completion::RolledBack);
        }
        Ok(Completion::Committed)
    }
}

/// Builds the catalog from the workload's `[[transaction]]` entries.
pub fn catalog(props: &Properties) -> Result<TransactionCatalog<SimulatedConn>, ConfigError> {
    let mut builder = TransactionCatalog::builder();
    for txn in &props.transactions {
        check_probability(&format!("{}.rollback_probability", txn.name), txn.rollback_probability)?;
        check_probability(&format!("{}.abort_probability", txn.name), txn.abort_probability)?;
        let mut simulated = SimulatedTransaction::new(Duration::from_millis(txn.latency_ms))
            .with_rollback_probability(txn.rollback_probability)
            .with_abort_probability(txn.abort_probability);
        for (name, param) in &txn.params {
            match param.to_generator(name)? {
                Some(gen) => simulated = simulated.with_param(name.clone(), gen),
                None => {
                    return Err(ConfigError::InvalidParam {
                        name: name.clone(),
                        reason: "lookups need the postgres database".to_string(),
                    })
                }
            }
        }
        let simulated: Arc<dyn Transaction<SimulatedConn>> = Arc::new(simulated);
        builder = builder.kind(txn.name.clone(), txn.weight, simulated);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::WeightedPool;
    use crate::workload::Value;
    use rand::SeedableRng;

    #[tokio::test(start_paused = true)]
    async fn test_execute_sleeps_then_commits() {
        let db = Simulated::default();
        let mut conn = db.connect().await.unwrap();
        let txn = SimulatedTransaction::new(Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        let completion = txn.execute(&mut conn, InputSet::default()).await.unwrap();
        assert_eq!(completion, Completion::Committed);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_and_abort_probabilities() {
        let db = Simulated::default();
        let mut conn = db.connect().await.unwrap();
        let mut rng = SmallRng::seed_from_u64(11);

        let rolls_back = SimulatedTransaction::new(Duration::ZERO).with_rollback_probability(1.0);
        let inputs = rolls_back.generate_inputs(&mut conn, &mut rng).await.unwrap();
        assert!(inputs.rollback);
        assert_eq!(
            rolls_back.execute(&mut conn, inputs).await.unwrap(),
            Completion::RolledBack
        );

        let aborts = SimulatedTransaction::new(Duration::ZERO).with_abort_probability(1.0);
        let inputs = aborts.generate_inputs(&mut conn, &mut rng).await.unwrap();
        assert!(aborts.execute(&mut conn, inputs).await.is_err());
    }

    #[tokio::test]
    async fn test_connections_get_distinct_ids() {
        let db = Simulated::default();
        let a = db.connect().await.unwrap();
        let b = db.connect().await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(db.connections(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let db = Simulated::new(&SimulatedProperties {
            connect_failure_probability: 1.0,
        })
        .unwrap();
        assert!(db.connect().await.is_err());
    }

    #[test]
    fn test_catalog_from_properties() {
        let props: Properties = toml::from_str(
            r#"
database = "simulated"

[[transaction]]
name = "trade_result"
weight = 10.0
latency_ms = 20

[transaction.params]
trade_id = { type = "uniform", min = 1, max = 100 }
"#,
        )
        .unwrap();
        let catalog = catalog(&props).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.kinds()[0].name(), "trade_result");
    }

    #[test]
    fn test_catalog_rejects_lookup_and_bad_probability() {
        let props: Properties = toml::from_str(
            r#"
[[transaction]]
name = "customer_position"
weight = 13.0

[transaction.params]
cust_id = { type = "lookup", query = "SELECT c_id FROM customer LIMIT 1" }
"#,
        )
        .unwrap();
        assert!(matches!(
            catalog(&props),
            Err(ConfigError::InvalidParam { ref name, .. }) if name == "cust_id"
        ));

        let props: Properties = toml::from_str(
            r#"
[[transaction]]
name = "trade_order"
weight = 10.1
rollback_probability = 1.5
"#,
        )
        .unwrap();
        assert!(catalog(&props).is_err());
    }

    #[tokio::test]
    async fn test_generated_params() {
        let txn = SimulatedTransaction::new(Duration::ZERO)
            .with_param("qty", ValueGenerator::Constant(Value::Int(100)));
        let mut conn = SimulatedConn { id: 0 };
        let mut rng = SmallRng::seed_from_u64(0);
        let inputs = txn.generate_inputs(&mut conn, &mut rng).await.unwrap();
        assert_eq!(inputs.get("qty"), Some(&Value::Int(100)));
        assert!(!inputs.rollback);
    }

    #[test]
    fn test_bundled_workload() {
        let props: Properties =
            toml::from_str(include_str!("../workloads/simulated.toml")).unwrap();
        let catalog = catalog(&props).unwrap();
        assert_eq!(catalog.len(), 10);
        let pool = WeightedPool::build(&catalog, props.weight_resolution).unwrap();
        assert_eq!(pool.len(), 1000);
        assert!(props.load_config().is_ok());
    }
}
