use super::Generator;
use crate::error::ConfigError;
use crate::workload::TransactionCatalog;
use rand::rngs::SmallRng;
use rand::Rng;

/// Pool entries per unit of weight. A weight of 0.1 yields one entry.
pub const DEFAULT_RESOLUTION: u32 = 10;

/// Upper bound on pool entries, so sampling memory stays bounded.
pub const MAX_POOL_ENTRIES: usize = 1 << 20;

/// Discrete distribution over catalog kinds built by replication: each kind
/// appears `round(weight * resolution)` times and draws are uniform over the
/// entries.
#[derive(Debug, Clone)]
pub struct WeightedPool {
    entries: Vec<usize>,
    kinds: usize,
}

impl WeightedPool {
    pub fn build<C>(catalog: &TransactionCatalog<C>, resolution: u32) -> Result<Self, ConfigError> {
        if resolution < DEFAULT_RESOLUTION {
            return Err(ConfigError::InvalidResolution(resolution));
        }
        if catalog.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        let scale = f64::from(resolution);
        let min = 1.0 / scale;
        let mut total = 0.0;
        for kind in catalog.kinds() {
            let weight = kind.weight();
            // Tolerate float noise such as 0.30000000000000004.
            if !weight.is_finite() || weight * scale + 1e-9 < 1.0 {
                return Err(ConfigError::InvalidWeight {
                    name: kind.name().to_string(),
                    weight,
                    min,
                });
            }
            total += (weight * scale).round();
        }
        if total > MAX_POOL_ENTRIES as f64 {
            return Err(ConfigError::PoolTooLarge {
                entries: total,
                max: MAX_POOL_ENTRIES,
            });
        }
        let mut entries = Vec::with_capacity(total as usize);
        for (index, kind) in catalog.kinds().iter().enumerate() {
            let copies = (kind.weight() * scale).round() as usize;
            entries.extend(std::iter::repeat(index).take(copies));
        }
        Ok(WeightedPool {
            entries,
            kinds: catalog.len(),
        })
    }

    /// Number of entries in the pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many entries belong to the kind at `index`.
    pub fn multiplicity(&self, index: usize) -> usize {
        self.entries.iter().filter(|&&e| e == index).count()
    }

    pub fn kinds(&self) -> usize {
        self.kinds
    }
}

impl Generator<usize> for WeightedPool {
    /// Returns the catalog index of the drawn kind.
    fn next_value(&self, rng: &mut SmallRng) -> usize {
        self.entries[rng.gen_range(0..self.entries.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedConn, SimulatedTransaction};
    use crate::workload::Transaction;
    use rand::SeedableRng;
    use std::sync::Arc;
    use std::time::Duration;

    fn catalog(weights: &[f64]) -> TransactionCatalog<SimulatedConn> {
        let mut builder = TransactionCatalog::builder();
        for (i, weight) in weights.iter().enumerate() {
            let txn: Arc<dyn Transaction<SimulatedConn>> =
                Arc::new(SimulatedTransaction::new(Duration::from_millis(1)));
            builder = builder.kind(format!("kind{}", i), *weight, txn);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_multiplicity_follows_weights() {
        // The TPC-E mix.
        let weights = [4.9, 13.0, 1.0, 18.0, 14.0, 8.0, 10.1, 10.0, 19.0, 2.0];
        let pool = WeightedPool::build(&catalog(&weights), DEFAULT_RESOLUTION).unwrap();

        assert_eq!(pool.len(), 1000);
        assert_eq!(pool.multiplicity(0), 49);
        assert_eq!(pool.multiplicity(2), 10);
        assert_eq!(pool.multiplicity(6), 101);
        for i in 0..weights.len() {
            assert!(pool.multiplicity(i) >= 1);
        }
    }

    #[test]
    fn test_smallest_weight_yields_one_entry() {
        let pool = WeightedPool::build(&catalog(&[0.1, 5.0]), DEFAULT_RESOLUTION).unwrap();
        assert_eq!(pool.multiplicity(0), 1);
        assert_eq!(pool.multiplicity(1), 50);
    }

    #[test]
    fn test_weight_below_resolution_is_rejected() {
        let result = WeightedPool::build(&catalog(&[0.05, 1.0]), DEFAULT_RESOLUTION);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidWeight { ref name, .. }) if name == "kind0"
        ));

        // A finer resolution admits it.
        let pool = WeightedPool::build(&catalog(&[0.05, 1.0]), 100).unwrap();
        assert_eq!(pool.multiplicity(0), 5);
    }

    #[test]
    fn test_huge_weight_is_rejected() {
        let result = WeightedPool::build(&catalog(&[1.0, 1e20]), DEFAULT_RESOLUTION);
        assert!(matches!(
            result,
            Err(ConfigError::PoolTooLarge { max, .. }) if max == MAX_POOL_ENTRIES
        ));

        // Right at the limit still builds.
        let at_limit = MAX_POOL_ENTRIES as f64 / 10.0 - 1.0;
        let pool = WeightedPool::build(&catalog(&[1.0, at_limit]), DEFAULT_RESOLUTION).unwrap();
        assert_eq!(pool.len(), MAX_POOL_ENTRIES);
    }

    #[test]
    fn test_coarse_resolution_is_rejected() {
        let result = WeightedPool::build(&catalog(&[1.0]), 5);
        assert_eq!(result.err(), Some(ConfigError::InvalidResolution(5)));
    }

    #[test]
    fn test_draw_frequencies_converge_to_weights() {
        let pool = WeightedPool::build(&catalog(&[1.0, 3.0]), DEFAULT_RESOLUTION).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let draws = 100_000;
        let mut counts = [0usize; 2];
        for _ in 0..draws {
            let index = pool.next_value(&mut rng);
            assert!(index < pool.kinds());
            counts[index] += 1;
        }
        let share = counts[1] as f64 / draws as f64;
        assert!((share - 0.75).abs() < 0.01, "share of heavy kind was {}", share);
    }
}
