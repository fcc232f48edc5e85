mod value;
mod weighted_pool;

pub use value::{DateStep, ValueGenerator};
pub use weighted_pool::{WeightedPool, DEFAULT_RESOLUTION};

use rand::rngs::SmallRng;

pub trait Generator<T> {
    fn next_value(&self, rng: &mut SmallRng) -> T;
}
