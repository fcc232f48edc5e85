use super::Generator;
use crate::error::ConfigError;
use crate::workload::Value;
use chrono::{Datelike, Days, Months, NaiveDate};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Produces one transaction parameter per draw.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueGenerator {
    UniformInt { min: i64, max: i64 },
    UniformFloat { min: f64, max: f64 },
    Choice(Vec<Value>),
    /// `count` distinct values drawn from `values`, as a list.
    Sample { values: Vec<Value>, count: usize },
    /// A date `start + k * step` for a uniform `k` that stays within `end`.
    Date {
        start: NaiveDate,
        step: DateStep,
        steps: u32,
    },
    Constant(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStep {
    #[default]
    Day,
    Month,
    Year,
}

impl ValueGenerator {
    pub fn uniform_int(name: &str, min: i64, max: i64) -> Result<Self, ConfigError> {
        if min > max {
            return Err(invalid(name, format!("min {} is greater than max {}", min, max)));
        }
        Ok(ValueGenerator::UniformInt { min, max })
    }

    pub fn uniform_float(name: &str, min: f64, max: f64) -> Result<Self, ConfigError> {
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(invalid(name, format!("bad range {}..{}", min, max)));
        }
        Ok(ValueGenerator::UniformFloat { min, max })
    }

    pub fn choice(name: &str, values: Vec<Value>) -> Result<Self, ConfigError> {
        if values.is_empty() {
            return Err(invalid(name, "choice needs at least one value".to_string()));
        }
        Ok(ValueGenerator::Choice(values))
    }

    pub fn sample(name: &str, values: Vec<Value>, count: usize) -> Result<Self, ConfigError> {
        if count == 0 || count > values.len() {
            return Err(invalid(
                name,
                format!("cannot sample {} of {} values", count, values.len()),
            ));
        }
        Ok(ValueGenerator::Sample { values, count })
    }

    pub fn date(
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
        step: DateStep,
    ) -> Result<Self, ConfigError> {
        if start > end {
            return Err(invalid(name, format!("start {} is after end {}", start, end)));
        }
        let months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
        let steps = match step {
            DateStep::Day => (end - start).num_days(),
            DateStep::Month if end.day() < start.day() => i64::from(months) - 1,
            DateStep::Month => i64::from(months),
            DateStep::Year if (end.month(), end.day()) < (start.month(), start.day()) => {
                i64::from(end.year() - start.year()) - 1
            }
            DateStep::Year => i64::from(end.year() - start.year()),
        };
        let steps = u32::try_from(steps.max(0))
            .map_err(|_| invalid(name, format!("{} to {} is too wide", start, end)))?;
        Ok(ValueGenerator::Date { start, step, steps })
    }
}

fn nth_date(start: NaiveDate, step: DateStep, k: u32) -> Option<NaiveDate> {
    match step {
        DateStep::Day => start.checked_add_days(Days::new(u64::from(k))),
        DateStep::Month => start.checked_add_months(Months::new(k)),
        DateStep::Year => start.checked_add_months(Months::new(k.checked_mul(12)?)),
    }
}

fn invalid(name: &str, reason: String) -> ConfigError {
    ConfigError::InvalidParam {
        name: name.to_string(),
        reason,
    }
}

impl Generator<Value> for ValueGenerator {
    fn next_value(&self, rng: &mut SmallRng) -> Value {
        match self {
            ValueGenerator::UniformInt { min, max } => Value::Int(rng.gen_range(*min..=*max)),
            ValueGenerator::UniformFloat { min, max } => {
                if min == max {
                    Value::Float(*min)
                } else {
                    Value::Float(rng.gen_range(*min..*max))
                }
            }
            // Constructors reject empty choices.
            ValueGenerator::Choice(values) => values
                .choose(rng)
                .cloned()
                .unwrap_or(Value::Bool(false)),
            ValueGenerator::Sample { values, count } => {
                Value::List(values.choose_multiple(rng, *count).cloned().collect())
            }
            ValueGenerator::Date { start, step, steps } => {
                let k = rng.gen_range(0..=*steps);
                Value::Date(nth_date(*start, *step, k).unwrap_or(*start))
            }
            ValueGenerator::Constant(value) => value.clone(),
        }
    }
}
