use crate::db::DB;
use crate::error::ConfigError;
use crate::generator::{Generator, ValueGenerator};
use crate::properties::{check_probability, IsolationLevel, ParamProperties, Properties};
use crate::workload::{Completion, InputSet, Transaction, TransactionCatalog, Value};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};

pub struct Postgres {
    pool: Pool,
    isolation: tokio_postgres::IsolationLevel,
    read_only: bool,
}

/// A pooled connection. Dropping it returns the connection to the pool.
pub struct PgConn {
    client: Object,
    isolation: tokio_postgres::IsolationLevel,
    read_only: bool,
}

impl Postgres {
    pub fn new(props: &Properties) -> Result<Self> {
        let config: tokio_postgres::Config = props
            .postgres
            .url
            .parse()
            .context("invalid postgres url")?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool_size = props.postgres.pool_size.unwrap_or(props.concurrency).max(1);
        let pool = Pool::builder(manager).max_size(pool_size).build()?;
        Ok(Postgres {
            pool,
            isolation: to_pg_isolation(props.isolation()?),
            read_only: props.postgres.read_only,
        })
    }
}

fn to_pg_isolation(level: IsolationLevel) -> tokio_postgres::IsolationLevel {
    match level {
        IsolationLevel::ReadUncommitted => tokio_postgres::IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted => tokio_postgres::IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead => tokio_postgres::IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable => tokio_postgres::IsolationLevel::Serializable,
    }
}

#[async_trait]
impl DB for Postgres {
    type Conn = PgConn;

    async fn connect(&self) -> Result<PgConn> {
        let client = self.pool.get().await?;
        Ok(PgConn {
            client,
            isolation: self.isolation,
            read_only: self.read_only,
        })
    }
}

/// A SQL statement with `:name` placeholders rewritten to `$n`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    /// Parameter names in `$n` order.
    pub params: Vec<String>,
}

impl Statement {
    pub fn parse(text: &str) -> Self {
        let mut sql = String::with_capacity(text.len());
        let mut params: Vec<String> = Vec::new();
        let mut chars = text.chars().peekable();
        let mut in_quotes = false;
        while let Some(c) = chars.next() {
            if c == '\'' {
                in_quotes = !in_quotes;
                sql.push(c);
                continue;
            }
            if in_quotes || c != ':' {
                sql.push(c);
                continue;
            }
            // `::type` casts pass through.
            if chars.peek() == Some(&':') {
                chars.next();
                sql.push_str("::");
                continue;
            }
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                sql.push(':');
                continue;
            }
            let position = match params.iter().position(|p| *p == name) {
                Some(i) => i + 1,
                None => {
                    params.push(name);
                    params.len()
                }
            };
            sql.push_str(&format!("${}", position));
        }
        Statement { sql, params }
    }
}

enum Param {
    Generated(ValueGenerator),
    Lookup(String),
}

/// A transaction kind declared in the workload file: statements run in
/// order inside one transaction at the configured isolation level.
pub struct SqlTransaction {
    statements: Vec<Statement>,
    params: Vec<(String, Param)>,
    rollback_probability: f64,
}

impl SqlTransaction {
    pub fn new(statements: &[String], rollback_probability: f64) -> Self {
        SqlTransaction {
            statements: statements.iter().map(|s| Statement::parse(s)).collect(),
            params: Vec::new(),
            rollback_probability,
        }
    }

    pub fn with_param(mut self, name: &str, param: &ParamProperties) -> Result<Self, ConfigError> {
        let param = match param {
            ParamProperties::Lookup { query } => Param::Lookup(query.clone()),
            other => other
                .to_generator(name)?
                .map(Param::Generated)
                .ok_or_else(|| ConfigError::InvalidParam {
                    name: name.to_string(),
                    reason: "no generator".to_string(),
                })?,
        };
        self.params.push((name.to_string(), param));
        Ok(self)
    }

    /// Every placeholder must name a declared parameter.
    fn check_placeholders(&self, kind: &str) -> Result<(), ConfigError> {
        for statement in &self.statements {
            for name in &statement.params {
                if !self.params.iter().any(|(p, _)| p == name) {
                    return Err(ConfigError::InvalidParam {
                        name: name.clone(),
                        reason: format!("used by `{}` but not declared", kind),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction<PgConn> for SqlTransaction {
    async fn generate_inputs(&self, conn: &mut PgConn, rng: &mut SmallRng) -> Result<InputSet> {
        let mut inputs = InputSet::default();
        for (name, param) in &self.params {
            let value = match param {
                Param::Generated(gen) => gen.next_value(rng),
                Param::Lookup(query) => {
                    let row = conn
                        .client
                        .query_opt(query.as_str(), &[])
                        .await?
                        .ok_or_else(|| anyhow!("lookup for `{}` returned no rows", name))?;
                    from_row(&row)?
                }
            };
            inputs.params.insert(name.clone(), value);
        }
        inputs.rollback = self.rollback_probability > 0.0 && rng.gen_bool(self.rollback_probability);
        Ok(inputs)
    }

    async fn execute(&self, conn: &mut PgConn, inputs: InputSet) -> Result<Completion> {
        let isolation = conn.isolation;
        let read_only = conn.read_only;
        let client: &mut tokio_postgres::Client = &mut conn.client;
        let tx = client
            .build_transaction()
            .isolation_level(isolation)
            .read_only(read_only)
            .start()
            .await?;
        for statement in &self.statements {
            let prepared = tx.prepare(&statement.sql).await?;
            let mut bound = Vec::with_capacity(statement.params.len());
            for (name, ty) in statement.params.iter().zip(prepared.params()) {
                let value = inputs
                    .get(name)
                    .ok_or_else(|| anyhow!("missing input `{}`", name))?;
                bound.push(bind(name, value, ty)?);
            }
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let rows = tx.query(&prepared, &refs).await?;
            debug!("{} -> {} rows", statement.sql, rows.len());
        }
        if inputs.rollback {
            tx.rollback().await?;
            return Ok(Completion::RolledBack);
        }
        tx.commit().await?;
        Ok(Completion::Committed)
    }
}

/// Converts a generated value to the type the server expects for a
/// parameter.
fn bind(name: &str, value: &Value, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>> {
    let param: Box<dyn ToSql + Sync + Send> = match (value, ty) {
        (Value::Int(v), &Type::INT2) => Box::new(i16::try_from(*v)?),
        (Value::Int(v), &Type::INT4) => Box::new(i32::try_from(*v)?),
        (Value::Int(v), &Type::INT8) => Box::new(*v),
        (Value::Int(v), &Type::FLOAT8) => Box::new(*v as f64),
        (Value::Int(v), &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR) => Box::new(v.to_string()),
        (Value::Float(v), &Type::FLOAT4) => Box::new(*v as f32),
        (Value::Float(v), &Type::FLOAT8) => Box::new(*v),
        (Value::Text(v), &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME) => {
            Box::new(v.clone())
        }
        (Value::Bool(v), &Type::BOOL) => Box::new(*v),
        (Value::Date(v), &Type::DATE) => Box::new(*v),
        (Value::List(items), &Type::INT4_ARRAY) => Box::new(
            int_elements(name, items)?
                .into_iter()
                .map(i32::try_from)
                .collect::<Result<Vec<i32>, _>>()?,
        ),
        (Value::List(items), &Type::INT8_ARRAY) => Box::new(int_elements(name, items)?),
        (Value::List(items), &Type::TEXT_ARRAY | &Type::VARCHAR_ARRAY | &Type::BPCHAR_ARRAY) => {
            Box::new(text_elements(name, items)?)
        }
        (value, ty) => bail!(
            "cannot bind {:?} to `{}` of type {}; add a cast to the placeholder",
            value,
            name,
            ty
        ),
    };
    Ok(param)
}

fn int_elements(name: &str, items: &[Value]) -> Result<Vec<i64>> {
    items
        .iter()
        .map(|item| match item {
            Value::Int(v) => Ok(*v),
            other => Err(anyhow!("cannot bind {:?} in `{}` as an integer", other, name)),
        })
        .collect()
}

fn text_elements(name: &str, items: &[Value]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| match item {
            Value::Text(v) => Ok(v.clone()),
            Value::Int(v) => Ok(v.to_string()),
            other => Err(anyhow!("cannot bind {:?} in `{}` as text", other, name)),
        })
        .collect()
}

fn from_row(row: &Row) -> Result<Value> {
    let column = row
        .columns()
        .first()
        .ok_or_else(|| anyhow!("lookup returned no columns"))?;
    let value = match *column.type_() {
        Type::INT2 => Value::Int(i64::from(row.try_get::<_, i16>(0)?)),
        Type::INT4 => Value::Int(i64::from(row.try_get::<_, i32>(0)?)),
        Type::INT8 => Value::Int(row.try_get::<_, i64>(0)?),
        Type::FLOAT4 => Value::Float(f64::from(row.try_get::<_, f32>(0)?)),
        Type::FLOAT8 => Value::Float(row.try_get::<_, f64>(0)?),
        Type::BOOL => Value::Bool(row.try_get::<_, bool>(0)?),
        Type::DATE => Value::Date(row.try_get::<_, NaiveDate>(0)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            Value::Text(row.try_get::<_, String>(0)?)
        }
        ref other => bail!("unsupported lookup column type {}", other),
    };
    Ok(value)
}

/// Builds the catalog from the workload's `[[transaction]]` entries.
pub fn catalog(props: &Properties) -> Result<TransactionCatalog<PgConn>, ConfigError> {
    let mut builder = TransactionCatalog::builder();
    for txn in &props.transactions {
        check_probability(&format!("{}.rollback_probability", txn.name), txn.rollback_probability)?;
        if txn.statements.is_empty() {
            return Err(ConfigError::InvalidParam {
                name: txn.name.clone(),
                reason: "no statements".to_string(),
            });
        }
        let mut sql = SqlTransaction::new(&txn.statements, txn.rollback_probability);
        for (name, param) in &txn.params {
            sql = sql.with_param(name, param)?;
        }
        sql.check_placeholders(&txn.name)?;
        let sql: Arc<dyn Transaction<PgConn>> = Arc::new(sql);
        builder = builder.kind(txn.name.clone(), txn.weight, sql);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_become_positional() {
        let stmt = Statement::parse(
            "SELECT t_id FROM trade WHERE t_ca_id = :acct_id AND t_dts < :end ORDER BY t_dts",
        );
        assert_eq!(
            stmt.sql,
            "SELECT t_id FROM trade WHERE t_ca_id = $1 AND t_dts < $2 ORDER BY t_dts"
        );
        assert_eq!(stmt.params, vec!["acct_id", "end"]);
    }

    #[test]
    fn test_repeated_placeholder_reuses_position() {
        let stmt = Statement::parse("UPDATE holding SET h_qty = :qty WHERE h_qty > :qty AND h_s_symb = :symbol");
        assert_eq!(
            stmt.sql,
            "UPDATE holding SET h_qty = $1 WHERE h_qty > $1 AND h_s_symb = $2"
        );
        assert_eq!(stmt.params, vec!["qty", "symbol"]);
    }

    #[test]
    fn test_casts_and_literals_are_untouched() {
        let stmt = Statement::parse(
            "SELECT :price::numeric, ':not_a_param', now()::date FROM last_trade",
        );
        assert_eq!(
            stmt.sql,
            "SELECT $1::numeric, ':not_a_param', now()::date FROM last_trade"
        );
        assert_eq!(stmt.params, vec!["price"]);
    }

    #[test]
    fn test_bind_matches_declared_type() {
        assert!(bind("id", &Value::Int(7), &Type::INT4).is_ok());
        assert!(bind("id", &Value::Int(i64::MAX), &Type::INT4).is_err());
        assert!(bind("name", &Value::Text("NYSE".to_string()), &Type::VARCHAR).is_ok());
        assert!(bind("flag", &Value::Text("x".to_string()), &Type::BOOL).is_err());
        let date = NaiveDate::from_ymd_opt(1995, 3, 15).unwrap();
        assert!(bind("date", &Value::Date(date), &Type::DATE).is_ok());
        assert!(bind("date", &Value::Date(date), &Type::TEXT).is_err());
    }

    #[test]
    fn test_bind_lists_as_arrays() {
        let sizes = Value::List(vec![Value::Int(49), Value::Int(14), Value::Int(23)]);
        assert!(bind("sizes", &sizes, &Type::INT4_ARRAY).is_ok());
        assert!(bind("sizes", &sizes, &Type::INT8_ARRAY).is_ok());
        assert!(bind("sizes", &sizes, &Type::INT4).is_err());

        let codes = Value::List(vec![Value::Text("13".to_string()), Value::Text("31".to_string())]);
        assert!(bind("codes", &codes, &Type::TEXT_ARRAY).is_ok());
        assert!(bind("codes", &codes, &Type::INT4_ARRAY).is_err());

        let too_big = Value::List(vec![Value::Int(i64::MAX)]);
        assert!(bind("sizes", &too_big, &Type::INT4_ARRAY).is_err());
    }

    #[test]
    fn test_catalog_requires_declared_params() {
        let props: Properties = toml::from_str(
            r#"
[[transaction]]
name = "trade_status"
weight = 19.0
statements = ["SELECT * FROM trade WHERE t_ca_id = :acct_id"]
"#,
        )
        .unwrap();
        assert!(matches!(
            catalog(&props),
            Err(ConfigError::InvalidParam { ref name, .. }) if name == "acct_id"
        ));

        let props: Properties = toml::from_str(
            r#"
[[transaction]]
name = "trade_status"
weight = 19.0
statements = ["SELECT * FROM trade WHERE t_ca_id = :acct_id"]

[transaction.params]
acct_id = { type = "lookup", query = "SELECT ca_id FROM customer_account ORDER BY random() LIMIT 1" }
"#,
        )
        .unwrap();
        let catalog = catalog(&props).unwrap();
        assert_eq!(catalog.kinds()[0].name(), "trade_status");
    }

    #[test]
    fn test_catalog_requires_statements() {
        let props: Properties = toml::from_str(
            r#"
[[transaction]]
name = "market_watch"
weight = 18.0
"#,
        )
        .unwrap();
        assert!(catalog(&props).is_err());
    }

    #[test]
    fn test_bundled_workload() {
        let props: Properties = toml::from_str(include_str!("../workloads/tpce.toml")).unwrap();
        let catalog = catalog(&props).unwrap();
        assert_eq!(catalog.len(), 10);
        assert_eq!(props.isolation().unwrap(), IsolationLevel::Serializable);
        assert!(Postgres::new(&props).is_ok());
    }

    #[test]
    fn test_bundled_tpch_workload() {
        let props: Properties = toml::from_str(include_str!("../workloads/tpch.toml")).unwrap();
        let catalog = catalog(&props).unwrap();
        assert_eq!(catalog.len(), 22);
        assert_eq!(props.isolation().unwrap(), IsolationLevel::ReadCommitted);
        assert!(props.postgres.read_only);
        assert!(props.phased_config().is_ok());

        let q7 = &props.transactions[6];
        assert_eq!(q7.name, "Q7");
        let statement = Statement::parse(&q7.statements[0]);
        assert_eq!(statement.params, vec!["nations".to_string()]);
        assert!(statement.sql.contains("($1::text[])[2]"));

        let q22 = Statement::parse(&props.transactions[21].statements[0]);
        assert_eq!(q22.params, vec!["codes".to_string()]);
        assert_eq!(q22.sql.matches("ANY($1::text[])").count(), 2);
    }
}
