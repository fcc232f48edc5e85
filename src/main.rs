use crate::db::{Backend, DB};
use crate::load::LoadGenerator;
use crate::phased::PhasedBenchmark;
use crate::postgres::Postgres;
use crate::simulated::Simulated;
use crate::workload::TransactionCatalog;
use anyhow::{bail, Result};
use log::info;
use properties::Properties;
use std::fs;
use std::sync::Arc;
use structopt::StructOpt;

pub mod db;
pub mod error;
pub mod generator;
pub mod load;
pub mod metrics;
pub mod phased;
pub mod postgres;
pub mod properties;
pub mod runner;
pub mod simulated;
pub mod workload;

#[derive(StructOpt, Debug)]
#[structopt(name = "txbench")]
struct Opt {
    /// `run` for a timed closed-loop run, `phased` for power and throughput phases
    #[structopt(name = "COMMAND")]
    command: String,
    #[structopt(short, long)]
    workload: String,
    /// Overrides `database` from the workload file
    #[structopt(short, long)]
    database: Option<String>,
    /// Overrides `concurrency` (streams in the throughput phase)
    #[structopt(short, long)]
    threads: Option<usize>,
    /// Overrides `duration_secs`
    #[structopt(long)]
    duration: Option<u64>,
    #[structopt(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let opt = Opt::from_args();

    let raw_props = fs::read_to_string(&opt.workload)?;

    let mut props: Properties = toml::from_str(&raw_props)?;
    if let Some(database) = opt.database {
        props.database = database;
    }
    if let Some(threads) = opt.threads {
        props.concurrency = threads;
    }
    if let Some(duration) = opt.duration {
        props.duration_secs = duration;
    }
    if opt.seed.is_some() {
        props.seed = opt.seed;
    }

    match props.database.parse::<Backend>()? {
        Backend::Postgres => {
            let db = Postgres::new(&props)?;
            let catalog = postgres::catalog(&props)?;
            run_with(db, catalog, &props, &opt.command).await
        }
        Backend::Simulated => {
            let db = Simulated::new(&props.simulated)?;
            let catalog = simulated::catalog(&props)?;
            run_with(db, catalog, &props, &opt.command).await
        }
    }
}

async fn run_with<D: DB>(
    db: D,
    catalog: TransactionCatalog<D::Conn>,
    props: &Properties,
    command: &str,
) -> Result<()> {
    let db = Arc::new(db);
    let catalog = Arc::new(catalog);
    let isolation = props.isolation()?;
    info!("{} kinds on {} at {}", catalog.len(), props.database, isolation);
    match command {
        "run" => {
            let generator = LoadGenerator::new(db, catalog, props.load_config()?)?;
            let report = generator.run().await;
            println!("[OVERALL], IsolationLevel, {}", isolation);
            print!("{}", report);
        }
        "phased" => {
            let mut benchmark = PhasedBenchmark::new(db, catalog, props.phased_config()?)?;
            let report = benchmark.run().await?;
            println!("[POWER], IsolationLevel, {}", isolation);
            print!("{}", report);
        }
        cmd => bail!("invalid command: {}", cmd),
    }
    Ok(())
}
