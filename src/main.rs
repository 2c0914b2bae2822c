use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use lab_scheduler::config::LabConfig;
use lab_scheduler::inventory::{InventoryService, JobRecord, MemoryInventory, RetryingInventory};
use lab_scheduler::lease::{JobLease, LeaseStore};
use lab_scheduler::scheduler::SchedulerDriver;
use lab_scheduler::shard::ShardClient;
use lab_scheduler::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "lab-scheduler")]
#[command(version)]
#[command(about = "Scheduling and bookkeeping daemons for a test lab")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Keep this shard's view of hosts and jobs in sync with the master
    ShardClient {
        /// JSON fixture seeding the in-process inventory
        #[arg(long)]
        inventory: PathBuf,

        /// Send a single heartbeat and exit
        #[arg(long)]
        once: bool,
    },

    /// Fire timed suite events
    SuiteScheduler {
        /// JSON fixture seeding the in-process inventory
        #[arg(long)]
        inventory: PathBuf,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect and maintain job leases
    Lease {
        /// Override the configured lease directory
        #[arg(long)]
        lease_dir: Option<PathBuf>,

        #[command(subcommand)]
        command: LeaseCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum LeaseCommands {
    /// Create the lease file for a job
    Create { job_id: u64 },
    /// List leases nobody holds
    Expired,
    /// Delete every expired lease
    Reap,
}

#[derive(Serialize)]
struct ShardStateOutput {
    hosts: usize,
    jobs: usize,
    pending_uploads: usize,
}

#[derive(Serialize)]
struct ReapOutput {
    reaped: Vec<u64>,
}

fn load_config(path: Option<&PathBuf>) -> Result<LabConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(LabConfig::from_file(path)?),
        None => Ok(LabConfig::default()),
    }
}

async fn load_inventory(
    fixture: &PathBuf,
    config: &LabConfig,
) -> Result<(Arc<MemoryInventory>, Arc<dyn InventoryService>), Box<dyn std::error::Error>> {
    let memory = Arc::new(MemoryInventory::from_fixture(fixture).await?);
    let inventory: Arc<dyn InventoryService> =
        Arc::new(RetryingInventory::new(memory.clone(), config.rpc.clone()));
    Ok((memory, inventory))
}

async fn run_shard_client(
    config: &LabConfig,
    fixture: &PathBuf,
    once: bool,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, inventory) = load_inventory(fixture, config).await?;
    let shutdown = install_shutdown_handler();
    let client = ShardClient::new(inventory, config.shard.clone(), shutdown.token())?;

    if once {
        client.do_heartbeat().await?;
    } else {
        client.run().await?;
    }

    let state = client.state();
    let state = state.read().await;
    let summary = ShardStateOutput {
        hosts: state.hosts().count(),
        jobs: state.jobs().count(),
        pending_uploads: state.pending_uploads(),
    };
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("Hosts:           {}", summary.hosts);
            println!("Jobs:            {}", summary.jobs);
            println!("Pending uploads: {}", summary.pending_uploads);
        }
    }
    Ok(())
}

async fn run_suite_scheduler(
    config: &LabConfig,
    fixture: &PathBuf,
    once: bool,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (memory, inventory) = load_inventory(fixture, config).await?;
    let shutdown = install_shutdown_handler();
    let mut driver = SchedulerDriver::from_config(
        inventory,
        &config.scheduler,
        shutdown.token(),
        Local::now().naive_local(),
    )?;

    if once {
        driver.tick(Local::now().naive_local()).await;
    } else {
        driver.run().await?;
    }

    print_jobs(&memory.jobs().await, output)
}

fn print_jobs(jobs: &[JobRecord], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs scheduled.");
                return Ok(());
            }
            println!("{:<8} {:<10} {:<12} NAME", "ID", "STATUS", "BOARD");
            println!("{}", "-".repeat(60));
            for job in jobs {
                println!("{:<8} {:<10} {:<12} {}", job.id, job.status, job.board, job.name);
            }
        }
    }
    Ok(())
}

fn run_lease_command(
    config: &LabConfig,
    lease_dir: Option<PathBuf>,
    command: LeaseCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = LeaseStore::open(lease_dir.unwrap_or_else(|| config.lease.lease_dir.clone()))?;

    match command {
        LeaseCommands::Create { job_id } => {
            let path = store.create_lease(job_id)?;
            match output {
                OutputFormat::Json => {
                    let lease = JobLease { id: job_id, path };
                    println!("{}", serde_json::to_string_pretty(&lease)?);
                }
                OutputFormat::Table => println!("Created {}", path.display()),
            }
        }
        LeaseCommands::Expired => {
            let expired = store.scan_expired()?.collect::<Result<Vec<_>, _>>()?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&expired)?),
                OutputFormat::Table => {
                    if expired.is_empty() {
                        println!("No expired leases.");
                    }
                    for lease in &expired {
                        println!("{:<10} {}", lease.id, lease.path.display());
                    }
                }
            }
        }
        LeaseCommands::Reap => {
            let reaped = store.reap_expired()?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&ReapOutput { reaped })?)
                }
                OutputFormat::Table => println!("Reaped {} expired lease(s)", reaped.len()),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Commands::ShardClient { inventory, once } => {
            run_shard_client(&config, &inventory, once, &args.output).await?;
        }
        Commands::SuiteScheduler { inventory, once } => {
            run_suite_scheduler(&config, &inventory, once, &args.output).await?;
        }
        Commands::Lease { lease_dir, command } => {
            run_lease_command(&config, lease_dir, command, &args.output)?;
        }
    }

    Ok(())
}
