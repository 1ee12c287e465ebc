//! rmsq CLI: operator interface to the request queue.

use clap::{Parser, Subcommand};
use rmsq::agent::{AgentConfig, HandlerRegistry, RequestAgent};
use rmsq::config::Config;
use rmsq::model::{NamesFilter, OperationId, Request, RequestId, RequestRef, RequestStatus};
use rmsq::queue::{RequestQueue, open_queue};
use rmsq::telemetry::{NoopMonitor, OtelMonitor, QueueMonitor, TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rmsq", about = "Request queue for multi-step data-management operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue or update a request from a JSON file
    Put {
        /// Request tree as JSON
        file: PathBuf,
    },
    /// Show a request tree without claiming it
    Show { name: String },
    /// Claim a request by name, or any eligible one
    Claim {
        name: Option<String>,
        /// Claim the request owning this scheduled operation instead
        #[arg(long, conflicts_with = "name")]
        operation: Option<i64>,
    },
    /// Cancel a request
    Cancel { name: String },
    /// Delete a request with all its operations and files
    Delete { name: String },
    /// Print the status of a request
    Status { name: String },
    /// Print the status of files within a request
    Files {
        name: String,
        #[arg(required = true)]
        lfns: Vec<String>,
        /// Treat the first argument as a RequestID
        #[arg(long)]
        id: bool,
    },
    /// Print the flat info row of a request
    Info {
        name: String,
        /// Treat the argument as a RequestID
        #[arg(long)]
        id: bool,
    },
    /// Look up requests by job id
    Jobs {
        #[arg(required = true)]
        jobs: Vec<i64>,
        /// Print full request trees instead of names
        #[arg(long)]
        full: bool,
    },
    /// List request names by status
    Names {
        /// Statuses to include (default: Done, Failed, Canceled)
        #[arg(long = "status")]
        statuses: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Status histograms for requests, operations and files
    Summary,
    /// Human-readable rendering of a request
    Digest { name: String },
    /// Run the agent loop
    Serve {
        /// Stop before the next cycle once this file exists
        #[arg(long)]
        stop_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let command = match cli.command {
        Command::Serve { stop_file } => return cmd_serve(config, stop_file).await,
        command => command,
    };

    let queue = open_queue(&config, Arc::new(NoopMonitor)).await?;
    let queue = queue.as_ref();

    match command {
        Command::Put { file } => cmd_put(queue, file).await,
        Command::Show { name } => print_json(&queue.peek_request(&name).await?),
        Command::Claim { name, operation } => cmd_claim(queue, name, operation).await,
        Command::Cancel { name } => {
            let id = queue.cancel_request(&name).await?;
            println!("Canceled: {name} (RequestID={id})");
            Ok(())
        }
        Command::Delete { name } => {
            queue.delete_request(&name).await?;
            println!("Deleted: {name}");
            Ok(())
        }
        Command::Status { name } => {
            println!("{}", queue.get_request_status(&name).await?);
            Ok(())
        }
        Command::Files { name, lfns, id } => {
            let request = request_ref(name, id)?;
            for (lfn, status) in queue.get_request_file_status(&request, &lfns).await? {
                let status = status.map_or("Unknown", |s| s.as_str());
                println!("{status:<10}  {lfn}");
            }
            Ok(())
        }
        Command::Info { name, id } => cmd_info(queue, name, id).await,
        Command::Jobs { jobs, full } => {
            if full {
                print_json(&queue.read_requests_for_jobs(&jobs).await?)
            } else {
                print_json(&queue.get_request_names_for_jobs(&jobs).await?)
            }
        }
        Command::Names { statuses, limit } => cmd_names(queue, statuses, limit).await,
        Command::Summary => print_json(&queue.get_db_summary().await?),
        Command::Digest { name } => {
            print!("{}", queue.get_digest(&name).await?);
            Ok(())
        }
        Command::Serve { .. } => unreachable!("handled above"),
    }
}

async fn cmd_serve(config: Config, stop_file: Option<PathBuf>) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "rmsq".to_string(),
        log_level: Some(config.log_level.clone()),
    })?;

    let monitor: Arc<dyn QueueMonitor> = Arc::new(OtelMonitor::new());
    let queue = open_queue(&config, Arc::clone(&monitor)).await?;

    let agent_config = AgentConfig {
        stop_file,
        ..AgentConfig::from_config(&config)
    };
    let registry = HandlerRegistry::empty();
    if registry.is_empty() {
        tracing::warn!("no operation handlers registered, claimed requests will fail");
    }
    let agent = RequestAgent::new(queue, registry, monitor, agent_config);

    let ctrl = agent.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    let cycles = agent.run().await?;
    guard.force_flush();
    println!("{cycles} cycle(s) executed");
    Ok(())
}

async fn cmd_put(queue: &dyn RequestQueue, file: PathBuf) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(&file)?;
    let mut request: Request = serde_json::from_str(&json)?;
    request.sequence_new_operations();
    let id = queue.put_request(&mut request).await?;
    println!("Stored: {} (RequestID={id})", request.name);
    Ok(())
}

async fn cmd_claim(
    queue: &dyn RequestQueue,
    name: Option<String>,
    operation: Option<i64>,
) -> anyhow::Result<()> {
    let claimed = match (name, operation) {
        (Some(name), _) => Some(queue.get_request(&name).await?),
        (None, Some(op)) => queue.get_scheduled_request(OperationId(op)).await?,
        (None, None) => queue.claim_next().await?,
    };
    match claimed {
        Some(request) => print_json(&request),
        None => {
            println!("No eligible request.");
            Ok(())
        }
    }
}

fn request_ref(name: String, by_id: bool) -> anyhow::Result<RequestRef> {
    if by_id {
        Ok(RequestRef::Id(RequestId(name.parse()?)))
    } else {
        Ok(RequestRef::Name(name))
    }
}

async fn cmd_info(queue: &dyn RequestQueue, name: String, by_id: bool) -> anyhow::Result<()> {
    let info = queue.get_request_info(&request_ref(name, by_id)?).await?;

    println!("RequestID:   {}", info.request_id);
    println!("Name:        {}", info.name);
    println!("Status:      {}", info.status);
    println!(
        "JobID:       {}",
        info.job_id.map_or_else(|| "-".to_string(), |j| j.to_string())
    );
    println!("Owner:       {}", info.owner_dn.as_deref().unwrap_or("-"));
    println!("Group:       {}", info.owner_group.as_deref().unwrap_or("-"));
    println!("Setup:       {}", info.setup.as_deref().unwrap_or("-"));
    println!(
        "Source:      {}",
        info.source_component.as_deref().unwrap_or("-")
    );
    println!("Created:     {}", info.creation_time);
    println!("Submitted:   {}", info.submit_time);
    println!("Updated:     {}", info.last_update);
    Ok(())
}

async fn cmd_names(
    queue: &dyn RequestQueue,
    statuses: Vec<String>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let statuses = statuses
        .iter()
        .map(|s| s.parse::<RequestStatus>())
        .collect::<Result<Vec<_>, _>>()?;
    let filter = NamesFilter {
        statuses,
        limit,
        ..NamesFilter::default()
    };

    let names = queue.get_request_names(&filter).await?;
    if names.is_empty() {
        println!("No requests found.");
        return Ok(());
    }
    for name in &names {
        println!("{name}");
    }
    println!("\n{} request(s)", names.len());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
