//! orthos CLI
//!
//! Command-line interface for operators talking to the orthos daemon

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use orthos_api::events::FleetEvent;
use orthos_api::requests::ActionRequest;
use orthos_api::responses::{MachineResponse, TaskResponse};
use orthos_client::{HttpClient, WsClient};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orthos-cli")]
#[command(about = "Fleet orchestration CLI for orthos", long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    url: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Log client internals to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List machines
    Machines {
        #[arg(long)]
        arch: Option<String>,
        /// Effective status (unknown, reachable, unreachable, reserved, in_maintenance)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        reserved_by: Option<String>,
        /// Only unreserved machines outside maintenance
        #[arg(long)]
        free: bool,
        /// Substring of the fqdn
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 50)]
        per_page: u64,
    },
    /// Show one machine and its reservation history
    Machine { id: String },
    /// Queue an action against a machine
    Enqueue {
        machine: String,
        /// Requesting user
        #[arg(short, long)]
        user: String,
        #[command(subcommand)]
        action: ActionArg,
    },
    /// Show one task
    Task { id: Uuid },
    /// List tasks
    Tasks {
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        state: Option<String>,
    },
    /// Cancel a queued or running task
    Cancel { id: Uuid },
    /// Check an architecture/system pair
    Validate { architecture: String, system: String },
    /// Per-architecture fleet counts
    Stats,
    /// Follow live fleet events
    Watch {
        /// Only events for this machine
        #[arg(long)]
        machine: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
enum ActionArg {
    PowerOn,
    PowerOff,
    PowerCycle,
    ConsoleAttach,
    Provision {
        /// Install profile
        choice: String,
        /// Re-provision as this system class
        #[arg(long)]
        system: Option<String>,
    },
    Reserve {
        #[arg(long)]
        reason: String,
        /// RFC 3339 timestamp; omit for an unlimited reservation
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    Release,
    Rescan,
    Maintenance {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

impl From<ActionArg> for ActionRequest {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::PowerOn => ActionRequest::PowerOn,
            ActionArg::PowerOff => ActionRequest::PowerOff,
            ActionArg::PowerCycle => ActionRequest::PowerCycle,
            ActionArg::ConsoleAttach => ActionRequest::ConsoleAttach,
            ActionArg::Provision { choice, system } => ActionRequest::Provision { choice, system },
            ActionArg::Reserve { reason, until } => ActionRequest::Reserve { reason, until },
            ActionArg::Release => ActionRequest::Release,
            ActionArg::Rescan => ActionRequest::Rescan,
            ActionArg::Maintenance { enabled } => ActionRequest::Maintenance { enabled },
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_machines(machines: &[MachineResponse]) {
    println!(
        "{:<16} {:<32} {:<8} {:<18} {:<15} {}",
        "ID", "FQDN", "ARCH", "SYSTEM", "STATUS", "RESERVED BY"
    );
    for m in machines {
        let owner = m.reservation.as_ref().map_or("-", |r| r.owner.as_str());
        println!(
            "{:<16} {:<32} {:<8} {:<18} {:<15} {}",
            m.id, m.fqdn, m.architecture, m.system, m.effective_status, owner
        );
    }
}

fn print_tasks(tasks: &[TaskResponse]) {
    println!(
        "{:<36} {:<16} {:<16} {:<10} {:<4} {}",
        "ID", "MACHINE", "ACTION", "STATE", "TRY", "ERROR"
    );
    for t in tasks {
        println!(
            "{:<36} {:<16} {:<16} {:<10} {:<4} {}",
            t.id,
            t.machine_id,
            t.action,
            t.state,
            t.attempts,
            t.last_error.as_deref().unwrap_or("")
        );
    }
}

fn describe(event: &FleetEvent) -> String {
    match event {
        FleetEvent::TaskQueued {
            task_id,
            machine,
            action,
        } => format!("{machine}: task {task_id} queued ({action})"),
        FleetEvent::TaskStateChanged {
            task_id,
            machine,
            from,
            to,
            error,
        } => match error {
            Some(error) => format!("{machine}: task {task_id} {from} -> {to} ({error})"),
            None => format!("{machine}: task {task_id} {from} -> {to}"),
        },
        FleetEvent::MachineStatusChanged { machine, from, to } => {
            format!("{machine}: {from} -> {to}")
        }
        FleetEvent::ReservationChanged { machine, owner } => match owner {
            Some(owner) => format!("{machine}: reserved by {owner}"),
            None => format!("{machine}: released"),
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = HttpClient::new(&cli.url)?;
    tracing::debug!(url = %cli.url, "Using daemon");

    match cli.command {
        Commands::Machines {
            arch,
            status,
            reserved_by,
            free,
            query,
            page,
            per_page,
        } => {
            let mut request = client.list_machines().page(page).per_page(per_page);
            if let Some(arch) = arch {
                request = request.architecture(arch);
            }
            if let Some(status) = status {
                request = request.status(status);
            }
            if let Some(owner) = reserved_by {
                request = request.reserved_by(owner);
            }
            if free {
                request = request.free();
            }
            if let Some(query) = query {
                request = request.query(query);
            }
            let response = request.send().await?;
            if cli.json {
                print_json(&response)?;
            } else {
                print_machines(&response.data);
                let p = &response.pagination;
                println!(
                    "page {}/{} ({} machines)",
                    p.page, p.total_pages, p.total_items
                );
            }
        }
        Commands::Machine { id } => {
            let machine = client.get_machine(&id).await?;
            let history = client.reservation_history(&id).await?;
            if cli.json {
                print_json(&serde_json::json!({ "machine": machine, "history": history }))?;
            } else {
                print_machines(std::slice::from_ref(&machine));
                println!("remote power: {}", machine.has_remote_power);
                if let Some(detail) = &machine.last_probe_detail {
                    println!("last probe: {detail}");
                }
                if let Some(r) = &machine.reservation {
                    let until = r.until.map_or("unlimited".to_string(), |u| u.to_rfc3339());
                    println!("reservation: {} until {} ({})", r.owner, until, r.reason);
                }
                for record in &history {
                    println!(
                        "  {} {} -> {} ({})",
                        record.owner,
                        record.reserved_at.to_rfc3339(),
                        record.released_at.to_rfc3339(),
                        record.reason
                    );
                }
            }
        }
        Commands::Enqueue {
            machine,
            user,
            action,
        } => {
            let response = client.enqueue_task(&machine, action.into(), &user).await?;
            if cli.json {
                print_json(&response)?;
            } else {
                println!("{}", response.task_id);
            }
        }
        Commands::Task { id } => {
            let task = client.get_task(id).await?;
            if cli.json {
                print_json(&task)?;
            } else {
                print_tasks(std::slice::from_ref(&task));
            }
        }
        Commands::Tasks { machine, state } => {
            let tasks = client
                .list_tasks(machine.as_deref(), state.as_deref())
                .await?;
            if cli.json {
                print_json(&tasks)?;
            } else {
                print_tasks(&tasks);
            }
        }
        Commands::Cancel { id } => {
            let response = client.cancel_task(id).await?;
            if cli.json {
                print_json(&response)?;
            } else {
                println!("{}: {}", response.task_id, response.outcome);
            }
        }
        Commands::Validate {
            architecture,
            system,
        } => {
            let response = client.validate(&architecture, &system).await?;
            if cli.json {
                print_json(&response)?;
            } else if response.compatible {
                println!("{architecture} / {system}: compatible");
            } else {
                println!(
                    "{architecture} / {system}: not compatible (allowed: {})",
                    response.allowed.join(", ")
                );
                return Err(eyre!("incompatible configuration"));
            }
        }
        Commands::Stats => {
            let stats = client.statistics().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!(
                    "{:<10} {:>6} {:>6} {:>10} {:>10}",
                    "ARCH", "TOTAL", "FREE", "REACHABLE", "RESERVED"
                );
                for row in stats.per_architecture.iter().chain([&stats.total]) {
                    println!(
                        "{:<10} {:>6} {:>6} {:>10} {:>10}",
                        row.architecture, row.total, row.free, row.reachable, row.reserved_unlimited
                    );
                }
            }
        }
        Commands::Watch { machine } => {
            let url = client.ws_url("/ws/events")?;
            let mut events = WsClient::connect(url.as_str())?;
            while let Some(event) = events.recv().await {
                if machine.as_deref().is_some_and(|m| m != event.machine()) {
                    continue;
                }
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("{}", describe(&event));
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enqueue_reserve_parses() {
        let cli = Cli::try_parse_from([
            "orthos-cli",
            "enqueue",
            "lab-042",
            "--user",
            "alice",
            "reserve",
            "--reason",
            "kernel bisect",
            "--until",
            "2030-01-01T00:00:00Z",
        ])
        .unwrap();
        let Commands::Enqueue { machine, user, action } = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(machine, "lab-042");
        assert_eq!(user, "alice");
        let ActionRequest::Reserve { reason, until } = action.into() else {
            panic!("expected reserve");
        };
        assert_eq!(reason, "kernel bisect");
        assert!(until.is_some());
    }

    #[test]
    fn test_maintenance_flag_takes_value() {
        let cli = Cli::try_parse_from([
            "orthos-cli",
            "enqueue",
            "m1",
            "-u",
            "bob",
            "maintenance",
            "--enabled",
            "false",
        ])
        .unwrap();
        let Commands::Enqueue { action, .. } = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(
            ActionRequest::from(action),
            ActionRequest::Maintenance { enabled: false }
        );
    }

    #[test]
    fn test_describe_events() {
        let event = FleetEvent::ReservationChanged {
            machine: "m1".to_string(),
            owner: None,
        };
        assert_eq!(describe(&event), "m1: released");
        let event = FleetEvent::MachineStatusChanged {
            machine: "m1".to_string(),
            from: "unknown".to_string(),
            to: "reachable".to_string(),
        };
        assert_eq!(describe(&event), "m1: unknown -> reachable");
    }
}
