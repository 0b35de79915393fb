// Udhiya Ledger - command line
// Operator commands over the same database the API server uses

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use udhiya_ledger::entities::cow_group::list_cow_groups;
use udhiya_ledger::entities::donation::dashboard_counts;
use udhiya_ledger::{assign_donations_to_agent, split_pending, Config, Database};

#[derive(Parser)]
#[command(name = "udhiya-ledger", version, about = "Udhiya donation ledger")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema if it does not exist yet
    Init,

    /// Create one agent per name and split the pending donations between them
    Split {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Hand specific donations to an existing agent
    Assign {
        #[arg(long)]
        agent: i64,

        #[arg(required = true)]
        donation_ids: Vec<i64>,
    },

    /// Show pending workload counts
    Counts,

    /// List cow groups with their share counts
    Groups,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = cli.config;
    let db = Database::open(&config)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;

    match cli.command {
        Command::Init => {
            println!("✓ Database ready at {}", config.database_path.display());
        }
        Command::Split { names } => {
            let outcome = split_pending(&db, &names)?;
            println!(
                "✓ Split {} sheep and {} cow groups between {} agents",
                outcome.sheep_count,
                outcome.cow_groups_count,
                outcome.agents.len()
            );
            for (agent, allocation) in outcome.agents.iter().zip(&outcome.allocations) {
                println!(
                    "  #{:<4} {:<20} {:>3} sheep  {:>3} cow groups  {:>4} donations",
                    agent.id,
                    agent.agent_name,
                    allocation.sheep_donation_ids.len(),
                    allocation.cow_group_ids.len(),
                    allocation.donation_count
                );
            }
        }
        Command::Assign {
            agent,
            donation_ids,
        } => {
            let pairs = assign_donations_to_agent(&db, agent, &donation_ids)?;
            println!("✓ Assigned {} donations to agent #{}", pairs.len(), agent);
        }
        Command::Counts => {
            let counts = db.read(dashboard_counts)?;
            println!("Pending sheep:        {}", counts.pending_sheep_count);
            println!("Pending cow shares:   {}", counts.pending_cow_shares_count);
            println!("Pending cow groups:   {}", counts.pending_cow_groups);
            println!("Remaining cow shares: {}", counts.remaining_cow_shares);
            println!("Pending value:        {:.2}", counts.total_value);
        }
        Command::Groups => {
            let groups = db.read(list_cow_groups)?;
            if groups.is_empty() {
                println!("No cow groups yet");
            }
            for group in groups {
                let state = if group.is_complete() { "complete" } else { "open" };
                println!(
                    "  group #{:<4} {}/{}  {:<8} created {}",
                    group.id,
                    group.share_count,
                    udhiya_ledger::COW_GROUP_CAPACITY,
                    state,
                    group.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    Ok(())
}
