// bin/relay-cli.rs — operator CLI for repository-backed actions (spec §6).
//
// Grounded on `sschetterer-ergonia-perpl-dex-sdk`'s `bin/margin_topup/main.rs`:
// `dotenvy::dotenv()`, a `clap::Parser`-derived command struct, then a direct
// one-shot action against the stack's own state — no separate daemon/IPC
// round trip. `health`/`queue_status` are intentionally absent here: spec §6
// scopes those to the live process's in-memory stream/queue state, which this
// tool (a standalone process against the durable repository only) has no way
// to observe; they belong to the collaborator HTTP layer that talks to a
// running `relay` process.

use clap::{Parser, Subcommand};
use uuid::Uuid;

use copy_relay::config::RelayConfig;
use copy_relay::discovery::{empty_risk_settings, flatten_copy_filters, get_discovered_traders};
use copy_relay::model::{CopyFilters, Follower, PermissionlessFollower};
use copy_relay::repository::{Repository, SqliteRepository};

#[derive(Parser)]
#[command(name = "relay-cli", about = "Operator actions against the copy-relay repository")]
struct Cli {
    #[arg(long, env = "RELAY_SQLITE_PATH")]
    sqlite_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a follower subscription to a leader address.
    AddFollower {
        #[arg(long)]
        owner_user_id: String,
        #[arg(long)]
        leader_address: String,
        #[arg(long)]
        signing_wallet: String,
        #[arg(long)]
        copy_percentage: f64,
        #[arg(long)]
        max_position_size: f64,
        #[arg(long)]
        stop_loss_pct: Option<f64>,
        #[arg(long)]
        take_profit_pct: Option<f64>,
    },
    /// Deactivate an existing follower by id.
    RemoveFollower {
        #[arg(long)]
        id: Uuid,
    },
    /// Follow an address without its consent (spec §1 secondary subsystem).
    AddPermissionlessFollower {
        #[arg(long)]
        owner_user_id: String,
        #[arg(long)]
        target_address: String,
        #[arg(long)]
        signing_wallet: String,
        #[arg(long)]
        copy_percentage: f64,
        #[arg(long)]
        max_position_size: f64,
        #[arg(long)]
        min_trade_size: f64,
    },
    /// List active followers subscribed to a leader.
    ListFollowers {
        #[arg(long)]
        leader_address: String,
    },
    /// Print the top discovered traders by 7-day volume.
    DiscoveredTraders {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    let cli = Cli::parse();

    let sqlite_path = cli.sqlite_path.unwrap_or_else(|| RelayConfig::from_env().sqlite_path);
    let repo: std::sync::Arc<dyn Repository> = match SqliteRepository::connect(&sqlite_path).await {
        Ok(repo) => std::sync::Arc::new(repo),
        Err(e) => {
            eprintln!("failed to open repository at {}: {}", sqlite_path, e);
            std::process::exit(1);
        }
    };

    let result = run(repo, cli.command).await;
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(repo: std::sync::Arc<dyn Repository>, command: Command) -> Result<(), String> {
    match command {
        Command::AddFollower { owner_user_id, leader_address, signing_wallet, copy_percentage, max_position_size, stop_loss_pct, take_profit_pct } => {
            let now = chrono::Utc::now();
            let follower = Follower {
                id: Uuid::new_v4(),
                owner_user_id,
                leader_address,
                signing_wallet,
                copy_percentage,
                max_position_size,
                stop_loss_pct,
                take_profit_pct,
                is_active: true,
                risk_settings: empty_risk_settings(),
                created_at: now,
                updated_at: now,
            };
            follower.validate()?;
            repo.put_follower(&follower).await.map_err(|e| e.to_string())?;
            println!("added follower {} (leader={})", follower.id, follower.leader_address);
            Ok(())
        }
        Command::RemoveFollower { id } => {
            repo.delete_follower(id).await.map_err(|e| e.to_string())?;
            println!("removed follower {}", id);
            Ok(())
        }
        Command::AddPermissionlessFollower { owner_user_id, target_address, signing_wallet, copy_percentage, max_position_size, min_trade_size } => {
            let now = chrono::Utc::now();
            let follower = Follower {
                id: Uuid::new_v4(),
                owner_user_id,
                leader_address: target_address.clone(),
                signing_wallet,
                copy_percentage,
                max_position_size,
                stop_loss_pct: None,
                take_profit_pct: None,
                is_active: true,
                risk_settings: empty_risk_settings(),
                created_at: now,
                updated_at: now,
            };
            follower.validate()?;
            let pf = PermissionlessFollower {
                follower,
                asset_whitelist: Vec::new(),
                asset_blacklist: Vec::new(),
                min_trade_size,
                copy_filters: CopyFilters { auto_discovery: true, ..CopyFilters::default() },
            };
            let flattened = flatten_copy_filters(&pf);
            repo.put_follower(&flattened).await.map_err(|e| e.to_string())?;
            println!("added permissionless follow of {} as follower {}", target_address, flattened.id);
            Ok(())
        }
        Command::ListFollowers { leader_address } => {
            let followers = repo.list_followers_by_leader(&leader_address).await.map_err(|e| e.to_string())?;
            for f in followers {
                println!("{}\towner={}\twallet={}\tactive={}", f.id, f.owner_user_id, f.signing_wallet, f.is_active);
            }
            Ok(())
        }
        Command::DiscoveredTraders { limit } => {
            for trader in get_discovered_traders(&repo, limit).await {
                println!("{}\tvol7d={:.2}\twin_rate_7d={:.1}%", trader.address, trader.volume_7d_usd, trader.win_rate_7d_pct);
            }
            Ok(())
        }
    }
}
