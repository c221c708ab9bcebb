use std::path::PathBuf;

use animica_p2p::peer::{OrderBy, Peer, PeerStatus, PeerStore, ScoreParams};
use animica_p2p::{Config, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "animica-p2p")]
#[command(about = "Animica P2P core - peer management CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value = "development")]
    profile: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the peer store and config for this node
    Init,

    /// List known peers, most recently seen first
    List {
        #[arg(long, default_value_t = 100)]
        limit: u32,

        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Add a peer by multiaddress (recorded as Dialing)
    Add {
        multiaddr: String,

        #[arg(long)]
        peer_id: Option<String>,
    },

    /// Mark a peer as Connected (simulates a completed handshake)
    Connect {
        peer_id: String,

        #[arg(long)]
        probe: bool,
    },

    /// Ban a peer
    Ban {
        peer_id: String,

        #[arg(long)]
        for_duration: Option<String>,
    },

    /// Remove a peer and its addresses permanently
    Forget { peer_id: String },

    /// Export known peers to a JSON file (offline curation format)
    Export { file: PathBuf },

    /// Import peers from a JSON seed file
    Import { file: PathBuf },

    /// Show peer-store summary
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeedEntry {
    peer_id: String,
    multiaddrs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeedFile {
    seeds: Vec<SeedEntry>,
}

fn now_s() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Parses durations like "1d2h3m4s" or a bare "90" (seconds), matching
/// the reference CLI's `parse_duration` helper.
fn parse_duration(expr: &str) -> Result<f64> {
    let expr = expr.trim();
    if let Ok(secs) = expr.parse::<f64>() {
        return Ok(secs);
    }
    let mut total = 0.0f64;
    let mut number = String::new();
    for c in expr.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let n: f64 = number.parse().map_err(|_| animica_p2p::P2pError::InvalidArgument(format!("bad duration: {expr}")))?;
            number.clear();
            let mult = match c {
                's' => 1.0,
                'm' => 60.0,
                'h' => 3600.0,
                'd' => 86400.0,
                'w' => 604_800.0,
                other => return Err(animica_p2p::P2pError::InvalidArgument(format!("bad duration unit: {other}"))),
            };
            total += n * mult;
        }
    }
    Ok(total)
}

fn open_store(data_dir: &Option<PathBuf>, profile: &str) -> Result<(Config, PeerStore)> {
    let mut cfg = match profile {
        "production" => Config::production(),
        "testnet" => Config::testnet(),
        _ => Config::development(),
    };
    if let Some(dir) = data_dir {
        cfg.node.data_dir = dir.clone();
    }
    cfg.apply_env_overrides();
    cfg.validate()?;
    let store = PeerStore::open(cfg.node.peer_store_path())?;
    Ok((cfg, store))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let (cfg, _store) = open_store(&cli.data_dir, &cli.profile)?;
            println!("✅ initialized peer store at {}", cfg.node.peer_store_path().display());
        }

        Commands::List { limit, min_score } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            let peers = store.list_known(limit, min_score, None, OrderBy::Score)?;
            println!("🔗 {} known peer(s):", peers.len());
            for p in peers {
                println!("  {} {} status={:?} address={}", p.peer_id, fmt_roles(&p), p.status, p.address);
            }
        }

        Commands::Add { multiaddr, peer_id } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            let id = peer_id.unwrap_or_else(|| multiaddr.clone());
            let mut peer = Peer::new(id.clone(), multiaddr.clone(), 0, now_s());
            let params = ScoreParams::default();
            store.upsert(&mut peer, now_s(), &params)?;
            println!("➕ added peer {id} at {multiaddr}");
        }

        Commands::Connect { peer_id, probe } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            store.record_connection(&peer_id, now_s())?;
            if probe {
                println!("📡 probed and connected {peer_id}");
            } else {
                println!("✅ marked {peer_id} connected");
            }
        }

        Commands::Ban { peer_id, for_duration } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            store.ban(&peer_id)?;
            if let Some(expr) = for_duration {
                let secs = parse_duration(&expr)?;
                println!("🚫 banned {peer_id} for {secs}s");
            } else {
                println!("🚫 banned {peer_id}");
            }
        }

        Commands::Forget { peer_id } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            store.forget(&peer_id)?;
            println!("🗑️  forgot {peer_id}");
        }

        Commands::Export { file } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            let peers = store.list_known(10_000, None, None, OrderBy::LastSeen)?;
            let seeds: Vec<SeedEntry> = peers
                .into_iter()
                .map(|p| SeedEntry { peer_id: p.peer_id, multiaddrs: vec![p.address] })
                .collect();
            let seed_file = SeedFile { seeds };
            std::fs::write(&file, serde_json::to_string_pretty(&seed_file)?)?;
            println!("📤 exported peer store to {}", file.display());
        }

        Commands::Import { file } => {
            let (_cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            let content = std::fs::read_to_string(&file)?;
            let seed_file: SeedFile = serde_json::from_str(&content)?;
            let params = ScoreParams::default();
            let mut count = 0;
            for seed in seed_file.seeds {
                for addr in &seed.multiaddrs {
                    let mut peer = Peer::new(seed.peer_id.clone(), addr.clone(), 0, now_s());
                    store.upsert(&mut peer, now_s(), &params)?;
                    count += 1;
                }
            }
            println!("📥 imported {count} address record(s) from {}", file.display());
        }

        Commands::Status => {
            let (cfg, store) = open_store(&cli.data_dir, &cli.profile)?;
            let connected = store.list_known(10_000, None, Some(&[PeerStatus::Connected]), OrderBy::LastSeen)?;
            let banned = store.list_known(10_000, None, Some(&[PeerStatus::Banned]), OrderBy::LastSeen)?;
            println!("📊 peer store: {}", cfg.node.peer_store_path().display());
            println!("   connected: {}", connected.len());
            println!("   banned:    {}", banned.len());
        }
    }

    Ok(())
}

fn fmt_roles(peer: &Peer) -> String {
    format!("roles={:#06x}", peer.roles.bits())
}
