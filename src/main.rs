use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};

use zreplicate::bidir::{self, BidirManager};
use zreplicate::config::Config;
use zreplicate::dataset::Dataset;
use zreplicate::name::Lifetime;
use zreplicate::progress;
use zreplicate::replicator::{self, RunOptions};
use zreplicate::rpc::PeerConnection;
use zreplicate::services::ServiceRegistry;
use zreplicate::snapshot::{self, SnapshotTaskOptions};
use zreplicate::store::{self, LinkRole, LinkStore};
use zreplicate::transport::TransportOptions;
use zreplicate::zfs;

#[derive(Parser, Debug)]
#[command(name = "zreplicate", version, about = "ZFS snapshot lifecycle and replication engine")]
struct Cli {
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh snapshot for a dataset, then prune expired ones.
    Snapshot {
        dataset: String,
        #[arg(long)]
        recursive: bool,
        #[arg(long, default_value = "repl")]
        prefix: String,
        #[arg(long, default_value = "1y")]
        lifetime: String,
        #[arg(long)]
        replicable: bool,
    },
    /// Compute and print the action plan without executing it.
    Plan {
        localds: String,
        remoteds: String,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        followdelete: bool,
    },
    /// Snapshot, plan, and execute a single replication run against the
    /// configured peer.
    Run {
        localds: String,
        remoteds: String,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        followdelete: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Bi-directional link management.
    Bidir {
        #[command(subcommand)]
        action: BidirCommand,
    },
    /// Generate the process-wide replication key pair.
    Keygen {
        #[arg(long, default_value = "/etc/zreplicate/replication.key")]
        path: PathBuf,
    },
    /// Internal: serve one RPC call on stdout, invoked by a peer's
    /// `PeerConnection` over SSH. Not meant for interactive use.
    Rpc {
        method: String,
        args: String,
        #[arg(long)]
        progress: bool,
    },
}

#[derive(Subcommand, Debug)]
enum BidirCommand {
    Create {
        name: String,
        #[arg(long, num_args = 2)]
        partners: Vec<String>,
        #[arg(long)]
        volumes: Vec<String>,
    },
    Delete {
        name: String,
        #[arg(long)]
        scrub: bool,
    },
    Switch {
        name: String,
    },
    Sync {
        name: String,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Snapshot { dataset, recursive, prefix, lifetime, replicable } => {
            cmd_snapshot(dataset, recursive, prefix, lifetime, replicable).await
        }
        Command::Plan { localds, remoteds, recursive, followdelete } => {
            cmd_plan(localds, remoteds, recursive, followdelete).await
        }
        Command::Run { localds, remoteds, recursive, followdelete, dry_run } => {
            cmd_run(cli.config, localds, remoteds, recursive, followdelete, dry_run).await
        }
        Command::Bidir { action } => cmd_bidir(cli.config, action).await,
        Command::Keygen { path } => cmd_keygen(path).await,
        Command::Rpc { method, args, progress } => cmd_rpc(method, args, progress).await,
    }
}

async fn cmd_snapshot(
    dataset: String,
    recursive: bool,
    prefix: String,
    lifetime: String,
    replicable: bool,
) -> Result<()> {
    let lifetime = Lifetime::parse(&lifetime).map_err(|e| eyre!(e.to_string()))?;
    let outcome = snapshot::run(&SnapshotTaskOptions {
        dataset,
        recursive,
        lifetime,
        prefix,
        replicable,
    })
    .await
    .map_err(|e| eyre!(e.to_string()))?;

    println!("{}", outcome.created);
    if let Some(warning) = outcome.prune_warning {
        log::warn!("prune step reported a non-fatal warning: {warning}");
    }
    Ok(())
}

async fn cmd_plan(localds: String, remoteds: String, recursive: bool, followdelete: bool) -> Result<()> {
    let local_datasets = zfs::list_datasets(&localds, recursive)
        .await
        .wrap_err("listing local datasets")?;
    let remote_datasets = zfs::list_datasets(&remoteds, recursive)
        .await
        .unwrap_or_default();

    let opts = zreplicate::planner::PlanOptions {
        localds,
        remoteds,
        recursive,
        followdelete,
    };
    let plan = zreplicate::planner::build_plan(&opts, &local_datasets, &remote_datasets)
        .await
        .wrap_err("building plan")?;

    let json = serde_json::to_string_pretty(&plan_as_json(&plan))?;
    println!("{json}");
    Ok(())
}

fn plan_as_json(plan: &[zreplicate::planner::ReplicationAction]) -> serde_json::Value {
    use zreplicate::planner::ReplicationAction::*;
    serde_json::Value::Array(
        plan.iter()
            .map(|a| match a {
                SendStream { localfs, remotefs, incremental, anchor, snapshot, est_size } => {
                    serde_json::json!({
                        "action": "SEND_STREAM",
                        "localfs": localfs,
                        "remotefs": remotefs,
                        "incremental": incremental,
                        "anchor": anchor.as_ref().map(|a| a.to_string()),
                        "snapshot": snapshot.to_string(),
                        "est_size": est_size,
                    })
                }
                DeleteSnapshots { localfs, remotefs, snapshots } => serde_json::json!({
                    "action": "DELETE_SNAPSHOTS",
                    "localfs": localfs,
                    "remotefs": remotefs,
                    "snapshots": snapshots.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                }),
                DeleteDataset { localfs, remotefs } => serde_json::json!({
                    "action": "DELETE_DATASET",
                    "localfs": localfs,
                    "remotefs": remotefs,
                }),
            })
            .collect(),
    )
}

async fn cmd_run(
    config_path: Option<PathBuf>,
    localds: String,
    remoteds: String,
    recursive: bool,
    followdelete: bool,
    dry_run: bool,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let peer = PeerConnection::connect(&config.peer.remote, Some(&config.peer.remote_hostkey))
        .await
        .map_err(|e| eyre!(e.to_string()))?;

    let transport = TransportOptions {
        remote: config.peer.remote.clone(),
        remote_port: config.peer.remote_port.clone(),
        remote_hostkey: config.peer.remote_hostkey.clone(),
        remote_pool: remoteds.split('/').next().unwrap_or(&remoteds).to_string(),
        cipher: config.replication.cipher.into(),
        compression: config.replication.compression.into(),
        bandwidth_limit: config.bandwidth_limit_bytes().unwrap_or(0),
    };

    let (tx, mut rx) = progress::channel();
    let cancel = tokio_util::sync::CancellationToken::new();

    let run_opts = RunOptions {
        localds,
        remoteds,
        recursive,
        followdelete,
        dry_run,
        transport,
    };

    let progress_task = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            log::info!(
                "{:.0}% ({}/{}) {}",
                update.fraction_by_bytes() * 100.0,
                update.actions_done,
                update.actions_total,
                update.message
            );
        }
    });

    let outcome = replicator::run(&run_opts, &peer, tx, cancel)
        .await
        .map_err(|e| eyre!(e.to_string()));

    let _ = progress_task.await;
    peer.disconnect().await.map_err(|e| eyre!(e.to_string()))?;

    let outcome = outcome?;
    println!("{} actions planned", outcome.plan.len());
    Ok(())
}

async fn cmd_bidir(config_path: Option<PathBuf>, action: BidirCommand) -> Result<()> {
    let config = load_config(config_path).await?;
    let store = LinkStore::new(format!("{}/bidir-links.json", config.state_dir));
    let manager = BidirManager::new(store, local_node_identity());

    match action {
        BidirCommand::Create { name, partners, volumes } => {
            let partners: [String; 2] = partners
                .try_into()
                .map_err(|_| eyre!("--partners requires exactly two user@host values"))?;
            let peer = PeerConnection::connect(&config.peer.remote, Some(&config.peer.remote_hostkey))
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            let transport = bidir_transport(&config, &config.peer.remote);

            let result = manager.create(&name, partners, volumes, &peer, &transport).await;
            peer.disconnect().await.map_err(|e| eyre!(e.to_string()))?;
            let link = result.map_err(|e| eyre!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&link)?);
        }
        BidirCommand::Delete { name, scrub } => {
            manager.delete(&name, scrub).await.map_err(|e| eyre!(e.to_string()))?;
        }
        BidirCommand::Switch { name } => {
            let link = manager.switch(&name).await.map_err(|e| eyre!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&link)?);
        }
        BidirCommand::Sync { name } => {
            let peer = PeerConnection::connect(&config.peer.remote, Some(&config.peer.remote_hostkey))
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            let transport = bidir_transport(&config, &config.peer.remote);

            let result = manager.sync(&name, &peer, &transport).await;
            peer.disconnect().await.map_err(|e| eyre!(e.to_string()))?;
            result.map_err(|e| eyre!(e.to_string()))?;
        }
        BidirCommand::List => {
            let links = store::LinkStore::new(format!("{}/bidir-links.json", config.state_dir))
                .load()
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&links)?);
        }
    }
    Ok(())
}

async fn cmd_keygen(path: PathBuf) -> Result<()> {
    store::generate_keypair(&path).await.map_err(|e| eyre!(e.to_string()))?;
    let public = store::read_public_key(&path).await.map_err(|e| eyre!(e.to_string()))?;
    println!("{public}");
    Ok(())
}

/// Dispatch one RPC method by name, the same vocabulary `PeerConnection`
/// calls remotely as `zreplicate rpc <method> <json-args>`.
async fn cmd_rpc(method: String, args: String, _progress: bool) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(&args).wrap_err("parsing rpc args")?;
    let result: serde_json::Value = match method.as_str() {
        "dataset.list" => {
            let root: String = serde_json::from_value(value)?;
            let datasets: Vec<Dataset> = zfs::list_datasets(&root, true)
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            serde_json::to_value(datasets)?
        }
        "zfs.destroy_snapshots" => {
            let (dataset, names): (String, Vec<String>) = serde_json::from_value(value)?;
            zfs::destroy_snapshots(&dataset, &names)
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            serde_json::Value::Null
        }
        "zfs.destroy_dataset" => {
            let dataset: String = serde_json::from_value(value)?;
            zfs::destroy_dataset(&dataset, false)
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            serde_json::Value::Null
        }
        "bidir.get" => {
            let name: String = serde_json::from_value(value)?;
            let store = rpc_link_store();
            let link = store.get(&name).await.map_err(|e| eyre!(e.to_string()))?;
            serde_json::to_value(link)?
        }
        "dataset.exists" => {
            let dataset: String = serde_json::from_value(value)?;
            let exists = zfs::dataset_exists(&dataset).await.map_err(|e| eyre!(e.to_string()))?;
            serde_json::to_value(exists)?
        }
        "bidir.create_link" => {
            let link: zreplicate::store::BidirLink = serde_json::from_value(value)?;
            rpc_link_store().put(link).await.map_err(|e| eyre!(e.to_string()))?;
            serde_json::Value::Null
        }
        "bidir.set_state" => {
            let (volumes, new_role, touch_services): (Vec<String>, LinkRole, bool) =
                serde_json::from_value(value)?;
            bidir::apply_state(&volumes, new_role, touch_services, &ServiceRegistry::default())
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            serde_json::Value::Null
        }
        "bidir.service_exists" => {
            // No share/container backend ships with this binary; nothing
            // can collide yet.
            serde_json::to_value(false)?
        }
        other => return Err(eyre!("unknown rpc method: {other}")),
    };
    println!("{result}");
    Ok(())
}

async fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(|| PathBuf::from("/etc/zreplicate/config.toml"));
    Config::load(&path).await.wrap_err_with(|| format!("loading config from {}", path.display()))
}

fn local_node_identity() -> String {
    std::env::var("ZREPLICATE_NODE_IDENTITY").unwrap_or_else(|_| "local".to_string())
}

fn rpc_link_store() -> LinkStore {
    let state_dir = std::env::var("ZREPLICATE_STATE_DIR").unwrap_or_else(|_| "/var/lib/zreplicate".into());
    LinkStore::new(format!("{state_dir}/bidir-links.json"))
}

/// Transport for a bidir volume stream. `remote_pool` is overwritten per
/// volume by `BidirManager::replicate_volume`; what matters here is the
/// connection profile to `remote`.
fn bidir_transport(config: &Config, remote: &str) -> TransportOptions {
    TransportOptions {
        remote: remote.to_string(),
        remote_port: config.peer.remote_port.clone(),
        remote_hostkey: config.peer.remote_hostkey.clone(),
        remote_pool: String::new(),
        cipher: config.replication.cipher.into(),
        compression: config.replication.compression.into(),
        bandwidth_limit: config.bandwidth_limit_bytes().unwrap_or(0),
    }
}
