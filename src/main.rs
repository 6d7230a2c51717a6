use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use fleetq::{
    config::{Cli, Command, Config},
    kv::KvStore,
    raft::{
        FleetNode,
        app::RaftFacade,
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        network_http::HttpNetworkFactory,
        runtime::start_raft,
    },
    state::FleetStateMachine,
};

const JOIN_ATTEMPTS: u32 = 30;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Backup(args) => {
            let kv = KvStore::open_dir(cli.config.store_dir()).await?;
            let file = tokio::fs::File::create(&args.out)
                .await
                .with_context(|| format!("create {}", args.out.display()))?;
            kv.backup(file).await?;
            info!(out = %args.out.display(), "backup written");
            Ok(())
        }
        Command::Restore(args) => {
            let kv = KvStore::open_dir(cli.config.store_dir()).await?;
            let file = tokio::fs::File::open(&args.input)
                .await
                .with_context(|| format!("open {}", args.input.display()))?;
            kv.restore(file).await?;
            info!(input = %args.input.display(), "store restored");
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let node_id = config.node_id();
    let node_meta = config.node_meta();

    let kv = if config.in_memory {
        KvStore::in_memory()
    } else {
        KvStore::open_dir(config.store_dir()).await?
    };
    let durable = kv.is_durable().await;
    if !durable {
        warn!("in-memory store: raft state is lost on restart");
    }
    let kv = Arc::new(kv);
    let fsm = Arc::new(FleetStateMachine::new());

    let raft = start_raft(
        node_id,
        kv,
        fsm.clone(),
        HttpNetworkFactory::try_new()?,
        config.raft_settings(),
    )
    .await?;

    if config.bootstrap {
        raft.initialize_single_node_if_needed(node_id, node_meta.clone())
            .await?;
    }

    let raft_facade: Arc<dyn RaftFacade> = Arc::new(raft.clone());
    let node = Arc::new(FleetNode::new(
        node_id,
        raft_facade,
        fsm,
        config.node_settings(),
    )?);

    let raft_listener = match config.raft_bind {
        Some(addr) => Some(
            tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind raft listener {addr}"))?,
        ),
        None => None,
    };
    let embedded_rpc = raft_listener.is_none().then(|| raft.raft());

    let app = fleetq::http::build_router(node.clone(), embedded_rpc)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    if let Some(listener) = raft_listener {
        let rpc = build_raft_rpc_router(RaftRpcState { raft: raft.raft() });
        info!(raft_bind = ?config.raft_bind, "serving raft rpc on a separate listener");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, rpc).await {
                warn!(%err, "raft rpc listener stopped");
            }
        });
    }

    if let Some(seed) = config.join.clone() {
        let node = node.clone();
        let meta = node_meta.clone();
        tokio::spawn(async move { join_with_retry(node, seed, meta).await });
    }

    info!(
        node_id,
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        durable,
        version = fleetq::version::VERSION,
        "starting fleetq"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    raft.shutdown().await?;
    Ok(())
}

async fn join_with_retry(node: Arc<FleetNode>, seed: String, meta: fleetq::raft::NodeMeta) {
    let node_id = node.node_id();
    let already_member = node
        .raft()
        .metrics()
        .borrow()
        .membership_config
        .nodes()
        .any(|(id, _)| *id == node_id);
    if already_member {
        info!(node_id, "already a cluster member; skipping join");
        return;
    }

    for attempt in 1..=JOIN_ATTEMPTS {
        match node.join_via(&seed, meta.clone()).await {
            Ok(()) => {
                info!(node_id, %seed, "joined cluster");
                return;
            }
            Err(err) => {
                warn!(node_id, %seed, attempt, %err, "join failed");
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
        }
    }
    warn!(node_id, %seed, "giving up on join after {JOIN_ATTEMPTS} attempts");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
