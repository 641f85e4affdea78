//! LVM Node Operator - per-node reconcile job
//!
//! A single-shot process scheduled by the cluster-level controller: read the
//! desired device classes for this node, converge the node's LVM state, and
//! atomically replace the per-node status/config ConfigMap. A fatal error
//! (inventory or persistence) exits non-zero with no document written; the
//! next scheduled run re-derives truth from live inventory.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube::Api;
use lvm_node_operator::{
    AgentConfig, ConfigMapStore, HostExecutor, LvmCluster, ReconcileEngine, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LVM Node Operator - per-node volume group reconciliation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this job reconciles
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace holding the LvmCluster resource and the status ConfigMap
    #[arg(long, env = "NAMESPACE", default_value = "lvm-system")]
    namespace: String,

    /// Name of the LvmCluster resource
    #[arg(long, env = "CLUSTER_NAME", default_value = "lvmcluster")]
    cluster_name: String,

    /// Unix socket path written into the generated lvmd configuration
    #[arg(long, env = "LVMD_SOCKET", default_value = "/run/lvmd/lvmd.sock")]
    lvmd_socket: String,

    /// Directory for auto-provisioned loop backing files
    #[arg(long, env = "LOOP_DIR", default_value = "/var/lib/lvm-node-operator/loop")]
    loop_dir: PathBuf,

    /// PID whose namespaces host commands are entered into
    #[arg(long, env = "HOST_PID", default_value = "1")]
    host_pid: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            node_name: self.node_name,
            namespace: self.namespace,
            cluster_name: self.cluster_name,
            lvmd_socket: self.lvmd_socket,
            loop_dir: self.loop_dir,
            host_pid: self.host_pid,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting LVM node operator reconcile job");
    info!("  Version: {}", lvm_node_operator::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Namespace: {}", args.namespace);

    let config = args.into_config();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&config).await {
        Ok(()) => {
            info!("Reconcile pass complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Reconcile pass failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &AgentConfig) -> Result<()> {
    let client = kube::Client::try_default().await?;

    // Desired state: the device classes addressed to this node.
    let clusters: Api<LvmCluster> = Api::namespaced(client.clone(), &config.namespace);
    let cluster = clusters.get(&config.cluster_name).await?;
    let desired = cluster.device_classes_for(&config.node_name);
    info!("Desired device classes for node: {}", desired.len());

    // Prior outcome: the persisted status document, if any.
    let store = ConfigMapStore::new(client, config);
    let prior = store.load().await?;

    // Converge. The engine blocks on external commands, so it runs off the
    // async executor.
    let executor = Arc::new(HostExecutor::new(config));
    let engine = ReconcileEngine::new(executor, config);
    let outcome = tokio::task::block_in_place(|| engine.reconcile(&desired, &prior))?;

    // Persist status + lvmd config as one document update.
    store.store(&outcome.state, &outcome.lvmd).await?;

    info!(
        "Node phase {}: {} ready classes, {} failing",
        outcome.state.phase,
        outcome.state.success_classes.len(),
        outcome.state.fail_classes.len()
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
