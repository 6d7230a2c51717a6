use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::raft::{
    NodeMeta, NodeSettings,
    forward::AddressMapping,
    runtime::{DEFAULT_SNAPSHOT_THRESHOLD, RaftSettings},
    types::NodeId,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fleetq",
    about = "Replicated device, resource and job registry",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the node (default).
    Run,

    /// Write a backup of the stopped node's store under --data-dir.
    Backup(BackupArgs),

    /// Replace the stopped node's store under --data-dir with a backup.
    Restore(RestoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[arg(long, value_name = "FILE")]
    pub input: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "FLEETQ_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: u64,

    #[arg(
        long,
        global = true,
        env = "FLEETQ_NODE_NAME",
        value_name = "NAME",
        default_value = "node-1"
    )]
    pub node_name: String,

    #[arg(
        long,
        global = true,
        env = "FLEETQ_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8000"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "FLEETQ_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:8000"
    )]
    pub api_base_url: String,

    /// Serve raft RPCs on a separate listener instead of the API listener.
    #[arg(long, global = true, env = "FLEETQ_RAFT_BIND", value_name = "ADDR")]
    pub raft_bind: Option<SocketAddr>,

    /// Advertised raft RPC origin; defaults to --api-base-url.
    #[arg(long, global = true, env = "FLEETQ_RAFT_BASE_URL", value_name = "ORIGIN")]
    pub raft_base_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "FLEETQ_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Keep raft metadata and snapshots in memory only.
    #[arg(
        long = "in-memory",
        global = true,
        env = "FLEETQ_IN_MEMORY",
        value_name = "BOOL",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub in_memory: bool,

    /// Initialize a new single-node cluster if this node has no raft state yet.
    #[arg(
        long,
        global = true,
        env = "FLEETQ_BOOTSTRAP",
        value_name = "BOOL",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub bootstrap: bool,

    /// API origin of any cluster member to join through.
    #[arg(long, global = true, env = "FLEETQ_JOIN", value_name = "ORIGIN")]
    pub join: Option<String>,

    #[arg(
        long = "apply-timeout-secs",
        global = true,
        env = "FLEETQ_APPLY_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub apply_timeout_secs: u64,

    #[arg(
        long = "forward-timeout-secs",
        global = true,
        env = "FLEETQ_FORWARD_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub forward_timeout_secs: u64,

    /// Derive a peer's API port from its raft port when it advertises no API origin.
    #[arg(
        long = "api-port-offset",
        global = true,
        env = "FLEETQ_API_PORT_OFFSET",
        value_name = "N",
        allow_negative_numbers = true
    )]
    pub api_port_offset: Option<i32>,

    #[arg(
        long = "snapshot-threshold",
        global = true,
        env = "FLEETQ_SNAPSHOT_THRESHOLD",
        value_name = "ENTRIES",
        default_value_t = DEFAULT_SNAPSHOT_THRESHOLD,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_threshold: u64,
}

impl Config {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft_endpoint(&self) -> String {
        self.raft_base_url
            .clone()
            .unwrap_or_else(|| self.api_base_url.clone())
    }

    pub fn node_meta(&self) -> NodeMeta {
        NodeMeta {
            name: self.node_name.clone(),
            api_base_url: self.api_base_url.clone(),
            raft_endpoint: self.raft_endpoint(),
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            apply_timeout: Duration::from_secs(self.apply_timeout_secs),
            forward_timeout: Duration::from_secs(self.forward_timeout_secs),
            address_mapping: AddressMapping {
                port_offset: self.api_port_offset,
            },
        }
    }

    pub fn raft_settings(&self) -> RaftSettings {
        RaftSettings {
            snapshot_threshold: self.snapshot_threshold,
            ..RaftSettings::default()
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["fleetq"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.node_id, 1);
        assert_eq!(cli.config.apply_timeout_secs, 5);
        assert_eq!(cli.config.forward_timeout_secs, 5);
        assert_eq!(cli.config.snapshot_threshold, 1024);
        assert!(!cli.config.in_memory);
        assert!(!cli.config.bootstrap);
        assert_eq!(cli.config.api_port_offset, None);
        assert_eq!(cli.config.raft_endpoint(), "http://127.0.0.1:8000");

        let settings = cli.config.node_settings();
        assert_eq!(settings.apply_timeout, Duration::from_secs(5));
        assert_eq!(settings.address_mapping, AddressMapping::default());
    }

    #[test]
    fn rejects_invalid_apply_timeout_secs() {
        let err = Cli::try_parse_from(["fleetq", "--apply-timeout-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--apply-timeout-secs"));
        assert!(msg.contains("1..=60"));
    }

    #[test]
    fn rejects_invalid_forward_timeout_secs() {
        let err = Cli::try_parse_from(["fleetq", "--forward-timeout-secs", "61"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--forward-timeout-secs"));
        assert!(msg.contains("1..=60"));
    }

    #[test]
    fn rejects_node_id_zero() {
        assert!(Cli::try_parse_from(["fleetq", "--node-id", "0"]).is_err());
    }

    #[test]
    fn bare_bool_flags_enable_and_negative_offset_parses() {
        let cli = Cli::try_parse_from([
            "fleetq",
            "--bootstrap",
            "--in-memory",
            "--api-port-offset",
            "-1000",
            "--raft-base-url",
            "http://10.0.0.2:7000",
        ])
        .unwrap();
        assert!(cli.config.bootstrap);
        assert!(cli.config.in_memory);
        assert_eq!(cli.config.api_port_offset, Some(-1000));
        assert_eq!(cli.config.node_meta().raft_endpoint, "http://10.0.0.2:7000");

        let cli = Cli::try_parse_from(["fleetq", "--bootstrap", "false"]).unwrap();
        assert!(!cli.config.bootstrap);
    }

    #[test]
    fn parses_backup_and_restore_subcommands() {
        let cli = Cli::try_parse_from(["fleetq", "backup", "--out", "/tmp/b.json"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Backup(BackupArgs { ref out })) if out == &PathBuf::from("/tmp/b.json")));

        let cli = Cli::try_parse_from([
            "fleetq",
            "restore",
            "--input",
            "/tmp/b.json",
            "--data-dir",
            "/var/lib/fleetq",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Restore(_))));
        assert_eq!(cli.config.store_dir(), PathBuf::from("/var/lib/fleetq/store"));
    }
}
