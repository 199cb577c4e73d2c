use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// skiff edge-device agent: reconciles the local container runtime and
/// sensor adapters against cloud-declared target state.
#[derive(Debug, Clone, Parser)]
#[command(name = "skiffd", version, about)]
pub struct Cli {
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/skiff")]
    pub data_dir: PathBuf,

    /// Cloud base URL used for provisioning; after registration the
    /// identity's granted endpoint wins.
    #[arg(long, env = "CLOUD_API_ENDPOINT")]
    pub cloud_api_endpoint: Option<String>,

    /// Refuse to run unprovisioned: provision on boot or exit.
    #[arg(long, env = "REQUIRE_PROVISIONING", default_value_t = false, action = clap::ArgAction::Set)]
    pub require_provisioning: bool,

    #[arg(long, env = "PROVISIONING_SECRET", hide_env_values = true)]
    pub provisioning_secret: Option<String>,

    #[arg(long, env = "DEVICE_NAME", default_value = "skiff-device")]
    pub device_name: String,

    #[arg(long, env = "DEVICE_TYPE", default_value = "generic-x86_64")]
    pub device_type: String,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 60_000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "REPORT_INTERVAL_MS", default_value_t = 10_000)]
    pub report_interval_ms: u64,

    #[arg(long, env = "RECONCILIATION_INTERVAL_MS", default_value_t = 30_000)]
    pub reconciliation_interval_ms: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Gzip the remote log upload body.
    #[arg(long, env = "LOG_COMPRESSION", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_compression: bool,

    #[arg(long, env = "DEVICE_API_PORT", default_value_t = 48484)]
    pub device_api_port: u16,

    /// Loopback by default; widen deliberately.
    #[arg(long, env = "DEVICE_API_BIND", default_value = "127.0.0.1")]
    pub device_api_bind: IpAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let cli = Cli::try_parse_from(["skiffd"]).unwrap();
        assert_eq!(cli.poll_interval_ms, 60_000);
        assert_eq!(cli.report_interval_ms, 10_000);
        assert_eq!(cli.reconciliation_interval_ms, 30_000);
        assert_eq!(cli.device_api_port, 48484);
        assert!(!cli.require_provisioning);
        assert!(cli.log_compression);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "skiffd",
            "--data-dir",
            "/tmp/skiff",
            "--require-provisioning",
            "true",
            "--device-api-port",
            "9000",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/skiff"));
        assert!(cli.require_provisioning);
        assert_eq!(cli.device_api_port, 9000);
    }
}
