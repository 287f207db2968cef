use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::consts::{DEFAULT_CONTROLPLANE_IMAGE, DEFAULT_DATAPLANE_IMAGE};

/// Kong gateway operator: reconciles Gateways, DataPlanes and ControlPlanes.
#[derive(Parser, Debug, Clone)]
#[command(name = "manager", version, about, long_about = None)]
pub struct Config {
    /// Namespace the operator runs in. The cluster CA Secret lives here.
    #[arg(long, env = "POD_NAMESPACE", default_value = "kong-system")]
    pub namespace: String,

    /// Name of the Secret holding the CA that signs admin API and webhook certificates
    #[arg(long, env = "CLUSTER_CA_SECRET", default_value = "kong-operator-ca")]
    pub cluster_ca_secret: String,

    /// Proxy image used when a DataPlane pod template does not set one.
    /// Empty disables the default.
    #[arg(long, env = "DATAPLANE_IMAGE", default_value = DEFAULT_DATAPLANE_IMAGE)]
    pub dataplane_image: String,

    /// Ingress controller image used when a ControlPlane pod template does not set one.
    /// Empty disables the default.
    #[arg(long, env = "CONTROLPLANE_IMAGE", default_value = DEFAULT_CONTROLPLANE_IMAGE)]
    pub controlplane_image: String,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 4)]
    pub concurrency: u16,

    #[arg(long, default_value_t = 60)]
    pub resync_period_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_gateway_controller: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_dataplane_controller: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_controlplane_controller: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn default_dataplane_image(&self) -> Option<&str> {
        Some(self.dataplane_image.as_str()).filter(|image| !image.is_empty())
    }

    pub fn default_controlplane_image(&self) -> Option<&str> {
        Some(self.controlplane_image.as_str()).filter(|image| !image.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "kong-system".to_string(),
            cluster_ca_secret: "kong-operator-ca".to_string(),
            dataplane_image: DEFAULT_DATAPLANE_IMAGE.to_string(),
            controlplane_image: DEFAULT_CONTROLPLANE_IMAGE.to_string(),
            concurrency: 4,
            resync_period_secs: 60,
            reconcile_timeout_secs: 30,
            enable_gateway_controller: true,
            enable_dataplane_controller: true,
            enable_controlplane_controller: true,
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "manager",
            "--dataplane-image",
            "",
            "--enable-gateway-controller",
            "false",
            "--concurrency",
            "8",
        ])
        .unwrap();
        assert_eq!(config.default_dataplane_image(), None);
        assert!(!config.enable_gateway_controller);
        assert!(config.enable_dataplane_controller);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(30));
    }
}
