//! Exporter configuration
//!
//! Sources, lowest precedence first: built-in defaults, the optional config
//! file, `RTE_*` environment variables, command line flags.

use agent_lib::exporter::DEFAULT_PUBLISH_NAMESPACE;
use agent_lib::RuntimeKind;
use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, Environment, File, Map};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line flags
#[derive(Debug, Default, Parser)]
#[command(name = "resource-topology-exporter", version, about = "Export per-NUMA resource allocation as NodeResourceTopology objects")]
pub struct Cli {
    /// Optional YAML, TOML or JSON config file
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Container runtime to scan (containerd|cri-o)
    #[arg(long)]
    pub container_runtime: Option<String>,

    /// Runtime socket; defaults to the selected runtime's usual location
    #[arg(long)]
    pub cri_path: Option<PathBuf>,

    /// Time between cycles, e.g. 500ms, 3s, 1m30s or plain seconds
    #[arg(long)]
    pub sleep_interval: Option<String>,

    /// Only account containers of this namespace
    #[arg(long)]
    pub watch_namespace: Option<String>,

    /// Root of the host sysfs mount
    #[arg(long)]
    pub sysfs: Option<PathBuf>,

    /// SR-IOV network device plugin config
    #[arg(long)]
    pub sriov_config_file: Option<PathBuf>,

    /// Kubelet configuration file
    #[arg(long)]
    pub kubelet_config_file: Option<PathBuf>,

    /// Name of the node this exporter runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Kubeconfig to use instead of the in-cluster configuration
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Port for health and metrics endpoints
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Namespace the NodeResourceTopology object is published into
    #[arg(long)]
    pub publish_namespace: Option<String>,
}

/// Merged configuration before validation
#[derive(Debug, Deserialize)]
struct RawConfig {
    container_runtime: String,
    cri_path: Option<String>,
    sleep_interval: String,
    #[serde(default)]
    watch_namespace: String,
    sysfs: String,
    sriov_config_file: String,
    kubelet_config_file: String,
    node_name: Option<String>,
    kubeconfig: Option<String>,
    api_port: u16,
    publish_namespace: String,
}

/// Validated exporter settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime: RuntimeKind,
    pub cri_path: PathBuf,
    pub sleep_interval: Duration,
    pub watch_namespace: Option<String>,
    pub sysfs_root: PathBuf,
    pub sriov_config_file: PathBuf,
    pub kubelet_config_file: PathBuf,
    pub node_name: String,
    pub kubeconfig: Option<PathBuf>,
    pub api_port: u16,
    pub publish_namespace: String,
}

impl Settings {
    /// Load settings from every source, reading the process environment
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, None)
    }

    /// Load settings with an explicit `RTE_*` environment (tests)
    pub fn load_with_env(cli: &Cli, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("container_runtime", "containerd")?
            .set_default("sleep_interval", "3s")?
            .set_default("watch_namespace", "")?
            .set_default("sysfs", "/host-sys")?
            .set_default("sriov_config_file", "/etc/sriov-config/config.json")?
            .set_default("kubelet_config_file", "/host-etc/kubernetes/kubelet.conf")?
            .set_default("api_port", 8080)?
            .set_default("publish_namespace", DEFAULT_PUBLISH_NAMESPACE)?;

        if let Some(path) = &cli.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let raw: RawConfig = builder
            .add_source(Environment::with_prefix("RTE").source(env))
            .set_override_option("container_runtime", cli.container_runtime.clone())?
            .set_override_option("cri_path", path_string(cli.cri_path.as_deref()))?
            .set_override_option("sleep_interval", cli.sleep_interval.clone())?
            .set_override_option("watch_namespace", cli.watch_namespace.clone())?
            .set_override_option("sysfs", path_string(cli.sysfs.as_deref()))?
            .set_override_option("sriov_config_file", path_string(cli.sriov_config_file.as_deref()))?
            .set_override_option(
                "kubelet_config_file",
                path_string(cli.kubelet_config_file.as_deref()),
            )?
            .set_override_option("node_name", cli.node_name.clone())?
            .set_override_option("kubeconfig", path_string(cli.kubeconfig.as_deref()))?
            .set_override_option("api_port", cli.api_port.map(i64::from))?
            .set_override_option("publish_namespace", cli.publish_namespace.clone())?
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<Settings> {
        let runtime: RuntimeKind = self.container_runtime.parse()?;
        let sleep_interval = parse_interval(&self.sleep_interval)
            .with_context(|| format!("Invalid sleep interval '{}'", self.sleep_interval))?;

        let node_name = match self.node_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => bail!("Node name is required (--node-name or NODE_NAME)"),
        };

        let cri_path = self
            .cri_path
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime.default_endpoint().to_path_buf());

        Ok(Settings {
            runtime,
            cri_path,
            sleep_interval,
            watch_namespace: Some(self.watch_namespace).filter(|ns| !ns.is_empty()),
            sysfs_root: PathBuf::from(self.sysfs),
            sriov_config_file: PathBuf::from(self.sriov_config_file),
            kubelet_config_file: PathBuf::from(self.kubelet_config_file),
            node_name,
            kubeconfig: self.kubeconfig.filter(|p| !p.is_empty()).map(PathBuf::from),
            api_port: self.api_port,
            publish_namespace: self.publish_namespace,
        })
    }
}

fn path_string(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

/// Parse a Go-style duration (`300ms`, `3s`, `1m30s`, `1.5h`) or plain seconds
///
/// Zero is rejected: the loop would spin.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let duration = match s.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => parse_go_duration(s)?,
    };

    if duration.is_zero() {
        bail!("duration must be greater than zero");
    }
    Ok(duration)
}

fn parse_go_duration(s: &str) -> Result<Duration> {
    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_len == 0 {
            bail!("expected a number at '{}'", rest);
        }
        let value: f64 = rest[..number_len]
            .parse()
            .with_context(|| format!("invalid number '{}'", &rest[..number_len]))?;
        rest = &rest[number_len..];

        let unit_len = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => bail!("missing unit after '{}'", value),
            unit => bail!("unknown unit '{}'", unit),
        };
        rest = &rest[unit_len..];
        nanos += value * scale;
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
