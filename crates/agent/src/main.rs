//! Resource Topology Exporter
//!
//! Runs as a DaemonSet on each Kubernetes node and keeps the node's
//! `NodeResourceTopology` object in line with what the container runtime
//! has granted on every NUMA node.

use agent_lib::{
    exporter::{Exporter, KubeTopologyStore},
    finder::CriScanner,
    health::HealthRegistry,
    observability::{ExporterMetrics, StructuredLogger},
    topology::{self, sysfs, ResourceMapper},
    Driver, ResourceAggregator,
};
use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use resource_topology_exporter::{
    api,
    config::{Cli, Settings},
};
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli).context("Invalid configuration")?;
    info!(
        node_name = %settings.node_name,
        runtime = %settings.runtime,
        cri_path = %settings.cri_path.display(),
        sleep_interval_ms = settings.sleep_interval.as_millis() as u64,
        "Exporter configured"
    );

    // Static inputs: any failure here stops the process before the first cycle
    let policy = topology::topology_manager_policy(&settings.kubelet_config_file)
        .await
        .context("Failed to get topology manager policy")?;
    info!(policy = %policy, "Detected kubelet topology manager policy");

    let pci_map =
        topology::build_pci_resource_map(&settings.sysfs_root, &settings.sriov_config_file)
            .await
            .context("Failed to read the PCI to resource mapping")?;
    let host = sysfs::discover(&settings.sysfs_root, &pci_map)
        .await
        .context("Failed to discover NUMA topology")?;

    let mapper = Arc::new(ResourceMapper::new(host, pci_map));
    let aggregator = ResourceAggregator::new(mapper.clone());
    let scanner = CriScanner::new(
        settings.runtime,
        &settings.cri_path,
        settings.watch_namespace.clone(),
    );

    let client = kube_client(settings.kubeconfig.as_deref()).await?;
    let exporter = Exporter::new(
        KubeTopologyStore::new(client),
        policy.clone(),
        settings.node_name.as_str(),
    );

    let health_registry = HealthRegistry::for_pipeline().await;
    let metrics = ExporterMetrics::new().context("Failed to register metrics")?;
    let logger = StructuredLogger::new(&settings.node_name);
    logger.log_startup(
        EXPORTER_VERSION,
        settings.runtime.as_str(),
        policy.as_str(),
        mapper.nodes().count(),
        mapper.pci_map().len(),
    );

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    let mut driver = Driver::builder(scanner, aggregator, exporter)
        .scope(settings.publish_namespace.as_str())
        .sleep_interval(settings.sleep_interval)
        .metrics(metrics)
        .health(health_registry)
        .logger(logger.clone())
        .build()?;

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let result = tokio::select! {
        err = driver.run() => {
            logger.log_shutdown(&err.to_string());
            Err(anyhow::Error::new(err).context("Exporter loop stopped"))
        }
        received = tokio::signal::ctrl_c() => {
            received.context("Failed to listen for SIGINT")?;
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
        _ = terminate.recv() => {
            logger.log_shutdown("SIGTERM received");
            Ok(())
        }
    };

    api_handle.abort();
    result
}

/// Client from an explicit kubeconfig, or the in-cluster / default configuration
async fn kube_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}
