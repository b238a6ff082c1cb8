use crate::{
    agent::{self, Agent, HostCleanup, KubeNode},
    core::{ControllerMetrics, FailurePolicy, SystemClock},
    health::{self, HealthFile},
    lease,
    manager::{self, KubeCluster, Migrator},
    ModuleConfigToggle,
};
use anyhow::{bail, ensure, Context as _, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "cni-migration", about = "Migrates a cluster between network plugins")]
pub struct Args {
    #[clap(
        long,
        default_value = "cni_migration=info,warn",
        env = "CNI_MIGRATION_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, value_enum)]
    mode: Mode,

    /// The `CNIMigration` driven by the manager.
    #[clap(long, env = "CNI_MIGRATION_NAME")]
    migration_name: Option<String>,

    /// Admission webhook configurations that must not be able to reject
    /// requests while the data plane is replaced.
    #[clap(long, default_value = "")]
    wait_for_webhooks: Webhooks,

    #[clap(long, default_value = "900")]
    node_timeout_secs: u64,

    #[clap(long, default_value = "0.1")]
    max_failed_nodes_ratio: f64,

    #[clap(long, default_value = "d8-system")]
    controller_namespace: String,

    #[clap(long, default_value = "cni-migration-manager")]
    deployment_name: String,

    /// The node served by the agent.
    #[clap(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Where the host's root filesystem is mounted in the agent container.
    #[clap(long, default_value = "/")]
    host_root: PathBuf,

    #[clap(long, default_value = "/tmp/cni-migration-healthy")]
    health_file: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    Manager,
    Agent,
    Healthcheck,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Webhooks(Vec<String>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            mode,
            migration_name,
            wait_for_webhooks: Webhooks(webhooks),
            node_timeout_secs,
            max_failed_nodes_ratio,
            controller_namespace,
            deployment_name,
            node_name,
            host_root,
            health_file,
        } = self;

        // The probe must not depend on the API server or on logging.
        if mode == Mode::Healthcheck {
            return health::check(&health_file);
        }

        let mut prom = <Registry>::default();
        let metrics = match mode {
            Mode::Manager => ControllerMetrics::register(
                prom.sub_registry_with_prefix("cni_migration_manager"),
            ),
            _ => ControllerMetrics::register(prom.sub_registry_with_prefix("cni_migration_agent")),
        };
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        // Validate before connecting so misconfiguration fails fast.
        let manager_config = match mode {
            Mode::Manager => Some(manager::Config {
                migration_name: migration_name
                    .context("--migration-name is required in manager mode")?,
                webhooks,
                policy: failure_policy(node_timeout_secs, max_failed_nodes_ratio)?,
            }),
            _ => None,
        };
        let node_name = match mode {
            Mode::Agent => Some(node_name.context("--node-name is required in agent mode")?),
            _ => None,
        };

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let client = runtime.client();
        let shutdown = runtime.shutdown_handle();

        if let Some(config) = manager_config {
            let hostname = std::env::var("HOSTNAME")
                .context("failed to fetch `HOSTNAME` environment variable")?;
            let claims = lease::init(
                client.clone(),
                &controller_namespace,
                &deployment_name,
                &hostname,
            )
            .instrument(info_span!("lease"))
            .await?;

            info!(
                migration = %config.migration_name,
                webhooks = ?config.webhooks,
                "Running manager"
            );
            let migrator = Migrator::new(
                KubeCluster::new(client.clone()),
                ModuleConfigToggle::new(client.clone()),
                config,
                Arc::new(SystemClock),
            );
            let ctx = manager::Context::new(migrator, hostname, claims, metrics);
            tokio::spawn(manager::run(client, ctx, shutdown).instrument(info_span!("manager")));
        } else if let Some(node) = node_name {
            info!(%node, host_root = %host_root.display(), "Running agent");
            let agent = Agent::new(
                &node,
                KubeNode::new(client.clone(), &node),
                HostCleanup::new(host_root),
                Arc::new(SystemClock),
            );
            let ctx = agent::Context::new(agent, metrics);
            tokio::spawn(agent::run(client, ctx, shutdown).instrument(info_span!("agent")));
        }

        let _health = HealthFile::create(health_file)?;

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the controller to stop before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn failure_policy(node_timeout_secs: u64, max_failed_ratio: f64) -> Result<FailurePolicy> {
    ensure!(node_timeout_secs > 0, "--node-timeout-secs must be positive");
    ensure!(
        (0.0..=1.0).contains(&max_failed_ratio),
        "--max-failed-nodes-ratio must be between 0 and 1, got {max_failed_ratio}"
    );
    Ok(FailurePolicy {
        node_timeout: Duration::from_secs(node_timeout_secs),
        max_failed_ratio,
    })
}

impl std::str::FromStr for Webhooks {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToString::to_string)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("cni-migration").chain(args.iter().copied()))
    }

    #[test]
    fn webhook_lists() {
        assert_eq!("".parse::<Webhooks>().unwrap(), Webhooks::default());
        assert_eq!(
            " validating-webhook-handler, ,d8-admission-policy-engine ".parse::<Webhooks>().unwrap(),
            Webhooks(vec![
                "validating-webhook-handler".to_string(),
                "d8-admission-policy-engine".to_string()
            ])
        );
    }

    #[test]
    fn manager_defaults() {
        let args = parse(&["--mode", "manager", "--migration-name", "to-cilium"]).unwrap();
        assert_eq!(args.mode, Mode::Manager);
        assert_eq!(args.migration_name.as_deref(), Some("to-cilium"));
        assert_eq!(args.wait_for_webhooks, Webhooks::default());
        assert_eq!(args.node_timeout_secs, 900);
        assert_eq!(args.max_failed_nodes_ratio, 0.1);
        assert_eq!(args.controller_namespace, "d8-system");
        assert_eq!(args.deployment_name, "cni-migration-manager");
        assert_eq!(args.health_file, PathBuf::from("/tmp/cni-migration-healthy"));
    }

    #[test]
    fn agent_flags() {
        let args = parse(&[
            "--mode",
            "agent",
            "--node-name",
            "worker-1",
            "--host-root",
            "/host",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Agent);
        assert_eq!(args.node_name.as_deref(), Some("worker-1"));
        assert_eq!(args.host_root, PathBuf::from("/host"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(parse(&["--mode", "observer"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn failure_policy_bounds() {
        let policy = failure_policy(60, 0.25).unwrap();
        assert_eq!(policy.node_timeout, Duration::from_secs(60));
        assert_eq!(policy.max_failed_ratio, 0.25);

        assert!(failure_policy(0, 0.1).is_err());
        assert!(failure_policy(60, 1.5).is_err());
        assert!(failure_policy(60, -0.1).is_err());
    }

    #[tokio::test]
    async fn healthcheck_reads_the_health_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healthy");
        let path_arg = path.to_str().unwrap();

        let args = parse(&["--mode", "healthcheck", "--health-file", path_arg]).unwrap();
        assert!(args.run().await.is_err());

        let _health = HealthFile::create(&path).unwrap();
        let args = parse(&["--mode", "healthcheck", "--health-file", path_arg]).unwrap();
        args.run().await.unwrap();
    }
}
