use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dbop_core::{DbCluster, DbClusterStatus, Tier};
use dbop_kubehub::{get_kube_client, KubeHub, Platform};
use dbop_status::{StatusConfig, StatusReconciler};
use tokio::signal;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dbopctl", version, about = "DbCluster status tool")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompute and write the status of one cluster
    Status {
        /// DbCluster name, e.g. "cluster1"
        name: String,
    },
    /// Recompute every cluster in the namespace on an interval until Ctrl-C
    Watch {
        /// Seconds between rounds; a slow round delays the next one
        #[arg(long = "interval-secs", default_value_t = 10)]
        interval_secs: u64,
    },
    /// Print the stored status without recomputing it
    Show {
        /// DbCluster name, e.g. "cluster1"
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("DBOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DBOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DBOP_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = get_kube_client().await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let hub: Arc<dyn Platform> = Arc::new(KubeHub::new(client));
    let config = StatusConfig::from_env();
    info!(ns = %ns, fault_window_s = config.fault_window.as_secs(), max_conditions = config.max_conditions, "dbopctl starting");

    match cli.command {
        Commands::Status { name } => {
            let reconciler = StatusReconciler::new(hub.clone(), config);
            let mut cr = hub.get_cluster(&ns, &name).await.with_context(|| format!("reading dbcluster {}/{}", ns, name))?;
            reconciler.reconcile_with_deadline(&mut cr, None).await.with_context(|| format!("status pass for {}/{}", ns, name))?;
            print_cluster(&cr, cli.output)?;
        }
        Commands::Show { name } => {
            let cr = hub.get_cluster(&ns, &name).await.with_context(|| format!("reading dbcluster {}/{}", ns, name))?;
            print_cluster(&cr, cli.output)?;
        }
        Commands::Watch { interval_secs } => {
            let reconciler = StatusReconciler::new(hub.clone(), config);
            let mut ticker = watch_ticker(interval_secs);
            info!(ns = %ns, interval_secs, "watch invoked");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = watch_round(hub.as_ref(), &reconciler, &ns, cli.output).await {
                            error!(error = ?e, "watch round failed");
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            warn!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

fn watch_ticker(interval_secs: u64) -> Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // missed ticks must not replay as back-to-back rounds
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One pass for every cluster in `ns`. Passes run concurrently; each touches
/// only its own resource, so one failure does not stop the others.
async fn watch_round(hub: &dyn Platform, reconciler: &StatusReconciler, ns: &str, output: Output) -> Result<()> {
    let mut clusters = hub.list_clusters(ns).await?;
    let results = futures::future::join_all(clusters.iter_mut().map(|cr| reconciler.reconcile_with_deadline(cr, None))).await;
    for (cr, res) in clusters.iter().zip(results) {
        match res {
            Ok(()) => print_cluster(cr, output)?,
            Err(e) => {
                let name = cr.metadata.name.as_deref().unwrap_or("-");
                error!(cluster = %name, error = %e, "status pass failed");
                eprintln!("{}: {}", name, e);
            }
        }
    }
    Ok(())
}

fn print_cluster(cr: &DbCluster, output: Output) -> Result<()> {
    let name = cr.metadata.name.as_deref().unwrap_or("-");
    let status = cr.status.clone().unwrap_or_default();
    match output {
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> { name: &'a str, status: &'a DbClusterStatus }
            println!("{}", serde_json::to_string_pretty(&Row { name, status: &status })?);
        }
        Output::Human => {
            for line in render_human(name, &status, Utc::now()) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn render_human(name: &str, status: &DbClusterStatus, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = vec![format!("{}  {}  {}/{} ready", name, status.status, status.ready, status.size)];
    for tier in Tier::ALL {
        let app = status.app(tier);
        let msg = if app.message.is_empty() { String::new() } else { format!("  {}", app.message.trim()) };
        lines.push(format!("  {:<9} {:<13} {}/{}{}", tier.name(), app.status, app.ready, app.size, msg));
    }
    lines.push(format!("  host      {}", if status.host.is_empty() { "-" } else { status.host.as_str() }));
    if let Some(cond) = status.last_condition() {
        let age = cond.last_transition_time.as_ref().map(|t| render_age(t.0, now)).unwrap_or_else(|| "-".to_string());
        let reason = if cond.reason.is_empty() { "-" } else { cond.reason.as_str() };
        lines.push(format!("  condition {:?} {} ({} ago)", cond.type_, reason, age));
    }
    for m in &status.messages {
        lines.push(format!("  ! {}", m));
    }
    lines
}

fn render_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let mut secs = now.signed_duration_since(since).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
