use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reflex_core::{stop_channel, RawObject, ResourceType, Selector};
use reflex_informer::{FactoryConfig, HandlerFuncs, InformerFactory};
use reflex_kubehub::KubeSourceProvider;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reflexctl", version, about = "Reflex informer cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "REFLEX_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync a cache for one resource type and print its contents
    Ls {
        /// Resource type key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Seconds to wait for the initial sync
        #[arg(long = "wait", env = "REFLEX_WAIT_SECS", default_value_t = 8)]
        wait_secs: u64,
    },
    /// Watch one or more resource types and print +/~/- events until Ctrl-C
    Watch {
        /// Resource type keys
        #[arg(required = true)]
        gvks: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("REFLEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFLEX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REFLEX_METRICS_ADDR; expected host:port");
        }
    }
}

fn factory_config(namespace: Option<&str>) -> FactoryConfig {
    let cfg = FactoryConfig::from_env();
    match namespace {
        Some(ns) => cfg.namespace(ns),
        None => cfg,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            let provider = KubeSourceProvider::try_default().await?;
            match reflex_kubehub::discover(provider.client().clone()).await {
                Ok(resources) => match cli.output {
                    Output::Human => {
                        for r in resources {
                            let scope = if r.namespaced { "namespaced" } else { "cluster" };
                            println!("{} • {}", r.resource_type(), scope);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
                },
                Err(e) => {
                    error!(error = ?e, "discover failed");
                    eprintln!("discover error: {}", e);
                }
            }
        }
        Commands::Ls { gvk, selector, wait_secs } => {
            let rt = ResourceType::parse(&gvk)?;
            let selector = match selector.as_deref() {
                Some(s) => Selector::parse(s).with_context(|| format!("parsing selector {s:?}"))?,
                None => Selector::everything(),
            };
            info!(gvk = %rt, ns = ?cli.namespace, selector = %selector, "ls invoked");
            let provider = Arc::new(KubeSourceProvider::try_default().await?);
            let factory: InformerFactory<RawObject> = InformerFactory::new(provider, factory_config(cli.namespace.as_deref()));
            let lister = factory.lister_for(&rt);

            let (handle, stop) = stop_channel();
            factory.start(&stop);
            let synced = tokio::time::timeout(Duration::from_secs(wait_secs), factory.wait_for_cache_sync(&stop)).await;
            if !matches!(&synced, Ok(m) if m.values().all(|s| *s)) {
                warn!(gvk = %rt, wait_secs, "cache not synced in time; printing partial contents");
            }

            let mut items = lister.list(&selector);
            items.sort_by(|a, b| (a.namespace.as_deref(), a.name.as_str()).cmp(&(b.namespace.as_deref(), b.name.as_str())));
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.namespace.clone().unwrap_or_else(|| "-".to_string());
                        println!("{:<11} {:<20} {}", ns_col, item.name, render_age(item.creation_ts));
                    }
                }
                Output::Json => {
                    let raw: Vec<&serde_json::Value> = items.iter().map(|o| &o.raw).collect();
                    println!("{}", serde_json::to_string_pretty(&raw)?);
                }
            }
            handle.stop();
            factory.shutdown().await;
        }
        Commands::Watch { gvks } => {
            let rts = gvks.iter().map(|k| ResourceType::parse(k)).collect::<Result<Vec<_>, _>>()?;
            info!(gvks = ?gvks, ns = ?cli.namespace, "watch invoked");
            let provider = Arc::new(KubeSourceProvider::try_default().await?);
            let factory: InformerFactory<RawObject> = InformerFactory::new(provider, factory_config(cli.namespace.as_deref()));
            let json = cli.output == Output::Json;
            for rt in &rts {
                let inf = factory.informer_for(rt);
                inf.add_event_handler(printer(rt.clone(), json))?;
            }

            let (handle, stop) = stop_channel();
            factory.start(&stop);
            signal::ctrl_c().await?;
            info!("ctrl-c received; stopping");
            handle.stop();
            factory.shutdown().await;
        }
    }
    Ok(())
}

/// Prints one line per change. Resyncs of unchanged objects are skipped.
fn printer(rt: ResourceType, json: bool) -> HandlerFuncs<RawObject> {
    let emit = Arc::new(move |sign: &str, o: &RawObject| {
        if json {
            let line = serde_json::json!({ "event": sign, "gvk": rt.key(), "object": o.raw });
            println!("{line}");
        } else {
            let key = match &o.namespace {
                Some(ns) => format!("{}/{}", ns, o.name),
                None => o.name.clone(),
            };
            println!("{} {} {} rv={}", sign, rt, key, o.resource_version);
        }
    });
    let (add, update, delete) = (emit.clone(), emit.clone(), emit);
    HandlerFuncs::<RawObject>::new()
        .add_fn(move |o| {
            add("+", &**o);
            Ok(())
        })
        .update_fn(move |old, new| {
            if old.resource_version != new.resource_version {
                update("~", &**new);
            }
            Ok(())
        })
        .delete_fn(move |o| {
            delete("-", &**o);
            Ok(())
        })
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
