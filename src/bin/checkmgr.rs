use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use checkmgr::api::MetricType;
use checkmgr::{load_config, CheckManager, MetricMeta, MetricSnapshot, TagOverrides};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "checkmgr.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the trap url, creating the check if needed
    Resolve,
    /// Declare metrics and tags on the resolved check
    Reconcile {
        /// Numeric metric name
        #[arg(long = "metric")]
        metrics: Vec<String>,
        /// Text metric name
        #[arg(long = "text")]
        texts: Vec<String>,
        /// Histogram metric name
        #[arg(long = "histogram")]
        histograms: Vec<String>,
        /// Metric tags as `metric=cat:val,cat:val`
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

fn init_logging(debug: bool) {
    let file_appender = rolling::daily("logs", "checkmgr.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn parse_tags(raw: &[String]) -> Result<TagOverrides, String> {
    let mut overrides = TagOverrides::new();
    for entry in raw {
        let (metric, tags) = entry
            .split_once('=')
            .ok_or_else(|| format!("tag override '{entry}' is not metric=tags"))?;
        let tags = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        overrides.insert(metric.to_string(), tags);
    }
    Ok(overrides)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(config.debug);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting check manager.");

    let mut manager = CheckManager::new(config)?;
    let trap = match manager.ensure_initialized().await {
        Ok(trap) => trap,
        Err(e) => {
            error!(error = %e, "Unable to resolve trap.");
            return Err(e.into());
        }
    };
    println!("{}", trap.url);

    if let Command::Reconcile {
        metrics,
        texts,
        histograms,
        tags,
    } = args.command
    {
        let mut snapshot = MetricSnapshot::new();
        for (names, metric_type) in [
            (metrics, MetricType::Numeric),
            (texts, MetricType::Text),
            (histograms, MetricType::Histogram),
        ] {
            for name in names {
                snapshot.insert(name, MetricMeta::new(metric_type));
            }
        }
        let tags = parse_tags(&tags)?;
        manager.reconcile(&snapshot, &tags).await?;
        info!(metrics = snapshot.len(), "Reconciled check metrics.");
    }
    Ok(())
}
