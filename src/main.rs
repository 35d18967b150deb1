//! Embedding Provisioner - Main entry point

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use embedding_provisioner::config::AppConfig;
use embedding_provisioner::models::{
    CacheLocation, ModelId, ModelRequest, QuantizationBackend, cache_size, is_present,
    list_cached_models,
};
use embedding_provisioner::{ModelProvisioner, ProvisioningResult, metrics};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "embedding-provisioner")]
#[command(about = "Resolve, download and quantize embedding models", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the model cache root
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    /// Print a Prometheus metrics snapshot to stderr on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision one model, or every model listed in the config file
    Provision(ProvisionArgs),
    /// Show whether a model's base and quantized variants are cached
    Inspect {
        /// HuggingFace model ID (e.g., "BAAI/bge-small-en-v1.5")
        identifier: String,
    },
    /// List models cached under the root
    List,
}

#[derive(Args, Debug)]
struct ProvisionArgs {
    /// HuggingFace model ID; omit to provision the config's [[models]]
    #[arg(long)]
    model: Option<String>,

    /// The model is private and needs an access token
    #[arg(long)]
    private: bool,

    /// Registry access token (falls back to HF_TOKEN)
    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    trust_remote_code: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Device (auto, cpu, gpu, cuda)
    #[arg(long)]
    device: Option<String>,

    /// Derive and load a quantized variant
    #[arg(long)]
    quantize: bool,

    /// Quantization backend (torch, onnx, openvino)
    #[arg(long)]
    backend: Option<QuantizationBackend>,

    /// Disable download progress bars
    #[arg(long)]
    no_progress: bool,
}

#[derive(Serialize)]
struct ProvisionReport {
    identifier: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    was_downloaded: bool,
    was_quantized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    finished_at: DateTime<Utc>,
}

impl ProvisionReport {
    fn new(identifier: String, result: &ProvisioningResult) -> Self {
        match result {
            Ok(model) => Self {
                identifier,
                status: "ready",
                path: Some(model.handle.path().to_path_buf()),
                device: Some(model.handle.device().to_string()),
                was_downloaded: model.was_downloaded,
                was_quantized: model.was_quantized,
                stage: None,
                error: None,
                retryable: None,
                finished_at: Utc::now(),
            },
            Err(e) => Self {
                identifier,
                status: "failed",
                path: None,
                device: None,
                was_downloaded: false,
                was_quantized: false,
                stage: Some(e.stage().to_string()),
                error: Some(e.to_string()),
                retryable: Some(e.is_retryable()),
                finished_at: Utc::now(),
            },
        }
    }
}

#[derive(Serialize)]
struct LocationReport {
    path: PathBuf,
    present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
}

impl LocationReport {
    fn new(path: &Path) -> Self {
        let present = is_present(path);
        Self {
            path: path.to_path_buf(),
            present,
            size_bytes: if present { cache_size(path) } else { None },
        }
    }
}

#[derive(Serialize)]
struct InspectReport {
    identifier: String,
    base: LocationReport,
    quantized: LocationReport,
}

#[derive(Serialize)]
struct ListReport {
    root: PathBuf,
    models: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging (stderr, stdout carries the JSON reports)
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    // Load configuration
    let mut config = AppConfig::load(cli.config)?;

    // CLI overrides
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }
    config.metrics |= cli.metrics;

    config.validate()?;

    tracing::debug!(
        cache_root = ?config.cache_root(),
        endpoint = ?config.registry.endpoint,
        model_count = config.models.len(),
        "Configuration loaded"
    );

    let prometheus_handle = if config.metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    let success = match cli.command {
        Command::Provision(args) => provision(&config, args).await?,
        Command::Inspect { identifier } => {
            inspect(&config, &identifier)?;
            true
        }
        Command::List => {
            let root = config.cache_root();
            let models = list_cached_models(&root);
            print_json(&ListReport { root, models })?;
            true
        }
    };

    if let Some(handle) = prometheus_handle {
        eprintln!("{}", handle.render());
    }

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn provision(config: &AppConfig, args: ProvisionArgs) -> Result<bool> {
    let requests = match args.model {
        Some(identifier) => vec![ModelRequest {
            is_private: args.private,
            access_token: args.token.or_else(|| config.access_token.clone()),
            local_root: Some(config.cache_root()),
            trust_remote_code: args.trust_remote_code,
            batch_size: args.batch_size,
            device: args.device,
            quantize: args.quantize,
            quantization_backend: args.backend,
            show_progress: Some(config.registry.show_progress && !args.no_progress),
            ..ModelRequest::new(identifier)
        }],
        None => config.model_requests(),
    };

    if requests.is_empty() {
        anyhow::bail!("No model given: pass --model or list [[models]] in the config file");
    }

    tracing::info!(count = requests.len(), "Provisioning models");

    let mut registry_config = config.registry.clone();
    registry_config.show_progress &= !args.no_progress;
    let provisioner = ModelProvisioner::huggingface(registry_config);

    let mut success = true;
    for request in requests {
        let identifier = request.identifier.clone();
        let result = provisioner.provision_request(request).await;
        success &= result.is_ok();
        print_json(&ProvisionReport::new(identifier, &result))?;
    }

    Ok(success)
}

fn inspect(config: &AppConfig, identifier: &str) -> Result<()> {
    let id = ModelId::parse(identifier).context("Invalid model identifier")?;
    let location = CacheLocation::new(&config.cache_root(), &id, true);

    print_json(&InspectReport {
        identifier: id.to_string(),
        base: LocationReport::new(location.base()),
        quantized: LocationReport::new(&location.quantized()),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to serialize report")?;
    println!("{}", line);
    Ok(())
}
