use anyhow::Context;
use clap::Parser;
use log::{error, info};
use std::path::Path;
use tokio::signal;
use wiretap_proxy::config::Config;
use wiretap_proxy::logging::{self, CustomLogger};
use wiretap_proxy::proxy::ProxyFactory;

#[derive(Parser)]
#[clap(
    version,
    about = "Intercepting HTTP proxy that forwards to one upstream and dumps every request and response"
)]
struct Args {
    #[clap(short, long, value_name = "URL", help = "Full URL of the upstream (e.g., https://example.com/service)")]
    target: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., :8080 or 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(long, help = "Skip TLS certificate verification towards the upstream")]
    insecure: bool,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream request timeout in seconds")]
    timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum idle upstream connections to keep")]
    pool_max_idle: Option<usize>,

    #[clap(long, help = "Print dumps without ANSI colours")]
    no_color: bool,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    info!("Starting proxy server...");
    let proxy = ProxyFactory::create_proxy(&config).context("failed to create proxy")?;

    let server_handle = tokio::spawn(async move { proxy.run().await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Failed to start server: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                    return Err(e.into());
                }
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)
            .with_context(|| format!("failed to load {}", config_file))?
    } else {
        Config::default()
    };

    // Command line flags win over the file.
    if let Some(target) = &args.target {
        config.target = Some(target.clone());
    }
    if let Some(listen) = &args.listen {
        config.listen_addr = Config::parse_listen_addr(listen)?;
    }
    if args.insecure {
        config.insecure_skip_verify = true;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = Some(timeout);
    }
    if let Some(pool_max_idle) = args.pool_max_idle {
        config.pool_max_idle_per_host = Some(pool_max_idle);
    }
    if args.no_color {
        config.dump.color = false;
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let result = match (&config.logging, &args.log_level, &args.log_format) {
        (Some(logging_config), None, None) => CustomLogger::init(logging_config.clone()),
        _ => {
            if let Some(level) = &args.log_level {
                logging::parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?;
            }
            logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref())
        }
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = r#"{
  "listen_addr": "0.0.0.0:8080",
  "target": "https://backend.example.com/service",
  "insecure_skip_verify": false,
  "timeout_secs": 30,
  "pool_max_idle_per_host": 10,
  "pool_idle_timeout_secs": 90,
  "dump": {
    "color": true
  },
  "logging": {
    "level": "info",
    "format": "text",
    "targets": [
      { "type": "stdout" }
    ]
  }
}"#;

    std::fs::write(file_path, sample).with_context(|| format!("failed to write {}", file_path))?;
    Ok(())
}
