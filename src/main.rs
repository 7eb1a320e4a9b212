//! Tapline CLI - a TLS-intercepting CONNECT proxy with transaction capture

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tapline::policy::{DestinationPolicy, PatternSet};
use tapline::{Config, GeneratedCa, ProxyServer};

#[derive(Parser)]
#[command(name = "tapline")]
#[command(about = "A TLS-intercepting CONNECT proxy that captures HTTP transactions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to CA certificate (overrides config)
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Path to CA private key (overrides config)
        #[arg(long)]
        ca_key: Option<PathBuf>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Log level (error, warn, info, debug, trace); defaults to the config value
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Generate a new CA certificate
    GenerateCa {
        /// Output directory for ca.crt and ca.key
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Certificate filename
        #[arg(long, default_value = "ca.crt")]
        cert_name: String,

        /// Key filename
        #[arg(long, default_value = "ca.key")]
        key_name: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            ca_cert,
            ca_key,
            bind,
            log_level,
        } => {
            let mut cfg = match &config {
                Some(config_path) => Config::from_file(config_path)?,
                None => Config::parse("")?,
            };

            // Initialize logging; RUST_LOG wins over both flag and config
            let level = log_level.unwrap_or_else(|| cfg.logging.level.clone());
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            match &config {
                Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
                None => tracing::info!("Using default configuration"),
            }

            // Apply CLI overrides
            if let Some(cert) = ca_cert {
                cfg.proxy.ca_cert = Some(cert.to_string_lossy().to_string());
            }
            if let Some(key) = ca_key {
                cfg.proxy.ca_key = Some(key.to_string_lossy().to_string());
            }
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            cfg.validate()?;

            if cfg.proxy.ca_cert.is_none() {
                tracing::warn!(
                    "No CA configured; tunnels are relayed but HTTPS traffic cannot be captured. \
                     Generate one with `tapline generate-ca --out ./certs/`"
                );
            }

            let server = ProxyServer::new(cfg)?;

            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTPS_PROXY=http://{}", server.bind_address());

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
        } => {
            std::fs::create_dir_all(&out)?;

            let cert_path = out.join(&cert_name);
            let key_path = out.join(&key_name);

            println!("Generating CA certificate...");

            let ca = GeneratedCa::generate()?;
            ca.save(&cert_path, &key_path)?;

            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", key_path.display());
            println!();
            println!("To use with the proxy:");
            println!(
                "  tapline run --ca-cert {} --ca-key {}",
                cert_path.display(),
                key_path.display()
            );
            println!();
            println!("Clients must trust the certificate for intercepted hosts.");
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!(
                "  CA cert: {}",
                cfg.proxy.ca_cert.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  CA key: {}",
                cfg.proxy.ca_key.as_deref().unwrap_or("(not set)")
            );

            let intercept_hosts = PatternSet::hosts(&cfg.proxy.intercept_hosts)?;
            if intercept_hosts.is_empty() {
                println!("  Intercepted hosts: all");
            } else {
                println!("  Intercepted hosts: {}", cfg.proxy.intercept_hosts.join(", "));
            }
            println!("  Upstream TLS: {:?}", cfg.proxy.upstream_tls);

            let policy = DestinationPolicy::from_config(&cfg.policy);
            println!(
                "  Policy: {} allowed, {} denied",
                policy.allow_count(),
                policy.deny_count()
            );

            println!("  Capture: {}", if cfg.capture.enabled { "enabled" } else { "disabled" });
            if cfg.capture.log_transactions {
                PatternSet::paths(&cfg.capture.log_paths)?;
                println!("  Transaction log paths: {}", cfg.capture.log_paths.len());
            }

            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Audit log: {}",
                cfg.logging.audit_log.as_deref().unwrap_or("disabled")
            );
            if let Some(username) = &cfg.proxy.auth_username {
                println!("  Authentication: enabled (username: {})", username);
                // Resolve now to catch unset environment variables early
                cfg.resolved_auth()?;
            } else {
                println!("  Authentication: disabled");
            }
        }
    }

    Ok(())
}
