use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    adapters::{GatewayRouter, HealthMonitor, HttpClientAdapter},
    config::{GatewayConfig, GatewayConfigValidator, load_config},
    core::GatewayService,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Log filter used when RUST_LOG is not set
    #[clap(long, default_value = "info", global = true)]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[clap(long, global = true)]
    pretty_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, &args.log_level, args.pretty_logs).await,
        None => serve(&args.config, &args.log_level, args.pretty_logs).await,
    }
}

async fn serve(config_path: &str, log_level: &str, pretty_logs: bool) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed.",
            e
        );
    }

    tracing_setup::init_tracing_with_config(log_level, !pretty_logs, true)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Loading configuration from {config_path}");
    let config: GatewayConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let gateway_service = Arc::new(
        GatewayService::new(Arc::new(config)).context("Failed to build instance pools")?,
    );
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let token = graceful_shutdown.cancellation_token();

    let monitor = HealthMonitor::new(gateway_service.clone(), http_client.clone());
    let monitor_handle = tokio::spawn({
        let token = token.clone();
        async move { monitor.run(token).await }
    });

    let sweeper_handle = tokio::spawn({
        let gateway_service = gateway_service.clone();
        let token = token.clone();
        async move { gateway_service.cache().run_sweeper(token).await }
    });

    let signal_handle = tokio::spawn({
        let graceful_shutdown = graceful_shutdown.clone();
        async move { graceful_shutdown.run_signal_handler().await }
    });

    let app = GatewayRouter::new(gateway_service.clone(), http_client).into_app();

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;
    tracing::info!(
        services = gateway_service.pools().len(),
        routes = gateway_service.config().routes.len(),
        "Switchyard listening on {listen_addr}"
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let graceful_shutdown = graceful_shutdown.clone();
        async move { graceful_shutdown.wait_for_shutdown_signal().await }
    });

    let server_result = server.await.context("Server error");

    // The server may also stop on its own; make sure background tasks follow
    if graceful_shutdown.trigger_shutdown(ShutdownReason::Graceful) {
        tracing::warn!("Server stopped without a shutdown signal");
    }
    graceful_shutdown
        .drain(async {
            let _ = signal_handle.await;
            let _ = monitor_handle.await;
            let _ = sweeper_handle.await;
        })
        .await;

    tracing::info!("Graceful shutdown completed");
    server_result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            let instances: usize = config.services.values().map(|s| s.instances.len()).sum();
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {} ({} instances)", config.services.len(), instances);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!("   • Response Cache: {}", config.cache.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all instance URLs start with http:// or https://");
            println!("   • Check that every route names a configured service");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'switchyard serve --config {config_path}' to start the server");
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# Switchyard gateway configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

[health_check]
enabled = true
interval_ms = 10000
timeout_ms = 2000
path = "/health"
unhealthy_threshold = 1
healthy_threshold = 1

[circuit_breaker]
failure_threshold = 5
reset_timeout_ms = 60000
half_open_trial_count = 1

[cache]
enabled = true
default_ttl_ms = 60000
max_entries = 10000

[services.user-service]
strategy = "least_connections"
instances = [
    { url = "http://localhost:3001" },
    { url = "http://localhost:3002", weight = 2 },
]

[routes."/api/users"]
service = "user-service"
path_rewrite = "/users"
cacheable = true
cache_ttl_ms = 5000
timeout_ms = 3000
"#;
