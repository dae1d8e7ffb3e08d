use crate::server::{serve, AppState};
use crate::{
    install_prometheus, CaptureQuery, CaptureService, ClientId, Config, MetricsCollector, SessionMode,
};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "capture-service")]
#[command(about = "Headless browser capture service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable the Chrome sandbox (containers running as root)")]
    pub no_sandbox: bool,

    #[arg(long, global = true, value_enum, help = "How browser sessions are obtained")]
    pub session_mode: Option<SessionModeArg>,

    #[arg(long, global = true, help = "Browser pool size in pooled mode")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Navigation timeout in seconds")]
    pub navigation_timeout: Option<u64>,

    #[arg(long, global = true, help = "Maximum concurrent captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Serve Prometheus metrics at /metrics")]
    pub metrics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SessionModeArg {
    PerRequest,
    Pooled,
}

impl From<SessionModeArg> for SessionMode {
    fn from(arg: SessionModeArg) -> Self {
        match arg {
            SessionModeArg::PerRequest => SessionMode::PerRequest,
            SessionModeArg::Pooled => SessionMode::Pooled,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP capture service (default)
    Serve {
        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(short, long, help = "Server port")]
        port: Option<u16>,
    },

    /// Capture a single URL to a file
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path (default: capture.<ext>)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Output format (png, jpeg, pdf, html)")]
        format: Option<String>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,
    },

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        file: PathBuf,
    },
}

/// Load the configuration file (if any) and apply command-line overrides
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Session mode: {:?}", config.browser.session_mode);
    info!("Navigation timeout: {:?}", config.navigation_timeout);
    info!(
        "Rate limit: {} requests per {:?}",
        config.rate_limit.max_requests, config.rate_limit.window
    );

    Ok(config)
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }
    if args.no_sandbox {
        config.browser.sandbox = false;
    }
    if let Some(mode) = args.session_mode {
        config.browser.session_mode = mode.into();
    }
    if let Some(pool_size) = args.pool_size {
        config.browser.pool_size = pool_size;
    }
    if let Some(timeout) = args.navigation_timeout {
        config.navigation_timeout = Duration::from_secs(timeout);
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_captures = max_concurrent;
    }
    if args.metrics {
        config.enable_metrics = true;
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind, port } => self.run_server(bind, port).await,
            Commands::Capture {
                url,
                output,
                format,
                width,
                height,
                full_page,
            } => {
                let query = CaptureQuery {
                    url: Some(url),
                    format,
                    width: width.map(|w| w.to_string()),
                    height: height.map(|h| h.to_string()),
                    full_page: full_page.then(|| "true".to_string()),
                };
                self.run_capture(query, output).await
            }
            Commands::Validate { file } => validate_config(&file).await,
        }
    }

    pub async fn run_server(mut self, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
        if let Some(bind) = bind {
            let ip = bind
                .parse::<IpAddr>()
                .with_context(|| format!("invalid bind address {bind:?}"))?;
            self.config.bind_address.set_ip(ip);
        }
        if let Some(port) = port {
            self.config.bind_address.set_port(port);
        }

        let metrics = if self.config.enable_metrics {
            let handle = install_prometheus()?;
            MetricsCollector::default().start_collection();
            Some(handle)
        } else {
            None
        };

        let service = Arc::new(CaptureService::new(self.config.clone()).await?);
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .with_context(|| format!("binding {}", self.config.bind_address))?;

        let served = serve(listener, AppState::new(service.clone(), metrics)).await;

        info!("Shutting down...");
        service.shutdown().await;
        served?;

        Ok(())
    }

    pub async fn run_capture(self, query: CaptureQuery, output: Option<PathBuf>) -> anyhow::Result<()> {
        let service = CaptureService::new(self.config.clone()).await?;

        let client = ClientId::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let started = Instant::now();
        let captured = service.capture_query(&client, query).await;
        let elapsed = started.elapsed();
        service.shutdown().await;
        let result = captured?;

        let output = output.unwrap_or_else(|| PathBuf::from(&result.suggested_filename));
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &result.bytes).await?;

        println!("Capture saved successfully:");
        println!("  Output: {}", output.display());
        println!("  Type: {}", result.mime_type);
        println!("  Size: {}", crate::format_bytes(result.bytes.len()));
        println!("  Duration: {}", crate::format_duration(elapsed));

        Ok(())
    }
}

pub async fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = Config::load(config_path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Bind address: {}", config.bind_address);
    println!("  Session mode: {:?}", config.browser.session_mode);
    println!("  Navigation timeout: {:?}", config.navigation_timeout);
    println!(
        "  Rate limit: {} per {:?}",
        config.rate_limit.max_requests, config.rate_limit.window
    );
    println!(
        "  Default viewport: {}x{}",
        config.default_viewport.width, config.default_viewport.height
    );
    println!("  Max concurrent captures: {}", config.max_concurrent_captures);

    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
