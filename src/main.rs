//! exitscan: concurrent exit-relay measurement scanner
//!
//! This is the main entry point for the scanner.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./exitscan
//!
//! # Run with custom configuration
//! ./exitscan -c /path/to/config.json
//!
//! # Run with environment overrides
//! EXITSCAN_MODULE=external ./exitscan
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use exitscan::config::{load_config_with_env, Config};
use exitscan::control::{CircStatus, ControlChannel, ControlClient};
use exitscan::probe::module_by_name;
use exitscan::scan::{completion_channel, run_completion_reader, EventHandler, ScanStats};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Probe module override
    module: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/exitscan/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut module = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-m" | "--module" => {
                    module = args.next();
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("exitscan v{}", exitscan::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            module,
        }
    }
}

fn print_help() {
    println!(
        r#"exitscan v{}

Concurrent exit-relay measurement scanner.

USAGE:
    exitscan [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/exitscan/config.json]
    -g, --generate-config   Generate default configuration and exit
    -m, --module <NAME>     Probe module to run (overrides configuration)
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    EXITSCAN_CONTROL_ADDR   Override control-port address
    EXITSCAN_SOCKS_ADDR     Override SOCKS endpoint address
    EXITSCAN_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    EXITSCAN_MODULE         Override probe module name

REQUIREMENTS:
    - A running overlay client with its control port enabled
    - The control port reachable from this host
    - torsocks installed (external module only)

EXAMPLE:
    # Generate a configuration template, then fill in the exits to scan
    exitscan -g -c exitscan.json

    # Run the connectivity module over the configured exits
    exitscan -c exitscan.json -m connectivity
"#,
        exitscan::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse().unwrap());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Request one circuit per configured exit, paced by the build delay
///
/// A rejected build request counts as a failed circuit right away; the
/// overlay will never emit events for a circuit it refused to launch.
async fn build_circuits(
    client: Arc<ControlClient>,
    config: Config,
    handler: Arc<EventHandler>,
) {
    let delay = Duration::from_millis(config.scan.build_delay_ms);

    for (i, exit) in config.scan.exits.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }

        match client
            .build_circuit(exit, config.scan.first_hop.as_deref())
            .await
        {
            Ok(circuit_id) => {
                debug!("Circuit {} launched for exit {}", circuit_id, exit);
            }
            Err(e) => {
                warn!("Circuit build request for exit {} rejected: {}", exit, e);
                handler.stats().record_circuit_status(CircStatus::Failed);
                handler.check_finished().await;
            }
        }
    }

    info!(
        "Requested {} circuits, waiting for the scan to complete",
        config.scan.exits.len()
    );
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        exitscan::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let mut config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if let Some(module) = args.module {
        config.scan.module = module;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration after module override: {e}"))?;
    }

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!("exitscan v{}", exitscan::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    // Resolve the probe module
    let module = module_by_name(&config.scan.module, &config.scan)
        .ok_or_else(|| anyhow::anyhow!("Unknown probe module: {}", config.scan.module))?;
    info!("Probe module: {}", config.scan.module);

    // Connect to the control port
    let (client, mut event_rx) = ControlClient::connect(&config.control)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection failed: {e}"))?;
    let client = Arc::new(client);

    // Wire up the scan engine
    let stats = Arc::new(ScanStats::new(config.scan.exits.len() as u64));
    let (completion_tx, completion_rx) = completion_channel();
    let handler = Arc::new(EventHandler::new(
        Arc::clone(&client) as Arc<dyn ControlChannel>,
        module,
        Arc::clone(&stats),
        config.socks.address,
        completion_tx,
    ));
    let mut shutdown_rx = handler.subscribe_shutdown();

    let reader_handle = tokio::spawn(run_completion_reader(
        completion_rx,
        Arc::clone(&handler),
    ));

    info!(
        "Scanning {} exits through SOCKS endpoint {}",
        config.scan.exits.len(),
        config.socks.address
    );

    let builder_handle = tokio::spawn(build_circuits(
        Arc::clone(&client),
        config,
        Arc::clone(&handler),
    ));

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    // Main event loop: dispatch control events until the scan completes or a
    // signal arrives
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => handler.handle_event(event).await,
                    None => {
                        error!("Control connection lost");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, initiating shutdown...");
                break;
            }
            _ = wait_for_sigterm() => {
                info!("Received SIGTERM, initiating shutdown...");
                break;
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");

    builder_handle.abort();
    handler.workers().terminate_all();
    reader_handle.abort();

    let snapshot = stats.snapshot();
    info!(
        "Final stats: {}/{} circuits built, {} failed, {} workers finished ({:.1}% of requested circuits accounted for)",
        snapshot.successful_circuits,
        snapshot.total_circuits,
        snapshot.failed_circuits,
        snapshot.finished_workers,
        snapshot.progress_percent()
    );
    info!("Scan ran for {:.2}s", snapshot.elapsed_secs);

    info!("Shutdown complete");

    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
