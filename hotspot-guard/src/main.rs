// Hotspot client session daemon and control CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hotspot_guard::{
    config::{self, load_config, parse_client_address},
    control::{self, ControlRequest, ControlResponse},
    controller::{self, ControllerHandle, ControllerSettings, SessionController, STATION_EVENT_CHANNEL_SIZE},
    event_log::EventLog,
    filter::{FilterAdapter, IptablesFilter},
    station_monitor::{StationEvent, StationMonitor},
    types::DEFAULT_AUTO_DISCONNECT_MINUTES,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::{mpsc, watch};

#[derive(Parser)]
#[command(name = "hotspot-guard")]
#[command(about = "Client session and temporary-ban controller for a Wi-Fi hotspot", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/hotspot-guard/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller daemon
    Run,
    /// List connected clients, longest-connected first
    List,
    /// Print the number of connected clients
    Count,
    /// Temporarily block a client
    Kick {
        /// Client IP address
        address: String,
    },
    /// Lift a client's block immediately
    Unban {
        /// Client IP address
        address: String,
    },
    /// Disconnect clients connected longer than a timeout (0 disables)
    AutoDisconnect {
        #[arg(default_value_t = DEFAULT_AUTO_DISCONNECT_MINUTES)]
        timeout_minutes: u64,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Build custom Tokio runtime with limited thread pool
    // 2 threads is sufficient: 1 for the controller loop, 1 for monitor + process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hotspot-guard")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    match args.command {
        Command::Run => runtime.block_on(run_daemon(&args.config)).map(|_| ExitCode::SUCCESS),
        command => runtime.block_on(run_client(&args.config, command)),
    }
}

/// Execute one administrative command against the running daemon
async fn run_client(config_path: &Path, command: Command) -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let socket_path = config::socket_path_for(config_path)?;

    let request = match command {
        Command::List => ControlRequest::List,
        Command::Count => ControlRequest::Count,
        Command::Kick { address } => {
            // Reject locally before bothering the daemon
            if let Err(e) = parse_client_address(&address) {
                eprintln!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
            ControlRequest::Kick { address }
        }
        Command::Unban { address } => {
            if let Err(e) = parse_client_address(&address) {
                eprintln!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
            ControlRequest::Unban { address }
        }
        Command::AutoDisconnect { timeout_minutes } => {
            if let Err(e) = config::auto_disconnect_timeout(timeout_minutes) {
                eprintln!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
            ControlRequest::AutoDisconnect { timeout_minutes }
        }
        Command::Run => anyhow::bail!("'run' is not a client command"),
    };

    let response = match control::send_request(&socket_path, &request).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Daemon unreachable at {:?}: {:#}", socket_path, e);
            return Ok(unreachable_exit(&request));
        }
    };

    match (&request, response) {
        (_, ControlResponse::Stations { stations }) => {
            for station in stations {
                match station.banned_secs {
                    Some(remaining) => println!(
                        "{}\t{}s\tbanned ({}s left)",
                        station.address, station.connected_secs, remaining
                    ),
                    None => println!("{}\t{}s", station.address, station.connected_secs),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        (_, ControlResponse::Count { count }) => {
            println!("{}", count);
            Ok(ExitCode::SUCCESS)
        }
        (ControlRequest::Kick { address }, ControlResponse::Accepted) => {
            println!("Kick requested for {}", address);
            Ok(ExitCode::SUCCESS)
        }
        (ControlRequest::Unban { address }, ControlResponse::Accepted) => {
            println!("Unban requested for {}", address);
            Ok(ExitCode::SUCCESS)
        }
        (ControlRequest::AutoDisconnect { timeout_minutes: 0 }, ControlResponse::Accepted) => {
            println!("Auto-disconnect disabled");
            Ok(ExitCode::SUCCESS)
        }
        (ControlRequest::AutoDisconnect { timeout_minutes }, ControlResponse::Accepted) => {
            println!("Auto-disconnect after {} minutes", timeout_minutes);
            Ok(ExitCode::SUCCESS)
        }
        (_, ControlResponse::Accepted) => Ok(ExitCode::SUCCESS),
        (_, ControlResponse::Error { message }) => {
            eprintln!("{}", message);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// `list` and `count` always succeed; an absent daemon means no clients
fn unreachable_exit(request: &ControlRequest) -> ExitCode {
    match request {
        ControlRequest::List => ExitCode::SUCCESS,
        ControlRequest::Count => {
            println!("0");
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("hotspot-guard daemon is not running");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(config_path: &Path) -> Result<()> {
    // Load configuration
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting hotspot-guard daemon");
    log::info!("Hotspot interface: {}", config.general.interface);
    log::info!("Kick grace: {}s", config.policy.manual_kick_grace_secs);
    match config.policy.auto_disconnect_minutes {
        Some(minutes) => log::info!("Auto-disconnect: after {} minutes", minutes),
        None => log::info!("Auto-disconnect: off"),
    }

    // Initialize components
    let filter = FilterAdapter::new(IptablesFilter::new(), config.filter.command_timeout());
    let mut session_controller =
        SessionController::new(filter, ControllerSettings::from_config(&config));

    if let Some(path) = &config.general.event_log {
        let event_log = EventLog::open(path).context("Failed to open event log")?;
        log::info!("Recording client activity to {:?}", event_log.path());
        session_controller = session_controller.with_event_log(event_log);
    }

    let station_monitor = StationMonitor::new(
        config.general.interface.clone(),
        config.filter.station_poll_interval(),
    )
    .context("Failed to create station monitor")?;

    // Channels for communication
    let (station_tx, station_rx) = mpsc::channel::<StationEvent>(STATION_EVENT_CHANNEL_SIZE);
    let (handle, request_rx) = ControllerHandle::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = control::bind(&config.general.socket_path)?;
    log::info!("Control socket: {:?}", config.general.socket_path);

    // Spawn station monitor task
    // Store the handle so we can monitor it for failures
    let mut monitor_handle = tokio::spawn(async move {
        if let Err(e) = station_monitor.monitor(station_tx).await {
            log::error!("Station monitor error: {}", e);
            Err::<(), anyhow::Error>(e)
        } else {
            Ok(())
        }
    });

    let mut controller_handle = tokio::spawn(controller::run(
        session_controller,
        station_rx,
        request_rx,
        shutdown_rx.clone(),
    ));

    let server_handle = tokio::spawn(control::serve(listener, handle, shutdown_rx));

    log::info!("Daemon started successfully");

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let mut failure = None;
    tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
        }

        // Monitor task failures are fatal (fail-fast approach)
        monitor_result = &mut monitor_handle => {
            match monitor_result {
                Ok(Ok(())) => log::error!("Station monitor task exited unexpectedly"),
                Ok(Err(e)) => log::error!("Station monitor task failed: {}", e),
                Err(e) => log::error!("Station monitor task panicked: {}", e),
            }
            failure = Some("Station monitor task terminated, aborting daemon for systemd restart");
        }

        controller_result = &mut controller_handle => {
            if let Err(e) = controller_result {
                log::error!("Session controller task panicked: {}", e);
            }
            failure = Some("Session controller terminated, aborting daemon for systemd restart");
        }
    }

    log::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    monitor_handle.abort();

    // Let the controller finish any in-flight filter call
    if !controller_handle.is_finished() {
        if let Err(e) = controller_handle.await {
            log::error!("Session controller task failed during shutdown: {}", e);
        }
    }
    let _ = server_handle.await;

    if let Err(e) = std::fs::remove_file(&config.general.socket_path) {
        log::debug!("Failed to remove control socket: {}", e);
    }

    log::info!("Shutdown complete");

    match failure {
        Some(reason) => anyhow::bail!(reason),
        None => Ok(()),
    }
}
