#![forbid(unsafe_code)]

mod bus;
mod constants;
mod error;
mod mapping;
mod service;
mod settings;
mod snapshot;
mod types;

use anyhow::{Context, Result};
use clap::Parser;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use tracing::{Level as TraceLevel, info, warn};
use tracing_subscriber::FmtSubscriber;

use bus::{BusCommand, BusRequest, BusResponse, BusServer, ServiceInfo};
use service::ServiceRegistry;
use settings::{SettingRegistry, SettingStore, propagator};
use snapshot::SnapshotReader;

/// Bridge Simarine Pico sensor snapshots onto the local field bus
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Set logging level to debug
    #[arg(short, long)]
    debug: bool,

    /// Sensor snapshot file to poll
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Durable settings file
    #[arg(long)]
    store_file: Option<PathBuf>,

    /// Bus socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds between snapshot refreshes
    #[arg(long, default_value_t = constants::refresh::DEFAULT_INTERVAL_SECS)]
    interval: u64,
}

/// Ceiling on how long the main loop sleeps between wakeups, so a
/// shutdown signal is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(500);

fn handle_request(request: &BusRequest, services: &ServiceRegistry) -> BusResponse {
    match request {
        BusRequest::ListServices => BusResponse::Services(
            services
                .iter()
                .map(|s| ServiceInfo {
                    name: s.name.clone(),
                    bus_name: s.bus_name.clone(),
                    instance: s.instance,
                })
                .collect(),
        ),

        BusRequest::GetValue { service, path } => {
            match services.get(service).and_then(|s| s.value(path)) {
                Some(value) => BusResponse::Value(value),
                None => BusResponse::Error(format!("no such field {service}{path}")),
            }
        }

        BusRequest::SetValue { service, path, value } => {
            let Some(field) = services.get(service).and_then(|s| s.field(path)) else {
                return BusResponse::Error(format!("no such field {service}{path}"));
            };
            match field.borrow_mut().write(value.clone()) {
                Ok(()) => BusResponse::Ok,
                Err(e) => {
                    warn!(service = %service, path = %path, value = %value, error = %e,
                          "rejected field write");
                    BusResponse::Error(e.to_string())
                }
            }
        }

        BusRequest::Ping => BusResponse::Pong,

        // Acknowledged here; the main loop breaks after replying
        BusRequest::Shutdown => BusResponse::Ok,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Log level from environment variable, --debug overrides
    let log_level = if args.debug {
        TraceLevel::DEBUG
    } else {
        match std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .to_lowercase()
            .as_str()
        {
            "trace" => TraceLevel::TRACE,
            "debug" => TraceLevel::DEBUG,
            "warn" => TraceLevel::WARN,
            "error" => TraceLevel::ERROR,
            _ => TraceLevel::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    info!(version = env!("CARGO_PKG_VERSION"), "pico-bridge is starting up");

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    // Durable storage first: nothing works without it
    let store_path = args.store_file.unwrap_or_else(SettingStore::default_path);
    let store = SettingStore::open(&store_path).context("durable settings store unavailable")?;
    info!(path = %store.path().display(), "opened settings store");
    let store = Rc::new(RefCell::new(store));

    let mut services = ServiceRegistry::new();
    let mut setting_registry = SettingRegistry::new();
    service::build_devices(&mut services, &mut setting_registry)
        .context("failed to build device table")?;

    // Two-phase: every binding collected above, registered with the store
    // as a whole, then the durable values applied back onto the fields
    setting_registry
        .initialize(&mut store.borrow_mut())
        .context("failed to initialize settings")?;
    let setting_registry = Rc::new(setting_registry);
    propagator::wire(&store, &setting_registry);

    let socket_path = match args.socket {
        Some(path) => path,
        None => bus::default_socket_path()?,
    };
    let server = BusServer::bind_to(socket_path)?;
    let (bus_tx, bus_rx) = mpsc::channel();
    let _listener = bus::spawn_listener(server, bus_tx);

    let data_path = args
        .data_file
        .unwrap_or_else(|| PathBuf::from(constants::snapshot::DATA_FILE));
    let reader = SnapshotReader::new(data_path);
    let interval = Duration::from_secs(args.interval.max(1));

    // First refresh immediately so the readings appear without waiting a
    // full period
    mapping::refresh(&services, &reader);
    let mut next_refresh = Instant::now() + interval;

    info!(interval_secs = interval.as_secs(), "entering main loop");
    loop {
        if term.load(Ordering::Relaxed) {
            info!("signal received, shutting down");
            break;
        }

        let now = Instant::now();
        if now >= next_refresh {
            mapping::refresh(&services, &reader);
            propagator::tick(&store);
            next_refresh = now + interval;
            continue;
        }

        match bus_rx.recv_timeout((next_refresh - now).min(MAX_WAIT)) {
            Ok(BusCommand { request, reply }) => {
                let shutdown = matches!(request, BusRequest::Shutdown);
                let response = handle_request(&request, &services);
                if reply.send(response).is_err() {
                    warn!("bus client went away before reply");
                }
                if shutdown {
                    info!("shutdown requested via bus");
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!("bus listener stopped, exiting");
                break;
            }
        }
    }

    Ok(())
}
