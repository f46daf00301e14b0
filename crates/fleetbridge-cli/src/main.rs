//! `fleetbridge` – runs the device bridges on this host.
//!
//! 1. Loads `~/.fleetbridge/config.toml`, writing first-run defaults (and a
//!    fresh client id) when the file is absent.
//! 2. Connects every enabled bridge (camera, sentry) on its own task.  Each
//!    waits in discovery until its device shows up.
//! 3. Runs until the operator presses **Enter** or **Ctrl-C**, or every
//!    bridge has stopped on its own, then quits the bridges and exits.

mod config;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use fleetbridge_runtime::{init_tracing, Bridge, BridgeHandle, CameraBridge, DeviceBridge, SentryBridge};
use fleetbridge_types::LinkError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

fn main() {
    let _telemetry = init_tracing("fleetbridge");

    print_banner();

    let cfg = match config::load_or_create() {
        Ok((cfg, created)) => {
            let verb = if created { "Config created at" } else { "Config loaded from" };
            println!("  {verb} {}", config::config_path().display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    print_summary(&cfg);

    if !cfg.camera.enabled && !cfg.sentry.enabled {
        println!("  {}", "Both bridges are disabled; nothing to run.".yellow());
        return;
    }

    // ── Quit signal: Enter or Ctrl-C ──────────────────────────────────────
    let (quit_tx, quit_rx) = watch::channel(false);
    let quit_tx = Arc::new(quit_tx);

    let ctrlc_tx = quit_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the bridges down …".yellow().bold());
        ctrlc_tx.send_replace(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use Enter to quit");
    }

    let enter_tx = quit_tx.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        // EOF means there is no operator terminal; only Ctrl-C can quit then.
        if let Ok(n) = std::io::stdin().read_line(&mut line)
            && n > 0
        {
            enter_tx.send_replace(true);
        }
    });

    println!("  Press {} to quit.\n", "Enter".bold().cyan());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start the async runtime".red(), e);
            return;
        }
    };
    runtime.block_on(supervise(cfg, quit_rx));
    println!("  {}", "✓ All bridges stopped.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// One bridge task.  `handle` resolves once the bridge has connected.
struct Launched {
    name: &'static str,
    handle: oneshot::Receiver<BridgeHandle>,
    task: JoinHandle<()>,
}

fn launch<D, F>(name: &'static str, connect: F) -> Launched
where
    D: DeviceBridge,
    F: Future<Output = Result<Bridge<D>, LinkError>> + Send + 'static,
{
    let (handle_tx, handle) = oneshot::channel();
    let task = tokio::spawn(async move {
        match connect.await {
            Ok(bridge) => {
                let _ = handle_tx.send(bridge.handle());
                bridge.start().await;
            }
            Err(e) => error!(bridge = name, error = %e, "bridge failed to connect"),
        }
    });
    Launched { name, handle, task }
}

async fn supervise(cfg: config::Config, mut quit: watch::Receiver<bool>) {
    let bridge_config = cfg.bridge_config();
    let mut launched = Vec::new();

    if cfg.camera.enabled {
        let bridge_config = bridge_config.clone();
        let settings = cfg.camera_settings();
        launched.push(launch("camera", async move {
            CameraBridge::connect(&bridge_config, &settings).await
        }));
    }
    if cfg.sentry.enabled {
        let bridge_config = bridge_config.clone();
        launched.push(launch("sentry", async move {
            SentryBridge::connect(&bridge_config).await
        }));
    }

    loop {
        if *quit.borrow() {
            info!("quit requested by operator");
            break;
        }
        if launched.iter().all(|l| l.task.is_finished()) {
            info!("every bridge has stopped");
            break;
        }
        let _ = tokio::time::timeout(Duration::from_millis(250), quit.changed()).await;
    }

    for Launched { name, mut handle, task } in launched {
        match handle.try_recv() {
            Ok(bridge) => {
                bridge.quit().await;
                println!("  {} {name} bridge stopped", "✓".green());
            }
            Err(_) => {
                // Still waiting for its device, or never connected.
                task.abort();
                println!("  {} {name} bridge was not connected", "·".dimmed());
            }
        }
        if let Err(e) = task.await
            && !e.is_cancelled()
        {
            error!(bridge = name, error = %e, "bridge task panicked");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║             FleetBridge              ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!(
        "  {} {}",
        "fleetbridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Cloud ↔ LAN bridge for ESP32 camera and sentry devices");
    println!();
}

fn print_summary(cfg: &config::Config) {
    let state = |enabled: bool| if enabled { "enabled".green() } else { "disabled".dimmed() };
    println!("  Control server: {}", cfg.control_url.dimmed());
    println!(
        "  Camera bridge:  {} (video on {}:{})",
        state(cfg.camera.enabled),
        cfg.camera.advertise_address,
        cfg.camera.video_port
    );
    println!("  Sentry bridge:  {}", state(cfg.sentry.enabled));
    println!();
}
