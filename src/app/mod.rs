use crate::channel;
use crate::config::{Config, StationConfig, DEFAULT_PORT};
use crate::model::{ConnectionTarget, PowerState, SessionState, StationStatus};
use crate::power::PowerController;
use crate::stream::StreamOptions;
use std::sync::Arc;
use tokio::time::Duration;

const STATUS_CONNECT_WAIT: Duration = Duration::from_secs(5);
const STATUS_REPORT_WAIT: Duration = Duration::from_secs(1);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);

    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;

    if let Some(ref command) = command {
        if command == "check" {
            return handle_check(&config).await;
        }
        if command == "on" {
            return handle_power(&config, PowerState::On).await;
        }
        if command == "off" {
            return handle_power(&config, PowerState::Off).await;
        }
        if command == "status" {
            return handle_status(&config).await;
        }
        return Err(format!(
            "unknown command: {command} (expected check, on, off, status or config-init)"
        )
        .into());
    }

    run_bridge(&config).await
}

async fn run_bridge(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let options = stream_options(config);
    let mut controllers = Vec::new();

    for station in &config.stations {
        let target = station.target();
        if let Err(err) = channel::check_reachable(&target, options.connect_timeout).await {
            tracing::error!(station = %target, error = %err, "station not added");
            continue;
        }

        let controller = Arc::new(PowerController::new(target, options.clone()));
        let mut changes = controller.subscribe();
        let title = station.title();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                println!(
                    "{} [{}]: track power {} ({:?})",
                    title,
                    change.target.unique_id(),
                    change.state,
                    change.source
                );
            }
        });

        controller.activate();
        controllers.push(controller);
    }

    if controllers.is_empty() {
        return Err("no reachable command station".into());
    }
    println!("bridging {} command station(s), ctrl-c to stop", controllers.len());

    tokio::signal::ctrl_c().await?;
    eprintln!("shutdown: ctrl-c");
    for controller in &controllers {
        controller.deactivate().await;
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let targets = match std::env::args().nth(2) {
        Some(arg) => vec![parse_target(&arg)?],
        None => config.stations.iter().map(StationConfig::target).collect(),
    };

    let mut failed = 0;
    for target in &targets {
        match channel::check_reachable(target, config.stream.connect_timeout()).await {
            Ok(()) => println!("{}: ok", target.unique_id()),
            Err(err) => {
                println!("{}: {}", target.unique_id(), err);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} of {} station(s) unreachable", targets.len()).into());
    }
    Ok(())
}

async fn handle_power(config: &Config, state: PowerState) -> Result<(), Box<dyn std::error::Error>> {
    let options = stream_options(config);
    let mut failed = 0;
    for station in &config.stations {
        let controller = PowerController::new(station.target(), options.clone());
        let res = match state {
            PowerState::On => controller.turn_on().await,
            PowerState::Off => controller.turn_off().await,
        };
        match res {
            Ok(()) => println!("{}: track power {}", station.title(), state),
            Err(err) => {
                println!("{}: {}", station.title(), err);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} command(s) not delivered").into());
    }
    Ok(())
}

async fn handle_status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = stream_options(config);
    options.reconnect.max_attempts = 0;

    let mut statuses = Vec::new();
    for station in &config.stations {
        let controller = Arc::new(PowerController::new(station.target(), options.clone()));
        let mut changes = controller.subscribe();
        controller.activate();

        let mut session = controller.watch_session();
        let settled = matches!(
            tokio::time::timeout(
                STATUS_CONNECT_WAIT,
                session.wait_for(|s| *s == SessionState::Streaming || s.is_finished()),
            )
            .await,
            Ok(Ok(_))
        );
        if settled && controller.session_state() == SessionState::Streaming {
            // A station already off produces no change, so this wait may lapse.
            let _ = tokio::time::timeout(STATUS_REPORT_WAIT, changes.recv()).await;
        }
        changes.unsubscribe();

        let session = controller.session_state();
        controller.deactivate().await;
        statuses.push(StationStatus {
            id: controller.target().unique_id(),
            title: station.title(),
            power: controller.state(),
            session,
        });
    }

    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

fn stream_options(config: &Config) -> StreamOptions {
    StreamOptions {
        connect_timeout: config.stream.connect_timeout(),
        reconnect: config.stream.reconnect.clone(),
    }
}

fn parse_target(raw: &str) -> Result<ConnectionTarget, Box<dyn std::error::Error>> {
    let raw = raw.trim();
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>()?),
        None => (raw, DEFAULT_PORT),
    };
    if host.is_empty() || port == 0 {
        return Err(format!("invalid station address: {raw}").into());
    }
    Ok(ConnectionTarget::new(host, port))
}
