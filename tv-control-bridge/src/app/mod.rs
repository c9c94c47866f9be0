use crate::bridge::legacy::LegacyBridge;
use crate::config::Config;
use crate::controller::{DeviceController, DeviceEvent};
use crate::server::CommandRequest;
use crate::upnp::HttpUpnpFactory;
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    let bridge = Arc::new(LegacyBridge::new(
        config.tv.host.clone(),
        config.tv.port,
        config.identity(),
        Duration::from_millis(config.tv.timeout_ms),
    ));
    let upnp = Arc::new(HttpUpnpFactory::new()?);
    let (mut controller, mut events) =
        DeviceController::new(config.controller_options()?, bridge, upnp);

    tracing::info!(
        host = %config.tv.host,
        name = %config.tv.name,
        telemetry = config.tv.rendering_control_location.is_some(),
        "controlling TV"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, mut command_rx) = mpsc::channel::<CommandRequest>(16);

    let server_task = if config.server.enabled {
        let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port).parse()?;
        let token = config
            .server
            .token
            .clone()
            .unwrap_or_else(|| generate_token(32));
        println!("TV state: http://{}/state?token={}", addr, token);

        let rx = controller.subscribe();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = crate::server::start(addr, token, rx, command_tx, shutdown).await {
                tracing::error!(error = %err, "api server failed");
            }
        }))
    } else {
        drop(command_tx);
        None
    };

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.tick().await;
            }
            request = command_rx.recv(), if commands_open => {
                match request {
                    Some(CommandRequest { command, reply }) => {
                        tracing::debug!(?command, "command received");
                        let outcome = controller.execute(command).await;
                        if let Err(err) = &outcome {
                            tracing::warn!(error = %err, "command failed");
                        }
                        let _ = reply.send(outcome);
                    }
                    None => commands_open = false,
                }
            }
            Some(event) = events.recv() => {
                handle_event(&mut controller, event);
            }
            _ = &mut ctrl_c => {
                tracing::info!("shutdown: ctrl-c");
                break;
            }
        }
    }

    controller.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Some(task) = server_task {
        let _ = task.await;
    }
    Ok(())
}

fn handle_event(controller: &mut DeviceController, event: DeviceEvent) {
    match event {
        DeviceEvent::ReauthRequired => {
            tracing::error!(
                "TV denied access; allow this client on the TV and update the configuration"
            );
            controller.publish();
        }
        DeviceEvent::TelemetryChanged => {
            controller.refresh_telemetry();
            controller.publish();
        }
        DeviceEvent::AppsChanged => controller.publish(),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
