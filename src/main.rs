use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerlink::call::CallCommand;
use peerlink::config::ClientConfig;
use peerlink::events::Notification;
use peerlink::room::ReadinessRoom;
use peerlink::CallClient;

#[derive(Parser)]
#[command(name = "peerlink", about = "P2P video call client")]
struct Cli {
    /// Relay base URL, e.g. wss://relay.example.com
    #[arg(long)]
    relay_url: String,

    /// Session id to join
    #[arg(long)]
    session: String,

    /// Bearer token for the relay
    #[arg(long)]
    token: String,

    /// Display name announced when calling
    #[arg(long, default_value = "Anonymous")]
    name: String,

    /// Initiate the call instead of waiting for one
    #[arg(long)]
    call: bool,

    /// Accept the first incoming call automatically
    #[arg(long)]
    auto_accept: bool,

    /// Camera index for the readiness check
    #[arg(long)]
    camera: Option<u32>,

    /// Microphone name for the readiness check
    #[arg(long)]
    microphone: Option<String>,

    /// Skip the device readiness checks
    #[arg(long)]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = ClientConfig::new(&cli.relay_url, &cli.session, &cli.token);
    cfg.display_name = cli.name.clone();

    if !cli.skip_checks {
        let mut room = ReadinessRoom::new(cfg.probe_timeout);
        room.select_camera(cli.camera);
        room.select_microphone(cli.microphone.clone());

        for device in room.list_audio_devices() {
            info!(
                "{} device: {}{}",
                if device.is_input { "input" } else { "output" },
                device.name,
                if device.is_default { " (default)" } else { "" },
            );
        }
        for camera in room.list_cameras() {
            info!("camera {}: {}", camera.index, camera.name);
        }

        let (camera_check, _preview) = room.test_camera().await;
        info!("camera check: {:?}", camera_check);
        let microphone_check = room.test_microphone().await;
        info!("microphone check: {:?}", microphone_check);

        if !room.can_join() {
            eprintln!("both camera and microphone checks failed, refusing to join");
            std::process::exit(1);
        }
    }

    let client = CallClient::connect(cfg).await?;
    let handle = client.handle();
    let mut notifications = client.subscribe();

    handle.send(CallCommand::EnterRoom);
    if cli.call {
        info!("initiating call as {}", cli.name);
        handle.send(CallCommand::StartCall);
    } else {
        info!("waiting for incoming call");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.send(CallCommand::EndCall);
                break;
            }
            notification = notifications.recv() => {
                let Ok(notification) = notification else { break };
                match &notification {
                    Notification::IncomingCall { caller_name, .. } => {
                        if cli.auto_accept {
                            info!("accepting call from {}", caller_name);
                            handle.send(CallCommand::AcceptCall);
                        } else {
                            info!("incoming call from {} (restart with --auto-accept)", caller_name);
                        }
                    }
                    Notification::CallEnded { by_remote } => {
                        info!("call ended{}", if *by_remote { " by remote peer" } else { "" });
                    }
                    Notification::CallRejected { reason } => {
                        info!("call rejected: {}", reason.as_deref().unwrap_or("no reason given"));
                    }
                    Notification::MediaWarning { detail } => warn!("{}", detail),
                    other => info!("{:?}", other),
                }
            }
        }
    }

    client.close();
    Ok(())
}
