use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use meetroom_client::audio::CpalDevices;
use meetroom_client::chat::{ChatApi, ChatEvent, StreamingChatClient};
use meetroom_client::levels::AudioLevelRegistry;
use meetroom_client::media::MediaKind;
use meetroom_client::room::{LocalMediaController, LOCAL_SUBJECT};
use meetroom_client::rtc::RtcTransportFactory;
use meetroom_client::settings::TomlSettings;
use meetroom_client::{Config, RoomEvent, RoomSession, SessionStatus, SignalingClient};

#[derive(Parser)]
#[command(name = "meetroom", version, about = "Meeting room client")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a meeting room and stay until Ctrl-C
    Join {
        meeting_id: String,
        #[arg(long)]
        name: Option<String>,
        /// Join with the microphone muted
        #[arg(long)]
        muted: bool,
        /// Join without opening a microphone
        #[arg(long)]
        listen_only: bool,
    },
    /// Send one message to the assistant and stream the reply
    Chat {
        message: String,
        /// Existing session id; a new session is created when omitted
        #[arg(long)]
        session: Option<String>,
    },
    /// List audio devices, optionally changing the stored selection
    Devices {
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        gain: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load config")?;

    match cli.command {
        Command::Join {
            meeting_id,
            name,
            muted,
            listen_only,
        } => join(&config, meeting_id, name, muted, listen_only).await,
        Command::Chat { message, session } => chat(&config, message, session).await,
        Command::Devices {
            input,
            output,
            gain,
        } => devices(input, output, gain),
    }
}

fn local_media(devices: Arc<CpalDevices>) -> Result<LocalMediaController> {
    let path = TomlSettings::default_path()?;
    let settings = TomlSettings::open(path).context("Failed to open settings")?;
    Ok(LocalMediaController::new(devices, Arc::new(settings)))
}

async fn join(
    config: &Config,
    meeting_id: String,
    name: Option<String>,
    muted: bool,
    listen_only: bool,
) -> Result<()> {
    let devices = Arc::new(CpalDevices::new());
    let source = Arc::new(devices.audio_source());
    let factory = RtcTransportFactory::new()
        .context("Failed to set up WebRTC")?
        .with_taps(devices.taps());
    let media = local_media(devices)?;

    let mut signaling = SignalingClient::connect(&config.signaling.url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.signaling.url))?;

    let display_name = name
        .or_else(|| config.signaling.display_name.clone())
        .unwrap_or_else(|| "Guest".to_string());
    let mut room = RoomSession::new(
        meeting_id,
        display_name,
        signaling.sender(),
        Arc::new(factory),
        media,
    )
    .with_ice_servers(config.ice.servers.clone());

    let levels = AudioLevelRegistry::new(source, config.audio.thresholds)
        .start(config.audio.analysis_interval());

    if !listen_only {
        match room.open_microphone() {
            Ok(()) => {
                if let Some(stream) = room.local_stream() {
                    levels.register(LOCAL_SUBJECT, stream.clone());
                }
            }
            Err(e) => warn!("Joining without a microphone: {}", e),
        }
    }

    let handle = room.handle();
    let mut events = room.subscribe();
    let mut speaking = levels.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(RoomEvent::StatusChanged(SessionStatus::Joined)) => {
                        info!("Joined; press Ctrl-C to leave");
                        if muted {
                            let _ = handle.set_muted(true);
                        }
                    }
                    Ok(RoomEvent::RemoteStream { key, stream }) if key.kind == MediaKind::Audio => {
                        levels.register(key.participant_id, stream);
                    }
                    Ok(RoomEvent::ParticipantLeft(id)) => {
                        levels.unregister(id.as_str());
                        info!("{} left", id);
                    }
                    Ok(RoomEvent::Error { message, code }) => {
                        warn!("Room error: {} ({})", message, code.as_deref().unwrap_or("-"));
                    }
                    Ok(event) => debug!("{:?}", event),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} room events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = speaking.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let active: Vec<String> = speaking
                        .borrow()
                        .iter()
                        .filter(|(_, level)| **level >= 2)
                        .map(|(id, _)| id.clone())
                        .collect();
                    if !active.is_empty() {
                        info!("Speaking: {}", active.join(", "));
                    }
                }
            }
        }
    });

    let leave = room.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = leave.leave();
        }
    });

    room.run(&mut signaling).await?;
    info!("Session finished: {:?}", room.status());
    drop(room);
    let _ = watcher.await;
    Ok(())
}

async fn chat(config: &Config, message: String, session: Option<String>) -> Result<()> {
    let api = ChatApi::new(&config.chat.base_url, config.chat.token.clone());
    let session_id = match session {
        Some(id) => id,
        None => {
            let record = api
                .create_session(Some("meetroom"))
                .await
                .context("Failed to create chat session")?;
            info!("Created chat session {}", record.id);
            record.id
        }
    };

    let mut client = StreamingChatClient::new(Arc::new(api), config.chat.backoff());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .start_turn(&session_id, &message, move |event| {
            let _ = tx.send(event);
        })
        .await;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if print_chat_event(event) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                client.cancel(&session_id).await;
                println!();
                break;
            }
        }
    }
    Ok(())
}

/// Returns true once the turn is over.
fn print_chat_event(event: ChatEvent) -> bool {
    match event {
        ChatEvent::Message(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
            false
        }
        ChatEvent::Status(status) => {
            info!("{}", status);
            false
        }
        ChatEvent::HitlRequest(request) => {
            println!("\n[confirmation needed] {}: {}", request.tool_name, request.message);
            false
        }
        ChatEvent::Retrying { attempt, delay } => {
            warn!("Stream dropped, retry {} in {:?}", attempt, delay);
            false
        }
        ChatEvent::Done => {
            println!();
            true
        }
        ChatEvent::Error(message) => {
            eprintln!("\nChat failed: {}", message);
            true
        }
    }
}

fn devices(input: Option<String>, output: Option<String>, gain: Option<f32>) -> Result<()> {
    let mut media = local_media(Arc::new(CpalDevices::new()))?;

    if let Some(id) = input.as_deref() {
        media.select_input_device(Some(id))?;
    }
    if let Some(id) = output.as_deref() {
        media.select_output_device(Some(id))?;
    }
    if let Some(gain) = gain {
        let applied = media.set_mic_gain(gain)?;
        println!("Microphone gain: {:.2}", applied);
    }

    println!("Inputs:");
    for device in media.list_input_devices()? {
        let selected = media.selected_input_device() == Some(device.id.as_str());
        println!(
            "  {} {}{}",
            if selected { "*" } else { " " },
            device.name,
            if device.is_default { " (default)" } else { "" }
        );
    }
    println!("Outputs:");
    for device in media.list_output_devices()? {
        let selected = media.selected_output_device() == Some(device.id.as_str());
        println!(
            "  {} {}{}",
            if selected { "*" } else { " " },
            device.name,
            if device.is_default { " (default)" } else { "" }
        );
    }
    Ok(())
}
