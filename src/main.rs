//! huddle - Room-based voice chat client

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use huddle::audio::{
    list_input_devices, list_output_devices, AudioConfig, AudioDevice, CpalBackend, DeviceId,
};
use huddle::client::{ClientConfig, ClientEvents, ClientSession, JitterBufferConfig, OverflowPolicy};
use huddle::protocol::{ClientCommand, ClientId, Framing};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Room-based voice chat over a TCP relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices,

    /// Connect to a relay server and chat
    Connect(ConnectArgs),
}

#[derive(Args)]
struct ConnectArgs {
    /// Relay server address (HOST:PORT)
    #[arg(short, long, default_value = "127.0.0.1:5000", env = "HUDDLE_SERVER")]
    server: String,

    /// Room to join right away
    #[arg(short, long)]
    room: Option<String>,

    /// Create the room given with --room instead of joining it
    #[arg(long, requires = "room")]
    create: bool,

    /// Audio framing sent to the server (tagged or legacy)
    #[arg(long, default_value = "tagged", env = "HUDDLE_FRAMING")]
    framing: Framing,

    /// Sample rate in Hz
    #[arg(long, default_value = "44100")]
    sample_rate: u32,

    /// Number of channels
    #[arg(long, default_value = "1")]
    channels: u16,

    /// Frame size in samples
    #[arg(long, default_value = "4096")]
    frame_size: u32,

    /// Input device name (use 'devices' to see available devices)
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name (use 'devices' to see available devices)
    #[arg(long)]
    output_device: Option<String>,

    /// Frames buffered per sender before playback starts
    #[arg(long, default_value = "2")]
    fill_threshold: usize,

    /// Maximum frames buffered per sender
    #[arg(long, default_value = "8")]
    max_depth: usize,

    /// On overflow discard the incoming frame instead of the oldest one
    #[arg(long)]
    drop_newest: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn print_device(device: &AudioDevice) {
    let default_marker = if device.is_default { " (default)" } else { "" };
    let rates: Vec<String> = device
        .supported_sample_rates
        .iter()
        .map(|rate| rate.to_string())
        .collect();
    let id = if device.id.0 != device.name {
        format!(" (id: {})", device.id.0)
    } else {
        String::new()
    };
    println!(
        "  - {}{}{} [{} Hz]",
        device.name,
        id,
        default_marker,
        rates.join(", ")
    );
}

fn list_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        print_device(&device);
    }

    println!("\nOutput devices:");
    for device in list_output_devices() {
        print_device(&device);
    }
}

/// What the console loop reacts to besides stdin
enum UiEvent {
    Joined,
    Left,
    Disconnected,
}

/// Prints server output and forwards room changes to the console loop
struct ConsoleEvents {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ClientEvents for ConsoleEvents {
    fn on_control_line(&self, line: &str) {
        println!("{}", line);
    }

    fn on_room_list(&self, rooms: &str) {
        println!("Rooms: {}", rooms);
    }

    fn on_joined(&self, room: &str) {
        println!("Joined room: {}", room);
        let _ = self.tx.send(UiEvent::Joined);
    }

    fn on_left(&self, room: &str) {
        println!("Left room: {}", room);
        let _ = self.tx.send(UiEvent::Left);
    }

    fn on_assigned_id(&self, id: ClientId) {
        println!("You are participant {}", id);
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(UiEvent::Disconnected);
    }
}

async fn run_connect(args: ConnectArgs) -> Result<()> {
    let audio = AudioConfig {
        sample_rate: args.sample_rate,
        channels: args.channels,
        frame_size: args.frame_size,
    };
    let backend = Arc::new(CpalBackend::new(
        audio.clone(),
        args.input_device.map(DeviceId),
        args.output_device.map(DeviceId),
    ));

    let config = ClientConfig {
        server_addr: args.server.clone(),
        framing: args.framing,
        audio,
        jitter: JitterBufferConfig {
            fill_threshold: args.fill_threshold,
            max_depth: args.max_depth,
            overflow: if args.drop_newest {
                OverflowPolicy::DropNewest
            } else {
                OverflowPolicy::DropOldest
            },
        }
        .validated(),
        ..Default::default()
    };

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let events = Arc::new(ConsoleEvents { tx: ui_tx });
    let mut session = ClientSession::connect(config, backend, events)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;

    if let Some(room) = args.room {
        let command = if args.create {
            ClientCommand::Create(room)
        } else {
            ClientCommand::Join(room)
        };
        session.send_command(command).await?;
    }

    println!("Connected to {} from {}", args.server, session.local_addr());
    println!("Commands: REQ:ROOM_LIST, NEW:<name>, <name> to join, LEAVE, q to quit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let input = line.trim();
                if input.eq_ignore_ascii_case("q") || input.eq_ignore_ascii_case("quit") {
                    break;
                }
                match ClientCommand::parse(input) {
                    Some(ClientCommand::Leave) => session.leave().await?,
                    Some(command) => session.send_command(command).await?,
                    None => {}
                }
            }
            event = ui_rx.recv() => match event {
                Some(UiEvent::Joined) => {
                    if let Err(e) = session.start_streaming() {
                        warn!("Failed to start audio: {}", e);
                    }
                }
                Some(UiEvent::Left) => session.stop_streaming().await,
                Some(UiEvent::Disconnected) | None => {
                    println!("Disconnected from server");
                    break;
                }
            },
        }
    }

    session.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Connect(args) => {
            info!("Connecting to {}", args.server);
            run_connect(args).await?;
        }
    }

    Ok(())
}
