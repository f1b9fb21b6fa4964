//! auralive - real-time voice, screen and text conversations with the
//! Gemini Live API from the terminal.
//!
//! Capture, uplink, downlink and playback run as independent tasks around a
//! session orchestrator that transparently reconnects through a fallback
//! model list when the service sheds load.

#![forbid(unsafe_code)]

pub mod capture;
pub mod config;
pub mod device;
pub mod downlink;
pub mod events;
pub mod gemini;
pub mod playback;
pub mod queue;
pub mod session;
pub mod transport;
pub mod uplink;

/// PulseAudio capture/playback (enabled with the "devices" feature)
#[cfg(feature = "devices")]
pub mod audio;
/// Screen capture (enabled with the "devices" feature)
#[cfg(feature = "devices")]
pub mod screen;

use anyhow::Context;
use config::{Config, VideoMode};
use gemini::GeminiConnector;
use session::{Devices, SessionEvent, SessionHandle};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("auralive=info")),
        )
        .init();

    let mut config = Config::from_env()?;
    if let Some(mode) = parse_mode_arg()? {
        config.video_mode = mode;
    }

    info!(
        model = %config.model,
        mode = config.video_mode.as_str(),
        "starting auralive"
    );

    let devices = build_devices(&config);
    let connector = GeminiConnector::new(&config);
    let (handle, events, task) = session::start(config, connector, devices);

    let printer = tokio::spawn(print_events(events));
    let mut task = task;

    print_banner();
    let outcome = tokio::select! {
        // the session ended on its own (fatal error or exhausted fallbacks)
        result = &mut task => result,
        _ = run_repl(&handle) => task.await,
    };
    let _ = printer.await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::new(e)),
        Err(e) => Err(anyhow::Error::new(e)).context("session task panicked"),
    }
}

fn parse_mode_arg() -> anyhow::Result<Option<VideoMode>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--mode=") {
            return Ok(Some(value.parse()?));
        }
        if arg == "--mode" {
            let value = args.next().context("--mode requires a value")?;
            return Ok(Some(value.parse()?));
        }
    }
    Ok(None)
}

#[cfg(feature = "devices")]
fn build_devices(config: &Config) -> Devices {
    use tracing::warn;

    let mic = match audio::MicSource::new("auralive", config.send_sample_rate, config.chunk_samples)
    {
        Ok(mic) => Some(Box::new(mic) as Box<dyn device::FrameSource>),
        Err(e) => {
            warn!("microphone unavailable: {e}");
            None
        }
    };
    let speaker = match audio::SpeakerSink::new("auralive", config.receive_sample_rate) {
        Ok(speaker) => Some(Box::new(speaker) as Box<dyn device::MediaSink>),
        Err(e) => {
            warn!("speaker unavailable: {e}");
            None
        }
    };
    let screen = match screen::ScreenSource::new() {
        Ok(screen) => Some(Box::new(screen) as Box<dyn device::FrameSource>),
        Err(e) => {
            warn!("screen capture unavailable: {e}");
            None
        }
    };

    // no camera backend in this build; camera mode degrades with a diagnostic
    Devices {
        mic,
        camera: None,
        screen,
        speaker,
    }
}

#[cfg(not(feature = "devices"))]
fn build_devices(_config: &Config) -> Devices {
    tracing::warn!("built without device support; running a text-only session");
    Devices::none()
}

fn print_banner() {
    println!("auralive - type a message and press Enter");
    println!("commands: camera on/off | screen on/off | mode <camera|screen|both|none>");
    println!("          status | clear | q to quit");
}

async fn run_repl(handle: &SessionHandle) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => break,
        };
        let input = line.trim();
        match input {
            "" => continue,
            "q" | "quit" => break,
            "camera on" => {
                handle.enable_camera(true).await;
            }
            "camera off" => {
                handle.enable_camera(false).await;
            }
            "screen on" => {
                handle.enable_screen(true).await;
            }
            "screen off" => {
                handle.enable_screen(false).await;
            }
            "clear" => {
                handle.clear_conversation().await;
            }
            "status" => {
                if let Some(status) = handle.status().await {
                    println!("state:  {:?}", status.connection);
                    println!("model:  {}", status.active_model);
                    println!("mode:   {}", status.video_mode.as_str());
                    println!(
                        "camera: {} | screen: {}",
                        if status.camera_enabled { "on" } else { "off" },
                        if status.screen_enabled { "on" } else { "off" },
                    );
                    println!("memory: {} turns", status.window.len());
                }
            }
            _ => {
                if let Some(mode) = input.strip_prefix("mode ") {
                    match mode.parse() {
                        Ok(mode) => {
                            handle.set_video_mode(mode).await;
                        }
                        Err(e) => println!("{e}"),
                    }
                } else if !handle.inject_text(input.to_string()).await {
                    break;
                }
            }
        }
    }
    handle.shutdown().await;
}

async fn print_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected { model } => println!("[connected: {model}]"),
            SessionEvent::Reconnecting { reason } => println!("[reconnecting: {reason}]"),
            SessionEvent::AssistantText(delta) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            SessionEvent::TurnComplete => println!(),
            SessionEvent::Interrupted => println!("[interrupted]"),
            SessionEvent::ToolCall(call) => println!("[tool call] {call}"),
            SessionEvent::SourceDisabled { source } => println!("[{source} disabled]"),
            SessionEvent::Closed { reason } => {
                match reason {
                    Some(reason) => println!("[session closed: {reason}]"),
                    None => println!("[session closed]"),
                }
                break;
            }
        }
    }
}
