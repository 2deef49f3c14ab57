//! CLI interface for talkbridge

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{self, Config};
use crate::credentials;
use crate::realtime::{Connector, Phase, WsConnector};
use crate::server::{self, auth::{AuthSettings, AuthState}, ServerState};
use crate::session::{Notification, RecordingPlayback, SessionManager, SessionOptions, ToolStatus};
use crate::voice::source::{load_wav, pump_realtime, save_wav};
use crate::voice::CaptureMode;
use crate::{credits, tools};

#[derive(Parser)]
#[command(name = "talkbridge")]
#[command(about = "Realtime voice conversations with mid-dialogue tool calls", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control-channel server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Hold one conversation turn with a WAV file as the microphone
    Talk {
        /// PCM16 mono WAV at the configured sample rate
        #[arg(short, long)]
        input: PathBuf,
        /// Where to write the response audio
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Capture mode (default from config)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<CaptureMode>,
        /// Conversation id
        #[arg(long, default_value = "cli")]
        conversation: String,
        /// Owner charged for paid tools
        #[arg(long, default_value = "local")]
        owner: String,
        /// Give up waiting for the response after this many seconds
        #[arg(long, default_value = "60")]
        wait_secs: u64,
    },
    /// Issue a development access token for the control channel
    Token {
        /// Owner id (token subject)
        owner: String,
        /// Grant the admin permission
        #[arg(long)]
        admin: bool,
    },
    /// Configure talkbridge
    Config {
        /// Store the model API key in the keyring
        #[arg(long)]
        set_api_key: Option<String>,
        /// Remove the stored API key
        #[arg(long)]
        delete_api_key: bool,
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Print the config file location
        #[arg(long)]
        path: bool,
    },
}

fn parse_mode(s: &str) -> Result<CaptureMode, String> {
    match s.to_lowercase().as_str() {
        "buffered" => Ok(CaptureMode::Buffered),
        "stream" => Ok(CaptureMode::Stream),
        other => Err(format!("unknown mode '{}', expected buffered or stream", other)),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => {
            let mut config = Config::load()?;
            config.ensure_jwt_secret()?;
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let api_key = credentials::get_api_key();
            if api_key.is_none() {
                println!("⚠ No model API key configured. Run 'talkbridge config --set-api-key KEY'.");
            }
            let state = ServerState::from_config(config, api_key)?;
            server::start(state, &host, port).await?;
        }
        Commands::Talk { input, output, mode, conversation, owner, wait_secs } => {
            talk(input, output, mode, conversation, owner, Duration::from_secs(wait_secs)).await?;
        }
        Commands::Token { owner, admin } => {
            let mut config = Config::load()?;
            config.ensure_jwt_secret()?;
            let auth = AuthState::new(AuthSettings::from(&config.auth));
            let permissions = if admin { vec!["admin".to_string()] } else { Vec::new() };
            let token = auth.generate_access_token(&owner, &permissions)?;
            println!("{}", token);
        }
        Commands::Config { set_api_key, delete_api_key, show, path } => {
            if let Some(key) = set_api_key {
                credentials::set_api_key(&key)?;
                println!("API key stored.");
            } else if delete_api_key {
                credentials::delete_api_key()?;
                println!("API key removed.");
            } else if path {
                println!("{}", config::config_path()?.display());
            } else if show {
                let config = Config::load()?;
                config::show_config(&config)?;
                println!(
                    "  API key:         {}",
                    if credentials::has_api_key() { "configured" } else { "not configured" }
                );
            } else {
                println!("Use --show, --path, --set-api-key or --delete-api-key");
            }
        }
    }

    Ok(())
}

async fn talk(
    input: PathBuf,
    output: Option<PathBuf>,
    mode: Option<CaptureMode>,
    conversation: String,
    owner: String,
    wait: Duration,
) -> Result<()> {
    let config = Config::load()?;
    let (samples, sample_rate) = load_wav(&input).with_context(|| format!("Failed to read {}", input.display()))?;
    if sample_rate != config.realtime.sample_rate {
        bail!(
            "{} is {} Hz; the model expects {} Hz mono PCM16",
            input.display(),
            sample_rate,
            config.realtime.sample_rate
        );
    }

    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(&config.realtime, credentials::get_api_key()));
    let tools = tools::registry_from_config(&config.tools)?;
    let ledger = credits::ledger_from_config(&config.credits)?;
    let manager = SessionManager::new(Arc::new(config.clone()), connector, Arc::new(tools), ledger);

    let playback = RecordingPlayback::new();
    let mut options = SessionOptions::new(&conversation, &owner).with_playback(playback.clone());
    if let Some(mode) = mode {
        options = options.with_mode(mode);
    }
    let session = manager.start(options).await?;
    let mut notifications = session.subscribe();

    println!("Connecting ({} mode)...", session.mode());
    let outcome = tokio::time::timeout(wait, async {
        if !wait_for_phase(&mut notifications, Phase::Listening).await {
            return false;
        }
        println!("Speaking {:.1}s of audio from {}", samples.len() as f32 / sample_rate as f32, input.display());
        let speaker = session.clone();
        tokio::spawn(async move {
            pump_realtime(
                speaker.audio_input(),
                samples,
                sample_rate,
                Duration::from_millis(100),
                Duration::from_millis(1500),
            )
            .await;
            // Server-side detection may miss a clipped ending
            if speaker.mode() == CaptureMode::Stream && speaker.phase() == Phase::Listening {
                speaker.commit().await;
            }
        });
        wait_for_response(&mut notifications).await
    })
    .await;

    match outcome {
        Ok(true) => {}
        Ok(false) => println!("Session ended before a response completed."),
        Err(_) => println!("Timed out after {:?} waiting for a response.", wait),
    }
    session.shutdown(crate::session::EndReason::Stopped);
    session.wait().await;

    if let Some(path) = output {
        let audio = playback.take();
        save_wav(&audio, sample_rate, &path)?;
        println!("Wrote {:.1}s of response audio to {}", audio.len() as f32 / sample_rate as f32, path.display());
    }
    Ok(())
}

/// Print notifications until `phase` is reached. `false` if the session ended.
async fn wait_for_phase(rx: &mut broadcast::Receiver<Notification>, phase: Phase) -> bool {
    loop {
        match rx.recv().await {
            Ok(Notification::Phase { phase: p }) if p == phase => return true,
            Ok(notification) => {
                if !print_notification(&notification) {
                    return false;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

/// Wait for one full response: the session leaves listening, then returns to it
async fn wait_for_response(rx: &mut broadcast::Receiver<Notification>) -> bool {
    let mut responded = false;
    loop {
        let notification = match rx.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return false,
        };
        match notification {
            Notification::Phase { phase: Phase::Listening } if responded => return true,
            Notification::Phase { phase: Phase::Thinking | Phase::Speaking } => responded = true,
            other => {
                if !print_notification(&other) {
                    return false;
                }
            }
        }
    }
}

/// Returns `false` once the session has ended
fn print_notification(notification: &Notification) -> bool {
    match notification {
        Notification::Transcript { turn } => println!("{}: {}", turn.role, turn.text),
        Notification::ToolUpdate { tool, status, message, credits_charged, .. } => match status {
            ToolStatus::Running => println!("  [{}] running", tool),
            ToolStatus::Done => println!("  [{}] done ({} credits)", tool, credits_charged),
            ToolStatus::Failed => println!("  [{}] failed: {}", tool, message.as_deref().unwrap_or("unknown error")),
        },
        Notification::Credits { balance } => println!("  balance: {}", balance),
        Notification::Error { code, message } => eprintln!("  error ({}): {}", code, message),
        Notification::Ended { reason } => {
            println!("Session ended: {:?}", reason);
            return false;
        }
        Notification::Phase { .. } => {}
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("Stream").unwrap(), CaptureMode::Stream);
        assert_eq!(parse_mode("buffered").unwrap(), CaptureMode::Buffered);
        assert!(parse_mode("duplex").is_err());
    }

    #[test]
    fn test_cli_parses_talk() {
        let cli = Cli::try_parse_from(["talkbridge", "talk", "--input", "in.wav", "--mode", "stream"]).unwrap();
        match cli.command {
            Commands::Talk { input, mode, conversation, .. } => {
                assert_eq!(input, PathBuf::from("in.wav"));
                assert_eq!(mode, Some(CaptureMode::Stream));
                assert_eq!(conversation, "cli");
            }
            _ => panic!("expected talk"),
        }
    }
}
