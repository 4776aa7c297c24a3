/// SmartBin detector CLI
///
/// `run` drives the detection engine from files (or the microphone) and takes
/// feedback commands on stdin; `probe` submits one capture and prints the
/// prediction.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use smartbin_detector::capture::capture_frame;
use smartbin_detector::sources::StillImageVideo;
use smartbin_detector::waveform::read_wav_file;
use smartbin_detector::{
    encode_wav, init_logging, AudioSource, CaptureBundle, DetectionEngine, EngineConfig,
    EngineEvent, FileBackend, HttpInferenceClient, InferenceClient, TriggerKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "smartbin-detector")]
#[command(about = "Real-time multimodal waste detection trigger engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inference service base URL (overrides SMARTBIN_API_BASE_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Base trigger threshold, clamped to [0.05, 0.90]
    #[arg(long)]
    threshold: Option<f32>,

    /// Polling interval (ms)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Inference request timeout (seconds)
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection engine
    Run {
        /// Still image used as the camera
        #[arg(long)]
        image: PathBuf,

        /// WAV file replayed as the microphone
        #[arg(long, required_unless_present = "microphone")]
        audio: Option<PathBuf>,

        /// Use the default input device instead of a WAV file
        #[arg(long)]
        microphone: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Submit one capture and print the prediction as JSON
    Probe {
        /// Image file to submit
        #[arg(long)]
        image: Option<PathBuf>,

        /// WAV file to submit
        #[arg(long)]
        audio: Option<PathBuf>,
    },
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_env().context("Invalid SMARTBIN_* environment")?;

        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(threshold) = self.threshold {
            config.initial_threshold = threshold;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_interval_ms = tick_ms;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

fn audio_source(audio: Option<PathBuf>, microphone: bool) -> Result<AudioSource> {
    if microphone {
        #[cfg(feature = "microphone")]
        return Ok(AudioSource::Microphone);

        #[cfg(not(feature = "microphone"))]
        bail!("built without the `microphone` feature");
    }

    match audio {
        Some(path) => Ok(AudioSource::Wav(path)),
        None => bail!("either --audio or --microphone is required"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to serialize output: {}", e),
    }
}

/// Handle one stdin command; returns false to quit
async fn handle_command(engine: &DetectionEngine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("confirm") => {
            if engine.confirm().await.is_none() {
                println!("Nothing to confirm");
            }
        }
        Some("correct") => {
            let label = parts.collect::<Vec<_>>().join(" ");
            if label.is_empty() {
                println!("Usage: correct <label>");
            } else if engine.correct(&label).await.is_none() {
                println!("Nothing to correct");
            }
        }
        Some("reset") => engine.reset().await,
        Some("dismiss") => engine.dismiss_toast().await,
        Some("threshold") => match parts.next().map(str::parse::<f32>) {
            Some(Ok(value)) => println!("Threshold: {:.2}", engine.set_threshold(value)),
            _ => println!("Usage: threshold <0.05-0.90>"),
        },
        Some("status") => print_json(&engine.snapshot().await),
        Some("stats") => print_json(&engine.stats().await),
        Some("quit") | Some("exit") => return false,
        Some(other) => {
            println!("Unknown command: {}", other);
            println!(
                "Commands: confirm, correct <label>, reset, dismiss, threshold <v>, status, stats, quit"
            );
        }
        None => {}
    }
    true
}

async fn run(
    config: EngineConfig,
    image: PathBuf,
    audio: AudioSource,
    duration: Option<u64>,
) -> Result<()> {
    let backend = Arc::new(FileBackend::new(image, audio));
    let engine = DetectionEngine::with_http_client(config, backend)?;
    engine.start().await?;

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = engine.recv_event() => match event {
                Some(EngineEvent::StateChanged { .. }) => {}
                Some(event) => print_json(&event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(&engine, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut deadline => {
                info!("Run duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.stop().await?;

    let stats = engine.stats().await;
    println!("\n=== Statistics ===");
    println!("Ticks: {}", stats.ticks);
    println!(
        "Triggers: {} ({} audio, {} visual)",
        stats.triggers(),
        stats.audio_triggers,
        stats.visual_triggers
    );
    println!(
        "Cycles: {} succeeded, {} failed, {} aborted",
        stats.cycles_succeeded, stats.cycles_failed, stats.cycles_aborted
    );
    println!(
        "Saved: {} auto, {} confirmed, {} corrected",
        stats.auto_saves, stats.confirmations, stats.corrections
    );

    Ok(())
}

async fn probe(config: EngineConfig, image: Option<PathBuf>, audio: Option<PathBuf>) -> Result<()> {
    if image.is_none() && audio.is_none() {
        bail!("nothing to submit: pass --image and/or --audio");
    }

    let encoded_image = match &image {
        Some(path) => {
            let video = StillImageVideo::open(path)?;
            capture_frame(&video)?
        }
        None => None,
    };

    let clip = match &audio {
        Some(path) => {
            let decoded = read_wav_file(path)?;
            Some(encode_wav(&decoded.samples, decoded.sample_rate)?)
        }
        None => None,
    };

    let bundle = CaptureBundle {
        kind: if clip.is_some() {
            TriggerKind::AudioVisual
        } else {
            TriggerKind::VisualOnly
        },
        image: encoded_image,
        audio: clip,
    };

    let client = HttpInferenceClient::from_config(&config)?;
    info!("Probing {}", client.url());
    let prediction = client.submit(&bundle).await?;

    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = cli.engine_config()?;

    match cli.command {
        Commands::Run {
            image,
            audio,
            microphone,
            duration,
        } => {
            let source = audio_source(audio, microphone)?;
            run(config, image, source, duration).await
        }
        Commands::Probe { image, audio } => probe(config, image, audio).await,
    }
}
