use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_live::voice::{
    AudioFrame, AudioHost, CaptureLoop, CpalHost, InputDevice, PlaybackId, PlaybackScheduler,
    VolumeMeter, samples_to_wav,
};
use beacon_live::{Config, LiveConnector, SessionController, SessionState};

/// Beacon Live - Realtime voice conversations
#[derive(Parser)]
#[command(name = "beacon-live", version, about)]
struct Cli {
    /// Prebuilt voice for the remote speaker (e.g., "Puck")
    #[arg(long, env = "BEACON_LIVE_VOICE")]
    voice: Option<String>,

    /// System instruction sent when the conversation opens
    #[arg(long)]
    instruction: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as a WAV file
        #[arg(long)]
        record: Option<std::path::PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_live=info",
        1 => "info,beacon_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, record } => test_mic(&config, duration, record).await,
            Command::TestSpeaker => test_speaker(&config).await,
        };
    }

    if let Some(voice) = cli.voice {
        config.live.voice = voice;
    }
    if cli.instruction.is_some() {
        config.live.system_instruction = cli.instruction;
    }
    config.live.validate()?;

    tracing::info!(
        model = %config.live.model,
        voice = %config.live.voice,
        input_rate = config.session.input_sample_rate,
        output_rate = config.session.output_sample_rate,
        "starting live session"
    );

    let connector = LiveConnector::new(config.live)
        .with_input_sample_rate(config.session.input_sample_rate);
    let controller =
        SessionController::new(Arc::new(CpalHost), Arc::new(connector), config.session);

    // Print status changes until the session ends or ctrl-c
    let mut status = controller.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = None;
        let mut meter_printed = std::time::Instant::now();
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            let line = (snapshot.state, snapshot.remote_speaking);
            if last != Some(line) {
                let speaker = if snapshot.remote_speaking { "remote speaking" } else { "listening" };
                println!("[{}] {speaker}", snapshot.state);
                last = Some(line);
            } else if meter_printed.elapsed() >= Duration::from_millis(500) {
                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (snapshot.volume.value() / 2.0).min(50.0) as usize;
                println!("  mic [{}{}]", "█".repeat(meter_len), " ".repeat(50 - meter_len));
                meter_printed = std::time::Instant::now();
            }
        }
    });

    tokio::select! {
        result = controller.start() => result.context("failed to start session")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted while connecting");
            controller.stop().await;
            printer.abort();
            return Ok(());
        }
    }
    println!("Connected. Speak now; press Ctrl+C to end.\n");

    let mut watcher = controller.subscribe();
    let ended = async {
        // The session may already have ended before we subscribed
        loop {
            let state = watcher.borrow_and_update().state;
            if matches!(state, SessionState::Disconnected | SessionState::Error) {
                break;
            }
            if watcher.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
        () = ended => tracing::info!(state = %controller.state(), "session ended"),
    }

    let last_error = controller.status().error;
    controller.stop().await;
    printer.abort();

    if let Some(error) = last_error {
        anyhow::bail!("session ended with error: {error}");
    }
    Ok(())
}

/// Test microphone input with a live volume meter
async fn test_mic(
    config: &Config,
    duration: u64,
    record: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let sample_rate = config.session.input_sample_rate;
    let recorded = Arc::new(Mutex::new(Vec::<f32>::new()));
    let sink = Arc::clone(&recorded);
    let (capture, control) = CaptureLoop::new(
        config.session.frame_size,
        sample_rate,
        Box::new(move |frame: AudioFrame| {
            if let Ok(mut samples) = sink.lock() {
                samples.extend_from_slice(frame.samples());
            }
        }),
    );

    let mut input = CpalHost.open_input(sample_rate, capture.into_sink())?;
    control.begin();

    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    let mut meter = VolumeMeter::new(config.session.fft_size);
    let analysis = control.analysis();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let window = analysis.borrow().clone();
        let volume = meter.measure(&window).value();
        let frames = control.frames_emitted();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (volume / 2.0).min(50.0) as usize;
        let bar: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] Volume: {volume:5.1} | Frames: {frames:4} | [{bar}]", i + 1);
    }

    control.pause();
    input.close();

    if let Some(path) = record {
        let samples = recorded
            .lock()
            .map_err(|_| anyhow::anyhow!("recording buffer poisoned"))?
            .clone();
        let wav = samples_to_wav(&samples, sample_rate)?;
        std::fs::write(&path, wav)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("\nSaved {} samples to {}", samples.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the volume stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output by scheduling three back-to-back tones
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps between them\n");

    let sample_rate = config.session.output_sample_rate;
    let output = CpalHost.open_output(sample_rate, Box::new(|_: PlaybackId| {}))?;
    let mut playback = PlaybackScheduler::new(output, config.session.safety_margin);

    let mut end = Duration::ZERO;
    for frequency in [440.0_f32, 554.37, 659.25] {
        let samples = tone(frequency, sample_rate, Duration::from_millis(200));
        let frame = AudioFrame::new(samples, sample_rate);
        if let Some(scheduled) = playback.enqueue(&frame)? {
            println!(
                "Scheduled {frequency:.0} Hz at {:.3}s for {:.3}s",
                scheduled.start.as_secs_f32(),
                scheduled.duration.as_secs_f32()
            );
            end = scheduled.end();
        }
    }
    if let Some(tail) = playback.finish_turn()? {
        end = tail.end();
    }

    while playback.current_time() < end {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.close();

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Generate a sine tone at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, sample_rate: u32, duration: Duration) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration.as_secs_f32()) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect()
}
