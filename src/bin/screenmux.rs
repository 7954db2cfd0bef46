use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use screenmux::recording::ffmpeg::{check_ffmpeg, resolve_ffmpeg_path};
use screenmux::recording::loopback::{LoopbackSource, SilentCapture};
use screenmux::{
    config_path, load_config_from, save_config_to, BackendKind, MuxMode, RecorderConfig, RecorderError,
    RecordingSession, Result, SessionLogger,
};

/// screenmux - time-aligned screen and system audio recording
///
/// Records the screen and the system audio output into one container whose
/// audio track stays aligned with the video from the first frame to the last.
#[derive(Parser)]
#[command(name = "screenmux")]
#[command(version, about, long_about)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until the duration elapses or Enter is pressed
    #[command(alias = "r")]
    Record {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Root directory for recordings
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// How audio reaches the container
        #[arg(short, long)]
        mode: Option<ModeArg>,

        /// Capture frame rate
        #[arg(long)]
        fps: Option<u32>,

        /// Shorten the encoder's graceful window and skip the merge pass
        #[arg(long)]
        quick_exit: bool,

        /// Record a silent audio track instead of the system output
        #[arg(long)]
        silent_audio: bool,
    },

    /// Resolve the encoder binary and check that it runs
    Check,

    /// Print the effective configuration
    Config {
        /// Print the config file location instead
        #[arg(long)]
        path: bool,

        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Pipe,
    Merge,
}

impl From<ModeArg> for MuxMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Pipe => MuxMode::Pipe,
            ModeArg::Merge => MuxMode::Merge,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("screenmux=info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_file = match cli.config {
        Some(path) => path,
        None => config_path()?,
    };

    match cli.command {
        Commands::Record {
            duration,
            output_dir,
            mode,
            fps,
            quick_exit,
            silent_audio,
        } => {
            let mut config = load_config_from(&config_file)?;
            if let Some(dir) = output_dir {
                config.output_dir = Some(dir);
            }
            if let Some(mode) = mode {
                config.mux_mode = mode.into();
            }
            if let Some(fps) = fps {
                config.framerate = fps;
            }
            record(config, duration.map(Duration::from_secs), quick_exit, silent_audio)
        }
        Commands::Check => {
            let config = load_config_from(&config_file)?;
            let log = SessionLogger::new("check");
            let ffmpeg = resolve_ffmpeg_path(config.ffmpeg_path.as_deref(), &log);
            let banner = check_ffmpeg(&ffmpeg, &log)?;
            println!("{}", ffmpeg.display());
            println!("{}", banner);
            Ok(())
        }
        Commands::Config { path, save } => {
            if path {
                println!("{}", config_file.display());
                return Ok(());
            }
            let config = load_config_from(&config_file)?;
            if save {
                save_config_to(&config_file, &config)?;
            }
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| RecorderError::Config(format!("Failed to serialize config: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn record(config: RecorderConfig, duration: Option<Duration>, quick_exit: bool, silent_audio: bool) -> Result<()> {
    if config.backend == BackendKind::Native {
        return Err(RecorderError::InvalidConfig(
            "the native backend needs a host multiplexer and is only available through the library".to_string(),
        ));
    }

    let capture = open_capture(&config, silent_audio)?;
    let mut session = RecordingSession::start(config, capture)?;
    println!("Recording {} -> {}", session.id(), session.paths().output.display());

    match duration {
        Some(limit) => println!("Press Enter to stop (or wait {}s)", limit.as_secs()),
        None => println!("Press Enter to stop"),
    }
    wait_for_stop(duration);

    session.stop()?;
    let metadata = session.finish(quick_exit)?;
    let json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| RecorderError::Config(format!("Failed to serialize metadata: {}", e)))?;
    println!("{}", json);
    Ok(())
}

#[cfg(feature = "loopback")]
fn open_capture(config: &RecorderConfig, silent_audio: bool) -> Result<Box<dyn LoopbackSource>> {
    if silent_audio {
        return Ok(Box::new(SilentCapture::default()));
    }
    let capture = screenmux::recording::loopback::CpalLoopback::open(config.audio_device.as_deref())?;
    Ok(Box::new(capture))
}

#[cfg(not(feature = "loopback"))]
fn open_capture(_config: &RecorderConfig, silent_audio: bool) -> Result<Box<dyn LoopbackSource>> {
    if !silent_audio {
        log::warn!("Built without the loopback feature; recording a silent audio track");
    }
    Ok(Box::new(SilentCapture::default()))
}

// Block until Enter is pressed or the duration elapses. Without a duration,
// closed stdin stops the recording straight away.
fn wait_for_stop(duration: Option<Duration>) {
    let (tx, rx) = mpsc::channel::<()>();
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });

    match duration {
        Some(limit) => {
            let started = Instant::now();
            if let Err(RecvTimeoutError::Disconnected) = rx.recv_timeout(limit) {
                std::thread::sleep(limit.saturating_sub(started.elapsed()));
            }
        }
        None => {
            let _ = rx.recv();
        }
    }
}
