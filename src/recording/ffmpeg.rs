/**
 * ============================================================================
 * FFMPEG MODULE
 * ============================================================================
 *
 * PURPOSE: Locate the external encoder and describe its topology
 *
 * RESOLUTION ORDER:
 * 1. Explicit path from RecorderConfig::ffmpeg_path
 * 2. SCREENMUX_FFMPEG environment variable
 * 3. Bundled binary: <exe dir>/resources/ffmpeg/{platform}/{arch}/ffmpeg
 * 4. DEV: resources/ffmpeg/{platform}/{arch}/ffmpeg relative to cwd
 * 5. First `ffmpeg` found on PATH
 *
 * TOPOLOGIES:
 * - Pipe mode: OS screen grab + raw audio on stdin, -shortest ends the
 *   encode once stdin is closed
 * - Merge mode, pass 1: OS screen grab only; stdin is the control channel
 *   ("q" asks the encoder to finish)
 * - Merge mode, pass 2: copy video, encode WAV audio, -shortest
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::logger::SessionLogger;
use crate::recording::types::{AudioFormat, RecorderConfig};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const FFMPEG_ENV: &str = "SCREENMUX_FFMPEG";

// Fallback resolution for the dynamic bitrate when no capture size is known
const DEFAULT_CAPTURE_SIZE: (u32, u32) = (1920, 1080);

// Bits per pixel per frame for the dynamic bitrate
const BITS_PER_PIXEL: f64 = 0.1;

// =============================================================================
// FFmpeg Path Management
// =============================================================================

// Get platform-specific FFmpeg binary name and subdirectory
fn ffmpeg_platform_info() -> (&'static str, &'static str) {
    #[cfg(target_os = "windows")]
    {
        ("windows/x86_64", "ffmpeg.exe")
    }
    #[cfg(target_os = "macos")]
    {
        #[cfg(target_arch = "aarch64")]
        {
            ("darwin/aarch64", "ffmpeg")
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            ("darwin/x86_64", "ffmpeg")
        }
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        #[cfg(target_arch = "aarch64")]
        {
            ("linux/aarch64", "ffmpeg")
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            ("linux/x86_64", "ffmpeg")
        }
    }
}

// Resolve the encoder binary. Never fails; a bare binary name is the last
// resort and check_ffmpeg() reports whether it actually runs.
pub fn resolve_ffmpeg_path(override_path: Option<&Path>, log: &SessionLogger) -> PathBuf {
    if let Some(path) = override_path {
        log.info(format_args!("FFmpeg path from config: {:?}", path));
        return path.to_path_buf();
    }

    if let Some(path) = std::env::var_os(FFMPEG_ENV).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        log.info(format_args!("FFmpeg path from {}: {:?}", FFMPEG_ENV, path));
        return path;
    }

    let (platform_subdir, bin_name) = ffmpeg_platform_info();
    let build_path = |root: PathBuf| -> PathBuf { root.join("ffmpeg").join(platform_subdir).join(bin_name) };

    // Bundled next to the executable
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        let candidate = build_path(exe_dir.join("resources"));
        if candidate.is_file() {
            log.info(format_args!("FFmpeg found at bundled path: {:?}", candidate));
            return candidate;
        }
    }

    // DEV: resources/ffmpeg relative to the working directory
    let candidate = build_path(PathBuf::from("resources"));
    if candidate.is_file() {
        log.info(format_args!("FFmpeg found at dev path: {:?}", candidate));
        return candidate;
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        if let Some(found) = find_in_path(bin_name, &path_var) {
            log.info(format_args!("FFmpeg found on PATH: {:?}", found));
            return found;
        }
    }

    log.warn(format_args!("FFmpeg not found in any known location, falling back to '{}'", bin_name));
    PathBuf::from(bin_name)
}

fn find_in_path(bin_name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(bin_name))
        .find(|candidate| candidate.is_file())
}

// Check that the encoder binary runs; returns its version banner
pub fn check_ffmpeg(ffmpeg_path: &Path, log: &SessionLogger) -> Result<String> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| RecorderError::EncoderNotFound(format!("{:?}: {}", ffmpeg_path, e)))?;

    if !output.status.success() {
        return Err(RecorderError::EncoderNotFound(format!(
            "{:?} -version exited with {:?}",
            ffmpeg_path,
            output.status.code()
        )));
    }

    let banner = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    log.info(format_args!("FFmpeg check passed: {:?} ({})", ffmpeg_path, banner));
    Ok(banner)
}

// =============================================================================
// Bitrate Ladder
// =============================================================================

// Bitrate (bits/s) from resolution and frame rate at a fixed bits-per-pixel
pub fn calculate_dynamic_bitrate(width: u32, height: u32, fps: u32) -> u64 {
    (width as f64 * height as f64 * fps as f64 * BITS_PER_PIXEL).round() as u64
}

// Parse "6M", "2500k", "800000" into bits per second
pub fn parse_bitrate(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1_000.0),
        'm' | 'M' => (&value[..value.len() - 1], 1_000_000.0),
        _ => (value, 1.0),
    };
    let number: f64 = digits.trim().parse().ok()?;
    if !number.is_finite() || number <= 0.0 {
        return None;
    }
    Some((number * multiplier).round() as u64)
}

// Parse "1920x1080"
pub fn parse_video_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateLadder {
    pub bitrate: u64,
    pub maxrate: u64,
    pub bufsize: u64,
}

impl BitrateLadder {
    pub fn from_bitrate(bitrate: u64) -> Self {
        Self {
            bitrate,
            maxrate: bitrate * 3 / 2,
            bufsize: bitrate * 2,
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-b:v".to_string(),
            format!("{}k", self.bitrate / 1_000),
            "-maxrate".to_string(),
            format!("{}k", self.maxrate / 1_000),
            "-bufsize".to_string(),
            format!("{}k", self.bufsize / 1_000),
        ]
    }
}

// =============================================================================
// Video Source
// =============================================================================

// Grab device descriptor: `-f <format> -i <input>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub format: String,
    pub input: String,
}

pub fn default_video_source() -> VideoSource {
    #[cfg(target_os = "windows")]
    {
        VideoSource {
            format: "gdigrab".to_string(),
            input: "desktop".to_string(),
        }
    }
    #[cfg(target_os = "macos")]
    {
        VideoSource {
            format: "avfoundation".to_string(),
            input: "1:none".to_string(),
        }
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
        VideoSource {
            format: "x11grab".to_string(),
            input: display,
        }
    }
}

// =============================================================================
// Command Builder
// =============================================================================

// Program + arguments for one encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    ffmpeg: PathBuf,
    framerate: u32,
    video_codec: String,
    preset: String,
    ladder: BitrateLadder,
    video_size: Option<(u32, u32)>,
    source: VideoSource,
    audio_codec: String,
    audio_bitrate: String,
    container: String,
}

impl FfmpegCommandBuilder {
    pub fn from_config(ffmpeg: PathBuf, config: &RecorderConfig) -> Result<Self> {
        let video_size = match config.video_size.as_deref() {
            Some(value) => Some(
                parse_video_size(value)
                    .ok_or_else(|| RecorderError::InvalidConfig(format!("bad video_size '{}'", value)))?,
            ),
            None => None,
        };

        let bitrate = match config.video_bitrate.as_deref() {
            Some(value) => parse_bitrate(value)
                .ok_or_else(|| RecorderError::InvalidConfig(format!("bad video_bitrate '{}'", value)))?,
            None => {
                let (w, h) = video_size.unwrap_or(DEFAULT_CAPTURE_SIZE);
                calculate_dynamic_bitrate(w, h, config.framerate)
            }
        };

        let defaults = default_video_source();
        let source = VideoSource {
            format: config.video_input_format.clone().unwrap_or(defaults.format),
            input: config.video_input.clone().unwrap_or(defaults.input),
        };

        Ok(Self {
            ffmpeg,
            framerate: config.framerate,
            video_codec: config.video_codec.clone(),
            preset: config.preset.clone(),
            ladder: BitrateLadder::from_bitrate(bitrate),
            video_size,
            source,
            audio_codec: config.audio_codec.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
            container: config.container.clone(),
        })
    }

    pub fn ladder(&self) -> BitrateLadder {
        self.ladder
    }

    pub fn source(&self) -> &VideoSource {
        &self.source
    }

    // Screen grab + raw audio on stdin into one container
    pub fn pipe_command(&self, audio: &AudioFormat, output: &Path) -> EncoderCommand {
        let mut args = self.preamble();
        args.extend(self.video_input_args());
        args.extend(strings(&[
            "-thread_queue_size",
            "1024",
            "-f",
            audio.ffmpeg_sample_format(),
        ]));
        args.extend([
            "-ar".to_string(),
            audio.sample_rate.to_string(),
            "-ac".to_string(),
            audio.channels.to_string(),
        ]);
        args.extend(strings(&["-i", "pipe:0", "-map", "0:v:0", "-map", "1:a:0"]));
        args.extend(self.video_encode_args());
        args.extend(self.audio_encode_args());
        args.push("-shortest".to_string());
        args.extend(self.container_args());
        args.push(output.to_string_lossy().into_owned());
        EncoderCommand::new(&self.ffmpeg, args)
    }

    // Screen grab only; stdin stays open as the control channel
    pub fn merge_video_command(&self, video_output: &Path) -> EncoderCommand {
        let mut args = self.preamble();
        args.extend(self.video_input_args());
        args.extend(strings(&["-map", "0:v:0"]));
        args.extend(self.video_encode_args());
        args.extend(self.container_args());
        args.push(video_output.to_string_lossy().into_owned());
        EncoderCommand::new(&self.ffmpeg, args)
    }

    // Second pass combining the video file and the WAV intermediate
    pub fn merge_pass_command(&self, video: &Path, audio: &Path, output: &Path) -> EncoderCommand {
        let mut args = self.preamble();
        args.push("-i".to_string());
        args.push(video.to_string_lossy().into_owned());
        args.push("-i".to_string());
        args.push(audio.to_string_lossy().into_owned());
        args.extend(strings(&["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy"]));
        args.extend(self.audio_encode_args());
        args.push("-shortest".to_string());
        args.extend(self.container_args());
        args.push(output.to_string_lossy().into_owned());
        EncoderCommand::new(&self.ffmpeg, args)
    }

    fn preamble(&self) -> Vec<String> {
        strings(&["-y", "-hide_banner", "-loglevel", "info", "-stats"])
    }

    fn video_input_args(&self) -> Vec<String> {
        let mut args = strings(&["-thread_queue_size", "512", "-f"]);
        args.push(self.source.format.clone());
        args.push("-framerate".to_string());
        args.push(self.framerate.to_string());
        if let Some((w, h)) = self.video_size {
            args.push("-video_size".to_string());
            args.push(format!("{}x{}", w, h));
        }
        if self.source.format == "avfoundation" {
            args.extend(strings(&["-capture_cursor", "1"]));
        }
        args.push("-i".to_string());
        args.push(self.source.input.clone());
        args
    }

    fn video_encode_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.video_codec.clone()];
        args.push("-preset".to_string());
        args.push(self.preset.clone());
        args.extend(self.ladder.args());
        args.extend(strings(&["-pix_fmt", "yuv420p"]));
        args.push("-r".to_string());
        args.push(self.framerate.to_string());
        args
    }

    fn audio_encode_args(&self) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
        ]
    }

    // Fast-start only applies to the ISO BMFF family
    fn container_args(&self) -> Vec<String> {
        match self.container.as_str() {
            "mp4" | "mov" | "m4v" => strings(&["-movflags", "+faststart"]),
            _ => Vec::new(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> FfmpegCommandBuilder {
        let mut config = RecorderConfig::default();
        config.video_input_format = Some("x11grab".to_string());
        config.video_input = Some(":1".to_string());
        config.video_bitrate = Some("6M".to_string());
        FfmpegCommandBuilder::from_config(PathBuf::from("ffmpeg"), &config).unwrap()
    }

    fn window<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_ffmpeg_platform_info() {
        let (subdir, name) = ffmpeg_platform_info();
        assert!(!subdir.is_empty());
        assert!(!name.is_empty());
        #[cfg(target_os = "windows")]
        assert!(name.ends_with(".exe"));
    }

    #[test]
    fn test_override_path_wins() {
        let path = resolve_ffmpeg_path(Some(Path::new("/opt/custom/ffmpeg")), &SessionLogger::new("test"));
        assert_eq!(path, PathBuf::from("/opt/custom/ffmpeg"));
    }

    #[test]
    fn test_find_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg-test-bin");
        std::fs::write(&bin, b"").unwrap();

        let path_var = std::env::join_paths([Path::new("/nonexistent-dir"), dir.path()]).unwrap();
        assert_eq!(find_in_path("ffmpeg-test-bin", &path_var), Some(bin));
        assert_eq!(find_in_path("missing-bin", &path_var), None);
    }

    #[test]
    fn test_check_missing_binary() {
        let result = check_ffmpeg(Path::new("/nonexistent/ffmpeg"), &SessionLogger::new("test"));
        assert!(matches!(result, Err(RecorderError::EncoderNotFound(_))));
    }

    #[test]
    fn test_bitrate_parsing() {
        assert_eq!(parse_bitrate("6M"), Some(6_000_000));
        assert_eq!(parse_bitrate("2500k"), Some(2_500_000));
        assert_eq!(parse_bitrate("800000"), Some(800_000));
        assert_eq!(parse_bitrate("fast"), None);
        assert_eq!(parse_bitrate("-1M"), None);
        assert_eq!(parse_video_size("1280x720"), Some((1280, 720)));
        assert_eq!(parse_video_size("0x720"), None);
    }

    #[test]
    fn test_dynamic_bitrate_ladder() {
        // 1920 * 1080 * 30 * 0.1
        assert_eq!(calculate_dynamic_bitrate(1920, 1080, 30), 6_220_800);

        let ladder = BitrateLadder::from_bitrate(6_000_000);
        assert_eq!(ladder.maxrate, 9_000_000);
        assert_eq!(ladder.bufsize, 12_000_000);
    }

    #[test]
    fn test_pipe_topology() {
        let format = AudioFormat::float32(48_000, 2);
        let cmd = builder().pipe_command(&format, Path::new("/tmp/out.mp4"));
        let args = &cmd.args;

        assert_eq!(window(args, "-f"), Some("x11grab"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "f32le"));
        assert_eq!(window(args, "-ar"), Some("48000"));
        assert_eq!(window(args, "-ac"), Some("2"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "pipe:0"));
        assert!(args.contains(&"-shortest".to_string()));
        assert_eq!(window(args, "-b:v"), Some("6000k"));
        assert_eq!(window(args, "-maxrate"), Some("9000k"));
        assert_eq!(window(args, "-bufsize"), Some("12000k"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_merge_topology() {
        let b = builder();
        let video = b.merge_video_command(Path::new("/tmp/v.mp4"));
        assert!(!video.args.iter().any(|a| a == "pipe:0"));
        assert!(!video.args.iter().any(|a| a == "-c:a"));

        let merge = b.merge_pass_command(Path::new("/tmp/v.mp4"), Path::new("/tmp/a.wav"), Path::new("/tmp/o.mp4"));
        assert_eq!(window(&merge.args, "-c:v"), Some("copy"));
        assert_eq!(window(&merge.args, "-c:a"), Some("aac"));
        assert!(merge.args.contains(&"-shortest".to_string()));
        assert!(merge.args.windows(2).any(|w| w[0] == "-i" && w[1] == "/tmp/a.wav"));
    }

    #[test]
    fn test_invalid_bitrate_is_config_error() {
        let mut config = RecorderConfig::default();
        config.video_bitrate = Some("lots".to_string());
        let result = FfmpegCommandBuilder::from_config(PathBuf::from("ffmpeg"), &config);
        assert!(matches!(result, Err(RecorderError::InvalidConfig(_))));
    }
}
