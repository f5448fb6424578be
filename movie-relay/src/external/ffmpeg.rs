//! ffmpeg-backed transcoder producing an HLS playlist and WebVTT subtitles.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ExternalError;
use super::traits::{ConvertedAsset, RawStream, Transcoder};
use crate::domain::JobId;
use crate::pipeline::ProgressReporter;

const STDERR_TAIL_LINES: usize = 20;
const PLAYLIST_NAME: &str = "index.m3u8";
const MEDIA_NAME: &str = "media.ts";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Each job gets its own subdirectory here.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_hls_time")]
    pub hls_time_secs: u32,
    #[serde(default = "default_codec")]
    pub video_codec: String,
    #[serde(default = "default_codec")]
    pub audio_codec: String,
}

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("movie-relay")
}

fn default_hls_time() -> u32 {
    6
}

fn default_codec() -> String {
    "copy".to_string()
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            work_dir: default_work_dir(),
            hls_time_secs: default_hls_time(),
            video_codec: default_codec(),
            audio_codec: default_codec(),
        }
    }
}

/// Parse `HH:MM:SS.ms` to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the input duration from an ffmpeg banner line
/// (`  Duration: 01:42:10.05, start: 0.000000, bitrate: 2411 kb/s`).
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let start = line.find("Duration:")?;
    let rest = line[start + 9..].trim_start();
    let end = rest.find(',').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Tracks `-progress pipe:1` key=value output.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_secs: f64,
    finished: bool,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            ..Default::default()
        }
    }

    pub fn set_duration(&mut self, duration_secs: f64) {
        if self.duration_secs.is_none() && duration_secs > 0.0 {
            self.duration_secs = Some(duration_secs);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one progress line; returns a percentage when one can be computed.
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // ffmpeg reports microseconds under both names.
            "out_time_us" | "out_time_ms" => {
                let us: i64 = value.trim().parse().ok()?;
                self.out_time_secs = us.max(0) as f64 / 1_000_000.0;
            }
            "out_time" => {
                self.out_time_secs = parse_time(value)?;
            }
            "progress" => {
                if value.trim() == "end" {
                    self.finished = true;
                    return Some(100);
                }
                return self.percent();
            }
            _ => return None,
        }
        None
    }

    fn percent(&self) -> Option<u8> {
        let duration = self.duration_secs?;
        let ratio = (self.out_time_secs / duration).clamp(0.0, 1.0);
        // Hold 100 until ffmpeg reports the end of output.
        Some(((ratio * 100.0) as u8).min(99))
    }
}

/// Classify a failed ffmpeg run from its last stderr lines.
fn classify_failure(exit_code: Option<i32>, stderr_tail: &[String]) -> ExternalError {
    let tail = stderr_tail.join("\n");
    let lower = tail.to_ascii_lowercase();
    let message = format!(
        "ffmpeg exited with {}: {}",
        exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        stderr_tail.last().map(String::as_str).unwrap_or("no output")
    );
    let fatal = [
        "invalid data found",
        "no such file",
        "server returned 403",
        "server returned 404",
        "server returned 4xx",
        "unknown encoder",
        "unrecognized option",
    ];
    if fatal.iter().any(|needle| lower.contains(needle)) {
        ExternalError::fatal(message)
    } else {
        ExternalError::transient(message)
    }
}

pub struct FfmpegTranscoder {
    config: FfmpegConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn subtitle_path(dir: &Path, index: usize, lang: &str) -> PathBuf {
        let lang: String = lang
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        dir.join(format!("sub_{index}_{lang}.vtt"))
    }

    fn build_args(&self, stream: &RawStream, dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-nostats".into(),
            "-progress".into(),
            "pipe:1".into(),
        ];

        if !stream.headers.is_empty() {
            let headers: String = stream
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}\r\n"))
                .collect();
            args.push("-headers".into());
            args.push(headers);
        }
        args.extend(["-i".into(), stream.url.clone()]);
        for track in &stream.subtitles {
            args.extend(["-i".into(), track.url.clone()]);
        }

        args.extend([
            "-map".into(),
            "0:v:0?".into(),
            "-map".into(),
            "0:a?".into(),
            "-c:v".into(),
            self.config.video_codec.clone(),
            "-c:a".into(),
            self.config.audio_codec.clone(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.config.hls_time_secs.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_flags".into(),
            "single_file".into(),
            "-hls_segment_filename".into(),
            dir.join(MEDIA_NAME).display().to_string(),
            dir.join(PLAYLIST_NAME).display().to_string(),
        ]);

        for (i, track) in stream.subtitles.iter().enumerate() {
            args.extend([
                "-map".into(),
                format!("{}:0", i + 1),
                "-c:s".into(),
                "webvtt".into(),
                Self::subtitle_path(dir, i, &track.lang).display().to_string(),
            ]);
        }

        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(
        &self,
        job_id: &JobId,
        stream: &RawStream,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ConvertedAsset, ExternalError> {
        let dir = self.config.work_dir.join(job_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let args = self.build_args(stream, &dir);
        info!(job_id = %job_id, dir = %dir.display(), "Starting ffmpeg conversion");
        debug!(job_id = %job_id, ?args, "ffmpeg args");

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ExternalError::fatal(format!("ffmpeg not found at {}", self.config.binary_path))
                }
                _ => ExternalError::transient(format!("failed to spawn ffmpeg: {e}")),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExternalError::transient("failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExternalError::transient("failed to capture ffmpeg stderr"))?;

        let parser = Arc::new(Mutex::new(ProgressParser::new(stream.duration_secs)));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stderr_task = {
            let parser = parser.clone();
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(duration) = parse_duration_line(&line) {
                        parser.lock().set_duration(duration);
                    }
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        };

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    warn!(job_id = %job_id, "ffmpeg conversion cancelled");
                    return Err(ExternalError::cancelled());
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(percent) = parser.lock().feed(&line) {
                                progress.report(percent);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Error reading ffmpeg progress");
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ExternalError::cancelled());
            }
            status = child.wait() => status?,
        };
        let _ = stderr_task.await;

        if !status.success() {
            let tail: Vec<String> = tail.lock().iter().cloned().collect();
            let err = classify_failure(status.code(), &tail);
            warn!(job_id = %job_id, error = %err, "ffmpeg conversion failed");
            return Err(err);
        }

        let playlist = dir.join(PLAYLIST_NAME);
        if !tokio::fs::try_exists(&playlist).await.unwrap_or(false) {
            return Err(ExternalError::fatal("ffmpeg finished without a playlist"));
        }

        let subtitles: Vec<PathBuf> = stream
            .subtitles
            .iter()
            .enumerate()
            .map(|(i, t)| Self::subtitle_path(&dir, i, &t.lang))
            .collect();
        let mut files = vec![playlist.clone(), dir.join(MEDIA_NAME)];
        files.extend(subtitles.iter().cloned());

        progress.report(100);
        info!(job_id = %job_id, parts = files.len(), "ffmpeg conversion finished");

        Ok(ConvertedAsset {
            work_dir: dir,
            playlist,
            subtitles,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::SubtitleTrack;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("invalid"), None);
    }

    #[test]
    fn test_parse_duration_line() {
        let line = "  Duration: 01:42:10.05, start: 0.000000, bitrate: 2411 kb/s";
        assert_eq!(parse_duration_line(line), Some(6130.05));
        assert_eq!(parse_duration_line("Stream #0:0: Video: h264"), None);
    }

    #[test]
    fn test_progress_parser_maps_out_time_to_percent() {
        let mut parser = ProgressParser::new(Some(200.0));
        assert_eq!(parser.feed("frame=100"), None);
        assert_eq!(parser.feed("out_time_us=50000000"), None);
        assert_eq!(parser.feed("progress=continue"), Some(25));
        parser.feed("out_time=00:03:20.00");
        assert_eq!(parser.feed("progress=continue"), Some(99));
        assert_eq!(parser.feed("progress=end"), Some(100));
        assert!(parser.is_finished());
    }

    #[test]
    fn test_progress_parser_without_duration() {
        let mut parser = ProgressParser::new(None);
        parser.feed("out_time_ms=1000000");
        assert_eq!(parser.feed("progress=continue"), None);
        parser.set_duration(4.0);
        assert_eq!(parser.feed("progress=continue"), Some(25));
    }

    #[test]
    fn test_classify_failure() {
        let fatal = classify_failure(Some(1), &["https://x: Server returned 404 Not Found".into()]);
        assert_eq!(fatal.kind, crate::domain::ErrorKind::Fatal);
        let transient = classify_failure(Some(1), &["Connection reset by peer".into()]);
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_build_args_maps_subtitles() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig::default());
        let stream = RawStream {
            url: "https://cdn.example/v.mp4".into(),
            headers: vec![("Referer".into(), "https://mirror.example".into())],
            quality: None,
            duration_secs: None,
            subtitles: vec![SubtitleTrack {
                lang: "en".into(),
                url: "https://cdn.example/en.srt".into(),
            }],
        };
        let args = transcoder.build_args(&stream, Path::new("/work/j1"));
        assert!(args.contains(&"Referer: https://mirror.example\r\n".to_string()));
        assert!(args.contains(&"1:0".to_string()));
        assert!(args.iter().any(|a| a.ends_with("sub_0_en.vtt")));
        assert!(args.iter().any(|a| a.ends_with(PLAYLIST_NAME)));
    }
}
