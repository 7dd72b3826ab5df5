use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;

use crate::config::DownloadConfig;
use crate::process::{CommandRunner, format_command};

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    /// Best mp4 video merged with best audio.
    Video,
    /// Audio track only, transcoded by ffmpeg.
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Full argv for downloading one URL.
pub fn download_argv(
    config: &DownloadConfig,
    kind: MediaKind,
    url: &str,
    output_dir: &Utf8Path,
    ffmpeg_dir: Option<&Utf8Path>,
) -> Vec<String> {
    let mut argv = config.ytdlp.clone();
    argv.push("--newline".to_owned());
    match kind {
        MediaKind::Video => {
            argv.push("-f".to_owned());
            argv.push(config.video_format.clone());
        }
        MediaKind::Audio => {
            argv.push("--extract-audio".to_owned());
            argv.push("--audio-format".to_owned());
            argv.push(config.audio_format.clone());
        }
    }
    argv.push("-o".to_owned());
    argv.push(output_dir.join(&config.template).into_string());
    if kind == MediaKind::Video {
        argv.push("--merge-output-format".to_owned());
        argv.push(config.merge_format.clone());
    }
    if let Some(dir) = ffmpeg_dir {
        argv.push("--ffmpeg-location".to_owned());
        argv.push(dir.to_string());
    }
    argv.push(url.to_owned());
    argv
}

pub fn playlist_argv(config: &DownloadConfig, url: &str) -> Vec<String> {
    let mut argv = config.ytdlp.clone();
    argv.push("--flat-playlist".to_owned());
    argv.push("-J".to_owned());
    argv.push(url.to_owned());
    argv
}

pub fn is_playlist(url: &str) -> bool {
    url.to_lowercase().contains("playlist")
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<FlatEntry>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
}

/// Watch URLs for every entry of a `--flat-playlist -J` document.
pub fn parse_playlist(json: &str) -> Result<Vec<String>> {
    let playlist: FlatPlaylist =
        serde_json::from_str(json).context("parsing yt-dlp playlist JSON")?;
    Ok(playlist
        .entries
        .into_iter()
        .filter_map(|entry| entry.id)
        .filter(|id| !id.is_empty())
        .map(|id| format!("{WATCH_URL_PREFIX}{id}"))
        .collect())
}

/// Ask yt-dlp for the videos of a playlist.
pub fn list_playlist(
    runner: &dyn CommandRunner,
    config: &DownloadConfig,
    url: &str,
) -> Result<Vec<String>> {
    let argv = playlist_argv(config, url);
    let captured = runner.output(&argv)?;
    if !captured.outcome.success() {
        bail!(
            "retrieving playlist videos with `{}` failed with exit code {:?}: {}",
            format_command(&argv),
            captured.outcome.code,
            captured.stderr.trim()
        );
    }
    parse_playlist(&captured.stdout)
}

/// Percentage from a `[download]  42.3% of ...` progress line.
pub fn parse_progress(line: &str) -> Option<f32> {
    static PROGRESS: OnceLock<Regex> = OnceLock::new();
    let re = PROGRESS.get_or_init(|| {
        Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("progress regex is valid")
    });
    re.captures(line.trim_start())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
