use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use toml_edit::{DocumentMut, Item, Table, value};

use crate::templates;

pub const DEFAULT_FFMPEG_URL: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";

/// Root configuration document, `.ytdl/config.toml` or `ytdl.toml` by default.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub build: BuildConfig,
    pub ffmpeg: FfmpegConfig,
    pub download: DownloadConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Script handed to the packager.
    pub entry: String,
    /// Executable name; the generated manifest is `<name>.spec`.
    pub name: Option<String>,
    pub packager: Vec<String>,
    pub icon: Option<String>,
    pub hidden_imports: Vec<String>,
    pub data: Vec<String>,
    pub onefile: bool,
    pub windowed: bool,
    pub clean: bool,
    pub build_dir: String,
    /// External fetch helper argv; the built-in ffmpeg fetcher runs when unset.
    pub fetch_command: Option<Vec<String>>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            entry: "yt_downloader.py".to_owned(),
            name: None,
            packager: vec!["pyinstaller".to_owned()],
            icon: Some("icon.png".to_owned()),
            hidden_imports: vec!["ffmpeg_manager".to_owned()],
            data: vec!["ffmpeg_manager.py".to_owned()],
            onefile: true,
            windowed: true,
            clean: true,
            build_dir: "build".to_owned(),
            fetch_command: None,
        }
    }
}

impl BuildConfig {
    pub fn app_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Utf8Path::new(&self.entry)
            .file_stem()
            .unwrap_or(self.entry.as_str())
            .to_owned()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FfmpegConfig {
    pub url: String,
    /// URL of a `.sha256` file for the archive; skipped when unset.
    pub checksum_url: Option<String>,
    pub binary: String,
    pub dir: String,
    pub timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FFMPEG_URL.to_owned(),
            checksum_url: None,
            binary: "ffmpeg.exe".to_owned(),
            dir: ".".to_owned(),
            timeout_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub output_dir: Option<String>,
    pub ytdlp: Vec<String>,
    pub jobs: Option<usize>,
    pub video_format: String,
    pub merge_format: String,
    pub audio_format: String,
    pub template: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            ytdlp: vec!["yt-dlp".to_owned()],
            jobs: None,
            video_format: "bestvideo[ext=mp4]+bestaudio/best".to_owned(),
            merge_format: "mp4".to_owned(),
            audio_format: "mp3".to_owned(),
            template: "%(title)s.%(ext)s".to_owned(),
        }
    }
}

/// Load a configuration file, falling back to defaults when it does not exist.
pub fn load_from_path(path: &Utf8Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::debug!(%path, "config file absent, using defaults");
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
    parse(&raw).with_context(|| format!("parsing config {}", path))
}

pub fn parse(raw: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> Result<()> {
        if self.build.packager.is_empty() {
            bail!("build.packager must not be empty");
        }
        if self.build.entry.trim().is_empty() {
            bail!("build.entry must not be empty");
        }
        if matches!(&self.build.fetch_command, Some(argv) if argv.is_empty()) {
            bail!("build.fetch_command must not be empty when set");
        }
        if self.download.ytdlp.is_empty() {
            bail!("download.ytdlp must not be empty");
        }
        if self.download.jobs == Some(0) {
            bail!("download.jobs must be at least 1");
        }
        if self.ffmpeg.binary.trim().is_empty() {
            bail!("ffmpeg.binary must not be empty");
        }
        Ok(())
    }
}

pub fn write_example_config(path: &Utf8Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        bail!("{} already exists; rerun with --force to overwrite", path);
    }

    templates::write_template(path, "config/example.config.toml")
}

/// Set `section.key` in the config file, keeping the rest of the document intact.
pub fn set_value(path: &Utf8Path, key: &str, raw_value: &str) -> Result<()> {
    let (section, field) = key
        .split_once('.')
        .filter(|(s, f)| !s.is_empty() && !f.is_empty() && !f.contains('.'))
        .ok_or_else(|| anyhow!("key must look like `section.field`, got `{}`", key))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent))?;
    }

    let mut doc: DocumentMut = if path.exists() {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        raw.parse()
            .with_context(|| format!("parsing config {}", path))?
    } else {
        DocumentMut::new()
    };

    if !doc.as_table().contains_key(section) {
        doc[section] = Item::Table(Table::new());
    }
    let table = doc
        .get_mut(section)
        .and_then(Item::as_table_mut)
        .ok_or_else(|| anyhow!("config has non-table `{}` entry", section))?;
    table.insert(field, coerce_value(raw_value));

    // Reject edits that would leave the file unloadable.
    let rendered = doc.to_string();
    parse(&rendered).with_context(|| format!("`{}` = {} is not a valid setting", key, raw_value))?;

    fs::write(path, rendered).with_context(|| format!("writing config {}", path))
}

fn coerce_value(raw: &str) -> Item {
    // A double-quoted argument is always a TOML string, e.g. `"2024"`.
    if raw.len() >= 2
        && raw.starts_with('"')
        && raw.ends_with('"')
        && let Ok(parsed) = format!("v = {raw}").parse::<DocumentMut>()
        && let Some(text) = parsed.get("v").and_then(Item::as_str)
    {
        return value(text);
    }
    if let Ok(flag) = raw.parse::<bool>() {
        return value(flag);
    }
    if let Ok(number) = raw.parse::<i64>() {
        return value(number);
    }
    if let Ok(parsed) = format!("v = {raw}").parse::<DocumentMut>() {
        if let Some(array) = parsed.get("v").and_then(Item::as_array) {
            return value(array.clone());
        }
    }
    value(raw)
}

pub fn format_summary(config: &AppConfig) -> String {
    let mut out = String::new();
    let build = &config.build;
    let _ = writeln!(out, "Build:");
    let _ = writeln!(out, "  entry: {} (name: {})", build.entry, build.app_name());
    let _ = writeln!(out, "  packager: {}", build.packager.join(" "));
    let _ = writeln!(out, "  icon: {}", build.icon.as_deref().unwrap_or("<none>"));
    let _ = writeln!(out, "  hidden imports: {}", join_or_none(&build.hidden_imports));
    let _ = writeln!(out, "  data files: {}", join_or_none(&build.data));
    let _ = writeln!(
        out,
        "  onefile: {}, windowed: {}, clean: {}",
        build.onefile, build.windowed, build.clean
    );
    let fetch = build
        .fetch_command
        .as_ref()
        .map(|argv| argv.join(" "))
        .unwrap_or_else(|| "<built-in>".to_owned());
    let _ = writeln!(out, "  fetch helper: {}", fetch);

    let ffmpeg = &config.ffmpeg;
    let _ = writeln!(out, "FFmpeg:");
    let _ = writeln!(out, "  binary: {}/{}", ffmpeg.dir, ffmpeg.binary);
    let _ = writeln!(out, "  url: {}", ffmpeg.url);
    let _ = writeln!(
        out,
        "  checksum: {}",
        ffmpeg.checksum_url.as_deref().unwrap_or("<unverified>")
    );

    let download = &config.download;
    let _ = writeln!(out, "Download:");
    let _ = writeln!(out, "  yt-dlp: {}", download.ytdlp.join(" "));
    let _ = writeln!(
        out,
        "  output dir: {}",
        download.output_dir.as_deref().unwrap_or("<cwd>")
    );
    let jobs = download
        .jobs
        .map(|j| j.to_string())
        .unwrap_or_else(|| "auto".to_owned());
    let _ = writeln!(out, "  jobs: {}", jobs);
    let _ = writeln!(
        out,
        "  video: {} -> {}, audio: {}",
        download.video_format, download.merge_format, download.audio_format
    );

    out
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_owned()
    } else {
        items.join(", ")
    }
}

/// Where a config path came from, for display.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigPathSource {
    Explicit,
    Discovered,
    HomeDefault,
}

impl ConfigPathSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigPathSource::Explicit => "explicit",
            ConfigPathSource::Discovered => "discovered",
            ConfigPathSource::HomeDefault => "home-default",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedConfigPath {
    pub path: Utf8PathBuf,
    pub source: ConfigPathSource,
}

/// Nearest `.ytdl/config.toml` or `ytdl.toml` from `start` upwards, else the home default.
pub fn resolve_path(explicit: Option<&Utf8Path>, start: &Utf8Path) -> Result<ResolvedConfigPath> {
    if let Some(path) = explicit {
        return Ok(ResolvedConfigPath {
            path: path.to_owned(),
            source: ConfigPathSource::Explicit,
        });
    }

    let mut dir = Some(start);
    while let Some(current) = dir {
        let preferred = current.join(".ytdl").join("config.toml");
        if preferred.exists() {
            return Ok(ResolvedConfigPath {
                path: preferred,
                source: ConfigPathSource::Discovered,
            });
        }
        let flat = current.join("ytdl.toml");
        if flat.exists() {
            return Ok(ResolvedConfigPath {
                path: flat,
                source: ConfigPathSource::Discovered,
            });
        }
        dir = current.parent();
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    let home = Utf8PathBuf::from_path_buf(home)
        .map_err(|_| anyhow!("home directory must be valid UTF-8"))?;
    Ok(ResolvedConfigPath {
        path: home.join(".ytdl").join("config.toml"),
        source: ConfigPathSource::HomeDefault,
    })
}
