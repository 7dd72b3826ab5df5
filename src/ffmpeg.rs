use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::config::FfmpegConfig;
use crate::process::CommandRunner;
use crate::util;

/// Where a usable ffmpeg was found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FfmpegLocation {
    /// The vendored binary sits in this directory.
    Local(Utf8PathBuf),
    /// `ffmpeg` on `PATH` answers `-version`; holds the first banner line.
    System(String),
    Missing,
}

impl FfmpegLocation {
    pub fn is_available(&self) -> bool {
        !matches!(self, FfmpegLocation::Missing)
    }

    /// Directory to hand to yt-dlp's `--ffmpeg-location`, if any.
    pub fn directory(&self) -> Option<&Utf8Path> {
        match self {
            FfmpegLocation::Local(dir) => Some(dir.as_path()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchOutcome {
    AlreadyPresent(Utf8PathBuf),
    Downloaded(Utf8PathBuf),
}

/// Remote side of a fetch: the archive body and its published checksum.
pub trait ArchiveSource {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
    fn fetch_text(&self, url: &str) -> Result<String>;
}

pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ytdl-kit/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl ArchiveSource for HttpSource {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()
            .with_context(|| format!("downloading {}", url))?;
        if let Some(len) = resp.content_length() {
            tracing::info!(bytes = len, "downloading ffmpeg archive");
        }
        resp.copy_to(sink)
            .with_context(|| format!("reading body of {}", url))
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()
            .with_context(|| format!("downloading {}", url))?;
        resp.text().with_context(|| format!("reading body of {}", url))
    }
}

/// Locates, and when needed downloads, the vendored ffmpeg binary.
pub struct FfmpegManager<'a> {
    config: &'a FfmpegConfig,
    dir: Utf8PathBuf,
    runner: &'a dyn CommandRunner,
    source: &'a dyn ArchiveSource,
}

impl<'a> FfmpegManager<'a> {
    pub fn new(
        config: &'a FfmpegConfig,
        dir: Utf8PathBuf,
        runner: &'a dyn CommandRunner,
        source: &'a dyn ArchiveSource,
    ) -> Self {
        Self {
            config,
            dir,
            runner,
            source,
        }
    }

    pub fn binary_path(&self) -> Utf8PathBuf {
        self.dir.join(&self.config.binary)
    }

    pub fn locate(&self) -> FfmpegLocation {
        locate(&self.dir, &self.config.binary, self.runner)
    }

    /// Locate ffmpeg and download it when nothing usable exists.
    pub fn ensure(&self) -> Result<FfmpegLocation> {
        let location = self.locate();
        if location.is_available() {
            return Ok(location);
        }

        tracing::warn!("no system ffmpeg found; downloading {}", self.config.binary);
        self.fetch(false)
            .context("ffmpeg is not available and could not be downloaded automatically")?;

        let location = self.locate();
        if !location.is_available() {
            bail!(
                "ffmpeg is still not available after downloading it; install ffmpeg manually or put it on PATH"
            );
        }
        Ok(location)
    }

    /// Download and extract the binary. Without `force` an existing copy is kept.
    pub fn fetch(&self, force: bool) -> Result<FetchOutcome> {
        let target = self.binary_path();
        if !force && target.is_file() {
            tracing::info!(path = %target, "ffmpeg already present, skipping download");
            return Ok(FetchOutcome::AlreadyPresent(target));
        }

        util::fs::ensure_dir(&self.dir)
            .with_context(|| format!("creating directory {}", self.dir))?;

        tracing::info!(url = %self.config.url, "downloading ffmpeg");
        let mut archive = tempfile::Builder::new()
            .prefix("ffmpeg-")
            .suffix(".zip")
            .tempfile()
            .context("creating temporary archive file")?;
        let bytes = self.source.download(&self.config.url, archive.as_file_mut())?;
        archive
            .as_file_mut()
            .flush()
            .context("flushing temporary archive file")?;
        tracing::debug!(bytes, "archive downloaded");

        if let Some(checksum_url) = &self.config.checksum_url {
            let manifest = self.source.fetch_text(checksum_url)?;
            let expected = parse_sha256_token(&manifest)
                .ok_or_else(|| anyhow!("no SHA-256 digest found at {}", checksum_url))?;
            verify_checksum(archive.as_file_mut(), &expected)?;
            tracing::info!("archive checksum verified");
        }

        tracing::info!("extracting {}", self.config.binary);
        extract_binary(archive.as_file_mut(), &self.config.binary, &target)?;
        tracing::info!(path = %target, "ffmpeg downloaded and extracted");
        Ok(FetchOutcome::Downloaded(target))
    }
}

/// Vendored copy in `dir` first, then `ffmpeg` on `PATH`.
pub fn locate(dir: &Utf8Path, binary: &str, runner: &dyn CommandRunner) -> FfmpegLocation {
    if dir.join(binary).is_file() {
        tracing::info!(%dir, "found vendored {}", binary);
        return FfmpegLocation::Local(dir.to_owned());
    }
    tracing::info!("{} not found locally", binary);

    match system_version(runner) {
        Some(version) => {
            tracing::info!(%version, "system ffmpeg is available");
            FfmpegLocation::System(version)
        }
        None => FfmpegLocation::Missing,
    }
}

/// First line of `ffmpeg -version` when a system ffmpeg runs.
fn system_version(runner: &dyn CommandRunner) -> Option<String> {
    let argv = vec!["ffmpeg".to_owned(), "-version".to_owned()];
    match runner.output(&argv) {
        Ok(captured) if captured.outcome.success() => Some(
            captured
                .stdout
                .lines()
                .next()
                .unwrap_or("ffmpeg")
                .trim()
                .to_owned(),
        ),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(error = %err, "system ffmpeg probe failed");
            None
        }
    }
}

/// Copy the archive entry whose file name matches `binary` (case-insensitive) to `target`.
pub fn extract_binary(archive: &mut File, binary: &str, target: &Utf8Path) -> Result<()> {
    archive
        .seek(SeekFrom::Start(0))
        .context("rewinding archive")?;
    let mut zip = ZipArchive::new(&mut *archive).context("reading ffmpeg archive")?;
    let wanted = binary.to_lowercase();

    let index = (0..zip.len())
        .find(|&idx| {
            zip.by_index(idx).is_ok_and(|entry| {
                entry.is_file() && entry_file_name(entry.name()).to_lowercase() == wanted
            })
        })
        .ok_or_else(|| anyhow!("{} not found in the downloaded archive", binary))?;

    let parent = target
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temporary file in {}", parent))?;
    {
        let mut entry = zip.by_index(index).context("reading archive entry")?;
        io::copy(&mut entry, staged.as_file_mut())
            .with_context(|| format!("extracting {}", binary))?;
    }
    make_executable(staged.as_file())?;
    staged
        .persist(target)
        .map_err(|err| anyhow!("persisting {}: {}", target, err.error))?;
    Ok(())
}

fn entry_file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(unix)]
fn make_executable(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))
        .context("marking ffmpeg executable")
}

#[cfg(not(unix))]
fn make_executable(_file: &File) -> Result<()> {
    Ok(())
}

/// The first token of a `.sha256` file, when it is a hex digest.
pub fn parse_sha256_token(payload: &str) -> Option<String> {
    let token = payload.split_whitespace().next()?;
    (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}

fn verify_checksum(file: &mut File, expected: &str) -> Result<()> {
    file.seek(SeekFrom::Start(0)).context("rewinding archive")?;
    let mut hasher = Sha256::new();
    io::copy(file, &mut hasher).context("hashing archive")?;
    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        bail!("checksum mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}
