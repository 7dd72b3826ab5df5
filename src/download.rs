use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::DownloadConfig;
use crate::process::CommandRunner;
use crate::ytdlp::{self, MediaKind};

/// Status sink shared by all workers of a batch.
pub type StatusFn<'a> = &'a (dyn Fn(&str) + Sync);

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub struct Downloader<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DownloadConfig,
    output_dir: Utf8PathBuf,
    ffmpeg_dir: Option<Utf8PathBuf>,
    jobs: usize,
}

impl<'a> Downloader<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        config: &'a DownloadConfig,
        output_dir: Utf8PathBuf,
        ffmpeg_dir: Option<Utf8PathBuf>,
        jobs: usize,
    ) -> Self {
        Self {
            runner,
            config,
            output_dir,
            ffmpeg_dir,
            jobs: jobs.max(1),
        }
    }

    /// Download a single URL or, for playlists, every entry of it.
    pub fn process(&self, kind: MediaKind, url: &str, status: StatusFn<'_>) -> Result<BatchReport> {
        if !ytdlp::is_playlist(url) {
            let ok = self.download_one(kind, url, status);
            return Ok(BatchReport {
                total: 1,
                succeeded: usize::from(ok),
                failed: if ok { Vec::new() } else { vec![url.to_owned()] },
            });
        }

        status("Fetching playlist information...");
        let urls = ytdlp::list_playlist(self.runner, self.config, url)?;
        if urls.is_empty() {
            status("No videos found in playlist.");
            return Ok(BatchReport::default());
        }
        Ok(self.download_batch(kind, &urls, status))
    }

    /// Run `urls` through a fixed pool of workers; one failure never stops the rest.
    pub fn download_batch(&self, kind: MediaKind, urls: &[String], status: StatusFn<'_>) -> BatchReport {
        let total = urls.len();
        let workers = self.jobs.min(total).max(1);
        status(&format!("Found {total} items. Using {workers} threads..."));

        let next = AtomicUsize::new(0);
        let progress = Mutex::new(BatchReport {
            total,
            ..BatchReport::default()
        });

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(url) = urls.get(idx) else {
                            break;
                        };
                        let ok = self.download_one(kind, url, status);

                        let mut report = progress
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if ok {
                            report.succeeded += 1;
                        } else {
                            report.failed.push(url.clone());
                        }
                        let done = report.succeeded + report.failed.len();
                        status(&format!("Downloaded {done}/{total}"));
                    }
                });
            }
        });

        status("Playlist download completed!");
        progress
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One yt-dlp run. Returns whether it exited cleanly.
    pub fn download_one(&self, kind: MediaKind, url: &str, status: StatusFn<'_>) -> bool {
        let argv = ytdlp::download_argv(
            self.config,
            kind,
            url,
            &self.output_dir,
            self.ffmpeg_dir.as_deref(),
        );
        status(&format!("Starting {} download: {}", kind.as_str(), url));

        let on_line = |line: &str| match ytdlp::parse_progress(line) {
            Some(percent) => tracing::debug!(%url, percent, "progress"),
            None => tracing::debug!(%url, "{}", line),
        };

        match self.runner.stream(&argv, &on_line) {
            Ok(outcome) if outcome.success() => {
                status(&format!("Completed {}: {}", kind.as_str(), url));
                true
            }
            Ok(outcome) => {
                tracing::warn!(%url, code = ?outcome.code, "yt-dlp exited with an error");
                status(&format!("Error downloading {}: {}", kind.as_str(), url));
                false
            }
            Err(err) => {
                status(&format!("Exception downloading {}: {}\n{:#}", kind.as_str(), url, err));
                false
            }
        }
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }
}
