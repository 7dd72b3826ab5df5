use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(
    name = "ytdl",
    version,
    about = "Package the YouTube downloader, provision its ffmpeg, and run downloads"
)]
pub struct Cli {
    #[arg(short = 'C', long = "chdir", global = true)]
    pub chdir: Option<PathBuf>,
    #[arg(short = 'f', long = "file", global = true)]
    pub file: Option<PathBuf>,
    #[arg(short = 'n', long = "dry-run", global = true)]
    pub dry_run: bool,
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Append a record of every external command to this file.
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch ffmpeg if missing, run the packager, and remove its intermediate outputs.
    Build(BuildArgs),
    /// Remove the packager's build directory and generated spec file.
    Clean,
    /// Locate or download the vendored ffmpeg binary.
    Ffmpeg {
        #[command(subcommand)]
        command: FfmpegCommand,
    },
    /// Download a video (or every video of a playlist) as mp4.
    Video(DownloadArgs),
    /// Download audio (or every track of a playlist) as mp3.
    Audio(DownloadArgs),
    /// Configuration display, validation, and editing.
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommand>,
    },
}

#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Keep `build/` and the generated spec file.
    #[arg(long = "no-clean")]
    pub no_clean: bool,
    /// Icon resource to embed.
    #[arg(long = "icon", conflicts_with = "no_icon")]
    pub icon: Option<String>,
    /// Build without an icon.
    #[arg(long = "no-icon")]
    pub no_icon: bool,
    /// Extra modules the packager must bundle.
    #[arg(long = "hidden-import")]
    pub hidden_imports: Vec<String>,
    /// Name of the produced executable.
    #[arg(long = "name")]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum FfmpegCommand {
    /// Report where ffmpeg would be taken from, without downloading.
    Locate,
    /// Locate ffmpeg and download it when none is usable.
    Ensure,
    /// Download and extract the ffmpeg binary.
    Fetch {
        /// Download even if the binary already exists.
        #[arg(long = "force-download", visible_alias = "force")]
        force_download: bool,
        /// Directory to place the binary in (defaults to `ffmpeg.dir`).
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    pub url: String,
    /// Download folder (defaults to `download.output_dir`, then the current directory).
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Concurrent playlist downloads.
    #[arg(short = 'j', long = "jobs", value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Show,
    Path,
    Check,
    Generate {
        #[arg()]
        path: Option<PathBuf>,
        #[arg(long = "force", default_value_t = false)]
        force: bool,
    },
    /// Set `section.field` to a value, e.g. `download.jobs 4`.
    Set { key: String, value: String },
}

/// Helper entry point so `main` can stay minimal.
pub fn parse() -> Cli {
    Cli::parse()
}
