use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::build::{self, BuildPlan};
use crate::cli::{BuildArgs, Cli, Command, ConfigCommand, DownloadArgs, FfmpegCommand};
use crate::config::{self, AppConfig, BuildConfig, ConfigPathSource, ResolvedConfigPath};
use crate::download::{self, Downloader};
use crate::ffmpeg::{self, FetchOutcome, FfmpegLocation, FfmpegManager, HttpSource};
use crate::process::{CommandLog, SystemRunner, format_command};
use crate::util;
use crate::ytdlp::{self, MediaKind};

pub fn run(cli: Cli) -> Result<()> {
    let ctx = CliContext::from(&cli);
    ctx.apply_chdir()?;

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        other => {
            let state = AppState::new(ctx)?;
            handle_with_state(&state, other)
        }
    }
}

fn handle_with_state(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Build(args) => handle_build(state, args),
        Command::Clean => handle_clean(state),
        Command::Ffmpeg { command } => handle_ffmpeg(state, command),
        Command::Video(args) => handle_download(state, MediaKind::Video, args),
        Command::Audio(args) => handle_download(state, MediaKind::Audio, args),
        Command::Config { .. } => unreachable!("config commands handled earlier"),
    }
}

fn handle_build(state: &AppState, args: BuildArgs) -> Result<()> {
    let build_config = apply_build_overrides(&state.config.build, args);
    let plan = BuildPlan::new(&build_config, &state.config.ffmpeg, &state.root);

    if state.ctx.dry_run {
        println!("Build plan for {} (dry-run):", build_config.entry);
        for (idx, step) in plan.describe().iter().enumerate() {
            println!("  [{}] {}", idx + 1, step);
        }
        return Ok(());
    }

    println!("Building `{}`", build_config.app_name());
    let start = Instant::now();
    let fetch = || -> Result<()> {
        let source = state.http_source()?;
        let manager = state.ffmpeg_manager(&source, None);
        manager.fetch(true).map(|_| ())
    };
    let report = build::execute(&plan, &state.runner, &fetch)?;

    if report.fetched {
        println!("Fetched {}", plan.vendored);
    }
    for path in &report.cleaned {
        println!("Removed {}", path);
    }
    println!(
        "[ok] {} (completed in {:.2?})",
        format_command(&plan.packager),
        start.elapsed()
    );
    Ok(())
}

fn apply_build_overrides(base: &BuildConfig, args: BuildArgs) -> BuildConfig {
    let mut build_config = base.clone();
    if args.no_clean {
        build_config.clean = false;
    }
    if args.no_icon {
        build_config.icon = None;
    } else if let Some(icon) = args.icon {
        build_config.icon = Some(icon);
    }
    for module in args.hidden_imports {
        if !build_config.hidden_imports.contains(&module) {
            build_config.hidden_imports.push(module);
        }
    }
    if let Some(name) = args.name {
        build_config.name = Some(name);
    }
    build_config
}

fn handle_clean(state: &AppState) -> Result<()> {
    let paths = build::cleanup_paths(&state.config.build, &state.root);
    if state.ctx.dry_run {
        for path in paths.iter().filter(|p| p.exists()) {
            println!("[dry-run] would remove {}", path);
        }
        return Ok(());
    }

    let removed = build::clean(&paths)?;
    if removed.is_empty() {
        println!("Nothing to clean.");
    }
    for path in removed {
        println!("Removed {}", path);
    }
    Ok(())
}

fn handle_ffmpeg(state: &AppState, command: FfmpegCommand) -> Result<()> {
    match command {
        FfmpegCommand::Locate => {
            let location =
                ffmpeg::locate(&state.ffmpeg_dir(), &state.config.ffmpeg.binary, &state.runner);
            print_location(&location);
            Ok(())
        }
        FfmpegCommand::Ensure => {
            if state.ctx.dry_run {
                println!("[dry-run] would locate ffmpeg and download it if missing");
                return Ok(());
            }
            let source = state.http_source()?;
            let location = state.ffmpeg_manager(&source, None).ensure()?;
            print_location(&location);
            Ok(())
        }
        FfmpegCommand::Fetch {
            force_download,
            dir,
        } => {
            let dir = dir.map(utf8_path).transpose()?;
            let source = state.http_source()?;
            let manager = state.ffmpeg_manager(&source, dir);
            if state.ctx.dry_run {
                println!(
                    "[dry-run] would download {} into {}{}",
                    state.config.ffmpeg.url,
                    manager.binary_path(),
                    if force_download { " (forced)" } else { "" }
                );
                return Ok(());
            }
            match manager.fetch(force_download)? {
                FetchOutcome::AlreadyPresent(path) => {
                    println!("{} already present; pass --force-download to replace it", path)
                }
                FetchOutcome::Downloaded(path) => {
                    println!("ffmpeg successfully downloaded and extracted to {}", path)
                }
            }
            Ok(())
        }
    }
}

fn print_location(location: &FfmpegLocation) {
    match location {
        FfmpegLocation::Local(dir) => println!("FFmpeg is available locally at: {}", dir),
        FfmpegLocation::System(version) => {
            println!("FFmpeg is available system-wide.");
            println!("  {}", version);
        }
        FfmpegLocation::Missing => println!("FFmpeg is not available."),
    }
}

fn handle_download(state: &AppState, kind: MediaKind, args: DownloadArgs) -> Result<()> {
    let url = args.url.trim();
    if url.is_empty() {
        bail!("please enter a URL for the {} download", kind.as_str());
    }

    let output_dir = resolve_output_dir(
        args.output.map(utf8_path).transpose()?,
        state.config.download.output_dir.as_deref(),
        &state.root,
    )?;
    let jobs = args
        .jobs
        .map(usize::from)
        .or(state.config.download.jobs)
        .unwrap_or_else(download::default_jobs);

    if state.ctx.dry_run {
        let argv = ytdlp::download_argv(&state.config.download, kind, url, &output_dir, None);
        println!("[dry-run] {}", format_command(&argv));
        if ytdlp::is_playlist(url) {
            println!("[dry-run] playlist entries would run with {} workers", jobs);
        }
        return Ok(());
    }

    let source = state.http_source()?;
    let location = state.ffmpeg_manager(&source, None).ensure()?;
    util::fs::ensure_dir(&output_dir)
        .with_context(|| format!("creating download folder {}", output_dir))?;

    let downloader = Downloader::new(
        &state.runner,
        &state.config.download,
        output_dir,
        location.directory().map(Utf8Path::to_path_buf),
        jobs,
    );
    let status = |message: &str| println!("{}", message);
    let report = downloader.process(kind, url, &status)?;

    if !report.is_success() {
        bail!(
            "{} of {} downloads into {} failed: {}",
            report.failed.len(),
            report.total,
            downloader.output_dir(),
            report.failed.join(", ")
        );
    }
    Ok(())
}

/// CLI flag, then configured folder (with `~` expanded), then the working directory.
fn resolve_output_dir(
    flag: Option<Utf8PathBuf>,
    configured: Option<&str>,
    root: &Utf8Path,
) -> Result<Utf8PathBuf> {
    if let Some(dir) = flag {
        return Ok(absolutize(root, dir));
    }
    let Some(configured) = configured else {
        return Ok(root.to_owned());
    };
    let expanded = match configured.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
            let home = utf8_path(home)?;
            home.join(rest.trim_start_matches(['/', '\\']))
        }
        _ => Utf8PathBuf::from(configured),
    };
    Ok(absolutize(root, expanded))
}

fn absolutize(root: &Utf8Path, path: Utf8PathBuf) -> Utf8PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn handle_config(ctx: &CliContext, command: Option<ConfigCommand>) -> Result<()> {
    match command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => {
            let resolved = ctx.resolve_config_path()?;
            let config = config::load_from_path(&resolved.path)?;
            let origin = if resolved.path.exists() {
                resolved.source.as_str()
            } else {
                "not found, defaults"
            };
            println!("Config: {} ({})", resolved.path, origin);
            print!("{}", config::format_summary(&config));
            Ok(())
        }
        ConfigCommand::Path => {
            let resolved = ctx.resolve_config_path()?;
            println!("{}", resolved.path);
            Ok(())
        }
        ConfigCommand::Check => {
            let resolved = ctx.resolve_config_path()?;
            config::load_from_path(&resolved.path)?;
            println!("{} is valid ({})", resolved.path, resolved.source.as_str());
            Ok(())
        }
        ConfigCommand::Generate { path, force } => {
            let target = match path {
                Some(path) => utf8_path(path)?,
                None => ctx.resolve_config_path()?.path,
            };
            if ctx.dry_run {
                println!("[dry-run] would write example config to {}", target);
                return Ok(());
            }
            config::write_example_config(&target, force)?;
            println!("Wrote example config to {}", target);
            Ok(())
        }
        ConfigCommand::Set { key, value } => {
            let resolved = ctx.resolve_config_path()?;
            if ctx.dry_run {
                println!("[dry-run] would set {} = {} in {}", key, value, resolved.path);
                return Ok(());
            }
            config::set_value(&resolved.path, &key, &value)?;
            println!("Set {} = {} in {}", key, value, resolved.path);
            Ok(())
        }
    }
}

fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).map_err(|p| anyhow!("path must be valid UTF-8: {}", p.display()))
}

#[derive(Clone, Debug)]
struct CliContext {
    chdir: Option<PathBuf>,
    file: Option<PathBuf>,
    dry_run: bool,
    log_file: Option<PathBuf>,
}

impl CliContext {
    fn apply_chdir(&self) -> Result<()> {
        if let Some(path) = &self.chdir {
            std::env::set_current_dir(path)
                .with_context(|| format!("changing directory to {}", path.display()))?;
        }
        Ok(())
    }

    fn resolve_config_path(&self) -> Result<ResolvedConfigPath> {
        let explicit = self.file.clone().map(utf8_path).transpose()?;
        let cwd = utf8_path(std::env::current_dir().context("determining current directory")?)?;
        config::resolve_path(explicit.as_deref(), &cwd)
    }
}

impl From<&Cli> for CliContext {
    fn from(cli: &Cli) -> Self {
        Self {
            chdir: cli.chdir.clone(),
            file: cli.file.clone(),
            dry_run: cli.dry_run,
            log_file: cli.log_file.clone(),
        }
    }
}

struct AppState {
    ctx: CliContext,
    config: AppConfig,
    root: Utf8PathBuf,
    runner: SystemRunner,
}

impl AppState {
    fn new(ctx: CliContext) -> Result<Self> {
        let resolved = ctx.resolve_config_path()?;
        let config = config::load_from_path(&resolved.path)?;
        tracing::debug!(path = %resolved.path, source = resolved.source.as_str(), "resolved config");

        let root = utf8_path(std::env::current_dir().context("determining current directory")?)?;
        let log = ctx
            .log_file
            .clone()
            .map(utf8_path)
            .transpose()?
            .map(|path| CommandLog::new(absolutize(&root, path)));

        Ok(Self {
            ctx,
            config,
            root,
            runner: SystemRunner::new(log),
        })
    }

    fn http_source(&self) -> Result<HttpSource> {
        HttpSource::new(Duration::from_secs(self.config.ffmpeg.timeout_secs))
    }

    fn ffmpeg_dir(&self) -> Utf8PathBuf {
        let dir = Utf8Path::new(&self.config.ffmpeg.dir);
        if dir.as_str().is_empty() || dir == Utf8Path::new(".") {
            self.root.clone()
        } else {
            absolutize(&self.root, dir.to_owned())
        }
    }

    fn ffmpeg_manager<'a>(
        &'a self,
        source: &'a HttpSource,
        dir: Option<Utf8PathBuf>,
    ) -> FfmpegManager<'a> {
        let dir = dir
            .map(|d| absolutize(&self.root, d))
            .unwrap_or_else(|| self.ffmpeg_dir());
        FfmpegManager::new(&self.config.ffmpeg, dir, &self.runner, source)
    }
}
