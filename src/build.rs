use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{BuildConfig, FfmpegConfig};
use crate::process::{CommandRunner, format_command};
use crate::util;

/// Source/destination separator the packager expects in `--add-data`.
pub const DATA_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// How the vendored ffmpeg gets fetched when it is missing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchStep {
    BuiltIn,
    External(Vec<String>),
}

/// Everything one packaging run will do, resolved against a project root.
#[derive(Clone, Debug)]
pub struct BuildPlan {
    pub root: Utf8PathBuf,
    pub vendored: Utf8PathBuf,
    pub fetch: FetchStep,
    pub inputs: Vec<Utf8PathBuf>,
    pub packager: Vec<String>,
    pub cleanup: Vec<Utf8PathBuf>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildReport {
    pub fetched: bool,
    pub cleaned: Vec<Utf8PathBuf>,
}

impl BuildPlan {
    pub fn new(build: &BuildConfig, ffmpeg: &FfmpegConfig, root: &Utf8Path) -> Self {
        let vendored_rel = vendored_relative(ffmpeg);
        let fetch = match &build.fetch_command {
            Some(argv) => FetchStep::External(argv.clone()),
            None => FetchStep::BuiltIn,
        };

        let mut inputs = vec![root.join(&build.entry)];
        inputs.extend(build.data.iter().map(|d| root.join(d)));
        if let Some(icon) = icon(build) {
            inputs.push(root.join(icon));
        }

        let cleanup = if build.clean {
            cleanup_paths(build, root)
        } else {
            Vec::new()
        };

        Self {
            root: root.to_owned(),
            vendored: root.join(&vendored_rel),
            fetch,
            inputs,
            packager: packager_argv(build, &vendored_rel),
            cleanup,
        }
    }

    /// Human-readable steps, used by `--dry-run`.
    pub fn describe(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if self.vendored.is_file() {
            steps.push(format!("use vendored {}", self.vendored));
        } else {
            match &self.fetch {
                FetchStep::BuiltIn => {
                    steps.push(format!("fetch {} (forced download)", self.vendored))
                }
                FetchStep::External(argv) => steps.push(format!("run {}", format_command(argv))),
            }
        }
        steps.push(format!("run {}", format_command(&self.packager)));
        for path in &self.cleanup {
            steps.push(format!("remove {}", path));
        }
        steps
    }
}

fn vendored_relative(ffmpeg: &FfmpegConfig) -> Utf8PathBuf {
    let dir = Utf8Path::new(&ffmpeg.dir);
    if dir.as_str().is_empty() || dir == Utf8Path::new(".") {
        Utf8PathBuf::from(&ffmpeg.binary)
    } else {
        dir.join(&ffmpeg.binary)
    }
}

fn icon(build: &BuildConfig) -> Option<&str> {
    build
        .icon
        .as_deref()
        .map(str::trim)
        .filter(|icon| !icon.is_empty())
}

/// The packager argv: single file, no console, bundled ffmpeg and data, then the entry script.
pub fn packager_argv(build: &BuildConfig, vendored: &Utf8Path) -> Vec<String> {
    let mut argv = build.packager.clone();
    if build.onefile {
        argv.push("--onefile".to_owned());
    }
    if build.windowed {
        argv.push("--windowed".to_owned());
    }
    if let Some(name) = &build.name {
        argv.push("--name".to_owned());
        argv.push(name.clone());
    }
    argv.push("--add-binary".to_owned());
    argv.push(format!("{vendored}{DATA_SEPARATOR}."));
    for data in &build.data {
        argv.push("--add-data".to_owned());
        argv.push(format!("{data}{DATA_SEPARATOR}."));
    }
    for module in &build.hidden_imports {
        argv.push("--hidden-import".to_owned());
        argv.push(module.clone());
    }
    if let Some(icon) = icon(build) {
        argv.push("--icon".to_owned());
        argv.push(icon.to_owned());
    }
    argv.push(build.entry.clone());
    argv
}

/// The packager's intermediate outputs: the work directory and the generated manifest.
pub fn cleanup_paths(build: &BuildConfig, root: &Utf8Path) -> Vec<Utf8PathBuf> {
    vec![
        root.join(&build.build_dir),
        root.join(format!("{}.spec", build.app_name())),
    ]
}

/// Remove each path that exists. Absent paths are skipped.
pub fn clean(paths: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    let mut removed = Vec::new();
    for path in paths {
        if util::fs::remove_if_exists(path).with_context(|| format!("removing {}", path))? {
            tracing::info!(%path, "removed");
            removed.push(path.clone());
        } else {
            tracing::debug!(%path, "nothing to remove");
        }
    }
    Ok(removed)
}

fn preflight(plan: &BuildPlan) -> Result<()> {
    let missing: Vec<String> = plan
        .inputs
        .iter()
        .filter(|path| !path.exists())
        .map(|path| path.to_string())
        .collect();
    if !missing.is_empty() {
        bail!("missing build inputs: {}", missing.join(", "));
    }
    Ok(())
}

/// Run the plan: fetch ffmpeg only when it is missing, package, then clean up.
pub fn execute(
    plan: &BuildPlan,
    runner: &dyn CommandRunner,
    builtin_fetch: &dyn Fn() -> Result<()>,
) -> Result<BuildReport> {
    preflight(plan)?;

    let mut report = BuildReport::default();
    if plan.vendored.is_file() {
        tracing::info!(path = %plan.vendored, "vendored ffmpeg present");
    } else {
        tracing::info!(path = %plan.vendored, "vendored ffmpeg missing, forcing download");
        match &plan.fetch {
            FetchStep::BuiltIn => builtin_fetch().context("fetching ffmpeg")?,
            FetchStep::External(argv) => {
                let outcome = runner.status(argv)?;
                if !outcome.success() {
                    bail!(
                        "fetch helper `{}` failed with exit code {:?}",
                        format_command(argv),
                        outcome.code
                    );
                }
            }
        }
        if !plan.vendored.is_file() {
            bail!("fetch finished but {} is still missing", plan.vendored);
        }
        report.fetched = true;
    }

    let render = format_command(&plan.packager);
    tracing::info!(command = %render, "packaging");
    let outcome = runner.status(&plan.packager)?;
    if !outcome.success() {
        bail!("command `{}` failed with exit code {:?}", render, outcome.code);
    }

    report.cleaned = clean(&plan.cleanup)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;
    use crate::process::testing::FakeRunner;
    use crate::util::testing::unique_temp_dir;

    fn project(label: &str, with_ffmpeg: bool) -> Utf8PathBuf {
        let root = unique_temp_dir(label);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("yt_downloader.py"), "print('app')").unwrap();
        fs::write(root.join("ffmpeg_manager.py"), "print('mgr')").unwrap();
        fs::write(root.join("icon.png"), b"png").unwrap();
        if with_ffmpeg {
            fs::write(root.join("ffmpeg.exe"), b"bin").unwrap();
        }
        root
    }

    fn no_fetch() -> Result<()> {
        Ok(())
    }

    /// Simulates the packager leaving its work directory and manifest behind.
    fn packager_runner(root: &Utf8Path) -> FakeRunner {
        let root = root.to_owned();
        FakeRunner::new().effect(
            |argv| argv[0] == "pyinstaller",
            move |_| {
                fs::create_dir_all(root.join("build").join("yt_downloader")).unwrap();
                fs::write(root.join("yt_downloader.spec"), "# spec").unwrap();
                fs::create_dir_all(root.join("dist")).unwrap();
                fs::write(root.join("dist").join("yt_downloader.exe"), b"exe").unwrap();
            },
        )
    }

    #[test]
    fn packager_argv_has_fixed_flag_set() {
        let build = BuildConfig::default();
        let argv = packager_argv(&build, Utf8Path::new("ffmpeg.exe"));
        let sep = DATA_SEPARATOR;
        assert_eq!(
            argv,
            vec![
                "pyinstaller".to_owned(),
                "--onefile".to_owned(),
                "--windowed".to_owned(),
                "--add-binary".to_owned(),
                format!("ffmpeg.exe{sep}."),
                "--add-data".to_owned(),
                format!("ffmpeg_manager.py{sep}."),
                "--hidden-import".to_owned(),
                "ffmpeg_manager".to_owned(),
                "--icon".to_owned(),
                "icon.png".to_owned(),
                "yt_downloader.py".to_owned(),
            ]
        );
    }

    #[test]
    fn empty_icon_and_no_hidden_imports_are_omitted() {
        let build = BuildConfig {
            icon: Some(String::new()),
            hidden_imports: Vec::new(),
            name: Some("Downloader".to_owned()),
            ..BuildConfig::default()
        };
        let argv = packager_argv(&build, Utf8Path::new("vendor/ffmpeg.exe"));
        assert!(!argv.iter().any(|a| a == "--icon" || a == "--hidden-import"));
        assert!(argv.windows(2).any(|w| w[0] == "--name" && w[1] == "Downloader"));
        assert_eq!(
            cleanup_paths(&build, Utf8Path::new("/p"))[1],
            Utf8PathBuf::from("/p/Downloader.spec")
        );
    }

    #[test]
    fn present_binary_never_triggers_fetch() {
        let root = project("build-present", true);
        let build = BuildConfig::default();
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let runner = packager_runner(&root);
        let fetches = Cell::new(0);
        let fetch = || -> Result<()> {
            fetches.set(fetches.get() + 1);
            Ok(())
        };

        let report = execute(&plan, &runner, &fetch).unwrap();
        assert!(!report.fetched);
        assert_eq!(fetches.get(), 0);
        assert_eq!(runner.calls().len(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_binary_fetches_once_before_packaging() {
        let root = project("build-builtin-fetch", false);
        let build = BuildConfig::default();
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let runner = packager_runner(&root);
        let fetches = Cell::new(0);
        let vendored = plan.vendored.clone();
        let calls_at_fetch = Cell::new(usize::MAX);
        let fetch = || -> Result<()> {
            fetches.set(fetches.get() + 1);
            calls_at_fetch.set(runner.calls().len());
            fs::write(&vendored, b"bin")?;
            Ok(())
        };

        let report = execute(&plan, &runner, &fetch).unwrap();
        assert!(report.fetched);
        assert_eq!(fetches.get(), 1);
        assert_eq!(calls_at_fetch.get(), 0);
        assert_eq!(runner.calls_to("pyinstaller").len(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn directory_in_place_of_binary_still_fetches() {
        let root = project("build-dir-not-binary", false);
        let plan = BuildPlan::new(&BuildConfig::default(), &FfmpegConfig::default(), &root);
        fs::create_dir_all(&plan.vendored).unwrap();
        assert!(plan.describe()[0].starts_with("fetch "));

        let runner = packager_runner(&root);
        let vendored = plan.vendored.clone();
        let fetches = Cell::new(0);
        let fetch = || -> Result<()> {
            fetches.set(fetches.get() + 1);
            fs::remove_dir_all(&vendored)?;
            fs::write(&vendored, b"bin")?;
            Ok(())
        };

        let report = execute(&plan, &runner, &fetch).unwrap();
        assert!(report.fetched);
        assert_eq!(fetches.get(), 1);
        assert!(plan.vendored.is_file());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn external_fetch_helper_gets_force_flag() {
        let root = project("build-external-fetch", false);
        let build = BuildConfig {
            fetch_command: Some(vec![
                "python".to_owned(),
                "ffmpeg_manager.py".to_owned(),
                "--force-download".to_owned(),
            ]),
            ..BuildConfig::default()
        };
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let vendored = plan.vendored.clone();
        let packager_root = root.clone();
        let runner = FakeRunner::new()
            .effect(
                |argv| argv[0] == "python",
                move |_| fs::write(&vendored, b"bin").unwrap(),
            )
            .effect(
                |argv| argv[0] == "pyinstaller",
                move |_| fs::write(packager_root.join("yt_downloader.spec"), "").unwrap(),
            );
        let fetch = || -> Result<()> { panic!("built-in fetch must not run") };

        execute(&plan, &runner, &fetch).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["python", "ffmpeg_manager.py", "--force-download"]);
        assert_eq!(calls[1][0], "pyinstaller");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn failed_fetch_stops_before_packaging() {
        let root = project("build-fetch-fails", false);
        let build = BuildConfig {
            fetch_command: Some(vec!["helper".to_owned(), "--force-download".to_owned()]),
            ..BuildConfig::default()
        };
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let fetch = no_fetch;

        let failing = FakeRunner::new().on(|argv| argv[0] == "helper", 3, "");
        let err = execute(&plan, &failing, &fetch).unwrap_err();
        assert!(err.to_string().contains("exit code Some(3)"));
        assert!(failing.calls_to("pyinstaller").is_empty());

        let silent = FakeRunner::new().on(|argv| argv[0] == "helper", 0, "");
        let err = execute(&plan, &silent, &fetch).unwrap_err();
        assert!(err.to_string().contains("still missing"));
        assert!(silent.calls_to("pyinstaller").is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn cleanup_removes_generated_paths_and_is_idempotent() {
        let root = project("build-cleanup", true);
        let build = BuildConfig::default();
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let runner = packager_runner(&root);
        let fetch = no_fetch;

        let first = execute(&plan, &runner, &fetch).unwrap();
        assert_eq!(first.cleaned.len(), 2);
        assert!(!root.join("build").exists());
        assert!(!root.join("yt_downloader.spec").exists());
        assert!(root.join("dist").join("yt_downloader.exe").exists());

        let second = execute(&plan, &runner, &fetch).unwrap();
        assert_eq!(first, second);
        assert!(!root.join("build").exists());
        assert!(!root.join("yt_downloader.spec").exists());

        assert!(clean(&plan.cleanup).unwrap().is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn no_clean_keeps_intermediate_outputs() {
        let root = project("build-no-clean", true);
        let build = BuildConfig {
            clean: false,
            ..BuildConfig::default()
        };
        let plan = BuildPlan::new(&build, &FfmpegConfig::default(), &root);
        let runner = packager_runner(&root);

        let report = execute(&plan, &runner, &no_fetch).unwrap();
        assert!(report.cleaned.is_empty());
        assert!(root.join("build").exists());
        assert!(root.join("yt_downloader.spec").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn packager_failure_is_an_error_and_skips_cleanup() {
        let root = project("build-packager-fails", true);
        fs::create_dir_all(root.join("build")).unwrap();
        let plan = BuildPlan::new(&BuildConfig::default(), &FfmpegConfig::default(), &root);
        let runner = FakeRunner::new().on(|argv| argv[0] == "pyinstaller", 1, "");

        let err = execute(&plan, &runner, &no_fetch).unwrap_err();
        assert!(err.to_string().contains("failed with exit code Some(1)"));
        assert!(root.join("build").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn preflight_reports_every_missing_input() {
        let root = unique_temp_dir("build-preflight");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("ffmpeg_manager.py"), "").unwrap();
        let plan = BuildPlan::new(&BuildConfig::default(), &FfmpegConfig::default(), &root);
        let runner = FakeRunner::new();

        let err = execute(&plan, &runner, &no_fetch).unwrap_err().to_string();
        assert!(err.contains("yt_downloader.py"));
        assert!(err.contains("icon.png"));
        assert!(!err.contains("ffmpeg_manager.py"));
        assert!(runner.calls().is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn describe_lists_fetch_only_when_missing() {
        let root = project("build-describe", false);
        let plan = BuildPlan::new(&BuildConfig::default(), &FfmpegConfig::default(), &root);
        let steps = plan.describe();
        assert_eq!(steps.len(), 4);
        assert!(steps[0].starts_with("fetch "));
        assert!(steps[1].starts_with("run pyinstaller --onefile --windowed"));

        fs::write(&plan.vendored, b"bin").unwrap();
        assert!(plan.describe()[0].starts_with("use vendored"));

        let _ = fs::remove_dir_all(&root);
    }
}
