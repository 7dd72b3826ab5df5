use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;

/// Exit state of a finished child process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub code: Option<i32>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for Outcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Captured output of a child process.
#[derive(Clone, Debug)]
pub struct Captured {
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for every external program the CLI runs (packager, fetch helper, ffmpeg, yt-dlp).
pub trait CommandRunner: Sync {
    /// Run with inherited stdio and wait.
    fn status(&self, argv: &[String]) -> Result<Outcome>;
    /// Run with stdout and stderr captured.
    fn output(&self, argv: &[String]) -> Result<Captured>;
    /// Run with stdout and stderr merged line by line into `on_line`.
    fn stream(&self, argv: &[String], on_line: &(dyn Fn(&str) + Sync)) -> Result<Outcome>;
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct SystemRunner {
    log: Option<CommandLog>,
}

impl SystemRunner {
    pub fn new(log: Option<CommandLog>) -> Self {
        Self { log }
    }

    fn record(&self, argv: &[String], outcome: Outcome, stdout: Option<&str>, stderr: Option<&str>) {
        if let Some(log) = &self.log {
            log.record(argv, outcome, stdout, stderr);
        }
    }
}

impl CommandRunner for SystemRunner {
    fn status(&self, argv: &[String]) -> Result<Outcome> {
        let mut command = build_command(argv)?;
        tracing::debug!(command = %format_command(argv), "spawning");
        let outcome: Outcome = command
            .status()
            .with_context(|| format!("executing `{}`", format_command(argv)))?
            .into();
        self.record(argv, outcome, None, None);
        Ok(outcome)
    }

    fn output(&self, argv: &[String]) -> Result<Captured> {
        let mut command = build_command(argv)?;
        tracing::debug!(command = %format_command(argv), "spawning (captured)");
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("executing `{}`", format_command(argv)))?;
        let captured = Captured {
            outcome: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.record(
            argv,
            captured.outcome,
            Some(&captured.stdout),
            Some(&captured.stderr),
        );
        Ok(captured)
    }

    fn stream(&self, argv: &[String], on_line: &(dyn Fn(&str) + Sync)) -> Result<Outcome> {
        let mut command = build_command(argv)?;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        tracing::debug!(command = %format_command(argv), "spawning (streamed)");

        let mut child = command
            .spawn()
            .with_context(|| format!("executing `{}`", format_command(argv)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        thread::scope(|scope| {
            if let Some(pipe) = stderr {
                scope.spawn(move || forward_lines(pipe, on_line));
            }
            if let Some(pipe) = stdout {
                forward_lines(pipe, on_line);
            }
        });

        let outcome: Outcome = child
            .wait()
            .with_context(|| format!("waiting on `{}`", format_command(argv)))?
            .into();
        self.record(argv, outcome, None, None);
        Ok(outcome)
    }
}

/// Drain `pipe` to EOF, handing each line to `on_line`. Bytes that are not
/// UTF-8 (locale code pages on Windows) are replaced, never fatal.
fn forward_lines(pipe: impl Read, on_line: &(dyn Fn(&str) + Sync)) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(err) => {
                tracing::debug!(error = %err, "stopped reading child output");
                break;
            }
        }
    }
}

fn build_command(argv: &[String]) -> Result<ProcessCommand> {
    let Some((program, args)) = argv.split_first() else {
        bail!("invalid command: empty argv");
    };
    let mut command = ProcessCommand::new(program);
    command.args(args);
    hide_console(&mut command);
    Ok(command)
}

#[cfg(windows)]
fn hide_console(command: &mut ProcessCommand) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut ProcessCommand) {}

/// Render an argv the way a user would type it.
pub fn format_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace()) {
                let escaped = arg.replace('"', "\\\"");
                format!("\"{}\"", escaped)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Append-only record of executed commands, enabled with `--log-file`.
#[derive(Debug)]
pub struct CommandLog {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl CommandLog {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn record(
        &self,
        argv: &[String],
        outcome: Outcome,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let status = if outcome.success() { "ok" } else { "error" };
        let mut content = format!(
            "\n== command: {} ==\ntime: {}\nstatus: {} (exit {:?})\n",
            format_command(argv),
            timestamp,
            status,
            outcome.code
        );
        if let Some(out) = stdout.filter(|s| !s.is_empty()) {
            content.push_str(&format!("stdout:\n{}\n", out));
        }
        if let Some(err) = stderr.filter(|s| !s.is_empty()) {
            content.push_str(&format!("stderr:\n{}\n", err));
        }

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(err) = file.write_all(content.as_bytes()) {
                    tracing::warn!(path = %self.path, error = %err, "failed to write command log");
                }
            }
            Err(err) => {
                tracing::warn!(path = %self.path, error = %err, "failed to open command log");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_quotes_whitespace_and_empty_args() {
        let argv = vec![
            "pyinstaller".to_owned(),
            "--add-data".to_owned(),
            "my file.py:.".to_owned(),
            String::new(),
        ];
        assert_eq!(
            format_command(&argv),
            "pyinstaller --add-data \"my file.py:.\" \"\""
        );
    }

    #[test]
    fn empty_argv_is_rejected() {
        let runner = SystemRunner::default();
        let err = runner.status(&[]).unwrap_err();
        assert!(err.to_string().contains("empty argv"));
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[cfg(unix)]
    #[test]
    fn stream_delivers_stdout_and_stderr() {
        let runner = SystemRunner::default();
        let lines = Mutex::new(Vec::<String>::new());
        let on_line = |line: &str| lines.lock().unwrap().push(line.to_owned());

        let outcome = runner.stream(&sh("echo a; echo b >&2"), &on_line).unwrap();
        assert!(outcome.success());
        let mut lines = lines.into_inner().unwrap();
        lines.sort();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[test]
    fn stream_survives_non_utf8_output() {
        let runner = SystemRunner::default();
        let lines = Mutex::new(Vec::<String>::new());
        let on_line = |line: &str| lines.lock().unwrap().push(line.to_owned());
        let script = "printf 'caf\\351\\n'; i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done; exit 0";

        let outcome = runner.stream(&sh(script), &on_line).unwrap();
        assert_eq!(outcome, Outcome { code: Some(0) });
        let lines = lines.into_inner().unwrap();
        assert_eq!(lines.len(), 20001);
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(lines[20000], "line19999");
    }

    #[cfg(unix)]
    #[test]
    fn command_log_appends_one_record_per_command() {
        let root = crate::util::testing::unique_temp_dir("command-log");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("commands.log");
        let runner = SystemRunner::new(Some(CommandLog::new(path.clone())));

        let captured = runner.output(&sh("echo hello")).unwrap();
        assert_eq!(captured.stdout, "hello\n");
        let outcome = runner.status(&sh("exit 3")).unwrap();
        assert_eq!(outcome.code, Some(3));

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.matches("== command:").count(), 2);
        assert!(log.contains("== command: sh -c \"echo hello\" =="));
        assert!(log.contains("status: ok (exit Some(0))"));
        assert!(log.contains("stdout:\nhello\n"));
        assert!(log.contains("status: error (exit Some(3))"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn outcome_success_requires_zero_exit() {
        assert!(Outcome { code: Some(0) }.success());
        assert!(!Outcome { code: Some(2) }.success());
        assert!(!Outcome { code: None }.success());
    }
}
