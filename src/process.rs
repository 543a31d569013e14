//! External command execution.
//!
//! Every tool the pipeline shells out to (package manager, `make`, `openssl`,
//! `sign-file`, `depmod`, `mokutil`, `modprobe`) is described by a [`Cmd`] and
//! executed by a [`CommandRunner`]. Production code uses [`HostRunner`]; tests
//! substitute a scripted runner so the sequencing logic runs without a real
//! kernel tree or firmware.
//!
//! ```rust,ignore
//! use kmod_provision::process::{Cmd, HostRunner};
//!
//! let runner = HostRunner;
//! Cmd::new("depmod")
//!     .args(["-a", "6.11.5-300.fc41.x86_64"])
//!     .error_msg("depmod failed. Install: sudo dnf install kmod")
//!     .run(&runner)?;
//! ```

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    interactive: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            error_msg: None,
            allow_fail: false,
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Message used as the headline of the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Inherit the terminal so the user sees progress and can answer prompts
    /// (`mokutil --import` asks for a password). Output is not captured.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Value following `flag` in the argument list, e.g. `-out <path>`.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Execute through `runner`, failing on non-zero exit unless
    /// [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CommandResult> {
        let result = runner
            .execute(self)
            .with_context(|| format!("executing '{}'", self))?;

        if !result.success() && !self.allow_fail {
            let headline = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            let output = result.combined_output();
            if output.is_empty() {
                bail!("{}\n  command: {}\n  status: {}", headline, self, result.status_text());
            }
            bail!(
                "{}\n  command: {}\n  status: {}\n{}",
                headline,
                self,
                result.status_text(),
                output
            );
        }

        Ok(result)
    }

    /// Shorthand for `.interactive().run(runner)`.
    pub fn run_interactive(self, runner: &dyn CommandRunner) -> Result<CommandResult> {
        self.interactive().run(runner)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }

    fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Executes commands and resolves programs on `PATH`.
pub trait CommandRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;

    /// Resolve `program` the way the shell would.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs commands on the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        if cmd.interactive {
            let status = command
                .status()
                .with_context(|| format!("spawning '{}'", cmd.program))?;
            return Ok(CommandResult {
                code: status.code(),
                ..CommandResult::default()
            });
        }

        let output = command
            .output()
            .with_context(|| format!("spawning '{}'", cmd.program))?;
        Ok(CommandResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Fail with a readable message when a required input is missing.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", what, path.display());
    }
    Ok(())
}

/// Whether `path` is a regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                return false;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o111 == 0 {
                    return false;
                }
            }
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace_args() {
        let cmd = Cmd::new("openssl").args(["req", "-subj", "/CN=hp-wmi signing key"]);
        assert_eq!(cmd.to_string(), "openssl req -subj '/CN=hp-wmi signing key'");
    }

    #[test]
    fn test_arg_after() {
        let cmd = Cmd::new("openssl").args(["genpkey", "-out", "/tmp/key"]);
        assert_eq!(cmd.arg_after("-out"), Some("/tmp/key"));
        assert_eq!(cmd.arg_after("-in"), None);
    }

    #[test]
    fn test_host_runner_captures_stdout() {
        let result = Cmd::new("sh")
            .args(["-c", "echo provisioned"])
            .run(&HostRunner)
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "provisioned");
    }

    #[test]
    fn test_failure_uses_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .error_msg("depmod failed")
            .run(&HostRunner)
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("depmod failed"));
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("broken"));
    }

    #[test]
    fn test_allow_fail_returns_result() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run(&HostRunner)
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.code, Some(1));
    }

    #[test]
    fn test_locate_finds_shell() {
        assert!(HostRunner.locate("sh").is_some());
        assert!(HostRunner.locate("definitely_not_a_real_command_12345").is_none());
    }

    #[test]
    fn test_ensure_exists() {
        let temp = tempfile::tempdir().unwrap();
        assert!(ensure_exists(temp.path(), "work dir").is_ok());
        let err = ensure_exists(&temp.path().join("missing.c"), "module source").unwrap_err();
        assert!(err.to_string().contains("module source not found"));
    }
}
