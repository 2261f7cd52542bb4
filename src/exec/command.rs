/// External command execution
/// Every tool invocation (quota, chcon, useradd, tc, addon actions) goes through `Exec`
/// so that identity switching can rewrite the command line before it runs.
use crate::config::types::{GearError, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Builder for a synchronous external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    argv: Vec<String>,
    dir: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    silent: bool,
}

impl Exec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            argv: vec![program.into()],
            dir: None,
            env: None,
            silent: false,
        }
    }

    /// Start a command whose program is a filesystem path
    pub fn program_path(program: &Path) -> Self {
        Self::new(program.to_string_lossy().into_owned())
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory of the child
    pub fn directory(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Replace the child environment entirely
    pub fn environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Capture stdout/stderr instead of inheriting them
    pub fn silent_io(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Full argument vector, program first
    pub fn command(&self) -> &[String] {
        &self.argv
    }

    /// Replace the argument vector, keeping directory and environment
    pub fn set_command(mut self, argv: Vec<String>) -> Self {
        if !argv.is_empty() {
            self.argv = argv;
        }
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn env(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }

    /// Human-readable command line for logs and errors
    pub fn display(&self) -> String {
        shell_join(&self.argv)
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run to completion, failing on a non-zero exit status
    pub fn run(&self) -> Result<()> {
        log::debug!("exec: {}", self.display());

        if !self.silent {
            let status = self.build().status().map_err(|e| self.spawn_error(e))?;
            if !status.success() {
                return Err(GearError::ExternalTool {
                    command: self.display(),
                    status: status.code(),
                    stderr: String::new(),
                });
            }
            return Ok(());
        }

        self.checked_output().map(|_| ())
    }

    /// Run to completion and return stdout, failing on a non-zero exit status
    pub fn checked_output(&self) -> Result<String> {
        let output = self
            .build()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(GearError::ExternalTool {
                command: self.display(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run to completion and return stdout regardless of exit status
    pub fn output_string(&self) -> Result<String> {
        let output = self
            .build()
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn_error(&self, err: std::io::Error) -> GearError {
        GearError::ExternalTool {
            command: self.display(),
            status: None,
            stderr: err.to_string(),
        }
    }
}

/// Join arguments into one shell command line.
///
/// Arguments containing whitespace or shell metacharacters are quoted and
/// empty arguments become `''`, so the shell sees exactly the original argv.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::escape(Cow::Borrowed(arg.as_str())))
        .collect::<Vec<_>>()
        .join(" ")
}
