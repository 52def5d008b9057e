use std::fmt;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub status: i32,
}

#[derive(Debug, Error)]
pub enum ShellFailure {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {}", summarize(stdout, stderr))]
    NonZero {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("'{command}' did not finish within {}s and was killed", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

fn summarize(stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return format!("stderr='{stderr}'");
    }
    format!("stdout='{}'", stdout.trim())
}

/// Executes one command line. Any non-zero exit is a failure; callers never
/// look at command-specific exit codes.
pub trait ShellRunner {
    fn run(&self, command: &CommandLine) -> Result<ShellOutput, ShellFailure>;
}

/// Runs commands on the host, killing any that outlive `timeout`.
#[derive(Debug, Clone, Default)]
pub struct SystemShellRunner {
    timeout: Option<Duration>,
}

impl SystemShellRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl ShellRunner for SystemShellRunner {
    fn run(&self, command: &CommandLine) -> Result<ShellOutput, ShellFailure> {
        let rendered = command.to_string();
        debug!(command = %rendered, "running command");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ShellFailure::Spawn {
                command: rendered.clone(),
                source,
            })?;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let status = match wait_with_deadline(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let timeout = self.timeout.unwrap_or_default();
                warn!(command = %rendered, timeout_secs = timeout.as_secs(), "command timed out");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ShellFailure::TimedOut {
                    command: rendered,
                    timeout,
                });
            }
            Err(source) => {
                let _ = child.kill();
                return Err(ShellFailure::Spawn {
                    command: rendered,
                    source,
                });
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        trace!(command = %rendered, status = %status, "command finished");

        if !status.success() {
            return Err(ShellFailure::NonZero {
                command: rendered,
                status: status.to_string(),
                stdout,
                stderr,
            });
        }

        Ok(ShellOutput {
            stdout,
            status: status.code().unwrap_or_default(),
        })
    }
}

/// `Ok(None)` means the deadline passed with the child still running.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R>(stream: Option<R>) -> Option<JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
