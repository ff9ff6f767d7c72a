use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CommandRequest;
use super::args;
use super::args::ArgError;
use super::platform::Platform;
use super::whitelist::Whitelist;

/// Bytes of stdout/stderr kept per stream for a waited command
const OUTPUT_LIMIT: u64 = 64 * 1024;

/// Successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Launched without waiting for completion
    Accepted,
    Completed { exit_code: i32, output: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' is not supported on {platform}")]
    PlatformNotSupported { command: String, platform: String },

    #[error("invalid arguments for '{command}': {source}")]
    InvalidArguments {
        command: String,
        #[source]
        source: ArgError,
    },

    #[error("command '{command}' timed out after {}s", .timeout.as_secs())]
    ExecutionTimeout { command: String, timeout: Duration },

    #[error("command '{command}' failed: {reason}")]
    ExecutionFailure { command: String, reason: String },
}

/// Resolved program and arguments for one launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Starts host processes
///
/// This trait allows for counting or faking launches in tests.
pub trait Launcher: Send + Sync {
    /// Spawn `invocation`. With `capture` stdout and stderr are piped, otherwise discarded.
    fn spawn(&self, invocation: &Invocation, capture: bool) -> std::io::Result<Child>;
}

/// Launches processes directly, never through a shell
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn spawn(&self, invocation: &Invocation, capture: bool) -> std::io::Result<Child> {
        let output = || {
            if capture {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(false)
            .spawn()
    }
}

/// Validates requests against the whitelist and runs them.
pub struct CommandDispatcher {
    whitelist: Whitelist,
    platform: Option<Platform>,
    launcher: Arc<dyn Launcher>,
    default_timeout: Duration,
    cancel: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(whitelist: Whitelist, default_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            whitelist,
            platform: Platform::current(),
            launcher: Arc::new(SystemLauncher),
            default_timeout,
            cancel,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Override the host platform used for platform checks.
    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Names of the commands this host can run.
    pub fn available_commands(&self) -> Vec<String> {
        self.whitelist.names_for(self.platform)
    }

    /// Validate and run one request.
    ///
    /// Rejected requests never reach the launcher. Accepted requests spawn exactly one
    /// process.
    pub async fn dispatch(&self, request: &CommandRequest) -> Result<Outcome, DispatchError> {
        let name = request.command.as_str();
        let definition = self
            .whitelist
            .get(name)
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))?;

        if !definition.supports(self.platform) {
            return Err(DispatchError::PlatformNotSupported {
                command: name.to_string(),
                platform: self
                    .platform
                    .map_or_else(|| std::env::consts::OS.to_string(), |p| p.to_string()),
            });
        }

        let rendered = args::validate(definition.schema.as_ref(), &request.args).map_err(
            |source| DispatchError::InvalidArguments {
                command: name.to_string(),
                source,
            },
        )?;

        let invocation = Invocation {
            program: definition.program.clone(),
            args: definition.argv(&rendered),
        };
        info!(
            "Running command '{}' ({:?}) for {}",
            name, invocation.program, request.origin
        );

        let failure = |reason: String| DispatchError::ExecutionFailure {
            command: name.to_string(),
            reason,
        };

        let mut child = self
            .launcher
            .spawn(&invocation, definition.wait)
            .map_err(|e| failure(format!("failed to start: {}", e)))?;

        if !definition.wait {
            let command = name.to_string();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!("Command '{}' exited with {}", command, status),
                    Err(e) => warn!("Failed to reap command '{}': {}", command, e),
                }
            });
            return Ok(Outcome::Accepted);
        }

        let timeout = definition.timeout.unwrap_or(self.default_timeout);
        let stdout = child.stdout.take().map(|s| tokio::spawn(collect(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(collect(s)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| failure(e.to_string()))?,
            _ = tokio::time::sleep(timeout) => {
                warn!("Command '{}' timed out after {:?}, detaching", name, timeout);
                return Err(DispatchError::ExecutionTimeout {
                    command: name.to_string(),
                    timeout,
                });
            }
            _ = self.cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill command '{}': {}", name, e);
                }
                let _ = child.wait().await;
                return Err(failure("cancelled by shutdown".to_string()));
            }
        };

        let stdout = joined(stdout).await;
        let stderr = joined(stderr).await;
        completion(status, stdout, stderr).map_err(failure)
    }
}

fn completion(status: ExitStatus, stdout: String, stderr: String) -> Result<Outcome, String> {
    match status.code() {
        Some(0) => Ok(Outcome::Completed {
            exit_code: 0,
            output: stdout,
        }),
        Some(code) => {
            let detail = if stderr.is_empty() { stdout } else { stderr };
            if detail.is_empty() {
                Err(format!("exited with status {}", code))
            } else {
                Err(format!("exited with status {}: {}", code, detail))
            }
        }
        None => Err(format!("terminated by signal ({})", status)),
    }
}

async fn joined(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Read up to [`OUTPUT_LIMIT`] bytes, then drain the rest so the child never blocks on a
/// full pipe.
async fn collect(mut stream: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = (&mut stream).take(OUTPUT_LIMIT).read_to_end(&mut buf).await {
        debug!("Error reading command output: {}", e);
        return buf;
    }
    let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
    buf
}
