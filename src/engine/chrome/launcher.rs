use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::process::ChromeProcess;
use crate::engine::{EngineError, EngineLauncher, EngineProcess, LaunchProfile};

pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const ENDPOINT_BANNER: &str = "DevTools listening on ";

/// Launches Chrome or Chromium with remote debugging enabled.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    executable: PathBuf,
    launch_timeout: Duration,
    command_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn command(&self, profile: &LaunchProfile, user_data_dir: &std::path::Path) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(profile.args())
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", user_data_dir.display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(timezone) = &profile.timezone {
            command.env("TZ", timezone);
        }
        command
    }
}

#[async_trait]
impl EngineLauncher for ChromeLauncher {
    async fn launch(&self, profile: &LaunchProfile) -> Result<Arc<dyn EngineProcess>, EngineError> {
        let started_at = Instant::now();
        let profile_dir = tempfile::Builder::new()
            .prefix("renderpool-profile-")
            .tempdir()
            .map_err(|err| EngineError::launch(format!("cannot create profile directory: {err}")))?;

        let mut child = self
            .command(profile, profile_dir.path())
            .spawn()
            .map_err(|err| {
                EngineError::launch(format!(
                    "cannot spawn `{}`: {err}",
                    self.executable.display()
                ))
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::launch("browser stderr is not captured"))?;
        let mut lines = BufReader::new(stderr).lines();

        let endpoint = tokio::time::timeout(self.launch_timeout, async {
            while let Some(line) = lines.next_line().await.map_err(|err| {
                EngineError::launch(format!("cannot read browser output: {err}"))
            })? {
                if let Some(endpoint) = devtools_endpoint(&line) {
                    return Ok(endpoint.to_string());
                }
                debug!(target = "engine::chrome", line = %line, "Browser output");
            }
            Err(EngineError::launch(
                "browser exited before announcing its DevTools endpoint",
            ))
        })
        .await
        .map_err(|_| {
            EngineError::launch(format!(
                "browser did not announce its DevTools endpoint within {}s",
                self.launch_timeout.as_secs()
            ))
        })??;

        let pid = child.id();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target = "engine::chrome", pid = ?pid, line = %line, "Browser output");
            }
        });

        let process =
            ChromeProcess::start(child, profile_dir, &endpoint, self.command_timeout).await?;
        info!(
            target = "engine::chrome",
            op = "launch",
            pid = ?pid,
            endpoint = %endpoint,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Browser started"
        );
        Ok(process as Arc<dyn EngineProcess>)
    }
}

/// Extract the websocket URL from the browser's startup banner.
fn devtools_endpoint(line: &str) -> Option<&str> {
    let rest = line.split_once(ENDPOINT_BANNER)?.1.trim();
    rest.starts_with("ws://").then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_read_from_banner() {
        assert_eq!(
            devtools_endpoint(
                "DevTools listening on ws://127.0.0.1:39117/devtools/browser/6f0c9d2e-1a7b\n"
            ),
            Some("ws://127.0.0.1:39117/devtools/browser/6f0c9d2e-1a7b")
        );
        assert_eq!(
            devtools_endpoint("[0101/000000.000:ERROR:gpu_init.cc(523)] Passthrough is not supported"),
            None
        );
        assert_eq!(devtools_endpoint("DevTools listening on http://x"), None);
    }

    #[test]
    fn command_carries_profile_and_debugging_flags() {
        let launcher = ChromeLauncher::new("/usr/bin/chromium");
        let command = launcher.command(&LaunchProfile::default(), std::path::Path::new("/tmp/p"));
        let std_command = command.as_std();
        let args: Vec<String> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert_eq!(std_command.get_program(), "/usr/bin/chromium");
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/p".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
        assert!(
            std_command
                .get_envs()
                .any(|(key, value)| key == "TZ" && value.is_some_and(|v| v == "Europe/Amsterdam"))
        );
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let launcher = ChromeLauncher::new("/nonexistent/renderpool-test-browser");
        let err = launcher
            .launch(&LaunchProfile::default())
            .await
            .err()
            .expect("launch should fail");
        assert!(matches!(err, EngineError::Launch(_)));
        assert!(err.to_string().contains("cannot spawn"));
    }
}
