//! Device transport abstraction.
//!
//! SSH handshake and prompt-state mechanics are out of scope per §1; this
//! module models only the seam the broker needs: something that can run a
//! command against a device and report whether it is still usable.
//! Grounded in the teacher's `provider::Sandbox` trait (an async
//! capability object behind a provider, with `exec`/`status`/`terminate`)
//! applied here to one device connection instead of one sandbox.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::error::{BrokerErrorKind, CoreError};

/// A live session against one device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Runs `command` against the device and returns its captured output.
    async fn execute(&mut self, command: &str) -> Result<String, (BrokerErrorKind, String)>;

    /// Cheap liveness probe used before reuse.
    async fn is_connected(&mut self) -> bool;

    async fn close(&mut self);
}

/// Opens a transport for a device given the connection descriptor the
/// testbed produced. `command`-backed devices spawn a subprocess per
/// command (each invocation is independent, matching the spec's "names a
/// subprocess to launch as the session" contract); a real SSH transport is
/// a declared non-goal.
pub struct CommandTransport {
    command: String,
    timeout: Duration,
}

impl CommandTransport {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceTransport for CommandTransport {
    async fn execute(&mut self, command: &str) -> Result<String, (BrokerErrorKind, String)> {
        let args = shell_words::split(&self.command)
            .map_err(|e| (BrokerErrorKind::Other, format!("invalid command template: {e}")))?;
        let Some((program, rest)) = args.split_first() else {
            return Err((BrokerErrorKind::Other, "empty command template".to_string()));
        };

        let mut proc = tokio::process::Command::new(program);
        proc.args(rest);
        proc.stdin(Stdio::piped());
        proc.stdout(Stdio::piped());
        proc.stderr(Stdio::piped());

        let mut child = proc
            .spawn()
            .map_err(|e| (BrokerErrorKind::Transient, format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(command.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| (BrokerErrorKind::Timeout, format!("command timed out: {command}")))?
            .map_err(|e| (BrokerErrorKind::Transient, e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err((
                BrokerErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    async fn is_connected(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// A transport that never actually connects -- used in broker tests so the
/// caching/locking/statistics behavior can be exercised without a real
/// device or subprocess.
pub struct NullTransport {
    pub healthy: bool,
    pub responses: std::collections::HashMap<String, String>,
    pub exec_count: usize,
}

impl NullTransport {
    pub fn new() -> Self {
        Self {
            healthy: true,
            responses: std::collections::HashMap::new(),
            exec_count: 0,
        }
    }

    pub fn with_response(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.responses.insert(command.into(), output.into());
        self
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for NullTransport {
    async fn execute(&mut self, command: &str) -> Result<String, (BrokerErrorKind, String)> {
        self.exec_count += 1;
        Ok(self
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| format!("output for {command}")))
    }

    async fn is_connected(&mut self) -> bool {
        self.healthy
    }

    async fn close(&mut self) {}
}

pub fn core_error_from_broker(device_id: &str, kind: BrokerErrorKind, message: String) -> CoreError {
    match kind {
        BrokerErrorKind::Auth => CoreError::BrokerAuth {
            device_id: device_id.to_string(),
            message,
        },
        BrokerErrorKind::Timeout => CoreError::BrokerTimeout {
            device_id: device_id.to_string(),
            command: message,
        },
        BrokerErrorKind::Transient | BrokerErrorKind::Other => CoreError::BrokerTransport {
            device_id: device_id.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_transport_serves_configured_response() {
        let mut transport = NullTransport::new().with_response("show version", "IOS XE 17.9");
        let output = transport.execute("show version").await.unwrap();
        assert_eq!(output, "IOS XE 17.9");
        assert_eq!(transport.exec_count, 1);
    }

    #[tokio::test]
    async fn unhealthy_transport_reports_not_connected() {
        let mut transport = NullTransport {
            healthy: false,
            ..NullTransport::new()
        };
        assert!(!transport.is_connected().await);
    }
}
