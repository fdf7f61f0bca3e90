//! Thin client for talking to a running [`crate::broker::ConnectionBroker`]
//! over its Unix-domain socket.
//!
//! Grounded in the teacher's `connector` module (a small client wrapping one
//! transport with request/response framing) applied here to the broker's
//! newline-delimited JSON protocol. Each worker process holds exactly one
//! `BrokerClient`; `execute` is the only call device-test bodies make, via
//! a thin Python shim the worker subprocess imports -- out of this crate's
//! scope, but the wire contract below is what that shim speaks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{BrokerErrorKind, CoreError};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientRequest<'a> {
    Exec {
        device_id: &'a str,
        command: &'a str,
        request_id: String,
    },
    Disconnect {
        device_id: &'a str,
        request_id: String,
    },
    Stats {
        request_id: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientResponse {
    Ok {
        #[allow(dead_code)]
        request_id: String,
        ok: bool,
        output: String,
        cached: bool,
        #[allow(dead_code)]
        duration_ms: u64,
    },
    Err {
        #[allow(dead_code)]
        request_id: String,
        ok: bool,
        error_kind: String,
        message: String,
    },
    Stats {
        #[allow(dead_code)]
        request_id: String,
        ok: bool,
        connection_hits: u64,
        connection_misses: u64,
        command_hits: u64,
        command_misses: u64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerStatsSnapshot {
    pub connection_hits: u64,
    pub connection_misses: u64,
    pub command_hits: u64,
    pub command_misses: u64,
}

/// Connects to the broker socket named by `NAC_TEST_BROKER_SOCKET` in the
/// worker's environment (or an explicit path), serializing every call
/// through one connection since the protocol is request/response over a
/// single stream.
pub struct BrokerClient {
    socket_path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
    next_request_id: std::sync::atomic::AtomicU64,
}

impl BrokerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: Mutex::new(None),
            next_request_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Reads the broker socket path from the environment variable the
    /// job generator sets for each worker.
    pub fn from_env() -> Result<Self, CoreError> {
        let path = std::env::var("NAC_TEST_BROKER_SOCKET")
            .map_err(|_| CoreError::Configuration("NAC_TEST_BROKER_SOCKET not set".to_string()))?;
        Ok(Self::new(path))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn next_id(&self) -> String {
        let id = self.next_request_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}-{id}", std::process::id())
    }

    async fn connection(&self) -> std::io::Result<tokio::sync::MutexGuard<'_, Option<UnixStream>>> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(UnixStream::connect(&self.socket_path).await?);
        }
        Ok(guard)
    }

    async fn roundtrip(&self, request: ClientRequest<'_>) -> Result<ClientResponse, CoreError> {
        let mut guard = self.connection().await.map_err(CoreError::Io)?;
        let stream = guard.as_mut().expect("connection just established");

        let mut payload = serde_json::to_string(&request).map_err(|e| CoreError::Other(e.into()))?;
        payload.push('\n');
        stream.write_all(payload.as_bytes()).await.map_err(CoreError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await.map_err(CoreError::Io)?;
        if bytes_read == 0 {
            *guard = None;
            return Err(CoreError::BrokerTransport {
                device_id: "broker".to_string(),
                message: "broker closed the connection".to_string(),
            });
        }

        serde_json::from_str(line.trim()).map_err(|e| CoreError::Other(e.into()))
    }

    /// Runs `command` against `device_id`, returning its output and whether
    /// it was served from the broker's command cache.
    pub async fn execute(&self, device_id: &str, command: &str) -> Result<(String, bool), CoreError> {
        let request = ClientRequest::Exec {
            device_id,
            command,
            request_id: self.next_id(),
        };
        match self.roundtrip(request).await? {
            ClientResponse::Ok { ok: true, output, cached, .. } => Ok((output, cached)),
            ClientResponse::Err { error_kind, message, .. } => Err(broker_error(device_id, &error_kind, message)),
            _ => Err(CoreError::BrokerTransport {
                device_id: device_id.to_string(),
                message: "unexpected broker response".to_string(),
            }),
        }
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<(), CoreError> {
        let request = ClientRequest::Disconnect {
            device_id,
            request_id: self.next_id(),
        };
        match self.roundtrip(request).await? {
            ClientResponse::Ok { ok: true, .. } => Ok(()),
            ClientResponse::Err { message, .. } => Err(CoreError::BrokerTransport {
                device_id: device_id.to_string(),
                message,
            }),
            _ => Ok(()),
        }
    }

    pub async fn stats(&self) -> Result<BrokerStatsSnapshot, CoreError> {
        let request = ClientRequest::Stats {
            request_id: self.next_id(),
        };
        match self.roundtrip(request).await? {
            ClientResponse::Stats {
                ok: true,
                connection_hits,
                connection_misses,
                command_hits,
                command_misses,
                ..
            } => Ok(BrokerStatsSnapshot {
                connection_hits,
                connection_misses,
                command_hits,
                command_misses,
            }),
            _ => Err(CoreError::BrokerTransport {
                device_id: "broker".to_string(),
                message: "stats request failed".to_string(),
            }),
        }
    }
}

fn broker_error(device_id: &str, kind: &str, message: String) -> CoreError {
    let kind = match kind {
        "auth" => BrokerErrorKind::Auth,
        "timeout" => BrokerErrorKind::Timeout,
        "transient" => BrokerErrorKind::Transient,
        _ => BrokerErrorKind::Other,
    };
    crate::transport::core_error_from_broker(device_id, kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{TransportFactory, start_broker};
    use crate::device::DeviceRecord;
    use crate::retry::RetryPolicy;
    use crate::testbed::Testbed;
    use crate::transport::{DeviceTransport, NullTransport};

    struct NullFactory;
    impl TransportFactory for NullFactory {
        fn build(&self, _device: &DeviceRecord) -> Result<Box<dyn DeviceTransport>, String> {
            Ok(Box::new(NullTransport::new().with_response("show version", "ok")))
        }
    }

    fn device(id: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: id.to_string(),
            hostname: id.to_string(),
            host: "10.0.0.1".to_string(),
            os: "iosxe".to_string(),
            platform: None,
            model: None,
            series: None,
            username: "admin".to_string(),
            password: "x".to_string(),
            port: None,
            connection_options: None,
            ssh_options: None,
            command: Some("true".to_string()),
            device_type: None,
        }
    }

    #[tokio::test]
    async fn client_roundtrips_exec_and_stats_through_real_broker() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("broker.sock");
        let handle = start_broker(
            socket_path.clone(),
            vec![device("r1")],
            &Testbed::default(),
            None,
            RetryPolicy::default(),
            Box::new(NullFactory),
        )
        .await
        .unwrap();

        let client = BrokerClient::new(&socket_path);
        let (output, cached) = client.execute("r1", "show version").await.unwrap();
        assert_eq!(output, "ok");
        assert!(!cached);

        let (_, cached_again) = client.execute("r1", "show version").await.unwrap();
        assert!(cached_again);

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.command_hits, 1);
        assert_eq!(stats.command_misses, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_device_surfaces_as_broker_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("broker.sock");
        let handle = start_broker(
            socket_path.clone(),
            vec![],
            &Testbed::default(),
            None,
            RetryPolicy::default(),
            Box::new(NullFactory),
        )
        .await
        .unwrap();

        let client = BrokerClient::new(&socket_path);
        let result = client.execute("ghost", "show version").await;
        assert!(result.is_err());

        handle.shutdown().await;
    }
}
