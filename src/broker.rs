//! The connection broker.
//!
//! A long-lived local service that multiplexes device sessions and caches
//! command outputs across every device-test worker subprocess in one D2D
//! run, so N device tests against M devices execute M sessions and M
//! command evaluations rather than N×M. Grounded in
//! `original_source/nac_test/pyats_core/broker/connection_broker.py` for the
//! wire shapes and caching/health policy, and in the teacher's
//! `provider::local::LocalSandbox`/`cache::ImageCache` pair for the
//! "process-local service with a persistent, lock-guarded cache" shape this
//! crate realizes over a Unix-domain socket instead of in-process calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::device::DeviceRecord;
use crate::error::BrokerErrorKind;
use crate::retry::RetryPolicy;
use crate::testbed::Testbed;
use crate::transport::{CommandTransport, DeviceTransport, core_error_from_broker};

/// One cached command result, keyed by its exact normalized text.
#[derive(Debug, Clone)]
pub struct CachedCommandResult {
    pub command_text: String,
    pub output: String,
    pub captured_at: Instant,
    pub size_bytes: usize,
}

struct BrokerConnection {
    device_id: String,
    transport: Box<dyn DeviceTransport>,
    last_used: Instant,
    cache: HashMap<String, CachedCommandResult>,
}

/// Connection/command hit-miss counters, reported at shutdown.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub connection_hits: AtomicU64,
    pub connection_misses: AtomicU64,
    pub command_hits: AtomicU64,
    pub command_misses: AtomicU64,
}

impl BrokerStats {
    fn snapshot_line(&self) -> String {
        format!(
            "BROKER_STATISTICS: connection_hits={}, connection_misses={}, command_hits={}, command_misses={}",
            self.connection_hits.load(Ordering::Relaxed),
            self.connection_misses.load(Ordering::Relaxed),
            self.command_hits.load(Ordering::Relaxed),
            self.command_misses.load(Ordering::Relaxed),
        )
    }
}

/// Builds a transport for a device. The default factory honors `command`
/// devices via `CommandTransport`; real SSH transport construction is a
/// declared non-goal (§1), so a device with no `command` field produces a
/// `BrokerTransportError` naming the gap rather than silently no-op'ing.
pub trait TransportFactory: Send + Sync {
    fn build(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceTransport>, String>;
}

pub struct DefaultTransportFactory {
    pub command_timeout: std::time::Duration,
}

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceTransport>, String> {
        match &device.command {
            Some(command) => Ok(Box::new(CommandTransport::new(command.clone(), self.command_timeout))),
            None => Err(format!(
                "no transport available for device {} (SSH transport mechanics are out of scope; supply a `command` field)",
                device.hostname
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum BrokerRequest {
    Exec {
        device_id: String,
        command: String,
        request_id: String,
    },
    Disconnect {
        device_id: String,
        request_id: String,
    },
    Stats {
        request_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BrokerResponse {
    Ok {
        request_id: String,
        ok: bool,
        output: String,
        cached: bool,
        duration_ms: u64,
    },
    Err {
        request_id: String,
        ok: bool,
        error_kind: String,
        message: String,
    },
    StatsOk {
        request_id: String,
        ok: bool,
        connection_hits: u64,
        connection_misses: u64,
        command_hits: u64,
        command_misses: u64,
    },
}

/// The broker's shared state, cloneable across the socket-accept loop's
/// per-connection tasks.
struct BrokerCore {
    devices: Mutex<HashMap<String, Arc<Mutex<BrokerConnection>>>>,
    all_devices: HashMap<String, DeviceRecord>,
    transport_semaphore: Arc<Semaphore>,
    transport_factory: Box<dyn TransportFactory>,
    retry_policy: RetryPolicy,
    stats: BrokerStats,
}

impl BrokerCore {
    async fn exec(&self, device_id: &str, command: &str) -> Result<(String, bool), (BrokerErrorKind, String)> {
        let conn_arc = self.connection_for(device_id).await?;
        let mut conn = conn_arc.lock().await;

        if let Some(cached) = conn.cache.get(command) {
            self.stats.command_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((cached.output.clone(), true));
        }

        self.stats.command_misses.fetch_add(1, Ordering::Relaxed);

        let _permit = self
            .transport_semaphore
            .acquire()
            .await
            .map_err(|e| (BrokerErrorKind::Other, e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match conn.transport.execute(command).await {
                Ok(output) => {
                    conn.cache.insert(
                        command.to_string(),
                        CachedCommandResult {
                            command_text: command.to_string(),
                            output: output.clone(),
                            captured_at: Instant::now(),
                            size_bytes: output.len(),
                        },
                    );
                    conn.last_used = Instant::now();
                    return Ok((output, false));
                }
                Err((kind, message)) => {
                    if kind.is_retryable() && self.retry_policy.should_retry(attempt) {
                        tokio::time::sleep(self.retry_policy.delay_for(attempt)).await;
                        continue;
                    }
                    return Err((kind, message));
                }
            }
        }
    }

    async fn connection_for(
        &self,
        device_id: &str,
    ) -> Result<Arc<Mutex<BrokerConnection>>, (BrokerErrorKind, String)> {
        {
            let devices = self.devices.lock().await;
            if let Some(existing) = devices.get(device_id) {
                let mut conn = existing.lock().await;
                if conn.transport.is_connected().await {
                    self.stats.connection_hits.fetch_add(1, Ordering::Relaxed);
                    drop(conn);
                    return Ok(Arc::clone(existing));
                }
                conn.transport.close().await;
            }
        }

        let device = self
            .all_devices
            .get(device_id)
            .ok_or_else(|| (BrokerErrorKind::Other, format!("unknown device {device_id}")))?;
        let transport = self
            .transport_factory
            .build(device)
            .map_err(|message| (BrokerErrorKind::Other, message))?;

        self.stats.connection_misses.fetch_add(1, Ordering::Relaxed);

        let conn = Arc::new(Mutex::new(BrokerConnection {
            device_id: device_id.to_string(),
            transport,
            last_used: Instant::now(),
            cache: HashMap::new(),
        }));

        let mut devices = self.devices.lock().await;
        devices.insert(device_id.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn disconnect(&self, device_id: &str) {
        let mut devices = self.devices.lock().await;
        if let Some(conn) = devices.remove(device_id) {
            conn.lock().await.transport.close().await;
        }
    }

    async fn close_all(&self) {
        let mut devices = self.devices.lock().await;
        for (_, conn) in devices.drain() {
            conn.lock().await.transport.close().await;
        }
    }
}

/// RAII handle for the running broker. Dropping it best-effort-removes the
/// socket file; callers that want orderly, awaited teardown should call
/// [`BrokerHandle::shutdown`] explicitly -- the spec's "context-scoped
/// construct" guaranteeing teardown on every exit path, including
/// panic/abort, is the combination of this `Drop` and `shutdown`.
pub struct BrokerHandle {
    socket_path: PathBuf,
    accept_task: Option<JoinHandle<()>>,
    core: Arc<BrokerCore>,
}

impl BrokerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn stats_line(&self) -> String {
        self.core.stats.snapshot_line()
    }

    /// Awaits the accept loop's shutdown, closes every open transport, and
    /// removes the socket file.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.core.close_all().await;
        info!("{}", self.core.stats.snapshot_line());
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Defaults to `min(50, 2 * device_count)` per the spec.
pub fn default_max_transports(device_count: usize) -> usize {
    (2 * device_count).clamp(1, 50)
}

/// Starts the broker, binding a Unix-domain socket at `socket_path` and
/// spawning its accept loop. The consolidated testbed's devices (plus the
/// full `DeviceRecord`s, which the testbed YAML doesn't round-trip) are
/// supplied so connections can be opened on demand.
pub async fn start_broker(
    socket_path: PathBuf,
    devices: Vec<DeviceRecord>,
    _consolidated_testbed: &Testbed,
    max_transports: Option<usize>,
    retry_policy: RetryPolicy,
    transport_factory: Box<dyn TransportFactory>,
) -> std::io::Result<BrokerHandle> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let max_transports = max_transports.unwrap_or_else(|| default_max_transports(devices.len()));
    let all_devices = devices
        .into_iter()
        .map(|d| (d.device_id.clone(), d))
        .collect();

    let core = Arc::new(BrokerCore {
        devices: Mutex::new(HashMap::new()),
        all_devices,
        transport_semaphore: Arc::new(Semaphore::new(max_transports.max(1))),
        transport_factory,
        retry_policy,
        stats: BrokerStats::default(),
    });

    let listener = UnixListener::bind(&socket_path)?;
    let accept_core = Arc::clone(&core);
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let core = Arc::clone(&accept_core);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, core).await {
                            warn!("broker connection error: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("broker accept error: {err}");
                    break;
                }
            }
        }
    });

    Ok(BrokerHandle {
        socket_path,
        accept_task: Some(accept_task),
        core,
    })
}

async fn handle_connection(stream: UnixStream, core: Arc<BrokerCore>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<BrokerRequest>(trimmed) {
            Ok(BrokerRequest::Exec {
                device_id,
                command,
                request_id,
            }) => {
                let start = Instant::now();
                match core.exec(&device_id, &command).await {
                    Ok((output, cached)) => BrokerResponse::Ok {
                        request_id,
                        ok: true,
                        output,
                        cached,
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                    Err((kind, message)) => {
                        let err = core_error_from_broker(&device_id, kind, message);
                        BrokerResponse::Err {
                            request_id,
                            ok: false,
                            error_kind: kind.as_str().to_string(),
                            message: err.to_string(),
                        }
                    }
                }
            }
            Ok(BrokerRequest::Disconnect { device_id, request_id }) => {
                core.disconnect(&device_id).await;
                BrokerResponse::Ok {
                    request_id,
                    ok: true,
                    output: String::new(),
                    cached: false,
                    duration_ms: 0,
                }
            }
            Ok(BrokerRequest::Stats { request_id }) => BrokerResponse::StatsOk {
                request_id,
                ok: true,
                connection_hits: core.stats.connection_hits.load(Ordering::Relaxed),
                connection_misses: core.stats.connection_misses.load(Ordering::Relaxed),
                command_hits: core.stats.command_hits.load(Ordering::Relaxed),
                command_misses: core.stats.command_misses.load(Ordering::Relaxed),
            },
            Err(err) => BrokerResponse::Err {
                request_id: "unknown".to_string(),
                ok: false,
                error_kind: "other".to_string(),
                message: format!("malformed request: {err}"),
            },
        };

        let mut payload = serde_json::to_string(&response).unwrap_or_default();
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;

    struct NullFactory;
    impl TransportFactory for NullFactory {
        fn build(&self, _device: &DeviceRecord) -> Result<Box<dyn DeviceTransport>, String> {
            Ok(Box::new(NullTransport::new().with_response("show version", "v1")))
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

    fn core_with(devices: Vec<DeviceRecord>) -> BrokerCore {
        let all_devices = devices.into_iter().map(|d| (d.device_id.clone(), d)).collect();
        BrokerCore {
            devices: Mutex::new(HashMap::new()),
            all_devices,
            transport_semaphore: Arc::new(Semaphore::new(10)),
            transport_factory: Box::new(NullFactory),
            retry_policy: RetryPolicy::default(),
            stats: BrokerStats::default(),
        }
    }

    #[tokio::test]
    async fn repeated_identical_command_is_one_miss_and_rest_hits() {
        let core = core_with(vec![device("r1")]);
        for i in 0..4 {
            let (output, cached) = core.exec("r1", "show version").await.unwrap();
            assert_eq!(output, "v1");
            assert_eq!(cached, i != 0);
        }
        assert_eq!(core.stats.command_misses.load(Ordering::Relaxed), 1);
        assert_eq!(core.stats.command_hits.load(Ordering::Relaxed), 3);
        assert_eq!(core.stats.connection_misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn two_devices_open_two_connections() {
        let core = core_with(vec![device("r1"), device("r2")]);
        core.exec("r1", "show version").await.unwrap();
        core.exec("r2", "show version").await.unwrap();
        core.exec("r1", "show version").await.unwrap();
        core.exec("r2", "show version").await.unwrap();
        assert_eq!(core.stats.connection_misses.load(Ordering::Relaxed), 2);
        assert_eq!(core.stats.command_misses.load(Ordering::Relaxed), 2);
        assert_eq!(core.stats.command_hits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unknown_device_errors() {
        let core = core_with(vec![]);
        let result = core.exec("ghost", "show version").await;
        assert!(result.is_err());
    }

    #[test]
    fn default_max_transports_is_capped_at_50() {
        assert_eq!(default_max_transports(1), 2);
        assert_eq!(default_max_transports(100), 50);
        assert_eq!(default_max_transports(0), 1);
    }
}
