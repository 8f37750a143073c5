//! Ephemeral warm-up server control
//!
//! Two artifact classes only materialize caches as a side effect of serving
//! real requests, so the pipeline briefly runs the serving process on a
//! private port, waits for readiness, sends one deterministic probe request
//! and tears the server down. Concurrency is pinned to one in-flight
//! request to bound memory and isolate failures.
//!
//! The `ServingBackend` trait is the seam between the orchestrator and the
//! real launcher; tests substitute a scripted backend.

use crate::config::schema::ServerConfig;
use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll interval for the readiness check
const READY_POLL: Duration = Duration::from_secs(1);

/// Per-request timeout for the readiness check
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the probe generation request
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to launch one warm-up server
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub model: String,
    pub tp: u32,
    pub port: u16,
    pub enable_compile: bool,
    pub trust_remote_code: bool,
    pub server: ServerConfig,
    pub env: Vec<(String, String)>,
    pub log_path: Option<PathBuf>,
}

/// A started warm-up server
#[derive(Debug)]
pub struct ServerHandle {
    pub port: u16,
    child: Option<Child>,
}

impl ServerHandle {
    /// Handle without a managed process (scripted test backends)
    pub fn detached(port: u16) -> Self {
        Self { port, child: None }
    }
}

/// How a server shutdown went
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownOutcome {
    /// Process exited after the graceful terminate signal
    pub graceful: bool,
    /// A forced kill was needed
    pub forced_kill: bool,
    pub timeout_s: u64,
}

/// Seam between the orchestrator and the serving process
#[async_trait]
pub trait ServingBackend: Send + Sync {
    /// Launch the server bound to the spec's port
    async fn start(&self, spec: &ServerSpec) -> KilnResult<ServerHandle>;

    /// Poll the health endpoint until ready or `timeout` elapses
    async fn wait_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> bool;

    /// Issue one short deterministic generation request
    async fn send_probe(&self, handle: &ServerHandle) -> bool;

    /// Graceful terminate, escalating to a forced kill after `timeout`
    async fn stop(&self, handle: ServerHandle, timeout: Duration) -> ShutdownOutcome;
}

/// Real backend launching the configured serving command
pub struct LaunchServerBackend;

impl LaunchServerBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LaunchServerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full launcher argv for a spec
pub fn build_args(spec: &ServerSpec) -> Vec<String> {
    fn push_kv(args: &mut Vec<String>, flag: &str, value: String) {
        args.push(flag.to_string());
        args.push(value);
    }

    let mut args: Vec<String> = spec.server.launcher.clone();
    let s = &spec.server;

    push_kv(&mut args, "--model-path", spec.model.clone());
    push_kv(&mut args, "--host", "0.0.0.0".to_string());
    push_kv(&mut args, "--port", spec.port.to_string());
    args.push("--enable-metrics".to_string());
    push_kv(&mut args, "--tp-size", spec.tp.to_string());
    push_kv(&mut args, "--mem-fraction-static", s.mem_fraction_static.to_string());
    push_kv(&mut args, "--kv-cache-dtype", s.kv_cache_dtype.clone());
    push_kv(&mut args, "--chunked-prefill-size", s.chunked_prefill_size.to_string());
    push_kv(&mut args, "--max-mamba-cache-size", s.max_mamba_cache_size.to_string());
    push_kv(&mut args, "--context-length", s.context_length.to_string());
    push_kv(&mut args, "--max-prefill-tokens", s.max_prefill_tokens.to_string());
    push_kv(&mut args, "--max-total-tokens", s.max_total_tokens.to_string());
    // memory-safe warm-up: one request in flight, one queued
    push_kv(&mut args, "--max-running-requests", "1".to_string());
    push_kv(&mut args, "--max-queued-requests", "1".to_string());

    if spec.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    } else {
        args.push("--no-trust-remote-code".to_string());
    }
    if spec.enable_compile {
        args.push("--enable-torch-compile".to_string());
        push_kv(&mut args, "--torch-compile-max-bs", "1".to_string());
    }

    args
}

#[async_trait]
impl ServingBackend for LaunchServerBackend {
    async fn start(&self, spec: &ServerSpec) -> KilnResult<ServerHandle> {
        let args = build_args(spec);
        let program = args
            .first()
            .cloned()
            .ok_or_else(|| KilnError::ConfigMissing("server.launcher".to_string()))?;

        debug!("starting warm-up server: {}", args.join(" "));

        let (stdout, stderr) = match &spec.log_path {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| KilnError::io(format!("opening log {}", path.display()), e))?;
                let clone = file
                    .try_clone()
                    .map_err(|e| KilnError::io("cloning log handle", e))?;
                (Stdio::from(clone), Stdio::from(file))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| KilnError::ServerStart(format!("{}: {}", program, e)))?;

        Ok(ServerHandle {
            port: spec.port,
            child: Some(child),
        })
    }

    async fn wait_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> bool {
        let url = format!("http://127.0.0.1:{}/get_model_info", handle.port);
        let deadline = Instant::now() + timeout;

        loop {
            // A server that already died will never become ready
            if let Some(child) = handle.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    warn!("warm-up server exited early: {}", status);
                    return false;
                }
            }

            let check_url = url.clone();
            let ready = tokio::task::spawn_blocking(move || http_get_ok(&check_url))
                .await
                .unwrap_or(false);
            if ready {
                return true;
            }

            if Instant::now() + READY_POLL > deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn send_probe(&self, handle: &ServerHandle) -> bool {
        let url = format!("http://127.0.0.1:{}/generate", handle.port);
        tokio::task::spawn_blocking(move || http_post_probe(&url))
            .await
            .unwrap_or(false)
    }

    async fn stop(&self, handle: ServerHandle, timeout: Duration) -> ShutdownOutcome {
        let mut outcome = ShutdownOutcome {
            graceful: false,
            forced_kill: false,
            timeout_s: timeout.as_secs(),
        };

        let Some(mut child) = handle.child else {
            outcome.graceful = true;
            return outcome;
        };

        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a child we spawned
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => {
                outcome.graceful = true;
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("forced kill of warm-up server failed: {}", e);
                }
                let _ = child.wait().await;
                outcome.forced_kill = true;
            }
        }

        outcome
    }
}

fn agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

fn http_get_ok(url: &str) -> bool {
    match agent(READY_REQUEST_TIMEOUT).get(url).call() {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Deterministic probe: temperature 0, few new tokens
fn http_post_probe(url: &str) -> bool {
    let payload = serde_json::json!({
        "text": "The capital city of France is",
        "sampling_params": {"temperature": 0.0, "max_new_tokens": 16},
    });
    let result = agent(PROBE_TIMEOUT)
        .post(url)
        .header("content-type", "application/json")
        .send(payload.to_string().as_bytes());
    match result {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn spec(enable_compile: bool) -> ServerSpec {
        ServerSpec {
            model: "/models/test".to_string(),
            tp: 2,
            port: 31999,
            enable_compile,
            trust_remote_code: true,
            server: ServerConfig::default(),
            env: vec![],
            log_path: None,
        }
    }

    #[test]
    fn build_args_basic_shape() {
        let args = build_args(&spec(false));
        assert_eq!(args[0], "python3");
        assert!(args.contains(&"--model-path".to_string()));
        assert!(args.contains(&"/models/test".to_string()));
        assert!(args.contains(&"31999".to_string()));
        assert!(args.contains(&"--trust-remote-code".to_string()));
        assert!(!args.contains(&"--enable-torch-compile".to_string()));

        // warm-up concurrency pinned to one request
        let idx = args.iter().position(|a| a == "--max-running-requests").unwrap();
        assert_eq!(args[idx + 1], "1");
    }

    #[test]
    fn build_args_compile_enabled() {
        let args = build_args(&spec(true));
        assert!(args.contains(&"--enable-torch-compile".to_string()));
        assert!(args.contains(&"--torch-compile-max-bs".to_string()));
    }

    #[test]
    fn build_args_no_trust_remote_code() {
        let mut spec = spec(false);
        spec.trust_remote_code = false;
        let args = build_args(&spec);
        assert!(args.contains(&"--no-trust-remote-code".to_string()));
    }

    /// Minimal HTTP responder: answers 200 to every request
    fn spawn_http_ok() -> (u16, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming().take(4) {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
            }
        });
        (port, handle)
    }

    #[tokio::test]
    async fn wait_ready_against_listener() {
        let (port, _t) = spawn_http_ok();
        let backend = LaunchServerBackend::new();
        let mut handle = ServerHandle::detached(port);

        assert!(backend.wait_ready(&mut handle, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_server() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let backend = LaunchServerBackend::new();
        let mut handle = ServerHandle::detached(port);
        assert!(!backend.wait_ready(&mut handle, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn probe_against_listener() {
        let (port, _t) = spawn_http_ok();
        let backend = LaunchServerBackend::new();
        let handle = ServerHandle::detached(port);

        assert!(backend.send_probe(&handle).await);
    }

    #[tokio::test]
    async fn stop_graceful_on_term() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let handle = ServerHandle {
            port: 0,
            child: Some(child),
        };

        let backend = LaunchServerBackend::new();
        let outcome = backend.stop(handle, Duration::from_secs(5)).await;
        assert!(outcome.graceful);
        assert!(!outcome.forced_kill);
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let handle = ServerHandle {
            port: 0,
            child: Some(child),
        };

        let backend = LaunchServerBackend::new();
        let outcome = backend.stop(handle, Duration::from_millis(300)).await;
        assert!(outcome.forced_kill);
        assert!(!outcome.graceful);
    }

    #[tokio::test]
    async fn stop_detached_is_graceful() {
        let backend = LaunchServerBackend::new();
        let outcome = backend
            .stop(ServerHandle::detached(0), Duration::from_secs(1))
            .await;
        assert!(outcome.graceful);
    }
}
