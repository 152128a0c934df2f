//! Resource availability monitor.
//!
//! Probes the backends a task might need (the remote API, the local
//! inference host) and caches the result so the Executor's dispatch loop can
//! make a synchronous yes/no decision per tick without blocking on network
//! I/O for every ready task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;

use crate::config::LlmConfig;

/// Resource id for the configured remote LLM provider.
pub const REMOTE: &str = "anthropic";
/// Resource id for the configured local inference backend.
pub const LOCAL: &str = "ollama";

const HTTP_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_TIMEOUT: Duration = Duration::from_millis(1500);
/// How long an offline result is trusted before the next check bothers
/// re-probing, so a dead backend doesn't get hammered every tick.
const OFFLINE_SKIP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: String,
    pub status: Status,
    pub method: &'static str,
    pub checked_at: Instant,
}

struct ResourceDef {
    id: &'static str,
    kind: ResourceKind,
}

enum ResourceKind {
    ApiKeyOnly { env_var: String },
    Http { health_url: String, tcp_host: String, tcp_port: u16 },
}

/// Periodic health monitor over the configured backends, grounded on the
/// same "HTTP health check, TCP fallback, cache the result" shape as the
/// branch watcher's poll loop.
pub struct ResourceMonitor {
    resources: Vec<ResourceDef>,
    http: Client,
    states: Mutex<HashMap<String, ResourceState>>,
}

impl ResourceMonitor {
    pub fn new(llm: &LlmConfig) -> Self {
        let local_url = llm.local_base_url.trim_end_matches('/').to_string();
        let (tcp_host, tcp_port) = parse_host_port(&local_url, 11434);

        let resources = vec![
            ResourceDef { id: REMOTE, kind: ResourceKind::ApiKeyOnly { env_var: llm.api_key_env.clone() } },
            ResourceDef {
                id: LOCAL,
                kind: ResourceKind::Http { health_url: format!("{local_url}/api/tags"), tcp_host, tcp_port },
            },
        ];

        Self {
            resources,
            http: Client::builder().timeout(HTTP_TIMEOUT).build().expect("reqwest client build"),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every resource concurrently and refresh the cache.
    pub async fn check_all(&self) {
        let checks = self.resources.iter().map(|res| self.check_one(res));
        let results = futures::future::join_all(checks).await;

        let mut states = self.states.lock().expect("resource monitor mutex poisoned");
        for state in results {
            states.insert(state.id.clone(), state);
        }
    }

    async fn check_one(&self, res: &ResourceDef) -> ResourceState {
        match &res.kind {
            ResourceKind::ApiKeyOnly { env_var } => {
                let online = std::env::var(env_var).map(|v| !v.is_empty()).unwrap_or(false);
                ResourceState {
                    id: res.id.to_string(),
                    status: if online { Status::Online } else { Status::Offline },
                    method: "api_key",
                    checked_at: Instant::now(),
                }
            }
            ResourceKind::Http { health_url, tcp_host, tcp_port } => {
                if self.http.get(health_url).send().await.map(|r| r.status().is_success()).unwrap_or(false) {
                    return ResourceState {
                        id: res.id.to_string(),
                        status: Status::Online,
                        method: "http",
                        checked_at: Instant::now(),
                    };
                }

                let tcp_ok = tokio::time::timeout(TCP_TIMEOUT, tokio::net::TcpStream::connect((tcp_host.as_str(), *tcp_port)))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);

                ResourceState {
                    id: res.id.to_string(),
                    status: if tcp_ok { Status::Online } else { Status::Offline },
                    method: if tcp_ok { "tcp" } else { "none" },
                    checked_at: Instant::now(),
                }
            }
        }
    }

    /// Synchronous cache lookup. A resource never checked is treated as
    /// unavailable rather than optimistically available. A stale `Offline`
    /// reading is trusted for [`OFFLINE_SKIP`] before the next `check_all`
    /// is worth running again — callers on a tick loop can skip a refresh
    /// entirely while every known resource is within its skip window.
    pub fn is_available(&self, resource_id: &str) -> bool {
        let states = self.states.lock().expect("resource monitor mutex poisoned");
        matches!(states.get(resource_id), Some(state) if state.status == Status::Online)
    }

    /// Whether `check_all` is worth calling again right now: any resource
    /// whose last reading is stale, or whose offline skip window has
    /// elapsed.
    pub fn needs_refresh(&self, poll_interval: Duration) -> bool {
        let states = self.states.lock().expect("resource monitor mutex poisoned");
        if states.len() < self.resources.len() {
            return true;
        }
        states.values().any(|s| {
            let age = s.checked_at.elapsed();
            match s.status {
                Status::Online => age >= poll_interval,
                Status::Offline => age >= OFFLINE_SKIP,
            }
        })
    }

    /// Run `check_all` on a fixed interval until cancelled. Intended to be
    /// spawned once at startup alongside the Executor's tick loop.
    pub async fn run_background(&self, poll_interval: Duration) {
        self.check_all().await;
        loop {
            tokio::time::sleep(poll_interval).await;
            self.check_all().await;
        }
    }
}

#[cfg(test)]
impl ResourceMonitor {
    /// Force a resource's cached status without a real probe. Used by
    /// callers downstream of this module (e.g. the Executor's tests) that
    /// need a deterministic `is_available` without touching the network.
    pub fn force_status(&self, resource_id: &str, status: Status) {
        let mut states = self.states.lock().expect("resource monitor mutex poisoned");
        states.insert(
            resource_id.to_string(),
            ResourceState { id: resource_id.to_string(), status, method: "forced", checked_at: Instant::now() },
        );
    }
}

/// The model tier that governs which resource a task needs to be online.
pub fn resource_for_tier(tier: crate::domain::ModelTier) -> &'static str {
    match tier {
        crate::domain::ModelTier::Ollama => LOCAL,
        _ => REMOTE,
    }
}

fn parse_host_port(url: &str, default_port: u16) -> (String, u16) {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_splits_scheme_and_port() {
        assert_eq!(parse_host_port("http://localhost:11434", 0), ("localhost".to_string(), 11434));
        assert_eq!(parse_host_port("http://example.com", 8080), ("example.com".to_string(), 8080));
    }

    #[test]
    fn resource_for_tier_maps_local_vs_remote() {
        assert_eq!(resource_for_tier(crate::domain::ModelTier::Ollama), LOCAL);
        assert_eq!(resource_for_tier(crate::domain::ModelTier::Haiku), REMOTE);
        assert_eq!(resource_for_tier(crate::domain::ModelTier::Sonnet), REMOTE);
    }

    #[tokio::test]
    async fn api_key_only_resource_reflects_env_var() {
        let llm = LlmConfig { api_key_env: "FORGE_TEST_RESOURCE_KEY_XYZ".to_string(), ..LlmConfig::default() };
        std::env::remove_var("FORGE_TEST_RESOURCE_KEY_XYZ");
        let monitor = ResourceMonitor::new(&llm);
        monitor.check_all().await;
        assert!(!monitor.is_available(REMOTE));

        std::env::set_var("FORGE_TEST_RESOURCE_KEY_XYZ", "sk-test");
        monitor.check_all().await;
        assert!(monitor.is_available(REMOTE));
        std::env::remove_var("FORGE_TEST_RESOURCE_KEY_XYZ");
    }
}
