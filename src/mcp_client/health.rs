//! Server health: probe classification and the per-server monitor loops.
//!
//! Probe failures are data. They update the record and never reach the
//! caller as errors; `check_now` only fails for an unknown server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::auth::AuthProvider;
use super::errors::{McpError, McpResult};
use super::registry::ServerRegistry;
use super::server::{HealthPolicy, RemoteServer, ServerId};
use crate::events::{EventBus, HealthTransition, HubEvent, Versioned};

// ─── Status & record ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// 2xx response.
    Success { latency_ms: u64 },
    /// Non-2xx response.
    SoftFailure { status: u16, latency_ms: u64 },
    /// Timeout, refused connection, DNS failure.
    HardFailure { reason: String },
}

/// Rolling health state for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub server_id: ServerId,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Moving average over successful probes only.
    pub avg_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: u64,
}

/// What a single probe did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub transition: Option<HealthTransition>,
}

impl HealthChange {
    pub fn status_changed(&self) -> bool {
        self.previous != self.current
    }
}

impl HealthRecord {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            status: HealthStatus::Unknown,
            latency_ms: None,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            avg_latency_ms: None,
            last_error: None,
            version: 0,
        }
    }

    /// Fold one probe outcome into the record under `policy`.
    pub fn apply(&mut self, outcome: &ProbeOutcome, policy: &HealthPolicy, now: DateTime<Utc>) -> HealthChange {
        let previous = self.status;
        self.last_check = Some(now);

        match outcome {
            ProbeOutcome::Success { latency_ms } => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.latency_ms = Some(*latency_ms);
                self.last_error = None;
                let sample = *latency_ms as f64;
                self.avg_latency_ms = Some(match self.avg_latency_ms {
                    Some(avg) => policy.ema_alpha * sample + (1.0 - policy.ema_alpha) * avg,
                    None => sample,
                });

                self.status = match previous {
                    HealthStatus::Unknown | HealthStatus::Healthy => HealthStatus::Healthy,
                    HealthStatus::Unhealthy
                        if self.consecutive_successes >= policy.soft_recovery_successes =>
                    {
                        HealthStatus::Degraded
                    }
                    HealthStatus::Unhealthy => HealthStatus::Unhealthy,
                    HealthStatus::Degraded
                        if self.consecutive_successes >= policy.full_recovery_successes =>
                    {
                        HealthStatus::Healthy
                    }
                    HealthStatus::Degraded => HealthStatus::Degraded,
                };
            }
            ProbeOutcome::SoftFailure { .. } | ProbeOutcome::HardFailure { .. } => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                match outcome {
                    ProbeOutcome::SoftFailure { status, latency_ms } => {
                        self.latency_ms = Some(*latency_ms);
                        self.last_error = Some(format!("HTTP {status}"));
                    }
                    ProbeOutcome::HardFailure { reason } => {
                        self.latency_ms = None;
                        self.last_error = Some(reason.clone());
                    }
                    ProbeOutcome::Success { .. } => {}
                }

                self.status = if self.consecutive_failures >= policy.failure_threshold {
                    HealthStatus::Unhealthy
                } else if previous == HealthStatus::Unhealthy {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }
        }

        let transition = match (previous, self.status) {
            (HealthStatus::Unhealthy, HealthStatus::Unhealthy) => None,
            (_, HealthStatus::Unhealthy) => Some(HealthTransition::Unreachable),
            (HealthStatus::Unhealthy, _) => Some(HealthTransition::Recovered),
            _ => None,
        };

        HealthChange {
            previous,
            current: self.status,
            transition,
        }
    }
}

impl Versioned for HealthRecord {
    type Key = ServerId;

    fn key(&self) -> ServerId {
        self.server_id.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// `GET <endpoint>/health`.
pub fn health_url(endpoint: &str) -> String {
    format!("{}/health", endpoint.trim_end_matches('/'))
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

struct ProbeLoop {
    interval_seconds: u64,
    cancel: CancellationToken,
}

/// Owns one probe loop per monitored server.
pub struct HealthMonitor {
    http: reqwest::Client,
    servers: Arc<ServerRegistry>,
    auth: Arc<AuthProvider>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
    loops: Mutex<HashMap<ServerId, ProbeLoop>>,
}

impl HealthMonitor {
    pub fn new(
        servers: Arc<ServerRegistry>,
        auth: Arc<AuthProvider>,
        bus: Arc<EventBus>,
    ) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                server: "*".into(),
                reason: format!("failed to build probe client: {e}"),
            })?;
        Ok(Self {
            http,
            servers,
            auth,
            bus,
            shutdown: CancellationToken::new(),
            loops: Mutex::new(HashMap::new()),
        })
    }

    /// Probe one server now and fold the outcome into its record.
    pub async fn check_now(&self, server_id: &ServerId) -> McpResult<HealthRecord> {
        let server = self.servers.get(server_id)?;
        let outcome = self.probe(&server).await;
        let record = self.servers.record_health(server_id, &outcome)?;
        tracing::debug!(
            server = %server_id,
            status = ?record.status,
            latency_ms = record.latency_ms,
            failures = record.consecutive_failures,
            "health probe"
        );
        Ok(record)
    }

    async fn probe(&self, server: &RemoteServer) -> ProbeOutcome {
        let timeout = Duration::from_secs(server.health_policy.timeout_seconds);
        let request = self
            .auth
            .attach_cached(server, self.http.get(health_url(&server.endpoint)).timeout(timeout));

        let start = Instant::now();
        match request.send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let status = response.status();
                if status.is_success() {
                    ProbeOutcome::Success { latency_ms }
                } else {
                    ProbeOutcome::SoftFailure {
                        status: status.as_u16(),
                        latency_ms,
                    }
                }
            }
            Err(e) if e.is_timeout() => ProbeOutcome::HardFailure {
                reason: format!("timed out after {}ms", timeout.as_millis()),
            },
            Err(e) => ProbeOutcome::HardFailure {
                reason: format!("connection failed: {e}"),
            },
        }
    }

    /// Start loops for every registered server and follow registry changes
    /// until [`shutdown`](Self::shutdown).
    pub fn start_monitoring(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.bus.subscribe(HubEvent::is_server_event);
        for server in self.servers.list() {
            self.ensure_loop(&server);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(servers = this.monitored_count(), "health monitoring started");
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event = changes.recv() => match event {
                        Some(HubEvent::ServerAdded { server } | HubEvent::ServerUpdated { server }) => {
                            this.ensure_loop(&server);
                        }
                        Some(HubEvent::ServerRemoved { server_id, .. }) => this.stop_loop(&server_id),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            this.stop_all();
            tracing::info!("health monitoring stopped");
        })
    }

    /// Stop every loop and the change follower.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_all();
    }

    /// Number of servers with a running probe loop.
    pub fn monitored_count(&self) -> usize {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_monitoring(&self, server_id: &ServerId) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(server_id)
    }

    /// Make the loop for `server` match its policy.
    fn ensure_loop(self: &Arc<Self>, server: &RemoteServer) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let policy = &server.health_policy;
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);

        if !policy.enabled {
            if let Some(old) = loops.remove(&server.id) {
                old.cancel.cancel();
            }
            return;
        }
        if let Some(existing) = loops.get(&server.id) {
            if existing.interval_seconds == policy.interval_seconds {
                return;
            }
            existing.cancel.cancel();
        }

        let cancel = self.shutdown.child_token();
        loops.insert(
            server.id.clone(),
            ProbeLoop {
                interval_seconds: policy.interval_seconds,
                cancel: cancel.clone(),
            },
        );
        drop(loops);

        tracing::debug!(server = %server.id, interval_secs = policy.interval_seconds, "probe loop started");
        let interval = Duration::from_secs(policy.interval_seconds);
        tokio::spawn(Arc::clone(self).run_loop(server.id.clone(), interval, cancel));
    }

    fn stop_loop(&self, server_id: &ServerId) {
        let removed = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        if let Some(l) = removed {
            l.cancel.cancel();
            tracing::debug!(server = %server_id, "probe loop stopped");
        }
    }

    fn stop_all(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, l) in loops.drain() {
            l.cancel.cancel();
        }
    }

    async fn run_loop(self: Arc<Self>, server_id: ServerId, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.check_now(&server_id) => {
                    if let Err(McpError::ServerNotFound { .. }) = result {
                        break;
                    }
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use crate::mcp_client::auth::NoopAuthorizer;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hard() -> ProbeOutcome {
        ProbeOutcome::HardFailure {
            reason: "timed out".into(),
        }
    }

    fn ok(ms: u64) -> ProbeOutcome {
        ProbeOutcome::Success { latency_ms: ms }
    }

    fn run(outcomes: &[ProbeOutcome]) -> HealthRecord {
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(ServerId::from("s"));
        for o in outcomes {
            record.apply(o, &policy, Utc::now());
        }
        record
    }

    #[test]
    fn test_first_success_is_healthy() {
        let record = run(&[ok(40)]);
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.avg_latency_ms, Some(40.0));
    }

    #[test]
    fn test_threshold_then_debounced_recovery() {
        let mut record = run(&[ok(10), hard(), hard(), hard()]);
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.consecutive_failures, 3);

        let policy = HealthPolicy::default();
        let change = record.apply(&ok(20), &policy, Utc::now());
        assert_eq!(record.status, HealthStatus::Degraded);
        assert_eq!(change.transition, Some(HealthTransition::Recovered));

        record.apply(&ok(20), &policy, Utc::now());
        assert_eq!(record.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_two_timeouts_then_success_stays_degraded() {
        let record = run(&[hard(), hard(), ok(120)]);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.consecutive_successes, 1);
        assert_eq!(record.avg_latency_ms, Some(120.0));
        assert_eq!(record.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_soft_failure_degrades_healthy() {
        let record = run(&[
            ok(10),
            ProbeOutcome::SoftFailure {
                status: 503,
                latency_ms: 5,
            },
        ]);
        assert_eq!(record.status, HealthStatus::Degraded);
        assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));
        // Failed probes leave the average alone.
        assert_eq!(record.avg_latency_ms, Some(10.0));
    }

    #[test]
    fn test_ema_smoothing() {
        let record = run(&[ok(100), ok(200)]);
        let avg = record.avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_unreachable_transition_fires_once() {
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(ServerId::from("s"));
        let changes: Vec<_> = (0..5)
            .map(|_| record.apply(&hard(), &policy, Utc::now()).transition)
            .collect();
        assert_eq!(
            changes,
            vec![None, None, Some(HealthTransition::Unreachable), None, None]
        );
    }

    #[test]
    fn test_custom_policy_threshold() {
        let policy = HealthPolicy {
            failure_threshold: 1,
            full_recovery_successes: 3,
            ..HealthPolicy::default()
        };
        let mut record = HealthRecord::new(ServerId::from("s"));
        record.apply(&hard(), &policy, Utc::now());
        assert_eq!(record.status, HealthStatus::Unhealthy);
        for _ in 0..2 {
            record.apply(&ok(1), &policy, Utc::now());
        }
        assert_eq!(record.status, HealthStatus::Degraded);
        record.apply(&ok(1), &policy, Utc::now());
        assert_eq!(record.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_url() {
        assert_eq!(health_url("https://a.example.com/mcp/"), "https://a.example.com/mcp/health");
        assert_eq!(health_url("https://a.example.com/mcp"), "https://a.example.com/mcp/health");
    }

    fn monitor(bus: Arc<EventBus>) -> (Arc<ServerRegistry>, Arc<HealthMonitor>) {
        let servers = Arc::new(ServerRegistry::new(Arc::clone(&bus)));
        let auth = Arc::new(
            AuthProvider::new(AuthSettings::default(), Arc::new(NoopAuthorizer)).unwrap(),
        );
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&servers), auth, bus).unwrap());
        (servers, monitor)
    }

    #[tokio::test]
    async fn test_check_now_against_mock_server() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock)
            .await;

        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe(HubEvent::is_health_event);
        let (servers, monitor) = monitor(Arc::clone(&bus));
        let id = servers.insert_unchecked("mock", &format!("{}/mcp", mock.uri()));

        let record = monitor.check_now(&id).await.unwrap();
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(servers.get(&id).unwrap().status, HealthStatus::Healthy);
        match events.try_recv() {
            Some(HubEvent::HealthChanged { status_changed, .. }) => assert!(status_changed),
            other => panic!("expected health event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_failures_are_absorbed() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock)
            .await;

        let (servers, monitor) = monitor(Arc::new(EventBus::new()));
        let soft = servers.insert_unchecked("soft", &mock.uri());
        // Nothing listens on port 9 on loopback.
        let hard = servers.insert_unchecked("hard", "http://127.0.0.1:9");

        let soft_record = monitor.check_now(&soft).await.unwrap();
        assert_eq!(soft_record.status, HealthStatus::Degraded);
        assert_eq!(soft_record.consecutive_failures, 1);

        let hard_record = monitor.check_now(&hard).await.unwrap();
        assert_eq!(hard_record.status, HealthStatus::Degraded);
        assert!(hard_record.latency_ms.is_none());

        assert!(matches!(
            monitor.check_now(&ServerId::from("nope")).await,
            Err(McpError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_monitoring_follows_registry() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock)
            .await;

        let (servers, monitor) = monitor(Arc::new(EventBus::new()));
        let first = servers.insert_unchecked("first", &mock.uri());
        let handle = monitor.start_monitoring();
        assert!(monitor.is_monitoring(&first));

        let second = servers.insert_unchecked("second", &mock.uri());
        for _ in 0..100 {
            if monitor.is_monitoring(&second) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.is_monitoring(&second));

        servers.remove(&first).unwrap();
        for _ in 0..100 {
            if !monitor.is_monitoring(&first) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!monitor.is_monitoring(&first));

        monitor.shutdown();
        handle.await.unwrap();
        assert_eq!(monitor.monitored_count(), 0);
    }
}
