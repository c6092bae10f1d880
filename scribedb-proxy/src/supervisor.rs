//! Keeps a local tunnel to the managed database alive
//!
//! The supervisor decides whether a tunnel is usable, starts one when it is
//! not, and tells apart three situations on a bound port: our own tunnel gone
//! bad, someone else's working tunnel, and an unrelated process squatting on
//! the port.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use scribedb_core::{ConfigError, ProxySettings};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::port::{find_free_port, is_port_in_use};
use crate::probe::TunnelProbe;
use crate::provision::Provisioner;
use crate::spawn::{ProcessSpawner, SpawnedTunnel, TunnelCommand, TunnelSpawner};
use crate::state::{ProxyEvent, ProxyPhase, ProxySnapshot, TunnelOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
    ExternalProxyDetected,
    PortConflict,
    Error,
}

/// Outcome of [`ProxySupervisor::ensure_healthy`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub status: StartStatus,
    pub healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl StartReport {
    pub fn new(
        status: StartStatus,
        healthy: bool,
        port: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            healthy,
            message: message.into(),
            port,
        }
    }

    fn from_error(err: &ProxyError) -> Self {
        let (status, port) = match err {
            ProxyError::PortConflict { port } => (StartStatus::PortConflict, Some(*port)),
            _ => (StartStatus::Error, None),
        };
        Self::new(status, false, port, err.to_string())
    }
}

struct TunnelState {
    phase: ProxyPhase,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
}

impl TunnelState {
    fn apply(&mut self, event: ProxyEvent) -> bool {
        match self.phase.apply(event) {
            Ok(next) => {
                debug!(from = self.phase.name(), to = next.name(), "tunnel phase change");
                if !next.is_running() {
                    self.kill = None;
                }
                self.phase = next;
                true
            }
            Err(e) => {
                debug!(error = %e, "ignored tunnel event");
                false
            }
        }
    }
}

pub struct ProxySupervisor {
    settings: ProxySettings,
    probe: Arc<dyn TunnelProbe>,
    spawner: Arc<dyn TunnelSpawner>,
    provisioner: Provisioner,
    state: Arc<Mutex<TunnelState>>,
    exited: Arc<Notify>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ProxySupervisor {
    pub fn new(settings: ProxySettings, probe: Arc<dyn TunnelProbe>) -> Self {
        Self::with_spawner(settings, probe, Arc::new(ProcessSpawner))
    }

    pub fn with_spawner(
        settings: ProxySettings,
        probe: Arc<dyn TunnelProbe>,
        spawner: Arc<dyn TunnelSpawner>,
    ) -> Self {
        let provisioner = Provisioner::new(&settings);
        Self {
            settings,
            probe,
            spawner,
            provisioner,
            state: Arc::new(Mutex::new(TunnelState {
                phase: ProxyPhase::NotRunning,
                generation: 0,
                kill: None,
            })),
            exited: Arc::new(Notify::new()),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot::from(&self.lock().phase)
    }

    /// Port of the running tunnel, owned or adopted
    pub fn active_port(&self) -> Option<u16> {
        let state = self.lock();
        state.phase.is_running().then(|| state.phase.port()).flatten()
    }

    /// Port the next health check looks at
    fn expected_port(&self) -> u16 {
        self.active_port().unwrap_or(self.settings.default_port)
    }

    /// True when the expected port is bound and answers like a database.
    ///
    /// A bound port we have no record of is adopted as an external tunnel
    /// once the probe passes.
    pub async fn is_healthy(&self) -> bool {
        let port = self.expected_port();

        if !is_port_in_use(port).await {
            debug!(port, "tunnel port is not bound");
            self.mark_external_lost(port);
            return false;
        }

        let untracked = matches!(self.lock().phase, ProxyPhase::NotRunning);
        if untracked {
            debug!(port, "port bound by a process we did not start, probing");
        }

        match tokio::time::timeout(self.settings.probe_timeout, self.probe.check(port)).await {
            Ok(Ok(())) => {
                if untracked {
                    self.adopt(port);
                }
                true
            }
            Ok(Err(e)) => {
                warn!(port, error = %e, "tunnel probe failed");
                self.mark_external_lost(port);
                false
            }
            Err(_) => {
                warn!(port, timeout = ?self.settings.probe_timeout, "tunnel probe timed out");
                self.mark_external_lost(port);
                false
            }
        }
    }

    /// Make sure a working tunnel exists, starting one if needed.
    ///
    /// Starts are serialized; concurrent callers wait and then see the tunnel
    /// the first caller brought up.
    pub async fn ensure_healthy(&self) -> StartReport {
        let _guard = self.start_lock.lock().await;

        if self.is_healthy().await {
            let port = self.expected_port();
            let origin = self.lock().phase.origin();
            return match origin {
                Some(TunnelOrigin::External) => StartReport::new(
                    StartStatus::ExternalProxyDetected,
                    true,
                    Some(port),
                    format!("using tunnel already listening on port {}", port),
                ),
                _ => StartReport::new(
                    StartStatus::AlreadyRunning,
                    true,
                    Some(port),
                    format!("tunnel is running on port {}", port),
                ),
            };
        }

        match self.start().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, kind = e.kind(), "could not bring up database tunnel");
                StartReport::from_error(&e)
            }
        }
    }

    /// Stop the tunnel this process started. Adopted tunnels are left alone.
    pub async fn stop(&self) -> bool {
        let _guard = self.start_lock.lock().await;
        self.stop_owned().await
    }

    async fn start(&self) -> Result<StartReport, ProxyError> {
        let connection_name = self.settings.connection_name.clone().ok_or_else(|| {
            ProxyError::Configuration(ConfigError::missing(["CLOUD_SQL_CONNECTION_NAME"]))
        })?;

        let preferred = self.expected_port();
        let mut scan_from = preferred;

        if is_port_in_use(preferred).await {
            if self.lock().phase.owned_generation().is_some() {
                warn!(port = preferred, "tunnel we started is unhealthy, restarting it");
                self.stop_owned().await;
                scan_from = self.settings.default_port;
            } else {
                match self.probe.check(preferred).await {
                    Ok(()) => {
                        self.adopt(preferred);
                        return Ok(StartReport::new(
                            StartStatus::ExternalProxyDetected,
                            true,
                            Some(preferred),
                            format!("using tunnel already listening on port {}", preferred),
                        ));
                    }
                    Err(e) => {
                        warn!(
                            port = preferred,
                            error = %e,
                            "port held by something that is not a working tunnel"
                        );
                        return Err(ProxyError::PortConflict { port: preferred });
                    }
                }
            }
        } else if self.lock().phase.owned_generation().is_some() {
            // Process gone but its exit not yet observed
            self.stop_owned().await;
        }

        let port = find_free_port(scan_from, self.settings.scan_attempts).await?;
        let provisioned = self.provisioner.provision().await?;
        let command = TunnelCommand {
            binary: provisioned.binary,
            connection_name,
            port,
            credentials: provisioned.credentials,
        };

        self.lock().apply(ProxyEvent::StartRequested { port });
        let spawned = match self.spawner.spawn(&command).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.lock().apply(ProxyEvent::StartFailed);
                return Err(e);
            }
        };
        let generation = self.record_spawn(spawned);
        info!(port, generation, "tunnel process started, waiting for it to settle");

        tokio::time::sleep(self.settings.settle_time).await;
        let healthy = self.is_healthy().await;
        let message = if healthy {
            format!("tunnel started on port {}", port)
        } else {
            format!("tunnel started on port {} but is not accepting connections yet", port)
        };
        if !healthy {
            warn!(port, "tunnel not healthy after settle time");
        }
        Ok(StartReport::new(StartStatus::Started, healthy, Some(port), message))
    }

    fn record_spawn(&self, spawned: SpawnedTunnel) -> u64 {
        let SpawnedTunnel { pid, exited, kill } = spawned;
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            let generation = state.generation;
            state.apply(ProxyEvent::Spawned { pid, generation });
            state.kill = Some(kill);
            generation
        };

        let state: Weak<Mutex<TunnelState>> = Arc::downgrade(&self.state);
        let notify = Arc::clone(&self.exited);
        tokio::spawn(async move {
            let report = SpawnedTunnel::exit_or_unknown(exited.await);
            match report.code {
                Some(0) => info!(generation, "tunnel process exited cleanly"),
                _ => warn!(
                    generation,
                    code = ?report.code,
                    detail = %report.detail,
                    "tunnel process exited"
                ),
            }
            if let Some(state) = state.upgrade() {
                lock_state(&state).apply(ProxyEvent::Exited {
                    generation,
                    code: report.code,
                });
            }
            notify.notify_waiters();
        });

        generation
    }

    async fn stop_owned(&self) -> bool {
        let notified = self.exited.notified();
        let (generation, kill) = {
            let mut state = self.lock();
            match state.phase.owned_generation() {
                Some(generation) => (generation, state.kill.take()),
                None => return false,
            }
        };

        info!(generation, "stopping tunnel process");
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if tokio::time::timeout(self.settings.stop_grace, notified).await.is_err() {
            warn!(
                generation,
                grace = ?self.settings.stop_grace,
                "tunnel did not report exit within grace period"
            );
        }

        let mut state = self.lock();
        if state.phase.owned_generation() == Some(generation) {
            state.apply(ProxyEvent::StopRequested);
        }
        true
    }

    fn adopt(&self, port: u16) {
        let mut state = self.lock();
        if matches!(state.phase, ProxyPhase::NotRunning)
            && state.apply(ProxyEvent::Adopted { port })
        {
            info!(port, "adopted externally managed tunnel");
        }
    }

    fn mark_external_lost(&self, port: u16) {
        let mut state = self.lock();
        if state.phase.origin() == Some(TunnelOrigin::External) && state.apply(ProxyEvent::Lost) {
            warn!(port, "externally managed tunnel is gone");
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<TunnelState>) -> MutexGuard<'_, TunnelState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl std::fmt::Debug for ProxySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySupervisor")
            .field("settings", &self.settings)
            .field("phase", &self.lock().phase)
            .finish()
    }
}

/// Wait for a tunnel to report healthy, polling every `interval`
pub async fn wait_until_healthy(
    supervisor: &ProxySupervisor,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if supervisor.is_healthy().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockProbe;
    use crate::spawn::MockSpawner;
    use scribedb_core::{BinarySource, CredentialSource};
    use std::net::{Ipv4Addr, TcpListener};

    fn settings(port: u16) -> ProxySettings {
        ProxySettings {
            connection_name: Some("proj:us-central1:scribe".into()),
            default_port: port,
            scan_attempts: 5,
            settle_time: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            stop_grace: Duration::from_secs(2),
            download_connect_timeout: Duration::from_secs(1),
            download_timeout: Duration::from_secs(5),
            binary: BinarySource::Path(std::env::current_exe().unwrap()),
            credentials: CredentialSource::Ambient,
            ephemeral: false,
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn supervisor(
        settings: ProxySettings,
        probe: &Arc<MockProbe>,
        spawner: &Arc<MockSpawner>,
    ) -> ProxySupervisor {
        ProxySupervisor::with_spawner(
            settings,
            Arc::clone(probe) as Arc<dyn TunnelProbe>,
            Arc::clone(spawner) as Arc<dyn TunnelSpawner>,
        )
    }

    async fn wait_for_phase(sup: &ProxySupervisor, phase: &str) {
        for _ in 0..100 {
            if sup.snapshot().phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervisor never reached {}", phase);
    }

    #[tokio::test]
    async fn unbound_port_is_unhealthy_without_probing() {
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(free_port()), &probe, &spawner);

        assert!(!sup.is_healthy().await);
        assert_eq!(probe.calls(), 0);
        assert_eq!(sup.snapshot().phase, "not_running");
    }

    #[tokio::test]
    async fn healthy_external_tunnel_is_adopted_not_replaced() {
        let (_external, port) = occupied_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::ExternalProxyDetected);
        assert!(report.healthy);
        assert_eq!(report.port, Some(port));
        assert_eq!(spawner.spawn_count(), 0);
        assert_eq!(sup.snapshot().origin, Some(TunnelOrigin::External));
        assert_eq!(sup.active_port(), Some(port));

        // Stop never touches a tunnel we did not start
        assert!(!sup.stop().await);
        assert_eq!(sup.snapshot().phase, "running");
    }

    #[tokio::test]
    async fn unrelated_listener_is_a_port_conflict() {
        let (_squatter, port) = occupied_port();
        let probe = Arc::new(MockProbe::new(false));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::PortConflict);
        assert!(!report.healthy);
        assert_eq!(report.port, Some(port));
        assert!(report.message.contains("CLOUD_SQL_PROXY_PORT"));
        assert_eq!(spawner.spawn_count(), 0);
        assert_eq!(sup.snapshot().phase, "not_running");
    }

    #[tokio::test]
    async fn free_port_gets_a_fresh_tunnel() {
        let port = free_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::Started);
        assert!(report.healthy);
        assert_eq!(report.port, Some(port));

        let commands = spawner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].port, port);
        assert_eq!(commands[0].connection_name, "proj:us-central1:scribe");

        let snapshot = sup.snapshot();
        assert_eq!(snapshot.phase, "running");
        assert_eq!(snapshot.origin, Some(TunnelOrigin::Spawned));

        let again = sup.ensure_healthy().await;
        assert_eq!(again.status, StartStatus::AlreadyRunning);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_once() {
        let port = free_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = Arc::new(supervisor(settings(port), &probe, &spawner));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sup = Arc::clone(&sup);
                tokio::spawn(async move { sup.ensure_healthy().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().healthy);
        }
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn process_exit_returns_to_not_running() {
        let port = free_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        assert!(sup.ensure_healthy().await.healthy);
        spawner.exit_all(1);
        wait_for_phase(&sup, "not_running").await;
        assert_eq!(sup.active_port(), None);
        assert!(!sup.is_healthy().await);

        // Next request brings a new one up
        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::Started);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn unhealthy_owned_tunnel_is_restarted() {
        let port = free_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        assert!(sup.ensure_healthy().await.healthy);
        probe.set_healthy(false);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::Started);
        assert!(!report.healthy);
        assert_eq!(spawner.spawn_count(), 2);
        // The replacement reuses the freed port
        assert_eq!(report.port, Some(port));
    }

    #[tokio::test]
    async fn stop_kills_owned_tunnel_and_frees_port() {
        let port = free_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        assert!(sup.ensure_healthy().await.healthy);
        assert!(sup.stop().await);
        assert_eq!(sup.snapshot().phase, "not_running");
        assert!(!is_port_in_use(port).await);
        assert!(!sup.stop().await);
    }

    #[tokio::test]
    async fn missing_connection_name_is_an_error_without_spawning() {
        let mut settings = settings(free_port());
        settings.connection_name = None;
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings, &probe, &spawner);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::Error);
        assert!(report.message.contains("CLOUD_SQL_CONNECTION_NAME"));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_not_running() {
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::failing("exec format error"));
        let sup = supervisor(settings(free_port()), &probe, &spawner);

        let report = sup.ensure_healthy().await;
        assert_eq!(report.status, StartStatus::Error);
        assert!(report.message.contains("exec format error"));
        assert_eq!(sup.snapshot().phase, "not_running");
    }

    #[tokio::test]
    async fn external_tunnel_that_goes_away_is_forgotten() {
        let (external, port) = occupied_port();
        let probe = Arc::new(MockProbe::new(true));
        let spawner = Arc::new(MockSpawner::binding());
        let sup = supervisor(settings(port), &probe, &spawner);

        assert!(sup.is_healthy().await);
        assert_eq!(sup.snapshot().origin, Some(TunnelOrigin::External));

        drop(external);
        assert!(!sup.is_healthy().await);
        assert_eq!(sup.snapshot().phase, "not_running");
    }

    #[tokio::test]
    async fn report_serializes_with_snake_case_status() {
        let report = StartReport::new(StartStatus::ExternalProxyDetected, true, None, "ok");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "external_proxy_detected");
        assert_eq!(json["healthy"], true);
        assert!(json.get("port").is_none());
    }
}
