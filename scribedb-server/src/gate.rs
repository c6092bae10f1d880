//! Single place that knows which connectivity path is active
//!
//! Route handlers only ask "is the database reachable?" and then query. The
//! gate decides whether that means a direct TLS health check or bringing up
//! the local tunnel.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use scribedb_core::{
    ConfigError, ConnectSettings, ConnectionStrategy, EnvSource, Settings, DEFAULT_POOL,
};
use scribedb_pool::{ConnectionResolver, DbError, EnvResolver, PoolManager, QueryResult};
use scribedb_proxy::{HandshakeProbe, ProxySupervisor, SqlProbe, StartReport, TunnelProbe};

/// Points pool settings at whatever port the tunnel is actually on
pub struct TunnelResolver {
    inner: Arc<dyn ConnectionResolver>,
    supervisor: Arc<ProxySupervisor>,
}

impl TunnelResolver {
    pub fn new(inner: Arc<dyn ConnectionResolver>, supervisor: Arc<ProxySupervisor>) -> Self {
        Self { inner, supervisor }
    }
}

impl ConnectionResolver for TunnelResolver {
    fn resolve(&self, name: &str) -> Result<ConnectSettings, ConfigError> {
        let settings = self.inner.resolve(name)?;
        Ok(match self.supervisor.active_port() {
            Some(port) => settings.with_port(port),
            None => settings,
        })
    }
}

enum Route {
    Direct,
    Tunnel(Arc<ProxySupervisor>),
}

pub struct DatabaseGate {
    pools: Arc<PoolManager>,
    route: Route,
}

impl DatabaseGate {
    /// Unrestricted network: pools connect straight to the instance
    pub fn direct(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            route: Route::Direct,
        }
    }

    /// Restricted network: pools go through a supervised local tunnel
    pub fn tunnel(pools: Arc<PoolManager>, supervisor: Arc<ProxySupervisor>) -> Self {
        Self {
            pools,
            route: Route::Tunnel(supervisor),
        }
    }

    /// Wire up pools and, in tunnel mode, the supervisor from loaded settings
    pub fn from_settings(
        settings: &Settings,
        env: Arc<dyn EnvSource>,
    ) -> Result<Self, ConfigError> {
        let base: Arc<dyn ConnectionResolver> =
            Arc::new(EnvResolver::with_env(settings, Arc::clone(&env)));

        match settings.strategy {
            ConnectionStrategy::DirectSsl => {
                info!(strategy = %settings.strategy, "database gate using direct TLS connections");
                Ok(Self::direct(Arc::new(PoolManager::from_arc(base))))
            }
            ConnectionStrategy::ProxyTunnel => {
                let proxy = settings.proxy_settings(env.as_ref())?;
                let probe: Arc<dyn TunnelProbe> =
                    match settings.connect_settings(env.as_ref(), DEFAULT_POOL) {
                        Ok(db) => Arc::new(SqlProbe::new(&db, proxy.probe_timeout)),
                        Err(e) => {
                            debug!(
                                missing = ?e.variables(),
                                "no database credentials, tunnel probe will only handshake"
                            );
                            Arc::new(HandshakeProbe::new(proxy.probe_timeout))
                        }
                    };
                info!(
                    strategy = %settings.strategy,
                    port = proxy.default_port,
                    ephemeral = proxy.ephemeral,
                    "database gate using local tunnel"
                );
                let supervisor = Arc::new(ProxySupervisor::new(proxy, probe));
                let resolver = TunnelResolver::new(base, Arc::clone(&supervisor));
                Ok(Self::tunnel(Arc::new(PoolManager::new(resolver)), supervisor))
            }
        }
    }

    pub fn strategy(&self) -> ConnectionStrategy {
        match self.route {
            Route::Direct => ConnectionStrategy::DirectSsl,
            Route::Tunnel(_) => ConnectionStrategy::ProxyTunnel,
        }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// The tunnel supervisor; `None` in direct mode
    pub fn supervisor(&self) -> Option<&Arc<ProxySupervisor>> {
        match &self.route {
            Route::Direct => None,
            Route::Tunnel(supervisor) => Some(supervisor),
        }
    }

    /// Call before any query. `false` means answer "unavailable" instead of
    /// querying.
    pub async fn ensure_database_reachable(&self) -> bool {
        match self.ensure_tunnel().await {
            None => self.pools.is_healthy(DEFAULT_POOL).await,
            Some(report) => report.healthy,
        }
    }

    /// Bring up the tunnel if needed. `None` in direct mode.
    pub async fn ensure_tunnel(&self) -> Option<StartReport> {
        let Route::Tunnel(supervisor) = &self.route else {
            return None;
        };
        let report = supervisor.ensure_healthy().await;
        self.after_tunnel_check(&report).await;
        Some(report)
    }

    /// Run a statement on the default pool
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.pools.query(sql, params).await
    }

    pub async fn query_on(
        &self,
        name: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError> {
        self.pools.query_on(name, sql, params).await
    }

    /// Close every pool, then stop a tunnel this process started
    pub async fn shutdown(&self) {
        self.pools.shutdown_all().await;
        if let Route::Tunnel(supervisor) = &self.route {
            if supervisor.stop().await {
                info!("database tunnel stopped");
            }
        }
    }

    async fn after_tunnel_check(&self, report: &StartReport) {
        if !report.healthy {
            warn!(
                status = ?report.status,
                port = ?report.port,
                "database tunnel unavailable: {}",
                report.message
            );
            return;
        }
        let Some(port) = report.port else {
            error!(status = ?report.status, "healthy tunnel report without a port");
            return;
        };
        self.retire_pools_not_on(port).await;
    }

    /// Pools built against an older tunnel port would never reconnect
    async fn retire_pools_not_on(&self, port: u16) {
        for name in self.pools.cached_names() {
            let Some(pool) = self.pools.cached(&name) else {
                continue;
            };
            let pool_port = pool.settings().port;
            if pool_port != port {
                info!(
                    pool = %name,
                    old_port = pool_port,
                    new_port = port,
                    "tunnel moved, rebuilding pool"
                );
                self.pools.close(&name).await;
            }
        }
    }
}
