//! scribedb-proxy: local tunnel to the managed database
//!
//! Owns at most one tunnel subprocess per process. Detects tunnels started by
//! someone else, refuses to fight unrelated processes for the port, and can
//! fetch the binary and credentials itself on ephemeral compute.

pub mod error;
pub mod port;
pub mod probe;
pub mod provision;
pub mod spawn;
pub mod state;
pub mod supervisor;

pub use error::{ProbeError, ProxyError, SubprocessStage};
pub use port::{find_free_port, is_port_in_use};
pub use probe::{HandshakeProbe, MockProbe, SqlProbe, TunnelProbe};
pub use provision::{Provisioned, Provisioner};
pub use spawn::{
    ExitReport, MockSpawner, ProcessSpawner, SpawnedTunnel, TunnelCommand, TunnelSpawner,
};
pub use state::{ProxyEvent, ProxyPhase, ProxySnapshot, TunnelOrigin};
pub use supervisor::{wait_until_healthy, ProxySupervisor, StartReport, StartStatus};
