//! Tunnel lifecycle as an explicit state machine
//!
//! | from                        | event          | to                |
//! |-----------------------------|----------------|-------------------|
//! | NotRunning                  | StartRequested | Starting          |
//! | Starting                    | Spawned        | Running(spawned)  |
//! | Starting                    | StartFailed    | NotRunning        |
//! | NotRunning, Starting        | Adopted        | Running(external) |
//! | Running(spawned, same gen)  | Exited         | NotRunning        |
//! | Running(external)           | Lost           | NotRunning        |
//! | Running(spawned)            | StopRequested  | NotRunning        |
//!
//! Anything else is rejected. Exit notifications carry the generation of the
//! process they describe, so a late exit from a replaced tunnel is a no-op.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelOrigin {
    /// Started and owned by this process
    Spawned,
    /// Found already listening; never killed by us
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPhase {
    NotRunning,
    Starting {
        port: u16,
    },
    Running {
        port: u16,
        origin: TunnelOrigin,
        pid: Option<u32>,
        generation: u64,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    StartRequested { port: u16 },
    Spawned { pid: Option<u32>, generation: u64 },
    StartFailed,
    Adopted { port: u16 },
    Exited { generation: u64, code: Option<i32> },
    Lost,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {event:?} is not valid while {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: ProxyEvent,
}

impl ProxyPhase {
    pub fn apply(&self, event: ProxyEvent) -> Result<ProxyPhase, InvalidTransition> {
        use ProxyEvent as E;
        use ProxyPhase as P;

        let next = match (self, &event) {
            (P::NotRunning, E::StartRequested { port }) => P::Starting { port: *port },
            (P::Starting { port }, E::Spawned { pid, generation }) => P::Running {
                port: *port,
                origin: TunnelOrigin::Spawned,
                pid: *pid,
                generation: *generation,
                since: Utc::now(),
            },
            (P::Starting { .. }, E::StartFailed) => P::NotRunning,
            (P::NotRunning | P::Starting { .. }, E::Adopted { port }) => P::Running {
                port: *port,
                origin: TunnelOrigin::External,
                pid: None,
                generation: 0,
                since: Utc::now(),
            },
            (
                P::Running {
                    origin: TunnelOrigin::Spawned,
                    generation: current,
                    ..
                },
                E::Exited { generation, .. },
            ) if current == generation => P::NotRunning,
            (
                P::Running {
                    origin: TunnelOrigin::External,
                    ..
                },
                E::Lost,
            ) => P::NotRunning,
            (
                P::Running {
                    origin: TunnelOrigin::Spawned,
                    ..
                },
                E::StopRequested,
            ) => P::NotRunning,
            _ => {
                return Err(InvalidTransition {
                    from: self.name(),
                    event: event.clone(),
                })
            }
        };
        Ok(next)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Starting { .. } => "starting",
            Self::Running { .. } => "running",
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::NotRunning => None,
            Self::Starting { port } | Self::Running { port, .. } => Some(*port),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn origin(&self) -> Option<TunnelOrigin> {
        match self {
            Self::Running { origin, .. } => Some(*origin),
            _ => None,
        }
    }

    /// Generation of the tunnel we own, if one is running
    pub fn owned_generation(&self) -> Option<u64> {
        match self {
            Self::Running {
                origin: TunnelOrigin::Spawned,
                generation,
                ..
            } => Some(*generation),
            _ => None,
        }
    }
}

/// Serializable view of the phase for status endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySnapshot {
    pub phase: &'static str,
    pub port: Option<u16>,
    pub origin: Option<TunnelOrigin>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&ProxyPhase> for ProxySnapshot {
    fn from(phase: &ProxyPhase) -> Self {
        let (pid, started_at) = match phase {
            ProxyPhase::Running { pid, since, .. } => (*pid, Some(*since)),
            _ => (None, None),
        };
        Self {
            phase: phase.name(),
            port: phase.port(),
            origin: phase.origin(),
            pid,
            started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_spawned(generation: u64) -> ProxyPhase {
        ProxyPhase::NotRunning
            .apply(ProxyEvent::StartRequested { port: 5432 })
            .unwrap()
            .apply(ProxyEvent::Spawned {
                pid: Some(42),
                generation,
            })
            .unwrap()
    }

    #[test]
    fn start_then_spawn_runs_owned_tunnel() {
        let phase = running_spawned(1);
        assert_eq!(phase.port(), Some(5432));
        assert_eq!(phase.origin(), Some(TunnelOrigin::Spawned));
        assert_eq!(phase.owned_generation(), Some(1));
    }

    #[test]
    fn failed_start_returns_to_not_running() {
        let phase = ProxyPhase::NotRunning
            .apply(ProxyEvent::StartRequested { port: 5432 })
            .unwrap()
            .apply(ProxyEvent::StartFailed)
            .unwrap();
        assert_eq!(phase, ProxyPhase::NotRunning);
    }

    #[test]
    fn exit_of_current_generation_stops() {
        let phase = running_spawned(3)
            .apply(ProxyEvent::Exited {
                generation: 3,
                code: Some(1),
            })
            .unwrap();
        assert_eq!(phase, ProxyPhase::NotRunning);
    }

    #[test]
    fn stale_exit_is_rejected() {
        let err = running_spawned(3)
            .apply(ProxyEvent::Exited {
                generation: 2,
                code: None,
            })
            .unwrap_err();
        assert_eq!(err.from, "running");
    }

    #[test]
    fn adopted_tunnel_is_never_stopped_only_lost() {
        let phase = ProxyPhase::NotRunning
            .apply(ProxyEvent::Adopted { port: 5432 })
            .unwrap();
        assert_eq!(phase.origin(), Some(TunnelOrigin::External));
        assert_eq!(phase.owned_generation(), None);

        assert!(phase.apply(ProxyEvent::StopRequested).is_err());
        assert!(phase
            .apply(ProxyEvent::Exited {
                generation: 0,
                code: None
            })
            .is_err());
        assert_eq!(
            phase.apply(ProxyEvent::Lost).unwrap(),
            ProxyPhase::NotRunning
        );
    }

    #[test]
    fn spawn_without_start_is_rejected() {
        assert!(ProxyPhase::NotRunning
            .apply(ProxyEvent::Spawned {
                pid: None,
                generation: 1
            })
            .is_err());
        assert!(running_spawned(1)
            .apply(ProxyEvent::StartRequested { port: 5433 })
            .is_err());
    }

    #[test]
    fn snapshot_reflects_phase() {
        let snapshot = ProxySnapshot::from(&running_spawned(1));
        assert_eq!(snapshot.phase, "running");
        assert_eq!(snapshot.pid, Some(42));
        assert!(snapshot.started_at.is_some());

        let json = serde_json::to_value(ProxySnapshot::from(&ProxyPhase::NotRunning)).unwrap();
        assert_eq!(json["phase"], "not_running");
        assert!(json["port"].is_null());
    }
}
