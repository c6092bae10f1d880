//! Launching the tunnel subprocess
//!
//! The supervisor never touches a `Child` directly. A spawner hands back a
//! [`SpawnedTunnel`]: a one-shot receiver that fires when the process exits
//! and a one-shot sender that asks it to terminate.

use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use scribedb_core::TUNNEL_HOST;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, SubprocessStage};

/// Everything needed to build the tunnel command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub binary: PathBuf,
    pub connection_name: String,
    pub port: u16,
    pub credentials: Option<PathBuf>,
}

impl TunnelCommand {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.connection_name.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--address".to_string(),
            TUNNEL_HOST.to_string(),
        ];
        if let Some(path) = &self.credentials {
            args.push("--credentials-file".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

/// How a tunnel process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub detail: String,
}

impl ExitReport {
    fn unknown() -> Self {
        Self {
            code: None,
            detail: "exit watcher went away".to_string(),
        }
    }
}

/// Handle to a running tunnel
#[derive(Debug)]
pub struct SpawnedTunnel {
    pub pid: Option<u32>,
    pub exited: oneshot::Receiver<ExitReport>,
    /// Send (or drop) to terminate the process
    pub kill: oneshot::Sender<()>,
}

impl SpawnedTunnel {
    pub(crate) fn exit_or_unknown(
        result: Result<ExitReport, oneshot::error::RecvError>,
    ) -> ExitReport {
        result.unwrap_or_else(|_| ExitReport::unknown())
    }
}

#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    async fn spawn(&self, command: &TunnelCommand) -> Result<SpawnedTunnel, ProxyError>;
}

/// Spawns the real binary with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

#[async_trait]
impl TunnelSpawner for ProcessSpawner {
    async fn spawn(&self, command: &TunnelCommand) -> Result<SpawnedTunnel, ProxyError> {
        let args = command.args();
        debug!(binary = %command.binary.display(), ?args, "spawning tunnel");

        let mut child = Command::new(&command.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProxyError::subprocess(SubprocessStage::Spawn, e))?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill tunnel process");
                    }
                    child.wait().await
                }
            };
            let report = match status {
                Ok(status) => ExitReport {
                    code: status.code(),
                    detail: status.to_string(),
                },
                Err(e) => ExitReport {
                    code: None,
                    detail: format!("wait failed: {}", e),
                },
            };
            let _ = exit_tx.send(report);
        });

        Ok(SpawnedTunnel {
            pid,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

async fn forward_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "scribedb_proxy::tunnel", stream = name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(
                    target: "scribedb_proxy::tunnel",
                    stream = name,
                    error = %e,
                    "stopped reading tunnel output"
                );
                break;
            }
        }
    }
}

struct MockChild {
    command: TunnelCommand,
    exit: Option<oneshot::Sender<i32>>,
}

/// In-process stand-in for the tunnel binary.
///
/// Each "process" optionally holds a listener on the requested port so port
/// checks see it, and releases it on kill or on a scripted exit.
#[derive(Default)]
pub struct MockSpawner {
    bind_port: bool,
    fail_with: Option<String>,
    spawns: AtomicUsize,
    children: Mutex<Vec<MockChild>>,
}

impl MockSpawner {
    /// Mock whose processes bind their port like a real tunnel
    pub fn binding() -> Self {
        Self {
            bind_port: true,
            ..Self::default()
        }
    }

    /// Mock whose spawns always fail
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<TunnelCommand> {
        self.lock_children()
            .iter()
            .map(|child| child.command.clone())
            .collect()
    }

    /// Make every live mock process exit with `code`
    pub fn exit_all(&self, code: i32) {
        for child in self.lock_children().iter_mut() {
            if let Some(exit) = child.exit.take() {
                let _ = exit.send(code);
            }
        }
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<MockChild>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TunnelSpawner for MockSpawner {
    async fn spawn(&self, command: &TunnelCommand) -> Result<SpawnedTunnel, ProxyError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(ProxyError::subprocess(SubprocessStage::Spawn, reason));
        }

        let listener = if self.bind_port {
            Some(StdTcpListener::bind((Ipv4Addr::LOCALHOST, command.port))?)
        } else {
            None
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (script_tx, script_rx) = oneshot::channel::<i32>();

        tokio::spawn(async move {
            let report = tokio::select! {
                _ = kill_rx => ExitReport { code: None, detail: "killed".to_string() },
                code = script_rx => {
                    let code = code.unwrap_or(0);
                    ExitReport { code: Some(code), detail: format!("exit status: {}", code) }
                }
            };
            drop(listener);
            let _ = exit_tx.send(report);
        });

        self.lock_children().push(MockChild {
            command: command.clone(),
            exit: Some(script_tx),
        });

        Ok(SpawnedTunnel {
            pid: None,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn command(binary: &str, port: u16) -> TunnelCommand {
        TunnelCommand {
            binary: PathBuf::from(binary),
            connection_name: "proj:region:inst".into(),
            port,
            credentials: None,
        }
    }

    #[test]
    fn args_follow_the_tunnel_cli() {
        let mut cmd = command("cloud-sql-proxy", 5433);
        assert_eq!(
            cmd.args(),
            ["proj:region:inst", "--port", "5433", "--address", "127.0.0.1"]
        );

        cmd.credentials = Some(PathBuf::from("/tmp/sa.json"));
        let args = cmd.args();
        assert_eq!(&args[5..], ["--credentials-file", "/tmp/sa.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_exit_is_reported() {
        // `false` ignores its arguments and exits 1
        let spawned = ProcessSpawner.spawn(&command("false", 5432)).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.code, Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_is_killed_on_request() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-proxy");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spawned = ProcessSpawner
            .spawn(&command(script.to_str().unwrap(), 5432))
            .await
            .unwrap();
        assert!(spawned.pid.is_some());
        spawned.kill.send(()).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        // terminated by signal, so no exit code
        assert_eq!(report.code, None);
    }

    #[tokio::test]
    async fn missing_binary_fails_at_spawn() {
        let err = ProcessSpawner
            .spawn(&command("/nonexistent/cloud-sql-proxy", 5432))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Subprocess {
                stage: SubprocessStage::Spawn,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn mock_holds_the_port_until_killed() {
        let probe = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mock = MockSpawner::binding();
        let spawned = mock.spawn(&command("cloud-sql-proxy", port)).await.unwrap();
        assert!(crate::port::is_port_in_use(port).await);
        assert_eq!(mock.spawn_count(), 1);
        assert_eq!(mock.commands()[0].port, port);

        spawned.kill.send(()).unwrap();
        let report = spawned.exited.await.unwrap();
        assert_eq!(report.detail, "killed");
        assert!(!crate::port::is_port_in_use(port).await);
    }

    #[tokio::test]
    async fn mock_scripted_exit() {
        let mock = MockSpawner::default();
        let spawned = mock.spawn(&command("cloud-sql-proxy", 1)).await.unwrap();
        mock.exit_all(3);
        assert_eq!(spawned.exited.await.unwrap().code, Some(3));
    }
}
