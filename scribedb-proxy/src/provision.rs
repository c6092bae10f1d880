//! Locating the tunnel binary and its credentials on disk
//!
//! On ephemeral compute neither is guaranteed to exist ahead of time, so the
//! binary can be fetched and an inline credential blob materialized. Both land
//! in one process-scoped temp directory and are produced at most once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use scribedb_core::{BinarySource, CredentialSource, ProxySettings};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{ProxyError, SubprocessStage};

const BINARY_FILE: &str = "cloud-sql-proxy";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Paths handed to the tunnel command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub binary: PathBuf,
    pub credentials: Option<PathBuf>,
}

enum Workdir {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl Workdir {
    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Fixed(path) => path,
        }
    }
}

pub struct Provisioner {
    binary: BinarySource,
    credentials: CredentialSource,
    fixed_dir: Option<PathBuf>,
    workdir: OnceCell<Workdir>,
    binary_path: OnceCell<PathBuf>,
    credentials_path: OnceCell<Option<PathBuf>>,
    connect_timeout: Duration,
    download_timeout: Duration,
}

impl Provisioner {
    pub fn new(settings: &ProxySettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            credentials: settings.credentials.clone(),
            fixed_dir: None,
            workdir: OnceCell::new(),
            binary_path: OnceCell::new(),
            credentials_path: OnceCell::new(),
            connect_timeout: settings.download_connect_timeout,
            download_timeout: settings.download_timeout,
        }
    }

    /// Write downloaded and materialized files under `dir` instead of a temp dir
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixed_dir = Some(dir.into());
        self
    }

    pub async fn provision(&self) -> Result<Provisioned, ProxyError> {
        let binary = self.binary_path().await?;
        let credentials = self.credentials_path().await?;
        Ok(Provisioned {
            binary,
            credentials,
        })
    }

    async fn workdir(&self) -> Result<&Path, ProxyError> {
        let dir = self
            .workdir
            .get_or_try_init(|| async {
                match &self.fixed_dir {
                    Some(path) => {
                        tokio::fs::create_dir_all(path).await?;
                        Ok::<_, ProxyError>(Workdir::Fixed(path.clone()))
                    }
                    None => {
                        let dir = tempfile::Builder::new().prefix("scribedb-proxy-").tempdir()?;
                        debug!(path = %dir.path().display(), "created tunnel work directory");
                        Ok(Workdir::Temp(dir))
                    }
                }
            })
            .await?;
        Ok(dir.path())
    }

    async fn binary_path(&self) -> Result<PathBuf, ProxyError> {
        self.binary_path
            .get_or_try_init(|| async {
                match &self.binary {
                    BinarySource::Path(path) => locate_binary(path),
                    BinarySource::Download { url } => self.download(url).await,
                }
            })
            .await
            .cloned()
    }

    async fn credentials_path(&self) -> Result<Option<PathBuf>, ProxyError> {
        self.credentials_path
            .get_or_try_init(|| async {
                match &self.credentials {
                    CredentialSource::Ambient => Ok(None),
                    CredentialSource::File(path) => {
                        if tokio::fs::try_exists(path).await.unwrap_or(false) {
                            Ok(Some(path.clone()))
                        } else {
                            Err(ProxyError::subprocess(
                                SubprocessStage::Credentials,
                                format!("credentials file {} does not exist", path.display()),
                            ))
                        }
                    }
                    CredentialSource::InlineJson(json) => self.materialize(json).await.map(Some),
                }
            })
            .await
            .cloned()
    }

    async fn download(&self, url: &str) -> Result<PathBuf, ProxyError> {
        let dir = self.workdir().await?;
        let target = dir.join(BINARY_FILE);
        info!(url, target = %target.display(), "downloading tunnel binary");

        // The download runs under the supervisor's start lock, so a stalled
        // server must not hold it past the timeout.
        let timeout = self.download_timeout;
        let fetch = |e: reqwest::Error| {
            if e.is_timeout() {
                ProxyError::subprocess(
                    SubprocessStage::Download,
                    format!("no complete response within {}s: {}", timeout.as_secs_f32(), e),
                )
            } else {
                ProxyError::subprocess(SubprocessStage::Download, e)
            }
        };
        let http = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(fetch)?;
        let bytes = http
            .get(url)
            .send()
            .await
            .map_err(fetch)?
            .error_for_status()
            .map_err(fetch)?
            .bytes()
            .await
            .map_err(fetch)?;
        if bytes.is_empty() {
            return Err(ProxyError::subprocess(
                SubprocessStage::Download,
                "server returned an empty body",
            ));
        }

        let partial = dir.join(format!("{}.partial", BINARY_FILE));
        write_file(&partial, &bytes, 0o755).await?;
        tokio::fs::rename(&partial, &target).await?;

        info!(bytes = bytes.len(), "tunnel binary ready");
        Ok(target)
    }

    async fn materialize(&self, json: &str) -> Result<PathBuf, ProxyError> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            ProxyError::subprocess(
                SubprocessStage::Credentials,
                format!("GOOGLE_CREDENTIALS_JSON is not valid JSON: {}", e),
            )
        })?;
        if !value.is_object() {
            return Err(ProxyError::subprocess(
                SubprocessStage::Credentials,
                "GOOGLE_CREDENTIALS_JSON must be a JSON object",
            ));
        }

        let target = self.workdir().await?.join(CREDENTIALS_FILE);
        write_file(&target, json.as_bytes(), 0o600).await?;
        debug!(path = %target.display(), "materialized tunnel credentials");
        Ok(target)
    }
}

fn locate_binary(path: &Path) -> Result<PathBuf, ProxyError> {
    let is_bare_name = path.components().count() == 1 && !path.is_absolute();
    if is_bare_name {
        return which::which(path).map_err(|e| {
            ProxyError::subprocess(
                SubprocessStage::Binary,
                format!("{} not found on PATH ({}); set CLOUD_SQL_PROXY_BIN", path.display(), e),
            )
        });
    }
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(ProxyError::subprocess(
            SubprocessStage::Binary,
            format!("{} does not exist", path.display()),
        ))
    }
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), ProxyError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;

    // `mode` only applies on creation; enforce it when the file already existed
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn settings(binary: BinarySource, credentials: CredentialSource) -> ProxySettings {
        ProxySettings {
            connection_name: Some("proj:region:inst".into()),
            default_port: 5432,
            scan_attempts: 10,
            settle_time: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
            stop_grace: Duration::from_millis(100),
            download_connect_timeout: Duration::from_millis(500),
            download_timeout: Duration::from_millis(500),
            binary,
            credentials,
            ephemeral: true,
        }
    }

    /// Minimal HTTP/1.1 server answering every request with `body`
    async fn serve_bytes(body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(body).await.unwrap();
            }
        });
        (format!("http://127.0.0.1:{}/cloud-sql-proxy", port), hits)
    }

    #[tokio::test]
    async fn ambient_credentials_pass_no_file() {
        let exe = std::env::current_exe().unwrap();
        let provisioner = Provisioner::new(&settings(
            BinarySource::Path(exe.clone()),
            CredentialSource::Ambient,
        ));
        let provisioned = provisioner.provision().await.unwrap();
        assert_eq!(provisioned.binary, exe);
        assert_eq!(provisioned.credentials, None);
    }

    #[tokio::test]
    async fn missing_binary_path_fails_at_binary_stage() {
        let provisioner = Provisioner::new(&settings(
            BinarySource::Path(PathBuf::from("/nonexistent/dir/cloud-sql-proxy")),
            CredentialSource::Ambient,
        ));
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Subprocess {
                stage: SubprocessStage::Binary,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_credentials_file_is_reported() {
        let exe = std::env::current_exe().unwrap();
        let provisioner = Provisioner::new(&settings(
            BinarySource::Path(exe),
            CredentialSource::File(PathBuf::from("/nonexistent/sa.json")),
        ));
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Subprocess {
                stage: SubprocessStage::Credentials,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn inline_json_is_written_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let exe = std::env::current_exe().unwrap();
        let json = r#"{"type":"service_account","project_id":"proj"}"#;
        let provisioner = Provisioner::new(&settings(
            BinarySource::Path(exe),
            CredentialSource::InlineJson(json.into()),
        ))
        .with_workdir(dir.path());

        let path = provisioner.provision().await.unwrap().credentials.unwrap();
        assert_eq!(path, dir.path().join(CREDENTIALS_FILE));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), json);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn inline_json_must_parse() {
        let exe = std::env::current_exe().unwrap();
        let provisioner = Provisioner::new(&settings(
            BinarySource::Path(exe),
            CredentialSource::InlineJson("not json".into()),
        ));
        let err = provisioner.provision().await.unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn downloaded_binary_is_executable_and_fetched_once() {
        let (url, hits) = serve_bytes(b"#!/bin/sh\nexit 0\n").await;
        let provisioner = Provisioner::new(&settings(
            BinarySource::Download { url },
            CredentialSource::Ambient,
        ));

        let first = provisioner.provision().await.unwrap();
        let second = provisioner.provision().await.unwrap();
        assert_eq!(first.binary, second.binary);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(first.binary.ends_with(BINARY_FILE));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&first.binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn download_failure_is_a_download_error() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let provisioner = Provisioner::new(&settings(
            BinarySource::Download {
                url: format!("http://127.0.0.1:{}/missing", port),
            },
            CredentialSource::Ambient,
        ));
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Subprocess {
                stage: SubprocessStage::Download,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stalled_download_times_out_at_download_stage() {
        // Accept connections and never write a byte back
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provisioner = Provisioner::new(&settings(
            BinarySource::Download {
                url: format!("http://127.0.0.1:{}/cloud-sql-proxy", port),
            },
            CredentialSource::Ambient,
        ));

        let started = Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(10), provisioner.provision())
            .await
            .expect("download should give up on its own")
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            ProxyError::Subprocess { stage, reason } => {
                assert_eq!(stage, SubprocessStage::Download);
                assert!(reason.contains("no complete response"), "{reason}");
            }
            other => panic!("expected a download error, got {other:?}"),
        }
    }
}
