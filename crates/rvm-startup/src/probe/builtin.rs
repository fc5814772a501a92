//! Concrete readiness probes: file, TCP port, HTTP GET, process, closure

use super::ReadinessProbe;
use crate::error::ProbeError;
use std::ffi::OsStr;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::net::TcpStream;

/// Ready when a path exists
#[derive(Debug, Clone)]
pub struct FileExistsProbe {
    path: PathBuf,
}

impl FileExistsProbe {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for FileExistsProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Ready when a TCP connection can be opened
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    address: SocketAddr,
}

impl TcpPortProbe {
    /// # Errors
    /// `ProbeError::Invalid` if `address` is not `ip:port`.
    pub fn new(address: impl AsRef<str>) -> Result<Self, ProbeError> {
        let address = address
            .as_ref()
            .parse::<SocketAddr>()
            .map_err(|e| ProbeError::Invalid(format!("tcp address {}: {e}", address.as_ref())))?;
        Ok(Self { address })
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for TcpPortProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        match TcpStream::connect(self.address).await {
            Ok(_) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::TimedOut
                        | ErrorKind::AddrNotAvailable
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}

/// Ready when a GET returns the expected status (any 2xx by default)
#[derive(Debug, Clone)]
pub struct HttpGetProbe {
    url: String,
    expect_status: Option<u16>,
    client: reqwest::Client,
}

impl HttpGetProbe {
    /// # Errors
    /// `ProbeError::Http` if the client cannot be built.
    pub fn new(url: impl Into<String>, expect_status: Option<u16>) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            url: url.into(),
            expect_status,
            client,
        })
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for HttpGetProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                Ok(self
                    .expect_status
                    .map_or(status.is_success(), |expected| status.as_u16() == expected))
            }
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

/// Ready when a process whose name contains `name` is running
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    name: String,
}

impl ProcessProbe {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for ProcessProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut system = System::new_with_specifics(
                RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
            );
            system.refresh_processes(ProcessesToUpdate::All, true);
            let found = system.processes_by_name(OsStr::new(&name)).next().is_some();
            found
        })
        .await
        .map_err(|e| ProbeError::Task(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("process {}", self.name)
    }
}

/// Probe backed by a closure, for programmatic registration
#[derive(Clone)]
pub struct FnProbe {
    check: Arc<dyn Fn() -> bool + Send + Sync>,
    label: String,
}

impl FnProbe {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
            label: "fn".to_string(),
        }
    }

    #[must_use]
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").field("label", &self.label).finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for FnProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        Ok((self.check)())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpPortProbe::new(addr.to_string()).unwrap();
        assert!(probe.check().await.unwrap());

        drop(listener);
        assert!(!probe.check().await.unwrap());
    }

    #[test]
    fn tcp_probe_rejects_bad_address() {
        assert!(matches!(TcpPortProbe::new("localhost"), Err(ProbeError::Invalid(_))));
    }

    #[tokio::test]
    async fn file_probe_tracks_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flag");
        let probe = FileExistsProbe::new(&path);
        assert!(!probe.check().await.unwrap());
        std::fs::write(&path, b"1").unwrap();
        assert!(probe.check().await.unwrap());
    }

    #[tokio::test]
    async fn http_probe_connection_refused_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let probe = HttpGetProbe::new(format!("http://{addr}/health"), None).unwrap();
        assert!(!probe.check().await.unwrap());
    }

    #[tokio::test]
    async fn process_probe_does_not_find_nonsense() {
        let probe = ProcessProbe::new("definitely-not-a-running-process-4f2a");
        assert!(!probe.check().await.unwrap());
    }
}
