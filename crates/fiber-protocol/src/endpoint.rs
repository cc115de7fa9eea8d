//! Named local endpoints over Unix domain sockets.
//!
//! An endpoint name (`Fiber`, `FiberControl`, `Handler3`, ...) maps to a
//! socket file inside one runtime directory shared by the whole process
//! graph:
//!
//! ```text
//! <runtime_dir>/
//! ├── Fiber                       front door
//! ├── FiberControl                handler handshakes
//! ├── Handler1                    handler process
//! ├── Handler1RequestManager      surrogate handshakes
//! ├── Handler1CoreSurrogate       core surrogate
//! └── Handler1GuiSurrogate        gui surrogate
//! ```
//!
//! [`Listener`] owns the server side: stale sockets are removed before
//! binding, the socket file is made world-writable, and the file is removed
//! again when the listener is dropped. [`Dialer`] owns the client side: one
//! message out, at most one framed message back, every wait bounded.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every filesystem and socket failure is returned as [`EndpointError`]

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::frame::{decode, encode, FrameDecoder, FrameError, FrameReader, Framing};

/// Permissions applied to every socket file; callers may run as other users.
#[cfg(unix)]
const SOCKET_MODE: u32 = 0o777;

/// Errors from binding, dialing or exchanging messages.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Failed to bind {path}: {error}")]
    Bind { path: PathBuf, error: io::Error },

    #[error("Failed to connect to {path}: {error}")]
    Connect { path: PathBuf, error: io::Error },

    #[error("Timed out {stage} {path}")]
    Timeout { path: PathBuf, stage: &'static str },

    #[error("{path} closed the connection without responding")]
    NoResponse { path: PathBuf },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Endpoint Directory
// ============================================================================

/// Maps endpoint names to socket paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDir {
    root: PathBuf,
}

impl EndpointDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Socket path of endpoint `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Server side of a named endpoint.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    name: String,
    path: PathBuf,
    /// `(dev, ino)` of the socket file we created.
    identity: Option<(u64, u64)>,
}

impl Listener {
    /// Binds endpoint `name` inside `dir`.
    ///
    /// A leftover socket file from a dead server is removed first. If the
    /// bind still reports the address in use, the file is removed once more
    /// and the bind retried a single time.
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::Bind` if the directory cannot be created, the
    /// socket cannot be bound, or its permissions cannot be set.
    pub fn bind(dir: &EndpointDir, name: &str) -> Result<Self, EndpointError> {
        let path = dir.path_for(name);
        let bind_err = |error: io::Error| EndpointError::Bind {
            path: path.clone(),
            error,
        };

        std::fs::create_dir_all(dir.root()).map_err(bind_err)?;
        remove_stale(&path).map_err(bind_err)?;

        let inner = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(endpoint = name, "Address in use, forcing removal and retrying");
                remove_stale(&path).map_err(bind_err)?;
                UnixListener::bind(&path).map_err(bind_err)?
            }
            Err(e) => return Err(bind_err(e)),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
                .map_err(bind_err)?;
        }

        info!(endpoint = name, socket = %path.display(), "Endpoint listening");

        Ok(Self {
            inner,
            name: name.to_string(),
            identity: file_identity(&path),
            path,
        })
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Only remove the file if nobody rebound the name since.
        if self.identity.is_some() && file_identity(&self.path) == self.identity {
            let _ = std::fs::remove_file(&self.path);
            debug!(endpoint = %self.name, "Endpoint socket removed");
        }
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn file_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path)
        .ok()
        .map(|meta| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_path: &Path) -> Option<(u64, u64)> {
    None
}

// ============================================================================
// Dialer
// ============================================================================

/// Client side of a named endpoint.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    write_timeout: Duration,
    /// `None` waits for the response as long as the peer lives.
    read_timeout: Option<Duration>,
}

impl Dialer {
    pub fn new(connect_timeout: Duration, read_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            write_timeout: connect_timeout,
            read_timeout,
        }
    }

    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Opens a connection to the socket at `path`.
    pub async fn connect(&self, path: &Path) -> Result<UnixStream, EndpointError> {
        bounded(Some(self.connect_timeout), path, "connecting to", async {
            UnixStream::connect(path)
                .await
                .map_err(|error| EndpointError::Connect {
                    path: path.to_path_buf(),
                    error,
                })
        })
        .await
    }

    /// Whether a listener currently accepts connections at `path`.
    pub async fn probe(&self, path: &Path) -> bool {
        self.connect(path).await.is_ok()
    }

    /// Writes already-framed bytes to `stream`.
    pub async fn write(
        &self,
        stream: &mut UnixStream,
        path: &Path,
        bytes: &[u8],
    ) -> Result<(), EndpointError> {
        bounded(Some(self.write_timeout), path, "writing to", async {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            Ok::<(), EndpointError>(())
        })
        .await
    }

    /// Sends one message and returns the raw bytes of the single response.
    ///
    /// With [`Framing::Close`] the write side is shut down after the
    /// message, so the peer sees end of stream. The response may be
    /// footer-terminated or close-terminated.
    pub async fn request_raw(
        &self,
        path: &Path,
        message: &[u8],
        framing: Framing,
    ) -> Result<BytesMut, EndpointError> {
        let mut stream = self.connect(path).await?;
        self.write(&mut stream, path, message).await?;
        if framing == Framing::Close {
            stream.shutdown().await?;
        }

        let mut reader = FrameReader::new(stream, FrameDecoder::strict());
        let frame = bounded(self.read_timeout, path, "waiting for response from", async {
            reader.next_frame().await.map_err(EndpointError::from)
        })
        .await?;

        frame.ok_or_else(|| EndpointError::NoResponse {
            path: path.to_path_buf(),
        })
    }

    /// Sends `payload` and parses the single JSON response.
    pub async fn request(
        &self,
        path: &Path,
        payload: &Value,
        framing: Framing,
    ) -> Result<Value, EndpointError> {
        let message = encode(payload, framing)?;
        let frame = self.request_raw(path, &message, framing).await?;
        Ok(decode(&frame)?)
    }
}

async fn bounded<T, F>(
    limit: Option<Duration>,
    path: &Path,
    stage: &'static str,
    fut: F,
) -> Result<T, EndpointError>
where
    F: Future<Output = Result<T, EndpointError>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| EndpointError::Timeout {
                path: path.to_path_buf(),
                stage,
            })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_raw, FIBER_FOOTER};
    use serde_json::json;

    fn dialer() -> Dialer {
        Dialer::new(Duration::from_millis(500), Some(Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn test_bind_sets_world_writable_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let listener = Listener::bind(&endpoints, "Fiber").unwrap();

        let mode = std::fs::metadata(listener.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        std::fs::write(endpoints.path_for("Handler1"), b"stale").unwrap();

        let listener = Listener::bind(&endpoints, "Handler1").unwrap();
        assert!(dialer().probe(listener.path()).await);
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let path = {
            let listener = Listener::bind(&endpoints, "FiberControl").unwrap();
            listener.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_keeps_socket_of_newer_listener() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let old = Listener::bind(&endpoints, "Handler1").unwrap();
        let new = Listener::bind(&endpoints, "Handler1").unwrap();
        drop(old);
        assert!(new.path().exists());
    }

    #[tokio::test]
    async fn test_request_round_trip_with_close_framing() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let listener = Listener::bind(&endpoints, "Fiber").unwrap();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            let mut reader = FrameReader::new(stream, FrameDecoder::strict());
            let request = reader.next_value().await.unwrap();
            let mut stream = reader.into_inner();
            let reply = encode(&json!({"echo": request}), Framing::Close).unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let response = dialer()
            .request(&endpoints.path_for("Fiber"), &json!({"n": 1}), Framing::Close)
            .await
            .unwrap();
        assert_eq!(response, json!({"echo": {"n": 1}}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_raw_strips_footer() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let listener = Listener::bind(&endpoints, "Handler1CoreSurrogate").unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            stream.write_all(&encode_raw(b"{\"ok\":true}", Framing::Footer)).await.unwrap();
            // keep the connection open; the footer alone must end the frame
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let frame = dialer()
            .request_raw(
                &endpoints.path_for("Handler1CoreSurrogate"),
                format!("{{}}{FIBER_FOOTER}").as_bytes(),
                Framing::Footer,
            )
            .await
            .unwrap();
        assert_eq!(&frame[..], b"{\"ok\":true}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_missing_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Nobody");
        assert!(matches!(
            dialer().connect(&path).await,
            Err(EndpointError::Connect { .. })
        ));
        assert!(!dialer().probe(&path).await);
    }

    #[tokio::test]
    async fn test_read_timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointDir::new(dir.path());
        let listener = Listener::bind(&endpoints, "Silent").unwrap();

        let server = tokio::spawn(async move {
            let _stream = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let short = Dialer::new(Duration::from_millis(200), Some(Duration::from_millis(100)));
        let result = short
            .request(&endpoints.path_for("Silent"), &json!({}), Framing::Footer)
            .await;
        assert!(matches!(result, Err(EndpointError::Timeout { .. })));
        server.abort();
    }
}
