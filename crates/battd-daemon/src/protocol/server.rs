//! Unix-socket listener for the control plane.
//!
//! # Security Considerations
//!
//! - The socket is world-connectable (mode 0666); who may do what is decided
//!   by the authorization gate from the peer's code identity, not by file
//!   permissions
//! - The socket directory is created 0755 and must not be a symlink
//! - A stale socket is removed before binding, but any other file at the
//!   socket path is left alone and binding fails
//! - The peer credential comes from the kernel, never from the peer. The
//!   accept loop only takes `SO_PEERCRED`; the `/proc` lookup that completes
//!   it runs in the connection task ([`Connection::capture_auth`])
//!
//! # Invariants
//!
//! - [INV-SRV-001] Socket permissions are set after bind
//! - [INV-SRV-002] Every accepted connection holds a permit until it closes

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, io};

use battd_core::ConnectionAuth;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::credentials::{CredentialProvider, PeerSource, ProcfsCredentials};
use super::error::{ProtocolError, ProtocolResult};
use super::framing::FrameCodec;
use crate::platform::ProcFs;

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/battd/battd.sock";

/// Default limit on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Socket file mode.
const SOCKET_MODE: u32 = 0o666;

/// Mode of a socket directory created by the server.
const DIRECTORY_MODE: u32 = 0o755;

/// Default socket path.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket path.
    pub socket_path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Source of peer credentials.
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            credentials: Arc::new(ProcfsCredentials::new(ProcFs::system())),
        }
    }
}

impl ServerConfig {
    /// Config for `socket_path` with defaults otherwise.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Set the connection limit.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Read peer audit tokens from `procfs`.
    #[must_use]
    pub fn with_procfs(self, procfs: ProcFs) -> Self {
        self.with_credentials(Arc::new(ProcfsCredentials::new(procfs)))
    }

    /// Set the credential provider.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Permit held for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPermit {
    const fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

/// An accepted (or client-side) connection.
pub struct Connection {
    stream: UnixStream,
    peer: Option<PeerSource>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .field("has_peer_source", &self.peer.is_some())
            .finish()
    }
}

impl Connection {
    /// Wrap a client-side stream.
    #[must_use]
    pub const fn new(stream: UnixStream) -> Self {
        Self { stream, peer: None }
    }

    fn accepted(stream: UnixStream, peer: PeerSource) -> Self {
        Self {
            stream,
            peer: Some(peer),
        }
    }

    /// Completes the peer credential on the blocking pool.
    ///
    /// Returns `None` on the client side, or if the credential was already
    /// taken. A peer whose credential cannot be read still gets a record; it
    /// carries the failure and every evaluation denies.
    pub async fn capture_auth(&mut self) -> ProtocolResult<Option<Arc<ConnectionAuth>>> {
        let Some(peer) = self.peer.take() else {
            return Ok(None);
        };

        let auth = task::spawn_blocking(move || ConnectionAuth::capture(&*peer))
            .await
            .map_err(|e| ProtocolError::Io(io::Error::other(format!("credential capture failed: {e}"))))?;

        match auth.credential() {
            Ok(credential) => debug!(peer = %credential, "Captured peer credential"),
            Err(e) => warn!(error = %e, "Connection without usable credential"),
        }
        Ok(Some(Arc::new(auth)))
    }

    /// Frames the whole stream with `codec`.
    #[must_use]
    pub fn into_framed(self, codec: FrameCodec) -> Framed<UnixStream, FrameCodec> {
        Framed::new(self.stream, codec)
    }

    /// Splits into a handshake-limited reader and a writer.
    #[must_use]
    pub fn into_split(
        self,
    ) -> (
        FramedRead<OwnedReadHalf, FrameCodec>,
        FramedWrite<OwnedWriteHalf, FrameCodec>,
    ) {
        let (read, write) = self.stream.into_split();
        (
            FramedRead::new(read, FrameCodec::handshake()),
            FramedWrite::new(write, FrameCodec::full()),
        )
    }
}

/// Control-socket listener.
#[derive(Debug)]
pub struct ProtocolServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_sem: Arc<Semaphore>,
}

impl ProtocolServer {
    /// Creates the socket directory if needed, removes a stale socket, binds
    /// and sets permissions.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(config: ServerConfig) -> ProtocolResult<Self> {
        if let Some(parent) = config.socket_path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to bind {}: {e}", config.socket_path.display()),
            ))
        })?;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!(
                        "failed to set socket permissions on {}: {e}",
                        config.socket_path.display()
                    ),
                ))
            })?;

        info!(
            socket = %config.socket_path.display(),
            max_connections = config.max_connections,
            "Control socket bound"
        );

        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
        })
    }

    /// Waits for a connection slot and accepts the next peer.
    ///
    /// Only `SO_PEERCRED` is read here. The connection task completes the
    /// credential with [`Connection::capture_auth`].
    pub async fn accept(&self) -> ProtocolResult<(Connection, ConnectionPermit)> {
        let permit = Arc::clone(&self.connection_sem)
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Io(io::Error::other("connection semaphore closed")))?;

        let (stream, _addr) = self.listener.accept().await?;
        let peer = self.config.credentials.source(&stream);
        debug!("Accepted connection");

        Ok((Connection::accepted(stream, peer), ConnectionPermit::new(permit)))
    }

    /// Socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Connection slots currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.connection_sem.available_permits()
    }

    /// Removes the socket file.
    pub fn cleanup(&self) -> ProtocolResult<()> {
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => {
                info!(socket = %self.config.socket_path.display(), "Removed socket file");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "Failed to remove socket file");
        }
    }
}

/// Connects to the daemon; replies may use the full frame size.
pub async fn connect(path: impl AsRef<Path>) -> ProtocolResult<Framed<UnixStream, FrameCodec>> {
    let stream = UnixStream::connect(path.as_ref()).await?;
    Ok(Connection::new(stream).into_framed(FrameCodec::full()))
}

/// Ensures `path` is a directory, creating it with [`DIRECTORY_MODE`].
///
/// Existing directories keep their permissions. Symlinks are refused.
fn ensure_directory(path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a symlink, refusing to use as socket directory", path.display()),
                )));
            }
            if !metadata.is_dir() {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                )));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}

/// Removes a stale socket file at `path`; refuses to remove anything else.
fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_socket() {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        )));
    }

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use battd_core::credentials::{ConnectionCredential, PeerCredentialSource};
    use battd_core::error::AuthResult;
    use battd_core::testing::credential;
    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_bind_sets_permissions_and_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run/battd.sock");

        let server = ProtocolServer::bind(ServerConfig::new(&path)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, DIRECTORY_MODE);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("battd.sock");
        let first = ProtocolServer::bind(ServerConfig::new(&path)).unwrap();
        std::mem::forget(first);

        assert!(ProtocolServer::bind(ServerConfig::new(&path)).is_ok());
    }

    #[tokio::test]
    async fn test_refuses_to_replace_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("battd.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        assert!(ProtocolServer::bind(ServerConfig::new(&path)).is_err());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_refuses_symlinked_directory() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(ProtocolServer::bind(ServerConfig::new(link.join("battd.sock"))).is_err());
    }

    #[tokio::test]
    async fn test_accepted_connection_captures_credential_and_permit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("battd.sock");
        let server = ProtocolServer::bind(ServerConfig::new(&path).with_max_connections(2)).unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        let (mut conn, permit) = server.accept().await.unwrap();

        let auth = conn.capture_auth().await.unwrap().unwrap();
        assert_eq!(auth.credential().unwrap().pid(), std::process::id());
        assert!(conn.capture_auth().await.unwrap().is_none());
        assert_eq!(server.available_permits(), 1);
        drop(permit);
        assert_eq!(server.available_permits(), 2);
    }

    /// Credential source that blocks until released.
    #[derive(Debug, Default)]
    struct Held {
        released: Mutex<bool>,
        cv: Condvar,
    }

    impl Held {
        fn release(&self) {
            *self.released.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    struct HeldSource(Arc<Held>);

    impl PeerCredentialSource for HeldSource {
        fn peer_credential(&self) -> AuthResult<ConnectionCredential> {
            let mut released = self.0.released.lock().unwrap();
            while !*released {
                released = self.0.cv.wait(released).unwrap();
            }
            Ok(credential(4242))
        }
    }

    #[derive(Debug)]
    struct HeldCredentials(Arc<Held>);

    impl CredentialProvider for HeldCredentials {
        fn source(&self, _stream: &UnixStream) -> PeerSource {
            Box::new(HeldSource(Arc::clone(&self.0)))
        }
    }

    #[tokio::test]
    async fn test_stalled_credential_read_does_not_block_accept() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("battd.sock");
        let held = Arc::new(Held::default());
        let server = ProtocolServer::bind(
            ServerConfig::new(&path).with_credentials(Arc::new(HeldCredentials(Arc::clone(&held)))),
        )
        .unwrap();

        let _first_client = UnixStream::connect(&path).await.unwrap();
        let (mut first, _first_permit) = timeout(IO_TIMEOUT, server.accept()).await.unwrap().unwrap();
        let capture = tokio::spawn(async move { first.capture_auth().await });

        let _second_client = UnixStream::connect(&path).await.unwrap();
        let second = timeout(IO_TIMEOUT, server.accept()).await;
        let still_capturing = !capture.is_finished();
        held.release();

        assert!(second.is_ok(), "second accept waited for the first credential read");
        assert!(still_capturing);
        let auth = timeout(IO_TIMEOUT, capture)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(auth.credential().unwrap().pid(), 4242);
    }
}
