//! Unix domain socket transport for host-local agents.

use std::path::{Path, PathBuf};

use tokio::net::UnixStream;

use crate::{Framing, Transport, TransportError};

/// Connect to a listening agent or host.
pub async fn connect_unix(
    path: impl AsRef<Path>,
    framing: Framing,
) -> Result<Transport, TransportError> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", path.display(), e)))?;
    Ok(Transport::from_stream(stream, framing))
}

/// Accept-side helper: listen on a Unix socket and yield transports.
#[derive(Debug)]
pub struct UnixListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
    framing: Framing,
}

impl UnixListener {
    /// Bind to a path. Removes a stale socket file if present.
    pub fn bind(path: impl AsRef<Path>, framing: Framing) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let inner = tokio::net::UnixListener::bind(path)
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), ?framing, "Listening on unix socket");
        Ok(Self {
            inner,
            path: path.to_path_buf(),
            framing,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Transport, TransportError> {
        let (stream, _addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Transport::from_stream(stream, self.framing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unix_transport_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("agent.sock");

        let listener = UnixListener::bind(&sock_path, Framing::Lines).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let unit = conn.recv().await.unwrap().unwrap();
            assert_eq!(unit, b"{\"id\":1}");
            conn.send(b"{\"id\":1,\"result\":{}}").await.unwrap();
        });

        let mut client = connect_unix(&sock_path, Framing::Lines).await.unwrap();
        client.send(b"{\"id\":1}").await.unwrap();
        assert_eq!(
            client.recv().await.unwrap().unwrap(),
            b"{\"id\":1,\"result\":{}}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_unix(dir.path().join("missing.sock"), Framing::Binary)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
