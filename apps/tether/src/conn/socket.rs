use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::debug;

use super::{ConnError, Connector};
use crate::transport::{StreamConfig, StreamTransport, Transport};

/// Reaches a daemon listening on a local unix socket.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    path: PathBuf,
    stream: StreamConfig,
}

impl SocketConnector {
    pub fn new(path: PathBuf, stream: StreamConfig) -> Self {
        Self { path, stream }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn open(&self, name: &str) -> Result<Arc<dyn Transport>, ConnError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|err| ConnError::Open {
                name: name.to_string(),
                message: format!("connect {}: {err}", self.path.display()),
            })?;
        debug!(target: "tether::conn", conn = name, path = %self.path.display(), "socket connected");
        let label = format!("unix:{}", self.path.display());
        Ok(Arc::new(StreamTransport::from_unix(
            stream,
            self.stream.clone(),
            label,
        )))
    }
}
