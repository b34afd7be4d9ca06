//! Container runtime access.
//!
//! The rest of the crate talks to the container engine only through the
//! [`ContainerRuntime`] trait. [`docker::DockerRuntime`] is the real
//! implementation backed by bollard; tests use `fake::FakeRuntime`.

pub mod docker;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use docker::DockerRuntime;

/// Raw multiplexed log output of a single container. Dropping the stream
/// aborts the underlying request to the engine.
pub type LogByteStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
}

/// Listing entry served by `GET /api/containers`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    pub created: i64,
    pub ports: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the engine knows a container with this id or name.
    async fn exists(&self, container_id: &str) -> Result<bool, RuntimeError>;

    /// Follows the container's stdout and stderr, starting with the
    /// configured tail of historical lines.
    async fn open_log_stream(&self, container_id: &str) -> Result<LogByteStream, RuntimeError>;

    async fn list_summaries(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn ping(&self) -> Result<(), RuntimeError>;
}
