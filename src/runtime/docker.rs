//! Docker client module using bollard.
//!
//! The engine's own stdout/stderr framing is decoded by bollard. The decoded
//! output is re-framed here with one 8-byte header per line, which is the
//! layout [`crate::demux`] expects. The engine splits long lines over several
//! frames; only the first piece of a line gets a header.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;

use super::{ContainerRuntime, ContainerSummary, LogByteStream, RuntimeError};
use crate::demux::{HEADER_LEN, StreamKind, frame_header};

const SHORT_ID_LEN: usize = 12;

pub struct DockerRuntime {
    docker: Docker,
    log_tail: String,
}

impl DockerRuntime {
    /// Connects using the default method for the platform
    /// (Unix socket on Linux/macOS, named pipe on Windows).
    pub fn connect(log_tail: impl Into<String>) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            log_tail: log_tail.into(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn exists(&self, container_id: &str) -> Result<bool, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match self
            .docker
            .inspect_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::DockerApi(e)),
        }
    }

    async fn open_log_stream(&self, container_id: &str) -> Result<LogByteStream, RuntimeError> {
        let options: LogsOptions = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .tail(&self.log_tail)
            .build();

        log::debug!("Opening log stream for container {container_id}");

        let mut reframer = Reframer::default();
        let stream = self
            .docker
            .logs(container_id, Some(options))
            .map(move |output| match output {
                Ok(output) => Ok(reframer.reframe(output)),
                Err(e) => Err(RuntimeError::DockerApi(e)),
            });

        Ok(stream.boxed())
    }

    async fn list_summaries(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();

        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers.into_iter().map(ContainerSummary::from).collect())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

/// Re-frames decoded engine output one line at a time.
#[derive(Debug, Default)]
struct Reframer {
    /// Stream of a line whose terminator has not arrived yet.
    open_line: Option<StreamKind>,
}

impl Reframer {
    /// TTY containers produce `Console` output without stream information; it
    /// is reported as stdout.
    fn reframe(&mut self, output: LogOutput) -> Bytes {
        let (kind, message) = match output {
            LogOutput::StdErr { message } => (StreamKind::Stderr, message),
            LogOutput::StdOut { message }
            | LogOutput::StdIn { message }
            | LogOutput::Console { message } => (StreamKind::Stdout, message),
        };

        let mut framed = BytesMut::with_capacity(message.len() + HEADER_LEN);
        for line in message.split_inclusive(|b| *b == b'\n') {
            match self.open_line {
                Some(open) if open == kind => {}
                Some(_) => {
                    // The other stream interrupted a line; end it before starting ours.
                    framed.put_u8(b'\n');
                    framed.put_slice(&frame_header(kind));
                }
                None => framed.put_slice(&frame_header(kind)),
            }
            framed.put_slice(line);
            self.open_line = if line.ends_with(b"\n") {
                None
            } else {
                Some(kind)
            };
        }
        framed.freeze()
    }
}

impl From<bollard::models::ContainerSummary> for ContainerSummary {
    fn from(summary: bollard::models::ContainerSummary) -> Self {
        let id: String = summary
            .id
            .unwrap_or_default()
            .chars()
            .take(SHORT_ID_LEN)
            .collect();

        let name = summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let ports = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|port| {
                port.public_port
                    .filter(|public| *public > 0)
                    .map(|public| {
                        format!(
                            "{}:{}->{}",
                            port.ip.unwrap_or_default(),
                            public,
                            port.private_port
                        )
                    })
            })
            .collect();

        Self {
            id,
            name,
            image: summary.image.unwrap_or_default(),
            status: summary.status.unwrap_or_default(),
            state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
            created: summary.created.unwrap_or_default(),
            ports,
        }
    }
}
