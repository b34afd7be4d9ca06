//! In-memory runtime for tests. Every opened log stream is backed by a channel
//! the test can feed, and the number of streams still alive is tracked so
//! tests can assert that cancellation really released them.

use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    Stream, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};

use super::{ContainerRuntime, ContainerSummary, LogByteStream, RuntimeError};

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashSet<String>>,
    history: Mutex<HashMap<String, Vec<Bytes>>>,
    feeds: Mutex<HashMap<String, Vec<UnboundedSender<Result<Bytes, RuntimeError>>>>>,
    failing_opens: Mutex<HashSet<String>>,
    live: Arc<AtomicUsize>,
    opened: AtomicUsize,
    offline: AtomicBool,
}

impl FakeRuntime {
    pub fn with_containers<I, S>(ids: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runtime = Self::default();
        runtime
            .containers
            .lock()
            .unwrap()
            .extend(ids.into_iter().map(Into::into));
        Arc::new(runtime)
    }

    /// Bytes delivered to every stream opened for `container_id` from now on.
    pub fn set_history(&self, container_id: &str, chunks: Vec<Bytes>) {
        self.history
            .lock()
            .unwrap()
            .insert(container_id.to_string(), chunks);
    }

    /// Sends a chunk to every open stream of `container_id`.
    pub fn push(&self, container_id: &str, chunk: Bytes) {
        if let Some(feeds) = self.feeds.lock().unwrap().get(container_id) {
            for feed in feeds {
                let _ = feed.unbounded_send(Ok(chunk.clone()));
            }
        }
    }

    /// Fails every open stream of `container_id` with a read error.
    pub fn fail(&self, container_id: &str) {
        if let Some(feeds) = self.feeds.lock().unwrap().remove(container_id) {
            for feed in feeds {
                let _ = feed.unbounded_send(Err(engine_error("read failed")));
            }
        }
    }

    /// Ends every open stream of `container_id`.
    pub fn end(&self, container_id: &str) {
        self.feeds.lock().unwrap().remove(container_id);
    }

    pub fn fail_opens_for(&self, container_id: &str) {
        self.failing_opens
            .lock()
            .unwrap()
            .insert(container_id.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Streams opened and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Polls until `live_streams() == expected`, panicking after a few seconds.
    pub async fn wait_for_live(&self, expected: usize) {
        for _ in 0..500 {
            if self.live_streams() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "Expected {} live streams, found {}",
            expected,
            self.live_streams()
        );
    }

    /// Polls until at least `expected` streams were opened.
    pub async fn wait_for_opened(&self, expected: usize) {
        for _ in 0..500 {
            if self.opened_streams() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "Expected {} opened streams, found {}",
            expected,
            self.opened_streams()
        );
    }
}

fn engine_error(message: &str) -> RuntimeError {
    RuntimeError::DockerApi(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.to_string(),
    })
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackedStream {
    inner: UnboundedReceiver<Result<Bytes, RuntimeError>>,
    _guard: LiveGuard,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, RuntimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn exists(&self, container_id: &str) -> Result<bool, RuntimeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(engine_error("engine offline"));
        }
        Ok(self.containers.lock().unwrap().contains(container_id))
    }

    async fn open_log_stream(&self, container_id: &str) -> Result<LogByteStream, RuntimeError> {
        if self.failing_opens.lock().unwrap().contains(container_id) {
            return Err(engine_error("open failed"));
        }

        let (tx, rx) = unbounded();
        if let Some(history) = self.history.lock().unwrap().get(container_id) {
            for chunk in history {
                let _ = tx.unbounded_send(Ok(chunk.clone()));
            }
        }
        self.feeds
            .lock()
            .unwrap()
            .entry(container_id.to_string())
            .or_default()
            .push(tx);

        self.live.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(TrackedStream {
            inner: rx,
            _guard: LiveGuard(Arc::clone(&self.live)),
        }
        .boxed())
    }

    async fn list_summaries(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(engine_error("engine offline"));
        }
        let mut ids: Vec<_> = self.containers.lock().unwrap().iter().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|id| ContainerSummary {
                name: format!("{id}-name"),
                id,
                image: "busybox".to_string(),
                status: "Up".to_string(),
                state: "running".to_string(),
                created: 0,
                ports: Vec::new(),
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(engine_error("engine offline"));
        }
        Ok(())
    }
}
