//! Fan-out of one upstream byte stream to many client buffers.
//!
//! The upstream copy loop must never wait on the slowest client. Every
//! client gets a bounded queue; a write that finds a queue full evicts that
//! client instead of blocking.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{StreamingError, TimeoutWriter};
use crate::ids::{ClientId, ContentId};

/// Copies upstream chunks into bounded per-client queues.
pub struct Broadcaster {
    content_id: ContentId,
    capacity: usize,
    state: Mutex<BroadcastState>,
}

struct BroadcastState {
    clients: HashMap<ClientId, mpsc::Sender<Bytes>>,
    closed: bool,
    terminal_error: Option<StreamingError>,
}

impl Broadcaster {
    /// Creates a broadcaster whose clients may lag by `capacity` chunks.
    pub fn new(content_id: ContentId, capacity: usize) -> Self {
        Self {
            content_id,
            capacity: capacity.max(1),
            state: Mutex::new(BroadcastState {
                clients: HashMap::new(),
                closed: false,
                terminal_error: None,
            }),
        }
    }

    /// Queues `chunk` for every attached client.
    ///
    /// Clients whose queue is full are evicted on the spot. Always reports
    /// the whole chunk as accepted; delivery to slow clients is best-effort.
    pub fn write(&self, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        let chunk = Bytes::copy_from_slice(chunk);

        let mut state = self.state.lock();
        if state.closed {
            return chunk.len();
        }

        let content_id = &self.content_id;
        state
            .clients
            .retain(|client_id, queue| match queue.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(%content_id, %client_id, "Evicting slow client, buffer full");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });

        chunk.len()
    }

    /// Attaches a client queue.
    ///
    /// On a closed broadcaster the returned subscription is already at its
    /// end and yields the stored terminal error.
    pub fn register(self: &Arc<Self>, client_id: ClientId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);

        let mut state = self.state.lock();
        if !state.closed {
            state.clients.insert(client_id, sender);
        }
        drop(state);

        Subscription {
            broadcaster: Arc::clone(self),
            client_id,
            queue: receiver,
        }
    }

    /// Registers `client_id` and forwards its chunks into `destination`.
    ///
    /// Returns the number of bytes delivered once the stream ends normally.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Cancelled` - `cancel` fired
    /// - `StreamingError::ClientWrite` - Writing into `destination` failed or timed out
    /// - Any terminal error the broadcaster was closed with
    pub async fn subscribe<W>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        client_id: ClientId,
        destination: W,
        write_timeout: Duration,
    ) -> Result<u64, StreamingError>
    where
        W: AsyncWrite + Unpin,
    {
        self.register(client_id)
            .forward(destination, write_timeout, cancel)
            .await
    }

    /// Marks the broadcaster closed and releases every waiting client.
    ///
    /// Only the first call records its error.
    pub fn close(&self, error: Option<StreamingError>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.terminal_error = error;
        let released = state.clients.len();
        state.clients.clear();
        drop(state);

        debug!(content_id = %self.content_id, released, "Broadcaster closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn terminal_error(&self) -> Option<StreamingError> {
        self.state.lock().terminal_error.clone()
    }

    /// Number of clients currently receiving chunks.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    fn unregister(&self, client_id: ClientId) {
        self.state.lock().clients.remove(&client_id);
    }
}

/// A client's queue on a broadcaster. Dropping it detaches the client.
pub struct Subscription {
    broadcaster: Arc<Broadcaster>,
    client_id: ClientId,
    queue: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Drains the queue into `destination` until the stream ends.
    ///
    /// A queue closed by eviction ends like a normal stream end, so an
    /// evicted client sees its connection terminate quietly.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Cancelled` - `cancel` fired
    /// - `StreamingError::ClientWrite` - Writing into `destination` failed or timed out
    /// - Any terminal error the broadcaster was closed with
    pub async fn forward<W>(
        mut self,
        destination: W,
        write_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, StreamingError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = TimeoutWriter::new(destination, write_timeout);
        let mut delivered = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
                next = self.queue.recv() => next,
            };

            let Some(chunk) = next else {
                return self.finish(delivered);
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
                written = writer.write_chunk(&chunk) => {
                    delivered += written? as u64;
                }
            }
        }
    }

    fn finish(&self, delivered: u64) -> Result<u64, StreamingError> {
        if !self.broadcaster.is_closed() {
            debug!(
                content_id = %self.broadcaster.content_id,
                client_id = %self.client_id,
                delivered,
                "Client queue closed by eviction"
            );
            return Ok(delivered);
        }
        match self.broadcaster.terminal_error() {
            Some(error) => Err(error),
            None => Ok(delivered),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.client_id);
    }
}

/// Adapts a broadcaster into an `AsyncWrite` destination for the engine.
///
/// Writes never block and never fail.
#[derive(Clone)]
pub struct BroadcastSink {
    broadcaster: Arc<Broadcaster>,
}

impl BroadcastSink {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl AsyncWrite for BroadcastSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(self.broadcaster.write(buf)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
