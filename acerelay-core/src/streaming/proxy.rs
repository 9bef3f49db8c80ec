//! Client entry point for multiplexed streams.
//!
//! The first client for a content identifier starts the upstream under its
//! own PID and spawns the relay task that feeds the session's broadcaster.
//! Later clients wait for readiness and subscribe. The last client to leave
//! stops the upstream player.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::Readiness;
use super::{
    BroadcastSink, SessionRegistry, SessionSnapshot, StreamSession, StreamingError, Subscription,
};
use crate::config::ProxyConfig;
use crate::engine::{Engine, EngineError, StreamRequest};
use crate::ids::{self, ClientId, ContentId};

/// Orchestrates session creation, joins, reconnection and teardown.
pub struct ProxyService {
    engine: Arc<dyn Engine>,
    registry: Arc<SessionRegistry>,
    config: ProxyConfig,
}

impl ProxyService {
    pub fn new(engine: Arc<dyn Engine>, config: ProxyConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.client_buffer_chunks)),
            engine,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Snapshot of every active session.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.all_sessions()
    }

    /// Attaches a new client to the stream and streams it into `destination`.
    ///
    /// Returns the number of bytes delivered. The client is always detached
    /// from its session on return.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidContentId` - `raw_content_id` is empty
    /// - `StreamingError::EngineUnavailable` - The engine could not start the stream
    /// - `StreamingError::ReadyTimeout` - The session did not become ready in time
    /// - `StreamingError::ReconnectExhausted` - The upstream failed for good
    /// - `StreamingError::ClientWrite` - `destination` failed or was too slow
    /// - `StreamingError::Cancelled` - `cancel` fired
    pub async fn stream_to_client<W>(
        &self,
        cancel: &CancellationToken,
        raw_content_id: &str,
        destination: W,
    ) -> Result<u64, StreamingError>
    where
        W: AsyncWrite + Unpin,
    {
        let client = self.attach(cancel, raw_content_id).await?;
        client.stream(destination, cancel).await
    }

    /// Registers a client and waits until its session is ready.
    ///
    /// Splitting attachment from streaming lets callers report setup
    /// failures before committing to a response.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyService::stream_to_client`], minus the delivery errors.
    pub async fn attach(
        &self,
        cancel: &CancellationToken,
        raw_content_id: &str,
    ) -> Result<AttachedClient, StreamingError> {
        let content_id =
            ContentId::parse(raw_content_id).map_err(|_| StreamingError::InvalidContentId)?;
        let client_id = ids::next_pid();

        let (session, created) = self.registry.add_client(&content_id, client_id);
        let guard = ClientGuard {
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&session),
            client_id,
            released: false,
        };

        let setup = if created {
            self.start_session(&session, cancel).await
        } else {
            self.wait_until_ready(&session, cancel).await
        };
        if let Err(error) = setup {
            guard.release().await;
            return Err(error);
        }

        // The creator subscribes before the relay starts so it sees every byte.
        let subscription = session.broadcaster().register(client_id);
        if created {
            tokio::spawn(relay_upstream(
                Arc::clone(&self.engine),
                Arc::clone(&session),
                self.config.clone(),
            ));
        }

        info!(
            content_id = %content_id,
            client_id = %client_id,
            created,
            clients = session.client_count(),
            "Client attached"
        );

        Ok(AttachedClient {
            guard,
            subscription,
            write_timeout: self.config.write_timeout,
        })
    }

    async fn start_session(
        &self,
        session: &StreamSession,
        cancel: &CancellationToken,
    ) -> Result<(), StreamingError> {
        let content_id = session.content_id();
        let pid = session.anchor_pid();
        let mut pending = PendingStart {
            engine: Arc::clone(&self.engine),
            session,
            armed: true,
        };

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamingError::Cancelled),
            result = self.engine.start_stream(content_id, pid) => {
                result.map_err(|source| StreamingError::EngineUnavailable {
                    content_id: content_id.clone(),
                    source,
                })
            }
        };

        match started {
            Ok(stream_url) => {
                pending.armed = false;
                debug!(%content_id, %pid, %stream_url, "Upstream started");
                session.mark_ready(stream_url);
                Ok(())
            }
            // `pending` fails the session and stops the half-started player.
            Err(StreamingError::Cancelled) => Err(StreamingError::Cancelled),
            Err(error) => {
                pending.armed = false;
                warn!(%content_id, %pid, %error, "Failed to start upstream");
                session.mark_failed(error.clone());
                Err(error)
            }
        }
    }

    async fn wait_until_ready(
        &self,
        session: &StreamSession,
        cancel: &CancellationToken,
    ) -> Result<(), StreamingError> {
        let content_id = session.content_id();
        let mut readiness = session.readiness();
        let settled = readiness.wait_for(|state| *state != Readiness::Starting);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
            outcome = tokio::time::timeout(self.config.ready_timeout, settled) => outcome,
        };

        let state = match outcome {
            Err(_) => {
                return Err(StreamingError::ReadyTimeout {
                    content_id: content_id.clone(),
                    waited: self.config.ready_timeout,
                });
            }
            Ok(Err(_)) => {
                return Err(StreamingError::StreamNotActive {
                    content_id: content_id.clone(),
                });
            }
            Ok(Ok(state)) => (*state).clone(),
        };

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(error) => Err(error),
            Readiness::Starting => Err(StreamingError::StreamNotActive {
                content_id: content_id.clone(),
            }),
        }
    }
}

/// A client attached to a ready session.
///
/// Dropping it without calling [`AttachedClient::stream`] still detaches
/// the client.
pub struct AttachedClient {
    guard: ClientGuard,
    subscription: Subscription,
    write_timeout: Duration,
}

impl AttachedClient {
    pub fn client_id(&self) -> ClientId {
        self.guard.client_id
    }

    pub fn content_id(&self) -> &ContentId {
        self.guard.session.content_id()
    }

    /// Forwards session bytes into `destination` until the stream ends.
    ///
    /// # Errors
    ///
    /// - `StreamingError::ClientWrite` - `destination` failed or was too slow
    /// - `StreamingError::Cancelled` - `cancel` fired
    /// - `StreamingError::ReconnectExhausted` - The upstream failed for good
    pub async fn stream<W>(
        self,
        destination: W,
        cancel: &CancellationToken,
    ) -> Result<u64, StreamingError>
    where
        W: AsyncWrite + Unpin,
    {
        let Self {
            guard,
            subscription,
            write_timeout,
        } = self;

        let result = subscription
            .forward(destination, write_timeout, cancel)
            .await;

        let content_id = guard.session.content_id();
        let client_id = guard.client_id;
        match &result {
            Ok(delivered) => info!(%content_id, %client_id, delivered, "Client finished"),
            Err(StreamingError::Cancelled) => {
                debug!(%content_id, %client_id, "Client disconnected")
            }
            Err(error) if error.is_slow_client() => {
                warn!(%content_id, %client_id, %error, "Dropping slow client")
            }
            Err(error) => warn!(%content_id, %client_id, %error, "Client stream failed"),
        }

        guard.release().await;
        result
    }
}

/// Detaches a client from its session exactly once.
struct ClientGuard {
    engine: Arc<dyn Engine>,
    registry: Arc<SessionRegistry>,
    session: Arc<StreamSession>,
    client_id: ClientId,
    released: bool,
}

impl ClientGuard {
    async fn release(mut self) {
        self.released = true;
        if self.registry.remove_client(&self.session, self.client_id) {
            close_session(&self.session);
            stop_upstream(self.engine.as_ref(), &self.session).await;
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.registry.remove_client(&self.session, self.client_id) {
            return;
        }
        close_session(&self.session);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                content_id = %self.session.content_id(),
                pid = %self.session.anchor_pid(),
                "No runtime to stop upstream player"
            );
            return;
        };
        let engine = Arc::clone(&self.engine);
        let session = Arc::clone(&self.session);
        runtime.spawn(async move { stop_upstream(engine.as_ref(), &session).await });
    }
}

/// Settles a session whose creator went away before the engine answered.
///
/// Joiners waiting on readiness see `StreamNotActive` at once instead of
/// sitting out the ready timeout, and the next client replaces the session.
/// The engine may have started the player anyway, so its PID is stopped on
/// a best-effort basis.
struct PendingStart<'a> {
    engine: Arc<dyn Engine>,
    session: &'a StreamSession,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let content_id = self.session.content_id().clone();
        let pid = self.session.anchor_pid();
        self.session.mark_failed(StreamingError::StreamNotActive {
            content_id: content_id.clone(),
        });

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%content_id, %pid, "No runtime to stop abandoned player");
            return;
        };
        let engine = Arc::clone(&self.engine);
        runtime.spawn(async move {
            match engine.stop_stream(pid).await {
                Ok(()) => info!(%content_id, %pid, "Stopped player of abandoned start"),
                Err(error) => debug!(%content_id, %pid, %error, "No player left by abandoned start"),
            }
        });
    }
}

fn close_session(session: &StreamSession) {
    session.upstream_cancel().cancel();
    session.broadcaster().close(None);
}

async fn stop_upstream(engine: &dyn Engine, session: &StreamSession) {
    // Nothing to stop when the upstream never started.
    if session.stream_url().is_none() {
        return;
    }

    let content_id = session.content_id();
    let pid = session.anchor_pid();
    match engine.stop_stream(pid).await {
        Ok(()) => info!(%content_id, %pid, "Stopped upstream after last client left"),
        Err(error) => warn!(%content_id, %pid, %error, "Failed to stop upstream"),
    }
}

/// Copies upstream bytes into the session broadcaster, reconnecting on failure.
async fn relay_upstream(engine: Arc<dyn Engine>, session: Arc<StreamSession>, config: ProxyConfig) {
    let content_id = session.content_id().clone();
    let pid = session.anchor_pid();
    let cancel = session.upstream_cancel().clone();
    let broadcaster = Arc::clone(session.broadcaster());
    let mut sink = BroadcastSink::new(Arc::clone(&broadcaster));
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = EngineError::Cancelled;

    for attempt in 1..=max_attempts {
        session.record_attempt();

        if attempt > 1 {
            let backoff = backoff_delay(config.base_backoff, attempt);
            info!(%content_id, %pid, attempt, ?backoff, "Reconnecting upstream");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            let restarted = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = engine.start_stream(&content_id, pid) => result,
            };
            match restarted {
                Ok(stream_url) => session.update_stream_url(stream_url),
                Err(error) => {
                    warn!(%content_id, %pid, attempt, %error, "Upstream restart failed");
                    last_error = error;
                    continue;
                }
            }
        }

        let Some(stream_url) = session.stream_url() else {
            return;
        };
        let request = StreamRequest {
            stream_url: &stream_url,
            content_id: &content_id,
            pid,
            write_timeout: config.write_timeout,
        };

        match engine.stream_content(request, &mut sink, &cancel).await {
            Ok(copied) => {
                info!(%content_id, %pid, attempt, copied, "Upstream finished");
                broadcaster.close(None);
                return;
            }
            Err(error) if error.is_cancelled() => {
                debug!(%content_id, %pid, "Upstream relay cancelled");
                broadcaster.close(None);
                return;
            }
            Err(error) => {
                warn!(%content_id, %pid, attempt, %error, "Upstream copy failed");
                last_error = error;
            }
        }
    }

    let error = StreamingError::ReconnectExhausted {
        content_id: content_id.clone(),
        attempts: max_attempts,
        last_error,
    };
    warn!(%content_id, %pid, %error, "Giving up on upstream");
    session.mark_failed(error.clone());
    broadcaster.close(Some(error));
}

/// Delay before `attempt` (2 or later): `base`, then doubling.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(2).min(16))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::RelayConfig;
    use crate::engine::SimulatedEngine;

    fn service(engine: &Arc<SimulatedEngine>) -> ProxyService {
        let engine: Arc<dyn Engine> = Arc::clone(engine) as Arc<dyn Engine>;
        ProxyService::new(engine, RelayConfig::for_testing().proxy)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_empty_content_id_is_rejected_without_side_effects() {
        let engine = Arc::new(SimulatedEngine::new());
        let proxy = service(&engine);
        let cancel = CancellationToken::new();

        let result = proxy.stream_to_client(&cancel, "  ", Vec::new()).await;

        assert_eq!(result, Err(StreamingError::InvalidContentId));
        assert_eq!(engine.start_calls(), 0);
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_single_client_receives_payload_and_stops_engine() {
        let engine = Arc::new(SimulatedEngine::new().with_payload([&b"hello "[..], b"world"]));
        let proxy = service(&engine);
        let cancel = CancellationToken::new();
        let mut output = Vec::new();

        let delivered = proxy
            .stream_to_client(&cancel, "abc", &mut output)
            .await
            .unwrap();

        assert_eq!(delivered, 11);
        assert_eq!(output, b"hello world");
        assert_eq!(engine.start_calls(), 1);
        assert_eq!(engine.stop_calls(), 1);
        assert_eq!(engine.active_players(), 0);
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_unregisters_session() {
        let engine = Arc::new(SimulatedEngine::new().fail_starts(1));
        let proxy = service(&engine);
        let cancel = CancellationToken::new();

        let error = proxy
            .stream_to_client(&cancel, "abc", Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(error, StreamingError::EngineUnavailable { .. }));
        assert!(proxy.registry().is_empty());
        assert_eq!(engine.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_joining_client_shares_upstream() {
        let engine = Arc::new(
            SimulatedEngine::live().with_start_delay(Duration::from_millis(50)),
        );
        let proxy = Arc::new(service(&engine));
        let cancel = CancellationToken::new();

        let spawn_client = |proxy: Arc<ProxyService>, cancel: CancellationToken| {
            tokio::spawn(async move {
                let (writer, mut reader) = tokio::io::duplex(64 * 1024);
                let drain = tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = reader.read_to_end(&mut sink).await;
                    sink.len()
                });
                let result = proxy.stream_to_client(&cancel, "shared", writer).await;
                (result, drain.await.unwrap())
            })
        };

        let first = spawn_client(Arc::clone(&proxy), cancel.clone());
        let second = spawn_client(Arc::clone(&proxy), cancel.clone());

        let registry = Arc::clone(proxy.registry());
        wait_until(|| {
            registry
                .all_sessions()
                .first()
                .is_some_and(|session| session.client_count == 2)
        })
        .await;
        assert_eq!(engine.start_calls(), 1);

        // Let some data flow before disconnecting both clients.
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        for client in [first, second] {
            let (result, received) = client.await.unwrap();
            assert_eq!(result, Err(StreamingError::Cancelled));
            assert!(received > 0);
        }

        wait_until(|| engine.stop_calls() == 1).await;
        assert_eq!(engine.start_calls(), 1);
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_joiner_sees_creator_start_failure() {
        let engine = Arc::new(
            SimulatedEngine::new()
                .fail_starts(1)
                .with_start_delay(Duration::from_millis(50)),
        );
        let proxy = Arc::new(service(&engine));
        let cancel = CancellationToken::new();

        let creator = {
            let proxy = Arc::clone(&proxy);
            let cancel = cancel.clone();
            tokio::spawn(async move { proxy.attach(&cancel, "abc").await.map(|_| ()) })
        };
        let registry = Arc::clone(proxy.registry());
        wait_until(|| !registry.is_empty()).await;

        let joiner = proxy.attach(&cancel, "abc").await;

        assert!(matches!(
            joiner.map(|_| ()),
            Err(StreamingError::EngineUnavailable { .. })
        ));
        assert!(matches!(
            creator.await.unwrap(),
            Err(StreamingError::EngineUnavailable { .. })
        ));
        assert_eq!(engine.start_calls(), 1);
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_joiner_times_out_waiting_for_readiness() {
        let engine = Arc::new(SimulatedEngine::new().with_start_delay(Duration::from_secs(5)));
        let mut config = RelayConfig::for_testing().proxy;
        config.ready_timeout = Duration::from_millis(50);
        let proxy = Arc::new(ProxyService::new(
            Arc::clone(&engine) as Arc<dyn Engine>,
            config,
        ));
        let cancel = CancellationToken::new();

        let creator = {
            let proxy = Arc::clone(&proxy);
            let cancel = cancel.clone();
            tokio::spawn(async move { proxy.attach(&cancel, "slow").await.map(|_| ()) })
        };
        let registry = Arc::clone(proxy.registry());
        wait_until(|| !registry.is_empty()).await;

        let error = proxy.attach(&cancel, "slow").await.map(|_| ()).unwrap_err();
        assert!(matches!(error, StreamingError::ReadyTimeout { .. }));

        cancel.cancel();
        assert_eq!(creator.await.unwrap(), Err(StreamingError::Cancelled));
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_creator_dropped_mid_start_releases_joiner() {
        let engine = Arc::new(
            SimulatedEngine::live().with_start_delay(Duration::from_millis(200)),
        );
        let mut config = RelayConfig::for_testing().proxy;
        config.ready_timeout = Duration::from_secs(1);
        let proxy = Arc::new(ProxyService::new(
            Arc::clone(&engine) as Arc<dyn Engine>,
            config,
        ));
        let cancel = CancellationToken::new();

        // The creator's attach future is dropped while the engine is starting.
        let creator = {
            let proxy = Arc::clone(&proxy);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(50), proxy.attach(&cancel, "orphan"))
                    .await
                    .is_err()
            })
        };
        let registry = Arc::clone(proxy.registry());
        wait_until(|| !registry.is_empty()).await;

        let joined_at = tokio::time::Instant::now();
        let joiner = proxy.attach(&cancel, "orphan").await.map(|_| ());

        assert!(creator.await.unwrap());
        assert!(matches!(
            joiner,
            Err(StreamingError::StreamNotActive { .. })
        ));
        assert!(joined_at.elapsed() < Duration::from_millis(500));
        assert!(proxy.registry().is_empty());
        wait_until(|| engine.stop_calls() == 1).await;

        // A later client starts a fresh session.
        let client = proxy.attach(&cancel, "orphan").await.unwrap();
        assert_eq!(engine.start_calls(), 2);
        drop(client);
        wait_until(|| engine.active_players() == 0).await;
    }

    #[tokio::test]
    async fn test_failed_copy_is_retried_with_same_pid() {
        let engine = Arc::new(
            SimulatedEngine::new()
                .with_payload([&b"second attempt"[..]])
                .fail_streams(1),
        );
        let proxy = service(&engine);
        let cancel = CancellationToken::new();

        let client = proxy.attach(&cancel, "flaky").await.unwrap();
        let session = proxy.registry().get(client.content_id()).unwrap();
        let mut output = Vec::new();

        let delivered = client.stream(&mut output, &cancel).await.unwrap();

        assert_eq!(delivered, 14);
        assert_eq!(output, b"second attempt");
        assert!(session.upstream_attempts() >= 2);
        assert_eq!(engine.stream_calls(), 2);
        // Initial start plus one restart under the anchor PID.
        assert_eq!(engine.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_fail_every_client() {
        let engine = Arc::new(SimulatedEngine::new().fail_streams(3));
        let proxy = service(&engine);
        let cancel = CancellationToken::new();

        let error = proxy
            .stream_to_client(&cancel, "doomed", Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            StreamingError::ReconnectExhausted { attempts: 3, .. }
        ));
        assert!(error.to_string().contains("failed after 3 attempts"));
        assert_eq!(engine.stream_calls(), 3);
        assert!(proxy.registry().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_attachment_detaches_client() {
        let engine = Arc::new(SimulatedEngine::live());
        let proxy = service(&engine);
        let cancel = CancellationToken::new();

        let client = proxy.attach(&cancel, "abandoned").await.unwrap();
        assert_eq!(proxy.sessions().len(), 1);

        drop(client);

        assert!(proxy.registry().is_empty());
        wait_until(|| engine.stop_calls() == 1).await;
    }
}
