//! Registry of live stream sessions.
//!
//! Lock order is always registry, then session, then broadcaster. The
//! registry lock only guards insertion and removal; everything a session
//! owns sits behind the session's own lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Broadcaster, StreamingError};
use crate::ids::{ClientId, ContentId, Pid};

/// Lifecycle of a session's upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// The anchor client is starting the upstream
    Starting,
    /// The upstream is playing and the broadcaster is fed
    Ready,
    /// The upstream could not be started or has failed for good
    Failed(StreamingError),
}

/// Shared upstream connection state for one content identifier.
pub struct StreamSession {
    content_id: ContentId,
    anchor_pid: Pid,
    broadcaster: Arc<Broadcaster>,
    upstream_cancel: CancellationToken,
    state: Mutex<SessionState>,
    readiness: watch::Sender<Readiness>,
}

struct SessionState {
    clients: BTreeSet<ClientId>,
    stream_url: Option<String>,
    ready: bool,
    last_error: Option<StreamingError>,
    upstream_attempts: u32,
}

impl StreamSession {
    fn new(content_id: ContentId, anchor_pid: Pid, buffer_chunks: usize) -> Self {
        let (readiness, _) = watch::channel(Readiness::Starting);
        Self {
            broadcaster: Arc::new(Broadcaster::new(content_id.clone(), buffer_chunks)),
            content_id,
            anchor_pid,
            upstream_cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                clients: BTreeSet::new(),
                stream_url: None,
                ready: false,
                last_error: None,
                upstream_attempts: 0,
            }),
            readiness,
        }
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    /// PID of the client that created the session; the upstream player runs under it.
    pub fn anchor_pid(&self) -> Pid {
        self.anchor_pid
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Token that stops the upstream relay when the session closes.
    pub fn upstream_cancel(&self) -> &CancellationToken {
        &self.upstream_cancel
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.state.lock().clients.iter().copied().collect()
    }

    pub fn stream_url(&self) -> Option<String> {
        self.state.lock().stream_url.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn last_error(&self) -> Option<StreamingError> {
        self.state.lock().last_error.clone()
    }

    /// Number of upstream copy attempts made so far.
    pub fn upstream_attempts(&self) -> u32 {
        self.state.lock().upstream_attempts
    }

    /// Subscribes to readiness transitions.
    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// Records the playback URL and releases every waiting client.
    pub fn mark_ready(&self, stream_url: String) {
        let mut state = self.state.lock();
        state.stream_url = Some(stream_url);
        state.ready = true;
        self.readiness.send_replace(Readiness::Ready);
    }

    /// Records a terminal error and releases every waiting client.
    pub fn mark_failed(&self, error: StreamingError) {
        let mut state = self.state.lock();
        state.ready = false;
        state.last_error = Some(error.clone());
        self.readiness.send_replace(Readiness::Failed(error));
    }

    /// Replaces the playback URL after a reconnect.
    pub fn update_stream_url(&self, stream_url: String) {
        self.state.lock().stream_url = Some(stream_url);
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        let mut state = self.state.lock();
        state.upstream_attempts += 1;
        state.upstream_attempts
    }

    /// A failed or finished session must not be joined by new clients.
    fn is_defunct(&self) -> bool {
        let failed = self.state.lock().last_error.is_some();
        failed || self.broadcaster.is_closed()
    }

    fn attach(&self, client_id: ClientId) {
        self.state.lock().clients.insert(client_id);
    }

    fn detach(&self, client_id: ClientId) -> usize {
        let mut state = self.state.lock();
        state.clients.remove(&client_id);
        state.clients.len()
    }
}

/// Observability snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    #[serde(rename = "info_hash")]
    pub content_id: ContentId,
    pub client_count: usize,
    #[serde(rename = "pids")]
    pub client_ids: Vec<ClientId>,
}

/// Maps content identifiers to their live session.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ContentId, Arc<StreamSession>>>,
    buffer_chunks: usize,
}

impl SessionRegistry {
    /// Creates a registry whose broadcasters buffer `buffer_chunks` per client.
    pub fn new(buffer_chunks: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer_chunks,
        }
    }

    /// Attaches `client_id` to the session for `content_id`.
    ///
    /// Creates the session when none is registered, or when the registered
    /// one has already failed or finished. Returns the session and whether it
    /// was created by this call; the creator is responsible for starting the
    /// upstream.
    pub fn add_client(
        &self,
        content_id: &ContentId,
        client_id: ClientId,
    ) -> (Arc<StreamSession>, bool) {
        let mut sessions = self.sessions.lock();

        if let Some(session) = sessions.get(content_id) {
            if !session.is_defunct() {
                session.attach(client_id);
                return (Arc::clone(session), false);
            }
            debug!(%content_id, "Replacing defunct session");
        }

        let session = Arc::new(StreamSession::new(
            content_id.clone(),
            client_id,
            self.buffer_chunks,
        ));
        session.attach(client_id);
        sessions.insert(content_id.clone(), Arc::clone(&session));
        (session, true)
    }

    /// Detaches `client_id` from `session`.
    ///
    /// Returns true when this was the session's last client. The session is
    /// then removed from the registry, unless a newer session has already
    /// replaced it there.
    pub fn remove_client(&self, session: &Arc<StreamSession>, client_id: ClientId) -> bool {
        let mut sessions = self.sessions.lock();

        if session.detach(client_id) > 0 {
            return false;
        }

        let content_id = session.content_id();
        if sessions
            .get(content_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, session))
        {
            sessions.remove(content_id);
        }
        true
    }

    /// Returns the registered session for `content_id`, if any.
    pub fn get(&self, content_id: &ContentId) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(content_id).cloned()
    }

    /// Snapshot of every registered session, ordered by content identifier.
    pub fn all_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<StreamSession>> = self.sessions.lock().values().cloned().collect();

        let mut snapshots: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|session| {
                let client_ids = session.client_ids();
                SessionSnapshot {
                    content_id: session.content_id().clone(),
                    client_count: client_ids.len(),
                    client_ids,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(id: &str) -> ContentId {
        ContentId::parse(id).unwrap()
    }

    #[test]
    fn test_first_client_creates_session() {
        let registry = SessionRegistry::new(8);
        let id = content("alpha");

        let (session, created) = registry.add_client(&id, Pid::new(1));
        assert!(created);
        assert_eq!(session.anchor_pid(), Pid::new(1));
        assert_eq!(session.client_count(), 1);

        let (joined, created) = registry.add_client(&id, Pid::new(2));
        assert!(!created);
        assert!(Arc::ptr_eq(&session, &joined));
        assert_eq!(session.client_count(), 2);
    }

    #[test]
    fn test_session_exists_iff_clients_attached() {
        let registry = SessionRegistry::new(8);
        let id = content("alpha");

        let (session, _) = registry.add_client(&id, Pid::new(1));
        registry.add_client(&id, Pid::new(2));

        assert!(!registry.remove_client(&session, Pid::new(1)));
        assert!(registry.get(&id).is_some());

        assert!(registry.remove_client(&session, Pid::new(2)));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_session_is_replaced_for_new_clients() {
        let registry = SessionRegistry::new(8);
        let id = content("alpha");

        let (failed, _) = registry.add_client(&id, Pid::new(1));
        registry.add_client(&id, Pid::new(2));
        failed.mark_failed(StreamingError::StreamNotActive {
            content_id: id.clone(),
        });

        let (fresh, created) = registry.add_client(&id, Pid::new(3));
        assert!(created);
        assert!(!Arc::ptr_eq(&failed, &fresh));

        // Leaving the orphaned session must not unregister its replacement.
        assert!(!registry.remove_client(&failed, Pid::new(1)));
        assert!(registry.remove_client(&failed, Pid::new(2)));
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &fresh));
    }

    #[test]
    fn test_snapshot_lists_sessions_and_clients() {
        let registry = SessionRegistry::new(8);
        registry.add_client(&content("beta"), Pid::new(7));
        registry.add_client(&content("alpha"), Pid::new(3));
        registry.add_client(&content("alpha"), Pid::new(4));

        let snapshots = registry.all_sessions();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].content_id, content("alpha"));
        assert_eq!(snapshots[0].client_count, 2);
        assert_eq!(snapshots[0].client_ids, vec![Pid::new(3), Pid::new(4)]);
        assert_eq!(snapshots[1].client_ids, vec![Pid::new(7)]);
    }

    #[tokio::test]
    async fn test_readiness_transitions_are_observed() {
        let registry = SessionRegistry::new(8);
        let (session, _) = registry.add_client(&content("alpha"), Pid::new(1));
        let mut readiness = session.readiness();
        assert_eq!(*readiness.borrow(), Readiness::Starting);

        session.mark_ready("http://engine/play/1".to_string());

        let state = readiness
            .wait_for(|state| *state != Readiness::Starting)
            .await
            .unwrap()
            .clone();
        assert_eq!(state, Readiness::Ready);
        assert!(session.is_ready());
        assert_eq!(session.stream_url().as_deref(), Some("http://engine/play/1"));
    }

    #[test]
    fn test_concurrent_joins_create_exactly_one_session() {
        let registry = Arc::new(SessionRegistry::new(8));
        let id = content("shared");

        let handles: Vec<_> = (0..16u64)
            .map(|n| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                std::thread::spawn(move || registry.add_client(&id, Pid::new(n)).1)
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|created| *created)
            .count();

        assert_eq!(created, 1);
        assert_eq!(registry.get(&id).unwrap().client_count(), 16);
    }
}
