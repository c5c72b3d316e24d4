use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buffer::OutputBuffer;
use super::state::SessionState;
use super::types::{Attachment, Outbound, SessionConfig, SessionInfo};
use crate::errors::SessionError;
use crate::protocol::{EndReason, ServerFrame};
use crate::pty::{PtyBridge, PtyEvent};
use crate::sandbox::{SandboxCredentials, SandboxHandle, SandboxSupervisor};

/// All live sessions of the relay.
///
/// Every mutation of a session happens under that session's own lock, so
/// different sessions never contend. The map itself is only touched to
/// insert, look up and remove entries.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    supervisor: Arc<SandboxSupervisor>,
    config: SessionConfig,
}

struct SessionEntry {
    id: String,
    /// Client id of the creator; only the same client may attach.
    owner: Option<String>,
    sandbox: SandboxHandle,
    bridge: PtyBridge,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    buffer: OutputBuffer,
    attachment: Option<Attachment>,
    last_activity: DateTime<Utc>,
    grace: Option<GraceTimer>,
    grace_epoch: u64,
}

struct GraceTimer {
    epoch: u64,
    deadline: Instant,
    cancel: CancellationToken,
}

impl SessionInner {
    fn transition(&mut self, id: &str, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "[session:{}] Refusing transition {} -> {}",
                id, self.state, next
            );
            return false;
        }
        if self.state != next {
            debug!("[session:{}] {} -> {}", id, self.state, next);
        }
        self.state = next;
        true
    }

    fn cancel_grace(&mut self) {
        if let Some(grace) = self.grace.take() {
            grace.cancel.cancel();
        }
    }

    fn is_current(&self, conn_id: Uuid) -> bool {
        self.attachment
            .as_ref()
            .is_some_and(|attachment| attachment.conn_id == conn_id)
    }

    fn send(&self, frame: ServerFrame) {
        if let Some(attachment) = &self.attachment {
            // A closed queue means the connection is going away and will
            // detach on its own.
            let _ = attachment.tx.send(Outbound::Frame(frame));
        }
    }
}

impl SessionRegistry {
    pub fn new(supervisor: Arc<SandboxSupervisor>, config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            supervisor,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a sandbox and a shell inside it and register them as a new
    /// session.
    ///
    /// The session starts without a connection, so its grace timer is
    /// already running; [`Self::attach`] it right away.
    pub async fn create_session(
        self: &Arc<Self>,
        credentials: &SandboxCredentials,
        cols: u16,
        rows: u16,
    ) -> Result<String, SessionError> {
        let sandbox = self.supervisor.create(credentials, Vec::new()).await?;

        let (bridge, events) = match PtyBridge::attach(&sandbox, &self.config.shell, cols, rows) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[sandbox:{}] PTY attach failed: {}", sandbox.id(), e);
                self.supervisor.destroy(&sandbox).await;
                return Err(e.into());
            }
        };

        let id = Uuid::new_v4().to_string();
        let mut buffer = OutputBuffer::new(self.config.buffer_capacity);
        if let Some(banner) = &self.config.banner {
            buffer.push(banner.as_bytes());
        }

        let now = Utc::now();
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            owner: credentials.client_id.clone(),
            sandbox,
            bridge,
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                buffer,
                attachment: None,
                last_activity: now,
                grace: None,
                grace_epoch: 0,
            }),
        });

        self.start_grace(&entry, &mut entry.inner.lock());
        self.sessions.insert(id.clone(), Arc::clone(&entry));
        tokio::spawn(Arc::clone(self).pump(Arc::clone(&entry), events));

        info!(
            "[session:{}] Created (sandbox: {}, {} live)",
            id,
            entry.sandbox.id(),
            self.sessions.len()
        );
        Ok(id)
    }

    /// Make `attachment` the session's live sink.
    ///
    /// Under the session lock: evicts the current connection, cancels the
    /// grace timer, queues `attached` followed by the buffered output (a
    /// `replay` frame when `resumed`, otherwise a plain `data` frame if
    /// anything was buffered), then installs the new sink. Everything the
    /// shell produces afterwards follows on the same queue, so replay and
    /// live output never overlap or leave a gap.
    ///
    /// Returns `None` when the session does not exist, is shutting down or
    /// belongs to another client than `client_id`.
    pub fn attach(
        &self,
        id: &str,
        client_id: Option<&str>,
        attachment: Attachment,
        resumed: bool,
    ) -> Option<SessionHandle> {
        let entry = self.get(id)?;
        if entry.owner.as_deref() != client_id {
            warn!(
                "[session:{}] Attach by {:?} refused (owner: {:?})",
                id, client_id, entry.owner
            );
            return None;
        }
        let conn_id = attachment.conn_id;
        {
            let mut inner = entry.inner.lock();
            if !inner.state.is_resumable() {
                return None;
            }

            if let Some(previous) = inner.attachment.take() {
                info!(
                    "[session:{}] Connection {} superseded by {}",
                    id, previous.conn_id, conn_id
                );
                let _ = previous.tx.send(Outbound::Evicted);
            }
            inner.cancel_grace();
            if !inner.transition(id, SessionState::Active) {
                return None;
            }

            inner.attachment = Some(attachment);
            inner.last_activity = Utc::now();
            inner.send(ServerFrame::Attached {
                session_id: id.to_string(),
                resumed,
            });
            let snapshot = inner.buffer.snapshot();
            if resumed {
                inner.send(ServerFrame::Replay { data: snapshot });
            } else if !snapshot.is_empty() {
                inner.send(ServerFrame::data(snapshot));
            }

            info!(
                "[session:{}] Connection {} attached (resumed: {}, buffered: {} bytes)",
                id,
                conn_id,
                resumed,
                inner.buffer.len()
            );
        }

        Some(SessionHandle { entry, conn_id })
    }

    /// Reattach a session by id. The buffered output is queued as a `replay`
    /// frame right after `attached`. `None` means the session is unknown,
    /// expired, closing or owned by another client.
    pub fn resume_session(
        &self,
        id: &str,
        client_id: Option<&str>,
        attachment: Attachment,
    ) -> Option<SessionHandle> {
        self.attach(id, client_id, attachment, true)
    }

    /// The connection `conn_id` went away. The session keeps running and
    /// buffering for the grace period.
    ///
    /// Ignored when `conn_id` is no longer the session's connection, e.g.
    /// after it was superseded.
    pub fn detach_session(self: &Arc<Self>, id: &str, conn_id: Uuid) {
        let Some(entry) = self.get(id) else {
            return;
        };
        let mut inner = entry.inner.lock();
        if !inner.is_current(conn_id) {
            debug!(
                "[session:{}] Ignoring detach from stale connection {}",
                id, conn_id
            );
            return;
        }

        inner.attachment = None;
        if inner.transition(id, SessionState::DisconnectedGrace) {
            self.start_grace(&entry, &mut inner);
            info!(
                "[session:{}] Detached; closing in {:?} unless resumed",
                id, self.config.grace_period
            );
        }
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.get(id).map(|entry| entry.inner.lock().state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.collect_info(|_| true)
    }

    /// Sessions created by `client_id`.
    pub fn list_owned_by(&self, client_id: Option<&str>) -> Vec<SessionInfo> {
        self.collect_info(|entry| entry.owner.as_deref() == client_id)
    }

    fn collect_info(&self, keep: impl Fn(&SessionEntry) -> bool) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut infos: Vec<SessionInfo> = entries.iter().map(|entry| entry.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Close every session, telling attached clients it ended with an error.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if entries.is_empty() {
            return;
        }
        info!("Closing {} session(s)", entries.len());
        join_all(entries.iter().map(|entry| {
            self.close_session(
                entry,
                ServerFrame::Ended {
                    reason: EndReason::Error,
                    exit_code: None,
                },
            )
        }))
        .await;
    }

    fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn start_grace(self: &Arc<Self>, entry: &Arc<SessionEntry>, inner: &mut SessionInner) {
        inner.cancel_grace();
        inner.grace_epoch += 1;
        let epoch = inner.grace_epoch;
        let deadline = Instant::now() + self.config.grace_period;
        let cancel = CancellationToken::new();
        inner.grace = Some(GraceTimer {
            epoch,
            deadline,
            cancel: cancel.clone(),
        });

        let registry: Weak<Self> = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let (Some(registry), Some(entry)) = (registry.upgrade(), entry.upgrade()) {
                        registry.expire(&entry, epoch).await;
                    }
                }
            }
        });
    }

    async fn expire(&self, entry: &Arc<SessionEntry>, epoch: u64) {
        {
            let mut inner = entry.inner.lock();
            let current = inner.grace.as_ref().is_some_and(|g| g.epoch == epoch);
            if !current || inner.attachment.is_some() {
                return;
            }
            inner.grace = None;
        }
        info!("[session:{}] Grace period expired", entry.id);
        self.close_session(
            entry,
            ServerFrame::Ended {
                reason: EndReason::Error,
                exit_code: None,
            },
        )
        .await;
    }

    /// Forward shell output into the buffer and to the attached connection,
    /// then close the session when the shell exits.
    async fn pump(self: Arc<Self>, entry: Arc<SessionEntry>, mut events: UnboundedReceiver<PtyEvent>) {
        let mut exit_code = None;
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(bytes) => {
                    let mut inner = entry.inner.lock();
                    inner.buffer.push(&bytes);
                    inner.last_activity = Utc::now();
                    inner.send(ServerFrame::data(bytes));
                }
                PtyEvent::Exit { code } => {
                    exit_code = code;
                    break;
                }
            }
        }

        let reason = if exit_code.is_some() {
            EndReason::Exit
        } else {
            EndReason::Error
        };
        self.close_session(
            &entry,
            ServerFrame::Ended {
                reason,
                exit_code,
            },
        )
        .await;
    }

    /// Tear a session down: closing -> PTY terminated -> sandbox destroyed ->
    /// closed. Runs once; later calls return immediately.
    async fn close_session(&self, entry: &Arc<SessionEntry>, ended: ServerFrame) {
        {
            let mut inner = entry.inner.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            if !inner.transition(&entry.id, SessionState::Closing) {
                return;
            }
            inner.cancel_grace();
            inner.send(ended);
            inner.attachment = None;
        }

        entry.bridge.terminate();
        self.supervisor.destroy(&entry.sandbox).await;
        entry
            .inner
            .lock()
            .transition(&entry.id, SessionState::Closed);
        self.sessions
            .remove_if(&entry.id, |_, current| Arc::ptr_eq(current, entry));
        info!("[session:{}] Closed ({} live)", entry.id, self.sessions.len());
    }
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            session_id: self.id.clone(),
            client_id: self.owner.clone(),
            state: inner.state,
            sandbox_id: self.sandbox.id().to_string(),
            attached: inner.attachment.is_some(),
            created_at: self.created_at,
            last_activity: inner.last_activity,
            buffered_bytes: inner.buffer.len(),
            total_output: inner.buffer.total_written(),
            grace_remaining_ms: inner.grace.as_ref().map(|g| {
                g.deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64
            }),
        }
    }
}

/// One connection's view of the session it is attached to.
///
/// Input is only accepted while this connection is still the session's
/// attached connection.
pub struct SessionHandle {
    entry: Arc<SessionEntry>,
    conn_id: Uuid,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn sandbox_id(&self) -> &str {
        self.entry.sandbox.id()
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        self.entry.inner.lock().state
    }

    /// Returns `false` if this connection is no longer attached.
    pub fn write(&self, data: &[u8]) -> bool {
        let mut inner = self.entry.inner.lock();
        if !inner.is_current(self.conn_id) {
            return false;
        }
        inner.last_activity = Utc::now();
        self.entry.bridge.write(data);
        true
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        if !self.entry.inner.lock().is_current(self.conn_id) {
            return false;
        }
        self.entry.bridge.resize(cols, rows);
        true
    }

    /// Record liveness without data flow (heartbeats).
    pub fn touch(&self) {
        let mut inner = self.entry.inner.lock();
        if inner.is_current(self.conn_id) {
            inner.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::ShellConfig;
    use crate::sandbox::{HostRuntime, SupervisorConfig};
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn registry(grace_period: Duration, banner: Option<&str>) -> Arc<SessionRegistry> {
        let supervisor = Arc::new(SandboxSupervisor::new(
            Arc::new(HostRuntime::default()),
            SupervisorConfig {
                stop_grace: Duration::from_millis(200),
                ..Default::default()
            },
        ));
        Arc::new(SessionRegistry::new(
            supervisor,
            SessionConfig {
                grace_period,
                buffer_capacity: 64 * 1024,
                shell: ShellConfig::new("/bin/sh"),
                banner: banner.map(str::to_string),
            },
        ))
    }

    fn connection() -> (Attachment, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Attachment::new(Uuid::new_v4(), tx), rx)
    }

    fn creds() -> SandboxCredentials {
        SandboxCredentials {
            credential: "token".to_string(),
            client_id: None,
        }
    }

    /// Wait for `id` to leave the registry.
    async fn removed(registry: &SessionRegistry, id: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while registry.state(id).is_some() {
            assert!(Instant::now() < deadline, "session {id} was never removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for outbound")
            .expect("outbound queue closed")
    }

    /// Collect output bytes (data and replay frames) until `needle` shows up.
    async fn output_until(rx: &mut UnboundedReceiver<Outbound>, needle: &str) -> String {
        let mut collected = Vec::new();
        while !String::from_utf8_lossy(&collected).contains(needle) {
            match next(rx).await {
                Outbound::Frame(ServerFrame::Data { data })
                | Outbound::Frame(ServerFrame::Replay { data }) => collected.extend(data),
                _ => {}
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test]
    async fn fresh_attach_streams_live_output() {
        let registry = registry(Duration::from_secs(30), None);
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();

        let (attachment, mut rx) = connection();
        let handle = registry.attach(&id, None, attachment, false).unwrap();
        assert_eq!(
            next(&mut rx).await,
            Outbound::Frame(ServerFrame::Attached {
                session_id: id.clone(),
                resumed: false
            })
        );
        assert_eq!(registry.state(&id), Some(SessionState::Active));

        assert!(handle.write(b"echo 'h'i\n"));
        output_until(&mut rx, "hi").await;
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn resume_replays_output_produced_while_detached() {
        let registry = registry(Duration::from_secs(30), None);
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();

        let (attachment, _rx) = connection();
        let first_conn = attachment.conn_id;
        let handle = registry.attach(&id, None, attachment, false).unwrap();
        let sandbox_id = handle.sandbox_id().to_string();
        handle.write(b"sleep 0.3; echo 'do'ne\n");
        registry.detach_session(&id, first_conn);
        assert_eq!(registry.state(&id), Some(SessionState::DisconnectedGrace));

        tokio::time::sleep(Duration::from_millis(800)).await;

        let (attachment, mut rx) = connection();
        let resumed = registry.resume_session(&id, None, attachment).unwrap();
        assert_eq!(resumed.sandbox_id(), sandbox_id);
        assert!(matches!(
            next(&mut rx).await,
            Outbound::Frame(ServerFrame::Attached { resumed: true, .. })
        ));
        match next(&mut rx).await {
            Outbound::Frame(ServerFrame::Replay { data }) => {
                assert!(String::from_utf8_lossy(&data).contains("done"));
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(registry.state(&id), Some(SessionState::Active));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn grace_expiry_closes_session() {
        let registry = registry(Duration::from_millis(200), None);
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();
        let (attachment, _rx) = connection();
        let conn = attachment.conn_id;
        let handle = registry.attach(&id, None, attachment, false).unwrap();
        registry.detach_session(&id, conn);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.state(&id), None);
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(registry.supervisor.live_count(), 0);

        let (attachment, _rx) = connection();
        assert!(registry.resume_session(&id, None, attachment).is_none());
    }

    #[tokio::test]
    async fn second_attach_evicts_the_first() {
        let registry = registry(Duration::from_secs(30), None);
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();

        let (first, mut first_rx) = connection();
        let first_conn = first.conn_id;
        let first_handle = registry.attach(&id, None, first, false).unwrap();
        let (second, mut second_rx) = connection();
        let second_handle = registry.resume_session(&id, None, second).unwrap();

        let mut evicted = false;
        while let Ok(Some(outbound)) =
            tokio::time::timeout(Duration::from_millis(200), first_rx.recv()).await
        {
            evicted |= outbound == Outbound::Evicted;
        }
        assert!(evicted);
        assert!(!first_handle.write(b"ignored\n"));

        // The evicted connection's detach must not disturb the new one.
        registry.detach_session(&id, first_conn);
        assert_eq!(registry.state(&id), Some(SessionState::Active));

        assert!(second_handle.write(b"echo 'o'k\n"));
        output_until(&mut second_rx, "ok").await;
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shell_exit_ends_session_once() {
        let registry = registry(Duration::from_secs(30), None);
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();
        let (attachment, mut rx) = connection();
        let handle = registry.attach(&id, None, attachment, false).unwrap();
        handle.write(b"exit 0\n");

        let mut ended = Vec::new();
        while let Ok(Some(outbound)) =
            tokio::time::timeout(Duration::from_secs(10), rx.recv()).await
        {
            if let Outbound::Frame(frame @ ServerFrame::Ended { .. }) = outbound {
                ended.push(frame);
            }
        }
        assert_eq!(
            ended,
            vec![ServerFrame::Ended {
                reason: EndReason::Exit,
                exit_code: Some(0)
            }]
        );
        removed(&registry, &id).await;
        // Removal is the last step of closing.
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(registry.supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn only_the_creator_can_attach() {
        let registry = registry(Duration::from_secs(30), None);
        let alice = SandboxCredentials {
            credential: "alice-token".to_string(),
            client_id: Some("alice".to_string()),
        };
        let id = registry.create_session(&alice, 80, 24).await.unwrap();

        let (attachment, mut alice_rx) = connection();
        let alice_handle = registry
            .attach(&id, Some("alice"), attachment, false)
            .unwrap();

        let (attachment, mut bob_rx) = connection();
        assert!(registry
            .resume_session(&id, Some("bob"), attachment)
            .is_none());
        let (attachment, _rx) = connection();
        assert!(registry.resume_session(&id, None, attachment).is_none());
        assert!(bob_rx.try_recv().is_err());

        // Alice keeps the session.
        assert_eq!(registry.state(&id), Some(SessionState::Active));
        assert!(alice_handle.write(b"echo 'st'ill-mine\n"));
        output_until(&mut alice_rx, "still-mine").await;

        assert_eq!(registry.list_owned_by(Some("alice")).len(), 1);
        assert_eq!(
            registry.list_owned_by(Some("alice"))[0].client_id.as_deref(),
            Some("alice")
        );
        assert!(registry.list_owned_by(Some("bob")).is_empty());
        assert!(registry.list_owned_by(None).is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn banner_is_written_once() {
        let registry = registry(Duration::from_secs(30), Some("welcome-banner\r\n"));
        let id = registry.create_session(&creds(), 80, 24).await.unwrap();

        let (attachment, mut rx) = connection();
        let conn = attachment.conn_id;
        registry.attach(&id, None, attachment, false).unwrap();
        output_until(&mut rx, "welcome-banner").await;

        for _ in 0..2 {
            registry.detach_session(&id, conn);
            let (attachment, mut rx) = connection();
            let handle = registry.resume_session(&id, None, attachment).unwrap();
            let _attached = next(&mut rx).await;
            match next(&mut rx).await {
                Outbound::Frame(ServerFrame::Replay { data }) => {
                    let text = String::from_utf8_lossy(&data);
                    assert_eq!(text.matches("welcome-banner").count(), 1);
                }
                other => panic!("expected replay, got {other:?}"),
            }
            registry.detach_session(&id, handle.conn_id());
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn creation_failure_is_reported() {
        let supervisor = Arc::new(SandboxSupervisor::new(
            Arc::new(HostRuntime::default()),
            SupervisorConfig {
                max_sandboxes: 0,
                ..Default::default()
            },
        ));
        let registry = Arc::new(SessionRegistry::new(supervisor, SessionConfig::default()));
        let err = registry.create_session(&creds(), 80, 24).await.unwrap_err();
        assert!(matches!(err, SessionError::Sandbox(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn list_and_shutdown() {
        let registry = registry(Duration::from_secs(30), None);
        let a = registry.create_session(&creds(), 80, 24).await.unwrap();
        let b = registry.create_session(&creds(), 80, 24).await.unwrap();

        let listed: Vec<String> = registry.list().into_iter().map(|i| i.session_id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a) && listed.contains(&b));
        assert!(registry
            .list()
            .iter()
            .all(|info| info.state == SessionState::Starting && info.grace_remaining_ms.is_some()));

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(registry.supervisor.live_count(), 0);
    }
}
