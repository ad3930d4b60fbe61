//! The caller-facing sync client.
//!
//! [`SyncClient`] owns one [`Synchronizer`] per record type and wires the
//! three transports into them:
//!
//! ```text
//! caller ── add/toggle/send ──> Synchronizer ──> DurableStore
//!                                  │   ▲
//!              PeerChannel <───────┘   ├── peer listener
//!              RemoteStore <── spawn   ├── change listeners (push feed)
//!                                      └── pollers (pull fallback)
//! ```
//!
//! Local effects are applied and persisted before any network I/O; remote
//! writes run as background tasks bounded by the remote timeout and are
//! never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use opsync_proto::peer::PeerPayload;
use opsync_proto::remote::{ChangeKind, Table};
use opsync_proto::{Message, MessageKind, Task};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::identity::Identity;
use crate::peer::udp::UdpPeers;
use crate::peer::PeerChannel;
use crate::remote::poll::{self, PollState};
use crate::remote::ws::WsRemote;
use crate::remote::{RemoteChange, RemoteError, RemoteStore, rows};
use crate::store::{DurableStore, RecordKind, StoreError};
use crate::sync::{Origin, Record, Subscription, SyncEvent, SyncPolicy, Synchronizer};

/// Errors returned by task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The text is empty after trimming.
    #[error("task text is empty")]
    Empty,

    /// The text exceeds the configured length.
    #[error("task text exceeds {max} characters")]
    TooLong {
        /// Configured maximum, in characters.
        max: usize,
    },

    /// No task has this id.
    #[error("no task with id {0}")]
    NotFound(String),
}

/// Errors returned by message operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The content is empty after trimming.
    #[error("message content is empty")]
    Empty,
}

/// Tunables of a [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Retention and dedup windows.
    pub policy: SyncPolicy,
    /// Maximum messages returned by [`SyncClient::messages`]. The stored
    /// history is never truncated to it.
    pub history_limit: usize,
    /// Maximum task text length, in characters.
    pub max_task_text_len: usize,
    /// Bound on every remote call.
    pub remote_timeout: Duration,
    /// Interval of the pull fallback.
    pub poll_interval: Duration,
    /// Rows fetched per pull.
    pub fetch_limit: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl ClientOptions {
    /// Extracts the client tunables from a resolved configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            policy: SyncPolicy {
                retention: config.retention,
                dedup_window: TimeDelta::from_std(config.dedup_window)
                    .unwrap_or(TimeDelta::MAX),
            },
            history_limit: config.history_limit,
            max_task_text_len: config.max_task_text_len,
            remote_timeout: config.remote.timeout,
            poll_interval: config.remote.poll_interval,
            fetch_limit: config.remote.fetch_limit,
        }
    }
}

/// Tasks and messages kept in sync across local, peer, and remote transports.
///
/// Mutating operations must be called from within a Tokio runtime when a
/// remote store is attached; outside one, the remote write is skipped.
pub struct SyncClient<R: RemoteStore, P: PeerChannel> {
    identity: Identity,
    options: ClientOptions,
    tasks: Arc<Synchronizer<Task>>,
    messages: Arc<Synchronizer<Message>>,
    remote: Option<Arc<R>>,
    peer: Option<Arc<P>>,
    in_flight: Arc<watch::Sender<usize>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Opens the stores and transports described by `config`.
///
/// A bad remote URL or an unavailable multicast group is logged and the
/// client runs without that transport.
///
/// # Errors
///
/// Returns [`StoreError`] if the blob store cannot be opened.
pub fn open(config: &SyncConfig) -> Result<SyncClient<WsRemote, UdpPeers>, StoreError> {
    let store = Arc::new(DurableStore::open(&config.data_dir, config.sqlite)?);

    let remote = config.remote.url.as_deref().and_then(|url| {
        match WsRemote::new(url, config.remote.timeout) {
            Ok(remote) => Some(Arc::new(remote)),
            Err(e) => {
                tracing::warn!(url, error = %e, "remote store disabled");
                None
            }
        }
    });

    let peer = if config.peer.enabled {
        match UdpPeers::bind(config.peer.group, config.peer.port) {
            Ok(peer) => Some(Arc::new(peer)),
            Err(e) => {
                tracing::warn!(error = %e, "peer channel disabled");
                None
            }
        }
    } else {
        None
    };

    Ok(SyncClient::new(
        config.identity.clone(),
        store,
        ClientOptions::from_config(config),
        remote,
        peer,
    ))
}

impl<R: RemoteStore, P: PeerChannel> SyncClient<R, P> {
    /// Loads both collections from `store` and attaches the transports.
    ///
    /// No background work starts until [`start`](Self::start).
    pub fn new(
        identity: Identity,
        store: Arc<DurableStore>,
        options: ClientOptions,
        remote: Option<Arc<R>>,
        peer: Option<Arc<P>>,
    ) -> Self {
        let tasks = Arc::new(Synchronizer::open(Arc::clone(&store), options.policy));
        let messages = Arc::new(Synchronizer::open(store, options.policy));
        Self {
            identity,
            options,
            tasks,
            messages,
            remote,
            peer,
            in_flight: Arc::new(watch::Sender::new(0)),
            background: Mutex::new(Vec::new()),
        }
    }

    /// The acting user.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The task synchronizer.
    #[must_use]
    pub const fn task_sync(&self) -> &Arc<Synchronizer<Task>> {
        &self.tasks
    }

    /// The message synchronizer.
    #[must_use]
    pub const fn message_sync(&self) -> &Arc<Synchronizer<Message>> {
        &self.messages
    }

    /// Subscribes to the remote feeds, runs the initial fetch, and spawns
    /// the listeners and pollers.
    ///
    /// Calling it again replaces nothing; it adds a second set of tasks.
    pub async fn start(&self) {
        let mut spawned = Vec::new();

        if let Some(peer) = &self.peer {
            spawned.push(spawn_peer_listener(
                Arc::clone(peer),
                Arc::clone(&self.tasks),
                Arc::clone(&self.messages),
            ));
        }

        if let Some(remote) = &self.remote {
            let task_feed = remote.subscribe(Table::Tasks).await;
            let message_feed = remote.subscribe(Table::Messages).await;
            spawned.push(spawn_change_listener(task_feed, Arc::clone(&self.tasks)));
            spawned.push(spawn_change_listener(message_feed, Arc::clone(&self.messages)));

            self.initial_fetch(remote.as_ref(), &self.tasks).await;
            self.initial_fetch(remote.as_ref(), &self.messages).await;

            let period = self.options.poll_interval;
            let limit = self.options.fetch_limit;
            spawned.push(poll::spawn_poller(
                Arc::clone(remote),
                Arc::clone(&self.tasks),
                period,
                limit,
            ));
            spawned.push(poll::spawn_poller(
                Arc::clone(remote),
                Arc::clone(&self.messages),
                period,
                limit,
            ));
        }

        tracing::info!(
            remote = self.remote.is_some(),
            peer = self.peer.is_some(),
            tasks = spawned.len(),
            "sync client started"
        );
        self.background.lock().extend(spawned);
    }

    async fn initial_fetch<T: Record>(&self, remote: &R, sync: &Synchronizer<T>) {
        let mut state = PollState::default();
        let fetch = poll::poll_once(remote, sync, &mut state, self.options.fetch_limit);
        match tokio::time::timeout(self.options.remote_timeout, fetch).await {
            Ok(Ok(changed)) => tracing::debug!(kind = %T::KIND, changed, "initial fetch"),
            Ok(Err(e)) => tracing::warn!(kind = %T::KIND, error = %e, "initial fetch failed"),
            Err(_) => tracing::warn!(kind = %T::KIND, "initial fetch timed out"),
        }
    }

    /// Stops the listeners and pollers. In-flight remote writes keep running.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }

    /// Waits up to `timeout` for in-flight remote writes to finish.
    ///
    /// Returns `true` if none are left.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|waited| waited.is_ok())
    }

    // -- Tasks --

    /// Visible tasks, newest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.get_all()
    }

    /// Visible tasks routed to `role` or to everyone.
    #[must_use]
    pub fn tasks_for_role(&self, role: &str) -> Vec<Task> {
        self.tasks
            .get_all()
            .into_iter()
            .filter(|t| t.is_for_role(role))
            .collect()
    }

    /// Creates a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Empty`] or [`TaskError::TooLong`] for bad text.
    pub fn add_task(
        &self,
        text: &str,
        assignee_label: &str,
        target_role: &str,
        created_by: Option<&str>,
    ) -> Result<Task, TaskError> {
        let text = self.validate_text(text)?;
        let task = Task::new(
            text,
            assignee_label,
            target_role,
            created_by.map(str::to_string),
            Utc::now(),
        );
        self.tasks.upsert(task.clone(), Origin::Local);
        self.publish_upsert(&task);

        if let Some(remote) = &self.remote {
            let row = remote_row(&task);
            let remote = Arc::clone(remote);
            self.spawn_remote("insert task", async move {
                remote.insert(Table::Tasks, row).await.map(drop)
            });
        }
        Ok(task)
    }

    /// Marks a task completed (recording who and when) or reopens it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] for an unknown id.
    pub fn toggle_task(
        &self,
        id: &str,
        completed: bool,
        user_id: Option<&str>,
    ) -> Result<Task, TaskError> {
        let mut task = self.existing_task(id)?;
        task.set_completed(completed, user_id.map(str::to_string), Utc::now());
        self.tasks.upsert(task.clone(), Origin::Local);
        self.publish_upsert(&task);
        self.spawn_task_update(&task, &["completed", "completedAt", "completedBy"]);
        Ok(task)
    }

    /// Replaces a task's text.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for bad text or an unknown id.
    pub fn update_task(&self, id: &str, text: &str) -> Result<Task, TaskError> {
        let text = self.validate_text(text)?;
        let mut task = self.existing_task(id)?;
        task.text = text.to_string();
        self.tasks.upsert(task.clone(), Origin::Local);
        self.publish_upsert(&task);
        self.spawn_task_update(&task, &["text"]);
        Ok(task)
    }

    /// Deletes a task. Returns `false` if no task had this id.
    pub fn delete_task(&self, id: &str) -> bool {
        if !self.tasks.remove(id, Origin::Local) {
            return false;
        }
        self.publish::<Task>(PeerPayload::Delete { id: id.to_string() });
        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let id = id.to_string();
            self.spawn_remote("delete task", async move {
                remote.delete(Table::Tasks, &id).await
            });
        }
        true
    }

    /// Registers `handler` for task changes.
    pub fn subscribe_tasks(
        &self,
        handler: impl Fn(&SyncEvent<Task>) + Send + Sync + 'static,
    ) -> Subscription {
        self.tasks.subscribe(handler)
    }

    fn validate_text<'a>(&self, text: &'a str) -> Result<&'a str, TaskError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TaskError::Empty);
        }
        let max = self.options.max_task_text_len;
        if text.chars().count() > max {
            return Err(TaskError::TooLong { max });
        }
        Ok(text)
    }

    fn existing_task(&self, id: &str) -> Result<Task, TaskError> {
        self.tasks
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    fn spawn_task_update(&self, task: &Task, fields: &[&str]) {
        let Some(remote) = &self.remote else {
            return;
        };
        let patch = match task.to_json() {
            Ok(Value::Object(full)) => {
                let picked: Map<String, Value> = full
                    .into_iter()
                    .filter(|(k, _)| fields.contains(&k.as_str()))
                    .collect();
                rows::for_remote(RecordKind::Tasks, &Value::Object(picked))
            }
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(id = %task.id, error = %e, "task not serializable");
                return;
            }
        };
        let remote = Arc::clone(remote);
        let id = task.id.clone();
        self.spawn_remote("update task", async move {
            remote.update(Table::Tasks, &id, patch).await.map(drop)
        });
    }

    // -- Messages --

    /// The newest messages (up to the history limit), oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        let mut all = self.messages.get_all();
        let excess = all.len().saturating_sub(self.options.history_limit);
        all.drain(..excess);
        all
    }

    /// Sends a message as `sender`; `recipient_id` of `None` addresses the group.
    ///
    /// The message is shown at once under a `local-` id. The remote assigns
    /// the final id, and the confirmed copy replaces the optimistic one.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Empty`] for blank content.
    pub fn send_message(
        &self,
        content: &str,
        sender: &Identity,
        recipient_id: Option<&str>,
        kind: MessageKind,
    ) -> Result<Message, MessageError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MessageError::Empty);
        }
        let message = Message::new_local(
            content,
            Some(sender.user_id.clone()),
            sender.display_name.clone(),
            sender.role.clone(),
            recipient_id.map(str::to_string),
            kind,
            Utc::now(),
        );
        self.messages.upsert(message.clone(), Origin::Local);
        self.publish_upsert(&message);

        if let Some(remote) = &self.remote {
            let mut row = remote_row(&message);
            if let Some(obj) = row.as_object_mut() {
                obj.remove("id");
            }
            let remote = Arc::clone(remote);
            let messages = Arc::clone(&self.messages);
            self.spawn_remote("insert message", async move {
                let stored = remote.insert(Table::Messages, row).await?;
                match <Message as Record>::from_row(&stored, Utc::now()) {
                    Some(confirmed) => {
                        messages.upsert(confirmed, Origin::Remote);
                    }
                    None => tracing::debug!("remote returned a malformed message row"),
                }
                Ok::<(), RemoteError>(())
            });
        }
        Ok(message)
    }

    /// Registers `handler` for message changes.
    pub fn subscribe_messages(
        &self,
        handler: impl Fn(&SyncEvent<Message>) + Send + Sync + 'static,
    ) -> Subscription {
        self.messages.subscribe(handler)
    }

    // -- Transports --

    fn publish<T: Record>(&self, payload: PeerPayload) {
        let Some(peer) = &self.peer else {
            return;
        };
        if let Err(e) = peer.publish(T::KIND.channel(), payload) {
            tracing::warn!(kind = %T::KIND, error = %e, "peer publish failed");
        }
    }

    fn publish_upsert<T: Record>(&self, record: &T) {
        if self.peer.is_none() {
            return;
        }
        match record.to_json() {
            Ok(record) => self.publish::<T>(PeerPayload::Upsert { record }),
            Err(e) => tracing::warn!(kind = %T::KIND, error = %e, "record not serializable"),
        }
    }

    fn spawn_remote<F>(&self, op: &'static str, call: F)
    where
        F: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(op, "no runtime, skipping remote write");
            return;
        };
        let guard = InFlight::enter(&self.in_flight);
        let timeout = self.options.remote_timeout;
        runtime.spawn(async move {
            let _guard = guard;
            let result = tokio::time::timeout(timeout, call)
                .await
                .unwrap_or(Err(RemoteError::Timeout));
            match result {
                Ok(()) => tracing::debug!(op, "remote write done"),
                Err(e) => tracing::warn!(op, error = %e, "remote write failed, keeping local copy"),
            }
        });
    }
}

impl<R: RemoteStore, P: PeerChannel> Drop for SyncClient<R, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<R: RemoteStore, P: PeerChannel> std::fmt::Debug for SyncClient<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("identity", &self.identity)
            .field("remote", &self.remote.is_some())
            .field("peer", &self.peer.is_some())
            .finish_non_exhaustive()
    }
}

/// Counts one in-flight remote write for [`SyncClient::settle`].
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn remote_row<T: Record>(record: &T) -> Value {
    match record.to_json() {
        Ok(json) => rows::for_remote(T::KIND, &json),
        Err(e) => {
            tracing::warn!(kind = %T::KIND, error = %e, "record not serializable");
            Value::Null
        }
    }
}

fn spawn_peer_listener<P: PeerChannel>(
    peer: Arc<P>,
    tasks: Arc<Synchronizer<Task>>,
    messages: Arc<Synchronizer<Message>>,
) -> JoinHandle<()> {
    let mut rx = peer.subscribe();
    tokio::spawn(async move {
        loop {
            let datagram = match rx.recv().await {
                Ok(datagram) => datagram,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "peer listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if datagram.origin == peer.origin() {
                continue;
            }
            match RecordKind::from_channel(&datagram.channel) {
                Some(RecordKind::Tasks) => apply_peer(&tasks, datagram.payload),
                Some(RecordKind::Messages) => apply_peer(&messages, datagram.payload),
                None => {
                    tracing::debug!(channel = %datagram.channel, "ignoring unknown peer channel");
                }
            }
        }
    })
}

fn apply_peer<T: Record>(sync: &Synchronizer<T>, payload: PeerPayload) {
    match payload {
        PeerPayload::Upsert { record } => match T::from_json(&record, Utc::now()) {
            Some(record) => {
                sync.upsert(record, Origin::Peer);
            }
            None => tracing::debug!(kind = %T::KIND, "dropping malformed peer record"),
        },
        PeerPayload::Delete { id } => {
            sync.remove(&id, Origin::Peer);
        }
    }
}

fn spawn_change_listener<T: Record>(
    mut feed: broadcast::Receiver<RemoteChange>,
    sync: Arc<Synchronizer<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(change) => apply_change(&sync, change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(kind = %T::KIND, skipped, "change feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn apply_change<T: Record>(sync: &Synchronizer<T>, change: RemoteChange) {
    match change.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            match change.row.as_ref().and_then(|row| T::from_row(row, Utc::now())) {
                Some(record) => {
                    sync.upsert(record, Origin::Remote);
                }
                None => tracing::debug!(kind = %T::KIND, id = %change.id, "dropping malformed change"),
            }
        }
        ChangeKind::Delete => {
            sync.remove(&change.id, Origin::Remote);
        }
    }
}
