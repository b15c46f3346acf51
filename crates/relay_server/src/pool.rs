//! Pool of warm upstream connections.
//!
//! Connections are grouped by origin endpoint. The pool is *warm* once its
//! largest group holds `ready_threshold` open connections; only that group
//! serves allocations. Every lost connection is replaced, and every failed
//! spawn is retried once after a constant delay.
//!
//! The pool never holds more than `max_connections` live sockets. A cold pool
//! at that cap makes room by closing an idle connection on another endpoint
//! than the one discovery just returned, so growth can still converge on a
//! single group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agar_protocol::ProtocolCodec;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, UpstreamConfig};
use crate::discovery::Discovery;
use crate::error::RelayError;
use crate::transport::Connector;
use crate::upstream::{ConnectionId, PoolNotice, SessionLink, SocketState, UpstreamConnection, UpstreamEvent};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Result of one [`ConnectionPool::grow_toward_ready`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrowOutcome {
    /// The largest group already meets the threshold; nothing was spawned.
    Warm,
    /// The connection cap is reached and no idle connection could make room;
    /// nothing was spawned.
    AtCapacity,
    /// Another caller is already growing the pool.
    InProgress,
    /// One connection was opened and added.
    Spawned {
        id: ConnectionId,
        origin_endpoint: String,
        /// Connection closed to stay under the cap
        evicted: Option<ConnectionId>,
        /// Whether the pool is warm after this spawn
        warm: bool,
    },
}

/// Size and occupancy of one endpoint group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub origin_endpoint: String,
    pub open: usize,
    pub busy: usize,
}

/// Point-in-time view of the pool, for health logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub groups: Vec<GroupStatus>,
    pub total: usize,
    pub free: usize,
    pub busy: usize,
    pub warm: bool,
    pub retry_pending: bool,
}

/// Clears the pool's growth flag when dropped.
struct GrowthGuard<'a>(&'a AtomicBool);

impl<'a> GrowthGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for GrowthGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Manages the upstream connections shared by all client sessions.
pub struct ConnectionPool {
    config: PoolConfig,
    upstream: UpstreamConfig,
    codec: ProtocolCodec,
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn Connector>,

    /// Insertion-ordered; only connections that completed their handshake
    connections: Mutex<Vec<Arc<UpstreamConnection>>>,
    next_id: AtomicU64,
    retry_pending: AtomicBool,
    stopped: AtomicBool,

    /// Set while one caller is growing; others back off
    growing: AtomicBool,

    events: broadcast::Sender<UpstreamEvent>,
    notice_tx: mpsc::UnboundedSender<PoolNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolNotice>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        upstream: UpstreamConfig,
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            codec: upstream.codec(),
            config,
            upstream,
            discovery,
            connector,
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            retry_pending: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            growing: AtomicBool::new(false),
            events,
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn connections(&self) -> MutexGuard<'_, Vec<Arc<UpstreamConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Open connections grouped by endpoint, groups and members in insertion
    /// order.
    fn groups(&self) -> Vec<(String, Vec<Arc<UpstreamConnection>>)> {
        let mut groups: Vec<(String, Vec<Arc<UpstreamConnection>>)> = Vec::new();
        for connection in self.connections().iter() {
            if connection.state() != SocketState::Open {
                continue;
            }
            match groups
                .iter_mut()
                .find(|(endpoint, _)| endpoint == connection.origin_endpoint())
            {
                Some((_, members)) => members.push(Arc::clone(connection)),
                None => groups.push((connection.origin_endpoint().to_string(), vec![Arc::clone(connection)])),
            }
        }
        groups
    }

    /// The largest group; the earliest-inserted group wins ties.
    fn largest_group(&self) -> Option<(String, Vec<Arc<UpstreamConnection>>)> {
        let mut largest: Option<(String, Vec<Arc<UpstreamConnection>>)> = None;
        for group in self.groups() {
            if largest.as_ref().map_or(true, |(_, members)| group.1.len() > members.len()) {
                largest = Some(group);
            }
        }
        largest
    }

    pub fn is_warm(&self) -> bool {
        self.largest_group()
            .is_some_and(|(_, members)| members.len() >= self.config.ready_threshold)
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::SeqCst)
    }

    fn live_count(&self) -> usize {
        self.connections()
            .iter()
            .filter(|connection| !connection.state().is_terminal())
            .count()
    }

    fn maintenance_running(&self) -> bool {
        self.notice_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// An idle connection outside `keep_endpoint`, taken from the smallest
    /// other group, oldest first.
    fn eviction_candidate(&self, keep_endpoint: &str) -> Option<Arc<UpstreamConnection>> {
        self.groups()
            .into_iter()
            .filter(|(endpoint, members)| {
                endpoint != keep_endpoint && members.iter().any(|connection| !connection.in_use())
            })
            .min_by_key(|(_, members)| members.len())
            .and_then(|(_, members)| members.into_iter().find(|connection| !connection.in_use()))
    }

    fn evict(&self, victim: &UpstreamConnection) {
        self.remove(victim.id());
        victim.close();
        info!(
            "♻️ Closed idle upstream {} to {} to make room",
            victim.id(),
            victim.origin_endpoint()
        );
    }

    /// Adds at most one connection toward warmth.
    ///
    /// Does nothing if the pool is already warm or another caller is
    /// growing it. Otherwise asks discovery for a target, opens one
    /// connection to it and adds it to the pool. At the connection cap an
    /// idle connection on a different endpoint is closed first; when none
    /// exists the pool reports [`GrowOutcome::AtCapacity`].
    ///
    /// # Errors
    ///
    /// Discovery and handshake failures. Each failure schedules a single
    /// retry after `retry_delay`; a retry that is already pending is not
    /// duplicated.
    pub async fn grow_toward_ready(self: &Arc<Self>) -> Result<GrowOutcome, RelayError> {
        let Some(_growth) = GrowthGuard::acquire(&self.growing) else {
            debug!("Pool growth already in progress");
            return Ok(GrowOutcome::InProgress);
        };

        if self.is_warm() {
            return Ok(GrowOutcome::Warm);
        }
        // With a single endpoint group, closing a member never helps.
        let at_capacity = self.live_count() >= self.config.max_connections;
        if at_capacity && self.groups().len() <= 1 {
            debug!("Pool at capacity ({} connections)", self.config.max_connections);
            return Ok(GrowOutcome::AtCapacity);
        }

        let target = match self.discovery.discover().await {
            Ok(target) => target,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                self.schedule_retry();
                return Err(e);
            }
        };

        let evicted = if at_capacity {
            match self.eviction_candidate(&target.origin_endpoint) {
                Some(victim) => {
                    self.evict(&victim);
                    Some(victim.id())
                }
                None => {
                    // Every other endpoint is serving a session; try again once one frees up.
                    debug!("Pool at capacity with no idle connection to close");
                    self.schedule_retry();
                    return Ok(GrowOutcome::AtCapacity);
                }
            }
        } else {
            None
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(UpstreamConnection::new(
            id,
            target.origin_endpoint,
            target.join_code,
            self.codec.clone(),
            self.events.clone(),
            self.notice_tx.clone(),
        ));

        if let Err(e) = connection
            .open(self.connector.as_ref(), self.upstream.handshake_timeout)
            .await
        {
            warn!("Upstream {} to {} failed to open: {}", id, connection.origin_endpoint(), e);
            self.schedule_retry();
            return Err(e);
        }

        let inserted = {
            let mut connections = self.connections();
            if connection.state() == SocketState::Open {
                connections.push(Arc::clone(&connection));
                true
            } else {
                false
            }
        };
        if !inserted {
            self.schedule_retry();
            return Err(RelayError::HandshakeFailure(format!(
                "upstream {} closed before joining the pool",
                id
            )));
        }

        let warm = self.is_warm();
        if warm {
            info!("🔥 Pool warm on {}", connection.origin_endpoint());
        }
        Ok(GrowOutcome::Spawned {
            id,
            origin_endpoint: connection.origin_endpoint().to_string(),
            evicted,
            warm,
        })
    }

    /// Grows until warm, at capacity, or a spawn fails.
    ///
    /// Returns whether the pool ended up warm. A failure has already
    /// scheduled its retry when it is returned. Replacing connections at the
    /// cap is limited to `max_connections` spawns per call; past that the
    /// pool waits for its retry instead of churning.
    pub async fn warm_up(self: &Arc<Self>) -> Result<bool, RelayError> {
        let mut rotations = 0;
        loop {
            match self.grow_toward_ready().await? {
                GrowOutcome::Warm | GrowOutcome::Spawned { warm: true, .. } => return Ok(true),
                GrowOutcome::InProgress => return Ok(self.is_warm()),
                GrowOutcome::AtCapacity => {
                    warn!("Pool reached {} connections without warming", self.config.max_connections);
                    return Ok(false);
                }
                GrowOutcome::Spawned { evicted: Some(_), .. } => {
                    rotations += 1;
                    if rotations >= self.config.max_connections {
                        warn!("Pool still cold after replacing {} connections", rotations);
                        self.schedule_retry();
                        return Ok(false);
                    }
                }
                GrowOutcome::Spawned { .. } => continue,
            }
        }
    }

    /// Runs `warm_up` once after `retry_delay`.
    ///
    /// The maintenance task runs it when the pool is started; otherwise the
    /// timer task runs it directly.
    fn schedule_retry(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            debug!("Retry already pending");
            return;
        }

        let delay = self.config.retry_delay;
        info!("🔁 Retrying upstream spawn in {:?}", delay);

        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.retry_pending.store(false, Ordering::SeqCst);

            if pool.stopped.load(Ordering::SeqCst) {
                return;
            }
            if pool.maintenance_running() {
                let _ = pool.notice_tx.send(PoolNotice::RetryDue);
            } else if let Err(e) = pool.warm_up().await {
                warn!("Retry failed: {}", e);
            }
        });
        self.track(task.abort_handle());
    }

    /// Binds `link` to the first free open connection of the largest group.
    ///
    /// Returns `None` while the pool is cold or when every connection of the
    /// group is busy.
    pub fn allocate(&self, link: SessionLink) -> Option<Arc<UpstreamConnection>> {
        let session_id = link.session_id;

        let Some((endpoint, members)) = self.largest_group() else {
            warn!("Session {} found the pool empty", session_id);
            return None;
        };
        if members.len() < self.config.ready_threshold {
            warn!(
                "Session {} found the pool cold ({}/{} on {})",
                session_id,
                members.len(),
                self.config.ready_threshold,
                endpoint
            );
            return None;
        }

        for connection in members {
            if connection.try_bind(link.clone()) {
                info!("Session {} bound to upstream {}", session_id, connection.id());
                return Some(connection);
            }
        }

        warn!("Session {}: every upstream on {} is busy", session_id, endpoint);
        None
    }

    /// Unbinds whatever session holds `connection`. The socket stays open.
    pub fn release(&self, connection: &UpstreamConnection) {
        if connection.unbind() {
            debug!("Upstream {} released", connection.id());
        }
    }

    /// Spawns the maintenance task.
    ///
    /// It warms the pool once, then replaces each lost connection and runs
    /// each due retry. Calling `start` twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(mut notices) = self
            .notice_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("Connection pool already started");
            return;
        };

        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(e) = pool.warm_up().await {
                warn!("Initial warm-up failed: {}", e);
            }

            while let Some(notice) = notices.recv().await {
                match notice {
                    PoolNotice::Lost { id, state } => {
                        pool.remove(id);
                        info!("Replacing upstream {} ({:?})", id, state);
                    }
                    PoolNotice::RetryDue => debug!("Running scheduled retry"),
                }

                if let Err(e) = pool.warm_up().await {
                    warn!("Warm-up failed: {}", e);
                }
            }
        });
        self.track(task.abort_handle());
        info!("🏊 Connection pool started");
    }

    fn remove(&self, id: ConnectionId) {
        self.connections().retain(|connection| connection.id() != id);
    }

    /// Receiver for every decoded upstream message.
    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PoolStatus {
        let groups: Vec<GroupStatus> = self
            .groups()
            .into_iter()
            .map(|(origin_endpoint, members)| GroupStatus {
                open: members.len(),
                busy: members.iter().filter(|connection| connection.in_use()).count(),
                origin_endpoint,
            })
            .collect();

        let total: usize = groups.iter().map(|group| group.open).sum();
        let busy: usize = groups.iter().map(|group| group.busy).sum();

        PoolStatus {
            warm: groups
                .iter()
                .any(|group| group.open >= self.config.ready_threshold),
            groups,
            total,
            free: total - busy,
            busy,
            retry_pending: self.retry_pending(),
        }
    }

    /// Open connection counts per endpoint.
    pub fn group_sizes(&self) -> HashMap<String, usize> {
        self.groups()
            .into_iter()
            .map(|(endpoint, members)| (endpoint, members.len()))
            .collect()
    }

    /// Connections in insertion order.
    pub fn connections_snapshot(&self) -> Vec<Arc<UpstreamConnection>> {
        self.connections().clone()
    }

    /// Stops maintenance and pending retries, then closes every connection.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }

        let connections: Vec<_> = self.connections().drain(..).collect();
        let count = connections.len();
        for connection in connections {
            connection.close();
        }

        info!("Connection pool stopped, closed {} upstream connection(s)", count);
    }
}
