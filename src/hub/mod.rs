use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::metrics::EngineMetrics;
use crate::models::{EngineEvent, SectionId, TrainId};

/// One filter held by a streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    All,
    Train(TrainId),
    Section(SectionId),
}

impl Subscription {
    fn matches(&self, trains: &[TrainId], sections: &[SectionId]) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Train(t) => trains.contains(t),
            Subscription::Section(s) => sections.contains(s),
        }
    }
}

/// Outcome of pushing an event onto a client backlog.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Queued,
    DroppedOldest,
    ConnectionClosed,
}

/// A registered streaming client: its subscription set plus a bounded
/// outbound backlog drained by the transport task.
pub struct ClientConnection {
    pub id: String,
    subscriptions: Mutex<HashSet<Subscription>>,
    backlog: Mutex<VecDeque<EngineEvent>>,
    notify: Notify,
    closed: AtomicBool,
    drops: AtomicU64,
}

impl ClientConnection {
    fn new(id: String, subscriptions: HashSet<Subscription>) -> Self {
        Self {
            id,
            subscriptions: Mutex::new(subscriptions),
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            drops: AtomicU64::new(0),
        }
    }

    pub fn set_subscriptions(&self, subs: HashSet<Subscription>) {
        *self.subscriptions.lock().unwrap() = subs;
    }

    pub fn add_subscription(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap().insert(sub);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn matches(&self, trains: &[TrainId], sections: &[SectionId]) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|sub| sub.matches(trains, sections))
    }

    /// Enqueue for this client. Past the soft limit the oldest queued event is
    /// dropped; a client that keeps overflowing past the hard limit is closed.
    fn push(&self, event: EngineEvent, soft_limit: usize, hard_limit: usize) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::ConnectionClosed;
        }
        let mut backlog = self.backlog.lock().unwrap();
        let mut outcome = PushOutcome::Queued;
        if backlog.len() >= soft_limit {
            backlog.pop_front();
            let dropped = self.drops.fetch_add(1, Ordering::AcqRel) + 1;
            outcome = PushOutcome::DroppedOldest;
            if dropped as usize >= hard_limit {
                drop(backlog);
                self.close();
                return PushOutcome::ConnectionClosed;
            }
        }
        backlog.push_back(event);
        drop(backlog);
        self.notify.notify_one();
        outcome
    }

    /// Next event for the transport; `None` once the connection is closed and
    /// drained.
    pub async fn next_event(&self) -> Option<EngineEvent> {
        loop {
            if let Some(event) = self.backlog.lock().unwrap().pop_front() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap().len()
    }
}

/// Sharded fan-out hub. Events are routed to a shard by their first train
/// (else section) key, so events sharing a key stay on one dispatcher and
/// reach each client in generation order.
pub struct BroadcastHub {
    shards: Vec<mpsc::Sender<EngineEvent>>,
    clients: Arc<RwLock<HashMap<String, Arc<ClientConnection>>>>,
    config: HubConfig,
    metrics: Arc<EngineMetrics>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, metrics: Arc<EngineMetrics>) -> Arc<Self> {
        let clients: Arc<RwLock<HashMap<String, Arc<ClientConnection>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let mut shards = Vec::with_capacity(config.shards);
        for shard_index in 0..config.shards {
            let (tx, rx) = mpsc::channel::<EngineEvent>(1024);
            shards.push(tx);
            tokio::spawn(dispatch_shard(
                shard_index,
                rx,
                clients.clone(),
                config.clone(),
                metrics.clone(),
            ));
        }
        Arc::new(Self {
            shards,
            clients,
            config,
            metrics,
        })
    }

    fn shard_for(&self, event: &EngineEvent) -> usize {
        let (trains, sections) = event.routing_keys();
        let key = trains
            .first()
            .copied()
            .or_else(|| sections.first().copied())
            .unwrap_or(0);
        key as usize % self.shards.len()
    }

    /// Publish an event into the hub. Never blocks the caller; a full shard
    /// queue sheds the event.
    pub fn publish(&self, event: EngineEvent) {
        self.metrics.events_published_total.inc();
        let shard = self.shard_for(&event);
        if let Err(err) = self.shards[shard].try_send(event) {
            warn!("hub shard {} queue full, event shed: {}", shard, err);
        }
    }

    pub async fn register(&self, subscriptions: HashSet<Subscription>) -> Arc<ClientConnection> {
        let id = Uuid::new_v4().to_string();
        let connection = Arc::new(ClientConnection::new(id.clone(), subscriptions));
        self.clients.write().await.insert(id.clone(), connection.clone());
        self.metrics.ws_connections_active.inc();
        info!("client {} registered", id);
        connection
    }

    pub async fn unregister(&self, client_id: &str) {
        if let Some(connection) = self.clients.write().await.remove(client_id) {
            connection.close();
            self.metrics.ws_connections_active.dec();
            info!("client {} unregistered", client_id);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

async fn dispatch_shard(
    shard_index: usize,
    mut rx: mpsc::Receiver<EngineEvent>,
    clients: Arc<RwLock<HashMap<String, Arc<ClientConnection>>>>,
    config: HubConfig,
    metrics: Arc<EngineMetrics>,
) {
    debug!("hub dispatcher {} started", shard_index);
    while let Some(event) = rx.recv().await {
        let (trains, sections) = event.routing_keys();
        let snapshot: Vec<Arc<ClientConnection>> = clients.read().await.values().cloned().collect();
        for client in snapshot {
            if !client.matches(&trains, &sections) {
                continue;
            }
            match client.push(
                event.clone(),
                config.max_client_backlog,
                config.hard_client_backlog,
            ) {
                PushOutcome::Queued => metrics.events_delivered_total.inc(),
                PushOutcome::DroppedOldest => {
                    metrics.events_delivered_total.inc();
                    metrics.backlog_drops_total.inc();
                }
                PushOutcome::ConnectionClosed => {
                    warn!("client {} backlog overflow, connection closed", client.id);
                }
            }
        }
    }
    debug!("hub dispatcher {} stopped", shard_index);
}
