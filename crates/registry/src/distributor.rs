//! Event Distributor: fans events out to peers and converges their acks.
//!
//! Every (event, peer) pair is tracked by one ack. Dispatch claims the acks,
//! per-peer lanes attempt pending ones in log order, and the reaper
//! reschedules failures, skips what can no longer be delivered and collects
//! finished events.

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_bootable::{BootError, Bootable};
use gatehouse_storage::KeyValueStorage;
use gatehouse_topology::{Node, NodeId, PeerDirectory};
use gatehouse_transport::{DeliveryAck, DeliveryOutcome, EventTransport};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DistributorConfig;
use crate::event::later;
use crate::store::{EventLogStore, Stored};
use crate::{AckStatus, ClusterEvent, ClusterEventAck, DeliveryError, Error, Result};

/// What one reaper sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Acks claimed for peers that had none yet.
    pub claimed: usize,
    /// Failed acks moved back to pending.
    pub rescheduled: usize,
    /// Failed acks skipped because their retry budget ran out.
    pub exhausted: usize,
    /// Acks skipped because their event expired.
    pub expired: usize,
    /// Acks skipped because their node left the cluster.
    pub departed: usize,
    /// Events deleted together with their acks.
    pub collected: usize,
}

impl ReapReport {
    /// Whether the sweep changed nothing.
    pub const fn is_empty(&self) -> bool {
        self.claimed == 0
            && self.rescheduled == 0
            && self.exhausted == 0
            && self.expired == 0
            && self.departed == 0
            && self.collected == 0
    }
}

/// Hand-off from the mutation path to the distributor. Never blocks.
#[derive(Clone, Debug)]
pub struct EventIntake {
    tx: mpsc::Sender<ClusterEvent>,
}

impl EventIntake {
    /// Queue `event` for dispatch.
    ///
    /// If the queue is full or the distributor is gone the event stays in
    /// the log and the next reaper sweep claims its acks.
    pub fn submit(&self, event: ClusterEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(event)
                | mpsc::error::TrySendError::Closed(event) => event,
            };
            warn!(
                event_id = event.event_id(),
                "Distributor intake unavailable, leaving event to the reaper"
            );
        }
    }
}

type PairKey = (String, NodeId);

/// Marks an (event, node) pair as being attempted; cleared on drop, which
/// includes cancellation of the attempt.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PairKey>>,
    key: PairKey,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<PairKey>>, event_id: &str, node_id: &NodeId) -> Option<Self> {
        let key = (event_id.to_string(), node_id.clone());
        set.lock().insert(key.clone()).then_some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

struct Inner<S, T, P> {
    log: EventLogStore<S>,
    transport: T,
    peers: P,
    config: DistributorConfig,
    intake: EventIntake,
    intake_rx: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
    lanes: DashMap<NodeId, Arc<Notify>>,
    in_flight: Mutex<HashSet<PairKey>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Background distributor of cluster events to peer nodes.
pub struct EventDistributor<S, T, P> {
    inner: Arc<Inner<S, T, P>>,
}

impl<S, T, P> Clone for EventDistributor<S, T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, T, P> Debug for EventDistributor<S, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDistributor")
            .field("lanes", &self.inner.lanes.len())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("cancelled", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn skipped(ack: &ClusterEventAck, now: DateTime<Utc>, reason: String) -> ClusterEventAck {
    let mut next = ack.clone();
    next.status = AckStatus::Skipped;
    next.process_time = Some(now);
    next.result_message = Some(reason);
    next.next_attempt_at = None;
    next
}

impl<S, T, P> EventDistributor<S, T, P>
where
    S: KeyValueStorage,
    T: EventTransport,
    P: PeerDirectory,
{
    /// Create a distributor over the shared event log in `storage`.
    pub fn new(storage: S, transport: T, peers: P, config: DistributorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.intake_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                log: EventLogStore::new(storage),
                transport,
                peers,
                config,
                intake: EventIntake { tx },
                intake_rx: Mutex::new(Some(rx)),
                lanes: DashMap::new(),
                in_flight: Mutex::new(HashSet::new()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Handle for submitting freshly appended events.
    pub fn intake(&self) -> EventIntake {
        self.inner.intake.clone()
    }

    /// Distributor configuration.
    pub fn config(&self) -> &DistributorConfig {
        &self.inner.config
    }

    /// Whether background tasks are running.
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    async fn peers(&self) -> Vec<Node> {
        let local = self.inner.peers.local_node_id();
        self.inner
            .peers
            .known_peers()
            .await
            .into_iter()
            .filter(|peer| peer.node_id() != local)
            .collect()
    }

    /// Claim a pending ack for every known peer that has none for `event`.
    ///
    /// Returns the peers claimed by this call. Another distributor sharing
    /// the store that claimed first owns that delivery instead.
    #[instrument(skip_all, fields(event_id = event.event_id()))]
    pub async fn dispatch(&self, event: &ClusterEvent) -> Result<Vec<NodeId>> {
        let mut claimed = Vec::new();

        for peer in self.peers().await {
            let ack = ClusterEventAck::pending(event, peer.node_id().clone(), peer.ip());
            if self.inner.log.claim_ack(&ack).await? {
                claimed.push(peer.node_id().clone());
                self.wake(&peer);
            }
        }

        info!(peers = claimed.len(), "Dispatched cluster event");
        Ok(claimed)
    }

    /// Make one delivery attempt of `event` to `target`.
    ///
    /// Terminal acks are left alone and their status returned. A failed ack
    /// is not attempted again until the reaper reschedules it. If the same
    /// pair is already being attempted, this returns `Pending` untouched.
    ///
    /// Fails with [`Error::EventNotFound`] once the event was collected and
    /// with [`Error::AckNotFound`] if it was never dispatched to `target`.
    #[instrument(skip_all, fields(event_id = event.event_id(), node_id = %target.node_id()))]
    pub async fn deliver(&self, event: &ClusterEvent, target: &Node) -> Result<AckStatus> {
        let current = self.current_ack(event, target).await?;
        if current.value.status != AckStatus::Pending {
            debug!(status = %current.value.status, "Nothing to deliver");
            return Ok(current.value.status);
        }

        let Some(_in_flight) =
            InFlight::enter(&self.inner.in_flight, event.event_id(), target.node_id())
        else {
            debug!("Delivery already in flight");
            return Ok(AckStatus::Pending);
        };

        let payload: Bytes = event
            .clone()
            .try_into()
            .map_err(|e: ciborium::ser::Error<std::io::Error>| Error::Codec(e.to_string()))?;

        let outcome = self.attempt(event.event_id(), target, payload).await;
        let now = Utc::now();

        let mut next = current.value.clone();
        next.process_time = Some(now);
        match outcome {
            Ok(ack) => {
                next.status = AckStatus::Success;
                next.next_attempt_at = None;
                next.result_message = Some(match ack.outcome {
                    DeliveryOutcome::AlreadyApplied => "already applied".to_string(),
                    _ => "applied".to_string(),
                });
            }
            Err(e) => {
                next.status = AckStatus::Failed;
                next.retry_count = next.retry_count.saturating_add(1);
                next.next_attempt_at =
                    Some(later(now, self.inner.config.backoff(next.retry_count)));
                next.result_message = Some(e.to_string());
                warn!(retry_count = next.retry_count, "Delivery failed: {e}");
            }
        }

        if self.inner.log.transition_ack(&current, &next).await? {
            return Ok(next.status);
        }

        // Someone else moved the ack first; report what they wrote
        Ok(self
            .inner
            .log
            .get_ack(event.event_id(), target.node_id())
            .await?
            .map_or(next.status, |stored| stored.value.status))
    }

    async fn current_ack(
        &self,
        event: &ClusterEvent,
        target: &Node,
    ) -> Result<Stored<ClusterEventAck>> {
        let log = &self.inner.log;

        if let Some(stored) = log.get_ack(event.event_id(), target.node_id()).await? {
            return Ok(stored);
        }

        // Acks are only claimed by dispatch and the reaper
        if log.get_event(event.event_id()).await?.is_none() {
            return Err(Error::EventNotFound(event.event_id().to_string()));
        }

        Err(Error::AckNotFound {
            event_id: event.event_id().to_string(),
            node_id: target.node_id().clone(),
        })
    }

    async fn attempt(
        &self,
        event_id: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<DeliveryAck, DeliveryError> {
        let timeout = self.inner.config.delivery_timeout;

        let ack = tokio::time::timeout(
            timeout,
            self.inner.transport.deliver(event_id, target, payload),
        )
        .await
        .map_err(|_| DeliveryError::Timeout(timeout))??;

        match &ack.outcome {
            DeliveryOutcome::Rejected { reason } => Err(DeliveryError::Rejected(reason.clone())),
            DeliveryOutcome::Applied | DeliveryOutcome::AlreadyApplied => Ok(ack),
        }
    }

    /// Attempt every due pending ack addressed to `peer`.
    ///
    /// Acks are taken per source node in log order, and a source stops at
    /// its first ack that does not end in success, so a peer never sees an
    /// event before an earlier event from the same source. Returns the
    /// number of successful deliveries.
    pub async fn deliver_pending(&self, peer: &Node) -> Result<usize> {
        let now = Utc::now();

        let mut acks: Vec<ClusterEventAck> = self
            .inner
            .log
            .list_all_acks()
            .await?
            .into_iter()
            .map(|stored| stored.value)
            .filter(|ack| ack.node_id == *peer.node_id() && !ack.status.is_terminal())
            .collect();
        acks.sort_by(|a, b| {
            a.source_node_id
                .cmp(&b.source_node_id)
                .then(a.event_sequence.cmp(&b.event_sequence))
        });

        let mut held: HashSet<NodeId> = HashSet::new();
        let mut delivered = 0;

        for ack in acks {
            if held.contains(&ack.source_node_id) {
                continue;
            }
            if ack.status != AckStatus::Pending || !ack.is_due(now) {
                held.insert(ack.source_node_id);
                continue;
            }

            let Some(event) = self.inner.log.get_event(&ack.event_id).await? else {
                continue;
            };
            if event.is_expired(now) {
                held.insert(ack.source_node_id);
                continue;
            }

            match self.deliver(&event, peer).await {
                Ok(AckStatus::Success) => delivered += 1,
                Ok(_) => {
                    held.insert(ack.source_node_id);
                }
                Err(Error::EventNotFound(_) | Error::AckNotFound { .. }) => {
                    debug!(event_id = %ack.event_id, "Event collected during delivery");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(delivered)
    }

    /// One sweep over the event log.
    ///
    /// Claims acks for peers that joined after an event was dispatched,
    /// reschedules failed acks whose backoff elapsed, skips acks that are
    /// out of retries, expired or addressed to departed nodes, and deletes
    /// events whose acks are all terminal.
    pub async fn reap(&self) -> Result<ReapReport> {
        let now = Utc::now();
        let peers = self.peers().await;
        let known: HashSet<&NodeId> = peers.iter().map(Node::node_id).collect();
        let log = &self.inner.log;
        let max_retries = self.inner.config.max_retries;

        let mut report = ReapReport::default();

        for event in log.list_events(None).await? {
            let expired = event.is_expired(now);

            if !expired {
                for peer in &peers {
                    let ack = ClusterEventAck::pending(&event, peer.node_id().clone(), peer.ip());
                    if log.claim_ack(&ack).await? {
                        report.claimed += 1;
                    }
                }
            }

            let mut all_terminal = true;

            for stored in log.list_acks(event.event_id()).await? {
                let ack = &stored.value;
                if ack.status.is_terminal() {
                    continue;
                }

                let next = if expired {
                    report.expired += 1;
                    Some(skipped(ack, now, "event expired before acknowledgment".to_string()))
                } else if !known.contains(&ack.node_id) {
                    report.departed += 1;
                    Some(skipped(ack, now, "node left the cluster".to_string()))
                } else if ack.status == AckStatus::Failed && ack.retry_count >= max_retries {
                    let exhausted = DeliveryError::RetryExhausted {
                        event_id: ack.event_id.clone(),
                        node_id: ack.node_id.clone(),
                        retries: ack.retry_count,
                    };
                    warn!("{exhausted}");
                    report.exhausted += 1;
                    Some(skipped(ack, now, exhausted.to_string()))
                } else if ack.status == AckStatus::Failed && ack.is_due(now) {
                    report.rescheduled += 1;
                    let mut next = ack.clone();
                    next.status = AckStatus::Pending;
                    Some(next)
                } else {
                    None
                };

                match next {
                    Some(next) if log.transition_ack(&stored, &next).await? => {
                        all_terminal &= next.status.is_terminal();
                    }
                    _ => all_terminal = false,
                }
            }

            if all_terminal {
                let acks = log.delete_event(event.event_id()).await?;
                debug!(event_id = event.event_id(), acks, "Collected cluster event");
                report.collected += 1;
            }
        }

        for peer in &peers {
            self.wake(peer);
        }

        Ok(report)
    }

    fn wake(&self, peer: &Node) {
        if !self.is_running() {
            return;
        }

        let notify = match self.inner.lanes.entry(peer.node_id().clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(Arc::clone(&notify));

                let lane = self.clone();
                let node_id = peer.node_id().clone();
                let signal = Arc::clone(&notify);
                let handle = tokio::spawn(async move { lane.run_lane(node_id, signal).await });
                self.inner.tasks.lock().push(handle);

                debug!(node_id = %peer.node_id(), "Started delivery lane");
                notify
            }
        };

        notify.notify_one();
    }

    async fn run_lane(self, node_id: NodeId, notify: Arc<Notify>) {
        let shutdown = self.inner.shutdown.clone();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = notify.notified() => {}
            }

            let Some(peer) = self
                .inner
                .peers
                .known_peers()
                .await
                .into_iter()
                .find(|peer| *peer.node_id() == node_id)
            else {
                debug!(%node_id, "Lane woken for unknown peer");
                continue;
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.deliver_pending(&peer) => match result {
                    Ok(0) => {}
                    Ok(delivered) => debug!(%node_id, delivered, "Lane drained"),
                    Err(e) => error!(%node_id, "Lane failed: {e}"),
                },
            }
        }

        debug!(%node_id, "Delivery lane stopped");
    }

    async fn run_intake(self, mut rx: mpsc::Receiver<ClusterEvent>) {
        let shutdown = self.inner.shutdown.clone();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = rx.recv() => {
                    let Some(event) = received else { break };
                    if let Err(e) = self.dispatch(&event).await {
                        error!(event_id = event.event_id(), "Dispatch failed: {e}");
                    }
                }
            }
        }
    }

    async fn run_reaper(self) {
        let shutdown = self.inner.shutdown.clone();
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Cancelling mid-sweep is safe: every ack write is a single CAS
            tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.reap() => match result {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => info!(?report, "Reaper sweep"),
                    Err(e) => error!("Reaper sweep failed: {e}"),
                },
            }
        }
    }
}

#[async_trait]
impl<S, T, P> Bootable for EventDistributor<S, T, P>
where
    S: KeyValueStorage,
    T: EventTransport,
    P: PeerDirectory,
{
    fn name(&self) -> &str {
        "event-distributor"
    }

    async fn start(&self) -> Result<(), BootError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err("event distributor already started".into());
        }

        let rx = self
            .inner
            .intake_rx
            .lock()
            .take()
            .ok_or("event distributor intake already consumed")?;

        let intake = tokio::spawn(self.clone().run_intake(rx));
        let reaper = tokio::spawn(self.clone().run_reaper());
        self.inner.tasks.lock().extend([intake, reaper]);

        // Lanes pick up whatever a previous run left pending
        for peer in self.peers().await {
            self.wake(&peer);
        }

        info!("Event distributor started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootError> {
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Distributor task ended abnormally: {e}");
            }
        }

        info!("Event distributor stopped");
        Ok(())
    }

    async fn wait(&self) {
        self.inner.shutdown.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use gatehouse_storage::WriteBatch;
    use gatehouse_storage_memory::MemoryStorage;
    use gatehouse_topology::TopologyManager;
    use gatehouse_topology_mock::MockTopologyAdaptor;
    use gatehouse_transport::DeliveryHandler;
    use gatehouse_transport_memory::{MemoryNetwork, MemoryTransport, PeerFault};

    use crate::{EventDraft, EventPayload, EventSource};

    type Peers = Arc<TopologyManager<MockTopologyAdaptor>>;
    type TestDistributor = EventDistributor<MemoryStorage, MemoryTransport, Peers>;

    /// Records the order in which events arrive.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, _sender: &NodeId, event_id: &str, _payload: Bytes) -> DeliveryOutcome {
            let mut seen = self.seen.lock();
            if seen.iter().any(|id| id == event_id) {
                return DeliveryOutcome::AlreadyApplied;
            }
            seen.push(event_id.to_string());
            DeliveryOutcome::Applied
        }
    }

    struct Harness {
        storage: MemoryStorage,
        network: MemoryNetwork,
        adaptor: MockTopologyAdaptor,
        peers: Peers,
        distributor: TestDistributor,
        recorders: Vec<Arc<Recorder>>,
    }

    fn node(addr: &str) -> Node {
        Node::new(addr.parse().unwrap(), "10.0.0.1")
    }

    fn config() -> DistributorConfig {
        DistributorConfig {
            retry_base_delay: Duration::ZERO,
            ..DistributorConfig::default()
        }
    }

    async fn harness(peer_addrs: &[&str]) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let local = node("node-a:9090");
        let mut nodes = vec![local.clone()];
        nodes.extend(peer_addrs.iter().map(|addr| node(addr)));

        let adaptor = MockTopologyAdaptor::new(nodes.clone());
        let peers = Arc::new(TopologyManager::new(
            Arc::new(adaptor.clone()),
            local.node_id().clone(),
        ));
        peers.refresh_topology().await.unwrap();

        let network = MemoryNetwork::new();
        let mut recorders = Vec::new();
        for peer in &nodes[1..] {
            let recorder = Arc::new(Recorder::default());
            network.register(peer.node_id().clone(), recorder.clone());
            recorders.push(recorder);
        }

        let storage = MemoryStorage::new();
        let distributor = EventDistributor::new(
            storage.clone(),
            network.transport(local.node_id().clone()),
            Arc::clone(&peers),
            config(),
        );

        Harness {
            storage,
            network,
            adaptor,
            peers,
            distributor,
            recorders,
        }
    }

    async fn append(
        storage: &MemoryStorage,
        sequence: u64,
        event_time: DateTime<Utc>,
        expire_time: Option<DateTime<Utc>>,
    ) -> ClusterEvent {
        let event = ClusterEvent::new(EventDraft {
            sequence,
            tenant_id: "t1".to_string(),
            source_node_id: "node-a:9090".parse().unwrap(),
            source_node_ip: "10.0.0.1".to_string(),
            origin: EventSource::Internal,
            payload: EventPayload::GroupDeleted {
                service_group_id: format!("GRP{sequence}"),
                group_name: format!("group-{sequence}"),
                version: 2,
                physical: false,
            },
            event_time,
            expire_time,
        })
        .unwrap();

        let mut batch = WriteBatch::new();
        EventLogStore::new(storage.clone())
            .stage_append(&mut batch, &event)
            .unwrap();
        storage.commit(batch).await.unwrap();

        event
    }

    async fn ack(h: &Harness, event: &ClusterEvent, addr: &str) -> ClusterEventAck {
        EventLogStore::new(h.storage.clone())
            .get_ack(event.event_id(), &addr.parse().unwrap())
            .await
            .unwrap()
            .unwrap()
            .value
    }

    #[tokio::test]
    async fn test_dispatch_claims_each_peer_once() {
        let h = harness(&["node-b:9090", "node-c:9090"]).await;
        let event = append(&h.storage, 1, Utc::now(), None).await;

        let claimed = h.distributor.dispatch(&event).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(!claimed.contains(h.peers.local_node_id()));

        // A second dispatcher sharing the log finds every pair taken
        assert!(h.distributor.dispatch(&event).await.unwrap().is_empty());

        let b = ack(&h, &event, "node-b:9090").await;
        assert_eq!(b.status, AckStatus::Pending);
        assert_eq!(b.event_sequence, 1);
    }

    #[tokio::test]
    async fn test_deliver_after_success_is_noop() {
        let h = harness(&["node-b:9090"]).await;
        let event = append(&h.storage, 1, Utc::now(), None).await;
        let peer = node("node-b:9090");

        h.distributor.dispatch(&event).await.unwrap();
        assert_eq!(
            h.distributor.deliver(&event, &peer).await.unwrap(),
            AckStatus::Success
        );
        assert_eq!(
            h.distributor.deliver(&event, &peer).await.unwrap(),
            AckStatus::Success
        );

        let stored = ack(&h, &event, "node-b:9090").await;
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.result_message.as_deref(), Some("applied"));
        assert_eq!(h.network.attempts(peer.node_id()), 1);
        assert_eq!(h.recorders[0].seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_peer_exhausts_retries() {
        let h = harness(&["node-b:9090", "node-c:9090"]).await;
        let event = append(&h.storage, 1, Utc::now(), None).await;
        let slow = node("node-b:9090");
        h.network.set_fault(slow.node_id(), PeerFault::Unresponsive);

        h.distributor.dispatch(&event).await.unwrap();

        for attempt in 1..=5 {
            assert_eq!(
                h.distributor.deliver(&event, &slow).await.unwrap(),
                AckStatus::Failed
            );
            assert_eq!(ack(&h, &event, "node-b:9090").await.retry_count, attempt);

            let report = h.distributor.reap().await.unwrap();
            if attempt < 5 {
                assert_eq!(report.rescheduled, 1);
            } else {
                assert_eq!(report.exhausted, 1);
            }
        }

        let exhausted = ack(&h, &event, "node-b:9090").await;
        assert_eq!(exhausted.status, AckStatus::Skipped);
        assert_eq!(exhausted.retry_count, 5);

        // node-c is still pending, so the event stays in the log
        assert_eq!(h.distributor.reap().await.unwrap().collected, 0);

        h.distributor
            .deliver(&event, &node("node-c:9090"))
            .await
            .unwrap();
        assert_eq!(h.distributor.reap().await.unwrap().collected, 1);
    }

    #[tokio::test]
    async fn test_expired_event_skipped_then_collected() {
        let h = harness(&["node-b:9090", "node-c:9090"]).await;
        let now = Utc::now();
        let event = append(
            &h.storage,
            1,
            now - TimeDelta::hours(2),
            Some(now - TimeDelta::hours(1)),
        )
        .await;
        h.distributor.dispatch(&event).await.unwrap();

        let report = h.distributor.reap().await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.collected, 1);

        let log = EventLogStore::new(h.storage.clone());
        assert!(log.get_event(event.event_id()).await.unwrap().is_none());
        assert!(log.list_acks(event.event_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_order_held_behind_failure() {
        let h = harness(&["node-b:9090"]).await;
        let peer = node("node-b:9090");
        let first = append(&h.storage, 1, Utc::now(), None).await;
        let second = append(&h.storage, 2, Utc::now(), None).await;
        h.distributor.dispatch(&first).await.unwrap();
        h.distributor.dispatch(&second).await.unwrap();

        h.network
            .set_fault(peer.node_id(), PeerFault::Reject("busy".to_string()));
        assert_eq!(h.distributor.deliver_pending(&peer).await.unwrap(), 0);

        assert_eq!(ack(&h, &first, "node-b:9090").await.status, AckStatus::Failed);
        let held = ack(&h, &second, "node-b:9090").await;
        assert_eq!(held.status, AckStatus::Pending);
        assert_eq!(held.retry_count, 0);

        h.network.set_fault(peer.node_id(), PeerFault::Healthy);
        assert_eq!(h.distributor.reap().await.unwrap().rescheduled, 1);
        assert_eq!(h.distributor.deliver_pending(&peer).await.unwrap(), 2);

        assert_eq!(
            *h.recorders[0].seen.lock(),
            vec![first.event_id().to_string(), second.event_id().to_string()]
        );
    }

    #[tokio::test]
    async fn test_membership_changes() {
        let h = harness(&["node-b:9090", "node-c:9090"]).await;
        let event = append(&h.storage, 1, Utc::now(), None).await;
        h.distributor.dispatch(&event).await.unwrap();

        h.adaptor.remove_node(&"node-c:9090".parse().unwrap()).unwrap();
        h.adaptor.add_node(node("node-d:9090")).unwrap();
        h.peers.refresh_topology().await.unwrap();

        let report = h.distributor.reap().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.departed, 1);

        let gone = ack(&h, &event, "node-c:9090").await;
        assert_eq!(gone.status, AckStatus::Skipped);
        assert_eq!(gone.result_message.as_deref(), Some("node left the cluster"));
        assert_eq!(
            ack(&h, &event, "node-d:9090").await.status,
            AckStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_deliver_never_claims() {
        let h = harness(&["node-b:9090", "node-c:9090"]).await;
        let event = append(&h.storage, 1, Utc::now(), None).await;
        let peer = node("node-b:9090");
        let log = EventLogStore::new(h.storage.clone());

        assert_matches!(
            h.distributor.deliver(&event, &peer).await,
            Err(Error::AckNotFound { node_id, .. }) if node_id == *peer.node_id()
        );
        assert!(log.list_all_acks().await.unwrap().is_empty());
        assert_eq!(h.network.attempts(peer.node_id()), 0);

        h.distributor.dispatch(&event).await.unwrap();
        h.distributor.deliver(&event, &peer).await.unwrap();
        h.distributor
            .deliver(&event, &node("node-c:9090"))
            .await
            .unwrap();
        assert_eq!(h.distributor.reap().await.unwrap().collected, 1);

        // Redelivery of a collected event leaves nothing behind
        assert_matches!(
            h.distributor.deliver(&event, &peer).await,
            Err(Error::EventNotFound(id)) if id == event.event_id()
        );
        assert_eq!(h.network.attempts(peer.node_id()), 1);
        assert!(log.list_all_acks().await.unwrap().is_empty());
        assert!(h.distributor.reap().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_delivery_keeps_ack_pending() {
        let h = harness(&["node-b:9090"]).await;
        let peer = node("node-b:9090");
        h.network.set_fault(peer.node_id(), PeerFault::Unresponsive);

        let config = DistributorConfig {
            delivery_timeout: Duration::from_secs(3600),
            ..config()
        };
        let running = |config: DistributorConfig| {
            EventDistributor::new(
                h.storage.clone(),
                h.network.transport("node-a:9090".parse().unwrap()),
                Arc::clone(&h.peers),
                config,
            )
        };

        let first = running(config.clone());
        first.start().await.unwrap();
        let event = append(&h.storage, 1, Utc::now(), None).await;
        first.intake().submit(event.clone());

        while h.network.attempts(peer.node_id()) == 0 {
            tokio::task::yield_now().await;
        }
        first.shutdown().await.unwrap();

        let interrupted = ack(&h, &event, "node-b:9090").await;
        assert_eq!(interrupted.status, AckStatus::Pending);
        assert_eq!(interrupted.retry_count, 0);
        assert_eq!(interrupted.process_time, None);

        h.network.set_fault(peer.node_id(), PeerFault::Healthy);
        let second = running(config);
        second.start().await.unwrap();

        for _ in 0..100 {
            if ack(&h, &event, "node-b:9090").await.status == AckStatus::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        second.shutdown().await.unwrap();

        assert_eq!(
            ack(&h, &event, "node-b:9090").await.status,
            AckStatus::Success
        );
        assert_eq!(
            *h.recorders[0].seen.lock(),
            vec![event.event_id().to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(&["node-b:9090"]).await;

        h.distributor.start().await.unwrap();
        assert!(h.distributor.is_running());
        assert!(h.distributor.start().await.is_err());

        h.distributor.shutdown().await.unwrap();
        assert!(!h.distributor.is_running());
        h.distributor.wait().await;
    }
}
