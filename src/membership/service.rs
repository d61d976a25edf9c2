use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use super::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;

pub struct MembershipService {
    pub local_node: Node,
    pub cluster_name: String,
    pub members: Arc<DashMap<NodeId, Node>>,
    /// `None` for detached services (embedded clusters) that learn membership
    /// from their host instead of gossip.
    socket: Option<Arc<UdpSocket>>,
    incarnation: Arc<RwLock<u64>>,
    version: AtomicU64,
    publish_lock: Mutex<()>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        cluster_name: &str,
        node_id: Option<NodeId>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let local_node = Node::new(node_id.unwrap_or_default(), local_addr);

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            for seed_node in seed_nodes.iter() {
                let msg = GossipMessage::Join {
                    cluster_name: cluster_name.to_string(),
                    node: local_node.clone(),
                };

                let encoded = bincode::serialize(&msg)?;
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        Ok(Arc::new(Self::build(
            local_node,
            cluster_name,
            Some(Arc::new(socket)),
        )))
    }

    /// A membership service without a gossip socket. Peers are admitted and removed
    /// explicitly through [`admit`](Self::admit) and [`mark_dead`](Self::mark_dead).
    pub fn detached(local_node: Node, cluster_name: &str) -> Arc<Self> {
        Arc::new(Self::build(local_node, cluster_name, None))
    }

    fn build(local_node: Node, cluster_name: &str, socket: Option<Arc<UdpSocket>>) -> Self {
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            incarnation: Arc::new(RwLock::new(local_node.incarnation)),
            local_node,
            cluster_name: cluster_name.to_string(),
            members,
            socket,
            version: AtomicU64::new(1),
            publish_lock: Mutex::new(()),
            events,
        }
    }

    pub async fn start(self: Arc<Self>) {
        if self.socket.is_none() {
            tracing::debug!("Detached membership service, no gossip loops started");
            return;
        }
        tracing::info!("Starting membership service...");

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_alive(&self, id: &NodeId) -> bool {
        self.members
            .get(id)
            .map(|entry| entry.value().state == NodeState::Alive)
            .unwrap_or(false)
    }

    /// Sorted ids of every alive member, local node included.
    pub fn live_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .get_alive_members()
            .into_iter()
            .map(|node| node.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// The membership view right now, tagged with the current version.
    pub fn current_event(&self) -> MembershipEvent {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        MembershipEvent {
            version: self.current_version(),
            live_nodes: self.live_node_ids(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn publish_change(&self) {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let event = MembershipEvent {
            version,
            live_nodes: self.live_node_ids(),
        };
        tracing::info!(
            version,
            live = event.live_nodes.len(),
            "Membership changed"
        );
        // Sent before the partition director subscribes, the event has no receiver;
        // `current_event` still reports it.
        let _ = self.events.send(event);
    }

    /// Adds (or revives) a member. Publishes a membership event when the set of
    /// live nodes changed.
    pub fn admit(&self, mut node: Node) {
        node.last_seen = Some(Instant::now());
        let changed = match self.members.get_mut(&node.id) {
            Some(mut existing) => {
                let revived = existing.state != NodeState::Alive && node.is_alive();
                if node.incarnation >= existing.incarnation {
                    existing.gossip_addr = node.gossip_addr;
                    existing.http_addr = node.http_addr;
                    existing.incarnation = node.incarnation;
                    existing.state = node.state;
                    existing.last_seen = node.last_seen;
                }
                revived && existing.state == NodeState::Alive
            }
            None => {
                let alive = node.is_alive();
                self.members.insert(node.id.clone(), node);
                alive
            }
        };
        if changed {
            self.publish_change();
        }
    }

    /// Declares a member dead. Publishes a membership event if it was alive or suspect.
    pub fn mark_dead(&self, id: &NodeId) {
        if id == &self.local_node.id {
            return;
        }
        let changed = match self.members.get_mut(id) {
            Some(mut existing) if existing.state != NodeState::Dead => {
                existing.state = NodeState::Dead;
                true
            }
            _ => false,
        };
        if changed {
            tracing::warn!("Node {} declared dead", id);
            self.publish_change();
        }
    }

    /// Announces a graceful departure to every alive peer.
    pub async fn leave(&self) {
        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        };
        self.broadcast_message(msg).await;
        if let Some(mut local) = self.members.get_mut(&self.local_node.id) {
            local.state = NodeState::Dead;
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let idx = {
                use rand::Rng;
                rand::thread_rng().gen_range(0..alive_members.len())
            };
            let target = &alive_members[idx];

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            if let Err(e) = self.send(&msg, target.gossip_addr).await {
                tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
            } else {
                tracing::trace!("Sent ping to {:?}", target.id);
            }
        }
    }

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let encoded = bincode::serialize(msg)?;
        socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let mut buf = vec![0u8; 65536];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::Join { cluster_name, node } => {
                if cluster_name != self.cluster_name {
                    tracing::warn!(
                        "Rejecting join from {:?}: cluster '{}' != '{}'",
                        node.id,
                        cluster_name,
                        self.cluster_name
                    );
                    return Ok(());
                }
                tracing::info!("Node {:?} joining cluster at {}", node.id, node.gossip_addr);
                self.admit(node);
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await?;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Leave { node_id } => {
                tracing::info!("Node {:?} left the cluster", node_id);
                self.mark_dead(&node_id);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {:?}", from);

        let known = match self.members.get_mut(&from) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if from_incarnation > member.incarnation {
                    member.incarnation = from_incarnation;
                }
                true
            }
            None => false,
        };

        if !known {
            tracing::info!("Discovered new member via ping: {:?} at {}", from, src);
            let mut node = Node::new(from.clone(), src);
            node.incarnation = from_incarnation;
            self.admit(node);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        self.send(&reply, src).await?;

        tracing::trace!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(
        &self,
        from: NodeId,
        from_incarnation: u64,
        members: Vec<Node>,
    ) -> Result<()> {
        tracing::trace!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }

        Ok(())
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }
        let mut publish = false;
        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let was_alive = existing.state == NodeState::Alive;
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                    publish = was_alive != (existing.state == NodeState::Alive);
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    publish = true;
                }
            }
            None => {
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );
                self.admit(new_member);
            }
        }
        if publish {
            self.publish_change();
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            // Refute by bumping our own incarnation.
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc = (*inc).max(incarnation) + 1;
                *inc
            };
            if let Some(mut local) = self.members.get_mut(&node_id) {
                local.incarnation = my_incarnation;
            }
            tracing::info!("Refuting suspicion with incarnation {}", my_incarnation);
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return Ok(());
        }

        let mut publish = false;
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    publish = true;
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }
        if publish {
            self.publish_change();
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let mut publish = false;
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    publish = existing.state != NodeState::Alive;
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }
        if publish {
            self.publish_change();
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut changed = false;

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!(
                            "Node {:?} suspected (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Suspect;
                        changed = true;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::warn!(
                            "Node {:?} declared DEAD (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Dead;
                    }
                    _ => {}
                }
            }

            // Suspects already left the live set, Dead does not change it again.
            if changed {
                self.publish_change();
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().gossip_addr)
            .collect();

        for addr in targets {
            if let Err(e) = self.send(&msg, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", addr, e);
            }
        }
    }
}
