//! The swarm driver: the single task that owns the libp2p swarm.
//!
//! RPC handlers never touch the swarm directly; they talk to this task over
//! a command channel with oneshot replies. The driver multiplexes those
//! commands with swarm events and the discovery ticker, keeps the connection
//! tracker in sync, runs the gossip validation rendezvous, and posts upcalls
//! straight onto the outbound queue.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAcceptance, MessageId};
use libp2p::swarm::SwarmEvent;
use libp2p::kad::store::RecordStore;
use libp2p::{identify, kad, mdns, Multiaddr, PeerId, StreamProtocol, Swarm};
use libp2p_stream::{Control, IncomingStreams};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::behaviour::{HelperBehaviour, HelperBehaviourEvent};
use super::connmgr::ConnectionTracker;
use super::discovery::{DISCOVERY_INTERVAL, DISCOVERY_LIMIT};
use super::gating::GatingState;
use super::pubsub::{
    SubscriptionTable, ValidationTicket, Validators, Verdict, VALIDATION_TIMEOUT,
};
use crate::rpc::types::{encode_blob, resolve_peer_info};
use crate::rpc::{HelperError, OutboundQueue, Upcall};
use crate::seq::SeqSource;
use crate::storage::PeerBook;

/// Commands the RPC surface sends into the driver.
pub enum NodeCommand {
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<Vec<Multiaddr>, HelperError>>,
    },
    ListeningAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    ReportValidation {
        message_id: MessageId,
        source: PeerId,
        verdict: Verdict,
    },
    ValidationTimeout {
        seqno: u64,
    },
    PeerRemoteAddr {
        peer: PeerId,
        reply: oneshot::Sender<Option<Multiaddr>>,
    },
    ListPeers {
        reply: oneshot::Sender<Vec<(PeerId, Multiaddr)>>,
    },
    BeginAdvertising {
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
}

/// Cheap-to-clone handle to the running driver.
#[derive(Clone)]
pub struct NodeHandle {
    pub(super) cmd_tx: mpsc::Sender<NodeCommand>,
    pub(super) stream_control: Control,
    pub local_peer_id: PeerId,
    pub rendezvous: String,
    pub gating: GatingState,
}

impl NodeHandle {
    async fn send(&self, cmd: NodeCommand) -> Result<(), HelperError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| HelperError::p2p("helper node task stopped"))
    }

    async fn ask<T>(
        &self,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, HelperError> {
        rx.await
            .map_err(|_| HelperError::p2p("helper node task stopped"))
    }

    pub async fn listen(&self, addr: Multiaddr) -> Result<Vec<Multiaddr>, HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Listen { addr, reply: tx }).await?;
        self.ask(rx).await?
    }

    pub async fn listening_addrs(&self) -> Result<Vec<Multiaddr>, HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::ListeningAddrs { reply: tx }).await?;
        self.ask(rx).await
    }

    pub async fn subscribe(&self, topic: String) -> Result<(), HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Subscribe { topic, reply: tx }).await?;
        self.ask(rx).await?
    }

    pub async fn unsubscribe(&self, topic: String) -> Result<(), HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Unsubscribe { topic, reply: tx }).await?;
        self.ask(rx).await?
    }

    pub async fn publish(&self, topic: String, data: Vec<u8>) -> Result<(), HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Publish {
            topic,
            data,
            reply: tx,
        })
        .await?;
        self.ask(rx).await?
    }

    pub async fn report_validation(
        &self,
        message_id: MessageId,
        source: PeerId,
        verdict: Verdict,
    ) -> Result<(), HelperError> {
        self.send(NodeCommand::ReportValidation {
            message_id,
            source,
            verdict,
        })
        .await
    }

    /// Remote address of the first open connection to `peer`, if any.
    pub async fn peer_remote_addr(&self, peer: PeerId) -> Result<Option<Multiaddr>, HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::PeerRemoteAddr { peer, reply: tx }).await?;
        self.ask(rx).await
    }

    pub async fn list_peers(&self) -> Result<Vec<(PeerId, Multiaddr)>, HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::ListPeers { reply: tx }).await?;
        self.ask(rx).await
    }

    pub async fn begin_advertising(&self) -> Result<(), HelperError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::BeginAdvertising { reply: tx }).await?;
        self.ask(rx).await?
    }

    /// Opens an outbound stream, dialing the peer if no connection exists.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, HelperError> {
        let mut control = self.stream_control.clone();
        control
            .open_stream(peer, protocol)
            .await
            .map_err(HelperError::p2p)
    }

    /// Registers a server-side protocol and returns its stream of inbound
    /// streams. Dropping the result uninstalls the protocol.
    pub fn accept_streams(&self, protocol: StreamProtocol) -> Result<IncomingStreams, HelperError> {
        self.stream_control
            .clone()
            .accept(protocol)
            .map_err(HelperError::p2p)
    }
}

pub struct NodeDriver {
    pub(super) swarm: Swarm<HelperBehaviour>,
    pub(super) cmd_rx: mpsc::Receiver<NodeCommand>,
    pub(super) cmd_tx: mpsc::Sender<NodeCommand>,
    pub(super) out: OutboundQueue,
    pub(super) seq: SeqSource,
    pub(super) validators: Arc<Validators>,
    pub(super) subscriptions: Arc<SubscriptionTable>,
    pub(super) tracker: ConnectionTracker,
    pub(super) peer_book: PeerBook,
    pub(super) rendezvous_key: kad::RecordKey,
    pub(super) advertising: bool,
    pub(super) unsafe_no_trust_ip: bool,
    pub(super) local_peer_id: PeerId,
}

impl NodeDriver {
    pub async fn run(mut self) {
        let mut discovery = tokio::time::interval(DISCOVERY_INTERVAL);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, stopping swarm driver");
                        break;
                    }
                },
                _ = discovery.tick() => self.discovery_tick(),
            }
        }
    }

    fn addrs_snapshot(&self) -> Vec<Multiaddr> {
        self.swarm
            .listeners()
            .cloned()
            .chain(self.swarm.external_addresses().cloned())
            .collect()
    }

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Listen { addr, reply } => {
                let result = self
                    .swarm
                    .listen_on(addr)
                    .map(|_| self.addrs_snapshot())
                    .map_err(HelperError::p2p);
                let _ = reply.send(result);
            }
            NodeCommand::ListeningAddrs { reply } => {
                let _ = reply.send(self.addrs_snapshot());
            }
            NodeCommand::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic))
                    .map(|_| ())
                    .map_err(HelperError::p2p);
                let _ = reply.send(result);
            }
            NodeCommand::Unsubscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .unsubscribe(&IdentTopic::new(topic))
                    .map(|_| ())
                    .map_err(HelperError::p2p);
                let _ = reply.send(result);
            }
            NodeCommand::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(HelperError::p2p);
                let _ = reply.send(result);
            }
            NodeCommand::ReportValidation {
                message_id,
                source,
                verdict,
            } => {
                self.report_validation(&message_id, &source, verdict.acceptance());
            }
            NodeCommand::ValidationTimeout { seqno } => {
                if let Some((message_id, source)) =
                    self.validators.begin_timeout(seqno, Instant::now())
                {
                    error!(seqno, "validation timed out before the host answered");
                    let acceptance = if self.unsafe_no_trust_ip {
                        MessageAcceptance::Accept
                    } else {
                        MessageAcceptance::Reject
                    };
                    self.report_validation(&message_id, &source, acceptance);
                }
            }
            NodeCommand::PeerRemoteAddr { peer, reply } => {
                let _ = reply.send(self.tracker.first_addr(&peer));
            }
            NodeCommand::ListPeers { reply } => {
                let _ = reply.send(self.tracker.all());
            }
            NodeCommand::BeginAdvertising { reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(self.rendezvous_key.clone())
                    .map(|_| ())
                    .map_err(HelperError::p2p);
                if result.is_ok() {
                    self.advertising = true;
                    info!(rendezvous = ?self.rendezvous_key, "advertising for peers");
                    self.discovery_tick();
                }
                let _ = reply.send(result);
            }
        }
    }

    fn discovery_tick(&mut self) {
        if !self.advertising {
            return;
        }
        debug!("querying the DHT for rendezvous providers");
        self.swarm
            .behaviour_mut()
            .kademlia
            .get_providers(self.rendezvous_key.clone());
    }

    fn report_validation(
        &mut self,
        message_id: &MessageId,
        source: &PeerId,
        acceptance: MessageAcceptance,
    ) {
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .report_message_validation_result(message_id, source, acceptance)
        {
            Ok(in_cache) => {
                if !in_cache {
                    debug!("validated message was no longer in the gossipsub cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to report a validation result"),
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<HelperBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                info!(peer = %peer_id, %remote, "new connection");
                self.tracker.on_established(peer_id, connection_id, remote);
                if self.advertising {
                    let addrs = self.discovered_addrs(&peer_id);
                    if !addrs.is_empty() {
                        let out = self.out.clone();
                        out.send(Upcall::DiscoveredPeer {
                            peer_id: peer_id.to_base58(),
                            multiaddrs: addrs,
                        })
                        .await;
                    }
                }
                self.trim_connections();
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                // Observed but deliberately not reported to the host.
                info!(peer = %peer_id, "dropped connection");
                self.tracker.on_closed(connection_id);
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: HelperBehaviourEvent) {
        match event {
            HelperBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message_id,
                message,
            }) => {
                self.handle_gossip_message(propagation_source, message_id, message)
                    .await;
            }
            HelperBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!(peer = %peer_id, %topic, "peer subscribed");
            }
            HelperBehaviourEvent::Gossipsub(_) => {}
            HelperBehaviourEvent::Kademlia(event) => self.handle_kad_event(event),
            HelperBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                self.handle_mdns_discovered(peers).await;
            }
            HelperBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer, _) in peers {
                    debug!(%peer, "mDNS entry expired");
                }
            }
            HelperBehaviourEvent::Identify(identify::Event::Received {
                peer_id, info, ..
            }) => {
                debug!(peer = %peer_id, addrs = info.listen_addrs.len(), "identified peer");
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                if let Err(e) = self.peer_book.add_addresses(&peer_id, info.listen_addrs.iter()) {
                    warn!(error = %e, "failed to record identify addresses");
                }
            }
            HelperBehaviourEvent::Identify(_) => {}
            HelperBehaviourEvent::Upnp(event) => {
                debug!(?event, "upnp");
            }
            // ping, stream, gating: nothing to do.
            _ => {}
        }
    }

    /// The validator bridge. One inbound message → one ticket → one
    /// `validate` upcall, answered by `validationComplete` or the deadline.
    async fn handle_gossip_message(
        &mut self,
        propagation_source: PeerId,
        message_id: MessageId,
        message: gossipsub::Message,
    ) {
        let Some(subscription_idx) = self.subscriptions.idx_for(&message.topic) else {
            debug!(topic = %message.topic, "message on a topic with no live subscription");
            self.report_validation(&message_id, &propagation_source, MessageAcceptance::Ignore);
            return;
        };

        // Our own messages are valid by definition; no host round-trip.
        if propagation_source == self.local_peer_id
            || message.source == Some(self.local_peer_id)
        {
            debug!("accepting our own message without asking the host");
            self.report_validation(&message_id, &propagation_source, MessageAcceptance::Accept);
            return;
        }

        let sender = match resolve_peer_info(
            self.tracker.first_addr(&propagation_source),
            &propagation_source,
            self.unsafe_no_trust_ip,
        ) {
            Ok(info) => Some(info),
            Err(_) if self.unsafe_no_trust_ip => None,
            Err(e) => {
                error!(
                    peer = %propagation_source,
                    error = %e,
                    "cannot resolve the sender of a pubsub message, dropping it"
                );
                self.report_validation(
                    &message_id,
                    &propagation_source,
                    MessageAcceptance::Ignore,
                );
                return;
            }
        };

        let seqno = self.seq.next();
        self.validators.insert(
            seqno,
            ValidationTicket {
                message_id,
                source: propagation_source,
                timed_out_at: None,
            },
        );
        debug!(seqno, subscription_idx, "asking the host to validate a pubsub message");

        self.out
            .send(Upcall::Validate {
                sender,
                data: encode_blob(&message.data),
                seqno,
                subscription_idx,
            })
            .await;

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VALIDATION_TIMEOUT).await;
            let _ = cmd_tx.send(NodeCommand::ValidationTimeout { seqno }).await;
        });
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            // Record filtering: only public-key records are stored; anything
            // else (notably IPNS) is refused.
            kad::Event::InboundRequest {
                request:
                    kad::InboundRequest::PutRecord {
                        source,
                        record: Some(record),
                        ..
                    },
            } => {
                if record.key.as_ref().starts_with(b"/pk/") {
                    debug!(peer = %source, "storing public-key record");
                    if let Err(e) = self.swarm.behaviour_mut().kademlia.store_mut().put(record) {
                        warn!(error = %e, "failed to store public-key record");
                    }
                } else {
                    debug!(peer = %source, "refusing DHT record outside the pk namespace");
                }
            }
            kad::Event::InboundRequest {
                request: kad::InboundRequest::AddProvider {
                    record: Some(record),
                },
            } => {
                if let Err(e) = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .store_mut()
                    .add_provider(record)
                {
                    warn!(error = %e, "failed to store provider record");
                }
            }
            kad::Event::OutboundQueryProgressed { result, .. } => match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    debug!(count = providers.len(), "found rendezvous providers");
                    for provider in providers.into_iter().take(DISCOVERY_LIMIT) {
                        if provider == self.local_peer_id {
                            continue;
                        }
                        for addr in self.peer_book.addresses(&provider) {
                            self.swarm
                                .behaviour_mut()
                                .kademlia
                                .add_address(&provider, addr);
                        }
                    }
                }
                kad::QueryResult::GetProviders(Err(e)) => {
                    warn!(error = %e, "error while trying to find some peers");
                }
                kad::QueryResult::StartProviding(Err(e)) => {
                    warn!(error = %e, "rendezvous advertise failed");
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    debug!(remaining = ok.num_remaining, "bootstrap progress");
                }
                kad::QueryResult::Bootstrap(Err(e)) => {
                    warn!(error = %e, "bootstrap failed");
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(%peer, "kademlia routing updated");
            }
            _ => {}
        }
    }

    async fn handle_mdns_discovered(&mut self, peers: Vec<(PeerId, Multiaddr)>) {
        for (peer, addr) in peers {
            if peer == self.local_peer_id {
                continue;
            }
            info!(%peer, %addr, "mDNS discovered peer");
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer, addr.clone());
            if let Err(e) = self.peer_book.add_addresses(&peer, [&addr]) {
                warn!(error = %e, "failed to record mDNS address");
            }
            if self.advertising {
                let addrs = self.discovered_addrs(&peer);
                if !addrs.is_empty() {
                    let out = self.out.clone();
                    out.send(Upcall::DiscoveredPeer {
                        peer_id: peer.to_base58(),
                        multiaddrs: addrs,
                    })
                    .await;
                }
            }
        }
    }

    /// `discoveredPeer` fan-out: everything we currently know about a peer.
    ///
    /// Split into a sync half (`discovered_addrs`) and an awaited send at the
    /// call site so the driver's event loop future never holds `&self`
    /// across an `.await` (the swarm's transport internals are `Send` but
    /// not `Sync`, which `tokio::spawn` would otherwise reject).
    fn discovered_addrs(&self, peer: &PeerId) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .tracker
            .addresses_of(peer)
            .iter()
            .map(|a| a.to_string())
            .collect();
        for addr in self.peer_book.addresses(peer) {
            let s = addr.to_string();
            if !addrs.contains(&s) {
                addrs.push(s);
            }
        }
        addrs
    }

    fn trim_connections(&mut self) {
        if !self.tracker.over_high_water() {
            return;
        }
        let victims = self.tracker.trim_candidates(Instant::now());
        if victims.is_empty() {
            return;
        }
        info!(count = victims.len(), "trimming connections toward the low-water mark");
        for id in victims {
            self.swarm.close_connection(id);
        }
    }
}
