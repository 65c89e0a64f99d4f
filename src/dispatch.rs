//! The command dispatcher: shared helper state and one handler per method.
//!
//! The stdin reader feeds envelopes in one at a time; each handler runs to
//! completion and enqueues exactly one response carrying the request's
//! seqno. Work that outlives a handler (stream readers, inbound-stream
//! accept loops, the swarm driver) reports back through the outbound queue
//! as upcalls.
//!
//! Until a successful `configure`, only `configure` and `generateKeypair`
//! are available; everything else answers with an RPC error. `configure` is
//! accepted at most once per process lifetime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::crypto::{decode_keypair, generate_keypair};
use crate::network::builder::{build_node, NodeConfig};
use crate::network::gating::GatingPolicy;
use crate::network::node::NodeHandle;
use crate::network::pubsub::{SubscriptionTable, Validators, Verdict, VALIDATION_TIMEOUT};
use crate::network::streams::{
    run_reader, write_all_tracking, StreamEntry, StreamRegistry, OPEN_STREAM_READER_DELAY,
};
use crate::rpc::envelope::{
    ConfigureBody, Envelope, FindPeerBody, ListenBody, OpenStreamBody, ProtocolBody, PublishBody,
    Request, SendStreamMsgBody, StreamIdxBody, SubscribeBody, UnsubscribeBody,
    ValidationCompleteBody,
};
use crate::rpc::types::{
    decode_blob, peer_addr_of_string, peer_info_from_multiaddr, resolve_peer_info, GatingConfig,
    PeerInfo,
};
use crate::rpc::{HelperError, OutboundQueue, ProtocolViolation, Response, Upcall};
use crate::seq::SeqSource;

/// Shared helper state. One per process, behind an `Arc`.
pub struct App {
    seq: SeqSource,
    out: OutboundQueue,
    node: OnceLock<NodeHandle>,
    unsafe_no_trust_ip: AtomicBool,
    validators: Arc<Validators>,
    subscriptions: Arc<SubscriptionTable>,
    streams: StreamRegistry,
    stream_handlers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl App {
    pub fn new(out: OutboundQueue) -> Arc<Self> {
        Arc::new(Self {
            seq: SeqSource::new(),
            out,
            node: OnceLock::new(),
            unsafe_no_trust_ip: AtomicBool::new(false),
            validators: Arc::new(Validators::new()),
            subscriptions: Arc::new(SubscriptionTable::new()),
            streams: StreamRegistry::new(),
            stream_handlers: Mutex::new(HashMap::new()),
        })
    }

    fn node(&self) -> Result<&NodeHandle, HelperError> {
        self.node.get().ok_or_else(HelperError::not_configured)
    }

    fn unsafe_no_trust_ip(&self) -> bool {
        self.unsafe_no_trust_ip.load(Ordering::Relaxed)
    }

    /// Parses and runs one stdin line. `Err` means a protocol violation,
    /// which is fatal to the process.
    pub async fn handle_line(app: &Arc<App>, line: &str) -> Result<(), ProtocolViolation> {
        let envelope: Envelope = serde_json::from_str(line)?;
        App::handle_envelope(app, envelope).await
    }

    /// Runs one envelope and enqueues its response.
    pub async fn handle_envelope(
        app: &Arc<App>,
        envelope: Envelope,
    ) -> Result<(), ProtocolViolation> {
        let request = Request::parse(envelope.method, envelope.body)?;
        let start = Instant::now();
        let response = match App::run(app, request).await {
            Ok(success) => Response::Success {
                seqno: envelope.seqno,
                success,
                duration: format!("{:?}", start.elapsed()),
            },
            Err(e) => Response::Error {
                seqno: envelope.seqno,
                error: e.to_string(),
            },
        };
        app.out.send(response).await;
        Ok(())
    }

    async fn run(app: &Arc<App>, request: Request) -> Result<Value, HelperError> {
        match request {
            Request::Configure(body) => app.configure(body).await,
            Request::Listen(body) => app.listen(body).await,
            Request::Publish(body) => app.publish(body).await,
            Request::Subscribe(body) => app.subscribe(body).await,
            Request::Unsubscribe(body) => app.unsubscribe(body).await,
            Request::ValidationComplete(body) => app.validation_complete(body).await,
            Request::GenerateKeypair => {
                let keypair = generate_keypair()?;
                serde_json::to_value(keypair).map_err(HelperError::rpc)
            }
            Request::OpenStream(body) => app.open_stream(body).await,
            Request::CloseStream(body) => app.close_stream(body).await,
            Request::ResetStream(body) => app.reset_stream(body),
            Request::SendStreamMsg(body) => app.send_stream_msg(body).await,
            Request::RemoveStreamHandler(body) => app.remove_stream_handler(body),
            Request::AddStreamHandler(body) => App::add_stream_handler(app, body),
            Request::ListeningAddrs => {
                let addrs = app.node()?.listening_addrs().await?;
                Ok(addrs_to_json(&addrs))
            }
            Request::AddPeer(_) => Err(HelperError::Disabled(
                "addPeer is disabled -- rebootstrap logic needs reimplemented and tested",
            )),
            Request::BeginAdvertising => {
                app.node()?.begin_advertising().await?;
                Ok(json!("beginAdvertising success"))
            }
            Request::FindPeer(body) => app.find_peer(body).await,
            Request::ListPeers => app.list_peers().await,
            Request::SetGatingConfig(config) => app.set_gating_config(config),
        }
    }

    async fn configure(&self, body: ConfigureBody) -> Result<Value, HelperError> {
        if self.node.get().is_some() {
            return Err(HelperError::rpc("helper already configured"));
        }
        self.unsafe_no_trust_ip
            .store(body.unsafe_no_trust_ip, Ordering::Relaxed);

        let keypair = decode_keypair(&body.privk)?;
        let listen_on = body
            .listen_on
            .iter()
            .map(|s| s.parse::<Multiaddr>().map_err(HelperError::rpc))
            .collect::<Result<Vec<_>, _>>()?;
        let seed_peers = body
            .seed_peers
            .iter()
            .map(|s| peer_addr_of_string(s))
            .collect::<Result<Vec<_>, _>>()?;
        let direct_peers = body
            .direct_peers
            .iter()
            .map(|s| peer_addr_of_string(s))
            .collect::<Result<Vec<_>, _>>()?;
        let external: Multiaddr = body
            .external
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| HelperError::ExternalAddr(e.to_string()))?;
        let gating = GatingPolicy::from_config(&body.gating_config)?;

        let built = build_node(
            NodeConfig {
                statedir: PathBuf::from(body.statedir),
                keypair,
                network_id: body.network_id,
                listen_on,
                external,
                unsafe_no_trust_ip: body.unsafe_no_trust_ip,
                flood: body.flood,
                peer_exchange: body.peer_exchange,
                direct_peers,
                seed_peers,
                gating,
            },
            self.out.clone(),
            self.seq.clone(),
            self.validators.clone(),
            self.subscriptions.clone(),
        )?;

        tokio::spawn(built.driver.run());
        self.node
            .set(built.handle)
            .map_err(|_| HelperError::rpc("helper already configured"))?;

        Ok(json!("configure success"))
    }

    async fn listen(&self, body: ListenBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let addr: Multiaddr = body.iface.parse().map_err(HelperError::p2p)?;
        let addrs = node.listen(addr).await?;
        Ok(addrs_to_json(&addrs))
    }

    async fn publish(&self, body: PublishBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let data = decode_blob(&body.data)?;
        node.publish(body.topic, data).await?;
        Ok(json!("publish success"))
    }

    async fn subscribe(&self, body: SubscribeBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        // Register the index first so a message arriving the instant the
        // mesh forms still finds its subscription.
        self.subscriptions
            .insert(body.subscription, body.topic.clone());
        if let Err(e) = node.subscribe(body.topic).await {
            self.subscriptions.remove(body.subscription);
            return Err(e);
        }
        Ok(json!("subscribe success"))
    }

    async fn unsubscribe(&self, body: UnsubscribeBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let topic = self
            .subscriptions
            .remove(body.subscription)
            .ok_or_else(|| HelperError::rpc("subscription not found"))?;
        node.unsubscribe(topic).await?;
        Ok(json!("unsubscribe success"))
    }

    async fn validation_complete(&self, body: ValidationCompleteBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let ticket = self
            .validators
            .complete(body.seqno)
            .ok_or_else(|| HelperError::rpc("validation seqno unknown"))?;

        if let Some(timed_out_at) = ticket.timed_out_at {
            // The verdict was already reported on timeout; record how late
            // the host's answer was.
            error!(
                seqno = body.seqno,
                total = ?(VALIDATION_TIMEOUT + timed_out_at.elapsed()),
                "validation answered after the deadline"
            );
        } else {
            node.report_validation(
                ticket.message_id,
                ticket.source,
                Verdict::parse(&body.verdict),
            )
            .await?;
        }
        Ok(json!("validationComplete success"))
    }

    async fn open_stream(&self, body: OpenStreamBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let stream_idx = self.seq.next();
        let peer: PeerId = body.peer.parse().map_err(HelperError::rpc)?;
        let protocol =
            StreamProtocol::try_from_owned(body.protocol_id.clone()).map_err(HelperError::rpc)?;

        let stream = node.open_stream(peer, protocol).await?;

        let remote = node.peer_remote_addr(peer).await?;
        let peer_info = match resolve_peer_info(remote, &peer, self.unsafe_no_trust_ip()) {
            Ok(info) => info,
            Err(e) => {
                // Dropping both halves resets the stream.
                drop(stream);
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.split();
        self.streams.insert(
            stream_idx,
            StreamEntry {
                peer: peer_info.clone(),
                protocol: body.protocol_id,
                writer: Arc::new(AsyncMutex::new(write_half)),
                reader: None,
            },
        );

        let out = self.out.clone();
        let reader = tokio::spawn(async move {
            // Let the openStream response land before the first
            // incomingStreamMsg for this stream.
            tokio::time::sleep(OPEN_STREAM_READER_DELAY).await;
            run_reader(stream_idx, read_half, out).await;
        });
        self.streams.set_reader(stream_idx, reader);

        Ok(json!({ "stream_idx": stream_idx, "peer": peer_info }))
    }

    async fn close_stream(&self, body: StreamIdxBody) -> Result<Value, HelperError> {
        self.node()?;
        let writer = self
            .streams
            .writer(body.stream_idx)
            .ok_or_else(|| HelperError::rpc("unknown stream_idx"))?;
        // Half-close: the entry stays, the reader keeps running until the
        // remote half closes.
        writer.lock().await.close().await.map_err(HelperError::p2p)?;
        Ok(json!("closeStream success"))
    }

    fn reset_stream(&self, body: StreamIdxBody) -> Result<Value, HelperError> {
        self.node()?;
        self.streams
            .remove(body.stream_idx)
            .ok_or_else(|| HelperError::rpc("unknown stream_idx"))?;
        Ok(json!("resetStream success"))
    }

    async fn send_stream_msg(&self, body: SendStreamMsgBody) -> Result<Value, HelperError> {
        self.node()?;
        let data = decode_blob(&body.data)?;
        let writer = self
            .streams
            .writer(body.stream_idx)
            .ok_or_else(|| HelperError::rpc("unknown stream_idx"))?;

        let mut writer = writer.lock().await;
        write_all_tracking(&mut *writer, &data)
            .await
            .map_err(|(written, e)| {
                HelperError::p2p(format!(
                    "only wrote {written} out of {} bytes: {e}",
                    data.len()
                ))
            })?;
        Ok(json!("sendStreamMsg success"))
    }

    fn add_stream_handler(app: &Arc<App>, body: ProtocolBody) -> Result<Value, HelperError> {
        let node = app.node()?;
        let protocol =
            StreamProtocol::try_from_owned(body.protocol.clone()).map_err(HelperError::rpc)?;
        let incoming = node.accept_streams(protocol)?;

        let task = tokio::spawn(accept_loop(app.clone(), body.protocol.clone(), incoming));
        if let Some(old) = app.stream_handlers.lock().insert(body.protocol, task) {
            old.abort();
        }
        Ok(json!("addStreamHandler success"))
    }

    fn remove_stream_handler(&self, body: ProtocolBody) -> Result<Value, HelperError> {
        self.node()?;
        // Aborting the accept loop drops the IncomingStreams registration;
        // streams already open under this protocol survive.
        if let Some(task) = self.stream_handlers.lock().remove(&body.protocol) {
            task.abort();
        }
        Ok(json!("removeStreamHandler success"))
    }

    async fn find_peer(&self, body: FindPeerBody) -> Result<Value, HelperError> {
        let node = self.node()?;
        let peer: PeerId = body.peer_id.parse().map_err(HelperError::rpc)?;
        let remote = node.peer_remote_addr(peer).await?;
        let info = resolve_peer_info(remote, &peer, self.unsafe_no_trust_ip())?;
        serde_json::to_value(info).map_err(HelperError::rpc)
    }

    async fn list_peers(&self) -> Result<Value, HelperError> {
        let node = self.node()?;
        let mut peers: Vec<PeerInfo> = Vec::new();
        for (peer, addr) in node.list_peers().await? {
            match peer_info_from_multiaddr(&addr, &peer) {
                Ok(info) => peers.push(info),
                Err(e) => {
                    warn!(%addr, error = %e, "skipping connection with unparseable address");
                }
            }
        }
        serde_json::to_value(peers).map_err(HelperError::rpc)
    }

    fn set_gating_config(&self, config: GatingConfig) -> Result<Value, HelperError> {
        let node = self.node()?;
        let policy = GatingPolicy::from_config(&config)?;
        node.gating.replace(policy);
        info!("gating configuration replaced");
        Ok(json!("ok"))
    }
}

fn addrs_to_json(addrs: &[Multiaddr]) -> Value {
    Value::Array(
        addrs
            .iter()
            .map(|a| Value::String(a.to_string()))
            .collect(),
    )
}

/// Server side of `addStreamHandler`: registers, reads and reports every
/// inbound stream for one protocol until the handler is removed.
async fn accept_loop(
    app: Arc<App>,
    protocol: String,
    mut incoming: libp2p_stream::IncomingStreams,
) {
    while let Some((peer, stream)) = incoming.next().await {
        let Some(node) = app.node.get() else { return };
        let remote = match node.peer_remote_addr(peer).await {
            Ok(remote) => remote,
            Err(_) => return,
        };
        let peer_info = match resolve_peer_info(remote, &peer, app.unsafe_no_trust_ip()) {
            Ok(info) => info,
            Err(e) => {
                error!(
                    %peer,
                    error = %e,
                    "failed to parse remote connection information, silently dropping stream"
                );
                continue;
            }
        };

        let stream_idx = app.seq.next();
        let (read_half, write_half) = stream.split();
        app.streams.insert(
            stream_idx,
            StreamEntry {
                peer: peer_info.clone(),
                protocol: protocol.clone(),
                writer: Arc::new(AsyncMutex::new(write_half)),
                reader: None,
            },
        );
        app.out
            .send(Upcall::IncomingStream {
                peer: peer_info,
                stream_idx,
                protocol: protocol.clone(),
            })
            .await;

        let out = app.out.clone();
        let reader = tokio::spawn(run_reader(stream_idx, read_half, out));
        app.streams.set_reader(stream_idx, reader);
    }
}
