//! Router Facade
//!
//! The single public entry point of the mesh core. Outbound: wraps
//! payloads in Noise where a recipient is named, fragments anything that
//! exceeds the link MTU, encodes frames and hands them to the BLE engine
//! through the outbound queue. Inbound: decodes, deduplicates, relays,
//! reassembles and decrypts, then delivers typed events to observers on
//! the dispatch task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::events::{MessageEvent, MeshObserver, PeerEvent};
use super::relay::{dedup_key, evaluate, RelayAction, SeenCache};
use crate::bluetooth::connection_tracker::ConnectionTracker;
use crate::bluetooth::{InboundFrame, LinkKey, OutboundFrame, OutboundTarget};
use crate::crypto::{
    Fingerprint, HandshakeOutcome, Identity, RotationSchedule, SessionManager,
};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    self, codec, fragmentation, Announce, CodecOptions, FileTransfer, Packet, PacketType, PeerId,
    Reassembler, TARGET_MTU,
};

/// Opaque handle identifying a local transfer; used to cancel pending
/// fragments before they reach the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

/// The mesh router.
pub struct Router {
    identity: Arc<Identity>,
    rotation: Arc<RotationSchedule>,
    sessions: Arc<SessionManager>,
    tracker: Arc<ConnectionTracker>,
    reassembler: Reassembler,
    seen: SeenCache,
    outbound: mpsc::Sender<OutboundFrame>,
    observers: RwLock<Vec<Arc<dyn MeshObserver>>>,
    nickname: RwLock<String>,
    next_handle: AtomicU64,
    cancelled: Arc<DashSet<u64>>,
    /// Private payloads waiting for a session to finish establishing.
    pending_private: DashMap<Fingerprint, Vec<(TransferHandle, Vec<u8>)>>,
}

impl Router {
    pub fn new(
        identity: Arc<Identity>,
        rotation: Arc<RotationSchedule>,
        sessions: Arc<SessionManager>,
        tracker: Arc<ConnectionTracker>,
        outbound: mpsc::Sender<OutboundFrame>,
        cancelled: Arc<DashSet<u64>>,
        nickname: String,
    ) -> Self {
        Self {
            identity,
            rotation,
            sessions,
            tracker,
            reassembler: Reassembler::new(),
            seen: SeenCache::new(),
            outbound,
            observers: RwLock::new(Vec::new()),
            nickname: RwLock::new(nickname),
            next_handle: AtomicU64::new(1),
            cancelled,
            pending_private: DashMap::new(),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn MeshObserver>) {
        self.observers
            .write()
            .expect("observer list poisoned")
            .push(observer);
    }

    fn emit_packet(&self, event: MessageEvent) {
        for observer in self.observers.read().expect("observer list poisoned").iter() {
            observer.on_packet(&event);
        }
    }

    pub(crate) fn emit_peer(&self, event: PeerEvent) {
        for observer in self.observers.read().expect("observer list poisoned").iter() {
            observer.on_peer(&event);
        }
    }

    fn fresh_handle(&self) -> TransferHandle {
        TransferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// This node's currently valid on-wire IDs: the rotating ephemeral ID
    /// and the static short ID.
    pub fn local_peer_ids(&self) -> Vec<PeerId> {
        let now = protocol::packet::now_millis();
        let mut ids = vec![self.rotation.ephemeral_peer_id(now)];
        let static_id = self.identity.static_peer_id();
        if !ids.contains(&static_id) {
            ids.push(static_id);
        }
        ids
    }

    fn current_peer_id(&self) -> PeerId {
        self.rotation
            .ephemeral_peer_id(protocol::packet::now_millis())
    }

    /// Smallest MTU across ready links; fragmentation keys off this.
    fn effective_mtu(&self) -> usize {
        self.tracker
            .best_links()
            .iter()
            .map(|link| link.mtu)
            .min()
            .unwrap_or(TARGET_MTU)
            .max(protocol::MINIMUM_MTU)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue a broadcast message for every reachable peer.
    pub async fn broadcast(&self, payload: Vec<u8>) -> MeshResult<TransferHandle> {
        let handle = self.fresh_handle();
        let packet = Packet::broadcast(PacketType::Message, self.current_peer_id(), payload);
        self.transmit(packet, OutboundTarget::AllLinks { except: None }, Some(handle))
            .await?;
        Ok(handle)
    }

    /// Queue an end-to-end encrypted payload for one peer. Establishes a
    /// Noise session first when none exists; the payload is flushed as
    /// soon as the handshake completes.
    pub async fn send_private(
        &self,
        fingerprint: Fingerprint,
        payload: Vec<u8>,
    ) -> MeshResult<TransferHandle> {
        let handle = self.fresh_handle();

        if self.sessions.has_session(&fingerprint) {
            if self.sessions.needs_rekey(&fingerprint) {
                self.rekey(fingerprint).await?;
                self.pending_private
                    .entry(fingerprint)
                    .or_default()
                    .push((handle, payload));
                return Ok(handle);
            }
            self.send_wrapped(fingerprint, handle, payload).await?;
            return Ok(handle);
        }

        // No session yet: remember the payload and start the handshake.
        self.pending_private
            .entry(fingerprint)
            .or_default()
            .push((handle, payload));
        match self.peer_for(&fingerprint) {
            Some(peer_id) => {
                let first = self.sessions.initiate(peer_id)?;
                self.send_handshake(peer_id, first).await?;
            }
            None => {
                debug!(
                    "no known peer id for {}; payload queued until announce",
                    fingerprint
                );
            }
        }
        Ok(handle)
    }

    async fn send_wrapped(
        &self,
        fingerprint: Fingerprint,
        handle: TransferHandle,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        let peer_id = self
            .peer_for(&fingerprint)
            .ok_or(MeshError::CryptoSessionMissing)?;
        let ciphertext = self.sessions.wrap(&fingerprint, &payload)?;
        let packet = Packet::addressed(
            PacketType::NoiseEncrypted,
            self.current_peer_id(),
            peer_id,
            ciphertext,
        );
        self.transmit(packet, OutboundTarget::AllLinks { except: None }, Some(handle))
            .await
    }

    fn peer_for(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        // Binding learned from announces and completed handshakes.
        self.sessions.peer_for_fingerprint(fingerprint)
    }

    async fn rekey(&self, fingerprint: Fingerprint) -> MeshResult<()> {
        if let Some(peer_id) = self.sessions.invalidate(&fingerprint) {
            info!("rekeying session with {}", fingerprint);
            let first = self.sessions.initiate(peer_id)?;
            self.send_handshake(peer_id, first).await?;
        }
        Ok(())
    }

    async fn send_handshake(&self, peer_id: PeerId, payload: Vec<u8>) -> MeshResult<()> {
        let packet = Packet::addressed(
            PacketType::NoiseHandshake,
            self.current_peer_id(),
            peer_id,
            payload,
        );
        self.transmit(packet, OutboundTarget::AllLinks { except: None }, None)
            .await
    }

    /// Abort pending fragments of a queued transfer.
    pub fn cancel(&self, handle: TransferHandle) {
        self.cancelled.insert(handle.0);
        debug!("transfer {:?} cancelled", handle);
    }

    /// Update the nickname and announce it to the mesh.
    pub async fn set_nickname(&self, nickname: String) -> MeshResult<()> {
        if nickname.len() > protocol::announce::MAX_NICKNAME_BYTES {
            return Err(MeshError::WireMalformed("nickname too long"));
        }
        *self.nickname.write().expect("nickname poisoned") = nickname;
        self.announce().await
    }

    /// Broadcast a signed announce carrying nickname and public keys.
    pub async fn announce(&self) -> MeshResult<()> {
        let announce = Announce {
            nickname: self.nickname.read().expect("nickname poisoned").clone(),
            noise_static_key: self.identity.noise_public_key(),
            signing_key: self.identity.signing_public_key(),
        };
        let mut packet = Packet::broadcast(
            PacketType::Announce,
            self.current_peer_id(),
            announce.encode()?,
        );
        let preimage = codec::encode_for_signing(&packet)?;
        packet.signature = Some(self.identity.sign(&preimage));
        self.transmit(packet, OutboundTarget::AllLinks { except: None }, None)
            .await
    }

    /// Broadcast a leave packet; called on clean shutdown.
    pub async fn leave(&self) -> MeshResult<()> {
        let packet = Packet::broadcast(PacketType::Leave, self.current_peer_id(), Vec::new());
        self.transmit(packet, OutboundTarget::AllLinks { except: None }, None)
            .await
    }

    /// Encode, fragment if necessary, and queue for the BLE engine.
    async fn transmit(
        &self,
        packet: Packet,
        target: OutboundTarget,
        handle: Option<TransferHandle>,
    ) -> MeshResult<()> {
        let options = match packet.packet_type {
            // Fragments and handshakes are sized to the link; padding
            // would push them past the MTU.
            PacketType::Fragment | PacketType::NoiseHandshake => CodecOptions::plain(),
            _ => CodecOptions::default(),
        };
        let frame = codec::encode(&packet, options)?;
        let mtu = self.effective_mtu();

        if frame.len() <= mtu {
            self.enqueue(frame, target, handle).await;
            return Ok(());
        }

        let batch = fragmentation::split(
            &frame,
            packet.packet_type,
            packet.sender_id,
            packet.recipient_id,
            packet.ttl,
            mtu,
        )?;
        debug!(
            "transfer {:?}: {} fragments over mtu {}",
            handle,
            batch.packets.len(),
            mtu
        );
        for fragment in &batch.packets {
            let bytes = codec::encode(fragment, CodecOptions::plain())?;
            self.enqueue(bytes, target.clone(), handle).await;
        }
        Ok(())
    }

    async fn enqueue(&self, bytes: Vec<u8>, target: OutboundTarget, handle: Option<TransferHandle>) {
        let frame = OutboundFrame {
            target,
            bytes,
            handle: handle.map(|h| h.0),
        };
        if self.outbound.send(frame).await.is_err() {
            warn!("outbound queue closed; frame dropped");
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Full receive pipeline for one frame delivered by the BLE engine.
    pub async fn handle_inbound(&self, frame: InboundFrame) {
        let packet = match codec::decode(&frame.bytes) {
            Ok(packet) => packet,
            Err(err) => {
                // Routinely unrelated BLE noise; never surfaced upward.
                debug!("dropping undecodable frame from {}: {}", frame.address, err);
                return;
            }
        };

        // Our own traffic reflected back by a neighbour.
        if self.local_peer_ids().contains(&packet.sender_id) {
            return;
        }

        self.tracker
            .bind_peer(&frame.address, frame.role, packet.sender_id);

        // Dedup before anything else: a frame racing in on both role
        // links is processed exactly once.
        if !self.seen.check_and_insert(dedup_key(&packet)) {
            return;
        }

        self.process_packet(packet, Some(frame.link_key())).await;
    }

    /// Shared by direct frames and reassembled inner frames.
    async fn process_packet(&self, packet: Packet, arrival: Option<LinkKey>) {
        let action = evaluate(&packet, &self.local_peer_ids());

        let deliver = matches!(
            action,
            RelayAction::Deliver | RelayAction::DeliverAndRelay { .. }
        );

        if deliver {
            self.dispatch(&packet, arrival.as_ref()).await;
        }

        match action {
            RelayAction::Relay { packet, next_hop }
            | RelayAction::DeliverAndRelay { packet, next_hop } => {
                self.forward(packet, arrival, next_hop).await;
            }
            _ => {}
        }
    }

    async fn forward(&self, packet: Packet, arrival: Option<LinkKey>, next_hop: Option<PeerId>) {
        let options = match packet.packet_type {
            PacketType::Fragment | PacketType::NoiseHandshake => CodecOptions::plain(),
            _ => CodecOptions::default(),
        };
        let bytes = match codec::encode(&packet, options) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("relay re-encode failed: {}", err);
                return;
            }
        };
        let target = match next_hop {
            Some(peer) => OutboundTarget::Peer(peer),
            None => OutboundTarget::AllLinks { except: arrival },
        };
        self.enqueue(bytes, target, None).await;
    }

    /// Type dispatch after relay classification.
    async fn dispatch(&self, packet: &Packet, arrival: Option<&LinkKey>) {
        match packet.packet_type {
            PacketType::Announce => self.handle_announce(packet).await,
            PacketType::Message => {
                let fingerprint = self.sessions.fingerprint_for(packet.sender_id);
                self.emit_packet(MessageEvent {
                    packet_type: packet.packet_type,
                    sender: packet.sender_id,
                    sender_fingerprint: fingerprint,
                    payload: packet.payload.clone(),
                });
            }
            PacketType::Leave => {
                self.emit_peer(PeerEvent::Left {
                    peer_id: packet.sender_id,
                });
            }
            PacketType::NoiseHandshake => self.handle_handshake(packet, arrival).await,
            PacketType::NoiseEncrypted => self.handle_encrypted(packet),
            PacketType::Fragment => self.handle_fragment(packet).await,
            PacketType::SyncRequest | PacketType::FileTransfer => {
                self.handle_payload_packet(packet)
            }
        }
    }

    async fn handle_announce(&self, packet: &Packet) {
        let announce = match Announce::decode(&packet.payload) {
            Ok(announce) => announce,
            Err(err) => {
                debug!("bad announce from {}: {}", packet.sender_id, err);
                return;
            }
        };

        // Announces are signed; an unverifiable one is dropped.
        if let Some(signature) = &packet.signature {
            let Ok(preimage) = codec::encode_for_signing(packet) else {
                return;
            };
            if !Identity::verify(&preimage, signature, &announce.signing_key) {
                debug!("announce signature mismatch from {}", packet.sender_id);
                return;
            }
        }

        let fingerprint = Fingerprint::of_static_key(&announce.noise_static_key);
        self.sessions.learn_peer(packet.sender_id, fingerprint);

        // A queued private payload may have been waiting for this peer to
        // become addressable.
        if self.pending_private.contains_key(&fingerprint)
            && !self.sessions.has_session(&fingerprint)
        {
            if let Ok(first) = self.sessions.initiate(packet.sender_id) {
                let _ = self.send_handshake(packet.sender_id, first).await;
            }
        }

        self.emit_peer(PeerEvent::Announced {
            peer_id: packet.sender_id,
            nickname: announce.nickname,
            fingerprint,
        });
    }

    async fn handle_handshake(&self, packet: &Packet, arrival: Option<&LinkKey>) {
        let local = self.current_peer_id();
        match self
            .sessions
            .handle_handshake(local, packet.sender_id, &packet.payload)
        {
            Ok(HandshakeOutcome::Reply(reply)) => {
                let _ = self.reply_handshake(packet.sender_id, reply, arrival).await;
            }
            Ok(HandshakeOutcome::ReplyAndEstablished(reply, fingerprint)) => {
                let _ = self.reply_handshake(packet.sender_id, reply, arrival).await;
                self.on_established(fingerprint).await;
            }
            Ok(HandshakeOutcome::Established(fingerprint)) => {
                self.on_established(fingerprint).await;
            }
            Ok(HandshakeOutcome::Absorbed) => {}
            Err(err) => {
                debug!("handshake with {} failed: {}", packet.sender_id, err);
                self.emit_peer(PeerEvent::HandshakeFailed {
                    peer_id: packet.sender_id,
                });
            }
        }
    }

    async fn reply_handshake(
        &self,
        peer_id: PeerId,
        payload: Vec<u8>,
        arrival: Option<&LinkKey>,
    ) -> MeshResult<()> {
        let packet = Packet::addressed(
            PacketType::NoiseHandshake,
            self.current_peer_id(),
            peer_id,
            payload,
        );
        let bytes = codec::encode(&packet, CodecOptions::plain())?;
        // Prefer answering on the link the message arrived on.
        let target = match arrival {
            Some(link) => OutboundTarget::Link(link.clone()),
            None => OutboundTarget::AllLinks { except: None },
        };
        self.enqueue(bytes, target, None).await;
        Ok(())
    }

    async fn on_established(&self, fingerprint: Fingerprint) {
        self.emit_peer(PeerEvent::SessionEstablished { fingerprint });
        if let Some((_, queued)) = self.pending_private.remove(&fingerprint) {
            for (handle, payload) in queued {
                if self.cancelled.contains(&handle.0) {
                    continue;
                }
                if let Err(err) = self.send_wrapped(fingerprint, handle, payload).await {
                    warn!("flushing queued payload to {} failed: {}", fingerprint, err);
                }
            }
        }
    }

    fn handle_encrypted(&self, packet: &Packet) {
        let Some(fingerprint) = self.sessions.fingerprint_for(packet.sender_id) else {
            debug!(
                "ciphertext from unknown peer {}; no session binding",
                packet.sender_id
            );
            return;
        };
        match self.sessions.unwrap(&fingerprint, &packet.payload) {
            Ok(plaintext) => {
                self.emit_packet(MessageEvent {
                    packet_type: packet.packet_type,
                    sender: packet.sender_id,
                    sender_fingerprint: Some(fingerprint),
                    payload: plaintext,
                });
            }
            Err(err) => {
                debug!("decrypt failure from {}: {}", fingerprint, err);
                if !self.sessions.has_session(&fingerprint) {
                    // The failure counter tore the session down.
                    self.emit_peer(PeerEvent::SessionFailed { fingerprint });
                }
            }
        }
    }

    async fn handle_fragment(&self, packet: &Packet) {
        match self.reassembler.accept(packet) {
            Ok(Some(reassembled)) => {
                match codec::decode(&reassembled.inner_frame) {
                    Ok(inner) => {
                        if inner.packet_type as u8 != reassembled.original_type as u8 {
                            debug!("fragment original type mismatch; dropping");
                            return;
                        }
                        // The inner frame is deduplicated like any other
                        // packet so a refragmented duplicate cannot
                        // double-deliver.
                        if !self.seen.check_and_insert(dedup_key(&inner)) {
                            return;
                        }
                        // The mesh already forwarded the traffic fragment
                        // by fragment; the reassembled frame is only
                        // delivered, never relayed whole.
                        let action = evaluate(&inner, &self.local_peer_ids());
                        if matches!(
                            action,
                            RelayAction::Deliver | RelayAction::DeliverAndRelay { .. }
                        ) {
                            Box::pin(self.dispatch(&inner, None)).await;
                        }
                    }
                    Err(err) => debug!("reassembled frame undecodable: {}", err),
                }
            }
            Ok(None) => {}
            Err(err) => debug!("fragment from {} rejected: {}", packet.sender_id, err),
        }
    }

    fn handle_payload_packet(&self, packet: &Packet) {
        if packet.packet_type == PacketType::FileTransfer {
            // Integrity-check before surfacing; a bad digest drops it.
            if let Err(err) = FileTransfer::decode(&packet.payload) {
                debug!("file transfer from {} dropped: {}", packet.sender_id, err);
                return;
            }
        }
        let fingerprint = self.sessions.fingerprint_for(packet.sender_id);
        self.emit_packet(MessageEvent {
            packet_type: packet.packet_type,
            sender: packet.sender_id,
            sender_fingerprint: fingerprint,
            payload: packet.payload.clone(),
        });
    }

    // ------------------------------------------------------------------
    // Maintenance hooks driven by the core's background tasks
    // ------------------------------------------------------------------

    /// Drop stale partial reassemblies.
    pub fn sweep_reassembly(&self) {
        let dropped = self.reassembler.sweep();
        if dropped > 0 {
            debug!("dropped {} stale reassembly entries", dropped);
        }
    }

    /// Abandon overdue handshakes and notify observers.
    pub fn sweep_handshakes(&self) {
        for peer_id in self.sessions.sweep_timeouts() {
            self.emit_peer(PeerEvent::HandshakeFailed { peer_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bluetooth::connection_tracker::LinkRole;
    use crate::mesh::events::{MessageEvent, MeshObserver, PeerEvent};
    use crate::protocol::packet::DEFAULT_TTL;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<MessageEvent>>,
        peers: Mutex<Vec<PeerEvent>>,
    }

    impl MeshObserver for Recorder {
        fn on_packet(&self, event: &MessageEvent) {
            self.messages.lock().unwrap().push(event.clone());
        }

        fn on_peer(&self, event: &PeerEvent) {
            self.peers.lock().unwrap().push(event.clone());
        }
    }

    struct TestNode {
        router: Arc<Router>,
        outbound: mpsc::Receiver<OutboundFrame>,
        recorder: Arc<Recorder>,
        fingerprint: Fingerprint,
    }

    fn node(name: &str) -> TestNode {
        let identity = Arc::new(Identity::generate());
        let fingerprint = identity.fingerprint();
        let rotation = Arc::new(RotationSchedule::new(
            false,
            [0u8; 32],
            [0u8; 32],
            identity.static_peer_id(),
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&identity)));
        let tracker = Arc::new(ConnectionTracker::new(8));
        let (tx, rx) = mpsc::channel(256);
        let cancelled = Arc::new(DashSet::new());
        let router = Arc::new(Router::new(
            identity,
            rotation,
            sessions,
            tracker,
            tx,
            cancelled,
            name.to_string(),
        ));
        let recorder = Arc::new(Recorder::default());
        router.add_observer(Arc::clone(&recorder) as Arc<dyn MeshObserver>);
        TestNode {
            router,
            outbound: rx,
            recorder,
            fingerprint,
        }
    }

    fn inbound(from: &str, bytes: Vec<u8>) -> InboundFrame {
        InboundFrame {
            address: from.to_string(),
            role: LinkRole::Central,
            bytes,
        }
    }

    /// Shuttle queued frames between two nodes until both are quiescent.
    async fn pump(a: &mut TestNode, b: &mut TestNode) {
        loop {
            let mut moved = false;
            while let Ok(frame) = a.outbound.try_recv() {
                moved = true;
                b.router.handle_inbound(inbound("link-a", frame.bytes)).await;
            }
            while let Ok(frame) = b.outbound.try_recv() {
                moved = true;
                a.router.handle_inbound(inbound("link-b", frame.bytes)).await;
            }
            if !moved {
                break;
            }
        }
    }

    fn sample_broadcast(ttl: u8) -> Packet {
        Packet::broadcast(
            PacketType::Message,
            PeerId([0x42; 8]),
            b"relay me".to_vec(),
        )
        .with_ttl(ttl)
    }

    #[tokio::test]
    async fn broadcast_is_relayed_once_with_ttl_spent() {
        let mut b = node("b");
        let frame = codec::encode(&sample_broadcast(DEFAULT_TTL), CodecOptions::default()).unwrap();

        b.router
            .handle_inbound(inbound("from-a", frame.clone()))
            .await;

        // Delivered upstream once.
        assert_eq!(b.recorder.messages.lock().unwrap().len(), 1);

        // Relayed once, TTL spent, excluding the arrival link.
        let out = b.outbound.try_recv().expect("one relayed copy");
        match &out.target {
            OutboundTarget::AllLinks { except: Some(link) } => {
                assert_eq!(link.address, "from-a");
            }
            other => panic!("unexpected target {:?}", other),
        }
        let relayed = codec::decode(&out.bytes).unwrap();
        assert_eq!(relayed.ttl, DEFAULT_TTL - 1);

        // The duplicate is dropped silently: no delivery, no relay.
        b.router.handle_inbound(inbound("from-c", frame)).await;
        assert_eq!(b.recorder.messages.lock().unwrap().len(), 1);
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn ttl_one_is_delivered_but_never_forwarded() {
        let mut b = node("b");
        let frame = codec::encode(&sample_broadcast(1), CodecOptions::default()).unwrap();
        b.router.handle_inbound(inbound("from-a", frame)).await;

        assert_eq!(b.recorder.messages.lock().unwrap().len(), 1);
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn role_race_duplicate_delivers_exactly_once() {
        let mut b = node("b");
        let frame = codec::encode(&sample_broadcast(DEFAULT_TTL), CodecOptions::default()).unwrap();

        // Same frame in on both role links from the same device.
        b.router
            .handle_inbound(InboundFrame {
                address: "dev".into(),
                role: LinkRole::Central,
                bytes: frame.clone(),
            })
            .await;
        b.router
            .handle_inbound(InboundFrame {
                address: "dev".into(),
                role: LinkRole::Peripheral,
                bytes: frame,
            })
            .await;

        assert_eq!(b.recorder.messages.lock().unwrap().len(), 1);
        // Exactly one relayed copy.
        assert!(b.outbound.try_recv().is_ok());
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn announce_binds_fingerprint_and_nickname() {
        let mut a = node("alice");
        let mut b = node("bob");

        a.router.announce().await.unwrap();
        pump(&mut a, &mut b).await;

        let peers = b.recorder.peers.lock().unwrap();
        let announced = peers.iter().find_map(|event| match event {
            PeerEvent::Announced {
                nickname,
                fingerprint,
                ..
            } => Some((nickname.clone(), *fingerprint)),
            _ => None,
        });
        let (nickname, fingerprint) = announced.expect("announce delivered");
        assert_eq!(nickname, "alice");
        assert_eq!(fingerprint, a.fingerprint);
    }

    #[tokio::test]
    async fn private_send_establishes_session_and_delivers() {
        let mut a = node("alice");
        let mut b = node("bob");

        // Bob learns Alice's identity, then sends to her fingerprint.
        a.router.announce().await.unwrap();
        pump(&mut a, &mut b).await;

        let handle = b
            .router
            .send_private(a.fingerprint, b"between us".to_vec())
            .await
            .unwrap();
        assert!(handle.0 > 0);
        pump(&mut a, &mut b).await;

        // Handshake completed on both sides.
        let a_events = a.recorder.peers.lock().unwrap();
        assert!(a_events
            .iter()
            .any(|e| matches!(e, PeerEvent::SessionEstablished { .. })));
        drop(a_events);

        // The queued payload was flushed, decrypted, and surfaced with
        // the sender's stable fingerprint.
        let messages = a.recorder.messages.lock().unwrap();
        let private = messages
            .iter()
            .find(|m| m.packet_type == PacketType::NoiseEncrypted)
            .expect("private message delivered");
        assert_eq!(private.payload, b"between us");
        assert_eq!(private.sender_fingerprint, Some(b.fingerprint));
    }

    #[tokio::test]
    async fn oversized_broadcast_fragments_and_reassembles() {
        let mut a = node("alice");
        let mut b = node("bob");

        // 2000 incompressible bytes pad to a 2048-byte frame, well past
        // the MTU.
        let mut state = 0x9E3779B9u32;
        let payload: Vec<u8> = (0..2000)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        a.router.broadcast(payload.clone()).await.unwrap();

        let mut fragment_count = 0;
        let mut frames = Vec::new();
        while let Ok(frame) = a.outbound.try_recv() {
            let packet = codec::decode(&frame.bytes).unwrap();
            if packet.packet_type == PacketType::Fragment {
                fragment_count += 1;
            }
            frames.push(frame.bytes);
        }
        assert!(fragment_count > 1, "expected fragmentation");

        // Deliver out of order.
        frames.rotate_left(1);
        for bytes in frames {
            b.router.handle_inbound(inbound("link-a", bytes)).await;
        }

        let messages = b.recorder.messages.lock().unwrap();
        let delivered: Vec<_> = messages
            .iter()
            .filter(|m| m.packet_type == PacketType::Message)
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, payload);
    }

    #[tokio::test]
    async fn cancelled_transfer_is_marked() {
        let b = node("b");
        let handle = b.router.broadcast(b"going nowhere".to_vec()).await.unwrap();
        b.router.cancel(handle);
        assert!(b.router.cancelled.contains(&handle.0));
    }
}
