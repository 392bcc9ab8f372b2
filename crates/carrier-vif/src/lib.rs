//! Virtual Interface (spec §4.4).
//!
//! One VIF owns every VC multiplexed over a single underlying byte stream.
//! It runs exactly one readLoop (decodes incoming messages and routes them
//! to the right VC) and one writeLoop (drains the shared output priority
//! queue and writes to the connection); every VC's own write loop (spawned
//! by this crate, owned by [`carrier_vc::Vc::run_write_loop`]) funnels its
//! framed `Data` onto that same queue.

use bytes::Bytes;
use carrier_bqueue::{BQueue, CancelToken};
use carrier_crypto::{Crypter, NullCrypter};
use carrier_endpoint::{CarrierError, Endpoint, Result as EpResult};
use carrier_msg::{CounterMap, Message, MsgError, Vci};
use carrier_vc::{SHARED_POOL_FLOW_ID, Vc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// VC-IDs 0 and 1 are reserved (spec §3); the dialer allocates even IDs
/// starting here, the acceptor odd IDs starting at `FIRST_ACCEPTOR_VCI`.
pub const FIRST_DIALER_VCI: Vci = 2;
pub const FIRST_ACCEPTOR_VCI: Vci = 3;

/// Priority class for VIF control traffic (OpenVC, CloseVC,
/// AddReceiveBuffers) — lower numeric value than ordinary Flow data so a
/// backed-up Flow never delays control messages (spec §4.1).
pub const CONTROL_PRIORITY: i32 = 0;

/// Default per-VC shared send-credit pool granted to the peer on OpenVC.
pub const DEFAULT_SHARED_POOL_CREDIT: i64 = 256 * 1024;

pub type CrypterFactory = Arc<dyn Fn() -> Arc<dyn Crypter> + Send + Sync>;

fn null_crypter_factory() -> CrypterFactory {
    Arc::new(|| Arc::new(NullCrypter) as Arc<dyn Crypter>)
}

struct VifInner {
    local_ep: Endpoint,
    remote_ep: Mutex<Option<Endpoint>>,
    vcs: Mutex<HashMap<Vci, Vc>>,
    next_vci: AtomicU32,
    out_queue: BQueue,
    control_writer: carrier_bqueue::Writer,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<Vc>>>,
    shared_pool_credit: i64,
    crypter_factory: CrypterFactory,
    closed: AtomicBool,
}

/// One Virtual Interface: the set of VCs multiplexed over one connection.
/// Destroying the VIF (via [`Vif::close`]) destroys every VC on it.
#[derive(Clone)]
pub struct Vif {
    inner: Arc<VifInner>,
}

impl Vif {
    fn new(
        local_ep: Endpoint,
        is_dialer: bool,
        shared_pool_credit: i64,
        crypter_factory: Option<CrypterFactory>,
    ) -> (Vif, mpsc::UnboundedReceiver<Vc>) {
        let out_queue = BQueue::new();
        let control_writer = out_queue.new_writer(CONTROL_PRIORITY, -1);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let next_vci = if is_dialer {
            FIRST_DIALER_VCI
        } else {
            FIRST_ACCEPTOR_VCI
        };
        let vif = Vif {
            inner: Arc::new(VifInner {
                local_ep,
                remote_ep: Mutex::new(None),
                vcs: Mutex::new(HashMap::new()),
                next_vci: AtomicU32::new(next_vci),
                out_queue,
                control_writer,
                accept_tx: Mutex::new(Some(accept_tx)),
                shared_pool_credit,
                crypter_factory: crypter_factory.unwrap_or_else(null_crypter_factory),
                closed: AtomicBool::new(false),
            }),
        };
        (vif, accept_rx)
    }

    /// Spawns a VIF over `conn` as the dialing side, plus its read/write
    /// loops. `local_ep` is advertised to the peer in every `OpenVC`.
    pub fn spawn_dialer<C>(conn: C, local_ep: Endpoint) -> Vif
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_dialer_with_crypter(conn, local_ep, None)
    }

    pub fn spawn_dialer_with_crypter<C>(
        conn: C,
        local_ep: Endpoint,
        crypter_factory: Option<CrypterFactory>,
    ) -> Vif
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (vif, _accept_rx) = Vif::new(local_ep, true, DEFAULT_SHARED_POOL_CREDIT, crypter_factory);
        vif.spawn_loops(conn);
        vif
    }

    /// Spawns a VIF over `conn` as the accepting side. Peer-initiated VCs
    /// are delivered on the returned channel (spec §4.4 "pending-accept
    /// queue").
    pub fn spawn_acceptor<C>(conn: C, local_ep: Endpoint) -> (Vif, mpsc::UnboundedReceiver<Vc>)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_acceptor_with_crypter(conn, local_ep, None)
    }

    pub fn spawn_acceptor_with_crypter<C>(
        conn: C,
        local_ep: Endpoint,
        crypter_factory: Option<CrypterFactory>,
    ) -> (Vif, mpsc::UnboundedReceiver<Vc>)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (vif, accept_rx) = Vif::new(local_ep, false, DEFAULT_SHARED_POOL_CREDIT, crypter_factory);
        vif.spawn_loops(conn);
        (vif, accept_rx)
    }

    fn spawn_loops<C>(&self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let reader = self.clone();
        tokio::spawn(async move { reader.run_read_loop(read_half).await });
        let writer = self.clone();
        tokio::spawn(async move { writer.run_write_loop(write_half).await });
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local_ep.clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.remote_ep.lock().clone()
    }

    pub fn vc_count(&self) -> usize {
        self.inner.vcs.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn install_crypter_when_handshaking(&self, vc: &Vc, remote_ep: Endpoint) {
        if vc.state() == carrier_vc::HandshakeState::Handshaking {
            let crypter = (self.inner.crypter_factory)();
            vc.mark_ready(crypter, remote_ep);
        }
    }

    /// Dials a new VC on this VIF: allocates the next VC-ID, sends `OpenVC`
    /// naming `remote_ep` as the destination, and returns the VC handle
    /// immediately (the handshake completes asynchronously; callers await
    /// readiness via `Vc::connect`/`listen`, spec §4.5 "reuse it and Dial a
    /// new VC").
    pub async fn dial_vc(&self, remote_ep: Endpoint) -> EpResult<Vc> {
        if self.is_closed() {
            return Err(CarrierError::aborted("vif is closed"));
        }
        let vci = self.inner.next_vci.fetch_add(2, Ordering::SeqCst);
        let vc_writer = self
            .inner
            .out_queue
            .new_writer(carrier_vc::FLOW_DATA_PRIORITY, -1);
        let vc = Vc::new(
            vci,
            true,
            self.inner.local_ep.clone(),
            vc_writer,
            self.inner.shared_pool_credit,
        );
        vc.set_remote_endpoint(remote_ep.clone());
        self.inner.vcs.lock().insert(vci, vc.clone());
        let vc_for_loop = vc.clone();
        tokio::spawn(async move { vc_for_loop.run_write_loop().await });

        let mut counters = CounterMap::new();
        counters.insert(vci, SHARED_POOL_FLOW_ID, self.inner.shared_pool_credit as u64);
        let open_vc = Message::OpenVc {
            vci,
            local_ep: self.inner.local_ep.to_string(),
            remote_ep: remote_ep.to_string(),
            counters,
        };
        vc.mark_sent_open_vc();
        let cancel = CancelToken::new();
        self.inner
            .control_writer
            .put(open_vc.encode_frame(), &cancel)
            .await
            .map_err(|_| CarrierError::aborted("vif output queue closed"))?;
        Ok(vc)
    }

    pub fn lookup_vc(&self, vci: Vci) -> Option<Vc> {
        self.inner.vcs.lock().get(&vci).cloned()
    }

    /// Sends `OpenFlow` for a Flow-ID a VC has already allocated (spec §4.4
    /// "translates OpenFlow ... to VC-level calls", outbound direction).
    /// This is the closure `Vc::connect` needs to notify the peer before
    /// handing the new `Flow` back to the caller.
    async fn emit_open_flow(
        &self,
        vci: Vci,
        flow_id: carrier_msg::FlowId,
        initial_credit: u64,
    ) -> EpResult<()> {
        let msg = Message::OpenFlow {
            vci,
            flow_id,
            initial_credit,
        };
        let cancel = CancelToken::new();
        self.inner
            .control_writer
            .put(msg.encode_frame(), &cancel)
            .await
            .map_err(|_| CarrierError::aborted("vif output queue closed"))
    }

    /// Opens a new Flow on `vc`, owned by this VIF, sending `OpenFlow` to
    /// the peer before returning. The counterpart to `Vc::listen`'s
    /// Flows, which arrive already opened by the peer.
    pub async fn connect_flow(&self, vc: &Vc) -> EpResult<carrier_vc::Flow> {
        let vci = vc.vci();
        let vif = self.clone();
        vc.connect(move |flow_id, initial_credit| {
            let vif = vif.clone();
            async move { vif.emit_open_flow(vci, flow_id, initial_credit).await }
        })
        .await
    }

    /// Tears down every VC on this VIF and releases the underlying
    /// connection (spec §3 invariant: "closing a VIF destroys all VCs").
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let vcs = std::mem::take(&mut *self.inner.vcs.lock());
        for (_, vc) in vcs {
            vc.close("vif closed");
        }
        self.inner.out_queue.close();
        if let Some(tx) = self.inner.accept_tx.lock().take() {
            drop(tx);
        }
    }

    async fn run_write_loop<W: AsyncWrite + Unpin>(&self, mut writer: WriteHalf<W>) {
        let cancel = CancelToken::new();
        loop {
            match self.inner.out_queue.get(&cancel).await {
                Ok((_id, batch)) => {
                    for chunk in batch {
                        if writer.write_all(&chunk).await.is_err() {
                            self.close();
                            return;
                        }
                    }
                    if writer.flush().await.is_err() {
                        self.close();
                        return;
                    }
                }
                Err(_closed) => {
                    let _ = writer.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn run_read_loop<R: AsyncRead + Unpin>(&self, mut reader: ReadHalf<R>) {
        loop {
            match Message::read_from(&mut reader).await {
                Ok(msg) => self.handle_message(msg).await,
                Err(MsgError::Eof) => {
                    tracing::debug!(vif = %self.debug_name(), "peer closed connection");
                    self.close();
                    return;
                }
                Err(e) => {
                    tracing::warn!(vif = %self.debug_name(), error = %e, "bad-protocol, tearing down vif");
                    self.close();
                    return;
                }
            }
        }
    }

    fn debug_name(&self) -> String {
        self.inner
            .remote_ep
            .lock()
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "<unestablished>".to_string())
    }

    async fn handle_message(&self, msg: Message) {
        match msg {
            Message::OpenVc {
                vci,
                local_ep,
                counters,
                ..
            } => self.handle_open_vc(vci, local_ep, counters).await,
            Message::CloseVc { vci, error } => {
                if let Some(vc) = self.inner.vcs.lock().remove(&vci) {
                    vc.close(error);
                }
            }
            Message::Data {
                vci,
                flow_id,
                payload,
                close_flag,
            } => {
                let Some(vc) = self.lookup_vc(vci) else {
                    tracing::debug!(vci, "data for unknown vc, dropping");
                    return;
                };
                match vc.decrypt_payload(&payload) {
                    Ok(plaintext) => vc.deliver_data(flow_id, plaintext, close_flag),
                    Err(e) => tracing::warn!(vci, error = %e, "decrypt failed, dropping frame"),
                }
            }
            Message::AddReceiveBuffers { counters } => {
                for (vci, flow_id, credit) in counters.iter() {
                    let Some(vc) = self.lookup_vc(*vci) else {
                        continue;
                    };
                    if *flow_id == SHARED_POOL_FLOW_ID
                        && vc.state() == carrier_vc::HandshakeState::Opening
                    {
                        vc.mark_received_credit();
                        self.install_crypter_when_handshaking(
                            &vc,
                            vc.remote_endpoint().unwrap_or_else(|| vc.local_endpoint()),
                        );
                    }
                    vc.add_receive_buffers(*flow_id, *credit);
                }
            }
            Message::OpenFlow {
                vci,
                flow_id,
                initial_credit,
            } => {
                if let Some(vc) = self.lookup_vc(vci) {
                    vc.accept_opened_flow(flow_id, initial_credit);
                }
            }
            other @ (Message::Setup { .. }
            | Message::MultiProxyRequest
            | Message::ProxyServerRequest
            | Message::ProxyResponse { .. }) => {
                tracing::debug!(
                    ?other,
                    "flow-level handshake message arrived on the vif control channel, dropping"
                );
            }
        }
    }

    async fn handle_open_vc(&self, vci: Vci, local_ep: String, counters: CounterMap) {
        if self.inner.vcs.lock().contains_key(&vci) {
            tracing::warn!(vci, "duplicate OpenVC, ignoring");
            return;
        }
        let remote_ep = match Endpoint::parse(&local_ep) {
            Ok(ep) => ep,
            Err(e) => {
                tracing::warn!(vci, error = %e, "OpenVC carried an unparsable endpoint");
                return;
            }
        };
        *self.inner.remote_ep.lock() = Some(remote_ep.clone());

        let vc_writer = self
            .inner
            .out_queue
            .new_writer(carrier_vc::FLOW_DATA_PRIORITY, -1);
        let vc = Vc::new(
            vci,
            false,
            self.inner.local_ep.clone(),
            vc_writer,
            self.inner.shared_pool_credit,
        );
        vc.mark_received_open_vc(remote_ep.clone());
        self.install_crypter_when_handshaking(&vc, remote_ep);

        self.inner.vcs.lock().insert(vci, vc.clone());
        let vc_for_loop = vc.clone();
        tokio::spawn(async move { vc_for_loop.run_write_loop().await });

        // Grant the dialer our shared-pool credit so it can progress from
        // Opening to Handshaking (spec §4.3 handshake diagram).
        let mut reply = CounterMap::new();
        reply.insert(vci, SHARED_POOL_FLOW_ID, self.inner.shared_pool_credit as u64);
        let _ = counters; // the dialer's advertised credit is informational only here
        let cancel = CancelToken::new();
        let _ = self
            .inner
            .control_writer
            .put(
                Message::AddReceiveBuffers { counters: reply }.encode_frame(),
                &cancel,
            )
            .await;

        if let Some(tx) = self.inner.accept_tx.lock().as_ref() {
            let _ = tx.send(vc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new("tcp", addr)
    }

    async fn connected_pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(64 * 1024)
    }

    #[tokio::test]
    async fn dial_then_accept_reaches_ready_on_both_sides() {
        let (a, b) = connected_pair().await;
        let dialer = Vif::spawn_dialer(a, ep("dialer:1"));
        let (_acceptor, mut accept_rx) = Vif::spawn_acceptor(b, ep("acceptor:1"));

        let dialer_vc = dialer.dial_vc(ep("acceptor:1")).await.unwrap();
        let accepted_vc = tokio::time::timeout(Duration::from_secs(2), accept_rx.recv())
            .await
            .expect("accept timed out")
            .expect("channel closed");

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if dialer_vc.state().is_ready() && accepted_vc.state().is_ready() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handshake never completed");
    }

    #[tokio::test]
    async fn data_round_trips_end_to_end_through_two_vifs() {
        let (a, b) = connected_pair().await;
        let dialer = Vif::spawn_dialer(a, ep("dialer:1"));
        let (_acceptor, mut accept_rx) = Vif::spawn_acceptor(b, ep("acceptor:1"));

        let dialer_vc = dialer.dial_vc(ep("acceptor:1")).await.unwrap();
        let accepted_vc = accept_rx.recv().await.unwrap();
        let mut listener = accepted_vc.listen().unwrap();

        let flow = dialer.connect_flow(&dialer_vc).await.unwrap();
        flow.write(Bytes::from_static(b"hello vif")).await.unwrap();

        let accepted_flow = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), accepted_flow.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"hello vif");
    }

    #[tokio::test]
    async fn vc_count_shrinks_monotonically_after_close() {
        let (a, b) = connected_pair().await;
        let dialer = Vif::spawn_dialer(a, ep("dialer:1"));
        let (_acceptor, mut accept_rx) = Vif::spawn_acceptor(b, ep("acceptor:1"));

        let _vc1 = dialer.dial_vc(ep("acceptor:1")).await.unwrap();
        let _vc2 = dialer.dial_vc(ep("acceptor:1")).await.unwrap();
        accept_rx.recv().await.unwrap();
        accept_rx.recv().await.unwrap();
        assert_eq!(dialer.vc_count(), 2);

        dialer.close();
        assert!(dialer.is_closed());
    }

    #[tokio::test]
    async fn dialing_on_a_closed_vif_fails_fast() {
        let (a, _b) = connected_pair().await;
        let dialer = Vif::spawn_dialer(a, ep("dialer:1"));
        dialer.close();
        let err = dialer.dial_vc(ep("nowhere:1")).await.unwrap_err();
        assert_eq!(err.kind(), carrier_endpoint::ErrorKind::Aborted);
    }
}
