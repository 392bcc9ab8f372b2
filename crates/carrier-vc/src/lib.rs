//! Virtual Circuit (spec §4.3).
//!
//! A VC multiplexes many [`Flow`]s over one authenticated conversation
//! within a VIF. This crate owns the handshake state machine, the Flow
//! map, and per-Flow credit accounting; it knows nothing about sockets —
//! the owning VIF hands it a [`carrier_bqueue::Writer`] slot on the VIF's
//! shared output queue and feeds it decoded `Data`/`OpenFlow`/
//! `AddReceiveBuffers` messages as they arrive off the wire.

mod handshake;

pub use handshake::HandshakeState;

use bytes::Bytes;
use carrier_bqueue::{BQueue, CancelToken, Writer as BWriter, WriterId};
use carrier_counters::CounterTable;
use carrier_crypto::Crypter;
use carrier_endpoint::{CarrierError, Endpoint, Result as EpResult};
use carrier_msg::{FlowId, Vci};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Notify, mpsc};

/// Flow-ID 0 is reserved: here it doubles as the key for the VC's shared
/// send-credit pool (spec §4.3 "shared pool").
pub const SHARED_POOL_FLOW_ID: FlowId = 0;

/// Default receive window a newly `Connect`-ed Flow advertises to the peer
/// via `OpenFlow` (spec §4.2 `OpenFlow{..,InitialCounters}`).
pub const DEFAULT_FLOW_RECEIVE_WINDOW: u64 = 64 * 1024;

/// The priority class the per-VC write loop uses for ordinary Flow data.
/// Control traffic (CloseVC, AddReceiveBuffers) rides at a lower numeric
/// (higher precedence) priority on the VIF's output queue; within a VC,
/// every Flow shares one priority class and round-robins.
pub const FLOW_DATA_PRIORITY: i32 = 10;

/// Coalesced batches are capped at this many bytes before being framed as
/// one `Data` message (spec §4.4 "coalesces adjacent slices up to a
/// maximum payload size").
pub const MAX_COALESCED_PAYLOAD: usize = 64 * 1024;

/// A reliable, in-order, bidirectional byte stream within a VC.
pub struct Flow {
    vci: Vci,
    flow_id: FlowId,
    vc: Arc<VcInner>,
    out_writer: BWriter,
    recv_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FlowEvent>>,
    send_half_closed: AtomicBool,
    recv_half_closed: AtomicBool,
}

enum FlowEvent {
    Data(Bytes),
    HalfClose,
}

impl Flow {
    pub fn id(&self) -> FlowId {
        self.flow_id
    }

    pub fn vci(&self) -> Vci {
        self.vci
    }

    /// Writes `data` to the peer, blocking while insufficient send credit
    /// (dedicated, then shared pool) is available.
    pub async fn write(&self, data: Bytes) -> EpResult<()> {
        if self.send_half_closed.load(Ordering::SeqCst) {
            return Err(CarrierError::aborted("flow half-closed for sending"));
        }
        self.vc.reserve_send_credit(self.flow_id, data.len()).await?;
        let cancel = CancelToken::new();
        self.out_writer
            .put(data, &cancel)
            .await
            .map_err(|_| CarrierError::aborted("vc write queue closed"))
    }

    /// Reads the next chunk of bytes, or `None` once the peer has
    /// half-closed and every preceding byte has been delivered.
    pub async fn read(&self) -> Option<Bytes> {
        if self.recv_half_closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.recv_rx.lock().await;
        let event = rx.recv().await;
        drop(rx);
        match event {
            Some(FlowEvent::Data(b)) => Some(b),
            Some(FlowEvent::HalfClose) | None => {
                self.recv_half_closed.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// Half-closes the send side: drains the outbound buffer then attaches
    /// the half-close flag to the last Data (or emits an empty Data
    /// carrying just the flag).
    pub async fn close_send(&self) {
        if self
            .send_half_closed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        self.out_writer.close();
    }

    pub fn is_send_half_closed(&self) -> bool {
        self.send_half_closed.load(Ordering::SeqCst)
    }

    pub fn is_recv_half_closed(&self) -> bool {
        self.recv_half_closed.load(Ordering::SeqCst)
    }
}

struct VcInner {
    vci: Vci,
    dialed: bool,
    local_ep: Endpoint,
    remote_ep: Mutex<Option<Endpoint>>,
    crypter: Mutex<Option<Arc<dyn Crypter>>>,
    state: Mutex<HandshakeState>,
    ready_notify: Notify,
    credit_notify: Notify,
    flows: Mutex<HashMap<FlowId, FlowHandles>>,
    writer_to_flow: Mutex<HashMap<WriterId, FlowId>>,
    next_flow_id: AtomicU32,
    out_queue: BQueue,
    vif_writer: BWriter,
    send_credits: CounterTable,
    listener_tx: Mutex<Option<mpsc::UnboundedSender<Flow>>>,
    listener_taken: AtomicBool,
}

struct FlowHandles {
    recv_tx: mpsc::UnboundedSender<FlowEvent>,
    writer: BWriter,
}

/// A Virtual Circuit: one authenticated multiplexed conversation within a
/// VIF, carrying many [`Flow`]s.
#[derive(Clone)]
pub struct Vc {
    inner: Arc<VcInner>,
}

impl Vc {
    /// Constructs a VC. `vif_writer` is this VC's slot on the owning VIF's
    /// shared output priority queue; `shared_pool_credit` seeds the
    /// send-credit pool every Flow on this VC may borrow from.
    pub fn new(
        vci: Vci,
        dialed: bool,
        local_ep: Endpoint,
        vif_writer: BWriter,
        shared_pool_credit: i64,
    ) -> Vc {
        let send_credits = CounterTable::new();
        send_credits.set(vci, SHARED_POOL_FLOW_ID, shared_pool_credit);
        let inner = Arc::new(VcInner {
            vci,
            dialed,
            local_ep,
            remote_ep: Mutex::new(None),
            crypter: Mutex::new(None),
            state: Mutex::new(HandshakeState::Init),
            ready_notify: Notify::new(),
            credit_notify: Notify::new(),
            flows: Mutex::new(HashMap::new()),
            writer_to_flow: Mutex::new(HashMap::new()),
            // Dialed flows don't have a parity requirement in this design
            // (only VC-IDs on the VIF do); start above the reserved 0.
            next_flow_id: AtomicU32::new(1),
            out_queue: BQueue::new(),
            vif_writer,
            send_credits,
            listener_tx: Mutex::new(None),
            listener_taken: AtomicBool::new(false),
        });
        Vc { inner }
    }

    pub fn vci(&self) -> Vci {
        self.inner.vci
    }

    pub fn is_dialed(&self) -> bool {
        self.inner.dialed
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local_ep.clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.remote_ep.lock().clone()
    }

    /// Records the destination a dialed VC is targeting, known up front by
    /// the dialer (unlike the acceptor, which only learns it from the
    /// peer's `OpenVC`).
    pub fn set_remote_endpoint(&self, remote_ep: Endpoint) {
        *self.inner.remote_ep.lock() = Some(remote_ep);
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.state.lock().clone()
    }

    fn transition(&self, f: impl FnOnce(&HandshakeState) -> HandshakeState) {
        let mut state = self.inner.state.lock();
        *state = f(&state);
        let became_ready = state.is_ready();
        let became_closed = state.is_closed();
        drop(state);
        if became_ready || became_closed {
            self.inner.ready_notify.notify_waiters();
        }
    }

    pub fn mark_sent_open_vc(&self) {
        self.transition(|s| s.dial_sent_open_vc());
    }

    pub fn mark_received_credit(&self) {
        self.transition(|s| s.dial_received_credit());
    }

    pub fn mark_received_open_vc(&self, remote_ep: Endpoint) {
        *self.inner.remote_ep.lock() = Some(remote_ep);
        self.transition(|s| s.accept_received_open_vc());
    }

    /// Completes the (external) crypto handshake and installs the crypter
    /// plus the peer's endpoint, moving the VC to `Ready`.
    pub fn mark_ready(&self, crypter: Arc<dyn Crypter>, remote_ep: Endpoint) {
        *self.inner.crypter.lock() = Some(crypter);
        *self.inner.remote_ep.lock() = Some(remote_ep);
        self.transition(|s| s.crypto_complete());
    }

    /// Tears down every Flow on this VC with `reason` and marks it closed.
    /// Per spec §3: "Closing a VC tears down every Flow on it."
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.transition(|s| s.fail(reason.clone()));
        self.inner.out_queue.close();
        let flows = std::mem::take(&mut *self.inner.flows.lock());
        for (_, handles) in flows {
            let _ = handles.recv_tx.send(FlowEvent::HalfClose);
        }
        self.inner.send_credits.remove_vc(self.inner.vci);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_closed()
    }

    async fn wait_ready(&self) -> EpResult<()> {
        loop {
            {
                let state = self.inner.state.lock();
                if state.is_ready() {
                    return Ok(());
                }
                if state.is_closed() {
                    return Err(CarrierError::aborted(format!(
                        "vc {} is closed: {}",
                        self.inner.vci, *state
                    )));
                }
            }
            self.inner.ready_notify.notified().await;
        }
    }

    /// Allocates a new Flow-ID, strictly greater than any previously
    /// allocated on this VC (spec §3 invariant).
    fn allocate_flow_id(&self) -> FlowId {
        self.inner.next_flow_id.fetch_add(1, Ordering::SeqCst)
    }

    fn register_flow(&self, flow_id: FlowId) -> Flow {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = self.inner.out_queue.new_writer(FLOW_DATA_PRIORITY, -1);
        self.inner
            .writer_to_flow
            .lock()
            .insert(writer.id(), flow_id);
        self.inner.flows.lock().insert(
            flow_id,
            FlowHandles {
                recv_tx: tx,
                writer: writer.clone(),
            },
        );
        Flow {
            vci: self.inner.vci,
            flow_id,
            vc: self.inner.clone(),
            out_writer: writer,
            recv_rx: tokio::sync::Mutex::new(rx),
            send_half_closed: AtomicBool::new(false),
            recv_half_closed: AtomicBool::new(false),
        }
    }

    /// Allocates a new Flow-ID, sends `OpenFlow` (via `emit_open_flow`) to
    /// grant the peer a receive window, and returns a ready-to-use Flow.
    /// The caller (VIF) supplies `emit_open_flow` so this crate never
    /// touches a socket directly; it is invoked synchronously before the
    /// Flow is returned so `OpenFlow` always precedes any `Data` on the
    /// new Flow-ID (spec §5 ordering guarantee).
    pub async fn connect<F, Fut>(&self, emit_open_flow: F) -> EpResult<Flow>
    where
        F: FnOnce(FlowId, u64) -> Fut,
        Fut: std::future::Future<Output = EpResult<()>>,
    {
        self.wait_ready().await?;
        let flow_id = self.allocate_flow_id();
        emit_open_flow(flow_id, DEFAULT_FLOW_RECEIVE_WINDOW).await?;
        Ok(self.register_flow(flow_id))
    }

    /// Installs the (at most once) Listener for peer-opened Flows.
    pub fn listen(&self) -> EpResult<mpsc::UnboundedReceiver<Flow>> {
        if self.inner.listener_taken.swap(true, Ordering::SeqCst) {
            return Err(CarrierError::bad_arg("Listen called more than once"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.listener_tx.lock() = Some(tx);
        Ok(rx)
    }

    /// Called by the VIF when the peer's `OpenFlow` arrives: creates the
    /// accepted Flow, seeds its dedicated send-credit from `initial_credit`,
    /// and delivers it to the Listener if one was installed.
    pub fn accept_opened_flow(&self, flow_id: FlowId, initial_credit: u64) {
        self.inner
            .send_credits
            .set(self.inner.vci, flow_id, initial_credit as i64);
        let flow = self.register_flow(flow_id);
        self.inner.credit_notify.notify_waiters();
        if let Some(tx) = self.inner.listener_tx.lock().as_ref() {
            let _ = tx.send(flow);
        } else {
            tracing::debug!(vci = self.inner.vci, flow_id, "flow opened with no listener installed, dropping");
        }
    }

    /// Called by the VIF's readLoop when a peer's `AddReceiveBuffers`
    /// arrives, crediting this VC's send-credit table. Flow-ID
    /// `SHARED_POOL_FLOW_ID` replenishes the shared pool.
    pub fn add_receive_buffers(&self, flow_id: FlowId, credit: u64) {
        self.inner
            .send_credits
            .add(self.inner.vci, flow_id, credit as i64);
        self.inner.credit_notify.notify_waiters();
    }

    async fn reserve_send_credit(&self, flow_id: FlowId, len: usize) -> EpResult<()> {
        let len = len as i64;
        loop {
            if self.is_closed() {
                return Err(CarrierError::aborted("vc closed while reserving credit"));
            }
            if self.inner.send_credits.try_reserve(self.inner.vci, flow_id, len) {
                return Ok(());
            }
            // Dedicated credit insufficient: try covering the gap from the
            // shared pool so one lightly-used Flow never blocks on another
            // (spec §4.3 "shared pool"). Reserve the dedicated share first
            // and the shared shortfall second, so a failed second step rolls
            // back the first instead of stranding shared-pool credit that
            // was already taken: `dedicated` is only a snapshot and may be
            // stale by the time we act on it if another reservation on the
            // same Flow-ID interleaves.
            let dedicated = self.inner.send_credits.get(self.inner.vci, flow_id).max(0);
            let shortfall = len - dedicated;
            if shortfall > 0 {
                if self
                    .inner
                    .send_credits
                    .try_reserve(self.inner.vci, flow_id, dedicated)
                {
                    if self
                        .inner
                        .send_credits
                        .try_reserve(self.inner.vci, SHARED_POOL_FLOW_ID, shortfall)
                    {
                        return Ok(());
                    }
                    self.inner.send_credits.add(self.inner.vci, flow_id, dedicated);
                }
            }
            self.inner.credit_notify.notified().await;
        }
    }

    /// Decrypts one `Data` payload using the VC's installed crypter (spec
    /// §4.4 "decrypts each Data payload"). Before the crypter is installed
    /// (handshake not yet complete) the payload passes through unchanged —
    /// the only messages that can arrive this early are themselves part of
    /// bringing the crypter up.
    pub fn decrypt_payload(&self, ciphertext: &[u8]) -> EpResult<Bytes> {
        match self.inner.crypter.lock().as_ref() {
            Some(c) => c.decrypt(ciphertext).map_err(CarrierError::unknown),
            None => Ok(Bytes::copy_from_slice(ciphertext)),
        }
    }

    /// Delivers a decrypted `Data` payload to the target Flow (spec §4.4
    /// per-VC dispatch loop). Unknown Flow-IDs are dropped with a debug
    /// log: the Flow may have already been torn down locally.
    pub fn deliver_data(&self, flow_id: FlowId, payload: Bytes, close_flag: bool) {
        let flows = self.inner.flows.lock();
        if let Some(handles) = flows.get(&flow_id) {
            if !payload.is_empty() {
                let _ = handles.recv_tx.send(FlowEvent::Data(payload));
            }
            if close_flag {
                let _ = handles.recv_tx.send(FlowEvent::HalfClose);
            }
        } else {
            tracing::debug!(vci = self.inner.vci, flow_id, "data for unknown flow, dropping");
        }
    }

    /// The per-VC write loop: drains this VC's internal priority queue
    /// (shared across its Flows), encrypts each batch, frames it as `Data`,
    /// and puts it on the VIF's output queue. Runs until the VC closes.
    pub async fn run_write_loop(&self) {
        let cancel = CancelToken::new();
        loop {
            match self.inner.out_queue.get(&cancel).await {
                Ok((writer_id, batch)) => {
                    let Some(flow_id) = self.inner.writer_to_flow.lock().get(&writer_id).copied()
                    else {
                        continue;
                    };
                    let mut coalesced = Vec::new();
                    let mut total = 0usize;
                    for chunk in batch {
                        if total + chunk.len() > MAX_COALESCED_PAYLOAD && !coalesced.is_empty() {
                            self.emit_flow_data(flow_id, std::mem::take(&mut coalesced), false)
                                .await;
                            total = 0;
                        }
                        total += chunk.len();
                        coalesced.extend_from_slice(&chunk);
                    }
                    let flow_draining = self.is_flow_draining(flow_id);
                    self.emit_flow_data(flow_id, coalesced, flow_draining).await;
                }
                Err(_closed) => break,
            }
        }
    }

    /// Whether the Flow's writer has been closed and fully drained, in
    /// which case the last Data batch for it should carry the half-close
    /// flag.
    fn is_flow_draining(&self, flow_id: FlowId) -> bool {
        self.inner
            .flows
            .lock()
            .get(&flow_id)
            .map(|h| h.writer.is_drained())
            .unwrap_or(false)
    }

    async fn emit_flow_data(&self, flow_id: FlowId, data: Vec<u8>, close_flag: bool) {
        if data.is_empty() && !close_flag {
            return;
        }
        let ciphertext = match self.inner.crypter.lock().as_ref() {
            Some(c) => c.encrypt(&data).unwrap_or_default(),
            None => Bytes::from(data),
        };
        let msg = carrier_msg::Message::Data {
            vci: self.inner.vci,
            flow_id,
            payload: ciphertext,
            close_flag,
        };
        let cancel = CancelToken::new();
        let _ = self.inner.vif_writer.put(msg.encode_frame(), &cancel).await;
    }
}
