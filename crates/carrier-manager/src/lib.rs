//! Stream manager (spec §4.5, §2 `manager`).
//!
//! Process-wide cache of VIFs keyed by `(protocol, address)`. `dial`
//! reuses an existing VIF to the resolved address if one exists, or
//! connects a fresh one and installs it; `listen` accepts connections and
//! creates VIFs eagerly, forwarding peer-initiated VCs to the caller.
//!
//! The manager knows nothing about `tcp` specifically — it is generic over
//! a [`Connector`]/[`Acceptor`] pair, so the in-memory transport used by
//! `carrier-testkit` plugs in the same way a real `TcpStream` does.

use carrier_endpoint::{CarrierError, Endpoint, Result as EpResult};
use carrier_vc::Vc;
use carrier_vif::Vif;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Blanket marker for anything usable as a VIF's underlying connection.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;
type BoxedConnFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>>;

/// Establishes outbound connections to an address string, for whichever
/// protocol the manager was configured with (spec §6 `tcp`/`ws`/`wsh`).
pub trait Connector: Send + Sync + 'static {
    fn dial<'a>(&'a self, address: &'a str) -> BoxedConnFuture<'a>;
}

/// A registered incoming connection, paired with the peer's advertised
/// accepted-VCs channel.
pub struct Accepted {
    pub vif: Vif,
    pub vcs: mpsc::UnboundedReceiver<Vc>,
}

/// Accepts inbound connections on behalf of the manager (spec §4.5
/// "On Listen the manager accepts connections and creates VIFs eagerly").
pub trait Acceptor: Send + Sync + 'static {
    fn accept<'a>(&'a self) -> Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>>;
}

/// TCP realization of [`Connector`] (spec §6 default wire protocol).
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn dial<'a>(&'a self, address: &'a str) -> BoxedConnFuture<'a> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(address).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream) as BoxedConn)
        })
    }
}

/// TCP realization of [`Acceptor`] wrapping a bound `TcpListener`.
pub struct TcpAcceptor(pub tokio::net::TcpListener);

impl Acceptor for TcpAcceptor {
    fn accept<'a>(&'a self) -> Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>> {
        Box::pin(async move {
            let (stream, _addr) = self.0.accept().await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream) as BoxedConn)
        })
    }
}

struct ManagerInner {
    local_ep: Endpoint,
    connector: Arc<dyn Connector>,
    vifs: Mutex<HashMap<(String, String), Vif>>,
}

/// A VC dialed through the manager, paired with the VIF that owns it so
/// callers can open Flows on it (`Vc::connect` alone can't send `OpenFlow`
/// — that's the owning VIF's job, spec §4.4).
#[derive(Clone)]
pub struct DialedVc {
    vif: Vif,
    vc: Vc,
}

impl DialedVc {
    pub fn vc(&self) -> &Vc {
        &self.vc
    }

    pub fn vif(&self) -> &Vif {
        &self.vif
    }

    /// Opens a new Flow on this VC (spec §4.5 "Dial a new VC", §4.3
    /// `Connect`).
    pub async fn connect(&self) -> EpResult<carrier_vc::Flow> {
        self.vif.connect_flow(&self.vc).await
    }

    pub fn is_closed(&self) -> bool {
        self.vc.is_closed()
    }
}

/// Process-wide VIF registry (spec §2 `manager`, §4.5).
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(local_ep: Endpoint, connector: Arc<dyn Connector>) -> Self {
        StreamManager {
            inner: Arc::new(ManagerInner {
                local_ep,
                connector,
                vifs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_tcp(local_ep: Endpoint) -> Self {
        Self::new(local_ep, Arc::new(TcpConnector))
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local_ep.clone()
    }

    fn key(ep: &Endpoint) -> (String, String) {
        (ep.protocol().to_string(), ep.address().to_string())
    }

    /// Dials a VC to `remote_ep`. Reuses an existing VIF to that
    /// `(protocol, address)` if one is live; otherwise connects, runs the
    /// VIF's read/write loops, and caches it (spec §4.5 step 1-2). Two
    /// dials to the same address but different Routing IDs land distinct
    /// VCs on the same cached VIF.
    pub async fn dial(&self, remote_ep: &Endpoint) -> EpResult<DialedVc> {
        let key = Self::key(remote_ep);
        let existing = self.inner.vifs.lock().get(&key).cloned();
        let vif = match existing {
            Some(vif) if !vif.is_closed() => vif,
            _ => self.dial_fresh_vif(remote_ep, key).await?,
        };
        let vc = vif.dial_vc(remote_ep.clone()).await?;
        Ok(DialedVc { vif, vc })
    }

    async fn dial_fresh_vif(
        &self,
        remote_ep: &Endpoint,
        key: (String, String),
    ) -> EpResult<Vif> {
        let conn = self
            .inner
            .connector
            .dial(remote_ep.address())
            .await
            .map_err(|e| CarrierError::aborted(format!("dial {} failed: {e}", remote_ep.address())))?;
        let vif = Vif::spawn_dialer(conn, self.inner.local_ep.clone());
        self.inner.vifs.lock().insert(key, vif.clone());
        Ok(vif)
    }

    /// Runs an accept loop against `acceptor` until it errors, installing a
    /// fresh VIF for each inbound connection and forwarding it (and its
    /// peer-initiated VCs) on the returned channel.
    pub fn listen(&self, acceptor: Arc<dyn Acceptor>) -> mpsc::UnboundedReceiver<Accepted> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(conn) => {
                        let (vif, vcs) = Vif::spawn_acceptor(conn, manager.inner.local_ep.clone());
                        if tx.send(Accepted { vif, vcs }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept loop ending");
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Number of VIFs currently cached, for diagnostics/tests.
    pub fn vif_count(&self) -> usize {
        self.inner.vifs.lock().len()
    }

    /// Drops closed VIFs from the cache (called periodically by a
    /// long-lived owner; the manager never does this implicitly so a VIF
    /// mid-handshake is never evicted out from under a caller).
    pub fn reap_closed(&self) {
        self.inner.vifs.lock().retain(|_, vif| !vif.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct InMemoryConnector {
        peer: Mutex<Option<mpsc::UnboundedSender<tokio::io::DuplexStream>>>,
        dials: Arc<AtomicUsize>,
    }

    impl Connector for InMemoryConnector {
        fn dial<'a>(&'a self, _address: &'a str) -> BoxedConnFuture<'a> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let (a, b) = tokio::io::duplex(64 * 1024);
                if let Some(tx) = self.peer.lock().as_ref() {
                    let _ = tx.send(b);
                }
                Ok(Box::new(a) as BoxedConn)
            })
        }
    }

    struct InMemoryAcceptor {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<tokio::io::DuplexStream>>,
    }

    impl Acceptor for InMemoryAcceptor {
        fn accept<'a>(&'a self) -> Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>> {
            Box::pin(async move {
                let mut rx = self.rx.lock().await;
                match rx.recv().await {
                    Some(stream) => Ok(Box::new(stream) as BoxedConn),
                    None => Err(io::Error::other("no more peers")),
                }
            })
        }
    }

    fn test_pair() -> (Arc<InMemoryConnector>, Arc<InMemoryAcceptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(InMemoryConnector {
            peer: Mutex::new(Some(tx)),
            dials: Arc::new(AtomicUsize::new(0)),
        });
        let acceptor = Arc::new(InMemoryAcceptor {
            rx: tokio::sync::Mutex::new(rx),
        });
        (connector, acceptor)
    }

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new("tcp", addr)
    }

    #[tokio::test]
    async fn dial_reuses_vif_for_repeat_address() {
        let (connector, acceptor) = test_pair();
        let server = StreamManager::new(ep("server:0"), connector.clone());
        let mut accepted = server.listen(acceptor);

        let client = StreamManager::new(ep("client:0"), connector.clone());
        let remote = ep("server:1234");

        let _vc1 = client.dial(&remote).await.unwrap();
        accepted.recv().await.unwrap();
        let _vc2 = client.dial(&remote).await.unwrap();

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_eq!(client.vif_count(), 1);
    }

    #[tokio::test]
    async fn distinct_routing_ids_still_share_one_vif() {
        let (connector, acceptor) = test_pair();
        let server = StreamManager::new(ep("server:0"), connector.clone());
        let mut accepted = server.listen(acceptor);
        let client = StreamManager::new(ep("client:0"), connector.clone());

        let rid_a = carrier_endpoint::RoutingId::generate();
        let rid_b = carrier_endpoint::RoutingId::generate();
        let ep_a = ep("server:1234").with_routing_id(rid_a);
        let ep_b = ep("server:1234").with_routing_id(rid_b);

        let vc_a = client.dial(&ep_a).await.unwrap();
        accepted.recv().await.unwrap();
        let vc_b = client.dial(&ep_b).await.unwrap();

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_ne!(vc_a.vc().vci(), vc_b.vc().vci());
    }

    #[tokio::test]
    async fn data_flows_end_to_end_through_the_manager() {
        let (connector, acceptor) = test_pair();
        let server = StreamManager::new(ep("server:0"), connector.clone());
        let mut accepted = server.listen(acceptor);
        let client = StreamManager::new(ep("client:0"), connector);

        let client_vc = client.dial(&ep("server:1234")).await.unwrap();
        let accepted = accepted.recv().await.unwrap();
        let Accepted { vif: _vif, mut vcs } = accepted;
        let server_vc = vcs.recv().await.unwrap();
        let mut listener = server_vc.listen().unwrap();

        let flow = client_vc.connect().await.unwrap();
        flow.write(Bytes::from_static(b"via manager")).await.unwrap();

        let server_flow = listener.recv().await.unwrap();
        let payload = server_flow.read().await.unwrap();
        assert_eq!(&payload[..], b"via manager");
    }
}
