//! Proxy: an RPC-layer relay that lets a server behind NAT publish a
//! dialable endpoint through a reachable proxy (spec §4.9).
//!
//! Registration (`ProxyServerRequest`/`MultiProxyRequest`) and transit
//! (`Setup`) share one listener because both start the same way: read one
//! framed `Message` off a freshly accepted connection and classify on it.
//! A registered connection is kept open as a long-lived back-channel; a
//! transit connection is spliced byte-for-byte onto whichever registrant
//! its `Setup` names, until either side closes.

use carrier_endpoint::{CarrierError, Endpoint, Result as EpResult, RoutingId};
use carrier_manager::{Acceptor, BoxedConn};
use carrier_msg::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Admits or rejects a registration attempt (spec §4.9 "authorize the
/// caller"). Transport-level authentication already ran during the
/// connection handshake; this is the proxy's own policy layer, mirroring
/// `carrier-server`'s `Authorizer`.
pub trait RegistrationAuthorizer: Send + Sync + 'static {
    fn authorize(&self) -> EpResult<()>;
}

/// Admits every registrant. The default.
pub struct AllowAllRegistrations;

impl RegistrationAuthorizer for AllowAllRegistrations {
    fn authorize(&self) -> EpResult<()> {
        Ok(())
    }
}

/// Rejects every registrant, for conformance tests of the denial path.
pub struct DenyAllRegistrations;

impl RegistrationAuthorizer for DenyAllRegistrations {
    fn authorize(&self) -> EpResult<()> {
        Err(CarrierError::no_access("proxy registration denied"))
    }
}

/// A registered server or downstream proxy's long-lived back-channel
/// connection. Taken out of the registry for the duration of a transit
/// (one physical connection carries one transit at a time; see DESIGN.md).
struct Registration {
    conn: AsyncMutex<Option<BoxedConn>>,
    is_proxy: bool,
}

/// What this proxy advertises to new registrants: its own dialable address
/// and the route hops (if any) needed to reach it, learned from
/// [`Proxy::register_with_upstream`] when this proxy is itself chained
/// behind another one.
struct ProxyBase {
    endpoint: Endpoint,
    route: Vec<RoutingId>,
}

/// One proxy instance (spec §4.9).
pub struct Proxy {
    base: Mutex<ProxyBase>,
    registry: Mutex<HashMap<RoutingId, Arc<Registration>>>,
    authorizer: Arc<dyn RegistrationAuthorizer>,
}

impl Proxy {
    /// `base_endpoint` is this proxy's own externally dialable address
    /// (protocol + address); its Routing ID and route are overwritten per
    /// registrant.
    pub fn new(base_endpoint: Endpoint) -> Self {
        Proxy {
            base: Mutex::new(ProxyBase {
                endpoint: base_endpoint,
                route: Vec::new(),
            }),
            registry: Mutex::new(HashMap::new()),
            authorizer: Arc::new(AllowAllRegistrations),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn RegistrationAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Number of currently registered servers/downstream proxies, for tests
    /// and diagnostics.
    pub fn registration_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Runs an accept loop against `acceptor`, spawning a classification
    /// task per inbound connection (spec §4.9 "the proxy is itself an
    /// RPC-layer component that multiplexes incoming Flows").
    pub fn listen(self: &Arc<Self>, acceptor: Arc<dyn Acceptor>) {
        let proxy = self.clone();
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(conn) => {
                        let proxy = proxy.clone();
                        tokio::spawn(async move {
                            if let Err(e) = proxy.handle_connection(conn).await {
                                tracing::debug!(error = %e, "proxy connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "proxy accept loop ending");
                        return;
                    }
                }
            }
        });
    }

    /// Reads the first message off a freshly accepted (or freshly
    /// registered-upstream) connection and classifies it (spec §4.9 "Flow
    /// classification on first message").
    async fn handle_connection(self: Arc<Self>, mut conn: BoxedConn) -> EpResult<()> {
        let msg = Message::read_from(&mut conn)
            .await
            .map_err(|e| CarrierError::bad_protocol(format!("proxy: failed to read first message: {e}")))?;
        match msg {
            Message::ProxyServerRequest => self.handle_registration(conn, false).await,
            Message::MultiProxyRequest => self.handle_registration(conn, true).await,
            Message::Setup {
                min_version,
                max_version,
                peer_remote_endpoint,
            } => {
                self.handle_transit(conn, min_version, max_version, peer_remote_endpoint)
                    .await
            }
            other => {
                tracing::warn!(?other, "unexpected first message on proxy listener, closing");
                Err(CarrierError::bad_protocol("proxy: unexpected first message"))
            }
        }
    }

    /// `ProxyServerRequest`/`MultiProxyRequest` → server/proxy registration
    /// (spec §4.9): authorize, assign a fresh Routing ID, reply with the
    /// endpoint the registrant should publish, then keep the connection
    /// open as the registrant's back-channel.
    async fn handle_registration(&self, mut conn: BoxedConn, is_proxy: bool) -> EpResult<()> {
        self.authorizer.authorize()?;
        let id = RoutingId::generate();
        let endpoint = self.advertised_endpoint(id);
        Message::ProxyResponse {
            endpoints: vec![endpoint.to_string()],
        }
        .write_to(&mut conn)
        .await
        .map_err(|e| CarrierError::aborted(format!("proxy: failed to reply to registration: {e}")))?;

        tracing::debug!(routing_id = %id.to_hex(), is_proxy, "registered");
        self.registry.lock().insert(
            id,
            Arc::new(Registration {
                conn: AsyncMutex::new(Some(conn)),
                is_proxy,
            }),
        );
        Ok(())
    }

    /// `Setup` → transit (spec §4.9): resolve the destination by Routing ID
    /// or route-pop, forward a rewritten `Setup`, then splice bytes between
    /// the two connections until either closes.
    async fn handle_transit(
        &self,
        mut incoming: BoxedConn,
        min_version: u32,
        max_version: u32,
        peer_remote_endpoint: String,
    ) -> EpResult<()> {
        let target = Endpoint::parse(&peer_remote_endpoint)
            .map_err(|e| CarrierError::bad_protocol(format!("proxy: bad Setup endpoint: {e}")))?;
        let (popped, rewritten) = target.without_route_head();
        let dest_id = popped.unwrap_or_else(|| target.routing_id());

        let registration = self.registry.lock().get(&dest_id).cloned().ok_or_else(|| {
            CarrierError::no_such_name(format!(
                "proxy: no registrant advertising routing id {}",
                dest_id.to_hex()
            ))
        })?;

        let mut outgoing = registration.conn.lock().await.take().ok_or_else(|| {
            CarrierError::aborted(
                "proxy: registrant connection is already busy with another transit, or disconnected",
            )
        })?;

        Message::Setup {
            min_version,
            max_version,
            peer_remote_endpoint: rewritten.to_string(),
        }
        .write_to(&mut outgoing)
        .await
        .map_err(|e| CarrierError::aborted(format!("proxy: failed to forward Setup: {e}")))?;

        match tokio::io::copy_bidirectional(&mut incoming, &mut outgoing).await {
            Ok((to_dest, to_src)) => {
                tracing::debug!(to_dest, to_src, "proxy transit copy finished");
            }
            Err(e) => {
                tracing::debug!(error = %e, "proxy transit copy ended with an error");
            }
        }
        Ok(())
    }

    fn advertised_endpoint(&self, id: RoutingId) -> Endpoint {
        let base = self.base.lock();
        base.endpoint.clone().with_route(base.route.clone()).with_routing_id(id)
    }

    /// Re-sends `ProxyResponse` to every registered server and downstream
    /// proxy (spec §4.9 "when the proxy's own set of listening endpoints
    /// changes ... re-send ProxyResponse ... so they can re-publish").
    /// Call after [`Proxy::set_base`] changes what this proxy advertises.
    pub async fn republish(&self) {
        let registrations: Vec<(RoutingId, Arc<Registration>)> =
            self.registry.lock().iter().map(|(id, r)| (*id, r.clone())).collect();
        for (id, reg) in registrations {
            let endpoint = self.advertised_endpoint(id);
            let mut guard = reg.conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            let msg = Message::ProxyResponse {
                endpoints: vec![endpoint.to_string()],
            };
            if let Err(e) = msg.write_to(conn).await {
                tracing::debug!(error = %e, routing_id = %id.to_hex(), "failed to republish, dropping registrant");
                *guard = None;
            }
        }
    }

    /// Overwrites this proxy's own advertised base address/route (used
    /// when a listener starts/stops, or after [`Proxy::register_with_upstream`]
    /// learns a new upstream chain). Does not itself notify registrants;
    /// call [`Proxy::republish`] afterward.
    pub fn set_base(&self, endpoint: Endpoint, route: Vec<RoutingId>) {
        *self.base.lock() = ProxyBase { endpoint, route };
    }

    /// Registers this proxy with an upstream proxy over `conn` (spec §4.9
    /// "MultiProxyRequest ... allowing proxy chains"): sends
    /// `MultiProxyRequest`, adopts the returned endpoint as this proxy's
    /// own base (route extended by the Routing ID the upstream assigned),
    /// then keeps listening on the same connection for the `Setup`
    /// transits the upstream will forward down to it.
    pub async fn register_with_upstream(self: &Arc<Self>, mut conn: BoxedConn) -> EpResult<()> {
        Message::MultiProxyRequest
            .write_to(&mut conn)
            .await
            .map_err(|e| CarrierError::aborted(format!("proxy: failed to send MultiProxyRequest: {e}")))?;
        let reply = Message::read_from(&mut conn)
            .await
            .map_err(|e| CarrierError::bad_protocol(format!("proxy: failed to read ProxyResponse: {e}")))?;
        let Message::ProxyResponse { endpoints } = reply else {
            return Err(CarrierError::bad_protocol("proxy: expected ProxyResponse from upstream"));
        };
        let granted = endpoints
            .first()
            .ok_or_else(|| CarrierError::bad_protocol("proxy: upstream returned no endpoints"))?;
        let parsed = Endpoint::parse(granted)
            .map_err(|e| CarrierError::bad_protocol(format!("proxy: bad upstream endpoint: {e}")))?;

        let mut route = parsed.route().to_vec();
        route.push(parsed.routing_id());
        let new_base = parsed.with_route(Vec::new()).with_routing_id(RoutingId::UNKNOWN);
        self.set_base(new_base, route);

        let proxy = self.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.handle_connection(conn).await {
                tracing::debug!(error = %e, "upstream-registered connection ended");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new("tcp", addr)
    }

    fn duplex_pair() -> (BoxedConn, BoxedConn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    struct OneShotAcceptor {
        rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<BoxedConn>>,
    }

    impl Acceptor for OneShotAcceptor {
        fn accept<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = io::Result<BoxedConn>> + Send + 'a>> {
            Box::pin(async move {
                let mut rx = self.rx.lock().await;
                rx.recv().await.ok_or_else(|| io::Error::other("no more connections"))
            })
        }
    }

    #[tokio::test]
    async fn server_registration_gets_a_routing_id_substituted_endpoint() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")));
        let (mut registrant, accepted) = duplex_pair();

        Message::ProxyServerRequest.write_to(&mut registrant).await.unwrap();
        proxy.clone().handle_connection(accepted).await.unwrap();

        let reply = Message::read_from(&mut registrant).await.unwrap();
        let Message::ProxyResponse { endpoints } = reply else {
            panic!("expected ProxyResponse");
        };
        let granted = Endpoint::parse(&endpoints[0]).unwrap();
        assert_eq!(granted.address(), "proxy.example:9000");
        assert!(granted.route().is_empty());
        assert!(!granted.routing_id().is_unknown());
        assert_eq!(proxy.registration_count(), 1);
    }

    #[tokio::test]
    async fn registration_is_denied_by_a_rejecting_authorizer() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")).with_authorizer(Arc::new(DenyAllRegistrations)));
        let (mut registrant, accepted) = duplex_pair();

        Message::ProxyServerRequest.write_to(&mut registrant).await.unwrap();
        let result = proxy.clone().handle_connection(accepted).await;
        assert!(result.is_err());
        assert_eq!(proxy.registration_count(), 0);
    }

    #[tokio::test]
    async fn transit_splices_a_client_to_the_registered_server_by_routing_id() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")));

        let (mut server_side, server_accepted) = duplex_pair();
        Message::ProxyServerRequest.write_to(&mut server_side).await.unwrap();
        proxy.clone().handle_connection(server_accepted).await.unwrap();

        let reply = Message::read_from(&mut server_side).await.unwrap();
        let Message::ProxyResponse { endpoints } = reply else {
            panic!("expected ProxyResponse");
        };
        let granted = Endpoint::parse(&endpoints[0]).unwrap();

        let (mut client_side, client_accepted) = duplex_pair();
        let proxy_task = proxy.clone();
        let transit = tokio::spawn(async move { proxy_task.handle_connection(client_accepted).await });

        Message::Setup {
            min_version: 6,
            max_version: 6,
            peer_remote_endpoint: granted.to_string(),
        }
        .write_to(&mut client_side)
        .await
        .unwrap();

        let forwarded = Message::read_from(&mut server_side).await.unwrap();
        match forwarded {
            Message::Setup { peer_remote_endpoint, .. } => {
                let rewritten = Endpoint::parse(&peer_remote_endpoint).unwrap();
                assert!(rewritten.route().is_empty());
            }
            other => panic!("expected forwarded Setup, got {other:?}"),
        }

        client_side.write_all(b"hello server").await.unwrap();
        let mut buf = [0u8; 12];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello server");

        server_side.write_all(b"hi client").await.unwrap();
        let mut buf = [0u8; 9];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi client");

        drop(client_side);
        drop(server_side);
        transit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transit_to_an_unknown_routing_id_is_no_such_name() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")));
        let (mut client_side, client_accepted) = duplex_pair();
        let proxy_task = proxy.clone();
        let handle = tokio::spawn(async move { proxy_task.handle_connection(client_accepted).await });

        let stray = ep("somewhere:1").with_routing_id(RoutingId::generate());
        Message::Setup {
            min_version: 6,
            max_version: 6,
            peer_remote_endpoint: stray.to_string(),
        }
        .write_to(&mut client_side)
        .await
        .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), carrier_endpoint::ErrorKind::NoSuchName);
    }

    #[tokio::test]
    async fn downstream_proxy_chaining_extends_the_route() {
        let upstream = Arc::new(Proxy::new(ep("upstream.example:9000")));
        let downstream = Arc::new(Proxy::new(ep("downstream-unused:0")));

        let (down_conn, up_accepted) = duplex_pair();
        let upstream_clone = upstream.clone();
        let upstream_registration = tokio::spawn(async move { upstream_clone.handle_connection(up_accepted).await });
        downstream.register_with_upstream(down_conn).await.unwrap();
        upstream_registration.await.unwrap().unwrap();

        assert_eq!(upstream.registration_count(), 1);

        let (mut server_side, server_accepted) = duplex_pair();
        Message::ProxyServerRequest.write_to(&mut server_side).await.unwrap();
        downstream.clone().handle_connection(server_accepted).await.unwrap();
        let reply = Message::read_from(&mut server_side).await.unwrap();
        let Message::ProxyResponse { endpoints } = reply else {
            panic!("expected ProxyResponse");
        };
        let granted = Endpoint::parse(&endpoints[0]).unwrap();

        assert_eq!(granted.address(), "upstream.example:9000");
        assert_eq!(granted.route().len(), 1);

        let (mut client_side, client_accepted) = duplex_pair();
        let upstream_task = upstream.clone();
        let transit = tokio::spawn(async move { upstream_task.handle_connection(client_accepted).await });

        Message::Setup {
            min_version: 6,
            max_version: 6,
            peer_remote_endpoint: granted.to_string(),
        }
        .write_to(&mut client_side)
        .await
        .unwrap();

        client_side.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client_side);
        drop(server_side);
        transit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn republish_resends_proxy_response_after_base_changes() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")));
        let (mut registrant, accepted) = duplex_pair();
        Message::ProxyServerRequest.write_to(&mut registrant).await.unwrap();
        proxy.clone().handle_connection(accepted).await.unwrap();
        let _first = Message::read_from(&mut registrant).await.unwrap();

        proxy.set_base(ep("proxy.example:9100"), Vec::new());
        proxy.republish().await;

        let second = Message::read_from(&mut registrant).await.unwrap();
        let Message::ProxyResponse { endpoints } = second else {
            panic!("expected ProxyResponse");
        };
        let granted = Endpoint::parse(&endpoints[0]).unwrap();
        assert_eq!(granted.address(), "proxy.example:9100");
    }

    #[tokio::test]
    async fn listen_accepts_and_classifies_connections_from_an_acceptor() {
        let proxy = Arc::new(Proxy::new(ep("proxy.example:9000")));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let acceptor = Arc::new(OneShotAcceptor {
            rx: tokio::sync::Mutex::new(rx),
        });
        proxy.listen(acceptor);

        let (mut registrant, accepted) = duplex_pair();
        tx.send(accepted).unwrap();

        Message::ProxyServerRequest.write_to(&mut registrant).await.unwrap();
        let reply = Message::read_from(&mut registrant).await.unwrap();
        assert!(matches!(reply, Message::ProxyResponse { .. }));
    }
}
