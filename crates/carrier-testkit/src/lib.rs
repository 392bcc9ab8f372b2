//! Shared test harness for the carrier workspace: an in-memory
//! [`Connector`]/[`Acceptor`] pair keyed by address (generalizing the
//! duplicated duplex-pair helpers that used to live in each crate's own
//! test module), plus an [`RpcMountTableClient`]/[`MountTableInvoker`]
//! pair that serves `ResolveStep`/`Mount`/`Unmount`/`GlobStep` as real RPC
//! methods over real Flows, instead of the in-process `FakeMountTable`
//! stand-in `carrier-ns` uses for its own unit tests.
//!
//! Everything here is `#[cfg(test)]`-free on purpose: other crates'
//! integration tests depend on this crate as an ordinary dev-dependency,
//! and `carrier-proxy-cli` depends on it as an ordinary dependency to
//! reach a namespace's mount tables over a real `StreamManager` instead
//! of re-deriving the wire glue `RpcMountTableClient` already has.

use bytes::Bytes;
use carrier_endpoint::{CarrierError, Endpoint, Result as EpResult, RoutingId};
use carrier_manager::{Acceptor, BoxedConn, Connector};
use carrier_msg::Message;
use carrier_ns::{ClientFactory, GlobMatch, MountEntry, MountTableClient, MountedServer};
use carrier_server::wire::{self, RequestEnvelope, ResultFrame};
use carrier_server::{CallContext, Invoker, MethodStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type BoxConnFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>>;
type BoxFut<'a, T> = Pin<Box<dyn Future<Output = EpResult<T>> + Send + 'a>>;

/// A shared in-memory network: every [`InMemoryConnector`] built from it can
/// dial any address an [`InMemoryAcceptor`] from the same network has been
/// registered under, the way every process on a real LAN can dial any
/// other's listening socket. `carrier-manager`'s own tests only ever wire
/// up a single fixed pair; this generalizes that to the multiple
/// independently-addressed parties a proxy-relay or multi-hop namespace
/// test needs.
pub struct InMemoryNetwork {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<tokio::io::DuplexStream>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryNetwork {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Registers `address` as acceptable to dial and returns the acceptor
    /// side that receives connections dialed to it.
    pub fn acceptor(self: &Arc<Self>, address: &str) -> Arc<InMemoryAcceptor> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(address.to_string(), tx);
        Arc::new(InMemoryAcceptor {
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Returns a connector that can dial any address registered on this
    /// network, from any node.
    pub fn connector(self: &Arc<Self>) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            network: self.clone(),
        })
    }
}

pub struct InMemoryConnector {
    network: Arc<InMemoryNetwork>,
}

impl Connector for InMemoryConnector {
    fn dial<'a>(&'a self, address: &'a str) -> BoxConnFuture<'a> {
        Box::pin(async move {
            let tx = self.network.inboxes.lock().get(address).cloned();
            let tx = tx.ok_or_else(|| io::Error::other(format!("no listener registered at {address:?}")))?;
            let (dialer_side, acceptor_side) = tokio::io::duplex(64 * 1024);
            tx.send(acceptor_side)
                .map_err(|_| io::Error::other(format!("listener at {address:?} is gone")))?;
            Ok(Box::new(dialer_side) as BoxedConn)
        })
    }
}

pub struct InMemoryAcceptor {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<tokio::io::DuplexStream>>,
}

impl Acceptor for InMemoryAcceptor {
    fn accept<'a>(&'a self) -> BoxConnFuture<'a> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(stream) => Ok(Box::new(stream) as BoxedConn),
                None => Err(io::Error::other("no more incoming connections")),
            }
        })
    }
}

/// Registers `connector`'s caller with the proxy listening at
/// `proxy_address`, returning the endpoint the proxy granted and the
/// connection to keep as the long-lived back-channel (spec §4.9). Callers
/// must follow up with [`await_transit`] before handing the connection to
/// [`carrier_vif::Vif::spawn_acceptor`] — the registration reply and the
/// eventual transit's `Setup` preamble both travel over this one
/// connection.
pub async fn register_with_proxy(
    connector: &Arc<dyn Connector>,
    proxy_address: &str,
) -> EpResult<(Endpoint, BoxedConn)> {
    let mut conn = connector
        .dial(proxy_address)
        .await
        .map_err(|e| CarrierError::aborted(format!("dial to proxy failed: {e}")))?;
    Message::ProxyServerRequest
        .write_to(&mut conn)
        .await
        .map_err(|e| CarrierError::aborted(format!("failed to send registration: {e}")))?;
    let reply = Message::read_from(&mut conn)
        .await
        .map_err(|e| CarrierError::bad_protocol(format!("failed to read ProxyResponse: {e}")))?;
    let Message::ProxyResponse { endpoints } = reply else {
        return Err(CarrierError::bad_protocol("expected ProxyResponse from proxy"));
    };
    let granted = endpoints
        .first()
        .ok_or_else(|| CarrierError::bad_protocol("proxy granted no endpoints"))?;
    let granted = Endpoint::parse(granted).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
    Ok((granted, conn))
}

/// Waits for the proxy to start relaying a transit onto `conn` (spec §4.9
/// "forward a rewritten `Setup`"), discarding the forwarded header itself —
/// everything the registrant needs to resume the VIF handshake is already
/// implied by the bytes that follow.
pub async fn await_transit(conn: &mut BoxedConn) -> EpResult<()> {
    match Message::read_from(conn)
        .await
        .map_err(|e| CarrierError::bad_protocol(format!("failed to read transit Setup: {e}")))?
    {
        Message::Setup { .. } => Ok(()),
        other => Err(CarrierError::bad_protocol(format!(
            "expected Setup before transit, got {other:?}"
        ))),
    }
}

/// Dials a target reachable only through a proxy (spec §4.9): connects to
/// the proxy and sends the `Setup` that tells it which registrant to splice
/// this connection onto. The returned connection is ready for
/// [`carrier_vif::Vif::spawn_dialer`], exactly like a direct connection
/// would be.
pub async fn dial_through_proxy(
    connector: &Arc<dyn Connector>,
    proxy_address: &str,
    target: &Endpoint,
) -> EpResult<BoxedConn> {
    let mut conn = connector
        .dial(proxy_address)
        .await
        .map_err(|e| CarrierError::aborted(format!("dial to proxy failed: {e}")))?;
    let (min_version, max_version) = target.version_range();
    Message::Setup {
        min_version,
        max_version,
        peer_remote_endpoint: target.to_string(),
    }
    .write_to(&mut conn)
    .await
    .map_err(|e| CarrierError::aborted(format!("failed to send transit Setup: {e}")))?;
    Ok(conn)
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMountedServer {
    server: String,
    serves_mount_table: bool,
}

impl From<&MountedServer> for WireMountedServer {
    fn from(s: &MountedServer) -> Self {
        WireMountedServer {
            server: s.server.clone(),
            serves_mount_table: s.serves_mount_table,
        }
    }
}

impl From<WireMountedServer> for MountedServer {
    fn from(s: WireMountedServer) -> Self {
        MountedServer {
            server: s.server,
            serves_mount_table: s.serves_mount_table,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMountEntry {
    servers: Vec<WireMountedServer>,
    suffix: String,
    ttl_ms: u64,
}

impl From<WireMountEntry> for MountEntry {
    fn from(e: WireMountEntry) -> Self {
        MountEntry {
            servers: e.servers.into_iter().map(Into::into).collect(),
            suffix: e.suffix,
            ttl: Duration::from_millis(e.ttl_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireGlobMatch {
    name: String,
    servers: Vec<WireMountedServer>,
}

impl From<WireGlobMatch> for GlobMatch {
    fn from(m: WireGlobMatch) -> Self {
        GlobMatch {
            name: m.name,
            servers: m.servers.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MountArgs {
    name: String,
    server: String,
    ttl_ms: u64,
    serves_mount_table: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnmountArgs {
    name: String,
    server: String,
}

fn codec_err(e: wire::WireCodecError) -> CarrierError {
    CarrierError::bad_protocol(e.to_string())
}

/// A [`MountTableClient`] that talks to a real mount-table object over a
/// real Flow (spec §4.7/§4.8), the counterpart `carrier-ns`'s own
/// `FakeMountTable` test stub points at. Every call dials fresh: mount
/// tables are small, low-traffic objects and retrying/caching the
/// connection itself is the stream manager's job, not this client's.
pub struct RpcMountTableClient {
    manager: carrier_manager::StreamManager,
    server_ep: Endpoint,
}

impl RpcMountTableClient {
    pub fn new(manager: carrier_manager::StreamManager, server_ep: Endpoint) -> Self {
        RpcMountTableClient { manager, server_ep }
    }

    async fn call(&self, method: &str, args: Vec<Vec<u8>>) -> EpResult<Vec<Vec<u8>>> {
        let dialed = self.manager.dial(&self.server_ep).await?;
        let flow = dialed.connect().await?;
        let request = RequestEnvelope {
            method: method.to_string(),
            suffix: String::new(),
            timeout_ms: None,
            granted_blessings: vec![1],
            discharges: Vec::new(),
            trace: None,
            args,
        };
        let bytes = wire::encode(&request).map_err(codec_err)?;
        flow.write(Bytes::from(bytes)).await?;
        let response_bytes = flow
            .read()
            .await
            .ok_or_else(|| CarrierError::aborted("mount table closed the flow before responding"))?;
        match wire::decode::<ResultFrame>(&response_bytes).map_err(codec_err)? {
            ResultFrame::Final(response) => match response.error {
                Some(e) => Err(e.into()),
                None => Ok(response.results),
            },
            ResultFrame::Item(_) => Err(CarrierError::bad_protocol(
                "mount table streamed an item for a unary call",
            )),
        }
    }
}

impl MountTableClient for RpcMountTableClient {
    fn resolve_step<'a>(&'a self, suffix: &'a str) -> BoxFut<'a, MountEntry> {
        Box::pin(async move {
            let args = vec![wire::encode(&suffix).map_err(codec_err)?];
            let results = self.call("ResolveStep", args).await?;
            let entry: WireMountEntry = wire::decode(&results[0]).map_err(codec_err)?;
            Ok(entry.into())
        })
    }

    fn mount<'a>(
        &'a self,
        name: &'a str,
        server: &'a str,
        ttl: Duration,
        serves_mount_table: bool,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let args = MountArgs {
                name: name.to_string(),
                server: server.to_string(),
                ttl_ms: ttl.as_millis() as u64,
                serves_mount_table,
            };
            let bytes = wire::encode(&args).map_err(codec_err)?;
            self.call("Mount", vec![bytes]).await?;
            Ok(())
        })
    }

    fn unmount<'a>(&'a self, name: &'a str, server: &'a str) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let args = UnmountArgs {
                name: name.to_string(),
                server: server.to_string(),
            };
            let bytes = wire::encode(&args).map_err(codec_err)?;
            self.call("Unmount", vec![bytes]).await?;
            Ok(())
        })
    }

    fn glob_step<'a>(&'a self, pattern: &'a str) -> BoxFut<'a, Vec<GlobMatch>> {
        Box::pin(async move {
            let args = vec![wire::encode(&pattern).map_err(codec_err)?];
            let results = self.call("GlobStep", args).await?;
            results
                .into_iter()
                .map(|b| wire::decode::<WireGlobMatch>(&b).map(Into::into).map_err(codec_err))
                .collect()
        })
    }
}

/// Builds a [`ClientFactory`] whose mount tables are all dialed through one
/// shared [`carrier_manager::StreamManager`], keyed by endpoint string (the
/// form every `MountedServer::server` field is stored in).
pub fn rpc_client_factory(manager: carrier_manager::StreamManager) -> ClientFactory {
    Arc::new(move |server: &str| {
        let endpoint = Endpoint::parse(server).unwrap_or_else(|_| Endpoint::new("tcp", server));
        Arc::new(RpcMountTableClient::new(manager.clone(), endpoint)) as Arc<dyn MountTableClient>
    })
}

/// The server-side counterpart of [`RpcMountTableClient`]: an ordinary
/// `Invoker` whose object happens to implement `ResolveStep`/`Mount`/
/// `Unmount`/`GlobStep` (spec §4.8 "a mount table is just a server whose
/// `Invoker` happens to implement" these methods). Served at the empty
/// suffix, like every mount table in this workspace.
pub struct MountTableInvoker {
    mounts: Mutex<HashMap<String, Vec<MountedServer>>>,
}

impl Default for MountTableInvoker {
    fn default() -> Self {
        MountTableInvoker {
            mounts: Mutex::new(HashMap::new()),
        }
    }
}

impl MountTableInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(MountTableInvoker::default())
    }

    /// Seeds a mount directly, bypassing the `Mount` RPC — handy for
    /// building a fixture's starting state.
    pub fn mount_sync(&self, name: &str, server: MountedServer) {
        self.mounts.lock().entry(name.to_string()).or_default().push(server);
    }
}

fn split_first(name: &str) -> (&str, &str) {
    let name = name.trim_start_matches('/');
    match name.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (name, ""),
    }
}

impl Invoker for MountTableInvoker {
    fn method_names(&self) -> Vec<String> {
        vec![
            "ResolveStep".to_string(),
            "Mount".to_string(),
            "Unmount".to_string(),
            "GlobStep".to_string(),
        ]
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Vec<u8>>,
        _stream: &'a MethodStream<'a>,
    ) -> Pin<Box<dyn Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
        Box::pin(async move {
            match method {
                "ResolveStep" => {
                    let suffix: String = wire::decode(&args[0]).map_err(codec_err)?;
                    let (head, rest) = split_first(&suffix);
                    let mounts = self.mounts.lock();
                    match mounts.get(head) {
                        Some(servers) => {
                            let entry = WireMountEntry {
                                servers: servers.iter().map(Into::into).collect(),
                                suffix: rest.to_string(),
                                ttl_ms: 60_000,
                            };
                            Ok(vec![wire::encode(&entry).map_err(codec_err)?])
                        }
                        None => Err(CarrierError::no_such_name(format!("no mount for {head:?}"))),
                    }
                }
                "Mount" => {
                    let req: MountArgs = wire::decode(&args[0]).map_err(codec_err)?;
                    self.mounts.lock().entry(req.name).or_default().push(MountedServer {
                        server: req.server,
                        serves_mount_table: req.serves_mount_table,
                    });
                    Ok(Vec::new())
                }
                "Unmount" => {
                    let req: UnmountArgs = wire::decode(&args[0]).map_err(codec_err)?;
                    if let Some(servers) = self.mounts.lock().get_mut(&req.name) {
                        servers.retain(|s| s.server != req.server);
                    }
                    Ok(Vec::new())
                }
                "GlobStep" => {
                    let _pattern: String = wire::decode(&args[0]).map_err(codec_err)?;
                    let mounts = self.mounts.lock();
                    mounts
                        .iter()
                        .map(|(name, servers)| {
                            let m = WireGlobMatch {
                                name: name.clone(),
                                servers: servers.iter().map(Into::into).collect(),
                            };
                            wire::encode(&m).map_err(codec_err)
                        })
                        .collect()
                }
                other => Err(CarrierError::no_such_method(format!(
                    "mount table has no method {other:?}"
                ))),
            }
        })
    }
}

/// A dispatcher fronting exactly one object at the empty suffix — what
/// every mount table server in this workspace is built from.
pub struct SingleObjectDispatcher {
    object: Arc<dyn Invoker>,
}

impl SingleObjectDispatcher {
    pub fn new(object: Arc<dyn Invoker>) -> Arc<Self> {
        Arc::new(SingleObjectDispatcher { object })
    }
}

impl carrier_server::Dispatcher for SingleObjectDispatcher {
    fn lookup(&self, suffix: &str) -> Option<Arc<dyn Invoker>> {
        if suffix.is_empty() {
            Some(self.object.clone())
        } else {
            None
        }
    }
}
