//! RPC server engine (spec §4.8, §2 `rpc-server`): accepts Flows on VCs
//! handed over by the stream manager, reads one `RequestEnvelope` per
//! Flow, resolves it to an application `Invoker` through a `Dispatcher`,
//! authorizes it, runs it with cancellation wired to the Flow/deadline,
//! and writes back a `ResponseEnvelope`.
//!
//! The value codec for positional arguments/results and the
//! blessing/discharge verification are external collaborators (spec §1);
//! this crate only carries their already-encoded bytes.

mod dispatch;
pub mod wire;

pub use dispatch::{
    AllowAllAuthorizer, Authorizer, CallContext, CallInfo, DefaultAuthorizer, DenyAllAuthorizer,
    Dispatcher, Invoker, MethodStream,
};

use carrier_endpoint::{CarrierError, ErrorKind, Result as EpResult};
use carrier_manager::Accepted;
use carrier_vc::{Flow, Vc};
use dispatch::{is_reserved_method, ReservedInvoker};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use wire::{RequestEnvelope, ResponseEnvelope, WireError};

const DEBUG_PREFIX: &str = "__debug";
const REQUEST_READ_GUARD: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum LifecycleState {
    Init,
    Active,
    Stopping,
    Stopped,
}

struct ServerInner {
    dispatcher: Arc<dyn Dispatcher>,
    debug_dispatcher: Option<Arc<dyn Dispatcher>>,
    state: parking_lot::Mutex<LifecycleState>,
    in_flight: AtomicUsize,
    idle: Notify,
    next_trace_id: AtomicU64,
}

/// One running RPC server (spec §4.8 "Server lifecycle").
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        RpcServer {
            inner: Arc::new(ServerInner {
                dispatcher,
                debug_dispatcher: None,
                state: parking_lot::Mutex::new(LifecycleState::Init),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                next_trace_id: AtomicU64::new(1),
            }),
        }
    }

    /// Installs a separate dispatcher for suffixes under `__debug` (spec
    /// §4.8 point 3 "names under a reserved `__debug` prefix route to a
    /// separately configured debug dispatcher").
    pub fn with_debug_dispatcher(mut self, debug_dispatcher: Arc<dyn Dispatcher>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_debug_dispatcher must run before the server is cloned/shared")
            .debug_dispatcher = Some(debug_dispatcher);
        self
    }

    fn set_state(&self, state: LifecycleState) {
        *self.inner.state.lock() = state;
    }

    fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// Consumes a manager's `listen()` channel, spawning [`Self::serve_vc`]
    /// for every accepted VC and every VC the peer later opens on it (spec
    /// §4.5/§4.8: VIFs are shared, one server handles every VC that lands
    /// on a manager's accept channel).
    pub fn serve_accepted(&self, mut accepted: mpsc::UnboundedReceiver<Accepted>) {
        self.set_state(LifecycleState::Active);
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(Accepted { vif: _vif, mut vcs }) = accepted.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    while let Some(vc) = vcs.recv().await {
                        server.serve_vc(vc);
                    }
                });
            }
        });
    }

    /// Accepts Flows on one VC until it closes (spec §4.8 "Accept a Flow
    /// from a Listener").
    pub fn serve_vc(&self, vc: Vc) {
        self.set_state(LifecycleState::Active);
        let server = self.clone();
        tokio::spawn(async move {
            let mut listener = match vc.listen() {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(error = %e, "vc has no flows to listen for");
                    return;
                }
            };
            while let Some(flow) = listener.recv().await {
                if server.state() != LifecycleState::Active {
                    flow.close_send();
                    continue;
                }
                let server = server.clone();
                let vc = vc.clone();
                tokio::spawn(async move {
                    server.handle_flow(vc, flow).await;
                });
            }
        });
    }

    /// Runs the 8-step per-Flow request handler (spec §4.8).
    async fn handle_flow(&self, vc: Vc, flow: Flow) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.handle_flow_inner(&vc, &flow).await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "flow handler ended with an error before a response was sent");
        }
        flow.close_send();
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    async fn handle_flow_inner(&self, vc: &Vc, flow: &Flow) -> EpResult<()> {
        // 1. Read the request envelope.
        let Some(bytes) = flow.read().await else {
            return Ok(());
        };
        let request: RequestEnvelope =
            wire::decode(&bytes).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;

        // 2-4. Resolve the dispatcher, look up the invoker, wrap reserved
        // methods in the reflection invoker.
        let dispatcher = if request.suffix == DEBUG_PREFIX
            || request.suffix.starts_with(&format!("{DEBUG_PREFIX}/"))
        {
            self.inner
                .debug_dispatcher
                .clone()
                .unwrap_or_else(|| self.inner.dispatcher.clone())
        } else {
            self.inner.dispatcher.clone()
        };

        let invoker = match dispatcher.lookup(&request.suffix) {
            Some(invoker) if is_reserved_method(&request.method) => Arc::new(ReservedInvoker {
                dispatcher: dispatcher.clone(),
                target: invoker,
            }) as Arc<dyn Invoker>,
            Some(invoker) => invoker,
            None if is_reserved_method(&request.method) => Arc::new(ReservedInvoker {
                dispatcher: dispatcher.clone(),
                target: Arc::new(EmptyInvoker) as Arc<dyn Invoker>,
            }) as Arc<dyn Invoker>,
            None => {
                return self
                    .respond_error(flow, CarrierError::no_such_suffix(&request.suffix))
                    .await;
            }
        };

        // 5. Authorize.
        let call_info = CallInfo {
            suffix: &request.suffix,
            method: &request.method,
            granted_blessings: &request.granted_blessings,
        };
        if let Err(e) = invoker.authorizer().authorize(&call_info) {
            return self.respond_error(flow, e).await;
        }

        // 6. Build the per-call context and stream wrapper.
        let deadline = request.timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let ctx = CallContext::spawn(vc.clone(), request.suffix.clone(), request.method.clone(), deadline);
        let stream = MethodStream::new(flow);

        // 7. Invoke, racing completion against cancellation.
        let invoke_fut = invoker.invoke(&ctx, &request.method, request.args, &stream);
        tokio::pin!(invoke_fut);
        let outcome = tokio::select! {
            result = &mut invoke_fut => result,
            _ = ctx.cancelled() => Err(CarrierError::cancelled("call cancelled: deadline exceeded or flow closed")),
        };

        // 8. Write the response.
        match outcome {
            Ok(results) => {
                let response = ResponseEnvelope {
                    error: None,
                    end_of_stream: true,
                    results,
                    trace: None,
                };
                self.write_response(flow, response).await
            }
            Err(e) => self.respond_error(flow, e).await,
        }
    }

    async fn respond_error(&self, flow: &Flow, error: CarrierError) -> EpResult<()> {
        let response = ResponseEnvelope {
            error: Some(WireError::from(error)),
            end_of_stream: true,
            results: Vec::new(),
            trace: None,
        };
        self.write_response(flow, response).await
    }

    async fn write_response(&self, flow: &Flow, response: ResponseEnvelope) -> EpResult<()> {
        let frame = wire::ResultFrame::Final(response);
        let bytes = wire::encode(&frame).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
        flow.write(bytes::Bytes::from(bytes)).await
    }

    /// Stops accepting new Flows and waits for in-flight calls to finish
    /// (spec §4.8 "Stop: refuse new Flows, let in-flight calls finish").
    pub async fn stop(&self) {
        self.set_state(LifecycleState::Stopping);
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            self.inner.idle.notified().await;
        }
        self.set_state(LifecycleState::Stopped);
    }

    /// Stops immediately, without waiting for in-flight calls (spec §4.8
    /// "ForceStop: like Stop, but doesn't wait").
    pub fn force_stop(&self) {
        self.set_state(LifecycleState::Stopped);
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

/// Dispatcher with nothing mounted, used only to serve `Glob` on a suffix
/// that resolves to no object of its own.
struct EmptyInvoker;

impl Invoker for EmptyInvoker {
    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _method: &'a str,
        _args: Vec<Vec<u8>>,
        _stream: &'a MethodStream<'a>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrier_endpoint::Endpoint;
    use carrier_manager::{Connector, StreamManager};
    use carrier_vc::Flow;
    use std::collections::HashMap;
    use std::future::Future;
    use std::io;
    use std::pin::Pin;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::sync::mpsc::UnboundedSender;

    type BoxedConn = Box<dyn carrier_manager::Conn>;
    type BoxedConnFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>>;

    struct InMemoryConnector {
        peer: parking_lot::Mutex<Option<UnboundedSender<tokio::io::DuplexStream>>>,
    }

    impl Connector for InMemoryConnector {
        fn dial<'a>(&'a self, _address: &'a str) -> BoxedConnFuture<'a> {
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

    impl carrier_manager::Acceptor for InMemoryAcceptor {
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

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new("tcp", addr)
    }

    fn test_pair() -> (Arc<InMemoryConnector>, Arc<InMemoryAcceptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(InMemoryConnector {
            peer: parking_lot::Mutex::new(Some(tx)),
        });
        let acceptor = Arc::new(InMemoryAcceptor {
            rx: tokio::sync::Mutex::new(rx),
        });
        (connector, acceptor)
    }

    struct EchoInvoker;

    impl Invoker for EchoInvoker {
        fn invoke<'a>(
            &'a self,
            _ctx: &'a CallContext,
            method: &'a str,
            args: Vec<Vec<u8>>,
            _stream: &'a MethodStream<'a>,
        ) -> Pin<Box<dyn Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
            Box::pin(async move {
                if method == "Echo" {
                    Ok(args)
                } else {
                    Err(CarrierError::no_such_method(method))
                }
            })
        }

        fn method_names(&self) -> Vec<String> {
            vec!["Echo".to_string()]
        }
    }

    struct DeniedInvoker;

    impl Invoker for DeniedInvoker {
        fn authorizer(&self) -> Arc<dyn Authorizer> {
            Arc::new(DenyAllAuthorizer)
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a CallContext,
            _method: &'a str,
            _args: Vec<Vec<u8>>,
            _stream: &'a MethodStream<'a>,
        ) -> Pin<Box<dyn Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct StreamingInvoker;

    impl Invoker for StreamingInvoker {
        fn invoke<'a>(
            &'a self,
            _ctx: &'a CallContext,
            _method: &'a str,
            _args: Vec<Vec<u8>>,
            stream: &'a MethodStream<'a>,
        ) -> Pin<Box<dyn Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
            Box::pin(async move {
                let mut total = 0u64;
                while let Some(item) = stream.recv().await? {
                    total += item.len() as u64;
                }
                Ok(vec![total.to_le_bytes().to_vec()])
            })
        }
    }

    struct HangingInvoker;

    impl Invoker for HangingInvoker {
        fn invoke<'a>(
            &'a self,
            ctx: &'a CallContext,
            _method: &'a str,
            _args: Vec<Vec<u8>>,
            _stream: &'a MethodStream<'a>,
        ) -> Pin<Box<dyn Future<Output = EpResult<Vec<Vec<u8>>>> + Send + 'a>> {
            Box::pin(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if ctx.is_cancelled() {
                        return Err(CarrierError::cancelled("noticed cancellation"));
                    }
                }
            })
        }
    }

    struct MapDispatcher {
        objects: HashMap<String, Arc<dyn Invoker>>,
    }

    impl Dispatcher for MapDispatcher {
        fn lookup(&self, suffix: &str) -> Option<Arc<dyn Invoker>> {
            self.objects.get(suffix).cloned()
        }

        fn children(&self, suffix: &str) -> Vec<String> {
            let prefix = if suffix.is_empty() {
                String::new()
            } else {
                format!("{suffix}/")
            };
            self.objects
                .keys()
                .filter_map(|name| name.strip_prefix(prefix.as_str()))
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(|rest| rest.to_string())
                .collect()
        }
    }

    async fn call(
        flow: &Flow,
        suffix: &str,
        method: &str,
        args: Vec<Vec<u8>>,
        timeout_ms: Option<u64>,
    ) -> ResponseEnvelope {
        let request = RequestEnvelope {
            method: method.to_string(),
            suffix: suffix.to_string(),
            timeout_ms,
            granted_blessings: vec![1],
            discharges: vec![],
            trace: None,
            args,
        };
        let bytes = wire::encode(&request).unwrap();
        flow.write(bytes::Bytes::from(bytes)).await.unwrap();
        let response_bytes = flow.read().await.expect("server should respond");
        match wire::decode(&response_bytes).unwrap() {
            wire::ResultFrame::Final(response) => response,
            wire::ResultFrame::Item(_) => panic!("expected the final response, got a stream item"),
        }
    }

    async fn wire_up(
        dispatcher: Arc<dyn Dispatcher>,
    ) -> (StreamManager, carrier_manager::DialedVc, RpcServer) {
        let (connector, acceptor) = test_pair();
        let server_manager = StreamManager::new(ep("server:0"), connector.clone());
        let accepted = server_manager.listen(acceptor);
        let client_manager = StreamManager::new(ep("client:0"), connector);

        let server = RpcServer::new(dispatcher);
        server.serve_accepted(accepted);

        let dialed = client_manager.dial(&ep("server:1234")).await.unwrap();
        (client_manager, dialed, server)
    }

    #[tokio::test]
    async fn echo_call_round_trips() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("echo".to_string(), Arc::new(EchoInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let response = call(&flow, "echo", "Echo", vec![b"hi".to_vec()], None).await;

        assert!(response.error.is_none());
        assert_eq!(response.results, vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn missing_suffix_returns_no_such_suffix() {
        let dispatcher = Arc::new(MapDispatcher {
            objects: HashMap::new(),
        });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let response = call(&flow, "nope", "Echo", vec![], None).await;

        let error = response.error.expect("expected an error");
        let restored: CarrierError = error.into();
        assert_eq!(restored.kind(), ErrorKind::NoSuchSuffix);
    }

    #[tokio::test]
    async fn denied_authorizer_returns_no_access() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("locked".to_string(), Arc::new(DeniedInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let response = call(&flow, "locked", "Anything", vec![], None).await;

        let error = response.error.expect("expected an error");
        let restored: CarrierError = error.into();
        assert_eq!(restored.kind(), ErrorKind::NoAccess);
    }

    #[tokio::test]
    async fn glob_lists_direct_children() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("a/b".to_string(), Arc::new(EchoInvoker));
        objects.insert("a/c".to_string(), Arc::new(EchoInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let response = call(&flow, "a", "Glob", vec![], None).await;

        assert!(response.error.is_none());
        let mut names: Vec<String> = response
            .results
            .into_iter()
            .map(|b| String::from_utf8(b).unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn streaming_method_sums_sent_items() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("sum".to_string(), Arc::new(StreamingInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let request = RequestEnvelope {
            method: "Sum".to_string(),
            suffix: "sum".to_string(),
            timeout_ms: None,
            granted_blessings: vec![1],
            discharges: vec![],
            trace: None,
            args: vec![],
        };
        flow.write(bytes::Bytes::from(wire::encode(&request).unwrap()))
            .await
            .unwrap();

        for chunk in [b"ab".to_vec(), b"cde".to_vec()] {
            let frame = wire::StreamFrame {
                item: Some(chunk),
                close_send: false,
            };
            flow.write(bytes::Bytes::from(wire::encode(&frame).unwrap()))
                .await
                .unwrap();
        }
        let close = wire::StreamFrame {
            item: None,
            close_send: true,
        };
        flow.write(bytes::Bytes::from(wire::encode(&close).unwrap()))
            .await
            .unwrap();

        let response_bytes = flow.read().await.unwrap();
        let response = match wire::decode(&response_bytes).unwrap() {
            wire::ResultFrame::Final(response) => response,
            wire::ResultFrame::Item(_) => panic!("expected the final response, got a stream item"),
        };
        assert!(response.error.is_none());
        let total = u64::from_le_bytes(response.results[0].clone().try_into().unwrap());
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn deadline_cancels_a_hanging_call() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("slow".to_string(), Arc::new(HangingInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, _server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let response = call(&flow, "slow", "Hang", vec![], Some(50)).await;

        let error = response.error.expect("expected a cancellation error");
        let restored: CarrierError = error.into();
        assert_eq!(restored.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_calls() {
        let mut objects: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        objects.insert("echo".to_string(), Arc::new(EchoInvoker));
        let dispatcher = Arc::new(MapDispatcher { objects });
        let (_mgr, dialed, server) = wire_up(dispatcher).await;

        let flow = dialed.connect().await.unwrap();
        let _ = call(&flow, "echo", "Echo", vec![b"x".to_vec()], None).await;

        server.stop().await;
        assert_eq!(server.in_flight_count(), 0);
    }
}
