//! Dispatcher / Authorizer / Invoker abstractions (spec §4.8 points 3-7,
//! §9 Design Notes "Reflection-based method dispatch ... may implement
//! dynamic dispatch via an `Invoker` abstraction that the application
//! fills in"). The application supplies these; this crate only calls
//! through them in the order the spec names.

use crate::wire::StreamFrame;
use carrier_endpoint::{CarrierError, Result as EpResult};
use carrier_vc::Flow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Resolves a suffix to the object serving it (spec §4.8 point 3
/// "Resolve (suffix, method) → (invoker, authorizer) via the configured
/// dispatcher"). One `Dispatcher` per server; the reserved `__debug`
/// prefix is served by a separately configured instance.
pub trait Dispatcher: Send + Sync + 'static {
    fn lookup(&self, suffix: &str) -> Option<Arc<dyn Invoker>>;

    /// Direct children of `suffix`, used by the built-in `Glob` method
    /// (spec §4.8 point 4). The default (no children) suits leaf objects;
    /// dispatchers fronting a tree of objects override it.
    fn children(&self, _suffix: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Authorizes one call (spec §6 "Authorizer: Authorize(call) → error").
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, call: &CallInfo<'_>) -> EpResult<()>;
}

/// What an `Authorizer` sees about the call it is being asked to admit.
pub struct CallInfo<'a> {
    pub suffix: &'a str,
    pub method: &'a str,
    pub granted_blessings: &'a [u8],
}

/// Admits every call. The natural default for objects that don't layer
/// their own access control on top of transport-level authentication.
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _call: &CallInfo<'_>) -> EpResult<()> {
        Ok(())
    }
}

/// Rejects every call. Used by conformance tests exercising the
/// *no-access* path (spec §8 scenario 3).
pub struct DenyAllAuthorizer;

impl Authorizer for DenyAllAuthorizer {
    fn authorize(&self, _call: &CallInfo<'_>) -> EpResult<()> {
        Err(CarrierError::no_access("application Authorizer denied access"))
    }
}

/// The out-of-the-box default policy (spec §6: "allow if remote has been
/// blessed by local, or vice versa"). The full blessing-store comparison
/// lives in the external Principal/BlessingStore collaborator (spec §1);
/// this in-tree stand-in treats a non-empty granted-blessings blob as
/// evidence that collaborator already vouched for the caller.
pub struct DefaultAuthorizer;

impl Authorizer for DefaultAuthorizer {
    fn authorize(&self, call: &CallInfo<'_>) -> EpResult<()> {
        if call.granted_blessings.is_empty() {
            Err(CarrierError::no_access("application Authorizer denied access"))
        } else {
            Ok(())
        }
    }
}

/// Per-call context handed to an `Invoker` (spec §4.8 "install them on a
/// per-call context", §4.9 cancellation). Cancelled when the deadline
/// passes or the underlying VC tears down.
pub struct CallContext {
    suffix: String,
    method: String,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
    _watcher_done: tokio::sync::oneshot::Sender<()>,
}

const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

impl CallContext {
    pub(crate) fn spawn(vc: carrier_vc::Vc, suffix: String, method: String, deadline: Option<Instant>) -> Self {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();

        let watcher_cancelled = cancelled.clone();
        let watcher_notify = notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut done_rx => return,
                    _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
                }
                let past_deadline = deadline.is_some_and(|d| Instant::now() >= d);
                if vc.is_closed() || past_deadline {
                    watcher_cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                    watcher_notify.notify_waiters();
                    return;
                }
            }
        });

        CallContext {
            suffix,
            method,
            cancelled,
            notify,
            _watcher_done: done_tx,
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once the context is cancelled (spec §4.9 "a goroutine
    /// equivalent watches both [deadline, Flow] and cancels the context").
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// A streaming method's view of its Flow: items beyond the initial
/// request/response, each individually framed (spec §4.8 point 7).
pub struct MethodStream<'a> {
    flow: &'a Flow,
}

impl<'a> MethodStream<'a> {
    pub(crate) fn new(flow: &'a Flow) -> Self {
        MethodStream { flow }
    }

    /// Reads the next streamed item, or `None` once the peer has called
    /// `CloseSend` (spec GLOSSARY "Flow... a half-close flag").
    pub async fn recv(&self) -> EpResult<Option<Vec<u8>>> {
        loop {
            let Some(bytes) = self.flow.read().await else {
                return Ok(None);
            };
            let frame: StreamFrame =
                crate::wire::decode(&bytes).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
            if let Some(item) = frame.item {
                return Ok(Some(item));
            }
            if frame.close_send {
                return Ok(None);
            }
        }
    }

    /// Sends one streamed item to the peer, tagged so it can't be
    /// confused with the eventual final response (spec §4.8 point 7).
    pub async fn send(&self, item: Vec<u8>) -> EpResult<()> {
        let frame = crate::wire::ResultFrame::Item(item);
        let bytes = crate::wire::encode(&frame).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
        self.flow.write(bytes::Bytes::from(bytes)).await
    }
}

/// An application-supplied object: resolves to one or more methods,
/// invoked by suffix+method name (spec §9 "Invoker abstraction that the
/// application fills in").
pub trait Invoker: Send + Sync + 'static {
    /// Per-object authorization policy; defaults to admitting every call,
    /// since transport-level authentication already ran during the VC
    /// handshake.
    fn authorizer(&self) -> Arc<dyn Authorizer> {
        Arc::new(AllowAllAuthorizer)
    }

    /// Method names this object serves, consulted by the built-in
    /// `Signature`/`MethodSignature` methods (spec §4.8 point 4).
    fn method_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invokes `method` with already-received positional `args`. Streaming
    /// methods read/write further items through `stream` before this
    /// future resolves; the returned `Vec<Vec<u8>>` are the positional
    /// results framed into the final response.
    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Vec<u8>>,
        stream: &'a MethodStream<'a>,
    ) -> BoxFut<'a, EpResult<Vec<Vec<u8>>>>;
}

pub(crate) const RESERVED_METHODS: &[&str] = &["Glob", "Signature", "MethodSignature"];

pub(crate) fn is_reserved_method(method: &str) -> bool {
    RESERVED_METHODS.contains(&method)
}

/// Internal invoker for the built-in reflection methods (spec §4.8 point
/// 4: "route to an internal invoker that consults the dispatcher to
/// enumerate children/introspect methods").
pub(crate) struct ReservedInvoker {
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) target: Arc<dyn Invoker>,
}

impl Invoker for ReservedInvoker {
    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        _args: Vec<Vec<u8>>,
        _stream: &'a MethodStream<'a>,
    ) -> BoxFut<'a, EpResult<Vec<Vec<u8>>>> {
        Box::pin(async move {
            match method {
                "Glob" => {
                    let children = self.dispatcher.children(ctx.suffix());
                    Ok(children.into_iter().map(|c| c.into_bytes()).collect())
                }
                "Signature" | "MethodSignature" => {
                    let names = self.target.method_names();
                    Ok(names.into_iter().map(|n| n.into_bytes()).collect())
                }
                other => Err(CarrierError::no_such_method(format!(
                    "reserved invoker has no method {other:?}"
                ))),
            }
        })
    }
}
