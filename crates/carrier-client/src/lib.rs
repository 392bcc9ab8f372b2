//! RPC client engine (spec §2 `client`, §4.10 "symmetric counterpart of
//! server"): resolves a name through [`carrier_ns::NamespaceResolver`],
//! filters/orders the candidate endpoints, dials through
//! [`carrier_manager::StreamManager`], runs the call over a Flow, and
//! retries the whole attempt on transport-level failure (spec §7).
//!
//! The value codec for positional arguments/results and the blessing
//! store are external collaborators (spec §1); this crate only carries
//! already-encoded argument bytes and an opaque granted-blessings blob.

use bytes::Bytes;
use carrier_endpoint::{CarrierError, Endpoint, ErrorKind, Result as EpResult};
use carrier_manager::StreamManager;
use carrier_ns::{MountedServer, NamespaceResolver};
use carrier_server::wire::{self, RequestEnvelope, ResponseEnvelope, ResultFrame, StreamFrame};
use carrier_vc::Flow;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables for dialing and the client-side retry loop (spec §0 ambient
/// `RuntimeConfig`, §7 "retries ... with exponential backoff capped at
/// one minute").
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dial_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// Opaque blessings blob presented on every call (spec §6 "granted
    /// blessings"); the full blessing-store exchange is an external
    /// collaborator, so this is just the bytes that collaborator handed
    /// back for "the peer this call is going to".
    pub default_blessings: Vec<u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            dial_timeout: Duration::from_secs(5),
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(60),
            default_blessings: vec![1],
        }
    }
}

/// The RPC client engine: resolve, dial, call (spec §2 `client`).
#[derive(Clone)]
pub struct RpcClient {
    manager: StreamManager,
    resolver: Arc<NamespaceResolver>,
    config: ClientConfig,
}

impl RpcClient {
    pub fn new(manager: StreamManager, resolver: Arc<NamespaceResolver>, config: ClientConfig) -> Self {
        RpcClient {
            manager,
            resolver,
            config,
        }
    }

    /// Resolves `name`, dials the first endpoint that accepts the call,
    /// and opens it for streaming use (spec §4.8 point 7's client-side
    /// counterpart). Does not retry across the overall deadline — see
    /// [`RpcClient::call`] for the retrying unary convenience.
    pub async fn start_call(
        &self,
        name: &str,
        method: &str,
        args: Vec<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> EpResult<ClientCall> {
        let entry = self
            .resolver
            .resolve(name)
            .await
            .map_err(|e| e.0)?;
        let candidates = order_endpoints(&entry.servers);
        if candidates.is_empty() {
            return Err(CarrierError::no_such_name(format!(
                "{name:?} resolved to no usable endpoints"
            )));
        }

        let mut last_err: Option<CarrierError> = None;
        for endpoint in candidates {
            match self
                .dial_and_open(&endpoint, &entry.suffix, method, args.clone(), deadline)
                .await
            {
                Ok(call) => return Ok(call),
                Err(e) if e.kind() == ErrorKind::Aborted => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CarrierError::aborted("no endpoint accepted the call")))
    }

    async fn dial_and_open(
        &self,
        server_ep: &Endpoint,
        suffix: &str,
        method: &str,
        args: Vec<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> EpResult<ClientCall> {
        let budget = time_budget(deadline, self.config.dial_timeout);
        let dialed = tokio::time::timeout(budget, self.manager.dial(server_ep))
            .await
            .map_err(|_| CarrierError::timeout(format!("dial to {server_ep} timed out")))??;
        let flow = dialed.connect().await?;

        let timeout_ms = deadline.map(|d| {
            d.saturating_duration_since(Instant::now()).as_millis() as u64
        });
        let request = RequestEnvelope {
            method: method.to_string(),
            suffix: suffix.to_string(),
            timeout_ms,
            granted_blessings: self.config.default_blessings.clone(),
            discharges: Vec::new(),
            trace: None,
            args,
        };
        let bytes = wire::encode(&request).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
        flow.write(Bytes::from(bytes)).await?;
        Ok(ClientCall { flow })
    }

    /// Convenience unary call: starts a call, immediately half-closes the
    /// stream side (no further items sent), and waits for the final
    /// response (spec §8 scenario 1 "Echo round trip"). Retries the whole
    /// attempt on *aborted*/connection-level failure until `deadline`,
    /// with exponential backoff capped at one minute (spec §7); does not
    /// retry *no-access* or *no-such-name*.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        args: Vec<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> EpResult<Vec<Vec<u8>>> {
        let mut backoff = self.config.retry_backoff_base;
        loop {
            let attempt = self.call_once(name, method, args.clone(), deadline).await;
            match attempt {
                Ok(results) => return Ok(results),
                Err(e) if e.kind().is_retryable() => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(e);
                        }
                    }
                    tracing::debug!(name, method, error = %e, backoff_ms = backoff.as_millis(), "retrying rpc call");
                    let sleep_for = match deadline {
                        Some(d) => backoff.min(d.saturating_duration_since(Instant::now())),
                        None => backoff,
                    };
                    tokio::time::sleep(sleep_for).await;
                    backoff = (backoff * 2).min(self.config.retry_backoff_max);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(
        &self,
        name: &str,
        method: &str,
        args: Vec<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> EpResult<Vec<Vec<u8>>> {
        let call = self.start_call(name, method, args, deadline).await?;
        call.close_send().await?;
        call.finish().await
    }
}

/// How long is left before `deadline`, capped at `cap` (spec §5 "RPC call
/// (client-side) bounded by the context's deadline").
fn time_budget(deadline: Option<Instant>, cap: Duration) -> Duration {
    match deadline {
        Some(d) => d.saturating_duration_since(Instant::now()).min(cap),
        None => cap,
    }
}

/// Orders a mount entry's replica servers for dialing (spec §2 `client`
/// "filters/orders endpoints"): unparsable entries are dropped, and
/// direct endpoints (no proxy route) are tried before routed ones, since
/// a direct dial is cheaper and has fewer points of failure. Ties keep
/// the mount table's original order.
fn order_endpoints(servers: &[MountedServer]) -> Vec<Endpoint> {
    let mut parsed: Vec<Endpoint> = servers
        .iter()
        .filter_map(|s| Endpoint::parse(&s.server).ok())
        .collect();
    parsed.sort_by_key(|ep| ep.route().len());
    parsed
}

/// One in-flight RPC call's view of its Flow (spec §4.8 point 7, client
/// side). `send`/`recv` carry streamed items; `finish` waits for the
/// terminal response.
pub struct ClientCall {
    flow: Flow,
}

impl ClientCall {
    /// Sends one streamed item to the server (spec §8 scenario 2
    /// "Client Sends `bar`, `baz`").
    pub async fn send(&self, item: Vec<u8>) -> EpResult<()> {
        let frame = StreamFrame {
            item: Some(item),
            close_send: false,
        };
        let bytes = wire::encode(&frame).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
        self.flow.write(Bytes::from(bytes)).await
    }

    /// Signals no further streamed items (spec §8 scenario 2
    /// "CloseSend").
    pub async fn close_send(&self) -> EpResult<()> {
        let frame = StreamFrame {
            item: None,
            close_send: true,
        };
        let bytes = wire::encode(&frame).map_err(|e| CarrierError::bad_protocol(e.to_string()))?;
        self.flow.write(Bytes::from(bytes)).await
    }

    /// Reads the next item the server streamed back, or `None` once the
    /// final response has arrived (call `finish` to retrieve it).
    pub async fn recv(&self) -> EpResult<Option<Vec<u8>>> {
        loop {
            let Some(bytes) = self.flow.read().await else {
                return Err(CarrierError::aborted("flow closed before a response arrived"));
            };
            match wire::decode::<ResultFrame>(&bytes)
                .map_err(|e| CarrierError::bad_protocol(e.to_string()))?
            {
                ResultFrame::Item(item) => return Ok(Some(item)),
                ResultFrame::Final(response) => {
                    return finalize(response).map(|_| None);
                }
            }
        }
    }

    /// Drains any remaining streamed items and returns the call's
    /// positional results, or the application error the server reported
    /// (spec §8 scenario 1, "Finishes").
    pub async fn finish(&self) -> EpResult<Vec<Vec<u8>>> {
        loop {
            let Some(bytes) = self.flow.read().await else {
                return Err(CarrierError::aborted("flow closed before a response arrived"));
            };
            match wire::decode::<ResultFrame>(&bytes)
                .map_err(|e| CarrierError::bad_protocol(e.to_string()))?
            {
                ResultFrame::Item(_) => continue,
                ResultFrame::Final(response) => return finalize(response),
            }
        }
    }
}

fn finalize(response: ResponseEnvelope) -> EpResult<Vec<Vec<u8>>> {
    match response.error {
        Some(wire_error) => Err(wire_error.into()),
        None => Ok(response.results),
    }
}
