//! Client half of the proxy-to-handler accept bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use gripd_wire::accept::{AcceptData, RpcRequest, RpcResponse};
use gripd_x::bus::{Bus, DealerSender, DEFAULT_HWM};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of offering a session to the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// Handler took ownership; the proxy is done with the session.
    Accepted,
    /// Handler declined; the proxy serves the buffered response itself.
    Rejected(Bytes),
}

struct AcceptInner {
    out: DealerSender,
    pending: Mutex<HashMap<Bytes, oneshot::Sender<RpcResponse>>>,
    next_id: AtomicU64,
}

/// Issues `accept` calls over the bus. Cheap to clone.
#[derive(Clone)]
pub struct AcceptClient {
    inner: Arc<AcceptInner>,
}

impl AcceptClient {
    pub fn new(bus: &Bus, instance_id: impl Into<Bytes>, endpoint: &str) -> Self {
        let mut socket = bus.connect_dealer(endpoint, instance_id, DEFAULT_HWM);
        let out = socket.sender();
        let inner = Arc::new(AcceptInner {
            out,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let recv_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = socket.recv().await {
                let Some(frame) = msg.iter().find(|f| !f.is_empty()) else {
                    continue;
                };
                let response = match RpcResponse::decode(frame) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "accept reply invalid, skipping");
                        continue;
                    }
                };
                let waiter = recv_inner.pending.lock().unwrap().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("accept reply for unknown call"),
                }
            }
        });

        Self { inner }
    }

    /// Offer a paused session bundle to the handler. Any transport failure
    /// or timeout reads as a rejection so the caller falls back to serving
    /// the cached response.
    pub async fn accept(&self, data: &AcceptData) -> AcceptOutcome {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = Bytes::from(format!("accept-{n}"));

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id.clone(), tx);

        let request = RpcRequest {
            id: id.clone(),
            method: "accept".into(),
            args: data.to_value(),
        };

        if self
            .inner
            .out
            .send(vec![Bytes::new(), request.encode()])
            .await
            .is_err()
        {
            self.inner.pending.lock().unwrap().remove(&id);
            return AcceptOutcome::Rejected(Bytes::from_static(b"accept-unavailable"));
        }

        match timeout(ACCEPT_TIMEOUT, rx).await {
            Ok(Ok(response)) if response.success => AcceptOutcome::Accepted,
            Ok(Ok(response)) => AcceptOutcome::Rejected(
                response
                    .condition
                    .unwrap_or_else(|| Bytes::from_static(b"rejected")),
            ),
            Ok(Err(_)) | Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                AcceptOutcome::Rejected(Bytes::from_static(b"accept-timeout"))
            }
        }
    }
}
