//! Function-call dispatch with guaranteed settlement.
//!
//! A handler can answer in three ways: return `Some(output)`, return `None`
//! and call [`FunctionCallResponder::respond`] later, or fail. Whatever it
//! does, including panicking or never answering, exactly one [`Settlement`]
//! reaches the session runtime, which sends the response and marks the call
//! complete.

use async_trait::async_trait;
use converse_core::ConnectionId;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    /// The handler returned `Some(output)`.
    Returned,
    /// The handler called [`FunctionCallResponder::respond`].
    Responded,
    Failed,
    Panicked,
    TimedOut,
}

/// Final outcome of one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub call_id: String,
    pub connection: ConnectionId,
    pub kind: SettlementKind,
    pub output: String,
}

impl Settlement {
    pub fn is_error(&self) -> bool {
        !matches!(
            self.kind,
            SettlementKind::Returned | SettlementKind::Responded
        )
    }
}

/// `{"error": message}`, the output sent for failed calls.
pub fn error_output(message: &str) -> String {
    json!({ "error": message }).to_string()
}

struct ResponseSlot {
    call_id: String,
    connection: ConnectionId,
    settled: AtomicBool,
    notify: Notify,
    settlements: mpsc::UnboundedSender<Settlement>,
}

impl ResponseSlot {
    fn settle(&self, kind: SettlementKind, output: String) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            debug!(call_id = %self.call_id, ?kind, "function call already settled");
            return false;
        }
        self.notify.notify_waiters();
        let settlement = Settlement {
            call_id: self.call_id.clone(),
            connection: self.connection,
            kind,
            output,
        };
        if self.settlements.send(settlement).is_err() {
            debug!(call_id = %self.call_id, "session ended before function call settled");
        }
        true
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Lets a handler answer a call after returning. Cloneable; the first
/// answer wins and later ones return `false`.
#[derive(Clone)]
pub struct FunctionCallResponder {
    slot: Arc<ResponseSlot>,
}

impl fmt::Debug for FunctionCallResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCallResponder")
            .field("call_id", &self.slot.call_id)
            .field("settled", &self.slot.is_settled())
            .finish()
    }
}

impl FunctionCallResponder {
    fn new(
        call_id: String,
        connection: ConnectionId,
        settlements: mpsc::UnboundedSender<Settlement>,
    ) -> Self {
        Self {
            slot: Arc::new(ResponseSlot {
                call_id,
                connection,
                settled: AtomicBool::new(false),
                notify: Notify::new(),
                settlements,
            }),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.slot.call_id
    }

    pub fn respond(&self, output: impl Into<String>) -> bool {
        self.slot.settle(SettlementKind::Responded, output.into())
    }

    pub fn fail(&self, error: impl fmt::Display) -> bool {
        self.slot
            .settle(SettlementKind::Failed, error_output(&error.to_string()))
    }

    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    async fn settled(&self) {
        loop {
            let notified = self.slot.notify.notified();
            if self.slot.is_settled() {
                return;
            }
            notified.await;
        }
    }

    fn settle(&self, kind: SettlementKind, output: String) -> bool {
        self.slot.settle(kind, output)
    }
}

/// Runs client-side functions requested by the agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FunctionCallHandler: Send + Sync {
    /// Return `Ok(Some(output))` to answer now, or `Ok(None)` after arranging
    /// for `responder` to answer later.
    async fn handle(
        &self,
        request: FunctionCallRequest,
        responder: FunctionCallResponder,
    ) -> anyhow::Result<Option<String>>;
}

/// Adapter for plain synchronous functions.
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&FunctionCallRequest) -> anyhow::Result<String> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> FunctionCallHandler for FnHandler<F>
where
    F: Fn(&FunctionCallRequest) -> anyhow::Result<String> + Send + Sync,
{
    async fn handle(
        &self,
        request: FunctionCallRequest,
        _responder: FunctionCallResponder,
    ) -> anyhow::Result<Option<String>> {
        (self.0)(&request).map(Some)
    }
}

/// Runs `handler` for `request` and guarantees one settlement within
/// `timeout`.
pub(crate) fn dispatch(
    handler: Arc<dyn FunctionCallHandler>,
    request: FunctionCallRequest,
    connection: ConnectionId,
    timeout: Duration,
    settlements: mpsc::UnboundedSender<Settlement>,
) -> JoinHandle<()> {
    let responder = FunctionCallResponder::new(request.id.clone(), connection, settlements);
    let span = info_span!("function_call", call_id = %request.id, name = %request.name);

    tokio::spawn(
        async move {
            let deadline = Instant::now() + timeout;
            let watcher = responder.clone();
            let mut work = tokio::spawn(async move { handler.handle(request, responder).await });

            match tokio::time::timeout_at(deadline, &mut work).await {
                Ok(Ok(Ok(Some(output)))) => {
                    watcher.settle(SettlementKind::Returned, output);
                }
                Ok(Ok(Ok(None))) => {
                    if tokio::time::timeout_at(deadline, watcher.settled())
                        .await
                        .is_err()
                    {
                        warn!(timeout_ms = timeout.as_millis() as u64, "handler never responded");
                        watcher.settle(
                            SettlementKind::TimedOut,
                            error_output("function call timed out"),
                        );
                    }
                }
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, "function call handler failed");
                    watcher.settle(SettlementKind::Failed, error_output(&e.to_string()));
                }
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "function call handler panicked");
                    watcher.settle(
                        SettlementKind::Panicked,
                        error_output("function call handler panicked"),
                    );
                }
                Err(_) => {
                    work.abort();
                    warn!(timeout_ms = timeout.as_millis() as u64, "function call handler timed out");
                    watcher.settle(
                        SettlementKind::TimedOut,
                        error_output("function call timed out"),
                    );
                }
            }
        }
        .instrument(span),
    )
}
