//! Inbox consumers and request dispatch.
//!
//! A consumer loops on one queue. Each message is handed to the worker
//! pool; the consumer itself never runs handler code. A shutdown message
//! stops the loop only when it carries the consumer's token.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use nodelink_types::{NetworkRequest, NetworkResponse, NodeId, ResultCode};
use nodelink_wire::{parse_request, props, response_message, shutdown_token, Envelope};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::MessageChannel;
use crate::pool::WorkerPool;
use crate::traits::ConnectionEndpointHandler;

/// Why a consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// A shutdown message with the right token arrived.
    PoisonPill,
    /// The channel was closed or failed.
    ChannelClosed,
}

/// Processes one message taken off an inbox.
#[async_trait]
pub(crate) trait EnvelopeDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, envelope: Envelope);
}

/// Consumer loop over one queue.
pub(crate) struct InboxConsumer {
    queue: String,
    channel: Arc<dyn MessageChannel>,
    dispatcher: Arc<dyn EnvelopeDispatcher>,
    pool: WorkerPool,
    shutdown_token: String,
    poll_interval: Duration,
}

impl InboxConsumer {
    pub(crate) fn new(
        queue: impl Into<String>,
        channel: Arc<dyn MessageChannel>,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
        pool: WorkerPool,
        shutdown_token: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            channel,
            dispatcher,
            pool,
            shutdown_token: shutdown_token.into(),
            poll_interval,
        }
    }

    /// Run the loop on its own task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let queue = self.queue.clone();
            let exit = self.run().await;
            debug!(queue = %queue, exit = ?exit, "Consumer stopped");
        })
    }

    pub(crate) async fn run(self) -> ConsumerExit {
        info!(queue = %self.queue, "Consumer started");
        loop {
            if self.channel.is_closed() {
                return ConsumerExit::ChannelClosed;
            }
            let envelope = match self.channel.receive(&self.queue, self.poll_interval).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    debug!(queue = %self.queue, error = %e, "Consumer channel failed");
                    return ConsumerExit::ChannelClosed;
                }
            };

            if let Some(token) = shutdown_token(&envelope) {
                if token == self.shutdown_token {
                    info!(queue = %self.queue, "Consumer received shutdown message");
                    return ConsumerExit::PoisonPill;
                }
                warn!(queue = %self.queue, "Ignoring shutdown message with invalid token");
                continue;
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            self.pool.spawn(async move { dispatcher.dispatch(envelope).await });
        }
    }
}

// =============================================================================
// Request Dispatch
// =============================================================================

/// Dispatches request messages to an endpoint handler and sends the reply.
pub(crate) struct RequestDispatcher {
    channel: Arc<dyn MessageChannel>,
    handler: Arc<dyn ConnectionEndpointHandler>,
    fallback_sender: Option<NodeId>,
    message_ttl: Duration,
    slow_dispatch_threshold: Duration,
}

impl RequestDispatcher {
    pub(crate) fn new(
        channel: Arc<dyn MessageChannel>,
        handler: Arc<dyn ConnectionEndpointHandler>,
        fallback_sender: Option<NodeId>,
        message_ttl: Duration,
        slow_dispatch_threshold: Duration,
    ) -> Self {
        Self {
            channel,
            handler,
            fallback_sender,
            message_ttl,
            slow_dispatch_threshold,
        }
    }

    async fn reply(&self, reply_to: &str, response: &NetworkResponse) {
        let message = response_message(response, reply_to).with_ttl(self.message_ttl);
        if let Err(e) = self.channel.send(message).await {
            debug!(request_id = %response.request_id(), error = %e, "Could not send response");
        }
    }
}

#[async_trait]
impl EnvelopeDispatcher for RequestDispatcher {
    async fn dispatch(&self, envelope: Envelope) {
        let Some(reply_to) = envelope.reply_to.clone() else {
            warn!(destination = %envelope.destination, "Dropping request without reply queue");
            return;
        };

        let request = match parse_request(&envelope) {
            Ok(request) => request,
            Err(e) => {
                let request_id = envelope.property(props::REQUEST_ID).unwrap_or_default();
                warn!(error = %e, "Malformed request message");
                let response = NetworkResponse::failure_for(request_id, ResultCode::ProtocolError, e);
                self.reply(&reply_to, &response).await;
                return;
            }
        };

        let Some(sender) = request.sender().or_else(|| self.fallback_sender.clone()) else {
            let response =
                NetworkResponse::failure(&request, ResultCode::ProtocolError, "Request carries no sender");
            self.reply(&reply_to, &response).await;
            return;
        };

        let response =
            invoke_endpoint(self.handler.as_ref(), request, sender, self.slow_dispatch_threshold).await;
        self.reply(&reply_to, &response).await;
    }
}

/// Hand a request to an endpoint handler, turning a panic into a failure response.
pub(crate) async fn invoke_endpoint(
    handler: &dyn ConnectionEndpointHandler,
    request: NetworkRequest,
    sender: NodeId,
    slow_dispatch_threshold: Duration,
) -> NetworkResponse {
    let started = Instant::now();
    let request_id = request.request_id().to_string();
    let category = request.category().map(str::to_string);

    let outcome = AssertUnwindSafe(handler.on_raw_request_received(request, sender.clone()))
        .catch_unwind()
        .await;

    let elapsed = started.elapsed();
    if elapsed > slow_dispatch_threshold {
        warn!(
            request_id = %request_id,
            sender = %sender,
            category = ?category,
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow request dispatch"
        );
    }

    match outcome {
        Ok(response) => response,
        Err(panic) => NetworkResponse::failure_for(
            &request_id,
            ResultCode::ExceptionAtDestination,
            format!("Request handler panicked: {}", panic_message(panic.as_ref())),
        ),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
