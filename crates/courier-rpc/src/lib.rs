// Request/response semantics layered on fire-and-forget topic delivery.
//
// Clients publish `Request`s to the shared request topic and receive
// `Response`s on a private reply topic; the correlation matcher routes each
// response to the callback registered for its correlation id. Servers consume
// the request topic in a consumer group and run a `RequestHandler` on a
// bounded worker pipeline.
use courier_common::ids::CorrelationId;

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod handler;
pub mod matcher;
pub mod server;

mod listener;
mod pipeline;

pub use client::{PendingCall, RpcClient};
pub use config::{RpcClientConfig, RpcServerConfig, WaitStrategy};
pub use dispatcher::ResponseDispatcher;
pub use handler::{Guard, Guarded, HandlerError, RequestHandler, handler_fn};
pub use matcher::{MatcherError, RequestResponseMatcher};
pub use server::RpcServer;

pub const REQUEST_TOPIC: &str = "request_topic";
pub const REQUEST_CONSUMER_GROUP: &str = "request_consumer_group";
pub const RESPONSE_TOPIC_PREFIX: &str = "response_topic_";

/// Private reply topic for the process identified by `instance`.
///
/// ```
/// assert_eq!(courier_rpc::response_topic("node-a"), "response_topic_node-a");
/// ```
pub fn response_topic(instance: &str) -> String {
    format!("{RESPONSE_TOPIC_PREFIX}{instance}")
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Broker(#[from] courier_broker::BrokerError),
    #[error(transparent)]
    Wire(#[from] courier_wire::Error),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error("no response for {correlation_id} within {timeout_ms}ms")]
    Timeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    #[error("call {0} was cancelled")]
    Cancelled(CorrelationId),
    #[error("no server answered {attempts} ping attempt(s)")]
    ServerUnreachable { attempts: u32 },
    #[error("pipeline is shut down")]
    PipelineClosed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
