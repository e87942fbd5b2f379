//! Connections and request dispatch for nodelink.
//!
//! This crate provides the transport-agnostic connection layer of a node:
//!
//! - **Handshake**: Identity exchange producing a connection, optionally duplex
//! - **Request-Response**: Requests with timeouts that always yield a response
//! - **Dispatch**: Inbox consumers feeding a bounded worker pool
//! - **Shutdown**: Token-guarded poison pills for passive inbox consumers
//! - **Health Checks**: Echo checks declaring silent connections broken
//!
//! # Overview
//!
//! Two transports ship with the crate:
//!
//! - **broker**: An embedded queue broker per served contact point, reached over TCP
//! - **virtual**: In-process servers registered on a shared [`VirtualNetwork`]
//!
//! # Module Organization
//!
//! - [`service`] - [`NetworkConnectionService`], the per-node entry point
//! - [`connection`] - Connections, roles and request/response
//! - [`transport`] - Transport providers and server contact points
//! - [`broker`] - Queue broker, TCP server and link
//! - [`consumer`] - Inbox consumers and request dispatch
//! - [`health`] - Health-check handler and bookkeeping
//! - [`traits`] - Provider and handler traits
//! - [`codec`] - Broker link framing
//! - [`pool`] - Bounded worker pool
//! - [`event`] - Events published by the service
//! - [`config`] - Configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nodelink_net::{BrokerTransportProvider, HealthCheckRequestHandler, NetworkConfig,
//!     NetworkConnectionService};
//! use nodelink_types::{NetworkContactPoint, NetworkRequest, NodeId, NodeIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let me = NodeIdentity::new(NodeId::generate(), "example");
//!     let service = NetworkConnectionService::new(me, NetworkConfig::default());
//!     service.register_transport_provider(Arc::new(BrokerTransportProvider::new()))?;
//!     service.add_request_handler(Arc::new(HealthCheckRequestHandler));
//!
//!     service.start_server(NetworkContactPoint::new("broker", "0.0.0.0", 21000)).await?;
//!     let peer = service
//!         .connect(&"broker:10.0.0.2:21000".parse()?, true)
//!         .await?;
//!     let response = peer
//!         .request(NetworkRequest::new(b"hello".to_vec(), Default::default()), Duration::from_secs(5))
//!         .await;
//!     println!("{}: {:?}", response.result_code(), response.content());
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod health;
pub mod pool;
pub mod service;
pub mod traits;
pub mod transport;

pub use broker::{BrokerLink, BrokerServer, LocalSession, MessageBroker, MessageChannel};
pub use codec::BrokerFrame;
pub use config::{HealthCheckConfig, NetworkConfig};
pub use connection::{
    Connection, ConnectionId, ConnectionIdFactory, ConnectionState, InitiationRole,
    TIMEOUT_AFTER_CLOSE_MESSAGE,
};
pub use consumer::ConsumerExit;
pub use error::{NetworkError, NetworkResult};
pub use event::{BrokenConnection, NetworkEvent};
pub use health::{HealthCheckRequestHandler, HealthOutcome};
pub use pool::WorkerPool;
pub use service::NetworkConnectionService;
pub use traits::{ConnectionEndpointHandler, RequestHandler, TransportProvider};
pub use transport::broker::{BrokerTransportProvider, BROKER_TRANSPORT_ID};
pub use transport::virtual_net::{VirtualNetwork, VirtualTransportProvider, VIRTUAL_TRANSPORT_ID};
pub use transport::{ServerContactPoint, TransportContext};
