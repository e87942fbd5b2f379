//! Data structures for the nodelink communication layer.
//!
//! This crate provides the value types shared by every other nodelink
//! crate. It contains no I/O, only type definitions with serialization
//! support and parsing.
//!
//! # Module Organization
//!
//! - [`identity`] - Node ids and the identity a node presents to peers
//! - [`contact`] - Network contacts, contact points, communication types
//! - [`message`] - Requests, responses, result codes and metadata keys
//! - [`constants`] - Timing bounds, limits and defaults
//! - [`error`] - Parse and validation errors
//!
//! # Example
//!
//! ```
//! use nodelink_types::{NetworkContactPoint, NetworkRequest, NodeId, NodeIdentity};
//!
//! let local = NodeIdentity::new(NodeId::new("aaa").unwrap(), "Node A");
//! let contact: NetworkContactPoint = "broker:localhost:9100".parse().unwrap();
//!
//! let request = NetworkRequest::builder()
//!     .content(b"ping".to_vec())
//!     .sender(&local.id)
//!     .build();
//!
//! assert_eq!(contact.port, 9100);
//! assert_eq!(request.sender(), Some(local.id));
//! ```

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod constants;
pub mod contact;
pub mod error;
pub mod identity;
pub mod message;

pub use constants::*;
pub use contact::{CommunicationType, NetworkContact, NetworkContactPoint};
pub use error::{Result, TypesError};
pub use identity::{LegacyNodeId, NodeId, NodeIdentity};
pub use message::{categories, keys, NetworkRequest, NetworkResponse, RequestBuilder, ResultCode};
