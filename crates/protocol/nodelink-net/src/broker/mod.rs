//! Queue broker used by the broker transport.
//!
//! Every node serving the broker transport embeds a [`MessageBroker`] and
//! exposes it over TCP through a [`BrokerServer`]. Remote nodes talk to it
//! through a [`BrokerLink`]; the owning node uses a [`LocalSession`]. Both
//! implement [`MessageChannel`], so connection and consumer code does not
//! care which side of the link it runs on.

mod channel;
mod link;
mod queues;
mod server;

pub use channel::{LocalSession, MessageChannel};
pub use link::BrokerLink;
pub use queues::MessageBroker;
pub use server::BrokerServer;
