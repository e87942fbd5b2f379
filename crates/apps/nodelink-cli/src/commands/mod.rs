//! CLI command implementations.

pub mod init;
pub mod peers;
pub mod ping;
pub mod routes;
pub mod start;
pub mod whoami;

// Re-export command handlers
pub use init::init;
pub use peers::peers;
pub use ping::ping;
pub use routes::routes;
pub use start::{serve, start};
pub use whoami::whoami;
