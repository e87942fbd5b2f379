//! Shared fixtures for nodelink tests: identities, connection services on
//! both transports, recording handlers and a scripted peer graph.

pub mod helpers;
pub mod mock_peers;
pub mod recording;

pub use helpers::*;
pub use mock_peers::MockPeerGraph;
pub use recording::{RecordingEndpointHandler, RecordingRequestHandler};
