//! Queue naming conventions and envelope property names.
//!
//! Two inboxes are well known: every broker consumes handshakes on
//! [`INITIAL_INBOX`] and requests from initiators on [`REQUEST_INBOX`].
//! Requests travelling back to an initiator use a passive inbox whose name
//! only the two handshake parties know.

use nodelink_types::NodeId;

/// Inbox for initial handshake messages.
pub const INITIAL_INBOX: &str = "nodelink.initial";

/// Shared inbox for requests sent by initiators.
pub const REQUEST_INBOX: &str = "nodelink.requests";

const PASSIVE_INBOX_PREFIX: &str = "nodelink.requests.passive";

const TEMPORARY_QUEUE_PREFIX: &str = "nodelink.tmp.";

/// Envelope property names.
pub mod props {
    /// Queue the initiator sends its requests to.
    pub const ACTIVE_REQUEST_INBOX: &str = "nodelink.activeRequestInbox";
    /// Queue the responder pushes requests to the initiator on.
    pub const PASSIVE_REQUEST_INBOX: &str = "nodelink.passiveRequestInbox";
    /// Token authorizing shutdown of the passive inbox consumer.
    pub const SHUTDOWN_TOKEN: &str = "nodelink.shutdownToken";
    /// Reason a handshake was rejected.
    pub const ERROR: &str = "nodelink.error";
    /// Request id of a request or response.
    pub const REQUEST_ID: &str = "nodelink.requestId";
    /// Numeric result code of a response.
    pub const RESULT_CODE: &str = "nodelink.resultCode";
}

/// Name of the passive inbox for one connection.
///
/// Parameterized by the initiator's node id and the connection id the
/// responder generated.
pub fn passive_request_inbox(initiator: &NodeId, connection_id: &str) -> String {
    format!("{}.{}.{}", PASSIVE_INBOX_PREFIX, initiator, connection_id)
}

/// Whether `name` is a passive inbox.
pub fn is_passive_request_inbox(name: &str) -> bool {
    name.starts_with(PASSIVE_INBOX_PREFIX)
}

/// A fresh, unique temporary queue name.
pub fn temporary_queue_name() -> String {
    format!("{}{}", TEMPORARY_QUEUE_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Whether `name` is a temporary queue.
pub fn is_temporary_queue(name: &str) -> bool {
    name.starts_with(TEMPORARY_QUEUE_PREFIX)
}

/// A fresh random shutdown token.
pub fn generate_shutdown_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passive_inbox_name() {
        let initiator = NodeId::new("aaa").unwrap();
        let name = passive_request_inbox(&initiator, "c-7");
        assert_eq!(name, "nodelink.requests.passive.aaa.c-7");
        assert!(is_passive_request_inbox(&name));
        assert!(!is_passive_request_inbox(REQUEST_INBOX));
    }

    #[test]
    fn test_temporary_queue_names_unique() {
        let a = temporary_queue_name();
        let b = temporary_queue_name();
        assert_ne!(a, b);
        assert!(is_temporary_queue(&a));
        assert!(!is_temporary_queue(INITIAL_INBOX));
    }

    #[test]
    fn test_shutdown_tokens_unique() {
        let a = generate_shutdown_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_shutdown_token());
    }
}
