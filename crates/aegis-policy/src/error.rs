// error.rs — Error types for the policy model.

use thiserror::Error;

/// Errors raised while constructing or validating rules.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Address or CIDR text that does not parse.
    #[error("invalid address or CIDR '{0}'")]
    InvalidCidr(String),

    /// Port outside 1..=65535 or a reversed range.
    #[error("invalid port specification: {0}")]
    InvalidPort(String),

    /// Rate limit with a zero count or zero-length window.
    #[error("invalid rate limit: count and window must both be non-zero")]
    InvalidRate,

    /// Comment containing control characters or the rendering delimiter.
    #[error("comment contains forbidden character {0:?}")]
    ForbiddenCommentChar(char),

    /// Address family does not agree with the rule family or the peer address.
    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    /// `accept` rules may only come from an operator.
    #[error("accept rules require operator origin, got '{0}'")]
    AcceptRequiresOperator(String),

    /// Port list with no entries.
    #[error("port list must not be empty")]
    EmptyPortList,

    /// Ports given for a protocol that has none.
    #[error("protocol '{0}' does not carry ports")]
    PortsWithoutPorts(String),

    /// A never-block hostname that could not be resolved.
    #[error("could not resolve never-block host '{name}': {reason}")]
    UnresolvedHost { name: String, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
