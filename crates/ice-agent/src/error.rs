//! Error taxonomy (spec §7).

use stun_types::TransactionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IceError {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("malformed wire data")]
    Malformed,
    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityMismatch,
    #[error("MESSAGE-INTEGRITY missing")]
    IntegrityMissing,
    #[error("TURN server rejected credentials")]
    Unauthorized,
    #[error("TURN nonce is stale, retry with the refreshed one")]
    StaleNonce,
    #[error("ICE role conflict, switching roles")]
    RoleConflict,
    #[error("unknown comprehension-required attributes: {1:?}")]
    UnknownRequired(TransactionId, Vec<u16>),
    #[error("STUN transaction timed out")]
    Timeout,
    #[error("socket error")]
    SocketError(#[from] std::io::Error),
    #[error("internal assertion failure: {0}")]
    Internal(String),
}

/// TURN-specific errors (spec §4.2/§7), used directly by [`crate::turn`]'s
/// internal retry logic before it ever surfaces as an [`IceError`].
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("TURN server rejected credentials")]
    Unauthorized,
    #[error("TURN nonce is stale, retry with the refreshed one")]
    StaleNonce,
    #[error("TURN transaction timed out")]
    Timeout,
    #[error("malformed TURN message")]
    Malformed,
    #[error("no TURN allocation is active")]
    NoAllocation,
}

impl From<stun_types::DecodeError> for IceError {
    fn from(err: stun_types::DecodeError) -> Self {
        match err {
            stun_types::DecodeError::Malformed => IceError::Malformed,
            stun_types::DecodeError::UnknownRequired(txn, types) => {
                IceError::UnknownRequired(txn, types)
            }
            stun_types::DecodeError::IntegrityMissing => IceError::IntegrityMissing,
            stun_types::DecodeError::IntegrityMismatch => IceError::IntegrityMismatch,
        }
    }
}
