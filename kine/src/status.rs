//! Mapping of store errors onto the status codes an etcd client expects.
//!
//! Clients such as the Kubernetes apiserver match on the exact message text, so the messages
//! below are etcd's own.

use kine_core::StoreError;
use thiserror::Error;

pub const KEY_EXISTS: &str = "etcdserver: key exists";
pub const COMPACTED: &str = "etcdserver: mvcc: required revision has been compacted";
pub const FUTURE_REVISION: &str = "etcdserver: mvcc: required revision is a future revision";

/// gRPC status codes, with their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum GrpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcCode {
    pub fn as_i32(self) -> i32 { self as i32 }
}

/// An etcd-compatible error response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct EtcdError {
    pub code: GrpcCode,
    pub message: String,
}

/// Convert a [`StoreError`] into the status an etcd client would have received.
pub fn to_etcd_error(err: &StoreError) -> EtcdError {
    match err {
        StoreError::KeyExists => EtcdError { code: GrpcCode::FailedPrecondition, message: KEY_EXISTS.to_string() },

        StoreError::Compacted { .. } => EtcdError { code: GrpcCode::OutOfRange, message: COMPACTED.to_string() },

        StoreError::FutureRevision { .. } => EtcdError { code: GrpcCode::OutOfRange, message: FUTURE_REVISION.to_string() },

        StoreError::Cancelled => EtcdError { code: GrpcCode::Cancelled, message: err.to_string() },

        other => EtcdError { code: GrpcCode::Unknown, message: other.to_string() },
    }
}

impl From<&StoreError> for EtcdError {
    fn from(err: &StoreError) -> Self { to_etcd_error(err) }
}

impl From<StoreError> for EtcdError {
    fn from(err: StoreError) -> Self { to_etcd_error(&err) }
}
