// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Error taxonomy per the core's error-handling design: each is a typed
// failure surfaced to the caller, never an unwind.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LqsrError {
    #[error("MAC verification failed")]
    MacFailure,
    #[error("malformed option")]
    MalformedOption,
    #[error("encrypted payload too small or padding invalid")]
    PayloadTooSmall,
    #[error("no route to destination")]
    NoRouteToDestination,
    #[error("outgoing queue full")]
    QueueFull,
    #[error("encode buffer too small")]
    BufferTooSmall,
    #[error("resource allocation failed")]
    Resources,
    #[error("maintenance link timed out")]
    LinkTimeout,
    #[error("salvage impossible")]
    SalvageImpossible,
    #[error("invalid configuration parameter {0}")]
    InvalidParameter(u32),
}

pub type Result<T> = std::result::Result<T, LqsrError>;
