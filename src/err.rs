use crate::nsp::ObjectName;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tap error: {0}")]
    TapError(#[from] tidy_tuntap::error::Error),

    #[error("Object: {0} already has a listener")]
    ObjectInUse(ObjectName),

    #[error("Object: {0} has been unexpectedly closed")]
    ObjectClosed(ObjectName),

    #[error("Link: {0:#06x} has been unexpectedly closed")]
    StreamClosed(u16),

    #[error("No free link addresses")]
    AddrExhausted,

    #[error("Interrupt messages are limited to 16 bytes")]
    InterruptTooLong,

    #[error("Connection refused by peer")]
    Refused,

    #[error("Peer node unreachable")]
    Unreachable,

    #[error("Peer lacks resources for the link")]
    NoResources,

    #[error("Link disconnected")]
    Disconnected,

    #[error("Connect attempt timed out")]
    TimedOut,
}
