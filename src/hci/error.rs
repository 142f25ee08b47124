use crate::hci::consts::Status;
use crate::hci::Opcode;
use crate::utils::Loggable;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Generic(&'static str),
    #[error("Payload exceeds maximum size (255)")]
    PayloadTooLarge,
    #[error("Malformed packet: {0:?}")]
    BadPacket(#[from] instructor::Error),
    #[error("Event loop closed")]
    EventLoopClosed,
    #[error("Unexpected HCI Command Response for {0:?}")]
    UnexpectedCommandResponse(Opcode),
    #[error("Unknown connection handle: 0x{0:03X}")]
    UnknownConnectionHandle(u16),
    #[error(transparent)]
    Controller(#[from] Status)
}

impl From<&'static str> for Error {
    fn from(value: &'static str) -> Self {
        Self::Generic(value)
    }
}

/// Errors surfaced to producers on the per-connection outbound queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AclSendError {
    #[error("The connection has been closed")]
    ConnectionClosed,
    #[error("The outbound queue is full")]
    QueueFull,
}

impl Loggable for AclSendError {
    fn should_log(&self) -> bool {
        matches!(self, AclSendError::QueueFull)
    }
}
