
use ieee802154::mac::DecodeError;

use crate::timer::TimerError;

/// TSCH MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Neighbor transmit queue full
    QueueFull,

    /// Neighbor table full
    AllocFailed,

    /// Payload exceeds the maximum frame size
    FrameTooLong,

    /// Decoding error
    Decode(DecodeError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),

    /// Timer fault
    Timer(TimerError),

    Busy,
}
