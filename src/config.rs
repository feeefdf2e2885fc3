

use crate::timer::Tick;

/// Minimum CSMA backoff exponent
pub const MAC_MIN_BE: u8 = 1;

/// Maximum CSMA backoff exponent
pub const MAC_MAX_BE: u8 = 4;

/// Transmission attempts before a packet is dropped
pub const MAC_MAX_FRAME_RETRIES: u8 = 4;

/// Per-neighbor ring capacity, must be a power of two
pub const QUEUE_SIZE: usize = 8;

/// Received sequence-number history depth for duplicate suppression
pub const SEQNO_HISTORY: usize = 8;

/// Neighbor table capacity
pub const MAX_NEIGHBORS: usize = 8;

/// Timeslot timing configuration.
///
/// All values are radio-timer ticks. Defaults assume a 32.768 kHz slot
/// timer (one tick is roughly 30.5 us) and a 10 ms timeslot; exact values
/// depend on the radio turnaround characteristics.
#[derive(Debug, Clone, PartialEq)]
pub struct TschConfig {
    /// Offset from slot start to the start of CCA
    pub cca_offset: Tick,

    /// Duration of the CCA window
    pub cca: Tick,

    /// Offset from slot start to frame transmission. Receive slots open
    /// the radio a long guard time either side of this point.
    pub tx_offset: Tick,

    /// Delay from frame end to ACK transmission
    pub tx_ack_delay: Tick,

    /// Guard time around ACK detection
    pub short_gt: Tick,

    /// Guard time around frame detection
    pub long_gt: Tick,

    /// Total timeslot duration
    pub slot_duration: Tick,

    /// Radio latency from transmit command to SFD on air
    pub delay_tx: Tick,

    /// Radio latency from receive command to actually listening
    pub delay_rx: Tick,

    /// Watchdog bound on a data frame transmission
    pub wd_data_duration: Tick,

    /// Watchdog bound on an ACK reception
    pub wd_ack_duration: Tick,

    /// Perform CCA before transmitting
    pub cca_enabled: bool,

    /// Drop received frames addressed to neither this node nor broadcast
    pub address_filter: bool,
}

impl Default for TschConfig {
    fn default() -> Self {
        Self {
            cca_offset: 59,         // 1800 us
            cca: 4,                 // 128 us
            tx_offset: 131,         // 4000 us
            tx_ack_delay: 151,      // 4606 us
            short_gt: 16,           // 500 us
            long_gt: 43,            // 1300 us
            slot_duration: 328,     // 10 ms
            delay_tx: 12,
            delay_rx: 5,
            wd_data_duration: 140,  // 4256 us
            wd_ack_duration: 79,    // 2400 us

            cca_enabled: false,
            address_filter: false,
        }
    }
}
