//! Slot-driven powercycle state machine.
//!
//! A single cooperative task wakes at radio-timer deadlines, decides what
//! to do in the current slot, drives the radio through the TX or RX
//! choreography and schedules its own next wake-up. Suspension points are
//! modelled as an explicit [`Phase`] enum: each [`SlotMachine::resume`]
//! call runs from the current phase to the next yield and returns the
//! deadline for the following wake-up.
//
// SPDX-License-Identifier: MPL-2.0

use core::cmp::min;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use heapless::{spsc::Queue, consts::U8};

use crate::log::{trace, debug, warn};

use crate::{Radio, RadioTx, TxStatus};
use crate::config::{TschConfig, MAC_MIN_BE, MAC_MAX_BE, MAC_MAX_FRAME_RETRIES};
use crate::neighbor::{Addr, NeighborTable, random_backoff};
use crate::schedule::{Cell, CellKind, CellOptions, Slotframe, hop_channel};
use crate::sync;
use crate::timer::{Tick, Timer, Wake, schedule_fixed, MISSED_SCHEDULE_GUARD};

/// ACK frame length: FCF (2 bytes) plus sequence number
pub const ACK_LEN: usize = 3;

/// Sync IE extension appended to a soft-ACK
pub const EXTRA_ACK_LEN: usize = sync::SYNC_IE_LEN;

/// TSCH network state
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TschState {
    Off,
    Associated,
}

/// Process-wide IEEE 802.15.4e MAC state.
///
/// The slot machine owns `asn`, the slot anchor and the drift
/// accumulators; the driver facade owns the sequence numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct Ieee154eVars {
    /// Absolute Slot Number since the network epoch
    pub asn: u64,
    /// Data sequence number, never zero on the wire
    pub(crate) dsn: u8,
    /// Enhanced Beacon sequence number, never zero on the wire
    pub(crate) ebsn: u8,
    pub is_sync: bool,
    pub state: TschState,
    /// Inherited from routing, PAN coordinator is 0, lower is better
    pub join_priority: u8,
    pub captured_time: Tick,
}

impl Default for Ieee154eVars {
    fn default() -> Self {
        Self {
            asn: 0,
            dsn: 0,
            ebsn: 0,
            is_sync: false,
            state: TschState::Off,
            join_priority: 0xff,
            captured_time: 0,
        }
    }
}

/// Per-slot decision
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotDecision {
    Off,
    Tx,
    /// TX slot with nothing queued
    TxIdle,
    /// Shared slot skipped while the backoff counter drains
    TxBackoff,
    Rx,
}

/// Transmit completion event delivered to the upper layer
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TxDone {
    pub token: u32,
    pub status: TxStatus,
    pub transmissions: u8,
}

/// Bounded queue decoupling slot-context completion from upper-layer code
pub type TxDoneQueue = Queue<TxDone, U8>;

/// Powercycle suspension points, one per scheduled wake-up
#[derive(Debug, Copy, Clone, PartialEq)]
enum Phase {
    SlotStart,
    TxCca,
    TxCcaEnd,
    TxTransmit,
    TxAckListen,
    TxAckDetect,
    TxAckRead,
    RxListen,
    RxGuard,
    RxAck,
}

/// Radio-ISR to slot-task signals.
///
/// Written from interrupt context, read by the slot task after its
/// re-scheduled wake, which orders the accesses.
struct IrqSignals {
    waiting_for_radio_irq: AtomicBool,
    need_ack: AtomicBool,
    we_are_sending: AtomicBool,
    /// Source address of the last received frame, zero when none
    last_rf_src: AtomicU64,
    /// Drift reported in the last synthesized soft-ACK, microseconds
    last_drift_us: AtomicI32,
}

impl IrqSignals {
    const fn new() -> Self {
        Self {
            waiting_for_radio_irq: AtomicBool::new(false),
            need_ack: AtomicBool::new(false),
            we_are_sending: AtomicBool::new(false),
            last_rf_src: AtomicU64::new(0),
            last_drift_us: AtomicI32::new(0),
        }
    }
}

/// The slot state machine.
///
/// Owns the radio, the slot timer, the schedule and all per-slot context;
/// borrows the neighbor table and MAC state for the duration of each
/// resume.
pub struct SlotMachine<R, T> {
    radio: R,
    timer: T,
    config: TschConfig,
    slotframe: Slotframe,

    phase: Phase,
    started: bool,
    /// Index of the current on-slot within the slotframe
    timeslot: u16,
    /// Anchor time of the current slot
    start: Tick,

    /// Sum of observed drifts since the last slotframe boundary, in us
    drift_us: i32,
    drift_count: u16,

    // per-slot context, reset at each slot start
    decision: SlotDecision,
    cell: Option<Cell>,
    /// Queue owning the in-flight packet
    peer: Addr,
    seqno: u8,
    is_broadcast: bool,
    payload_len: usize,
    /// Measured frame transmission duration
    tx_time: Tick,
    activity: bool,

    keep_radio_on: bool,

    ack_frame: [u8; ACK_LEN + EXTRA_ACK_LEN],

    signals: IrqSignals,
}

impl<R, T> SlotMachine<R, T>
where
    R: Radio,
    T: Timer,
{
    pub fn new(radio: R, timer: T, config: TschConfig, slotframe: Slotframe) -> Self {
        Self {
            radio,
            timer,
            config,
            slotframe,

            phase: Phase::SlotStart,
            started: false,
            timeslot: 0,
            start: 0,

            drift_us: 0,
            drift_count: 0,

            decision: SlotDecision::Off,
            cell: None,
            peer: Addr::NULL,
            seqno: 0,
            is_broadcast: false,
            payload_len: 0,
            tx_time: 0,
            activity: false,

            keep_radio_on: false,

            ack_frame: [0u8; ACK_LEN + EXTRA_ACK_LEN],

            signals: IrqSignals::new(),
        }
    }

    pub fn slotframe(&self) -> &Slotframe {
        &self.slotframe
    }

    pub fn config(&self) -> &TschConfig {
        &self.config
    }

    /// True while a frame transmission is in flight
    pub fn is_sending(&self) -> bool {
        self.signals.we_are_sending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_keep_radio_on(&mut self, keep: bool) {
        self.keep_radio_on = keep;
    }

    pub(crate) fn radio(&mut self) -> &mut R {
        &mut self.radio
    }

    fn radio_on(&mut self) {
        if self.radio.on().is_err() {
            warn!("radio power-on fault");
        }
    }

    /// Radio off, honouring the sticky keep-on flag
    fn radio_off(&mut self) {
        let r = if self.keep_radio_on {
            self.radio.on()
        } else {
            self.radio.off()
        };
        if r.is_err() {
            warn!("radio power fault");
        }
    }

    /// Arm the wake-up for the first slot
    pub(crate) fn arm_first_wake(&mut self) -> Wake {
        self.started = false;
        self.phase = Phase::SlotStart;
        self.signals.waiting_for_radio_irq.store(false, Ordering::Relaxed);
        self.signals.we_are_sending.store(false, Ordering::Relaxed);

        let now = self.timer.now();
        let (_, deadline) = schedule_fixed(&mut self.timer, now, self.config.slot_duration);
        Wake::At(deadline)
    }

    /// Run the powercycle from the current suspension point to the next,
    /// returning the deadline of the following wake-up.
    pub fn resume(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        if !e.is_sync || e.state == TschState::Off {
            debug!("powercycle stopped");
            return Wake::Idle;
        }

        match self.phase {
            Phase::SlotStart => self.slot_start(e, nbrs, done),
            Phase::TxCca => self.tx_cca(),
            Phase::TxCcaEnd => self.tx_cca_end(e, nbrs, done),
            Phase::TxTransmit => self.tx_transmit(e, nbrs, done),
            Phase::TxAckListen => self.tx_ack_listen(e, nbrs, done),
            Phase::TxAckDetect => self.tx_ack_detect(e, nbrs, done),
            Phase::TxAckRead => self.do_ack_read(e, nbrs, done),
            Phase::RxListen => self.rx_listen(),
            Phase::RxGuard => self.rx_guard(e, nbrs),
            Phase::RxAck => self.rx_ack(e, nbrs),
        }
    }

    /// Wake the powercycle shortly after a radio interrupt.
    ///
    /// Called by platform glue from the radio ISR on SFD capture or frame
    /// completion; returns the re-scheduled wake deadline when the slot
    /// task was waiting on the radio.
    pub fn resume_powercycle(&mut self, need_ack: bool, src: Option<Addr>) -> Option<Tick> {
        self.signals.need_ack.store(need_ack, Ordering::Relaxed);
        self.signals
            .last_rf_src
            .store(src.map(|a| a.to_u64()).unwrap_or(0), Ordering::Relaxed);

        if self.signals.waiting_for_radio_irq.load(Ordering::Relaxed)
            || self.radio.rx_end_time() != 0
        {
            self.signals.waiting_for_radio_irq.store(false, Ordering::Relaxed);
            let now = self.timer.now();
            let (_, deadline) = schedule_fixed(&mut self.timer, now, MISSED_SCHEDULE_GUARD);
            return Some(deadline);
        }

        None
    }

    /// Synthesize the soft-ACK for a just-received frame.
    ///
    /// Called by platform glue from the radio ISR ahead of the ACK
    /// deadline. Computes the receive-time drift against the slot anchor,
    /// records it for crediting to a time source, and returns the ACK
    /// frame for the radio to transmit at [`Radio::send_ack`].
    pub fn make_sync_ack(&mut self, seqno: u8, frame_end: Tick, nack: bool) -> [u8; ACK_LEN + EXTRA_ACK_LEN] {
        let diff_ticks = self
            .start
            .wrapping_add(self.config.tx_offset)
            .wrapping_sub(frame_end) as i32;

        let (ie, drift_us) = sync::encode(diff_ticks, nack);
        self.signals.last_drift_us.store(drift_us as i32, Ordering::Relaxed);

        let mut buf = [0u8; ACK_LEN + EXTRA_ACK_LEN];
        buf[0] = 0x02; // ACK frame
        buf[1] = 0x22; // IE-list present, frame version 2
        buf[2] = seqno;
        buf[ACK_LEN..].copy_from_slice(&ie);

        self.ack_frame = buf;
        buf
    }

    fn slot_start(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let now = self.timer.now();
        if !self.started {
            self.started = true;
            self.start = now;
        }
        e.captured_time = now;

        trace!("slot start");

        // re-arm SFD capture for the slot
        self.radio.sfd_sync(true, true);

        let cell = match self.slotframe.cell(self.timeslot).copied() {
            Some(c) if !nbrs.is_busy() => c,
            _ => {
                trace!("off slot");
                self.cell = None;
                self.decision = SlotDecision::Off;
                self.radio_off();
                return self.end_of_slot(e);
            }
        };
        self.cell = Some(cell);

        let channel = hop_channel(cell.channel_offset, e.asn);
        if self.radio.set_channel(channel).is_err() {
            warn!("channel hop failed");
        }

        // clear per-slot state
        self.signals.last_drift_us.store(0, Ordering::Relaxed);
        self.signals.last_rf_src.store(0, Ordering::Relaxed);
        self.signals.need_ack.store(false, Ordering::Relaxed);
        self.signals.waiting_for_radio_irq.store(false, Ordering::Relaxed);
        self.peer = Addr::NULL;
        self.activity = false;
        self.tx_time = 0;

        // pick a packet: the cell peer's queue first, then any queue for a
        // shared broadcast slot with no broadcast traffic
        let mut tx_from = None;
        if cell.options.contains(CellOptions::TX) && cell.kind != CellKind::Advertising {
            if let Some(n) = nbrs.get(cell.peer) {
                if n.head().is_some() {
                    tx_from = Some(cell.peer);
                } else if cell.peer.is_broadcast() && cell.options.contains(CellOptions::SHARED) {
                    tx_from = nbrs.next_pending();
                }
            }
        }

        let mut decision = SlotDecision::Off;
        if cell.options.contains(CellOptions::TX) && cell.kind != CellKind::Advertising {
            decision = SlotDecision::TxIdle;

            if let Some(addr) = tx_from {
                if let Some(n) = nbrs.get_mut(addr) {
                    if !cell.options.contains(CellOptions::SHARED) || n.bw == 0 {
                        self.peer = addr;
                        decision = SlotDecision::Tx;
                    } else {
                        // shared slot blocked by the backoff counter
                        n.bw -= 1;
                        decision = SlotDecision::TxBackoff;
                    }
                }
            }
        }

        if decision != SlotDecision::Tx && cell.options.contains(CellOptions::RX) {
            decision = SlotDecision::Rx;
        }
        self.decision = decision;

        match decision {
            SlotDecision::Tx => self.begin_tx(e, nbrs, done),
            SlotDecision::Rx => {
                // radio on a guard time ahead of the expected TX offset
                let at = self.config.tx_offset.wrapping_sub(self.config.long_gt);
                let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
                self.phase = Phase::RxListen;
                Wake::At(deadline)
            }
            _ => {
                trace!("nothing to tx or rx");
                self.radio_off();
                self.end_of_slot(e)
            }
        }
    }

    fn begin_tx(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let prepared = match nbrs.get(self.peer).and_then(|n| n.head()) {
            Some(p) => {
                self.seqno = p.seq;
                self.is_broadcast = p.dest.is_broadcast();
                self.payload_len = p.frame().len();
                self.signals.we_are_sending.store(true, Ordering::Relaxed);
                self.radio.prepare(p.frame()).is_ok()
            }
            None => false,
        };

        if !prepared {
            warn!("tx prepare failed");
            self.signals.we_are_sending.store(false, Ordering::Relaxed);
            return self.finish_tx(TxStatus::Err, e, nbrs, done);
        }

        if self.config.cca_enabled {
            let (_, deadline) = schedule_fixed(&mut self.timer, self.start, self.config.cca_offset);
            self.phase = Phase::TxCca;
            Wake::At(deadline)
        } else {
            self.schedule_transmit()
        }
    }

    fn schedule_transmit(&mut self) -> Wake {
        self.radio.sfd_sync(false, true);
        let at = self.config.tx_offset.wrapping_sub(self.config.delay_tx);
        let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
        self.phase = Phase::TxTransmit;
        Wake::At(deadline)
    }

    /// Listen over the CCA window, deciding at its end
    fn tx_cca(&mut self) -> Wake {
        self.radio_on();

        let at = self.config.cca_offset.wrapping_add(self.config.cca);
        let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
        self.phase = Phase::TxCcaEnd;
        Wake::At(deadline)
    }

    fn tx_cca_end(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let clear = self.radio.channel_clear();

        // not enough margin to power down between CCA and TX
        self.radio_off();

        if !clear {
            debug!("cca busy");
            self.signals.we_are_sending.store(false, Ordering::Relaxed);
            return self.finish_tx(TxStatus::Collision, e, nbrs, done);
        }

        self.schedule_transmit()
    }

    fn tx_transmit(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let t0 = self.timer.now();
        let result = self.radio.transmit(self.payload_len);

        // bound the measured duration in case the capture misfired
        let tx_ticks = self.radio.read_sfd_timer().wrapping_sub(t0);
        self.tx_time = min(tx_ticks, self.config.wd_data_duration);

        self.radio_off();

        let outcome = match result {
            RadioTx::Ok => {
                if self.is_broadcast {
                    // broadcast completes without an ACK
                    self.signals.we_are_sending.store(false, Ordering::Relaxed);
                    return self.finish_tx(TxStatus::Ok, e, nbrs, done);
                }

                trace!("wait for ack");
                self.radio.sfd_sync(false, false);
                let at = self
                    .config
                    .tx_offset
                    .wrapping_add(self.tx_time)
                    .wrapping_add(self.config.tx_ack_delay)
                    .wrapping_sub(self.config.short_gt)
                    .wrapping_sub(self.config.delay_rx);
                let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
                self.phase = Phase::TxAckListen;
                return Wake::At(deadline);
            }
            RadioTx::Collision => TxStatus::Collision,
            RadioTx::NoAck => TxStatus::NoAck,
            RadioTx::Err => TxStatus::Err,
        };

        self.signals.we_are_sending.store(false, Ordering::Relaxed);
        self.finish_tx(outcome, e, nbrs, done)
    }

    fn tx_ack_listen(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        self.signals.waiting_for_radio_irq.store(true, Ordering::Relaxed);
        self.radio_on();

        self.activity = self.radio.receiving_packet()
            || self.radio.pending_packet()
            || !self.radio.channel_clear();

        if !self.activity {
            let at = self
                .config
                .tx_offset
                .wrapping_add(self.tx_time)
                .wrapping_add(self.config.tx_ack_delay)
                .wrapping_add(self.config.short_gt);
            let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
            self.phase = Phase::TxAckDetect;
            return Wake::At(deadline);
        }

        self.ack_detected(e, nbrs, done)
    }

    fn tx_ack_detect(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        self.activity = self.activity
            || self.radio.receiving_packet()
            || self.radio.pending_packet()
            || !self.radio.channel_clear();

        if !self.activity {
            debug!("no ack");
            return self.end_tx_ack(TxStatus::NoAck, e, nbrs, done);
        }

        self.ack_detected(e, nbrs, done)
    }

    /// Preamble seen in the ACK window: read now if the frame is already
    /// pending, otherwise wait out the ACK watchdog.
    fn ack_detected(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        if self.radio.pending_packet() {
            return self.do_ack_read(e, nbrs, done);
        }

        let at = self
            .config
            .tx_offset
            .wrapping_add(self.tx_time)
            .wrapping_add(self.config.tx_ack_delay)
            .wrapping_add(self.config.short_gt)
            .wrapping_add(self.config.wd_ack_duration);
        let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
        self.phase = Phase::TxAckRead;
        Wake::At(deadline)
    }

    fn do_ack_read(
        &mut self,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let mut buf = [0u8; ACK_LEN + EXTRA_ACK_LEN];

        let len = if self.radio.pending_packet() {
            self.radio.read(&mut buf)
        } else if self.radio.pending_irq() {
            // frame sits in the radio FIFO, interrupt not yet serviced
            self.radio.read_ack(&mut buf)
        } else {
            0
        };

        let mut outcome = TxStatus::NoAck;

        if len >= ACK_LEN && buf[0] == 0x02 && buf[2] == self.seqno {
            outcome = TxStatus::Ok;

            // IE list present?
            if buf[1] & 0x02 != 0 && len == ACK_LEN + EXTRA_ACK_LEN {
                if let Some((drift_us, nack)) = sync::decode(&buf[ACK_LEN..]) {
                    // only drift from a time source feeds clock averaging
                    let time_source = nbrs.get(self.peer).map(|n| n.time_source).unwrap_or(false);
                    if time_source {
                        debug!("ack drift recorded");
                        self.drift_us += drift_us as i32;
                        self.drift_count += 1;
                    }

                    if nack {
                        outcome = TxStatus::NoAckWithSync;
                    }
                }
            }
        } else {
            debug!("ack invalid");
        }

        self.end_tx_ack(outcome, e, nbrs, done)
    }

    fn end_tx_ack(
        &mut self,
        outcome: TxStatus,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        self.signals.waiting_for_radio_irq.store(false, Ordering::Relaxed);
        self.signals.we_are_sending.store(false, Ordering::Relaxed);
        self.radio_off();
        self.finish_tx(outcome, e, nbrs, done)
    }

    /// Retry / backoff bookkeeping for a completed TX slot, posting the
    /// completion event for the upper layer.
    fn finish_tx(
        &mut self,
        outcome: TxStatus,
        e: &mut Ieee154eVars,
        nbrs: &mut NeighborTable,
        done: &mut TxDoneQueue,
    ) -> Wake {
        let shared_unicast = self
            .cell
            .map(|c| c.options.contains(CellOptions::SHARED))
            .unwrap_or(false)
            && !self.is_broadcast;

        let mut event = None;

        if let Some(n) = nbrs.get_mut(self.peer) {
            let (token, transmissions) = match n.head_mut() {
                Some(p) => {
                    // one attempt per serviced TX slot
                    p.transmissions = p.transmissions.saturating_add(1);
                    p.ret = outcome;
                    (p.token, p.transmissions)
                }
                None => (0, 0),
            };

            if transmissions > 0 {
                match outcome {
                    TxStatus::Ok | TxStatus::NoAckWithSync => {
                        n.pop();
                        n.bw = 0;
                        if n.is_empty() {
                            n.be = MAC_MIN_BE;
                        }
                    }
                    _ => {
                        if transmissions >= MAC_MAX_FRAME_RETRIES {
                            debug!("retries exhausted, dropping packet");
                            n.pop();
                            n.be = MAC_MIN_BE;
                            n.bw = 0;
                        }
                        if shared_unicast {
                            let window = (1u8 << n.be) - 1;
                            n.bw = random_backoff(window);
                            n.be = min(n.be + 1, MAC_MAX_BE);
                        }
                    }
                }

                event = Some(TxDone {
                    token,
                    status: outcome,
                    transmissions,
                });
            }
        }

        if let Some(ev) = event {
            if done.enqueue(ev).is_err() {
                warn!("tx completion queue full, event dropped");
            }
        }

        self.end_of_slot(e)
    }

    fn rx_listen(&mut self) -> Wake {
        self.radio_on();

        self.activity = !self.radio.channel_clear()
            || self.radio.pending_packet()
            || self.radio.receiving_packet();

        let at = self.config.tx_offset.wrapping_add(self.config.long_gt);
        let (_, deadline) = schedule_fixed(&mut self.timer, self.start, at);
        self.phase = Phase::RxGuard;
        Wake::At(deadline)
    }

    fn rx_guard(&mut self, e: &mut Ieee154eVars, nbrs: &mut NeighborTable) -> Wake {
        let rx_end = self.radio.rx_end_time();

        let active = rx_end != 0
            || self.activity
            || self.radio.pending_packet()
            || !self.radio.channel_clear()
            || self.radio.receiving_packet();

        self.radio_off();

        if !active {
            trace!("rx: no frame in the air");
            return self.end_of_slot(e);
        }

        if self.signals.need_ack.load(Ordering::Relaxed) {
            // soft-ACK is timed from the received frame's SFD
            let at = self.config.tx_ack_delay.wrapping_sub(self.config.delay_tx);
            let (_, deadline) = schedule_fixed(&mut self.timer, rx_end, at);
            self.phase = Phase::RxAck;
            return Wake::At(deadline);
        }

        self.credit_rx_drift(nbrs);
        self.end_of_slot(e)
    }

    fn rx_ack(&mut self, e: &mut Ieee154eVars, nbrs: &mut NeighborTable) -> Wake {
        debug!("send ack");
        let ack = self.ack_frame;
        if self.radio.send_ack(&ack).is_err() {
            warn!("ack tx failed");
        }

        self.credit_rx_drift(nbrs);
        self.end_of_slot(e)
    }

    /// Credit the drift measured while ACKing a received frame.
    ///
    /// The sign convention is inverted: our correction is the negation of
    /// the measurement reported to the sender.
    fn credit_rx_drift(&mut self, nbrs: &mut NeighborTable) {
        let drift = self.signals.last_drift_us.swap(0, Ordering::Relaxed);
        if drift == 0 {
            return;
        }

        let src = Addr::from_u64(self.signals.last_rf_src.load(Ordering::Relaxed));
        if let Some(n) = nbrs.get(src) {
            if n.time_source {
                trace!("rx drift recorded");
                self.drift_us -= drift;
                self.drift_count += 1;
            }
        }
    }

    /// Advance slot bookkeeping, apply drift at the slotframe boundary and
    /// arm the next wake-up, skipping a slot if the deadline was missed.
    fn end_of_slot(&mut self, e: &mut Ieee154eVars) -> Wake {
        let (dt, mut duration) = self.slot_advance();

        // apply the averaged sync correction on the start of a new slotframe
        if self.timeslot_wraps() {
            if self.drift_count > 0 {
                let correction = sync::us_avg_to_ticks(self.drift_us, self.drift_count as i32);
                debug!("new slotframe, drift correction {} ticks", correction);
                duration = duration.wrapping_add(correction as u32);
            }
            self.drift_us = 0;
            self.drift_count = 0;
        }

        self.timeslot = self.slotframe.next_on_slot(self.timeslot);
        e.asn += dt as u64;
        self.start = self.start.wrapping_add(duration);
        self.phase = Phase::SlotStart;

        // a missed deadline skips one slot to keep the slotframe aligned
        if self.start.wrapping_sub(self.timer.now()) > duration {
            warn!("skipping slot after missed deadline");

            let (dt2, duration2) = self.slot_advance();
            self.timeslot = self.slotframe.next_on_slot(self.timeslot);
            e.asn += dt2 as u64;

            let ref_time = self.start.wrapping_sub(duration);
            let (_, deadline) =
                schedule_fixed(&mut self.timer, ref_time, duration.wrapping_add(duration2));
            self.start = self.start.wrapping_add(duration2);
            return Wake::At(deadline);
        }

        let ref_time = self.start.wrapping_sub(duration);
        let (_, deadline) = schedule_fixed(&mut self.timer, ref_time, duration);
        Wake::At(deadline)
    }

    /// Slots and ticks until the next on-slot
    fn slot_advance(&self) -> (u16, u32) {
        let next = self.slotframe.next_on_slot(self.timeslot);
        let dt = if next != 0 {
            next - self.timeslot
        } else {
            self.slotframe.length - self.timeslot
        };
        (dt, dt as u32 * self.config.slot_duration)
    }

    fn timeslot_wraps(&self) -> bool {
        self.slotframe.next_on_slot(self.timeslot) == 0
    }
}
