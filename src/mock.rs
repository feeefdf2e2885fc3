//! Mock radio for MAC testing.
//!
//! Cloned handles share state so tests can adjust radio behaviour while
//! the MAC holds its own handle, mirroring the shared-state mock timer.

use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::{Radio, RadioTx};
use crate::timer::Tick;

/// Radio operations recorded by the mock, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum RadioOp {
    On,
    Off,
    SetChannel(u8),
    Prepare(Vec<u8>),
    Transmit(usize),
    SfdSync(bool, bool),
    SendAck(Vec<u8>),
}

#[derive(Clone)]
pub struct MockRadio(Arc<Mutex<Inner>>);

#[derive(Debug)]
struct Inner {
    ops: Vec<RadioOp>,

    channel_clear: bool,
    receiving: bool,
    pending: bool,
    pending_irq: bool,
    tx_result: RadioTx,
    rx_end_time: Tick,
    sfd_timer: Tick,
    rx: Vec<u8>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            ops: Vec::new(),

            channel_clear: true,
            receiving: false,
            pending: false,
            pending_irq: false,
            tx_result: RadioTx::Ok,
            rx_end_time: 0,
            sfd_timer: 0,
            rx: Vec::new(),
        })))
    }

    /// Operations recorded since the last `take_ops`
    pub fn take_ops(&self) -> Vec<RadioOp> {
        core::mem::replace(&mut self.0.lock().unwrap().ops, Vec::new())
    }

    pub fn set_channel_clear(&self, v: bool) {
        self.0.lock().unwrap().channel_clear = v;
    }

    pub fn set_receiving(&self, v: bool) {
        self.0.lock().unwrap().receiving = v;
    }

    pub fn set_pending(&self, v: bool) {
        self.0.lock().unwrap().pending = v;
    }

    pub fn set_pending_irq(&self, v: bool) {
        self.0.lock().unwrap().pending_irq = v;
    }

    pub fn set_tx_result(&self, r: RadioTx) {
        self.0.lock().unwrap().tx_result = r;
    }

    pub fn set_rx_end_time(&self, t: Tick) {
        self.0.lock().unwrap().rx_end_time = t;
    }

    pub fn set_sfd_timer(&self, t: Tick) {
        self.0.lock().unwrap().sfd_timer = t;
    }

    /// Set the frame returned by `read` / `read_ack`
    pub fn set_rx_frame(&self, data: &[u8]) {
        self.0.lock().unwrap().rx = data.to_vec();
    }
}

impl Radio for MockRadio {
    type Error = ();

    fn on(&mut self) -> Result<(), ()> {
        self.0.lock().unwrap().ops.push(RadioOp::On);
        Ok(())
    }

    fn off(&mut self) -> Result<(), ()> {
        self.0.lock().unwrap().ops.push(RadioOp::Off);
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), ()> {
        self.0.lock().unwrap().ops.push(RadioOp::SetChannel(channel));
        Ok(())
    }

    fn prepare(&mut self, data: &[u8]) -> Result<(), ()> {
        self.0.lock().unwrap().ops.push(RadioOp::Prepare(data.to_vec()));
        Ok(())
    }

    fn transmit(&mut self, len: usize) -> RadioTx {
        let mut i = self.0.lock().unwrap();
        i.ops.push(RadioOp::Transmit(len));
        i.tx_result
    }

    fn channel_clear(&mut self) -> bool {
        self.0.lock().unwrap().channel_clear
    }

    fn receiving_packet(&mut self) -> bool {
        self.0.lock().unwrap().receiving
    }

    fn pending_packet(&mut self) -> bool {
        self.0.lock().unwrap().pending
    }

    fn pending_irq(&mut self) -> bool {
        self.0.lock().unwrap().pending_irq
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let i = self.0.lock().unwrap();
        let n = i.rx.len().min(buf.len());
        buf[..n].copy_from_slice(&i.rx[..n]);
        n
    }

    fn read_ack(&mut self, buf: &mut [u8]) -> usize {
        self.read(buf)
    }

    fn sfd_sync(&mut self, capture_start: bool, capture_end: bool) {
        self.0.lock().unwrap().ops.push(RadioOp::SfdSync(capture_start, capture_end));
    }

    fn rx_end_time(&mut self) -> Tick {
        self.0.lock().unwrap().rx_end_time
    }

    fn read_sfd_timer(&mut self) -> Tick {
        self.0.lock().unwrap().sfd_timer
    }

    fn send_ack(&mut self, ack: &[u8]) -> Result<(), ()> {
        self.0.lock().unwrap().ops.push(RadioOp::SendAck(ack.to_vec()));
        Ok(())
    }
}
