//! Slotframe and cell model, including the channel hopping function.

use bitflags::bitflags;

use heapless::{Vec, consts::U16};

use crate::neighbor::Addr;

bitflags! {
    /// Cell option bitfield
    pub struct CellOptions: u8 {
        const TX = 0b0000_0001;
        const RX = 0b0000_0010;
        const SHARED = 0b0000_0100;
        const TIME_KEEPING = 0b0000_1000;
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellKind {
    Normal,
    /// Enhanced Beacon cell
    Advertising,
}

/// One entry in a slotframe.
///
/// A cell whose peer is broadcast and carries `SHARED` is a shared
/// broadcast slot: it may carry unicast traffic to any neighbor when no
/// broadcast packet is queued.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Cell {
    pub slot_offset: u16,
    pub channel_offset: u16,
    pub options: CellOptions,
    pub kind: CellKind,
    pub peer: Addr,
}

impl Cell {
    pub fn new(slot_offset: u16, channel_offset: u16, options: CellOptions, kind: CellKind, peer: Addr) -> Self {
        Self { slot_offset, channel_offset, options, kind, peer }
    }
}

/// A repeating cycle of timeslots.
///
/// Cell at index `i` is the `i`-th populated (on) slot; the remaining
/// `length - on_size` slots of the period are off and sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct Slotframe {
    pub handle: u16,
    /// Total timeslots in one period
    pub length: u16,
    cells: Vec<Cell, U16>,
}

impl Slotframe {
    pub fn new(handle: u16, length: u16) -> Self {
        Self {
            handle,
            length,
            cells: Vec::new(),
        }
    }

    /// The minimum schedule: one advertising cell plus five shared
    /// broadcast cells over a 101-slot period.
    pub fn minimal() -> Self {
        let mut sf = Self::new(0, 101);

        let _ = sf.push(Cell::new(0, 0, CellOptions::TX, CellKind::Advertising, Addr::NULL));
        for i in 1..6 {
            let _ = sf.push(Cell::new(
                i,
                0,
                CellOptions::TX | CellOptions::RX | CellOptions::SHARED,
                CellKind::Normal,
                Addr::NULL,
            ));
        }

        sf
    }

    /// Append an on-cell, rejecting it when the frame is full
    pub fn push(&mut self, cell: Cell) -> Result<(), Cell> {
        self.cells.push(cell)
    }

    /// Number of populated (on) slots
    pub fn on_size(&self) -> u16 {
        self.cells.len() as u16
    }

    /// The cell for an on-slot index, `None` for off slots
    pub fn cell(&self, timeslot: u16) -> Option<&Cell> {
        self.cells.get(timeslot as usize)
    }

    /// Index of the next on-slot, wrapping to 0 past the last
    pub fn next_on_slot(&self, timeslot: u16) -> u16 {
        if timeslot >= self.on_size().saturating_sub(1) {
            0
        } else {
            timeslot + 1
        }
    }
}

/// Channel hopping function over the 16-channel 2.4 GHz band.
///
/// Deterministic in `(channel_offset, asn)` so that all nodes sharing a
/// schedule land on the same channel.
pub fn hop_channel(channel_offset: u16, asn: u64) -> u8 {
    11 + ((channel_offset as u64 + asn) % 16) as u8
}
