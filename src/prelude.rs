//! TSCH crate prelude
//
// SPDX-License-Identifier: MPL-2.0

pub use crate::{Radio, RadioTx, TxStatus, RxFrame, RxInfo, MAX_FRAME_LEN};

pub use crate::error::CoreError;
pub use crate::timer::{Timer as SlotTimer, Tick, Wake, ScheduleStatus};

pub use crate::config::TschConfig;

pub use crate::neighbor::{Addr, NeighborQueue, NeighborTable, TxPacket};

pub use crate::schedule::{Cell, CellKind, CellOptions, Slotframe};

pub use crate::slot::{Ieee154eVars, SlotDecision, TschState, TxDone};

pub use crate::driver::{Tsch, RxPacket};

pub use ieee802154::mac::{Address as MacAddress, PanId, AddressMode, ShortAddress, ExtendedAddress};
