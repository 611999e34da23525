//! # `acx-wifi-hal`
//! This is a driver core for the TI ACX100 and ACX111 WLAN chips.
//! Both chips run a firmware on an embedded CPU (eCPU), which does the actual 802.11 work. The
//! host loads that firmware, talks to it through a command mailbox and exchanges frames with it
//! through descriptor rings in device memory. The host MAC layer is not part of this crate, it
//! plugs in through [HostMac].
//! ## Hardware overview
//! ### Access to the chip
//! Registers are always reachable, but their offsets differ between the two chips, which is
//! why every register access goes through a per chip [regs::RegTable].
//! Device memory is a different story. On cards, where it's mapped into the host address space,
//! it's accessed directly. Other cards only expose it through the slave memory registers, an
//! address register and a data register, that optionally auto-increments the address. Both ways
//! are hidden behind the [transport::Transport] trait. Slave memory cards are timing sensitive,
//! so waiting on them is always done by spinning, while direct cards may yield.
//!
//! ### Firmware
//! The firmware image is uploaded word by word into chip memory, read back and compared against
//! its checksum, before the eCPU is released from halt. Some cards additionally need a radio
//! module, which is uploaded after the main firmware signalled, that it's ready. See
//! [firmware].
//!
//! ### Commands
//! Once running, the firmware exposes a command mailbox at an offset it reports in a register.
//! A command is written as a type/status header followed by parameters, the firmware is
//! triggered and the host waits for the completion interrupt. Most configuration is done through
//! information elements (IEs), which are written and read with the `CONFIGURE` and
//! `INTERROGATE` commands. See [cmd] and [ie].
//!
//! ### Receive (RX)
//! The RX ring is a circular list of descriptors. The firmware fills a slot and sets the
//! `ACX_DONE` bit in its control byte. We then take the frame out of the slot, reset it and hand
//! it back. On slave memory cards, the frames stay in chip memory and are copied out through the
//! slave memory window.
//!
//! ### Transmit (TX)
//! TX works the same way in the opposite direction. Frames submitted by the host MAC layer wait
//! in a software FIFO, until the next service pass puts them on a TX ring. On direct cards the
//! firmware DMAs header and payload straight from host memory. On slave memory cards the frame is
//! first copied into a chain of chip memory blocks, taken from a free list. Once the firmware is
//! done with a slot, it's reclaimed and the status is reported back. If the ring runs low, the
//! queue gate tells the host MAC layer to stop, until enough slots are free again.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub(crate) mod fmt;

pub mod cmd;
pub mod desc;
pub mod dma_ring;
pub mod firmware;
pub mod frame;
pub mod ie;
pub mod regs;
#[cfg(test)]
mod sim;
pub mod sync;
pub mod transport;
pub mod txbuf;
mod wmac;

pub use cmd::{CmdCode, CmdError, CmdResult, CmdStatus, CommandPort};
pub use firmware::LoadError;
pub use frame::{RxFrame, RxMeta, TxError, TxFrame, TxStatus, MAX_FRAME_LEN};
pub use regs::{ChipKind, IrqStatus};
pub use transport::{
    Direct, IrqLine, Mmio, MmioIrqLine, RegisterBus, SlaveMem, Transport, TransportKind,
};
pub use wmac::*;

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
