//! Descriptor layouts.
//!
//! Descriptors live in device memory. The host only ever sees them as [TxDesc] and [RxDesc],
//! which are decoded from and encoded into the chip specific byte layout. The control byte is
//! kept at a fixed offset, so it can be read and written on its own.

use bitfield_struct::bitfield;

use crate::regs::ChipKind;

#[bitfield(u8)]
/// The descriptor control byte. It carries the ownership hand-off.
#[derive(PartialEq, Eq)]
pub struct DescCtl {
    pub short_preamble: bool,
    pub first_frag: bool,
    pub auto_dma: bool,
    pub reclaim: bool,
    #[bits(1)]
    pub __: u8,
    pub host_done: bool,
    /// Set by the device, once it's done with the descriptor.
    pub acx_done: bool,
    /// Set while the host owns the descriptor.
    pub host_own: bool,
}
impl DescCtl {
    /// A TX descriptor, that is ready to be filled by the host.
    pub const TX_HOST_EMPTY: Self = Self::new().with_host_own(true).with_first_frag(true);
    /// An RX descriptor, that is ready to receive.
    pub const RX_READY: Self = Self::new().with_reclaim(true).with_auto_dma(true);

    pub const fn state(self) -> SlotState {
        if self.acx_done() {
            SlotState::DeviceDone
        } else if self.host_own() {
            SlotState::HostEmpty
        } else {
            SlotState::DeviceBusy
        }
    }
}

/// The ownership state of a descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// Owned by the host and free.
    HostEmpty,
    /// Owned by the device and in progress.
    DeviceBusy,
    /// Completed by the device, waiting to be reclaimed by the host.
    DeviceDone,
}
impl SlotState {
    pub const fn host_owned(self) -> bool {
        matches!(self, Self::HostEmpty)
    }
}

#[bitfield(u32)]
/// Status word of an RX descriptor.
#[derive(PartialEq, Eq)]
pub struct RxStatus {
    #[bits(8)]
    pub mac_status: u8,
    pub decrypted: bool,
    pub fcs_error: bool,
    #[bits(21)]
    pub __: u32,
    /// The buffer holds a frame.
    pub full: bool,
}

/// Size of every descriptor in device memory.
pub const DESC_SIZE: u32 = 32;
/// Offset of the control byte in a TX descriptor.
pub const TX_CTL_OFFSET: u32 = 16;
/// Offset of the control byte in an RX descriptor.
pub const RX_CTL_OFFSET: u32 = 14;

/// A TX descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxDesc {
    /// Device address of the next descriptor in the ring.
    pub next: u32,
    /// Host address of the header buffer, or device address of the first block of the chain.
    pub buffer: u32,
    /// Host address of the payload buffer. Unused for chip memory blocks.
    pub payload: u32,
    pub total_len: u16,
    pub payload_len: u16,
    pub ctl: DescCtl,
    pub ctl2: u8,
    pub error: u8,
    pub ack_failures: u8,
    pub rts_failures: u8,
    pub rts_ok: u8,
    /// The rate handed in by rate control. The ACX100 only has room for a byte.
    pub rate: u16,
    pub queue_ctrl: u8,
    pub tx_time: u32,
}
impl TxDesc {
    pub fn encode(&self, chip: ChipKind) -> [u8; DESC_SIZE as usize] {
        let mut raw = [0u8; DESC_SIZE as usize];
        raw[0..4].copy_from_slice(&self.next.to_le_bytes());
        raw[4..8].copy_from_slice(&self.buffer.to_le_bytes());
        raw[8..12].copy_from_slice(&self.payload.to_le_bytes());
        raw[12..14].copy_from_slice(&self.total_len.to_le_bytes());
        raw[14..16].copy_from_slice(&self.payload_len.to_le_bytes());
        raw[16] = self.ctl.into_bits();
        raw[17] = self.ctl2;
        raw[18] = self.error;
        raw[19] = self.ack_failures;
        raw[20] = self.rts_failures;
        raw[21] = self.rts_ok;
        match chip {
            ChipKind::Acx100 => {
                raw[22] = self.rate as u8;
                raw[23] = self.queue_ctrl;
            }
            ChipKind::Acx111 => {
                raw[22..24].copy_from_slice(&self.rate.to_le_bytes());
                raw[24] = self.queue_ctrl;
            }
        }
        raw[28..32].copy_from_slice(&self.tx_time.to_le_bytes());
        raw
    }
    pub fn decode(chip: ChipKind, raw: &[u8; DESC_SIZE as usize]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let (rate, queue_ctrl) = match chip {
            ChipKind::Acx100 => (raw[22] as u16, raw[23]),
            ChipKind::Acx111 => (u16_at(22), raw[24]),
        };
        Self {
            next: u32_at(0),
            buffer: u32_at(4),
            payload: u32_at(8),
            total_len: u16_at(12),
            payload_len: u16_at(14),
            ctl: DescCtl::from_bits(raw[16]),
            ctl2: raw[17],
            error: raw[18],
            ack_failures: raw[19],
            rts_failures: raw[20],
            rts_ok: raw[21],
            rate,
            queue_ctrl,
            tx_time: u32_at(28),
        }
    }
    /// Clear everything the device wrote during the last transmission.
    pub fn reset_status(&mut self) {
        self.error = 0;
        self.ack_failures = 0;
        self.rts_failures = 0;
        self.rts_ok = 0;
        self.tx_time = 0;
        self.total_len = 0;
        self.payload_len = 0;
        self.buffer = 0;
        self.payload = 0;
        self.ctl = DescCtl::TX_HOST_EMPTY;
    }
}

/// An RX descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxDesc {
    pub next: u32,
    /// Host address of the RX buffer, or device address of the frame in chip memory.
    pub buffer: u32,
    pub status: RxStatus,
    pub len: u16,
    pub ctl: DescCtl,
    pub level: u8,
    pub snr: u8,
    pub plcp_signal: u8,
    pub rate: u16,
    pub timestamp: u32,
}
impl RxDesc {
    pub fn encode(&self, chip: ChipKind) -> [u8; DESC_SIZE as usize] {
        let mut raw = [0u8; DESC_SIZE as usize];
        raw[0..4].copy_from_slice(&self.next.to_le_bytes());
        raw[4..8].copy_from_slice(&self.buffer.to_le_bytes());
        raw[8..12].copy_from_slice(&self.status.into_bits().to_le_bytes());
        raw[12..14].copy_from_slice(&self.len.to_le_bytes());
        raw[14] = self.ctl.into_bits();
        raw[16] = self.level;
        raw[17] = self.snr;
        raw[18] = self.plcp_signal;
        match chip {
            ChipKind::Acx100 => raw[19] = self.rate as u8,
            ChipKind::Acx111 => raw[24..26].copy_from_slice(&self.rate.to_le_bytes()),
        }
        raw[20..24].copy_from_slice(&self.timestamp.to_le_bytes());
        raw
    }
    pub fn decode(chip: ChipKind, raw: &[u8; DESC_SIZE as usize]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            next: u32_at(0),
            buffer: u32_at(4),
            status: RxStatus::from_bits(u32_at(8)),
            len: u16_at(12),
            ctl: DescCtl::from_bits(raw[14]),
            level: raw[16],
            snr: raw[17],
            plcp_signal: raw[18],
            rate: match chip {
                ChipKind::Acx100 => raw[19] as u16,
                ChipKind::Acx111 => u16_at(24),
            },
            timestamp: u32_at(20),
        }
    }
}
