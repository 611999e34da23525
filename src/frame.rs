//! Frames as they cross the boundary to the host MAC layer.

use alloc::vec::Vec;

use bitfield_struct::bitfield;

use crate::{
    desc::{RxDesc, TxDesc},
    regs::ChipKind,
};

/// The length of the 802.11 MAC header, derived from the frame control field.
///
/// Never exceeds the length of the frame.
pub fn header_len(frame: &[u8]) -> usize {
    let [fc0, fc1, ..] = frame else {
        return frame.len();
    };
    let len = match (fc0 >> 2) & 0b11 {
        // Control frames. CTS and ACK are short.
        1 => match fc0 >> 4 {
            0xc | 0xd => 10,
            _ => 16,
        },
        // Data frames. Four address frames and QoS frames have extra fields.
        2 => {
            let mut len = 24;
            if fc1 & 0b11 == 0b11 {
                len += 6;
            }
            if fc0 & 0x80 != 0 {
                len += 2;
            }
            len
        }
        _ => 24,
    };
    len.min(frame.len())
}
/// Check the protected bit in the frame control field.
pub fn is_protected(frame: &[u8]) -> bool {
    frame.get(1).is_some_and(|fc1| fc1 & 0x40 != 0)
}

/// The longest 802.11 MPDU. Anything longer is refused before it gets near a ring.
pub const MAX_FRAME_LEN: usize = 2346;

/// A frame handed to us by the host MAC layer for transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxFrame {
    /// The complete 802.11 frame without FCS.
    pub data: Vec<u8>,
    /// The rate selected by rate control. Passed through to the descriptor unmodified.
    pub rate: u16,
    /// Opaque value for the host MAC layer to match up TX status reports.
    pub cookie: u32,
}
impl TxFrame {
    pub fn new(data: Vec<u8>, rate: u16, cookie: u32) -> Self {
        Self { data, rate, cookie }
    }
}

#[bitfield(u8)]
/// The error byte of a completed TX descriptor.
#[derive(PartialEq, Eq)]
pub struct TxError {
    /// A previous fragment of the same MSDU failed.
    pub fragment: bool,
    pub aborted: bool,
    pub bad_params: bool,
    pub key_not_found: bool,
    pub lifetime_exceeded: bool,
    pub excessive_retries: bool,
    pub buffer_overflow: bool,
    pub dma: bool,
}
impl TxError {
    pub const fn is_ok(self) -> bool {
        self.into_bits() == 0
    }
}

/// The outcome of a transmission, as reported to the host MAC layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxStatus {
    pub success: bool,
    /// Retries needed, i.e. the number of missing ACKs.
    pub retries: u8,
    pub rts_failures: u8,
    pub rts_ok: u8,
    /// The rate the frame was sent with.
    pub rate: u16,
    pub error: TxError,
}
impl TxStatus {
    pub fn from_desc(desc: &TxDesc) -> Self {
        let error = TxError::from_bits(desc.error);
        Self {
            success: error.is_ok(),
            retries: desc.ack_failures,
            rts_failures: desc.rts_failures,
            rts_ok: desc.rts_ok,
            rate: desc.rate,
            error,
        }
    }
    /// A status for frames, that were dropped without ever being transmitted.
    pub fn dropped() -> Self {
        Self {
            success: false,
            retries: 0,
            rts_failures: 0,
            rts_ok: 0,
            rate: 0,
            error: TxError::new().with_aborted(true),
        }
    }
}

/// Metadata of a received frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxMeta {
    /// Device timestamp in microseconds.
    pub timestamp: u32,
    /// Signal level in percent.
    pub signal: u8,
    /// Noise level in percent.
    pub noise: u8,
    /// Link quality in percent.
    pub quality: u8,
    pub rate: u16,
    pub decrypted: bool,
    pub fcs_error: bool,
}
impl RxMeta {
    pub fn from_desc(chip: ChipKind, desc: &RxDesc) -> Self {
        let correction = chip.level_correction();
        let signal = winlevel(desc.level, correction);
        let noise = winlevel(desc.snr, correction);
        Self {
            timestamp: desc.timestamp,
            signal,
            noise,
            quality: quality(signal, noise),
            rate: desc.rate,
            decrypted: desc.status.decrypted(),
            fcs_error: desc.status.fcs_error(),
        }
    }
}

/// A received frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxFrame {
    pub data: Vec<u8>,
    pub meta: RxMeta,
}

/// Convert a raw level byte to a percentage.
pub fn winlevel(raw: u8, correction: u8) -> u8 {
    let correction = correction.max(1) as i32;
    ((correction / 2 + raw as i32 * 5) / correction).clamp(0, 100) as u8
}
/// Link quality in percent, from signal and noise in percent.
pub fn quality(signal: u8, noise: u8) -> u8 {
    let signal = signal as i32;
    let noise = noise as i32;
    (((signal - 30) * 100 / 70 + (100 - noise * 4)) / 2).clamp(0, 100) as u8
}
