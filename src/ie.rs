//! Information elements.
//!
//! Configuration of the firmware happens through information elements (IEs), which are
//! written with `CONFIGURE` and read with `INTERROGATE`. Every IE starts with a four byte
//! header, consisting of the `u16` type and the `u16` length of the payload. The length of a
//! given IE is fixed per chip and looked up in one of two tables, one for the generic IEs and one
//! for the ones in the dot11 range.

use alloc::{vec, vec::Vec};

use bitfield_struct::bitfield;

use crate::{
    cmd::{CmdCode, CmdError, CmdResult, CommandPort, CMD_PARAM_MAX},
    regs::ChipKind,
};

/// Size of the type and length header.
pub const IE_HEADER_LEN: usize = 4;

/// IE type identifiers.
pub mod ids {
    pub const ACX_TIMER: u16 = 0x0001;
    pub const POWER_MGMT: u16 = 0x0002;
    pub const QUEUE_CONFIG: u16 = 0x0003;
    pub const BLOCK_SIZE: u16 = 0x0004;
    pub const MEMORY_CONFIG_OPTIONS: u16 = 0x0005;
    pub const RATE_FALLBACK: u16 = 0x0006;
    pub const WEP_OPTIONS: u16 = 0x0007;
    pub const MEMORY_MAP: u16 = 0x0008;
    pub const SCAN_STATUS: u16 = 0x0009;
    pub const ASSOC_ID: u16 = 0x000a;
    pub const FWREV: u16 = 0x000d;
    pub const FCS_ERROR_COUNT: u16 = 0x000e;
    pub const MEDIUM_USAGE: u16 = 0x000f;
    pub const RXCONFIG: u16 = 0x0010;
    pub const FIRMWARE_STATISTICS: u16 = 0x0012;
    pub const FEATURE_CONFIG: u16 = 0x0015;
    pub const KEY_CHOOSE: u16 = 0x0016;

    pub const DOT11_STATION_ID: u16 = 0x1001;
    pub const DOT11_BEACON_PERIOD: u16 = 0x1002;
    pub const DOT11_DTIM_PERIOD: u16 = 0x1003;
    pub const DOT11_SHORT_RETRY_LIMIT: u16 = 0x1004;
    pub const DOT11_LONG_RETRY_LIMIT: u16 = 0x1005;
    pub const DOT11_WEP_DEFAULT_KEY_WRITE: u16 = 0x1006;
    pub const DOT11_MAX_XMIT_MSDU_LIFETIME: u16 = 0x1007;
    pub const DOT11_GROUP_ADDR: u16 = 0x1008;
    pub const DOT11_CURRENT_REG_DOMAIN: u16 = 0x1009;
    pub const DOT11_CURRENT_ANTENNA: u16 = 0x100a;
    pub const DOT11_TX_POWER_LEVEL: u16 = 0x100d;
    pub const DOT11_CURRENT_CCA_MODE: u16 = 0x100e;
    pub const DOT11_ED_THRESHOLD: u16 = 0x100f;
    pub const DOT11_WEP_DEFAULT_KEY_SET: u16 = 0x1010;
}

const DOT11_BASE: u16 = 0x1000;

// Indexed by the low byte of the IE type. Zero means the IE doesn't exist on that chip.
const ACX100_GENERIC_LENS: [u16; 0x18] = [
    0x00, 0x10, 0x06, 0x1c, 0x02, 0x14, 0x01, 0x03, 0x28, 0x04, 0x02, 0x00, 0x00, 0x18, 0x04,
    0x08, 0x04, 0x00, 0x9c, 0x00, 0x00, 0x08, 0x00, 0x00,
];
const ACX111_GENERIC_LENS: [u16; 0x18] = [
    0x00, 0x00, 0x0c, 0x1c, 0x00, 0x20, 0x01, 0x00, 0x28, 0x04, 0x02, 0x00, 0x00, 0x18, 0x04,
    0x08, 0x04, 0x00, 0x9c, 0x00, 0x00, 0x08, 0x04, 0x00,
];
const ACX100_DOT11_LENS: [u16; 0x11] = [
    0x00, 0x06, 0x02, 0x01, 0x01, 0x01, 0x20, 0x04, 0x00, 0x02, 0x01, 0x00, 0x00, 0x01, 0x01,
    0x04, 0x01,
];
const ACX111_DOT11_LENS: [u16; 0x11] = [
    0x00, 0x06, 0x00, 0x01, 0x01, 0x01, 0x00, 0x04, 0x00, 0x02, 0x01, 0x00, 0x00, 0x01, 0x01,
    0x00, 0x01,
];

/// The payload length of an IE on the specified chip.
///
/// Returns `None` for IEs, that are unknown on the chip.
pub fn ie_len(chip: ChipKind, id: u16) -> Option<u16> {
    let (table, index): (&[u16], u16) = match (chip, id >= DOT11_BASE) {
        (ChipKind::Acx100, false) => (&ACX100_GENERIC_LENS, id),
        (ChipKind::Acx111, false) => (&ACX111_GENERIC_LENS, id),
        (ChipKind::Acx100, true) => (&ACX100_DOT11_LENS, id - DOT11_BASE),
        (ChipKind::Acx111, true) => (&ACX111_DOT11_LENS, id - DOT11_BASE),
    };
    table
        .get(index as usize)
        .copied()
        .filter(|len| *len != 0)
}

/// Write an IE.
///
/// The payload is zero padded or truncated to the table length of the IE. Unknown IEs are sent
/// with the length of the payload.
pub async fn configure<P: CommandPort>(port: &mut P, id: u16, payload: &[u8]) -> CmdResult<()> {
    let len = ie_len(port.chip(), id)
        .map(usize::from)
        .unwrap_or(payload.len());
    if IE_HEADER_LEN + len > CMD_PARAM_MAX {
        return Err(CmdError::ParamTooLarge);
    }
    let mut buf = vec![0u8; IE_HEADER_LEN + len];
    buf[0..2].copy_from_slice(&id.to_le_bytes());
    buf[2..4].copy_from_slice(&(len as u16).to_le_bytes());
    let copy = len.min(payload.len());
    buf[IE_HEADER_LEN..IE_HEADER_LEN + copy].copy_from_slice(&payload[..copy]);
    trace!("Configuring IE {:x}, len: {}", id, len);
    let timeout_ms = port.timeout_ms();
    let total = buf.len();
    port.issue_cmd(CmdCode::Configure, &mut buf, total, timeout_ms)
        .await
}

/// Read an IE into `out`.
///
/// At most `out.len()` bytes of the payload are copied. Returns the payload length, that was
/// requested from the firmware.
pub async fn interrogate<P: CommandPort>(
    port: &mut P,
    id: u16,
    out: &mut [u8],
) -> CmdResult<usize> {
    let len = ie_len(port.chip(), id).map(usize::from).unwrap_or(out.len());
    if IE_HEADER_LEN + len > CMD_PARAM_MAX {
        return Err(CmdError::ParamTooLarge);
    }
    let mut buf = vec![0u8; IE_HEADER_LEN + len];
    buf[0..2].copy_from_slice(&id.to_le_bytes());
    buf[2..4].copy_from_slice(&(len as u16).to_le_bytes());
    let timeout_ms = port.timeout_ms();
    let total = buf.len();
    port.issue_cmd(CmdCode::Interrogate, &mut buf, total, timeout_ms)
        .await?;
    let copy = len.min(out.len());
    out[..copy].copy_from_slice(&buf[IE_HEADER_LEN..IE_HEADER_LEN + copy]);
    Ok(len)
}

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Layout of the device memory, as reported by the firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryMap {
    pub code_start: u32,
    pub code_end: u32,
    pub wep_cache_start: u32,
    pub wep_cache_end: u32,
    pub packet_template_start: u32,
    pub packet_template_end: u32,
    /// Start of the area for the descriptor rings.
    pub queue_start: u32,
    pub queue_end: u32,
    /// Start of the TX block pool on slave memory cards.
    pub pool_start: u32,
    pub pool_end: u32,
}
impl MemoryMap {
    pub const LEN: usize = 0x28;

    pub fn parse(raw: &[u8; Self::LEN]) -> Self {
        Self {
            code_start: u32_at(raw, 0x00),
            code_end: u32_at(raw, 0x04),
            wep_cache_start: u32_at(raw, 0x08),
            wep_cache_end: u32_at(raw, 0x0c),
            packet_template_start: u32_at(raw, 0x10),
            packet_template_end: u32_at(raw, 0x14),
            queue_start: u32_at(raw, 0x18),
            queue_end: u32_at(raw, 0x1c),
            pool_start: u32_at(raw, 0x20),
            pool_end: u32_at(raw, 0x24),
        }
    }
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut raw = [0u8; Self::LEN];
        for (i, word) in [
            self.code_start,
            self.code_end,
            self.wep_cache_start,
            self.wep_cache_end,
            self.packet_template_start,
            self.packet_template_end,
            self.queue_start,
            self.queue_end,
            self.pool_start,
            self.pool_end,
        ]
        .into_iter()
        .enumerate()
        {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }
    pub async fn read<P: CommandPort>(port: &mut P) -> CmdResult<Self> {
        let mut raw = [0u8; Self::LEN];
        interrogate(port, ids::MEMORY_MAP, &mut raw).await?;
        Ok(Self::parse(&raw))
    }
}

/// Firmware and hardware revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareRev {
    version: [u8; 20],
    pub hardware_id: u32,
}
impl FirmwareRev {
    pub const LEN: usize = 0x18;

    pub fn parse(raw: &[u8; Self::LEN]) -> Self {
        let mut version = [0u8; 20];
        version.copy_from_slice(&raw[..20]);
        Self {
            version,
            hardware_id: u32_at(raw, 20),
        }
    }
    /// The version string, e.g. `Rev 1.9.8.b`.
    pub fn version(&self) -> &str {
        let end = self
            .version
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(self.version.len());
        core::str::from_utf8(&self.version[..end]).unwrap_or("")
    }
    pub async fn read<P: CommandPort>(port: &mut P) -> CmdResult<Self> {
        let mut raw = [0u8; Self::LEN];
        interrogate(port, ids::FWREV, &mut raw).await?;
        Ok(Self::parse(&raw))
    }
}

/// Where the descriptor rings live, as told to the firmware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueConfig {
    pub rx_start: u32,
    pub rx_len: u16,
    /// Start and length of every TX ring. At most two are supported.
    pub tx: Vec<(u32, u16)>,
    pub queue_end: u32,
}
impl QueueConfig {
    pub const LEN: usize = 0x1c;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut raw = [0u8; Self::LEN];
        raw[0..4].copy_from_slice(&self.rx_start.to_le_bytes());
        raw[4..6].copy_from_slice(&self.rx_len.to_le_bytes());
        raw[6] = self.tx.len() as u8;
        for (i, (start, len)) in self.tx.iter().take(2).enumerate() {
            let offset = 8 + i * 8;
            raw[offset..offset + 4].copy_from_slice(&start.to_le_bytes());
            raw[offset + 4..offset + 6].copy_from_slice(&len.to_le_bytes());
        }
        raw[24..28].copy_from_slice(&self.queue_end.to_le_bytes());
        raw
    }
}

#[bitfield(u16)]
/// The first half of the `RXCONFIG` IE.
#[derive(PartialEq, Eq)]
pub struct RxConfig1 {
    #[bits(1)]
    __reserved0: u8,
    pub include_phy_hdr: bool,
    pub include_fcs: bool,
    pub promiscuous: bool,
    pub filter_mac: bool,
    pub filter_bssid: bool,
    pub filter_all_multicast: bool,
    pub rcv_mc_addr0: bool,
    pub rcv_mc_addr1: bool,
    pub filter_broadcast: bool,
    pub filter_ssid: bool,
    #[bits(2)]
    __reserved1: u8,
    pub include_rxbuf_hdr: bool,
    #[bits(2)]
    __reserved2: u8,
}
#[bitfield(u16)]
/// The second half of the `RXCONFIG` IE. Selects the frame types to be received.
#[derive(PartialEq, Eq)]
pub struct RxConfig2 {
    pub other: bool,
    pub ack: bool,
    pub probe_response: bool,
    pub probe_request: bool,
    pub management: bool,
    pub broken: bool,
    pub data: bool,
    pub control: bool,
    pub cf: bool,
    pub beacon: bool,
    pub auth: bool,
    pub assoc_request: bool,
    #[bits(4)]
    __reserved: u8,
}
impl RxConfig2 {
    /// Everything, except broken frames.
    pub const ALL: Self = Self::from_bits(0x0fdf);
}
