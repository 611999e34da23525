//! Register names, per-chip offset tables and register bit definitions.
//!
//! The core never uses raw offsets. Everything is expressed as a [Reg], which is translated
//! through the [RegTable] of the chip at hand.

use bitfield_struct::bitfield;

/// Symbolic register names, shared by the ACX100 and ACX111.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    SoftReset,
    SlvMemAddr,
    SlvMemData,
    SlvMemCtl,
    SlvEndCtl,
    Femr,
    IntTrig,
    IrqMask,
    IrqStatusNonDes,
    IrqReason,
    IrqAck,
    HintTrig,
    Enable,
    EepromCtl,
    EepromAddr,
    EepromData,
    EepromCfg,
    PhyAddr,
    PhyData,
    PhyCtl,
    GpioOe,
    GpioOut,
    CmdMailboxOffs,
    InfoMailboxOffs,
    EepromInformation,
    EeStart,
    SorCfg,
    EcpuCtrl,
}
impl Reg {
    const COUNT: usize = Reg::EcpuCtrl as usize + 1;
}

/// Byte offsets of all [Reg]s for one chip.
#[derive(Debug, PartialEq, Eq)]
pub struct RegTable {
    offsets: [u16; Reg::COUNT],
}
impl RegTable {
    /// Translate a register name to its byte offset.
    pub const fn offset(&self, reg: Reg) -> u32 {
        self.offsets[reg as usize] as u32
    }
}

pub static ACX100_REGS: RegTable = RegTable {
    offsets: [
        0x0000, 0x0014, 0x0018, 0x001c, 0x0020, 0x0034, 0x007c, 0x0098, 0x00a4, 0x00a8, 0x00ac,
        0x00b0, 0x0104, 0x0250, 0x0254, 0x0258, 0x025c, 0x0268, 0x026c, 0x0270, 0x0290, 0x0298,
        0x02a4, 0x02a8, 0x02ac, 0x02d0, 0x02d4, 0x02d8,
    ],
};

pub static ACX111_REGS: RegTable = RegTable {
    offsets: [
        0x0000, 0x0014, 0x0018, 0x001c, 0x0020, 0x0034, 0x00b4, 0x00d4, 0x00f0, 0x00f8, 0x00e8,
        0x00ec, 0x01d0, 0x0338, 0x033c, 0x0340, 0x0344, 0x0350, 0x0354, 0x0358, 0x0374, 0x037c,
        0x0388, 0x038c, 0x0390, 0x0100, 0x0104, 0x0108,
    ],
};

/// The chip family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipKind {
    Acx100,
    Acx111,
}
impl ChipKind {
    pub const fn regs(self) -> &'static RegTable {
        match self {
            Self::Acx100 => &ACX100_REGS,
            Self::Acx111 => &ACX111_REGS,
        }
    }
    /// Divisor used when converting the raw RX level into a percentage.
    pub const fn level_correction(self) -> u8 {
        match self {
            Self::Acx100 => 8,
            Self::Acx111 => 5,
        }
    }
}

/// A register read returning this means the card is gone.
pub const HW_ABSENT_32: u32 = 0xffff_ffff;
pub const HW_ABSENT_16: u16 = 0xffff;

#[bitfield(u16)]
/// Interrupt reasons, as found in `IRQ_STATUS_NON_DES`, `IRQ_ACK` and `IRQ_MASK`.
#[derive(PartialEq, Eq)]
pub struct IrqStatus {
    pub rx_data: bool,
    pub tx_complete: bool,
    pub tx_xfer: bool,
    pub rx_complete: bool,
    pub dtim: bool,
    pub beacon: bool,
    pub timer: bool,
    pub key_not_found: bool,
    pub iv_icv_failure: bool,
    pub cmd_complete: bool,
    pub info: bool,
    pub overflow: bool,
    pub process_error: bool,
    pub scan_complete: bool,
    pub fcs_threshold: bool,
    pub unknown: bool,
}
impl IrqStatus {
    /// The interrupts the driver services. Everything else stays masked.
    pub const SERVICED: Self = Self::new()
        .with_rx_data(true)
        .with_tx_complete(true)
        .with_rx_complete(true)
        .with_cmd_complete(true)
        .with_info(true)
        .with_overflow(true)
        .with_process_error(true)
        .with_scan_complete(true);

    pub const fn has_rx(self) -> bool {
        self.rx_data() || self.rx_complete()
    }
    pub const fn intersects(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() != 0
    }
}

/// Bits of the `INT_TRIG` register.
pub mod int_trig {
    pub const CMD: u16 = 0x0001;
    pub const TXPRC: u16 = 0x0004;
    pub const RXPRC: u16 = 0x0008;
}

/// `ECPU_CTRL` value halting the embedded CPU.
pub const ECPU_CTRL_HALT: u16 = 0x0001;
pub const ECPU_CTRL_RUN: u16 = 0x0000;
/// `SOFT_RESET` bit.
pub const SOFT_RESET_BIT: u16 = 0x0001;
/// `SLV_MEM_CTL` modes.
pub const SLV_MEM_CTL_BASIC: u32 = 0;
pub const SLV_MEM_CTL_AUTOINC: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_differ_where_the_chips_do() {
        assert_eq!(ACX100_REGS.offset(Reg::SlvMemAddr), 0x14);
        assert_eq!(ACX111_REGS.offset(Reg::SlvMemAddr), 0x14);
        assert_eq!(ACX100_REGS.offset(Reg::IntTrig), 0x7c);
        assert_eq!(ACX111_REGS.offset(Reg::IntTrig), 0xb4);
        assert_eq!(ACX111_REGS.offset(Reg::EcpuCtrl), 0x108);
    }

    #[test]
    fn irq_bits_match_hardware() {
        assert_eq!(IrqStatus::new().with_cmd_complete(true).into_bits(), 0x0200);
        assert_eq!(IrqStatus::new().with_fcs_threshold(true).into_bits(), 0x4000);
        assert_eq!(IrqStatus::new().with_scan_complete(true).into_bits(), 0x2000);
        assert!(IrqStatus::SERVICED.has_rx());
    }
}
