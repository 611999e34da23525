//! The command mailbox protocol.
//!
//! The firmware exposes a small region of device memory, the command mailbox, which holds a
//! `u16` command type, a `u16` status and a parameter blob. Only one command can be in the
//! mailbox at a time, which is guaranteed by [Mailbox::issue] requiring exclusive access. The
//! caller holds the device lock for the entire duration.
//!
//! ## Command flow
//! 1. Wait for the mailbox status to become idle.
//! 2. Write the parameters. For `INTERROGATE` only the four byte IE header is written.
//! 3. Write type and status, then trigger the command interrupt.
//! 4. Wait for `CMD_COMPLETE`, ack it.
//! 5. Read the status back and reset the mailbox to idle, no matter what happened.
//! 6. On success of an `INTERROGATE`, copy the result back.

use macro_bits::serializable_enum;

use crate::{
    regs::{int_trig, ChipKind, IrqStatus, Reg, HW_ABSENT_16, HW_ABSENT_32},
    sync::IrqSignal,
    transport::{Transport, TransportKind},
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Commands understood by the firmware.
    pub enum CmdCode: u8 {
        Reset => 0x00,
        Interrogate => 0x01,
        Configure => 0x02,
        EnableRx => 0x03,
        EnableTx => 0x04,
        DisableRx => 0x05,
        DisableTx => 0x06,
        FlushQueue => 0x07,
        Scan => 0x08,
        StopScan => 0x09,
        ConfigTim => 0x0a,
        Join => 0x0b,
        WepMgmt => 0x0c,
        MemRead => 0x0d,
        MemWrite => 0x0e,
        Sleep => 0x0f,
        Wake => 0x10,
        InitMemory => 0x12,
        ConfigBeacon => 0x13,
        ConfigProbeResponse => 0x14,
        ConfigNullData => 0x15,
        ConfigProbeRequest => 0x16,
        RadioInit => 0x18,
        RadioCalib => 0x19
    }
}

/// Status word written back by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdStatus {
    Idle,
    Success,
    UnknownCommand,
    InvalidIe,
    ChannelRejected,
    ChannelInvalidInDomain,
    MacInvalid,
    ReadOnlyIe,
    Rejected,
    AlreadyAsleep,
    TxInProgress,
    AlreadyAwake,
    WriteOnly,
    RxInProgress,
    InvalidParameter,
    ScanInProgress,
    Failed,
    Other(u16),
}
impl CmdStatus {
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Success,
            2 => Self::UnknownCommand,
            3 => Self::InvalidIe,
            4 => Self::ChannelRejected,
            5 => Self::ChannelInvalidInDomain,
            6 => Self::MacInvalid,
            7 => Self::ReadOnlyIe,
            8 => Self::Rejected,
            9 => Self::AlreadyAsleep,
            10 => Self::TxInProgress,
            11 => Self::AlreadyAwake,
            12 => Self::WriteOnly,
            13 => Self::RxInProgress,
            14 => Self::InvalidParameter,
            15 => Self::ScanInProgress,
            16 => Self::Failed,
            other => Self::Other(other),
        }
    }
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Success => "success",
            Self::UnknownCommand => "unknown command",
            Self::InvalidIe => "invalid information element",
            Self::ChannelRejected => "channel rejected",
            Self::ChannelInvalidInDomain => "channel invalid in current regulatory domain",
            Self::MacInvalid => "MAC invalid",
            Self::ReadOnlyIe => "read-only information element",
            Self::Rejected => "command rejected",
            Self::AlreadyAsleep => "already asleep",
            Self::TxInProgress => "TX in progress",
            Self::AlreadyAwake => "already awake",
            Self::WriteOnly => "write only",
            Self::RxInProgress => "RX in progress",
            Self::InvalidParameter => "invalid parameter",
            Self::ScanInProgress => "scan in progress",
            Self::Failed => "failed",
            Self::Other(_) => "unknown status",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdError {
    /// No firmware is running yet.
    FirmwareNotLoaded,
    /// A register read returned all ones.
    HardwareAbsent,
    /// The mailbox never became idle.
    DeviceBusyTimeout,
    /// The firmware never signaled completion.
    CompletionTimeout,
    /// The firmware stopped responding entirely and needs to be reloaded.
    FirmwareWedged,
    /// The firmware rejected the command.
    CommandFailed(CmdStatus),
    /// The parameters don't fit into the mailbox.
    ParamTooLarge,
}
pub type CmdResult<T> = Result<T, CmdError>;

/// Default timeout for commands.
pub const CMD_TIMEOUT_MS: u32 = 100;
/// Upper bound for any command timeout.
pub const CMD_TIMEOUT_MAX_MS: u32 = 1200;
/// How many times the mailbox is polled for idle, one millisecond apart.
pub const CMD_IDLE_POLLS: u32 = 199;
/// Size of the parameter area behind the type and status words.
pub const CMD_PARAM_MAX: usize = 0x3fc;

const STATUS_SUCCESS: u16 = 1;

/// The command mailbox of one device.
#[derive(Debug)]
pub struct Mailbox {
    cmd_area: u32,
    fw_loaded: bool,
}
impl Mailbox {
    pub const fn new() -> Self {
        Self {
            cmd_area: 0,
            fw_loaded: false,
        }
    }
    /// Record the mailbox location reported by the firmware and allow commands.
    pub fn set_loaded(&mut self, cmd_area: u32) {
        debug!("Command mailbox at {:x}.", cmd_area);
        self.cmd_area = cmd_area;
        self.fw_loaded = true;
    }
    /// Forbid commands, for example, because the eCPU was halted.
    pub fn set_unloaded(&mut self) {
        self.fw_loaded = false;
    }
    pub const fn is_loaded(&self) -> bool {
        self.fw_loaded
    }
    pub const fn cmd_area(&self) -> u32 {
        self.cmd_area
    }
    const fn param_area(&self) -> u32 {
        self.cmd_area + 4
    }
    fn read_type_status<T: Transport>(&self, transport: &mut T) -> u32 {
        transport.mem_read32(self.cmd_area)
    }
    fn write_type_status<T: Transport>(&self, transport: &mut T, cmd: u16, status: u16) {
        transport.mem_write32(self.cmd_area, cmd as u32 | ((status as u32) << 16));
    }
    /// Check the IRQ status for command completion and ack it.
    fn poll_complete<T: Transport>(transport: &mut T, irq: &IrqSignal) -> CmdResult<bool> {
        let complete = IrqStatus::new().with_cmd_complete(true);
        if irq.take_observed(complete) {
            transport.write16(Reg::IrqAck, complete.into_bits());
            return Ok(true);
        }
        let status = transport.read16(Reg::IrqStatusNonDes);
        if status == HW_ABSENT_16 {
            return Err(CmdError::HardwareAbsent);
        }
        if IrqStatus::from_bits(status).cmd_complete() {
            transport.write16(Reg::IrqAck, complete.into_bits());
            return Ok(true);
        }
        Ok(false)
    }

    /// Issue a command and wait for it to complete.
    ///
    /// For [CmdCode::Interrogate], `buf` has to start with the IE header and receives the result
    /// on success. On failure `buf[..len]` is zeroed.
    pub async fn issue<T: Transport>(
        &mut self,
        transport: &mut T,
        irq: &IrqSignal,
        cmd: CmdCode,
        buf: &mut [u8],
        len: usize,
        timeout_ms: u32,
    ) -> CmdResult<()> {
        let cmd_raw = cmd.into_bits() as u16;
        if !self.fw_loaded {
            warn!("Command {:x} issued without firmware.", cmd_raw);
            return Err(CmdError::FirmwareNotLoaded);
        }
        if len > CMD_PARAM_MAX || len > buf.len() {
            return Err(CmdError::ParamTooLarge);
        }
        trace!("Issuing command {:x}, len: {}", cmd_raw, len);

        // Wait for the previous command to be done.
        let mut polls = CMD_IDLE_POLLS;
        loop {
            let type_status = self.read_type_status(transport);
            if type_status == HW_ABSENT_32 {
                return Err(CmdError::HardwareAbsent);
            }
            if type_status >> 16 == 0 {
                break;
            }
            if polls == 0 {
                error!(
                    "Mailbox not idle before command {:x}, type/status: {:x}",
                    cmd_raw, type_status
                );
                return Err(CmdError::DeviceBusyTimeout);
            }
            polls -= 1;
            transport.wait_ms(1).await;
        }

        // The firmware reports the length of the result itself.
        let param_len = if cmd == CmdCode::Interrogate {
            len.min(4)
        } else {
            len
        };
        if param_len != 0 {
            transport.mem_write(self.param_area(), &buf[..param_len]);
        }

        irq.take_observed(IrqStatus::new().with_cmd_complete(true));
        self.write_type_status(transport, cmd_raw, 0);
        transport.write16(Reg::IntTrig, int_trig::CMD);
        transport.flush();

        let mut remaining = timeout_ms.clamp(1, CMD_TIMEOUT_MAX_MS);
        let completed = loop {
            match Self::poll_complete(transport, irq) {
                Ok(true) => break true,
                Ok(false) => {}
                Err(err) => {
                    self.write_type_status(transport, CmdCode::Reset.into_bits() as u16, 0);
                    buf[..len].fill(0);
                    return Err(err);
                }
            }
            if remaining == 0 {
                break false;
            }
            remaining -= 1;
            transport.wait_ms(1).await;
        };

        let status = (self.read_type_status(transport) >> 16) as u16;
        // Never leave anything behind, that could block the next command.
        self.write_type_status(transport, CmdCode::Reset.into_bits() as u16, 0);

        if !completed {
            buf[..len].fill(0);
            if T::KIND == TransportKind::SlaveMemory
                && transport.read32(Reg::IrqMask) == HW_ABSENT_32
            {
                error!(
                    "Firmware wedged while executing command {:x}. A reload is required.",
                    cmd_raw
                );
                return Err(CmdError::FirmwareWedged);
            }
            error!(
                "Command {:x} timed out after {} ms, status: {:x}",
                cmd_raw, timeout_ms, status
            );
            return Err(CmdError::CompletionTimeout);
        }
        if status != STATUS_SUCCESS {
            let status = CmdStatus::from_raw(status);
            buf[..len].fill(0);
            warn!("Command {:x} failed: {}", cmd_raw, status.name());
            return Err(CmdError::CommandFailed(status));
        }
        if cmd == CmdCode::Interrogate && len != 0 {
            transport.mem_read(self.param_area(), &mut buf[..len]);
        }
        Ok(())
    }
}
impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Something, that can execute firmware commands.
///
/// The mailbox based transports implement this through [MailboxPort]. USB attached cards carry
/// commands in bulk transfers and plug in here instead.
#[allow(async_fn_in_trait)]
pub trait CommandPort {
    /// The chip behind the port. Selects the IE length tables.
    fn chip(&self) -> ChipKind;
    /// Timeout for commands, that don't specify their own.
    fn timeout_ms(&self) -> u32 {
        CMD_TIMEOUT_MS
    }
    async fn issue_cmd(
        &mut self,
        cmd: CmdCode,
        buf: &mut [u8],
        len: usize,
        timeout_ms: u32,
    ) -> CmdResult<()>;
}

/// A [CommandPort] over a mailbox, for code that already holds the device lock.
pub struct MailboxPort<'a, T: Transport> {
    pub mailbox: &'a mut Mailbox,
    pub transport: &'a mut T,
    pub irq: &'a IrqSignal,
    pub chip: ChipKind,
    pub timeout_ms: u32,
}
impl<T: Transport> CommandPort for MailboxPort<'_, T> {
    fn chip(&self) -> ChipKind {
        self.chip
    }
    fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }
    async fn issue_cmd(
        &mut self,
        cmd: CmdCode,
        buf: &mut [u8],
        len: usize,
        timeout_ms: u32,
    ) -> CmdResult<()> {
        self.mailbox
            .issue(self.transport, self.irq, cmd, buf, len, timeout_ms)
            .await
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::{
        regs::ACX111_REGS,
        sim::{SimChip, SIM_CMD_AREA},
        transport::{Direct, SlaveMem},
    };

    fn loaded_mailbox() -> Mailbox {
        let mut mailbox = Mailbox::new();
        mailbox.set_loaded(SIM_CMD_AREA);
        mailbox
    }

    #[test]
    fn refuses_without_firmware() {
        let mut transport = Direct::new(SimChip::new(ChipKind::Acx111), &ACX111_REGS);
        let mut mailbox = Mailbox::new();
        let res = block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [],
            0,
            CMD_TIMEOUT_MS,
        ));
        assert_eq!(res, Err(CmdError::FirmwareNotLoaded));
        assert!(transport.bus().issued_commands().is_empty());
    }

    #[test]
    fn interrogate_returns_result_and_leaves_mailbox_idle() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.set_ie(0x0042, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut transport = SlaveMem::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let irq = IrqSignal::new();

        let mut buf = [0u8; 12];
        buf[..4].copy_from_slice(&[0x42, 0x00, 8, 0]);
        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::Interrogate,
            &mut buf,
            12,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
        assert_eq!(&buf[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // Only the IE header went over the wire.
        assert_eq!(transport.bus().last_param_len(), 4);
        assert_eq!(transport.mem_read32(SIM_CMD_AREA), 0);

        // The next command isn't blocked by anything the first one left behind.
        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::EnableRx,
            &mut [6],
            1,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
        assert_eq!(
            transport.bus().issued_commands(),
            &[CmdCode::Interrogate.into_bits(), CmdCode::EnableRx.into_bits()]
        );
    }

    #[test]
    fn failure_zeroes_buffer_and_resets_mailbox() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.fail_command(CmdCode::Configure.into_bits(), 7);
        let mut transport = Direct::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let irq = IrqSignal::new();

        let mut buf = [0x0b, 0x10, 1, 0, 9];
        let res = block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::Configure,
            &mut buf,
            5,
            CMD_TIMEOUT_MS,
        ));
        assert_eq!(res, Err(CmdError::CommandFailed(CmdStatus::ReadOnlyIe)));
        assert_eq!(buf, [0; 5]);
        assert_eq!(transport.mem_read32(SIM_CMD_AREA), 0);

        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::EnableTx,
            &mut [1],
            1,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();

        // Once the firmware accepts it, the same command goes through.
        transport.bus().clear_failures();
        let mut buf = [0x0b, 0x10, 1, 0, 9];
        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::Configure,
            &mut buf,
            5,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
        assert_eq!(transport.bus().ie(0x100b), Some(&[9][..]));
    }

    #[test]
    fn absent_hardware_is_detected_before_dispatch() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.unplug();
        let mut transport = SlaveMem::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let start = transport.bus().elapsed_us();
        let res = block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [1],
            1,
            CMD_TIMEOUT_MS,
        ));
        assert_eq!(res, Err(CmdError::HardwareAbsent));
        assert!(transport.bus().issued_commands().is_empty());
        // No idle polling either, the first all ones read is final.
        assert!(transport.bus().elapsed_us() - start < 1000);
    }

    #[test]
    fn busy_mailbox_times_out() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.hold_mailbox_busy(true);
        let mut transport = SlaveMem::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let start = transport.bus().elapsed_us();
        let res = block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [1],
            1,
            CMD_TIMEOUT_MS,
        ));
        assert_eq!(res, Err(CmdError::DeviceBusyTimeout));
        assert!(transport.bus().elapsed_us() - start >= CMD_IDLE_POLLS as u64 * 1000);
        assert!(transport.bus().issued_commands().is_empty());
    }

    #[test]
    fn slow_completion_times_out_and_clamps() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.set_cmd_latency_ms(5000);
        let mut transport = Direct::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let start = transport.bus().elapsed_us();
        let res = block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [1],
            1,
            10_000,
        ));
        assert_eq!(res, Err(CmdError::CompletionTimeout));
        let waited = transport.bus().elapsed_us() - start;
        assert!(waited <= (CMD_TIMEOUT_MAX_MS as u64 + 1) * 1000);
        assert_eq!(transport.mem_read32(SIM_CMD_AREA), 0);
    }

    #[test]
    fn latency_within_timeout_succeeds() {
        let mut sim = SimChip::new(ChipKind::Acx100);
        sim.set_cmd_latency_ms(20);
        let mut transport = Direct::new(sim, &crate::regs::ACX100_REGS);
        let mut mailbox = loaded_mailbox();
        block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [1],
            1,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
    }

    #[test]
    fn wedged_firmware_is_reported_on_slave_memory() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.wedge();
        let mut transport = SlaveMem::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let res = block_on(mailbox.issue(
            &mut transport,
            &IrqSignal::new(),
            CmdCode::EnableRx,
            &mut [1],
            1,
            50,
        ));
        assert_eq!(res, Err(CmdError::FirmwareWedged));
    }

    #[test]
    fn observed_completion_is_honored() {
        let mut sim = SimChip::new(ChipKind::Acx111);
        sim.set_cmd_latency_ms(0);
        let mut transport = Direct::new(sim, &ACX111_REGS);
        let mut mailbox = loaded_mailbox();
        let irq = IrqSignal::new();
        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::Wake,
            &mut [],
            0,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
        // A stale completion from a previous command must not satisfy the next one.
        irq.raise(IrqStatus::new().with_cmd_complete(true));
        transport.bus().hold_mailbox_busy(false);
        transport.bus().set_cmd_latency_ms(3);
        block_on(mailbox.issue(
            &mut transport,
            &irq,
            CmdCode::Sleep,
            &mut [],
            0,
            CMD_TIMEOUT_MS,
        ))
        .unwrap();
        assert_eq!(
            transport.bus().issued_commands(),
            &[CmdCode::Wake.into_bits(), CmdCode::Sleep.into_bits()]
        );
    }
}
