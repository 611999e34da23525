//! A simulated ACX chip for tests.
//!
//! The simulation covers the register file, device memory (reachable through both the mapped
//! window and the slave memory registers), a firmware model answering mailbox commands and a
//! clock, that only advances through the delay hooks of the bus.

use std::{cell::Cell, collections::HashMap, rc::Rc};

use embassy_time::Instant;

use crate::{
    cmd::CmdCode,
    desc::{DescCtl, RxDesc, RxStatus, TxDesc, DESC_SIZE},
    ie::{ids, MemoryMap},
    regs::{int_trig, ChipKind, IrqStatus, Reg, RegTable, ECPU_CTRL_RUN, HW_ABSENT_32},
    transport::{IrqLine, RegisterBus},
};

pub const SIM_MEM_SIZE: usize = 0x4_0000;
/// Where the simulated firmware places its command mailbox.
pub const SIM_CMD_AREA: u32 = 0x3_f000;
const SIM_INFO_AREA: u32 = 0x3_f800;
/// Where injected RX frames are placed on slave memory cards.
const SIM_RX_DATA: u32 = 0x3_8000;
const SIM_RX_DATA_END: u32 = 0x3_e000;
const PARAM_AREA_LEN: u32 = 0x3fc;

/// The memory map reported by default.
pub const SIM_MEMORY_MAP: MemoryMap = MemoryMap {
    code_start: 0,
    code_end: 0x1_0000,
    wep_cache_start: 0x1_0000,
    wep_cache_end: 0x1_1000,
    packet_template_start: 0x1_1000,
    packet_template_end: 0x1_2000,
    queue_start: 0x1_2000,
    queue_end: 0x1_6000,
    pool_start: 0x1_6000,
    pool_end: 0x3_0000,
};

struct PendingCmd {
    due_us: u64,
    code: u8,
}

/// The interrupt mask, shared with the handle given out to the interrupt handler.
#[derive(Clone)]
pub struct SimIrqLine(Rc<Cell<u16>>);
impl IrqLine for SimIrqLine {
    fn mask_all(&self) {
        self.0.set(u16::MAX);
    }
}

pub struct SimChip {
    chip: ChipKind,
    regs: HashMap<u32, u32>,
    mem: Vec<u8>,
    irq_status: u16,
    irq_mask: SimIrqLine,

    slave_addr: u32,
    slave_autoinc: bool,
    slave_accesses: usize,
    end_ctl_writes: usize,

    ies: HashMap<u16, Vec<u8>>,
    issued: Vec<u8>,
    command_params: Vec<Vec<u8>>,
    param_high_water: u32,
    failures: HashMap<u8, u16>,
    mailbox_busy: bool,
    cmd_latency_us: u64,
    pending: Option<PendingCmd>,
    wedged: bool,
    unplugged: bool,

    tx_triggers: usize,
    rx_data_next: u32,
    elapsed_us: u64,
}
impl SimChip {
    pub fn new(chip: ChipKind) -> Self {
        let mut sim = Self {
            chip,
            regs: HashMap::new(),
            mem: vec![0; SIM_MEM_SIZE],
            irq_status: 0,
            irq_mask: SimIrqLine(Rc::new(Cell::new(u16::MAX))),
            slave_addr: 0,
            slave_autoinc: false,
            slave_accesses: 0,
            end_ctl_writes: 0,
            ies: HashMap::new(),
            issued: Vec::new(),
            command_params: Vec::new(),
            param_high_water: 0,
            failures: HashMap::new(),
            mailbox_busy: false,
            cmd_latency_us: 2000,
            pending: None,
            wedged: false,
            unplugged: false,
            tx_triggers: 0,
            rx_data_next: SIM_RX_DATA,
            elapsed_us: 0,
        };
        sim.set_ie(ids::MEMORY_MAP, &SIM_MEMORY_MAP.encode());
        let mut fwrev = [0u8; 0x18];
        fwrev[..12].copy_from_slice(b"Rev 1.10.7.0");
        let hardware_id: u32 = match chip {
            ChipKind::Acx100 => 0x0001_0101,
            ChipKind::Acx111 => 0x0002_0000,
        };
        fwrev[20..].copy_from_slice(&hardware_id.to_le_bytes());
        sim.set_ie(ids::FWREV, &fwrev);
        sim
    }
    fn table(&self) -> &'static RegTable {
        self.chip.regs()
    }
    fn is(&self, offset: u32, reg: Reg) -> bool {
        self.table().offset(reg) == offset
    }

    // Test controls.

    pub fn set_ie(&mut self, id: u16, data: &[u8]) {
        self.ies.insert(id, data.to_vec());
    }
    pub fn ie(&self, id: u16) -> Option<&[u8]> {
        self.ies.get(&id).map(Vec::as_slice)
    }
    /// Make every execution of `code` fail with `status`.
    pub fn fail_command(&mut self, code: u8, status: u16) {
        self.failures.insert(code, status);
    }
    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }
    /// Keep the mailbox status non idle.
    pub fn hold_mailbox_busy(&mut self, busy: bool) {
        self.mailbox_busy = busy;
    }
    pub fn set_cmd_latency_ms(&mut self, ms: u32) {
        self.cmd_latency_us = ms as u64 * 1000;
    }
    /// Stop executing commands and report an all ones IRQ mask.
    pub fn wedge(&mut self) {
        self.wedged = true;
    }
    /// Make every register read return all ones.
    pub fn unplug(&mut self) {
        self.unplugged = true;
    }
    pub fn raise_irq(&mut self, status: IrqStatus) {
        self.irq_status |= status.into_bits();
    }
    pub fn corrupt_byte(&mut self, addr: u32) {
        self.mem[addr as usize] ^= 0xff;
    }

    // Observations.

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }
    pub fn slave_accesses(&self) -> usize {
        self.slave_accesses
    }
    pub fn end_ctl_writes(&self) -> usize {
        self.end_ctl_writes
    }
    pub fn issued_commands(&self) -> &[u8] {
        &self.issued
    }
    /// Parameters of every executed command, in issue order.
    pub fn command_params(&self) -> &[Vec<u8>] {
        &self.command_params
    }
    /// The number of parameter bytes written before the last command.
    pub fn last_param_len(&self) -> usize {
        self.command_params.last().map(Vec::len).unwrap_or(0)
    }
    pub fn tx_triggers(&self) -> usize {
        self.tx_triggers
    }
    pub fn irq_mask(&self) -> u16 {
        self.irq_mask.0.get()
    }
    pub fn mem(&self, addr: u32, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    // Device side of the descriptor rings.

    fn read_desc_raw(&self, addr: u32) -> [u8; DESC_SIZE as usize] {
        let mut raw = [0u8; DESC_SIZE as usize];
        raw.copy_from_slice(self.mem(addr, DESC_SIZE as usize));
        raw
    }
    fn write_raw(&mut self, addr: u32, data: &[u8]) {
        self.mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }
    /// Mark a TX descriptor as done, like the firmware does after transmission.
    pub fn complete_tx(&mut self, chip: ChipKind, addr: u32, error: u8, ack_failures: u8) {
        let mut desc = TxDesc::decode(chip, &self.read_desc_raw(addr));
        desc.ctl = desc.ctl.with_acx_done(true);
        desc.error = error;
        desc.ack_failures = ack_failures;
        self.write_raw(addr, &desc.encode(chip));
        self.irq_status |= IrqStatus::new().with_tx_complete(true).into_bits();
    }
    /// Complete an RX descriptor, whose buffer was already filled.
    pub fn complete_rx(&mut self, chip: ChipKind, addr: u32, len: u16, level: u8, snr: u8) {
        let mut desc = RxDesc::decode(chip, &self.read_desc_raw(addr));
        desc.ctl = desc.ctl.with_acx_done(true);
        desc.status = RxStatus::new().with_full(true);
        desc.len = len;
        desc.level = level;
        desc.snr = snr;
        self.write_raw(addr, &desc.encode(chip));
        self.irq_status |= IrqStatus::new().with_rx_complete(true).into_bits();
    }
    /// Place a frame in chip memory and complete the RX descriptor pointing to it.
    pub fn inject_rx(&mut self, chip: ChipKind, addr: u32, data: &[u8], level: u8, snr: u8) {
        let len = (data.len() as u32).next_multiple_of(4);
        if self.rx_data_next + len > SIM_RX_DATA_END {
            self.rx_data_next = SIM_RX_DATA;
        }
        let data_addr = self.rx_data_next;
        self.rx_data_next += len;
        self.write_raw(data_addr, data);

        let mut desc = RxDesc::decode(chip, &self.read_desc_raw(addr));
        desc.buffer = data_addr;
        self.write_raw(addr, &desc.encode(chip));
        self.complete_rx(chip, addr, data.len() as u16, level, snr);
    }
    /// Hand an RX descriptor back without a frame.
    pub fn reclaim_rx(&mut self, chip: ChipKind, addr: u32) {
        let mut desc = RxDesc::decode(chip, &self.read_desc_raw(addr));
        desc.ctl = DescCtl::RX_READY.with_acx_done(true);
        desc.status = RxStatus::new();
        desc.len = 0;
        self.write_raw(addr, &desc.encode(chip));
    }

    // Firmware model.

    fn read_mem(&self, addr: u32, buf: &mut [u8]) {
        buf.copy_from_slice(self.mem(addr, buf.len()));
        if self.mailbox_busy {
            // Overlay a non idle status word.
            let status = SIM_CMD_AREA + 2;
            for (i, byte) in buf.iter_mut().enumerate() {
                let at = addr + i as u32;
                if at == status {
                    *byte = 0x01;
                }
            }
        }
    }
    fn write_mem(&mut self, addr: u32, data: &[u8]) {
        self.write_raw(addr, data);
        let param_start = SIM_CMD_AREA + 4;
        let end = addr + data.len() as u32;
        if end > param_start && addr < param_start + PARAM_AREA_LEN {
            self.param_high_water = self.param_high_water.max(end - param_start);
        }
    }
    fn trigger_cmd(&mut self) {
        let code = self.mem[SIM_CMD_AREA as usize];
        self.issued.push(code);
        let params = self.mem(SIM_CMD_AREA + 4, self.param_high_water as usize).to_vec();
        self.command_params.push(params);
        self.param_high_water = 0;
        if self.wedged {
            return;
        }
        self.pending = Some(PendingCmd {
            due_us: self.elapsed_us + self.cmd_latency_us,
            code,
        });
        self.tick();
    }
    fn known_command(code: u8) -> bool {
        matches!(code, 0x00..=0x10 | 0x12..=0x16 | 0x18 | 0x19)
    }
    fn execute(&mut self, code: u8) -> u16 {
        if let Some(status) = self.failures.get(&code) {
            return *status;
        }
        if !Self::known_command(code) {
            return 2;
        }
        let param = SIM_CMD_AREA as usize + 4;
        let id = u16::from_le_bytes([self.mem[param], self.mem[param + 1]]);
        let len = u16::from_le_bytes([self.mem[param + 2], self.mem[param + 3]]) as usize;
        if code == CmdCode::Interrogate.into_bits() {
            let mut data = self.ies.get(&id).cloned().unwrap_or_default();
            data.resize(len, 0);
            self.write_raw(param as u32 + 4, &data);
        } else if code == CmdCode::Configure.into_bits() {
            let data = self.mem(param as u32 + 4, len).to_vec();
            self.ies.insert(id, data);
        }
        1
    }
    /// Complete the pending command, if it's due.
    fn tick(&mut self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        if pending.due_us > self.elapsed_us {
            return;
        }
        let code = pending.code;
        self.pending = None;
        let status = self.execute(code);
        self.write_raw(SIM_CMD_AREA + 2, &status.to_le_bytes());
        self.irq_status |= IrqStatus::new().with_cmd_complete(true).into_bits();
    }
    fn advance(&mut self, us: u64) {
        self.elapsed_us += us;
        self.tick();
    }

    fn read_reg(&mut self, offset: u32) -> u32 {
        if self.unplugged {
            return HW_ABSENT_32;
        }
        if self.is(offset, Reg::SlvMemData) {
            let mut word = [0u8; 4];
            self.read_mem(self.slave_addr, &mut word);
            self.slave_accesses += 1;
            if self.slave_autoinc {
                self.slave_addr += 4;
            }
            u32::from_le_bytes(word)
        } else if self.is(offset, Reg::IrqStatusNonDes) {
            self.tick();
            self.irq_status as u32
        } else if self.is(offset, Reg::IrqMask) {
            if self.wedged {
                HW_ABSENT_32
            } else {
                self.irq_mask() as u32
            }
        } else if self.is(offset, Reg::CmdMailboxOffs) {
            SIM_CMD_AREA
        } else if self.is(offset, Reg::InfoMailboxOffs) {
            SIM_INFO_AREA
        } else {
            self.regs.get(&offset).copied().unwrap_or(0)
        }
    }
    fn write_reg(&mut self, offset: u32, value: u32) {
        if self.is(offset, Reg::SlvMemData) {
            self.write_mem(self.slave_addr, &value.to_le_bytes());
            self.slave_accesses += 1;
            if self.slave_autoinc {
                self.slave_addr += 4;
            }
        } else if self.is(offset, Reg::SlvMemAddr) {
            self.slave_addr = value;
        } else if self.is(offset, Reg::SlvMemCtl) {
            self.slave_autoinc = value & 1 != 0;
        } else if self.is(offset, Reg::SlvEndCtl) {
            self.end_ctl_writes += 1;
        } else if self.is(offset, Reg::IrqAck) {
            self.irq_status &= !(value as u16);
        } else if self.is(offset, Reg::IrqMask) {
            self.irq_mask.0.set(value as u16);
        } else if self.is(offset, Reg::IntTrig) {
            if value as u16 & int_trig::CMD != 0 {
                self.trigger_cmd();
            }
            if value as u16 & int_trig::TXPRC != 0 {
                self.tx_triggers += 1;
            }
        } else if self.is(offset, Reg::EcpuCtrl) {
            if value as u16 == ECPU_CTRL_RUN {
                self.irq_status |= IrqStatus::new().with_fcs_threshold(true).into_bits();
            }
            self.regs.insert(offset, value);
        } else {
            self.regs.insert(offset, value);
        }
    }
}
impl RegisterBus for SimChip {
    type IrqLine = SimIrqLine;

    fn read8(&mut self, offset: u32) -> u8 {
        self.read_reg(offset) as u8
    }
    fn read16(&mut self, offset: u32) -> u16 {
        self.read_reg(offset) as u16
    }
    fn read32(&mut self, offset: u32) -> u32 {
        self.read_reg(offset)
    }
    fn write8(&mut self, offset: u32, value: u8) {
        self.write_reg(offset, value as u32)
    }
    fn write16(&mut self, offset: u32, value: u16) {
        self.write_reg(offset, value as u32)
    }
    fn write32(&mut self, offset: u32, value: u32) {
        self.write_reg(offset, value)
    }
    fn irq_line(&self, _offset: u32) -> SimIrqLine {
        self.irq_mask.clone()
    }
    fn window_read(&mut self, addr: u32, buf: &mut [u8]) {
        self.read_mem(addr, buf);
    }
    fn window_write(&mut self, addr: u32, data: &[u8]) {
        self.write_mem(addr, data);
    }
    fn udelay(&mut self, us: u32) {
        self.advance(us as u64);
    }
    async fn msleep(&mut self, ms: u32) {
        self.advance(ms as u64 * 1000);
    }
    fn now(&self) -> Instant {
        Instant::from_micros(self.elapsed_us)
    }
}
