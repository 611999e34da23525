//! Register and device memory access.
//!
//! There are two layers here. A [RegisterBus] is the raw, chip agnostic access to the register
//! file, the mapped device memory window (if there is one) and the delay primitives. A
//! [Transport] builds on top of that and decides how device memory is reached: [Direct] uses the
//! mapped window, [SlaveMem] goes through the `SLV_MEM_ADDR`/`SLV_MEM_DATA` register pair.
//!
//! Everything above this module, i.e. the mailbox, the rings and the firmware loader, is written
//! once against [Transport].

use core::ptr::NonNull;

use embassy_time::{block_for, Duration, Instant, Timer};

use crate::regs::{Reg, RegTable, SLV_MEM_CTL_BASIC};

/// The physical access method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportKind {
    /// Registers and device memory are memory mapped.
    DirectMmio,
    /// Registers are memory mapped, device memory is reached indirectly.
    SlaveMemory,
    /// The device is behind a USB bridge. Only the [CommandPort](crate::CommandPort) seam is
    /// available for these.
    Usb,
}

/// How long waits behave while the device lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitPolicy {
    /// Spin. The hardware doesn't tolerate the lock holder being descheduled.
    BusyWait,
    /// Yield to the executor.
    Yield,
}

/// Access to the interrupt mask, that works without the device lock.
///
/// This is what the interrupt handler uses, to silence the device until the deferred worker got
/// to it.
pub trait IrqLine {
    /// Mask every device interrupt.
    fn mask_all(&self);
}

/// Raw access to the device.
///
/// Offsets are byte offsets into the register file. Window addresses are device memory
/// addresses.
#[allow(async_fn_in_trait)]
pub trait RegisterBus {
    type IrqLine: IrqLine;

    fn read8(&mut self, offset: u32) -> u8;
    fn read16(&mut self, offset: u32) -> u16;
    fn read32(&mut self, offset: u32) -> u32;
    fn write8(&mut self, offset: u32, value: u8);
    fn write16(&mut self, offset: u32, value: u16);
    fn write32(&mut self, offset: u32, value: u32);

    /// A handle to the 16 bit register at `offset`, that holds the interrupt mask.
    fn irq_line(&self, offset: u32) -> Self::IrqLine;

    /// Read from the mapped device memory window.
    ///
    /// Buses without a window (slave memory only cards) are never asked to do this, since
    /// [SlaveMem] doesn't use it.
    fn window_read(&mut self, addr: u32, buf: &mut [u8]);
    /// Write to the mapped device memory window.
    fn window_write(&mut self, addr: u32, data: &[u8]);

    /// The address the device has to use, to reach the host buffer.
    fn dma_addr(&self, buf: &[u8]) -> u32 {
        buf.as_ptr() as usize as u32
    }

    /// Spin for the specified amount of microseconds.
    fn udelay(&mut self, us: u32) {
        block_for(Duration::from_micros(us as u64));
    }
    /// Sleep for the specified amount of milliseconds.
    async fn msleep(&mut self, ms: u32) {
        Timer::after_millis(ms as u64).await;
    }
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [RegisterBus] over memory mapped register and window regions.
pub struct Mmio {
    regs: NonNull<u8>,
    window: NonNull<u8>,
    window_len: usize,
}
impl Mmio {
    /// Create a new memory mapped bus.
    ///
    /// SAFETY:
    /// `regs` must point to the mapped register file and `window` to `window_len` bytes of
    /// mapped device memory. Both must stay mapped for the lifetime of the bus.
    pub const unsafe fn new(regs: NonNull<u8>, window: NonNull<u8>, window_len: usize) -> Self {
        Self {
            regs,
            window,
            window_len,
        }
    }
    /// The part of `[addr, addr + len)`, that lies inside the window.
    fn window_range(&self, addr: u32, len: usize) -> core::ops::Range<usize> {
        let start = (addr as usize).min(self.window_len);
        let end = start.saturating_add(len).min(self.window_len);
        if end - start != len {
            error!(
                "Window access of {} bytes at {:x} is out of bounds.",
                len, addr
            );
        }
        start..end
    }
}
/// The interrupt mask register of a memory mapped register file.
pub struct MmioIrqLine {
    reg: NonNull<u16>,
}
impl IrqLine for MmioIrqLine {
    fn mask_all(&self) {
        unsafe { self.reg.as_ptr().write_volatile(u16::MAX) }
    }
}
unsafe impl Send for MmioIrqLine {}
unsafe impl Sync for MmioIrqLine {}

impl RegisterBus for Mmio {
    type IrqLine = MmioIrqLine;

    fn read8(&mut self, offset: u32) -> u8 {
        unsafe { self.regs.as_ptr().add(offset as usize).read_volatile() }
    }
    fn read16(&mut self, offset: u32) -> u16 {
        unsafe { (self.regs.as_ptr().add(offset as usize) as *const u16).read_volatile() }
    }
    fn read32(&mut self, offset: u32) -> u32 {
        unsafe { (self.regs.as_ptr().add(offset as usize) as *const u32).read_volatile() }
    }
    fn write8(&mut self, offset: u32, value: u8) {
        unsafe { self.regs.as_ptr().add(offset as usize).write_volatile(value) }
    }
    fn write16(&mut self, offset: u32, value: u16) {
        unsafe { (self.regs.as_ptr().add(offset as usize) as *mut u16).write_volatile(value) }
    }
    fn write32(&mut self, offset: u32, value: u32) {
        unsafe { (self.regs.as_ptr().add(offset as usize) as *mut u32).write_volatile(value) }
    }
    fn irq_line(&self, offset: u32) -> MmioIrqLine {
        MmioIrqLine {
            reg: unsafe { self.regs.add(offset as usize) }.cast(),
        }
    }
    fn window_read(&mut self, addr: u32, buf: &mut [u8]) {
        // Bytes outside the window read as all ones, like on an absent card.
        buf.fill(0xff);
        let range = self.window_range(addr, buf.len());
        for (byte, at) in buf.iter_mut().zip(range) {
            *byte = unsafe { self.window.as_ptr().add(at).read_volatile() };
        }
    }
    fn window_write(&mut self, addr: u32, data: &[u8]) {
        let range = self.window_range(addr, data.len());
        for (byte, at) in data.iter().zip(range) {
            unsafe { self.window.as_ptr().add(at).write_volatile(*byte) };
        }
    }
}
unsafe impl Send for Mmio {}

/// Uniform access to registers and device memory, regardless of the physical access method.
#[allow(async_fn_in_trait)]
pub trait Transport {
    const KIND: TransportKind;
    const WAIT_POLICY: WaitPolicy;

    type Bus: RegisterBus;

    fn bus(&mut self) -> &mut Self::Bus;
    fn bus_ref(&self) -> &Self::Bus;
    fn regs(&self) -> &'static RegTable;

    /// Copy `buf.len()` bytes of device memory starting at `addr` into `buf`.
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]);
    /// Copy `data` into device memory starting at `addr`.
    fn mem_write(&mut self, addr: u32, data: &[u8]);

    fn read8(&mut self, reg: Reg) -> u8 {
        let offset = self.regs().offset(reg);
        self.bus().read8(offset)
    }
    fn read16(&mut self, reg: Reg) -> u16 {
        let offset = self.regs().offset(reg);
        self.bus().read16(offset)
    }
    fn read32(&mut self, reg: Reg) -> u32 {
        let offset = self.regs().offset(reg);
        self.bus().read32(offset)
    }
    fn write8(&mut self, reg: Reg, value: u8) {
        let offset = self.regs().offset(reg);
        self.bus().write8(offset, value)
    }
    fn write16(&mut self, reg: Reg, value: u16) {
        let offset = self.regs().offset(reg);
        self.bus().write16(offset, value)
    }
    fn write32(&mut self, reg: Reg, value: u32) {
        let offset = self.regs().offset(reg);
        self.bus().write32(offset, value)
    }
    /// Make sure all posted writes have reached the device.
    fn flush(&mut self) {
        let _ = self.read8(Reg::SoftReset);
    }

    fn mem_read32(&mut self, addr: u32) -> u32 {
        let mut word = [0u8; 4];
        self.mem_read(addr, &mut word);
        u32::from_le_bytes(word)
    }
    fn mem_write32(&mut self, addr: u32, value: u32) {
        self.mem_write(addr, &value.to_le_bytes());
    }

    fn udelay(&mut self, us: u32) {
        self.bus().udelay(us)
    }
    fn now(&self) -> Instant {
        self.bus_ref().now()
    }
    fn dma_addr(&self, buf: &[u8]) -> u32 {
        self.bus_ref().dma_addr(buf)
    }
    /// A lock free handle to the interrupt mask register.
    fn irq_line(&self) -> <Self::Bus as RegisterBus>::IrqLine {
        self.bus_ref().irq_line(self.regs().offset(Reg::IrqMask))
    }
    /// Wait for `ms` milliseconds, honoring [Self::WAIT_POLICY].
    async fn wait_ms(&mut self, ms: u32) {
        match Self::WAIT_POLICY {
            WaitPolicy::BusyWait => self.bus().udelay(ms * 1000),
            WaitPolicy::Yield => self.bus().msleep(ms).await,
        }
    }
}

/// Transport for cards with mapped device memory.
pub struct Direct<B> {
    bus: B,
    regs: &'static RegTable,
}
impl<B: RegisterBus> Direct<B> {
    pub const fn new(bus: B, regs: &'static RegTable) -> Self {
        Self { bus, regs }
    }
}
impl<B: RegisterBus> Transport for Direct<B> {
    const KIND: TransportKind = TransportKind::DirectMmio;
    const WAIT_POLICY: WaitPolicy = WaitPolicy::Yield;
    type Bus = B;

    fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
    fn bus_ref(&self) -> &B {
        &self.bus
    }
    fn regs(&self) -> &'static RegTable {
        self.regs
    }
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) {
        self.bus.window_read(addr, buf)
    }
    fn mem_write(&mut self, addr: u32, data: &[u8]) {
        self.bus.window_write(addr, data)
    }
}

/// Transport for cards, whose device memory is only reachable through the slave memory
/// registers.
pub struct SlaveMem<B> {
    bus: B,
    regs: &'static RegTable,
}
impl<B: RegisterBus> SlaveMem<B> {
    /// Settle time after writing `SLV_MEM_ADDR`.
    const ADDR_SETTLE_US: u32 = 10;

    pub const fn new(bus: B, regs: &'static RegTable) -> Self {
        Self { bus, regs }
    }
    fn select(&mut self, addr: u32) {
        let offset = self.regs.offset(Reg::SlvMemAddr);
        self.bus.write32(offset, addr);
        self.bus.udelay(Self::ADDR_SETTLE_US);
    }
    fn read_word(&mut self, addr: u32) -> u32 {
        self.select(addr);
        let offset = self.regs.offset(Reg::SlvMemData);
        self.bus.read32(offset)
    }
    fn write_word(&mut self, addr: u32, value: u32) {
        self.select(addr);
        let offset = self.regs.offset(Reg::SlvMemData);
        self.bus.write32(offset, value);
    }
    fn basic_mode(&mut self) {
        let offset = self.regs.offset(Reg::SlvMemCtl);
        self.bus.write32(offset, SLV_MEM_CTL_BASIC);
    }
}
impl<B: RegisterBus> Transport for SlaveMem<B> {
    const KIND: TransportKind = TransportKind::SlaveMemory;
    const WAIT_POLICY: WaitPolicy = WaitPolicy::BusyWait;
    type Bus = B;

    fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
    fn bus_ref(&self) -> &B {
        &self.bus
    }
    fn regs(&self) -> &'static RegTable {
        self.regs
    }
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        self.basic_mode();
        let end = addr + buf.len() as u32;
        let mut word_addr = addr & !3;
        while word_addr < end {
            let word = self.read_word(word_addr).to_le_bytes();
            // Overlap of this word with the requested range.
            let from = addr.max(word_addr);
            let to = end.min(word_addr + 4);
            buf[(from - addr) as usize..(to - addr) as usize]
                .copy_from_slice(&word[(from - word_addr) as usize..(to - word_addr) as usize]);
            word_addr += 4;
        }
    }
    fn mem_write(&mut self, addr: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.basic_mode();
        let end = addr + data.len() as u32;
        let mut word_addr = addr & !3;
        while word_addr < end {
            let from = addr.max(word_addr);
            let to = end.min(word_addr + 4);
            let src = &data[(from - addr) as usize..(to - addr) as usize];
            // Partial words are merged with what's already there.
            let mut word = if to - from == 4 {
                [0u8; 4]
            } else {
                self.read_word(word_addr).to_le_bytes()
            };
            word[(from - word_addr) as usize..(to - word_addr) as usize].copy_from_slice(src);
            self.write_word(word_addr, u32::from_le_bytes(word));
            word_addr += 4;
        }
    }
}
