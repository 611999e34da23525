//! Descriptor rings.
//!
//! Both rings are circular arrays of [DESC_SIZE] byte descriptors in device memory, linked up
//! through their `next` fields. The host keeps its own bookkeeping next to them: the frame, that
//! is in flight in a TX slot, the chip memory blocks backing it and, on direct transports, the
//! RX buffers.
//!
//! ## Ownership
//! Every slot cycles through `HostEmpty -> DeviceBusy -> DeviceDone -> HostEmpty`. The host only
//! writes a slot while it owns it and hands it over by writing the control byte last. The device
//! hands it back by setting `ACX_DONE`.
//!
//! ## Free count
//! One TX slot is always kept as headroom, so that a full ring can't be confused with an empty
//! one. The free count therefore starts at `len - 1` and is always one less than the number of
//! `HostEmpty` slots, while no hand-off is in progress.

use alloc::{vec, vec::Vec};

use crate::{
    desc::{DescCtl, RxDesc, RxStatus, SlotState, TxDesc, DESC_SIZE, RX_CTL_OFFSET, TX_CTL_OFFSET},
    frame::{header_len, RxFrame, RxMeta, TxFrame, TxStatus},
    regs::{int_trig, ChipKind, Reg},
    transport::Transport,
    txbuf::{BlockAllocator, BlockChain},
};

/// Why a frame couldn't be put on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxRefusal {
    /// The slot at the head isn't free.
    RingFull,
    /// Not enough chip memory blocks for the payload.
    BufferExhausted,
    /// The frame doesn't fit into a descriptor or the whole block pool. It never will.
    TooLong,
}

#[derive(Default)]
struct TxSlot {
    frame: Option<TxFrame>,
    chain: Option<BlockChain>,
}

fn ring_next(base: u32, index: usize, len: usize) -> u32 {
    base + ((index + 1) % len) as u32 * DESC_SIZE
}

/// A TX descriptor ring.
pub struct TxRing {
    chip: ChipKind,
    base: u32,
    head: usize,
    tail: usize,
    free: usize,
    slots: Vec<TxSlot>,
}
impl TxRing {
    /// Lay out a ring of `len` descriptors at `base` in device memory.
    pub fn new<T: Transport>(transport: &mut T, chip: ChipKind, base: u32, len: usize) -> Self {
        assert!(len >= 2, "A TX ring needs at least two slots.");
        let ring = Self {
            chip,
            base,
            head: 0,
            tail: 0,
            free: len - 1,
            slots: (0..len).map(|_| TxSlot::default()).collect(),
        };
        for index in 0..len {
            ring.write_empty(transport, index);
        }
        debug!("TX ring with {} slots at {:x}.", len, base);
        ring
    }
    /// The number of bytes a ring of `len` descriptors occupies.
    pub const fn size_bytes(len: usize) -> u32 {
        len as u32 * DESC_SIZE
    }
    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
    pub const fn free(&self) -> usize {
        self.free
    }
    pub const fn head(&self) -> usize {
        self.head
    }
    pub const fn tail(&self) -> usize {
        self.tail
    }
    pub const fn base(&self) -> u32 {
        self.base
    }
    /// The device address of a slot.
    pub const fn desc_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * DESC_SIZE
    }
    /// Frames, that were handed to the device and not yet reclaimed.
    pub fn outstanding(&self) -> usize {
        self.len() - 1 - self.free
    }
    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.len()
    }
    fn empty_desc(&self, index: usize) -> TxDesc {
        TxDesc {
            next: ring_next(self.base, index, self.len()),
            ctl: DescCtl::TX_HOST_EMPTY,
            ..Default::default()
        }
    }
    fn write_empty<T: Transport>(&self, transport: &mut T, index: usize) {
        let desc = self.empty_desc(index);
        transport.mem_write(self.desc_addr(index), &desc.encode(self.chip));
    }
    fn read_desc<T: Transport>(&self, transport: &mut T, index: usize) -> TxDesc {
        let mut raw = [0u8; DESC_SIZE as usize];
        transport.mem_read(self.desc_addr(index), &mut raw);
        TxDesc::decode(self.chip, &raw)
    }
    /// Read the ownership state of a slot from the device.
    pub fn slot_state<T: Transport>(&self, transport: &mut T, index: usize) -> SlotState {
        let mut ctl = [0u8];
        transport.mem_read(self.desc_addr(index) + TX_CTL_OFFSET, &mut ctl);
        DescCtl::from_bits(ctl[0]).state()
    }

    /// Claim the slot at the head.
    ///
    /// Returns `None`, if the headroom is reached or the device still owns the slot.
    pub fn alloc_slot<T: Transport>(&mut self, transport: &mut T) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let index = self.head;
        let state = self.slot_state(transport, index);
        if !state.host_owned() {
            trace!("TX slot {} isn't free: {:?}", index, state);
            return None;
        }
        self.head = self.advance(index);
        self.free -= 1;
        Some(index)
    }
    /// Give back the slot, that was claimed last, without handing it to the device.
    pub fn rollback<T: Transport>(&mut self, transport: &mut T, index: usize) {
        debug_assert_eq!(self.advance(index), self.head);
        self.head = index;
        self.free += 1;
        self.write_empty(transport, index);
    }

    /// Put a frame on the ring and hand it to the device.
    ///
    /// With a block pool, the frame is copied into chip memory. Otherwise the device DMAs header
    /// and payload straight out of the frame buffer, which is kept alive in the slot until the
    /// device is done with it.
    pub fn enqueue<T: Transport>(
        &mut self,
        transport: &mut T,
        pool: Option<&mut BlockAllocator>,
        queue_ctrl: u8,
        frame: TxFrame,
    ) -> Result<usize, (TxFrame, TxRefusal)> {
        let Ok(total_len) = u16::try_from(frame.data.len()) else {
            return Err((frame, TxRefusal::TooLong));
        };
        if pool
            .as_deref()
            .is_some_and(|pool| pool.blocks_for(frame.data.len()) > pool.total_blocks())
        {
            return Err((frame, TxRefusal::TooLong));
        }
        let Some(index) = self.alloc_slot(transport) else {
            return Err((frame, TxRefusal::RingFull));
        };
        let mut desc = self.empty_desc(index);
        desc.rate = frame.rate;
        desc.queue_ctrl = queue_ctrl;
        desc.total_len = total_len;

        let mut ctl = DescCtl::new().with_first_frag(true);
        let chain = match pool {
            Some(pool) => {
                let blocks = pool.blocks_for(frame.data.len());
                let Some(chain) = pool.allocate(transport, blocks) else {
                    self.rollback(transport, index);
                    return Err((frame, TxRefusal::BufferExhausted));
                };
                pool.fill(transport, &chain, &frame.data);
                desc.buffer = chain.head;
                desc.payload_len = total_len;
                Some(chain)
            }
            None => {
                let (header, payload) = frame.data.split_at(header_len(&frame.data));
                desc.buffer = transport.dma_addr(header);
                desc.payload = transport.dma_addr(payload);
                desc.payload_len = total_len - header.len() as u16;
                ctl = ctl.with_auto_dma(true).with_reclaim(true);
                None
            }
        };

        // Everything but the control byte goes first, so the device never sees a half written
        // descriptor.
        transport.mem_write(self.desc_addr(index), &desc.encode(self.chip));
        self.slots[index] = TxSlot {
            frame: Some(frame),
            chain,
        };
        transport.mem_write(self.desc_addr(index) + TX_CTL_OFFSET, &[ctl.into_bits()]);
        transport.flush();
        transport.write16(Reg::IntTrig, int_trig::TXPRC);
        trace!("TX slot {} handed to device, {} free.", index, self.free);
        Ok(index)
    }

    /// Reclaim completed slots in ring order.
    ///
    /// Stops at the first slot, the device isn't done with. Returns the number of reclaimed
    /// slots.
    pub fn clean<T: Transport>(
        &mut self,
        transport: &mut T,
        mut pool: Option<&mut BlockAllocator>,
        mut report: impl FnMut(TxFrame, TxStatus),
    ) -> usize {
        let mut reclaimed = 0;
        while self.outstanding() != 0 {
            let index = self.tail;
            if self.slot_state(transport, index) != SlotState::DeviceDone {
                break;
            }
            let mut desc = self.read_desc(transport, index);
            let status = TxStatus::from_desc(&desc);
            let slot = core::mem::take(&mut self.slots[index]);
            if let (Some(chain), Some(pool)) = (slot.chain, pool.as_deref_mut()) {
                pool.release(transport, chain);
            }
            desc.reset_status();
            transport.mem_write(self.desc_addr(index), &desc.encode(self.chip));
            self.tail = self.advance(index);
            self.free += 1;
            reclaimed += 1;
            trace!(
                "TX slot {} reclaimed, error: {:x}",
                index,
                status.error.into_bits()
            );
            if let Some(frame) = slot.frame {
                report(frame, status);
            }
        }
        reclaimed
    }

    /// Force every slot back to the host, no matter what the device thinks.
    ///
    /// Frames still on the ring are passed to `dropped`. Chip memory blocks are forgotten, so the
    /// caller has to relink the block pool afterwards.
    pub fn emergency_reset<T: Transport>(
        &mut self,
        transport: &mut T,
        mut dropped: impl FnMut(TxFrame),
    ) -> usize {
        let mut count = 0;
        // Walk from the tail, so drops are reported in ring order.
        for offset in 0..self.len() {
            let index = (self.tail + offset) % self.len();
            let slot = core::mem::take(&mut self.slots[index]);
            self.write_empty(transport, index);
            if let Some(frame) = slot.frame {
                count += 1;
                dropped(frame);
            }
        }
        self.head = 0;
        self.tail = 0;
        self.free = self.len() - 1;
        count
    }
}

/// An RX descriptor ring.
pub struct RxRing {
    chip: ChipKind,
    base: u32,
    len: usize,
    tail: usize,
    buf_size: usize,
    /// Host RX buffers. Empty, if the frames stay in chip memory.
    buffers: Vec<Vec<u8>>,
}
impl RxRing {
    /// Lay out a ring of `len` descriptors at `base`.
    ///
    /// With `host_buffers`, every slot gets a host buffer of `buf_size` bytes, that the device
    /// DMAs into. Otherwise the firmware places frames in chip memory itself.
    pub fn new<T: Transport>(
        transport: &mut T,
        chip: ChipKind,
        base: u32,
        len: usize,
        buf_size: usize,
        host_buffers: bool,
    ) -> Self {
        assert!(len >= 1);
        let buffers = if host_buffers {
            (0..len).map(|_| vec![0u8; buf_size]).collect()
        } else {
            Vec::new()
        };
        let ring = Self {
            chip,
            base,
            len,
            tail: 0,
            buf_size,
            buffers,
        };
        for index in 0..len {
            let desc = ring.ready_desc(transport, index);
            transport.mem_write(ring.desc_addr(index), &desc.encode(chip));
        }
        debug!("RX ring with {} slots at {:x}.", len, base);
        ring
    }
    pub const fn size_bytes(len: usize) -> u32 {
        len as u32 * DESC_SIZE
    }
    pub const fn len(&self) -> usize {
        self.len
    }
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub const fn tail(&self) -> usize {
        self.tail
    }
    pub const fn base(&self) -> u32 {
        self.base
    }
    pub const fn desc_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * DESC_SIZE
    }
    fn ready_desc<T: Transport>(&self, transport: &T, index: usize) -> RxDesc {
        RxDesc {
            next: ring_next(self.base, index, self.len),
            buffer: self
                .buffers
                .get(index)
                .map(|buf| transport.dma_addr(buf))
                .unwrap_or_default(),
            ctl: DescCtl::RX_READY,
            ..Default::default()
        }
    }
    #[cfg(test)]
    pub fn host_buffer_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.buffers[index]
    }
    /// Drain completed slots in ring order.
    ///
    /// The returned iterator is lazy. Dropping it early leaves the remaining frames on the ring
    /// for the next pass.
    pub fn drain<'a, T: Transport>(&'a mut self, transport: &'a mut T) -> RxDrain<'a, T> {
        RxDrain {
            ring: self,
            transport,
            scanned: 0,
        }
    }
}

/// Lazy iterator over received frames. Created by [RxRing::drain].
pub struct RxDrain<'a, T: Transport> {
    ring: &'a mut RxRing,
    transport: &'a mut T,
    scanned: usize,
}
impl<T: Transport> RxDrain<'_, T> {
    fn take_frame(&mut self, index: usize, desc: &RxDesc) -> Option<RxFrame> {
        if !desc.status.full() || desc.len == 0 {
            trace!("RX slot {} is reclaim only.", index);
            return None;
        }
        let len = (desc.len as usize).min(self.ring.buf_size);
        let data = match self.ring.buffers.get(index) {
            Some(buffer) => buffer[..len].to_vec(),
            None => {
                let mut data = vec![0u8; len];
                self.transport.mem_read(desc.buffer, &mut data);
                data
            }
        };
        Some(RxFrame {
            data,
            meta: RxMeta::from_desc(self.ring.chip, desc),
        })
    }
}
impl<T: Transport> Iterator for RxDrain<'_, T> {
    type Item = RxFrame;

    fn next(&mut self) -> Option<RxFrame> {
        while self.scanned < self.ring.len {
            let index = self.ring.tail;
            let addr = self.ring.desc_addr(index);
            // On slave memory cards this is a single indirect word access, so peek at the
            // control byte before pulling in the whole descriptor.
            let mut ctl = [0u8];
            self.transport.mem_read(addr + RX_CTL_OFFSET, &mut ctl);
            if !DescCtl::from_bits(ctl[0]).acx_done() {
                return None;
            }
            self.scanned += 1;

            let mut raw = [0u8; DESC_SIZE as usize];
            self.transport.mem_read(addr, &mut raw);
            let mut desc = RxDesc::decode(self.ring.chip, &raw);
            let frame = self.take_frame(index, &desc);

            desc.ctl = DescCtl::RX_READY;
            desc.status = RxStatus::new();
            desc.len = 0;
            self.transport.mem_write(addr, &desc.encode(self.ring.chip));
            self.ring.tail = (index + 1) % self.ring.len;

            if frame.is_some() {
                return frame;
            }
        }
        None
    }
}
