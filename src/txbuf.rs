//! TX buffer blocks in chip memory.
//!
//! On slave memory cards, the payload of a frame can't be DMAed from host memory. Instead it is
//! copied into a chain of fixed size blocks inside the chip memory pool. Free blocks form a
//! singly linked list, with the link word stored in the first four bytes of every block. A link
//! holds the address of the next block shifted right by five, or [TXBUF_END].
//!
//! Allocation walks as many links as blocks are requested. Releasing a chain is O(1), since the
//! tail of the chain is remembered.

use crate::transport::Transport;

/// Link word of the last block in a chain.
pub const TXBUF_END: u32 = 0x0200_0000;
/// Blocks are addressed in units of 32 bytes.
pub const BLOCK_ALIGN: u32 = 32;
const LINK_SHIFT: u32 = 5;
pub(crate) const LINK_SIZE: u32 = 4;

/// A chain of blocks handed out by the [BlockAllocator].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockChain {
    pub head: u32,
    pub tail: u32,
    pub blocks: usize,
}

const fn encode_link(next: Option<u32>) -> u32 {
    match next {
        Some(addr) => addr >> LINK_SHIFT,
        None => TXBUF_END,
    }
}
const fn decode_link(link: u32) -> Option<u32> {
    if link & TXBUF_END != 0 {
        None
    } else {
        Some(link << LINK_SHIFT)
    }
}

/// Free list allocator for the chip memory TX pool.
#[derive(Debug)]
pub struct BlockAllocator {
    start: u32,
    block_size: u32,
    block_count: usize,
    free_head: Option<u32>,
    free_blocks: usize,
}
impl BlockAllocator {
    /// Carve `[start, end)` into blocks of `block_size` bytes and link them all up.
    pub fn new<T: Transport>(transport: &mut T, start: u32, end: u32, block_size: u32) -> Self {
        assert!(block_size % BLOCK_ALIGN == 0 && block_size > LINK_SIZE);
        let start = start.next_multiple_of(BLOCK_ALIGN);
        let block_count = (end.saturating_sub(start) / block_size) as usize;
        let mut allocator = Self {
            start,
            block_size,
            block_count,
            free_head: None,
            free_blocks: 0,
        };
        allocator.relink_all(transport);
        allocator
    }
    /// Forget all handed out chains and put every block back on the free list.
    pub fn relink_all<T: Transport>(&mut self, transport: &mut T) {
        for i in 0..self.block_count {
            let next = (i + 1 < self.block_count).then(|| self.block_addr(i + 1));
            transport.mem_write32(self.block_addr(i), encode_link(next));
        }
        self.free_head = (self.block_count != 0).then_some(self.start);
        self.free_blocks = self.block_count;
        debug!(
            "TX block pool: {} blocks of {} bytes at {:x}.",
            self.block_count, self.block_size, self.start
        );
    }
    const fn block_addr(&self, index: usize) -> u32 {
        self.start + index as u32 * self.block_size
    }
    /// Payload bytes a single block can carry.
    pub const fn payload_per_block(&self) -> usize {
        (self.block_size - LINK_SIZE) as usize
    }
    /// The number of blocks needed for `len` bytes of payload.
    pub const fn blocks_for(&self, len: usize) -> usize {
        let per_block = self.payload_per_block();
        if len == 0 {
            1
        } else {
            len.div_ceil(per_block)
        }
    }
    pub const fn free_blocks(&self) -> usize {
        self.free_blocks
    }
    pub const fn total_blocks(&self) -> usize {
        self.block_count
    }
    pub const fn free_head(&self) -> Option<u32> {
        self.free_head
    }
    fn read_link<T: Transport>(transport: &mut T, block: u32) -> Option<u32> {
        decode_link(transport.mem_read32(block))
    }

    /// Take `count` blocks off the free list.
    ///
    /// Returns `None` without touching the free list, if not enough blocks are free.
    pub fn allocate<T: Transport>(
        &mut self,
        transport: &mut T,
        count: usize,
    ) -> Option<BlockChain> {
        if count == 0 || count > self.free_blocks {
            trace!(
                "Can't allocate {} TX blocks, {} are free.",
                count,
                self.free_blocks
            );
            return None;
        }
        let head = self.free_head?;
        let mut tail = head;
        for _ in 1..count {
            tail = Self::read_link(transport, tail)?;
        }
        self.free_head = Self::read_link(transport, tail);
        transport.mem_write32(tail, TXBUF_END);
        self.free_blocks -= count;
        Some(BlockChain {
            head,
            tail,
            blocks: count,
        })
    }
    /// Put a chain back on the free list.
    pub fn release<T: Transport>(&mut self, transport: &mut T, chain: BlockChain) {
        transport.mem_write32(chain.tail, encode_link(self.free_head));
        self.free_head = Some(chain.head);
        self.free_blocks += chain.blocks;
    }
    /// Copy `data` into the payload area of the chain.
    pub fn fill<T: Transport>(&self, transport: &mut T, chain: &BlockChain, data: &[u8]) {
        let mut block = Some(chain.head);
        for chunk in data.chunks(self.payload_per_block()) {
            let Some(addr) = block else {
                break;
            };
            transport.mem_write(addr + LINK_SIZE, chunk);
            block = Self::read_link(transport, addr);
        }
    }
    /// Read `buf.len()` bytes back out of the chain.
    pub fn read<T: Transport>(&self, transport: &mut T, chain: &BlockChain, buf: &mut [u8]) {
        let mut block = Some(chain.head);
        for chunk in buf.chunks_mut(self.payload_per_block()) {
            let Some(addr) = block else {
                break;
            };
            transport.mem_read(addr + LINK_SIZE, chunk);
            block = Self::read_link(transport, addr);
        }
    }
    /// Collect the addresses of all free blocks by walking the list.
    #[cfg(test)]
    pub fn free_set<T: Transport>(&self, transport: &mut T) -> std::collections::BTreeSet<u32> {
        let mut set = std::collections::BTreeSet::new();
        let mut block = self.free_head;
        while let Some(addr) = block {
            assert!(set.insert(addr), "Free list contains a cycle.");
            block = Self::read_link(transport, addr);
        }
        set
    }
}
