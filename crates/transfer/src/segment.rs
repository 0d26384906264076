/// One block's byte range within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

impl BlockRange {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Maps a file size and block size to block boundaries.
///
/// Pure arithmetic: every block is `block_size` long except the last,
/// which holds the remainder. An empty file has no blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    total_size: u64,
    block_size: u64,
}

impl BlockLayout {
    /// `block_size` of 0 is treated as 1.
    pub fn new(total_size: u64, block_size: u64) -> Self {
        debug_assert!(block_size > 0, "block_size must be positive");
        Self {
            total_size,
            block_size: block_size.max(1),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_size.div_ceil(self.block_size)
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Returns the range of block `index`, or `None` past the end.
    pub fn block(&self, index: u64) -> Option<BlockRange> {
        if index >= self.total_blocks() {
            return None;
        }
        let offset = index * self.block_size;
        let len = self.block_size.min(self.total_size - offset);
        Some(BlockRange { index, offset, len })
    }

    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.total_blocks()
    }

    /// Iterates all blocks in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockRange> + '_ {
        (0..self.total_blocks()).filter_map(|i| self.block(i))
    }
}
