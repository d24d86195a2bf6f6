use std::fmt;

use crate::block::SIZE_CLASSES;

/// One free region as reported by [`crate::Halloc::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegionStats {
    /// Address of the region header.
    pub address: usize,
    /// Total region size in bytes, metadata included.
    pub size: usize,
}

/// Snapshot of one heap block.
#[derive(Debug, Clone)]
pub struct BlockStats {
    /// Start address of the block.
    pub address: usize,
    /// Pages acquired from the kernel.
    pub pages: usize,
    /// Total size in bytes.
    pub size: usize,
    /// Block header plus all allocated regions.
    pub used_size: usize,
    /// Free regions grouped by size class, each sorted by address.
    pub classes: [Vec<FreeRegionStats>; SIZE_CLASSES],
}

impl BlockStats {
    /// Number of free regions in the block.
    pub fn free_count(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }

    /// Total free bytes in the block.
    pub fn free_bytes(&self) -> usize {
        self.free_regions().map(|region| region.size).sum()
    }

    /// Size of the largest free region, 0 when the block is full.
    pub fn largest_free(&self) -> usize {
        self.free_regions().map(|region| region.size).max().unwrap_or(0)
    }

    /// Size of the smallest free region, 0 when the block is full.
    pub fn smallest_free(&self) -> usize {
        self.free_regions().map(|region| region.size).min().unwrap_or(0)
    }

    fn free_regions(&self) -> impl Iterator<Item = &FreeRegionStats> {
        self.classes.iter().flatten()
    }
}

/// Snapshot of the whole allocator, block by block.
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    pub blocks: Vec<BlockStats>,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, block) in self.blocks.iter().enumerate() {
            writeln!(f, "Block[{index}] (start address: {:#x}):", block.address)?;
            writeln!(f, "  pages (acquired from kernel) : {}", block.pages)?;
            writeln!(f, "  size                         : {} bytes", block.size)?;
            writeln!(f, "  used size                    : {} bytes", block.used_size)?;
            writeln!(f, "  free statistics:")?;
            writeln!(f, "    free region count : {}", block.free_count())?;
            writeln!(f, "    largest free size : {} bytes", block.largest_free())?;
            writeln!(f, "    smallest free size: {} bytes", block.smallest_free())?;
            writeln!(f, "    free heap space   : {} bytes", block.free_bytes())?;

            for (class, regions) in block.classes.iter().enumerate() {
                write!(f, "      class[{class}]:")?;
                for region in regions {
                    write!(f, " {:#x} ({} bytes)", region.address, region.size)?;
                }
                writeln!(f)?;
            }
        }

        Ok(())
    }
}
