use alloc::collections::BTreeMap;

use axerrno::{AxResult, ax_err};

use crate::addr::HostPhysAddr;
use crate::frame::PhysFrame;
use crate::hal::ShadowPagingHal;
use crate::page_table::Entry32;

/// Frames referenced by 32-bit entries must be addressable with 32 bits.
const MAX_FRAME_PADDR: usize = 1 << 32;

fn check_below_4g(paddr: HostPhysAddr) -> AxResult {
    if paddr.as_usize() + crate::frame::PAGE_SIZE > MAX_FRAME_PADDR {
        return ax_err!(Unsupported, "shadow table frame above 4GiB");
    }
    Ok(())
}

/// A 32-bit two-level page table built by the monitor and walked by hardware.
///
/// The root directory and every second-level table are owned here, the
/// latter in an arena keyed by their physical address. All frames are freed
/// when the tree is dropped.
pub struct ShadowPageTable32<H: ShadowPagingHal> {
    root: PhysFrame<H>,
    tables: BTreeMap<HostPhysAddr, PhysFrame<H>>,
}

impl<H: ShadowPagingHal> ShadowPageTable32<H> {
    /// Allocates an empty page directory.
    pub fn try_new() -> AxResult<Self> {
        let root = PhysFrame::alloc_zero()?;
        check_below_4g(root.start_paddr())?;
        Ok(Self {
            root,
            tables: BTreeMap::new(),
        })
    }

    /// Physical address of the page directory, to be loaded into `CR3`.
    pub fn root_paddr(&self) -> HostPhysAddr {
        self.root.start_paddr()
    }

    pub fn pde(&self, idx: usize) -> Entry32 {
        self.root.entry(idx)
    }

    pub fn set_pde(&mut self, idx: usize, entry: Entry32) {
        self.root.set_entry(idx, entry)
    }

    /// Allocates a zeroed page table and returns its physical address.
    pub fn alloc_table(&mut self) -> AxResult<HostPhysAddr> {
        let frame = PhysFrame::alloc_zero()?;
        let paddr = frame.start_paddr();
        check_below_4g(paddr)?;
        self.tables.insert(paddr, frame);
        Ok(paddr)
    }

    /// Frees the page table at `paddr`, if it belongs to this tree.
    pub fn release_table(&mut self, paddr: HostPhysAddr) {
        if self.tables.remove(&paddr).is_none() {
            warn!("release of unknown shadow table {:#x}", paddr);
        }
    }

    fn table(&self, paddr: HostPhysAddr) -> AxResult<&PhysFrame<H>> {
        self.tables
            .get(&paddr)
            .map_or_else(|| ax_err!(NotFound, "shadow table not in arena"), Ok)
    }

    /// Reads the PTE at `idx` in the table a present shadow PDE points to.
    pub fn pte(&self, pde: Entry32, idx: usize) -> AxResult<Entry32> {
        Ok(self.table(HostPhysAddr::from_usize(pde.paddr()))?.entry(idx))
    }

    pub fn set_pte(&mut self, pde: Entry32, idx: usize, entry: Entry32) -> AxResult {
        let paddr = HostPhysAddr::from_usize(pde.paddr());
        match self.tables.get_mut(&paddr) {
            Some(frame) => {
                frame.set_entry(idx, entry);
                Ok(())
            }
            None => ax_err!(NotFound, "shadow table not in arena"),
        }
    }

    /// Number of second-level tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
