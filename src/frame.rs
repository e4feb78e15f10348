use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};

use crate::addr::HostPhysAddr;
use crate::hal::ShadowPagingHal;
use crate::page_table::{ENTRY_COUNT, Entry32};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: ShadowPagingHal> {
    start_paddr: Option<HostPhysAddr>,
    _marker: PhantomData<H>,
}

impl<H: ShadowPagingHal> PhysFrame<H> {
    pub fn alloc() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr: Some(start_paddr),
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero() -> AxResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr.expect("uninitialized PhysFrame")
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }

    /// Reads the `idx`-th 32-bit paging entry stored in this frame.
    pub fn entry(&self, idx: usize) -> Entry32 {
        assert!(idx < ENTRY_COUNT);
        unsafe { (self.as_mut_ptr() as *const Entry32).add(idx).read_volatile() }
    }

    /// Writes the `idx`-th 32-bit paging entry stored in this frame.
    pub fn set_entry(&mut self, idx: usize, entry: Entry32) {
        assert!(idx < ENTRY_COUNT);
        unsafe { (self.as_mut_ptr() as *mut Entry32).add(idx).write_volatile(entry) }
    }
}

impl<H: ShadowPagingHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        if let Some(start_paddr) = self.start_paddr {
            H::dealloc_frame(start_paddr);
            debug!("freed shadow frame {:#x}", start_paddr);
        }
    }
}
