use alloc::collections::BTreeMap;

use axerrno::AxResult;
use memory_addr::MemoryAddr;

use crate::addr::{GuestPhysAddr, HostVirtAddr};
use crate::hal::VcpuOps;
use crate::page_table::{ENTRY_COUNT, GuestPageTable32};

/// The set of guest pages currently used as page directory or page tables
/// under one guest `CR3`.
///
/// Shadow entries mapping any of these pages are kept read-only, so a guest
/// write to its own paging structures traps and drops the cache.
#[derive(Debug, Default)]
pub struct PteCache {
    cached_cr3: Option<GuestPhysAddr>,
    pages: BTreeMap<GuestPhysAddr, HostVirtAddr>,
}

impl PteCache {
    pub const fn new() -> Self {
        Self {
            cached_cr3: None,
            pages: BTreeMap::new(),
        }
    }

    /// The page directory base the cache was built for.
    pub fn cached_cr3(&self) -> Option<GuestPhysAddr> {
        self.cached_cr3
    }

    pub fn invalidate(&mut self) {
        if self.cached_cr3.take().is_some() {
            debug!("PTE cache invalidated");
        }
        self.pages.clear();
    }

    /// Whether the guest page containing `gpa` is a cached paging structure.
    pub fn contains(&self, gpa: GuestPhysAddr) -> bool {
        self.pages.contains_key(&gpa.align_down_4k())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Makes sure the cache describes the page directory at `pd_gpa`.
    ///
    /// Returns `true` if it already did. Otherwise the cache is rebuilt from
    /// the page directory and every present, non-large PDE's page table, and
    /// `false` is returned. Page tables that cannot be translated are skipped.
    pub fn cache_page_tables32<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &V,
        pd_gpa: GuestPhysAddr,
        pse: bool,
    ) -> AxResult<bool> {
        if self.cached_cr3 == Some(pd_gpa) {
            return Ok(true);
        }

        self.invalidate();

        let pd = GuestPageTable32::table_of(vcpu, pd_gpa)?;
        self.cached_cr3 = Some(pd_gpa);
        self.pages.insert(pd_gpa, pd.base());

        for idx in 0..ENTRY_COUNT {
            let pde = pd.entry(idx);
            if !pde.is_present() || pde.is_large(pse) {
                continue;
            }
            let pt_gpa = GuestPhysAddr::from_usize(pde.paddr());
            match vcpu.gpa_to_hva(pt_gpa) {
                Ok(hva) => {
                    self.pages.insert(pt_gpa, hva);
                }
                Err(_) => warn!("Skip caching untranslatable guest page table {:?}", pt_gpa),
            }
        }

        debug!(
            "PTE cache rebuilt for {:?}: {} pages",
            pd_gpa,
            self.pages.len()
        );
        Ok(false)
    }
}
