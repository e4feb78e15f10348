//! 32-bit two-level paging structures, and a walker over the guest's tables.
use core::fmt;

use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use bitflags::bitflags;
use page_table_entry::MappingFlags;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::addr::{GuestPhysAddr, GuestVirtAddr, HostVirtAddr};
use crate::hal::VcpuOps;

/// Number of entries in a 32-bit page directory or page table.
pub const ENTRY_COUNT: usize = 1024;

/// Index into the page directory for `vaddr`.
pub fn pde32_index(vaddr: usize) -> usize {
    vaddr.get_bits(22..32)
}

/// Index into the page table for `vaddr`.
pub fn pte32_index(vaddr: usize) -> usize {
    vaddr.get_bits(12..22)
}

bitflags! {
    /// Flag bits of a 32-bit PDE/PTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PTF32: u32 {
        const PRESENT =         1 << 0;
        const WRITABLE =        1 << 1;
        const USER =            1 << 2;
        const WRITE_THROUGH =   1 << 3;
        const NO_CACHE =        1 << 4;
        const ACCESSED =        1 << 5;
        const DIRTY =           1 << 6;
        /// Page size in a PDE, PAT in a PTE.
        const HUGE_PAGE =       1 << 7;
        const GLOBAL =          1 << 8;
        /// Software-available bit: the shadow entry maps a page the guest
        /// uses as a page table, and is kept read-only for that reason.
        const GUEST_PT =        1 << 9;
    }
}

/// Result of checking one paging entry against the access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Ok,
    NotPresent,
    WriteError,
    UserError,
}

/// A 32-bit page directory or page table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry32(u32);

impl Entry32 {
    /// Address bits of a 4K entry, also the page directory base in `CR3`.
    pub const PHYS_ADDR_MASK: u32 = 0xffff_f000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Builds an entry from a page base address and flags. The low 12 bits of
    /// `paddr` are dropped.
    pub fn new(paddr: usize, flags: PTF32) -> Self {
        Self((paddr as u32 & Self::PHYS_ADDR_MASK) | flags.bits())
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> PTF32 {
        PTF32::from_bits_truncate(self.0)
    }

    /// Sets or clears `flags`. All other bits, including the ones available
    /// to the guest OS, are left untouched.
    pub fn set_flags(&mut self, flags: PTF32, value: bool) {
        if value {
            self.0 |= flags.bits();
        } else {
            self.0 &= !flags.bits();
        }
    }

    /// Base address of the 4K page (or page table) this entry points to.
    pub fn paddr(self) -> usize {
        (self.0.get_bits(12..32) as usize) << 12
    }

    /// Base address of the 4M page a large PDE maps.
    pub fn large_paddr(self) -> usize {
        (self.0.get_bits(22..32) as usize) << 22
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PTF32::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PTF32::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PTF32::USER)
    }

    pub fn is_accessed(self) -> bool {
        self.flags().contains(PTF32::ACCESSED)
    }

    pub fn is_dirty(self) -> bool {
        self.flags().contains(PTF32::DIRTY)
    }

    pub fn is_guest_pt(self) -> bool {
        self.flags().contains(PTF32::GUEST_PT)
    }

    /// Whether this PDE maps a 4M page. The page-size bit only counts when
    /// `CR4.PSE` is set.
    pub fn is_large(self, pse: bool) -> bool {
        pse && self.flags().contains(PTF32::HUGE_PAGE)
    }

    pub fn mapping_flags(self) -> MappingFlags {
        let f = self.flags();
        let mut ret = MappingFlags::empty();
        if !f.contains(PTF32::PRESENT) {
            return ret;
        }
        ret |= MappingFlags::READ | MappingFlags::EXECUTE;
        if f.contains(PTF32::WRITABLE) {
            ret |= MappingFlags::WRITE;
        }
        if f.contains(PTF32::USER) {
            ret |= MappingFlags::USER;
        }
        if f.contains(PTF32::NO_CACHE) {
            ret |= MappingFlags::UNCACHED;
        }
        ret
    }

    /// Checks whether the access described by `error_code` is permitted by
    /// this entry alone. `wp` is `CR0.WP` of the paging context the entry
    /// belongs to.
    pub fn access_status(self, error_code: PageFaultErrorCode, wp: bool) -> AccessStatus {
        let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
        let is_user = error_code.contains(PageFaultErrorCode::USER_MODE);

        if !self.is_present() {
            AccessStatus::NotPresent
        } else if is_write && !self.is_writable() && (is_user || wp) {
            AccessStatus::WriteError
        } else if is_user && !self.is_user() {
            AccessStatus::UserError
        } else {
            AccessStatus::Ok
        }
    }
}

impl fmt::Debug for Entry32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry32")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or page table of the guest, accessed in place through its
/// host virtual address.
///
/// Entries are read and written with volatile accesses, since the guest may
/// modify the same memory concurrently from another vCPU.
#[derive(Debug, Clone, Copy)]
pub struct GuestTable32 {
    base: HostVirtAddr,
}

impl GuestTable32 {
    /// `base` must be the host mapping of a guest page that stays mapped for
    /// as long as the returned value is used.
    pub(crate) fn from_hva(base: HostVirtAddr) -> Self {
        Self { base }
    }

    pub fn base(&self) -> HostVirtAddr {
        self.base
    }

    pub fn entry(&self, idx: usize) -> Entry32 {
        assert!(idx < ENTRY_COUNT);
        unsafe { (self.base.as_ptr() as *const Entry32).add(idx).read_volatile() }
    }

    pub fn set_entry(&self, idx: usize, entry: Entry32) {
        assert!(idx < ENTRY_COUNT);
        unsafe { (self.base.as_mut_ptr() as *mut Entry32).add(idx).write_volatile(entry) }
    }

    /// Read-modify-write of one entry.
    pub fn update(&self, idx: usize, f: impl FnOnce(&mut Entry32)) -> Entry32 {
        let mut entry = self.entry(idx);
        f(&mut entry);
        self.set_entry(idx, entry);
        entry
    }
}

/// Page sizes of 32-bit paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PageSize32 {
    Size4K = 0x1000,
    Size4M = 0x40_0000,
}

impl PageSize32 {
    pub const fn align_offset(self, addr: usize) -> usize {
        addr & (self as usize - 1)
    }
}

/// Read-only view of the guest's 32-bit page tables rooted at a guest `CR3`.
pub struct GuestPageTable32 {
    root_paddr: GuestPhysAddr,
    pse: bool,
}

impl GuestPageTable32 {
    /// `pse` is the guest's `CR4.PSE`.
    pub fn construct(cr3: usize, pse: bool) -> Self {
        Self {
            root_paddr: GuestPhysAddr::from_usize(cr3 & Entry32::PHYS_ADDR_MASK as usize),
            pse,
        }
    }

    /// Get the root page table physical address.
    pub fn root_paddr(&self) -> GuestPhysAddr {
        self.root_paddr
    }

    /// Queries the result of the mapping starts with `vaddr`.
    ///
    /// Returns the physical address of the target frame, mapping flags, and
    /// the page size.
    pub fn query<V: VcpuOps + ?Sized>(
        &self,
        vcpu: &V,
        vaddr: GuestVirtAddr,
    ) -> AxResult<(GuestPhysAddr, MappingFlags, PageSize32)> {
        let (entry, size) = self.get_entry(vcpu, vaddr)?;
        if !entry.is_present() {
            return ax_err!(NotFound, "GuestPT32 query: entry not present");
        }
        let base = match size {
            PageSize32::Size4K => entry.paddr(),
            PageSize32::Size4M => entry.large_paddr(),
        };
        let off = size.align_offset(vaddr.as_usize());
        Ok((GuestPhysAddr::from_usize(base + off), entry.mapping_flags(), size))
    }

    pub(crate) fn table_of<V: VcpuOps + ?Sized>(
        vcpu: &V,
        gpa: GuestPhysAddr,
    ) -> AxResult<GuestTable32> {
        let hva = vcpu.gpa_to_hva(gpa).inspect_err(|_| {
            warn!("Failed to translate guest page table {:?}", gpa);
        })?;
        Ok(GuestTable32::from_hva(hva))
    }

    fn next_table<V: VcpuOps + ?Sized>(&self, vcpu: &V, entry: Entry32) -> AxResult<GuestTable32> {
        if !entry.is_present() {
            ax_err!(NotFound, "GuestPT32 next_table: entry not present")
        } else {
            Self::table_of(vcpu, GuestPhysAddr::from_usize(entry.paddr()))
        }
    }

    fn get_entry<V: VcpuOps + ?Sized>(
        &self,
        vcpu: &V,
        gva: GuestVirtAddr,
    ) -> AxResult<(Entry32, PageSize32)> {
        let vaddr = gva.as_usize();

        let pd = Self::table_of(vcpu, self.root_paddr)?;
        let pde = pd.entry(pde32_index(vaddr));
        if pde.is_present() && pde.is_large(self.pse) {
            return Ok((pde, PageSize32::Size4M));
        }

        let pt = self.next_table(vcpu, pde)?;
        Ok((pt.entry(pte32_index(vaddr)), PageSize32::Size4K))
    }
}
