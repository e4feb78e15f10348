//! Per-vCPU shadow paging state.
//!
//! While the guest runs with paging disabled, hardware walks a persistent
//! passthrough directory mapping guest physical addresses to host physical
//! ones. Once the guest enables paging, hardware walks a shadow tree derived
//! lazily, fault by fault, from the guest's own 32-bit page tables.

mod cache;
mod fault;
mod table;

use axerrno::{AxResult, ax_err};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::addr::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};
use crate::decoder::CtrlInstruction;
use crate::hal::{ShadowPagingHal, VcpuOps};
use crate::page_table::{Entry32, GuestPageTable32, PTF32, pde32_index, pte32_index};

pub use cache::PteCache;
pub use fault::is_guest_pf;
pub use table::ShadowPageTable32;

/// Which page table hardware currently walks on behalf of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMode {
    /// Guest paging is off; the passthrough map is active.
    Physical,
    /// Guest paging is on; the shadow tree is active.
    Virtual,
}

/// Shadow paging state of one virtual CPU.
pub struct ShadowPaging<H: ShadowPagingHal> {
    pub(crate) guest_cr0: Cr0Flags,
    pub(crate) guest_cr3: usize,
    pub(crate) guest_cr4: Cr4Flags,
    pub(crate) guest_efer: EferFlags,

    pub(crate) shadow_cr0: Cr0Flags,
    pub(crate) shadow_cr3: HostPhysAddr,
    pub(crate) shadow_cr4: Cr4Flags,
    pub(crate) shadow_efer: EferFlags,

    mem_mode: MemMode,
    shadow_pt: Option<ShadowPageTable32<H>>,
    direct_map: ShadowPageTable32<H>,
    pte_cache: PteCache,
}

impl<H: ShadowPagingHal> ShadowPaging<H> {
    /// PWT and PCD of a 32-bit `CR3`.
    const CR3_CACHE_BITS: usize = 0x18;

    /// Creates the state of a vCPU that just came out of reset, with paging
    /// disabled and the passthrough map active.
    pub fn new() -> AxResult<Self> {
        let guest_cr0 =
            Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE;
        let direct_map = ShadowPageTable32::try_new()?;
        Ok(Self {
            guest_cr0,
            guest_cr3: 0,
            guest_cr4: Cr4Flags::empty(),
            guest_efer: EferFlags::empty(),
            shadow_cr0: Self::shadow_cr0_of(guest_cr0),
            shadow_cr3: direct_map.root_paddr(),
            shadow_cr4: Cr4Flags::empty(),
            shadow_efer: EferFlags::empty(),
            mem_mode: MemMode::Physical,
            shadow_pt: None,
            direct_map,
            pte_cache: PteCache::new(),
        })
    }

    /// The `CR0` value hardware runs with for a given guest `CR0`.
    pub(crate) fn shadow_cr0_of(guest_cr0: Cr0Flags) -> Cr0Flags {
        let mut cr0 = guest_cr0 - (Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE);
        if !guest_cr0.contains(Cr0Flags::PAGING) {
            cr0 |= Cr0Flags::WRITE_PROTECT;
        }
        cr0 | Cr0Flags::PAGING
    }

    /// The `CR4` value hardware runs with for a given guest `CR4`.
    pub(crate) fn shadow_cr4_of(&self, guest_cr4: Cr4Flags) -> Cr4Flags {
        let mut cr4 = guest_cr4 - (Cr4Flags::PAGE_SIZE_EXTENSION | Cr4Flags::PAGE_GLOBAL);
        if !self.guest_efer.contains(EferFlags::LONG_MODE_ACTIVE) {
            cr4 -= Cr4Flags::PHYSICAL_ADDRESS_EXTENSION;
        }
        cr4
    }

    pub fn guest_cr0(&self) -> Cr0Flags {
        self.guest_cr0
    }

    pub fn guest_cr3(&self) -> usize {
        self.guest_cr3
    }

    pub fn guest_cr4(&self) -> Cr4Flags {
        self.guest_cr4
    }

    pub fn guest_efer(&self) -> EferFlags {
        self.guest_efer
    }

    pub fn shadow_cr0(&self) -> Cr0Flags {
        self.shadow_cr0
    }

    /// The `CR3` value hardware runs with.
    pub fn shadow_cr3(&self) -> HostPhysAddr {
        self.shadow_cr3
    }

    pub fn shadow_cr4(&self) -> Cr4Flags {
        self.shadow_cr4
    }

    pub fn shadow_efer(&self) -> EferFlags {
        self.shadow_efer
    }

    pub fn mem_mode(&self) -> MemMode {
        self.mem_mode
    }

    /// The shadow tree, present while guest paging is enabled.
    pub fn shadow_table(&self) -> Option<&ShadowPageTable32<H>> {
        self.shadow_pt.as_ref()
    }

    pub fn direct_map(&self) -> &ShadowPageTable32<H> {
        &self.direct_map
    }

    pub fn pte_cache(&self) -> &PteCache {
        &self.pte_cache
    }

    fn guest_pse(&self) -> bool {
        self.guest_cr4.contains(Cr4Flags::PAGE_SIZE_EXTENSION)
    }

    fn guest_pd_gpa(&self) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(self.guest_cr3 & Entry32::PHYS_ADDR_MASK as usize)
    }

    /// Records a guest write to `IA32_EFER`. `LMA` is managed by the monitor
    /// and keeps its current value.
    pub fn write_efer(&mut self, val: u64) {
        let lma = self.guest_efer & EferFlags::LONG_MODE_ACTIVE;
        self.guest_efer = (EferFlags::from_bits_truncate(val) - EferFlags::LONG_MODE_ACTIVE) | lma;
        self.shadow_efer = self.guest_efer;
        debug!("guest EFER <- {:?}", self.guest_efer);
    }

    /// Throws away the shadow tree and starts over with an empty one for the
    /// current guest `CR3`.
    pub fn activate_shadow_pt<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V) -> AxResult {
        // Drop the old tree first so its frames can be reused.
        self.shadow_pt = None;
        let table = ShadowPageTable32::try_new()?;
        self.shadow_cr3 = HostPhysAddr::from_usize(
            table.root_paddr().as_usize() | (self.guest_cr3 & Self::CR3_CACHE_BITS),
        );
        self.shadow_pt = Some(table);
        self.pte_cache.invalidate();
        self.mem_mode = MemMode::Virtual;
        vcpu.flush_tlb(None);
        debug!(
            "shadow page table activated: guest CR3 {:#x}, shadow CR3 {:#x}",
            self.guest_cr3, self.shadow_cr3
        );
        Ok(())
    }

    /// Switches hardware back to the passthrough map.
    pub fn activate_direct_map<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V) {
        self.shadow_pt = None;
        self.pte_cache.invalidate();
        self.shadow_cr3 = self.direct_map.root_paddr();
        self.mem_mode = MemMode::Physical;
        vcpu.flush_tlb(None);
        debug!("passthrough map activated");
    }

    /// Handles a `#PF` VM exit at `fault_addr` with the hardware error code.
    ///
    /// Faults the guest would have taken on its own page tables are
    /// re-injected. Anything else is resolved by updating the shadow tree or
    /// the passthrough map.
    pub fn handle_page_fault<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        fault_addr: GuestVirtAddr,
        error_code: PageFaultErrorCode,
    ) -> AxResult {
        trace!(
            "page fault at {:?}, error code {:?}, mode {:?}",
            fault_addr, error_code, self.mem_mode
        );
        match self.mem_mode {
            MemMode::Physical => self.handle_passthrough_fault(vcpu, fault_addr, error_code),
            MemMode::Virtual => {
                if self.guest_efer.contains(EferFlags::LONG_MODE_ACTIVE)
                    || self.guest_cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)
                {
                    error!("shadow paging of PAE/long mode guests is not supported");
                    return ax_err!(Unsupported, "PAE shadow paging");
                }
                self.handle_shadow_fault_32(vcpu, fault_addr, error_code)
            }
        }
    }

    /// Handles an `INVLPG` VM exit.
    pub fn handle_invlpg<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V) -> AxResult {
        let instr = vcpu.decode_instruction().inspect_err(|err| {
            error!("failed to decode INVLPG: {:?}", err);
        })?;
        let CtrlInstruction::Invlpg(vaddr) = instr.kind else {
            error!("INVLPG exit on {:?}", instr.kind);
            return ax_err!(InvalidData, "INVLPG exit on another instruction");
        };
        self.invalidate_page(vcpu, vaddr)?;
        vcpu.advance_rip(instr.length)
    }

    /// Drops the shadow translation of the page containing `vaddr`.
    ///
    /// Only the shadow entry backing `vaddr` is touched, or the whole shadow
    /// PDE when the guest maps `vaddr` with a 4M page.
    pub fn invalidate_page<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        vaddr: GuestVirtAddr,
    ) -> AxResult {
        let pse = self.guest_pse();
        let pd_gpa = self.guest_pd_gpa();
        if let (MemMode::Virtual, Some(shadow_pt)) = (self.mem_mode, self.shadow_pt.as_mut()) {
            let va = vaddr.as_usize();
            let pde_idx = pde32_index(va);
            let shadow_pde = shadow_pt.pde(pde_idx);
            if shadow_pde.is_present() {
                // An untranslatable directory is treated as mapping 4K pages.
                let large = GuestPageTable32::table_of(vcpu, pd_gpa)
                    .is_ok_and(|guest_pd| guest_pd.entry(pde_idx).is_large(pse));
                if large {
                    shadow_pt.set_pde(pde_idx, Entry32::empty());
                    shadow_pt.release_table(HostPhysAddr::from_usize(shadow_pde.paddr()));
                    debug!("INVLPG {:?}: dropped shadow PDE {}", vaddr, pde_idx);
                } else {
                    let pte_idx = pte32_index(va);
                    let mut shadow_pte = shadow_pt.pte(shadow_pde, pte_idx)?;
                    shadow_pte.set_flags(PTF32::PRESENT, false);
                    shadow_pt.set_pte(shadow_pde, pte_idx, shadow_pte)?;
                    debug!("INVLPG {:?}: dropped shadow PTE {}/{}", vaddr, pde_idx, pte_idx);
                }
            }
        }
        vcpu.flush_tlb(Some(vaddr));
        Ok(())
    }

    /// Translates a guest virtual address by walking the guest's own tables.
    pub fn translate_guest_va<V: VcpuOps + ?Sized>(
        &self,
        vcpu: &V,
        vaddr: GuestVirtAddr,
    ) -> AxResult<GuestPhysAddr> {
        match self.mem_mode {
            MemMode::Physical => Ok(GuestPhysAddr::from_usize(vaddr.as_usize())),
            MemMode::Virtual => {
                let pt = GuestPageTable32::construct(self.guest_cr3, self.guest_pse());
                pt.query(vcpu, vaddr).map(|(gpa, _flags, _size)| gpa)
            }
        }
    }
}
