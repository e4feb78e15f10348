//! Page fault handling: the lazy builder of shadow PDEs and PTEs.

use axerrno::{AxError, AxResult, ax_err};
use x86::irq::{MACHINE_CHECK_VECTOR, PAGE_FAULT_VECTOR};
use x86_64::registers::control::Cr0Flags;
use x86_64::structures::idt::PageFaultErrorCode;

use super::{PteCache, ShadowPageTable32, ShadowPaging};
use crate::addr::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};
use crate::hal::{GuestMemRegion, ShadowPagingHal, VcpuOps};
use crate::page_table::{
    AccessStatus, Entry32, GuestPageTable32, GuestTable32, PTF32, pde32_index, pte32_index,
};

/// Host frames mapped by 32-bit entries must lie below 4GiB.
const MAX_MAPPED_PADDR: usize = 1 << 32;

/// Decides whether a fault must be delivered to the guest, given the access
/// status of the guest entry and of the shadow entry at the same level.
///
/// A fault the guest's own tables permit is the monitor's business. A shadow
/// entry that is simply missing is filled in first, even if the guest entry
/// denies the access; the retried access then reports the guest's own error.
pub fn is_guest_pf(guest: AccessStatus, shadow: AccessStatus) -> bool {
    match (guest, shadow) {
        (AccessStatus::Ok, _) => false,
        (AccessStatus::NotPresent, _) => true,
        (_, AccessStatus::NotPresent) => false,
        _ => true,
    }
}

/// Queues a `#PF` for the guest, as its own page tables would have raised it.
pub(crate) fn inject_guest_pf<V: VcpuOps + ?Sized>(
    vcpu: &mut V,
    fault_addr: GuestVirtAddr,
    error_code: PageFaultErrorCode,
    guest_status: AccessStatus,
) {
    let mut code = error_code
        & (PageFaultErrorCode::CAUSED_BY_WRITE
            | PageFaultErrorCode::USER_MODE
            | PageFaultErrorCode::INSTRUCTION_FETCH);
    if guest_status != AccessStatus::NotPresent {
        code |= PageFaultErrorCode::PROTECTION_VIOLATION;
    }
    debug!("inject #PF at {:?}, error code {:?}", fault_addr, code);
    vcpu.set_page_fault_addr(fault_addr);
    vcpu.queue_event(PAGE_FAULT_VECTOR, Some(code.bits() as u32));
}

fn inject_machine_check<V: VcpuOps + ?Sized>(vcpu: &mut V) {
    vcpu.queue_event(MACHINE_CHECK_VECTOR, None);
}

fn check_mappable(hpa: HostPhysAddr) -> AxResult {
    if hpa.as_usize() >= MAX_MAPPED_PADDR {
        error!("host frame {:#x} is not reachable by 32-bit paging", hpa);
        return ax_err!(Unsupported, "host frame above 4GiB");
    }
    Ok(())
}

/// The guest entry mapping the faulting page: a PTE, or a 4M PDE.
struct GuestLeaf {
    table: GuestTable32,
    index: usize,
    large: bool,
}

impl GuestLeaf {
    fn entry(&self) -> Entry32 {
        self.table.entry(self.index)
    }

    /// Guest physical address of the 4K page containing `va`.
    fn page_gpa(&self, entry: Entry32, va: usize) -> GuestPhysAddr {
        if self.large {
            GuestPhysAddr::from_usize(entry.large_paddr() | (va & 0x3f_f000))
        } else {
            GuestPhysAddr::from_usize(entry.paddr())
        }
    }
}

/// Context shared by the directory and entry levels of one fault.
struct FaultInfo {
    va: GuestVirtAddr,
    error_code: PageFaultErrorCode,
    guest_wp: bool,
    shadow_wp: bool,
    /// Status of the guest PDE for this access.
    dir_status: AccessStatus,
}

impl FaultInfo {
    /// Status of the whole guest translation, given the status of the leaf
    /// entry. A missing leaf is reported first, then a directory-level
    /// permission error.
    fn guest_status(&self, leaf_status: AccessStatus) -> AccessStatus {
        match (leaf_status, self.dir_status) {
            (AccessStatus::NotPresent, _) | (_, AccessStatus::Ok) => leaf_status,
            (_, dir_status) => dir_status,
        }
    }

    fn is_write(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    fn gpa_in_page(&self, page: GuestPhysAddr) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(page.as_usize() | (self.va.as_usize() & 0xfff))
    }
}

impl<H: ShadowPagingHal> ShadowPaging<H> {
    /// Handles a fault while the guest runs with 32-bit paging.
    pub(super) fn handle_shadow_fault_32<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        fault_addr: GuestVirtAddr,
        error_code: PageFaultErrorCode,
    ) -> AxResult {
        let pse = self.guest_pse();
        let pd_gpa = self.guest_pd_gpa();
        let guest_wp = self.guest_cr0.contains(Cr0Flags::WRITE_PROTECT);
        let shadow_wp = self.shadow_cr0.contains(Cr0Flags::WRITE_PROTECT);

        self.pte_cache
            .cache_page_tables32(vcpu, pd_gpa, pse)
            .map_err(|err| {
                error!("cannot cache guest page directory {:?}: {:?}", pd_gpa, err);
                AxError::BadAddress
            })?;
        let guest_pd = GuestPageTable32::table_of(vcpu, pd_gpa).map_err(|_| {
            error!("cannot translate guest page directory {:?}", pd_gpa);
            AxError::BadAddress
        })?;
        let Some(shadow_pt) = self.shadow_pt.as_mut() else {
            return ax_err!(BadState, "shadow page table not active");
        };

        let va = fault_addr.as_usize();
        let pde_idx = pde32_index(va);
        let guest_pde = guest_pd.entry(pde_idx);
        let mut shadow_pde = shadow_pt.pde(pde_idx);
        let large = guest_pde.is_large(pse);

        let guest_status = guest_pde.access_status(error_code, guest_wp);
        let shadow_status = shadow_pde.access_status(error_code, shadow_wp);

        #[cfg(feature = "tracing")]
        trace!(
            "PDE {}: guest {:?} ({:?}), shadow {:?} ({:?})",
            pde_idx, guest_pde, guest_status, shadow_pde, shadow_status
        );

        if is_guest_pf(guest_status, shadow_status) {
            inject_guest_pf(vcpu, fault_addr, error_code, guest_status);
            return Ok(());
        }

        match shadow_status {
            AccessStatus::NotPresent => {
                let table = shadow_pt.alloc_table()?;
                let mut flags = PTF32::PRESENT;
                if guest_pde.is_user() {
                    flags |= PTF32::USER;
                }
                // Writes to a 4M page are enabled by dirty tracking.
                if !large && guest_pde.is_writable() {
                    flags |= PTF32::WRITABLE;
                }
                shadow_pde = Entry32::new(table.as_usize(), flags);
                shadow_pt.set_pde(pde_idx, shadow_pde);
                guest_pd.update(pde_idx, |e| e.set_flags(PTF32::ACCESSED, true));
                debug!("shadow PDE {} <- {:?}", pde_idx, shadow_pde);
            }
            AccessStatus::Ok => {}
            AccessStatus::WriteError if large => {
                let guest_pde = if guest_pde.is_dirty() {
                    guest_pde
                } else {
                    guest_pd.update(pde_idx, |e| e.set_flags(PTF32::DIRTY, true))
                };
                shadow_pde.set_flags(PTF32::WRITABLE, guest_pde.is_writable());
                shadow_pt.set_pde(pde_idx, shadow_pde);
                debug!("4M page at PDE {} dirtied", pde_idx);
                return Ok(());
            }
            AccessStatus::UserError => {
                inject_guest_pf(vcpu, fault_addr, error_code, guest_status);
                return Ok(());
            }
            status => {
                warn!(
                    "unexpected shadow PDE status {:?} at {:?}, guest {:?}",
                    status, fault_addr, guest_status
                );
                inject_guest_pf(vcpu, fault_addr, error_code, guest_status);
                return Ok(());
            }
        }

        let info = FaultInfo {
            va: fault_addr,
            error_code,
            guest_wp,
            shadow_wp,
            dir_status: guest_status,
        };
        let leaf = if large {
            GuestLeaf {
                table: guest_pd,
                index: pde_idx,
                large: true,
            }
        } else {
            let pt_gpa = GuestPhysAddr::from_usize(guest_pde.paddr());
            match GuestPageTable32::table_of(vcpu, pt_gpa) {
                Ok(table) => GuestLeaf {
                    table,
                    index: pte32_index(va),
                    large: false,
                },
                Err(_) => {
                    warn!("guest page table {:?} is not backed by memory", pt_gpa);
                    inject_machine_check(vcpu);
                    return Ok(());
                }
            }
        };

        resolve_leaf(vcpu, shadow_pt, &mut self.pte_cache, shadow_pde, &leaf, &info)
    }

    /// Handles a fault while guest paging is off, filling in the passthrough
    /// map.
    pub(super) fn handle_passthrough_fault<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        fault_addr: GuestVirtAddr,
        error_code: PageFaultErrorCode,
    ) -> AxResult {
        let va = fault_addr.as_usize();
        if va >= MAX_MAPPED_PADDR {
            return ax_err!(Unsupported, "passthrough fault above 4GiB");
        }
        let gpa = GuestPhysAddr::from_usize(va);
        let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);

        let (hpa, writable) = match vcpu.classify(gpa) {
            GuestMemRegion::Invalid => {
                error!("passthrough fault on invalid guest memory {:?}", gpa);
                return ax_err!(BadAddress, "invalid guest physical address");
            }
            GuestMemRegion::Special => return vcpu.special_fault(fault_addr, gpa, error_code),
            GuestMemRegion::WriteHooked(_) if is_write => {
                return vcpu.special_fault(fault_addr, gpa, error_code);
            }
            GuestMemRegion::WriteHooked(hpa) => (hpa, false),
            GuestMemRegion::PhysicalMemory(hpa) => (hpa, true),
        };
        check_mappable(hpa)?;

        let direct = &mut self.direct_map;
        let pde_idx = pde32_index(va);
        let mut pde = direct.pde(pde_idx);
        if !pde.is_present() {
            let table = direct.alloc_table()?;
            pde = Entry32::new(
                table.as_usize(),
                PTF32::PRESENT | PTF32::WRITABLE | PTF32::USER,
            );
            direct.set_pde(pde_idx, pde);
        }

        let mut flags = PTF32::PRESENT | PTF32::USER;
        if writable {
            flags |= PTF32::WRITABLE;
        }
        let pte = Entry32::new(hpa.as_usize(), flags);
        direct.set_pte(pde, pte32_index(va), pte)?;
        trace!("passthrough {:?} -> {:?}", gpa, pte);
        Ok(())
    }
}

/// Resolves a fault at the last level, where `leaf` is the guest entry that
/// maps the page (a PTE, or the 4M PDE itself).
fn resolve_leaf<H: ShadowPagingHal, V: VcpuOps + ?Sized>(
    vcpu: &mut V,
    shadow_pt: &mut ShadowPageTable32<H>,
    pte_cache: &mut PteCache,
    shadow_pde: Entry32,
    leaf: &GuestLeaf,
    info: &FaultInfo,
) -> AxResult {
    let va = info.va.as_usize();
    let pte_idx = pte32_index(va);
    let guest_entry = leaf.entry();
    let mut shadow_pte = shadow_pt.pte(shadow_pde, pte_idx)?;

    let guest_status = info.guest_status(guest_entry.access_status(info.error_code, info.guest_wp));
    let shadow_status = shadow_pte.access_status(info.error_code, info.shadow_wp);

    #[cfg(feature = "tracing")]
    trace!(
        "leaf {}: guest {:?} ({:?}), shadow {:?} ({:?})",
        pte_idx, guest_entry, guest_status, shadow_pte, shadow_status
    );

    if is_guest_pf(guest_status, shadow_status) {
        inject_guest_pf(vcpu, info.va, info.error_code, guest_status);
        return Ok(());
    }

    let page_gpa = leaf.page_gpa(guest_entry, va);
    match shadow_status {
        AccessStatus::NotPresent => {
            let (hpa, hooked) = match vcpu.classify(page_gpa) {
                GuestMemRegion::Invalid => {
                    warn!(
                        "guest maps {:?} to invalid memory {:?}",
                        info.va, page_gpa
                    );
                    inject_machine_check(vcpu);
                    return Ok(());
                }
                GuestMemRegion::Special => {
                    return vcpu.special_fault(info.va, info.gpa_in_page(page_gpa), info.error_code);
                }
                GuestMemRegion::WriteHooked(hpa) => (hpa, true),
                GuestMemRegion::PhysicalMemory(hpa) => (hpa, false),
            };
            check_mappable(hpa)?;

            let mut flags = PTF32::PRESENT;
            if guest_entry.is_user() {
                flags |= PTF32::USER;
            }
            let mut guest_entry = leaf
                .table
                .update(leaf.index, |e| e.set_flags(PTF32::ACCESSED, true));

            if pte_cache.contains(page_gpa) {
                flags |= PTF32::GUEST_PT;
            } else if !hooked {
                if guest_entry.is_dirty() {
                    flags.set(PTF32::WRITABLE, guest_entry.is_writable());
                } else if info.is_write() && guest_status == AccessStatus::Ok {
                    guest_entry = leaf
                        .table
                        .update(leaf.index, |e| e.set_flags(PTF32::DIRTY, true));
                    flags.set(PTF32::WRITABLE, guest_entry.is_writable());
                }
            }

            shadow_pte = Entry32::new(hpa.as_usize(), flags);
            shadow_pt.set_pte(shadow_pde, pte_idx, shadow_pte)?;
            debug!("shadow PTE {} for {:?} <- {:?}", pte_idx, info.va, shadow_pte);
            Ok(())
        }
        AccessStatus::WriteError => {
            if let GuestMemRegion::WriteHooked(_) = vcpu.classify(page_gpa) {
                return vcpu.special_fault(info.va, info.gpa_in_page(page_gpa), info.error_code);
            }
            let guest_entry = if guest_entry.is_dirty() {
                guest_entry
            } else {
                leaf.table
                    .update(leaf.index, |e| e.set_flags(PTF32::DIRTY, true))
            };
            shadow_pte.set_flags(PTF32::WRITABLE, guest_entry.is_writable());
            if shadow_pte.is_guest_pt() {
                debug!("guest writes its page table page {:?}", page_gpa);
                shadow_pte.set_flags(PTF32::GUEST_PT, false);
                pte_cache.invalidate();
            }
            shadow_pt.set_pte(shadow_pde, pte_idx, shadow_pte)?;
            Ok(())
        }
        AccessStatus::Ok => {
            trace!("stale TLB entry for {:?}", info.va);
            vcpu.flush_tlb(Some(info.va));
            Ok(())
        }
        AccessStatus::UserError => {
            warn!(
                "unexpected shadow PTE user error at {:?}, guest {:?}",
                info.va, guest_status
            );
            inject_guest_pf(vcpu, info.va, info.error_code, guest_status);
            Ok(())
        }
    }
}
