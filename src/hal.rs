//! Interfaces the shadow paging engine consumes from the rest of the monitor.

use axerrno::AxResult;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::addr::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr};
use crate::decoder::DecodedInstr;
use crate::regs::GeneralRegisters;

/// Memory management functions needed to back the shadow page tables.
pub trait ShadowPagingHal {
    /// Allocates a 4K-sized physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Deallocates a frame previously returned by [`Self::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Converts a host physical address to a host virtual address the monitor
    /// can dereference.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}

/// How the guest-physical region map describes a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMemRegion {
    /// Not backed by anything.
    Invalid,
    /// Ordinary RAM, backed by the given host physical page.
    PhysicalMemory(HostPhysAddr),
    /// RAM backed by the given host page whose writes must be trapped.
    WriteHooked(HostPhysAddr),
    /// A hooked region (MMIO and the like) emulated by the monitor.
    Special,
}

/// Operations of the owning virtual CPU used on the VM-exit path.
pub trait VcpuOps {
    /// Translates a guest physical address to a host virtual address.
    fn gpa_to_hva(&self, gpa: GuestPhysAddr) -> AxResult<HostVirtAddr>;

    /// Looks up the region type of a guest physical address.
    fn classify(&self, gpa: GuestPhysAddr) -> GuestMemRegion;

    /// Emulates an access to a hooked guest physical page.
    fn special_fault(
        &mut self,
        fault_va: GuestVirtAddr,
        guest_pa: GuestPhysAddr,
        error_code: PageFaultErrorCode,
    ) -> AxResult;

    /// Adds a virtual interrupt or exception to the pending events list.
    fn queue_event(&mut self, vector: u8, err_code: Option<u32>);

    /// Sets the guest `CR2` reported with the next page fault.
    fn set_page_fault_addr(&mut self, addr: GuestVirtAddr);

    /// Decodes the instruction at the current guest `RIP`.
    fn decode_instruction(&self) -> AxResult<DecodedInstr>;

    /// Advances guest `RIP` by `instr_len` bytes.
    fn advance_rip(&mut self, instr_len: u8) -> AxResult;

    /// Guest general-purpose registers.
    fn regs(&self) -> &GeneralRegisters;

    /// Mutable reference of guest general-purpose registers.
    fn regs_mut(&mut self) -> &mut GeneralRegisters;

    /// Guest stack pointer. (`RSP`)
    fn stack_pointer(&self) -> usize;

    /// Set guest stack pointer. (`RSP`)
    fn set_stack_pointer(&mut self, rsp: usize);

    /// Reads a 16-bit word at a guest virtual address.
    fn read_guest_word(&self, gva: GuestVirtAddr) -> AxResult<u16>;

    /// Writes a 16-bit word at a guest virtual address.
    fn write_guest_word(&mut self, gva: GuestVirtAddr, val: u16) -> AxResult;

    /// Flushes the hardware TLB entries of this vCPU, either for one guest
    /// virtual address or entirely.
    fn flush_tlb(&mut self, vaddr: Option<GuestVirtAddr>);
}
