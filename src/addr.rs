//! Address types seen by the shadow paging engine.

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};

memory_addr::def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}
