#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod addr;
mod ctrl_regs;
pub mod decoder;
mod frame;
mod hal;
pub mod page_table;
mod regs;
mod shadow;

#[cfg(test)]
mod tests;

pub use addr::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr};
pub use decoder::{ControlReg, CtrlInstruction, DecodedInstr, Operand, VmCpuMode};
pub use frame::PhysFrame;
pub use hal::{GuestMemRegion, ShadowPagingHal, VcpuOps};
pub use page_table::{AccessStatus, Entry32, GuestPageTable32, PTF32, PageSize32};
pub use regs::GeneralRegisters;
pub use shadow::{MemMode, PteCache, ShadowPageTable32, ShadowPaging, is_guest_pf};
