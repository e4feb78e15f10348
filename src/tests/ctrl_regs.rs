//! Tests for intercepted control register accesses.

use axerrno::AxError;
use x86::irq::GENERAL_PROTECTION_FAULT_VECTOR;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;
use x86_64::structures::idt::PageFaultErrorCode as PFE;

use super::mock::{MockVcpu, TestPaging};
use crate::addr::GuestVirtAddr;
use crate::decoder::{ControlReg, VmCpuMode};
use crate::page_table::PTF32;
use crate::shadow::MemMode;

const PD: usize = 0x1000;
const PT: usize = 0x2000;

fn setup() -> (MockVcpu, TestPaging) {
    let mut vcpu = MockVcpu::new();
    vcpu.add_ram(0, 0x10_0000);
    vcpu.set_entry(PD, 0, PT, PTF32::PRESENT | PTF32::WRITABLE);
    vcpu.set_entry(PT, 0, 0x3000, PTF32::PRESENT | PTF32::WRITABLE);
    (vcpu, TestPaging::new().unwrap())
}

#[test]
fn test_reset_state() {
    let paging = TestPaging::new().unwrap();
    assert_eq!(
        paging.guest_cr0(),
        Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE
    );
    let cr0 = paging.shadow_cr0();
    assert!(cr0.contains(Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT | Cr0Flags::EXTENSION_TYPE));
    assert!(!cr0.intersects(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE));
    assert_eq!(paging.mem_mode(), MemMode::Physical);
    assert!(paging.shadow_table().is_none());
    assert_eq!(paging.shadow_cr3(), paging.direct_map().root_paddr());
}

#[test]
fn test_cr0_forces_extension_type() {
    let (mut vcpu, mut paging) = setup();
    let rip = vcpu.rip;

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x1).unwrap();
    assert_eq!(
        paging.guest_cr0(),
        Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::EXTENSION_TYPE
    );
    assert_eq!(vcpu.rip, rip + 3);
    assert_eq!(paging.mem_mode(), MemMode::Physical);
}

#[test]
fn test_paging_round_trip() {
    let (mut vcpu, mut paging) = setup();
    paging
        .handle_page_fault(&mut vcpu, GuestVirtAddr::from_usize(0x3000), PFE::empty())
        .unwrap();
    let direct_root = paging.direct_map().root_paddr();

    vcpu.enable_paging(&mut paging, PD, 0);
    assert_eq!(paging.mem_mode(), MemMode::Virtual);
    let table = paging.shadow_table().unwrap();
    assert_eq!(paging.shadow_cr3(), table.root_paddr());
    assert_eq!(table.table_count(), 0);
    assert_eq!(vcpu.flushes.last(), Some(&None));
    // Shadow WP follows the guest once paging is on.
    assert!(!paging.shadow_cr0().contains(Cr0Flags::WRITE_PROTECT));
    assert!(paging.shadow_cr0().contains(Cr0Flags::PAGING));

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x11).unwrap();
    assert_eq!(paging.mem_mode(), MemMode::Physical);
    assert!(paging.shadow_table().is_none());
    assert_eq!(paging.shadow_cr3(), direct_root);
    assert_eq!(paging.pte_cache().cached_cr3(), None);

    // The passthrough map survives the round trip.
    let direct = paging.direct_map();
    assert!(direct.pte(direct.pde(0), 3).unwrap().is_present());
}

#[test]
fn test_cr0_write_without_pg_change() {
    let (mut vcpu, mut paging) = setup();
    vcpu.enable_paging(&mut paging, PD, 0);
    let root = paging.shadow_cr3();
    let flushes = vcpu.flushes.len();

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x8001_0011)
        .unwrap();
    assert_eq!(paging.shadow_cr3(), root);
    assert_eq!(vcpu.flushes.len(), flushes);
    assert!(paging.shadow_cr0().contains(Cr0Flags::WRITE_PROTECT));
}

#[test]
fn test_cr3_reload_rebuilds() {
    let (mut vcpu, mut paging) = setup();
    vcpu.enable_paging(&mut paging, PD, 0);
    paging
        .handle_page_fault(&mut vcpu, GuestVirtAddr::from_usize(0), PFE::empty())
        .unwrap();
    assert!(paging.pte_cache().cached_cr3().is_some());
    let old_root = paging.shadow_cr3();

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr3, (PD | 0x18) as u64)
        .unwrap();
    assert_eq!(paging.guest_cr3(), PD | 0x18);
    assert_eq!(paging.pte_cache().cached_cr3(), None);
    let table = paging.shadow_table().unwrap();
    assert_eq!(table.table_count(), 0);
    assert_ne!(paging.shadow_cr3(), old_root);
    assert_eq!(
        paging.shadow_cr3().as_usize(),
        table.root_paddr().as_usize() | 0x18
    );
}

#[test]
fn test_cr3_write_with_paging_disabled() {
    let (mut vcpu, mut paging) = setup();
    let root = paging.shadow_cr3();

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr3, PD as u64).unwrap();
    assert_eq!(paging.guest_cr3(), PD);
    assert_eq!(paging.shadow_cr3(), root);
    assert!(paging.shadow_table().is_none());
}

#[test]
fn test_mov_to_cr_operand_size() {
    let (mut vcpu, mut paging) = setup();

    // High bits are dropped outside 64-bit mode.
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr3, 0xffff_ffff_0000_1000)
        .unwrap();
    assert_eq!(paging.guest_cr3(), 0x1000);

    vcpu.mode = VmCpuMode::Mode64;
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr3, 0x1_0000_2000)
        .unwrap();
    assert_eq!(paging.guest_cr3(), 0x1_0000_2000);
}

#[test]
fn test_mov_to_cr_from_esp() {
    let (mut vcpu, mut paging) = setup();
    vcpu.rsp = 0x5000;
    // MOV CR3, ESP
    vcpu.set_code(&[0x0F, 0x22, 0xDC]);
    paging.handle_cr_write(&mut vcpu, ControlReg::Cr3).unwrap();
    assert_eq!(paging.guest_cr3(), 0x5000);
}

#[test]
fn test_cr4_paging_bits_rebuild() {
    let (mut vcpu, mut paging) = setup();
    vcpu.enable_paging(&mut paging, PD, 0);
    let root = paging.shadow_cr3();

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, Cr4Flags::PAGE_SIZE_EXTENSION.bits())
        .unwrap();
    assert!(paging.guest_cr4().contains(Cr4Flags::PAGE_SIZE_EXTENSION));
    assert!(!paging.shadow_cr4().contains(Cr4Flags::PAGE_SIZE_EXTENSION));
    assert_ne!(paging.shadow_cr3(), root);

    // OSFXSR does not affect translations.
    let root = paging.shadow_cr3();
    let cr4 = Cr4Flags::PAGE_SIZE_EXTENSION | Cr4Flags::OSFXSR;
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, cr4.bits())
        .unwrap();
    assert_eq!(paging.shadow_cr3(), root);
    assert!(paging.shadow_cr4().contains(Cr4Flags::OSFXSR));

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, Cr4Flags::PAGE_GLOBAL.bits())
        .unwrap();
    assert!(!paging.shadow_cr4().contains(Cr4Flags::PAGE_GLOBAL));
    assert_ne!(paging.shadow_cr3(), root);
}

#[test]
fn test_long_mode_activation() {
    let (mut vcpu, mut paging) = setup();
    paging.write_efer(EferFlags::LONG_MODE_ENABLE.bits() | EferFlags::LONG_MODE_ACTIVE.bits());
    // LMA cannot be written directly.
    assert!(!paging.guest_efer().contains(EferFlags::LONG_MODE_ACTIVE));

    vcpu.mov_to_cr(
        &mut paging,
        ControlReg::Cr4,
        Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits(),
    )
    .unwrap();
    assert!(!paging.shadow_cr4().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION));

    vcpu.enable_paging(&mut paging, PD, 0);
    assert!(paging.guest_efer().contains(EferFlags::LONG_MODE_ACTIVE));
    assert!(paging.shadow_efer().contains(EferFlags::LONG_MODE_ACTIVE));
    assert!(paging.shadow_cr4().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION));

    // Clearing PAE in long mode raises #GP(0) and does not retire.
    let rip = vcpu.rip;
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, 0).unwrap();
    assert_eq!(
        vcpu.take_events(),
        [(GENERAL_PROTECTION_FAULT_VECTOR, Some(0))]
    );
    assert_eq!(vcpu.rip, rip);
    assert!(paging.guest_cr4().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION));

    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x11).unwrap();
    assert!(!paging.guest_efer().contains(EferFlags::LONG_MODE_ACTIVE));
    assert!(paging.guest_efer().contains(EferFlags::LONG_MODE_ENABLE));
}

#[test]
fn test_lmsw() {
    let (mut vcpu, mut paging) = setup();
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x8000_0011)
        .unwrap();
    let rip = vcpu.rip;

    // LMSW AX, with PE clear and MP, EM and TS set
    vcpu.set_code(&[0x0F, 0x01, 0xF0]);
    vcpu.regs.rax = 0xffff_000e;
    paging.handle_cr_write(&mut vcpu, ControlReg::Cr0).unwrap();
    let cr0 = paging.guest_cr0();
    assert!(cr0.contains(
        Cr0Flags::PROTECTED_MODE_ENABLE
            | Cr0Flags::MONITOR_COPROCESSOR
            | Cr0Flags::EMULATE_COPROCESSOR
            | Cr0Flags::TASK_SWITCHED
            | Cr0Flags::PAGING
    ));
    assert!(paging.shadow_cr0().contains(Cr0Flags::TASK_SWITCHED));
    assert_eq!(vcpu.rip, rip + 3);

    // LMSW [EBX]
    vcpu.write_u32(0x3000, 0x0001);
    vcpu.set_code(&[0x0F, 0x01, 0x33]);
    vcpu.regs.rbx = 0x3000;
    paging.handle_cr_write(&mut vcpu, ControlReg::Cr0).unwrap();
    let cr0 = paging.guest_cr0();
    assert!(cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE));
    assert!(!cr0.intersects(Cr0Flags::MONITOR_COPROCESSOR | Cr0Flags::TASK_SWITCHED));
}

#[test]
fn test_lmsw_enters_protected_mode() {
    let (mut vcpu, mut paging) = setup();
    vcpu.set_code(&[0x0F, 0x01, 0xF0]);
    vcpu.regs.rax = 0x1;
    paging.handle_cr_write(&mut vcpu, ControlReg::Cr0).unwrap();
    assert!(paging.guest_cr0().contains(Cr0Flags::PROTECTED_MODE_ENABLE));
    assert!(paging.shadow_cr0().contains(Cr0Flags::PROTECTED_MODE_ENABLE));
}

#[test]
fn test_clts() {
    let (mut vcpu, mut paging) = setup();
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr0, 0x19).unwrap();
    assert!(paging.shadow_cr0().contains(Cr0Flags::TASK_SWITCHED));
    let rip = vcpu.rip;

    vcpu.set_code(&[0x0F, 0x06]);
    paging.handle_cr_write(&mut vcpu, ControlReg::Cr0).unwrap();
    assert!(!paging.guest_cr0().contains(Cr0Flags::TASK_SWITCHED));
    assert!(!paging.shadow_cr0().contains(Cr0Flags::TASK_SWITCHED));
    assert_eq!(vcpu.rip, rip + 2);
}

#[test]
fn test_mov_from_cr() {
    let (mut vcpu, mut paging) = setup();
    vcpu.enable_paging(&mut paging, PD | 0x8, 0);
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, Cr4Flags::PAGE_GLOBAL.bits())
        .unwrap();
    let rip = vcpu.rip;

    // MOV EAX, CR3
    vcpu.set_code(&[0x0F, 0x20, 0xD8]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr3).unwrap();
    assert_eq!(vcpu.regs.rax, (PD | 0x8) as u64);
    assert_eq!(vcpu.rip, rip + 3);

    // MOV EBX, CR0
    vcpu.set_code(&[0x0F, 0x20, 0xC3]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr0).unwrap();
    assert_eq!(vcpu.regs.rbx, 0x8000_0011);

    // MOV ECX, CR4 reports the guest value, not the shadow one.
    vcpu.set_code(&[0x0F, 0x20, 0xE1]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr4).unwrap();
    assert_eq!(vcpu.regs.rcx, Cr4Flags::PAGE_GLOBAL.bits());
}

#[test]
fn test_smsw() {
    let (mut vcpu, mut paging) = setup();
    vcpu.enable_paging(&mut paging, PD, 0);

    // SMSW EAX stores the whole CR0.
    vcpu.set_code(&[0x0F, 0x01, 0xE0]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr0).unwrap();
    assert_eq!(vcpu.regs.rax, 0x8000_0011);

    // SMSW AX keeps the upper bits.
    let rip = vcpu.rip;
    vcpu.regs.rdx = 0x1234_5678_dead_beef;
    vcpu.set_code(&[0x66, 0x0F, 0x01, 0xE2]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr0).unwrap();
    assert_eq!(vcpu.regs.rdx, 0x1234_5678_dead_0011);
    assert_eq!(vcpu.rip, rip + 4);

    // SMSW [ESI]
    vcpu.regs.rsi = 0x3002;
    vcpu.write_u32(0x3000, 0xffff_ffff);
    vcpu.set_code(&[0x0F, 0x01, 0x26]);
    paging.handle_cr_read(&mut vcpu, ControlReg::Cr0).unwrap();
    assert_eq!(vcpu.read_u32(0x3000), 0x0011_ffff);
}

#[test]
fn test_mismatched_instruction() {
    let (mut vcpu, mut paging) = setup();
    let rip = vcpu.rip;

    // CLTS on a CR4 exit
    vcpu.set_code(&[0x0F, 0x06]);
    assert_eq!(
        paging.handle_cr_write(&mut vcpu, ControlReg::Cr4),
        Err(AxError::InvalidData)
    );

    // MOV CR3, EAX on a CR0 exit
    vcpu.set_code(&[0x0F, 0x22, 0xD8]);
    assert_eq!(
        paging.handle_cr_write(&mut vcpu, ControlReg::Cr0),
        Err(AxError::InvalidData)
    );

    // A write on a read exit
    assert_eq!(
        paging.handle_cr_read(&mut vcpu, ControlReg::Cr3),
        Err(AxError::InvalidData)
    );
    assert_eq!(vcpu.rip, rip);
    assert_eq!(paging.guest_cr3(), 0);
}

#[test]
fn test_unhandled_control_registers() {
    let (mut vcpu, mut paging) = setup();

    // MOV CR2, EAX
    vcpu.set_code(&[0x0F, 0x22, 0xD0]);
    assert_eq!(
        paging.handle_cr_write(&mut vcpu, ControlReg::Cr2),
        Err(AxError::Unsupported)
    );

    // MOV CR5, EAX does not decode.
    vcpu.set_code(&[0x0F, 0x22, 0xE8]);
    assert!(paging.handle_cr_write(&mut vcpu, ControlReg::Cr0).is_err());
    assert_eq!(vcpu.rip, 0x1_0000);
}
