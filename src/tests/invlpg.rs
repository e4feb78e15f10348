//! Tests for `INVLPG` handling.

use axerrno::AxError;
use x86_64::structures::idt::PageFaultErrorCode as PFE;

use super::mock::{MockVcpu, TestPaging};
use crate::addr::GuestVirtAddr;
use crate::decoder::ControlReg;
use crate::page_table::PTF32;

const PD: usize = 0x1000;
const PT: usize = 0x2000;

/// `INVLPG [EAX]`
const INVLPG_EAX: [u8; 3] = [0x0F, 0x01, 0x38];

fn va(addr: usize) -> GuestVirtAddr {
    GuestVirtAddr::from_usize(addr)
}

fn setup() -> (MockVcpu, TestPaging) {
    let mut vcpu = MockVcpu::new();
    vcpu.add_ram(0, 0x10_0000);
    vcpu.set_entry(PD, 0, PT, PTF32::PRESENT | PTF32::WRITABLE);
    vcpu.set_entry(PT, 0, 0x3000, PTF32::PRESENT | PTF32::WRITABLE);
    vcpu.set_entry(PT, 1, 0x4000, PTF32::PRESENT | PTF32::WRITABLE);
    let mut paging = TestPaging::new().unwrap();
    vcpu.enable_paging(&mut paging, PD, 0);
    (vcpu, paging)
}

fn invlpg(vcpu: &mut MockVcpu, paging: &mut TestPaging, addr: usize) -> Result<(), AxError> {
    vcpu.set_code(&INVLPG_EAX);
    vcpu.regs.rax = addr as u64;
    vcpu.flushes.clear();
    paging.handle_invlpg(vcpu)
}

#[test]
fn test_invlpg_drops_one_entry() {
    let (mut vcpu, mut paging) = setup();
    for addr in [0, 0x1000] {
        paging
            .handle_page_fault(&mut vcpu, va(addr), PFE::empty())
            .unwrap();
    }

    let rip = vcpu.rip;
    invlpg(&mut vcpu, &mut paging, 0x1234).unwrap();
    assert_eq!(vcpu.rip, rip + 3);
    assert_eq!(vcpu.flushes, [Some(va(0x1234))]);

    let table = paging.shadow_table().unwrap();
    let pde = table.pde(0);
    assert!(pde.is_present());
    assert!(table.pte(pde, 0).unwrap().is_present());
    assert!(!table.pte(pde, 1).unwrap().is_present());

    // The next access faults the entry back in.
    paging
        .handle_page_fault(&mut vcpu, va(0x1234), PFE::empty())
        .unwrap();
    let table = paging.shadow_table().unwrap();
    assert!(table.pte(pde, 1).unwrap().is_present());
}

#[test]
fn test_invlpg_large_page_releases_table() {
    let (mut vcpu, mut paging) = setup();
    vcpu.add_ram(0x40_0000, 0x40_2000);
    vcpu.set_entry(
        PD,
        1,
        0x40_0000,
        PTF32::PRESENT | PTF32::WRITABLE | PTF32::HUGE_PAGE,
    );
    vcpu.mov_to_cr(&mut paging, ControlReg::Cr4, 1 << 4).unwrap();

    for addr in [0, 0x40_0000, 0x40_1000] {
        paging
            .handle_page_fault(&mut vcpu, va(addr), PFE::empty())
            .unwrap();
    }
    assert_eq!(paging.shadow_table().unwrap().table_count(), 2);

    invlpg(&mut vcpu, &mut paging, 0x40_1000).unwrap();
    let table = paging.shadow_table().unwrap();
    assert_eq!(table.table_count(), 1);
    assert!(!table.pde(1).is_present());
    assert!(table.pde(0).is_present());
    assert!(vcpu.events.is_empty());
}

#[test]
fn test_invlpg_without_shadow_entry() {
    let (mut vcpu, mut paging) = setup();

    invlpg(&mut vcpu, &mut paging, 0x80_0000).unwrap();
    assert_eq!(vcpu.flushes, [Some(va(0x80_0000))]);
    assert_eq!(paging.shadow_table().unwrap().table_count(), 0);
}

#[test]
fn test_invlpg_with_paging_disabled() {
    let mut vcpu = MockVcpu::new();
    vcpu.add_ram(0, 0x1_0000);
    let mut paging = TestPaging::new().unwrap();
    paging
        .handle_page_fault(&mut vcpu, va(0x3000), PFE::empty())
        .unwrap();

    let rip = vcpu.rip;
    invlpg(&mut vcpu, &mut paging, 0x3000).unwrap();
    assert_eq!(vcpu.rip, rip + 3);
    assert_eq!(vcpu.flushes, [Some(va(0x3000))]);

    // The passthrough map is not affected.
    let direct = paging.direct_map();
    assert!(direct.pte(direct.pde(0), 3).unwrap().is_present());
}

#[test]
fn test_invlpg_exit_on_other_instruction() {
    let (mut vcpu, mut paging) = setup();
    let rip = vcpu.rip;

    // CLTS
    vcpu.set_code(&[0x0F, 0x06]);
    assert_eq!(paging.handle_invlpg(&mut vcpu), Err(AxError::InvalidData));
    assert_eq!(vcpu.rip, rip);

    // SWAPGS shares the opcode with INVLPG.
    vcpu.set_code(&[0x0F, 0x01, 0xF8]);
    assert!(paging.handle_invlpg(&mut vcpu).is_err());
    assert_eq!(vcpu.rip, rip);
}

#[test]
fn test_invlpg_with_unbacked_directory() {
    let (mut vcpu, mut paging) = setup();
    paging
        .handle_page_fault(&mut vcpu, va(0x1000), PFE::empty())
        .unwrap();
    vcpu.remove_ram(PD);

    let rip = vcpu.rip;
    invlpg(&mut vcpu, &mut paging, 0x1000).unwrap();
    assert_eq!(vcpu.rip, rip + 3);
    assert_eq!(vcpu.flushes, [Some(va(0x1000))]);
    let table = paging.shadow_table().unwrap();
    let pde = table.pde(0);
    assert!(pde.is_present());
    assert!(!table.pte(pde, 1).unwrap().is_present());
}
