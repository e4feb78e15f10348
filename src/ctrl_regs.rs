//! Intercepted accesses to `CR0`, `CR3` and `CR4`.

use axerrno::{AxResult, ax_err};
use x86::irq::GENERAL_PROTECTION_FAULT_VECTOR;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::decoder::{ControlReg, CtrlInstruction, DecodedInstr, Operand};
use crate::hal::{ShadowPagingHal, VcpuOps};
use crate::regs::GeneralRegisters;
use crate::shadow::{MemMode, ShadowPaging};

/// The `CR0` bits `LMSW` and `SMSW` operate on.
const MSW_BITS: Cr0Flags = Cr0Flags::PROTECTED_MODE_ENABLE
    .union(Cr0Flags::MONITOR_COPROCESSOR)
    .union(Cr0Flags::EMULATE_COPROCESSOR)
    .union(Cr0Flags::TASK_SWITCHED);

/// `CR4` bits whose change invalidates every shadow entry.
const CR4_PAGING_BITS: Cr4Flags = Cr4Flags::PAGE_SIZE_EXTENSION
    .union(Cr4Flags::PAGE_GLOBAL)
    .union(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION);

fn read_gpr<V: VcpuOps + ?Sized>(vcpu: &V, index: u8, operand_size: u8) -> u64 {
    let val = if index == GeneralRegisters::RSP_INDEX {
        vcpu.stack_pointer() as u64
    } else {
        vcpu.regs().get_reg_of_index(index)
    };
    if operand_size == 8 {
        val
    } else {
        val & 0xffff_ffff
    }
}

fn write_gpr<V: VcpuOps + ?Sized>(vcpu: &mut V, index: u8, val: u64) {
    if index == GeneralRegisters::RSP_INDEX {
        vcpu.set_stack_pointer(val as usize);
    } else {
        vcpu.regs_mut().set_reg_of_index(index, val);
    }
}

fn read_msw<V: VcpuOps + ?Sized>(vcpu: &V, operand: Operand) -> AxResult<u16> {
    match operand {
        Operand::Register(index) => Ok(read_gpr(vcpu, index, 8) as u16),
        Operand::Memory(addr) => vcpu.read_guest_word(addr),
    }
}

impl<H: ShadowPagingHal> ShadowPaging<H> {
    /// Handles a VM exit on a write to `cr` (`MOV to CRn`, and for `CR0` also
    /// `CLTS` and `LMSW`).
    pub fn handle_cr_write<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        cr: ControlReg,
    ) -> AxResult {
        let instr = decode(vcpu)?;
        trace!("CR write exit on {:?}: {:?}", cr, instr);

        match (cr, instr.kind) {
            (ControlReg::Cr0, CtrlInstruction::Clts) => self.clts(),
            (ControlReg::Cr0, CtrlInstruction::Lmsw(operand)) => {
                let msw = read_msw(vcpu, operand)?;
                self.lmsw(msw);
            }
            (_, CtrlInstruction::MovToCr { cr: target, src }) if target == cr => {
                let val = read_gpr(vcpu, src, instr.operand_size);
                match cr {
                    ControlReg::Cr0 => self.write_cr0(vcpu, val)?,
                    ControlReg::Cr3 => self.write_cr3(vcpu, val)?,
                    ControlReg::Cr4 => {
                        if !self.write_cr4(vcpu, val)? {
                            return Ok(());
                        }
                    }
                    _ => return ax_err!(Unsupported, "CR write not intercepted"),
                }
            }
            (_, kind) => {
                error!("{:?} write exit on {:?}", cr, kind);
                return ax_err!(InvalidData, "instruction does not match CR exit");
            }
        }

        vcpu.advance_rip(instr.length)
    }

    /// Handles a VM exit on a read of `cr` (`MOV from CRn`, and for `CR0`
    /// also `SMSW`). The guest sees the values it wrote.
    pub fn handle_cr_read<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        cr: ControlReg,
    ) -> AxResult {
        let instr = decode(vcpu)?;
        trace!("CR read exit on {:?}: {:?}", cr, instr);

        match (cr, instr.kind) {
            (_, CtrlInstruction::MovFromCr { cr: target, dst }) if target == cr => {
                let val = match cr {
                    ControlReg::Cr0 => self.guest_cr0.bits(),
                    ControlReg::Cr3 => self.guest_cr3 as u64,
                    ControlReg::Cr4 => self.guest_cr4.bits(),
                    _ => return ax_err!(Unsupported, "CR read not intercepted"),
                };
                write_gpr(vcpu, dst, val);
            }
            (ControlReg::Cr0, CtrlInstruction::Smsw(Operand::Register(dst))) => {
                let val = if instr.operand_size == 2 {
                    let old = read_gpr(vcpu, dst, 8);
                    (old & !0xffff) | (self.guest_cr0.bits() & 0xffff)
                } else {
                    self.guest_cr0.bits()
                };
                write_gpr(vcpu, dst, val);
            }
            (ControlReg::Cr0, CtrlInstruction::Smsw(Operand::Memory(addr))) => {
                vcpu.write_guest_word(addr, self.guest_cr0.bits() as u16)?;
            }
            (_, kind) => {
                error!("{:?} read exit on {:?}", cr, kind);
                return ax_err!(InvalidData, "instruction does not match CR exit");
            }
        }

        vcpu.advance_rip(instr.length)
    }

    fn write_cr0<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V, val: u64) -> AxResult {
        let old_pg = self.guest_cr0.contains(Cr0Flags::PAGING);
        self.guest_cr0 = Cr0Flags::from_bits_truncate(val) | Cr0Flags::EXTENSION_TYPE;
        self.shadow_cr0 = Self::shadow_cr0_of(self.guest_cr0);
        let new_pg = self.guest_cr0.contains(Cr0Flags::PAGING);
        debug!(
            "guest CR0 <- {:?}, shadow CR0 {:?}",
            self.guest_cr0, self.shadow_cr0
        );

        if old_pg == new_pg {
            return Ok(());
        }

        if self.guest_efer.contains(EferFlags::LONG_MODE_ENABLE) {
            self.guest_efer.set(EferFlags::LONG_MODE_ACTIVE, new_pg);
            self.shadow_efer.set(EferFlags::LONG_MODE_ACTIVE, new_pg);
            self.shadow_cr4 = self.shadow_cr4_of(self.guest_cr4);
        }

        if new_pg {
            debug!("guest enables paging, CR3 {:#x}", self.guest_cr3);
            self.activate_shadow_pt(vcpu)
        } else {
            debug!("guest disables paging");
            self.activate_direct_map(vcpu);
            Ok(())
        }
    }

    fn write_cr3<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V, val: u64) -> AxResult {
        self.guest_cr3 = val as usize;
        debug!("guest CR3 <- {:#x}", self.guest_cr3);
        if self.mem_mode() == MemMode::Virtual {
            self.activate_shadow_pt(vcpu)?;
        }
        Ok(())
    }

    /// Returns `false` if the write was refused with a `#GP`.
    fn write_cr4<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V, val: u64) -> AxResult<bool> {
        let new_cr4 = Cr4Flags::from_bits_truncate(val);
        if self.guest_efer.contains(EferFlags::LONG_MODE_ACTIVE)
            && !new_cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)
        {
            warn!("guest clears CR4.PAE in long mode");
            vcpu.queue_event(GENERAL_PROTECTION_FAULT_VECTOR, Some(0));
            return Ok(false);
        }

        let old_cr4 = self.guest_cr4;
        self.guest_cr4 = new_cr4;
        self.shadow_cr4 = self.shadow_cr4_of(new_cr4);
        debug!(
            "guest CR4 <- {:?}, shadow CR4 {:?}",
            self.guest_cr4, self.shadow_cr4
        );

        if self.mem_mode() == MemMode::Virtual
            && (old_cr4 ^ new_cr4).intersects(CR4_PAGING_BITS)
        {
            self.activate_shadow_pt(vcpu)?;
        }
        Ok(true)
    }

    fn lmsw(&mut self, msw: u16) {
        let mut bits = Cr0Flags::from_bits_truncate(msw as u64) & MSW_BITS;
        // LMSW cannot leave protected mode.
        bits |= self.guest_cr0 & Cr0Flags::PROTECTED_MODE_ENABLE;
        self.guest_cr0 = (self.guest_cr0 - MSW_BITS) | bits;
        self.shadow_cr0 = (self.shadow_cr0 - MSW_BITS) | bits;
        debug!("LMSW {:#x}: guest CR0 {:?}", msw, self.guest_cr0);
    }

    fn clts(&mut self) {
        self.guest_cr0 -= Cr0Flags::TASK_SWITCHED;
        self.shadow_cr0 -= Cr0Flags::TASK_SWITCHED;
    }
}

fn decode<V: VcpuOps + ?Sized>(vcpu: &V) -> AxResult<DecodedInstr> {
    vcpu.decode_instruction().inspect_err(|err| {
        error!("failed to decode control instruction: {:?}", err);
    })
}
