//! Decoder for the control instructions intercepted by the shadow paging engine.
//!
//! Only `MOV to/from CRn`, `CLTS`, `LMSW`, `SMSW` and `INVLPG` are decoded into
//! operands. The generic instruction length calculator underneath handles the
//! legacy/REX prefixes and ModR/M, SIB, displacement and immediate bytes of
//! any instruction.

use axerrno::{AxError, AxResult, ax_err};
use numeric_enum_macro::numeric_enum;

use crate::addr::GuestVirtAddr;
use crate::regs::GeneralRegisters;

/// Maximum instruction length in x86-64 (15 bytes)
const MAX_INSTRUCTION_LENGTH: usize = 15;

/// The operating mode of a guest CPU, which decides default operand and
/// address sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCpuMode {
    Real,
    Protected,
    Compatibility,
    Mode64,
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Control registers reachable by `MOV to/from CRn`.
    pub enum ControlReg {
        Cr0 = 0,
        Cr2 = 2,
        Cr3 = 3,
        Cr4 = 4,
        Cr8 = 8,
    }
}

/// Legacy instruction prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyPrefix {
    /// Lock prefix (0xF0)
    Lock = 0xF0,
    /// REPNE/REPNZ prefix (0xF2)
    RepNe = 0xF2,
    /// REP/REPE/REPZ prefix (0xF3)
    Rep = 0xF3,
    /// CS segment override (0x2E)
    CsOverride = 0x2E,
    /// SS segment override (0x36)
    SsOverride = 0x36,
    /// DS segment override (0x3E)
    DsOverride = 0x3E,
    /// ES segment override (0x26)
    EsOverride = 0x26,
    /// FS segment override (0x64)
    FsOverride = 0x64,
    /// GS segment override (0x65)
    GsOverride = 0x65,
    /// Operand size override (0x66)
    OperandSizeOverride = 0x66,
    /// Address size override (0x67)
    AddressSizeOverride = 0x67,
}

/// REX prefix structure for 64-bit mode
#[derive(Debug, Clone, Copy, Default)]
pub struct RexPrefix {
    /// Extension of the ModRM reg field
    pub r: bool,
    /// Extension of the SIB index field
    pub x: bool,
    /// Extension of the ModRM r/m field, SIB base field, or Opcode reg field
    pub b: bool,
    /// 64-bit operand size
    pub w: bool,
}

impl RexPrefix {
    /// Parse REX prefix from byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0xF0 == 0x40 {
            Some(Self {
                w: (byte & 0x08) != 0,
                r: (byte & 0x04) != 0,
                x: (byte & 0x02) != 0,
                b: (byte & 0x01) != 0,
            })
        } else {
            None
        }
    }

    fn extend(flag: Option<bool>, field: u8) -> u8 {
        if flag.unwrap_or(false) { field | 0x8 } else { field }
    }
}

/// Instruction prefix information
#[derive(Debug, Clone, Default)]
pub struct PrefixInfo {
    /// Legacy prefixes found
    pub legacy_prefixes: [Option<LegacyPrefix>; 4],
    /// REX prefix (64-bit mode only)
    pub rex: Option<RexPrefix>,
    /// Total prefix length in bytes
    pub total_length: usize,
}

impl PrefixInfo {
    fn has(&self, prefix: LegacyPrefix) -> bool {
        self.legacy_prefixes.iter().any(|p| *p == Some(prefix))
    }
}

/// ModR/M byte structure
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    /// Mode field (2 bits)
    pub mode: u8,
    /// Register/opcode field (3 bits)
    pub reg: u8,
    /// R/M field (3 bits)
    pub rm: u8,
}

impl ModRm {
    /// Parse ModR/M from byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mode: (byte >> 6) & 0x03,
            reg: (byte >> 3) & 0x07,
            rm: byte & 0x07,
        }
    }

    /// Check if SIB byte is required
    pub fn needs_sib(&self, address_size: u8) -> bool {
        address_size != 2 && self.mode != 3 && self.rm == 4
    }

    /// Calculate displacement length in bytes
    pub fn displacement_length(&self, address_size: u8) -> usize {
        let full = if address_size == 2 { 2 } else { 4 };
        let direct_rm = if address_size == 2 { 6 } else { 5 };
        match self.mode {
            0 if self.rm == direct_rm => full,
            0 => 0,
            1 => 1,
            2 => full,
            _ => 0,
        }
    }
}

/// SIB (Scale-Index-Base) byte structure
#[derive(Debug, Clone, Copy)]
pub struct Sib {
    /// Scale field (2 bits)
    pub scale: u8,
    /// Index field (3 bits)
    pub index: u8,
    /// Base field (3 bits)
    pub base: u8,
}

impl Sib {
    /// Parse SIB from byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            scale: (byte >> 6) & 0x03,
            index: (byte >> 3) & 0x07,
            base: byte & 0x07,
        }
    }

    /// Check if the base is replaced by a 32-bit displacement
    pub fn needs_displacement(&self, modrm: &ModRm) -> bool {
        self.base == 5 && modrm.mode == 0
    }
}

/// Instruction operand size and address size information
#[derive(Debug, Clone, Copy)]
pub struct SizeInfo {
    /// Operand size in bytes (1, 2, 4, or 8)
    pub operand_size: u8,
    /// Address size in bytes (2, 4, or 8)
    pub address_size: u8,
}

impl SizeInfo {
    /// Calculate sizes based on CPU mode and prefixes
    pub fn calculate(cpu_mode: VmCpuMode, prefix_info: &PrefixInfo) -> Self {
        let (default_operand, default_address) = match cpu_mode {
            VmCpuMode::Real => (2, 2),
            VmCpuMode::Protected | VmCpuMode::Compatibility => (4, 4),
            VmCpuMode::Mode64 => (4, 8),
        };

        let mut operand_size = default_operand;
        let mut address_size = default_address;

        if prefix_info.has(LegacyPrefix::OperandSizeOverride) {
            operand_size = if default_operand == 2 { 4 } else { 2 };
        }

        if prefix_info.has(LegacyPrefix::AddressSizeOverride) {
            address_size = match cpu_mode {
                VmCpuMode::Mode64 => 4,
                _ if default_address == 2 => 4,
                _ => 2,
            };
        }

        // REX.W overrides operand size to 64-bit in long mode
        if let Some(rex) = prefix_info.rex {
            if rex.w && cpu_mode == VmCpuMode::Mode64 {
                operand_size = 8;
            }
        }

        Self {
            operand_size,
            address_size,
        }
    }
}

/// Parse instruction prefixes
fn parse_prefixes(bytes: &[u8], cpu_mode: VmCpuMode) -> PrefixInfo {
    let mut info = PrefixInfo::default();
    let mut pos = 0;

    let mut legacy_count = 0;
    while pos < bytes.len() && legacy_count < 4 {
        let prefix = match bytes[pos] {
            0xF0 => LegacyPrefix::Lock,
            0xF2 => LegacyPrefix::RepNe,
            0xF3 => LegacyPrefix::Rep,
            0x2E => LegacyPrefix::CsOverride,
            0x36 => LegacyPrefix::SsOverride,
            0x3E => LegacyPrefix::DsOverride,
            0x26 => LegacyPrefix::EsOverride,
            0x64 => LegacyPrefix::FsOverride,
            0x65 => LegacyPrefix::GsOverride,
            0x66 => LegacyPrefix::OperandSizeOverride,
            0x67 => LegacyPrefix::AddressSizeOverride,
            _ => break,
        };
        info.legacy_prefixes[legacy_count] = Some(prefix);
        legacy_count += 1;
        pos += 1;
    }

    // 0x40..=0x4F are INC/DEC outside of 64-bit mode.
    if cpu_mode == VmCpuMode::Mode64 && pos < bytes.len() {
        if let Some(rex) = RexPrefix::from_byte(bytes[pos]) {
            info.rex = Some(rex);
            pos += 1;
        }
    }

    info.total_length = pos;
    info
}

/// Calculate instruction length using lightweight x86-64 decoder
pub fn calculate_instruction_length(
    instruction_bytes: &[u8],
    cpu_mode: VmCpuMode,
) -> AxResult<usize> {
    if instruction_bytes.is_empty() || instruction_bytes.len() > MAX_INSTRUCTION_LENGTH {
        return ax_err!(InvalidInput, "bad instruction buffer length");
    }

    let prefix_info = parse_prefixes(instruction_bytes, cpu_mode);
    let size_info = SizeInfo::calculate(cpu_mode, &prefix_info);
    let mut pos = prefix_info.total_length;

    let byte_at = |pos: usize| {
        instruction_bytes
            .get(pos)
            .copied()
            .ok_or(AxError::InvalidInput)
    };

    let mut opcode = byte_at(pos)?;
    pos += 1;

    let is_two_byte_opcode = opcode == 0x0F;
    if is_two_byte_opcode {
        opcode = byte_at(pos)?;
        pos += 1;
    }

    if instruction_needs_modrm(opcode, is_two_byte_opcode) {
        let modrm = ModRm::from_byte(byte_at(pos)?);
        pos += 1;

        let mut displacement_length = modrm.displacement_length(size_info.address_size);
        if modrm.needs_sib(size_info.address_size) {
            let sib = Sib::from_byte(byte_at(pos)?);
            pos += 1;
            if sib.needs_displacement(&modrm) {
                displacement_length = 4;
            }
        }
        pos += displacement_length;
        pos += calculate_immediate_length(opcode, is_two_byte_opcode, &size_info, Some(&modrm));
    } else {
        pos += calculate_immediate_length(opcode, is_two_byte_opcode, &size_info, None);
    }

    if pos > MAX_INSTRUCTION_LENGTH {
        return ax_err!(InvalidInput, "instruction too long");
    }

    Ok(pos)
}

/// Check if opcode requires ModR/M byte
fn instruction_needs_modrm(opcode: u8, is_two_byte: bool) -> bool {
    if is_two_byte {
        !matches!(
            opcode,
            0x05..=0x09 // SYSCALL, CLTS, SYSRET, INVD, WBINVD
                | 0x0B // UD2
                | 0x30..=0x37 // WRMSR, RDTSC, RDMSR, RDPMC, SYSENTER, SYSEXIT, GETSEC
                | 0x77 // EMMS
                | 0x80..=0x8F // Jcc rel
                | 0xA0..=0xA2 // PUSH/POP FS, CPUID
                | 0xA8..=0xAA // PUSH/POP GS, RSM
                | 0xC8..=0xCF // BSWAP
        )
    } else {
        match opcode {
            0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => false, // PUSH/POP segment registers
            0x04 | 0x05 | 0x0C | 0x0D | 0x14 | 0x15 | 0x1C | 0x1D => false, // ALU with accumulator
            0x24 | 0x25 | 0x2C | 0x2D | 0x34 | 0x35 | 0x3C | 0x3D => false,
            0x27 | 0x2F | 0x37 | 0x3F => false, // DAA, DAS, AAA, AAS
            0x40..=0x4F => false, // INC/DEC in 32-bit mode
            0x50..=0x5F => false, // PUSH/POP general registers
            0x60 | 0x61 => false, // PUSHA/POPA
            0x68 | 0x6A => false, // PUSH imm
            0x6C..=0x6F => false, // INS/OUTS
            0x70..=0x7F => false, // Short conditional jumps
            0x90..=0x9F => false, // NOP, XCHG, CBW, CWD, etc.
            0xA0..=0xAF => false, // MOV moffs, string ops, TEST imm
            0xB0..=0xBF => false, // MOV immediate to register
            0xC2 | 0xC3 | 0xC8 | 0xC9 | 0xCA | 0xCB => false, // RET, ENTER, LEAVE
            0xCC..=0xCF => false, // INT, IRET
            0xD4 | 0xD5 => false, // AAM, AAD
            0xE0..=0xEF => false, // LOOP, JCXZ, IN, OUT, CALL, JMP
            0xF1 | 0xF4 | 0xF5 | 0xF8..=0xFD => false, // Single-byte instructions
            _ => true,
        }
    }
}

/// Calculate immediate operand length
fn calculate_immediate_length(
    opcode: u8,
    is_two_byte: bool,
    size_info: &SizeInfo,
    modrm: Option<&ModRm>,
) -> usize {
    let imm_z = if size_info.operand_size == 2 { 2 } else { 4 };

    if is_two_byte {
        return match opcode {
            0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
            0x80..=0x8F => imm_z,
            _ => 0,
        };
    }

    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1, // ALU ops with AL
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => imm_z, // ALU ops with EAX
        0x6A | 0x6B => 1,                                           // PUSH imm8, IMUL imm8
        0x68 | 0x69 => imm_z,                                       // PUSH imm, IMUL imm
        0x70..=0x7F => 1,                                           // Short conditional jumps
        0x80 | 0x82 | 0x83 => 1,                                    // ALU ops with imm8
        0x81 => imm_z,                                              // ALU ops with imm
        0xA0..=0xA3 => size_info.address_size as usize,             // MOV moffs
        0xA8 => 1,                                                  // TEST AL, imm8
        0xA9 => imm_z,                                              // TEST EAX, imm
        0xB0..=0xB7 => 1,                                           // MOV reg8, imm8
        0xB8..=0xBF => size_info.operand_size as usize,             // MOV reg, imm
        0xC0 | 0xC1 | 0xC6 => 1,                                    // Shift imm8, MOV r/m8 imm8
        0xC7 => imm_z,                                              // MOV r/m, imm
        0xC2 | 0xCA => 2,                                           // RET imm16
        0xC8 => 3,                                                  // ENTER
        0xCD | 0xD4 | 0xD5 => 1,                                    // INT, AAM, AAD
        0xE0..=0xE7 | 0xEB => 1,                                    // LOOP, JCXZ, IN/OUT, JMP short
        0xE8 | 0xE9 => imm_z,                                       // CALL/JMP relative
        // TEST r/m, imm is the only F6/F7 group member with an immediate.
        0xF6 if modrm.is_some_and(|m| m.reg < 2) => 1,
        0xF7 if modrm.is_some_and(|m| m.reg < 2) => imm_z,
        _ => 0,
    }
}

/// An operand of `LMSW`/`SMSW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A general-purpose register, by its encoding.
    Register(u8),
    /// A memory word at the given linear address.
    Memory(GuestVirtAddr),
}

/// A decoded control instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlInstruction {
    /// `MOV CRn, reg`
    MovToCr { cr: ControlReg, src: u8 },
    /// `MOV reg, CRn`
    MovFromCr { cr: ControlReg, dst: u8 },
    Lmsw(Operand),
    Smsw(Operand),
    Clts,
    /// `INVLPG m`, with the linear address of `m`.
    Invlpg(GuestVirtAddr),
}

/// The result of decoding the instruction at guest `RIP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstr {
    pub kind: CtrlInstruction,
    /// Length of the instruction in bytes.
    pub length: u8,
    /// Operand size in bytes.
    pub operand_size: u8,
}

fn gpr_value(regs: &GeneralRegisters, rsp: u64, index: u8) -> u64 {
    if index == GeneralRegisters::RSP_INDEX {
        rsp
    } else {
        regs.get_reg_of_index(index)
    }
}

/// Decodes one control instruction from `bytes`.
///
/// `regs` and `rsp` are used to compute memory operands, `rip` is the address
/// of the instruction (for RIP-relative forms) and `seg_base` the base of the
/// data segment in effect.
pub fn decode_ctrl_instruction(
    bytes: &[u8],
    cpu_mode: VmCpuMode,
    regs: &GeneralRegisters,
    rsp: u64,
    rip: u64,
    seg_base: u64,
) -> AxResult<DecodedInstr> {
    let bytes = &bytes[..bytes.len().min(MAX_INSTRUCTION_LENGTH)];
    let prefix_info = parse_prefixes(bytes, cpu_mode);
    let size_info = SizeInfo::calculate(cpu_mode, &prefix_info);
    let pos = prefix_info.total_length;
    let rex = prefix_info.rex;

    let (escape, opcode) = match bytes.get(pos..pos + 2) {
        Some(&[escape, opcode]) => (escape, opcode),
        _ => return ax_err!(InvalidInput, "truncated instruction"),
    };
    if escape != 0x0F {
        return ax_err!(InvalidData, "not a control instruction");
    }

    let modrm = bytes.get(pos + 2).copied().map(ModRm::from_byte);
    let (kind, length) = match (opcode, modrm) {
        (0x06, _) => (CtrlInstruction::Clts, pos + 2),
        // MOV to/from CRn always uses the register form, whatever `mod` says.
        (0x20 | 0x22, Some(modrm)) => {
            let cr_num = RexPrefix::extend(rex.map(|r| r.r), modrm.reg);
            let cr = ControlReg::try_from(cr_num)
                .or_else(|_| ax_err!(InvalidData, "invalid control register"))?;
            let gpr = RexPrefix::extend(rex.map(|r| r.b), modrm.rm);
            let kind = if opcode == 0x20 {
                CtrlInstruction::MovFromCr { cr, dst: gpr }
            } else {
                CtrlInstruction::MovToCr { cr, src: gpr }
            };
            (kind, pos + 3)
        }
        (0x01, Some(modrm)) if matches!(modrm.reg, 4 | 6 | 7) => {
            let length = calculate_instruction_length(bytes, cpu_mode)?;
            let operand = if modrm.mode == 3 {
                Operand::Register(RexPrefix::extend(rex.map(|r| r.b), modrm.rm))
            } else {
                let next_rip = rip.wrapping_add(length as u64);
                let ea = effective_address(
                    &bytes[pos + 3..],
                    cpu_mode,
                    &modrm,
                    rex,
                    size_info.address_size,
                    regs,
                    rsp,
                    next_rip,
                )?;
                let linear = match cpu_mode {
                    VmCpuMode::Mode64 => ea.wrapping_add(seg_base),
                    _ => ea.wrapping_add(seg_base) & 0xffff_ffff,
                };
                Operand::Memory(GuestVirtAddr::from_usize(linear as usize))
            };
            let kind = match (modrm.reg, operand) {
                (4, op) => CtrlInstruction::Smsw(op),
                (6, op) => CtrlInstruction::Lmsw(op),
                (_, Operand::Memory(addr)) => CtrlInstruction::Invlpg(addr),
                // 0F 01 F8/F9 are SWAPGS and RDTSCP.
                (_, Operand::Register(_)) => {
                    return ax_err!(Unsupported, "not an INVLPG instruction");
                }
            };
            (kind, length)
        }
        _ => return ax_err!(Unsupported, "unsupported control instruction"),
    };

    if length > bytes.len() {
        return ax_err!(InvalidInput, "truncated instruction");
    }

    Ok(DecodedInstr {
        kind,
        length: length as u8,
        operand_size: match (cpu_mode, kind) {
            (
                VmCpuMode::Mode64,
                CtrlInstruction::MovToCr { .. } | CtrlInstruction::MovFromCr { .. },
            ) => 8,
            _ => size_info.operand_size,
        },
    })
}

/// Computes the effective address of a ModR/M memory operand. `bytes` starts
/// right after the ModR/M byte.
#[allow(clippy::too_many_arguments)]
fn effective_address(
    bytes: &[u8],
    cpu_mode: VmCpuMode,
    modrm: &ModRm,
    rex: Option<RexPrefix>,
    address_size: u8,
    regs: &GeneralRegisters,
    rsp: u64,
    next_rip: u64,
) -> AxResult<u64> {
    if address_size == 2 {
        return ax_err!(Unsupported, "16-bit addressing");
    }

    let mut pos = 0;
    let mut base = None;
    let mut index = None;
    let mut scale = 0;
    let mut rip_relative = false;

    if modrm.needs_sib(address_size) {
        let sib = Sib::from_byte(*bytes.first().ok_or(AxError::InvalidInput)?);
        pos += 1;
        let index_reg = RexPrefix::extend(rex.map(|r| r.x), sib.index);
        if index_reg != 4 {
            index = Some(index_reg);
            scale = sib.scale;
        }
        if !sib.needs_displacement(modrm) {
            base = Some(RexPrefix::extend(rex.map(|r| r.b), sib.base));
        }
    } else if modrm.mode == 0 && modrm.rm == 5 {
        rip_relative = cpu_mode == VmCpuMode::Mode64;
    } else {
        base = Some(RexPrefix::extend(rex.map(|r| r.b), modrm.rm));
    }

    let disp_len = match modrm.mode {
        1 => 1,
        2 => 4,
        _ if base.is_none() => 4,
        _ => 0,
    };
    let disp_bytes = bytes
        .get(pos..pos + disp_len)
        .ok_or(AxError::InvalidInput)?;
    let disp = match *disp_bytes {
        [] => 0,
        [b] => b as i8 as i64,
        [b0, b1, b2, b3] => i32::from_le_bytes([b0, b1, b2, b3]) as i64,
        _ => unreachable!(),
    };

    let mut ea = disp as u64;
    if rip_relative {
        ea = ea.wrapping_add(next_rip);
    }
    if let Some(base) = base {
        ea = ea.wrapping_add(gpr_value(regs, rsp, base));
    }
    if let Some(index) = index {
        ea = ea.wrapping_add(gpr_value(regs, rsp, index) << scale);
    }

    Ok(if address_size == 4 {
        ea & 0xffff_ffff
    } else {
        ea
    })
}
