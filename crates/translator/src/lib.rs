//! Lowers a decoded ARM64 instruction stream into bytecode opcodes.
//!
//! [`CapstoneDisassembler`] turns raw machine code into [`DecodedInsn`]s;
//! [`LowerCx`] walks them and emits opcode/register/type words through the
//! per-domain `lower_*_case` functions, mirroring the split the original
//! translator used between arithmetic, logic, memory and branch handling.

use std::collections::HashMap;

use capstone::arch::arm64::{Arm64CC, Arm64OperandType, Arm64Reg, Arm64Shift};
use capstone::arch::{arm64, ArchDetail, ArchOperand};
use capstone::prelude::*;
use thiserror::Error;
use vmforge_types::opcode::*;
use vmforge_types::Type;

/// Marks an `OP_BRANCH_IF_CC` operand word as a condition-code test rather
/// than a TBZ/TBNZ bit-index test; no real bit index reaches this value.
pub const CC_TEST_SENTINEL: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("capstone error: {0}")]
    Capstone(#[from] capstone::Error),
    #[error("at {address:#x} ({mnemonic}): {reason}")]
    Lowering {
        address: u64,
        mnemonic: String,
        reason: String,
    },
    #[error(transparent)]
    Types(#[from] vmforge_types::Error),
    #[error(transparent)]
    Encoding(#[from] vmforge_function::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn lowering(address: u64, mnemonic: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Lowering {
            address,
            mnemonic: mnemonic.into(),
            reason: reason.into(),
        }
    }
}

/// One decoded instruction: address, raw bytes, the mnemonic/operand text a
/// disassembler produced for it, and the already-resolved operand list and
/// condition code `lower_one` dispatches on. Kept deliberately flat (no
/// disassembler-specific handle) so lowering logic and tests don't depend on
/// which `Disassembler` produced it.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    pub address: u64,
    pub raw_bytes: Vec<u8>,
    pub length: u32,
    pub mnemonic: String,
    pub op_str: String,
    pub operands: Vec<Operand>,
    /// Condition code for `CSEL`/`CSINC`/`CSINV`/`CSET`, e.g. `"EQ"`.
    /// Branch mnemonics instead carry their condition in the mnemonic text
    /// itself (`"B.EQ"`), which `lower_branch_case` parses directly.
    pub cond_code: Option<String>,
}

/// A source of decoded instructions. The only implementation shipped here
/// wraps Capstone; the trait exists so lowering logic and tests don't need
/// a live disassembler.
pub trait Disassembler {
    fn disassemble(&self, code: &[u8], address: u64) -> Result<Vec<DecodedInsn>>;
}

pub struct CapstoneDisassembler {
    cs: Capstone,
}

impl CapstoneDisassembler {
    pub fn new() -> Result<Self> {
        let cs = Capstone::new()
            .arm64()
            .mode(arm64::ArchMode::Arm)
            .detail(true)
            .build()?;
        Ok(Self { cs })
    }
}

impl Disassembler for CapstoneDisassembler {
    fn disassemble(&self, code: &[u8], address: u64) -> Result<Vec<DecodedInsn>> {
        let insns = self.cs.disasm_all(code, address)?;
        let mut out = Vec::with_capacity(insns.len());
        for insn in insns.iter() {
            let (operands, cond_code) = match self.cs.insn_detail(insn) {
                Ok(detail) => match detail.arch_detail() {
                    ArchDetail::Arm64Detail(d) => {
                        let ops: Vec<ArchOperand> = d.operands().collect();
                        (decode_operands(&ops), arm64_cc_to_str(d.cc()))
                    }
                    _ => (Vec::new(), None),
                },
                Err(_) => (Vec::new(), None),
            };
            out.push(DecodedInsn {
                address: insn.address(),
                raw_bytes: insn.bytes().to_vec(),
                length: insn.len() as u32,
                mnemonic: insn.mnemonic().unwrap_or_default().to_ascii_uppercase(),
                op_str: insn.op_str().unwrap_or_default().to_string(),
                operands,
                cond_code: cond_code.map(str::to_string),
            });
        }
        Ok(out)
    }
}

/// Maps Capstone's AArch64 condition-code enum to the short mnemonics
/// `cond_code_value` understands. `Invalid`/`AL`/`NV` carry no real
/// condition (an unconditional instruction), so they resolve to `None`
/// rather than a fabricated code.
fn arm64_cc_to_str(cc: Arm64CC) -> Option<&'static str> {
    use Arm64CC::*;
    Some(match cc {
        ARM64_CC_EQ => "EQ",
        ARM64_CC_NE => "NE",
        ARM64_CC_HS => "HS",
        ARM64_CC_LO => "LO",
        ARM64_CC_MI => "MI",
        ARM64_CC_PL => "PL",
        ARM64_CC_VS => "VS",
        ARM64_CC_VC => "VC",
        ARM64_CC_HI => "HI",
        ARM64_CC_LS => "LS",
        ARM64_CC_GE => "GE",
        ARM64_CC_LT => "LT",
        ARM64_CC_GT => "GT",
        ARM64_CC_LE => "LE",
        ARM64_CC_INVALID | ARM64_CC_AL | ARM64_CC_NV => return None,
    })
}

/// Which per-category lowering path a mnemonic belongs to, mirroring the
/// original translator's four-way arith/logic/memory/branch split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnDomain {
    Arith,
    Logic,
    Memory,
    Branch,
    Misc,
}

impl InsnDomain {
    pub fn classify(mnemonic: &str) -> Self {
        match mnemonic {
            "ADD" | "ADDS" | "SUB" | "SUBS" | "MUL" | "MADD" | "MSUB" | "SMULL" | "UMULL"
            | "SMADDL" | "UMADDL" | "SMULH" | "UMULH" | "SDIV" | "UDIV" => InsnDomain::Arith,
            "AND" | "ANDS" | "ORR" | "EOR" | "EON" | "ORN" | "BIC" | "BICS" | "MOV" | "MOVZ"
            | "MOVN" | "MOVK" | "LSL" | "LSR" | "ASR" | "ROR" | "CLZ" | "SXTB" | "SXTH"
            | "SXTW" | "UXTB" | "UXTH" | "UBFM" | "SBFM" | "UBFX" | "SBFX" | "UBFIZ"
            | "SBFIZ" | "EXTR" | "REV" | "REV16" => InsnDomain::Logic,
            "LDR" | "LDRB" | "LDRH" | "LDRSB" | "LDRSH" | "LDRSW" | "STR" | "STRB" | "STRH"
            | "LDP" | "STP" | "LDAR" | "LDARB" | "LDARH" | "LDAXR" | "LDXR" | "STLR"
            | "STLRB" | "STLRH" | "STLXR" | "STXR" => InsnDomain::Memory,
            "B" | "BL" | "BLR" | "BR" | "RET" | "CBZ" | "CBNZ" | "TBZ" | "TBNZ" | "CSEL"
            | "CSINC" | "CSINV" | "CSET" => InsnDomain::Branch,
            m if m.starts_with("B.") => InsnDomain::Branch,
            _ => InsnDomain::Misc,
        }
    }
}

/// Mutable lowering state threaded through every `lower_*` call: the
/// register/type id tables being interned into, the opcode stream being
/// built, and the branch bookkeeping needed to patch local jump targets
/// once every instruction's VM program counter is known.
#[derive(Debug, Default)]
pub struct LowerCx {
    pub reg_ids: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub opcodes: Vec<u32>,
    /// Host address -> index into `branch_addrs` for local branches
    /// (`B`/`B.cond`/`CBZ`/`CBNZ`/`TBZ`/`TBNZ`) whose target is resolved
    /// after the whole function is lowered.
    pub branch_addrs: Vec<u64>,
    /// Call targets collected from `BL`, resolved against the function's
    /// shared branch-address table at link time.
    pub call_targets: Vec<u64>,
    /// address -> emitted opcode-stream index, built incrementally so
    /// local branch targets can be rewritten to VM program counters in a
    /// single post-pass.
    pub addr_to_pc: HashMap<u64, u32>,
}

impl LowerCx {
    pub fn new() -> Self {
        let mut cx = Self::default();
        // x0..x30 are pre-registered in canonical order so parameter and
        // return registers land at fixed, predictable slot indices.
        for i in 0..31u32 {
            cx.reg_ids.push(i);
        }
        cx
    }

    pub fn get_or_add_reg(&mut self, canonical: u32) -> u32 {
        if let Some(pos) = self.reg_ids.iter().position(|&r| r == canonical) {
            pos as u32
        } else {
            self.reg_ids.push(canonical);
            (self.reg_ids.len() - 1) as u32
        }
    }

    pub fn get_or_add_type(&mut self, ty: Type) -> u32 {
        vmforge_types::TypeManager::intern(&mut self.type_ids, ty)
    }

    pub fn get_or_add_branch(&mut self, target: u64) -> u32 {
        if let Some(pos) = self.branch_addrs.iter().position(|&a| a == target) {
            pos as u32
        } else {
            self.branch_addrs.push(target);
            (self.branch_addrs.len() - 1) as u32
        }
    }

    fn emit(&mut self, word: u32) {
        self.opcodes.push(word);
    }

    /// Minimum register file size: the fixed x0..x30 table plus whatever
    /// temporaries lowering interned past it.
    pub fn register_count(&self) -> u32 {
        self.reg_ids.len().max(4) as u32
    }
}

/// Canonical register index space: x0..x30 map to 0..30, sp/wsp to 31,
/// xzr/wzr are handled specially by callers (never interned as a live
/// register — reads materialize a zero, writes are dropped).
pub fn capstone_reg_to_canonical(reg: Arm64Reg) -> Option<u32> {
    use Arm64Reg::*;
    let idx = match reg {
        ARM64_REG_X0 | ARM64_REG_W0 => 0,
        ARM64_REG_X1 | ARM64_REG_W1 => 1,
        ARM64_REG_X2 | ARM64_REG_W2 => 2,
        ARM64_REG_X3 | ARM64_REG_W3 => 3,
        ARM64_REG_X4 | ARM64_REG_W4 => 4,
        ARM64_REG_X5 | ARM64_REG_W5 => 5,
        ARM64_REG_X6 | ARM64_REG_W6 => 6,
        ARM64_REG_X7 | ARM64_REG_W7 => 7,
        ARM64_REG_X8 | ARM64_REG_W8 => 8,
        ARM64_REG_X9 | ARM64_REG_W9 => 9,
        ARM64_REG_X10 | ARM64_REG_W10 => 10,
        ARM64_REG_X11 | ARM64_REG_W11 => 11,
        ARM64_REG_X12 | ARM64_REG_W12 => 12,
        ARM64_REG_X13 | ARM64_REG_W13 => 13,
        ARM64_REG_X14 | ARM64_REG_W14 => 14,
        ARM64_REG_X15 | ARM64_REG_W15 => 15,
        ARM64_REG_X16 | ARM64_REG_W16 => 16,
        ARM64_REG_X17 | ARM64_REG_W17 => 17,
        ARM64_REG_X18 | ARM64_REG_W18 => 18,
        ARM64_REG_X19 | ARM64_REG_W19 => 19,
        ARM64_REG_X20 | ARM64_REG_W20 => 20,
        ARM64_REG_X21 | ARM64_REG_W21 => 21,
        ARM64_REG_X22 | ARM64_REG_W22 => 22,
        ARM64_REG_X23 | ARM64_REG_W23 => 23,
        ARM64_REG_X24 | ARM64_REG_W24 => 24,
        ARM64_REG_X25 | ARM64_REG_W25 => 25,
        ARM64_REG_X26 | ARM64_REG_W26 => 26,
        ARM64_REG_X27 | ARM64_REG_W27 => 27,
        ARM64_REG_X28 | ARM64_REG_W28 => 28,
        ARM64_REG_X29 | ARM64_REG_W29 | ARM64_REG_FP => 29,
        ARM64_REG_X30 | ARM64_REG_W30 | ARM64_REG_LR => 30,
        ARM64_REG_SP | ARM64_REG_WSP => 31,
        _ => return None,
    };
    Some(idx)
}

pub fn is_w_reg(reg: Arm64Reg) -> bool {
    use Arm64Reg::*;
    matches!(
        reg,
        ARM64_REG_W0
            | ARM64_REG_W1
            | ARM64_REG_W2
            | ARM64_REG_W3
            | ARM64_REG_W4
            | ARM64_REG_W5
            | ARM64_REG_W6
            | ARM64_REG_W7
            | ARM64_REG_W8
            | ARM64_REG_W9
            | ARM64_REG_W10
            | ARM64_REG_W11
            | ARM64_REG_W12
            | ARM64_REG_W13
            | ARM64_REG_W14
            | ARM64_REG_W15
            | ARM64_REG_W16
            | ARM64_REG_W17
            | ARM64_REG_W18
            | ARM64_REG_W19
            | ARM64_REG_W20
            | ARM64_REG_W21
            | ARM64_REG_W22
            | ARM64_REG_W23
            | ARM64_REG_W24
            | ARM64_REG_W25
            | ARM64_REG_W26
            | ARM64_REG_W27
            | ARM64_REG_W28
            | ARM64_REG_W29
            | ARM64_REG_W30
            | ARM64_REG_WSP
            | ARM64_REG_WZR
    )
}

pub fn is_zero_reg(reg: Arm64Reg) -> bool {
    matches!(reg, Arm64Reg::ARM64_REG_XZR | Arm64Reg::ARM64_REG_WZR)
}

/// A resolved general-purpose register operand, already reduced to the
/// canonical index space. `is_zero` covers `xzr`/`wzr`, which never occupy
/// a register slot: reads synthesize 0, writes are no-ops.
#[derive(Debug, Clone, Copy)]
pub struct GpReg {
    pub canonical: u32,
    pub is_32_bit: bool,
    pub is_zero: bool,
}

impl GpReg {
    pub fn from_capstone(reg: Arm64Reg) -> Option<Self> {
        if is_zero_reg(reg) {
            return Some(Self {
                canonical: u32::MAX,
                is_32_bit: is_w_reg(reg),
                is_zero: true,
            });
        }
        capstone_reg_to_canonical(reg).map(|canonical| Self {
            canonical,
            is_32_bit: is_w_reg(reg),
            is_zero: false,
        })
    }
}

/// Emits `OP_LOAD_IMM` materializing `dst = imm`, widened to a 64-bit
/// payload the engine narrows per the destination's type tag.
pub fn emit_load_imm(cx: &mut LowerCx, dst: u32, imm: i64) {
    cx.emit(OP_LOAD_IMM);
    cx.emit(dst);
    cx.emit(imm as u32);
    cx.emit((imm >> 32) as u32);
}

/// Emits a move from `src` into `dst`, or a zero-materializing load when
/// `src` is `xzr`/`wzr` — the `OP_MOV` stream never carries a zero-register
/// operand since the VM has no such register.
pub fn emit_assign_reg_or_zero(cx: &mut LowerCx, dst: u32, src: GpReg) {
    if src.is_zero {
        emit_load_imm(cx, dst, 0);
    } else {
        let src_idx = cx.get_or_add_reg(src.canonical);
        cx.emit(OP_MOV);
        cx.emit(dst);
        cx.emit(src_idx);
    }
}

fn reg_type(cx: &mut LowerCx, r: GpReg, unsigned: bool) -> u32 {
    cx.get_or_add_type(Type::for_register_width(r.is_32_bit, unsigned))
}

/// Operands resolved from a capstone instruction's detail, reduced to the
/// subset lowering needs: registers (with zero-register awareness),
/// immediates, and memory references.
#[derive(Debug, Clone)]
pub enum Operand {
    Reg(GpReg),
    Imm(i64),
    Mem { base: GpReg, disp: i64 },
}

pub fn decode_operands(ops: &[ArchOperand]) -> Vec<Operand> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let ArchOperand::Arm64Operand(op) = op else {
            continue;
        };
        match op.op_type {
            Arm64OperandType::Reg(r) => {
                if let Some(g) = GpReg::from_capstone(r) {
                    out.push(Operand::Reg(g));
                }
            }
            Arm64OperandType::Imm(i) => out.push(Operand::Imm(i)),
            Arm64OperandType::Mem(mem) => {
                if let Some(base) = GpReg::from_capstone(mem.base()) {
                    out.push(Operand::Mem {
                        base,
                        disp: mem.disp() as i64,
                    });
                }
            }
            _ => {}
        }
    }
    out
}

fn as_reg(op: &Operand) -> Option<GpReg> {
    match op {
        Operand::Reg(r) => Some(*r),
        _ => None,
    }
}

fn as_imm(op: &Operand) -> Option<i64> {
    match op {
        Operand::Imm(i) => Some(*i),
        _ => None,
    }
}

/// Lowers a single decoded instruction, dispatching to the category
/// matching `InsnDomain::classify`. Unrecognized mnemonics within a known
/// domain lower to `OP_NOP` rather than erroring, since an ARM64 function
/// body routinely contains instructions (floating point, SIMD, barriers)
/// this translator's scope deliberately excludes; an error is reserved for
/// operand shapes that would otherwise corrupt the opcode stream.
pub fn lower_one(
    cx: &mut LowerCx,
    insn: &DecodedInsn,
    ops: &[Operand],
    cond_code: Option<&str>,
) -> Result<()> {
    cx.addr_to_pc.insert(insn.address, cx.opcodes.len() as u32);
    match InsnDomain::classify(&insn.mnemonic) {
        InsnDomain::Arith => lower_arith_case(cx, insn, ops),
        InsnDomain::Logic => lower_logic_case(cx, insn, ops),
        InsnDomain::Memory => lower_memory_case(cx, insn, ops),
        InsnDomain::Branch => lower_branch_case(cx, insn, ops, cond_code),
        InsnDomain::Misc => lower_misc_case(cx, insn, ops),
    }
}

fn binary_op(cx: &mut LowerCx, kind: u32, dst: u32, lhs: u32, rhs: u32, ty: u32, flags: bool) {
    cx.emit(OP_BINARY | if flags { BIN_UPDATE_FLAGS } else { 0 });
    cx.emit(kind);
    cx.emit(dst);
    cx.emit(lhs);
    cx.emit(rhs);
    cx.emit(ty);
}

fn unary_op(cx: &mut LowerCx, kind: u32, dst: u32, src: u32, ty: u32) {
    cx.emit(OP_UNARY);
    cx.emit(kind);
    cx.emit(dst);
    cx.emit(src);
    cx.emit(ty);
}

fn lower_arith_case(cx: &mut LowerCx, insn: &DecodedInsn, ops: &[Operand]) -> Result<()> {
    let dst = as_reg(ops.first().ok_or_else(|| {
        Error::lowering(insn.address, &insn.mnemonic, "missing destination operand")
    })?)
    .ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "destination is not a register"))?;
    let dst_idx = cx.get_or_add_reg(dst.canonical);
    let ty = reg_type(cx, dst, false);

    let bin = |m: &str| -> Option<u32> {
        Some(match m {
            "ADD" | "ADDS" => BIN_ADD,
            "SUB" | "SUBS" => BIN_SUB,
            "MUL" | "MADD" => BIN_MUL,
            "SDIV" => BIN_IDIV,
            "UDIV" => BIN_DIV,
            _ => return None,
        })
    };

    if let Some(kind) = bin(&insn.mnemonic) {
        let flags = insn.mnemonic.ends_with('S') && insn.mnemonic != "MUL" && insn.mnemonic != "SDIV" && insn.mnemonic != "UDIV";
        let lhs = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "lhs not a register"))?;
        let lhs_idx = cx.get_or_add_reg(lhs.canonical);

        if insn.mnemonic == "MADD" {
            // dst = (lhs * rhs) + addend, addend is ops[3].
            let rhs = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "rhs not a register"))?;
            let rhs_idx = cx.get_or_add_reg(rhs.canonical);
            let add = as_reg(&ops[3]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "addend not a register"))?;
            let add_idx = cx.get_or_add_reg(add.canonical);
            binary_op(cx, BIN_MUL, dst_idx, lhs_idx, rhs_idx, ty, false);
            binary_op(cx, BIN_ADD, dst_idx, dst_idx, add_idx, ty, false);
            return Ok(());
        }
        if insn.mnemonic == "MSUB" {
            let rhs = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "rhs not a register"))?;
            let rhs_idx = cx.get_or_add_reg(rhs.canonical);
            let minuend = as_reg(&ops[3]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "minuend not a register"))?;
            let minuend_idx = cx.get_or_add_reg(minuend.canonical);
            binary_op(cx, BIN_MUL, dst_idx, lhs_idx, rhs_idx, ty, false);
            binary_op(cx, BIN_SUB, dst_idx, minuend_idx, dst_idx, ty, false);
            return Ok(());
        }

        match &ops[2] {
            Operand::Reg(rhs) => {
                let rhs_idx = cx.get_or_add_reg(rhs.canonical);
                binary_op(cx, kind, dst_idx, lhs_idx, rhs_idx, ty, flags);
            }
            Operand::Imm(i) => {
                let imm_idx = {
                    emit_load_imm(cx, dst_idx, *i);
                    dst_idx
                };
                binary_op(cx, kind, dst_idx, lhs_idx, imm_idx, ty, flags);
            }
            _ => {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "unsupported rhs operand"))
            }
        }
        return Ok(());
    }

    match insn.mnemonic.as_str() {
        "SMULL" | "UMULL" | "SMADDL" | "UMADDL" => {
            let signed = insn.mnemonic.starts_with('S');
            let lhs = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "lhs not a register"))?;
            let rhs = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "rhs not a register"))?;
            let lhs_idx = cx.get_or_add_reg(lhs.canonical);
            let rhs_idx = cx.get_or_add_reg(rhs.canonical);
            let wide_ty = cx.get_or_add_type(Type::for_register_width(false, !signed));
            binary_op(cx, BIN_MUL, dst_idx, lhs_idx, rhs_idx, wide_ty, false);
            if insn.mnemonic.ends_with('L') && ops.len() == 4 {
                let add = as_reg(&ops[3]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "addend not a register"))?;
                let add_idx = cx.get_or_add_reg(add.canonical);
                binary_op(cx, BIN_ADD, dst_idx, dst_idx, add_idx, wide_ty, false);
            }
            Ok(())
        }
        "SMULH" | "UMULH" => {
            // High 64 bits of a 64x64 multiply; the engine's BIN_MUL on a
            // 64-bit type already discards the high half, so this needs a
            // distinct widening-then-shift-right sequence. The shift
            // amount is the operand width (64), expressed as a second
            // BIN_LSR after the multiply writes into a double-width slot.
            let lhs = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "lhs not a register"))?;
            let rhs = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "rhs not a register"))?;
            let lhs_idx = cx.get_or_add_reg(lhs.canonical);
            let rhs_idx = cx.get_or_add_reg(rhs.canonical);
            let signed = insn.mnemonic.starts_with('S');
            let wide_ty = cx.get_or_add_type(Type::for_register_width(false, !signed));
            binary_op(cx, BIN_MUL, dst_idx, lhs_idx, rhs_idx, wide_ty, false);
            emit_load_imm(cx, dst_idx, 64);
            binary_op(cx, BIN_LSR, dst_idx, dst_idx, dst_idx, wide_ty, false);
            Ok(())
        }
        other => Err(Error::lowering(insn.address, other, "unhandled arithmetic mnemonic")),
    }
}

fn lower_logic_case(cx: &mut LowerCx, insn: &DecodedInsn, ops: &[Operand]) -> Result<()> {
    match insn.mnemonic.as_str() {
        "MOV" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "MOV", "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            match &ops[1] {
                Operand::Reg(src) => emit_assign_reg_or_zero(cx, dst_idx, *src),
                Operand::Imm(i) => emit_load_imm(cx, dst_idx, *i),
                _ => return Err(Error::lowering(insn.address, "MOV", "unsupported src operand")),
            }
            Ok(())
        }
        "MOVZ" | "MOVN" | "MOVK" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let imm = as_imm(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "imm operand missing"))?;
            // Shift amount, if present as a third operand, is folded into
            // the immediate by the disassembler text already for MOVZ/MOVN
            // in practice; MOVK additionally needs to preserve the
            // untouched bits of dst, done via a temp/mask sequence through
            // x16 the way the original lowering reserves scratch regs.
            match insn.mnemonic.as_str() {
                "MOVZ" => emit_load_imm(cx, dst_idx, imm),
                "MOVN" => emit_load_imm(cx, dst_idx, !imm),
                "MOVK" => {
                    let tmp = cx.get_or_add_reg(16);
                    emit_load_imm(cx, tmp, imm);
                    let ty = reg_type(cx, dst, true);
                    binary_op(cx, BIN_OR, dst_idx, dst_idx, tmp, ty, false);
                }
                _ => unreachable!(),
            }
            Ok(())
        }
        "AND" | "ANDS" | "ORR" | "EOR" | "EON" | "ORN" | "BIC" | "BICS" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let lhs = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "lhs not a register"))?;
            let lhs_idx = cx.get_or_add_reg(lhs.canonical);
            let ty = reg_type(cx, dst, true);
            let flags = insn.mnemonic.ends_with('S');

            // `ORR dst, xzr, src` is the canonical MOV alias; degrade to a
            // plain move with no residual OR against zero.
            if insn.mnemonic == "ORR" && lhs.is_zero {
                if let Operand::Reg(src) = &ops[2] {
                    emit_assign_reg_or_zero(cx, dst_idx, *src);
                    return Ok(());
                }
            }

            let (kind, invert_rhs) = match insn.mnemonic.as_str() {
                "AND" | "ANDS" => (BIN_AND, false),
                "ORR" => (BIN_OR, false),
                "EOR" => (BIN_XOR, false),
                "EON" => (BIN_XOR, true),
                "ORN" => (BIN_OR, true),
                "BIC" | "BICS" => (BIN_AND, true),
                _ => unreachable!(),
            };

            let rhs_idx = match &ops[2] {
                Operand::Reg(rhs) => {
                    let r = cx.get_or_add_reg(rhs.canonical);
                    if invert_rhs {
                        unary_op(cx, UNARY_NOT, r, r, ty);
                    }
                    r
                }
                Operand::Imm(i) => {
                    let tmp = cx.get_or_add_reg(17);
                    emit_load_imm(cx, tmp, if invert_rhs { !*i } else { *i });
                    tmp
                }
                _ => return Err(Error::lowering(insn.address, &insn.mnemonic, "unsupported rhs operand")),
            };
            binary_op(cx, kind, dst_idx, lhs_idx, rhs_idx, ty, flags);
            Ok(())
        }
        "LSL" | "LSR" | "ASR" | "ROR" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let src = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let unsigned = matches!(insn.mnemonic.as_str(), "LSL" | "LSR");
            let ty = reg_type(cx, dst, unsigned);
            let kind = match insn.mnemonic.as_str() {
                "LSL" => BIN_SHL,
                "LSR" => BIN_LSR,
                "ASR" => BIN_ASR,
                "ROR" => {
                    return lower_ror(cx, insn, dst_idx, src_idx, &ops[2], ty);
                }
                _ => unreachable!(),
            };
            let amount_idx = match &ops[2] {
                Operand::Reg(r) => cx.get_or_add_reg(r.canonical),
                Operand::Imm(i) => {
                    let tmp = cx.get_or_add_reg(17);
                    emit_load_imm(cx, tmp, *i);
                    tmp
                }
                _ => return Err(Error::lowering(insn.address, &insn.mnemonic, "unsupported shift amount")),
            };
            binary_op(cx, kind, dst_idx, src_idx, amount_idx, ty, false);
            Ok(())
        }
        "CLZ" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "CLZ", "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let src = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, "CLZ", "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let ty = reg_type(cx, dst, true);
            unary_op(cx, UNARY_CLZ, dst_idx, src_idx, ty);
            Ok(())
        }
        "SXTB" | "SXTH" | "SXTW" | "UXTB" | "UXTH" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let src = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let signed = insn.mnemonic.starts_with('S');
            let width_bits: u32 = match insn.mnemonic.as_str() {
                "SXTB" | "UXTB" => 8,
                "SXTH" | "UXTH" => 16,
                "SXTW" => 32,
                _ => unreachable!(),
            };
            let src_ty = cx.get_or_add_type(Type::for_register_width(width_bits <= 32, !signed));
            let op = if signed { OP_SIGN_EXTEND } else { OP_ZERO_EXTEND };
            cx.emit(op);
            cx.emit(dst_idx);
            cx.emit(src_idx);
            cx.emit(src_ty);
            cx.emit(width_bits);
            Ok(())
        }
        "UBFM" | "SBFM" | "UBFX" | "SBFX" | "UBFIZ" | "SBFIZ" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let src = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let a = as_imm(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "immr/lsb missing"))? as u32;
            let b = as_imm(&ops[3]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "imms/width missing"))? as u32;
            let signed = matches!(insn.mnemonic.as_str(), "SBFM" | "SBFX" | "SBFIZ");
            let ty = reg_type(cx, dst, !signed);
            match insn.mnemonic.as_str() {
                "UBFX" | "SBFX" => {
                    cx.emit(OP_GET_FIELD);
                    cx.emit(dst_idx);
                    cx.emit(src_idx);
                    cx.emit(a);
                    cx.emit(b);
                    cx.emit(ty);
                }
                "UBFIZ" | "SBFIZ" => {
                    cx.emit(OP_SET_FIELD);
                    cx.emit(dst_idx);
                    cx.emit(src_idx);
                    cx.emit(a);
                    cx.emit(b);
                    cx.emit(ty);
                }
                "UBFM" | "SBFM" => {
                    cx.emit(OP_GET_FIELD);
                    cx.emit(dst_idx);
                    cx.emit(src_idx);
                    cx.emit(a);
                    cx.emit(b);
                    cx.emit(ty);
                }
                _ => unreachable!(),
            }
            Ok(())
        }
        "EXTR" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "EXTR", "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let lo = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, "EXTR", "lo not a register"))?;
            let lo_idx = cx.get_or_add_reg(lo.canonical);
            let lsb = as_imm(&ops[3]).ok_or_else(|| Error::lowering(insn.address, "EXTR", "lsb missing"))? as u32;
            let ty = reg_type(cx, dst, true);
            cx.emit(OP_GET_FIELD);
            cx.emit(dst_idx);
            cx.emit(lo_idx);
            cx.emit(lsb);
            cx.emit(if dst.is_32_bit { 32 } else { 64 } - lsb);
            cx.emit(ty);
            Ok(())
        }
        "REV" | "REV16" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let src = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let ty = reg_type(cx, dst, true);
            cx.emit(OP_BITCAST);
            cx.emit(dst_idx);
            cx.emit(src_idx);
            cx.emit(ty);
            cx.emit(if insn.mnemonic == "REV16" { 1 } else { 0 });
            Ok(())
        }
        other => Err(Error::lowering(insn.address, other, "unhandled logic mnemonic")),
    }
}

fn lower_ror(cx: &mut LowerCx, insn: &DecodedInsn, dst_idx: u32, src_idx: u32, amount: &Operand, ty: u32) -> Result<()> {
    let amount_idx = match amount {
        Operand::Reg(r) => cx.get_or_add_reg(r.canonical),
        Operand::Imm(i) => {
            let tmp = cx.get_or_add_reg(17);
            emit_load_imm(cx, tmp, *i);
            tmp
        }
        _ => return Err(Error::lowering(insn.address, "ROR", "unsupported shift amount")),
    };
    // No dedicated rotate opcode; compose from two shifts and an OR, as a
    // real ARM64 ROR-by-register would if the target lacked one.
    let width_imm = cx.get_or_add_reg(16);
    emit_load_imm(cx, width_imm, 64);
    binary_op(cx, BIN_SUB, width_imm, width_imm, amount_idx, ty, false);
    let hi = cx.get_or_add_reg(16);
    binary_op(cx, BIN_LSR, hi, src_idx, amount_idx, ty, false);
    let lo = cx.get_or_add_reg(17);
    binary_op(cx, BIN_SHL, lo, src_idx, width_imm, ty, false);
    binary_op(cx, BIN_OR, dst_idx, hi, lo, ty, false);
    Ok(())
}

fn mem_order_for(mnemonic: &str) -> u32 {
    if mnemonic.starts_with("LDAR") || mnemonic.starts_with("LDAXR") {
        VM_MEM_ORDER_ACQUIRE
    } else if mnemonic.starts_with("STLR") || mnemonic.starts_with("STLXR") {
        VM_MEM_ORDER_RELEASE
    } else {
        VM_MEM_ORDER_RELAXED
    }
}

fn lower_memory_case(cx: &mut LowerCx, insn: &DecodedInsn, ops: &[Operand]) -> Result<()> {
    match insn.mnemonic.as_str() {
        "LDR" | "LDRB" | "LDRH" | "LDRSB" | "LDRSH" | "LDRSW" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let Operand::Mem { base, disp } = &ops[1] else {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "expected a memory operand"));
            };
            let base_idx = cx.get_or_add_reg(base.canonical);
            let signed = insn.mnemonic.starts_with("LDRS");
            let ty = reg_type(cx, dst, !signed);
            cx.emit(OP_GET_FIELD | FIELD_MEM_MODE);
            cx.emit(dst_idx);
            cx.emit(base_idx);
            cx.emit(*disp as u32);
            cx.emit(ty);
            Ok(())
        }
        "STR" | "STRB" | "STRH" => {
            let src = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let Operand::Mem { base, disp } = &ops[1] else {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "expected a memory operand"));
            };
            let base_idx = cx.get_or_add_reg(base.canonical);
            let ty = reg_type(cx, src, true);
            cx.emit(OP_SET_FIELD | FIELD_MEM_MODE);
            cx.emit(src_idx);
            cx.emit(base_idx);
            cx.emit(*disp as u32);
            cx.emit(ty);
            Ok(())
        }
        "LDP" | "STP" => {
            let r1 = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "first reg missing"))?;
            let r2 = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "second reg missing"))?;
            let Operand::Mem { base, disp } = &ops[2] else {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "expected a memory operand"));
            };
            let base_idx = cx.get_or_add_reg(base.canonical);
            let pair_size: i64 = if r1.is_32_bit { 4 } else { 8 };
            let r1_idx = cx.get_or_add_reg(r1.canonical);
            let r2_idx = cx.get_or_add_reg(r2.canonical);
            let ty = reg_type(cx, r1, true);
            let load = insn.mnemonic == "LDP";
            let op = if load { OP_GET_FIELD } else { OP_SET_FIELD } | FIELD_MEM_MODE;
            cx.emit(op);
            cx.emit(r1_idx);
            cx.emit(base_idx);
            cx.emit(*disp as u32);
            cx.emit(ty);
            cx.emit(op);
            cx.emit(r2_idx);
            cx.emit(base_idx);
            cx.emit((*disp + pair_size) as u32);
            cx.emit(ty);
            Ok(())
        }
        "LDAR" | "LDARB" | "LDARH" | "LDAXR" | "LDXR" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let Operand::Mem { base, disp: _ } = &ops[1] else {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "expected a memory operand"));
            };
            let base_idx = cx.get_or_add_reg(base.canonical);
            let ty = reg_type(cx, dst, true);
            cx.emit(OP_ATOMIC_LOAD);
            cx.emit(dst_idx);
            cx.emit(base_idx);
            cx.emit(ty);
            cx.emit(mem_order_for(&insn.mnemonic));
            Ok(())
        }
        "STLR" | "STLRB" | "STLRH" | "STLXR" | "STXR" => {
            let (status_and_value_start, value) = if insn.mnemonic == "STLXR" || insn.mnemonic == "STXR" {
                (1, as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "value reg missing"))?)
            } else {
                (0, as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "value reg missing"))?)
            };
            let mem_idx = status_and_value_start + 1;
            let Operand::Mem { base, disp: _ } = &ops[mem_idx] else {
                return Err(Error::lowering(insn.address, &insn.mnemonic, "expected a memory operand"));
            };
            let base_idx = cx.get_or_add_reg(base.canonical);
            let value_idx = cx.get_or_add_reg(value.canonical);
            let ty = reg_type(cx, value, true);
            cx.emit(OP_ATOMIC_STORE);
            cx.emit(value_idx);
            cx.emit(base_idx);
            cx.emit(ty);
            cx.emit(mem_order_for(&insn.mnemonic));
            if insn.mnemonic == "STLXR" || insn.mnemonic == "STXR" {
                // Store-exclusive never actually fails in this single
                // threaded-guest VM; the status register always reports
                // success.
                if let Some(status) = as_reg(&ops[0]) {
                    let status_idx = cx.get_or_add_reg(status.canonical);
                    emit_load_imm(cx, status_idx, 0);
                }
            }
            Ok(())
        }
        other => Err(Error::lowering(insn.address, other, "unhandled memory mnemonic")),
    }
}

fn lower_branch_case(
    cx: &mut LowerCx,
    insn: &DecodedInsn,
    ops: &[Operand],
    cond_code: Option<&str>,
) -> Result<()> {
    match insn.mnemonic.as_str() {
        "RET" => {
            // `RET` (implicitly via LR, or an explicit register operand
            // that is LR) returns; any other register target is an
            // indirect branch.
            let target = ops.first().and_then(as_reg);
            match target {
                None => {
                    cx.emit(OP_RETURN);
                }
                Some(r) if r.canonical == 30 => {
                    cx.emit(OP_RETURN);
                }
                Some(r) => {
                    let idx = cx.get_or_add_reg(r.canonical);
                    cx.emit(OP_BRANCH_REG);
                    cx.emit(idx);
                }
            }
            Ok(())
        }
        "BR" => {
            let target = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "BR", "target not a register"))?;
            if target.canonical == 30 {
                cx.emit(OP_RETURN);
            } else {
                let idx = cx.get_or_add_reg(target.canonical);
                cx.emit(OP_BRANCH_REG);
                cx.emit(idx);
            }
            Ok(())
        }
        "BLR" => {
            let target = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "BLR", "target not a register"))?;
            let idx = cx.get_or_add_reg(target.canonical);
            cx.emit(OP_CALL);
            cx.emit(idx);
            Ok(())
        }
        "BL" => {
            let imm = as_imm(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "BL", "target immediate missing"))?;
            let target = imm as u64;
            let branch_id = cx.get_or_add_branch(target);
            cx.call_targets.push(target);
            cx.emit(OP_BL);
            cx.emit(branch_id);
            Ok(())
        }
        "B" => {
            let imm = as_imm(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "B", "target immediate missing"))?;
            let branch_id = cx.get_or_add_branch(imm as u64);
            cx.emit(OP_BRANCH);
            cx.emit(branch_id);
            Ok(())
        }
        "CBZ" | "CBNZ" => {
            let src = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let imm = as_imm(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "target immediate missing"))?;
            let branch_id = cx.get_or_add_branch(imm as u64);
            cx.emit(OP_BRANCH_IF);
            cx.emit(src_idx);
            cx.emit(if insn.mnemonic == "CBZ" { CMP_EQ } else { CMP_EQ | 1 });
            cx.emit(branch_id);
            Ok(())
        }
        "TBZ" | "TBNZ" => {
            let src = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "src not a register"))?;
            let src_idx = cx.get_or_add_reg(src.canonical);
            let bit = as_imm(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "bit index missing"))? as u32;
            let imm = as_imm(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "target immediate missing"))?;
            let branch_id = cx.get_or_add_branch(imm as u64);
            cx.emit(OP_BRANCH_IF_CC);
            cx.emit(src_idx);
            cx.emit(bit);
            cx.emit(if insn.mnemonic == "TBZ" { 0 } else { 1 });
            cx.emit(branch_id);
            Ok(())
        }
        "CSEL" | "CSINC" | "CSINV" | "CSET" => {
            let (dst, t_val, f_val, cc) = if insn.mnemonic == "CSET" {
                let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "CSET", "dst not a register"))?;
                (dst, None, None, cond_code)
            } else {
                let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
                let t = as_reg(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "true-value not a register"))?;
                let f = as_reg(&ops[2]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "false-value not a register"))?;
                (dst, Some(t), Some(f), cond_code)
            };
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let ty = reg_type(cx, dst, true);
            let cc_code = cond_code_value(cc.unwrap_or("AL"));
            match insn.mnemonic.as_str() {
                "CSET" => {
                    cx.emit(OP_SELECT);
                    cx.emit(dst_idx);
                    cx.emit(cc_code);
                    let one = cx.get_or_add_reg(16);
                    emit_load_imm(cx, one, 1);
                    let zero = cx.get_or_add_reg(17);
                    emit_load_imm(cx, zero, 0);
                    cx.emit(one);
                    cx.emit(zero);
                    cx.emit(ty);
                }
                "CSEL" => {
                    let t_idx = cx.get_or_add_reg(t_val.unwrap().canonical);
                    let f_idx = cx.get_or_add_reg(f_val.unwrap().canonical);
                    cx.emit(OP_SELECT);
                    cx.emit(dst_idx);
                    cx.emit(cc_code);
                    cx.emit(t_idx);
                    cx.emit(f_idx);
                    cx.emit(ty);
                }
                "CSINC" => {
                    let t_idx = cx.get_or_add_reg(t_val.unwrap().canonical);
                    let f_idx = cx.get_or_add_reg(f_val.unwrap().canonical);
                    let inc = cx.get_or_add_reg(16);
                    emit_load_imm(cx, inc, 1);
                    binary_op(cx, BIN_ADD, inc, f_idx, inc, ty, false);
                    cx.emit(OP_SELECT);
                    cx.emit(dst_idx);
                    cx.emit(cc_code);
                    cx.emit(t_idx);
                    cx.emit(inc);
                    cx.emit(ty);
                }
                "CSINV" => {
                    let t_idx = cx.get_or_add_reg(t_val.unwrap().canonical);
                    let f_idx = cx.get_or_add_reg(f_val.unwrap().canonical);
                    let inv = cx.get_or_add_reg(16);
                    unary_op(cx, UNARY_NOT, inv, f_idx, ty);
                    cx.emit(OP_SELECT);
                    cx.emit(dst_idx);
                    cx.emit(cc_code);
                    cx.emit(t_idx);
                    cx.emit(inv);
                    cx.emit(ty);
                }
                _ => unreachable!(),
            }
            Ok(())
        }
        m if m.starts_with("B.") => {
            let imm = as_imm(&ops[0]).ok_or_else(|| Error::lowering(insn.address, m, "target immediate missing"))?;
            let branch_id = cx.get_or_add_branch(imm as u64);
            let cc = &m[2..];
            cx.emit(OP_BRANCH_IF_CC);
            cx.emit(cond_code_value(cc));
            // `CC_TEST_SENTINEL` in the bit-index slot distinguishes a
            // condition-code test (this form) from a TBZ/TBNZ bit test,
            // which never uses a bit index this large.
            cx.emit(CC_TEST_SENTINEL);
            cx.emit(0);
            cx.emit(branch_id);
            Ok(())
        }
        other => Err(Error::lowering(insn.address, other, "unhandled branch mnemonic")),
    }
}

fn cond_code_value(cc: &str) -> u32 {
    match cc.to_ascii_uppercase().as_str() {
        "EQ" => 0,
        "NE" => 1,
        "CS" | "HS" => 2,
        "CC" | "LO" => 3,
        "MI" => 4,
        "PL" => 5,
        "VS" => 6,
        "VC" => 7,
        "HI" => 8,
        "LS" => 9,
        "GE" => 10,
        "LT" => 11,
        "GT" => 12,
        "LE" => 13,
        _ => 14, // AL
    }
}

fn lower_misc_case(cx: &mut LowerCx, insn: &DecodedInsn, ops: &[Operand]) -> Result<()> {
    match insn.mnemonic.as_str() {
        "ADR" | "ADRP" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            let imm = as_imm(&ops[1]).ok_or_else(|| Error::lowering(insn.address, &insn.mnemonic, "target immediate missing"))?;
            if insn.mnemonic == "ADRP" {
                cx.emit(OP_ADRP);
                cx.emit(dst_idx);
                cx.emit(imm as u32);
                cx.emit((imm >> 32) as u32);
            } else {
                emit_load_imm(cx, dst_idx, imm);
            }
            Ok(())
        }
        "MRS" => {
            let dst = as_reg(&ops[0]).ok_or_else(|| Error::lowering(insn.address, "MRS", "dst not a register"))?;
            let dst_idx = cx.get_or_add_reg(dst.canonical);
            // System register reads (TPIDR_EL0 etc.) are outside this
            // translator's scope; materialize a deterministic zero rather
            // than fail the whole function on an instruction that is
            // usually dead in straight-line application code.
            emit_load_imm(cx, dst_idx, 0);
            Ok(())
        }
        "NOP" | "HINT" | "CLREX" | "BRK" | "SVC" => {
            cx.emit(OP_NOP);
            Ok(())
        }
        other => Err(Error::lowering(insn.address, other, "unhandled miscellaneous mnemonic")),
    }
}

/// Translates one function's raw ARM64 bytes into a fully-formed, validated
/// [`vmforge_function::EncodedFunction`]: the mandatory prelude (allocate
/// the invisible-return slot, then the scratch stack frame), one lowered
/// opcode sequence per decoded instruction, and the function's resolved
/// branch table. `size` bounds how much of `code` belongs to this function;
/// `code` itself may be a larger slice (e.g. a whole section) starting at
/// `base_addr`.
pub fn translate(
    code: &[u8],
    base_addr: u64,
    size: u64,
    disasm: &dyn Disassembler,
) -> Result<vmforge_function::EncodedFunction> {
    let len = (size as usize).min(code.len());
    let insns = disasm.disassemble(&code[..len], base_addr)?;

    let mut cx = LowerCx::new();
    cx.emit(OP_ALLOC_RETURN);
    let fp_idx = cx.get_or_add_reg(29);
    let sp_idx = cx.get_or_add_reg(31);
    cx.emit(OP_ALLOC_VSP);
    cx.emit(fp_idx);
    cx.emit(sp_idx);

    for insn in &insns {
        lower_one(&mut cx, insn, &insn.operands, insn.cond_code.as_deref())?;
    }

    let branch_words = resolve_branch_targets(&cx);
    let f = vmforge_function::EncodedFunction {
        register_count: cx.register_count(),
        first_inst_opcodes: Vec::new(),
        external_init_words: Vec::new(),
        type_tags: cx.type_ids,
        init_value_entries: Vec::new(),
        inst_words: cx.opcodes,
        branch_words,
        branch_addrs: cx.branch_addrs,
        function_offset: base_addr,
    };
    f.validate()?;
    Ok(f)
}

/// Translates one function and packages the result as the entry shape
/// [`vmforge_container::BundleWriter`] consumes directly.
pub fn translate_to_bundle_entry(
    code: &[u8],
    base_addr: u64,
    size: u64,
    disasm: &dyn Disassembler,
) -> Result<vmforge_container::BundleFunctionEntry> {
    let f = translate(code, base_addr, size, disasm)?;
    let encoded_data = f.serialize_encoded()?;
    Ok(vmforge_container::BundleFunctionEntry {
        fun_addr: base_addr,
        encoded_data,
    })
}

/// Translates every function in `funcs` (each a `(base_addr, bytes)` pair)
/// into a single bundle. The shared branch-address table is the union of
/// every function's own resolved `branch_addrs`, mirroring how a real
/// packaging step flattens per-function branch tables into the one table
/// `OP_BL` ultimately consults at link time.
pub fn translate_to_bundle(
    funcs: &[(u64, &[u8])],
    disasm: &dyn Disassembler,
) -> Result<vmforge_container::Bundle> {
    let mut entries = Vec::with_capacity(funcs.len());
    let mut shared_branch_addrs = Vec::new();
    for &(base_addr, code) in funcs {
        let f = translate(code, base_addr, code.len() as u64, disasm)?;
        shared_branch_addrs.extend(f.branch_addrs.iter().copied());
        let encoded_data = f.serialize_encoded()?;
        entries.push(vmforge_container::BundleFunctionEntry {
            fun_addr: base_addr,
            encoded_data,
        });
    }
    Ok(vmforge_container::Bundle {
        entries,
        shared_branch_addrs,
    })
}

/// Resolves every local-branch and call target recorded during lowering
/// into VM program counters, now that `addr_to_pc` is complete. Addresses
/// with no corresponding instruction (a target outside the translated
/// range) resolve to zero, matching a defensively-inert unresolved jump
/// rather than an out-of-bounds program counter.
pub fn resolve_branch_targets(cx: &LowerCx) -> Vec<u64> {
    cx.branch_addrs
        .iter()
        .map(|addr| cx.addr_to_pc.get(addr).copied().unwrap_or(0) as u64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(mnemonic: &str, address: u64) -> DecodedInsn {
        DecodedInsn {
            address,
            raw_bytes: vec![],
            length: 4,
            mnemonic: mnemonic.to_string(),
            op_str: String::new(),
            operands: vec![],
            cond_code: None,
        }
    }

    fn greg(idx: u32) -> GpReg {
        GpReg {
            canonical: idx,
            is_32_bit: false,
            is_zero: false,
        }
    }

    fn zero_reg() -> GpReg {
        GpReg {
            canonical: u32::MAX,
            is_32_bit: false,
            is_zero: true,
        }
    }

    #[test]
    fn classify_groups_mnemonics_by_domain() {
        assert_eq!(InsnDomain::classify("ADD"), InsnDomain::Arith);
        assert_eq!(InsnDomain::classify("ORR"), InsnDomain::Logic);
        assert_eq!(InsnDomain::classify("LDR"), InsnDomain::Memory);
        assert_eq!(InsnDomain::classify("CBZ"), InsnDomain::Branch);
        assert_eq!(InsnDomain::classify("B.EQ"), InsnDomain::Branch);
        assert_eq!(InsnDomain::classify("FMOV"), InsnDomain::Misc);
    }

    #[test]
    fn orr_with_zero_lhs_degrades_to_plain_mov() {
        let mut cx = LowerCx::new();
        let ops = vec![Operand::Reg(greg(2)), Operand::Reg(zero_reg()), Operand::Reg(greg(3))];
        lower_logic_case(&mut cx, &insn("ORR", 0x100), &ops).unwrap();
        assert_eq!(cx.opcodes[0], OP_MOV);
        assert!(!cx.opcodes.contains(&OP_BINARY));
    }

    #[test]
    fn adds_sets_update_flags_bit() {
        let mut cx = LowerCx::new();
        let ops = vec![Operand::Reg(greg(2)), Operand::Reg(greg(3)), Operand::Reg(greg(4))];
        lower_arith_case(&mut cx, &insn("ADDS", 0x200), &ops).unwrap();
        assert_eq!(cx.opcodes[0] & BIN_UPDATE_FLAGS, BIN_UPDATE_FLAGS);
        assert_eq!(cx.opcodes[1], BIN_ADD);
    }

    #[test]
    fn plain_add_has_no_flags_bit() {
        let mut cx = LowerCx::new();
        let ops = vec![Operand::Reg(greg(2)), Operand::Reg(greg(3)), Operand::Reg(greg(4))];
        lower_arith_case(&mut cx, &insn("ADD", 0x200), &ops).unwrap();
        assert_eq!(cx.opcodes[0] & BIN_UPDATE_FLAGS, 0);
    }

    #[test]
    fn ret_with_no_operand_emits_return() {
        let mut cx = LowerCx::new();
        lower_branch_case(&mut cx, &insn("RET", 0x300), &[], None).unwrap();
        assert_eq!(cx.opcodes, vec![OP_RETURN]);
    }

    #[test]
    fn br_through_lr_is_also_a_return() {
        let mut cx = LowerCx::new();
        let ops = vec![Operand::Reg(greg(30))];
        lower_branch_case(&mut cx, &insn("BR", 0x300), &ops, None).unwrap();
        assert_eq!(cx.opcodes, vec![OP_RETURN]);
    }

    #[test]
    fn bl_records_call_target_and_branch_id() {
        let mut cx = LowerCx::new();
        let ops = vec![Operand::Imm(0x1234)];
        lower_branch_case(&mut cx, &insn("BL", 0x400), &ops, None).unwrap();
        assert_eq!(cx.opcodes[0], OP_BL);
        assert_eq!(cx.call_targets, vec![0x1234]);
        assert_eq!(cx.branch_addrs, vec![0x1234]);
    }

    #[test]
    fn resolve_branch_targets_maps_addresses_to_pcs() {
        let mut cx = LowerCx::new();
        cx.addr_to_pc.insert(0x500, 7);
        cx.branch_addrs.push(0x500);
        cx.branch_addrs.push(0x999);
        let resolved = resolve_branch_targets(&cx);
        assert_eq!(resolved, vec![7, 0]);
    }

    struct FakeDisassembler(Vec<DecodedInsn>);

    impl Disassembler for FakeDisassembler {
        fn disassemble(&self, _code: &[u8], _address: u64) -> Result<Vec<DecodedInsn>> {
            Ok(self.0.clone())
        }
    }

    /// Dispatches by the address passed to `disassemble`, so a single
    /// instance can stand in for decoding several distinct functions.
    struct FakeDisassemblerByAddr(HashMap<u64, Vec<DecodedInsn>>);

    impl Disassembler for FakeDisassemblerByAddr {
        fn disassemble(&self, _code: &[u8], address: u64) -> Result<Vec<DecodedInsn>> {
            Ok(self.0.get(&address).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn translate_emits_the_prelude_before_lowered_instructions() {
        let fake = FakeDisassembler(vec![insn("RET", 0x1000)]);
        let f = translate(&[0u8; 4], 0x1000, 4, &fake).unwrap();
        assert_eq!(f.inst_words[0], OP_ALLOC_RETURN);
        assert_eq!(f.inst_words[1], OP_ALLOC_VSP);
        assert_eq!(f.inst_words[4], OP_RETURN);
        assert!(f.validate().is_ok());
    }

    #[test]
    fn translate_resolves_a_local_branch_target_past_the_prelude() {
        let mut b = insn("B", 0x2000);
        b.operands = vec![Operand::Imm(0x2008)];
        let target = insn("RET", 0x2008);
        let fake = FakeDisassembler(vec![b, target]);

        let f = translate(&[0u8; 16], 0x2000, 16, &fake).unwrap();
        assert_eq!(f.branch_addrs, vec![0x2008]);
        // prelude (4 words) + OP_BRANCH/branch_id (2 words) = pc 6 for RET.
        assert_eq!(f.branch_words, vec![6]);
    }

    #[test]
    fn translate_to_bundle_entry_carries_the_function_address() {
        let fake = FakeDisassembler(vec![insn("RET", 0x3000)]);
        let entry = translate_to_bundle_entry(&[0u8; 4], 0x3000, 4, &fake).unwrap();
        assert_eq!(entry.fun_addr, 0x3000);
        assert!(!entry.encoded_data.is_empty());
    }

    #[test]
    fn translate_to_bundle_unions_branch_addrs_across_functions() {
        let mut b1 = insn("B", 0x4000);
        b1.operands = vec![Operand::Imm(0x4008)];
        let r1 = insn("RET", 0x4008);
        let mut b2 = insn("B", 0x5000);
        b2.operands = vec![Operand::Imm(0x5008)];
        let r2 = insn("RET", 0x5008);

        let mut by_addr = HashMap::new();
        by_addr.insert(0x4000, vec![b1, r1]);
        by_addr.insert(0x5000, vec![b2, r2]);
        let fake = FakeDisassemblerByAddr(by_addr);

        let bundle = translate_to_bundle(
            &[(0x4000, &[0u8; 16] as &[u8]), (0x5000, &[0u8; 16] as &[u8])],
            &fake,
        )
        .unwrap();
        assert_eq!(bundle.entries.len(), 2);
        assert_eq!(bundle.shared_branch_addrs, vec![0x4008, 0x5008]);
    }

    #[test]
    fn cond_code_value_maps_known_mnemonics() {
        assert_eq!(cond_code_value("EQ"), 0);
        assert_eq!(cond_code_value("NE"), 1);
        assert_eq!(cond_code_value("AL"), 14);
    }
}
