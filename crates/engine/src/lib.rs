//! A register-based interpreter for translated guest functions. Caches
//! `RuntimeFunction`s by `(so_name, function_offset)`, dispatches the
//! bytecode produced by `vmforge-translator`, and owns the per-library
//! shared branch-address table `OP_BL` consults.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use vmforge_function::{Register, RuntimeFunction};
use vmforge_types::opcode::*;
use vmforge_types::{PrimitiveType, Type};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no cached runtime function for {so_name}:{function_offset:#x}")]
    FunctionNotCached {
        so_name: String,
        function_offset: u64,
    },
    #[error("register index {index} out of range (register file has {count} slots)")]
    RegisterOutOfRange { index: u32, count: usize },
    #[error("branch id {branch_id} out of range (function has {count} branch targets)")]
    BranchOutOfRange { branch_id: u32, count: usize },
    #[error("unknown opcode {0:#x} at pc {1}")]
    UnknownOpcode(u32, usize),
    #[error("opcode {0:#x} at pc {1} is declared but never driven by any lowering in this crate")]
    UnexercisedOpcode(u32, usize),
    #[error("OP_UNREACHABLE executed at pc {0}")]
    Unreachable(usize),
    #[error("instruction stream exhausted without a terminating OP_RETURN/OP_END at pc {0}")]
    StreamExhausted(usize),
    #[error(transparent)]
    Types(#[from] vmforge_types::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Condition flags set by a `BIN_UPDATE_FLAGS`-tagged binary op, consulted
/// by `OP_BRANCH_IF_CC`'s condition-code form and `OP_SELECT`.
#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

impl Flags {
    fn test(&self, cc: u32) -> bool {
        match cc {
            0 => self.z,               // EQ
            1 => !self.z,              // NE
            2 => self.c,               // CS/HS
            3 => !self.c,              // CC/LO
            4 => self.n,               // MI
            5 => !self.n,              // PL
            6 => self.v,               // VS
            7 => !self.v,              // VC
            8 => self.c && !self.z,    // HI
            9 => !self.c || self.z,    // LS
            10 => self.n == self.v,    // GE
            11 => self.n != self.v,    // LT
            12 => !self.z && self.n == self.v, // GT
            13 => self.z || self.n != self.v,  // LE
            _ => true,                 // AL
        }
    }
}

fn sign_bit(width_bits: u32) -> u64 {
    1u64 << (width_bits - 1)
}

fn truncate_to_width(value: u64, width_bits: u32) -> u64 {
    if width_bits >= 64 {
        value
    } else {
        value & ((1u64 << width_bits) - 1)
    }
}

fn is_negative(value: u64, width_bits: u32) -> bool {
    value & sign_bit(width_bits) != 0
}

fn width_bits_of(ty: Type) -> u32 {
    match ty {
        Type::Primitive(p) => p.byte_width() * 8,
        Type::Struct => 64,
    }
}

fn is_signed(ty: Type) -> bool {
    matches!(ty, Type::Primitive(p) if p.is_signed())
}

/// Computes N/Z/C/V the way the ARM64 `S`-suffixed forms would, for the
/// binary op kinds the translator actually tags with `BIN_UPDATE_FLAGS`
/// (`ADD`/`SUB`/logical ops). Shift/multiply/divide never request flags.
fn compute_flags(kind: u32, lhs: u64, rhs: u64, result: u64, width_bits: u32) -> Flags {
    let trunc = truncate_to_width(result, width_bits);
    let n = is_negative(trunc, width_bits);
    let z = trunc == 0;
    let (c, v) = match kind {
        BIN_ADD => {
            let sum = (lhs as u128) + (rhs as u128);
            let c = sum > truncate_to_width(u64::MAX, width_bits) as u128;
            let v = is_negative(lhs, width_bits) == is_negative(rhs, width_bits)
                && is_negative(trunc, width_bits) != is_negative(lhs, width_bits);
            (c, v)
        }
        BIN_SUB => {
            let c = truncate_to_width(lhs, width_bits) >= truncate_to_width(rhs, width_bits);
            let v = is_negative(lhs, width_bits) != is_negative(rhs, width_bits)
                && is_negative(trunc, width_bits) != is_negative(lhs, width_bits);
            (c, v)
        }
        _ => (false, false),
    };
    Flags { n, z, c, v }
}

/// A callable branch-address table entry: the raw native address `OP_BL`
/// or an indirect `OP_CALL` invokes with the AArch64 ABI's six integer
/// argument registers.
type NativeFn = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

fn call_native(addr: u64, args: &[u64; 6]) -> u64 {
    // SAFETY: the caller (relocated image or shared branch-address table)
    // is trusted to have placed a valid AArch64-ABI-compatible function
    // pointer at `addr`; this mirrors how the original host process calls
    // through function pointers produced by its own linker.
    let f: NativeFn = unsafe { std::mem::transmute(addr as usize) };
    f(args[0], args[1], args[2], args[3], args[4], args[5])
}

/// Per-call interpreter state: the register file, condition flags, and a
/// borrowed view of the cached function being executed.
struct Frame<'a> {
    registers: Vec<u64>,
    flags: Flags,
    rf: &'a RuntimeFunction,
    shared_branch_addrs: &'a [u64],
    /// Backing storage for `OP_ALLOC_VSP`'s scratch stack frame. Allocated
    /// once and never resized afterward, so the address handed to fp/sp
    /// stays valid for the rest of the call.
    vsp_storage: Vec<u8>,
}

impl<'a> Frame<'a> {
    fn reg(&self, idx: u32) -> Result<u64> {
        self.registers
            .get(idx as usize)
            .copied()
            .ok_or(Error::RegisterOutOfRange {
                index: idx,
                count: self.registers.len(),
            })
    }

    fn set_reg(&mut self, idx: u32, value: u64) -> Result<()> {
        let count = self.registers.len();
        let slot = self
            .registers
            .get_mut(idx as usize)
            .ok_or(Error::RegisterOutOfRange { index: idx, count })?;
        *slot = value;
        Ok(())
    }

    fn ty(&self, idx: u32) -> Type {
        self.rf.types.get(idx).unwrap_or(Type::Primitive(PrimitiveType::U64))
    }

    fn branch_pc(&self, branch_id: u32) -> Result<usize> {
        self.rf
            .branch_words
            .get(branch_id as usize)
            .copied()
            .map(|pc| pc as usize)
            .ok_or(Error::BranchOutOfRange {
                branch_id,
                count: self.rf.branch_words.len(),
            })
    }

    /// `OP_BL`'s native call target: the per-library shared table takes
    /// priority (it reflects the address actually resolved in the loaded
    /// image), falling back to the function's own recorded absolute
    /// address when the shared table has no (or a zero) entry there.
    fn bl_target(&self, branch_id: u32) -> Result<u64> {
        if let Some(&addr) = self.shared_branch_addrs.get(branch_id as usize) {
            if addr != 0 {
                return Ok(addr);
            }
        }
        self.rf
            .branch_addrs
            .get(branch_id as usize)
            .copied()
            .ok_or(Error::BranchOutOfRange {
                branch_id,
                count: self.rf.branch_addrs.len(),
            })
    }
}

fn word(words: &[u32], pc: usize) -> Result<u32> {
    words
        .get(pc)
        .copied()
        .ok_or(Error::StreamExhausted(pc))
}

fn u64_from_halves(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Runs the first-instruction stream, materializing `init_value_entries`
/// into registers. Each entry carries its own target register (not one
/// borrowed from `external_init_words`, which binds a separate, disjoint
/// set of caller-supplied slots). An opcode-2 entry's `value` is an index
/// into `rf.types`, materialized here as that type's tag rather than a
/// literal. Per the declared invariant, an out-of-range destination
/// register is skipped (logged) rather than treated as fatal.
fn run_init_stream(frame: &mut Frame) {
    for (i, entry) in frame.rf.init_value_entries.iter().enumerate() {
        let opcode = frame.rf.first_inst_opcodes.get(i).copied().unwrap_or(0);
        let value = if opcode == 2 {
            frame
                .rf
                .types
                .get(entry.value as u32)
                .map(|ty| ty.to_tag())
                .unwrap_or(0) as u64
        } else {
            entry.value
        };
        if frame.set_reg(entry.target_register, value).is_err() {
            log::warn!(
                "init stream entry {i} targets out-of-range register {}, skipping",
                entry.target_register
            );
        }
    }
}

/// Executes `rf.inst_words` to completion, returning the value of
/// register X0 at the terminating `OP_RETURN`/`OP_END`.
fn run_inst_stream(frame: &mut Frame) -> Result<u64> {
    let words = &frame.rf.inst_words.clone();
    let mut pc = 0usize;

    loop {
        let op = word(words, pc)?;
        let base_op = op & !(BIN_UPDATE_FLAGS | FIELD_MEM_MODE);
        match base_op {
            OP_END => return frame.reg(0),
            OP_NOP => pc += 1,
            OP_RETURN => return frame.reg(0),
            OP_UNREACHABLE => return Err(Error::Unreachable(pc)),

            OP_LOAD_IMM => {
                let dst = word(words, pc + 1)?;
                let lo = word(words, pc + 2)?;
                let hi = word(words, pc + 3)?;
                frame.set_reg(dst, u64_from_halves(lo, hi))?;
                pc += 4;
            }
            OP_ADRP => {
                let dst = word(words, pc + 1)?;
                let lo = word(words, pc + 2)?;
                let hi = word(words, pc + 3)?;
                frame.set_reg(dst, u64_from_halves(lo, hi))?;
                pc += 4;
            }
            OP_MOV => {
                let dst = word(words, pc + 1)?;
                let src = word(words, pc + 2)?;
                let v = frame.reg(src)?;
                frame.set_reg(dst, v)?;
                pc += 3;
            }
            OP_BINARY => {
                let kind = word(words, pc + 1)?;
                let dst = word(words, pc + 2)?;
                let lhs = word(words, pc + 3)?;
                let rhs = word(words, pc + 4)?;
                let ty_idx = word(words, pc + 5)?;
                let ty = frame.ty(ty_idx);
                let lhs_v = frame.reg(lhs)?;
                let rhs_v = frame.reg(rhs)?;
                let width = width_bits_of(ty);
                let result = binary_apply(kind, lhs_v, rhs_v, width, is_signed(ty));
                if op & BIN_UPDATE_FLAGS != 0 {
                    frame.flags = compute_flags(kind, lhs_v, rhs_v, result, width);
                }
                frame.set_reg(dst, truncate_to_width(result, width))?;
                pc += 6;
            }
            OP_BINARY_IMM => {
                let kind = word(words, pc + 1)?;
                let dst = word(words, pc + 2)?;
                let lhs = word(words, pc + 3)?;
                let imm = word(words, pc + 4)? as u64;
                let ty_idx = word(words, pc + 5)?;
                let ty = frame.ty(ty_idx);
                let lhs_v = frame.reg(lhs)?;
                let width = width_bits_of(ty);
                let result = binary_apply(kind, lhs_v, imm, width, is_signed(ty));
                if op & BIN_UPDATE_FLAGS != 0 {
                    frame.flags = compute_flags(kind, lhs_v, imm, result, width);
                }
                frame.set_reg(dst, truncate_to_width(result, width))?;
                pc += 6;
            }
            OP_UNARY => {
                let kind = word(words, pc + 1)?;
                let dst = word(words, pc + 2)?;
                let src = word(words, pc + 3)?;
                let ty_idx = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let v = frame.reg(src)?;
                let width = width_bits_of(ty);
                let result = unary_apply(kind, v, width, is_signed(ty));
                frame.set_reg(dst, truncate_to_width(result, width))?;
                pc += 5;
            }
            OP_SIGN_EXTEND | OP_ZERO_EXTEND => {
                let dst = word(words, pc + 1)?;
                let src = word(words, pc + 2)?;
                let _src_ty = word(words, pc + 3)?;
                let from_width = word(words, pc + 4)?;
                let v = frame.reg(src)?;
                let narrowed = truncate_to_width(v, from_width);
                let extended = if base_op == OP_SIGN_EXTEND && is_negative(narrowed, from_width) {
                    narrowed | !((1u64 << from_width) - 1)
                } else {
                    narrowed
                };
                frame.set_reg(dst, extended)?;
                pc += 5;
            }
            OP_GET_FIELD if op & FIELD_MEM_MODE != 0 => {
                // Memory-addressed form: a `LDR`-family load, addressed the
                // same way `OP_READ` used to be.
                let dst = word(words, pc + 1)?;
                let base = word(words, pc + 2)?;
                let disp = word(words, pc + 3)? as i32 as i64;
                let ty_idx = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let addr = (frame.reg(base)? as i64 + disp) as u64;
                let v = unsafe { mem_read(addr, ty) };
                frame.set_reg(dst, v)?;
                pc += 5;
            }
            OP_GET_FIELD => {
                let dst = word(words, pc + 1)?;
                let src = word(words, pc + 2)?;
                let pos = word(words, pc + 3)?;
                let width = word(words, pc + 4)?;
                let ty_idx = word(words, pc + 5)?;
                let ty = frame.ty(ty_idx);
                let src_v = frame.reg(src)?;
                let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
                let mut extracted = (src_v >> pos) & mask;
                if is_signed(ty) && width > 0 && extracted & (1u64 << (width - 1)) != 0 {
                    extracted |= !mask;
                }
                frame.set_reg(dst, extracted)?;
                pc += 6;
            }
            OP_SET_FIELD if op & FIELD_MEM_MODE != 0 => {
                // Memory-addressed form: a `STR`-family store, addressed the
                // same way `OP_WRITE` used to be.
                let src = word(words, pc + 1)?;
                let base = word(words, pc + 2)?;
                let disp = word(words, pc + 3)? as i32 as i64;
                let ty_idx = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let addr = (frame.reg(base)? as i64 + disp) as u64;
                let v = frame.reg(src)?;
                unsafe { mem_write(addr, ty, v) };
                pc += 5;
            }
            OP_SET_FIELD => {
                let dst = word(words, pc + 1)?;
                let src = word(words, pc + 2)?;
                let pos = word(words, pc + 3)?;
                let width = word(words, pc + 4)?;
                let _ty_idx = word(words, pc + 5)?;
                let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
                let src_v = if src == u32::MAX {
                    0
                } else {
                    frame.reg(src)?
                };
                let dst_v = frame.reg(dst)?;
                let cleared = dst_v & !(mask << pos);
                let inserted = cleared | ((src_v & mask) << pos);
                frame.set_reg(dst, inserted)?;
                pc += 6;
            }
            OP_BITCAST => {
                let dst = word(words, pc + 1)?;
                let src = word(words, pc + 2)?;
                let ty_idx = word(words, pc + 3)?;
                let mode = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let width = width_bits_of(ty);
                let v = truncate_to_width(frame.reg(src)?, width);
                let swapped = byte_swap(v, width, mode != 0);
                frame.set_reg(dst, swapped)?;
                pc += 5;
            }
            OP_ATOMIC_LOAD => {
                let dst = word(words, pc + 1)?;
                let base = word(words, pc + 2)?;
                let ty_idx = word(words, pc + 3)?;
                let order = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let addr = frame.reg(base)?;
                apply_fence(order, true);
                let v = unsafe { mem_read(addr, ty) };
                frame.set_reg(dst, v)?;
                pc += 5;
            }
            OP_ATOMIC_STORE => {
                let src = word(words, pc + 1)?;
                let base = word(words, pc + 2)?;
                let ty_idx = word(words, pc + 3)?;
                let order = word(words, pc + 4)?;
                let ty = frame.ty(ty_idx);
                let addr = frame.reg(base)?;
                let v = if src == u32::MAX { 0 } else { frame.reg(src)? };
                unsafe { mem_write(addr, ty, v) };
                apply_fence(order, false);
                pc += 5;
            }
            OP_BRANCH => {
                let branch_id = word(words, pc + 1)?;
                pc = frame.branch_pc(branch_id)?;
            }
            OP_BRANCH_IF => {
                let src = word(words, pc + 1)?;
                let mode = word(words, pc + 2)?;
                let branch_id = word(words, pc + 3)?;
                let v = frame.reg(src)?;
                let take = if mode & 1 == 0 { v == 0 } else { v != 0 };
                if take {
                    pc = frame.branch_pc(branch_id)?;
                } else {
                    pc += 4;
                }
            }
            OP_BRANCH_IF_CC => {
                let field_a = word(words, pc + 1)?;
                let field_b = word(words, pc + 2)?;
                let field_c = word(words, pc + 3)?;
                let branch_id = word(words, pc + 4)?;
                let take = if field_b == CC_TEST_SENTINEL {
                    frame.flags.test(field_a)
                } else {
                    let v = frame.reg(field_a)?;
                    let bit = field_b;
                    let tbnz = field_c != 0;
                    let set = (v >> bit) & 1 != 0;
                    set == tbnz
                };
                if take {
                    pc = frame.branch_pc(branch_id)?;
                } else {
                    pc += 5;
                }
            }
            OP_BRANCH_REG => {
                let reg = word(words, pc + 1)?;
                let target = frame.reg(reg)?;
                // The only reachable indirect-branch target that makes
                // sense inside this function's own PC space is a value
                // previously loaded from `branch_words`; anything else is
                // a jump out of the function, which this interpreter
                // cannot follow (no cross-function PC space), so it ends
                // the call instead of faulting.
                if (target as usize) < frame.rf.inst_words.len() {
                    pc = target as usize;
                } else {
                    return frame.reg(0);
                }
            }
            OP_SELECT => {
                let dst = word(words, pc + 1)?;
                let cc = word(words, pc + 2)?;
                let t_reg = word(words, pc + 3)?;
                let f_reg = word(words, pc + 4)?;
                let _ty_idx = word(words, pc + 5)?;
                let v = if frame.flags.test(cc) {
                    frame.reg(t_reg)?
                } else {
                    frame.reg(f_reg)?
                };
                frame.set_reg(dst, v)?;
                pc += 6;
            }
            OP_CALL => {
                let func_reg = word(words, pc + 1)?;
                let addr = frame.reg(func_reg)?;
                let args = [
                    frame.reg(0)?,
                    frame.reg(1)?,
                    frame.reg(2)?,
                    frame.reg(3)?,
                    frame.reg(4)?,
                    frame.reg(5)?,
                ];
                let ret = call_native(addr, &args);
                frame.set_reg(0, ret)?;
                pc += 2;
            }
            OP_BL => {
                let branch_id = word(words, pc + 1)?;
                let addr = frame.bl_target(branch_id)?;
                let args = [
                    frame.reg(0)?,
                    frame.reg(1)?,
                    frame.reg(2)?,
                    frame.reg(3)?,
                    frame.reg(4)?,
                    frame.reg(5)?,
                ];
                let ret = call_native(addr, &args);
                frame.set_reg(0, ret)?;
                pc += 2;
            }
            OP_ALLOC_RETURN => {
                // Prelude marker only; the invisible-return-pointer slot
                // (X8) is already published by `Engine::execute` before the
                // instruction stream starts.
                pc += 1;
            }
            OP_ALLOC_VSP => {
                let fp_idx = word(words, pc + 1)?;
                let sp_idx = word(words, pc + 2)?;
                if frame.vsp_storage.is_empty() {
                    frame.vsp_storage = vec![0u8; 4096];
                }
                let top = frame.vsp_storage.as_ptr() as u64 + frame.vsp_storage.len() as u64;
                frame.set_reg(fp_idx, top)?;
                frame.set_reg(sp_idx, top)?;
                pc += 3;
            }
            OP_RESTORE_REG | OP_ALLOC_MEMORY | OP_LEA | OP_TRUNCATE | OP_FLOAT_EXTEND
            | OP_FLOAT_TRUNCATE | OP_INT_TO_FLOAT | OP_FLOAT_TO_INT | OP_DYNAMIC_CAST
            | OP_PHI | OP_MEMCPY | OP_MEMSET | OP_STRLEN | OP_FETCH_NEXT | OP_CALL_INDIRECT
            | OP_SWITCH | OP_GET_PTR | OP_ARRAY_ELEM | OP_ATOMIC_ADD | OP_ATOMIC_SUB
            | OP_ATOMIC_XCHG | OP_ATOMIC_CAS | OP_FENCE | OP_SET_RETURN_PC | OP_STORE
            | OP_STORE_CONST | OP_LOAD_CONST | OP_GET_ELEMENT | OP_COPY | OP_TYPE_CONVERT
            | OP_LOAD_CONST64 | OP_READ | OP_WRITE | OP_CMP => {
                return Err(Error::UnexercisedOpcode(base_op, pc));
            }

            other => return Err(Error::UnknownOpcode(other, pc)),
        }
    }
}

/// Mirrors the translator's `CC_TEST_SENTINEL`: marks an `OP_BRANCH_IF_CC`
/// operand word as a condition-code test rather than a TBZ/TBNZ bit-index
/// test. Duplicated as a plain constant (not a dependency on the
/// translator crate) since no real bit index reaches this value.
const CC_TEST_SENTINEL: u32 = u32::MAX;

fn binary_apply(kind: u32, lhs: u64, rhs: u64, width: u32, signed: bool) -> u64 {
    match kind {
        BIN_ADD => lhs.wrapping_add(rhs),
        BIN_SUB => lhs.wrapping_sub(rhs),
        BIN_MUL => lhs.wrapping_mul(rhs),
        BIN_AND => lhs & rhs,
        BIN_OR => lhs | rhs,
        BIN_XOR => lhs ^ rhs,
        BIN_SHL => lhs.wrapping_shl(rhs as u32),
        BIN_LSR => truncate_to_width(lhs, width).wrapping_shr(rhs as u32),
        BIN_ASR => {
            let shift = (rhs as u32).min(width.saturating_sub(1));
            if signed {
                (sign_extend(lhs, width) >> shift) as u64
            } else {
                truncate_to_width(lhs, width).wrapping_shr(shift)
            }
        }
        BIN_DIV => {
            if rhs == 0 {
                0
            } else if signed {
                (sign_extend(lhs, width) / sign_extend(rhs, width)) as u64
            } else {
                truncate_to_width(lhs, width) / truncate_to_width(rhs, width)
            }
        }
        BIN_IDIV => {
            if rhs == 0 {
                0
            } else {
                truncate_to_width(lhs, width) / truncate_to_width(rhs, width)
            }
        }
        BIN_MOD => {
            if rhs == 0 {
                0
            } else if signed {
                (sign_extend(lhs, width) % sign_extend(rhs, width)) as u64
            } else {
                truncate_to_width(lhs, width) % truncate_to_width(rhs, width)
            }
        }
        BIN_FMOD => {
            let a = f64::from_bits(lhs);
            let b = f64::from_bits(rhs);
            (a % b).to_bits()
        }
        _ => 0,
    }
}

fn sign_extend(value: u64, width: u32) -> i64 {
    if width >= 64 {
        return value as i64;
    }
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

fn unary_apply(kind: u32, v: u64, width: u32, signed: bool) -> u64 {
    match kind {
        UNARY_NEG => truncate_to_width(v, width).wrapping_neg(),
        UNARY_NOT => !v,
        UNARY_LNOT => (v == 0) as u64,
        UNARY_ABS => {
            if signed {
                (sign_extend(v, width).unsigned_abs()) as u64
            } else {
                v
            }
        }
        UNARY_SQRT => f64::from_bits(v).sqrt().to_bits(),
        UNARY_CEIL => f64::from_bits(v).ceil().to_bits(),
        UNARY_FLOOR => f64::from_bits(v).floor().to_bits(),
        UNARY_ROUND => f64::from_bits(v).round().to_bits(),
        UNARY_CLZ => truncate_to_width(v, width).leading_zeros() as u64 - (64 - width) as u64,
        _ => v,
    }
}

/// REV swaps all bytes in the declared width; REV16 swaps bytes within
/// each 16-bit halfword of the register instead.
fn byte_swap(v: u64, width: u32, half_word_swap: bool) -> u64 {
    if half_word_swap {
        let mut result = 0u64;
        for i in 0..(width / 16) {
            let half = ((v >> (i * 16)) & 0xffff) as u16;
            result |= (half.swap_bytes() as u64) << (i * 16);
        }
        result
    } else {
        match width {
            16 => (v as u16).swap_bytes() as u64,
            32 => (v as u32).swap_bytes() as u64,
            _ => v.swap_bytes(),
        }
    }
}

fn mem_width_bytes(ty: Type) -> usize {
    match ty {
        Type::Primitive(p) => p.byte_width() as usize,
        Type::Struct => 8,
    }
}

/// Reads `width(ty)` bytes from `addr`, sign- or zero-extending to 64 bits
/// per `ty`'s signedness.
///
/// # Safety
/// `addr` must point at readable memory of at least `mem_width_bytes(ty)`
/// bytes — guaranteed by the guest function's own well-formedness, not by
/// this interpreter, matching the spec's "no partial state on a malformed
/// function" failure model.
unsafe fn mem_read(addr: u64, ty: Type) -> u64 {
    let ptr = addr as *const u8;
    let width = mem_width_bytes(ty);
    let raw: u64 = match width {
        1 => std::ptr::read_unaligned(ptr) as u64,
        2 => u16::from_ne_bytes(std::ptr::read_unaligned(ptr as *const [u8; 2])) as u64,
        4 => u32::from_ne_bytes(std::ptr::read_unaligned(ptr as *const [u8; 4])) as u64,
        _ => u64::from_ne_bytes(std::ptr::read_unaligned(ptr as *const [u8; 8])),
    };
    if is_signed(ty) {
        sign_extend(raw, (width * 8) as u32) as u64
    } else {
        raw
    }
}

/// # Safety
/// Same contract as [`mem_read`], for writes.
unsafe fn mem_write(addr: u64, ty: Type, value: u64) {
    let ptr = addr as *mut u8;
    match mem_width_bytes(ty) {
        1 => std::ptr::write_unaligned(ptr, value as u8),
        2 => std::ptr::write_unaligned(ptr as *mut [u8; 2], (value as u16).to_ne_bytes()),
        4 => std::ptr::write_unaligned(ptr as *mut [u8; 4], (value as u32).to_ne_bytes()),
        _ => std::ptr::write_unaligned(ptr as *mut [u8; 8], value.to_ne_bytes()),
    }
}

fn apply_fence(order: u32, is_load: bool) {
    use std::sync::atomic::{fence, Ordering};
    let ordering = match order {
        VM_MEM_ORDER_ACQUIRE => Ordering::Acquire,
        VM_MEM_ORDER_RELEASE => Ordering::Release,
        VM_MEM_ORDER_ACQ_REL => Ordering::AcqRel,
        VM_MEM_ORDER_SEQ_CST => Ordering::SeqCst,
        _ => return,
    };
    // A single-threaded-guest interpreter has no hardware race to order
    // against; the fence exists so debug builds under a race detector see
    // the declared ordering at the right program point.
    let _ = is_load;
    fence(ordering);
}

/// Process-wide (per `Engine` instance) cache of decoded functions and
/// shared branch-address tables, guarded the way the spec's concurrency
/// model requires: read-only access to a cached function is safe from any
/// thread, mutation of the cache itself is serialized.
#[derive(Default)]
pub struct Engine {
    cache: RwLock<HashMap<(String, u64), Arc<RuntimeFunction>>>,
    shared_branch_addrs: RwLock<HashMap<String, Vec<u64>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_function(&self, so_name: &str, rf: Arc<RuntimeFunction>) {
        self.cache
            .write()
            .insert((so_name.to_string(), rf.function_offset), rf);
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn set_shared_branch_addrs(&self, so_name: &str, addrs: Vec<u64>) {
        self.shared_branch_addrs
            .write()
            .insert(so_name.to_string(), addrs);
    }

    pub fn clear_shared_branch_addrs(&self, so_name: &str) {
        self.shared_branch_addrs.write().remove(so_name);
    }

    /// Looks up `(so_name, function_offset)`, resets its register file,
    /// maps `params` into X0.., publishes `ret_buffer` into X8, and runs
    /// it to completion. `ret_buffer == 0` means the function has no
    /// invisible-pointer return in play.
    pub fn execute(
        &self,
        so_name: &str,
        function_offset: u64,
        params: &[u64],
        ret_buffer: u64,
    ) -> Result<u64> {
        let rf = self
            .cache
            .read()
            .get(&(so_name.to_string(), function_offset))
            .cloned()
            .ok_or_else(|| Error::FunctionNotCached {
                so_name: so_name.to_string(),
                function_offset,
            })?;

        let shared = self
            .shared_branch_addrs
            .read()
            .get(so_name)
            .cloned()
            .unwrap_or_default();

        let mut registers: Vec<u64> = rf.registers.iter().map(|r: &Register| r.value).collect();
        for (i, &p) in params.iter().take(6).enumerate() {
            if let Some(slot) = registers.get_mut(i) {
                *slot = p;
            }
        }
        if let Some(slot) = registers.get_mut(8) {
            *slot = ret_buffer;
        }

        let mut frame = Frame {
            registers,
            flags: Flags::default(),
            rf: &rf,
            shared_branch_addrs: &shared,
            vsp_storage: Vec::new(),
        };
        run_init_stream(&mut frame);
        run_inst_stream(&mut frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmforge_function::EncodedFunction;

    fn cache_and_run(
        engine: &Engine,
        so_name: &str,
        f: EncodedFunction,
        params: &[u64],
    ) -> Result<u64> {
        let rf = RuntimeFunction::from_encoded(&f).unwrap();
        engine.cache_function(so_name, Arc::new(rf));
        engine.execute(so_name, f.function_offset, params, 0)
    }

    fn reg_count(n: u32) -> u32 {
        n.max(32)
    }

    #[test]
    fn fun_add_returns_sum() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![
                OP_BINARY, BIN_ADD, 0, 0, 1, 0, // x0 = x0 + x1
                OP_RETURN,
            ],
            function_offset: 1,
            ..Default::default()
        };
        let engine = Engine::new();
        let result = cache_and_run(&engine, "companion.so", f, &[2, 4]).unwrap();
        assert_eq!(result, 6);
    }

    #[test]
    fn unknown_function_is_not_cached_error() {
        let engine = Engine::new();
        let err = engine.execute("nope.so", 0x10, &[], 0).unwrap_err();
        assert!(matches!(err, Error::FunctionNotCached { .. }));
    }

    #[test]
    fn loop_sums_multiples_of_step() {
        // x0 = n, x1 = step, x2 = acc = 0, x3 = i = 1.
        // loop (pc 8): if i > n, branch to end; else acc += i*step, i += 1, branch loop.
        // end: x0 = acc; return.
        //
        // Word offsets (verified by hand, not computed at runtime):
        //   0..4   OP_LOAD_IMM x2 = 0
        //   4..8   OP_LOAD_IMM x3 = 1           <- loop_pc = 8
        //   8..14  OP_BINARY|FLAGS SUB x4 = i - n
        //   14..19 OP_BRANCH_IF_CC cc=GT(12) -> branch_id 1 (end)
        //   19..25 OP_BINARY MUL x5 = i * step
        //   25..31 OP_BINARY ADD acc += x5
        //   31..37 OP_BINARY_IMM ADD i += 1
        //   37..39 OP_BRANCH -> branch_id 0 (loop)
        //   39..42 OP_MOV x0 = acc              <- end_pc = 39
        //   42     OP_RETURN
        let words = vec![
            OP_LOAD_IMM, 2, 0, 0,
            OP_LOAD_IMM, 3, 1, 0,
            OP_BINARY | BIN_UPDATE_FLAGS, BIN_SUB, 4, 3, 0, 0,
            OP_BRANCH_IF_CC, 12, CC_TEST_SENTINEL, 0, 1,
            OP_BINARY, BIN_MUL, 5, 3, 1, 0,
            OP_BINARY, BIN_ADD, 2, 2, 5, 0,
            OP_BINARY_IMM, BIN_ADD, 3, 3, 1, 0,
            OP_BRANCH, 0,
            OP_MOV, 0, 2,
            OP_RETURN,
        ];
        assert_eq!(words.len(), 43);
        let f = EncodedFunction {
            register_count: reg_count(8),
            inst_words: words,
            branch_words: vec![8, 39],
            function_offset: 2,
            ..Default::default()
        };
        let engine = Engine::new();
        let result = cache_and_run(&engine, "companion.so", f, &[4, 4]).unwrap();
        assert_eq!(result, (1..=4u64).map(|i| i * 4).sum::<u64>());
    }

    #[test]
    fn bl_calls_through_shared_branch_addrs_table() {
        extern "C" fn callee(a: u64, b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
            a + b + 100
        }
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![OP_BL, 0, OP_RETURN],
            branch_addrs: vec![0], // unresolved locally; shared table wins
            function_offset: 3,
            ..Default::default()
        };
        let engine = Engine::new();
        engine.set_shared_branch_addrs("companion.so", vec![callee as usize as u64]);
        let result = cache_and_run(&engine, "companion.so", f, &[2, 4]).unwrap();
        assert_eq!(result, 106);
    }

    #[test]
    fn set_field_sentinel_zeroes_target_bits() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![
                OP_LOAD_IMM, 0, 0xff, 0, // x0 = 0xff
                OP_SET_FIELD, 0, u32::MAX, 0, 8, 0, // clear low byte
                OP_RETURN,
            ],
            function_offset: 4,
            ..Default::default()
        };
        let engine = Engine::new();
        let result = cache_and_run(&engine, "companion.so", f, &[]).unwrap();
        assert_eq!(result, 0);
    }

    #[test]
    fn unexercised_opcode_is_a_named_error_not_a_guess() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![OP_LEA],
            function_offset: 5,
            ..Default::default()
        };
        let engine = Engine::new();
        let err = cache_and_run(&engine, "companion.so", f, &[]).unwrap_err();
        assert!(matches!(err, Error::UnexercisedOpcode(op, _) if op == OP_LEA));
    }

    #[test]
    fn opcodes_the_translator_never_emits_are_all_conservative_errors() {
        // These are declared in the shared opcode table but no lowering in
        // `vmforge-translator` ever produces them; each must fail loud
        // rather than have this crate guess an operand-word count for it.
        let never_emitted = [
            OP_RESTORE_REG,
            OP_ALLOC_MEMORY,
            OP_READ,
            OP_WRITE,
            OP_LOAD_CONST64,
            OP_CMP,
            OP_LEA,
            OP_TRUNCATE,
            OP_FLOAT_EXTEND,
            OP_FLOAT_TRUNCATE,
            OP_INT_TO_FLOAT,
            OP_FLOAT_TO_INT,
            OP_DYNAMIC_CAST,
            OP_SWITCH,
        ];
        for (i, &op) in never_emitted.iter().enumerate() {
            let f = EncodedFunction {
                register_count: reg_count(4),
                inst_words: vec![op],
                function_offset: 100 + i as u64,
                ..Default::default()
            };
            let engine = Engine::new();
            let err = cache_and_run(&engine, "companion.so", f, &[]).unwrap_err();
            assert!(
                matches!(err, Error::UnexercisedOpcode(got, _) if got == op),
                "opcode {op:#x} did not produce UnexercisedOpcode"
            );
        }
    }

    #[test]
    fn unreachable_is_fatal_for_that_call() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![OP_UNREACHABLE],
            function_offset: 6,
            ..Default::default()
        };
        let engine = Engine::new();
        let err = cache_and_run(&engine, "companion.so", f, &[]).unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[test]
    fn clear_cache_drops_all_entries() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![OP_RETURN],
            function_offset: 7,
            ..Default::default()
        };
        let engine = Engine::new();
        let rf = RuntimeFunction::from_encoded(&f).unwrap();
        engine.cache_function("a.so", Arc::new(rf));
        engine.clear_cache();
        assert!(engine.execute("a.so", 7, &[], 0).is_err());
    }

    #[test]
    fn alloc_vsp_gives_fp_and_sp_a_real_writable_stack_slot() {
        let f = EncodedFunction {
            register_count: reg_count(32),
            inst_words: vec![
                OP_ALLOC_RETURN,
                OP_ALLOC_VSP, 29, 31,
                OP_SET_FIELD | FIELD_MEM_MODE, 0, 31, (-8i32) as u32, 0, // [sp, #-8] = x0
                OP_GET_FIELD | FIELD_MEM_MODE, 1, 31, (-8i32) as u32, 0, // x1 = [sp, #-8]
                OP_MOV, 0, 1,
                OP_RETURN,
            ],
            function_offset: 9,
            ..Default::default()
        };
        let engine = Engine::new();
        let result = cache_and_run(&engine, "companion.so", f, &[42]).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn csel_picks_branch_by_condition() {
        let f = EncodedFunction {
            register_count: reg_count(4),
            inst_words: vec![
                OP_BINARY | BIN_UPDATE_FLAGS, BIN_SUB, 2, 0, 1, 0, // x2 = x0 - x1, set flags
                OP_SELECT, 0, 10, 0, 1, 0, // x0 = (GE) ? x0 : x1
                OP_RETURN,
            ],
            function_offset: 8,
            ..Default::default()
        };
        let engine = Engine::new();
        let result = cache_and_run(&engine, "companion.so", f, &[4, 2]).unwrap();
        assert_eq!(result, 4);
    }
}
