//! Runtime value-type tags and the per-function type manager, plus the
//! shared error taxonomy (`ParseError`/`ValidationError`) used by every
//! other `vmforge-*` crate.

use std::fmt;
use thiserror::Error;

/// Shared leaf error kinds. Crates further up the stack (translator,
/// container, linker, takeover) wrap this in their own richer error enum
/// rather than re-deriving parse/validation semantics.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed encoded bit stream, bundle, footer, or ELF. Carries the
    /// offending field and, where available, a byte offset.
    #[error("parse error in `{field}`{offset}: {detail}", offset = .offset.map(|o| format!(" at offset {o}")).unwrap_or_default())]
    Parse {
        field: &'static str,
        detail: String,
        offset: Option<u64>,
    },
    /// Structurally well-formed but violates a named invariant.
    #[error("validation error: invariant `{invariant}` violated: {detail}")]
    Validation {
        invariant: &'static str,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(field: &'static str, detail: impl Into<String>) -> Self {
        Error::Parse {
            field,
            detail: detail.into(),
            offset: None,
        }
    }

    pub fn parse_at(field: &'static str, detail: impl Into<String>, offset: u64) -> Self {
        Error::Parse {
            field,
            detail: detail.into(),
            offset: Some(offset),
        }
    }

    pub fn validation(invariant: &'static str, detail: impl Into<String>) -> Self {
        Error::Validation {
            invariant,
            detail: detail.into(),
        }
    }
}

/// Primitive scalar kinds the VM's type tags can describe. Widths mirror
/// what the translator derives from ARM64 operand register width (32-bit
/// `W*` registers tag as 32-bit, `X*` as 64-bit); unsigned variants are
/// chosen explicitly by lowerings whose semantics require them (logical
/// shifts, reverse-byte, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl PrimitiveType {
    pub fn byte_width(self) -> u32 {
        match self {
            PrimitiveType::I8 | PrimitiveType::U8 => 1,
            PrimitiveType::I16 | PrimitiveType::U16 => 2,
            PrimitiveType::I32 | PrimitiveType::U32 => 4,
            PrimitiveType::I64 | PrimitiveType::U64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveType::I8 | PrimitiveType::I16 | PrimitiveType::I32 | PrimitiveType::I64
        )
    }
}

/// Wire-level type tag values. These are the literal integers stored in an
/// encoded function payload's `type_tags` array; a function's type table is
/// a sequence of these tags, resolved into `Type`s by a `TypeManager`.
///
/// `STRUCT` (3) is deliberately a reserved gap between `INT64_UNSIGNED` (2)
/// and `INT32_SIGNED` (4): no exercised ARM64 lowering in this crate
/// produces a struct-kind tag directly (only `type_tags[0]` can be one, as
/// the function's signature type), so the value is chosen conservatively
/// rather than guessed from an unexercised call site.
pub mod tag {
    pub const INT8_SIGNED: u32 = 0;
    pub const INT16_SIGNED: u32 = 1;
    pub const INT64_UNSIGNED: u32 = 2;
    pub const STRUCT: u32 = 3;
    pub const INT32_SIGNED: u32 = 4;
    pub const INT16_UNSIGNED: u32 = 0xB;
    pub const INT32_UNSIGNED: u32 = 0xD;
    pub const INT64_SIGNED: u32 = 0xE;
    pub const INT8_UNSIGNED: u32 = 0x15;
}

/// A resolved type object: either a primitive scalar or the function's
/// struct-kind signature type. Lifetime is bound to the owning
/// `TypeManager`, which in turn lives as long as its runtime function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Primitive(PrimitiveType),
    /// An opaque struct/compound kind. Only ever produced for
    /// `type_tags[0]` when that function returns an object by invisible
    /// pointer; this crate does not decompose struct layouts further.
    Struct,
}

impl Type {
    pub fn from_tag(raw: u32) -> Result<Self> {
        Ok(match raw {
            tag::INT8_SIGNED => Type::Primitive(PrimitiveType::I8),
            tag::INT8_UNSIGNED => Type::Primitive(PrimitiveType::U8),
            tag::INT16_SIGNED => Type::Primitive(PrimitiveType::I16),
            tag::INT16_UNSIGNED => Type::Primitive(PrimitiveType::U16),
            tag::INT32_SIGNED => Type::Primitive(PrimitiveType::I32),
            tag::INT32_UNSIGNED => Type::Primitive(PrimitiveType::U32),
            tag::INT64_SIGNED => Type::Primitive(PrimitiveType::I64),
            tag::INT64_UNSIGNED => Type::Primitive(PrimitiveType::U64),
            tag::STRUCT => Type::Struct,
            other => {
                return Err(Error::parse(
                    "type_tag",
                    format!("unrecognized type tag {other:#x}"),
                ))
            }
        })
    }

    pub fn to_tag(self) -> u32 {
        match self {
            Type::Primitive(PrimitiveType::I8) => tag::INT8_SIGNED,
            Type::Primitive(PrimitiveType::U8) => tag::INT8_UNSIGNED,
            Type::Primitive(PrimitiveType::I16) => tag::INT16_SIGNED,
            Type::Primitive(PrimitiveType::U16) => tag::INT16_UNSIGNED,
            Type::Primitive(PrimitiveType::I32) => tag::INT32_SIGNED,
            Type::Primitive(PrimitiveType::U32) => tag::INT32_UNSIGNED,
            Type::Primitive(PrimitiveType::I64) => tag::INT64_SIGNED,
            Type::Primitive(PrimitiveType::U64) => tag::INT64_UNSIGNED,
            Type::Struct => tag::STRUCT,
        }
    }

    /// Returns the canonical tag for a W*-width (32-bit) or X*-width
    /// (64-bit) register operand, signed unless `unsigned` is requested —
    /// mirrors the translator's width/signedness-driven tag selection.
    pub fn for_register_width(is_32_bit: bool, unsigned: bool) -> Self {
        match (is_32_bit, unsigned) {
            (true, false) => Type::Primitive(PrimitiveType::I32),
            (true, true) => Type::Primitive(PrimitiveType::U32),
            (false, false) => Type::Primitive(PrimitiveType::I64),
            (false, true) => Type::Primitive(PrimitiveType::U64),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(PrimitiveType::I8) => write!(f, "i8"),
            Type::Primitive(PrimitiveType::U8) => write!(f, "u8"),
            Type::Primitive(PrimitiveType::I16) => write!(f, "i16"),
            Type::Primitive(PrimitiveType::U16) => write!(f, "u16"),
            Type::Primitive(PrimitiveType::I32) => write!(f, "i32"),
            Type::Primitive(PrimitiveType::U32) => write!(f, "u32"),
            Type::Primitive(PrimitiveType::I64) => write!(f, "i64"),
            Type::Primitive(PrimitiveType::U64) => write!(f, "u64"),
            Type::Struct => write!(f, "struct"),
        }
    }
}

/// Resolves a function's `type_tags` array into `Type`s, scoped to that
/// function's lifetime. `type_tags[0]`, if a struct kind, is the function's
/// signature type (see spec §3).
#[derive(Debug, Clone, Default)]
pub struct TypeManager {
    types: Vec<Type>,
}

impl TypeManager {
    pub fn from_tags(tags: &[u32]) -> Result<Self> {
        let types = tags
            .iter()
            .copied()
            .map(Type::from_tag)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { types })
    }

    pub fn get(&self, index: u32) -> Option<Type> {
        self.types.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The function's signature type, if `type_tags[0]` is a struct kind.
    pub fn signature_type(&self) -> Option<Type> {
        match self.types.first() {
            Some(Type::Struct) => Some(Type::Struct),
            _ => None,
        }
    }

    /// Interns `ty`'s tag into `tags` if not already present, returning its
    /// index. Mirrors the translator's `getOrAddTypeTag` helper.
    pub fn intern(tags: &mut Vec<u32>, ty: Type) -> u32 {
        let raw = ty.to_tag();
        if let Some(pos) = tags.iter().position(|&t| t == raw) {
            pos as u32
        } else {
            tags.push(raw);
            (tags.len() - 1) as u32
        }
    }
}

/// Bytecode opcode and modifier constants shared between the translator
/// (which emits them) and the engine (which dispatches on them).
pub mod opcode {
    pub const OP_END: u32 = 0;
    pub const OP_BINARY: u32 = 1;
    pub const OP_TYPE_CONVERT: u32 = 2;
    pub const OP_LOAD_CONST: u32 = 3;
    pub const OP_STORE_CONST: u32 = 4;
    pub const OP_GET_ELEMENT: u32 = 5;
    pub const OP_ALLOC_RETURN: u32 = 6;
    pub const OP_STORE: u32 = 7;
    pub const OP_LOAD_CONST64: u32 = 8;
    pub const OP_NOP: u32 = 9;
    pub const OP_COPY: u32 = 10;
    pub const OP_GET_FIELD: u32 = 11;
    pub const OP_CMP: u32 = 12;
    pub const OP_SET_FIELD: u32 = 13;
    pub const OP_RESTORE_REG: u32 = 14;
    pub const OP_CALL: u32 = 15;
    pub const OP_RETURN: u32 = 16;
    pub const OP_BRANCH: u32 = 17;
    pub const OP_BRANCH_IF: u32 = 18;
    pub const OP_ALLOC_MEMORY: u32 = 19;
    pub const OP_MOV: u32 = 20;
    pub const OP_LOAD_IMM: u32 = 21;
    pub const OP_DYNAMIC_CAST: u32 = 22;
    pub const OP_UNARY: u32 = 23;
    pub const OP_PHI: u32 = 24;
    pub const OP_SELECT: u32 = 25;
    pub const OP_MEMCPY: u32 = 26;
    pub const OP_MEMSET: u32 = 27;
    pub const OP_STRLEN: u32 = 28;
    pub const OP_FETCH_NEXT: u32 = 29;
    pub const OP_CALL_INDIRECT: u32 = 30;
    pub const OP_SWITCH: u32 = 31;
    pub const OP_GET_PTR: u32 = 32;
    pub const OP_BITCAST: u32 = 33;
    pub const OP_SIGN_EXTEND: u32 = 34;
    pub const OP_ZERO_EXTEND: u32 = 35;
    pub const OP_TRUNCATE: u32 = 36;
    pub const OP_FLOAT_EXTEND: u32 = 37;
    pub const OP_FLOAT_TRUNCATE: u32 = 38;
    pub const OP_INT_TO_FLOAT: u32 = 39;
    pub const OP_ARRAY_ELEM: u32 = 40;
    pub const OP_FLOAT_TO_INT: u32 = 41;
    pub const OP_READ: u32 = 42;
    pub const OP_WRITE: u32 = 43;
    pub const OP_LEA: u32 = 44;
    pub const OP_ATOMIC_ADD: u32 = 45;
    pub const OP_ATOMIC_SUB: u32 = 46;
    pub const OP_ATOMIC_XCHG: u32 = 47;
    pub const OP_ATOMIC_CAS: u32 = 48;
    pub const OP_FENCE: u32 = 49;
    pub const OP_UNREACHABLE: u32 = 50;
    pub const OP_ALLOC_VSP: u32 = 51;
    pub const OP_BINARY_IMM: u32 = 52;
    pub const OP_BRANCH_IF_CC: u32 = 53;
    pub const OP_SET_RETURN_PC: u32 = 54;
    pub const OP_BL: u32 = 55;
    pub const OP_ADRP: u32 = 56;
    pub const OP_ATOMIC_LOAD: u32 = 57;
    pub const OP_ATOMIC_STORE: u32 = 58;
    pub const OP_BRANCH_REG: u32 = 59;

    pub const BIN_XOR: u32 = 0;
    pub const BIN_SUB: u32 = 1;
    pub const BIN_ASR: u32 = 2;
    pub const BIN_DIV: u32 = 3;
    pub const BIN_ADD: u32 = 4;
    pub const BIN_OR: u32 = 5;
    pub const BIN_MOD: u32 = 6;
    pub const BIN_IDIV: u32 = 7;
    pub const BIN_FMOD: u32 = 8;
    pub const BIN_MUL: u32 = 9;
    pub const BIN_LSR: u32 = 0xA;
    pub const BIN_SHL: u32 = 0xB;
    pub const BIN_AND: u32 = 0xC;

    /// OR'd into a `BIN_*` opcode word to request that the op also update
    /// condition flags (the `S`-suffixed ARM64 forms: ADDS, SUBS, ANDS...).
    pub const BIN_UPDATE_FLAGS: u32 = 0x40;

    /// OR'd into `OP_GET_FIELD`/`OP_SET_FIELD` to select the memory-addressed
    /// form (`LDR`/`LDRB`/`LDRH`/`LDRSB`/`LDRSH`/`LDRSW`/`LDP` and
    /// `STR`/`STRB`/`STRH`/`STP`) instead of the register-bitfield form
    /// (`UBFX`/`SBFX`/`UBFM`/`SBFM`/`UBFIZ`/`SBFIZ`/`EXTR`).
    pub const FIELD_MEM_MODE: u32 = 0x80;

    pub const UNARY_NEG: u32 = 0;
    pub const UNARY_NOT: u32 = 1;
    pub const UNARY_LNOT: u32 = 2;
    pub const UNARY_ABS: u32 = 3;
    pub const UNARY_SQRT: u32 = 4;
    pub const UNARY_CEIL: u32 = 5;
    pub const UNARY_FLOOR: u32 = 6;
    pub const UNARY_ROUND: u32 = 7;
    pub const UNARY_CLZ: u32 = 8;

    pub const CMP_EQ: u32 = 0x20;

    pub const VM_MEM_ORDER_RELAXED: u32 = 0;
    pub const VM_MEM_ORDER_ACQUIRE: u32 = 1;
    pub const VM_MEM_ORDER_RELEASE: u32 = 2;
    pub const VM_MEM_ORDER_ACQ_REL: u32 = 3;
    pub const VM_MEM_ORDER_SEQ_CST: u32 = 4;
}

/// Initializes the `log` backend for in-process use (idempotent). Library
/// crates never call this themselves; it exists so integration tests and
/// the root crate's `vm_init` can request it without duplicating
/// `env_logger` setup.
pub fn init_test_logging() {
    let _ = env_logger_shim::try_init();
}

// A minimal indirection so this crate does not need a hard `env_logger`
// dependency merely to expose a one-line test helper; the root crate owns
// the real `env_logger` initialization for production use.
mod env_logger_shim {
    pub fn try_init() -> Result<(), log::SetLoggerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_through_type() {
        let cases = [
            tag::INT8_SIGNED,
            tag::INT8_UNSIGNED,
            tag::INT16_SIGNED,
            tag::INT16_UNSIGNED,
            tag::INT32_SIGNED,
            tag::INT32_UNSIGNED,
            tag::INT64_SIGNED,
            tag::INT64_UNSIGNED,
            tag::STRUCT,
        ];
        for raw in cases {
            let ty = Type::from_tag(raw).unwrap();
            assert_eq!(ty.to_tag(), raw);
        }
    }

    #[test]
    fn unknown_tag_is_parse_error() {
        assert!(Type::from_tag(0x2A).is_err());
    }

    #[test]
    fn type_manager_resolves_signature_type() {
        let tm = TypeManager::from_tags(&[tag::STRUCT, tag::INT32_SIGNED]).unwrap();
        assert_eq!(tm.signature_type(), Some(Type::Struct));
        assert_eq!(tm.get(1), Some(Type::Primitive(PrimitiveType::I32)));
        assert_eq!(tm.get(2), None);
    }

    #[test]
    fn type_manager_without_struct_header_has_no_signature_type() {
        let tm = TypeManager::from_tags(&[tag::INT32_SIGNED]).unwrap();
        assert_eq!(tm.signature_type(), None);
    }

    #[test]
    fn intern_dedups_existing_tags() {
        let mut tags = vec![tag::INT32_SIGNED, tag::INT64_SIGNED];
        let idx = TypeManager::intern(&mut tags, Type::Primitive(PrimitiveType::I32));
        assert_eq!(idx, 0);
        assert_eq!(tags.len(), 2);

        let idx2 = TypeManager::intern(&mut tags, Type::Primitive(PrimitiveType::U8));
        assert_eq!(idx2, 2);
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn opcode_constants_are_distinct() {
        use opcode::*;
        let ops = [
            OP_END, OP_BINARY, OP_TYPE_CONVERT, OP_LOAD_CONST, OP_STORE_CONST, OP_GET_ELEMENT,
            OP_ALLOC_RETURN, OP_STORE, OP_LOAD_CONST64, OP_NOP, OP_COPY, OP_GET_FIELD, OP_CMP,
            OP_SET_FIELD, OP_RESTORE_REG, OP_CALL, OP_RETURN, OP_BRANCH, OP_BRANCH_IF,
            OP_ALLOC_MEMORY, OP_MOV, OP_LOAD_IMM, OP_DYNAMIC_CAST, OP_UNARY, OP_PHI, OP_SELECT,
            OP_MEMCPY, OP_MEMSET, OP_STRLEN, OP_FETCH_NEXT, OP_CALL_INDIRECT, OP_SWITCH,
            OP_GET_PTR, OP_BITCAST, OP_SIGN_EXTEND, OP_ZERO_EXTEND, OP_TRUNCATE, OP_FLOAT_EXTEND,
            OP_FLOAT_TRUNCATE, OP_INT_TO_FLOAT, OP_ARRAY_ELEM, OP_FLOAT_TO_INT, OP_READ, OP_WRITE,
            OP_LEA, OP_ATOMIC_ADD, OP_ATOMIC_SUB, OP_ATOMIC_XCHG, OP_ATOMIC_CAS, OP_FENCE,
            OP_UNREACHABLE, OP_ALLOC_VSP, OP_BINARY_IMM, OP_BRANCH_IF_CC, OP_SET_RETURN_PC,
            OP_BL, OP_ADRP, OP_ATOMIC_LOAD, OP_ATOMIC_STORE, OP_BRANCH_REG,
        ];
        let mut sorted = ops.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ops.len());
        assert_eq!(OP_END, 0);
        assert_eq!(OP_BRANCH_REG, 59);
    }

    #[test]
    fn for_register_width_selects_signedness_and_width() {
        assert_eq!(
            Type::for_register_width(true, false),
            Type::Primitive(PrimitiveType::I32)
        );
        assert_eq!(
            Type::for_register_width(false, true),
            Type::Primitive(PrimitiveType::U64)
        );
    }
}
