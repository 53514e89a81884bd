//! Encoded function payload: the on-disk bytecode format a translator
//! produces and a bundle stores, plus the decoded, execution-ready
//! `RuntimeFunction` the engine actually interprets.

use smallvec::SmallVec;
use thiserror::Error;
use vmforge_bitstream::{BitReader6, BitWriter6};
use vmforge_types::TypeManager;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    BitStream(#[from] vmforge_bitstream::Error),
    #[error(transparent)]
    Types(#[from] vmforge_types::Error),
    #[error("validation error: invariant `{invariant}` violated: {detail}")]
    Validation {
        invariant: &'static str,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn validation(invariant: &'static str, detail: impl Into<String>) -> Self {
        Error::Validation {
            invariant,
            detail: detail.into(),
        }
    }
}

/// Sentinel chunk written first in every encoded function payload. Anything
/// else at that position means the stream wasn't produced by this codec (or
/// is corrupt), so deserialization fails before touching any other field.
pub const MARKER: u32 = 0x2A;

/// One `init_value_entries` stream entry: which register to materialize into,
/// and the value, already widened to 64 bits regardless of the entry's
/// declared opcode width. `value`'s meaning for a type-table-reference entry
/// (`first_inst_opcodes[i] == 2`) is an index into `type_tags`, not a
/// literal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitValue {
    pub target_register: u32,
    pub value: u64,
}

/// An encoded function payload, byte-for-byte the thing a translator emits
/// and a bundle entry's data region holds. Field order here is the exact
/// serialization order; reordering it is a wire-format break.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedFunction {
    pub register_count: u32,
    /// Opcodes run once, before the main instruction stream, to materialize
    /// externally-supplied initial values (e.g. string literals, vtable
    /// pointers) into registers. Per entry: 0 = 32-bit immediate, 1 = 64-bit
    /// split immediate, 2 = type-table reference.
    pub first_inst_opcodes: Vec<u32>,
    /// Two words per `first_inst_opcodes` entry: an external reference kind
    /// and payload, consumed in lockstep with the first-instruction stream.
    pub external_init_words: Vec<u32>,
    pub type_tags: Vec<u32>,
    /// A variable-width stream: up to one entry per `first_inst_opcodes`
    /// index, each carrying its own target register. An entry's value
    /// occupies one word on the wire for opcode 0 or 2, two words (low/high)
    /// for opcode 1 — see `first_inst_opcodes`.
    pub init_value_entries: Vec<InitValue>,
    pub inst_words: Vec<u32>,
    pub branch_words: Vec<u32>,
    /// Absolute addresses this function's local branches resolve to,
    /// shared with the bundle's branch-address table by position.
    pub branch_addrs: Vec<u64>,
    pub function_offset: u64,
}

impl EncodedFunction {
    /// Structural validation independent of any bundle or linker context:
    /// count/length agreement between parallel arrays, and no field that
    /// would make deserialization or VM execution undefined.
    pub fn validate(&self) -> Result<()> {
        if self.external_init_words.len() != 2 * self.first_inst_opcodes.len() {
            return Err(Error::validation(
                "external_init_words_len",
                format!(
                    "expected {} words (2x first_inst_count {}), found {}",
                    2 * self.first_inst_opcodes.len(),
                    self.first_inst_opcodes.len(),
                    self.external_init_words.len()
                ),
            ));
        }
        if self.init_value_entries.len() > self.first_inst_opcodes.len() {
            return Err(Error::validation(
                "init_value_count",
                format!(
                    "{} init value entries but only {} first_inst entries to index",
                    self.init_value_entries.len(),
                    self.first_inst_opcodes.len()
                ),
            ));
        }
        for (i, &op) in self.first_inst_opcodes.iter().enumerate() {
            if op > 2 {
                return Err(Error::validation(
                    "first_inst_opcode_range",
                    format!("entry {i} has opcode {op}, expected 0 (imm32), 1 (imm64) or 2 (type ref)"),
                ));
            }
        }
        if self.register_count == 0 {
            return Err(Error::validation(
                "register_count_nonzero",
                "a function must declare at least one register",
            ));
        }
        for &tag in &self.type_tags {
            vmforge_types::Type::from_tag(tag)?;
        }
        Ok(())
    }

    /// Serializes in the exact field order: marker, register_count,
    /// first_inst (count + opcodes), external_init_words, type table
    /// (count + tags), init values (count + words), instructions (count +
    /// words), branch words (count + words), branch_addrs (count + u64
    /// pairs), function_offset (u64 pair).
    pub fn serialize_encoded(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut w = BitWriter6::new();
        w.write6(MARKER);
        w.write_ext_u32(self.register_count);

        w.write_ext_u32(self.first_inst_opcodes.len() as u32);
        for &op in &self.first_inst_opcodes {
            w.write_ext_u32(op);
        }
        for &word in &self.external_init_words {
            w.write_ext_u32(word);
        }

        w.write_ext_u32(self.type_tags.len() as u32);
        for &tag in &self.type_tags {
            w.write_ext_u32(tag);
        }

        w.write_ext_u32(self.init_value_entries.len() as u32);
        for (i, entry) in self.init_value_entries.iter().enumerate() {
            w.write_ext_u32(entry.target_register);
            if self.first_inst_opcodes[i] == 1 {
                w.write_u64_as_u32_pair(entry.value);
            } else {
                w.write_ext_u32(entry.value as u32);
            }
        }

        w.write_ext_u32(self.inst_words.len() as u32);
        for &word in &self.inst_words {
            w.write_ext_u32(word);
        }

        w.write_ext_u32(self.branch_words.len() as u32);
        for &word in &self.branch_words {
            w.write_ext_u32(word);
        }

        w.write_ext_u32(self.branch_addrs.len() as u32);
        for &addr in &self.branch_addrs {
            w.write_u64_as_u32_pair(addr);
        }

        w.write_u64_as_u32_pair(self.function_offset);

        Ok(w.finish())
    }

    pub fn deserialize_encoded(bytes: &[u8]) -> Result<Self> {
        let mut r = BitReader6::new(bytes);
        let marker = r.read6()?;
        if marker != MARKER {
            return Err(Error::validation(
                "marker",
                format!("expected marker {MARKER:#x}, found {marker:#x}"),
            ));
        }

        let register_count = r.read_ext_u32()?;

        let first_inst_count = r.read_ext_u32()? as usize;
        let mut first_inst_opcodes = Vec::with_capacity(first_inst_count);
        for _ in 0..first_inst_count {
            first_inst_opcodes.push(r.read_ext_u32()?);
        }
        let mut external_init_words = Vec::with_capacity(2 * first_inst_count);
        for _ in 0..2 * first_inst_count {
            external_init_words.push(r.read_ext_u32()?);
        }

        let type_count = r.read_ext_u32()? as usize;
        let mut type_tags = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            type_tags.push(r.read_ext_u32()?);
        }

        let init_value_count = r.read_ext_u32()? as usize;
        let mut init_value_entries = Vec::with_capacity(init_value_count);
        for i in 0..init_value_count {
            let target_register = r.read_ext_u32()?;
            let op = first_inst_opcodes.get(i).copied().ok_or_else(|| {
                Error::validation(
                    "init_value_count",
                    format!("init value entry {i} has no matching first_inst_opcodes entry"),
                )
            })?;
            let value = if op == 1 {
                r.read_u64_from_u32_pair()?
            } else {
                r.read_ext_u32()? as u64
            };
            init_value_entries.push(InitValue { target_register, value });
        }

        let inst_count = r.read_ext_u32()? as usize;
        let mut inst_words = Vec::with_capacity(inst_count);
        for _ in 0..inst_count {
            inst_words.push(r.read_ext_u32()?);
        }

        let branch_count = r.read_ext_u32()? as usize;
        let mut branch_words = Vec::with_capacity(branch_count);
        for _ in 0..branch_count {
            branch_words.push(r.read_ext_u32()?);
        }

        let branch_addr_count = r.read_ext_u32()? as usize;
        let mut branch_addrs = Vec::with_capacity(branch_addr_count);
        for _ in 0..branch_addr_count {
            branch_addrs.push(r.read_u64_from_u32_pair()?);
        }

        let function_offset = r.read_u64_from_u32_pair()?;

        let f = EncodedFunction {
            register_count,
            first_inst_opcodes,
            external_init_words,
            type_tags,
            init_value_entries,
            inst_words,
            branch_words,
            branch_addrs,
            function_offset,
        };
        f.validate()?;
        Ok(f)
    }

    /// Compares field by field, returning the name of the first field that
    /// differs rather than a bare bool, for tests and diagnostic tooling.
    pub fn encoded_equals(&self, other: &Self) -> std::result::Result<(), &'static str> {
        if self.register_count != other.register_count {
            return Err("register_count");
        }
        if self.first_inst_opcodes != other.first_inst_opcodes {
            return Err("first_inst_opcodes");
        }
        if self.external_init_words != other.external_init_words {
            return Err("external_init_words");
        }
        if self.type_tags != other.type_tags {
            return Err("type_tags");
        }
        if self.init_value_entries != other.init_value_entries {
            return Err("init_value_entries");
        }
        if self.inst_words != other.inst_words {
            return Err("inst_words");
        }
        if self.branch_words != other.branch_words {
            return Err("branch_words");
        }
        if self.branch_addrs != other.branch_addrs {
            return Err("branch_addrs");
        }
        if self.function_offset != other.function_offset {
            return Err("function_offset");
        }
        Ok(())
    }
}

/// A register slot in a decoded runtime function: a 64-bit value plus an
/// ownership flag marking whether the VM must release an externally-owned
/// resource (e.g. a retained object pointer) when the slot is overwritten
/// or the frame is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Register {
    pub value: u64,
    pub owns_resource: bool,
}

impl Register {
    pub fn new(value: u64) -> Self {
        Self {
            value,
            owns_resource: false,
        }
    }

    pub fn owned(value: u64) -> Self {
        Self {
            value,
            owns_resource: true,
        }
    }
}

/// The decoded, execution-ready form of a function: arrays sized up front
/// from the encoded payload's counts, with `type_tags` resolved into a
/// `TypeManager` and initial register contents materialized from
/// `init_value_entries`. This is what the engine keys its per-(so, offset)
/// cache on and what it resets registers from on every call.
#[derive(Debug, Clone)]
pub struct RuntimeFunction {
    pub registers: SmallVec<[Register; 8]>,
    pub types: TypeManager,
    pub first_inst_opcodes: Vec<u32>,
    pub external_init_words: Vec<u32>,
    pub init_value_entries: Vec<InitValue>,
    pub inst_words: Vec<u32>,
    pub branch_words: Vec<u32>,
    pub branch_addrs: Vec<u64>,
    pub function_offset: u64,
}

impl RuntimeFunction {
    /// Builds the decoded form from a validated `EncodedFunction`, padding
    /// the register file to at least 4 slots so the VM's fixed X0..X3
    /// parameter window is always addressable even for minimal functions.
    pub fn from_encoded(encoded: &EncodedFunction) -> Result<Self> {
        encoded.validate()?;
        let types = TypeManager::from_tags(&encoded.type_tags)?;

        let slot_count = encoded.register_count.max(4) as usize;
        let mut registers: SmallVec<[Register; 8]> = SmallVec::with_capacity(slot_count);
        registers.resize(slot_count, Register::default());

        Ok(Self {
            registers,
            types,
            first_inst_opcodes: encoded.first_inst_opcodes.clone(),
            external_init_words: encoded.external_init_words.clone(),
            init_value_entries: encoded.init_value_entries.clone(),
            inst_words: encoded.inst_words.clone(),
            branch_words: encoded.branch_words.clone(),
            branch_addrs: encoded.branch_addrs.clone(),
            function_offset: encoded.function_offset,
        })
    }

    /// Resets every register slot to its zero-valued, unowned default. The
    /// engine calls this before mapping call parameters in on every
    /// invocation so no state leaks between calls sharing a cached
    /// `RuntimeFunction`.
    pub fn reset_registers(&mut self) {
        for slot in self.registers.iter_mut() {
            *slot = Register::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncodedFunction {
        EncodedFunction {
            register_count: 4,
            // entry 0 is opcode 1 (64-bit split imm, two value words),
            // entry 1 is opcode 2 (type-table reference, one value word).
            first_inst_opcodes: vec![1, 2],
            external_init_words: vec![10, 11, 12, 13],
            type_tags: vec![vmforge_types::tag::INT32_SIGNED, vmforge_types::tag::INT64_UNSIGNED],
            init_value_entries: vec![
                InitValue { target_register: 2, value: 0x1_0000_0064 },
                InitValue { target_register: 3, value: 0 },
            ],
            inst_words: vec![0, 1, 2, 3, 4],
            branch_words: vec![7, 8],
            branch_addrs: vec![0x1000, 0x2000],
            function_offset: 0x4000,
        }
    }

    #[test]
    fn serialize_deserialize_round_trips() {
        let f = sample();
        let bytes = f.serialize_encoded().unwrap();
        let back = EncodedFunction::deserialize_encoded(&bytes).unwrap();
        assert_eq!(f.encoded_equals(&back), Ok(()));
    }

    #[test]
    fn empty_function_round_trips() {
        let f = EncodedFunction {
            register_count: 1,
            function_offset: 0,
            ..Default::default()
        };
        let bytes = f.serialize_encoded().unwrap();
        let back = EncodedFunction::deserialize_encoded(&bytes).unwrap();
        assert_eq!(f.encoded_equals(&back), Ok(()));
    }

    #[test]
    fn mismatched_external_init_len_fails_validation() {
        let mut f = sample();
        f.external_init_words.pop();
        assert!(f.validate().is_err());
        assert!(f.serialize_encoded().is_err());
    }

    #[test]
    fn mismatched_init_value_len_fails_validation() {
        let mut f = sample();
        f.init_value_entries.push(InitValue { target_register: 0, value: 999 });
        assert!(f.validate().is_err());
    }

    #[test]
    fn out_of_range_first_inst_opcode_fails_validation() {
        let mut f = sample();
        f.first_inst_opcodes[0] = 3;
        assert!(f.validate().is_err());
    }

    #[test]
    fn zero_register_count_fails_validation() {
        let mut f = sample();
        f.register_count = 0;
        assert!(f.validate().is_err());
    }

    #[test]
    fn bad_marker_is_rejected() {
        let f = sample();
        let mut bytes = f.serialize_encoded().unwrap();
        // Corrupt just the marker's low 6 bits.
        bytes[0] ^= 0x3f;
        assert!(EncodedFunction::deserialize_encoded(&bytes).is_err());
    }

    #[test]
    fn unknown_type_tag_fails_validation() {
        let mut f = sample();
        f.type_tags.push(0x2A);
        assert!(f.validate().is_err());
    }

    #[test]
    fn runtime_function_pads_register_file_to_four() {
        let mut f = sample();
        f.register_count = 1;
        let rt = RuntimeFunction::from_encoded(&f).unwrap();
        assert_eq!(rt.registers.len(), 4);
    }

    #[test]
    fn reset_registers_clears_ownership_and_value() {
        let f = sample();
        let mut rt = RuntimeFunction::from_encoded(&f).unwrap();
        rt.registers[0] = Register::owned(42);
        rt.reset_registers();
        assert_eq!(rt.registers[0], Register::default());
    }

    #[quickcheck_macros::quickcheck]
    fn prop_round_trip_for_arbitrary_counts(
        opcodes: Vec<u32>,
        inst_words: Vec<u32>,
    ) -> bool {
        let first_inst_opcodes: Vec<u32> = opcodes.into_iter().map(|o| o % 3).take(16).collect();
        let n = first_inst_opcodes.len();
        let init_value_entries = first_inst_opcodes
            .iter()
            .enumerate()
            .map(|(i, _)| InitValue { target_register: i as u32, value: 0 })
            .collect();
        let f = EncodedFunction {
            register_count: 4,
            external_init_words: vec![0u32; 2 * n],
            init_value_entries,
            first_inst_opcodes,
            type_tags: vec![],
            inst_words: inst_words.into_iter().take(32).collect(),
            branch_words: vec![],
            branch_addrs: vec![],
            function_offset: 0,
        };
        let bytes = match f.serialize_encoded() {
            Ok(b) => b,
            Err(_) => return true,
        };
        match EncodedFunction::deserialize_encoded(&bytes) {
            Ok(back) => f.encoded_equals(&back) == Ok(()),
            Err(_) => false,
        }
    }
}
