//! Symbol-takeover dispatcher: binds exported stub slots in a patched host
//! library to VM entry points, and the `.dynsym` recovery scan that
//! reconstructs the slot table after a process restart.
//!
//! Two operations live here and nowhere else: a mutex-protected `{ slot_id
//! -> function_offset, active_so_name, ready }` record consulted on every
//! dispatch, and a pure scan over a loaded image's symbol table that rebuilds
//! that record's entries from the `vm_takeover_slot_NNNN` naming convention.
//! The richer process-wide `Uninitialized/Initializing/Ready/Failed` engine
//! state machine is not this crate's concern; it is owned by the library
//! entry points that call into both the linker and this dispatcher.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use vmforge_engine::Engine;
use vmforge_linker::SoInfo;

/// Name prefix of a stub slot symbol: `vm_takeover_slot_0001`, etc.
pub const SLOT_SYMBOL_PREFIX: &str = "vm_takeover_slot_";

#[derive(Debug, Error)]
pub enum Error {
    #[error("takeover init requires at least one (slot_id, function_offset) entry")]
    EmptyEntries,
    #[error("slot {slot_id} has function_offset 0")]
    ZeroFunctionOffset { slot_id: u32 },
    #[error("duplicate slot id {slot_id} in takeover init entries")]
    DuplicateSlotId { slot_id: u32 },
    #[error("dynsym recovery found no vm_takeover_slot_NNNN / alias pairs")]
    NoMappingsRecovered,
    #[error("slot {slot_id} recovered with conflicting function_offset ({first:#x} vs {second:#x})")]
    ConflictingSlotMapping { slot_id: u32, first: u64, second: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct State {
    slots: HashMap<u32, u64>,
    active_so_name: String,
    ready: bool,
}

/// The process-wide slot table. Cheap to construct; a real process holds
/// exactly one, shared behind an `Arc` alongside the `Engine` it dispatches
/// through.
#[derive(Default)]
pub struct Takeover {
    state: RwLock<State>,
}

impl Takeover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a fresh slot table. `entries` must be non-empty, every
    /// `function_offset` non-zero, and every `slot_id` unique; on success
    /// the table is swapped in atomically and marked ready.
    ///
    /// Validating that `primary_so_name` names a library the linker actually
    /// loaded is the caller's job: this crate has no linker handle of its
    /// own, since the only part of a loaded image it ever reads is a
    /// `SoInfo` passed to [`recover_slot_mapping`] by the same caller.
    pub fn init(&self, primary_so_name: impl Into<String>, entries: &[(u32, u64)]) -> Result<()> {
        if entries.is_empty() {
            return Err(Error::EmptyEntries);
        }
        let mut slots = HashMap::with_capacity(entries.len());
        for &(slot_id, function_offset) in entries {
            if function_offset == 0 {
                return Err(Error::ZeroFunctionOffset { slot_id });
            }
            if slots.insert(slot_id, function_offset).is_some() {
                return Err(Error::DuplicateSlotId { slot_id });
            }
        }

        let mut state = self.state.write();
        state.slots = slots;
        state.active_so_name = primary_so_name.into();
        state.ready = true;
        Ok(())
    }

    /// Resets to the not-ready state. All subsequent dispatches return 0
    /// until `init` is called again.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.slots.clear();
        state.active_so_name.clear();
        state.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    /// Entry point every `vm_takeover_slot_NNNN` trampoline calls through.
    /// Returns 0 (logged, never panics) if not ready or `slot_id` is
    /// unknown, matching the exported shim's C ABI return convention.
    pub fn dispatch_by_id(&self, engine: &Engine, a: i32, b: i32, slot_id: u32) -> i32 {
        let (function_offset, so_name) = {
            let state = self.state.read();
            if !state.ready {
                log::warn!("takeover dispatch for slot {slot_id} while not ready");
                return 0;
            }
            match state.slots.get(&slot_id) {
                Some(&function_offset) => (function_offset, state.active_so_name.clone()),
                None => {
                    log::warn!("takeover dispatch for unknown slot {slot_id}");
                    return 0;
                }
            }
        };

        let params = [a as u32 as u64, b as u32 as u64];
        // A real local slot, not a null pointer: a guest function returning
        // an object by invisible pointer (spec scenario 6) writes through
        // this address via X8, and `0` would make that write dereference
        // the null page.
        let mut ret = 0u64;
        match engine.execute(&so_name, function_offset, &params, &ret as *const u64 as u64) {
            Ok(x0) => x0 as u32 as i32,
            Err(e) => {
                log::warn!("takeover dispatch for slot {slot_id} failed: {e}");
                0
            }
        }
    }
}

/// Scans a loaded image's `.dynsym` for the `(slot_id, function_offset)`
/// pairs a patched host library encodes via symbol aliasing: one symbol per
/// slot named `vm_takeover_slot_NNNN` records the slot's address, and a
/// same-valued alias elsewhere in the table carries the guest
/// `function_offset` in its `st_size`.
pub fn recover_slot_mapping(so: &SoInfo) -> Result<Vec<(u32, u64)>> {
    recover_slot_mapping_raw(&so.symtab, &so.strtab)
}

fn recover_slot_mapping_raw(symtab: &[vmforge_linker::Sym], strtab: &[u8]) -> Result<Vec<(u32, u64)>> {
    let mut slot_value_to_id: HashMap<u64, u32> = HashMap::new();
    for sym in symtab {
        let name = cstr_at(strtab, sym.name_off as usize);
        if let Some(digits) = name.strip_prefix(SLOT_SYMBOL_PREFIX) {
            if let Ok(slot_id) = digits.parse::<u32>() {
                slot_value_to_id.insert(sym.value, slot_id);
            }
        }
    }

    let mut recovered: HashMap<u32, u64> = HashMap::new();
    for sym in symtab {
        let name = cstr_at(strtab, sym.name_off as usize);
        if name.starts_with(SLOT_SYMBOL_PREFIX) {
            continue;
        }
        if sym.size == 0 {
            continue;
        }
        if let Some(&slot_id) = slot_value_to_id.get(&sym.value) {
            match recovered.insert(slot_id, sym.size) {
                Some(prior) if prior != sym.size => {
                    return Err(Error::ConflictingSlotMapping {
                        slot_id,
                        first: prior,
                        second: sym.size,
                    });
                }
                _ => {}
            }
        }
    }

    if recovered.is_empty() {
        return Err(Error::NoMappingsRecovered);
    }
    Ok(recovered.into_iter().collect())
}

/// Duplicated from the linker's own `elf::cstr_at` rather than exposed
/// across the crate boundary: reading a name out of a string table is a
/// three-line operation, not worth a new public dependency surface.
fn cstr_at(bytes: &[u8], offset: usize) -> String {
    let slice = &bytes[offset.min(bytes.len())..];
    match std::ffi::CStr::from_bytes_until_nul(slice) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vmforge_function::{EncodedFunction, RuntimeFunction};
    use vmforge_types::opcode::{OP_BINARY, OP_RETURN};

    fn fun_add() -> Arc<RuntimeFunction> {
        // [op, kind, dst, lhs, rhs, ty_idx] ADD x0, x0, x1 ; return
        let inst_words = vec![
            OP_BINARY,
            vmforge_types::opcode::BIN_ADD,
            0,
            0,
            1,
            0,
            OP_RETURN,
        ];
        let encoded = EncodedFunction {
            register_count: 2,
            first_inst_opcodes: vec![],
            external_init_words: vec![],
            type_tags: vec![vmforge_types::tag::INT64_UNSIGNED],
            init_value_entries: vec![],
            inst_words,
            branch_words: vec![],
            branch_addrs: vec![],
            function_offset: 0x100,
        };
        Arc::new(RuntimeFunction::from_encoded(&encoded).unwrap())
    }

    fn engine_with_fun_add() -> Engine {
        let engine = Engine::new();
        engine.cache_function("libtarget.so", fun_add());
        engine
    }

    #[test]
    fn init_rejects_empty_entries() {
        let t = Takeover::new();
        assert!(matches!(t.init("libtarget.so", &[]), Err(Error::EmptyEntries)));
    }

    #[test]
    fn init_rejects_zero_function_offset() {
        let t = Takeover::new();
        let err = t.init("libtarget.so", &[(1, 0)]).unwrap_err();
        assert!(matches!(err, Error::ZeroFunctionOffset { slot_id: 1 }));
    }

    #[test]
    fn init_rejects_duplicate_slot_ids() {
        let t = Takeover::new();
        let err = t
            .init("libtarget.so", &[(1, 0x100), (1, 0x200)])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSlotId { slot_id: 1 }));
    }

    #[test]
    fn dispatch_before_init_returns_zero() {
        let t = Takeover::new();
        let engine = engine_with_fun_add();
        assert_eq!(t.dispatch_by_id(&engine, 2, 4, 1), 0);
    }

    #[test]
    fn dispatch_with_unknown_slot_returns_zero() {
        let t = Takeover::new();
        t.init("libtarget.so", &[(1, 0x100)]).unwrap();
        let engine = engine_with_fun_add();
        assert_eq!(t.dispatch_by_id(&engine, 2, 4, 99), 0);
    }

    #[test]
    fn dispatch_calls_through_to_the_cached_function() {
        let t = Takeover::new();
        t.init("libtarget.so", &[(1, 0x100)]).unwrap();
        let engine = engine_with_fun_add();
        assert_eq!(t.dispatch_by_id(&engine, 2, 4, 1), 6);
    }

    #[test]
    fn clear_resets_to_not_ready_and_dispatch_returns_zero() {
        let t = Takeover::new();
        t.init("libtarget.so", &[(1, 0x100)]).unwrap();
        let engine = engine_with_fun_add();
        assert_eq!(t.dispatch_by_id(&engine, 2, 4, 1), 6);
        t.clear();
        assert!(!t.is_ready());
        assert_eq!(t.dispatch_by_id(&engine, 2, 4, 1), 0);
    }

    #[test]
    fn concurrent_dispatch_from_multiple_threads_is_consistent() {
        let t = Arc::new(Takeover::new());
        t.init("libtarget.so", &[(1, 0x100)]).unwrap();
        let engine = Arc::new(engine_with_fun_add());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let t = Arc::clone(&t);
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || t.dispatch_by_id(&engine, i, i, 1))
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), 2 * i as i32);
        }
    }

    fn make_sym(name_off: u32, value: u64, size: u64) -> vmforge_linker::Sym {
        vmforge_linker::Sym {
            name_off,
            info: 0,
            other: 0,
            shndx: 0,
            value,
            size,
        }
    }

    fn strtab_with(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
        let mut bytes = vec![0u8]; // offset 0 is conventionally the empty name
        let mut offsets = Vec::with_capacity(names.len());
        for name in names {
            offsets.push(bytes.len() as u32);
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }
        (bytes, offsets)
    }

    #[test]
    fn recovers_slot_to_function_offset_from_alias_symbols() {
        let (strtab, offsets) = strtab_with(&["vm_takeover_slot_0001", "donor_alias_a"]);
        let symtab = vec![
            make_sym(offsets[0], 0x2000, 0),
            make_sym(offsets[1], 0x2000, 0x100),
        ];
        let recovered = recover_slot_mapping_raw(&symtab, &strtab).unwrap();
        assert_eq!(recovered, vec![(1, 0x100)]);
    }

    #[test]
    fn recovery_fails_with_no_slot_symbols() {
        let (strtab, offsets) = strtab_with(&["donor_alias_a"]);
        let symtab = vec![make_sym(offsets[0], 0x2000, 0x100)];
        assert!(matches!(
            recover_slot_mapping_raw(&symtab, &strtab),
            Err(Error::NoMappingsRecovered)
        ));
    }

    #[test]
    fn recovery_rejects_conflicting_alias_sizes_for_one_slot() {
        let (strtab, offsets) =
            strtab_with(&["vm_takeover_slot_0001", "donor_alias_a", "donor_alias_b"]);
        let symtab = vec![
            make_sym(offsets[0], 0x2000, 0),
            make_sym(offsets[1], 0x2000, 0x100),
            make_sym(offsets[2], 0x2000, 0x200),
        ];
        let err = recover_slot_mapping_raw(&symtab, &strtab).unwrap_err();
        assert!(matches!(err, Error::ConflictingSlotMapping { slot_id: 1, .. }));
    }

    #[test]
    fn recovery_ignores_zero_size_non_slot_symbols() {
        let (strtab, offsets) = strtab_with(&["vm_takeover_slot_0001", "not_an_alias"]);
        let symtab = vec![
            make_sym(offsets[0], 0x2000, 0),
            make_sym(offsets[1], 0x2000, 0),
        ];
        assert!(matches!(
            recover_slot_mapping_raw(&symtab, &strtab),
            Err(Error::NoMappingsRecovered)
        ));
    }
}
