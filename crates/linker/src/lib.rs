//! A minimal ELF64/AArch64 dynamic linker: maps `PT_LOAD` segments into a
//! fresh anonymous reservation, applies `RELA`/PLT-`RELA` relocations, runs
//! constructors, and publishes a [`SoInfo`] other loaded images and the
//! engine can resolve symbols against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustix::mm::{mmap_anonymous, mprotect, MapFlags, MprotectFlags, ProtFlags};
use thiserror::Error;

mod elf;
mod hash;

pub use elf::{DynEntry, Phdr, Rela, Sym};

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated ELF image: needed {needed} bytes at offset {offset}, had {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("not an ELF64/AArch64 little-endian shared object (e_ident/e_machine mismatch)")]
    BadElfHeader,
    #[error("program header table is empty or unreasonably large ({phnum} entries)")]
    BadProgramHeaders { phnum: usize },
    #[error("PT_LOAD segment has p_filesz ({filesz}) > p_memsz ({memsz})")]
    SegmentFileszExceedsMemsz { filesz: u64, memsz: u64 },
    #[error("failed to reserve address space: {0}")]
    ReserveAddressSpace(String),
    #[error("failed to map or protect a segment: {0}")]
    MapSegment(String),
    #[error("PT_DYNAMIC segment missing or malformed")]
    BadDynamic,
    #[error("GNU hash maskwords {0:#x} is not a power of two")]
    BadGnuHashMaskwords(u32),
    #[error("dependency `{0}` could not be resolved (not already loaded)")]
    MissingDependency(String),
    #[error("relocation at file offset {offset:#x} references symbol index {sym} which could not be resolved")]
    UnresolvedSymbol { offset: u64, sym: u32 },
    #[error("unsupported relocation type {0}")]
    UnsupportedRelocation(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What to do when a relocation's symbol can't be resolved against any
/// already-loaded image. Production loading is permissive by default: a
/// companion library commonly references host-process symbols this
/// linker was never asked to load, resolved by the symbol-takeover layer
/// instead of by RELA at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnUnresolvedSymbol {
    /// Leave the relocation's target slot untouched and continue loading.
    Ignore,
    /// Fail `load` outright.
    Error,
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    pub on_unresolved_symbol: OnUnresolvedSymbol,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            on_unresolved_symbol: OnUnresolvedSymbol::Ignore,
        }
    }
}

/// An anonymous mapping owned for the lifetime of a loaded image. Unmapped
/// on drop so a `SoInfo` going away releases its address space.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                let _ = rustix::mm::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

/// A loaded image's linker-visible state: base address, symbol/hash
/// tables, relocation tables, and the dependency names it declared.
pub struct SoInfo {
    pub name: String,
    pub base: usize,
    pub size: usize,
    pub load_bias: i64,
    pub phdrs: Vec<Phdr>,
    pub entry: u64,

    pub strtab: Vec<u8>,
    pub symtab: Vec<Sym>,

    pub sysv_hash: Option<hash::SysVHash>,
    pub gnu_hash: Option<hash::GnuHash>,

    pub needed_libs: Vec<String>,
    pub init_func: Option<u64>,
    pub init_array: Vec<u64>,

    mapping: Mapping,
}

impl SoInfo {
    /// Runtime address of `vaddr` within this image.
    pub fn runtime_addr(&self, vaddr: u64) -> u64 {
        (vaddr as i64 + self.load_bias) as u64
    }

    fn lookup_local(&self, name: &str) -> Option<&Sym> {
        if let Some(gnu) = &self.gnu_hash {
            if let Some(sym) = gnu.lookup(name, &self.symtab, &self.strtab) {
                return Some(sym);
            }
        }
        if let Some(sysv) = &self.sysv_hash {
            if let Some(sym) = sysv.lookup(name, &self.symtab, &self.strtab) {
                return Some(sym);
            }
        }
        None
    }
}

/// The registry of every image loaded through one `Linker`. Shared via
/// `Arc`/`RwLock` since lookups and takeover dispatch happen concurrently
/// with further loads.
#[derive(Default)]
pub struct Linker {
    config: LinkerConfig,
    images: RwLock<HashMap<String, Arc<SoInfo>>>,
}

impl Linker {
    pub fn new(config: LinkerConfig) -> Self {
        Self {
            config,
            images: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<SoInfo>> {
        self.images.read().get(name).cloned()
    }

    /// Loads `bytes` (a full ELF64/AArch64 `ET_DYN` image) and publishes
    /// it under `name`, overwriting any prior entry with that name.
    pub fn load(&self, name: &str, bytes: &[u8]) -> Result<Arc<SoInfo>> {
        let header = elf::parse_header(bytes)?;
        let phdrs = elf::parse_program_headers(bytes, &header)?;

        let (min_vaddr, total_span) = load_span(&phdrs);
        let page_size = page_size();
        let min_vaddr_aligned = align_down(min_vaddr, page_size);
        let reservation_len = align_up(total_span + (min_vaddr - min_vaddr_aligned), page_size);

        let reservation_base = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                reservation_len as usize,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .map_err(|e| Error::ReserveAddressSpace(e.to_string()))?;

        let load_bias = reservation_base as i64 - min_vaddr_aligned as i64;

        for ph in phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD) {
            load_segment(bytes, ph, load_bias, page_size)?;
        }

        let dyn_phdr = phdrs
            .iter()
            .find(|p| p.p_type == elf::PT_DYNAMIC)
            .ok_or(Error::BadDynamic)?;
        let dyn_runtime_addr = (dyn_phdr.p_vaddr as i64 + load_bias) as usize;
        let dyn_bytes = unsafe {
            std::slice::from_raw_parts(dyn_runtime_addr as *const u8, dyn_phdr.p_memsz as usize)
        };
        let dyn_entries = elf::parse_dynamic(dyn_bytes)?;

        let image = unsafe {
            std::slice::from_raw_parts(reservation_base as *const u8, reservation_len as usize)
        };
        let parsed = parse_dynamic_section(&dyn_entries, load_bias, image)?;

        let mut so = SoInfo {
            name: name.to_string(),
            base: reservation_base as usize,
            size: reservation_len as usize,
            load_bias,
            phdrs,
            entry: header.e_entry,
            strtab: parsed.strtab,
            symtab: parsed.symtab,
            sysv_hash: parsed.sysv_hash,
            gnu_hash: parsed.gnu_hash,
            needed_libs: parsed.needed_libs,
            init_func: parsed.init_func,
            init_array: parsed.init_array,
            mapping: Mapping {
                ptr: reservation_base as *mut u8,
                len: reservation_len as usize,
            },
        };

        self.relocate(&mut so, &parsed.rela, &parsed.jmprel)?;
        self.protect_segments(&so)?;
        self.run_constructors(&so);

        let arc = Arc::new(so);
        self.images.write().insert(name.to_string(), arc.clone());
        Ok(arc)
    }

    fn resolve_symbol(&self, so: &SoInfo, name: &str) -> Option<u64> {
        if let Some(sym) = so.lookup_local(name) {
            if sym.value != 0 {
                return Some(so.runtime_addr(sym.value));
            }
        }
        let images = self.images.read();
        for needed in &so.needed_libs {
            if let Some(dep) = images.get(needed) {
                if let Some(sym) = dep.lookup_local(name) {
                    if sym.value != 0 {
                        return Some(dep.runtime_addr(sym.value));
                    }
                }
            }
        }
        for dep in images.values() {
            if let Some(sym) = dep.lookup_local(name) {
                if sym.value != 0 {
                    return Some(dep.runtime_addr(sym.value));
                }
            }
        }
        None
    }

    fn relocate(&self, so: &mut SoInfo, rela: &[Rela], jmprel: &[Rela]) -> Result<()> {
        for table in [rela, jmprel] {
            for r in table {
                self.apply_relocation(so, r)?;
            }
        }
        Ok(())
    }

    fn apply_relocation(&self, so: &SoInfo, r: &Rela) -> Result<()> {
        let target_addr = so.runtime_addr(r.offset) as *mut u64;

        let value = match r.rel_type {
            elf::R_AARCH64_RELATIVE => (r.addend + so.load_bias) as u64,
            elf::R_AARCH64_ABS64 | elf::R_AARCH64_GLOB_DAT | elf::R_AARCH64_JUMP_SLOT => {
                let sym = so
                    .symtab
                    .get(r.sym as usize)
                    .ok_or(Error::UnresolvedSymbol {
                        offset: r.offset,
                        sym: r.sym,
                    })?;
                let name = elf::cstr_at(&so.strtab, sym.name_off as usize);
                match self.resolve_symbol(so, &name) {
                    Some(addr) => (addr as i64 + r.addend) as u64,
                    None => {
                        if self.config.on_unresolved_symbol == OnUnresolvedSymbol::Error {
                            return Err(Error::UnresolvedSymbol {
                                offset: r.offset,
                                sym: r.sym,
                            });
                        }
                        return Ok(());
                    }
                }
            }
            elf::R_AARCH64_IRELATIVE => {
                let resolver_addr = (r.addend + so.load_bias) as u64;
                let resolver: extern "C" fn() -> u64 =
                    unsafe { std::mem::transmute(resolver_addr as usize) };
                resolver()
            }
            other => return Err(Error::UnsupportedRelocation(other)),
        };

        // Relocation targets live in segments we may have already
        // re-protected read-only; best effort RW unprotect for the write,
        // logged rather than fatal if it fails (e.g. an already-writable
        // page).
        let page = align_down(target_addr as u64, page_size() as u64) as *mut _;
        let _ = unsafe {
            mprotect(
                page,
                page_size(),
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        };
        unsafe { target_addr.write_unaligned(value) };
        Ok(())
    }

    fn protect_segments(&self, so: &SoInfo) -> Result<()> {
        let page_size = page_size() as u64;
        for ph in so.phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD) {
            let seg_start = (ph.p_vaddr as i64 + so.load_bias) as u64;
            let seg_start_aligned = align_down(seg_start, page_size);
            let seg_end = seg_start + ph.p_memsz;
            let seg_len = align_up(seg_end - seg_start_aligned, page_size);

            let mut prot = ProtFlags::empty();
            if ph.p_flags & elf::PF_R != 0 {
                prot |= ProtFlags::READ;
            }
            if ph.p_flags & elf::PF_W != 0 {
                prot |= ProtFlags::WRITE;
            }
            if ph.p_flags & elf::PF_X != 0 {
                prot |= ProtFlags::EXEC;
            }
            unsafe {
                mprotect(seg_start_aligned as *mut _, seg_len as usize, prot)
                    .map_err(|e| Error::MapSegment(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn run_constructors(&self, so: &SoInfo) {
        if let Some(init) = so.init_func {
            if init != 0 {
                let f: extern "C" fn() = unsafe { std::mem::transmute(init as usize) };
                f();
            }
        }
        for &entry in so.init_array.iter().take(1000) {
            if entry != 0 {
                let f: extern "C" fn() = unsafe { std::mem::transmute(entry as usize) };
                f();
            }
        }
    }
}

struct ParsedDynamic {
    strtab: Vec<u8>,
    symtab: Vec<Sym>,
    sysv_hash: Option<hash::SysVHash>,
    gnu_hash: Option<hash::GnuHash>,
    needed_libs: Vec<String>,
    init_func: Option<u64>,
    init_array: Vec<u64>,
    rela: Vec<Rela>,
    jmprel: Vec<Rela>,
}

fn parse_dynamic_section(entries: &[DynEntry], load_bias: i64, image: &[u8]) -> Result<ParsedDynamic> {
    let mut strtab_vaddr = None;
    let mut strtab_size = 0u64;
    let mut symtab_vaddr = None;
    let mut hash_vaddr = None;
    let mut gnu_hash_vaddr = None;
    let mut rela_vaddr = None;
    let mut rela_size = 0u64;
    let mut jmprel_vaddr = None;
    let mut jmprel_size = 0u64;
    let mut init_func = None;
    let mut init_array_vaddr = None;
    let mut init_array_size = 0u64;
    let mut needed_offsets = Vec::new();

    for e in entries {
        match e.tag {
            elf::DT_STRTAB => strtab_vaddr = Some(e.val),
            elf::DT_STRSZ => strtab_size = e.val,
            elf::DT_SYMTAB => symtab_vaddr = Some(e.val),
            elf::DT_HASH => hash_vaddr = Some(e.val),
            elf::DT_GNU_HASH => gnu_hash_vaddr = Some(e.val),
            elf::DT_RELA => rela_vaddr = Some(e.val),
            elf::DT_RELASZ => rela_size = e.val,
            elf::DT_JMPREL => jmprel_vaddr = Some(e.val),
            elf::DT_PLTRELSZ => jmprel_size = e.val,
            elf::DT_INIT => init_func = Some(e.val),
            elf::DT_INIT_ARRAY => init_array_vaddr = Some(e.val),
            elf::DT_INIT_ARRAYSZ => init_array_size = e.val,
            elf::DT_NEEDED => needed_offsets.push(e.val as u32),
            _ => {}
        }
    }

    let runtime_off = |vaddr: u64| (vaddr as i64 + load_bias) as usize;

    let strtab = match strtab_vaddr {
        Some(v) => {
            let off = runtime_off(v);
            image
                .get(off..off + strtab_size as usize)
                .ok_or(Error::BadDynamic)?
                .to_vec()
        }
        None => Vec::new(),
    };

    let sysv_hash = match hash_vaddr {
        Some(v) => Some(hash::SysVHash::parse(image, runtime_off(v))?),
        None => None,
    };

    // Symbol count is derived from whichever hash table is present:
    // SysV's nchain directly bounds the symtab, GNU hash requires walking
    // past its last chain entry.
    let symtab_count = if let Some(sysv) = &sysv_hash {
        sysv.nchain
    } else if let Some(v) = gnu_hash_vaddr {
        let off = runtime_off(v);
        let nbucket = u32::from_le_bytes(image[off..off + 4].try_into().unwrap());
        let symoffset = u32::from_le_bytes(image[off + 4..off + 8].try_into().unwrap());
        let maskwords = u32::from_le_bytes(image[off + 8..off + 12].try_into().unwrap());
        let bucket_off = off + 16 + maskwords as usize * 8;
        let chain_off = bucket_off + nbucket as usize * 4;
        // Walk buckets to find the highest referenced index, then follow
        // its chain to the terminating (low-bit-set) entry.
        let mut max_index = symoffset;
        for i in 0..nbucket as usize {
            let b = u32::from_le_bytes(
                image[bucket_off + i * 4..bucket_off + i * 4 + 4]
                    .try_into()
                    .unwrap(),
            );
            if b == 0 {
                continue;
            }
            let mut n = b;
            loop {
                max_index = max_index.max(n + 1);
                let chain_idx = (n - symoffset) as usize;
                let word_off = chain_off + chain_idx * 4;
                if word_off + 4 > image.len() {
                    break;
                }
                let w = u32::from_le_bytes(image[word_off..word_off + 4].try_into().unwrap());
                if w & 1 != 0 {
                    break;
                }
                n += 1;
            }
        }
        max_index
    } else {
        0
    };

    let symtab = match symtab_vaddr {
        Some(v) => elf::parse_symtab(image, runtime_off(v), symtab_count as usize)?,
        None => Vec::new(),
    };

    let gnu_hash = match gnu_hash_vaddr {
        Some(v) => Some(hash::GnuHash::parse(image, runtime_off(v), symtab_count)?),
        None => None,
    };

    let needed_libs = needed_offsets
        .into_iter()
        .map(|off| elf::cstr_at(&strtab, off as usize))
        .filter(|s| !s.is_empty() && s.len() <= 256)
        .collect();

    let rela = match rela_vaddr {
        Some(v) => elf::parse_rela(image, runtime_off(v), rela_size as usize)?,
        None => Vec::new(),
    };
    let jmprel = match jmprel_vaddr {
        Some(v) => elf::parse_rela(image, runtime_off(v), jmprel_size as usize)?,
        None => Vec::new(),
    };
    let init_array = match init_array_vaddr {
        Some(v) => {
            let off = runtime_off(v);
            let count = (init_array_size / 8) as usize;
            (0..count)
                .map(|i| {
                    u64::from_le_bytes(image[off + i * 8..off + i * 8 + 8].try_into().unwrap())
                })
                .collect()
        }
        None => Vec::new(),
    };

    Ok(ParsedDynamic {
        strtab,
        symtab,
        sysv_hash,
        gnu_hash,
        needed_libs,
        init_func,
        init_array,
        rela,
        jmprel,
    })
}

fn load_span(phdrs: &[Phdr]) -> (u64, u64) {
    let loads: Vec<&Phdr> = phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD).collect();
    let min_vaddr = loads.iter().map(|p| p.p_vaddr).min().unwrap_or(0);
    let max_vaddr = loads.iter().map(|p| p.p_vaddr + p.p_memsz).max().unwrap_or(0);
    (min_vaddr, max_vaddr - min_vaddr)
}

fn load_segment(file_bytes: &[u8], ph: &Phdr, load_bias: i64, page_size: usize) -> Result<()> {
    let seg_addr = (ph.p_vaddr as i64 + load_bias) as u64;
    let seg_addr_aligned = align_down(seg_addr, page_size as u64);
    let seg_end = seg_addr + ph.p_memsz;
    let seg_len = align_up(seg_end - seg_addr_aligned, page_size as u64);

    unsafe {
        mprotect(
            seg_addr_aligned as *mut _,
            seg_len as usize,
            ProtFlags::READ | ProtFlags::WRITE,
        )
        .map_err(|e| Error::MapSegment(e.to_string()))?;
    }

    let file_slice = file_bytes
        .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
        .ok_or(Error::Truncated {
            offset: ph.p_offset as usize,
            needed: ph.p_filesz as usize,
            available: file_bytes.len().saturating_sub(ph.p_offset as usize),
        })?;
    unsafe {
        std::ptr::copy_nonoverlapping(file_slice.as_ptr(), seg_addr as *mut u8, file_slice.len());
        // Zero the BSS tail: memsz beyond filesz within this segment.
        if ph.p_memsz > ph.p_filesz {
            let bss_start = (seg_addr + ph.p_filesz) as *mut u8;
            std::ptr::write_bytes(bss_start, 0, (ph.p_memsz - ph.p_filesz) as usize);
        }
    }
    Ok(())
}

fn page_size() -> usize {
    // SAFETY: sysconf with a well-known name never fails on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_round_correctly() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn load_span_covers_all_pt_load_segments() {
        let phdrs = vec![
            Phdr {
                p_type: elf::PT_LOAD,
                p_flags: 0,
                p_offset: 0,
                p_vaddr: 0x1000,
                p_paddr: 0,
                p_filesz: 0x100,
                p_memsz: 0x200,
                p_align: 0x1000,
            },
            Phdr {
                p_type: elf::PT_LOAD,
                p_flags: 0,
                p_offset: 0,
                p_vaddr: 0x4000,
                p_paddr: 0,
                p_filesz: 0x50,
                p_memsz: 0x50,
                p_align: 0x1000,
            },
        ];
        let (min, span) = load_span(&phdrs);
        assert_eq!(min, 0x1000);
        assert_eq!(span, 0x4050 - 0x1000);
    }

    #[test]
    fn default_linker_config_is_permissive() {
        let cfg = LinkerConfig::default();
        assert_eq!(cfg.on_unresolved_symbol, OnUnresolvedSymbol::Ignore);
    }
}
