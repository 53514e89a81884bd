//! Raw ELF64/AArch64 structure parsing: header, program headers, and
//! `PT_DYNAMIC` entries. No mapping or relocation logic lives here —
//! just turning bytes into typed records.

use std::ffi::CStr;

use crate::{Error, Result};

pub const EI_NIDENT: usize = 16;
pub const ET_DYN: u16 = 3;
pub const EM_AARCH64: u16 = 183;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_PLTGOT: i64 = 3;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_RELAENT: i64 = 9;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_INIT: i64 = 12;
pub const DT_INIT_ARRAY: i64 = 25;
pub const DT_INIT_ARRAYSZ: i64 = 27;
pub const DT_JMPREL: i64 = 23;
pub const DT_FLAGS: i64 = 30;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
pub const R_AARCH64_RELATIVE: u32 = 1027;
pub const R_AARCH64_IRELATIVE: u32 = 1032;

#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

fn get(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    bytes.get(offset..offset + len).ok_or(Error::Truncated {
        offset,
        needed: len,
        available: bytes.len().saturating_sub(offset),
    })
}

fn u16_at(bytes: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(get(bytes, offset, 2)?.try_into().unwrap()))
}

fn u32_at(bytes: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(get(bytes, offset, 4)?.try_into().unwrap()))
}

fn u64_at(bytes: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(get(bytes, offset, 8)?.try_into().unwrap()))
}

pub fn parse_header(bytes: &[u8]) -> Result<ElfHeader> {
    let ident = get(bytes, 0, EI_NIDENT)?;
    if ident[0..4] != [0x7f, b'E', b'L', b'F'] || ident[4] != 2 /* ELFCLASS64 */ || ident[5] != 1 /* little endian */
    {
        return Err(Error::BadElfHeader);
    }
    let e_type = u16_at(bytes, 16)?;
    let e_machine = u16_at(bytes, 18)?;
    if e_machine != EM_AARCH64 || e_type != ET_DYN {
        return Err(Error::BadElfHeader);
    }
    let e_entry = u64_at(bytes, 24)?;
    let e_phoff = u64_at(bytes, 32)?;
    let e_phentsize = u16_at(bytes, 54)?;
    let e_phnum = u16_at(bytes, 56)?;
    Ok(ElfHeader {
        e_type,
        e_machine,
        e_entry,
        e_phoff,
        e_phentsize,
        e_phnum,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub const PHDR_SIZE: usize = 56;

pub fn parse_program_headers(bytes: &[u8], header: &ElfHeader) -> Result<Vec<Phdr>> {
    if header.e_phnum == 0 || header.e_phnum as usize > 256 {
        return Err(Error::BadProgramHeaders {
            phnum: header.e_phnum as usize,
        });
    }
    let mut out = Vec::with_capacity(header.e_phnum as usize);
    for i in 0..header.e_phnum as usize {
        let off = header.e_phoff as usize + i * header.e_phentsize.max(PHDR_SIZE as u16) as usize;
        let p_type = u32_at(bytes, off)?;
        let p_flags = u32_at(bytes, off + 4)?;
        let p_offset = u64_at(bytes, off + 8)?;
        let p_vaddr = u64_at(bytes, off + 16)?;
        let p_paddr = u64_at(bytes, off + 24)?;
        let p_filesz = u64_at(bytes, off + 32)?;
        let p_memsz = u64_at(bytes, off + 40)?;
        let p_align = u64_at(bytes, off + 48)?;
        if p_filesz > p_memsz {
            return Err(Error::SegmentFileszExceedsMemsz {
                filesz: p_filesz,
                memsz: p_memsz,
            });
        }
        out.push(Phdr {
            p_type,
            p_flags,
            p_offset,
            p_vaddr,
            p_paddr,
            p_filesz,
            p_memsz,
            p_align,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct DynEntry {
    pub tag: i64,
    pub val: u64,
}

pub fn parse_dynamic(segment_bytes: &[u8]) -> Result<Vec<DynEntry>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    // Bounded by segment length: each Dyn entry is 16 bytes (tag + val).
    while off + 16 <= segment_bytes.len() {
        let tag = u64_at(segment_bytes, off)? as i64;
        let val = u64_at(segment_bytes, off + 8)?;
        if tag == DT_NULL {
            return Ok(out);
        }
        out.push(DynEntry { tag, val });
        off += 16;
    }
    Err(Error::BadDynamic)
}

#[derive(Debug, Clone, Copy)]
pub struct Sym {
    pub name_off: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

pub const SYM_SIZE: usize = 24;

pub fn parse_symtab(bytes: &[u8], offset: usize, count: usize) -> Result<Vec<Sym>> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = offset + i * SYM_SIZE;
        out.push(Sym {
            name_off: u32_at(bytes, off)?,
            info: get(bytes, off + 4, 1)?[0],
            other: get(bytes, off + 5, 1)?[0],
            shndx: u16_at(bytes, off + 6)?,
            value: u64_at(bytes, off + 8)?,
            size: u64_at(bytes, off + 16)?,
        });
    }
    Ok(out)
}

pub fn cstr_at(bytes: &[u8], offset: usize) -> String {
    let slice = &bytes[offset.min(bytes.len())..];
    match CStr::from_bytes_until_nul(slice) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub sym: u32,
    pub rel_type: u32,
    pub addend: i64,
}

pub const RELA_SIZE: usize = 24;

pub fn parse_rela(bytes: &[u8], offset: usize, size: usize) -> Result<Vec<Rela>> {
    let count = size / RELA_SIZE;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = offset + i * RELA_SIZE;
        let r_offset = u64_at(bytes, off)?;
        let r_info = u64_at(bytes, off + 8)?;
        let r_addend = u64_at(bytes, off + 16)? as i64;
        out.push(Rela {
            offset: r_offset,
            sym: (r_info >> 32) as u32,
            rel_type: (r_info & 0xffff_ffff) as u32,
            addend: r_addend,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_magic() {
        let bytes = vec![0u8; 64];
        assert!(matches!(parse_header(&bytes), Err(Error::BadElfHeader)));
    }

    #[test]
    fn dynamic_without_dt_null_is_rejected() {
        // One well-formed entry, no terminating DT_NULL.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(DT_NEEDED as u64).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(parse_dynamic(&bytes), Err(Error::BadDynamic)));
    }

    #[test]
    fn dynamic_stops_at_dt_null() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(DT_NEEDED as u64).to_le_bytes());
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&(DT_NULL as u64).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        // Trailing garbage past DT_NULL must be ignored.
        bytes.extend_from_slice(&[0xAA; 16]);
        let entries = parse_dynamic(&bytes).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, DT_NEEDED);
        assert_eq!(entries[0].val, 7);
    }
}
