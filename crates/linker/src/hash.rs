//! SysV (`DT_HASH`) and GNU (`DT_GNU_HASH`) symbol hash table parsing and
//! lookup, plus the two hash functions themselves.

use crate::elf::{self, Sym};
use crate::{Error, Result};

/// The classic ELF `DT_HASH` table: a bucket array plus a chain array,
/// walked linearly on collision.
#[derive(Debug, Clone)]
pub struct SysVHash {
    pub nbucket: u32,
    pub nchain: u32,
    pub bucket: Vec<u32>,
    pub chain: Vec<u32>,
}

impl SysVHash {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let nbucket = u32_at(bytes, offset)?;
        let nchain = u32_at(bytes, offset + 4)?;
        let mut bucket = Vec::with_capacity(nbucket as usize);
        for i in 0..nbucket as usize {
            bucket.push(u32_at(bytes, offset + 8 + i * 4)?);
        }
        let chain_off = offset + 8 + nbucket as usize * 4;
        let mut chain = Vec::with_capacity(nchain as usize);
        for i in 0..nchain as usize {
            chain.push(u32_at(bytes, chain_off + i * 4)?);
        }
        Ok(Self {
            nbucket,
            nchain,
            bucket,
            chain,
        })
    }

    pub fn lookup<'a>(
        &self,
        name: &str,
        symtab: &'a [Sym],
        strtab: &[u8],
    ) -> Option<&'a Sym> {
        if self.nbucket == 0 {
            return None;
        }
        let hash = elf_hash(name);
        let mut n = self.bucket[(hash % self.nbucket) as usize];
        while n != 0 {
            let sym = symtab.get(n as usize)?;
            if elf::cstr_at(strtab, sym.name_off as usize) == name {
                return Some(sym);
            }
            n = *self.chain.get(n as usize)?;
        }
        None
    }
}

/// The classic SysV `ELF_HASH` algorithm: a multiplicative hash with a
/// high-nibble scramble, per the generic ABI.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &b in name.as_bytes() {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The GNU `djb2`-derived hash used by `DT_GNU_HASH`.
pub fn gnu_hash(name: &str) -> u32 {
    let mut h: u32 = 5381;
    for &b in name.as_bytes() {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

/// The GNU hash table: bloom filter plus bucket/chain arrays, giving a
/// cheap bloom-filter rejection before walking the hash chain.
#[derive(Debug, Clone)]
pub struct GnuHash {
    pub nbucket: u32,
    pub symoffset: u32,
    pub maskwords_bitmask: u32,
    pub shift2: u32,
    pub bloom_filter: Vec<u64>,
    pub bucket: Vec<u32>,
    pub chain_base: u32,
    pub chain: Vec<u32>,
}

fn u32_at(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice = bytes.get(offset..offset + 4).ok_or(Error::Truncated {
        offset,
        needed: 4,
        available: bytes.len().saturating_sub(offset),
    })?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn u64_at(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice = bytes.get(offset..offset + 8).ok_or(Error::Truncated {
        offset,
        needed: 8,
        available: bytes.len().saturating_sub(offset),
    })?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

impl GnuHash {
    pub fn parse(bytes: &[u8], offset: usize, symtab_count: u32) -> Result<Self> {
        let nbucket = u32_at(bytes, offset)?;
        let symoffset = u32_at(bytes, offset + 4)?;
        let maskwords = u32_at(bytes, offset + 8)?;
        let shift2 = u32_at(bytes, offset + 12)?;

        if maskwords == 0 || (maskwords & (maskwords - 1)) != 0 {
            return Err(Error::BadGnuHashMaskwords(maskwords));
        }
        // Pre-decrement to a mask, mirroring the loader convention of
        // storing `maskwords - 1` so lookup can `&` directly.
        let maskwords_bitmask = maskwords - 1;

        let bloom_off = offset + 16;
        let mut bloom_filter = Vec::with_capacity(maskwords as usize);
        for i in 0..maskwords as usize {
            bloom_filter.push(u64_at(bytes, bloom_off + i * 8)?);
        }

        let bucket_off = bloom_off + maskwords as usize * 8;
        let mut bucket = Vec::with_capacity(nbucket as usize);
        for i in 0..nbucket as usize {
            bucket.push(u32_at(bytes, bucket_off + i * 4)?);
        }

        let chain_off = bucket_off + nbucket as usize * 4;
        let chain_count = symtab_count.saturating_sub(symoffset) as usize;
        let mut chain = Vec::with_capacity(chain_count);
        for i in 0..chain_count {
            chain.push(u32_at(bytes, chain_off + i * 4)?);
        }

        Ok(Self {
            nbucket,
            symoffset,
            maskwords_bitmask,
            shift2,
            bloom_filter,
            bucket,
            chain_base: symoffset,
            chain,
        })
    }

    pub fn lookup<'a>(&self, name: &str, symtab: &'a [Sym], strtab: &[u8]) -> Option<&'a Sym> {
        if self.nbucket == 0 {
            return None;
        }
        let hash = gnu_hash(name);

        let word_bits = 64u32;
        let word_num = (hash / word_bits) & self.maskwords_bitmask;
        let bloom_word = *self.bloom_filter.get(word_num as usize)?;
        let bit1 = 1u64 << (hash % word_bits);
        let bit2 = 1u64 << ((hash >> self.shift2) % word_bits);
        if bloom_word & bit1 & bit2 == 0 {
            return None;
        }

        let mut n = *self.bucket.get((hash % self.nbucket) as usize)?;
        if n < self.chain_base {
            return None;
        }
        loop {
            let chain_idx = (n - self.chain_base) as usize;
            let chain_hash = *self.chain.get(chain_idx)?;
            let sym = symtab.get(n as usize)?;
            if (chain_hash ^ hash) >> 1 == 0 && elf::cstr_at(strtab, sym.name_off as usize) == name
            {
                return Some(sym);
            }
            // Low bit set marks the last entry in this bucket's chain.
            if chain_hash & 1 != 0 {
                return None;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_hash_matches_known_value() {
        // The canonical worked example from the GNU hash ABI note.
        assert_eq!(gnu_hash(""), 5381);
    }

    #[test]
    fn elf_hash_empty_string_is_zero() {
        assert_eq!(elf_hash(""), 0);
    }

    #[test]
    fn gnu_hash_rejects_non_power_of_two_maskwords() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&1u32.to_le_bytes()); // nbucket
        bytes[4..8].copy_from_slice(&0u32.to_le_bytes()); // symoffset
        bytes[8..12].copy_from_slice(&3u32.to_le_bytes()); // maskwords = 3 (invalid)
        bytes[12..16].copy_from_slice(&0u32.to_le_bytes()); // shift2
        assert!(matches!(
            GnuHash::parse(&bytes, 0, 0),
            Err(Error::BadGnuHashMaskwords(3))
        ));
    }
}
