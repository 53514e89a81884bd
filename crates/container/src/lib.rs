//! Bundle container codec (function payloads tail-appended to a companion
//! shared library) and the embedded-payload footer protocol (a single
//! payload blob tail-appended to a host shared library).

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bundle too small to contain a footer")]
    TooSmallForFooter,
    #[error("bundle footer magic/version mismatch")]
    BadFooter,
    #[error("bundle_size {bundle_size} out of range for a {file_size}-byte file")]
    BadBundleSize { bundle_size: u64, file_size: u64 },
    #[error("bundle header magic/version mismatch")]
    BadHeader,
    #[error("payload_count={payload_count} / branch_addr_count={branch_addr_count} overflow bundle_size")]
    BadCounts {
        payload_count: u32,
        branch_addr_count: u32,
    },
    #[error("entry {index} has fun_addr=0 or data_size=0")]
    InvalidEntry { index: u32 },
    #[error("entry {index} has duplicated fun_addr {fun_addr:#x}")]
    DuplicateFunAddr { index: u32, fun_addr: u64 },
    #[error("entry {index} data range [{begin:#x}, {end:#x}) falls outside the payload region")]
    OutOfRangeEntry { index: u32, begin: u64, end: u64 },
    #[error("truncated read at offset {offset} (needed {needed} bytes, had {available})")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// CRC32/IEEE (the `zlib`/Ethernet polynomial), computed byte-at-a-time via
/// a 256-entry table built once and cached in the first call.
pub mod crc32 {
    use std::sync::OnceLock;

    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

    fn table() -> &'static [u32; 256] {
        TABLE.get_or_init(|| {
            let mut table = [0u32; 256];
            for (i, slot) in table.iter_mut().enumerate() {
                let mut crc = i as u32;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        0xEDB8_8320 ^ (crc >> 1)
                    } else {
                        crc >> 1
                    };
                }
                *slot = crc;
            }
            table
        })
    }

    pub fn init() -> u32 {
        0xFFFF_FFFF
    }

    pub fn update(crc: u32, data: &[u8]) -> u32 {
        let table = table();
        let mut crc = crc;
        for &byte in data {
            crc = table[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        crc
    }

    pub fn finalize(crc: u32) -> u32 {
        crc ^ 0xFFFF_FFFF
    }

    pub fn of(data: &[u8]) -> u32 {
        finalize(update(init(), data))
    }
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice = bytes.get(offset..offset + 4).ok_or(Error::Truncated {
        offset,
        needed: 4,
        available: bytes.len().saturating_sub(offset),
    })?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice = bytes.get(offset..offset + 8).ok_or(Error::Truncated {
        offset,
        needed: 8,
        available: bytes.len().saturating_sub(offset),
    })?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

const BUNDLE_HEADER_MAGIC: u32 = 0x4842_4D56; // 'VMBH'
const BUNDLE_FOOTER_MAGIC: u32 = 0x4642_4D56; // 'VMBF'
const BUNDLE_VERSION: u32 = 1;

const HEADER_SIZE: u64 = 16; // magic, version, payload_count, branch_addr_count
const ENTRY_SIZE: u64 = 24; // fun_addr, data_offset, data_size
const FOOTER_SIZE: u64 = 16; // magic, version, bundle_size

/// One function payload entry decoded from a bundle: the host address it
/// replaces, and the raw encoded function bytes to be handed to
/// `vmforge_function::EncodedFunction::deserialize_encoded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFunctionEntry {
    pub fun_addr: u64,
    pub encoded_data: Vec<u8>,
}

/// A parsed bundle: every function entry plus the branch-address table
/// they share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub entries: Vec<BundleFunctionEntry>,
    pub shared_branch_addrs: Vec<u64>,
}

/// Reads a bundle tail-appended to `file_bytes` (a companion shared
/// library's full file contents).
pub struct BundleReader;

impl BundleReader {
    pub fn read(file_bytes: &[u8]) -> Result<Bundle> {
        if (file_bytes.len() as u64) < FOOTER_SIZE {
            return Err(Error::TooSmallForFooter);
        }

        let footer_offset = file_bytes.len() as u64 - FOOTER_SIZE;
        let footer_magic = read_u32_le(file_bytes, footer_offset as usize)?;
        let footer_version = read_u32_le(file_bytes, footer_offset as usize + 4)?;
        if footer_magic != BUNDLE_FOOTER_MAGIC || footer_version != BUNDLE_VERSION {
            return Err(Error::BadFooter);
        }
        let bundle_size = read_u64_le(file_bytes, footer_offset as usize + 8)?;

        let min_bundle_size = HEADER_SIZE + FOOTER_SIZE;
        if bundle_size < min_bundle_size || bundle_size > file_bytes.len() as u64 {
            return Err(Error::BadBundleSize {
                bundle_size,
                file_size: file_bytes.len() as u64,
            });
        }

        let bundle_start = file_bytes.len() as u64 - bundle_size;
        let header_magic = read_u32_le(file_bytes, bundle_start as usize)?;
        let header_version = read_u32_le(file_bytes, bundle_start as usize + 4)?;
        if header_magic != BUNDLE_HEADER_MAGIC || header_version != BUNDLE_VERSION {
            return Err(Error::BadHeader);
        }
        let payload_count = read_u32_le(file_bytes, bundle_start as usize + 8)?;
        let branch_addr_count = read_u32_le(file_bytes, bundle_start as usize + 12)?;

        let required_prefix = HEADER_SIZE
            + payload_count as u64 * ENTRY_SIZE
            + branch_addr_count as u64 * 8
            + FOOTER_SIZE;
        if required_prefix > bundle_size {
            return Err(Error::BadCounts {
                payload_count,
                branch_addr_count,
            });
        }

        let entry_table_offset = bundle_start + HEADER_SIZE;
        let branch_addr_table_offset = entry_table_offset + payload_count as u64 * ENTRY_SIZE;
        let payload_data_begin_min =
            branch_addr_table_offset + branch_addr_count as u64 * 8;
        let payload_data_end = bundle_start + bundle_size - FOOTER_SIZE;

        let mut shared_branch_addrs = Vec::with_capacity(branch_addr_count as usize);
        for i in 0..branch_addr_count as u64 {
            let off = branch_addr_table_offset + i * 8;
            shared_branch_addrs.push(read_u64_le(file_bytes, off as usize)?);
        }

        let mut seen_fun_addrs = HashSet::with_capacity(payload_count as usize);
        let mut entries = Vec::with_capacity(payload_count as usize);
        for i in 0..payload_count {
            let entry_off = (entry_table_offset + i as u64 * ENTRY_SIZE) as usize;
            let fun_addr = read_u64_le(file_bytes, entry_off)?;
            let data_offset = read_u64_le(file_bytes, entry_off + 8)?;
            let data_size = read_u64_le(file_bytes, entry_off + 16)?;

            if fun_addr == 0 || data_size == 0 {
                return Err(Error::InvalidEntry { index: i });
            }
            if !seen_fun_addrs.insert(fun_addr) {
                return Err(Error::DuplicateFunAddr { index: i, fun_addr });
            }

            let abs_begin = bundle_start + data_offset;
            let abs_end = abs_begin + data_size;
            if abs_begin < payload_data_begin_min || abs_end > payload_data_end || abs_begin >= abs_end {
                return Err(Error::OutOfRangeEntry {
                    index: i,
                    begin: abs_begin,
                    end: abs_end,
                });
            }

            let data = file_bytes
                .get(abs_begin as usize..abs_end as usize)
                .ok_or(Error::Truncated {
                    offset: abs_begin as usize,
                    needed: data_size as usize,
                    available: file_bytes.len().saturating_sub(abs_begin as usize),
                })?
                .to_vec();
            entries.push(BundleFunctionEntry {
                fun_addr,
                encoded_data: data,
            });
        }

        Ok(Bundle {
            entries,
            shared_branch_addrs,
        })
    }
}

/// Builds a bundle's byte representation for appending to a companion
/// shared library.
pub struct BundleWriter;

impl BundleWriter {
    pub fn write(bundle: &Bundle) -> Vec<u8> {
        let payload_count = bundle.entries.len() as u32;
        let branch_addr_count = bundle.shared_branch_addrs.len() as u32;

        let entry_table_size = bundle.entries.len() as u64 * ENTRY_SIZE;
        let branch_table_size = bundle.shared_branch_addrs.len() as u64 * 8;
        let payload_blob_size: u64 = bundle.entries.iter().map(|e| e.encoded_data.len() as u64).sum();
        let bundle_size =
            HEADER_SIZE + entry_table_size + branch_table_size + payload_blob_size + FOOTER_SIZE;

        let mut out = Vec::with_capacity(bundle_size as usize);
        out.extend_from_slice(&BUNDLE_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
        out.extend_from_slice(&payload_count.to_le_bytes());
        out.extend_from_slice(&branch_addr_count.to_le_bytes());

        // data_offset is relative to bundle start; payload data begins
        // right after header + entry table + branch table.
        let payload_region_start = HEADER_SIZE + entry_table_size + branch_table_size;
        let mut running_offset = payload_region_start;
        for entry in &bundle.entries {
            out.extend_from_slice(&entry.fun_addr.to_le_bytes());
            out.extend_from_slice(&running_offset.to_le_bytes());
            out.extend_from_slice(&(entry.encoded_data.len() as u64).to_le_bytes());
            running_offset += entry.encoded_data.len() as u64;
        }

        for &addr in &bundle.shared_branch_addrs {
            out.extend_from_slice(&addr.to_le_bytes());
        }

        for entry in &bundle.entries {
            out.extend_from_slice(&entry.encoded_data);
        }

        out.extend_from_slice(&BUNDLE_FOOTER_MAGIC.to_le_bytes());
        out.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
        out.extend_from_slice(&bundle_size.to_le_bytes());

        out
    }
}

/// Result of looking for an embedded-payload footer. Missing/mismatched
/// magic or version is `NotFound`, not an error: most host libraries
/// simply don't carry one. A present-but-corrupt footer is `Invalid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FooterStatus {
    NotFound,
    Invalid(String),
    Found {
        /// Byte offset where the footer-protected region begins (i.e. the
        /// file's size before the payload and footer were appended).
        base_size: u64,
        payload: Vec<u8>,
    },
}

const EMBEDDED_PAYLOAD_MAGIC: u32 = 0x3445_4D56; // 'VME4'
const EMBEDDED_PAYLOAD_VERSION: u32 = 1;
const EMBEDDED_FOOTER_SIZE: u64 = 4 + 4 + 8 + 4 + 4; // magic, version, payload_size, crc32, reserved

/// Parses an embedded-payload footer possibly tail-appended to
/// `file_bytes`.
pub fn parse_embedded_payload_tail(file_bytes: &[u8]) -> FooterStatus {
    if (file_bytes.len() as u64) < EMBEDDED_FOOTER_SIZE {
        return FooterStatus::NotFound;
    }
    let footer_off = file_bytes.len() as u64 - EMBEDDED_FOOTER_SIZE;
    let magic = match read_u32_le(file_bytes, footer_off as usize) {
        Ok(v) => v,
        Err(_) => return FooterStatus::NotFound,
    };
    let version = read_u32_le(file_bytes, footer_off as usize + 4).unwrap_or(0);
    if magic != EMBEDDED_PAYLOAD_MAGIC || version != EMBEDDED_PAYLOAD_VERSION {
        return FooterStatus::NotFound;
    }

    let payload_size = match read_u64_le(file_bytes, footer_off as usize + 8) {
        Ok(v) => v,
        Err(e) => return FooterStatus::Invalid(e.to_string()),
    };
    let payload_crc32 = match read_u32_le(file_bytes, footer_off as usize + 16) {
        Ok(v) => v,
        Err(e) => return FooterStatus::Invalid(e.to_string()),
    };

    if payload_size == 0 || payload_size > file_bytes.len() as u64 - EMBEDDED_FOOTER_SIZE {
        return FooterStatus::Invalid("embedded payload footer has invalid payload size".into());
    }

    let payload_begin = file_bytes.len() as u64 - EMBEDDED_FOOTER_SIZE - payload_size;
    let payload = &file_bytes[payload_begin as usize..footer_off as usize];
    let actual_crc = crc32::of(payload);
    if actual_crc != payload_crc32 {
        return FooterStatus::Invalid("embedded payload footer crc mismatch".into());
    }

    FooterStatus::Found {
        base_size: payload_begin,
        payload: payload.to_vec(),
    }
}

/// Appends `payload` and its footer to `file_bytes` in place. A no-op on
/// an empty payload, matching the writer's original semantics (nothing to
/// protect, nothing to append).
pub fn append_embedded_payload_tail(file_bytes: &mut Vec<u8>, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }
    file_bytes.extend_from_slice(payload);
    file_bytes.extend_from_slice(&EMBEDDED_PAYLOAD_MAGIC.to_le_bytes());
    file_bytes.extend_from_slice(&EMBEDDED_PAYLOAD_VERSION.to_le_bytes());
    file_bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    file_bytes.extend_from_slice(&crc32::of(payload).to_le_bytes());
    file_bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_of_known_vector() {
        // "123456789" is the standard CRC32/IEEE check vector (0xCBF43926).
        assert_eq!(crc32::of(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_of_empty_is_zero() {
        assert_eq!(crc32::of(&[]), 0);
    }

    #[test]
    fn bundle_round_trips_through_writer_and_reader() {
        let bundle = Bundle {
            entries: vec![
                BundleFunctionEntry {
                    fun_addr: 0x1000,
                    encoded_data: vec![1, 2, 3, 4],
                },
                BundleFunctionEntry {
                    fun_addr: 0x2000,
                    encoded_data: vec![5, 6, 7],
                },
            ],
            shared_branch_addrs: vec![0xAAAA, 0xBBBB],
        };
        let bytes = BundleWriter::write(&bundle);
        let mut file_bytes = vec![0xFFu8; 64]; // pretend companion .so prefix
        file_bytes.extend_from_slice(&bytes);

        let parsed = BundleReader::read(&file_bytes).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn empty_bundle_round_trips() {
        let bundle = Bundle::default();
        let bytes = BundleWriter::write(&bundle);
        let parsed = BundleReader::read(&bytes).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn too_small_file_rejected() {
        let tiny = vec![0u8; 4];
        assert!(matches!(BundleReader::read(&tiny), Err(Error::TooSmallForFooter)));
    }

    #[test]
    fn bad_footer_magic_rejected() {
        let bundle = Bundle::default();
        let mut bytes = BundleWriter::write(&bundle);
        let len = bytes.len();
        bytes[len - FOOTER_SIZE as usize] ^= 0xFF;
        assert!(matches!(BundleReader::read(&bytes), Err(Error::BadFooter)));
    }

    #[test]
    fn duplicate_fun_addr_rejected() {
        let bundle = Bundle {
            entries: vec![
                BundleFunctionEntry { fun_addr: 0x1000, encoded_data: vec![1] },
                BundleFunctionEntry { fun_addr: 0x1000, encoded_data: vec![2] },
            ],
            shared_branch_addrs: vec![],
        };
        let bytes = BundleWriter::write(&bundle);
        assert!(matches!(
            BundleReader::read(&bytes),
            Err(Error::DuplicateFunAddr { .. })
        ));
    }

    #[test]
    fn embedded_payload_round_trips() {
        let mut file_bytes = b"host library bytes".to_vec();
        let original_len = file_bytes.len();
        append_embedded_payload_tail(&mut file_bytes, b"hidden payload");
        match parse_embedded_payload_tail(&file_bytes) {
            FooterStatus::Found { base_size, payload } => {
                assert_eq!(base_size as usize, original_len);
                assert_eq!(payload, b"hidden payload");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn missing_embedded_payload_is_not_found_not_error() {
        let file_bytes = b"just a plain host library, no footer here".to_vec();
        assert_eq!(parse_embedded_payload_tail(&file_bytes), FooterStatus::NotFound);
    }

    #[test]
    fn corrupted_embedded_payload_crc_is_invalid() {
        let mut file_bytes = b"host".to_vec();
        append_embedded_payload_tail(&mut file_bytes, b"payload-bytes");
        let mid = file_bytes.len() - EMBEDDED_FOOTER_SIZE as usize - 3;
        file_bytes[mid] ^= 0xFF;
        assert!(matches!(
            parse_embedded_payload_tail(&file_bytes),
            FooterStatus::Invalid(_)
        ));
    }

    #[test]
    fn appending_empty_payload_is_a_no_op() {
        let mut file_bytes = b"host".to_vec();
        let before = file_bytes.clone();
        append_embedded_payload_tail(&mut file_bytes, &[]);
        assert_eq!(file_bytes, before);
    }

    #[quickcheck_macros::quickcheck]
    fn prop_crc32_update_is_associative_across_chunk_boundaries(a: Vec<u8>, b: Vec<u8>) -> bool {
        let incremental = crc32::finalize(crc32::update(crc32::update(crc32::init(), &a), &b));
        let mut whole = a.clone();
        whole.extend_from_slice(&b);
        incremental == crc32::of(&whole)
    }

    #[quickcheck_macros::quickcheck]
    fn prop_bundle_round_trips_for_arbitrary_entries(
        fun_addrs: Vec<u64>,
        datas: Vec<Vec<u8>>,
        shared_branch_addrs: Vec<u64>,
    ) -> quickcheck::TestResult {
        let mut seen = HashSet::new();
        let entries: Vec<BundleFunctionEntry> = fun_addrs
            .into_iter()
            .zip(datas)
            .filter(|(addr, data)| *addr != 0 && !data.is_empty() && seen.insert(*addr))
            .map(|(fun_addr, encoded_data)| BundleFunctionEntry { fun_addr, encoded_data })
            .collect();

        let bundle = Bundle { entries, shared_branch_addrs };
        let bytes = BundleWriter::write(&bundle);
        match BundleReader::read(&bytes) {
            Ok(parsed) => quickcheck::TestResult::from_bool(parsed == bundle),
            Err(e) => quickcheck::TestResult::error(format!("round trip failed: {e}")),
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_embedded_payload_round_trips_for_arbitrary_payloads(
        host: Vec<u8>,
        payload: Vec<u8>,
    ) -> quickcheck::TestResult {
        if payload.is_empty() {
            return quickcheck::TestResult::discard();
        }
        let mut file_bytes = host.clone();
        append_embedded_payload_tail(&mut file_bytes, &payload);
        let ok = match parse_embedded_payload_tail(&file_bytes) {
            FooterStatus::Found { base_size, payload: got } => {
                base_size as usize == host.len() && got == payload
            }
            _ => false,
        };
        quickcheck::TestResult::from_bool(ok)
    }
}
