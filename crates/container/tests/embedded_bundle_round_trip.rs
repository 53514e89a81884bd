//! Embedded-payload round trip: `host' = host ++ companion ++
//! footer(companion)`, where `companion` is itself a full bundle. Parsing
//! `host'` with the embedded-payload reader and feeding the extracted
//! bytes into the bundle reader must reproduce the companion's original
//! entry table exactly.

use vmforge_container::{
    append_embedded_payload_tail, parse_embedded_payload_tail, Bundle, BundleFunctionEntry,
    BundleReader, BundleWriter, FooterStatus,
};

#[test]
fn embedded_companion_bundle_decodes_to_the_original_entries() {
    let original = Bundle {
        entries: vec![
            BundleFunctionEntry {
                fun_addr: 0x401000,
                encoded_data: vec![10, 20, 30, 40, 50],
            },
            BundleFunctionEntry {
                fun_addr: 0x401080,
                encoded_data: vec![1, 2, 3],
            },
        ],
        shared_branch_addrs: vec![0x500000, 0x500010],
    };

    // `companion`: a companion shared library, represented here by a
    // filler prefix standing in for its own ELF bytes, with the bundle
    // tail-appended the way `vmforge-linker` would load it from disk.
    let mut companion = vec![0xAAu8; 128];
    companion.extend_from_slice(&BundleWriter::write(&original));

    let mut host = b"host library bytes, unrelated to the companion".to_vec();
    let host_len = host.len();
    append_embedded_payload_tail(&mut host, &companion);

    let extracted = match parse_embedded_payload_tail(&host) {
        FooterStatus::Found { base_size, payload } => {
            assert_eq!(base_size as usize, host_len);
            payload
        }
        other => panic!("expected an embedded payload, got {other:?}"),
    };
    assert_eq!(extracted, companion);

    let decoded = BundleReader::read(&extracted).unwrap();
    assert_eq!(decoded, original);
}
