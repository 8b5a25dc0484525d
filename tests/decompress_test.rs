//! End-to-end decompression of v5 archives, including filters and solid
//! chains. The compressed streams are built with a bit writer emitting
//! Huffman tables where every literal gets a 9-bit code equal to its
//! value.

mod util;

use std::io::{Cursor, Read};
use std::sync::Arc;

use rar_decode::{list, Options, RarError, Reader};
use util::*;

const ARC_SOLID: u64 = 0x0004;
const COMP_SOLID: u64 = 0x40;
const COMP_METHOD_NORMAL: u64 = 3 << 7;

fn single_file_archive(name: &'static str, packed: Vec<u8>, plain: &[u8], comp: u64) -> Vec<u8> {
    let mut arc = SIG50.to_vec();
    arc.extend(main50(0));
    arc.extend(file50(&File50 {
        name,
        packed,
        unpacked_size: plain.len() as u64,
        crc: crc32fast::hash(plain),
        comp,
    }));
    arc.extend(end50(0));
    arc
}

#[test]
fn test_literal_stream_round_trip() {
    let plain: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let packed = v5_literal_stream(&plain);
    let arc = single_file_archive("data.bin", packed, &plain, COMP_METHOD_NORMAL);

    let mut r = Reader::new(Cursor::new(arc), Options::new()).unwrap();
    let h = r.next().unwrap().unwrap();
    assert_eq!(h.name, "data.bin");
    assert_eq!(h.unpacked_size, 1000);

    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, plain);
    assert!(r.next().unwrap().is_none());
}

#[test]
fn test_delta_filter_at_offset() {
    // 64 bytes of output: 16 zeros, then 8 delta-coded bytes, then 40
    // 0xAA literals. Deltas of 0xFF decode to 1, 2, ..., 8.
    let mut expected = vec![0u8; 16];
    expected.extend(1..=8u8);
    expected.extend(std::iter::repeat(0xAA).take(40));

    let mut w = BitWriter::new();
    write_literal_tables(&mut w);
    for _ in 0..16 {
        w.put(0, 9);
    }
    // the filter covers the next 8 bytes of output
    write_filter(&mut w, 0, 8, 0, 1);
    for _ in 0..8 {
        w.put(0xFF, 9);
    }
    for _ in 0..40 {
        w.put(0xAA, 9);
    }
    let packed = v5_block(w, true);
    let arc = single_file_archive("delta.bin", packed, &expected, COMP_METHOD_NORMAL);

    let mut r = Reader::new(Cursor::new(arc), Options::new()).unwrap();
    r.next().unwrap().unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), 64);
    assert_eq!(out, expected);
}

fn solid_archive(files: &[(&'static str, &[u8])]) -> Vec<u8> {
    let mut arc = SIG50.to_vec();
    arc.extend(main50(ARC_SOLID));
    for (i, (name, plain)) in files.iter().enumerate() {
        let solid = if i == 0 { 0 } else { COMP_SOLID };
        arc.extend(file50(&File50 {
            name,
            packed: v5_literal_stream(plain),
            unpacked_size: plain.len() as u64,
            crc: crc32fast::hash(plain),
            comp: COMP_METHOD_NORMAL | solid,
        }));
    }
    arc.extend(end50(0));
    arc
}

#[test]
fn test_solid_skip_decodes_through() {
    let arc = solid_archive(&[
        ("one.txt", b"first file contents" as &[u8]),
        ("two.txt", b"second file contents"),
        ("three.txt", b"third file contents"),
    ]);

    let mut r = Reader::new(Cursor::new(arc), Options::new()).unwrap();
    // advance with next() only; the reader must decode-and-discard the
    // skipped solid files to keep the decoder state chained
    assert_eq!(r.next().unwrap().unwrap().name, "one.txt");
    assert_eq!(r.next().unwrap().unwrap().name, "two.txt");
    let h = r.next().unwrap().unwrap();
    assert_eq!(h.name, "three.txt");
    assert!(h.solid);

    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"third file contents");
    assert!(r.next().unwrap().is_none());
}

#[test]
fn test_solid_open_rejected() {
    let arc = solid_archive(&[
        ("one.txt", b"first file contents" as &[u8]),
        ("two.txt", b"second file contents"),
    ]);
    let fs = MapFs::new(&[("solid.rar", arc)]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let files = list("solid.rar", opts).unwrap();
    assert_eq!(files.len(), 2);
    // the first file of a solid archive starts a fresh chain and stays
    // randomly accessible
    let mut fr = files[0].open().unwrap();
    let mut out = Vec::new();
    fr.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"first file contents");

    assert!(matches!(
        files[1].open(),
        Err(RarError::SolidOpenUnsupported)
    ));
}

#[test]
fn test_compressed_random_access_from_listing() {
    let plain: Vec<u8> = b"compressed but reachable from a listing".to_vec();
    let packed = v5_literal_stream(&plain);
    let arc = single_file_archive("c.txt", packed, &plain, COMP_METHOD_NORMAL);
    let fs = MapFs::new(&[("c.rar", arc)]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let files = list("c.rar", opts).unwrap();
    let mut fr = files[0].open().unwrap();
    let mut out = Vec::new();
    fr.read_to_end(&mut out).unwrap();
    assert_eq!(out, plain);
}

#[test]
fn test_short_compressed_stream_is_short_file() {
    // the stream delivers 10 bytes but the header promises 20
    let plain = b"0123456789";
    let packed = v5_literal_stream(plain);
    let mut arc = SIG50.to_vec();
    arc.extend(main50(0));
    arc.extend(file50(&File50 {
        name: "short.bin",
        packed,
        unpacked_size: 20,
        crc: crc32fast::hash(plain),
        comp: COMP_METHOD_NORMAL,
    }));
    arc.extend(end50(0));

    let mut r = Reader::new(Cursor::new(arc), Options::new()).unwrap();
    r.next().unwrap().unwrap();
    let mut out = Vec::new();
    let err = r.read_to_end(&mut out).unwrap_err();
    assert!(err.to_string().contains("too short"), "{err}");
}
