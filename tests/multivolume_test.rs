//! Multi-volume archives: naming schemes and files straddling volumes.

mod util;

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use rar_decode::{list, Options, Reader};
use util::*;

const MAIN_VOLUME: u16 = 0x0001;
const MAIN_NEW_NAMING: u16 = 0x0010;
const FILE_SPLIT_BEFORE: u16 = 0x0001;
const FILE_SPLIT_AFTER: u16 = 0x0002;
const END_NEXT_VOLUME: u16 = 0x0001;

/// Builds a two-volume archive holding one stored file split at `cut`.
fn split_archive(content: &[u8], cut: usize) -> (Vec<u8>, Vec<u8>) {
    let (part1, part2) = content.split_at(cut);
    let total = content.len() as u32;

    let mut vol1 = SIG15.to_vec();
    vol1.extend(main15(MAIN_VOLUME | MAIN_NEW_NAMING));
    vol1.extend(file15(&File15 {
        name: "test.txt",
        packed: part1.to_vec(),
        unpacked_size: total,
        crc: 0,
        flags: FILE_SPLIT_AFTER,
        salt: None,
    }));
    vol1.extend(end15(END_NEXT_VOLUME));

    let mut vol2 = SIG15.to_vec();
    vol2.extend(main15(MAIN_VOLUME | MAIN_NEW_NAMING));
    vol2.extend(file15(&File15 {
        name: "test.txt",
        packed: part2.to_vec(),
        unpacked_size: total,
        crc: 0,
        flags: FILE_SPLIT_BEFORE,
        salt: None,
    }));
    vol2.extend(end15(0));

    (vol1, vol2)
}

fn content() -> Vec<u8> {
    (0..200u32).flat_map(|i| format!("line {i}\n").into_bytes()).collect()
}

#[test]
fn test_split_file_crosses_volume() {
    let data = content();
    let (vol1, vol2) = split_archive(&data, data.len() / 2);
    let fs = MapFs::new(&[
        ("test.part001.rar", vol1),
        ("test.part002.rar", vol2),
    ]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let mut r = Reader::open("test.part001.rar", opts).unwrap();
    let h = r.next().unwrap().unwrap();
    assert_eq!(h.name, "test.txt");
    assert_eq!(h.unpacked_size, data.len() as u64);

    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);

    let vols = r.volumes();
    assert_eq!(vols, vec!["test.part001.rar", "test.part002.rar"]);

    assert!(r.next().unwrap().is_none());
}

#[test]
fn test_split_file_read_in_small_pieces() {
    let data = content();
    // cut at an awkward offset so reads are forced across the boundary
    let (vol1, vol2) = split_archive(&data, 37);
    let fs = MapFs::new(&[
        ("test.part001.rar", vol1),
        ("test.part002.rar", vol2),
    ]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let mut r = Reader::open("test.part001.rar", opts).unwrap();
    r.next().unwrap().unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 11];
    loop {
        let n = r.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, data);
}

#[test]
fn test_old_naming_scheme() {
    let data = content();
    let (vol1, vol2) = split_archive(&data, 64);
    // main header without the new-naming flag drives .rar -> .r00
    let fix = |mut v: Vec<u8>| {
        let main = main15(MAIN_VOLUME);
        let _ = v.splice(SIG15.len()..SIG15.len() + main.len(), main);
        v
    };
    let fs = MapFs::new(&[("old.rar", fix(vol1)), ("old.r00", fix(vol2))]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let mut r = Reader::open("old.rar", opts).unwrap();
    r.next().unwrap().unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(r.volumes(), vec!["old.rar", "old.r00"]);
}

#[test]
fn test_random_access_across_volumes() {
    let data = content();
    let cut = 100;
    let (vol1, vol2) = split_archive(&data, cut);
    let fs = MapFs::new(&[
        ("test.part001.rar", vol1),
        ("test.part002.rar", vol2),
    ]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let files = list("test.part001.rar", opts).unwrap();
    assert_eq!(files.len(), 1);

    let mut fr = files[0].open().unwrap();
    // land inside the second volume
    let target = (cut + 17) as u64;
    fr.seek(SeekFrom::Start(target)).unwrap();
    let mut rest = Vec::new();
    fr.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, &data[target as usize..]);

    // seek backwards to the first volume again
    fr.seek(SeekFrom::Start(3)).unwrap();
    let mut rest = Vec::new();
    fr.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, &data[3..]);

    // and relative to the end
    fr.seek(SeekFrom::End(-5)).unwrap();
    let mut tail = Vec::new();
    fr.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &data[data.len() - 5..]);
}

#[test]
fn test_missing_middle_volume_is_an_error() {
    let data = content();
    let (vol1, _) = split_archive(&data, 50);
    let fs = MapFs::new(&[("test.part001.rar", vol1)]);
    let opts = Options::new().filesystem(Arc::new(fs));

    let mut r = Reader::open("test.part001.rar", opts).unwrap();
    r.next().unwrap().unwrap();
    let mut out = Vec::new();
    // the volume ended with an explicit continues-in-next marker, so a
    // missing next volume is a hard error, not an end of archive
    assert!(r.read_to_end(&mut out).is_err());
}
