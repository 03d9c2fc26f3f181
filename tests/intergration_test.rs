use std::fs;

use byteorder::{ByteOrder, LittleEndian};
use eme_arc_tool::{
    EmeArchive, SIGNATURE,
    cipher::{CipherRoutine, ROUTINE_SIZE},
    error::ArcError,
    handle_extract, handle_pack,
    image::PixelFormat,
    lzss::{DEFAULT_FRAME_SIZE, DEFAULT_INIT_POS, LzssCodec},
    meta::{ArchiveMeta, MetaEntry, decode_hex},
};
use tempfile::tempdir;

const TEST_KEY: &str =
    "0104020800000000F962A8EC11000000F8E296CA0700000000000000000000000000000000000000";

fn test_routine() -> CipherRoutine {
    CipherRoutine::from_bytes(&decode_hex(TEST_KEY).unwrap()).unwrap()
}

fn build_record(
    name: &str,
    frame: u16,
    raw_init: u16,
    magic: u16,
    sub_type: u32,
    packed: u32,
    unpacked: u32,
    offset: u32,
) -> [u8; 0x60] {
    let mut record = [0u8; 0x60];
    record[..name.len()].copy_from_slice(name.as_bytes());
    LittleEndian::write_u16(&mut record[0x40..0x42], frame);
    LittleEndian::write_u16(&mut record[0x42..0x44], raw_init);
    LittleEndian::write_u16(&mut record[0x44..0x46], magic);
    LittleEndian::write_u32(&mut record[0x48..0x4C], sub_type);
    LittleEndian::write_u32(&mut record[0x4C..0x50], packed);
    LittleEndian::write_u32(&mut record[0x50..0x54], unpacked);
    LittleEndian::write_u32(&mut record[0x54..0x58], offset);
    record
}

fn meta_entry(name: &str, sub_type: u32, frame: u16, init: u16, unpacked: u32) -> MetaEntry {
    MetaEntry {
        name: name.to_string(),
        offset: 0,
        packed_size: 0,
        unpacked_size: unpacked,
        lzss_frame_size: frame,
        lzss_init_pos: init,
        sub_type,
        magic: 0,
        is_packed: false,
    }
}

#[test]
fn test_minimal_archive() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("minimal.eme");

    // Pass-through routine (all opcodes zero), one stored entry.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(SIGNATURE);
    bytes.extend_from_slice(b"HELLO");
    bytes.extend_from_slice(&[0u8; ROUTINE_SIZE]);
    bytes.extend_from_slice(&build_record("a.bin", 0, 0, 0, 0, 5, 5, 8));
    bytes.extend_from_slice(&1u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let archive = EmeArchive::open(&path).unwrap();
    assert_eq!(archive.entries().len(), 1);
    let entry = &archive.entries()[0];
    assert_eq!(entry.name, "a.bin");
    assert!(!entry.is_packed());
    assert_eq!(archive.open_entry(entry).unwrap(), b"HELLO");
}

#[test]
fn test_split_script() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("split.eme");
    let routine = test_routine();
    let codec = LzssCodec::new(DEFAULT_FRAME_SIZE, DEFAULT_INIT_POS).unwrap();

    let part1 = b"-- scene one: the long opening block --\n".repeat(20);
    let part2 = b"EPILOGUE LINE\n".repeat(6);
    let unpacked = (part1.len() + part2.len()) as u32;
    let packed2 = codec.compress(&part2).unwrap();
    let packed1 = codec.compress(&part1).unwrap();

    // The logical tail (part 2) is stored first.
    let mut header = [0u8; 12];
    LittleEndian::write_u32(&mut header[0..4], packed2.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], part2.len() as u32);
    LittleEndian::write_u32(&mut header[8..12], 1);
    routine.encrypt(&mut header).unwrap();

    let mut body = header.to_vec();
    body.extend_from_slice(&packed2);
    body.extend_from_slice(&packed1);

    let mut record = build_record(
        "script.dat",
        DEFAULT_FRAME_SIZE,
        0x12,
        0xAB,
        3,
        body.len() as u32,
        unpacked,
        8,
    );
    routine.encrypt(&mut record).unwrap();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(SIGNATURE);
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(routine.raw());
    bytes.extend_from_slice(&record);
    bytes.extend_from_slice(&1u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let archive = EmeArchive::open(&path).unwrap();
    let entry = &archive.entries()[0];
    assert_eq!(entry.name, "script.dat");
    assert_eq!(entry.lzss_init_pos, DEFAULT_INIT_POS);
    assert_eq!(entry.magic, 0xAB);

    // Logical order restored: part 1 first despite part 2 being stored first.
    let data = archive.open_entry(entry).unwrap();
    assert_eq!(data.len() as u32, unpacked);
    assert_eq!(&data[..part1.len()], &part1[..]);
    assert_eq!(&data[part1.len()..], &part2[..]);
}

#[test]
fn test_pack_extract_repack_is_byte_identical() {
    let temp_dir = tempdir().unwrap();
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(input_dir.join("scripts")).unwrap();
    fs::create_dir_all(input_dir.join("img")).unwrap();
    let routine = test_routine();

    let script = b"@label start\n@say \"hello hello hello\"\n".repeat(16);
    fs::write(input_dir.join("scripts/main.txt"), &script).unwrap();

    let blob: Vec<u8> = (0u32..300).map(|i| (i * 13 % 251) as u8).collect();
    fs::write(input_dir.join("blob.bin"), &blob).unwrap();

    let movie: Vec<u8> = (0u32..64).map(|i| (255 - i) as u8).collect();
    fs::write(input_dir.join("movie.dat"), &movie).unwrap();

    // Image record: encrypted 32-byte header + raw 2x2 BGR pixels.
    let mut img_header = [0u8; 32];
    LittleEndian::write_u16(&mut img_header[0..2], 24);
    LittleEndian::write_u16(&mut img_header[2..4], 2);
    LittleEndian::write_u16(&mut img_header[4..6], 2);
    LittleEndian::write_i32(&mut img_header[8..12], 6);
    routine.encrypt(&mut img_header).unwrap();
    let mut img_record = img_header.to_vec();
    img_record.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    fs::write(input_dir.join("img/pic.bmp"), &img_record).unwrap();

    let sidecar = ArchiveMeta {
        key: TEST_KEY.to_string(),
        entries: vec![
            meta_entry(
                "scripts/main.txt",
                3,
                DEFAULT_FRAME_SIZE,
                DEFAULT_INIT_POS,
                script.len() as u32,
            ),
            meta_entry("blob.bin", 0, 0, 0, blob.len() as u32),
            meta_entry("movie.dat", 5, 0, 0, movie.len() as u32),
            meta_entry("img/pic.bmp", 4, 0, 0, 12),
        ],
    };
    let sidecar_path = input_dir.join("metadata.json");
    sidecar.save(&sidecar_path).unwrap();

    let archive_path = temp_dir.path().join("test.eme");
    handle_pack(&input_dir, &sidecar_path, &archive_path, false).unwrap();

    // The logical payloads come back out of the packed archive.
    let archive = EmeArchive::open(&archive_path).unwrap();
    assert_eq!(archive.entries().len(), 4);
    let by_name = |name: &str| {
        archive
            .entries()
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("missing entry {name}"))
    };

    let script_entry = by_name("scripts/main.txt");
    assert!(script_entry.is_packed());
    assert_eq!(archive.open_entry(script_entry).unwrap(), script);

    assert_eq!(archive.open_entry(by_name("blob.bin")).unwrap(), blob);
    assert_eq!(archive.open_entry(by_name("movie.dat")).unwrap(), movie);

    let image_entry = by_name("img/pic.bmp");
    assert_eq!(image_entry.packed_size, 12);
    assert_eq!(archive.open_entry(image_entry).unwrap(), img_record);
    let image = archive.read_image(image_entry).unwrap();
    assert_eq!(image.format, PixelFormat::Bgr24);
    assert_eq!(image.header.width, 2);
    assert_eq!(image.pixels.len(), 12);

    // Extract, then pack the extraction: byte-identical archive.
    let extract_dir = temp_dir.path().join("extracted");
    handle_extract(&archive_path, &extract_dir).unwrap();
    assert_eq!(
        fs::read(extract_dir.join("scripts/main.txt")).unwrap(),
        script
    );
    assert_eq!(fs::read(extract_dir.join("blob.bin")).unwrap(), blob);
    assert_eq!(fs::read(extract_dir.join("movie.dat")).unwrap(), movie);
    assert_eq!(fs::read(extract_dir.join("img/pic.bmp")).unwrap(), img_record);

    let emitted = ArchiveMeta::load(extract_dir.join("metadata.json")).unwrap();
    assert_eq!(emitted.key, TEST_KEY);
    assert_eq!(emitted.entries.len(), 4);

    let repacked_path = temp_dir.path().join("repacked.eme");
    handle_pack(
        &extract_dir,
        &extract_dir.join("metadata.json"),
        &repacked_path,
        false,
    )
    .unwrap();
    assert_eq!(
        fs::read(&archive_path).unwrap(),
        fs::read(&repacked_path).unwrap()
    );
}

#[test]
fn test_stored_script() {
    let temp_dir = tempdir().unwrap();
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(&input_dir).unwrap();

    let text = b"short uncompressed script".to_vec();
    fs::write(input_dir.join("s.txt"), &text).unwrap();
    let sidecar = ArchiveMeta {
        // Lowercase keys are accepted on read.
        key: TEST_KEY.to_lowercase(),
        entries: vec![meta_entry("s.txt", 3, 0, 0, text.len() as u32)],
    };
    let sidecar_path = input_dir.join("metadata.json");
    sidecar.save(&sidecar_path).unwrap();

    let archive_path = temp_dir.path().join("stored.eme");
    handle_pack(&input_dir, &sidecar_path, &archive_path, false).unwrap();

    let archive = EmeArchive::open(&archive_path).unwrap();
    let entry = &archive.entries()[0];
    assert_eq!(entry.lzss_frame_size, 0);
    // Stored scripts keep their 12-byte header in the logical payload.
    let data = archive.open_entry(entry).unwrap();
    assert_eq!(data.len(), 12 + text.len());
    assert_eq!(LittleEndian::read_u32(&data[0..4]), 0);
    assert_eq!(LittleEndian::read_u32(&data[4..8]), text.len() as u32);
    assert_eq!(LittleEndian::read_u32(&data[8..12]), 0);
    assert_eq!(&data[12..], &text[..]);
}

#[test]
fn test_store_flag_disables_compression() {
    let temp_dir = tempdir().unwrap();
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(&input_dir).unwrap();

    let text = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
    fs::write(input_dir.join("s.txt"), &text).unwrap();
    let sidecar = ArchiveMeta {
        key: TEST_KEY.to_string(),
        entries: vec![meta_entry(
            "s.txt",
            3,
            DEFAULT_FRAME_SIZE,
            DEFAULT_INIT_POS,
            text.len() as u32,
        )],
    };
    let sidecar_path = input_dir.join("metadata.json");
    sidecar.save(&sidecar_path).unwrap();

    let archive_path = temp_dir.path().join("stored.eme");
    handle_pack(&input_dir, &sidecar_path, &archive_path, true).unwrap();

    let archive = EmeArchive::open(&archive_path).unwrap();
    let entry = &archive.entries()[0];
    assert_eq!(entry.lzss_frame_size, 0);
    assert_eq!(entry.packed_size, 12 + text.len() as u32);
}

#[test]
fn test_bad_signature() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("bad.eme");
    let mut bytes = b"NOTANARC".to_vec();
    bytes.extend_from_slice(&[0u8; 0x100]);
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        EmeArchive::open(&path),
        Err(ArcError::BadSignature)
    ));
}

#[test]
fn test_insane_count() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("bad.eme");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(SIGNATURE);
    bytes.extend_from_slice(&[0u8; 0x100]);
    bytes.extend_from_slice(&0u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        EmeArchive::open(&path),
        Err(ArcError::InsaneCount(0))
    ));
}

#[test]
fn test_short_file() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("tiny.eme");
    fs::write(&path, b"RREDATA ").unwrap();
    assert!(matches!(
        EmeArchive::open(&path),
        Err(ArcError::ShortFile { .. })
    ));
}

#[test]
fn test_bad_placement() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("bad.eme");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(SIGNATURE);
    bytes.extend_from_slice(b"HELLO");
    bytes.extend_from_slice(&[0u8; ROUTINE_SIZE]);
    // packed_size runs one byte past the data region.
    bytes.extend_from_slice(&build_record("a.bin", 0, 0, 0, 0, 6, 6, 8));
    bytes.extend_from_slice(&1u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        EmeArchive::open(&path),
        Err(ArcError::BadPlacement { .. })
    ));
}
