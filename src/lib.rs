pub mod cipher;
pub mod cli;
pub mod error;
pub mod image;
pub mod lzss;
pub mod meta;

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::SHIFT_JIS; // CP932 encoding for entry names
use log::{debug, error, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::{
    cipher::{CipherRoutine, ROUTINE_SIZE},
    error::ArcError,
    image::{EmeImage, IMAGE_HEADER_SIZE},
    lzss::LzssCodec,
    meta::{ArchiveMeta, MetaEntry},
};

// --- .eme File Format ---
// Signature (8 bytes): "RREDATA "
//
// Body Section (from offset 8):
//   Concatenated payload bodies in entry order. Shape depends on sub_type:
//     - 3 (script): 12-byte encrypted header {part2_packed_size,
//       part2_unpacked_size, compressed_flag}, then one or two LZSS
//       streams (split bodies store the logical tail first).
//     - 4 (image): 32-byte encrypted bitmap header + optional palette +
//       pixel block; the index packed_size excludes the 32 header bytes.
//     - 5: first 4 bytes encrypted, remainder verbatim.
//     - anything else: verbatim bytes.
//
// Trailer:
//   - cipher routine (40 bytes, plaintext): 8 opcodes + 8 u32 keys that
//     drive the index/header encryption.
//   - index: entry_count records of 0x60 bytes, each encrypted
//     independently under the routine:
//       0x00  name (64 bytes, NUL-padded)
//       0x40  u16 lzss_frame_size (0 = stored)
//       0x42  u16 lzss_init_pos (on-disk convention, see below)
//       0x44  u16 magic (opaque, preserved)
//       0x46  u16 reserved
//       0x48  u32 sub_type
//       0x4C  u32 packed_size
//       0x50  u32 unpacked_size
//       0x54  u32 body_offset
//       0x58  8 reserved bytes
//   - entry_count (u32, Little Endian)
//
// The in-memory LZSS start position is (frame - raw) % frame; the inverse
// is applied when serializing. For frame 0x1000 the canonical position is
// 0xFEE.
// --- End of Format ---

pub const SIGNATURE: &[u8; 8] = b"RREDATA ";
pub const INDEX_RECORD_SIZE: usize = 0x60;
const NAME_FIELD_SIZE: usize = 0x40;
const MAX_ENTRY_COUNT: u32 = 100_000;
const SCRIPT_HEADER_SIZE: usize = 12;

pub const SUB_TYPE_SCRIPT: u32 = 3;
pub const SUB_TYPE_IMAGE: u32 = 4;
pub const SUB_TYPE_PREFIXED: u32 = 5;

#[derive(Debug, Clone)]
pub struct EmeEntry {
    pub name: String,
    pub lzss_frame_size: u16,
    /// Initial ring-buffer write position, in-memory convention.
    pub lzss_init_pos: u16,
    pub magic: u16,
    pub reserved: u16,
    pub sub_type: u32,
    pub packed_size: u32,
    pub unpacked_size: u32,
    pub offset: u32,
    pub reserved_tail: [u8; 8],
}

impl EmeEntry {
    pub fn is_packed(&self) -> bool {
        self.packed_size != self.unpacked_size
    }
}

pub struct EmeArchive {
    path: PathBuf,
    routine: CipherRoutine,
    entries: Vec<EmeEntry>,
    /// Start of the trailer (routine + index + count); bodies end here.
    data_end: u64,
}

impl EmeArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArcError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArcError::NotFound(path.to_path_buf()));
        }

        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let min_size = (SIGNATURE.len() + ROUTINE_SIZE + INDEX_RECORD_SIZE + 4) as u64;
        if file_size < min_size {
            return Err(ArcError::ShortFile {
                needed: min_size,
                available: file_size,
            });
        }

        let mut signature = [0u8; 8];
        reader.read_exact(&mut signature)?;
        if &signature != SIGNATURE {
            return Err(ArcError::BadSignature);
        }

        reader.seek(SeekFrom::End(-4))?;
        let count = reader.read_u32::<LittleEndian>()?;
        if count == 0 || count >= MAX_ENTRY_COUNT {
            return Err(ArcError::InsaneCount(count));
        }
        debug!("Archive holds {count} entries");

        let index_size = u64::from(count) * INDEX_RECORD_SIZE as u64;
        let trailer = 4 + index_size + ROUTINE_SIZE as u64;
        if file_size < SIGNATURE.len() as u64 + trailer {
            return Err(ArcError::ShortFile {
                needed: SIGNATURE.len() as u64 + trailer,
                available: file_size,
            });
        }
        let index_offset = file_size - 4 - index_size;
        let data_end = index_offset - ROUTINE_SIZE as u64;

        reader.seek(SeekFrom::Start(data_end))?;
        let mut routine_buf = [0u8; ROUTINE_SIZE];
        reader.read_exact(&mut routine_buf)?;
        let routine = CipherRoutine::from_bytes(&routine_buf)?;
        // The routine must at least undo the index records it sealed.
        routine.check_invertible(INDEX_RECORD_SIZE)?;

        let mut index = vec![0u8; index_size as usize];
        reader.read_exact(&mut index)?;

        let mut entries = Vec::with_capacity(count as usize);
        for record in index.chunks_exact_mut(INDEX_RECORD_SIZE) {
            routine.decrypt(record)?;
            let entry = parse_record(record)?;
            if u64::from(entry.offset) + u64::from(entry.packed_size) > data_end {
                return Err(ArcError::BadPlacement {
                    name: entry.name,
                    offset: entry.offset,
                    size: entry.packed_size,
                });
            }
            entries.push(entry);
        }
        info!("Read {} file entries from index.", entries.len());

        Ok(Self {
            path: path.to_path_buf(),
            routine,
            entries,
            data_end,
        })
    }

    pub fn entries(&self) -> &[EmeEntry] {
        &self.entries
    }

    pub fn routine(&self) -> &CipherRoutine {
        &self.routine
    }

    /// Decode one entry into its logical payload. Opens a private file
    /// handle, so entries can be decoded from multiple threads at once.
    pub fn open_entry(&self, entry: &EmeEntry) -> Result<Vec<u8>, ArcError> {
        match entry.sub_type {
            SUB_TYPE_SCRIPT => self.open_script(entry),
            SUB_TYPE_PREFIXED if entry.packed_size > 4 => self.open_prefixed(entry),
            SUB_TYPE_IMAGE => self.read_image_record(entry),
            _ => self.read_body(entry.offset, entry.packed_size as usize),
        }
    }

    /// Decode an image entry (sub_type 4) into pixels.
    pub fn read_image(&self, entry: &EmeEntry) -> Result<EmeImage, ArcError> {
        if entry.sub_type != SUB_TYPE_IMAGE {
            return Err(ArcError::UnsupportedImage(format!(
                "entry {:?} has sub_type {}",
                entry.name, entry.sub_type
            )));
        }
        let record = self.read_image_record(entry)?;
        image::decode_image(
            &record,
            &self.routine,
            entry.lzss_frame_size,
            entry.lzss_init_pos,
        )
    }

    pub fn to_metadata(&self) -> ArchiveMeta {
        ArchiveMeta {
            key: meta::encode_hex_upper(self.routine.raw()),
            entries: self.entries.iter().map(MetaEntry::from_entry).collect(),
        }
    }

    fn open_script(&self, entry: &EmeEntry) -> Result<Vec<u8>, ArcError> {
        let packed = entry.packed_size as usize;
        if packed < SCRIPT_HEADER_SIZE {
            return Err(ArcError::BadPayload {
                name: entry.name.clone(),
                expected: SCRIPT_HEADER_SIZE,
                actual: packed,
            });
        }
        let body = self.read_body(entry.offset, packed)?;
        let mut header = body[..SCRIPT_HEADER_SIZE].to_vec();
        self.routine.decrypt(&mut header)?;

        if entry.lzss_frame_size == 0 {
            header.extend_from_slice(&body[SCRIPT_HEADER_SIZE..]);
            return Ok(header);
        }

        let part2_packed = LittleEndian::read_u32(&header[0..4]) as usize;
        let part2_unpacked = LittleEndian::read_u32(&header[4..8]) as usize;
        let unpacked = entry.unpacked_size as usize;
        let codec = LzssCodec::new(entry.lzss_frame_size, entry.lzss_init_pos)?;
        let payload = &body[SCRIPT_HEADER_SIZE..];

        if part2_unpacked != 0 && part2_unpacked < unpacked {
            // Split body: the logical tail is stored first so a short
            // prefix of the payload can be loaded without the rest.
            if part2_packed > payload.len() {
                return Err(ArcError::BadPayload {
                    name: entry.name.clone(),
                    expected: part2_packed,
                    actual: payload.len(),
                });
            }
            let part1_unpacked = unpacked - part2_unpacked;
            let part2 = codec.decompress(&payload[..part2_packed], part2_unpacked);
            let mut part1 = codec.decompress(&payload[part2_packed..], part1_unpacked);
            if part1.len() != part1_unpacked || part2.len() != part2_unpacked {
                return Err(ArcError::BadPayload {
                    name: entry.name.clone(),
                    expected: unpacked,
                    actual: part1.len() + part2.len(),
                });
            }
            part1.extend_from_slice(&part2);
            Ok(part1)
        } else {
            let data = codec.decompress(payload, unpacked);
            if data.len() != unpacked {
                return Err(ArcError::BadPayload {
                    name: entry.name.clone(),
                    expected: unpacked,
                    actual: data.len(),
                });
            }
            Ok(data)
        }
    }

    fn open_prefixed(&self, entry: &EmeEntry) -> Result<Vec<u8>, ArcError> {
        let mut body = self.read_body(entry.offset, entry.packed_size as usize)?;
        let (prefix, _) = body.split_at_mut(4);
        self.routine.decrypt(prefix)?;
        Ok(body)
    }

    // The full on-disk image record: header + palette + pixel block. The
    // packed_size field does not count the 32 header bytes, so read past
    // it, clamped to the data region.
    fn read_image_record(&self, entry: &EmeEntry) -> Result<Vec<u8>, ArcError> {
        let want = entry.packed_size as usize + IMAGE_HEADER_SIZE;
        let avail = self.data_end.saturating_sub(u64::from(entry.offset)) as usize;
        self.read_body(entry.offset, want.min(avail))
    }

    fn read_body(&self, offset: u32, len: usize) -> Result<Vec<u8>, ArcError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn parse_record(record: &[u8]) -> Result<EmeEntry, ArcError> {
    let name = decode_name(&record[..NAME_FIELD_SIZE])?;
    let lzss_frame_size = LittleEndian::read_u16(&record[0x40..0x42]);
    let raw_init_pos = LittleEndian::read_u16(&record[0x42..0x44]);
    let lzss_init_pos = if lzss_frame_size != 0 {
        let frame = u32::from(lzss_frame_size);
        ((frame - u32::from(raw_init_pos) % frame) % frame) as u16
    } else {
        raw_init_pos
    };
    let mut reserved_tail = [0u8; 8];
    reserved_tail.copy_from_slice(&record[0x58..0x60]);
    Ok(EmeEntry {
        name,
        lzss_frame_size,
        lzss_init_pos,
        magic: LittleEndian::read_u16(&record[0x44..0x46]),
        reserved: LittleEndian::read_u16(&record[0x46..0x48]),
        sub_type: LittleEndian::read_u32(&record[0x48..0x4C]),
        packed_size: LittleEndian::read_u32(&record[0x4C..0x50]),
        unpacked_size: LittleEndian::read_u32(&record[0x50..0x54]),
        offset: LittleEndian::read_u32(&record[0x54..0x58]),
        reserved_tail,
    })
}

fn decode_name(field: &[u8]) -> Result<String, ArcError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let raw = &field[..end];
    let (cow, _encoding_used, had_errors) = SHIFT_JIS.decode(raw);
    if had_errors {
        Err(ArcError::NameDecodeError(raw.to_vec()))
    } else {
        Ok(cow.into_owned())
    }
}

fn encode_name(name: &str) -> Result<Vec<u8>, ArcError> {
    let (encoded, _encoding_used, had_errors) = SHIFT_JIS.encode(name);
    if had_errors || encoded.len() > NAME_FIELD_SIZE {
        return Err(ArcError::NameEncodeError(name.to_string()));
    }
    Ok(encoded.into_owned())
}

// --- Extract Logic ---

pub fn handle_extract(
    input_path: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> Result<(), ArcError> {
    let input_path = input_path.as_ref();
    let output_dir = output_dir.as_ref();

    info!("Starting extract of: {input_path:?}");
    info!("Output directory: {output_dir:?}");

    let archive = EmeArchive::open(input_path)?;
    fs::create_dir_all(output_dir)?;

    archive.to_metadata().save(output_dir.join("metadata.json"))?;
    info!("Wrote metadata.json");

    // Per-entry failures are reported but do not stop the other entries;
    // each parallel task decodes through its own file handle.
    let failures: usize = archive
        .entries()
        .par_iter()
        .map(|entry| match extract_entry(&archive, entry, output_dir) {
            Ok(()) => 0,
            Err(e) => {
                error!("Failed to extract {}: {e}", entry.name);
                1
            }
        })
        .sum();

    if failures > 0 {
        return Err(ArcError::PartialExtract(failures));
    }
    info!("=== Extract finished ===");
    Ok(())
}

fn extract_entry(
    archive: &EmeArchive,
    entry: &EmeEntry,
    output_dir: &Path,
) -> Result<(), ArcError> {
    let output_path = output_dir.join(&entry.name);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = archive.open_entry(entry)?;
    fs::write(&output_path, &data)?;
    info!("Extracted: {}", entry.name);
    Ok(())
}

// --- Pack Logic ---

// Intermediate structure for packing
#[derive(Debug)]
struct PackItem {
    name: String,
    sub_type: u32,
    magic: u16,
    lzss_frame_size: u16,
    lzss_init_pos: u16,
    unpacked_size: u32,
    body: Vec<u8>,
    packed_size: u32,
    offset: u32, // Placeholder until layout
}

pub fn handle_pack(
    input_dir: impl AsRef<Path>,
    sidecar_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    store: bool,
) -> Result<(), ArcError> {
    let input_dir = input_dir.as_ref();
    let sidecar_path = sidecar_path.as_ref();
    let output_path = output_path.as_ref();

    info!("Starting pack of directory: {input_dir:?}");
    info!("Sidecar: {sidecar_path:?}");
    info!("Output archive: {output_path:?}");

    if !input_dir.is_dir() {
        return Err(ArcError::NotFound(input_dir.to_path_buf()));
    }

    let metadata = ArchiveMeta::load(sidecar_path)?;
    let routine = metadata.routine()?;
    routine.check_invertible(INDEX_RECORD_SIZE)?;
    warn_unlisted_files(input_dir, &metadata);

    // 1. Read and seal all bodies (pack is all-or-nothing, so everything
    // is prepared in memory before the output file is created).
    let mut items = metadata
        .entries
        .par_iter()
        .map(|entry| -> Result<PackItem, ArcError> {
            let source_path = input_dir.join(&entry.name);
            if !source_path.is_file() {
                return Err(ArcError::NotFound(source_path));
            }
            let data = fs::read(&source_path)?;
            let item = pack_body(&routine, entry, data, store)?;
            debug!(
                "Packed {} ({} -> {} bytes)",
                item.name, item.unpacked_size, item.packed_size
            );
            Ok(item)
        })
        .collect::<Result<Vec<_>, ArcError>>()?;

    // 2. Assign body offsets, starting right after the signature.
    let mut current_offset = SIGNATURE.len() as u32;
    for item in items.iter_mut() {
        item.offset = current_offset;
        current_offset += item.body.len() as u32;
    }

    // 3. Serialize and encrypt the index.
    let mut index = Vec::with_capacity(items.len() * INDEX_RECORD_SIZE);
    for item in &items {
        let mut record = serialize_record(item)?;
        routine.encrypt(&mut record)?;
        index.extend_from_slice(&record);
    }

    // 4. Write the archive file.
    let mut writer = BufWriter::new(File::create(output_path)?);
    writer.write_all(SIGNATURE)?;
    for item in &items {
        let position = writer.stream_position()?;
        if position != u64::from(item.offset) {
            error!(
                "Mismatch writing body for {:?}. Expected offset {}, current position {}",
                item.name, item.offset, position
            );
            writer.seek(SeekFrom::Start(u64::from(item.offset)))?;
        }
        writer.write_all(&item.body)?;
    }
    writer.write_all(routine.raw())?;
    writer.write_all(&index)?;
    writer.write_u32::<LittleEndian>(items.len() as u32)?;
    writer.flush()?;

    info!("Total files packed: {}", items.len());
    info!("=== Pack finished ===");
    Ok(())
}

fn pack_body(
    routine: &CipherRoutine,
    entry: &MetaEntry,
    data: Vec<u8>,
    store: bool,
) -> Result<PackItem, ArcError> {
    let mut frame = entry.lzss_frame_size;
    let mut init = entry.lzss_init_pos;
    let mut unpacked_size = entry.unpacked_size;

    let body = match entry.sub_type {
        SUB_TYPE_SCRIPT => {
            let mut header = [0u8; SCRIPT_HEADER_SIZE];
            unpacked_size = data.len() as u32;
            let payload = if frame == 0 || store {
                frame = 0;
                init = 0;
                LittleEndian::write_u32(&mut header[4..8], data.len() as u32);
                data
            } else {
                let codec = LzssCodec::new(frame, init)?;
                let compressed = codec.compress(&data)?;
                LittleEndian::write_u32(&mut header[0..4], compressed.len() as u32);
                LittleEndian::write_u32(&mut header[4..8], data.len() as u32);
                LittleEndian::write_u32(&mut header[8..12], 1);
                compressed
            };
            routine.encrypt(&mut header)?;
            let mut body = header.to_vec();
            body.extend_from_slice(&payload);
            body
        }
        SUB_TYPE_PREFIXED if data.len() > 4 => {
            let mut body = data;
            let (prefix, _) = body.split_at_mut(4);
            routine.encrypt(prefix)?;
            body
        }
        SUB_TYPE_IMAGE => {
            if data.len() < IMAGE_HEADER_SIZE {
                return Err(ArcError::BadPayload {
                    name: entry.name.clone(),
                    expected: IMAGE_HEADER_SIZE,
                    actual: data.len(),
                });
            }
            data
        }
        _ => data,
    };

    // The image packed_size field excludes the 32-byte header.
    let packed_size = if entry.sub_type == SUB_TYPE_IMAGE {
        (body.len() - IMAGE_HEADER_SIZE) as u32
    } else {
        body.len() as u32
    };

    Ok(PackItem {
        name: entry.name.clone(),
        sub_type: entry.sub_type,
        magic: entry.magic,
        lzss_frame_size: frame,
        lzss_init_pos: init,
        unpacked_size,
        body,
        packed_size,
        offset: 0,
    })
}

fn serialize_record(item: &PackItem) -> Result<[u8; INDEX_RECORD_SIZE], ArcError> {
    let mut record = [0u8; INDEX_RECORD_SIZE];
    let name = encode_name(&item.name)?;
    record[..name.len()].copy_from_slice(&name);

    LittleEndian::write_u16(&mut record[0x40..0x42], item.lzss_frame_size);
    let raw_init_pos = if item.lzss_frame_size != 0 {
        let frame = u32::from(item.lzss_frame_size);
        ((frame - u32::from(item.lzss_init_pos) % frame) % frame) as u16
    } else {
        0
    };
    LittleEndian::write_u16(&mut record[0x42..0x44], raw_init_pos);
    LittleEndian::write_u16(&mut record[0x44..0x46], item.magic);
    LittleEndian::write_u32(&mut record[0x48..0x4C], item.sub_type);
    LittleEndian::write_u32(&mut record[0x4C..0x50], item.packed_size);
    LittleEndian::write_u32(&mut record[0x50..0x54], item.unpacked_size);
    LittleEndian::write_u32(&mut record[0x54..0x58], item.offset);
    Ok(record)
}

fn warn_unlisted_files(input_dir: &Path, metadata: &ArchiveMeta) {
    let listed: HashSet<String> = metadata
        .entries
        .iter()
        .map(|e| e.name.replace('\\', "/"))
        .collect();
    for walked in WalkDir::new(input_dir).into_iter().filter_map(|e| e.ok()) {
        let path = walked.path();
        if !path.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(input_dir) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative == "metadata.json" {
            continue;
        }
        if !listed.contains(&relative) {
            warn!("Input file not referenced by the sidecar: {relative}");
        }
    }
}
