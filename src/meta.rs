use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    EmeEntry,
    cipher::{CipherRoutine, ROUTINE_SIZE},
    error::ArcError,
};

// Sidecar document written next to extracted entries and consumed by the
// packer. The key is the archive's 40-byte cipher routine in hex; entries
// are listed in archive order with lzss_init_pos in the in-memory
// convention (the on-disk transform is applied only inside the index).

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub key: String,
    pub entries: Vec<MetaEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEntry {
    pub name: String,
    #[serde(default)]
    pub offset: u32,
    #[serde(default, alias = "size")]
    pub packed_size: u32,
    pub unpacked_size: u32,
    pub lzss_frame_size: u16,
    pub lzss_init_pos: u16,
    pub sub_type: u32,
    #[serde(default)]
    pub magic: u16,
    #[serde(default)]
    pub is_packed: bool,
}

impl ArchiveMeta {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArcError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArcError::NotFound(path.to_path_buf()));
        }
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArcError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn routine(&self) -> Result<CipherRoutine, ArcError> {
        let bytes = decode_hex(&self.key)?;
        if bytes.len() != ROUTINE_SIZE {
            return Err(ArcError::BadKey(format!(
                "expected {ROUTINE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        CipherRoutine::from_bytes(&bytes)
    }
}

impl MetaEntry {
    pub fn from_entry(entry: &EmeEntry) -> Self {
        Self {
            name: entry.name.clone(),
            offset: entry.offset,
            packed_size: entry.packed_size,
            unpacked_size: entry.unpacked_size,
            lzss_frame_size: entry.lzss_frame_size,
            lzss_init_pos: entry.lzss_init_pos,
            sub_type: entry.sub_type,
            magic: entry.magic,
            is_packed: entry.is_packed(),
        }
    }
}

pub fn encode_hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>, ArcError> {
    let s = s.trim();
    if !s.is_ascii() {
        return Err(ArcError::BadKey("non-ASCII key".into()));
    }
    if s.len() % 2 != 0 {
        return Err(ArcError::BadKey(format!("odd hex length {}", s.len())));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| ArcError::BadKey(format!("invalid hex at offset {i}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_and_case() {
        let bytes: Vec<u8> = (0u16..40).map(|i| (i * 6 + 1) as u8).collect();
        let hex = encode_hex_upper(&bytes);
        assert!(hex.chars().all(|c| !c.is_ascii_lowercase()));
        assert_eq!(decode_hex(&hex).unwrap(), bytes);
        assert_eq!(decode_hex(&hex.to_lowercase()).unwrap(), bytes);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(matches!(decode_hex("abc"), Err(ArcError::BadKey(_))));
        assert!(matches!(decode_hex("zz"), Err(ArcError::BadKey(_))));
    }

    #[test]
    fn size_alias_is_accepted() {
        let doc = r#"{
  "key": "00",
  "entries": [
    {
      "name": "a.bin",
      "size": 5,
      "unpacked_size": 5,
      "lzss_frame_size": 0,
      "lzss_init_pos": 0,
      "sub_type": 0
    }
  ]
}"#;
        let meta: ArchiveMeta = serde_json::from_str(doc).unwrap();
        assert_eq!(meta.entries[0].packed_size, 5);
        assert_eq!(meta.entries[0].magic, 0);
        assert!(!meta.entries[0].is_packed);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let meta = ArchiveMeta {
            key: "0011".into(),
            entries: vec![],
        };
        assert!(matches!(meta.routine(), Err(ArcError::BadKey(_))));
    }
}
