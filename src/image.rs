use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::{cipher::CipherRoutine, error::ArcError, lzss::LzssCodec};

// Image payload layout (sub_type 4): a 32-byte encrypted header, an
// optional BGRA palette, then the pixel block (LZSS-compressed when the
// entry carries a frame size). The entry's packed_size field counts the
// bytes after the header.
pub const IMAGE_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub bpp: u8,
    pub width: u16,
    pub height: u16,
    pub colors: u16,
    pub stride: i32,
    pub offset_x: i32,
    pub offset_y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale (bpp 7), stored top-down already.
    Gray8,
    /// 8-bit palette indices.
    Indexed8,
    Bgr24,
    Bgra32,
}

#[derive(Debug, Clone)]
pub struct EmeImage {
    pub header: ImageHeader,
    pub format: PixelFormat,
    pub palette: Option<Vec<[u8; 4]>>,
    /// Row 0 is the top row; row size is |stride| bytes.
    pub pixels: Vec<u8>,
}

/// Decode a full on-disk image record (header included). The caller
/// passes the owning entry's LZSS parameters.
pub fn decode_image(
    record: &[u8],
    routine: &CipherRoutine,
    lzss_frame_size: u16,
    lzss_init_pos: u16,
) -> Result<EmeImage, ArcError> {
    if record.len() < IMAGE_HEADER_SIZE {
        return Err(ArcError::ShortFile {
            needed: IMAGE_HEADER_SIZE as u64,
            available: record.len() as u64,
        });
    }
    let mut raw = record[..IMAGE_HEADER_SIZE].to_vec();
    routine.decrypt(&mut raw)?;

    let header = ImageHeader {
        bpp: (LittleEndian::read_u16(&raw[0..2]) & 0xFF) as u8,
        width: LittleEndian::read_u16(&raw[2..4]),
        height: LittleEndian::read_u16(&raw[4..6]),
        colors: LittleEndian::read_u16(&raw[6..8]),
        stride: LittleEndian::read_i32(&raw[8..12]),
        offset_x: LittleEndian::read_i32(&raw[12..16]),
        offset_y: LittleEndian::read_i32(&raw[16..20]),
    };
    debug!("image header: {header:?}");

    let format = match header.bpp {
        7 => PixelFormat::Gray8,
        8 => PixelFormat::Indexed8,
        24 => PixelFormat::Bgr24,
        32 => PixelFormat::Bgra32,
        other => {
            return Err(ArcError::UnsupportedImage(format!("bpp {other}")));
        }
    };

    let body = &record[IMAGE_HEADER_SIZE..];
    let mut data_offset = 0usize;
    let palette = if header.colors != 0 && body.first() != Some(&0x07) {
        let count = usize::from(header.colors).max(3);
        let palette_len = count * 4;
        if body.len() < palette_len {
            return Err(ArcError::ShortFile {
                needed: (IMAGE_HEADER_SIZE + palette_len) as u64,
                available: record.len() as u64,
            });
        }
        data_offset = palette_len;
        Some(
            body[..palette_len]
                .chunks_exact(4)
                .map(|q| [q[0], q[1], q[2], q[3]])
                .collect(),
        )
    } else {
        None
    };

    if format == PixelFormat::Indexed8 && palette.is_none() {
        return Err(ArcError::UnsupportedImage(
            "indexed image without palette".into(),
        ));
    }

    let row_size = header.stride.unsigned_abs() as usize;
    let pixel_len = row_size * usize::from(header.height);
    let mut pixels = if lzss_frame_size != 0 {
        let codec = LzssCodec::new(lzss_frame_size, lzss_init_pos)?;
        let mut decoded = codec.decompress(&body[data_offset..], pixel_len);
        decoded.resize(pixel_len, 0);
        decoded
    } else {
        let mut copied = vec![0u8; pixel_len];
        let avail = (body.len() - data_offset).min(pixel_len);
        copied[..avail].copy_from_slice(&body[data_offset..data_offset + avail]);
        copied
    };

    // The engine stores non-grayscale pixels bottom-up; present row 0 on top.
    if format != PixelFormat::Gray8 && row_size > 0 {
        flip_rows(&mut pixels, row_size);
    }

    Ok(EmeImage {
        header,
        format,
        palette,
        pixels,
    })
}

fn flip_rows(pixels: &mut [u8], row_size: usize) {
    let rows = pixels.len() / row_size;
    for i in 0..rows / 2 {
        let (a, b) = pixels.split_at_mut((rows - 1 - i) * row_size);
        a[i * row_size..i * row_size + row_size].swap_with_slice(&mut b[..row_size]);
    }
}
