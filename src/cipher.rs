use byteorder::{ByteOrder, LittleEndian};

use crate::error::ArcError;

// --- Cipher routine layout ---
// 40 bytes total, owned by the archive and stored in it verbatim:
//   - bytes 0..8:  opcode vector, one of {1, 2, 4, 8} per step (else no-op)
//   - bytes 8..40: eight u32 keys (Little Endian), key[i] at 8 + 4*i
// Decryption runs steps 7 down to 0, encryption 0 up to 7, each step
// undoing/applying one primitive transform over the buffer.

pub const ROUTINE_SIZE: usize = 40;
const STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherRoutine {
    raw: [u8; ROUTINE_SIZE],
}

impl CipherRoutine {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArcError> {
        let raw: [u8; ROUTINE_SIZE] = bytes
            .try_into()
            .map_err(|_| ArcError::CorruptRoutine(format!("need 40 bytes, got {}", bytes.len())))?;
        Ok(Self { raw })
    }

    /// The verbatim 40 bytes, for writing back into an archive.
    pub fn raw(&self) -> &[u8; ROUTINE_SIZE] {
        &self.raw
    }

    fn op(&self, step: usize) -> u8 {
        self.raw[step]
    }

    fn key(&self, step: usize) -> u32 {
        LittleEndian::read_u32(&self.raw[8 + step * 4..12 + step * 4])
    }

    /// Reject routines whose permutation steps cannot be undone for a
    /// buffer of `len` bytes. Op 4 needs an odd key (a bit permutation of
    /// a 32-bit word), op 8 a key coprime with the buffer length.
    pub fn check_invertible(&self, len: usize) -> Result<(), ArcError> {
        for step in 0..STEPS {
            match self.op(step) {
                4 if len >= 4 && self.key(step) % 2 == 0 => {
                    return Err(ArcError::CorruptRoutine(format!(
                        "step {step}: bit permutation key {:#010x} is not invertible",
                        self.key(step)
                    )));
                }
                8 if len > 0 && gcd(u64::from(self.key(step)), len as u64) != 1 => {
                    return Err(ArcError::CorruptRoutine(format!(
                        "step {step}: byte permutation key {:#010x} does not permute {len} bytes",
                        self.key(step)
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run the routine over `data` in place. Ops 1/2/4 touch whole 4-byte
    /// words only; a trailing partial word passes through. Op 8 permutes
    /// the full range.
    pub fn transform(&self, data: &mut [u8], direction: Direction) -> Result<(), ArcError> {
        self.check_invertible(data.len())?;
        match direction {
            Direction::Decrypt => {
                for step in (0..STEPS).rev() {
                    self.run_step(data, step, direction);
                }
            }
            Direction::Encrypt => {
                for step in 0..STEPS {
                    self.run_step(data, step, direction);
                }
            }
        }
        Ok(())
    }

    pub fn decrypt(&self, data: &mut [u8]) -> Result<(), ArcError> {
        self.transform(data, Direction::Decrypt)
    }

    pub fn encrypt(&self, data: &mut [u8]) -> Result<(), ArcError> {
        self.transform(data, Direction::Encrypt)
    }

    fn run_step(&self, data: &mut [u8], step: usize, direction: Direction) {
        let key = self.key(step);
        match (self.op(step), direction) {
            (1, _) => xor_words(data, key),
            (2, Direction::Decrypt) => chained_xor_decrypt(data, key),
            (2, Direction::Encrypt) => chained_xor_encrypt(data, key),
            (4, Direction::Decrypt) => map_words(data, |w| bit_scatter(w, key)),
            (4, Direction::Encrypt) => map_words(data, |w| bit_gather(w, key)),
            (8, Direction::Decrypt) => byte_scatter(data, key),
            (8, Direction::Encrypt) => byte_gather(data, key),
            _ => {}
        }
    }
}

fn map_words(data: &mut [u8], f: impl Fn(u32) -> u32) {
    for chunk in data.chunks_exact_mut(4) {
        let w = LittleEndian::read_u32(chunk);
        LittleEndian::write_u32(chunk, f(w));
    }
}

// Op 1: plain XOR, self-inverse.
fn xor_words(data: &mut [u8], key: u32) {
    map_words(data, |w| w ^ key);
}

// Op 2: stream-like feedback. Decryption chains on the pre-XOR word,
// encryption on the post-XOR word, so the two are exact inverses.
fn chained_xor_decrypt(data: &mut [u8], key: u32) {
    let mut prev = key;
    for chunk in data.chunks_exact_mut(4) {
        let w = LittleEndian::read_u32(chunk);
        LittleEndian::write_u32(chunk, w ^ prev);
        prev = w;
    }
}

fn chained_xor_encrypt(data: &mut [u8], key: u32) {
    let mut prev = key;
    for chunk in data.chunks_exact_mut(4) {
        let w = LittleEndian::read_u32(chunk);
        let enc = w ^ prev;
        LittleEndian::write_u32(chunk, enc);
        prev = enc;
    }
}

// Op 4: bit permutation of one word. Position sequence
// P[i] = ((i+1)*key) mod 32; decryption moves source bit i to P[i],
// encryption reads bit P[i] back into position i.
fn bit_scatter(val: u32, key: u32) -> u32 {
    let mut shift = 0u32;
    let mut result = 0u32;
    for i in 0..32 {
        shift = (shift + key) % 32;
        result |= ((val >> i) & 1) << shift;
    }
    result
}

fn bit_gather(val: u32, key: u32) -> u32 {
    let mut shift = 0u32;
    let mut result = 0u32;
    for i in 0..32 {
        shift = (shift + key) % 32;
        result |= ((val >> shift) & 1) << i;
    }
    result
}

// Op 8: byte permutation of the whole range via X[i] = ((i+1)*key) mod len.
// Decryption writes out[X[i]] = in[i], encryption gathers out[i] = in[X[i]].
fn byte_scatter(data: &mut [u8], key: u32) {
    let len = data.len();
    if len == 0 {
        return;
    }
    let mut table = vec![0u8; len];
    let mut x = 0usize;
    for &b in data.iter() {
        x = ((x as u64 + u64::from(key)) % len as u64) as usize;
        table[x] = b;
    }
    data.copy_from_slice(&table);
}

fn byte_gather(data: &mut [u8], key: u32) {
    let len = data.len();
    if len == 0 {
        return;
    }
    let mut table = vec![0u8; len];
    let mut x = 0usize;
    for slot in table.iter_mut() {
        x = ((x as u64 + u64::from(key)) % len as u64) as usize;
        *slot = data[x];
    }
    data.copy_from_slice(&table);
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
