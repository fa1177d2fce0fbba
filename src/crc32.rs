//! CRC-32 (RFC 1952 polynomial) with a combination operator.
//!
//! Chunks are decoded out of order, so the stream checksum cannot be a
//! single running CRC. Each chunk reports `(crc, len)` and the owner merges
//! them with `combine`, which multiplies by x^(8·len) in GF(2)[x] via
//! matrix exponentiation. O(log len) per merge, no re-reading of data.

use std::io::{self, Write};

const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 {
                CRC32_POLYNOMIAL ^ (c >> 1)
            } else {
                c >> 1
            };
            bit += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// Extend `crc` over `data`. `crc` is the finalized (post-inversion) form,
/// as stored in gzip footers; passing 0 starts a fresh checksum.
pub fn update(crc: u32, data: &[u8]) -> u32 {
    let mut state = !crc;
    for &byte in data {
        state = (state >> 8) ^ CRC32_TABLE[((state ^ byte as u32) & 0xFF) as usize];
    }
    !state
}

pub fn checksum(data: &[u8]) -> u32 {
    update(0, data)
}

fn gf2_matrix_times(matrix: &[u32; 32], mut vector: u32) -> u32 {
    let mut sum = 0;
    let mut row = 0;
    while vector != 0 {
        if vector & 1 != 0 {
            sum ^= matrix[row];
        }
        vector >>= 1;
        row += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], matrix: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(matrix, matrix[n]);
    }
}

/// CRC of the concatenation A ++ B given `crc(A)`, `crc(B)` and `len(B)`.
pub fn combine(crc_a: u32, crc_b: u32, mut len_b: u64) -> u32 {
    if len_b == 0 {
        return crc_a;
    }

    // Operator matrix for one zero bit, then repeatedly squared.
    let mut odd = [0u32; 32];
    odd[0] = CRC32_POLYNOMIAL;
    let mut row = 1u32;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }
    let mut even = [0u32; 32];
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    // Apply x^(8·len_b) by the binary expansion of len_b in byte units.
    let mut crc = crc_a;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len_b & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len_b >>= 1;
        if len_b == 0 {
            break;
        }
        gf2_matrix_square(&mut odd, &even);
        if len_b & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len_b >>= 1;
        if len_b == 0 {
            break;
        }
    }

    crc ^ crc_b
}

/// Incremental CRC accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32 {
    crc: u32,
    length: u64,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.crc = update(self.crc, data);
        self.length += data.len() as u64;
    }

    pub fn finalize(&self) -> u32 {
        self.crc
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

/// Writer adapter that checksums everything passing through it. The index
/// codec uses this to append a CRC over all preceding bytes of the file.
pub struct Crc32Writer<W: Write> {
    inner: W,
    crc: Crc32,
}

impl<W: Write> Crc32Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc.finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for Crc32Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.crc.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter mirroring `Crc32Writer` for index import.
pub struct Crc32Reader<R: io::Read> {
    inner: R,
    crc: Crc32,
}

impl<R: io::Read> Crc32Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc.finalize()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: io::Read> io::Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.crc.update(&buf[..read]);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Standard check value for "123456789".
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut acc = Crc32::new();
        for piece in data.chunks(97) {
            acc.update(piece);
        }
        assert_eq!(acc.finalize(), checksum(&data));
        assert_eq!(acc.length(), data.len() as u64);
    }

    #[test]
    fn combine_matches_concatenation() {
        let a: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let b: Vec<u8> = (0..7777u32).map(|i| (i * 13 % 256) as u8).collect();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let combined = combine(checksum(&a), checksum(&b), b.len() as u64);
        assert_eq!(combined, checksum(&joined));
    }

    #[test]
    fn combine_with_empty_side() {
        let a = checksum(b"left");
        assert_eq!(combine(a, 0, 0), a);
        assert_eq!(combine(0, a, 4), update(0, b"left"));
    }

    #[test]
    fn writer_tracks_crc() {
        let mut writer = Crc32Writer::new(Vec::new());
        writer.write_all(b"1234").unwrap();
        writer.write_all(b"56789").unwrap();
        assert_eq!(writer.crc(), 0xCBF4_3926);
        assert_eq!(writer.into_inner(), b"123456789");
    }
}
