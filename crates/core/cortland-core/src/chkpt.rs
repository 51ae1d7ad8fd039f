//! Checkpoint stream primitives.
//!
//! A checkpoint is an append-only byte stream: 7 bytes of ASCII magic
//! `"GSCHKPT"`, one ASCII version digit, then one length-prefixed blob per
//! machine component in a fixed order. Scalars are stored host-endian, so
//! checkpoints are not portable between hosts of different endianness.
//!
//! Version `'2'` applies zero-run RLE over the RAM blob (see [`rle`]);
//! version `'3'` is reserved for a future extension and is recognized by
//! [`probe`] but rejected by the loader.
//!
//! The reader carries a sticky error flag: once any read runs off the end
//! of a component, all further reads return zero and the caller observes
//! the failure at the end of the restore pass, mirroring how the loader
//! discards a half-restored machine.

use std::fmt;

/// The 7-byte checkpoint magic.
pub const MAGIC: &[u8; 7] = b"GSCHKPT";

/// Version digit for the RLE-compressed format.
pub const VERSION_RLE: u8 = b'2';

/// Version digit reserved for a future extension.
pub const VERSION_RESERVED: u8 = b'3';

/// Size of the magic + version header.
pub const HEADER_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by checkpoint encoding and decoding.
#[derive(Debug)]
pub enum ChkptError {
    /// The stream does not begin with the checkpoint magic.
    BadMagic,
    /// The version digit is not one this build can load.
    UnsupportedVersion(u8),
    /// The stream ended inside a header or component.
    Truncated,
    /// A component blob failed to deserialize.
    Corrupt(&'static str),
    /// Reading or writing the backing file failed.
    Io(std::io::Error),
}

impl fmt::Display for ChkptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => f.write_str("not a checkpoint file"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported checkpoint version {:?}", *v as char),
            Self::Truncated => f.write_str("checkpoint stream truncated"),
            Self::Corrupt(what) => write!(f, "corrupt checkpoint component: {what}"),
            Self::Io(e) => write!(f, "checkpoint I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChkptError {}

impl From<std::io::Error> for ChkptError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Serializes a checkpoint stream into memory.
///
/// Components are written with [`CheckpointWriter::component`], which
/// handles the 4-byte length prefix. Scalar putters use host endianness.
pub struct CheckpointWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl CheckpointWriter {
    /// Creates a writer with the magic and version header already emitted.
    #[must_use]
    pub fn new(version: u8) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(MAGIC);
        buf.push(version);
        Self { buf, open: Vec::new() }
    }

    /// Writes one length-prefixed component blob via `f`.
    pub fn component(&mut self, f: impl FnOnce(&mut Self)) {
        let at = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        self.open.push(at);
        f(self);
        let at = self.open.pop().expect("component stack underflow");
        let len = (self.buf.len() - at - 4) as u32;
        self.buf[at..at + 4].copy_from_slice(&len.to_ne_bytes());
    }

    /// Appends a byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a host-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Appends a host-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Appends a host-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Appends a `[len:4][bytes]` string.
    pub fn put_str(&mut self, v: &str) {
        self.put_u32(v.len() as u32);
        self.put_bytes(v.as_bytes());
    }

    /// Consumes the writer and returns the finished stream.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        debug_assert!(self.open.is_empty(), "unclosed checkpoint component");
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Deserializes a checkpoint stream with a sticky error flag.
pub struct CheckpointReader {
    data: Vec<u8>,
    pos: usize,
    /// End bound of the currently open component (stream end otherwise).
    bound: usize,
    bounds: Vec<usize>,
    version: u8,
    failed: bool,
}

impl CheckpointReader {
    /// Validates the header and wraps `data` in a reader.
    pub fn new(data: Vec<u8>) -> Result<Self, ChkptError> {
        if data.len() < HEADER_LEN {
            return Err(ChkptError::Truncated);
        }
        if &data[..7] != MAGIC {
            return Err(ChkptError::BadMagic);
        }
        let version = data[7];
        if version != VERSION_RLE {
            return Err(ChkptError::UnsupportedVersion(version));
        }
        let bound = data.len();
        Ok(Self { data, pos: HEADER_LEN, bound, bounds: Vec::new(), version, failed: false })
    }

    /// The stream's version digit.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// True once any read ran past a component boundary.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Opens the next length-prefixed component; reads inside it cannot run
    /// past its end.
    pub fn enter_component(&mut self) {
        let len = self.get_u32() as usize;
        if self.pos + len > self.bound {
            self.failed = true;
            self.bounds.push(self.bound);
            return;
        }
        self.bounds.push(self.bound);
        self.bound = self.pos + len;
    }

    /// Closes the current component, skipping any unread remainder.
    pub fn exit_component(&mut self) {
        self.pos = self.bound;
        self.bound = self.bounds.pop().unwrap_or(self.data.len());
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.failed || self.pos + n > self.bound {
            self.failed = true;
            return None;
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    /// Reads a byte (0 once the reader has failed).
    pub fn get_u8(&mut self) -> u8 {
        self.take(1).map_or(0, |s| s[0])
    }

    /// Reads a host-endian u16.
    pub fn get_u16(&mut self) -> u16 {
        self.take(2).map_or(0, |s| u16::from_ne_bytes([s[0], s[1]]))
    }

    /// Reads a host-endian u32.
    pub fn get_u32(&mut self) -> u32 {
        self.take(4).map_or(0, |s| u32::from_ne_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// Reads a host-endian u64.
    pub fn get_u64(&mut self) -> u64 {
        self.take(8)
            .map_or(0, |s| u64::from_ne_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
    }

    /// Reads `n` raw bytes (empty once failed).
    pub fn get_bytes(&mut self, n: usize) -> Vec<u8> {
        self.take(n).map_or_else(Vec::new, <[u8]>::to_vec)
    }

    /// Reads a `[len:4][bytes]` string; lossy on invalid UTF-8.
    pub fn get_str(&mut self) -> String {
        let len = self.get_u32() as usize;
        let bytes = self.get_bytes(len);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Bytes remaining in the current component.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bound - self.pos
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Returns true iff `data` begins with a recognized magic/version and every
/// component length prefix fits within the stream.
#[must_use]
pub fn probe(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN || &data[..7] != MAGIC {
        return false;
    }
    if data[7] != VERSION_RLE && data[7] != VERSION_RESERVED {
        return false;
    }
    let mut pos = HEADER_LEN;
    while pos < data.len() {
        if pos + 4 > data.len() {
            return false;
        }
        let len = u32::from_ne_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + len > data.len() {
            return false;
        }
        pos += len;
    }
    true
}

// ---------------------------------------------------------------------------
// Zero-run RLE
// ---------------------------------------------------------------------------

/// Zero-run RLE used for the RAM blob in version-2 checkpoints.
///
/// The encoded form is a sequence of `[literal_len:4][literal bytes]
/// [zero_run:4]` records. Early-boot RAM is almost entirely zero, so a
/// 4 MiB image collapses to a few kilobytes.
pub mod rle {
    use super::ChkptError;

    /// Encodes `data`, collapsing runs of zero bytes.
    #[must_use]
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            // Literal run: up to the next stretch of >= 8 zeros.
            let lit_start = pos;
            let mut zeros_at = data.len();
            let mut i = pos;
            while i < data.len() {
                if data[i] == 0 {
                    let z = data[i..].iter().take_while(|&&b| b == 0).count();
                    if z >= 8 || i + z == data.len() {
                        zeros_at = i;
                        break;
                    }
                    i += z;
                } else {
                    i += 1;
                }
            }
            let lit = &data[lit_start..zeros_at];
            out.extend_from_slice(&(lit.len() as u32).to_ne_bytes());
            out.extend_from_slice(lit);
            pos = zeros_at;
            let zero_run = data[pos..].iter().take_while(|&&b| b == 0).count();
            out.extend_from_slice(&(zero_run as u32).to_ne_bytes());
            pos += zero_run;
        }
        out
    }

    /// Decodes into exactly `expected_len` bytes.
    pub fn decode(src: &[u8], expected_len: usize) -> Result<Vec<u8>, ChkptError> {
        let mut out = Vec::with_capacity(expected_len);
        let mut pos = 0;
        let word = |pos: usize| -> Result<u32, ChkptError> {
            if pos + 4 > src.len() {
                return Err(ChkptError::Truncated);
            }
            Ok(u32::from_ne_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]))
        };
        while pos < src.len() {
            let lit_len = word(pos)? as usize;
            pos += 4;
            if pos + lit_len > src.len() {
                return Err(ChkptError::Truncated);
            }
            out.extend_from_slice(&src[pos..pos + lit_len]);
            pos += lit_len;
            let zero_run = word(pos)? as usize;
            pos += 4;
            out.resize(out.len() + zero_run, 0);
        }
        if out.len() != expected_len {
            return Err(ChkptError::Corrupt("RLE length mismatch"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes() {
        let w = CheckpointWriter::new(VERSION_RLE);
        let data = w.finish();
        assert_eq!(&data[..8], b"GSCHKPT2");
    }

    #[test]
    fn component_length_prefix() {
        let mut w = CheckpointWriter::new(VERSION_RLE);
        w.component(|w| {
            w.put_u32(0xDEAD_BEEF);
            w.put_u8(7);
        });
        let data = w.finish();
        let mut r = CheckpointReader::new(data).unwrap();
        r.enter_component();
        assert_eq!(r.get_u32(), 0xDEAD_BEEF);
        assert_eq!(r.get_u8(), 7);
        assert_eq!(r.remaining(), 0);
        r.exit_component();
        assert!(!r.failed());
    }

    #[test]
    fn reader_error_is_sticky() {
        let mut w = CheckpointWriter::new(VERSION_RLE);
        w.component(|w| w.put_u16(0x1234));
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        r.enter_component();
        assert_eq!(r.get_u16(), 0x1234);
        // Runs past the component end.
        assert_eq!(r.get_u32(), 0);
        assert!(r.failed());
        assert_eq!(r.get_u8(), 0);
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut data = CheckpointWriter::new(VERSION_RESERVED).finish();
        data.extend_from_slice(&0u32.to_ne_bytes());
        assert!(matches!(
            CheckpointReader::new(data),
            Err(ChkptError::UnsupportedVersion(b'3'))
        ));
    }

    #[test]
    fn probe_accepts_consistent_stream() {
        let mut w = CheckpointWriter::new(VERSION_RLE);
        w.component(|w| w.put_u64(1));
        w.component(|w| w.put_bytes(&[1, 2, 3]));
        assert!(probe(&w.finish()));
    }

    #[test]
    fn probe_rejects_oversized_component() {
        let mut data = CheckpointWriter::new(VERSION_RLE).finish();
        data.extend_from_slice(&100u32.to_ne_bytes());
        data.extend_from_slice(&[0; 10]);
        assert!(!probe(&data));
    }

    #[test]
    fn rle_round_trip_sparse() {
        let mut data = vec![0u8; 65536];
        data[100] = 0xAA;
        data[40000] = 0x55;
        let enc = rle::encode(&data);
        assert!(enc.len() < 100);
        assert_eq!(rle::decode(&enc, data.len()).unwrap(), data);
    }

    #[test]
    fn rle_round_trip_dense() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251 + 1) as u8).collect();
        let enc = rle::encode(&data);
        assert_eq!(rle::decode(&enc, data.len()).unwrap(), data);
    }

    #[test]
    fn rle_short_zero_runs_stay_literal() {
        let data = [1, 0, 0, 2, 0, 3];
        let enc = rle::encode(&data);
        assert_eq!(rle::decode(&enc, data.len()).unwrap(), data.to_vec());
    }
}
