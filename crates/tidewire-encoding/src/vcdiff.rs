//! A decoder for VCDIFF deltas (RFC 3284).
//!
//! The service sends delta-compressed messages as VCDIFF diffs against the
//! previous payload on the channel. Only decoding is needed on the client.
//!
//! Supported: the default code table, `VCD_SOURCE` and `VCD_TARGET` windows,
//! application headers (skipped), and the `VCD_ADLER32` window checksum
//! (four big-endian bytes after the section lengths). Secondary compressors
//! and custom code tables are rejected.

use std::sync::LazyLock;

const MAGIC: [u8; 4] = [0xD6, 0xC3, 0xC4, 0x00];

const HDR_DECOMPRESS: u8 = 0x01;
const HDR_CODETABLE: u8 = 0x02;
const HDR_APPHEADER: u8 = 0x04;

const WIN_SOURCE: u8 = 0x01;
const WIN_TARGET: u8 = 0x02;
const WIN_ADLER32: u8 = 0x04;

/// Largest target window accepted from a delta.
pub const MAX_WINDOW_LEN: usize = 16 * 1024 * 1024;

const NEAR_SIZE: usize = 4;
const SAME_SIZE: usize = 3;

/// Errors raised while applying a VCDIFF delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcdiffError {
    /// The delta does not start with the VCDIFF magic bytes.
    #[error("not a vcdiff delta")]
    BadMagic,

    /// The delta uses a secondary compressor.
    #[error("secondary compression is not supported")]
    UnsupportedCompression,

    /// The delta declares its own code table.
    #[error("custom code tables are not supported")]
    UnsupportedCodeTable,

    /// A window sets both `VCD_SOURCE` and `VCD_TARGET`.
    #[error("window sets both source and target segment flags")]
    InvalidWindowIndicator,

    /// The delta ended in the middle of a structure.
    #[error("delta truncated while reading {0}")]
    Truncated(&'static str),

    /// A variable-length integer does not fit in 64 bits.
    #[error("integer overflow in delta")]
    IntegerOverflow,

    /// A segment, copy or section reaches outside its bounds.
    #[error("{0} out of bounds")]
    OutOfBounds(&'static str),

    /// The decoded window length differs from the declared one.
    #[error("window decoded to {actual} bytes, header declared {expected}")]
    LengthMismatch {
        /// Declared target window length.
        expected: usize,
        /// Bytes actually produced.
        actual: usize,
    },

    /// The Adler-32 of a window does not match its recorded checksum.
    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Recorded checksum.
        expected: u32,
        /// Checksum of the decoded window.
        actual: u32,
    },
}

// ---------------------------------------------------------------------------
// Code table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Noop,
    Add,
    Run,
    Copy,
}

#[derive(Debug, Clone, Copy)]
struct Inst {
    kind: Kind,
    size: u8,
    mode: u8,
}

impl Inst {
    const NOOP: Self = Self { kind: Kind::Noop, size: 0, mode: 0 };

    const fn new(kind: Kind, size: u8, mode: u8) -> Self {
        Self { kind, size, mode }
    }
}

/// The 256-entry default code table of RFC 3284 section 5.6.
static CODE_TABLE: LazyLock<[(Inst, Inst); 256]> = LazyLock::new(build_default_table);

fn build_default_table() -> [(Inst, Inst); 256] {
    let mut table = [(Inst::NOOP, Inst::NOOP); 256];
    let mut index = 0;
    let mut push = |first: Inst, second: Inst| {
        table[index] = (first, second);
        index += 1;
    };

    push(Inst::new(Kind::Run, 0, 0), Inst::NOOP);
    for size in 0..=17 {
        push(Inst::new(Kind::Add, size, 0), Inst::NOOP);
    }
    for mode in 0..=8 {
        push(Inst::new(Kind::Copy, 0, mode), Inst::NOOP);
        for size in 4..=18 {
            push(Inst::new(Kind::Copy, size, mode), Inst::NOOP);
        }
    }
    for mode in 0..=5 {
        for add in 1..=4 {
            for copy in 4..=6 {
                push(Inst::new(Kind::Add, add, 0), Inst::new(Kind::Copy, copy, mode));
            }
        }
    }
    for mode in 6..=8 {
        for add in 1..=4 {
            push(Inst::new(Kind::Add, add, 0), Inst::new(Kind::Copy, 4, mode));
        }
    }
    for mode in 0..=8 {
        push(Inst::new(Kind::Copy, 4, mode), Inst::new(Kind::Add, 1, 0));
    }

    table
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self, what: &'static str) -> Result<u8, VcdiffError> {
        let b = *self.buf.get(self.pos).ok_or(VcdiffError::Truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], VcdiffError> {
        let end = self.pos.checked_add(len).ok_or(VcdiffError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(VcdiffError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    /// Base-128 big-endian integer, high bit set on every byte but the last.
    fn varint(&mut self, what: &'static str) -> Result<u64, VcdiffError> {
        let mut value: u64 = 0;
        loop {
            let b = self.byte(what)?;
            if value > (u64::MAX >> 7) {
                return Err(VcdiffError::IntegerOverflow);
            }
            value = (value << 7) | u64::from(b & 0x7F);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    fn size(&mut self, what: &'static str) -> Result<usize, VcdiffError> {
        usize::try_from(self.varint(what)?).map_err(|_| VcdiffError::IntegerOverflow)
    }
}

// ---------------------------------------------------------------------------
// Address cache
// ---------------------------------------------------------------------------

struct AddressCache {
    near: [usize; NEAR_SIZE],
    next_slot: usize,
    same: Vec<usize>,
}

impl AddressCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_SIZE],
            next_slot: 0,
            same: vec![0; SAME_SIZE * 256],
        }
    }

    fn decode(
        &mut self,
        mode: u8,
        here: usize,
        addrs: &mut Reader<'_>,
    ) -> Result<usize, VcdiffError> {
        let mode = usize::from(mode);
        let addr = match mode {
            0 => addrs.size("address")?,
            1 => here
                .checked_sub(addrs.size("address")?)
                .ok_or(VcdiffError::OutOfBounds("copy address"))?,
            m if m < 2 + NEAR_SIZE => self.near[m - 2]
                .checked_add(addrs.size("address")?)
                .ok_or(VcdiffError::IntegerOverflow)?,
            m => {
                let b = usize::from(addrs.byte("address")?);
                self.same[(m - 2 - NEAR_SIZE) * 256 + b]
            }
        };
        if addr >= here {
            return Err(VcdiffError::OutOfBounds("copy address"));
        }
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % NEAR_SIZE;
        self.same[addr % (SAME_SIZE * 256)] = addr;
        Ok(addr)
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Applies `delta` to `source` and returns the reconstructed target.
///
/// # Errors
/// Returns a [`VcdiffError`] if the delta is malformed, uses an unsupported
/// feature, references bytes outside the source or target, or fails its
/// checksum.
pub fn decode(source: &[u8], delta: &[u8]) -> Result<Vec<u8>, VcdiffError> {
    let mut r = Reader::new(delta);
    if r.bytes(4, "header").map_err(|_| VcdiffError::BadMagic)? != MAGIC {
        return Err(VcdiffError::BadMagic);
    }
    let indicator = r.byte("header indicator")?;
    if indicator & HDR_DECOMPRESS != 0 {
        return Err(VcdiffError::UnsupportedCompression);
    }
    if indicator & HDR_CODETABLE != 0 {
        return Err(VcdiffError::UnsupportedCodeTable);
    }
    if indicator & HDR_APPHEADER != 0 {
        let len = r.size("application header")?;
        r.bytes(len, "application header")?;
    }

    let mut target = Vec::new();
    while !r.is_empty() {
        decode_window(&mut r, source, &mut target)?;
    }
    Ok(target)
}

fn decode_window(
    r: &mut Reader<'_>,
    source: &[u8],
    target: &mut Vec<u8>,
) -> Result<(), VcdiffError> {
    let win_indicator = r.byte("window indicator")?;
    if win_indicator & WIN_SOURCE != 0 && win_indicator & WIN_TARGET != 0 {
        return Err(VcdiffError::InvalidWindowIndicator);
    }

    let segment: Vec<u8> = if win_indicator & (WIN_SOURCE | WIN_TARGET) != 0 {
        let len = r.size("segment length")?;
        let pos = r.size("segment position")?;
        let end = pos.checked_add(len).ok_or(VcdiffError::IntegerOverflow)?;
        let from = if win_indicator & WIN_SOURCE != 0 { source } else { target.as_slice() };
        from.get(pos..end)
            .ok_or(VcdiffError::OutOfBounds("segment"))?
            .to_vec()
    } else {
        Vec::new()
    };

    let encoding_len = r.size("delta encoding length")?;
    let mut enc = Reader::new(r.bytes(encoding_len, "delta encoding")?);

    let window_len = enc.size("target window length")?;
    if window_len > MAX_WINDOW_LEN {
        return Err(VcdiffError::OutOfBounds("target window"));
    }
    if enc.byte("delta indicator")? != 0 {
        return Err(VcdiffError::UnsupportedCompression);
    }
    let data_len = enc.size("data section length")?;
    let inst_len = enc.size("instruction section length")?;
    let addr_len = enc.size("address section length")?;
    let checksum = if win_indicator & WIN_ADLER32 != 0 {
        let b = enc.bytes(4, "checksum")?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    } else {
        None
    };

    let mut data = Reader::new(enc.bytes(data_len, "data section")?);
    let mut insts = Reader::new(enc.bytes(inst_len, "instruction section")?);
    let mut addrs = Reader::new(enc.bytes(addr_len, "address section")?);

    let mut window: Vec<u8> = Vec::with_capacity(window_len);
    let mut cache = AddressCache::new();

    while !insts.is_empty() {
        let (first, second) = CODE_TABLE[usize::from(insts.byte("instruction")?)];
        for inst in [first, second] {
            if inst.kind == Kind::Noop {
                continue;
            }
            let size = match inst.size {
                0 => insts.size("instruction size")?,
                s => usize::from(s),
            };
            if window.len().checked_add(size).is_none_or(|end| end > window_len) {
                return Err(VcdiffError::OutOfBounds("target window"));
            }
            match inst.kind {
                Kind::Add => window.extend_from_slice(data.bytes(size, "add data")?),
                Kind::Run => {
                    let b = data.byte("run data")?;
                    window.resize(window.len() + size, b);
                }
                Kind::Copy => {
                    let here = segment.len() + window.len();
                    let addr = cache.decode(inst.mode, here, &mut addrs)?;
                    // Copies may overlap the bytes they produce.
                    for i in 0..size {
                        let at = addr + i;
                        let b = if at < segment.len() {
                            segment[at]
                        } else {
                            window[at - segment.len()]
                        };
                        window.push(b);
                    }
                }
                Kind::Noop => {}
            }
        }
    }

    if window.len() != window_len {
        return Err(VcdiffError::LengthMismatch {
            expected: window_len,
            actual: window.len(),
        });
    }
    if let Some(expected) = checksum {
        let actual = adler32(&window);
        if actual != expected {
            return Err(VcdiffError::ChecksumMismatch { expected, actual });
        }
    }

    target.extend_from_slice(&window);
    Ok(())
}

/// Adler-32 as defined by RFC 1950.
pub fn adler32(bytes: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let (mut a, mut b) = (1u32, 0u32);
    // 5552 is the largest run that cannot overflow before the modulo.
    for chunk in bytes.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
