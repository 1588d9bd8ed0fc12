//! Structural check of Yrs v1 update payloads.
//!
//! The Yrs decoder trusts that string bytes are UTF-8 and recurses through
//! nested values without a limit, so bytes from clients or from disk are
//! walked here before they reach it. The walk follows the v1 block layout
//! exactly as `Update::decode_v1` reads it; anything it cannot account for
//! is rejected.
//!
//! ```text
//! update  = clients:var (blocks:var client:var clock:var block*)* delete_set
//! block   = info:u8 [origin] [right_origin] [parent [parent_sub]] content
//! ```
//!
//! The trailing delete set holds only integers and is left to Yrs.

use crate::error::MalformedUpdate;

/// Deepest nesting of arrays and maps accepted inside `Any` content.
pub const MAX_DEPTH: usize = 64;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_XML_ELEMENT: u8 = 3;

/// Check that `bytes` is a v1 update the Yrs decoder can read safely.
pub fn check_update_v1(bytes: &[u8]) -> Result<(), MalformedUpdate> {
    let mut reader = Reader::new(bytes);
    // blocks, client and clock: at least three bytes per client
    let clients = reader.count_u32(3)?;
    for _ in 0..clients {
        let blocks = reader.count_u32(1)?;
        reader.var_u32()?;
        reader.var_u32()?;
        for _ in 0..blocks {
            reader.block()?;
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, depth: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, MalformedUpdate> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(MalformedUpdate::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MalformedUpdate> {
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(MalformedUpdate::Truncated(start))?;
        self.pos = end;
        Ok(&self.buf[start..end])
    }

    /// Unsigned varint with the same wrapping 7-bit accumulation Yrs uses.
    fn var_u32(&mut self) -> Result<u32, MalformedUpdate> {
        let start = self.pos;
        let mut num = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u32::wrapping_shl((byte & 0x7f) as u32, shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(MalformedUpdate::VarInt(start));
            }
        }
    }

    fn var_u64(&mut self) -> Result<u64, MalformedUpdate> {
        let start = self.pos;
        let mut num = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u64::wrapping_shl((byte & 0x7f) as u64, shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(MalformedUpdate::VarInt(start));
            }
        }
    }

    /// Signed varint: sign in bit 6 of the first byte. Past ten bytes the
    /// Yrs decoder shifts out of range, so longer encodings are refused.
    fn var_i64(&mut self) -> Result<i64, MalformedUpdate> {
        let start = self.pos;
        let first = self.u8()?;
        let negative = first & 0x40 != 0;
        let mut num = (first & 0x3f) as i64;
        let mut byte = first;
        let mut shift = 6u32;
        while byte >= 0x80 {
            if shift > 62 {
                return Err(MalformedUpdate::VarInt(start));
            }
            byte = self.u8()?;
            num |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
        }
        if negative {
            // Negating i64::MIN overflows in the decoder.
            return num.checked_neg().ok_or(MalformedUpdate::VarInt(start));
        }
        Ok(num)
    }

    /// A count whose items take at least `min_size` bytes each.
    fn count_u32(&mut self, min_size: usize) -> Result<u32, MalformedUpdate> {
        let offset = self.pos;
        let count = self.var_u32()?;
        self.fits(count as u64, min_size, offset)?;
        Ok(count)
    }

    fn count_u64(&mut self, min_size: usize) -> Result<u64, MalformedUpdate> {
        let offset = self.pos;
        let count = self.var_u64()?;
        self.fits(count, min_size, offset)?;
        Ok(count)
    }

    fn fits(&self, count: u64, min_size: usize, offset: usize) -> Result<(), MalformedUpdate> {
        let needed = count.saturating_mul(min_size as u64);
        if needed > self.remaining() as u64 {
            return Err(MalformedUpdate::Count { count, offset });
        }
        Ok(())
    }

    fn buf(&mut self) -> Result<&'a [u8], MalformedUpdate> {
        let len = self.var_u32()?;
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<&'a str, MalformedUpdate> {
        let len = self.var_u32()?;
        let start = self.pos;
        let bytes = self.take(len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| MalformedUpdate::Utf8(start))
    }

    fn id(&mut self) -> Result<(), MalformedUpdate> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    fn block(&mut self) -> Result<(), MalformedUpdate> {
        let offset = self.pos;
        let info = self.u8()?;
        if info == BLOCK_GC || info == BLOCK_SKIP {
            self.var_u32()?;
            return Ok(());
        }

        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            // Named root type or the id of the parent item.
            if self.var_u32()? == 1 {
                self.string()?;
            } else {
                self.id()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.string()?;
            }
        }
        self.content(info & 0b1111, offset)
    }

    fn content(&mut self, kind: u8, offset: usize) -> Result<(), MalformedUpdate> {
        match kind {
            CONTENT_DELETED => {
                self.var_u32()?;
            }
            CONTENT_JSON => {
                // The decoder reads one more string than the stored count.
                let count_offset = self.pos;
                let count = self.var_u32()?;
                if count > i32::MAX as u32 {
                    return Err(MalformedUpdate::Count {
                        count: count as u64,
                        offset: count_offset,
                    });
                }
                self.fits(count as u64 + 1, 1, count_offset)?;
                for _ in 0..=count {
                    self.string()?;
                }
            }
            CONTENT_BINARY => {
                self.buf()?;
            }
            CONTENT_STRING | CONTENT_EMBED => {
                self.string()?;
            }
            CONTENT_FORMAT => {
                self.string()?;
                self.string()?;
            }
            CONTENT_TYPE => {
                let type_offset = self.pos;
                match self.u8()? {
                    TYPE_XML_ELEMENT => {
                        self.string()?;
                    }
                    0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => {}
                    kind => {
                        return Err(MalformedUpdate::TypeRef {
                            kind,
                            offset: type_offset,
                        })
                    }
                }
            }
            CONTENT_ANY => {
                let count = self.count_u32(1)?;
                for _ in 0..count {
                    self.any()?;
                }
            }
            CONTENT_DOC => {
                self.string()?;
                self.any()?;
            }
            CONTENT_MOVE => {
                let flags_offset = self.pos;
                let flags = i32::try_from(self.var_i64()?)
                    .map_err(|_| MalformedUpdate::VarInt(flags_offset))?;
                self.var_u64()?;
                self.var_u32()?;
                if flags & 1 == 0 {
                    self.var_u64()?;
                    self.var_u32()?;
                }
            }
            kind => return Err(MalformedUpdate::Content { kind, offset }),
        }
        Ok(())
    }

    fn any(&mut self) -> Result<(), MalformedUpdate> {
        let offset = self.pos;
        match self.u8()? {
            // undefined, null, false, true
            127 | 126 | 121 | 120 => {}
            125 => {
                self.var_i64()?;
            }
            124 => {
                self.take(4)?;
            }
            123 | 122 => {
                self.take(8)?;
            }
            119 => {
                self.string()?;
            }
            118 => {
                self.descend()?;
                let entries = self.count_u64(2)?;
                for _ in 0..entries {
                    self.string()?;
                    self.any()?;
                }
                self.depth -= 1;
            }
            117 => {
                self.descend()?;
                let items = self.count_u64(1)?;
                for _ in 0..items {
                    self.any()?;
                }
                self.depth -= 1;
            }
            116 => {
                self.buf()?;
            }
            tag => return Err(MalformedUpdate::Value { tag, offset }),
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<(), MalformedUpdate> {
        if self.depth >= MAX_DEPTH {
            return Err(MalformedUpdate::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        Ok(())
    }
}
