use std::fmt;

use crate::error::{Result, TigStoreError};

/// Dense identifier assigned on insertion. Never reused, never changes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TigId(pub u32);

impl fmt::Display for TigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TigId {
    fn from(value: u32) -> Self {
        TigId(value)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TigClass {
    #[default]
    Unset = 0,
    Unassembled = 1,
    Contig = 2,
}

impl TigClass {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unset),
            1 => Some(Self::Unassembled),
            2 => Some(Self::Contig),
            _ => None,
        }
    }

    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One read contributing to a tig: orientation, interval within the tig, and
/// the alignment hangs against the layout.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TigChild {
    pub read_id: u32,
    pub reverse: bool,
    pub bgn: u32,
    pub end: u32,
    pub ahang: i32,
    pub bhang: i32,
}

/// An assembled contig: scalar header attributes plus the reads it is built
/// from. The header scalars are individually mutable through the store
/// without rewriting the payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tig {
    pub id: Option<TigId>,
    pub source_id: u32,
    pub source_bgn: u32,
    pub source_end: u32,
    pub class: TigClass,
    pub suggest_repeat: bool,
    pub suggest_circular: bool,
    pub children: Vec<TigChild>,
}

pub const TIG_HEADER_LEN: usize = 16;
pub const CHILD_ENTRY_LEN: usize = 24;
pub const CHILD_COUNT_LEN: usize = 4;

/// Decoded children counts above this are treated as corruption.
pub const MAX_CHILDREN: u32 = 1 << 28;

const HEADER_FLAG_REPEAT: u8 = 1 << 0;
const HEADER_FLAG_CIRCULAR: u8 = 1 << 1;
const CHILD_FLAG_REVERSE: u8 = 1 << 0;

impl Tig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact size of the codec output for this tig.
    pub fn encoded_len(&self) -> usize {
        TIG_HEADER_LEN + CHILD_COUNT_LEN + self.children.len() * CHILD_ENTRY_LEN
    }

    /// Serialize to the on-disk payload layout: the fixed header block, a
    /// 32-bit child count, then fixed-size child entries. Little-endian
    /// throughout; reserved flag bits and padding are written as zero.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        assert!(
            len <= u32::MAX as usize,
            "tig payload exceeds the 4-byte length prefix"
        );
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&self.source_id.to_le_bytes());
        buf.extend_from_slice(&self.source_bgn.to_le_bytes());
        buf.extend_from_slice(&self.source_end.to_le_bytes());
        buf.push(self.class.to_byte());
        let mut flags = 0u8;
        if self.suggest_repeat {
            flags |= HEADER_FLAG_REPEAT;
        }
        if self.suggest_circular {
            flags |= HEADER_FLAG_CIRCULAR;
        }
        buf.push(flags);
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&(self.children.len() as u32).to_le_bytes());
        for child in &self.children {
            buf.extend_from_slice(&child.read_id.to_le_bytes());
            buf.extend_from_slice(&child.bgn.to_le_bytes());
            buf.extend_from_slice(&child.end.to_le_bytes());
            buf.extend_from_slice(&child.ahang.to_le_bytes());
            buf.extend_from_slice(&child.bhang.to_le_bytes());
            buf.push(if child.reverse { CHILD_FLAG_REVERSE } else { 0 });
            buf.extend_from_slice(&[0; 3]);
        }
        assert_eq!(buf.len(), len, "codec output disagrees with encoded_len");
        buf
    }

    /// Parse one payload. `id` is not stored in the payload; it is carried
    /// for error attribution and installed on the returned tig.
    pub fn decode(id: TigId, data: &[u8]) -> Result<Tig> {
        let corrupt = |reason: &'static str| TigStoreError::CorruptPayload { id, reason };

        if data.len() < TIG_HEADER_LEN + CHILD_COUNT_LEN {
            return Err(corrupt("payload shorter than header"));
        }
        let source_id = u32_at(data, 0);
        let source_bgn = u32_at(data, 4);
        let source_end = u32_at(data, 8);
        let class = TigClass::from_byte(data[12]).ok_or_else(|| corrupt("unknown class tag"))?;
        let flags = data[13];
        if flags & !(HEADER_FLAG_REPEAT | HEADER_FLAG_CIRCULAR) != 0 {
            return Err(corrupt("reserved header flag bits set"));
        }
        if data[14..16] != [0, 0] {
            return Err(corrupt("header padding not zero"));
        }
        let count = u32_at(data, TIG_HEADER_LEN);
        if count > MAX_CHILDREN {
            return Err(corrupt("children count exceeds sanity limit"));
        }
        let body = TIG_HEADER_LEN + CHILD_COUNT_LEN;
        let expected = body + count as usize * CHILD_ENTRY_LEN;
        if data.len() < expected {
            return Err(corrupt("payload truncated within children"));
        }
        if data.len() > expected {
            return Err(corrupt("payload has trailing bytes"));
        }
        let mut children = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = body + i * CHILD_ENTRY_LEN;
            let child_flags = data[at + 20];
            if child_flags & !CHILD_FLAG_REVERSE != 0 {
                return Err(corrupt("reserved child flag bits set"));
            }
            if data[at + 21..at + 24] != [0, 0, 0] {
                return Err(corrupt("child padding not zero"));
            }
            children.push(TigChild {
                read_id: u32_at(data, at),
                bgn: u32_at(data, at + 4),
                end: u32_at(data, at + 8),
                ahang: u32_at(data, at + 12) as i32,
                bhang: u32_at(data, at + 16) as i32,
                reverse: child_flags & CHILD_FLAG_REVERSE != 0,
            });
        }
        Ok(Tig {
            id: Some(id),
            source_id,
            source_bgn,
            source_end,
            class,
            suggest_repeat: flags & HEADER_FLAG_REPEAT != 0,
            suggest_circular: flags & HEADER_FLAG_CIRCULAR != 0,
            children,
        })
    }
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("slice is 4 bytes"))
}
