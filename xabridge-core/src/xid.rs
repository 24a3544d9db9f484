//! Transaction identifiers and their wire codec.
//!
//! A [`GlobalXid`] identifies one distributed transaction; a [`BranchXid`]
//! identifies one resource manager's branch of it. Both carry fixed-width,
//! zero-padded buffers so that equality and hashing work on content alone.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! format_id: i32 | gtrid_len: i32 | gtrid bytes | bqual_len: i32 | bqual bytes
//! ```
//!
//! The gtrid packs `tm-name-len (1) | tm-name | unique (8)`, zero-padded to
//! 64 bytes. The bqual packs `rm-name-len (1) | rm-name | type tag`, zero-
//! padded so the branch sequence number always sits in the final byte.
//!
//! Records whose format id differs from [`FORMAT_ID`] decode fine; they are
//! classified foreign and the name accessors return `None` for them.

use std::fmt;

use crate::error::{Result, TxError};

/// Format id stamped on every xid this coordinator creates (ASCII `XBT0`).
pub const FORMAT_ID: i32 = 0x5842_5430;

/// Maximum size of a global transaction identifier, in bytes.
pub const MAX_GTRID_SIZE: usize = 64;

/// Maximum size of a branch qualifier, in bytes.
pub const MAX_BQUAL_SIZE: usize = 64;

/// Maximum byte length of a transaction-manager name: the gtrid minus the
/// length byte and the 8-byte unique value.
pub const MAX_TM_NAME_LEN: usize = MAX_GTRID_SIZE - 9;

/// Maximum byte length of a resource-manager name: the bqual minus the
/// length byte and the sequence byte.
pub const MAX_RM_NAME_LEN: usize = MAX_BQUAL_SIZE - 2;

// ============================================================================
// GlobalXid
// ============================================================================

/// A global transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalXid {
    format_id: i32,
    gtrid_len: u8,
    gtrid: [u8; MAX_GTRID_SIZE],
}

impl GlobalXid {
    /// Creates a global xid for a transaction manager named `tm_name` with
    /// the given unique value.
    pub fn new(tm_name: &str, unique: u64) -> Result<Self> {
        let name = tm_name.as_bytes();
        if name.len() > MAX_TM_NAME_LEN {
            return Err(TxError::NameTooLong(format!(
                "tm name '{}' is {} bytes, max {}",
                tm_name,
                name.len(),
                MAX_TM_NAME_LEN
            )));
        }
        let mut gtrid = [0u8; MAX_GTRID_SIZE];
        gtrid[0] = name.len() as u8;
        gtrid[1..1 + name.len()].copy_from_slice(name);
        gtrid[1 + name.len()..9 + name.len()].copy_from_slice(&unique.to_le_bytes());
        Ok(GlobalXid {
            format_id: FORMAT_ID,
            gtrid_len: MAX_GTRID_SIZE as u8,
            gtrid,
        })
    }

    /// The format id stamped on this xid.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Whether this xid was created by a different transaction-manager
    /// implementation. Foreign xids are valid values; callers skip them.
    pub fn is_foreign(&self) -> bool {
        self.format_id != FORMAT_ID
    }

    /// The transaction-manager name embedded in the gtrid, if this xid is
    /// ours and the name is valid UTF-8.
    pub fn tm_name(&self) -> Option<&str> {
        if self.is_foreign() {
            return None;
        }
        let n = self.gtrid[0] as usize;
        if 9 + n > self.gtrid_len as usize {
            return None;
        }
        std::str::from_utf8(&self.gtrid[1..1 + n]).ok()
    }

    /// The unique value embedded in the gtrid, if this xid is ours.
    pub fn unique(&self) -> Option<u64> {
        if self.is_foreign() {
            return None;
        }
        let n = self.gtrid[0] as usize;
        if 9 + n > self.gtrid_len as usize {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.gtrid[1 + n..9 + n]);
        Some(u64::from_le_bytes(buf))
    }

    /// The raw gtrid bytes.
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid[..self.gtrid_len as usize]
    }

    /// Serializes the global portion: `format_id | gtrid_len | gtrid`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.gtrid_len as usize);
        buf.extend_from_slice(&self.format_id.to_le_bytes());
        buf.extend_from_slice(&(self.gtrid_len as i32).to_le_bytes());
        buf.extend_from_slice(self.gtrid());
        buf
    }

    /// Deserializes a global xid, rejecting trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (xid, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(TxError::Codec(format!(
                "trailing bytes after global xid: {} of {} consumed",
                consumed,
                data.len()
            )));
        }
        Ok(xid)
    }

    /// Parses the global portion at the front of `data`, returning the xid
    /// and the number of bytes consumed.
    pub(crate) fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let format_id = read_i32(data, 0)?;
        let gtrid_len = read_i32(data, 4)?;
        if gtrid_len < 0 || gtrid_len as usize > MAX_GTRID_SIZE {
            return Err(TxError::Codec(format!(
                "gtrid length {} out of range",
                gtrid_len
            )));
        }
        let gtrid_len = gtrid_len as usize;
        if data.len() < 8 + gtrid_len {
            return Err(TxError::Codec(format!(
                "truncated gtrid: need {} bytes, have {}",
                8 + gtrid_len,
                data.len()
            )));
        }
        let mut gtrid = [0u8; MAX_GTRID_SIZE];
        gtrid[..gtrid_len].copy_from_slice(&data[8..8 + gtrid_len]);
        Ok((
            GlobalXid {
                format_id,
                gtrid_len: gtrid_len as u8,
                gtrid,
            },
            8 + gtrid_len,
        ))
    }
}

impl fmt::Display for GlobalXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tm_name(), self.unique()) {
            (Some(tm), Some(unique)) => write!(f, "{}:{:016x}", tm, unique),
            _ => {
                write!(f, "foreign[{:08x}:", self.format_id)?;
                for b in self.gtrid() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Debug for GlobalXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ============================================================================
// BranchXid
// ============================================================================

/// A branch identifier: the owning global xid plus a branch qualifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchXid {
    global: GlobalXid,
    bqual_len: u8,
    bqual: [u8; MAX_BQUAL_SIZE],
}

impl BranchXid {
    /// Creates a branch xid under `global` for the resource manager named
    /// `rm_name`, with branch sequence number `seq`. The resource type tag
    /// is embedded for diagnostics and truncated to the space remaining.
    pub fn new(global: &GlobalXid, rm_name: &str, type_tag: &str, seq: u8) -> Result<Self> {
        let name = rm_name.as_bytes();
        if name.len() > MAX_RM_NAME_LEN {
            return Err(TxError::NameTooLong(format!(
                "rm name '{}' is {} bytes, max {}",
                rm_name,
                name.len(),
                MAX_RM_NAME_LEN
            )));
        }
        let mut bqual = [0u8; MAX_BQUAL_SIZE];
        bqual[0] = name.len() as u8;
        bqual[1..1 + name.len()].copy_from_slice(name);
        // Sequence byte is fixed at the end; the type tag takes whatever
        // room is left between name and sequence.
        let room = MAX_BQUAL_SIZE - 2 - name.len();
        let tag = type_tag.as_bytes();
        let tag_len = tag.len().min(room);
        bqual[1 + name.len()..1 + name.len() + tag_len].copy_from_slice(&tag[..tag_len]);
        bqual[MAX_BQUAL_SIZE - 1] = seq;
        Ok(BranchXid {
            global: *global,
            bqual_len: MAX_BQUAL_SIZE as u8,
            bqual,
        })
    }

    /// The owning global xid.
    pub fn global(&self) -> &GlobalXid {
        &self.global
    }

    /// Whether the owning global xid is foreign.
    pub fn is_foreign(&self) -> bool {
        self.global.is_foreign()
    }

    /// The resource-manager name embedded in the qualifier, if this xid is
    /// ours and the name is valid UTF-8.
    pub fn rm_name(&self) -> Option<&str> {
        if self.is_foreign() {
            return None;
        }
        let n = self.bqual[0] as usize;
        if 2 + n > self.bqual_len as usize {
            return None;
        }
        std::str::from_utf8(&self.bqual[1..1 + n]).ok()
    }

    /// The branch sequence number, if this xid is ours.
    pub fn sequence(&self) -> Option<u8> {
        if self.is_foreign() || self.bqual_len as usize != MAX_BQUAL_SIZE {
            return None;
        }
        Some(self.bqual[MAX_BQUAL_SIZE - 1])
    }

    /// The raw branch-qualifier bytes.
    pub fn bqual(&self) -> &[u8] {
        &self.bqual[..self.bqual_len as usize]
    }

    /// Serializes the full record:
    /// `format_id | gtrid_len | gtrid | bqual_len | bqual`. The global
    /// portion is copied verbatim from the owning xid.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.global.encode();
        buf.extend_from_slice(&(self.bqual_len as i32).to_le_bytes());
        buf.extend_from_slice(self.bqual());
        buf
    }

    /// Deserializes a full branch record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (global, consumed) = GlobalXid::decode_prefix(data)?;
        let bqual_len = read_i32(data, consumed)?;
        if bqual_len < 0 || bqual_len as usize > MAX_BQUAL_SIZE {
            return Err(TxError::Codec(format!(
                "bqual length {} out of range",
                bqual_len
            )));
        }
        let bqual_len = bqual_len as usize;
        let start = consumed + 4;
        if data.len() < start + bqual_len {
            return Err(TxError::Codec(format!(
                "truncated bqual: need {} bytes, have {}",
                start + bqual_len,
                data.len()
            )));
        }
        if data.len() > start + bqual_len {
            return Err(TxError::Codec(format!(
                "trailing bytes after branch xid: {} of {} consumed",
                start + bqual_len,
                data.len()
            )));
        }
        let mut bqual = [0u8; MAX_BQUAL_SIZE];
        bqual[..bqual_len].copy_from_slice(&data[start..start + bqual_len]);
        Ok(BranchXid {
            global,
            bqual_len: bqual_len as u8,
            bqual,
        })
    }
}

impl fmt::Display for BranchXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.rm_name(), self.sequence()) {
            (Some(rm), Some(seq)) => write!(f, "{},{}#{}", self.global, rm, seq),
            _ => {
                write!(f, "{},bqual[", self.global)?;
                for b in self.bqual() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Debug for BranchXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    if data.len() < offset + 4 {
        return Err(TxError::Codec(format!(
            "truncated record: need {} bytes, have {}",
            offset + 4,
            data.len()
        )));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    Ok(i32::from_le_bytes(buf))
}
