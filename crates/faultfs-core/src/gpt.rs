// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! GUID Partition Table decoding
//!
//! The decoder only ever sees bytes a filesystem client was handed, so it
//! works on any `Read + Seek` stream that starts at the device's byte 0.
//! The header CRCs are read but never verified.

use crate::error::{GptError, GptResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use tracing::trace;
use uuid::Uuid;

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Revision 1.0, as stored on disk
pub const GPT_REVISION_1_0: [u8; 4] = [0x00, 0x00, 0x01, 0x00];

/// Fixed portion of the header consumed by the decoder
pub const GPT_HEADER_LEN: usize = 92;

/// Fields of a partition entry actually decoded
pub const GPT_ENTRY_LEN: usize = 128;

/// UTF-16 code units in the partition name field
const NAME_UNITS: usize = 36;

/// Decoded GPT header (LBA 1)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: [u8; 4],
    pub header_size: u32,
    pub crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub partition_entries_start_lba: u64,
    pub num_partition_entries: u32,
    pub partition_entry_size: u32,
    pub partition_array_crc32: u32,
}

impl GptHeader {
    /// Decode and validate the fixed 92-byte header from `r`, leaving any
    /// vendor tail unread.
    pub fn read_from<R: Read>(r: &mut R) -> GptResult<Self> {
        let mut signature = [0u8; 8];
        r.read_exact(&mut signature)?;
        if signature != GPT_SIGNATURE {
            return Err(GptError::BadSignature(signature));
        }
        let mut revision = [0u8; 4];
        r.read_exact(&mut revision)?;
        if revision != GPT_REVISION_1_0 {
            return Err(GptError::BadRevision(revision));
        }
        let header_size = r.read_u32::<LittleEndian>()?;
        if (header_size as usize) < GPT_HEADER_LEN {
            return Err(GptError::BadHeaderSize(header_size));
        }
        let crc32 = r.read_u32::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;

        Ok(Self {
            signature,
            revision,
            header_size,
            crc32,
            current_lba: r.read_u64::<LittleEndian>()?,
            backup_lba: r.read_u64::<LittleEndian>()?,
            first_usable_lba: r.read_u64::<LittleEndian>()?,
            last_usable_lba: r.read_u64::<LittleEndian>()?,
            disk_guid: read_guid(r)?,
            partition_entries_start_lba: r.read_u64::<LittleEndian>()?,
            num_partition_entries: r.read_u32::<LittleEndian>()?,
            partition_entry_size: r.read_u32::<LittleEndian>()?,
            partition_array_crc32: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// One used slot of the partition array.
///
/// The byte range is half-open: `[first_byte, last_byte)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 1-based slot position in the partition array
    pub index: u32,
    pub name: String,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub flags: u64,
    pub first_byte: u64,
    pub last_byte: u64,
}

impl PartitionEntry {
    /// Decode one record; `None` for an unused (all-zero type GUID) slot
    /// or a record too small to hold the entry fields.
    pub fn parse(raw: &[u8], index: u32, sector_size: u64) -> GptResult<Option<Self>> {
        if raw.len() < GPT_ENTRY_LEN {
            return Ok(None);
        }
        let mut r = Cursor::new(raw);
        let type_guid = read_guid(&mut r)?;
        if type_guid.is_nil() {
            return Ok(None);
        }
        let unique_guid = read_guid(&mut r)?;
        let first_lba = r.read_u64::<LittleEndian>()?;
        let last_lba = r.read_u64::<LittleEndian>()?;
        let flags = r.read_u64::<LittleEndian>()?;
        let mut name = [0u16; NAME_UNITS];
        r.read_u16_into::<LittleEndian>(&mut name)?;

        Ok(Some(Self {
            index,
            name: decode_name(&name),
            type_guid,
            unique_guid,
            first_lba,
            last_lba,
            flags,
            first_byte: first_lba.saturating_mul(sector_size),
            last_byte: last_lba.saturating_mul(sector_size),
        }))
    }

    pub fn contains_byte(&self, byte: u64) -> bool {
        self.first_byte <= byte && byte < self.last_byte
    }

    /// Whether `[start, end)` lies entirely inside the partition.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        self.first_byte <= start && end <= self.last_byte
    }
}

/// Lazy, single-pass iterator over the used slots of a partition array.
///
/// Ends quietly when the stream runs out before a full record.
pub struct PartitionEntries<R> {
    reader: R,
    sector_size: u64,
    entry_size: usize,
    next_index: u32,
    count: u32,
    done: bool,
}

impl<R: Read> Iterator for PartitionEntries<R> {
    type Item = GptResult<PartitionEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.next_index <= self.count {
            let index = self.next_index;
            self.next_index += 1;

            let mut record = Vec::with_capacity(self.entry_size);
            if let Err(err) = (&mut self.reader).take(self.entry_size as u64).read_to_end(&mut record) {
                self.done = true;
                return Some(Err(err.into()));
            }
            if record.len() < self.entry_size {
                trace!(
                    target: "faultfs::gpt",
                    index,
                    available = record.len(),
                    "partition array truncated"
                );
                self.done = true;
                break;
            }
            match PartitionEntry::parse(&record, index, self.sector_size) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Decode the GPT header and return a lazy iterator over the partition array.
///
/// The stream must start at the device's first byte; the protective MBR
/// (one sector) is skipped.
pub fn decode<R: Read + Seek>(
    mut stream: R,
    sector_size: u64,
) -> GptResult<(GptHeader, PartitionEntries<R>)> {
    stream.seek(SeekFrom::Start(sector_size))?;

    let mut raw = Vec::with_capacity(GPT_HEADER_LEN);
    (&mut stream).take(GPT_HEADER_LEN as u64).read_to_end(&mut raw)?;
    if raw.len() < GPT_HEADER_LEN {
        return Err(GptError::ShortHeader {
            got: raw.len(),
            want: GPT_HEADER_LEN,
        });
    }
    let header = GptHeader::read_from(&mut Cursor::new(raw))?;

    let entry_size = header.partition_entry_size as usize;
    let array_start = header.partition_entries_start_lba.checked_mul(sector_size);
    // An array we cannot address or whose records cannot hold an entry reads
    // as an empty (truncated) array.
    let done = match array_start {
        Some(start) => {
            stream.seek(SeekFrom::Start(start))?;
            entry_size < GPT_ENTRY_LEN
        }
        None => true,
    };

    let entries = PartitionEntries {
        reader: stream,
        sector_size,
        entry_size,
        next_index: 1,
        count: header.num_partition_entries,
        done,
    };
    Ok((header, entries))
}

/// Mixed-endian GUID as laid out on disk
fn read_guid<R: Read>(r: &mut R) -> io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes_le(bytes))
}

/// Name cut at the first NUL unit
fn decode_name(units: &[u16]) -> String {
    let end = units.iter().position(|&unit| unit == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}
