// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test utilities for building synthetic GPT disk images
//!
//! Layout produced by [`GptImageBuilder::build`]: protective MBR at LBA 0,
//! header at LBA 1, partition array from LBA 2, then optional zero padding.

use crate::gpt::{DEFAULT_SECTOR_SIZE, GPT_HEADER_LEN, GPT_REVISION_1_0, GPT_SIGNATURE};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};
use uuid::Uuid;

/// Linux filesystem data partition type
pub const LINUX_FS_TYPE: Uuid = Uuid::from_u128(0x0FC6_3DAF_8483_4772_8E79_3D69_D847_7DE4);

/// Disk GUID stamped into every built header
pub const DISK_GUID: Uuid = Uuid::from_u128(0xD15C);

const ENTRY_FIELDS_LEN: usize = 128;
const NAME_UNITS: usize = 36;

/// Unique GUID given to the partition in array slot `slot_idx` (0-based).
pub fn slot_guid(slot_idx: usize) -> Uuid {
    Uuid::from_u128(0x1000 + slot_idx as u128)
}

#[derive(Clone, Debug)]
struct Slot {
    name: String,
    type_guid: Uuid,
    first_lba: u64,
    last_lba: u64,
}

#[derive(Clone, Debug)]
pub struct GptImageBuilder {
    sector_size: u64,
    signature: [u8; 8],
    revision: [u8; 4],
    header_size: u32,
    entry_size: u32,
    entry_count: Option<u32>,
    slots: Vec<Option<Slot>>,
    total_len: Option<usize>,
}

impl Default for GptImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GptImageBuilder {
    pub fn new() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION_1_0,
            header_size: 92,
            entry_size: ENTRY_FIELDS_LEN as u32,
            entry_count: None,
            slots: Vec::new(),
            total_len: None,
        }
    }

    pub fn sector_size(mut self, sector_size: u64) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn signature(mut self, signature: [u8; 8]) -> Self {
        self.signature = signature;
        self
    }

    pub fn revision(mut self, revision: [u8; 4]) -> Self {
        self.revision = revision;
        self
    }

    pub fn header_size(mut self, header_size: u32) -> Self {
        self.header_size = header_size;
        self
    }

    pub fn entry_size(mut self, entry_size: u32) -> Self {
        self.entry_size = entry_size;
        self
    }

    /// Number of slots advertised in the header (defaults to the slots added)
    pub fn entry_count(mut self, count: u32) -> Self {
        self.entry_count = Some(count);
        self
    }

    /// Zero-pad the image up to `len` bytes.
    pub fn total_len(mut self, len: usize) -> Self {
        self.total_len = Some(len);
        self
    }

    pub fn partition(mut self, name: &str, first_lba: u64, last_lba: u64) -> Self {
        self.slots.push(Some(Slot {
            name: name.to_string(),
            type_guid: LINUX_FS_TYPE,
            first_lba,
            last_lba,
        }));
        self
    }

    pub fn unused_slot(mut self) -> Self {
        self.slots.push(None);
        self
    }

    pub fn build(&self) -> io::Result<Vec<u8>> {
        let mut image = Vec::new();
        self.write_to(&mut image)?;
        Ok(image)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let sector = self.sector_size as usize;
        let entry_size = self.entry_size as usize;
        let count = self.entry_count.unwrap_or(self.slots.len() as u32);

        // Protective MBR: only the boot signature is set.
        w.write_all(&[0u8; 510])?;
        w.write_all(&[0x55, 0xAA])?;
        write_zeros(w, sector.saturating_sub(512))?;

        self.write_header(w, count)?;
        write_zeros(w, sector.saturating_sub(GPT_HEADER_LEN))?;

        for slot_idx in 0..count as usize {
            let mut record = Vec::with_capacity(ENTRY_FIELDS_LEN);
            if let Some(Some(slot)) = self.slots.get(slot_idx) {
                write_record(&mut record, slot, slot_idx)?;
            } else {
                record.resize(ENTRY_FIELDS_LEN, 0);
            }
            record.resize(entry_size, 0);
            w.write_all(&record)?;
        }

        let written = 2 * sector + count as usize * entry_size;
        if let Some(total) = self.total_len {
            write_zeros(w, total.saturating_sub(written))?;
        }
        Ok(())
    }

    fn write_header<W: Write>(&self, w: &mut W, count: u32) -> io::Result<()> {
        w.write_all(&self.signature)?;
        w.write_all(&self.revision)?;
        w.write_u32::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(0)?; // header crc32
        w.write_u32::<LittleEndian>(0)?; // reserved
        w.write_u64::<LittleEndian>(1)?; // current lba
        w.write_u64::<LittleEndian>(0)?; // backup lba
        w.write_u64::<LittleEndian>(34)?; // first usable lba
        w.write_u64::<LittleEndian>(0)?; // last usable lba
        w.write_all(&DISK_GUID.to_bytes_le())?;
        w.write_u64::<LittleEndian>(2)?; // partition array lba
        w.write_u32::<LittleEndian>(count)?;
        w.write_u32::<LittleEndian>(self.entry_size)?;
        w.write_u32::<LittleEndian>(0) // array crc32
    }
}

fn write_record<W: Write>(w: &mut W, slot: &Slot, slot_idx: usize) -> io::Result<()> {
    w.write_all(&slot.type_guid.to_bytes_le())?;
    w.write_all(&slot_guid(slot_idx).to_bytes_le())?;
    w.write_u64::<LittleEndian>(slot.first_lba)?;
    w.write_u64::<LittleEndian>(slot.last_lba)?;
    w.write_u64::<LittleEndian>(0)?; // attribute flags
    let mut name = [0u16; NAME_UNITS];
    for (unit, encoded) in name.iter_mut().zip(slot.name.encode_utf16()) {
        *unit = encoded;
    }
    for unit in name {
        w.write_u16::<LittleEndian>(unit)?;
    }
    Ok(())
}

fn write_zeros<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    io::copy(&mut io::repeat(0).take(len as u64), w).map(|_| ())
}
