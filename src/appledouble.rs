/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */

//! AppleDouble sidecar synthesis.
//!
//! A `._name` sidecar carries the Macintosh metadata and resource fork of
//! its sibling.  The header layout must be byte-exact: the same metadata
//! always produces the same bytes, and the whole prefix is computed before
//! any fork byte is read so the sidecar's total size is known up front.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::definitions::MAC_EPOCH_TO_Y2K;
use super::error::{Error, Result};

pub const MAGIC: [u8; 8] = [0x00, 0x05, 0x16, 0x07, 0x00, 0x02, 0x00, 0x00];

#[allow(dead_code)]
mod entry_ids {
    pub const DATA_FORK: u32 = 1;
    pub const RESOURCE_FORK: u32 = 2;
    pub const REAL_NAME: u32 = 3;
    pub const COMMENT: u32 = 4;
    pub const ICON_BW: u32 = 5;
    pub const ICON_COLOR: u32 = 6;
    pub const FILE_DATES_INFO: u32 = 8;
    pub const FINDER_INFO: u32 = 9;
    pub const MACINTOSH_FILE_INFO: u32 = 10;
    pub const PRODOS_FILE_INFO: u32 = 11;
    pub const MSDOS_FILE_INFO: u32 = 12;
    pub const SHORT_NAME: u32 = 13;
    pub const AFP_FILE_INFO: u32 = 14;
    pub const DIRECTORY_ID: u32 = 15;
}

/// Bit 0x80 of MACINTOSH_FILE_INFO.
const MFI_LOCKED: u32 = 0x80;

/// When the resource fork can only be produced sequentially, pad the header
/// out to here so the fork lands on a spinner-block-friendly boundary.
const PADDED_FORK_OFFSET: usize = 8192;

/// The metadata half of a sidecar.  Timestamps are Mac-epoch seconds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AppleDoubleMeta {
    /// FInfo+FXInfo for files, DInfo+DXInfo for directories.
    pub finder: [u8; 32],
    pub create_time: u32,
    pub mod_time: u32,
    pub backup_time: u32,
    pub access_time: u32,
    pub locked: bool,
    pub real_name: Option<Vec<u8>>,
    pub comment: Option<Vec<u8>>,
}

impl AppleDoubleMeta {
    pub fn with_finder(file_type: [u8; 4], creator: [u8; 4], flags: u16) -> AppleDoubleMeta {
        let mut meta = AppleDoubleMeta::default();
        meta.finder[0..4].copy_from_slice(&file_type);
        meta.finder[4..8].copy_from_slice(&creator);
        BigEndian::write_u16(&mut meta.finder[8..10], flags);
        meta
    }

    pub fn file_type(&self) -> [u8; 4] {
        self.finder[0..4].try_into().unwrap()
    }

    pub fn creator(&self) -> [u8; 4] {
        self.finder[4..8].try_into().unwrap()
    }

    pub fn finder_flags(&self) -> u16 {
        BigEndian::read_u16(&self.finder[8..10])
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Resource fork directly after the header.
    Compact,
    /// Resource fork at offset >= 8192.
    Padded,
}

/// AppleDouble dates are signed seconds relative to 2000-01-01T00:00:00Z.
fn mac_to_ad_date(mac: u32) -> i32 {
    let delta = i64::from(mac) - MAC_EPOCH_TO_Y2K as i64;
    delta.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn ad_to_mac_date(ad: i32) -> u32 {
    let mac = i64::from(ad) + MAC_EPOCH_TO_Y2K as i64;
    mac.clamp(0, i64::from(u32::MAX)) as u32
}

/// Produce the sidecar prefix: everything up to (and aligned for) the
/// resource fork, whose `rsrc_len` bytes the caller appends.  The prefix
/// length equals the fork's offset.
pub fn synthesize(meta: &AppleDoubleMeta, rsrc_len: u64, layout: Layout) -> Vec<u8> {
    struct Short {
        id: u32,
        data: Vec<u8>,
    }
    let mut shorts = Vec::new();

    if let Some(name) = &meta.real_name {
        shorts.push(Short { id: entry_ids::REAL_NAME, data: name.clone() });
    }
    if let Some(comment) = &meta.comment {
        shorts.push(Short { id: entry_ids::COMMENT, data: comment.clone() });
    }

    let mut dates = vec![0u8; 16];
    BigEndian::write_i32(&mut dates[0..4], mac_to_ad_date(meta.create_time));
    BigEndian::write_i32(&mut dates[4..8], mac_to_ad_date(meta.mod_time));
    BigEndian::write_i32(&mut dates[8..12], mac_to_ad_date(meta.backup_time));
    BigEndian::write_i32(&mut dates[12..16], mac_to_ad_date(meta.access_time));
    shorts.push(Short { id: entry_ids::FILE_DATES_INFO, data: dates });

    shorts.push(Short { id: entry_ids::FINDER_INFO, data: meta.finder.to_vec() });

    let mut mfi = vec![0u8; 4];
    BigEndian::write_u32(&mut mfi, if meta.locked { MFI_LOCKED } else { 0 });
    shorts.push(Short { id: entry_ids::MACINTOSH_FILE_INFO, data: mfi });

    let count = shorts.len() + usize::from(rsrc_len > 0);
    let table_end = 8 + 16 + 2 + 12 * count;
    let shorts_len: usize = shorts.iter().map(|s| s.data.len()).sum();
    let natural_fork_off = table_end + shorts_len;
    let fork_off = match layout {
        Layout::Compact => natural_fork_off,
        Layout::Padded => natural_fork_off.max(PADDED_FORK_OFFSET),
    };

    let mut out = Vec::with_capacity(fork_off);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&(count as u16).to_be_bytes());

    let mut data_off = table_end;
    for s in &shorts {
        out.extend_from_slice(&s.id.to_be_bytes());
        out.extend_from_slice(&(data_off as u32).to_be_bytes());
        out.extend_from_slice(&(s.data.len() as u32).to_be_bytes());
        data_off += s.data.len();
    }
    if rsrc_len > 0 {
        out.extend_from_slice(&entry_ids::RESOURCE_FORK.to_be_bytes());
        out.extend_from_slice(&(fork_off as u32).to_be_bytes());
        out.extend_from_slice(&(rsrc_len.min(u64::from(u32::MAX)) as u32).to_be_bytes());
    }
    for s in &shorts {
        out.extend_from_slice(&s.data);
    }
    out.resize(fork_off, 0);
    out
}

/// Re-read a sidecar header.  Returns the metadata plus the resource
/// fork's `(offset, length)` within the sidecar (0, 0 when absent).
pub fn parse(bytes: &[u8]) -> Result<(AppleDoubleMeta, u64, u64)> {
    if bytes.len() < 26 {
        return Err(Error::Truncated);
    }
    if bytes[0..8] != MAGIC {
        return Err(Error::BadMagic);
    }
    let count = usize::from(BigEndian::read_u16(&bytes[24..26]));
    let mut meta = AppleDoubleMeta::default();
    let mut rsrc = (0u64, 0u64);
    for i in 0..count {
        let at = 26 + 12 * i;
        let desc = bytes.get(at..at + 12).ok_or(Error::Truncated)?;
        let id = BigEndian::read_u32(&desc[0..4]);
        let off = BigEndian::read_u32(&desc[4..8]) as usize;
        let len = BigEndian::read_u32(&desc[8..12]) as usize;
        if id == entry_ids::RESOURCE_FORK {
            rsrc = (off as u64, len as u64);
            continue;
        }
        let data = bytes.get(off..off + len).ok_or(Error::Truncated)?;
        match id {
            entry_ids::REAL_NAME => meta.real_name = Some(data.to_vec()),
            entry_ids::COMMENT => meta.comment = Some(data.to_vec()),
            entry_ids::FILE_DATES_INFO => {
                let mut r = data;
                if data.len() != 16 {
                    return Err(Error::BadHeader("file dates entry size".into()));
                }
                meta.create_time = ad_to_mac_date(r.read_i32::<BigEndian>()?);
                meta.mod_time = ad_to_mac_date(r.read_i32::<BigEndian>()?);
                meta.backup_time = ad_to_mac_date(r.read_i32::<BigEndian>()?);
                meta.access_time = ad_to_mac_date(r.read_i32::<BigEndian>()?);
            }
            entry_ids::FINDER_INFO => {
                if data.len() != 32 {
                    return Err(Error::BadHeader("finder info entry size".into()));
                }
                meta.finder.copy_from_slice(data);
            }
            entry_ids::MACINTOSH_FILE_INFO => {
                if data.len() != 4 {
                    return Err(Error::BadHeader("file info entry size".into()));
                }
                meta.locked = BigEndian::read_u32(data) & MFI_LOCKED != 0;
            }
            _ => {} // enumerable but unused here
        }
    }
    Ok((meta, rsrc.0, rsrc.1))
}
