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
use std::collections::HashMap;
use std::sync::Arc;

use bincode::{de::Decoder, error::DecodeError, impl_borrow_decode, Decode};

use super::definitions::Cnid;
use super::error::{Error, Result};
use super::section::SectionReader;
use super::sparse::{SparseExtent, SparseReader};
use super::vfs::ReadAt;

/// A contiguous run of allocation blocks.
#[derive(Clone, Copy, Debug, Decode, Eq, PartialEq)]
pub struct Extent {
    pub start: u16,
    pub count: u16,
}

/// Three extents, the unit HFS stores per fork in catalog and overflow
/// records.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtDataRec(pub [Extent; 3]);

impl<Context> Decode<Context> for ExtDataRec {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        Ok(ExtDataRec([
            Decode::decode(decoder)?,
            Decode::decode(decoder)?,
            Decode::decode(decoder)?,
        ]))
    }
}
impl_borrow_decode!(ExtDataRec);

impl ExtDataRec {
    pub fn blocks(&self) -> u32 {
        self.0.iter().map(|e| u32::from(e.count)).sum()
    }
}

/// Block-to-byte geometry of one volume.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    /// Allocation block size in bytes.
    pub block_size: u32,
    /// Byte offset of allocation block 0 (`drAlBlSt` sectors in).
    pub first_byte: u64,
}

impl Allocation {
    pub fn byte_of(&self, block: u16) -> u64 {
        self.first_byte + u64::from(block) * u64::from(self.block_size)
    }
}

/// Extra extents beyond a fork's first three, keyed
/// `(CNID, first file allocation block, resource fork?)`.
pub type OverflowMap = HashMap<(Cnid, u16, bool), ExtDataRec>;

/// Expand a fork's extent list: the catalog's inline record, then
/// overflow records chased until `need_blocks` allocation blocks are
/// mapped.  A gap in the chain rejects the fork.
pub fn chase_overflow(
    first: &ExtDataRec,
    overflow: &OverflowMap,
    cnid: Cnid,
    resource: bool,
    need_blocks: u32,
) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut mapped = 0u32;
    let mut rec = *first;
    loop {
        for e in rec.0 {
            if e.count > 0 {
                mapped += u32::from(e.count);
                extents.push(e);
            }
        }
        if mapped >= need_blocks {
            return Ok(extents);
        }
        let fabn = u16::try_from(mapped)
            .map_err(|_| Error::BadHeader(format!("fork of cnid {cnid} too long")))?;
        rec = *overflow.get(&(cnid, fabn, resource)).ok_or_else(|| {
            Error::BadHeader(format!(
                "cnid {cnid} missing overflow extents at block {mapped}"
            ))
        })?;
    }
}

/// Compose a fork's extents into one reader clipped to the fork length.
/// Also reports the byte offset of the first extent, which callers use as
/// the listing order key.
pub fn fork_reader(
    disk: &Arc<dyn ReadAt>,
    alloc: &Allocation,
    extents: &[Extent],
    fork_len: u64,
) -> (Arc<dyn ReadAt>, u64) {
    let first_byte = extents.first().map(|e| alloc.byte_of(e.start)).unwrap_or(0);
    let mut runs = Vec::with_capacity(extents.len());
    let mut logical = 0u64;
    for e in extents {
        let len = u64::from(e.count) * u64::from(alloc.block_size);
        runs.push(SparseExtent {
            logical,
            physical: alloc.byte_of(e.start) as i64,
            len,
        });
        logical += len;
    }
    let joined = Arc::new(SparseReader::new(disk.clone(), runs));
    let clipped = SectionReader::new(joined, 0, fork_len);
    (Arc::new(clipped), first_byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(e: [(u16, u16); 3]) -> ExtDataRec {
        ExtDataRec([
            Extent { start: e[0].0, count: e[0].1 },
            Extent { start: e[1].0, count: e[1].1 },
            Extent { start: e[2].0, count: e[2].1 },
        ])
    }

    #[test]
    fn inline_extents_suffice() {
        let first = rec([(10, 2), (40, 1), (0, 0)]);
        let got = chase_overflow(&first, &OverflowMap::new(), 9, false, 3).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Extent { start: 10, count: 2 });
    }

    #[test]
    fn overflow_chain_is_followed() {
        let first = rec([(10, 2), (0, 0), (0, 0)]);
        let mut map = OverflowMap::new();
        map.insert((9, 2, false), rec([(100, 3), (0, 0), (0, 0)]));
        map.insert((9, 5, false), rec([(200, 1), (0, 0), (0, 0)]));
        let got = chase_overflow(&first, &map, 9, false, 6).unwrap();
        assert_eq!(got.iter().map(|e| e.start).collect::<Vec<_>>(), vec![10, 100, 200]);

        // The resource fork has its own chain.
        assert!(chase_overflow(&first, &map, 9, true, 6).is_err());
    }

    #[test]
    fn missing_link_is_rejected() {
        let first = rec([(10, 2), (0, 0), (0, 0)]);
        let err = chase_overflow(&first, &OverflowMap::new(), 9, false, 10).unwrap_err();
        assert!(matches!(err, Error::BadHeader(_)));
    }

    #[test]
    fn fork_reader_clips_to_length() {
        let mut disk_bytes = vec![0u8; 4096];
        for (i, b) in disk_bytes.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let disk: Arc<dyn ReadAt> = Arc::new(disk_bytes);
        let alloc = Allocation { block_size: 512, first_byte: 1024 };
        // Two one-block extents: blocks 2 and 0, i.e. bytes 2048.. and 1024..
        let extents = [Extent { start: 2, count: 1 }, Extent { start: 0, count: 1 }];
        let (r, first_byte) = fork_reader(&disk, &alloc, &extents, 600);
        assert_eq!(first_byte, 2048);

        let mut buf = vec![0u8; 1024];
        let n = r.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 600);
        assert_eq!(buf[0], (2048 % 256) as u8);
        assert_eq!(buf[512], (1024 % 256) as u8);
    }
}
