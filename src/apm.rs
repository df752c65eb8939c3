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

//! Apple Partition Map disk images: one pseudo-file per partition, each a
//! window onto the image.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use byteorder::{BigEndian, ByteOrder};

use super::error::{Error, Result};
use super::section::SectionReader;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::vfs::{read_exact_at, ReadAt, SysHandle};

pub const DRIVER_SIGNATURE: u16 = 0x4552; // 'ER'
pub const ENTRY_SIGNATURE: u16 = 0x504D; // 'PM'

pub const VALID_BLOCK_SIZES: [u16; 4] = [0x200, 0x400, 0x800, 0x1000];

/// More map entries than this means a corrupt map, not a big disk.
const MAX_ENTRIES: u32 = 2048;

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn new_apm(src: Arc<dyn ReadAt>, size: u64) -> Result<Arc<FsSkeleton>> {
    let mut block0 = [0u8; 4];
    read_exact_at(&src, &mut block0, 0)?;
    if BigEndian::read_u16(&block0[0..2]) != DRIVER_SIGNATURE {
        return Err(Error::BadMagic);
    }
    let block_size = BigEndian::read_u16(&block0[2..4]);
    if !VALID_BLOCK_SIZES.contains(&block_size) {
        return Err(Error::BadHeader(format!("partition block size {block_size}")));
    }
    let bs = u64::from(block_size);

    let skel = Arc::new(FsSkeleton::new());
    let mut map_count = 1u32;
    let mut i = 1u32;
    while i <= map_count {
        let mut entry = [0u8; 80];
        read_exact_at(&src, &mut entry, u64::from(i) * bs)?;
        if BigEndian::read_u16(&entry[0..2]) != ENTRY_SIGNATURE {
            return Err(Error::BadHeader(format!("partition entry {i} signature")));
        }
        if i == 1 {
            map_count = BigEndian::read_u32(&entry[4..8]);
            if map_count == 0 || map_count > MAX_ENTRIES {
                return Err(Error::BadHeader(format!("partition map of {map_count} entries")));
            }
        }
        let start = u64::from(BigEndian::read_u32(&entry[8..12])) * bs;
        let blocks = u64::from(BigEndian::read_u32(&entry[12..16])) * bs;
        let len = blocks.min(size.saturating_sub(start));

        let name = cstr(&entry[16..48]);
        let par_type = cstr(&entry[48..80]);
        let label = if name.is_empty() { par_type } else { name };
        let path = format!("{i} {label}");

        skel.create_file_random(
            &path,
            Arc::new(SectionReader::new(src.clone(), start, len)),
            len,
            NodeAttrs {
                mode: 0o644,
                mtime: UNIX_EPOCH,
                sys: SysHandle::Record { index: u64::from(i) },
                order: i64::from(i),
            },
        )?;
        i += 1;
    }

    skel.no_more();
    Ok(skel)
}
