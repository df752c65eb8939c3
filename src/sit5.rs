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

//! The StuffIt 5 container: variable-size entry headers linked by
//! explicit offsets, with an OS-specific metadata block per entry and an
//! optional resource-fork sub-block inside the Mac one.

use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::appledouble::{self, AppleDoubleMeta, Layout};
use super::context::SystemContext;
use super::error::{Error, Result};
use super::macroman;
use super::multi::MultiReaderAt;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::stuffit::{crc16, fork_body, ForkDesc, SIT5_MAGIC};
use super::utils::mac_time;
use super::vfs::{ReadAt, SysHandle};

pub const ENTRY_MAGIC: u32 = 0xA5A5_A5A5;
const PREAMBLE_LEN: u64 = 100;
const BASE_HEADER_LEN: usize = 48;

bitflags! {
    #[derive(Clone, Copy, Debug)]
    struct EntryFlags: u8 {
        const DIRECTORY = 0x40;
        const PROTECTED = 0x20;
        const _ = !0;
    }
}

mod os_kind {
    pub const MAC: u16 = 1;
}

mod os_flags {
    pub const HAS_RESOURCE_FORK: u16 = 0x01;
}

struct Entry {
    flags: EntryFlags,
    mod_date: u32,
    create_date: u32,
    next_offset: u64,
    name: String,
    /// Directory payload: offset of the first child and how many there
    /// are.
    first_child: u64,
    child_count: u32,
    data: ForkDesc,
    rsrc: Option<ForkDesc>,
    finder: [u8; 32],
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    fn protected(&self) -> bool {
        self.flags.contains(EntryFlags::PROTECTED)
    }
}

fn read_entry(src: &Arc<dyn ReadAt>, size: u64, off: u64) -> Result<Entry> {
    let mut base = [0u8; BASE_HEADER_LEN];
    if off >= size || src.read_at(&mut base, off)? < base.len() {
        return Err(Error::Truncated);
    }
    if BigEndian::read_u32(&base[0..4]) != ENTRY_MAGIC {
        return Err(Error::BadMagic);
    }
    let header_size = usize::from(BigEndian::read_u16(&base[6..8]));
    if header_size < BASE_HEADER_LEN || header_size > 0x4000 {
        return Err(Error::BadHeader(format!("sit5 header size {header_size}")));
    }
    let mut header = vec![0u8; header_size];
    if src.read_at(&mut header, off)? < header.len() {
        return Err(Error::Truncated);
    }

    let stored_crc = BigEndian::read_u16(&header[32..34]);
    let mut crc_view = header.clone();
    crc_view[32] = 0;
    crc_view[33] = 0;
    if crc16(&crc_view) != stored_crc {
        return Err(Error::BadChecksum);
    }

    let entry_flags = EntryFlags::from_bits_retain(header[9]);
    let create_date = BigEndian::read_u32(&header[10..14]);
    let mod_date = BigEndian::read_u32(&header[14..18]);
    let next_offset = u64::from(BigEndian::read_u32(&header[22..26]));
    let name_len = usize::from(BigEndian::read_u16(&header[30..32]));
    let password_len = usize::from(header[47]);

    let name_start = BASE_HEADER_LEN + password_len;
    let name_end = name_start + name_len;
    if name_end > header_size {
        return Err(Error::BadHeader("sit5 name overruns header".into()));
    }
    let name = macroman::decode(&header[name_start..name_end]).replace('/', ":");

    // The OS metadata block sits at the end of the header region.
    let mut os = [0u8; 4];
    if src.read_at(&mut os, off + header_size as u64)? < os.len() {
        return Err(Error::Truncated);
    }
    let kind = BigEndian::read_u16(&os[0..2]);
    let os_size = usize::from(BigEndian::read_u16(&os[2..4]));
    if !(4..=64).contains(&os_size) {
        return Err(Error::BadHeader(format!("sit5 os block size {os_size}")));
    }
    let mut os_block = vec![0u8; os_size];
    if src.read_at(&mut os_block, off + header_size as u64)? < os_block.len() {
        return Err(Error::Truncated);
    }

    let payload_off = off + header_size as u64 + os_size as u64;
    let mut finder = [0u8; 32];
    let mut rsrc = None;
    if kind == os_kind::MAC && os_size >= 32 {
        finder[0..4].copy_from_slice(&os_block[4..8]); // type
        finder[4..8].copy_from_slice(&os_block[8..12]); // creator
        finder[8..10].copy_from_slice(&os_block[12..14]); // finder flags
        finder[16..32].copy_from_slice(&os_block[16..32]); // extended info
        let osf = BigEndian::read_u16(&os_block[14..16]);
        if osf & os_flags::HAS_RESOURCE_FORK != 0 {
            if os_size < 44 {
                return Err(Error::BadHeader("sit5 resource sub-block truncated".into()));
            }
            rsrc = Some(ForkDesc {
                method: os_block[42],
                packed_off: payload_off,
                packed_len: u64::from(BigEndian::read_u32(&os_block[36..40])),
                unpacked_len: u64::from(BigEndian::read_u32(&os_block[32..36])),
                crc: BigEndian::read_u16(&os_block[40..42]),
            });
        }
    }
    let rsrc_packed = rsrc.map(|f| f.packed_len).unwrap_or(0);

    Ok(Entry {
        flags: entry_flags,
        mod_date,
        create_date,
        next_offset,
        name,
        first_child: u64::from(BigEndian::read_u32(&header[34..38])),
        child_count: BigEndian::read_u32(&header[38..42]),
        data: ForkDesc {
            method: header[46],
            packed_off: payload_off + rsrc_packed,
            packed_len: u64::from(BigEndian::read_u32(&header[38..42])),
            unpacked_len: u64::from(BigEndian::read_u32(&header[34..38])),
            crc: BigEndian::read_u16(&header[42..44]),
        },
        rsrc,
        finder,
    })
}

fn meta_from(e: &Entry) -> AppleDoubleMeta {
    let mut meta = AppleDoubleMeta::default();
    meta.finder = e.finder;
    meta.create_time = e.create_date;
    meta.mod_time = e.mod_date;
    meta.access_time = e.mod_date;
    meta
}

pub fn new_sit5(
    ctx: &Arc<SystemContext>,
    src: Arc<dyn ReadAt>,
    size: u64,
) -> Result<Arc<FsSkeleton>> {
    let mut preamble = [0u8; PREAMBLE_LEN as usize];
    if src.read_at(&mut preamble, 0)? < preamble.len() {
        return Err(Error::Truncated);
    }
    if &preamble[0..16] != SIT5_MAGIC {
        return Err(Error::BadMagic);
    }
    let first_entry = u64::from(BigEndian::read_u32(&preamble[84..88]));
    let root_count = BigEndian::read_u32(&preamble[88..92]);

    let skel = Arc::new(FsSkeleton::new());
    let mut seen: HashSet<u64> = HashSet::new();
    let mut order = 0i64;
    // Explicit traversal frames: where to read, how many siblings remain,
    // and the directory the entries belong to.
    let mut work: Vec<(u64, u32, String)> = Vec::new();
    if root_count > 0 {
        work.push((first_entry, root_count, String::from(".")));
    }

    while let Some((off, remaining, parent)) = work.pop() {
        if remaining == 0 {
            continue;
        }
        if !seen.insert(off) {
            return Err(Error::BadHeader(format!("sit5 entry loop at {off}")));
        }
        let entry = read_entry(&src, size, off)?;
        let path = if parent == "." {
            entry.name.clone()
        } else {
            format!("{parent}/{}", entry.name)
        };
        let attrs = NodeAttrs {
            mode: 0o644,
            mtime: mac_time(entry.mod_date),
            sys: SysHandle::Record { index: off },
            order,
        };
        order += 1;

        if entry.is_dir() {
            skel.create_dir(&path, NodeAttrs { mode: 0o755, ..attrs })?;
            let header = appledouble::synthesize(&meta_from(&entry), 0, Layout::Compact);
            let hlen = header.len() as u64;
            skel.create_file_random(&sidecar(&path), Arc::new(header), hlen, attrs)?;
            if entry.child_count > 0 {
                work.push((entry.first_child, entry.child_count, path));
            }
        } else {
            let protected = entry.protected();
            match fork_body(ctx, &src, &entry.data, protected) {
                Ok(body) => {
                    skel.create_file_random(&path, body, entry.data.unpacked_len, attrs)?
                }
                Err(e) => {
                    debug!("sit5 member {}: data fork: {}", path, e);
                    skel.create_file_defect(&path, entry.data.unpacked_len as i64, e, attrs)?
                }
            }

            let rsrc_len = entry.rsrc.map(|f| f.unpacked_len).unwrap_or(0);
            let header = appledouble::synthesize(&meta_from(&entry), rsrc_len, Layout::Compact);
            let hlen = header.len() as u64;
            let total = hlen + rsrc_len;
            let rsrc_body = match entry.rsrc {
                Some(fork) => fork_body(ctx, &src, &fork, protected),
                None => Ok(Arc::new(Vec::<u8>::new()) as Arc<dyn ReadAt>),
            };
            match rsrc_body {
                Ok(body) => {
                    let joined = Arc::new(MultiReaderAt::new(vec![
                        (Arc::new(header) as Arc<dyn ReadAt>, hlen),
                        (body, rsrc_len),
                    ]));
                    skel.create_file_random(&sidecar(&path), joined, total, attrs)?;
                }
                Err(e) => {
                    debug!("sit5 member {}: resource fork: {}", path, e);
                    skel.create_file_defect(&sidecar(&path), total as i64, e, attrs)?;
                }
            }
        }

        if remaining > 1 {
            if entry.next_offset == 0 {
                return Err(Error::BadHeader("sit5 sibling chain ends early".into()));
            }
            work.push((entry.next_offset, remaining - 1, parent));
        }
    }

    skel.no_more();
    Ok(skel)
}

fn sidecar(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => format!("{}/._{}", &path[..i], &path[i + 1..]),
        None => format!("._{path}"),
    }
}
