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

//! A Macintosh resource fork as a two-level pseudo-filesystem: one
//! directory per resource type, one file per resource.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use byteorder::{BigEndian, ByteOrder};

use super::error::{Error, Result};
use super::macroman;
use super::section::SectionReader;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::vfs::{read_exact_at, ReadAt, SysHandle};

/// Where the Resource Manager always started the data section.
pub const DATA_SECTION_OFFSET: u32 = 0x100;

/// A cheap shape test on the 16-byte fork header, used by the prober.
pub fn looks_like(header: &[u8; 16], size: u64) -> bool {
    let data_off = u64::from(BigEndian::read_u32(&header[0..4]));
    let map_off = u64::from(BigEndian::read_u32(&header[4..8]));
    let data_len = u64::from(BigEndian::read_u32(&header[8..12]));
    let map_len = u64::from(BigEndian::read_u32(&header[12..16]));
    data_off == u64::from(DATA_SECTION_OFFSET)
        && map_off == data_off + data_len
        && map_len >= 30
        && map_off + map_len <= size
}

/// A type's directory name: the four characters when printable, the hex
/// spelling otherwise.
fn type_dir_name(fourcc: &[u8; 4]) -> String {
    if fourcc.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        let name = macroman::decode(fourcc).replace('/', ":");
        // A trailing space is common ("STR ") but invisible; trim it.
        name.trim_end().to_string()
    } else {
        format!("{:02x}{:02x}{:02x}{:02x}", fourcc[0], fourcc[1], fourcc[2], fourcc[3])
    }
}

pub fn new_rsrc(src: Arc<dyn ReadAt>, size: u64) -> Result<Arc<FsSkeleton>> {
    let mut header = [0u8; 16];
    read_exact_at(&src, &mut header, 0)?;
    if !looks_like(&header, size) {
        return Err(Error::BadMagic);
    }
    let data_off = u64::from(BigEndian::read_u32(&header[0..4]));
    let map_off = u64::from(BigEndian::read_u32(&header[4..8]));
    let map_len = usize::try_from(u64::from(BigEndian::read_u32(&header[12..16])))
        .map_err(|_| Error::Truncated)?;

    let mut map = vec![0u8; map_len];
    read_exact_at(&src, &mut map, map_off)?;

    // 16 bytes of header copy, 4 of handle, 2 of file ref precede the
    // live fields.
    let type_list_off = usize::from(BigEndian::read_u16(&map[24..26]));
    let name_list_off = usize::from(BigEndian::read_u16(&map[26..28]));

    let type_list = map.get(type_list_off..).ok_or(Error::Truncated)?;
    let num_types = usize::from(BigEndian::read_u16(type_list.get(0..2).ok_or(Error::Truncated)?))
        .wrapping_add(1)
        & 0xFFFF;

    let skel = Arc::new(FsSkeleton::new());
    for t in 0..num_types {
        let item = type_list
            .get(2 + t * 8..2 + t * 8 + 8)
            .ok_or(Error::Truncated)?;
        let fourcc: [u8; 4] = item[0..4].try_into().unwrap();
        let count = usize::from(BigEndian::read_u16(&item[4..6])).wrapping_add(1) & 0xFFFF;
        let ref_off = usize::from(BigEndian::read_u16(&item[6..8]));

        let dir = type_dir_name(&fourcc);
        skel.create_dir(
            &dir,
            NodeAttrs {
                mode: 0o755,
                mtime: UNIX_EPOCH,
                sys: SysHandle::Record { index: t as u64 },
                order: t as i64,
            },
        )?;

        for r in 0..count {
            let item = type_list
                .get(ref_off + r * 12..ref_off + r * 12 + 12)
                .ok_or(Error::Truncated)?;
            let id = BigEndian::read_i16(&item[0..2]);
            let name_off = BigEndian::read_i16(&item[2..4]);
            let res_data_off = u64::from(BigEndian::read_u32(&item[4..8]) & 0x00FF_FFFF);

            let mut len_buf = [0u8; 4];
            read_exact_at(&src, &mut len_buf, data_off + res_data_off)?;
            let res_len = u64::from(BigEndian::read_u32(&len_buf));
            if data_off + res_data_off + 4 + res_len > size {
                return Err(Error::Truncated);
            }

            let name = if name_off >= 0 {
                let at = name_list_off + name_off as usize;
                let len = usize::from(*map.get(at).ok_or(Error::Truncated)?);
                let raw = map.get(at + 1..at + 1 + len).ok_or(Error::Truncated)?;
                let text = macroman::decode(raw).replace('/', ":");
                format!("{dir}/{id} {text}")
            } else {
                format!("{dir}/{id}")
            };

            skel.create_file_random(
                &name,
                Arc::new(SectionReader::new(
                    src.clone(),
                    data_off + res_data_off + 4,
                    res_len,
                )),
                res_len,
                NodeAttrs {
                    mode: 0o644,
                    mtime: UNIX_EPOCH,
                    sys: SysHandle::Record { index: (t as u64) << 32 | r as u64 },
                    order: r as i64,
                },
            )?;
        }
    }

    skel.no_more();
    Ok(skel)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vfs::{ArchiveFs, FileBody};

    /// Build a resource fork with the given `(type, id, name, data)`
    /// resources, laid out the way the Resource Manager wrote them.
    pub fn make_fork(resources: &[(&[u8; 4], i16, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut data_offsets = Vec::new();
        for (_, _, _, payload) in resources {
            data_offsets.push(data.len() as u32);
            data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            data.extend_from_slice(payload);
        }

        let mut types: Vec<&[u8; 4]> = Vec::new();
        for (t, _, _, _) in resources {
            if !types.contains(t) {
                types.push(t);
            }
        }

        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for (_, _, name, _) in resources {
            match name {
                Some(n) => {
                    name_offsets.push(names.len() as i16);
                    names.push(n.len() as u8);
                    names.extend_from_slice(n.as_bytes());
                }
                None => name_offsets.push(-1),
            }
        }

        // type list: count-1, then 8 bytes per type; reference lists after.
        let mut type_list = Vec::new();
        type_list.extend_from_slice(&((types.len() as u16).wrapping_sub(1)).to_be_bytes());
        let mut ref_lists = Vec::new();
        let ref_base = 2 + types.len() * 8;
        for t in &types {
            let members: Vec<usize> = resources
                .iter()
                .enumerate()
                .filter(|(_, r)| &r.0 == t)
                .map(|(i, _)| i)
                .collect();
            type_list.extend_from_slice(*t);
            type_list
                .extend_from_slice(&((members.len() as u16).wrapping_sub(1)).to_be_bytes());
            type_list.extend_from_slice(&((ref_base + ref_lists.len()) as u16).to_be_bytes());
            for i in members {
                let (_, id, _, _) = resources[i];
                ref_lists.extend_from_slice(&id.to_be_bytes());
                ref_lists.extend_from_slice(&name_offsets[i].to_be_bytes());
                let packed = data_offsets[i] & 0x00FF_FFFF;
                ref_lists.extend_from_slice(&packed.to_be_bytes());
                ref_lists.extend_from_slice(&[0u8; 4]);
            }
        }

        let type_list_off = 28usize;
        let name_list_off = type_list_off + type_list.len() + ref_lists.len();
        let mut map = vec![0u8; 28];
        map[24..26].copy_from_slice(&(type_list_off as u16).to_be_bytes());
        map[26..28].copy_from_slice(&(name_list_off as u16).to_be_bytes());
        map.extend_from_slice(&type_list);
        map.extend_from_slice(&ref_lists);
        map.extend_from_slice(&names);

        let mut fork = vec![0u8; DATA_SECTION_OFFSET as usize];
        fork[0..4].copy_from_slice(&DATA_SECTION_OFFSET.to_be_bytes());
        let map_off = DATA_SECTION_OFFSET as usize + data.len();
        fork[4..8].copy_from_slice(&(map_off as u32).to_be_bytes());
        fork[8..12].copy_from_slice(&(data.len() as u32).to_be_bytes());
        fork[12..16].copy_from_slice(&(map.len() as u32).to_be_bytes());
        fork.extend_from_slice(&data);
        fork.extend_from_slice(&map);
        fork
    }

    #[test]
    fn resources_become_files() {
        let fork = make_fork(&[
            (b"TEXT", 128, Some("Read Me"), b"the text"),
            (b"ICN#", -16455, None, &[0xAB; 32]),
            (b"TEXT", 129, None, b"more"),
        ]);
        let size = fork.len() as u64;
        let fs = new_rsrc(Arc::new(fork), size).unwrap();

        let top: Vec<String> =
            fs.read_dir(".").unwrap().into_iter().map(|e| e.info.name).collect();
        assert_eq!(top, vec!["TEXT", "ICN#"]);

        let h = fs.open("TEXT/128 Read Me").unwrap();
        assert_eq!(h.info.size, 8);
        let FileBody::Random(r) = h.body else { panic!("not random") };
        let mut buf = [0u8; 16];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf[..8], b"the text");

        assert_eq!(fs.stat("ICN#/-16455").unwrap().size, 32);
        assert_eq!(fs.stat("TEXT/129").unwrap().size, 4);
    }

    #[test]
    fn shape_test_rejects_ordinary_files() {
        let mut hdr = [0u8; 16];
        hdr[0..4].copy_from_slice(b"Just");
        assert!(!looks_like(&hdr, 1000));

        let fork = make_fork(&[(b"TEXT", 0, None, b"x")]);
        let mut hdr = [0u8; 16];
        hdr.copy_from_slice(&fork[0..16]);
        assert!(looks_like(&hdr, fork.len() as u64));
    }
}
