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

//! The classic ("SIT!") StuffIt format: fixed 112-byte member headers,
//! folders bracketed by start/end marker records.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::appledouble::{self, AppleDoubleMeta, Layout};
use super::context::SystemContext;
use super::error::{Error, Result};
use super::multi::MultiReaderAt;
use super::macroman;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::stuffit::{crc16, fork_body, ForkDesc};
use super::utils::mac_time;
use super::vfs::{ReadAt, SysHandle};

const ARCHIVE_HEADER_LEN: u64 = 22;
const RECORD_LEN: u64 = 112;

mod algo {
    /// R-algo values marking folder boundaries.
    pub const FOLDER_START: u8 = 32;
    pub const FOLDER_END: u8 = 33;
    /// Set on either fork's algorithm byte when the member is encrypted.
    pub const PROTECTED_BIT: u8 = 16;
}

struct Record {
    r_algo: u8,
    d_algo: u8,
    name: String,
    finder: [u8; 10],
    create_date: u32,
    mod_date: u32,
    rsrc: ForkDesc,
    data: ForkDesc,
}

fn parse_record(raw: &[u8; RECORD_LEN as usize], payload_off: u64) -> Result<Record> {
    let stored = BigEndian::read_u16(&raw[110..112]);
    if crc16(&raw[..110]) != stored {
        return Err(Error::BadChecksum);
    }
    let name_len = usize::from(raw[2]).min(63);
    let name = macroman::decode(&raw[3..3 + name_len]).replace('/', ":");

    let rsrc_unpacked = u64::from(BigEndian::read_u32(&raw[84..88]));
    let data_unpacked = u64::from(BigEndian::read_u32(&raw[88..92]));
    let rsrc_packed = u64::from(BigEndian::read_u32(&raw[92..96]));
    let data_packed = u64::from(BigEndian::read_u32(&raw[96..100]));

    let mut finder = [0u8; 10];
    finder.copy_from_slice(&raw[66..76]);

    Ok(Record {
        r_algo: raw[0],
        d_algo: raw[1],
        name,
        finder,
        create_date: BigEndian::read_u32(&raw[76..80]),
        mod_date: BigEndian::read_u32(&raw[80..84]),
        // The resource fork's bytes precede the data fork's.
        rsrc: ForkDesc {
            method: raw[0] & 0x0F,
            packed_off: payload_off,
            packed_len: rsrc_packed,
            unpacked_len: rsrc_unpacked,
            crc: BigEndian::read_u16(&raw[100..102]),
        },
        data: ForkDesc {
            method: raw[1] & 0x0F,
            packed_off: payload_off + rsrc_packed,
            packed_len: data_packed,
            unpacked_len: data_unpacked,
            crc: BigEndian::read_u16(&raw[102..104]),
        },
    })
}

fn meta_from(rec: &Record) -> AppleDoubleMeta {
    let mut meta = AppleDoubleMeta::default();
    meta.finder[..10].copy_from_slice(&rec.finder);
    meta.create_time = rec.create_date;
    meta.mod_time = rec.mod_date;
    meta.access_time = rec.mod_date;
    meta
}

/// A parsed member plus its position in the folder tree.  `parent` is an
/// index into the directory list, None at the archive root.
struct Parsed {
    parent: Option<usize>,
    rec: Record,
    order: i64,
}

pub fn new_classic(
    ctx: &Arc<SystemContext>,
    src: Arc<dyn ReadAt>,
    size: u64,
) -> Result<Arc<FsSkeleton>> {
    let mut head = [0u8; ARCHIVE_HEADER_LEN as usize];
    if src.read_at(&mut head, 0)? < head.len() {
        return Err(Error::Truncated);
    }
    if head[0] != b'S' || &head[10..14] != b"rLau" {
        return Err(Error::BadMagic);
    }
    let declared = u64::from(BigEndian::read_u32(&head[6..10]));
    let end = size.min(declared.max(ARCHIVE_HEADER_LEN));

    // First pass: read and verify every record, noting each member's
    // enclosing folder.  Nothing is emitted until the whole stream has
    // parsed clean.
    let mut dirs: Vec<Parsed> = Vec::new();
    let mut files: Vec<Parsed> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut off = ARCHIVE_HEADER_LEN;
    let mut order = 0i64;

    while off + RECORD_LEN <= end {
        let mut raw = [0u8; RECORD_LEN as usize];
        if src.read_at(&mut raw, off)? < raw.len() {
            return Err(Error::Truncated);
        }
        let rec = parse_record(&raw, off + RECORD_LEN)?;
        let parent = stack.last().copied();

        match rec.r_algo {
            algo::FOLDER_START => {
                dirs.push(Parsed { parent, rec, order });
                stack.push(dirs.len() - 1);
                off += RECORD_LEN;
            }
            algo::FOLDER_END => {
                if stack.pop().is_none() {
                    return Err(Error::BadHeader("folder end without start".into()));
                }
                off += RECORD_LEN;
            }
            _ => {
                off += RECORD_LEN + rec.rsrc.packed_len + rec.data.packed_len;
                files.push(Parsed { parent, rec, order });
            }
        }
        order += 1;
    }

    // Second pass: resolve folder paths, deferring each child until its
    // parent's path is known, and only then emit.  Parent-first is the
    // norm in classic archives, but nothing here depends on it.
    let skel = Arc::new(FsSkeleton::new());
    let mut paths: Vec<Option<String>> = vec![None; dirs.len()];
    let mut unresolved = dirs.len();
    while unresolved > 0 {
        let mut progressed = false;
        for (i, d) in dirs.iter().enumerate() {
            if paths[i].is_some() {
                continue;
            }
            let dir_path = match d.parent {
                None => d.rec.name.clone(),
                Some(p) => match &paths[p] {
                    Some(pp) => format!("{pp}/{}", d.rec.name),
                    None => continue, // deferred until the parent resolves
                },
            };
            let attrs = NodeAttrs {
                mode: 0o755,
                mtime: mac_time(d.rec.mod_date),
                sys: SysHandle::Record { index: d.order as u64 },
                order: d.order,
            };
            skel.create_dir(&dir_path, attrs)?;
            let header = appledouble::synthesize(&meta_from(&d.rec), 0, Layout::Compact);
            let hlen = header.len() as u64;
            skel.create_file_random(
                &sidecar(&dir_path),
                Arc::new(header),
                hlen,
                NodeAttrs { mode: 0o644, ..attrs },
            )?;
            paths[i] = Some(dir_path);
            unresolved -= 1;
            progressed = true;
        }
        if !progressed {
            return Err(Error::BadHeader("folder nesting never resolves".into()));
        }
    }

    for f in &files {
        let rec = &f.rec;
        let file_path = match f.parent {
            None => rec.name.clone(),
            Some(p) => match &paths[p] {
                Some(pp) => format!("{pp}/{}", rec.name),
                None => {
                    return Err(Error::Unrecoverable(format!(
                        "member {} has an unresolved folder",
                        rec.name
                    )))
                }
            },
        };
        let protected = (rec.r_algo | rec.d_algo) & algo::PROTECTED_BIT != 0;
        let attrs = NodeAttrs {
            mode: 0o644,
            mtime: mac_time(rec.mod_date),
            sys: SysHandle::Record { index: f.order as u64 },
            order: f.order,
        };

        match fork_body(ctx, &src, &rec.data, protected) {
            Ok(body) => {
                skel.create_file_random(&file_path, body, rec.data.unpacked_len, attrs)?
            }
            Err(e) => {
                debug!("classic member {}: data fork: {}", file_path, e);
                skel.create_file_defect(&file_path, rec.data.unpacked_len as i64, e, attrs)?
            }
        }

        let header =
            appledouble::synthesize(&meta_from(rec), rec.rsrc.unpacked_len, Layout::Compact);
        let hlen = header.len() as u64;
        let total = hlen + rec.rsrc.unpacked_len;
        match fork_body(ctx, &src, &rec.rsrc, protected) {
            Ok(body) => {
                let joined = Arc::new(MultiReaderAt::new(vec![
                    (Arc::new(header) as Arc<dyn ReadAt>, hlen),
                    (body, rec.rsrc.unpacked_len),
                ]));
                skel.create_file_random(&sidecar(&file_path), joined, total, attrs)?;
            }
            Err(e) => {
                debug!("classic member {}: resource fork: {}", file_path, e);
                skel.create_file_defect(&sidecar(&file_path), total as i64, e, attrs)?;
            }
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a member record the way StuffIt 1.5 would have.
    #[allow(clippy::too_many_arguments)]
    pub fn make_record(
        r_algo: u8,
        d_algo: u8,
        name: &[u8],
        file_type: &[u8; 4],
        creator: &[u8; 4],
        rsrc_unpacked: u32,
        data_unpacked: u32,
        rsrc_packed: u32,
        data_packed: u32,
        mod_date: u32,
    ) -> Vec<u8> {
        let mut rec = vec![0u8; 112];
        rec[0] = r_algo;
        rec[1] = d_algo;
        rec[2] = name.len() as u8;
        rec[3..3 + name.len()].copy_from_slice(name);
        rec[66..70].copy_from_slice(file_type);
        rec[70..74].copy_from_slice(creator);
        rec[80..84].copy_from_slice(&mod_date.to_be_bytes());
        rec[84..88].copy_from_slice(&rsrc_unpacked.to_be_bytes());
        rec[88..92].copy_from_slice(&data_unpacked.to_be_bytes());
        rec[92..96].copy_from_slice(&rsrc_packed.to_be_bytes());
        rec[96..100].copy_from_slice(&data_packed.to_be_bytes());
        let crc = crc16(&rec[..110]);
        rec[110..112].copy_from_slice(&crc.to_be_bytes());
        rec
    }

    /// Wrap records+payloads into a complete archive image.
    pub fn make_archive(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 22];
        out[0..4].copy_from_slice(b"SIT!");
        out[10..14].copy_from_slice(b"rLau");
        out.extend_from_slice(body);
        let total = out.len() as u32;
        out[6..10].copy_from_slice(&total.to_be_bytes());
        out
    }

    fn open_bytes(fs: &FsSkeleton, path: &str) -> Vec<u8> {
        use crate::vfs::{ArchiveFs, FileBody};
        let h = fs.open(path).unwrap();
        let FileBody::Random(r) = h.body else { panic!("{path} not random") };
        let size = h.info.size as usize;
        let mut out = vec![0u8; size];
        assert_eq!(r.read_at(&mut out, 0).unwrap(), size);
        out
    }

    #[test]
    fn folder_nesting_resolves_parent_paths() {
        let mut body = make_record(
            algo::FOLDER_START, 0, b"Outer", b"fold", b"MACS", 0, 0, 0, 0, 1,
        );
        body.extend(make_record(
            algo::FOLDER_START, 0, b"Inner", b"fold", b"MACS", 0, 0, 0, 0, 2,
        ));
        let mut leaf = make_record(0, 0, b"leaf.txt", b"TEXT", b"ttxt", 0, 2, 0, 2, 3);
        leaf.extend_from_slice(b"ok");
        body.extend(leaf);
        body.extend(make_record(algo::FOLDER_END, 0, b"", b"    ", b"    ", 0, 0, 0, 0, 4));
        let mut top = make_record(0, 0, b"top.txt", b"TEXT", b"ttxt", 0, 1, 0, 1, 5);
        top.extend_from_slice(b"t");
        body.extend(top);
        body.extend(make_record(algo::FOLDER_END, 0, b"", b"    ", b"    ", 0, 0, 0, 0, 6));

        let img = make_archive(&body);
        let ctx = SystemContext::with_defaults();
        let size = img.len() as u64;
        let fs = new_classic(&ctx, Arc::new(img) as Arc<dyn ReadAt>, size).unwrap();

        assert_eq!(open_bytes(&fs, "Outer/Inner/leaf.txt"), b"ok");
        assert_eq!(open_bytes(&fs, "Outer/top.txt"), b"t");

        use crate::vfs::ArchiveFs;
        let outer: Vec<String> = fs
            .read_dir("Outer")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(outer, vec!["._Inner", "Inner", "._top.txt", "top.txt"]);
    }

    #[test]
    fn corruption_anywhere_rejects_the_whole_archive() {
        // The first pass verifies every record before anything is
        // emitted, so a bad trailer poisons members that parsed fine.
        let mut good = make_record(0, 0, b"good", b"TEXT", b"ttxt", 0, 1, 0, 1, 0);
        good.push(b'g');
        let mut bad = make_record(0, 0, b"bad", b"TEXT", b"ttxt", 0, 1, 0, 1, 0);
        bad[5] ^= 0xFF;
        bad.push(b'b');
        let mut body = good;
        body.extend(bad);

        let img = make_archive(&body);
        let ctx = SystemContext::with_defaults();
        let size = img.len() as u64;
        assert!(matches!(
            new_classic(&ctx, Arc::new(img) as Arc<dyn ReadAt>, size),
            Err(Error::BadChecksum)
        ));
    }

    #[test]
    fn lzc_forks_decompress() {
        let text: Vec<u8> = b"all work and no play makes a dull archive "
            .iter()
            .cycle()
            .take(5000)
            .copied()
            .collect();
        let packed = crate::lzw::tests::compress(&text);
        let mut body = make_record(
            0,
            crate::stuffit::method::LZC,
            b"essay.txt",
            b"TEXT",
            b"ttxt",
            0,
            text.len() as u32,
            0,
            packed.len() as u32,
            0xA000_0000,
        );
        body.extend_from_slice(&packed);
        let img = make_archive(&body);
        let ctx = SystemContext::with_defaults();
        let size = img.len() as u64;
        let fs = new_classic(&ctx, Arc::new(img) as Arc<dyn ReadAt>, size).unwrap();
        assert_eq!(open_bytes(&fs, "essay.txt"), text);
    }

    #[test]
    fn huffman_forks_decompress() {
        let text: Vec<u8> = b"compression by code tree".repeat(64);
        let packed = crate::huffman::tests::compress(&text);
        let mut body = make_record(
            crate::stuffit::method::HUFFMAN,
            0,
            b"packed",
            b"BINA",
            b"mdos",
            text.len() as u32,
            0,
            packed.len() as u32,
            0,
            0,
        );
        body.extend_from_slice(&packed);
        let img = make_archive(&body);
        let ctx = SystemContext::with_defaults();
        let size = img.len() as u64;
        let fs = new_classic(&ctx, Arc::new(img) as Arc<dyn ReadAt>, size).unwrap();

        // The resource fork rides inside the sidecar, after the header.
        let sidecar = open_bytes(&fs, "._packed");
        let (_, off, len) = crate::appledouble::parse(&sidecar).unwrap();
        assert_eq!(len, text.len() as u64);
        assert_eq!(&sidecar[off as usize..], &text[..]);
    }

    #[test]
    fn corrupt_record_crc_rejects_the_archive() {
        let mut rec = make_record(0, 0, b"f", b"TEXT", b"ttxt", 0, 1, 0, 1, 0);
        rec[5] ^= 0xFF;
        rec.push(b'x'); // payload
        let img = make_archive(&rec);
        let ctx = SystemContext::with_defaults();
        let src: Arc<dyn ReadAt> = Arc::new(img.clone());
        assert!(matches!(
            new_classic(&ctx, src, img.len() as u64),
            Err(Error::BadChecksum)
        ));
    }

    #[test]
    fn unbalanced_folder_markers_are_rejected() {
        let rec = make_record(algo::FOLDER_END, 0, b"d", b"    ", b"    ", 0, 0, 0, 0, 0);
        let img = make_archive(&rec);
        let ctx = SystemContext::with_defaults();
        let src: Arc<dyn ReadAt> = Arc::new(img.clone());
        assert!(new_classic(&ctx, src, img.len() as u64).is_err());
    }
}
