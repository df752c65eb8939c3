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

//! The HFS volume parser: walk the catalog, expand every fork's extents,
//! and expose the volume as a skeleton with AppleDouble sidecars.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::appledouble::{self, AppleDoubleMeta, Layout};
use super::catalog::{
    parse_catalog_record, parse_overflow_record, CatalogRecord, RawDirRec, RawFileRec,
};
use super::definitions::{Cnid, CNID_CATALOG, CNID_ROOT_PARENT};
use super::error::{Error, Result};
use super::extent::{chase_overflow, fork_reader, OverflowMap};
use super::hfs_btree::leaf_records;
use super::macroman;
use super::mdb::Mdb;
use super::multi::MultiReaderAt;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::utils::mac_time;
use super::vfs::{ReadAt, SysHandle};

struct DirEnt {
    parent: Cnid,
    name: String,
    rec: RawDirRec,
}

struct FileEnt {
    parent: Cnid,
    name: String,
    rec: RawFileRec,
}

/// A Mac filename, translated and made path-safe: Mac Roman to UTF-8,
/// with `/` (legal on HFS) swapped for `:` (illegal there).
fn mac_name(raw: &[u8]) -> String {
    macroman::decode(raw).replace('/', ":")
}

/// Files get listed in on-disk order, after the directories.
const FILE_ORDER_BASE: i64 = 1 << 32;

/// Parse an HFS volume into a filesystem.
pub fn new_hfs(disk: Arc<dyn ReadAt>, disk_size: u64) -> Result<Arc<FsSkeleton>> {
    let mdb = Mdb::read(&disk, disk_size)?;
    let alloc = mdb.allocation();
    debug!(
        "hfs volume {:?}: {} blocks of {}",
        mdb.volume_name().unwrap_or_default(),
        mdb.dr_nm_al_blks,
        mdb.dr_al_blk_siz
    );

    // The overflow tree is opened from the MDB's three inline extents
    // alone; its own extents are assumed never to overflow.
    let xt_blocks = u64::from(mdb.dr_xt_fl_size).div_ceil(u64::from(alloc.block_size));
    if u64::from(mdb.dr_xt_ext_rec.blocks()) < xt_blocks {
        return Err(Error::BadHeader("extents overflow file spills itself".into()));
    }
    let (xt_reader, _) = fork_reader(
        &disk,
        &alloc,
        &mdb.dr_xt_ext_rec.0,
        u64::from(mdb.dr_xt_fl_size),
    );
    let mut overflow = OverflowMap::new();
    for rec in leaf_records(&xt_reader, u64::from(mdb.dr_xt_fl_size))? {
        if let Some((key, val)) = parse_overflow_record(&rec)? {
            overflow.insert(key, val);
        }
    }

    let ct_blocks = u32::try_from(
        u64::from(mdb.dr_ct_fl_size).div_ceil(u64::from(alloc.block_size)),
    )
    .map_err(|_| Error::BadHeader("catalog size".into()))?;
    let ct_extents =
        chase_overflow(&mdb.dr_ct_ext_rec, &overflow, CNID_CATALOG, false, ct_blocks)?;
    let (ct_reader, _) = fork_reader(&disk, &alloc, &ct_extents, u64::from(mdb.dr_ct_fl_size));

    // First pass: collect records.  A child may precede its parent in
    // key order, so nothing is emitted yet.
    let mut dirs: Vec<DirEnt> = Vec::new();
    let mut files: Vec<FileEnt> = Vec::new();
    for rec in leaf_records(&ct_reader, u64::from(mdb.dr_ct_fl_size))? {
        match parse_catalog_record(&rec)? {
            CatalogRecord::Dir { parent, name, rec } => {
                dirs.push(DirEnt { parent, name: mac_name(&name), rec })
            }
            CatalogRecord::File { parent, name, rec } => {
                files.push(FileEnt { parent, name: mac_name(&name), rec })
            }
            CatalogRecord::Thread => {}
        }
    }
    debug!("hfs catalog: {} directories, {} files", dirs.len(), files.len());

    // Second pass: resolve full paths by walking down from the root.
    let mut children: HashMap<Cnid, Vec<usize>> = HashMap::new();
    for (i, d) in dirs.iter().enumerate() {
        children.entry(d.parent).or_default().push(i);
    }
    let mut paths: HashMap<Cnid, String> = HashMap::new();
    let mut dir_order: Vec<usize> = Vec::new();
    let mut stack: Vec<(Cnid, String)> = vec![(CNID_ROOT_PARENT, String::new())];
    while let Some((cnid, prefix)) = stack.pop() {
        for &i in children.get(&cnid).map(Vec::as_slice).unwrap_or_default() {
            let d = &dirs[i];
            let path = if prefix.is_empty() {
                d.name.clone()
            } else {
                format!("{prefix}/{}", d.name)
            };
            if paths.insert(d.rec.dir_dir_id, path.clone()).is_some() {
                return Err(Error::BadHeader(format!(
                    "directory cnid {} appears twice",
                    d.rec.dir_dir_id
                )));
            }
            dir_order.push(i);
            stack.push((d.rec.dir_dir_id, path));
        }
    }

    let skel = Arc::new(FsSkeleton::new());
    for (order, &i) in dir_order.iter().enumerate() {
        let d = &dirs[i];
        let path = &paths[&d.rec.dir_dir_id];
        let mtime = mac_time(d.rec.dir_md_dat);
        skel.create_dir(
            path,
            NodeAttrs {
                mode: 0o755,
                mtime,
                sys: SysHandle::Catalog { cnid: d.rec.dir_dir_id, resource: false },
                order: order as i64,
            },
        )?;

        // Directories carry a metadata-only sidecar.
        let mut meta = AppleDoubleMeta::default();
        meta.finder = d.rec.finder32();
        meta.create_time = d.rec.dir_cr_dat;
        meta.mod_time = d.rec.dir_md_dat;
        meta.backup_time = d.rec.dir_bk_dat;
        meta.access_time = d.rec.dir_md_dat;
        let header = appledouble::synthesize(&meta, 0, Layout::Compact);
        let size = header.len() as u64;
        skel.create_file_random(
            &sidecar_path(path),
            Arc::new(header),
            size,
            NodeAttrs {
                mode: 0o644,
                mtime,
                sys: SysHandle::Catalog { cnid: d.rec.dir_dir_id, resource: true },
                order: order as i64,
            },
        )?;
    }

    // Files are created in physical disk order: sort on the byte offset
    // of the first data extent.
    let mut file_order: Vec<(u64, usize)> = files
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let off = f
                .rec
                .fil_ext_rec
                .0
                .first()
                .filter(|e| e.count > 0)
                .map(|e| alloc.byte_of(e.start))
                .unwrap_or(0);
            (off, i)
        })
        .collect();
    file_order.sort();

    for &(phys_off, i) in &file_order {
        let f = &files[i];
        let cnid = f.rec.fil_fl_num;
        let dir_path = match f.parent {
            p if p == CNID_ROOT_PARENT => {
                return Err(Error::BadHeader("file at the volume root".into()))
            }
            p => paths
                .get(&p)
                .ok_or_else(|| Error::BadHeader(format!("file {} has no parent dir", f.name)))?,
        };
        let path = format!("{dir_path}/{}", f.name);
        let mtime = mac_time(f.rec.fil_md_dat);
        let mode = if f.rec.locked() { 0o444 } else { 0o644 };

        let data_len = u64::from(f.rec.fil_lg_len);
        let data_blocks = u32::try_from(data_len.div_ceil(u64::from(alloc.block_size)))
            .map_err(|_| Error::BadHeader("data fork size".into()))?;
        let data_ext = chase_overflow(&f.rec.fil_ext_rec, &overflow, cnid, false, data_blocks)?;
        let (data_reader, _) = fork_reader(&disk, &alloc, &data_ext, data_len);
        skel.create_file_random(
            &path,
            data_reader,
            data_len,
            NodeAttrs {
                mode,
                mtime,
                sys: SysHandle::Catalog { cnid, resource: false },
                order: FILE_ORDER_BASE + phys_off as i64,
            },
        )?;

        // The sidecar: an AppleDouble header followed by the raw
        // resource fork.
        let rsrc_len = u64::from(f.rec.fil_r_lg_len);
        let rsrc_blocks = u32::try_from(rsrc_len.div_ceil(u64::from(alloc.block_size)))
            .map_err(|_| Error::BadHeader("resource fork size".into()))?;
        let rsrc_ext = chase_overflow(&f.rec.fil_r_ext_rec, &overflow, cnid, true, rsrc_blocks)?;
        let (rsrc_reader, _) = fork_reader(&disk, &alloc, &rsrc_ext, rsrc_len);

        let mut meta = AppleDoubleMeta::default();
        meta.finder = f.rec.finder32();
        meta.create_time = f.rec.fil_cr_dat;
        meta.mod_time = f.rec.fil_md_dat;
        meta.backup_time = f.rec.fil_bk_dat;
        meta.access_time = f.rec.fil_md_dat;
        meta.locked = f.rec.locked();
        let header = appledouble::synthesize(&meta, rsrc_len, Layout::Compact);
        let header_len = header.len() as u64;
        let sidecar = Arc::new(MultiReaderAt::new(vec![
            (Arc::new(header) as Arc<dyn ReadAt>, header_len),
            (rsrc_reader, rsrc_len),
        ]));
        skel.create_file_random(
            &sidecar_path(&path),
            sidecar,
            header_len + rsrc_len,
            NodeAttrs {
                mode,
                mtime,
                sys: SysHandle::Catalog { cnid, resource: true },
                order: FILE_ORDER_BASE + phys_off as i64,
            },
        )?;
    }

    skel.no_more();
    Ok(skel)
}

fn sidecar_path(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => format!("{}/._{}", &path[..i], &path[i + 1..]),
        None => format!("._{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_naming() {
        assert_eq!(sidecar_path("HD/a.txt"), "HD/._a.txt");
        assert_eq!(sidecar_path("HD"), "._HD");
    }

    #[test]
    fn slash_in_mac_names_becomes_colon() {
        assert_eq!(mac_name(b"Notes 1/2"), "Notes 1:2");
    }

    // Whole-volume parsing is exercised against synthesized images in
    // tests/integration.rs.
}
