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
use bincode::Decode;
use byteorder::{BigEndian, ByteOrder};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::definitions::Cnid;
use super::error::{Error, Result};
use super::extent::ExtDataRec;
use super::utils::{decode_or_truncated, round_even};

#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
enum RecordType {
    Directory = 1,
    File = 2,
    DirThread = 3,
    FileThread = 4,
}

/// filFlags bit 0: the file is locked.
const FIL_LOCKED: u8 = 0x01;

/// Directory record value, after the catalog key.
#[derive(Clone, Debug, Decode)]
pub struct RawDirRec {
    _cdr_type: u8,
    _cdr_resrv2: u8,
    _dir_flags: u16,
    _dir_val: u16,
    pub dir_dir_id: u32,
    pub dir_cr_dat: u32,
    pub dir_md_dat: u32,
    pub dir_bk_dat: u32,
    /// DInfo then DXInfo, carried into the AppleDouble sidecar whole.
    pub dir_usr_info: [u8; 16],
    pub dir_fndr_info: [u8; 16],
}

/// File record value, after the catalog key.
#[derive(Clone, Debug, Decode)]
pub struct RawFileRec {
    _cdr_type: u8,
    _cdr_resrv2: u8,
    pub fil_flags: u8,
    _fil_typ: u8,
    /// FInfo: type, creator, finder flags, location, folder.
    pub fil_usr_wds: [u8; 16],
    pub fil_fl_num: u32,
    _fil_st_blk: u16,
    pub fil_lg_len: u32,
    _fil_py_len: u32,
    _fil_r_st_blk: u16,
    pub fil_r_lg_len: u32,
    _fil_r_py_len: u32,
    pub fil_cr_dat: u32,
    pub fil_md_dat: u32,
    pub fil_bk_dat: u32,
    /// FXInfo.
    pub fil_fndr_info: [u8; 16],
    _fil_clp_size: u16,
    pub fil_ext_rec: ExtDataRec,
    pub fil_r_ext_rec: ExtDataRec,
    _fil_resrv: u32,
}

impl RawFileRec {
    pub fn locked(&self) -> bool {
        self.fil_flags & FIL_LOCKED != 0
    }

    /// FInfo and FXInfo concatenated, the 32-byte FINDER_INFO payload.
    pub fn finder32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.fil_usr_wds);
        out[16..].copy_from_slice(&self.fil_fndr_info);
        out
    }
}

impl RawDirRec {
    pub fn finder32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.dir_usr_info);
        out[16..].copy_from_slice(&self.dir_fndr_info);
        out
    }
}

pub enum CatalogRecord {
    Dir { parent: Cnid, name: Vec<u8>, rec: RawDirRec },
    File { parent: Cnid, name: Vec<u8>, rec: RawFileRec },
    /// Thread records only repeat information the tree already carries.
    Thread,
}

/// Split a leaf record into its catalog key and value.
///
/// The key is `[keyLen][reserved][parent CNID: u32][nameLen][name...]`,
/// with the value starting at the even boundary after the key.
fn split_key(raw: &[u8]) -> Result<(Cnid, Vec<u8>, &[u8])> {
    let key_len = usize::from(*raw.first().ok_or(Error::Truncated)?);
    if key_len < 6 || raw.len() < 1 + key_len {
        return Err(Error::BadHeader(format!("catalog key length {key_len}")));
    }
    let parent = BigEndian::read_u32(&raw[2..6]);
    let name_len = usize::from(raw[6]);
    if name_len > key_len - 6 {
        return Err(Error::BadHeader(format!("catalog name length {name_len}")));
    }
    let name = raw[7..7 + name_len].to_vec();
    let value = &raw[round_even(1 + key_len)..];
    Ok((parent, name, value))
}

pub fn parse_catalog_record(raw: &[u8]) -> Result<CatalogRecord> {
    let (parent, name, value) = split_key(raw)?;
    let type_byte = value.first().copied().ok_or(Error::Truncated)?;
    match RecordType::from_u8(type_byte) {
        Some(RecordType::Directory) => {
            let (rec, _) = decode_or_truncated::<RawDirRec>(value)?;
            Ok(CatalogRecord::Dir { parent, name, rec })
        }
        Some(RecordType::File) => {
            let (rec, _) = decode_or_truncated::<RawFileRec>(value)?;
            Ok(CatalogRecord::File { parent, name, rec })
        }
        Some(RecordType::DirThread) | Some(RecordType::FileThread) => Ok(CatalogRecord::Thread),
        None => Err(Error::BadHeader(format!("catalog record type {type_byte}"))),
    }
}

/// An extents-overflow leaf record: key
/// `[keyLen][forkType][CNID: u32][startABN: u16]`, value one ExtDataRec.
/// Returns the map entry, or None for fork types this crate never reads.
pub fn parse_overflow_record(raw: &[u8]) -> Result<Option<((Cnid, u16, bool), ExtDataRec)>> {
    let key_len = usize::from(*raw.first().ok_or(Error::Truncated)?);
    if key_len != 7 || raw.len() < 1 + key_len {
        return Err(Error::BadHeader(format!("overflow key length {key_len}")));
    }
    let resource = match raw[1] {
        0x00 => false,
        0xFF => true,
        _ => return Ok(None),
    };
    let cnid = BigEndian::read_u32(&raw[2..6]);
    let fabn = BigEndian::read_u16(&raw[6..8]);
    let value = &raw[round_even(1 + key_len)..];
    let (rec, _) = decode_or_truncated::<ExtDataRec>(value)?;
    Ok(Some(((cnid, fabn, resource), rec)))
}
