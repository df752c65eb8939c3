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

use super::error::{Error, Result};
use super::extent::{Allocation, ExtDataRec};
use super::macroman;
use super::utils::{decode_or_truncated, pascal_string};
use super::vfs::{read_exact_at, ReadAt};

pub const MDB_OFFSET: u64 = 0x400;
pub const MDB_SIGNATURE: u16 = 0x4244; // 'BD'

/// The Master Directory Block, at byte 0x400 of every HFS volume.
///
/// Field names keep Apple's `dr` prefixes, the way the reference
/// documentation spells them.
#[derive(Clone, Debug, Decode)]
pub struct Mdb {
    pub dr_sig_word:   u16,
    pub dr_cr_date:    u32,
    pub dr_ls_mod:     u32,
    _dr_atrb:          u16,
    _dr_nm_fls:        u16,
    _dr_vbm_st:        u16,
    _dr_alloc_ptr:     u16,
    pub dr_nm_al_blks: u16,
    pub dr_al_blk_siz: u32,
    _dr_clp_siz:       u32,
    pub dr_al_bl_st:   u16,
    _dr_nxt_cnid:      u32,
    _dr_free_bks:      u16,
    dr_vn:             [u8; 28],
    _dr_vol_bk_up:     u32,
    _dr_v_seq_num:     u16,
    _dr_wr_cnt:        u32,
    _dr_xt_clp_siz:    u32,
    _dr_ct_clp_siz:    u32,
    _dr_nm_rt_dirs:    u16,
    _dr_fil_cnt:       u32,
    _dr_dir_cnt:       u32,
    _dr_fndr_info:     [u8; 32],
    _dr_vc_size:       u16,
    _dr_vbm_c_size:    u16,
    _dr_ctl_c_size:    u16,
    pub dr_xt_fl_size: u32,
    pub dr_xt_ext_rec: ExtDataRec,
    pub dr_ct_fl_size: u32,
    pub dr_ct_ext_rec: ExtDataRec,
}

impl Mdb {
    /// Read and validate the MDB.  `disk_size` guards against DiskCopy
    /// compressed images, which keep the magic but not the payload.
    pub fn read(disk: &dyn ReadAt, disk_size: u64) -> Result<Mdb> {
        let mut raw = [0u8; 162];
        read_exact_at(disk, &mut raw, MDB_OFFSET)?;
        let (mdb, _) = decode_or_truncated::<Mdb>(&raw)?;

        if mdb.dr_sig_word != MDB_SIGNATURE {
            return Err(Error::BadMagic);
        }
        if mdb.dr_al_blk_siz == 0 || mdb.dr_al_blk_siz % 512 != 0 {
            return Err(Error::BadHeader(format!(
                "allocation block size {}",
                mdb.dr_al_blk_siz
            )));
        }
        let min_size = u64::from(mdb.dr_al_bl_st) * 512
            + u64::from(mdb.dr_al_blk_siz) * u64::from(mdb.dr_nm_al_blks);
        if disk_size < min_size {
            return Err(Error::Truncated);
        }
        Ok(mdb)
    }

    pub fn allocation(&self) -> Allocation {
        Allocation {
            block_size: self.dr_al_blk_siz,
            first_byte: u64::from(self.dr_al_bl_st) * 512,
        }
    }

    pub fn volume_name(&self) -> Result<String> {
        Ok(macroman::decode(pascal_string(&self.dr_vn, 27)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal MDB image: zeroed except the fields under test.
    fn raw_mdb() -> Vec<u8> {
        let mut disk = vec![0u8; 0x400 + 512];
        let mdb = &mut disk[0x400..];
        mdb[0..2].copy_from_slice(&MDB_SIGNATURE.to_be_bytes());
        mdb[18..20].copy_from_slice(&4u16.to_be_bytes()); // drNmAlBlks
        mdb[20..24].copy_from_slice(&512u32.to_be_bytes()); // drAlBlkSiz
        mdb[28..30].copy_from_slice(&6u16.to_be_bytes()); // drAlBlSt
        mdb[36] = 2; // volume name "HD"
        mdb[37] = b'H';
        mdb[38] = b'D';
        disk
    }

    #[test]
    fn parses_and_validates() {
        let mut disk = raw_mdb();
        disk.resize(6 * 512 + 4 * 512, 0);
        let mdb = Mdb::read(&disk, disk.len() as u64).unwrap();
        assert_eq!(mdb.dr_nm_al_blks, 4);
        assert_eq!(mdb.volume_name().unwrap(), "HD");
        assert_eq!(mdb.allocation().byte_of(1), 6 * 512 + 512);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut disk = raw_mdb();
        disk[0x400] = b'X';
        assert!(matches!(
            Mdb::read(&disk, disk.len() as u64),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn rejects_undersized_image() {
        // Magic intact but the image cannot hold the declared blocks;
        // this is the compressed-DiskCopy shape.
        let disk = raw_mdb();
        assert!(matches!(
            Mdb::read(&disk, disk.len() as u64),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn rejects_unaligned_block_size() {
        let mut disk = raw_mdb();
        disk[0x400 + 20..0x400 + 24].copy_from_slice(&700u32.to_be_bytes());
        assert!(matches!(
            Mdb::read(&disk, disk.len() as u64),
            Err(Error::BadHeader(_))
        ));
    }
}
