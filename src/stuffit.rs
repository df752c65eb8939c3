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

//! StuffIt container dispatch and the pieces both generations share:
//! the fork descriptor, per-fork codec dispatch, and the header CRC.

use std::sync::Arc;

use crc::{Crc, CRC_16_ARC};

use super::context::SystemContext;
use super::error::{Error, Result};
use super::huffman::Huffman;
use super::lzw::Lzw;
use super::section::SectionReader;
use super::sit5;
use super::sit_classic;
use super::skeleton::FsSkeleton;
use super::stepper::StepperReader;
use super::vfs::ReadAt;

pub const CLASSIC_MAGIC_TAIL: &[u8; 4] = b"rLau";
pub const SIT5_MAGIC: &[u8; 16] = b"StuffIt (c)1997-";

#[allow(dead_code)]
pub mod method {
    pub const STORE: u8 = 0;
    pub const LZC: u8 = 2;
    pub const HUFFMAN: u8 = 3;
    pub const SIT13: u8 = 13;
    pub const ARSENIC: u8 = 15;
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// The CRC every StuffIt header and fork uses.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// One fork of one archive member, still compressed.
#[derive(Clone, Copy, Debug)]
pub struct ForkDesc {
    pub method: u8,
    pub packed_off: u64,
    pub packed_len: u64,
    pub unpacked_len: u64,
    /// CRC of the unpacked bytes.  Computed by writers, recorded here,
    /// not enforced on read.
    pub crc: u16,
}

/// A member whose bytes exist but may never be read: every access fails
/// with the password error while stat keeps working.
pub struct PasswordReader;

impl ReadAt for PasswordReader {
    fn read_at(&self, _buf: &mut [u8], _off: u64) -> Result<usize> {
        Err(Error::PasswordRequired)
    }
}

/// Decode one fork into a random-access reader.
///
/// The supported-method set is data: anything outside it fails with the
/// distinguished error before a single payload byte is read, and the
/// caller records the member as a defect entry rather than losing the
/// whole archive.
pub fn fork_body(
    ctx: &Arc<SystemContext>,
    src: &Arc<dyn ReadAt>,
    fork: &ForkDesc,
    protected: bool,
) -> Result<Arc<dyn ReadAt>> {
    if protected {
        // Opening is allowed; reading answers with PasswordRequired.
        return Ok(Arc::new(PasswordReader));
    }
    match fork.method {
        method::STORE => {
            if fork.packed_len < fork.unpacked_len {
                return Err(Error::Truncated);
            }
            Ok(Arc::new(SectionReader::new(
                src.clone(),
                fork.packed_off,
                fork.unpacked_len,
            )))
        }
        method::LZC => {
            let seed = Lzw::new(src.clone(), fork.packed_off, fork.packed_len, fork.unpacked_len);
            Ok(Arc::new(StepperReader::new(ctx.clone(), seed, fork.unpacked_len)))
        }
        method::HUFFMAN => {
            let seed =
                Huffman::new(src.clone(), fork.packed_off, fork.packed_len, fork.unpacked_len)?;
            Ok(Arc::new(StepperReader::new(ctx.clone(), seed, fork.unpacked_len)))
        }
        other => Err(Error::UnsupportedAlgorithm(other)),
    }
}

/// Open a StuffIt archive of either generation.
pub fn new_stuffit(
    ctx: &Arc<SystemContext>,
    src: Arc<dyn ReadAt>,
    size: u64,
) -> Result<Arc<FsSkeleton>> {
    let mut head = [0u8; 16];
    let n = src.read_at(&mut head, 0)?;
    if n >= 16 && &head == SIT5_MAGIC {
        return sit5::new_sit5(ctx, src, size);
    }
    let mut tail = [0u8; 4];
    if n >= 1 && head[0] == b'S' {
        if src.read_at(&mut tail, 10)? == 4 && &tail == CLASSIC_MAGIC_TAIL {
            return sit_classic::new_classic(ctx, src, size);
        }
    }
    Err(Error::BadMagic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_the_arc_polynomial() {
        // The standard check value for CRC-16/ARC.
        assert_eq!(crc16(b"123456789"), 0xBB3D);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn unsupported_methods_fail_before_reading() {
        let ctx = SystemContext::with_defaults();
        let src: Arc<dyn ReadAt> = Arc::new(vec![0u8; 64]);
        for m in [1u8, 5, 13, 15, 200] {
            let fork = ForkDesc {
                method: m,
                packed_off: 0,
                packed_len: 64,
                unpacked_len: 64,
                crc: 0,
            };
            assert!(matches!(
                fork_body(&ctx, &src, &fork, false),
                Err(Error::UnsupportedAlgorithm(x)) if x == m
            ));
        }
    }

    #[test]
    fn protected_forks_open_but_never_read() {
        let ctx = SystemContext::with_defaults();
        let src: Arc<dyn ReadAt> = Arc::new(vec![0u8; 8]);
        let fork = ForkDesc { method: 0, packed_off: 0, packed_len: 8, unpacked_len: 8, crc: 0 };
        let r = fork_body(&ctx, &src, &fork, true).unwrap();
        assert!(matches!(
            r.read_at(&mut [0u8; 4], 0),
            Err(Error::PasswordRequired)
        ));
    }
}
