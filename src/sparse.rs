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
use std::sync::Arc;

use super::error::Result;
use super::vfs::ReadAt;

/// One run of a sparse file: `len` bytes at logical offset `logical`,
/// backed at `physical` in the underlying reader, or a hole when
/// `physical` is negative.
#[derive(Clone, Copy, Debug)]
pub struct SparseExtent {
    pub logical: u64,
    pub physical: i64,
    pub len: u64,
}

impl SparseExtent {
    pub fn hole(logical: u64, len: u64) -> SparseExtent {
        SparseExtent { logical, physical: -1, len }
    }

    fn is_hole(&self) -> bool {
        self.physical < 0
    }
}

/// Presents an extent list as one contiguous stream.  Holes, explicit or
/// implied by gaps between extents, read as zeros.
pub struct SparseReader {
    inner: Arc<dyn ReadAt>,
    extents: Vec<SparseExtent>,
    size: u64,
}

impl SparseReader {
    pub fn new(inner: Arc<dyn ReadAt>, mut extents: Vec<SparseExtent>) -> SparseReader {
        extents.retain(|e| e.len > 0);
        extents.sort_by_key(|e| e.logical);
        let size = extents
            .last()
            .map(|e| e.logical + e.len)
            .unwrap_or(0);
        SparseReader { inner, extents, size }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl ReadAt for SparseReader {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        if off >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let end = (off + buf.len() as u64).min(self.size);
        let mut done = 0usize;
        let mut pos = off;

        // Extent counts are small in practice; a linear scan beats keeping
        // an index structure coherent.
        for ext in &self.extents {
            if pos >= end {
                break;
            }
            let ext_end = ext.logical + ext.len;
            if ext_end <= pos {
                continue;
            }
            // Gap before this extent reads as zeros.
            if ext.logical > pos {
                let gap = usize::try_from((ext.logical.min(end)) - pos).unwrap();
                buf[done..done + gap].fill(0);
                done += gap;
                pos += gap as u64;
                if pos >= end {
                    break;
                }
            }
            let skip = pos - ext.logical;
            let want = usize::try_from((ext_end.min(end)) - pos).unwrap();
            if ext.is_hole() {
                buf[done..done + want].fill(0);
                done += want;
                pos += want as u64;
            } else {
                let phys = ext.physical as u64 + skip;
                let n = self.inner.read_at(&mut buf[done..done + want], phys)?;
                done += n;
                pos += n as u64;
                if n < want {
                    return Ok(done);
                }
            }
        }
        Ok(done)
    }
}
