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

/// A bounded window `[offset, offset+len)` onto another reader.
///
/// Nested mounts stack these: an HFS file inside a partition inside a disk
/// image is three windows deep.  Construction collapses a window over a
/// window into a single level so the stack never grows with read depth.
pub struct SectionReader {
    inner: Arc<dyn ReadAt>,
    offset: u64,
    len: u64,
}

impl SectionReader {
    pub fn new(inner: Arc<dyn ReadAt>, offset: u64, len: u64) -> SectionReader {
        if let Some((parent, pstart, plen)) = inner.window() {
            if offset.checked_add(len).is_some_and(|end| end <= plen) {
                return SectionReader {
                    inner: parent,
                    offset: pstart + offset,
                    len,
                };
            }
        }
        SectionReader { inner, offset, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ReadAt for SectionReader {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        if off >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(self.len - off).unwrap_or(usize::MAX));
        self.inner.read_at(&mut buf[..want], self.offset + off)
    }

    fn window(&self) -> Option<(Arc<dyn ReadAt>, u64, u64)> {
        Some((self.inner.clone(), self.offset, self.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> Arc<dyn ReadAt> {
        Arc::new((0u8..=255).collect::<Vec<u8>>())
    }

    #[test]
    fn clips_to_window() {
        let s = SectionReader::new(src(), 10, 5);
        let mut buf = [0u8; 8];
        assert_eq!(s.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], &[10, 11, 12, 13, 14]);
        assert_eq!(s.read_at(&mut buf, 5).unwrap(), 0);
        assert_eq!(s.read_at(&mut buf, 3).unwrap(), 2);
        assert_eq!(&buf[..2], &[13, 14]);
    }

    #[test]
    fn nested_sections_flatten() {
        let outer = Arc::new(SectionReader::new(src(), 100, 50));
        let inner = SectionReader::new(outer, 10, 20);
        // The flattened window reads straight from the base source.
        let (parent, start, len) = inner.window().unwrap();
        assert_eq!(start, 110);
        assert_eq!(len, 20);
        let mut one = [0u8; 1];
        assert_eq!(parent.read_at(&mut one, 0).unwrap(), 1);
        assert_eq!(one[0], 0); // base source, not the outer section

        let mut buf = [0u8; 4];
        assert_eq!(inner.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, &[110, 111, 112, 113]);
    }

    #[test]
    fn oversized_window_does_not_flatten() {
        let outer = Arc::new(SectionReader::new(src(), 100, 20));
        // Asks for more than the outer window holds, so it must keep the
        // outer section to preserve its clipping.
        let inner = SectionReader::new(outer, 10, 40);
        let mut buf = [0u8; 40];
        assert_eq!(inner.read_at(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf[..10], &[110, 111, 112, 113, 114, 115, 116, 117, 118, 119]);
    }
}
