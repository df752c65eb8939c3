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

/// Several bounded readers concatenated into one logical stream.
///
/// Used wherever a file is assembled from pieces: an AppleDouble header
/// ahead of its resource fork, or an HFS fork split across extents.
pub struct MultiReaderAt {
    parts: Vec<(Arc<dyn ReadAt>, u64)>,
    /// starts[i] is the logical offset of part i; one extra entry holds the
    /// total length.
    starts: Vec<u64>,
}

impl MultiReaderAt {
    pub fn new(parts: Vec<(Arc<dyn ReadAt>, u64)>) -> MultiReaderAt {
        let mut starts = Vec::with_capacity(parts.len() + 1);
        let mut total = 0u64;
        for (_, len) in &parts {
            starts.push(total);
            total = total.saturating_add(*len);
        }
        starts.push(total);
        MultiReaderAt { parts, starts }
    }

    pub fn len(&self) -> u64 {
        *self.starts.last().unwrap_or(&0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadAt for MultiReaderAt {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let total = self.len();
        if off >= total || buf.is_empty() {
            return Ok(0);
        }

        // First part whose range touches the request.
        let mut idx = self.starts.partition_point(|&s| s <= off) - 1;
        let mut done = 0usize;
        while done < buf.len() && idx < self.parts.len() {
            let (part, part_len) = &self.parts[idx];
            let part_off = off + done as u64 - self.starts[idx];
            let want = (buf.len() - done)
                .min(usize::try_from(part_len - part_off).unwrap_or(usize::MAX));
            if want == 0 {
                idx += 1;
                continue;
            }
            let n = part.read_at(&mut buf[done..done + want], part_off)?;
            done += n;
            if n < want {
                // The part ran short of its declared length; stop rather
                // than silently splicing the next part earlier.
                break;
            }
            idx += 1;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi() -> MultiReaderAt {
        MultiReaderAt::new(vec![
            (Arc::new(vec![1u8, 2, 3]) as Arc<dyn ReadAt>, 3),
            (Arc::new(Vec::<u8>::new()) as Arc<dyn ReadAt>, 0),
            (Arc::new(vec![4u8, 5]) as Arc<dyn ReadAt>, 2),
            (Arc::new(vec![6u8]) as Arc<dyn ReadAt>, 1),
        ])
    }

    #[test]
    fn reads_across_boundaries() {
        let m = multi();
        assert_eq!(m.len(), 6);
        let mut buf = [0u8; 6];
        assert_eq!(m.read_at(&mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, &[1, 2, 3, 4, 5, 6]);

        let mut buf = [0u8; 3];
        assert_eq!(m.read_at(&mut buf, 2).unwrap(), 3);
        assert_eq!(&buf, &[3, 4, 5]);
    }

    #[test]
    fn reads_at_and_past_end() {
        let m = multi();
        let mut buf = [0u8; 4];
        assert_eq!(m.read_at(&mut buf, 5).unwrap(), 1);
        assert_eq!(buf[0], 6);
        assert_eq!(m.read_at(&mut buf, 6).unwrap(), 0);
        assert_eq!(m.read_at(&mut [], 0).unwrap(), 0);
    }
}
