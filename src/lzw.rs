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

//! The LZC fork codec: compress(1)-style LZW with 9- to 14-bit codes,
//! packed LSB first, code 256 clearing the table.
//!
//! Rendered as a [`Stepper`] so seeks replay from the nearest checkpoint
//! instead of the stream head: each step carries a full snapshot of the
//! string table and bit position.

use std::sync::Arc;

use super::error::{Error, Result};
use super::stepper::{StepEnd, StepOutcome, Stepper};
use super::vfs::ReadAt;

const CLEAR: u32 = 256;
const FIRST: u32 = 257;
const MAX_WIDTH: u32 = 14;
const CHUNK: usize = 64 * 1024;

/// A table entry for codes >= 257: the prefix code plus one byte.
#[derive(Clone, Copy)]
struct Entry {
    prev: u32,
    byte: u8,
}

/// Least-significant-bit-first reader over a byte range.
struct BitReader<'a> {
    src: &'a dyn ReadAt,
    start: u64,
    len: u64,
    bit_pos: u64,
    buf: Vec<u8>,
    buf_off: u64,
}

impl<'a> BitReader<'a> {
    fn new(src: &'a dyn ReadAt, start: u64, len: u64, bit_pos: u64) -> BitReader<'a> {
        BitReader { src, start, len, bit_pos, buf: Vec::new(), buf_off: 0 }
    }

    fn byte(&mut self, idx: u64) -> Result<u8> {
        if idx < self.buf_off || idx >= self.buf_off + self.buf.len() as u64 {
            let want = usize::try_from((self.len - idx).min(4096)).unwrap();
            let mut buf = vec![0u8; want];
            let n = self.src.read_at(&mut buf, self.start + idx)?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            buf.truncate(n);
            self.buf = buf;
            self.buf_off = idx;
        }
        Ok(self.buf[(idx - self.buf_off) as usize])
    }

    /// The next `width`-bit code, or None once the input has fewer bits
    /// left than one code.
    fn code(&mut self, width: u32) -> Result<Option<u32>> {
        if self.bit_pos + u64::from(width) > self.len * 8 {
            return Ok(None);
        }
        let mut v = 0u32;
        for i in 0..width {
            let byte = self.byte(self.bit_pos / 8)?;
            let bit = (byte >> (self.bit_pos % 8)) & 1;
            v |= u32::from(bit) << i;
            self.bit_pos += 1;
        }
        Ok(Some(v))
    }
}

pub struct Lzw {
    src: Arc<dyn ReadAt>,
    src_off: u64,
    src_len: u64,
    total_out: u64,
    // decoder snapshot
    bit_pos: u64,
    width: u32,
    dict: Arc<Vec<Entry>>,
    prev: Option<u32>,
    emitted: u64,
}

impl Lzw {
    pub fn new(src: Arc<dyn ReadAt>, src_off: u64, src_len: u64, total_out: u64) -> Arc<Lzw> {
        Arc::new(Lzw {
            src,
            src_off,
            src_len,
            total_out,
            bit_pos: 0,
            width: 9,
            dict: Arc::new(Vec::new()),
            prev: None,
            emitted: 0,
        })
    }

    /// Append the expansion of `code` to `out`.  Returns the first byte of
    /// the expansion, needed for the next table entry.
    fn expand(dict: &[Entry], code: u32, out: &mut Vec<u8>) -> Result<u8> {
        let mark = out.len();
        let mut c = code;
        loop {
            if c < 256 {
                out.push(c as u8);
                break;
            }
            let e = dict
                .get((c - FIRST) as usize)
                .ok_or_else(|| Error::BadHeader(format!("lzw code {c} out of range")))?;
            out.push(e.byte);
            c = e.prev;
            if out.len() - mark > (1 << MAX_WIDTH) {
                return Err(Error::Unrecoverable("lzw expansion cycle".into()));
            }
        }
        out[mark..].reverse();
        Ok(out[mark])
    }
}

impl Stepper for Lzw {
    fn step(&self) -> StepOutcome {
        let mut dict: Vec<Entry> = (*self.dict).clone();
        let mut bits = BitReader::new(&self.src, self.src_off, self.src_len, self.bit_pos);
        let mut width = self.width;
        let mut prev = self.prev;
        let mut out = Vec::with_capacity(CHUNK);

        let fatal = |e: Error| StepOutcome { next: None, chunk: Vec::new(), end: StepEnd::Fatal(e) };

        while self.emitted + (out.len() as u64) < self.total_out && out.len() < CHUNK {
            let code = match bits.code(width) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    // Input ran dry.  Fine exactly at the declared output
                    // size, an error anywhere before it.
                    if self.emitted + out.len() as u64 == self.total_out {
                        break;
                    }
                    return fatal(Error::Truncated);
                }
                Err(e) => return fatal(e),
            };

            if code == CLEAR {
                dict.clear();
                width = 9;
                prev = None;
                continue;
            }

            let next_code = FIRST + dict.len() as u32;
            let first = if code < 256 || code < next_code {
                match Lzw::expand(&dict, code, &mut out) {
                    Ok(f) => f,
                    Err(e) => return fatal(e),
                }
            } else if code == next_code {
                // The KwKwK case: the string is prev's expansion plus its
                // own first byte.
                let Some(p) = prev else {
                    return fatal(Error::BadHeader("lzw stream starts mid-table".into()));
                };
                let f = match Lzw::expand(&dict, p, &mut out) {
                    Ok(f) => f,
                    Err(e) => return fatal(e),
                };
                out.push(f);
                f
            } else {
                return fatal(Error::BadHeader(format!("lzw code {code} from the future")));
            };

            if let Some(p) = prev {
                if FIRST + (dict.len() as u32) < (1 << MAX_WIDTH) {
                    dict.push(Entry { prev: p, byte: first });
                    // Early change: this table trails the compressor's by
                    // one entry, so the code width grows one code sooner.
                    if FIRST + dict.len() as u32 == (1 << width) - 1 && width < MAX_WIDTH {
                        width += 1;
                    }
                }
            }
            prev = Some(code);
        }

        // Trim overshoot: the last expansion may step past the fork size.
        let want = (self.total_out - self.emitted).min(out.len() as u64) as usize;
        let overshoot = out.split_off(want);
        let emitted = self.emitted + out.len() as u64;
        let at_end = emitted >= self.total_out;
        if !overshoot.is_empty() && !at_end {
            return fatal(Error::Unrecoverable("lzw trim invariant".into()));
        }

        StepOutcome {
            next: (!at_end).then(|| {
                Arc::new(Lzw {
                    src: self.src.clone(),
                    src_off: self.src_off,
                    src_len: self.src_len,
                    total_out: self.total_out,
                    bit_pos: bits.bit_pos,
                    width,
                    dict: Arc::new(dict),
                    prev,
                    emitted,
                }) as Arc<dyn Stepper>
            }),
            chunk: out,
            end: if at_end { StepEnd::Eof } else { StepEnd::More },
        }
    }
}
