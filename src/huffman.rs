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

//! The classic StuffIt Huffman fork codec.
//!
//! The code tree is serialized at the head of the fork, most significant
//! bit first: a 1 bit introduces a leaf followed by its literal byte, a 0
//! bit an interior node followed by its left and right subtrees.  Symbol
//! bits follow immediately after the tree.

use std::sync::Arc;

use super::error::{Error, Result};
use super::stepper::{StepEnd, StepOutcome, Stepper};
use super::vfs::ReadAt;

const CHUNK: usize = 64 * 1024;
const MAX_DEPTH: u32 = 300;

#[derive(Clone, Copy)]
enum Node {
    Leaf(u8),
    /// Indices into the node arena.
    Branch(u32, u32),
}

/// Most-significant-bit-first reader over a byte range.
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

    fn bit(&mut self) -> Result<u8> {
        if self.bit_pos >= self.len * 8 {
            return Err(Error::Truncated);
        }
        let idx = self.bit_pos / 8;
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
        let byte = self.buf[(idx - self.buf_off) as usize];
        let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
        self.bit_pos += 1;
        Ok(bit)
    }

    fn byte(&mut self) -> Result<u8> {
        let mut v = 0u8;
        for _ in 0..8 {
            v = (v << 1) | self.bit()?;
        }
        Ok(v)
    }
}

pub struct Huffman {
    src: Arc<dyn ReadAt>,
    src_off: u64,
    src_len: u64,
    total_out: u64,
    tree: Arc<Vec<Node>>,
    /// Root index; the serialized tree is emitted children-first below.
    root: u32,
    // decoder snapshot
    bit_pos: u64,
    emitted: u64,
}

fn parse_tree(bits: &mut BitReader, arena: &mut Vec<Node>, depth: u32) -> Result<u32> {
    if depth > MAX_DEPTH {
        return Err(Error::BadHeader("huffman tree too deep".into()));
    }
    if bits.bit()? == 1 {
        let byte = bits.byte()?;
        arena.push(Node::Leaf(byte));
    } else {
        let left = parse_tree(bits, arena, depth + 1)?;
        let right = parse_tree(bits, arena, depth + 1)?;
        arena.push(Node::Branch(left, right));
    }
    Ok(arena.len() as u32 - 1)
}

impl Huffman {
    pub fn new(
        src: Arc<dyn ReadAt>,
        src_off: u64,
        src_len: u64,
        total_out: u64,
    ) -> Result<Arc<Huffman>> {
        let mut bits = BitReader::new(&src, src_off, src_len, 0);
        let mut arena = Vec::new();
        let root = parse_tree(&mut bits, &mut arena, 0)?;
        let bit_pos = bits.bit_pos;
        Ok(Arc::new(Huffman {
            src,
            src_off,
            src_len,
            total_out,
            tree: Arc::new(arena),
            root,
            bit_pos,
            emitted: 0,
        }))
    }
}

impl Stepper for Huffman {
    fn step(&self) -> StepOutcome {
        let mut bits = BitReader::new(&self.src, self.src_off, self.src_len, self.bit_pos);
        let mut out = Vec::with_capacity(CHUNK);

        while self.emitted + (out.len() as u64) < self.total_out && out.len() < CHUNK {
            let mut node = self.tree[self.root as usize];
            loop {
                match node {
                    Node::Leaf(b) => {
                        out.push(b);
                        break;
                    }
                    Node::Branch(l, r) => {
                        let bit = match bits.bit() {
                            Ok(b) => b,
                            Err(e) => {
                                return StepOutcome {
                                    next: None,
                                    chunk: Vec::new(),
                                    end: StepEnd::Fatal(e),
                                }
                            }
                        };
                        let idx = if bit == 0 { l } else { r };
                        node = self.tree[idx as usize];
                    }
                }
            }
        }

        let emitted = self.emitted + out.len() as u64;
        let at_end = emitted >= self.total_out;
        StepOutcome {
            next: (!at_end).then(|| {
                Arc::new(Huffman {
                    src: self.src.clone(),
                    src_off: self.src_off,
                    src_len: self.src_len,
                    total_out: self.total_out,
                    tree: self.tree.clone(),
                    root: self.root,
                    bit_pos: bits.bit_pos,
                    emitted,
                }) as Arc<dyn Stepper>
            }),
            chunk: out,
            end: if at_end { StepEnd::Eof } else { StepEnd::More },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    struct BitWriter {
        out: Vec<u8>,
        bit_pos: usize,
    }

    impl BitWriter {
        fn new() -> BitWriter {
            BitWriter { out: Vec::new(), bit_pos: 0 }
        }

        fn bit(&mut self, b: u8) {
            if self.bit_pos / 8 >= self.out.len() {
                self.out.push(0);
            }
            if b != 0 {
                self.out[self.bit_pos / 8] |= 1 << (7 - self.bit_pos % 8);
            }
            self.bit_pos += 1;
        }

        fn byte(&mut self, v: u8) {
            for i in (0..8).rev() {
                self.bit((v >> i) & 1);
            }
        }
    }

    /// Encode with a balanced tree over the distinct bytes: serialized
    /// tree first, then the symbol stream.  Only a test vector builder.
    pub fn compress(data: &[u8]) -> Vec<u8> {
        let mut distinct: Vec<u8> = {
            let mut seen = [false; 256];
            for &b in data {
                seen[b as usize] = true;
            }
            (0u16..256).filter(|&b| seen[b as usize]).map(|b| b as u8).collect()
        };
        if distinct.is_empty() {
            distinct.push(0);
        }
        if distinct.len() == 1 {
            // Keep the decoder honest: always at least one branch.
            let extra = distinct[0].wrapping_add(1);
            distinct.push(extra);
            distinct.sort_unstable();
        }

        let mut w = BitWriter::new();
        let mut codes: HashMap<u8, Vec<u8>> = HashMap::new();
        fn emit(
            set: &[u8],
            prefix: &mut Vec<u8>,
            w: &mut BitWriter,
            codes: &mut HashMap<u8, Vec<u8>>,
        ) {
            if set.len() == 1 {
                w.bit(1);
                w.byte(set[0]);
                codes.insert(set[0], prefix.clone());
            } else {
                w.bit(0);
                let mid = set.len() / 2;
                prefix.push(0);
                emit(&set[..mid], prefix, w, codes);
                prefix.pop();
                prefix.push(1);
                emit(&set[mid..], prefix, w, codes);
                prefix.pop();
            }
        }
        emit(&distinct, &mut Vec::new(), &mut w, &mut codes);

        for &b in data {
            for &bit in &codes[&b] {
                w.bit(bit);
            }
        }
        w.out
    }

    fn decode_all(packed: &[u8], total: u64) -> Result<Vec<u8>> {
        let src: Arc<dyn ReadAt> = Arc::new(packed.to_vec());
        let mut stepper: Arc<dyn Stepper> =
            Huffman::new(src, 0, packed.len() as u64, total)?;
        let mut out = Vec::new();
        loop {
            let o = stepper.step();
            match o.end {
                StepEnd::Fatal(e) => return Err(e),
                StepEnd::More => {
                    out.extend_from_slice(&o.chunk);
                    stepper = o.next.expect("More without next");
                }
                StepEnd::Eof => {
                    out.extend_from_slice(&o.chunk);
                    return Ok(out);
                }
            }
        }
    }

    #[test]
    fn round_trips_text() {
        let text = b"it was the best of times, it was the worst of times";
        let packed = compress(text);
        assert_eq!(decode_all(&packed, text.len() as u64).unwrap(), text);
    }

    #[test]
    fn round_trips_all_byte_values() {
        let data: Vec<u8> = (0u16..256).map(|b| b as u8).cycle().take(2000).collect();
        let packed = compress(&data);
        assert_eq!(decode_all(&packed, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn single_symbol_input() {
        let data = vec![b'x'; 300];
        let packed = compress(&data);
        assert_eq!(decode_all(&packed, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn truncated_symbol_stream_fails() {
        let data = vec![3u8, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9, 3];
        let packed = compress(&data);
        let cut = &packed[..packed.len() - 1];
        assert!(matches!(
            decode_all(cut, data.len() as u64),
            Err(Error::Truncated)
        ));
    }
}
