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

//! Checkpointed random access over stateful decoders.
//!
//! A [`Stepper`] is a decoder frozen between chunks: calling [`step`]
//! decodes the next chunk and hands back the decoder frozen after it.
//! Steppers are deterministic, so a chunk evicted from the cache can be
//! re-derived by re-invoking the checkpoint that produced it.
//!
//! [`step`]: Stepper::step

use std::sync::{Arc, RwLock};

use super::context::SystemContext;
use super::error::{Error, Result};
use super::vfs::ReadAt;

pub enum StepEnd {
    /// More chunks follow.
    More,
    /// This chunk is the last one.
    Eof,
    /// The stream is unusable from here on.
    Fatal(Error),
}

pub struct StepOutcome {
    /// The decoder frozen after this chunk; None at end of stream.
    pub next: Option<Arc<dyn Stepper>>,
    pub chunk: Vec<u8>,
    pub end: StepEnd,
}

pub trait Stepper: Send + Sync {
    fn step(&self) -> StepOutcome;
}

struct Checkpoint {
    offset: u64,
    stepper: Arc<dyn Stepper>,
    /// Set once stepping here failed; nothing is ever recorded to the
    /// right of a terminal checkpoint.
    terminal: Option<Error>,
}

/// A [`ReadAt`] with a declared size over a chain of steppers.
///
/// Checkpoints (strictly increasing by offset) are kept forever; decoded
/// chunks live in the context's cache and are re-derived on miss.
pub struct StepperReader {
    ctx: Arc<SystemContext>,
    id: u64,
    size: u64,
    checkpoints: RwLock<Vec<Checkpoint>>,
}

impl StepperReader {
    pub fn new(ctx: Arc<SystemContext>, seed: Arc<dyn Stepper>, size: u64) -> StepperReader {
        let id = ctx.next_stream_id();
        StepperReader {
            ctx,
            id,
            size,
            checkpoints: RwLock::new(vec![Checkpoint {
                offset: 0,
                stepper: seed,
                terminal: None,
            }]),
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The chunk starting at checkpoints[idx], from cache or by stepping.
    /// Returns `(chunk offset, chunk, more)` where `more` is false once
    /// the stream is known to end with this chunk.
    fn chunk_at(&self, idx: usize) -> Result<(u64, Arc<Vec<u8>>, bool)> {
        let (cp_off, stepper) = {
            let cps = self.checkpoints.read().unwrap();
            // A concurrent fatal step may have truncated the list.
            let cp = cps.get(idx).ok_or(Error::Truncated)?;
            if let Some(e) = &cp.terminal {
                return Err(e.duplicate());
            }
            (cp.offset, cp.stepper.clone())
        };

        if let Some(chunk) = self.ctx.chunks.get(&(self.id, cp_off)) {
            let more = self.checkpoints.read().unwrap().len() > idx + 1;
            return Ok((cp_off, chunk, more));
        }

        let outcome = stepper.step();
        if let StepEnd::Fatal(e) = outcome.end {
            let mut cps = self.checkpoints.write().unwrap();
            // Drop anything speculatively recorded to the right.
            if cps.len() > idx {
                cps.truncate(idx + 1);
                cps[idx].terminal = Some(e.duplicate());
            }
            return Err(e);
        }

        let chunk = Arc::new(outcome.chunk);
        let mut more = false;
        if let (Some(next), StepEnd::More) = (outcome.next, &outcome.end) {
            let next_off = cp_off + chunk.len() as u64;
            let mut cps = self.checkpoints.write().unwrap();
            match cps.last() {
                Some(last) if last.offset >= next_off => {
                    // A concurrent reader got here first; lengths are
                    // stable, so the existing checkpoint is the same one.
                }
                _ => cps.push(Checkpoint { offset: next_off, stepper: next, terminal: None }),
            }
            more = true;
        }
        // The successor checkpoint must exist before the chunk becomes
        // visible, or a concurrent cache hit would misread end-of-stream.
        self.ctx.chunks.insert((self.id, cp_off), chunk.clone());
        Ok((cp_off, chunk, more))
    }
}

impl ReadAt for StepperReader {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        if off >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let end = (off + buf.len() as u64).min(self.size);
        let mut done = 0usize;

        let mut idx = {
            let cps = self.checkpoints.read().unwrap();
            cps.partition_point(|c| c.offset <= off) - 1
        };

        loop {
            let pos = off + done as u64;
            let (cp_off, chunk, more) = match self.chunk_at(idx) {
                Ok(v) => v,
                Err(e) => {
                    // Hand back what was already decoded; the error
                    // resurfaces on the next call.
                    return if done > 0 { Ok(done) } else { Err(e) };
                }
            };
            let chunk_end = cp_off + chunk.len() as u64;

            if pos < chunk_end && pos >= cp_off {
                let src = (pos - cp_off) as usize;
                let n = ((chunk_end.min(end)) - pos) as usize;
                buf[done..done + n].copy_from_slice(&chunk[src..src + n]);
                done += n;
            }
            if off + done as u64 >= end {
                return Ok(done);
            }
            if !more {
                // The declared size overstated the stream; report short.
                return Ok(done);
            }
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, SystemContext};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Emits `total` counting bytes in `chunk` sized pieces and counts
    /// every invocation, so tests can watch checkpoint reuse.
    struct Counting {
        start: u64,
        total: u64,
        chunk: usize,
        steps: Arc<AtomicU64>,
    }

    impl Stepper for Counting {
        fn step(&self) -> StepOutcome {
            self.steps.fetch_add(1, Ordering::SeqCst);
            let n = (self.total - self.start).min(self.chunk as u64) as usize;
            let chunk: Vec<u8> = (self.start..self.start + n as u64)
                .map(|i| (i % 249) as u8)
                .collect();
            let at_end = self.start + n as u64 >= self.total;
            StepOutcome {
                next: (!at_end).then(|| {
                    Arc::new(Counting {
                        start: self.start + n as u64,
                        total: self.total,
                        chunk: self.chunk,
                        steps: self.steps.clone(),
                    }) as Arc<dyn Stepper>
                }),
                chunk,
                end: if at_end { StepEnd::Eof } else { StepEnd::More },
            }
        }
    }

    struct FailsAfter {
        good: Vec<u8>,
    }

    impl Stepper for FailsAfter {
        fn step(&self) -> StepOutcome {
            if self.good.is_empty() {
                StepOutcome {
                    next: None,
                    chunk: Vec::new(),
                    end: StepEnd::Fatal(Error::BadChecksum),
                }
            } else {
                StepOutcome {
                    next: Some(Arc::new(FailsAfter { good: Vec::new() })),
                    chunk: self.good.clone(),
                    end: StepEnd::More,
                }
            }
        }
    }

    fn ctx() -> Arc<SystemContext> {
        SystemContext::new(Config { block_size: 4096, cache_bytes: 1 << 20, max_streams: 4 })
    }

    fn expected(off: u64, len: usize) -> Vec<u8> {
        (off..off + len as u64).map(|i| (i % 249) as u8).collect()
    }

    #[test]
    fn chunked_reads_match_any_partition() {
        let steps = Arc::new(AtomicU64::new(0));
        let seed = Arc::new(Counting { start: 0, total: 1000, chunk: 96, steps: steps.clone() });
        let r = StepperReader::new(ctx(), seed, 1000);

        let mut all = vec![0u8; 1000];
        assert_eq!(r.read_at(&mut all, 0).unwrap(), 1000);
        assert_eq!(all, expected(0, 1000));

        // Any other partition returns the same bytes, all from cache.
        let base = steps.load(Ordering::SeqCst);
        for (off, len) in [(0u64, 17usize), (500, 96), (903, 97), (999, 1), (950, 500)] {
            let mut buf = vec![0u8; len];
            let n = r.read_at(&mut buf, off).unwrap();
            assert_eq!(n, len.min((1000 - off) as usize));
            assert_eq!(&buf[..n], &expected(off, n)[..]);
        }
        assert_eq!(steps.load(Ordering::SeqCst), base);
    }

    #[test]
    fn backward_read_restarts_from_nearest_checkpoint() {
        let steps = Arc::new(AtomicU64::new(0));
        let seed = Arc::new(Counting { start: 0, total: 500, chunk: 100, steps: steps.clone() });
        let r = StepperReader::new(ctx(), seed, 500);

        let mut buf = vec![0u8; 10];
        assert_eq!(r.read_at(&mut buf, 450).unwrap(), 10);
        assert_eq!(buf, expected(450, 10));
        // Decoding 450..460 required walking all five chunks once.
        assert_eq!(steps.load(Ordering::SeqCst), 5);

        // A mid-stream read is one cache hit, zero new steps.
        assert_eq!(r.read_at(&mut buf, 210).unwrap(), 10);
        assert_eq!(buf, expected(210, 10));
        assert_eq!(steps.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn reads_at_bounds() {
        let steps = Arc::new(AtomicU64::new(0));
        let seed = Arc::new(Counting { start: 0, total: 64, chunk: 64, steps });
        let r = StepperReader::new(ctx(), seed, 64);
        let mut buf = [0u8; 8];
        assert_eq!(r.read_at(&mut buf, 64).unwrap(), 0);
        assert_eq!(r.read_at(&mut [], 10).unwrap(), 0);
        assert_eq!(r.read_at(&mut buf, 60).unwrap(), 4);
    }

    #[test]
    fn fatal_error_returns_decoded_prefix_first() {
        let seed = Arc::new(FailsAfter { good: vec![7u8; 50] });
        let r = StepperReader::new(ctx(), seed, 200);

        let mut buf = vec![0u8; 100];
        // First call: the 50 good bytes come back short.
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 50);
        assert_eq!(&buf[..50], &[7u8; 50][..]);
        // Asking past the failure point now surfaces the error.
        assert!(matches!(r.read_at(&mut buf, 50), Err(Error::BadChecksum)));
        // And keeps surfacing it without re-stepping into the decoder.
        assert!(matches!(r.read_at(&mut buf, 60), Err(Error::BadChecksum)));
        // The good prefix stays readable.
        assert_eq!(r.read_at(&mut buf, 10).unwrap(), 40);
    }
}
