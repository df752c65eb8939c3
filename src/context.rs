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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;

use super::spinner::Spinner;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Spinner block size.
    pub block_size: usize,
    /// Byte budget for the spinner's block cache.
    pub cache_bytes: u64,
    /// How many decompressor streams may stay open at once.
    pub max_streams: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            block_size: 128 * 1024,
            cache_bytes: 1 << 30,
            max_streams: 64,
        }
    }
}

/// Everything stateful that the mount tree shares: the spinner with its
/// caches, the decompression chunk cache, and the stream-id well.  Owned,
/// not global, so tests can run independent instances side by side.
pub struct SystemContext {
    spinner: Spinner,
    /// Decoded chunks of checkpointed decompressors, keyed
    /// `(stream id, chunk offset)`.
    pub(crate) chunks: Cache<(u64, u64), Arc<Vec<u8>>>,
    next_stream: AtomicU64,
}

impl SystemContext {
    pub fn new(cfg: Config) -> Arc<SystemContext> {
        let chunks = Cache::builder()
            .max_capacity(cfg.cache_bytes / 2)
            .weigher(|_k: &(u64, u64), v: &Arc<Vec<u8>>| {
                u32::try_from(v.len()).unwrap_or(u32::MAX).max(1)
            })
            .build();
        Arc::new(SystemContext {
            spinner: Spinner::new(&cfg),
            chunks,
            next_stream: AtomicU64::new(1),
        })
    }

    pub fn with_defaults() -> Arc<SystemContext> {
        SystemContext::new(Config::default())
    }

    pub fn spinner(&self) -> &Spinner {
        &self.spinner
    }

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }
}
