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
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use super::definitions::FsId;

/// A deduplicated relative path.  Copies are cheap and equality is by
/// identity, which holds process-wide because the backing table is global.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InternedPath(u32);

struct InternTable {
    by_str: HashMap<&'static str, u32>,
    by_id: Vec<&'static str>,
}

// The one deliberate process-wide table: InternedPath equality must hold
// across SystemContexts, so the ids cannot be context-scoped.
static TABLE: OnceLock<Mutex<InternTable>> = OnceLock::new();

fn table() -> &'static Mutex<InternTable> {
    TABLE.get_or_init(|| {
        Mutex::new(InternTable {
            by_str: HashMap::new(),
            by_id: Vec::new(),
        })
    })
}

impl InternedPath {
    pub fn get(path: &str) -> InternedPath {
        let mut t = table().lock().unwrap();
        if let Some(&id) = t.by_str.get(path) {
            return InternedPath(id);
        }
        let leaked: &'static str = Box::leak(path.to_string().into_boxed_str());
        let id = u32::try_from(t.by_id.len()).expect("interning table overflow");
        t.by_id.push(leaked);
        t.by_str.insert(leaked, id);
        InternedPath(id)
    }

    pub fn as_str(self) -> &'static str {
        table().lock().unwrap().by_id[self.0 as usize]
    }
}

/// The stable identity of one file within one sub-filesystem; the key for
/// every spinner and block-cache lookup.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PathKey {
    pub fs: FsId,
    pub path: InternedPath,
}

impl PathKey {
    pub fn new(fs: FsId, path: &str) -> PathKey {
        PathKey { fs, path: InternedPath::get(path) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let a = InternedPath::get("some/long/path.bin");
        let b = InternedPath::get("some/long/path.bin");
        let c = InternedPath::get("some/other/path.bin");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "some/long/path.bin");
    }

    #[test]
    fn keys_differ_by_fs() {
        let f1 = FsId::next();
        let f2 = FsId::next();
        assert_ne!(PathKey::new(f1, "x"), PathKey::new(f2, "x"));
        assert_eq!(PathKey::new(f1, "x"), PathKey::new(f1, "x"));
    }
}
