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

/// HFS catalog node ID.  Roughly an inode number.
pub type Cnid = u32;

/// Reserved CNIDs: the root folder's parent and the catalog file itself.
pub const CNID_ROOT_PARENT: Cnid = 1;
pub const CNID_CATALOG: Cnid = 4;

/// Seconds between the Mac epoch (1904-01-01T00:00:00Z) and the Unix epoch.
pub const MAC_EPOCH_TO_UNIX: u64 = 2_082_844_800;

/// Seconds between the Mac epoch and the AppleDouble date epoch
/// (2000-01-01T00:00:00Z).
pub const MAC_EPOCH_TO_Y2K: u64 = 3_029_529_600;

/// The in-path character marking "descend into this file as an archive".
pub const MARKER: char = '\u{25c6}'; // ◆

/// A path component disabling mount-point synthesis at and below its level.
pub const NO_DEEPER: &str = ".nodeeper";

/// Identity of one mounted sub-filesystem.  Ids are never reused within a
/// process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FsId(u64);

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

impl FsId {
    pub fn next() -> FsId {
        FsId(NEXT_FS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}
