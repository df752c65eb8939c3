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

//! A read-only filesystem over vintage Macintosh archives and disk
//! images.  Every regular file recognized as a container (StuffIt, ZIP,
//! tar, gzip/bzip2/xz, Apple Partition Map, HFS, resource fork) gains a
//! `name◆` pseudo-directory sibling exposing its contents; dual-fork Mac
//! files surface as AppleDouble `._name` sidecars.

extern crate bincode_next as bincode;

mod apm;
mod appledouble;
mod catalog;
mod compressed;
mod context;
mod definitions;
mod error;
mod extent;
mod hfs;
mod hfs_btree;
mod hostfs;
mod huffman;
mod lzw;
mod macroman;
mod mdb;
mod mount;
mod multi;
mod pathkey;
mod rsrcfork;
mod section;
mod sit5;
mod sit_classic;
mod skeleton;
mod sparse;
mod spinner;
mod stepper;
mod stuffit;
mod tarfs;
mod utils;
mod vfs;
mod zipfs;

pub use context::{Config, SystemContext};
pub use definitions::{FsId, MARKER, NO_DEEPER};
pub use error::{Error, Result};
pub use mount::{Attic, AtticFile, Walk};
pub use pathkey::{InternedPath, PathKey};
pub use vfs::{
    ArchiveFs, DirEntry, FileBody, FileHandle, FileInfo, FileKind, ReadAt, StreamOpener,
    SysHandle,
};

pub use appledouble::{parse as parse_appledouble, synthesize as synthesize_appledouble};
pub use appledouble::{AppleDoubleMeta, Layout as AppleDoubleLayout};
pub use multi::MultiReaderAt;
pub use section::SectionReader;
pub use skeleton::{FsSkeleton, NodeAttrs};
pub use sparse::{SparseExtent, SparseReader};
pub use stepper::{StepEnd, StepOutcome, Stepper, StepperReader};
