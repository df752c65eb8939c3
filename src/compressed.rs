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

//! Single-member compressed streams (gzip, bzip2, xz) as one-file
//! pseudo-filesystems.  The member's size cannot be known without
//! draining the stream, so it is published as -1 and resolved through
//! the spinner on demand.

use std::io::Read;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;

use super::error::Result;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::vfs::{RangeStream, ReadAt, StreamOpener, SysHandle};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
}

pub const GZIP_MAGIC: [u8; 3] = [0x1F, 0x8B, 0x08];
pub const BZIP2_MAGIC: [u8; 3] = *b"BZh";
pub const BZIP2_BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];
pub const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// The name of the decompressed member, from the container's name:
/// `disk.img.gz` holds `disk.img`, `src.tgz` holds `src.tar`.
pub fn member_name(container: &str) -> String {
    for (suffix, replacement) in [
        (".tgz", ".tar"),
        (".tbz", ".tar"),
        (".tbz2", ".tar"),
        (".txz", ".tar"),
    ] {
        if let Some(stem) = container.strip_suffix(suffix) {
            if !stem.is_empty() {
                return format!("{stem}{replacement}");
            }
        }
    }
    for suffix in [".gz", ".bz2", ".xz", ".z", ".Z"] {
        if let Some(stem) = container.strip_suffix(suffix) {
            if !stem.is_empty() {
                return stem.to_string();
            }
        }
    }
    format!("{container}.out")
}

struct DecompressOpener {
    codec: Codec,
    src: Arc<dyn ReadAt>,
    len: u64,
}

impl StreamOpener for DecompressOpener {
    fn open_stream(&self) -> Result<Box<dyn Read + Send>> {
        let raw = RangeStream::new(self.src.clone(), 0, self.len);
        Ok(match self.codec {
            Codec::Gzip => Box::new(MultiGzDecoder::new(raw)),
            Codec::Bzip2 => Box::new(BzDecoder::new(raw)),
            Codec::Xz => Box::new(XzDecoder::new(raw)),
        })
    }
}

pub fn new_compressed(
    codec: Codec,
    src: Arc<dyn ReadAt>,
    size: u64,
    container_name: &str,
) -> Result<Arc<FsSkeleton>> {
    let skel = Arc::new(FsSkeleton::new());
    let opener = Arc::new(DecompressOpener { codec, src, len: size });
    skel.create_file_sequential(
        &member_name(container_name),
        opener,
        -1,
        NodeAttrs {
            mode: 0o644,
            mtime: UNIX_EPOCH,
            sys: SysHandle::Record { index: 0 },
            order: 0,
        },
    )?;
    skel.no_more();
    Ok(skel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{ArchiveFs, FileBody};

    #[test]
    fn member_naming() {
        assert_eq!(member_name("disk.img.gz"), "disk.img");
        assert_eq!(member_name("src.tgz"), "src.tar");
        assert_eq!(member_name("a.tbz2"), "a.tar");
        assert_eq!(member_name("notes.xz"), "notes");
        assert_eq!(member_name("odd"), "odd.out");
        assert_eq!(member_name(".gz"), ".gz.out");
    }

    #[test]
    fn gzip_member_streams() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello gzip stream").unwrap();
        let packed = enc.finish().unwrap();
        let size = packed.len() as u64;

        let fs = new_compressed(Codec::Gzip, Arc::new(packed), size, "hello.txt.gz").unwrap();
        let h = fs.open("hello.txt").unwrap();
        assert_eq!(h.info.size, -1);
        let FileBody::Sequential(opener) = h.body else { panic!("not sequential") };
        let mut out = Vec::new();
        opener.open_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello gzip stream");
    }
}
