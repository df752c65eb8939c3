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
use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::definitions::Cnid;
use super::error::{Error, Result};

/// Positioned reads from an immutable byte source.
///
/// The contract follows pread(2) rather than read(2): `read_at` fills as
/// much of `buf` as the source can provide at `off`.  A short (or empty)
/// result means the source ended there; there is no separate EOF error.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize>;

    /// Window-flattening hook.  A reader that is itself a bounded view of
    /// another reader reports `(parent, start, len)` so that stacked views
    /// collapse instead of chaining.
    fn window(&self) -> Option<(Arc<dyn ReadAt>, u64, u64)> {
        None
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        (**self).read_at(buf, off)
    }

    fn window(&self) -> Option<(Arc<dyn ReadAt>, u64, u64)> {
        (**self).window()
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let off = usize::try_from(off).unwrap_or(usize::MAX);
        if off >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - off);
        buf[..n].copy_from_slice(&self[off..off + n]);
        Ok(n)
    }
}

impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            match FileExt::read_at(self, &mut buf[done..], off + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::UpstreamIo(e)),
            }
        }
        Ok(done)
    }
}

/// Read exactly `buf.len()` bytes at `off` or fail with [`Error::Truncated`].
pub fn read_exact_at(r: &dyn ReadAt, buf: &mut [u8], off: u64) -> Result<()> {
    if r.read_at(buf, off)? == buf.len() {
        Ok(())
    } else {
        Err(Error::Truncated)
    }
}

/// A source that can only be consumed front to back, such as a decompressor
/// over a fresh stream.  Opening must always restart from byte 0.
pub trait StreamOpener: Send + Sync {
    fn open_stream(&self) -> Result<Box<dyn Read + Send>>;
}

/// Adapts a [`ReadAt`] range to `io::Read`, for feeding decoders that want
/// a sequential stream.
pub struct RangeStream {
    src: Arc<dyn ReadAt>,
    pos: u64,
    end: u64,
}

impl RangeStream {
    pub fn new(src: Arc<dyn ReadAt>, start: u64, len: u64) -> RangeStream {
        RangeStream { src, pos: start, end: start.saturating_add(len) }
    }
}

impl Read for RangeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let left = self.end.saturating_sub(self.pos);
        if left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        let n = self
            .src
            .read_at(&mut buf[..want], self.pos)
            .map_err(std::io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

impl FileKind {
    pub fn is_dir(self) -> bool {
        matches!(self, FileKind::Dir)
    }
}

/// Implementation-defined identity handle, used to share cache state between
/// different paths naming the same bytes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SysHandle {
    None,
    /// A host-filesystem file: device, inode, and a fingerprint mixed from
    /// the birth time and basename so that inode reuse does not alias.
    Host { dev: u64, ino: u64, fingerprint: u64 },
    /// An HFS catalog entry, one per fork.
    Catalog { cnid: Cnid, resource: bool },
    /// An archive member, identified by record ordinal.
    Record { index: u64 },
}

#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    /// Size in bytes, or -1 when it cannot be known without consuming the
    /// backing stream.
    pub size: i64,
    /// POSIX permission bits, without the file-type bits.
    pub mode: u32,
    pub mtime: SystemTime,
    pub kind: FileKind,
    pub sys: SysHandle,
}

impl FileInfo {
    pub fn dir(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: 0,
            mode: 0o755,
            mtime: UNIX_EPOCH,
            kind: FileKind::Dir,
            sys: SysHandle::None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// The full `st_mode` word, for callers bridging to POSIX surfaces.
    pub fn posix_mode(&self) -> u32 {
        let type_bits = match self.kind {
            FileKind::File => libc::S_IFREG,
            FileKind::Dir => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
        };
        type_bits as u32 | self.mode
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub info: FileInfo,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> FileKind {
        self.info.kind
    }

    pub fn is_dir(&self) -> bool {
        self.info.is_dir()
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }
}

/// How an opened file's bytes are reached.
pub enum FileBody {
    /// Random access is native.
    Random(Arc<dyn ReadAt>),
    /// Only sequential opens are possible; the mount layer routes these
    /// through the spinner to recover random access.
    Sequential(Arc<dyn StreamOpener>),
}

pub struct FileHandle {
    pub info: FileInfo,
    pub body: FileBody,
}

impl std::fmt::Debug for FileBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileBody::Random(_) => f.write_str("Random(..)"),
            FileBody::Sequential(_) => f.write_str("Sequential(..)"),
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("info", &self.info)
            .field("body", &self.body)
            .finish()
    }
}

/// One mounted sub-filesystem: a host directory, an HFS volume, an archive.
///
/// Paths are relative, slash-separated, UTF-8; `.` names the root.  All
/// implementations are read-only and therefore freely shareable.
pub trait ArchiveFs: Send + Sync {
    fn open(&self, path: &str) -> Result<FileHandle>;
    fn stat(&self, path: &str) -> Result<FileInfo>;
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn read_link(&self, path: &str) -> Result<String> {
        let _ = path;
        Err(Error::InvalidPath)
    }
}

/// Validate and canonicalize a relative path: no leading or doubled
/// slashes, no `.` or `..` components.  Returns the path's components.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if path == "." {
        return Ok(Vec::new());
    }
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(Error::InvalidPath);
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
        return Err(Error::InvalidPath);
    }
    Ok(parts)
}

/// The final component of a relative path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The directory part of a relative path, or `.` for a top-level name.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_read_at_clips() {
        let v = vec![1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];
        assert_eq!(v.read_at(&mut buf, 3).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(v.read_at(&mut buf, 5).unwrap(), 0);
        assert_eq!(v.read_at(&mut buf, 500).unwrap(), 0);
    }

    #[test]
    fn split_path_rejects_dots() {
        assert!(split_path("a/./b").is_err());
        assert!(split_path("../a").is_err());
        assert!(split_path("/a").is_err());
        assert!(split_path("a//b").is_err());
        assert!(split_path("").is_err());
        assert_eq!(split_path(".").unwrap().len(), 0);
        assert_eq!(split_path("a/b c/d").unwrap(), vec!["a", "b c", "d"]);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
        assert_eq!(base_name("c.txt"), "c.txt");
        assert_eq!(parent_path("a/b/c.txt"), "a/b");
        assert_eq!(parent_path("c.txt"), ".");
    }

    #[test]
    fn posix_mode_carries_type_bits() {
        let mut info = FileInfo::dir("d");
        assert_eq!(info.posix_mode(), libc::S_IFDIR as u32 | 0o755);
        info.kind = FileKind::File;
        info.mode = 0o444;
        assert_eq!(info.posix_mode(), libc::S_IFREG as u32 | 0o444);
    }
}
