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

//! The outermost filesystem: a plain host directory.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use super::error::{Error, Result};
use super::vfs::{
    split_path, ArchiveFs, DirEntry, FileBody, FileHandle, FileInfo, FileKind, ReadAt,
    SysHandle,
};

pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: &Path) -> Result<HostFs> {
        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(Error::InvalidPath);
        }
        Ok(HostFs { root: root.to_path_buf() })
    }

    fn host_path(&self, path: &str) -> Result<PathBuf> {
        let mut p = self.root.clone();
        for comp in split_path(path)? {
            p.push(comp);
        }
        Ok(p)
    }

    fn info_from(meta: &fs::Metadata, name: &str) -> FileInfo {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let kind = if meta.is_dir() {
            FileKind::Dir
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        // The fingerprint folds in birth time and basename so a recycled
        // inode does not inherit a stranger's cached blocks.
        let mut hasher = DefaultHasher::new();
        meta.created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .hash(&mut hasher);
        name.hash(&mut hasher);
        FileInfo {
            name: name.to_string(),
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            mode: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            kind,
            sys: SysHandle::Host {
                dev: meta.dev(),
                ino: meta.ino(),
                fingerprint: hasher.finish(),
            },
        }
    }
}

fn map_io(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        Error::UpstreamIo(e)
    }
}

impl ArchiveFs for HostFs {
    fn open(&self, path: &str) -> Result<FileHandle> {
        let host = self.host_path(path)?;
        let file = fs::File::open(&host).map_err(map_io).map_err(|e| e.at("open", path))?;
        let meta = file.metadata().map_err(map_io)?;
        let name = if path == "." { ".".to_string() } else { host.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default() };
        Ok(FileHandle {
            info: HostFs::info_from(&meta, &name),
            body: FileBody::Random(Arc::new(file) as Arc<dyn ReadAt>),
        })
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let host = self.host_path(path)?;
        let meta = fs::symlink_metadata(&host)
            .map_err(map_io)
            .map_err(|e| e.at("stat", path))?;
        let name = if path == "." {
            ".".to_string()
        } else {
            host.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        };
        Ok(HostFs::info_from(&meta, &name))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let host = self.host_path(path)?;
        let rd = fs::read_dir(&host).map_err(map_io).map_err(|e| e.at("readdir", path))?;
        let mut entries = Vec::new();
        for ent in rd {
            let ent = ent.map_err(map_io)?;
            let name = ent.file_name().to_string_lossy().into_owned();
            let meta = match ent.metadata() {
                Ok(m) => m,
                Err(_) => continue, // raced away; listings are best-effort
            };
            entries.push(DirEntry { info: HostFs::info_from(&meta, &name) });
        }
        entries.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        Ok(entries)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let host = self.host_path(path)?;
        let target = fs::read_link(&host).map_err(map_io).map_err(|e| e.at("readlink", path))?;
        Ok(target.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/hello.txt"), b"host bytes").unwrap();

        let hfs = HostFs::new(dir.path()).unwrap();
        let names: Vec<String> =
            hfs.read_dir(".").unwrap().into_iter().map(|e| e.info.name).collect();
        assert_eq!(names, vec!["sub"]);

        let info = hfs.stat("sub/hello.txt").unwrap();
        assert_eq!(info.size, 10);
        assert!(matches!(info.sys, SysHandle::Host { .. }));

        let h = hfs.open("sub/hello.txt").unwrap();
        let FileBody::Random(r) = h.body else { panic!("not random") };
        let mut buf = [0u8; 32];
        assert_eq!(r.read_at(&mut buf, 5).unwrap(), 5);
        assert_eq!(&buf[..5], b"bytes");
    }

    #[test]
    fn missing_files_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let hfs = HostFs::new(dir.path()).unwrap();
        assert!(hfs.stat("nope").unwrap_err().is_not_found());
        assert!(hfs.open("nope").unwrap_err().is_not_found());
    }
}
