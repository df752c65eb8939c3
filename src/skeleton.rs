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
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::SystemTime;

use super::error::{Error, Result};
use super::pathkey::InternedPath;
use super::vfs::{
    base_name, parent_path, split_path, ArchiveFs, DirEntry, FileBody, FileHandle,
    FileInfo, FileKind, ReadAt, StreamOpener, SysHandle,
};

/// Attributes common to every created entry.
#[derive(Clone, Copy, Debug)]
pub struct NodeAttrs {
    pub mode: u32,
    pub mtime: SystemTime,
    pub sys: SysHandle,
    /// Listing order.  Directory listings sort on `(order, name)`, so
    /// parsers hand in on-disk positions to get disk-order output.
    pub order: i64,
}

impl NodeAttrs {
    pub fn file(mtime: SystemTime, order: i64) -> NodeAttrs {
        NodeAttrs { mode: 0o644, mtime, sys: SysHandle::None, order }
    }

    pub fn dir(mtime: SystemTime, order: i64) -> NodeAttrs {
        NodeAttrs { mode: 0o755, mtime, sys: SysHandle::None, order }
    }
}

enum NodeBody {
    Dir(Vec<InternedPath>),
    Random(Arc<dyn ReadAt>),
    Sequential(Arc<dyn StreamOpener>),
    Symlink(String),
    /// A member that exists but can never be opened, e.g. an archive fork
    /// compressed with an unknown method.  Stat still works.
    Defect(Error),
}

struct Node {
    info: FileInfo,
    order: i64,
    body: NodeBody,
}

struct SkelState {
    nodes: HashMap<InternedPath, Node>,
    complete: bool,
}

/// An in-memory read-only filesystem, populated by a parser.
///
/// Construction may proceed concurrently with reads: `open`/`stat`/
/// `read_dir` block until the named node has been created or [`no_more`]
/// declares the tree final, whichever comes first.
///
/// [`no_more`]: FsSkeleton::no_more
pub struct FsSkeleton {
    state: Mutex<SkelState>,
    ready: Condvar,
}

impl Default for FsSkeleton {
    fn default() -> Self {
        Self::new()
    }
}

impl FsSkeleton {
    pub fn new() -> FsSkeleton {
        let mut nodes = HashMap::new();
        nodes.insert(
            InternedPath::get("."),
            Node {
                info: FileInfo::dir("."),
                order: 0,
                body: NodeBody::Dir(Vec::new()),
            },
        );
        FsSkeleton {
            state: Mutex::new(SkelState { nodes, complete: false }),
            ready: Condvar::new(),
        }
    }

    pub fn create_dir(&self, path: &str, attrs: NodeAttrs) -> Result<()> {
        let info = FileInfo {
            name: base_name(path).to_string(),
            size: 0,
            mode: attrs.mode,
            mtime: attrs.mtime,
            kind: FileKind::Dir,
            sys: attrs.sys,
        };
        self.insert(path, info, attrs.order, NodeBody::Dir(Vec::new()))
    }

    pub fn create_file_random(
        &self,
        path: &str,
        reader: Arc<dyn ReadAt>,
        size: u64,
        attrs: NodeAttrs,
    ) -> Result<()> {
        let info = FileInfo {
            name: base_name(path).to_string(),
            size: i64::try_from(size).map_err(|_| Error::Unrecoverable(
                format!("file size {size} overflows")))?,
            mode: attrs.mode,
            mtime: attrs.mtime,
            kind: FileKind::File,
            sys: attrs.sys,
        };
        self.insert(path, info, attrs.order, NodeBody::Random(reader))
    }

    /// `size` may be -1 when it cannot be known without draining the
    /// stream; the mount layer resolves it through the spinner on demand.
    pub fn create_file_sequential(
        &self,
        path: &str,
        opener: Arc<dyn StreamOpener>,
        size: i64,
        attrs: NodeAttrs,
    ) -> Result<()> {
        let info = FileInfo {
            name: base_name(path).to_string(),
            size,
            mode: attrs.mode,
            mtime: attrs.mtime,
            kind: FileKind::File,
            sys: attrs.sys,
        };
        self.insert(path, info, attrs.order, NodeBody::Sequential(opener))
    }

    pub fn create_symlink(&self, path: &str, target: &str, attrs: NodeAttrs) -> Result<()> {
        let info = FileInfo {
            name: base_name(path).to_string(),
            size: i64::try_from(target.len()).unwrap_or(0),
            mode: attrs.mode,
            mtime: attrs.mtime,
            kind: FileKind::Symlink,
            sys: attrs.sys,
        };
        self.insert(path, info, attrs.order, NodeBody::Symlink(target.to_string()))
    }

    pub fn create_file_defect(
        &self,
        path: &str,
        size: i64,
        err: Error,
        attrs: NodeAttrs,
    ) -> Result<()> {
        let info = FileInfo {
            name: base_name(path).to_string(),
            size,
            mode: attrs.mode,
            mtime: attrs.mtime,
            kind: FileKind::File,
            sys: attrs.sys,
        };
        self.insert(path, info, attrs.order, NodeBody::Defect(err))
    }

    /// Declare the tree final.  Waiters blocked on paths that never
    /// appeared are released with NotFound.
    pub fn no_more(&self) {
        self.state.lock().unwrap().complete = true;
        self.ready.notify_all();
    }

    fn insert(&self, path: &str, info: FileInfo, order: i64, body: NodeBody) -> Result<()> {
        split_path(path)?;
        if path == "." {
            return Err(Error::Unrecoverable("cannot replace the root".into()));
        }
        let mut st = self.state.lock().unwrap();
        self.ensure_parents(&mut st, path)?;
        let key = InternedPath::get(path);
        if st.nodes.contains_key(&key) {
            return Err(Error::Unrecoverable(format!("duplicate entry {path}")));
        }
        let parent = InternedPath::get(parent_path(path));
        match st.nodes.get_mut(&parent) {
            Some(Node { body: NodeBody::Dir(children), .. }) => children.push(key),
            _ => {
                return Err(Error::Unrecoverable(format!("parent of {path} is not a directory")))
            }
        }
        st.nodes.insert(key, Node { info, order, body });
        drop(st);
        self.ready.notify_all();
        Ok(())
    }

    fn ensure_parents(&self, st: &mut SkelState, path: &str) -> Result<()> {
        let parent = parent_path(path);
        if parent == "." {
            return Ok(());
        }
        let key = InternedPath::get(parent);
        if st.nodes.contains_key(&key) {
            return Ok(());
        }
        self.ensure_parents(st, parent)?;
        let grand = InternedPath::get(parent_path(parent));
        match st.nodes.get_mut(&grand) {
            Some(Node { body: NodeBody::Dir(children), .. }) => children.push(key),
            _ => {
                return Err(Error::Unrecoverable(format!("parent of {parent} is not a directory")))
            }
        }
        st.nodes.insert(
            key,
            Node {
                info: FileInfo::dir(base_name(parent)),
                order: 0,
                body: NodeBody::Dir(Vec::new()),
            },
        );
        Ok(())
    }

    /// Block until `path` exists or the skeleton is complete.
    fn wait_node<'a>(&'a self, path: &str) -> Result<(MutexGuard<'a, SkelState>, InternedPath)> {
        split_path(path)?;
        let key = InternedPath::get(path);
        let mut st = self.state.lock().unwrap();
        loop {
            if st.nodes.contains_key(&key) {
                return Ok((st, key));
            }
            if st.complete {
                return Err(Error::NotFound);
            }
            st = self.ready.wait(st).unwrap();
        }
    }
}

impl ArchiveFs for FsSkeleton {
    fn open(&self, path: &str) -> Result<FileHandle> {
        let (st, key) = self.wait_node(path).map_err(|e| e.at("open", path))?;
        let node = &st.nodes[&key];
        let body = match &node.body {
            NodeBody::Random(r) => FileBody::Random(r.clone()),
            NodeBody::Sequential(o) => FileBody::Sequential(o.clone()),
            NodeBody::Dir(_) => {
                FileBody::Random(Arc::new(Vec::<u8>::new()) as Arc<dyn ReadAt>)
            }
            NodeBody::Symlink(_) => return Err(Error::InvalidPath.at("open", path)),
            NodeBody::Defect(e) => return Err(e.duplicate().at("open", path)),
        };
        Ok(FileHandle { info: node.info.clone(), body })
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let (st, key) = self.wait_node(path).map_err(|e| e.at("stat", path))?;
        Ok(st.nodes[&key].info.clone())
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (st, key) = self.wait_node(path).map_err(|e| e.at("readdir", path))?;
        let children = match &st.nodes[&key].body {
            NodeBody::Dir(children) => children,
            _ => return Err(Error::InvalidPath.at("readdir", path)),
        };
        let mut entries: Vec<(i64, DirEntry)> = children
            .iter()
            .map(|c| {
                let n = &st.nodes[c];
                (n.order, DirEntry { info: n.info.clone() })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.0.cmp(&b.0).then_with(|| a.1.info.name.cmp(&b.1.info.name))
        });
        Ok(entries.into_iter().map(|(_, e)| e).collect())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let (st, key) = self.wait_node(path).map_err(|e| e.at("readlink", path))?;
        match &st.nodes[&key].body {
            NodeBody::Symlink(target) => Ok(target.clone()),
            _ => Err(Error::InvalidPath.at("readlink", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn attrs(order: i64) -> NodeAttrs {
        NodeAttrs::file(UNIX_EPOCH, order)
    }

    fn reader(bytes: &[u8]) -> Arc<dyn ReadAt> {
        Arc::new(bytes.to_vec())
    }

    #[test]
    fn implicit_parents_and_listing_order() {
        let sk = FsSkeleton::new();
        sk.create_file_random("a/b/z.txt", reader(b"zz"), 2, attrs(20)).unwrap();
        sk.create_file_random("a/b/y.txt", reader(b"y"), 1, attrs(10)).unwrap();
        sk.create_file_random("a/b/x.txt", reader(b"x"), 1, attrs(10)).unwrap();
        sk.no_more();

        let names: Vec<String> = sk
            .read_dir("a/b")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        // order first, then name as tiebreaker
        assert_eq!(names, vec!["x.txt", "y.txt", "z.txt"]);

        let root: Vec<String> = sk
            .read_dir(".")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(root, vec!["a"]);
        assert!(sk.stat("a").unwrap().is_dir());
    }

    #[test]
    fn duplicates_are_rejected() {
        let sk = FsSkeleton::new();
        sk.create_file_random("f", reader(b""), 0, attrs(0)).unwrap();
        assert!(matches!(
            sk.create_file_random("f", reader(b""), 0, attrs(0)),
            Err(Error::Unrecoverable(_))
        ));
    }

    #[test]
    fn no_more_releases_missing_lookups() {
        let sk = Arc::new(FsSkeleton::new());
        let sk2 = sk.clone();
        let waiter = std::thread::spawn(move || sk2.stat("late/file"));
        // The waiter blocks until the node appears...
        sk.create_file_random("late/file", reader(b"hi"), 2, attrs(0)).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap().size, 2);

        // ...and lookups for paths that never appear fail once complete.
        let sk3 = sk.clone();
        let waiter = std::thread::spawn(move || sk3.stat("never"));
        sk.no_more();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn symlinks_and_defects() {
        let sk = FsSkeleton::new();
        sk.create_symlink("ln", "a/b", attrs(0)).unwrap();
        sk.create_file_defect("locked", 7, Error::PasswordRequired, attrs(1)).unwrap();
        sk.no_more();

        assert_eq!(sk.read_link("ln").unwrap(), "a/b");
        assert_eq!(sk.stat("locked").unwrap().size, 7);
        let err = sk.open("locked").unwrap_err();
        assert!(matches!(err.root(), Error::PasswordRequired));
    }
}
