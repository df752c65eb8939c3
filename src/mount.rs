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

//! The mount tree: lazy probing and instantiation of container
//! sub-filesystems, `◆` path resolution across the union, and the merged
//! directory listing that shows every recognized container twice — once
//! as the file, once as its pseudo-directory sibling.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use super::apm;
use super::compressed::{self, Codec};
use super::context::SystemContext;
use super::definitions::{FsId, MARKER, NO_DEEPER};
use super::error::{Error, Result};
use super::hfs;
use super::hostfs::HostFs;
use super::pathkey::PathKey;
use super::rsrcfork;
use super::spinner::SpinReader;
use super::stuffit;
use super::tarfs;
use super::vfs::{
    base_name, ArchiveFs, DirEntry, FileBody, FileInfo, FileKind, ReadAt, SysHandle,
};
use super::zipfs;

/// Which parser a probed header selects.  The slot stores this instead of
/// a closure so probing never retains an open file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Format {
    Gzip,
    Bzip2,
    Xz,
    Apm,
    StuffIt,
    Tar,
    Zip,
    Hfs,
    Rsrc,
}

/// Slot states are monotone: Unknown → Pending → (Generator →
/// Instantiated | NotArchive).  Instantiated and NotArchive are final.
enum SlotState {
    Unknown,
    Pending,
    NotArchive,
    Generator(Format),
    Instantiated(FsId),
}

struct MountSlot {
    state: Mutex<SlotState>,
}

enum ArchiveState {
    No,
    /// Recognized; the inner filesystem id is present once instantiated.
    Yes(Option<FsId>),
}

struct MountMaps {
    filesystems: HashMap<FsId, Arc<dyn ArchiveFs>>,
    mounts: HashMap<PathKey, Arc<MountSlot>>,
    /// Inverse of the mount relation, for path reconstruction.  Every
    /// live inner filesystem appears exactly once; the root never does.
    reverse: HashMap<FsId, PathKey>,
}

/// An opened byte source, with its spinner handle when the backing is
/// sequential.
struct Source {
    reader: Arc<dyn ReadAt>,
    size: Option<u64>,
    spin: Option<Arc<SpinReader>>,
}

impl Source {
    /// The exact byte size, draining a sequential source once if needed.
    fn size(&self) -> Result<u64> {
        match (self.size, &self.spin) {
            (Some(n), _) => Ok(n),
            (None, Some(spin)) => spin.size(),
            (None, None) => Err(Error::Unrecoverable("sizeless random source".into())),
        }
    }
}

/// The union filesystem over a tree of nested containers.
pub struct Attic {
    ctx: Arc<SystemContext>,
    root_id: FsId,
    maps: RwLock<MountMaps>,
}

impl Attic {
    /// Mount a host directory.
    pub fn new(ctx: Arc<SystemContext>, root: &Path) -> Result<Attic> {
        let host = HostFs::new(root)?;
        Ok(Attic::with_root(ctx, Arc::new(host)))
    }

    /// Mount an arbitrary filesystem as the outermost layer.
    pub fn with_root(ctx: Arc<SystemContext>, root: Arc<dyn ArchiveFs>) -> Attic {
        let root_id = FsId::next();
        let mut filesystems = HashMap::new();
        filesystems.insert(root_id, root);
        Attic {
            ctx,
            root_id,
            maps: RwLock::new(MountMaps {
                filesystems,
                mounts: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.ctx
    }

    fn fs_of(&self, id: FsId) -> Result<Arc<dyn ArchiveFs>> {
        self.maps
            .read()
            .unwrap()
            .filesystems
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Unrecoverable(format!("dangling filesystem id {id:?}")))
    }

    /// Split an external path on mount boundaries and walk down,
    /// instantiating archives as needed.  Returns the innermost
    /// filesystem, the path within it, and whether `.nodeeper` disabled
    /// mount handling.
    fn resolve(&self, path: &str) -> Result<(FsId, String, bool)> {
        let mut fs = self.root_id;
        let mut rel = String::new();
        let mut raw = false;

        if path == "." {
            return Ok((fs, ".".to_string(), false));
        }
        if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
            return Err(Error::InvalidPath.at("resolve", path));
        }
        for comp in path.split('/') {
            if comp.is_empty() || comp == "." || comp == ".." {
                return Err(Error::InvalidPath.at("resolve", path));
            }
            if comp == NO_DEEPER {
                raw = true;
                continue;
            }
            let marked = comp.ends_with(MARKER);
            if comp.contains(MARKER) && !marked {
                // The marker may only close a component.
                return Err(Error::InvalidPath.at("resolve", path));
            }
            if marked && !raw {
                let name = &comp[..comp.len() - MARKER.len_utf8()];
                if name.is_empty() {
                    return Err(Error::InvalidPath.at("resolve", path));
                }
                let outer = join(&rel, name);
                match self.enter_archive(fs, &outer, true, true)? {
                    ArchiveState::Yes(Some(inner)) => {
                        fs = inner;
                        rel = String::new();
                    }
                    _ => return Err(Error::NotArchive.at("resolve", path)),
                }
            } else {
                rel = join(&rel, comp);
            }
        }
        if rel.is_empty() {
            rel.push('.');
        }
        Ok((fs, rel, raw))
    }

    /// The mount machinery.  With `need_know` false this is a read-only
    /// peek at the slot; with it true the file is probed (once, the
    /// verdict is memoised) and, when `need_fs` is also true, the inner
    /// filesystem is instantiated.
    fn enter_archive(
        &self,
        fs: FsId,
        rel: &str,
        need_know: bool,
        need_fs: bool,
    ) -> Result<ArchiveState> {
        let key = PathKey::new(fs, rel);

        if !need_know {
            let slot = self.maps.read().unwrap().mounts.get(&key).cloned();
            return Ok(match slot {
                None => ArchiveState::No,
                Some(slot) => match *slot.state.lock().unwrap() {
                    SlotState::Instantiated(id) => ArchiveState::Yes(Some(id)),
                    _ => ArchiveState::No,
                },
            });
        }

        let slot = {
            let mut maps = self.maps.write().unwrap();
            maps.mounts
                .entry(key)
                .or_insert_with(|| Arc::new(MountSlot { state: Mutex::new(SlotState::Unknown) }))
                .clone()
        };

        let mut state = slot.state.lock().unwrap();
        if matches!(*state, SlotState::Unknown | SlotState::Pending) {
            *state = SlotState::Pending;
            *state = match self.probe_archive(fs, rel) {
                Ok(Some(format)) => SlotState::Generator(format),
                Ok(None) => SlotState::NotArchive,
                Err(e) => {
                    debug!("probe of {} failed: {}", rel, e);
                    SlotState::NotArchive
                }
            };
        }
        match *state {
            SlotState::NotArchive => Ok(ArchiveState::No),
            SlotState::Instantiated(id) => Ok(ArchiveState::Yes(Some(id))),
            SlotState::Generator(format) => {
                if !need_fs {
                    return Ok(ArchiveState::Yes(None));
                }
                match self.instantiate(format, fs, rel) {
                    Ok(inner) => {
                        let id = FsId::next();
                        let mut maps = self.maps.write().unwrap();
                        maps.filesystems.insert(id, inner);
                        maps.reverse.insert(id, key);
                        drop(maps);
                        *state = SlotState::Instantiated(id);
                        Ok(ArchiveState::Yes(Some(id)))
                    }
                    Err(e) => {
                        // A file that looked like an archive but does not
                        // parse stays visible as an ordinary file.
                        warn!("opening archive {} failed: {}", rel, e);
                        *state = SlotState::NotArchive;
                        Ok(ArchiveState::No)
                    }
                }
            }
            SlotState::Unknown | SlotState::Pending => {
                Err(Error::Unrecoverable("mount slot left unprobed".into()))
            }
        }
    }

    /// Open a file inside one sub-filesystem, adapting sequential bodies
    /// through the spinner.
    fn open_within(&self, fs: FsId, rel: &str) -> Result<Source> {
        let fsa = self.fs_of(fs)?;
        let h = fsa.open(rel)?;
        Ok(match h.body {
            FileBody::Random(reader) => Source {
                reader,
                size: u64::try_from(h.info.size).ok(),
                spin: None,
            },
            FileBody::Sequential(opener) => {
                let key = spin_key(fs, rel, &h.info.sys);
                let spin = Arc::new(self.ctx.spinner().reader(key, opener));
                Source {
                    reader: spin.clone(),
                    size: u64::try_from(h.info.size).ok(),
                    spin: Some(spin),
                }
            }
        })
    }

    /// Sniff a file's header.  Returns the recognized format, or None
    /// for ordinary files.  Never keeps the file open past return.
    fn probe_archive(&self, fs: FsId, rel: &str) -> Result<Option<Format>> {
        let name = base_name(rel);
        if name.starts_with("._") {
            return Ok(None);
        }
        if fs == self.root_id && (name.ends_with(".crdownload") || name.ends_with(".part")) {
            return Ok(None);
        }

        let src = self.open_within(fs, rel)?;
        let mut head = [0u8; 1152];
        let n = src.reader.read_at(&mut head, 0)?;

        if n >= 3 && head[0..3] == compressed::GZIP_MAGIC {
            return Ok(Some(Format::Gzip));
        }
        if n >= 10 && head[0..3] == compressed::BZIP2_MAGIC
            && head[4..10] == compressed::BZIP2_BLOCK_MAGIC
        {
            return Ok(Some(Format::Bzip2));
        }
        if n >= 6 && head[0..6] == compressed::XZ_MAGIC {
            return Ok(Some(Format::Xz));
        }
        if n >= 16 && &head[0..16] == stuffit::SIT5_MAGIC {
            return Ok(Some(Format::StuffIt));
        }
        if n >= 14 && head[0] == b'S' && &head[10..14] == *stuffit::CLASSIC_MAGIC_TAIL {
            return Ok(Some(Format::StuffIt));
        }
        if n >= 4 && head[0..4] == zipfs::LOCAL_MAGIC {
            return Ok(Some(Format::Zip));
        }
        if n >= 265 && tarfs::is_tar_magic(&head[257..265]) {
            return Ok(Some(Format::Tar));
        }
        if n >= 4 && head[0..2] == [b'E', b'R'] {
            let bs = u16::from_be_bytes([head[2], head[3]]);
            if apm::VALID_BLOCK_SIZES.contains(&bs) {
                return Ok(Some(Format::Apm));
            }
        }
        if n >= 1152 && &head[1024..1026] == b"BD" {
            // An HFS volume: benign boot block, sane allocation blocks, no
            // embedded HFS+ wrapper, and at least a 400 KiB floppy.
            let boot_ok = head[0..2] == [b'L', b'K'] || head[0..2] == [0, 0];
            let blk = u32::from_be_bytes([head[1044], head[1045], head[1046], head[1047]]);
            let wrapper = &head[1148..1150] == b"H+";
            if boot_ok && !wrapper && blk >= 512 && blk % 512 == 0 && src.size()? >= 400 * 1024 {
                return Ok(Some(Format::Hfs));
            }
        }
        if n >= 2 && head[0..2] == [b'M', b'Z'] {
            // Possibly a self-extracting zip; believe it only if an
            // end-of-central-directory record closes the file.
            let size = src.size()?;
            if size >= 22 {
                let mut tail = [0u8; 22];
                if src.reader.read_at(&mut tail, size - 22)? == 22
                    && tail[0..4] == [b'P', b'K', 5, 6]
                {
                    return Ok(Some(Format::Zip));
                }
            }
        }
        if n >= 16 {
            let hdr16: [u8; 16] = head[0..16].try_into().unwrap();
            if rsrcfork::looks_like(&hdr16, src.size()?) {
                return Ok(Some(Format::Rsrc));
            }
        }
        Ok(None)
    }

    fn instantiate(&self, format: Format, fs: FsId, rel: &str) -> Result<Arc<dyn ArchiveFs>> {
        let src = self.open_within(fs, rel)?;
        let name = base_name(rel);
        debug!("mounting {} as {:?}", rel, format);
        Ok(match format {
            Format::Gzip => {
                compressed::new_compressed(Codec::Gzip, src.reader.clone(), src.size()?, name)?
            }
            Format::Bzip2 => {
                compressed::new_compressed(Codec::Bzip2, src.reader.clone(), src.size()?, name)?
            }
            Format::Xz => {
                compressed::new_compressed(Codec::Xz, src.reader.clone(), src.size()?, name)?
            }
            Format::Apm => apm::new_apm(src.reader.clone(), src.size()?)?,
            Format::StuffIt => stuffit::new_stuffit(&self.ctx, src.reader.clone(), src.size()?)?,
            Format::Tar => tarfs::new_tar(src.reader.clone(), src.size()?)?,
            Format::Zip => zipfs::new_zip(src.reader.clone(), src.size()?)?,
            Format::Hfs => hfs::new_hfs(src.reader.clone(), src.size()?)?,
            Format::Rsrc => rsrcfork::new_rsrc(src.reader.clone(), src.size()?)?,
        })
    }

    /// Open a file (or archive-root pseudo-directory) for reading.
    pub fn open(&self, path: &str) -> Result<AtticFile> {
        let (fs, rel, _) = self.resolve(path)?;
        if rel == "." {
            let info = self.stat(path)?;
            return Ok(AtticFile {
                info,
                reader: Arc::new(Vec::<u8>::new()),
                spin: None,
                pos: 0,
            });
        }
        let fsa = self.fs_of(fs)?;
        let h = fsa.open(&rel).map_err(|e| e.at("open", path))?;
        let mut info = h.info;
        info.name = last_component(path).to_string();
        Ok(match h.body {
            FileBody::Random(reader) => AtticFile { info, reader, spin: None, pos: 0 },
            FileBody::Sequential(opener) => {
                let key = spin_key(fs, &rel, &info.sys);
                let spin = Arc::new(self.ctx.spinner().reader(key, opener));
                AtticFile { info, reader: spin.clone(), spin: Some(spin), pos: 0 }
            }
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let (fs, rel, _) = self.resolve(path)?;
        if rel == "." && path != "." {
            // The archive's root pseudo-directory, named after the
            // container with its marker.
            let mut info = FileInfo::dir(last_component(path));
            info.mtime = self
                .reverse_outer(fs)
                .and_then(|(ofs, orel)| {
                    self.fs_of(ofs).ok().and_then(|f| f.stat(orel.as_str()).ok())
                })
                .map(|i| i.mtime)
                .unwrap_or(info.mtime);
            return Ok(info);
        }
        let fsa = self.fs_of(fs)?;
        let mut info = fsa.stat(&rel).map_err(|e| e.at("stat", path))?;
        info.name = last_component(path).to_string();
        if info.size < 0 && info.kind == FileKind::File {
            // Unknown sizes resolve through the spinner on demand.
            info.size = i64::try_from(self.open_within(fs, &rel)?.size()?).unwrap_or(i64::MAX);
        }
        Ok(info)
    }

    fn reverse_outer(&self, fs: FsId) -> Option<(FsId, String)> {
        self.maps
            .read()
            .unwrap()
            .reverse
            .get(&fs)
            .map(|key| (key.fs, key.path.as_str().to_string()))
    }

    /// List a directory.  Unless `.nodeeper` is in force, every regular
    /// file that probes as a container gains a `name◆` sibling entry.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (fs, rel, raw) = self.resolve(path)?;
        let fsa = self.fs_of(fs)?;
        let entries = fsa.read_dir(&rel).map_err(|e| e.at("readdir", path))?;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let is_file = e.kind() == FileKind::File;
            let name = e.info.name.clone();
            let mtime = e.info.mtime;
            out.push(e);
            if raw || !is_file {
                continue;
            }
            let child = join_rel(&rel, &name);
            if let ArchiveState::Yes(_) = self.enter_archive(fs, &child, true, false)? {
                let mut info = FileInfo::dir(&format!("{name}{MARKER}"));
                info.mtime = mtime;
                info.sys = SysHandle::None;
                out.push(DirEntry { info });
            }
        }
        Ok(out)
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        let (fs, rel, _) = self.resolve(path)?;
        let fsa = self.fs_of(fs)?;
        fsa.read_link(&rel).map_err(|e| e.at("readlink", path))
    }

    /// Breadth-first traversal of the whole union, descending into
    /// archive pseudo-directories as they are discovered.
    pub fn walk(&self) -> Walk<'_> {
        let mut queue = VecDeque::new();
        queue.push_back(".".to_string());
        Walk { attic: self, queue, ready: VecDeque::new() }
    }
}

pub struct Walk<'a> {
    attic: &'a Attic,
    queue: VecDeque<String>,
    ready: VecDeque<(String, FileInfo)>,
}

impl Iterator for Walk<'_> {
    type Item = Result<(String, FileInfo)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(Ok(item));
            }
            let dir = self.queue.pop_front()?;
            match self.attic.read_dir(&dir) {
                Ok(entries) => {
                    for e in entries {
                        let full = join(if dir == "." { "" } else { dir.as_str() }, e.name());
                        if e.is_dir() {
                            self.queue.push_back(full.clone());
                        }
                        self.ready.push_back((full, e.info));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Block-cache identity: host files key on (device, inode, fingerprint)
/// so two paths to the same bytes share cached work; everything else
/// keys on its path.
fn spin_key(fs: FsId, rel: &str, sys: &SysHandle) -> PathKey {
    match sys {
        SysHandle::Host { dev, ino, fingerprint } => {
            PathKey::new(fs, &format!("id/{dev}/{ino}/{fingerprint:x}"))
        }
        _ => PathKey::new(fs, rel),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn join_rel(rel: &str, name: &str) -> String {
    join(if rel == "." { "" } else { rel }, name)
}

fn last_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// An opened file: positional reads, plus the usual sequential façade.
pub struct AtticFile {
    info: FileInfo,
    reader: Arc<dyn ReadAt>,
    spin: Option<Arc<SpinReader>>,
    pos: u64,
}

impl std::fmt::Debug for AtticFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtticFile")
            .field("info", &self.info)
            .field("pos", &self.pos)
            .finish()
    }
}

impl AtticFile {
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// The exact size, resolving unknown-length streams on first use.
    pub fn size(&mut self) -> Result<u64> {
        if self.info.size >= 0 {
            return Ok(self.info.size as u64);
        }
        let spin = self
            .spin
            .as_ref()
            .ok_or_else(|| Error::Unrecoverable("sizeless random file".into()))?;
        let n = spin.size()?;
        self.info.size = i64::try_from(n).unwrap_or(i64::MAX);
        Ok(n)
    }
}

impl ReadAt for AtticFile {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        self.reader.read_at(buf, off)
    }
}

impl Read for AtticFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read_at(buf, self.pos).map_err(std::io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for AtticFile {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => {
                let size = self.size().map_err(std::io::Error::from)?;
                size.checked_add_signed(d)
            }
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{FsSkeleton, NodeAttrs};
    use crate::tarfs::tests::{make_archive, make_entry};
    use std::time::UNIX_EPOCH;

    fn root_with(files: &[(&str, Vec<u8>)]) -> Arc<FsSkeleton> {
        let skel = Arc::new(FsSkeleton::new());
        for (i, (name, content)) in files.iter().enumerate() {
            let len = content.len() as u64;
            skel.create_file_random(
                name,
                Arc::new(content.clone()),
                len,
                NodeAttrs::file(UNIX_EPOCH, i as i64),
            )
            .unwrap();
        }
        skel.no_more();
        skel
    }

    fn tar_bytes() -> Vec<u8> {
        make_archive(&[
            make_entry("a", b'5', b"", ""),
            make_entry("a/b.txt", b'0', b"thirteen byte", ""),
            make_entry("a/c.txt", b'0', b"", ""),
        ])
    }

    #[test]
    fn resolves_through_a_mount() {
        let root = root_with(&[("archive.tar", tar_bytes()), ("plain.txt", b"no".to_vec())]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);

        let mut f = attic.open("archive.tar\u{25c6}/a/b.txt").unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "thirteen byte");

        // Mount points list as siblings of their file.
        let names: Vec<String> = attic
            .read_dir(".")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(
            names,
            vec!["archive.tar", "archive.tar\u{25c6}", "plain.txt"]
        );

        // Ordinary files do not grow marker siblings.
        assert!(matches!(
            attic.open("plain.txt\u{25c6}/x").unwrap_err().root(),
            Error::NotArchive
        ));
    }

    #[test]
    fn trailing_marker_names_the_archive_root() {
        let root = root_with(&[("archive.tar", tar_bytes())]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);

        let info = attic.stat("archive.tar\u{25c6}").unwrap();
        assert!(info.is_dir());
        assert_eq!(info.name, "archive.tar\u{25c6}");

        let top: Vec<String> = attic
            .read_dir("archive.tar\u{25c6}")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(top, vec!["a"]);
    }

    #[test]
    fn nodeeper_disables_mount_synthesis() {
        let root = root_with(&[("archive.tar", tar_bytes())]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);

        let names: Vec<String> = attic
            .read_dir(NO_DEEPER)
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(names, vec!["archive.tar"]);
    }

    #[test]
    fn probe_verdicts_are_memoised_and_monotone() {
        let root = root_with(&[("archive.tar", tar_bytes())]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);

        // A peek before any probe sees nothing.
        assert!(matches!(
            attic.enter_archive(attic.root_id, "archive.tar", false, false).unwrap(),
            ArchiveState::No
        ));
        // Probing without instantiating answers yes but mounts nothing.
        assert!(matches!(
            attic.enter_archive(attic.root_id, "archive.tar", true, false).unwrap(),
            ArchiveState::Yes(None)
        ));
        assert!(matches!(
            attic.enter_archive(attic.root_id, "archive.tar", false, false).unwrap(),
            ArchiveState::No
        ));
        // Instantiation is sticky: later peeks see the same id.
        let ArchiveState::Yes(Some(id)) =
            attic.enter_archive(attic.root_id, "archive.tar", true, true).unwrap()
        else {
            panic!("expected instantiation");
        };
        for _ in 0..3 {
            let ArchiveState::Yes(Some(again)) =
                attic.enter_archive(attic.root_id, "archive.tar", false, false).unwrap()
            else {
                panic!("regressed");
            };
            assert_eq!(again, id);
        }
        // The reverse map names the mount point, once.
        let maps = attic.maps.read().unwrap();
        assert_eq!(maps.reverse.len(), 1);
        assert_eq!(maps.reverse[&id].path.as_str(), "archive.tar");
        assert!(!maps.reverse.contains_key(&attic.root_id));
    }

    #[test]
    fn sidecar_and_partial_names_are_never_probed() {
        let root = root_with(&[
            ("._weird", tar_bytes()),
            ("half.part", tar_bytes()),
            ("half.crdownload", tar_bytes()),
        ]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);
        let names: Vec<String> = attic
            .read_dir(".")
            .unwrap()
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        // All three list as plain files, none grow marker siblings.
        assert_eq!(names, vec!["._weird", "half.part", "half.crdownload"]);
    }

    #[test]
    fn walk_descends_into_archives() {
        let root = root_with(&[("archive.tar", tar_bytes())]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);
        let mut paths: Vec<String> = attic
            .walk()
            .map(|r| r.map(|(p, _)| p))
            .collect::<Result<_>>()
            .unwrap();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "archive.tar".to_string(),
                "archive.tar\u{25c6}".to_string(),
                "archive.tar\u{25c6}/a".to_string(),
                "archive.tar\u{25c6}/a/b.txt".to_string(),
                "archive.tar\u{25c6}/a/c.txt".to_string(),
            ]
        );
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let root = root_with(&[]);
        let attic = Attic::with_root(SystemContext::with_defaults(), root);
        for p in ["/abs", "a//b", "a/../b", "a/./b", "", "a\u{25c6}b/c", "\u{25c6}"] {
            assert!(attic.stat(p).is_err(), "path {p:?}");
        }
    }
}
