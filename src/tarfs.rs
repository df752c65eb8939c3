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

//! Read-only tar (ustar and old GNU) over a random-access source.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;

use super::error::{Error, Result};
use super::section::SectionReader;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::vfs::{ReadAt, SysHandle};

const BLOCK: u64 = 512;

/// Parse a NUL/space-terminated octal field.
fn octal(field: &[u8]) -> Result<u64> {
    let mut v: u64 = 0;
    let mut any = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                v = v
                    .checked_mul(8)
                    .and_then(|v| v.checked_add(u64::from(b - b'0')))
                    .ok_or_else(|| Error::BadHeader("tar octal overflow".into()))?;
                any = true;
            }
            b' ' | 0 => {
                if any {
                    break;
                }
            }
            _ => return Err(Error::BadHeader("tar octal field".into())),
        }
    }
    Ok(v)
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// The stored checksum is the byte sum of the header with the checksum
/// field itself read as spaces.
fn verify_checksum(hdr: &[u8; 512]) -> Result<()> {
    let stored = octal(&hdr[148..156])?;
    let mut sum: u64 = 0;
    for (i, &b) in hdr.iter().enumerate() {
        sum += if (148..156).contains(&i) { u64::from(b' ') } else { u64::from(b) };
    }
    if sum != stored {
        return Err(Error::BadChecksum);
    }
    Ok(())
}

pub fn is_tar_magic(magic: &[u8]) -> bool {
    // "ustar\0 00" (POSIX) or "ustar  \0" (old GNU)
    magic.len() >= 8 && (&magic[..6] == b"ustar\0" || &magic[..8] == b"ustar  \0")
}

pub fn new_tar(src: Arc<dyn ReadAt>, size: u64) -> Result<Arc<FsSkeleton>> {
    let skel = Arc::new(FsSkeleton::new());
    let mut off = 0u64;
    let mut order = 0i64;
    let mut pending_longname: Option<String> = None;

    while off + BLOCK <= size {
        let mut hdr = [0u8; BLOCK as usize];
        if src.read_at(&mut hdr, off)? < hdr.len() {
            return Err(Error::Truncated);
        }
        if hdr.iter().all(|&b| b == 0) {
            // End-of-archive marker.
            break;
        }
        if !is_tar_magic(&hdr[257..265]) {
            return Err(Error::BadMagic);
        }
        verify_checksum(&hdr)?;

        let entry_size = octal(&hdr[124..136])?;
        let mtime = UNIX_EPOCH + Duration::from_secs(octal(&hdr[136..148])?);
        let mode = u32::try_from(octal(&hdr[100..108])?).unwrap_or(0o644) & 0o7777;
        let typeflag = hdr[156];
        let data_off = off + BLOCK;
        let padded = entry_size.div_ceil(BLOCK) * BLOCK;

        let name = match pending_longname.take() {
            Some(n) => n,
            None => {
                let base = field_str(&hdr[0..100]);
                let prefix = field_str(&hdr[345..500]);
                if prefix.is_empty() {
                    base
                } else {
                    format!("{prefix}/{base}")
                }
            }
        };
        let name = name.trim_end_matches('/').to_string();

        match typeflag {
            b'L' => {
                // GNU long name: the payload names the next entry.
                let mut buf = vec![0u8; usize::try_from(entry_size).map_err(|_| Error::Truncated)?];
                if src.read_at(&mut buf, data_off)? < buf.len() {
                    return Err(Error::Truncated);
                }
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                pending_longname =
                    Some(String::from_utf8_lossy(&buf[..end]).trim_end_matches('/').to_string());
            }
            0 | b'0' | b'7' => {
                let len = entry_size.min(size.saturating_sub(data_off));
                if len < entry_size {
                    return Err(Error::Truncated);
                }
                skel.create_file_random(
                    &name,
                    Arc::new(SectionReader::new(src.clone(), data_off, entry_size)),
                    entry_size,
                    NodeAttrs {
                        mode,
                        mtime,
                        sys: SysHandle::Record { index: off },
                        order,
                    },
                )?;
            }
            b'5' => {
                skel.create_dir(
                    &name,
                    NodeAttrs { mode, mtime, sys: SysHandle::Record { index: off }, order },
                )?;
            }
            b'2' | b'1' => {
                // Hard links point within the archive; surfacing both as
                // symlinks keeps the tree read-only and loop-free.
                let target = field_str(&hdr[157..257]);
                skel.create_symlink(
                    &name,
                    &target,
                    NodeAttrs { mode, mtime, sys: SysHandle::Record { index: off }, order },
                )?;
            }
            other => {
                debug!("tar entry {} with unsupported type {}", name, other);
            }
        }

        order += 1;
        off = data_off + padded;
    }

    skel.no_more();
    Ok(skel)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vfs::{ArchiveFs, FileBody};

    /// Minimal ustar writer for test images.
    pub fn make_entry(name: &str, typeflag: u8, content: &[u8], link: &str) -> Vec<u8> {
        let mut hdr = vec![0u8; 512];
        hdr[0..name.len()].copy_from_slice(name.as_bytes());
        hdr[100..107].copy_from_slice(b"0000644");
        hdr[108..115].copy_from_slice(b"0000000");
        hdr[116..123].copy_from_slice(b"0000000");
        let size_field = format!("{:011o}", content.len());
        hdr[124..135].copy_from_slice(size_field.as_bytes());
        hdr[136..147].copy_from_slice(b"00000000000");
        hdr[156] = typeflag;
        hdr[157..157 + link.len()].copy_from_slice(link.as_bytes());
        hdr[257..263].copy_from_slice(b"ustar\0");
        hdr[263..265].copy_from_slice(b"00");
        // checksum over the header with the checksum bytes as spaces
        for b in &mut hdr[148..156] {
            *b = b' ';
        }
        let sum: u64 = hdr.iter().map(|&b| u64::from(b)).sum();
        let chk = format!("{sum:06o}\0 ");
        hdr[148..156].copy_from_slice(chk.as_bytes());

        let mut out = hdr;
        out.extend_from_slice(content);
        while out.len() % 512 != 0 {
            out.push(0);
        }
        out
    }

    pub fn make_archive(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in entries {
            out.extend_from_slice(e);
        }
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[test]
    fn lists_files_and_dirs() {
        let img = make_archive(&[
            make_entry("a", b'5', b"", ""),
            make_entry("a/b.txt", b'0', b"hello tar file", ""),
            make_entry("a/c.txt", b'0', b"", ""),
            make_entry("ln", b'2', b"", "a/b.txt"),
        ]);
        let size = img.len() as u64;
        let fs = new_tar(Arc::new(img), size).unwrap();

        let names: Vec<String> =
            fs.read_dir("a").unwrap().into_iter().map(|e| e.info.name).collect();
        assert_eq!(names, vec!["b.txt", "c.txt"]);
        assert_eq!(fs.stat("a/b.txt").unwrap().size, 14);
        assert_eq!(fs.stat("a/c.txt").unwrap().size, 0);
        assert_eq!(fs.read_link("ln").unwrap(), "a/b.txt");

        let h = fs.open("a/b.txt").unwrap();
        let FileBody::Random(r) = h.body else { panic!("not random") };
        let mut buf = [0u8; 64];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 14);
        assert_eq!(&buf[..14], b"hello tar file");
    }

    #[test]
    fn gnu_long_names() {
        let long = "d/".to_string() + &"x".repeat(120);
        let img = make_archive(&[
            make_entry("././@LongLink", b'L', long.as_bytes(), ""),
            make_entry("ignored", b'0', b"payload", ""),
        ]);
        let size = img.len() as u64;
        let fs = new_tar(Arc::new(img), size).unwrap();
        assert_eq!(fs.stat(&long).unwrap().size, 7);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut img = make_archive(&[make_entry("f", b'0', b"x", "")]);
        img[0] = b'g';
        let size = img.len() as u64;
        assert!(matches!(
            new_tar(Arc::new(img), size),
            Err(Error::BadChecksum)
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut img = make_archive(&[make_entry("f", b'0', &[7u8; 600], "")]);
        img.truncate(512 + 256);
        let size = img.len() as u64;
        assert!(new_tar(Arc::new(img), size).is_err());
    }
}
