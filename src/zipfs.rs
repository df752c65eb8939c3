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

//! ZIP archives over a random-access source: end-of-central-directory
//! scan (which also covers self-extracting archives), central directory
//! walk, stored entries as windows, deflated entries as sequential
//! openers.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;
use tracing::debug;

use super::error::{Error, Result};
use super::section::SectionReader;
use super::skeleton::{FsSkeleton, NodeAttrs};
use super::stuffit::PasswordReader;
use super::vfs::{RangeStream, ReadAt, StreamOpener, SysHandle};

pub const LOCAL_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

mod methods {
    pub const STORE: u16 = 0;
    pub const DEFLATE: u16 = 8;
}

/// Flag bit 0: the entry is encrypted.
const FLAG_ENCRYPTED: u16 = 0x0001;

/// Days from 1970-01-01 to y/m/d, by the standard civil-calendar
/// formula.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from((m + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn dos_time(date: u16, time: u16) -> SystemTime {
    let year = 1980 + i64::from(date >> 9);
    let month = u32::from((date >> 5) & 0xF).clamp(1, 12);
    let day = u32::from(date & 0x1F).max(1);
    let hour = u64::from(time >> 11);
    let min = u64::from((time >> 5) & 0x3F);
    let sec = u64::from(time & 0x1F) * 2;
    let days = days_from_civil(year, month, day);
    if days < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs(days as u64 * 86_400 + hour * 3_600 + min * 60 + sec)
}

struct DeflateOpener {
    src: Arc<dyn ReadAt>,
    off: u64,
    len: u64,
}

impl StreamOpener for DeflateOpener {
    fn open_stream(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(DeflateDecoder::new(RangeStream::new(
            self.src.clone(),
            self.off,
            self.len,
        ))))
    }
}

/// Locate the end-of-central-directory record by scanning back from the
/// tail through the longest possible comment.
fn find_eocd(src: &Arc<dyn ReadAt>, size: u64) -> Result<(u64, Vec<u8>)> {
    let tail_len = size.min(u64::from(u16::MAX) + 22);
    let tail_off = size - tail_len;
    let mut tail = vec![0u8; usize::try_from(tail_len).map_err(|_| Error::Truncated)?];
    if src.read_at(&mut tail, tail_off)? < tail.len() {
        return Err(Error::Truncated);
    }
    for i in (0..tail.len().saturating_sub(21)).rev() {
        if LittleEndian::read_u32(&tail[i..i + 4]) == EOCD_SIG {
            return Ok((tail_off + i as u64, tail[i..].to_vec()));
        }
    }
    Err(Error::BadMagic)
}

pub fn new_zip(src: Arc<dyn ReadAt>, size: u64) -> Result<Arc<FsSkeleton>> {
    if size < 22 {
        return Err(Error::Truncated);
    }
    let (eocd_pos, eocd) = find_eocd(&src, size)?;
    let entries = u64::from(LittleEndian::read_u16(&eocd[10..12]));
    let cd_size = u64::from(LittleEndian::read_u32(&eocd[12..16]));
    let cd_offset = u64::from(LittleEndian::read_u32(&eocd[16..20]));
    if cd_size > eocd_pos {
        return Err(Error::BadHeader("central directory overruns archive".into()));
    }
    // Self-extracting archives carry a stub before the zip proper; every
    // stored offset is shifted by its length.
    let cd_start = eocd_pos - cd_size;
    let shift = cd_start
        .checked_sub(cd_offset)
        .ok_or_else(|| Error::BadHeader("central directory offset".into()))?;

    let mut cd = vec![0u8; usize::try_from(cd_size).map_err(|_| Error::Truncated)?];
    if src.read_at(&mut cd, cd_start)? < cd.len() {
        return Err(Error::Truncated);
    }

    let skel = Arc::new(FsSkeleton::new());
    let mut pos = 0usize;
    for order in 0..entries {
        let hdr = cd.get(pos..pos + 46).ok_or(Error::Truncated)?;
        if LittleEndian::read_u32(&hdr[0..4]) != CENTRAL_SIG {
            return Err(Error::BadHeader("central directory entry signature".into()));
        }
        let gp_flags = LittleEndian::read_u16(&hdr[8..10]);
        let method = LittleEndian::read_u16(&hdr[10..12]);
        let mtime = dos_time(
            LittleEndian::read_u16(&hdr[14..16]),
            LittleEndian::read_u16(&hdr[12..14]),
        );
        let csize = u64::from(LittleEndian::read_u32(&hdr[20..24]));
        let usize_ = u64::from(LittleEndian::read_u32(&hdr[24..28]));
        let name_len = usize::from(LittleEndian::read_u16(&hdr[28..30]));
        let extra_len = usize::from(LittleEndian::read_u16(&hdr[30..32]));
        let comment_len = usize::from(LittleEndian::read_u16(&hdr[32..34]));
        let local_off = u64::from(LittleEndian::read_u32(&hdr[42..46])) + shift;

        let name_raw = cd
            .get(pos + 46..pos + 46 + name_len)
            .ok_or(Error::Truncated)?;
        let name = String::from_utf8_lossy(name_raw).into_owned();
        pos += 46 + name_len + extra_len + comment_len;

        let attrs = NodeAttrs {
            mode: 0o644,
            mtime,
            sys: SysHandle::Record { index: order },
            order: i64::try_from(order).unwrap_or(i64::MAX),
        };

        if name.ends_with('/') {
            let dir = name.trim_end_matches('/');
            if !dir.is_empty() {
                skel.create_dir(dir, NodeAttrs { mode: 0o755, ..attrs })?;
            }
            continue;
        }

        // The local header's own name/extra lengths decide where the
        // payload really starts.
        let mut local = [0u8; 30];
        if src.read_at(&mut local, local_off)? < local.len() {
            return Err(Error::Truncated);
        }
        if LittleEndian::read_u32(&local[0..4]) != LOCAL_SIG {
            return Err(Error::BadHeader(format!("local header of {name}")));
        }
        let l_name = u64::from(LittleEndian::read_u16(&local[26..28]));
        let l_extra = u64::from(LittleEndian::read_u16(&local[28..30]));
        let data_off = local_off + 30 + l_name + l_extra;

        if gp_flags & FLAG_ENCRYPTED != 0 {
            skel.create_file_random(&name, Arc::new(PasswordReader), usize_, attrs)?;
            continue;
        }

        match method {
            methods::STORE => {
                if data_off + usize_ > size {
                    return Err(Error::Truncated);
                }
                skel.create_file_random(
                    &name,
                    Arc::new(SectionReader::new(src.clone(), data_off, usize_)),
                    usize_,
                    attrs,
                )?;
            }
            methods::DEFLATE => {
                let opener = Arc::new(DeflateOpener { src: src.clone(), off: data_off, len: csize });
                skel.create_file_sequential(
                    &name,
                    opener,
                    i64::try_from(usize_).unwrap_or(-1),
                    attrs,
                )?;
            }
            other => {
                debug!("zip entry {} uses unsupported method {}", name, other);
                skel.create_file_defect(
                    &name,
                    i64::try_from(usize_).unwrap_or(-1),
                    Error::UnsupportedAlgorithm(other.min(255) as u8),
                    attrs,
                )?;
            }
        }
    }

    skel.no_more();
    Ok(skel)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vfs::{ArchiveFs, FileBody};

    /// A stored-only zip writer for test images.
    pub fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (name, content) in entries {
            let local_off = out.len() as u32;
            let crc = {
                let c = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
                c.checksum(content)
            };
            out.extend_from_slice(&LOCAL_SIG.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // ver, flags, method, time, date
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(content.len() as u32).to_le_bytes());
            out.extend_from_slice(&(content.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(content);

            central.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&(content.len() as u32).to_le_bytes());
            central.extend_from_slice(&(content.len() as u32).to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0u8; 12]);
            central.extend_from_slice(&local_off.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }
        let cd_off = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(&EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_off.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn stored_entries_are_windows() {
        let img = make_zip(&[("dir/", b""), ("dir/a.txt", b"alpha"), ("b.bin", b"\x00\x01")]);
        let size = img.len() as u64;
        let fs = new_zip(Arc::new(img), size).unwrap();

        assert_eq!(fs.stat("dir/a.txt").unwrap().size, 5);
        let h = fs.open("dir/a.txt").unwrap();
        let FileBody::Random(r) = h.body else { panic!("not random") };
        let mut buf = [0u8; 8];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"alpha");
        assert_eq!(fs.stat("b.bin").unwrap().size, 2);
    }

    #[test]
    fn self_extracting_stub_shifts_offsets() {
        let plain = make_zip(&[("f", b"payload")]);
        let mut sfx = b"MZ fake executable stub".to_vec();
        sfx.extend_from_slice(&plain);
        let size = sfx.len() as u64;
        let fs = new_zip(Arc::new(sfx), size).unwrap();
        let h = fs.open("f").unwrap();
        let FileBody::Random(r) = h.body else { panic!("not random") };
        let mut buf = [0u8; 16];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
    }

    #[test]
    fn garbage_is_rejected() {
        let img = vec![0u8; 100];
        assert!(new_zip(Arc::new(img), 100).is_err());
    }

    #[test]
    fn dos_times_convert() {
        // 2003-07-04 12:30:10
        let date = ((2003 - 1980) << 9 | 7 << 5 | 4) as u16;
        let time = (12 << 11 | 30 << 5 | 5) as u16;
        let t = dos_time(date, time);
        let secs = t.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_057_321_810);
    }
}
