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
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{error::DecodeError, Decode};

use super::definitions::MAC_EPOCH_TO_UNIX;
use super::error::{Error, Result};

/// Decode a Bincode structure from a byte slice.
///
/// Every on-disk structure in this crate is big-endian with fixed-width
/// integers, so one config serves all parsers.
pub fn decode<T>(bytes: &[u8]) -> std::result::Result<(T, usize), DecodeError>
    where T: Decode<()>
{
    let config = bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding();
    bincode::decode_from_slice(bytes, config)
}

/// Like [`decode`], but maps a short buffer or malformed field to the
/// crate-level [`Error::Truncated`].
pub fn decode_or_truncated<T>(bytes: &[u8]) -> Result<(T, usize)>
    where T: Decode<()>
{
    decode(bytes).map_err(|_| Error::Truncated)
}

/// Read a Pascal string: one length byte followed by up to `cap` bytes.
/// Returns the raw (untranslated) bytes.
pub fn pascal_string(buf: &[u8], cap: usize) -> Result<&[u8]> {
    let len = usize::from(*buf.first().ok_or(Error::Truncated)?);
    if len > cap || buf.len() < 1 + len {
        return Err(Error::BadHeader(format!("pascal string length {len}")));
    }
    Ok(&buf[1..1 + len])
}

/// Round up to the next even offset.
pub fn round_even(n: usize) -> usize {
    (n + 1) & !1
}

/// Convert a Mac-epoch timestamp (seconds since 1904-01-01T00:00:00Z) to
/// wall-clock time.  Timestamps before the Unix epoch clamp to it.
pub fn mac_time(secs: u32) -> SystemTime {
    match u64::from(secs).checked_sub(MAC_EPOCH_TO_UNIX) {
        Some(unix) => UNIX_EPOCH + Duration::from_secs(unix),
        None => UNIX_EPOCH,
    }
}

/// The inverse of [`mac_time`], saturating at zero.
pub fn to_mac_time(t: SystemTime) -> u32 {
    let unix = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    u32::try_from(unix + MAC_EPOCH_TO_UNIX).unwrap_or(u32::MAX)
}
