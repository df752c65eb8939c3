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
use std::io;

use thiserror::Error;

/// Every way a lookup, parse, or read can fail.
///
/// Parsers return these directly; the mount layer wraps them with the
/// failing path on the way out.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file does not exist")]
    NotFound,

    #[error("invalid path")]
    InvalidPath,

    #[error("not a recognized archive")]
    NotArchive,

    #[error("truncated input")]
    Truncated,

    #[error("bad magic number")]
    BadMagic,

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("password required")]
    PasswordRequired,

    #[error("unsupported compression algorithm {0}")]
    UnsupportedAlgorithm(u8),

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[from] io::Error),

    #[error("internal invariant violated: {0}")]
    Unrecoverable(String),

    #[error("{op} {path}: {source}")]
    Path {
        op: &'static str,
        path: String,
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach the failing path, unless one is already attached.
    pub fn at(self, op: &'static str, path: &str) -> Error {
        match self {
            Error::Path { .. } => self,
            other => Error::Path {
                op,
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with path wrappers stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Path { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound)
    }

    /// A structural copy, for when one failure must be delivered to several
    /// waiters.  `io::Error` is not `Clone`, so the I/O variant is rebuilt
    /// from its kind and message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::NotFound => Error::NotFound,
            Error::InvalidPath => Error::InvalidPath,
            Error::NotArchive => Error::NotArchive,
            Error::Truncated => Error::Truncated,
            Error::BadMagic => Error::BadMagic,
            Error::BadChecksum => Error::BadChecksum,
            Error::BadHeader(msg) => Error::BadHeader(msg.clone()),
            Error::PasswordRequired => Error::PasswordRequired,
            Error::UnsupportedAlgorithm(id) => Error::UnsupportedAlgorithm(*id),
            Error::UpstreamIo(e) => {
                Error::UpstreamIo(io::Error::new(e.kind(), e.to_string()))
            }
            Error::Unrecoverable(msg) => Error::Unrecoverable(msg.clone()),
            Error::Path { op, path, source } => Error::Path {
                op,
                path: path.clone(),
                source: Box::new(source.duplicate()),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match e.root() {
            Error::NotFound => io::ErrorKind::NotFound,
            Error::InvalidPath => io::ErrorKind::InvalidInput,
            Error::PasswordRequired => io::ErrorKind::PermissionDenied,
            Error::Truncated => io::ErrorKind::UnexpectedEof,
            Error::UpstreamIo(inner) => inner.kind(),
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_wrapping_is_idempotent() {
        let e = Error::NotFound.at("open", "a/b").at("stat", "c");
        match e {
            Error::Path { op, path, source } => {
                assert_eq!(op, "open");
                assert_eq!(path, "a/b");
                assert!(matches!(*source, Error::NotFound));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_preserves_io_kind() {
        let e = Error::UpstreamIo(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        match e.duplicate() {
            Error::UpstreamIo(inner) => assert_eq!(inner.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }
}
