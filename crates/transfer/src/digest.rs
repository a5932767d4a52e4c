// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content checksums and lengths.
//!
//! The upload protocol wants the SHA-1 and exact length of every body as
//! request headers, so both are measured before any byte is sent. Streams are
//! hashed incrementally and rewound afterwards so the same bytes can be read
//! again for transmission.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use snafu::{ResultExt, ensure};

use crate::error::{FileReadSnafu, ShortReadSnafu, TransferError, ValidationSnafu};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self { Self { offset, length } }

    /// One past the last byte, or `None` if that overflows `u64`.
    #[must_use]
    pub const fn end(&self) -> Option<u64> { self.offset.checked_add(self.length) }
}

/// Absolute stream position of `range` for a stream entered at `origin`.
fn range_start(origin: u64, range: ByteRange) -> Result<u64, TransferError> {
    origin
        .checked_add(range.offset)
        .filter(|start| start.checked_add(range.length).is_some())
        .ok_or_else(|| TransferError::Validation {
            message: format!(
                "range {}+{} at stream position {origin} overflows",
                range.offset, range.length
            ),
        })
}

/// SHA-1 (lowercase hex) and byte length of some content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDigest {
    pub sha1:   String,
    pub length: u64,
}

impl ContentDigest {
    #[must_use]
    pub fn of_slice(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self {
            sha1:   format!("{:x}", hasher.finalize()),
            length: data.len() as u64,
        }
    }

    /// Digest of `range` within an in-memory buffer, or of all of it.
    pub fn of_buffer(data: &[u8], range: Option<ByteRange>) -> Result<Self, TransferError> {
        let slice = slice_range(data, range)?;
        Ok(Self::of_slice(slice))
    }

    /// Digest of a stream, from its current position to the end or over
    /// `range` (relative to the current position).
    ///
    /// The stream is left where it was found.
    pub fn of_stream<R>(stream: &mut R, range: Option<ByteRange>) -> Result<Self, TransferError>
    where
        R: Read + Seek + ?Sized,
    {
        let origin = stream.stream_position().context(FileReadSnafu)?;
        let result = hash_from(stream, origin, range);
        stream
            .seek(SeekFrom::Start(origin))
            .context(FileReadSnafu)?;
        result
    }
}

fn hash_from<R>(
    stream: &mut R,
    origin: u64,
    range: Option<ByteRange>,
) -> Result<ContentDigest, TransferError>
where
    R: Read + Seek + ?Sized,
{
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    let limit = match range {
        Some(range) => {
            let start = range_start(origin, range)?;
            stream
                .seek(SeekFrom::Start(start))
                .context(FileReadSnafu)?;
            Some(range.length)
        }
        None => None,
    };

    loop {
        let want = limit.map_or(buf.len(), |limit| {
            usize::try_from(limit - total).map_or(buf.len(), |left| left.min(buf.len()))
        });
        if want == 0 {
            break;
        }
        let n = stream.read(&mut buf[..want]).context(FileReadSnafu)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    if let Some(range) = range {
        ensure!(
            total == range.length,
            ShortReadSnafu {
                offset:   range.offset,
                expected: range.length,
                actual:   total,
            }
        );
    }

    Ok(ContentDigest {
        sha1:   format!("{:x}", hasher.finalize()),
        length: total,
    })
}

/// Reads exactly `range` (relative to the current position) into memory and
/// seeks back to where the stream was.
pub fn read_range<R>(stream: &mut R, range: ByteRange) -> Result<Bytes, TransferError>
where
    R: Read + Seek + ?Sized,
{
    let origin = stream.stream_position().context(FileReadSnafu)?;
    let start = range_start(origin, range)?;
    stream
        .seek(SeekFrom::Start(start))
        .context(FileReadSnafu)?;

    let capacity = usize::try_from(range.length).map_err(|_| TransferError::Validation {
        message: format!("range of {} bytes does not fit in memory", range.length),
    })?;
    let mut data = Vec::with_capacity(capacity);
    let read = Read::take(&mut *stream, range.length)
        .read_to_end(&mut data)
        .context(FileReadSnafu)?;

    stream
        .seek(SeekFrom::Start(origin))
        .context(FileReadSnafu)?;

    ensure!(
        read as u64 == range.length,
        ShortReadSnafu {
            offset:   range.offset,
            expected: range.length,
            actual:   read as u64,
        }
    );
    Ok(Bytes::from(data))
}

/// Borrow `range` out of a buffer, checking bounds.
pub fn slice_range(data: &[u8], range: Option<ByteRange>) -> Result<&[u8], TransferError> {
    let Some(range) = range else {
        return Ok(data);
    };
    let end = range.end().filter(|end| *end <= data.len() as u64);
    let Some(end) = end else {
        return ValidationSnafu {
            message: format!(
                "range {}+{} is outside a buffer of {} bytes",
                range.offset,
                range.length,
                data.len()
            ),
        }
        .fail();
    };
    #[allow(clippy::cast_possible_truncation)]
    let (start, end) = (range.offset as usize, end as usize);
    Ok(&data[start..end])
}
