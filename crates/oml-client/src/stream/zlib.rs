// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gzip-framed deflate wrapper around any [`OutStream`], plus the
//! resync-tolerant inflate helper used by offline recovery tools.
//!
//! # Wire format
//!
//! The stream opens with the standard 10-byte gzip header (`1F 8B ...`),
//! carries a single deflate member, and ends with the crc32/length trailer.
//! Every message-group write ends with a `Sync` flush, which leaves an
//! empty-block boundary (`00 00 FF FF`) in the stream. A reader that finds
//! the tail of the file damaged can scan forward for either marker and
//! resume inflation there:
//! - `1F 8B` -- a fresh gzip member follows (the collector reopened the file)
//! - `00 00 FF FF` -- deflate data resumes on a byte boundary just past it

use super::{OutStream, StreamError};
use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};
use thiserror::Error;
use tracing::debug;

/// gzip magic, deflate method, no flags, zero mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BLOCK_BOUNDARY: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK: usize = 32 * 1024;
const DEFLATE_CHUNK: usize = 8 * 1024;

/// Inflate failures.
#[derive(Debug, Error)]
pub enum ZlibError {
    #[error("not a gzip stream")]
    BadHeader,
    #[error("corrupt deflate data: {0}")]
    Data(String),
    #[error("stream ended before the deflate stream was complete")]
    Truncated,
}

/// Deflating wrapper around another output stream.
///
/// The metadata header is fed through deflate exactly once (reconnection
/// replay is the inner stream's business for uncompressed sinks; compressed
/// sinks are file-backed where the transport never goes stale).
pub struct ZlibOutStream {
    inner: Box<dyn OutStream>,
    comp: Compress,
    crc: Crc,
    dest: String,
    gzip_header_written: bool,
    meta_sent: bool,
}

impl ZlibOutStream {
    /// Wrap `inner`, compressing everything written through it.
    pub fn new(inner: Box<dyn OutStream>) -> Self {
        let dest = format!("zlib+{}", inner.dest());
        Self {
            inner,
            comp: Compress::new(Compression::default(), false),
            crc: Crc::new(),
            dest,
            gzip_header_written: false,
            meta_sent: false,
        }
    }

    fn deflate_into(
        &mut self,
        input: &[u8],
        flush: FlushCompress,
        out: &mut Vec<u8>,
    ) -> Result<(), StreamError> {
        let mut consumed = 0usize;
        loop {
            let before_in = self.comp.total_in();
            out.reserve(DEFLATE_CHUNK);
            let status = self
                .comp
                .compress_vec(&input[consumed..], out, flush)
                .map_err(|e| StreamError::Deflate {
                    dest: self.dest.clone(),
                    message: e.to_string(),
                })?;
            consumed += (self.comp.total_in() - before_in) as usize;

            if status == Status::StreamEnd {
                return Ok(());
            }
            // All input taken and the output buffer was not filled to the
            // brim: deflate has nothing more to emit for this flush level.
            if consumed == input.len() && out.capacity() > out.len() {
                return Ok(());
            }
        }
    }

    fn forward(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if !self.gzip_header_written {
            self.inner.write(&GZIP_HEADER, &[])?;
            self.gzip_header_written = true;
        }
        if !bytes.is_empty() {
            self.inner.write(bytes, &[])?;
        }
        Ok(())
    }
}

impl OutStream for ZlibOutStream {
    fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError> {
        let mut out = Vec::new();

        if !self.meta_sent && !header.is_empty() {
            self.deflate_into(header, FlushCompress::None, &mut out)?;
            self.crc.update(header);
            self.meta_sent = true;
        }

        // Sync-flush each message group so a damaged file remains
        // resynchronisable at the next group boundary.
        self.deflate_into(body, FlushCompress::Sync, &mut out)?;
        self.crc.update(body);

        self.forward(&out)?;
        Ok(body.len())
    }

    fn close(&mut self) -> Result<(), StreamError> {
        let mut out = Vec::new();
        self.deflate_into(&[], FlushCompress::Finish, &mut out)?;

        // gzip trailer: crc32 and input length, little-endian.
        out.extend_from_slice(&self.crc.sum().to_le_bytes());
        out.extend_from_slice(&self.crc.amount().to_le_bytes());

        self.forward(&out)?;
        debug!("closed {} after {} input bytes", self.dest, self.crc.amount());
        self.inner.close()
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}

/// Find the earliest resync marker in `buf`.
///
/// Returns the offset of the first occurrence of either the gzip magic
/// (`1F 8B`) or the empty-block boundary (`00 00 FF FF`).
pub fn find_sync(buf: &[u8]) -> Option<usize> {
    (0..buf.len())
        .find(|&i| buf[i..].starts_with(&GZIP_MAGIC) || buf[i..].starts_with(&BLOCK_BOUNDARY))
}

/// Parse a gzip member header, returning its length.
fn parse_gzip_header(buf: &[u8]) -> Result<usize, ZlibError> {
    if buf.len() < 10 || buf[..2] != GZIP_MAGIC || buf[2] != 0x08 {
        return Err(ZlibError::BadHeader);
    }
    let flg = buf[3];
    let mut pos = 10usize;

    if flg & 0x04 != 0 {
        // FEXTRA
        if buf.len() < pos + 2 {
            return Err(ZlibError::BadHeader);
        }
        let xlen = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    for mask in [0x08u8, 0x10] {
        // FNAME / FCOMMENT: nul-terminated
        if flg & mask != 0 {
            match buf[pos.min(buf.len())..].iter().position(|&b| b == 0) {
                Some(nul) => pos += nul + 1,
                None => return Err(ZlibError::BadHeader),
            }
        }
    }
    if flg & 0x02 != 0 {
        // FHCRC
        pos += 2;
    }
    if pos > buf.len() {
        return Err(ZlibError::BadHeader);
    }
    Ok(pos)
}

/// Inflate a raw deflate stream from `buf` into `out`.
///
/// Returns the number of input bytes consumed and whether the deflate
/// stream reached its end marker.
fn inflate_raw(buf: &[u8], out: &mut Vec<u8>) -> (usize, Result<bool, ZlibError>) {
    let mut d = Decompress::new(false);
    loop {
        let before_in = d.total_in();
        let before_out = d.total_out();
        out.reserve(INFLATE_CHUNK);
        let rest = &buf[before_in as usize..];
        match d.decompress_vec(rest, out, FlushDecompress::None) {
            Ok(Status::StreamEnd) => return (d.total_in() as usize, Ok(true)),
            Ok(Status::Ok) | Ok(Status::BufError) => {
                // Input exhausted and the output buffer not filled to the
                // brim: nothing more can come out.
                if d.total_in() as usize >= buf.len() && out.capacity() > out.len() {
                    return (d.total_in() as usize, Ok(false));
                }
                if d.total_in() == before_in && d.total_out() == before_out {
                    return (
                        d.total_in() as usize,
                        Err(ZlibError::Data("inflate stalled".to_string())),
                    );
                }
            }
            Err(e) => return (d.total_in() as usize, Err(ZlibError::Data(e.to_string()))),
        }
    }
}

/// Inflate a possibly damaged gzip stream, resynchronising at markers.
///
/// Damaged or missing regions are skipped by scanning for the next resync
/// marker; everything recoverable lands in the returned buffer. The call
/// succeeds iff inflation terminates in the stream-end state, i.e. the last
/// recovered member (or resumed block run) was complete.
pub fn inflate_resync(input: &[u8]) -> Result<Vec<u8>, ZlibError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut ended = false;

    while pos < input.len() {
        let mut advanced = false;

        if let Ok(hlen) = parse_gzip_header(&input[pos..]) {
            let member_start = out.len();
            let (consumed, res) = inflate_raw(&input[pos + hlen..], &mut out);
            match res {
                Ok(true) => {
                    pos += hlen + consumed;
                    // Verify the crc when a full trailer is present.
                    if input.len() - pos >= 8 {
                        let stored =
                            u32::from_le_bytes([input[pos], input[pos + 1], input[pos + 2], input[pos + 3]]);
                        let mut crc = Crc::new();
                        crc.update(&out[member_start..]);
                        if crc.sum() != stored {
                            return Err(ZlibError::Data("crc mismatch".to_string()));
                        }
                    }
                    pos += 8.min(input.len() - pos);
                    ended = true;
                    advanced = true;
                }
                Ok(false) => {
                    // Input exhausted mid-member: truncated tail.
                    pos = input.len();
                    ended = false;
                    advanced = true;
                }
                Err(e) => {
                    debug!("inflate error at offset {pos}: {e}, hunting for resync marker");
                    ended = false;
                }
            }
        }

        if !advanced {
            // Damage: hunt for the next resync marker past this byte.
            let Some(off) = find_sync(&input[pos + 1..]) else {
                break;
            };
            let mpos = pos + 1 + off;
            if input[mpos..].starts_with(&GZIP_MAGIC) {
                pos = mpos;
            } else {
                // Empty-block boundary: deflate data resumes just past it.
                let resume = mpos + BLOCK_BOUNDARY.len();
                let (consumed, res) = inflate_raw(&input[resume..], &mut out);
                match res {
                    Ok(true) => {
                        pos = resume + consumed;
                        pos += 8.min(input.len() - pos);
                        ended = true;
                    }
                    Ok(false) => {
                        pos = input.len();
                        ended = false;
                    }
                    Err(_) => {
                        pos = resume;
                        ended = false;
                    }
                }
            }
        }
    }

    if ended {
        Ok(out)
    } else {
        Err(ZlibError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStream;

    fn compressed(groups: &[&[u8]], header: &[u8]) -> Vec<u8> {
        let (mock, state) = MockStream::new();
        let mut sink = ZlibOutStream::new(Box::new(mock));
        for group in groups {
            sink.write(group, header).unwrap();
        }
        sink.close().unwrap();
        state.written()
    }

    #[test]
    fn test_stream_starts_with_gzip_magic() {
        let bytes = compressed(&[b"hello"], &[]);
        assert_eq!(&bytes[..2], &GZIP_MAGIC);
    }

    #[test]
    fn test_sync_flush_leaves_block_boundary() {
        let bytes = compressed(&[b"group one", b"group two"], &[]);
        assert!(
            bytes.windows(4).any(|w| w == BLOCK_BOUNDARY),
            "no empty-block boundary in {bytes:02x?}"
        );
    }

    #[test]
    fn test_deflate_inflate_round_trip() {
        let payload: Vec<u8> = (0u32..4096).map(|i| (i * 31 % 251) as u8).collect();
        let half = payload.len() / 2;
        let bytes = compressed(&[&payload[..half], &payload[half..]], b"schema-prologue ");

        let inflated = inflate_resync(&bytes).unwrap();
        let mut expected = b"schema-prologue ".to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(inflated, expected);
    }

    #[test]
    fn test_header_compressed_once() {
        let bytes = compressed(&[b"a", b"b", b"c"], b"META|");
        let inflated = inflate_resync(&bytes).unwrap();
        assert_eq!(inflated, b"META|abc");
    }

    #[test]
    fn test_find_sync_earliest_marker() {
        let buf = [0x41, 0x00, 0x00, 0xff, 0xff, 0x1f, 0x8b];
        assert_eq!(find_sync(&buf), Some(1));
        let buf = [0x41, 0x1f, 0x8b, 0x00, 0x00, 0xff, 0xff];
        assert_eq!(find_sync(&buf), Some(1));
        assert_eq!(find_sync(b"no markers here"), None);
    }

    #[test]
    fn test_resync_skips_garbage_between_members() {
        let member1 = compressed(&[b"first run "], &[]);
        let member2 = compressed(&[b"second run"], &[]);

        let mut damaged = member1;
        damaged.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        damaged.extend_from_slice(&member2);

        let inflated = inflate_resync(&damaged).unwrap();
        assert_eq!(inflated, b"first run second run");
    }

    #[test]
    fn test_resync_recovers_member_after_truncation() {
        let member1 = compressed(&[b"doomed data that will be cut short"], &[]);
        let member2 = compressed(&[b"survivor"], &[]);

        // Cut the first member early enough that the inflate attempt trips
        // over the second member's header bytes and has to resynchronise.
        let mut damaged = member1[..5].to_vec();
        damaged.extend_from_slice(&member2);

        let inflated = inflate_resync(&damaged).unwrap();
        assert!(
            inflated.ends_with(b"survivor"),
            "recovered {:?}",
            String::from_utf8_lossy(&inflated)
        );
    }

    #[test]
    fn test_resync_at_block_boundary() {
        // Raw deflate run preceded by garbage and an explicit boundary:
        // the helper must resume at the byte past 00 00 FF FF.
        let mut comp = Compress::new(Compression::default(), false);
        let mut tail = Vec::new();
        let input = b"tail";
        let mut consumed = 0usize;
        loop {
            tail.reserve(1024);
            let before = comp.total_in();
            let status = comp
                .compress_vec(&input[consumed..], &mut tail, FlushCompress::Finish)
                .unwrap();
            consumed += (comp.total_in() - before) as usize;
            if status == Status::StreamEnd {
                break;
            }
        }

        let mut damaged = vec![0x01, 0x02, 0x03];
        damaged.extend_from_slice(&BLOCK_BOUNDARY);
        damaged.extend_from_slice(&tail);

        let inflated = inflate_resync(&damaged).unwrap();
        assert_eq!(inflated, b"tail");
    }

    #[test]
    fn test_truncated_tail_without_marker_fails() {
        let member = compressed(&[b"only member, cut short"], &[]);
        let truncated = &member[..member.len() - 12];
        assert!(matches!(
            inflate_resync(truncated),
            Err(ZlibError::Truncated)
        ));
    }

    #[test]
    fn test_empty_input_is_truncated() {
        assert!(matches!(inflate_resync(&[]), Err(ZlibError::Truncated)));
    }
}
