//! Binary encoding of log entries and snapshot streams.
//!
//! Entry layout, repeated per entry with no separators:
//!
//! ```text
//! varint index | varint term | u8 is_topology_change | varint data length | data
//! ```
//!
//! Varints use 7-bit groups, least significant group first, with the high bit
//! set on every byte except the last.
//!
//! Snapshot bodies are framed as `varint length | chunk` frames closed by a
//! zero-length frame, so a receiver can tell a complete stream from a cut one.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt, future};

use crate::error::CodecError;
use crate::message::LogEntry;

pub const MAX_VARINT_LEN: usize = 10;

/// Snapshot bodies flow as fallible chunk streams.
pub type SnapshotStream = BoxStream<'static, io::Result<Bytes>>;

pub fn write_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn read_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        let byte = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(CodecError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

pub fn write_entry(buf: &mut impl BufMut, entry: &LogEntry) {
    write_varint(buf, entry.index);
    write_varint(buf, entry.term);
    buf.put_u8(u8::from(entry.is_topology_change));
    write_varint(buf, entry.data.len() as u64);
    buf.put_slice(&entry.data);
}

/// Decodes one entry. The payload shares memory with `buf`.
pub fn read_entry(buf: &mut Bytes) -> Result<LogEntry, CodecError> {
    let index = read_varint(buf)?;
    let term = read_varint(buf)?;
    if !buf.has_remaining() {
        return Err(CodecError::UnexpectedEof);
    }
    let is_topology_change = match buf.get_u8() {
        0 => false,
        1 => true,
        other => return Err(CodecError::InvalidFlag(other)),
    };
    let len = read_varint(buf)?;
    if (buf.remaining() as u64) < len {
        return Err(CodecError::UnexpectedEof);
    }
    let data = buf.split_to(len as usize);
    Ok(LogEntry {
        index,
        term,
        is_topology_change,
        data,
    })
}

pub fn encode_entries(entries: &[LogEntry]) -> Bytes {
    let capacity = entries
        .iter()
        .map(|e| e.data.len() + 3 * MAX_VARINT_LEN + 1)
        .sum();
    let mut buf = BytesMut::with_capacity(capacity);
    for entry in entries {
        write_entry(&mut buf, entry);
    }
    buf.freeze()
}

/// Decodes exactly `expected` entries; trailing bytes or a short body are errors.
pub fn decode_entries(mut buf: Bytes, expected: u64) -> Result<Vec<LogEntry>, CodecError> {
    let mut entries = Vec::with_capacity(expected.min(1024) as usize);
    while buf.has_remaining() {
        entries.push(read_entry(&mut buf)?);
    }
    if entries.len() as u64 != expected {
        return Err(CodecError::EntryCountMismatch {
            expected,
            actual: entries.len() as u64,
        });
    }
    Ok(entries)
}

pub fn frame_snapshot(body: SnapshotStream) -> SnapshotStream {
    body.try_filter(|chunk| future::ready(!chunk.is_empty()))
        .map_ok(|chunk| {
            let mut framed = BytesMut::with_capacity(chunk.len() + MAX_VARINT_LEN);
            write_varint(&mut framed, chunk.len() as u64);
            framed.extend_from_slice(&chunk);
            framed.freeze()
        })
        .chain(stream::once(future::ready(Ok(Bytes::from_static(&[0])))))
        .boxed()
}

enum Frame {
    Chunk(Bytes),
    End,
}

struct Unframer {
    input: SnapshotStream,
    buffer: BytesMut,
    done: bool,
}

impl Unframer {
    fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut peek = &self.buffer[..];
        let len = match read_varint(&mut peek) {
            Ok(len) => len,
            Err(CodecError::UnexpectedEof) => return Ok(None),
            Err(e) => return Err(e),
        };
        let header_len = self.buffer.len() - peek.len();
        if len == 0 {
            self.buffer.advance(header_len);
            return Ok(Some(Frame::End));
        }
        if (peek.len() as u64) < len {
            return Ok(None);
        }
        self.buffer.advance(header_len);
        Ok(Some(Frame::Chunk(self.buffer.split_to(len as usize).freeze())))
    }
}

/// Inverse of [`frame_snapshot`]. Yields an error if the input ends before the closing frame.
pub fn unframe_snapshot(input: SnapshotStream) -> SnapshotStream {
    let state = Unframer {
        input,
        buffer: BytesMut::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.next_frame() {
                Ok(Some(Frame::Chunk(chunk))) => return Some((Ok(chunk), state)),
                Ok(Some(Frame::End)) => {
                    state.done = true;
                    return None;
                }
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(io::Error::new(io::ErrorKind::InvalidData, e)), state));
                }
            }
            match state.input.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        CodecError::TruncatedSnapshot,
                    );
                    return Some((Err(err), state));
                }
            }
        }
    })
    .boxed()
}
