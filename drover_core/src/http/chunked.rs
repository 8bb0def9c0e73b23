//! Incremental chunked transfer-encoding codec.
//!
//! The decoder is a push state machine: feed it whatever bytes arrived and it
//! hands back chunk payload slices without copying. The controller drives it
//! both to re-chunk request bodies towards workers and to find end-of-body in
//! worker responses that stream chunked.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ChunkSize,
    ChunkExtension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// One step of decoder progress.
#[derive(Debug, PartialEq, Eq)]
pub enum Event<'a> {
    /// A slice of chunk payload, borrowed from the input buffer.
    Data(&'a [u8]),
    /// The terminating chunk and trailers have been consumed.
    End,
    /// All input consumed without completing an event.
    NeedMore,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chunked encoding: {0}")]
pub struct ChunkedError(&'static str);

const MAX_CHUNK_SIZE: u64 = u64::MAX >> 8;

pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::ChunkSize,
            remaining: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes bytes from `input`, returning how many were eaten and the
    /// event they produced. Call repeatedly until `NeedMore` before reading
    /// more from the wire.
    pub fn feed<'a>(&mut self, input: &'a [u8]) -> Result<(usize, Event<'a>), ChunkedError> {
        let mut pos = 0;
        while pos < input.len() {
            let byte = input[pos];
            match self.state {
                State::ChunkSize => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (byte as char).to_digit(16).unwrap() as u64;
                        self.remaining = self.remaining * 16 + digit;
                        if self.remaining > MAX_CHUNK_SIZE {
                            return Err(ChunkedError("chunk size overflow"));
                        }
                        pos += 1;
                    }
                    b';' => {
                        self.state = State::ChunkExtension;
                        pos += 1;
                    }
                    b'\r' => {
                        self.state = State::SizeLf;
                        pos += 1;
                    }
                    _ => return Err(ChunkedError("unexpected byte in chunk size")),
                },
                State::ChunkExtension => {
                    if byte == b'\r' {
                        self.state = State::SizeLf;
                    }
                    pos += 1;
                }
                State::SizeLf => {
                    if byte != b'\n' {
                        return Err(ChunkedError("chunk size line missing LF"));
                    }
                    pos += 1;
                    self.state = if self.remaining == 0 {
                        State::TrailerStart
                    } else {
                        State::Data
                    };
                }
                State::Data => {
                    let take = (input.len() - pos).min(self.remaining as usize);
                    let data = &input[pos..pos + take];
                    pos += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = State::DataCr;
                    }
                    return Ok((pos, Event::Data(data)));
                }
                State::DataCr => {
                    if byte != b'\r' {
                        return Err(ChunkedError("chunk data missing CR"));
                    }
                    pos += 1;
                    self.state = State::DataLf;
                }
                State::DataLf => {
                    if byte != b'\n' {
                        return Err(ChunkedError("chunk data missing LF"));
                    }
                    pos += 1;
                    self.state = State::ChunkSize;
                }
                State::TrailerStart => {
                    if byte == b'\r' {
                        self.state = State::FinalLf;
                    } else {
                        self.state = State::TrailerLine;
                    }
                    pos += 1;
                }
                State::TrailerLine => {
                    if byte == b'\r' {
                        self.state = State::TrailerLf;
                    }
                    pos += 1;
                }
                State::TrailerLf => {
                    if byte != b'\n' {
                        return Err(ChunkedError("trailer line missing LF"));
                    }
                    pos += 1;
                    self.state = State::TrailerStart;
                }
                State::FinalLf => {
                    if byte != b'\n' {
                        return Err(ChunkedError("final chunk missing LF"));
                    }
                    pos += 1;
                    self.state = State::Done;
                    return Ok((pos, Event::End));
                }
                State::Done => return Err(ChunkedError("data after final chunk")),
            }
        }
        Ok((pos, Event::NeedMore))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes one chunk (size line, payload, CRLF).
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

/// Writes the terminating zero-size chunk.
pub async fn write_last_chunk<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(b"0\r\n\r\n").await
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, bool), ChunkedError> {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < input.len() {
            let (n, event) = decoder.feed(&input[pos..])?;
            pos += n;
            match event {
                Event::Data(data) => out.extend_from_slice(data),
                Event::End => return Ok((out, true)),
                Event::NeedMore => {}
            }
        }
        Ok((out, false))
    }

    #[test]
    fn decodes_simple_body() {
        let (out, done) = decode_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello world");
        assert!(done);
    }

    #[test]
    fn decodes_with_extension_and_trailer() {
        let (out, done) =
            decode_all(b"4;name=value\r\nabcd\r\n0\r\nExpires: soon\r\n\r\n").unwrap();
        assert_eq!(out, b"abcd");
        assert!(done);
    }

    #[test]
    fn survives_byte_at_a_time_delivery() {
        let input = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut done = false;
        for i in 0..input.len() {
            let mut slice = &input[i..i + 1];
            while !slice.is_empty() {
                let (n, event) = decoder.feed(slice).unwrap();
                match event {
                    Event::Data(data) => out.extend_from_slice(data),
                    Event::End => done = true,
                    Event::NeedMore => {}
                }
                slice = &slice[n..];
            }
        }
        assert_eq!(out, b"0123456789");
        assert!(done);
    }

    #[test]
    fn rejects_garbage_size() {
        assert!(decode_all(b"zz\r\nhello").is_err());
    }

    #[tokio::test]
    async fn encoder_round_trips_through_decoder() {
        let mut encoded = Vec::new();
        write_chunk(&mut encoded, b"hello ").await.unwrap();
        write_chunk(&mut encoded, b"world").await.unwrap();
        write_last_chunk(&mut encoded).await.unwrap();
        let (out, done) = decode_all(&encoded).unwrap();
        assert_eq!(out, b"hello world");
        assert!(done);
    }
}
