// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Framing of the opcode stream (protocol 4 and up).
//!
//! A frame is `FRAME` followed by an 8-byte little-endian payload length
//! and the payload.  Frames end at opcode boundaries, so the opcode layer
//! never sees them, except that the decoder reads the FRAME opcode itself
//! and hands the length to `Unframer::load_frame`.
//!
//! The writer checks the frame size before each value and before each
//! length-prefixed payload.  A frame can therefore overshoot the target
//! only by the short fixed-size opcodes written between two checks.

use std::io::{self, Read, Write};
use std::mem;
use byteorder::{LittleEndian, WriteBytesExt};
use log::trace;

use crate::consts::{FRAME, FRAME_SIZE_MIN, FRAME_SIZE_TARGET};
use crate::error::{Error, ErrorCode, Result};

/// Frame writer: buffers opcodes and writes them out in frames.
///
/// Without framing started, everything goes straight to the writer.
pub(crate) struct Framer<W> {
    writer: W,
    frame: Option<Vec<u8>>,
}

impl<W: Write> Framer<W> {
    pub fn new(writer: W) -> Framer<W> {
        Framer { writer, frame: None }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn start_framing(&mut self) {
        self.frame = Some(Vec::with_capacity(FRAME_SIZE_TARGET));
    }

    pub fn end_framing(&mut self) -> io::Result<()> {
        self.commit_frame(true)?;
        self.frame = None;
        Ok(())
    }

    /// Writes out the buffered frame once it has reached the target size,
    /// or unconditionally with `force`.  Call only between opcodes.
    pub fn commit_frame(&mut self, force: bool) -> io::Result<()> {
        let data = match self.frame {
            Some(ref mut frame) if force || frame.len() >= FRAME_SIZE_TARGET =>
                mem::replace(frame, Vec::with_capacity(FRAME_SIZE_TARGET)),
            _ => return Ok(()),
        };
        if data.len() >= FRAME_SIZE_MIN {
            trace!("committing frame of {} bytes", data.len());
            self.writer.write_u8(FRAME)?;
            self.writer.write_u64::<LittleEndian>(data.len() as u64)?;
        }
        self.writer.write_all(&data)
    }

    /// Commits the current frame early if an opcode of `len` bytes would
    /// push it past the target size.  Call only between opcodes.
    pub fn reserve(&mut self, len: usize) -> io::Result<()> {
        let full = match self.frame {
            Some(ref frame) => !frame.is_empty() && frame.len() + len > FRAME_SIZE_TARGET,
            None => false,
        };
        if full {
            self.commit_frame(true)?;
        }
        Ok(())
    }

    /// Drops the frame being built, and stops framing.
    pub fn discard_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            trace!("discarding unfinished frame of {} bytes", frame.len());
        }
    }

    /// Writes an opcode header and a payload too big to be worth framing:
    /// the current frame is committed, and the payload bypasses the buffer.
    pub fn write_large(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        if self.frame.is_some() {
            self.commit_frame(true)?;
            self.writer.write_all(header)?;
            self.writer.write_all(payload)
        } else {
            self.write_all(header)?;
            self.write_all(payload)
        }
    }

    pub fn is_framing(&self) -> bool {
        self.frame.is_some()
    }
}

impl<W: Write> Write for Framer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.frame {
            Some(ref mut frame) => frame.write(buf),
            None => self.writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Frame reader: serves reads from the current frame, or from the
/// underlying reader between frames and in unframed streams.
///
/// Tracks the absolute stream offset for error reporting.
pub(crate) struct Unframer<R> {
    rdr: R,
    frame: Vec<u8>,
    frame_pos: usize,
    pos: usize,
}

impl<R: Read> Unframer<R> {
    pub fn new(rdr: R) -> Unframer<R> {
        Unframer {
            rdr,
            frame: Vec::new(),
            frame_pos: 0,
            pos: 0,
        }
    }

    /// Offset of the next byte to be read.
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn frame_left(&self) -> usize {
        self.frame.len() - self.frame_pos
    }

    fn error<T>(&self, code: ErrorCode) -> Result<T> {
        Err(Error::Eval(code, self.pos))
    }

    /// Reads the payload of a frame whose header was just consumed.
    pub fn load_frame(&mut self, len: u64) -> Result<()> {
        if self.frame_left() > 0 {
            return self.error(ErrorCode::FrameOverlap(self.frame_left()));
        }
        let mut frame = Vec::new();
        (&mut self.rdr).take(len).read_to_end(&mut frame)?;
        if (frame.len() as u64) < len {
            return self.error(ErrorCode::TruncatedFrame {
                declared: len,
                available: frame.len() as u64,
            });
        }
        trace!("loaded frame of {} bytes at offset {}", len, self.pos);
        self.frame = frame;
        self.frame_pos = 0;
        Ok(())
    }

    /// Reads exactly `n` bytes.
    pub fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        let left = self.frame_left();
        if left > 0 {
            if (left as u64) < n {
                return self.error(ErrorCode::FrameExhausted);
            }
            let n = n as usize;
            let data = self.frame[self.frame_pos..self.frame_pos + n].to_vec();
            self.frame_pos += n;
            self.pos += n;
            return Ok(data);
        }
        let mut data = Vec::new();
        (&mut self.rdr).take(n).read_to_end(&mut data)?;
        self.pos += data.len();
        if (data.len() as u64) < n {
            return self.error(ErrorCode::EOFWhileParsing);
        }
        Ok(data)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.frame_left() > 0 {
            let byte = self.frame[self.frame_pos];
            self.frame_pos += 1;
            self.pos += 1;
            return Ok(byte);
        }
        let mut buf = [0u8];
        loop {
            return match self.rdr.read(&mut buf) {
                Ok(0) => self.error(ErrorCode::EOFWhileParsing),
                Ok(_) => { self.pos += 1; Ok(buf[0]) }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(Error::Io(e)),
            };
        }
    }

    /// Reads a newline-terminated argument, without the newline (and
    /// without a preceding carriage return).
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = if self.frame_left() > 0 {
            let rest = &self.frame[self.frame_pos..];
            let end = match rest.iter().position(|&b| b == b'\n') {
                Some(i) => i,
                None => return self.error(ErrorCode::FrameExhausted),
            };
            let line = rest[..end].to_vec();
            self.frame_pos += end + 1;
            self.pos += end + 1;
            line
        } else {
            let mut line = Vec::with_capacity(16);
            loop {
                match self.read_byte()? {
                    b'\n' => break,
                    ch => line.push(ch),
                }
            }
            line
        };
        if result.last() == Some(&b'\r') {
            result.pop();
        }
        Ok(result)
    }

    /// Whether the stream has no more bytes.
    pub fn at_end(&mut self) -> Result<bool> {
        if self.frame_left() > 0 {
            return Ok(false);
        }
        let mut buf = [0u8];
        loop {
            return match self.rdr.read(&mut buf) {
                Ok(0) => Ok(true),
                Ok(_) => Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(Error::Io(e)),
            };
        }
    }
}
