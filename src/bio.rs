/*
 * The copyright in this software is being made available under the 2-clauses
 * BSD License, included below. This software may be subject to other third
 * party and contributor rights, including patent rights, and no such rights
 * are granted under this license.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions
 * are met:
 * 1. Redistributions of source code must retain the above copyright
 *    notice, this list of conditions and the following disclaimer.
 * 2. Redistributions in binary form must reproduce the above copyright
 *    notice, this list of conditions and the following disclaimer in the
 *    documentation and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS `AS IS'
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
 * ARE DISCLAIMED.  IN NO EVENT SHALL THE COPYRIGHT OWNER OR CONTRIBUTORS BE
 * LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR
 * CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF
 * SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS
 * INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN
 * CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE)
 * ARISING IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
 * POSSIBILITY OF SUCH DAMAGE.
 */

//! Packet-header bit I/O.
//!
//! Packet headers are a bit stream with the marker-avoidance rule: after
//! an `0xFF` byte only seven bits of the following byte are used, so the
//! pair can never form a marker.

use crate::error::{Error, Result};

pub(crate) struct BioReader<'a> {
  data: &'a [u8],
  pos: usize,
  /// Two-byte sliding window; the low byte is the byte currently being
  /// consumed, the byte above it is its predecessor (for the stuffing
  /// rule).
  buf: u32,
  ct: u32,
}

impl<'a> BioReader<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    Self {
      data,
      pos: 0,
      buf: 0,
      ct: 0,
    }
  }

  /// Bytes consumed so far, rounded up to a whole byte.
  pub fn bytes_consumed(&self) -> usize {
    self.pos
  }

  fn bytein(&mut self) -> Result<()> {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    if self.pos < self.data.len() {
      self.buf |= self.data[self.pos] as u32;
      self.pos += 1;
      Ok(())
    } else {
      Err(Error::CorruptPacketHeader("bit stream overrun"))
    }
  }

  pub fn read_bit(&mut self) -> Result<u32> {
    if self.ct == 0 {
      self.bytein()?;
    }
    self.ct -= 1;
    Ok((self.buf >> self.ct) & 1)
  }

  pub fn read(&mut self, nbits: u32) -> Result<u32> {
    debug_assert!(nbits <= 32);
    let mut v = 0u32;
    for _ in 0..nbits {
      v = (v << 1) | self.read_bit()?;
    }
    Ok(v)
  }

  /// Byte alignment at the end of a packet header. If the last consumed
  /// byte was `0xFF`, its stuffed follower must be skipped too.
  pub fn align(&mut self) -> Result<()> {
    self.ct = 0;
    if (self.buf & 0xff) == 0xff {
      self.bytein()?;
      self.ct = 0;
    }
    Ok(())
  }

  /// Number-of-passes code: `1`, `10 x`, `1100`..`1101`, `1111 0000 0`..,
  /// up to the 7-bit tail.
  pub fn read_numpasses(&mut self) -> Result<u32> {
    if self.read_bit()? == 0 {
      return Ok(1);
    }
    if self.read_bit()? == 0 {
      return Ok(2);
    }
    let n = self.read(2)?;
    if n != 3 {
      return Ok(3 + n);
    }
    let n = self.read(5)?;
    if n != 31 {
      return Ok(6 + n);
    }
    Ok(37 + self.read(7)?)
  }

  /// Comma code: a run of 1s terminated by a 0.
  pub fn read_commacode(&mut self) -> Result<u32> {
    let mut n = 0;
    while self.read_bit()? == 1 {
      n += 1;
      if n > 32 {
        return Err(Error::CorruptPacketHeader("comma code overflow"));
      }
    }
    Ok(n)
  }
}

#[derive(Default)]
pub(crate) struct BioWriter {
  out: Vec<u8>,
  buf: u32,
  ct: u32,
}

impl BioWriter {
  pub fn new() -> Self {
    Self {
      out: Vec::new(),
      buf: 0,
      ct: 8,
    }
  }

  fn byteout(&mut self) {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    self.out.push((self.buf >> 8) as u8);
  }

  pub fn write_bit(&mut self, bit: u32) {
    debug_assert!(bit <= 1);
    if self.ct == 0 {
      self.byteout();
    }
    self.ct -= 1;
    self.buf |= bit << self.ct;
  }

  pub fn write(&mut self, v: u32, nbits: u32) {
    debug_assert!(nbits <= 32);
    for i in (0..nbits).rev() {
      self.write_bit((v >> i) & 1);
    }
  }

  pub fn write_numpasses(&mut self, n: u32) {
    debug_assert!((1..=164).contains(&n));
    if n == 1 {
      self.write(0, 1);
    } else if n == 2 {
      self.write(2, 2);
    } else if n <= 5 {
      self.write(0xc | (n - 3), 4);
    } else if n <= 36 {
      self.write(0x1e0 | (n - 6), 9);
    } else {
      self.write(0xff80 | (n - 37), 16);
    }
  }

  pub fn write_commacode(&mut self, n: u32) {
    for _ in 0..n {
      self.write_bit(1);
    }
    self.write_bit(0);
  }

  /// Flushes pending bits and returns the aligned header bytes.
  pub fn finish(mut self) -> Vec<u8> {
    self.byteout();
    if self.ct == 7 {
      // The final byte was 0xFF: emit the stuffed follower.
      self.byteout();
    }
    self.out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(bits: &[(u32, u32)]) {
    let mut w = BioWriter::new();
    for &(v, n) in bits {
      w.write(v, n);
    }
    let bytes = w.finish();
    let mut r = BioReader::new(&bytes);
    for &(v, n) in bits {
      assert_eq!(r.read(n).unwrap(), v);
    }
  }

  #[test]
  fn bit_roundtrip_with_stuffing() {
    // All-ones output forces 0xFF bytes, exercising the 7-bit rule.
    roundtrip(&[(0xffff, 16), (0x3fff, 14), (1, 1), (0, 1), (0x7f, 7)]);
    roundtrip(&[(0, 9), (0x1ff, 9), (0, 2)]);
  }

  #[test]
  fn numpasses_code() {
    for n in [1u32, 2, 3, 5, 6, 36, 37, 100, 164] {
      let mut w = BioWriter::new();
      w.write_numpasses(n);
      // Pad so the reader never overruns.
      w.write(0, 8);
      let bytes = w.finish();
      let mut r = BioReader::new(&bytes);
      assert_eq!(r.read_numpasses().unwrap(), n, "n={}", n);
    }
  }

  #[test]
  fn comma_code() {
    let mut w = BioWriter::new();
    for n in 0..8 {
      w.write_commacode(n);
    }
    let bytes = w.finish();
    let mut r = BioReader::new(&bytes);
    for n in 0..8 {
      assert_eq!(r.read_commacode().unwrap(), n);
    }
  }

  #[test]
  fn align_skips_stuffed_byte() {
    let mut w = BioWriter::new();
    w.write(0xff, 8);
    w.write(0, 1);
    let mut bytes = w.finish();
    bytes.push(0xab);
    let mut r = BioReader::new(&bytes);
    assert_eq!(r.read(8).unwrap(), 0xff);
    r.align().unwrap();
    assert_eq!(r.read(8).unwrap(), 0xab);
  }

  #[test]
  fn overrun_is_an_error() {
    let mut r = BioReader::new(&[0x80]);
    assert_eq!(r.read(8).unwrap(), 0x80);
    assert!(r.read_bit().is_err());
  }
}
