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

//! MQ arithmetic coder (ISO/IEC 15444-1 Annex C).
//!
//! The decoder reads a logical stream that is the ordered concatenation of
//! a list of discontiguous byte chunks (one per layer contribution of a
//! segment). The 0xFF/0x90 marker rule holds across chunk junctions, and
//! a synthetic 0xFF fill is produced at logical end of stream.
//!
//! States are represented by their numeric index into a 47-row table; a
//! context is one byte, `(state_index << 1) | mps`. Index equality is
//! what the checkpoint logic compares, so there is no pointer identity
//! anywhere.

use crate::consts::{MQC_NUMCTXS, MQ_RED_ZONE, T1_CTXNO_AGG, T1_CTXNO_UNI, T1_CTXNO_ZC};

const A_MIN: u32 = 0x8000;

/// `ct` value marking a bypass run that has not yet produced bits.
const BYPASS_CT_INIT: u8 = 0xff;

#[derive(Clone, Copy)]
struct MqState {
  qe: u16,
  nmps: u8,
  nlps: u8,
  switch: bool,
}

macro_rules! mq_states {
  ($($qe:expr, $nmps:expr, $nlps:expr, $switch:expr;)+) => {
    [$(MqState { qe: $qe, nmps: $nmps, nlps: $nlps, switch: $switch }),+]
  };
}

/// Table C.2: Qe value and next-state links per state.
#[rustfmt::skip]
static MQ_STATES: [MqState; 47] = mq_states!(
  0x5601,  1,  1, true;
  0x3401,  2,  6, false;
  0x1801,  3,  9, false;
  0x0ac1,  4, 12, false;
  0x0521,  5, 29, false;
  0x0221, 38, 33, false;
  0x5601,  7,  6, true;
  0x5401,  8, 14, false;
  0x4801,  9, 14, false;
  0x3801, 10, 14, false;
  0x3001, 11, 17, false;
  0x2401, 12, 18, false;
  0x1c01, 13, 20, false;
  0x1601, 29, 21, false;
  0x5601, 15, 14, true;
  0x5401, 16, 14, false;
  0x5101, 17, 15, false;
  0x4801, 18, 16, false;
  0x3801, 19, 17, false;
  0x3401, 20, 18, false;
  0x3001, 21, 19, false;
  0x2801, 22, 19, false;
  0x2401, 23, 20, false;
  0x2201, 24, 21, false;
  0x1c01, 25, 22, false;
  0x1801, 26, 23, false;
  0x1601, 27, 24, false;
  0x1401, 28, 25, false;
  0x1201, 29, 26, false;
  0x1101, 30, 27, false;
  0x0ac1, 31, 28, false;
  0x09c1, 32, 29, false;
  0x08a1, 33, 30, false;
  0x0521, 34, 31, false;
  0x0441, 35, 32, false;
  0x02a1, 36, 33, false;
  0x0221, 37, 34, false;
  0x0141, 38, 35, false;
  0x0111, 39, 36, false;
  0x0085, 40, 37, false;
  0x0049, 41, 38, false;
  0x0025, 42, 39, false;
  0x0015, 43, 40, false;
  0x0009, 44, 41, false;
  0x0005, 45, 42, false;
  0x0001, 45, 43, false;
  0x5601, 46, 46, false;
);

/// Complete copyable record of the decoder side of an MQ coder, captured
/// when the red zone is entered and reinstated on differential
/// re-decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MqSnapshot {
  pub a: u32,
  pub c: u32,
  pub ct: u8,
  pub curctx: u8,
  pub ctxs: [u8; MQC_NUMCTXS],
  pub chunk: usize,
  pub pos: usize,
  pub end_count: u32,
}

pub(crate) struct MqCoder {
  pub a: u32,
  pub c: u32,
  pub ct: u8,
  /// `(state_index << 1) | mps` per context.
  pub ctxs: [u8; MQC_NUMCTXS],
  pub curctx: u8,

  // Decoder cursor: `(chunk, pos)` names the byte most recently
  // incorporated into `c`. `pos` may sit one past the end of its chunk
  // right after a junction crossing; the next read normalises it.
  pub chunk: usize,
  pub pos: usize,
  /// Synthetic 0xFF fills consumed at logical end of stream.
  pub end_count: u32,
  /// Set when the decoder had to peek past the final chunk.
  pub overflow: bool,

  // Encoder buffer. `out[0]` is a scratch byte so the carry in byteout
  // always has a predecessor to land on; `bp` indexes `out`.
  out: Vec<u8>,
  bp: usize,
}

impl Default for MqCoder {
  fn default() -> Self {
    Self {
      a: 0,
      c: 0,
      ct: 0,
      ctxs: [0; MQC_NUMCTXS],
      curctx: 0,
      chunk: 0,
      pos: 0,
      end_count: 0,
      overflow: false,
      out: Vec::new(),
      bp: 0,
    }
  }
}

impl MqCoder {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn set_ctx(&mut self, ctxno: u8) {
    self.curctx = ctxno;
  }

  /// Initial context states per D.2: everything at state 0 except UNI
  /// (46), AGG (3) and the first ZC context (4).
  pub fn reset_states(&mut self) {
    self.ctxs = [0; MQC_NUMCTXS];
    self.ctxs[T1_CTXNO_UNI as usize] = 46 << 1;
    self.ctxs[T1_CTXNO_AGG as usize] = 3 << 1;
    self.ctxs[T1_CTXNO_ZC as usize] = 4 << 1;
  }

  // ----------------------------------------------------------------- //
  // Decoder                                                           //
  // ----------------------------------------------------------------- //

  fn dec_rewind(&mut self) {
    self.chunk = 0;
    self.pos = 0;
    self.end_count = 0;
    self.overflow = false;
    // Land on the first non-empty chunk; T2 never pushes empty chunks
    // but a fully truncated block may have none at all.
  }

  /// ISO 15444-1 C.3.5 (INITDEC) over a chunk list.
  pub fn init_decode(&mut self, chunks: &[&[u8]]) {
    self.dec_rewind();
    self.set_ctx(0);
    while self.chunk < chunks.len() && chunks[self.chunk].is_empty() {
      self.chunk += 1;
    }
    if self.chunk < chunks.len() {
      self.c = (chunks[self.chunk][0] as u32) << 16;
      self.bytein(chunks);
    } else {
      self.c = 0xff << 16;
      self.c += 0xff00;
      self.ct = 8;
      self.end_count += 1;
    }
    self.c <<= 7;
    self.ct -= 7;
    self.a = A_MIN;
  }

  /// Raw initialisation for LAZY bypass passes: no registers touched.
  pub fn init_raw(&mut self, _chunks: &[&[u8]]) {
    self.dec_rewind();
    self.c = 0;
    self.ct = 0;
  }

  /// Current-byte lookup with junction normalisation. Returns the byte
  /// most recently consumed, or 0xFF once past the logical end.
  #[inline]
  fn dec_cur(&mut self, chunks: &[&[u8]]) -> u8 {
    if self.chunk < chunks.len() && self.pos >= chunks[self.chunk].len() {
      if self.chunk + 1 < chunks.len() {
        self.chunk += 1;
        self.pos = 0;
      } else {
        return 0xff;
      }
    }
    if self.chunk < chunks.len() && self.pos < chunks[self.chunk].len() {
      chunks[self.chunk][self.pos]
    } else {
      0xff
    }
  }

  /// Byte after the cursor, peeking across the junction.
  #[inline]
  fn dec_next(&mut self, chunks: &[&[u8]]) -> u8 {
    if self.chunk < chunks.len() && self.pos + 1 < chunks[self.chunk].len() {
      chunks[self.chunk][self.pos + 1]
    } else if self.chunk + 1 < chunks.len() && !chunks[self.chunk + 1].is_empty() {
      chunks[self.chunk + 1][0]
    } else {
      self.overflow = true;
      0xff
    }
  }

  /// C.3.4 (BYTEIN) across the chunk list.
  fn bytein(&mut self, chunks: &[&[u8]]) {
    let cur = self.dec_cur(chunks);
    let next = self.dec_next(chunks);
    let curff = cur == 0xff;
    if curff && next > 0x8f {
      self.c += 0xff00;
      self.ct = 8;
      self.end_count += 1;
    } else {
      self.pos += 1;
      self.c += (next as u32) << (8 + curff as u32);
      self.ct = 8 - curff as u8;
    }
  }

  fn renorm_dec(&mut self, chunks: &[&[u8]]) {
    loop {
      if self.ct == 0 {
        self.bytein(chunks);
      }
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.a >= A_MIN {
        break;
      }
    }
  }

  /// C.3.2 (DECODE) for the current context.
  pub fn decode(&mut self, chunks: &[&[u8]]) -> u32 {
    let ctx = self.ctxs[self.curctx as usize];
    let idx = (ctx >> 1) as usize;
    let mps = (ctx & 1) as u32;
    let st = &MQ_STATES[idx];
    let qe = st.qe as u32;

    self.a -= qe;
    let d;
    if (self.c >> 16) < qe {
      // Lower sub-interval, with conditional exchange.
      if self.a < qe {
        d = mps;
        self.ctxs[self.curctx as usize] = (st.nmps << 1) | mps as u8;
      } else {
        d = 1 - mps;
        let new_mps = if st.switch { 1 - mps } else { mps };
        self.ctxs[self.curctx as usize] = (st.nlps << 1) | new_mps as u8;
      }
      self.a = qe;
      self.renorm_dec(chunks);
    } else {
      self.c -= qe << 16;
      if self.a & A_MIN == 0 {
        if self.a < qe {
          d = 1 - mps;
          let new_mps = if st.switch { 1 - mps } else { mps };
          self.ctxs[self.curctx as usize] = (st.nlps << 1) | new_mps as u8;
        } else {
          d = mps;
          self.ctxs[self.curctx as usize] = (st.nmps << 1) | mps as u8;
        }
        self.renorm_dec(chunks);
      } else {
        d = mps;
      }
    }
    d
  }

  /// One bit of a raw (bypass) pass.
  pub fn raw_decode(&mut self, chunks: &[&[u8]]) -> u32 {
    if self.ct == 0 {
      let cur = self.raw_cur(chunks);
      if self.c == 0xff {
        if cur > 0x8f {
          self.c = 0xff;
          self.ct = 8;
        } else {
          self.c = cur as u32;
          self.pos += 1;
          self.ct = 7;
        }
      } else {
        self.c = cur as u32;
        self.pos += 1;
        self.ct = 8;
      }
    }
    self.ct -= 1;
    (self.c >> self.ct) & 1
  }

  /// Raw passes keep the cursor on the next unread byte.
  #[inline]
  fn raw_cur(&mut self, chunks: &[&[u8]]) -> u8 {
    if self.chunk < chunks.len() && self.pos >= chunks[self.chunk].len() {
      if self.chunk + 1 < chunks.len() {
        self.chunk += 1;
        self.pos = 0;
      } else {
        return 0xff;
      }
    }
    if self.chunk < chunks.len() && self.pos < chunks[self.chunk].len() {
      chunks[self.chunk][self.pos]
    } else {
      0xff
    }
  }

  /// True while the cursor sits within `MQ_RED_ZONE` bytes of the last
  /// available compressed byte, i.e. where a later, longer packet would
  /// change what the coder is about to read.
  pub fn in_red_zone(&self, chunks: &[&[u8]]) -> bool {
    if self.chunk >= chunks.len() {
      return true;
    }
    self.pos + MQ_RED_ZONE >= chunks[self.chunk].len()
      && (self.chunk + 1 >= chunks.len() || chunks[self.chunk + 1].len() <= MQ_RED_ZONE)
  }

  /// Unconsumed bytes left in the logical stream.
  pub fn dec_remaining(&self, chunks: &[&[u8]]) -> usize {
    let mut left = 0usize;
    if self.chunk < chunks.len() {
      let cur = chunks[self.chunk].len();
      left += cur.saturating_sub(self.pos + 1);
      for c in &chunks[self.chunk + 1..] {
        left += c.len();
      }
    }
    left
  }

  pub fn snapshot(&self) -> MqSnapshot {
    MqSnapshot {
      a: self.a,
      c: self.c,
      ct: self.ct,
      curctx: self.curctx,
      ctxs: self.ctxs,
      chunk: self.chunk,
      pos: self.pos,
      end_count: self.end_count,
    }
  }

  pub fn restore(&mut self, snap: &MqSnapshot) {
    self.a = snap.a;
    self.c = snap.c;
    self.ct = snap.ct;
    self.curctx = snap.curctx;
    self.ctxs = snap.ctxs;
    self.chunk = snap.chunk;
    self.pos = snap.pos;
    self.end_count = snap.end_count;
    self.overflow = false;
  }

  // ----------------------------------------------------------------- //
  // Encoder                                                           //
  // ----------------------------------------------------------------- //

  /// C.2.8 (INITENC). The scratch byte at `out[0]` stands in for the
  /// "pointer before the buffer" of the reference flow; it is never part
  /// of the emitted data.
  pub fn init_encode(&mut self) {
    self.set_ctx(0);
    self.a = A_MIN;
    self.c = 0;
    self.ct = 12;
    self.out.clear();
    self.out.push(0);
    self.bp = 0;
    self.end_count = 0;
  }

  /// Bytes committed so far. One less than the cursor, exactly like the
  /// reference pointer arithmetic; non-terminated pass rates add a
  /// correction on top of this.
  pub fn numbytes(&self) -> u32 {
    self.bp.saturating_sub(1) as u32
  }

  pub fn enc_data(&self) -> &[u8] {
    &self.out[1..]
  }

  #[inline]
  fn ensure_slot(&mut self, idx: usize) {
    while self.out.len() <= idx {
      self.out.push(0);
    }
  }

  /// Byte output with bit stuffing: after 0xFF the next byte carries
  /// seven bits.
  fn byteout(&mut self) {
    if self.out[self.bp] == 0xff {
      self.bp += 1;
      self.ensure_slot(self.bp);
      self.out[self.bp] = (self.c >> 20) as u8;
      self.c &= 0xf_ffff;
      self.ct = 7;
    } else if self.c & 0x800_0000 == 0 {
      self.bp += 1;
      self.ensure_slot(self.bp);
      self.out[self.bp] = (self.c >> 19) as u8;
      self.c &= 0x7_ffff;
      self.ct = 8;
    } else {
      self.out[self.bp] = self.out[self.bp].wrapping_add(1);
      if self.out[self.bp] == 0xff {
        self.c &= 0x7ff_ffff;
        self.bp += 1;
        self.ensure_slot(self.bp);
        self.out[self.bp] = (self.c >> 20) as u8;
        self.c &= 0xf_ffff;
        self.ct = 7;
      } else {
        self.bp += 1;
        self.ensure_slot(self.bp);
        self.out[self.bp] = (self.c >> 19) as u8;
        self.c &= 0x7_ffff;
        self.ct = 8;
      }
    }
  }

  fn renorm_enc(&mut self) {
    loop {
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.ct == 0 {
        self.byteout();
      }
      if self.a & A_MIN != 0 {
        break;
      }
    }
  }

  /// C.2.5 (CODEMPS / CODELPS) for the current context.
  pub fn encode(&mut self, d: u32) {
    let ctx = self.ctxs[self.curctx as usize];
    let idx = (ctx >> 1) as usize;
    let mps = (ctx & 1) as u32;
    let st = &MQ_STATES[idx];
    let qe = st.qe as u32;

    if d == mps {
      self.a -= qe;
      if self.a & A_MIN == 0 {
        if self.a < qe {
          self.a = qe;
        } else {
          self.c += qe;
        }
        self.ctxs[self.curctx as usize] = (st.nmps << 1) | mps as u8;
        self.renorm_enc();
      } else {
        self.c += qe;
      }
    } else {
      self.a -= qe;
      if self.a < qe {
        self.c += qe;
      } else {
        self.a = qe;
      }
      let new_mps = if st.switch { 1 - mps } else { mps };
      self.ctxs[self.curctx as usize] = (st.nlps << 1) | new_mps as u8;
      self.renorm_enc();
    }
  }

  fn setbits(&mut self) {
    let tempc = self.c + self.a;
    self.c |= 0xffff;
    if self.c >= tempc {
      self.c -= A_MIN;
    }
  }

  /// C.2.9 (FLUSH). Never lets a coding pass end on 0xFF.
  pub fn flush(&mut self) {
    self.setbits();
    self.c <<= self.ct;
    self.byteout();
    self.c <<= self.ct;
    self.byteout();
    if self.out[self.bp] != 0xff {
      self.bp += 1;
    }
  }

  /// Error-resilient termination: pads so truncation is detectable.
  pub fn erterm(&mut self) {
    let mut k = 11 - self.ct as i32 + 1;
    while k > 0 {
      self.c <<= self.ct;
      self.ct = 0;
      self.byteout();
      k -= self.ct as i32;
    }
    if self.out[self.bp] != 0xff {
      self.byteout();
    }
    // Same convention as flush: the cursor ends past the final byte of
    // the pass unless that byte is 0xFF.
    if self.out[self.bp] != 0xff {
      self.bp += 1;
    }
  }

  /// Four-bit `1010` sequence under the UNI context after a cleanup pass.
  pub fn segmark(&mut self) {
    self.set_ctx(T1_CTXNO_UNI);
    for i in 1u32..5 {
      self.encode(i & 1);
    }
  }

  /// Re-initialisation for a RESTART-terminated successor pass.
  pub fn restart_init(&mut self) {
    self.a = A_MIN;
    self.c = 0;
    self.ct = 12;
    self.bp = self.bp.saturating_sub(1);
    if self.out[self.bp] == 0xff {
      self.ct = 13;
    }
  }

  pub fn bypass_init(&mut self) {
    self.c = 0;
    self.ct = BYPASS_CT_INIT;
  }

  pub fn bypass_encode(&mut self, d: u32) {
    if self.ct == BYPASS_CT_INIT {
      self.ct = 8;
    }
    self.ct -= 1;
    self.c += d << self.ct;
    if self.ct == 0 {
      self.ensure_slot(self.bp);
      self.out[self.bp] = self.c as u8;
      self.ct = 8;
      if self.out[self.bp] == 0xff {
        self.ct = 7;
      }
      self.bp += 1;
      self.c = 0;
    }
  }

  /// Correction added to a non-terminated raw pass rate.
  pub fn bypass_extra_bytes(&self, erterm: bool) -> u32 {
    if self.ct < 7 || (self.ct == 7 && (erterm || self.out[self.bp - 1] != 0xff)) {
      2
    } else {
      1
    }
  }

  pub fn bypass_flush(&mut self, erterm: bool) {
    if self.ct < 7 || (self.ct == 7 && (erterm || self.out[self.bp - 1] != 0xff)) {
      // Fill the remaining lsbs with an alternating 0,1,... sequence.
      let mut bit = 0u32;
      while self.ct > 0 {
        self.ct -= 1;
        self.c += bit << self.ct;
        bit = 1 - bit;
      }
      self.ensure_slot(self.bp);
      self.out[self.bp] = self.c as u8;
      self.bp += 1;
    } else if self.ct == 7 && self.out[self.bp - 1] == 0xff {
      self.bp -= 1;
    } else if self.ct == 8
      && !erterm
      && self.bp >= 2
      && self.out[self.bp - 1] == 0x7f
      && self.out[self.bp - 2] == 0xff
    {
      // A terminating 0xFF 0x7F is reproduced by the synthetic fill.
      self.bp -= 2;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn xorshift(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
  }

  fn roundtrip_bits(bits: &[(u8, u32)]) {
    let mut enc = MqCoder::new();
    enc.reset_states();
    enc.init_encode();
    for &(ctx, d) in bits {
      enc.set_ctx(ctx);
      enc.encode(d);
    }
    enc.flush();
    let n = enc.numbytes() as usize;
    let data = enc.enc_data()[..n].to_vec();

    let mut dec = MqCoder::new();
    dec.reset_states();
    let chunks: [&[u8]; 1] = [&data];
    dec.init_decode(&chunks);
    for (i, &(ctx, d)) in bits.iter().enumerate() {
      dec.set_ctx(ctx);
      assert_eq!(dec.decode(&chunks), d, "symbol {}", i);
    }
  }

  #[test]
  fn single_context_roundtrip() {
    roundtrip_bits(&[
      (0, 0),
      (0, 0),
      (0, 1),
      (0, 0),
      (0, 1),
      (0, 1),
      (0, 0),
      (0, 1),
      (0, 0),
      (0, 0),
    ]);
  }

  #[test]
  fn context_varying_roundtrip() {
    let mut seed = 0x2545_f491u32;
    let mut bits = Vec::new();
    for _ in 0..4000 {
      let r = xorshift(&mut seed);
      bits.push(((r % MQC_NUMCTXS as u32) as u8, (r >> 8) & 1));
    }
    roundtrip_bits(&bits);
  }

  #[test]
  fn decode_across_chunk_junctions() {
    // The decoder must see one logical stream regardless of how the
    // bytes are split over chunks.
    let mut seed = 0xdead_beefu32;
    let mut bits = Vec::new();
    for _ in 0..2000 {
      let r = xorshift(&mut seed);
      bits.push((0u8, r & 1));
    }
    let mut enc = MqCoder::new();
    enc.reset_states();
    enc.init_encode();
    for &(ctx, d) in &bits {
      enc.set_ctx(ctx);
      enc.encode(d);
    }
    enc.flush();
    let n = enc.numbytes() as usize;
    let data = enc.enc_data()[..n].to_vec();

    for split in [1usize, 2, 3, 7, n / 2, n.saturating_sub(1)] {
      if split == 0 || split >= n {
        continue;
      }
      let chunks: [&[u8]; 2] = [&data[..split], &data[split..]];
      let mut dec = MqCoder::new();
      dec.reset_states();
      dec.init_decode(&chunks);
      for (i, &(ctx, d)) in bits.iter().enumerate() {
        dec.set_ctx(ctx);
        assert_eq!(dec.decode(&chunks), d, "split {} symbol {}", split, i);
      }
    }
  }

  #[test]
  fn snapshot_restore_replays_identically() {
    let mut seed = 0x1234_5678u32;
    let mut bits = Vec::new();
    for _ in 0..600 {
      let r = xorshift(&mut seed);
      bits.push((0u8, r & 1));
    }
    let mut enc = MqCoder::new();
    enc.reset_states();
    enc.init_encode();
    for &(_, d) in &bits {
      enc.set_ctx(0);
      enc.encode(d);
    }
    enc.flush();
    let n = enc.numbytes() as usize;
    let data = enc.enc_data()[..n].to_vec();
    let chunks: [&[u8]; 1] = [&data];

    let mut dec = MqCoder::new();
    dec.reset_states();
    dec.init_decode(&chunks);
    let mut tail = Vec::new();
    let mut snap = None;
    for (i, &(_, d)) in bits.iter().enumerate() {
      if i == 300 {
        snap = Some(dec.snapshot());
      }
      dec.set_ctx(0);
      let v = dec.decode(&chunks);
      assert_eq!(v, d);
      if i >= 300 {
        tail.push(v);
      }
    }
    dec.restore(&snap.unwrap());
    for (k, &expect) in tail.iter().enumerate() {
      dec.set_ctx(0);
      assert_eq!(dec.decode(&chunks), expect, "replayed symbol {}", k);
    }
  }

  #[test]
  fn bypass_roundtrip() {
    // MQ prelude, flush, then a raw segment, as LAZY mode produces.
    let mut enc = MqCoder::new();
    enc.reset_states();
    enc.init_encode();
    let prelude = [1u32, 0, 0, 1, 1, 1, 0, 1];
    for &d in &prelude {
      enc.set_ctx(0);
      enc.encode(d);
    }
    enc.flush();
    let mq_len = enc.numbytes() as usize;

    enc.bypass_init();
    let mut seed = 0x0bad_cafeu32;
    let raw: Vec<u32> = (0..777).map(|_| xorshift(&mut seed) & 1).collect();
    for &d in &raw {
      enc.bypass_encode(d);
    }
    enc.bypass_flush(false);
    let total = enc.numbytes() as usize;
    let data = enc.enc_data()[..total].to_vec();

    let mq_chunk: [&[u8]; 1] = [&data[..mq_len]];
    let mut dec = MqCoder::new();
    dec.reset_states();
    dec.init_decode(&mq_chunk);
    for &d in &prelude {
      dec.set_ctx(0);
      assert_eq!(dec.decode(&mq_chunk), d);
    }

    let raw_chunk: [&[u8]; 1] = [&data[mq_len..]];
    dec.init_raw(&raw_chunk);
    for (i, &d) in raw.iter().enumerate() {
      assert_eq!(dec.raw_decode(&raw_chunk), d, "raw bit {}", i);
    }
  }

  #[test]
  fn no_marker_bytes_in_output() {
    let mut seed = 77u32;
    let mut enc = MqCoder::new();
    enc.reset_states();
    enc.init_encode();
    for _ in 0..5000 {
      enc.set_ctx((xorshift(&mut seed) % 19) as u8);
      let d = xorshift(&mut seed) & 1;
      enc.encode(d);
    }
    enc.flush();
    let n = enc.numbytes() as usize;
    let data = &enc.enc_data()[..n];
    for w in data.windows(2) {
      assert!(!(w[0] == 0xff && w[1] > 0x8f), "marker {:02x}{:02x}", w[0], w[1]);
    }
  }

  #[test]
  fn red_zone_tracks_remaining_bytes() {
    let a = [0u8; 10];
    let b = [0u8; 3];
    let chunks: [&[u8]; 2] = [&a, &b];
    let mut dec = MqCoder::new();
    dec.reset_states();
    dec.init_decode(&chunks);
    // Ten bytes in the current chunk but the follow-on chunk is under
    // the red-zone size, so the zone opens near the end of chunk 0.
    assert!(!dec.in_red_zone(&chunks));
    dec.chunk = 0;
    dec.pos = 4;
    assert!(dec.in_red_zone(&chunks));
    let big = [0u8; 64];
    let chunks2: [&[u8]; 2] = [&a, &big];
    assert!(!dec.in_red_zone(&chunks2));
  }
}
