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

//! T1 code-block coder: the three bit-plane coding passes over one code
//! block, in both directions, plus differential re-decompression from a
//! cached entropy-state checkpoint.
//!
//! The decoder's sample plane holds two's-complement values carrying one
//! extra fractional bit (callers divide by two on extraction); the
//! encoder's plane holds sign-magnitude values whose magnitudes carry
//! `T1_NMSEDEC_FRACBITS` fractional bits.

use crate::consts::{
  BandOrientation, CblkSty, MAX_BIT_PLANES, MAX_PASSES, T1_CTXNO_AGG, T1_CTXNO_MAG, T1_CTXNO_UNI,
  T1_NMSEDEC_FRACBITS,
};
use crate::error::{Error, Result};
use crate::mqc::{MqCoder, MqSnapshot};
use crate::t1_luts::*;

use log::warn;
use smallvec::SmallVec;

/// Sign-magnitude representation helpers: the sign lives in the MSB.
#[inline]
pub(crate) fn smr_abs(x: i32) -> u32 {
  x as u32 & 0x7fff_ffff
}

#[inline]
pub(crate) fn smr_sign(x: i32) -> u32 {
  x as u32 >> 31
}

#[inline]
pub(crate) fn to_smr(x: i32) -> i32 {
  if x >= 0 {
    x
  } else {
    (-(x as i64) as u32 | 0x8000_0000) as i32
  }
}

/// One coding pass as recorded by the encoder.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EncPass {
  /// Cumulative byte count when the pass can be truncated here.
  pub rate: u32,
  /// Cumulative weighted distortion decrease up to this pass.
  pub distortion: f64,
  /// Whether the arithmetic coder was terminated after this pass.
  pub term: bool,
  /// Bytes contributed by this pass alone.
  pub len: u32,
}

/// Encoder output for one code block.
#[derive(Debug, Default, Clone)]
pub(crate) struct EncOut {
  pub data: Vec<u8>,
  pub numbps: u8,
  pub passes: Vec<EncPass>,
}

/// One segment of compressed data as seen by the T1 decoder: the chunk
/// views concatenate to the segment's byte stream, `passes` is how many
/// passes have data available so far.
pub(crate) struct SegView<'a> {
  pub chunks: SmallVec<[&'a [u8]; 4]>,
  pub passes: u32,
  /// The segment has reached its pass budget; later layers start a new
  /// segment rather than extending this one.
  pub complete: bool,
}

/// The twelve labelled resumption positions of the differential decoder.
/// B1..B8 live in the cleanup pass, B9/B10 in the significance pass,
/// B11/B12 in the refinement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumePos {
  /// Cleanup, head of an all-zero column (before the AGG decision).
  B1,
  /// Cleanup, zero-column continuation step (`ci`, partial flag apply).
  B2,
  /// Cleanup, ordinary column step at sample 0.
  B3,
  /// Cleanup, ordinary column step at sample 1.
  B4,
  /// Cleanup, ordinary column step at sample 2.
  B5,
  /// Cleanup, ordinary column step at sample 3.
  B6,
  /// Cleanup, step in the ragged tail stripe.
  B7,
  /// Cleanup, before the segmentation-symbol check.
  B8,
  /// Significance pass, step in a full stripe.
  B9,
  /// Significance pass, step in the ragged tail stripe.
  B10,
  /// Refinement pass, step in a full stripe.
  B11,
  /// Refinement pass, step in the ragged tail stripe.
  B12,
}

/// Loop cursor frozen inside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MidPass {
  pub pos: ResumePos,
  pub k: u32,
  pub i: u32,
  pub ci: u32,
  pub runlen: u32,
  pub partial: bool,
}

/// Saved decoder state for differential re-decompression. Captured when
/// the coder enters the red zone (or at a clean pass/segment boundary)
/// and consumed on the next decode of the same block.
#[derive(Debug, Clone)]
pub(crate) struct DecodeResume {
  pub segno: u16,
  pub passno: u32,
  pub passtype: u8,
  pub bp1: i32,
  pub raw: bool,
  pub mq: MqSnapshot,
  pub kind: ResumeKind,
  pub flags: Vec<Flag>,
  pub data: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeKind {
  /// Mid-pass: the checkpoint was taken inside a pass in the red zone.
  MidPass(MidPassStored),
  /// Between two passes of one segment; MQ state continues.
  PassBoundary,
  /// Between segments; the coder re-initialises from the segment chunks.
  SegmentBoundary,
}

// MidPass minus nothing, but kept Copy-friendly inside the enum.
pub(crate) type MidPassStored = MidPass;

/// Reusable scratch for coding one block: MQ coder, flag plane, sample
/// plane. One instance per worker thread, acquired at task entry.
pub(crate) struct BlockCoder {
  pub w: u32,
  pub h: u32,
  flags_stride: u32,
  pub data: Vec<i32>,
  flags: Vec<Flag>,
  pub mqc: MqCoder,
  zc_base: usize,

  // Differential bookkeeping for the current decompress call.
  ckpt_arm: bool,
  pending: Option<Box<DecodeResume>>,
  cur_segno: u16,
  cur_passno: u32,
  cur_passtype: u8,
  cur_bp1: i32,
}

impl Default for BlockCoder {
  fn default() -> Self {
    Self {
      w: 0,
      h: 0,
      flags_stride: 0,
      data: Vec::new(),
      flags: Vec::new(),
      mqc: MqCoder::new(),
      zc_base: 0,
      ckpt_arm: false,
      pending: None,
      cur_segno: 0,
      cur_passno: 0,
      cur_passtype: 2,
      cur_bp1: 0,
    }
  }
}

impl BlockCoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sizes and zeroes both planes. The flag plane has one sentinel
  /// column each side and one sentinel stripe row above and below.
  pub fn alloc(&mut self, w: u32, h: u32) {
    self.w = w;
    self.h = h;
    self.flags_stride = w + 2;
    let stripes = (h + 3) / 4;
    let flags_len = (self.flags_stride * (stripes + 2)) as usize;
    if self.flags.len() != flags_len {
      self.flags = vec![0; flags_len];
    } else {
      for f in &mut self.flags {
        *f = 0;
      }
    }
    let data_len = (w * h) as usize;
    if self.data.len() != data_len {
      self.data = vec![0; data_len];
    } else {
      for d in &mut self.data {
        *d = 0;
      }
    }
  }

  #[inline]
  fn fidx(&self, stripe: u32, col: u32) -> usize {
    ((stripe + 1) * self.flags_stride + col + 1) as usize
  }

  #[inline]
  fn didx(&self, row: u32, col: u32) -> usize {
    (row * self.w + col) as usize
  }

  /// Stamps significance (and the sign on first significance) into the
  /// target word and its east/west neighbours; at stripe boundaries the
  /// adjacent stripe rows are stamped too. `ci` is pre-multiplied by 3.
  fn update_flags(&mut self, fp: usize, ci: u32, sign: u32, vsc: bool) {
    let stride = self.flags_stride as usize;
    self.flags[fp - 1] |= T1_SIGMA_5 << ci;
    self.flags[fp] |= ((sign << T1_CHI_1_I) | T1_SIGMA_4) << ci;
    self.flags[fp + 1] |= T1_SIGMA_3 << ci;
    if ci == 0 && !vsc {
      let north = fp - stride;
      self.flags[north] |= (sign << T1_CHI_5_I) | T1_SIGMA_16;
      self.flags[north - 1] |= T1_SIGMA_17;
      self.flags[north + 1] |= T1_SIGMA_15;
    }
    if ci == 9 {
      let south = fp + stride;
      self.flags[south] |= (sign << T1_CHI_0_I) | T1_SIGMA_1;
      self.flags[south - 1] |= T1_SIGMA_2;
      self.flags[south + 1] |= T1_SIGMA_0;
    }
  }

  /// Sign-coding lookup index for sample `ci/3` of the word at `fp`.
  #[inline]
  fn sc_lu(&self, fp: usize, ci: u32) -> usize {
    let f = self.flags[fp];
    let pf = self.flags[fp - 1];
    let nf = self.flags[fp + 1];
    let mut lu = (f >> ci) & (T1_SIGMA_1 | T1_SIGMA_3 | T1_SIGMA_5 | T1_SIGMA_7);
    lu |= (pf >> (T1_CHI_THIS_I + ci)) & (1 << 0);
    lu |= (nf >> (T1_CHI_THIS_I - 2 + ci)) & (1 << 2);
    if ci == 0 {
      lu |= (f >> (T1_CHI_0_I - 4)) & (1 << 4);
    } else {
      lu |= (f >> (T1_CHI_1_I - 4 + (ci - 3))) & (1 << 4);
    }
    lu |= (f >> (T1_CHI_2_I - 6 + ci)) & (1 << 6);
    lu as usize
  }

  #[inline]
  fn zc_ctx(&self, f_shifted: Flag) -> u8 {
    LUT_CTXNO_ZC[self.zc_base + (f_shifted & T1_SIGMA_NEIGHBOURS) as usize]
  }

  #[inline]
  fn mag_ctx(f_shifted: Flag) -> u8 {
    if f_shifted & T1_MU_0 != 0 {
      T1_CTXNO_MAG + 2
    } else if f_shifted & T1_SIGMA_NEIGHBOURS != 0 {
      T1_CTXNO_MAG + 1
    } else {
      T1_CTXNO_MAG
    }
  }

  /// Red-zone checkpoint capture: at most one per decompress call, taken
  /// only while a later layer could still extend the data.
  #[inline]
  fn maybe_capture(&mut self, chunks: &[&[u8]], mid: MidPass) {
    if self.ckpt_arm && self.pending.is_none() && self.mqc.in_red_zone(chunks) {
      self.pending = Some(Box::new(DecodeResume {
        segno: self.cur_segno,
        passno: self.cur_passno,
        passtype: self.cur_passtype,
        bp1: self.cur_bp1,
        raw: false,
        mq: self.mqc.snapshot(),
        kind: ResumeKind::MidPass(mid),
        flags: self.flags.clone(),
        data: self.data.clone(),
      }));
    }
  }

  // ----------------------------------------------------------------- //
  // Decoding passes                                                    //
  // ----------------------------------------------------------------- //

  fn dec_sig_step_mqc(
    &mut self,
    chunks: &[&[u8]],
    fp: usize,
    row: u32,
    col: u32,
    ci: u32,
    oneplushalf: i32,
    vsc: bool,
  ) {
    let f = self.flags[fp];
    if f & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) == 0 && f & (T1_SIGMA_NEIGHBOURS << ci) != 0 {
      let ctx = self.zc_ctx(f >> ci);
      self.mqc.set_ctx(ctx);
      if self.mqc.decode(chunks) != 0 {
        let lu = self.sc_lu(fp, ci);
        self.mqc.set_ctx(LUT_CTXNO_SC[lu]);
        let v = self.mqc.decode(chunks) ^ LUT_SPB[lu] as u32;
        let di = self.didx(row, col);
        self.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
        self.update_flags(fp, ci, v, vsc);
      }
      self.flags[fp] |= T1_PI_THIS << ci;
    }
  }

  fn dec_sig_step_raw(
    &mut self,
    chunks: &[&[u8]],
    fp: usize,
    row: u32,
    col: u32,
    ci: u32,
    oneplushalf: i32,
    vsc: bool,
  ) {
    let f = self.flags[fp];
    if f & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) == 0 && f & (T1_SIGMA_NEIGHBOURS << ci) != 0 {
      if self.mqc.raw_decode(chunks) != 0 {
        let v = self.mqc.raw_decode(chunks);
        let di = self.didx(row, col);
        self.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
        self.update_flags(fp, ci, v, vsc);
      }
      self.flags[fp] |= T1_PI_THIS << ci;
    }
  }

  fn dec_sigpass(
    &mut self,
    chunks: &[&[u8]],
    bp1: i32,
    cblksty: CblkSty,
    raw: bool,
    mid: Option<MidPass>,
  ) {
    let one = 1i32 << bp1;
    let oneplushalf = one | (one >> 1);
    let vsc_on = cblksty.contains(CblkSty::VSC);
    let w = self.w;
    let full_h = self.h & !3;
    let (rk, ri, rci) = match mid {
      Some(m) => (m.k, m.i, m.ci),
      None => (0, 0, 0),
    };
    let mut resumed = mid.is_some();

    let mut k = 0;
    while k < full_h {
      if resumed && k < rk {
        k += 4;
        continue;
      }
      for i in 0..w {
        if resumed && k == rk && i < ri {
          continue;
        }
        let fp = self.fidx(k / 4, i);
        if self.flags[fp] == 0 && !(resumed && k == rk && i == ri) {
          continue;
        }
        let mut ci = 0;
        while ci < 12 {
          if resumed && k == rk && i == ri {
            if ci < rci {
              ci += 3;
              continue;
            }
            resumed = false;
          }
          if !raw {
            self.maybe_capture(
              chunks,
              MidPass {
                pos: ResumePos::B9,
                k,
                i,
                ci,
                runlen: 0,
                partial: false,
              },
            );
            self.dec_sig_step_mqc(chunks, fp, k + ci / 3, i, ci, oneplushalf, vsc_on && ci == 0);
          } else {
            self.dec_sig_step_raw(chunks, fp, k + ci / 3, i, ci, oneplushalf, vsc_on && ci == 0);
          }
          ci += 3;
        }
      }
      k += 4;
    }
    if k < self.h {
      let rows_left = self.h - k;
      for i in 0..w {
        if resumed && i < ri {
          continue;
        }
        let fp = self.fidx(k / 4, i);
        for j in 0..rows_left {
          let ci = 3 * j;
          if resumed && i == ri {
            if ci < rci {
              continue;
            }
            resumed = false;
          }
          if !raw {
            self.maybe_capture(
              chunks,
              MidPass {
                pos: ResumePos::B10,
                k,
                i,
                ci,
                runlen: 0,
                partial: false,
              },
            );
            self.dec_sig_step_mqc(chunks, fp, k + j, i, ci, oneplushalf, vsc_on && j == 0);
          } else {
            self.dec_sig_step_raw(chunks, fp, k + j, i, ci, oneplushalf, vsc_on && j == 0);
          }
        }
      }
    }
  }

  fn dec_ref_step_mqc(&mut self, chunks: &[&[u8]], fp: usize, row: u32, col: u32, ci: u32, poshalf: i32) {
    let f = self.flags[fp];
    if (f >> ci) & (T1_SIGMA_THIS | T1_PI_THIS) == T1_SIGMA_THIS {
      let ctx = Self::mag_ctx(f >> ci);
      self.mqc.set_ctx(ctx);
      let v = self.mqc.decode(chunks);
      let di = self.didx(row, col);
      let neg = self.data[di] < 0;
      self.data[di] += if (v != 0) ^ neg { poshalf } else { -poshalf };
      self.flags[fp] |= T1_MU_THIS << ci;
    }
  }

  fn dec_ref_step_raw(&mut self, chunks: &[&[u8]], fp: usize, row: u32, col: u32, ci: u32, poshalf: i32) {
    let f = self.flags[fp];
    if (f >> ci) & (T1_SIGMA_THIS | T1_PI_THIS) == T1_SIGMA_THIS {
      let v = self.mqc.raw_decode(chunks);
      let di = self.didx(row, col);
      let neg = self.data[di] < 0;
      self.data[di] += if (v != 0) ^ neg { poshalf } else { -poshalf };
      self.flags[fp] |= T1_MU_THIS << ci;
    }
  }

  fn dec_refpass(&mut self, chunks: &[&[u8]], bp1: i32, raw: bool, mid: Option<MidPass>) {
    let one = 1i32 << bp1;
    let poshalf = one >> 1;
    let w = self.w;
    let full_h = self.h & !3;
    let (rk, ri, rci) = match mid {
      Some(m) => (m.k, m.i, m.ci),
      None => (0, 0, 0),
    };
    let mut resumed = mid.is_some();

    let mut k = 0;
    while k < full_h {
      if resumed && k < rk {
        k += 4;
        continue;
      }
      for i in 0..w {
        if resumed && k == rk && i < ri {
          continue;
        }
        let fp = self.fidx(k / 4, i);
        if self.flags[fp] == 0 && !(resumed && k == rk && i == ri) {
          continue;
        }
        let mut ci = 0;
        while ci < 12 {
          if resumed && k == rk && i == ri {
            if ci < rci {
              ci += 3;
              continue;
            }
            resumed = false;
          }
          if !raw {
            self.maybe_capture(
              chunks,
              MidPass {
                pos: ResumePos::B11,
                k,
                i,
                ci,
                runlen: 0,
                partial: false,
              },
            );
            self.dec_ref_step_mqc(chunks, fp, k + ci / 3, i, ci, poshalf);
          } else {
            self.dec_ref_step_raw(chunks, fp, k + ci / 3, i, ci, poshalf);
          }
          ci += 3;
        }
      }
      k += 4;
    }
    if k < self.h {
      let rows_left = self.h - k;
      for i in 0..w {
        if resumed && i < ri {
          continue;
        }
        let fp = self.fidx(k / 4, i);
        for j in 0..rows_left {
          let ci = 3 * j;
          if resumed && i == ri {
            if ci < rci {
              continue;
            }
            resumed = false;
          }
          if !raw {
            self.maybe_capture(
              chunks,
              MidPass {
                pos: ResumePos::B12,
                k,
                i,
                ci,
                runlen: 0,
                partial: false,
              },
            );
            self.dec_ref_step_mqc(chunks, fp, k + j, i, ci, poshalf);
          } else {
            self.dec_ref_step_raw(chunks, fp, k + j, i, ci, poshalf);
          }
        }
      }
    }
  }

  /// One cleanup step. `check` gates on significance/visited state;
  /// `partial` skips the zero-coding decision (run-length continuation).
  fn dec_cln_step(
    &mut self,
    chunks: &[&[u8]],
    fp: usize,
    row: u32,
    col: u32,
    ci: u32,
    check: bool,
    partial: bool,
    oneplushalf: i32,
    vsc: bool,
  ) {
    let f = self.flags[fp];
    if check && f & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) != 0 {
      return;
    }
    if !partial {
      let ctx = self.zc_ctx(f >> ci);
      self.mqc.set_ctx(ctx);
      if self.mqc.decode(chunks) == 0 {
        return;
      }
    }
    let lu = self.sc_lu(fp, ci);
    self.mqc.set_ctx(LUT_CTXNO_SC[lu]);
    let v = self.mqc.decode(chunks) ^ LUT_SPB[lu] as u32;
    let di = self.didx(row, col);
    self.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
    self.update_flags(fp, ci, v, vsc);
  }

  fn dec_clnpass(&mut self, chunks: &[&[u8]], bp1: i32, cblksty: CblkSty, mid: Option<MidPass>) {
    let one = 1i32 << bp1;
    let half = one >> 1;
    let oneplushalf = one | half;
    let vsc_on = cblksty.contains(CblkSty::VSC);
    let w = self.w;
    let full_h = self.h & !3;
    let (rk, ri) = match mid {
      Some(m) => (m.k, m.i),
      None => (0, 0),
    };
    let mut entry = mid;
    let segsym_resume = matches!(mid.map(|m| m.pos), Some(ResumePos::B8));

    if !segsym_resume {
      let mut k = 0;
      while k < full_h {
        if entry.is_some() && k < rk {
          k += 4;
          continue;
        }
        for i in 0..w {
          if entry.is_some() && k == rk && i < ri {
            continue;
          }
          let col_entry = if entry.is_some() && k == rk && i == ri {
            entry.take()
          } else {
            None
          };
          self.dec_cln_column(chunks, k, i, oneplushalf, vsc_on, col_entry);
        }
        k += 4;
      }
      if k < self.h {
        let rows_left = self.h - k;
        let mut resumed_tail = entry;
        for i in 0..w {
          if resumed_tail.is_some() && i < ri {
            continue;
          }
          let fp = self.fidx(k / 4, i);
          for j in 0..rows_left {
            let ci = 3 * j;
            if let Some(m) = resumed_tail {
              if i == m.i {
                if ci < m.ci {
                  continue;
                }
                resumed_tail = None;
              }
            }
            self.maybe_capture(
              chunks,
              MidPass {
                pos: ResumePos::B7,
                k,
                i,
                ci,
                runlen: 0,
                partial: false,
              },
            );
            self.dec_cln_step(
              chunks,
              fp,
              k + j,
              i,
              ci,
              true,
              false,
              oneplushalf,
              vsc_on && j == 0,
            );
          }
          self.flags[fp] &= !T1_PI_ALL;
        }
      }
    }

    if cblksty.contains(CblkSty::SEGSYM) {
      self.maybe_capture(
        chunks,
        MidPass {
          pos: ResumePos::B8,
          k: 0,
          i: 0,
          ci: 0,
          runlen: 0,
          partial: false,
        },
      );
      self.mqc.set_ctx(T1_CTXNO_UNI);
      let mut v = self.mqc.decode(chunks);
      v = (v << 1) | self.mqc.decode(chunks);
      v = (v << 1) | self.mqc.decode(chunks);
      v = (v << 1) | self.mqc.decode(chunks);
      if v != 0xa {
        warn!("bad segmentation symbol {:#x}", v);
      }
    }
  }

  /// Cleanup processing of one four-sample column inside a full stripe.
  fn dec_cln_column(
    &mut self,
    chunks: &[&[u8]],
    k: u32,
    i: u32,
    oneplushalf: i32,
    vsc_on: bool,
    entry: Option<MidPass>,
  ) {
    let fp = self.fidx(k / 4, i);

    // Work out where to enter the column state machine.
    let (zero_path, mut ci, mut partial, mut runlen, decode_head) = match entry {
      None => {
        if self.flags[fp] == 0 {
          (true, 0u32, true, 0u32, true)
        } else {
          (false, 0, false, 0, false)
        }
      }
      Some(m) => match m.pos {
        ResumePos::B1 => (true, 0, true, 0, true),
        ResumePos::B2 => (true, m.ci, m.partial, m.runlen, false),
        ResumePos::B3 | ResumePos::B4 | ResumePos::B5 | ResumePos::B6 => {
          (false, m.ci, false, 0, false)
        }
        _ => (false, 0, false, 0, false),
      },
    };

    if zero_path {
      if decode_head {
        self.maybe_capture(
          chunks,
          MidPass {
            pos: ResumePos::B1,
            k,
            i,
            ci: 0,
            runlen: 0,
            partial: false,
          },
        );
        self.mqc.set_ctx(T1_CTXNO_AGG);
        if self.mqc.decode(chunks) == 0 {
          // Whole column stays insignificant this pass.
          return;
        }
        self.mqc.set_ctx(T1_CTXNO_UNI);
        runlen = self.mqc.decode(chunks);
        runlen = (runlen << 1) | self.mqc.decode(chunks);
        ci = 3 * runlen;
        partial = true;
      }
      while ci < 12 {
        self.maybe_capture(
          chunks,
          MidPass {
            pos: ResumePos::B2,
            k,
            i,
            ci,
            runlen,
            partial,
          },
        );
        self.dec_cln_step(
          chunks,
          fp,
          k + ci / 3,
          i,
          ci,
          false,
          partial,
          oneplushalf,
          vsc_on && ci == 0,
        );
        partial = false;
        ci += 3;
      }
    } else {
      while ci < 12 {
        let pos = match ci {
          0 => ResumePos::B3,
          3 => ResumePos::B4,
          6 => ResumePos::B5,
          _ => ResumePos::B6,
        };
        self.maybe_capture(
          chunks,
          MidPass {
            pos,
            k,
            i,
            ci,
            runlen: 0,
            partial: false,
          },
        );
        self.dec_cln_step(
          chunks,
          fp,
          k + ci / 3,
          i,
          ci,
          true,
          false,
          oneplushalf,
          vsc_on && ci == 0,
        );
        ci += 3;
      }
    }
    self.flags[fp] &= !T1_PI_ALL;
  }

  // ----------------------------------------------------------------- //
  // Decompression driver                                               //
  // ----------------------------------------------------------------- //

  /// Runs all ready passes of the block. `resume` carries the saved
  /// state across differential calls; in cached mode the updated state
  /// is written back for the next layer increment.
  #[allow(clippy::too_many_arguments)]
  pub fn decompress(
    &mut self,
    resume: &mut Option<DecodeResume>,
    segs: &[SegView<'_>],
    w: u32,
    h: u32,
    numbps: u8,
    cblksty: CblkSty,
    orient: BandOrientation,
    cached: bool,
    final_layer: bool,
  ) -> Result<()> {
    if numbps > MAX_BIT_PLANES {
      return Err(Error::CorruptCodeblock("too many bit planes"));
    }
    if cblksty.contains(CblkSty::HT) {
      return Err(Error::CorruptCodeblock(
        "HT entropy kernel not carried by this build",
      ));
    }
    self.zc_base = (orient as usize) << 9;
    self.pending = None;
    self.ckpt_arm = cached && !final_layer;

    let mut segno0 = 0usize;
    let mut passno0 = 0u32;
    let mut passtype: u8 = 2;
    let mut bp1: i32 = numbps as i32;
    let mut mid: Option<MidPass> = None;
    let mut mq_restored = false;

    self.alloc(w, h);
    let mut orig_resume: Option<DecodeResume> = None;
    match resume.take() {
      Some(r) if cached => {
        debug_assert_eq!(r.flags.len(), self.flags.len());
        debug_assert_eq!(r.data.len(), self.data.len());
        self.flags.copy_from_slice(&r.flags);
        self.data.copy_from_slice(&r.data);
        segno0 = r.segno as usize;
        passno0 = r.passno;
        passtype = r.passtype;
        bp1 = r.bp1;
        self.mqc.restore(&r.mq);
        match r.kind {
          ResumeKind::MidPass(m) => {
            mid = Some(m);
            mq_restored = true;
          }
          ResumeKind::PassBoundary => {
            mq_restored = true;
          }
          ResumeKind::SegmentBoundary => {
            // Context states persist, registers re-initialise below.
            mq_restored = false;
          }
        }
        orig_resume = Some(r);
      }
      _ => {
        self.mqc.reset_states();
      }
    }

    let check_pterm = cblksty.contains(CblkSty::PTERM);
    let mut last_chunks: SmallVec<[&[u8]; 4]> = SmallVec::new();
    let mut last_segno = segno0;
    let mut last_passno = passno0;
    let mut last_raw = false;
    let mut last_complete = true;
    let mut all_planes_done = false;
    let mut ran_any_pass = false;

    for segno in segno0..segs.len() {
      let seg = &segs[segno];
      if seg.passes == 0 && segno > segno0 {
        break;
      }
      let chunks: &[&[u8]] = &seg.chunks;
      last_chunks = seg.chunks.clone();
      let raw =
        cblksty.contains(CblkSty::LAZY) && passtype < 2 && bp1 <= numbps as i32 - 4;

      if segno == segno0 && mq_restored {
        // Coder state restored from the snapshot; data cursor already
        // points into this segment's chunk list.
      } else if raw {
        self.mqc.init_raw(chunks);
      } else {
        self.mqc.init_decode(chunks);
      }

      let first_pass = if segno == segno0 { passno0 } else { 0 };
      let mut passno = first_pass;
      while passno < seg.passes && bp1 >= 1 {
        self.cur_segno = segno as u16;
        self.cur_passno = passno;
        self.cur_passtype = passtype;
        self.cur_bp1 = bp1;
        let pass_mid = if passno == passno0 && segno == segno0 {
          mid.take()
        } else {
          None
        };
        match passtype {
          0 => self.dec_sigpass(chunks, bp1, cblksty, raw, pass_mid),
          1 => self.dec_refpass(chunks, bp1, raw, pass_mid),
          _ => self.dec_clnpass(chunks, bp1, cblksty, pass_mid),
        }
        if cblksty.contains(CblkSty::RESET) && !raw {
          self.mqc.reset_states();
        }
        passtype += 1;
        if passtype == 3 {
          passtype = 0;
          bp1 -= 1;
        }
        passno += 1;
        ran_any_pass = true;
      }

      last_segno = segno;
      last_passno = passno;
      last_raw = raw;
      last_complete = seg.complete;
      if bp1 < 1 {
        all_planes_done = true;
        break;
      }
    }

    // Where the next differential call picks up, unless a red-zone
    // checkpoint already froze a mid-pass position. A call that ran
    // nothing hands the untouched state straight back.
    if self.ckpt_arm && self.pending.is_none() && !ran_any_pass {
      self.pending = orig_resume.map(Box::new);
    } else if self.ckpt_arm && self.pending.is_none() && !all_planes_done {
      let kind = if last_complete {
        Some(ResumeKind::SegmentBoundary)
      } else if self.mqc.end_count == 0 && !self.mqc.overflow {
        Some(ResumeKind::PassBoundary)
      } else {
        // The segment tail leaned on synthetic fill; a longer packet
        // would change it, so the next call re-decodes from scratch.
        None
      };
      if let Some(kind) = kind {
        let (next_segno, next_passno) = if last_complete {
          (last_segno as u16 + 1, 0)
        } else {
          (last_segno as u16, last_passno)
        };
        self.pending = Some(Box::new(DecodeResume {
          segno: next_segno,
          passno: next_passno,
          passtype,
          bp1,
          raw: last_raw,
          mq: self.mqc.snapshot(),
          kind,
          flags: self.flags.clone(),
          data: self.data.clone(),
        }));
      }
    }

    if check_pterm {
      let left = self.mqc.dec_remaining(&last_chunks);
      if left > 2 {
        warn!("PTERM check failure: {} remaining bytes in code block", left);
      } else if self.mqc.end_count > 2 {
        warn!(
          "PTERM check failure: {} synthesized 0xFF markers read",
          self.mqc.end_count
        );
      }
    }

    if cached && !final_layer {
      *resume = self.pending.take().map(|b| *b);
    } else {
      self.pending = None;
    }
    Ok(())
  }

  // ----------------------------------------------------------------- //
  // Encoding passes                                                    //
  // ----------------------------------------------------------------- //

  fn enc_sig_step(
    &mut self,
    fp: usize,
    row: u32,
    col: u32,
    ci: u32,
    one: i32,
    raw: bool,
    vsc: bool,
    bpno: i32,
    nmsedec: &mut i32,
  ) {
    let f = self.flags[fp];
    if f & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) == 0 && f & (T1_SIGMA_NEIGHBOURS << ci) != 0 {
      let di = self.didx(row, col);
      let d = self.data[di];
      let v = (smr_abs(d) & one as u32 != 0) as u32;
      let ctx = self.zc_ctx(f >> ci);
      if raw {
        self.mqc.bypass_encode(v);
      } else {
        self.mqc.set_ctx(ctx);
        self.mqc.encode(v);
      }
      if v != 0 {
        let lu = self.sc_lu(fp, ci);
        let sign = smr_sign(d);
        *nmsedec += nmsedec_sig(smr_abs(d), bpno as u32);
        if raw {
          self.mqc.bypass_encode(sign);
        } else {
          self.mqc.set_ctx(LUT_CTXNO_SC[lu]);
          self.mqc.encode(sign ^ LUT_SPB[lu] as u32);
        }
        self.update_flags(fp, ci, sign, vsc);
      }
      self.flags[fp] |= T1_PI_THIS << ci;
    }
  }

  fn enc_sigpass(&mut self, bpno: i32, raw: bool, cblksty: CblkSty, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + T1_NMSEDEC_FRACBITS);
    let vsc_on = cblksty.contains(CblkSty::VSC);
    *nmsedec = 0;
    let w = self.w;
    let full_h = self.h & !3;
    let mut k = 0;
    while k < full_h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        if self.flags[fp] == 0 {
          continue;
        }
        for s in 0..4u32 {
          self.enc_sig_step(fp, k + s, i, 3 * s, one, raw, vsc_on && s == 0, bpno, nmsedec);
        }
      }
      k += 4;
    }
    if k < self.h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        if self.flags[fp] == 0 {
          continue;
        }
        for j in 0..self.h - k {
          self.enc_sig_step(fp, k + j, i, 3 * j, one, raw, vsc_on && j == 0, bpno, nmsedec);
        }
      }
    }
  }

  fn enc_ref_step(&mut self, fp: usize, row: u32, col: u32, ci: u32, one: i32, raw: bool, bpno: i32, nmsedec: &mut i32) {
    let shifted = self.flags[fp] >> ci;
    if shifted & (T1_SIGMA_THIS | T1_PI_THIS) == T1_SIGMA_THIS {
      let di = self.didx(row, col);
      let d = self.data[di];
      *nmsedec += nmsedec_ref(smr_abs(d), bpno as u32);
      let v = (smr_abs(d) & one as u32 != 0) as u32;
      if raw {
        self.mqc.bypass_encode(v);
      } else {
        self.mqc.set_ctx(Self::mag_ctx(shifted));
        self.mqc.encode(v);
      }
      self.flags[fp] |= T1_MU_THIS << ci;
    }
  }

  fn enc_refpass(&mut self, bpno: i32, raw: bool, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + T1_NMSEDEC_FRACBITS);
    *nmsedec = 0;
    let w = self.w;
    let full_h = self.h & !3;
    let mut k = 0;
    while k < full_h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        let f = self.flags[fp];
        if f & T1_SIGMA_THIS_ALL == 0 {
          continue;
        }
        if f & T1_PI_ALL == T1_PI_ALL {
          continue;
        }
        for s in 0..4u32 {
          self.enc_ref_step(fp, k + s, i, 3 * s, one, raw, bpno, nmsedec);
        }
      }
      k += 4;
    }
    if k < self.h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        if self.flags[fp] & T1_SIGMA_THIS_ALL == 0 {
          continue;
        }
        for j in 0..self.h - k {
          self.enc_ref_step(fp, k + j, i, 3 * j, one, raw, bpno, nmsedec);
        }
      }
    }
  }

  fn enc_cln_sign(&mut self, fp: usize, row: u32, col: u32, ci: u32, vsc: bool, bpno: i32, nmsedec: &mut i32) {
    let di = self.didx(row, col);
    let d = self.data[di];
    let lu = self.sc_lu(fp, ci);
    *nmsedec += nmsedec_sig(smr_abs(d), bpno as u32);
    let sign = smr_sign(d);
    self.mqc.set_ctx(LUT_CTXNO_SC[lu]);
    self.mqc.encode(sign ^ LUT_SPB[lu] as u32);
    self.update_flags(fp, ci, sign, vsc);
  }

  fn enc_clnpass(&mut self, bpno: i32, cblksty: CblkSty, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + T1_NMSEDEC_FRACBITS);
    let vsc_on = cblksty.contains(CblkSty::VSC);
    *nmsedec = 0;
    let w = self.w;
    let full_h = self.h & !3;
    let mut k = 0;
    while k < full_h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        let agg = self.flags[fp] == 0;
        let mut runlen = 0u32;
        if agg {
          while runlen < 4 {
            let di = self.didx(k + runlen, i);
            if smr_abs(self.data[di]) & one as u32 != 0 {
              break;
            }
            runlen += 1;
          }
          self.mqc.set_ctx(T1_CTXNO_AGG);
          self.mqc.encode((runlen != 4) as u32);
          if runlen == 4 {
            continue;
          }
          self.mqc.set_ctx(T1_CTXNO_UNI);
          self.mqc.encode(runlen >> 1);
          self.mqc.encode(runlen & 1);
        }
        let mut ci = 3 * runlen;
        while ci < 12 {
          let row = k + ci / 3;
          let partial = agg && ci == 3 * runlen;
          if partial {
            self.enc_cln_sign(fp, row, i, ci, vsc_on && ci == 0, bpno, nmsedec);
          } else if self.flags[fp] & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) == 0 {
            let di = self.didx(row, i);
            let v = (smr_abs(self.data[di]) & one as u32 != 0) as u32;
            let ctx = self.zc_ctx(self.flags[fp] >> ci);
            self.mqc.set_ctx(ctx);
            self.mqc.encode(v);
            if v != 0 {
              self.enc_cln_sign(fp, row, i, ci, vsc_on && ci == 0, bpno, nmsedec);
            }
          }
          self.flags[fp] &= !(T1_PI_THIS << ci);
          ci += 3;
        }
      }
      k += 4;
    }
    if k < self.h {
      for i in 0..w {
        let fp = self.fidx(k / 4, i);
        let lim = 3 * (self.h - k);
        let mut ci = 0;
        while ci < lim {
          let row = k + ci / 3;
          if self.flags[fp] & ((T1_SIGMA_THIS | T1_PI_THIS) << ci) == 0 {
            let di = self.didx(row, i);
            let v = (smr_abs(self.data[di]) & one as u32 != 0) as u32;
            let ctx = self.zc_ctx(self.flags[fp] >> ci);
            self.mqc.set_ctx(ctx);
            self.mqc.encode(v);
            if v != 0 {
              self.enc_cln_sign(fp, row, i, ci, vsc_on && ci == 0, bpno, nmsedec);
            }
          }
          self.flags[fp] &= !(T1_PI_THIS << ci);
          ci += 3;
        }
      }
    }
  }

  fn is_term_pass(&self, numbps: u8, cblksty: CblkSty, bpno: i32, passtype: u8) -> bool {
    if passtype == 2 && bpno == 0 {
      return true;
    }
    if cblksty.contains(CblkSty::TERMALL) {
      return true;
    }
    if cblksty.contains(CblkSty::LAZY) {
      // The fourth cleanup pass terminates; beyond it, every refinement
      // and cleanup pass does.
      if bpno == numbps as i32 - 4 && passtype == 2 {
        return true;
      }
      if bpno < numbps as i32 - 4 && passtype > 0 {
        return true;
      }
    }
    false
  }

  /// Compresses one block. `samples` are quantised coefficients in
  /// two's complement; `weight` is the combined DWT/MCT norm for the
  /// band and `stepsize` the quantisation step (1.0 when reversible).
  #[allow(clippy::too_many_arguments)]
  pub fn compress(
    &mut self,
    samples: &[i32],
    w: u32,
    h: u32,
    orient: BandOrientation,
    cblksty: CblkSty,
    weight: f64,
    stepsize: f64,
    do_rate: bool,
  ) -> EncOut {
    debug_assert_eq!(samples.len(), (w * h) as usize);
    self.alloc(w, h);
    self.zc_base = (orient as usize) << 9;

    let mut max = 0u32;
    for (dst, &s) in self.data.iter_mut().zip(samples.iter()) {
      let smr = to_smr(s);
      let mag = smr_abs(smr) << T1_NMSEDEC_FRACBITS;
      *dst = (mag | (smr as u32 & 0x8000_0000)) as i32;
      max = max.max(mag);
    }

    let mut out = EncOut::default();
    if max > 0 {
      let t = crate::math::floorlog2(max) + 1;
      if t > T1_NMSEDEC_FRACBITS {
        out.numbps = (t - T1_NMSEDEC_FRACBITS) as u8;
      }
    }
    if out.numbps == 0 {
      return out;
    }

    let mut bpno = out.numbps as i32 - 1;
    let mut passtype: u8 = 2;
    self.mqc.reset_states();
    self.mqc.init_encode();

    let mut nmsedec = 0i32;
    let mut cum_distortion = 0.0f64;
    while bpno >= 0 && out.passes.len() < MAX_PASSES {
      let raw = cblksty.contains(CblkSty::LAZY)
        && bpno < out.numbps as i32 - 4
        && passtype < 2;

      if let Some(prev) = out.passes.last() {
        if prev.term {
          if raw {
            self.mqc.bypass_init();
          } else {
            self.mqc.restart_init();
          }
        }
      }

      match passtype {
        0 => self.enc_sigpass(bpno, raw, cblksty, &mut nmsedec),
        1 => self.enc_refpass(bpno, raw, &mut nmsedec),
        _ => {
          self.enc_clnpass(bpno, cblksty, &mut nmsedec);
          if cblksty.contains(CblkSty::SEGSYM) {
            self.mqc.segmark();
          }
        }
      }

      let mut pass = EncPass::default();
      if do_rate {
        let base = weight * stepsize * (1u64 << bpno) as f64;
        cum_distortion += base * base * nmsedec as f64 / 8192.0;
        pass.distortion = cum_distortion;
      }
      if self.is_term_pass(out.numbps, cblksty, bpno, passtype) {
        if raw {
          self.mqc.bypass_flush(cblksty.contains(CblkSty::PTERM));
        } else if cblksty.contains(CblkSty::PTERM) {
          self.mqc.erterm();
        } else {
          self.mqc.flush();
        }
        pass.term = true;
        pass.rate = self.mqc.numbytes();
      } else {
        // Correction term so a truncation at this pass still yields all
        // decodable bits.
        let extra = if raw {
          self.mqc.bypass_extra_bytes(cblksty.contains(CblkSty::PTERM))
        } else {
          4 + 1 + (self.mqc.ct < 5) as u32
        };
        pass.term = false;
        pass.rate = self.mqc.numbytes() + extra;
      }
      out.passes.push(pass);

      passtype += 1;
      if passtype == 3 {
        passtype = 0;
        bpno -= 1;
      }
      if cblksty.contains(CblkSty::RESET) {
        self.mqc.reset_states();
      }
    }

    // Rates must be non-decreasing along the pass sequence and bounded
    // by what was actually emitted.
    let mut last_rate = self.mqc.numbytes();
    for pass in out.passes.iter_mut().rev() {
      if pass.rate > last_rate {
        pass.rate = last_rate;
      } else {
        last_rate = pass.rate;
      }
    }
    // A pass may never end on 0xFF.
    let emitted = self.mqc.enc_data().to_vec();
    let mut prev_rate = 0u32;
    for pass in out.passes.iter_mut() {
      if pass.rate > 0 && emitted.get(pass.rate as usize - 1) == Some(&0xff) {
        pass.rate -= 1;
      }
      pass.len = pass.rate - prev_rate;
      prev_rate = pass.rate;
    }

    let total = out.passes.last().map(|p| p.rate).unwrap_or(0) as usize;
    out.data = emitted[..total.min(emitted.len())].to_vec();
    out
  }
}

/// Normalised distortion decrease when a sample becomes significant at
/// `bitpos`. The seven window bits straddle the coded bit, scaled so the
/// caller's `/ 8192` matches the pass-weighting convention.
fn nmsedec_sig(x: u32, bitpos: u32) -> i32 {
  let i = if bitpos > 0 { (x >> bitpos) & 0x7f } else { x & 0x7f };
  let t = i as f64 / 64.0;
  let gain = t * t - (t - 1.5) * (t - 1.5);
  ((gain * 8192.0).floor() as i32).max(0)
}

/// Normalised distortion decrease for a refinement bit at `bitpos`.
fn nmsedec_ref(x: u32, bitpos: u32) -> i32 {
  let i = if bitpos > 0 { (x >> bitpos) & 0x7f } else { x & 0x7f };
  let t = i as f64 / 64.0;
  let gain = (t - 1.0) * (t - 1.0) - (t - 1.5) * (t - 1.5);
  ((gain * 8192.0).floor() as i32).max(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::MAX_PASSES_PER_SEGMENT;

  fn xorshift(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
  }

  fn random_samples(w: u32, h: u32, amp: i32, seed: u32) -> Vec<i32> {
    let mut s = seed;
    (0..w * h)
      .map(|_| (xorshift(&mut s) % (2 * amp as u32 + 1)) as i32 - amp)
      .collect()
  }

  /// Groups encoder passes into segments the way the packet layer does:
  /// a termination closes a segment when the mode switches call for it.
  fn segments_from_passes(passes: &[EncPass], cblksty: CblkSty, numbps: u8) -> Vec<(u32, u32)> {
    // Returns (first_pass, num_passes) per segment.
    let mut segs = Vec::new();
    let mut start = 0u32;
    let mut count = 0u32;
    for (i, _p) in passes.iter().enumerate() {
      count += 1;
      let max = max_passes_for(segs.len(), cblksty, numbps);
      if count == max {
        segs.push((start, count));
        start = i as u32 + 1;
        count = 0;
      }
    }
    if count > 0 {
      segs.push((start, count));
    }
    segs
  }

  fn max_passes_for(segno: usize, cblksty: CblkSty, numbps: u8) -> u32 {
    if cblksty.contains(CblkSty::TERMALL) {
      1
    } else if cblksty.contains(CblkSty::LAZY) {
      if segno == 0 {
        // Up to the bypass switch: 3 * 4 - 2 passes.
        (3 * numbps.min(4) as u32).saturating_sub(2).max(1)
      } else if segno % 2 == 1 {
        2
      } else {
        1
      }
    } else {
      MAX_PASSES_PER_SEGMENT as u32
    }
  }

  fn roundtrip(w: u32, h: u32, amp: i32, cblksty: CblkSty, seed: u32) {
    let samples = random_samples(w, h, amp, seed);
    let mut enc = BlockCoder::new();
    let out = enc.compress(
      &samples,
      w,
      h,
      BandOrientation::LL,
      cblksty,
      1.0,
      1.0,
      false,
    );

    let mut dec = BlockCoder::new();
    let mut resume = None;
    let segs: Vec<SegView<'_>> = if out.passes.is_empty() {
      Vec::new()
    } else {
      let groups = segments_from_passes(&out.passes, cblksty, out.numbps);
      let mut views = Vec::new();
      let mut byte_start = 0u32;
      for &(first, count) in &groups {
        let last = (first + count - 1) as usize;
        let end = out.passes[last].rate;
        let mut chunks = SmallVec::new();
        chunks.push(&out.data[byte_start as usize..end as usize]);
        views.push(SegView {
          chunks,
          passes: count,
          complete: count == max_passes_for(views.len(), cblksty, out.numbps),
        });
        byte_start = end;
      }
      views
    };
    dec
      .decompress(
        &mut resume,
        &segs,
        w,
        h,
        out.numbps,
        cblksty,
        BandOrientation::LL,
        false,
        true,
      )
      .unwrap();

    for (idx, &orig) in samples.iter().enumerate() {
      let got = dec.data[idx] / 2;
      assert_eq!(got, orig, "sample {} sty {:?}", idx, cblksty);
    }
  }

  #[test]
  fn roundtrip_plain() {
    roundtrip(16, 16, 127, CblkSty::empty(), 0x1111);
    roundtrip(32, 32, 255, CblkSty::empty(), 0x2222);
  }

  #[test]
  fn roundtrip_odd_dimensions() {
    // Width and height not multiples of the stripe height.
    roundtrip(13, 7, 127, CblkSty::empty(), 0x3333);
    roundtrip(5, 9, 63, CblkSty::empty(), 0x4444);
    roundtrip(1, 1, 100, CblkSty::empty(), 0x5555);
  }

  #[test]
  fn roundtrip_all_mode_switches() {
    let styles = [
      CblkSty::VSC,
      CblkSty::RESET,
      CblkSty::TERMALL,
      CblkSty::SEGSYM,
      CblkSty::PTERM | CblkSty::TERMALL,
      CblkSty::LAZY | CblkSty::TERMALL,
      CblkSty::LAZY | CblkSty::TERMALL | CblkSty::SEGSYM,
      CblkSty::VSC | CblkSty::SEGSYM,
    ];
    for (n, &sty) in styles.iter().enumerate() {
      roundtrip(16, 16, 127, sty, 0x1000 + n as u32);
    }
  }

  #[test]
  fn segsym_stream_decodes_with_warning_free_symbols() {
    // Scenario: LAZY|TERMALL|SEGSYM on random 8-bit data; SEGMARK bits
    // must decode as 0xA at every cleanup termination (the decoder
    // warns otherwise, and the data equality below would break).
    roundtrip(
      16,
      16,
      127,
      CblkSty::LAZY | CblkSty::TERMALL | CblkSty::SEGSYM,
      0x7777,
    );
  }

  #[test]
  fn all_zero_block_has_no_passes() {
    let samples = vec![0i32; 64];
    let mut enc = BlockCoder::new();
    let out = enc.compress(
      &samples,
      8,
      8,
      BandOrientation::HL,
      CblkSty::empty(),
      1.0,
      1.0,
      false,
    );
    assert_eq!(out.numbps, 0);
    assert!(out.passes.is_empty());
    assert!(out.data.is_empty());
  }

  #[test]
  fn truncation_at_any_pass_boundary_is_decodable() {
    let w = 16;
    let h = 16;
    let samples = random_samples(w, h, 127, 0xabcd);
    let mut enc = BlockCoder::new();
    let out = enc.compress(
      &samples,
      w,
      h,
      BandOrientation::LL,
      CblkSty::empty(),
      1.0,
      1.0,
      false,
    );
    // Decoding only the first n passes must not panic and must produce
    // zeros on planes below the decoded ones (coarse check: it runs).
    for n in 1..out.passes.len() {
      let rate = out.passes[n - 1].rate as usize;
      let mut chunks = SmallVec::new();
      chunks.push(&out.data[..rate]);
      let segs = [SegView {
        chunks,
        passes: n as u32,
        complete: false,
      }];
      let mut dec = BlockCoder::new();
      let mut resume = None;
      dec
        .decompress(
          &mut resume,
          &segs,
          w,
          h,
          out.numbps,
          CblkSty::empty(),
          BandOrientation::LL,
          false,
          true,
        )
        .unwrap();
    }
  }

  #[test]
  fn differential_decode_matches_from_scratch() {
    let w = 32;
    let h = 32;
    let samples = random_samples(w, h, 200, 0xfeed);
    let mut enc = BlockCoder::new();
    let out = enc.compress(
      &samples,
      w,
      h,
      BandOrientation::LL,
      CblkSty::empty(),
      1.0,
      1.0,
      false,
    );
    let total_passes = out.passes.len() as u32;
    assert!(total_passes >= 4, "need several passes for the scenario");

    // Split the single segment's bytes as two layer contributions.
    for cut in [1usize, 2, total_passes as usize / 2, total_passes as usize - 1] {
      let cut_rate = out.passes[cut - 1].rate as usize;

      // Differential: decode layer 1, then extend with layer 2.
      let mut dec = BlockCoder::new();
      let mut resume = None;
      let mut chunks1 = SmallVec::new();
      chunks1.push(&out.data[..cut_rate]);
      let segs1 = [SegView {
        chunks: chunks1,
        passes: cut as u32,
        complete: false,
      }];
      dec
        .decompress(
          &mut resume,
          &segs1,
          w,
          h,
          out.numbps,
          CblkSty::empty(),
          BandOrientation::LL,
          true,
          false,
        )
        .unwrap();

      let mut dec2 = BlockCoder::new();
      if resume.is_some() {
        // Resume path: replay only the tail.
        let mut chunks2 = SmallVec::new();
        chunks2.push(&out.data[..cut_rate]);
        chunks2.push(&out.data[cut_rate..]);
        let segs2 = [SegView {
          chunks: chunks2,
          passes: total_passes,
          complete: true,
        }];
        dec2
          .decompress(
            &mut resume,
            &segs2,
            w,
            h,
            out.numbps,
            CblkSty::empty(),
            BandOrientation::LL,
            true,
            true,
          )
          .unwrap();
      } else {
        // Fallback: full re-decode, still must match.
        let mut chunks2 = SmallVec::new();
        chunks2.push(&out.data[..]);
        let segs2 = [SegView {
          chunks: chunks2,
          passes: total_passes,
          complete: true,
        }];
        dec2
          .decompress(
            &mut resume,
            &segs2,
            w,
            h,
            out.numbps,
            CblkSty::empty(),
            BandOrientation::LL,
            false,
            true,
          )
          .unwrap();
      }

      // From scratch with everything.
      let mut dec3 = BlockCoder::new();
      let mut none = None;
      let mut chunks3 = SmallVec::new();
      chunks3.push(&out.data[..]);
      let segs3 = [SegView {
        chunks: chunks3,
        passes: total_passes,
        complete: true,
      }];
      dec3
        .decompress(
          &mut none,
          &segs3,
          w,
          h,
          out.numbps,
          CblkSty::empty(),
          BandOrientation::LL,
          false,
          true,
        )
        .unwrap();

      assert_eq!(dec2.data, dec3.data, "cut at pass {}", cut);
    }
  }

  #[test]
  fn zero_planes_above_numbps() {
    // Universal invariant: every reconstructed magnitude fits inside
    // numbps bit planes.
    let w = 16;
    let h = 16;
    let samples = random_samples(w, h, 90, 0x600d);
    let mut enc = BlockCoder::new();
    let out = enc.compress(
      &samples,
      w,
      h,
      BandOrientation::LH,
      CblkSty::empty(),
      1.0,
      1.0,
      false,
    );
    let mut dec = BlockCoder::new();
    let mut resume = None;
    let mut chunks = SmallVec::new();
    chunks.push(&out.data[..]);
    let segs = [SegView {
      chunks,
      passes: out.passes.len() as u32,
      complete: true,
    }];
    dec
      .decompress(
        &mut resume,
        &segs,
        w,
        h,
        out.numbps,
        CblkSty::empty(),
        BandOrientation::LH,
        false,
        true,
      )
      .unwrap();
    let limit = 1i64 << out.numbps;
    for &v in &dec.data {
      assert!(((v / 2) as i64).abs() < limit);
    }
  }
}
