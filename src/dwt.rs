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

//! Discrete wavelet transform: reversible 5/3 and irreversible 9/7
//! lifting kernels, whole-tile forward and inverse, and a windowed
//! inverse that reads and writes a sparse coefficient canvas.
//!
//! The tile-component buffer uses the packed layout: at any level, the
//! lower resolution occupies the top-left region, with HL, LH and HH of
//! the next level to its right, below it, and diagonally. Line parities
//! are taken from canvas coordinates, so sub-sampling and odd origins
//! fall out of the index arithmetic.

use crate::math::Rect;
use crate::sparse_array::SparseArray;

const ALPHA: f64 = -1.586134342059924;
const BETA: f64 = -0.052980118572961;
const GAMMA: f64 = 0.882911075530934;
const DELTA: f64 = 0.443506852043971;
const K: f64 = 1.230174104914001;

/// Filter half-support used to grow windows per level.
pub(crate) const MARGIN_53: u32 = 2;
pub(crate) const MARGIN_97: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwtKind {
  Reversible53,
  Irreversible97,
}

impl DwtKind {
  pub(crate) fn margin(self) -> u32 {
    match self {
      DwtKind::Reversible53 => MARGIN_53,
      DwtKind::Irreversible97 => MARGIN_97,
    }
  }
}

/// Inverse 5/3 of one line spanning canvas `[x0, x1)`. `low`/`high` are
/// the packed band halves; `out` receives the interleaved samples.
fn inv_line_53(low: &[i32], high: &[i32], out: &mut [i32], x0: u32, x1: u32) {
  let n = (x1 - x0) as usize;
  debug_assert_eq!(n, out.len());
  if n == 0 {
    return;
  }
  if n == 1 {
    out[0] = if x0 & 1 == 0 { low[0] } else { high[0] / 2 };
    return;
  }
  let l0 = ((x0 + 1) >> 1) as i64;
  let h0 = (x0 >> 1) as i64;
  let lc = |i: i64| -> i32 {
    if low.is_empty() {
      0
    } else {
      low[(i - l0).clamp(0, low.len() as i64 - 1) as usize]
    }
  };
  let hc = |i: i64| -> i32 {
    if high.is_empty() {
      0
    } else {
      high[(i - h0).clamp(0, high.len() as i64 - 1) as usize]
    }
  };
  // Even canvas positions first.
  let mut p = x0 + (x0 & 1);
  while p < x1 {
    let i = (p >> 1) as i64;
    out[(p - x0) as usize] = lc(i) - ((hc(i - 1) + hc(i) + 2) >> 2);
    p += 2;
  }
  // Odd positions from reconstructed evens, mirrored at the edges.
  let ev = |p: i64, out: &[i32]| -> i32 {
    let mut q = p;
    if q < x0 as i64 {
      q = 2 * x0 as i64 - q;
    }
    if q > x1 as i64 - 1 {
      q = 2 * (x1 as i64 - 1) - q;
    }
    out[(q - x0 as i64) as usize]
  };
  let mut p = x0 | 1;
  if p < x0 {
    p += 2;
  }
  while p < x1 {
    let i = (p >> 1) as i64;
    out[(p - x0) as usize] =
      hc(i) + ((ev(p as i64 - 1, out) + ev(p as i64 + 1, out)) >> 1);
    p += 2;
  }
}

/// Forward 5/3 of one line: interleaved samples in, packed halves out.
fn fwd_line_53(line: &[i32], low: &mut [i32], high: &mut [i32], x0: u32, x1: u32) {
  let n = (x1 - x0) as usize;
  debug_assert_eq!(n, line.len());
  if n == 0 {
    return;
  }
  if n == 1 {
    if x0 & 1 == 0 {
      low[0] = line[0];
    } else {
      high[0] = line[0] * 2;
    }
    return;
  }
  let mirror = |p: i64| -> i64 {
    let mut q = p;
    if q < x0 as i64 {
      q = 2 * x0 as i64 - q;
    }
    if q > x1 as i64 - 1 {
      q = 2 * (x1 as i64 - 1) - q;
    }
    q
  };
  let xat = |p: i64| -> i32 { line[(mirror(p) - x0 as i64) as usize] };
  let h0 = (x0 >> 1) as i64;
  let l0 = ((x0 + 1) >> 1) as i64;
  // Predict odds.
  let mut p = x0 | 1;
  while p < x1 {
    let i = (p >> 1) as i64;
    high[(i - h0) as usize] = xat(p as i64) - ((xat(p as i64 - 1) + xat(p as i64 + 1)) >> 1);
    p += 2;
  }
  // Update evens, mirroring high-band indices at the edges.
  let dn = high.len() as i64;
  let hc = |i: i64, high: &[i32]| -> i32 {
    if dn == 0 {
      0
    } else {
      high[(i - h0).clamp(0, dn - 1) as usize]
    }
  };
  let mut p = x0 + (x0 & 1);
  while p < x1 {
    let i = (p >> 1) as i64;
    low[(i - l0) as usize] = xat(p as i64) + ((hc(i - 1, high) + hc(i, high) + 2) >> 2);
    p += 2;
  }
}

/// Inverse 9/7 of one line; values round back to integers at the end so
/// the windowed and whole-tile paths agree bit for bit.
fn inv_line_97(low: &[i32], high: &[i32], out: &mut [i32], x0: u32, x1: u32) {
  let n = (x1 - x0) as usize;
  if n == 0 {
    return;
  }
  if n == 1 {
    out[0] = if x0 & 1 == 0 {
      low[0]
    } else {
      ((high[0] as f64) / 2.0).round() as i32
    };
    return;
  }
  let l0 = ((x0 + 1) >> 1) as i64;
  let h0 = (x0 >> 1) as i64;
  let sn = low.len();
  let dn = high.len();
  let mut s: Vec<f64> = low.iter().map(|&v| v as f64 * K).collect();
  let mut d: Vec<f64> = high.iter().map(|&v| v as f64 / K).collect();
  let sc = |i: i64, s: &[f64]| -> f64 {
    if sn == 0 {
      0.0
    } else {
      s[(i - l0).clamp(0, sn as i64 - 1) as usize]
    }
  };
  let dc = |i: i64, d: &[f64]| -> f64 {
    if dn == 0 {
      0.0
    } else {
      d[(i - h0).clamp(0, dn as i64 - 1) as usize]
    }
  };
  // Undo the two update/predict pairs in reverse order.
  for i in 0..sn {
    let g = i as i64 + l0;
    s[i] -= DELTA * (dc(g - 1, &d) + dc(g, &d));
  }
  for i in 0..dn {
    let g = i as i64 + h0;
    d[i] -= GAMMA * (sc(g, &s) + sc(g + 1, &s));
  }
  for i in 0..sn {
    let g = i as i64 + l0;
    s[i] -= BETA * (dc(g - 1, &d) + dc(g, &d));
  }
  for i in 0..dn {
    let g = i as i64 + h0;
    d[i] -= ALPHA * (sc(g, &s) + sc(g + 1, &s));
  }
  for p in x0..x1 {
    let i = (p >> 1) as i64;
    let v = if p & 1 == 0 { sc(i, &s) } else { dc(i, &d) };
    out[(p - x0) as usize] = v.round() as i32;
  }
}

/// Forward 9/7 of one line.
fn fwd_line_97(line: &[i32], low: &mut [i32], high: &mut [i32], x0: u32, x1: u32) {
  let n = (x1 - x0) as usize;
  if n == 0 {
    return;
  }
  if n == 1 {
    if x0 & 1 == 0 {
      low[0] = line[0];
    } else {
      high[0] = line[0] * 2;
    }
    return;
  }
  let mirror = |p: i64| -> i64 {
    let mut q = p;
    if q < x0 as i64 {
      q = 2 * x0 as i64 - q;
    }
    if q > x1 as i64 - 1 {
      q = 2 * (x1 as i64 - 1) - q;
    }
    q
  };
  let xat = |p: i64| -> f64 { line[(mirror(p) - x0 as i64) as usize] as f64 };
  let l0 = ((x0 + 1) >> 1) as i64;
  let h0 = (x0 >> 1) as i64;
  let sn = low.len();
  let dn = high.len();
  let mut s: Vec<f64> = (0..sn).map(|i| xat(2 * (i as i64 + l0))).collect();
  let mut d: Vec<f64> = (0..dn).map(|i| xat(2 * (i as i64 + h0) + 1)).collect();
  let sc = |i: i64, s: &[f64]| -> f64 {
    if sn == 0 {
      0.0
    } else {
      s[(i - l0).clamp(0, sn as i64 - 1) as usize]
    }
  };
  let dc = |i: i64, d: &[f64]| -> f64 {
    if dn == 0 {
      0.0
    } else {
      d[(i - h0).clamp(0, dn as i64 - 1) as usize]
    }
  };
  for i in 0..dn {
    let g = i as i64 + h0;
    d[i] += ALPHA * (sc(g, &s) + sc(g + 1, &s));
  }
  for i in 0..sn {
    let g = i as i64 + l0;
    s[i] += BETA * (dc(g - 1, &d) + dc(g, &d));
  }
  for i in 0..dn {
    let g = i as i64 + h0;
    d[i] += GAMMA * (sc(g, &s) + sc(g + 1, &s));
  }
  for i in 0..sn {
    let g = i as i64 + l0;
    s[i] += DELTA * (dc(g - 1, &d) + dc(g, &d));
  }
  for i in 0..sn {
    low[i] = (s[i] / K).round() as i32;
  }
  for i in 0..dn {
    high[i] = (d[i] * K).round() as i32;
  }
}

fn inv_line(kind: DwtKind, low: &[i32], high: &[i32], out: &mut [i32], x0: u32, x1: u32) {
  match kind {
    DwtKind::Reversible53 => inv_line_53(low, high, out, x0, x1),
    DwtKind::Irreversible97 => inv_line_97(low, high, out, x0, x1),
  }
}

fn fwd_line(kind: DwtKind, line: &[i32], low: &mut [i32], high: &mut [i32], x0: u32, x1: u32) {
  match kind {
    DwtKind::Reversible53 => fwd_line_53(line, low, high, x0, x1),
    DwtKind::Irreversible97 => fwd_line_97(line, low, high, x0, x1),
  }
}

/// Whole-tile inverse over `res_rects[0..=max_res]` (canvas reduced
/// rectangles per resolution, coarsest first). The buffer holds packed
/// coefficients with row stride `stride` and is rewritten in place.
pub(crate) fn decode_tile(
  kind: DwtKind,
  buf: &mut [i32],
  stride: usize,
  res_rects: &[Rect],
  max_res: usize,
) {
  for r in 1..=max_res {
    let prev = res_rects[r - 1];
    let cur = res_rects[r];
    decode_level(kind, buf, stride, &prev, &cur);
  }
}

fn decode_level(kind: DwtKind, buf: &mut [i32], stride: usize, prev: &Rect, cur: &Rect) {
  let rw = cur.width() as usize;
  let rh = cur.height() as usize;
  let sw = prev.width() as usize;
  let sh = prev.height() as usize;
  if rw == 0 || rh == 0 {
    return;
  }
  // Horizontal: every packed row interleaves its low and high halves.
  let mut out = vec![0i32; rw];
  for y in 0..rh {
    let row = &buf[y * stride..y * stride + rw];
    inv_line(kind, &row[..sw], &row[sw..], &mut out, cur.x0, cur.x1);
    buf[y * stride..y * stride + rw].copy_from_slice(&out);
  }
  // Vertical: per column, top rows are the low half.
  let mut low = vec![0i32; sh];
  let mut high = vec![0i32; rh - sh];
  let mut col = vec![0i32; rh];
  for x in 0..rw {
    for (y, l) in low.iter_mut().enumerate() {
      *l = buf[y * stride + x];
    }
    for (y, h) in high.iter_mut().enumerate() {
      *h = buf[(sh + y) * stride + x];
    }
    inv_line(kind, &low, &high, &mut col, cur.y0, cur.y1);
    for (y, &v) in col.iter().enumerate() {
      buf[y * stride + x] = v;
    }
  }
}

/// Whole-tile forward transform, the exact reverse of [`decode_tile`].
pub(crate) fn encode_tile(
  kind: DwtKind,
  buf: &mut [i32],
  stride: usize,
  res_rects: &[Rect],
  max_res: usize,
) {
  for r in (1..=max_res).rev() {
    let prev = res_rects[r - 1];
    let cur = res_rects[r];
    encode_level(kind, buf, stride, &prev, &cur);
  }
}

fn encode_level(kind: DwtKind, buf: &mut [i32], stride: usize, prev: &Rect, cur: &Rect) {
  let rw = cur.width() as usize;
  let rh = cur.height() as usize;
  let sw = prev.width() as usize;
  let sh = prev.height() as usize;
  if rw == 0 || rh == 0 {
    return;
  }
  // Vertical first (the inverse runs horizontal last).
  let mut col = vec![0i32; rh];
  let mut low = vec![0i32; sh];
  let mut high = vec![0i32; rh - sh];
  for x in 0..rw {
    for (y, c) in col.iter_mut().enumerate() {
      *c = buf[y * stride + x];
    }
    fwd_line(kind, &col, &mut low, &mut high, cur.y0, cur.y1);
    for (y, &v) in low.iter().enumerate() {
      buf[y * stride + x] = v;
    }
    for (y, &v) in high.iter().enumerate() {
      buf[(sh + y) * stride + x] = v;
    }
  }
  // Horizontal.
  let mut line = vec![0i32; rw];
  let mut lo = vec![0i32; sw];
  let mut hi = vec![0i32; rw - sw];
  for y in 0..rh {
    line.copy_from_slice(&buf[y * stride..y * stride + rw]);
    fwd_line(kind, &line, &mut lo, &mut hi, cur.x0, cur.x1);
    buf[y * stride..y * stride + sw].copy_from_slice(&lo);
    buf[y * stride + sw..y * stride + rw].copy_from_slice(&hi);
  }
}

/// Windowed inverse over a sparse coefficient canvas. `window` is the
/// wanted region in coordinates relative to the top-left of the highest
/// kept resolution; absent sparse blocks read as zero. After the call
/// the window region of the sparse canvas holds reconstructed samples.
pub(crate) fn decode_partial(
  kind: DwtKind,
  sa: &mut SparseArray,
  res_rects: &[Rect],
  max_res: usize,
  window: &Rect,
) {
  for r in 1..=max_res {
    let prev = res_rects[r - 1];
    let cur = res_rects[r];
    let rw = cur.width();
    let rh = cur.height();
    let sw = prev.width();
    let sh = prev.height();
    if rw == 0 || rh == 0 {
      continue;
    }
    // Window needed at this resolution: the caller's window shifted
    // down and grown by the filter support at every remaining level.
    let shift = (max_res - r) as u32;
    // Twice the filter support plus slack for the floor/ceil halving.
    let margin = kind.margin() * 2 + 2;
    let full = Rect::new(0, 0, rw, rh);
    let win = Rect::new(
      window.x0 >> shift,
      window.y0 >> shift,
      crate::math::ceildiv_pow2(window.x1, shift),
      crate::math::ceildiv_pow2(window.y1, shift),
    )
    .grow_within(margin, margin, &full);

    // Rows whose horizontal inverse is needed: the vertical pass for
    // output rows [win.y0, win.y1) pulls low rows and high rows around
    // them.
    let m = kind.margin();
    let low_rows = Rect::new(
      0,
      (win.y0 / 2).saturating_sub(m),
      0,
      (crate::math::ceildiv(win.y1, 2) + m).min(sh),
    );
    let high_rows = Rect::new(
      0,
      (win.y0 / 2).saturating_sub(m),
      0,
      (crate::math::ceildiv(win.y1, 2) + m).min(rh - sh),
    );

    let mut out = vec![0i32; rw as usize];
    let mut row = vec![0i32; rw as usize];
    let mut do_row = |sa: &mut SparseArray, y: u32| {
      sa.read(0, y, rw, y + 1, &mut row, 1, rw);
      inv_line(kind, &row[..sw as usize], &row[sw as usize..], &mut out, cur.x0, cur.x1);
      sa.write(0, y, rw, y + 1, &out, 1, rw);
    };
    for y in low_rows.y0..low_rows.y1 {
      do_row(sa, y);
    }
    for y in high_rows.y0..high_rows.y1 {
      do_row(sa, sh + y);
    }

    // Vertical pass per column over the window's horizontal extent.
    let mut lowv = vec![0i32; sh as usize];
    let mut highv = vec![0i32; (rh - sh) as usize];
    let mut colv = vec![0i32; rh as usize];
    for x in win.x0..win.x1 {
      sa.read(x, 0, x + 1, sh, &mut lowv, 1, 1);
      sa.read(x, sh, x + 1, rh, &mut highv, 1, 1);
      inv_line(kind, &lowv, &highv, &mut colv, cur.y0, cur.y1);
      sa.write(x, 0, x + 1, rh, &colv, 1, 1);
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

  fn res_chain(tile: Rect, levels: u32) -> Vec<Rect> {
    (0..=levels)
      .rev()
      .map(|l| tile.scale_down_ceil_pow2(l))
      .collect()
  }

  fn fill_random(buf: &mut [i32], seed: u32, amp: i32) {
    let mut s = seed;
    for v in buf.iter_mut() {
      *v = (xorshift(&mut s) % (2 * amp as u32 + 1)) as i32 - amp;
    }
  }

  #[test]
  fn reversible_roundtrip_even_tile() {
    let tile = Rect::new(0, 0, 32, 32);
    let rects = res_chain(tile, 3);
    let mut buf = vec![0i32; 32 * 32];
    fill_random(&mut buf, 0x51, 255);
    let orig = buf.clone();
    encode_tile(DwtKind::Reversible53, &mut buf, 32, &rects, 3);
    decode_tile(DwtKind::Reversible53, &mut buf, 32, &rects, 3);
    assert_eq!(buf, orig);
  }

  #[test]
  fn reversible_roundtrip_odd_geometry() {
    // A tile whose origin is odd in both axes and whose dimensions are
    // not multiples of two at any level.
    let tile = Rect::new(3, 5, 3 + 21, 5 + 13);
    let rects = res_chain(tile, 2);
    let w = tile.width() as usize;
    let h = tile.height() as usize;
    let mut buf = vec![0i32; w * h];
    fill_random(&mut buf, 0x99, 127);
    let orig = buf.clone();
    encode_tile(DwtKind::Reversible53, &mut buf, w, &rects, 2);
    decode_tile(DwtKind::Reversible53, &mut buf, w, &rects, 2);
    assert_eq!(buf, orig);
  }

  #[test]
  fn reversible_single_row_and_column() {
    for (w, h) in [(1u32, 16u32), (16, 1), (1, 1)] {
      let tile = Rect::new(1, 1, 1 + w, 1 + h);
      let rects = res_chain(tile, 1);
      let mut buf = vec![0i32; (w * h) as usize];
      fill_random(&mut buf, w * 31 + h, 63);
      let orig = buf.clone();
      encode_tile(DwtKind::Reversible53, &mut buf, w as usize, &rects, 1);
      decode_tile(DwtKind::Reversible53, &mut buf, w as usize, &rects, 1);
      assert_eq!(buf, orig, "{}x{}", w, h);
    }
  }

  #[test]
  fn irreversible_roundtrip_is_close() {
    let tile = Rect::new(0, 0, 64, 64);
    let rects = res_chain(tile, 4);
    let mut buf = vec![0i32; 64 * 64];
    fill_random(&mut buf, 0x42, 1000);
    let orig = buf.clone();
    encode_tile(DwtKind::Irreversible97, &mut buf, 64, &rects, 4);
    decode_tile(DwtKind::Irreversible97, &mut buf, 64, &rects, 4);
    for (a, b) in buf.iter().zip(orig.iter()) {
      assert!((a - b).abs() <= 4, "{} vs {}", a, b);
    }
  }

  #[test]
  fn windowed_inverse_matches_full_decode() {
    let tile = Rect::new(0, 0, 64, 64);
    let levels = 3;
    let rects = res_chain(tile, levels);
    let mut buf = vec![0i32; 64 * 64];
    fill_random(&mut buf, 0x7777, 255);
    encode_tile(DwtKind::Reversible53, &mut buf, 64, &rects, levels as usize);

    // Full decode for reference.
    let mut full = buf.clone();
    decode_tile(DwtKind::Reversible53, &mut full, 64, &rects, levels as usize);

    // Sparse decode of a window.
    let mut sa = SparseArray::new(64, 64, 16, 16).unwrap();
    sa.write(0, 0, 64, 64, &buf, 1, 64);
    let window = Rect::new(20, 12, 44, 40);
    decode_partial(
      DwtKind::Reversible53,
      &mut sa,
      &rects,
      levels as usize,
      &window,
    );
    let ww = window.width();
    let wh = window.height();
    let mut got = vec![0i32; (ww * wh) as usize];
    sa.read(window.x0, window.y0, window.x1, window.y1, &mut got, 1, ww);
    for y in 0..wh {
      for x in 0..ww {
        let want = full[((window.y0 + y) * 64 + window.x0 + x) as usize];
        assert_eq!(
          got[(y * ww + x) as usize],
          want,
          "window sample ({}, {})",
          x,
          y
        );
      }
    }
  }
}
