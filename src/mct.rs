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

//! Multiple-component transform: reversible (RCT) and irreversible
//! (ICT) forms over the first three components, plus the per-component
//! norms the rate allocator weighs distortion with.

/// Reversible forward transform, in place over three equally sized
/// planes.
pub(crate) fn encode_rct(r: &mut [i32], g: &mut [i32], b: &mut [i32]) {
  for i in 0..r.len() {
    let (pr, pg, pb) = (r[i], g[i], b[i]);
    let y = (pr + 2 * pg + pb) >> 2;
    let u = pb - pg;
    let v = pr - pg;
    r[i] = y;
    g[i] = u;
    b[i] = v;
  }
}

/// Reversible inverse transform.
pub(crate) fn decode_rct(y: &mut [i32], u: &mut [i32], v: &mut [i32]) {
  for i in 0..y.len() {
    let (py, pu, pv) = (y[i], u[i], v[i]);
    let g = py - ((pu + pv) >> 2);
    let r = pv + g;
    let b = pu + g;
    y[i] = r;
    u[i] = g;
    v[i] = b;
  }
}

/// Irreversible forward transform.
pub(crate) fn encode_ict(r: &mut [i32], g: &mut [i32], b: &mut [i32]) {
  for i in 0..r.len() {
    let (pr, pg, pb) = (r[i] as f64, g[i] as f64, b[i] as f64);
    let y = 0.299 * pr + 0.587 * pg + 0.114 * pb;
    let u = -0.16875 * pr - 0.331260 * pg + 0.5 * pb;
    let v = 0.5 * pr - 0.41869 * pg - 0.08131 * pb;
    r[i] = y.round() as i32;
    g[i] = u.round() as i32;
    b[i] = v.round() as i32;
  }
}

/// Irreversible inverse transform.
pub(crate) fn decode_ict(y: &mut [i32], u: &mut [i32], v: &mut [i32]) {
  for i in 0..y.len() {
    let (py, pu, pv) = (y[i] as f64, u[i] as f64, v[i] as f64);
    let r = py + 1.402 * pv;
    let g = py - 0.344136 * pu - 0.714136 * pv;
    let b = py + 1.772 * pu;
    y[i] = r.round() as i32;
    u[i] = g.round() as i32;
    v[i] = b.round() as i32;
  }
}

/// L2 norms of the reversible transform rows, indexed by component.
pub(crate) const MCT_NORMS_RCT: [f64; 3] = [1.732, 0.8292, 0.8292];
/// L2 norms of the irreversible transform rows.
pub(crate) const MCT_NORMS_ICT: [f64; 3] = [1.732, 1.805, 1.573];

pub(crate) fn norm(reversible: bool, compno: usize) -> f64 {
  let t = if reversible {
    &MCT_NORMS_RCT
  } else {
    &MCT_NORMS_ICT
  };
  t.get(compno).copied().unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rct_is_exactly_reversible() {
    let mut r: Vec<i32> = vec![0, 255, 17, -120, 90, 255, 1, 64];
    let mut g: Vec<i32> = vec![255, 0, 33, 77, -90, 255, 2, 64];
    let mut b: Vec<i32> = vec![128, 128, 51, -1, 0, 255, 3, 64];
    let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
    encode_rct(&mut r, &mut g, &mut b);
    decode_rct(&mut r, &mut g, &mut b);
    assert_eq!(r, r0);
    assert_eq!(g, g0);
    assert_eq!(b, b0);
  }

  #[test]
  fn ict_roundtrip_is_close() {
    let mut r: Vec<i32> = (0..64).map(|v| v * 4 - 128).collect();
    let mut g: Vec<i32> = (0..64).map(|v| 127 - v * 3).collect();
    let mut b: Vec<i32> = (0..64).map(|v| (v * 7) % 255 - 127).collect();
    let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
    encode_ict(&mut r, &mut g, &mut b);
    decode_ict(&mut r, &mut g, &mut b);
    for i in 0..64 {
      assert!((r[i] - r0[i]).abs() <= 1);
      assert!((g[i] - g0[i]).abs() <= 1);
      assert!((b[i] - b0[i]).abs() <= 1);
    }
  }
}
