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

//! Canvas geometry and integer helpers.
//!
//! Every rectangle in the code stream lives in canvas coordinates:
//! `x0 <= x1`, `y0 <= y1`, inclusive-exclusive on the high end.
//! Intermediate arithmetic is widened to 64 bits and saturated back to
//! 32 bits only at store time, so overflow is never silent.

/// Ceiling of `a / b`. `b` must be non-zero.
#[inline]
pub fn ceildiv(a: u32, b: u32) -> u32 {
  (a as u64 + b as u64 - 1).wrapping_div(b as u64) as u32
}

/// Ceiling of `a / 2^b`.
#[inline]
pub fn ceildiv_pow2(a: u32, b: u32) -> u32 {
  ((a as u64 + (1u64 << b) - 1) >> b) as u32
}

/// Floor of `a / 2^b`.
#[inline]
pub fn floordiv_pow2(a: u32, b: u32) -> u32 {
  a >> b
}

/// Position of the highest set bit, i.e. `floor(log2(a))` for `a > 0`.
#[inline]
pub fn floorlog2(a: u32) -> u32 {
  debug_assert!(a > 0);
  31 - a.leading_zeros()
}

/// Clips a 64-bit intermediate back into `u32`.
#[inline]
pub fn clip_u32(v: i64) -> u32 {
  if v < 0 {
    0
  } else if v > u32::MAX as i64 {
    u32::MAX
  } else {
    v as u32
  }
}

/// Saturating `lhs + rhs` with a widened intermediate.
#[inline]
pub fn sat_add(lhs: u32, rhs: i64) -> u32 {
  clip_u32(lhs as i64 + rhs)
}

/// Saturating `lhs - rhs` with a widened intermediate.
#[inline]
pub fn sat_sub(lhs: u32, rhs: u32) -> u32 {
  clip_u32(lhs as i64 - rhs as i64)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Point {
  pub x: u32,
  pub y: u32,
}

impl Point {
  pub fn new(x: u32, y: u32) -> Self {
    Self { x, y }
  }
}

/// Axis-aligned rectangle in canvas coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
}

impl Rect {
  pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
    Self { x0, y0, x1, y1 }
  }

  #[inline]
  pub fn width(&self) -> u32 {
    self.x1.saturating_sub(self.x0)
  }

  #[inline]
  pub fn height(&self) -> u32 {
    self.y1.saturating_sub(self.y0)
  }

  #[inline]
  pub fn area(&self) -> u64 {
    self.width() as u64 * self.height() as u64
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.x0 >= self.x1 || self.y0 >= self.y1
  }

  #[inline]
  pub fn valid(&self) -> bool {
    self.x0 <= self.x1 && self.y0 <= self.y1
  }

  pub fn contains_point(&self, x: u32, y: u32) -> bool {
    x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
  }

  pub fn contains(&self, rhs: &Rect) -> bool {
    self.intersection(rhs) == *rhs
  }

  pub fn intersection(&self, rhs: &Rect) -> Rect {
    Rect::new(
      self.x0.max(rhs.x0),
      self.y0.max(rhs.y0),
      self.x1.min(rhs.x1),
      self.y1.min(rhs.y1),
    )
  }

  pub fn intersects(&self, rhs: &Rect) -> bool {
    self.x0.max(rhs.x0) < self.x1.min(rhs.x1) && self.y0.max(rhs.y0) < self.y1.min(rhs.y1)
  }

  pub fn union(&self, rhs: &Rect) -> Rect {
    Rect::new(
      self.x0.min(rhs.x0),
      self.y0.min(rhs.y0),
      self.x1.max(rhs.x1),
      self.y1.max(rhs.y1),
    )
  }

  /// Component sub-sampling: each edge divided by `(dx, dy)`, rounding up.
  pub fn scale_down_ceil(&self, dx: u32, dy: u32) -> Rect {
    Rect::new(
      ceildiv(self.x0, dx),
      ceildiv(self.y0, dy),
      ceildiv(self.x1, dx),
      ceildiv(self.y1, dy),
    )
  }

  /// Reduced coordinates: both ends shifted right by `pow` with a
  /// ceiling on the high end.
  pub fn scale_down_ceil_pow2(&self, pow: u32) -> Rect {
    Rect::new(
      ceildiv_pow2(self.x0, pow),
      ceildiv_pow2(self.y0, pow),
      ceildiv_pow2(self.x1, pow),
      ceildiv_pow2(self.y1, pow),
    )
  }

  pub fn pan(&self, dx: i64, dy: i64) -> Rect {
    Rect::new(
      sat_add(self.x0, dx),
      sat_add(self.y0, dy),
      sat_add(self.x1, dx),
      sat_add(self.y1, dy),
    )
  }

  /// Grows by `(bx, by)` on every side, clipped to `bounds`.
  pub fn grow_within(&self, bx: u32, by: u32, bounds: &Rect) -> Rect {
    Rect::new(
      sat_sub(self.x0, bx).max(bounds.x0),
      sat_sub(self.y0, by).max(bounds.y0),
      sat_add(self.x1, bx as i64).min(bounds.x1),
      sat_add(self.y1, by as i64).min(bounds.y1),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ceildiv_rounds_up() {
    assert_eq!(ceildiv(0, 3), 0);
    assert_eq!(ceildiv(1, 3), 1);
    assert_eq!(ceildiv(3, 3), 1);
    assert_eq!(ceildiv(4, 3), 2);
    // Near the top of the range the widened intermediate must not wrap.
    assert_eq!(ceildiv(u32::MAX, 2), 0x8000_0000);
  }

  #[test]
  fn ceildiv_pow2_matches_div() {
    for a in [0u32, 1, 2, 63, 64, 65, 4095, u32::MAX] {
      for p in 0..16 {
        assert_eq!(ceildiv_pow2(a, p), ceildiv(a, 1 << p), "a={} p={}", a, p);
      }
    }
  }

  #[test]
  fn floorlog2_basics() {
    assert_eq!(floorlog2(1), 0);
    assert_eq!(floorlog2(2), 1);
    assert_eq!(floorlog2(3), 1);
    assert_eq!(floorlog2(4096), 12);
  }

  #[test]
  fn rect_intersection_and_union() {
    let a = Rect::new(0, 0, 10, 10);
    let b = Rect::new(5, 5, 20, 20);
    assert_eq!(a.intersection(&b), Rect::new(5, 5, 10, 10));
    assert_eq!(a.union(&b), Rect::new(0, 0, 20, 20));
    assert!(a.intersects(&b));
    let c = Rect::new(10, 10, 11, 11);
    assert!(!a.intersects(&c));
    assert!(a.intersection(&c).is_empty());
  }

  #[test]
  fn rect_reduction() {
    let r = Rect::new(1, 1, 7, 5);
    assert_eq!(r.scale_down_ceil_pow2(1), Rect::new(1, 1, 4, 3));
    assert_eq!(r.scale_down_ceil(2, 4), Rect::new(1, 1, 4, 2));
  }

  #[test]
  fn saturation_is_not_silent_wrap() {
    assert_eq!(sat_sub(1, 5), 0);
    assert_eq!(sat_add(u32::MAX - 1, 10), u32::MAX);
    let r = Rect::new(0, 0, 4, 4);
    assert_eq!(r.pan(-10, -10), Rect::new(0, 0, 0, 0));
  }
}
