/*
 * The copyright in this software is being made available under the 2-clauses
 * BSD License, included below. This software may be subject to other third
 * party and contributor rights, including patent rights, and no such rights
 * are granted under this license.
 *
 * Copyright (c) 2005, Herve Drolon, FreeImage Team
 * All rights reserved.
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

//! Image model: planar signed 32-bit components with sub-sampling and
//! canvas placement, plus the per-tile composite that merges decoded
//! tiles into the caller's buffer honouring the decode region.

use crate::consts::SamplePacking;
use crate::math::Rect;

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
  Colour,
  Opacity,
  PremultOpacity,
  Unspecified,
}

impl Default for ComponentType {
  fn default() -> Self {
    ComponentType::Unspecified
  }
}

/// One planar component.
#[derive(Debug, Default, Clone)]
pub struct ImageComp {
  /// Sub-sampling factors with respect to the reference grid.
  pub dx: u32,
  pub dy: u32,
  /// Decoded rectangle in reduced component coordinates.
  pub rect: Rect,
  /// Bit depth in `[1, 16]` and signedness.
  pub precision: u8,
  pub signed: bool,
  pub comp_type: ComponentType,
  /// Which colour channel an opacity component is associated with.
  pub association: u16,
  pub data: Vec<i32>,
}

impl ImageComp {
  pub fn width(&self) -> u32 {
    self.rect.width()
  }

  pub fn height(&self) -> u32 {
    self.rect.height()
  }
}

/// Decoded (or to-be-encoded) image: canvas bounds plus components.
#[derive(Debug, Default, Clone)]
pub struct Image {
  /// Reference-grid bounds.
  pub bounds: Rect,
  pub comps: Vec<ImageComp>,
  /// Packing a format adapter should use when materialising samples.
  pub packing: Option<SamplePacking>,
}

impl Image {
  /// Canvas rectangle of component `compno` before reduction.
  pub fn comp_canvas_rect(&self, compno: usize) -> Rect {
    let c = &self.comps[compno];
    self.bounds.scale_down_ceil(c.dx, c.dy)
  }

  /// Clips a decode region to the image bounds, warning when the caller
  /// asked for more than exists.
  pub fn clip_region(&self, region: &Rect) -> Rect {
    let clipped = region.intersection(&self.bounds);
    if clipped != *region {
      warn!(
        "decode region ({},{})..({},{}) extends past the image; clipped to ({},{})..({},{})",
        region.x0, region.y0, region.x1, region.y1, clipped.x0, clipped.y0, clipped.x1, clipped.y1
      );
    }
    clipped
  }

  /// Sizes every component buffer for `region` (canvas coordinates)
  /// decoded at `reduce` dropped resolutions.
  pub fn alloc_for_region(&mut self, region: &Rect, reduce: u32) {
    for compno in 0..self.comps.len() {
      let canvas = {
        let c = &self.comps[compno];
        region.scale_down_ceil(c.dx, c.dy)
      };
      let reduced = canvas.scale_down_ceil_pow2(reduce);
      let c = &mut self.comps[compno];
      c.rect = reduced;
      c.data = vec![0; reduced.area() as usize];
    }
  }

  /// Copies one decoded tile component into the image, intersecting the
  /// tile rectangle with the component's decoded rectangle. `tile_rect`
  /// and `self.comps[compno].rect` share the same reduced coordinate
  /// space.
  pub fn composite(&mut self, compno: usize, tile_rect: &Rect, tile_data: &[i32]) {
    let comp = &mut self.comps[compno];
    let dst_rect = comp.rect;
    let overlap = dst_rect.intersection(tile_rect);
    if overlap.is_empty() {
      return;
    }
    let tw = tile_rect.width() as usize;
    let dw = dst_rect.width() as usize;
    for y in overlap.y0..overlap.y1 {
      let src_base = ((y - tile_rect.y0) as usize) * tw + (overlap.x0 - tile_rect.x0) as usize;
      let dst_base = ((y - dst_rect.y0) as usize) * dw + (overlap.x0 - dst_rect.x0) as usize;
      let run = overlap.width() as usize;
      comp.data[dst_base..dst_base + run].copy_from_slice(&tile_data[src_base..src_base + run]);
    }
  }

  /// Clamps every sample into the range its precision allows. Applied
  /// after inverse DC level shift.
  pub fn clamp_to_precision(&mut self) {
    for c in &mut self.comps {
      let (lo, hi) = if c.signed {
        (
          -(1i64 << (c.precision - 1)) as i32,
          ((1i64 << (c.precision - 1)) - 1) as i32,
        )
      } else {
        (0, ((1i64 << c.precision) - 1) as i32)
      };
      for v in &mut c.data {
        *v = (*v).clamp(lo, hi);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn grey_image(w: u32, h: u32) -> Image {
    Image {
      bounds: Rect::new(0, 0, w, h),
      comps: vec![ImageComp {
        dx: 1,
        dy: 1,
        precision: 8,
        signed: false,
        comp_type: ComponentType::Colour,
        ..Default::default()
      }],
      packing: None,
    }
  }

  #[test]
  fn region_allocation_and_composite() {
    let mut img = grey_image(512, 512);
    let region = img.clip_region(&Rect::new(128, 128, 384, 384));
    img.alloc_for_region(&region, 0);
    assert_eq!(img.comps[0].rect, Rect::new(128, 128, 384, 384));

    // A 256x256 tile overlapping the top-left of the region.
    let tile_rect = Rect::new(0, 0, 256, 256);
    let tile: Vec<i32> = (0..256 * 256).map(|i| i as i32 % 251).collect();
    img.composite(0, &tile_rect, &tile);
    // Sample (200, 200) of the canvas is tile sample (200, 200).
    let c = &img.comps[0];
    let got = c.data[((200 - 128) * 256 + (200 - 128)) as usize];
    assert_eq!(got, (200 * 256 + 200) % 251);
  }

  #[test]
  fn oversized_region_is_clipped() {
    let img = grey_image(100, 80);
    let clipped = img.clip_region(&Rect::new(50, 40, 300, 300));
    assert_eq!(clipped, Rect::new(50, 40, 100, 80));
  }

  #[test]
  fn precision_clamp() {
    let mut img = grey_image(2, 1);
    img.comps[0].rect = Rect::new(0, 0, 2, 1);
    img.comps[0].data = vec![-5, 300];
    img.clamp_to_precision();
    assert_eq!(img.comps[0].data, vec![0, 255]);
  }
}
