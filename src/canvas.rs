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

//! Canvas-coordinate data model: tile component resolutions, sub-bands,
//! precincts and code blocks, with lazy instantiation of precincts and
//! blocks and the per-block decompression cache.
//!
//! Precincts are stored in a flat vector per sub-band with a side map
//! from global precinct index to vector slot; a precinct carries plain
//! numbers, never a pointer back into the tree.

use crate::consts::{BandOrientation, CblkSty, MAX_PASSES_PER_SEGMENT};
use crate::math::{ceildiv_pow2, floordiv_pow2, Point, Rect};
use crate::t1::{DecodeResume, EncOut, SegView};
use crate::tgt::TagTree;

use smallvec::SmallVec;
use std::collections::HashMap;

/// Non-owning descriptor of compressed bytes inside a tile-part body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkRef {
  pub part: u16,
  pub offset: u32,
  pub len: u32,
}

/// The run of coding passes between two termination boundaries. A
/// segment can span several packets (layers), and one packet can carry
/// several segments.
#[derive(Debug, Default, Clone)]
pub(crate) struct Segment {
  /// Passes accumulated over all layers parsed so far.
  pub total_passes: u32,
  /// Pass budget fixed by the mode switches at creation time.
  pub max_passes: u32,
  /// Total bytes accumulated over all layers.
  pub total_bytes: u64,
  /// Passes contributed per layer, from header parsing.
  pub passes_in_layer: Vec<u8>,
  /// Bytes signalled per layer, from header parsing.
  pub bytes_in_layer: Vec<u32>,
  /// Byte-chunk descriptors into packet bodies, one per contributing
  /// layer, in stream order.
  pub chunks: SmallVec<[ChunkRef; 2]>,
  /// Passes whose data chunks have actually arrived.
  pub data_passes: u32,
}

impl Segment {
  pub fn new(num_layers: u16, cblk_sty: CblkSty, segno: usize) -> Self {
    Segment {
      max_passes: max_passes_per_segment(cblk_sty, segno),
      passes_in_layer: vec![0; num_layers as usize],
      bytes_in_layer: vec![0; num_layers as usize],
      ..Default::default()
    }
  }

  pub fn complete(&self) -> bool {
    self.total_passes >= self.max_passes
  }
}

/// Pass budget per segment: 1 under TERMALL; the 10 / 2 / 1 pattern
/// under LAZY (everything down to the bypass switch, then raw
/// significance+refinement pairs alternating with MQ cleanups);
/// otherwise effectively unbounded.
pub(crate) fn max_passes_per_segment(cblk_sty: CblkSty, segno: usize) -> u32 {
  if cblk_sty.contains(CblkSty::TERMALL) {
    1
  } else if cblk_sty.contains(CblkSty::LAZY) {
    if segno == 0 {
      10
    } else if segno % 2 == 1 {
      2
    } else {
      1
    }
  } else {
    MAX_PASSES_PER_SEGMENT as u32
  }
}

/// Decoder-side code block: geometry, signalling state, segment list and
/// the cursors of the two consumers (header parser and T1).
#[derive(Debug, Default, Clone)]
pub(crate) struct CodeblockDec {
  pub rect: Rect,
  /// Bit planes above the sign, from the missing-MSB tag tree.
  pub numbps: u8,
  /// Length-increment state for T2; monotonically non-decreasing as
  /// layers are consumed.
  pub num_len_bits: u32,
  /// First layer in which the block appeared, once seen.
  pub included_in_layer: Option<u16>,
  pub segs: Vec<Segment>,
  /// Passes signalled per layer (sum over segments), for data parsing.
  pub passes_by_layer: Vec<u8>,
  /// Saved T1 state for differential re-decompression.
  pub resume: Option<DecodeResume>,
  /// Block was dropped after corruption; contributes zeroes.
  pub corrupt: bool,
}

impl CodeblockDec {
  pub fn new(rect: Rect, num_layers: u16) -> Self {
    CodeblockDec {
      rect,
      passes_by_layer: vec![0; num_layers as usize],
      ..Default::default()
    }
  }

  /// Segment for `index`, appending one if the index is one past the
  /// end (segments are only ever created in order).
  pub fn segment_mut(&mut self, index: usize, cblk_sty: CblkSty) -> &mut Segment {
    if index == self.segs.len() {
      let num_layers = self.passes_by_layer.len() as u16;
      self.segs.push(Segment::new(num_layers, cblk_sty, index));
    }
    &mut self.segs[index]
  }

  /// Index of the segment currently accepting header-parsed passes.
  pub fn open_segment(&self) -> Option<usize> {
    match self.segs.last() {
      Some(seg) if !seg.complete() => Some(self.segs.len() - 1),
      _ => None,
    }
  }

  /// Total passes whose data has arrived.
  pub fn ready_passes(&self) -> u32 {
    self.segs.iter().map(|s| s.data_passes).sum()
  }

  /// Drops every data chunk; the block will contribute zeroes.
  pub fn release(&mut self) {
    for seg in &mut self.segs {
      seg.chunks.clear();
      seg.data_passes = 0;
    }
    self.corrupt = true;
    self.resume = None;
  }

  /// Resolves chunk descriptors against the tile-part bodies into the
  /// per-segment views T1 consumes.
  pub fn seg_views<'a>(&self, parts: &'a [Vec<u8>]) -> Vec<SegView<'a>> {
    self
      .segs
      .iter()
      .map(|seg| {
        let mut chunks: SmallVec<[&'a [u8]; 4]> = SmallVec::new();
        for c in &seg.chunks {
          let body = &parts[c.part as usize];
          let end = (c.offset + c.len) as usize;
          if c.len > 0 && end <= body.len() {
            chunks.push(&body[c.offset as usize..end]);
          }
        }
        SegView {
          chunks,
          passes: seg.data_passes,
          complete: seg.complete(),
        }
      })
      .collect()
  }
}

/// One quality-layer slice of an encoded block.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BlockLayer {
  pub num_passes: u32,
  pub len: u32,
  pub disto: f64,
  /// Byte offset of this layer's data within the block's buffer.
  pub offset: u32,
}

/// Encoder-side code block: geometry plus the T1 output and the layer
/// split chosen by the rate allocator.
#[derive(Debug, Default, Clone)]
pub(crate) struct CodeblockEnc {
  pub rect: Rect,
  pub enc: Option<EncOut>,
  pub layers: Vec<BlockLayer>,
  pub num_len_bits: u32,
  pub included_in_layer: Option<u16>,
  /// Passes already committed to emitted layers.
  pub passes_emitted: u32,
}

/// Precinct: a canvas rectangle within its sub-band, a grid of code
/// blocks aligned to the code-block partition, and the two tag trees.
#[derive(Debug, Default)]
pub(crate) struct Precinct {
  pub rect: Rect,
  /// Code-block grid bounds in absolute grid indices.
  pub cblk_grid: Rect,
  pub cblk_expn: Point,
  pub incl_tree: Option<TagTree>,
  pub imsb_tree: Option<TagTree>,
  dec_blocks: HashMap<u32, Box<CodeblockDec>>,
  enc_blocks: HashMap<u32, Box<CodeblockEnc>>,
  num_layers: u16,
}

impl Precinct {
  pub fn new(rect: Rect, cblk_expn: Point, num_layers: u16) -> Self {
    let cblk_grid = if rect.is_empty() {
      Rect::default()
    } else {
      Rect::new(
        floordiv_pow2(rect.x0, cblk_expn.x),
        floordiv_pow2(rect.y0, cblk_expn.y),
        ceildiv_pow2(rect.x1, cblk_expn.x),
        ceildiv_pow2(rect.y1, cblk_expn.y),
      )
    };
    let mut p = Precinct {
      rect,
      cblk_grid,
      cblk_expn,
      num_layers,
      ..Default::default()
    };
    // Tag trees exist only when the precinct holds code blocks.
    if !p.cblk_grid.is_empty() {
      p.incl_tree = Some(TagTree::new(p.cblk_grid.width(), p.cblk_grid.height()));
      p.imsb_tree = Some(TagTree::new(p.cblk_grid.width(), p.cblk_grid.height()));
    }
    p
  }

  pub fn num_cblks(&self) -> u32 {
    self.cblk_grid.width() * self.cblk_grid.height()
  }

  /// Bounds of code block `cblkno` (raster order in the grid), clipped
  /// to the precinct.
  pub fn cblk_rect(&self, cblkno: u32) -> Rect {
    let gw = self.cblk_grid.width();
    let gx = self.cblk_grid.x0 + cblkno % gw;
    let gy = self.cblk_grid.y0 + cblkno / gw;
    let nominal = Rect::new(
      gx << self.cblk_expn.x,
      gy << self.cblk_expn.y,
      (gx + 1) << self.cblk_expn.x,
      (gy + 1) << self.cblk_expn.y,
    );
    nominal.intersection(&self.rect)
  }

  pub fn dec_block(&mut self, cblkno: u32) -> &mut CodeblockDec {
    let rect = self.cblk_rect(cblkno);
    let layers = self.num_layers;
    self
      .dec_blocks
      .entry(cblkno)
      .or_insert_with(|| Box::new(CodeblockDec::new(rect, layers)))
  }

  pub fn dec_block_ref(&self, cblkno: u32) -> Option<&CodeblockDec> {
    self.dec_blocks.get(&cblkno).map(|b| &**b)
  }

  pub fn dec_blocks_iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut Box<CodeblockDec>)> + '_ {
    self.dec_blocks.iter_mut()
  }

  pub fn enc_block(&mut self, cblkno: u32) -> &mut CodeblockEnc {
    let rect = self.cblk_rect(cblkno);
    self.enc_blocks.entry(cblkno).or_insert_with(|| {
      Box::new(CodeblockEnc {
        rect,
        ..Default::default()
      })
    })
  }

  pub fn enc_block_ref(&self, cblkno: u32) -> Option<&CodeblockEnc> {
    self.enc_blocks.get(&cblkno).map(|b| &**b)
  }

  pub fn enc_blocks_iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut Box<CodeblockEnc>)> + '_ {
    self.enc_blocks.iter_mut()
  }
}

/// Quantisation parameters attached to one sub-band.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BandQuant {
  /// Actual quantisation step (1.0 for reversible paths).
  pub stepsize: f32,
  /// Exponent/mantissa pair as signalled.
  pub expn: u8,
  pub mant: u16,
  /// Maximum magnitude bit planes for blocks of this band.
  pub num_bps: u8,
}

/// Sub-band: rectangle, orientation, quantisation, and lazily
/// materialised precincts addressed through a side map.
#[derive(Debug, Default)]
pub(crate) struct Subband {
  pub rect: Rect,
  pub orientation: BandOrientation,
  pub quant: BandQuant,
  pub precincts: Vec<Precinct>,
  pub precinct_map: HashMap<u64, usize>,
}

impl Subband {
  pub fn is_empty(&self) -> bool {
    self.rect.is_empty()
  }

  pub fn precinct_by_index(&self, precno: u64) -> Option<&Precinct> {
    self.precinct_map.get(&precno).map(|&slot| &self.precincts[slot])
  }

  /// Gets or creates the precinct with global index `precno`. The
  /// caller supplies the band-precinct geometry of the parent
  /// resolution, since the band itself stores no back-pointer.
  pub fn precinct_mut(
    &mut self,
    precno: u64,
    band_precinct_expn: Point,
    precinct_grid_w: u32,
    cblk_expn: Point,
    num_layers: u16,
  ) -> &mut Precinct {
    if let Some(&slot) = self.precinct_map.get(&precno) {
      return &mut self.precincts[slot];
    }
    let rect = band_precinct_bounds(&self.rect, precno, band_precinct_expn, precinct_grid_w);
    let slot = self.precincts.len();
    self
      .precincts
      .push(Precinct::new(rect, cblk_expn, num_layers));
    self.precinct_map.insert(precno, slot);
    &mut self.precincts[slot]
  }
}

/// Canvas bounds of band precinct `precno`, clipped to the band. The
/// precinct partition is anchored at the canvas origin.
pub(crate) fn band_precinct_bounds(
  band: &Rect,
  precno: u64,
  expn: Point,
  grid_w: u32,
) -> Rect {
  if band.is_empty() {
    return Rect::default();
  }
  let grid_x0 = floordiv_pow2(band.x0, expn.x);
  let grid_y0 = floordiv_pow2(band.y0, expn.y);
  let px = grid_x0 + (precno % grid_w as u64) as u32;
  let py = grid_y0 + (precno / grid_w as u64) as u32;
  let nominal = Rect::new(
    px << expn.x,
    py << expn.y,
    (px + 1) << expn.x,
    (py + 1) << expn.y,
  );
  nominal.intersection(band)
}

/// Resolution level: its reduced rectangle, one (LL) or three
/// (HL/LH/HH) sub-bands, and the precinct grid parameters.
#[derive(Debug, Default)]
pub(crate) struct Resolution {
  pub rect: Rect,
  pub bands: SmallVec<[Subband; 3]>,
  /// log2 precinct dimensions in resolution coordinates.
  pub precinct_expn: Point,
  /// log2 precinct dimensions in band coordinates.
  pub band_precinct_expn: Point,
  /// Precinct grid size (columns, rows).
  pub precinct_grid: Point,
  /// log2 code-block dimensions effective in this resolution.
  pub cblk_expn: Point,
}

impl Resolution {
  pub fn num_precincts(&self) -> u64 {
    self.precinct_grid.x as u64 * self.precinct_grid.y as u64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn precinct_lazily_materialises_blocks() {
    let rect = Rect::new(0, 0, 100, 70);
    let mut p = Precinct::new(rect, Point::new(5, 5), 1);
    assert_eq!(p.cblk_grid, Rect::new(0, 0, 4, 3));
    assert_eq!(p.num_cblks(), 12);
    assert!(p.dec_block_ref(5).is_none());
    // Block 3 sits at grid (3, 0): clipped to 96..100 horizontally.
    let b = p.dec_block(3);
    assert_eq!(b.rect, Rect::new(96, 0, 100, 32));
    assert!(p.dec_block_ref(3).is_some());
  }

  #[test]
  fn empty_precinct_has_no_tag_trees() {
    let p = Precinct::new(Rect::default(), Point::new(6, 6), 1);
    assert!(p.incl_tree.is_none());
    assert!(p.imsb_tree.is_none());
    assert_eq!(p.num_cblks(), 0);
  }

  #[test]
  fn band_precinct_grid_is_origin_anchored() {
    // Band not aligned to the precinct partition: first precinct is
    // clipped on the left/top.
    let band = Rect::new(48, 16, 130, 90);
    let expn = Point::new(6, 6);
    let r0 = band_precinct_bounds(&band, 0, expn, 3);
    assert_eq!(r0, Rect::new(48, 16, 64, 64));
    let r1 = band_precinct_bounds(&band, 1, expn, 3);
    assert_eq!(r1, Rect::new(64, 16, 128, 64));
    let r2 = band_precinct_bounds(&band, 2, expn, 3);
    assert_eq!(r2, Rect::new(128, 16, 130, 64));
    let r3 = band_precinct_bounds(&band, 3, expn, 3);
    assert_eq!(r3, Rect::new(48, 64, 64, 90));
  }

  #[test]
  fn segment_budgets_follow_mode_switches() {
    assert_eq!(max_passes_per_segment(CblkSty::TERMALL, 0), 1);
    assert_eq!(max_passes_per_segment(CblkSty::LAZY, 0), 10);
    assert_eq!(max_passes_per_segment(CblkSty::LAZY, 1), 2);
    assert_eq!(max_passes_per_segment(CblkSty::LAZY, 2), 1);
    assert_eq!(max_passes_per_segment(CblkSty::LAZY, 3), 2);
    assert_eq!(
      max_passes_per_segment(CblkSty::empty(), 0),
      MAX_PASSES_PER_SEGMENT as u32
    );
  }

  #[test]
  fn release_drops_chunks_and_marks_corrupt() {
    let mut blk = CodeblockDec::new(Rect::new(0, 0, 8, 8), 2);
    let seg = blk.segment_mut(0, CblkSty::empty());
    seg.chunks.push(ChunkRef {
      part: 0,
      offset: 0,
      len: 10,
    });
    seg.data_passes = 3;
    blk.release();
    assert!(blk.corrupt);
    assert_eq!(blk.ready_passes(), 0);
    assert!(blk.segs[0].chunks.is_empty());
  }
}
