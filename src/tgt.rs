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

//! Tag trees.
//!
//! A tag tree codes a two-dimensional array of non-decreasing integers
//! hierarchically: every interior node carries the minimum of its (up to
//! four) children, and a leaf's value is recovered by interrogating the
//! path from the root with a unary-plus-threshold code. One tree per
//! precinct codes first-inclusion layers, a second codes the number of
//! missing most-significant bit planes.

use crate::bio::{BioReader, BioWriter};
use crate::error::Result;

/// Leaf values start above any threshold a packet header can ask about.
const TGT_UNSET: i32 = 999;

#[derive(Debug, Default, Clone, Copy)]
struct TgtNode {
  parent: Option<u32>,
  value: i32,
  /// Lower watermark: coded bits so far prove `value >= low`.
  low: i32,
  known: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct TagTree {
  num_leafs_h: u32,
  num_leafs_v: u32,
  nodes: Vec<TgtNode>,
}

impl TagTree {
  /// Builds a tree over a `num_leafs_h x num_leafs_v` leaf grid. The grid
  /// must be non-empty; empty precincts do not allocate trees.
  pub fn new(num_leafs_h: u32, num_leafs_v: u32) -> Self {
    let mut tree = TagTree::default();
    tree.init(num_leafs_h, num_leafs_v);
    tree
  }

  /// Re-initialises, reusing the node storage when the geometry matches.
  pub fn init(&mut self, num_leafs_h: u32, num_leafs_v: u32) {
    debug_assert!(num_leafs_h > 0 && num_leafs_v > 0);
    if self.num_leafs_h == num_leafs_h && self.num_leafs_v == num_leafs_v && !self.nodes.is_empty()
    {
      self.reset();
      return;
    }
    self.num_leafs_h = num_leafs_h;
    self.num_leafs_v = num_leafs_v;

    // Node count: each level halves the grid (rounding up) until a single
    // node remains.
    let mut nplh = [0i64; 32];
    let mut nplv = [0i64; 32];
    nplh[0] = num_leafs_h as i64;
    nplv[0] = num_leafs_v as i64;
    let mut num_nodes = 0usize;
    let mut num_levels = 0usize;
    loop {
      let n = nplh[num_levels] * nplv[num_levels];
      nplh[num_levels + 1] = (nplh[num_levels] + 1) / 2;
      nplv[num_levels + 1] = (nplv[num_levels] + 1) / 2;
      num_nodes += n as usize;
      num_levels += 1;
      if n <= 1 {
        break;
      }
    }
    self.nodes = vec![TgtNode::default(); num_nodes];

    // Parent wiring walks each level in raster order: node (i, j) of
    // level l has parent (i / 2, j / 2) of level l + 1.
    let mut level_base = 0usize;
    for level in 0..num_levels.saturating_sub(1) {
      let w = nplh[level] as usize;
      let h = nplv[level] as usize;
      let parent_base = level_base + w * h;
      let pw = nplh[level + 1] as usize;
      for j in 0..h {
        for i in 0..w {
          let parent = parent_base + (j / 2) * pw + i / 2;
          self.nodes[level_base + j * w + i].parent = Some(parent as u32);
        }
      }
      level_base = parent_base;
    }
    self.reset();
  }

  pub fn reset(&mut self) {
    for node in &mut self.nodes {
      node.value = TGT_UNSET;
      node.low = 0;
      node.known = false;
    }
  }

  /// Root-to-leaf path, root first.
  fn path(&self, leafno: u32) -> Vec<u32> {
    let mut stack = Vec::with_capacity(8);
    let mut node = leafno;
    stack.push(node);
    while let Some(parent) = self.nodes[node as usize].parent {
      stack.push(parent);
      node = parent;
    }
    stack.reverse();
    stack
  }

  pub fn set_value(&mut self, leafno: u32, value: i32) {
    let mut node = Some(leafno);
    while let Some(n) = node {
      let n = &mut self.nodes[n as usize];
      if n.value <= value {
        break;
      }
      n.value = value;
      node = n.parent;
    }
  }

  pub fn encode(&mut self, bio: &mut BioWriter, leafno: u32, threshold: i32) {
    let mut low = 0i32;
    for idx in self.path(leafno) {
      let node = &mut self.nodes[idx as usize];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold {
        if low >= node.value {
          if !node.known {
            bio.write_bit(1);
            node.known = true;
          }
          break;
        }
        bio.write_bit(0);
        low += 1;
      }
      node.low = low;
    }
  }

  /// Interrogates the tree up to `threshold`; returns whether the leaf's
  /// value is below it.
  pub fn decode(&mut self, bio: &mut BioReader<'_>, leafno: u32, threshold: i32) -> Result<bool> {
    let mut low = 0i32;
    let mut value = TGT_UNSET;
    for idx in self.path(leafno) {
      let node = &mut self.nodes[idx as usize];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold && low < node.value {
        if bio.read_bit()? != 0 {
          node.value = low;
        } else {
          low += 1;
        }
      }
      node.low = low;
      value = node.value;
    }
    Ok(value < threshold)
  }

  /// Decodes a full leaf value by raising the threshold one step at a
  /// time; used for the missing-MSB count.
  pub fn decode_value(&mut self, bio: &mut BioReader<'_>, leafno: u32, cap: i32) -> Result<i32> {
    let mut k = 0i32;
    while !self.decode(bio, leafno, k + 1)? {
      k += 1;
      if k > cap {
        return Err(crate::error::Error::CorruptPacketHeader(
          "tag tree value exceeds bit-plane cap",
        ));
      }
    }
    Ok(k)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Property: encoding a vector of per-leaf thresholds and decoding it
  /// returns the same vector.
  fn roundtrip(w: u32, h: u32, values: &[i32]) {
    assert_eq!((w * h) as usize, values.len());
    let mut enc = TagTree::new(w, h);
    for (leaf, &v) in values.iter().enumerate() {
      enc.set_value(leaf as u32, v);
    }
    let max = values.iter().copied().max().unwrap() + 1;
    let mut bio = BioWriter::new();
    for leaf in 0..values.len() as u32 {
      enc.encode(&mut bio, leaf, max);
    }
    let bytes = bio.finish();

    let mut dec = TagTree::new(w, h);
    let mut r = BioReader::new(&bytes);
    for (leaf, &v) in values.iter().enumerate() {
      assert_eq!(dec.decode_value(&mut r, leaf as u32, max).unwrap(), v);
    }
  }

  #[test]
  fn single_leaf() {
    roundtrip(1, 1, &[3]);
  }

  #[test]
  fn standard_example_grid() {
    // The 6x3 example grid from the specification text of B.10.2.
    roundtrip(
      6,
      3,
      &[1, 3, 2, 3, 2, 3, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2],
    );
  }

  #[test]
  fn ragged_grid() {
    roundtrip(5, 1, &[0, 4, 1, 0, 2]);
    roundtrip(1, 7, &[2, 0, 0, 1, 3, 0, 5]);
  }

  #[test]
  fn incremental_thresholds_match_batch() {
    // Inclusion-style use: interrogate every leaf once per rising
    // threshold, mirroring one packet per layer.
    let w = 3;
    let h = 2;
    let values = [0i32, 2, 1, 0, 3, 2];
    let mut enc = TagTree::new(w, h);
    for (leaf, &v) in values.iter().enumerate() {
      enc.set_value(leaf as u32, v);
    }
    let mut bio = BioWriter::new();
    for t in 1..=4 {
      for leaf in 0..values.len() as u32 {
        enc.encode(&mut bio, leaf, t);
      }
    }
    let bytes = bio.finish();

    let mut dec = TagTree::new(w, h);
    let mut r = BioReader::new(&bytes);
    for t in 1..=4 {
      for (leaf, &v) in values.iter().enumerate() {
        assert_eq!(
          dec.decode(&mut r, leaf as u32, t).unwrap(),
          v < t,
          "leaf {} threshold {}",
          leaf,
          t
        );
      }
    }
  }
}
