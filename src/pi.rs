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

//! Packet progression iteration.
//!
//! Enumerates `(layer, resolution, component, precinct)` tuples in one of
//! the five progression orders, honouring progression-order-change
//! records. Spatial orders map positions onto the canvas-aligned
//! precinct grid of each component resolution.

use crate::math::{ceildiv, floordiv_pow2, Rect};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
  Lrcp,
  Rlcp,
  Rpcl,
  Pcrl,
  Cprl,
}

impl ProgressionOrder {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(Self::Lrcp),
      1 => Some(Self::Rlcp),
      2 => Some(Self::Rpcl),
      3 => Some(Self::Pcrl),
      4 => Some(Self::Cprl),
      _ => None,
    }
  }

  pub fn as_u8(self) -> u8 {
    match self {
      Self::Lrcp => 0,
      Self::Rlcp => 1,
      Self::Rpcl => 2,
      Self::Pcrl => 3,
      Self::Cprl => 4,
    }
  }
}

/// Progression-order-change record (one POC entry).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Poc {
  pub res0: u32,
  pub comp0: u16,
  pub lay1: u16,
  pub res1: u32,
  pub comp1: u16,
  pub order: ProgressionOrder,
}

/// Per-resolution geometry the iterator needs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PiRes {
  /// Precinct grid (columns, rows).
  pub pw: u32,
  pub ph: u32,
  /// log2 precinct size in resolution coordinates.
  pub ppx: u32,
  pub ppy: u32,
}

/// Per-component geometry the iterator needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct PiComp {
  pub dx: u32,
  pub dy: u32,
  pub resolutions: Vec<PiRes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PacketCoord {
  pub layno: u16,
  pub resno: u32,
  pub compno: u16,
  pub precno: u64,
}

/// Enumerates every packet of a tile in progression order. `tile` is
/// the tile rectangle in canvas coordinates.
pub(crate) fn packet_sequence(
  tile: &Rect,
  comps: &[PiComp],
  num_layers: u16,
  order: ProgressionOrder,
  pocs: &[Poc],
) -> Vec<PacketCoord> {
  let mut out = Vec::new();
  if pocs.is_empty() {
    let max_res = comps.iter().map(|c| c.resolutions.len() as u32).max().unwrap_or(0);
    emit(
      &mut out,
      tile,
      comps,
      order,
      0..num_layers,
      0..max_res,
      0..comps.len() as u16,
    );
  } else {
    // POC segments may overlap; a packet belongs to the first segment
    // that reaches it.
    let mut seen = HashSet::new();
    for poc in pocs {
      let mut segment = Vec::new();
      emit(
        &mut segment,
        tile,
        comps,
        poc.order,
        0..poc.lay1,
        poc.res0..poc.res1,
        poc.comp0..poc.comp1,
      );
      for pk in segment {
        if seen.insert(pk) {
          out.push(pk);
        }
      }
    }
  }
  out
}

#[allow(clippy::too_many_arguments)]
fn emit(
  out: &mut Vec<PacketCoord>,
  tile: &Rect,
  comps: &[PiComp],
  order: ProgressionOrder,
  layers: core::ops::Range<u16>,
  res: core::ops::Range<u32>,
  comp_range: core::ops::Range<u16>,
) {
  match order {
    ProgressionOrder::Lrcp => {
      for layno in layers.clone() {
        for resno in res.clone() {
          for compno in comp_range.clone() {
            for precno in precincts_of(comps, compno, resno) {
              out.push(PacketCoord {
                layno,
                resno,
                compno,
                precno,
              });
            }
          }
        }
      }
    }
    ProgressionOrder::Rlcp => {
      for resno in res.clone() {
        for layno in layers.clone() {
          for compno in comp_range.clone() {
            for precno in precincts_of(comps, compno, resno) {
              out.push(PacketCoord {
                layno,
                resno,
                compno,
                precno,
              });
            }
          }
        }
      }
    }
    ProgressionOrder::Rpcl => {
      for resno in res.clone() {
        for (x, y) in positions(tile, comps, &comp_range, resno..resno + 1) {
          for compno in comp_range.clone() {
            if let Some(precno) = precinct_at(tile, comps, compno, resno, x, y) {
              for layno in layers.clone() {
                out.push(PacketCoord {
                  layno,
                  resno,
                  compno,
                  precno,
                });
              }
            }
          }
        }
      }
    }
    ProgressionOrder::Pcrl => {
      for (x, y) in positions(tile, comps, &comp_range, res.clone()) {
        for compno in comp_range.clone() {
          for resno in res.clone() {
            if let Some(precno) = precinct_at(tile, comps, compno, resno, x, y) {
              for layno in layers.clone() {
                out.push(PacketCoord {
                  layno,
                  resno,
                  compno,
                  precno,
                });
              }
            }
          }
        }
      }
    }
    ProgressionOrder::Cprl => {
      for compno in comp_range.clone() {
        let one = compno..compno + 1;
        for (x, y) in positions(tile, comps, &one, res.clone()) {
          for resno in res.clone() {
            if let Some(precno) = precinct_at(tile, comps, compno, resno, x, y) {
              for layno in layers.clone() {
                out.push(PacketCoord {
                  layno,
                  resno,
                  compno,
                  precno,
                });
              }
            }
          }
        }
      }
    }
  }
}

fn precincts_of(comps: &[PiComp], compno: u16, resno: u32) -> core::ops::Range<u64> {
  let comp = &comps[compno as usize];
  match comp.resolutions.get(resno as usize) {
    Some(r) => 0..(r.pw as u64 * r.ph as u64),
    None => 0..0,
  }
}

/// Canvas positions visited by the spatial orders: every anchor of
/// every precinct of the participating component resolutions, in
/// raster order on the canvas.
fn positions(
  tile: &Rect,
  comps: &[PiComp],
  comp_range: &core::ops::Range<u16>,
  res: core::ops::Range<u32>,
) -> Vec<(u32, u32)> {
  let mut dx = u32::MAX;
  let mut dy = u32::MAX;
  for compno in comp_range.clone() {
    let comp = &comps[compno as usize];
    for resno in res.clone() {
      if let Some(r) = comp.resolutions.get(resno as usize) {
        let levelno = comp.resolutions.len() as u32 - 1 - resno;
        dx = dx.min(comp.dx << (r.ppx + levelno).min(31));
        dy = dy.min(comp.dy << (r.ppy + levelno).min(31));
      }
    }
  }
  if dx == u32::MAX || dy == u32::MAX {
    return Vec::new();
  }
  let mut pts = Vec::new();
  let mut y = tile.y0;
  while y < tile.y1 {
    let mut x = tile.x0;
    while x < tile.x1 {
      pts.push((x, y));
      x += dx - (x % dx);
    }
    y += dy - (y % dy);
  }
  pts
}

/// If canvas position `(x, y)` is the anchor of a precinct of
/// `(compno, resno)`, returns its precinct index.
fn precinct_at(
  tile: &Rect,
  comps: &[PiComp],
  compno: u16,
  resno: u32,
  x: u32,
  y: u32,
) -> Option<u64> {
  let comp = &comps[compno as usize];
  let r = comp.resolutions.get(resno as usize)?;
  if r.pw == 0 || r.ph == 0 {
    return None;
  }
  let levelno = comp.resolutions.len() as u32 - 1 - resno;
  let trx0 = ceildiv(tile.x0, comp.dx << levelno);
  let try0 = ceildiv(tile.y0, comp.dy << levelno);
  let trx1 = ceildiv(tile.x1, comp.dx << levelno);
  let try1 = ceildiv(tile.y1, comp.dy << levelno);
  if trx0 == trx1 || try0 == try1 {
    return None;
  }
  let rpx = r.ppx + levelno;
  let rpy = r.ppy + levelno;
  let on_row = y % (comp.dy << rpy.min(31)) == 0
    || (y == tile.y0 && (try0 << levelno) % (1 << rpy.min(31)) != 0);
  let on_col = x % (comp.dx << rpx.min(31)) == 0
    || (x == tile.x0 && (trx0 << levelno) % (1 << rpx.min(31)) != 0);
  if !on_row || !on_col {
    return None;
  }
  let px = floordiv_pow2(ceildiv(x, comp.dx << levelno), r.ppx) - floordiv_pow2(trx0, r.ppx);
  let py = floordiv_pow2(ceildiv(y, comp.dy << levelno), r.ppy) - floordiv_pow2(try0, r.ppy);
  Some(px as u64 + py as u64 * r.pw as u64)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simple_comps(num_res: u32, pw: u32, ph: u32, ppx: u32) -> Vec<PiComp> {
    vec![PiComp {
      dx: 1,
      dy: 1,
      resolutions: (0..num_res)
        .map(|_| PiRes {
          pw,
          ph,
          ppx,
          ppy: ppx,
        })
        .collect(),
    }]
  }

  #[test]
  fn lrcp_counts_and_order() {
    let comps = simple_comps(3, 2, 2, 7);
    let tile = Rect::new(0, 0, 512, 512);
    let seq = packet_sequence(&tile, &comps, 2, ProgressionOrder::Lrcp, &[]);
    assert_eq!(seq.len(), 2 * 3 * 4);
    // Layer must be the slowest axis.
    assert!(seq[..12].iter().all(|p| p.layno == 0));
    assert!(seq[12..].iter().all(|p| p.layno == 1));
    assert_eq!(seq[0].resno, 0);
    assert_eq!(seq[4].resno, 1);
  }

  #[test]
  fn rlcp_resolution_is_slowest() {
    let comps = simple_comps(2, 1, 1, 15);
    let tile = Rect::new(0, 0, 64, 64);
    let seq = packet_sequence(&tile, &comps, 3, ProgressionOrder::Rlcp, &[]);
    assert_eq!(seq.len(), 2 * 3);
    assert!(seq[..3].iter().all(|p| p.resno == 0));
    assert!(seq[3..].iter().all(|p| p.resno == 1));
  }

  #[test]
  fn rpcl_visits_every_precinct_once_per_layer() {
    // Single component, one resolution, 2x2 precincts of 64 canvas
    // pixels each.
    let comps = vec![PiComp {
      dx: 1,
      dy: 1,
      resolutions: vec![PiRes {
        pw: 2,
        ph: 2,
        ppx: 6,
        ppy: 6,
      }],
    }];
    let tile = Rect::new(0, 0, 128, 128);
    let seq = packet_sequence(&tile, &comps, 1, ProgressionOrder::Rpcl, &[]);
    assert_eq!(seq.len(), 4);
    let precnos: Vec<u64> = seq.iter().map(|p| p.precno).collect();
    assert_eq!(precnos, vec![0, 1, 2, 3]);
  }

  #[test]
  fn cprl_groups_by_component() {
    let mut comps = simple_comps(1, 1, 1, 15);
    comps.push(comps[0].clone());
    let tile = Rect::new(0, 0, 32, 32);
    let seq = packet_sequence(&tile, &comps, 2, ProgressionOrder::Cprl, &[]);
    assert_eq!(seq.len(), 4);
    assert!(seq[..2].iter().all(|p| p.compno == 0));
    assert!(seq[2..].iter().all(|p| p.compno == 1));
  }

  #[test]
  fn poc_changes_order_midstream() {
    let comps = simple_comps(2, 1, 1, 15);
    let tile = Rect::new(0, 0, 64, 64);
    let pocs = [
      Poc {
        res0: 0,
        comp0: 0,
        lay1: 1,
        res1: 1,
        comp1: 1,
        order: ProgressionOrder::Lrcp,
      },
      Poc {
        res0: 0,
        comp0: 0,
        lay1: 2,
        res1: 2,
        comp1: 1,
        order: ProgressionOrder::Rlcp,
      },
    ];
    let seq = packet_sequence(&tile, &comps, 2, ProgressionOrder::Lrcp, &pocs);
    // 2 layers x 2 res x 1 comp x 1 precinct, no duplicates.
    assert_eq!(seq.len(), 4);
    let set: HashSet<_> = seq.iter().collect();
    assert_eq!(set.len(), 4);
    // First segment covered layer 0 of res 0 only.
    assert_eq!(
      seq[0],
      PacketCoord {
        layno: 0,
        resno: 0,
        compno: 0,
        precno: 0
      }
    );
  }
}
