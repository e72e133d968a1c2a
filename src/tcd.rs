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

//! Tile processor: owns one tile from its first SOT to output commit.
//!
//! Decoding runs T2 packet parsing over the accumulated tile-part
//! bodies, T1 over every ready code block (fanning out onto the worker
//! pool), inverse quantisation, inverse DWT (whole-tile or windowed over
//! a sparse canvas), inverse MCT and the DC level shift. A re-entry with
//! more layers or a larger region replays only the affected passes using
//! the per-block entropy checkpoints.

use crate::canvas::{BandQuant, CodeblockDec, CodeblockEnc, Resolution, Subband};
use crate::consts::{BandOrientation, CblkSty, CodingStyle, QuantStyle};
use crate::dwt::{self, DwtKind};
use crate::error::{Error, Result};
use crate::math::{ceildiv_pow2, floordiv_pow2, Point, Rect};
use crate::mct;
use crate::pi::{self, PacketCoord, PiComp, PiRes, Poc, ProgressionOrder};
use crate::rate;
use crate::sparse_array::SparseArray;
use crate::t1::{BlockCoder, SegView};
use crate::t2;

use log::warn;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
  static CODER: RefCell<BlockCoder> = RefCell::new(BlockCoder::new());
}

/// Wavelet norms used for distortion weighting, by decomposition level.
#[rustfmt::skip]
const DWT_NORMS_53: [[f64; 10]; 4] = [
  [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 361.8],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 361.8],
  [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 191.9],
];
#[rustfmt::skip]
const DWT_NORMS_97: [[f64; 10]; 4] = [
  [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1097.0],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1097.0],
  [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 1114.0],
];

fn dwt_norm(reversible: bool, level: u32, orient: BandOrientation) -> f64 {
  let t = if reversible {
    &DWT_NORMS_53
  } else {
    &DWT_NORMS_97
  };
  t[orient as usize][(level as usize).min(9)]
}

pub(crate) fn band_gain(orient: BandOrientation) -> u8 {
  match orient {
    BandOrientation::LL => 0,
    BandOrientation::HL | BandOrientation::LH => 1,
    BandOrientation::HH => 2,
  }
}

/// Per tile-component coding parameters, layered over per-image
/// defaults by COC/QCC/RGN.
#[derive(Debug, Clone)]
pub struct TileCompParams {
  pub num_resolutions: u32,
  pub cblk_expn: Point,
  pub cblk_sty: CblkSty,
  pub reversible: bool,
  /// Per-resolution precinct exponents in resolution coordinates.
  pub precinct_expn: Vec<Point>,
  pub quant_style: QuantStyle,
  pub num_guard_bits: u8,
  /// One `(expn, mant)` per band index, expanded for derived styles.
  pub stepsizes: Vec<(u8, u16)>,
  pub roi_shift: u8,
}

impl Default for TileCompParams {
  fn default() -> Self {
    Self {
      num_resolutions: 6,
      cblk_expn: Point::new(6, 6),
      cblk_sty: CblkSty::empty(),
      reversible: true,
      precinct_expn: Vec::new(),
      quant_style: QuantStyle::NoQuant,
      num_guard_bits: 2,
      stepsizes: Vec::new(),
      roi_shift: 0,
    }
  }
}

impl TileCompParams {
  pub fn precinct_expn_for(&self, resno: u32) -> Point {
    self
      .precinct_expn
      .get(resno as usize)
      .copied()
      .unwrap_or_else(|| Point::new(15, 15))
  }

  /// Signalled `(expn, mant)` for a band, falling back to a precision
  /// default when no quantisation marker arrived.
  fn stepsize_for(&self, resno: u32, bandno: u32, precision: u8) -> (u8, u16) {
    let idx = if resno == 0 {
      0
    } else {
      (3 * (resno - 1) + bandno + 1) as usize
    };
    self.stepsizes.get(idx).copied().unwrap_or((
      precision + band_gain(BandOrientation::from_band_index(resno, bandno)),
      0,
    ))
  }
}

/// Per-tile coding parameters.
#[derive(Debug, Clone)]
pub struct TileCodingParams {
  pub num_layers: u16,
  pub mct: bool,
  pub prog_order: ProgressionOrder,
  pub pocs: Vec<Poc>,
  pub csty: CodingStyle,
  pub tccps: Vec<TileCompParams>,
  /// Packed packet headers carried by PPM/PPT markers.
  pub ppt_data: Vec<u8>,
  pub ppt: bool,
  /// HT code blocks signalled by CAP.
  pub ht: bool,
}

impl Default for TileCodingParams {
  fn default() -> Self {
    Self {
      num_layers: 1,
      mct: false,
      prog_order: ProgressionOrder::Lrcp,
      pocs: Vec::new(),
      csty: CodingStyle::empty(),
      tccps: Vec::new(),
      ppt_data: Vec::new(),
      ppt: false,
      ht: false,
    }
  }
}

/// Component description the tile processor needs from SIZ.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompInfo {
  pub dx: u32,
  pub dy: u32,
  pub precision: u8,
  pub signed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TileComp {
  /// Full-resolution canvas rectangle of this tile component.
  pub rect: Rect,
  /// Rectangle at the highest kept resolution.
  pub reduced_rect: Rect,
  pub resolutions: Vec<Resolution>,
  /// Dense coefficient store (whole-tile path).
  pub coeffs: Vec<i32>,
  /// Sparse coefficient store (windowed path).
  pub sparse: Option<SparseArray>,
  /// Reconstructed samples of the most recent decode.
  pub out: Vec<i32>,
  pub out_rect: Rect,
}

/// One tile's decode state and pipeline.
#[derive(Debug)]
pub(crate) struct TileProcessor {
  pub tile_index: u16,
  pub rect: Rect,
  pub tcp: TileCodingParams,
  pub comp_info: Vec<CompInfo>,
  pub comps: Vec<TileComp>,
  /// Tile-part bodies in arrival order; chunk descriptors index these.
  pub parts: Vec<Vec<u8>>,
  pub expected_parts: u8,
  pub parts_seen: u8,
  pub whole_tile: bool,
  pub reduce: u32,
  // Packet parsing cursor, persisted across differential calls.
  packets: Vec<PacketCoord>,
  next_packet: usize,
  cur_part: usize,
  cur_offset: usize,
  ppt_offset: usize,
  /// Layers already fed through T1.
  pub decoded_layers: u16,
  geometry_ready: bool,
}

impl TileProcessor {
  pub fn new(
    tile_index: u16,
    rect: Rect,
    tcp: TileCodingParams,
    comp_info: Vec<CompInfo>,
    reduce: u32,
    whole_tile: bool,
  ) -> Self {
    Self {
      tile_index,
      rect,
      tcp,
      comp_info,
      comps: Vec::new(),
      parts: Vec::new(),
      expected_parts: 0,
      parts_seen: 0,
      whole_tile,
      reduce,
      packets: Vec::new(),
      next_packet: 0,
      cur_part: 0,
      cur_offset: 0,
      ppt_offset: 0,
      decoded_layers: 0,
      geometry_ready: false,
    }
  }

  pub fn push_part(&mut self, body: Vec<u8>) {
    self.parts.push(body);
    self.parts_seen = self.parts_seen.saturating_add(1);
  }

  pub fn all_parts_in(&self) -> bool {
    self.expected_parts != 0 && self.parts_seen >= self.expected_parts
  }

  fn kept_resolutions(&self, compno: usize) -> u32 {
    let nres = self.tcp.tccps[compno].num_resolutions;
    nres.saturating_sub(self.reduce).max(1)
  }

  /// Decomposes every component into its resolution/sub-band tree.
  pub fn build_geometry(&mut self) {
    if self.geometry_ready {
      return;
    }
    self.comps.clear();
    for compno in 0..self.comp_info.len() {
      let info = self.comp_info[compno];
      let tccp = self.tcp.tccps[compno].clone();
      let rect = self.rect.scale_down_ceil(info.dx, info.dy);
      let nres = tccp.num_resolutions;
      let kept = self.kept_resolutions(compno);
      let reduced_rect = rect.scale_down_ceil_pow2(nres - kept);

      let mut resolutions = Vec::with_capacity(nres as usize);
      for resno in 0..nres {
        let level = nres - 1 - resno;
        let res_rect = rect.scale_down_ceil_pow2(level);
        let pexp = tccp.precinct_expn_for(resno);
        let band_pexp = if resno == 0 {
          pexp
        } else {
          Point::new(pexp.x.saturating_sub(1), pexp.y.saturating_sub(1))
        };
        let grid = if res_rect.is_empty() {
          Point::new(0, 0)
        } else {
          Point::new(
            ceildiv_pow2(res_rect.x1, pexp.x) - floordiv_pow2(res_rect.x0, pexp.x),
            ceildiv_pow2(res_rect.y1, pexp.y) - floordiv_pow2(res_rect.y0, pexp.y),
          )
        };
        let cblk_expn = Point::new(
          tccp.cblk_expn.x.min(band_pexp.x),
          tccp.cblk_expn.y.min(band_pexp.y),
        );

        let mut bands: SmallVec<[Subband; 3]> = SmallVec::new();
        if resno == 0 {
          bands.push(make_band(&tccp, &info, res_rect, resno, 0, BandOrientation::LL));
        } else {
          for bandno in 0..3u32 {
            let orient = BandOrientation::from_band_index(resno, bandno);
            let (x0b, y0b) = match orient {
              BandOrientation::HL => (1u32, 0u32),
              BandOrientation::LH => (0, 1),
              _ => (1, 1),
            };
            let band_rect = Rect::new(
              band_coord(rect.x0, level, x0b),
              band_coord(rect.y0, level, y0b),
              band_coord(rect.x1, level, x0b),
              band_coord(rect.y1, level, y0b),
            );
            bands.push(make_band(&tccp, &info, band_rect, resno, bandno, orient));
          }
        }
        resolutions.push(Resolution {
          rect: res_rect,
          bands,
          precinct_expn: pexp,
          band_precinct_expn: band_pexp,
          precinct_grid: grid,
          cblk_expn,
        });
      }

      self.comps.push(TileComp {
        rect,
        reduced_rect,
        resolutions,
        ..Default::default()
      });
    }
    self.geometry_ready = true;
  }

  fn pi_comps(&self) -> Vec<PiComp> {
    self
      .comps
      .iter()
      .zip(self.comp_info.iter())
      .map(|(tc, info)| PiComp {
        dx: info.dx,
        dy: info.dy,
        resolutions: tc
          .resolutions
          .iter()
          .map(|r| PiRes {
            pw: r.precinct_grid.x,
            ph: r.precinct_grid.y,
            ppx: r.precinct_expn.x,
            ppy: r.precinct_expn.y,
          })
          .collect(),
      })
      .collect()
  }

  /// Parses all packets available in the tile-part bodies. The layer
  /// cap lives in T1 consumption, not here: every arrived packet is
  /// parsed so the stream cursor stays in sync regardless of the
  /// progression order.
  pub fn parse_packets(&mut self, _max_layers: u16) -> Result<()> {
    self.build_geometry();
    if self.packets.is_empty() {
      let pi_comps = self.pi_comps();
      self.packets = pi::packet_sequence(
        &self.rect,
        &pi_comps,
        self.tcp.num_layers,
        self.tcp.prog_order,
        &self.tcp.pocs,
      );
    }
    let use_sop = self.tcp.csty.contains(CodingStyle::SOP);
    let use_eph = self.tcp.csty.contains(CodingStyle::EPH);
    let is_ht = self.tcp.ht;

    while self.next_packet < self.packets.len() {
      let pk = self.packets[self.next_packet];
      while self.cur_part < self.parts.len() && self.cur_offset >= self.parts[self.cur_part].len()
      {
        self.cur_part += 1;
        self.cur_offset = 0;
      }
      if self.cur_part >= self.parts.len() {
        break;
      }
      if self.tcp.ppt && self.ppt_offset >= self.tcp.ppt_data.len() {
        break;
      }

      let compno = pk.compno as usize;
      let cblk_sty = self.tcp.tccps[compno].cblk_sty;
      let num_layers = self.tcp.num_layers;
      let ppt = self.tcp.ppt;
      let comp = &mut self.comps[compno];
      let res = match comp.resolutions.get_mut(pk.resno as usize) {
        Some(r) => r,
        None => {
          self.next_packet += 1;
          continue;
        }
      };
      let quants: Vec<u8> = res.bands.iter().map(|b| b.quant.num_bps).collect();

      let header_res = if ppt {
        t2::read_packet_header(
          res,
          pk.precno,
          pk.layno,
          num_layers,
          cblk_sty,
          |b| quants[b],
          &self.tcp.ppt_data[self.ppt_offset..],
          use_sop,
          use_eph,
        )
      } else {
        t2::read_packet_header(
          res,
          pk.precno,
          pk.layno,
          num_layers,
          cblk_sty,
          |b| quants[b],
          &self.parts[self.cur_part][self.cur_offset..],
          use_sop,
          use_eph,
        )
      };
      let hdr = match header_res {
        Ok(h) => h,
        Err(e) => {
          warn!("tile {}: {}; abandoning packet parse", self.tile_index, e);
          break;
        }
      };

      let body_offset = if ppt {
        self.ppt_offset += hdr.header_len;
        self.cur_offset
      } else {
        self.cur_offset + hdr.header_len
      };
      let remaining = self.parts[self.cur_part].len().saturating_sub(body_offset);
      let consumed = if hdr.empty {
        0
      } else {
        t2::read_packet_body(
          res,
          pk.precno,
          pk.layno,
          self.cur_part as u16,
          body_offset as u32,
          remaining,
          is_ht,
        )?
      };
      self.cur_offset = body_offset + consumed;
      if (consumed as u64) < hdr.body_len {
        // Mid-packet truncation: affected blocks were clamped already;
        // nothing further in this tile part can be trusted.
        self.cur_offset = self.parts[self.cur_part].len();
      }
      self.next_packet += 1;
    }
    Ok(())
  }

  /// Runs T1 over every ready code block of the kept resolutions and
  /// stores dequantised coefficients into the dense or sparse canvas.
  pub fn decompress_blocks(
    &mut self,
    max_layers: u16,
    cached: bool,
    cancel: Option<&AtomicBool>,
  ) -> Result<()> {
    self.build_geometry();
    let final_layer = max_layers >= self.tcp.num_layers;
    let is_ht = self.tcp.ht;

    for compno in 0..self.comps.len() {
      if let Some(c) = cancel {
        if c.load(Ordering::Relaxed) {
          return Err(Error::Cancelled);
        }
      }
      let kept = self.kept_resolutions(compno);
      let tccp = self.tcp.tccps[compno].clone();
      let reduced = self.comps[compno].reduced_rect;
      let stride = reduced.width() as usize;

      if self.whole_tile {
        let len = (reduced.area() as usize).max(1);
        if self.comps[compno].coeffs.len() != len {
          self.comps[compno].coeffs = vec![0; len];
        }
      } else if self.comps[compno].sparse.is_none() {
        self.comps[compno].sparse = SparseArray::new(
          reduced.width().max(1),
          reduced.height().max(1),
          1 << tccp.cblk_expn.x.min(10),
          1 << tccp.cblk_expn.y.min(10),
        );
      }

      let parts = &self.parts;
      let comp = &mut self.comps[compno];
      let nres = comp.resolutions.len() as u32;
      for resno in 0..kept.min(nres) {
        let prev_dims = if resno == 0 {
          Point::new(0, 0)
        } else {
          let p = &comp.resolutions[resno as usize - 1].rect;
          Point::new(p.width(), p.height())
        };
        let res = &mut comp.resolutions[resno as usize];
        for band in res.bands.iter_mut() {
          if band.is_empty() {
            continue;
          }
          let orient = band.orientation;
          let quant = band.quant;
          let band_rect = band.rect;
          let (x_off, y_off) = match orient {
            BandOrientation::LL => (0, 0),
            BandOrientation::HL => (prev_dims.x, 0),
            BandOrientation::LH => (0, prev_dims.y),
            BandOrientation::HH => (prev_dims.x, prev_dims.y),
          };

          struct Job<'b> {
            blk: &'b mut CodeblockDec,
            rect: Rect,
          }
          let mut jobs: Vec<Job<'_>> = Vec::new();
          for prec in band.precincts.iter_mut() {
            for (_no, blk) in prec.dec_blocks_iter_mut() {
              let rect = blk.rect;
              if rect.is_empty() {
                continue;
              }
              jobs.push(Job {
                blk: &mut **blk,
                rect,
              });
            }
          }

          let cblk_sty = if is_ht {
            tccp.cblk_sty | CblkSty::HT
          } else {
            tccp.cblk_sty
          };
          let roi_shift = tccp.roi_shift;
          let reversible = tccp.reversible;
          let results: Vec<(Rect, Vec<i32>)> = jobs
            .par_iter_mut()
            .filter_map(|job| {
              if let Some(c) = cancel {
                if c.load(Ordering::Relaxed) {
                  return None;
                }
              }
              let rect = job.rect;
              let blk = &mut *job.blk;
              let zero = move || vec![0i32; rect.area() as usize];
              if blk.corrupt {
                return Some((rect, zero()));
              }
              // Layer cap applies per segment: passes of layers beyond
              // the cap stay unconsumed even when their data arrived.
              let per_seg_cap: Vec<u32> = blk
                .segs
                .iter()
                .map(|s| {
                  let upto = (max_layers as usize).min(s.passes_in_layer.len());
                  let hdr: u32 = s.passes_in_layer[..upto].iter().map(|&p| p as u32).sum();
                  hdr.min(s.data_passes)
                })
                .collect();
              let capped: u32 = per_seg_cap.iter().sum();
              if capped == 0 && blk.resume.is_none() {
                return Some((rect, zero()));
              }
              let views: Vec<SegView<'_>> = blk
                .seg_views(parts)
                .into_iter()
                .zip(per_seg_cap.iter())
                .map(|(v, &cap)| SegView {
                  passes: v.passes.min(cap),
                  ..v
                })
                .collect();
              let w = rect.width();
              let h = rect.height();
              let numbps = blk.numbps;
              let decoded = CODER.with(|c| {
                let mut coder = c.borrow_mut();
                match coder.decompress(
                  &mut blk.resume,
                  &views,
                  w,
                  h,
                  numbps,
                  cblk_sty,
                  orient,
                  cached,
                  final_layer,
                ) {
                  Ok(()) => {
                    let mut out = vec![0i32; (w * h) as usize];
                    for (dst, &raw) in out.iter_mut().zip(coder.data.iter()) {
                      let mut mag = raw.unsigned_abs() / 2;
                      if roi_shift > 0 {
                        let thresh = 1u64 << roi_shift.min(63);
                        if mag as u64 >= thresh {
                          mag >>= roi_shift.min(31);
                        }
                      }
                      let v = if reversible {
                        mag as i64
                      } else {
                        ((mag as f64) * quant.stepsize as f64).round() as i64
                      };
                      *dst = if raw < 0 { -(v as i32) } else { v as i32 };
                    }
                    Some(out)
                  }
                  Err(e) => {
                    warn!("code block dropped: {}", e);
                    None
                  }
                }
              });
              match decoded {
                Some(out) => Some((rect, out)),
                None => {
                  blk.release();
                  Some((rect, zero()))
                }
              }
            })
            .collect();

          if let Some(c) = cancel {
            if c.load(Ordering::Relaxed) {
              return Err(Error::Cancelled);
            }
          }

          // Commit coefficients into the canvas at packed positions.
          for (rect, samples) in results {
            let bw = rect.width();
            let bh = rect.height();
            let bx = x_off + rect.x0 - band_rect.x0;
            let by = y_off + rect.y0 - band_rect.y0;
            if let Some(sa) = comp.sparse.as_mut() {
              sa.write(bx, by, bx + bw, by + bh, &samples, 1, bw);
            } else {
              for y in 0..bh as usize {
                let dst = (by as usize + y) * stride + bx as usize;
                comp.coeffs[dst..dst + bw as usize]
                  .copy_from_slice(&samples[y * bw as usize..(y + 1) * bw as usize]);
              }
            }
          }
        }
      }
    }
    self.decoded_layers = max_layers.min(self.tcp.num_layers);
    Ok(())
  }

  /// Inverse DWT, inverse MCT and DC shift; fills each component's
  /// `out` buffer. `window`, when set, is a reference-grid rectangle.
  pub fn reconstruct(&mut self, window: Option<&Rect>) -> Result<()> {
    for compno in 0..self.comps.len() {
      let kept = self.kept_resolutions(compno);
      let tccp = &self.tcp.tccps[compno];
      let info = self.comp_info[compno];
      let kind = if tccp.reversible {
        DwtKind::Reversible53
      } else {
        DwtKind::Irreversible97
      };
      let comp = &mut self.comps[compno];
      let nres = comp.resolutions.len() as u32;
      let shift = nres - kept;
      let res_rects: Vec<Rect> = (0..kept)
        .map(|r| comp.rect.scale_down_ceil_pow2(nres - 1 - r))
        .collect();
      let max_level = kept as usize - 1;
      let reduced = comp.reduced_rect;
      let stride = reduced.width() as usize;

      let out_rect = match window {
        None => reduced,
        Some(w) => {
          let cw = w.scale_down_ceil(info.dx, info.dy);
          let rw = cw.scale_down_ceil_pow2(shift);
          rw.intersection(&reduced)
        }
      };

      if let Some(sa) = comp.sparse.as_ref() {
        // Windowed path: transform a clone so the coefficient store
        // survives for differential re-entry.
        let mut work = sa.clone();
        let rel_window = Rect::new(
          out_rect.x0 - reduced.x0,
          out_rect.y0 - reduced.y0,
          out_rect.x1 - reduced.x0,
          out_rect.y1 - reduced.y0,
        );
        dwt::decode_partial(kind, &mut work, &res_rects, max_level, &rel_window);
        comp.out = vec![0; out_rect.area() as usize];
        work.read(
          rel_window.x0,
          rel_window.y0,
          rel_window.x1,
          rel_window.y1,
          &mut comp.out,
          1,
          rel_window.width(),
        );
      } else {
        let mut work = comp.coeffs.clone();
        dwt::decode_tile(kind, &mut work, stride, &res_rects, max_level);
        if out_rect == reduced {
          comp.out = work;
        } else {
          comp.out = vec![0; out_rect.area() as usize];
          for y in out_rect.y0..out_rect.y1 {
            let src = ((y - reduced.y0) as usize) * stride + (out_rect.x0 - reduced.x0) as usize;
            let dst = ((y - out_rect.y0) as usize) * out_rect.width() as usize;
            let run = out_rect.width() as usize;
            comp.out[dst..dst + run].copy_from_slice(&work[src..src + run]);
          }
        }
      }
      comp.out_rect = out_rect;
    }

    // Inverse MCT over the first three components when enabled.
    if self.tcp.mct && self.comps.len() >= 3 {
      let same = self.comps[0].out_rect == self.comps[1].out_rect
        && self.comps[1].out_rect == self.comps[2].out_rect;
      if !same {
        warn!("inverse MCT skipped: component rectangles differ");
      } else {
        let (a, rest) = self.comps.split_at_mut(1);
        let (b, c) = rest.split_at_mut(1);
        if self.tcp.tccps[0].reversible {
          mct::decode_rct(&mut a[0].out, &mut b[0].out, &mut c[0].out);
        } else {
          mct::decode_ict(&mut a[0].out, &mut b[0].out, &mut c[0].out);
        }
      }
    }

    // Inverse DC level shift and precision clamp.
    for (comp, info) in self.comps.iter_mut().zip(self.comp_info.iter()) {
      let (lo, hi) = if info.signed {
        (
          (-(1i64 << (info.precision - 1))) as i32,
          ((1i64 << (info.precision - 1)) - 1) as i32,
        )
      } else {
        (0, ((1i64 << info.precision) - 1) as i32)
      };
      let shift = if info.signed {
        0
      } else {
        1i32 << (info.precision - 1)
      };
      for v in comp.out.iter_mut() {
        *v = (*v + shift).clamp(lo, hi);
      }
    }
    Ok(())
  }

  // ----------------------------------------------------------------- //
  // Encoder                                                            //
  // ----------------------------------------------------------------- //

  /// Compresses the tile: forward DC shift/MCT, forward DWT,
  /// quantisation, T1 over every block, rate allocation and packet
  /// emission. Returns the packet body for the tile's single tile part.
  pub fn compress(
    &mut self,
    image: &crate::image::Image,
    layer_targets: &[Option<u64>],
  ) -> Result<Vec<u8>> {
    self.build_geometry();

    // 1. Pull samples, DC shift.
    for (compno, comp) in self.comps.iter_mut().enumerate() {
      let info = self.comp_info[compno];
      let ic = &image.comps[compno];
      let full = image.bounds.scale_down_ceil(info.dx, info.dy);
      let rect = comp.rect;
      let w = rect.width() as usize;
      comp.coeffs = vec![0; rect.area() as usize];
      let shift = if info.signed {
        0
      } else {
        1i32 << (info.precision - 1)
      };
      let iw = full.width() as usize;
      for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
          let src = ((y - full.y0) as usize) * iw + (x - full.x0) as usize;
          let dst = ((y - rect.y0) as usize) * w + (x - rect.x0) as usize;
          comp.coeffs[dst] = ic.data[src] - shift;
        }
      }
    }

    // 2. Forward MCT.
    if self.tcp.mct && self.comps.len() >= 3 {
      let (a, rest) = self.comps.split_at_mut(1);
      let (b, c) = rest.split_at_mut(1);
      if self.tcp.tccps[0].reversible {
        mct::encode_rct(&mut a[0].coeffs, &mut b[0].coeffs, &mut c[0].coeffs);
      } else {
        mct::encode_ict(&mut a[0].coeffs, &mut b[0].coeffs, &mut c[0].coeffs);
      }
    }

    // 3. Forward DWT, quantisation, T1 per block.
    for compno in 0..self.comps.len() {
      let tccp = self.tcp.tccps[compno].clone();
      let kind = if tccp.reversible {
        DwtKind::Reversible53
      } else {
        DwtKind::Irreversible97
      };
      let num_layers = self.tcp.num_layers;
      let reversible = tccp.reversible;
      let comp = &mut self.comps[compno];
      let nres = comp.resolutions.len() as u32;
      let res_rects: Vec<Rect> = (0..nres)
        .map(|r| comp.rect.scale_down_ceil_pow2(nres - 1 - r))
        .collect();
      let stride = comp.rect.width() as usize;
      dwt::encode_tile(kind, &mut comp.coeffs, stride, &res_rects, nres as usize - 1);

      for resno in 0..nres {
        let level = nres - 1 - resno;
        let prev_dims = if resno == 0 {
          Point::new(0, 0)
        } else {
          Point::new(
            res_rects[resno as usize - 1].width(),
            res_rects[resno as usize - 1].height(),
          )
        };
        let band_pexp = comp.resolutions[resno as usize].band_precinct_expn;
        let grid_w = comp.resolutions[resno as usize].precinct_grid.x;
        let cblk_expn = comp.resolutions[resno as usize].cblk_expn;
        let num_precincts = comp.resolutions[resno as usize].num_precincts();
        let res = &mut comp.resolutions[resno as usize];
        for band in res.bands.iter_mut() {
          if band.is_empty() {
            continue;
          }
          let orient = band.orientation;
          let quant = band.quant;
          let weight = dwt_norm(reversible, level, orient);
          let band_rect = band.rect;
          let (x_off, y_off) = match orient {
            BandOrientation::LL => (0, 0),
            BandOrientation::HL => (prev_dims.x, 0),
            BandOrientation::LH => (0, prev_dims.y),
            BandOrientation::HH => (prev_dims.x, prev_dims.y),
          };
          for precno in 0..num_precincts {
            let prec = band.precinct_mut(precno, band_pexp, grid_w, cblk_expn, num_layers);
            let n = prec.num_cblks();
            for cblkno in 0..n {
              let rect = prec.cblk_rect(cblkno);
              if rect.is_empty() {
                continue;
              }
              let bw = rect.width();
              let bh = rect.height();
              let mut samples = vec![0i32; (bw * bh) as usize];
              for y in 0..bh {
                for x in 0..bw {
                  let gx = (x_off + rect.x0 - band_rect.x0 + x) as usize;
                  let gy = (y_off + rect.y0 - band_rect.y0 + y) as usize;
                  let mut v = comp.coeffs[gy * stride + gx];
                  if !reversible {
                    v = ((v as f64) / quant.stepsize as f64).round() as i32;
                  }
                  samples[(y * bw + x) as usize] = v;
                }
              }
              let out = CODER.with(|c| {
                c.borrow_mut().compress(
                  &samples,
                  bw,
                  bh,
                  orient,
                  tccp.cblk_sty,
                  weight,
                  if reversible { 1.0 } else { quant.stepsize as f64 },
                  true,
                )
              });
              prec.enc_block(cblkno).enc = Some(out);
            }
          }
        }
      }
    }

    // 4. Rate allocation over every block of the tile.
    {
      let mut blocks: Vec<&mut CodeblockEnc> = Vec::new();
      for comp in self.comps.iter_mut() {
        for res in comp.resolutions.iter_mut() {
          for band in res.bands.iter_mut() {
            for prec in band.precincts.iter_mut() {
              for (_no, blk) in prec.enc_blocks_iter_mut() {
                blocks.push(&mut **blk);
              }
            }
          }
        }
      }
      rate::allocate_layers(&mut blocks, self.tcp.num_layers, layer_targets)?;
    }

    // 5. Prime the tag trees from the allocation.
    for comp in self.comps.iter_mut() {
      for res in comp.resolutions.iter_mut() {
        for band in res.bands.iter_mut() {
          let band_bps = band.quant.num_bps;
          for prec in band.precincts.iter_mut() {
            let n = prec.num_cblks();
            for cblkno in 0..n {
              let primed = prec.enc_block_ref(cblkno).and_then(|b| {
                b.included_in_layer
                  .map(|l| (l, band_bps.saturating_sub(b.enc.as_ref().map(|e| e.numbps).unwrap_or(0))))
              });
              if let Some((layer, zbp)) = primed {
                if let Some(t) = prec.incl_tree.as_mut() {
                  t.set_value(cblkno, layer as i32);
                }
                if let Some(t) = prec.imsb_tree.as_mut() {
                  t.set_value(cblkno, zbp as i32);
                }
              }
            }
          }
        }
      }
    }

    // 6. Emit packets in progression order.
    let pi_comps = self.pi_comps();
    let packets = pi::packet_sequence(
      &self.rect,
      &pi_comps,
      self.tcp.num_layers,
      self.tcp.prog_order,
      &self.tcp.pocs,
    );
    let use_sop = self.tcp.csty.contains(CodingStyle::SOP);
    let use_eph = self.tcp.csty.contains(CodingStyle::EPH);
    let mut body = Vec::new();
    let mut packet_no = 0u32;
    for pk in packets {
      let compno = pk.compno as usize;
      let cblk_sty = self.tcp.tccps[compno].cblk_sty;
      let comp = &mut self.comps[compno];
      let res = match comp.resolutions.get_mut(pk.resno as usize) {
        Some(r) => r,
        None => continue,
      };
      let quants: Vec<u8> = res.bands.iter().map(|b| b.quant.num_bps).collect();
      t2::write_packet(
        res,
        pk.precno,
        pk.layno,
        cblk_sty,
        |b| quants[b],
        &mut body,
        use_sop,
        use_eph,
        &mut packet_no,
      )?;
    }
    Ok(body)
  }
}

fn make_band(
  tccp: &TileCompParams,
  info: &CompInfo,
  rect: Rect,
  resno: u32,
  bandno: u32,
  orient: BandOrientation,
) -> Subband {
  let (expn, mant) = tccp.stepsize_for(resno, bandno, info.precision);
  let gain = band_gain(orient);
  let numbps_ref = info.precision as i32 + gain as i32;
  let stepsize = if tccp.reversible {
    1.0
  } else {
    (1.0 + mant as f64 / 2048.0) * (2f64).powi(numbps_ref - expn as i32)
  };
  Subband {
    rect,
    orientation: orient,
    quant: BandQuant {
      stepsize: stepsize as f32,
      expn,
      mant,
      num_bps: (expn + tccp.num_guard_bits).saturating_sub(1),
    },
    precincts: Vec::new(),
    precinct_map: Default::default(),
  }
}

/// Sub-band edge in canvas coordinates:
/// `ceil((v - 2^level * b) / 2^(level + 1))`, clamped at zero.
fn band_coord(v: u32, level: u32, b: u32) -> u32 {
  let num = (v as i64) - ((1i64 << level) * b as i64);
  if num <= 0 {
    return 0;
  }
  let den = 1i64 << (level + 1);
  ((num + den - 1) / den) as u32
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tcp_for(nres: u32, comps: usize) -> TileCodingParams {
    TileCodingParams {
      tccps: vec![
        TileCompParams {
          num_resolutions: nres,
          ..Default::default()
        };
        comps
      ],
      ..Default::default()
    }
  }

  fn info() -> Vec<CompInfo> {
    vec![CompInfo {
      dx: 1,
      dy: 1,
      precision: 8,
      signed: false,
    }]
  }

  #[test]
  fn geometry_band_rects_partition_resolutions() {
    let mut tp = TileProcessor::new(0, Rect::new(0, 0, 33, 17), tcp_for(3, 1), info(), 0, true);
    tp.build_geometry();
    let comp = &tp.comps[0];
    assert_eq!(comp.resolutions.len(), 3);
    // Resolution 0 carries a lone LL band equal to its rect.
    assert_eq!(comp.resolutions[0].bands.len(), 1);
    assert_eq!(comp.resolutions[0].bands[0].rect, comp.resolutions[0].rect);
    // Higher resolutions carry HL/LH/HH whose sizes tile the level.
    for r in 1..3usize {
      let res = &comp.resolutions[r];
      let prev = &comp.resolutions[r - 1];
      assert_eq!(res.bands.len(), 3);
      let hl = &res.bands[0].rect;
      let lh = &res.bands[1].rect;
      let hh = &res.bands[2].rect;
      assert_eq!(prev.rect.width() + hl.width(), res.rect.width());
      assert_eq!(prev.rect.height() + lh.height(), res.rect.height());
      assert_eq!(hl.width(), hh.width());
      assert_eq!(lh.height(), hh.height());
    }
  }

  #[test]
  fn band_coord_matches_halving() {
    // Level-0 band split of [5, 13): low edge rounds up, high rounds
    // down.
    assert_eq!(band_coord(5, 0, 0), 3);
    assert_eq!(band_coord(5, 0, 1), 2);
    assert_eq!(band_coord(13, 0, 0), 7);
    assert_eq!(band_coord(13, 0, 1), 6);
  }

  #[test]
  fn reduce_shrinks_reduced_rect() {
    let mut tp = TileProcessor::new(0, Rect::new(0, 0, 64, 64), tcp_for(4, 1), info(), 2, true);
    tp.build_geometry();
    assert_eq!(tp.comps[0].reduced_rect, Rect::new(0, 0, 16, 16));
  }

  #[test]
  fn precinct_grid_counts() {
    let mut tcp = tcp_for(2, 1);
    tcp.tccps[0].precinct_expn = vec![Point::new(6, 6), Point::new(7, 7)];
    let mut tp = TileProcessor::new(0, Rect::new(0, 0, 300, 200), tcp, info(), 0, true);
    tp.build_geometry();
    let res1 = &tp.comps[0].resolutions[1];
    // 300x200 at 128-precincts: 3 x 2 grid.
    assert_eq!(res1.precinct_grid, Point::new(3, 2));
    // Band precincts are half the resolution precinct size.
    assert_eq!(res1.band_precinct_expn, Point::new(6, 6));
  }
}
