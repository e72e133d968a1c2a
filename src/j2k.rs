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

//! Code-stream control plane: the marker-driven state machine, tile
//! scheduling, TLM random access, windowed decoding, differential
//! re-decompression, and the encoder-side stream assembly.

use crate::consts::{CblkSty, CodingStyle, QuantStyle};
use crate::error::{Error, Result};
use crate::image::{ComponentType, Image, ImageComp};
use crate::math::{ceildiv, Point, Rect};
use crate::pi::{Poc, ProgressionOrder};
use crate::tcd::{band_gain, CompInfo, TileCodingParams, TileCompParams, TileProcessor};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};

bitflags! {
  /// Decoder position within the stream grammar.
  pub struct DecoderState: u32 {
    const NONE = 0;
    const MHSOC = 1;
    const MHSIZ = 2;
    const MH = 4;
    const TPHSOT = 8;
    const TPH = 16;
    const NEOC = 64;
    const EOC = 256;
    const ERR = 32768;
  }
}

/// Marker opcodes keyed by the byte pair that introduces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
  Soc,
  Sot,
  Sod,
  Eoc,
  Siz,
  Cap,
  Cod,
  Coc,
  Cpf,
  Rgn,
  Qcd,
  Qcc,
  Poc,
  Tlm,
  Plm,
  Plt,
  Ppm,
  Ppt,
  Sop,
  Eph,
  Crg,
  Com,
  Cbd,
  Unknown(u16),
}

impl From<u16> for Marker {
  fn from(v: u16) -> Self {
    match v {
      0xff4f => Self::Soc,
      0xff90 => Self::Sot,
      0xff93 => Self::Sod,
      0xffd9 => Self::Eoc,
      0xff51 => Self::Siz,
      0xff50 => Self::Cap,
      0xff52 => Self::Cod,
      0xff53 => Self::Coc,
      0xff59 => Self::Cpf,
      0xff5e => Self::Rgn,
      0xff5c => Self::Qcd,
      0xff5d => Self::Qcc,
      0xff5f => Self::Poc,
      0xff55 => Self::Tlm,
      0xff57 => Self::Plm,
      0xff58 => Self::Plt,
      0xff60 => Self::Ppm,
      0xff61 => Self::Ppt,
      0xff91 => Self::Sop,
      0xff92 => Self::Eph,
      0xff63 => Self::Crg,
      0xff64 => Self::Com,
      0xff78 => Self::Cbd,
      other => Self::Unknown(other),
    }
  }
}

impl Marker {
  pub fn as_u16(self) -> u16 {
    match self {
      Self::Soc => 0xff4f,
      Self::Sot => 0xff90,
      Self::Sod => 0xff93,
      Self::Eoc => 0xffd9,
      Self::Siz => 0xff51,
      Self::Cap => 0xff50,
      Self::Cod => 0xff52,
      Self::Coc => 0xff53,
      Self::Cpf => 0xff59,
      Self::Rgn => 0xff5e,
      Self::Qcd => 0xff5c,
      Self::Qcc => 0xff5d,
      Self::Poc => 0xff5f,
      Self::Tlm => 0xff55,
      Self::Plm => 0xff57,
      Self::Plt => 0xff58,
      Self::Ppm => 0xff60,
      Self::Ppt => 0xff61,
      Self::Sop => 0xff91,
      Self::Eph => 0xff92,
      Self::Crg => 0xff63,
      Self::Com => 0xff64,
      Self::Cbd => 0xff78,
      Self::Unknown(v) => v,
    }
  }

  /// States a marker is legal in; the parse loop rejects the rest.
  pub fn states(self) -> DecoderState {
    match self {
      Self::Soc => DecoderState::MHSOC,
      Self::Siz => DecoderState::MHSIZ,
      Self::Sot => DecoderState::MH | DecoderState::TPHSOT,
      Self::Sod => DecoderState::TPH,
      Self::Eoc => DecoderState::TPHSOT | DecoderState::NEOC,
      Self::Cod | Self::Coc | Self::Qcd | Self::Qcc | Self::Rgn | Self::Com | Self::Poc => {
        DecoderState::MH | DecoderState::TPH
      }
      Self::Cap | Self::Cpf | Self::Tlm | Self::Plm | Self::Ppm | Self::Crg | Self::Cbd => {
        DecoderState::MH
      }
      Self::Plt | Self::Ppt => DecoderState::TPH,
      Self::Sop | Self::Eph => DecoderState::NONE,
      Self::Unknown(_) => DecoderState::MH | DecoderState::TPH,
    }
  }

  pub fn has_length(self) -> bool {
    !matches!(self, Self::Soc | Self::Sod | Self::Eoc | Self::Eph)
  }
}

#[derive(Debug, Clone, Copy)]
struct TlmEntry {
  tile: Option<u16>,
  length: u32,
}

/// Per-image coding parameters assembled from the main header.
#[derive(Debug, Clone, Default)]
pub(crate) struct CodingParams {
  pub bounds: Rect,
  pub tile_origin: Point,
  pub tile_size: Point,
  pub comps: Vec<CompInfo>,
  pub default_tcp: TileCodingParams,
  pub ht: bool,
}

impl CodingParams {
  pub fn tiles_wide(&self) -> u32 {
    ceildiv(
      self.bounds.x1.saturating_sub(self.tile_origin.x),
      self.tile_size.x,
    )
  }

  pub fn tiles_high(&self) -> u32 {
    ceildiv(
      self.bounds.y1.saturating_sub(self.tile_origin.y),
      self.tile_size.y,
    )
  }

  pub fn num_tiles(&self) -> u32 {
    self.tiles_wide() * self.tiles_high()
  }

  /// Canvas rectangle of tile `index` (raster order).
  pub fn tile_rect(&self, index: u16) -> Rect {
    let tw = self.tiles_wide();
    let tx = index as u32 % tw;
    let ty = index as u32 / tw;
    let x0 = self.tile_origin.x + tx * self.tile_size.x;
    let y0 = self.tile_origin.y + ty * self.tile_size.y;
    Rect::new(
      x0.max(self.bounds.x0),
      y0.max(self.bounds.y0),
      (x0 + self.tile_size.x).min(self.bounds.x1),
      (y0 + self.tile_size.y).min(self.bounds.y1),
    )
  }
}

/// Decode-time controls. The region is given either in canvas pixels or
/// normalised to the image bounds.
#[derive(Clone, Default)]
pub struct DecompressParams {
  /// Trailing resolutions to drop.
  pub reduce: u32,
  /// Quality layers to decode; `None` decodes all.
  pub layers: Option<u16>,
  /// Decode region in canvas coordinates.
  pub region: Option<Rect>,
  /// Decode region normalised to `[0,1]` against the image bounds.
  pub region_normalised: Option<[f64; 4]>,
  /// Decode exactly this tile.
  pub tile_index: Option<u16>,
  /// Allocate whole tiles even when a region is set.
  pub whole_tile: bool,
  /// Single-tile path keeps the tile's own buffer; no composite copy.
  pub skip_allocate_composite: bool,
  /// Tile-row scheduling window for back-pressure.
  pub initial_rows: u16,
  pub next_rows: u16,
  /// External cancellation flag, polled at block and tile-part
  /// boundaries.
  pub cancel: Option<Arc<AtomicBool>>,
}

/// Supplies tile byte ranges for TLM random access. A plain slice
/// implements it by sub-slicing.
pub trait TileFetcher: Sync {
  fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

impl TileFetcher for &[u8] {
  fn fetch(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
    let start = offset as usize;
    let end = start
      .checked_add(len)
      .filter(|&e| e <= self.len())
      .ok_or(Error::TruncatedStream("TLM tile range"))?;
    Ok(self[start..end].to_vec())
  }
}

/// Coordinates the rolling tile-row window between the scheduler and
/// the consumer of completed rows.
pub(crate) struct RowCompletion {
  state: Mutex<RowState>,
  cond: Condvar,
}

struct RowState {
  tiles_left_in_row: Vec<u32>,
  window_head: u32,
  window_tail: u32,
  total_rows: u32,
}

impl RowCompletion {
  pub fn new(tiles_per_row: Vec<u32>, initial_window: u32) -> Self {
    let total_rows = tiles_per_row.len() as u32;
    let mut head = 0u32;
    while (head as usize) < tiles_per_row.len() && tiles_per_row[head as usize] == 0 {
      head += 1;
    }
    Self {
      state: Mutex::new(RowState {
        tiles_left_in_row: tiles_per_row,
        window_head: head,
        window_tail: initial_window.min(total_rows).max(head),
        total_rows,
      }),
      cond: Condvar::new(),
    }
  }

  /// Rows currently open for scheduling.
  pub fn window(&self) -> (u32, u32) {
    let s = self.state.lock().unwrap();
    (s.window_head, s.window_tail)
  }

  /// Extends the scheduling window by `n` rows.
  pub fn schedule_more(&self, n: u32) {
    let mut s = self.state.lock().unwrap();
    s.window_tail = (s.window_tail + n).min(s.total_rows);
    self.cond.notify_all();
  }

  /// Records a finished tile; advances the head past fully decoded
  /// rows and wakes the scheduler.
  pub fn complete(&self, tile_row: u32) {
    let mut s = self.state.lock().unwrap();
    if let Some(left) = s.tiles_left_in_row.get_mut(tile_row as usize) {
      *left = left.saturating_sub(1);
    }
    while (s.window_head as usize) < s.tiles_left_in_row.len()
      && s.tiles_left_in_row[s.window_head as usize] == 0
    {
      s.window_head += 1;
    }
    self.cond.notify_all();
  }

  /// Blocks until every row below `row` has completed.
  pub fn wait_rows(&self, row: u32) {
    let mut s = self.state.lock().unwrap();
    while s.window_head < row.min(s.total_rows) {
      s = self.cond.wait(s).unwrap();
    }
  }
}

fn rd_u8(d: &[u8], off: usize) -> Result<u8> {
  d.get(off)
    .copied()
    .ok_or(Error::TruncatedStream("marker payload"))
}

fn rd_u16(d: &[u8], off: usize) -> Result<u16> {
  if off + 2 > d.len() {
    return Err(Error::TruncatedStream("marker payload"));
  }
  Ok(BigEndian::read_u16(&d[off..]))
}

fn rd_u32(d: &[u8], off: usize) -> Result<u32> {
  if off + 4 > d.len() {
    return Err(Error::TruncatedStream("marker payload"));
  }
  Ok(BigEndian::read_u32(&d[off..]))
}

/// Stateful decoder over one code stream. Parsed tiles are cached so a
/// later call with more layers or a wider region re-decompresses
/// differentially.
#[derive(Debug)]
pub struct Codestream<'a> {
  data: &'a [u8],
  pub(crate) cp: CodingParams,
  main_header_end: usize,
  tiles: HashMap<u16, TileProcessor>,
  tlm: Vec<TlmEntry>,
  ppm_records: Vec<Vec<u8>>,
  /// Per-tile failures that did not abort the whole stream.
  pub tile_errors: Vec<(u16, Error)>,
  scanned: bool,
  missing_eoc_warned: bool,
}

impl<'a> Codestream<'a> {
  /// Parses the main header (SOC through the byte before the first
  /// SOT).
  pub fn new(data: &'a [u8]) -> Result<Self> {
    let mut cs = Codestream {
      data,
      cp: CodingParams::default(),
      main_header_end: 0,
      tiles: HashMap::new(),
      tlm: Vec::new(),
      ppm_records: Vec::new(),
      tile_errors: Vec::new(),
      scanned: false,
      missing_eoc_warned: false,
    };
    cs.parse_main_header()?;
    Ok(cs)
  }

  pub fn image_bounds(&self) -> Rect {
    self.cp.bounds
  }

  pub fn num_components(&self) -> usize {
    self.cp.comps.len()
  }

  fn parse_main_header(&mut self) -> Result<()> {
    let d = self.data;
    let mut off = 0usize;
    let mut state = DecoderState::MHSOC;
    loop {
      let code = rd_u16(d, off)?;
      let marker = Marker::from(code);
      if code < 0xff00 {
        return Err(Error::InvalidMarker(code));
      }
      if marker == Marker::Sot {
        if !state.contains(DecoderState::MH) {
          return Err(Error::InvalidMarker(code));
        }
        self.main_header_end = off;
        return Ok(());
      }
      if !marker.states().intersects(state) {
        // Unknown or out-of-place markers are fatal in the main header.
        return Err(Error::InvalidMarker(code));
      }
      off += 2;
      if !marker.has_length() {
        match marker {
          Marker::Soc => state = DecoderState::MHSIZ,
          Marker::Eoc => return Err(Error::TruncatedStream("empty code stream")),
          _ => {}
        }
        continue;
      }
      let lseg = rd_u16(d, off)? as usize;
      if lseg < 2 || off + lseg > d.len() {
        return Err(Error::TruncatedStream("marker segment"));
      }
      let payload = &d[off + 2..off + lseg];
      match marker {
        Marker::Siz => {
          self.read_siz(payload)?;
          state = DecoderState::MH;
        }
        Marker::Cap => self.read_cap(payload)?,
        Marker::Cod => {
          let tcp = &mut self.cp.default_tcp;
          read_cod(payload, tcp)?;
        }
        Marker::Coc => {
          let ncomps = self.cp.comps.len();
          read_coc(payload, ncomps, &mut self.cp.default_tcp)?;
        }
        Marker::Qcd => {
          read_qcd(payload, &mut self.cp.default_tcp, None)?;
        }
        Marker::Qcc => {
          let ncomps = self.cp.comps.len();
          read_qcc(payload, ncomps, &mut self.cp.default_tcp)?;
        }
        Marker::Rgn => {
          let ncomps = self.cp.comps.len();
          read_rgn(payload, ncomps, &mut self.cp.default_tcp)?;
        }
        Marker::Poc => {
          let ncomps = self.cp.comps.len() as u16;
          let pocs = read_poc(payload, ncomps)?;
          self.cp.default_tcp.pocs = pocs;
        }
        Marker::Tlm => self.read_tlm(payload)?,
        Marker::Ppm => {
          self.read_ppm(payload)?;
        }
        Marker::Com => {
          debug!("COM: {} bytes", payload.len());
        }
        Marker::Crg | Marker::Plm | Marker::Cbd | Marker::Cpf => {
          debug!("{:?}: {} bytes (recorded, not interpreted)", marker, payload.len());
        }
        other => {
          return Err(Error::InvalidMarker(other.as_u16()));
        }
      }
      off += lseg;
    }
  }

  fn read_siz(&mut self, p: &[u8]) -> Result<()> {
    // Exactly one SIZ per code stream.
    if !self.cp.comps.is_empty() {
      return Err(Error::InvalidMarker(Marker::Siz.as_u16()));
    }
    let _rsiz = rd_u16(p, 0)?;
    let x1 = rd_u32(p, 2)?;
    let y1 = rd_u32(p, 6)?;
    let x0 = rd_u32(p, 10)?;
    let y0 = rd_u32(p, 14)?;
    let tw = rd_u32(p, 18)?;
    let th = rd_u32(p, 22)?;
    let tx0 = rd_u32(p, 26)?;
    let ty0 = rd_u32(p, 30)?;
    let ncomps = rd_u16(p, 34)? as usize;
    if x0 >= x1 || y0 >= y1 || tw == 0 || th == 0 || ncomps == 0 {
      return Err(Error::InvalidParameter("SIZ geometry".into()));
    }
    if tx0 > x0 || ty0 > y0 {
      return Err(Error::InvalidParameter(
        "tile origin beyond image origin".into(),
      ));
    }
    self.cp.bounds = Rect::new(x0, y0, x1, y1);
    self.cp.tile_size = Point::new(tw, th);
    self.cp.tile_origin = Point::new(tx0, ty0);
    for c in 0..ncomps {
      let base = 36 + c * 3;
      let ssiz = rd_u8(p, base)?;
      let dx = rd_u8(p, base + 1)? as u32;
      let dy = rd_u8(p, base + 2)? as u32;
      if dx == 0 || dx > 4 || dy == 0 || dy > 4 {
        return Err(Error::InvalidParameter("component sub-sampling".into()));
      }
      if (ssiz & 0x7f) + 1 > 16 {
        return Err(Error::Unsupported("component precision above 16 bits"));
      }
      self.cp.comps.push(CompInfo {
        dx,
        dy,
        precision: (ssiz & 0x7f) + 1,
        signed: ssiz & 0x80 != 0,
      });
    }
    self.cp.default_tcp.tccps = vec![TileCompParams::default(); ncomps];
    if self.cp.num_tiles() > u16::MAX as u32 {
      return Err(Error::InvalidParameter("too many tiles".into()));
    }
    Ok(())
  }

  fn read_cap(&mut self, p: &[u8]) -> Result<()> {
    let pcap = rd_u32(p, 0)?;
    // Part 15 (HTJ2K) capability is bit 15 counted from the MSB.
    if pcap & (1 << (32 - 15)) != 0 {
      self.cp.ht = true;
      self.cp.default_tcp.ht = true;
    }
    Ok(())
  }

  fn read_tlm(&mut self, p: &[u8]) -> Result<()> {
    let _ztlm = rd_u8(p, 0)?;
    let stlm = rd_u8(p, 1)?;
    let st = (stlm >> 4) & 0x3;
    let sp = (stlm >> 6) & 0x1;
    let entry = (match st {
      0 => 0,
      1 => 1,
      2 => 2,
      _ => return Err(Error::CorruptTlm("invalid ST field")),
    }) + if sp == 1 { 4 } else { 2 };
    let mut off = 2usize;
    let mut seq = self.tlm.len() as u16;
    while off + entry <= p.len() {
      let tile = match st {
        0 => {
          let t = seq;
          seq += 1;
          Some(t)
        }
        1 => Some(rd_u8(p, off)? as u16),
        _ => Some(rd_u16(p, off)?),
      };
      off += st as usize;
      let length = if sp == 1 {
        rd_u32(p, off)?
      } else {
        rd_u16(p, off)? as u32
      };
      off += if sp == 1 { 4 } else { 2 };
      self.tlm.push(TlmEntry { tile, length });
    }
    Ok(())
  }

  fn read_ppm(&mut self, p: &[u8]) -> Result<()> {
    // Zppm then Nppm-prefixed packed header records.
    let _z = rd_u8(p, 0)?;
    let mut off = 1usize;
    while off + 4 <= p.len() {
      let n = rd_u32(p, off)? as usize;
      off += 4;
      if off + n > p.len() {
        return Err(Error::TruncatedStream("PPM record"));
      }
      self.ppm_records.push(p[off..off + n].to_vec());
      off += n;
    }
    Ok(())
  }

  /// Walks tile parts sequentially, creating tile processors and
  /// collecting bodies. Tolerates a missing EOC with a warning.
  fn scan_tiles(&mut self, params: &DecompressParams) -> Result<()> {
    if self.scanned {
      return Ok(());
    }
    let d = self.data;
    let mut off = self.main_header_end;
    let mut ppm_next = 0usize;
    loop {
      // Tile-part boundary: honour external cancellation.
      if let Some(c) = params.cancel.as_deref() {
        if c.load(std::sync::atomic::Ordering::Relaxed) {
          return Err(Error::Cancelled);
        }
      }
      if off + 2 > d.len() {
        if !self.missing_eoc_warned {
          warn!("code stream ends without EOC");
          self.missing_eoc_warned = true;
        }
        break;
      }
      let code = rd_u16(d, off)?;
      match Marker::from(code) {
        Marker::Eoc => break,
        Marker::Sot => {}
        other => {
          warn!("unexpected marker {:#06x} between tile parts", other.as_u16());
          break;
        }
      }
      // SOT payload.
      let lsot = rd_u16(d, off + 2)? as usize;
      if lsot != 10 {
        return Err(Error::CorruptSot {
          tile: 0,
          reason: "Lsot must be 10",
        });
      }
      let isot = rd_u16(d, off + 4)?;
      let psot = rd_u32(d, off + 6)? as usize;
      let tpsot = rd_u8(d, off + 10)?;
      let tnsot = rd_u8(d, off + 11)?;
      let part_end = if psot == 0 {
        d.len()
      } else {
        off + psot
      };
      if part_end > d.len() {
        warn!("tile {} part exceeds stream; truncating", isot);
      }
      let part_end = part_end.min(d.len());

      let tile_valid = (isot as u32) < self.cp.num_tiles();
      if !tile_valid {
        self
          .tile_errors
          .push((isot, Error::CorruptSot { tile: isot, reason: "tile index out of range" }));
        off = part_end;
        continue;
      }
      if tnsot != 0 && tpsot >= tnsot {
        self.tile_errors.push((
          isot,
          Error::CorruptSot {
            tile: isot,
            reason: "TPsot >= TNsot",
          },
        ));
        off = part_end;
        continue;
      }

      let cp = &self.cp;
      let tile_rect = cp.tile_rect(isot);
      let whole = params.whole_tile || params.region.is_none();
      let reduce = params.reduce;
      let tp = self.tiles.entry(isot).or_insert_with(|| {
        TileProcessor::new(
          isot,
          tile_rect,
          cp.default_tcp.clone(),
          cp.comps.clone(),
          reduce,
          whole,
        )
      });
      if tpsot != tp.parts_seen {
        self.tile_errors.push((
          isot,
          Error::CorruptSot {
            tile: isot,
            reason: "tile parts out of order",
          },
        ));
        off = part_end;
        continue;
      }
      tp.expected_parts = tnsot;

      // Tile-part header markers until SOD.
      let mut hoff = off + 12;
      let mut sod = None;
      while hoff + 2 <= part_end {
        let mcode = rd_u16(d, hoff)?;
        let marker = Marker::from(mcode);
        if marker == Marker::Sod {
          sod = Some(hoff + 2);
          break;
        }
        if !marker.has_length() {
          warn!("unexpected marker {:#06x} in tile header", mcode);
          hoff += 2;
          continue;
        }
        let lseg = rd_u16(d, hoff + 2)? as usize;
        if lseg < 2 || hoff + 2 + lseg > part_end {
          self.tile_errors.push((
            isot,
            Error::CorruptSot {
              tile: isot,
              reason: "tile header overruns tile part",
            },
          ));
          break;
        }
        let payload = &d[hoff + 4..hoff + 2 + lseg];
        let ncomps = self.cp.comps.len();
        let res = match marker {
          Marker::Cod => read_cod(payload, &mut tp.tcp),
          Marker::Coc => read_coc(payload, ncomps, &mut tp.tcp),
          Marker::Qcd => read_qcd(payload, &mut tp.tcp, None),
          Marker::Qcc => read_qcc(payload, ncomps, &mut tp.tcp),
          Marker::Rgn => read_rgn(payload, ncomps, &mut tp.tcp),
          Marker::Poc => read_poc(payload, ncomps as u16).map(|p| tp.tcp.pocs = p),
          Marker::Ppt => {
            tp.tcp.ppt = true;
            tp.tcp
              .ppt_data
              .extend_from_slice(payload.get(1..).unwrap_or(&[]));
            Ok(())
          }
          Marker::Com | Marker::Plt => Ok(()),
          Marker::Unknown(v) => {
            warn!("unknown marker {:#06x} in tile header; skipped", v);
            Ok(())
          }
          other => {
            warn!("marker {:#06x} out of place in tile header", other.as_u16());
            Ok(())
          }
        };
        if let Err(e) = res {
          self.tile_errors.push((isot, e));
        }
        hoff += 2 + lseg;
      }

      if let Some(body_start) = sod {
        // A PPM stream supplies this tile part's packed headers.
        if !self.ppm_records.is_empty() && ppm_next < self.ppm_records.len() {
          let rec = self.ppm_records[ppm_next].clone();
          ppm_next += 1;
          tp.tcp.ppt = true;
          tp.tcp.ppt_data.extend_from_slice(&rec);
        }
        tp.push_part(d[body_start..part_end].to_vec());
      } else {
        self.tile_errors.push((
          isot,
          Error::CorruptSot {
            tile: isot,
            reason: "missing SOD",
          },
        ));
      }
      off = part_end;
    }
    self.scanned = true;
    Ok(())
  }

  /// Validates the TLM table against the on-the-wire tile parts and
  /// returns `(offset, length, tile)` per part, plus the error that
  /// stopped validation. Entries past a disagreement are unreliable,
  /// so ranging stops there; the valid prefix still decodes.
  fn tlm_ranges(&self) -> (Vec<(u64, usize, u16)>, Option<Error>) {
    let mut out = Vec::new();
    let mut off = self.main_header_end as u64;
    for e in &self.tlm {
      if e.length < 14 {
        return (out, Some(Error::CorruptTlm("tile part length shorter than SOT")));
      }
      let avail = (self.data.len() as u64).saturating_sub(off) as usize;
      let hdr = match (&self.data[..]).fetch(off, 12.min(avail)) {
        Ok(h) => h,
        Err(e) => return (out, Some(e)),
      };
      if hdr.len() < 12 || BigEndian::read_u16(&hdr) != Marker::Sot.as_u16() {
        return (out, Some(Error::CorruptTlm("no SOT at TLM offset")));
      }
      let isot = BigEndian::read_u16(&hdr[4..]);
      let psot = BigEndian::read_u32(&hdr[6..]);
      if let Some(t) = e.tile {
        if t != isot {
          return (out, Some(Error::CorruptTlm("TLM tile index mismatch")));
        }
      }
      if psot != 0 && psot != e.length {
        return (out, Some(Error::CorruptTlm("TLM length disagrees with SOT")));
      }
      out.push((off, e.length as usize, isot));
      off += e.length as u64;
    }
    (out, None)
  }

  /// Decodes the slated tiles and composites them into an image.
  pub fn decompress(&mut self, params: &DecompressParams) -> Result<Image> {
    let region = self.resolve_region(params)?;
    if let Some(tile) = params.tile_index {
      return self.decompress_single(tile, params, region.as_ref());
    }

    if !self.tlm.is_empty() && !self.scanned {
      match self.decompress_tlm(params, region.as_ref()) {
        Ok(img) => return Ok(img),
        Err(e) => {
          warn!("TLM random access failed ({}); falling back to sequential", e);
        }
      }
    }

    self.scan_tiles(params)?;
    self.decompress_scanned(params, region.as_ref())
  }

  fn resolve_region(&self, params: &DecompressParams) -> Result<Option<Rect>> {
    if let Some(r) = params.region {
      return Ok(Some(r));
    }
    if let Some([nx0, ny0, nx1, ny1]) = params.region_normalised {
      if !(0.0..=1.0).contains(&nx0) || nx1 <= nx0 || ny1 <= ny0 {
        return Err(Error::InvalidParameter("normalised region".into()));
      }
      let b = self.cp.bounds;
      let w = (b.x1 - b.x0) as f64;
      let h = (b.y1 - b.y0) as f64;
      return Ok(Some(Rect::new(
        b.x0 + (nx0 * w) as u32,
        b.y0 + (ny0 * h) as u32,
        b.x0 + (nx1 * w).ceil() as u32,
        b.y0 + (ny1 * h).ceil() as u32,
      )));
    }
    Ok(None)
  }

  fn slated_tiles(&self, region: Option<&Rect>) -> Vec<u16> {
    let n = self.cp.num_tiles() as u16;
    (0..n)
      .filter(|&t| match region {
        None => true,
        Some(r) => self.cp.tile_rect(t).intersects(r),
      })
      .collect()
  }

  fn new_image(&self, region: Option<&Rect>, reduce: u32) -> Image {
    let bounds = match region {
      Some(r) => *r,
      None => self.cp.bounds,
    };
    let comps = self
      .cp
      .comps
      .iter()
      .map(|c| ImageComp {
        dx: c.dx,
        dy: c.dy,
        precision: c.precision,
        signed: c.signed,
        comp_type: ComponentType::Colour,
        ..Default::default()
      })
      .collect();
    let mut img = Image {
      bounds: self.cp.bounds,
      comps,
      packing: None,
    };
    let clipped = img.clip_region(&bounds);
    img.alloc_for_region(&clipped, reduce);
    img.bounds = clipped;
    img
  }

  fn decompress_scanned(
    &mut self,
    params: &DecompressParams,
    region: Option<&Rect>,
  ) -> Result<Image> {
    let slate = self.slated_tiles(region);
    for (t, tp) in &self.tiles {
      if !tp.all_parts_in() && tp.expected_parts != 0 {
        debug!(
          "tile {}: {}/{} tile parts arrived",
          t, tp.parts_seen, tp.expected_parts
        );
      }
    }
    let image = Mutex::new(self.new_image(region, params.reduce));
    let tiles_wide = self.cp.tiles_wide().max(1);
    let rows = self.cp.tiles_high().max(1);
    // Only rows with slated, present tiles count towards completion.
    let mut per_row = vec![0u32; rows as usize];
    for t in &slate {
      if self.tiles.contains_key(t) {
        per_row[(*t as u32 / tiles_wide) as usize] += 1;
      }
    }
    let window = (params.initial_rows.max(1) as u32).min(rows);
    let rc = RowCompletion::new(per_row, window);
    let max_layers = params
      .layers
      .unwrap_or(self.cp.default_tcp.num_layers.max(1));
    let cancel = params.cancel.as_deref();
    let errors = Mutex::new(Vec::new());

    let mut next_row = 0u32;
    while next_row < rows {
      let (_, hi) = rc.window();
      let hi = hi.min(rows);
      if hi <= next_row {
        rc.schedule_more(params.next_rows.max(1) as u32);
        continue;
      }
      let lo = next_row;
      let mut batch: Vec<(u16, &mut TileProcessor)> = self
        .tiles
        .iter_mut()
        .filter(|(t, _)| {
          let row = **t as u32 / tiles_wide;
          slate.contains(*t) && row >= lo && row < hi
        })
        .map(|(t, tp)| (*t, tp))
        .collect();
      batch.sort_by_key(|(t, _)| *t);
      let non_empty = !batch.is_empty();
      batch.par_iter_mut().for_each(|(tno, tp)| {
        let row = *tno as u32 / tiles_wide;
        if let Err(e) = decode_one_tile(tp, max_layers, false, cancel, region, &image, params) {
          warn!("tile {} failed: {}", tno, e);
          errors.lock().unwrap().push((*tno, e));
        }
        rc.complete(row);
      });
      if non_empty {
        rc.wait_rows(hi);
      }
      next_row = hi;
      rc.schedule_more(params.next_rows.max(1) as u32);
    }

    let errs = errors.into_inner().unwrap();
    if errs.iter().any(|(_, e)| *e == Error::Cancelled) {
      return Err(Error::Cancelled);
    }
    self.tile_errors.extend(errs);
    Ok(image.into_inner().unwrap())
  }

  fn decompress_tlm(
    &mut self,
    params: &DecompressParams,
    region: Option<&Rect>,
  ) -> Result<Image> {
    let (ranges, tlm_err) = self.tlm_ranges();
    if let Some(e) = tlm_err {
      if ranges.is_empty() {
        return Err(e);
      }
      // The broken entry's tile (and everything after it) is lost;
      // the valid prefix still decodes.
      warn!("{}", e);
      let bad_tile = ranges.last().map(|(_, _, t)| t + 1).unwrap_or(0);
      self.tile_errors.push((bad_tile, e));
    }
    // Group parts per tile, preserving order.
    let mut per_tile: HashMap<u16, Vec<(u64, usize)>> = HashMap::new();
    for (off, len, tile) in &ranges {
      per_tile.entry(*tile).or_default().push((*off, *len));
    }
    let slate = self.slated_tiles(region);
    let max_layers = params
      .layers
      .unwrap_or(self.cp.default_tcp.num_layers.max(1));
    let cancel = params.cancel.as_deref();
    let image = Mutex::new(self.new_image(region, params.reduce));
    let errors = Mutex::new(Vec::new());
    let cp = self.cp.clone();
    let data = self.data;
    let whole = params.whole_tile || region.is_none();

    let decoded: Vec<(u16, TileProcessor)> = slate
      .par_iter()
      .filter_map(|&tno| {
        let parts = per_tile.get(&tno)?;
        let mut tp = TileProcessor::new(
          tno,
          cp.tile_rect(tno),
          cp.default_tcp.clone(),
          cp.comps.clone(),
          params.reduce,
          whole,
        );
        for &(off, len) in parts {
          let bytes = match (&data[..]).fetch(off, len) {
            Ok(b) => b,
            Err(e) => {
              errors.lock().unwrap().push((tno, e));
              return None;
            }
          };
          // Find SOD inside the fetched part.
          match split_tile_part(&bytes) {
            Ok((tnsot, body)) => {
              tp.expected_parts = tnsot;
              tp.push_part(body);
            }
            Err(e) => {
              errors.lock().unwrap().push((tno, e));
              return None;
            }
          }
        }
        let res = decode_one_tile(&mut tp, max_layers, false, cancel, region, &image, params);
        match res {
          Ok(()) => Some((tno, tp)),
          Err(e) => {
            errors.lock().unwrap().push((tno, e));
            None
          }
        }
      })
      .collect();

    for (tno, tp) in decoded {
      self.tiles.insert(tno, tp);
    }
    let errs = errors.into_inner().unwrap();
    if errs.iter().any(|(_, e)| *e == Error::Cancelled) {
      return Err(Error::Cancelled);
    }
    self.tile_errors.extend(errs);
    Ok(image.into_inner().unwrap())
  }

  /// Single-tile decode with differential re-decompression across
  /// calls: layer increments and region growth replay only affected
  /// passes.
  fn decompress_single(
    &mut self,
    tile: u16,
    params: &DecompressParams,
    region: Option<&Rect>,
  ) -> Result<Image> {
    if tile as u32 >= self.cp.num_tiles() {
      return Err(Error::InvalidParameter(format!("tile {} out of range", tile)));
    }
    self.scan_tiles(params)?;
    let max_layers = params
      .layers
      .unwrap_or(self.cp.default_tcp.num_layers.max(1));
    let cancel = params.cancel.as_deref();

    let tp = self
      .tiles
      .get_mut(&tile)
      .ok_or(Error::TruncatedStream("tile has no tile parts"))?;
    tp.parse_packets(max_layers)?;
    tp.decompress_blocks(max_layers, true, cancel)?;
    tp.reconstruct(region)?;
    debug!("tile {}: decoded through layer {}", tile, tp.decoded_layers);

    if params.skip_allocate_composite {
      // The tile keeps its own buffers; no composite copy happens.
      let mut img = self.new_image(Some(&self.cp.tile_rect(tile)), params.reduce);
      let tp = self.tiles.get_mut(&tile).unwrap();
      for (compno, comp) in tp.comps.iter_mut().enumerate() {
        img.comps[compno].rect = comp.out_rect;
        img.comps[compno].data = std::mem::take(&mut comp.out);
      }
      return Ok(img);
    }
    let mut img = self.new_image(region, params.reduce);
    let tp = self.tiles.get(&tile).unwrap();
    for (compno, comp) in tp.comps.iter().enumerate() {
      img.composite(compno, &comp.out_rect, &comp.out);
    }
    Ok(img)
  }
}

/// Decodes one tile end to end and composites it under the image lock.
fn decode_one_tile(
  tp: &mut TileProcessor,
  max_layers: u16,
  cached: bool,
  cancel: Option<&AtomicBool>,
  region: Option<&Rect>,
  image: &Mutex<Image>,
  _params: &DecompressParams,
) -> Result<()> {
  tp.parse_packets(max_layers)?;
  tp.decompress_blocks(max_layers, cached, cancel)?;
  tp.reconstruct(region)?;
  let mut img = image.lock().unwrap();
  for compno in 0..tp.comps.len() {
    let comp = &tp.comps[compno];
    img.composite(compno, &comp.out_rect, &comp.out);
  }
  Ok(())
}

/// Splits one fetched tile part into `(TNsot, body)`.
fn split_tile_part(part: &[u8]) -> Result<(u8, Vec<u8>)> {
  if part.len() < 14 || BigEndian::read_u16(part) != Marker::Sot.as_u16() {
    return Err(Error::CorruptTlm("tile part does not start with SOT"));
  }
  let tnsot = part[11];
  let mut off = 12usize;
  while off + 2 <= part.len() {
    let code = BigEndian::read_u16(&part[off..]);
    let marker = Marker::from(code);
    if marker == Marker::Sod {
      return Ok((tnsot, part[off + 2..].to_vec()));
    }
    if !marker.has_length() {
      off += 2;
      continue;
    }
    let lseg = rd_u16(part, off + 2)? as usize;
    off += 2 + lseg;
  }
  Err(Error::CorruptSot {
    tile: BigEndian::read_u16(&part[4..]),
    reason: "missing SOD",
  })
}

// ------------------------------------------------------------------- //
// Marker payload readers shared by main and tile headers               //
// ------------------------------------------------------------------- //

fn read_spcod(p: &[u8], off: usize, explicit_precincts: bool, tccp: &mut TileCompParams) -> Result<usize> {
  let nl = rd_u8(p, off)? as u32;
  if nl > crate::consts::MAX_DECOMP_LEVELS {
    return Err(Error::InvalidParameter("too many decomposition levels".into()));
  }
  tccp.num_resolutions = nl + 1;
  let cw = rd_u8(p, off + 1)? as u32 + 2;
  let ch = rd_u8(p, off + 2)? as u32 + 2;
  let dim_ok = |d: u32| {
    (crate::consts::MIN_CBLK_LOG2_DIM..=crate::consts::MAX_CBLK_LOG2_DIM).contains(&d)
  };
  // The 4096-sample cap falls out of the exponent sum.
  if !dim_ok(cw) || !dim_ok(ch) || cw + ch > 12 {
    return Err(Error::InvalidParameter("code block size".into()));
  }
  tccp.cblk_expn = Point::new(cw, ch);
  tccp.cblk_sty = CblkSty::from_bits_truncate(rd_u8(p, off + 3)?);
  tccp.reversible = rd_u8(p, off + 4)? == 1;
  let mut used = 5;
  tccp.precinct_expn.clear();
  if explicit_precincts {
    for r in 0..=nl {
      let b = rd_u8(p, off + 5 + r as usize)?;
      tccp
        .precinct_expn
        .push(Point::new((b & 0x0f) as u32, (b >> 4) as u32));
      used += 1;
    }
  }
  Ok(used)
}

fn read_cod(p: &[u8], tcp: &mut TileCodingParams) -> Result<()> {
  let scod = rd_u8(p, 0)?;
  tcp.csty = CodingStyle::from_bits_truncate(scod & 0x07);
  let explicit_precincts = tcp.csty.contains(CodingStyle::PRECINCTS);
  let prog = rd_u8(p, 1)?;
  tcp.prog_order =
    ProgressionOrder::from_u8(prog).ok_or(Error::InvalidParameter("progression order".into()))?;
  tcp.num_layers = rd_u16(p, 2)?;
  if tcp.num_layers == 0 {
    return Err(Error::InvalidParameter("zero layers".into()));
  }
  tcp.mct = rd_u8(p, 4)? & 1 != 0;
  let mut proto = TileCompParams::default();
  read_spcod(p, 5, explicit_precincts, &mut proto)?;
  for tccp in tcp.tccps.iter_mut() {
    let quant_backup = (
      tccp.quant_style,
      tccp.stepsizes.clone(),
      tccp.num_guard_bits,
      tccp.roi_shift,
    );
    *tccp = proto.clone();
    tccp.quant_style = quant_backup.0;
    tccp.stepsizes = quant_backup.1;
    tccp.num_guard_bits = quant_backup.2;
    tccp.roi_shift = quant_backup.3;
  }
  Ok(())
}

fn comp_index(p: &[u8], ncomps: usize) -> Result<(usize, usize)> {
  if ncomps <= 256 {
    Ok((rd_u8(p, 0)? as usize, 1))
  } else {
    Ok((rd_u16(p, 0)? as usize, 2))
  }
}

fn read_coc(p: &[u8], ncomps: usize, tcp: &mut TileCodingParams) -> Result<()> {
  let (compno, used) = comp_index(p, ncomps)?;
  if compno >= ncomps {
    return Err(Error::InvalidParameter("COC component index".into()));
  }
  let scoc = rd_u8(p, used)?;
  let explicit_precincts = scoc & 1 != 0;
  let tccp = &mut tcp.tccps[compno];
  read_spcod(p, used + 1, explicit_precincts, tccp)?;
  Ok(())
}

fn read_sqcx(p: &[u8], off: usize, tccp: &mut TileCompParams) -> Result<()> {
  let sqcd = rd_u8(p, off)?;
  tccp.num_guard_bits = sqcd >> 5;
  let style = sqcd & 0x1f;
  let body = &p[off + 1..];
  tccp.stepsizes.clear();
  match style {
    0 => {
      tccp.quant_style = QuantStyle::NoQuant;
      for &b in body {
        tccp.stepsizes.push((b >> 3, 0));
      }
    }
    1 => {
      tccp.quant_style = QuantStyle::ScalarDerived;
      let v = rd_u16(body, 0)?;
      let expn0 = (v >> 11) as u8;
      let mant = v & 0x7ff;
      // Expand the single signalled pair across every band: one step
      // of the exponent per decomposition level.
      let max_bands = 3 * 32 + 1;
      for i in 0..max_bands as u32 {
        let expn = expn0.saturating_sub((i.saturating_sub(1) / 3) as u8);
        tccp.stepsizes.push((expn, mant));
      }
    }
    2 => {
      tccp.quant_style = QuantStyle::ScalarExpounded;
      let mut i = 0;
      while i + 2 <= body.len() {
        let v = rd_u16(body, i)?;
        tccp.stepsizes.push(((v >> 11) as u8, v & 0x7ff));
        i += 2;
      }
    }
    _ => return Err(Error::InvalidParameter("quantisation style".into())),
  }
  Ok(())
}

fn read_qcd(p: &[u8], tcp: &mut TileCodingParams, only: Option<usize>) -> Result<()> {
  match only {
    Some(c) => read_sqcx(p, 0, &mut tcp.tccps[c]),
    None => {
      let mut proto = tcp.tccps.first().cloned().unwrap_or_default();
      read_sqcx(p, 0, &mut proto)?;
      for tccp in tcp.tccps.iter_mut() {
        tccp.quant_style = proto.quant_style;
        tccp.num_guard_bits = proto.num_guard_bits;
        tccp.stepsizes = proto.stepsizes.clone();
      }
      Ok(())
    }
  }
}

fn read_qcc(p: &[u8], ncomps: usize, tcp: &mut TileCodingParams) -> Result<()> {
  let (compno, used) = comp_index(p, ncomps)?;
  if compno >= ncomps {
    return Err(Error::InvalidParameter("QCC component index".into()));
  }
  read_sqcx(p, used, &mut tcp.tccps[compno])
}

fn read_rgn(p: &[u8], ncomps: usize, tcp: &mut TileCodingParams) -> Result<()> {
  let (compno, used) = comp_index(p, ncomps)?;
  if compno >= ncomps {
    return Err(Error::InvalidParameter("RGN component index".into()));
  }
  let srgn = rd_u8(p, used)?;
  if srgn != 0 {
    return Err(Error::Unsupported("non-implicit ROI style"));
  }
  let shift = rd_u8(p, used + 1)?;
  if shift > 37 {
    return Err(Error::InvalidParameter("RGN shift out of range".into()));
  }
  tcp.tccps[compno].roi_shift = shift;
  Ok(())
}

fn read_poc(p: &[u8], ncomps: u16) -> Result<Vec<Poc>> {
  let comp_bytes = if ncomps <= 256 { 1 } else { 2 };
  let entry = 2 + 2 * comp_bytes + 2 + 1 + 1;
  let mut out = Vec::new();
  let mut off = 0usize;
  while off + entry <= p.len() {
    let res0 = rd_u8(p, off)? as u32;
    off += 1;
    let comp0 = if comp_bytes == 1 {
      rd_u8(p, off)? as u16
    } else {
      rd_u16(p, off)?
    };
    off += comp_bytes;
    let lay1 = rd_u16(p, off)?;
    off += 2;
    let res1 = rd_u8(p, off)? as u32;
    off += 1;
    let comp1 = if comp_bytes == 1 {
      rd_u8(p, off)? as u16
    } else {
      rd_u16(p, off)?
    };
    off += comp_bytes;
    let order = ProgressionOrder::from_u8(rd_u8(p, off)?)
      .ok_or(Error::InvalidParameter("POC progression order".into()))?;
    off += 1;
    if res1 <= res0 || comp1 <= comp0 || lay1 == 0 {
      return Err(Error::InvalidParameter("POC ranges".into()));
    }
    out.push(Poc {
      res0,
      comp0,
      lay1,
      res1,
      comp1,
      order,
    });
  }
  Ok(out)
}

// ------------------------------------------------------------------- //
// Encoder                                                              //
// ------------------------------------------------------------------- //

/// Encode-time controls; the defaults mirror common command-line
/// settings (six resolutions, 64x64 blocks, one lossless layer).
#[derive(Debug, Clone)]
pub struct CompressParams {
  pub num_resolutions: u32,
  /// Compression ratio per layer; `0` (or a missing last entry) leaves
  /// the final layer open, which makes the stream lossless for
  /// reversible pipelines.
  pub layer_ratios: Vec<f32>,
  pub prog_order: ProgressionOrder,
  pub cblk_expn: Point,
  pub precinct_expn: Vec<Point>,
  pub reversible: bool,
  pub mct: Option<bool>,
  pub tile_size: Option<(u32, u32)>,
  pub tile_origin: (u32, u32),
  pub cblk_sty: CblkSty,
  pub use_sop: bool,
  pub use_eph: bool,
  pub write_tlm: bool,
  pub num_guard_bits: u8,
  pub comment: Option<String>,
}

impl Default for CompressParams {
  fn default() -> Self {
    Self {
      num_resolutions: 6,
      layer_ratios: Vec::new(),
      prog_order: ProgressionOrder::Lrcp,
      cblk_expn: Point::new(6, 6),
      precinct_expn: Vec::new(),
      reversible: true,
      mct: None,
      tile_size: None,
      tile_origin: (0, 0),
      cblk_sty: CblkSty::empty(),
      use_sop: false,
      use_eph: false,
      write_tlm: false,
      // The low-pass chain of the 5/3 kernel can outgrow the nominal
      // range by roughly a bit per level; four guard bits keep every
      // block's magnitude inside the signalled bit-plane budget.
      num_guard_bits: 4,
      comment: None,
    }
  }
}

fn w16(out: &mut Vec<u8>, v: u16) {
  out.extend_from_slice(&v.to_be_bytes());
}

fn w32(out: &mut Vec<u8>, v: u32) {
  out.extend_from_slice(&v.to_be_bytes());
}

fn write_segment(out: &mut Vec<u8>, marker: Marker, payload: &[u8]) {
  w16(out, marker.as_u16());
  w16(out, payload.len() as u16 + 2);
  out.extend_from_slice(payload);
}

/// `(expn, mant)` such that `(1 + mant/2048) * 2^(numbps_ref - expn)`
/// reproduces `stepsize`.
fn encode_stepsize(stepsize: f64, numbps_ref: i32) -> (u8, u16) {
  if stepsize <= 0.0 {
    return (numbps_ref.clamp(0, 31) as u8, 0);
  }
  let t = stepsize / (2f64).powi(numbps_ref);
  let mut expn = (-t.log2()).floor() as i32;
  let mut frac = t * (2f64).powi(expn);
  if frac >= 2.0 {
    expn -= 1;
    frac /= 2.0;
  }
  if frac < 1.0 {
    expn += 1;
    frac *= 2.0;
  }
  let expn = expn.clamp(0, 31);
  let mant = (((frac - 1.0) * 2048.0).round() as i64).clamp(0, 2047) as u16;
  (expn as u8, mant)
}

fn default_tccp_for(params: &CompressParams, precision: u8) -> TileCompParams {
  let nres = params.num_resolutions;
  let mut stepsizes = Vec::new();
  for resno in 0..nres {
    let bands: &[u32] = if resno == 0 { &[0] } else { &[0, 1, 2] };
    for &bandno in bands {
      let orient = crate::consts::BandOrientation::from_band_index(resno, bandno);
      let gain = band_gain(orient);
      if params.reversible {
        stepsizes.push((precision + gain, 0));
      } else {
        let level = nres - 1 - resno;
        let norm = DWT_NORM_97_FOR_STEP[orient as usize][(level as usize).min(9)];
        let step = (1u32 << gain) as f64 / norm;
        stepsizes.push(encode_stepsize(step, precision as i32 + gain as i32));
      }
    }
  }
  TileCompParams {
    num_resolutions: nres,
    cblk_expn: params.cblk_expn,
    cblk_sty: params.cblk_sty,
    reversible: params.reversible,
    precinct_expn: params.precinct_expn.clone(),
    quant_style: if params.reversible {
      QuantStyle::NoQuant
    } else {
      QuantStyle::ScalarExpounded
    },
    num_guard_bits: params.num_guard_bits,
    stepsizes,
    roi_shift: 0,
  }
}

#[rustfmt::skip]
const DWT_NORM_97_FOR_STEP: [[f64; 10]; 4] = [
  [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1097.0],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1097.0],
  [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 1114.0],
];

/// Encodes an image into a raw J2K code stream.
pub fn compress(image: &Image, params: &CompressParams) -> Result<Vec<u8>> {
  if image.comps.is_empty() {
    return Err(Error::InvalidParameter("image has no components".into()));
  }
  let bounds = image.bounds;
  for c in &image.comps {
    let r = bounds.scale_down_ceil(c.dx, c.dy);
    if c.data.len() != r.area() as usize {
      return Err(Error::InvalidParameter(
        "component buffer does not match bounds".into(),
      ));
    }
  }
  let (tw, th) = params
    .tile_size
    .unwrap_or((bounds.width().max(1), bounds.height().max(1)));
  let cp = CodingParams {
    bounds,
    tile_origin: Point::new(params.tile_origin.0, params.tile_origin.1),
    tile_size: Point::new(tw, th),
    comps: image
      .comps
      .iter()
      .map(|c| CompInfo {
        dx: c.dx,
        dy: c.dy,
        precision: c.precision,
        signed: c.signed,
      })
      .collect(),
    default_tcp: TileCodingParams::default(),
    ht: false,
  };

  let num_layers = params.layer_ratios.len().max(1) as u16;
  let mct = params.mct.unwrap_or(image.comps.len() >= 3);
  let mut tcp = TileCodingParams {
    num_layers,
    mct,
    prog_order: params.prog_order,
    csty: {
      let mut c = CodingStyle::empty();
      if !params.precinct_expn.is_empty() {
        c |= CodingStyle::PRECINCTS;
      }
      if params.use_sop {
        c |= CodingStyle::SOP;
      }
      if params.use_eph {
        c |= CodingStyle::EPH;
      }
      c
    },
    ..Default::default()
  };
  tcp.tccps = cp
    .comps
    .iter()
    .map(|c| default_tccp_for(params, c.precision))
    .collect();

  // Layer byte budgets from the compression ratios.
  let raw_bytes: u64 = image
    .comps
    .iter()
    .map(|c| c.data.len() as u64 * c.precision as u64 / 8)
    .sum();
  let targets: Vec<Option<u64>> = if params.layer_ratios.is_empty() {
    vec![None]
  } else {
    params
      .layer_ratios
      .iter()
      .map(|&r| {
        if r <= 0.0 {
          None
        } else {
          Some((raw_bytes as f64 / r as f64) as u64)
        }
      })
      .collect()
  };

  // Compress every tile body first; TLM needs the lengths.
  let num_tiles = cp.num_tiles() as u16;
  let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(num_tiles as usize);
  for tno in 0..num_tiles {
    let mut tp = TileProcessor::new(tno, cp.tile_rect(tno), tcp.clone(), cp.comps.clone(), 0, true);
    bodies.push(tp.compress(image, &targets)?);
  }

  let mut out = Vec::new();
  w16(&mut out, Marker::Soc.as_u16());

  // SIZ
  let mut siz = Vec::new();
  w16(&mut siz, 0); // Rsiz
  w32(&mut siz, bounds.x1);
  w32(&mut siz, bounds.y1);
  w32(&mut siz, bounds.x0);
  w32(&mut siz, bounds.y0);
  w32(&mut siz, tw);
  w32(&mut siz, th);
  w32(&mut siz, cp.tile_origin.x);
  w32(&mut siz, cp.tile_origin.y);
  w16(&mut siz, cp.comps.len() as u16);
  for c in &cp.comps {
    siz.push((c.precision - 1) | if c.signed { 0x80 } else { 0 });
    siz.push(c.dx as u8);
    siz.push(c.dy as u8);
  }
  write_segment(&mut out, Marker::Siz, &siz);

  // COD
  let mut cod = Vec::new();
  cod.push(tcp.csty.bits());
  cod.push(tcp.prog_order.as_u8());
  w16(&mut cod, tcp.num_layers);
  cod.push(tcp.mct as u8);
  let tccp0 = &tcp.tccps[0];
  cod.push((tccp0.num_resolutions - 1) as u8);
  cod.push((tccp0.cblk_expn.x - 2) as u8);
  cod.push((tccp0.cblk_expn.y - 2) as u8);
  cod.push(tccp0.cblk_sty.bits());
  cod.push(tccp0.reversible as u8);
  if tcp.csty.contains(CodingStyle::PRECINCTS) {
    for r in 0..tccp0.num_resolutions {
      let p = tccp0.precinct_expn_for(r);
      cod.push(((p.y as u8) << 4) | (p.x as u8 & 0x0f));
    }
  }
  write_segment(&mut out, Marker::Cod, &cod);

  // QCD
  let mut qcd = Vec::new();
  let style: u8 = if params.reversible { 0 } else { 2 };
  qcd.push((tccp0.num_guard_bits << 5) | style);
  let nbands = 3 * tccp0.num_resolutions as usize - 2;
  for i in 0..nbands {
    let (e, m) = tccp0.stepsizes[i];
    if params.reversible {
      qcd.push(e << 3);
    } else {
      w16(&mut qcd, ((e as u16) << 11) | m);
    }
  }
  write_segment(&mut out, Marker::Qcd, &qcd);

  if let Some(text) = &params.comment {
    let mut com = Vec::new();
    w16(&mut com, 1); // registration: latin-1
    com.extend_from_slice(text.as_bytes());
    write_segment(&mut out, Marker::Com, &com);
  }

  if params.write_tlm {
    let mut tlm = Vec::new();
    tlm.push(0); // Ztlm
    tlm.push(0x60); // ST=2 (16-bit tile index), SP=1 (32-bit lengths)
    for (tno, body) in bodies.iter().enumerate() {
      w16(&mut tlm, tno as u16);
      w32(&mut tlm, body.len() as u32 + 14);
    }
    write_segment(&mut out, Marker::Tlm, &tlm);
  }

  for (tno, body) in bodies.iter().enumerate() {
    w16(&mut out, Marker::Sot.as_u16());
    w16(&mut out, 10);
    w16(&mut out, tno as u16);
    w32(&mut out, body.len() as u32 + 14);
    out.push(0); // TPsot
    out.push(1); // TNsot
    w16(&mut out, Marker::Sod.as_u16());
    out.extend_from_slice(body);
  }
  w16(&mut out, Marker::Eoc.as_u16());
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn marker_states_enforce_parse_order() {
    assert!(Marker::Siz.states().contains(DecoderState::MHSIZ));
    assert!(!Marker::Siz.states().contains(DecoderState::MH));
    assert!(Marker::Tlm.states().contains(DecoderState::MH));
    assert!(!Marker::Tlm.states().contains(DecoderState::TPH));
    assert!(Marker::Ppt.states().contains(DecoderState::TPH));
  }

  #[test]
  fn stepsize_roundtrip() {
    for &(s, nb) in &[(0.5f64, 8), (1.0, 8), (3.7, 10), (0.0123, 12)] {
      let (e, m) = encode_stepsize(s, nb);
      let back = (1.0 + m as f64 / 2048.0) * (2f64).powi(nb - e as i32);
      assert!(
        (back - s).abs() / s < 0.001,
        "stepsize {} decoded as {}",
        s,
        back
      );
    }
  }

  #[test]
  fn tile_grid_covers_bounds() {
    let cp = CodingParams {
      bounds: Rect::new(0, 0, 100, 50),
      tile_origin: Point::new(0, 0),
      tile_size: Point::new(32, 32),
      ..Default::default()
    };
    assert_eq!(cp.tiles_wide(), 4);
    assert_eq!(cp.tiles_high(), 2);
    assert_eq!(cp.tile_rect(0), Rect::new(0, 0, 32, 32));
    assert_eq!(cp.tile_rect(3), Rect::new(96, 0, 100, 32));
    assert_eq!(cp.tile_rect(7), Rect::new(96, 32, 100, 50));
  }

  #[test]
  fn row_completion_window_advances() {
    let rc = RowCompletion::new(vec![2, 2, 2], 1);
    assert_eq!(rc.window(), (0, 1));
    rc.complete(0);
    assert_eq!(rc.window().0, 0);
    rc.complete(0);
    assert_eq!(rc.window().0, 1);
    rc.schedule_more(2);
    assert_eq!(rc.window(), (1, 3));
    rc.wait_rows(1);
  }

  #[test]
  fn bad_main_header_marker_is_fatal() {
    // SOC then COM before SIZ.
    let mut d = Vec::new();
    w16(&mut d, 0xff4f);
    w16(&mut d, 0xff64);
    w16(&mut d, 4);
    w16(&mut d, 1);
    let err = Codestream::new(&d).unwrap_err();
    assert!(matches!(err, Error::InvalidMarker(_)));
  }

  #[test]
  fn row_completion_skips_empty_rows() {
    let rc = RowCompletion::new(vec![0, 2, 0, 1], 4);
    // Leading empty row is skipped immediately.
    assert_eq!(rc.window().0, 1);
    rc.complete(1);
    rc.complete(1);
    // Row 2 has no tiles; head jumps to row 3.
    assert_eq!(rc.window().0, 3);
    rc.complete(3);
    assert_eq!(rc.window().0, 4);
  }
}
