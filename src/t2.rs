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

//! T2 packet assembly: header bit layout, inclusion and missing-MSB
//! signalling through the precinct tag trees, pass-count and length
//! coding, segment splitting, and the truncated-packet policy.

use crate::bio::{BioReader, BioWriter};
use crate::canvas::{max_passes_per_segment, ChunkRef, Precinct, Resolution};
use crate::consts::CblkSty;
use crate::error::{Error, Result};
use crate::math::floorlog2;

use log::warn;

/// SOP marker: `FF 91`, fixed-length payload carrying a packet counter.
const SOP_MARKER: [u8; 2] = [0xff, 0x91];
const SOP_LEN: usize = 6;
/// EPH marker: `FF 92`, bare.
const EPH_MARKER: [u8; 2] = [0xff, 0x92];

/// What one packet header told us.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PacketHeader {
  /// Header bytes consumed, including SOP/EPH when present.
  pub header_len: usize,
  /// Total body bytes signalled.
  pub body_len: u64,
  /// Zero `present` bit: the packet contributes nothing.
  pub empty: bool,
}

/// Parses one packet header for `(precno, layno)` of a resolution.
/// `data` starts at the packet (or its SOP marker); packet bodies are
/// assigned separately through [`read_packet_body`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_packet_header(
  res: &mut Resolution,
  precno: u64,
  layno: u16,
  num_layers: u16,
  cblk_sty: CblkSty,
  max_bps_guess: impl Fn(usize) -> u8,
  data: &[u8],
  use_sop: bool,
  use_eph: bool,
) -> Result<PacketHeader> {
  let mut consumed = 0usize;
  if use_sop && data.len() >= SOP_LEN && data[0..2] == SOP_MARKER {
    consumed += SOP_LEN;
  }
  let hdr = &data[consumed.min(data.len())..];
  let mut bio = BioReader::new(hdr);
  let mut out = PacketHeader::default();

  if bio.read_bit()? == 0 {
    bio.align()?;
    consumed += bio.bytes_consumed();
    if use_eph {
      consumed = skip_eph(data, consumed)?;
    }
    out.header_len = consumed;
    out.empty = true;
    return Ok(out);
  }

  let band_expn = res.band_precinct_expn;
  let grid_w = res.precinct_grid.x;
  let cblk_expn = res.cblk_expn;

  for band_idx in 0..res.bands.len() {
    let max_bps = max_bps_guess(band_idx);
    let band = &mut res.bands[band_idx];
    if band.is_empty() {
      continue;
    }
    let prec = band.precinct_mut(precno, band_expn, grid_w, cblk_expn, num_layers);
    let num_cblks = prec.num_cblks();
    if num_cblks == 0 {
      continue;
    }
    for cblkno in 0..num_cblks {
      // 1. inclusion
      let first_time = prec.dec_block(cblkno).included_in_layer.is_none();
      let included = if first_time {
        let tree = prec.incl_tree.as_mut().expect("non-empty precinct has trees");
        tree.decode(&mut bio, cblkno, layno as i32 + 1)?
      } else {
        bio.read_bit()? != 0
      };
      if !included {
        continue;
      }

      // 2. first inclusion: missing MSBs through the second tree
      if first_time {
        let zbp = {
          let tree = prec.imsb_tree.as_mut().expect("non-empty precinct has trees");
          tree.decode_value(&mut bio, cblkno, 74)?
        };
        let blk = prec.dec_block(cblkno);
        blk.included_in_layer = Some(layno);
        if zbp as u8 > max_bps {
          return Err(Error::CorruptPacketHeader(
            "missing MSB count exceeds band bit planes",
          ));
        }
        blk.numbps = max_bps - zbp as u8;
        blk.num_len_bits = 3;
      }

      // 3. new passes and length increment
      let numpasses = bio.read_numpasses()?;
      let increment = bio.read_commacode()?;
      {
        let blk = prec.dec_block(cblkno);
        blk.num_len_bits += increment;
        if blk.num_len_bits > 32 {
          return Err(Error::CorruptPacketHeader("length bits overflow"));
        }
        if blk.passes_by_layer[layno as usize] != 0 {
          return Err(Error::CorruptPacketHeader("duplicate packet for layer"));
        }
        if numpasses > 164 {
          return Err(Error::CorruptPacketHeader("implausible pass count"));
        }
        blk.passes_by_layer[layno as usize] = numpasses as u8;

        // 4. split the passes over segments and read one length per
        // segment slice.
        let mut segno = match blk.open_segment() {
          Some(s) => s,
          None => blk.segs.len(),
        };
        let mut remaining = numpasses;
        loop {
          let num_len_bits = blk.num_len_bits;
          let seg = blk.segment_mut(segno, cblk_sty);
          let take = (seg.max_passes - seg.total_passes).min(remaining);
          if take == 0 {
            return Err(Error::CorruptPacketHeader("segment pass budget exhausted"));
          }
          seg.passes_in_layer[layno as usize] = take as u8;
          seg.total_passes += take;

          let bits = num_len_bits + floorlog2(take);
          if bits > 32 {
            return Err(Error::CorruptPacketHeader("length field too wide"));
          }
          let bytes = bio.read(bits)?;
          seg.bytes_in_layer[layno as usize] = bytes;
          seg.total_bytes = seg
            .total_bytes
            .checked_add(bytes as u64)
            .ok_or(Error::CorruptPacketHeader("segment byte count overflow"))?;
          out.body_len += bytes as u64;

          remaining -= take;
          if remaining == 0 {
            break;
          }
          segno += 1;
        }
      }
    }
  }

  bio.align()?;
  consumed += bio.bytes_consumed();
  if use_eph {
    consumed = skip_eph(data, consumed)?;
  }
  out.header_len = consumed;
  Ok(out)
}

fn skip_eph(data: &[u8], consumed: usize) -> Result<usize> {
  if data.len() >= consumed + 2 && data[consumed..consumed + 2] == EPH_MARKER {
    Ok(consumed + 2)
  } else {
    warn!("expected EPH marker after packet header");
    Ok(consumed)
  }
}

/// Assigns body chunk descriptors for the packet parsed by the matching
/// [`read_packet_header`] call. `part`/`part_offset` locate the body in
/// its tile-part buffer; `remaining` is what is left of the tile-part.
/// Returns the body bytes consumed.
pub(crate) fn read_packet_body(
  res: &mut Resolution,
  precno: u64,
  layno: u16,
  part: u16,
  part_offset: u32,
  remaining: usize,
  is_ht: bool,
) -> Result<usize> {
  let mut offset = part_offset;
  let mut left = remaining;
  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let prec = match band.precinct_map.get(&precno) {
      Some(&slot) => &mut band.precincts[slot],
      None => continue,
    };
    let mut cblknos: Vec<u32> = Vec::new();
    for (cblkno, _blk) in prec.dec_blocks_iter_mut() {
      cblknos.push(*cblkno);
    }
    cblknos.sort_unstable();
    for cblkno in cblknos {
      let blk = prec.dec_block(cblkno);
      if blk.passes_by_layer[layno as usize] == 0 {
        continue;
      }
      let mut dropped = false;
      for seg in blk.segs.iter_mut() {
        if seg.passes_in_layer[layno as usize] == 0 {
          continue;
        }
        let bytes = seg.bytes_in_layer[layno as usize];
        let mut len = bytes as usize;
        if len > left {
          if is_ht {
            // HT decoding runs forward and reverse; a truncated block
            // cannot be salvaged, so the whole block goes.
            dropped = true;
            break;
          }
          warn!(
            "truncated packet: clamping segment from {} to {} bytes",
            len, left
          );
          len = left;
        }
        if len > 0 {
          seg.chunks.push(ChunkRef {
            part,
            offset,
            len: len as u32,
          });
        }
        seg.data_passes += seg.passes_in_layer[layno as usize] as u32;
        offset += len as u32;
        left -= len;
      }
      if dropped {
        blk.release();
      }
    }
  }
  Ok((offset - part_offset) as usize)
}

/// Splits the global pass range `[first, first + count)` into
/// per-segment slices according to the mode-switch pass budgets.
fn split_passes(cblk_sty: CblkSty, first: u32, count: u32) -> Vec<(usize, u32)> {
  let mut out = Vec::new();
  let mut segno = 0usize;
  let mut seg_start = 0u32;
  let mut seg_cap = max_passes_per_segment(cblk_sty, 0);
  // Advance to the segment containing `first`.
  while seg_start + seg_cap <= first {
    seg_start += seg_cap;
    segno += 1;
    seg_cap = max_passes_per_segment(cblk_sty, segno);
  }
  let mut pos = first;
  let mut left = count;
  while left > 0 {
    let in_seg = (seg_start + seg_cap - pos).min(left);
    out.push((segno, in_seg));
    pos += in_seg;
    left -= in_seg;
    if pos == seg_start + seg_cap {
      seg_start += seg_cap;
      segno += 1;
      seg_cap = max_passes_per_segment(cblk_sty, segno);
    }
  }
  out
}

/// Emits one packet for `(precno, layno)` of a resolution. Blocks must
/// already carry their per-layer split (`BlockLayer`) and the precinct
/// tag trees must have been primed with inclusion layers and missing
/// MSB counts.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_packet(
  res: &mut Resolution,
  precno: u64,
  layno: u16,
  cblk_sty: CblkSty,
  max_bps: impl Fn(usize) -> u8,
  out: &mut Vec<u8>,
  use_sop: bool,
  use_eph: bool,
  packet_no: &mut u32,
) -> Result<()> {
  if use_sop {
    out.extend_from_slice(&SOP_MARKER);
    out.extend_from_slice(&[0x00, 0x04]);
    out.extend_from_slice(&((*packet_no & 0xffff) as u16).to_be_bytes());
  }
  *packet_no = packet_no.wrapping_add(1);

  // Does any block of this precinct contribute to this layer?
  let mut present = false;
  for band in res.bands.iter() {
    if let Some(&slot) = band.precinct_map.get(&precno) {
      let prec = &band.precincts[slot];
      for cblkno in 0..prec.num_cblks() {
        if let Some(blk) = prec.enc_block_ref(cblkno) {
          if blk
            .layers
            .get(layno as usize)
            .map(|l| l.num_passes > 0)
            .unwrap_or(false)
          {
            present = true;
          }
        }
      }
    }
  }

  let mut bio = BioWriter::new();
  if !present {
    bio.write_bit(0);
    out.extend_from_slice(&bio.finish());
    if use_eph {
      out.extend_from_slice(&EPH_MARKER);
    }
    return Ok(());
  }
  bio.write_bit(1);

  let band_count = res.bands.len();
  for band_idx in 0..band_count {
    let band_bps = max_bps(band_idx);
    let band = &mut res.bands[band_idx];
    if band.is_empty() {
      continue;
    }
    let slot = match band.precinct_map.get(&precno) {
      Some(&s) => s,
      None => continue,
    };
    let prec: &mut Precinct = &mut band.precincts[slot];
    let num_cblks = prec.num_cblks();
    for cblkno in 0..num_cblks {
      let (first_time, contributes, num_passes, first_pass, numbps) = {
        let blk = prec.enc_block(cblkno);
        let layer = blk.layers.get(layno as usize).copied().unwrap_or_default();
        (
          blk.included_in_layer == Some(layno),
          layer.num_passes > 0,
          layer.num_passes,
          blk.passes_emitted,
          blk.enc.as_ref().map(|e| e.numbps).unwrap_or(0),
        )
      };

      // Inclusion signalling.
      let already_included = {
        let blk = prec.enc_block(cblkno);
        blk.included_in_layer.map(|l| l < layno).unwrap_or(false)
      };
      if already_included {
        bio.write_bit(contributes as u32);
      } else {
        let tree = prec.incl_tree.as_mut().expect("non-empty precinct has trees");
        tree.encode(&mut bio, cblkno, layno as i32 + 1);
      }
      if !contributes {
        continue;
      }

      if first_time {
        if numbps > band_bps {
          return Err(Error::CorruptPacketData(
            "block magnitude exceeds the signalled bit-plane budget",
          ));
        }
        let zbp = (band_bps - numbps) as i32;
        let tree = prec.imsb_tree.as_mut().expect("non-empty precinct has trees");
        tree.encode(&mut bio, cblkno, zbp + 1);
        prec.enc_block(cblkno).num_len_bits = 3;
      }

      bio.write_numpasses(num_passes);

      // Length signalling: one field per segment slice, all under one
      // shared (and only ever growing) length-bit counter.
      let blk = prec.enc_block(cblkno);
      let slices = split_passes(cblk_sty, first_pass, num_passes);
      let enc = blk.enc.as_ref().expect("contributing block has coder output");
      let mut increment = 0u32;
      let mut cursor = first_pass;
      let mut lens: Vec<(u32, u32)> = Vec::new();
      for &(_, in_seg) in &slices {
        let lo = if cursor == 0 {
          0
        } else {
          enc.passes[cursor as usize - 1].rate
        };
        let hi = enc.passes[(cursor + in_seg) as usize - 1].rate;
        let len = hi - lo;
        let want = if len > 0 { floorlog2(len) + 1 } else { 1 };
        let have = blk.num_len_bits + floorlog2(in_seg);
        increment = increment.max(want.saturating_sub(have));
        lens.push((len, in_seg));
        cursor += in_seg;
      }
      bio.write_commacode(increment);
      blk.num_len_bits += increment;
      for (len, in_seg) in lens {
        bio.write(len, blk.num_len_bits + floorlog2(in_seg));
      }
      blk.passes_emitted += num_passes;
    }
  }

  out.extend_from_slice(&bio.finish());
  if use_eph {
    out.extend_from_slice(&EPH_MARKER);
  }

  // Body: block bytes in enumeration order.
  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let slot = match band.precinct_map.get(&precno) {
      Some(&s) => s,
      None => continue,
    };
    let prec = &mut band.precincts[slot];
    for cblkno in 0..prec.num_cblks() {
      if let Some(blk) = prec.enc_block_ref(cblkno) {
        if let (Some(enc), Some(layer)) = (blk.enc.as_ref(), blk.layers.get(layno as usize)) {
          if layer.num_passes > 0 {
            let lo = layer.offset as usize;
            let hi = lo + layer.len as usize;
            out.extend_from_slice(&enc.data[lo..hi]);
          }
        }
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::canvas::{BlockLayer, Subband};
  use crate::consts::BandOrientation;
  use crate::math::{Point, Rect};
  use crate::t1::{EncOut, EncPass};
  use smallvec::SmallVec;

  fn one_band_resolution(rect: Rect) -> Resolution {
    let mut res = Resolution {
      rect,
      precinct_expn: Point::new(15, 15),
      band_precinct_expn: Point::new(15, 15),
      precinct_grid: Point::new(1, 1),
      cblk_expn: Point::new(6, 6),
      ..Default::default()
    };
    let mut band = Subband {
      rect,
      orientation: BandOrientation::LL,
      ..Default::default()
    };
    band.quant.num_bps = 8;
    res.bands.push(band);
    res
  }

  fn fake_enc_out(pass_lens: &[u32]) -> EncOut {
    let mut rate = 0;
    let mut passes = Vec::new();
    for &l in pass_lens {
      rate += l;
      passes.push(EncPass {
        rate,
        distortion: 0.0,
        term: false,
        len: l,
      });
    }
    let data: Vec<u8> = (0..rate).map(|i| (i % 251) as u8).collect();
    EncOut {
      data,
      numbps: 5,
      passes,
    }
  }

  #[test]
  fn split_passes_respects_budgets() {
    // TERMALL: every pass its own segment.
    assert_eq!(
      split_passes(CblkSty::TERMALL, 0, 3),
      vec![(0, 1), (1, 1), (2, 1)]
    );
    assert_eq!(split_passes(CblkSty::TERMALL, 2, 2), vec![(2, 1), (3, 1)]);
    // LAZY: 10, then 2/1 alternating.
    assert_eq!(
      split_passes(CblkSty::LAZY, 8, 5),
      vec![(0, 2), (1, 2), (2, 1)]
    );
    // Default: everything in one segment.
    assert_eq!(split_passes(CblkSty::empty(), 0, 30), vec![(0, 30)]);
  }

  #[test]
  fn packet_roundtrip_two_layers() {
    let rect = Rect::new(0, 0, 128, 64);
    let mut enc_res = one_band_resolution(rect);

    // Prime the encoder side: one contributing block, two layers.
    {
      let band_expn = enc_res.band_precinct_expn;
      let grid_w = enc_res.precinct_grid.x;
      let cblk_expn = enc_res.cblk_expn;
      let band = &mut enc_res.bands[0];
      let prec = band.precinct_mut(0, band_expn, grid_w, cblk_expn, 2);
      let ntotal = prec.num_cblks();
      assert_eq!(ntotal, 2);
      {
        let blk = prec.enc_block(0);
        let enc = fake_enc_out(&[11, 7, 5, 9]);
        blk.layers = vec![
          BlockLayer {
            num_passes: 2,
            len: 18,
            disto: 0.0,
            offset: 0,
          },
          BlockLayer {
            num_passes: 2,
            len: 14,
            disto: 0.0,
            offset: 18,
          },
        ];
        blk.included_in_layer = Some(0);
        blk.enc = Some(enc);
      }
      {
        // Second block joins in layer 1.
        let blk = prec.enc_block(1);
        let enc = fake_enc_out(&[6, 4]);
        blk.layers = vec![
          BlockLayer::default(),
          BlockLayer {
            num_passes: 2,
            len: 10,
            disto: 0.0,
            offset: 0,
          },
        ];
        blk.included_in_layer = Some(1);
        blk.enc = Some(enc);
      }
      let incl = prec.incl_tree.as_mut().unwrap();
      incl.set_value(0, 0);
      incl.set_value(1, 1);
      let imsb = prec.imsb_tree.as_mut().unwrap();
      // numbps 5, band bps 8: three missing planes on both blocks.
      imsb.set_value(0, 3);
      imsb.set_value(1, 3);
    }

    let mut packets: Vec<Vec<u8>> = Vec::new();
    let mut packet_no = 0u32;
    for layno in 0..2u16 {
      let mut buf = Vec::new();
      write_packet(
        &mut enc_res,
        0,
        layno,
        CblkSty::empty(),
        |_| 8,
        &mut buf,
        false,
        false,
        &mut packet_no,
      )
      .unwrap();
      packets.push(buf);
    }

    // Decode side.
    let mut dec_res = one_band_resolution(rect);
    let mut parts: Vec<Vec<u8>> = Vec::new();
    for (layno, pkt) in packets.iter().enumerate() {
      let hdr = read_packet_header(
        &mut dec_res,
        0,
        layno as u16,
        2,
        CblkSty::empty(),
        |_| 8,
        pkt,
        false,
        false,
      )
      .unwrap();
      assert!(!hdr.empty);
      let body = pkt[hdr.header_len..].to_vec();
      assert_eq!(body.len() as u64, hdr.body_len);
      let part = parts.len() as u16;
      parts.push(body.clone());
      let consumed = read_packet_body(
        &mut dec_res,
        0,
        layno as u16,
        part,
        0,
        body.len(),
        false,
      )
      .unwrap();
      assert_eq!(consumed, body.len());
    }

    let band = &dec_res.bands[0];
    let prec = band.precinct_by_index(0).unwrap();
    let b0 = prec.dec_block_ref(0).unwrap();
    assert_eq!(b0.included_in_layer, Some(0));
    assert_eq!(b0.numbps, 5);
    assert_eq!(b0.passes_by_layer, vec![2, 2]);
    assert_eq!(b0.segs.len(), 1);
    assert_eq!(b0.segs[0].total_passes, 4);
    assert_eq!(b0.segs[0].bytes_in_layer, vec![18, 14]);
    assert_eq!(b0.ready_passes(), 4);
    let b1 = prec.dec_block_ref(1).unwrap();
    assert_eq!(b1.included_in_layer, Some(1));
    assert_eq!(b1.passes_by_layer, vec![0, 2]);
    assert_eq!(b1.segs[0].bytes_in_layer, vec![0, 10]);

    // Body split: layer 0 is all block 0; layer 1 is block 0 then 1.
    assert_eq!(
      b0.segs[0].chunks.as_slice(),
      &[
        ChunkRef {
          part: 0,
          offset: 0,
          len: 18
        },
        ChunkRef {
          part: 1,
          offset: 0,
          len: 14
        }
      ]
    );
    assert_eq!(
      b1.segs[0].chunks.as_slice(),
      &[ChunkRef {
        part: 1,
        offset: 14,
        len: 10
      }]
    );
    let _unused: SmallVec<[u8; 1]> = SmallVec::new();
  }

  #[test]
  fn empty_packet_roundtrip() {
    let rect = Rect::new(0, 0, 64, 64);
    let mut enc_res = one_band_resolution(rect);
    {
      let band_expn = enc_res.band_precinct_expn;
      let grid_w = enc_res.precinct_grid.x;
      let cblk_expn = enc_res.cblk_expn;
      enc_res.bands[0].precinct_mut(0, band_expn, grid_w, cblk_expn, 1);
    }
    let mut buf = Vec::new();
    let mut packet_no = 0;
    write_packet(
      &mut enc_res,
      0,
      0,
      CblkSty::empty(),
      |_| 8,
      &mut buf,
      false,
      true,
    &mut packet_no,
    )
    .unwrap();

    let mut dec_res = one_band_resolution(rect);
    let hdr = read_packet_header(
      &mut dec_res,
      0,
      0,
      1,
      CblkSty::empty(),
      |_| 8,
      &buf,
      false,
      true,
    )
    .unwrap();
    assert!(hdr.empty);
    assert_eq!(hdr.body_len, 0);
    assert_eq!(hdr.header_len, buf.len());
  }

  #[test]
  fn truncated_body_clamps_and_keeps_block() {
    let rect = Rect::new(0, 0, 64, 64);
    let mut enc_res = one_band_resolution(rect);
    {
      let band_expn = enc_res.band_precinct_expn;
      let grid_w = enc_res.precinct_grid.x;
      let cblk_expn = enc_res.cblk_expn;
      let prec = enc_res.bands[0].precinct_mut(0, band_expn, grid_w, cblk_expn, 1);
      let blk = prec.enc_block(0);
      blk.enc = Some(fake_enc_out(&[25]));
      blk.layers = vec![BlockLayer {
        num_passes: 1,
        len: 25,
        disto: 0.0,
        offset: 0,
      }];
      blk.included_in_layer = Some(0);
      prec.incl_tree.as_mut().unwrap().set_value(0, 0);
      prec.imsb_tree.as_mut().unwrap().set_value(0, 3);
    }
    let mut buf = Vec::new();
    let mut packet_no = 0;
    write_packet(
      &mut enc_res,
      0,
      0,
      CblkSty::empty(),
      |_| 8,
      &mut buf,
      false,
      false,
      &mut packet_no,
    )
    .unwrap();

    let mut dec_res = one_band_resolution(rect);
    let hdr = read_packet_header(
      &mut dec_res,
      0,
      0,
      1,
      CblkSty::empty(),
      |_| 8,
      &buf,
      false,
      false,
    )
    .unwrap();
    assert_eq!(hdr.body_len, 25);
    // Only 10 bytes remain in the tile part.
    let consumed = read_packet_body(&mut dec_res, 0, 0, 0, 0, 10, false).unwrap();
    assert_eq!(consumed, 10);
    let prec = dec_res.bands[0].precinct_by_index(0).unwrap();
    let blk = prec.dec_block_ref(0).unwrap();
    assert!(!blk.corrupt);
    assert_eq!(blk.segs[0].chunks[0].len, 10);

    // Same situation for an HT block zeroes the whole block.
    let mut dec_res2 = one_band_resolution(rect);
    read_packet_header(
      &mut dec_res2,
      0,
      0,
      1,
      CblkSty::empty(),
      |_| 8,
      &buf,
      false,
      false,
    )
    .unwrap();
    read_packet_body(&mut dec_res2, 0, 0, 0, 0, 10, true).unwrap();
    let prec2 = dec_res2.bands[0].precinct_by_index(0).unwrap();
    let blk2 = prec2.dec_block_ref(0).unwrap();
    assert!(blk2.corrupt);
    assert!(blk2.segs[0].chunks.is_empty());
  }
}
