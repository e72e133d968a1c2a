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

//! JP2 container: box framing, the `jp2h` superbox family, and locating
//! the embedded code stream.
//!
//! Box framing is `u32 length, u32 type, [u64 xl_length when length ==
//! 1], payload`; a length of zero runs to the end of the file.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use log::warn;

pub const TYPE_JP: u32 = 0x6a50_2020; // 'jP  '
pub const TYPE_FTYP: u32 = 0x6674_7970;
pub const TYPE_JP2H: u32 = 0x6a70_3268;
pub const TYPE_IHDR: u32 = 0x6968_6472;
pub const TYPE_BPCC: u32 = 0x6270_6363;
pub const TYPE_COLR: u32 = 0x636f_6c72;
pub const TYPE_CDEF: u32 = 0x6364_6566;
pub const TYPE_PCLR: u32 = 0x7063_6c72;
pub const TYPE_CMAP: u32 = 0x636d_6170;
pub const TYPE_RES: u32 = 0x7265_7320;
pub const TYPE_JP2C: u32 = 0x6a70_3263;

/// One parsed box: payload range within the containing buffer.
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
  pub box_type: u32,
  pub payload_start: usize,
  pub payload_end: usize,
}

/// Reads the box at `off`; returns the header and the offset of the
/// following box.
pub fn read_box(data: &[u8], off: usize) -> Result<(BoxHeader, usize)> {
  if off + 8 > data.len() {
    return Err(Error::TruncatedStream("box header"));
  }
  let len = BigEndian::read_u32(&data[off..]) as u64;
  let box_type = BigEndian::read_u32(&data[off + 4..]);
  let (payload_start, total) = if len == 1 {
    if off + 16 > data.len() {
      return Err(Error::TruncatedStream("XL box header"));
    }
    let xl = BigEndian::read_u64(&data[off + 8..]);
    if xl < 16 {
      return Err(Error::CorruptBox("XL length smaller than header"));
    }
    (off + 16, xl)
  } else if len == 0 {
    // To end of file.
    (off + 8, (data.len() - off) as u64)
  } else {
    if len < 8 {
      return Err(Error::CorruptBox("length smaller than header"));
    }
    (off + 8, len)
  };
  let end = off as u64 + total;
  if end > data.len() as u64 {
    return Err(Error::CorruptBox("box overruns file"));
  }
  Ok((
    BoxHeader {
      box_type,
      payload_start,
      payload_end: end as usize,
    },
    end as usize,
  ))
}

/// Colour specification from the `colr` box.
#[derive(Debug, Clone, PartialEq)]
pub enum ColourSpec {
  /// Enumerated colour space code (16 = sRGB, 17 = greyscale, 18 =
  /// sYCC, 14 = CIELab).
  Enumerated(u32),
  /// CIELab with explicit range/offset parameters, held as the
  /// little-endian u32 fields they are serialised as.
  CieLab {
    range_l: u32,
    offset_l: u32,
    range_a: u32,
    offset_a: u32,
    range_b: u32,
    offset_b: u32,
    illuminant: u32,
  },
  /// Restricted ICC profile, handed to the colour oracle untouched.
  IccProfile(Vec<u8>),
}

/// Channel definition entry from `cdef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDef {
  pub channel: u16,
  pub typ: u16,
  pub association: u16,
}

/// Palette from `pclr` plus the component mapping from `cmap`.
#[derive(Debug, Clone, Default)]
pub struct Palette {
  pub entries: Vec<Vec<i32>>,
  pub column_bits: Vec<u8>,
  /// `(component, mapping_type, palette_column)` triplets.
  pub mapping: Vec<(u16, u8, u8)>,
}

/// Everything the core needs from a JP2 wrapper.
#[derive(Debug, Clone, Default)]
pub struct Jp2Header {
  pub width: u32,
  pub height: u32,
  pub num_comps: u16,
  pub bpc: u8,
  pub bpc_per_comp: Vec<u8>,
  pub colour: Option<ColourSpec>,
  pub channel_defs: Vec<ChannelDef>,
  pub palette: Option<Palette>,
  /// Capture resolution, as `(num, den, exp)` pairs per axis.
  pub capture_resolution: Option<[(u16, u16, i8); 2]>,
}

/// Parsed JP2 file: header plus the code-stream byte range.
#[derive(Debug, Clone, Default)]
pub struct Jp2File {
  pub header: Jp2Header,
  pub codestream: core::ops::Range<usize>,
}

/// Parses the box sequence of a JP2 file and finds the code stream.
pub fn parse(data: &[u8]) -> Result<Jp2File> {
  let mut off = 0usize;
  let mut out = Jp2File::default();
  let mut seen_signature = false;
  let mut seen_ftyp = false;
  while off + 8 <= data.len() {
    let (bx, next) = read_box(data, off)?;
    match bx.box_type {
      TYPE_JP => {
        let payload = &data[bx.payload_start..bx.payload_end];
        if payload != [0x0d, 0x0a, 0x87, 0x0a] {
          return Err(Error::CorruptBox("jP signature"));
        }
        seen_signature = true;
      }
      TYPE_FTYP => {
        seen_ftyp = true;
      }
      TYPE_JP2H => {
        if !seen_signature || !seen_ftyp {
          return Err(Error::CorruptBox("jp2h before signature/ftyp"));
        }
        parse_jp2h(&data[bx.payload_start..bx.payload_end], &mut out.header)?;
      }
      TYPE_JP2C => {
        out.codestream = bx.payload_start..bx.payload_end;
        return Ok(out);
      }
      other => {
        warn!("skipping unknown box {:#010x}", other);
      }
    }
    off = next;
  }
  Err(Error::TruncatedStream("no jp2c box"))
}

fn parse_jp2h(data: &[u8], hdr: &mut Jp2Header) -> Result<()> {
  let mut off = 0usize;
  while off + 8 <= data.len() {
    let (bx, next) = read_box(data, off)?;
    let p = &data[bx.payload_start..bx.payload_end];
    match bx.box_type {
      TYPE_IHDR => {
        if p.len() < 14 {
          return Err(Error::CorruptBox("ihdr"));
        }
        hdr.height = BigEndian::read_u32(p);
        hdr.width = BigEndian::read_u32(&p[4..]);
        hdr.num_comps = BigEndian::read_u16(&p[8..]);
        hdr.bpc = p[10];
      }
      TYPE_BPCC => {
        hdr.bpc_per_comp = p.to_vec();
      }
      TYPE_COLR => {
        if hdr.colour.is_none() {
          hdr.colour = Some(parse_colr(p)?);
        }
      }
      TYPE_CDEF => {
        if p.len() < 2 {
          return Err(Error::CorruptBox("cdef"));
        }
        let n = BigEndian::read_u16(p) as usize;
        if p.len() < 2 + 6 * n {
          return Err(Error::CorruptBox("cdef entries"));
        }
        for i in 0..n {
          let base = 2 + 6 * i;
          hdr.channel_defs.push(ChannelDef {
            channel: BigEndian::read_u16(&p[base..]),
            typ: BigEndian::read_u16(&p[base + 2..]),
            association: BigEndian::read_u16(&p[base + 4..]),
          });
        }
      }
      TYPE_PCLR => {
        hdr.palette = Some(parse_pclr(p)?);
      }
      TYPE_CMAP => {
        if let Some(pal) = hdr.palette.as_mut() {
          let mut i = 0usize;
          while i + 4 <= p.len() {
            pal
              .mapping
              .push((BigEndian::read_u16(&p[i..]), p[i + 2], p[i + 3]));
            i += 4;
          }
        } else {
          warn!("cmap without pclr; ignored");
        }
      }
      TYPE_RES => {
        // Superbox holding resc/resd; take the first present.
        let mut roff = 0usize;
        while roff + 8 <= p.len() {
          let (rbx, rnext) = read_box(p, roff)?;
          let rp = &p[rbx.payload_start..rbx.payload_end];
          if rp.len() >= 10 && hdr.capture_resolution.is_none() {
            hdr.capture_resolution = Some([
              (
                BigEndian::read_u16(rp),
                BigEndian::read_u16(&rp[2..]),
                rp[8] as i8,
              ),
              (
                BigEndian::read_u16(&rp[4..]),
                BigEndian::read_u16(&rp[6..]),
                rp[9] as i8,
              ),
            ]);
          }
          roff = rnext;
        }
      }
      other => {
        warn!("skipping jp2h child {:#010x}", other);
      }
    }
    off = next;
  }
  Ok(())
}

fn parse_colr(p: &[u8]) -> Result<ColourSpec> {
  if p.len() < 3 {
    return Err(Error::CorruptBox("colr"));
  }
  let meth = p[0];
  match meth {
    1 => {
      if p.len() < 7 {
        return Err(Error::CorruptBox("colr enumerated"));
      }
      let cs = BigEndian::read_u32(&p[3..]);
      if cs == 14 {
        // CIELab carries either a full 7-field parameter block or
        // nothing; fields are little-endian u32 regardless of host.
        let body = &p[7..];
        if body.len() >= 28 {
          return Ok(ColourSpec::CieLab {
            range_l: LittleEndian::read_u32(body),
            offset_l: LittleEndian::read_u32(&body[4..]),
            range_a: LittleEndian::read_u32(&body[8..]),
            offset_a: LittleEndian::read_u32(&body[12..]),
            range_b: LittleEndian::read_u32(&body[16..]),
            offset_b: LittleEndian::read_u32(&body[20..]),
            illuminant: LittleEndian::read_u32(&body[24..]),
          });
        }
        return Ok(ColourSpec::CieLab {
          range_l: 100,
          offset_l: 0,
          range_a: 170,
          offset_a: 0,
          range_b: 200,
          offset_b: 0,
          illuminant: 0x00443235, // D50
        });
      }
      Ok(ColourSpec::Enumerated(cs))
    }
    2 => Ok(ColourSpec::IccProfile(p[3..].to_vec())),
    _ => Err(Error::Unsupported("colr method")),
  }
}

fn parse_pclr(p: &[u8]) -> Result<Palette> {
  if p.len() < 3 {
    return Err(Error::CorruptBox("pclr"));
  }
  let ne = BigEndian::read_u16(p) as usize;
  let npc = p[2] as usize;
  if npc == 0 {
    return Err(Error::CorruptBox("pclr with no columns"));
  }
  let mut pal = Palette::default();
  let mut off = 3usize;
  for _ in 0..npc {
    let b = *p.get(off).ok_or(Error::CorruptBox("pclr bit depths"))?;
    pal.column_bits.push((b & 0x7f) + 1);
    off += 1;
  }
  for _ in 0..ne {
    let mut row = Vec::with_capacity(npc);
    for c in 0..npc {
      let bits = pal.column_bits[c];
      let bytes = ((bits + 7) / 8) as usize;
      if off + bytes > p.len() {
        return Err(Error::CorruptBox("pclr entries"));
      }
      let mut v = 0u32;
      for k in 0..bytes {
        v = (v << 8) | p[off + k] as u32;
      }
      row.push(v as i32);
      off += bytes;
    }
    pal.entries.push(row);
  }
  Ok(pal)
}

/// Wraps a raw code stream in a minimal JP2 container.
pub fn wrap(codestream: &[u8], image: &crate::image::Image) -> Vec<u8> {
  fn push_box(out: &mut Vec<u8>, box_type: u32, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(&box_type.to_be_bytes());
    out.extend_from_slice(payload);
  }

  let mut out = Vec::new();
  push_box(&mut out, TYPE_JP, &[0x0d, 0x0a, 0x87, 0x0a]);

  let mut ftyp = Vec::new();
  ftyp.extend_from_slice(b"jp2 ");
  ftyp.extend_from_slice(&0u32.to_be_bytes());
  ftyp.extend_from_slice(b"jp2 ");
  push_box(&mut out, TYPE_FTYP, &ftyp);

  let mut ihdr = Vec::new();
  ihdr.extend_from_slice(&image.bounds.height().to_be_bytes());
  ihdr.extend_from_slice(&image.bounds.width().to_be_bytes());
  ihdr.extend_from_slice(&(image.comps.len() as u16).to_be_bytes());
  let same_prec = image
    .comps
    .iter()
    .all(|c| c.precision == image.comps[0].precision && c.signed == image.comps[0].signed);
  ihdr.push(if same_prec {
    (image.comps[0].precision - 1) | if image.comps[0].signed { 0x80 } else { 0 }
  } else {
    0xff
  });
  ihdr.push(7); // compression type: code stream
  ihdr.push(0); // colour space known
  ihdr.push(0); // no intellectual property
  let mut colr = vec![1, 0, 0];
  let enumerated: u32 = if image.comps.len() >= 3 { 16 } else { 17 };
  colr.extend_from_slice(&enumerated.to_be_bytes());

  let mut jp2h = Vec::new();
  push_box(&mut jp2h, TYPE_IHDR, &ihdr);
  if !same_prec {
    let bpcc: Vec<u8> = image
      .comps
      .iter()
      .map(|c| (c.precision - 1) | if c.signed { 0x80 } else { 0 })
      .collect();
    push_box(&mut jp2h, TYPE_BPCC, &bpcc);
  }
  push_box(&mut jp2h, TYPE_COLR, &colr);
  push_box(&mut out, TYPE_JP2H, &jp2h);

  push_box(&mut out, TYPE_JP2C, codestream);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::{Image, ImageComp};
  use crate::math::Rect;

  fn tiny_image() -> Image {
    Image {
      bounds: Rect::new(0, 0, 4, 4),
      comps: vec![ImageComp {
        dx: 1,
        dy: 1,
        precision: 8,
        ..Default::default()
      }],
      packing: None,
    }
  }

  #[test]
  fn wrap_then_parse_roundtrip() {
    let stream = vec![0xffu8, 0x4f, 0xff, 0x51, 0x00, 0x02];
    let wrapped = wrap(&stream, &tiny_image());
    assert!(wrapped.starts_with(&crate::JP2_RFC3745_MAGIC[..]));
    let parsed = parse(&wrapped).unwrap();
    assert_eq!(parsed.header.width, 4);
    assert_eq!(parsed.header.height, 4);
    assert_eq!(parsed.header.num_comps, 1);
    assert_eq!(parsed.header.colour, Some(ColourSpec::Enumerated(17)));
    assert_eq!(&wrapped[parsed.codestream.clone()], &stream[..]);
  }

  #[test]
  fn box_length_shorter_than_header_is_fatal() {
    let mut bad = Vec::new();
    bad.extend_from_slice(&4u32.to_be_bytes());
    bad.extend_from_slice(&TYPE_JP.to_be_bytes());
    let err = read_box(&bad, 0).unwrap_err();
    assert!(matches!(err, Error::CorruptBox(_)));
  }

  #[test]
  fn xl_box_roundtrip() {
    // length == 1 switches to the 64-bit XLBox length.
    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&TYPE_JP2C.to_be_bytes());
    data.extend_from_slice(&(16u64 + 3).to_be_bytes());
    data.extend_from_slice(&[9, 9, 9]);
    let (bx, next) = read_box(&data, 0).unwrap();
    assert_eq!(bx.box_type, TYPE_JP2C);
    assert_eq!(bx.payload_end - bx.payload_start, 3);
    assert_eq!(next, data.len());
  }

  #[test]
  fn zero_length_box_runs_to_eof() {
    let mut data = Vec::new();
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&TYPE_JP2C.to_be_bytes());
    data.extend_from_slice(&[1, 2, 3, 4, 5]);
    let (bx, next) = read_box(&data, 0).unwrap();
    assert_eq!(bx.payload_end, data.len());
    assert_eq!(next, data.len());
  }
}
