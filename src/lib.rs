//! JPEG 2000 (ISO/IEC 15444-1) code stream codec.
//!
//! The crate decodes and encodes raw J2K code streams and JP2 files:
//! MQ/T1 entropy coding, tag trees, T2 packet assembly, the canvas
//! tile/resolution/precinct/code-block geometry, the marker-driven
//! control plane with TLM random access and windowed decoding, and
//! differential re-decompression from cached entropy state.
//!
//! File-format adapters, CLI plumbing and ICC transforms live outside
//! this crate; they exchange planar `i32` samples through [`Image`].

pub mod image;

mod bio;
mod canvas;
mod consts;
mod dwt;
mod error;
mod j2k;
mod jp2;
mod math;
mod mct;
mod mqc;
mod pi;
mod rate;
mod sparse_array;
mod t1;
mod t1_luts;
mod t2;
mod tcd;
mod tgt;

pub use consts::{CblkSty, SamplePacking};
pub use error::{Error, Result};
pub use image::{ComponentType, Image, ImageComp};
pub use j2k::{compress, Codestream, CompressParams, DecompressParams, TileFetcher};
pub use jp2::{parse as parse_jp2, wrap as wrap_jp2, ColourSpec, Jp2File};
pub use math::{Point, Rect};
pub use pi::ProgressionOrder;

/// Magic bytes for JP2 per RFC 3745.
pub const JP2_RFC3745_MAGIC: [u8; 12] = [
  0x00, 0x00, 0x00, 0x0c, 0x6a, 0x50, 0x20, 0x20, 0x0d, 0x0a, 0x87, 0x0a,
];
/// Magic bytes for a raw J2K code stream (SOC immediately followed by
/// SIZ).
pub const J2K_CODESTREAM_MAGIC: [u8; 4] = [0xff, 0x4f, 0xff, 0x51];

/// Container formats this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
  Jp2,
  J2k,
}

/// Detects the container format from magic bytes.
pub fn detect_format(buf: &[u8]) -> Result<Format> {
  if buf.starts_with(&JP2_RFC3745_MAGIC) {
    Ok(Format::Jp2)
  } else if buf.starts_with(&J2K_CODESTREAM_MAGIC) {
    Ok(Format::J2k)
  } else {
    Err(Error::InvalidParameter(
      "cannot detect image format from magic bytes".into(),
    ))
  }
}

/// One-shot decode of a JP2 file or raw code stream.
pub fn decompress(data: &[u8], params: &DecompressParams) -> Result<Image> {
  match detect_format(data)? {
    Format::J2k => Codestream::new(data)?.decompress(params),
    Format::Jp2 => {
      let file = jp2::parse(data)?;
      let mut cs = Codestream::new(&data[file.codestream.clone()])?;
      cs.decompress(params)
    }
  }
}

/// One-shot encode into a JP2 file.
pub fn compress_jp2(img: &Image, params: &CompressParams) -> Result<Vec<u8>> {
  let stream = compress(img, params)?;
  Ok(jp2::wrap(&stream, img))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_detection() {
    assert_eq!(detect_format(&JP2_RFC3745_MAGIC).unwrap(), Format::Jp2);
    assert_eq!(
      detect_format(&[0xff, 0x4f, 0xff, 0x51, 0x00]).unwrap(),
      Format::J2k
    );
    assert!(detect_format(b"PNG").is_err());
  }
}
