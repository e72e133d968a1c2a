//! Shared numeric constants and style flags.

use bitflags::bitflags;

/// Number of adaptive contexts carried by one MQ coder.
pub const MQC_NUMCTXS: usize = 19;

/// T1 context numbering: 9 zero-coding, 5 sign-coding, 3 magnitude,
/// 1 aggregation, 1 uniform.
pub const T1_NUMCTXS_ZC: u8 = 9;
pub const T1_NUMCTXS_SC: u8 = 5;
pub const T1_NUMCTXS_MAG: u8 = 3;
pub const T1_CTXNO_ZC: u8 = 0;
pub const T1_CTXNO_SC: u8 = T1_CTXNO_ZC + T1_NUMCTXS_ZC;
pub const T1_CTXNO_MAG: u8 = T1_CTXNO_SC + T1_NUMCTXS_SC;
pub const T1_CTXNO_AGG: u8 = T1_CTXNO_MAG + T1_NUMCTXS_MAG;
pub const T1_CTXNO_UNI: u8 = T1_CTXNO_AGG + 1;

/// Fractional bits carried through the distortion estimate.
pub const T1_NMSEDEC_BITS: u32 = 7;
pub const T1_NMSEDEC_FRACBITS: u32 = T1_NMSEDEC_BITS - 1;

/// A code block never exceeds 4096 samples and 64 samples per side.
pub const MAX_CBLK_LOG2_DIM: u32 = 6;
pub const MIN_CBLK_LOG2_DIM: u32 = 2;

/// Bit planes above the sign never exceed this for Part 1 streams.
pub const MAX_BIT_PLANES: u8 = 31;

/// Up to `3 * 31 - 2` coding passes can exist in one code block.
pub const MAX_PASSES: usize = 3 * MAX_BIT_PLANES as usize - 2;

/// Sentinel "unbounded" pass budget for a segment when no mode switch
/// terminates it early.
pub const MAX_PASSES_PER_SEGMENT: u8 = 109;

/// Highest number of decomposition levels (hence `numresolutions <= 33`).
pub const MAX_DECOMP_LEVELS: u32 = 32;

/// Bytes remaining in a block's compressed data at which the decoder must
/// take an entropy-state checkpoint to support differential
/// re-decompression.
pub const MQ_RED_ZONE: usize = 6;

bitflags! {
  /// Code-block style switches (`Scod`/`SPcod` flags).
  #[derive(Default)]
  pub struct CblkSty: u8 {
    /// Arithmetic bypass after the fourth most significant bit plane.
    const LAZY = 0x01;
    /// Reset context states at the end of every coding pass.
    const RESET = 0x02;
    /// Terminate every coding pass.
    const TERMALL = 0x04;
    /// Vertically causal context formation.
    const VSC = 0x08;
    /// Predictable termination.
    const PTERM = 0x10;
    /// Segmentation symbols at the end of every cleanup pass.
    const SEGSYM = 0x20;
    /// Block carries HT (high-throughput) coded data.
    const HT = 0x40;
  }
}

bitflags! {
  /// `Scod` bits that are not code-block style.
  #[derive(Default)]
  pub struct CodingStyle: u8 {
    /// Precinct sizes are signalled explicitly.
    const PRECINCTS = 0x01;
    /// SOP markers precede every packet.
    const SOP = 0x02;
    /// EPH markers terminate every packet header.
    const EPH = 0x04;
  }
}

/// Sub-band orientation within a resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BandOrientation {
  #[default]
  LL = 0,
  HL = 1,
  LH = 2,
  HH = 3,
}

impl BandOrientation {
  pub fn from_band_index(resno: u32, bandno: u32) -> Self {
    if resno == 0 {
      BandOrientation::LL
    } else {
      match bandno {
        0 => BandOrientation::HL,
        1 => BandOrientation::LH,
        _ => BandOrientation::HH,
      }
    }
  }
}

/// Quantisation style from `Sqcd`/`Sqcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantStyle {
  NoQuant,
  ScalarDerived,
  ScalarExpounded,
}

/// Sample packing requested by a format adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplePacking {
  U8,
  U16Be,
  U16Le,
}
