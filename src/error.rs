//! Error kinds raised by the codec core.
//!
//! Kinds map one-to-one onto the recovery policy of the decoder: some are
//! fatal for the whole code stream, some for a single tile, and some are
//! absorbed after dropping a block (the caller sees only a warning).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// Unknown or out-of-place marker in the main header.
  #[error("invalid marker 0x{0:04x}")]
  InvalidMarker(u16),

  /// Box length smaller than its own header.
  #[error("corrupt box '{0}'")]
  CorruptBox(&'static str),

  /// SOT fields inconsistent, e.g. `TPsot >= TNsot`.
  #[error("corrupt SOT for tile {tile}: {reason}")]
  CorruptSot { tile: u16, reason: &'static str },

  /// TLM table disagrees with the on-the-wire tile parts.
  #[error("corrupt TLM: {0}")]
  CorruptTlm(&'static str),

  /// Tag-tree or length bits overflowed while parsing a packet header.
  #[error("corrupt packet header: {0}")]
  CorruptPacketHeader(&'static str),

  /// Signalled segment bytes exceed the remaining tile-part bytes.
  #[error("corrupt packet data: {0}")]
  CorruptPacketData(&'static str),

  /// T1 detected an invalid state transition.
  #[error("corrupt code block: {0}")]
  CorruptCodeblock(&'static str),

  /// Allocation failure or a size that cannot be represented.
  #[error("resource exhausted: {0}")]
  ResourceExhausted(&'static str),

  /// The external cancel flag was observed set.
  #[error("cancelled")]
  Cancelled,

  /// Rate allocation cannot meet the target rate with at least one layer.
  #[error("rate target of {target_bytes} bytes cannot be met")]
  WouldExceedBudget { target_bytes: u64 },

  /// Caller-supplied parameter out of range.
  #[error("invalid parameter: {0}")]
  InvalidParameter(String),

  /// Truncated input: fewer bytes than a marker/box header requires.
  #[error("unexpected end of stream while reading {0}")]
  TruncatedStream(&'static str),

  /// Feature signalled by the stream but not carried by this build.
  #[error("unsupported: {0}")]
  Unsupported(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
