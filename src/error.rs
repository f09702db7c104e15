//! Result codes shared by the host and every plugin.

use std::collections::TryReserveError;

/// The numeric code for a successful call.
pub const WEED_SUCCESS: i32 = 0;

/// Errors returned by plant and leaf operations.
///
/// Each variant maps onto a stable numeric code (see [`WeedError::code`]) so
/// that results can cross the host/plugin boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WeedError {
  /// A value array (or a key copy) could not be allocated.
  #[error("memory allocation failed")]
  MemoryAllocation,

  /// The key does not name a leaf of this plant.
  #[error("no such leaf")]
  NoSuchLeaf,

  /// The element index is past the end of the leaf's value array, or the
  /// element count is not allowed for this leaf.
  #[error("no such element")]
  NoSuchElement,

  /// The seed type does not match the leaf, or is not a valid seed type.
  #[error("wrong seed type")]
  WrongSeedType,

  /// The leaf is flagged immutable.
  #[error("leaf is immutable")]
  Immutable,

  /// The leaf (or one of the plant's leaves) is flagged undeletable.
  #[error("leaf is undeletable")]
  Undeletable,

  /// The operation was refused because it would race with a lock held on
  /// the same leaf.
  #[error("operation refused: leaf is locked")]
  Concurrency,

  /// The requested ABI version cannot be served.
  #[error("unsupported ABI version")]
  BadVersion,
}

impl WeedError {
  /// Returns the stable numeric code of this error.
  pub fn code(&self) -> i32 {
    match self {
      WeedError::MemoryAllocation => 1,
      WeedError::NoSuchLeaf => 2,
      WeedError::NoSuchElement => 3,
      WeedError::WrongSeedType => 4,
      WeedError::Immutable => 5,
      WeedError::Undeletable => 6,
      WeedError::Concurrency => 7,
      WeedError::BadVersion => 8,
    }
  }

  /// Maps a numeric code back to an error. `WEED_SUCCESS` and unknown codes
  /// yield `None`.
  pub fn from_code(code: i32) -> Option<WeedError> {
    match code {
      1 => Some(WeedError::MemoryAllocation),
      2 => Some(WeedError::NoSuchLeaf),
      3 => Some(WeedError::NoSuchElement),
      4 => Some(WeedError::WrongSeedType),
      5 => Some(WeedError::Immutable),
      6 => Some(WeedError::Undeletable),
      7 => Some(WeedError::Concurrency),
      8 => Some(WeedError::BadVersion),
      _ => None,
    }
  }
}

impl From<TryReserveError> for WeedError {
  fn from(_: TryReserveError) -> Self {
    WeedError::MemoryAllocation
  }
}

/// Result alias for plant and leaf operations.
pub type WeedResult<T> = Result<T, WeedError>;

/// Collapses a result into its numeric code, `WEED_SUCCESS` for `Ok`.
pub fn result_code<T>(result: &WeedResult<T>) -> i32 {
  match result {
    Ok(_) => WEED_SUCCESS,
    Err(e) => e.code(),
  }
}
