//! Leaves: named, typed, array-valued nodes linked into a plant's chain.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::error::*;
use crate::sync::*;
use crate::values::*;

/// Keys up to this many bytes are stored inside the leaf header.
pub const KEY_INLINE_LEN: usize = 32;

/// The key of every plant's root leaf.
pub const LEAF_TYPE: &str = "type";

/// DJB2 string hash over the key's bytes.
pub fn hash_key(key: &str) -> u32 {
  key.bytes().fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

bitflags::bitflags! {
  /// Per-leaf flag bits.
  ///
  /// The upper 16 bits are reserved. Some of them carry internal state; none
  /// of them is reported by [`crate::Plant::flags`] and a caller-supplied
  /// value never changes them.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct LeafFlags: u32 {
    const UNDELETABLE = 1 << 0;
    const IMMUTABLE = 1 << 1;
    const RESERVED = 0xFFFF_0000;
  }
}

impl LeafFlags {
  /// Set on the root leaf while a delete is unlinking a leaf of the plant.
  pub(crate) const OP_DELETE: LeafFlags = LeafFlags::from_bits_retain(1 << 16);
  /// Set on a leaf once it is unlinked, and on the root leaf once the plant
  /// has been freed.
  pub(crate) const DEFUNCT: LeafFlags = LeafFlags::from_bits_retain(1 << 17);
}

// --- Keys ---

/// A leaf key. Short keys live inline; long ones are heap-duplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafKey {
  Inline { len: u8, buf: [u8; KEY_INLINE_LEN] },
  Heap(Box<str>),
}

impl LeafKey {
  pub(crate) fn new(key: &str) -> WeedResult<LeafKey> {
    let bytes = key.as_bytes();
    if bytes.len() <= KEY_INLINE_LEN {
      let mut buf = [0u8; KEY_INLINE_LEN];
      buf[..bytes.len()].copy_from_slice(bytes);
      return Ok(LeafKey::Inline { len: bytes.len() as u8, buf });
    }
    let mut s = String::new();
    s.try_reserve_exact(bytes.len())?;
    s.push_str(key);
    Ok(LeafKey::Heap(s.into_boxed_str()))
  }

  pub(crate) fn as_str(&self) -> &str {
    match self {
      // Inline bytes are always a prefix copied from a `&str`.
      LeafKey::Inline { len, buf } => core::str::from_utf8(&buf[..*len as usize]).unwrap_or(""),
      LeafKey::Heap(s) => s,
    }
  }

  pub(crate) fn is_inline(&self) -> bool {
    matches!(self, LeafKey::Inline { .. })
  }
}

// --- Leaf ---

/// State guarded by a leaf's value lock.
#[derive(Debug, Default)]
pub(crate) struct LeafData {
  pub(crate) values: Vec<Element>,
  /// Host-only opaque word, outside the portable value model.
  pub(crate) private: usize,
}

#[derive(Debug)]
pub(crate) struct Leaf {
  pub(crate) key: LeafKey,
  pub(crate) hash: u32,
  pub(crate) seed: SeedType,
  pub(crate) flags: AtomicU32,
  pub(crate) data: Guarded<LeafData>,
  /// Next leaf of the chain; null at the end. Written only by the holder
  /// of the plant's escalation mutex.
  pub(crate) next: AtomicPtr<Leaf>,
  pub(crate) locks: LockGroup,
}

impl Leaf {
  /// Allocates a leaf with an empty value array and no flags.
  pub(crate) fn new(key: &str, seed: SeedType, hash: u32) -> WeedResult<Box<Leaf>> {
    let key = LeafKey::new(key)?;
    Ok(Box::new(Leaf {
      key,
      hash,
      seed,
      flags: AtomicU32::new(0),
      data: Guarded::new(LeafData::default()),
      next: AtomicPtr::new(ptr::null_mut()),
      locks: LockGroup::new(),
    }))
  }

  pub(crate) fn matches(&self, key: &str, hash: u32) -> bool {
    self.hash == hash && self.key.as_str() == key
  }

  /// All flag bits, internal ones included.
  pub(crate) fn raw_flags(&self) -> LeafFlags {
    LeafFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
  }

  pub(crate) fn has_flag(&self, flag: LeafFlags) -> bool {
    self.raw_flags().contains(flag)
  }

  pub(crate) fn insert_flag(&self, flag: LeafFlags) {
    self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
  }

  pub(crate) fn remove_flag(&self, flag: LeafFlags) {
    self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
  }

  /// Flag bits as callers see them.
  pub(crate) fn public_flags(&self) -> LeafFlags {
    self.raw_flags().difference(LeafFlags::RESERVED)
  }

  /// Replaces the caller-visible flag bits, keeping reserved bits as they are.
  pub(crate) fn replace_public_flags(&self, flags: LeafFlags) {
    let public = flags.bits() & !LeafFlags::RESERVED.bits();
    let _ = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
      Some((old & LeafFlags::RESERVED.bits()) | public)
    });
  }

  pub(crate) fn next_ptr(&self) -> *mut Leaf {
    self.next.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn djb2_reference_values() {
    assert_eq!(hash_key(""), 5381);
    assert_eq!(hash_key("a"), 5381 * 33 + 97);
    assert_eq!(hash_key("type"), hash_key("type"));
    assert_ne!(hash_key("type"), hash_key("typf"));
    // Long keys wrap instead of overflowing.
    let long = "x".repeat(1000);
    let _ = hash_key(&long);
  }

  #[test]
  fn short_keys_inline_long_keys_heap() {
    let short = LeafKey::new("width").unwrap();
    assert!(short.is_inline());
    assert_eq!(short.as_str(), "width");

    let edge = "k".repeat(KEY_INLINE_LEN);
    let k = LeafKey::new(&edge).unwrap();
    assert!(k.is_inline());
    assert_eq!(k.as_str(), edge);

    let long = "k".repeat(KEY_INLINE_LEN + 1);
    let k = LeafKey::new(&long).unwrap();
    assert!(!k.is_inline());
    assert_eq!(k.as_str(), long);
  }

  #[test]
  fn multibyte_inline_key() {
    let k = LeafKey::new("größe").unwrap();
    assert_eq!(k.as_str(), "größe");
  }

  #[test]
  fn new_leaf_is_empty() {
    let leaf = Leaf::new("gamma", SeedType::DOUBLE, hash_key("gamma")).unwrap();
    assert!(leaf.matches("gamma", hash_key("gamma")));
    assert!(!leaf.matches("gamma2", hash_key("gamma2")));
    assert_eq!(leaf.raw_flags(), LeafFlags::empty());
    assert!(leaf.next_ptr().is_null());
    assert!(leaf.data.read(&leaf.locks.value).values.is_empty());
  }

  #[test]
  fn public_flag_updates_keep_reserved_bits() {
    let leaf = Leaf::new("x", SeedType::INT, hash_key("x")).unwrap();
    leaf.insert_flag(LeafFlags::OP_DELETE);
    leaf.replace_public_flags(LeafFlags::IMMUTABLE | LeafFlags::DEFUNCT);
    let f = leaf.raw_flags();
    assert!(f.contains(LeafFlags::IMMUTABLE));
    assert!(f.contains(LeafFlags::OP_DELETE));
    assert!(!f.contains(LeafFlags::DEFUNCT));
    assert_eq!(leaf.public_flags(), LeafFlags::IMMUTABLE);
    leaf.replace_public_flags(LeafFlags::empty());
    assert_eq!(leaf.raw_flags(), LeafFlags::OP_DELETE);
    leaf.remove_flag(LeafFlags::OP_DELETE);
    assert_eq!(leaf.raw_flags(), LeafFlags::empty());
  }
}
