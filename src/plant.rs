//! Plants: the root leaf of a chain of leaves, and every operation on them.
//!
//! A plant is shared between threads by reference. Reads walk the chain
//! without locking links unless a delete is in flight; in that case they
//! switch to "checking mode" and walk hand over hand on each leaf's link
//! lock. A deleter flags the plant, drains the fast-path readers, relinks
//! the predecessor under its link lock, clears the flag, and only frees the
//! target once it can take every lock of the target's lock group.

use core::ffi::c_void;
use core::mem;
use core::ptr;

use crate::error::*;
use crate::leaf::*;
use crate::sync::*;
use crate::values::*;

// --- Traversal ---

/// What keeps the leaf under a cursor alive.
enum Hold<'p> {
  /// Registered in the plant's traversal counter. Links are followed
  /// without locking.
  Fast(#[allow(dead_code)] ReadGuard<'p>),
  /// Shared link lock of the leaf under the cursor.
  Checking(ReadGuard<'p>),
}

/// A reader positioned on a leaf of a plant's chain.
///
/// The leaf cannot be unlinked-and-freed while the cursor exists.
struct Cursor<'p> {
  leaf: &'p Leaf,
  hold: Hold<'p>,
}

impl<'p> Cursor<'p> {
  /// Steps onto the next leaf. Returns `false` at the end of the chain,
  /// leaving the cursor where it was.
  fn advance(&mut self) -> bool {
    let next = self.leaf.next_ptr();
    if next.is_null() {
      return false;
    }
    // SAFETY: `next` cannot be freed while we hold our position on its
    // predecessor. Fast-path holders are drained before any relink; in
    // checking mode the deleter must take the link lock we hold before it
    // relinks past `next`, and the link lock of `next` before freeing it.
    let next: &'p Leaf = unsafe { &*next };
    if let Hold::Checking(held) = &mut self.hold {
      // The new link lock is taken before the old one is released.
      *held = next.locks.link.read();
    }
    self.leaf = next;
    true
  }

  fn is_checking(&self) -> bool {
    matches!(self.hold, Hold::Checking(_))
  }
}

enum Lookup<'p> {
  Found(Cursor<'p>),
  /// The key is absent. The cursor rests on the last leaf of the chain.
  Missing(Cursor<'p>),
  Defunct,
}

// --- Plant ---

/// A typed, extensible property bag.
///
/// Every plant carries a root leaf keyed [`LEAF_TYPE`] holding a single
/// immutable integer that classifies it. Other leaves are created on first
/// write and destroyed by [`Plant::delete`] or [`Plant::free`].
///
/// ```
/// use weed::{Plant, SeedType, Value};
///
/// let plant = Plant::new(1).unwrap();
/// plant.set("width", SeedType::INT, &[Value::Int(640)]).unwrap();
/// assert_eq!(plant.get("width", 0).unwrap(), Value::Int(640));
/// assert_eq!(plant.get("type", 0).unwrap(), Value::Int(1));
/// ```
#[derive(Debug)]
pub struct Plant {
  root: Box<Leaf>,
  locks: PlantLocks,
  debug: bool,
}

// SAFETY: every interior-mutable field of the plant and its leaves is either
// atomic or only accessed under the locks of `sync`, following the
// traversal and deletion protocols described at the top of this module.
#[cfg(not(feature = "single_threaded"))]
unsafe impl Sync for Plant {}

impl Plant {
  /// Creates a plant whose root leaf holds ```plant_type```.
  pub fn new(plant_type: i32) -> WeedResult<Plant> {
    Plant::new_with(plant_type, false)
  }

  pub(crate) fn new_with(plant_type: i32, debug: bool) -> WeedResult<Plant> {
    let root = Leaf::new(LEAF_TYPE, SeedType::INT, hash_key(LEAF_TYPE))?;
    let values = new_values(SeedType::INT, &[Value::Int(plant_type)])?;
    root.data.write(&root.locks.value).values = values;
    root.insert_flag(LeafFlags::IMMUTABLE);
    if debug {
      log::debug!("new plant of type {}", plant_type);
    }
    Ok(Plant { root, locks: PlantLocks::new(), debug })
  }

  /// Returns ```true``` for plants that log every operation.
  pub fn is_debug(&self) -> bool {
    self.debug
  }

  fn root(&self) -> &Leaf {
    &self.root
  }

  fn is_root(&self, leaf: &Leaf) -> bool {
    ptr::eq(leaf, self.root())
  }

  /// Positions a reader on the root leaf, or `None` once the plant is freed.
  fn cursor(&self) -> Option<Cursor<'_>> {
    let root = self.root();
    let fast = if root.has_flag(LeafFlags::OP_DELETE) { None } else { self.locks.traversals.try_read() };
    let hold = match fast {
      Some(registration) => Hold::Fast(registration),
      None => {
        log::trace!("delete in flight, traversing in checking mode");
        Hold::Checking(root.locks.link.read())
      }
    };
    if root.has_flag(LeafFlags::DEFUNCT) {
      return None;
    }
    Some(Cursor { leaf: root, hold })
  }

  fn lookup(&self, key: &str, hash: u32) -> Lookup<'_> {
    let Some(mut cursor) = self.cursor() else {
      return Lookup::Defunct;
    };
    if key.is_empty() {
      return Lookup::Found(cursor);
    }
    loop {
      if cursor.leaf.matches(key, hash) {
        return Lookup::Found(cursor);
      }
      if !cursor.advance() {
        return Lookup::Missing(cursor);
      }
    }
  }

  fn find(&self, key: &str) -> Option<Cursor<'_>> {
    match self.lookup(key, hash_key(key)) {
      Lookup::Found(cursor) => Some(cursor),
      _ => None,
    }
  }

  /// Walks the chain as the sole mutator, returning the leaf named ```key```
  /// together with its predecessor.
  ///
  /// Must only be called while holding the escalation mutex.
  fn locate(&self, key: &str, hash: u32) -> Option<(&Leaf, *mut Leaf)> {
    self.locate_where(|leaf| leaf.matches(key, hash))
  }

  fn locate_where(&self, mut hit: impl FnMut(&Leaf) -> bool) -> Option<(&Leaf, *mut Leaf)> {
    let mut pred = self.root();
    loop {
      let next = pred.next_ptr();
      if next.is_null() {
        return None;
      }
      // SAFETY: leaves are only freed by the holder of the escalation
      // mutex, which is the caller.
      let leaf = unsafe { &*next };
      if hit(leaf) {
        return Some((pred, next));
      }
      pred = leaf;
    }
  }

  /// Unlinks ```target``` from behind ```pred``` and frees it.
  ///
  /// The undeletable flag is checked again under the target's writer mutex,
  /// the same mutex [`Plant::set_flags`] holds, and the leaf is left in place
  /// with `Undeletable` if it is set. An unlinked leaf is marked defunct
  /// before the relink so that writers still positioned on it fail.
  ///
  /// # Safety
  ///
  /// The caller must hold the escalation mutex, ```pred.next``` must be
  /// ```target```, and ```target``` must have come from `Box::into_raw`.
  unsafe fn unlink(&self, pred: &Leaf, target: *mut Leaf) -> WeedResult<()> {
    let root = self.root();
    let t = &*target;
    root.insert_flag(LeafFlags::OP_DELETE);
    let drain = self.locks.traversals.write();
    let relinked = {
      let _link = pred.locks.link.write();
      let _writer = t.locks.writer.lock();
      if t.has_flag(LeafFlags::UNDELETABLE) {
        false
      } else {
        t.insert_flag(LeafFlags::DEFUNCT);
        pred.next.store(t.next_ptr(), core::sync::atomic::Ordering::Release);
        true
      }
    };
    root.remove_flag(LeafFlags::OP_DELETE);
    drop(drain);
    if !relinked {
      log::trace!("leaf {} became undeletable, left in place", t.key.as_str());
      return Err(WeedError::Undeletable);
    }
    {
      // Only succeeds once no checking-mode reader is left on the target.
      let _link = t.locks.link.write();
      let _writer = t.locks.writer.lock();
      let _value = t.locks.value.write();
    }
    log::trace!("freeing leaf {}", t.key.as_str());
    drop(Box::from_raw(target));
    Ok(())
  }

  // --- Lifecycle ---

  /// Frees every leaf of the plant, and then the plant itself.
  ///
  /// Leaves flagged [`LeafFlags::UNDELETABLE`] survive. If any does, the plant
  /// stays usable with exactly those leaves left, and `Undeletable` is
  /// returned; clear the flags and call again. Once this succeeds the plant
  /// is defunct: every lookup reports `NoSuchLeaf`.
  pub fn free(&self) -> WeedResult<()> {
    let root = self.root();
    if root.has_flag(LeafFlags::UNDELETABLE) {
      return Err(WeedError::Undeletable);
    }
    let _rights: LockState<'_, ()> = LockState::Unlocked.escalate(&self.locks);
    if root.has_flag(LeafFlags::DEFUNCT) {
      return Err(WeedError::NoSuchLeaf);
    }

    let mut pred = root;
    loop {
      let next = pred.next_ptr();
      if next.is_null() {
        break;
      }
      // SAFETY: we hold the escalation mutex; nobody else unlinks or frees.
      let flagged = unsafe { (*next).has_flag(LeafFlags::UNDELETABLE) };
      // SAFETY: escalation held, `pred.next == next`, chain leaves are boxed.
      if flagged || unsafe { self.unlink(pred, next) }.is_err() {
        // SAFETY: as above, and the leaf stays linked.
        pred = unsafe { &*next };
      }
    }

    if !root.next_ptr().is_null() {
      log::warn!("plant of type {:?} kept alive by undeletable leaves", self.plant_type().ok());
      return Err(WeedError::Undeletable);
    }

    root.insert_flag(LeafFlags::OP_DELETE);
    let drain = self.locks.traversals.write();
    let old = {
      let _link = root.locks.link.write();
      let _writer = root.locks.writer.lock();
      if root.has_flag(LeafFlags::UNDELETABLE) {
        None
      } else {
        let mut data = root.data.write(&root.locks.value);
        root.insert_flag(LeafFlags::DEFUNCT);
        Some(mem::take(&mut *data))
      }
    };
    root.remove_flag(LeafFlags::OP_DELETE);
    drop(drain);
    if old.is_none() {
      return Err(WeedError::Undeletable);
    }
    drop(old);
    if self.debug {
      log::debug!("plant freed");
    }
    Ok(())
  }

  /// Returns ```true``` once [`Plant::free`] has succeeded.
  pub fn is_defunct(&self) -> bool {
    self.root().has_flag(LeafFlags::DEFUNCT)
  }

  /// Returns a copy of every live key, the root's key first.
  ///
  /// The order of the remaining keys is most-recently-created first.
  pub fn keys(&self) -> WeedResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    let Some(mut cursor) = self.cursor() else {
      return Ok(out);
    };
    loop {
      let key = cursor.leaf.key.as_str();
      let mut copy = String::new();
      copy.try_reserve_exact(key.len())?;
      copy.push_str(key);
      out.try_reserve(1)?;
      out.push(copy);
      if !cursor.advance() {
        break;
      }
    }
    drop(cursor);
    out.shrink_to_fit();
    Ok(out)
  }

  /// Number of live leaves, the root included. 0 once the plant is freed.
  pub fn len(&self) -> usize {
    let Some(mut cursor) = self.cursor() else {
      return 0;
    };
    let mut n = 1;
    while cursor.advance() {
      n += 1;
    }
    n
  }

  /// A live plant always has its ```type``` leaf, so this is ```true``` only
  /// once the plant has been freed.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns ```true``` if ```key``` names a live leaf.
  pub fn has(&self, key: &str) -> bool {
    self.find(key).is_some()
  }

  /// The integer stored in the root leaf.
  pub fn plant_type(&self) -> WeedResult<i32> {
    self.get(LEAF_TYPE, 0)?.as_int().ok_or(WeedError::WrongSeedType)
  }

  // --- Leaf values ---

  /// Replaces the value array of ```key```, creating the leaf if needed.
  ///
  /// An existing leaf keeps its seed type (`WrongSeedType` otherwise) and
  /// must not be immutable (`Immutable`). The root leaf always holds exactly
  /// one value (`NoSuchElement`). The new array is fully built before it is
  /// published, so concurrent readers see either the old or the new array.
  pub fn set(&self, key: &str, seed: SeedType, values: &[Value]) -> WeedResult<()> {
    let hash = hash_key(key);
    let res = match self.lookup(key, hash) {
      Lookup::Defunct => Err(WeedError::NoSuchLeaf),
      Lookup::Found(cursor) => self.update(cursor.leaf, seed, values),
      Lookup::Missing(cursor) => self.insert(cursor, key, hash, seed, values),
    };
    if self.debug {
      log::debug!("set {} ({}, {} values): {:?}", key, seed, values.len(), res);
    }
    res
  }

  fn update(&self, leaf: &Leaf, seed: SeedType, values: &[Value]) -> WeedResult<()> {
    if leaf.seed != seed {
      return Err(WeedError::WrongSeedType);
    }
    let _writer = leaf.locks.writer.lock();
    if leaf.has_flag(LeafFlags::DEFUNCT) {
      return Err(WeedError::NoSuchLeaf);
    }
    if leaf.has_flag(LeafFlags::IMMUTABLE) {
      return Err(WeedError::Immutable);
    }
    if self.is_root(leaf) && values.len() != 1 {
      return Err(WeedError::NoSuchElement);
    }
    let fresh = new_values(seed, values)?;
    let old = mem::replace(&mut leaf.data.write(&leaf.locks.value).values, fresh);
    drop(old);
    Ok(())
  }

  fn insert(&self, cursor: Cursor<'_>, key: &str, hash: u32, seed: SeedType, values: &[Value]) -> WeedResult<()> {
    if !seed.is_valid() {
      return Err(WeedError::WrongSeedType);
    }
    let checking = cursor.is_checking();
    let rights = LockState::ReadLocked(cursor).escalate(&self.locks);
    debug_assert!(rights.is_write_locked());
    if !rights.retained() {
      log::trace!("insert of {} re-resolving after contended escalation (checking: {})", key, checking);
    }
    if self.is_defunct() {
      return Err(WeedError::NoSuchLeaf);
    }
    // Another writer may have created the key before we got the rights.
    if let Some((_, leaf)) = self.locate(key, hash) {
      // SAFETY: we hold the escalation mutex; the leaf cannot be freed.
      return self.update(unsafe { &*leaf }, seed, values);
    }

    let fresh = new_values(seed, values)?;
    let leaf = Leaf::new(key, seed, hash)?;
    leaf.data.write(&leaf.locks.value).values = fresh;
    log::trace!("linking new leaf {} (inline key: {})", key, leaf.key.is_inline());
    let root = self.root();
    leaf.next.store(root.next_ptr(), core::sync::atomic::Ordering::Relaxed);
    root.next.store(Box::into_raw(leaf), core::sync::atomic::Ordering::Release);
    drop(rights);
    Ok(())
  }

  /// Copies element ```index``` of ```key```.
  pub fn get(&self, key: &str, index: usize) -> WeedResult<Value> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let leaf = cursor.leaf;
    let data = leaf.data.read(&leaf.locks.value);
    let res = data.values.get(index).ok_or(WeedError::NoSuchElement)?.value(leaf.seed);
    drop(data);
    drop(cursor);
    if self.debug {
      log::debug!("get {}[{}]: {:?}", key, index, res);
    }
    res
  }

  /// Checks that element ```index``` of ```key``` exists without copying it.
  pub fn probe(&self, key: &str, index: usize) -> WeedResult<()> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let leaf = cursor.leaf;
    let data = leaf.data.read(&leaf.locks.value);
    if index < data.values.len() { Ok(()) } else { Err(WeedError::NoSuchElement) }
  }

  /// Number of elements of ```key```, 0 if the leaf does not exist.
  pub fn num_elements(&self, key: &str) -> usize {
    let Some(cursor) = self.find(key) else {
      return 0;
    };
    let leaf = cursor.leaf;
    let n = leaf.data.read(&leaf.locks.value).values.len();
    n
  }

  /// Size in bytes of element ```index``` of ```key```: the string length
  /// for strings, the fixed size otherwise. 0 if absent.
  pub fn element_size(&self, key: &str, index: usize) -> usize {
    let Some(cursor) = self.find(key) else {
      return 0;
    };
    let leaf = cursor.leaf;
    let size = leaf.data.read(&leaf.locks.value).values.get(index).map_or(0, |e| e.size(leaf.seed));
    size
  }

  /// Seed type of ```key```, [`SeedType::INVALID`] if absent.
  pub fn seed_type(&self, key: &str) -> SeedType {
    self.find(key).map_or(SeedType::INVALID, |c| c.leaf.seed)
  }

  /// Caller-visible flags of ```key```, empty if absent.
  pub fn flags(&self, key: &str) -> LeafFlags {
    self.find(key).map_or(LeafFlags::empty(), |c| c.leaf.public_flags())
  }

  /// Replaces the flags of ```key```. Reserved bits keep their current value.
  /// Host only.
  pub fn set_flags(&self, key: &str, flags: LeafFlags) -> WeedResult<()> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let _writer = cursor.leaf.locks.writer.lock();
    if cursor.leaf.has_flag(LeafFlags::DEFUNCT) {
      return Err(WeedError::NoSuchLeaf);
    }
    cursor.leaf.replace_public_flags(flags);
    Ok(())
  }

  /// Unlinks and frees ```key```. The root leaf cannot be deleted.
  pub fn delete(&self, key: &str) -> WeedResult<()> {
    let hash = hash_key(key);
    let cursor = match self.lookup(key, hash) {
      Lookup::Found(cursor) => cursor,
      _ => return Err(WeedError::NoSuchLeaf),
    };
    if self.is_root(cursor.leaf) {
      return Err(WeedError::NoSuchLeaf);
    }
    if cursor.leaf.has_flag(LeafFlags::UNDELETABLE) {
      return Err(WeedError::Undeletable);
    }
    let target: *const Leaf = cursor.leaf;
    let rights = LockState::ReadLocked(cursor).escalate(&self.locks);

    // With the read retained nobody can have unlinked the target, so it is
    // found by identity; otherwise it has to be looked up again.
    let found = if rights.retained() {
      self.locate_where(|leaf| ptr::eq(leaf, target))
    } else {
      self.locate(key, hash)
    };
    let (pred, target) = found.ok_or(WeedError::NoSuchLeaf)?;
    // SAFETY: escalation held.
    if unsafe { (*target).has_flag(LeafFlags::UNDELETABLE) } {
      return Err(WeedError::Undeletable);
    }
    // SAFETY: escalation held, `pred.next == target`, chain leaves are boxed.
    unsafe { self.unlink(pred, target) }?;
    drop(rights);
    if self.debug {
      log::debug!("deleted {}", key);
    }
    Ok(())
  }

  // --- Host-only private data ---

  /// Stores an opaque host word on ```key```.
  ///
  /// Refused with `Concurrency` instead of waiting if the leaf's value is
  /// being read or written at the same moment.
  pub fn set_private_data(&self, key: &str, data: *mut c_void) -> WeedResult<()> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let leaf = cursor.leaf;
    let mut slot = leaf.data.try_write(&leaf.locks.value).ok_or(WeedError::Concurrency)?;
    slot.private = data as usize;
    Ok(())
  }

  /// Reads the opaque host word of ```key``` (null if never set).
  pub fn get_private_data(&self, key: &str) -> WeedResult<*mut c_void> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let leaf = cursor.leaf;
    let slot = leaf.data.try_read(&leaf.locks.value).ok_or(WeedError::Concurrency)?;
    Ok(slot.private as *mut c_void)
  }

  // --- Typed convenience layer ---

  /// Same as [`Plant::set`].
  pub fn set_array(&self, key: &str, seed: SeedType, values: &[Value]) -> WeedResult<()> {
    self.set(key, seed, values)
  }

  /// Copies every element of ```key``` under one read of its value lock.
  pub fn get_array(&self, key: &str) -> WeedResult<Vec<Value>> {
    let cursor = self.find(key).ok_or(WeedError::NoSuchLeaf)?;
    let leaf = cursor.leaf;
    let data = leaf.data.read(&leaf.locks.value);
    let mut out = Vec::new();
    out.try_reserve_exact(data.values.len())?;
    for e in data.values.iter() {
      out.push(e.value(leaf.seed)?);
    }
    Ok(out)
  }

  pub fn set_int(&self, key: &str, val: i32) -> WeedResult<()> { self.set(key, SeedType::INT, &[Value::Int(val)]) }
  pub fn set_int64(&self, key: &str, val: i64) -> WeedResult<()> { self.set(key, SeedType::INT64, &[Value::Int64(val)]) }
  pub fn set_double(&self, key: &str, val: f64) -> WeedResult<()> { self.set(key, SeedType::DOUBLE, &[Value::Double(val)]) }
  pub fn set_boolean(&self, key: &str, val: bool) -> WeedResult<()> { self.set(key, SeedType::BOOLEAN, &[Value::Boolean(val)]) }
  pub fn set_string(&self, key: &str, val: &str) -> WeedResult<()> { self.set(key, SeedType::STRING, &[Value::String(val.to_string())]) }
  pub fn set_pointer(&self, key: &str, seed: SeedType, val: *mut c_void) -> WeedResult<()> { self.set(key, seed, &[Value::Pointer(val)]) }

  pub fn get_int(&self, key: &str) -> WeedResult<i32> { self.get(key, 0)?.as_int().ok_or(WeedError::WrongSeedType) }
  pub fn get_int64(&self, key: &str) -> WeedResult<i64> { self.get(key, 0)?.as_int64().ok_or(WeedError::WrongSeedType) }
  pub fn get_double(&self, key: &str) -> WeedResult<f64> { self.get(key, 0)?.as_double().ok_or(WeedError::WrongSeedType) }
  pub fn get_boolean(&self, key: &str) -> WeedResult<bool> { self.get(key, 0)?.as_boolean().ok_or(WeedError::WrongSeedType) }
  pub fn get_pointer(&self, key: &str) -> WeedResult<*mut c_void> { self.get(key, 0)?.as_pointer().ok_or(WeedError::WrongSeedType) }
  pub fn get_string(&self, key: &str) -> WeedResult<String> {
    match self.get(key, 0)? {
      Value::String(s) => Ok(s),
      _ => Err(WeedError::WrongSeedType),
    }
  }
}

// --- Serialization ---

impl Plant {
  /// Renders the plant as a JSON object mapping each key to its value array.
  pub fn to_string(&self) -> String {
    #[cfg(feature = "serde_support")]
    {
      self.to_json().to_string()
    }
    #[cfg(not(feature = "serde_support"))]
    {
      crate::json_util::plant_to_string(self)
    }
  }

  #[cfg(feature = "serde_support")]
  pub fn to_json(&self) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for key in self.keys().unwrap_or_default() {
      // Deleted since the keys were listed.
      let Ok(values) = self.get_array(&key) else {
        continue;
      };
      map.insert(key, serde_json::Value::Array(values.iter().map(Value::to_json).collect()));
    }
    serde_json::Value::Object(map)
  }
}

impl Drop for Plant {
  fn drop(&mut self) {
    let mut next = *self.root.next.get_mut();
    while !next.is_null() {
      // SAFETY: `&mut self` proves no reader or mutator is active, and every
      // chain leaf came from `Box::into_raw` and is reachable exactly once.
      let mut leaf = unsafe { Box::from_raw(next) };
      next = *leaf.next.get_mut();
    }
  }
}
