//! Lock primitives and the lock groups used by the plant traversal and
//! deletion protocols.
//!
//! Every lock here is a raw `parking_lot` lock driven through RAII guards, so
//! that a failure path can never return while still holding one. With the
//! `single_threaded` feature all locks become no-ops, and the types that
//! contain them stop being `Sync`.
//!
//! Lock order, wherever more than one is held:
//!
//! 1. plant `escalation` (chain mutation rights)
//! 2. plant `traversals` (exclusive only, to drain fast-path readers)
//! 3. leaf `link`, predecessor before target
//! 4. leaf `writer`
//! 5. leaf `value`

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

#[cfg(not(feature = "single_threaded"))]
use parking_lot::lock_api::{RawMutex as _, RawRwLock as _};

#[cfg(feature = "single_threaded")]
use core::{cell::Cell, marker::PhantomData};

// --- Contention reporting ---

#[cfg(not(feature = "single_threaded"))]
#[inline]
fn contended(what: &'static str) {
  #[cfg(feature = "debug_mutex")]
  log::trace!("blocking on {}\n{:?}", what, backtrace::Backtrace::new());
  #[cfg(not(feature = "debug_mutex"))]
  log::trace!("blocking on {}", what);
}

// --- Read/write lock ---

/// A read/write lock with no data of its own.
///
/// The protected state lives next to the lock (a leaf's `next` link, a
/// leaf's value array) and is only touched while a guard is alive.
pub(crate) struct RwSlot {
  name: &'static str,
  #[cfg(not(feature = "single_threaded"))]
  raw: parking_lot::RawRwLock,
  #[cfg(feature = "single_threaded")]
  _local: PhantomData<Cell<()>>,
}

#[cfg(not(feature = "single_threaded"))]
impl RwSlot {
  pub(crate) const fn new(name: &'static str) -> RwSlot {
    RwSlot { name, raw: <parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT }
  }

  fn acquire_shared(&self) {
    if !self.raw.try_lock_shared() {
      contended(self.name);
      self.raw.lock_shared();
    }
  }

  fn attempt_shared(&self) -> bool {
    self.raw.try_lock_shared()
  }

  fn acquire_exclusive(&self) {
    if !self.raw.try_lock_exclusive() {
      contended(self.name);
      self.raw.lock_exclusive();
    }
  }

  fn attempt_exclusive(&self) -> bool {
    self.raw.try_lock_exclusive()
  }

  /// # Safety
  /// The caller must own a shared hold on this lock.
  unsafe fn release_shared(&self) {
    self.raw.unlock_shared();
  }

  /// # Safety
  /// The caller must own the exclusive hold on this lock.
  unsafe fn release_exclusive(&self) {
    self.raw.unlock_exclusive();
  }
}

#[cfg(feature = "single_threaded")]
impl RwSlot {
  pub(crate) const fn new(name: &'static str) -> RwSlot {
    RwSlot { name, _local: PhantomData }
  }

  fn acquire_shared(&self) {}

  fn attempt_shared(&self) -> bool {
    true
  }

  fn acquire_exclusive(&self) {}

  fn attempt_exclusive(&self) -> bool {
    true
  }

  unsafe fn release_shared(&self) {}

  unsafe fn release_exclusive(&self) {}
}

impl fmt::Debug for RwSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RwSlot").field("name", &self.name).finish_non_exhaustive()
  }
}

impl RwSlot {
  /// Acquires a shared hold, blocking while a writer owns the lock.
  pub(crate) fn read(&self) -> ReadGuard<'_> {
    self.acquire_shared();
    ReadGuard { slot: self }
  }

  /// Makes one non-blocking attempt at a shared hold.
  pub(crate) fn try_read(&self) -> Option<ReadGuard<'_>> {
    self.attempt_shared().then(|| ReadGuard { slot: self })
  }

  /// Acquires the exclusive hold. Returns once every shared holder has left.
  pub(crate) fn write(&self) -> WriteGuard<'_> {
    self.acquire_exclusive();
    WriteGuard { slot: self }
  }

  /// Makes one non-blocking attempt at the exclusive hold.
  pub(crate) fn try_write(&self) -> Option<WriteGuard<'_>> {
    self.attempt_exclusive().then(|| WriteGuard { slot: self })
  }
}

/// A shared hold on an [`RwSlot`], released on drop.
#[derive(Debug)]
#[must_use = "if unused the lock will immediately unlock"]
pub(crate) struct ReadGuard<'a> {
  slot: &'a RwSlot,
}

impl Drop for ReadGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    // SAFETY: a ReadGuard is only constructed after a successful shared
    // acquisition of `slot`, and each guard releases it exactly once.
    unsafe { self.slot.release_shared() }
  }
}

/// An exclusive hold on an [`RwSlot`], released on drop.
#[derive(Debug)]
#[must_use = "if unused the lock will immediately unlock"]
pub(crate) struct WriteGuard<'a> {
  slot: &'a RwSlot,
}

impl Drop for WriteGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    // SAFETY: a WriteGuard is only constructed after a successful exclusive
    // acquisition of `slot`, and each guard releases it exactly once.
    unsafe { self.slot.release_exclusive() }
  }
}

// --- Mutex ---

/// A mutex with no data of its own.
pub(crate) struct MutexSlot {
  name: &'static str,
  #[cfg(not(feature = "single_threaded"))]
  raw: parking_lot::RawMutex,
  #[cfg(feature = "single_threaded")]
  _local: PhantomData<Cell<()>>,
}

#[cfg(not(feature = "single_threaded"))]
impl MutexSlot {
  pub(crate) const fn new(name: &'static str) -> MutexSlot {
    MutexSlot { name, raw: <parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::INIT }
  }

  fn acquire(&self) {
    if !self.raw.try_lock() {
      contended(self.name);
      self.raw.lock();
    }
  }

  fn attempt(&self) -> bool {
    self.raw.try_lock()
  }

  /// # Safety
  /// The caller must own this mutex.
  unsafe fn release(&self) {
    self.raw.unlock();
  }
}

#[cfg(feature = "single_threaded")]
impl MutexSlot {
  pub(crate) const fn new(name: &'static str) -> MutexSlot {
    MutexSlot { name, _local: PhantomData }
  }

  fn acquire(&self) {}

  fn attempt(&self) -> bool {
    true
  }

  unsafe fn release(&self) {}
}

impl fmt::Debug for MutexSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutexSlot").field("name", &self.name).finish_non_exhaustive()
  }
}

impl MutexSlot {
  pub(crate) fn lock(&self) -> MutexGuard<'_> {
    self.acquire();
    MutexGuard { slot: self }
  }

  pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_>> {
    self.attempt().then(|| MutexGuard { slot: self })
  }
}

/// A hold on a [`MutexSlot`], released on drop.
#[derive(Debug)]
#[must_use = "if unused the Mutex will immediately unlock"]
pub(crate) struct MutexGuard<'a> {
  slot: &'a MutexSlot,
}

impl Drop for MutexGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    // SAFETY: a MutexGuard only exists after `slot` was acquired, and each
    // guard releases it exactly once.
    unsafe { self.slot.release() }
  }
}

// --- Per-leaf lock group ---

/// The locks owned by one leaf.
#[derive(Debug)]
pub(crate) struct LockGroup {
  /// Guards the leaf's value array and private-data slot.
  pub(crate) value: RwSlot,
  /// Guards the leaf's outgoing `next` link. Shared by checking-mode
  /// readers positioned on the leaf, exclusive for a deleter.
  pub(crate) link: RwSlot,
  /// Serializes writers of this leaf against each other while readers of
  /// the value keep going.
  pub(crate) writer: MutexSlot,
}

impl LockGroup {
  pub(crate) const fn new() -> LockGroup {
    LockGroup {
      value: RwSlot::new("leaf value lock"),
      link: RwSlot::new("leaf link lock"),
      writer: MutexSlot::new("leaf writer mutex"),
    }
  }
}

impl Default for LockGroup {
  fn default() -> Self {
    Self::new()
  }
}

/// Data protected by a leaf's `value` lock.
#[derive(Debug, Default)]
pub(crate) struct Guarded<T> {
  cell: UnsafeCell<T>,
}

impl<T> Guarded<T> {
  pub(crate) fn new(t: T) -> Guarded<T> {
    Guarded { cell: UnsafeCell::new(t) }
  }

  /// Borrows the data under a shared hold of `lock`.
  ///
  /// The caller must pass the lock that protects this cell.
  pub(crate) fn read<'a>(&'a self, lock: &'a RwSlot) -> Shared<'a, T> {
    Shared { _guard: lock.read(), cell: &self.cell }
  }

  /// Borrows the data under a shared hold of `lock`, or `None` if that would block.
  pub(crate) fn try_read<'a>(&'a self, lock: &'a RwSlot) -> Option<Shared<'a, T>> {
    Some(Shared { _guard: lock.try_read()?, cell: &self.cell })
  }

  /// Borrows the data mutably under the exclusive hold of `lock`.
  pub(crate) fn write<'a>(&'a self, lock: &'a RwSlot) -> Exclusive<'a, T> {
    Exclusive { _guard: lock.write(), cell: &self.cell }
  }

  /// Borrows the data mutably, or `None` if `lock` is held by anyone.
  pub(crate) fn try_write<'a>(&'a self, lock: &'a RwSlot) -> Option<Exclusive<'a, T>> {
    Some(Exclusive { _guard: lock.try_write()?, cell: &self.cell })
  }

  /// Consumes the cell. Ownership proves no guard is alive.
  #[cfg(test)]
  pub(crate) fn into_inner(self) -> T {
    self.cell.into_inner()
  }
}

/// Shared access to [`Guarded`] data.
pub(crate) struct Shared<'a, T> {
  _guard: ReadGuard<'a>,
  cell: &'a UnsafeCell<T>,
}

impl<T> Deref for Shared<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: the shared hold in `_guard` excludes every Exclusive borrow of
    // the same cell for as long as this borrow lives.
    unsafe { &*self.cell.get() }
  }
}

/// Exclusive access to [`Guarded`] data.
pub(crate) struct Exclusive<'a, T> {
  _guard: WriteGuard<'a>,
  cell: &'a UnsafeCell<T>,
}

impl<T> Deref for Exclusive<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: the exclusive hold in `_guard` excludes every other borrow.
    unsafe { &*self.cell.get() }
  }
}

impl<T> DerefMut for Exclusive<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: the exclusive hold in `_guard` excludes every other borrow.
    unsafe { &mut *self.cell.get() }
  }
}

// --- Plant-level bookkeeping and lock escalation ---

/// The locks owned by a plant as a whole.
#[derive(Debug)]
pub(crate) struct PlantLocks {
  /// Used purely as a counter: every fast-path traversal holds it shared;
  /// a deleter takes it exclusive to wait for them to drain.
  pub(crate) traversals: RwSlot,
  /// Held by every chain mutator (insert, delete, free) for the whole
  /// mutation. It is also the escalation mutex of [`LockState::escalate`].
  pub(crate) escalation: MutexSlot,
}

impl PlantLocks {
  pub(crate) const fn new() -> PlantLocks {
    PlantLocks {
      traversals: RwSlot::new("plant traversal counter"),
      escalation: MutexSlot::new("plant escalation mutex"),
    }
  }
}

impl Default for PlantLocks {
  fn default() -> Self {
    Self::new()
  }
}

/// Where a thread stands with respect to a plant's chain.
///
/// `H` is whatever read-style hold the thread carries while positioned in the
/// chain: a fast-path traversal registration or a checking-mode link lock.
#[derive(Debug)]
pub(crate) enum LockState<'a, H> {
  Unlocked,
  ReadLocked(H),
  /// Holds chain mutation rights. `retained` is true when the read hold was
  /// still in place at the moment the rights were granted, so nothing was
  /// unlinked in between.
  WriteLocked { _guard: MutexGuard<'a>, retained: bool },
}

impl<'a, H> LockState<'a, H> {
  /// Moves to `WriteLocked`.
  ///
  /// A thread holding a read must never block on the escalation mutex while
  /// still holding it: the current mutator may be a deleter waiting for that
  /// very read to drain. So a reader makes exactly one non-blocking attempt;
  /// if it fails, the read is released first and only then does the thread
  /// block. At most one escalation is therefore pending per plant, and an
  /// escalating thread never waits on another escalating thread while
  /// holding something that thread needs.
  pub(crate) fn escalate(self, locks: &'a PlantLocks) -> LockState<'a, H> {
    match self {
      LockState::Unlocked => LockState::WriteLocked { _guard: locks.escalation.lock(), retained: false },
      LockState::ReadLocked(hold) => match locks.escalation.try_lock() {
        Some(guard) => {
          drop(hold);
          LockState::WriteLocked { _guard: guard, retained: true }
        }
        None => {
          drop(hold);
          log::trace!("escalation contended, read released before blocking");
          LockState::WriteLocked { _guard: locks.escalation.lock(), retained: false }
        }
      },
      w @ LockState::WriteLocked { .. } => w,
    }
  }

  pub(crate) fn is_write_locked(&self) -> bool {
    matches!(self, LockState::WriteLocked { .. })
  }

  /// True if write rights were obtained without letting go of the read first.
  pub(crate) fn retained(&self) -> bool {
    matches!(self, LockState::WriteLocked { retained: true, .. })
  }
}
