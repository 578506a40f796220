use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type MakeFn<O> = Box<dyn Fn() -> O + Send + Sync>;
type ResetFn<O> = Box<dyn Fn(O) -> Option<O> + Send + Sync>;

/// Capacity tiers shared by every `CapacityPool`. Requests above the top
/// tier are allocated exactly and never pooled.
const TIERS: [usize; 13] = [
  8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

struct PoolInner<O> {
  free: Mutex<Vec<O>>,
  make: MakeFn<O>,
  reset: Option<ResetFn<O>>,
}

impl<O> PoolInner<O> {
  fn acquire(&self) -> O {
    let recycled = self.free.lock().pop();
    match recycled {
      Some(value) => value,
      None => (self.make)(),
    }
  }

  fn recycle(&self, value: O) {
    let value = match &self.reset {
      Some(reset) => match reset(value) {
        Some(value) => value,
        // The reset function rejected the value; drop it instead of
        // handing it out again.
        None => return,
      },
      None => value,
    };
    self.free.lock().push(value);
  }
}

/// A recycling pool of reusable values.
///
/// `get` pops a previously released value or makes a fresh one; dropping
/// (or explicitly releasing) the returned [`Pooled`] handle gives the
/// value back. An optional reset function runs on every return and may
/// discard the value by returning `None`.
pub struct ObjectPool<O> {
  inner: Arc<PoolInner<O>>,
}

impl<O> Clone for ObjectPool<O> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<O> fmt::Debug for ObjectPool<O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ObjectPool")
      .field("free", &self.free_count())
      .finish_non_exhaustive()
  }
}

impl<O> ObjectPool<O> {
  pub fn new(make: impl Fn() -> O + Send + Sync + 'static) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        free: Mutex::new(Vec::new()),
        make: Box::new(make),
        reset: None,
      }),
    }
  }

  pub fn with_reset(
    make: impl Fn() -> O + Send + Sync + 'static,
    reset: impl Fn(O) -> Option<O> + Send + Sync + 'static,
  ) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        free: Mutex::new(Vec::new()),
        make: Box::new(make),
        reset: Some(Box::new(reset)),
      }),
    }
  }

  /// Checks out a value, reusing a released one when available.
  pub fn get(&self) -> Pooled<O> {
    Pooled {
      value: Some(self.inner.acquire()),
      origin: Some(self.inner.clone()),
    }
  }

  /// Returns a checked-out value to this pool.
  ///
  /// Dropping the handle has the same effect; `put` exists so the
  /// hand-back can be made explicit, and so that returning a value to a
  /// pool it did not come from fails loudly instead of corrupting either
  /// pool's free list.
  ///
  /// # Panics
  /// Panics if `handle` was not allocated from this pool.
  pub fn put(&self, handle: Pooled<O>) {
    let owned = handle
      .origin
      .as_ref()
      .is_some_and(|origin| Arc::ptr_eq(&self.inner, origin));
    assert!(owned, "value was not allocated from this pool");
    drop(handle);
  }

  /// Number of released values currently waiting for reuse.
  pub fn free_count(&self) -> usize {
    self.inner.free.lock().len()
  }

  /// A weak handle that does not keep the pool alive.
  pub fn downgrade(&self) -> WeakObjectPool<O> {
    WeakObjectPool {
      inner: Arc::downgrade(&self.inner),
    }
  }

  /// Checks out a raw value outside of `Pooled` handle management. The
  /// caller is responsible for handing it back with `recycle_value`.
  pub(crate) fn acquire_value(&self) -> O {
    self.inner.acquire()
  }

  pub(crate) fn recycle_value(&self, value: O) {
    self.inner.recycle(value);
  }
}

/// A weak counterpart to [`ObjectPool`], for values that must remember
/// their origin without keeping it alive.
pub struct WeakObjectPool<O> {
  inner: Weak<PoolInner<O>>,
}

impl<O> Clone for WeakObjectPool<O> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<O> WeakObjectPool<O> {
  /// The pool this handle came from, or `None` once it has been dropped.
  pub fn upgrade(&self) -> Option<ObjectPool<O>> {
    self.inner.upgrade().map(|inner| ObjectPool { inner })
  }
}

/// A value checked out of an [`ObjectPool`]; returns to its origin when
/// dropped or released.
pub struct Pooled<O> {
  value: Option<O>,
  origin: Option<Arc<PoolInner<O>>>,
}

impl<O> Pooled<O> {
  /// Wraps a value that belongs to no pool; dropping it just drops the
  /// value. Used for requests too large for any capacity tier.
  fn unpooled(value: O) -> Self {
    Self {
      value: Some(value),
      origin: None,
    }
  }

  /// Returns the value to its origin pool. Equivalent to dropping the
  /// handle; provided so call sites can make the hand-back explicit.
  pub fn release(self) {}

  /// Removes the value from pool management and hands it to the caller.
  /// It will not return to the pool when dropped.
  pub fn detach(mut self) -> O {
    self.origin = None;
    self
      .value
      .take()
      .expect("pooled value present until the handle is consumed")
  }
}

impl<O> Deref for Pooled<O> {
  type Target = O;

  fn deref(&self) -> &O {
    self
      .value
      .as_ref()
      .expect("pooled value present until the handle is consumed")
  }
}

impl<O> DerefMut for Pooled<O> {
  fn deref_mut(&mut self) -> &mut O {
    self
      .value
      .as_mut()
      .expect("pooled value present until the handle is consumed")
  }
}

impl<O> Drop for Pooled<O> {
  fn drop(&mut self) {
    if let (Some(value), Some(origin)) = (self.value.take(), self.origin.take()) {
      origin.recycle(value);
    }
  }
}

impl<O: fmt::Debug> fmt::Debug for Pooled<O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pooled")
      .field("value", &self.value)
      .field("pooled", &self.origin.is_some())
      .finish()
  }
}

/// A recycling pool bucketed by capacity.
///
/// `get(capacity)` draws from the smallest tier that covers the request,
/// so values of similar size recycle through the same free list. One
/// `CapacityPool<Vec<u8>>` replaces a per-size family of byte pools.
pub struct CapacityPool<O> {
  make: Arc<dyn Fn(usize) -> O + Send + Sync>,
  buckets: [ObjectPool<O>; TIERS.len()],
}

impl<O> Clone for CapacityPool<O> {
  fn clone(&self) -> Self {
    Self {
      make: self.make.clone(),
      buckets: self.buckets.clone(),
    }
  }
}

impl<O> fmt::Debug for CapacityPool<O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CapacityPool")
      .field("tiers", &TIERS)
      .finish_non_exhaustive()
  }
}

impl<O: 'static> CapacityPool<O> {
  /// `make(capacity)` must produce a value with capacity at least
  /// `capacity`; it is called with the bucket's tier size, or with the
  /// exact request for oversize values.
  pub fn new(make: impl Fn(usize) -> O + Send + Sync + 'static) -> Self {
    let make: Arc<dyn Fn(usize) -> O + Send + Sync> = Arc::new(make);
    let buckets = std::array::from_fn(|i| {
      let make = make.clone();
      ObjectPool::new(move || make(TIERS[i]))
    });
    Self { make, buckets }
  }

  pub fn with_reset(
    make: impl Fn(usize) -> O + Send + Sync + 'static,
    reset: impl Fn(O) -> Option<O> + Send + Sync + 'static,
  ) -> Self {
    let make: Arc<dyn Fn(usize) -> O + Send + Sync> = Arc::new(make);
    let reset: Arc<dyn Fn(O) -> Option<O> + Send + Sync> = Arc::new(reset);
    let buckets = std::array::from_fn(|i| {
      let make = make.clone();
      let reset = reset.clone();
      ObjectPool::with_reset(move || make(TIERS[i]), move |value| reset(value))
    });
    Self { make, buckets }
  }

  /// Checks out a value with capacity at least `capacity`. Requests above
  /// the top tier are allocated exactly and bypass recycling.
  pub fn get(&self, capacity: usize) -> Pooled<O> {
    match bucket_index(capacity) {
      Some(i) => self.buckets[i].get(),
      None => Pooled::unpooled((self.make)(capacity)),
    }
  }

  /// Free-list depth of the bucket serving `capacity`; always 0 for
  /// oversize requests, which are never pooled.
  pub fn free_count(&self, capacity: usize) -> usize {
    bucket_index(capacity).map_or(0, |i| self.buckets[i].free_count())
  }
}

/// Smallest tier that covers `capacity`, or `None` above the top tier.
fn bucket_index(capacity: usize) -> Option<usize> {
  TIERS.iter().position(|&tier| capacity <= tier)
}
