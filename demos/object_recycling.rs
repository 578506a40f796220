use taskforce::{CapacityPool, ObjectPool};
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Object Recycling Example ---");

  // A pool of scratch strings, cleared on their way back in.
  let strings = ObjectPool::with_reset(
    || String::with_capacity(64),
    |mut s: String| {
      s.clear();
      Some(s)
    },
  );

  {
    let mut scratch = strings.get();
    scratch.push_str("hello");
    info!("Scratch holds: {:?}", &*scratch);
    // Dropping the handle returns the string to the pool.
  }
  info!("Strings parked for reuse: {}", strings.free_count());

  let again = strings.get();
  info!(
    "Recycled string is empty again (len {}) but keeps its capacity ({})",
    again.len(),
    again.capacity()
  );
  again.release();

  // Buffers come out of capacity tiers; asking for 100 bytes yields the
  // 128-byte tier.
  let buffers: CapacityPool<Vec<u8>> = CapacityPool::with_reset(Vec::with_capacity, |mut buffer: Vec<u8>| {
    buffer.clear();
    Some(buffer)
  });

  let mut buffer = buffers.get(100);
  info!("Requested 100 bytes, got capacity {}", buffer.capacity());
  buffer.extend_from_slice(b"payload");
  info!("Buffer now holds {} bytes", buffer.len());
  drop(buffer);
  info!("Buffers parked in the 128-byte tier: {}", buffers.free_count(100));

  let reused = buffers.get(128);
  info!("Re-acquired buffer: len {}, capacity {}", reused.len(), reused.capacity());
  reused.release();

  // Oversize requests are served but never pooled.
  let big = buffers.get(1 << 20);
  info!("A one-MiB buffer bypasses the tiers (capacity {})", big.capacity());
  big.release();

  info!("--- Object Recycling Example End ---");
}
