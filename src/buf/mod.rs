mod buffer;
mod pool;

pub use buffer::Buffer;
pub use pool::{BufferPool, MAX_POOLED_SIZE};

/// Default size of relay buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Largest UDP payload carried through the engine.
pub const UDP_BUFFER_SIZE: usize = 65535;
