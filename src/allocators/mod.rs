//! The allocators exported by this crate.

pub mod fixed_pool;
pub mod monotonic;
pub mod object_pool;
pub mod stack;
pub mod thread_safe_pool;
pub mod tracking;
pub mod variable_pool;

pub use fixed_pool::{FixedPoolConfig, FixedSizePool, RawFixedPool};
pub use monotonic::MonotonicAllocator;
pub use object_pool::ObjectPool;
pub use stack::{Marker, StackAllocator};
pub use thread_safe_pool::{ThreadContext, ThreadSafeMemoryPool};
pub use tracking::{DefaultScope, StatsScope, TrackingAllocator, TrackingStats};
pub use variable_pool::{VariablePoolConfig, VariableSizePool};
