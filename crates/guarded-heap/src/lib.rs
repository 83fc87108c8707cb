//! A general-purpose heap allocator instrumented for catching memory bugs.
//!
//! Small requests are served from page-sized **buckets** segregated by
//! power-of-two size class. Within a bucket, slots are handed out by a
//! monotone cursor and never reused, so a freed pointer keeps pointing at
//! memory no live allocation owns; with
//! [`Config::never_unmap`] a stale access faults instead of silently
//! reading recycled bytes. Requests whose effective size exceeds half a
//! page go straight to the backing page allocator and are tracked in a
//! side table.
//!
//! Every allocation records the call-site stack trace. Double frees and
//! leaks are reported through `tracing` with the original allocation
//! trace, the earlier free trace, and the offending call's trace.
//!
//! # Quick start
//!
//! ```
//! use guarded_heap::{Check, Config, GuardedHeap};
//!
//! let heap = GuardedHeap::new(Config::default());
//! let ptr = heap.allocate(64, 3, 0).expect("out of memory");
//! unsafe { heap.free(ptr, 64, 3, 0) };
//! assert_eq!(heap.deinit(), Check::Ok);
//! ```
//!
//! # Injection
//!
//! Both collaborators are type parameters: the backing page allocator
//! (anything implementing [`BackingAllocator`], defaulting to the
//! OS-backed [`SysPages`]) and the lock (any
//! [`lock_api::RawMutex`](parking_lot::lock_api::RawMutex), defaulting to
//! the `parking_lot` mutex; [`SingleThreaded`] is the no-op stand-in for
//! single-threaded use).

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

mod backing;
mod bucket;
mod heap;
mod large;
mod sync;
mod trace;

pub use backing::{BackingAllocator, SysPages};
pub use heap::{Check, Config, GuardedHeap};
pub use sync::{DefaultMutex, SingleThreaded};
pub use trace::MAX_STACK_FRAMES;
