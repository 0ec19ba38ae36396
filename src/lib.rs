//! A single-threaded cooperative fiber runtime: an intrusive ready/
//! waiting/dead scheduler, guard-paged stacks with an asm-based context
//! switch, a `poll(2)`-backed readiness multiplexer serving every parked
//! fiber from one syscall, and a dual-ring-buffer buffered I/O adapter
//! with a zero-copy tunnel between two descriptors.
//!
//! Cooperative only: no preemption, no cross-thread parallelism, no
//! priority scheduling. A fiber runs until it yields, parks on `poll`, or
//! exits.

pub mod bufio;
pub mod container;
pub mod fiber;
pub mod multiplexer;
pub mod opt;
pub mod os;
pub mod scheduler;

pub mod prelude {
	//! The public surface most callers need: spawning and yielding
	//! fibers, waiting on descriptors, and wrapping them in a buffered
	//! adapter.
	pub use crate::bufio::BufIo;
	pub use crate::fiber::FiberHandle;
	pub use crate::multiplexer::{poll, poll_one};
	pub use crate::os::poll::{PollFd, PollFlag};
	pub use crate::scheduler::{current, exit, spawn, yield_now};
}

pub extern crate ctor;
pub extern crate enumflags2;
pub extern crate lazy_static;

#[cfg(test)]
pub(crate) mod test_support {
	//! Every test that touches the process-global [`crate::scheduler`]
	//! runtime shares one OS thread's worth of state (spec.md §9's
	//! "Global state" note); `cargo test`'s default thread-per-test
	//! concurrency would otherwise race two tests' ready/waiting/dead
	//! lists against each other. Tests that drive the scheduler take this
	//! lock for their duration.
	use std::sync::{Mutex, MutexGuard};

	pub(crate) static LOCK: Mutex<()> = Mutex::new(());

	pub(crate) fn guard() -> MutexGuard<'static, ()> {
		LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}
