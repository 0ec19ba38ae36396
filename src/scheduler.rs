//! Process-global scheduler state and the run loop that drives it
//! (spec.md §4.3): a main fiber, a current-fiber pointer, and the
//! ready/waiting/dead lists every other fiber moves between.
//!
//! There is exactly one [`Runtime`] per process (spec.md §9's "Global
//! state" note): a single-threaded cooperative scheduler has no use for
//! more than one, and the fiber/context-switch machinery is itself
//! fundamentally tied to one OS thread's register file.

use std::cell::Cell;
use std::io;
use std::ptr;

use lazy_static::lazy_static;

use crate::container::intrusive::LinkedList;
use crate::fiber::{self, Fiber, FiberHandle};
use crate::multiplexer;
use crate::opt::hint::unlikely;

pub(crate) struct Runtime {
	main: Fiber,
	pub(crate) current: Cell<*mut Fiber>,
	pub(crate) ready: LinkedList,
	pub(crate) waiting: LinkedList,
	dead: LinkedList
}

/* Safety: every access to `Runtime` happens from the single OS thread that
 * owns this cooperative runtime; nothing here is ever touched from two
 * threads at once. */
unsafe impl Sync for Runtime {}

impl Runtime {
	fn new() -> Self {
		Self {
			main: Fiber::main(),
			current: Cell::new(ptr::null_mut()),
			ready: LinkedList::new(),
			waiting: LinkedList::new(),
			dead: LinkedList::new()
		}
	}
}

lazy_static! {
	static ref RUNTIME: Runtime = Runtime::new();
}

/// Idempotent. Discovers stack direction, initializes the ready/waiting/
/// dead lists, and registers the main fiber as current (spec.md §6).
///
/// `RUNTIME`'s address only becomes stable once `lazy_static` has finished
/// constructing it, so the self-referential "current points at main"
/// fixup happens here, on first use, rather than inside `Runtime::new`
/// (whose return value is still movable when it runs).
pub fn init() {
	fiber::stack::direction();

	let rt = &*RUNTIME;

	if rt.current.get().is_null() {
		rt.current.set(ptr::addr_of!(rt.main).cast_mut());
	}
}

/// Auto-registers the runtime before `main`, matching the teacher's
/// `ctor`-based one-time setup pattern; `init` stays idempotent and public
/// so callers (and tests, which each run on their own thread) can also
/// call it explicitly.
#[ctor::ctor]
fn auto_init() {
	init();
}

pub(crate) fn runtime() -> &'static Runtime {
	init();
	&RUNTIME
}

/// The fiber presently running.
#[must_use]
pub fn current() -> FiberHandle {
	FiberHandle::new(runtime().current.get())
}

/// Create a fiber that will run `f` and place it on the back of ready;
/// both the spawner and the new fiber are runnable once this returns
/// (spec.md §4.3's `spawn`).
///
/// The original C library's bootstrap captures a new fiber's resume point
/// by actually running a sliver of code on its stack (the `alloca`
/// address-space-gap trick) and immediately switching back to the
/// spawner before the fiber's entry function ever runs (spec.md §4.2:
/// "immediately transfer control back to the spawner... the spawner
/// places the new fiber on the ready list and returns to its caller").
/// The asm-based [`Context`] here can write that same resume-ready
/// register file directly, with nothing to run and nothing to switch
/// back from — so `spawn` never leaves the spawner's stack at all. See
/// `DESIGN.md`.
pub fn spawn<F: FnOnce() + 'static>(stack_size: usize, f: F) -> io::Result<FiberHandle> {
	let rt = runtime();
	let (entry, arg) = fiber::entry_for(f);
	let new_fiber = Box::into_raw(Fiber::spawn(stack_size, entry, arg)?);

	log::trace!("spawned fiber {new_fiber:p}");

	// Safety: freshly allocated, linked into no list yet.
	unsafe { rt.ready.push_back(Fiber::node_ptr(new_fiber)) };

	Ok(FiberHandle::new(new_fiber))
}

/// Re-queue the current fiber and run whatever's next (spec.md §4.3).
pub fn yield_now() {
	let rt = runtime();
	let current = rt.current.get();

	// Safety: `current` is running, hence on no list.
	unsafe { rt.ready.push_back(Fiber::node_ptr(current)) };

	run_next(rt);
}

/// Terminate the current fiber and run whatever's next. Never returns.
pub fn exit() -> ! {
	let rt = runtime();
	let current = rt.current.get();

	log::trace!("fiber {current:p} exiting");

	// Safety: `current` is running, hence on no list.
	unsafe { rt.dead.push_back(Fiber::node_ptr(current)) };

	run_next(rt);

	unreachable!("a dead fiber must never be resumed")
}

/// Pop the head of ready and switch to it, invoking the multiplexer first
/// if ready is empty (spec.md §4.3). If the popped fiber is already
/// current (it just re-queued itself and nothing else is runnable),
/// returns without switching.
pub(crate) fn run_next(rt: &Runtime) {
	while unlikely(rt.ready.is_empty()) {
		multiplexer::wait_for_events(rt);
	}

	let node = rt
		.ready
		.pop_front()
		.expect("ready list was just confirmed non-empty");
	// Safety: every node in `ready` is the `node` field of a live `Fiber`.
	let next = unsafe { Fiber::from_node(node) };
	let current = rt.current.get();

	if next == current {
		return;
	}

	rt.current.set(next);

	// Safety: `current` is the fiber actually executing this call; `next`
	// is either freshly bootstrapped or holds a context saved by an
	// earlier switch out of it.
	unsafe { Fiber::switch(current, next) };

	reap(rt);
}

/// Free every dead fiber's stack and record. Only safe to call once
/// switched onto some other, now-current fiber: a fiber can never free
/// itself while it is the one running (spec.md §4.3).
fn reap(rt: &Runtime) {
	while let Some(node) = rt.dead.pop_front() {
		// Safety: every node in `dead` is the `node` field of a live
		// `Fiber` that pushed itself via `exit` and is not current.
		let dead = unsafe { Fiber::from_node(node) };

		debug_assert_ne!(dead, rt.current.get(), "a fiber must not reap itself");

		if ptr::eq(dead, ptr::addr_of!(rt.main)) {
			continue;
		}

		log::trace!("reaping fiber {dead:p}");

		// Safety: `dead` is on the dead list, meaning `exit` ran it to
		// completion and it will never be switched to again.
		unsafe {
			(*dead).release_stack();
			drop(Box::from_raw(dead));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use super::*;

	#[test]
	fn fast_yield_is_fifo() {
		let _guard = crate::test_support::guard();
		init();

		let order = Rc::new(RefCell::new(Vec::new()));

		for id in 1..=4 {
			let order = Rc::clone(&order);

			spawn(64 * 1024, move || {
				for _ in 0..3 {
					order.borrow_mut().push(id);
					yield_now();
				}
			})
			.expect("spawn should succeed");
		}

		for _ in 0..12 {
			yield_now();
		}

		assert_eq!(
			&order.borrow()[..12],
			&[1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]
		);
	}

	#[test]
	fn chain_start_has_no_gaps() {
		let _guard = crate::test_support::guard();
		init();

		let order = Rc::new(RefCell::new(Vec::new()));

		fn chain(order: Rc<RefCell<Vec<u32>>>, n: u32) {
			order.borrow_mut().push(n);

			if n < 5 {
				let next = Rc::clone(&order);

				spawn(64 * 1024, move || chain(next, n + 1)).expect("spawn should succeed");
			}
		}

		chain(Rc::clone(&order), 1);

		for _ in 0..5 {
			yield_now();
		}

		assert_eq!(&order.borrow()[..], &[1, 2, 3, 4, 5]);
	}

	#[test]
	fn exiting_fiber_is_eventually_reaped() {
		let _guard = crate::test_support::guard();
		init();

		let done = Rc::new(Cell::new(false));
		let flag = Rc::clone(&done);

		spawn(64 * 1024, move || {
			flag.set(true);
		})
		.expect("spawn should succeed");

		yield_now();
		yield_now();

		assert!(done.get());
	}
}
