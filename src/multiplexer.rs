//! The readiness multiplexer (spec.md §4.4): one blocking `poll(2)` call
//! serves every fiber parked on a descriptor wait or a timeout. `run_next`
//! calls into this module exactly when the ready list has gone empty;
//! this module's job is to turn "nothing is ready" into "something is
//! ready, or enough time has passed that it doesn't matter" in one
//! syscall, then hand woken fibers back to the scheduler's ready list.

use crate::fiber::Fiber;
use crate::os::poll::{self as ospoll, PollFd};
use crate::os::time;
use crate::scheduler::{self, Runtime};

/// Convenience over a single descriptor (spec.md §6's `poll-one`).
#[must_use]
pub fn poll_one(fd: i32, events: i16, timeout_ms: i64) -> i16 {
	let mut desc = PollFd::new(fd, events as u16);

	poll(std::slice::from_mut(&mut desc), timeout_ms);

	desc.revents
}

/// Park the current fiber on `descs` until at least one is ready or
/// `timeout_ms` elapses (`< 0` no deadline, `== 0` poll once and return
/// immediately, `> 0` a relative deadline in milliseconds; spec.md §4.4).
/// On return every `descs[i].revents` reflects what was observed.
pub fn poll(descs: &mut [PollFd], timeout_ms: i64) {
	if descs.is_empty() && timeout_ms < 0 {
		// Nothing to become ready and no deadline to ever elapse: parking
		// would leave this fiber waiting forever. `poll(2)` itself would
		// block indefinitely on an empty fd set with no timeout too; the
		// only sane response here is to not wait on nothing at all.
		return;
	}

	let rt = scheduler::runtime();
	let current = rt.current.get();
	let now = time::now_ms().unwrap_or(0);

	let deadline = if timeout_ms < 0 {
		None
	} else if timeout_ms == 0 {
		Some(now)
	} else {
		#[allow(clippy::cast_sign_loss)]
		Some(now.saturating_add(timeout_ms as u64))
	};

	// Safety: `descs` is borrowed by the runtime until this fiber is next
	// woken, which is exactly when this function returns (spec.md §5).
	unsafe { (*current).wait().set(descs.as_mut_ptr(), descs.len(), deadline) };

	// Safety: `current` is running, hence linked on no list.
	unsafe { rt.waiting.push_back(Fiber::node_ptr(current)) };

	scheduler::run_next(rt);
}

/// Build one aggregate `poll(2)` call over every waiting fiber's
/// descriptors, block on it, and dispatch results (spec.md §4.4). Called
/// by `run_next` in a loop while the ready list stays empty.
pub(crate) fn wait_for_events(rt: &Runtime) {
	if rt.waiting.is_empty() {
		// Every fiber but the one that just switched away has already run
		// to completion: a program whose fibers all legitimately exit
		// reaches this exact state, not just a stuck caller. There is
		// nothing left for this cooperative runtime to schedule, ever, so
		// treat it as a clean shutdown rather than an unwind through
		// hand-rolled fiber stacks (which a plain `panic!` would attempt
		// and which isn't sound across the raw context-switch boundary).
		log::error!("fiberio: no ready or waiting fibers left to run, stopping");
		std::process::abort();
	}

	let mut owners: Vec<*mut Fiber> = Vec::new();
	let mut originals: Vec<*mut PollFd> = Vec::new();
	let mut scratch: Vec<PollFd> = Vec::new();
	let now = time::now_ms().unwrap_or(0);
	let mut min_remaining: Option<u64> = None;

	for node in rt.waiting.iter() {
		// Safety: every node in `waiting` is the `node` field of a live
		// `Fiber` that pushed itself via `poll`/`poll_one`.
		let fiber = unsafe { Fiber::from_node(node) };
		// Safety: see above.
		let wait = unsafe { (*fiber).wait() };

		if let Some(deadline) = wait.deadline() {
			let remaining = deadline.saturating_sub(now);

			min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
		}

		let descs = wait.descs();

		for i in 0..wait.len() {
			// Safety: `descs` is valid for `wait.len()` elements for the
			// duration of the owning fiber's wait (spec.md §5).
			let original = unsafe { descs.add(i) };
			// Safety: see above.
			let mut copy = unsafe { *original };

			copy.revents = 0;
			owners.push(fiber);
			originals.push(original);
			scratch.push(copy);
		}
	}

	#[allow(clippy::cast_possible_truncation)]
	let timeout_ms = match min_remaining {
		None => -1,
		Some(ms) => i32::try_from(ms).unwrap_or(i32::MAX)
	};

	if let Err(err) = ospoll::poll(&mut scratch, timeout_ms) {
		log::warn!("readiness wait failed, retrying next run-next: {err}");
	}

	let now = time::now_ms().unwrap_or(now);

	for i in 0..scratch.len() {
		let fiber = owners[i];
		// Safety: `fiber` is still linked in `waiting` until we remove it
		// below; it cannot have been freed.
		let wait = unsafe { (*fiber).wait() };
		let revents = scratch[i].revents;

		// Safety: `originals[i]` was produced from a fiber's own
		// descriptor array, still alive per the borrow contract.
		unsafe { (*originals[i]).revents = revents };

		let elapsed = wait.deadline().is_some_and(|d| now >= d);
		let ack = revents != 0 || elapsed;

		if ack && !wait.acked() {
			wait.ack();

			// Safety: `fiber` is currently linked into `waiting`.
			unsafe { rt.waiting.remove(Fiber::node_ptr(fiber)) };
			// Safety: `fiber` was just unlinked above.
			unsafe { rt.ready.push_back(Fiber::node_ptr(fiber)) };
		}
	}

	// A fiber parked on a deadline with zero descriptors (spec.md §6's
	// `poll-one`-less timer wait) contributes no entry to `scratch` above,
	// so it would otherwise never be acked once its deadline passes.
	// Collect first: `remove`/`push_back` below must not run while this
	// list is being iterated.
	let timers: Vec<*mut Fiber> = rt
		.waiting
		.iter()
		// Safety: every node in `waiting` is the `node` field of a live
		// `Fiber` that pushed itself via `poll`/`poll_one`.
		.map(|node| unsafe { Fiber::from_node(node) })
		// Safety: see above.
		.filter(|&fiber| unsafe { (*fiber).wait().len() == 0 })
		.collect();

	for fiber in timers {
		// Safety: `fiber` is still linked in `waiting` until removed below.
		let wait = unsafe { (*fiber).wait() };
		let elapsed = wait.deadline().is_some_and(|d| now >= d);

		if elapsed && !wait.acked() {
			wait.ack();

			// Safety: `fiber` is currently linked into `waiting`.
			unsafe { rt.waiting.remove(Fiber::node_ptr(fiber)) };
			// Safety: `fiber` was just unlinked above.
			unsafe { rt.ready.push_back(Fiber::node_ptr(fiber)) };
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fiber::Fiber;
	use crate::os::poll::PollFlag;
	use crate::scheduler;

	fn pipe() -> (i32, i32) {
		let mut fds = [0i32; 2];

		// Safety: `fds` is a valid 2-element array.
		let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

		assert_eq!(ret, 0);
		(fds[0], fds[1])
	}

	extern "C" fn noop(_: *mut u8) {}

	fn fake_fiber() -> Box<Fiber> {
		Fiber::spawn(16 * 1024, noop, std::ptr::null_mut()).expect("spawn should succeed")
	}

	/// Three fibers parked at once: one whose descriptor is already
	/// readable, one with an already-elapsed deadline and an unreadable
	/// descriptor, and one with neither. A single `wait_for_events` call
	/// must wake exactly the first two and leave the third parked,
	/// without ever switching into any of them (spec.md §4.4's "one
	/// syscall serves every waiter" property, tested as pure data-
	/// structure bookkeeping rather than through the scheduler).
	#[test]
	fn dispatch_wakes_ready_and_elapsed_fibers_only() {
		let _guard = crate::test_support::guard();
		scheduler::init();

		let rt = scheduler::runtime();

		let (ready_r, ready_w) = pipe();
		let (idle_r, idle_w) = pipe();
		let (elapsed_r, elapsed_w) = pipe();

		let ready_fiber = fake_fiber();
		let idle_fiber = fake_fiber();
		let elapsed_fiber = fake_fiber();

		let mut ready_desc = PollFd::new(ready_r, PollFlag::In as u16);
		let mut idle_desc = PollFd::new(idle_r, PollFlag::In as u16);
		let mut elapsed_desc = PollFd::new(elapsed_r, PollFlag::In as u16);

		// Safety: each descriptor outlives this test, and none of these
		// fibers is ever switched into, so nothing else touches their
		// wait slots concurrently.
		unsafe {
			ready_fiber.wait().set(&mut ready_desc, 1, None);
			idle_fiber.wait().set(&mut idle_desc, 1, None);
			elapsed_fiber.wait().set(&mut elapsed_desc, 1, Some(0));
		}

		let ready_ptr = Box::into_raw(ready_fiber);
		let idle_ptr = Box::into_raw(idle_fiber);
		let elapsed_ptr = Box::into_raw(elapsed_fiber);

		// Safety: freshly allocated, linked into no list.
		unsafe {
			rt.waiting.push_back(Fiber::node_ptr(ready_ptr));
			rt.waiting.push_back(Fiber::node_ptr(idle_ptr));
			rt.waiting.push_back(Fiber::node_ptr(elapsed_ptr));
		}

		// Safety: `ready_w` is open and owned by this test.
		let n = unsafe { libc::write(ready_w, b"x".as_ptr().cast(), 1) };
		assert_eq!(n, 1);

		wait_for_events(rt);

		assert_ne!(ready_desc.revents & PollFlag::In as i16, 0);
		assert_eq!(idle_desc.revents, 0);
		assert_eq!(elapsed_desc.revents, 0);

		let remaining: Vec<_> = rt.waiting.iter().collect();
		assert_eq!(remaining, vec![Fiber::node_ptr(idle_ptr)]);

		// Safety: test cleanup; each fiber is linked on exactly the list
		// asserted above, and none has been switched into or freed yet.
		unsafe {
			rt.waiting.remove(Fiber::node_ptr(idle_ptr));
			rt.ready.remove(Fiber::node_ptr(ready_ptr));
			rt.ready.remove(Fiber::node_ptr(elapsed_ptr));

			drop(Box::from_raw(ready_ptr));
			drop(Box::from_raw(idle_ptr));
			drop(Box::from_raw(elapsed_ptr));

			libc::close(ready_r);
			libc::close(ready_w);
			libc::close(idle_r);
			libc::close(idle_w);
			libc::close(elapsed_r);
			libc::close(elapsed_w);
		}
	}
}
