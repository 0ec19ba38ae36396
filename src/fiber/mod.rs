//! The fiber record and the stack/context machinery it's built from
//! (spec.md §3, §4.2). A [`Fiber`] owns a stack, a saved resume
//! [`Context`], an intrusive list link placing it on at most one of the
//! scheduler's ready/waiting/dead lists, and the descriptor-wait fields the
//! multiplexer reads and writes while the fiber is parked.
//!
//! Scheduling policy (ready/waiting/dead, spawn/yield/exit/run-next) lives
//! in [`crate::scheduler`]; this module only knows how to allocate a fiber,
//! bootstrap it onto its own stack, and switch into or out of it.

pub mod context;
pub mod stack;

use std::cell::Cell;
use std::io;
use std::ptr::{self, NonNull};

use context::{Context, Entry};
use stack::Stack;

use crate::container::intrusive::Node;
use crate::os::poll::PollFd;

/// The waiting-state fields of a parked fiber (spec.md §3): a borrowed
/// descriptor array, its length, an expiration deadline in monotonic
/// milliseconds (`None` means "no deadline"), and the one-shot flag that
/// keeps a multi-descriptor wait from re-queueing the fiber twice.
///
/// These fields are meaningless while the fiber is ready or running; a
/// tagged `enum State` would make that explicit (spec.md §9 suggests
/// exactly this), but the multiplexer needs to mutate `revents` through a
/// raw pointer across many fibers in one pass, which is far more awkward
/// through an enum than through a handful of `Cell`s left unused outside
/// `Waiting`.
#[derive(Default)]
pub struct WaitSlot {
	descs: Cell<*mut PollFd>,
	len: Cell<usize>,
	deadline: Cell<Option<u64>>,
	acked: Cell<bool>
}

impl WaitSlot {
	/// # Safety
	/// `descs` must remain valid for `len` elements until the fiber next
	/// wakes (spec.md §5's borrow contract).
	pub unsafe fn set(&self, descs: *mut PollFd, len: usize, deadline: Option<u64>) {
		self.descs.set(descs);
		self.len.set(len);
		self.deadline.set(deadline);
		self.acked.set(false);
	}

	#[must_use]
	pub fn descs(&self) -> *mut PollFd {
		self.descs.get()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.len.get()
	}

	#[must_use]
	pub fn deadline(&self) -> Option<u64> {
		self.deadline.get()
	}

	#[must_use]
	pub fn acked(&self) -> bool {
		self.acked.get()
	}

	pub fn ack(&self) {
		self.acked.set(true);
	}
}

/// A fiber: a stack, a saved machine context, and the bookkeeping the
/// scheduler and multiplexer need while it's not running.
///
/// `node` is the first field so a `*mut Node` taken from one of the
/// scheduler's lists can be cast straight back to `*mut Fiber`
/// (the intrusive-list "container of" pattern; spec.md §4.1's list
/// doesn't know or care what it's threading together).
#[repr(C)]
pub struct Fiber {
	node: Node,
	context: Cell<Context>,
	stack: Stack,
	entry: Cell<Option<Entry>>,
	arg: Cell<*mut u8>,
	/// Opaque identifier external memory-debugging tools (e.g. Valgrind's
	/// stack registration) could attach to this fiber; unused by the
	/// runtime itself (spec.md §3). Present unconditionally per the data
	/// model; populating it is an integration this crate doesn't carry.
	debug_id: Cell<u32>,
	wait: WaitSlot
}

/* Safety: a Fiber's stack and context are exclusively accessed by whichever
 * OS thread currently owns this single-threaded runtime; nothing here is
 * shared across real threads. */
unsafe impl Send for Fiber {}

impl Fiber {
	/// The main fiber: its "stack" is the OS thread's own, owned and
	/// freed by the OS, never by this crate's reaper (spec.md §3's
	/// invariant).
	#[must_use]
	pub const fn main() -> Self {
		Self {
			node: Node::new(),
			context: Cell::new(Context::new()),
			stack: Stack::main(),
			entry: Cell::new(None),
			arg: Cell::new(ptr::null_mut()),
			debug_id: Cell::new(0),
			wait: WaitSlot {
				descs: Cell::new(ptr::null_mut()),
				len: Cell::new(0),
				deadline: Cell::new(None),
				acked: Cell::new(false)
			}
		}
	}

	/// Allocate a fiber with a freshly mapped, guard-paged stack of at
	/// least `stack_size` usable bytes, bootstrapped to call `entry(arg)`
	/// once first resumed.
	pub fn spawn(stack_size: usize, entry: Entry, arg: *mut u8) -> io::Result<Box<Self>> {
		let stack = Stack::allocate(stack_size)?;

		let mut fiber = Box::new(Self {
			node: Node::new(),
			context: Cell::new(Context::new()),
			stack,
			entry: Cell::new(Some(entry)),
			arg: Cell::new(arg),
			debug_id: Cell::new(0),
			wait: WaitSlot::default()
		});

		let top = fiber.stack.top();
		let mut context = Context::new();

		context.set_stack(top);
		context.set_entry(entry, arg);
		fiber.context.set(context);

		Ok(fiber)
	}

	#[must_use]
	pub fn node_ptr(this: *mut Self) -> *mut Node {
		this.cast()
	}

	/// # Safety
	/// `node` must point at the `node` field of a live `Fiber`.
	#[must_use]
	pub unsafe fn from_node(node: *mut Node) -> *mut Self {
		node.cast()
	}

	#[must_use]
	pub const fn is_main(&self) -> bool {
		self.stack.is_main()
	}

	#[must_use]
	pub fn wait(&self) -> &WaitSlot {
		&self.wait
	}

	/// Switch execution from `from` to `to`.
	///
	/// # Safety
	/// `from` must be the fiber currently running; `to` must be parked
	/// with a valid saved context (or freshly bootstrapped via
	/// [`Fiber::spawn`]). Exactly one of `from`/`to` may be running at
	/// any instant, which this call itself brings about.
	pub unsafe fn switch(from: *mut Self, to: *mut Self) {
		debug_assert!(!from.is_null() && !to.is_null());

		// Safety: guaranteed by caller; `context` is the first non-Node
		// field of both fibers and is never read by anyone else while a
		// switch is in flight.
		unsafe {
			let from_ctx = (*from).context.as_ptr();
			let to_ctx = (*to).context.as_ptr();

			Context::switch(from_ctx, to_ctx);
		}
	}

	/// Release the stack's pages back to the kernel. Only valid once the
	/// fiber is dead and will never run again.
	pub fn release_stack(&self) {
		self.stack.release();
	}
}

/// Called by the architecture-specific bootstrap trampoline
/// (`context::arch`'s `fiberio_x64_start`/`fiberio_arm64_start`) the first
/// time a freshly spawned fiber is resumed. Runs the user's entry
/// function, then hands control to the scheduler's `exit`, which never
/// returns.
///
/// # Safety
/// Called exactly once, by the trampoline, with the `(entry, arg)` pair
/// written by `Fiber::spawn`. Must never itself return: there is nothing
/// to return to.
#[no_mangle]
unsafe extern "C" fn fiberio_fiber_entry(entry: Entry, arg: *mut u8) -> ! {
	entry(arg);

	crate::scheduler::exit();
}

/// Recover a typed closure argument inside a generic entry trampoline.
///
/// # Safety
/// `arg` must be a pointer previously produced by `Box::into_raw` on a
/// `Box<F>`, not yet freed.
pub unsafe fn take_closure<F>(arg: *mut u8) -> F {
	// Safety: guaranteed by caller.
	let boxed = unsafe { Box::from_raw(arg.cast::<F>()) };

	*boxed
}

/// Box `f`, leaking it as the opaque `arg` pointer `Fiber::spawn` expects,
/// paired with the generic trampoline that will reconstruct and call it.
#[must_use]
pub fn entry_for<F: FnOnce() + 'static>(f: F) -> (Entry, *mut u8) {
	extern "C" fn trampoline<F: FnOnce() + 'static>(arg: *mut u8) {
		// Safety: `arg` is the `Box<F>` leaked just below, passed back
		// to us unchanged by the context switch machinery.
		let f = unsafe { take_closure::<F>(arg) };

		f();
	}

	let arg = Box::into_raw(Box::new(f)).cast::<u8>();

	(trampoline::<F>, arg)
}

/// An opaque reference to a spawned fiber (spec.md §6's `spawn` return
/// value). Carries no operations of its own; the scheduler is the only
/// thing that can act on it, and only while it's alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberHandle(NonNull<Fiber>);

impl FiberHandle {
	#[must_use]
	pub(crate) fn new(fiber: *mut Fiber) -> Self {
		// Safety: callers always construct this from a just-allocated or
		// just-registered fiber pointer, never null.
		Self(unsafe { NonNull::new_unchecked(fiber) })
	}

	#[must_use]
	pub(crate) fn as_ptr(self) -> *mut Fiber {
		self.0.as_ptr()
	}
}
