//! Guard-paged fiber stacks and runtime discovery of which way the stack
//! grows (spec.md §2).

use std::hint::black_box;
use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use super::super::os::mman::Map;
use super::super::os::resource::page_size;

/// Which way the stack grows on this platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Up,
	Down
}

/// Compares `callee_local`'s address (a local of *this* frame) against
/// `caller_addr` (a local address from the caller's frame, passed in).
/// Called only through [`probe_indirect`]'s indirection, so the compiler
/// cannot fold the two frames together.
fn probe_callee(caller_addr: usize) -> Direction {
	let callee_local: u8 = 0;
	let callee_addr = std::ptr::addr_of!(callee_local) as usize;

	if callee_addr < caller_addr {
		Direction::Down
	} else if callee_addr > caller_addr {
		Direction::Up
	} else {
		// Same address can only happen if the optimizer saw through the
		// indirection and merged the frames; this must never happen.
		panic!("critical error: failed to determine stack direction")
	}
}

/// Calls [`probe_callee`] through a function pointer loaded from an
/// atomic with `SeqCst` ordering, with [`black_box`] on both the pointer
/// and the argument. Neither devirtualization nor inlining can see
/// through this: the Rust-idiomatic equivalent of the original's
/// `strtok`-based pointer laundering (spec.md §9's suggested redesign).
fn probe_indirect(caller_addr: usize) -> Direction {
	static SLOT: AtomicUsize = AtomicUsize::new(probe_callee as usize);

	let addr = black_box(SLOT.load(Ordering::SeqCst));

	// Safety: `SLOT` is only ever initialized to, and never overwritten
	// away from, `probe_callee`'s own address; transmuting that address
	// back to the function pointer it came from is sound.
	let probe: fn(usize) -> Direction = unsafe { std::mem::transmute(addr) };

	probe(black_box(caller_addr))
}

/// Discover (once) and cache which way the stack grows.
#[must_use]
pub fn direction() -> Direction {
	static DIRECTION: OnceLock<Direction> = OnceLock::new();

	*DIRECTION.get_or_init(|| {
		let caller_local: u8 = 0;
		let caller_addr = black_box(std::ptr::addr_of!(caller_local) as usize);

		probe_indirect(caller_addr)
	})
}

/// A fiber's stack: an anonymous mapping of a guard page, `size` usable
/// bytes, and a margin page, laid out so the guard sits on the side the
/// stack grows toward (an overrun reliably faults instead of corrupting
/// an adjacent mapping) and the margin sits on the opposite side (spec.md
/// §4.2: "add two pages (one guard, one margin)").
pub struct Stack {
	map: Map
}

impl Stack {
	/// The main fiber's "stack" is the thread's own OS-provided stack;
	/// this crate neither owns nor frees it.
	#[must_use]
	pub const fn main() -> Self {
		Self { map: Map::empty() }
	}

	#[must_use]
	pub const fn is_main(&self) -> bool {
		self.map.is_empty()
	}

	/// Map a stack with at least `size` usable bytes, rounded up to whole
	/// pages, plus one guard page on the side the stack grows toward and
	/// one margin page on the other side (spec.md §4.2).
	///
	/// Best-effort on the guard page: a failure to `mprotect` is logged
	/// and the stack is still usable, just unprotected (spec.md §7).
	pub fn allocate(size: usize) -> Result<Self> {
		let page = page_size();
		let usable = size.max(1).next_multiple_of(page);
		let total = usable + 2 * page;

		let map = Map::anonymous(total)?;

		let guard_offset = match direction() {
			Direction::Down => 0,
			Direction::Up => total - page
		};

		// Safety: `guard_offset..guard_offset + page` is within `total`.
		if let Err(err) = unsafe { map.protect(guard_offset, page, libc::PROT_NONE) } {
			log::warn!("failed to guard fiber stack: {err}");
		}

		Ok(Self { map })
	}

	/// The address to use as the initial stack pointer: one page short of
	/// the mapping's end if the stack grows down (leaving the margin page
	/// past it), or one page past the mapping's start if it grows up
	/// (leaving the margin page before it).
	#[must_use]
	pub fn top(&self) -> *mut u8 {
		let page = page_size();

		match direction() {
			// Safety: `len() - page` lies within this mapping; it is
			// never itself dereferenced, only used as an initial stack
			// pointer.
			Direction::Down => unsafe { self.map.addr().add(self.map.len() - page) },
			// Safety: `page` lies within this mapping, past the margin
			// page reserved at the low end.
			Direction::Up => unsafe { self.map.addr().add(page) }
		}
	}

	#[must_use]
	pub const fn len(&self) -> usize {
		self.map.len()
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	/// Advise the kernel the stack's pages are no longer needed. Does not
	/// unmap (so a later reuse wouldn't need to reprotect the guard page,
	/// though this crate never reuses a stack once reaped). Best-effort.
	pub fn release(&self) {
		if self.map.is_empty() {
			return;
		}

		// Safety: `0..len()` is the whole mapping.
		if let Err(err) = unsafe { self.map.advise_free(0, self.map.len()) } {
			log::warn!("failed to release fiber stack pages: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direction_is_deterministic() {
		assert_eq!(direction(), direction());
	}

	#[test]
	fn allocate_rounds_up_to_pages_and_adds_a_guard_and_margin() {
		let page = page_size();
		let stack = Stack::allocate(1).expect("mmap should succeed");

		assert_eq!(stack.len(), page * 3);
		assert!(!stack.is_main());
	}

	#[test]
	fn main_stack_is_empty_and_unowned() {
		let stack = Stack::main();

		assert!(stack.is_main());
		assert!(stack.is_empty());
	}

	#[test]
	fn top_lies_within_the_mapping() {
		let stack = Stack::allocate(4096).expect("mmap should succeed");
		let base = stack.map.addr() as usize;
		let top = stack.top() as usize;

		assert!(top >= base);
		assert!(top <= base + stack.len());
	}
}
