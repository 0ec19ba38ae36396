//! Anonymous memory mapping and page protection, used to allocate fiber
//! stacks with a guard page at one end.

use std::io::Result;
use std::ptr;

use super::error::result_from_libc;

/// A mapping of anonymous memory. Unmapped on drop.
///
/// An empty `Map` (as used for the main fiber, which does not own its
/// stack) carries a null address and a zero length; `Drop` is a no-op for
/// it.
pub struct Map {
	addr: *mut u8,
	len: usize
}

/* Safety: the memory is exclusively owned by whoever holds the `Map` */
unsafe impl Send for Map {}

impl Map {
	/// An empty map that owns nothing and frees nothing.
	#[must_use]
	pub const fn empty() -> Self {
		Self { addr: ptr::null_mut(), len: 0 }
	}

	/// Map `len` bytes of anonymous, private, read-write memory.
	pub fn anonymous(len: usize) -> Result<Self> {
		/* Safety: MAP_ANONYMOUS with a null addr and fd == -1 ignores the fd
		 * argument; this is a documented libc invariant */
		let addr = unsafe {
			libc::mmap(
				ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0
			)
		};

		if addr == libc::MAP_FAILED {
			return Err(std::io::Error::last_os_error());
		}

		Ok(Self { addr: addr.cast(), len })
	}

	#[must_use]
	pub const fn addr(&self) -> *mut u8 {
		self.addr
	}

	#[must_use]
	pub const fn len(&self) -> usize {
		self.len
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Change protection on the `len` bytes starting at `offset` from the
	/// base of this mapping.
	///
	/// # Safety
	/// `offset + len` must not exceed the mapping's length.
	pub unsafe fn protect(&self, offset: usize, len: usize, prot: i32) -> Result<()> {
		/* Safety: guaranteed by caller */
		let addr = unsafe { self.addr.add(offset) };
		let ret = unsafe { libc::mprotect(addr.cast(), len, prot) };

		result_from_libc(ret.into())?;

		Ok(())
	}

	/// Release the pages back to the kernel without unmapping them.
	/// Best-effort: failures are not actionable and are left for the
	/// caller to log.
	///
	/// # Safety
	/// `offset + len` must not exceed the mapping's length.
	pub unsafe fn advise_free(&self, offset: usize, len: usize) -> Result<()> {
		/* Safety: guaranteed by caller */
		let addr = unsafe { self.addr.add(offset) };
		let ret = unsafe { libc::madvise(addr.cast(), len, libc::MADV_DONTNEED) };

		result_from_libc(ret.into())?;

		Ok(())
	}
}

impl Drop for Map {
	fn drop(&mut self) {
		if self.addr.is_null() {
			return;
		}

		/* Safety: `addr`/`len` describe exactly the region we mapped */
		let ret = unsafe { libc::munmap(self.addr.cast(), self.len) };

		debug_assert_eq!(ret, 0, "munmap failed: {:?}", std::io::Error::last_os_error());
	}
}
