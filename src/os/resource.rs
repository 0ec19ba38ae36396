//! The one process resource query the stack allocator needs: the system
//! page size, used to round a requested stack size up to whole pages and
//! to size the guard and margin pages added at each end (spec.md §4.2).

/// The page size reported by the running kernel.
///
/// Cached after the first call since it cannot change for the lifetime of
/// the process.
#[must_use]
pub fn page_size() -> usize {
	use std::sync::OnceLock;

	static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

	#[allow(clippy::cast_sign_loss)]
	*PAGE_SIZE.get_or_init(|| {
		/* Safety: _SC_PAGESIZE is always a valid sysconf name */
		let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

		assert!(size > 0, "sysconf(_SC_PAGESIZE) failed");
		assert!(
			(size as usize).is_power_of_two(),
			"page size must be a power of two, got {size}"
		);

		size as usize
	})
}
