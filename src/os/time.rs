//! Monotonic clock reads, millisecond resolution, used for `poll` deadlines.

use std::io::Result;

use super::error::result_from_libc;

/// Current value of `CLOCK_MONOTONIC`, in milliseconds.
///
/// Monotonic: never goes backwards, unaffected by wall-clock adjustments.
/// This is the only clock the scheduler reads; deadlines are always
/// `now_ms() + timeout_ms`.
pub fn now_ms() -> Result<u64> {
	/* Safety: zero-initialized timespec is a valid argument to receive into */
	let mut ts: libc::timespec = unsafe { std::mem::zeroed() };

	let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };

	result_from_libc(ret.into())?;

	#[allow(clippy::cast_sign_loss)]
	let millis = (ts.tv_sec as u64)
		.saturating_mul(1000)
		.saturating_add((ts.tv_nsec as u64) / 1_000_000);

	Ok(millis)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn now_ms_is_monotonic() {
		let a = now_ms().expect("clock_gettime should succeed");
		let b = now_ms().expect("clock_gettime should succeed");

		assert!(b >= a);
	}
}
