use std::io::{Error, Result};

/// Turn a raw libc return value (`-1` on error, errno set) into a `Result`.
pub fn result_from_libc(result: isize) -> Result<isize> {
	if result >= 0 {
		return Ok(result);
	}

	Err(Error::last_os_error())
}
