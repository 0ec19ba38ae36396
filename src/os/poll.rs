use enumflags2::bitflags;

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PollFlag {
	/// There is data to read.
	In        = 1 << 0,

	/// There is urgent data to read.
	Priority  = 1 << 1,

	/// Writing now will not block.
	Out       = 1 << 2,

	/// Error condition.
	Error     = 1 << 3,

	/// Hung up.
	HangUp    = 1 << 4,

	/// Invalid polling request.
	Invalid   = 1 << 5,

	/// Normal data may be read.
	ReadNorm  = 1 << 6,

	/// Priority data may be read.
	ReadBand  = 1 << 7,

	/// Writing now will not block.
	WriteNorm = 1 << 8,

	/// Priority data may be written.
	WriteBand = 1 << 9,

	/// Extensions for Linux
	Message   = 1 << 10,
	Remove    = 1 << 12,
	RdHangUp  = 1 << 13
}

/// A `(fd, events, revents)` triple laid out exactly like `struct pollfd`,
/// so a slice of these can be handed to `libc::poll` directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PollFd {
	pub fd: i32,
	pub events: i16,
	pub revents: i16
}

impl PollFd {
	#[must_use]
	pub const fn new(fd: i32, events: u16) -> Self {
		Self { fd, events: events as i16, revents: 0 }
	}

	#[must_use]
	pub const fn revents(&self) -> u16 {
		self.revents as u16
	}
}

/// Block waiting for readiness on `fds`, per POSIX `poll(2)` semantics:
/// `timeout_ms < 0` waits indefinitely, `== 0` returns immediately, `> 0`
/// waits at most that many milliseconds. Returns the number of descriptors
/// with nonzero `revents`, or `0` on timeout.
///
/// `EINTR` is retried transparently: a signal arriving mid-wait is not a
/// failure the caller can act on.
pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> std::io::Result<i32> {
	loop {
		/* Safety: `PollFd` has the same layout as `libc::pollfd`, and
		 * `fds.len()` bounds the array libc is allowed to touch */
		let ret = unsafe {
			libc::poll(
				fds.as_mut_ptr().cast::<libc::pollfd>(),
				fds.len() as libc::nfds_t,
				timeout_ms
			)
		};

		if ret >= 0 {
			return Ok(ret);
		}

		let err = std::io::Error::last_os_error();

		if err.kind() != std::io::ErrorKind::Interrupted {
			return Err(err);
		}
	}
}

static_assertions::assert_eq_size!(PollFd, libc::pollfd);

#[cfg(test)]
mod tests {
	use super::*;

	fn pipe() -> (i32, i32) {
		let mut fds = [0i32; 2];

		/* Safety: `fds` is a valid 2-element array */
		let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

		assert_eq!(ret, 0, "pipe() should succeed");

		(fds[0], fds[1])
	}

	#[test]
	fn poll_pipe_becomes_readable() {
		let (reader, writer) = pipe();

		let mut fds = [PollFd::new(reader, PollFlag::In as u16)];
		assert_eq!(poll(&mut fds, 0).expect("poll should succeed"), 0);

		/* Safety: `writer` is an open, valid fd */
		let n = unsafe { libc::write(writer, b"x".as_ptr().cast(), 1) };
		assert_eq!(n, 1);

		let n = poll(&mut fds, 1000).expect("poll should succeed");
		assert_eq!(n, 1);
		assert_ne!(fds[0].revents() & PollFlag::In as u16, 0);

		/* Safety: fds are open, valid, and owned by this test */
		unsafe {
			libc::close(reader);
			libc::close(writer);
		}
	}
}
