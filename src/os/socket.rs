//! Non-blocking `recv`/`send` over raw file descriptors, exactly the
//! surface the buffered I/O adapter needs once the multiplexer has
//! signalled a descriptor ready (spec.md §4.5). No socket creation,
//! addressing, or option-setting surface: those are application concerns
//! the caller handles before handing a descriptor to this crate.

use std::io::Result;
use std::os::fd::RawFd;

use super::error::result_from_libc;

/// Receive into `buf` without blocking, regardless of the descriptor's own
/// blocking mode. Returns `Ok(0)` on end-of-stream, matching spec.md
/// §4.5's "zero from the first recv indicates end-of-stream".
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
	/* Safety: `buf` is valid for `buf.len()` writable bytes */
	let ret =
		unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT) };

	#[allow(clippy::cast_sign_loss)]
	result_from_libc(ret as isize).map(|n| n as usize)
}

/// Send from `buf` without blocking. `MSG_NOSIGNAL` keeps a peer that hung
/// up from raising `SIGPIPE` on this thread; the broken-pipe condition
/// still comes back as an error.
pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
	/* Safety: `buf` is valid for `buf.len()` readable bytes */
	let ret = unsafe {
		libc::send(
			fd,
			buf.as_ptr().cast(),
			buf.len(),
			libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL
		)
	};

	#[allow(clippy::cast_sign_loss)]
	result_from_libc(ret as isize).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn socketpair() -> (RawFd, RawFd) {
		let mut fds = [0i32; 2];

		/* Safety: `fds` is a valid 2-element array */
		let ret =
			unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };

		assert_eq!(ret, 0, "socketpair() should succeed");

		(fds[0], fds[1])
	}

	#[test]
	fn send_then_recv_roundtrips() {
		let (a, b) = socketpair();

		let sent = send(a, b"hello").expect("send should succeed");
		assert_eq!(sent, 5);

		let mut buf = [0u8; 16];
		let received = recv(b, &mut buf).expect("recv should succeed");
		assert_eq!(&buf[..received], b"hello");

		/* Safety: fds are open and owned by this test */
		unsafe {
			libc::close(a);
			libc::close(b);
		}
	}

	#[test]
	fn recv_on_closed_peer_returns_zero() {
		let (a, b) = socketpair();

		/* Safety: `a` is open and owned by this test */
		unsafe { libc::close(a) };

		let mut buf = [0u8; 16];
		let received = recv(b, &mut buf).expect("recv should succeed");
		assert_eq!(received, 0);

		/* Safety: `b` is open and owned by this test */
		unsafe { libc::close(b) };
	}
}
