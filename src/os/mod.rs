//! Thin wrappers over the POSIX facilities the runtime needs: anonymous
//! memory mapping with page protection, a monotonic clock, multi-descriptor
//! readiness waits, and non-blocking socket I/O.
//!
//! Every syscall-adjacent function here returns [`std::io::Result`]; there is
//! no crate-specific error type; see `DESIGN.md` for why.

pub mod error;
pub mod mman;
pub mod poll;
pub mod resource;
pub mod socket;
pub mod time;

pub use error::result_from_libc;
pub use resource::page_size;
