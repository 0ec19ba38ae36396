//! The machine-level resume context and the switch/bootstrap primitive
//! (spec.md §4.2). Each fiber's [`Context`] is a small register file: the
//! callee-saved registers, the stack pointer, and the instruction pointer
//! to resume at. `switch` transfers control from one context to another by
//! saving the first and loading the second; there is no stack unwinding
//! involved, only a register save/restore and a jump.
//!
//! This plays the role the teacher's per-arch `fiber::{x64,arm64}` modules
//! play, generalized so `set_stack`/`set_entry` write a target register
//! file directly instead of relying on the original C library's
//! address-space-gap `alloca` trick (spec.md §9 explicitly sanctions this
//! substitution: "an inline-assembly context switch saving callee-saved
//! registers" is one of the named alternatives). See `DESIGN.md`.

use std::arch::global_asm;

/// The function a fiber's stack starts executing on once first resumed.
/// Stored type-erased; the real argument is a boxed closure recovered by
/// the generic trampoline `crate::fiber::trampoline::<F>`.
pub type Entry = extern "C" fn(*mut u8);

#[cfg(target_arch = "x86_64")]
mod arch {
	use super::{global_asm, Entry};

	/// Callee-saved register file for x86-64 (System V ABI). Field order
	/// and offsets are load-bearing: the assembly below indexes into this
	/// layout by byte offset, so the struct must stay `repr(C)` and must
	/// not grow hidden padding.
	#[repr(C)]
	#[derive(Clone, Copy, Default)]
	pub struct Context {
		rip: u64,
		rsp: u64,
		rbx: u64,
		rbp: u64,
		r12: u64,
		r13: u64,
		r14: u64,
		r15: u64
	}

	static_assertions::assert_eq_size!(Context, [u64; 8]);

	global_asm!(
		".global fiberio_x64_switch",
		"fiberio_x64_switch:",
		"mov [rdi+8], rsp",
		"mov [rdi+16], rbx",
		"mov [rdi+24], rbp",
		"mov [rdi+32], r12",
		"mov [rdi+40], r13",
		"mov [rdi+48], r14",
		"mov [rdi+56], r15",
		"lea rax, [rip + 1f]",
		"mov [rdi], rax",
		"mov rsp, [rsi+8]",
		"mov rbx, [rsi+16]",
		"mov rbp, [rsi+24]",
		"mov r12, [rsi+32]",
		"mov r13, [rsi+40]",
		"mov r14, [rsi+48]",
		"mov r15, [rsi+56]",
		"jmp qword ptr [rsi]",
		"1:",
		"ret",
		".global fiberio_x64_start",
		"fiberio_x64_start:",
		"mov rdi, r12",
		"mov rsi, r13",
		"call fiberio_fiber_entry",
		"ud2"
	);

	extern "C" {
		fn fiberio_x64_switch(from: *mut Context, to: *mut Context);
		fn fiberio_x64_start();
	}

	impl Context {
		pub const fn new() -> Self {
			Self { rip: 0, rsp: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 }
		}

		/// Initial stack pointer: must be 16-byte aligned per the SysV
		/// ABI, since the bootstrap trampoline `call`s into Rust.
		pub fn set_stack(&mut self, top: *mut u8) {
			self.rsp = (top as usize & !0xf) as u64;
		}

		/// Stash `entry`/`arg` in otherwise-unused callee-saved slots;
		/// the bootstrap trampoline moves them into the first two
		/// argument registers before calling into Rust.
		pub fn set_entry(&mut self, entry: Entry, arg: *mut u8) {
			self.r12 = entry as usize as u64;
			self.r13 = arg as u64;
			self.rip = fiberio_x64_start as usize as u64;
		}

		/// # Safety
		/// `from` and `to` must be valid, non-aliasing pointers to
		/// contexts belonging to fibers that are not concurrently
		/// switching (true by construction: exactly one fiber runs at
		/// a time).
		pub unsafe fn switch(from: *mut Self, to: *mut Self) {
			// Safety: guaranteed by caller.
			unsafe { fiberio_x64_switch(from, to) };
		}
	}
}

#[cfg(target_arch = "aarch64")]
mod arch {
	use super::{global_asm, Entry};

	/// Callee-saved register file for AArch64 (AAPCS64): `x19`-`x28`,
	/// the frame pointer/link register, the stack pointer, and the
	/// callee-saved FP/SIMD halves `d8`-`d15`. Offsets are load-bearing,
	/// same caveat as the x86-64 layout above.
	#[repr(C)]
	#[derive(Clone, Copy, Default)]
	pub struct Context {
		pc: u64,
		sp: u64,
		x19: u64,
		x20: u64,
		x21: u64,
		x22: u64,
		x23: u64,
		x24: u64,
		x25: u64,
		x26: u64,
		x27: u64,
		x28: u64,
		x29: u64,
		x30: u64,
		d: [u64; 8]
	}

	static_assertions::assert_eq_size!(Context, [u64; 22]);

	global_asm!(
		".global fiberio_arm64_switch",
		"fiberio_arm64_switch:",
		"mov x8, sp",
		"str x8, [x0, 8]",
		"str x19, [x0, 16]",
		"str x20, [x0, 24]",
		"str x21, [x0, 32]",
		"str x22, [x0, 40]",
		"str x23, [x0, 48]",
		"str x24, [x0, 56]",
		"str x25, [x0, 64]",
		"str x26, [x0, 72]",
		"str x27, [x0, 80]",
		"str x28, [x0, 88]",
		"str x29, [x0, 96]",
		"str x30, [x0, 104]",
		"stp d8, d9, [x0, 112]",
		"stp d10, d11, [x0, 128]",
		"stp d12, d13, [x0, 144]",
		"stp d14, d15, [x0, 160]",
		"adr x8, 1f",
		"str x8, [x0]",
		"ldr x8, [x1, 8]",
		"mov sp, x8",
		"ldr x19, [x1, 16]",
		"ldr x20, [x1, 24]",
		"ldr x21, [x1, 32]",
		"ldr x22, [x1, 40]",
		"ldr x23, [x1, 48]",
		"ldr x24, [x1, 56]",
		"ldr x25, [x1, 64]",
		"ldr x26, [x1, 72]",
		"ldr x27, [x1, 80]",
		"ldr x28, [x1, 88]",
		"ldr x29, [x1, 96]",
		"ldr x30, [x1, 104]",
		"ldp d8, d9, [x1, 112]",
		"ldp d10, d11, [x1, 128]",
		"ldp d12, d13, [x1, 144]",
		"ldp d14, d15, [x1, 160]",
		"ldr x8, [x1]",
		"br x8",
		"1:",
		"ret",
		".global fiberio_arm64_start",
		"fiberio_arm64_start:",
		"mov x0, x19",
		"mov x1, x20",
		"bl fiberio_fiber_entry",
		"brk 1"
	);

	extern "C" {
		fn fiberio_arm64_switch(from: *mut Context, to: *mut Context);
		fn fiberio_arm64_start();
	}

	impl Context {
		pub const fn new() -> Self {
			Self {
				pc: 0,
				sp: 0,
				x19: 0,
				x20: 0,
				x21: 0,
				x22: 0,
				x23: 0,
				x24: 0,
				x25: 0,
				x26: 0,
				x27: 0,
				x28: 0,
				x29: 0,
				x30: 0,
				d: [0; 8]
			}
		}

		pub fn set_stack(&mut self, top: *mut u8) {
			self.sp = (top as usize & !0xf) as u64;
		}

		pub fn set_entry(&mut self, entry: Entry, arg: *mut u8) {
			self.x19 = entry as usize as u64;
			self.x20 = arg as u64;
			self.pc = fiberio_arm64_start as usize as u64;
		}

		/// # Safety
		/// Same contract as the x86-64 `switch` above.
		pub unsafe fn switch(from: *mut Self, to: *mut Self) {
			// Safety: guaranteed by caller.
			unsafe { fiberio_arm64_switch(from, to) };
		}
	}
}

pub use arch::Context;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_context_is_zeroed() {
		let ctx = Context::new();
		let bytes: &[u8] = unsafe {
			std::slice::from_raw_parts(
				(&ctx as *const Context).cast::<u8>(),
				std::mem::size_of::<Context>()
			)
		};
		assert!(bytes.iter().all(|&b| b == 0));
	}
}
