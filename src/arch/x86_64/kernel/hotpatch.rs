//! Patch sites in the kernel image.
//!
//! Every site is recorded in the `hotpatch` link section as a
//! [`HotpatchDescriptor`]. The linker provides `__start_hotpatch` and
//! `__stop_hotpatch` for sections whose names are valid C identifiers.

use core::arch::global_asm;
use core::ptr::NonNull;
use core::slice;

use crate::spectre::hotpatch::{HotpatchName, HotpatchSite};

#[repr(C)]
struct HotpatchDescriptor {
	name: u8,
	len: u8,
	addr: *mut u8,
}

unsafe extern "C" {
	static __start_hotpatch: HotpatchDescriptor;
	static __stop_hotpatch: HotpatchDescriptor;

	/// Sets `IA32_SPEC_CTRL.IBRS` while the mitigation is enabled.
	///
	/// Clobbers `rax`, `rcx` and `rdx`. Called on every kernel entry.
	pub fn spectre_ibrs_enter();

	/// Clears `IA32_SPEC_CTRL.IBRS` while the mitigation is enabled.
	///
	/// Clobbers `rax`, `rcx` and `rdx`. Called right before returning to user space.
	pub fn spectre_ibrs_leave();
}

// Both stubs start out in the disabled form, i.e. a short jump over 15 bytes
// of int3 padding straight to the `ret`.
macro_rules! ibrs_stub {
	($symbol:literal, $name:literal) => {
		concat!(
			".pushsection .text.",
			$symbol,
			", \"ax\", @progbits\n",
			".global ",
			$symbol,
			"\n",
			".type ",
			$symbol,
			", @function\n",
			$symbol,
			":\n",
			"2:\n",
			".byte 0xeb, 0x0f\n",
			".fill 15, 1, 0xcc\n",
			"ret\n",
			".size ",
			$symbol,
			", . - ",
			$symbol,
			"\n",
			".popsection\n",
			".pushsection hotpatch, \"aw\", @progbits\n",
			".balign 8\n",
			".byte ",
			$name,
			", 17\n",
			".balign 8\n",
			".quad 2b\n",
			".popsection\n",
		)
	};
}

global_asm!(
	ibrs_stub!("spectre_ibrs_enter", "1"),
	ibrs_stub!("spectre_ibrs_leave", "2"),
);

/// Returns every well-formed descriptor of the `hotpatch` section.
pub(crate) fn sites() -> impl Iterator<Item = HotpatchSite> {
	let start = &raw const __start_hotpatch;
	let end = &raw const __stop_hotpatch;
	let descriptors = unsafe {
		let len = usize::try_from(end.offset_from(start)).unwrap_or(0);
		slice::from_raw_parts(start, len)
	};

	descriptors.iter().filter_map(|descriptor| {
		let Ok(name) = HotpatchName::try_from(descriptor.name) else {
			warn!("Unknown hotpatch name {}", descriptor.name);
			return None;
		};

		Some(HotpatchSite {
			name,
			addr: NonNull::new(descriptor.addr)?,
			len: usize::from(descriptor.len),
		})
	})
}
