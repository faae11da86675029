//! Runtime patching of kernel text.
//!
//! The kernel image records every location that may be rewritten in a table
//! of [`HotpatchSite`]s. Each name has exactly two encodings of identical
//! length, so a site can be flipped in place without moving any surrounding
//! instruction.
//!
//! Nothing outside this module writes to kernel text, and only the
//! rendezvous and the boot path can reach [`CodePatcher`].

use core::ptr::NonNull;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::arch::{InterruptControl, TextMemory};

/// Length of every IBRS patch site in bytes.
pub const IBRS_SITE_LEN: usize = 17;

/// Names of the patchable sequences in kernel text.
#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum HotpatchName {
	/// Kernel entry, sets `IA32_SPEC_CTRL.IBRS`.
	IbrsEnter = 1,
	/// Return to user space, clears `IA32_SPEC_CTRL.IBRS`.
	IbrsLeave = 2,
}

/// One recorded instance of a named sequence in kernel text.
#[derive(Clone, Copy, Debug)]
pub struct HotpatchSite {
	pub name: HotpatchName,
	pub addr: NonNull<u8>,
	pub len: usize,
}

/// Which of the two encodings of a patch site to install.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Variant {
	Enabled,
	Disabled,
}

impl From<bool> for Variant {
	fn from(enabled: bool) -> Self {
		if enabled {
			Self::Enabled
		} else {
			Self::Disabled
		}
	}
}

/// Both encodings of a patch site.
pub struct PatchSite {
	pub name: HotpatchName,
	pub enabled: &'static [u8],
	pub disabled: &'static [u8],
}

impl PatchSite {
	pub fn bytes(&self, variant: Variant) -> &'static [u8] {
		match variant {
			Variant::Enabled => self.enabled,
			Variant::Disabled => self.disabled,
		}
	}
}

// movl $IA32_SPEC_CTRL, %ecx
// movl $IBRS, %eax
// movl $0, %edx
// wrmsr
const IBRS_ENTER: [u8; IBRS_SITE_LEN] = [
	0xb9, 0x48, 0x00, 0x00, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xba, 0x00, 0x00, 0x00, 0x00,
	0x0f, 0x30,
];

// Same as above, but clears the bit again.
const IBRS_LEAVE: [u8; IBRS_SITE_LEN] = [
	0xb9, 0x48, 0x00, 0x00, 0x00, 0xb8, 0x00, 0x00, 0x00, 0x00, 0xba, 0x00, 0x00, 0x00, 0x00,
	0x0f, 0x30,
];

// jmp over the site, followed by int3 padding.
const NO_IBRS: [u8; IBRS_SITE_LEN] = [
	0xeb, 0x0f, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
	0xcc, 0xcc,
];

/// The IBRS patch sites, in the order they are applied.
pub static IBRS_SITES: [PatchSite; 2] = [
	PatchSite {
		name: HotpatchName::IbrsEnter,
		enabled: &IBRS_ENTER,
		disabled: &NO_IBRS,
	},
	PatchSite {
		name: HotpatchName::IbrsLeave,
		enabled: &IBRS_LEAVE,
		disabled: &NO_IBRS,
	},
];

/// Writable kernel text on the current core.
///
/// Opening the window saves the interrupt state and masks interrupts before
/// write protection is lifted. Dropping it restores protection first and the
/// interrupt state second.
struct PatchWindow<'a, P: TextMemory + InterruptControl> {
	platform: &'a P,
	protection: P::Protection,
	irq_was_enabled: bool,
}

impl<'a, P: TextMemory + InterruptControl> PatchWindow<'a, P> {
	fn open(platform: &'a P) -> Self {
		let irq_was_enabled = platform.nested_disable();
		let protection = platform.unprotect();
		Self {
			platform,
			protection,
			irq_was_enabled,
		}
	}
}

impl<P: TextMemory + InterruptControl> Drop for PatchWindow<'_, P> {
	fn drop(&mut self) {
		self.platform.protect(self.protection);
		self.platform.nested_enable(self.irq_was_enabled);
	}
}

/// Rewrites named patch sites.
///
/// Holding a `CodePatcher` means that no other core executes kernel text
/// that may be patched: either no other core exists yet, or all of them are
/// parked in the rendezvous with interrupts disabled.
pub(super) struct CodePatcher<'a, P> {
	platform: &'a P,
}

impl<'a, P: TextMemory + InterruptControl> CodePatcher<'a, P> {
	/// # Safety
	///
	/// The caller must guarantee that no other core fetches patchable kernel
	/// text until the patcher is dropped and every core has serialized its
	/// instruction stream.
	pub(super) unsafe fn new(platform: &'a P) -> Self {
		Self { platform }
	}

	/// Installs `variant` at every recorded instance of `site`.
	///
	/// Returns the number of locations that were rewritten.
	pub(super) fn apply(&self, site: &PatchSite, variant: Variant) -> usize {
		let bytes = site.bytes(variant);
		let _window = PatchWindow::open(self.platform);

		let mut count = 0;
		for location in self.platform.sites().filter(|s| s.name == site.name) {
			if location.len != bytes.len() {
				warn!(
					"Skipping {:?} at {:p}: recorded length {} does not match {}",
					site.name,
					location.addr,
					location.len,
					bytes.len()
				);
				continue;
			}

			// SAFETY: The site describes `len` bytes of kernel text, which the
			// open window made writable, and nobody else executes it.
			unsafe {
				write_text(location.addr, bytes);
			}
			trace!("Patched {:?} at {:p} ({:?})", site.name, location.addr, variant);
			count += 1;
		}

		count
	}
}

/// Copies `bytes` to `dst`.
///
/// Naturally aligned 8-byte words are stored with a single instruction so
/// that the instruction fetch unit never observes half of a word.
///
/// # Safety
///
/// `dst` must be valid for `bytes.len()` bytes of writes.
unsafe fn write_text(dst: NonNull<u8>, bytes: &[u8]) {
	let mut offset = 0;
	while offset < bytes.len() {
		let ptr = unsafe { dst.as_ptr().add(offset) };
		let remaining = &bytes[offset..];

		if let (true, Some(word)) = (ptr.cast::<u64>().is_aligned(), remaining.first_chunk::<8>())
		{
			unsafe {
				ptr.cast::<u64>().write_volatile(u64::from_ne_bytes(*word));
			}
			offset += 8;
		} else {
			unsafe {
				ptr.write_volatile(remaining[0]);
			}
			offset += 1;
		}
	}
}
