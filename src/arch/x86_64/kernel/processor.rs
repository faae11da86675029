use raw_cpuid::CpuId;

use crate::spectre::probe::{CpuIdentity, Vendor};

/// Reads the identity of the calling processor.
///
/// Leaves that the processor does not implement read as empty, which the
/// probe treats as "no mitigation available".
pub fn identity() -> CpuIdentity {
	let cpuid = CpuId::new();

	let vendor = cpuid
		.get_vendor_info()
		.map_or(Vendor::Other, |info| Vendor::from_vendor_string(info.as_str()));
	let family = cpuid.get_feature_info().map_or(0, |info| info.family_id());
	let sef_edx = if cpuid.get_extended_feature_info().is_some() {
		raw_cpuid::cpuid!(7, 0).edx
	} else {
		0
	};
	let long_mode = cpuid
		.get_extended_processor_and_feature_identifiers()
		.is_some_and(|info| info.has_64bit_mode());

	CpuIdentity {
		vendor,
		family,
		sef_edx,
		long_mode,
	}
}

#[cfg(target_os = "none")]
pub(crate) use self::bare::*;

#[cfg(target_os = "none")]
mod bare {
	use core::arch::asm;

	use x86_64::registers::control::{Cr0, Cr0Flags};
	use x86_64::registers::model_specific::Msr;
	use x86_64::registers::rflags::{self, RFlags};

	#[inline]
	pub(crate) fn rdmsr(register: u32) -> u64 {
		unsafe { Msr::new(register).read() }
	}

	#[inline]
	pub(crate) fn wrmsr(register: u32, value: u64) {
		let mut msr = Msr::new(register);
		unsafe {
			msr.write(value);
		}
	}

	/// Disable IRQs (nested)
	///
	/// Returns whether interrupts were enabled, to be handed to
	/// [`nested_enable`] later.
	#[inline]
	pub(crate) fn nested_disable() -> bool {
		let ret = rflags::read().contains(RFlags::INTERRUPT_FLAG);
		x86_64::instructions::interrupts::disable();
		ret
	}

	/// Enable IRQs (nested)
	#[inline]
	pub(crate) fn nested_enable(was_enabled: bool) {
		if was_enabled {
			x86_64::instructions::interrupts::enable();
		}
	}

	/// Clears CR0.WP so that the kernel may write to read-only text.
	///
	/// Interrupts must be disabled on the calling core.
	pub(crate) fn disable_write_protect() -> Cr0Flags {
		let cr0 = Cr0::read();
		unsafe {
			Cr0::write(cr0 - Cr0Flags::WRITE_PROTECT);
		}
		cr0
	}

	pub(crate) fn restore_write_protect(cr0: Cr0Flags) {
		unsafe {
			Cr0::write(cr0);
		}
	}

	/// Writes back the caches and serializes the instruction stream.
	///
	/// CPUID is architecturally serializing, which forces the core to
	/// refetch everything that follows.
	pub(crate) fn flush() {
		unsafe {
			asm!("wbinvd", options(nostack, preserves_flags));
		}
		let _ = raw_cpuid::cpuid!(0);
	}
}
