//! Architecture-specific architecture abstraction.
//!
//! The mitigation logic in [`crate::spectre`] never touches the processor
//! directly. Everything it needs from the machine is expressed by the traits
//! in this module and supplied by [`x86_64::kernel::Machine`] on real
//! hardware.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::spectre::hotpatch::HotpatchSite;
use crate::spectre::probe::CpuIdentity;

/// Sequential ID of a CPU core.
pub type CoreId = u32;

/// The core that boots the system. It is never taken off-line.
pub const BOOT_CORE: CoreId = 0;

/// Access to the model-specific registers of the current core.
///
/// Faults raised by the hardware are fatal and never surface here.
pub trait ControlRegisterPort {
	fn read_register(&self, register: u32) -> u64;

	fn write_register(&self, register: u32, value: u64);
}

/// Interrupt state of the current core.
pub trait InterruptControl {
	/// Disables interrupts and returns whether they were enabled before.
	fn nested_disable(&self) -> bool;

	/// Re-enables interrupts if `was_enabled` is set.
	fn nested_enable(&self, was_enabled: bool);
}

/// Kernel text that may be rewritten at runtime.
pub trait TextMemory {
	/// Write-protection state saved while the text is writable.
	type Protection: Copy;

	/// Every patch site recorded in the kernel image.
	fn sites(&self) -> impl Iterator<Item = HotpatchSite>;

	/// Makes kernel text writable on the current core.
	fn unprotect(&self) -> Self::Protection;

	/// Restores the protection returned by [`TextMemory::unprotect`].
	fn protect(&self, saved: Self::Protection);

	/// Discards everything the current core may have fetched or decoded
	/// ahead of time.
	fn sync_core(&self);
}

/// Reads the identity of the boot processor.
pub trait CpuIdSource {
	fn identity(&self) -> CpuIdentity;
}

/// CPU bring-up and tear-down, provided by the scheduler.
pub trait CpuLifecycle {
	/// Guard of the lock that excludes CPU hot-plug.
	type Guard<'a>
	where
		Self: 'a;

	/// Returns the ID of the calling core.
	fn core_id(&self) -> CoreId;

	/// Acquires the lock that excludes CPU hot-plug.
	fn lock(&self) -> Self::Guard<'_>;

	/// Number of cores that are currently on-line.
	fn processor_count(&self) -> u32;

	/// Returns `true` if no present core is off-line.
	fn all_online(&self) -> bool;

	/// Runs `func` on every on-line core, including the calling one, and
	/// returns once all of them have finished.
	fn broadcast(&self, func: &(dyn Fn() + Sync));
}

/// Everything the mitigation controller needs from the machine.
pub trait Platform:
	ControlRegisterPort + InterruptControl + TextMemory + CpuIdSource + CpuLifecycle + Sync
{
}

impl<T> Platform for T where
	T: ControlRegisterPort + InterruptControl + TextMemory + CpuIdSource + CpuLifecycle + Sync
{
}
