//! x86-64 backend of the mitigation controller.

#[cfg(target_os = "none")]
mod hotpatch;
pub mod processor;

#[cfg(target_os = "none")]
pub use self::bare::Machine;
#[cfg(target_os = "none")]
pub use self::hotpatch::{spectre_ibrs_enter, spectre_ibrs_leave};

#[cfg(target_os = "none")]
mod bare {
	use x86_64::registers::control::Cr0Flags;

	use super::{hotpatch, processor};
	use crate::arch::{
		ControlRegisterPort, CoreId, CpuIdSource, CpuLifecycle, InterruptControl, TextMemory,
	};
	use crate::spectre::hotpatch::HotpatchSite;
	use crate::spectre::probe::CpuIdentity;

	/// The processor this kernel runs on.
	///
	/// Register, interrupt and text access are implemented here. Core
	/// enumeration, hot-plug and cross-calls are delegated to the scheduler's
	/// `S`.
	pub struct Machine<S> {
		smp: S,
	}

	impl<S> Machine<S> {
		pub const fn new(smp: S) -> Self {
			Self { smp }
		}
	}

	impl<S> ControlRegisterPort for Machine<S> {
		#[inline]
		fn read_register(&self, register: u32) -> u64 {
			processor::rdmsr(register)
		}

		#[inline]
		fn write_register(&self, register: u32, value: u64) {
			processor::wrmsr(register, value);
		}
	}

	impl<S> InterruptControl for Machine<S> {
		fn nested_disable(&self) -> bool {
			processor::nested_disable()
		}

		fn nested_enable(&self, was_enabled: bool) {
			processor::nested_enable(was_enabled);
		}
	}

	impl<S> TextMemory for Machine<S> {
		type Protection = Cr0Flags;

		fn sites(&self) -> impl Iterator<Item = HotpatchSite> {
			hotpatch::sites()
		}

		fn unprotect(&self) -> Cr0Flags {
			processor::disable_write_protect()
		}

		fn protect(&self, saved: Cr0Flags) {
			processor::restore_write_protect(saved);
		}

		fn sync_core(&self) {
			processor::flush();
		}
	}

	impl<S> CpuIdSource for Machine<S> {
		fn identity(&self) -> CpuIdentity {
			processor::identity()
		}
	}

	impl<S: CpuLifecycle> CpuLifecycle for Machine<S> {
		type Guard<'a>
			= S::Guard<'a>
		where
			Self: 'a;

		fn core_id(&self) -> CoreId {
			self.smp.core_id()
		}

		fn lock(&self) -> Self::Guard<'_> {
			self.smp.lock()
		}

		fn processor_count(&self) -> u32 {
			self.smp.processor_count()
		}

		fn all_online(&self) -> bool {
			self.smp.all_online()
		}

		fn broadcast(&self, func: &(dyn Fn() + Sync)) {
			self.smp.broadcast(func);
		}
	}
}
