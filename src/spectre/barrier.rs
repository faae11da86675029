//! Speculation barrier on context switches.
//!
//! Branch predictions trained by one task must not steer speculation in a
//! task that does not trust it. With IBRS available, the scheduler issues an
//! indirect branch prediction barrier whenever it switches between two such
//! tasks. Disabling the indirect predictor on AMD already covers this case.

use core::sync::atomic::Ordering;

use super::MitigationController;
use super::msr::{IA32_PRED_CMD, PredCmd};
use super::probe::MitigationMethod;
use crate::arch::Platform;

/// Execution context the scheduler switches between.
pub trait SwitchContext {
	/// Returns `true` if predictions made on behalf of `other` may be
	/// consumed by `self`.
	fn trusts(&self, other: &Self) -> bool;
}

/// Address-space based trust.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrustDomain {
	/// Kernel threads share the kernel address space.
	Kernel,
	/// User tasks are identified by their root page table.
	User(u64),
}

impl SwitchContext for TrustDomain {
	fn trusts(&self, other: &Self) -> bool {
		self == other
	}
}

impl<P: Platform> MitigationController<P> {
	/// Flushes indirect branch predictions before `next` runs on the calling
	/// core, if the active mitigation requires it.
	///
	/// Called by the scheduler with interrupts disabled.
	#[inline]
	pub fn speculation_barrier<C: SwitchContext>(&self, prev: &C, next: &C) {
		if !self.enabled.load(Ordering::Relaxed) || next.trusts(prev) {
			return;
		}

		if self.method() == MitigationMethod::IntelIbrs {
			self.platform
				.write_register(IA32_PRED_CMD, PredCmd::IBPB.bits());
		}
	}
}
