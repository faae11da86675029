//! All-core rendezvous around a mitigation change.
//!
//! Every on-line core runs [`Rendezvous::run`] with interrupts disabled.
//! The first phase makes sure that all of them have stopped executing
//! anything that may be patched before the designated core writes. The
//! second phase keeps everybody parked until those writes are complete.
//! Afterwards, each core serializes its instruction stream so that it
//! refetches the new code.

use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::arch::{CoreId, CpuLifecycle, InterruptControl, TextMemory};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
	/// All cores have interrupts disabled and wait.
	Arrival,
	/// The designated core has finished patching.
	Completion,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Arrival => f.write_str("phase 1"),
			Self::Completion => f.write_str("phase 2"),
		}
	}
}

pub(super) struct Rendezvous {
	arrival: CachePadded<AtomicU32>,
	completion: CachePadded<AtomicU32>,
	designated: CoreId,
	warn_spins: u64,
}

impl Rendezvous {
	/// Creates a rendezvous for `participants` cores.
	///
	/// The number of participants must be exactly the number of cores the
	/// rendezvous is broadcast to. If a core never arrives, all others spin
	/// forever.
	pub(super) fn new(participants: u32, designated: CoreId, warn_spins: u64) -> Self {
		Self {
			arrival: CachePadded::new(AtomicU32::new(participants)),
			completion: CachePadded::new(AtomicU32::new(participants)),
			designated,
			warn_spins,
		}
	}

	/// Takes part in the rendezvous on the calling core.
	///
	/// `global` runs on the designated core only, `local` runs on every
	/// core. Both run after all cores arrived and before any core leaves.
	pub(super) fn run<P>(&self, platform: &P, global: impl FnOnce(), local: impl FnOnce())
	where
		P: InterruptControl + TextMemory + CpuLifecycle,
	{
		let core_id = platform.core_id();
		let irq_was_enabled = platform.nested_disable();

		self.wait(&self.arrival, Phase::Arrival, core_id);

		if core_id == self.designated {
			global();
		}
		local();

		self.wait(&self.completion, Phase::Completion, core_id);

		platform.sync_core();
		platform.nested_enable(irq_was_enabled);
	}

	fn wait(&self, counter: &AtomicU32, phase: Phase, core_id: CoreId) {
		let before = counter.fetch_sub(1, Ordering::AcqRel);
		debug_assert_ne!(before, 0, "more cores than participants at {phase}");

		let mut spins: u64 = 0;
		while counter.load(Ordering::Acquire) != 0 {
			spin_loop();
			spins += 1;
			if spins == self.warn_spins {
				warn!(
					"Core {core_id} still waits for {} cores at {phase}",
					counter.load(Ordering::Relaxed)
				);
			}
		}

		trace!("Core {core_id} passed {phase} after {spins} spins");
	}
}
