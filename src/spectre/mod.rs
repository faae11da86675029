//! Spectre-V2 mitigation.
//!
//! The processor is probed once on the boot core. The chosen
//! [`MitigationMethod`] is applied to the boot core right away and to every
//! other core while it comes on-line. Later on, the mitigation may be toggled
//! at runtime with [`MitigationController::set_enabled`], which brings all
//! cores into a [`Rendezvous`](rendezvous::Rendezvous) so that kernel text and
//! per-core registers change everywhere at once.
//!
//! The kernel keeps a single controller in a `static`:
//!
//! ```ignore
//! static SPECTRE: MitigationController<Machine<Smp>> =
//! 	MitigationController::new(Machine::new(Smp));
//! ```

pub mod barrier;
pub mod hotpatch;
pub mod msr;
pub mod probe;
mod rendezvous;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hermit_sync::OnceCell;

pub use self::barrier::{SwitchContext, TrustDomain};
pub use self::error::{SpectreError, UnsupportedReason};
use self::hotpatch::{CodePatcher, IBRS_SITES, Variant};
use self::msr::{IA32_SPEC_CTRL, SpecCtrl};
pub use self::probe::MitigationMethod;
use self::rendezvous::Rendezvous;
use crate::arch::{BOOT_CORE, CoreId, Platform};
use crate::config::{MAX_CORES, STATUS_NONE};
use crate::env::{BootMode, Config};

pub mod error {
	use thiserror::Error;

	use crate::errno::Errno;

	#[derive(Error, PartialEq, Eq, Clone, Copy, Debug)]
	pub enum UnsupportedReason {
		#[error("no mitigation available")]
		NoMitigation,
		#[error("some CPUs are offline")]
		CoresOffline,
	}

	#[derive(Error, PartialEq, Eq, Clone, Copy, Debug)]
	pub enum SpectreError {
		#[error("Cannot change Spectre-V2 mitigation: {0}")]
		Unsupported(UnsupportedReason),
	}

	impl From<SpectreError> for Errno {
		fn from(err: SpectreError) -> Self {
			match err {
				SpectreError::Unsupported(UnsupportedReason::NoMitigation) => Errno::Opnotsupp,
				SpectreError::Unsupported(UnsupportedReason::CoresOffline) => Errno::Busy,
			}
		}
	}
}

/// Value of a per-core control register before the mitigation touched it.
struct RegisterSnapshot {
	saved: AtomicBool,
	value: AtomicU64,
}

impl RegisterSnapshot {
	const fn new() -> Self {
		Self {
			saved: AtomicBool::new(false),
			value: AtomicU64::new(0),
		}
	}

	/// Remembers `value` unless an older snapshot exists.
	fn save(&self, value: u64) {
		if !self.saved.load(Ordering::Relaxed) {
			self.value.store(value, Ordering::Relaxed);
			self.saved.store(true, Ordering::Relaxed);
		}
	}

	fn take(&self) -> Option<u64> {
		self.saved
			.swap(false, Ordering::Relaxed)
			.then(|| self.value.load(Ordering::Relaxed))
	}
}

pub struct MitigationController<P> {
	platform: P,
	method: OnceCell<MitigationMethod>,
	config: OnceCell<Config>,
	/// Read on every context switch.
	enabled: AtomicBool,
	/// Indexed by core ID, only touched by the owning core.
	snapshots: [RegisterSnapshot; MAX_CORES],
	transitions: AtomicU64,
}

impl<P> MitigationController<P> {
	pub const fn new(platform: P) -> Self {
		Self {
			platform,
			method: OnceCell::new(),
			config: OnceCell::new(),
			enabled: AtomicBool::new(false),
			snapshots: [const { RegisterSnapshot::new() }; MAX_CORES],
			transitions: AtomicU64::new(0),
		}
	}

	pub fn platform(&self) -> &P {
		&self.platform
	}

	/// The method detected at boot, [`MitigationMethod::None`] before that.
	pub fn method(&self) -> MitigationMethod {
		self.method.get().copied().unwrap_or(MitigationMethod::None)
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::Acquire)
	}

	/// Names the active mitigation, or `(none)` if it is disabled.
	pub fn status(&self) -> &'static str {
		if self.is_enabled() {
			self.method().name()
		} else {
			STATUS_NONE
		}
	}

	/// Number of rendezvous that were started.
	pub fn transitions(&self) -> u64 {
		self.transitions.load(Ordering::Relaxed)
	}

	fn config(&self) -> Config {
		self.config.get().copied().unwrap_or_default()
	}
}

impl<P: Platform> MitigationController<P> {
	/// Detects the mitigation and applies it to the boot core.
	///
	/// Must run on the boot core before any other core is started.
	pub fn init_boot_core(&self, config: Config) {
		if self.method.get().is_some() {
			warn!("Spectre-V2 mitigation is already initialized");
			return;
		}

		let method = probe::detect(&self.platform.identity());
		let _ = self.method.set(method);
		let _ = self.config.set(config);

		let enabled = method != MitigationMethod::None && config.mode == BootMode::Auto;
		if enabled {
			// SAFETY: No other core is running yet.
			unsafe {
				self.patch(method, Variant::Enabled);
			}
			self.apply_local(method, true);
		}
		self.enabled.store(enabled, Ordering::Release);

		info!("Spectre-V2 mitigation: detected {method}, active {}", self.status());
	}

	/// Applies the current state of the mitigation to a core that has just
	/// come on-line.
	///
	/// Must run on `core` itself, while the caller holds the hot-plug lock.
	pub fn init_secondary_core(&self, core: CoreId) {
		debug_assert_eq!(core, self.platform.core_id());

		let Some(&method) = self.method.get() else {
			warn!("Core {core} started before the Spectre-V2 mitigation was initialized");
			return;
		};

		if self.is_enabled() {
			self.apply_local(method, true);
			debug!("Applied {method} to core {core}");
		}
	}

	/// Enables or disables the mitigation on all cores.
	///
	/// Requesting the current state succeeds without touching any core.
	pub fn set_enabled(&self, enabled: bool) -> Result<(), SpectreError> {
		let _guard = self.platform.lock();

		let method = self.method();
		if method == MitigationMethod::None {
			warn!("No Spectre-V2 mitigation available");
			return Err(SpectreError::Unsupported(UnsupportedReason::NoMitigation));
		}

		if self.enabled.load(Ordering::Acquire) == enabled {
			return Ok(());
		}

		if !self.platform.all_online() {
			warn!("Cannot change Spectre-V2 mitigation while some CPUs are offline");
			return Err(SpectreError::Unsupported(UnsupportedReason::CoresOffline));
		}

		let participants = self.platform.processor_count();
		let rendezvous = Rendezvous::new(
			participants,
			BOOT_CORE,
			self.config().rendezvous_warn_spins,
		);
		let variant = Variant::from(enabled);

		self.transitions.fetch_add(1, Ordering::Relaxed);
		debug!("Starting rendezvous of {participants} cores");
		self.platform.broadcast(&|| {
			rendezvous.run(
				&self.platform,
				|| {
					// SAFETY: All other cores are parked in the rendezvous.
					unsafe {
						self.patch(method, variant);
					}
				},
				|| self.apply_local(method, enabled),
			);
		});

		self.enabled.store(enabled, Ordering::Release);
		info!(
			"Spectre-V2 mitigation {}: {method}",
			if enabled { "enabled" } else { "disabled" }
		);

		Ok(())
	}

	/// Rewrites the kernel text that belongs to `method`.
	///
	/// # Safety
	///
	/// No other core may execute patchable text until the calling core and
	/// all other cores have serialized their instruction streams.
	unsafe fn patch(&self, method: MitigationMethod, variant: Variant) {
		if !method.needs_patch() {
			return;
		}

		let patcher = unsafe { CodePatcher::new(&self.platform) };
		for site in &IBRS_SITES {
			let count = patcher.apply(site, variant);
			debug!("Patched {count} instances of {:?} ({variant:?})", site.name);
		}
	}

	/// Updates the control registers of the calling core.
	fn apply_local(&self, method: MitigationMethod, enabled: bool) {
		let core = self.platform.core_id();
		let snapshot = usize::try_from(core)
			.ok()
			.and_then(|index| self.snapshots.get(index));

		match method {
			MitigationMethod::None => {}
			MitigationMethod::AmdDisableIndirect { register, bit } => {
				if enabled {
					let value = self.platform.read_register(register);
					if let Some(snapshot) = snapshot {
						snapshot.save(value);
					}
					self.platform.write_register(register, value | bit);
				} else {
					let value = snapshot
						.and_then(RegisterSnapshot::take)
						.unwrap_or_else(|| self.platform.read_register(register));
					self.platform.write_register(register, value & !bit);
				}
			}
			MitigationMethod::IntelIbrs => {
				// We are in the kernel, so IBRS has to match the entry sequence.
				let mut spec_ctrl =
					SpecCtrl::from_bits_retain(self.platform.read_register(IA32_SPEC_CTRL));
				spec_ctrl.set(SpecCtrl::IBRS, enabled);
				self.platform
					.write_register(IA32_SPEC_CTRL, spec_ctrl.bits());
			}
		}
	}

	pub fn print_information(&self) {
		infoheader!(" SPECTRE-V2 MITIGATION ");
		infoentry!("Detected method", self.method());
		infoentry!("Active", self.status());
		infoentry!("Transitions", self.transitions());
		infofooter!();
	}
}
