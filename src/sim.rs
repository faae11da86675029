//! Simulated multi-core machine for the unit tests.
//!
//! Every core is a host thread while it executes a broadcast. The machine
//! records whether kernel text was made writable or a control register was
//! written while another core could still run with interrupts enabled.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use crate::arch::{
	BOOT_CORE, ControlRegisterPort, CoreId, CpuIdSource, CpuLifecycle, InterruptControl,
	TextMemory,
};
use crate::spectre::hotpatch::{
	HotpatchName, HotpatchSite, IBRS_SITE_LEN, IBRS_SITES, PatchSite, Variant,
};
use crate::spectre::probe::{CPUID_SEF_IBRS, CpuIdentity, Vendor};

std::thread_local! {
	static CURRENT: Cell<CoreId> = const { Cell::new(BOOT_CORE) };
}

const TEXT_LEN: usize = 64;

/// Patch sites recorded in the simulated kernel image.
const TEXT_SITES: [(HotpatchName, usize); 3] = [
	(HotpatchName::IbrsEnter, 0),
	(HotpatchName::IbrsLeave, 24),
	(HotpatchName::IbrsEnter, 41),
];

#[repr(align(8))]
struct Text(UnsafeCell<[u8; TEXT_LEN]>);

// Only written through `CodePatcher`, which the tests serialize.
unsafe impl Sync for Text {}

struct SimCore {
	online: AtomicBool,
	irq: AtomicBool,
	registers: Mutex<BTreeMap<u32, u64>>,
	writes: AtomicUsize,
	syncs: AtomicUsize,
	delay_ms: AtomicU64,
}

impl SimCore {
	fn new(online: bool) -> Self {
		Self {
			online: AtomicBool::new(online),
			irq: AtomicBool::new(true),
			registers: Mutex::new(BTreeMap::new()),
			writes: AtomicUsize::new(0),
			syncs: AtomicUsize::new(0),
			delay_ms: AtomicU64::new(0),
		}
	}
}

pub struct SimMachine {
	identity: CpuIdentity,
	cores: Vec<SimCore>,
	text: Text,
	writable: AtomicBool,
	hotplug: Mutex<()>,
	in_broadcast: AtomicBool,
	broadcasts: AtomicUsize,
	probes: AtomicUsize,
	violations: AtomicUsize,
}

impl SimMachine {
	pub const INTEL: CpuIdentity = CpuIdentity {
		vendor: Vendor::Intel,
		family: 6,
		sef_edx: CPUID_SEF_IBRS,
		long_mode: true,
	};

	pub const AMD: CpuIdentity = CpuIdentity {
		vendor: Vendor::Amd,
		family: 0x10,
		sef_edx: 0,
		long_mode: true,
	};

	pub const UNKNOWN: CpuIdentity = CpuIdentity {
		vendor: Vendor::Other,
		family: 6,
		sef_edx: 0,
		long_mode: true,
	};

	/// Creates a machine with `cores` present cores, of which only the boot
	/// core is on-line.
	pub fn new(cores: u32, identity: CpuIdentity) -> Self {
		let mut text = [0xcc; TEXT_LEN];
		for (name, offset) in TEXT_SITES {
			let site = Self::patch_site(name);
			text[offset..offset + IBRS_SITE_LEN].copy_from_slice(site.bytes(Variant::Disabled));
		}

		Self {
			identity,
			cores: (0..cores).map(|core| SimCore::new(core == BOOT_CORE)).collect(),
			text: Text(UnsafeCell::new(text)),
			writable: AtomicBool::new(false),
			hotplug: Mutex::new(()),
			in_broadcast: AtomicBool::new(false),
			broadcasts: AtomicUsize::new(0),
			probes: AtomicUsize::new(0),
			violations: AtomicUsize::new(0),
		}
	}

	fn patch_site(name: HotpatchName) -> &'static PatchSite {
		IBRS_SITES
			.iter()
			.find(|site| site.name == name)
			.unwrap()
	}

	fn core(&self, core: CoreId) -> &SimCore {
		&self.cores[core as usize]
	}

	fn current(&self) -> &SimCore {
		self.core(CURRENT.with(Cell::get))
	}

	fn violation(&self, what: &str) {
		std::eprintln!("violation on core {}: {what}", CURRENT.with(Cell::get));
		self.violations.fetch_add(1, Ordering::SeqCst);
	}

	/// Everybody who may execute kernel text must have interrupts disabled.
	fn check_quiescent(&self, what: &str) {
		if self.current().irq.load(Ordering::SeqCst) {
			self.violation(what);
		}
		if self.in_broadcast.load(Ordering::SeqCst)
			&& self
				.cores
				.iter()
				.any(|core| core.online.load(Ordering::SeqCst) && core.irq.load(Ordering::SeqCst))
		{
			self.violation(what);
		}
	}

	/// Brings `core` on-line and runs `hatch` on it, excluding any concurrent
	/// rendezvous.
	pub fn bring_online(&self, core: CoreId, hatch: impl FnOnce()) {
		let _guard = self.lock();
		let previous = CURRENT.with(|current| current.replace(core));
		hatch();
		CURRENT.with(|current| current.set(previous));
		self.core(core).online.store(true, Ordering::SeqCst);
	}

	pub fn take_offline(&self, core: CoreId) {
		let _guard = self.lock();
		self.core(core).online.store(false, Ordering::SeqCst);
	}

	pub fn set_register(&self, core: CoreId, register: u32, value: u64) {
		self.core(core)
			.registers
			.lock()
			.unwrap()
			.insert(register, value);
	}

	pub fn register(&self, core: CoreId, register: u32) -> u64 {
		self.core(core)
			.registers
			.lock()
			.unwrap()
			.get(&register)
			.copied()
			.unwrap_or(0)
	}

	pub fn writes(&self, core: CoreId) -> usize {
		self.core(core).writes.load(Ordering::SeqCst)
	}

	pub fn total_writes(&self) -> usize {
		self.cores
			.iter()
			.map(|core| core.writes.load(Ordering::SeqCst))
			.sum()
	}

	pub fn syncs(&self, core: CoreId) -> usize {
		self.core(core).syncs.load(Ordering::SeqCst)
	}

	/// Lets `core` join every following broadcast `ms` milliseconds late.
	pub fn delay(&self, core: CoreId, ms: u64) {
		self.core(core).delay_ms.store(ms, Ordering::SeqCst);
	}

	pub fn set_interrupts(&self, core: CoreId, enabled: bool) {
		self.core(core).irq.store(enabled, Ordering::SeqCst);
	}

	pub fn interrupts_enabled(&self, core: CoreId) -> bool {
		self.core(core).irq.load(Ordering::SeqCst)
	}

	/// Returns `true` if every recorded site holds `variant`.
	pub fn text_matches(&self, variant: Variant) -> bool {
		let text = unsafe { &*self.text.0.get() };
		TEXT_SITES.iter().all(|&(name, offset)| {
			text[offset..offset + IBRS_SITE_LEN] == *Self::patch_site(name).bytes(variant)
		})
	}

	pub fn text_protected(&self) -> bool {
		!self.writable.load(Ordering::SeqCst)
	}

	pub fn violations(&self) -> usize {
		self.violations.load(Ordering::SeqCst)
	}

	pub fn broadcasts(&self) -> usize {
		self.broadcasts.load(Ordering::SeqCst)
	}

	pub fn probes(&self) -> usize {
		self.probes.load(Ordering::SeqCst)
	}
}

impl ControlRegisterPort for SimMachine {
	fn read_register(&self, register: u32) -> u64 {
		self.register(CURRENT.with(Cell::get), register)
	}

	fn write_register(&self, register: u32, value: u64) {
		if self.in_broadcast.load(Ordering::SeqCst) {
			self.check_quiescent("register write");
		}
		let core = CURRENT.with(Cell::get);
		self.set_register(core, register, value);
		self.core(core).writes.fetch_add(1, Ordering::SeqCst);
	}
}

impl InterruptControl for SimMachine {
	fn nested_disable(&self) -> bool {
		self.current().irq.swap(false, Ordering::SeqCst)
	}

	fn nested_enable(&self, was_enabled: bool) {
		if was_enabled {
			self.current().irq.store(true, Ordering::SeqCst);
		}
	}
}

impl TextMemory for SimMachine {
	type Protection = bool;

	fn sites(&self) -> impl Iterator<Item = HotpatchSite> {
		let base = self.text.0.get().cast::<u8>();
		TEXT_SITES.into_iter().filter_map(move |(name, offset)| {
			Some(HotpatchSite {
				name,
				addr: NonNull::new(base.wrapping_add(offset))?,
				len: IBRS_SITE_LEN,
			})
		})
	}

	fn unprotect(&self) -> bool {
		self.check_quiescent("unprotected text");
		self.writable.swap(true, Ordering::SeqCst)
	}

	fn protect(&self, saved: bool) {
		self.writable.store(saved, Ordering::SeqCst);
	}

	fn sync_core(&self) {
		self.current().syncs.fetch_add(1, Ordering::SeqCst);
	}
}

impl CpuIdSource for SimMachine {
	fn identity(&self) -> CpuIdentity {
		self.probes.fetch_add(1, Ordering::SeqCst);
		self.identity
	}
}

impl CpuLifecycle for SimMachine {
	type Guard<'a> = MutexGuard<'a, ()>;

	fn core_id(&self) -> CoreId {
		CURRENT.with(Cell::get)
	}

	fn lock(&self) -> MutexGuard<'_, ()> {
		self.hotplug.lock().unwrap()
	}

	fn processor_count(&self) -> u32 {
		self.cores
			.iter()
			.filter(|core| core.online.load(Ordering::SeqCst))
			.count() as u32
	}

	fn all_online(&self) -> bool {
		self.cores
			.iter()
			.all(|core| core.online.load(Ordering::SeqCst))
	}

	fn broadcast(&self, func: &(dyn Fn() + Sync)) {
		self.broadcasts.fetch_add(1, Ordering::SeqCst);
		self.in_broadcast.store(true, Ordering::SeqCst);

		thread::scope(|s| {
			for (id, core) in (0..).zip(&self.cores) {
				if !core.online.load(Ordering::SeqCst) {
					continue;
				}
				let delay = core.delay_ms.load(Ordering::SeqCst);
				s.spawn(move || {
					CURRENT.with(|current| current.set(id));
					if delay > 0 {
						thread::sleep(Duration::from_millis(delay));
					}
					func();
				});
			}
		});

		self.in_broadcast.store(false, Ordering::SeqCst);
	}
}
