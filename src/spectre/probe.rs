//! Detection of the Spectre-V2 mitigation supported by the processor.

use core::fmt;

use crate::spectre::msr::{IcCfg, MSR_IC_CFG};

/// CPUID.(EAX=7,ECX=0):EDX\[26\], IBRS and IBPB are supported.
pub const CPUID_SEF_IBRS: u32 = 1 << 26;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Vendor {
	Intel,
	Amd,
	Other,
}

impl Vendor {
	/// Classifies the 12-byte vendor string returned by CPUID leaf 0.
	pub fn from_vendor_string(vendor: &str) -> Self {
		match vendor {
			"GenuineIntel" => Self::Intel,
			"AuthenticAMD" => Self::Amd,
			_ => Self::Other,
		}
	}
}

/// The parts of the CPUID information the probe looks at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CpuIdentity {
	pub vendor: Vendor,
	/// Display family, i.e. base family plus extended family.
	pub family: u8,
	/// EDX of CPUID leaf 7, subleaf 0, or zero if the leaf does not exist.
	pub sef_edx: u32,
	/// The core supports 64-bit long mode.
	pub long_mode: bool,
}

impl CpuIdentity {
	pub const fn has_ibrs(&self) -> bool {
		self.sef_edx & CPUID_SEF_IBRS != 0
	}
}

/// The Spectre-V2 mitigation selected for this machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MitigationMethod {
	None,
	/// Disables the indirect branch predictor through a per-core control
	/// register. No code is patched.
	AmdDisableIndirect { register: u32, bit: u64 },
	/// Restricts indirect branch speculation in the kernel. The kernel
	/// entry and exit sequences are hot-patched to toggle `IA32_SPEC_CTRL.IBRS`.
	IntelIbrs,
}

impl MitigationMethod {
	pub const fn needs_patch(&self) -> bool {
		matches!(self, Self::IntelIbrs)
	}

	pub const fn name(&self) -> &'static str {
		match self {
			Self::None => "(none)",
			Self::AmdDisableIndirect { .. } => "[AMD] DIS_IND",
			Self::IntelIbrs => "[Intel] IBRS",
		}
	}
}

impl fmt::Display for MitigationMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Decides which mitigation, if any, the processor supports.
///
/// Unknown hardware simply yields [`MitigationMethod::None`].
pub fn detect(identity: &CpuIdentity) -> MitigationMethod {
	match identity.vendor {
		// IBRS is only driven from the 64-bit entry path.
		Vendor::Intel if identity.has_ibrs() && identity.long_mode => MitigationMethod::IntelIbrs,
		// The Family 10h BKDG documents IC_CFG.DIS_IND. Families 12h and 16h
		// are believed to have the same bit although their guides omit it.
		Vendor::Amd if matches!(identity.family, 0x10 | 0x12 | 0x16) => {
			MitigationMethod::AmdDisableIndirect {
				register: MSR_IC_CFG,
				bit: IcCfg::DIS_IND.bits(),
			}
		}
		_ => MitigationMethod::None,
	}
}
