//! Model-specific registers that control indirect branch prediction.

use bitflags::bitflags;

/// Speculation control (Intel SDM Vol. 4, Table 2-2).
pub const IA32_SPEC_CTRL: u32 = 0x48;

/// Prediction command, write-only.
pub const IA32_PRED_CMD: u32 = 0x49;

/// Instruction cache configuration of AMD families 10h, 12h and 16h
/// (BKDG for Family 10h, MSRC001_1021).
pub const MSR_IC_CFG: u32 = 0xc001_1021;

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct SpecCtrl: u64 {
		/// Indirect Branch Restricted Speculation
		const IBRS = 1 << 0;
		/// Single Thread Indirect Branch Predictors
		const STIBP = 1 << 1;
		/// Speculative Store Bypass Disable
		const SSBD = 1 << 2;

		const _ = !0;
	}
}

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct PredCmd: u64 {
		/// Indirect Branch Prediction Barrier
		const IBPB = 1 << 0;
	}
}

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct IcCfg: u64 {
		/// Disables the indirect branch predictor.
		const DIS_IND = 1 << 14;

		const _ = !0;
	}
}
