//! Operator interface of the mitigation.
//!
//! The node exposes two values: `mitigated`, which can be read and written,
//! and `method`, which is read-only and names the active mitigation.

use crate::arch::Platform;
use crate::errno::Errno;
use crate::spectre::MitigationController;

/// Name under which the node is registered.
pub const NODE_NAME: &str = "machdep.spectre_v2";

pub struct SpectreNode<'a, P> {
	controller: &'a MitigationController<P>,
}

impl<'a, P: Platform> SpectreNode<'a, P> {
	pub const fn new(controller: &'a MitigationController<P>) -> Self {
		Self { controller }
	}

	/// Returns `true` while the mitigation is active.
	pub fn read_mitigated(&self) -> bool {
		self.controller.is_enabled()
	}

	/// Enables or disables the mitigation.
	///
	/// Accepts `0`, `1`, `false` and `true`, optionally surrounded by
	/// whitespace.
	pub fn write_mitigated(&self, value: &str) -> Result<(), Errno> {
		let enabled = match value.trim() {
			"1" | "true" => true,
			"0" | "false" => false,
			value => {
				debug!("Invalid value for {NODE_NAME}.mitigated: {value:?}");
				return Err(Errno::Inval);
			}
		};

		self.controller.set_enabled(enabled)?;
		Ok(())
	}

	/// Names the active mitigation, or `(none)`.
	pub fn read_method(&self) -> &'static str {
		self.controller.status()
	}
}
