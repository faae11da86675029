//! Spectre-V2 mitigation control for the Hermit kernel.
//!
//! The crate detects which mitigation the boot processor supports, applies it
//! to every core as the core comes on-line, and lets an operator toggle it at
//! runtime through [`sysctl::SpectreNode`]. Toggling rewrites kernel text and
//! per-core control registers while all cores are held in a rendezvous.
//!
//! A kernel wires it up roughly like this:
//!
//! ```ignore
//! static SPECTRE: MitigationController<Machine<Smp>> =
//! 	MitigationController::new(Machine::new(Smp));
//!
//! // boot core
//! SPECTRE.init_boot_core(Config::from_cmdline(cmdline));
//! SPECTRE.print_information();
//!
//! // every application processor, with the hot-plug lock held
//! SPECTRE.init_secondary_core(core_id);
//!
//! // scheduler, on every context switch
//! SPECTRE.speculation_barrier(&prev.domain, &next.domain);
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
mod logging;

pub mod arch;
pub mod config;
pub mod env;
pub mod errno;
#[cfg(test)]
mod sim;
pub mod spectre;
pub mod sysctl;

pub use crate::env::{BootMode, Config};
pub use crate::errno::{Errno, ToErrno};
pub use crate::spectre::{
	MitigationController, MitigationMethod, SpectreError, SwitchContext, TrustDomain,
	UnsupportedReason,
};
pub use crate::sysctl::SpectreNode;
