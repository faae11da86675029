//! Central parsing of the command-line parameters that concern the
//! Spectre-V2 mitigation.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::DEFAULT_RENDEZVOUS_WARN_SPINS;

/// What to do with the detected mitigation at boot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BootMode {
	/// Enable the mitigation if the processor supports one.
	#[default]
	Auto,
	/// Detect the mitigation, but leave it disabled until an operator
	/// enables it.
	Off,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
	pub mode: BootMode,
	/// Spins after which a core stuck at a rendezvous phase logs a warning.
	/// Zero disables the warning.
	pub rendezvous_warn_spins: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			mode: BootMode::Auto,
			rendezvous_warn_spins: DEFAULT_RENDEZVOUS_WARN_SPINS,
		}
	}
}

impl Config {
	/// Parses the kernel command line.
	///
	/// Options that do not belong to this subsystem are skipped, so the
	/// complete command line may be passed in. Everything after `--` belongs
	/// to the application and is ignored.
	pub fn from_cmdline(cmdline: &str) -> Self {
		let mut config = Self::default();

		// Split at spaces, but not while in quotes
		let tokens: Vec<String> = match shell_words::split(cmdline) {
			Ok(tokens) => tokens,
			Err(err) => {
				warn!("Unable to parse cmdline [{cmdline}]: {err}");
				return config;
			}
		};
		debug!("Got cmdline tokens as {tokens:?}");

		let mut tokeniter = tokens.iter().map(String::as_str);
		while let Some(token) = tokeniter.next() {
			match token {
				"-spectre-v2" => match tokeniter.next() {
					Some("auto" | "on") => config.mode = BootMode::Auto,
					Some("off") => config.mode = BootMode::Off,
					value => warn!("Invalid -spectre-v2 command line: {value:?}"),
				},
				"-rendezvous-warn" => match tokeniter.next().map(str::parse::<u64>) {
					Some(Ok(spins)) => config.rendezvous_warn_spins = spins,
					_ => warn!("Invalid -rendezvous-warn command line"),
				},
				"--" => break,
				_ => {}
			}
		}

		config
	}
}
