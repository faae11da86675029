/// Number of cores for which per-core mitigation state is kept.
///
/// Cores with a higher ID are still patched and synchronized, but their
/// control register is not snapshotted.
pub(crate) const MAX_CORES: usize = 256;

/// Default number of spins after which a core waiting at a rendezvous
/// phase reports the stall once.
pub const DEFAULT_RENDEZVOUS_WARN_SPINS: u64 = 0x1000_0000;

/// Status shown while no mitigation is active.
pub const STATUS_NONE: &str = "(none)";
