//! System error numbers.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The error type of the operator surface.
///
/// The values of these error numbers are the same as in Linux.
/// See [`asm-generic/errno-base.h`] and [`asm-generic/errno.h`] for details.
///
/// [`asm-generic/errno-base.h`]: https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/include/uapi/asm-generic/errno-base.h?h=v6.15
/// [`asm-generic/errno.h`]: https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/include/uapi/asm-generic/errno.h?h=v6.15
#[derive(Error, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(i32)]
pub enum Errno {
	/// Device or resource busy
	#[doc(alias = "EBUSY")]
	#[error("Device or resource busy")]
	Busy = 16,

	/// Invalid argument
	#[doc(alias = "EINVAL")]
	#[error("Invalid argument")]
	Inval = 22,

	/// Operation not supported on transport endpoint
	#[doc(alias = "EOPNOTSUPP")]
	#[error("Operation not supported on transport endpoint")]
	Opnotsupp = 95,
}

/// Returns `-errno` for system calls.
pub trait ToErrno {
	fn to_errno(&self) -> i32;
}

impl ToErrno for Errno {
	fn to_errno(&self) -> i32 {
		-i32::from(*self)
	}
}
