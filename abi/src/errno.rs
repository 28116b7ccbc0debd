//! POSIX errno values and the kernel-internal result type.
//!
//! Internal boundaries carry errors as `Result<T, Errno>`; the syscall
//! dispatcher converts an `Err` to the negative errno user space expects.
//! `ERESTARTSYS` is kernel-private: it never escapes to user space and is
//! rewritten to either a syscall restart or `EINTR` on the signal path.

/// Kernel-internal result type used across subsystem boundaries.
pub type KResult<T> = Result<T, Errno>;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    ERANGE = 34,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
    EIDRM = 43,
    ENOBUFS = 105,
    ENOTSUP = 95,
    ESTALE = 116,
    EDQUOT = 122,
    /// Interruptible sleep woken by a signal; the syscall may be restarted
    /// transparently if the action carries `SA_RESTART`.
    ERESTARTSYS = 512,
}

/// `EWOULDBLOCK` aliases `EAGAIN` on every platform we care about.
pub const EWOULDBLOCK: Errno = Errno::EAGAIN;

impl Errno {
    /// The negative value returned through the syscall boundary.
    #[inline]
    pub const fn as_neg(self) -> i64 {
        -(self as i64)
    }

    /// Recover an `Errno` from a negative syscall-style return value.
    pub fn from_neg(value: i64) -> Option<Self> {
        match -value {
            1 => Some(Self::EPERM),
            2 => Some(Self::ENOENT),
            3 => Some(Self::ESRCH),
            4 => Some(Self::EINTR),
            5 => Some(Self::EIO),
            9 => Some(Self::EBADF),
            10 => Some(Self::ECHILD),
            11 => Some(Self::EAGAIN),
            12 => Some(Self::ENOMEM),
            13 => Some(Self::EACCES),
            14 => Some(Self::EFAULT),
            16 => Some(Self::EBUSY),
            17 => Some(Self::EEXIST),
            18 => Some(Self::EXDEV),
            19 => Some(Self::ENODEV),
            20 => Some(Self::ENOTDIR),
            21 => Some(Self::EISDIR),
            22 => Some(Self::EINVAL),
            23 => Some(Self::ENFILE),
            24 => Some(Self::EMFILE),
            27 => Some(Self::EFBIG),
            28 => Some(Self::ENOSPC),
            29 => Some(Self::ESPIPE),
            30 => Some(Self::EROFS),
            31 => Some(Self::EMLINK),
            32 => Some(Self::EPIPE),
            36 => Some(Self::ENAMETOOLONG),
            38 => Some(Self::ENOSYS),
            39 => Some(Self::ENOTEMPTY),
            40 => Some(Self::ELOOP),
            43 => Some(Self::EIDRM),
            116 => Some(Self::ESTALE),
            512 => Some(Self::ERESTARTSYS),
            _ => None,
        }
    }
}

/// Convert a `KResult<usize>`-style outcome into a signed syscall return.
#[inline]
pub fn kresult_to_ret(res: KResult<usize>) -> i64 {
    match res {
        Ok(v) => v as i64,
        Err(e) => e.as_neg(),
    }
}
