//! The saved user register frame.
//!
//! Arch trap glue builds one of these on kernel entry and consumes it on
//! the way back to user mode. The syscall dispatcher and the signal
//! delivery path edit it in place: redirecting `rip`/`userrsp` is how a
//! signal handler is entered, and restoring the saved copy is what
//! sigreturn does.

/// User-mode code selector (ring 3).
pub const USER_CS: u64 = 0x1B;
/// User-mode data/stack selector (ring 3).
pub const USER_SS: u64 = 0x23;
/// The interrupt-enable bit in RFLAGS.
pub const RFLAGS_IF: u64 = 0x200;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub userrsp: u64,
    pub cs: u64,
    pub ss: u64,
}

impl Regs {
    pub const fn zero() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: RFLAGS_IF,
            userrsp: 0,
            cs: USER_CS,
            ss: USER_SS,
        }
    }

    /// Syscall arguments follow the SysV convention:
    /// rdi, rsi, rdx, r10, r8, r9.
    #[inline]
    pub fn arg(&self, i: usize) -> u64 {
        match i {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            _ => self.r9,
        }
    }

    #[inline]
    pub fn set_result(&mut self, value: i64) {
        self.rax = value as u64;
    }

    #[inline]
    pub fn result(&self) -> i64 {
        self.rax as i64
    }
}
