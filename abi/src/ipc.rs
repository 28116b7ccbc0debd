//! SysV IPC ABI constants (shared-memory subset).

pub const IPC_PRIVATE: i32 = 0;

pub const IPC_CREAT: u32 = 0o1000;
pub const IPC_EXCL: u32 = 0o2000;

pub const IPC_RMID: u32 = 0;
pub const IPC_SET: u32 = 1;
pub const IPC_STAT: u32 = 2;

/// User-visible segment description for shmctl(IPC_STAT).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct ShmidDs {
    pub shm_perm_uid: u32,
    pub shm_perm_gid: u32,
    pub shm_perm_mode: u32,
    pub shm_segsz: u64,
    pub shm_nattch: u64,
    pub shm_cpid: u32,
    pub shm_lpid: u32,
}
