//! The kernel binary: bring the substrate up in dependency order, then
//! idle.
//!
//! Boot protocol, trap tables and device discovery belong to the boot and
//! driver collaborators; what lives here is the order the core subsystems
//! come up in: block devices, the root filesystem, the service hooks, and
//! finally tasking. On a hosted build the same sequence runs as a smoke
//! test and exits.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use cinder_abi::fs::to_devid;
use cinder_fs::blockdev::{RAMDISK_MAJOR, ramdisk_create, ramdisk_init};
use cinder_fs::memfs::{memfs_format, memfs_init};
use cinder_fs::mount::vfs_mount_root;
use cinder_lib::klog_info;

const ROOT_MINOR: u32 = 0;
const ROOT_BLOCKS: u64 = 8192;
const ROOT_BLOCK_SIZE: usize = 512;
const ROOT_INODES: u32 = 512;

fn kernel_init() {
    let root_dev = to_devid(RAMDISK_MAJOR, ROOT_MINOR);

    ramdisk_init();
    memfs_init();

    if ramdisk_create(ROOT_MINOR, ROOT_BLOCKS, ROOT_BLOCK_SIZE).is_err() {
        panic!("boot: cannot create the root ramdisk");
    }
    if memfs_format(root_dev, ROOT_BLOCKS as u32, ROOT_INODES, ROOT_BLOCK_SIZE).is_err() {
        panic!("boot: cannot format the root filesystem");
    }
    if vfs_mount_root(root_dev, b"memfs").is_err() {
        panic!("boot: cannot mount the root filesystem");
    }

    if cinder_core::tasking_init().is_err() {
        panic!("boot: cannot start tasking");
    }

    klog_info!("boot: core substrate up");
}

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    #[unsafe(no_mangle)]
    pub extern "C" fn kernel_main() -> ! {
        super::kernel_init();
        let mut last_sweep = 0u64;
        loop {
            // Housekeeping between schedules: flush dirty state and age
            // the page cache out every few seconds of ticks.
            let now = cinder_lib::clock::ticks();
            if now.saturating_sub(last_sweep) >= cinder_lib::clock::ONE_MINUTE {
                cinder_fs::mount::vfs_update(0);
                last_sweep = now;
            }
            cinder_core::schedule();
            cinder_lib::cpu::relax();
        }
    }

    #[panic_handler]
    fn panic(_info: &PanicInfo) -> ! {
        loop {
            cinder_lib::cpu::relax();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    fn stdout_backend(args: core::fmt::Arguments<'_>) {
        println!("{}", args);
    }
    cinder_lib::klog::klog_register_backend(stdout_backend);

    kernel_init();
    cinder_fs::mount::vfs_update(0);
    println!("cinder: init complete, exiting hosted smoke run");
}
