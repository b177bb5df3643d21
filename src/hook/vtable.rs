/*!
 * Virtual-dispatch-table patching
 *
 * Swaps one entry of an object's dispatch table for a trampoline after
 * flipping the page protection of the entry's page. The mechanics are
 * platform-neutral; only the page-protection calls differ, so the patch
 * path is unit-testable against a synthetic table.
 */

use std::ffi::c_void;
use std::io;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from installing or removing an intercept.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("page protection change failed: {0}")]
    Protect(#[source] io::Error),
    #[error("dispatch entry no longer holds our trampoline, restore skipped")]
    Tampered,
    #[error("graphics runtime not loaded in this process")]
    RuntimeNotFound,
    #[error("no presentable surface available")]
    NoSurface,
    #[error("intercept already installed")]
    AlreadyInstalled,
}

/// One dispatch-table entry to patch.
#[derive(Debug, Clone, Copy)]
pub struct InterceptTarget {
    /// Base of the dispatch table.
    pub table: *mut *const c_void,
    /// Entry index within the table.
    pub index: usize,
    /// Trampoline to install.
    pub replacement: *const c_void,
}

/// Installed intercept. Owns the patch: dropping the handle restores the
/// original entry if the table still holds our trampoline.
pub struct InterceptHandle {
    entry: *mut *const c_void,
    original: *const c_void,
    replacement: *const c_void,
    armed: bool,
}

unsafe impl Send for InterceptHandle {}

impl InterceptHandle {
    pub fn original(&self) -> *const c_void {
        self.original
    }

    fn restore(&mut self) -> Result<(), HookError> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        unsafe {
            if std::ptr::read_volatile(self.entry) != self.replacement {
                return Err(HookError::Tampered);
            }
            make_entry_writable(self.entry).map_err(HookError::Protect)?;
            std::ptr::write_volatile(self.entry, self.original);
        }
        debug!(entry = ?self.entry, "dispatch entry restored");
        Ok(())
    }
}

impl Drop for InterceptHandle {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.restore() {
                warn!(%err, "intercept not restored on drop");
            }
        }
    }
}

/// Capability seam for entry-point interception.
pub trait Interceptor: Send + Sync {
    fn install(&self, target: InterceptTarget) -> Result<InterceptHandle, HookError>;
    fn uninstall(&self, handle: InterceptHandle) -> Result<(), HookError>;
}

/// Production interceptor: in-place dispatch-table entry swap.
#[derive(Default)]
pub struct VTableInterceptor;

impl VTableInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for VTableInterceptor {
    fn install(&self, target: InterceptTarget) -> Result<InterceptHandle, HookError> {
        let entry = unsafe { target.table.add(target.index) };
        let original = unsafe {
            make_entry_writable(entry).map_err(HookError::Protect)?;
            let original = std::ptr::read_volatile(entry);
            if original == target.replacement {
                return Err(HookError::AlreadyInstalled);
            }
            std::ptr::write_volatile(entry, target.replacement);
            original
        };
        debug!(entry = ?entry, index = target.index, "dispatch entry patched");
        Ok(InterceptHandle {
            entry,
            original,
            replacement: target.replacement,
            armed: true,
        })
    }

    fn uninstall(&self, mut handle: InterceptHandle) -> Result<(), HookError> {
        handle.restore()
    }
}

/// Make the page holding `entry` writable. On Windows the prior
/// protection is restored by the next flip; POSIX has no protection
/// query, so the page is left readable and writable.
#[cfg(unix)]
unsafe fn make_entry_writable(entry: *mut *const c_void) -> io::Result<()> {
    let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let addr = entry as usize & !(page_size - 1);
    let rc = libc::mprotect(
        addr as *mut c_void,
        page_size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn make_entry_writable(entry: *mut *const c_void) -> io::Result<()> {
    use windows::Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    };
    let mut old = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(
        entry as *const c_void,
        std::mem::size_of::<*const c_void>(),
        PAGE_EXECUTE_READWRITE,
        &mut old,
    )
    .map_err(|e| io::Error::from_raw_os_error(e.code().0))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Synthetic dispatch table in its own mapping, so protection flips
    /// touch nothing else.
    struct FakeTable {
        base: *mut *const c_void,
        page: usize,
    }

    impl FakeTable {
        fn new(entries: &[*const c_void]) -> Self {
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    page,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            } as *mut *const c_void;
            assert!(!base.is_null());
            for (i, entry) in entries.iter().enumerate() {
                unsafe { base.add(i).write(*entry) };
            }
            Self { base, page }
        }

        fn entry(&self, index: usize) -> *const c_void {
            unsafe { std::ptr::read_volatile(self.base.add(index)) }
        }
    }

    impl Drop for FakeTable {
        fn drop(&mut self) {
            unsafe { libc::munmap(self.base as *mut c_void, self.page) };
        }
    }

    fn addr(value: usize) -> *const c_void {
        value as *const c_void
    }

    #[test]
    fn install_swaps_entry_and_remembers_original() {
        let table = FakeTable::new(&[addr(0x100), addr(0x200), addr(0x300)]);
        let interceptor = VTableInterceptor::new();
        let handle = interceptor
            .install(InterceptTarget {
                table: table.base,
                index: 1,
                replacement: addr(0xDEAD),
            })
            .unwrap();

        assert_eq!(table.entry(1), addr(0xDEAD));
        assert_eq!(table.entry(0), addr(0x100)); // neighbours untouched
        assert_eq!(table.entry(2), addr(0x300));
        assert_eq!(handle.original(), addr(0x200));

        interceptor.uninstall(handle).unwrap();
        assert_eq!(table.entry(1), addr(0x200));
    }

    #[test]
    fn dropping_the_handle_restores_the_entry() {
        let table = FakeTable::new(&[addr(0x100)]);
        let interceptor = VTableInterceptor::new();
        {
            let _handle = interceptor
                .install(InterceptTarget {
                    table: table.base,
                    index: 0,
                    replacement: addr(0xBEEF),
                })
                .unwrap();
            assert_eq!(table.entry(0), addr(0xBEEF));
        }
        assert_eq!(table.entry(0), addr(0x100));
    }

    #[test]
    fn tampered_entry_is_left_alone() {
        let table = FakeTable::new(&[addr(0x100)]);
        let interceptor = VTableInterceptor::new();
        let handle = interceptor
            .install(InterceptTarget {
                table: table.base,
                index: 0,
                replacement: addr(0xBEEF),
            })
            .unwrap();

        // Someone else re-patched after us.
        unsafe { table.base.write(addr(0xF00D)) };
        assert!(matches!(
            interceptor.uninstall(handle),
            Err(HookError::Tampered)
        ));
        assert_eq!(table.entry(0), addr(0xF00D));
    }

    #[test]
    fn double_install_of_same_trampoline_is_rejected() {
        let table = FakeTable::new(&[addr(0x100)]);
        let interceptor = VTableInterceptor::new();
        let target = InterceptTarget {
            table: table.base,
            index: 0,
            replacement: addr(0xBEEF),
        };
        let _handle = interceptor.install(target).unwrap();
        assert!(matches!(
            interceptor.install(target),
            Err(HookError::AlreadyInstalled)
        ));
    }
}
