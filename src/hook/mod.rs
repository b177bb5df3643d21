/*!
 * Presentation interception
 *
 * `PresentHook` patches the present entry point of a live presentation
 * surface so every presented frame passes through a registered callback
 * before returning to the application. The dispatch-table mechanics live
 * in [`vtable`]; the platform surface discovery and trampoline live in
 * [`swapchain`] and exist only on Windows.
 */

pub mod vtable;

#[cfg(windows)]
pub mod swapchain;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::diagnostics::{Diagnostics, ErrorCategory};
use crate::extract::SurfaceHandle;

pub use vtable::{HookError, InterceptHandle, InterceptTarget, Interceptor, VTableInterceptor};

pub type PresentCallback = Box<dyn Fn(&SurfaceHandle) + Send + Sync>;

/// Hook on a surface's present entry point.
///
/// Single callback slot; re-registering replaces the previous callback.
/// Callback panics are contained at the trampoline boundary and never
/// propagate into the patched call path.
pub struct PresentHook {
    interceptor: Box<dyn Interceptor>,
    handle: Mutex<Option<InterceptHandle>>,
    callback: Mutex<Option<PresentCallback>>,
    diag: Arc<Diagnostics>,
}

impl PresentHook {
    pub fn new(interceptor: Box<dyn Interceptor>, diag: Arc<Diagnostics>) -> Self {
        Self {
            interceptor,
            handle: Mutex::new(None),
            callback: Mutex::new(None),
            diag,
        }
    }

    /// Locate the graphics runtime and patch a live surface's present
    /// entry. `Ok(false)` means no runtime or no surface yet; call
    /// [`notify_surface_created`] once one exists.
    ///
    /// [`notify_surface_created`]: Self::notify_surface_created
    #[cfg(windows)]
    pub fn initialize(self: &Arc<Self>) -> Result<bool, HookError> {
        if self.is_installed() {
            return Ok(true);
        }
        let Some(runtime) = crate::modules::find_graphics_runtime() else {
            self.diag.errors.warning(
                ErrorCategory::Hook,
                "PresentHook",
                "no graphics runtime loaded yet, interception deferred",
            );
            return Ok(false);
        };
        self.diag.errors.info(
            ErrorCategory::Hook,
            "PresentHook",
            format!("graphics runtime {} located", runtime.module),
        );

        let probe = match swapchain::create_probe_swap_chain() {
            Ok(probe) => probe,
            Err(HookError::NoSurface) => {
                self.diag.errors.warning(
                    ErrorCategory::Hook,
                    "PresentHook",
                    "no presentable surface available, interception deferred",
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        let handle = swapchain::install_on_swap_chain(self, probe.swap_chain_ptr())?;
        *self.handle.lock().unwrap() = Some(handle);
        self.diag.errors.info(
            ErrorCategory::Hook,
            "PresentHook",
            "present entry point patched",
        );
        Ok(true)
    }

    /// Presentation interception requires a patchable present entry
    /// point, which only the Windows swap-chain path provides.
    #[cfg(not(windows))]
    pub fn initialize(self: &Arc<Self>) -> Result<bool, HookError> {
        self.diag.errors.warning(
            ErrorCategory::Hook,
            "PresentHook",
            "presentation interception is not available on this platform",
        );
        Ok(false)
    }

    /// Retry installation against a surface the application just
    /// created. Returns `Ok(true)` once a patch is live.
    #[cfg(windows)]
    pub fn notify_surface_created(self: &Arc<Self>, surface: SurfaceHandle) -> Result<bool, HookError> {
        if self.is_installed() {
            return Ok(true);
        }
        let handle = swapchain::install_on_swap_chain(self, surface.0)?;
        *self.handle.lock().unwrap() = Some(handle);
        self.diag.errors.info(
            ErrorCategory::Hook,
            "PresentHook",
            "present entry point patched on newly created surface",
        );
        Ok(true)
    }

    #[cfg(not(windows))]
    pub fn notify_surface_created(self: &Arc<Self>, _surface: SurfaceHandle) -> Result<bool, HookError> {
        Ok(false)
    }

    /// Single slot; re-registering replaces the previous callback.
    pub fn register_present_callback(&self, callback: PresentCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn is_installed(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    /// Run the registered callback for a presented surface. Panics are
    /// logged and suppressed; the patched call path must always return.
    pub(crate) fn invoke_present_callback(&self, surface: &SurfaceHandle) {
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| callback(surface))).is_err() {
                self.diag.errors.critical(
                    ErrorCategory::Hook,
                    "PresentHook",
                    "present callback panicked, suppressed at the hook boundary",
                );
            }
        }
    }

    /// Restore the original entry point if still in place and drop the
    /// callback.
    pub fn shutdown(&self) {
        let restored = if let Some(handle) = self.handle.lock().unwrap().take() {
            match self.interceptor.uninstall(handle) {
                Ok(()) => {
                    self.diag.errors.info(
                        ErrorCategory::Hook,
                        "PresentHook",
                        "present entry point restored",
                    );
                    true
                }
                Err(err) => {
                    self.diag.errors.warning(
                        ErrorCategory::Hook,
                        "PresentHook",
                        format!("present entry point not restored: {err}"),
                    );
                    false
                }
            }
        } else {
            true
        };
        *self.callback.lock().unwrap() = None;
        #[cfg(windows)]
        swapchain::clear_active_hook(restored);
        #[cfg(not(windows))]
        let _ = restored;
    }

    #[cfg(windows)]
    pub(crate) fn interceptor(&self) -> &dyn Interceptor {
        self.interceptor.as_ref()
    }
}

impl Drop for PresentHook {
    fn drop(&mut self) {
        // Uninstall anything still live; the handle's own drop restores
        // the entry if the interceptor is already gone.
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = self.interceptor.uninstall(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hook() -> (Arc<PresentHook>, Arc<Diagnostics>) {
        let diag = Arc::new(Diagnostics::default());
        let hook = Arc::new(PresentHook::new(
            Box::new(VTableInterceptor::new()),
            Arc::clone(&diag),
        ));
        (hook, diag)
    }

    fn surface() -> SurfaceHandle {
        SurfaceHandle(std::ptr::null_mut())
    }

    #[test]
    fn registered_callback_sees_presents() {
        let (hook, _diag) = hook();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        hook.register_present_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        hook.invoke_present_callback(&surface());
        hook.invoke_present_callback(&surface());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reregistering_replaces_the_callback() {
        let (hook, _diag) = hook();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&first);
        hook.register_present_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        let sink = Arc::clone(&second);
        hook.register_present_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        hook.invoke_present_callback(&surface());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_panic_is_contained_and_logged() {
        let (hook, diag) = hook();
        hook.register_present_callback(Box::new(|_| {
            panic!("callback exploded");
        }));

        hook.invoke_present_callback(&surface());
        assert_eq!(diag.errors.severity_counts().critical, 1);

        // The hook keeps working after a panic.
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        hook.register_present_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        hook.invoke_present_callback(&surface());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[cfg(not(windows))]
    #[test]
    fn initialize_is_deferred_off_windows() {
        let (hook, diag) = hook();
        assert!(!hook.initialize().unwrap());
        assert!(!hook.is_installed());
        assert_eq!(diag.errors.severity_counts().warning, 1);
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_leaves_a_tampered_entry_to_the_chained_patch() {
        use std::ffi::c_void;

        let (hook, diag) = hook();
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let table = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        } as *mut *const c_void;
        unsafe { table.write(0x100 as *const c_void) };

        let handle = hook
            .interceptor
            .install(InterceptTarget {
                table,
                index: 0,
                replacement: 0xBEEF as *const c_void,
            })
            .unwrap();
        *hook.handle.lock().unwrap() = Some(handle);

        // A later patch chained on top of ours.
        unsafe { table.write(0xF00D as *const c_void) };
        hook.shutdown();

        assert_eq!(
            unsafe { std::ptr::read_volatile(table) },
            0xF00D as *const c_void
        );
        assert!(!hook.is_installed());
        assert_eq!(diag.errors.severity_counts().warning, 1);
        unsafe { libc::munmap(table as *mut c_void, page) };
    }

    #[test]
    fn shutdown_clears_the_callback() {
        let (hook, _diag) = hook();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        hook.register_present_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        hook.shutdown();
        hook.invoke_present_callback(&surface());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
