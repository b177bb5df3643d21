/*!
 * Platform primitives behind the ring transport
 *
 * Three pieces: a named mappable memory region, a process-shared
 * readers/writer lock living inside the mapped header, and a named
 * auto-reset frame signal. Unix uses `/dev/shm` files + `pthread_rwlock`
 * with `PTHREAD_PROCESS_SHARED` + POSIX semaphores; Windows uses a named
 * section, a named mutex (exclusive-only, see `RegionLock`), and a named
 * auto-reset event.
 */

use std::io;
use std::time::Duration;

use crate::transport::WaitOutcome;

#[cfg(unix)]
pub use unix::{FrameSignal, RegionLock, SharedRegion};
#[cfg(windows)]
pub use windows_impl::{FrameSignal, RegionLock, SharedRegion};

/// Guard for an exclusive (write) hold on the region lock.
pub struct WriteGuard<'a> {
    lock: &'a RegionLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

/// Guard for a shared (read) hold on the region lock.
pub struct ReadGuard<'a> {
    lock: &'a RegionLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    use memmap2::MmapMut;
    use tracing::{debug, warn};

    use crate::transport::layout::LOCK_AREA_SIZE;

    const _: () = assert!(std::mem::size_of::<libc::pthread_rwlock_t>() <= LOCK_AREA_SIZE);

    /// A named region backed by a `/dev/shm` file. The creating side
    /// unlinks the file on drop.
    pub struct SharedRegion {
        mmap: MmapMut,
        path: PathBuf,
        created: bool,
    }

    unsafe impl Send for SharedRegion {}

    impl SharedRegion {
        /// Attach to `name` if it already exists, otherwise create it
        /// with `size` bytes. Returns the mapping and whether this side
        /// created it.
        pub fn open_or_create(name: &str, size: usize) -> io::Result<Self> {
            let path = PathBuf::from(format!("/dev/shm/{name}"));
            let (file, created) = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    file.set_len(size as u64)?;
                    (file, true)
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let file = OpenOptions::new().read(true).write(true).open(&path)?;
                    (file, false)
                }
                Err(err) => return Err(err),
            };
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            debug!(name, size = mmap.len(), created, "mapped shared region");
            Ok(Self { mmap, path, created })
        }

        pub fn created(&self) -> bool {
            self.created
        }

        pub fn len(&self) -> usize {
            self.mmap.len()
        }

        pub fn as_ptr(&self) -> *const u8 {
            self.mmap.as_ptr()
        }

        pub fn as_mut_ptr(&self) -> *mut u8 {
            self.mmap.as_ptr() as *mut u8
        }
    }

    impl Drop for SharedRegion {
        fn drop(&mut self) {
            if self.created {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), %err, "failed to unlink shared region");
                }
            }
        }
    }

    /// Process-shared readers/writer lock stored inside the mapped
    /// header. The storage must stay mapped for the lifetime of this
    /// handle.
    pub struct RegionLock {
        lock: *mut libc::pthread_rwlock_t,
    }

    unsafe impl Send for RegionLock {}
    unsafe impl Sync for RegionLock {}

    impl RegionLock {
        /// Initialize a new lock in `area` (creator side only).
        ///
        /// # Safety
        /// `area` must point at `LOCK_AREA_SIZE` writable bytes that stay
        /// mapped while the lock is in use, and no other process may have
        /// initialized a lock there already.
        pub unsafe fn init_in(area: *mut u8) -> io::Result<Self> {
            let lock = area as *mut libc::pthread_rwlock_t;
            let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
            let rc = libc::pthread_rwlockattr_init(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            let rc = libc::pthread_rwlock_init(lock, &attr);
            libc::pthread_rwlockattr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self { lock })
        }

        /// Attach to a lock another process already initialized in `area`.
        ///
        /// # Safety
        /// `area` must hold a lock initialized by [`init_in`] and stay
        /// mapped while the lock is in use.
        ///
        /// [`init_in`]: Self::init_in
        pub unsafe fn attach(area: *mut u8) -> Self {
            Self {
                lock: area as *mut libc::pthread_rwlock_t,
            }
        }

        pub fn lock_exclusive(&self) -> WriteGuard<'_> {
            unsafe { libc::pthread_rwlock_wrlock(self.lock) };
            WriteGuard { lock: self }
        }

        pub fn lock_shared(&self) -> ReadGuard<'_> {
            unsafe { libc::pthread_rwlock_rdlock(self.lock) };
            ReadGuard { lock: self }
        }

        pub(super) fn unlock_exclusive(&self) {
            unsafe { libc::pthread_rwlock_unlock(self.lock) };
        }

        pub(super) fn unlock_shared(&self) {
            unsafe { libc::pthread_rwlock_unlock(self.lock) };
        }
    }

    /// Named cross-process frame signal: a POSIX semaphore clamped to at
    /// most one pending post, so repeated notifies collapse like an
    /// auto-reset event.
    pub struct FrameSignal {
        sem: *mut libc::sem_t,
        sem_name: CString,
        created: bool,
    }

    unsafe impl Send for FrameSignal {}
    unsafe impl Sync for FrameSignal {}

    impl FrameSignal {
        pub fn open_or_create(name: &str) -> io::Result<Self> {
            let sem_name = CString::new(format!("/{name}"))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in signal name"))?;
            // Try exclusive creation first so we know who unlinks.
            let sem = unsafe {
                libc::sem_open(
                    sem_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::mode_t,
                    0,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self { sem, sem_name, created: true });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
            let sem = unsafe { libc::sem_open(sem_name.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { sem, sem_name, created: false })
        }

        /// Post the signal unless one is already pending.
        pub fn notify(&self) {
            let mut value = 0;
            let rc = unsafe { libc::sem_getvalue(self.sem, &mut value) };
            if rc == 0 && value > 0 {
                return;
            }
            unsafe { libc::sem_post(self.sem) };
        }

        /// Block until signalled or the timeout elapses.
        pub fn wait(&self, timeout: Duration) -> WaitOutcome {
            let mut deadline = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
                return WaitOutcome::Failed;
            }
            deadline.tv_sec += timeout.as_secs() as libc::time_t;
            deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }
            loop {
                let rc = unsafe { libc::sem_timedwait(self.sem, &deadline) };
                if rc == 0 {
                    return WaitOutcome::Signalled;
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ETIMEDOUT) => return WaitOutcome::TimedOut,
                    _ => return WaitOutcome::Failed,
                }
            }
        }
    }

    impl Drop for FrameSignal {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
                if self.created {
                    libc::sem_unlink(self.sem_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;

    use windows::core::HSTRING;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
        MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateEventW, CreateMutexW, ReleaseMutex, SetEvent, WaitForSingleObject, INFINITE,
    };
    use windows::Win32::Foundation::{ERROR_ALREADY_EXISTS, GetLastError, INVALID_HANDLE_VALUE};

    /// A named section mapping. Windows releases the section when the
    /// last handle closes; no explicit unlink step exists.
    pub struct SharedRegion {
        mapping: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        size: usize,
        created: bool,
    }

    unsafe impl Send for SharedRegion {}
    unsafe impl Sync for SharedRegion {}

    impl SharedRegion {
        pub fn open_or_create(name: &str, size: usize) -> io::Result<Self> {
            unsafe {
                let mapping = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    (size as u64 >> 32) as u32,
                    size as u32,
                    &HSTRING::from(name),
                )
                .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;
                let created = GetLastError() != ERROR_ALREADY_EXISTS;
                let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size);
                if view.Value.is_null() {
                    let _ = CloseHandle(mapping);
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { mapping, view, size, created })
            }
        }

        pub fn created(&self) -> bool {
            self.created
        }

        pub fn len(&self) -> usize {
            self.size
        }

        pub fn as_ptr(&self) -> *const u8 {
            self.view.Value as *const u8
        }

        pub fn as_mut_ptr(&self) -> *mut u8 {
            self.view.Value as *mut u8
        }
    }

    impl Drop for SharedRegion {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.mapping);
            }
        }
    }

    /// Named-mutex stand-in for the Unix readers/writer lock: shared
    /// holds degrade to mutual exclusion.
    pub struct RegionLock {
        mutex: HANDLE,
    }

    unsafe impl Send for RegionLock {}
    unsafe impl Sync for RegionLock {}

    impl RegionLock {
        pub fn open_or_create(name: &str) -> io::Result<Self> {
            let mutex = unsafe {
                CreateMutexW(None, false, &HSTRING::from(format!("{name}_lock")))
            }
            .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;
            Ok(Self { mutex })
        }

        pub fn lock_exclusive(&self) -> WriteGuard<'_> {
            unsafe { WaitForSingleObject(self.mutex, INFINITE) };
            WriteGuard { lock: self }
        }

        pub fn lock_shared(&self) -> ReadGuard<'_> {
            unsafe { WaitForSingleObject(self.mutex, INFINITE) };
            ReadGuard { lock: self }
        }

        pub(super) fn unlock_exclusive(&self) {
            unsafe {
                let _ = ReleaseMutex(self.mutex);
            }
        }

        pub(super) fn unlock_shared(&self) {
            unsafe {
                let _ = ReleaseMutex(self.mutex);
            }
        }
    }

    impl Drop for RegionLock {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.mutex);
            }
        }
    }

    /// Named auto-reset event.
    pub struct FrameSignal {
        event: HANDLE,
    }

    unsafe impl Send for FrameSignal {}
    unsafe impl Sync for FrameSignal {}

    impl FrameSignal {
        pub fn open_or_create(name: &str) -> io::Result<Self> {
            let event = unsafe { CreateEventW(None, false, false, &HSTRING::from(name)) }
                .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;
            Ok(Self { event })
        }

        pub fn notify(&self) {
            unsafe {
                let _ = SetEvent(self.event);
            }
        }

        pub fn wait(&self, timeout: Duration) -> WaitOutcome {
            let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
            match unsafe { WaitForSingleObject(self.event, millis) } {
                WAIT_OBJECT_0 => WaitOutcome::Signalled,
                WAIT_TIMEOUT => WaitOutcome::TimedOut,
                _ => WaitOutcome::Failed,
            }
        }
    }

    impl Drop for FrameSignal {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.event);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn region_create_then_attach_shares_bytes() {
        let name = unique("frametap-test-region");
        let creator = SharedRegion::open_or_create(&name, 4096).unwrap();
        assert!(creator.created());
        unsafe { *creator.as_mut_ptr() = 0xAA };

        let attached = SharedRegion::open_or_create(&name, 4096).unwrap();
        assert!(!attached.created());
        assert_eq!(unsafe { *attached.as_ptr() }, 0xAA);
        assert_eq!(attached.len(), 4096);
    }

    #[test]
    fn creator_unlinks_region_on_drop() {
        let name = unique("frametap-test-unlink");
        let path = format!("/dev/shm/{name}");
        {
            let _region = SharedRegion::open_or_create(&name, 4096).unwrap();
            assert!(std::path::Path::new(&path).exists());
        }
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn signal_wait_times_out_without_post() {
        let name = unique("frametap-test-sig");
        let signal = FrameSignal::open_or_create(&name).unwrap();
        assert_eq!(
            signal.wait(Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn repeated_notifies_collapse_to_one_wakeup() {
        let name = unique("frametap-test-sig-clamp");
        let signal = FrameSignal::open_or_create(&name).unwrap();
        signal.notify();
        signal.notify();
        signal.notify();
        assert_eq!(
            signal.wait(Duration::from_millis(100)),
            WaitOutcome::Signalled
        );
        // The extra posts were clamped away.
        assert_eq!(
            signal.wait(Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn signal_wakes_a_waiting_thread() {
        let name = unique("frametap-test-sig-wake");
        let signal = Arc::new(FrameSignal::open_or_create(&name).unwrap());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = Arc::clone(&signal);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                if signal.wait(Duration::from_secs(5)) == WaitOutcome::Signalled {
                    woke.store(true, Ordering::SeqCst);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        signal.notify();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn region_lock_round_trip() {
        let name = unique("frametap-test-lock");
        let region = SharedRegion::open_or_create(&name, 4096).unwrap();
        let lock = unsafe { RegionLock::init_in(region.as_mut_ptr()) }.unwrap();
        {
            let _w = lock.lock_exclusive();
        }
        {
            let _r1 = lock.lock_shared();
            let _r2 = lock.lock_shared();
        }
        let _w = lock.lock_exclusive();
    }
}
