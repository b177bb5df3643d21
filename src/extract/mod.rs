/*!
 * GPU-to-host frame extraction
 *
 * Runs synchronously on the presenting thread: read the surface
 * description, pull the pixels into host memory through the platform
 * [`SurfaceReader`], stamp the result into an immutable [`FrameData`],
 * then fan it out to in-process callbacks and the ring transport.
 */

pub mod frame;

#[cfg(windows)]
pub mod d3d11;

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

use crate::diagnostics::{Diagnostics, ErrorCategory, MemoryCategory};
use crate::transport::SharedMemoryRingTransport;
use frame::{FrameData, FrameFlags, PixelFormat};

/// Errors from the graphics readback path.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("graphics device not initialized")]
    NotInitialized,
    #[error("surface description failed: {0}")]
    Describe(String),
    #[error("surface readback failed: {0}")]
    Readback(String),
}

/// Opaque pointer to a live presentation surface. Only meaningful to the
/// [`SurfaceReader`] that produced or accepted it.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceHandle(pub *mut c_void);

/// Dimensions and raw format code of a surface, as reported by the
/// graphics runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

/// Platform seam for surface readback. The production implementation is
/// the D3D11 staging-texture path; tests substitute an in-memory fake.
pub trait SurfaceReader: Send {
    fn describe(&mut self, surface: &SurfaceHandle) -> Result<SurfaceDesc, ExtractError>;

    /// Read the surface pixels into `out`, returning the row stride in
    /// bytes.
    fn read_into(
        &mut self,
        surface: &SurfaceHandle,
        out: &mut Vec<u8>,
    ) -> Result<u32, ExtractError>;
}

type FrameCallback = Box<dyn Fn(&FrameData) + Send + Sync>;

/// Handle for one registered frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(usize);

/// Frame-callback fan-out with stable handles: unregistering leaves a
/// hole instead of shifting later registrations.
#[derive(Default)]
pub struct CallbackRegistry {
    slots: Mutex<Vec<Option<Arc<dyn Fn(&FrameData) + Send + Sync>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: FrameCallback) -> CallbackHandle {
        let mut slots = self.slots.lock().unwrap();
        slots.push(Some(Arc::from(callback)));
        CallbackHandle(slots.len() - 1)
    }

    /// Returns false for unknown or already removed handles.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Invoke every active callback with the slots lock released, so a
    /// callback may register or unregister on the same registry.
    pub fn dispatch(&self, frame: &FrameData) {
        let active: Vec<_> = {
            let slots = self.slots.lock().unwrap();
            slots.iter().flatten().map(Arc::clone).collect()
        };
        for callback in active {
            callback(frame);
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }
}

/// Pulls presented frames into host memory and delivers them.
pub struct FrameExtractor {
    reader: Box<dyn SurfaceReader>,
    callbacks: Arc<CallbackRegistry>,
    transport: Option<Arc<SharedMemoryRingTransport>>,
    diag: Arc<Diagnostics>,
    sequence: AtomicU64,
}

impl FrameExtractor {
    pub fn new(
        reader: Box<dyn SurfaceReader>,
        callbacks: Arc<CallbackRegistry>,
        transport: Option<Arc<SharedMemoryRingTransport>>,
        diag: Arc<Diagnostics>,
    ) -> Self {
        Self {
            reader,
            callbacks,
            transport,
            diag,
            sequence: AtomicU64::new(0),
        }
    }

    /// Extract one frame from `surface` and deliver it. `Ok(true)` on
    /// delivery, `Ok(false)` when the frame was skipped (unsupported
    /// pixel format), `Err` on graphics failure.
    pub fn extract_frame(&mut self, surface: &SurfaceHandle) -> Result<bool, ExtractError> {
        let _timer = self.diag.perf.start_timer("extract.frame");

        let desc = self.reader.describe(surface)?;
        let format = PixelFormat::from_raw(desc.format);
        if !format.is_supported() {
            self.diag.errors.warning(
                ErrorCategory::Graphics,
                "FrameExtractor",
                format!(
                    "unsupported pixel format {} on {}x{} surface, frame skipped",
                    desc.format, desc.width, desc.height
                ),
            );
            return Ok(false);
        }

        let mut pixels = Vec::new();
        let stride = self.reader.read_into(surface, &mut pixels)?;
        let staging = self
            .diag
            .memory
            .track("extract.staging", pixels.len(), MemoryCategory::Graphics);

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let frame = FrameData {
            width: desc.width,
            height: desc.height,
            stride,
            format,
            timestamp_ms,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            flags: FrameFlags::KEYFRAME,
            data: Bytes::from(pixels),
        };

        self.callbacks.dispatch(&frame);
        if let Some(transport) = &self.transport {
            transport.write_frame(&frame);
        }

        self.diag.memory.release(staging);
        Ok(true)
    }

    pub fn frames_extracted(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fixed-size surface backed by a host buffer.
    struct FakeReader {
        desc: SurfaceDesc,
        fill: u8,
    }

    impl SurfaceReader for FakeReader {
        fn describe(&mut self, _surface: &SurfaceHandle) -> Result<SurfaceDesc, ExtractError> {
            Ok(self.desc)
        }

        fn read_into(
            &mut self,
            _surface: &SurfaceHandle,
            out: &mut Vec<u8>,
        ) -> Result<u32, ExtractError> {
            let stride = self.desc.width * 4;
            out.resize((stride * self.desc.height) as usize, self.fill);
            Ok(stride)
        }
    }

    fn extractor(desc: SurfaceDesc) -> (FrameExtractor, Arc<CallbackRegistry>, Arc<Diagnostics>) {
        let callbacks = Arc::new(CallbackRegistry::new());
        let diag = Arc::new(Diagnostics::default());
        let extractor = FrameExtractor::new(
            Box::new(FakeReader { desc, fill: 0x7F }),
            Arc::clone(&callbacks),
            None,
            Arc::clone(&diag),
        );
        (extractor, callbacks, diag)
    }

    fn surface() -> SurfaceHandle {
        SurfaceHandle(std::ptr::null_mut())
    }

    #[test]
    fn supported_surface_reaches_callbacks() {
        let (mut ex, callbacks, _diag) = extractor(SurfaceDesc {
            width: 8,
            height: 8,
            format: PixelFormat::Bgra8Unorm.to_raw(),
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        callbacks.register(Box::new(move |frame| {
            assert_eq!(frame.width, 8);
            assert_eq!(frame.data.len(), 8 * 8 * 4);
            assert!(frame.flags.contains(FrameFlags::KEYFRAME));
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(ex.extract_frame(&surface()).unwrap());
        assert!(ex.extract_frame(&surface()).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(ex.frames_extracted(), 2);
    }

    #[test]
    fn sequence_is_post_incremented_per_frame() {
        let (mut ex, callbacks, _diag) = extractor(SurfaceDesc {
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8Unorm.to_raw(),
        });
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sequences);
        callbacks.register(Box::new(move |frame| {
            sink.lock().unwrap().push(frame.sequence);
        }));

        for _ in 0..3 {
            ex.extract_frame(&surface()).unwrap();
        }
        assert_eq!(*sequences.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsupported_format_skips_without_error() {
        let (mut ex, callbacks, diag) = extractor(SurfaceDesc {
            width: 4,
            height: 4,
            format: 24, // 10-bit, not on the whitelist
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        callbacks.register(Box::new(move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!ex.extract_frame(&surface()).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(ex.frames_extracted(), 0);
        assert_eq!(diag.errors.severity_counts().warning, 1);
    }

    #[test]
    fn staging_memory_is_released_after_delivery() {
        let (mut ex, _callbacks, diag) = extractor(SurfaceDesc {
            width: 4,
            height: 4,
            format: PixelFormat::Bgra8Unorm.to_raw(),
        });
        ex.extract_frame(&surface()).unwrap();
        assert!(!diag.memory.has_leaks());
        assert_eq!(diag.memory.statistics().total_allocations, 1);
    }

    #[test]
    fn unregistered_callbacks_stop_firing_and_handles_stay_stable() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a_hits = Arc::clone(&hits);
        let b_hits = Arc::clone(&hits);
        let a = registry.register(Box::new(move |_| {
            a_hits.fetch_add(1, Ordering::SeqCst);
        }));
        let b = registry.register(Box::new(move |_| {
            b_hits.fetch_add(10, Ordering::SeqCst);
        }));

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));

        let frame = FrameData {
            width: 1,
            height: 1,
            stride: 4,
            format: PixelFormat::Bgra8Unorm,
            timestamp_ms: 0,
            sequence: 0,
            flags: FrameFlags::empty(),
            data: Bytes::from_static(&[0, 0, 0, 0]),
        };
        registry.dispatch(&frame);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.unregister(b));
    }

    #[test]
    fn one_shot_callback_unregisters_itself_during_dispatch() {
        let registry = Arc::new(CallbackRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        let reg = Arc::clone(&registry);
        let handle_cell = Arc::new(Mutex::new(None::<CallbackHandle>));
        let cell = Arc::clone(&handle_cell);
        let handle = registry.register(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            let handle = cell.lock().unwrap().take().unwrap();
            assert!(reg.unregister(handle));
        }));
        *handle_cell.lock().unwrap() = Some(handle);

        let frame = FrameData {
            width: 1,
            height: 1,
            stride: 4,
            format: PixelFormat::Bgra8Unorm,
            timestamp_ms: 0,
            sequence: 0,
            flags: FrameFlags::empty(),
            data: Bytes::from_static(&[0, 0, 0, 0]),
        };
        registry.dispatch(&frame);
        registry.dispatch(&frame);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
