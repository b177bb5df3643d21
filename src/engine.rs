/*!
 * Capture engine facade
 *
 * Wires the pieces together: present hook → frame extraction → in-process
 * callbacks → shared-memory transport, with one `Arc<Diagnostics>` bundle
 * shared by everything. The extractor is created lazily, on the first
 * present, once real device handles exist.
 */

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostics, ErrorCategory};
use crate::extract::{
    CallbackHandle, CallbackRegistry, ExtractError, FrameExtractor, SurfaceHandle, SurfaceReader,
};
use crate::hook::{HookError, PresentHook, VTableInterceptor};
use crate::transport::{SharedMemoryRingTransport, TransportError, TransportStats};

pub use crate::extract::frame::FrameData;

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Returns the taken extractor to its slot on drop, unless a frame
/// callback attached a replacement in the meantime; the replacement
/// wins and the stale extractor is dropped.
struct RestoreExtractor {
    slot: Arc<Mutex<Option<FrameExtractor>>>,
    active: Option<FrameExtractor>,
}

impl Drop for RestoreExtractor {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let mut slot = self
                .slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(active);
            }
        }
    }
}

/// The capture engine. One instance per injected process.
pub struct CaptureEngine {
    diag: Arc<Diagnostics>,
    callbacks: Arc<CallbackRegistry>,
    transport: Option<Arc<SharedMemoryRingTransport>>,
    hook: Arc<PresentHook>,
    extractor: Arc<Mutex<Option<FrameExtractor>>>,
    session: Uuid,
}

impl CaptureEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let diag = Arc::new(Diagnostics::new(
            config.error_log.clone(),
            config.monitor.clone(),
        ));
        let session = Uuid::new_v4();

        let transport = if config.enable_transport {
            Some(Arc::new(SharedMemoryRingTransport::open_or_create(
                &config.region_name,
                &config.transport,
                Arc::clone(&diag),
            )?))
        } else {
            None
        };

        let callbacks = Arc::new(CallbackRegistry::new());
        let hook = Arc::new(PresentHook::new(
            Box::new(VTableInterceptor::new()),
            Arc::clone(&diag),
        ));

        let extractor: Arc<Mutex<Option<FrameExtractor>>> = Arc::new(Mutex::new(None));
        hook.register_present_callback(Self::present_callback(
            Arc::clone(&extractor),
            Arc::clone(&callbacks),
            transport.clone(),
            Arc::clone(&diag),
        ));

        let mut details = BTreeMap::new();
        details.insert("session".to_string(), session.to_string());
        diag.errors.report(
            crate::diagnostics::ErrorSeverity::Info,
            ErrorCategory::System,
            "CaptureEngine",
            "capture engine created",
            None,
            details,
        );

        Ok(Self {
            diag,
            callbacks,
            transport,
            hook,
            extractor,
            session,
        })
    }

    /// The closure the hook runs on every present. Builds the extractor
    /// on first use, then extracts; failures are logged, never raised
    /// into the patched call path.
    ///
    /// The extractor is taken out of its slot and the lock is released
    /// for the duration of the extraction, so frame callbacks may call
    /// back into the engine (attach a reader, touch the registry)
    /// without deadlocking the presenting thread.
    fn present_callback(
        extractor: Arc<Mutex<Option<FrameExtractor>>>,
        callbacks: Arc<CallbackRegistry>,
        transport: Option<Arc<SharedMemoryRingTransport>>,
        diag: Arc<Diagnostics>,
    ) -> Box<dyn Fn(&SurfaceHandle) + Send + Sync> {
        Box::new(move |surface| {
            let active = {
                let mut slot = extractor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if slot.is_none() {
                    #[cfg(windows)]
                    {
                        match crate::extract::d3d11::D3d11SurfaceReader::from_swap_chain(
                            surface,
                            Arc::clone(&diag),
                        ) {
                            Ok(reader) => {
                                *slot = Some(FrameExtractor::new(
                                    Box::new(reader),
                                    Arc::clone(&callbacks),
                                    transport.clone(),
                                    Arc::clone(&diag),
                                ));
                            }
                            Err(err) => {
                                diag.errors.error(
                                    ErrorCategory::Graphics,
                                    "CaptureEngine",
                                    format!("extractor initialization failed: {err}"),
                                );
                                return;
                            }
                        }
                    }
                    #[cfg(not(windows))]
                    {
                        let _ = (&callbacks, &transport);
                        diag.errors.debug(
                            ErrorCategory::Graphics,
                            "CaptureEngine",
                            "present observed before a surface reader was attached",
                        );
                        return;
                    }
                }
                slot.take()
            };
            let Some(active) = active else { return };

            // The guard puts the extractor back even if a frame callback
            // panics and unwinds through the extraction.
            let mut restore = RestoreExtractor {
                slot: Arc::clone(&extractor),
                active: Some(active),
            };
            if let Err(err) = restore
                .active
                .as_mut()
                .unwrap()
                .extract_frame(surface)
            {
                diag.errors.error(
                    ErrorCategory::Graphics,
                    "CaptureEngine",
                    format!("frame extraction failed: {err}"),
                );
            }
        })
    }

    /// Install the present hook. `Ok(false)` means no surface exists
    /// yet; the engine waits for [`notify_surface_created`].
    ///
    /// [`notify_surface_created`]: Self::notify_surface_created
    pub fn initialize(&self) -> Result<bool, EngineError> {
        Ok(self.hook.initialize()?)
    }

    /// Retry hook installation against a surface the application just
    /// created.
    pub fn notify_surface_created(&self, surface: SurfaceHandle) -> Result<bool, EngineError> {
        Ok(self.hook.notify_surface_created(surface)?)
    }

    /// Attach an explicit surface reader instead of waiting for the
    /// first present to build one. Used off-Windows and by embedders
    /// with their own readback path.
    pub fn attach_surface_reader(&self, reader: Box<dyn SurfaceReader>) {
        *self.extractor.lock().unwrap() = Some(FrameExtractor::new(
            reader,
            Arc::clone(&self.callbacks),
            self.transport.clone(),
            Arc::clone(&self.diag),
        ));
    }

    /// Register an in-process frame callback. Handles stay valid across
    /// unregistration of other callbacks.
    pub fn register_frame_callback(
        &self,
        callback: Box<dyn Fn(&FrameData) + Send + Sync>,
    ) -> CallbackHandle {
        self.callbacks.register(callback)
    }

    pub fn unregister_frame_callback(&self, handle: CallbackHandle) -> bool {
        self.callbacks.unregister(handle)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diag
    }

    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.transport.as_ref().map(|t| t.stats())
    }

    pub fn is_hooked(&self) -> bool {
        self.hook.is_installed()
    }

    /// Uninstall the hook, flush a diagnostics summary to the log, and
    /// release the transport region.
    pub fn shutdown(&mut self) {
        self.hook.shutdown();
        *self.extractor.lock().unwrap() = None;

        let summary = self.diag.perf.summary();
        self.diag.errors.info(
            ErrorCategory::System,
            "CaptureEngine",
            format!(
                "shutdown: {} operations recorded ({} slow), {:.1} ms total",
                summary.total_operations, summary.slow_operations, summary.total_duration_ms
            ),
        );
        if self.diag.memory.has_leaks() {
            let stats = self.diag.memory.statistics();
            self.diag.errors.warning(
                ErrorCategory::Memory,
                "CaptureEngine",
                format!(
                    "{} tracked allocations still active at shutdown ({} bytes)",
                    stats.active_allocations, stats.active_bytes
                ),
            );
        }
        self.transport = None;
    }
}
