/*!
 * frametap
 *
 * In-process graphics-presentation interception engine paired with a
 * cross-process shared-memory frame transport. The engine locates a live
 * presentation surface, intercepts its present entry point, extracts each
 * rendered frame into host memory, and streams the frames through a
 * fixed-capacity ring buffer to a consumer process.
 */

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod extract;
pub mod hook;
pub mod modules;
pub mod transport;

// Re-export commonly used types
pub use config::EngineConfig;
pub use diagnostics::{Diagnostics, ErrorCategory, ErrorSeverity};
pub use engine::CaptureEngine;
pub use extract::frame::{FrameData, FrameFlags, PixelFormat};
pub use extract::{CallbackHandle, FrameExtractor, SurfaceReader};
pub use hook::{InterceptHandle, Interceptor, PresentHook};
pub use transport::{SharedMemoryRingTransport, TransportError, WaitOutcome};
