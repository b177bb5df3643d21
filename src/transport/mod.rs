/*!
 * Cross-process shared-memory ring transport
 *
 * One producer process writes frames into a named shared-memory region
 * laid out as a fixed ring of equally sized slots; one consumer process
 * reads them out. A process-shared readers/writer lock in the region
 * header guards the ring, and a named auto-reset signal wakes the
 * consumer without polling.
 */

pub mod layout;
pub mod shm;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::TransportConfig;
use crate::diagnostics::{Diagnostics, ErrorCategory};
use crate::extract::frame::{FrameData, FrameFlags, PixelFormat};
use layout::{
    frame_size_for_payload, region_size, slot_offset, FrameSlotHeader, SharedMemoryHeader,
    HEADER_SIZE, LAYOUT_VERSION, REGION_MAGIC, SLOT_HEADER_SIZE,
};
use shm::{FrameSignal, RegionLock, SharedRegion};

/// Result of waiting on the cross-process frame signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
    Failed,
}

/// Errors raised while attaching to or creating a region.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("region '{name}' needs {needed} bytes for {max_frames} slots, configured {configured}")]
    RegionTooSmall {
        name: String,
        needed: usize,
        configured: usize,
        max_frames: u32,
    },
    #[error("region '{name}' has magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { name: String, found: u32, expected: u32 },
    #[error("region '{name}' has layout version {found}, expected {expected}")]
    VersionMismatch { name: String, found: u32, expected: u32 },
    #[error("shared memory failure: {0}")]
    Io(#[from] io::Error),
}

/// Transport counters, snapshot via [`SharedMemoryRingTransport::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    pub frames_written: u64,
    pub frames_read: u64,
    pub frames_evicted: u64,
    pub oversized_rejected: u64,
    pub signals_sent: u64,
}

/// The ring transport over one named region.
///
/// One producer, one logical consumer: independent processes calling
/// [`read_frame`] concurrently race for the same consumer cursor and
/// will each see a disjoint subset of frames.
///
/// [`read_frame`]: Self::read_frame
pub struct SharedMemoryRingTransport {
    region: SharedRegion,
    lock: RegionLock,
    signal: FrameSignal,
    name: String,
    diag: Arc<Diagnostics>,
    stats: Mutex<TransportStats>,
}

// Manual impl: the region and lock fields hold raw OS handles.
impl fmt::Debug for SharedMemoryRingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("SharedMemoryRingTransport")
            .field("name", &self.name)
            .field("max_frames", &header.max_frames)
            .field("frame_size", &header.frame_size)
            .field("creator", &self.region.created())
            .finish_non_exhaustive()
    }
}

impl SharedMemoryRingTransport {
    /// Attach to the named region if it exists, validating magic and
    /// version; otherwise create it with the geometry from `config`.
    pub fn open_or_create(
        name: &str,
        config: &TransportConfig,
        diag: Arc<Diagnostics>,
    ) -> Result<Self, TransportError> {
        let frame_size = frame_size_for_payload(config.slot_payload_size);
        let needed = region_size(config.max_frames, frame_size);
        if config.region_size < needed {
            return Err(TransportError::RegionTooSmall {
                name: name.to_string(),
                needed,
                configured: config.region_size,
                max_frames: config.max_frames,
            });
        }

        let region = SharedRegion::open_or_create(name, config.region_size)?;
        let created = region.created();

        if created {
            let header = region.as_mut_ptr() as *mut SharedMemoryHeader;
            unsafe {
                (*header).magic = REGION_MAGIC;
                (*header).version = LAYOUT_VERSION;
                (*header).buffer_size = region.len() as u64;
                (*header).frame_data_offset = HEADER_SIZE as u32;
                (*header).producer_index = 0;
                (*header).consumer_index = 0;
                (*header).max_frames = config.max_frames;
                (*header).frame_size = frame_size;
                (*header).sequence = 0;
            }
        } else {
            let header = unsafe { &*(region.as_ptr() as *const SharedMemoryHeader) };
            if header.magic != REGION_MAGIC {
                return Err(TransportError::BadMagic {
                    name: name.to_string(),
                    found: header.magic,
                    expected: REGION_MAGIC,
                });
            }
            if header.version != LAYOUT_VERSION {
                return Err(TransportError::VersionMismatch {
                    name: name.to_string(),
                    found: header.version,
                    expected: LAYOUT_VERSION,
                });
            }
        }

        let lock_area = unsafe {
            region
                .as_mut_ptr()
                .add(std::mem::offset_of!(SharedMemoryHeader, lock_area))
        };
        #[cfg(unix)]
        let lock = if created {
            unsafe { RegionLock::init_in(lock_area) }?
        } else {
            unsafe { RegionLock::attach(lock_area) }
        };
        #[cfg(windows)]
        let lock = {
            let _ = lock_area;
            RegionLock::open_or_create(name)?
        };

        let signal = FrameSignal::open_or_create(&format!("{name}_evt"))?;

        diag.errors.info(
            ErrorCategory::System,
            "SharedMemoryRingTransport",
            format!(
                "{} region '{name}': {} slots of {frame_size} bytes",
                if created { "created" } else { "attached to" },
                config.max_frames,
            ),
        );

        Ok(Self {
            region,
            lock,
            signal,
            name: name.to_string(),
            diag,
            stats: Mutex::new(TransportStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_creator(&self) -> bool {
        self.region.created()
    }

    /// Write one frame into the ring. The producer never blocks on a
    /// full ring: the oldest unread slot is evicted and the written
    /// frame carries [`FrameFlags::EVICTED_PREDECESSOR`].
    ///
    /// Returns false for payloads larger than a slot; the cursors are
    /// left untouched in that case.
    pub fn write_frame(&self, frame: &FrameData) -> bool {
        let _timer = self.diag.perf.start_timer("transport.write");
        let header = self.header();
        let required = SLOT_HEADER_SIZE + frame.data.len();
        if required > header.frame_size as usize {
            self.diag.errors.error(
                ErrorCategory::Memory,
                "SharedMemoryRingTransport",
                format!(
                    "frame of {} payload bytes exceeds slot capacity {}",
                    frame.data.len(),
                    header.frame_size as usize - SLOT_HEADER_SIZE
                ),
            );
            self.stats.lock().unwrap().oversized_rejected += 1;
            return false;
        }

        let mut evicted = false;
        {
            let _guard = self.lock.lock_exclusive();
            let producer = self.producer().load(Ordering::Acquire);
            let consumer = self.consumer().load(Ordering::Acquire);

            let mut flags = frame.flags;
            if producer.wrapping_sub(consumer) == header.max_frames {
                // Full: drop the oldest unread frame rather than block
                // the presenting thread.
                self.consumer()
                    .store(consumer.wrapping_add(1), Ordering::Release);
                flags |= FrameFlags::EVICTED_PREDECESSOR;
                evicted = true;
            }

            let sequence = self.sequence().fetch_add(1, Ordering::AcqRel);
            let offset = slot_offset(
                header.frame_data_offset,
                header.frame_size,
                header.max_frames,
                producer,
            );
            let slot = FrameSlotHeader {
                sequence,
                width: frame.width,
                height: frame.height,
                stride: frame.stride,
                format: frame.format.to_raw(),
                timestamp_ms: frame.timestamp_ms,
                data_size: frame.data.len() as u32,
                flags: flags.bits(),
            };
            unsafe {
                let slot_ptr = self.region.as_mut_ptr().add(offset);
                std::ptr::write(slot_ptr as *mut FrameSlotHeader, slot);
                std::ptr::copy_nonoverlapping(
                    frame.data.as_ptr(),
                    slot_ptr.add(SLOT_HEADER_SIZE),
                    frame.data.len(),
                );
            }
            self.producer()
                .store(producer.wrapping_add(1), Ordering::Release);
        }

        // Signal outside the lock so the woken consumer can read at once.
        self.signal.notify();

        let mut stats = self.stats.lock().unwrap();
        stats.frames_written += 1;
        stats.signals_sent += 1;
        if evicted {
            stats.frames_evicted += 1;
        }
        true
    }

    /// Read the oldest unread frame, if any. Never blocks.
    pub fn read_frame(&self) -> Option<FrameData> {
        let _timer = self.diag.perf.start_timer("transport.read");
        let header = self.header();
        let frame = {
            let _guard = self.lock.lock_shared();
            let producer = self.producer().load(Ordering::Acquire);
            let consumer = self.consumer().load(Ordering::Acquire);
            if producer == consumer {
                return None;
            }

            let offset = slot_offset(
                header.frame_data_offset,
                header.frame_size,
                header.max_frames,
                consumer,
            );
            let (slot, data) = unsafe {
                let slot_ptr = self.region.as_ptr().add(offset);
                let slot = std::ptr::read(slot_ptr as *const FrameSlotHeader);
                let len = (slot.data_size as usize).min(header.frame_size as usize - SLOT_HEADER_SIZE);
                let data = std::slice::from_raw_parts(slot_ptr.add(SLOT_HEADER_SIZE), len).to_vec();
                (slot, data)
            };
            self.consumer()
                .store(consumer.wrapping_add(1), Ordering::Release);

            FrameData {
                width: slot.width,
                height: slot.height,
                stride: slot.stride,
                format: PixelFormat::from_raw(slot.format),
                timestamp_ms: slot.timestamp_ms,
                sequence: slot.sequence,
                flags: FrameFlags::from_bits_retain(slot.flags),
                data: Bytes::from(data),
            }
        };
        self.stats.lock().unwrap().frames_read += 1;
        Some(frame)
    }

    /// Block until the producer signals a new frame or the timeout
    /// elapses. The region lock is never held across the wait.
    pub fn wait_for_frame(&self, timeout: Duration) -> WaitOutcome {
        let outcome = self.signal.wait(timeout);
        match outcome {
            WaitOutcome::Signalled => debug!(region = %self.name, "frame signal received"),
            WaitOutcome::TimedOut => {
                debug!(region = %self.name, ?timeout, "frame wait timed out")
            }
            WaitOutcome::Failed => self.diag.errors.error(
                ErrorCategory::Sync,
                "SharedMemoryRingTransport",
                format!("waiting on frame signal for region '{}' failed", self.name),
            ),
        }
        outcome
    }

    /// Resizing a live region is not supported; the geometry is fixed at
    /// creation. Always returns false.
    pub fn resize_buffer(&self, new_size: usize) -> bool {
        self.diag.errors.warning(
            ErrorCategory::Memory,
            "SharedMemoryRingTransport",
            format!(
                "resize to {new_size} bytes refused: region geometry is fixed at creation"
            ),
        );
        false
    }

    /// Number of frames currently retained and unread.
    pub fn pending_frames(&self) -> u32 {
        let producer = self.producer().load(Ordering::Acquire);
        let consumer = self.consumer().load(Ordering::Acquire);
        producer.wrapping_sub(consumer)
    }

    pub fn stats(&self) -> TransportStats {
        *self.stats.lock().unwrap()
    }

    fn header(&self) -> &SharedMemoryHeader {
        unsafe { &*(self.region.as_ptr() as *const SharedMemoryHeader) }
    }

    fn producer(&self) -> &AtomicU32 {
        let header = self.region.as_ptr() as *const SharedMemoryHeader;
        unsafe { &*(&raw const (*header).producer_index as *const AtomicU32) }
    }

    fn consumer(&self) -> &AtomicU32 {
        let header = self.region.as_ptr() as *const SharedMemoryHeader;
        unsafe { &*(&raw const (*header).consumer_index as *const AtomicU32) }
    }

    fn sequence(&self) -> &AtomicU64 {
        let header = self.region.as_ptr() as *const SharedMemoryHeader;
        unsafe { &*(&raw const (*header).sequence as *const AtomicU64) }
    }
}
