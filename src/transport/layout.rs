/*!
 * On-region wire layout
 *
 * Byte layout of the shared-memory region: one header at offset 0, then
 * `max_frames` fixed-size slots. Both structs are `#[repr(C)]` and must
 * never change shape without bumping [`LAYOUT_VERSION`]; both sides of
 * the transport map the same bytes.
 */

/// "UNDO" in ASCII, little-endian.
pub const REGION_MAGIC: u32 = 0x554E_444F;
/// Bumped on any layout change.
pub const LAYOUT_VERSION: u32 = 1;
/// Bytes reserved in the header for the process-shared lock. Large enough
/// for a `pthread_rwlock_t` on every supported libc (56 bytes on Linux
/// x86_64).
pub const LOCK_AREA_SIZE: usize = 64;

/// Region header at offset 0.
///
/// `producer_index`, `consumer_index`, and `sequence` are accessed
/// atomically through the mapping; the rest is written once at creation
/// and read-only afterwards. Producer and consumer are free-running
/// cursors: the slot a cursor refers to is `cursor % max_frames`, the
/// ring is empty when they are equal, and full when they differ by
/// `max_frames`.
#[repr(C)]
pub struct SharedMemoryHeader {
    pub magic: u32,
    pub version: u32,
    pub buffer_size: u64,
    /// Offset of slot 0 from the start of the region.
    pub frame_data_offset: u32,
    pub producer_index: u32,
    pub consumer_index: u32,
    pub max_frames: u32,
    /// Full slot size, slot header included.
    pub frame_size: u32,
    pub _pad: u32,
    /// Monotonic frame counter, fetch-add per write.
    pub sequence: u64,
    /// Backing storage for the process-shared lock.
    pub lock_area: [u8; LOCK_AREA_SIZE],
}

/// Per-slot header; payload bytes follow immediately.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSlotHeader {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
    pub timestamp_ms: u64,
    pub data_size: u32,
    pub flags: u32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SharedMemoryHeader>();
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<FrameSlotHeader>();

/// Byte offset of slot `index % max_frames` within the region.
pub fn slot_offset(header_offset: u32, frame_size: u32, max_frames: u32, index: u32) -> usize {
    header_offset as usize + (index % max_frames) as usize * frame_size as usize
}

/// Total region size needed for the given ring geometry.
pub fn region_size(max_frames: u32, frame_size: u32) -> usize {
    HEADER_SIZE + max_frames as usize * frame_size as usize
}

/// Slot size for a payload capacity, slot header included.
pub fn frame_size_for_payload(payload: u32) -> u32 {
    SLOT_HEADER_SIZE as u32 + payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn header_layout_is_stable() {
        assert_eq!(offset_of!(SharedMemoryHeader, magic), 0);
        assert_eq!(offset_of!(SharedMemoryHeader, version), 4);
        assert_eq!(offset_of!(SharedMemoryHeader, buffer_size), 8);
        assert_eq!(offset_of!(SharedMemoryHeader, frame_data_offset), 16);
        assert_eq!(offset_of!(SharedMemoryHeader, producer_index), 20);
        assert_eq!(offset_of!(SharedMemoryHeader, consumer_index), 24);
        assert_eq!(offset_of!(SharedMemoryHeader, max_frames), 28);
        assert_eq!(offset_of!(SharedMemoryHeader, frame_size), 32);
        assert_eq!(offset_of!(SharedMemoryHeader, sequence), 40);
        assert_eq!(offset_of!(SharedMemoryHeader, lock_area), 48);
        assert_eq!(HEADER_SIZE, 48 + LOCK_AREA_SIZE);
    }

    #[test]
    fn slot_header_layout_is_stable() {
        assert_eq!(offset_of!(FrameSlotHeader, sequence), 0);
        assert_eq!(offset_of!(FrameSlotHeader, width), 8);
        assert_eq!(offset_of!(FrameSlotHeader, height), 12);
        assert_eq!(offset_of!(FrameSlotHeader, stride), 16);
        assert_eq!(offset_of!(FrameSlotHeader, format), 20);
        assert_eq!(offset_of!(FrameSlotHeader, timestamp_ms), 24);
        assert_eq!(offset_of!(FrameSlotHeader, data_size), 32);
        assert_eq!(offset_of!(FrameSlotHeader, flags), 36);
        assert_eq!(SLOT_HEADER_SIZE, 40);
    }

    #[test]
    fn slot_offsets_wrap_by_cursor() {
        let frame_size = frame_size_for_payload(1024);
        let base = HEADER_SIZE as u32;
        assert_eq!(slot_offset(base, frame_size, 4, 0), HEADER_SIZE);
        assert_eq!(
            slot_offset(base, frame_size, 4, 5),
            HEADER_SIZE + frame_size as usize
        );
        assert_eq!(
            region_size(4, frame_size),
            HEADER_SIZE + 4 * frame_size as usize
        );
    }
}
