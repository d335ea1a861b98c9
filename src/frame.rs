//! Raw frame memory.
//!
//! - `PlaneLayout`: byte layout of a planar YUV420 frame (Y, then U, then V).
//! - `FrameBufferPool`: buffers allocated for a configured stream. Device backends
//!   fill them; the scheduler only ever sees them through a mapping.
//! - `MappedFrame`: read-only mapping of one buffer. Dropping it releases the
//!   mapping, on the success path and the error path alike.
//! - `RawFrame`: borrowed plane view handed to the transcoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::DeviceError;

/// Byte layout of a YUV420 frame with 2x2 chroma subsampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
}

impl PlaneLayout {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn chroma_width(&self) -> usize {
        self.width as usize / 2
    }

    pub fn chroma_height(&self) -> usize {
        self.height as usize / 2
    }

    pub fn chroma_len(&self) -> usize {
        self.chroma_width() * self.chroma_height()
    }

    pub fn frame_len(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }
}

/// Borrowed view of a captured planar frame.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
}

pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Buffers backing one configured stream.
pub struct FrameBufferPool {
    layout: PlaneLayout,
    buffers: Vec<SharedBuffer>,
    live_mappings: Arc<AtomicUsize>,
}

impl FrameBufferPool {
    pub fn allocate(layout: PlaneLayout, count: usize) -> Result<Self, DeviceError> {
        if count == 0 || layout.frame_len() == 0 {
            return Err(DeviceError::Allocation(format!(
                "cannot allocate {} buffers of {}x{}",
                count, layout.width, layout.height
            )));
        }
        let buffers = (0..count)
            .map(|_| Arc::new(Mutex::new(vec![0u8; layout.frame_len()])))
            .collect();
        Ok(Self {
            layout,
            buffers,
            live_mappings: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, index: usize) -> Option<SharedBuffer> {
        self.buffers.get(index).cloned()
    }

    /// Counter of mappings currently held; shared so probes can observe leaks.
    pub fn live_mappings(&self) -> Arc<AtomicUsize> {
        self.live_mappings.clone()
    }

    /// Map buffer `index` read-only.
    pub fn map(&self, index: usize) -> Result<MappedFrame<'_>, DeviceError> {
        let buffer = self
            .buffers
            .get(index)
            .ok_or_else(|| DeviceError::Map(format!("no buffer at index {index}")))?;
        let guard = buffer
            .lock()
            .map_err(|_| DeviceError::Map(format!("buffer {index} poisoned")))?;
        if guard.len() < self.layout.frame_len() {
            return Err(DeviceError::Map(format!(
                "buffer {} holds {} bytes, expected {}",
                index,
                guard.len(),
                self.layout.frame_len()
            )));
        }
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(MappedFrame {
            guard,
            layout: self.layout,
            live: &self.live_mappings,
        })
    }
}

/// Read-only mapping of a filled buffer. Released on drop.
pub struct MappedFrame<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
    layout: PlaneLayout,
    live: &'a AtomicUsize,
}

impl MappedFrame<'_> {
    pub fn raw_frame(&self) -> RawFrame<'_> {
        // Length was checked when the mapping was created.
        let (y, rest) = self.guard.split_at(self.layout.luma_len());
        let (u, rest) = rest.split_at(self.layout.chroma_len());
        RawFrame {
            width: self.layout.width,
            height: self.layout.height,
            y,
            u,
            v: &rest[..self.layout.chroma_len()],
        }
    }
}

impl Drop for MappedFrame<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
