//! # Block Device Collaborator
//!
//! The translation layer drives its two backings (base device and
//! non-volatile cache) through the [`Bdev`] trait. The contract mirrors a
//! polled block layer:
//!
//! - submission either succeeds, reports transient memory pressure
//!   ([`SubmitError::NoMem`], retried via [`Bdev::queue_io_wait`]), or
//!   fails outright
//! - a successful submission always completes later through the supplied
//!   callback, on the core thread
//! - buffers stay owned by the submitter until the completion fires
//!
//! The crate ships one implementation, [`mem::MemBdev`], a RAM-backed
//! device with a VSS side channel used by every test; production backings
//! are supplied by the host.

pub mod mem;

use thiserror::Error;

use crate::core::buf::SharedBuf;
use crate::reactor::Task;

/// Submission-time failure of a block-device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Transient allocator pressure; retry after [`Bdev::queue_io_wait`].
    #[error("device out of request memory")]
    NoMem,
    /// The request cannot be submitted at all (bad range, device gone).
    #[error("device rejected the request")]
    Failed,
}

/// Completion status of a block-device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The transfer completed.
    Success,
    /// The transfer failed; buffer contents are unspecified.
    Failed,
}

impl IoStatus {
    /// Whether the request completed successfully.
    pub fn is_ok(self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// Completion callback of a block-device request.
pub type IoCompletion = Box<dyn FnOnce(IoStatus)>;

/// Per-thread submission channel.
///
/// Every core thread opens its own channel; the in-memory device only
/// records the identity, real backings map this to queue-pair state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoChannel {
    id: u32,
}

impl IoChannel {
    /// Channel identity, for diagnostics.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Asynchronous block device with an optional per-block metadata channel.
pub trait Bdev {
    /// Total number of blocks.
    fn num_blocks(&self) -> u64;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Per-block metadata (VSS) size in bytes; zero when the device has no
    /// side channel.
    fn md_size(&self) -> u32;

    /// Zone size in blocks; zero on a conventional device.
    fn zone_size(&self) -> u64;

    /// Number of zones the device writes optimally in parallel.
    fn optimal_open_zones(&self) -> u64;

    /// Open a submission channel for the calling thread.
    fn open_channel(&self) -> IoChannel;

    /// Read `num_blocks` starting at `offset_blocks` into `buf` at byte
    /// offset `buf_offset`, reading per-block metadata into `md_buf` when
    /// given.
    #[allow(clippy::too_many_arguments)]
    fn read_blocks_with_md(
        &self,
        ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        md_buf: Option<&SharedBuf>,
        md_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError>;

    /// Write counterpart of [`Bdev::read_blocks_with_md`].
    #[allow(clippy::too_many_arguments)]
    fn write_blocks_with_md(
        &self,
        ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        md_buf: Option<&SharedBuf>,
        md_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError>;

    /// Plain read without the metadata channel.
    fn read_blocks(
        &self,
        ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.read_blocks_with_md(ch, buf, buf_offset, None, 0, offset_blocks, num_blocks, cb)
    }

    /// Plain write without the metadata channel.
    fn write_blocks(
        &self,
        ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.write_blocks_with_md(ch, buf, buf_offset, None, 0, offset_blocks, num_blocks, cb)
    }

    /// Arm a retry after a [`SubmitError::NoMem`] submission. The waiter
    /// runs on the core thread once request memory is available again.
    fn queue_io_wait(&self, ch: &IoChannel, waiter: Task);
}

/// Direction of a [`submit_retrying`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// Device to buffer.
    Read,
    /// Buffer to device.
    Write,
}

/// Submit a request, retrying `NoMem` through `queue_io_wait` until it is
/// accepted. The completion fires exactly once; a hard submission
/// failure completes with [`IoStatus::Failed`].
#[allow(clippy::too_many_arguments)]
pub fn submit_retrying(
    bdev: &std::rc::Rc<dyn Bdev>,
    ch: &IoChannel,
    dir: IoDir,
    buf: &SharedBuf,
    buf_offset: usize,
    md_buf: Option<&SharedBuf>,
    md_offset: usize,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) {
    let req = RetriedIo {
        bdev: std::rc::Rc::clone(bdev),
        ch: ch.clone(),
        dir,
        buf: std::rc::Rc::clone(buf),
        buf_offset,
        md_buf: md_buf.map(std::rc::Rc::clone),
        md_offset,
        offset_blocks,
        num_blocks,
        cb: std::rc::Rc::new(std::cell::RefCell::new(Some(cb))),
    };
    submit_attempt(std::rc::Rc::new(req));
}

struct RetriedIo {
    bdev: std::rc::Rc<dyn Bdev>,
    ch: IoChannel,
    dir: IoDir,
    buf: SharedBuf,
    buf_offset: usize,
    md_buf: Option<SharedBuf>,
    md_offset: usize,
    offset_blocks: u64,
    num_blocks: u64,
    cb: std::rc::Rc<std::cell::RefCell<Option<IoCompletion>>>,
}

fn submit_attempt(req: std::rc::Rc<RetriedIo>) {
    let slot = std::rc::Rc::clone(&req.cb);
    let thin: IoCompletion = Box::new(move |status| {
        if let Some(cb) = slot.borrow_mut().take() {
            cb(status);
        }
    });

    let result = match req.dir {
        IoDir::Read => req.bdev.read_blocks_with_md(
            &req.ch,
            &req.buf,
            req.buf_offset,
            req.md_buf.as_ref(),
            req.md_offset,
            req.offset_blocks,
            req.num_blocks,
            thin,
        ),
        IoDir::Write => req.bdev.write_blocks_with_md(
            &req.ch,
            &req.buf,
            req.buf_offset,
            req.md_buf.as_ref(),
            req.md_offset,
            req.offset_blocks,
            req.num_blocks,
            thin,
        ),
    };
    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let req2 = std::rc::Rc::clone(&req);
            req.bdev
                .queue_io_wait(&req.ch, Box::new(move || submit_attempt(req2)));
        }
        Err(SubmitError::Failed) => {
            if let Some(cb) = req.cb.borrow_mut().take() {
                cb(IoStatus::Failed);
            }
        }
    }
}
