//! # In-Memory Block Device
//!
//! RAM-backed [`Bdev`] with a VSS side channel, deferred completions, and
//! fault injection. All completions are delivered through the reactor, so
//! callers observe the same asynchrony as with a real polled backing:
//!
//! - `Immediate` mode delivers each request on the next reactor tick
//! - `Manual` mode parks requests until the test releases them, which is
//!   how in-flight interleavings (write-after-write, pin deferral) are
//!   produced deterministically

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::core::buf::SharedBuf;
use crate::core::FTL_BLOCK_SIZE;
use crate::device::{Bdev, IoChannel, IoCompletion, IoStatus, SubmitError};
use crate::reactor::{ReactorRef, Task};

/// When parked requests are completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Deliver on the next reactor tick.
    Immediate,
    /// Deliver only when the test calls [`MemBdev::complete_next`] or
    /// [`MemBdev::complete_all`].
    Manual,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IoDir {
    Read,
    Write,
}

struct PendingIo {
    dir: IoDir,
    offset_blocks: u64,
    num_blocks: u64,
    buf: SharedBuf,
    buf_offset: usize,
    md_buf: Option<SharedBuf>,
    md_offset: usize,
    cb: IoCompletion,
}

// Blocks are stored sparsely so huge devices cost only what was written.
struct MemState {
    data: HashMap<u64, Box<[u8]>>,
    vss: HashMap<u64, Box<[u8]>>,
    mode: CompletionMode,
    pending: VecDeque<PendingIo>,
    fail_budget: u32,
    nomem_budget: u32,
    read_error_range: Option<(u64, u64)>,
    hotremoved: bool,
    next_channel: u32,
    delivery_armed: bool,
}

/// RAM-backed block device used by the test suite and the format path.
pub struct MemBdev {
    reactor: ReactorRef,
    num_blocks: u64,
    md_size: u32,
    zone_size: u64,
    optimal_open_zones: u64,
    state: RefCell<MemState>,
    self_weak: RefCell<Weak<MemBdev>>,
}

impl MemBdev {
    /// Create a device of `num_blocks` blocks with `md_size` bytes of VSS
    /// per block (zero disables the side channel). Zoned shape is given by
    /// `zone_size` and `optimal_open_zones`.
    pub fn new(
        reactor: ReactorRef,
        num_blocks: u64,
        md_size: u32,
        zone_size: u64,
        optimal_open_zones: u64,
    ) -> Rc<Self> {
        let bdev = Rc::new(MemBdev {
            reactor,
            num_blocks,
            md_size,
            zone_size,
            optimal_open_zones,
            state: RefCell::new(MemState {
                data: HashMap::new(),
                vss: HashMap::new(),
                mode: CompletionMode::Immediate,
                pending: VecDeque::new(),
                fail_budget: 0,
                nomem_budget: 0,
                read_error_range: None,
                hotremoved: false,
                next_channel: 0,
                delivery_armed: false,
            }),
            self_weak: RefCell::new(Weak::new()),
        });
        *bdev.self_weak.borrow_mut() = Rc::downgrade(&bdev);
        bdev
    }

    /// Switch between immediate and manual completion delivery.
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.borrow_mut().mode = mode;
    }

    /// Fail the next `n` completions.
    pub fn fail_next(&self, n: u32) {
        self.state.borrow_mut().fail_budget = n;
    }

    /// Report `NoMem` for the next `n` submissions.
    pub fn nomem_next(&self, n: u32) {
        self.state.borrow_mut().nomem_budget = n;
    }

    /// Fail every read intersecting `[offset_blocks, offset_blocks + num)`
    /// until cleared with `None`.
    pub fn set_read_error_range(&self, range: Option<(u64, u64)>) {
        self.state.borrow_mut().read_error_range = range;
    }

    /// Simulate removal of the underlying device: every further
    /// submission is rejected.
    pub fn hotremove(&self) {
        self.state.borrow_mut().hotremoved = true;
    }

    /// Number of parked requests.
    pub fn inflight(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Deliver the oldest parked request. Returns `false` when none is
    /// parked.
    pub fn complete_next(&self) -> bool {
        let io = self.state.borrow_mut().pending.pop_front();
        match io {
            Some(io) => {
                self.deliver(io);
                true
            }
            None => false,
        }
    }

    /// Deliver every parked request in submission order.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Copy raw block contents out of the device, bypassing the I/O path.
    pub fn read_raw(&self, offset_blocks: u64, num_blocks: u64) -> Vec<u8> {
        let state = self.state.borrow();
        let mut out = vec![0u8; num_blocks as usize * FTL_BLOCK_SIZE];
        for i in 0..num_blocks {
            if let Some(block) = state.data.get(&(offset_blocks + i)) {
                let at = i as usize * FTL_BLOCK_SIZE;
                out[at..at + FTL_BLOCK_SIZE].copy_from_slice(block);
            }
        }
        out
    }

    /// Overwrite raw block contents, bypassing the I/O path.
    pub fn write_raw(&self, offset_blocks: u64, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() % FTL_BLOCK_SIZE, 0);
        let mut state = self.state.borrow_mut();
        for (i, chunk) in bytes.chunks(FTL_BLOCK_SIZE).enumerate() {
            state
                .data
                .insert(offset_blocks + i as u64, chunk.to_vec().into_boxed_slice());
        }
    }

    /// Copy raw VSS contents out of the device.
    pub fn read_raw_vss(&self, offset_blocks: u64, num_blocks: u64) -> Vec<u8> {
        let state = self.state.borrow();
        let vss = self.md_size as usize;
        let mut out = vec![0u8; num_blocks as usize * vss];
        for i in 0..num_blocks {
            if let Some(rec) = state.vss.get(&(offset_blocks + i)) {
                let at = i as usize * vss;
                out[at..at + vss].copy_from_slice(rec);
            }
        }
        out
    }

    fn arm_delivery(&self) {
        let mut state = self.state.borrow_mut();
        if state.mode != CompletionMode::Immediate || state.delivery_armed {
            return;
        }
        state.delivery_armed = true;
        drop(state);

        let weak = self.self_weak.borrow().clone();
        self.reactor.send_msg(Box::new(move || {
            if let Some(bdev) = weak.upgrade() {
                bdev.state.borrow_mut().delivery_armed = false;
                bdev.complete_all();
            }
        }));
    }

    fn deliver(&self, io: PendingIo) {
        let status = {
            let mut state = self.state.borrow_mut();
            if state.fail_budget > 0 {
                state.fail_budget -= 1;
                IoStatus::Failed
            } else if io.dir == IoDir::Read && intersects(state.read_error_range, &io) {
                IoStatus::Failed
            } else {
                transfer(&mut state, &io, self.md_size as usize);
                IoStatus::Success
            }
        };
        (io.cb)(status);
    }

    fn submit(&self, io: PendingIo) -> Result<(), SubmitError> {
        {
            let mut state = self.state.borrow_mut();
            if state.hotremoved {
                return Err(SubmitError::Failed);
            }
            if io.offset_blocks + io.num_blocks > self.num_blocks {
                return Err(SubmitError::Failed);
            }
            if state.nomem_budget > 0 {
                state.nomem_budget -= 1;
                return Err(SubmitError::NoMem);
            }
            state.pending.push_back(io);
        }
        self.arm_delivery();
        Ok(())
    }
}

fn intersects(range: Option<(u64, u64)>, io: &PendingIo) -> bool {
    match range {
        Some((start, num)) => {
            io.offset_blocks < start + num && start < io.offset_blocks + io.num_blocks
        }
        None => false,
    }
}

fn transfer(state: &mut MemState, io: &PendingIo, vss_size: usize) {
    match io.dir {
        IoDir::Read => {
            let mut buf = io.buf.borrow_mut();
            for i in 0..io.num_blocks {
                let at = io.buf_offset + i as usize * FTL_BLOCK_SIZE;
                let dst = &mut buf.as_mut_slice()[at..at + FTL_BLOCK_SIZE];
                match state.data.get(&(io.offset_blocks + i)) {
                    Some(block) => dst.copy_from_slice(block),
                    None => dst.fill(0),
                }
            }
            drop(buf);
            if let Some(md) = &io.md_buf {
                let mut md = md.borrow_mut();
                for i in 0..io.num_blocks {
                    let at = io.md_offset + i as usize * vss_size;
                    let dst = &mut md.as_mut_slice()[at..at + vss_size];
                    match state.vss.get(&(io.offset_blocks + i)) {
                        Some(rec) => dst.copy_from_slice(rec),
                        None => dst.fill(0),
                    }
                }
            }
        }
        IoDir::Write => {
            let buf = io.buf.borrow();
            for i in 0..io.num_blocks {
                let at = io.buf_offset + i as usize * FTL_BLOCK_SIZE;
                let src = &buf.as_slice()[at..at + FTL_BLOCK_SIZE];
                state
                    .data
                    .insert(io.offset_blocks + i, src.to_vec().into_boxed_slice());
            }
            if vss_size == 0 {
                return;
            }
            match &io.md_buf {
                Some(md) => {
                    let md = md.borrow();
                    for i in 0..io.num_blocks {
                        let at = io.md_offset + i as usize * vss_size;
                        let src = &md.as_slice()[at..at + vss_size];
                        state
                            .vss
                            .insert(io.offset_blocks + i, src.to_vec().into_boxed_slice());
                    }
                }
                None => {
                    for i in 0..io.num_blocks {
                        state.vss.remove(&(io.offset_blocks + i));
                    }
                }
            }
        }
    }
}

impl Bdev for MemBdev {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn block_size(&self) -> u32 {
        FTL_BLOCK_SIZE as u32
    }

    fn md_size(&self) -> u32 {
        self.md_size
    }

    fn zone_size(&self) -> u64 {
        self.zone_size
    }

    fn optimal_open_zones(&self) -> u64 {
        self.optimal_open_zones
    }

    fn open_channel(&self) -> IoChannel {
        let mut state = self.state.borrow_mut();
        state.next_channel += 1;
        IoChannel {
            id: state.next_channel,
        }
    }

    fn read_blocks_with_md(
        &self,
        _ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        md_buf: Option<&SharedBuf>,
        md_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(PendingIo {
            dir: IoDir::Read,
            offset_blocks,
            num_blocks,
            buf: Rc::clone(buf),
            buf_offset,
            md_buf: md_buf.map(Rc::clone),
            md_offset,
            cb,
        })
    }

    fn write_blocks_with_md(
        &self,
        _ch: &IoChannel,
        buf: &SharedBuf,
        buf_offset: usize,
        md_buf: Option<&SharedBuf>,
        md_offset: usize,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(PendingIo {
            dir: IoDir::Write,
            offset_blocks,
            num_blocks,
            buf: Rc::clone(buf),
            buf_offset,
            md_buf: md_buf.map(Rc::clone),
            md_offset,
            cb,
        })
    }

    fn queue_io_wait(&self, _ch: &IoChannel, waiter: Task) {
        // Request memory frees up by the next scheduling round at the
        // latest; retry then.
        self.reactor.send_msg(waiter);
    }
}
