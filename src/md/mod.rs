//! # Metadata Object Manager
//!
//! A metadata object binds an in-memory buffer (heap or shared memory) to
//! an on-disk layout region and moves data between them:
//!
//! - `persist` writes the buffer out in transfer-unit chunks, mirror
//!   first when the region is mirrored
//! - `restore` reads the region in, falling back to the mirror on a
//!   primary failure and resynchronizing the primary afterwards; a dirty
//!   shutdown resynchronizes the mirror even when the primary reads fine
//! - `clear` stamps a repeating pattern (plus VSS pattern) across the
//!   region
//! - `persist_entry`/`read_entry` move single fixed-size records, with
//!   write-through to the mirror and read fallback from it
//!
//! Every operation is asynchronous: submission returns immediately and
//! the caller's callback fires from the reactor once the state machine
//! unwinds. Transient device memory pressure re-queues through the bdev
//! wait list; any other failure unwinds with an error status.

pub mod shm;
pub mod vss;

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use uuid::Uuid;

use crate::config::ShmMode;
use crate::core::buf::{shared_buf, SharedBuf};
use crate::core::{FTL_BLOCK_SIZE, FTL_MD_VSS_SZ};
use crate::device::{Bdev, IoChannel, IoStatus, SubmitError};
use crate::layout::{DeviceSel, LayoutRegion};
use crate::md::vss::VssPattern;
use crate::reactor::ReactorRef;

/// Metadata subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MdError {
    /// The object is not configured for the requested operation.
    #[error("invalid metadata operation: {0}")]
    Invalid(&'static str),

    /// Allocation of a buffer or shared-memory object failed.
    #[error("metadata allocation failed: {0}")]
    NoMem(String),

    /// The backing device failed the transfer.
    #[error("metadata I/O failed")]
    Io,
}

/// Completion callback of a whole-region operation.
pub type MdCb = Box<dyn FnOnce(Result<(), MdError>)>;

/// Completion callback of an entry operation. Shared so a retry can fire
/// it again.
pub type MdEntryCb = Rc<dyn Fn(Result<(), MdError>)>;

/// Shared handle to a metadata object.
pub type MdRef = Rc<RefCell<Md>>;

/// Buffer placement selected at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MdCreateFlags {
    /// Back the buffer with a named shared-memory object.
    pub shm: bool,
    /// Truncate/initialize the shared-memory object instead of attaching.
    pub shm_new: bool,
    /// Place the object on hugetlbfs and register it with the I/O
    /// allocator.
    pub shm_huge: bool,
    /// Create the handle without any buffer.
    pub no_mem: bool,
}

impl MdCreateFlags {
    /// Plain heap buffer.
    pub fn heap() -> Self {
        MdCreateFlags::default()
    }

    /// Shared-memory buffer; `new` truncates an existing object.
    pub fn shared(new: bool, huge: bool) -> Self {
        MdCreateFlags {
            shm: true,
            shm_new: new,
            shm_huge: huge,
            no_mem: false,
        }
    }

    /// Handle without a data buffer.
    pub fn no_mem() -> Self {
        MdCreateFlags {
            no_mem: true,
            ..MdCreateFlags::default()
        }
    }

    /// Flags matching a configured shared-memory mode.
    pub fn from_shm_mode(mode: ShmMode, new: bool) -> Self {
        match mode {
            ShmMode::Off => MdCreateFlags::heap(),
            ShmMode::On => MdCreateFlags::shared(new, false),
            ShmMode::Huge => MdCreateFlags::shared(new, true),
        }
    }
}

/// Everything a metadata operation needs from the device: the reactor,
/// both backings with their channels, the transfer unit, and the clean
/// flag of the last shutdown.
#[derive(Clone)]
pub struct MdEnv {
    /// Core-thread reactor.
    pub reactor: ReactorRef,
    /// Cache-device backing.
    pub cache_bdev: Rc<dyn Bdev>,
    /// Base-device backing.
    pub base_bdev: Rc<dyn Bdev>,
    /// Cache-device channel of the core thread.
    pub cache_ch: IoChannel,
    /// Base-device channel of the core thread.
    pub base_ch: IoChannel,
    /// Blocks moved per metadata I/O (`4 x xfer_size`).
    pub xfer_blocks: u64,
    /// Whether the previous shutdown was clean; drives mirror resync on
    /// restore.
    pub sb_clean: Rc<Cell<bool>>,
}

impl MdEnv {
    fn bdev(&self, sel: DeviceSel) -> (&Rc<dyn Bdev>, &IoChannel) {
        match sel {
            DeviceSel::Cache => (&self.cache_bdev, &self.cache_ch),
            DeviceSel::Base => (&self.base_bdev, &self.base_ch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MdOp {
    Restore,
    Persist,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Only or final leg, against the primary region.
    Primary,
    /// First leg of a mirrored persist/clear, against the mirror.
    MirrorFirst,
    /// Restore retry against the mirror after a primary failure.
    MirrorFallback,
    /// Persist of the primary after a successful mirror fallback.
    ResyncPrimary,
    /// Persist of the mirror after a dirty-shutdown restore.
    ResyncMirror,
}

struct IoCtx {
    op: MdOp,
    phase: Phase,
    region: LayoutRegion,
    address: u64,
    left: u64,
    data_offset: usize,
    status: Option<MdError>,
    pattern: Option<SharedBuf>,
    pattern_vss: Option<SharedBuf>,
    cb: Option<MdCb>,
}

/// A metadata object.
pub struct Md {
    name: String,
    data_blocks: u64,
    vss_blksz: u32,
    buf: Option<SharedBuf>,
    shm: Option<shm::ShmBacking>,
    region: Option<LayoutRegion>,
    mirror_region: Option<LayoutRegion>,
    mirror_on: bool,
    io: Option<IoCtx>,
    /// Whether the shared-memory object carried warm contents from a
    /// previous run.
    pub shm_reused: bool,
}

impl Md {
    /// Create an object holding `blocks` blocks of data plus `vss_blksz`
    /// bytes of VSS per block.
    pub fn create(
        uuid: &Uuid,
        blocks: u64,
        vss_blksz: u32,
        name: &str,
        flags: MdCreateFlags,
        shm_dir: Option<&Path>,
    ) -> Result<MdRef, MdError> {
        let data_len = blocks as usize * FTL_BLOCK_SIZE;
        let total_len = data_len + blocks as usize * vss_blksz as usize;

        let mut shm_backing = None;
        let mut shm_reused = false;
        let buf = if flags.no_mem {
            None
        } else if flags.shm {
            let default_dir: PathBuf = if flags.shm_huge {
                PathBuf::from(shm::SHM_HUGE_DIR)
            } else {
                PathBuf::from(shm::SHM_DIR)
            };
            let dir = shm_dir.map(Path::to_path_buf).unwrap_or(default_dir);
            let (backing, buffer) =
                shm::ShmBacking::open(&dir, uuid, name, total_len, flags.shm_new)
                    .map_err(|e| MdError::NoMem(e.to_string()))?;
            shm_reused = backing.reused;
            shm_backing = Some(backing);
            Some(Rc::new(RefCell::new(buffer)))
        } else {
            Some(shared_buf(total_len))
        };

        Ok(Rc::new(RefCell::new(Md {
            name: name.to_string(),
            data_blocks: blocks,
            vss_blksz,
            buf,
            shm: shm_backing,
            region: None,
            mirror_region: None,
            mirror_on: true,
            io: None,
            shm_reused,
        })))
    }

    /// Tear the object down, unlinking any shared-memory backing.
    pub fn destroy(md: &MdRef) {
        Md::free_buf(md);
    }

    /// Drop the data buffer and its backing.
    pub fn free_buf(md: &MdRef) {
        let mut this = md.borrow_mut();
        if let (Some(mut backing), Some(buf)) = (this.shm.take(), this.buf.as_ref()) {
            backing.unlock_pages(&buf.borrow());
            backing.unlink();
        }
        this.buf = None;
    }

    /// Remove a named shared-memory object without instantiating it.
    pub fn unlink(shm_dir: &Path, uuid: &Uuid, name: &str) -> std::io::Result<()> {
        shm::unlink_object(shm_dir, uuid, name)
    }

    /// Object name.
    pub fn name(md: &MdRef) -> String {
        md.borrow().name.clone()
    }

    /// Bind the object to a layout region, with its resolved mirror.
    ///
    /// The region must fit inside the object's buffer.
    pub fn set_region(
        md: &MdRef,
        region: &LayoutRegion,
        mirror: Option<&LayoutRegion>,
    ) -> Result<(), MdError> {
        let mut this = md.borrow_mut();
        if region.length_blocks > this.data_blocks {
            return Err(MdError::Invalid("region larger than object buffer"));
        }
        debug_assert_eq!(region.mirror_type.is_some(), mirror.is_some());
        this.region = Some(region.clone());
        this.mirror_region = mirror.cloned();

        // A fresh region binding stamps the version into the whole VSS
        // area so every future persist carries it.
        if this.vss_blksz as usize >= FTL_MD_VSS_SZ {
            let vss_offset = this.data_blocks as usize * FTL_BLOCK_SIZE;
            let pattern = VssPattern::with_version(region.version);
            if let Some(buf) = &this.buf {
                let mut buf = buf.borrow_mut();
                let vss_len = this.data_blocks as usize * FTL_MD_VSS_SZ;
                vss::init_buf(
                    &mut buf.as_mut_slice()[vss_offset..vss_offset + vss_len],
                    &pattern,
                );
            }
        }
        Ok(())
    }

    /// Bound region, when set.
    pub fn region(md: &MdRef) -> Option<LayoutRegion> {
        md.borrow().region.clone()
    }

    /// Shared handle to the object's buffer.
    ///
    /// The data area spans `[0, data_blocks * FTL_BLOCK_SIZE)`; the VSS
    /// area follows it.
    pub fn buffer(md: &MdRef) -> Option<SharedBuf> {
        md.borrow().buf.clone()
    }

    /// Data-area length in bytes.
    pub fn data_len(md: &MdRef) -> usize {
        md.borrow().data_blocks as usize * FTL_BLOCK_SIZE
    }

    /// Byte offset of the VSS area inside the buffer, when present.
    pub fn vss_offset(md: &MdRef) -> Option<usize> {
        let this = md.borrow();
        if this.vss_blksz as usize >= FTL_MD_VSS_SZ {
            Some(this.data_blocks as usize * FTL_BLOCK_SIZE)
        } else {
            None
        }
    }

    /// Heap-allocate a VSS buffer of `count` records stamped with the
    /// region version.
    pub fn vss_buf_alloc(region: &LayoutRegion, count: usize) -> SharedBuf {
        let buf = shared_buf(count * FTL_MD_VSS_SZ);
        {
            let mut guard = buf.borrow_mut();
            vss::init_buf(guard.as_mut_slice(), &VssPattern::with_version(region.version));
        }
        buf
    }

    /// Disable or re-enable the mirror leg; restore uses this while
    /// resynchronizing the primary.
    pub fn set_mirror_enabled(md: &MdRef, on: bool) {
        md.borrow_mut().mirror_on = on;
    }

    fn has_mirror(&self) -> bool {
        self.mirror_on && self.region.as_ref().is_some_and(|r| r.mirror_type.is_some())
            && self.mirror_region.is_some()
    }

    /// Persist the buffer to the bound region.
    pub fn persist(md: &MdRef, env: &MdEnv, cb: MdCb) {
        let (first_region, phase) = {
            let this = md.borrow();
            if this.has_mirror() {
                (this.mirror_region.clone().unwrap(), Phase::MirrorFirst)
            } else {
                match this.region.clone() {
                    Some(region) => (region, Phase::Primary),
                    None => {
                        drop(this);
                        exception(env, cb);
                        return;
                    }
                }
            }
        };
        if io_start(md, MdOp::Persist, phase, first_region, None, None, cb, env).is_ok() {
            io_submit(md, env);
        }
    }

    /// Restore the buffer from the bound region.
    pub fn restore(md: &MdRef, env: &MdEnv, cb: MdCb) {
        let region = {
            let this = md.borrow();
            match this.region.clone() {
                Some(region) => region,
                None => {
                    drop(this);
                    exception(env, cb);
                    return;
                }
            }
        };
        if io_start(md, MdOp::Restore, Phase::Primary, region, None, None, cb, env).is_ok() {
            io_submit(md, env);
        }
    }

    /// Fill the bound region with `pattern` repeated, stamping
    /// `vss_pattern` (or a zeroed record carrying the region version)
    /// into the side channel.
    pub fn clear(
        md: &MdRef,
        env: &MdEnv,
        pattern: &[u8],
        vss_pattern: Option<VssPattern>,
        cb: MdCb,
    ) {
        let xfer_bytes = env.xfer_blocks as usize * FTL_BLOCK_SIZE;
        if pattern.is_empty() || pattern.len() > xfer_bytes || xfer_bytes % pattern.len() != 0 {
            exception(env, cb);
            return;
        }

        let (first_region, phase, version, wants_vss) = {
            let this = md.borrow();
            let Some(region) = this.region.clone() else {
                drop(this);
                exception(env, cb);
                return;
            };
            let wants_vss = region.vss_blksz as usize >= FTL_MD_VSS_SZ;
            if this.has_mirror() {
                (
                    this.mirror_region.clone().unwrap(),
                    Phase::MirrorFirst,
                    region.version,
                    wants_vss,
                )
            } else {
                (region.clone(), Phase::Primary, region.version, wants_vss)
            }
        };

        let staging = shared_buf(xfer_bytes);
        {
            let mut guard = staging.borrow_mut();
            for chunk in guard.as_mut_slice().chunks_mut(pattern.len()) {
                chunk.copy_from_slice(pattern);
            }
        }
        let staging_vss = wants_vss.then(|| {
            let buf = shared_buf(env.xfer_blocks as usize * FTL_MD_VSS_SZ);
            let rec = vss_pattern.unwrap_or_else(|| VssPattern::with_version(version));
            vss::init_buf(buf.borrow_mut().as_mut_slice(), &rec);
            buf
        });

        if io_start(
            md,
            MdOp::Clear,
            phase,
            first_region,
            Some(staging),
            staging_vss,
            cb,
            env,
        )
        .is_ok()
        {
            io_submit(md, env);
        }
    }
}

fn exception(env: &MdEnv, cb: MdCb) {
    env.reactor.send_msg(Box::new(move || {
        cb(Err(MdError::Invalid("metadata object not ready")))
    }));
}

#[allow(clippy::too_many_arguments)]
fn io_start(
    md: &MdRef,
    op: MdOp,
    phase: Phase,
    region: LayoutRegion,
    pattern: Option<SharedBuf>,
    pattern_vss: Option<SharedBuf>,
    cb: MdCb,
    env: &MdEnv,
) -> Result<(), ()> {
    let mut this = md.borrow_mut();
    if this.io.is_some() || (op != MdOp::Clear && this.buf.is_none()) {
        drop(this);
        exception(env, cb);
        return Err(());
    }
    this.io = Some(IoCtx {
        op,
        phase,
        address: region.offset_blocks,
        left: region.length_blocks,
        region,
        data_offset: 0,
        status: None,
        pattern,
        pattern_vss,
        cb: Some(cb),
    });
    Ok(())
}

/// Re-arm the in-flight context for the next leg of a mirrored dance.
fn io_continue(md: &MdRef, op: MdOp, phase: Phase, region: LayoutRegion) {
    let mut this = md.borrow_mut();
    let io = this.io.as_mut().expect("metadata continuation without context");
    io.op = op;
    io.phase = phase;
    io.address = region.offset_blocks;
    io.left = region.length_blocks;
    io.region = region;
    io.data_offset = 0;
    io.status = None;
}

fn io_submit(md: &MdRef, env: &MdEnv) {
    let (op, region, address, blocks, data_offset, idle) = {
        let this = md.borrow();
        let io = this.io.as_ref().expect("metadata submit without context");
        let idle = io.left == 0 || io.status.is_some();
        (
            io.op,
            io.region.clone(),
            io.address,
            io.left.min(env.xfer_blocks),
            io.data_offset,
            idle,
        )
    };
    if idle {
        io_done(md, env);
        return;
    }

    let (buf, buf_offset, md_buf, md_offset) = {
        let this = md.borrow();
        let io = this.io.as_ref().unwrap();
        match op {
            MdOp::Clear => (
                io.pattern.clone().expect("clear without pattern staging"),
                0usize,
                io.pattern_vss.clone(),
                0usize,
            ),
            MdOp::Persist | MdOp::Restore => {
                let buf = this.buf.clone().expect("metadata I/O without buffer");
                let vss_present = this.vss_blksz as usize >= FTL_MD_VSS_SZ;
                let md_buf = vss_present.then(|| buf.clone());
                let md_offset = this.data_blocks as usize * FTL_BLOCK_SIZE
                    + (data_offset / FTL_BLOCK_SIZE) * FTL_MD_VSS_SZ;
                (buf, data_offset, md_buf, md_offset)
            }
        }
    };

    let (bdev, ch) = env.bdev(region.device);
    let md2 = Rc::clone(md);
    let env2 = env.clone();
    let cb: crate::device::IoCompletion = Box::new(move |status| {
        on_block_io_done(&md2, &env2, status, blocks);
    });

    let result = match op {
        MdOp::Restore => bdev.read_blocks_with_md(
            ch,
            &buf,
            buf_offset,
            md_buf.as_ref(),
            md_offset,
            address,
            blocks,
            cb,
        ),
        MdOp::Persist | MdOp::Clear => bdev.write_blocks_with_md(
            ch,
            &buf,
            buf_offset,
            md_buf.as_ref(),
            md_offset,
            address,
            blocks,
            cb,
        ),
    };

    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let md3 = Rc::clone(md);
            let env3 = env.clone();
            let (bdev, ch) = env.bdev(region.device);
            bdev.queue_io_wait(ch, Box::new(move || io_submit(&md3, &env3)));
        }
        Err(SubmitError::Failed) => {
            md.borrow_mut().io.as_mut().unwrap().status = Some(MdError::Io);
            io_done(md, env);
        }
    }
}

fn on_block_io_done(md: &MdRef, env: &MdEnv, status: IoStatus, blocks: u64) {
    {
        let mut this = md.borrow_mut();
        let Some(io) = this.io.as_mut() else {
            return;
        };
        if status.is_ok() {
            io.address += blocks;
            io.left -= blocks;
            io.data_offset += blocks as usize * FTL_BLOCK_SIZE;
        } else {
            io.status = Some(MdError::Io);
        }
    }

    #[cfg(debug_assertions)]
    audit_vss_version(md, blocks);

    io_submit(md, env);
}

#[cfg(debug_assertions)]
fn audit_vss_version(md: &MdRef, blocks: u64) {
    let this = md.borrow();
    let Some(io) = this.io.as_ref() else { return };
    if io.op != MdOp::Restore || io.status.is_some() {
        return;
    }
    if this.vss_blksz as usize >= FTL_MD_VSS_SZ {
        let buf = this.buf.as_ref().unwrap().borrow();
        let vss_base = this.data_blocks as usize * FTL_BLOCK_SIZE;
        let done_blocks = io.data_offset / FTL_BLOCK_SIZE;
        for blk in done_blocks.saturating_sub(blocks as usize)..done_blocks {
            let rec = vss::record(&buf.as_slice()[vss_base..], blk);
            debug_assert_eq!(vss::version(rec), io.region.version);
        }
    }
}

fn io_done(md: &MdRef, env: &MdEnv) {
    let (op, phase, error, has_mirror, primary, mirror) = {
        let this = md.borrow();
        let io = this.io.as_ref().expect("metadata completion without context");
        (
            io.op,
            io.phase,
            io.status.clone(),
            this.has_mirror(),
            this.region.clone(),
            this.mirror_region.clone(),
        )
    };

    match (op, phase) {
        (MdOp::Persist | MdOp::Clear, Phase::MirrorFirst) => {
            if error.is_some() {
                finish(md, env, Err(MdError::Io));
            } else {
                io_continue(md, op, Phase::Primary, primary.unwrap());
                io_submit(md, env);
            }
        }
        (MdOp::Restore, Phase::Primary) => {
            if let Some(err) = error {
                if has_mirror {
                    log::warn!(
                        "restore of {} failed on primary, falling back to mirror",
                        md.borrow().name
                    );
                    io_continue(md, MdOp::Restore, Phase::MirrorFallback, mirror.unwrap());
                    io_submit(md, env);
                } else {
                    finish(md, env, Err(err));
                }
            } else if !env.sb_clean.get() && has_mirror {
                // Dirty shutdown: the mirror may be stale, bring it back
                // in sync with the primary before reporting success.
                io_continue(md, MdOp::Persist, Phase::ResyncMirror, mirror.unwrap());
                io_submit(md, env);
            } else {
                finish(md, env, Ok(()));
            }
        }
        (MdOp::Restore, Phase::MirrorFallback) => {
            if error.is_some() {
                finish(md, env, Err(MdError::Io));
            } else {
                io_continue(md, MdOp::Persist, Phase::ResyncPrimary, primary.unwrap());
                io_submit(md, env);
            }
        }
        (MdOp::Persist, Phase::ResyncPrimary | Phase::ResyncMirror)
        | (MdOp::Persist | MdOp::Clear, Phase::Primary) => {
            finish(md, env, error.map_or(Ok(()), Err));
        }
        _ => unreachable!("invalid metadata state machine transition"),
    }
}

fn finish(md: &MdRef, env: &MdEnv, result: Result<(), MdError>) {
    let cb = {
        let mut this = md.borrow_mut();
        let mut io = this.io.take().expect("metadata finish without context");
        io.cb.take().expect("metadata finish without callback")
    };
    env.reactor.send_msg(Box::new(move || cb(result)));
}

// ---------------------------------------------------------------------------
// Entry-granular operations
// ---------------------------------------------------------------------------

/// Reusable context of an entry operation; keeps everything needed to
/// retry a failed persist.
pub struct MdEntryCtx {
    remaining: u32,
    status: Option<MdError>,
    start_entry: u64,
    buf: SharedBuf,
    vss_buf: Option<SharedBuf>,
    cb: MdEntryCb,
}

/// Shared handle to an entry-operation context.
pub type MdEntryCtxRef = Rc<RefCell<MdEntryCtx>>;

fn entry_io_params(start_entry: u64, region: &LayoutRegion) -> (u64, u64) {
    let address = region.offset_blocks + start_entry * region.entry_size;
    (address, region.entry_size)
}

fn entry_write_leg(md: &MdRef, env: &MdEnv, ctx: &MdEntryCtxRef, region: LayoutRegion) {
    let (address, blocks) = {
        let guard = ctx.borrow();
        entry_io_params(guard.start_entry, &region)
    };
    let (buf, vss_buf) = {
        let guard = ctx.borrow();
        (guard.buf.clone(), guard.vss_buf.clone())
    };

    let (bdev, ch) = env.bdev(region.device);
    let ctx2 = Rc::clone(ctx);
    let cb: crate::device::IoCompletion = Box::new(move |status| {
        entry_write_done(&ctx2, status);
    });

    let result = bdev.write_blocks_with_md(
        ch,
        &buf,
        0,
        vss_buf.as_ref(),
        0,
        address,
        blocks,
        cb,
    );
    if let Err(err) = result {
        match err {
            SubmitError::NoMem => {
                let md2 = Rc::clone(md);
                let env2 = env.clone();
                let ctx2 = Rc::clone(ctx);
                let (bdev, ch) = env.bdev(region.device);
                bdev.queue_io_wait(
                    ch,
                    Box::new(move || entry_write_leg(&md2, &env2, &ctx2, region)),
                );
            }
            SubmitError::Failed => entry_write_done(ctx, IoStatus::Failed),
        }
    }
}

fn entry_write_done(ctx: &MdEntryCtxRef, status: IoStatus) {
    let fire = {
        let mut guard = ctx.borrow_mut();
        debug_assert!(guard.remaining > 0);
        guard.remaining -= 1;
        if !status.is_ok() {
            guard.status = Some(MdError::Io);
        }
        guard.remaining == 0
    };
    if fire {
        let (cb, result) = {
            let guard = ctx.borrow();
            (Rc::clone(&guard.cb), guard.status.clone().map_or(Ok(()), Err))
        };
        cb(result);
    }
}

impl Md {
    /// Persist one `entry_size` record at `start_entry`, writing through
    /// to the mirror when the region is mirrored. Returns the context to
    /// hand back to [`Md::persist_entry_retry`] on failure.
    pub fn persist_entry(
        md: &MdRef,
        env: &MdEnv,
        start_entry: u64,
        buf: SharedBuf,
        vss_buf: Option<SharedBuf>,
        cb: MdEntryCb,
    ) -> MdEntryCtxRef {
        let ctx = Rc::new(RefCell::new(MdEntryCtx {
            remaining: 0,
            status: None,
            start_entry,
            buf,
            vss_buf,
            cb,
        }));
        Md::persist_entry_retry(md, env, &ctx);
        ctx
    }

    /// Re-run a persist-entry operation with its prior context.
    pub fn persist_entry_retry(md: &MdRef, env: &MdEnv, ctx: &MdEntryCtxRef) {
        let (primary, mirror) = {
            let this = md.borrow();
            let region = this.region.clone().expect("entry persist without region");
            assert!(region.entry_size > 0, "region not configured for entries");
            let mirror = this.has_mirror().then(|| this.mirror_region.clone().unwrap());
            (region, mirror)
        };

        {
            let mut guard = ctx.borrow_mut();
            guard.status = None;
            guard.remaining = 1 + u32::from(mirror.is_some());
        }
        entry_write_leg(md, env, ctx, primary);
        if let Some(mirror) = mirror {
            entry_write_leg(md, env, ctx, mirror);
        }
    }

    /// Read one record at `start_entry` into `buf`/`vss_buf`, falling
    /// back to the mirror when the primary read fails.
    pub fn read_entry(
        md: &MdRef,
        env: &MdEnv,
        start_entry: u64,
        buf: SharedBuf,
        vss_buf: Option<SharedBuf>,
        cb: MdEntryCb,
    ) {
        let (primary, mirror) = {
            let this = md.borrow();
            let region = this.region.clone().expect("entry read without region");
            assert!(region.entry_size > 0, "region not configured for entries");
            let mirror = this.has_mirror().then(|| this.mirror_region.clone().unwrap());
            (region, mirror)
        };
        entry_read_leg(md, env, start_entry, buf, vss_buf, cb, primary, mirror);
    }
}

#[allow(clippy::too_many_arguments)]
fn entry_read_leg(
    md: &MdRef,
    env: &MdEnv,
    start_entry: u64,
    buf: SharedBuf,
    vss_buf: Option<SharedBuf>,
    cb: MdEntryCb,
    region: LayoutRegion,
    fallback: Option<LayoutRegion>,
) {
    let (address, blocks) = entry_io_params(start_entry, &region);
    let (bdev, ch) = env.bdev(region.device);

    let md2 = Rc::clone(md);
    let env2 = env.clone();
    let buf2 = buf.clone();
    let vss2 = vss_buf.clone();
    let cb2 = Rc::clone(&cb);
    let fallback2 = fallback.clone();
    let io_cb: crate::device::IoCompletion = Box::new(move |status| {
        if status.is_ok() {
            cb2(Ok(()));
        } else if let Some(mirror) = fallback2 {
            log::warn!("entry read fell back to mirror region {}", mirror.rtype.name());
            entry_read_leg(&md2, &env2, start_entry, buf2, vss2, cb2, mirror, None);
        } else {
            cb2(Err(MdError::Io));
        }
    });

    let result =
        bdev.read_blocks_with_md(ch, &buf, 0, vss_buf.as_ref(), 0, address, blocks, io_cb);
    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let md2 = Rc::clone(md);
            let env2 = env.clone();
            let (bdev, ch) = env.bdev(region.device);
            bdev.queue_io_wait(
                ch,
                Box::new(move || {
                    entry_read_leg(&md2, &env2, start_entry, buf, vss_buf, cb, region, fallback)
                }),
            );
        }
        Err(SubmitError::Failed) => cb(Err(MdError::Io)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mem::MemBdev;
    use crate::layout::RegionType;
    use crate::reactor::Reactor;

    fn env_with(cache: Rc<MemBdev>, base: Rc<MemBdev>, reactor: ReactorRef) -> MdEnv {
        MdEnv {
            reactor,
            cache_ch: cache.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: cache,
            base_bdev: base,
            xfer_blocks: 8,
            sb_clean: Rc::new(Cell::new(true)),
        }
    }

    fn region(rtype: RegionType, offset: u64, blocks: u64, mirror: Option<RegionType>) -> LayoutRegion {
        LayoutRegion {
            rtype,
            device: DeviceSel::Cache,
            offset_blocks: offset,
            length_blocks: blocks,
            version: 1,
            entry_size: 1,
            num_entries: blocks,
            vss_blksz: 64,
            mirror_type: mirror,
        }
    }

    struct Fixture {
        reactor: ReactorRef,
        cache: Rc<MemBdev>,
        env: MdEnv,
        md: MdRef,
    }

    fn fixture(blocks: u64, mirrored: bool) -> Fixture {
        let reactor = Reactor::new();
        let cache = MemBdev::new(Rc::clone(&reactor), 4096, 64, 0, 0);
        let base = MemBdev::new(Rc::clone(&reactor), 4096, 0, 256, 2);
        let env = env_with(Rc::clone(&cache), base, Rc::clone(&reactor));

        let uuid = Uuid::new_v4();
        let md = Md::create(&uuid, blocks, 64, "band_md", MdCreateFlags::heap(), None).unwrap();
        let (primary, mirror) = if mirrored {
            (
                region(RegionType::BandMd, 64, blocks, Some(RegionType::BandMdMirror)),
                Some(region(RegionType::BandMdMirror, 256, blocks, None)),
            )
        } else {
            (region(RegionType::BandMd, 64, blocks, None), None)
        };
        Md::set_region(&md, &primary, mirror.as_ref()).unwrap();
        Fixture {
            reactor,
            cache,
            env,
            md,
        }
    }

    fn run_op(fx: &Fixture, op: impl FnOnce(&MdRef, &MdEnv, MdCb)) -> Result<(), MdError> {
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        op(&fx.md, &fx.env, Box::new(move |st| *r2.borrow_mut() = Some(st)));
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        let out = result.borrow_mut().take().unwrap();
        out
    }

    fn fill_data(md: &MdRef, byte: u8) {
        let buf = Md::buffer(md).unwrap();
        let len = Md::data_len(md);
        buf.borrow_mut().as_mut_slice()[..len].fill(byte);
    }

    #[test]
    fn test_persist_then_restore_round_trip() {
        let fx = fixture(16, false);
        fill_data(&fx.md, 0xA7);
        run_op(&fx, Md::persist).unwrap();

        fill_data(&fx.md, 0);
        run_op(&fx, Md::restore).unwrap();

        let buf = Md::buffer(&fx.md).unwrap();
        let len = Md::data_len(&fx.md);
        assert!(buf.borrow().as_slice()[..len].iter().all(|&b| b == 0xA7));
    }

    #[test]
    fn test_persist_writes_mirror_first() {
        let fx = fixture(16, true);
        fill_data(&fx.md, 0x42);
        run_op(&fx, Md::persist).unwrap();

        // Both copies match the buffer afterwards.
        assert!(fx.cache.read_raw(64, 16).iter().all(|&b| b == 0x42));
        assert!(fx.cache.read_raw(256, 16).iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_persist_mirror_failure_skips_primary() {
        let fx = fixture(16, true);
        fill_data(&fx.md, 0x42);
        fx.cache.fail_next(1);
        assert_eq!(run_op(&fx, Md::persist), Err(MdError::Io));
        // Primary region untouched.
        assert!(fx.cache.read_raw(64, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_restore_falls_back_to_mirror_and_resyncs() {
        let fx = fixture(16, true);
        fill_data(&fx.md, 0x55);
        run_op(&fx, Md::persist).unwrap();

        // Corrupt the primary: reads in its range fail.
        fx.cache.set_read_error_range(Some((64, 16)));
        fill_data(&fx.md, 0);
        run_op(&fx, Md::restore).unwrap();

        let buf = Md::buffer(&fx.md).unwrap();
        assert!(buf.borrow().as_slice()[..16 * FTL_BLOCK_SIZE]
            .iter()
            .all(|&b| b == 0x55));

        // The fallback rewrote the primary from the mirror contents.
        fx.cache.set_read_error_range(None);
        assert!(fx.cache.read_raw(64, 16).iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_dirty_shutdown_restore_resyncs_mirror() {
        let fx = fixture(16, true);
        fill_data(&fx.md, 0x66);
        run_op(&fx, Md::persist).unwrap();

        // Stale mirror plus a dirty shutdown flag.
        fx.cache.write_raw(256, &vec![0u8; 16 * FTL_BLOCK_SIZE]);
        fx.env.sb_clean.set(false);
        run_op(&fx, Md::restore).unwrap();

        assert!(fx.cache.read_raw(256, 16).iter().all(|&b| b == 0x66));
    }

    #[test]
    fn test_clear_repeats_pattern() {
        let fx = fixture(32, false);
        let pattern = [0xDE, 0xAD, 0xBE, 0xEF];
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        Md::clear(
            &fx.md,
            &fx.env,
            &pattern,
            None,
            Box::new(move |st| *r2.borrow_mut() = Some(st)),
        );
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        result.borrow_mut().take().unwrap().unwrap();

        let raw = fx.cache.read_raw(64, 32);
        for chunk in raw.chunks(4) {
            assert_eq!(chunk, pattern);
        }
        // VSS carries the region version in every block.
        let vss = fx.cache.read_raw_vss(64, 32);
        for rec in vss.chunks(FTL_MD_VSS_SZ) {
            assert_eq!(vss::version(rec), 1);
        }
    }

    #[test]
    fn test_clear_rejects_misaligned_pattern() {
        let fx = fixture(32, false);
        let pattern = [1u8, 2, 3];
        assert_eq!(
            run_op(&fx, |md, env, cb| Md::clear(md, env, &pattern, None, cb)),
            Err(MdError::Invalid("metadata object not ready"))
        );
    }

    #[test]
    fn test_nomem_requeues_and_completes() {
        let fx = fixture(16, false);
        fill_data(&fx.md, 0x99);
        fx.cache.nomem_next(1);
        run_op(&fx, Md::persist).unwrap();
        assert!(fx.cache.read_raw(64, 16).iter().all(|&b| b == 0x99));
    }

    #[test]
    fn test_persist_entry_and_read_entry() {
        let fx = fixture(16, true);
        let entry = shared_buf(FTL_BLOCK_SIZE);
        entry.borrow_mut().fill(0x31);

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        let _ctx = Md::persist_entry(
            &fx.md,
            &fx.env,
            3,
            entry,
            None,
            Rc::new(move |st| {
                st.unwrap();
                d2.set(true);
            }),
        );
        assert!(fx.reactor.run_until(|| done.get()));

        // Entry 3 landed on the primary and on the mirror.
        assert!(fx.cache.read_raw(64 + 3, 1).iter().all(|&b| b == 0x31));
        assert!(fx.cache.read_raw(256 + 3, 1).iter().all(|&b| b == 0x31));

        // Read falls back to the mirror when the primary errors out.
        fx.cache.set_read_error_range(Some((64, 16)));
        let rbuf = shared_buf(FTL_BLOCK_SIZE);
        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        let rbuf2 = rbuf.clone();
        Md::read_entry(
            &fx.md,
            &fx.env,
            3,
            rbuf.clone(),
            None,
            Rc::new(move |st| {
                st.unwrap();
                d2.set(true);
            }),
        );
        assert!(fx.reactor.run_until(|| done.get()));
        assert!(rbuf2.borrow().as_slice().iter().all(|&b| b == 0x31));
    }

    #[test]
    fn test_persist_entry_retry_after_failure() {
        let fx = fixture(16, false);
        let entry = shared_buf(FTL_BLOCK_SIZE);
        entry.borrow_mut().fill(0x77);

        fx.cache.fail_next(1);
        let outcome = Rc::new(RefCell::new(Vec::new()));
        let o2 = Rc::clone(&outcome);
        let ctx = Md::persist_entry(
            &fx.md,
            &fx.env,
            0,
            entry,
            None,
            Rc::new(move |st| o2.borrow_mut().push(st)),
        );
        assert!(fx.reactor.run_until(|| !outcome.borrow().is_empty()));
        assert_eq!(outcome.borrow()[0], Err(MdError::Io));

        Md::persist_entry_retry(&fx.md, &fx.env, &ctx);
        assert!(fx.reactor.run_until(|| outcome.borrow().len() == 2));
        assert_eq!(outcome.borrow()[1], Ok(()));
        assert!(fx.cache.read_raw(64, 1).iter().all(|&b| b == 0x77));
    }
}
