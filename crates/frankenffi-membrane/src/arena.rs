//! Arena-scoped native memory regions.
//!
//! An [`Arena`] owns zero-initialised native blocks; [`Segment`]s are
//! bounds-checked views carved from them. Every segment access goes through
//! the arena's gate:
//!
//! 1. the arena must be `Open` (otherwise `ArenaClosed`),
//! 2. confined arenas only admit their owner (otherwise `WrongOwner`),
//! 3. the range must lie inside the segment (otherwise `BoundsViolation`).
//!
//! Admitted operations are counted as in flight. `close` flips the arena to
//! `Closing` so nothing new is admitted, waits for the in-flight count to
//! drain, then releases every block exactly once. Segment handles keep the
//! arena's bookkeeping alive but never its storage, so a stale handle can
//! only ever observe `ArenaClosed`.
//!
//! Shared arenas additionally route reads and writes through a reader/writer
//! gate: reads run concurrently, writes are serialized.

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{DEFAULT_ARENA_CHUNK, RuntimeConfig, runtime_config};
use crate::error::{FfiError, FfiResult};
use crate::layout::{MemoryLayout, Primitive, ScalarValue, align_up};
use crate::metrics::{FfiMetrics, global_metrics};
use crate::owner::{OwnerId, current_ledger, current_owner};

/// Alignment of every native block.
const BLOCK_ALIGN: usize = 16;

/// Alignment used when the caller does not ask for one.
const DEFAULT_SEGMENT_ALIGN: usize = 8;

static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);
static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(1);

/// Process-unique arena identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

impl ArenaId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}

/// Process-unique segment identity. Slices share the id of their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

impl SegmentId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment#{}", self.0)
    }
}

/// Lifetime discipline of an arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    /// Usable only by the task (or thread) that opened it.
    #[default]
    Confined,
    /// Usable by any task while open; writes are serialized.
    Shared,
}

impl ArenaKind {
    /// Parse from string (case-insensitive). Unknown values map to `Confined`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" | "global" | "concurrent" => Self::Shared,
            _ => Self::Confined,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Confined => "confined",
            Self::Shared => "shared",
        }
    }
}

/// Allocation policy of a single arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the zeroed chunks small segments are bump-allocated from.
    pub chunk_size: usize,
    /// Upper bound on bytes handed out to segments.
    pub max_bytes: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_ARENA_CHUNK,
            max_bytes: None,
        }
    }
}

impl ArenaConfig {
    #[must_use]
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            chunk_size: config.arena_chunk_size,
            max_bytes: config.arena_max_bytes,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(BLOCK_ALIGN);
        self
    }
}

/// Outcome of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAttempt {
    Written,
    /// Another writer holds the shared arena's write gate.
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Gate {
    phase: Phase,
    in_flight: usize,
}

/// One native allocation backing segments.
#[derive(Debug)]
struct Block {
    base: usize,
    layout: Layout,
}

impl Block {
    fn allocate(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self {
            base: ptr as usize,
            layout,
        })
    }

    fn release(self) {
        // SAFETY: `base` was returned by `alloc_zeroed` with this exact layout and
        // blocks are moved out of storage before release, so this runs once.
        unsafe { dealloc(self.base as *mut u8, self.layout) };
    }
}

#[derive(Debug, Default)]
struct Storage {
    blocks: Vec<Block>,
    /// Index of the chunk currently used for bump allocation.
    chunk: Option<usize>,
    chunk_used: usize,
    reserved: usize,
    segments: usize,
}

impl Storage {
    fn bump(&mut self, len: usize, align: usize) -> Option<usize> {
        let block = &self.blocks[self.chunk?];
        let start = align_up(self.chunk_used, align);
        let end = start.checked_add(len)?;
        if end > block.layout.size() {
            return None;
        }
        self.chunk_used = end;
        Some(block.base + start)
    }

    fn start_chunk(&mut self, block: Block) {
        self.blocks.push(block);
        self.chunk = Some(self.blocks.len() - 1);
        self.chunk_used = 0;
    }

    fn take_blocks(&mut self) -> Vec<Block> {
        self.chunk = None;
        self.chunk_used = 0;
        std::mem::take(&mut self.blocks)
    }
}

/// Shared bookkeeping of one arena.
pub(crate) struct ArenaCore {
    id: ArenaId,
    kind: ArenaKind,
    owner: OwnerId,
    config: ArenaConfig,
    gate: Mutex<Gate>,
    drained: Condvar,
    writes: RwLock<()>,
    storage: Mutex<Storage>,
}

impl ArenaCore {
    fn new(kind: ArenaKind, config: ArenaConfig) -> Self {
        Self {
            id: ArenaId(NEXT_ARENA.fetch_add(1, Ordering::Relaxed)),
            kind,
            owner: current_owner(),
            config,
            gate: Mutex::new(Gate {
                phase: Phase::Open,
                in_flight: 0,
            }),
            drained: Condvar::new(),
            writes: RwLock::new(()),
            storage: Mutex::new(Storage::default()),
        }
    }

    /// Admit one operation from `caller`, counting it as in flight.
    fn admit(&self, caller: OwnerId) -> FfiResult<()> {
        let mut gate = self.gate.lock();
        if gate.phase != Phase::Open {
            FfiMetrics::inc(&global_metrics().closed_accesses);
            return Err(FfiError::ArenaClosed { arena: self.id });
        }
        if self.kind == ArenaKind::Confined && caller != self.owner {
            FfiMetrics::inc(&global_metrics().owner_violations);
            return Err(FfiError::WrongOwner {
                arena: self.id,
                owner: self.owner,
                caller,
            });
        }
        gate.in_flight += 1;
        Ok(())
    }

    fn enter(&self) -> FfiResult<InFlight<'_>> {
        self.admit(current_owner())?;
        Ok(InFlight { core: self })
    }

    fn leave(&self) {
        let mut gate = self.gate.lock();
        gate.in_flight -= 1;
        if gate.in_flight == 0 && gate.phase == Phase::Closing {
            self.drained.notify_all();
        }
    }

    fn is_open(&self) -> bool {
        self.gate.lock().phase == Phase::Open
    }

    /// Close the arena. `caller` is checked against the owner of confined
    /// arenas; `None` skips the check (scope exit, task termination).
    ///
    /// Returns `true` when this call released the storage.
    fn close(&self, caller: Option<OwnerId>) -> FfiResult<bool> {
        let mut gate = self.gate.lock();
        match gate.phase {
            Phase::Closed => return Ok(false),
            Phase::Closing => {
                while gate.phase != Phase::Closed {
                    self.drained.wait(&mut gate);
                }
                return Ok(false);
            }
            Phase::Open => {}
        }
        if let Some(caller) = caller {
            if self.kind == ArenaKind::Confined && caller != self.owner {
                FfiMetrics::inc(&global_metrics().owner_violations);
                return Err(FfiError::WrongOwner {
                    arena: self.id,
                    owner: self.owner,
                    caller,
                });
            }
        }
        gate.phase = Phase::Closing;
        while gate.in_flight > 0 {
            self.drained.wait(&mut gate);
        }
        self.release_storage();
        gate.phase = Phase::Closed;
        self.drained.notify_all();
        FfiMetrics::inc(&global_metrics().arenas_closed);
        Ok(true)
    }

    fn release_storage(&self) {
        let blocks = self.storage.lock().take_blocks();
        for block in blocks {
            block.release();
        }
    }

    /// Carve `len` zeroed bytes aligned to `align`; returns the address.
    fn carve(&self, len: usize, align: usize) -> FfiResult<usize> {
        let oom = || FfiError::OutOfMemory {
            arena: self.id,
            requested: len,
        };
        if !align.is_power_of_two() {
            return Err(oom());
        }
        let mut storage = self.storage.lock();
        let reserved = storage.reserved.checked_add(len).ok_or_else(oom)?;
        if self.config.max_bytes.is_some_and(|max| reserved > max) {
            return Err(oom());
        }

        // Public config fields may carry a zero chunk size.
        let chunk_size = self.config.chunk_size.max(BLOCK_ALIGN);
        let addr = if len > chunk_size / 2 || align > BLOCK_ALIGN {
            let block = Block::allocate(len.max(1), align.max(BLOCK_ALIGN)).ok_or_else(oom)?;
            let base = block.base;
            storage.blocks.push(block);
            base
        } else if let Some(addr) = storage.bump(len, align) {
            addr
        } else {
            let chunk = Block::allocate(chunk_size, BLOCK_ALIGN).ok_or_else(oom)?;
            storage.start_chunk(chunk);
            storage.bump(len, align).ok_or_else(oom)?
        };

        storage.reserved = reserved;
        storage.segments += 1;
        Ok(addr)
    }
}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        // Reached without a close only if the owning `Arena` was leaked.
        self.release_storage();
    }
}

/// Guard for an admitted operation.
struct InFlight<'a> {
    core: &'a ArenaCore,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.core.leave();
    }
}

/// Owning arena handle. Dropping it closes the arena.
///
/// `Arena` dereferences to [`ArenaHandle`], which carries all operations.
pub struct Arena {
    handle: ArenaHandle,
}

impl Arena {
    /// Open an arena configured from the runtime environment.
    #[must_use]
    pub fn open(kind: ArenaKind) -> Self {
        Self::open_with(kind, ArenaConfig::from_runtime(runtime_config()))
    }

    /// Open an arena with explicit allocation policy.
    ///
    /// Confined arenas opened inside an owner scope carrying a ledger are
    /// recorded there so the scope's owner can release them on termination.
    #[must_use]
    pub fn open_with(kind: ArenaKind, config: ArenaConfig) -> Self {
        let core = Arc::new(ArenaCore::new(kind, config));
        if kind == ArenaKind::Confined {
            if let Some(ledger) = current_ledger() {
                ledger.track(&core);
            }
        }
        FfiMetrics::inc(&global_metrics().arenas_opened);
        Self {
            handle: ArenaHandle { core },
        }
    }

    /// Non-owning handle that can be moved to other tasks.
    #[must_use]
    pub fn handle(&self) -> ArenaHandle {
        self.handle.clone()
    }
}

impl Deref for Arena {
    type Target = ArenaHandle;

    fn deref(&self) -> &ArenaHandle {
        &self.handle
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Scope exit releases regardless of which owner drops the handle.
        let _ = self.handle.core.close(None);
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Arena").field(&self.handle).finish()
    }
}

/// Open an arena; shorthand for [`Arena::open`].
#[must_use]
pub fn open_arena(kind: ArenaKind) -> Arena {
    Arena::open(kind)
}

/// Run `body` with a fresh arena that is closed on every exit path.
pub fn with_arena<R>(kind: ArenaKind, body: impl FnOnce(&Arena) -> R) -> R {
    let arena = Arena::open(kind);
    body(&arena)
}

/// Clonable, non-owning arena handle.
#[derive(Clone)]
pub struct ArenaHandle {
    core: Arc<ArenaCore>,
}

impl ArenaHandle {
    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.core.id
    }

    #[must_use]
    pub fn kind(&self) -> ArenaKind {
        self.core.kind
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.core.owner
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Bytes handed out to segments so far.
    #[must_use]
    pub fn bytes_reserved(&self) -> usize {
        self.core.storage.lock().reserved
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.core.storage.lock().segments
    }

    /// Allocate `len` zeroed bytes.
    pub fn allocate(&self, len: usize) -> FfiResult<Segment> {
        self.allocate_inner(len, DEFAULT_SEGMENT_ALIGN, None)
    }

    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    pub fn allocate_aligned(&self, len: usize, align: usize) -> FfiResult<Segment> {
        self.allocate_inner(len, align, None)
    }

    /// Allocate a segment sized and aligned for `layout`, carrying it for field access.
    pub fn allocate_layout(&self, layout: impl Into<MemoryLayout>) -> FfiResult<Segment> {
        let layout = layout.into();
        self.allocate_inner(layout.size(), layout.align(), Some(Arc::new(layout)))
    }

    /// Copy `text` into a NUL-terminated segment.
    pub fn allocate_cstr(&self, text: &str) -> FfiResult<Segment> {
        let segment = self.allocate_inner(text.len() + 1, 1, None)?;
        segment.write(0, text.as_bytes())?;
        Ok(segment)
    }

    /// Close the arena; idempotent. Confined arenas may only be closed by their owner.
    pub fn close(&self) -> FfiResult<()> {
        self.core.close(Some(current_owner())).map(|_| ())
    }

    fn allocate_inner(
        &self,
        len: usize,
        align: usize,
        layout: Option<Arc<MemoryLayout>>,
    ) -> FfiResult<Segment> {
        let _op = self.core.enter()?;
        let base = self.core.carve(len, align)?;
        let metrics = global_metrics();
        FfiMetrics::inc(&metrics.segments_allocated);
        FfiMetrics::add(&metrics.bytes_allocated, len as u64);
        Ok(Segment {
            core: Arc::clone(&self.core),
            id: SegmentId(NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed)),
            base,
            len,
            layout,
        })
    }
}

impl fmt::Debug for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("owner", &self.core.owner)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// Bounds-checked view into memory owned by exactly one arena.
#[derive(Clone)]
pub struct Segment {
    core: Arc<ArenaCore>,
    id: SegmentId,
    base: usize,
    len: usize,
    layout: Option<Arc<MemoryLayout>>,
}

impl Segment {
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[must_use]
    pub fn arena_id(&self) -> ArenaId {
        self.core.id
    }

    #[must_use]
    pub fn arena_kind(&self) -> ArenaKind {
        self.core.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn layout(&self) -> Option<&MemoryLayout> {
        self.layout.as_deref()
    }

    /// True while the owning arena is open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.core.is_open()
    }

    /// Validate `[offset, offset + len)` against this segment.
    pub fn check_range(&self, offset: usize, len: usize) -> FfiResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => {
                FfiMetrics::inc(&global_metrics().bounds_violations);
                Err(FfiError::BoundsViolation {
                    arena: self.core.id,
                    segment: self.id,
                    offset,
                    len,
                    segment_len: self.len,
                })
            }
        }
    }

    fn access<R>(
        &self,
        offset: usize,
        len: usize,
        access: Access,
        op: impl FnOnce(usize) -> R,
    ) -> FfiResult<R> {
        let _op = self.core.enter()?;
        self.check_range(offset, len)?;
        let addr = self.base + offset;
        let out = match (self.core.kind, access) {
            (ArenaKind::Confined, _) => op(addr),
            (ArenaKind::Shared, Access::Read) => {
                let _shared = self.core.writes.read();
                op(addr)
            }
            (ArenaKind::Shared, Access::Write) => {
                let _exclusive = self.core.writes.write();
                op(addr)
            }
        };
        Ok(out)
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> FfiResult<Vec<u8>> {
        let mut out = vec![0_u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Fill `buf` from the bytes starting at `offset`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> FfiResult<()> {
        let len = buf.len();
        self.access(offset, len, Access::Read, |addr| {
            // SAFETY: the range was bounds-checked and the arena cannot release
            // its storage while this operation is in flight.
            unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len) }
        })
    }

    /// Copy `bytes` into the segment at `offset`. Blocks on a busy shared write gate.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        self.access(offset, bytes.len(), Access::Write, |addr| {
            // SAFETY: bounds-checked, storage pinned by the in-flight count.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) }
        })
    }

    /// Like [`Segment::write`] but reports a busy shared write gate instead of waiting.
    pub fn try_write(&self, offset: usize, bytes: &[u8]) -> FfiResult<WriteAttempt> {
        let _op = self.core.enter()?;
        self.check_range(offset, bytes.len())?;
        let _exclusive = match self.core.kind {
            ArenaKind::Confined => None,
            ArenaKind::Shared => match self.core.writes.try_write() {
                Some(guard) => Some(guard),
                None => {
                    FfiMetrics::inc(&global_metrics().write_contentions);
                    return Ok(WriteAttempt::Contended);
                }
            },
        };
        let addr = self.base + offset;
        // SAFETY: bounds-checked, storage pinned by the in-flight count.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(WriteAttempt::Written)
    }

    /// Set every byte to `byte`.
    pub fn fill(&self, byte: u8) -> FfiResult<()> {
        let len = self.len;
        self.access(0, len, Access::Write, |addr| {
            // SAFETY: whole segment, storage pinned by the in-flight count.
            unsafe { std::ptr::write_bytes(addr as *mut u8, byte, len) }
        })
    }

    /// Copy the whole segment out.
    pub fn to_vec(&self) -> FfiResult<Vec<u8>> {
        self.read(0, self.len)
    }

    /// Copy all of `src` to the start of this segment.
    pub fn copy_from(&self, src: &Segment) -> FfiResult<()> {
        let bytes = src.to_vec()?;
        self.write(0, &bytes)
    }

    /// Bounds-checked sub-view sharing this segment's arena and id.
    pub fn slice(&self, offset: usize, len: usize) -> FfiResult<Segment> {
        let _op = self.core.enter()?;
        self.check_range(offset, len)?;
        Ok(Segment {
            core: Arc::clone(&self.core),
            id: self.id,
            base: self.base + offset,
            len,
            layout: None,
        })
    }

    /// Attach a layout for field access; it must fit in the segment.
    pub fn with_layout(mut self, layout: impl Into<MemoryLayout>) -> FfiResult<Segment> {
        let layout = layout.into();
        self.check_range(0, layout.size())?;
        self.layout = Some(Arc::new(layout));
        Ok(self)
    }

    /// Read a scalar of `kind` at `offset` (native endianness, any alignment).
    pub fn read_scalar(&self, offset: usize, kind: Primitive) -> FfiResult<ScalarValue> {
        let mut raw = [0_u8; 8];
        self.read_into(offset, &mut raw[..kind.size()])?;
        Ok(ScalarValue::from_ne_bytes(kind, &raw))
    }

    /// Write a scalar at `offset` (native endianness, any alignment).
    pub fn write_scalar(&self, offset: usize, value: ScalarValue) -> FfiResult<()> {
        let raw = value.to_ne_bytes();
        self.write(offset, &raw[..value.primitive().size()])
    }

    /// Read the scalar field at `path` of the segment's layout.
    pub fn get(&self, path: &str) -> FfiResult<ScalarValue> {
        let (offset, kind) = self.scalar_field(path)?;
        self.read_scalar(offset, kind)
    }

    /// Write the scalar field at `path`; the value kind must match the field.
    pub fn set(&self, path: &str, value: ScalarValue) -> FfiResult<()> {
        let (offset, kind) = self.scalar_field(path)?;
        if value.primitive() != kind {
            return Err(FfiError::type_mismatch(
                format!("field `{path}`"),
                0,
                kind,
                value.primitive(),
            ));
        }
        self.write_scalar(offset, value)
    }

    fn scalar_field(&self, path: &str) -> FfiResult<(usize, Primitive)> {
        let layout = self.layout.as_deref().ok_or_else(|| FfiError::UnknownField {
            path: path.to_string(),
        })?;
        let info = layout.resolve(path)?;
        let kind = info.kind.ok_or_else(|| {
            FfiError::type_mismatch(format!("field `{path}`"), 0, "scalar", "aggregate")
        })?;
        Ok((info.offset, kind))
    }

    /// Read a NUL-terminated string starting at `offset`.
    pub fn read_cstr(&self, offset: usize) -> FfiResult<String> {
        let remaining = self.len.checked_sub(offset).ok_or_else(|| {
            FfiMetrics::inc(&global_metrics().bounds_violations);
            FfiError::BoundsViolation {
                arena: self.core.id,
                segment: self.id,
                offset,
                len: 1,
                segment_len: self.len,
            }
        })?;
        let bytes = self.read(offset, remaining)?;
        match bytes.iter().position(|b| *b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&bytes[..nul]).into_owned()),
            None => {
                FfiMetrics::inc(&global_metrics().bounds_violations);
                Err(FfiError::BoundsViolation {
                    arena: self.core.id,
                    segment: self.id,
                    offset,
                    len: remaining + 1,
                    segment_len: self.len,
                })
            }
        }
    }

    /// Pin the segment for use outside the arena's own accessors (native calls).
    ///
    /// While the lease lives the arena counts it as an in-flight operation,
    /// so `close` waits for it to be dropped.
    pub fn lease(&self) -> FfiResult<SegmentLease> {
        self.core.admit(current_owner())?;
        Ok(SegmentLease {
            core: Arc::clone(&self.core),
            address: self.base,
            len: self.len,
        })
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("arena", &self.core.id)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .finish()
    }
}

/// In-flight pin on a segment's storage.
pub struct SegmentLease {
    core: Arc<ArenaCore>,
    address: usize,
    len: usize,
}

impl SegmentLease {
    /// Native address of the first byte.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn arena_id(&self) -> ArenaId {
        self.core.id
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.core.leave();
    }
}

impl fmt::Debug for SegmentLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentLease")
            .field("arena", &self.core.id)
            .field("len", &self.len)
            .finish()
    }
}

/// Record of confined arenas opened under one owner.
#[derive(Default)]
pub struct ArenaLedger {
    arenas: Mutex<Vec<Weak<ArenaCore>>>,
}

impl ArenaLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, core: &Arc<ArenaCore>) {
        let mut arenas = self.arenas.lock();
        if arenas.len() >= 16 {
            arenas.retain(|weak| weak.upgrade().is_some_and(|core| core.is_open()));
        }
        arenas.push(Arc::downgrade(core));
    }

    /// Arenas recorded here that are still open.
    #[must_use]
    pub fn open_arenas(&self) -> usize {
        self.arenas
            .lock()
            .iter()
            .filter(|weak| weak.upgrade().is_some_and(|core| core.is_open()))
            .count()
    }

    /// Close every recorded arena that is still open; returns how many were closed.
    pub fn release_all(&self) -> usize {
        let arenas = std::mem::take(&mut *self.arenas.lock());
        arenas
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|core| matches!(core.close(None), Ok(true)))
            .count()
    }
}

impl fmt::Debug for ArenaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaLedger")
            .field("tracked", &self.arenas.lock().len())
            .finish()
    }
}
