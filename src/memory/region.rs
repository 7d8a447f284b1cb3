//! Split bump region over the host-supplied arena.
//!
//! The arena is a single contiguous byte window with two opposed cursors:
//! the *head* grows forward from the low address and holds the committed
//! activation/scratch plan, the *tail* grows backward from the high address
//! and holds allocations that live for the whole session. A *temp*
//! sub-region stacks on top of the head during operator preparation and is
//! released wholesale.
//!
//! Allocations never come back individually; the region is reclaimed by
//! dropping it as a whole. No per-tensor heap allocation happens in the
//! inference hot path.

use tracing::{trace, warn};

use crate::error::{ForgeResult, MicroForgeError};

/// Buffer alignment for activation, variable and scratch data. 16 bytes is
/// the common requirement for SIMD extensions on the supported targets.
pub const BUFFER_ALIGNMENT: usize = 16;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Head/tail/temp bump region over a borrowed byte window.
///
/// The base address is realigned up to [`BUFFER_ALIGNMENT`] on construction;
/// bytes lost to realignment are reported once via `tracing::warn!`. All
/// allocation methods return offsets relative to the aligned base, never
/// raw pointers.
#[derive(Debug)]
pub struct SplitArena<'a> {
    buf: &'a mut [u8],
    head_used: usize,
    temp_used: usize,
    tail_used: usize,
}

impl<'a> SplitArena<'a> {
    /// Wrap a host-supplied byte region, realigning the base up to
    /// [`BUFFER_ALIGNMENT`].
    pub fn new(region: &'a mut [u8]) -> Self {
        let addr = region.as_ptr() as usize;
        let lost = align_up(addr, BUFFER_ALIGNMENT) - addr;
        if lost > 0 {
            warn!(
                lost_bytes = lost,
                "arena base realigned; supply a 16-byte aligned region to avoid the loss"
            );
        }
        let start = lost.min(region.len());
        SplitArena {
            buf: &mut region[start..],
            head_used: 0,
            temp_used: 0,
            tail_used: 0,
        }
    }

    /// Usable capacity after base realignment.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes committed at the head (the planned activation window).
    pub fn head_used(&self) -> usize {
        self.head_used
    }

    /// Bytes of outstanding temp allocations.
    pub fn temp_used(&self) -> usize {
        self.temp_used
    }

    /// Bytes consumed from the tail.
    pub fn tail_used(&self) -> usize {
        self.tail_used
    }

    /// Head plus tail consumption, for diagnostics.
    pub fn used_bytes(&self) -> usize {
        self.head_used + self.tail_used
    }

    /// Reserve `size` bytes at the tail, aligning the tail cursor down to
    /// `align` first. The allocation lives until the arena is dropped.
    pub fn allocate_from_tail(&mut self, size: usize, align: usize) -> ForgeResult<usize> {
        check_alignment(align)?;
        let free = self.free_bytes();
        let tail_start = self.capacity() - self.tail_used;
        let new_start = tail_start
            .checked_sub(size)
            .map(|start| align_down(start, align))
            .filter(|&start| start >= self.head_used + self.temp_used)
            .ok_or(MicroForgeError::ArenaExhausted {
                requested: size,
                available: free,
            })?;
        self.tail_used = self.capacity() - new_start;
        trace!(size, align, offset = new_start, "tail allocation");
        Ok(new_start)
    }

    /// Grow the head so its aligned size is at least `size`. Idempotent;
    /// never shrinks. The caller guarantees prior head contents are no
    /// longer needed. Fails while temp allocations are outstanding.
    pub fn ensure_head_size(&mut self, size: usize, align: usize) -> ForgeResult<()> {
        check_alignment(align)?;
        if self.temp_used != 0 {
            return Err(MicroForgeError::InvariantViolation(
                "head resized while temp allocations are outstanding",
            ));
        }
        let aligned = align_up(size, align);
        if aligned <= self.head_used {
            return Ok(());
        }
        if aligned > self.capacity() - self.tail_used {
            return Err(MicroForgeError::ArenaExhausted {
                requested: aligned - self.head_used,
                available: self.free_bytes(),
            });
        }
        trace!(from = self.head_used, to = aligned, "head grown");
        self.head_used = aligned;
        Ok(())
    }

    /// Carve a temporary block from the current head end. Subsequent temp
    /// allocations stack; a single [`SplitArena::reset_temp_allocations`]
    /// returns the cursor to the head.
    pub fn allocate_temp(&mut self, size: usize, align: usize) -> ForgeResult<usize> {
        check_alignment(align)?;
        let start = align_up(self.head_used + self.temp_used, align);
        let end = start
            .checked_add(size)
            .ok_or(MicroForgeError::ArenaExhausted {
                requested: size,
                available: self.free_bytes(),
            })?;
        if end > self.capacity() - self.tail_used {
            return Err(MicroForgeError::ArenaExhausted {
                requested: size,
                available: self.free_bytes(),
            });
        }
        self.temp_used = end - self.head_used;
        trace!(size, align, offset = start, "temp allocation");
        Ok(start)
    }

    /// Release every outstanding temp allocation. Idempotent.
    pub fn reset_temp_allocations(&mut self) {
        self.temp_used = 0;
    }

    /// Free bytes between head (plus temps) and tail, rounded down so that
    /// an `align`-aligned block of the returned size always fits.
    pub fn available_memory(&self, align: usize) -> usize {
        debug_assert!(align.is_power_of_two());
        let start = align_up(self.head_used + self.temp_used, align);
        let end = align_down(self.capacity() - self.tail_used, align);
        end.saturating_sub(start)
    }

    fn free_bytes(&self) -> usize {
        self.capacity() - self.head_used - self.temp_used - self.tail_used
    }

    /// Read-only view of an allocated byte range.
    pub fn slice(&self, offset: usize, len: usize) -> ForgeResult<&[u8]> {
        self.check_range(offset, len)?;
        Ok(&self.buf[offset..offset + len])
    }

    /// Mutable view of an allocated byte range.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> ForgeResult<&mut [u8]> {
        self.check_range(offset, len)?;
        Ok(&mut self.buf[offset..offset + len])
    }

    fn check_range(&self, offset: usize, len: usize) -> ForgeResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or(MicroForgeError::ArenaExhausted {
                requested: len,
                available: 0,
            })?;
        if end > self.capacity() {
            return Err(MicroForgeError::ArenaExhausted {
                requested: len,
                available: self.capacity().saturating_sub(offset),
            });
        }
        Ok(())
    }
}

fn check_alignment(align: usize) -> ForgeResult<()> {
    if !align.is_power_of_two() {
        return Err(MicroForgeError::InvariantViolation(
            "alignment must be a power of two",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Backing store with a guaranteed 16-byte base so offsets in the
    // assertions below are exact.
    #[repr(align(16))]
    struct Backing([u8; 1024]);

    fn backing() -> Backing {
        Backing([0u8; 1024])
    }

    #[test]
    fn test_tail_allocation_aligns_down() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        let off = arena.allocate_from_tail(100, 16).unwrap();
        assert_eq!(off % 16, 0);
        assert_eq!(off, align_down(1024 - 100, 16));
        assert!(arena.tail_used() >= 100);
    }

    #[test]
    fn test_tail_allocations_stack_downward() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        let first = arena.allocate_from_tail(64, 16).unwrap();
        let second = arena.allocate_from_tail(64, 16).unwrap();
        assert!(second < first);
        assert_eq!(arena.tail_used(), 128);
    }

    #[test]
    fn test_tail_exhaustion_reports_counts() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_from_tail(1000, 16).unwrap();
        let err = arena.allocate_from_tail(64, 16).unwrap_err();
        match err {
            MicroForgeError::ArenaExhausted {
                requested,
                available,
            } => {
                assert_eq!(requested, 64);
                assert!(available < 64);
            }
            other => panic!("expected ArenaExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_ensure_head_size_is_idempotent() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.ensure_head_size(100, 16).unwrap();
        assert_eq!(arena.head_used(), align_up(100, 16));
        arena.ensure_head_size(100, 16).unwrap();
        assert_eq!(arena.head_used(), align_up(100, 16));
        // Smaller request never shrinks.
        arena.ensure_head_size(10, 16).unwrap();
        assert_eq!(arena.head_used(), align_up(100, 16));
    }

    #[test]
    fn test_ensure_head_collides_with_tail() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_from_tail(512, 16).unwrap();
        assert!(arena.ensure_head_size(600, 16).is_err());
        assert!(arena.ensure_head_size(512, 16).is_ok());
    }

    #[test]
    fn test_head_size_round_trip_law() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_from_tail(96, 16).unwrap();
        let tail_used = arena.tail_used();
        arena.ensure_head_size(200, 16).unwrap();
        let k_aligned = align_up(200, 16);
        assert_eq!(
            arena.available_memory(16),
            arena.capacity() - k_aligned - tail_used
        );
    }

    #[test]
    fn test_temp_allocations_stack() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.ensure_head_size(64, 16).unwrap();
        let first = arena.allocate_temp(32, 16).unwrap();
        let second = arena.allocate_temp(32, 16).unwrap();
        assert_eq!(first, 64);
        assert_eq!(second, 96);
        assert_eq!(arena.temp_used(), 64);
    }

    #[test]
    fn test_reset_temp_is_idempotent() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_temp(128, 16).unwrap();
        arena.reset_temp_allocations();
        let after_one = arena.temp_used();
        arena.reset_temp_allocations();
        assert_eq!(arena.temp_used(), after_one);
        assert_eq!(after_one, 0);
        // Temp space is reusable after reset.
        let off = arena.allocate_temp(128, 16).unwrap();
        assert_eq!(off, 0);
    }

    #[test]
    fn test_head_commit_rejected_with_outstanding_temps() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_temp(32, 16).unwrap();
        let err = arena.ensure_head_size(64, 16).unwrap_err();
        assert!(matches!(err, MicroForgeError::InvariantViolation(_)));
        arena.reset_temp_allocations();
        assert!(arena.ensure_head_size(64, 16).is_ok());
    }

    #[test]
    fn test_temp_collides_with_tail() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_from_tail(1008, 16).unwrap();
        assert!(arena.allocate_temp(64, 16).is_err());
    }

    #[test]
    fn test_head_plus_tail_never_exceeds_capacity() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.ensure_head_size(400, 16).unwrap();
        arena.allocate_from_tail(500, 16).unwrap();
        assert!(arena.used_bytes() <= arena.capacity());
        assert!(arena.allocate_from_tail(200, 16).is_err());
        assert!(arena.used_bytes() <= arena.capacity());
    }

    #[test]
    fn test_available_memory_rounds_down() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        arena.allocate_from_tail(10, 2).unwrap();
        let available = arena.available_memory(16);
        assert_eq!(available % 16, 0);
        assert!(available <= arena.capacity() - 10);
    }

    #[test]
    fn test_slices_cover_allocations() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        let off = arena.allocate_from_tail(32, 16).unwrap();
        arena.slice_mut(off, 32).unwrap().fill(0xAB);
        assert!(arena.slice(off, 32).unwrap().iter().all(|&x| x == 0xAB));
        assert!(arena.slice(arena.capacity(), 1).is_err());
    }

    #[test]
    fn test_misaligned_region_loses_prefix() {
        let mut b = backing();
        // Skew the base by one byte; the arena realigns and shrinks.
        let arena = SplitArena::new(&mut b.0[1..]);
        assert_eq!(arena.capacity(), 1024 - 16);
    }

    #[test]
    fn test_non_power_of_two_alignment_rejected() {
        let mut b = backing();
        let mut arena = SplitArena::new(&mut b.0);
        assert!(arena.allocate_from_tail(8, 12).is_err());
    }
}
