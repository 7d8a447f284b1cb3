//! Greedy memory planner.
//!
//! Assigns a byte offset inside the planning window to every buffer so that
//! no two buffers with intersecting live ranges share bytes. Buffers are
//! placed largest-first into the lowest gap left between already-placed
//! neighbors that are live at the same time; buffers pinned by an offline
//! plan are placed first, at exactly their supplied offset, and act as
//! constraints on everything placed after them.
//!
//! The plan is calculated lazily on the first offset query and reused until
//! another buffer is added.

use tracing::{debug, trace};

use crate::error::{ForgeResult, MicroForgeError};
use crate::memory::region::{align_up, BUFFER_ALIGNMENT};

#[derive(Debug, Clone, Copy)]
struct BufferRequirement {
    size: usize,
    first_use: i32,
    last_use: i32,
    pinned_offset: Option<usize>,
}

impl BufferRequirement {
    fn overlaps(&self, other: &BufferRequirement) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// Placement already decided during the current calculation, ordered by
/// offset.
#[derive(Debug, Clone, Copy)]
struct Placed {
    offset: usize,
    size: usize,
    requirement: usize,
}

/// Greedy offset planner for one static memory plan.
#[derive(Debug)]
pub struct GreedyMemoryPlanner {
    alignment: usize,
    requirements: Vec<BufferRequirement>,
    offsets: Vec<usize>,
    plan_valid: bool,
}

impl Default for GreedyMemoryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl GreedyMemoryPlanner {
    /// Planner with the production 16-byte buffer alignment.
    pub fn new() -> Self {
        Self::with_alignment(BUFFER_ALIGNMENT)
    }

    /// Planner with a custom power-of-two alignment.
    pub fn with_alignment(alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        GreedyMemoryPlanner {
            alignment,
            requirements: Vec::new(),
            offsets: Vec::new(),
            plan_valid: false,
        }
    }

    /// Number of buffers added so far.
    pub fn buffer_count(&self) -> usize {
        self.requirements.len()
    }

    /// Add an online-planned buffer live over `[first_use, last_use]`.
    /// Returns the buffer id used with [`GreedyMemoryPlanner::offset_for_buffer`].
    pub fn add_buffer(&mut self, size: usize, first_use: i32, last_use: i32) -> ForgeResult<usize> {
        self.push(BufferRequirement {
            size,
            first_use,
            last_use,
            pinned_offset: None,
        })
    }

    /// Add a buffer pinned at a fixed arena-relative offset by an offline
    /// plan. The offset is honored exactly.
    pub fn add_buffer_at(
        &mut self,
        size: usize,
        first_use: i32,
        last_use: i32,
        offset: usize,
    ) -> ForgeResult<usize> {
        self.push(BufferRequirement {
            size,
            first_use,
            last_use,
            pinned_offset: Some(offset),
        })
    }

    fn push(&mut self, requirement: BufferRequirement) -> ForgeResult<usize> {
        if requirement.first_use > requirement.last_use {
            return Err(MicroForgeError::LifetimeLogicError {
                tensor: self.requirements.len(),
                first_use: requirement.first_use,
                last_use: requirement.last_use,
            });
        }
        self.requirements.push(requirement);
        self.plan_valid = false;
        Ok(self.requirements.len() - 1)
    }

    /// Offset assigned to buffer `id`, calculating the plan if needed.
    pub fn offset_for_buffer(&mut self, id: usize) -> ForgeResult<usize> {
        self.calculate_offsets_if_needed()?;
        self.offsets
            .get(id)
            .copied()
            .ok_or(MicroForgeError::InvariantViolation(
                "planner queried for a buffer id that was never added",
            ))
    }

    /// Highest byte index any buffer in the plan touches.
    pub fn maximum_memory_size(&mut self) -> ForgeResult<usize> {
        self.calculate_offsets_if_needed()?;
        Ok(self
            .requirements
            .iter()
            .zip(&self.offsets)
            .map(|(r, &off)| off + r.size)
            .max()
            .unwrap_or(0))
    }

    fn calculate_offsets_if_needed(&mut self) -> ForgeResult<()> {
        if self.plan_valid {
            return Ok(());
        }

        // Pinned buffers first (they are constraints, not candidates), then
        // online buffers largest-first so big blocks claim low gaps; ties
        // break by insertion order for determinism.
        let mut order: Vec<usize> = (0..self.requirements.len()).collect();
        order.sort_by(|&a, &b| {
            let (ra, rb) = (&self.requirements[a], &self.requirements[b]);
            rb.pinned_offset
                .is_some()
                .cmp(&ra.pinned_offset.is_some())
                .then(rb.size.cmp(&ra.size))
                .then(a.cmp(&b))
        });

        let mut placed: Vec<Placed> = Vec::with_capacity(order.len());
        self.offsets = vec![0; self.requirements.len()];

        for &index in &order {
            let requirement = self.requirements[index];
            let offset = match requirement.pinned_offset {
                Some(offset) => {
                    self.check_pinned_fits(&placed, &requirement, offset, index)?;
                    offset
                }
                None => self.first_fit(&placed, &requirement),
            };
            let at = placed
                .binary_search_by(|p| p.offset.cmp(&offset))
                .unwrap_or_else(|e| e);
            placed.insert(
                at,
                Placed {
                    offset,
                    size: requirement.size,
                    requirement: index,
                },
            );
            self.offsets[index] = offset;
            trace!(
                buffer = index,
                offset,
                size = requirement.size,
                "buffer placed"
            );
        }

        self.plan_valid = true;
        debug!(
            buffers = self.requirements.len(),
            "memory plan calculated"
        );
        Ok(())
    }

    /// Lowest aligned offset at which `requirement` fits between the
    /// already-placed buffers that are live at the same time.
    fn first_fit(&self, placed: &[Placed], requirement: &BufferRequirement) -> usize {
        let mut candidate = 0usize;
        for entry in placed {
            if !self.requirements[entry.requirement].overlaps(requirement) {
                continue;
            }
            if entry.offset >= candidate && entry.offset - candidate >= requirement.size {
                break;
            }
            candidate = candidate.max(align_up(entry.offset + entry.size, self.alignment));
        }
        candidate
    }

    fn check_pinned_fits(
        &self,
        placed: &[Placed],
        requirement: &BufferRequirement,
        offset: usize,
        index: usize,
    ) -> ForgeResult<()> {
        for entry in placed {
            let other = &self.requirements[entry.requirement];
            if !other.overlaps(requirement) {
                continue;
            }
            let byte_overlap =
                offset < entry.offset + entry.size && entry.offset < offset + requirement.size;
            if byte_overlap {
                return Err(MicroForgeError::UnsupportedModel(format!(
                    "offline planned buffer {index} at [{offset}, {}) overlaps buffer {} at [{}, {})",
                    offset + requirement.size,
                    entry.requirement,
                    entry.offset,
                    entry.offset + entry.size,
                )));
            }
        }
        Ok(())
    }
}
