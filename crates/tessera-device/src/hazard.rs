//! Memory-visibility tracking.
//!
//! Replay drains every earlier command at each barrier, so execution is
//! always correct. The tracker checks the program instead: it remembers the
//! last write to each resource and the scopes that write has been made
//! visible to, and reports reads or writes that no barrier covered.

use crate::context::ObjectKey;
use bitflags::bitflags;
use hashbrown::HashMap;

bitflags! {
    /// Pipeline stages, with the Vulkan bit values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStageFlags: u32 {
        const TOP_OF_PIPE = 0x1;
        const DRAW_INDIRECT = 0x2;
        const VERTEX_INPUT = 0x4;
        const VERTEX_SHADER = 0x8;
        const FRAGMENT_SHADER = 0x80;
        const EARLY_FRAGMENT_TESTS = 0x100;
        const LATE_FRAGMENT_TESTS = 0x200;
        const COLOR_ATTACHMENT_OUTPUT = 0x400;
        const TRANSFER = 0x1000;
        const BOTTOM_OF_PIPE = 0x2000;
        const HOST = 0x4000;
        const ALL_GRAPHICS = 0x8000;
        const ALL_COMMANDS = 0x10000;
    }

    /// Memory access types, with the Vulkan bit values.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const INDEX_READ = 0x2;
        const VERTEX_ATTRIBUTE_READ = 0x4;
        const UNIFORM_READ = 0x8;
        const SHADER_READ = 0x20;
        const SHADER_WRITE = 0x40;
        const COLOR_ATTACHMENT_READ = 0x80;
        const COLOR_ATTACHMENT_WRITE = 0x100;
        const DEPTH_STENCIL_ATTACHMENT_READ = 0x200;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 0x400;
        const TRANSFER_READ = 0x800;
        const TRANSFER_WRITE = 0x1000;
        const HOST_READ = 0x2000;
        const HOST_WRITE = 0x4000;
        const MEMORY_READ = 0x8000;
        const MEMORY_WRITE = 0x10000;
    }
}

impl PipelineStageFlags {
    const GRAPHICS: Self = Self::DRAW_INDIRECT
        .union(Self::VERTEX_INPUT)
        .union(Self::VERTEX_SHADER)
        .union(Self::FRAGMENT_SHADER)
        .union(Self::EARLY_FRAGMENT_TESTS)
        .union(Self::LATE_FRAGMENT_TESTS)
        .union(Self::COLOR_ATTACHMENT_OUTPUT);

    /// Replace the meta stages with the stages they stand for.
    pub fn expand(self) -> Self {
        if self.contains(Self::ALL_COMMANDS) {
            return Self::all();
        }
        let mut stages = self;
        if self.contains(Self::ALL_GRAPHICS) {
            stages |= Self::GRAPHICS;
        }
        stages
    }
}

impl AccessFlags {
    const READS: Self = Self::INDEX_READ
        .union(Self::VERTEX_ATTRIBUTE_READ)
        .union(Self::UNIFORM_READ)
        .union(Self::SHADER_READ)
        .union(Self::COLOR_ATTACHMENT_READ)
        .union(Self::DEPTH_STENCIL_ATTACHMENT_READ)
        .union(Self::TRANSFER_READ)
        .union(Self::HOST_READ);
    const WRITES: Self = Self::SHADER_WRITE
        .union(Self::COLOR_ATTACHMENT_WRITE)
        .union(Self::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .union(Self::TRANSFER_WRITE)
        .union(Self::HOST_WRITE);

    /// Replace `MEMORY_READ` and `MEMORY_WRITE` with every read or write.
    pub fn expand(self) -> Self {
        let mut access = self;
        if self.contains(Self::MEMORY_READ) {
            access |= Self::READS;
        }
        if self.contains(Self::MEMORY_WRITE) {
            access |= Self::WRITES;
        }
        access
    }
}

/// A set of stages paired with the accesses they perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scope {
    pub stages: PipelineStageFlags,
    pub access: AccessFlags,
}

impl Scope {
    pub const fn new(stages: PipelineStageFlags, access: AccessFlags) -> Self {
        Self { stages, access }
    }

    /// Whether this scope includes every stage and access of `other`.
    fn covers(self, other: Self) -> bool {
        self.stages.expand().contains(other.stages) && self.access.expand().contains(other.access)
    }

    /// Whether an access in `other` may observe memory made visible to this scope.
    fn reaches(self, other: Self) -> bool {
        self.stages.expand().contains(other.stages) && self.access.expand().intersects(other.access)
    }
}

#[derive(Debug, Default)]
struct ResourceState {
    last_write: Option<Scope>,
    visible: Vec<Scope>,
}

impl ResourceState {
    fn is_visible(&self, scope: Scope) -> bool {
        self.last_write.is_none() || self.visible.iter().any(|v| v.reaches(scope))
    }

    fn make_visible(&mut self, src: Scope, dst: Scope) {
        if self.last_write.is_some_and(|w| src.covers(w)) {
            self.visible.push(dst);
        }
    }
}

/// Kind of unsynchronized access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterWrite,
}

/// One reported hazard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hazard {
    pub kind: HazardKind,
    pub resource: ObjectKey,
    pub previous: Scope,
    pub access: Scope,
}

/// Per-submission write/visibility tracker.
///
/// A fresh tracker starts every submission, so writes the host made before the
/// submission are visible to everything in it.
#[derive(Debug, Default)]
pub struct HazardTracker {
    resources: HashMap<ObjectKey, ResourceState>,
}

impl HazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `resource`.
    pub fn read(&mut self, resource: ObjectKey, scope: Scope) -> Option<Hazard> {
        let state = self.resources.get(&resource)?;
        let previous = state.last_write?;
        (!state.is_visible(scope)).then_some(Hazard {
            kind: HazardKind::ReadAfterWrite,
            resource,
            previous,
            access: scope,
        })
    }

    /// Record a write of `resource`.
    pub fn write(&mut self, resource: ObjectKey, scope: Scope) -> Option<Hazard> {
        let state = self.resources.entry(resource).or_default();
        let hazard = match state.last_write {
            Some(previous) if !state.is_visible(scope) => Some(Hazard {
                kind: HazardKind::WriteAfterWrite,
                resource,
                previous,
                access: scope,
            }),
            _ => None,
        };
        state.last_write = Some(scope);
        state.visible.clear();
        hazard
    }

    /// Global memory barrier: applies to every tracked resource.
    pub fn memory_barrier(&mut self, src: Scope, dst: Scope) {
        for state in self.resources.values_mut() {
            state.make_visible(src, dst);
        }
    }

    /// Buffer or image barrier without a layout change.
    pub fn resource_barrier(&mut self, resource: ObjectKey, src: Scope, dst: Scope) {
        if let Some(state) = self.resources.get_mut(&resource) {
            state.make_visible(src, dst);
        }
    }

    /// Image barrier that changes the layout. The transition itself writes
    /// the image and is visible to `dst` when it completes.
    pub fn layout_transition(
        &mut self,
        resource: ObjectKey,
        src: Scope,
        dst: Scope,
    ) -> Option<Hazard> {
        let state = self.resources.entry(resource).or_default();
        let transition = Scope::new(src.stages, AccessFlags::MEMORY_WRITE);
        let hazard = match state.last_write {
            Some(previous) if !src.covers(previous) => Some(Hazard {
                kind: HazardKind::WriteAfterWrite,
                resource,
                previous,
                access: transition,
            }),
            _ => None,
        };
        state.last_write = Some(transition);
        state.visible.clear();
        state.visible.push(dst);
        hazard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ObjectKind;

    const BUFFER: ObjectKey = ObjectKey::new(ObjectKind::Buffer, 0x1_0000_0000);

    fn transfer_write() -> Scope {
        Scope::new(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_WRITE)
    }

    fn vertex_read() -> Scope {
        Scope::new(
            PipelineStageFlags::VERTEX_INPUT,
            AccessFlags::VERTEX_ATTRIBUTE_READ,
        )
    }

    #[test]
    fn untracked_reads_are_clean() {
        let mut tracker = HazardTracker::new();
        assert_eq!(tracker.read(BUFFER, vertex_read()), None);
    }

    #[test]
    fn read_after_unsynchronized_write() {
        let mut tracker = HazardTracker::new();
        assert_eq!(tracker.write(BUFFER, transfer_write()), None);
        let hazard = tracker.read(BUFFER, vertex_read()).unwrap();
        assert_eq!(hazard.kind, HazardKind::ReadAfterWrite);
    }

    #[test]
    fn barrier_makes_write_visible() {
        let mut tracker = HazardTracker::new();
        tracker.write(BUFFER, transfer_write());
        tracker.resource_barrier(BUFFER, transfer_write(), vertex_read());
        assert_eq!(tracker.read(BUFFER, vertex_read()), None);
        // A different destination scope is still unsynchronized.
        let shader = Scope::new(PipelineStageFlags::FRAGMENT_SHADER, AccessFlags::SHADER_READ);
        assert!(tracker.read(BUFFER, shader).is_some());
    }

    #[test]
    fn barrier_must_cover_the_write() {
        let mut tracker = HazardTracker::new();
        tracker.write(BUFFER, transfer_write());
        let wrong_src = Scope::new(
            PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        tracker.memory_barrier(wrong_src, vertex_read());
        assert!(tracker.read(BUFFER, vertex_read()).is_some());
    }

    #[test]
    fn meta_flags_expand() {
        let mut tracker = HazardTracker::new();
        tracker.write(BUFFER, transfer_write());
        tracker.memory_barrier(
            Scope::new(PipelineStageFlags::ALL_COMMANDS, AccessFlags::MEMORY_WRITE),
            Scope::new(PipelineStageFlags::ALL_GRAPHICS, AccessFlags::MEMORY_READ),
        );
        assert_eq!(tracker.read(BUFFER, vertex_read()), None);
        let hazard = tracker.write(BUFFER, transfer_write()).unwrap();
        assert_eq!(hazard.kind, HazardKind::WriteAfterWrite);
    }

    #[test]
    fn layout_transition_is_visible_to_destination() {
        let mut tracker = HazardTracker::new();
        let sampled = Scope::new(PipelineStageFlags::FRAGMENT_SHADER, AccessFlags::SHADER_READ);
        let top = Scope::new(PipelineStageFlags::TOP_OF_PIPE, AccessFlags::empty());
        assert_eq!(tracker.layout_transition(BUFFER, top, sampled), None);
        assert_eq!(tracker.read(BUFFER, sampled), None);
    }
}
