//! Resource states and the per-frame resource table.
//!
//! Every GPU resource the graph schedules around is identified by a 64-bit
//! *path id* agreed between the client and the graph. The table tracks, per
//! resource, the logical state a following pass will observe, whether the
//! resource depends on the window size, and which passes produce it this
//! frame. Entries persist across frames; producer lists do not.

use bitflags::bitflags;

use super::node::PassHandle;

/// Maximum number of resources the table tracks at once.
pub const MAX_RESOURCES: usize = 256;

/// Maximum number of producer passes per resource per frame.
pub const MAX_PRODUCERS: usize = 8;

/// Path ids below this value denote dummy resources.
///
/// Dummy resources participate in dependency edges — a pass can "produce"
/// one to order another pass after itself — but never receive barriers and
/// never carry a native resource.
pub const NUM_RESERVED_PATHS: u64 = 8;

/// Check whether a path id falls in the reserved dummy range.
pub fn is_reserved_path(id: u64) -> bool {
    id < NUM_RESERVED_PATHS
}

bitflags! {
    /// Logical resource state, a bitfield over D3D12-style state bits.
    ///
    /// `COMMON` and `PRESENT` are the zero state. A barrier is required when
    /// the current state and the expected state share no bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        /// Vertex or constant buffer read.
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        /// Index buffer read.
        const INDEX_BUFFER = 1 << 1;
        /// Color render target write.
        const RENDER_TARGET = 1 << 2;
        /// Unordered (storage) access.
        const UNORDERED_ACCESS = 1 << 3;
        /// Depth-stencil write.
        const DEPTH_WRITE = 1 << 4;
        /// Read-only depth-stencil.
        const DEPTH_READ = 1 << 5;
        /// Shader resource outside the pixel stage.
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        /// Shader resource in the pixel stage.
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        /// Copy destination.
        const COPY_DEST = 1 << 8;
        /// Copy source.
        const COPY_SOURCE = 1 << 9;
        /// Raytracing acceleration structure.
        const RAYTRACING_ACCELERATION_STRUCTURE = 1 << 10;
    }
}

impl ResourceState {
    /// The common state; also what the presentation engine expects.
    pub const COMMON: ResourceState = ResourceState::empty();

    /// Alias of [`COMMON`](Self::COMMON) used at the end of the frame.
    pub const PRESENT: ResourceState = ResourceState::empty();

    /// Shader resource in any stage.
    pub const ALL_SHADER_RESOURCE: ResourceState = ResourceState::NON_PIXEL_SHADER_RESOURCE
        .union(ResourceState::PIXEL_SHADER_RESOURCE);

    /// States a pass input may name. Unordered access is read-write and
    /// appears on both sides.
    pub const READ_STATES: ResourceState = ResourceState::ALL_SHADER_RESOURCE
        .union(ResourceState::INDEX_BUFFER)
        .union(ResourceState::VERTEX_AND_CONSTANT_BUFFER)
        .union(ResourceState::COPY_SOURCE)
        .union(ResourceState::UNORDERED_ACCESS);

    /// States a pass output may name.
    pub const WRITE_STATES: ResourceState = ResourceState::RENDER_TARGET
        .union(ResourceState::UNORDERED_ACCESS)
        .union(ResourceState::DEPTH_WRITE)
        .union(ResourceState::COPY_DEST);

    /// States that cannot appear in a transition executed on the
    /// async-compute queue.
    pub const ILLEGAL_COMPUTE_STATES: ResourceState = ResourceState::RENDER_TARGET
        .union(ResourceState::DEPTH_READ)
        .union(ResourceState::DEPTH_WRITE)
        .union(ResourceState::PIXEL_SHADER_RESOURCE);

    /// Check if this state mask names only read states.
    pub fn is_read(self) -> bool {
        !self.is_empty() && Self::READ_STATES.contains(self)
    }

    /// Check if this state mask names only write states.
    pub fn is_write(self) -> bool {
        !self.is_empty() && Self::WRITE_STATES.contains(self)
    }

    /// Check if a transition out of this state is legal on the compute queue.
    pub fn legal_on_compute(self) -> bool {
        !self.intersects(Self::ILLEGAL_COMPUTE_STATES)
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::COMMON
    }
}

/// Opaque native-resource handle owned by the renderer façade.
///
/// The graph never dereferences it; it only carries it into barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuResource(pub u64);

/// A declared pass dependency: which resource, and in what state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Path id of the resource.
    pub resource_id: u64,
    /// State mask the pass expects the resource in.
    pub expected_state: ResourceState,
}

/// Per-resource tracking record.
#[derive(Debug, Clone)]
pub struct ResourceMetadata {
    /// Path id.
    pub id: u64,
    /// Native resource; `None` for dummy resources.
    pub resource: Option<GpuResource>,
    /// State the next pass in execution order will observe.
    pub state: ResourceState,
    /// Whether the resource must be rebuilt when the window resizes.
    pub window_size_dependent: bool,
    /// Handles of the passes producing this resource this frame.
    pub producers: Vec<PassHandle>,
}

impl ResourceMetadata {
    fn new(
        id: u64,
        resource: Option<GpuResource>,
        state: ResourceState,
        window_size_dependent: bool,
    ) -> Self {
        Self {
            id,
            resource,
            state,
            window_size_dependent,
            producers: Vec::with_capacity(MAX_PRODUCERS),
        }
    }
}

/// Sorted table of tracked resources.
///
/// Lookup is a binary search by path id. During pre-register, new entries
/// append unsorted at the end while lookups stay bounded to the sorted
/// prefix carried over from the previous frame; [`seal`](Self::seal) sorts
/// the whole table before dependency declaration begins.
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: Vec<ResourceMetadata>,
    /// Number of (sorted) entries carried over from the previous frame.
    prev_frame_count: usize,
}

impl ResourceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_RESOURCES),
            prev_frame_count: 0,
        }
    }

    /// Begin a new frame: snapshot the sorted prefix and clear producers.
    pub fn begin_frame(&mut self) {
        self.prev_frame_count = self.entries.len();
        for entry in &mut self.entries {
            entry.producers.clear();
        }
    }

    /// Register a resource during pre-register.
    ///
    /// If `id` is already present from a previous frame, the entry is
    /// overwritten only when the native resource changed; otherwise the call
    /// is a no-op. New ids append to the end of the table.
    pub fn register(
        &mut self,
        resource: Option<GpuResource>,
        id: u64,
        initial_state: ResourceState,
        window_size_dependent: bool,
    ) {
        debug_assert!(
            resource.is_none() || !is_reserved_path(id),
            "path id {id} is reserved for dummy resources"
        );

        if let Some(pos) = self.find_in(id, self.prev_frame_count) {
            if self.entries[pos].resource != resource {
                self.entries[pos] =
                    ResourceMetadata::new(id, resource, initial_state, window_size_dependent);
            }
            return;
        }

        debug_assert!(self.entries.len() < MAX_RESOURCES, "resource table overflow");
        self.entries
            .push(ResourceMetadata::new(id, resource, initial_state, window_size_dependent));
    }

    /// Sort the table and switch lookups to the full range.
    ///
    /// Called at the pre-register to post-register transition.
    pub fn seal(&mut self) {
        self.entries.sort_by_key(|entry| entry.id);
        self.prev_frame_count = self.entries.len();

        #[cfg(debug_assertions)]
        for window in self.entries.windows(2) {
            assert!(
                window[0].id != window[1].id,
                "duplicate entries for resource {}",
                window[0].id
            );
        }
    }

    /// Remove a resource by path id, keeping the table sorted.
    pub fn remove(&mut self, id: u64) {
        if let Some(pos) = self.find_in(id, self.prev_frame_count) {
            self.entries.remove(pos);
            self.prev_frame_count -= 1;
        }
    }

    /// Remove a batch of resources by path id.
    pub fn remove_many(&mut self, ids: &[u64]) {
        for &id in ids {
            self.remove(id);
        }
    }

    /// Drop every window-size-dependent entry, keeping the rest sorted.
    ///
    /// Used on window resize so size-dependent resources can be re-registered
    /// in bulk.
    pub fn reset(&mut self) {
        self.entries.retain(|entry| !entry.window_size_dependent);
        self.entries.sort_by_key(|entry| entry.id);
        self.prev_frame_count = self.entries.len();
    }

    /// Look up a resource over the full table.
    pub fn find(&self, id: u64) -> Option<usize> {
        self.find_in(id, self.entries.len())
    }

    /// Look up a resource over the sorted prefix `[0, end)`.
    pub fn find_in(&self, id: u64, end: usize) -> Option<usize> {
        self.entries[..end].binary_search_by_key(&id, |entry| entry.id).ok()
    }

    /// Get an entry by table index.
    pub fn entry(&self, index: usize) -> &ResourceMetadata {
        &self.entries[index]
    }

    /// Get a mutable entry by table index.
    pub fn entry_mut(&mut self, index: usize) -> &mut ResourceMetadata {
        &mut self.entries[index]
    }

    /// Get the number of tracked resources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_masks_overlap_only_on_unordered_access() {
        assert_eq!(
            ResourceState::READ_STATES & ResourceState::WRITE_STATES,
            ResourceState::UNORDERED_ACCESS
        );
    }

    #[test]
    fn test_state_classification() {
        assert!(ResourceState::NON_PIXEL_SHADER_RESOURCE.is_read());
        assert!(ResourceState::COPY_SOURCE.is_read());
        assert!(ResourceState::UNORDERED_ACCESS.is_read());
        assert!(!ResourceState::RENDER_TARGET.is_read());

        assert!(ResourceState::UNORDERED_ACCESS.is_write());
        assert!(ResourceState::DEPTH_WRITE.is_write());
        assert!(!ResourceState::INDEX_BUFFER.is_write());

        // COMMON names no concrete state, so it is neither.
        assert!(!ResourceState::COMMON.is_read());
        assert!(!ResourceState::COMMON.is_write());
    }

    #[test]
    fn test_illegal_compute_states() {
        assert!(!ResourceState::RENDER_TARGET.legal_on_compute());
        assert!(!ResourceState::PIXEL_SHADER_RESOURCE.legal_on_compute());
        assert!(!ResourceState::DEPTH_READ.legal_on_compute());
        assert!(!ResourceState::DEPTH_WRITE.legal_on_compute());

        assert!(ResourceState::UNORDERED_ACCESS.legal_on_compute());
        assert!(ResourceState::NON_PIXEL_SHADER_RESOURCE.legal_on_compute());
        assert!(ResourceState::COMMON.legal_on_compute());
    }

    #[test]
    fn test_register_and_find() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        table.register(Some(GpuResource(0x10)), 100, ResourceState::COMMON, false);
        table.register(Some(GpuResource(0x20)), 50, ResourceState::RENDER_TARGET, false);
        table.seal();

        let pos = table.find(50).unwrap();
        assert_eq!(table.entry(pos).state, ResourceState::RENDER_TARGET);
        assert!(table.find(999).is_none());

        // Sorted after seal
        assert_eq!(table.entry(0).id, 50);
        assert_eq!(table.entry(1).id, 100);
    }

    #[test]
    fn test_reregister_same_resource_is_noop() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        table.register(Some(GpuResource(0x10)), 100, ResourceState::COMMON, false);
        table.seal();

        // Mutate state as the builder would.
        table.entry_mut(0).state = ResourceState::UNORDERED_ACCESS;

        // Next frame, same native resource: state must survive.
        table.begin_frame();
        table.register(Some(GpuResource(0x10)), 100, ResourceState::COMMON, false);
        table.seal();
        assert_eq!(table.entry(0).state, ResourceState::UNORDERED_ACCESS);
    }

    #[test]
    fn test_reregister_changed_resource_overwrites() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        table.register(Some(GpuResource(0x10)), 100, ResourceState::COMMON, false);
        table.seal();
        table.entry_mut(0).state = ResourceState::UNORDERED_ACCESS;

        table.begin_frame();
        table.register(Some(GpuResource(0x99)), 100, ResourceState::RENDER_TARGET, false);
        table.seal();
        assert_eq!(table.entry(0).resource, Some(GpuResource(0x99)));
        assert_eq!(table.entry(0).state, ResourceState::RENDER_TARGET);
    }

    #[test]
    fn test_remove_keeps_sorted_order() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        for id in [30u64, 10, 20] {
            table.register(Some(GpuResource(id)), id, ResourceState::COMMON, false);
        }
        table.seal();

        table.remove(20);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entry(0).id, 10);
        assert_eq!(table.entry(1).id, 30);
        assert!(table.find(20).is_none());
    }

    #[test]
    fn test_reset_drops_window_size_dependent() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        table.register(Some(GpuResource(1)), 10, ResourceState::COMMON, false);
        table.register(Some(GpuResource(2)), 20, ResourceState::COMMON, true);
        table.register(Some(GpuResource(3)), 30, ResourceState::COMMON, false);
        table.seal();

        table.reset();
        assert_eq!(table.len(), 2);
        assert!(table.find(20).is_none());
        assert!(table.find(10).is_some());
        assert!(table.find(30).is_some());
    }

    #[test]
    fn test_dummy_registration() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        // Null resource under a reserved id is the dummy contract.
        table.register(None, 2, ResourceState::COMMON, false);
        table.seal();
        assert!(table.find(2).is_some());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reserved for dummy resources")]
    fn test_non_null_reserved_id_panics() {
        let mut table = ResourceTable::new();
        table.begin_frame();
        table.register(Some(GpuResource(0x10)), 2, ResourceState::COMMON, false);
    }
}
