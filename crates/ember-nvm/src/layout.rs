//! Persisted layout of the FRAM image.
//!
//! Every region that must survive power loss bit-for-bit sits at a fixed
//! offset derived from the [`StoreGeometry`]:
//!
//! ```text
//! +--------------------+
//! | header             |  magic, version, provisioned flag, failure count
//! +--------------------+
//! | map switch words   |  ceil(objects/16) x u16, bit (id % 16) of word (id / 16)
//! | slot pair records  |  objects x 2 x { addr u32, begin u32, end u32, size u32 }
//! | next object id     |  u32
//! | logical time       |  u32
//! +--------------------+
//! | registry entries   |  tasks x { entry u32, priority u16, tcb_num u32,
//! |                    |            tcb_addr u32, sched_owned u8, task u16,
//! |                    |            unfinished u8 }
//! | recreate counters  |  tasks x u16
//! | run flags          |  tasks x u8
//! | location flags     |  tasks x u8
//! | task entry points  |  tasks x { entry u32, priority u16 }
//! +--------------------+
//! | heap pool indices  |  tasks x u32
//! | data pool indices  |  tasks x u32
//! | heap pools         |  tasks x heap_pool_bytes
//! | data pools         |  tasks x data_pool_bytes
//! | stack regions      |  tasks x stack_bytes
//! | tcb regions        |  tasks x tcb_bytes
//! +--------------------+
//! ```
//!
//! All fields are little-endian. The layout is fixed at provisioning time;
//! opening an image with a different geometry than the one it was formatted
//! with is undetectable here and must be prevented by the caller (the
//! harness frames saved images with the geometry for exactly this reason).

use crate::Fram;
use ember_error::{EmberError, Result};
use ember_types::StoreGeometry;

/// Image magic ("EMBR", little-endian).
pub const FRAM_MAGIC: u32 = 0x5242_4D45;

/// Current image format version.
pub const FRAM_VERSION: u16 = 1;

/// Header size in bytes: magic u32, version u16, provisioned u8, reserved u8,
/// fail_count u32.
pub const HEADER_SIZE: usize = 12;

/// Bytes per version-slot record: addr u32, begin u32, end u32, size u32.
///
/// The size lives inside the record so the switch-bit flip covers it
/// atomically together with the address and interval.
pub const SLOT_BYTES: usize = 16;

/// Bytes per recovery-registry entry.
pub const REGISTRY_ENTRY_BYTES: usize = 18;

/// Bytes per task entry-point record: entry u32, priority u16.
pub const ENTRY_POINT_BYTES: usize = 6;

/// Parsed image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Whether the image has been through a complete cold boot. A warm boot
    /// branches to recovery if and only if this is set.
    pub provisioned: bool,
    /// Number of power failures survived (diagnostic).
    pub fail_count: u32,
}

impl Header {
    /// Write this header (plus magic and version) at the head of the image.
    pub fn store(&self, fram: &mut Fram) -> Result<()> {
        fram.write_u32(0, FRAM_MAGIC)?;
        fram.write_u16(4, FRAM_VERSION)?;
        fram.write_u8(6, u8::from(self.provisioned))?;
        fram.write_u8(7, 0)?;
        fram.write_u32(8, self.fail_count)
    }

    /// Read and validate the header at the head of the image.
    pub fn load(fram: &Fram) -> Result<Self> {
        let magic = fram.read_u32(0)?;
        if magic != FRAM_MAGIC {
            return Err(EmberError::ImageCorrupt {
                detail: format!("bad magic: expected {FRAM_MAGIC:#010x}, got {magic:#010x}"),
            });
        }
        let version = fram.read_u16(4)?;
        if version != FRAM_VERSION {
            return Err(EmberError::ImageCorrupt {
                detail: format!("unsupported image version {version} (expected {FRAM_VERSION})"),
            });
        }
        Ok(Self {
            provisioned: fram.read_u8(6)? != 0,
            fail_count: fram.read_u32(8)?,
        })
    }
}

/// Offsets of every persisted region, derived once from the geometry.
#[derive(Debug, Clone)]
pub struct FramLayout {
    geometry: StoreGeometry,
    switch_words: usize,
    switch_word_count: usize,
    slots: usize,
    next_object_id: usize,
    logical_time: usize,
    registry: usize,
    recreate: usize,
    run_flags: usize,
    loc_flags: usize,
    entry_table: usize,
    heap_indices: usize,
    data_indices: usize,
    heap_pools: usize,
    data_pools: usize,
    stacks: usize,
    tcbs: usize,
    total_len: usize,
}

fn place(cursor: &mut usize, bytes: usize, region: &'static str) -> Result<usize> {
    let start = *cursor;
    *cursor = cursor
        .checked_add(bytes)
        .ok_or(EmberError::LayoutOverflow { region })?;
    Ok(start)
}

impl FramLayout {
    /// Compute the layout for a validated geometry.
    pub fn new(geometry: StoreGeometry) -> Result<Self> {
        geometry
            .validate()
            .map_err(|e| EmberError::InvalidGeometry(e.to_string()))?;

        let switch_word_count = geometry.objects.div_ceil(16);
        let mut cursor = HEADER_SIZE;

        let switch_words = place(&mut cursor, switch_word_count * 2, "switch words")?;
        let slots = place(&mut cursor, geometry.objects * 2 * SLOT_BYTES, "slots")?;
        let next_object_id = place(&mut cursor, 4, "next object id")?;
        let logical_time = place(&mut cursor, 4, "logical time")?;
        let registry = place(
            &mut cursor,
            geometry.tasks * REGISTRY_ENTRY_BYTES,
            "registry",
        )?;
        let recreate = place(&mut cursor, geometry.tasks * 2, "recreate counters")?;
        let run_flags = place(&mut cursor, geometry.tasks, "run flags")?;
        let loc_flags = place(&mut cursor, geometry.tasks, "location flags")?;
        let entry_table = place(
            &mut cursor,
            geometry.tasks * ENTRY_POINT_BYTES,
            "entry table",
        )?;
        let heap_indices = place(&mut cursor, geometry.tasks * 4, "heap indices")?;
        let data_indices = place(&mut cursor, geometry.tasks * 4, "data indices")?;
        let heap_pools = place(
            &mut cursor,
            geometry
                .tasks
                .checked_mul(geometry.heap_pool_bytes)
                .ok_or(EmberError::LayoutOverflow {
                    region: "heap pools",
                })?,
            "heap pools",
        )?;
        let data_pools = place(
            &mut cursor,
            geometry
                .tasks
                .checked_mul(geometry.data_pool_bytes)
                .ok_or(EmberError::LayoutOverflow {
                    region: "data pools",
                })?,
            "data pools",
        )?;
        let stacks = place(
            &mut cursor,
            geometry
                .tasks
                .checked_mul(geometry.stack_bytes)
                .ok_or(EmberError::LayoutOverflow { region: "stacks" })?,
            "stacks",
        )?;
        let tcbs = place(
            &mut cursor,
            geometry
                .tasks
                .checked_mul(geometry.tcb_bytes)
                .ok_or(EmberError::LayoutOverflow { region: "tcbs" })?,
            "tcbs",
        )?;

        Ok(Self {
            geometry,
            switch_words,
            switch_word_count,
            slots,
            next_object_id,
            logical_time,
            registry,
            recreate,
            run_flags,
            loc_flags,
            entry_table,
            heap_indices,
            data_indices,
            heap_pools,
            data_pools,
            stacks,
            tcbs,
            total_len: cursor,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &StoreGeometry {
        &self.geometry
    }

    /// Image size in bytes for this layout.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    #[must_use]
    pub fn switch_word_count(&self) -> usize {
        self.switch_word_count
    }

    #[must_use]
    pub fn switch_word_offset(&self, word: usize) -> usize {
        self.switch_words + word * 2
    }

    /// Offset of one slot record of an object's pair (`slot` is 0 or 1).
    #[must_use]
    pub fn slot_offset(&self, object: usize, slot: u8) -> usize {
        self.slots + (object * 2 + usize::from(slot)) * SLOT_BYTES
    }

    #[must_use]
    pub fn next_object_id_offset(&self) -> usize {
        self.next_object_id
    }

    #[must_use]
    pub fn logical_time_offset(&self) -> usize {
        self.logical_time
    }

    #[must_use]
    pub fn registry_entry_offset(&self, slot: usize) -> usize {
        self.registry + slot * REGISTRY_ENTRY_BYTES
    }

    #[must_use]
    pub fn recreate_offset(&self, task: usize) -> usize {
        self.recreate + task * 2
    }

    #[must_use]
    pub fn run_flag_offset(&self, task: usize) -> usize {
        self.run_flags + task
    }

    #[must_use]
    pub fn loc_flag_offset(&self, task: usize) -> usize {
        self.loc_flags + task
    }

    #[must_use]
    pub fn entry_point_offset(&self, task: usize) -> usize {
        self.entry_table + task * ENTRY_POINT_BYTES
    }

    #[must_use]
    pub fn heap_index_offset(&self, task: usize) -> usize {
        self.heap_indices + task * 4
    }

    #[must_use]
    pub fn data_index_offset(&self, task: usize) -> usize {
        self.data_indices + task * 4
    }

    #[must_use]
    pub fn heap_pool_offset(&self, task: usize) -> usize {
        self.heap_pools + task * self.geometry.heap_pool_bytes
    }

    #[must_use]
    pub fn data_pool_offset(&self, task: usize) -> usize {
        self.data_pools + task * self.geometry.data_pool_bytes
    }

    #[must_use]
    pub fn stack_offset(&self, task: usize) -> usize {
        self.stacks + task * self.geometry.stack_bytes
    }

    #[must_use]
    pub fn tcb_offset(&self, task: usize) -> usize {
        self.tcbs + task * self.geometry.tcb_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
        let mut fram = Fram::new(layout.total_len());
        Header {
            provisioned: true,
            fail_count: 3,
        }
        .store(&mut fram)
        .expect("store");

        let header = Header::load(&fram).expect("load");
        assert!(header.provisioned);
        assert_eq!(header.fail_count, 3);
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
        let mut fram = Fram::new(layout.total_len());
        assert!(matches!(
            Header::load(&fram),
            Err(EmberError::ImageCorrupt { .. })
        ));

        fram.write_u32(0, FRAM_MAGIC).expect("magic");
        fram.write_u16(4, 99).expect("version");
        assert!(matches!(
            Header::load(&fram),
            Err(EmberError::ImageCorrupt { .. })
        ));
    }

    #[test]
    fn regions_do_not_overlap() {
        let geometry = StoreGeometry::default();
        let layout = FramLayout::new(geometry).expect("layout");

        // 16 objects fit one switch word.
        assert_eq!(layout.switch_word_count(), 1);

        // Walk the regions in order and check strict monotonicity.
        let boundaries = [
            HEADER_SIZE,
            layout.switch_word_offset(0),
            layout.slot_offset(0, 0),
            layout.next_object_id_offset(),
            layout.logical_time_offset(),
            layout.registry_entry_offset(0),
            layout.recreate_offset(0),
            layout.run_flag_offset(0),
            layout.loc_flag_offset(0),
            layout.entry_point_offset(0),
            layout.heap_index_offset(0),
            layout.data_index_offset(0),
            layout.heap_pool_offset(0),
            layout.data_pool_offset(0),
            layout.stack_offset(0),
            layout.tcb_offset(0),
        ];
        for pair in boundaries.windows(2) {
            assert!(pair[0] <= pair[1], "region order violated: {pair:?}");
        }

        // The last task's TCB region ends exactly at the image length.
        assert_eq!(
            layout.tcb_offset(geometry.tasks - 1) + geometry.tcb_bytes,
            layout.total_len()
        );
    }

    #[test]
    fn slot_records_are_adjacent() {
        let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
        assert_eq!(
            layout.slot_offset(0, 1),
            layout.slot_offset(0, 0) + SLOT_BYTES
        );
        assert_eq!(
            layout.slot_offset(1, 0),
            layout.slot_offset(0, 0) + 2 * SLOT_BYTES
        );
    }

    #[test]
    fn rejects_invalid_geometry() {
        let mut geometry = StoreGeometry::default();
        geometry.objects = 0;
        assert!(matches!(
            FramLayout::new(geometry),
            Err(EmberError::InvalidGeometry(_))
        ));
    }
}
