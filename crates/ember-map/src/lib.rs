#![forbid(unsafe_code)]
//! Two-slot atomic commit map.
//!
//! Every object owns a pair of version-slot records inside the image, plus
//! one bit of a switch word (bit `id % 16` of word `id / 16`). The set bit
//! selects slot 1 as current, the cleared bit slot 0.
//!
//! [`CommitMap::publish`] writes the new address and validity interval into
//! the *non-current* slot and only then XOR-flips the object's switch bit in
//! a single atomic operation. Write-before-flip is the crash-atomicity
//! invariant of the whole store: power loss anywhere before the flip leaves
//! the old slot current and the half-written one invisible; power loss at or
//! after the flip exposes the fully-written new slot. No torn state is
//! observable either way, which is what makes the second slot load-bearing —
//! this must never be "simplified" to a single slot.
//!
//! The previously-current slot's address becomes reclaimable by the caller
//! once `publish` returns (update commits only; creations supersede nothing).

use ember_error::{EmberError, Result};
use ember_nvm::{Fram, FramLayout};
use ember_types::{LogicalTime, NvAddr, ObjectId, ValidityInterval};
use tracing::trace;

/// The commit map over one image layout.
#[derive(Debug, Clone)]
pub struct CommitMap {
    layout: FramLayout,
}

impl CommitMap {
    #[must_use]
    pub fn new(layout: FramLayout) -> Self {
        Self { layout }
    }

    fn check_object(&self, id: ObjectId) -> Result<usize> {
        let objects = self.layout.geometry().objects;
        if usize::from(id.0) >= objects {
            return Err(EmberError::ObjectOutOfRange {
                object: id.0,
                limit: objects,
            });
        }
        Ok(usize::from(id.0))
    }

    /// Which slot the switch bit currently marks live for `object`.
    fn current_slot(&self, fram: &Fram, object: usize) -> Result<u8> {
        let word = fram.read_u16(self.layout.switch_word_offset(object / 16))?;
        Ok(u8::from(word & (1 << (object % 16)) != 0))
    }

    /// Address of the live slot, [`NvAddr::NONE`] before the first publish.
    pub fn current_address(&self, fram: &Fram, id: ObjectId) -> Result<NvAddr> {
        let object = self.check_object(id)?;
        let slot = self.current_slot(fram, object)?;
        let offset = self.layout.slot_offset(object, slot);
        Ok(NvAddr(fram.read_u32(offset)?))
    }

    /// Validity interval stored in the live slot.
    pub fn current_interval(&self, fram: &Fram, id: ObjectId) -> Result<ValidityInterval> {
        let object = self.check_object(id)?;
        let slot = self.current_slot(fram, object)?;
        let offset = self.layout.slot_offset(object, slot);
        Ok(ValidityInterval::new(
            LogicalTime(fram.read_u32(offset + 4)?),
            LogicalTime(fram.read_u32(offset + 8)?),
        ))
    }

    /// Begin bound of the live slot's interval (the commit validation input).
    pub fn current_begin(&self, fram: &Fram, id: ObjectId) -> Result<LogicalTime> {
        Ok(self.current_interval(fram, id)?.begin)
    }

    /// Byte size recorded in the live slot.
    pub fn current_size(&self, fram: &Fram, id: ObjectId) -> Result<usize> {
        let object = self.check_object(id)?;
        let slot = self.current_slot(fram, object)?;
        let offset = self.layout.slot_offset(object, slot);
        usize::try_from(fram.read_u32(offset + 12)?)
            .map_err(|_| EmberError::LayoutOverflow { region: "object size" })
    }

    /// Publish a new version of `id`: fill the non-current slot, then flip.
    ///
    /// The slot fields (address, interval, size) are ordinary (tearable)
    /// writes; the flip is the single atomic commit point. Nothing here may
    /// be reordered or coalesced.
    pub fn publish(
        &self,
        fram: &mut Fram,
        id: ObjectId,
        addr: NvAddr,
        interval: ValidityInterval,
        size: usize,
    ) -> Result<()> {
        let object = self.check_object(id)?;
        let target = 1 - self.current_slot(fram, object)?;
        let offset = self.layout.slot_offset(object, target);
        let size = u32::try_from(size)
            .map_err(|_| EmberError::LayoutOverflow { region: "object size" })?;

        fram.write_u32(offset, addr.0)?;
        fram.write_u32(offset + 4, interval.begin.0)?;
        fram.write_u32(offset + 8, interval.end.0)?;
        fram.write_u32(offset + 12, size)?;

        trace!(object = id.0, slot = target, %addr, %interval, size, "publish");

        // The atomic commit point.
        fram.flip_bits_u16(
            self.layout.switch_word_offset(object / 16),
            1_u16 << (object % 16),
        )
    }

    /// Reset the whole map: all switch bits cleared, both slots of every
    /// object emptied. Cold start only.
    pub fn format(&self, fram: &mut Fram) -> Result<()> {
        for word in 0..self.layout.switch_word_count() {
            fram.write_u16(self.layout.switch_word_offset(word), 0)?;
        }
        for object in 0..self.layout.geometry().objects {
            for slot in 0..2_u8 {
                let offset = self.layout.slot_offset(object, slot);
                fram.write_u32(offset, NvAddr::NONE.0)?;
                fram.write_u32(offset + 4, 0)?;
                fram.write_u32(offset + 8, 0)?;
                fram.write_u32(offset + 12, 0)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_nvm::{apply_ops_prefix, ops_total_bytes};
    use ember_types::StoreGeometry;

    fn setup() -> (CommitMap, Fram) {
        let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
        let mut fram = Fram::new(layout.total_len());
        let map = CommitMap::new(layout);
        map.format(&mut fram).expect("format");
        (map, fram)
    }

    fn iv(begin: u32, end: u32) -> ValidityInterval {
        ValidityInterval::new(LogicalTime(begin), LogicalTime(end))
    }

    #[test]
    fn fresh_map_has_no_addresses() {
        let (map, fram) = setup();
        for id in 0..16_u16 {
            assert_eq!(
                map.current_address(&fram, ObjectId(id)).expect("addr"),
                NvAddr::NONE
            );
            assert_eq!(
                map.current_interval(&fram, ObjectId(id)).expect("iv"),
                iv(0, 0)
            );
        }
    }

    #[test]
    fn publish_switches_slots() {
        let (map, mut fram) = setup();
        let id = ObjectId(3);

        map.publish(&mut fram, id, NvAddr(0x100), iv(1, 5), 4).expect("p1");
        assert_eq!(map.current_address(&fram, id).expect("addr"), NvAddr(0x100));
        assert_eq!(map.current_interval(&fram, id).expect("iv"), iv(1, 5));
        assert_eq!(map.current_size(&fram, id).expect("size"), 4);

        map.publish(&mut fram, id, NvAddr(0x200), iv(6, 9), 8).expect("p2");
        assert_eq!(map.current_address(&fram, id).expect("addr"), NvAddr(0x200));
        assert_eq!(map.current_interval(&fram, id).expect("iv"), iv(6, 9));
        assert_eq!(map.current_size(&fram, id).expect("size"), 8);

        // A third publish reuses the first slot.
        map.publish(&mut fram, id, NvAddr(0x300), iv(10, 12), 2).expect("p3");
        assert_eq!(map.current_address(&fram, id).expect("addr"), NvAddr(0x300));
    }

    #[test]
    fn objects_flip_independent_bits() {
        let (map, mut fram) = setup();
        map.publish(&mut fram, ObjectId(0), NvAddr(0x10), iv(0, 1), 1).expect("p");
        map.publish(&mut fram, ObjectId(15), NvAddr(0x20), iv(0, 2), 1).expect("p");

        assert_eq!(
            map.current_address(&fram, ObjectId(0)).expect("addr"),
            NvAddr(0x10)
        );
        assert_eq!(
            map.current_address(&fram, ObjectId(15)).expect("addr"),
            NvAddr(0x20)
        );
        assert_eq!(
            map.current_address(&fram, ObjectId(7)).expect("addr"),
            NvAddr::NONE
        );
    }

    #[test]
    fn out_of_range_is_typed() {
        let (map, mut fram) = setup();
        assert!(matches!(
            map.current_address(&fram, ObjectId(16)),
            Err(EmberError::ObjectOutOfRange { .. })
        ));
        assert!(matches!(
            map.publish(&mut fram, ObjectId(99), NvAddr(0), iv(0, 0), 0),
            Err(EmberError::ObjectOutOfRange { .. })
        ));
    }

    /// Power loss at every byte boundary of a publish: before the flip the
    /// old version is current, at/after it the new one. Never a torn mix.
    #[test]
    fn publish_is_atomic_at_every_byte_boundary() {
        let (map, mut fram) = setup();
        let id = ObjectId(5);
        map.publish(&mut fram, id, NvAddr(0xAAAA), iv(2, 7), 6).expect("seed");

        let base = fram.snapshot();
        fram.set_write_log(true);
        map.publish(&mut fram, id, NvAddr(0xBBBB), iv(8, 11), 6).expect("publish");
        let ops = fram.take_write_log();
        let total = ops_total_bytes(&ops);
        // 4 slot field writes + the flip.
        assert_eq!(total, 18);

        for budget in 0..=total {
            let mut image = base.clone();
            let applied = apply_ops_prefix(&mut image, &ops, budget);
            let crashed = Fram::from_bytes(image);

            let addr = map.current_address(&crashed, id).expect("addr");
            let interval = map.current_interval(&crashed, id).expect("iv");
            if applied < total {
                // The flip never landed: the old version must be intact.
                assert_eq!(addr, NvAddr(0xAAAA), "budget {budget}");
                assert_eq!(interval, iv(2, 7), "budget {budget}");
            } else {
                assert_eq!(addr, NvAddr(0xBBBB), "budget {budget}");
                assert_eq!(interval, iv(8, 11), "budget {budget}");
            }
        }
    }

    /// Same sweep, but crashing during the very first publish of an object.
    #[test]
    fn first_publish_is_atomic() {
        let (map, mut fram) = setup();
        let id = ObjectId(0);

        let base = fram.snapshot();
        fram.set_write_log(true);
        map.publish(&mut fram, id, NvAddr(0x40), iv(0, 3), 4).expect("publish");
        let ops = fram.take_write_log();
        let total = ops_total_bytes(&ops);

        for budget in 0..total {
            let mut image = base.clone();
            let applied = apply_ops_prefix(&mut image, &ops, budget);
            if applied == total {
                continue;
            }
            let crashed = Fram::from_bytes(image);
            assert_eq!(
                map.current_address(&crashed, id).expect("addr"),
                NvAddr::NONE,
                "budget {budget}"
            );
        }
    }
}
