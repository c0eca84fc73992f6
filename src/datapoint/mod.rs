//! Packed terrain data points
//!
//! A data point describes one vertical run of terrain in a column: which
//! interned (block-state, biome) identity it is, the y range it spans, its
//! light levels and how far world generation had progressed when it was
//! produced. Everything is packed into a single 64-bit word so columns are
//! flat `u64` arrays on disk and in memory.

pub mod id_map;

pub use id_map::{IdEntry, IdMap};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// Bit layout, LSB first:
//   gen_step:4 | block_light:4 | sky_light:4 | bottom_y:12 | top_y:12 | id:28
const GEN_STEP_SHIFT: u64 = 0;
const BLOCK_LIGHT_SHIFT: u64 = 4;
const SKY_LIGHT_SHIFT: u64 = 8;
const BOTTOM_Y_SHIFT: u64 = 12;
const TOP_Y_SHIFT: u64 = 24;
const ID_SHIFT: u64 = 36;

const LIGHT_MASK: u64 = 0xF;
const GEN_STEP_MASK: u64 = 0xF;
const Y_MASK: u64 = 0xFFF;
const ID_MASK: u64 = 0xFFF_FFFF;

/// Largest id an `IdMap` may hand out before data points can no longer
/// reference it.
pub const MAX_ID: u32 = ID_MASK as u32;

/// Largest encodable y value (stored values are host-offset so the range
/// starts at zero).
pub const MAX_Y: u16 = Y_MASK as u16;

/// One packed terrain run. The all-zero word is the void sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPoint(pub u64);

impl DataPoint {
    pub const VOID: DataPoint = DataPoint(0);

    pub fn new(id: u32, top_y: u16, bottom_y: u16, sky_light: u8, block_light: u8, gen_step: u8) -> Self {
        debug_assert!(id <= MAX_ID, "id {} exceeds data point id field", id);
        debug_assert!(top_y <= MAX_Y && bottom_y <= MAX_Y, "y out of range");
        debug_assert!(bottom_y <= top_y, "inverted run: bottom {} above top {}", bottom_y, top_y);
        debug_assert!(sky_light <= 15 && block_light <= 15, "light out of range");
        debug_assert!(gen_step <= 15, "gen step out of range");

        DataPoint(
            ((id as u64) << ID_SHIFT)
                | ((top_y as u64) << TOP_Y_SHIFT)
                | ((bottom_y as u64) << BOTTOM_Y_SHIFT)
                | ((sky_light as u64) << SKY_LIGHT_SHIFT)
                | ((block_light as u64) << BLOCK_LIGHT_SHIFT)
                | ((gen_step as u64) << GEN_STEP_SHIFT),
        )
    }

    #[inline(always)]
    pub fn id(self) -> u32 {
        ((self.0 >> ID_SHIFT) & ID_MASK) as u32
    }

    #[inline(always)]
    pub fn top_y(self) -> u16 {
        ((self.0 >> TOP_Y_SHIFT) & Y_MASK) as u16
    }

    #[inline(always)]
    pub fn bottom_y(self) -> u16 {
        ((self.0 >> BOTTOM_Y_SHIFT) & Y_MASK) as u16
    }

    #[inline(always)]
    pub fn sky_light(self) -> u8 {
        ((self.0 >> SKY_LIGHT_SHIFT) & LIGHT_MASK) as u8
    }

    #[inline(always)]
    pub fn block_light(self) -> u8 {
        ((self.0 >> BLOCK_LIGHT_SHIFT) & LIGHT_MASK) as u8
    }

    #[inline(always)]
    pub fn gen_step(self) -> u8 {
        ((self.0 >> GEN_STEP_SHIFT) & GEN_STEP_MASK) as u8
    }

    #[inline(always)]
    pub fn is_void(self) -> bool {
        self.0 == 0
    }

    /// Height of the run in units.
    pub fn height(self) -> u16 {
        self.top_y() - self.bottom_y()
    }

    /// Rewrite only the id bits, leaving every other field untouched.
    /// Used whenever points cross between sources with different id maps.
    #[inline(always)]
    pub fn remap(self, table: &[u32]) -> DataPoint {
        let new_id = table[self.id() as usize];
        debug_assert!(new_id <= MAX_ID);
        DataPoint((self.0 & !(ID_MASK << ID_SHIFT)) | ((new_id as u64) << ID_SHIFT))
    }
}

/// Total order deciding which of two overlapping points survives a merge:
/// the further-generated point wins, then real data beats void. `Equal`
/// means the caller should keep the more recently produced point.
pub fn compare_priority(a: DataPoint, b: DataPoint) -> Ordering {
    match a.gen_step().cmp(&b.gen_step()) {
        Ordering::Equal => (!a.is_void()).cmp(&!b.is_void()),
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        let point = DataPoint::new(0x0ABCDEF, 300, 64, 15, 7, 9);
        assert_eq!(point.id(), 0x0ABCDEF);
        assert_eq!(point.top_y(), 300);
        assert_eq!(point.bottom_y(), 64);
        assert_eq!(point.sky_light(), 15);
        assert_eq!(point.block_light(), 7);
        assert_eq!(point.gen_step(), 9);
        assert_eq!(point.height(), 236);
        assert!(!point.is_void());
    }

    #[test]
    fn test_field_extremes() {
        let point = DataPoint::new(MAX_ID, MAX_Y, MAX_Y, 15, 15, 15);
        assert_eq!(point.id(), MAX_ID);
        assert_eq!(point.top_y(), MAX_Y);
        assert_eq!(point.bottom_y(), MAX_Y);
        // id occupies the top 28 bits, so the word's top nibble is saturated
        assert_eq!(point.0 >> 60, 0xF);
    }

    #[test]
    fn test_void_sentinel() {
        assert!(DataPoint::VOID.is_void());
        assert!(!DataPoint::new(1, 1, 0, 0, 0, 0).is_void());
    }

    #[test]
    fn test_priority_gen_step_wins() {
        let early = DataPoint::new(3, 100, 0, 0, 0, 2);
        let late = DataPoint::new(4, 90, 0, 0, 0, 8);
        assert_eq!(compare_priority(early, late), Ordering::Less);
        assert_eq!(compare_priority(late, early), Ordering::Greater);
    }

    #[test]
    fn test_priority_non_void_beats_void_on_tie() {
        let real = DataPoint::new(2, 50, 0, 0, 0, 0);
        assert_eq!(compare_priority(DataPoint::VOID, real), Ordering::Less);
        assert_eq!(compare_priority(real, real), Ordering::Equal);
    }

    #[test]
    fn test_remap_touches_only_id() {
        let table = vec![0u32, 7, 42];
        let point = DataPoint::new(2, 128, 16, 12, 3, 5);
        let remapped = point.remap(&table);
        assert_eq!(remapped.id(), 42);
        assert_eq!(remapped.top_y(), point.top_y());
        assert_eq!(remapped.bottom_y(), point.bottom_y());
        assert_eq!(remapped.sky_light(), point.sky_light());
        assert_eq!(remapped.block_light(), point.block_light());
        assert_eq!(remapped.gen_step(), point.gen_step());
    }
}
