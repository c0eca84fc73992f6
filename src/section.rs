use serde::{Deserialize, Serialize};

/// Highest detail level a section position may carry.
///
/// Level 0 is a single unit column; each increment doubles the side length,
/// so level 30 already covers a billion-unit square.
pub const MAX_DETAIL: u8 = 30;

/// Position of one quadtree cell: (detail level, x, z) in cell coordinates
/// at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionPos {
    pub detail: u8,
    pub x: i32,
    pub z: i32,
}

impl SectionPos {
    pub fn new(detail: u8, x: i32, z: i32) -> Self {
        assert!(detail <= MAX_DETAIL, "detail level {} out of range", detail);
        Self { detail, x, z }
    }

    /// Side length of this cell in level-0 units.
    pub fn width_in_units(&self) -> i64 {
        1i64 << self.detail
    }

    /// Minimum corner of this cell in level-0 unit coordinates.
    pub fn min_unit_corner(&self) -> (i64, i64) {
        let w = self.width_in_units();
        (self.x as i64 * w, self.z as i64 * w)
    }

    /// Child cell at the next finer level. Index layout:
    /// bit 0 selects the +x half, bit 1 selects the +z half.
    pub fn child(&self, index: u8) -> SectionPos {
        assert!(self.detail > 0, "level-0 section has no children");
        assert!(index < 4, "child index {} out of range", index);
        SectionPos {
            detail: self.detail - 1,
            x: self.x * 2 + (index & 1) as i32,
            z: self.z * 2 + (index >> 1) as i32,
        }
    }

    /// All four children, in child-index order.
    pub fn children(&self) -> [SectionPos; 4] {
        [self.child(0), self.child(1), self.child(2), self.child(3)]
    }

    /// Enclosing cell at the next coarser level. Floor division keeps the
    /// mapping bijective for negative coordinates.
    pub fn parent(&self) -> SectionPos {
        assert!(self.detail < MAX_DETAIL, "section already at coarsest level");
        SectionPos {
            detail: self.detail + 1,
            x: self.x.div_euclid(2),
            z: self.z.div_euclid(2),
        }
    }

    /// Which of its parent's four children this cell is.
    pub fn child_index(&self) -> u8 {
        (self.x.rem_euclid(2) + self.z.rem_euclid(2) * 2) as u8
    }

    /// Whether the unit-space areas of the two cells intersect.
    pub fn overlaps(&self, other: &SectionPos) -> bool {
        let (ax, az) = self.min_unit_corner();
        let aw = self.width_in_units();
        let (bx, bz) = other.min_unit_corner();
        let bw = other.width_in_units();
        ax < bx + bw && bx < ax + aw && az < bz + bw && bz < az + aw
    }

    /// Whether this cell's area fully contains `other`'s area.
    pub fn contains(&self, other: &SectionPos) -> bool {
        let (ax, az) = self.min_unit_corner();
        let aw = self.width_in_units();
        let (bx, bz) = other.min_unit_corner();
        let bw = other.width_in_units();
        ax <= bx && bx + bw <= ax + aw && az <= bz && bz + bw <= az + aw
    }

    /// This cell's ancestor (or itself) at the given coarser level.
    pub fn at_detail(&self, detail: u8) -> SectionPos {
        assert!(detail >= self.detail, "at_detail only coarsens");
        let shift = detail - self.detail;
        SectionPos {
            detail,
            x: self.x >> shift,
            z: self.z >> shift,
        }
    }
}

impl std::fmt::Display for SectionPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] ({}, {})", self.detail, self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_bijection() {
        for detail in 1..=6u8 {
            for x in -5..5 {
                for z in -5..5 {
                    let pos = SectionPos::new(detail, x, z);
                    for i in 0..4 {
                        let child = pos.child(i);
                        assert_eq!(child.parent(), pos);
                        assert_eq!(child.child_index(), i);
                    }
                }
            }
        }
    }

    #[test]
    fn test_children_partition_parent_area() {
        let pos = SectionPos::new(3, -2, 7);
        let children = pos.children();

        // Disjoint pairwise, each contained in the parent.
        for (i, a) in children.iter().enumerate() {
            assert!(pos.contains(a));
            for b in children.iter().skip(i + 1) {
                assert!(!a.overlaps(b));
            }
        }

        // Combined area equals the parent's area.
        let child_area: i64 = children
            .iter()
            .map(|c| c.width_in_units() * c.width_in_units())
            .sum();
        assert_eq!(child_area, pos.width_in_units() * pos.width_in_units());
    }

    #[test]
    fn test_negative_coordinates_round_toward_negative_infinity() {
        let pos = SectionPos::new(0, -1, -1);
        assert_eq!(pos.parent(), SectionPos::new(1, -1, -1));
        assert_eq!(pos.child_index(), 3);

        let pos = SectionPos::new(0, -2, -2);
        assert_eq!(pos.parent(), SectionPos::new(1, -1, -1));
        assert_eq!(pos.child_index(), 0);
    }

    #[test]
    fn test_overlaps() {
        let coarse = SectionPos::new(4, 0, 0);
        let inside = SectionPos::new(1, 3, 3);
        let outside = SectionPos::new(1, 9, 0);
        assert!(coarse.overlaps(&inside));
        assert!(coarse.contains(&inside));
        assert!(!coarse.overlaps(&outside));
        assert!(inside.overlaps(&coarse));
    }

    #[test]
    fn test_at_detail() {
        let fine = SectionPos::new(0, 13, -13);
        assert_eq!(fine.at_detail(2), SectionPos::new(2, 3, -4));
        assert!(fine.at_detail(2).contains(&fine));
    }

    #[test]
    fn test_width_in_units() {
        assert_eq!(SectionPos::new(0, 0, 0).width_in_units(), 1);
        assert_eq!(SectionPos::new(4, 0, 0).width_in_units(), 16);
    }
}
