//! Per-item capability masks for cheap query rejection
//!
//! Every file carries a 32-bit mask with one bit per metadata category it has
//! populated. A folder's mask is the OR of everything below it. A query
//! computes the bits it *requires*; any item whose mask lacks one of those
//! bits cannot match and is skipped without running the full matcher.
//!
//! The test is one-sided: a set bit only says "might match".

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::models::FileMetadata;

/// Metadata categories tracked in bloom bits
///
/// The discriminant is the bit position. Bits 30 and 31 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum BloomCategory {
    Album = 0,
    Artist = 1,
    Camera = 2,
    Comment = 3,
    Copyright = 4,
    Description = 5,
    Duration = 6,
    Exposure = 7,
    FNumber = 8,
    FocalLength = 9,
    Genre = 10,
    Location = 11,
    Iso = 12,
    Lens = 13,
    Rating = 14,
    Tag = 15,
    Text = 16,
    Year = 17,
    Dimensions = 18,
    Place = 19,
}

impl BloomCategory {
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// Bits 30 and 31 never come from metadata
pub const RESERVED_BITS: u32 = 0b11 << 30;

/// A 32-bit "might have property X" mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BloomBits(u32);

impl BloomBits {
    pub const EMPTY: BloomBits = BloomBits(0);

    pub const fn from_raw(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, category: BloomCategory) -> Self {
        Self(self.0 | category.bit())
    }

    pub fn contains(self, category: BloomCategory) -> bool {
        self.0 & category.bit() != 0
    }

    pub fn union(self, other: BloomBits) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: BloomBits) -> Self {
        Self(self.0 & other.0)
    }

    /// True when every bit the query requires is present here
    pub fn potential_match(self, query_bits: BloomBits) -> bool {
        self.0 & query_bits.0 == query_bits.0
    }

    /// Categories whose bit is set, in bit order
    pub fn categories(self) -> impl Iterator<Item = BloomCategory> {
        BloomCategory::iter().filter(move |c| self.contains(*c))
    }

    /// Bloom bits of a file, a pure function of its populated metadata
    pub fn compute(metadata: Option<&FileMetadata>) -> Self {
        let Some(meta) = metadata else {
            return Self::EMPTY;
        };

        let mut bits = Self::EMPTY;
        let mut set = |present: bool, category: BloomCategory| {
            if present {
                bits = bits.with(category);
            }
        };

        set(meta.album.is_some(), BloomCategory::Album);
        set(meta.artist.is_some(), BloomCategory::Artist);
        set(meta.camera_make.is_some() || meta.camera_model.is_some(), BloomCategory::Camera);
        set(meta.comment.is_some(), BloomCategory::Comment);
        set(meta.copyright.is_some(), BloomCategory::Copyright);
        set(meta.description.is_some(), BloomCategory::Description);
        set(meta.duration_secs.is_some(), BloomCategory::Duration);
        set(meta.exposure_secs.is_some(), BloomCategory::Exposure);
        set(meta.f_number.is_some(), BloomCategory::FNumber);
        set(meta.focal_length_mm.is_some(), BloomCategory::FocalLength);
        set(meta.genre.is_some(), BloomCategory::Genre);
        set(meta.gps.is_some(), BloomCategory::Location);
        set(meta.iso.is_some(), BloomCategory::Iso);
        set(meta.lens.is_some(), BloomCategory::Lens);
        set(meta.rating.is_some(), BloomCategory::Rating);
        set(!meta.tags.is_empty(), BloomCategory::Tag);
        set(meta.title.is_some(), BloomCategory::Text);
        set(meta.taken.is_some(), BloomCategory::Year);
        set(meta.width.is_some() && meta.height.is_some(), BloomCategory::Dimensions);
        set(
            meta.place.is_some() || meta.state.is_some() || meta.country.is_some(),
            BloomCategory::Place,
        );

        debug_assert_eq!(bits.0 & RESERVED_BITS, 0);
        bits
    }
}

impl std::ops::BitOr for BloomBits {
    type Output = BloomBits;

    fn bitor(self, rhs: BloomBits) -> BloomBits {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for BloomBits {
    fn bitor_assign(&mut self, rhs: BloomBits) {
        self.0 |= rhs.0;
    }
}

impl From<BloomCategory> for BloomBits {
    fn from(category: BloomCategory) -> Self {
        BloomBits(category.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoCoord;

    #[test]
    fn test_compute_empty() {
        assert_eq!(BloomBits::compute(None), BloomBits::EMPTY);
        assert_eq!(BloomBits::compute(Some(&FileMetadata::default())), BloomBits::EMPTY);
    }

    #[test]
    fn test_compute_sets_populated_categories() {
        let meta = FileMetadata {
            tags: vec!["cat".into()],
            gps: Some(GeoCoord::new(1.0, 2.0)),
            camera_model: Some("X100".into()),
            ..Default::default()
        };
        let bits = BloomBits::compute(Some(&meta));

        assert!(bits.contains(BloomCategory::Tag));
        assert!(bits.contains(BloomCategory::Location));
        assert!(bits.contains(BloomCategory::Camera));
        assert!(!bits.contains(BloomCategory::Album));
        assert_eq!(
            bits.categories().collect::<Vec<_>>(),
            vec![BloomCategory::Camera, BloomCategory::Location, BloomCategory::Tag]
        );
    }

    #[test]
    fn test_potential_match_has_no_false_negatives() {
        let meta = FileMetadata {
            tags: vec!["cat".into()],
            album: Some("Summer".into()),
            rating: Some(4),
            ..Default::default()
        };
        let item = BloomBits::compute(Some(&meta));

        // Every subset of the item's own bits must pass
        let raw = item.raw();
        let mut subset = raw;
        loop {
            assert!(item.potential_match(BloomBits::from_raw(subset)));
            if subset == 0 {
                break;
            }
            subset = (subset - 1) & raw;
        }

        assert!(!item.potential_match(BloomCategory::Location.into()));
    }

    #[test]
    fn test_reserved_bits_untouched() {
        for category in BloomCategory::iter() {
            assert_eq!(category.bit() & RESERVED_BITS, 0, "{} uses a reserved bit", category);
        }
    }
}
