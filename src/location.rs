//! Spatial locators and their packed on-disk form.
//!
//! A locator is stored as a short type tag plus a slice of a flat `f64`
//! payload. The tag vocabulary changed twice over the schema history, and
//! files merged across versions may mix vocabularies, so decoding looks at
//! each tag on its own rather than at the file version.
//!
//! | Scheme     | Versions | Index            | Coordinate           | Multi-index               | None   |
//! |------------|----------|------------------|----------------------|---------------------------|--------|
//! | class name | 3.0–3.1  | `IndexLocation`  | `CoordinateLocation` | `MultiIndexLocation:<n>`  | `None` |
//! | letter     | 3.2      | `I`              | `C`                  | `M:<n>`                   | `N`    |
//! | named      | 3.3+     | `INDEX`          | `COORD`              | `MULTI:<n>`               | `NONE` |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IntegrityError;
use crate::version::SchemaVersion;

/// An `(i, j, k)` grid index.
pub type IndexTriple = [i64; 3];

/// Where a composite object sits within its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Location {
    /// A single grid cell.
    Index(IndexTriple),
    /// A free coordinate.
    Coord([f64; 3]),
    /// Several grid cells occupied by one object, in append order.
    Multi(Vec<IndexTriple>),
}

impl Location {
    #[must_use]
    pub const fn index(i: i64, j: i64, k: i64) -> Self {
        Self::Index([i, j, k])
    }

    #[must_use]
    pub const fn coord(x: f64, y: f64, z: f64) -> Self {
        Self::Coord([x, y, z])
    }

    #[must_use]
    pub fn multi(cells: Vec<IndexTriple>) -> Self {
        Self::Multi(cells)
    }

    /// Hashable, totally ordered key for this location.
    #[must_use]
    pub fn key(&self) -> LocationKey {
        match self {
            Self::Index(ijk) => LocationKey::Index(*ijk),
            Self::Coord(xyz) => LocationKey::Coord(xyz.map(f64::to_bits)),
            Self::Multi(cells) => LocationKey::Multi(cells.clone()),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Index(_) | Self::Coord(_) => 3,
            Self::Multi(cells) => 3 * cells.len(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index([i, j, k]) => write!(f, "({i}, {j}, {k})"),
            Self::Coord([x, y, z]) => write!(f, "<{x}, {y}, {z}>"),
            Self::Multi(cells) => {
                write!(f, "[")?;
                for (n, [i, j, k]) in cells.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({i}, {j}, {k})")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Hashable identity of a [`Location`]; coordinates compare bit-exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocationKey {
    Index(IndexTriple),
    Coord([u64; 3]),
    Multi(Vec<IndexTriple>),
}

/// Tag vocabulary used when packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScheme {
    ClassName,
    Letter,
    Named,
}

impl TagScheme {
    /// The scheme a writer of `version` uses.
    #[must_use]
    pub const fn for_version(version: SchemaVersion) -> Self {
        match version.minor {
            0 | 1 => Self::ClassName,
            2 => Self::Letter,
            _ => Self::Named,
        }
    }

    fn tag(self, location: Option<&Location>) -> String {
        match (self, location) {
            (Self::ClassName, None) => "None".to_string(),
            (Self::ClassName, Some(Location::Index(_))) => "IndexLocation".to_string(),
            (Self::ClassName, Some(Location::Coord(_))) => "CoordinateLocation".to_string(),
            (Self::ClassName, Some(Location::Multi(c))) => format!("MultiIndexLocation:{}", c.len()),
            (Self::Letter, None) => "N".to_string(),
            (Self::Letter, Some(Location::Index(_))) => "I".to_string(),
            (Self::Letter, Some(Location::Coord(_))) => "C".to_string(),
            (Self::Letter, Some(Location::Multi(c))) => format!("M:{}", c.len()),
            (Self::Named, None) => "NONE".to_string(),
            (Self::Named, Some(Location::Index(_))) => "INDEX".to_string(),
            (Self::Named, Some(Location::Coord(_))) => "COORD".to_string(),
            (Self::Named, Some(Location::Multi(c))) => format!("MULTI:{}", c.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    None,
    Index,
    Coord,
    Multi(usize),
}

const MULTI_PREFIXES: [&str; 3] = ["MULTI:", "M:", "MultiIndexLocation:"];

fn parse_tag(tag: &str) -> Result<TagKind, IntegrityError> {
    match tag {
        "NONE" | "N" | "None" => return Ok(TagKind::None),
        "INDEX" | "I" | "IndexLocation" => return Ok(TagKind::Index),
        "COORD" | "C" | "CoordinateLocation" => return Ok(TagKind::Coord),
        _ => {}
    }
    for prefix in MULTI_PREFIXES {
        if let Some(count) = tag.strip_prefix(prefix) {
            return count.parse::<usize>().map(TagKind::Multi).map_err(|_| {
                IntegrityError::corrupted(
                    "layout/locationType",
                    format!("bad multi-index count in tag {tag:?}"),
                )
            });
        }
    }
    Err(IntegrityError::corrupted(
        "layout/locationType",
        format!("unknown location tag {tag:?}"),
    ))
}

/// Packs locators into parallel `(tags, payload)` arrays.
///
/// The payload holds three values per index or coordinate locator and three
/// values per cell of a multi-index locator; `None` contributes nothing.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn pack_locations(
    locations: &[Option<Location>],
    version: SchemaVersion,
) -> (Vec<String>, Vec<f64>) {
    let scheme = TagScheme::for_version(version);
    let mut tags = Vec::with_capacity(locations.len());
    let mut payload =
        Vec::with_capacity(locations.iter().flatten().map(Location::payload_len).sum());
    for location in locations {
        tags.push(scheme.tag(location.as_ref()));
        match location {
            None => {}
            Some(Location::Index(ijk)) => payload.extend(ijk.iter().map(|&v| v as f64)),
            Some(Location::Coord(xyz)) => payload.extend_from_slice(xyz),
            Some(Location::Multi(cells)) => {
                for ijk in cells {
                    payload.extend(ijk.iter().map(|&v| v as f64));
                }
            }
        }
    }
    (tags, payload)
}

/// Inverse of [`pack_locations`] for any of the three tag schemes.
///
/// # Errors
///
/// Returns [`IntegrityError::Corrupted`] for unknown tags, a payload that
/// runs out early or has values left over, or non-integral index values.
pub fn unpack_locations(
    tags: &[String],
    payload: &[f64],
) -> Result<Vec<Option<Location>>, IntegrityError> {
    let mut cursor = PayloadCursor { payload, pos: 0 };
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let location = match parse_tag(tag)? {
            TagKind::None => None,
            TagKind::Index => Some(Location::Index(to_triple(cursor.take(3)?)?)),
            TagKind::Coord => {
                let c = cursor.take(3)?;
                Some(Location::Coord([c[0], c[1], c[2]]))
            }
            TagKind::Multi(count) => {
                let len = count.checked_mul(3).ok_or_else(|| {
                    IntegrityError::corrupted("layout/locationType", format!("tag '{tag}' cell count overflows"))
                })?;
                let flat = cursor.take(len)?;
                let cells = flat
                    .chunks_exact(3)
                    .map(to_triple)
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Location::Multi(cells))
            }
        };
        out.push(location);
    }

    if cursor.pos != payload.len() {
        return Err(IntegrityError::corrupted(
            "layout/location",
            format!("{} trailing payload values", payload.len() - cursor.pos),
        ));
    }
    Ok(out)
}

struct PayloadCursor<'a> {
    payload: &'a [f64],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [f64], IntegrityError> {
        let payload = self.payload;
        let start = self.pos;
        let chunk = start.checked_add(n).and_then(|end| payload.get(start..end)).ok_or_else(|| {
            IntegrityError::corrupted(
                "layout/location",
                format!(
                    "payload exhausted at {} (needed {n} more of {})",
                    self.pos,
                    self.payload.len()
                ),
            )
        })?;
        self.pos += n;
        Ok(chunk)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_triple(values: &[f64]) -> Result<IndexTriple, IntegrityError> {
    let mut out = [0i64; 3];
    for (slot, &v) in out.iter_mut().zip(values) {
        if !v.is_finite() || v.fract() != 0.0 {
            return Err(IntegrityError::corrupted(
                "layout/location",
                format!("non-integral grid index {v}"),
            ));
        }
        *slot = v as i64;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Option<Location>> {
        vec![
            None,
            Some(Location::index(1, -2, 3)),
            Some(Location::coord(0.5, 1.25, -7.0)),
            Some(Location::multi(vec![[0, 0, 0], [1, 0, 0], [0, 1, 2]])),
            Some(Location::index(0, 0, 0)),
        ]
    }

    #[test]
    fn test_all_schemes_decode_identically() {
        let locations = sample();
        for version in [
            SchemaVersion::new(3, 0),
            SchemaVersion::new(3, 2),
            SchemaVersion::CURRENT,
        ] {
            let (tags, payload) = pack_locations(&locations, version);
            let decoded = unpack_locations(&tags, &payload).unwrap();
            assert_eq!(decoded, locations, "version {version}");
        }
    }

    #[test]
    fn test_tags_per_scheme() {
        let one = [Some(Location::multi(vec![[1, 2, 3], [4, 5, 6]]))];
        assert_eq!(pack_locations(&one, SchemaVersion::new(3, 1)).0, vec!["MultiIndexLocation:2"]);
        assert_eq!(pack_locations(&one, SchemaVersion::new(3, 2)).0, vec!["M:2"]);
        assert_eq!(pack_locations(&one, SchemaVersion::new(3, 4)).0, vec!["MULTI:2"]);
    }

    #[test]
    fn test_mixed_scheme_tags_decode() {
        let tags: Vec<String> = ["I", "COORD", "MultiIndexLocation:1", "None"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let payload = vec![1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 7.0, 8.0, 9.0];
        let decoded = unpack_locations(&tags, &payload).unwrap();
        assert_eq!(decoded[0], Some(Location::index(1, 2, 3)));
        assert_eq!(decoded[1], Some(Location::coord(0.1, 0.2, 0.3)));
        assert_eq!(decoded[2], Some(Location::multi(vec![[7, 8, 9]])));
        assert_eq!(decoded[3], None);
    }

    #[test]
    fn test_multi_preserves_order() {
        let cells = vec![[5, 0, 0], [1, 0, 0], [3, 0, 0]];
        let (tags, payload) = pack_locations(&[Some(Location::multi(cells.clone()))], SchemaVersion::CURRENT);
        let decoded = unpack_locations(&tags, &payload).unwrap();
        assert_eq!(decoded[0], Some(Location::Multi(cells)));
    }

    #[test]
    fn test_rejects_short_payload() {
        let tags = vec!["INDEX".to_string()];
        assert!(unpack_locations(&tags, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_rejects_oversized_multi_count() {
        let tags = vec![format!("MULTI:{}", usize::MAX / 3 + 1)];
        let err = unpack_locations(&tags, &[1.0]).unwrap_err();
        assert!(matches!(err, IntegrityError::Corrupted { .. }), "{err}");

        // Fits after multiplying, but not once added to the cursor.
        let tags = vec!["INDEX".to_string(), format!("MULTI:{}", usize::MAX / 3)];
        let err = unpack_locations(&tags, &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, IntegrityError::Corrupted { .. }), "{err}");
    }

    #[test]
    fn test_rejects_trailing_payload() {
        let tags = vec!["NONE".to_string()];
        assert!(unpack_locations(&tags, &[1.0]).is_err());
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let tags = vec!["HexLocation".to_string()];
        let err = unpack_locations(&tags, &[]).unwrap_err();
        assert!(err.to_string().contains("HexLocation"));
    }

    #[test]
    fn test_rejects_fractional_index() {
        let tags = vec!["I".to_string()];
        assert!(unpack_locations(&tags, &[1.5, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_location_key_distinguishes_kinds() {
        assert_ne!(Location::index(0, 0, 0).key(), Location::multi(vec![[0, 0, 0]]).key());
        assert_eq!(Location::coord(1.0, 2.0, 3.0).key(), Location::coord(1.0, 2.0, 3.0).key());
    }
}
