use geo::{Area, BooleanOps, Coord, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ResolverError;

/// One `[x, y]` position.
pub type Position = [f64; 2];
/// Exterior ring first, then holes.
pub type PolygonRings = Vec<Vec<Position>>;

/// Parcel footprint. Always a multipolygon, even when it holds one part, so the
/// union of several footprints has the same shape as a single one.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelGeometry(MultiPolygon<f64>);

#[derive(Serialize, Deserialize)]
struct GeoJsonGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: GeoJsonCoordinates,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GeoJsonCoordinates {
    MultiPolygon(Vec<PolygonRings>),
    Polygon(PolygonRings),
}

impl ParcelGeometry {
    /// Build from GeoJSON-style multipolygon coordinates.
    ///
    /// # Errors
    /// Returns `ResolverError::Geometry` when there are no polygons or a ring
    /// has fewer than three distinct positions or a non-finite coordinate.
    pub fn from_coordinates(polygons: Vec<PolygonRings>) -> Result<Self, ResolverError> {
        if polygons.is_empty() {
            return Err(ResolverError::Geometry("multipolygon has no polygons".to_string()));
        }

        let polygons = polygons
            .into_iter()
            .map(polygon_from_rings)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(MultiPolygon::new(polygons)))
    }

    /// Single-ring convenience constructor.
    ///
    /// # Errors
    /// Same conditions as [`ParcelGeometry::from_coordinates`].
    pub fn polygon(exterior: Vec<Position>) -> Result<Self, ResolverError> {
        Self::from_coordinates(vec![vec![exterior]])
    }

    #[must_use]
    pub fn coordinates(&self) -> Vec<PolygonRings> {
        self.0
            .iter()
            .map(|polygon| {
                std::iter::once(polygon.exterior())
                    .chain(polygon.interiors())
                    .map(|ring| ring.coords().map(|coord| [coord.x, coord.y]).collect())
                    .collect()
            })
            .collect()
    }

    #[must_use]
    pub fn polygon_count(&self) -> usize {
        self.0 .0.len()
    }

    #[must_use]
    pub fn area(&self) -> f64 {
        self.0.unsigned_area()
    }

    #[must_use]
    pub fn as_multi_polygon(&self) -> &MultiPolygon<f64> {
        &self.0
    }

    /// Dissolve all footprints into one multipolygon. `None` when there is
    /// nothing to union.
    pub fn union_all<'a>(geometries: impl IntoIterator<Item = &'a ParcelGeometry>) -> Option<Self> {
        let mut geometries = geometries.into_iter().peekable();
        geometries.peek()?;
        let merged = geometries.fold(MultiPolygon::new(Vec::new()), |acc, geometry| acc.union(&geometry.0));
        Some(Self(merged))
    }
}

fn polygon_from_rings(rings: PolygonRings) -> Result<Polygon<f64>, ResolverError> {
    let mut rings = rings.into_iter().map(line_string_from_ring);
    let exterior = match rings.next() {
        Some(ring) => ring?,
        None => return Err(ResolverError::Geometry("polygon has no exterior ring".to_string())),
    };
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn line_string_from_ring(ring: Vec<Position>) -> Result<LineString<f64>, ResolverError> {
    if ring.iter().flatten().any(|value| !value.is_finite()) {
        return Err(ResolverError::Geometry("ring has a non-finite coordinate".to_string()));
    }

    let mut distinct = ring.clone();
    if distinct.len() > 1 && distinct.first() == distinct.last() {
        distinct.pop();
    }
    if distinct.len() < 3 {
        return Err(ResolverError::Geometry(format!(
            "ring needs at least 3 distinct positions, found {}",
            distinct.len()
        )));
    }

    Ok(LineString::new(ring.into_iter().map(|[x, y]| Coord { x, y }).collect()))
}

impl Serialize for ParcelGeometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GeoJsonGeometry {
            kind: "MultiPolygon".to_string(),
            coordinates: GeoJsonCoordinates::MultiPolygon(self.coordinates()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParcelGeometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = GeoJsonGeometry::deserialize(deserializer)?;
        let polygons = match (raw.kind.as_str(), raw.coordinates) {
            ("MultiPolygon", GeoJsonCoordinates::MultiPolygon(polygons)) => polygons,
            ("Polygon", GeoJsonCoordinates::Polygon(rings)) => vec![rings],
            (kind, _) => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported geometry type or coordinate depth: {kind}"
                )))
            }
        };
        Self::from_coordinates(polygons).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> ParcelGeometry {
        match ParcelGeometry::polygon(vec![
            [x, y],
            [x + size, y],
            [x + size, y + size],
            [x, y + size],
            [x, y],
        ]) {
            Ok(geometry) => geometry,
            Err(err) => panic!("square should be valid: {err}"),
        }
    }

    #[test]
    fn union_of_adjacent_squares_dissolves_shared_edge() {
        let left = square(0.0, 0.0, 1.0);
        let right = square(1.0, 0.0, 1.0);

        let Some(merged) = ParcelGeometry::union_all([&left, &right]) else {
            panic!("union of two footprints should exist");
        };

        assert_eq!(merged.polygon_count(), 1);
        assert!((merged.area() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn union_of_disjoint_squares_stays_multi() {
        let merged = ParcelGeometry::union_all([&square(0.0, 0.0, 1.0), &square(5.0, 5.0, 1.0)]);
        assert_eq!(merged.map(|geometry| geometry.polygon_count()), Some(2));
    }

    #[test]
    fn union_of_single_footprint_is_still_multipolygon() {
        let Some(merged) = ParcelGeometry::union_all([&square(0.0, 0.0, 2.0)]) else {
            panic!("single footprint union should exist");
        };
        assert_eq!(merged.polygon_count(), 1);
        assert!((merged.area() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn union_of_nothing_is_none() {
        assert!(ParcelGeometry::union_all(std::iter::empty()).is_none());
    }

    #[test]
    fn rejects_degenerate_rings() {
        let result = ParcelGeometry::polygon(vec![[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]);
        assert!(matches!(result, Err(ResolverError::Geometry(_))));
        assert!(ParcelGeometry::from_coordinates(Vec::new()).is_err());
    }

    #[test]
    fn polygon_json_is_read_as_multipolygon() {
        let json = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#;
        let geometry = match serde_json::from_str::<ParcelGeometry>(json) {
            Ok(geometry) => geometry,
            Err(err) => panic!("polygon json should parse: {err}"),
        };
        assert_eq!(geometry.polygon_count(), 1);

        let written = serde_json::to_value(&geometry).unwrap_or_default();
        assert_eq!(written["type"], "MultiPolygon");
    }
}
