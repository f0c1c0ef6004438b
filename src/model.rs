use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Two coordinates closer than this are collapsed to a single point.
pub const DEGENERATE_SPAN: f64 = 1e-7;

/// One discussion comment attached to a changeset.
///
/// Persisted as an element of the `comments` JSONB array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetComment {
    pub uid: i64,
    pub username: String,
    pub date: Option<DateTime<Utc>>,
    pub text: String,
}

/// A changeset bounding box. Exists only when the source element carried all
/// four coordinate attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// All four coordinates within valid lon/lat ranges.
    pub fn is_valid(&self) -> bool {
        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        lon_ok(self.min_lon) && lon_ok(self.max_lon) && lat_ok(self.min_lat) && lat_ok(self.max_lat)
    }

    /// Both spans below the degenerate threshold.
    pub fn is_degenerate(&self) -> bool {
        (self.max_lon - self.min_lon).abs() < DEGENERATE_SPAN
            && (self.max_lat - self.min_lat).abs() < DEGENERATE_SPAN
    }

    /// WKT rendering: a POINT for a degenerate box, otherwise the closed
    /// envelope ring. SRID 4326 is applied at write time by the store.
    pub fn to_wkt(&self) -> String {
        if self.is_degenerate() {
            format!("POINT({} {})", self.min_lon, self.min_lat)
        } else {
            format!(
                "POLYGON(({} {}, {} {}, {} {}, {} {}, {} {}))",
                self.min_lon,
                self.min_lat,
                self.max_lon,
                self.min_lat,
                self.max_lon,
                self.max_lat,
                self.min_lon,
                self.max_lat,
                self.min_lon,
                self.min_lat,
            )
        }
    }
}

/// A parsed changeset record: the parser creates these, the upserter consumes
/// them.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub id: i64,
    pub username: Option<String>,
    pub uid: i64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub open: bool,
    pub num_changes: i32,
    pub comments_count: i32,
    pub bbox: Option<BoundingBox>,
    pub tags: BTreeMap<String, String>,
    pub comments: Vec<ChangesetComment>,
}

impl Changeset {
    pub fn bbox_wkt(&self) -> Option<String> {
        self.bbox.map(|b| b.to_wkt())
    }
}

/// Lifecycle of one replication file.
///
/// Terminal states are `Backfilled` and `Empty`; `Failed` re-enters the queue
/// through the retry manager until its attempt budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Pending,
    Processing,
    Backfilled,
    Empty,
    Failed,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Pending => "pending",
            SequenceStatus::Processing => "processing",
            SequenceStatus::Backfilled => "backfilled",
            SequenceStatus::Empty => "empty",
            SequenceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceStatus::Backfilled | SequenceStatus::Empty)
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> BoundingBox {
        BoundingBox {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    #[test]
    fn degenerate_box_renders_as_point() {
        let b = bbox(180.0, 0.0, 180.0, 0.0);
        assert!(b.is_degenerate());
        assert_eq!(b.to_wkt(), "POINT(180 0)");
    }

    #[test]
    fn spans_at_threshold_are_not_degenerate() {
        // Exactly 1e-7 on one axis is already a rectangle.
        let b = bbox(0.0, 20.0, DEGENERATE_SPAN, 20.0);
        assert!(!b.is_degenerate());
        assert!(b.to_wkt().starts_with("POLYGON(("));
    }

    #[test]
    fn polygon_ring_is_closed() {
        let b = bbox(-1.5, -2.5, 3.0, 4.0);
        let wkt = b.to_wkt();
        assert_eq!(
            wkt,
            "POLYGON((-1.5 -2.5, 3 -2.5, 3 4, -1.5 4, -1.5 -2.5))"
        );
    }

    #[test]
    fn coordinate_range_validation() {
        assert!(bbox(-180.0, -90.0, 180.0, 90.0).is_valid());
        assert!(!bbox(-180.1, 0.0, 0.0, 0.0).is_valid());
        assert!(!bbox(0.0, 0.0, 0.0, 90.5).is_valid());
    }

    #[test]
    fn status_names_match_store_values() {
        for (status, name) in [
            (SequenceStatus::Pending, "pending"),
            (SequenceStatus::Processing, "processing"),
            (SequenceStatus::Backfilled, "backfilled"),
            (SequenceStatus::Empty, "empty"),
            (SequenceStatus::Failed, "failed"),
        ] {
            assert_eq!(status.as_str(), name);
        }
        assert!(SequenceStatus::Backfilled.is_terminal());
        assert!(SequenceStatus::Empty.is_terminal());
        assert!(!SequenceStatus::Failed.is_terminal());
    }

    #[test]
    fn comment_json_shape() {
        let c = ChangesetComment {
            uid: 42,
            username: "mapper".to_string(),
            date: Some("2024-06-01T12:00:00Z".parse().unwrap()),
            text: "looks good".to_string(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["uid"], 42);
        assert_eq!(v["username"], "mapper");
        assert_eq!(v["text"], "looks good");
        assert!(v["date"].is_string());
    }
}
