//! Static 2-D tree for nearest-place lookup
//!
//! The tree is implicit: building reorders the point array so that for any
//! range `[lo, hi)` longer than [`LEAF_SIZE`], the middle element is the split
//! point, everything before it is on the low side of the split axis and
//! everything after it on the high side. Axes alternate latitude/longitude by
//! depth. Short ranges are scanned linearly.
//!
//! Distances are equirectangular: longitude differences are scaled by the
//! cosine of the query latitude, which is fixed for the whole search, so
//! per-axis bounds stay valid for pruning.

use crate::models::GeoCoord;

/// Ranges at most this long are not split further
pub const LEAF_SIZE: usize = 8;

/// A place coordinate with the identity needed to re-fetch it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    /// Byte offset of the place line in the places table
    pub offset: u64,
    /// ISO country code, upper case ASCII
    pub country: [u8; 2],
}

impl GeoPoint {
    pub fn coord(&self) -> GeoCoord {
        GeoCoord::new(self.lat, self.lon)
    }

    pub fn country_code(&self) -> &str {
        std::str::from_utf8(&self.country).unwrap_or("")
    }

    fn axis_value(&self, axis: usize) -> f64 {
        if axis == 0 { self.lat } else { self.lon }
    }
}

/// Pack a country code into two bytes
pub fn country_bytes(code: &str) -> [u8; 2] {
    let bytes = code.as_bytes();
    match bytes {
        [a, b, ..] => [a.to_ascii_uppercase(), b.to_ascii_uppercase()],
        _ => [b' ', b' '],
    }
}

#[derive(Debug, Default)]
pub struct KdTree {
    points: Vec<GeoPoint>,
}

struct Query {
    lat: f64,
    lon: f64,
    lon_scale: f64,
}

impl Query {
    fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            lon_scale: lat.to_radians().cos(),
        }
    }

    fn axis_delta(&self, point: &GeoPoint, axis: usize) -> f64 {
        if axis == 0 {
            self.lat - point.lat
        } else {
            (self.lon - point.lon) * self.lon_scale
        }
    }

    fn distance_sq(&self, point: &GeoPoint) -> f64 {
        let dlat = self.lat - point.lat;
        let dlon = (self.lon - point.lon) * self.lon_scale;
        dlat * dlat + dlon * dlon
    }
}

impl KdTree {
    pub fn build(mut points: Vec<GeoPoint>) -> Self {
        let len = points.len();
        split(&mut points, 0, len, 0);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    /// Closest point to `(lat, lon)`, `None` when the tree is empty
    pub fn find_closest(&self, lat: f64, lon: f64) -> Option<&GeoPoint> {
        let query = Query::new(lat, lon);
        let mut best: Option<(usize, f64)> = None;
        self.search(&query, 0, self.points.len(), 0, &mut best);
        best.map(|(i, _)| &self.points[i])
    }

    /// Closest point by linear scan
    pub fn find_closest_linear(&self, lat: f64, lon: f64) -> Option<&GeoPoint> {
        let query = Query::new(lat, lon);
        self.points
            .iter()
            .min_by(|a, b| query.distance_sq(a).total_cmp(&query.distance_sq(b)))
    }

    fn search(&self, query: &Query, lo: usize, hi: usize, depth: usize, best: &mut Option<(usize, f64)>) {
        let mut consider = |i: usize, best: &mut Option<(usize, f64)>| {
            let d = query.distance_sq(&self.points[i]);
            if best.is_none_or(|(_, bd)| d < bd) {
                *best = Some((i, d));
            }
        };

        if hi - lo <= LEAF_SIZE {
            for i in lo..hi {
                consider(i, best);
            }
            return;
        }

        let mid = lo + (hi - lo) / 2;
        let axis = depth % 2;
        consider(mid, best);

        let delta = query.axis_delta(&self.points[mid], axis);
        let (near, far) = if delta < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };

        self.search(query, near.0, near.1, depth + 1, best);
        if best.is_none_or(|(_, bd)| delta * delta < bd) {
            self.search(query, far.0, far.1, depth + 1, best);
        }
    }
}

fn split(points: &mut [GeoPoint], lo: usize, hi: usize, depth: usize) {
    if hi - lo <= LEAF_SIZE {
        return;
    }
    let mid = lo + (hi - lo) / 2;
    let axis = depth % 2;
    points[lo..hi].select_nth_unstable_by(mid - lo, |a, b| a.axis_value(axis).total_cmp(&b.axis_value(axis)));
    split(points, lo, mid, depth + 1);
    split(points, mid + 1, hi, depth + 1);
}
