//! Geographic index over a table of named places
//!
//! Built once from the location tables and read-only afterward:
//! - a [`KdTree`] answers nearest-place and nearest-country lookups
//! - an [`NgramTable`] answers autocomplete over place, state and country names
//!
//! Places are identified by the byte offset of their line in the places
//! table, so a [`Location`] can be re-fetched without rescanning.

pub mod kdtree;
pub mod ngram;
pub mod tables;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::GeoSection;
use crate::models::GeoCoord;

pub use kdtree::{GeoPoint, KdTree};
pub use ngram::NgramTable;
pub use tables::PlacesTable;

use tables::{PlaceRow, state_key};

/// Queries this short prefer places in the bias location's country
const SHORT_QUERY_CHARS: usize = 3;

/// A resolved place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: String,
    pub coord: GeoCoord,
    pub population: u64,
    /// Identity of the place in the places table
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

/// One autocomplete candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationMatch {
    pub location: Location,
    /// Query words found in the place, state or country names
    pub score: usize,
    /// Distance to the bias location, when one was given
    pub distance_km: Option<f64>,
}

#[derive(Debug)]
pub struct GeoIndex {
    places: PlacesTable,
    tree: KdTree,
    ngrams: NgramTable,
    /// Place offsets in table order; n-gram entries index into this
    offsets: Vec<u64>,
    countries: HashMap<String, String>,
    states: HashMap<String, String>,
}

impl GeoIndex {
    /// Load the three tables named by the `[geo]` section
    pub fn load_index(section: &GeoSection) -> Result<Self> {
        let countries = std::fs::read_to_string(&section.countries)
            .with_context(|| format!("Failed to read countries table {}", section.countries.display()))?;
        let states = std::fs::read_to_string(&section.states)
            .with_context(|| format!("Failed to read states table {}", section.states.display()))?;
        let places = PlacesTable::open(&section.places)?;

        Ok(Self::from_tables(
            places,
            tables::parse_countries(&countries),
            tables::parse_states(&states),
        ))
    }

    pub fn from_tables(
        places: PlacesTable,
        countries: HashMap<String, String>,
        states: HashMap<String, String>,
    ) -> Self {
        let start = Instant::now();
        let mut points = Vec::new();
        let mut offsets = Vec::new();
        let mut keys = Vec::new();

        for row in places.rows() {
            let index = offsets.len() as u32;
            offsets.push(row.offset);
            points.push(GeoPoint {
                lat: row.lat,
                lon: row.lon,
                offset: row.offset,
                country: kdtree::country_bytes(row.country_code),
            });
            for name in row.names() {
                NgramTable::add_name(&mut keys, name, index);
            }
        }

        let tree = KdTree::build(points);
        let ngrams = NgramTable::build(keys);
        log::info!(
            "Loaded geo index: {} places, {} name keys, {} countries, {} states in {:?}",
            tree.len(),
            ngrams.len(),
            countries.len(),
            states.len(),
            start.elapsed()
        );

        Self {
            places,
            tree,
            ngrams,
            offsets,
            countries,
            states,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn find_closest(&self, lat: f64, lon: f64) -> Option<Location> {
        let point = self.tree.find_closest(lat, lon)?;
        self.location_at(point.offset)
    }

    /// Country of the closest place
    pub fn find_country(&self, lat: f64, lon: f64) -> Option<Country> {
        let point = self.tree.find_closest(lat, lon)?;
        let code = point.country_code().trim().to_string();
        if code.is_empty() {
            return None;
        }
        let name = self.countries.get(&code).cloned().unwrap_or_else(|| code.clone());
        Some(Country { code, name })
    }

    /// Re-fetch a place by its offset in the places table
    pub fn location_at(&self, offset: u64) -> Option<Location> {
        self.places.row_at(offset).map(|row| self.location(&row))
    }

    fn location(&self, row: &PlaceRow<'_>) -> Location {
        let country_code = row.country_code.to_ascii_uppercase();
        Location {
            name: row.name.to_string(),
            state: self.states.get(&state_key(row.country_code, row.state_code)).cloned(),
            country: self.countries.get(&country_code).cloned(),
            country_code,
            coord: GeoCoord::new(row.lat, row.lon),
            population: row.population,
            offset: row.offset,
        }
    }

    /// Places whose names contain the words of `query`
    ///
    /// Candidates come from the n-gram ranges of the query words and must
    /// have a name containing one of them. Each is scored by how many query
    /// words occur in its own names, its state or its country, all with equal
    /// weight. With a bias location, very short queries list the bias
    /// country first and results are then ordered by distance; score and
    /// population only break ties. Without one, the best score comes first.
    pub fn auto_complete(&self, query: &str, max_results: usize, bias: Option<GeoCoord>) -> Vec<LocationMatch> {
        let tokens: Vec<String> = ngram::words(query).collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<u32> = tokens.iter().flat_map(|t| self.ngrams.lookup(t)).collect();
        candidates.sort_unstable();
        candidates.dedup();

        let short = query.trim().chars().count() < SHORT_QUERY_CHARS;
        let bias_country = match (short, bias) {
            (true, Some(b)) => self.find_country(b.lat, b.lon).map(|c| c.code),
            _ => None,
        };

        let mut matches: Vec<(LocationMatch, bool)> = Vec::new();
        for index in candidates {
            let Some(row) = self.offsets.get(index as usize).and_then(|&o| self.places.row_at(o)) else {
                continue;
            };
            let place_names: Vec<String> = row.names().map(str::to_lowercase).collect();
            let names_place = |t: &String| place_names.iter().any(|n| n.contains(t.as_str()));
            if !tokens.iter().any(names_place) {
                continue;
            }

            let location = self.location(&row);
            let region_names: Vec<String> = [&location.state, &location.country]
                .into_iter()
                .flatten()
                .map(|n| n.to_lowercase())
                .collect();
            let score = tokens
                .iter()
                .filter(|t| names_place(*t) || region_names.iter().any(|n| n.contains(t.as_str())))
                .count();

            let same_country = bias_country.as_deref() == Some(location.country_code.as_str());
            let distance_km = bias.map(|b| b.distance_km(&location.coord));
            matches.push((
                LocationMatch {
                    location,
                    score,
                    distance_km,
                },
                same_country,
            ));
        }

        matches.sort_by(|(a, a_home), (b, b_home)| {
            let ranked = match (a.distance_km, b.distance_km) {
                (Some(da), Some(db)) => b_home.cmp(a_home).then(da.total_cmp(&db)),
                _ => std::cmp::Ordering::Equal,
            };
            ranked
                .then(b.score.cmp(&a.score))
                .then(b.location.population.cmp(&a.location.population))
                .then_with(|| a.location.name.cmp(&b.location.name))
        });
        matches.truncate(max_results);
        matches.into_iter().map(|(m, _)| m).collect()
    }
}

/// Process-wide holder of the geo index
///
/// Written once when the tables are loaded, read by enrichment and search.
#[derive(Debug, Default)]
pub struct LocationCache {
    index: RwLock<Option<Arc<GeoIndex>>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, section: &GeoSection) -> Result<Arc<GeoIndex>> {
        let index = GeoIndex::load_index(section)?;
        Ok(self.install(index))
    }

    pub fn install(&self, index: GeoIndex) -> Arc<GeoIndex> {
        let index = Arc::new(index);
        *self.index.write() = Some(index.clone());
        index
    }

    pub fn get(&self) -> Option<Arc<GeoIndex>> {
        self.index.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.index.read().is_some()
    }

    pub fn location_at(&self, offset: u64) -> Option<Location> {
        self.get()?.location_at(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACES: &str = "1\t48.8566\t2.3522\t11\tFR\t2138551\tParis\n\
        2\t33.6609\t-95.5555\tTX\tUS\t24782\tParis\n\
        3\t40.7128\t-74.0060\tNY\tUS\t8804190\tNew York\tNYC\n\
        4\t40.7357\t-74.1724\tNJ\tUS\t311549\tNewark\n\
        5\t51.5074\t-0.1278\tENG\tGB\t8961989\tLondon\n\
        6\t42.9849\t-81.2453\tON\tCA\t422324\tLondon\n";

    fn index() -> GeoIndex {
        GeoIndex::from_tables(
            PlacesTable::from_bytes(PLACES.as_bytes().to_vec()),
            tables::parse_countries("FR\tFrance\nUS\tUnited States\nGB\tUnited Kingdom\nCA\tCanada\n"),
            tables::parse_states("US.TX\tTexas\nUS.NY\tNew York\nUS.NJ\tNew Jersey\nCA.ON\tOntario\n"),
        )
    }

    #[test]
    fn test_find_closest_and_country() {
        let geo = index();
        assert_eq!(geo.len(), 6);

        let near_paris = geo.find_closest(48.85, 2.29).unwrap();
        assert_eq!(near_paris.name, "Paris");
        assert_eq!(near_paris.country.as_deref(), Some("France"));
        assert_eq!(near_paris.state, None);

        let country = geo.find_country(40.0, -75.0).unwrap();
        assert_eq!(country.code, "US");
        assert_eq!(country.name, "United States");
    }

    #[test]
    fn test_location_at_round_trips_identity() {
        let geo = index();
        let newark = geo.find_closest(40.73, -74.17).unwrap();
        assert_eq!(newark.state.as_deref(), Some("New Jersey"));
        assert_eq!(geo.location_at(newark.offset), Some(newark));
        assert_eq!(geo.location_at(3), None);
    }

    #[test]
    fn test_auto_complete_ranks_by_score_or_bias() {
        let geo = index();

        let paris_tx = geo.auto_complete("paris texas", 5, None);
        assert_eq!(paris_tx[0].location.state.as_deref(), Some("Texas"));
        assert_eq!(paris_tx[0].score, 2);
        assert_eq!(paris_tx.len(), 2);

        let near_toronto = GeoCoord::new(43.65, -79.38);
        let london = geo.auto_complete("london", 5, Some(near_toronto));
        assert_eq!(london[0].location.country_code, "CA");
        assert!(london[0].distance_km.unwrap() < london[1].distance_km.unwrap());

        let unbiased = geo.auto_complete("london", 1, None);
        assert_eq!(unbiased.len(), 1);
        assert_eq!(unbiased[0].location.country_code, "GB");

        let alt = geo.auto_complete("nyc", 5, None);
        assert_eq!(alt[0].location.name, "New York");
        assert!(geo.auto_complete("  ", 5, None).is_empty());
    }

    #[test]
    fn test_auto_complete_orders_by_bias_distance() {
        let geo = GeoIndex::from_tables(
            PlacesTable::from_bytes(
                b"1\t39.7817\t-89.6501\tIL\tUS\t114394\tSpringfield\n\
                  2\t-43.3667\t172.0333\tCAN\tNZ\t900000\tSpring Field\n"
                    .to_vec(),
            ),
            tables::parse_countries("US\tUnited States\nNZ\tNew Zealand\n"),
            tables::parse_states("US.IL\tIllinois\n"),
        );

        // Both names contain both words, only the far one as word prefixes
        let unbiased = geo.auto_complete("spring field", 5, None);
        assert_eq!(unbiased[0].location.country_code, "NZ");
        assert_eq!(unbiased[1].location.name, "Springfield");
        assert_eq!(unbiased[1].score, 2);

        let near_illinois = GeoCoord::new(39.8, -89.6);
        let biased = geo.auto_complete("spring field", 5, Some(near_illinois));
        assert_eq!(biased[0].location.name, "Springfield");
        assert_eq!(biased[1].location.name, "Spring Field");
        assert!(biased[0].distance_km.unwrap() < biased[1].distance_km.unwrap());

        let prefix_only = geo.auto_complete("spring", 5, Some(near_illinois));
        assert_eq!(prefix_only.len(), 2);
        assert_eq!(prefix_only[0].location.name, "Springfield");
    }

    #[test]
    fn test_short_query_prefers_bias_country() {
        let geo = index();
        let near_ny = GeoCoord::new(40.7, -74.0);
        let found = geo.auto_complete("ne", 5, Some(near_ny));
        assert!(found.iter().all(|m| m.location.country_code == "US"));

        let near_london = GeoCoord::new(51.5, -0.1);
        let found = geo.auto_complete("lo", 5, Some(near_london));
        assert_eq!(found[0].location.country_code, "GB");
    }

    #[test]
    fn test_location_cache_install_and_load() {
        let cache = LocationCache::new();
        assert!(cache.get().is_none());
        cache.install(index());
        assert!(cache.is_loaded());
        assert!(cache.location_at(0).is_some());

        let dir = tempfile::TempDir::new().unwrap();
        let section = GeoSection {
            places: dir.path().join("places.tsv"),
            countries: dir.path().join("countries.tsv"),
            states: dir.path().join("states.tsv"),
        };
        assert!(cache.load(&section).is_err());

        std::fs::write(&section.places, PLACES).unwrap();
        std::fs::write(&section.countries, "FR\tFrance\n").unwrap();
        std::fs::write(&section.states, "").unwrap();
        let loaded = cache.load(&section).unwrap();
        assert_eq!(loaded.len(), 6);
    }
}
