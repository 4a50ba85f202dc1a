//! Tab-separated location tables
//!
//! # Formats
//!
//! ```text
//! countries:  code \t name
//! states:     country_code.state_code \t name
//! places:     id \t lat \t lon \t state_code \t country_code \t population \t name [\t alt_name ...]
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. The places table is
//! memory-mapped; a place is identified by the byte offset of its line.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

/// Parse the countries table into `code -> name`
pub fn parse_countries(text: &str) -> HashMap<String, String> {
    data_lines(text)
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let code = fields.next()?.trim();
            let name = fields.next()?.trim();
            (!code.is_empty() && !name.is_empty()).then(|| (code.to_ascii_uppercase(), name.to_string()))
        })
        .collect()
}

/// Parse the states table into `"CC.SS" -> name`
pub fn parse_states(text: &str) -> HashMap<String, String> {
    data_lines(text)
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let key = fields.next()?.trim();
            let name = fields.next()?.trim();
            key.contains('.')
                .then(|| (key.to_ascii_uppercase(), name.to_string()))
        })
        .collect()
}

/// Key of a state in the states table
pub fn state_key(country_code: &str, state_code: &str) -> String {
    format!("{}.{}", country_code, state_code).to_ascii_uppercase()
}

fn data_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
}

/// One parsed line of the places table
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRow<'a> {
    pub offset: u64,
    pub lat: f64,
    pub lon: f64,
    pub state_code: &'a str,
    pub country_code: &'a str,
    pub population: u64,
    pub name: &'a str,
    pub alt_names: Vec<&'a str>,
}

impl PlaceRow<'_> {
    /// Name followed by alternate names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name).chain(self.alt_names.iter().copied())
    }
}

/// Parse one places line; `None` for comments and malformed rows
pub fn parse_place(line: &str, offset: u64) -> Option<PlaceRow<'_>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split('\t');
    let _id = fields.next()?;
    let lat: f64 = fields.next()?.trim().parse().ok()?;
    let lon: f64 = fields.next()?.trim().parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    let state_code = fields.next()?.trim();
    let country_code = fields.next()?.trim();
    let population = fields.next()?.trim().parse().unwrap_or(0);
    let name = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let alt_names = fields.map(str::trim).filter(|n| !n.is_empty()).collect();

    Some(PlaceRow {
        offset,
        lat,
        lon,
        state_code,
        country_code,
        population,
        name,
        alt_names,
    })
}

enum TableBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for TableBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            TableBytes::Mapped(mmap) => mmap,
            TableBytes::Owned(bytes) => bytes,
        }
    }
}

/// The places table, addressable by line offset
pub struct PlacesTable {
    bytes: TableBytes,
}

impl std::fmt::Debug for PlacesTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacesTable").field("len", &self.bytes.len()).finish()
    }
}

impl PlacesTable {
    /// Memory-map a places file
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open places table {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).with_context(|| format!("Failed to mmap {}", path.display()))? };
        Ok(Self {
            bytes: TableBytes::Mapped(mmap),
        })
    }

    /// Table held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: TableBytes::Owned(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Every well-formed row with its offset
    pub fn rows(&self) -> impl Iterator<Item = PlaceRow<'_>> {
        let bytes: &[u8] = &self.bytes;
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            while offset < bytes.len() {
                let start = offset;
                let end = bytes[start..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| start + p);
                offset = end + 1;

                match std::str::from_utf8(&bytes[start..end]) {
                    Ok(line) => {
                        if let Some(row) = parse_place(line, start as u64) {
                            return Some(row);
                        }
                    }
                    Err(_) => log::debug!("Skipping non-UTF-8 places line at offset {}", start),
                }
            }
            None
        })
    }

    /// Re-read the row starting at `offset`
    pub fn row_at(&self, offset: u64) -> Option<PlaceRow<'_>> {
        let start = usize::try_from(offset).ok()?;
        if start >= self.bytes.len() || (start > 0 && self.bytes[start - 1] != b'\n') {
            return None;
        }
        let rest = &self.bytes[start..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let line = std::str::from_utf8(&rest[..end]).ok()?;
        parse_place(line, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACES: &str = "# id\tlat\tlon\tstate\tcountry\tpop\tname\n\
        1\t48.8566\t2.3522\t11\tFR\t2138551\tParis\tLutetia\n\
        bad line\n\
        2\t51.5074\t-0.1278\tENG\tGB\t8961989\tLondon\n";

    #[test]
    fn test_parse_countries_and_states() {
        let countries = parse_countries("# comment\nFR\tFrance\ngb\tUnited Kingdom\n\nXX\n");
        assert_eq!(countries.len(), 2);
        assert_eq!(countries["GB"], "United Kingdom");

        let states = parse_states("FR.11\tÎle-de-France\nbroken\tline\n");
        assert_eq!(states.len(), 1);
        assert_eq!(states[&state_key("fr", "11")], "Île-de-France");
    }

    #[test]
    fn test_rows_skip_malformed_lines() {
        let table = PlacesTable::from_bytes(PLACES.as_bytes().to_vec());
        let rows: Vec<_> = table.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Paris");
        assert_eq!(rows[0].alt_names, vec!["Lutetia"]);
        assert_eq!(rows[1].country_code, "GB");
        assert_eq!(rows[1].population, 8961989);
    }

    #[test]
    fn test_row_at_offset() {
        let table = PlacesTable::from_bytes(PLACES.as_bytes().to_vec());
        let london = table.rows().nth(1).unwrap();
        let again = table.row_at(london.offset).unwrap();
        assert_eq!(again, london);

        // Offsets in the middle of a line are not identities
        assert!(table.row_at(london.offset + 1).is_none());
        assert!(table.row_at(10_000).is_none());
    }

    #[test]
    fn test_open_mapped_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("places.tsv");
        std::fs::write(&path, PLACES).unwrap();

        let table = PlacesTable::open(&path).unwrap();
        assert_eq!(table.rows().count(), 2);
        assert!(PlacesTable::open(&dir.path().join("missing.tsv")).is_err());
    }
}
