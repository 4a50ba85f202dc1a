//! Evaluate a parsed search against single items

use chrono::{DateTime, Utc};
use std::path::Path;

use crate::bloom::BloomBits;
use crate::models::FileMetadata;
use crate::records::FileRecord;

use super::date::DateTarget;
use super::terms::{Comparison, Expr, Property, SearchT, TermKind, TextPattern};

/// Outcome of matching one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    NoMatch,
    /// Rejected by the bloom pre-filter without evaluating terms
    Filtered,
    Match,
}

impl SearchResult {
    pub fn is_match(self) -> bool {
        self == SearchResult::Match
    }
}

/// A compiled search ready to test items
#[derive(Debug)]
pub struct SearchMatcher<'a> {
    search: &'a SearchT,
    expr: Option<Expr>,
    query_bits: BloomBits,
    folder_possible: bool,
    now: DateTime<Utc>,
}

impl<'a> SearchMatcher<'a> {
    pub fn new(search: &'a SearchT) -> Self {
        Self::with_now(search, Utc::now())
    }

    /// Matcher with a fixed clock for relative dates
    pub fn with_now(search: &'a SearchT, now: DateTime<Utc>) -> Self {
        let expr = search.expression();
        let query_bits = expr
            .as_ref()
            .map(|e| e.required_bits(&search.terms))
            .unwrap_or(BloomBits::EMPTY);
        let folder_possible = expr.as_ref().is_none_or(|e| e.can_match_folder(&search.terms));

        Self {
            search,
            expr,
            query_bits,
            folder_possible,
            now,
        }
    }

    /// No terms: everything matches
    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn query_bits(&self) -> BloomBits {
        self.query_bits
    }

    pub fn can_match_folder(&self) -> bool {
        self.folder_possible
    }

    pub fn match_item(&self, path: &Path, file: &FileRecord) -> SearchResult {
        let Some(expr) = &self.expr else {
            return SearchResult::Match;
        };
        if !file.bloom().potential_match(self.query_bits) {
            return SearchResult::Filtered;
        }

        let metadata = file.metadata();
        let item = Item {
            path,
            file,
            metadata: metadata.as_deref(),
        };
        let terms = &self.search.terms;
        if expr.eval(&mut |i| self.term_matches(&terms[i].kind, &item)) {
            SearchResult::Match
        } else {
            SearchResult::NoMatch
        }
    }

    /// Folders only ever match free-text terms, against their name
    pub fn match_folder(&self, name: &str) -> bool {
        let Some(expr) = &self.expr else {
            return true;
        };
        let terms = &self.search.terms;
        let matched = expr.eval_folder(terms, &mut |i| match &terms[i].kind {
            TermKind::Text(pattern) => pattern.matches(name),
            _ => false,
        });
        matched == Some(true)
    }

    fn term_matches(&self, kind: &TermKind, item: &Item<'_>) -> bool {
        match kind {
            TermKind::Text(pattern) => {
                pattern.matches(&item.file.name) || item.text_fields().any(|field| pattern.matches(field))
            }
            TermKind::Property {
                property,
                comparison,
                value,
            } if property.is_numeric() => match (item.number(*property), parse_number(*property, &value.text)) {
                (Some(actual), Some(wanted)) => comparison.compare_f64(actual, wanted),
                _ => false,
            },
            TermKind::Property {
                property,
                comparison,
                value,
            } => item
                .text_values(*property)
                .iter()
                .any(|candidate| compare_text(*comparison, value, candidate)),
            TermKind::Has(property) => item.has(*property),
            TermKind::Date(term) => {
                let time = match term.target {
                    DateTarget::Created => item.created_or_taken(),
                    DateTarget::Modified => item.file.modified,
                };
                term.matches(time, self.now)
            }
            TermKind::Location { center, radius_km } => item
                .metadata
                .and_then(|m| m.gps)
                .is_some_and(|gps| gps.distance_km(center) <= *radius_km),
            TermKind::Place(pattern) => item.metadata.is_some_and(|m| {
                [&m.place, &m.state, &m.country]
                    .into_iter()
                    .flatten()
                    .any(|v| pattern.matches(v))
            }),
            TermKind::MediaType(media_type) => item.file.file_type.media_type == *media_type,
            TermKind::Duplicate => item.file.duplicates().is_duplicate(),
        }
    }
}

fn compare_text(comparison: Comparison, pattern: &TextPattern, candidate: &str) -> bool {
    match comparison {
        Comparison::Contains => pattern.matches(candidate),
        Comparison::Equals => pattern.matches_exactly(candidate),
        Comparison::LessThan => candidate.to_lowercase() < pattern.text,
        Comparison::LessOrEqual => candidate.to_lowercase() <= pattern.text,
        Comparison::GreaterThan => candidate.to_lowercase() > pattern.text,
        Comparison::GreaterOrEqual => candidate.to_lowercase() >= pattern.text,
    }
}

/// Parse a numeric property value, accepting the usual unit spellings
///
/// `10mb`, `1.5g` for sizes, `1/250` or `2s` for exposure, `f/2.8` for
/// apertures, `35mm` for focal lengths.
pub fn parse_number(property: Property, raw: &str) -> Option<f64> {
    let value = raw.trim().to_ascii_lowercase();

    match property {
        Property::Size => {
            let split = value.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(value.len());
            let (number, unit) = value.split_at(split);
            let multiplier: f64 = match unit {
                "" | "b" => 1.0,
                "k" | "kb" => 1024.0,
                "m" | "mb" => 1024.0 * 1024.0,
                "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
                _ => return None,
            };
            number.parse::<f64>().ok().map(|n| n * multiplier)
        }
        Property::Exposure => {
            let value = value.trim_end_matches('s');
            match value.split_once('/') {
                Some((num, den)) => {
                    let (num, den) = (num.parse::<f64>().ok()?, den.parse::<f64>().ok()?);
                    (den != 0.0).then(|| num / den)
                }
                None => value.parse().ok(),
            }
        }
        Property::FNumber => value.trim_start_matches("f/").trim_start_matches('f').parse().ok(),
        Property::FocalLength => value.trim_end_matches("mm").parse().ok(),
        Property::Duration => value.trim_end_matches('s').parse().ok(),
        _ => value.parse().ok(),
    }
}

/// Borrowed view of one file while matching
struct Item<'a> {
    path: &'a Path,
    file: &'a FileRecord,
    metadata: Option<&'a FileMetadata>,
}

impl Item<'_> {
    fn created_or_taken(&self) -> DateTime<Utc> {
        self.metadata.and_then(|m| m.taken).unwrap_or(self.file.created)
    }

    /// Every textual metadata field searched by free text
    fn text_fields(&self) -> impl Iterator<Item = &str> {
        let meta = self.metadata;
        let singles = meta.into_iter().flat_map(|m| {
            [
                &m.title,
                &m.description,
                &m.comment,
                &m.album,
                &m.artist,
                &m.genre,
                &m.copyright,
                &m.camera_make,
                &m.camera_model,
                &m.lens,
                &m.place,
                &m.state,
                &m.country,
            ]
            .into_iter()
            .flatten()
            .map(String::as_str)
        });
        let tags = meta.into_iter().flat_map(|m| m.tags.iter().map(String::as_str));
        singles.chain(tags)
    }

    fn text_values(&self, property: Property) -> Vec<String> {
        let meta = self.metadata;
        let field = |value: Option<&String>| value.cloned().into_iter().collect::<Vec<_>>();

        match property {
            Property::Name => vec![self.file.name.clone()],
            Property::Extension => vec![self.file.file_type.extension.clone()],
            Property::Path => vec![self.path.to_string_lossy().into_owned()],
            Property::Title => field(meta.and_then(|m| m.title.as_ref())),
            Property::Description => field(meta.and_then(|m| m.description.as_ref())),
            Property::Comment => field(meta.and_then(|m| m.comment.as_ref())),
            Property::Album => field(meta.and_then(|m| m.album.as_ref())),
            Property::Artist => field(meta.and_then(|m| m.artist.as_ref())),
            Property::Genre => field(meta.and_then(|m| m.genre.as_ref())),
            Property::Copyright => field(meta.and_then(|m| m.copyright.as_ref())),
            Property::Lens => field(meta.and_then(|m| m.lens.as_ref())),
            Property::Place => field(meta.and_then(|m| m.place.as_ref())),
            Property::State => field(meta.and_then(|m| m.state.as_ref())),
            Property::Country => field(meta.and_then(|m| m.country.as_ref())),
            Property::Camera => meta.and_then(FileMetadata::camera).into_iter().collect(),
            Property::Tag => meta.map(|m| m.tags.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn number(&self, property: Property) -> Option<f64> {
        if property == Property::Size {
            return Some(self.file.size as f64);
        }
        let m = self.metadata?;
        match property {
            Property::Iso => m.iso.map(f64::from),
            Property::FNumber => m.f_number,
            Property::Exposure => m.exposure_secs,
            Property::FocalLength => m.focal_length_mm,
            Property::Width => m.width.map(f64::from),
            Property::Height => m.height.map(f64::from),
            Property::Duration => m.duration_secs,
            Property::Rating => m.rating.map(f64::from),
            _ => None,
        }
    }

    fn has(&self, property: Property) -> bool {
        match property {
            Property::Name | Property::Extension | Property::Path => true,
            Property::Size => self.file.size > 0,
            Property::Location => self.metadata.is_some_and(|m| m.gps.is_some()),
            Property::Taken => self.metadata.is_some_and(|m| m.taken.is_some()),
            Property::Tag => self.metadata.is_some_and(|m| !m.tags.is_empty()),
            p if p.is_numeric() => self.number(p).is_some(),
            p => !self.text_values(p).is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileFlags, FileType, GeoCoord, MediaType};
    use crate::records::DuplicateInfo;
    use crate::search::parser::parse;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn file(name: &str, media_type: MediaType, meta: Option<FileMetadata>) -> FileRecord {
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 10, 0, 0).unwrap();
        let mut file_type = FileType::unknown(crate::file_types::extension_of(name));
        file_type.media_type = media_type;
        let record = FileRecord::new(name, Arc::new(file_type), 2048, created, created, FileFlags::default());
        if meta.is_some() {
            record.set_scan_result(meta, None, created);
        }
        record
    }

    fn check(query: &str, file: &FileRecord) -> SearchResult {
        let search = parse(query);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SearchMatcher::with_now(&search, now).match_item(Path::new("/a").join(&file.name).as_path(), file)
    }

    #[test]
    fn test_text_and_tag_both_required() {
        let vacation = file(
            "beach.jpg",
            MediaType::Image,
            Some(FileMetadata {
                tags: vec!["Vacation".into()],
                title: Some("Sunset".into()),
                ..Default::default()
            }),
        );
        assert_eq!(check("landscape #vacation", &vacation), SearchResult::NoMatch);
        assert_eq!(check("sunset #vacation", &vacation), SearchResult::Match);

        let named = file(
            "landscape_01.jpg",
            MediaType::Image,
            Some(FileMetadata {
                tags: vec!["vacation".into()],
                ..Default::default()
            }),
        );
        assert_eq!(check("landscape #vacation", &named), SearchResult::Match);
    }

    #[test]
    fn test_bloom_prefilter_short_circuits() {
        let bare = file("cat.jpg", MediaType::Image, None);
        assert_eq!(check("#cat", &bare), SearchResult::Filtered);
        assert_eq!(check("cat", &bare), SearchResult::Match);
        assert_eq!(check("-#cat", &bare), SearchResult::Match);
    }

    #[test]
    fn test_numeric_and_has_terms() {
        let photo = file(
            "a.jpg",
            MediaType::Image,
            Some(FileMetadata {
                iso: Some(1600),
                exposure_secs: Some(0.004),
                camera_make: Some("Canon".into()),
                ..Default::default()
            }),
        );
        assert!(check("iso:>=800", &photo).is_match());
        assert!(!check("iso:<800", &photo).is_match());
        assert!(check("exposure:1/250", &photo).is_match());
        assert!(check("size:2kb", &photo).is_match());
        assert!(check("has:camera camera:canon", &photo).is_match());
        assert!(!check("has:lens", &photo).is_match());
    }

    #[test]
    fn test_dates_location_type_and_duplicates() {
        let photo = file(
            "a.jpg",
            MediaType::Image,
            Some(FileMetadata {
                taken: Some(Utc.with_ymd_and_hms(2019, 7, 4, 0, 0, 0).unwrap()),
                gps: Some(GeoCoord::new(48.8566, 2.3522)),
                ..Default::default()
            }),
        );
        assert!(check("created:2019", &photo).is_match());
        assert!(check("modified:2020", &photo).is_match());
        assert!(check("year:july", &photo).is_match());
        assert!(check("near:48.86,2.35,5", &photo).is_match());
        assert!(!check("near:51.5,-0.12,50", &photo).is_match());
        assert!(check("type:photo", &photo).is_match());
        assert!(!check("type:video", &photo).is_match());

        assert!(!check("is:dup", &photo).is_match());
        photo.set_duplicates(DuplicateInfo { group_id: 3, group_size: 2 });
        assert!(check("is:dup", &photo).is_match());
    }

    #[test]
    fn test_or_and_negation() {
        let photo = file("dog.jpg", MediaType::Image, None);
        assert!(check("cat or dog", &photo).is_match());
        assert!(!check("cat or -dog", &photo).is_match());
        assert!(check("not cat", &photo).is_match());
    }

    #[test]
    fn test_folder_matching() {
        let search = parse("holiday #beach");
        let matcher = SearchMatcher::new(&search);
        assert!(!matcher.can_match_folder());
        assert!(!matcher.match_folder("holiday 2020"));

        let search = parse("holiday");
        let matcher = SearchMatcher::new(&search);
        assert!(matcher.can_match_folder());
        assert!(matcher.match_folder("Holiday 2020"));
        assert!(!matcher.match_folder("work"));
    }

    #[test]
    fn test_negated_metadata_terms_do_not_match_folders() {
        for query in ["-#cat", "-rating:5", "not is:dup"] {
            let search = parse(query);
            let matcher = SearchMatcher::new(&search);
            assert!(!matcher.can_match_folder(), "{}", query);
            assert!(!matcher.match_folder("work"), "{}", query);
        }

        let search = parse("holiday -#cat");
        let matcher = SearchMatcher::new(&search);
        assert!(matcher.can_match_folder());
        assert!(matcher.match_folder("holiday 2020"));
        assert!(!matcher.match_folder("work"));

        let search = parse("-holiday");
        let matcher = SearchMatcher::new(&search);
        assert!(matcher.match_folder("work"));
        assert!(!matcher.match_folder("holiday 2020"));
    }

    #[test]
    fn test_parse_number_units() {
        assert_eq!(parse_number(Property::Size, "1mb"), Some(1048576.0));
        assert_eq!(parse_number(Property::FNumber, "f/2.8"), Some(2.8));
        assert_eq!(parse_number(Property::FocalLength, "35mm"), Some(35.0));
        assert_eq!(parse_number(Property::Exposure, "1/0"), None);
        assert_eq!(parse_number(Property::Iso, "abc"), None);
    }
}
