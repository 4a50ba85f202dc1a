//! Query text to [`SearchT`]
//!
//! ## Syntax
//! - `word`, `"quoted phrase"`: free text
//! - `#tag`: tag equality
//! - `key:value`: property (`iso:>=800`, `camera:canon`, `ext:=jpg`)
//! - `has:key`: property is present
//! - `created:`, `modified:`, `year:`: dates (see [`super::date`])
//! - `near:lat,lon[,km]`, `near:place`: geographic radius
//! - `type:image`, `is:dup`
//! - `-term`, `!term`, `not term`: negation
//! - `and`, `&&`, `or`, `||`, parentheses: boolean structure
//! - a leading path (`/photos/2020`, `/photos/**`, `/photos/*.jpg`): selector
//!
//! Parsing never fails; anything unrecognized becomes free text.

use globset::GlobBuilder;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::geo::GeoIndex;
use crate::models::{GeoCoord, MediaType};

use super::date::{DateTarget, DateTerm};
use super::terms::{Comparison, Connector, Polarity, Property, SearchT, SearchTerm, Selector, TermKind, TextPattern};

/// Radius used by `near:` when none is given
pub const DEFAULT_NEAR_RADIUS_KM: f64 = 10.0;

/// `lat,lon` or `lat,lon,radius_km`
static NEAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?\d{1,3}(?:\.\d+)?),(-?\d{1,3}(?:\.\d+)?)(?:,(\d+(?:\.\d+)?))?$")
        .expect("this regex should always be valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Word {
        text: String,
        /// The whole token was a quoted phrase
        phrase: bool,
        negated: bool,
    },
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            _ => {
                let mut text = String::new();
                let mut negated = false;
                let mut phrase = false;

                if c == '-' || c == '!' {
                    chars.next();
                    match chars.peek() {
                        Some(&n) if !n.is_whitespace() && n != '(' && n != ')' && n != c => negated = true,
                        _ => text.push(c),
                    }
                }

                if chars.peek() == Some(&'"') && text.is_empty() {
                    phrase = true;
                }

                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || n == '(' || n == ')' {
                        break;
                    }
                    chars.next();
                    if n == '"' {
                        // Quoted run, spaces included, closing quote optional
                        for q in chars.by_ref() {
                            if q == '"' {
                                break;
                            }
                            text.push(q);
                        }
                    } else {
                        text.push(n);
                        phrase = false;
                    }
                }

                if !text.is_empty() || phrase {
                    tokens.push(Token::Word { text, phrase, negated });
                }
            }
        }
    }

    tokens
}

/// Parses query text, optionally resolving place names through a geo index
pub struct SearchParser<'a> {
    locations: Option<&'a GeoIndex>,
}

impl<'a> SearchParser<'a> {
    pub fn new() -> Self {
        Self { locations: None }
    }

    pub fn with_locations(locations: Option<&'a GeoIndex>) -> Self {
        Self { locations }
    }

    pub fn parse(&self, input: &str) -> SearchT {
        let mut search = SearchT {
            text: input.to_string(),
            ..Default::default()
        };

        let mut pending_open: u16 = 0;
        let mut connector: Option<Connector> = None;
        let mut negate = false;

        for token in tokenize(input) {
            let (text, phrase, negated) = match token {
                Token::Open => {
                    pending_open += 1;
                    continue;
                }
                Token::Close => {
                    if pending_open > 0 {
                        pending_open -= 1;
                    } else if let Some(last) = search.terms.last_mut() {
                        last.end_group += 1;
                    }
                    continue;
                }
                Token::Word { text, phrase, negated } => (text, phrase, negated),
            };

            if !phrase && !negated {
                match text.to_lowercase().as_str() {
                    "and" | "&&" => {
                        connector = Some(Connector::And);
                        continue;
                    }
                    "or" | "||" | "|" => {
                        connector = Some(Connector::Or);
                        continue;
                    }
                    "not" | "-" | "!" => {
                        negate = !negate;
                        continue;
                    }
                    _ => {}
                }

                if pending_open == 0 && !negate && is_selector(&text) {
                    search.selectors.push(parse_selector(&text));
                    continue;
                }
            }

            let kind = if phrase {
                TermKind::Text(TextPattern::new(&text))
            } else {
                self.parse_term(&text)
            };

            search.terms.push(SearchTerm {
                kind,
                polarity: if negate ^ negated { Polarity::Exclude } else { Polarity::Include },
                connector: if search.terms.is_empty() { None } else { connector },
                begin_group: pending_open,
                end_group: 0,
            });
            pending_open = 0;
            connector = None;
            negate = false;
        }

        search
    }

    fn parse_term(&self, word: &str) -> TermKind {
        if let Some(tag) = word.strip_prefix('#').filter(|t| !t.is_empty()) {
            return TermKind::Property {
                property: Property::Tag,
                comparison: Comparison::Equals,
                value: TextPattern::new(tag),
            };
        }

        let Some((key, value)) = word.split_once(':') else {
            return TermKind::Text(TextPattern::new(word));
        };
        if key.is_empty() || value.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return TermKind::Text(TextPattern::new(word));
        }

        let parsed = match key.to_ascii_lowercase().as_str() {
            "has" => value.parse::<Property>().ok().map(TermKind::Has),
            "is" => matches!(value.to_ascii_lowercase().as_str(), "dup" | "dups" | "duplicate" | "duplicates")
                .then_some(TermKind::Duplicate),
            "type" | "kind" => value.parse::<MediaType>().ok().map(TermKind::MediaType),
            "created" | "date" | "taken" | "year" => DateTerm::parse(DateTarget::Created, value).map(TermKind::Date),
            "modified" | "changed" => DateTerm::parse(DateTarget::Modified, value).map(TermKind::Date),
            "near" | "location" => Some(self.parse_near(value)),
            other => other.parse::<Property>().ok().map(|property| {
                let (comparison, value) = Comparison::split_prefix(value);
                TermKind::Property {
                    property,
                    comparison,
                    value: TextPattern::new(value),
                }
            }),
        };

        parsed.unwrap_or_else(|| {
            log::debug!("Treating unrecognized term as text: {}", word);
            TermKind::Text(TextPattern::new(word))
        })
    }

    fn parse_near(&self, value: &str) -> TermKind {
        if let Some(caps) = NEAR_PATTERN.captures(value) {
            let lat = caps[1].parse::<f64>().ok();
            let lon = caps[2].parse::<f64>().ok();
            let radius_km = caps
                .get(3)
                .and_then(|r| r.as_str().parse::<f64>().ok())
                .unwrap_or(DEFAULT_NEAR_RADIUS_KM);
            match (lat, lon) {
                (Some(lat), Some(lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {
                    return TermKind::Location {
                        center: GeoCoord::new(lat, lon),
                        radius_km,
                    };
                }
                _ => {}
            }
        }

        let place = value.replace('_', " ");
        if let Some(found) = self
            .locations
            .and_then(|geo| geo.auto_complete(&place, 1, None).into_iter().next())
        {
            log::debug!("Resolved near:{} to {}", value, found.location.name);
            return TermKind::Location {
                center: found.location.coord,
                radius_km: DEFAULT_NEAR_RADIUS_KM,
            };
        }

        TermKind::Place(TextPattern::new(&place))
    }
}

impl Default for SearchParser<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse without a geo index
pub fn parse(input: &str) -> SearchT {
    SearchParser::new().parse(input)
}

fn is_selector(word: &str) -> bool {
    let bytes = word.as_bytes();
    word.starts_with('/')
        || word.starts_with("\\\\")
        || (bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'/' | b'\\'))
}

fn parse_selector(word: &str) -> Selector {
    let mut raw = word.to_string();
    let mut recursive = false;
    for suffix in ["/**", "\\**"] {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            raw = stripped.to_string();
            recursive = true;
            break;
        }
    }
    if raw.is_empty() {
        raw.push('/');
    }

    let path = PathBuf::from(&raw);
    let last = path.file_name().map(|n| n.to_string_lossy().into_owned());

    match last {
        Some(component) if component.contains(['*', '?', '[']) => {
            let pattern = GlobBuilder::new(&component)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .ok()
                .map(|g| g.compile_matcher());
            Selector {
                path: path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/")),
                recursive,
                pattern,
            }
        }
        _ => Selector {
            path,
            recursive,
            pattern: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::date::DateSpec;
    use crate::search::terms::Expr;

    #[test]
    fn test_text_and_tag_with_implicit_and() {
        let search = parse("landscape #vacation");

        assert!(search.selectors.is_empty());
        assert_eq!(search.terms.len(), 2);
        assert!(matches!(&search.terms[0].kind, TermKind::Text(p) if p.text == "landscape"));
        assert!(matches!(
            &search.terms[1].kind,
            TermKind::Property { property: Property::Tag, value, .. } if value.text == "vacation"
        ));
        assert_eq!(search.terms[1].connector, None);
        assert_eq!(search.expression().unwrap(), Expr::And(vec![Expr::Term(0), Expr::Term(1)]));
    }

    #[test]
    fn test_tokenize_quotes_and_negation() {
        let tokens = tokenize(r#"-"red car" title:"big sky" !x ( y )"#);
        assert_eq!(
            tokens,
            vec![
                Token::Word { text: "red car".into(), phrase: true, negated: true },
                Token::Word { text: "title:big sky".into(), phrase: false, negated: false },
                Token::Word { text: "x".into(), phrase: false, negated: true },
                Token::Open,
                Token::Word { text: "y".into(), phrase: false, negated: false },
                Token::Close,
            ]
        );
    }

    #[test]
    fn test_connectors_negation_and_groups() {
        let search = parse("(cat or dog) and not #blurry");
        assert_eq!(search.terms.len(), 3);
        assert_eq!(search.terms[0].begin_group, 1);
        assert_eq!(search.terms[1].connector, Some(Connector::Or));
        assert_eq!(search.terms[1].end_group, 1);
        assert_eq!(search.terms[2].connector, Some(Connector::And));
        assert!(search.terms[2].is_negated());

        assert_eq!(
            search.expression().unwrap(),
            Expr::And(vec![
                Expr::Or(vec![Expr::Term(0), Expr::Term(1)]),
                Expr::Not(Box::new(Expr::Term(2))),
            ])
        );
    }

    #[test]
    fn test_typed_terms() {
        let search = parse("iso:>=800 has:gps type:video is:dup created:2020-06 modified:<30d near:48.85,2.35,5");
        let kinds: Vec<_> = search.terms.iter().map(|t| &t.kind).collect();

        assert!(matches!(
            kinds[0],
            TermKind::Property { property: Property::Iso, comparison: Comparison::GreaterOrEqual, value } if value.text == "800"
        ));
        assert_eq!(*kinds[1], TermKind::Has(Property::Location));
        assert_eq!(*kinds[2], TermKind::MediaType(MediaType::Video));
        assert_eq!(*kinds[3], TermKind::Duplicate);
        assert!(matches!(kinds[4], TermKind::Date(d) if d.spec == DateSpec::YearMonth(2020, 6)));
        assert!(matches!(kinds[5], TermKind::Date(d) if d.target == DateTarget::Modified));
        assert!(matches!(kinds[6], TermKind::Location { radius_km, .. } if (*radius_km - 5.0).abs() < 1e-9));
    }

    #[test]
    fn test_unknown_keys_fall_back_to_text() {
        let search = parse("foo:bar created:someday near:atlantis");
        assert!(matches!(&search.terms[0].kind, TermKind::Text(p) if p.text == "foo:bar"));
        assert!(matches!(&search.terms[1].kind, TermKind::Text(_)));
        assert!(matches!(&search.terms[2].kind, TermKind::Place(p) if p.text == "atlantis"));
    }

    #[test]
    fn test_selectors() {
        let search = parse("/photos/2020/** cat");
        assert_eq!(search.selectors.len(), 1);
        assert_eq!(search.selectors[0].path, PathBuf::from("/photos/2020"));
        assert!(search.selectors[0].recursive);
        assert_eq!(search.terms.len(), 1);

        let search = parse("/photos/IMG_*.jpg");
        let selector = &search.selectors[0];
        assert_eq!(selector.path, PathBuf::from("/photos"));
        assert!(!selector.recursive);
        assert!(selector.accepts("img_0001.JPG"));
        assert!(!selector.accepts("notes.txt"));
        assert!(!search.has_terms());
    }

    #[test]
    fn test_unbalanced_parentheses() {
        let search = parse("a) (b");
        assert_eq!(search.terms.len(), 2);
        assert_eq!(search.expression().unwrap(), Expr::And(vec![Expr::Term(0), Expr::Term(1)]));
    }
}
