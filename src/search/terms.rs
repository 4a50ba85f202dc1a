//! Typed search terms and their boolean structure
//!
//! A parsed search is a flat list of [`SearchTerm`]s. Each term carries its
//! polarity, the connector joining it to the previous term and how many
//! parentheses open before / close after it. [`compile`] turns that list into
//! an [`Expr`] tree with NOT binding tightest, then AND, then OR.

use globset::{GlobBuilder, GlobMatcher};
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString};

use crate::bloom::{BloomBits, BloomCategory};
use crate::models::{GeoCoord, MediaType};

use super::date::DateTerm;

/// Include or exclude matching items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Polarity {
    #[default]
    Include,
    Exclude,
}

/// How a term combines with the term before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// Comparison modifier of property and date terms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Comparison {
    /// Substring for text, equality for numbers
    #[default]
    Contains,
    Equals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl Comparison {
    /// Split a leading `<`, `<=`, `>`, `>=` or `=` off a value
    pub fn split_prefix(raw: &str) -> (Comparison, &str) {
        for (prefix, comparison) in [
            ("<=", Comparison::LessOrEqual),
            (">=", Comparison::GreaterOrEqual),
            ("<", Comparison::LessThan),
            (">", Comparison::GreaterThan),
            ("=", Comparison::Equals),
        ] {
            if let Some(rest) = raw.strip_prefix(prefix) {
                return (comparison, rest);
            }
        }
        (Comparison::Contains, raw)
    }

    pub fn compare_f64(self, actual: f64, wanted: f64) -> bool {
        const EPSILON: f64 = 1e-6;
        match self {
            Comparison::Contains | Comparison::Equals => (actual - wanted).abs() <= EPSILON * wanted.abs().max(1.0),
            Comparison::LessThan => actual < wanted,
            Comparison::LessOrEqual => actual <= wanted,
            Comparison::GreaterThan => actual > wanted,
            Comparison::GreaterOrEqual => actual >= wanted,
        }
    }
}

/// Named item properties usable in `key:value` and `has:key` terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Property {
    Name,
    #[strum(to_string = "extension", serialize = "ext")]
    Extension,
    Path,
    Size,
    Title,
    #[strum(to_string = "description", serialize = "desc", serialize = "caption")]
    Description,
    Comment,
    #[strum(to_string = "tag", serialize = "tags", serialize = "keyword")]
    Tag,
    Album,
    Artist,
    Genre,
    Copyright,
    #[strum(to_string = "camera", serialize = "model", serialize = "make")]
    Camera,
    Lens,
    Iso,
    #[strum(to_string = "f_number", serialize = "f", serialize = "aperture", serialize = "fnumber")]
    FNumber,
    #[strum(to_string = "exposure", serialize = "shutter")]
    Exposure,
    #[strum(to_string = "focal_length", serialize = "focal", serialize = "focallength")]
    FocalLength,
    Width,
    Height,
    Duration,
    #[strum(to_string = "rating", serialize = "stars")]
    Rating,
    #[strum(to_string = "place", serialize = "city")]
    Place,
    State,
    Country,
    #[strum(to_string = "location", serialize = "gps")]
    Location,
    #[strum(to_string = "taken", serialize = "date_taken")]
    Taken,
}

impl Property {
    /// Bloom category whose bit is set on every item this property can match
    pub fn bloom_category(self) -> Option<BloomCategory> {
        Some(match self {
            Property::Title => BloomCategory::Text,
            Property::Description => BloomCategory::Description,
            Property::Comment => BloomCategory::Comment,
            Property::Tag => BloomCategory::Tag,
            Property::Album => BloomCategory::Album,
            Property::Artist => BloomCategory::Artist,
            Property::Genre => BloomCategory::Genre,
            Property::Copyright => BloomCategory::Copyright,
            Property::Camera => BloomCategory::Camera,
            Property::Lens => BloomCategory::Lens,
            Property::Iso => BloomCategory::Iso,
            Property::FNumber => BloomCategory::FNumber,
            Property::Exposure => BloomCategory::Exposure,
            Property::FocalLength => BloomCategory::FocalLength,
            Property::Duration => BloomCategory::Duration,
            Property::Rating => BloomCategory::Rating,
            Property::Place | Property::State | Property::Country => BloomCategory::Place,
            Property::Location => BloomCategory::Location,
            Property::Taken => BloomCategory::Year,
            Property::Name | Property::Extension | Property::Path | Property::Size => return None,
            // Either dimension alone does not set the dimensions bit
            Property::Width | Property::Height => return None,
        })
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Property::Size
                | Property::Iso
                | Property::FNumber
                | Property::Exposure
                | Property::FocalLength
                | Property::Width
                | Property::Height
                | Property::Duration
                | Property::Rating
        )
    }
}

/// Case-insensitive text needle, with `*`/`?` wildcards when present
#[derive(Debug, Clone)]
pub struct TextPattern {
    pub text: String,
    glob: Option<GlobMatcher>,
}

impl TextPattern {
    pub fn new(raw: &str) -> Self {
        let text = raw.to_lowercase();
        let glob = if text.contains(['*', '?']) {
            GlobBuilder::new(&format!("*{}*", text))
                .literal_separator(false)
                .case_insensitive(true)
                .build()
                .ok()
                .map(|g| g.compile_matcher())
        } else {
            None
        };
        Self { text, glob }
    }

    pub fn has_wildcards(&self) -> bool {
        self.glob.is_some()
    }

    /// Substring (or wildcard) match
    pub fn matches(&self, candidate: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.is_match(candidate),
            None => candidate.to_lowercase().contains(&self.text),
        }
    }

    /// Whole-value match (wildcards still apply)
    pub fn matches_exactly(&self, candidate: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.is_match(candidate),
            None => candidate.to_lowercase() == self.text,
        }
    }
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

/// What a term tests
#[derive(Debug, Clone, PartialEq)]
pub enum TermKind {
    /// Free text against the name and every textual metadata field
    Text(TextPattern),
    Property {
        property: Property,
        comparison: Comparison,
        value: TextPattern,
    },
    Has(Property),
    Date(DateTerm),
    /// Within `radius_km` of a coordinate
    Location { center: GeoCoord, radius_km: f64 },
    /// Place name that did not resolve to a coordinate
    Place(TextPattern),
    MediaType(MediaType),
    Duplicate,
}

impl TermKind {
    /// Bits every item matching this (positive) term must carry
    pub fn required_bits(&self) -> BloomBits {
        match self {
            TermKind::Property { property, .. } | TermKind::Has(property) => property
                .bloom_category()
                .map(BloomBits::from)
                .unwrap_or(BloomBits::EMPTY),
            TermKind::Location { .. } => BloomCategory::Location.into(),
            TermKind::Place(_) => BloomCategory::Place.into(),
            TermKind::Text(_) | TermKind::Date(_) | TermKind::MediaType(_) | TermKind::Duplicate => BloomBits::EMPTY,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, TermKind::Text(_))
    }
}

/// One element of a parsed search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTerm {
    pub kind: TermKind,
    pub polarity: Polarity,
    /// Connector to the previous term; `None` means the default AND
    pub connector: Option<Connector>,
    pub begin_group: u16,
    pub end_group: u16,
}

impl SearchTerm {
    pub fn new(kind: TermKind) -> Self {
        Self {
            kind,
            polarity: Polarity::Include,
            connector: None,
            begin_group: 0,
            end_group: 0,
        }
    }

    pub fn is_negated(&self) -> bool {
        self.polarity == Polarity::Exclude
    }
}

/// Folder scope of a search
#[derive(Debug, Clone)]
pub struct Selector {
    pub path: PathBuf,
    pub recursive: bool,
    /// Filter applied to entry names (from wildcards in the last component)
    pub pattern: Option<GlobMatcher>,
}

impl Selector {
    pub fn accepts(&self, name: &str) -> bool {
        self.pattern.as_ref().is_none_or(|p| p.is_match(name))
    }
}

/// A parsed search: optional selectors plus typed terms
#[derive(Debug, Clone, Default)]
pub struct SearchT {
    pub text: String,
    pub selectors: Vec<Selector>,
    pub terms: Vec<SearchTerm>,
}

impl SearchT {
    pub fn has_terms(&self) -> bool {
        !self.terms.is_empty()
    }

    pub fn expression(&self) -> Option<Expr> {
        compile(&self.terms)
    }
}

/// Boolean expression over term indices
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Term(usize),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn eval(&self, test: &mut impl FnMut(usize) -> bool) -> bool {
        match self {
            Expr::Term(i) => test(*i),
            Expr::Not(inner) => !inner.eval(test),
            Expr::And(parts) => parts.iter().all(|p| p.eval(test)),
            Expr::Or(parts) => parts.iter().any(|p| p.eval(test)),
        }
    }

    /// Bits any matching item must carry
    ///
    /// A negated subexpression requires nothing; AND needs every child's
    /// bits, OR only the bits all alternatives share.
    pub fn required_bits(&self, terms: &[SearchTerm]) -> BloomBits {
        match self {
            Expr::Term(i) => terms[*i].kind.required_bits(),
            Expr::Not(_) => BloomBits::EMPTY,
            Expr::And(parts) => parts
                .iter()
                .fold(BloomBits::EMPTY, |acc, p| acc | p.required_bits(terms)),
            Expr::Or(parts) => parts
                .iter()
                .map(|p| p.required_bits(terms))
                .reduce(BloomBits::intersection)
                .unwrap_or(BloomBits::EMPTY),
        }
    }

    /// Whether a folder (matched by name only) could satisfy the expression
    pub fn can_match_folder(&self, terms: &[SearchTerm]) -> bool {
        self.folder_possible(terms) == Some(true)
    }

    fn folder_possible(&self, terms: &[SearchTerm]) -> Option<bool> {
        match self {
            Expr::Term(i) => Some(terms[*i].kind.is_text()),
            Expr::Not(inner) => inner.mentions_text(terms).then_some(true),
            Expr::And(parts) => known(parts.iter().map(|p| p.folder_possible(terms))).map(|mut k| k.all(|v| v)),
            Expr::Or(parts) => known(parts.iter().map(|p| p.folder_possible(terms))).map(|mut k| k.any(|v| v)),
        }
    }

    /// Evaluate against a folder, which only carries a name
    ///
    /// Metadata terms never hold for a folder. A negated subexpression
    /// without text terms says nothing about a folder and is left out of its
    /// parent; `None` when nothing is left.
    pub fn eval_folder(&self, terms: &[SearchTerm], name_matches: &mut impl FnMut(usize) -> bool) -> Option<bool> {
        match self {
            Expr::Term(i) => Some(terms[*i].kind.is_text() && name_matches(*i)),
            Expr::Not(inner) if inner.mentions_text(terms) => inner.eval_folder(terms, name_matches).map(|v| !v),
            Expr::Not(_) => None,
            Expr::And(parts) => {
                known(parts.iter().map(|p| p.eval_folder(terms, name_matches))).map(|mut k| k.all(|v| v))
            }
            Expr::Or(parts) => {
                known(parts.iter().map(|p| p.eval_folder(terms, name_matches))).map(|mut k| k.any(|v| v))
            }
        }
    }

    fn mentions_text(&self, terms: &[SearchTerm]) -> bool {
        match self {
            Expr::Term(i) => terms[*i].kind.is_text(),
            Expr::Not(inner) => inner.mentions_text(terms),
            Expr::And(parts) | Expr::Or(parts) => parts.iter().any(|p| p.mentions_text(terms)),
        }
    }
}

/// The known values, or `None` when there are none
fn known(values: impl Iterator<Item = Option<bool>>) -> Option<impl Iterator<Item = bool>> {
    let values: Vec<bool> = values.flatten().collect();
    (!values.is_empty()).then(|| values.into_iter())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Term(usize),
}

fn tokens(terms: &[SearchTerm]) -> Vec<Token> {
    let mut out = Vec::with_capacity(terms.len() * 2);
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            match term.connector {
                Some(Connector::Or) => out.push(Token::Or),
                Some(Connector::And) | None => out.push(Token::And),
            }
        }
        out.extend(std::iter::repeat_n(Token::Open, term.begin_group as usize));
        out.push(Token::Term(i));
        out.extend(std::iter::repeat_n(Token::Close, term.end_group as usize));
    }
    out
}

/// Build the expression tree for a flat term list
///
/// Unmatched closing groups are ignored and unclosed groups end with the
/// input. Returns `None` for an empty list.
pub fn compile(terms: &[SearchTerm]) -> Option<Expr> {
    let mut compiler = Compiler {
        tokens: tokens(terms),
        pos: 0,
        terms,
    };
    compiler.parse_or(0)
}

struct Compiler<'a> {
    tokens: Vec<Token>,
    pos: usize,
    terms: &'a [SearchTerm],
}

impl Compiler<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn parse_or(&mut self, depth: usize) -> Option<Expr> {
        let mut parts: Vec<Expr> = self.parse_and(depth).into_iter().collect();
        while self.peek() == Some(Token::Or) {
            self.pos += 1;
            parts.extend(self.parse_and(depth));
        }
        collapse(parts, Expr::Or)
    }

    fn parse_and(&mut self, depth: usize) -> Option<Expr> {
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::Or) => break,
                Some(Token::Close) if depth > 0 => break,
                Some(Token::Close) | Some(Token::And) => self.pos += 1,
                Some(Token::Open) | Some(Token::Term(_)) => parts.extend(self.parse_primary(depth)),
            }
        }
        collapse(parts, Expr::And)
    }

    fn parse_primary(&mut self, depth: usize) -> Option<Expr> {
        match self.peek()? {
            Token::Open => {
                self.pos += 1;
                let inner = self.parse_or(depth + 1);
                if self.peek() == Some(Token::Close) {
                    self.pos += 1;
                }
                inner
            }
            Token::Term(i) => {
                self.pos += 1;
                let term = Expr::Term(i);
                Some(if self.terms[i].is_negated() {
                    Expr::Not(Box::new(term))
                } else {
                    term
                })
            }
            _ => {
                self.pos += 1;
                None
            }
        }
    }
}

fn collapse(mut parts: Vec<Expr>, join: fn(Vec<Expr>) -> Expr) -> Option<Expr> {
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(join(parts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> SearchTerm {
        SearchTerm::new(TermKind::Text(TextPattern::new(t)))
    }

    fn tag(t: &str) -> SearchTerm {
        SearchTerm::new(TermKind::Property {
            property: Property::Tag,
            comparison: Comparison::Equals,
            value: TextPattern::new(t),
        })
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        // a OR b c  =>  a OR (b AND c)
        let mut b = text("b");
        b.connector = Some(Connector::Or);
        let terms = vec![text("a"), b, text("c")];

        assert_eq!(
            compile(&terms).unwrap(),
            Expr::Or(vec![Expr::Term(0), Expr::And(vec![Expr::Term(1), Expr::Term(2)])])
        );
    }

    #[test]
    fn test_groups_override_precedence() {
        // (a OR b) c
        let mut a = text("a");
        a.begin_group = 1;
        let mut b = text("b");
        b.connector = Some(Connector::Or);
        b.end_group = 1;
        let terms = vec![a, b, text("c")];

        assert_eq!(
            compile(&terms).unwrap(),
            Expr::And(vec![Expr::Or(vec![Expr::Term(0), Expr::Term(1)]), Expr::Term(2)])
        );
    }

    #[test]
    fn test_malformed_groups_are_tolerated() {
        let mut a = text("a");
        a.end_group = 2;
        let mut b = text("b");
        b.begin_group = 3;
        let terms = vec![a, b];

        assert_eq!(compile(&terms).unwrap(), Expr::And(vec![Expr::Term(0), Expr::Term(1)]));
        assert!(compile(&[]).is_none());
    }

    #[test]
    fn test_required_bits() {
        let mut neg = tag("x");
        neg.polarity = Polarity::Exclude;
        let has_album = SearchTerm::new(TermKind::Has(Property::Album));

        // tag AND NOT tag  => tag bit only
        let terms = vec![tag("a"), neg];
        let expr = compile(&terms).unwrap();
        assert_eq!(expr.required_bits(&terms), BloomCategory::Tag.into());

        // tag OR has:album => nothing in common
        let mut alt = has_album.clone();
        alt.connector = Some(Connector::Or);
        let terms = vec![tag("a"), alt];
        let expr = compile(&terms).unwrap();
        assert!(expr.required_bits(&terms).is_empty());
    }

    #[test]
    fn test_can_match_folder() {
        let terms = vec![text("a"), tag("b")];
        assert!(!compile(&terms).unwrap().can_match_folder(&terms));

        let mut b = tag("b");
        b.connector = Some(Connector::Or);
        let terms = vec![text("a"), b];
        assert!(compile(&terms).unwrap().can_match_folder(&terms));
    }

    #[test]
    fn test_text_pattern() {
        let plain = TextPattern::new("Cat");
        assert!(plain.matches("my CATS"));
        assert!(!plain.matches_exactly("cats"));

        let wild = TextPattern::new("img_*.jpg");
        assert!(wild.has_wildcards());
        assert!(wild.matches("IMG_0001.JPG"));
        assert!(!wild.matches("photo.png"));
    }

    #[test]
    fn test_property_aliases() {
        assert_eq!("ext".parse::<Property>().unwrap(), Property::Extension);
        assert_eq!("Aperture".parse::<Property>().unwrap(), Property::FNumber);
        assert_eq!(Property::FocalLength.to_string(), "focal_length");
        assert!("bogus".parse::<Property>().is_err());
    }
}
