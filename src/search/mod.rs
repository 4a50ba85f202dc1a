//! Search queries over the index
//!
//! A query string is parsed into a [`SearchT`]: selectors that scope the
//! search to parts of the tree, plus a list of terms joined by AND/OR with
//! optional grouping. [`SearchMatcher`] evaluates the terms against single
//! items, using bloom bits to reject most non-matching items without
//! touching their metadata.

pub mod date;
pub mod matcher;
pub mod parser;
pub mod terms;

pub use date::{DateTarget, DateTerm};
pub use matcher::{SearchMatcher, SearchResult};
pub use parser::{SearchParser, parse};
pub use terms::{Comparison, Connector, Polarity, Property, SearchT, SearchTerm, Selector, TermKind, TextPattern};
