//! Prefix keys for place-name autocomplete
//!
//! Every word of a place name is folded to lower case and its first
//! [`KEY_LEN`] bytes are packed big-endian into a `u32`, so key order equals
//! byte order of the prefixes. A query word shorter than the key selects a
//! contiguous key range; a longer one selects a single key and the caller
//! verifies the rest of the word.

/// Packed prefix key
pub type NgramKey = u32;

pub const KEY_LEN: usize = 4;

/// Case-folded words of a name
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn pack(prefix: &[u8], fill: u8) -> NgramKey {
    let mut bytes = [fill; KEY_LEN];
    let n = prefix.len().min(KEY_LEN);
    bytes[..n].copy_from_slice(&prefix[..n]);
    NgramKey::from_be_bytes(bytes)
}

/// Key of a folded word
pub fn ngram_key(word: &str) -> NgramKey {
    pack(word.as_bytes(), 0)
}

/// Inclusive key range covering every word starting with `prefix`
pub fn key_range(prefix: &str) -> (NgramKey, NgramKey) {
    let bytes = prefix.as_bytes();
    if bytes.len() >= KEY_LEN {
        let key = pack(bytes, 0);
        (key, key)
    } else {
        (pack(bytes, 0), pack(bytes, 0xFF))
    }
}

/// Sorted `(key, place)` pairs
#[derive(Debug, Default)]
pub struct NgramTable {
    entries: Vec<(NgramKey, u32)>,
}

impl NgramTable {
    pub fn build(mut entries: Vec<(NgramKey, u32)>) -> Self {
        entries.sort_unstable();
        entries.dedup();
        Self { entries }
    }

    /// Append the keys of every word of `name` for place `index`
    pub fn add_name(entries: &mut Vec<(NgramKey, u32)>, name: &str, index: u32) {
        entries.extend(words(name).map(|w| (ngram_key(&w), index)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Places having a word whose key falls in the prefix range of `word`
    ///
    /// A place may be yielded more than once when several of its words match.
    pub fn lookup(&self, word: &str) -> impl Iterator<Item = u32> + '_ {
        let (lo, hi) = key_range(word);
        let start = self.entries.partition_point(|&(k, _)| k < lo);
        let end = self.entries.partition_point(|&(k, _)| k <= hi);
        self.entries[start..end.max(start)].iter().map(|&(_, place)| place)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(names: &[&str]) -> NgramTable {
        let mut entries = Vec::new();
        for (i, name) in names.iter().enumerate() {
            NgramTable::add_name(&mut entries, name, i as u32);
        }
        NgramTable::build(entries)
    }

    #[test]
    fn test_words_fold_case() {
        let w: Vec<_> = words("Saint-Étienne du Rouvray").collect();
        assert_eq!(w, vec!["saint", "étienne", "du", "rouvray"]);
    }

    #[test]
    fn test_key_order_matches_prefix_order() {
        assert!(ngram_key("abc") < ngram_key("abd"));
        assert!(ngram_key("ab") < ngram_key("abc"));
        let (lo, hi) = key_range("ab");
        assert!(lo <= ngram_key("ab") && ngram_key("abzz") <= hi);
        assert!(ngram_key("ac") > hi);
    }

    #[test]
    fn test_lookup_by_prefix_and_word() {
        let t = table(&["New York", "Newark", "York", "Paris"]);
        let mut found: Vec<_> = t.lookup("new").collect();
        found.sort();
        assert_eq!(found, vec![0, 1]);

        let mut found: Vec<_> = t.lookup("york").collect();
        found.sort();
        assert_eq!(found, vec![0, 2]);

        // Longer than the key: candidates share the first four bytes
        let found: Vec<_> = t.lookup("pari").collect();
        assert_eq!(found, vec![3]);
        assert_eq!(t.lookup("zzz").count(), 0);
    }
}
