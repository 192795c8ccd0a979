//! Case-insensitive, multi-valued header storage.

use std::collections::HashMap;
use std::fmt;

/// Headers for a request or response.
///
/// Lookup is case-insensitive, but storage preserves the casing of
/// whichever call first inserted a field, so messages round-trip
/// faithfully through proxies that care about exact bytes. Iteration
/// yields fields in insertion order.
///
/// Repeated insertion follows the wire-folding rules: `Set-Cookie`
/// values stay as distinct entries, every other repeated field is folded
/// into the first value with `", "`.
pub struct HeadersContainer {
    entries: Vec<Entry>,
    // lowercased name -> position in `entries`
    index: HashMap<String, usize>,
}

struct Entry {
    name: String,
    values: Vec<String>,
}

impl HeadersContainer {
    /// Creates an empty header container.
    pub fn new() -> HeadersContainer {
        HeadersContainer {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// The number of distinct header fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no fields are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All values for `name`, or `None` if the field is absent.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name)
            .map(|pos| self.entries[pos].values.as_slice())
    }

    /// The first value for `name`.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }

    /// Whether the field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&lower(name))
    }

    /// Replaces all values for `name`, keeping the casing already stored
    /// if the field exists, otherwise storing the caller's casing.
    pub fn set(&mut self, name: &str, values: Vec<String>) {
        match self.position(name) {
            Some(pos) => self.entries[pos].values = values,
            None => self.insert(name, values),
        }
    }

    /// Sets a single value, replacing any existing ones.
    pub fn set_value(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, vec![value.into()]);
    }

    /// Adds a single value under the field's merge rules.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.append_values(name, &[value.into()]);
    }

    /// Adds values under the field's merge rules.
    ///
    /// `Set-Cookie` values become additional list entries, never merged.
    /// Any other field that already exists has its *first* value replaced
    /// with `old + ", " + joined(new, ", ")`. Absent fields are set.
    pub fn append_values(&mut self, name: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let pos = match self.position(name) {
            Some(pos) => pos,
            None => {
                self.insert(name, values.to_vec());
                return;
            }
        };
        if lower(name) == "set-cookie" {
            self.entries[pos].values.extend(values.iter().cloned());
        } else {
            let merged = {
                let old = &self.entries[pos].values[0];
                let mut merged = String::with_capacity(old.len() + 2 + values[0].len());
                merged.push_str(old);
                for v in values {
                    merged.push_str(", ");
                    merged.push_str(v);
                }
                merged
            };
            self.entries[pos].values[0] = merged;
        }
    }

    /// Removes the field, if present.
    pub fn remove(&mut self, name: &str) {
        let key = lower(name);
        if let Some(pos) = self.index.remove(&key) {
            self.entries.remove(pos);
            for slot in self.index.values_mut() {
                if *slot > pos {
                    *slot -= 1;
                }
            }
        }
    }

    /// Drops every field.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Iterates `(stored_name, values)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.values.as_slice()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.index.get(&lower(name)).copied()
    }

    fn insert(&mut self, name: &str, values: Vec<String>) {
        self.index.insert(lower(name), self.entries.len());
        self.entries.push(Entry {
            name: name.to_owned(),
            values,
        });
    }
}

fn lower(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Default for HeadersContainer {
    fn default() -> HeadersContainer {
        HeadersContainer::new()
    }
}

impl fmt::Debug for HeadersContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (&e.name, &e.values)))
            .finish()
    }
}

impl Clone for HeadersContainer {
    fn clone(&self) -> HeadersContainer {
        HeadersContainer {
            entries: self
                .entries
                .iter()
                .map(|e| Entry {
                    name: e.name.clone(),
                    values: e.values.clone(),
                })
                .collect(),
            index: self.index.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HeadersContainer;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeadersContainer::new();
        headers.set_value("Content-Type", "text/plain");
        assert_eq!(headers.get_first("content-type"), Some("text/plain"));
        assert_eq!(headers.get_first("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get_first("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn casing_of_first_writer_is_preserved() {
        let mut headers = HeadersContainer::new();
        headers.set_value("x-custom-THING", "1");
        headers.append("X-Custom-Thing", "2");
        let (name, _) = headers.iter().next().unwrap();
        assert_eq!(name, "x-custom-THING");
    }

    #[test]
    fn append_folds_into_first_value() {
        let mut headers = HeadersContainer::new();
        headers.set_value("Accept", "text/html");
        headers.append_values(
            "accept",
            &["application/json".to_owned(), "image/png".to_owned()],
        );
        assert_eq!(
            headers.get("Accept").unwrap(),
            &["text/html, application/json, image/png".to_owned()][..]
        );
    }

    #[test]
    fn set_cookie_stays_separate() {
        let mut headers = HeadersContainer::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        headers.append("set-cookie", "c=3");
        assert_eq!(
            headers.get("Set-Cookie").unwrap(),
            &["a=1".to_owned(), "b=2".to_owned(), "c=3".to_owned()][..]
        );
    }

    #[test]
    fn append_absent_sets() {
        let mut headers = HeadersContainer::new();
        headers.append("Host", "example.org");
        assert_eq!(headers.get_first("host"), Some("example.org"));
    }

    #[test]
    fn remove_drops_both_entry_and_index() {
        let mut headers = HeadersContainer::new();
        headers.set_value("A", "1");
        headers.set_value("B", "2");
        headers.set_value("C", "3");
        headers.remove("b");
        assert!(headers.get("B").is_none());
        assert_eq!(headers.len(), 2);
        // later entries must still resolve after the shift
        assert_eq!(headers.get_first("c"), Some("3"));
        headers.set_value("B", "again");
        assert_eq!(headers.get_first("b"), Some("again"));
    }

    #[test]
    fn iteration_is_insertion_ordered() {
        let mut headers = HeadersContainer::new();
        headers.set_value("One", "1");
        headers.set_value("Two", "2");
        headers.set_value("Three", "3");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["One", "Two", "Three"]);
    }
}
