use regex::{Regex, RegexBuilder};

use crate::error::Result;
use crate::item::Item;

/// Upper bound on item size for `list` and `dump`; zero or negative disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeLimit(i64);

impl SizeLimit {
    pub fn new(max_value_size: i64) -> Self {
        Self(max_value_size)
    }

    pub fn unbounded() -> Self {
        Self(0)
    }

    pub fn is_bounded(&self) -> bool {
        self.0 > 0
    }

    pub fn admits(&self, size: u64) -> bool {
        !self.is_bounded() || size <= self.0 as u64
    }
}

/// Search settings for `grep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub pattern: String,
    pub ignore_case: bool,
    pub invert_match: bool,
}

/// Compiled form of a [`FilterSpec`].
#[derive(Debug, Clone)]
pub struct ItemFilter {
    regex: Regex,
    invert_match: bool,
}

impl ItemFilter {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        let regex = RegexBuilder::new(&spec.pattern)
            .case_insensitive(spec.ignore_case)
            .build()?;
        Ok(Self {
            regex,
            invert_match: spec.invert_match,
        })
    }

    /// The pattern occurs in the key, or in the value when the value is text.
    pub fn matches(&self, item: &Item) -> bool {
        if self.regex.is_match(&item.key) {
            return true;
        }
        item.value
            .as_ref()
            .and_then(|v| v.searchable_text())
            .is_some_and(|text| self.regex.is_match(text))
    }

    pub fn selects(&self, item: &Item) -> bool {
        self.matches(item) != self.invert_match
    }
}

/// Keeps the items of one server's scan that pass the size bound and, when
/// given, the search filter. Scan order is preserved.
pub fn select_items(items: Vec<Item>, limit: SizeLimit, filter: Option<&ItemFilter>) -> Vec<Item> {
    items
        .into_iter()
        .filter(|item| limit.admits(item.size))
        .filter(|item| filter.map_or(true, |f| f.selects(item)))
        .collect()
}
