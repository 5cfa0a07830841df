//! Process name filtering for -w/--watch
//!
//! A process is included when its display name contains any configured
//! substring, ignoring case. An empty filter list includes everything.

/// Name filter deciding which new processes start being tracked
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    /// Lowercased substrings (empty = match every name)
    names: Vec<String>,
}

impl ProcessFilter {
    /// Create a filter that includes every process
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from name fragments; blank entries are ignored
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        Self { names }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Fragments the filter matches on
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check if a process with this display name should be tracked
    pub fn matches(&self, process_name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let lowered = process_name.to_lowercase();
        self.names.iter().any(|name| lowered.contains(name.as_str()))
    }

    /// Check a name against the configured fragments only; an empty filter
    /// matches nothing
    pub fn matches_explicit(&self, process_name: &str) -> bool {
        !self.names.is_empty() && self.matches(process_name)
    }
}
