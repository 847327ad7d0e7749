//! Model filter: decides which code is in-model.
//!
//! In-model types and methods get full event generation. Everything else is
//! out-of-model and only ever appears as a synthesized frame or a rendered
//! value.

use std::collections::HashSet;

use regex::Regex;

use crate::error::ConfigError;
use crate::ids::{MethodKey, ThreadId, TypeKey};
use crate::source::Location;

/// In-model/out-of-model classifier.
pub trait ModelFilter: Send + Sync {
    /// Returns true if `type_key` is in-model.
    fn accepts_type(&self, type_key: &TypeKey) -> bool;

    /// Returns true if `method` executing on `thread` is in-model.
    fn accepts_method(&self, method: &MethodKey, thread: ThreadId) -> bool {
        let _ = thread;
        self.accepts_type(&method.owner)
    }

    /// Returns true if a step at `location` on `thread` should be processed.
    fn accepts_step(&self, thread: ThreadId, location: &Location) -> bool {
        self.accepts_method(&location.method, thread)
    }
}

/// Treats everything as in-model.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ModelFilter for AcceptAll {
    fn accepts_type(&self, _type_key: &TypeKey) -> bool {
        true
    }
}

/// Regex include/exclude filter over qualified type names.
///
/// A type is in-model when it matches at least one include pattern and no
/// exclude pattern. Patterns are anchored at both ends.
#[derive(Debug, Clone)]
pub struct PatternModelFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    excluded_threads: HashSet<ThreadId>,
}

impl PatternModelFilter {
    /// Compiles the given patterns.
    pub fn new<I, E, S1, S2>(include: I, exclude: E) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S1>,
        E: IntoIterator<Item = S2>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
            excluded_threads: HashSet::new(),
        })
    }

    /// Treats every method executing on `thread` as out-of-model.
    #[must_use]
    pub fn exclude_thread(mut self, thread: ThreadId) -> Self {
        self.excluded_threads.insert(thread);
        self
    }
}

fn compile_all<I, S>(patterns: I) -> Result<Vec<Regex>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            let p = p.as_ref();
            Regex::new(&format!("^(?:{p})$")).map_err(|e| ConfigError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl ModelFilter for PatternModelFilter {
    fn accepts_type(&self, type_key: &TypeKey) -> bool {
        let name = type_key.as_str();
        self.include.iter().any(|re| re.is_match(name)) && !self.exclude.iter().any(|re| re.is_match(name))
    }

    fn accepts_method(&self, method: &MethodKey, thread: ThreadId) -> bool {
        !self.excluded_threads.contains(&thread) && self.accepts_type(&method.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.accepts_type(&TypeKey::new("java.lang.Object")));
        assert!(AcceptAll.accepts_method(&MethodKey::new("x.Y", "z"), ThreadId(1)));
    }

    #[test]
    fn test_pattern_filter_include_exclude() {
        let filter = PatternModelFilter::new([r"app\..*", r"int\[\]"], [r"app\.generated\..*"]).unwrap();
        assert!(filter.accepts_type(&TypeKey::new("app.Counter")));
        assert!(filter.accepts_type(&TypeKey::new("int[]")));
        assert!(!filter.accepts_type(&TypeKey::new("app.generated.Stub")));
        assert!(!filter.accepts_type(&TypeKey::new("lib.Util")));
        // Anchored: a prefix match is not enough.
        assert!(!filter.accepts_type(&TypeKey::new("xapp.Counter")));
    }

    #[test]
    fn test_pattern_filter_thread_exclusion() {
        let filter = PatternModelFilter::new([r"app\..*"], Vec::<&str>::new())
            .unwrap()
            .exclude_thread(ThreadId(2));
        let m = MethodKey::new("app.A", "run");
        assert!(filter.accepts_method(&m, ThreadId(1)));
        assert!(!filter.accepts_method(&m, ThreadId(2)));
        let loc = Location::new(m, Some(1));
        assert!(!filter.accepts_step(ThreadId(2), &loc));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = PatternModelFilter::new(["app.(("], Vec::<&str>::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
