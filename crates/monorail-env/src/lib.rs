#![deny(clippy::all)]

//! Environment variable selection for task hashing.
//!
//! Task definitions declare the environment variables that affect them with
//! wildcard patterns (`NEXT_PUBLIC_*`), optionally negated (`!NEXT_TRACE`).
//! This crate resolves those patterns against the process environment into
//! the value maps that feed fingerprint derivation.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

/// A list of "NAME=value" strings, the form in which resolved variables enter
/// a fingerprint.
pub type EnvironmentVariablePairs = Vec<String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

impl EnvironmentVariableMap {
    /// Captures the current process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// Renders the map as sorted "NAME=value" pairs. Sorting here keeps the
    /// fingerprint independent of map iteration order.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    /// Adds every entry of `other`, overwriting existing values.
    pub fn union(&mut self, other: &EnvironmentVariableMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Removes every key present in `other`.
    pub fn difference(&mut self, other: &EnvironmentVariableMap) {
        for key in other.0.keys() {
            self.0.remove(key);
        }
    }

    /// Returns the subset of this map whose names match the given wildcard
    /// patterns, with `!`-prefixed exclusions already applied.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        Ok(self.wildcard_maps(wildcard_patterns)?.resolve())
    }

    /// Like [`EnvironmentVariableMap::from_wildcards`] but keeps inclusions
    /// and exclusions separate, so that explicit user exclusions can take
    /// precedence over inferred inclusions.
    pub fn from_wildcards_unresolved(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps::default());
        }

        self.wildcard_maps(wildcard_patterns)
    }

    fn wildcard_maps(&self, wildcard_patterns: &[impl AsRef<str>]) -> Result<WildcardMaps, Error> {
        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for pattern in wildcard_patterns {
            let pattern = pattern.as_ref();
            if let Some(negated) = pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(negated));
            } else if let Some(literal_bang) = pattern.strip_prefix("\\!") {
                include_patterns.push(wildcard_to_regex_pattern(&format!("!{literal_bang}")));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;

        let mut output = WildcardMaps::default();
        for (name, value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(name) {
                output.inclusions.insert(name.clone(), value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(name) {
                output.exclusions.insert(name.clone(), value.clone());
            }
        }

        Ok(output)
    }
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        EnvironmentVariableMap(iter.into_iter().collect())
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Inclusion and exclusion sides of a wildcard pattern set.
#[derive(Debug, Default)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

/// The composite map plus its provenance breakdown. `all` feeds the
/// fingerprint; `by_source` is reported in run summaries.
#[derive(Debug)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

#[derive(Debug)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: &str = "\\";
const REGEX_WILDCARD_SEGMENT: &str = ".*";

/// Translates a single wildcard pattern to a regex fragment. `*` becomes
/// `.*`, `\*` stays a literal star, everything else is escaped.
fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.chars().enumerate() {
        if char == WILDCARD {
            if previous_char == Some('\\') {
                // Escaped star: emit the static segment with the backslash
                // replaced by the literal star.
                let segment = format!("{}*", &pattern[previous_index..i - WILDCARD_ESCAPE.len()]);
                regex_string.push(regex::escape(&segment));
            } else {
                // Static segment since the previous wildcard, if any.
                let static_segment = &pattern[previous_index..i];
                if !static_segment.is_empty() {
                    regex_string.push(regex::escape(static_segment));
                }

                // Collapse adjacent wildcards into one dynamic segment.
                if regex_string.last().map(String::as_str) != Some(REGEX_WILDCARD_SEGMENT) {
                    regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                }
            }

            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    regex_string.push(regex::escape(&pattern[previous_index..]));
    regex_string.join("")
}

/// Resolves the repo-wide env var declarations into the map hashed into the
/// global fingerprint.
pub fn global_hashable_env_vars(
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
) -> Result<DetailedMap, Error> {
    let user_set = env_at_execution_start.from_wildcards_unresolved(global_env)?;

    let mut explicit = EnvironmentVariableMap::default();
    explicit.union(&user_set.inclusions);
    explicit.difference(&user_set.exclusions);

    let mut all = EnvironmentVariableMap::default();
    all.union(&explicit);

    Ok(DetailedMap {
        all,
        by_source: BySource {
            explicit,
            matching: EnvironmentVariableMap::default(),
        },
    })
}
