//! Model glob patterns.
//!
//! Three forms are accepted: `*` (everything), `prefix*` (starts with) and a
//! literal (exact match). `*` may only appear as the final character.

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelPattern {
    Any,
    Prefix(String),
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Model pattern must not be empty")]
    Empty,
    #[error("Invalid model pattern '{0}': '*' is only allowed at the end")]
    MisplacedWildcard(String),
    #[error("At least one model pattern is required")]
    NoPatterns,
}

impl ModelPattern {
    pub fn matches(&self, model: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => model.starts_with(prefix.as_str()),
            Self::Exact(name) => model == name,
        }
    }
}

impl FromStr for ModelPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        match s.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => {
                Err(PatternError::MisplacedWildcard(s.to_string()))
            }
            Some("") => Ok(Self::Any),
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None if s.contains('*') => Err(PatternError::MisplacedWildcard(s.to_string())),
            None => Ok(Self::Exact(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Exact(e) => f.write_str(e),
        }
    }
}

/// Parse a non-empty list of patterns, failing on the first invalid one.
pub fn parse_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<ModelPattern>, PatternError> {
    if patterns.is_empty() {
        return Err(PatternError::NoPatterns);
    }
    patterns.iter().map(|p| p.as_ref().parse()).collect()
}

/// True if any pattern matches. Invalid stored patterns never match.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], model: &str) -> bool {
    patterns.iter().any(|p| {
        p.as_ref()
            .parse::<ModelPattern>()
            .is_ok_and(|pat| pat.matches(model))
    })
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn wildcard_matches_everything(model in ".*") {
            prop_assert!(ModelPattern::Any.matches(&model));
        }

        #[test]
        fn prefix_pattern_matches_its_extensions(
            prefix in "[a-z0-9./-]{1,12}",
            suffix in "[a-z0-9./-]{0,12}",
        ) {
            let pattern: ModelPattern = format!("{prefix}*").parse().unwrap();
            let model = format!("{prefix}{suffix}");
            prop_assert!(pattern.matches(&model));
        }

        #[test]
        fn exact_pattern_matches_only_itself(
            name in "[a-z0-9./-]{1,16}",
            other in "[a-z0-9./-]{1,16}",
        ) {
            let pattern: ModelPattern = name.parse().unwrap();
            prop_assert!(pattern.matches(&name));
            prop_assert_eq!(pattern.matches(&other), name == other);
        }

        #[test]
        fn interior_wildcard_is_rejected(
            a in "[a-z]{1,6}",
            b in "[a-z]{1,6}",
        ) {
            let raw = format!("{a}*{b}");
            prop_assert!(raw.parse::<ModelPattern>().is_err());
        }
    }
}
