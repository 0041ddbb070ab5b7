//! # Selector module
//!
//! This module provide a label selector that could be rendered into the
//! string form understood by the kubernetes api and evaluated locally

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

// -----------------------------------------------------------------------------
// Requirement enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum Requirement {
    Equals(String, String),
    Exists(String),
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(key, value) => write!(f, "{}={}", key, value),
            Self::Exists(key) => write!(f, "{}", key),
        }
    }
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::Exists(key) => labels.contains_key(key),
        }
    }
}

// -----------------------------------------------------------------------------
// Selector structure

#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let requirements = self
            .requirements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        write!(f, "{}", requirements.join(","))
    }
}

impl Selector {
    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::Equals(key.to_string(), value.to_string()));
        self
    }

    pub fn exists(mut self, key: &str) -> Self {
        self.requirements.push(Requirement::Exists(key.to_string()));
        self
    }

    /// returns if all requirements hold for the given labels, an empty
    /// selector matches everything
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }
}
