use std::{cmp::Ordering, fmt::Display, str::FromStr};

use itertools::{EitherOrBoth, Itertools};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("invalid version '{0}'")]
    BadVersion(String),
}

/// Firmware version such as `4.4.3`, `7.4.4.0 build 0` or `2.00.01`.
///
/// Only the numeric components and the build number take part in
/// comparisons. Anything else in the string is kept for display.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u32>,
    build: Option<u32>,
    original: String,
}

impl Version {
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    pub fn build(&self) -> Option<u32> {
        self.build
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"(?P<components>\d+(?:\.\d+)*)(?:\s+build\s+(?P<build>\d+))?").unwrap();
        }

        let bad_version = || VersionError::BadVersion(input.to_string());
        let cap = RE.captures(input).ok_or_else(bad_version)?;

        let components = cap["components"]
            .split('.')
            .map(|c| c.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| bad_version())?;

        let build = match cap.name("build") {
            Some(b) => Some(b.as_str().parse::<u32>().map_err(|_| bad_version())?),
            None => None,
        };

        Ok(Version {
            components,
            build,
            original: input.trim().to_string(),
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.original.fmt(f)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components
            .iter()
            .zip_longest(other.components.iter())
            .map(|pair| match pair {
                EitherOrBoth::Both(a, b) => a.cmp(b),
                EitherOrBoth::Left(a) => a.cmp(&0),
                EitherOrBoth::Right(b) => 0.cmp(b),
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.build.unwrap_or(0).cmp(&other.build.unwrap_or(0)))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}
