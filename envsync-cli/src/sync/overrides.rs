//! Override resolver
//!
//! Parses raw `configuration_override` entries into a lookup table keyed
//! by `ConfigUrl`. Each rule carries the set of property paths excluded
//! from diffing and writing for that configuration (or row). Parsed once
//! per run, read-only afterwards.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::api::{ConfigUrl, RunError};
use crate::config::OverrideEntry;

// Grammar of the platform's configuration detail URLs:
//   .../{writers|extractors|applications}/{component.id}/{config_id}[/rows/{row_id}]
static CONFIG_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".+/(writers|extractors|applications)/(.+\..+)/(\d+)/?").expect("valid regex")
});
static ROW_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".+/(writers|extractors|applications)/(.+\..+)/(\d+)/rows/(\d+)")
        .expect("valid regex")
});

/// Parse a configuration detail URL into a cross-project reference
pub fn parse_config_url(raw: &str) -> Result<ConfigUrl, RunError> {
    let mut url = raw.trim().to_string();
    if !url.ends_with('/') {
        url.push('/');
    }

    if let Some(captures) = ROW_URL_RE.captures(&url) {
        return Ok(ConfigUrl::new(&captures[2], &captures[3]).with_row(&captures[4]));
    }

    let captures = CONFIG_URL_RE.captures(&url).ok_or_else(|| {
        RunError::Configuration(format!("provided configuration URL is invalid: {}", raw))
    })?;
    Ok(ConfigUrl::new(&captures[2], &captures[3]))
}

/// Set of ignored property paths for one configuration
///
/// A diff path is excluded when it equals an ignored path, lies under
/// one, or contains one underneath it (whole-subtree additions never
/// smuggle an ignored property in).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    paths: BTreeSet<String>,
}

impl IgnoreSet {
    /// Parse the comma-separated `ignored_properties` list. Whitespace
    /// around paths is trimmed; an empty list is valid.
    pub fn parse(raw: &str) -> Self {
        Self {
            paths: raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Path equals an ignored path or lies underneath one
    pub fn covers(&self, path: &str) -> bool {
        self.paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}.", p)))
    }

    /// An ignored path lies strictly underneath this path
    pub fn has_descendant(&self, path: &str) -> bool {
        let prefix = format!("{}.", path);
        self.paths.iter().any(|p| p.starts_with(&prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

/// One resolved override rule
#[derive(Debug, Clone)]
pub struct OverrideRule {
    /// Diagnostic label from the settings entry
    pub name: Option<String>,
    pub url: ConfigUrl,
    pub ignored: IgnoreSet,
}

/// Lookup table `ConfigUrl` -> `OverrideRule`
///
/// At most one rule exists per url; duplicate entries are ambiguous and
/// rejected at parse time.
#[derive(Debug, Clone, Default)]
pub struct OverrideMap {
    rules: HashMap<ConfigUrl, OverrideRule>,
}

impl OverrideMap {
    /// Resolve all raw override entries. Fails fast on the first
    /// malformed URL or duplicate entry, naming the offending raw value.
    pub fn resolve(entries: &[OverrideEntry]) -> Result<Self, RunError> {
        let mut rules = HashMap::new();
        for entry in entries {
            let url = parse_config_url(&entry.config_url)?;
            let rule = OverrideRule {
                name: entry.name.clone(),
                url: url.clone(),
                ignored: IgnoreSet::parse(&entry.ignored_properties),
            };
            if rules.insert(url, rule).is_some() {
                return Err(RunError::Configuration(format!(
                    "ambiguous override: duplicate config_url entry {}",
                    entry.config_url
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn rule_for(&self, url: &ConfigUrl) -> Option<&OverrideRule> {
        self.rules.get(url)
    }

    /// Ignore set for a url, empty when no rule matches
    pub fn ignored_for(&self, url: &ConfigUrl) -> IgnoreSet {
        self.rule_for(url)
            .map(|r| r.ignored.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
