//! Free-text consular city names → gazetteer records.
//!
//! Two passes: an exact `ascii_name` match, then the curated alias table for the
//! names the first pass deferred. Among several records with the same name the most
//! populous wins; ties keep the record seen first.

use std::collections::{BTreeMap, HashMap};

use strsim::jaro_winkler;
use tracing::debug;
use vtrack_core::{CityRecord, DataQualityWarning, MatchPass};

use crate::reference::CityAliasTable;

#[derive(Debug, Clone, PartialEq)]
pub struct CityMatch {
    pub record: CityRecord,
    pub pass: MatchPass,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub matches: BTreeMap<String, CityMatch>,
    /// In first-seen order.
    pub unresolved: Vec<String>,
}

pub struct CityResolver<'a> {
    best_by_name: HashMap<&'a str, &'a CityRecord>,
    names: Vec<&'a str>,
    aliases: &'a CityAliasTable,
}

impl<'a> CityResolver<'a> {
    pub fn new(cities: &'a [CityRecord], aliases: &'a CityAliasTable) -> Self {
        let mut best_by_name: HashMap<&str, &CityRecord> = HashMap::new();
        let mut names = Vec::new();
        for city in cities {
            let name = city.ascii_name.as_str();
            match best_by_name.get(name).map(|current| current.population_rank()) {
                Some(rank) if city.population_rank() <= rank => {}
                Some(_) => {
                    best_by_name.insert(name, city);
                }
                None => {
                    names.push(name);
                    best_by_name.insert(name, city);
                }
            }
        }
        Self {
            best_by_name,
            names,
            aliases,
        }
    }

    pub fn lookup(&self, ascii_name: &str) -> Option<&'a CityRecord> {
        self.best_by_name.get(ascii_name).copied()
    }

    pub fn resolve<I, S>(&self, raw_names: I) -> Resolution
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolution = Resolution::default();
        let mut deferred = Vec::new();

        for raw in raw_names {
            let raw = raw.as_ref();
            if resolution.matches.contains_key(raw) || deferred.iter().any(|d: &String| d == raw) {
                continue;
            }
            match self.lookup(raw) {
                Some(record) => {
                    resolution.matches.insert(
                        raw.to_string(),
                        CityMatch {
                            record: record.clone(),
                            pass: MatchPass::Direct,
                        },
                    );
                }
                None => deferred.push(raw.to_string()),
            }
        }

        for raw in deferred {
            let aliased = self
                .aliases
                .get(&raw)
                .and_then(|canonical| self.lookup(canonical));
            match aliased {
                Some(record) => {
                    debug!(raw = %raw, canonical = %record.ascii_name, "resolved via alias");
                    resolution.matches.insert(
                        raw,
                        CityMatch {
                            record: record.clone(),
                            pass: MatchPass::Alias,
                        },
                    );
                }
                None => resolution.unresolved.push(raw),
            }
        }
        resolution
    }

    /// Closest gazetteer name, for curating the alias table. Never used for matching.
    pub fn closest_name(&self, raw: &str) -> Option<&'a str> {
        self.names
            .iter()
            .map(|name| (*name, jaro_winkler(raw, name)))
            .fold(None, |best: Option<(&str, f64)>, (name, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((name, score)),
            })
            .map(|(name, _)| name)
    }

    pub fn unresolved_warnings(&self, resolution: &Resolution) -> Vec<DataQualityWarning> {
        resolution
            .unresolved
            .iter()
            .map(|city_post| {
                let closest = self.closest_name(city_post).map(ToString::to_string);
                debug!(%city_post, ?closest, "city not found in gazetteer or alias table");
                DataQualityWarning::UnresolvedCity {
                    city_post: city_post.clone(),
                    closest_gazetteer_name: closest,
                }
            })
            .collect()
    }
}
