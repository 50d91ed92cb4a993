//! Randomized rule search: tweak existing rules and generate new ones from
//! the filter catalogue.
//!
//! Mutations never touch the source rule; each produces a fresh
//! [`RuleCandidate`]. The random source is seeded explicitly so a run can be
//! replayed.

use crate::domain::error::RulefolioError;
use crate::domain::rule::{
    Comparator, FilterClause, LookbackPeriod, Rule, RuleDefinition, RuleId, Sign,
};
use crate::ports::data_port::DataPort;
use crate::ports::store_port::StorePort;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

/// Reusable metric reference rules are generated from.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCatalogEntry {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationConfig {
    pub seed: u64,
    pub max_tweaks: usize,
    pub max_filters: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_tweaks: 2,
            max_filters: 5,
        }
    }
}

/// A rule not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleCandidate {
    pub name: String,
    pub definition: RuleDefinition,
}

pub trait RuleMutator {
    fn pick_rule<'r>(&mut self, rules: &'r [Rule]) -> Option<&'r Rule>;

    /// A variant of `rule`; `None` when the rule has no clauses to vary.
    fn tweak(&mut self, rule: &Rule) -> Option<RuleCandidate>;

    /// A new rule built from catalogue entries; `None` on an empty catalogue.
    fn generate(&mut self, catalog: &[FilterCatalogEntry]) -> Option<RuleCandidate>;
}

pub struct RandomRuleMutator {
    rng: StdRng,
    config: MutationConfig,
}

impl RandomRuleMutator {
    pub fn new(config: MutationConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    fn random_comparator(&mut self) -> Comparator {
        Comparator::ALL[self.rng.gen_range(0..Comparator::ALL.len())]
    }

    fn random_period(&mut self) -> LookbackPeriod {
        LookbackPeriod::ALL[self.rng.gen_range(0..LookbackPeriod::ALL.len())]
    }

    fn suggested_threshold(&mut self, entry: &FilterCatalogEntry) -> f64 {
        let name = entry.name.as_str();
        if entry.unit.as_deref() == Some("%") || name.contains("ROE") || name.contains("ROCE") {
            self.rng.gen_range(5..=30) as f64
        } else if name.contains("PE") || name.contains("PB") {
            round2(self.rng.gen_range(5.0..40.0))
        } else if name.contains("Debt") {
            self.rng.gen_range(0..=10) as f64
        } else if name.contains("Dividend") {
            round2(self.rng.gen_range(0.5..8.0))
        } else {
            round2(self.rng.gen_range(1.0..100.0))
        }
    }

    fn name_suffix(&mut self) -> u32 {
        self.rng.gen_range(1000..=9999)
    }
}

impl RuleMutator for RandomRuleMutator {
    fn pick_rule<'r>(&mut self, rules: &'r [Rule]) -> Option<&'r Rule> {
        rules.choose(&mut self.rng)
    }

    fn tweak(&mut self, rule: &Rule) -> Option<RuleCandidate> {
        if rule.definition.filters.is_empty() {
            return None;
        }

        let mut definition = rule.definition.clone();
        let edits = self.rng.gen_range(1..=self.config.max_tweaks.max(1));
        for _ in 0..edits {
            let idx = self.rng.gen_range(0..definition.filters.len());
            match self.rng.gen_range(0..3) {
                0 => {
                    let factor = self.rng.gen_range(0.8..=1.2);
                    let clause = &mut definition.filters[idx];
                    clause.threshold = round2(clause.threshold * factor);
                }
                1 => definition.filters[idx].sign = Sign::Known(self.random_comparator()),
                _ => definition.filters[idx].period = self.random_period(),
            }
        }

        Some(RuleCandidate {
            name: format!("Tweaked {} {}", rule.name, self.name_suffix()),
            definition,
        })
    }

    fn generate(&mut self, catalog: &[FilterCatalogEntry]) -> Option<RuleCandidate> {
        if catalog.is_empty() {
            return None;
        }

        let count = self.rng.gen_range(1..=self.config.max_filters.max(1)).min(catalog.len());
        let chosen: Vec<&FilterCatalogEntry> =
            catalog.choose_multiple(&mut self.rng, count).collect();

        let mut filters = Vec::with_capacity(chosen.len());
        for entry in chosen {
            let comparator = self.random_comparator();
            let threshold = self.suggested_threshold(entry);
            filters.push(FilterClause {
                id: Some(entry.id),
                name: entry.name.clone(),
                sign: Sign::Known(comparator),
                threshold,
                period: self.random_period(),
                consistency_period: None,
            });
        }

        Some(RuleCandidate {
            name: format!("Random Rule {}", self.name_suffix()),
            definition: RuleDefinition {
                bt_period_start: Some("2000".to_string()),
                bt_period_end: Some("2025".to_string()),
                sign_mcap: Some(Sign::Known(Comparator::Ge)),
                mcap_threshold: Some(500.0),
                filters,
            },
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One evolution step: `n_tweaks` variants of stored rules followed by
/// `n_random` fresh rules. Returns the ids of the rules persisted.
pub fn evolve(
    data: &dyn DataPort,
    store: &dyn StorePort,
    mutator: &mut dyn RuleMutator,
    n_tweaks: usize,
    n_random: usize,
) -> Result<Vec<RuleId>, RulefolioError> {
    let mut created = Vec::new();

    if n_tweaks > 0 {
        let rules: Vec<Rule> = data
            .list_rule_records()?
            .iter()
            .filter_map(|record| match record.parse() {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule_id = record.id, error = %e, "stored rule does not parse, not tweaking it");
                    None
                }
            })
            .collect();
        if rules.is_empty() {
            warn!("no rules stored, nothing to tweak");
        }
        for _ in 0..n_tweaks {
            let Some(source) = mutator.pick_rule(&rules) else {
                break;
            };
            let Some(candidate) = mutator.tweak(source) else {
                warn!(rule_id = source.id, "selected rule has no filters to tweak");
                continue;
            };
            let id = store.insert_rule(&candidate.name, &candidate.definition)?;
            info!(rule_id = id, from = source.id, name = candidate.name.as_str(), "tweaked rule");
            created.push(id);
        }
    }

    if n_random > 0 {
        let catalog = data.list_filter_catalog()?;
        if catalog.is_empty() {
            warn!("filter catalogue is empty, no random rules generated");
        }
        for _ in 0..n_random {
            let Some(candidate) = mutator.generate(&catalog) else {
                break;
            };
            let id = store.insert_rule(&candidate.name, &candidate.definition)?;
            info!(rule_id = id, name = candidate.name.as_str(), "generated rule");
            created.push(id);
        }
    }

    info!(created = created.len(), "evolution step complete");
    Ok(created)
}
