use std::str::FromStr;
use std::sync::Arc;

use ledgerline_core::{Category, CategoryRule, EntityLink, NormalizedTransaction, RuleType, UserId};
use regex::{Regex, RegexBuilder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::heuristics::FallbackClassifier;

/// Outcome of categorizing one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorization {
    pub category: Category,
    /// 1.0 for a rule match, lower for a fallback guess, 0.0 for `OTHER`.
    pub confidence: f32,
    pub rule_id: Option<i64>,
    /// Entity link the matching rule pre-seeds, if any.
    pub link: Option<EntityLink>,
}

impl Categorization {
    pub fn uncategorized() -> Self {
        Self {
            category: Category::other(),
            confidence: 0.0,
            rule_id: None,
            link: None,
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Literal(String),
    MccSet(Vec<(u16, u16)>),
    AmountRange { min: Option<i64>, max: Option<i64> },
}

/// Internal pairing of a rule with its precompiled matcher.
#[derive(Debug)]
struct CompiledRule {
    rule: CategoryRule,
    matcher: Matcher,
}

pub struct CategoryRuleEngine {
    rules: Vec<CompiledRule>,
    fallback: Option<Arc<dyn FallbackClassifier>>,
}

impl CategoryRuleEngine {
    /// Keeps the active rules visible to `user_id` (their own plus global ones),
    /// ordered by priority descending with rule id as tie-break. Rules whose
    /// pattern cannot be compiled are skipped with a warning.
    pub fn new(rules: Vec<CategoryRule>, user_id: UserId) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.is_active && r.user_id.map_or(true, |owner| owner == user_id))
            .filter_map(|rule| match compile(&rule) {
                Ok(matcher) => Some(CompiledRule { rule, matcher }),
                Err(reason) => {
                    warn!(rule_id = rule.id, pattern = %rule.pattern, %reason, "skipping invalid category rule");
                    None
                }
            })
            .collect();
        compiled.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(a.rule.id.cmp(&b.rule.id))
        });
        Self {
            rules: compiled,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackClassifier>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find_matching_rule(&self, tx: &NormalizedTransaction) -> Option<&CategoryRule> {
        self.rules
            .iter()
            .find(|cr| rule_matches(cr, tx))
            .map(|cr| &cr.rule)
    }

    /// First matching rule wins outright; otherwise the fallback classifier, if
    /// any, gets a say; otherwise `OTHER` with zero confidence.
    pub fn categorize(&self, tx: &NormalizedTransaction) -> Categorization {
        if let Some(rule) = self.find_matching_rule(tx) {
            return Categorization {
                category: rule.category.clone(),
                confidence: 1.0,
                rule_id: Some(rule.id),
                link: rule.link.filter(|l| l.is_valid_for(tx.direction)),
            };
        }

        self.fallback
            .as_ref()
            .and_then(|f| f.classify(tx))
            .map(|c| Categorization {
                category: c.category,
                confidence: c.confidence.clamp(0.0, 0.99),
                rule_id: None,
                link: None,
            })
            .unwrap_or_else(Categorization::uncategorized)
    }
}

fn compile(rule: &CategoryRule) -> Result<Matcher, String> {
    let pattern = rule.pattern.trim();
    if pattern.is_empty() {
        return Err("empty pattern".into());
    }

    match rule.rule_type {
        RuleType::AmountRange => parse_amount_range(pattern),
        RuleType::Mcc if !rule.is_regex => parse_mcc_set(pattern).map(Matcher::MccSet),
        _ if rule.is_regex => RegexBuilder::new(pattern)
            .case_insensitive(!rule.case_sensitive)
            .build()
            .map(Matcher::Regex)
            .map_err(|e| e.to_string()),
        _ if rule.case_sensitive => Ok(Matcher::Literal(pattern.to_string())),
        _ => Ok(Matcher::Literal(pattern.to_uppercase())),
    }
}

/// `5411`, `5811-5814` or comma-separated combinations of both.
fn parse_mcc_set(pattern: &str) -> Result<Vec<(u16, u16)>, String> {
    pattern
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|part| {
            let (lo, hi) = part.split_once('-').unwrap_or((part, part));
            let lo: u16 = lo.trim().parse().map_err(|_| format!("bad MCC '{part}'"))?;
            let hi: u16 = hi.trim().parse().map_err(|_| format!("bad MCC '{part}'"))?;
            if lo > hi {
                return Err(format!("inverted MCC range '{part}'"));
            }
            Ok((lo, hi))
        })
        .collect()
}

/// `min-max` in currency units; either side may be omitted. Bounds are inclusive.
fn parse_amount_range(pattern: &str) -> Result<Matcher, String> {
    let (lo, hi) = pattern
        .split_once('-')
        .ok_or_else(|| format!("amount range '{pattern}' must look like min-max"))?;

    let to_cents = |s: &str| -> Result<Option<i64>, String> {
        let s = s.trim().trim_start_matches('$').replace(',', "");
        if s.is_empty() {
            return Ok(None);
        }
        let dec = Decimal::from_str(&s).map_err(|_| format!("bad amount '{s}'"))?;
        (dec * Decimal::from(100))
            .round()
            .to_i64()
            .map(Some)
            .ok_or_else(|| format!("amount '{s}' out of range"))
    };

    let min = to_cents(lo)?;
    let max = to_cents(hi)?;
    match (min, max) {
        (None, None) => Err("amount range has no bounds".into()),
        (Some(a), Some(b)) if a > b => Err(format!("inverted amount range '{pattern}'")),
        _ => Ok(Matcher::AmountRange { min, max }),
    }
}

fn rule_matches(cr: &CompiledRule, tx: &NormalizedTransaction) -> bool {
    let rule = &cr.rule;
    let target: Option<&str> = match rule.rule_type {
        RuleType::Merchant => Some(tx.merchant.as_str()),
        RuleType::Keyword => Some(tx.description.as_str()),
        RuleType::Mcc => tx.mcc.as_deref(),
        RuleType::Bpay => tx.bpay_biller_code.as_deref(),
        RuleType::AmountRange => None,
    };

    match &cr.matcher {
        Matcher::AmountRange { min, max } => {
            min.map_or(true, |m| tx.amount_cents >= m) && max.map_or(true, |m| tx.amount_cents <= m)
        }
        Matcher::MccSet(ranges) => target
            .and_then(|mcc| mcc.trim().parse::<u16>().ok())
            .is_some_and(|code| ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&code))),
        Matcher::Regex(re) => target.is_some_and(|t| re.is_match(t)),
        Matcher::Literal(lit) => target.is_some_and(|t| {
            let t = t.trim();
            let folded;
            let t = if rule.case_sensitive {
                t
            } else {
                folded = t.to_uppercase();
                folded.as_str()
            };
            match rule.rule_type {
                // substring search over the raw description
                RuleType::Keyword => t.contains(lit.as_str()),
                _ => t == lit,
            }
        }),
    }
}
