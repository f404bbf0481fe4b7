use ledgerline_core::{Category, Direction, NormalizedTransaction};

/// A category guess from something other than an explicit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub confidence: f32,
}

/// Pluggable last-resort classifier consulted when no rule matches.
/// Confidence must stay below 1.0 so rule matches remain distinguishable.
pub trait FallbackClassifier: Send + Sync {
    fn classify(&self, tx: &NormalizedTransaction) -> Option<Classification>;
}

const MCC_CONFIDENCE: f32 = 0.6;
const KEYWORD_CONFIDENCE: f32 = 0.5;

/// (first MCC, last MCC, level1, level2)
const MCC_RANGES: &[(u16, u16, &str, &str)] = &[
    (3000, 3350, "TRAVEL", "AIRLINES"),
    (3501, 3999, "TRAVEL", "ACCOMMODATION"),
    (4111, 4131, "TRANSPORT", "PUBLIC_TRANSPORT"),
    (4121, 4121, "TRANSPORT", "TAXI_RIDESHARE"),
    (4814, 4816, "UTILITIES", "PHONE_INTERNET"),
    (4899, 4899, "ENTERTAINMENT", "STREAMING"),
    (4900, 4900, "UTILITIES", "ENERGY"),
    (5300, 5300, "SHOPPING", "WHOLESALE"),
    (5411, 5411, "FOOD", "GROCERIES"),
    (5541, 5542, "TRANSPORT", "FUEL"),
    (5812, 5814, "FOOD", "DINING"),
    (5912, 5912, "HEALTH", "PHARMACY"),
    (6300, 6399, "INSURANCE", "GENERAL"),
    (8011, 8099, "HEALTH", "MEDICAL"),
];

/// Description keywords (matched against the uppercased description).
const KEYWORDS: &[(&[&str], &str, &str)] = &[
    (&["NETFLIX", "SPOTIFY", "DISNEY PLUS", "STAN.COM", "YOUTUBE PREMIUM"], "ENTERTAINMENT", "STREAMING"),
    (&["WOOLWORTHS", "COLES", "ALDI", "IGA ", "WHOLE FOODS", "SAFEWAY"], "FOOD", "GROCERIES"),
    (&["UBER EATS", "DOORDASH", "MENULOG", "DELIVEROO"], "FOOD", "TAKEAWAY"),
    (&["CAFE", "COFFEE", "RESTAURANT", "MCDONALD", "STARBUCKS"], "FOOD", "DINING"),
    (&["UBER", "LYFT", "TAXI", "OPAL", "MYKI", "TRANSLINK"], "TRANSPORT", "TAXI_RIDESHARE"),
    (&["SHELL", "BP ", "CALTEX", "AMPOL", "7-ELEVEN FUEL"], "TRANSPORT", "FUEL"),
    (&["ORIGIN ENERGY", "AGL", "ENERGYAUSTRALIA", "WATER"], "UTILITIES", "ENERGY"),
    (&["TELSTRA", "OPTUS", "VODAFONE", "INTERNET"], "UTILITIES", "PHONE_INTERNET"),
    (&["RENT", "LEASE", "REAL ESTATE"], "HOUSING", "RENT"),
    (&["MORTGAGE", "HOME LOAN"], "HOUSING", "MORTGAGE"),
    (&["INSURANCE", "NRMA", "MEDIBANK", "BUPA"], "INSURANCE", "GENERAL"),
    (&["PHARMACY", "CHEMIST"], "HEALTH", "PHARMACY"),
    (&["ATM", "CASH WITHDRAWAL"], "CASH", "ATM"),
    (&["FEE", "INTEREST CHARGED"], "FEES", "BANK_FEES"),
    (&["TRANSFER", "OSKO", "PAYID"], "TRANSFER", "INTERNAL"),
];

const INCOME_KEYWORDS: &[(&[&str], &str)] = &[
    (&["SALARY", "PAYROLL", "WAGES", "PAY "], "SALARY"),
    (&["DIVIDEND", "DISTRIBUTION"], "INVESTMENT"),
    (&["INTEREST"], "INTEREST"),
    (&["REFUND", "REVERSAL"], "REFUND"),
    (&["RENT"], "RENTAL"),
];

/// Built-in keyword and MCC lookup tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    fn by_mcc(mcc: &str) -> Option<Classification> {
        let code: u16 = mcc.trim().parse().ok()?;
        MCC_RANGES
            .iter()
            .filter(|(lo, hi, _, _)| (*lo..=*hi).contains(&code))
            // narrowest range wins, so single codes beat broad bands
            .min_by_key(|(lo, hi, _, _)| hi - lo)
            .map(|(_, _, l1, l2)| Classification {
                category: Category::new(l1, Some(*l2)),
                confidence: MCC_CONFIDENCE,
            })
    }

    fn by_keyword(tx: &NormalizedTransaction) -> Option<Classification> {
        let desc = format!("{} ", tx.description.to_uppercase());

        if tx.direction == Direction::In {
            return INCOME_KEYWORDS
                .iter()
                .find(|(words, _)| words.iter().any(|w| desc.contains(w)))
                .map(|(_, l2)| Classification {
                    category: Category::new("INCOME", Some(*l2)),
                    confidence: KEYWORD_CONFIDENCE,
                });
        }

        KEYWORDS
            .iter()
            .find(|(words, _, _)| words.iter().any(|w| desc.contains(w)))
            .map(|(_, l1, l2)| Classification {
                category: Category::new(l1, Some(*l2)),
                confidence: KEYWORD_CONFIDENCE,
            })
    }
}

impl FallbackClassifier for HeuristicClassifier {
    fn classify(&self, tx: &NormalizedTransaction) -> Option<Classification> {
        if tx.direction == Direction::Out {
            if let Some(c) = tx.mcc.as_deref().and_then(Self::by_mcc) {
                return Some(c);
            }
        }
        Self::by_keyword(tx)
    }
}
