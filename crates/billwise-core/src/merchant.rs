//! Merchant grouping
//!
//! Statement descriptions carry store numbers, processor prefixes and location
//! codes that change from charge to charge. `clean_description` strips that
//! noise; `MerchantRegistry` then folds near-identical results onto an
//! already-known key so "NETFLIX.COM 1234" and "NETFLIX 5678" group together.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::DetectionConfig;

/// Payment-processor and channel prefixes that precede the merchant name
const PROCESSOR_PREFIXES: [&str; 19] = [
    "pos", "ach", "debit", "credit", "payment", "purchase", "recurring", "card", "upi", "nach",
    "sq", "tst", "sp", "pp", "paypal", "aplpay", "applepay", "gpay", "google",
];

const FILLER_TOKENS: [&str; 6] = ["com", "www", "inc", "llc", "ltd", "co"];

const COUNTRY_CODES: [&str; 6] = ["US", "USA", "IN", "IND", "GB", "UK"];

static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4,}").expect("valid regex"));

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

fn is_location_code(token: &str) -> bool {
    let state_like = token.len() == 2 && token.chars().all(|c| c.is_ascii_uppercase());
    state_like || COUNTRY_CODES.contains(&token)
}

/// Reduce a raw description to its merchant key candidate
pub fn clean_description(raw: &str) -> String {
    let mut raw_tokens: Vec<&str> = raw.split_whitespace().collect();
    while raw_tokens.len() > 1 && raw_tokens.last().is_some_and(|t| is_location_code(t)) {
        raw_tokens.pop();
    }

    let lowered = raw_tokens.join(" ").to_lowercase();
    let without_ids = DIGIT_RUN.replace_all(&lowered, " ");
    let spaced = NON_ALNUM.replace_all(&without_ids, " ");

    let mut tokens: Vec<&str> = spaced
        .split_whitespace()
        .filter(|t| !FILLER_TOKENS.contains(t))
        .collect();

    let leading = tokens
        .iter()
        .take_while(|t| PROCESSOR_PREFIXES.contains(*t))
        .count()
        .min(tokens.len().saturating_sub(1));
    tokens.drain(..leading);

    let key = tokens.join(" ");
    if key.is_empty() {
        return raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
    }
    key
}

/// Edit distance over characters
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn jaccard(a: &str, b: &str) -> f64 {
    let a: std::collections::BTreeSet<&str> = a.split_whitespace().collect();
    let b: std::collections::BTreeSet<&str> = b.split_whitespace().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Similarity of two cleaned descriptions in [0, 1]
///
/// The better of token-set overlap and normalized edit distance, so both
/// reordered tokens and small spelling drift score high.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let edit = 1.0 - levenshtein(a, b) as f64 / longest as f64;
    jaccard(a, b).max(edit)
}

/// Human-readable merchant name for a key
pub fn display_name(key: &str) -> String {
    key.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Outcome of resolving one description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantMatch {
    pub key: String,
    /// Keys that scored within the ambiguity margin of the best match
    pub ambiguous_with: Vec<String>,
    /// No known key was close enough; a new one was minted
    pub minted: bool,
}

impl MerchantMatch {
    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguous_with.is_empty()
    }
}

/// Known merchant keys per bank account, with how many charges each absorbed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerchantRegistry {
    keys: BTreeMap<String, BTreeMap<String, u64>>,
}

impl MerchantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a key with its usage count (used when loading persisted state)
    pub fn insert(&mut self, bank_account: &str, key: &str, count: u64) {
        self.keys
            .entry(bank_account.to_string())
            .or_default()
            .insert(key.to_string(), count);
    }

    pub fn count(&self, bank_account: &str, key: &str) -> u64 {
        self.keys
            .get(bank_account)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// All (bank account, key, count) entries in a stable order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.keys.iter().flat_map(|(bank, keys)| {
            keys.iter()
                .map(move |(key, count)| (bank.as_str(), key.as_str(), *count))
        })
    }

    pub fn len(&self) -> usize {
        self.keys.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the merchant key for a description without recording it
    pub fn lookup(
        &self,
        bank_account: &str,
        description: &str,
        config: &DetectionConfig,
    ) -> MerchantMatch {
        let cleaned = clean_description(description);
        let Some(known) = self.keys.get(bank_account) else {
            return MerchantMatch {
                key: cleaned,
                ambiguous_with: Vec::new(),
                minted: true,
            };
        };
        if known.contains_key(&cleaned) {
            return MerchantMatch {
                key: cleaned,
                ambiguous_with: Vec::new(),
                minted: false,
            };
        }

        let scored: Vec<(&String, u64, f64)> = known
            .iter()
            .map(|(key, count)| (key, *count, similarity(&cleaned, key)))
            .filter(|(_, _, score)| *score >= config.merchant_similarity_threshold)
            .collect();

        let best_score = scored.iter().map(|(_, _, s)| *s).fold(f64::MIN, f64::max);
        let Some((chosen, _, _)) = scored.iter().min_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.len().cmp(&b.0.len()))
                .then_with(|| a.0.cmp(b.0))
        }) else {
            return MerchantMatch {
                key: cleaned,
                ambiguous_with: Vec::new(),
                minted: true,
            };
        };

        let close: Vec<String> = scored
            .iter()
            .filter(|(_, _, s)| best_score - *s <= config.merchant_ambiguity_margin)
            .map(|(key, _, _)| (*key).clone())
            .collect();
        let ambiguous_with = if close.len() >= 2 { close } else { Vec::new() };

        MerchantMatch {
            key: (*chosen).clone(),
            ambiguous_with,
            minted: false,
        }
    }

    /// Resolve a description to a merchant key and record the usage
    ///
    /// Ambiguous matches are logged and resolved by the tie-break; they never
    /// fail.
    pub fn resolve(
        &mut self,
        bank_account: &str,
        description: &str,
        config: &DetectionConfig,
    ) -> MerchantMatch {
        let found = self.lookup(bank_account, description, config);

        if found.is_ambiguous() {
            warn!(
                "Ambiguous merchant '{}': candidates {} (using '{}')",
                description,
                found.ambiguous_with.join(", "),
                found.key
            );
        } else if found.minted {
            debug!("New merchant key '{}' from '{}'", found.key, description);
        }

        *self
            .keys
            .entry(bank_account.to_string())
            .or_default()
            .entry(found.key.clone())
            .or_insert(0) += 1;
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_description() {
        assert_eq!(clean_description("NETFLIX 1234"), "netflix");
        assert_eq!(clean_description("NETFLIX.COM*98765 CA"), "netflix");
        assert_eq!(clean_description("POS PURCHASE SPOTIFY USA"), "spotify");
        assert_eq!(clean_description("SQ *BLUE BOTTLE COFFEE"), "blue bottle coffee");
        assert_eq!(clean_description("UPI/Zomato Ltd/4521987"), "zomato");
        assert_eq!(clean_description("Amazon Prime Video"), "amazon prime video");
    }

    #[test]
    fn test_clean_description_keeps_lone_prefix() {
        assert_eq!(clean_description("PAYPAL"), "paypal");
        assert_eq!(clean_description("1234-5678"), "1234-5678");
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("netflix", "netflix"), 1.0);
        assert!(similarity("netflix", "netflx") >= 0.8);
        assert!(similarity("prime video amazon", "amazon prime video") >= 0.99);
        assert!(similarity("netflix", "spotify") < 0.5);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("netflix"), "Netflix");
        assert_eq!(display_name("blue bottle coffee"), "Blue Bottle Coffee");
    }

    #[test]
    fn test_registry_folds_variants_onto_known_key() {
        let config = DetectionConfig::default();
        let mut registry = MerchantRegistry::new();

        let first = registry.resolve("Primary Account", "NETFLIX 1234", &config);
        assert!(first.minted);
        let second = registry.resolve("Primary Account", "NETFLX.COM 5678", &config);
        assert_eq!(second.key, "netflix");
        assert!(!second.minted);
        assert_eq!(registry.count("Primary Account", "netflix"), 2);
    }

    #[test]
    fn test_registry_is_scoped_by_bank_account() {
        let config = DetectionConfig::default();
        let mut registry = MerchantRegistry::new();

        registry.resolve("Checking", "NETFLIX", &config);
        let other = registry.resolve("Card", "NETFLX", &config);
        assert!(other.minted);
        assert_eq!(other.key, "netflx");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ambiguous_match_uses_tie_break() {
        let config = DetectionConfig::default();
        let mut registry = MerchantRegistry::new();
        registry.insert("Checking", "spotify ab", 1);
        registry.insert("Checking", "spotify ac", 3);

        let found = registry.resolve("Checking", "SPOTIFY AD 1234", &config);
        assert!(found.is_ambiguous());
        assert_eq!(found.key, "spotify ac");
        assert_eq!(found.ambiguous_with.len(), 2);
    }

    #[test]
    fn test_distinct_merchants_stay_separate() {
        let config = DetectionConfig::default();
        let mut registry = MerchantRegistry::new();

        registry.resolve("Checking", "NETFLIX", &config);
        let spotify = registry.resolve("Checking", "SPOTIFY", &config);
        assert!(spotify.minted);
        assert_eq!(registry.len(), 2);
    }
}
