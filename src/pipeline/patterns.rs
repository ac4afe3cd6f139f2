use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use unicode_normalization::UnicodeNormalization;

use crate::models::PatternType;

/// Matcher-engine faults. The lightweight filter treats these as
/// fail-open: a broken matcher must not silently block chat.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("failed to read rule file {path}: {source}")]
    RuleFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rule file: {0}")]
    RuleParse(#[from] serde_yaml::Error),
    #[error("invalid pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// On-disk rule file. Each set carries its own version string so rule
/// updates are traceable in matched-pattern ids.
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    banned_words: Vec<String>,
    #[serde(default)]
    toxic_patterns: Vec<String>,
    #[serde(default)]
    pii_patterns: Vec<NamedPattern>,
}

#[derive(Debug, Deserialize)]
struct NamedPattern {
    name: String,
    pattern: String,
}

fn default_version() -> String {
    "custom".to_string()
}

/// What a scan of one body found, across all rule sets.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub banned_word: bool,
    pub toxic: bool,
    pub pii: bool,
    pub matched: Vec<String>,
    pub categories: BTreeSet<String>,
}

impl ScanReport {
    /// The rule set that decides the filter outcome, hardest first.
    pub fn dominant_type(&self) -> PatternType {
        if self.banned_word {
            PatternType::BannedWord
        } else if self.toxic {
            PatternType::Toxic
        } else if self.pii {
            PatternType::Pii
        } else {
            PatternType::None
        }
    }

    #[allow(dead_code)]
    pub fn is_clean(&self) -> bool {
        self.matched.is_empty()
    }
}

// Built-in rule sets, used when no rule file is configured. Compiled
// once at first use.
static DEFAULT_BANNED_WORDS: &[&str] = &[
    "spam", "scam", "hack", "cheat", "idiot", "stupid", "moron", "loser", "noob",
];

static DEFAULT_TOXIC_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(kill\s+yourself|kys)\b",
        r"\b(go\s+die|die\s+in\s+a\s+fire)\b",
        r"\b(i\s+hate\s+you|you\s+suck)\b",
        r"\b(pathetic\s+loser|waste\s+of\s+(space|time))\b",
    ]
    .iter()
    .map(|p| compile_insensitive(p).expect("built-in toxic pattern"))
    .collect()
});

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());

static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b|\+\d{10,15}\b").unwrap()
});

static CARD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap());

static IPV4_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

static ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    compile_insensitive(r"\b\d{1,5}\s+\w+(\s\w+)?\s+(street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr)\b")
        .unwrap()
});

/// Compiled banned-word, toxic and PII rule sets. Immutable after
/// construction; hot reload swaps the whole set behind an `Arc`.
pub struct PatternSet {
    version: String,
    banned_words: Option<Regex>,
    toxic: Vec<Regex>,
    pii: Vec<(String, PiiCheck)>,
    custom_pii: Vec<(String, Regex)>,
}

type PiiCheck = fn(&str) -> bool;

fn check_email(body: &str) -> bool {
    EMAIL_REGEX.is_match(body)
}

fn check_phone(body: &str) -> bool {
    PHONE_REGEX.is_match(body)
}

fn check_card(body: &str) -> bool {
    CARD_REGEX.find_iter(body).any(|m| luhn_valid(m.as_str()))
}

fn check_ipv4(body: &str) -> bool {
    IPV4_REGEX.is_match(body)
}

fn check_address(body: &str) -> bool {
    ADDRESS_REGEX.is_match(body)
}

impl PatternSet {
    /// Built-in rule sets.
    pub fn builtin() -> Self {
        Self::assemble(
            "builtin-1".to_string(),
            DEFAULT_BANNED_WORDS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_TOXIC_PATTERNS.clone(),
            Vec::new(),
        )
    }

    /// Load rule sets from a YAML file, keeping the built-in PII
    /// detectors alongside any custom ones.
    pub fn from_file(path: &str) -> Result<Self, PatternError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PatternError::RuleFile {
            path: path.to_string(),
            source,
        })?;
        let file: RuleFile = serde_yaml::from_str(&raw)?;

        let toxic = file
            .toxic_patterns
            .iter()
            .map(|p| {
                compile_insensitive(p).map_err(|source| PatternError::BadPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let custom_pii = file
            .pii_patterns
            .iter()
            .map(|np| {
                compile_insensitive(&np.pattern)
                    .map(|re| (format!("pii:{}", np.name), re))
                    .map_err(|source| PatternError::BadPattern {
                        pattern: np.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut set = Self::assemble(file.version, file.banned_words, toxic, custom_pii);
        if set.banned_words.is_none() && set.toxic.is_empty() {
            // An empty file is almost certainly a deployment mistake;
            // keep the built-in hard lists.
            set.banned_words = Self::builtin().banned_words;
            set.toxic = DEFAULT_TOXIC_PATTERNS.clone();
        }
        Ok(set)
    }

    fn assemble(
        version: String,
        banned_words: Vec<String>,
        toxic: Vec<Regex>,
        custom_pii: Vec<(String, Regex)>,
    ) -> Self {
        let banned_words = if banned_words.is_empty() {
            None
        } else {
            let alternation = banned_words
                .iter()
                .map(|w| regex::escape(&normalize(w)))
                .collect::<Vec<_>>()
                .join("|");
            compile_insensitive(&format!(r"\b({alternation})\b")).ok()
        };

        let pii: Vec<(String, PiiCheck)> = vec![
            ("pii:email".to_string(), check_email as PiiCheck),
            ("pii:phone".to_string(), check_phone),
            ("pii:credit_card".to_string(), check_card),
            ("pii:ip_address".to_string(), check_ipv4),
            ("pii:address".to_string(), check_address),
        ];

        Self {
            version,
            banned_words,
            toxic,
            pii,
            custom_pii,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Scan a body against all three rule sets, collecting every
    /// matched category. Input is NFKC-normalised first so glyph
    /// variants cannot dodge the word lists.
    pub fn scan(&self, body: &str) -> Result<ScanReport, PatternError> {
        let normalized = normalize(body);
        let mut report = ScanReport::default();

        if let Some(banned) = &self.banned_words {
            for m in banned.find_iter(&normalized) {
                report.banned_word = true;
                report
                    .matched
                    .push(format!("banned:{}:{}", self.version, m.as_str().to_lowercase()));
            }
            if report.banned_word {
                report.categories.insert("banned_word".to_string());
            }
        }

        for (idx, re) in self.toxic.iter().enumerate() {
            if re.is_match(&normalized) {
                report.toxic = true;
                report.matched.push(format!("toxic:{}:{idx}", self.version));
            }
        }
        if report.toxic {
            report.categories.insert("toxic_pattern".to_string());
        }

        for (id, check) in &self.pii {
            if check(&normalized) {
                report.pii = true;
                report.matched.push(id.clone());
                report.categories.insert(id.clone());
            }
        }
        for (id, re) in &self.custom_pii {
            if re.is_match(&normalized) {
                report.pii = true;
                report.matched.push(id.clone());
                report.categories.insert(id.clone());
            }
        }

        Ok(report)
    }
}

fn normalize(body: &str) -> String {
    body.nfkc().collect()
}

fn compile_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Luhn checksum over the digits of a candidate card number; filters
/// out phone-number shaped digit runs matched by the card regex.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_word_requires_word_boundary() {
        let set = PatternSet::builtin();
        let report = set.scan("you are a total idiot").unwrap();
        assert!(report.banned_word);
        assert_eq!(report.dominant_type(), PatternType::BannedWord);

        // "idiotic" is not a listed word.
        let report = set.scan("that idea is idiotic-adjacent wording").unwrap();
        assert!(!report.banned_word);
    }

    #[test]
    fn banned_word_is_case_insensitive() {
        let set = PatternSet::builtin();
        assert!(set.scan("what a LOSER").unwrap().banned_word);
    }

    #[test]
    fn nfkc_normalization_defeats_fullwidth_evasion() {
        let set = PatternSet::builtin();
        // Fullwidth "ｓｐａｍ" normalises to "spam".
        let report = set.scan("buy ｓｐａｍ now").unwrap();
        assert!(report.banned_word);
    }

    #[test]
    fn toxic_patterns_match_phrases() {
        let set = PatternSet::builtin();
        let report = set.scan("just go die in a fire").unwrap();
        assert!(report.toxic);
    }

    #[test]
    fn email_and_phone_are_pii() {
        let set = PatternSet::builtin();
        let report = set.scan("reach me at jane@example.com or 555-123-4567").unwrap();
        assert!(report.pii);
        assert!(report.matched.iter().any(|m| m == "pii:email"));
        assert!(report.matched.iter().any(|m| m == "pii:phone"));
    }

    #[test]
    fn card_numbers_require_luhn() {
        let set = PatternSet::builtin();
        // 4532015112830366 passes Luhn.
        let report = set.scan("card 4532-0151-1283-0366 ok").unwrap();
        assert!(report.matched.iter().any(|m| m == "pii:credit_card"));
        // 1234... does not.
        let report = set.scan("code 1234-5678-9012-3456 here").unwrap();
        assert!(!report.matched.iter().any(|m| m == "pii:credit_card"));
    }

    #[test]
    fn street_address_heuristic() {
        let set = PatternSet::builtin();
        let report = set.scan("I live at 123 Main Street, come over").unwrap();
        assert!(report.matched.iter().any(|m| m == "pii:address"));
    }

    #[test]
    fn clean_text_matches_nothing() {
        let set = PatternSet::builtin();
        let report = set.scan("Hello everyone, how are you?").unwrap();
        assert!(report.is_clean());
        assert_eq!(report.dominant_type(), PatternType::None);
    }

    #[test]
    fn scan_is_deterministic() {
        let set = PatternSet::builtin();
        let a = set.scan("you stupid loser, email me at a@b.co").unwrap();
        let b = set.scan("you stupid loser, email me at a@b.co").unwrap();
        assert_eq!(a.matched, b.matched);
        assert_eq!(a.categories, b.categories);
    }
}
