//! Deterministic quality gate over generated scripts.
//!
//! Scoring is a pure function of the script text, the channel tier, and the
//! configured weights, so the same input always produces the same evaluation.
//! The full evaluation is persisted on the job for audit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::QualityConfig;
use crate::database::models::QualityTier;
use crate::providers::Script;

/// Sub-score weights. They must sum to 1.0.
pub const WEIGHT_READABILITY: f64 = 0.35;
pub const WEIGHT_ENGAGEMENT: f64 = 0.30;
pub const WEIGHT_STRUCTURE: f64 = 0.25;
pub const WEIGHT_ACCURACY: f64 = 0.10;

/// Neutral accuracy sub-score until a fact-check capability exists.
const ACCURACY_PLACEHOLDER: f64 = 80.0;

/// Ceiling for the effective threshold after tier bonuses.
const MAX_EFFECTIVE_THRESHOLD: f64 = 95.0;

/// Terms that signal clickable, scroll-stopping copy. Substring match.
const POWER_WORDS: [&str; 12] = [
    "secret",
    "mistake",
    "wrong",
    "stop",
    "never",
    "instantly",
    "proven",
    "easy",
    "fast",
    "free",
    "avoid",
    "before",
];

/// Spelled-out small numbers count as concrete-number signals. Whole-word
/// match, so "stone" does not register as "one".
const NUMBER_WORDS: [&str; 10] = [
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
];

/// Gate outcome for one evaluated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Composite at or above the channel's effective threshold.
    AutoApprove,
    /// Composite in the improvement band; one regeneration attempt is
    /// warranted.
    AutoImprove,
    /// Composite below the floor, or a blacklist hit.
    Reject,
}

/// Raw sub-scores, each in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub readability: f64,
    pub engagement: f64,
    pub structure: f64,
    pub accuracy: f64,
}

/// Full gate output, persisted on the job as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvaluation {
    pub composite: f64,
    pub sub_scores: SubScores,
    pub decision: GateDecision,
    /// Threshold after the tier bonus was applied.
    pub effective_threshold: f64,
    /// Floor of the improvement band at evaluation time.
    pub floor: f64,
    pub blacklist_hits: Vec<String>,
    /// Weakest areas phrased as instructions for an improvement pass.
    pub feedback: Vec<String>,
}

impl QualityEvaluation {
    /// Human-readable reason for a `Reject` decision.
    pub fn reject_reason(&self) -> String {
        if self.blacklist_hits.is_empty() {
            format!(
                "composite score {:.1} below floor {:.1}",
                self.composite, self.floor
            )
        } else {
            format!("blacklisted terms: {}", self.blacklist_hits.join(", "))
        }
    }
}

/// Weighted scorer gating script advancement.
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Score a script against the channel tier and decide its fate.
    pub fn evaluate(&self, script: &Script, tier: QualityTier) -> QualityEvaluation {
        let text = script.full_text();
        let text_lower = text.to_lowercase();

        let sub_scores = SubScores {
            readability: round1(readability_score(&text)),
            engagement: round1(engagement_score(&text_lower)),
            structure: round1(self.structure_score(script)),
            accuracy: ACCURACY_PLACEHOLDER,
        };

        let composite = round1(
            sub_scores.readability * WEIGHT_READABILITY
                + sub_scores.engagement * WEIGHT_ENGAGEMENT
                + sub_scores.structure * WEIGHT_STRUCTURE
                + sub_scores.accuracy * WEIGHT_ACCURACY,
        );

        let blacklist_hits = self.blacklist_hits(&text_lower);
        let effective_threshold = self.effective_threshold(tier);

        let decision = if !blacklist_hits.is_empty() {
            GateDecision::Reject
        } else if composite >= effective_threshold {
            GateDecision::AutoApprove
        } else if composite >= self.config.improve_floor {
            GateDecision::AutoImprove
        } else {
            GateDecision::Reject
        };

        debug!(
            composite,
            %decision,
            readability = sub_scores.readability,
            engagement = sub_scores.engagement,
            structure = sub_scores.structure,
            "script evaluated"
        );

        QualityEvaluation {
            composite,
            sub_scores,
            decision,
            effective_threshold,
            floor: self.config.improve_floor,
            blacklist_hits,
            feedback: self.feedback(&sub_scores, script),
        }
    }

    /// Approval threshold for the tier, capped so premium channels are not
    /// asked for unreachable scores.
    pub fn effective_threshold(&self, tier: QualityTier) -> f64 {
        let base = self.config.min_quality_score;
        match tier {
            QualityTier::Standard => base,
            QualityTier::Premium => (base + self.config.premium_bonus).min(MAX_EFFECTIVE_THRESHOLD),
        }
    }

    /// Hook quality (40), call-to-action presence (30), spoken-length fit to
    /// the target duration (30).
    fn structure_score(&self, script: &Script) -> f64 {
        let mut score = 0.0;

        let hook_words = script.hook.split_whitespace().count();
        if hook_words > 0 {
            score += 25.0;
            if hook_words <= 15 {
                score += 15.0;
            }
        }

        if !script.call_to_action.trim().is_empty() {
            score += 30.0;
        }

        score += self.duration_fit_score(script);
        score
    }

    fn duration_fit_score(&self, script: &Script) -> f64 {
        let target = self.config.target_duration_secs as f64;
        if target <= 0.0 {
            return 0.0;
        }
        let ratio = script.estimated_duration_secs(self.config.words_per_second) / target;
        if (0.7..=1.3).contains(&ratio) {
            30.0
        } else if (0.4..=1.6).contains(&ratio) {
            15.0
        } else {
            0.0
        }
    }

    fn blacklist_hits(&self, text_lower: &str) -> Vec<String> {
        self.config
            .blacklist
            .iter()
            .filter(|term| {
                let term = term.trim().to_lowercase();
                !term.is_empty() && text_lower.contains(&term)
            })
            .cloned()
            .collect()
    }

    fn feedback(&self, sub_scores: &SubScores, script: &Script) -> Vec<String> {
        let mut feedback = Vec::new();
        if sub_scores.readability < 70.0 {
            feedback
                .push("improve readability: shorten sentences and prefer plain words".to_string());
        }
        if sub_scores.engagement < 70.0 {
            feedback.push(
                "raise engagement: open with a question and speak to the viewer directly"
                    .to_string(),
            );
        }
        let hook_words = script.hook.split_whitespace().count();
        if hook_words == 0 || hook_words > 15 {
            feedback.push("strengthen the hook: one short, scroll-stopping first line".to_string());
        }
        if script.call_to_action.trim().is_empty() {
            feedback.push("add a clear call to action at the end".to_string());
        }
        if self.duration_fit_score(script) < 30.0 {
            feedback.push(format!(
                "adjust length toward {} seconds of spoken content",
                self.config.target_duration_secs
            ));
        }
        feedback
    }
}

/// Flesch-style reading ease from average sentence length and an estimated
/// syllable count, clamped to `0..=100`.
fn readability_score(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    let sentence_count = text
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    if words.is_empty() || sentence_count == 0 {
        return 0.0;
    }

    let syllables: usize = words.iter().map(|w| estimate_syllables(w)).sum();
    let avg_sentence_len = words.len() as f64 / sentence_count as f64;
    let avg_syllables = syllables as f64 / words.len() as f64;

    (206.835 - 1.015 * avg_sentence_len - 84.6 * avg_syllables).clamp(0.0, 100.0)
}

/// Additive heuristics: direct address, a question, concrete numbers, power
/// words. Base 20, capped at 100.
fn engagement_score(text_lower: &str) -> f64 {
    let word_set: std::collections::HashSet<&str> = text_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut score = 20.0;
    if word_set.contains("you") || word_set.contains("your") || word_set.contains("yours") {
        score += 25.0;
    }
    if text_lower.contains('?') {
        score += 20.0;
    }
    let has_digit = text_lower.chars().any(|c| c.is_ascii_digit());
    if has_digit || NUMBER_WORDS.iter().any(|n| word_set.contains(n)) {
        score += 15.0;
    }
    let power_hits = POWER_WORDS
        .iter()
        .filter(|w| text_lower.contains(**w))
        .count()
        .min(2);
    score += power_hits as f64 * 10.0;

    score.min(100.0)
}

/// Vowel-group syllable estimate with a trailing silent-e correction.
fn estimate_syllables(word: &str) -> usize {
    let word: String = word
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_lowercase();
    if word.is_empty() {
        return 1;
    }

    let mut count = 0usize;
    let mut prev_vowel = false;
    for ch in word.chars() {
        let vowel = matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if word.ends_with('e') && !word.ends_with("le") && count > 1 {
        count -= 1;
    }
    count.max(1)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
