//! Quality scoring for stage candidates.
//!
//! Every evaluator reports four sub-scores on a 0-10 scale and an `overall`
//! that is always recomputed from [`ScoringWeights`], never taken on trust.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{Attribution, ChatModel, ChatProvider, ChatRequest, Message, ProviderError};
use crate::pipeline::Stage;
use crate::retry::Retryable;

pub const MAX_SCORE: f64 = 10.0;

// =============================================================================
// Weights and reports
// =============================================================================

fn default_technical() -> f64 {
    0.3
}
fn default_literary() -> f64 {
    0.4
}
fn default_emotional() -> f64 {
    0.2
}
fn default_market() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_technical")]
    pub technical: f64,
    #[serde(default = "default_literary")]
    pub literary: f64,
    #[serde(default = "default_emotional")]
    pub emotional: f64,
    #[serde(default = "default_market")]
    pub market: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            technical: default_technical(),
            literary: default_literary(),
            emotional: default_emotional(),
            market: default_market(),
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        let all = [self.technical, self.literary, self.emotional, self.market];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EvaluationError::InvalidWeights(
                "weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(EvaluationError::InvalidWeights(format!(
                "weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }

    pub fn combine(&self, technical: f64, literary: f64, emotional: f64, market: f64) -> f64 {
        technical * self.technical
            + literary * self.literary
            + emotional * self.emotional
            + market * self.market
    }

    /// Build a report from sub-scores, clamping each to 0-10.
    pub fn report(&self, technical: f64, literary: f64, emotional: f64, market: f64) -> QualityReport {
        let technical = clamp_score(technical);
        let literary = clamp_score(literary);
        let emotional = clamp_score(emotional);
        let market = clamp_score(market);
        QualityReport {
            technical,
            literary,
            emotional,
            market,
            overall: self.combine(technical, literary, emotional, market),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub technical: f64,
    pub literary: f64,
    pub emotional: f64,
    pub market: f64,
    pub overall: f64,
}

impl QualityReport {
    /// `overall` rounded to two decimals, for display and run metrics only.
    /// Quality gates compare the unrounded `overall`.
    pub fn score(&self) -> f64 {
        round2(self.overall)
    }

    /// Dimensions below `threshold`, each with a remediation hint.
    pub fn deficiencies(&self, threshold: f64) -> Vec<String> {
        let dims = [
            (
                "technical",
                self.technical,
                "tighten grammar, punctuation and internal consistency",
            ),
            (
                "literary",
                self.literary,
                "strengthen structure, characterisation and pacing, and vary sentence rhythm",
            ),
            (
                "emotional",
                self.emotional,
                "deepen emotional stakes with concrete sensory detail and natural dialogue",
            ),
            (
                "market",
                self.market,
                "sharpen the hook and fit the length and register to the intended readers",
            ),
        ];
        dims.iter()
            .filter(|(_, score, _)| *score < threshold)
            .map(|(name, score, hint)| format!("{name} scored {score:.1}/10: {hint}"))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("invalid scoring weights: {0}")]
    InvalidWeights(String),
    #[error("judge call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("could not parse judge verdict: {0}")]
    Parse(String),
}

impl Retryable for EvaluationError {
    fn is_retryable(&self) -> bool {
        match self {
            EvaluationError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Scores one candidate. Implementations must be deterministic for identical
/// `(stage, output)` under fixed weights, and must not look at run state.
#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    async fn evaluate(&self, stage: Stage, output: &str) -> Result<QualityReport, EvaluationError>;
}

// =============================================================================
// Heuristic evaluator
// =============================================================================

const EMOTIVE_WORDS: &[&str] = &[
    "afraid", "alone", "anger", "angry", "ache", "ached", "aching", "anguish", "bitter",
    "breath", "courage", "cried", "cry", "dark", "despair", "desperate", "dread", "fear",
    "fierce", "fury", "grief", "grieve", "heart", "hope", "hoped", "joy", "laugh", "laughed",
    "lonely", "longing", "loss", "love", "loved", "memory", "mourn", "pain", "panic", "quiet",
    "rage", "regret", "sorrow", "tears", "tender", "tremble", "trembled", "warm", "whisper",
    "whispered", "wonder", "yearning",
];

/// Deterministic text statistics mapped onto the four dimensions.
#[derive(Debug, Clone, Default)]
pub struct HeuristicEvaluator {
    weights: ScoringWeights,
}

impl HeuristicEvaluator {
    pub fn new(weights: ScoringWeights) -> Result<Self, EvaluationError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn score(&self, stage: Stage, output: &str) -> QualityReport {
        let stats = TextStats::from_text(output);
        if stats.words == 0 {
            return self.weights.report(0.0, 0.0, 0.0, 0.0);
        }
        let technical = technical_score(&stats);
        let literary = literary_score(&stats);
        let emotional = emotional_score(&stats);
        let market = market_score(stage, &stats);
        self.weights.report(technical, literary, emotional, market)
    }
}

#[async_trait]
impl QualityEvaluator for HeuristicEvaluator {
    async fn evaluate(&self, stage: Stage, output: &str) -> Result<QualityReport, EvaluationError> {
        Ok(self.score(stage, output))
    }
}

struct TextStats {
    words: usize,
    unique_words: usize,
    sentence_lengths: Vec<usize>,
    capitalised_sentences: usize,
    paragraphs: usize,
    structured_lines: usize,
    dialogue_marks: usize,
    emotive_hits: usize,
    avg_word_len: f64,
    unterminated_tail: bool,
    doubled_spaces: usize,
}

impl TextStats {
    fn from_text(text: &str) -> Self {
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();
        let words = tokens.len();
        let unique_words = tokens.iter().collect::<HashSet<_>>().len();
        let letters: usize = tokens.iter().map(|w| w.chars().count()).sum();
        let emotive: HashSet<&str> = EMOTIVE_WORDS.iter().copied().collect();
        let emotive_hits = tokens.iter().filter(|w| emotive.contains(w.as_str())).count();

        let mut sentence_lengths = Vec::new();
        let mut capitalised_sentences = 0;
        for sentence in text.split(['.', '!', '?']) {
            let n = sentence.split_whitespace().count();
            if n == 0 {
                continue;
            }
            sentence_lengths.push(n);
            let first = sentence
                .trim_start()
                .trim_start_matches(|c: char| !c.is_alphanumeric());
            if first
                .chars()
                .next()
                .map(|c| c.is_uppercase() || c.is_numeric())
                .unwrap_or(false)
            {
                capitalised_sentences += 1;
            }
        }

        let paragraphs = text
            .split("\n\n")
            .filter(|p| !p.trim().is_empty())
            .count();
        let structured_lines = text
            .lines()
            .map(str::trim_start)
            .filter(|l| {
                l.starts_with('#')
                    || l.starts_with("- ")
                    || l.starts_with("* ")
                    || l.to_lowercase().starts_with("chapter")
                    || l.to_lowercase().starts_with("act ")
                    || l.split_once(['.', ')'])
                        .map(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                        .unwrap_or(false)
            })
            .count();
        let dialogue_marks = text
            .chars()
            .filter(|c| matches!(c, '"' | '\u{201c}' | '\u{201d}'))
            .count();
        let unterminated_tail = !text
            .trim_end()
            .ends_with(['.', '!', '?', '"', '\u{201d}', ')', '*']);

        Self {
            words,
            unique_words,
            sentence_lengths,
            capitalised_sentences,
            paragraphs,
            structured_lines,
            dialogue_marks,
            emotive_hits,
            avg_word_len: if words == 0 {
                0.0
            } else {
                letters as f64 / words as f64
            },
            unterminated_tail,
            doubled_spaces: text.matches("  ").count(),
        }
    }

    fn sentences(&self) -> usize {
        self.sentence_lengths.len().max(1)
    }

    fn mean_sentence_len(&self) -> f64 {
        self.sentence_lengths.iter().sum::<usize>() as f64 / self.sentences() as f64
    }

    /// Coefficient of variation of sentence length.
    fn sentence_variation(&self) -> f64 {
        let mean = self.mean_sentence_len();
        if mean == 0.0 || self.sentence_lengths.len() < 2 {
            return 0.0;
        }
        let var = self
            .sentence_lengths
            .iter()
            .map(|&n| (n as f64 - mean).powi(2))
            .sum::<f64>()
            / self.sentence_lengths.len() as f64;
        var.sqrt() / mean
    }
}

/// 1.0 inside `[lo, hi]`, falling linearly to 0 at `lo - slack` / `hi + slack`.
fn band(value: f64, lo: f64, hi: f64, slack: f64) -> f64 {
    if value < lo {
        (1.0 - (lo - value) / slack).max(0.0)
    } else if value > hi {
        (1.0 - (value - hi) / slack).max(0.0)
    } else {
        1.0
    }
}

fn technical_score(s: &TextStats) -> f64 {
    let capitalisation = s.capitalised_sentences as f64 / s.sentences() as f64;
    let sentence_len = band(s.mean_sentence_len(), 8.0, 24.0, 16.0);
    let tail = if s.unterminated_tail { 0.0 } else { 1.0 };
    let spacing = 1.0 / (1.0 + s.doubled_spaces as f64 / 10.0);
    10.0 * (0.35 * capitalisation + 0.35 * sentence_len + 0.15 * tail + 0.15 * spacing)
}

fn literary_score(s: &TextStats) -> f64 {
    let diversity = (s.unique_words as f64 / s.words as f64 / 0.55).min(1.0);
    let rhythm = band(s.sentence_variation(), 0.3, 0.9, 0.3);
    let structure = (s.paragraphs.max(s.structured_lines) as f64 / 4.0).min(1.0);
    10.0 * (0.4 * diversity + 0.3 * rhythm + 0.3 * structure)
}

fn emotional_score(s: &TextStats) -> f64 {
    let per_hundred = s.emotive_hits as f64 * 100.0 / s.words as f64;
    let emotive = (per_hundred / 1.5).min(1.0);
    let dialogue = (s.dialogue_marks as f64 / 4.0).min(1.0);
    10.0 * (0.6 * emotive + 0.4 * dialogue)
}

fn market_score(stage: Stage, s: &TextStats) -> f64 {
    let min_words = match stage {
        Stage::Outliner => 150.0,
        Stage::Writer | Stage::Editor | Stage::Critic => 400.0,
    };
    let length = (s.words as f64 / min_words).min(1.0);
    let readability = band(s.avg_word_len, 3.8, 5.8, 2.0);
    let shape = match stage {
        Stage::Outliner => (s.structured_lines as f64 / 5.0).min(1.0),
        _ => (s.paragraphs as f64 / 3.0).min(1.0),
    };
    10.0 * (0.5 * length + 0.3 * readability + 0.2 * shape)
}

// =============================================================================
// Model-backed evaluator
// =============================================================================

const JUDGE_SYSTEM: &str = "You are a comprehensive literary critic. Score the text you are given \
on four dimensions, each from 0 to 10: technical (grammar, structure, consistency), literary \
(plot, characters, pacing), emotional (reader engagement and impact) and market (commercial \
potential and audience fit). Reply with a JSON object only: \
{\"technical\": n, \"literary\": n, \"emotional\": n, \"market\": n}.";

/// Asks a judge model for the four sub-scores.
pub struct LlmEvaluator {
    provider: Arc<dyn ChatProvider>,
    model: ChatModel,
    temperature: f32,
    weights: ScoringWeights,
}

impl LlmEvaluator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: ChatModel,
        weights: ScoringWeights,
    ) -> Result<Self, EvaluationError> {
        weights.validate()?;
        Ok(Self {
            provider,
            model,
            temperature: 0.0,
            weights,
        })
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    technical: f64,
    literary: f64,
    emotional: f64,
    market: f64,
}

#[async_trait]
impl QualityEvaluator for LlmEvaluator {
    async fn evaluate(&self, stage: Stage, output: &str) -> Result<QualityReport, EvaluationError> {
        let user = format!(
            "<stage>{}</stage>\n<text>\n{}\n</text>",
            stage.as_str(),
            crate::prompts::escape_xml_chars(output)
        );
        let req = ChatRequest::new(
            self.model.clone(),
            vec![Message::system(JUDGE_SYSTEM), Message::user(user)],
            Attribution::new("evaluator::judge").with_stage(stage.as_str()),
        )
        .temperature(self.temperature)
        .max_tokens(200)
        .json();

        let resp = self.provider.chat(&req).await?;
        let verdict = parse_verdict(&resp.content)?;
        Ok(self.weights.report(
            verdict.technical,
            verdict.literary,
            verdict.emotional,
            verdict.market,
        ))
    }
}

fn parse_verdict(raw: &str) -> Result<JudgeVerdict, EvaluationError> {
    let json = extract_json(raw);
    let verdict: JudgeVerdict =
        serde_json::from_str(json).map_err(|e| EvaluationError::Parse(e.to_string()))?;
    let all = [
        verdict.technical,
        verdict.literary,
        verdict.emotional,
        verdict.market,
    ];
    if all.iter().any(|v| !v.is_finite()) {
        return Err(EvaluationError::Parse("non-finite score".into()));
    }
    Ok(verdict)
}

/// First balanced `{...}` object in `raw`, or the trimmed input.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        for (i, c) in remainder.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }
    trimmed
}

fn clamp_score(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, MAX_SCORE)
    } else {
        0.0
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
