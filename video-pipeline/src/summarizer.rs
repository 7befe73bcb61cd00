use crate::types::{PipelineError, Result};
use crate::utils::text::{split_sentences, truncate_chars, truncate_on_word};
use async_trait::async_trait;
use interfaces::{CapabilityError, CapabilityResult, KeyMoment, KeyMomentExtractor, Summarizer, Transcript};
use regex::RegexSet;
use tracing::debug;

/// Phrases that tend to mark the important parts of a talk.
const IMPORTANT_PATTERNS: &[&str] = &[
    r"\bimportant\b",
    r"\bkey\b",
    r"\bmain\b",
    r"\bcrucial\b",
    r"\bessential\b",
    r"\bkey takeaway\b",
    r"\bsummary\b",
    r"\bconclusion\b",
    r"\bfinally\b",
    r"\bin conclusion\b",
    r"\bto sum up\b",
    r"\bthe best\b",
    r"\bworst\b",
    r"\btop \d+\b",
    r"\bnumber \d+\b",
    r"\bfirst\b.*\bsecond\b",
    r"\bone\b.*\btwo\b.*\bthree\b",
    r"\bstep \d+\b",
    r"\bhow to\b",
    r"\bway to\b",
    r"\btutorial\b",
    r"\bguide\b",
    r"\btips?\b",
    r"\btrick\b",
    r"\bhack\b",
];

/// Extractive summary: leading sentences plus a sample from the middle and end.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self
    }

    pub fn summarize_text(text: &str, max_length: usize) -> String {
        let sentences = split_sentences(text);

        if sentences.len() <= 3 {
            return truncate_chars(text, max_length).to_string();
        }

        let mut parts: Vec<&str> = sentences[..2].to_vec();
        if sentences.len() > 4 {
            parts.push(sentences[sentences.len() / 2]);
        }
        if sentences.len() > 6 {
            parts.push(sentences[sentences.len() - 2]);
        }

        truncate_on_word(&parts.join(". "), max_length)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, text: &str, max_length: usize) -> CapabilityResult<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CapabilityError::InvalidInput("nothing to summarize".to_string()));
        }

        let summary = Self::summarize_text(text, max_length);
        debug!("Summarized {} chars into {}", text.len(), summary.len());
        Ok(summary)
    }
}

/// Scores caption segments against `IMPORTANT_PATTERNS` and position.
pub struct KeywordMomentExtractor {
    patterns: RegexSet,
    min_gap_seconds: f64,
}

impl KeywordMomentExtractor {
    pub fn new() -> Result<Self> {
        let patterns = RegexSet::new(IMPORTANT_PATTERNS.iter().map(|p| format!("(?i){}", p)))
            .map_err(|e| PipelineError::Config(format!("invalid key moment pattern: {}", e)))?;

        Ok(Self {
            patterns,
            min_gap_seconds: 30.0,
        })
    }

    pub fn with_min_gap(mut self, seconds: f64) -> Self {
        self.min_gap_seconds = seconds;
        self
    }

    fn score(&self, index: usize, total: usize, text: &str) -> f64 {
        let mut score = self.patterns.matches(text).iter().count() as f64;

        if index < 3 {
            score += 2.0;
        } else if index + 4 > total {
            score += 1.0;
        }

        if text.chars().count() > 50 {
            score += 0.5;
        }
        score
    }

    pub fn find_key_moments(&self, transcript: &Transcript, count: usize) -> Vec<KeyMoment> {
        let total = transcript.segments.len();

        let mut scored: Vec<(f64, &interfaces::TranscriptSegment)> = transcript
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| (self.score(index, total, &segment.text), segment))
            .filter(|(score, _)| *score >= 1.0)
            .collect();

        // Stable: equal scores keep transcript order.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut picked: Vec<KeyMoment> = Vec::new();
        for (_, segment) in scored {
            if picked.len() >= count {
                break;
            }
            let far_enough = picked
                .iter()
                .all(|moment| (segment.start - moment.offset).abs() >= self.min_gap_seconds);
            if far_enough {
                picked.push(KeyMoment {
                    offset: segment.start,
                    label: segment.text.trim().to_string(),
                });
            }
        }

        picked.sort_by(|a, b| a.offset.partial_cmp(&b.offset).unwrap_or(std::cmp::Ordering::Equal));
        picked
    }
}

#[async_trait]
impl KeyMomentExtractor for KeywordMomentExtractor {
    async fn extract_key_moments(&self, transcript: &Transcript, count: usize) -> CapabilityResult<Vec<KeyMoment>> {
        let moments = self.find_key_moments(transcript, count);
        debug!("Picked {} key moments from {} segments", moments.len(), transcript.segments.len());
        Ok(moments)
    }
}
