//! Consensus evaluation.
//!
//! Summarizes recent exchanges into an agreement/disagreement/confidence
//! snapshot with a recommendation, detects stalemates through a lexical
//! overlap heuristic, and produces the final wrap-up summary. Like every
//! other LLM-facing path in the engine, evaluation never fails upward: a
//! gateway problem yields a neutral snapshot and the discussion continues.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client_wrapper::{ChatMessage, ChatRole, GatewayClient, GatewayError};

/// Minimum similar pairs (exclusive) among the last six entries before the
/// discussion counts as circular.
const STALEMATE_PAIR_LIMIT: usize = 2;
const STALEMATE_SIMILARITY: f32 = 0.70;
const STALEMATE_WINDOW: usize = 6;
const ANALYSIS_WINDOW: usize = 10;

/// Typed view of one transcript entry as the evaluator sees it.
///
/// The orchestrator converts full discussion messages into these and filters
/// user messages out before calling.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role_name: String,
    pub body: String,
    pub turn: u32,
}

/// What the evaluator thinks the discussion should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Continue,
    Conclude,
    Escalate,
}

/// Result of a single consensus evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusSnapshot {
    pub reached: bool,
    /// LLM-judged confidence in [0, 1].
    pub confidence: f32,
    pub summary: String,
    pub agreements: Vec<String>,
    pub disagreements: Vec<String>,
    pub recommendation: Recommendation,
}

/// Shape of the structured analysis reply.
#[derive(Debug, Deserialize)]
struct AnalysisReply {
    confidence: f32,
    summary: String,
    #[serde(default)]
    agreements: Vec<String>,
    #[serde(default)]
    disagreements: Vec<String>,
}

/// Evaluates discussion transcripts for convergence.
pub struct ConsensusEvaluator {
    client: Arc<dyn GatewayClient>,
    meta_model_id: String,
    threshold: f32,
}

impl ConsensusEvaluator {
    pub fn new(client: Arc<dyn GatewayClient>, meta_model_id: impl Into<String>, threshold: f32) -> Self {
        Self {
            client,
            meta_model_id: meta_model_id.into(),
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Analyze recent entries and decide whether the panel has converged.
    pub async fn evaluate(
        &self,
        entries: &[TranscriptEntry],
        topic: &str,
        current_turn: u32,
        max_turns: u32,
    ) -> ConsensusSnapshot {
        log::info!(
            "concord::consensus: checking consensus at turn {}/{}",
            current_turn,
            max_turns
        );

        if entries.len() < 3 {
            return ConsensusSnapshot {
                reached: false,
                confidence: 0.0,
                summary: "Discussion just started, need more exchanges".to_string(),
                agreements: Vec::new(),
                disagreements: Vec::new(),
                recommendation: Recommendation::Continue,
            };
        }

        if detect_stalemate(entries) {
            log::warn!("concord::consensus: stalemate detected, recommending escalation");
            return ConsensusSnapshot {
                reached: false,
                confidence: 0.3,
                summary: "Discussion appears stuck in circular arguments".to_string(),
                agreements: Vec::new(),
                disagreements: vec!["Repeated arguments without progress".to_string()],
                recommendation: Recommendation::Escalate,
            };
        }

        let mut snapshot = match self.analyze(entries, topic).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("concord::consensus: analysis failed: {}", e);
                return ConsensusSnapshot {
                    reached: false,
                    confidence: 0.5,
                    summary: "Unable to analyze consensus reliably".to_string(),
                    agreements: Vec::new(),
                    disagreements: vec!["Analysis error".to_string()],
                    recommendation: Recommendation::Continue,
                };
            }
        };

        snapshot.recommendation = if snapshot.reached
            || current_turn >= max_turns
            || snapshot.disagreements.is_empty()
        {
            Recommendation::Conclude
        } else {
            Recommendation::Continue
        };

        log::info!(
            "concord::consensus: reached={} (confidence {:.2}) recommendation={:?}",
            snapshot.reached,
            snapshot.confidence,
            snapshot.recommendation
        );

        snapshot
    }

    async fn analyze(
        &self,
        entries: &[TranscriptEntry],
        topic: &str,
    ) -> Result<ConsensusSnapshot, GatewayError> {
        let window_start = entries.len().saturating_sub(ANALYSIS_WINDOW);
        let formatted = format_entries(&entries[window_start..]);

        let prompt = format!(
            "Analyze this multi-agent discussion and determine the consensus level.\n\n\
             **Topic**: {}\n\n\
             **Recent conversation**:\n{}\n\n\
             Evaluate:\n\
             1. Are participants converging on shared understanding?\n\
             2. What are the key points of agreement?\n\
             3. What disagreements (if any) remain?\n\
             4. Overall confidence level that consensus has been reached (0.0 to 1.0)\n\n\
             Return JSON with:\n\
             {{\n\
               \"confidence\": <float 0-1>,\n\
               \"summary\": \"<brief summary of current state>\",\n\
               \"agreements\": [\"point 1\", \"point 2\", ...],\n\
               \"disagreements\": [\"issue 1\", \"issue 2\", ...]\n\
             }}\n\n\
             Consider consensus reached if:\n\
             - Participants explicitly agree on core points\n\
             - No significant disagreements remain\n\
             - Discussion has converged (not diverged)",
            topic, formatted
        );

        let value = self
            .client
            .complete_json(
                &self.meta_model_id,
                &[ChatMessage::new(ChatRole::User, prompt)],
                0.2,
            )
            .await?;

        let reply: AnalysisReply = serde_json::from_value(value)
            .map_err(|e| GatewayError::Decode(format!("consensus analysis: {}", e)))?;

        let confidence = reply.confidence.clamp(0.0, 1.0);
        Ok(ConsensusSnapshot {
            reached: confidence >= self.threshold,
            confidence,
            summary: reply.summary,
            agreements: reply.agreements,
            disagreements: reply.disagreements,
            recommendation: Recommendation::Continue, // set by evaluate()
        })
    }

    /// Produce the compact prose wrap-up for a finished discussion.
    ///
    /// Always callable; on gateway failure the snapshot's own summary is
    /// reused as the wrap-up.
    pub async fn final_summary(
        &self,
        entries: &[TranscriptEntry],
        topic: &str,
        snapshot: &ConsensusSnapshot,
    ) -> String {
        let formatted = format_entries(entries);
        let disagreements = if snapshot.disagreements.is_empty() {
            "None".to_string()
        } else {
            snapshot
                .disagreements
                .iter()
                .map(|d| format!("- {}", d))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "Create a comprehensive summary of this multi-agent discussion.\n\n\
             **Topic**: {}\n\n\
             **Consensus Status**: {}\n\
             **Confidence**: {:.0}%\n\n\
             **Full conversation**:\n{}\n\n\
             **Key agreements**:\n{}\n\n\
             **Remaining disagreements**:\n{}\n\n\
             Provide:\n\
             1. Executive summary (2-3 sentences)\n\
             2. Main conclusions\n\
             3. Recommended next steps (if any)\n\n\
             Keep it concise and actionable.",
            topic,
            if snapshot.reached { "Reached" } else { "Not fully reached" },
            snapshot.confidence * 100.0,
            formatted,
            snapshot
                .agreements
                .iter()
                .map(|a| format!("- {}", a))
                .collect::<Vec<_>>()
                .join("\n"),
            disagreements,
        );

        match self
            .client
            .complete_text(
                &self.meta_model_id,
                &[ChatMessage::new(ChatRole::User, prompt)],
                0.3,
                None,
            )
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                log::error!("concord::consensus: summary generation failed: {}", e);
                snapshot.summary.clone()
            }
        }
    }
}

/// True when the last six entries read as circular arguments: more than two
/// unordered pairs with word-set Jaccard similarity above 0.70.
fn detect_stalemate(entries: &[TranscriptEntry]) -> bool {
    if entries.len() < STALEMATE_WINDOW {
        return false;
    }

    let recent = &entries[entries.len() - STALEMATE_WINDOW..];
    let word_sets: Vec<HashSet<String>> = recent.iter().map(|e| word_set(&e.body)).collect();

    let mut similar_pairs = 0;
    for i in 0..word_sets.len() {
        for j in (i + 1)..word_sets.len() {
            if jaccard_similarity(&word_sets[i], &word_sets[j]) > STALEMATE_SIMILARITY {
                similar_pairs += 1;
            }
        }
    }

    similar_pairs > STALEMATE_PAIR_LIMIT
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect()
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|` over word sets.
fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}

fn format_entries(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("**{}** (Turn {}):\n{}\n", e.role_name, e.turn, e.body))
        .collect::<Vec<_>>()
        .join("\n")
}
