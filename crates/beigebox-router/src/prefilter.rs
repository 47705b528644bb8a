//! Keyword agentic pre-filter — near-zero-cost scorer for tool-calling
//! intent.
//!
//! Scores a prompt on [0.0, 1.0] from additive pattern weights. This
//! stage never routes; the score is annotated to the wire log so the
//! downstream stages (and audits) can see the deterministic signal.

use std::sync::LazyLock;

use regex::Regex;

/// (pattern, weight, label). Weights are additive; the sum clamps to 1.0.
static PATTERNS: LazyLock<Vec<(Regex, f32, &'static str)>> = LazyLock::new(|| {
    let p = |pattern: &str| Regex::new(&format!("(?i){pattern}")).expect("static pattern");
    vec![
        // Tool-calling verbs
        (p(r"\b(search|look up|find|fetch|retrieve|get me)\b"), 0.25, "tool_verb"),
        (p(r"\b(browse|scrape|visit|open|navigate to)\b"), 0.25, "browse_verb"),
        (p(r"\b(calculate|compute|evaluate|solve)\b"), 0.20, "math_verb"),
        (p(r"\b(run|execute|call|invoke|trigger)\b"), 0.20, "exec_verb"),
        // Multi-step / planning language
        (p(r"\b(step by step|then|after that|finally|first .* then)\b"), 0.15, "multistep"),
        (p(r"\b(plan|outline|workflow|pipeline|sequence of)\b"), 0.15, "planning"),
        // Explicit tool references
        (p(r"\b(web search|wikipedia|google|news|weather|stock price)\b"), 0.30, "tool_ref"),
        (p(r"\b(current|latest|real-?time|today|right now|as of)\b"), 0.20, "recency"),
        // Delegation language
        (p(r"\b(for me|on my behalf|automatically|go ahead and)\b"), 0.20, "delegation"),
        (p(r"\b(save|store|write to|create a file|update)\b"), 0.15, "persistence"),
        // Question forms that almost always need a tool
        (
            p(r"\bwhat('s| is) (the (current|latest|price|weather|time|date))\b"),
            0.30,
            "factual_now",
        ),
        (p(r"\bhow (much|many|long|far|fast) (is|are|does|do)\b"), 0.10, "quantitative"),
    ]
});

/// Result of an agentic intent scoring pass.
#[derive(Debug, Clone)]
pub struct AgenticScore {
    /// 0.0 = pure generation, 1.0 = strongly agentic.
    pub score: f32,
    /// Labels of the patterns that fired.
    pub matched: Vec<&'static str>,
    pub is_agentic: bool,
}

/// Score a prompt for agentic / tool-calling intent against the raw
/// user message (before directive stripping).
pub fn score_agentic_intent(text: &str, threshold: f32) -> AgenticScore {
    let mut raw_score = 0.0;
    let mut matched = Vec::new();
    for (pattern, weight, label) in PATTERNS.iter() {
        if pattern.is_match(text) {
            raw_score += weight;
            matched.push(*label);
        }
    }
    let score = raw_score.min(1.0);
    AgenticScore { score, matched, is_agentic: score >= threshold }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_prompts_score_high() {
        let result = score_agentic_intent(
            "Search the web for the latest AI safety news and summarize the top 3 results",
            0.5,
        );
        assert!(result.is_agentic);
        assert!(result.matched.contains(&"tool_verb"));
        assert!(result.matched.contains(&"recency"));
    }

    #[test]
    fn generation_prompts_score_zero() {
        let result = score_agentic_intent("Explain attention mechanisms in transformers", 0.5);
        assert!(!result.is_agentic);
        assert_eq!(result.score, 0.0);
        assert!(result.matched.is_empty());
    }

    #[test]
    fn score_is_clamped_to_one() {
        let result = score_agentic_intent(
            "Search google news right now, then calculate and save the current stock price \
             for me automatically, step by step",
            0.5,
        );
        assert!(result.score <= 1.0);
        assert!(result.matched.len() >= 5);
    }

    #[test]
    fn factual_now_questions_cross_the_threshold() {
        let result = score_agentic_intent("What is the current price of Bitcoin?", 0.5);
        assert!(result.is_agentic);
    }
}
