use serde::{Deserialize, Serialize};

use super::{Tool, ToolError};
use crate::llm::Completion;
use crate::normalize::{list_items, parse_number, MissingField, Normalized, Sections};
use crate::prompt::{require, PromptPayload, SamplingOptions, ValidationError};

const SCORE: &str = "Originality Score";
const MATCHES: &str = "Matches";
const SUMMARY: &str = "Summary";
const SUGGESTIONS: &str = "Suggestions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Low,
    #[default]
    Medium,
    High,
}

impl Strictness {
    fn instruction(&self) -> &'static str {
        match self {
            Strictness::Low => "Only flag passages that are copied nearly word for word.",
            Strictness::Medium => {
                "Flag copied passages and closely reworded sentences that keep the original structure."
            }
            Strictness::High => {
                "Flag any passage whose wording, structure or ideas closely follow a known source."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlagiarismOptions {
    pub strictness: Strictness,
    pub check_quotes: bool,
    pub check_paraphrasing: bool,
    pub include_source_links: bool,
}

impl Default for PlagiarismOptions {
    fn default() -> Self {
        Self {
            strictness: Strictness::Medium,
            check_quotes: true,
            check_paraphrasing: true,
            include_source_links: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlagiarismRequest {
    pub text: String,
    #[serde(default)]
    pub options: PlagiarismOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlagiarismMatch {
    pub text: String,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlagiarismCheckResult {
    pub originality_score: f64,
    pub matches: Vec<PlagiarismMatch>,
    pub summary: String,
    pub suggestions: Vec<String>,
}

impl Default for PlagiarismCheckResult {
    fn default() -> Self {
        Self {
            originality_score: 1.0,
            matches: Vec::new(),
            summary: String::new(),
            suggestions: Vec::new(),
        }
    }
}

#[cfg(test)]
impl PlagiarismCheckResult {
    /// Render in the layout the detector asks the model to answer in.
    pub fn to_completion_text(&self) -> String {
        let mut text = format!("{}: {}\n{}:\n", SCORE, self.originality_score, MATCHES);
        for m in &self.matches {
            text.push_str(&format!("* {} - {}", m.text, m.similarity));
            if let Some(source) = &m.source {
                text.push_str(&format!(" - {}", source));
            }
            text.push('\n');
        }
        text.push_str(&format!("{}: {}\n{}:\n", SUMMARY, self.summary, SUGGESTIONS));
        for s in &self.suggestions {
            text.push_str(&format!("* {}\n", s));
        }
        text
    }
}

/// Checks student writing for unoriginal passages.
pub struct PlagiarismDetector;

impl PlagiarismDetector {
    fn system_prompt() -> &'static str {
        r#"You are an academic integrity assistant that reviews student writing for plagiarism.

Estimate how original the text is and identify passages that are likely copied or closely paraphrased from existing sources.

Always answer using exactly this layout:
Originality Score: <number between 0 and 1, where 1 means fully original>
Matches:
* <suspicious passage> - <similarity between 0 and 1>
Summary: <one or two sentences>
Suggestions:
* <concrete suggestion>

If nothing is suspicious, leave the Matches list empty."#
    }

    fn user_prompt(text: &str, options: &PlagiarismOptions) -> String {
        let mut prompt = format!("Strictness: {}\n", options.strictness.instruction());

        if options.check_quotes {
            prompt.push_str("- Check whether quoted material is properly attributed.\n");
        } else {
            prompt.push_str("- Ignore passages inside quotation marks.\n");
        }
        if options.check_paraphrasing {
            prompt.push_str("- Detect paraphrased content, not only verbatim copies.\n");
        }
        if options.include_source_links {
            prompt.push_str(
                "- When you know the likely source, append it to the match line: * <passage> - <similarity> - <source URL>\n",
            );
        }

        prompt.push_str(&format!("\nText to check:\n---\n{}\n---", text));
        prompt
    }

    pub fn parse(raw: &str) -> Normalized<PlagiarismCheckResult> {
        let sections = Sections::extract(raw, &[SCORE, MATCHES, SUMMARY, SUGGESTIONS]);
        let mut result = PlagiarismCheckResult::default();
        let mut missing = Vec::new();

        match sections.get(SCORE).and_then(parse_number) {
            Some(score) => result.originality_score = unit_score(score),
            None => missing.push(MissingField("originalityScore")),
        }

        match sections.get(MATCHES) {
            Some(body) => {
                result.matches = list_items(body).iter().filter_map(|l| parse_match(l)).collect()
            }
            None => missing.push(MissingField("matches")),
        }

        match sections.text(SUMMARY) {
            Some(summary) => result.summary = summary,
            None => missing.push(MissingField("summary")),
        }

        match sections.list(SUGGESTIONS) {
            Some(suggestions) => result.suggestions = suggestions,
            None => missing.push(MissingField("suggestions")),
        }

        Normalized::from_parts(result, missing)
    }
}

/// Scores above 1 are read as percentages; the result is clamped to `0..=1`.
fn unit_score(value: f64) -> f64 {
    let value = if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    };
    value.clamp(0.0, 1.0)
}

/// `<passage> - <similarity>[ - <source>]`
fn parse_match(line: &str) -> Option<PlagiarismMatch> {
    let mut parts: Vec<&str> = line.split(" - ").map(str::trim).collect();

    let source = match parts.last() {
        Some(last) if parts.len() > 1 && (last.starts_with("http://") || last.starts_with("https://")) => {
            let source = last.to_string();
            parts.pop();
            Some(source)
        }
        _ => None,
    };

    let similarity = if parts.len() > 1 {
        parts.last().and_then(|last| parse_number(last))
    } else {
        None
    };
    if similarity.is_some() {
        parts.pop();
    }

    let text = parts.join(" - ").trim_matches('"').trim().to_string();
    if text.is_empty() {
        return None;
    }

    Some(PlagiarismMatch {
        text,
        similarity: similarity.map(unit_score).unwrap_or(0.0),
        source,
    })
}

impl Tool for PlagiarismDetector {
    type Request = PlagiarismRequest;
    type Output = PlagiarismCheckResult;

    fn name(&self) -> &'static str {
        "plagiarism_detector"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::text(0.1, 1500)
    }

    fn build_prompt(&self, request: &PlagiarismRequest) -> Result<PromptPayload, ValidationError> {
        let text = require("text", &request.text)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(text, &request.options),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<PlagiarismCheckResult> {
        Self::parse(raw)
    }
}

/// Run a plagiarism check on `text`.
pub async fn check_plagiarism(
    client: &dyn Completion,
    text: &str,
    options: PlagiarismOptions,
) -> Result<Normalized<PlagiarismCheckResult>, ToolError> {
    let normalized = PlagiarismDetector
        .run(
            client,
            PlagiarismRequest {
                text: text.to_string(),
                options,
            },
        )
        .await?;

    let result = normalized.result();
    log::info!(
        "plagiarism_detector: originality {:.2}, {} matches",
        result.originality_score,
        result.matches.len()
    );
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::FixedCompletion;

    fn all_checks() -> PlagiarismOptions {
        PlagiarismOptions {
            strictness: Strictness::Medium,
            check_quotes: true,
            check_paraphrasing: true,
            include_source_links: true,
        }
    }

    #[tokio::test]
    async fn test_check_plagiarism_scenario() {
        let client = FixedCompletion::new(
            "Originality Score: 0.8\nMatches:\n* sample - 0.3\nSummary: looks mostly original\nSuggestions:\n* cite source X",
        );
        let normalized = check_plagiarism(&client, "Lorem ipsum...", all_checks())
            .await
            .unwrap();

        assert!(!normalized.is_degraded());
        assert_eq!(
            normalized.into_result(),
            PlagiarismCheckResult {
                originality_score: 0.8,
                matches: vec![PlagiarismMatch {
                    text: "sample".to_string(),
                    similarity: 0.3,
                    source: None,
                }],
                summary: "looks mostly original".to_string(),
                suggestions: vec!["cite source X".to_string()],
            }
        );
    }

    #[test]
    fn test_options_default_to_medium() {
        let req: PlagiarismRequest = serde_json::from_str(r#"{"text": "essay"}"#).unwrap();
        assert_eq!(req.options, PlagiarismOptions::default());
        assert_eq!(req.options.strictness, Strictness::Medium);

        let req: PlagiarismRequest =
            serde_json::from_str(r#"{"text": "essay", "options": {"includeSourceLinks": true}}"#).unwrap();
        assert_eq!(req.options.strictness, Strictness::Medium);
        assert!(req.options.include_source_links);
    }

    #[test]
    fn test_build_prompt_reflects_options() {
        let req = PlagiarismRequest {
            text: "An essay.".to_string(),
            options: all_checks(),
        };
        let payload = PlagiarismDetector.build_prompt(&req).unwrap();
        assert!(payload.user.contains("source URL"));
        assert!(payload.user.contains("paraphrased"));
        assert_eq!(payload, PlagiarismDetector.build_prompt(&req).unwrap());

        let empty = PlagiarismRequest {
            text: String::new(),
            options: PlagiarismOptions::default(),
        };
        assert_eq!(
            PlagiarismDetector.build_prompt(&empty).unwrap_err(),
            ValidationError::EmptyField("text")
        );
    }

    #[test]
    fn test_missing_suggestions_defaults_to_empty() {
        let normalized = PlagiarismDetector::parse("Originality Score: 0.95\nMatches:\nSummary: original");
        assert_eq!(normalized.missing(), &[MissingField("suggestions")]);
        assert!(normalized.result().suggestions.is_empty());
        assert!(normalized.result().matches.is_empty());
    }

    #[test]
    fn test_unparseable_score_defaults_to_one() {
        let normalized = PlagiarismDetector::parse("Originality Score: high\nSummary: fine");
        assert_eq!(normalized.result().originality_score, 1.0);
        assert!(normalized.missing().contains(&MissingField("originalityScore")));
    }

    #[test]
    fn test_score_variant_label_is_unmatched() {
        let normalized = PlagiarismDetector::parse("Score: 0.2\nSummary: mostly copied");
        assert_eq!(normalized.result().originality_score, 1.0);
        assert!(normalized.missing().contains(&MissingField("originalityScore")));
        assert_eq!(normalized.result().summary, "mostly copied");
    }

    #[test]
    fn test_percentage_score() {
        let normalized = PlagiarismDetector::parse("Originality Score: 72%");
        assert_eq!(normalized.result().originality_score, 0.72);
        let normalized = PlagiarismDetector::parse("Originality Score: 85");
        assert_eq!(normalized.result().originality_score, 0.85);
        let normalized = PlagiarismDetector::parse("Originality Score: 8/10");
        assert_eq!(normalized.result().originality_score, 0.8);
        let normalized = PlagiarismDetector::parse("Originality Score: 92/100");
        assert_eq!(normalized.result().originality_score, 0.92);
    }

    #[test]
    fn test_parse_match_with_source_and_dashes() {
        let m = parse_match("\"state-of-the-art - results\" - 0.7 - https://example.org/paper").unwrap();
        assert_eq!(m.text, "state-of-the-art - results");
        assert_eq!(m.similarity, 0.7);
        assert_eq!(m.source.as_deref(), Some("https://example.org/paper"));

        let m = parse_match("a passage with no score").unwrap();
        assert_eq!(m.text, "a passage with no score");
        assert_eq!(m.similarity, 0.0);
    }

    #[test]
    fn test_completion_text_round_trip() {
        let result = PlagiarismCheckResult {
            originality_score: 0.65,
            matches: vec![
                PlagiarismMatch {
                    text: "the mitochondria is the powerhouse of the cell".to_string(),
                    similarity: 0.9,
                    source: Some("https://example.org/bio".to_string()),
                },
                PlagiarismMatch {
                    text: "energy is conserved".to_string(),
                    similarity: 0.4,
                    source: None,
                },
            ],
            summary: "Two passages need citations.".to_string(),
            suggestions: vec!["Quote the first passage".to_string()],
        };
        let normalized = PlagiarismDetector::parse(&result.to_completion_text());
        assert_eq!(normalized, Normalized::Complete(result));
    }
}
