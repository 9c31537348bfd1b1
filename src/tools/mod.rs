pub mod data_collector;
pub mod data_visualizer;
pub mod exam_prep;
pub mod library;
pub mod math_solver;
pub mod plagiarism;
pub mod statistics;

pub use data_collector::DataCollector;
pub use data_visualizer::DataVisualizer;
pub use exam_prep::ExamPrepGuide;
pub use library::DigitalLibrary;
pub use math_solver::MathSolver;
pub use plagiarism::PlagiarismDetector;
pub use statistics::StatisticalAssistant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::llm::{Completion, CompletionError};
use crate::normalize::{MissingField, Normalized};
use crate::prompt::{PromptPayload, SamplingOptions, ValidationError};

/// Why a tool call produced no result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("failed to encode result: {0}")]
    Encode(String),
}

/// An AI-backed study tool: prompt builder, fixed sampling, and normalizer.
///
/// Not object-safe (associated types). Callers that pick a tool at runtime go
/// through [`ToolKind::dispatch`].
#[async_trait]
pub trait Tool: Send + Sync {
    type Request: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    fn sampling(&self) -> SamplingOptions;

    /// Pure and deterministic; rejects missing required input.
    fn build_prompt(&self, request: &Self::Request) -> Result<PromptPayload, ValidationError>;

    /// Pure; never fails.
    fn normalize(&self, raw: &str) -> Normalized<Self::Output>;

    /// Build the prompt, call the model once, normalize the answer.
    async fn run(
        &self,
        client: &dyn Completion,
        request: Self::Request,
    ) -> Result<Normalized<Self::Output>, ToolError> {
        let payload = self.build_prompt(&request)?;
        log::info!("{}: prompt built ({} chars)", self.name(), payload.user.len());

        let raw = client.complete(&payload, &self.sampling()).await?;
        log::info!("{}: completion received ({} chars)", self.name(), raw.len());

        let normalized = self.normalize(&raw);
        if normalized.is_degraded() {
            let missing: Vec<&str> = normalized.missing().iter().map(|m| m.name()).collect();
            log::warn!("{}: defaulted fields: {}", self.name(), missing.join(", "));
        }

        Ok(normalized)
    }
}

/// Every tool reachable over HTTP, keyed by URL slug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    MathSolver,
    PlagiarismDetector,
    DataVisualizer,
    StatisticalAssistant,
    DigitalLibrary,
    ExamPrep,
    DataCollector,
}

/// Result of a dispatched tool call, serialized for transport.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub missing: Vec<MissingField>,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::MathSolver,
        ToolKind::PlagiarismDetector,
        ToolKind::DataVisualizer,
        ToolKind::StatisticalAssistant,
        ToolKind::DigitalLibrary,
        ToolKind::ExamPrep,
        ToolKind::DataCollector,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            ToolKind::MathSolver => "math-solver",
            ToolKind::PlagiarismDetector => "plagiarism-detector",
            ToolKind::DataVisualizer => "data-visualizer",
            ToolKind::StatisticalAssistant => "statistical-assistant",
            ToolKind::DigitalLibrary => "digital-library",
            ToolKind::ExamPrep => "exam-prep",
            ToolKind::DataCollector => "data-collector",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }

    /// Decode `body` as this tool's request and run the pipeline.
    pub async fn dispatch(
        &self,
        client: &dyn Completion,
        body: Value,
    ) -> Result<ToolOutcome, ToolError> {
        match self {
            ToolKind::MathSolver => run_json(&MathSolver, client, body).await,
            ToolKind::PlagiarismDetector => {
                let request: plagiarism::PlagiarismRequest = decode(body)?;
                let normalized =
                    plagiarism::check_plagiarism(client, &request.text, request.options).await?;
                into_outcome(normalized)
            }
            ToolKind::DataVisualizer => run_json(&DataVisualizer, client, body).await,
            ToolKind::StatisticalAssistant => run_json(&StatisticalAssistant, client, body).await,
            ToolKind::DigitalLibrary => run_json(&DigitalLibrary, client, body).await,
            ToolKind::ExamPrep => run_json(&ExamPrepGuide, client, body).await,
            ToolKind::DataCollector => run_json(&DataCollector, client, body).await,
        }
    }
}

fn decode<R: DeserializeOwned>(body: Value) -> Result<R, ToolError> {
    serde_json::from_value(body).map_err(|e| ToolError::InvalidRequest(e.to_string()))
}

fn into_outcome<O: Serialize>(normalized: Normalized<O>) -> Result<ToolOutcome, ToolError> {
    let missing = normalized.missing().to_vec();
    let result = serde_json::to_value(normalized.into_result())
        .map_err(|e| ToolError::Encode(e.to_string()))?;

    Ok(ToolOutcome { result, missing })
}

async fn run_json<T>(tool: &T, client: &dyn Completion, body: Value) -> Result<ToolOutcome, ToolError>
where
    T: Tool,
    T::Request: DeserializeOwned,
    T::Output: Serialize,
{
    let request: T::Request = decode(body)?;
    into_outcome(tool.run(client, request).await?)
}
