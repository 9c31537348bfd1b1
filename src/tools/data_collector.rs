use serde::{Deserialize, Serialize};

use super::Tool;
use crate::normalize::{parse_json_object, JsonFields, Normalized};
use crate::prompt::{optional, require, PromptPayload, SamplingOptions, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMethod {
    #[default]
    Survey,
    Interview,
    Observation,
    Experiment,
}

impl CollectionMethod {
    fn label(&self) -> &'static str {
        match self {
            CollectionMethod::Survey => "survey questionnaire",
            CollectionMethod::Interview => "semi-structured interview",
            CollectionMethod::Observation => "structured observation",
            CollectionMethod::Experiment => "controlled experiment",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    pub topic: String,
    #[serde(default)]
    pub method: CollectionMethod,
    #[serde(default)]
    pub sample_size: Option<u32>,
    #[serde(default)]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPlan {
    pub objective: String,
    pub questions: Vec<String>,
    pub sampling_strategy: String,
    pub ethical_considerations: Vec<String>,
    pub analysis_plan: String,
}

/// Drafts a data-collection plan (questions, sampling, ethics) for a
/// student research project.
pub struct DataCollector;

impl DataCollector {
    fn system_prompt() -> &'static str {
        r#"You are a research methods advisor helping students design data collection for their projects.

Respond with a single JSON object and nothing else, shaped exactly like this:
{
  "objective": "What the data collection should establish",
  "questions": ["Question or measurement, one per entry"],
  "samplingStrategy": "Who to sample, how many and how",
  "ethicalConsiderations": ["One consideration per entry"],
  "analysisPlan": "How the collected data will be analysed"
}"#
    }

    fn user_prompt(
        topic: &str,
        method: CollectionMethod,
        sample_size: Option<u32>,
        audience: Option<&str>,
    ) -> String {
        let mut prompt = format!("Research topic: {}\nMethod: {}\n", topic, method.label());
        if let Some(size) = sample_size {
            prompt.push_str(&format!("Target sample size: {}\n", size));
        }
        if let Some(audience) = audience {
            prompt.push_str(&format!("Participants: {}\n", audience));
        }
        prompt.push_str("\nWrite between five and ten neutral, non-leading questions.");
        prompt
    }

    pub fn parse(raw: &str) -> Normalized<CollectionPlan> {
        let object = parse_json_object(raw);
        let mut fields = JsonFields::new(object.as_ref());

        let result = CollectionPlan {
            objective: fields.string("objective"),
            questions: fields.string_list("questions"),
            sampling_strategy: fields.string("samplingStrategy"),
            ethical_considerations: fields.string_list("ethicalConsiderations"),
            analysis_plan: fields.string("analysisPlan"),
        };

        fields.finish(result)
    }
}

impl Tool for DataCollector {
    type Request = CollectionRequest;
    type Output = CollectionPlan;

    fn name(&self) -> &'static str {
        "data_collector"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::json(0.4, 1500)
    }

    fn build_prompt(&self, request: &CollectionRequest) -> Result<PromptPayload, ValidationError> {
        let topic = require("topic", &request.topic)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(
                topic,
                request.method,
                request.sample_size,
                optional(request.audience.as_deref()),
            ),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<CollectionPlan> {
        Self::parse(raw)
    }
}
