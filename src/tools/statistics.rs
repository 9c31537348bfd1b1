use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::data_visualizer::{truncate_chars, MAX_DATA_CHARS};
use super::Tool;
use crate::normalize::{num_of, parse_json_object, parse_number, str_of, JsonFields, Normalized};
use crate::prompt::{optional, require, PromptPayload, SamplingOptions, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Descriptive,
    Correlation,
    Regression,
    HypothesisTest,
    Distribution,
}

impl AnalysisType {
    fn instruction(&self) -> &'static str {
        match self {
            AnalysisType::Descriptive => {
                "Compute descriptive statistics: count, mean, median, mode, standard deviation, minimum and maximum."
            }
            AnalysisType::Correlation => {
                "Compute pairwise correlation coefficients between the numeric variables and judge their strength."
            }
            AnalysisType::Regression => {
                "Fit a linear regression, reporting slope, intercept and R-squared."
            }
            AnalysisType::HypothesisTest => {
                "Choose and run an appropriate hypothesis test, reporting the test statistic and p-value."
            }
            AnalysisType::Distribution => {
                "Describe the distribution: skewness, kurtosis, quartiles and any outliers."
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsRequest {
    pub data: String,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistic {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticalResult {
    pub summary: String,
    pub statistics: Vec<Statistic>,
    pub interpretation: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Runs a requested statistical analysis over a small dataset.
pub struct StatisticalAssistant;

impl StatisticalAssistant {
    fn system_prompt() -> &'static str {
        r#"You are a statistics tutor who analyses datasets for students and explains the results in plain language.

Respond with a single JSON object and nothing else, shaped exactly like this:
{
  "summary": "One paragraph overview of the data",
  "statistics": [ { "name": "mean", "value": 4.2 } ],
  "interpretation": "What the numbers mean",
  "insights": ["One finding per entry"],
  "recommendations": ["One next step per entry"]
}
Every statistic value must be a number."#
    }

    fn user_prompt(data: &str, analysis_type: AnalysisType, question: Option<&str>) -> String {
        let mut prompt = format!("{}\n", analysis_type.instruction());
        if let Some(question) = question {
            prompt.push_str(&format!("Research question: {}\n", question));
        }
        prompt.push_str(&format!("\nDataset:\n---\n{}\n---", truncate_chars(data, MAX_DATA_CHARS)));
        prompt
    }

    pub fn parse(raw: &str) -> Normalized<StatisticalResult> {
        let object = parse_json_object(raw);
        let mut fields = JsonFields::new(object.as_ref());

        let summary = fields.string("summary");

        // Models return either a list of {name, value} or a name -> value map
        let statistics = match fields.value("statistics") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|s| {
                    Some(Statistic {
                        name: str_of(s, "name")?,
                        value: num_of(s, "value")?,
                    })
                })
                .collect(),
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(name, value)| {
                    let value = match value {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => parse_number(s),
                        _ => None,
                    }?;
                    Some(Statistic {
                        name: name.clone(),
                        value,
                    })
                })
                .collect(),
            _ => {
                fields.mark_missing("statistics");
                Vec::new()
            }
        };

        let result = StatisticalResult {
            summary,
            statistics,
            interpretation: fields.string("interpretation"),
            insights: fields.string_list("insights"),
            recommendations: fields.string_list("recommendations"),
        };

        fields.finish(result)
    }
}

impl Tool for StatisticalAssistant {
    type Request = StatisticsRequest;
    type Output = StatisticalResult;

    fn name(&self) -> &'static str {
        "statistical_assistant"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::json(0.2, 2000)
    }

    fn build_prompt(&self, request: &StatisticsRequest) -> Result<PromptPayload, ValidationError> {
        let data = require("data", &request.data)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(data, request.analysis_type, optional(request.question.as_deref())),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<StatisticalResult> {
        Self::parse(raw)
    }
}
