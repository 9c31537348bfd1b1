use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Tool;
use crate::normalize::{num_of, parse_json_object, str_of, strings_of, JsonFields, Normalized};
use crate::prompt::{in_range, require, PromptPayload, SamplingOptions, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicLevel {
    HighSchool,
    #[default]
    Undergraduate,
    Postgraduate,
    Research,
}

impl AcademicLevel {
    fn label(&self) -> &'static str {
        match self {
            AcademicLevel::HighSchool => "high school",
            AcademicLevel::Undergraduate => "undergraduate",
            AcademicLevel::Postgraduate => "postgraduate",
            AcademicLevel::Research => "research",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryRequest {
    pub topic: String,
    #[serde(default)]
    pub level: AcademicLevel,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub title: String,
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LibraryResult {
    pub summary: String,
    pub resources: Vec<Resource>,
}

/// Recommends reading material for a study topic.
pub struct DigitalLibrary;

impl DigitalLibrary {
    fn system_prompt() -> &'static str {
        r#"You are a university librarian recommending study resources.

Only recommend resources you are confident exist. Prefer textbooks, peer-reviewed articles and reputable open courseware.

Respond with a single JSON object and nothing else, shaped exactly like this:
{
  "summary": "How these resources fit together",
  "resources": [
    {
      "title": "Resource title",
      "authors": ["Author Name"],
      "year": 2020,
      "kind": "book | article | course | video | website",
      "description": "Why it is useful",
      "url": "https://... or null"
    }
  ]
}"#
    }

    fn user_prompt(topic: &str, level: AcademicLevel, max_results: u32) -> String {
        format!(
            "Topic: {}\nAcademic level: {}\n\nRecommend at most {} resources, most useful first.",
            topic,
            level.label(),
            max_results
        )
    }

    pub fn parse(raw: &str) -> Normalized<LibraryResult> {
        let object = parse_json_object(raw);
        let mut fields = JsonFields::new(object.as_ref());

        let result = LibraryResult {
            summary: fields.string("summary"),
            resources: fields.list_of("resources", parse_resource),
        };

        fields.finish(result)
    }
}

fn parse_resource(object: &Map<String, Value>) -> Option<Resource> {
    let title = str_of(object, "title").filter(|t| !t.is_empty())?;
    Some(Resource {
        title,
        authors: strings_of(object, "authors"),
        year: num_of(object, "year")
            .filter(|y| (0.0..=9999.0).contains(y))
            .map(|y| y as u32),
        kind: str_of(object, "kind")
            .or_else(|| str_of(object, "type"))
            .map(|k| k.to_lowercase())
            .unwrap_or_else(|| "book".to_string()),
        description: str_of(object, "description").unwrap_or_default(),
        url: str_of(object, "url").filter(|u| u.starts_with("http")),
    })
}

impl Tool for DigitalLibrary {
    type Request = LibraryRequest;
    type Output = LibraryResult;

    fn name(&self) -> &'static str {
        "digital_library"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::json(0.4, 2000)
    }

    fn build_prompt(&self, request: &LibraryRequest) -> Result<PromptPayload, ValidationError> {
        let topic = require("topic", &request.topic)?;
        in_range("maxResults", i64::from(request.max_results), 1, 20)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(topic, request.level, request.max_results),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<LibraryResult> {
        Self::parse(raw)
    }
}
