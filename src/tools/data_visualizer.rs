use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Tool;
use crate::normalize::{num_of, parse_json_object, str_of, JsonFields, Normalized};
use crate::prompt::{optional, require, PromptPayload, SamplingOptions, ValidationError};

/// Datasets longer than this are cut before being sent to the model.
pub const MAX_DATA_CHARS: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Auto,
    Bar,
    Line,
    Pie,
    Scatter,
    Area,
}

impl ChartType {
    fn instruction(&self) -> &'static str {
        match self {
            ChartType::Auto => "Choose the chart type (bar, line, pie, scatter or area) that best fits the data.",
            ChartType::Bar => "Use a bar chart.",
            ChartType::Line => "Use a line chart.",
            ChartType::Pie => "Use a pie chart.",
            ChartType::Scatter => "Use a scatter plot.",
            ChartType::Area => "Use an area chart.",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationRequest {
    pub data: String,
    #[serde(default)]
    pub chart_type: ChartType,
    #[serde(default)]
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationResult {
    pub chart_type: String,
    pub title: String,
    pub x_axis: String,
    pub y_axis: String,
    pub series: Vec<DataSeries>,
    pub insights: Vec<String>,
}

impl Default for VisualizationResult {
    fn default() -> Self {
        Self {
            chart_type: "bar".to_string(),
            title: String::new(),
            x_axis: String::new(),
            y_axis: String::new(),
            series: Vec::new(),
            insights: Vec::new(),
        }
    }
}

/// Turns raw tabular data into a chart specification plus insights.
pub struct DataVisualizer;

impl DataVisualizer {
    fn system_prompt() -> &'static str {
        r#"You are a data visualization assistant for students.

Read the dataset, decide how to chart it, and point out what the chart shows.

Respond with a single JSON object and nothing else, shaped exactly like this:
{
  "chartType": "bar",
  "title": "Chart title",
  "xAxis": "x axis label",
  "yAxis": "y axis label",
  "series": [
    { "name": "Series name", "points": [ { "label": "A", "value": 1.5 } ] }
  ],
  "insights": ["One observation per entry"]
}"#
    }

    fn user_prompt(data: &str, chart_type: ChartType, goal: Option<&str>) -> String {
        let mut prompt = format!("{}\n", chart_type.instruction());
        if let Some(goal) = goal {
            prompt.push_str(&format!("Goal of the visualization: {}\n", goal));
        }
        prompt.push_str(&format!("\nDataset:\n---\n{}\n---", truncate_chars(data, MAX_DATA_CHARS)));
        prompt
    }

    pub fn parse(raw: &str) -> Normalized<VisualizationResult> {
        let object = parse_json_object(raw);
        let mut fields = JsonFields::new(object.as_ref());

        let result = VisualizationResult {
            chart_type: fields.string_or("chartType", "bar").to_lowercase(),
            title: fields.string("title"),
            x_axis: fields.string("xAxis"),
            y_axis: fields.string("yAxis"),
            series: fields.list_of("series", parse_series),
            insights: fields.string_list("insights"),
        };

        fields.finish(result)
    }
}

fn parse_series(object: &Map<String, Value>) -> Option<DataSeries> {
    let points = match object.get("points").or_else(|| object.get("data")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|p| {
                Some(DataPoint {
                    label: str_of(p, "label").or_else(|| str_of(p, "x"))?,
                    value: num_of(p, "value").or_else(|| num_of(p, "y"))?,
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(DataSeries {
        name: str_of(object, "name").unwrap_or_default(),
        points,
    })
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n[... truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

impl Tool for DataVisualizer {
    type Request = VisualizationRequest;
    type Output = VisualizationResult;

    fn name(&self) -> &'static str {
        "data_visualizer"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::json(0.3, 2000)
    }

    fn build_prompt(&self, request: &VisualizationRequest) -> Result<PromptPayload, ValidationError> {
        let data = require("data", &request.data)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(data, request.chart_type, optional(request.goal.as_deref())),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<VisualizationResult> {
        Self::parse(raw)
    }
}
