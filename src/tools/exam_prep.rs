use serde::{Deserialize, Serialize};

use super::Tool;
use crate::normalize::{MissingField, Normalized, Sections};
use crate::prompt::{in_range, optional, require, PromptPayload, SamplingOptions, ValidationError};

const OVERVIEW: &str = "Overview";
const STUDY_PLAN: &str = "Study Plan";
const KEY_TOPICS: &str = "Key Topics";
const PRACTICE_QUESTIONS: &str = "Practice Questions";
const TIPS: &str = "Tips";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamPrepRequest {
    pub subject: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub exam_date: Option<String>,
    #[serde(default = "default_weeks")]
    pub weeks: u32,
}

fn default_weeks() -> u32 {
    4
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyGuide {
    pub overview: String,
    pub study_plan: Vec<String>,
    pub key_topics: Vec<String>,
    pub practice_questions: Vec<String>,
    pub tips: Vec<String>,
}

/// Builds a week-by-week revision guide for an upcoming exam.
pub struct ExamPrepGuide;

impl ExamPrepGuide {
    fn system_prompt() -> &'static str {
        r#"You are an experienced study coach preparing a student for an exam.

Always answer using exactly this layout, with one item per line in every list:
Overview: <two or three sentences about what the exam covers>
Study Plan:
- Week 1: <focus and activities>
Key Topics:
- <topic>
Practice Questions:
1. <question>
Tips:
- <exam technique tip>"#
    }

    fn user_prompt(subject: &str, topics: &[&str], exam_date: Option<&str>, weeks: u32) -> String {
        let mut prompt = format!("Subject: {}\n", subject);
        if !topics.is_empty() {
            prompt.push_str(&format!("Topics to cover: {}\n", topics.join(", ")));
        }
        if let Some(date) = exam_date {
            prompt.push_str(&format!("Exam date: {}\n", date));
        }
        prompt.push_str(&format!(
            "\nCreate a {}-week study plan with at least five practice questions.",
            weeks
        ));
        prompt
    }

    pub fn parse(raw: &str) -> Normalized<StudyGuide> {
        let sections = Sections::extract(raw, &[OVERVIEW, STUDY_PLAN, KEY_TOPICS, PRACTICE_QUESTIONS, TIPS]);
        let mut missing = Vec::new();
        let mut list = |label: &str, field: &'static str| {
            sections.list(label).unwrap_or_else(|| {
                missing.push(MissingField(field));
                Vec::new()
            })
        };

        let study_plan = list(STUDY_PLAN, "studyPlan");
        let key_topics = list(KEY_TOPICS, "keyTopics");
        let practice_questions = list(PRACTICE_QUESTIONS, "practiceQuestions");
        let tips = list(TIPS, "tips");

        let overview = sections.text(OVERVIEW).unwrap_or_else(|| {
            missing.push(MissingField("overview"));
            String::new()
        });

        Normalized::from_parts(
            StudyGuide {
                overview,
                study_plan,
                key_topics,
                practice_questions,
                tips,
            },
            missing,
        )
    }
}

impl Tool for ExamPrepGuide {
    type Request = ExamPrepRequest;
    type Output = StudyGuide;

    fn name(&self) -> &'static str {
        "exam_prep"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::text(0.5, 2000).with_top_p(0.9)
    }

    fn build_prompt(&self, request: &ExamPrepRequest) -> Result<PromptPayload, ValidationError> {
        let subject = require("subject", &request.subject)?;
        in_range("weeks", i64::from(request.weeks), 1, 52)?;

        let topics: Vec<&str> = request
            .topics
            .iter()
            .filter_map(|t| optional(Some(t.as_str())))
            .collect();

        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(subject, &topics, optional(request.exam_date.as_deref()), request.weeks),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<StudyGuide> {
        Self::parse(raw)
    }
}
