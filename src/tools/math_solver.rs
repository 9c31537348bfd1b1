use serde::{Deserialize, Serialize};

use super::Tool;
use crate::normalize::{MissingField, Normalized, Sections};
use crate::prompt::{require, PromptPayload, SamplingOptions, ValidationError};

const ANSWER: &str = "Answer";
const STEPS: &str = "Solution Steps";
const EXPLANATION: &str = "Explanation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathSubject {
    #[default]
    General,
    Arithmetic,
    Algebra,
    Geometry,
    Trigonometry,
    Calculus,
    Statistics,
}

impl MathSubject {
    fn label(&self) -> &'static str {
        match self {
            MathSubject::General => "general mathematics",
            MathSubject::Arithmetic => "arithmetic",
            MathSubject::Algebra => "algebra",
            MathSubject::Geometry => "geometry",
            MathSubject::Trigonometry => "trigonometry",
            MathSubject::Calculus => "calculus",
            MathSubject::Statistics => "statistics",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MathProblem {
    pub problem: String,
    #[serde(default)]
    pub subject: MathSubject,
    #[serde(default = "show_steps_default")]
    pub show_steps: bool,
}

fn show_steps_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MathSolution {
    pub answer: String,
    pub steps: Vec<String>,
    pub explanation: String,
}

#[cfg(test)]
impl MathSolution {
    /// Render in the layout the solver asks the model to answer in.
    pub fn to_completion_text(&self) -> String {
        let mut text = format!("{}: {}\n{}:\n", ANSWER, self.answer, STEPS);
        for (i, step) in self.steps.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, step));
        }
        text.push_str(&format!("{}: {}\n", EXPLANATION, self.explanation));
        text
    }
}

/// Step-by-step math problem solver.
pub struct MathSolver;

impl MathSolver {
    fn system_prompt() -> &'static str {
        r#"You are an expert mathematics tutor helping university students.

Solve the problem exactly and show your reasoning in small, verifiable steps.

Always answer using exactly this layout:
Answer: <final answer on one line>
Solution Steps:
1. <first step>
2. <second step>
Explanation: <short explanation of the method and why it works>

Do not add any text before "Answer:"."#
    }

    fn user_prompt(problem: &str, subject: MathSubject, show_steps: bool) -> String {
        let detail = if show_steps {
            "Show every intermediate step."
        } else {
            "Keep the solution steps brief, listing only the key steps."
        };
        format!(
            "Subject: {}\n\nProblem:\n---\n{}\n---\n\n{}",
            subject.label(),
            problem,
            detail
        )
    }

    pub fn parse(raw: &str) -> Normalized<MathSolution> {
        let sections = Sections::extract(raw, &[ANSWER, STEPS, EXPLANATION]);
        let mut missing = Vec::new();

        let answer = sections.text(ANSWER).unwrap_or_else(|| {
            missing.push(MissingField("answer"));
            String::new()
        });
        let steps = sections.list(STEPS).unwrap_or_else(|| {
            missing.push(MissingField("steps"));
            Vec::new()
        });
        let explanation = sections.text(EXPLANATION).unwrap_or_else(|| {
            missing.push(MissingField("explanation"));
            String::new()
        });

        Normalized::from_parts(
            MathSolution {
                answer,
                steps,
                explanation,
            },
            missing,
        )
    }
}

impl Tool for MathSolver {
    type Request = MathProblem;
    type Output = MathSolution;

    fn name(&self) -> &'static str {
        "math_solver"
    }

    fn sampling(&self) -> SamplingOptions {
        SamplingOptions::text(0.2, 1500)
    }

    fn build_prompt(&self, request: &MathProblem) -> Result<PromptPayload, ValidationError> {
        let problem = require("problem", &request.problem)?;
        Ok(PromptPayload::new(
            Self::system_prompt(),
            Self::user_prompt(problem, request.subject, request.show_steps),
        ))
    }

    fn normalize(&self, raw: &str) -> Normalized<MathSolution> {
        Self::parse(raw)
    }
}
