use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_CATEGORY: &str = "General";
pub const DEFAULT_DIFFICULTY: &str = "medium";

/// Question id -> index of the option the user picked. Sparse: a missing
/// entry means the question was left unanswered.
pub type AnswerMap = BTreeMap<Uuid, usize>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub author_name: String,
    #[serde(default)]
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
    #[serde(default)]
    pub explanation: Option<String>,
    pub order_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizRef {
    pub id: Uuid,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub answers: AnswerMap,
    pub score: u32,
    #[serde(default)]
    pub percentage: Option<u32>,
    pub time_taken: u64,
    pub completed_at: DateTime<Utc>,
    /// Embedded parent quiz, present when listed for the dashboard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quizzes: Option<QuizRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionDraft {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuiz {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub author_name: String,
    pub questions: Vec<QuestionDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttempt {
    pub quiz_id: Uuid,
    pub answers: AnswerMap,
    pub score: u32,
    pub percentage: u32,
    pub time_taken: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, issue: &str) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
        }
    }
}

pub fn validate_new_quiz(quiz: &NewQuiz) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if quiz.title.trim().is_empty() {
        issues.push(ValidationIssue::new("title", "must not be empty"));
    }
    if quiz.description.trim().is_empty() {
        issues.push(ValidationIssue::new("description", "must not be empty"));
    }
    if quiz.questions.is_empty() {
        issues.push(ValidationIssue::new("questions", "must contain at least one question"));
    }

    for (i, q) in quiz.questions.iter().enumerate() {
        if q.question.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("questions[{i}].question"), "must not be empty"));
        }
        if q.options.is_empty() {
            issues.push(ValidationIssue::new(format!("questions[{i}].options"), "must contain at least one option"));
        }
        for (j, opt) in q.options.iter().enumerate() {
            if opt.trim().is_empty() {
                issues.push(ValidationIssue::new(format!("questions[{i}].options[{j}]"), "must not be empty"));
            }
        }
        if !q.options.is_empty() && q.correct_answer >= q.options.len() {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].correct_answer"),
                "must reference an existing option",
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

pub fn is_correct(question: &Question, answers: &AnswerMap) -> bool {
    answers.get(&question.id) == Some(&question.correct_answer)
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Score {
    pub score: u32,
    pub total: u32,
    pub percentage: u32,
}

/// Scores an answer mapping against the full question set of a quiz.
pub fn score_answers(questions: &[Question], answers: &AnswerMap) -> Score {
    let score = questions.iter().filter(|q| is_correct(q, answers)).count() as u32;
    let total = questions.len() as u32;
    Score {
        score,
        total,
        percentage: percentage(score, total),
    }
}

/// `round(100 * score / total)` with halves rounded up, in integer math.
pub fn percentage(score: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (score * 100 + total / 2) / total
}

/// Whole seconds between `started_at` and `finished_at`, floored.
pub fn elapsed_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> u64 {
    (finished_at - started_at).num_seconds().max(0) as u64
}

/// `m:ss`
pub fn format_time(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

pub fn score_message(percentage: u32) -> &'static str {
    match percentage {
        90..=u32::MAX => "Excellent work!",
        80..=89 => "Great job!",
        70..=79 => "Good effort!",
        60..=69 => "Not bad! Keep practicing!",
        _ => "Keep studying and try again!",
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScoreTier {
    High,
    Medium,
    Low,
}

pub fn score_tier(percentage: u32) -> ScoreTier {
    if percentage >= 80 {
        ScoreTier::High
    } else if percentage >= 60 {
        ScoreTier::Medium
    } else {
        ScoreTier::Low
    }
}
