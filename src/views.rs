use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::models::{
    format_time, is_correct, percentage, score_message, score_tier, Question, Quiz, QuizAttempt, ScoreTier,
};
use crate::runs::QuizRun;

pub const RECENT_ATTEMPTS: usize = 5;
pub const DRAFT_OPTION_COUNT: usize = 4;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavView {
    pub signed_in: bool,
    pub email: Option<String>,
}

impl NavView {
    pub fn new(user: Option<&AuthUser>) -> Self {
        Self {
            signed_in: user.is_some(),
            email: user.and_then(|u| u.email.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeView {
    pub nav: NavView,
    pub app_name: &'static str,
    pub actions: Vec<LinkView>,
}

#[derive(Debug, Serialize)]
pub struct LinkView {
    pub label: &'static str,
    pub href: String,
}

pub fn home(user: Option<&AuthUser>) -> HomeView {
    let actions = if user.is_some() {
        vec![
            LinkView { label: "Create Quiz", href: "/create-quiz".into() },
            LinkView { label: "Browse Quizzes", href: "/quizzes".into() },
            LinkView { label: "Dashboard", href: "/dashboard".into() },
        ]
    } else {
        vec![
            LinkView { label: "Get Started", href: "/register".into() },
            LinkView { label: "Browse Quizzes", href: "/quizzes".into() },
        ]
    };
    HomeView {
        nav: NavView::new(user),
        app_name: "Quiz Maker",
        actions,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormView {
    pub title: &'static str,
    pub fields: Vec<&'static str>,
    pub submit: &'static str,
    pub alternate: LinkView,
}

pub fn login_form() -> FormView {
    FormView {
        title: "Sign in",
        fields: vec!["email", "password"],
        submit: "Sign in",
        alternate: LinkView { label: "Create an account", href: "/register".into() },
    }
}

pub fn register_form() -> FormView {
    FormView {
        title: "Create account",
        fields: vec!["email", "password", "confirmPassword"],
        submit: "Register",
        alternate: LinkView { label: "Already have an account?", href: "/login".into() },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDraftView {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizView {
    pub author_name: String,
    pub category: &'static str,
    pub difficulty: &'static str,
    pub questions: Vec<QuestionDraftView>,
}

/// Blank authoring form: one question with four empty options.
pub fn create_quiz_form(user: &AuthUser) -> CreateQuizView {
    CreateQuizView {
        author_name: author_name(user),
        category: crate::models::DEFAULT_CATEGORY,
        difficulty: crate::models::DEFAULT_DIFFICULTY,
        questions: vec![QuestionDraftView {
            question: String::new(),
            options: vec![String::new(); DRAFT_OPTION_COUNT],
            correct_answer: 0,
        }],
    }
}

pub fn author_name(user: &AuthUser) -> String {
    user.email.clone().unwrap_or_else(|| "Anonymous".to_string())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizCard {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub href: String,
}

impl From<&Quiz> for QuizCard {
    fn from(quiz: &Quiz) -> Self {
        Self {
            id: quiz.id,
            title: quiz.title.clone(),
            description: quiz.description.clone(),
            author_name: if quiz.author_name.is_empty() {
                "Anonymous".to_string()
            } else {
                quiz.author_name.clone()
            },
            created_at: quiz.created_at,
            href: format!("/quiz/{}", quiz.id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizListView {
    pub quizzes: Vec<QuizCard>,
    pub total: usize,
    pub empty: bool,
}

pub fn quiz_list(quizzes: &[Quiz]) -> QuizListView {
    QuizListView {
        quizzes: quizzes.iter().map(QuizCard::from).collect(),
        total: quizzes.len(),
        empty: quizzes.is_empty(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOverview {
    pub quiz: QuizCard,
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub question_count: usize,
    pub can_start: bool,
}

pub fn quiz_overview(quiz: &Quiz, questions: &[Question]) -> QuizOverview {
    QuizOverview {
        quiz: QuizCard::from(quiz),
        category: quiz.category.clone(),
        difficulty: quiz.difficulty.clone(),
        question_count: questions.len(),
        can_start: !questions.is_empty(),
    }
}

/// A question as shown while taking a quiz; the answer key stays hidden.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub id: Uuid,
    pub text: String,
    pub options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeQuizView {
    pub run_id: Uuid,
    pub quiz_id: Uuid,
    pub title: String,
    pub position: usize,
    pub total: usize,
    pub progress_percent: u32,
    pub question: QuestionView,
    pub selected: Option<usize>,
    pub can_advance: bool,
    pub next_label: &'static str,
    pub elapsed_minutes: i64,
}

pub fn take_quiz(run: &QuizRun, now: DateTime<Utc>) -> TakeQuizView {
    let current = run.current_question();
    let selected = run.answers.get(&current.id).copied();
    TakeQuizView {
        run_id: run.id,
        quiz_id: run.quiz.id,
        title: run.quiz.title.clone(),
        position: run.progress.index + 1,
        total: run.progress.total,
        progress_percent: run.progress.percent_complete(),
        question: QuestionView {
            id: current.id,
            text: current.question.clone(),
            options: current.options.clone(),
        },
        selected,
        can_advance: selected.is_some(),
        next_label: if run.progress.is_last() { "Submit Quiz" } else { "Next Question" },
        elapsed_minutes: (now - run.started_at).num_minutes().max(0),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedView {
    pub attempt_id: Uuid,
    pub results_href: String,
}

pub fn submitted(quiz_id: Uuid, attempt_id: Uuid) -> SubmittedView {
    SubmittedView {
        attempt_id,
        results_href: format!("/quiz/{quiz_id}/results?attemptId={attempt_id}"),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionResult {
    pub text: String,
    pub is_correct_answer: bool,
    pub is_user_answer: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub number: usize,
    pub question: String,
    pub correct: bool,
    pub user_answer: Option<usize>,
    pub options: Vec<OptionResult>,
    pub explanation: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsView {
    pub quiz_id: Uuid,
    pub title: String,
    pub attempt_id: Uuid,
    pub score: u32,
    pub total: usize,
    pub percentage: u32,
    pub time_taken: String,
    pub message: &'static str,
    pub tier: ScoreTier,
    pub retake_href: String,
    pub questions: Vec<QuestionResult>,
}

/// Per-question correctness is recomputed from the stored answers; the
/// headline percentage is the stored one, falling back to the same rounding.
pub fn results(quiz: &Quiz, questions: &[Question], attempt: &QuizAttempt) -> ResultsView {
    let total = questions.len();
    let pct = attempt
        .percentage
        .unwrap_or_else(|| percentage(attempt.score, total as u32));
    let details = questions
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let user_answer = attempt.answers.get(&q.id).copied();
            QuestionResult {
                number: i + 1,
                question: q.question.clone(),
                correct: is_correct(q, &attempt.answers),
                user_answer,
                options: q
                    .options
                    .iter()
                    .enumerate()
                    .map(|(j, text)| OptionResult {
                        text: text.clone(),
                        is_correct_answer: j == q.correct_answer,
                        is_user_answer: user_answer == Some(j),
                    })
                    .collect(),
                explanation: q.explanation.clone().filter(|e| !e.trim().is_empty()),
            }
        })
        .collect();
    ResultsView {
        quiz_id: quiz.id,
        title: quiz.title.clone(),
        attempt_id: attempt.id,
        score: attempt.score,
        total,
        percentage: pct,
        time_taken: format_time(attempt.time_taken),
        message: score_message(pct),
        tier: score_tier(pct),
        retake_href: format!("/quiz/{}", quiz.id),
        questions: details,
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_quizzes: usize,
    pub total_attempts: usize,
    pub average_score: u32,
    pub best_score: u32,
}

pub fn dashboard_stats(quizzes: &[Quiz], attempts: &[QuizAttempt]) -> DashboardStats {
    let total_attempts = attempts.len();
    let total_score: u32 = attempts.iter().map(|a| a.score).sum();
    let average_score = if total_attempts > 0 {
        let n = total_attempts as u32;
        (total_score + n / 2) / n
    } else {
        0
    };
    DashboardStats {
        total_quizzes: quizzes.len(),
        total_attempts,
        average_score,
        best_score: attempts.iter().map(|a| a.score).max().unwrap_or(0),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRow {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub quiz_title: Option<String>,
    pub score: u32,
    pub percentage: Option<u32>,
    pub time_taken: String,
    pub completed_at: DateTime<Utc>,
    pub results_href: String,
}

impl From<&QuizAttempt> for AttemptRow {
    fn from(a: &QuizAttempt) -> Self {
        Self {
            id: a.id,
            quiz_id: a.quiz_id,
            quiz_title: a.quizzes.as_ref().map(|q| q.title.clone()),
            score: a.score,
            percentage: a.percentage,
            time_taken: format_time(a.time_taken),
            completed_at: a.completed_at,
            results_href: format!("/quiz/{}/results?attemptId={}", a.quiz_id, a.id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub nav: NavView,
    pub stats: DashboardStats,
    pub my_quizzes: Vec<QuizCard>,
    pub recent_attempts: Vec<AttemptRow>,
}

pub fn dashboard(user: &AuthUser, quizzes: &[Quiz], attempts: &[QuizAttempt]) -> DashboardView {
    DashboardView {
        nav: NavView::new(Some(user)),
        stats: dashboard_stats(quizzes, attempts),
        my_quizzes: quizzes.iter().map(QuizCard::from).collect(),
        recent_attempts: attempts.iter().take(RECENT_ATTEMPTS).map(AttemptRow::from).collect(),
    }
}
