use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RepoError;
use crate::models::{elapsed_seconds, score_answers, AnswerMap, NewAttempt, Question, Quiz, QuizAttempt};
use crate::progress::{self, QuizProgress, SelectError, Step};
use crate::repository::QuizRepository;
use crate::session::AuthContext;

/// Runs left untouched longer than this are dropped on the next start.
pub const DEFAULT_RUN_MAX_AGE_HOURS: i64 = 2;

/// One user's pass through a quiz, held until it is submitted or abandoned.
#[derive(Debug, Clone)]
pub struct QuizRun {
    pub id: Uuid,
    pub quiz: Quiz,
    pub questions: Vec<Question>,
    pub progress: QuizProgress,
    pub answers: AnswerMap,
    pub started_at: DateTime<Utc>,
    /// Signed-in user who started the run, if any.
    pub owner: Option<Uuid>,
}

impl QuizRun {
    pub fn current_question(&self) -> &Question {
        &self.questions[self.progress.index]
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("quiz run not found")]
    NotFound,
    #[error("quiz run belongs to another user")]
    NotOwner,
    #[error("quiz has no questions")]
    NoQuestions,
    #[error("select an answer before continuing")]
    Unanswered,
    #[error("answer index out of range")]
    InvalidOption,
    #[error("quiz already submitted")]
    Submitted,
}

impl From<SelectError> for RunError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::AlreadySubmitted => RunError::Submitted,
            SelectError::OptionOutOfRange => RunError::InvalidOption,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Advance {
    Moved(QuizRun),
    /// Final question answered. The run is locked as submitted until
    /// [`RunStore::record`] stores it or hands it back.
    Submit(QuizRun),
}

pub struct RunStore {
    runs: RwLock<HashMap<Uuid, QuizRun>>,
    max_age: Duration,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(
    runs: &mut HashMap<Uuid, QuizRun>,
    quiz_id: Uuid,
    run_id: Uuid,
    user: Option<Uuid>,
) -> Result<&mut QuizRun, RunError> {
    let run = runs
        .get_mut(&run_id)
        .filter(|r| r.quiz.id == quiz_id)
        .ok_or(RunError::NotFound)?;
    match run.owner {
        Some(owner) if Some(owner) != user => Err(RunError::NotOwner),
        _ => Ok(run),
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_max_age(Duration::hours(DEFAULT_RUN_MAX_AGE_HOURS))
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops runs started more than `max_age` before `now`. Returns how many went.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.max_age;
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, run| run.started_at > cutoff);
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!(evicted, "dropped abandoned quiz runs");
        }
        evicted
    }

    pub async fn start(&self, quiz: Quiz, questions: Vec<Question>, owner: Option<Uuid>) -> Result<QuizRun, RunError> {
        let progress = QuizProgress::start(questions.len()).ok_or(RunError::NoQuestions)?;
        let now = Utc::now();
        self.evict_stale(now).await;
        let run = QuizRun {
            id: Uuid::new_v4(),
            quiz,
            questions,
            progress,
            answers: AnswerMap::new(),
            started_at: now,
            owner,
        };
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    /// Looks a run up, checking that it belongs to `quiz_id` and to `user`.
    pub async fn get(&self, quiz_id: Uuid, run_id: Uuid, user: Option<Uuid>) -> Result<QuizRun, RunError> {
        let mut runs = self.runs.write().await;
        lookup(&mut runs, quiz_id, run_id, user).map(|run| run.clone())
    }

    pub async fn select(
        &self,
        quiz_id: Uuid,
        run_id: Uuid,
        user: Option<Uuid>,
        option: usize,
    ) -> Result<QuizRun, RunError> {
        let mut runs = self.runs.write().await;
        let run = lookup(&mut runs, quiz_id, run_id, user)?;
        let current = &run.questions[run.progress.index];
        run.answers = progress::select(run.progress, run.answers.clone(), current, option)?;
        Ok(run.clone())
    }

    /// On the last question the run is marked submitted under the lock, so a
    /// repeated call gets [`RunError::Submitted`] instead of a second submit.
    pub async fn advance(&self, quiz_id: Uuid, run_id: Uuid, user: Option<Uuid>) -> Result<Advance, RunError> {
        let mut runs = self.runs.write().await;
        let run = lookup(&mut runs, quiz_id, run_id, user)?;
        if run.progress.submitted {
            return Err(RunError::Submitted);
        }
        match progress::advance(run.progress, &run.answers, run.current_question().id) {
            Step::Blocked => Err(RunError::Unanswered),
            Step::Moved(next) => {
                run.progress = next;
                Ok(Advance::Moved(run.clone()))
            }
            Step::Submit => {
                run.progress = progress::finish(run.progress);
                Ok(Advance::Submit(run.clone()))
            }
        }
    }

    /// Scores a run taken from [`Advance::Submit`] and stores the attempt.
    /// The run is dropped on success. On failure it is reopened so the
    /// user can submit again.
    pub async fn record(
        &self,
        repo: &QuizRepository,
        ctx: &AuthContext,
        run: &QuizRun,
        finished_at: DateTime<Utc>,
    ) -> Result<QuizAttempt, RepoError> {
        match submit_run(repo, ctx, run, finished_at).await {
            Ok(attempt) => {
                self.runs.write().await.remove(&run.id);
                Ok(attempt)
            }
            Err(err) => {
                if let Some(stored) = self.runs.write().await.get_mut(&run.id) {
                    stored.progress.submitted = false;
                }
                warn!(run_id = %run.id, "attempt not stored, run reopened: {}", err);
                Err(err)
            }
        }
    }

    /// Exit without saving.
    pub async fn discard(&self, quiz_id: Uuid, run_id: Uuid, user: Option<Uuid>) -> Result<(), RunError> {
        let mut runs = self.runs.write().await;
        lookup(&mut runs, quiz_id, run_id, user)?;
        runs.remove(&run_id);
        Ok(())
    }
}

/// Scores a finished run and records the attempt.
pub async fn submit_run(
    repo: &QuizRepository,
    ctx: &AuthContext,
    run: &QuizRun,
    finished_at: DateTime<Utc>,
) -> Result<QuizAttempt, RepoError> {
    let score = score_answers(&run.questions, &run.answers);
    let attempt = NewAttempt {
        quiz_id: run.quiz.id,
        answers: run.answers.clone(),
        score: score.score,
        percentage: score.percentage,
        time_taken: elapsed_seconds(run.started_at, finished_at),
    };
    repo.submit_attempt(ctx, attempt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUser;
    use crate::store::{Filter, MemoryStore, QueryClient, Select, StoreError, Table};
    use futures::future::BoxFuture;
    use serde_json::Value;
    use std::sync::Arc;

    fn quiz() -> Quiz {
        Quiz {
            id: Uuid::new_v4(),
            title: "Run".into(),
            description: "d".into(),
            category: None,
            difficulty: None,
            author_name: "x".into(),
            author_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn questions(quiz_id: Uuid, correct: &[usize]) -> Vec<Question> {
        correct
            .iter()
            .enumerate()
            .map(|(i, c)| Question {
                id: Uuid::new_v4(),
                quiz_id,
                question: format!("Q{i}"),
                options: vec!["a".into(), "b".into(), "c".into()],
                correct_answer: *c,
                explanation: None,
                order_index: i,
            })
            .collect()
    }

    fn player() -> AuthContext {
        AuthContext::signed_in(
            AuthUser {
                id: Uuid::new_v4(),
                email: None,
            },
            "t",
        )
    }

    /// Memory store whose inserts take a while, like a remote round trip.
    struct SlowInserts(MemoryStore);

    impl QueryClient for SlowInserts {
        fn insert(
            &self,
            token: Option<String>,
            table: Table,
            rows: Vec<Value>,
        ) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
            let inner = self.0.insert(token, table, rows);
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                inner.await
            })
        }

        fn select(&self, token: Option<String>, query: Select) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
            self.0.select(token, query)
        }

        fn delete(
            &self,
            token: Option<String>,
            table: Table,
            filters: Vec<Filter>,
        ) -> BoxFuture<'static, Result<(), StoreError>> {
            self.0.delete(token, table, filters)
        }
    }

    async fn press_next(
        store: &RunStore,
        repo: &QuizRepository,
        ctx: &AuthContext,
        quiz_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<QuizAttempt>, RunError> {
        let user = ctx.user.as_ref().map(|u| u.id);
        match store.advance(quiz_id, run_id, user).await? {
            Advance::Moved(_) => Ok(None),
            Advance::Submit(run) => Ok(store.record(repo, ctx, &run, Utc::now()).await.ok()),
        }
    }

    #[tokio::test]
    async fn run_walks_forward_and_submits() {
        let store = RunStore::new();
        let quiz = quiz();
        let qs = questions(quiz.id, &[1, 0, 2]);
        let run = store.start(quiz.clone(), qs.clone(), None).await.unwrap();

        assert_eq!(store.advance(quiz.id, run.id, None).await.unwrap_err(), RunError::Unanswered);
        assert_eq!(store.select(quiz.id, run.id, None, 3).await.unwrap_err(), RunError::InvalidOption);

        store.select(quiz.id, run.id, None, 1).await.unwrap();
        assert!(matches!(store.advance(quiz.id, run.id, None).await.unwrap(), Advance::Moved(r) if r.progress.index == 1));
        store.select(quiz.id, run.id, None, 2).await.unwrap();
        store.advance(quiz.id, run.id, None).await.unwrap();
        store.select(quiz.id, run.id, None, 2).await.unwrap();
        let Advance::Submit(finished) = store.advance(quiz.id, run.id, None).await.unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(finished.answers.len(), 3);
        assert!(finished.progress.submitted);

        let repo = QuizRepository::new(Arc::new(MemoryStore::new()));
        let later = finished.started_at + Duration::milliseconds(90_500);
        let attempt = store.record(&repo, &player(), &finished, later).await.unwrap();
        assert_eq!(attempt.score, 2);
        assert_eq!(attempt.percentage, Some(67));
        assert_eq!(attempt.time_taken, 90);
        assert_eq!(store.get(quiz.id, run.id, None).await.unwrap_err(), RunError::NotFound);
    }

    #[tokio::test]
    async fn concurrent_final_next_stores_one_attempt() {
        let memory = MemoryStore::new();
        let repo = QuizRepository::new(Arc::new(SlowInserts(memory.clone())));
        let store = RunStore::new();
        let quiz = quiz();
        let ctx = player();
        let user = ctx.user.as_ref().map(|u| u.id);
        let run = store.start(quiz.clone(), questions(quiz.id, &[0]), user).await.unwrap();
        store.select(quiz.id, run.id, user, 0).await.unwrap();

        let (first, second) = tokio::join!(
            press_next(&store, &repo, &ctx, quiz.id, run.id),
            press_next(&store, &repo, &ctx, quiz.id, run.id),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, Ok(Some(_)))).count(), 1);
        assert!(outcomes.iter().any(|o| *o == Err(RunError::Submitted)));
        assert_eq!(memory.rows(Table::QuizAttempts).await.len(), 1);
    }

    #[tokio::test]
    async fn submitted_run_rejects_answers_and_reopens_after_failed_store() {
        let store = RunStore::new();
        let quiz = quiz();
        let run = store.start(quiz.clone(), questions(quiz.id, &[0]), None).await.unwrap();
        store.select(quiz.id, run.id, None, 0).await.unwrap();
        let Advance::Submit(finished) = store.advance(quiz.id, run.id, None).await.unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(store.select(quiz.id, run.id, None, 1).await.unwrap_err(), RunError::Submitted);
        assert_eq!(store.advance(quiz.id, run.id, None).await.unwrap_err(), RunError::Submitted);

        let repo = QuizRepository::new(Arc::new(MemoryStore::new()));
        let err = store
            .record(&repo, &AuthContext::anonymous(), &finished, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::Unauthenticated);
        assert!(!store.get(quiz.id, run.id, None).await.unwrap().progress.submitted);
        assert!(matches!(store.advance(quiz.id, run.id, None).await.unwrap(), Advance::Submit(_)));
    }

    #[tokio::test]
    async fn runs_are_scoped_to_their_quiz_and_owner() {
        let store = RunStore::new();
        let quiz = quiz();
        assert_eq!(store.start(quiz.clone(), Vec::new(), None).await.unwrap_err(), RunError::NoQuestions);

        let owner = Some(Uuid::new_v4());
        let run = store.start(quiz.clone(), questions(quiz.id, &[0]), owner).await.unwrap();
        assert_eq!(store.get(Uuid::new_v4(), run.id, owner).await.unwrap_err(), RunError::NotFound);
        assert_eq!(store.get(quiz.id, run.id, None).await.unwrap_err(), RunError::NotOwner);
        assert_eq!(
            store.select(quiz.id, run.id, Some(Uuid::new_v4()), 0).await.unwrap_err(),
            RunError::NotOwner
        );
        assert_eq!(store.advance(quiz.id, run.id, None).await.unwrap_err(), RunError::NotOwner);

        store.discard(quiz.id, run.id, owner).await.unwrap();
        assert_eq!(store.discard(quiz.id, run.id, owner).await.unwrap_err(), RunError::NotFound);
    }

    #[tokio::test]
    async fn stale_runs_are_evicted() {
        let store = RunStore::new();
        let quiz = quiz();
        let old = store.start(quiz.clone(), questions(quiz.id, &[0]), None).await.unwrap();
        assert_eq!(store.evict_stale(Utc::now()).await, 0);
        assert_eq!(store.evict_stale(old.started_at + Duration::hours(3)).await, 1);
        assert_eq!(store.get(quiz.id, old.id, None).await.unwrap_err(), RunError::NotFound);

        let eager = RunStore::with_max_age(Duration::zero());
        let first = eager.start(quiz.clone(), questions(quiz.id, &[0]), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = eager.start(quiz.clone(), questions(quiz.id, &[0]), None).await.unwrap();
        assert_eq!(eager.get(quiz.id, first.id, None).await.unwrap_err(), RunError::NotFound);
        assert!(eager.get(quiz.id, second.id, None).await.is_ok());
        assert_eq!(eager.len().await, 1);
    }
}
