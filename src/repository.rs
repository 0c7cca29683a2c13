use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RepoError;
use crate::models::{NewAttempt, NewQuiz, Question, Quiz, QuizAttempt, DEFAULT_CATEGORY, DEFAULT_DIFFICULTY};
use crate::session::AuthContext;
use crate::store::{Filter, QueryClient, Select, StoreError, Table};

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RepoError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| RepoError::from(StoreError::from(e))))
        .collect()
}

fn single<T: DeserializeOwned>(rows: Vec<Value>, what: &str) -> Result<T, RepoError> {
    decode_rows(rows)?
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::NotFound(what.to_string()))
}

/// Quiz, question and attempt operations on top of the data store.
#[derive(Clone)]
pub struct QuizRepository {
    store: Arc<dyn QueryClient>,
}

impl QuizRepository {
    pub fn new(store: Arc<dyn QueryClient>) -> Self {
        Self { store }
    }

    /// Inserts the quiz row, then one row per question draft. A failed
    /// question insert deletes the quiz row again.
    pub async fn create_quiz(&self, ctx: &AuthContext, quiz: NewQuiz) -> Result<Quiz, RepoError> {
        let user = ctx.require_user()?;
        let row = json!({
            "title": quiz.title,
            "description": quiz.description,
            "category": quiz.category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            "difficulty": quiz.difficulty.unwrap_or_else(|| DEFAULT_DIFFICULTY.to_string()),
            "author_name": quiz.author_name,
            "author_id": user.id,
        });
        let created: Quiz = single(self.store.insert(ctx.token(), Table::Quizzes, vec![row]).await?, "quiz")?;

        let question_rows: Vec<Value> = quiz
            .questions
            .into_iter()
            .enumerate()
            .map(|(index, q)| {
                json!({
                    "quiz_id": created.id,
                    "question": q.question,
                    "options": q.options,
                    "correct_answer": q.correct_answer,
                    "explanation": q.explanation.unwrap_or_default(),
                    "order_index": index,
                })
            })
            .collect();
        let question_count = question_rows.len();

        if let Err(err) = self.store.insert(ctx.token(), Table::Questions, question_rows).await {
            warn!(quiz_id = %created.id, "question insert failed, removing quiz: {}", err);
            let undo = vec![Filter {
                column: "id",
                value: created.id.to_string(),
            }];
            if let Err(undo_err) = self.store.delete(ctx.token(), Table::Quizzes, undo).await {
                error!(quiz_id = %created.id, "quiz left without questions: {}", undo_err);
            }
            return Err(err.into());
        }

        info!(quiz_id = %created.id, questions = question_count, "quiz created");
        Ok(created)
    }

    pub async fn fetch_quizzes(&self, ctx: &AuthContext) -> Result<Vec<Quiz>, RepoError> {
        let rows = self
            .store
            .select(ctx.token(), Select::from(Table::Quizzes).order("created_at", false))
            .await?;
        decode_rows(rows)
    }

    /// Quiz row and its questions, read concurrently. Either failure aborts.
    pub async fn fetch_quiz_with_questions(
        &self,
        ctx: &AuthContext,
        quiz_id: Uuid,
    ) -> Result<(Quiz, Vec<Question>), RepoError> {
        let quiz = self
            .store
            .select(ctx.token(), Select::from(Table::Quizzes).eq("id", quiz_id));
        let questions = self.store.select(
            ctx.token(),
            Select::from(Table::Questions)
                .eq("quiz_id", quiz_id)
                .order("order_index", true),
        );
        let (quiz_rows, question_rows) = futures::try_join!(quiz, questions)?;
        Ok((single(quiz_rows, "quiz")?, decode_rows(question_rows)?))
    }

    pub async fn submit_attempt(&self, ctx: &AuthContext, attempt: NewAttempt) -> Result<QuizAttempt, RepoError> {
        let user = ctx.require_user()?;
        let row = json!({
            "quiz_id": attempt.quiz_id,
            "user_id": user.id,
            "answers": attempt.answers,
            "score": attempt.score,
            "percentage": attempt.percentage,
            "time_taken": attempt.time_taken,
        });
        let rows = self.store.insert(ctx.token(), Table::QuizAttempts, vec![row]).await?;
        let created: QuizAttempt = single(rows, "attempt")?;
        info!(
            attempt_id = %created.id,
            quiz_id = %created.quiz_id,
            score = created.score,
            "quiz attempt recorded"
        );
        Ok(created)
    }

    /// The signed-in user's attempts, newest first, each with its quiz title.
    pub async fn fetch_user_attempts(&self, ctx: &AuthContext) -> Result<Vec<QuizAttempt>, RepoError> {
        let user = ctx.require_user()?;
        let query = Select::from(Table::QuizAttempts)
            .embed(Table::Quizzes, "quiz_id", &["id", "title"])
            .eq("user_id", user.id)
            .order("completed_at", false);
        decode_rows(self.store.select(ctx.token(), query).await?)
    }

    pub async fn fetch_user_quizzes(&self, ctx: &AuthContext) -> Result<Vec<Quiz>, RepoError> {
        let user = ctx.require_user()?;
        let query = Select::from(Table::Quizzes)
            .eq("author_id", user.id)
            .order("created_at", false);
        decode_rows(self.store.select(ctx.token(), query).await?)
    }

    pub async fn fetch_attempt(&self, ctx: &AuthContext, attempt_id: Uuid) -> Result<QuizAttempt, RepoError> {
        let user = ctx.require_user()?;
        let query = Select::from(Table::QuizAttempts)
            .eq("id", attempt_id)
            .eq("user_id", user.id);
        single(self.store.select(ctx.token(), query).await?, "attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUser;
    use crate::models::{score_answers, AnswerMap, QuestionDraft};
    use crate::store::MemoryStore;

    fn signed_in() -> AuthContext {
        AuthContext::signed_in(
            AuthUser {
                id: Uuid::new_v4(),
                email: Some("author@example.com".into()),
            },
            "token",
        )
    }

    fn new_quiz(question_count: usize) -> NewQuiz {
        NewQuiz {
            title: "Rust basics".into(),
            description: "Ownership and borrowing".into(),
            category: None,
            difficulty: None,
            author_name: "author@example.com".into(),
            questions: (0..question_count)
                .map(|i| QuestionDraft {
                    question: format!("Question {i}"),
                    options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                    correct_answer: i % 4,
                    explanation: None,
                })
                .collect(),
        }
    }

    fn repo() -> (QuizRepository, MemoryStore) {
        let store = MemoryStore::new();
        (QuizRepository::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn create_then_fetch_keeps_question_order() {
        let (repo, _) = repo();
        let ctx = signed_in();
        let quiz = repo.create_quiz(&ctx, new_quiz(5)).await.unwrap();
        assert_eq!(quiz.category.as_deref(), Some("General"));
        assert_eq!(quiz.difficulty.as_deref(), Some("medium"));
        assert_eq!(quiz.author_id, ctx.user.as_ref().map(|u| u.id));

        let (fetched, questions) = repo.fetch_quiz_with_questions(&ctx, quiz.id).await.unwrap();
        assert_eq!(fetched.id, quiz.id);
        let texts: Vec<_> = questions.iter().map(|q| q.question.as_str()).collect();
        assert_eq!(texts, vec!["Question 0", "Question 1", "Question 2", "Question 3", "Question 4"]);
        let indices: Vec<_> = questions.iter().map(|q| q.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(questions[0].explanation.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn create_quiz_requires_identity() {
        let (repo, store) = repo();
        let err = repo.create_quiz(&AuthContext::anonymous(), new_quiz(1)).await.unwrap_err();
        assert_eq!(err, RepoError::Unauthenticated);
        assert!(store.rows(Table::Quizzes).await.is_empty());
    }

    #[tokio::test]
    async fn failed_question_insert_removes_quiz() {
        let (repo, store) = repo();
        store.reject_inserts(Table::Questions).await;
        let err = repo.create_quiz(&signed_in(), new_quiz(2)).await.unwrap_err();
        assert!(matches!(err, RepoError::Persistence(msg) if msg.contains("row-level security")));
        assert!(store.rows(Table::Quizzes).await.is_empty());
    }

    #[tokio::test]
    async fn quiz_without_questions_is_not_an_error() {
        let (repo, store) = repo();
        let ctx = signed_in();
        let quiz = repo.create_quiz(&ctx, new_quiz(0)).await.unwrap();
        assert!(store.rows(Table::Questions).await.is_empty());
        let (_, questions) = repo.fetch_quiz_with_questions(&ctx, quiz.id).await.unwrap();
        assert!(questions.is_empty());
    }

    #[tokio::test]
    async fn failed_question_read_fails_the_whole_fetch() {
        let (repo, store) = repo();
        let ctx = signed_in();
        let quiz = repo.create_quiz(&ctx, new_quiz(3)).await.unwrap();
        store.reject_selects(Table::Questions).await;
        let err = repo.fetch_quiz_with_questions(&ctx, quiz.id).await.unwrap_err();
        assert!(matches!(err, RepoError::Persistence(msg) if msg.contains("questions")));
    }

    #[tokio::test]
    async fn expired_token_is_unauthenticated() {
        let (repo, store) = repo();
        let ctx = signed_in();
        repo.create_quiz(&ctx, new_quiz(1)).await.unwrap();
        store.expire_tokens();
        assert_eq!(repo.fetch_user_quizzes(&ctx).await.unwrap_err(), RepoError::Unauthenticated);
        assert_eq!(repo.fetch_quizzes(&AuthContext::anonymous()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_quiz_is_not_found() {
        let (repo, _) = repo();
        let err = repo
            .fetch_quiz_with_questions(&AuthContext::anonymous(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::NotFound("quiz".into()));
    }

    #[tokio::test]
    async fn listings_are_newest_first_and_scoped_to_user() {
        let (repo, _) = repo();
        let alice = signed_in();
        let bob = signed_in();
        let first = repo.create_quiz(&alice, new_quiz(1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = repo.create_quiz(&bob, new_quiz(1)).await.unwrap();

        let all = repo.fetch_quizzes(&AuthContext::anonymous()).await.unwrap();
        assert_eq!(all.iter().map(|q| q.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let mine = repo.fetch_user_quizzes(&alice).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, first.id);

        assert_eq!(
            repo.fetch_user_quizzes(&AuthContext::anonymous()).await.unwrap_err(),
            RepoError::Unauthenticated
        );
    }

    #[tokio::test]
    async fn submitted_attempt_round_trips_and_rescores() {
        let (repo, _) = repo();
        let author = signed_in();
        let player = signed_in();
        let quiz = repo.create_quiz(&author, new_quiz(3)).await.unwrap();
        let (_, questions) = repo.fetch_quiz_with_questions(&player, quiz.id).await.unwrap();

        let mut answers = AnswerMap::new();
        answers.insert(questions[0].id, questions[0].correct_answer);
        answers.insert(questions[1].id, questions[1].correct_answer);
        let score = score_answers(&questions, &answers);

        let attempt = repo
            .submit_attempt(
                &player,
                NewAttempt {
                    quiz_id: quiz.id,
                    answers: answers.clone(),
                    score: score.score,
                    percentage: score.percentage,
                    time_taken: 12,
                },
            )
            .await
            .unwrap();
        assert_eq!((attempt.score, attempt.percentage), (2, Some(67)));

        let stored = repo.fetch_attempt(&player, attempt.id).await.unwrap();
        assert_eq!(stored.answers, answers);
        assert_eq!(score_answers(&questions, &stored.answers), score);

        let listed = repo.fetch_user_attempts(&player).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].quizzes.as_ref().map(|q| q.title.as_str()), Some("Rust basics"));

        assert_eq!(
            repo.fetch_attempt(&author, attempt.id).await.unwrap_err(),
            RepoError::NotFound("attempt".into())
        );
    }

    #[tokio::test]
    async fn submit_requires_identity() {
        let (repo, store) = repo();
        let err = repo
            .submit_attempt(
                &AuthContext::anonymous(),
                NewAttempt {
                    quiz_id: Uuid::new_v4(),
                    answers: AnswerMap::new(),
                    score: 0,
                    percentage: 0,
                    time_taken: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::Unauthenticated);
        assert!(store.rows(Table::QuizAttempts).await.is_empty());
    }
}
