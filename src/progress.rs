use serde::Serialize;
use uuid::Uuid;

use crate::models::{AnswerMap, Question};

/// Position inside a linear, forward-only pass through a quiz.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QuizProgress {
    pub index: usize,
    pub total: usize,
    pub submitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The current question has no answer yet.
    Blocked,
    Moved(QuizProgress),
    /// Last question answered; the caller persists the attempt.
    Submit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    AlreadySubmitted,
    OptionOutOfRange,
}

impl QuizProgress {
    /// `None` for a quiz without questions, which cannot be taken.
    pub fn start(total: usize) -> Option<Self> {
        (total > 0).then_some(Self {
            index: 0,
            total,
            submitted: false,
        })
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }

    /// Share of the quiz reached, counting the current question.
    pub fn percent_complete(&self) -> u32 {
        (((self.index + 1) * 100) / self.total) as u32
    }
}

pub fn can_advance(answers: &AnswerMap, current: Uuid) -> bool {
    answers.contains_key(&current)
}

pub fn advance(state: QuizProgress, answers: &AnswerMap, current: Uuid) -> Step {
    if state.submitted || !can_advance(answers, current) {
        return Step::Blocked;
    }
    if state.is_last() {
        Step::Submit
    } else {
        Step::Moved(QuizProgress {
            index: state.index + 1,
            ..state
        })
    }
}

pub fn finish(state: QuizProgress) -> QuizProgress {
    QuizProgress {
        submitted: true,
        ..state
    }
}

/// Records `option` for the current question, replacing an earlier pick.
pub fn select(
    state: QuizProgress,
    mut answers: AnswerMap,
    current: &Question,
    option: usize,
) -> Result<AnswerMap, SelectError> {
    if state.submitted {
        return Err(SelectError::AlreadySubmitted);
    }
    if option >= current.options.len() {
        return Err(SelectError::OptionOutOfRange);
    }
    answers.insert(current.id, option);
    Ok(answers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(order_index: usize) -> Question {
        Question {
            id: Uuid::new_v4(),
            quiz_id: Uuid::nil(),
            question: format!("Q{order_index}"),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_answer: 0,
            explanation: None,
            order_index,
        }
    }

    #[test]
    fn empty_quiz_cannot_start() {
        assert!(QuizProgress::start(0).is_none());
        let p = QuizProgress::start(4).unwrap();
        assert_eq!(p.index, 0);
        assert_eq!(p.percent_complete(), 25);
    }

    #[test]
    fn advance_is_guarded_by_an_answer() {
        let questions = vec![question(0), question(1)];
        let state = QuizProgress::start(2).unwrap();
        let answers = AnswerMap::new();
        assert_eq!(advance(state, &answers, questions[0].id), Step::Blocked);

        let answers = select(state, answers, &questions[0], 2).unwrap();
        let Step::Moved(next) = advance(state, &answers, questions[0].id) else {
            panic!("expected to move forward");
        };
        assert_eq!(next.index, 1);
        assert!(next.is_last());

        assert_eq!(advance(next, &answers, questions[1].id), Step::Blocked);
        let answers = select(next, answers, &questions[1], 0).unwrap();
        assert_eq!(advance(next, &answers, questions[1].id), Step::Submit);

        let done = finish(next);
        assert!(done.submitted);
        assert_eq!(advance(done, &answers, questions[1].id), Step::Blocked);
    }

    #[test]
    fn selection_overwrites_and_checks_range() {
        let q = question(0);
        let state = QuizProgress::start(1).unwrap();
        let answers = select(state, AnswerMap::new(), &q, 1).unwrap();
        let answers = select(state, answers, &q, 3).unwrap();
        assert_eq!(answers.get(&q.id), Some(&3));
        assert_eq!(select(state, answers.clone(), &q, 4), Err(SelectError::OptionOutOfRange));
        assert_eq!(select(finish(state), answers, &q, 0), Err(SelectError::AlreadySubmitted));
    }
}
