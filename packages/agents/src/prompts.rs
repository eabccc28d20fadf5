// ABOUTME: Tracks open prompts for a run and accepts exactly one answer per prompt
// ABOUTME: Rejects unknown prompts, second answers, expired prompts and unknown options in that order

use crate::events::PromptOption;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnswerError {
    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("Prompt {0} has already been answered")]
    AlreadyAnswered(String),

    #[error("Prompt {0} has expired")]
    Expired(String),

    #[error("Prompt {prompt_id} has no option {option_id}")]
    InvalidOption {
        prompt_id: String,
        option_id: String,
    },
}

impl AnswerError {
    /// Machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownPrompt(_) => "UNKNOWN_PROMPT",
            Self::AlreadyAnswered(_) => "ALREADY_ANSWERED",
            Self::Expired(_) => "PROMPT_EXPIRED",
            Self::InvalidOption { .. } => "INVALID_OPTION",
        }
    }
}

struct OpenPrompt {
    options: Vec<PromptOption>,
    expires_at: Option<DateTime<Utc>>,
    answered: bool,
    /// Set once the asker stopped waiting
    closed: bool,
    waiter: Option<oneshot::Sender<PromptOption>>,
}

#[derive(Default)]
pub struct PromptTracker {
    prompts: Mutex<HashMap<String, OpenPrompt>>,
}

impl PromptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prompts(&self) -> MutexGuard<'_, HashMap<String, OpenPrompt>> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a prompt; the receiver resolves with the accepted answer
    pub fn register(
        &self,
        prompt_id: impl Into<String>,
        options: Vec<PromptOption>,
        expires_at: Option<DateTime<Utc>>,
    ) -> oneshot::Receiver<PromptOption> {
        let (tx, rx) = oneshot::channel();
        self.prompts().insert(
            prompt_id.into(),
            OpenPrompt {
                options,
                expires_at,
                answered: false,
                closed: false,
                waiter: Some(tx),
            },
        );
        rx
    }

    pub fn answer(&self, prompt_id: &str, option_id: &str) -> Result<PromptOption, AnswerError> {
        self.answer_at(prompt_id, option_id, Utc::now())
    }

    /// Accept an answer as of `now`
    pub fn answer_at(
        &self,
        prompt_id: &str,
        option_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PromptOption, AnswerError> {
        let mut prompts = self.prompts();
        let prompt = prompts
            .get_mut(prompt_id)
            .ok_or_else(|| AnswerError::UnknownPrompt(prompt_id.to_string()))?;

        if prompt.answered {
            return Err(AnswerError::AlreadyAnswered(prompt_id.to_string()));
        }
        if prompt.closed || prompt.expires_at.is_some_and(|deadline| now > deadline) {
            return Err(AnswerError::Expired(prompt_id.to_string()));
        }
        let option = prompt
            .options
            .iter()
            .find(|o| o.id == option_id)
            .cloned()
            .ok_or_else(|| AnswerError::InvalidOption {
                prompt_id: prompt_id.to_string(),
                option_id: option_id.to_string(),
            })?;

        prompt.answered = true;
        if let Some(waiter) = prompt.waiter.take() {
            let _ = waiter.send(option.clone());
        }
        Ok(option)
    }

    /// Stop accepting answers for a prompt whose wait ran out.
    ///
    /// Returns false when an answer was accepted first; its waiter holds it.
    pub fn expire(&self, prompt_id: &str) -> bool {
        match self.prompts().get_mut(prompt_id) {
            Some(prompt) if prompt.answered => false,
            Some(prompt) => {
                prompt.closed = true;
                true
            }
            None => true,
        }
    }

    pub fn is_answered(&self, prompt_id: &str) -> bool {
        self.prompts()
            .get(prompt_id)
            .map(|p| p.answered)
            .unwrap_or(false)
    }

    /// Ids of prompts still waiting for an answer
    pub fn open_prompts(&self) -> Vec<String> {
        self.prompts()
            .iter()
            .filter(|(_, p)| !p.answered)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn options() -> Vec<PromptOption> {
        ["allow", "deny"]
            .iter()
            .map(|id| PromptOption {
                id: id.to_string(),
                label: id.to_string(),
                value: json!(id),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_answer_reaches_waiter() {
        let tracker = PromptTracker::new();
        let rx = tracker.register("p1", options(), None);

        let accepted = tracker.answer("p1", "allow").unwrap();
        assert_eq!(accepted.id, "allow");
        assert_eq!(rx.await.unwrap().id, "allow");
        assert!(tracker.is_answered("p1"));
        assert!(tracker.open_prompts().is_empty());
    }

    #[test]
    fn test_second_answer_is_rejected() {
        let tracker = PromptTracker::new();
        let _rx = tracker.register("p1", options(), None);

        tracker.answer("p1", "allow").unwrap();
        assert_eq!(
            tracker.answer("p1", "deny"),
            Err(AnswerError::AlreadyAnswered("p1".to_string()))
        );
    }

    #[test]
    fn test_answer_after_expiry_is_rejected() {
        let tracker = PromptTracker::new();
        let deadline = Utc::now();
        let _rx = tracker.register("p1", options(), Some(deadline));

        let err = tracker
            .answer_at("p1", "allow", deadline + Duration::seconds(1))
            .unwrap_err();
        assert_eq!(err, AnswerError::Expired("p1".to_string()));
        assert_eq!(err.code(), "PROMPT_EXPIRED");
        assert!(!tracker.is_answered("p1"));
    }

    #[test]
    fn test_expired_prompt_rejects_answers_before_deadline() {
        let tracker = PromptTracker::new();
        let _rx = tracker.register("p1", options(), Some(Utc::now() + Duration::seconds(60)));

        assert!(tracker.expire("p1"));
        assert_eq!(
            tracker.answer("p1", "allow"),
            Err(AnswerError::Expired("p1".to_string()))
        );

        let _rx2 = tracker.register("p2", options(), None);
        tracker.answer("p2", "allow").unwrap();
        assert!(!tracker.expire("p2"));
    }

    #[test]
    fn test_check_order() {
        let tracker = PromptTracker::new();
        let deadline = Utc::now();
        let _rx = tracker.register("p1", options(), Some(deadline));
        let late = deadline + Duration::seconds(5);

        assert_eq!(
            tracker.answer_at("nope", "allow", late),
            Err(AnswerError::UnknownPrompt("nope".to_string()))
        );
        // expired wins over a bad option
        assert_eq!(
            tracker.answer_at("p1", "maybe", late),
            Err(AnswerError::Expired("p1".to_string()))
        );

        let _rx2 = tracker.register("p2", options(), None);
        tracker.answer("p2", "deny").unwrap();
        // already answered wins over a bad option
        assert_eq!(
            tracker.answer("p2", "maybe"),
            Err(AnswerError::AlreadyAnswered("p2".to_string()))
        );
    }

    #[test]
    fn test_invalid_option_leaves_prompt_open() {
        let tracker = PromptTracker::new();
        let _rx = tracker.register("p1", options(), None);

        assert!(matches!(
            tracker.answer("p1", "maybe"),
            Err(AnswerError::InvalidOption { .. })
        ));
        assert!(tracker.answer("p1", "allow").is_ok());
    }
}
