//! Selection prompt used by the `select` middleware.
//!
//! The interactive terminal implementation lives with the front end; it owns
//! its terminal input and output. The engine only needs the trait.

use crate::errors::PipelineError;

/// What to ask the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Question shown above the list.
    pub label: String,
    /// Options, in display order.
    pub items: Vec<String>,
    /// Index highlighted initially.
    pub initial: usize,
    /// Number of rows visible at once.
    pub size: usize,
}

/// The user's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Index into [`SelectionRequest::items`].
    pub index: usize,
    /// The chosen item.
    pub item: String,
}

/// Asks the user to pick one item.
///
/// Called from a blocking task, so implementations may block on terminal input.
#[cfg_attr(test, mockall::automock)]
pub trait SelectionPrompt: Send + Sync {
    /// Presents the list and returns the selection.
    fn select(&self, request: &SelectionRequest) -> Result<Selection, PipelineError>;
}

/// Prompt for unattended runs: always answers with the initial item.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractivePrompt;

impl SelectionPrompt for NonInteractivePrompt {
    fn select(&self, request: &SelectionRequest) -> Result<Selection, PipelineError> {
        request
            .items
            .get(request.initial)
            .map(|item| Selection {
                index: request.initial,
                item: item.clone(),
            })
            .ok_or_else(|| {
                PipelineError::Prompt(format!(
                    "initial selection {} out of range for {} items",
                    request.initial,
                    request.items.len()
                ))
            })
    }
}
