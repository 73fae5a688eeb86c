//! Plan capture: turning a statement into a [`CapturedPlan`] and persisting it.

mod command;
mod postgres;

pub use command::CommandCapture;
pub use postgres::{plan_from_pg_json, PgExplainCapture};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{PlanStore, Statement};
use crate::plan::CapturedPlan;
use crate::serializer;

/// Categorized reasons a capture can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// The engine answered, but not with a plan we can read
    InvalidPlan,
    /// Unknown or unclassified errors
    Unknown,
}

impl ErrorCategory {
    /// Whether retrying the same statement later could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Syntax | ErrorCategory::Semantic | ErrorCategory::InvalidPlan
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::InvalidPlan => write!(f, "Invalid Plan"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        // Class 0A: Feature Not Supported, class 22: Data Exception
        "0A" | "22" => ErrorCategory::Semantic,
        "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The engine refused to plan the statement; it will never be retried.
    #[error("{category}: {message}")]
    Unexplainable {
        category: ErrorCategory,
        message: String,
    },
    /// The engine could not be reached or answered unexpectedly.
    #[error("capture failed: {0}")]
    Transient(#[source] anyhow::Error),
}

impl CaptureError {
    pub fn unexplainable(category: ErrorCategory, message: impl Into<String>) -> Self {
        CaptureError::Unexplainable {
            category,
            message: message.into(),
        }
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        CaptureError::Transient(err.into())
    }
}

/// Produces a hierarchical plan for a statement without executing it.
#[async_trait]
pub trait PlanCapture: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    async fn capture(&self, text: &str) -> std::result::Result<CapturedPlan, CaptureError>;
}

/// What happened to one pending statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainOutcome {
    Explained(crate::db::ExplainId),
    /// Someone else resolved the statement first.
    Skipped,
    Unexplainable,
    /// Left pending; retried on a later poll.
    Deferred,
}

/// Captures and persists plans for statements flagged pending-explain.
pub struct Explainer {
    store: Arc<dyn PlanStore>,
    capture: Arc<dyn PlanCapture>,
    batch_size: usize,
}

impl Explainer {
    pub fn new(store: Arc<dyn PlanStore>, capture: Arc<dyn PlanCapture>, batch_size: usize) -> Self {
        Self {
            store,
            capture,
            batch_size,
        }
    }

    /// One poll: explain one batch of pending statements, in store order.
    ///
    /// Returns how many statements left pending-explain. Deferred statements
    /// are moved behind the rest of the queue and do not count.
    pub async fn explain_pending(&self) -> Result<usize> {
        let statements = self.store.statements_to_explain(self.batch_size).await?;
        if statements.is_empty() {
            debug!("no statements to explain");
            return Ok(0);
        }

        info!(count = statements.len(), "explaining statements");
        let mut resolved = 0;
        for statement in &statements {
            if self.explain_statement(statement).await != ExplainOutcome::Deferred {
                resolved += 1;
                continue;
            }
            if let Err(err) = self.store.defer_explain(&statement.id, Utc::now()).await {
                warn!(statement = %statement.id, error = %err, "could not defer statement");
            }
        }
        Ok(resolved)
    }

    pub async fn explain_statement(&self, statement: &Statement) -> ExplainOutcome {
        let captured = match self.capture.capture(&statement.text).await {
            Ok(captured) => captured,
            Err(CaptureError::Unexplainable { category, message }) => {
                warn!(statement = %statement.id, %category, %message, "statement is unexplainable");
                return match self.store.mark_unexplainable(&statement.id).await {
                    Ok(()) => ExplainOutcome::Unexplainable,
                    Err(err) => {
                        warn!(statement = %statement.id, error = %err, "could not mark unexplainable");
                        ExplainOutcome::Deferred
                    }
                };
            }
            Err(err) => {
                warn!(statement = %statement.id, capture = self.capture.name(), error = %err, "could not capture plan");
                return ExplainOutcome::Deferred;
            }
        };

        let graph = serializer::serialize(&captured);
        match self.store.persist_plan(&statement.id, &graph).await {
            Ok(Some(explain_id)) => {
                debug!(statement = %statement.id, explain_id, nodes = graph.nodes.len(), "saved plan");
                ExplainOutcome::Explained(explain_id)
            }
            Ok(None) => {
                debug!(statement = %statement.id, "statement no longer pending");
                ExplainOutcome::Skipped
            }
            Err(err) => {
                warn!(statement = %statement.id, error = %err, "could not save plan");
                ExplainOutcome::Deferred
            }
        }
    }
}
