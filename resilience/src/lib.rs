#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod analyzer;
pub mod budget;
pub mod executor;
pub mod normalize;
pub mod processor;

pub use analyzer::{Recommendation, RetryAnalyzer};
pub use budget::{BudgetDecision, BudgetLimits, RetryBudgetManager};
pub use executor::{RetryContext, RetryExecutor};
pub use processor::{DlqProcessor, DlqProcessorConfig};
