//! JSON response shape returned to the front end.
//!
//! ```json
//! {"response": {"success": "a cat sitting on a couch"}}
//! {"response": {"error": "Invalid File Format"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::CaptionResult;

/// Envelope for every caption request outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub response: ResponseBody,
}

/// Either the caption or the error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Success(String),
    Error(String),
}

impl CaptionResponse {
    pub fn success(caption: impl Into<String>) -> Self {
        Self {
            response: ResponseBody::Success(caption.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            response: ResponseBody::Error(message.into()),
        }
    }

    /// Build from a pipeline outcome. Only the first caption is reported.
    pub fn from_result(result: Result<CaptionResult, PipelineError>) -> Self {
        match result {
            Ok(captions) => match captions.into_iter().next() {
                Some(caption) => Self::success(caption),
                None => Self::error("No caption generated"),
            },
            Err(e) => Self::error(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.response, ResponseBody::Success(_))
    }

    /// The caption or error text.
    pub fn message(&self) -> &str {
        match &self.response {
            ResponseBody::Success(s) | ResponseBody::Error(s) => s,
        }
    }
}
