//! Request/response envelopes for asynchronous provider transports.
//!
//! A remote agent receives a [`Request`] on a request topic and answers with a
//! [`Response`] on a response topic. Correlation happens through the
//! `call-context` metadata tag, which identifies the operation kind the
//! response belongs to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Status;

/// Metadata key carrying the operation correlation tag.
pub const CALL_CONTEXT: &str = "call-context";

/// An outbound request to a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub route: String,
    pub method: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Request {
    pub fn new(route: impl Into<String>, method: impl Into<String>, body: Value) -> Self {
        Self {
            route: route.into(),
            method: method.into(),
            body,
            metadata: BTreeMap::new(),
        }
    }

    /// Tags the request with a `call-context` correlation value.
    pub fn with_call_context(mut self, context: impl Into<String>) -> Self {
        self.metadata.insert(CALL_CONTEXT.to_string(), context.into());
        self
    }
}

/// An inbound response from a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub state: Status,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            state: Status::Ok,
            body,
            metadata: BTreeMap::new(),
        }
    }

    pub fn error(state: Status, message: impl Into<String>) -> Self {
        Self {
            state,
            body: Value::String(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Tags the response with a `call-context` correlation value.
    pub fn with_call_context(mut self, context: impl Into<String>) -> Self {
        self.metadata.insert(CALL_CONTEXT.to_string(), context.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    /// The correlation tag, if any.
    pub fn call_context(&self) -> Option<&str> {
        self.metadata.get(CALL_CONTEXT).map(String::as_str)
    }

    /// The error payload as text. Non-success responses carry a stringified
    /// body.
    pub fn error_message(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
