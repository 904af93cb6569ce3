//! JSON-lines messages between a coordinator and a slave server.
//!
//! One request per line, answered by one response line:
//! `{"op": "prepare", "credentials": {...}, "run_id": "..."}` then
//! `{"ok": true}` or `{"ok": false, "error": "..."}`.

use rowflow_types::PipelineResult;
use serde::{Deserialize, Serialize};

use super::endpoint::{RunState, SlaveJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Submit,
    Prepare,
    Start,
    Status,
    FetchResult,
    Stop,
    Cleanup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Only for [`Op::Submit`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<SlaveJob>,
}

impl Request {
    #[must_use]
    pub fn new(op: Op, credentials: Credentials, run_id: &str) -> Self {
        Self {
            op,
            credentials,
            run_id: Some(run_id.to_string()),
            job: None,
        }
    }

    #[must_use]
    pub fn submit(credentials: Credentials, job: SlaveJob) -> Self {
        Self {
            op: Op::Submit,
            credentials,
            run_id: Some(job.run_id.clone()),
            job: Some(job),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
}

impl Response {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            status: None,
            result: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            status: None,
            result: None,
        }
    }
}
