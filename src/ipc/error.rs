use crate::calc::InvalidInputError;
use serde_json::json;

/// A failed request, carried up to the router as the `error` member of the
/// response envelope.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn no_workspace() -> Self {
        Self::new("no_workspace", "select a workspace first")
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn query(e: impl ToString) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn insert(e: impl ToString, table: &str) -> Self {
        Self::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn update(e: impl ToString, table: &str) -> Self {
        Self::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn delete(e: impl ToString, table: &str) -> Self {
        Self::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn tx(e: impl ToString) -> Self {
        Self::new("db_tx_failed", e.to_string())
    }

    pub fn commit(e: impl ToString) -> Self {
        Self::new("db_commit_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        json!({ "id": id, "ok": false, "error": error })
    }
}

impl From<InvalidInputError> for HandlerErr {
    fn from(e: InvalidInputError) -> Self {
        HandlerErr::new(e.code(), e.to_string()).with_details(e.details())
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(
    id: &str,
    code: &'static str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    HandlerErr {
        code,
        message: message.into(),
        details,
    }
    .response(id)
}
