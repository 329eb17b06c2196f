use serde_json::{json, Value};

/// The error type shared by every operation in the crate.
///
/// Each variant maps to a machine-readable `reason` string that the
/// transport layer puts on the wire; some carry a structured payload
/// (e.g. the per-id reason map produced by batched node lookups).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{msg}")]
    BadRequest { msg: String, data: Option<Value> },

    /// The id is syntactically impossible (digits overflow the id width)
    /// or an mrca form whose sides could not be parsed.
    #[error("node_id '{id}' was not found!")]
    UnknownId { id: String },

    /// Not known to the current taxonomy and not in the forward table.
    #[error("ott id {id} is neither a current id nor a forwarded id")]
    InvalidOttId { id: String },

    /// Known to the taxonomy but absent from the chosen summary tree.
    #[error("ott id {id} is not in the summary tree")]
    PrunedOttId { id: String },

    /// A broken taxon, surfaced as an error only when the caller asked to
    /// fail on broken ids; carries the structured broken payload.
    #[error("node_id '{id}' was not found (broken taxon)")]
    Broken { id: String, data: Value },

    #[error("node_id '{id}' matches neither ott<id> nor mrcaott<id>ott<id>")]
    NotFound { id: String },

    /// Mutually exclusive arguments were both supplied.
    #[error("{msg}")]
    Conflict { msg: String },

    #[error("the requested subtree is too large to be returned (tip limit = {limit})")]
    TooLarge { limit: u32 },

    #[error("failed to load {msg} at line {line}")]
    ImportError { line: usize, msg: String },

    /// An internal invariant was violated; report as a bug.
    #[error("internal error: {msg}")]
    Internal { msg: String },
}

impl Error {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Error::BadRequest {
            msg: msg.into(),
            data: None,
        }
    }

    pub fn bad_request_with<S: Into<String>>(msg: S, data: Value) -> Self {
        Error::BadRequest {
            msg: msg.into(),
            data: Some(data),
        }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal { msg: msg.into() }
    }

    /// The machine-readable reason string for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::BadRequest { .. } => "bad_request",
            Error::UnknownId { .. } => "unknown_id",
            Error::InvalidOttId { .. } => "invalid_ott_id",
            Error::PrunedOttId { .. } => "pruned_ott_id",
            Error::Broken { .. } => "broken",
            Error::NotFound { .. } => "node_id_not_found",
            Error::Conflict { .. } => "conflicting_arguments",
            Error::TooLarge { .. } => "too_large",
            Error::ImportError { .. } => "import_error",
            Error::Internal { .. } => "internal_error",
        }
    }

    /// Render the error as the structured blob handed to the transport.
    pub fn to_json(&self) -> Value {
        let mut j = json!({
            "message": self.to_string(),
            "reason": self.reason(),
        });
        let extra = match self {
            Error::BadRequest { data, .. } => data.clone(),
            Error::Broken { data, .. } => Some(data.clone()),
            _ => None,
        };
        if let Some(Value::Object(map)) = extra {
            for (k, v) in map {
                j[k] = v;
            }
        }
        j
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::ImportError {
            line: error.line(),
            msg: error.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::ImportError {
            line: 0,
            msg: error.to_string(),
        }
    }
}

/// A wrapper type for treequery results.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(
            Error::InvalidOttId { id: "ott99".into() }.reason(),
            "invalid_ott_id"
        );
        assert_eq!(Error::TooLarge { limit: 25000 }.reason(), "too_large");
    }

    #[test]
    fn test_structured_payload() {
        let e = Error::bad_request_with(
            "node_id 'ott5' was not found!",
            json!({"unknown": {"ott5": "pruned_ott_id"}}),
        );
        let j = e.to_json();
        assert_eq!(j["reason"], "bad_request");
        assert_eq!(j["unknown"]["ott5"], "pruned_ott_id");
    }
}
