use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("upstream http: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("login failed with status {0}")]
    Login(reqwest::StatusCode),
    #[error("login response lacks the {0} cookie")]
    MissingCookie(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("query {operation} failed with status {status}")]
    Status {
        operation: String,
        status: reqwest::StatusCode,
    },
    #[error("graphql errors in {operation}: {messages:?}")]
    GraphQl {
        operation: String,
        messages: Vec<String>,
    },
    #[error("{0} reported success: false")]
    Unsuccessful(String),
    #[error("malformed response for {operation}: missing {field}")]
    MalformedResponse {
        operation: String,
        field: &'static str,
    },
}

impl Error {
    pub(crate) fn malformed(operation: &str, field: &'static str) -> Self {
        Error::MalformedResponse {
            operation: operation.to_string(),
            field,
        }
    }

    /// Whether a fresh session might make the same request succeed.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }
}
