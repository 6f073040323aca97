use std::fmt;

use async_trait::async_trait;
use color_eyre::eyre::{Result, bail};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};

pub mod client;
pub mod compile;
pub mod cycle;
pub mod field_types;
pub mod flatten;
mod instrumentation;
pub mod query;
pub mod record;
pub mod spec;

use esquery_common::metrics::{
    ERROR_COMPILE, ERROR_PARTIAL_PARSE, ERROR_SCHEMA, ERROR_TIMEOUT, ERROR_TRANSPORT,
    ERROR_UNKNOWN,
};
use field_types::FieldType;
use spec::MetricFunction;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("index pattern '{0}' matches no indices")]
    NoMatchingIndices(String),

    #[error("field '{field}' not found in any index matching '{index}'")]
    FieldNotFound { index: String, field: String },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot compute {function} of field '{field}' with non-numeric type '{field_type}'")]
    NonNumericField {
        field: String,
        field_type: FieldType,
        function: MetricFunction,
    },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bad response status ({0}): {1}")]
    ServerResp(u16, String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("deadline exceeded while waiting for {0}")]
    Timeout(&'static str),

    #[error("search timed out on the engine before every shard answered")]
    SearchTimedOut,

    #[error("response does not match the aggregation tree: {0}")]
    PartialParse(String),
}

/// Coarse classification of a pipeline failure, used for reporting and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Compile,
    Transport,
    Timeout,
    PartialParse,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Schema => ERROR_SCHEMA,
            ErrorKind::Compile => ERROR_COMPILE,
            ErrorKind::Transport => ERROR_TRANSPORT,
            ErrorKind::Timeout => ERROR_TIMEOUT,
            ErrorKind::PartialParse => ERROR_PARTIAL_PARSE,
        }
    }

    /// Finds the typed error inside a report, looking through any added context.
    pub fn of(report: &color_eyre::Report) -> Option<ErrorKind> {
        if let Some(e) = report.downcast_ref::<QueryError>() {
            return Some(e.kind());
        }
        if report.downcast_ref::<SchemaError>().is_some() {
            return Some(ErrorKind::Schema);
        }
        if report.downcast_ref::<CompileError>().is_some() {
            return Some(ErrorKind::Compile);
        }
        None
    }

    pub fn label_of(report: &color_eyre::Report) -> &'static str {
        Self::of(report).map_or(ERROR_UNKNOWN, |kind| kind.label())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Schema(_) => ErrorKind::Schema,
            QueryError::Compile(_) => ErrorKind::Compile,
            QueryError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            QueryError::Http(_) | QueryError::ServerResp(..) | QueryError::MalformedResponse(_) => {
                ErrorKind::Transport
            }
            QueryError::Timeout(_) | QueryError::SearchTimedOut => ErrorKind::Timeout,
            QueryError::PartialParse(_) => ErrorKind::PartialParse,
        }
    }
}

/// The search engine as seen by the aggregation pipelines.
///
/// Implementations own every connection-level concern (node selection, auth, TLS, health
/// checking), and must be safe to share between concurrently running pipelines.
#[async_trait]
pub trait SearchEngine: fmt::Debug + Send + Sync {
    /// Returns the raw field mapping response (`GET /{index}/_mapping/field/{fields}`), keyed by
    /// concrete index name.
    async fn field_mappings(&self, index: &str, fields: &[String]) -> Result<Value>;

    /// Runs a search request body against `index` and returns the raw response.
    async fn search(&self, index: &str, body: &Value) -> Result<Value>;
}

/// Awaits `fut` until `deadline`, turning expiry into a [`QueryError::Timeout`].
pub(crate) async fn with_deadline<T, F>(
    deadline: Instant,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => bail!(QueryError::Timeout(operation)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::eyre::{Context, eyre};

    use super::*;

    #[test]
    fn kind_is_found_through_context() {
        let report = Err::<(), _>(eyre!(QueryError::PartialParse("missing".to_string())))
            .context("flatten response")
            .context("pipeline")
            .unwrap_err();
        assert_eq!(ErrorKind::of(&report), Some(ErrorKind::PartialParse));
        assert_eq!(ErrorKind::label_of(&report), ERROR_PARTIAL_PARSE);
    }

    #[test]
    fn unknown_errors_have_no_kind() {
        let report = eyre!("something else");
        assert_eq!(ErrorKind::of(&report), None);
        assert_eq!(ErrorKind::label_of(&report), ERROR_UNKNOWN);
    }

    #[test]
    fn schema_error_is_classified() {
        let report = eyre!(QueryError::from(SchemaError::NoMatchingIndices(
            "nothing-*".to_string()
        )));
        assert_eq!(ErrorKind::of(&report), Some(ErrorKind::Schema));
        assert_eq!(
            report.to_string(),
            "index pattern 'nothing-*' matches no indices"
        );
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_timeout() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let result = with_deadline(deadline, "search", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn result_before_deadline_passes_through() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let value = with_deadline(deadline, "search", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
