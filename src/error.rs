use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

// Error classes mirrored in the JSON envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NoError,
    Config,
    Parse,
    RunTime,
    Insert,
    Query,
    Internode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoError,
    SyntaxError,
    GeneralError,
    GeneralConfigError,
    GeneralQueryError,
    PropertyNotFoundSchema,
    PropertyNotInTable,
    PropertyAlreadyReferenced,
    MissingFunctionEntryPoint,
    ExecCountExceeded,
    DateParseError,
    DateWithinMalformed,
    IterationError,
    SetMathParamInvalid,
    Recursion,
    RunTimeExceptionTriggered,
    ParseTimeExceptionTriggered,
    InternodeError,
    BreakDepthTooDeep,
    PartitionMigrated,
    RouteError,
    ItemNotFound,
    DataCorruption,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "no_error",
            ErrorCode::SyntaxError => "syntax_error",
            ErrorCode::GeneralError => "general_error",
            ErrorCode::GeneralConfigError => "general_config_error",
            ErrorCode::GeneralQueryError => "general_query_error",
            ErrorCode::PropertyNotFoundSchema => "property_not_found_schema",
            ErrorCode::PropertyNotInTable => "property_not_in_table",
            ErrorCode::PropertyAlreadyReferenced => "property_already_referenced",
            ErrorCode::MissingFunctionEntryPoint => "missing_function_entry_point",
            ErrorCode::ExecCountExceeded => "exec_count_exceeded",
            ErrorCode::DateParseError => "date_parse_error - expecting ISO 8601",
            ErrorCode::DateWithinMalformed => "date_within_malformed",
            ErrorCode::IterationError => "iteration_error",
            ErrorCode::SetMathParamInvalid => "set_math_param_invalid",
            ErrorCode::Recursion => "recursive loop in query code",
            ErrorCode::RunTimeExceptionTriggered => "run_time_exception_triggered",
            ErrorCode::ParseTimeExceptionTriggered => "parse_time_exception_triggered",
            ErrorCode::InternodeError => "internode_error",
            ErrorCode::BreakDepthTooDeep => "break depth too deep for current nest level",
            ErrorCode::PartitionMigrated => "partition migrated. Task could not be completed.",
            ErrorCode::RouteError => "route not found (node down?)",
            ErrorCode::ItemNotFound => "item not found",
            ErrorCode::DataCorruption => "stored block failed to decompress",
        }
    }
}

/// Crate-wide error. Carries the class/code taxonomy that the HTTP layer
/// renders as `{"error":{"class","message","detail",...}}`.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{class:?}: {detail}")]
pub struct Error {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional: Option<String>,
}

impl Error {
    pub fn new(class: ErrorClass, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            class,
            code,
            detail: detail.into(),
            additional: None,
        }
    }

    pub fn with_additional(mut self, additional: impl Into<String>) -> Self {
        self.additional = Some(additional.into());
        self
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Config, ErrorCode::GeneralConfigError, detail)
    }

    pub fn parse(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Parse, code, detail)
    }

    pub fn run_time(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::RunTime, code, detail)
    }

    pub fn query(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Query, code, detail)
    }

    pub fn insert(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Insert, ErrorCode::GeneralError, detail)
    }

    pub fn internode(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internode, code, detail)
    }

    pub fn partition_migrated(partition: usize) -> Self {
        Self::new(
            ErrorClass::Internode,
            ErrorCode::PartitionMigrated,
            format!("partition {partition} migrated during task"),
        )
    }

    pub fn route_error(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internode, ErrorCode::RouteError, detail)
    }

    pub fn corruption(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::RunTime, ErrorCode::DataCorruption, detail)
    }

    /// Retryable errors cause the query originator to re-fork with back-off
    /// rather than surfacing to the client.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::PartitionMigrated | ErrorCode::RouteError
        )
    }

    pub fn http_status(&self) -> u16 {
        match self.class {
            ErrorClass::Internode => 503,
            ErrorClass::RunTime => 500,
            _ => 400,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut inner = serde_json::json!({
            "class": self.class,
            "code": self.code,
            "message": self.code.message(),
            "detail": self.detail,
        });
        if let Some(additional) = &self.additional {
            inner["additional"] = serde_json::Value::String(additional.clone());
        }
        serde_json::json!({ "error": inner })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::run_time(ErrorCode::GeneralError, format!("IO error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::run_time(ErrorCode::GeneralError, format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_envelope() {
        let err = Error::query(ErrorCode::PropertyNotInTable, "no property 'frogs'");
        let json = err.to_json();
        assert_eq!(json["error"]["class"], "query");
        assert_eq!(json["error"]["detail"], "no property 'frogs'");
    }

    #[test]
    fn test_retryable_codes() {
        assert!(Error::partition_migrated(7).is_retryable());
        assert!(Error::route_error("node 12 gone").is_retryable());
        assert!(!Error::insert("missing id").is_retryable());
    }
}
