use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{detail}")]
    Status { status: u16, detail: String },
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Status { status: 404, .. })
    }
}

/// Turns an error body into one readable line. FastAPI-style validation
/// errors (`detail: [{loc, msg}]`) are flattened to `loc.path: msg; ...`.
pub fn parse_error_detail(status: u16, reason: &str, body: &str) -> String {
    let fallback = || format!("API Error ({}): {}", status, reason);

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return fallback(),
    };

    match value.get("detail") {
        Some(Value::Array(items)) => {
            return items
                .iter()
                .map(|item| {
                    let loc = item
                        .get("loc")
                        .and_then(Value::as_array)
                        .map(|parts| {
                            parts
                                .iter()
                                .map(|p| match p {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                })
                                .collect::<Vec<_>>()
                                .join(".")
                        })
                        .unwrap_or_default();
                    let msg = item.get("msg").and_then(Value::as_str).unwrap_or("");
                    format!("{}: {}", loc, msg)
                })
                .collect::<Vec<_>>()
                .join("; ");
        }
        Some(Value::String(detail)) => return detail.clone(),
        Some(other) if !other.is_null() => return other.to_string(),
        _ => {}
    }

    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return message.to_string();
    }

    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_detail_list() {
        let body = r#"{"detail":[{"loc":["query","time_range"],"msg":"value is not a valid integer"},{"loc":["body",0],"msg":"field required"}]}"#;
        assert_eq!(
            parse_error_detail(422, "Unprocessable Entity", body),
            "query.time_range: value is not a valid integer; body.0: field required"
        );
    }

    #[test]
    fn test_string_detail_and_message() {
        assert_eq!(
            parse_error_detail(404, "Not Found", r#"{"detail":"Object not found"}"#),
            "Object not found"
        );
        assert_eq!(
            parse_error_detail(500, "Internal Server Error", r#"{"message":"db down"}"#),
            "db down"
        );
    }

    #[test]
    fn test_unknown_json_and_garbage() {
        assert_eq!(parse_error_detail(400, "Bad Request", r#"{"oops":1}"#), r#"{"oops":1}"#);
        assert_eq!(
            parse_error_detail(502, "Bad Gateway", "<html>"),
            "API Error (502): Bad Gateway"
        );
    }
}
