//! Remote error bodies

use serde::Deserialize;

use crate::Error;
use crate::transport::ApiResponse;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: Option<String>,
    error_summary: Option<String>,
    #[serde(default)]
    error_causes: Vec<ErrorCause>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorCause {
    error_summary: String,
}

/// Turn a non-success response into [`Error::Api`] carrying the remote
/// message and causes.
pub(crate) fn api_error(response: &ApiResponse) -> Error {
    let status = response.status.as_u16();
    let fallback = || {
        let text = response.text();
        if text.trim().is_empty() {
            response
                .status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        } else {
            text
        }
    };

    match response.json::<ErrorBody>() {
        Ok(body) => {
            let mut summary = body.error_summary.unwrap_or_else(fallback);
            let causes: Vec<&str> = body
                .error_causes
                .iter()
                .map(|c| c.error_summary.as_str())
                .collect();
            if !causes.is_empty() {
                summary = format!("{summary}: {}", causes.join("; "));
            }
            Error::Api {
                status,
                error_code: body.error_code,
                summary,
            }
        }
        Err(_) => Error::Api {
            status,
            error_code: None,
            summary: fallback(),
        },
    }
}
