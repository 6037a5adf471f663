//! Tolerant decoding of collection API responses.
//!
//! The backend's success shape is not fixed. On a 2xx status:
//! 1. a strict `{ "success": bool, "message": string }` body is honoured;
//! 2. any other JSON object is scanned for a `success` flag, a `status`
//!    string, or an `ok` flag, in that order, and counts as success when
//!    none is present;
//! 3. anything else is success with the raw body as the message.
//!
//! Every non-2xx status is an HTTP failure carrying the status and body.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{TransmissionError, TransmissionOutcome};

const DEFAULT_MESSAGE: &str = "accepted";

/// Status strings meaning success.
const SUCCESS_STATUSES: [&str; 6] = ["success", "ok", "accepted", "created", "received", "queued"];

/// Status strings meaning the server refused the payload.
const FAILURE_STATUSES: [&str; 4] = ["error", "failed", "failure", "rejected"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrictResponse {
    success: bool,
    message: String,
    #[serde(default, alias = "records_processed", alias = "processed")]
    records_processed: Option<u64>,
}

/// Map a status code and body to an outcome.
///
/// `records_sent` is reported when the server does not state how many
/// records it processed.
pub fn interpret_response(status: u16, body: &str, records_sent: u64) -> TransmissionOutcome {
    if !(200..300).contains(&status) {
        return TransmissionOutcome::failure(TransmissionError::Http {
            status,
            body: body.to_string(),
        });
    }

    if let Ok(strict) = serde_json::from_str::<StrictResponse>(body) {
        return if strict.success {
            TransmissionOutcome::success(
                strict.records_processed.unwrap_or(records_sent),
                strict.message,
            )
        } else {
            TransmissionOutcome::failure(TransmissionError::Rejected {
                status,
                message: strict.message,
            })
        };
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(obj)) => interpret_object(status, &obj, body, records_sent),
        _ => {
            let text = body.trim();
            let message = if text.is_empty() { DEFAULT_MESSAGE } else { text };
            TransmissionOutcome::success(records_sent, message)
        }
    }
}

fn interpret_object(
    status: u16,
    obj: &Map<String, Value>,
    body: &str,
    records_sent: u64,
) -> TransmissionOutcome {
    let message = obj
        .get("message")
        .or_else(|| obj.get("detail"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let records = ["recordsProcessed", "records_processed", "processed", "count"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .unwrap_or(records_sent);

    match success_signal(obj) {
        Some(false) => TransmissionOutcome::failure(TransmissionError::Rejected {
            status,
            message: message.unwrap_or_else(|| body.to_string()),
        }),
        Some(true) | None => {
            TransmissionOutcome::success(records, message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()))
        }
    }
}

/// The first recognizable success signal in a generic body.
fn success_signal(obj: &Map<String, Value>) -> Option<bool> {
    if let Some(flag) = obj.get("success").and_then(Value::as_bool) {
        return Some(flag);
    }
    if let Some(status) = obj.get("status").and_then(Value::as_str) {
        let status = status.trim().to_ascii_lowercase();
        if SUCCESS_STATUSES.contains(&status.as_str()) {
            return Some(true);
        }
        if FAILURE_STATUSES.contains(&status.as_str()) {
            return Some(false);
        }
    }
    obj.get("ok").and_then(Value::as_bool)
}
