//! Result envelope decoding.

use serde_json::{Deserializer, Value};

use crate::ResultEnvelope;

/// Decode the outcome of a call from its collected output.
///
/// Precedence:
/// 1. the last top-level JSON object in `output` that has a `success` key
/// 2. non-empty `residual` diagnostic text, as a failure
/// 3. non-empty `output` parsed as bare JSON, or else as trimmed text
/// 4. success with no value
///
/// Output printed by the called code before the envelope is tolerated, but
/// if that code itself prints a JSON object with a `success` key *after* the
/// runner's envelope it would be taken as the envelope.
#[must_use]
pub fn decode(output: &[u8], residual: &str) -> ResultEnvelope {
    let text = String::from_utf8_lossy(output);

    if let Some(envelope) = find_envelope(&text) {
        return envelope;
    }

    if !residual.trim().is_empty() {
        return ResultEnvelope::Failure(crate::protocol::RemoteFailure {
            message: residual.trim().to_string(),
            ..Default::default()
        });
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ResultEnvelope::Success(Value::Null);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => ResultEnvelope::Success(value),
        Err(_) => ResultEnvelope::Success(Value::String(trimmed.to_string())),
    }
}

/// Scan for top-level JSON objects and keep the last one with a `success` key.
///
/// Objects nested inside an already-parsed object are skipped, so a result
/// that itself contains `success` does not shadow its envelope.
///
/// A candidate that runs off the end of the text is unterminated, and so is
/// every candidate nested inside it; the scan resumes on the next line.
/// Runners print their envelope on a line of its own, which keeps the scan
/// linear in the output size.
fn find_envelope(text: &str) -> Option<ResultEnvelope> {
    let mut found = None;
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream = Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                if let Some(envelope) = ResultEnvelope::from_json(&value) {
                    found = Some(envelope);
                }
                pos = start + stream.byte_offset();
            }
            Some(Err(err)) if err.is_eof() => {
                pos = text[start..]
                    .find('\n')
                    .map_or(text.len(), |newline| start + newline + 1);
            }
            _ => pos = start + 1,
        }
    }

    found
}
