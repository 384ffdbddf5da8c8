//! Response body decoding
//!
//! The control plane usually wraps payloads as `{"code", "message", "data"}`.
//! A body only counts as an envelope when it has that shape and a non-empty
//! `message`; anything else is decoded directly as the payload.

use nimbus_core::error::{NimbusError, NimbusResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

pub fn decode_payload<T>(operation: &str, body: &[u8]) -> NimbusResult<T>
where
    T: DeserializeOwned + Default,
{
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(body) {
        if !envelope.message.is_empty() {
            if envelope.code != 0 {
                return Err(NimbusError::UpstreamApplication {
                    code: envelope.code,
                    message: envelope.message,
                });
            }
            return match envelope.data {
                None | Some(serde_json::Value::Null) => Ok(T::default()),
                Some(data) => serde_json::from_value(data).map_err(|e| NimbusError::Decode {
                    operation: operation.to_string(),
                    details: format!("envelope data: {}", e),
                }),
            };
        }
    }

    serde_json::from_slice(body).map_err(|e| NimbusError::Decode {
        operation: operation.to_string(),
        details: format!("response body: {}", e),
    })
}
