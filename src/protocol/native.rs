//! Identity adapter for workers that speak [`RpcEnvelope`] directly.

use serde_json::Value;
use tracing::debug;

use super::{ProtocolAdapter, RpcEnvelope};

/// Passes envelopes through, dropping anything that does not deserialize.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAdapter;

impl ProtocolAdapter for NativeAdapter {
    fn to_internal(&self, external: &Value) -> Option<RpcEnvelope> {
        match serde_json::from_value::<RpcEnvelope>(external.clone()) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                debug!(error = %err, "native adapter: unrecognized message dropped");
                None
            }
        }
    }

    fn to_external(&self, internal: &RpcEnvelope) -> Value {
        // Serializing a closed enum of JSON values cannot fail.
        serde_json::to_value(internal).unwrap_or(Value::Null)
    }
}
