//! One-shot request/response relay.

use burrow_wire::{Codec, RequestDescriptor, ResponseDescriptor};
use tracing::debug;

use crate::connection::Connection;
use crate::error::ProxyError;

/// Send `request` over `conn` and wait for the agent's response.
///
/// The connection is closed and its completion signal fired on every path.
pub async fn relay_request(
    mut conn: Connection,
    request: &RequestDescriptor,
    codec: &Codec,
) -> Result<ResponseDescriptor, ProxyError> {
    let connection_id = conn.id();

    let result = async {
        let payload = codec.encode_request(request)?;
        conn.send(payload).await?;
        let reply = conn.recv().await?;
        Ok::<_, ProxyError>(codec.decode_response(&reply)?)
    }
    .await;

    conn.finish().await;

    match &result {
        Ok(response) => debug!(
            connection_id,
            status = response.status_code,
            body_bytes = response.body.len(),
            "Request relayed"
        ),
        Err(e) => debug!(connection_id, error = %e, "Request relay failed"),
    }
    result
}
