use std::sync::Arc;

use tracing::trace;

use crate::fastcgi::record::{self, ProtocolStatus};
use crate::server::handler::SocketHandler;

/// Largest STDOUT payload written per record.
const STDOUT_CHUNK: usize = record::MAX_CONTENT_LEN;

/// Writes a rendered HTTP response payload back to the FastCGI peer:
/// the payload split across STDOUT records, an empty STDOUT to end the
/// stream, END_REQUEST for the served id, and a CANT_MPX_CONN rejection
/// for every extra request id seen on the connection.
pub(crate) fn write_http_payload(
    handler: &Arc<SocketHandler>,
    request_id: u16,
    payload: &[u8],
    extra_request_ids: &[u16],
) -> crate::Result<()> {
    for chunk in payload.chunks(STDOUT_CHUNK) {
        handler.write(&record::encode_stdout(request_id, chunk)?);
    }
    handler.write(&record::encode_stdout(request_id, b"")?);
    handler.write(&record::encode_end_request(
        request_id,
        0,
        ProtocolStatus::RequestComplete,
    ));
    for &extra in extra_request_ids {
        trace!("rejecting multiplexed request {}", extra);
        handler.write(&record::encode_end_request(
            extra,
            0,
            ProtocolStatus::CantMpxConn,
        ));
    }
    Ok(())
}
