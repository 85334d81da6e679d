//! Media-socket connection for external-media channels.
//!
//! When an external-media channel is created in server mode the switch
//! opens a socket endpoint and waits; the channel only becomes bridgeable
//! once we have dialed in. Frames on the socket are raw linear PCM, binary,
//! under the `media` subprotocol.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{SwitchError, MEDIA_CONNECT_DEADLINE};

pub type MediaSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol the switch requires on media sockets.
pub const MEDIA_SUBPROTOCOL: &str = "media";

/// Connect to the media socket at `url` within the 5 s media deadline.
pub async fn connect_media_socket(url: &str) -> Result<MediaSocket, SwitchError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SwitchError::Protocol(format!("bad media socket url: {e}")))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(MEDIA_SUBPROTOCOL),
    );

    let connect = connect_async(request);
    let (stream, _resp) = tokio::time::timeout(MEDIA_CONNECT_DEADLINE, connect)
        .await
        .map_err(|_| SwitchError::Timeout { operation: "media socket connect" })?
        .map_err(|e| SwitchError::Unavailable(format!("media socket: {e}")))?;
    Ok(stream)
}
