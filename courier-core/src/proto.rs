//! Operations exchanged between client and server, and a length-delimited
//! JSON codec for carrying them over a byte stream.

use std::{io, marker::PhantomData};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Identifies a connection on the server side. Assigned per link, so it
/// changes across reconnects.
pub type ClientId = u64;

/// Subscription id, unique per connection.
pub type Sid = u64;

/// Largest frame the codec accepts.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Sent by the server as the first frame on every link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    /// id the server assigned to this link
    pub client_id: ClientId,
    /// challenge to sign when `auth_required`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
}

/// Client half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// false asks the server not to deliver our own publishes back to us
    pub echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// signature over the server nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub lang: String,
    pub version: String,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(with = "payload")]
        payload: Bytes,
    },
    Sub {
        sid: Sid,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
    },
    Unsub {
        sid: Sid,
    },
    Ping,
    Pong,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerOp {
    Info(ServerInfo),
    /// One frame per receiving connection. Plain subscriptions are matched
    /// locally; `queue_sids` names the queue members the server picked on
    /// this connection.
    Msg {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(with = "payload")]
        payload: Bytes,
        origin: ClientId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        queue_sids: Vec<Sid>,
    },
    Ok,
    Err {
        message: String,
    },
    Ping,
    Pong,
}

impl ServerOp {
    pub fn err(message: impl Into<String>) -> Self {
        ServerOp::Err {
            message: message.into(),
        }
    }
}

mod payload {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S: Serializer>(payload: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(payload))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

/// Length-delimited JSON codec. `E` is the type written, `D` the type read.
#[derive(Debug)]
pub struct FrameCodec<E, D> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Codec used by clients.
pub type ClientCodec = FrameCodec<ClientOp, ServerOp>;
/// Codec used by servers.
pub type ServerCodec = FrameCodec<ServerOp, ClientOp>;

impl<E, D> FrameCodec<E, D> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for FrameCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Serialize, D> Encoder<E> for FrameCodec<E, D> {
    type Error = io::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

impl<E, D: DeserializeOwned> Decoder for FrameCodec<E, D> {
    type Item = D;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}
