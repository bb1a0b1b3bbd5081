//! Frames as seen by the connection read loop.

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
    /// Raw frame surfaced by the codec.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Close(_) => "close",
            Frame::Raw => "raw",
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(close) => Frame::Close(close.map(|close| CloseFrame {
                code: u16::from(close.code),
                reason: close.reason.as_str().to_owned(),
            })),
            Message::Frame(_) => Frame::Raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn converts_codec_messages() {
        assert_eq!(Frame::from(Message::text("hi")), Frame::text("hi"));
        assert_eq!(Frame::from(Message::binary(vec![1u8, 2])).kind(), "binary");

        let close = Message::Close(Some(WsCloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        }));
        assert_eq!(
            Frame::from(close),
            Frame::Close(Some(CloseFrame {
                code: 1001,
                reason: "bye".into()
            }))
        );
    }
}
