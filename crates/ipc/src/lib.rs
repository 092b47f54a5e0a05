//! The framed request/response protocol and its TLS server and client.
//!
//! One request and one response per connection; the body is JSON, the
//! status byte tells the receiver what to expect in it.

use serde_json::{
    json,
    Value as JsonValue,
};

pub mod client;
pub mod frame;
pub mod server;
pub mod status;
pub mod tls;

pub use client::JidlClient;
pub use frame::{
    Frame,
    FrameError,
    MAX_SIZE,
};
pub use server::JidlServer;
pub use status::StatusCode;

/// A decoded request: both fields optional, their presence mirrored in the
/// status byte.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Option<String>,
    pub payload: Option<JsonValue>,
}

impl Request {
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            payload: None,
        }
    }

    pub fn with_payload(method: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            method: Some(method.into()),
            payload: Some(payload),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut body = serde_json::Map::new();
        if let Some(ref method) = self.method {
            body.insert("method".to_owned(), JsonValue::from(method.clone()));
        }
        if let Some(ref payload) = self.payload {
            body.insert("payload".to_owned(), payload.clone());
        }
        Frame::new(
            StatusCode::request(self.method.is_some(), self.payload.is_some()),
            JsonValue::Object(body),
        )
    }

    /// Interprets a received frame as a request. The status byte must be a
    /// request code and the announced fields must be present.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if !frame.status.is_request() {
            return Err(FrameError::InvalidStatusCode(frame.status.as_byte()));
        }
        let body = frame.body.as_object().ok_or(FrameError::InvalidBody)?;
        let method = match (frame.status.has_method(), body.get("method")) {
            (true, Some(JsonValue::String(m))) => Some(m.clone()),
            (false, _) => None,
            _ => return Err(FrameError::InvalidBody),
        };
        let payload = match (frame.status.has_payload(), body.get("payload")) {
            (true, Some(p)) => Some(p.clone()),
            (false, _) => None,
            _ => return Err(FrameError::InvalidBody),
        };
        Ok(Self { method, payload })
    }
}

/// A server response, ready to encode.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ok,
    OkWithPayload(JsonValue),
    Bad(StatusCode),
}

impl Response {
    pub fn bad(status: StatusCode) -> Self {
        debug_assert!(status.is_bad());
        Response::Bad(status)
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Response::Ok => Frame::new(StatusCode::Ok, json!({})),
            Response::OkWithPayload(payload) => Frame::new(
                StatusCode::OkWithPayload,
                json!({ "payload": payload }),
            ),
            Response::Bad(status) => Frame::new(
                *status,
                json!({ "message": status.text_message() }),
            ),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.status.is_bad() {
            return Ok(Response::Bad(frame.status));
        }
        match frame.status {
            StatusCode::Ok => Ok(Response::Ok),
            StatusCode::OkWithPayload => {
                let payload = frame
                    .body
                    .get("payload")
                    .cloned()
                    .ok_or(FrameError::InvalidBody)?;
                Ok(Response::OkWithPayload(payload))
            },
            other => Err(FrameError::InvalidStatusCode(other.as_byte())),
        }
    }
}

/// Serves the protocol's methods against live logger state. Implementations
/// never fail; anything that cannot be handled becomes a bad response.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_frame_round_trip() {
        let request = Request::with_payload("values", json!({"c": ["a", "b"]}));
        let frame = request.to_frame();
        assert_eq!(frame.status, StatusCode::RequestWithMethodAndPayload);
        assert_eq!(Request::from_frame(&frame).unwrap(), request);

        let bare = Request {
            method: None,
            payload: None,
        };
        assert_eq!(bare.to_frame().status, StatusCode::Request);
        assert_eq!(Request::from_frame(&bare.to_frame()).unwrap(), bare);
    }

    #[test]
    fn test_request_field_mismatch_rejected() {
        // Status announces a method that the body does not carry.
        let frame = Frame::new(StatusCode::RequestWithMethod, json!({}));
        assert_eq!(Request::from_frame(&frame), Err(FrameError::InvalidBody));
    }

    #[test]
    fn test_response_frames() {
        let ok = Response::Ok.to_frame();
        assert_eq!(ok.status, StatusCode::Ok);
        assert_eq!(Response::from_frame(&ok).unwrap(), Response::Ok);

        let with_payload = Response::OkWithPayload(json!({"a::c": 5})).to_frame();
        assert_eq!(
            Response::from_frame(&with_payload).unwrap(),
            Response::OkWithPayload(json!({"a::c": 5}))
        );

        let bad = Response::bad(StatusCode::FailedRequestHandling).to_frame();
        assert_eq!(bad.body, json!({"message": "failed request handling"}));
        assert_eq!(
            Response::from_frame(&bad).unwrap(),
            Response::Bad(StatusCode::FailedRequestHandling)
        );
    }
}
