//! Wire codec for peer messages.
//!
//! Every message is a JSON envelope `{i, t?, p}`:
//!
//! | field | meaning                                                        |
//! |-------|----------------------------------------------------------------|
//! | `i`   | correlation id                                                 |
//! | `t`   | [`MessageType`] tag, omitted for the direction's default type  |
//! | `p`   | payload, absent for ABORT_SIGNAL                               |
//!
//! The default type is REQUEST for client-to-server messages and RESPONSE
//! for server-to-client messages.
//!
//! ## Binary framing
//!
//! When a body normalizes to a non-empty binary object, its bytes are not
//! embedded in the JSON. The message becomes:
//!
//! ```text
//! [UTF-8 JSON envelope] [0xFF] [raw body bytes]
//! ```
//!
//! `0xFF` never appears in UTF-8 text, so the first one is the boundary.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{PeerError, Result};
use crate::message::{
    Blob, Body, EVENT_STREAM_CONTENT_TYPE, EncodedMessage, EventKind, EventMeta, EventPayload,
    FORM_URLENCODED_CONTENT_TYPE, INTERNAL_ORIGIN, MULTIPART_CONTENT_TYPE, MessageType, QueryParams,
    Request, Response,
};
use crate::multipart::{content_disposition, decode_form, encode_form, file_name_from_disposition};

/// Separator between the JSON envelope and raw body bytes.
pub const BINARY_SEPARATOR: u8 = 0xFF;

/// A decoded message received by the server peer.
#[derive(Debug)]
pub enum RequestMessage {
    Request(Request),
    Event(EventPayload),
    Abort,
}

/// A decoded message received by the client peer.
#[derive(Debug)]
pub enum ResponseMessage {
    Response(Response),
    Event(EventPayload),
    Abort,
}

/// Deserialize a field so that `null` is kept as `Some(Value::Null)`;
/// combined with `#[serde(default)]` only a missing field yields `None`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
struct OutEnvelope<'a, P> {
    i: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<P>,
}

#[derive(Deserialize)]
struct InEnvelope {
    i: String,
    #[serde(default)]
    t: Option<u8>,
    #[serde(default)]
    p: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct RequestPayload {
    u: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    b: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    h: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u16>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    h: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    b: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct EventWire {
    e: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<EventMeta>,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a REQUEST message.
pub fn encode_request(id: &str, request: &Request) -> Result<EncodedMessage> {
    let (headers, body, binary) = serialize_body(&request.headers, &request.body)?;
    let payload = RequestPayload {
        u: shorten_url(&request.url),
        b: body,
        h: headers,
        m: (request.method != Method::POST).then(|| request.method.as_str().to_owned()),
    };
    frame(id, None, Some(payload), binary)
}

/// Encode a RESPONSE message.
pub fn encode_response(id: &str, response: &Response) -> Result<EncodedMessage> {
    let (headers, body, binary) = serialize_body(&response.headers, &response.body)?;
    let payload = ResponsePayload {
        s: (response.status != StatusCode::OK).then(|| response.status.as_u16()),
        h: headers,
        b: body,
    };
    frame(id, None, Some(payload), binary)
}

/// Encode an EVENT_ITERATOR message.
pub fn encode_event(id: &str, event: &EventPayload) -> Result<EncodedMessage> {
    let payload = EventWire {
        e: event.event,
        d: event.data.clone(),
        m: event.meta.clone(),
    };
    frame(id, Some(MessageType::EventIterator), Some(payload), None)
}

/// Encode an ABORT_SIGNAL message.
pub fn encode_abort(id: &str) -> Result<EncodedMessage> {
    frame::<()>(id, Some(MessageType::AbortSignal), None, None)
}

fn frame<P: Serialize>(
    id: &str,
    kind: Option<MessageType>,
    payload: Option<P>,
    binary: Option<Bytes>,
) -> Result<EncodedMessage> {
    let envelope = OutEnvelope {
        i: id,
        t: kind.map(|kind| kind as u8),
        p: payload,
    };

    match binary {
        Some(data) if !data.is_empty() => {
            let json = serde_json::to_vec(&envelope).map_err(encode_error)?;
            let mut buf = BytesMut::with_capacity(json.len() + 1 + data.len());
            buf.put_slice(&json);
            buf.put_u8(BINARY_SEPARATOR);
            buf.put_slice(&data);
            Ok(EncodedMessage::Binary(buf.freeze()))
        }
        _ => serde_json::to_string(&envelope)
            .map(EncodedMessage::Text)
            .map_err(encode_error),
    }
}

fn encode_error(err: serde_json::Error) -> PeerError {
    PeerError::Encode(format!("failed to serialize message: {err}"))
}

fn shorten_url(url: &url::Url) -> String {
    let href = url.as_str();
    match href.strip_prefix(INTERNAL_ORIGIN) {
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => href.to_owned(),
    }
}

/// Normalize a body for the wire.
///
/// Returns the wire headers, the inline JSON body and the trailing binary
/// payload, if any.
fn serialize_body(
    headers: &HeaderMap,
    body: &Body,
) -> Result<(Map<String, Value>, Option<Value>, Option<Bytes>)> {
    let mut headers = headers.clone();
    let original_disposition = headers.remove(header::CONTENT_DISPOSITION);
    headers.remove(header::CONTENT_TYPE);

    let (inline, binary) = match body {
        Body::Empty => (None, None),
        Body::Json(value) => (Some(value.clone()), None),
        Body::Blob(blob) => {
            if !blob.content_type().is_empty() {
                headers.insert(header::CONTENT_TYPE, header_value(blob.content_type())?);
            }
            let disposition = match original_disposition {
                Some(value) => value,
                None => header_value(&content_disposition(blob.name().unwrap_or("blob")))?,
            };
            headers.insert(header::CONTENT_DISPOSITION, disposition);
            (None, Some(blob.data().clone()))
        }
        Body::Form(form) => {
            let (content_type, data) = encode_form(form);
            headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
            (None, Some(data))
        }
        Body::Query(query) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(FORM_URLENCODED_CONTENT_TYPE),
            );
            (Some(Value::String(query.to_string())), None)
        }
        Body::Stream(_) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE),
            );
            (None, None)
        }
    };

    Ok((headers_to_wire(&headers)?, inline, binary))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_bytes(value.as_bytes())
        .map_err(|e| PeerError::Encode(format!("invalid header value {value:?}: {e}")))
}

/// Convert headers to the wire map; repeated names become string arrays.
fn headers_to_wire(headers: &HeaderMap) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for name in headers.keys() {
        let mut values = headers
            .get_all(name)
            .iter()
            .map(|value| {
                std::str::from_utf8(value.as_bytes())
                    .map(|s| Value::String(s.to_owned()))
                    .map_err(|_| PeerError::Encode(format!("header {name} is not valid UTF-8")))
            })
            .collect::<Result<Vec<_>>>()?;
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        map.insert(name.as_str().to_owned(), value);
    }
    Ok(map)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a message received by the server peer.
///
/// An envelope without `t` is a REQUEST.
pub async fn decode_request_message(raw: EncodedMessage) -> Result<(String, RequestMessage)> {
    let (envelope, binary) = unframe(raw)?;
    let kind = message_type(envelope.t, MessageType::Request)?;
    let id = envelope.i;

    let message = match kind {
        MessageType::Request => {
            let payload: RequestPayload = parse_payload(envelope.p)?;
            let headers = headers_from_wire(payload.h)?;
            let body = deserialize_body(&headers, payload.b, binary).await?;
            RequestMessage::Request(Request {
                url: expand_url(&payload.u)?,
                method: match payload.m {
                    Some(method) => Method::from_bytes(method.as_bytes())
                        .map_err(|e| PeerError::Decode(format!("invalid method {method:?}: {e}")))?,
                    None => Method::POST,
                },
                headers,
                body,
                cancellation: None,
            })
        }
        MessageType::EventIterator => RequestMessage::Event(decode_event(envelope.p)?),
        MessageType::AbortSignal => RequestMessage::Abort,
        MessageType::Response => {
            return Err(PeerError::Decode(format!(
                "unexpected RESPONSE message for {id} on the server side"
            )));
        }
    };
    Ok((id, message))
}

/// Decode a message received by the client peer.
///
/// An envelope without `t` is a RESPONSE.
pub async fn decode_response_message(raw: EncodedMessage) -> Result<(String, ResponseMessage)> {
    let (envelope, binary) = unframe(raw)?;
    let kind = message_type(envelope.t, MessageType::Response)?;
    let id = envelope.i;

    let message = match kind {
        MessageType::Response => {
            let payload: ResponsePayload = parse_payload(envelope.p)?;
            let headers = headers_from_wire(payload.h)?;
            let body = deserialize_body(&headers, payload.b, binary).await?;
            let status = payload.s.unwrap_or(200);
            ResponseMessage::Response(Response {
                status: StatusCode::from_u16(status)
                    .map_err(|_| PeerError::Decode(format!("invalid status code {status}")))?,
                headers,
                body,
            })
        }
        MessageType::EventIterator => ResponseMessage::Event(decode_event(envelope.p)?),
        MessageType::AbortSignal => ResponseMessage::Abort,
        MessageType::Request => {
            return Err(PeerError::Decode(format!(
                "unexpected REQUEST message for {id} on the client side"
            )));
        }
    };
    Ok((id, message))
}

fn unframe(raw: EncodedMessage) -> Result<(InEnvelope, Option<Bytes>)> {
    match raw {
        EncodedMessage::Text(text) => Ok((serde_json::from_str(&text)?, None)),
        EncodedMessage::Binary(bytes) => match bytes.iter().position(|&b| b == BINARY_SEPARATOR) {
            Some(at) => {
                let envelope = serde_json::from_slice(&bytes[..at])?;
                Ok((envelope, Some(bytes.slice(at + 1..))))
            }
            None => Ok((serde_json::from_slice(&bytes)?, None)),
        },
    }
}

fn message_type(tag: Option<u8>, default: MessageType) -> Result<MessageType> {
    tag.map_or(Ok(default), MessageType::try_from)
}

fn parse_payload<P: serde::de::DeserializeOwned>(payload: Option<Value>) -> Result<P> {
    let payload = payload.ok_or_else(|| PeerError::Decode("missing message payload".into()))?;
    Ok(serde_json::from_value(payload)?)
}

fn decode_event(raw: Option<Value>) -> Result<EventPayload> {
    let wire: EventWire = parse_payload(raw)?;
    Ok(EventPayload {
        event: wire.e,
        data: wire.d,
        meta: wire.m,
    })
}

fn expand_url(u: &str) -> Result<url::Url> {
    let href = if u.starts_with('/') {
        format!("{INTERNAL_ORIGIN}{u}")
    } else {
        u.to_owned()
    };
    url::Url::parse(&href).map_err(|e| PeerError::Decode(format!("invalid url {u:?}: {e}")))
}

fn headers_from_wire(map: Map<String, Value>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(map.len());
    for (name, value) in map {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PeerError::Decode(format!("invalid header name {name:?}: {e}")))?;
        let values = match value {
            Value::String(value) => vec![value],
            Value::Array(values) => values
                .into_iter()
                .map(|value| match value {
                    Value::String(value) => Ok(value),
                    other => Err(PeerError::Decode(format!(
                        "header {name} has a non-string value: {other}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(PeerError::Decode(format!(
                    "header {name} has a non-string value: {other}"
                )));
            }
        };
        for value in values {
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| PeerError::Decode(format!("invalid value for header {name}: {e}")))?;
            headers.append(header_name.clone(), value);
        }
    }
    Ok(headers)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
}

/// Rebuild a body from its wire form, driven by the headers.
async fn deserialize_body(
    headers: &HeaderMap,
    inline: Option<Value>,
    binary: Option<Bytes>,
) -> Result<Body> {
    let content_type = header_str(headers, &header::CONTENT_TYPE).unwrap_or_default();

    if let Some(disposition) = header_str(headers, &header::CONTENT_DISPOSITION) {
        let name = file_name_from_disposition(disposition);
        return Ok(Body::Blob(Blob::file(
            name,
            content_type,
            binary.unwrap_or_default(),
        )));
    }

    if content_type.starts_with(MULTIPART_CONTENT_TYPE) {
        let form = decode_form(content_type, binary.unwrap_or_default()).await?;
        return Ok(Body::Form(form));
    }

    if content_type.starts_with(FORM_URLENCODED_CONTENT_TYPE) {
        if let Some(Value::String(query)) = &inline {
            return Ok(Body::Query(QueryParams::parse(query)));
        }
    }

    Ok(inline.map_or(Body::Empty, Body::Json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventStream, EventValue};
    use crate::message::{FormData, internal_url};
    use serde_json::json;

    fn request(path: &str) -> Request {
        Request::new(internal_url(path).unwrap())
    }

    fn text(message: &EncodedMessage) -> Value {
        serde_json::from_str(message.as_text().expect("text message")).unwrap()
    }

    async fn roundtrip_request(req: &Request) -> Request {
        let encoded = encode_request("1", req).unwrap();
        match decode_request_message(encoded).await.unwrap() {
            (id, RequestMessage::Request(request)) => {
                assert_eq!(id, "1");
                request
            }
            (_, other) => panic!("expected a request, got {other:?}"),
        }
    }

    async fn roundtrip_response(resp: &Response) -> Response {
        let encoded = encode_response("1", resp).unwrap();
        match decode_response_message(encoded).await.unwrap() {
            (_, ResponseMessage::Response(response)) => response,
            (_, other) => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn test_request_defaults_are_omitted() {
        let req = request("/planet/find").body(json!({"hello": "world"}));
        let encoded = encode_request("7", &req).unwrap();

        assert_eq!(
            text(&encoded),
            json!({"i": "7", "p": {"u": "/planet/find", "b": {"hello": "world"}}})
        );
    }

    #[test]
    fn test_request_non_defaults_are_written() {
        let req = request("/planet/list")
            .method(Method::GET)
            .header(HeaderName::from_static("x-request"), HeaderValue::from_static("1"));
        let encoded = encode_request("7", &req).unwrap();

        assert_eq!(
            text(&encoded),
            json!({"i": "7", "p": {"u": "/planet/list", "h": {"x-request": "1"}, "m": "GET"}})
        );
    }

    #[test]
    fn test_external_url_is_kept() {
        let req = Request::new(url::Url::parse("https://example.com/rpc?x=1").unwrap());
        let encoded = encode_request("1", &req).unwrap();
        assert_eq!(text(&encoded)["p"]["u"], json!("https://example.com/rpc?x=1"));
    }

    #[test]
    fn test_response_status_omitted_when_ok() {
        let encoded = encode_response("1", &Response::new(json!(null))).unwrap();
        assert_eq!(text(&encoded), json!({"i": "1", "p": {"b": null}}));

        let resp = Response::new(json!("nope")).status(StatusCode::NOT_FOUND);
        let encoded = encode_response("1", &resp).unwrap();
        assert_eq!(text(&encoded), json!({"i": "1", "p": {"s": 404, "b": "nope"}}));
    }

    #[test]
    fn test_event_and_abort_carry_type() {
        let payload = EventPayload::message(
            EventValue::new(json!("hi")).with_meta(EventMeta::new().id("id-1")),
        );
        let encoded = encode_event("3", &payload).unwrap();
        assert_eq!(
            text(&encoded),
            json!({"i": "3", "t": 3, "p": {"e": "message", "d": "hi", "m": {"id": "id-1"}}})
        );

        let encoded = encode_abort("3").unwrap();
        assert_eq!(text(&encoded), json!({"i": "3", "t": 4}));
    }

    #[tokio::test]
    async fn test_request_roundtrip_identity() {
        let req = request("/planet/create")
            .method(Method::PUT)
            .header(HeaderName::from_static("x-request"), HeaderValue::from_static("1"))
            .body(json!({"name": "earth", "moons": [1]}));

        let decoded = roundtrip_request(&req).await;
        assert_eq!(decoded.url.as_str(), "orpc://localhost/planet/create");
        assert_eq!(decoded.method, Method::PUT);
        assert_eq!(decoded.headers, req.headers);
        assert_eq!(decoded.body.as_json(), req.body.as_json());
        assert!(decoded.cancellation.is_none());
    }

    #[tokio::test]
    async fn test_null_body_differs_from_absent() {
        let decoded = roundtrip_response(&Response::new(Value::Null)).await;
        assert_eq!(decoded.body.as_json(), Some(&Value::Null));

        let decoded = roundtrip_response(&Response::default()).await;
        assert!(matches!(decoded.body, Body::Empty));
        assert_eq!(decoded.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_multi_valued_headers_roundtrip() {
        let resp = Response::default()
            .header(header::SET_COOKIE, HeaderValue::from_static("a=1"))
            .header(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let encoded = encode_response("1", &resp).unwrap();
        assert_eq!(text(&encoded)["p"]["h"]["set-cookie"], json!(["a=1", "b=2"]));

        let decoded = roundtrip_response(&resp).await;
        let cookies: Vec<_> = decoded
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn test_pdf_blob_is_binary_framed() {
        let pdf = Bytes::from_static(b"%PDF-1.7\n\xff\x00binary\xfe");
        let req = request("/upload").body(Blob::new("application/pdf", pdf.clone()));

        let encoded = encode_request("1", &req).unwrap();
        let EncodedMessage::Binary(frame) = &encoded else {
            panic!("expected a binary frame");
        };
        let at = frame.iter().position(|&b| b == 0xFF).unwrap();
        let header: Value = serde_json::from_slice(&frame[..at]).unwrap();
        assert_eq!(header["p"]["h"]["content-type"], json!("application/pdf"));
        assert_eq!(
            header["p"]["h"]["content-disposition"],
            json!("inline; filename=\"blob\"; filename*=utf-8''blob")
        );
        assert!(header["p"].get("b").is_none());
        assert_eq!(&frame[at + 1..], &pdf[..]);

        let decoded = roundtrip_request(&req).await;
        let blob = decoded.body.as_blob().unwrap();
        assert_eq!(blob.content_type(), "application/pdf");
        assert_eq!(blob.name(), Some("blob"));
        assert_eq!(blob.data(), &pdf);
    }

    #[tokio::test]
    async fn test_named_file_and_caller_disposition() {
        let resp = Response::new(Blob::file("résumé.txt", "text/plain", &b"hi"[..]));
        let decoded = roundtrip_response(&resp).await;
        assert_eq!(decoded.body.as_blob().unwrap().name(), Some("résumé.txt"));

        let resp = Response::new(Blob::new("text/plain", &b"hi"[..])).header(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"report.txt\""),
        );
        let encoded = encode_response("1", &resp).unwrap();
        let decoded = match decode_response_message(encoded).await.unwrap().1 {
            ResponseMessage::Response(response) => response,
            other => panic!("expected a response, got {other:?}"),
        };
        assert_eq!(
            decoded.headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.txt\""
        );
        assert_eq!(decoded.body.as_blob().unwrap().name(), Some("report.txt"));
    }

    #[tokio::test]
    async fn test_empty_blob_is_text() {
        let req = request("/upload").body(Blob::file(
            "empty.bin",
            "application/octet-stream",
            Bytes::new(),
        ));
        let encoded = encode_request("1", &req).unwrap();
        assert!(!encoded.is_binary());

        let decoded = roundtrip_request(&req).await;
        let blob = decoded.body.as_blob().unwrap();
        assert_eq!(blob.name(), Some("empty.bin"));
        assert!(blob.is_empty());
    }

    #[tokio::test]
    async fn test_form_roundtrip() {
        let form = FormData::new()
            .text("note", "hello")
            .file("attachment", Blob::file("a.txt", "text/plain", &b"abc"[..]));
        let req = request("/upload").body(form.clone());

        let encoded = encode_request("1", &req).unwrap();
        assert!(encoded.is_binary());

        let decoded = roundtrip_request(&req).await;
        assert_eq!(decoded.body.as_form(), Some(&form));
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let query = QueryParams::new().append("q", "rust lang").append("page", "2");
        let req = request("/search").body(query.clone());

        let encoded = encode_request("1", &req).unwrap();
        let json = text(&encoded);
        assert_eq!(json["p"]["b"], json!("q=rust+lang&page=2"));
        assert_eq!(json["p"]["h"]["content-type"], json!(FORM_URLENCODED_CONTENT_TYPE));

        let decoded = roundtrip_request(&req).await;
        assert_eq!(decoded.body.as_query(), Some(&query));
    }

    #[tokio::test]
    async fn test_stream_body_is_header_only() {
        let req = request("/chat")
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(EventStream::from_values(vec![EventValue::new(json!(1))]));

        let encoded = encode_request("1", &req).unwrap();
        let json = text(&encoded);
        assert!(json["p"].get("b").is_none());
        assert_eq!(json["p"]["h"]["content-type"], json!(EVENT_STREAM_CONTENT_TYPE));

        let decoded = roundtrip_request(&req).await;
        assert!(decoded.is_event_stream());
        assert!(matches!(decoded.body, Body::Empty));
    }

    #[tokio::test]
    async fn test_event_roundtrip_keeps_null_data() {
        let payload = EventPayload {
            event: EventKind::Done,
            data: Some(Value::Null),
            meta: None,
        };
        let encoded = encode_event("2", &payload).unwrap();
        let (id, message) = decode_response_message(encoded).await.unwrap();
        assert_eq!(id, "2");
        match message {
            ResponseMessage::Event(decoded) => assert_eq!(decoded, payload),
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_binary_without_separator_is_json() {
        let raw = EncodedMessage::from(br#"{"i":"5","t":4}"#.to_vec());
        let (id, message) = decode_request_message(raw).await.unwrap();
        assert_eq!(id, "5");
        assert!(matches!(message, RequestMessage::Abort));
    }

    #[tokio::test]
    async fn test_malformed_messages_are_decode_errors() {
        let cases = [
            EncodedMessage::from("not json"),
            EncodedMessage::from(r#"{"i":"1","t":9}"#),
            EncodedMessage::from(r#"{"i":"1"}"#),
            EncodedMessage::from(br#"{"i":"1","p":{"u":"/x""#.to_vec()),
            EncodedMessage::from(r#"{"i":"1","p":{"u":"/x","h":{"x":1}}}"#),
        ];
        for raw in cases {
            let err = decode_request_message(raw).await.unwrap_err();
            assert!(matches!(err, PeerError::Decode(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn test_direction_mismatch_is_rejected() {
        let raw = EncodedMessage::from(r#"{"i":"1","t":1,"p":{"u":"/x"}}"#);
        let err = decode_response_message(raw).await.unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));

        let raw = EncodedMessage::from(r#"{"i":"1","t":2,"p":{}}"#);
        let err = decode_request_message(raw).await.unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));
    }
}
