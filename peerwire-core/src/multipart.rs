//! Multipart form and `content-disposition` helpers used by the codec.

use std::convert::Infallible;

use bytes::{BufMut, Bytes, BytesMut};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::error::{PeerError, Result};
use crate::message::{Blob, FormData, FormValue, MULTIPART_CONTENT_TYPE};

/// Characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const DEFAULT_FILE_NAME: &str = "blob";

/// Build an inline `content-disposition` value for a file name.
///
/// Carries both the quoted `filename` and the RFC 5987 `filename*`
/// form so non-ASCII names survive.
pub fn content_disposition(file_name: &str) -> String {
    let quoted = file_name.replace('\\', "\\\\").replace('"', "\\\"");
    let encoded = utf8_percent_encode(file_name, URI_COMPONENT);
    format!("inline; filename=\"{quoted}\"; filename*=utf-8''{encoded}")
}

/// Extract the file name from a `content-disposition` value.
///
/// Prefers `filename*`, then `filename`, and falls back to `"blob"`.
pub fn file_name_from_disposition(value: &str) -> String {
    extended_file_name(value)
        .or_else(|| plain_file_name(value))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_owned())
}

fn find_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let lower = value.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(name) {
        let start = from + pos;
        let before = lower[..start].trim_end();
        let at_boundary = before.is_empty() || before.ends_with(';');
        let rest = lower[start + name.len()..].trim_start();
        if at_boundary && rest.starts_with('=') {
            let offset = value.len() - rest.len() + 1;
            return Some(value[offset..].trim_start());
        }
        from = start + name.len();
    }
    None
}

fn extended_file_name(value: &str) -> Option<String> {
    let raw = find_param(value, "filename*")?;
    let raw = raw.split(';').next().unwrap_or_default().trim();
    let (_charset, encoded) = raw.split_once("''")?;
    percent_decode_str(encoded.trim_matches('"'))
        .decode_utf8()
        .ok()
        .map(|name| name.into_owned())
}

fn plain_file_name(value: &str) -> Option<String> {
    let raw = find_param(value, "filename")?;
    let Some(quoted) = raw.strip_prefix('"') else {
        let name = raw.split(';').next().unwrap_or_default().trim();
        return (!name.is_empty()).then(|| name.to_owned());
    };

    let mut name = String::new();
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => name.extend(chars.next()),
            '"' => return Some(name),
            c => name.push(c),
        }
    }
    None
}

fn random_boundary() -> String {
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("----peerwire{token}")
}

/// Escape a field or file name the way browsers serialize form data.
///
/// Lossy: the parser keeps `%22`, `%0D` and `%0A` as written, so a file
/// named `a"b.txt` arrives as `a%22b.txt`.
fn escape_field(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Serialize a form as `multipart/form-data`.
///
/// Returns the content type (with a fresh random boundary) and the body.
pub fn encode_form(form: &FormData) -> (String, Bytes) {
    let boundary = random_boundary();
    let mut buf = BytesMut::new();

    for (name, value) in form.iter() {
        buf.put_slice(format!("--{boundary}\r\n").as_bytes());
        match value {
            FormValue::Text(text) => {
                buf.put_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_field(name)
                    )
                    .as_bytes(),
                );
                buf.put_slice(text.as_bytes());
            }
            FormValue::File(blob) => {
                let file_name = blob.name().unwrap_or(DEFAULT_FILE_NAME);
                let content_type = match blob.content_type() {
                    "" => "application/octet-stream",
                    other => other,
                };
                buf.put_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {content_type}\r\n\r\n",
                        escape_field(name),
                        escape_field(file_name)
                    )
                    .as_bytes(),
                );
                buf.put_slice(blob.data());
            }
        }
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("--{boundary}--\r\n").as_bytes());

    (
        format!("{MULTIPART_CONTENT_TYPE}; boundary={boundary}"),
        buf.freeze(),
    )
}

/// Parse a `multipart/form-data` body.
pub async fn decode_form(content_type: &str, body: Bytes) -> Result<FormData> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut form = FormData::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field
            .name()
            .map(str::to_owned)
            .ok_or_else(|| PeerError::Decode("multipart field without a name".into()))?;
        let value = match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                let content_type = field
                    .content_type()
                    .map(|mime| mime.to_string())
                    .unwrap_or_default();
                FormValue::File(Blob::file(file_name, content_type, field.bytes().await?))
            }
            None => FormValue::Text(field.text().await?),
        };
        form.append(name, value);
    }
    Ok(form)
}
