//! Percent-encoding of request and response bodies.
//!
//! The subordinate decodes with `decodeURIComponent` and encodes with
//! `encodeURIComponent`, so both directions use that character set. Space
//! must go out as `%20`: form-style `+` would reach the script as a literal
//! plus sign.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left unescaped by `encodeURIComponent`.
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

/// Encode script text for an `/eval` body.
pub fn encode(text: &str) -> String {
    utf8_percent_encode(text, URI_COMPONENT).to_string()
}

/// Decode a response body into UTF-8 text.
pub fn decode(body: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(body).map_err(|err| format!("body is not UTF-8: {err}"))?;
    percent_decode_str(text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| format!("decoded body is not UTF-8: {err}"))
}
