//! The custom URL scheme that launches the handler.
//!
//! ```text
//! sgrlhiop:16c1d49fff02d53fbccd9147a21791d0:echo?fancy=seeing%20you%20here&tell%20me=more
//! ^        ^                                ^    ^
//! |        |                                |    +-- command parameters, url encoded
//! |        |                                +------- the command to execute
//! |        +---------------------------------------- the callback id (may be empty)
//! +------------------------------------------------- the scheme
//! ```

use crate::request::CommandRequest;

/// The scheme registered for the handler.
pub const SCHEME: &str = "sgrlhiop";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("URL does not use the {SCHEME}: scheme")]
    WrongScheme,
    #[error("Custom url call malformed: {0}")]
    Malformed(&'static str),
    #[error("Invalid percent escape in {0:?}")]
    BadEscape(String),
}

/// Parses a launch URL into the request it describes.
pub fn parse(url: &str) -> Result<CommandRequest, Error> {
    let mut segments = url.splitn(3, ':');
    let scheme = segments.next().unwrap_or_default();
    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return Err(Error::WrongScheme);
    }
    let callback_id = segments
        .next()
        .ok_or(Error::Malformed("missing callback id separator"))?;
    let rest = segments
        .next()
        .ok_or(Error::Malformed("missing command separator"))?;

    let (command, query) = match rest.split_once('?') {
        Some((command, query)) => (command, Some(query)),
        None => (rest, None),
    };
    if command.is_empty() {
        return Err(Error::Malformed("empty command"));
    }

    let callback_id = if callback_id.is_empty() {
        None
    } else {
        Some(callback_id.to_string())
    };
    let mut request = CommandRequest::new(command, callback_id);
    if let Some(query) = query {
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            request
                .parameters
                .insert(url_decode(key)?, url_decode(value)?);
        }
    }
    Ok(request)
}

/// Decodes `%XX` escapes and `+` as space.
pub fn url_decode(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| Error::BadEscape(s.to_string()))?;
                out.push(hex);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}
