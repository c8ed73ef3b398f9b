//! RFC 6455 opening handshake: request construction and response validation.

use crate::config::ClientConfig;
use crate::error::Error;
use crate::transport::Transport;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::random;
use sha1::{Digest, Sha1};
use url::Url;

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_RESPONSE_SIZE: usize = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 32;

pub(crate) fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = random();
    BASE64_STANDARD.encode(random_bytes)
}

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Rewrites a `ws`/`wss` URL to its `http`/`https` equivalent. `http` and
/// `https` are accepted as-is.
pub(crate) fn parse_ws_url(ws_url: &str) -> Result<Url, Error> {
    let mut parsed_url = Url::parse(ws_url)?;
    match parsed_url.scheme() {
        "ws" => parsed_url
            .set_scheme("http")
            .map_err(|_| Error::InvalidSchemeURL)?,
        "wss" => parsed_url
            .set_scheme("https")
            .map_err(|_| Error::InvalidSchemeURL)?,
        "http" | "https" => {}
        _ => return Err(Error::InvalidSchemeURL),
    }
    if parsed_url.host_str().is_none() {
        return Err(Error::URLNoHost);
    }
    Ok(parsed_url)
}

pub(crate) fn effective_port(url: &Url) -> u16 {
    url.port().unwrap_or(if url.scheme() == "https" { 443 } else { 80 })
}

/// Builds the Upgrade GET request for the given (already rewritten) URL.
pub(crate) fn construct_http_request(url: &Url, key: &str, config: &ClientConfig) -> Result<String, Error> {
    let host = url.host_str().ok_or(Error::URLNoHost)?;

    // The Host field carries the port only when the URL spelled one out.
    let request_host_field = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };

    let request_path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path,
        request_host_field,
        key,
    );

    if let Some(subprotocols) = &config.subprotocols {
        request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocols));
    }
    if let Some(username) = &config.username {
        let credentials = format!("{}:{}", username, config.password.as_deref().unwrap_or(""));
        request.push_str(&format!(
            "Authorization: Basic {}\r\n",
            BASE64_STANDARD.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    Ok(request)
}

/// Outcome of a verified 101 response.
pub(crate) struct UpgradeResponse {
    /// Subprotocol the server selected, verbatim.
    pub subprotocol: Option<String>,
    /// Bytes read past the end of the HTTP response; these belong to the
    /// first WebSocket frame.
    pub overread: Vec<u8>,
}

/// Reads and verifies the server's Upgrade response: status 101, the three
/// required headers each present exactly once with the expected values, and
/// `Sec-WebSocket-Protocol` only if we offered one.
pub(crate) fn read_upgrade_response(
    transport: &mut dyn Transport,
    key: &str,
    allow_subprotocol: bool,
    timeout_ms: u32,
) -> Result<UpgradeResponse, Error> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = transport.read(&mut chunk, timeout_ms)?;
        if n == 0 {
            return Err(Error::IncompleteHTTPResponse);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf)? {
            httparse::Status::Complete(header_len) => {
                let outcome = verify_response(&response, key, allow_subprotocol)?;
                return Ok(UpgradeResponse {
                    subprotocol: outcome,
                    overread: buf[header_len..].to_vec(),
                });
            }
            httparse::Status::Partial => {
                // Limit the maximum amount of data read, so a misbehaving
                // server can't grow the buffer without bound.
                if buf.len() > MAX_RESPONSE_SIZE {
                    return Err(Error::IncompleteHTTPResponse);
                }
            }
        }
    }
}

fn verify_response(
    response: &httparse::Response,
    key: &str,
    allow_subprotocol: bool,
) -> Result<Option<String>, Error> {
    match response.code {
        Some(101) => {}
        Some(code) => return Err(Error::BadHandshakeStatus(code)),
        None => return Err(Error::IncompleteHTTPResponse),
    }

    let expected_accept = generate_websocket_accept_value(key);

    let mut got_upgrade = false;
    let mut got_connection = false;
    let mut got_accept = false;
    let mut subprotocol: Option<String> = None;

    for header in response.headers.iter() {
        let value = std::str::from_utf8(header.value).map_err(|_| Error::InvalidData)?;

        if header.name.eq_ignore_ascii_case("Upgrade") {
            if got_upgrade {
                return Err(Error::DuplicateHeader("Upgrade"));
            }
            if !value.eq_ignore_ascii_case("websocket") {
                return Err(Error::NoUpgradeHeaderPresent);
            }
            got_upgrade = true;
        } else if header.name.eq_ignore_ascii_case("Connection") {
            if got_connection {
                return Err(Error::DuplicateHeader("Connection"));
            }
            if !value.eq_ignore_ascii_case("Upgrade") {
                return Err(Error::NoConnectionHeaderPresent);
            }
            got_connection = true;
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Accept") {
            if got_accept {
                return Err(Error::DuplicateHeader("Sec-WebSocket-Accept"));
            }
            if value.trim() != expected_accept {
                return Err(Error::InvalidAcceptKey);
            }
            got_accept = true;
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
            if !allow_subprotocol {
                return Err(Error::UnexpectedSubprotocol);
            }
            if subprotocol.is_some() {
                return Err(Error::DuplicateHeader("Sec-WebSocket-Protocol"));
            }
            subprotocol = Some(value.to_string());
        }
    }

    if !got_upgrade {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !got_connection {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !got_accept {
        return Err(Error::InvalidAcceptKey);
    }

    // Even when we sent Sec-WebSocket-Protocol it's acceptable (and
    // meaningful) for the server to select none.
    Ok(subprotocol)
}
