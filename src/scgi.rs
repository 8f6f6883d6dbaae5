//! SCGI round-tripper over an injected byte stream.
//!
//! rTorrent exposes its XML-RPC endpoint as SCGI on a unix socket. The
//! transport is handed a dial closure (in production: an SSH channel to that
//! socket) and performs one request per connection: netstring-framed header
//! block, raw body, then a CGI-style response whose first line is
//! `Status: <code> <reason>`.

use std::io::{BufRead, BufReader, Read, Write};

use crate::error::ScgiError;

pub trait ScgiStream: Read + Write + Send {}
impl<T: Read + Write + Send> ScgiStream for T {}

pub type DialFn = Box<dyn Fn() -> Result<Box<dyn ScgiStream>, ScgiError> + Send + Sync>;

pub struct ScgiRequest<'a> {
    pub method: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

#[derive(Debug)]
pub struct ScgiResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScgiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

const SERVER_PROTOCOL: &str = "HTTP/1.1";

pub struct ScgiTransport {
    dial: DialFn,
}

impl ScgiTransport {
    pub fn new(
        dial: impl Fn() -> Result<Box<dyn ScgiStream>, ScgiError> + Send + Sync + 'static,
    ) -> Self {
        ScgiTransport {
            dial: Box::new(dial),
        }
    }

    /// One request, one connection. The stream is dropped unconditionally
    /// once the response has been read.
    pub fn round_trip(&self, request: &ScgiRequest) -> Result<ScgiResponse, ScgiError> {
        let mut conn = (self.dial)()?;

        let block = header_block(request);
        write_netstring(&mut conn, &block).map_err(ScgiError::HeaderWrite)?;
        conn.write_all(request.body)
            .map_err(ScgiError::BodyWrite)?;
        conn.flush().map_err(ScgiError::BodyWrite)?;

        read_response(BufReader::new(conn))
    }
}

/// NUL-separated key/value block. The four required SCGI headers come first,
/// in their fixed order; caller headers follow, with repeated names joined by
/// commas.
pub fn header_block(request: &ScgiRequest) -> Vec<u8> {
    fn push(block: &mut Vec<u8>, key: &str, value: &str) {
        block.extend_from_slice(key.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }

    let mut block = Vec::new();
    push(&mut block, "CONTENT_LENGTH", &request.body.len().to_string());
    push(&mut block, "SCGI", "1");
    push(&mut block, "REQUEST_METHOD", request.method);
    push(&mut block, "SERVER_PROTOCOL", SERVER_PROTOCOL);

    let mut seen: Vec<(&str, String)> = Vec::new();
    for (key, value) in request.headers {
        match seen.iter_mut().find(|(k, _)| k == key) {
            Some((_, joined)) => {
                joined.push(',');
                joined.push_str(value);
            }
            None => seen.push((key, (*value).to_string())),
        }
    }
    for (key, value) in seen {
        push(&mut block, key, &value);
    }
    block
}

/// `<decimal length> ":" <bytes> ","`
pub fn write_netstring(w: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    write!(w, "{}:", data.len())?;
    w.write_all(data)?;
    w.write_all(b",")
}

fn read_response<R: BufRead>(mut reader: R) -> Result<ScgiResponse, ScgiError> {
    let first = read_line(&mut reader)?;

    let (name, rest) = first
        .split_once(": ")
        .ok_or_else(|| ScgiError::MalformedStatus(first.clone()))?;
    if name != "Status" {
        return Err(ScgiError::MissingStatus(first.clone()));
    }
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason.to_string()),
        None => (rest, String::new()),
    };
    let status: u16 = code
        .parse()
        .map_err(|_| ScgiError::BadStatusCode(first.clone()))?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(&mut reader)?;
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut body = Vec::new();
    reader.read_to_end(&mut body).map_err(ScgiError::Read)?;

    Ok(ScgiResponse {
        status,
        reason,
        headers,
        body,
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, ScgiError> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(ScgiError::Read)?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::{self, Cursor};
    use std::sync::Arc;

    /// In-memory stream: reads serve a canned response, writes are captured.
    struct FakeStream {
        response: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn transport(response: &'static [u8]) -> (ScgiTransport, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let transport = ScgiTransport::new(move || {
            Ok(Box::new(FakeStream {
                response: Cursor::new(response.to_vec()),
                written: sink.clone(),
            }) as Box<dyn ScgiStream>)
        });
        (transport, written)
    }

    #[test]
    fn test_wire_format_is_netstring_then_body() {
        let (transport, written) =
            transport(b"Status: 200 OK\r\nContent-Type: text/xml\r\n\r\nhello");
        let request = ScgiRequest {
            method: "POST",
            headers: &[("CONTENT_TYPE", "text/xml")],
            body: b"<xml/>",
        };
        let response = transport.round_trip(&request).unwrap();

        let block = header_block(&request);
        let mut expected = format!("{}:", block.len()).into_bytes();
        expected.extend_from_slice(&block);
        expected.push(b',');
        expected.extend_from_slice(b"<xml/>");
        assert_eq!(*written.lock(), expected);

        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.header("content-type"), Some("text/xml"));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_header_block_layout() {
        let request = ScgiRequest {
            method: "POST",
            headers: &[("X-ONE", "a"), ("X-ONE", "b"), ("X-TWO", "c")],
            body: b"12345",
        };
        let block = header_block(&request);
        let expected = b"CONTENT_LENGTH\x005\x00SCGI\x001\x00REQUEST_METHOD\x00POST\x00\
            SERVER_PROTOCOL\x00HTTP/1.1\x00X-ONE\x00a,b\x00X-TWO\x00c\x00";
        assert_eq!(block, expected);
    }

    #[test]
    fn test_netstring_framing() {
        let mut out = Vec::new();
        write_netstring(&mut out, b"hello").unwrap();
        assert_eq!(out, b"5:hello,");

        let mut empty = Vec::new();
        write_netstring(&mut empty, b"").unwrap();
        assert_eq!(empty, b"0:,");
    }

    #[test]
    fn test_missing_status_header() {
        let (transport, _) = transport(b"HTTP/1.1 200 OK\r\n\r\n");
        let err = transport
            .round_trip(&ScgiRequest {
                method: "POST",
                headers: &[],
                body: b"",
            })
            .unwrap_err();
        assert!(matches!(err, ScgiError::MalformedStatus(_)));
    }

    #[test]
    fn test_wrong_first_header() {
        let (transport, _) = transport(b"Content-Type: text/xml\r\n\r\n");
        let err = transport
            .round_trip(&ScgiRequest {
                method: "POST",
                headers: &[],
                body: b"",
            })
            .unwrap_err();
        assert!(matches!(err, ScgiError::MissingStatus(_)));
    }

    #[test]
    fn test_unparsable_status_code() {
        let (transport, _) = transport(b"Status: abc OK\r\n\r\n");
        let err = transport
            .round_trip(&ScgiRequest {
                method: "POST",
                headers: &[],
                body: b"",
            })
            .unwrap_err();
        assert!(matches!(err, ScgiError::BadStatusCode(_)));
    }

    #[test]
    fn test_dial_failure_propagates() {
        let transport = ScgiTransport::new(|| Err(ScgiError::Dial("refused".into())));
        let err = transport
            .round_trip(&ScgiRequest {
                method: "POST",
                headers: &[],
                body: b"",
            })
            .unwrap_err();
        assert!(matches!(err, ScgiError::Dial(_)));
    }
}
