//! rTorrent XML-RPC adapter.
//!
//! Speaks the handful of methods the pipeline needs (`d.multicall2`,
//! `f.multicall`, `d.custom1.set`) over the SCGI transport. The XML-RPC
//! codec below covers only the value subset rTorrent produces: strings,
//! integers, booleans, arrays, and faults.

use crate::error::SyncError;
use crate::logger::SyncLog;
use crate::scgi::{ScgiRequest, ScgiTransport};

pub const VIEW_MAIN: &str = "main";

/// One rTorrent download entry as listed at startup. Only the label is ever
/// mutated, via `set_label`.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub hash: String,
    pub name: String,
    /// Base path of the payload on the remote host.
    pub path: String,
    pub size: u64,
    pub label: String,
    pub completed: bool,
    /// Unix timestamp of completion; drives dispatch order.
    pub finished: i64,
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    /// Path relative to the torrent's base path.
    pub path: String,
    pub size: u64,
}

/// The RPC surface the pipeline consumes. Stages hold this as a trait object
/// so the relabel logic can be exercised against a recording double.
pub trait TorrentRpc: Send + Sync {
    fn torrents(&self, view: &str) -> Result<Vec<Torrent>, SyncError>;
    fn files(&self, torrent: &Torrent) -> Result<Vec<TorrentFile>, SyncError>;
    fn set_label(&self, torrent: &Torrent, label: &str) -> Result<(), SyncError>;
}

pub struct RtorrentClient {
    transport: ScgiTransport,
    log: SyncLog,
}

impl RtorrentClient {
    pub fn new(transport: ScgiTransport, log: SyncLog) -> Self {
        RtorrentClient { transport, log }
    }

    fn call(&self, method: &str, params: &[Value]) -> Result<Value, SyncError> {
        let rpc_err = |reason: String| SyncError::Rpc {
            method: method.to_string(),
            reason,
        };

        self.log.trace(&format!("calling {method}"));
        let body = encode_call(method, params);
        let response = self.transport.round_trip(&ScgiRequest {
            method: "POST",
            headers: &[("CONTENT_TYPE", "text/xml")],
            body: &body,
        })?;
        if response.status != 200 {
            return Err(rpc_err(format!(
                "http status {} {}",
                response.status, response.reason
            )));
        }
        parse_response(&response.body).map_err(rpc_err)
    }
}

impl TorrentRpc for RtorrentClient {
    fn torrents(&self, view: &str) -> Result<Vec<Torrent>, SyncError> {
        const METHOD: &str = "d.multicall2";
        let params = [
            Value::str(""),
            Value::str(view),
            Value::str("d.hash="),
            Value::str("d.name="),
            Value::str("d.base_path="),
            Value::str("d.size_bytes="),
            Value::str("d.custom1="),
            Value::str("d.complete="),
            Value::str("d.timestamp.finished="),
        ];
        let rows = self.call(METHOD, &params)?;

        let rpc_err = |reason: String| SyncError::Rpc {
            method: METHOD.to_string(),
            reason,
        };
        let mut torrents = Vec::new();
        for row in rows.into_array().map_err(&rpc_err)? {
            let row = row.into_array().map_err(&rpc_err)?;
            if row.len() != 7 {
                return Err(rpc_err(format!("expected 7 fields per row, got {}", row.len())));
            }
            torrents.push(Torrent {
                hash: row[0].as_str().map_err(&rpc_err)?.to_string(),
                name: row[1].as_str().map_err(&rpc_err)?.to_string(),
                path: row[2].as_str().map_err(&rpc_err)?.to_string(),
                size: row[3].as_int().map_err(&rpc_err)? as u64,
                label: row[4].as_str().map_err(&rpc_err)?.to_string(),
                completed: row[5].as_int().map_err(&rpc_err)? != 0,
                finished: row[6].as_int().map_err(&rpc_err)?,
            });
        }
        Ok(torrents)
    }

    fn files(&self, torrent: &Torrent) -> Result<Vec<TorrentFile>, SyncError> {
        const METHOD: &str = "f.multicall";
        let params = [
            Value::str(&torrent.hash),
            Value::str(""),
            Value::str("f.path="),
            Value::str("f.size_bytes="),
        ];
        let rows = self.call(METHOD, &params)?;

        let rpc_err = |reason: String| SyncError::Rpc {
            method: METHOD.to_string(),
            reason,
        };
        let mut files = Vec::new();
        for row in rows.into_array().map_err(&rpc_err)? {
            let row = row.into_array().map_err(&rpc_err)?;
            if row.len() != 2 {
                return Err(rpc_err(format!("expected 2 fields per row, got {}", row.len())));
            }
            files.push(TorrentFile {
                path: row[0].as_str().map_err(&rpc_err)?.to_string(),
                size: row[1].as_int().map_err(&rpc_err)? as u64,
            });
        }
        Ok(files)
    }

    fn set_label(&self, torrent: &Torrent, label: &str) -> Result<(), SyncError> {
        self.call(
            "d.custom1.set",
            &[Value::str(&torrent.hash), Value::str(label)],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Array(Vec<Value>),
}

impl Value {
    fn str(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    fn as_str(&self) -> Result<&str, String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(format!("expected string, got {other:?}")),
        }
    }

    fn as_int(&self) -> Result<i64, String> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(format!("expected integer, got {other:?}")),
        }
    }

    fn into_array(self) -> Result<Vec<Value>, String> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(format!("expected array, got {other:?}")),
        }
    }
}

fn encode_call(method: &str, params: &[Value]) -> Vec<u8> {
    let mut xml = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    xml.push_str(&escape(method));
    xml.push_str("</methodName><params>");
    for param in params {
        xml.push_str("<param>");
        encode_value(&mut xml, param);
        xml.push_str("</param>");
    }
    xml.push_str("</params></methodCall>");
    xml.into_bytes()
}

fn encode_value(xml: &mut String, value: &Value) {
    xml.push_str("<value>");
    match value {
        Value::Str(s) => {
            xml.push_str("<string>");
            xml.push_str(&escape(s));
            xml.push_str("</string>");
        }
        Value::Int(n) => {
            xml.push_str("<i4>");
            xml.push_str(&n.to_string());
            xml.push_str("</i4>");
        }
        Value::Bool(b) => {
            xml.push_str("<boolean>");
            xml.push_str(if *b { "1" } else { "0" });
            xml.push_str("</boolean>");
        }
        Value::Array(items) => {
            xml.push_str("<array><data>");
            for item in items {
                encode_value(xml, item);
            }
            xml.push_str("</data></array>");
        }
    }
    xml.push_str("</value>");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse a methodResponse body into its single return value, or the fault
/// string when the server reports one.
fn parse_response(body: &[u8]) -> Result<Value, String> {
    let text = std::str::from_utf8(body).map_err(|e| format!("response is not utf-8: {e}"))?;

    if let Some(pos) = text.find("<fault>") {
        return Err(parse_fault(&text[pos..]));
    }

    let start = text
        .find("<param>")
        .ok_or_else(|| "response has no param".to_string())?;
    let mut cursor = Cursor {
        text,
        pos: start + "<param>".len(),
    };
    parse_value(&mut cursor)
}

fn parse_fault(text: &str) -> String {
    let Some(pos) = text.find("faultString") else {
        return "unparsable fault".to_string();
    };
    let rest = &text[pos..];
    let Some(start) = rest.find("<value>") else {
        return "unparsable fault".to_string();
    };
    let rest = &rest[start + "<value>".len()..];
    let Some(end) = rest.find("</value>") else {
        return "unparsable fault".to_string();
    };
    let inner = rest[..end]
        .trim()
        .trim_start_matches("<string>")
        .trim_end_matches("</string>");
    unescape(inner.trim())
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self
            .rest()
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            let seen: String = self.rest().chars().take(40).collect();
            Err(format!("expected {token} at {seen:?}"))
        }
    }

    /// Consume text up to and including `token`, returning the text before it.
    fn take_until(&mut self, token: &str) -> Result<&'a str, String> {
        match self.rest().find(token) {
            Some(idx) => {
                let taken = &self.rest()[..idx];
                self.pos += idx + token.len();
                Ok(taken)
            }
            None => Err(format!("missing closing {token}")),
        }
    }
}

fn parse_value(cursor: &mut Cursor) -> Result<Value, String> {
    cursor.skip_ws();
    cursor.expect("<value>")?;
    cursor.skip_ws();

    if cursor.eat("<string>") {
        let text = cursor.take_until("</string>")?;
        let value = Value::Str(unescape(text));
        cursor.skip_ws();
        cursor.expect("</value>")?;
        return Ok(value);
    }

    for int_tag in ["i4", "i8", "int"] {
        if cursor.eat(&format!("<{int_tag}>")) {
            let text = cursor.take_until(&format!("</{int_tag}>"))?;
            let n: i64 = text
                .trim()
                .parse()
                .map_err(|e| format!("bad integer {text:?}: {e}"))?;
            cursor.skip_ws();
            cursor.expect("</value>")?;
            return Ok(Value::Int(n));
        }
    }

    if cursor.eat("<boolean>") {
        let text = cursor.take_until("</boolean>")?;
        let value = Value::Bool(text.trim() == "1");
        cursor.skip_ws();
        cursor.expect("</value>")?;
        return Ok(value);
    }

    if cursor.eat("<array>") {
        cursor.skip_ws();
        cursor.expect("<data>")?;
        let mut items = Vec::new();
        loop {
            cursor.skip_ws();
            if cursor.eat("</data>") {
                break;
            }
            items.push(parse_value(cursor)?);
        }
        cursor.skip_ws();
        cursor.expect("</array>")?;
        cursor.skip_ws();
        cursor.expect("</value>")?;
        return Ok(Value::Array(items));
    }

    // Untyped value text is a string.
    let text = cursor.take_until("</value>")?;
    Ok(Value::Str(unescape(text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_call_layout() {
        let body = encode_call("d.custom1.set", &[Value::str("HASH"), Value::str("sync")]);
        let text = String::from_utf8(body).unwrap();
        assert_eq!(
            text,
            "<?xml version=\"1.0\"?><methodCall><methodName>d.custom1.set</methodName>\
             <params><param><value><string>HASH</string></value></param>\
             <param><value><string>sync</string></value></param></params></methodCall>"
        );
    }

    #[test]
    fn test_encode_escapes_markup() {
        let body = encode_call("m", &[Value::str("a<b&c>d")]);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("<string>a&lt;b&amp;c&gt;d</string>"));
    }

    #[test]
    fn test_parse_multicall_rows() {
        let body = br#"<?xml version="1.0"?>
            <methodResponse><params><param><value><array><data>
              <value><array><data>
                <value><string>ABCD</string></value>
                <value><string>linux.iso</string></value>
                <value><i8>1024</i8></value>
                <value><i8>1</i8></value>
              </data></array></value>
              <value><array><data>
                <value><string>EFGH</string></value>
                <value><string>bsd.iso</string></value>
                <value><i8>2048</i8></value>
                <value><i8>0</i8></value>
              </data></array></value>
            </data></array></value></param></params></methodResponse>"#;

        let value = parse_response(body).unwrap();
        let rows = value.into_array().unwrap();
        assert_eq!(rows.len(), 2);

        let first = rows[0].clone().into_array().unwrap();
        assert_eq!(first[0].as_str().unwrap(), "ABCD");
        assert_eq!(first[2].as_int().unwrap(), 1024);
        assert_eq!(first[3].as_int().unwrap(), 1);
    }

    #[test]
    fn test_parse_bare_value_is_string() {
        let body = b"<methodResponse><params><param><value>0</value></param></params></methodResponse>";
        let value = parse_response(body).unwrap();
        assert_eq!(value.as_str().unwrap(), "0");
    }

    #[test]
    fn test_parse_fault_reports_reason() {
        let body = br#"<?xml version="1.0"?>
            <methodResponse><fault><value><struct>
              <member><name>faultCode</name><value><i4>-501</i4></value></member>
              <member><name>faultString</name><value><string>Could not find info-hash.</string></value></member>
            </struct></value></fault></methodResponse>"#;

        let reason = parse_response(body).unwrap_err();
        assert_eq!(reason, "Could not find info-hash.");
    }

    #[test]
    fn test_unescape_round_trip() {
        let original = "a<b>&\"quoted\"'s";
        assert_eq!(unescape(&escape(original)), original);
    }

    #[test]
    fn test_parse_rejects_truncated_value() {
        let body = b"<methodResponse><params><param><value><string>oops</string>";
        assert!(parse_response(body).is_err());
    }
}
