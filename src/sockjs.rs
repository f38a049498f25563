use serde_json::Value;
use url::Url;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SockJsError {
    #[error("empty sockjs frame")]
    Empty,
    #[error("unknown sockjs frame type: {0}")]
    UnknownFrame(char),
    #[error("invalid sockjs payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme: {0}")]
    Scheme(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockJsFrame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

// o | h | a["m1",...] | m"m1" | c[code,"reason"]
pub fn decode(text: &str) -> Result<SockJsFrame, SockJsError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(SockJsError::Empty)?;
    let payload = chars.as_str();

    match kind {
        'o' => Ok(SockJsFrame::Open),
        'h' => Ok(SockJsFrame::Heartbeat),
        'a' => Ok(SockJsFrame::Messages(serde_json::from_str(payload)?)),
        'm' => Ok(SockJsFrame::Messages(vec![serde_json::from_str(payload)?])),
        'c' => {
            let parts: Vec<Value> = serde_json::from_str(payload)?;
            let code = parts
                .first()
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(0);
            let reason = parts
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(SockJsFrame::Close { code, reason })
        }
        other => Err(SockJsError::UnknownFrame(other)),
    }
}

pub fn encode(message: &str) -> String {
    Value::Array(vec![Value::String(message.to_string())]).to_string()
}

/// Builds the websocket URL for `endpoint` under `base`. With `sockjs` the
/// SockJS session path `/{server}/{session}/websocket` is appended.
pub fn websocket_url(base: &str, endpoint: &str, sockjs: bool) -> Result<Url, SockJsError> {
    let mut path = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    );
    if sockjs {
        let session = Uuid::new_v4();
        let server = session.as_u128() % 1000;
        path.push_str(&format!("/{server:03}/{}/websocket", session.simple()));
    }

    let mut url = Url::parse(&path)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SockJsError::Scheme(other.to_string())),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(SockJsError::Scheme(url.scheme().to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_server_frames() {
        assert_eq!(decode("o").unwrap(), SockJsFrame::Open);
        assert_eq!(decode("h").unwrap(), SockJsFrame::Heartbeat);
        assert_eq!(
            decode(r#"a["CONNECTED\nversion:1.2\n\n\u0000","x"]"#).unwrap(),
            SockJsFrame::Messages(vec!["CONNECTED\nversion:1.2\n\n\0".into(), "x".into()])
        );
        assert_eq!(
            decode(r#"c[3000,"Go away!"]"#).unwrap(),
            SockJsFrame::Close {
                code: 3000,
                reason: "Go away!".into()
            }
        );
        assert!(matches!(decode(""), Err(SockJsError::Empty)));
        assert!(matches!(decode("z"), Err(SockJsError::UnknownFrame('z'))));
    }

    #[test]
    fn encodes_client_messages_as_json_array() {
        assert_eq!(encode("\n"), r#"["\n"]"#);
        assert_eq!(encode("SEND\n\n\0"), r#"["SEND\n\n\u0000"]"#);
    }

    #[test]
    fn builds_websocket_urls() {
        let raw = websocket_url("http://localhost:8080/", "/ws", false).unwrap();
        assert_eq!(raw.as_str(), "ws://localhost:8080/ws");

        let secure = websocket_url("https://api.rft.vn", "ws", true).unwrap();
        assert_eq!(secure.scheme(), "wss");
        let segments: Vec<&str> = secure.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], "ws");
        assert_eq!(segments[1].len(), 3);
        assert_eq!(segments[3], "websocket");

        assert!(matches!(
            websocket_url("ftp://host", "ws", false),
            Err(SockJsError::Scheme(_))
        ));
    }
}
