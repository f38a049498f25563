use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid header escape in: {0}")]
    InvalidEscape(String),
    #[error("frame is missing its NUL terminator")]
    Unterminated,
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(value: &str) -> Result<Self, StompError> {
        Ok(match value {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    // CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, token: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("Authorization", format!("Bearer {token}"))
            .header("heart-beat", heart_beat.header_value())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decodes every frame in one websocket text message. Heart-beat EOLs between
/// and around frames are skipped, so a bare heart-beat yields no frames.
pub fn decode_all(text: &str) -> Result<Vec<Frame>, StompError> {
    let mut frames = Vec::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), StompError> {
    let (command_line, mut rest) = split_line(input).ok_or(StompError::Unterminated)?;
    let command = Command::parse(command_line)?;
    let mut headers = Vec::new();

    loop {
        let (line, remaining) = split_line(rest).ok_or(StompError::Unterminated)?;
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let (body, rest) = match content_length {
        Some(len) => {
            if rest.len() < len || !rest.is_char_boundary(len) || !rest[len..].starts_with('\0') {
                return Err(StompError::Unterminated);
            }
            (&rest[..len], &rest[len + 1..])
        }
        None => {
            let end = rest.find('\0').ok_or(StompError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        rest,
    ))
}

fn split_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = input[..end].strip_suffix('\r').unwrap_or(&input[..end]);
    Some((line, &input[end + 1..]))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

// `heart-beat:outgoing,incoming`, milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: u64,
    pub incoming: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub send_every: Option<Duration>,
    pub expect_within: Option<Duration>,
}

impl HeartBeat {
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            outgoing: ms,
            incoming: ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (outgoing, incoming) = value.split_once(',')?;
        Some(Self {
            outgoing: outgoing.trim().parse().ok()?,
            incoming: incoming.trim().parse().ok()?,
        })
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing, self.incoming)
    }

    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> Negotiated {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        Negotiated {
            send_every: pick(client.outgoing, server.incoming),
            expect_within: pick(client.incoming, server.outgoing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_carries_bearer_and_heart_beat() {
        let frame = Frame::connect("rft.local", "abc.def", HeartBeat::symmetric(Duration::from_secs(30)));
        let text = frame.encode();

        assert!(text.starts_with("CONNECT\n"));
        assert!(text.contains("Authorization:Bearer abc.def\n"));
        assert!(text.contains("heart-beat:30000,30000\n"));
        assert!(text.ends_with("\n\n\0"));
    }

    #[test]
    fn decodes_message_with_escaped_headers() {
        let text = "MESSAGE\nsubscription:sub-0\ndestination:/user/7/queue/refresh\nx-note:a\\cb\\nc\n\n{\"target\":\"wallet\"}\0";
        let frames = decode_all(text).unwrap();

        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.get("x-note"), Some("a:b\nc"));
        assert_eq!(frame.body, "{\"target\":\"wallet\"}");
    }

    #[test]
    fn connected_headers_are_not_unescaped() {
        let frames = decode_all("CONNECTED\nversion:1.2\nserver:spring\\c6\nheart-beat:0,0\n\n\0").unwrap();
        assert_eq!(frames[0].get("server"), Some("spring\\c6"));
    }

    #[test]
    fn content_length_allows_nul_in_body() {
        let text = "MESSAGE\ncontent-length:3\n\na\0b\0\n";
        let frames = decode_all(text).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn heart_beats_and_multiple_frames() {
        assert!(decode_all("\n").unwrap().is_empty());
        assert!(decode_all("\r\n\r\n").unwrap().is_empty());

        let text = "\nRECEIPT\nreceipt-id:1\n\n\0\nERROR\nmessage:bad\n\noops\0";
        let frames = decode_all(text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Receipt);
        assert_eq!(frames[1].command, Command::Error);
        assert_eq!(frames[1].body, "oops");
    }

    #[test]
    fn rejects_truncated_and_unknown_frames() {
        assert_eq!(
            decode_all("MESSAGE\nid:1\n\nbody"),
            Err(StompError::Unterminated)
        );
        assert!(matches!(
            decode_all("PING\n\n\0"),
            Err(StompError::UnknownCommand(_))
        ));
        assert!(matches!(
            decode_all("MESSAGE\nbad\\x:1\n\n\0"),
            Err(StompError::InvalidEscape(_))
        ));
    }

    #[test]
    fn heart_beat_negotiation() {
        let client = HeartBeat::symmetric(Duration::from_secs(30));

        let both = HeartBeat::negotiate(client, HeartBeat::parse("10000,60000").unwrap());
        assert_eq!(both.send_every, Some(Duration::from_secs(60)));
        assert_eq!(both.expect_within, Some(Duration::from_secs(30)));

        let none = HeartBeat::negotiate(client, HeartBeat::parse("0,0").unwrap());
        assert_eq!(none.send_every, None);
        assert_eq!(none.expect_within, None);
    }
}
