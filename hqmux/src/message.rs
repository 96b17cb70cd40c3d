//! The HTTP message type the session core inspects.
//!
//! Codecs parse and serialize messages; the core only looks at a few
//! properties: request vs response, the `Connection` header (legacy v1
//! drain), and pseudo-header basics for push promises.

use http::{HeaderMap, Method, StatusCode, Uri};

#[derive(Debug, Clone)]
enum MessageKind {
    Request { method: Method, uri: Uri },
    Response { status: StatusCode },
}

/// One HTTP message (request or response) with its header section.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    kind: MessageKind,
    headers: HeaderMap,
}

impl HttpMessage {
    pub fn request(method: Method, uri: Uri) -> Self {
        Self {
            kind: MessageKind::Request { method, uri },
            headers: HeaderMap::new(),
        }
    }

    pub fn response(status: StatusCode) -> Self {
        Self {
            kind: MessageKind::Response { status },
            headers: HeaderMap::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::Response { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.kind {
            MessageKind::Request { method, .. } => Some(method),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&Uri> {
        match &self.kind {
            MessageKind::Request { uri, .. } => Some(uri),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            MessageKind::Request { .. } => None,
            MessageKind::Response { status } => Some(*status),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = http::HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    /// Whether the message asks to keep the connection alive.
    ///
    /// A `close` token in any `Connection` header value means no; the
    /// legacy framed v1 dialect drives its drain handshake off this.
    pub fn wants_keepalive(&self) -> bool {
        !self.has_connection_token("close")
    }

    fn has_connection_token(&self, token: &str) -> bool {
        self.headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }
}
