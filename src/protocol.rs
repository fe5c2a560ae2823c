// message shapes shared by the server routes and the client
// the HTTP framing itself is axum's (server) and reqwest's (client), this module
// only names the headers both sides agree on and carries a reply that the core
// logic can build and tests can inspect without a body stream
use axum::{
    http::{header::IntoHeaderName, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

pub const MAX_BODY: usize = 1 << 20;

pub const LAMPORT_CLOCK: &str = "x-lamport-clock";
pub const LAMPORT_NODE: &str = "x-lamport-node";
pub const SOURCE_ID: &str = "x-source-id";

/// Value of `name` if present and visible ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Default::default(),
            body: Default::default(),
        }
    }

    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut reply = Self::new(status);
        reply.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        reply.body = body.to_string().into_bytes();
        reply
    }

    pub fn with_header(mut self, name: impl IntoHeaderName, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name, value.into());
        self
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        for (name, value) in &self.headers {
            response.headers_mut().insert(name, value.clone());
        }
        response
    }
}
