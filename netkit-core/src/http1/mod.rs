//! HTTP/1.1 client and server over hyper.
//!
//! The server wraps each connection as a synthetic session: the session id is
//! minted when the connection is accepted and stays stable across every
//! keep-alive request on it.

mod client;
mod server;

pub use client::HttpClient;
pub use server::{HttpServer, HttpSession};

/// A materialized request handed to the server's handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The handler's answer.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Application request handler invoked per request.
pub type RequestHandler = dyn Fn(HttpRequest) -> HttpResponse + Send + Sync;
