//! Shared fixtures: a scripted HTTP transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use gatewire_rest::{HttpRequest, HttpResponse, HttpTransport, RestError, Result};
use http::{HeaderMap, HeaderValue};
use tokio::time::Instant;

/// One scripted reply.
pub enum Reply {
    Response(HttpResponse),
    Fail(String),
}

/// Replays scripted replies in order and records every request it sees.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(Instant, HttpRequest)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.seen.lock().unwrap().push((Instant::now(), request));
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Fail(reason)) => Err(RestError::Transport { reason }),
            None => Ok(response(200, &[], "{}")),
        }
    }
}

pub fn response(status: u16, headers: &[(&'static str, &str)], body: &str) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    HttpResponse {
        status,
        headers: map,
        body: Bytes::from(body.to_string()),
    }
}

pub fn ok(body: &str) -> Reply {
    Reply::Response(response(200, &[], body))
}

pub fn ok_with_bucket(body: &str, hash: &str, limit: u32, remaining: u32, reset_after: &str) -> Reply {
    let limit = limit.to_string();
    let remaining = remaining.to_string();
    Reply::Response(response(
        200,
        &[
            ("x-ratelimit-bucket", hash),
            ("x-ratelimit-limit", limit.as_str()),
            ("x-ratelimit-remaining", remaining.as_str()),
            ("x-ratelimit-reset-after", reset_after),
        ],
        body,
    ))
}

pub fn status(code: u16, body: &str) -> Reply {
    Reply::Response(response(code, &[], body))
}
