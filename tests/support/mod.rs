//! Scripted transport for driving the clients without a network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stkai_sdk::{Error, HttpTransport, TransportResponse};

type Scripted = (std::result::Result<TransportResponse, Error>, Duration);

/// Replies to GETs and POSTs from pre-loaded queues, recording every call.
///
/// An optional sticky GET repeats forever once the queue drains, which is
/// how endless `CREATED`/`RUNNING` polling is simulated.
#[derive(Default)]
pub struct MockTransport {
    posts: Mutex<VecDeque<Scripted>>,
    gets: Mutex<VecDeque<Scripted>>,
    sticky_get: Mutex<Option<(u16, Value)>>,
    pub post_urls: Mutex<Vec<String>>,
    pub post_bodies: Mutex<Vec<Value>>,
    pub get_urls: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub high_water: AtomicUsize,
}

pub fn json_response(status: u16, body: Value) -> TransportResponse {
    TransportResponse::new(status, HashMap::new(), body.to_string().into_bytes())
}

pub fn json_response_with_headers(
    status: u16,
    headers: &[(&str, &str)],
    body: Value,
) -> TransportResponse {
    TransportResponse::new(
        status,
        headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body.to_string().into_bytes(),
    )
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_post(&self, status: u16, body: Value) {
        self.posts
            .lock()
            .unwrap()
            .push_back((Ok(json_response(status, body)), Duration::ZERO));
    }

    pub fn push_post_with_delay(&self, status: u16, body: Value, delay: Duration) {
        self.posts
            .lock()
            .unwrap()
            .push_back((Ok(json_response(status, body)), delay));
    }

    pub fn push_post_response(&self, response: TransportResponse) {
        self.posts.lock().unwrap().push_back((Ok(response), Duration::ZERO));
    }

    pub fn push_post_error(&self, error: Error) {
        self.posts.lock().unwrap().push_back((Err(error), Duration::ZERO));
    }

    pub fn push_get(&self, status: u16, body: Value) {
        self.gets
            .lock()
            .unwrap()
            .push_back((Ok(json_response(status, body)), Duration::ZERO));
    }

    pub fn push_get_error(&self, error: Error) {
        self.gets.lock().unwrap().push_back((Err(error), Duration::ZERO));
    }

    /// Once the GET queue is empty, answer every further GET with this.
    pub fn set_sticky_get(&self, status: u16, body: Value) {
        *self.sticky_get.lock().unwrap() = Some((status, body));
    }

    pub fn post_count(&self) -> usize {
        self.post_urls.lock().unwrap().len()
    }

    pub fn get_count(&self) -> usize {
        self.get_urls.lock().unwrap().len()
    }

    async fn respond(&self, scripted: Scripted) -> stkai_sdk::Result<TransportResponse> {
        let (result, delay) = scripted;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(
        &self,
        url: &str,
        _headers: &[(String, String)],
        _timeout: Duration,
    ) -> stkai_sdk::Result<TransportResponse> {
        self.get_urls.lock().unwrap().push(url.to_string());
        let scripted = {
            let mut queue = self.gets.lock().unwrap();
            match queue.pop_front() {
                Some(scripted) => scripted,
                None => {
                    let sticky = self.sticky_get.lock().unwrap();
                    let (status, body) = sticky
                        .as_ref()
                        .unwrap_or_else(|| panic!("unexpected GET with empty script: {url}"));
                    (Ok(json_response(*status, body.clone())), Duration::ZERO)
                }
            }
        };
        self.respond(scripted).await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        _timeout: Duration,
    ) -> stkai_sdk::Result<TransportResponse> {
        self.post_urls.lock().unwrap().push(url.to_string());
        self.post_bodies.lock().unwrap().push(body.clone());
        let scripted = self
            .posts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected POST with empty script: {url}"));
        self.respond(scripted).await
    }
}
