//! REST client for the remote data backend.
//!
//! Records travel as flat JSON documents carrying their `id`:
//!
//! | call | request |
//! |---|---|
//! | list | `GET {base}/collections/{c}` |
//! | create | `POST {base}/collections/{c}` |
//! | update | `PATCH {base}/collections/{c}/{id}` |
//! | delete | `DELETE {base}/collections/{c}/{id}` |
//! | set active | `POST {base}/collections/{c}/{id}/active` with `{"active": bool}` |
//! | import | `POST {base}/collections/{c}/import` |
//! | export | `GET {base}/collections/{c}/export` |
//!
//! The backend pushes change notifications to the host's `/api/changes`
//! webhook, which forwards them to [`Backend::notify`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use routine_core::{
    ChangeNotification, DataBackend, Fields, MemoryBackend, Record, RemoteError, RemoteResult,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use url::Url;

const NOTIFICATION_CAPACITY: usize = 256;

/// [`DataBackend`] speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    inner: Arc<InnerBackend>,
}

struct InnerBackend {
    http: Client,
    base: Url,
    timeout: Duration,
    notifications: broadcast::Sender<ChangeNotification>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.inner.base.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Create a client for the backend at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Network`] if the HTTP client cannot be built.
    pub fn new(base: Url, timeout: Duration) -> RemoteResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("routine-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            inner: Arc::new(InnerBackend {
                http,
                base,
                timeout,
                notifications,
            }),
        })
    }

    /// Publish a change pushed by the backend.
    pub fn notify(&self, notification: ChangeNotification) {
        let _ = self.inner.notifications.send(notification);
    }

    fn endpoint(&self, collection: &str, rest: &[&str]) -> RemoteResult<Url> {
        let mut url = self.inner.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RemoteError::Network(format!("backend URL {} cannot be a base", self.inner.base)))?;
            segments
                .pop_if_empty()
                .push("collections")
                .push(collection)
                .extend(rest);
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
            StatusCode::NOT_FOUND => RemoteError::NotFound(message),
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                RemoteError::Network(format!("backend unavailable ({status})"))
            }
            _ => RemoteError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: &reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.inner.timeout)
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Split a backend document into a [`Record`].
fn record_from_doc(doc: Value) -> RemoteResult<Record> {
    let mut fields = match doc {
        Value::Object(fields) => fields,
        other => return Err(RemoteError::Decode(format!("expected a JSON object, got {other}"))),
    };
    let id = match fields.remove("id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(n)) => n.to_string(),
        other => {
            return Err(RemoteError::Decode(format!("document has no usable id: {other:?}")));
        }
    };
    Ok(Record::new(id, fields))
}

fn records_from_docs(docs: Vec<Value>) -> RemoteResult<Vec<Record>> {
    docs.into_iter().map(record_from_doc).collect()
}

#[async_trait]
impl DataBackend for HttpBackend {
    async fn list(&self, collection: &str) -> RemoteResult<Vec<Record>> {
        let url = self.endpoint(collection, &[])?;
        let docs: Vec<Value> = self.send_json(self.inner.http.get(url)).await?;
        records_from_docs(docs)
    }

    async fn create(&self, collection: &str, fields: Fields) -> RemoteResult<Record> {
        let url = self.endpoint(collection, &[])?;
        record_from_doc(self.send_json(self.inner.http.post(url).json(&fields)).await?)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> RemoteResult<Record> {
        let url = self.endpoint(collection, &[id])?;
        record_from_doc(self.send_json(self.inner.http.patch(url).json(&fields)).await?)
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let url = self.endpoint(collection, &[id])?;
        self.send(self.inner.http.delete(url)).await?;
        Ok(())
    }

    async fn set_active(&self, collection: &str, id: &str, active: bool) -> RemoteResult<Record> {
        let url = self.endpoint(collection, &[id, "active"])?;
        let body = json!({ "active": active });
        record_from_doc(self.send_json(self.inner.http.post(url).json(&body)).await?)
    }

    async fn import(&self, collection: &str, records: Vec<Fields>) -> RemoteResult<Vec<Record>> {
        let url = self.endpoint(collection, &["import"])?;
        let docs: Vec<Value> = self.send_json(self.inner.http.post(url).json(&records)).await?;
        records_from_docs(docs)
    }

    async fn export(&self, collection: &str) -> RemoteResult<Vec<Value>> {
        let url = self.endpoint(collection, &["export"])?;
        self.send_json(self.inner.http.get(url)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.notifications.subscribe()
    }
}

/// The backend the host talks to.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Remote REST backend.
    Http(HttpBackend),
    /// In-process backend for local use and tests.
    Memory(MemoryBackend),
}

impl Backend {
    /// Shared trait object for the repository.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn DataBackend> {
        match self {
            Self::Http(backend) => Arc::new(backend.clone()),
            Self::Memory(backend) => Arc::new(backend.clone()),
        }
    }

    /// Publish a change notification received from outside.
    pub fn notify(&self, notification: ChangeNotification) {
        match self {
            Self::Http(backend) => backend.notify(notification),
            Self::Memory(backend) => backend.notify(notification),
        }
    }

    /// Label used in logs and health output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Memory(_) => "memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> HttpBackend {
        let base = Url::parse(&format!("{}/v1/", server.uri())).expect("url");
        HttpBackend::new(base, Duration::from_secs(5)).expect("client")
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_list_parses_documents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/collections/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "t1", "title": "Water plants"},
                {"id": 42, "title": "Stretch"}
            ])))
            .mount(&server)
            .await;

        let records = backend(&server).await.list("tasks").await.expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "t1");
        assert_eq!(records[1].id, "42");
        assert_eq!(records[0].str_field("title"), Some("Water plants"));
        assert!(records[0].field("id").is_none());
    }

    #[tokio::test]
    async fn test_create_sends_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/collections/routines"))
            .and(body_json(json!({"name": "Morning"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r9", "name": "Morning"})))
            .expect(1)
            .mount(&server)
            .await;

        let record = backend(&server)
            .await
            .create("routines", fields(json!({"name": "Morning"})))
            .await
            .expect("create");
        assert_eq!(record.id, "r9");
    }

    #[tokio::test]
    async fn test_set_active_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/collections/routines/r1/active"))
            .and(body_json(json!({"active": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "r1", "active": true})))
            .mount(&server)
            .await;

        let record = backend(&server)
            .await
            .set_active("routines", "r1", true)
            .await
            .expect("set_active");
        assert!(record.flag("active"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/collections/tasks/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such task"))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/collections/tasks/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_string("title required"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/collections/tasks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        assert!(matches!(backend.delete("tasks", "gone").await, Err(RemoteError::NotFound(_))));
        match backend.update("tasks", "bad", Fields::new()).await {
            Err(RemoteError::Rejected { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "title required");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let err = backend.list("tasks").await.expect_err("unavailable");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let port = portpicker::pick_unused_port().expect("port");
        let base = Url::parse(&format!("http://127.0.0.1:{port}/")).expect("url");
        let backend = HttpBackend::new(base, Duration::from_secs(2)).expect("client");
        let err = backend.list("tasks").await.expect_err("nothing listening");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_document_without_id_is_rejected() {
        assert!(matches!(
            record_from_doc(json!({"title": "x"})),
            Err(RemoteError::Decode(_))
        ));
        assert!(matches!(record_from_doc(json!([1, 2])), Err(RemoteError::Decode(_))));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let server = MockServer::start().await;
        let backend = Backend::Http(backend(&server).await);
        let mut rx = backend.shared().subscribe();
        backend.notify(ChangeNotification {
            collection: "tasks".to_string(),
            kind: routine_core::ChangeKind::Modified,
            record_id: Some("t1".to_string()),
        });
        assert_eq!(rx.recv().await.expect("notification").collection, "tasks");
    }
}
