use actix_web::{get, post, web, HttpRequest, Responder, Scope};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Error, message::Message, service::MessageService};

use super::ApiError;

const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    message: &'static str,
    status: &'static str,
}

#[post("/start")]
async fn start(
    req: HttpRequest,
    service: web::Data<MessageService>,
) -> actix_web::Result<impl Responder> {
    service
        .start_auto_sending()
        .await
        .map_err(|e| ApiError::new(&req, e))?;

    Ok(web::Json(ToggleResponse {
        message: "Automatic message sending started",
        status: "active",
    }))
}

#[post("/stop")]
async fn stop(
    req: HttpRequest,
    service: web::Data<MessageService>,
) -> actix_web::Result<impl Responder> {
    service
        .stop_auto_sending()
        .await
        .map_err(|e| ApiError::new(&req, e))?;

    Ok(web::Json(ToggleResponse {
        message: "Automatic message sending stopped",
        status: "inactive",
    }))
}

/// Raw query; parsed by hand so a bad value yields a JSON error body.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<String>,
    offset: Option<String>,
}

fn parse_param(name: &str, value: Option<&str>, default: u32) -> Result<u32, Error> {
    match value {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::invalid_parameter(format!("Invalid {name} parameter"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: i64,
    pub recipient: String,
    pub content: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            recipient: m.recipient,
            content: m.content,
            status: m.status.to_string(),
            sent_at: m.sent_at.map(rfc3339),
            retry_count: m.retry_count,
            last_attempt_at: m.last_attempt_at.map(rfc3339),
            created_at: rfc3339(m.created_at),
            updated_at: m.updated_at.map(rfc3339),
            response_id: m.response_id,
            response_code: m.response_code,
            error_message: m.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    messages: Vec<MessageResponse>,
    count: usize,
}

#[get("")]
async fn list_sent(
    req: HttpRequest,
    query: web::Query<ListQuery>,
    service: web::Data<MessageService>,
) -> actix_web::Result<impl Responder> {
    let limit = parse_param("limit", query.limit.as_deref(), DEFAULT_LIMIT)
        .map_err(|e| ApiError::new(&req, e))?;
    let offset =
        parse_param("offset", query.offset.as_deref(), 0).map_err(|e| ApiError::new(&req, e))?;

    let messages: Vec<MessageResponse> = service
        .get_sent_messages(limit, offset)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to retrieve messages");
            ApiError::new(&req, e)
        })?
        .into_iter()
        .map(MessageResponse::from)
        .collect();

    Ok(web::Json(ListMessagesResponse {
        count: messages.len(),
        messages,
    }))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(start)
        .service(stop)
        .service(list_sent)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        cache::memory::MemoryCache,
        db::memory_pool,
        dispatcher::Dispatcher,
        store::{sqlite::SqliteMessageStore, MessageStore},
        transport::{
            testing::{fast_policy, ScriptedWebhook},
            RetryingTransport,
        },
    };

    async fn setup() -> (web::Data<MessageService>, SqliteMessageStore) {
        let store = SqliteMessageStore::new(memory_pool().await, 5, Duration::from_secs(10));
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .cache(Arc::new(MemoryCache::new(Duration::from_secs(60))))
            .transport(RetryingTransport::new(
                ScriptedWebhook::new([ScriptedWebhook::ok("X")]),
                fast_policy(1),
            ))
            .build();

        (web::Data::new(MessageService::new(dispatcher)), store)
    }

    #[actix_web::test]
    async fn test_message_response_omits_absent_fields() {
        let created_at = DateTime::parse_from_rfc3339("2024-12-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let message = Message {
            id: 7,
            recipient: "+905551111111".to_owned(),
            content: "hello".to_owned(),
            status: crate::message::MessageStatus::Pending,
            sent_at: None,
            retry_count: 2,
            last_attempt_at: None,
            created_at,
            updated_at: None,
            response_id: None,
            response_code: None,
            error_message: None,
        };

        let value = serde_json::to_value(MessageResponse::from(message)).unwrap();

        assert_eq!(
            value,
            json!({
                "id": 7,
                "recipient": "+905551111111",
                "content": "hello",
                "status": "pending",
                "retryCount": 2,
                "createdAt": "2024-12-01T10:00:00Z",
            })
        );
    }

    #[actix_web::test]
    async fn test_start_and_stop() {
        let (service, _store) = setup().await;
        let app = test::init_service(App::new().app_data(service.clone()).service(super::service()))
            .await;

        let req = test::TestRequest::post().uri("/messages/start").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "active");
        assert!(service.is_running().await);

        let req = test::TestRequest::post().uri("/messages/stop").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "inactive");
        assert_eq!(body["message"], "Automatic message sending stopped");
        assert!(!service.is_running().await);
    }

    #[actix_web::test]
    async fn test_list_sent_messages() {
        let (service, store) = setup().await;

        let message = store.create("+905551111111", "hello").await.unwrap();
        let sent = message.into_sent("ext-1", Some(200), Utc::now());
        store.update(&sent).await.unwrap();
        store.create("+905552222222", "still pending").await.unwrap();

        let app = test::init_service(App::new().app_data(service).service(super::service())).await;

        let req = test::TestRequest::get()
            .uri("/messages?limit=5&offset=0")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["responseId"], "ext-1");
        assert_eq!(body["messages"][0]["status"], "sent");
        assert!(body["messages"][0]["errorMessage"].is_null());
    }

    #[actix_web::test]
    async fn test_invalid_pagination_is_rejected() {
        let (service, _store) = setup().await;
        let app = test::init_service(App::new().app_data(service).service(super::service())).await;

        let req = test::TestRequest::get()
            .uri("/messages?limit=abc")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["status"], 400);
        assert_eq!(body["path"], "/messages");
        assert_eq!(body["message"], "Invalid parameter: Invalid limit parameter");

        let req = test::TestRequest::get()
            .uri("/messages?offset=-1")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
