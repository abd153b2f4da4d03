//! CRM webhook ingress.
//!
//! The single doorway for lead events. Payloads are authenticated with an
//! HMAC-SHA256 signature over the raw body, and qualification facts are
//! validated against the lead type here, at the boundary where CRM data
//! enters the orchestrator. Replayed deliveries are acknowledged with a
//! `deduplicated` marker rather than an error so upstream retry loops
//! settle quietly.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use leadflow_core::domain::event::ConversationEvent;
use leadflow_core::domain::lead::{
    LeadId, LeadType, Motivation, PriceExpectation, QualificationFacts, Timeline,
};
use leadflow_orchestrator::{EventRouter, RouterError, RouterOutcome};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-leadflow-signature";

#[derive(Clone)]
pub struct IngressState {
    router: Arc<EventRouter>,
    webhook_secret: Option<SecretString>,
}

impl IngressState {
    pub fn new(router: Arc<EventRouter>, webhook_secret: Option<SecretString>) -> Self {
        Self { router, webhook_secret }
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new().route("/webhooks/crm", post(webhook_ingest)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    lead_id: String,
    #[serde(default)]
    lead_type: Option<String>,
    #[serde(default)]
    tz_offset_mins: Option<i32>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    facts: Option<FactsPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct FactsPayload {
    #[serde(default)]
    timeline: Option<String>,
    #[serde(default)]
    pre_approved: Option<bool>,
    #[serde(default)]
    budget: Option<Decimal>,
    #[serde(default)]
    motivation: Option<String>,
    #[serde(default)]
    price_expectation: Option<String>,
    #[serde(default)]
    has_agent: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct IngressResponse {
    pub correlation_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct IngressError {
    pub correlation_id: String,
    pub error: String,
}

async fn webhook_ingest(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngressResponse>), (StatusCode, Json<IngressError>)> {
    let correlation_id = format!("crm-{}", Uuid::new_v4().simple());

    verify_signature(&state, &headers, &body, &correlation_id)?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body).map_err(|error| {
        reject(
            StatusCode::UNPROCESSABLE_ENTITY,
            &correlation_id,
            format!("invalid webhook payload: {error}"),
        )
    })?;

    let lead_id = LeadId(envelope.lead_id.trim().to_string());
    if lead_id.0.is_empty() {
        return Err(reject(
            StatusCode::UNPROCESSABLE_ENTITY,
            &correlation_id,
            "lead_id must not be empty".to_string(),
        ));
    }

    let outcome = match envelope.event.as_str() {
        "lead.created" => {
            let lead_type = envelope
                .lead_type
                .as_deref()
                .and_then(LeadType::parse)
                .ok_or_else(|| {
                    reject(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        &correlation_id,
                        "lead.created requires lead_type of buyer|seller|both".to_string(),
                    )
                })?;
            let facts = convert_facts(envelope.facts.unwrap_or_default(), &correlation_id)?;
            state
                .router
                .create_lead(
                    lead_id.clone(),
                    lead_type,
                    envelope.tz_offset_mins.unwrap_or(0),
                    facts,
                )
                .await
        }
        "lead.message" => {
            let external_id = envelope.external_id.ok_or_else(|| {
                reject(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &correlation_id,
                    "lead.message requires external_id".to_string(),
                )
            })?;
            let message = envelope.message.ok_or_else(|| {
                reject(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &correlation_id,
                    "lead.message requires message".to_string(),
                )
            })?;
            state
                .router
                .handle_event(
                    &lead_id,
                    ConversationEvent::InboundMessage { external_id, body: message },
                )
                .await
        }
        "lead.facts_updated" => {
            let facts = convert_facts(envelope.facts.unwrap_or_default(), &correlation_id)?;
            state.router.update_facts(&lead_id, facts).await
        }
        "lead.opt_out" => state.router.handle_event(&lead_id, ConversationEvent::OptOutDetected).await,
        "lead.pause" => state.router.handle_event(&lead_id, ConversationEvent::ManualPause).await,
        "lead.resume" => state.router.handle_event(&lead_id, ConversationEvent::ManualResume).await,
        "lead.escalate" => {
            state.router.handle_event(&lead_id, ConversationEvent::ManualEscalate).await
        }
        "lead.handoff" => {
            state.router.handle_event(&lead_id, ConversationEvent::ManualHandoff).await
        }
        "lead.complete" => {
            state.router.handle_event(&lead_id, ConversationEvent::ManualComplete).await
        }
        other => {
            return Err(reject(
                StatusCode::UNPROCESSABLE_ENTITY,
                &correlation_id,
                format!("unsupported event kind `{other}`"),
            ));
        }
    };

    match outcome {
        Ok(RouterOutcome::Applied { from, to }) => {
            tracing::info!(
                event_name = "ingress.event_accepted",
                correlation_id = %correlation_id,
                lead_id = %lead_id,
                event = %envelope.event,
                from = from.as_str(),
                to = to.as_str(),
                "webhook event accepted"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(IngressResponse {
                    correlation_id,
                    status: "accepted",
                    from: Some(from.as_str()),
                    to: Some(to.as_str()),
                }),
            ))
        }
        Ok(RouterOutcome::Deduplicated) => Ok((
            StatusCode::ACCEPTED,
            Json(IngressResponse {
                correlation_id,
                status: "deduplicated",
                from: None,
                to: None,
            }),
        )),
        Err(error) => Err(map_router_error(error, &correlation_id)),
    }
}

fn verify_signature(
    state: &IngressState,
    headers: &HeaderMap,
    body: &[u8],
    correlation_id: &str,
) -> Result<(), (StatusCode, Json<IngressError>)> {
    let Some(secret) = &state.webhook_secret else {
        // No secret configured: accept, but make the gap visible.
        tracing::warn!(
            event_name = "ingress.unauthenticated_webhook",
            correlation_id,
            "webhook accepted without signature verification; configure crm.webhook_secret"
        );
        return Ok(());
    };

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("sha256=").unwrap_or(value))
        .and_then(|value| hex::decode(value).ok());

    let Some(provided) = provided else {
        return Err(reject(
            StatusCode::UNAUTHORIZED,
            correlation_id,
            "missing or malformed webhook signature".to_string(),
        ));
    };

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| {
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                correlation_id,
                "webhook secret is unusable".to_string(),
            )
        })?;
    mac.update(body);

    if mac.verify_slice(&provided).is_err() {
        return Err(reject(
            StatusCode::UNAUTHORIZED,
            correlation_id,
            "webhook signature mismatch".to_string(),
        ));
    }

    Ok(())
}

fn convert_facts(
    payload: FactsPayload,
    correlation_id: &str,
) -> Result<QualificationFacts, (StatusCode, Json<IngressError>)> {
    let timeline = payload
        .timeline
        .as_deref()
        .map(|raw| {
            Timeline::parse(raw).ok_or_else(|| {
                reject(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    correlation_id,
                    format!("unrecognized timeline `{raw}`"),
                )
            })
        })
        .transpose()?;

    let motivation = payload
        .motivation
        .as_deref()
        .map(|raw| {
            Motivation::parse(raw).ok_or_else(|| {
                reject(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    correlation_id,
                    format!("unrecognized motivation `{raw}`"),
                )
            })
        })
        .transpose()?;

    let price_expectation = payload
        .price_expectation
        .as_deref()
        .map(|raw| {
            PriceExpectation::parse(raw).ok_or_else(|| {
                reject(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    correlation_id,
                    format!("unrecognized price_expectation `{raw}`"),
                )
            })
        })
        .transpose()?;

    Ok(QualificationFacts {
        timeline,
        pre_approved: payload.pre_approved,
        budget: payload.budget,
        motivation,
        price_expectation,
        has_agent: payload.has_agent,
    })
}

fn map_router_error(
    error: RouterError,
    correlation_id: &str,
) -> (StatusCode, Json<IngressError>) {
    let (status, message) = match &error {
        RouterError::UnknownLead(lead_id) => {
            (StatusCode::NOT_FOUND, format!("unknown lead {lead_id}"))
        }
        RouterError::Facts(inner) => (StatusCode::UNPROCESSABLE_ENTITY, inner.to_string()),
        RouterError::InvalidTimezone(mins) => {
            (StatusCode::UNPROCESSABLE_ENTITY, format!("invalid timezone offset {mins} minutes"))
        }
        RouterError::Lifecycle(inner) => (StatusCode::CONFLICT, inner.to_string()),
        RouterError::Repository(_) | RouterError::ConflictExhausted(_) => {
            tracing::error!(
                event_name = "ingress.event_failed",
                correlation_id,
                error = %error,
                "webhook event processing failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "event processing is temporarily unavailable".to_string(),
            )
        }
    };

    reject(status, correlation_id, message)
}

fn reject(
    status: StatusCode,
    correlation_id: &str,
    error: String,
) -> (StatusCode, Json<IngressError>) {
    (status, Json(IngressError { correlation_id: correlation_id.to_string(), error }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::util::ServiceExt;

    use leadflow_core::clock::FixedClock;
    use leadflow_core::compliance::{ComplianceGate, SendWindow};
    use leadflow_core::dispatch::DispatchEngine;
    use leadflow_core::domain::lead::{LeadId, LeadState};
    use leadflow_core::notify::InMemoryNotificationSink;
    use leadflow_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryEventDedupRepository,
        InMemoryMessageRepository,
    };
    use leadflow_orchestrator::{
        DispatcherOptions, EventRouter, MessageDispatcher, NoopLeadDataProvider,
        RecordingChannelSender, RouterConfig, TemplateContentGenerator,
    };

    use super::{router, IngressState, SIGNATURE_HEADER};

    const SECRET: &str = "whsec-test";

    struct Harness {
        app: axum::Router,
        conversations: Arc<InMemoryConversationRepository>,
    }

    fn harness() -> Harness {
        let start = chrono::DateTime::parse_from_rfc3339("2026-03-02T15:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&chrono::Utc);
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let notifications = InMemoryNotificationSink::default();
        let clock = FixedClock::at(start);

        let dispatcher = Arc::new(MessageDispatcher::new(
            DispatchEngine::new(),
            ComplianceGate::new(SendWindow::default()),
            conversations.clone(),
            messages.clone(),
            Arc::new(RecordingChannelSender::default()),
            Arc::new(notifications.clone()),
            Arc::new(clock.clone()),
            DispatcherOptions::default(),
        ));

        let event_router = Arc::new(EventRouter::new(
            conversations.clone(),
            messages,
            Arc::new(InMemoryEventDedupRepository::default()),
            dispatcher,
            Arc::new(TemplateContentGenerator),
            Arc::new(NoopLeadDataProvider),
            Arc::new(notifications),
            Arc::new(clock),
            RouterConfig::default(),
        ));

        let app = router(IngressState::new(
            event_router,
            Some(SECRET.to_string().into()),
        ));

        Harness { app, conversations }
    }

    fn sign(body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac key");
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_request(payload: &Value) -> Request<Body> {
        let body = payload.to_string();
        Request::builder()
            .method("POST")
            .uri("/webhooks/crm")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign(&body))
            .body(Body::from(body))
            .expect("request")
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn signed_lead_created_is_accepted() {
        let harness = harness();
        let payload = json!({
            "event": "lead.created",
            "lead_id": "L-W1",
            "lead_type": "buyer",
            "tz_offset_mins": -300,
            "facts": { "timeline": "within_30_days", "pre_approved": true }
        });

        let response = harness
            .app
            .clone()
            .oneshot(signed_request(&payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = response_json(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["from"], "initial");
        assert_eq!(body["to"], "qualifying");

        let conversation = harness
            .conversations
            .find(&LeadId("L-W1".to_string()))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(conversation.state, LeadState::Qualifying);
        assert_eq!(conversation.tz_offset_mins, -300);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let harness = harness();
        let body = json!({ "event": "lead.opt_out", "lead_id": "L-W2" }).to_string();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/crm")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, "sha256=deadbeef")
            .body(Body::from(body))
            .expect("request");

        let response = harness.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let harness = harness();
        let body = json!({ "event": "lead.opt_out", "lead_id": "L-W3" }).to_string();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/crm")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request");

        let response = harness.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replayed_inbound_message_reports_deduplicated() {
        let harness = harness();

        let create = json!({
            "event": "lead.created",
            "lead_id": "L-W4",
            "lead_type": "buyer"
        });
        let response = harness
            .app
            .clone()
            .oneshot(signed_request(&create))
            .await
            .expect("create response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let message = json!({
            "event": "lead.message",
            "lead_id": "L-W4",
            "external_id": "sms-778",
            "message": "we are hoping for a big yard"
        });

        let first = harness
            .app
            .clone()
            .oneshot(signed_request(&message))
            .await
            .expect("first delivery");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(response_json(first).await["status"], "accepted");

        let second = harness
            .app
            .clone()
            .oneshot(signed_request(&message))
            .await
            .expect("replayed delivery");
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        assert_eq!(response_json(second).await["status"], "deduplicated");
    }

    #[tokio::test]
    async fn mismatched_facts_are_rejected_at_the_boundary() {
        let harness = harness();
        let payload = json!({
            "event": "lead.created",
            "lead_id": "L-W5",
            "lead_type": "buyer",
            "facts": { "price_expectation": "realistic" }
        });

        let response = harness
            .app
            .clone()
            .oneshot(signed_request(&payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_event_kind_is_rejected() {
        let harness = harness();
        let payload = json!({ "event": "lead.vanished", "lead_id": "L-W6" });

        let response = harness
            .app
            .clone()
            .oneshot(signed_request(&payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn event_for_unknown_lead_is_not_found() {
        let harness = harness();
        let payload = json!({ "event": "lead.opt_out", "lead_id": "L-missing" });

        let response = harness
            .app
            .clone()
            .oneshot(signed_request(&payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
