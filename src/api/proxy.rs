//! Proxy handler core
//!
//! The shared orchestration behind both chat routes: parse the ingress
//! body, route it, resolve the effective upstream key, translate the
//! dialect when ingress and upstream differ, relay the response
//! (streaming or buffered), and account usage exactly once per request.

use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{future, stream, StreamExt};
use serde_json::Value;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, warn};

use hermes_core::{GatewayError, Principal, Result, UsageRecord};
use hermes_llm::protocol::anthropic::MessagesRequest;
use hermes_llm::protocol::openai::ChatRequest;
use hermes_llm::translate::{
    anthropic_to_openai_request, anthropic_to_openai_response, dedup_tool_results,
    inject_system_prefix_anthropic, inject_system_prefix_openai, openai_to_anthropic_request,
    openai_to_anthropic_response, prepare_anthropic_upstream, prepare_openai_upstream,
    stream::{sse_line_stream, AnthropicPassThrough, AnthropicToOpenAi, OpenAiPassThrough,
    OpenAiToAnthropic},
    RelayEvent, StreamRelay,
};
use hermes_llm::{Dialect, RoutingDecision};

use crate::api::error::error_response;
use crate::server::AppState;

/// Entry point shared by `/v1/chat/completions` and `/v1/messages`
pub async fn handle_chat(
    state: Arc<AppState>,
    principal: Principal,
    dialect: Dialect,
    body: Bytes,
) -> Response {
    // Recover the model name early so failed attempts are attributable.
    let requested_model = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    match run(&state, &principal, dialect, &body).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status_code();
            warn!(
                user = %principal.username,
                model = %requested_model,
                status,
                %err,
                "request failed"
            );
            state
                .usage
                .record(UsageRecord {
                    quota_item_id: None,
                    user_id: principal.id,
                    requested_model,
                    routed_model: String::new(),
                    upstream_provider: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    status_code: i32::from(status),
                    timestamp: Utc::now(),
                })
                .await;
            error_response(dialect, &err)
        }
    }
}

async fn run(
    state: &Arc<AppState>,
    principal: &Principal,
    dialect: Dialect,
    body: &[u8],
) -> Result<Response> {
    let ingress = IngressRequest::parse(dialect, body)?;
    let requested_model = ingress.model().to_string();
    let streaming = ingress.stream();

    let decision = state
        .router
        .route(principal.subscription_id, &requested_model)
        .await?;

    state
        .model_limiter
        .set_limits(decision.model_id, decision.rpm, decision.tpm, decision.rpd)
        .await;
    if !state.model_limiter.check_tpm(decision.model_id).await
        || !state.model_limiter.allow_request(decision.model_id).await
    {
        return Err(GatewayError::AllLimitsExceeded);
    }

    // A ready pooled sub-key wins; the quota item's static key is the
    // fallback.
    let api_key = match state.pools.ready_key(decision.provider_id).await? {
        Some(pooled) => pooled,
        None => decision.api_key.clone(),
    };

    let upstream_dialect = if decision.provider_type.is_anthropic() {
        Dialect::Anthropic
    } else {
        Dialect::OpenAi
    };
    let upstream_body = build_upstream_body(state, ingress, upstream_dialect, &decision.model)?;

    let response = state
        .upstream
        .post_chat(
            decision.provider_type,
            &decision.base_url,
            &api_key,
            &upstream_body,
            streaming,
        )
        .await?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return mirror_upstream_error(state, principal, &decision, &requested_model, response)
            .await;
    }

    if streaming {
        Ok(stream_response(
            state.clone(),
            principal,
            dialect,
            upstream_dialect,
            &decision,
            &requested_model,
            response,
        ))
    } else {
        buffered_response(state, principal, dialect, upstream_dialect, &decision, &requested_model, response)
            .await
    }
}

// ============================================================================
// Ingress parsing
// ============================================================================

enum IngressRequest {
    OpenAi(ChatRequest),
    Anthropic(MessagesRequest),
}

impl IngressRequest {
    fn parse(dialect: Dialect, body: &[u8]) -> Result<Self> {
        let parsed = match dialect {
            Dialect::OpenAi => serde_json::from_slice(body)
                .map(Self::OpenAi)
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?,
            Dialect::Anthropic => serde_json::from_slice(body)
                .map(Self::Anthropic)
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?,
        };
        if parsed.model().is_empty() {
            return Err(GatewayError::BadRequest("missing model".to_string()));
        }
        Ok(parsed)
    }

    fn model(&self) -> &str {
        match self {
            Self::OpenAi(req) => &req.model,
            Self::Anthropic(req) => &req.model,
        }
    }

    fn stream(&self) -> bool {
        match self {
            Self::OpenAi(req) => req.stream,
            Self::Anthropic(req) => req.stream,
        }
    }

    fn has_tools(&self) -> bool {
        match self {
            Self::OpenAi(req) => req.tools.as_ref().is_some_and(|t| !t.is_empty()),
            Self::Anthropic(req) => req.tools.as_ref().is_some_and(|t| !t.is_empty()),
        }
    }
}

/// Build the upstream JSON body for the routed provider
///
/// Swaps the model, clamps `max_tokens`, translates dialect when ingress
/// and upstream families differ, deduplicates tool results on
/// Anthropic-bound bodies, and injects the configured system prefix when
/// the client is not already driving its own tools.
fn build_upstream_body(
    state: &AppState,
    ingress: IngressRequest,
    upstream_dialect: Dialect,
    routed_model: &str,
) -> Result<Value> {
    let inject = if ingress.has_tools() {
        None
    } else {
        state.config.system_prefix.as_deref()
    };

    let body = match (ingress, upstream_dialect) {
        (IngressRequest::OpenAi(mut req), Dialect::OpenAi) => {
            prepare_openai_upstream(&mut req, routed_model);
            if let Some(prefix) = inject {
                inject_system_prefix_openai(&mut req, prefix);
            }
            serde_json::to_value(&req)
        }
        (IngressRequest::OpenAi(req), Dialect::Anthropic) => {
            let mut converted = openai_to_anthropic_request(&req)?;
            prepare_anthropic_upstream(&mut converted, routed_model);
            dedup_tool_results(&mut converted);
            if let Some(prefix) = inject {
                inject_system_prefix_anthropic(&mut converted, prefix);
            }
            serde_json::to_value(&converted)
        }
        (IngressRequest::Anthropic(mut req), Dialect::Anthropic) => {
            prepare_anthropic_upstream(&mut req, routed_model);
            dedup_tool_results(&mut req);
            if let Some(prefix) = inject {
                inject_system_prefix_anthropic(&mut req, prefix);
            }
            serde_json::to_value(&req)
        }
        (IngressRequest::Anthropic(mut req), Dialect::OpenAi) => {
            dedup_tool_results(&mut req);
            let mut converted = anthropic_to_openai_request(&req)?;
            prepare_openai_upstream(&mut converted, routed_model);
            if let Some(prefix) = inject {
                inject_system_prefix_openai(&mut converted, prefix);
            }
            serde_json::to_value(&converted)
        }
    };

    body.map_err(|e| GatewayError::Translation(e.to_string()))
}

// ============================================================================
// Upstream error mirroring
// ============================================================================

async fn mirror_upstream_error(
    state: &Arc<AppState>,
    principal: &Principal,
    decision: &RoutingDecision,
    requested_model: &str,
    response: reqwest::Response,
) -> Result<Response> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

    debug!(status, model = %decision.model, "mirroring upstream error");
    state
        .usage
        .record(usage_record(principal, decision, requested_model, status, 0, 0))
        .await;

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

fn usage_record(
    principal: &Principal,
    decision: &RoutingDecision,
    requested_model: &str,
    status: u16,
    input_tokens: i64,
    output_tokens: i64,
) -> UsageRecord {
    UsageRecord {
        quota_item_id: Some(decision.quota_item_id),
        user_id: principal.id,
        requested_model: requested_model.to_string(),
        routed_model: decision.model.clone(),
        upstream_provider: decision.provider_type.to_string(),
        input_tokens,
        output_tokens,
        status_code: i32::from(status),
        timestamp: Utc::now(),
    }
}

// ============================================================================
// Buffered (non-streaming) path
// ============================================================================

async fn buffered_response(
    state: &Arc<AppState>,
    principal: &Principal,
    dialect: Dialect,
    upstream_dialect: Dialect,
    decision: &RoutingDecision,
    requested_model: &str,
    response: reqwest::Response,
) -> Result<Response> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

    let (body, input_tokens, output_tokens) = match (upstream_dialect, dialect) {
        (Dialect::OpenAi, Dialect::OpenAi) => {
            let parsed: hermes_llm::protocol::openai::ChatResponse =
                serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
            let usage = parsed.usage.unwrap_or_default();
            (
                bytes.to_vec(),
                usage.prompt_tokens,
                usage.completion_tokens,
            )
        }
        (Dialect::Anthropic, Dialect::Anthropic) => {
            let parsed: hermes_llm::protocol::anthropic::MessagesResponse =
                serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
            (
                bytes.to_vec(),
                parsed.usage.input_tokens,
                parsed.usage.output_tokens,
            )
        }
        (Dialect::OpenAi, Dialect::Anthropic) => {
            let parsed: hermes_llm::protocol::openai::ChatResponse =
                serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
            let (message, cache_hit) = openai_to_anthropic_response(&parsed, &decision.model)?;
            if cache_hit {
                debug!(model = %decision.model, "upstream prompt cache hit");
            }
            let input = message.usage.input_tokens;
            let output = message.usage.output_tokens;
            let encoded = serde_json::to_vec(&message)
                .map_err(|e| GatewayError::Translation(e.to_string()))?;
            (encoded, input, output)
        }
        (Dialect::Anthropic, Dialect::OpenAi) => {
            let parsed: hermes_llm::protocol::anthropic::MessagesResponse =
                serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
            let converted = anthropic_to_openai_response(&parsed)?;
            let usage = converted.usage.clone().unwrap_or_default();
            let encoded = serde_json::to_vec(&converted)
                .map_err(|e| GatewayError::Translation(e.to_string()))?;
            (encoded, usage.prompt_tokens, usage.completion_tokens)
        }
    };

    let total = input_tokens + output_tokens;
    state
        .model_limiter
        .record_tokens(decision.model_id, total as i64)
        .await;
    state
        .usage
        .record(usage_record(
            principal,
            decision,
            requested_model,
            200,
            input_tokens as i64,
            output_tokens as i64,
        ))
        .await;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

// ============================================================================
// Streaming path
// ============================================================================

/// Records the streaming usage row when the response stream ends for any
/// reason, including a client disconnect mid-stream.
struct StreamUsageGuard {
    state: Arc<AppState>,
    record: Option<UsageRecord>,
    model_id: i64,
    input_tokens: Arc<AtomicI64>,
    output_tokens: Arc<AtomicI64>,
}

impl Drop for StreamUsageGuard {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.input_tokens = self.input_tokens.load(Ordering::Relaxed);
        record.output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let state = self.state.clone();
        let model_id = self.model_id;

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let total = record.input_tokens + record.output_tokens;
                state.model_limiter.record_tokens(model_id, total).await;
                state.usage.record(record).await;
            });
        }
    }
}

struct RelayState {
    relay: Box<dyn StreamRelay>,
    dialect: Dialect,
    failed: bool,
    input_tokens: Arc<AtomicI64>,
    output_tokens: Arc<AtomicI64>,
    _guard: StreamUsageGuard,
}

impl RelayState {
    fn sync_usage(&self) {
        let (input, output) = self.relay.usage();
        self.input_tokens.store(input as i64, Ordering::Relaxed);
        self.output_tokens.store(output as i64, Ordering::Relaxed);
    }
}

fn stream_response(
    state: Arc<AppState>,
    principal: &Principal,
    dialect: Dialect,
    upstream_dialect: Dialect,
    decision: &RoutingDecision,
    requested_model: &str,
    response: reqwest::Response,
) -> Response {
    let relay: Box<dyn StreamRelay> = match (upstream_dialect, dialect) {
        (Dialect::OpenAi, Dialect::OpenAi) => Box::new(OpenAiPassThrough::new()),
        (Dialect::OpenAi, Dialect::Anthropic) => Box::new(OpenAiToAnthropic::new(&decision.model)),
        (Dialect::Anthropic, Dialect::OpenAi) => Box::new(AnthropicToOpenAi::new(&decision.model)),
        (Dialect::Anthropic, Dialect::Anthropic) => Box::new(AnthropicPassThrough::new()),
    };

    let input_tokens = Arc::new(AtomicI64::new(0));
    let output_tokens = Arc::new(AtomicI64::new(0));
    let guard = StreamUsageGuard {
        state: state.clone(),
        record: Some(usage_record(principal, decision, requested_model, 200, 0, 0)),
        model_id: decision.model_id,
        input_tokens: input_tokens.clone(),
        output_tokens: output_tokens.clone(),
    };

    let relay_state = RelayState {
        relay,
        dialect,
        failed: false,
        input_tokens,
        output_tokens,
        _guard: guard,
    };

    let events = sse_line_stream(response)
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .scan(relay_state, |ctx, item| {
            if ctx.failed {
                return future::ready(None);
            }
            let events = match item {
                Some(Ok(line)) => ctx.relay.on_line(&line),
                Some(Err(err)) => {
                    ctx.failed = true;
                    translation_failure_events(ctx.dialect, &err)
                }
                None => ctx.relay.finish(),
            };
            ctx.sync_usage();
            future::ready(Some(stream::iter(events)))
        })
        .flatten()
        .map(|relay_event| {
            let mut event = Event::default();
            if let Some(name) = &relay_event.event {
                event = event.event(name);
            }
            Ok::<Event, Infallible>(event.data(relay_event.data))
        });

    Sse::new(events).into_response()
}

/// Terminal events for a mid-stream framing failure
///
/// Oversized SSE lines (beyond the 1 MiB cap) and transport errors both
/// land here; the client gets a dialect-shaped error event, then the
/// stream closes.
fn translation_failure_events(dialect: Dialect, err: &LinesCodecError) -> Vec<RelayEvent> {
    let gateway_err = GatewayError::Translation(err.to_string());
    warn!(%gateway_err, "stream translation aborted");
    match dialect {
        Dialect::Anthropic => vec![RelayEvent {
            event: Some("error".to_string()),
            data: gateway_err.anthropic_body().to_string(),
        }],
        Dialect::OpenAi => vec![
            RelayEvent {
                event: None,
                data: gateway_err.openai_body().to_string(),
            },
            RelayEvent {
                event: None,
                data: "[DONE]".to_string(),
            },
        ],
    }
}
