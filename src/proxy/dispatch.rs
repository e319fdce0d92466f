//! The request engine: credential selection, token refresh, upstream
//! dispatch with credential-level retries, and the decoder → encoder
//! drive loops for both response modes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::auth as credential_auth;
use crate::config;
use crate::convert::response::{
    anthropic_response, openai_response, ResponseCollector,
};
use crate::convert::PreparedConversation;
use crate::errors::{classify, AppError, ErrorCategory};
use crate::metrics::RequestLogEntry;
use crate::middleware::auth::AuthMode;
use crate::models::credential::CredentialErrorKind;
use crate::pool::CredentialLease;
use crate::stream::anthropic::AnthropicSseEncoder;
use crate::stream::openai::OpenAiSseEncoder;
use crate::stream::{SseSink, KEEPALIVE_INTERVAL, MAX_STREAM_SILENCE, MICRO_BUFFER_WINDOW};
use crate::upstream::decoder::FrameDecoder;
use crate::upstream::events::{EventAccumulator, StreamEvent, UsageTotals};
use crate::upstream::{UpstreamError, UpstreamResponse};
use crate::AppState;

const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "/v1/chat/completions",
            Dialect::Anthropic => "/v1/messages",
        }
    }
}

pub struct RequestContext {
    pub auth: AuthMode,
    pub dialect: Dialect,
    pub stream: bool,
}

/// Run a prepared conversation to completion, trying further credentials
/// on credential-scoped failures (quota, auth, bans).
pub async fn execute(
    state: Arc<AppState>,
    prepared: PreparedConversation,
    ctx: RequestContext,
) -> Result<Response, AppError> {
    if !state.breaker.can_execute() {
        return Err(AppError::CircuitOpen);
    }

    let started = Instant::now();
    let mut last_error = AppError::NoCredentials;

    for attempt in 0..MAX_CREDENTIAL_ATTEMPTS {
        let Some(mut lease) = acquire(&state, &ctx, &prepared.model) else {
            break;
        };

        if let crate::fault::LimitDecision::Denied { reason } =
            state.limiter.check(Some(lease.id()))
        {
            return Err(AppError::RateLimited(reason));
        }

        if let Err(e) = ensure_fresh(&state, &mut lease).await {
            tracing::warn!(credential = lease.id(), attempt, "refresh failed: {}", e);
            last_error = AppError::Upstream(e.to_string());
            continue;
        }

        match state
            .upstream
            .send_conversation(&lease.record, &prepared, None)
            .await
        {
            Ok(upstream) => {
                return if ctx.stream {
                    Ok(stream_response(state, lease, upstream, prepared, ctx, started))
                } else {
                    collect_response(state, lease, upstream, &prepared, &ctx, started).await
                };
            }
            Err(e) => {
                let retryable = note_upstream_error(&state, &lease, &e);
                tracing::warn!(
                    credential = lease.id(),
                    attempt,
                    "upstream dispatch failed: {}",
                    e
                );
                last_error = match e {
                    UpstreamError::Quota => AppError::QuotaExhausted,
                    UpstreamError::RateLimited => AppError::RateLimited("upstream throttled".into()),
                    UpstreamError::Auth(m) => AppError::Upstream(format!("auth rejected: {}", m)),
                    UpstreamError::BadRequest(m) => AppError::Upstream(m),
                    UpstreamError::Network(m) | UpstreamError::Exhausted(m) => {
                        AppError::Upstream(m)
                    }
                };
                if !retryable {
                    break;
                }
            }
        }
    }

    log_failure(&state, &ctx, &prepared, &last_error, started);
    Err(last_error)
}

fn acquire(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    model: &str,
) -> Option<CredentialLease> {
    match &ctx.auth {
        AuthMode::SharedPool => state.pool.acquire(Some(model)),
        AuthMode::Synthetic { credential_id } => state.pool.acquire_id(credential_id),
        AuthMode::ApiKey {
            allowed_credentials,
            ..
        } => {
            if allowed_credentials.is_empty() {
                state.pool.acquire(Some(model))
            } else {
                state.pool.acquire_one_of(allowed_credentials, Some(model))
            }
        }
    }
}

/// Refresh the access token when flagged or within five minutes of
/// expiry. Updates both the pool and the lease's snapshot.
async fn ensure_fresh(
    state: &Arc<AppState>,
    lease: &mut CredentialLease,
) -> Result<(), credential_auth::RefreshError> {
    let needs = lease.record.access_token.is_empty()
        || lease.record.expires_in_secs().is_some_and(|s| s < 300)
        || state.pool.needs_refresh(lease.id());
    if !needs || lease.record.refresh_token.is_none() {
        // Nothing to refresh with; run on the token we have.
        return Ok(());
    }

    match credential_auth::refresh_credential(
        state.upstream.http(),
        &lease.record,
        state.upstream.default_region(),
        None,
    )
    .await
    {
        Ok(tokens) => {
            state
                .pool
                .update_tokens(lease.id(), tokens.access_token.clone(), tokens.expires_at);
            if let Some(arn) = tokens.profile_arn.clone() {
                state
                    .pool
                    .with_record_mut(lease.id(), |r| r.profile_arn = Some(arn));
            }
            if let Some(rt) = tokens.refresh_token.clone() {
                state
                    .pool
                    .with_record_mut(lease.id(), |r| r.refresh_token = Some(rt));
            }
            lease.record = state.pool.record(lease.id()).expect("credential exists");
            Ok(())
        }
        Err(e) if e.is_permanent() => {
            state.pool.record_error(lease.id(), CredentialErrorKind::Auth);
            state
                .pool
                .with_record_mut(lease.id(), |r| r.disabled = true);
            Err(e)
        }
        Err(e) => {
            state
                .pool
                .cooldown_for(lease.id(), Duration::from_secs(30));
            Err(e)
        }
    }
}

/// Book the failure into pool/breaker state; returns whether another
/// credential is worth trying.
fn note_upstream_error(state: &Arc<AppState>, lease: &CredentialLease, e: &UpstreamError) -> bool {
    let disposition = classify(e.status(), &e.to_string());
    let kind = match disposition.category {
        ErrorCategory::Banned => CredentialErrorKind::Banned,
        ErrorCategory::Quota => CredentialErrorKind::Quota,
        ErrorCategory::Auth => CredentialErrorKind::Auth,
        ErrorCategory::Network => CredentialErrorKind::Network,
        _ => CredentialErrorKind::Other,
    };
    state.pool.record_error(lease.id(), kind);

    // Client-scoped failures (quota, auth, bad request) say nothing about
    // upstream health; only transport/server trouble feeds the breaker.
    if matches!(
        disposition.category,
        ErrorCategory::Server | ErrorCategory::Network | ErrorCategory::Unknown
    ) {
        state.breaker.record_failure();
    }

    matches!(
        disposition.category,
        ErrorCategory::Quota | ErrorCategory::Auth | ErrorCategory::Banned
    ) || disposition.retryable
}

/// First-event patience scales with the model's latency class.
fn first_event_timeout(model: &str) -> Duration {
    let normalized = config::normalize_model_name(model);
    if normalized.contains("opus") {
        Duration::from_secs(120)
    } else if normalized.contains("sonnet") {
        Duration::from_secs(90)
    } else {
        Duration::from_secs(60)
    }
}

// ── Non-streaming ───────────────────────────────────────────────

async fn collect_response(
    state: Arc<AppState>,
    lease: CredentialLease,
    upstream: UpstreamResponse,
    prepared: &PreparedConversation,
    ctx: &RequestContext,
    started: Instant,
) -> Result<Response, AppError> {
    let endpoint_id = upstream.endpoint_id;
    let mut body = upstream.response.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut accumulator = EventAccumulator::new(prepared.thinking_enabled());
    let mut collector = ResponseCollector::new();

    let mut timeout = first_event_timeout(&prepared.model);
    let read_timeout = Duration::from_secs(state.config.stream_read_timeout_secs);

    loop {
        let chunk = match tokio::time::timeout(timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                return Err(stream_failure(&state, &lease, endpoint_id, e.to_string(), ctx, prepared, started));
            }
            Ok(None) => break,
            Err(_) => {
                return Err(stream_failure(
                    &state,
                    &lease,
                    endpoint_id,
                    "upstream stream stalled".into(),
                    ctx,
                    prepared,
                    started,
                ));
            }
        };
        timeout = read_timeout;

        let frames = decoder.feed(&chunk).map_err(|e| {
            stream_failure(&state, &lease, endpoint_id, e.to_string(), ctx, prepared, started)
        })?;
        for frame in frames {
            for event in accumulator.handle(&frame.event_type, &frame.payload) {
                collector.absorb(&event);
            }
        }
    }
    for event in accumulator.finish() {
        collector.absorb(&event);
    }

    let usage = collector.finalize_usage(accumulator.usage());
    settle_success(&state, &lease, &usage, ctx, prepared, started, 200);

    let response = match ctx.dialect {
        Dialect::OpenAi => {
            axum::Json(openai_response(&prepared.model, &collector, &usage)).into_response()
        }
        Dialect::Anthropic => {
            axum::Json(anthropic_response(&prepared.model, &collector, &usage)).into_response()
        }
    };
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
fn stream_failure(
    state: &Arc<AppState>,
    lease: &CredentialLease,
    endpoint_id: &'static str,
    message: String,
    ctx: &RequestContext,
    prepared: &PreparedConversation,
    started: Instant,
) -> AppError {
    state.upstream.health.record_failure(endpoint_id);
    state.pool.record_error(lease.id(), CredentialErrorKind::Network);
    state.breaker.record_failure();
    let err = AppError::Upstream(message);
    log_failure(state, ctx, prepared, &err, started);
    err
}

fn settle_success(
    state: &Arc<AppState>,
    lease: &CredentialLease,
    usage: &UsageTotals,
    ctx: &RequestContext,
    prepared: &PreparedConversation,
    started: Instant,
    status: u16,
) {
    let tokens = usage.input_tokens + usage.output_tokens;
    state
        .pool
        .record_success(lease.id(), tokens, started.elapsed());
    state.breaker.record_success();
    state.metrics.record(RequestLogEntry {
        timestamp: Utc::now(),
        method: "POST".into(),
        path: ctx.dialect.path().into(),
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        model: Some(prepared.model.clone()),
        dialect: Some(ctx.dialect.as_str().into()),
        credential_id: Some(lease.id().to_string()),
        tokens,
        error_kind: None,
    });
}

fn log_failure(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    prepared: &PreparedConversation,
    error: &AppError,
    started: Instant,
) {
    let (status, kind) = error.status_and_kind();
    state.metrics.record(RequestLogEntry {
        timestamp: Utc::now(),
        method: "POST".into(),
        path: ctx.dialect.path().into(),
        status: status.as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
        model: Some(prepared.model.clone()),
        dialect: Some(ctx.dialect.as_str().into()),
        credential_id: None,
        tokens: 0,
        error_kind: Some(kind.to_string()),
    });
}

// ── Streaming ───────────────────────────────────────────────────

enum Encoder {
    OpenAi(OpenAiSseEncoder),
    Anthropic(AnthropicSseEncoder),
}

impl Encoder {
    fn start(&mut self) -> Vec<String> {
        match self {
            Encoder::OpenAi(e) => e.start(),
            Encoder::Anthropic(e) => e.start(),
        }
    }

    fn on_event(&mut self, event: &StreamEvent) -> Vec<String> {
        match self {
            Encoder::OpenAi(e) => e.on_event(event),
            Encoder::Anthropic(e) => e.on_event(event),
        }
    }

    fn finish(&mut self, usage: &UsageTotals) -> Vec<String> {
        match self {
            Encoder::OpenAi(e) => e.finish(usage),
            Encoder::Anthropic(e) => e.finish(usage),
        }
    }

    fn error(&mut self, message: &str, usage: &UsageTotals) -> Vec<String> {
        match self {
            Encoder::OpenAi(e) => e.error(message, usage),
            Encoder::Anthropic(e) => e.error(message, usage),
        }
    }

    fn ping(&self) -> String {
        match self {
            Encoder::OpenAi(_) => OpenAiSseEncoder::ping(),
            Encoder::Anthropic(_) => AnthropicSseEncoder::ping(),
        }
    }
}

fn stream_response(
    state: Arc<AppState>,
    lease: CredentialLease,
    upstream: UpstreamResponse,
    prepared: PreparedConversation,
    ctx: RequestContext,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(64);

    tokio::spawn(drive_stream(
        state, lease, upstream, prepared, ctx, started, tx,
    ));

    let body_stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, std::io::Error>(bytes), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body_stream))
        .expect("static response headers are valid")
}

/// Single producer (upstream decoder) → single consumer (client sink).
/// Owns the lease for the stream's entire lifetime.
async fn drive_stream(
    state: Arc<AppState>,
    lease: CredentialLease,
    upstream: UpstreamResponse,
    prepared: PreparedConversation,
    ctx: RequestContext,
    started: Instant,
    tx: mpsc::Sender<Bytes>,
) {
    let endpoint_id = upstream.endpoint_id;
    let mut body = upstream.response.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut accumulator = EventAccumulator::new(prepared.thinking_enabled());
    let mut collector = ResponseCollector::new();
    let mut sink = SseSink::new(tx);
    let mut encoder = match ctx.dialect {
        Dialect::OpenAi => Encoder::OpenAi(OpenAiSseEncoder::new(&prepared.model)),
        Dialect::Anthropic => Encoder::Anthropic(AnthropicSseEncoder::new(&prepared.model, 0)),
    };

    for block in encoder.start() {
        if !sink.write(&block).await {
            tracing::debug!("client disconnected before first event");
            return;
        }
    }

    let mut read_timeout = first_event_timeout(&prepared.model);
    let steady_timeout = Duration::from_secs(state.config.stream_read_timeout_secs);
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.reset();
    let mut flush_tick = tokio::time::interval(MICRO_BUFFER_WINDOW);
    let mut last_upstream_activity = Instant::now();

    let outcome: Result<(), String> = loop {
        tokio::select! {
            chunk = tokio::time::timeout(read_timeout, body.next()) => {
                match chunk {
                    Ok(Some(Ok(bytes))) => {
                        read_timeout = steady_timeout;
                        last_upstream_activity = Instant::now();
                        keepalive.reset();
                        let frames = match decoder.feed(&bytes) {
                            Ok(frames) => frames,
                            Err(e) => break Err(e.to_string()),
                        };
                        let mut client_gone = false;
                        for frame in frames {
                            for event in accumulator.handle(&frame.event_type, &frame.payload) {
                                collector.absorb(&event);
                                for block in encoder.on_event(&event) {
                                    if !sink.write(&block).await {
                                        client_gone = true;
                                        break;
                                    }
                                }
                                if client_gone { break; }
                            }
                            if client_gone { break; }
                        }
                        if client_gone {
                            tracing::debug!("client disconnected, cancelling upstream stream");
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => break Err(e.to_string()),
                    Ok(None) => break Ok(()),
                    Err(_) => break Err("upstream stream stalled".into()),
                }
            }
            _ = keepalive.tick() => {
                if last_upstream_activity.elapsed() >= MAX_STREAM_SILENCE {
                    break Err("stream abandoned after prolonged silence".into());
                }
                if !sink.write(&encoder.ping()).await || !sink.flush().await {
                    return;
                }
            }
            _ = flush_tick.tick(), if sink.has_pending() => {
                if !sink.flush().await {
                    return;
                }
            }
        }
    };

    match outcome {
        Ok(()) => {
            for event in accumulator.finish() {
                collector.absorb(&event);
                for block in encoder.on_event(&event) {
                    if !sink.write(&block).await {
                        return;
                    }
                }
            }
            let usage = collector.finalize_usage(accumulator.usage());
            for block in encoder.finish(&usage) {
                if !sink.write(&block).await {
                    return;
                }
            }
            sink.flush().await;
            settle_success(&state, &lease, &usage, &ctx, &prepared, started, 200);
        }
        Err(message) => {
            tracing::warn!("stream failed mid-flight: {}", message);
            state.upstream.health.record_failure(endpoint_id);
            state
                .pool
                .record_error(lease.id(), CredentialErrorKind::Network);
            state.breaker.record_failure();
            let usage = collector.finalize_usage(accumulator.usage());
            for block in encoder.error("stream interrupted", &usage) {
                if !sink.write(&block).await {
                    break;
                }
            }
            sink.flush().await;
            state.metrics.record(RequestLogEntry {
                timestamp: Utc::now(),
                method: "POST".into(),
                path: ctx.dialect.path().into(),
                status: 200, // headers were already sent
                duration_ms: started.elapsed().as_millis() as u64,
                model: Some(prepared.model.clone()),
                dialect: Some(ctx.dialect.as_str().into()),
                credential_id: Some(lease.id().to_string()),
                tokens: 0,
                error_kind: Some("stream_interrupted".into()),
            });
        }
    }
}
