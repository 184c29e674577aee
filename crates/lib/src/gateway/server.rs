use crate::channels::SlackCommand;
use crate::config;
use crate::filter::{self, FilterDecision};
use crate::integrations::{Integration, IntegrationKind};
use crate::pipeline::{self, AppContext};
use crate::verify::{self, Verification, VerifyParams};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// How long shutdown waits for in-flight tool sessions to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct GatewayState {
    pub ctx: Arc<AppContext>,
}

/// All routes. Exposed so tests can serve it on their own listener.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/webhook", get(verify_webhook))
        .route(
            "/chatwork/webhook",
            get(verify_webhook).post(chatwork_webhook),
        )
        .route("/slack/ask", get(verify_webhook).post(slack_ask))
        .route("/slack/crm", get(verify_webhook).post(slack_crm))
        .with_state(GatewayState { ctx })
}

pub async fn run_gateway(ctx: Arc<AppContext>) -> Result<()> {
    let bind = ctx.config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && ctx.verify_token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without a webhook verification secret (set WEBHOOK_VERIFY_TOKEN or gateway.verifyToken)",
            bind
        );
    }

    let bind_addr = format!("{}:{}", bind, ctx.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, router(Arc::clone(&ctx)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    drain_sessions(&ctx).await;
    log::info!("gateway stopped");
    Ok(())
}

/// Wait until every session permit is back, i.e. no tool session is open.
async fn drain_sessions(ctx: &AppContext) {
    let permits = ctx.config.policy.session_permits() as u32;
    match tokio::time::timeout(DRAIN_TIMEOUT, ctx.sessions.acquire_many(permits)).await {
        Ok(_) => log::info!("in-flight sessions closed"),
        Err(_) => log::warn!(
            "sessions still open after {:?}; their servers are killed on exit",
            DRAIN_TIMEOUT
        ),
    }
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.ctx.config.gateway.port,
    }))
}

/// GET subscription handshake. Never touches the pipeline.
async fn verify_webhook(
    State(state): State<GatewayState>,
    Query(params): Query<VerifyParams>,
) -> Verification {
    let result = verify::verify(&params, state.ctx.verify_token.as_deref());
    if result == Verification::Forbidden {
        log::warn!("webhook verification rejected: mode={:?}", params.mode);
    }
    result
}

fn enabled(state: &GatewayState, kind: IntegrationKind) -> Option<Arc<Integration>> {
    let found = state.ctx.integrations.get(kind);
    if found.is_none() {
        log::debug!("request for disabled integration {}", kind);
    }
    found
}

/// Filter, then hand accepted events to a supervised task. Returns before any heavy work.
fn accept(state: &GatewayState, integration: Arc<Integration>, event: crate::channels::InboundEvent) {
    match filter::evaluate(&event, &integration.rules) {
        FilterDecision::Accept { prompt } => {
            pipeline::spawn_supervised(Arc::clone(&state.ctx), integration, event, prompt);
        }
        FilterDecision::Ignore(reason) => log::debug!(
            "event ignored: integration={} message_id={} reason={:?}",
            integration.kind,
            event.message_id,
            reason
        ),
    }
}

/// POST /chatwork/webhook: Chatwork webhook JSON. 200 for anything well formed, 400 otherwise.
async fn chatwork_webhook(State(state): State<GatewayState>, body: Bytes) -> StatusCode {
    let Some(integration) = enabled(&state, IntegrationKind::Chatwork) else {
        return StatusCode::NOT_FOUND;
    };
    let event = match filter::chatwork_event(&body, state.ctx.chatwork_room.as_deref()) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("{}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    accept(&state, integration, event);
    StatusCode::OK
}

/// POST /slack/ask: slash command.
async fn slack_ask(State(state): State<GatewayState>, Form(command): Form<SlackCommand>) -> Response {
    slash_command(&state, IntegrationKind::Slack, command)
}

/// POST /slack/crm: slash command answered from the CRM.
async fn slack_crm(State(state): State<GatewayState>, Form(command): Form<SlackCommand>) -> Response {
    slash_command(&state, IntegrationKind::Crm, command)
}

fn slash_command(state: &GatewayState, kind: IntegrationKind, command: SlackCommand) -> Response {
    let Some(integration) = enabled(state, kind) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let event = match filter::slack_event(command, &integration.rules.trigger) {
        Ok(event) => event,
        Err(filter::FilterError::MalformedEvent { reason, .. }) => {
            log::warn!("malformed slash command: integration={} reason={}", kind, reason);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response();
        }
    };
    accept(state, integration, event);
    StatusCode::OK.into_response()
}
