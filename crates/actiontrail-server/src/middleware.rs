use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, Query, RawPathParams, Request, State};
use axum::http::{header, request::Parts};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use futures::stream;
use serde_json::{Map, Value};
use tracing::debug;

use actiontrail_engine::context::{self, SpanData, SpanSeed};
use actiontrail_engine::plugins::http::{http_action, Exchange, FRAMEWORK};
use actiontrail_engine::{Agent, RequestView};

use crate::control::{TrackControl, TrackMode, TrackedUser};

#[derive(Clone, Debug)]
pub struct InstrumentOptions {
    /// JSON bodies up to this size are captured; larger ones pass through
    /// unread.
    pub body_limit: usize,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self { body_limit: 64 * 1024 }
    }
}

#[derive(Clone)]
struct TrackState {
    agent: Agent,
    options: InstrumentOptions,
}

/// Track every matched route of `router`.
pub fn instrument<S>(router: Router<S>, agent: &Agent) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    instrument_with(router, agent, InstrumentOptions::default())
}

pub fn instrument_with<S>(router: Router<S>, agent: &Agent, options: InstrumentOptions) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let state = TrackState {
        agent: agent.clone(),
        options,
    };
    router.route_layer(middleware::from_fn_with_state(state, track_request))
}

async fn track_request(State(state): State<TrackState>, request: Request, next: Next) -> Response {
    context::run_once(SpanSeed::default(), async move {
        let control = TrackControl::default();
        let (mut parts, body) = request.into_parts();
        parts.extensions.insert(control.clone());

        let mut view = request_view(&mut parts).await;
        let (body, captured) = capture_body(&parts, body, state.options.body_limit).await;
        view.body = captured;

        let response = next.run(Request::from_parts(parts, body)).await;

        // Always inside `run_once`, so a span is active.
        let Some(span) = context::current() else {
            return response;
        };
        let changes = span.close();
        if let Some(user) = control.user() {
            apply_user(&mut view, user);
        }

        let agent = &state.agent;
        let draft = http_action(
            Exchange {
                view,
                status: response.status().as_u16(),
                span: SpanData {
                    changes,
                    ..span.data()
                },
                sensitive_keys: control.sensitive_keys(),
            },
            &agent.framework_options(FRAMEWORK),
        );

        let mode = control.mode();
        let tracked = match mode {
            TrackMode::Ignore => false,
            TrackMode::Force => true,
            TrackMode::Auto => agent.should_track_action(&draft),
        };
        debug!(
            trace_id = %span.trace_id(),
            verb = draft.verb(),
            object = draft.action.object.as_deref().unwrap_or_default(),
            ?mode,
            tracked,
            "http request finished"
        );
        if tracked {
            agent.enqueue_action(draft);
        }
        response
    })
    .await
}

async fn request_view(parts: &mut Parts) -> RequestView {
    let params = RawPathParams::from_request_parts(parts, &())
        .await
        .map(|raw| raw.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect())
        .unwrap_or_default();
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q.into_iter().map(|(k, v)| (k, Value::String(v))).collect::<Map<_, _>>())
        .unwrap_or_default();

    let mut view = RequestView {
        method: parts.method.as_str().to_owned(),
        path: parts.uri.path().to_owned(),
        matched_route: parts.extensions.get::<MatchedPath>().map(|m| m.as_str().to_owned()),
        params,
        query,
        ip: client_ip(parts),
        user_agent: header_str(parts, header::USER_AGENT.as_str()),
        ..Default::default()
    };
    if let Some(user) = parts.extensions.get::<TrackedUser>().cloned() {
        apply_user(&mut view, user);
    }
    view
}

fn apply_user(view: &mut RequestView, user: TrackedUser) {
    if user.id.is_some() {
        view.user_id = user.id;
    }
    view.user = user.user.or(view.user.take());
    view.session = user.session.or(view.session.take());
    view.auth = user.auth.or(view.auth.take());
}

fn header_str(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// First `x-forwarded-for` hop, else the peer address.
fn client_ip(parts: &Parts) -> Option<String> {
    header_str(parts, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_owned()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

/// Buffer a JSON body of known size within `limit` and hand back a replayable
/// copy. Anything else is forwarded untouched.
async fn capture_body(parts: &Parts, body: Body, limit: usize) -> (Body, Option<Value>) {
    let is_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    match length {
        Some(len) if is_json && len <= limit => match to_bytes(body, limit).await {
            Ok(bytes) => {
                let parsed = serde_json::from_slice(&bytes).ok();
                (Body::from(bytes), parsed)
            }
            Err(e) => {
                debug!(error = %e, "request body unreadable; not captured");
                // The handler sees the same failure it would have without us.
                let failed = stream::once(async move { Err::<Bytes, _>(e) });
                (Body::from_stream(failed), None)
            }
        },
        _ => (body, None),
    }
}
