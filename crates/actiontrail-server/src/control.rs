use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use parking_lot::Mutex;
use serde_json::Value;
use tower::{Layer, Service};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrackMode {
    /// Defer to the agent's tracking filter.
    #[default]
    Auto,
    Force,
    Ignore,
}

/// Authenticated caller as the host application knows it. Insert it as a
/// request extension ahead of the instrumentation, or hand it to
/// [`TrackControl::set_user`] from inside a handler.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackedUser {
    pub id: Option<String>,
    pub user: Option<Value>,
    pub session: Option<Value>,
    pub auth: Option<Value>,
}

impl TrackedUser {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    mode: TrackMode,
    sensitive_keys: Vec<String>,
    user: Option<TrackedUser>,
}

/// Per-request tracking directives, shared between the instrumentation and
/// anything running inside the request. Available to handlers as an
/// `Extension<TrackControl>`.
#[derive(Clone, Debug, Default)]
pub struct TrackControl(Arc<Mutex<ControlState>>);

impl TrackControl {
    /// Track this request even if the filter would skip it, removing `keys`
    /// from its request snapshot. Has no effect once ignored.
    pub fn force<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.0.lock();
        if state.mode != TrackMode::Ignore {
            state.mode = TrackMode::Force;
        }
        state.sensitive_keys.extend(keys.into_iter().map(Into::into));
    }

    pub fn ignore(&self) {
        self.0.lock().mode = TrackMode::Ignore;
    }

    pub fn mode(&self) -> TrackMode {
        self.0.lock().mode
    }

    pub fn sensitive_keys(&self) -> Vec<String> {
        self.0.lock().sensitive_keys.clone()
    }

    pub fn set_user(&self, user: TrackedUser) {
        self.0.lock().user = Some(user);
    }

    pub fn user(&self) -> Option<TrackedUser> {
        self.0.lock().user.clone()
    }
}

#[derive(Clone, Debug)]
enum Directive {
    Force(Vec<String>),
    Ignore,
}

/// Route-level layer applying a tracking directive.
#[derive(Clone, Debug)]
pub struct TrackControlLayer {
    directive: Directive,
}

/// Always track the routes this layer wraps, removing `sensitive_keys` from
/// their request snapshots.
pub fn force_track<I, S>(sensitive_keys: I) -> TrackControlLayer
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    TrackControlLayer {
        directive: Directive::Force(sensitive_keys.into_iter().map(Into::into).collect()),
    }
}

/// Never track the routes this layer wraps.
pub fn ignore() -> TrackControlLayer {
    TrackControlLayer {
        directive: Directive::Ignore,
    }
}

impl<S> Layer<S> for TrackControlLayer {
    type Service = TrackControlService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackControlService {
            inner,
            directive: self.directive.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackControlService<S> {
    inner: S,
    directive: Directive,
}

impl<S, B> Service<Request<B>> for TrackControlService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Without instrumentation there is no control handle; pass through.
        if let Some(control) = req.extensions().get::<TrackControl>() {
            match &self.directive {
                Directive::Force(keys) => control.force(keys.iter().cloned()),
                Directive::Ignore => control.ignore(),
            }
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_wins_over_force() {
        let control = TrackControl::default();
        control.ignore();
        control.force(["pin"]);
        assert_eq!(control.mode(), TrackMode::Ignore);

        let control = TrackControl::default();
        control.force(["pin"]);
        control.ignore();
        assert_eq!(control.mode(), TrackMode::Ignore);
    }

    #[test]
    fn force_accumulates_keys() {
        let control = TrackControl::default();
        control.force(["pin"]);
        control.force(vec!["otp".to_owned()]);
        assert_eq!(control.mode(), TrackMode::Force);
        assert_eq!(control.sensitive_keys(), vec!["pin", "otp"]);
    }

    #[test]
    fn clones_share_state() {
        let control = TrackControl::default();
        control.clone().set_user(TrackedUser::with_id("u1"));
        assert_eq!(control.user().unwrap().id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn layer_applies_directive() {
        use tower::ServiceExt;

        let control = TrackControl::default();
        let svc = ignore().layer(tower::service_fn(|_req: Request<()>| async {
            Ok::<_, std::convert::Infallible>(())
        }));
        let mut req = Request::new(());
        req.extensions_mut().insert(control.clone());
        svc.oneshot(req).await.unwrap();
        assert_eq!(control.mode(), TrackMode::Ignore);
    }
}
