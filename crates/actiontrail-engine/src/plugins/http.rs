//! Inbound HTTP requests as actions.
//!
//! The request/response plumbing lives with the server middleware; this
//! module holds the framework-independent half: the request view handed to
//! extractors, the per-framework options, and assembly of the `HTTP` action.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::{json, Map, Value};

use actiontrail_core::errors::PluginError;
use actiontrail_core::mask::remove_sensitive_keys;
use actiontrail_core::path::{as_identifier, get_path};
use actiontrail_core::{Action, Actor, Framework, ResponseSnapshot};

use crate::agent::Agent;
use crate::context::SpanData;
use crate::hooks::{Exports, Plugin};
use crate::settings::{FrameworkSettings, TrackOptions};

pub const FRAMEWORK: &str = "axum";

/// Where a user id is looked for when no extractor is configured.
const DEFAULT_USER_ID_PATHS: &[&str] = &[
    "userId",
    "user.id",
    "session.userId",
    "session.user.id",
    "auth.userId",
    "auth.user.id",
];

/// What extractors can see of an inbound request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestView {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Route template as registered with the router, e.g. `/users/{id}`.
    pub matched_route: Option<String>,
    /// Path parameters in declaration order.
    pub params: Vec<(String, String)>,
    pub query: Map<String, Value>,
    pub body: Option<Value>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub user: Option<Value>,
    pub session: Option<Value>,
    pub auth: Option<Value>,
}

impl RequestView {
    pub fn params_map(&self) -> Map<String, Value> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }

    /// JSON shape that dotted extractor paths resolve against.
    pub fn to_value(&self) -> Value {
        json!({
            "method": self.method,
            "path": self.path,
            "params": self.params_map(),
            "query": self.query,
            "body": self.body,
            "ip": self.ip,
            "userAgent": self.user_agent,
            "userId": self.user_id,
            "user": self.user,
            "session": self.session,
            "auth": self.auth,
        })
    }
}

pub type ExtractFn = dyn Fn(&RequestView) -> Option<Value> + Send + Sync;

/// Pulls one value out of a request.
#[derive(Clone)]
pub enum Extractor {
    /// Dotted path into [`RequestView::to_value`].
    Path(String),
    Static(Value),
    Func(Arc<ExtractFn>),
}

impl Extractor {
    pub fn func(f: impl Fn(&RequestView) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }

    pub fn extract(&self, view: &RequestView, rendered: &Value) -> Option<Value> {
        match self {
            Self::Path(path) => get_path(rendered, path).filter(|v| !v.is_null()).cloned(),
            Self::Static(value) => Some(value.clone()),
            Self::Func(f) => f(view),
        }
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Per-framework request data configuration.
#[derive(Clone, Debug, Default)]
pub struct FrameworkOptions {
    pub user_id: Option<Extractor>,
    /// Extra entries for the `USER` agent's meta.
    pub user_meta: BTreeMap<String, Extractor>,
}

impl FrameworkOptions {
    pub fn with_user_id(mut self, extractor: Extractor) -> Self {
        self.user_id = Some(extractor);
        self
    }

    pub fn with_user_meta(mut self, key: impl Into<String>, extractor: Extractor) -> Self {
        self.user_meta.insert(key.into(), extractor);
        self
    }

    /// Layer `other` over `self`: a set user id replaces, meta entries add.
    pub fn merge(&mut self, other: FrameworkOptions) {
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        self.user_meta.extend(other.user_meta);
    }
}

impl From<&FrameworkSettings> for FrameworkOptions {
    fn from(settings: &FrameworkSettings) -> Self {
        Self {
            user_id: settings.user_id.clone().map(Extractor::Path),
            user_meta: settings
                .user_meta
                .iter()
                .map(|(k, v)| (k.clone(), Extractor::Static(v.clone())))
                .collect(),
        }
    }
}

/// The configured extractor's result, else the first id found along the
/// default paths.
pub fn user_id(options: &FrameworkOptions, view: &RequestView, rendered: &Value) -> Option<String> {
    match &options.user_id {
        Some(extractor) => extractor.extract(view, rendered).as_ref().and_then(as_identifier),
        None => DEFAULT_USER_ID_PATHS
            .iter()
            .find_map(|path| get_path(rendered, path).and_then(as_identifier)),
    }
}

/// `/users/{id}` becomes `/users/:id`; `{*rest}` becomes `*rest`.
pub fn route_pattern(template: &str) -> String {
    template
        .split('/')
        .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) if name.starts_with('*') => name.to_owned(),
            Some(name) => format!(":{name}"),
            None => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Rebuild a route from the raw path by replacing parameter values with
/// `:{name}`.
pub fn full_route(path: &str, params: &[(String, String)]) -> String {
    let path = path.split('?').next().unwrap_or_default();
    path.split('/')
        .map(|part| {
            params
                .iter()
                .find(|(_, value)| !value.is_empty() && value == part)
                .map_or_else(|| part.to_owned(), |(name, _)| format!(":{name}"))
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn host_name() -> Option<&'static str> {
    static HOSTNAME: OnceLock<Option<String>> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .as_deref()
}

/// Everything the middleware knows once a response has been produced.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub view: RequestView,
    pub status: u16,
    /// Span state with the accumulated changes already drained.
    pub span: SpanData,
    /// Keys removed from this route's request snapshot.
    pub sensitive_keys: Vec<String>,
}

/// Assemble the `HTTP` action draft for one request.
pub fn http_action(exchange: Exchange, options: &FrameworkOptions) -> Action {
    let Exchange {
        view,
        status,
        span,
        sensitive_keys,
    } = exchange;
    let rendered = view.to_value();
    let keys: Vec<&str> = sensitive_keys.iter().map(String::as_str).collect();

    let object = match &view.matched_route {
        Some(template) => route_pattern(template),
        None => full_route(&view.path, &view.params),
    };

    let mut user_meta = Map::new();
    if let Some(ip) = &view.ip {
        user_meta.insert("ip".into(), Value::String(ip.clone()));
    }
    if let Some(ua) = &view.user_agent {
        user_meta.insert("userAgent".into(), Value::String(ua.clone()));
    }
    for (key, extractor) in &options.user_meta {
        if let Some(value) = extractor.extract(&view, &rendered) {
            user_meta.insert(key.clone(), value);
        }
    }
    let mut user = Actor::new("USER").with_meta(user_meta);
    user.id = user_id(options, &view, &rendered);

    let mut service = Actor::new("SERVICE");
    if let Some(host) = host_name() {
        service = service
            .with_id(host)
            .with_meta(Map::from_iter([("hostname".to_owned(), Value::String(host.to_owned()))]));
    }

    let mut request = Map::new();
    request.insert(
        "params".into(),
        remove_sensitive_keys(&Value::Object(view.params_map()), &keys),
    );
    request.insert(
        "query".into(),
        remove_sensitive_keys(&Value::Object(view.query.clone()), &keys),
    );
    if let Some(body) = &view.body {
        request.insert("body".into(), remove_sensitive_keys(body, &keys));
    }

    let mut action = Action::new("HTTP", view.method.clone())
        .with_object(object)
        .with_agent(user)
        .with_agent(service)
        .with_request(request)
        .with_trace_id(span.trace_id.clone());
    action.timestamp = Some(span.start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    action.session_id = span.session_id.clone();
    action.response = Some(ResponseSnapshot {
        status: Some(status.to_string()),
        time: Some(span.elapsed.as_secs_f64() * 1000.0),
        ..Default::default()
    });
    action.changes = span.changes;
    action
}

/// Marks the agent as serving HTTP through axum.
pub struct HttpPlugin;

impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        "http"
    }

    fn import_paths(&self) -> Vec<String> {
        vec![FRAMEWORK.to_owned()]
    }

    fn bootstrap(&self, agent: &Agent, exports: Arc<Exports>, version: &str) -> Result<Arc<Exports>, PluginError> {
        agent.set_framework(Framework::new(FRAMEWORK, version));

        let mut defaults = TrackOptions::default();
        for field in ["params", "query", "body"] {
            defaults.request.insert(field.to_owned(), true);
        }
        agent.set_track_defaults(&defaults);
        Ok(exports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Span, SpanSeed};
    use actiontrail_core::{Change, Operation};

    fn view() -> RequestView {
        RequestView {
            method: "PUT".into(),
            path: "/users/42".into(),
            matched_route: Some("/users/{id}".into()),
            params: vec![("id".into(), "42".into())],
            query: Map::from_iter([("verbose".to_owned(), json!("1"))]),
            body: Some(json!({"name": "Ann", "password": "pw", "pin": "1234"})),
            ip: Some("10.0.0.1".into()),
            user_agent: Some("curl/8".into()),
            auth: Some(json!({"userId": "u_7"})),
            ..Default::default()
        }
    }

    fn exchange(view: RequestView, sensitive_keys: Vec<String>) -> Exchange {
        let span = Span::new(SpanSeed::default());
        span.track_change(Change::new("users", Operation::Update));
        let changes = span.close();
        Exchange {
            view,
            status: 200,
            span: SpanData { changes, ..span.data() },
            sensitive_keys,
        }
    }

    #[test]
    fn route_templates() {
        assert_eq!(route_pattern("/users/{id}"), "/users/:id");
        assert_eq!(route_pattern("/files/{*rest}"), "/files/*rest");
        assert_eq!(route_pattern("/health"), "/health");
    }

    #[test]
    fn full_route_from_raw_path() {
        let params = vec![("org".to_owned(), "acme".to_owned()), ("id".to_owned(), "7".to_owned())];
        assert_eq!(full_route("/orgs/acme/users/7?x=1", &params), "/orgs/:org/users/:id");
        assert_eq!(full_route("/plain", &[]), "/plain");
    }

    #[test]
    fn default_user_id_chain() {
        let options = FrameworkOptions::default();
        let v = view();
        assert_eq!(user_id(&options, &v, &v.to_value()).as_deref(), Some("u_7"));

        let v = RequestView {
            user: Some(json!({"id": 99})),
            ..view()
        };
        assert_eq!(user_id(&options, &v, &v.to_value()).as_deref(), Some("99"));
    }

    #[test]
    fn configured_user_id_wins() {
        let options = FrameworkOptions::default().with_user_id(Extractor::Path("query.verbose".into()));
        let v = view();
        assert_eq!(user_id(&options, &v, &v.to_value()).as_deref(), Some("1"));

        let options = FrameworkOptions::default().with_user_id(Extractor::func(|_| Some(json!("fn-user"))));
        assert_eq!(user_id(&options, &v, &v.to_value()).as_deref(), Some("fn-user"));
    }

    #[test]
    fn builds_http_action() {
        let options = FrameworkOptions::default().with_user_meta("tier", Extractor::Static(json!("gold")));
        let action = http_action(exchange(view(), vec!["pin".into()]), &options);

        assert_eq!(action.kind(), "HTTP");
        assert_eq!(action.verb(), "PUT");
        assert_eq!(action.action.object.as_deref(), Some("/users/:id"));
        assert_eq!(action.trace_ids.len(), 1);
        assert_eq!(action.changes.len(), 1);

        let user = &action.agents[0];
        assert_eq!(user.kind, "USER");
        assert_eq!(user.id.as_deref(), Some("u_7"));
        let meta = user.meta.as_ref().unwrap();
        assert_eq!(meta["ip"], "10.0.0.1");
        assert_eq!(meta["userAgent"], "curl/8");
        assert_eq!(meta["tier"], "gold");
        assert_eq!(action.agents[1].kind, "SERVICE");

        let request = action.request.as_ref().unwrap();
        assert_eq!(request["params"], json!({"id": "42"}));
        // per-route keys go here; global masking happens in the builder
        assert_eq!(request["body"], json!({"name": "Ann", "password": "pw"}));

        let response = action.response.as_ref().unwrap();
        assert_eq!(response.status.as_deref(), Some("200"));
        assert!(response.time.unwrap() >= 0.0);
    }

    #[test]
    fn unmatched_route_falls_back_to_raw_path() {
        let v = RequestView {
            matched_route: None,
            ..view()
        };
        let action = http_action(exchange(v, Vec::new()), &FrameworkOptions::default());
        assert_eq!(action.action.object.as_deref(), Some("/users/:id"));
    }

    #[test]
    fn merge_keeps_existing_meta() {
        let mut options = FrameworkOptions::default().with_user_meta("a", Extractor::Static(json!(1)));
        options.merge(FrameworkOptions::default().with_user_meta("b", Extractor::Static(json!(2))));
        assert_eq!(options.user_meta.len(), 2);
        assert!(options.user_id.is_none());
    }

    #[test]
    fn from_settings() {
        let settings = FrameworkSettings {
            user_id: Some("auth.userId".into()),
            user_meta: BTreeMap::from([("region".to_owned(), json!("eu"))]),
        };
        let options = FrameworkOptions::from(&settings);
        assert!(matches!(options.user_id, Some(Extractor::Path(ref p)) if p == "auth.userId"));
        assert!(matches!(options.user_meta["region"], Extractor::Static(_)));
    }
}
