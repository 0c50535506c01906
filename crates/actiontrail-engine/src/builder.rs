//! Turns action drafts into finished, masked records.

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use actiontrail_core::mask::Masker;
use actiontrail_core::{Action, Framework, ResponseSnapshot};

use crate::settings::{AgentSettings, TrackOptions};

/// Identity fields stamped on every action.
#[derive(Clone, Debug)]
struct Identity {
    client_id: String,
    app: Option<String>,
    environment: String,
}

pub struct ActionBuilder {
    identity: Identity,
    masker: Masker,
    framework: RwLock<Option<Framework>>,
    track: RwLock<TrackOptions>,
}

impl ActionBuilder {
    /// Expects settings already passed through [`AgentSettings::resolved`].
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            identity: Identity {
                client_id: settings.application_id.clone(),
                app: settings.app.clone(),
                environment: settings.environment.clone(),
            },
            masker: Masker::new(&settings.mask),
            framework: RwLock::new(None),
            track: RwLock::new(settings.track.clone()),
        }
    }

    pub fn masker(&self) -> &Masker {
        &self.masker
    }

    pub fn framework(&self) -> Option<Framework> {
        self.framework.read().clone()
    }

    pub fn set_framework(&self, framework: Framework) {
        *self.framework.write() = Some(framework);
    }

    pub fn track_options(&self) -> TrackOptions {
        self.track.read().clone()
    }

    /// Fill tracking configuration the user left unset.
    pub fn set_track_defaults(&self, defaults: &TrackOptions) {
        self.track.write().fill_defaults(defaults);
    }

    pub fn should_track(&self, action: &Action) -> bool {
        self.track.read().allows(action.kind(), action.verb())
    }

    /// Filter, mask and stamp a draft.
    pub fn create_action(&self, mut action: Action) -> Action {
        if let Some(request) = action.request.take() {
            action.request = Some(self.masker.mask_map(&self.filter_request(request)));
        }
        if let Some(response) = action.response.take() {
            action.response = Some(self.mask_response(response));
        }
        if let Some(meta) = action.meta.take() {
            action.meta = Some(self.masker.mask_map(&meta));
        }
        for change in &mut action.changes {
            for section in [&mut change.before, &mut change.after, &mut change.meta] {
                if let Some(map) = section.take() {
                    *section = Some(self.masker.mask_map(&map));
                }
            }
        }
        for actor in action.agents.iter_mut().chain(action.targets.iter_mut()) {
            if let Some(meta) = actor.meta.take() {
                actor.meta = Some(self.masker.mask_map(&meta));
            }
        }

        if action.timestamp.is_none() {
            action.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        action.client_id = Some(self.identity.client_id.clone());
        action.app = self.identity.app.clone();
        action.environment = Some(self.identity.environment.clone());
        action.framework = self.framework();
        action
    }

    fn filter_request(&self, mut request: Map<String, Value>) -> Map<String, Value> {
        let track = self.track.read();
        request.retain(|field, _| track.request_field_enabled(field));
        request
    }

    fn mask_response(&self, mut response: ResponseSnapshot) -> ResponseSnapshot {
        response.headers = response.headers.map(|h| self.masker.mask_map(&h));
        response.body = response.body.map(|b| self.masker.mask(&b));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actiontrail_core::{Actor, Change, Operation};
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn builder() -> ActionBuilder {
        let mut settings = AgentSettings::for_application("app-1");
        settings.app = Some("billing".into());
        ActionBuilder::new(&settings.resolved())
    }

    #[test]
    fn masks_request_and_stamps_identity() {
        let draft = Action::new("HTTP", "POST")
            .with_object("/users")
            .with_request(obj(json!({"body": {"password": "x", "name": "Ann"}})));

        let action = builder().create_action(draft);
        let request = action.request.unwrap();
        assert_eq!(request["body"], json!({"name": "Ann"}));
        assert!(action.timestamp.is_some());
        assert_eq!(action.client_id.as_deref(), Some("app-1"));
        assert_eq!(action.app.as_deref(), Some("billing"));
        assert_eq!(action.environment.as_deref(), Some("production"));
    }

    #[test]
    fn keeps_existing_timestamp() {
        let mut draft = Action::new("HTTP", "POST");
        draft.timestamp = Some("2024-01-01T00:00:00.000Z".into());
        let action = builder().create_action(draft);
        assert_eq!(action.timestamp.as_deref(), Some("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn drops_disabled_request_fields() {
        let mut settings = AgentSettings::for_application("app-1");
        settings.track.request.insert("body".into(), false);
        let builder = ActionBuilder::new(&settings);

        let draft = Action::new("HTTP", "PUT").with_request(obj(json!({
            "body": {"name": "Ann"},
            "query": {"page": 1}
        })));
        let request = builder.create_action(draft).request.unwrap();
        assert!(!request.contains_key("body"));
        assert_eq!(request["query"], json!({"page": 1}));
    }

    #[test]
    fn masks_every_section() {
        let mut draft = Action::new("HTTP", "POST")
            .with_agent(Actor::new("USER").with_meta(obj(json!({"ip": "::1", "token": "t"}))))
            .with_change(
                Change::new("users", Operation::Update)
                    .with_before(obj(json!({"password": "old"})))
                    .with_after(obj(json!({"password": "new", "name": "B"})))
                    .with_meta(obj(json!({"values": [{"secret": 1}]}))),
            );
        draft.targets = vec![Actor::new("ACCOUNT").with_meta(obj(json!({"name": "acct", "password": "hunter2"})))];
        draft.meta = Some(obj(json!({"api_key": "k", "note": "n"})));
        draft.response = Some(ResponseSnapshot {
            status: Some("200".into()),
            body: Some(json!({"user": {"token": "t", "id": 1}})),
            ..Default::default()
        });

        let action = builder().create_action(draft);
        let rendered = serde_json::to_string(&action).unwrap();
        for key in ["password", "token", "api_key", "secret"] {
            assert!(!rendered.contains(&format!("\"{key}\"")), "{key} leaked: {rendered}");
        }
        assert_eq!(action.changes[0].after.as_ref().unwrap()["name"], "B");
        assert_eq!(action.targets[0].meta.as_ref().unwrap()["name"], "acct");
        assert_eq!(action.response.unwrap().body.unwrap(), json!({"user": {"id": 1}}));
    }

    #[test]
    fn should_track_truth_table() {
        let builder = builder();
        assert!(builder.should_track(&Action::new("HTTP", "POST")));
        assert!(builder.should_track(&Action::new("HTTP", "DELETE")));
        assert!(!builder.should_track(&Action::new("HTTP", "GET")));
        assert!(builder.should_track(&Action::new("JOB", "RUN")));
    }

    #[test]
    fn framework_is_stamped_once_set() {
        let builder = builder();
        assert!(builder.create_action(Action::new("HTTP", "POST")).framework.is_none());
        builder.set_framework(Framework::new("axum", "0.8"));
        let action = builder.create_action(Action::new("HTTP", "POST"));
        assert_eq!(action.framework.unwrap().name.as_deref(), Some("axum"));
    }

    #[test]
    fn track_defaults_do_not_override_user_choices() {
        let mut settings = AgentSettings::for_application("app-1");
        settings.track.request.insert("body".into(), false);
        let builder = ActionBuilder::new(&settings);

        let mut defaults = TrackOptions::default();
        defaults.request.insert("body".into(), true);
        defaults.request.insert("params".into(), true);
        builder.set_track_defaults(&defaults);

        let track = builder.track_options();
        assert!(!track.request_field_enabled("body"));
        assert_eq!(track.request.get("params"), Some(&true));
    }
}
