use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::wrap::{Hookable, Unwrap};

/// The public surface of a host module, as handed to adapters at load time.
///
/// Members are stored type-erased; an adapter asks for a member by name and
/// by the function shape it expects. A name that is missing, or registered
/// with a different shape, is treated the same way: not wrappable.
pub struct Exports {
    module: String,
    members: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Exports {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            members: HashMap::new(),
        }
    }

    pub fn with_member<F>(mut self, name: impl Into<String>, f: Arc<F>) -> Self
    where
        F: ?Sized + Send + Sync + 'static,
    {
        self.members.insert(name.into(), Box::new(Hookable::new(f)));
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// The replaceable slot for `name`, if it exists with shape `F`.
    pub fn hookable<F>(&self, name: &str) -> Option<&Hookable<F>>
    where
        F: ?Sized + Send + Sync + 'static,
    {
        self.members.get(name)?.downcast_ref::<Hookable<F>>()
    }

    /// The implementation currently installed for `name`.
    pub fn get<F>(&self, name: &str) -> Option<Arc<F>>
    where
        F: ?Sized + Send + Sync + 'static,
    {
        self.hookable::<F>(name).map(Hookable::get)
    }

    /// Wrap member `name` at most once. Returns `None` when the member is
    /// absent, has a different shape, or is already wrapped.
    pub fn wrap<F>(&self, name: &str, transform: impl FnOnce(Arc<F>) -> Arc<F>) -> Option<Unwrap<F>>
    where
        F: ?Sized + Send + Sync + 'static,
    {
        let Some(member) = self.hookable::<F>(name) else {
            debug!(module = %self.module, member = name, "member not wrappable");
            return None;
        };
        let handle = member.wrap(transform);
        if handle.is_none() {
            debug!(module = %self.module, member = name, "member already wrapped");
        }
        handle
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.member_names().collect();
        names.sort_unstable();
        f.debug_struct("Exports")
            .field("module", &self.module)
            .field("members", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Greet = dyn Fn(&str) -> String + Send + Sync;
    type Count = dyn Fn() -> usize + Send + Sync;

    fn module() -> Exports {
        let greet: Arc<Greet> = Arc::new(|name: &str| format!("hello {name}"));
        Exports::new("greeter").with_member("greet", greet)
    }

    #[test]
    fn lookup_by_name_and_shape() {
        let exports = module();
        assert!(exports.contains("greet"));
        assert_eq!(exports.get::<Greet>("greet").unwrap()("bob"), "hello bob");
        assert!(exports.get::<Count>("greet").is_none());
        assert!(exports.get::<Greet>("missing").is_none());
    }

    #[test]
    fn wrap_missing_or_mismatched_member_is_none() {
        let exports = module();
        assert!(exports.wrap::<Greet>("missing", |f| f).is_none());
        assert!(exports.wrap::<Count>("greet", |f| f).is_none());
    }

    #[test]
    fn wrap_is_visible_through_get() {
        let exports = module();
        let handle = exports
            .wrap::<Greet>("greet", |orig| {
                Arc::new(move |name: &str| orig(name).to_uppercase()) as Arc<Greet>
            })
            .unwrap();
        assert_eq!(exports.get::<Greet>("greet").unwrap()("bob"), "HELLO BOB");
        assert!(exports.wrap::<Greet>("greet", |f| f).is_none());

        assert!(handle.restore());
        assert_eq!(exports.get::<Greet>("greet").unwrap()("bob"), "hello bob");
    }

    #[test]
    fn debug_lists_members() {
        let rendered = format!("{:?}", module());
        assert!(rendered.contains("greeter"));
        assert!(rendered.contains("greet"));
    }
}
