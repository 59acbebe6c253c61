//! Event hooks fired as modules change.
//!
//! Hosts register callbacks by event name. Triggering calls every callback
//! for the event in registration order and collects what they return. A
//! failing callback is logged and skipped so the others still run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use super::registry::ModuleState;

/// Fired when the registry changes a module's state.
pub const MODULE_STATE_CHANGED: &str = "module_state_changed";
/// Fired after an install operation succeeds.
pub const MODULE_INSTALLED: &str = "module_installed";
/// Fired after an upgrade operation succeeds.
pub const MODULE_UPGRADED: &str = "module_upgraded";
/// Fired after a remove operation succeeds.
pub const MODULE_REMOVED: &str = "module_removed";

/// What a callback receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookEvent {
    pub name: String,
    pub module: String,
    pub data: Value,
}

impl HookEvent {
    pub fn new(name: &str, module: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            data,
        }
    }

    pub fn state_changed(module: &str, from: ModuleState, to: ModuleState) -> Self {
        Self::new(
            MODULE_STATE_CHANGED,
            module,
            serde_json::json!({ "from": from, "to": to }),
        )
    }
}

pub type HookCallback = Arc<dyn Fn(&HookEvent) -> anyhow::Result<Value> + Send + Sync>;

/// Callbacks keyed by event name.
#[derive(Default)]
pub struct HookRegistry {
    callbacks: RwLock<HashMap<String, Vec<HookCallback>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, event: &str, callback: F)
    where
        F: Fn(&HookEvent) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(callback));
        debug!(event = %event, "registered hook");
    }

    /// Call every callback for `event.name`, returning the successful
    /// results in registration order.
    pub fn trigger(&self, event: &HookEvent) -> Vec<Value> {
        // Released before calling out so callbacks may register hooks.
        let callbacks: Vec<HookCallback> = self
            .callbacks
            .read()
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(callbacks.len());
        for callback in callbacks {
            match callback(event) {
                Ok(value) => results.push(value),
                Err(e) => error!(
                    event = %event.name,
                    module = %event.module,
                    error = %e,
                    "hook callback failed"
                ),
            }
        }
        results
    }

    pub fn has_hook(&self, event: &str) -> bool {
        self.callbacks
            .read()
            .get(event)
            .is_some_and(|callbacks| !callbacks.is_empty())
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.callbacks.read().get(event).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.callbacks.write().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn trigger_without_callbacks_is_empty() {
        let hooks = HookRegistry::new();
        assert!(!hooks.has_hook(MODULE_INSTALLED));
        assert!(hooks.trigger(&HookEvent::new(MODULE_INSTALLED, "crm", Value::Null)).is_empty());
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let hooks = HookRegistry::new();
        hooks.register(MODULE_INSTALLED, |event| Ok(json!(format!("first:{}", event.module))));
        hooks.register(MODULE_INSTALLED, |_| Ok(json!("second")));
        hooks.register(MODULE_REMOVED, |_| Ok(json!("other event")));

        let results = hooks.trigger(&HookEvent::new(MODULE_INSTALLED, "crm", Value::Null));
        assert_eq!(results, vec![json!("first:crm"), json!("second")]);
        assert_eq!(hooks.handler_count(MODULE_INSTALLED), 2);
    }

    #[test]
    fn failing_callback_is_skipped() {
        let hooks = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        hooks.register(MODULE_UPGRADED, |_| anyhow::bail!("listener offline"));
        let log = seen.clone();
        hooks.register(MODULE_UPGRADED, move |event| {
            log.lock().push(event.module.clone());
            Ok(Value::Null)
        });

        let results = hooks.trigger(&HookEvent::new(MODULE_UPGRADED, "sales", Value::Null));
        assert_eq!(results, vec![Value::Null]);
        assert_eq!(*seen.lock(), vec!["sales"]);
    }

    #[test]
    fn state_change_event_carries_both_states() {
        let event =
            HookEvent::state_changed("crm", ModuleState::ToInstall, ModuleState::Installed);
        assert_eq!(event.name, MODULE_STATE_CHANGED);
        assert_eq!(event.data, json!({ "from": "to_install", "to": "installed" }));
    }

    #[test]
    fn clear_drops_every_callback() {
        let hooks = HookRegistry::new();
        hooks.register(MODULE_REMOVED, |_| Ok(Value::Null));
        hooks.clear();
        assert_eq!(hooks.handler_count(MODULE_REMOVED), 0);
    }
}
