//! Action Catalog - registry of remediation actions per fault category.
//!
//! A pure lookup, loaded once at startup. Ordering is deterministic:
//! configuration priority overrides first (in list order), then declared
//! priority, then registration order, with name as the final tie-breaker so
//! test runs are reproducible.

use std::collections::HashMap;

use remedy_common::{ActionDefinition, Capability, FaultCategory};
use tracing::info;

/// Registry mapping a fault category to ordered candidate actions.
pub struct ActionCatalog {
    entries: HashMap<FaultCategory, Vec<Registered>>,
}

struct Registered {
    def: ActionDefinition,
    order: usize,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Catalog with the built-in action families registered.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        register_builtins(&mut catalog);
        info!(
            "Action catalog loaded: {} actions across {} categories",
            catalog.len(),
            catalog.entries.len()
        );
        catalog
    }

    pub fn register(&mut self, category: FaultCategory, def: ActionDefinition) {
        let list = self.entries.entry(category).or_default();
        let order = list.len();
        list.push(Registered { def, order });
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered candidates for a category. `priority_override` is the
    /// config-supplied action-name list for this category, if any.
    pub fn candidates_for(
        &self,
        category: FaultCategory,
        priority_override: Option<&[String]>,
    ) -> Vec<ActionDefinition> {
        let Some(list) = self.entries.get(&category) else {
            return Vec::new();
        };

        let override_rank = |name: &str| -> usize {
            priority_override
                .and_then(|names| names.iter().position(|n| n == name))
                .unwrap_or(usize::MAX)
        };

        let mut ranked: Vec<&Registered> = list.iter().collect();
        ranked.sort_by(|a, b| {
            override_rank(&a.def.name)
                .cmp(&override_rank(&b.def.name))
                .then(a.def.priority.cmp(&b.def.priority))
                .then(a.order.cmp(&b.order))
                .then(a.def.name.cmp(&b.def.name))
        });

        ranked.into_iter().map(|r| r.def.clone()).collect()
    }

    pub fn categories(&self) -> Vec<FaultCategory> {
        self.entries.keys().copied().collect()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn action(
    name: &str,
    capability: Capability,
    command: &str,
    params: &[(&str, &str)],
    timeout_secs: u64,
    idempotent: bool,
    priority: u8,
) -> ActionDefinition {
    ActionDefinition {
        name: name.to_string(),
        capability,
        command: command.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        timeout_secs,
        idempotent,
        priority,
    }
}

/// Built-in action families: service-level, container-level, resource-level.
fn register_builtins(catalog: &mut ActionCatalog) {
    // Service-level
    catalog.register(
        FaultCategory::ServiceDown,
        action(
            "restart-service",
            Capability::Service,
            "systemctl restart {resource}",
            &[],
            30,
            true,
            10,
        ),
    );
    catalog.register(
        FaultCategory::ServiceDown,
        action(
            "reset-failed-unit",
            Capability::Service,
            "systemctl reset-failed {resource} && systemctl start {resource}",
            &[],
            30,
            true,
            20,
        ),
    );
    catalog.register(
        FaultCategory::ServiceDown,
        action(
            "repair-state-permissions",
            Capability::Service,
            "chmod -R u+rwX {state_dir} && systemctl restart {resource}",
            &[("state_dir", "/var/lib/{resource}")],
            60,
            true,
            30,
        ),
    );
    catalog.register(
        FaultCategory::ServiceDown,
        action(
            "clear-service-cache",
            Capability::Service,
            "find {cache_dir} -mindepth 1 -delete && systemctl restart {resource}",
            &[("cache_dir", "/var/cache/{resource}")],
            60,
            false,
            40,
        ),
    );

    // Container-level
    catalog.register(
        FaultCategory::ContainerCrash,
        action(
            "restart-container",
            Capability::Container,
            "docker restart {resource}",
            &[],
            60,
            true,
            10,
        ),
    );
    catalog.register(
        FaultCategory::ContainerCrash,
        action(
            "start-container",
            Capability::Container,
            "docker start {resource}",
            &[],
            60,
            true,
            20,
        ),
    );
    catalog.register(
        FaultCategory::ContainerCrash,
        action(
            "recreate-container",
            Capability::Container,
            "docker stop {resource}; docker rm -f {resource} && docker run -d --name {resource} {image}",
            &[("image", "")],
            120,
            false,
            30,
        ),
    );

    // Resource-level
    catalog.register(
        FaultCategory::ResourceExhaustion,
        action(
            "kill-runaway-process",
            Capability::Resource,
            "ps -eo pid= --sort=-%cpu | head -1 | xargs -r kill -TERM",
            &[],
            15,
            false,
            10,
        ),
    );
    catalog.register(
        FaultCategory::ResourceExhaustion,
        action(
            "vacuum-journal",
            Capability::Resource,
            "journalctl --vacuum-time={keep_days}d",
            &[("keep_days", "7")],
            120,
            true,
            20,
        ),
    );
    catalog.register(
        FaultCategory::ResourceExhaustion,
        action(
            "prune-tmp-files",
            Capability::Resource,
            "find /tmp -type f -atime +{min_age_days} -delete",
            &[("min_age_days", "2")],
            120,
            true,
            30,
        ),
    );

    // Network path restoration
    catalog.register(
        FaultCategory::NetworkBroken,
        action(
            "bounce-interface",
            Capability::Resource,
            "ip link set {interface} down && ip link set {interface} up",
            &[("interface", "eth0")],
            30,
            true,
            10,
        ),
    );
    catalog.register(
        FaultCategory::NetworkBroken,
        action(
            "restart-networking",
            Capability::Resource,
            "systemctl restart systemd-networkd",
            &[],
            60,
            true,
            20,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_action(name: &str, priority: u8) -> ActionDefinition {
        action(name, Capability::Service, "true", &[], 5, true, priority)
    }

    #[test]
    fn test_builtin_catalog_covers_categories() {
        let catalog = ActionCatalog::with_builtins();
        for category in [
            FaultCategory::ServiceDown,
            FaultCategory::ContainerCrash,
            FaultCategory::ResourceExhaustion,
            FaultCategory::NetworkBroken,
        ] {
            assert!(
                !catalog.candidates_for(category, None).is_empty(),
                "no actions for {}",
                category
            );
        }
        // Custom has no built-ins; detectors register their own
        assert!(catalog
            .candidates_for(FaultCategory::Custom, None)
            .is_empty());
    }

    #[test]
    fn test_ordering_by_declared_priority() {
        let mut catalog = ActionCatalog::new();
        catalog.register(FaultCategory::ServiceDown, test_action("second", 20));
        catalog.register(FaultCategory::ServiceDown, test_action("first", 10));

        let names: Vec<String> = catalog
            .candidates_for(FaultCategory::ServiceDown, None)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_registration_order_breaks_priority_ties() {
        let mut catalog = ActionCatalog::new();
        catalog.register(FaultCategory::ServiceDown, test_action("alpha", 10));
        catalog.register(FaultCategory::ServiceDown, test_action("beta", 10));

        let names: Vec<String> = catalog
            .candidates_for(FaultCategory::ServiceDown, None)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_config_override_wins() {
        let catalog = ActionCatalog::with_builtins();
        let override_list = vec![
            "clear-service-cache".to_string(),
            "restart-service".to_string(),
        ];
        let names: Vec<String> = catalog
            .candidates_for(FaultCategory::ServiceDown, Some(&override_list))
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names[0], "clear-service-cache");
        assert_eq!(names[1], "restart-service");
        // Actions not in the override keep their catalog ordering after it
        assert!(names.contains(&"reset-failed-unit".to_string()));
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let catalog = ActionCatalog::with_builtins();
        let a = catalog.candidates_for(FaultCategory::ResourceExhaustion, None);
        let b = catalog.candidates_for(FaultCategory::ResourceExhaustion, None);
        let names =
            |v: &[ActionDefinition]| v.iter().map(|d| d.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
    }
}
