//! Sample activities available to every workflow.
//!
//! Script activities found in the activities directory are registered after
//! these, so a script with the same name replaces the built-in.

use localflow_core::activity::ActivityRegistry;

const BUILTINS: &[(&str, &str)] = &[
    ("charge_card", "Card charged successfully"),
    ("send_email", "Email sent successfully"),
    ("update_crm", "CRM updated successfully"),
];

pub fn register_builtin_activities(registry: &mut ActivityRegistry) {
    for &(name, message) in BUILTINS {
        registry.register_fn(name, move || {
            tracing::info!(activity = name, "running built-in activity");
            Ok(message.to_string())
        });
    }
}
