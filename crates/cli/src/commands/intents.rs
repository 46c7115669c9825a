use opsbot_core::schema::IntentRegistry;

pub fn run() -> String {
    let registry = IntentRegistry::builtin();
    let mut lines = vec![format!("intent catalog ({} intents):", registry.len())];

    for schema in registry.iter() {
        let required = schema
            .required
            .iter()
            .map(|slot| slot.label())
            .collect::<Vec<_>>()
            .join(", ");
        let required = if required.is_empty() { "none".to_string() } else { required };
        let risk = if schema.destructive { " [destructive, confirmation required]" } else { "" };
        lines.push(format!(
            "  {:<18} {} (requires: {required}){risk}",
            schema.name.as_str(),
            schema.description
        ));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    #[test]
    fn catalog_listing_flags_destructive_intents() {
        let output = super::run();
        assert!(output.contains("vm_delete"));
        assert!(output.contains("[destructive, confirmation required]"));
        assert!(output.contains("requires: VM id"));
    }
}
