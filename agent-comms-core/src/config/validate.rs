//! Configuration validation rules.

use super::schema::Config;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();
    let bus = &config.bus;

    if bus.max_queue_size == 0 {
        errors.push("bus.max_queue_size must be > 0".to_string());
    }
    if bus.max_history_size == 0 {
        errors.push("bus.max_history_size must be > 0".to_string());
    }
    if bus.message_timeout_ms == 0 {
        errors.push("bus.message_timeout_ms must be > 0".to_string());
    }
    if bus.max_drain_per_cycle == 0 {
        errors.push("bus.max_drain_per_cycle must be > 0".to_string());
    }
    if bus.event_capacity == 0 {
        errors.push("bus.event_capacity must be > 0".to_string());
    }
    if bus.persist_messages {
        if bus.persist_tail == 0 {
            errors.push("bus.persist_tail must be > 0 when persistence is enabled".to_string());
        }
        if bus.message_persist_path.as_os_str().is_empty() {
            errors.push(
                "bus.message_persist_path is required when persistence is enabled".to_string(),
            );
        }
    }

    match config.logging.format.to_ascii_lowercase().as_str() {
        "text" | "json" => {}
        other => errors.push(format!("logging.format must be text or json, got {}", other)),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}
