//! Handlers for the commands every worker answers.

use crate::protocol::builtin;
use crate::protocol::command::FieldValues;
use crate::worker::dispatcher::Registry;

pub(crate) fn register(registry: &mut Registry) {
    registry.register(builtin::ECHO, |args| {
        let text = args.get_str("text").unwrap_or_default();
        Ok(FieldValues::new().with("text", text))
    });
    registry.register(builtin::PID, |_args| {
        Ok(FieldValues::new().with("pid", std::process::id() as i64))
    });
    // the dispatcher closes the connection after acknowledging
    registry.register(builtin::SHUTDOWN, |_args| Ok(FieldValues::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_round_trips_text() {
        let registry = Registry::with_builtins();
        let (_, handler) = registry.get("echo").unwrap();
        let args = FieldValues::new().with("text", "ping");
        let response = handler(&args).unwrap();
        assert_eq!(response.get_str("text"), Some("ping"));
    }

    #[test]
    fn test_pid_reports_own_process() {
        let registry = Registry::with_builtins();
        let (_, handler) = registry.get("pid").unwrap();
        let response = handler(&FieldValues::new()).unwrap();
        assert_eq!(response.get_int("pid"), Some(std::process::id() as i64));
    }

    #[test]
    fn test_shutdown_answers_empty() {
        let registry = Registry::with_builtins();
        let (_, handler) = registry.get("shutdown").unwrap();
        let response = handler(&FieldValues::new()).unwrap();
        assert!(response.is_empty());
    }
}
