//! Topic allow-list and notification builders.

use kubechat_protocol::{
    CommandStatus, NotificationPayload, Priority, ServerMessage, StatusPayload, Topic,
};
use log::warn;
use serde_json::{Map, Value, json};

use crate::commands::CommandExecution;

/// Split requested names into known topics and rejected names.
///
/// Known topics keep request order, each at most once.
pub fn filter_topics(requested: &[String]) -> (Vec<Topic>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for name in requested {
        match Topic::parse(name.trim()) {
            Some(topic) if !known.contains(&topic) => known.push(topic),
            Some(_) => {}
            None => unknown.push(name.clone()),
        }
    }
    (known, unknown)
}

/// Filter and log, as done on every subscribe/unsubscribe request.
pub fn resolve_topics(session_id: &str, requested: &[String]) -> Vec<Topic> {
    let (known, unknown) = filter_topics(requested);
    if !unknown.is_empty() {
        warn!(
            "session {}: ignoring unknown topics {:?}",
            session_id, unknown
        );
    }
    known
}

fn topic_names(topics: &[Topic]) -> Value {
    Value::Array(topics.iter().map(|t| Value::from(t.as_str())).collect())
}

pub fn subscription_status(status: &str, topics: &[Topic]) -> ServerMessage {
    let message = match status {
        "subscribed" => format!("Subscribed to {} topic(s)", topics.len()),
        _ => format!("Unsubscribed from {} topic(s)", topics.len()),
    };
    ServerMessage::Status(
        StatusPayload::new("subscription", status, message).with_metadata("topics", topic_names(topics)),
    )
}

/// Published on [`Topic::Commands`] whenever a command reaches a terminal state.
pub fn command_notification(execution: &CommandExecution) -> ServerMessage {
    let (title, priority) = match execution.status {
        CommandStatus::Completed => ("Command completed", Priority::Normal),
        CommandStatus::Cancelled => ("Command cancelled", Priority::Low),
        _ => ("Command failed", Priority::High),
    };
    let mut data = Map::new();
    data.insert("command_id".into(), json!(execution.id));
    data.insert("session_id".into(), json!(execution.session_id));
    data.insert("command".into(), json!(execution.command));
    data.insert("status".into(), json!(execution.status));
    data.insert("safety_level".into(), json!(execution.safety_level));
    data.insert("duration_ms".into(), json!(execution.duration_ms()));
    if let Some(user_id) = &execution.user_id {
        data.insert("user_id".into(), json!(user_id));
    }
    if let Some(code) = execution.exit_code {
        data.insert("exit_code".into(), json!(code));
    }
    ServerMessage::Notification(NotificationPayload {
        kind: "command_execution".to_string(),
        title: title.to_string(),
        message: format!("{} ({})", execution.command, execution.status),
        priority,
        data,
    })
}

/// Published on [`Topic::UserActivity`] when a user's session authenticates or leaves.
pub fn user_activity_notification(activity: &str, user_id: &str, username: &str, session_id: &str) -> ServerMessage {
    let mut data = Map::new();
    data.insert("user_id".into(), json!(user_id));
    data.insert("username".into(), json!(username));
    data.insert("session_id".into(), json!(session_id));
    data.insert("activity".into(), json!(activity));
    ServerMessage::Notification(NotificationPayload {
        kind: "user_activity".to_string(),
        title: "User activity".to_string(),
        message: format!("{} {}", username, activity.replace('_', " ")),
        priority: Priority::Low,
        data,
    })
}

/// Free-form notification for the `system` and `alerts` topics.
pub fn notice(kind: &str, title: impl Into<String>, message: impl Into<String>, priority: Priority) -> ServerMessage {
    ServerMessage::Notification(NotificationPayload {
        kind: kind.to_string(),
        title: title.into(),
        message: message.into(),
        priority,
        data: Map::new(),
    })
}
