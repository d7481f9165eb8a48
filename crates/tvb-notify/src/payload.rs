//! Webhook payload construction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tvb_core::{BotIdentity, NotificationEvent};

/// Action names listed in a batched payload.
pub const MAX_BATCHED_ACTIONS: usize = 3;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    identity: &'a BotIdentity,
    action: &'static str,
    details: Map<String, Value>,
    timestamp: String,
    bot_secret: &'a str,
}

/// Build the JSON body for `primary`, summarising `batched` inside its details.
pub fn build_payload(
    identity: &BotIdentity,
    primary: &NotificationEvent,
    batched: &[NotificationEvent],
    secret: &str,
    timestamp: DateTime<Utc>,
) -> Value {
    let mut details = primary.details.clone();
    if !details.contains_key("message") {
        details.insert(
            "message".to_string(),
            Value::String(primary.action.default_message(&identity.display_name)),
        );
    }

    if !batched.is_empty() {
        details.insert("batchedUpdates".to_string(), Value::from(batched.len()));
        let actions: Vec<Value> = batched
            .iter()
            .take(MAX_BATCHED_ACTIONS)
            .map(|e| Value::from(e.action.as_str()))
            .collect();
        details.insert("batchedActions".to_string(), Value::Array(actions));
    }

    let payload = WebhookPayload {
        identity,
        action: primary.action.as_str(),
        details,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        bot_secret: secret,
    };

    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Sort a batch for flushing: descending priority, stable for equal priorities.
pub fn order_batch(batch: &mut [NotificationEvent]) {
    batch.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvb_core::NotificationAction;

    fn identity() -> BotIdentity {
        BotIdentity {
            bot_name: "billy".to_string(),
            display_name: "Bullish Billy".to_string(),
            avatar_url: Some("https://cdn/billy.png".to_string()),
            bio: None,
            wallet_address: Some("0xabc".to_string()),
        }
    }

    #[test]
    fn test_payload_fields() {
        let event = NotificationEvent::new(NotificationAction::Buy)
            .with_message("Buying PEPE")
            .with_detail("amountAvax", 0.25);
        let body = build_payload(&identity(), &event, &[], "s3cret", Utc::now());

        assert_eq!(body["botName"], "billy");
        assert_eq!(body["displayName"], "Bullish Billy");
        assert_eq!(body["avatarUrl"], "https://cdn/billy.png");
        assert_eq!(body["walletAddress"], "0xabc");
        assert_eq!(body["action"], "buy");
        assert_eq!(body["botSecret"], "s3cret");
        assert_eq!(body["details"]["message"], "Buying PEPE");
        assert_eq!(body["details"]["amountAvax"], 0.25);
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(body["details"].get("batchedUpdates").is_none());
    }

    #[test]
    fn test_default_message_filled_in() {
        let event = NotificationEvent::new(NotificationAction::Startup);
        let body = build_payload(&identity(), &event, &[], "s", Utc::now());
        assert_eq!(
            body["details"]["message"],
            "Bullish Billy is initializing trading systems"
        );
    }

    #[test]
    fn test_batch_summary_lists_at_most_three_actions() {
        let primary = NotificationEvent::new(NotificationAction::Sell);
        let batched: Vec<_> = [
            NotificationAction::Buy,
            NotificationAction::TokenRefresh,
            NotificationAction::Hold,
            NotificationAction::CycleComplete,
        ]
        .into_iter()
        .map(NotificationEvent::new)
        .collect();

        let body = build_payload(&identity(), &primary, &batched, "s", Utc::now());
        assert_eq!(body["details"]["batchedUpdates"], 4);
        assert_eq!(
            body["details"]["batchedActions"],
            serde_json::json!(["buy", "token_refresh", "hold"])
        );
    }

    #[test]
    fn test_order_batch_is_stable_by_priority() {
        let mut batch: Vec<_> = [
            NotificationAction::Hold,
            NotificationAction::Buy,
            NotificationAction::CycleStart,
            NotificationAction::Sell,
        ]
        .into_iter()
        .map(NotificationEvent::new)
        .collect();

        order_batch(&mut batch);
        let actions: Vec<_> = batch.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                NotificationAction::Buy,
                NotificationAction::Sell,
                NotificationAction::Hold,
                NotificationAction::CycleStart,
            ]
        );
    }
}
