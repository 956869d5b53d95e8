//! Per-request identity and session data.
//!
//! A [`RequestContext`] is immutable once built. Handlers that need a
//! different context build a new one and attach it to the message they
//! produce; nothing in this crate hands out a mutable reference to an
//! existing context.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Identity and session data attached to a [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, Value>,
    created_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild a context with a known creation time, e.g. when a scheduler
    /// resumes work for a user it saw before.
    pub fn restored(
        user_id: impl Into<String>,
        session_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            attributes: BTreeMap::new(),
            created_at,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True when a non-blank `user_id` is present.
    pub fn has_identity(&self) -> bool {
        !self.user_id.trim().is_empty()
    }

    /// Minimal projection for high-frequency stream chunks.
    ///
    /// Keeps `user_id`, `session_id` and `created_at`; drops attributes.
    pub fn narrowed(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            attributes: BTreeMap::new(),
            created_at: self.created_at,
        }
    }

    /// Same acting principal and session.
    pub fn same_identity(&self, other: &RequestContext) -> bool {
        self.user_id == other.user_id && self.session_id == other.session_id
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let ctx = RequestContext::new("u-1")
            .with_session("s-1")
            .with_attribute("platform", "telegram");
        assert_eq!(ctx.user_id(), "u-1");
        assert_eq!(ctx.session_id(), Some("s-1"));
        assert_eq!(ctx.attribute("platform"), Some(&Value::from("telegram")));
        assert!(ctx.has_identity());
    }

    #[test]
    fn blank_user_has_no_identity() {
        assert!(!RequestContext::new("").has_identity());
        assert!(!RequestContext::new("   ").has_identity());
    }

    #[test]
    fn narrowed_keeps_identity_and_drops_attributes() {
        let ctx = RequestContext::new("u-1")
            .with_session("s-1")
            .with_attribute("chat_id", 42);
        let narrow = ctx.narrowed();
        assert!(narrow.same_identity(&ctx));
        assert_eq!(narrow.created_at(), ctx.created_at());
        assert!(narrow.attributes().is_empty());
        assert_ne!(narrow, ctx);
    }

    #[test]
    fn same_identity_compares_session() {
        let a = RequestContext::new("u-1").with_session("s-1");
        let b = RequestContext::new("u-1").with_session("s-2");
        let c = RequestContext::new("u-2").with_session("s-1");
        assert!(!a.same_identity(&b));
        assert!(!a.same_identity(&c));
        assert!(a.same_identity(&a.clone()));
    }

    #[test]
    fn restored_keeps_creation_time() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = RequestContext::restored("u-9", Some("s-9".into()), at);
        assert_eq!(ctx.created_at(), at);
        assert_eq!(ctx.session_id(), Some("s-9"));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let ctx = RequestContext::new("u-1");
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("session_id").is_none());
        assert!(json.get("attributes").is_none());
        let back: RequestContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }
}
