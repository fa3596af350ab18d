/// Local identity and message authorship resolution
///
/// The backend is inconsistent about field names: the same user id can
/// arrive as `userId`, `userID`, `authorId`, `senderId` or `idUser`
/// depending on which endpoint produced the record. Resolution happens
/// here, once, with fixed priority lists, so history and live paths
/// agree on who wrote what.
use serde_json::Value;

/// Probe order for the local user's id in the authenticated session object
pub const LOCAL_ID_FIELDS: &[&str] = &["id", "userId"];

/// Probe order for the local user's name in the authenticated session object
pub const LOCAL_NAME_FIELDS: &[&str] = &["username", "userName", "name"];

/// Probe order for the author id on an incoming message record
pub const SENDER_ID_FIELDS: &[&str] = &["userId", "userID", "authorId", "senderId", "idUser"];

/// Probe order for the author name on an incoming message record
pub const SENDER_NAME_FIELDS: &[&str] = &[
    "username",
    "userName",
    "name",
    "senderUsername",
    "authorUsername",
    "senderName",
];

/// Return the first non-empty trimmed value among `fields`
///
/// Numbers are accepted and stringified; numeric ids are common in
/// older history records.
pub fn probe_string(value: &Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        match value.get(field) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Who the local user is, as far as the chat core needs to know
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: Option<String>, username: Option<String>) -> Self {
        Self {
            user_id: normalize(user_id),
            username: normalize(username),
        }
    }

    /// Derive the identity from an authenticated session object.
    ///
    /// Accepts either the user object itself or an envelope with a
    /// nested `user` member (the `/api/auth/me` response shape).
    pub fn from_session_value(value: &Value) -> Self {
        let user = value.get("user").unwrap_or(value);
        let user_id = probe_string(user, LOCAL_ID_FIELDS).or_else(|| {
            // some session shapes keep the id beside the user object
            probe_string(value, &["userId"])
        });
        let username = probe_string(user, LOCAL_NAME_FIELDS)
            .or_else(|| probe_string(value, &["username"]));
        Self::new(user_id, username)
    }

    pub fn is_resolvable(&self) -> bool {
        self.user_id.is_some() || self.username.is_some()
    }

    /// Decide whether a message with the given author fields was written
    /// by the local user.
    ///
    /// Id equality is checked first and is decisive when both sides carry
    /// an id; the case-insensitive username comparison is only consulted
    /// when at least one id is missing. Unresolvable input yields `false`.
    pub fn is_mine(&self, sender_id: Option<&str>, sender_username: Option<&str>) -> bool {
        if let (Some(mine), Some(theirs)) = (self.user_id.as_deref(), sender_id) {
            if !mine.is_empty() && !theirs.trim().is_empty() {
                return mine == theirs.trim();
            }
        }
        if let (Some(mine), Some(theirs)) = (self.username.as_deref(), sender_username) {
            let theirs = theirs.trim();
            if !mine.is_empty() && !theirs.is_empty() {
                return mine.eq_ignore_ascii_case(theirs);
            }
        }
        false
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_probe_order_is_fixed() {
        let record = json!({ "senderId": "u9", "userId": "u1" });
        assert_eq!(
            probe_string(&record, SENDER_ID_FIELDS),
            Some("u1".to_string())
        );
    }

    #[test]
    fn test_probe_skips_empty_values() {
        let record = json!({ "username": "   ", "userName": "ana" });
        assert_eq!(
            probe_string(&record, SENDER_NAME_FIELDS),
            Some("ana".to_string())
        );
    }

    #[test]
    fn test_id_match_beats_username_mismatch() {
        let identity = LocalIdentity::new(Some("u1".into()), Some("ana".into()));
        assert!(identity.is_mine(Some("u1"), Some("somebody-else")));
        assert!(!identity.is_mine(Some("u2"), Some("ana")));
    }

    #[test]
    fn test_username_fallback_is_case_insensitive() {
        let identity = LocalIdentity::new(None, Some("Ana".into()));
        assert!(identity.is_mine(None, Some("  ana ")));
        assert!(!identity.is_mine(None, Some("bob")));
    }

    #[test]
    fn test_unresolvable_identity_is_never_mine() {
        let identity = LocalIdentity::default();
        assert!(!identity.is_mine(Some("u1"), Some("ana")));
    }

    #[test]
    fn test_from_session_value_nested_user() {
        let me = json!({ "user": { "userId": 42, "userName": "ana" }, "rooms": [] });
        let identity = LocalIdentity::from_session_value(&me);
        assert_eq!(identity.user_id.as_deref(), Some("42"));
        assert_eq!(identity.username.as_deref(), Some("ana"));
    }
}
