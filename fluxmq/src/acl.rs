//! Authentication and topic authorization hooks.
//!
//! The broker asks an [`Authentication`] on CONNECT and an [`Authorization`] on
//! every PUBLISH and every subscribed filter. [`StaticAuth`] implements both from
//! the `[auth]` configuration section: a user table plus ordered ACL rules where
//! the first matching rule decides and no match allows.

use fluxmq_conf::{AclAction, AclRule, Auth};

use crate::topic::Topic;
use crate::types::HashMap;

/// Placeholder variables for per-client topic rules
pub const PLACEHOLDER_USERNAME: &str = "${username}";
pub const PLACEHOLDER_CLIENTID: &str = "${clientid}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allow,
    BadUsernameOrPassword,
    NotAuthorized,
}

pub trait Authentication: Send + Sync {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> AuthResult;
}

pub trait Authorization: Send + Sync {
    /// `topic` is the topic name of a publish, or the requested filter of a subscription.
    fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        is_subscription: bool,
        payload: &[u8],
    ) -> bool;
}

#[derive(Debug, Clone)]
struct Rule {
    username: Option<String>,
    topic_filter: String,
    action: AclAction,
    allow: bool,
}

impl Rule {
    fn applies(&self, username: Option<&str>, is_subscription: bool) -> bool {
        let user_ok = match self.username.as_deref() {
            Some(u) => username == Some(u),
            None => true,
        };
        let action_ok = match self.action {
            AclAction::All => true,
            AclAction::Publish => !is_subscription,
            AclAction::Subscribe => is_subscription,
        };
        user_ok && action_ok
    }

    fn filter(&self, client_id: &str, username: Option<&str>) -> Option<Topic> {
        let filter = self
            .topic_filter
            .replace(PLACEHOLDER_CLIENTID, client_id)
            .replace(PLACEHOLDER_USERNAME, username.unwrap_or_default());
        match Topic::parse_filter(&filter) {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("invalid acl topic filter {:?}, {}", filter, e);
                None
            }
        }
    }
}

impl From<&AclRule> for Rule {
    fn from(r: &AclRule) -> Self {
        Self {
            username: r.username.clone(),
            topic_filter: r.topic_filter.clone(),
            action: r.action,
            allow: r.allow,
        }
    }
}

pub struct StaticAuth {
    allow_anonymous: bool,
    users: HashMap<String, String>,
    rules: Vec<Rule>,
}

impl StaticAuth {
    pub fn new(cfg: &Auth) -> Self {
        Self {
            allow_anonymous: cfg.allow_anonymous,
            users: cfg.users.iter().map(|(u, p)| (u.clone(), p.clone())).collect(),
            rules: cfg.acl.iter().map(Rule::from).collect(),
        }
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::new(&Auth::default())
    }
}

impl Authentication for StaticAuth {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> AuthResult {
        let Some(username) = username else {
            return if self.allow_anonymous { AuthResult::Allow } else { AuthResult::NotAuthorized };
        };
        match self.users.get(username) {
            Some(expected) if password == Some(expected.as_bytes()) => AuthResult::Allow,
            Some(_) => {
                log::info!("{} bad password for user {:?}", client_id, username);
                AuthResult::BadUsernameOrPassword
            }
            None if self.users.is_empty() && self.allow_anonymous => AuthResult::Allow,
            None => AuthResult::BadUsernameOrPassword,
        }
    }
}

impl Authorization for StaticAuth {
    fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        is_subscription: bool,
        _payload: &[u8],
    ) -> bool {
        let requested = if is_subscription {
            match Topic::parse_filter(topic) {
                Ok(t) => Some(t),
                Err(_) => return false,
            }
        } else {
            None
        };
        for rule in self.rules.iter().filter(|r| r.applies(username, is_subscription)) {
            let Some(filter) = rule.filter(client_id, username) else { continue };
            let matched = match requested.as_ref() {
                Some(req) => filter.matches(req),
                None => filter.matches_str(topic),
            };
            if matched {
                return rule.allow;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StaticAuth {
        let mut cfg = Auth { allow_anonymous: false, ..Default::default() };
        cfg.users.insert("alice".into(), "secret".into());
        cfg.acl.push(AclRule {
            username: None,
            topic_filter: "private/${clientid}/#".into(),
            action: AclAction::All,
            allow: true,
        });
        cfg.acl.push(AclRule {
            username: None,
            topic_filter: "private/#".into(),
            action: AclAction::All,
            allow: false,
        });
        cfg.acl.push(AclRule {
            username: Some("alice".into()),
            topic_filter: "admin/#".into(),
            action: AclAction::Publish,
            allow: true,
        });
        cfg.acl.push(AclRule {
            username: None,
            topic_filter: "admin/#".into(),
            action: AclAction::All,
            allow: false,
        });
        StaticAuth::new(&cfg)
    }

    #[test]
    fn authenticate() {
        let a = auth();
        assert_eq!(a.authenticate("c", None, None), AuthResult::NotAuthorized);
        assert_eq!(a.authenticate("c", Some("alice"), Some(b"secret")), AuthResult::Allow);
        assert_eq!(a.authenticate("c", Some("alice"), Some(b"nope")), AuthResult::BadUsernameOrPassword);
        assert_eq!(a.authenticate("c", Some("bob"), Some(b"x")), AuthResult::BadUsernameOrPassword);

        let open = StaticAuth::default();
        assert_eq!(open.authenticate("c", None, None), AuthResult::Allow);
        assert_eq!(open.authenticate("c", Some("anyone"), None), AuthResult::Allow);
    }

    #[test]
    fn authorize() {
        let a = auth();
        assert!(a.authorize("c1", None, "private/c1/inbox", false, b""));
        assert!(!a.authorize("c1", None, "private/c2/inbox", false, b""));
        assert!(a.authorize("c1", None, "private/c1/#", true, b""));
        assert!(!a.authorize("c1", None, "private/+/inbox", true, b""));
        assert!(a.authorize("c1", Some("alice"), "admin/reboot", false, b""));
        assert!(!a.authorize("c1", Some("alice"), "admin/#", true, b""));
        assert!(!a.authorize("c1", None, "admin/reboot", false, b""));
        assert!(a.authorize("c1", None, "public/news", false, b""));
        assert!(!a.authorize("c1", None, "bad/#/filter", true, b""));
    }
}
