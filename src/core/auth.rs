use std::collections::HashSet;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::UserId;

/// What the web layer knows about the current request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session_user: Option<UserId>,
    pub remote_addr: Option<String>,
}

/// Authentication collaborator: resolves users and tells anonymous ones apart
pub trait Authenticator: Send + Sync {
    fn get_user_id(&self, ctx: &RequestContext) -> Result<UserId>;
    fn is_anonymous(&self, user_id: UserId) -> bool;
}

/// Fixed user table; requests without a session map to the anonymous user
pub struct StaticAuth {
    pub anonymous_user: UserId,
    pub known_users: HashSet<UserId>,
}

impl StaticAuth {
    pub fn new(anonymous_user: UserId) -> Self {
        StaticAuth {
            anonymous_user,
            known_users: HashSet::new(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.known_users.insert(user_id);
        self
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        StaticAuth::new(UserId(0))
    }
}

impl Authenticator for StaticAuth {
    fn get_user_id(&self, ctx: &RequestContext) -> Result<UserId> {
        match ctx.session_user {
            None => Ok(self.anonymous_user),
            Some(user) if user == self.anonymous_user => Ok(user),
            Some(user) if self.known_users.is_empty() || self.known_users.contains(&user) => Ok(user),
            Some(user) => Err(Error::new(
                ErrorKind::Forbidden,
                format!("unknown user {}", user),
            )),
        }
    }

    fn is_anonymous(&self, user_id: UserId) -> bool {
        user_id == self.anonymous_user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_is_anonymous() {
        let auth = StaticAuth::default();
        let user = auth.get_user_id(&RequestContext::default()).unwrap();
        assert!(auth.is_anonymous(user));
    }

    #[test]
    fn test_unknown_user_rejected_when_table_present() {
        let auth = StaticAuth::new(UserId(0)).with_user(UserId(1));
        let ctx = RequestContext { session_user: Some(UserId(2)), remote_addr: None };
        assert_eq!(auth.get_user_id(&ctx).unwrap_err().kind, ErrorKind::Forbidden);
    }
}
