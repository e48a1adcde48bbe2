use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::config::Config;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Passwords accepted at startup. The public user books anonymously;
/// every other user name is a staff account and becomes the actor.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub staff_password: String,
    pub public_user: String,
    pub public_password: String,
}

impl Credentials {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            staff_password: cfg.password.clone(),
            public_user: cfg.public_user.clone(),
            public_password: cfg.public_password.clone(),
        }
    }

    pub fn is_public(&self, user: &str) -> bool {
        user == self.public_user
    }

    pub fn password_for(&self, user: &str) -> &str {
        if self.is_public(user) {
            &self.public_password
        } else {
            &self.staff_password
        }
    }
}

#[derive(Debug)]
pub struct VisitdAuthSource {
    credentials: Credentials,
}

impl VisitdAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for VisitdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(user) = login.user() else {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "no user name in startup message".into(),
            ))));
        };
        Ok(Password::new(None, self.credentials.password_for(user).as_bytes().to_vec()))
    }
}
