use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::Actor;

/// Shared-secret cleartext auth. The login name must carry the actor as
/// `<role>:<ulid>`; anything else fails the startup before the password check.
#[derive(Debug)]
pub struct ServiceSyncAuthSource {
    password: String,
}

impl ServiceSyncAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

pub(crate) fn invalid_login(message: String) -> PgWireError {
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        message,
    )))
}

#[async_trait]
impl AuthSource for ServiceSyncAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login
            .user()
            .ok_or_else(|| invalid_login("missing user name".into()))?;
        Actor::from_login(user).map_err(invalid_login)?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
