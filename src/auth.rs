use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_EMAIL_LEN;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password login. The user name is the caller's e-mail address,
/// which becomes their identity once the connection signs in.
#[derive(Debug)]
pub struct KairosAuthSource {
    password: String,
}

impl KairosAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

pub fn is_email_like(user: &str) -> bool {
    let Some((local, domain)) = user.split_once('@') else {
        return false;
    };
    !local.is_empty() && !domain.is_empty() && user.len() <= MAX_EMAIL_LEN && !user.contains(char::is_whitespace)
}

#[async_trait]
impl AuthSource for KairosAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !is_email_like(user) {
            metrics::counter!(AUTH_FAILURES_TOTAL, "reason" => "user").increment(1);
            tracing::warn!(user, "login rejected: user name is not an e-mail address");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "user name must be an e-mail address".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_like_users() {
        assert!(is_email_like("ada@example.com"));
        assert!(!is_email_like("kairos"));
        assert!(!is_email_like("@example.com"));
        assert!(!is_email_like("ada@"));
        assert!(!is_email_like("a da@example.com"));
    }

    #[tokio::test]
    async fn password_only_for_email_users() {
        let source = KairosAuthSource::new("kairos".into());

        let login = LoginInfo::new(Some("ada@example.com"), Some("kairos"), "127.0.0.1".into());
        assert!(source.get_password(&login).await.is_ok());

        let login = LoginInfo::new(Some("postgres"), Some("kairos"), "127.0.0.1".into());
        assert!(source.get_password(&login).await.is_err());

        let login = LoginInfo::new(None, None, "127.0.0.1".into());
        assert!(source.get_password(&login).await.is_err());
    }
}
