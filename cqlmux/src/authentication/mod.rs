//! SASL exchange run by a connection when the server answers STARTUP with
//! AUTHENTICATE.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange on one connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an AUTH_CHALLENGE. The token format depends on the server's
    /// authenticator and may be null.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called on AUTH_SUCCESS.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Creates an [`AuthenticatorSession`] for every connection that has to
/// authenticate.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial AUTH_RESPONSE token and the session that handles
    /// the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("SASL PLAIN does not expect a challenge".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// SASL PLAIN with a user name and a password, the scheme of
/// `PasswordAuthenticator`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }

    // `\0user\0password`, no authorization identity.
    fn initial_token(&self) -> Vec<u8> {
        let mut response =
            BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_token_layout() {
        let auth = PlainTextAuthenticator::new("cassandra".to_owned(), "s3cret".to_owned());
        let (token, mut session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(token.unwrap(), b"\0cassandra\0s3cret".to_vec());
        assert!(session.evaluate_challenge(None).await.is_err());
        assert!(session.success(None).await.is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let auth = PlainTextAuthenticator::new("u".to_owned(), "p4ss".to_owned());
        assert!(!format!("{:?}", auth).contains("p4ss"));
    }
}
