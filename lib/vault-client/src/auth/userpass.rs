use super::{AuthConfig, AuthMethod, read_secret_file};
use crate::VaultError;
use crate::models::{AuthRequest, Token};
use async_trait::async_trait;
use std::path::PathBuf;

const DEFAULT_MOUNT: &str = "userpass";

enum Password {
    Inline(Token),
    File(PathBuf),
}

/// Username/password authentication.
pub struct UserpassAuth {
    config: AuthConfig,
    mount: String,
    username: String,
    password: Password,
}

impl UserpassAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let username = config.required("username")?.to_string();
        if username.contains(['/', '?', '#', '%']) {
            return Err(VaultError::InvalidConfig(format!(
                "username '{}' may not contain '/', '?', '#' or '%'",
                username
            )));
        }
        let password = match (config.option("password"), config.option("password_file")) {
            (Some(p), None) => Password::Inline(Token::new(p)),
            (None, Some(path)) => Password::File(PathBuf::from(path)),
            (Some(_), Some(_)) => {
                return Err(VaultError::InvalidConfig(
                    "only one of 'password' and 'password_file' may be set".into(),
                ));
            }
            (None, None) => {
                return Err(VaultError::InvalidConfig(
                    "'password' or 'password_file' must be set".into(),
                ));
            }
        };

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            config,
            username,
            password,
        })
    }

    fn password(&self) -> Result<Token, VaultError> {
        match &self.password {
            Password::Inline(token) => Ok(token.clone()),
            Password::File(path) => read_secret_file(path).map(Token::new),
        }
    }
}

#[async_trait]
impl AuthMethod for UserpassAuth {
    fn name(&self) -> &'static str {
        "userpass"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let password = self.password()?;
        tracing::trace!(parent: &self.config.span, username = %self.username, "building userpass login");

        Ok(self
            .config
            .request(format!("auth/{}/login/{}", self.mount, self.username))
            .with_field("password", password.expose()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_userpass_request() {
        let auth = UserpassAuth::new(
            AuthConfig::default()
                .with_option("username", "alice")
                .with_option("password", "p@ss"),
        )
        .unwrap();

        let request = auth.authenticate().await.unwrap();
        assert_eq!(request.path, "auth/userpass/login/alice");
        assert_eq!(request.data["password"], "p@ss");
        assert!(auth.new_credential_notice().is_none());
    }

    #[tokio::test]
    async fn test_password_file_is_reread() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();

        let auth = UserpassAuth::new(
            AuthConfig::new("auth/corp-users")
                .with_option("username", "bob")
                .with_option("password_file", file.path().to_str().unwrap()),
        )
        .unwrap();

        let request = auth.authenticate().await.unwrap();
        assert_eq!(request.path, "auth/corp-users/login/bob");
        assert_eq!(request.data["password"], "first");

        std::fs::write(file.path(), "second").unwrap();
        let request = auth.authenticate().await.unwrap();
        assert_eq!(request.data["password"], "second");
    }

    #[test]
    fn test_missing_username() {
        let result = UserpassAuth::new(AuthConfig::default().with_option("password", "x"));
        assert!(matches!(result, Err(VaultError::InvalidConfig(_))));
    }

    #[test]
    fn test_username_cannot_change_login_path() {
        for username in ["alice/../admin", "alice?x=1", "alice#frag", "al%2Fice"] {
            let result = UserpassAuth::new(
                AuthConfig::default()
                    .with_option("username", username)
                    .with_option("password", "x"),
            );
            assert!(matches!(result, Err(VaultError::InvalidConfig(_))), "accepted {username}");
        }
    }

    #[test]
    fn test_missing_password() {
        let result = UserpassAuth::new(AuthConfig::default().with_option("username", "alice"));
        assert!(matches!(result, Err(VaultError::InvalidConfig(_))));
    }
}
