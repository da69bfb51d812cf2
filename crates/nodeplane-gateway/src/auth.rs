//! Connection authentication

use nodeplane_core::{AuthConfig, AuthMode, Error, Mode, Result};

/// Environment variable consulted when the config carries no token.
pub const TOKEN_ENV: &str = "NODEPLANE_TOKEN";

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[derive(Clone, Debug)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn from_config(config: &AuthConfig, env_token: Option<String>) -> Self {
        let token = config.token.clone().or(env_token);
        Self {
            mode: config.mode.clone(),
            token,
        }
    }

    pub fn verify_token(&self, provided: Option<&str>) -> Result<()> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::Token => {
                let expected = self
                    .token
                    .as_deref()
                    .ok_or_else(|| Error::auth_failed("no token configured"))?;
                let provided = provided.ok_or_else(|| Error::auth_failed("token required"))?;
                if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Err(Error::auth_failed("invalid token"));
                }
                Ok(())
            }
        }
    }

    /// Whether a fresh connection starts out authenticated.
    pub fn open(&self) -> bool {
        self.mode == AuthMode::None
    }

    /// Unauthenticated callers are served only by the maintenance service,
    /// and then only through the restricted read surface.
    pub fn anonymous_allowed(mode: Mode) -> bool {
        mode == Mode::Maintenance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_auth() {
        let auth = ResolvedAuth {
            mode: AuthMode::Token,
            token: Some("node-token-123".into()),
        };
        assert!(auth.verify_token(Some("node-token-123")).is_ok());
        assert!(auth.verify_token(Some("node-token-124")).is_err());
        assert!(auth.verify_token(Some("short")).is_err());
        assert!(auth.verify_token(None).is_err());
        assert!(!auth.open());
    }

    #[test]
    fn no_auth() {
        let auth = ResolvedAuth {
            mode: AuthMode::None,
            token: None,
        };
        assert!(auth.verify_token(None).is_ok());
        assert!(auth.verify_token(Some("anything")).is_ok());
        assert!(auth.open());
    }

    #[test]
    fn token_mode_without_token_rejects_everyone() {
        let auth = ResolvedAuth::from_config(&AuthConfig::default(), None);
        let err = auth.verify_token(Some("")).unwrap_err();
        assert!(err.to_string().contains("no token configured"));
    }

    #[test]
    fn config_token_wins_over_env() {
        let config = AuthConfig {
            mode: AuthMode::Token,
            token: Some("from-config".into()),
        };
        let auth = ResolvedAuth::from_config(&config, Some("from-env".into()));
        assert_eq!(auth.token.as_deref(), Some("from-config"));

        let auth = ResolvedAuth::from_config(&AuthConfig::default(), Some("from-env".into()));
        assert_eq!(auth.token.as_deref(), Some("from-env"));
    }

    #[test]
    fn only_maintenance_serves_anonymous_callers() {
        assert!(ResolvedAuth::anonymous_allowed(Mode::Maintenance));
        assert!(!ResolvedAuth::anonymous_allowed(Mode::Metal));
        assert!(!ResolvedAuth::anonymous_allowed(Mode::Container));
    }
}
