use std::collections::HashMap;

use async_trait::async_trait;

use crate::environment::Environment;
use crate::error::{AuthError, ConfigError};

use super::{AUTHORIZATION_HEADER, AuthProvider, authorization_header_value};

/// Static bearer token, either inline or dereferenced from an environment
/// variable at construction time.
pub struct BearerProvider {
    token: String,
}

impl BearerProvider {
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ConfigError::InvalidArgument("empty bearer token".into()));
        }
        Ok(Self { token })
    }

    pub fn from_config(
        token: Option<&str>,
        token_env: Option<&str>,
        env: &dyn Environment,
    ) -> Result<Self, ConfigError> {
        match (token, token_env) {
            (Some(token), _) => Self::new(token),
            (None, Some(var)) => {
                let value = env.var(var).ok_or_else(|| {
                    ConfigError::InvalidArgument(format!("bearer token variable {var} is not set"))
                })?;
                Self::new(value)
            }
            (None, None) => Err(ConfigError::InvalidArgument(
                "bearer auth requires token or token_env".into(),
            )),
        }
    }
}

#[async_trait]
impl AuthProvider for BearerProvider {
    async fn headers(&self) -> Result<HashMap<String, String>, AuthError> {
        Ok(HashMap::from([(
            AUTHORIZATION_HEADER.to_string(),
            authorization_header_value("Bearer", &self.token),
        )]))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        Ok(())
    }
}
