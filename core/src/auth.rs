//! Credentials folded into the `Authorization` header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Credential attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Auth {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(token.into())
    }

    /// Value for the `Authorization` header.
    pub fn encode(&self) -> String {
        match self {
            Auth::Basic { user, password } => {
                format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
            }
            Auth::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Auth::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_encoding() {
        let auth = Auth::basic("test", "password");
        assert_eq!(auth.encode(), "Basic dGVzdDpwYXNzd29yZA==");
    }

    #[test]
    fn bearer_auth_encoding() {
        assert_eq!(Auth::bearer("abc.def").encode(), "Bearer abc.def");
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", Auth::basic("u", "hunter2"));
        assert!(!rendered.contains("hunter2"));
        let rendered = format!("{:?}", Auth::bearer("tok"));
        assert!(!rendered.contains("tok"));
    }
}
