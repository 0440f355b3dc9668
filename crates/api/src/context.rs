use cineweave_auth::VerifiedIdentity;

/// Caller identity for a request, inserted by the auth middleware.
///
/// Present on every protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityContext {
    subject: String,
    email: Option<String>,
}

impl IdentityContext {
    pub fn new(subject: impl Into<String>, email: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            email,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

impl From<VerifiedIdentity> for IdentityContext {
    fn from(identity: VerifiedIdentity) -> Self {
        Self::new(identity.subject, identity.email)
    }
}
