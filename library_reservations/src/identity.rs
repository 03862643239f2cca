use crate::api::UserId;
use crate::error::ReservationError;

/// Who is calling, as vouched for by the identity provider. The core never
/// checks credentials itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    User(UserId),
}

impl Caller {
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Caller::User(user_id.into())
    }

    /// Blank ids count as anonymous
    pub fn from_identity(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(user_id) if !user_id.is_empty() => Caller::user(user_id),
            _ => Caller::Anonymous,
        }
    }

    pub fn user_id(&self) -> Result<&str, ReservationError> {
        match self {
            Caller::User(user_id) if !user_id.is_empty() => Ok(user_id),
            _ => Err(ReservationError::Unauthenticated),
        }
    }
}

#[cfg(test)]
mod identity_tests {
    use super::*;

    #[test]
    fn anonymous_and_blank_callers_are_unauthenticated() {
        assert!(matches!(
            Caller::Anonymous.user_id(),
            Err(ReservationError::Unauthenticated)
        ));
        assert_eq!(Caller::from_identity(Some("  ")), Caller::Anonymous);
        assert_eq!(Caller::from_identity(None), Caller::Anonymous);
        assert_eq!(Caller::from_identity(Some("u1")).user_id().unwrap(), "u1");
    }
}
