use granny_storage::OwnerId;

/// Authenticated user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: OwnerId,
}

impl Identity {
    pub fn new(user_id: impl Into<OwnerId>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}
