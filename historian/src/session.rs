use crate::error::{HistorianError, HistorianResult};

/// Caller identity attached to every orchestrated operation.
///
/// Identity management lives outside this crate; operations only check that
/// someone is present before touching upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    user_id: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            user_id: (!user_id.trim().is_empty()).then_some(user_id),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn require_user(&self) -> HistorianResult<&str> {
        self.user_id().ok_or(HistorianError::Unauthorized)
    }
}
