use crate::error::SyncError;
use shared::ParticipantId;

/// Who the local participant is for the lifetime of one play session.
///
/// The id is drawn once at construction and never changes; a new session
/// means a new identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    id: ParticipantId,
    display_name: String,
}

impl SessionIdentity {
    /// Fails with [`SyncError::EmptyDisplayName`] for blank names.
    pub fn new(display_name: &str) -> Result<Self, SyncError> {
        let display_name = validate_display_name(display_name)?;
        Ok(Self {
            id: ParticipantId::random(),
            display_name,
        })
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// True when `id` is this participant, i.e. a round-tripped echo.
    pub fn is_self(&self, id: &ParticipantId) -> bool {
        self.id == *id
    }
}

pub fn validate_display_name(name: &str) -> Result<String, SyncError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SyncError::EmptyDisplayName);
    }
    Ok(trimmed.to_string())
}
