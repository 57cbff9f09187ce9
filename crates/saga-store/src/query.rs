use crate::{SagaRecord, SagaState};

/// Filter for listing saga records.
///
/// Results are ordered by creation time, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Filter by state.
    pub state: Option<SagaState>,

    /// Filter by reference ID.
    pub reference_id: Option<String>,

    /// Maximum number of records to return.
    pub limit: Option<usize>,

    /// Number of records to skip.
    pub offset: Option<usize>,
}

impl SagaQuery {
    /// Creates a query matching every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Filters by state.
    pub fn state(mut self, state: SagaState) -> Self {
        self.state = Some(state);
        self
    }

    /// Filters by reference ID.
    pub fn reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the record passes every filter.
    pub fn matches(&self, record: &SagaRecord) -> bool {
        if let Some(ref saga_type) = self.saga_type
            && &record.saga_type != saga_type
        {
            return false;
        }
        if let Some(state) = self.state
            && record.state != state
        {
            return false;
        }
        if let Some(ref reference_id) = self.reference_id
            && &record.reference_id != reference_id
        {
            return false;
        }
        true
    }
}
