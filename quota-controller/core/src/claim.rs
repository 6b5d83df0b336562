/// A storage claim operation under admission review.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRequest {
    /// The storage class the claim is bound to. For updates, this is the
    /// class of the existing claim.
    pub storage_class: String,
    pub operation: ClaimOperation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClaimOperation {
    Create { bytes: i64 },
    Update { old_bytes: i64, new_bytes: i64 },
    Delete { bytes: i64 },
}

/// The verdict for a single admission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),

    /// The request is not something the quota policy has a view on.
    NoOpinion(String),
}

// === impl ClaimRequest ===

impl ClaimRequest {
    pub fn create(storage_class: impl Into<String>, bytes: i64) -> Self {
        Self {
            storage_class: storage_class.into(),
            operation: ClaimOperation::Create { bytes },
        }
    }

    pub fn update(storage_class: impl Into<String>, old_bytes: i64, new_bytes: i64) -> Self {
        Self {
            storage_class: storage_class.into(),
            operation: ClaimOperation::Update {
                old_bytes,
                new_bytes,
            },
        }
    }

    pub fn delete(storage_class: impl Into<String>, bytes: i64) -> Self {
        Self {
            storage_class: storage_class.into(),
            operation: ClaimOperation::Delete { bytes },
        }
    }
}

// === impl ClaimOperation ===

impl ClaimOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

// === impl Decision ===

impl Decision {
    /// `None` when the policy expresses no opinion.
    pub fn allowed(&self) -> Option<bool> {
        match self {
            Self::Allow => Some(true),
            Self::Deny(_) => Some(false),
            Self::NoOpinion(_) => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny(msg) | Self::NoOpinion(msg) => Some(msg),
        }
    }
}
