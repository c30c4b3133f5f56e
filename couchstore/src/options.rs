/// Options controlling how [`crate::db::Db::open`] treats a missing file.
#[derive(Debug, Clone, Copy, Default)]
pub struct DBOpenOptions {
    pub create: bool,
    pub read_only: bool,
}

impl DBOpenOptions {
    pub fn create() -> Self {
        Self {
            create: true,
            read_only: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            create: false,
            read_only: true,
        }
    }
}

/// Which documents `changes_since` hands to the caller's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocInfosOptions {
    #[default]
    AllDocs,
    NoDeletes,
    DeletesOnly,
}

/// Return value of the per-document callback passed to `changes_since`;
/// `Cancel` aborts the remainder of the scan (used by warmup to stop once
/// it has transitioned out of the warming-up state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesAction {
    Continue,
    Cancel,
}
