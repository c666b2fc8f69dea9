use serde::{Deserialize, Serialize};
use tf_frame::IDate;
use tf_index::{Stamp, Window};

/// Read parameters for a single-version read. Also serves as the
/// evaluation context handed down the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Read the version visible at this insertion date; latest when `None`.
    pub revision_date: Option<IDate>,
    pub window: Window<Stamp>,
}

impl Query {
    #[must_use]
    pub fn latest() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn as_of(revision_date: IDate) -> Self {
        Self {
            revision_date: Some(revision_date),
            window: Window::unbounded(),
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Window<Stamp>) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_revision(mut self, revision_date: Option<IDate>) -> Self {
        self.revision_date = revision_date;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub idates: Window<IDate>,
    pub window: Window<Stamp>,
    /// Return each version as a delta against the previous one.
    pub diff: bool,
}

impl HistoryQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn between(from: Option<IDate>, to: Option<IDate>) -> Self {
        Self {
            idates: Window::new(from, to),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Window<Stamp>) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn diff(mut self) -> Self {
        self.diff = true;
        self
    }

    /// The single-version read matching this query at `idate`.
    #[must_use]
    pub fn at(&self, idate: IDate) -> Query {
        Query {
            revision_date: Some(idate),
            window: self.window,
        }
    }
}
