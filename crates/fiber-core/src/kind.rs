//! Worker kinds.
//!
//! Every handler process runs one surrogate per kind. The wire name of a
//! kind is what clients put into `sessionType`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The kind of surrogate a request is executed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerKind {
    /// Non-interactive work; the default for requests without a session type.
    Core,
    /// Work that needs the GUI surrogate.
    Gui,
}

impl WorkerKind {
    /// Both kinds, in dispatch order.
    pub const ALL: [WorkerKind; 2] = [WorkerKind::Core, WorkerKind::Gui];

    /// Wire representation (`CORE` / `GUI`).
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Core => "CORE",
            WorkerKind::Gui => "GUI",
        }
    }

    /// Suffix appended to a handler name to form its surrogate endpoint name.
    pub fn surrogate_suffix(self) -> &'static str {
        match self {
            WorkerKind::Core => "CoreSurrogate",
            WorkerKind::Gui => "GuiSurrogate",
        }
    }
}

impl Default for WorkerKind {
    fn default() -> Self {
        WorkerKind::Core
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("CORE") {
            Ok(WorkerKind::Core)
        } else if s.eq_ignore_ascii_case("GUI") {
            Ok(WorkerKind::Gui)
        } else {
            Err(DomainError::InvalidWorkerKind {
                value: s.to_string(),
            })
        }
    }
}
