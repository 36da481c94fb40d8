use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum Severity {
    Advisory,
    Warning,
    Critical,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Concern {
    pub id: String,
    pub category: Severity,
    pub label: String,
    pub assessment: String,
}

/// Migration concerns computed for one VM.
///
/// Kept apart from the VM record so that analysing a VM never bumps its
/// revision; `revision_analyzed` is the VM revision the concerns were
/// computed from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct VmAnalysis {
    pub id: String,
    #[serde(default)]
    pub revision: u64,
    pub revision_analyzed: u64,
    pub concerns: Vec<Concern>,
}

impl VmAnalysis {
    pub fn highest(&self) -> Option<Severity> {
        self.concerns.iter().map(|c| c.category).max()
    }
}

impl dal::DBTable for VmAnalysis {
    fn table_name() -> &'static str {
        "vm_analysis"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}
