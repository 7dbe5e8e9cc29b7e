//! Defect reporting: what the analyzer tells the analyst.

use crate::containers::unordered::UnorderedSet;
use crate::log::*;
use crate::storage::SrcLoc;

/// The kinds of findings attached to source locations
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum DefectKind {
    /// Dereference of a value provably equal to null
    NullDeref,
    /// Dereference of a value pointing into a destroyed object, or of a value
    /// that came out of a failed dereference
    InvalidDeref,
    /// `free()` of something that is not an untouched heap allocation
    DoubleFree,
    /// A heap object became unreachable while still allocated
    Leak,
    /// The abstract state became infeasible; the heap is dropped, the analyst
    /// is not bothered unless it happens at an entry
    Contradiction,
    /// A contract violation inside the engine itself
    Internal,
}

impl DefectKind {
    /// Whether the analyst should see this kind at all
    pub fn user_visible(self) -> bool {
        !matches!(self, DefectKind::Contradiction)
    }
}

/// One accepted finding
#[derive(Clone, Debug)]
pub struct Defect {
    pub kind: DefectKind,
    pub loc: SrcLoc,
    pub msg: String,
}

/// Collects findings, deduplicating user-visible kinds per source location.
///
/// The executing heap is retained after a report; analysis continues past
/// every user-visible defect. An `Internal` finding is different: it marks
/// the whole result unreliable and the current function's analysis stops.
#[derive(Default)]
pub struct Reporter {
    seen: UnorderedSet<(SrcLoc, DefectKind)>,
    defects: Vec<Defect>,
    unreliable: bool,
}

impl Reporter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Report a finding; returns whether it was accepted (not a duplicate)
    pub fn report(&mut self, kind: DefectKind, loc: SrcLoc, msg: impl Into<String>) -> bool {
        let msg = msg.into();
        if kind == DefectKind::Internal {
            self.unreliable = true;
        }
        if !kind.user_visible() {
            trace!("dropping an infeasible state"; "loc" => %loc, "msg" => &msg);
            return false;
        }
        if !self.seen.insert((loc, kind)) {
            return false;
        }
        match kind {
            DefectKind::Internal => {
                error!("internal analyzer defect"; "loc" => %loc, "msg" => &msg)
            }
            _ => warn!("defect"; "kind" => ?kind, "loc" => %loc, "msg" => &msg),
        }
        self.defects.push(Defect { kind, loc, msg });
        true
    }

    pub fn defects(&self) -> &[Defect] {
        &self.defects
    }

    /// Whether an `Internal` finding poisoned the result
    pub fn unreliable(&self) -> bool {
        self.unreliable
    }
}
