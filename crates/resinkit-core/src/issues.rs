//! Issue-detection collaborator interface
//!
//! The detection algorithms themselves (islands, overhangs, resin traps)
//! live outside this engine. They consume a decoded raster plus its
//! bounding rectangle and hand back records through [`IssueSink`].

use serde::{Deserialize, Serialize};

use crate::layer::Rect;

/// Kind of printability issue a detector can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueKind {
    /// Lit pixels with no support from the previous layer.
    Island,
    /// Lit pixels overhanging the previous layer beyond tolerance.
    Overhang,
    /// An enclosed void that traps uncured resin.
    ResinTrap,
    /// A layer with no lit pixels at all.
    EmptyLayer,
}

/// One detected issue on one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// The layer the issue was found on.
    pub layer_index: u32,
    /// What kind of issue this is.
    pub kind: IssueKind,
    /// Bounding rectangle of the affected pixels, when applicable.
    pub bounds: Option<Rect>,
    /// Number of affected pixels.
    pub pixel_count: u64,
}

/// Consumer of detected issues, implemented by the caller.
pub trait IssueSink {
    /// Receive one detected issue.
    fn report(&mut self, issue: IssueRecord);
}

impl IssueSink for Vec<IssueRecord> {
    fn report(&mut self, issue: IssueRecord) {
        self.push(issue);
    }
}
