use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A class of mutually-exclusive analysis work. The host machine cannot
/// support two concurrent runs of the same analysis, so each category gets
/// its own exclusive gate; distinct categories may run in parallel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceCategory {
    ChartPattern,
    SimilarStock,
    LastCloseDownward,
    StockListingUpdate,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 4] = [
        ResourceCategory::ChartPattern,
        ResourceCategory::SimilarStock,
        ResourceCategory::LastCloseDownward,
        ResourceCategory::StockListingUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::ChartPattern => "chart-pattern",
            ResourceCategory::SimilarStock => "similar-stock",
            ResourceCategory::LastCloseDownward => "last-close-downward",
            ResourceCategory::StockListingUpdate => "stock-listing-update",
        }
    }
}

impl Display for ResourceCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
