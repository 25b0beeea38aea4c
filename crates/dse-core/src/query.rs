//! Query lifecycle vocabulary shared by coordinator and workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operator placement strategy requested at submission.
///
/// `BottomUp` and `TopDown` are implemented by the placement phase; the
/// remaining strategies are accepted by validation and mapped onto those
/// two until their specialized solvers land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementStrategy {
    BottomUp,
    TopDown,
    #[serde(rename = "IFCOP")]
    Ifcop,
    ManualPlacement,
    #[serde(rename = "ILP")]
    Ilp,
    ElegantEnergy,
    ElegantPerformance,
    ElegantBalanced,
}

impl PlacementStrategy {
    pub const ALL: [PlacementStrategy; 8] = [
        PlacementStrategy::BottomUp,
        PlacementStrategy::TopDown,
        PlacementStrategy::Ifcop,
        PlacementStrategy::ManualPlacement,
        PlacementStrategy::Ilp,
        PlacementStrategy::ElegantEnergy,
        PlacementStrategy::ElegantPerformance,
        PlacementStrategy::ElegantBalanced,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlacementStrategy::BottomUp => "BottomUp",
            PlacementStrategy::TopDown => "TopDown",
            PlacementStrategy::Ifcop => "IFCOP",
            PlacementStrategy::ManualPlacement => "ManualPlacement",
            PlacementStrategy::Ilp => "ILP",
            PlacementStrategy::ElegantEnergy => "ElegantEnergy",
            PlacementStrategy::ElegantPerformance => "ElegantPerformance",
            PlacementStrategy::ElegantBalanced => "ElegantBalanced",
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlacementStrategy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or(())
    }
}

/// Delivery guarantee requested for a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultToleranceType {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "AT_MOST_ONCE")]
    AtMostOnce,
    #[serde(rename = "AT_LEAST_ONCE")]
    AtLeastOnce,
    #[serde(rename = "EXACTLY_ONCE")]
    ExactlyOnce,
}

/// Where lineage (buffer ancestry for replay trimming) is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineageType {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "IN_MEMORY")]
    InMemory,
    #[serde(rename = "PERSISTENT")]
    Persistent,
    #[serde(rename = "REMOTE")]
    Remote,
}

/// How a running query is being brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationType {
    /// Stop leaf sources only and let end-of-stream drain through.
    Graceful,
    /// Force-stop sources and pipelines in topological order.
    HardStop,
    /// Tear down after a runtime failure; no partial results are flushed.
    Failure,
}

/// Status of a user query in the coordinator's query catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Registered,
    Optimizing,
    Running,
    MarkedForSoftStop,
    MarkedForHardStop,
    Stopped,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Stopped | QueryStatus::Failed)
    }
}

/// Status of a merged shared plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedQueryStatus {
    Created,
    Deployed,
    Updated,
    Stopped,
    Failed,
}

/// Status of one deployed subplan on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Created,
    Running,
    Finished,
    Stopped,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Finished | ExecutionStatus::Stopped | ExecutionStatus::Failed
        )
    }

    /// Terminal status reached when a plan drains under `termination`.
    pub fn terminal_for(termination: TerminationType) -> ExecutionStatus {
        match termination {
            TerminationType::Graceful => ExecutionStatus::Finished,
            TerminationType::HardStop => ExecutionStatus::Stopped,
            TerminationType::Failure => ExecutionStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_parse_roundtrip() {
        for p in PlacementStrategy::ALL {
            assert_eq!(p.as_str().parse::<PlacementStrategy>().unwrap(), p);
        }
        assert!("SideWays".parse::<PlacementStrategy>().is_err());
    }

    #[test]
    fn fault_tolerance_wire_names() {
        let v: FaultToleranceType = serde_json::from_str("\"AT_LEAST_ONCE\"").unwrap();
        assert_eq!(v, FaultToleranceType::AtLeastOnce);
        assert_eq!(
            serde_json::to_string(&LineageType::InMemory).unwrap(),
            "\"IN_MEMORY\""
        );
    }

    #[test]
    fn terminal_status_mapping() {
        assert_eq!(
            ExecutionStatus::terminal_for(TerminationType::Graceful),
            ExecutionStatus::Finished
        );
        assert_eq!(
            ExecutionStatus::terminal_for(TerminationType::Failure),
            ExecutionStatus::Failed
        );
    }
}
