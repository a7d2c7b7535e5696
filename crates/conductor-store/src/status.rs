use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    ApprovalWaiting,
    InterventionWaiting,
    Paused,
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Expired,
    Aborted,
    Ignored,
}

const WAITING: &[Status] = &[
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
];

const FROM_PAUSED: &[Status] = &[Status::Paused];

const TO_RUNNING: &[Status] = &[
    Status::Queued,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
    Status::Paused,
];

const TO_WAITING: &[Status] = &[Status::Running];

const TO_INTERVENTION_WAITING: &[Status] = &[
    Status::Running,
    Status::Failed,
    Status::Errored,
    Status::Expired,
];

const TO_PAUSED: &[Status] = &[Status::Queued, Status::Running];

const TO_DISCONTINUING: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
    Status::Paused,
];

const TO_CONCLUDED: &[Status] = &[
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
    Status::Discontinuing,
];

const TO_FORCED_FINAL: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
    Status::Paused,
    Status::Discontinuing,
];

impl Status {
    pub const ALL: [Status; 14] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::ApprovalWaiting,
        Status::InterventionWaiting,
        Status::Paused,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Expired,
        Status::Aborted,
        Status::Ignored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ApprovalWaiting => "APPROVAL_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Ignored => "IGNORED",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Errored
                | Status::Expired
                | Status::Aborted
                | Status::Ignored
        )
    }

    /// Final statuses an adviser may turn into a retry or an intervention wait.
    pub fn is_broken(self) -> bool {
        matches!(self, Status::Failed | Status::Errored | Status::Expired)
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Ignored)
    }

    pub fn is_waiting(self) -> bool {
        WAITING.contains(&self)
    }

    /// Statuses a suspended node can be resumed from by a callback.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Running
                | Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::ApprovalWaiting
                | Status::Paused
        )
    }

    pub fn is_abortable(self) -> bool {
        !self.is_final()
    }

    /// Statuses that trigger the adviser chain once committed.
    pub fn triggers_advisers(self) -> bool {
        self.is_final() && self != Status::Aborted
    }

    /// Default expected-status set for a conditional update into `target`.
    pub fn allowed_start_set(target: Status) -> &'static [Status] {
        match target {
            Status::Queued => FROM_PAUSED,
            Status::Running => TO_RUNNING,
            Status::AsyncWaiting | Status::TaskWaiting | Status::ApprovalWaiting => TO_WAITING,
            Status::InterventionWaiting => TO_INTERVENTION_WAITING,
            Status::Paused => TO_PAUSED,
            Status::Discontinuing => TO_DISCONTINUING,
            Status::Succeeded | Status::Failed | Status::Errored | Status::Ignored => TO_CONCLUDED,
            Status::Aborted | Status::Expired => TO_FORCED_FINAL,
        }
    }

    pub fn non_final() -> Vec<Status> {
        Status::ALL
            .into_iter()
            .filter(|status| !status.is_final())
            .collect()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown status '{value}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_start_set_running_expected_waiting_and_queued_sources() {
        let set = Status::allowed_start_set(Status::Running);
        assert!(set.contains(&Status::Queued));
        assert!(set.contains(&Status::AsyncWaiting));
        assert!(set.contains(&Status::Paused));
        assert!(!set.contains(&Status::Succeeded));
    }

    #[test]
    fn allowed_start_set_aborted_expected_every_non_final_status() {
        let set = Status::allowed_start_set(Status::Aborted);
        for status in Status::ALL {
            assert_eq!(set.contains(&status), !status.is_final(), "{status}");
        }
    }

    #[test]
    fn allowed_start_set_final_target_expected_no_final_sources_except_intervention() {
        for target in [Status::Succeeded, Status::Failed, Status::Errored] {
            let set = Status::allowed_start_set(target);
            assert!(set.iter().all(|status| !status.is_final()));
        }
        let set = Status::allowed_start_set(Status::InterventionWaiting);
        assert!(set.contains(&Status::Failed));
    }

    #[test]
    fn triggers_advisers_aborted_expected_false() {
        assert!(!Status::Aborted.triggers_advisers());
        assert!(Status::Failed.triggers_advisers());
        assert!(Status::Succeeded.triggers_advisers());
        assert!(!Status::TaskWaiting.triggers_advisers());
    }

    #[test]
    fn from_str_kebab_case_expected_parsed() {
        assert_eq!(
            "async-waiting".parse::<Status>().expect("status should parse"),
            Status::AsyncWaiting
        );
        assert!("unknown".parse::<Status>().is_err());
    }

    #[test]
    fn serde_expected_screaming_snake_case() {
        let raw = serde_json::to_string(&Status::InterventionWaiting)
            .expect("status should serialize");
        assert_eq!(raw, "\"INTERVENTION_WAITING\"");
    }
}
