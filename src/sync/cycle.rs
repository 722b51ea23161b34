//! One backup cycle: every configured push and pull, run concurrently.
//!
//! Failures are reported per job and left for the next cycle to retry;
//! they never stop the other jobs.

use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{Endpoint, Initiator};
use crate::config::NodeConfig;
use crate::error::{ConfigError, Error};
use crate::streaming::{Direction, SessionOutcome, TransferIntent};

/// One transfer of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub remote: Endpoint,
    pub intent: TransferIntent,
}

impl BackupJob {
    /// `host/subvolume` of the volume being transferred.
    pub fn volume_label(&self, local_node: &str) -> String {
        match &self.intent {
            TransferIntent::Pull { volume, .. } => volume.to_string(),
            other => format!("{}/{}", local_node, other.subvolume()),
        }
    }
}

/// Jobs for the configured remotes, optionally narrowed to `remotes` and
/// `subvolumes` (empty means all).
pub fn plan_jobs(
    config: &NodeConfig,
    remotes: &[String],
    subvolumes: &[String],
    force_full: bool,
) -> Result<Vec<BackupJob>, ConfigError> {
    for name in remotes {
        if config.remote(name).is_none() {
            return Err(ConfigError::Invalid(format!("unknown remote {}", name)));
        }
    }
    let wanted = |s: &str| subvolumes.is_empty() || subvolumes.iter().any(|w| w == s);

    let mut jobs = Vec::new();
    for remote in &config.remotes {
        if !remotes.is_empty() && !remotes.contains(&remote.name) {
            continue;
        }
        let Some(address) = &remote.address else {
            continue;
        };
        let endpoint = Endpoint::new(remote.name.clone(), address.clone());

        for subvolume in remote.push.iter().filter(|s| wanted(s)) {
            jobs.push(BackupJob {
                remote: endpoint.clone(),
                intent: TransferIntent::Push {
                    subvolume: subvolume.clone(),
                    force_full,
                },
            });
        }
        for volume in remote.pull_volumes()? {
            if wanted(&volume.subvolume) {
                jobs.push(BackupJob {
                    remote: endpoint.clone(),
                    intent: TransferIntent::Pull { volume, force_full },
                });
            }
        }
    }
    Ok(jobs)
}

#[derive(Debug)]
pub struct JobReport {
    pub job: BackupJob,
    pub result: Result<SessionOutcome, Error>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub jobs: Vec<JobReport>,
    /// Jobs whose task panicked.
    pub panicked: usize,
}

impl CycleReport {
    pub fn completed(&self) -> usize {
        self.count(|r| matches!(r, Ok(SessionOutcome::Completed { .. })))
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|r| matches!(r, Ok(SessionOutcome::UpToDate { .. })))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| r.is_err()) + self.panicked
    }

    pub fn bytes(&self) -> u64 {
        self.jobs
            .iter()
            .filter_map(|j| j.result.as_ref().ok())
            .map(SessionOutcome::bytes)
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, f: impl Fn(&Result<SessionOutcome, Error>) -> bool) -> usize {
        self.jobs.iter().filter(|j| f(&j.result)).count()
    }
}

/// Run all jobs concurrently. Jobs on the same lineage key are serialized
/// by the lineage tracker; everything else proceeds in parallel.
pub async fn run_cycle(initiator: &Initiator, jobs: Vec<BackupJob>) -> CycleReport {
    let mut set = JoinSet::new();
    for job in jobs {
        let initiator = initiator.clone();
        set.spawn(async move {
            let result = initiator.run(&job.remote, job.intent.clone()).await;
            JobReport { job, result }
        });
    }

    let mut report = CycleReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(job) => report.jobs.push(job),
            Err(e) => {
                warn!(error = %e, "backup job task failed");
                report.panicked += 1;
            }
        }
    }
    report.jobs.sort_by(|a, b| {
        (&a.job.remote.name, a.job.intent.subvolume(), direction_rank(&a.job.intent)).cmp(&(
            &b.job.remote.name,
            b.job.intent.subvolume(),
            direction_rank(&b.job.intent),
        ))
    });

    info!(
        completed = report.completed(),
        up_to_date = report.up_to_date(),
        failed = report.failed(),
        bytes = report.bytes(),
        "backup cycle finished"
    );
    report
}

fn direction_rank(intent: &TransferIntent) -> u8 {
    match intent.direction() {
        Direction::Push => 0,
        Direction::Pull => 1,
        Direction::Recover => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Volume;

    fn config() -> NodeConfig {
        toml::from_str(
            r#"
node_name = "alpha"
subvolumes = ["home", "root"]

[store]
kind = "dir"
snapshot_dir = "/srv/snapshots"
backup_dir = "/srv/backups"

[[remote]]
name = "backup01"
address = "backup01.example.net"
secret = { salt = "00", key = "0101010101010101010101010101010101010101010101010101010101010101" }
push = ["home", "root"]
pull = ["backup01/srv"]

[[remote]]
name = "inbound"
secret = { salt = "00", key = "0202020202020202020202020202020202020202020202020202020202020202" }
accept_push = ["home"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_plan_all_jobs() {
        let jobs = plan_jobs(&config(), &[], &[], false).unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.remote.name == "backup01"));
        assert!(jobs.iter().any(|j| j.intent
            == TransferIntent::Pull {
                volume: Volume::new("backup01", "srv"),
                force_full: false
            }));
        assert_eq!(jobs[2].volume_label("alpha"), "backup01/srv");
        assert_eq!(jobs[0].volume_label("alpha"), "alpha/home");
    }

    #[test]
    fn test_plan_filters() {
        let jobs = plan_jobs(&config(), &[], &["srv".into()], true).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].intent.direction(), Direction::Pull);

        assert!(plan_jobs(&config(), &["inbound".into()], &[], false)
            .unwrap()
            .is_empty());
        assert!(plan_jobs(&config(), &["nobody".into()], &[], false).is_err());
    }

    #[test]
    fn test_report_counts() {
        let job = plan_jobs(&config(), &[], &[], false).unwrap().remove(0);
        let report = CycleReport {
            jobs: vec![
                JobReport {
                    job: job.clone(),
                    result: Ok(SessionOutcome::UpToDate { snapshot: None }),
                },
                JobReport {
                    job,
                    result: Err(crate::error::TransferError::Timeout.into()),
                },
            ],
            panicked: 0,
        };
        assert_eq!(report.up_to_date(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.bytes(), 0);
        assert!(!report.is_success());
    }
}
