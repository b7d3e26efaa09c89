//! Admission correctness under contention: parallel fetchers over one WAL
//! database must never double-claim a job nor exceed a group's limit.

use dashmap::DashSet;
use rand::random;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use duron::database::models::JobDbModel;
use duron::database::repositories::{JobRepository, SqlxJobRepository};
use duron::database::{open_read_pool, open_write_pool, run_migrations};

const GROUPS: &[(&str, i64)] = &[("g1", 1), ("g2", 2), ("g3", 3), ("g4", 5)];
const JOBS_PER_GROUP: usize = 40;
const WORKERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn admission_stress_no_double_claims_no_limit_violations() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = open_read_pool(&db_url, 16).await.unwrap();
    run_migrations(&pool).await.unwrap();

    // Every worker process gets its own serialized write pool, as real
    // multi-process deployments do.
    let mut repos = Vec::new();
    for _ in 0..WORKERS {
        let write_pool = open_write_pool(&db_url).await.unwrap();
        repos.push(Arc::new(SqlxJobRepository::new(pool.clone(), write_pool)));
    }

    // Seed a backlog across groups with differing admission limits.
    let seed_repo = &repos[0];
    for (group, limit) in GROUPS {
        for _ in 0..JOBS_PER_GROUP {
            let job = JobDbModel::new("stress", *group, "{}", 600_000, "cksum", *limit);
            seed_repo.create_job(&job).await.unwrap();
        }
    }
    let total_jobs = GROUPS.len() * JOBS_PER_GROUP;

    let claimed_ids = Arc::new(DashSet::<String>::new());
    let limits: HashMap<String, i64> = GROUPS
        .iter()
        .map(|(g, l)| (g.to_string(), *l))
        .collect();

    // Sampler asserting the admission invariant for the whole run. One
    // grouped query is a consistent snapshot in SQLite.
    let monitor_pool = pool.clone();
    let monitor_limits = limits.clone();
    let monitor = tokio::spawn(async move {
        loop {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT group_key, COUNT(*) FROM jobs WHERE status = 'ACTIVE' GROUP BY group_key",
            )
            .fetch_all(&monitor_pool)
            .await
            .unwrap();

            for (group, active) in &rows {
                let limit = monitor_limits[group];
                assert!(
                    *active <= limit,
                    "group {group} has {active} active jobs over limit {limit}"
                );
            }

            let remaining: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status != 'COMPLETED'")
                    .fetch_one(&monitor_pool)
                    .await
                    .unwrap();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let mut workers = JoinSet::new();
    for (i, repo) in repos.into_iter().enumerate() {
        let claimed_ids = Arc::clone(&claimed_ids);
        let client_id = format!("worker-{i}");
        workers.spawn(async move {
            loop {
                let claimed = repo.fetch_and_admit(4, &client_id, None).await.unwrap();

                if claimed.is_empty() {
                    let remaining: i64 = {
                        let pending = repo
                            .get_jobs(
                                &duron::JobFilters::new().with_status(duron::JobStatus::Created),
                                &duron::Pagination::new(1, 0),
                                &duron::JobSort::default(),
                            )
                            .await
                            .unwrap();
                        pending.1 as i64
                    };
                    if remaining == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for job in claimed {
                    let inserted = claimed_ids.insert(job.id.clone());
                    assert!(inserted, "double-claimed job {}", job.id);

                    // Hold the admission slot briefly to force contention.
                    tokio::time::sleep(Duration::from_millis(random::<u64>() % 4)).await;

                    let completed = repo
                        .complete_job(&job.id, &client_id, "{}")
                        .await
                        .unwrap();
                    assert!(completed, "completion transition lost for {}", job.id);
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(120), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible livelock)");

    monitor.await.unwrap();

    assert_eq!(claimed_ids.len(), total_jobs, "not all jobs were claimed");

    let incomplete: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status != 'COMPLETED'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(incomplete, 0);

    let missing_times: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE started_at IS NULL OR finished_at IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(missing_times, 0, "some jobs missing lease timestamps");
}
