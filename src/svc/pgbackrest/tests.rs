//! Reconciliation passes run against the in-memory api

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::{CronJob, CronJobSpec, Job, JobCondition, JobStatus as BatchJobStatus},
    core::v1::{
        ConfigMap, ConfigMapProjection, Endpoints, Event, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        Pod, PodCondition, PodStatus, Secret, SecretProjection, VolumeProjection,
    },
};
use kube::api::ObjectMeta;

use crate::svc::{
    cfg,
    crd::{
        condition,
        postgres_cluster::{
            Backups, ClusterDataSource, DataSource, InstanceSet, ManualBackup, PgBackRest, PostgresCluster,
            Repo, RepoVolume, Restore, Schedules, Spec, Standby, S3,
        },
    },
    k8s::{
        api,
        fake::{FakeApi, FakeExec, FakePki},
        resource, Context,
    },
    pgbackrest::{
        naming::{self, BackupKind, ScheduleKind},
        reconcile, Error, Outcome, Pass, REQUEUE_AFTER,
    },
};

const NAMESPACE: &str = "default";
const NAME: &str = "hippo";
const INSTANCE: &str = "hippo-00-abcd";
const SOURCE: &str = "elephant";

// -----------------------------------------------------------------------------
// Fixtures

fn volume_repo(name: &str) -> Repo {
    Repo {
        name: name.into(),
        volume: Some(RepoVolume {
            volume_claim_spec: PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

fn cloud_repo(name: &str) -> Repo {
    Repo {
        name: name.into(),
        s3: Some(S3 {
            bucket: "backups".into(),
            endpoint: "s3.example.com".into(),
            region: "eu-west-1".into(),
        }),
        ..Default::default()
    }
}

fn cluster(repos: Vec<Repo>) -> PostgresCluster {
    let mut cluster = PostgresCluster::new(
        NAME,
        Spec {
            postgres_version: 15,
            instances: vec![InstanceSet {
                name: "00".into(),
                ..Default::default()
            }],
            backups: Some(Backups {
                pgbackrest: PgBackRest {
                    repos,
                    ..Default::default()
                },
            }),
            ..Default::default()
        },
    );

    cluster.metadata.namespace = Some(NAMESPACE.into());
    cluster
}

fn primary_pod() -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(naming::instance_pod(INSTANCE)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(BTreeMap::from([
                (naming::LABEL_CLUSTER.to_string(), NAME.to_string()),
                (naming::LABEL_INSTANCE_SET.to_string(), "00".to_string()),
                (naming::LABEL_INSTANCE.to_string(), INSTANCE.to_string()),
                (naming::LABEL_ROLE.to_string(), naming::ROLE_PRIMARY.to_string()),
            ])),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

struct Harness {
    api: FakeApi,
    exec: FakeExec,
    pki: FakePki,
    ctx: Context<FakeApi>,
}

impl Harness {
    fn new(cluster: &PostgresCluster) -> Self {
        let api = FakeApi::default();
        let exec = FakeExec::default();
        let pki = FakePki::default();

        api.insert(cluster);

        let ctx = Context {
            api: api.to_owned(),
            exec: Arc::new(exec.to_owned()),
            pki: Arc::new(pki.to_owned()),
            config: Arc::new(cfg::fixture()),
        };

        Self { api, exec, pki, ctx }
    }

    fn cluster(&self) -> PostgresCluster {
        self.api
            .object(NAMESPACE, NAME)
            .expect("cluster to be stored")
    }

    fn update(&self, f: impl FnOnce(&mut PostgresCluster)) {
        self.api.update(NAMESPACE, NAME, f);
    }

    async fn reconcile(&self) -> Result<Outcome, Error> {
        let cluster = self.cluster();
        reconcile(&self.ctx, &cluster).await
    }

    fn complete_job(&self, name: &str) {
        self.api.update::<Job>(NAMESPACE, name, |job| {
            job.status = Some(BatchJobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Complete".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                succeeded: Some(1),
                ..Default::default()
            });
        });
    }

    fn events(&self, reason: &str) -> usize {
        self.api
            .objects::<Event>()
            .iter()
            .filter(|event| event.reason.as_deref() == Some(reason))
            .count()
    }

    fn condition(&self, type_: &str) -> Option<(String, String, String)> {
        let status = self.cluster().status.unwrap_or_default();

        condition::find(&status.conditions, type_)
            .map(|c| (c.status.to_owned(), c.reason.to_owned(), c.message.to_owned()))
    }
}

/// returns an update requesting the manual backup with the identifier on
/// 'repo1'
fn request_backup(id: &'static str) -> impl FnOnce(&mut PostgresCluster) {
    move |cluster: &mut PostgresCluster| {
        cluster
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(naming::ANNOTATION_BACKUP.to_string(), id.to_string());

        if let Some(backups) = cluster.spec.backups.as_mut() {
            backups.pgbackrest.manual = Some(ManualBackup {
                repo_name: "repo1".into(),
                options: vec!["--type=full".into()],
            });
        }
    }
}

fn standby(cluster: &mut PostgresCluster) {
    cluster.spec.standby = Some(Standby {
        enabled: true,
        repo_name: Some("repo1".into()),
    });
}

/// returns the name of the replica creation job the first pass creates on a
/// cluster with a writable instance and the cloud repository 'repo1'
async fn bootstrap(harness: &Harness) -> String {
    harness.api.insert(&primary_pod());
    harness.reconcile().await.expect("bootstrap pass to succeed");

    let jobs = harness.api.objects::<Job>();
    assert_eq!(1, jobs.len());

    jobs[0].metadata.name.to_owned().unwrap_or_default()
}

// -----------------------------------------------------------------------------
// Repositories

#[tokio::test]
async fn volume_repos_get_a_claim_and_a_host() {
    let harness = Harness::new(&cluster(vec![volume_repo("repo1"), volume_repo("repo2")]));

    harness.reconcile().await.expect("pass to succeed");

    let mut claims: Vec<String> = harness
        .api
        .objects::<PersistentVolumeClaim>()
        .into_iter()
        .filter_map(|pvc| pvc.metadata.name)
        .collect();
    claims.sort();

    assert_eq!(
        vec![naming::repo_volume(NAME, "repo1"), naming::repo_volume(NAME, "repo2")],
        claims
    );
    assert!(harness
        .api
        .object::<StatefulSet>(NAMESPACE, &naming::repo_host(NAME))
        .is_some());
    assert_eq!(1, harness.events("RepoHostCreated"));
    assert_eq!(1, harness.pki.generated());

    let status = harness.cluster().status.unwrap_or_default();
    let repos = status.pgbackrest.unwrap_or_default().repos;
    assert_eq!(vec!["repo1", "repo2"], repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
}

#[tokio::test]
async fn second_pass_does_not_write() {
    let harness = Harness::new(&cluster(vec![volume_repo("repo1"), cloud_repo("repo2")]));

    harness.reconcile().await.expect("first pass to succeed");
    let writes = harness.api.writes();

    harness.reconcile().await.expect("second pass to succeed");

    assert_eq!(writes, harness.api.writes());
    assert_eq!(1, harness.pki.generated());
    assert_eq!(1, harness.events("RepoHostCreated"));
}

#[tokio::test]
async fn removed_repos_lose_their_storage() {
    let harness = Harness::new(&cluster(vec![volume_repo("repo1"), volume_repo("repo2")]));
    harness.reconcile().await.expect("first pass to succeed");

    harness.update(|cluster| {
        if let Some(backups) = cluster.spec.backups.as_mut() {
            backups.pgbackrest.repos = vec![volume_repo("repo1")];
        }
    });
    harness.reconcile().await.expect("second pass to succeed");

    assert_eq!(
        vec![naming::repo_volume(NAME, "repo2")],
        harness.api.deleted::<PersistentVolumeClaim>()
    );
    assert!(harness.api.deleted::<StatefulSet>().is_empty());

    harness.update(|cluster| {
        if let Some(backups) = cluster.spec.backups.as_mut() {
            backups.pgbackrest.repos = vec![cloud_repo("repo3")];
        }
    });
    harness.reconcile().await.expect("third pass to succeed");

    assert_eq!(vec![naming::repo_host(NAME)], harness.api.deleted::<StatefulSet>());
    assert!(harness.api.objects::<PersistentVolumeClaim>().is_empty());
    assert!(harness.api.object::<Secret>(NAMESPACE, &naming::ssh_secret(NAME)).is_none());

    let status = harness.cluster().status.unwrap_or_default().pgbackrest.unwrap_or_default();
    assert_eq!(vec!["repo3"], status.repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    assert!(status.repo_host.is_none());
    assert!(harness.condition(condition::REPO_HOST_READY).is_none());
}

#[tokio::test]
async fn backups_removal_waits_for_authorization() {
    let harness = Harness::new(&cluster(vec![volume_repo("repo1"), volume_repo("repo2")]));
    harness.reconcile().await.expect("first pass to succeed");

    harness.update(|cluster| cluster.spec.backups = None);
    harness.reconcile().await.expect("blocked pass to succeed");

    assert!(harness.api.deleted::<StatefulSet>().is_empty());
    assert_eq!(2, harness.api.objects::<PersistentVolumeClaim>().len());

    harness.update(|cluster| {
        cluster.metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_AUTHORIZE_REMOVAL.to_string(),
            "true".to_string(),
        )]));
    });
    harness.reconcile().await.expect("authorized pass to succeed");

    assert_eq!(vec![naming::repo_host(NAME)], harness.api.deleted::<StatefulSet>());
    assert!(harness.api.objects::<PersistentVolumeClaim>().is_empty());

    let status = harness.cluster().status.unwrap_or_default();
    assert!(status.pgbackrest.is_none());
    assert!(condition::find(&status.conditions, condition::REPO_HOST_READY).is_none());
}

// -----------------------------------------------------------------------------
// Bootstrap

#[tokio::test]
async fn failed_stanza_creation_creates_no_job() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    harness.api.insert(&primary_pod());
    harness.exec.fail_with("ERROR: [056]: unable to find primary cluster");

    let outcome = harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(REQUEUE_AFTER), outcome.requeue_after);
    assert!(harness.api.objects::<Job>().is_empty());
    assert_eq!(1, harness.events("UnableToCreateStanzas"));
    assert_eq!(
        vec![(NAMESPACE.to_string(), naming::instance_pod(INSTANCE), naming::CONTAINER_DATABASE.to_string())],
        harness.exec.calls()
    );

    harness.exec.succeed();
    harness.reconcile().await.expect("pass to succeed");

    let jobs = harness.api.objects::<Job>();
    assert_eq!(1, jobs.len());
    assert_eq!(
        Some(&BackupKind::ReplicaCreate.to_string()),
        jobs[0].metadata.labels.as_ref().and_then(|l| l.get(naming::LABEL_BACKUP))
    );
    assert_eq!(1, harness.events("StanzasCreated"));

    let status = harness.cluster().status.unwrap_or_default().pgbackrest.unwrap_or_default();
    assert!(status.repos.iter().all(|repo| repo.stanza_created));
    assert!(status.stanza_config_hash.is_some());
}

#[tokio::test]
async fn config_hash_mismatch_is_retried_silently() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    harness.api.insert(&primary_pod());
    harness.exec.fail_with("pgbackrest configuration hash mismatch");

    let outcome = harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(REQUEUE_AFTER), outcome.requeue_after);
    assert_eq!(0, harness.events("UnableToCreateStanzas"));
    assert!(harness.api.objects::<Job>().is_empty());
}

#[tokio::test]
async fn completed_replica_backup_marks_the_repo() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let job = bootstrap(&harness).await;

    assert_eq!(
        Some(condition::STATUS_FALSE.to_string()),
        harness.condition(condition::REPLICA_CREATE).map(|c| c.0)
    );

    harness.complete_job(&job);
    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(
        Some(condition::STATUS_TRUE.to_string()),
        harness.condition(condition::REPLICA_CREATE).map(|c| c.0)
    );
    assert_eq!(
        Some(condition::STATUS_TRUE.to_string()),
        harness.condition(condition::REPLICA_REPO_READY).map(|c| c.0)
    );
    assert_eq!(1, harness.api.objects::<Job>().len());
}

// -----------------------------------------------------------------------------
// Backups

#[tokio::test]
async fn manual_backup_is_replaced_by_a_new_request() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let replica = bootstrap(&harness).await;
    harness.complete_job(&replica);

    harness.update(request_backup("a"));
    harness.reconcile().await.expect("pass to succeed");

    let first = naming::backup_job(NAME, "repo1", BackupKind::Manual, "a");
    assert!(harness.api.object::<Job>(NAMESPACE, &first).is_some());

    harness.update(request_backup("b"));
    harness.reconcile().await.expect("pass to succeed");

    let second = naming::backup_job(NAME, "repo1", BackupKind::Manual, "b");
    assert_eq!(vec![first], harness.api.deleted::<Job>());
    assert!(harness.api.object::<Job>(NAMESPACE, &second).is_some());

    let status = harness.cluster().status.unwrap_or_default().pgbackrest.unwrap_or_default();
    assert_eq!(Some("b".to_string()), status.manual_backup.map(|s| s.id));
}

#[tokio::test]
async fn finished_manual_backup_is_not_run_again() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let replica = bootstrap(&harness).await;
    harness.complete_job(&replica);

    harness.update(request_backup("a"));
    harness.reconcile().await.expect("pass to succeed");

    let job = naming::backup_job(NAME, "repo1", BackupKind::Manual, "a");
    harness.complete_job(&job);
    harness.reconcile().await.expect("pass to succeed");
    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(vec![job.to_owned()], harness.api.deleted::<Job>());
    assert!(harness.api.object::<Job>(NAMESPACE, &job).is_none());
    assert_eq!(
        Some(condition::STATUS_TRUE.to_string()),
        harness.condition(condition::MANUAL_BACKUP_SUCCESSFUL).map(|c| c.0)
    );

    let status = harness.cluster().status.unwrap_or_default().pgbackrest.unwrap_or_default();
    let manual = status.manual_backup.unwrap_or_default();
    assert_eq!("a", manual.id);
    assert!(manual.finished);
}

#[tokio::test]
async fn standby_cluster_leaves_manual_backups_alone() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let replica = bootstrap(&harness).await;
    harness.complete_job(&replica);

    harness.update(request_backup("a"));
    harness.reconcile().await.expect("pass to succeed");

    harness.update(standby);
    harness.update(request_backup("b"));
    harness.reconcile().await.expect("pass to succeed");

    let first = naming::backup_job(NAME, "repo1", BackupKind::Manual, "a");
    let second = naming::backup_job(NAME, "repo1", BackupKind::Manual, "b");
    assert!(harness.api.deleted::<Job>().is_empty());
    assert!(harness.api.object::<Job>(NAMESPACE, &first).is_some());
    assert!(harness.api.object::<Job>(NAMESPACE, &second).is_none());
}

#[tokio::test]
async fn settled_cluster_with_backup_jobs_does_not_write() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let replica = bootstrap(&harness).await;
    harness.complete_job(&replica);

    harness.update(request_backup("a"));
    harness.reconcile().await.expect("pass to succeed");
    harness.reconcile().await.expect("pass to succeed");

    let writes = harness.api.writes();
    harness.reconcile().await.expect("pass to succeed");
    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(writes, harness.api.writes());
    assert_eq!(2, harness.api.objects::<Job>().len());
    assert_eq!(1, harness.exec.calls().len());
}

// -----------------------------------------------------------------------------
// Schedules

fn scheduled_cluster() -> PostgresCluster {
    cluster(vec![Repo {
        schedules: Some(Schedules {
            full: Some("0 1 * * 0".into()),
            ..Default::default()
        }),
        ..cloud_repo("repo1")
    }])
}

/// stores the cronjob of the full backups of 'repo1' and returns its name
fn insert_full_schedule(harness: &Harness, suspend: bool) -> String {
    let name = naming::cronjob(NAME, "repo1", ScheduleKind::Full);

    harness.api.insert(&CronJob {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.into()),
            labels: Some(naming::cronjob_labels(NAME, "repo1", ScheduleKind::Full)),
            owner_references: Some(vec![resource::owner_reference(&harness.cluster())]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: "0 1 * * 0".into(),
            suspend: Some(suspend),
            ..Default::default()
        }),
        ..Default::default()
    });

    name
}

fn suspended(harness: &Harness, name: &str) -> Option<bool> {
    harness
        .api
        .object::<CronJob>(NAMESPACE, name)
        .and_then(|cronjob| cronjob.spec)
        .and_then(|spec| spec.suspend)
}

#[tokio::test]
async fn existing_schedule_is_suspended_on_shutdown() {
    let mut spec = scheduled_cluster();
    spec.spec.shutdown = Some(true);

    let harness = Harness::new(&spec);
    let name = insert_full_schedule(&harness, false);

    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(true), suspended(&harness, &name));
    assert_eq!(1, harness.api.objects::<CronJob>().len());
}

#[tokio::test]
async fn existing_schedule_is_suspended_on_standby() {
    let mut spec = scheduled_cluster();
    standby(&mut spec);

    let harness = Harness::new(&spec);
    let name = insert_full_schedule(&harness, false);

    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(true), suspended(&harness, &name));
}

#[tokio::test]
async fn existing_schedule_is_resumed_on_a_running_cluster() {
    let harness = Harness::new(&scheduled_cluster());
    let name = insert_full_schedule(&harness, true);

    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(false), suspended(&harness, &name));
    assert_eq!(1, harness.api.objects::<CronJob>().len());
}

#[tokio::test]
async fn schedule_is_not_created_before_bootstrap() {
    let harness = Harness::new(&cluster(vec![Repo {
        schedules: Some(Schedules {
            incremental: Some("*/30 * * * *".into()),
            ..Default::default()
        }),
        ..cloud_repo("repo1")
    }]));

    harness.reconcile().await.expect("pass to succeed");

    assert!(harness.api.objects::<CronJob>().is_empty());
}

// -----------------------------------------------------------------------------
// Restore

#[tokio::test]
async fn in_place_restore_prepares_the_cluster_step_by_step() {
    let mut spec = cluster(vec![cloud_repo("repo1")]);
    if let Some(backups) = spec.spec.backups.as_mut() {
        backups.pgbackrest.restore = Some(Restore {
            enabled: true,
            source: ClusterDataSource {
                cluster_name: NAME.into(),
                repo_name: "repo1".into(),
                options: vec!["--type=time".into(), "--target=2023-01-01 00:00:00+00".into()],
                ..Default::default()
            },
        });
    }

    let harness = Harness::new(&spec);
    harness.reconcile().await.expect("pass to succeed");

    harness.update(|cluster| {
        cluster.metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_RESTORE.to_string(),
            "r1".to_string(),
        )]));
    });

    let owner = resource::owner_reference(&harness.cluster());
    harness.api.insert(&Job {
        metadata: ObjectMeta {
            name: Some(naming::restore_job(NAME)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(naming::restore_labels(NAME)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    });
    harness.api.insert(&Endpoints {
        metadata: ObjectMeta {
            name: Some(format!("{}-ha", NAME)),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        ..Default::default()
    });

    // the previous restore job goes first, the endpoints stay
    let outcome = harness.reconcile().await.expect("pass to succeed");

    assert_eq!(Some(REQUEUE_AFTER), outcome.requeue_after);
    assert_eq!(vec![naming::restore_job(NAME)], harness.api.deleted::<Job>());
    assert_eq!(
        Some("Background".to_string()),
        harness.api.propagation::<Job>(&naming::restore_job(NAME))
    );
    assert!(harness.api.deleted::<Endpoints>().is_empty());
    assert_eq!(
        Some((
            condition::STATUS_TRUE.to_string(),
            "RestoreInPlaceRequested".to_string(),
            "Preparing cluster to restore in-place: removing restore job".to_string()
        )),
        harness.condition(condition::RESTORE_PROGRESSING)
    );

    let status = harness.cluster().status.unwrap_or_default();
    assert_eq!(
        Some("r1".to_string()),
        status.pgbackrest.and_then(|s| s.restore).map(|r| r.id)
    );
    assert_eq!(Some(naming::default_instance(NAME, "00")), status.startup_instance);
    assert_eq!(Some("00".to_string()), status.startup_instance_set);

    // then the membership endpoints
    harness.reconcile().await.expect("pass to succeed");
    assert_eq!(vec![format!("{}-ha", NAME)], harness.api.deleted::<Endpoints>());

    // then the cluster is ready
    harness.reconcile().await.expect("pass to succeed");
    assert_eq!(
        Some("ReadyForRestore".to_string()),
        harness.condition(condition::RESTORE_PROGRESSING).map(|c| c.1)
    );
    assert!(harness.api.object::<Job>(NAMESPACE, &naming::restore_job(NAME)).is_none());

    // and the restore runs
    harness.reconcile().await.expect("pass to succeed");

    let job = harness
        .api
        .object::<Job>(NAMESPACE, &naming::restore_job(NAME))
        .expect("restore job to be created");
    let labels = job.metadata.labels.to_owned().unwrap_or_default();
    assert_eq!(
        Some(&naming::default_instance(NAME, "00")),
        labels.get(naming::LABEL_STARTUP_INSTANCE)
    );

    let command = job
        .spec
        .and_then(|spec| spec.template.spec)
        .map(|spec| spec.containers[0].command.to_owned().unwrap_or_default())
        .unwrap_or_default();
    let options = command.last().cloned().unwrap_or_default();
    assert!(options.contains("--repo=1"));
    assert!(options.contains("--delta"));
    assert!(options.contains("--target-action=promote"));

    assert!(harness
        .api
        .object::<PersistentVolumeClaim>(NAMESPACE, &naming::instance_data_volume(&naming::default_instance(NAME, "00")))
        .is_some());
}

/// stores the cluster 'elephant' with its pgbackrest configuration, the
/// source of the data source tests
fn source_cluster(harness: &Harness) {
    let mut source = cluster(vec![cloud_repo("repo1")]);
    source.metadata.name = Some(SOURCE.into());
    harness.api.insert(&source);

    harness.api.insert(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(naming::config(SOURCE)),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            naming::CONFIG_INSTANCE.to_string(),
            "[global]\nrepo1-type=s3\n".to_string(),
        )])),
        ..Default::default()
    });
}

#[tokio::test]
async fn in_place_restore_holds_backups_back() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let replica = bootstrap(&harness).await;
    harness.complete_job(&replica);
    harness.reconcile().await.expect("pass to succeed");

    let calls = harness.exec.calls().len();
    harness.update(request_backup("a"));
    harness.update(|cluster| {
        cluster
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(naming::ANNOTATION_RESTORE.to_string(), "r1".to_string());

        if let Some(backups) = cluster.spec.backups.as_mut() {
            backups.pgbackrest.restore = Some(Restore {
                enabled: true,
                source: ClusterDataSource {
                    cluster_name: NAME.into(),
                    repo_name: "repo1".into(),
                    ..Default::default()
                },
            });
        }
    });

    // the cluster is ready at once, then the restore runs
    let outcome = harness.reconcile().await.expect("pass to succeed");
    assert_eq!(Some(REQUEUE_AFTER), outcome.requeue_after);
    harness.reconcile().await.expect("pass to succeed");

    assert!(harness
        .api
        .object::<Job>(NAMESPACE, &naming::restore_job(NAME))
        .is_some());
    assert!(harness
        .api
        .object::<Job>(NAMESPACE, &naming::backup_job(NAME, "repo1", BackupKind::Manual, "a"))
        .is_none());
    assert_eq!(calls, harness.exec.calls().len());

    let status = harness.cluster().status.unwrap_or_default();
    assert_eq!(Some(INSTANCE.to_string()), status.startup_instance);
    assert!(status
        .pgbackrest
        .unwrap_or_default()
        .repos
        .iter()
        .all(|repo| !repo.stanza_created));
}

#[tokio::test]
async fn restore_completion_initializes_data() {
    let mut spec = cluster(vec![cloud_repo("repo1")]);
    spec.spec.data_source = Some(DataSource {
        postgres_cluster: Some(ClusterDataSource {
            cluster_name: SOURCE.into(),
            repo_name: "repo1".into(),
            ..Default::default()
        }),
        pgbackrest: None,
    });

    let harness = Harness::new(&spec);
    source_cluster(&harness);

    // nothing to remove, the first pass gets the cluster ready
    harness.reconcile().await.expect("pass to succeed");
    harness.reconcile().await.expect("pass to succeed");
    harness.complete_job(&naming::restore_job(NAME));
    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(
        Some((
            condition::STATUS_TRUE.to_string(),
            "PGBackRestRestoreComplete".to_string(),
            "pgBackRest restore completed successfully".to_string()
        )),
        harness.condition(condition::POSTGRES_DATA_INITIALIZED)
    );
    assert!(harness.condition(condition::RESTORE_PROGRESSING).is_none());
    assert_eq!(
        vec![naming::restore_config(NAME)],
        harness.api.deleted::<ConfigMap>()
    );

    let status = harness.cluster().status.unwrap_or_default();
    let restore = status.pgbackrest.and_then(|s| s.restore).unwrap_or_default();
    assert_eq!(format!("~bootstrap-{}", NAME), restore.id);
    assert!(restore.finished);
    assert_eq!(1, restore.succeeded);
}

#[tokio::test]
async fn missing_source_cluster_is_reported() {
    let mut spec = cluster(vec![cloud_repo("repo1")]);
    spec.spec.data_source = Some(DataSource {
        postgres_cluster: Some(ClusterDataSource {
            cluster_name: "elephant".into(),
            repo_name: "repo1".into(),
            ..Default::default()
        }),
        pgbackrest: None,
    });

    let harness = Harness::new(&spec);
    harness.reconcile().await.expect("pass to succeed");
    harness.reconcile().await.expect("pass to succeed");

    assert_eq!(1, harness.events("InvalidDataSource"));
    assert!(harness.api.objects::<Job>().is_empty());
}

#[tokio::test]
async fn configuration_copy_skips_optional_items_only() {
    let harness = Harness::new(&cluster(vec![cloud_repo("repo1")]));
    let target = harness.cluster();
    let pass = Pass::new(&harness.ctx, &target);

    let mut source = cluster(vec![cloud_repo("repo1")]);
    source.metadata.name = Some("elephant".into());
    if let Some(backups) = source.spec.backups.as_mut() {
        backups.pgbackrest.configuration = vec![VolumeProjection {
            secret: Some(SecretProjection {
                name: Some("s3-credentials".into()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }];
    }

    let projections = pass
        .copy_configuration(&source)
        .await
        .expect("absent optional secret to be skipped");
    assert!(projections.is_empty());

    harness.api.insert(&Secret {
        metadata: ObjectMeta {
            name: Some("s3-credentials".into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        ..Default::default()
    });

    let projections = pass
        .copy_configuration(&source)
        .await
        .expect("present secret to be copied");
    let copy = naming::restore_copy("elephant", 0);
    assert_eq!(
        Some(copy.to_owned()),
        projections[0].secret.as_ref().and_then(|s| s.name.to_owned())
    );
    assert!(harness.api.object::<Secret>(NAMESPACE, &copy).is_some());

    if let Some(backups) = source.spec.backups.as_mut() {
        backups.pgbackrest.configuration = vec![VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: Some("gcs-settings".into()),
                ..Default::default()
            }),
            ..Default::default()
        }];
    }

    let result = pass.copy_configuration(&source).await;
    assert!(matches!(result, Err(Error::Api(api::Error::NotFound(_, _, _)))));
}
