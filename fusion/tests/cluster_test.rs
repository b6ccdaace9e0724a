// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Result;
use fusion::coder::Coder;
use fusion::{BackupNode, Cluster, Config, Error, PrimaryNode};
use fusion_transport::mock::{FakeBackup, FlakyBackup, FlakyPrimary};
use fusion_transport::{
    BackupService, ClusterInfo, Directory, Key, RecoveryData, StructureKind, Value,
};
use std::collections::{BTreeMap, BTreeSet};

const CLUSTER_ID: &str = "cluster";

type Backup = FlakyBackup<BackupNode>;

fn register_backups(directory: &Directory<Backup>, faults: usize) -> (Vec<Backup>, Vec<String>) {
    let mut backups = Vec::new();
    let mut endpoints = Vec::new();
    for i in 0..faults {
        let endpoint = format!("backup-{}", i);
        let backup = FlakyBackup::new(endpoint.clone(), BackupNode::new(endpoint.clone()));
        directory.register(endpoint.clone(), backup.clone());
        backups.push(backup);
        endpoints.push(endpoint);
    }
    (backups, endpoints)
}

struct Harness {
    cluster: Cluster<PrimaryNode<Backup>, Backup>,
    backups: Vec<Backup>,
}

impl Harness {
    async fn new(kind: StructureKind, primaries: usize, faults: usize) -> Result<Self> {
        Self::with_config(kind, primaries, faults, Config::default()).await
    }

    async fn with_config(
        kind: StructureKind,
        primaries: usize,
        faults: usize,
        config: Config,
    ) -> Result<Self> {
        let directory = Directory::new();
        let (backups, endpoints) = register_backups(&directory, faults);
        let nodes = (0..primaries)
            .map(|i| PrimaryNode::new(format!("primary-{}", i), directory.clone()))
            .collect();

        let info = ClusterInfo::new(CLUSTER_ID, primaries, faults)?;
        let cluster = Cluster::create(kind, info, config, nodes, endpoints, directory).await?;
        Ok(Self { cluster, backups })
    }

    fn backup_calls(&self) -> Vec<usize> {
        self.backups.iter().map(|b| b.calls()).collect()
    }

    async fn fused_data(&self, position: usize) -> Result<RecoveryData> {
        Ok(self.backups[position]
            .inner()
            .recovery_data(CLUSTER_ID)
            .await?)
    }

    async fn snapshot(&self) -> Result<Vec<BTreeMap<Key, Value>>> {
        let mut res = Vec::new();
        for ordinal in 0..self.cluster.info().primaries() {
            res.push(self.cluster.values(ordinal).await?);
        }
        Ok(res)
    }
}

// Scenario A: three primaries with three backups.
async fn scenario_a() -> Result<Harness> {
    let h = Harness::new(StructureKind::List, 3, 3).await?;
    h.cluster.insert(0, 0, 123).await?;
    h.cluster.insert(0, 1, 456).await?;
    h.cluster.insert(1, 0, 456).await?;
    h.cluster.insert(2, 0, 789).await?;
    h.cluster.insert(1, 0, 555).await?;
    h.cluster.insert(0, 2, 789).await?;
    Ok(h)
}

#[tokio::test]
async fn test_list_inserts_are_readable() -> Result<()> {
    let h = scenario_a().await?;

    assert_eq!(h.cluster.get(0, 0).await?, 123);
    assert_eq!(h.cluster.get(0, 1).await?, 456);
    assert_eq!(h.cluster.get(0, 2).await?, 789);
    assert_eq!(h.cluster.sequence(1).await?, vec![555, 456]);
    assert_eq!(h.cluster.sequence(2).await?, vec![789]);

    let fused = h.fused_data(0).await?;
    assert_eq!(fused.codewords.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_recover_all_primaries() -> Result<()> {
    let h = scenario_a().await?;

    let recovered = h.cluster.recover(&[0, 1, 2]).await?;
    assert_eq!(recovered.sequence(0), Some(vec![123, 456, 789]));
    assert_eq!(recovered.sequence(1), Some(vec![555, 456]));
    assert_eq!(recovered.sequence(2), Some(vec![789]));
    Ok(())
}

#[tokio::test]
async fn test_too_many_faults_contacts_no_backup() -> Result<()> {
    let h = scenario_a().await?;
    let calls = h.backup_calls();

    let result = h.cluster.recover(&[0, 1, 2, 3]).await;
    assert!(matches!(
        result,
        Err(Error::TooManyFaults {
            faults: 4,
            tolerated: 3
        })
    ));
    assert_eq!(h.backup_calls(), calls);
    Ok(())
}

#[tokio::test]
async fn test_remove_heals_stripe_with_tail() -> Result<()> {
    let h = Harness::new(StructureKind::List, 3, 3).await?;
    for value in [123, 456, 789] {
        h.cluster.append(0, value).await?;
    }
    h.cluster.append(1, 5).await?;

    h.cluster.remove(0, 0).await?;
    assert_eq!(h.cluster.sequence(0).await?, vec![456, 789]);

    let coder = Coder::new(3, 3)?;
    for position in 0..3 {
        let fused = h.fused_data(position).await?;
        assert_eq!(fused.codewords.len(), 2, "tail stripe must be freed");
        assert_eq!(fused.codewords[0], coder.encode(position, &[789, 5, 0]));
        assert_eq!(fused.codewords[1], coder.encode(position, &[456, 0, 0]));
        // stripe 0 now carries 789, the former tail. Its cross-reference is the position 789
        // holds after the removal shifted the list, which is 1, not the 0 that 123 vacated.
        assert_eq!(
            fused.index_data,
            vec![vec![Some(1), Some(0), None], vec![Some(0), None, None]]
        );

        let live: BTreeSet<Key> = fused.index_data.iter().filter_map(|row| row[0]).collect();
        assert_eq!(live, BTreeSet::from([0, 1]));
    }

    let recovered = h.cluster.recover(&[0]).await?;
    assert_eq!(recovered.sequence(0), Some(vec![456, 789]));
    Ok(())
}

#[tokio::test]
async fn test_recovery_scenarios() -> Result<()> {
    struct TestCase {
        name: &'static str,
        kind: StructureKind,
        primaries: usize,
        faults: usize,
        failed: Vec<usize>,
    }

    let test_cases = vec![
        TestCase {
            name: "list, single fault",
            kind: StructureKind::List,
            primaries: 4,
            faults: 2,
            failed: vec![2],
        },
        TestCase {
            name: "list, as many faults as backups",
            kind: StructureKind::List,
            primaries: 4,
            faults: 2,
            failed: vec![0, 3],
        },
        TestCase {
            name: "map, mixed history",
            kind: StructureKind::Map,
            primaries: 3,
            faults: 2,
            failed: vec![0, 2],
        },
        TestCase {
            name: "queue, mixed history",
            kind: StructureKind::Queue,
            primaries: 3,
            faults: 3,
            failed: vec![0, 1, 2],
        },
        TestCase {
            name: "single primary",
            kind: StructureKind::Queue,
            primaries: 1,
            faults: 1,
            failed: vec![0],
        },
    ];

    for case in test_cases {
        let h = Harness::new(case.kind, case.primaries, case.faults).await?;
        for ordinal in 0..case.primaries {
            run_history(&h.cluster, case.kind, ordinal).await?;
        }
        let expected = h.snapshot().await?;

        let recovered = h.cluster.recover(&case.failed).await?;
        assert_eq!(
            recovered.structures.keys().copied().collect::<Vec<_>>(),
            case.failed,
            "{}",
            case.name
        );
        for ordinal in &case.failed {
            assert_eq!(
                recovered.get(*ordinal),
                Some(&expected[*ordinal]),
                "{}: primary {}",
                case.name,
                ordinal
            );
        }
    }
    Ok(())
}

// Drives one primary through a history that mixes additions, updates and removals at every depth.
async fn run_history(
    cluster: &Cluster<PrimaryNode<Backup>, Backup>,
    kind: StructureKind,
    ordinal: usize,
) -> Result<()> {
    let base = 1000 * (ordinal as Value + 1);
    match kind {
        StructureKind::List => {
            for i in 0..6 {
                cluster.append(ordinal, base + i).await?;
            }
            cluster.insert(ordinal, 2, base + 10).await?;
            cluster.remove(ordinal, 0).await?;
            cluster.remove(ordinal, 4).await?;
            cluster.insert(ordinal, 0, base + 11).await?;
            cluster.remove(ordinal, 5).await?;
            if ordinal % 2 == 1 {
                cluster.remove(ordinal, 1).await?;
            }
        }
        StructureKind::Map => {
            for key in 0..5 {
                cluster.put(ordinal, key * 7, base + key as Value).await?;
            }
            cluster.put(ordinal, 14, base + 99).await?;
            cluster.remove(ordinal, 0).await?;
            cluster.put(ordinal, 100, base + 100).await?;
            cluster.remove(ordinal, 21).await?;
            cluster.put(ordinal, 7, base + 77).await?;
            if ordinal == 1 {
                cluster.remove(ordinal, 14).await?;
            }
        }
        StructureKind::Queue => {
            for i in 0..5 {
                cluster.enqueue(ordinal, base + i).await?;
            }
            assert_eq!(cluster.dequeue(ordinal).await?, base);
            assert_eq!(cluster.dequeue(ordinal).await?, base + 1);
            cluster.enqueue(ordinal, base + 5).await?;
            assert_eq!(cluster.peek(ordinal).await?, base + 2);
            for _ in 0..ordinal {
                cluster.dequeue(ordinal).await?;
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_fault_set() -> Result<()> {
    let h = scenario_a().await?;
    let calls = h.backup_calls();

    let recovered = h.cluster.recover(&[]).await?;
    assert!(recovered.structures.is_empty());
    assert_eq!(h.backup_calls(), calls);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backup_aborts_recovery() -> Result<()> {
    for config in [Config::new(true), Config::new(false)] {
        let h = Harness::with_config(StructureKind::List, 3, 2, config).await?;
        h.cluster.append(0, 1).await?;
        h.cluster.append(1, 2).await?;

        h.backups[1].fake_unreachable();
        let result = h.cluster.recover(&[0]).await;
        assert!(matches!(result, Err(Error::ConnectivityFailure(_))));

        h.backups[1].restore();
        let recovered = h.cluster.recover(&[0]).await?;
        assert_eq!(recovered.sequence(0), Some(vec![1]));
    }
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backup_fails_mutation() -> Result<()> {
    let h = Harness::new(StructureKind::Map, 2, 2).await?;
    h.backups[0].fake_unreachable();

    let result = h.cluster.put(0, 1, 1).await;
    assert!(matches!(result, Err(Error::ConnectivityFailure(_))));
    Ok(())
}

#[tokio::test]
async fn test_failed_replication_blocks_recovery() -> Result<()> {
    let h = Harness::new(StructureKind::Map, 2, 2).await?;
    h.cluster.put(0, 1, 10).await?;
    h.cluster.put(1, 1, 20).await?;

    h.backups[0].fake_unreachable();
    let result = h.cluster.put(1, 1, 99).await;
    assert!(matches!(result, Err(Error::ConnectivityFailure(_))));
    h.backups[0].restore();

    // primary 1 kept 99 while no backup saw it, so decoding primary 0 against it is refused
    assert_eq!(h.cluster.get(1, 1).await?, 99);
    let result = h.cluster.recover(&[0]).await;
    assert!(matches!(result, Err(Error::ProtocolInvariantViolation(_))));
    assert!(matches!(
        h.cluster.put(1, 2, 1).await,
        Err(Error::ProtocolInvariantViolation(_))
    ));
    assert!(matches!(
        h.cluster.values(1).await,
        Err(Error::ProtocolInvariantViolation(_))
    ));

    // the other primary is still in step with the backups
    h.cluster.put(0, 2, 30).await?;
    assert_eq!(h.cluster.values(0).await?, BTreeMap::from([(1, 10), (2, 30)]));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_survivor_aborts_recovery() -> Result<()> {
    let directory = Directory::new();
    let (backups, endpoints) = register_backups(&directory, 2);
    let primaries: Vec<_> = (0..3)
        .map(|i| {
            let name = format!("primary-{}", i);
            FlakyPrimary::new(name.clone(), PrimaryNode::new(name, directory.clone()))
        })
        .collect();
    let cluster = Cluster::create(
        StructureKind::List,
        ClusterInfo::new(CLUSTER_ID, 3, 2)?,
        Config::default(),
        primaries.clone(),
        endpoints,
        directory,
    )
    .await?;
    for ordinal in 0..3 {
        cluster.append(ordinal, 10 + ordinal as Value).await?;
    }

    primaries[2].fake_unreachable();
    let calls: Vec<usize> = backups.iter().map(|b| b.calls()).collect();
    let result = cluster.recover(&[0]).await;
    assert!(matches!(
        result,
        Err(Error::ConnectivityFailure(fusion_transport::Error::Unreachable(ref name)))
            if name == "primary-2"
    ));
    assert_eq!(backups.iter().map(|b| b.calls()).collect::<Vec<_>>(), calls);

    primaries[2].restore();
    let recovered = cluster.recover(&[0]).await?;
    assert_eq!(recovered.sequence(0), Some(vec![10]));
    assert!(primaries[0].calls() > 0);
    Ok(())
}

#[tokio::test]
async fn test_client_errors() -> Result<()> {
    let h = scenario_a().await?;

    assert!(matches!(h.cluster.get(0, 3).await, Err(Error::NotFound(_))));
    assert!(matches!(h.cluster.remove(2, 1).await, Err(Error::NotFound(_))));
    assert!(matches!(
        h.cluster.get(3, 0).await,
        Err(Error::ProtocolViolation(_))
    ));
    assert!(matches!(
        h.cluster.put(0, 1, 1).await,
        Err(Error::ProtocolViolation(_))
    ));
    assert!(matches!(
        h.cluster.recover(&[5]).await,
        Err(Error::ProtocolViolation(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_mutations_on_different_primaries() -> Result<()> {
    let h = Harness::new(StructureKind::List, 4, 2).await?;

    let writers = (0..4).map(|ordinal| {
        let cluster = &h.cluster;
        async move {
            for i in 0..20 {
                cluster.append(ordinal, (ordinal * 100 + i) as Value).await?;
                if i % 3 == 0 {
                    cluster.remove(ordinal, 0).await?;
                }
            }
            Ok::<_, Error>(())
        }
    });
    futures::future::try_join_all(writers).await?;

    let expected = h.snapshot().await?;
    let recovered = h.cluster.recover(&[1, 2]).await?;
    assert_eq!(recovered.get(1), Some(&expected[1]));
    assert_eq!(recovered.get(2), Some(&expected[2]));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_first_registrations_share_one_store() -> Result<()> {
    let backup = BackupNode::new("backup-0");
    let info = ClusterInfo::new(CLUSTER_ID, 8, 1)?;

    let registrations = (0..8).map(|i| {
        let backup = backup.clone();
        let info = info.clone();
        tokio::spawn(async move {
            backup
                .create_fused_structure(StructureKind::Map, &format!("p{}", i), info, 0)
                .await
        })
    });
    let mut ids = BTreeSet::new();
    for handle in futures::future::join_all(registrations).await {
        ids.insert(handle??);
    }
    assert_eq!(ids.len(), 1);

    let data = backup.recovery_data(CLUSTER_ID).await?;
    assert!(data.codewords.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_desynchronized_backups_are_rejected() -> Result<()> {
    let directory = Directory::new();
    let backups = vec![FakeBackup::new(), FakeBackup::new()];
    for (i, backup) in backups.iter().enumerate() {
        directory.register(format!("backup-{}", i), backup.clone());
    }
    let endpoints = vec!["backup-0".to_string(), "backup-1".to_string()];
    let nodes = (0..2)
        .map(|i| PrimaryNode::new(format!("primary-{}", i), directory.clone()))
        .collect();
    let cluster = Cluster::create(
        StructureKind::List,
        ClusterInfo::new(CLUSTER_ID, 2, 2)?,
        Config::default(),
        nodes,
        endpoints,
        directory,
    )
    .await?;
    cluster.append(0, 7).await?;
    cluster.append(1, 8).await?;
    assert_eq!(backups[0].received().len(), 2);

    let coder = Coder::new(2, 2)?;
    for (position, backup) in backups.iter().enumerate() {
        let row = if position == 0 {
            vec![Some(0), Some(0)]
        } else {
            vec![Some(0), None]
        };
        backup.set_recovery_data(
            CLUSTER_ID,
            RecoveryData {
                codewords: vec![coder.encode(position, &[7, 8])],
                index_data: vec![row],
            },
        );
    }

    let result = cluster.recover(&[0]).await;
    assert!(matches!(result, Err(Error::ProtocolInvariantViolation(_))));
    Ok(())
}
