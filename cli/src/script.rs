// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fusion::{BackupNode, Cluster, Config, PrimaryNode, RecoveredData};
use fusion_transport::{ClusterInfo, Directory, Key, StructureKind, Value};

/// A scenario replayed against an in-process cluster.
///
/// ```json
/// {
///   "kind": "list",
///   "steps": [
///     { "op": "insert", "primary": 0, "index": 0, "value": 123 },
///     { "op": "recover", "faults": [0] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub kind: StructureKind,
    #[serde(default)]
    pub cluster_id: Option<String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Insert {
        primary: usize,
        index: Key,
        value: Value,
    },
    Append {
        primary: usize,
        value: Value,
    },
    Put {
        primary: usize,
        key: Key,
        value: Value,
    },
    Enqueue {
        primary: usize,
        value: Value,
    },
    Dequeue {
        primary: usize,
    },
    Peek {
        primary: usize,
    },
    Remove {
        primary: usize,
        key: Key,
    },
    Get {
        primary: usize,
        key: Key,
    },
    Values {
        primary: usize,
    },
    Recover {
        faults: Vec<usize>,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Output {
    Value(Value),
    Values(BTreeMap<Key, Value>),
    Recovered(RecoveredData),
}

/// Result of one step. A failed step does not stop the replay.
#[derive(Debug, Serialize)]
pub struct Outcome {
    pub step: usize,
    #[serde(flatten)]
    pub op: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Script {
    /// A canned history for `kind` spread over `primaries` primaries, ending with the recovery
    /// of `fail`.
    pub fn demo(kind: StructureKind, primaries: usize, fail: Vec<usize>) -> Self {
        let mut steps = Vec::new();
        for primary in 0..primaries {
            let base = 100 * (primary as Value + 1);
            match kind {
                StructureKind::List => {
                    steps.push(Step::Append {
                        primary,
                        value: base + 23,
                    });
                    steps.push(Step::Append {
                        primary,
                        value: base + 56,
                    });
                    steps.push(Step::Insert {
                        primary,
                        index: 0,
                        value: base + 89,
                    });
                    if primary % 2 == 0 {
                        steps.push(Step::Remove { primary, key: 1 });
                    }
                }
                StructureKind::Map => {
                    for key in 0..3 {
                        steps.push(Step::Put {
                            primary,
                            key: key * 10,
                            value: base + key as Value,
                        });
                    }
                    steps.push(Step::Put {
                        primary,
                        key: 10,
                        value: base + 99,
                    });
                    steps.push(Step::Remove { primary, key: 0 });
                }
                StructureKind::Queue => {
                    for i in 0..3 {
                        steps.push(Step::Enqueue {
                            primary,
                            value: base + i,
                        });
                    }
                    steps.push(Step::Dequeue { primary });
                }
            }
        }
        for primary in 0..primaries {
            steps.push(Step::Values { primary });
        }
        steps.push(Step::Recover { faults: fail });

        Self {
            kind,
            cluster_id: None,
            steps,
        }
    }

    /// Builds an in-process cluster of `primaries` primaries and `faults` backups and runs every
    /// step against it.
    pub async fn replay(
        self,
        primaries: usize,
        faults: usize,
        config: Config,
    ) -> anyhow::Result<Vec<Outcome>> {
        let cluster_id = self.cluster_id.unwrap_or_else(|| "fusion".to_string());
        let info = ClusterInfo::new(cluster_id, primaries, faults)?;

        let directory = Directory::new();
        let endpoints: Vec<String> = (0..faults).map(|i| format!("backup-{}", i)).collect();
        for endpoint in &endpoints {
            directory.register(endpoint.clone(), BackupNode::new(endpoint.clone()));
        }
        let nodes = (0..primaries)
            .map(|i| PrimaryNode::new(format!("primary-{}", i), directory.clone()))
            .collect();
        let cluster =
            Cluster::create(self.kind, info, config, nodes, endpoints, directory).await?;

        let mut outcomes = Vec::with_capacity(self.steps.len());
        for (step, op) in self.steps.into_iter().enumerate() {
            let result = execute(&cluster, &op).await;
            debug!("step {} {:?}: {:?}", step, op, result);
            let (output, error) = match result {
                Ok(output) => (output, None),
                Err(e) => (None, Some(e.to_string())),
            };
            outcomes.push(Outcome {
                step,
                op,
                output,
                error,
            });
        }
        Ok(outcomes)
    }
}

async fn execute(
    cluster: &Cluster<PrimaryNode<BackupNode>, BackupNode>,
    step: &Step,
) -> Result<Option<Output>, fusion::Error> {
    let output = match *step {
        Step::Insert {
            primary,
            index,
            value,
        } => {
            cluster.insert(primary, index, value).await?;
            None
        }
        Step::Append { primary, value } => {
            cluster.append(primary, value).await?;
            None
        }
        Step::Put {
            primary,
            key,
            value,
        } => {
            cluster.put(primary, key, value).await?;
            None
        }
        Step::Enqueue { primary, value } => {
            cluster.enqueue(primary, value).await?;
            None
        }
        Step::Dequeue { primary } => Some(Output::Value(cluster.dequeue(primary).await?)),
        Step::Peek { primary } => Some(Output::Value(cluster.peek(primary).await?)),
        Step::Remove { primary, key } => {
            cluster.remove(primary, key).await?;
            None
        }
        Step::Get { primary, key } => Some(Output::Value(cluster.get(primary, key).await?)),
        Step::Values { primary } => Some(Output::Values(cluster.values(primary).await?)),
        Step::Recover { ref faults } => Some(Output::Recovered(cluster.recover(faults).await?)),
    };
    Ok(output)
}
