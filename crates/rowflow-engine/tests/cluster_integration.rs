//! Integration tests for split, clustered and remote execution.
//!
//! Clusters run inside the test process: slaves are in-process endpoints or
//! a JSON-lines server on a loopback listener, and cut hops move rows over
//! real loopback sockets. Each test owns a distinct transport port range.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rowflow_engine::remote::{
    serve, EndpointError, RunState, ServerCredentials, SlaveJob,
};
use rowflow_engine::{
    split_pipeline, Distribution, EndpointResolver, ExecutionStrategy, InProcessSlave,
    PipelineError, PipelineMeta, Placement, RunContext, SlaveEndpoint, Step, StepContext,
    StepError, StepMeta, StepRegistry,
};
use rowflow_types::{
    variables, ClusterSchema, ExecutionConfiguration, FailureKind, FieldMeta, PipelineResult, Row,
    SlaveServer, StepState, Value, ValueType,
};
use serde_json::json;

fn schema(base_port: u16, slaves: &[&str]) -> ClusterSchema {
    let mut servers = vec![SlaveServer::new("master", "127.0.0.1", 1).as_master()];
    servers.extend(
        slaves
            .iter()
            .map(|name| SlaveServer::new(*name, "127.0.0.1", 1)),
    );
    ClusterSchema::new("test", servers).with_base_port(base_port)
}

fn ids(result: &PipelineResult) -> Vec<i64> {
    result
        .result_rows
        .iter()
        .filter_map(|row| row.get(0).and_then(Value::as_integer))
        .collect()
}

fn one_slave_chain(end: i64, middle: &str) -> PipelineMeta {
    PipelineMeta::new("chain")
        .with_step(StepMeta::new("gen", "generator").with_settings(json!({ "end": end })))
        .with_step(StepMeta::new("mid", middle).with_placement(Placement::OneSlave("s1".into())))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "mid")
        .with_hop("mid", "out")
}

fn clustered_context(registry: &Arc<StepRegistry>, schema: &ClusterSchema) -> RunContext {
    RunContext::new(Arc::clone(registry))
        .with_resolver(EndpointResolver::in_process(registry, schema))
        .with_poll_interval(Duration::from_millis(20))
}

/// Fails the run once it has seen ten rows.
struct Explode;

impl Step for Explode {
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        let Some((meta, row)) = ctx.get_row()? else {
            return Ok(false);
        };
        if ctx.counters().lines_read >= 10 {
            return Err(StepError::fatal("disk full"));
        }
        Ok(ctx.put_row(meta, row))
    }
}

/// Appends the partition id this copy serves to every row.
struct TagPartition;

impl Step for TagPartition {
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        let Some((meta, row)) = ctx.get_row()? else {
            return Ok(false);
        };
        let partition = ctx
            .variable(variables::STEP_PARTITION_ID)
            .and_then(|id| id.parse::<i64>().ok())
            .ok_or_else(|| StepError::fatal("no partition id"))?;
        let tagged = Arc::new(meta.extended([FieldMeta::new("partition", ValueType::Integer)]));
        let mut values = row.into_values();
        values.push(Value::Integer(partition));
        Ok(ctx.put_row(tagged, Row::new(values)))
    }
}

/// Emits nothing and only ends when its node is stopped.
struct Idle;

impl Step for Idle {
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        if ctx.is_stopped() {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(10));
        Ok(true)
    }
}

fn failing_registry() -> Arc<StepRegistry> {
    let mut registry = StepRegistry::with_builtins();
    registry.register("explode", |_: &StepMeta| -> Box<dyn Step> { Box::new(Explode) });
    registry.register("idle", |_: &StepMeta| -> Box<dyn Step> { Box::new(Idle) });
    Arc::new(registry)
}

/// Resolver whose slaves count their cleanups.
fn recording_context(
    registry: &Arc<StepRegistry>,
    slaves: &[&str],
    refuse_prepare: Option<&str>,
) -> (RunContext, Vec<Arc<AtomicUsize>>) {
    let mut resolver = EndpointResolver::new().without_tcp_fallback();
    let mut counters = Vec::new();
    for name in slaves {
        let cleanups = Arc::new(AtomicUsize::new(0));
        resolver.register(
            *name,
            Arc::new(Recording {
                inner: InProcessSlave::new(*name, Arc::clone(registry)),
                refuse_prepare: refuse_prepare == Some(*name),
                cleanups: Arc::clone(&cleanups),
            }),
        );
        counters.push(cleanups);
    }
    let ctx = RunContext::new(Arc::clone(registry))
        .with_resolver(resolver)
        .with_poll_interval(Duration::from_millis(20));
    (ctx, counters)
}

/// Delegates to an in-process slave, counting cleanups and optionally
/// refusing to prepare.
struct Recording {
    inner: InProcessSlave,
    refuse_prepare: bool,
    cleanups: Arc<AtomicUsize>,
}

impl SlaveEndpoint for Recording {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn submit(&self, job: SlaveJob) -> Result<(), EndpointError> {
        self.inner.submit(job)
    }

    fn prepare(&self, run_id: &str) -> Result<(), EndpointError> {
        if self.refuse_prepare {
            return Err(EndpointError::Rejected("transport port already in use".into()));
        }
        self.inner.prepare(run_id)
    }

    fn start(&self, run_id: &str) -> Result<(), EndpointError> {
        self.inner.start(run_id)
    }

    fn status(&self, run_id: &str) -> Result<RunState, EndpointError> {
        self.inner.status(run_id)
    }

    fn fetch_result(&self, run_id: &str) -> Result<PipelineResult, EndpointError> {
        self.inner.fetch_result(run_id)
    }

    fn stop(&self, run_id: &str) -> Result<(), EndpointError> {
        self.inner.stop(run_id)
    }

    fn cleanup(&self, run_id: &str) -> Result<(), EndpointError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.inner.cleanup(run_id)
    }
}

#[test]
fn test_split_chain_has_one_cut_pair_per_crossing() {
    let schema = schema(47_000, &["s1", "s2"]);
    let meta = PipelineMeta::new("hops")
        .with_step(StepMeta::new("gen", "generator").with_settings(json!({ "end": 5 })))
        .with_step(StepMeta::new("a", "passthrough").with_placement(Placement::OneSlave("s1".into())))
        .with_step(StepMeta::new("b", "passthrough").with_placement(Placement::OneSlave("s2".into())))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "a")
        .with_hop("a", "b")
        .with_hop("b", "out");

    let split = split_pipeline(&meta, &schema).unwrap();
    assert_eq!(split.cuts.len(), 3);
    assert_eq!(split.nodes().count(), 3);

    let count = |step_type: &str| -> usize {
        split
            .nodes()
            .flat_map(|n| n.meta.steps.iter())
            .filter(|s| s.step_type == step_type)
            .count()
    };
    assert_eq!(count("transport_writer"), split.cuts.len());
    assert_eq!(count("transport_reader"), split.cuts.len());

    let registry = StepRegistry::with_builtins();
    for node in split.nodes() {
        assert!(
            rowflow_engine::config::validator::graph_errors(&node.meta, &registry).is_empty(),
            "{} is malformed",
            node.meta.name
        );
    }

    let ports: Vec<u16> = split.cuts.iter().map(|c| c.port).collect();
    assert_eq!(ports, vec![47_000, 47_100, 47_200]);

    assert_eq!(split, split_pipeline(&meta, &schema).unwrap());
}

#[test]
fn test_split_sets_node_identity() {
    let schema = schema(47_050, &["s1", "s2", "s3"]);
    let meta = PipelineMeta::new("ident")
        .with_step(StepMeta::new("gen", "generator").with_placement(Placement::EverySlave))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "out");
    let split = split_pipeline(&meta, &schema).unwrap();

    assert_eq!(
        split.master.meta.variables.get(variables::CLUSTER_MASTER),
        Some("Y")
    );
    assert_eq!(split.slaves.len(), 3);
    for (number, node) in split.slaves.iter().enumerate() {
        let vars = &node.meta.variables;
        assert_eq!(vars.get(variables::CLUSTER_MASTER), Some("N"));
        assert_eq!(vars.get(variables::CLUSTER_SIZE), Some("3"));
        assert_eq!(
            vars.get(variables::SLAVE_SERVER_NUMBER),
            Some(number.to_string().as_str())
        );
    }
    // One reader per slave on the master, feeding the collector.
    let readers = split
        .master
        .meta
        .steps
        .iter()
        .filter(|s| s.step_type == "transport_reader")
        .count();
    assert_eq!(readers, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_slave_cluster_matches_local_run() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let schema = schema(47_300, &["s1"]);
    let meta = one_slave_chain(100, "passthrough").with_cluster(schema.clone());

    let local_config = ExecutionConfiguration::local();
    let local = ExecutionStrategy::select(&meta, &local_config)
        .unwrap()
        .execute(&meta, &RunContext::new(Arc::clone(&registry)), &local_config)
        .await
        .unwrap();

    let config = ExecutionConfiguration::clustered();
    let strategy = ExecutionStrategy::select(&meta, &config).unwrap();
    assert_eq!(strategy.name(), "clustered");
    let clustered = strategy
        .execute(&meta, &clustered_context(&registry, &schema), &config)
        .await
        .unwrap();

    assert!(local.success);
    assert!(clustered.success, "clustered run failed: {:?}", clustered.failure);
    assert_eq!(ids(&clustered), ids(&local));
    assert_eq!(ids(&clustered), (1..=100).collect::<Vec<_>>());
    assert_eq!(clustered.nr_errors, 0);
    assert_eq!(clustered.lines_output, local.lines_output);
    assert_eq!(clustered.lines_read, local.lines_read);
    assert_eq!(clustered.lines_written, local.lines_written);
    assert!(clustered
        .steps
        .iter()
        .any(|s| s.node == "s1" && s.step == "mid" && s.state == StepState::Done));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partitioned_generator_covers_range_once() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let schema = schema(47_500, &["s1", "s2"]);
    let meta = PipelineMeta::new("partitioned")
        .with_cluster(schema.clone())
        .with_step(
            StepMeta::new("gen", "generator")
                .with_placement(Placement::EverySlave)
                .with_settings(json!({ "end": 100, "partition": true })),
        )
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "out");

    let config = ExecutionConfiguration::clustered();
    let result = ExecutionStrategy::select(&meta, &config)
        .unwrap()
        .execute(&meta, &clustered_context(&registry, &schema), &config)
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.failure);
    let mut got = ids(&result);
    got.sort_unstable();
    assert_eq!(got, (1..=100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partitioned_rows_reach_the_same_slave_per_key() {
    let mut registry = StepRegistry::with_builtins();
    registry.register("tag", |_: &StepMeta| -> Box<dyn Step> { Box::new(TagPartition) });
    let registry = Arc::new(registry);
    let schema = schema(49_800, &["s1", "s2", "s3"]);
    let by_id = Distribution::Partition { field: "id".into() };
    let meta = PipelineMeta::new("keyed")
        .with_cluster(schema.clone())
        .with_step(
            StepMeta::new("first", "generator")
                .with_settings(json!({ "end": 30 }))
                .with_distribution(by_id.clone()),
        )
        .with_step(
            StepMeta::new("again", "generator")
                .with_settings(json!({ "end": 30 }))
                .with_distribution(by_id),
        )
        .with_step(StepMeta::new("tag", "tag").with_placement(Placement::EverySlave))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("first", "tag")
        .with_hop("again", "tag")
        .with_hop("tag", "out");

    let config = ExecutionConfiguration::clustered();
    let result = ExecutionStrategy::select(&meta, &config)
        .unwrap()
        .execute(&meta, &clustered_context(&registry, &schema), &config)
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.failure);
    assert_eq!(result.result_rows.len(), 60);
    let mut seen = std::collections::BTreeMap::new();
    for row in &result.result_rows {
        let id = row.get(0).and_then(Value::as_integer).unwrap();
        let partition = row.get(1).and_then(Value::as_integer).unwrap();
        assert_eq!(partition, id % 3, "id {id}");
        assert_eq!(*seen.entry(id).or_insert(partition), partition, "id {id}");
    }
    assert_eq!(seen.len(), 30);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slave_failure_stops_cluster_and_names_root_cause() {
    let mut registry = StepRegistry::with_builtins();
    registry.register("explode", |_: &StepMeta| -> Box<dyn Step> { Box::new(Explode) });
    let registry = Arc::new(registry);
    let schema = schema(48_000, &["s1"]);
    let meta = one_slave_chain(50_000_000, "explode").with_cluster(schema.clone());

    let config = ExecutionConfiguration::clustered().with_queue_capacity(8);
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        ExecutionStrategy::select(&meta, &config)
            .unwrap()
            .execute(&meta, &clustered_context(&registry, &schema), &config),
    )
    .await
    .expect("clustered run did not stop")
    .unwrap();

    assert!(!result.success);
    let failure = result.failure.expect("failure report");
    assert_eq!(failure.kind, FailureKind::StepFatal);
    assert_eq!(failure.origin, "s1/mid.0");
    assert!(failure.message.contains("disk full"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prepare_failure_cleans_up_every_slave() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let schema = schema(48_300, &["s1", "s2"]);
    let meta = PipelineMeta::new("two_slaves")
        .with_cluster(schema.clone())
        .with_step(StepMeta::new("gen", "generator").with_settings(json!({ "end": 10 })))
        .with_step(StepMeta::new("a", "passthrough").with_placement(Placement::OneSlave("s1".into())))
        .with_step(StepMeta::new("b", "passthrough").with_placement(Placement::OneSlave("s2".into())))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "a")
        .with_hop("a", "b")
        .with_hop("b", "out");

    let (ctx, counters) = recording_context(&registry, &["s1", "s2"], Some("s2"));

    let config = ExecutionConfiguration::clustered();
    let err = ExecutionStrategy::select(&meta, &config)
        .unwrap()
        .execute(&meta, &ctx, &config)
        .await
        .unwrap_err();

    match &err {
        PipelineError::ClusterCoordination { slave, message } => {
            assert_eq!(slave, "s2");
            assert!(message.contains("port already in use"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slave_failure_while_running_cleans_up_every_slave() {
    let registry = failing_registry();
    let schema = schema(49_000, &["s1", "s2"]);
    let meta = PipelineMeta::new("every_slave_fails")
        .with_cluster(schema.clone())
        .with_step(StepMeta::new("gen", "generator").with_settings(json!({ "end": 50_000_000 })))
        .with_step(StepMeta::new("mid", "explode").with_placement(Placement::EverySlave))
        .with_step(StepMeta::new("out", "collector"))
        .with_hop("gen", "mid")
        .with_hop("mid", "out");
    let (ctx, counters) = recording_context(&registry, &["s1", "s2"], None);

    let config = ExecutionConfiguration::clustered().with_queue_capacity(8);
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        ExecutionStrategy::select(&meta, &config)
            .unwrap()
            .execute(&meta, &ctx, &config),
    )
    .await
    .expect("clustered run did not stop")
    .unwrap();

    assert!(!result.success);
    let failure = result.failure.expect("failure report");
    assert_eq!(failure.kind, FailureKind::StepFatal);
    assert!(failure.origin.ends_with("/mid.0"), "origin {}", failure.origin);
    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_master_failure_stops_every_slave() {
    let registry = failing_registry();
    let schema = schema(49_400, &["s1", "s2"]);
    let meta = PipelineMeta::new("master_fails")
        .with_cluster(schema.clone())
        .with_step(StepMeta::new("wait", "idle").with_placement(Placement::EverySlave))
        .with_step(StepMeta::new("out", "collector"))
        .with_step(StepMeta::new("gen", "generator").with_settings(json!({ "end": 1_000 })))
        .with_step(StepMeta::new("boom", "explode"))
        .with_hop("wait", "out")
        .with_hop("gen", "boom");
    let (ctx, counters) = recording_context(&registry, &["s1", "s2"], None);

    let config = ExecutionConfiguration::clustered();
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        ExecutionStrategy::select(&meta, &config)
            .unwrap()
            .execute(&meta, &ctx, &config),
    )
    .await
    .expect("master failure did not stop the cluster")
    .unwrap();

    assert!(!result.success);
    let failure = result.failure.expect("failure report");
    assert_eq!(failure.kind, FailureKind::StepFatal);
    assert_eq!(failure.origin, "master/boom.0");
    assert!(failure.message.contains("disk full"));
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_endpoint_is_a_coordination_error() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let schema = schema(48_700, &["s1"]);
    let meta = one_slave_chain(10, "passthrough").with_cluster(schema);
    let ctx = RunContext::new(Arc::clone(&registry))
        .with_resolver(EndpointResolver::new().without_tcp_fallback());

    let config = ExecutionConfiguration::clustered();
    let err = ExecutionStrategy::select(&meta, &config)
        .unwrap()
        .execute(&meta, &ctx, &config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::ClusterCoordination);
}

async fn spawn_server(
    registry: &Arc<StepRegistry>,
    credentials: ServerCredentials,
) -> (u16, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let endpoint: Arc<dyn SlaveEndpoint> =
        Arc::new(InProcessSlave::new("s1", Arc::clone(registry)));
    let server = tokio::spawn(serve(listener, endpoint, credentials));
    (port, server)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_run_over_tcp() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let credentials = ServerCredentials::new(Some("cluster".into()), Some("secret".into()));
    let (port, server) = spawn_server(&registry, credentials).await;

    let schema = ClusterSchema::new(
        "tcp",
        vec![
            SlaveServer::new("master", "127.0.0.1", 1).as_master(),
            SlaveServer::new("s1", "127.0.0.1", port).with_credentials("cluster", "secret"),
        ],
    );
    let meta = one_slave_chain(50, "passthrough").with_cluster(schema);

    let config = ExecutionConfiguration::remote("s1");
    let strategy = ExecutionStrategy::select(&meta, &config).unwrap();
    assert_eq!(strategy.name(), "remote");
    let ctx = RunContext::new(Arc::clone(&registry)).with_poll_interval(Duration::from_millis(20));
    let result = strategy.execute(&meta, &ctx, &config).await.unwrap();

    assert!(result.success, "remote run failed: {:?}", result.failure);
    assert_eq!(ids(&result), (1..=50).collect::<Vec<_>>());
    assert!(result.steps.iter().all(|s| s.node == "s1"));
    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_run_with_wrong_credentials_is_refused() {
    let registry = Arc::new(StepRegistry::with_builtins());
    let credentials = ServerCredentials::new(Some("cluster".into()), Some("secret".into()));
    let (port, server) = spawn_server(&registry, credentials).await;

    let schema = ClusterSchema::new(
        "tcp",
        vec![
            SlaveServer::new("master", "127.0.0.1", 1).as_master(),
            SlaveServer::new("s1", "127.0.0.1", port).with_credentials("cluster", "guess"),
        ],
    );
    let meta = one_slave_chain(5, "passthrough").with_cluster(schema);
    let config = ExecutionConfiguration::remote("s1");
    let err = ExecutionStrategy::select(&meta, &config)
        .unwrap()
        .execute(&meta, &RunContext::new(registry), &config)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ClusterCoordination);
    assert!(err.to_string().contains("invalid credentials"), "unexpected: {err}");
    server.abort();
}
