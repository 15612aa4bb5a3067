//! End-to-end scans against the emulated device.
//!
//! Every test builds its own `HostDevice` so faults and memory accounting
//! never leak between tests. Results on the device are always compared
//! against the same scan evaluated on the host.

use std::sync::Arc;
use std::time::Duration;

use datafusion::arrow::array::{Array, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema};
use datafusion::arrow::record_batch::RecordBatch;

use gpuscan::chunk::arrow::RecordBatchChunkStore;
use gpuscan::gpu::device::DeviceRuntime;
use gpuscan::gpu::host_device::{Fault, HostDevice, HostDeviceConfig};
use gpuscan::transpiler::{ArithOp, CompareOp, ScalarFunc};
use gpuscan::{
    ChunkFormat, CudaTranspiler, DataType, Datum, DeviceContext, Expr, Field, GpuScan, MemoryChunkStore, Phase,
    Row, ScanConfig, ScanError, ScanPlan, Schema, SchemaRef,
};

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn people_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64),
        Field::new("name", DataType::Text),
        Field::new("doc", DataType::Json),
    ]))
}

fn people(n: i64) -> Vec<Row> {
    (0..n)
        .map(|i| {
            let doc = if i % 3 == 0 { Datum::Null } else { Datum::Json(format!("{{\"k\":{i}}}")) };
            vec![Datum::Int64(i), Datum::Text(format!("person-{i}")), doc]
        })
        .collect()
}

fn id() -> Expr {
    Expr::col(0, DataType::Int64)
}

fn name() -> Expr {
    Expr::col(1, DataType::Text)
}

fn int(v: i64) -> Expr {
    Expr::lit(Datum::Int64(v))
}

fn device(config: HostDeviceConfig) -> (HostDevice, Arc<DeviceContext>) {
    let dev = HostDevice::new(config);
    let ctx = Arc::new(DeviceContext::new(Arc::new(dev.clone())));
    (dev, ctx)
}

fn start(
    rows: Vec<Row>,
    quals: Vec<Expr>,
    targets: Option<Vec<Expr>>,
    config: ScanConfig,
    ctx: Option<Arc<DeviceContext>>,
) -> GpuScan {
    let plan = ScanPlan::new(people_schema(), quals, targets, &CudaTranspiler).expect("plan");
    GpuScan::with_context(Box::new(MemoryChunkStore::new(people_schema(), rows)), plan, vec![], config, ctx)
        .expect("scan starts")
}

fn run(
    rows: Vec<Row>,
    quals: Vec<Expr>,
    targets: Option<Vec<Expr>>,
    config: ScanConfig,
    ctx: Option<Arc<DeviceContext>>,
) -> Vec<Row> {
    start(rows, quals, targets, config, ctx).collect_rows().expect("scan completes")
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r[0] {
            Datum::Int64(v) => v,
            ref other => panic!("unexpected id {other:?}"),
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn empty_input_yields_nothing() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let mut scan = start(vec![], vec![Expr::compare(CompareOp::Gt, id(), int(0))], None, ScanConfig::default(), Some(ctx));
    assert!(scan.next_chunk_task().unwrap().is_none());
    assert!(scan.advance().unwrap().is_none());
    assert_eq!(dev.launch_count(), 0);
}

#[test]
fn chunk_without_matches_moves_on_to_the_next() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig::default());
    // The first chunk holds ids 0..1000 and matches nothing.
    let q = Expr::compare(CompareOp::GtEq, id(), int(1000));
    let mut scan = start(people(1500), vec![q], None, ScanConfig::default().with_chunk_rows(1000), Some(ctx));
    let out = scan.collect_rows().unwrap();
    assert_eq!(ids(&out), (1000..1500).collect::<Vec<_>>());
    let stats = scan.stats();
    assert_eq!(stats.chunks_read, 2);
    assert_eq!(stats.rows_removed_by_device_filter, 1000);
}

#[test]
fn unsupported_column_type_is_filtered_on_the_host() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig::default());
    let device_q = Expr::compare(CompareOp::Lt, id(), int(300));
    let json_q = Expr::is_not_null(Expr::col(2, DataType::Json));
    let plan = ScanPlan::new(people_schema(), vec![device_q.clone(), json_q.clone()], None, &CudaTranspiler).unwrap();
    assert_eq!(plan.device_quals(), &[device_q.clone()]);
    assert_eq!(plan.host_quals().len(), 1);

    let config = ScanConfig::default().with_chunk_rows(64);
    let mut scan = start(people(1000), vec![device_q, json_q], None, config, Some(ctx));
    let out = scan.collect_rows().unwrap();
    let expected: Vec<i64> = (0..300).filter(|i| i % 3 != 0).collect();
    assert_eq!(ids(&out), expected);
    assert_eq!(scan.stats().rows_removed_by_host_filter, 100);
    assert_eq!(scan.stats().rows_removed_by_device_filter, 700);
}

#[test]
fn abort_with_running_tasks_releases_everything() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig {
        launch_latency: Duration::from_millis(150),
        ..Default::default()
    });
    let config = ScanConfig::default().with_chunk_rows(16).with_max_inflight(2);
    let mut scan = start(people(64), vec![Expr::compare(CompareOp::Lt, id(), int(40))], None, config, Some(ctx.clone()));
    for _ in 0..2 {
        let task = scan.next_chunk_task().unwrap().expect("a chunk");
        scan.submit_task(task).unwrap();
    }
    assert_eq!(scan.in_flight(), 2);
    assert!(dev.memory_in_use() > 0);

    scan.end();
    assert_eq!(scan.in_flight(), 0);
    assert_eq!(dev.memory_in_use(), 0);
    assert_eq!(dev.live_streams(), 0);
    assert!(matches!(scan.advance(), Err(ScanError::Aborted)));

    // The stream workers still run their queued callbacks against a
    // context that no longer knows the tasks.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(scan.in_flight(), 0);
    assert_eq!(dev.memory_in_use(), 0);
    ctx.trim();
    assert_eq!(dev.live_allocations(), 0);
}

#[test]
fn dropping_a_scan_with_running_tasks_is_safe() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig {
        launch_latency: Duration::from_millis(100),
        ..Default::default()
    });
    let config = ScanConfig::default().with_chunk_rows(16).with_max_inflight(2);
    let q = Expr::compare(CompareOp::Gt, id(), int(10));
    let mut scan = start(people(64), vec![q], None, config, Some(ctx.clone()));
    for _ in 0..2 {
        let task = scan.next_chunk_task().unwrap().expect("a chunk");
        scan.submit_task(task).unwrap();
    }
    drop(scan);
    std::thread::sleep(Duration::from_millis(300));
    ctx.trim();
    assert_eq!(dev.memory_in_use(), 0);
    assert_eq!(dev.live_allocations(), 0);
}

#[test]
fn compile_failure_names_the_compile_phase() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    dev.inject(Fault::CompileError("expected ';' before '}'".into()));
    let plan = ScanPlan::new(
        people_schema(),
        vec![Expr::compare(CompareOp::Lt, id(), int(3))],
        None,
        &CudaTranspiler,
    )
    .unwrap();
    let err = GpuScan::with_context(
        Box::new(MemoryChunkStore::new(people_schema(), people(10))),
        plan,
        vec![],
        ScanConfig::default(),
        Some(ctx),
    )
    .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Compile));
    let msg = err.to_string();
    assert!(msg.contains("compile"), "{msg}");
    assert!(msg.contains("expected ';'"), "{msg}");
    assert_eq!(dev.alloc_count(), 0);
    assert_eq!(dev.live_streams(), 0);
}

// ============================================================================
// Recovery paths
// ============================================================================

#[test]
fn out_of_memory_defers_while_tasks_run() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig {
        launch_latency: Duration::from_millis(50),
        ..Default::default()
    });
    let config = ScanConfig::default().with_chunk_rows(16);
    let mut scan = start(people(64), vec![Expr::compare(CompareOp::Lt, id(), int(50))], None, config, Some(ctx));
    let first = scan.next_chunk_task().unwrap().unwrap();
    scan.submit_task(first).unwrap();
    dev.inject(Fault::OutOfMemory(1));
    let second = scan.next_chunk_task().unwrap().unwrap();
    scan.submit_task(second).unwrap();
    assert_eq!(scan.pending_len(), 1);
    assert_eq!(scan.effective_inflight(), 1);

    let out = scan.collect_rows().unwrap();
    assert_eq!(ids(&out), (0..50).collect::<Vec<_>>());
    let stats = scan.stats();
    assert_eq!(stats.oom_deferrals, 1);
    assert_eq!(stats.oom_splits, 0);
    assert!(scan.effective_inflight() <= scan.config().max_inflight);
}

#[test]
fn destination_regrows_until_the_projection_fits() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig::default());
    let long = "x".repeat(400);
    let rows: Vec<Row> = (0..20)
        .map(|i| vec![Datum::Int64(i), Datum::Text(format!("{long}{i}")), Datum::Null])
        .collect();
    let wide = Expr::func(ScalarFunc::Concat, vec![name(); 8]);
    let targets = Some(vec![id(), wide]);
    let mut scan = start(rows.clone(), vec![], targets.clone(), ScanConfig::default(), Some(ctx));
    let out = scan.collect_rows().unwrap();
    assert!(scan.stats().nospace_retries >= 1);
    assert_eq!(out.len(), 20);
    match &out[3][1] {
        Datum::Text(s) => assert_eq!(s.len(), 8 * 401),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(out, run(rows, vec![], targets, ScanConfig::default(), None));
}

#[test]
fn recheck_request_reevaluates_on_the_host() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let q = Expr::compare(CompareOp::Lt, id(), int(30));
    let mut scan = start(people(100), vec![q.clone()], None, ScanConfig::default().with_chunk_rows(25), Some(ctx));
    dev.inject(Fault::CpuReCheck);
    let out = scan.collect_rows().unwrap();
    assert_eq!(ids(&out), (0..30).collect::<Vec<_>>());
    assert_eq!(scan.stats().rows_rechecked, 25);
    assert!(scan.is_on_device());
}

#[test]
fn lost_context_finishes_on_the_host() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let q = Expr::compare(CompareOp::Lt, id(), int(70));
    let config = ScanConfig::default().with_chunk_rows(10);
    let mut scan = start(people(100), vec![q.clone()], None, config.clone(), Some(ctx));
    let mut out = Vec::new();
    for _ in 0..5 {
        out.push(scan.advance().unwrap().unwrap());
    }
    dev.inject(Fault::ContextLost);
    out.extend(scan.collect_rows().unwrap());
    assert_eq!(out, run(people(100), vec![q], None, config, None));
    assert!(!scan.is_on_device());
    assert!(scan.stats().rows_rechecked > 0);
}

#[test]
fn kernel_fault_fails_the_query_with_its_code() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let mut scan = start(people(10), vec![Expr::compare(CompareOp::Lt, id(), int(3))], None, ScanConfig::default(), Some(ctx));
    dev.inject(Fault::KernelFault);
    let err = scan.collect_rows().unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Launch));
    let msg = err.to_string();
    assert!(msg.starts_with("launch failed"), "{msg}");
    assert!(msg.contains("700"), "{msg}");
    assert!(scan.next().is_none());
}

// ============================================================================
// Result order, formats and variants
// ============================================================================

#[test]
fn unordered_scan_returns_the_same_rows() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig {
        launch_latency: Duration::from_millis(2),
        ..Default::default()
    });
    let q = Expr::compare(CompareOp::NotEq, Expr::arith(ArithOp::Mod, id(), int(7)), int(0));
    let config = ScanConfig::default().with_chunk_rows(32).with_ordered(false);
    let mut out = ids(&run(people(500), vec![q.clone()], None, config, Some(ctx)));
    out.sort_unstable();
    let expected: Vec<i64> = (0..500).filter(|i| i % 7 != 0).collect();
    assert_eq!(out, expected);
}

#[test]
fn ordered_projection_keeps_chunk_order() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig {
        launch_latency: Duration::from_millis(2),
        ..Default::default()
    });
    let targets = Some(vec![id(), Expr::func(ScalarFunc::Upper, vec![name()])]);
    let q = Expr::compare(CompareOp::NotEq, Expr::arith(ArithOp::Mod, id(), int(3)), int(0));
    let config = ScanConfig::default().with_chunk_rows(16).with_max_inflight(4);
    let out = ids(&run(people(200), vec![q], targets, config, Some(ctx)));

    // Chunks arrive in order; rows within a chunk may not.
    let chunks: Vec<i64> = out.iter().map(|i| i / 16).collect();
    assert!(chunks.windows(2).all(|w| w[0] <= w[1]), "chunks out of order: {chunks:?}");
    let mut sorted = out.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..200).filter(|i| i % 3 != 0).collect::<Vec<i64>>());
}

#[test]
fn slot_and_row_results_agree() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig::default());
    let targets = Some(vec![
        Expr::arith(ArithOp::Mul, id(), int(2)),
        Expr::func(ScalarFunc::Upper, vec![name()]),
    ]);
    let q = vec![Expr::compare(CompareOp::GtEq, id(), int(5))];
    let base = ScanConfig::default().with_chunk_rows(40);
    let rows = run(people(120), q.clone(), targets.clone(), base.clone(), Some(ctx.clone()));
    let slots = run(
        people(120),
        q.clone(),
        targets.clone(),
        base.clone().with_result_format(ChunkFormat::Slot),
        Some(ctx),
    );
    assert_eq!(rows, slots);
    assert_eq!(rows, run(people(120), q, targets, base, None));
    assert_eq!(rows.len(), 115);
    assert_eq!(rows[0][0], Datum::Int64(10));
    assert_eq!(rows[0][1], Datum::Text("PERSON-5".into()));
}

#[test]
fn rescan_repeats_the_results() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let q = Expr::compare(CompareOp::Lt, id(), int(45));
    let mut scan = start(people(90), vec![q], None, ScanConfig::default().with_chunk_rows(20), Some(ctx));
    let first = scan.collect_rows().unwrap();
    scan.rescan().unwrap();
    let second = scan.collect_rows().unwrap();
    assert_eq!(first, second);
    assert_eq!(dev.compile_count(), 1);
    assert_eq!(scan.stats().rows_returned, 90);
}

#[test]
fn arrow_batches_in_and_out() {
    init_tracing();
    let schema = Arc::new(ArrowSchema::new(vec![
        ArrowField::new("id", ArrowType::Int64, false),
        ArrowField::new("name", ArrowType::Utf8, true),
    ]));
    let batch = |lo: i64, hi: i64| {
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from_iter_values(lo..hi)),
                Arc::new(StringArray::from_iter((lo..hi).map(|i| (i % 4 != 0).then(|| format!("n{i}"))))),
            ],
        )
        .unwrap()
    };
    let store = RecordBatchChunkStore::try_new(vec![batch(0, 50), batch(50, 100)]).unwrap();
    let input = gpuscan::ChunkStore::schema(&store).clone();
    let q = Expr::is_not_null(Expr::col(1, DataType::Text));
    let targets = Some(vec![Expr::col(1, DataType::Text)]);
    let plan = ScanPlan::new(input, vec![q], targets, &CudaTranspiler).unwrap();
    let (_, ctx) = device(HostDeviceConfig::default());
    let mut scan =
        GpuScan::with_context(Box::new(store), plan, vec![], ScanConfig::default().with_chunk_rows(30), Some(ctx))
            .unwrap();
    let out = scan.collect_batch().unwrap();
    assert_eq!(out.num_rows(), 75);
    assert_eq!(out.num_columns(), 1);
    assert_eq!(out.column(0).null_count(), 0);
}

#[test]
fn parameters_are_bound_per_scan() {
    init_tracing();
    let (dev, ctx) = device(HostDeviceConfig::default());
    let q = Expr::compare(CompareOp::Lt, id(), Expr::param(0, DataType::Int64));
    let scan_with = |limit: i64| {
        let plan = ScanPlan::new(people_schema(), vec![q.clone()], None, &CudaTranspiler).unwrap();
        GpuScan::with_context(
            Box::new(MemoryChunkStore::new(people_schema(), people(40))),
            plan,
            vec![Datum::Int64(limit)],
            ScanConfig::default(),
            Some(ctx.clone()),
        )
        .unwrap()
        .collect_rows()
        .unwrap()
    };
    assert_eq!(scan_with(5).len(), 5);
    assert_eq!(scan_with(25).len(), 25);
    assert_eq!(dev.compile_count(), 1);

    let plan = ScanPlan::new(people_schema(), vec![q.clone()], None, &CudaTranspiler).unwrap();
    let unbound = GpuScan::with_context(
        Box::new(MemoryChunkStore::new(people_schema(), people(40))),
        plan,
        vec![],
        ScanConfig::default(),
        Some(ctx),
    );
    assert!(unbound.is_err());
}

#[test]
fn invisible_rows_are_never_returned() {
    init_tracing();
    let (_, ctx) = device(HostDeviceConfig::default());
    let visible: Vec<bool> = (0..200).map(|i| !(40..120).contains(&i) && i % 5 != 0).collect();
    let store = MemoryChunkStore::new(people_schema(), people(200)).with_visibility(visible.clone()).unwrap();
    let plan = ScanPlan::new(people_schema(), vec![], None, &CudaTranspiler).unwrap();
    let mut scan =
        GpuScan::with_context(Box::new(store), plan, vec![], ScanConfig::default().with_chunk_rows(20), Some(ctx))
            .unwrap();
    let out = scan.collect_rows().unwrap();
    let expected: Vec<i64> = (0..200).filter(|&i| visible[i as usize]).collect();
    assert_eq!(ids(&out), expected);
}
