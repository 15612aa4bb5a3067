//! Property-based tests for scan semantics.
//!
//! Part 1: offloading never changes the answer. The same scan on the
//! emulated device and on the host returns the same rows in the same order,
//! whatever the chunk budget.
//!
//! Part 2: pipeline invariants. The number of tasks running at once never
//! exceeds the configured bound, and projected rows of any width come back
//! intact however small the first destination estimate was.

use std::sync::Arc;

use gpuscan::gpu::host_device::HostDeviceConfig;
use gpuscan::transpiler::{ArithOp, CompareOp, ScalarFunc};
use gpuscan::{
    CudaTranspiler, DataType, Datum, DeviceContext, Expr, Field, GpuScan, MemoryChunkStore, Row, ScanConfig, ScanPlan,
    Schema, SchemaRef,
};

use proptest::prelude::*;

// ============================================================================
// Shared helpers
// ============================================================================

/// Number of proptest cases. Override with PROPTEST_CASES env var.
fn num_cases() -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(48)
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64),
        Field::new("v", DataType::Int32),
        Field::new("s", DataType::Text),
    ]))
}

fn k() -> Expr {
    Expr::col(0, DataType::Int64)
}

fn v() -> Expr {
    Expr::col(1, DataType::Int32)
}

fn s() -> Expr {
    Expr::col(2, DataType::Text)
}

/// Rows with a unique key, a nullable int and a nullable string.
fn rows_strategy(max: usize) -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec(
        (
            prop::option::of(-1000i32..1000),
            prop::option::of("[a-z]{0,24}"),
        ),
        0..max,
    )
    .prop_map(|cells| {
        cells
            .into_iter()
            .enumerate()
            .map(|(i, (v, s))| {
                vec![
                    Datum::Int64(i as i64),
                    v.map_or(Datum::Null, Datum::Int32),
                    s.map_or(Datum::Null, Datum::Text),
                ]
            })
            .collect()
    })
}

/// A qual the device can evaluate, chosen from a few shapes.
fn qual_strategy() -> impl Strategy<Value = Vec<Expr>> {
    prop_oneof![
        Just(vec![]),
        (-1000i32..1000).prop_map(|c| vec![Expr::compare(CompareOp::Lt, v(), Expr::lit(Datum::Int32(c)))]),
        (1i64..7).prop_map(|m| vec![Expr::compare(
            CompareOp::Eq,
            Expr::arith(ArithOp::Mod, k(), Expr::lit(Datum::Int64(m))),
            Expr::lit(Datum::Int64(0)),
        )]),
        Just(vec![Expr::is_not_null(v()), Expr::is_null(s())]),
    ]
}

fn run(
    rows: &[Row],
    quals: &[Expr],
    targets: Option<Vec<Expr>>,
    config: ScanConfig,
    ctx: Option<Arc<DeviceContext>>,
) -> (Vec<Row>, GpuScan) {
    let plan = ScanPlan::new(schema(), quals.to_vec(), targets, &CudaTranspiler).expect("plan");
    let mut scan = GpuScan::with_context(
        Box::new(MemoryChunkStore::new(schema(), rows.to_vec())),
        plan,
        vec![],
        config,
        ctx,
    )
    .expect("scan starts");
    let out = scan.collect_rows().expect("scan completes");
    (out, scan)
}

fn host_device() -> Arc<DeviceContext> {
    Arc::new(DeviceContext::host(HostDeviceConfig::default()))
}

// ============================================================================
// Part 1: Offload equivalence
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(num_cases()))]

    /// Property 1: device and host scans return identical rows in order.
    #[test]
    fn prop_offload_does_not_change_results(
        rows in rows_strategy(300),
        quals in qual_strategy(),
        chunk_rows in 1usize..80,
    ) {
        let config = ScanConfig::default().with_chunk_rows(chunk_rows);
        let (on, _) = run(&rows, &quals, None, config.clone(), Some(host_device()));
        let (off, _) = run(&rows, &quals, None, config.with_device(false), None);
        prop_assert_eq!(on, off);
    }

    /// Property 2: chunk budgets are invisible in the result.
    #[test]
    fn prop_chunking_is_not_semantics(
        rows in rows_strategy(300),
        quals in qual_strategy(),
        small in 1usize..20,
        extra in 1usize..200,
    ) {
        let ctx = host_device();
        let (a, _) = run(&rows, &quals, None, ScanConfig::default().with_chunk_rows(small), Some(ctx.clone()));
        let (b, _) = run(&rows, &quals, None, ScanConfig::default().with_chunk_rows(small + extra), Some(ctx));
        prop_assert_eq!(a, b);
    }
}

// ============================================================================
// Part 2: Pipeline invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(num_cases()))]

    /// Property 3: never more than K tasks in flight.
    #[test]
    fn prop_in_flight_bound_holds(
        rows in rows_strategy(400),
        quals in qual_strategy(),
        max_inflight in 1usize..5,
        chunk_rows in 4usize..40,
    ) {
        let config = ScanConfig::default()
            .with_chunk_rows(chunk_rows)
            .with_max_inflight(max_inflight)
            .with_ordered(false);
        let (_, scan) = run(&rows, &quals, None, config, Some(host_device()));
        let stats = scan.stats();
        prop_assert!(stats.peak_in_flight <= max_inflight,
            "peak {} exceeds bound {}", stats.peak_in_flight, max_inflight);
        prop_assert_eq!(stats.rows_read, rows.len() as u64);
    }

    /// Property 4: projections of any width survive destination sizing.
    #[test]
    fn prop_projection_matches_host(
        rows in rows_strategy(150),
        repeat in 1usize..6,
        chunk_rows in 1usize..64,
    ) {
        let targets = vec![
            Expr::func(ScalarFunc::Concat, vec![s(); repeat]),
            Expr::arith(ArithOp::Add, k(), Expr::lit(Datum::Int64(1))),
            Expr::func(ScalarFunc::Upper, vec![s()]),
        ];
        let config = ScanConfig::default().with_chunk_rows(chunk_rows);
        let (on, _) = run(&rows, &[], Some(targets.clone()), config.clone(), Some(host_device()));
        let (off, _) = run(&rows, &[], Some(targets), config, None);
        prop_assert_eq!(on.len(), rows.len());
        prop_assert_eq!(on, off);
    }
}
