use std::sync::atomic::{AtomicUsize, Ordering};

use accelop::config::PluginConfig;
use accelop::device::{DeviceMemory, DevicePtr, ExecutionContext, Stream};
use accelop::primitive::PermutationPrimitive;
use accelop::graph::NodeBuilder;
use accelop::ops::TRANSPOSE_OP_TYPE;
use accelop::registry::create_operator;
use accelop::spec::{DType, OpError, OpResult, Shape, TensorLiteral, TensorSpec};
use accelop_backend_host::permute::STATUS_INVALID_VALUE;
use accelop_backend_host::HostContext;
use accelop_backend_tests::transpose::run_node;
use anyhow::Result;

fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::new(DType::F32, Shape::from_static(dims))
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn primitive_failure_surfaces_status() -> Result<()> {
    let ctx = HostContext::new().with_primitive_failure(STATUS_INVALID_VALUE);
    let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&[2, 2]))
        .output(f32_spec(&[2, 2]))
        .finish();
    let err = run_node(&ctx, &node, &[&f32_bytes(&[1.0, 2.0, 3.0, 4.0])])
        .expect_err("injected failure");
    match err {
        OpError::PrimitiveFailure(inner) => assert_eq!(inner.status, STATUS_INVALID_VALUE),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ctx.device().allocation_count(), 0);
    Ok(())
}

#[test]
fn unchecked_runtime_permutation_defers_to_primitive() -> Result<()> {
    let config = PluginConfig {
        check_runtime_permutation: false,
        ..PluginConfig::default()
    };
    let ctx = HostContext::with_config(config);
    let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&[2, 3]))
        .parameter(TensorSpec::new(DType::Si32, Shape::from_static(&[2])))
        .output(f32_spec(&[3, 2]))
        .finish();
    let perm = TensorLiteral::from_i64s(DType::Si32, &[1, 1])?;

    let err = run_node(&ctx, &node, &[&f32_bytes(&[0.0; 6]), &perm.bytes])
        .expect_err("repeated axis");
    match err {
        OpError::PrimitiveFailure(inner) => assert_eq!(inner.status, STATUS_INVALID_VALUE),
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn operator_instance_is_reusable_across_contexts() -> Result<()> {
    let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&[2, 3]))
        .constant(TensorLiteral::from_i64s(DType::Ui16, &[1, 0])?)
        .output(f32_spec(&[3, 2]))
        .finish();
    let op = create_operator(&node)?;

    let handles = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let op = &op;
                scope.spawn(move || -> Result<Vec<u8>> {
                    let ctx = HostContext::new();
                    let base = worker as f32 * 10.0;
                    let values: Vec<f32> = (0..6).map(|i| base + i as f32).collect();
                    let input = ctx.upload(&f32_bytes(&values))?;
                    let perm = ctx.upload(&[1, 0, 0, 0])?;
                    let output = ctx.alloc(24)?;
                    op.execute(&ctx, &[input, perm], &[output])?;
                    Ok(ctx.read(output)?)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    for (worker, bytes) in handles.iter().enumerate() {
        let base = worker as f32 * 10.0;
        let expected: Vec<f32> = [0, 3, 1, 4, 2, 5]
            .iter()
            .map(|&i| base + i as f32)
            .collect();
        assert_eq!(bytes, &f32_bytes(&expected));
    }
    Ok(())
}

#[test]
fn context_exposes_configured_policy() {
    let ctx = HostContext::new();
    assert!(ctx.config().check_runtime_permutation);
    assert_eq!(ctx.permutation().name(), "host");
}

/// Host context whose copies start failing after `writes_left` succeed.
struct ExhaustingContext {
    inner: HostContext,
    writes_left: AtomicUsize,
}

impl ExecutionContext for ExhaustingContext {
    fn stream(&self) -> &dyn Stream {
        self.inner.stream()
    }

    fn permutation(&self) -> &dyn PermutationPrimitive {
        self.inner.permutation()
    }

    fn config(&self) -> &PluginConfig {
        self.inner.config()
    }
}

impl DeviceMemory for ExhaustingContext {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        self.inner.alloc(bytes)
    }

    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        let granted = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !granted {
            return Err(OpError::device("copy budget exhausted"));
        }
        self.inner.write(ptr, bytes)
    }

    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
        self.inner.read(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.inner.free(ptr)
    }
}

#[test]
fn failed_second_upload_releases_staged_buffers() -> Result<()> {
    let ctx = ExhaustingContext {
        inner: HostContext::new(),
        writes_left: AtomicUsize::new(1),
    };
    let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&[2, 3]))
        .parameter(TensorSpec::new(DType::Si32, Shape::from_static(&[2])))
        .output(f32_spec(&[3, 2]))
        .finish();
    let perm = TensorLiteral::from_i64s(DType::Si32, &[1, 0])?;

    let err = run_node(&ctx, &node, &[&f32_bytes(&[0.0; 6]), &perm.bytes])
        .expect_err("second upload fails");
    assert!(matches!(err, OpError::Device(_)), "{err}");
    assert_eq!(ctx.inner.device().allocation_count(), 0);
    Ok(())
}
