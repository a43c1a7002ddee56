//! Transpose conformance checks, generic over the execution context.

use accelop::device::{DeviceMemory, DevicePtr, ExecutionContext};
use accelop::graph::{Node, NodeBuilder};
use accelop::layout::AxisPermutation;
use accelop::ops::TRANSPOSE_OP_TYPE;
use accelop::registry::create_operator;
use accelop::spec::{DType, OpError, OpResult, Shape, TensorLiteral, TensorSpec};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::recording::{ContextEvent, RecordingContext};

/// Builds the operator for `node`, runs it on freshly uploaded `inputs`, and
/// returns the output bytes. Every allocation is released before returning.
pub fn run_node<C>(ctx: &C, node: &Node, inputs: &[&[u8]]) -> OpResult<Vec<u8>>
where
    C: ExecutionContext + DeviceMemory,
{
    let op = create_operator(node)?;
    let output_len = op
        .describe()
        .outputs
        .first()
        .and_then(|binding| binding.byte_len())
        .ok_or_else(|| OpError::invalid_graph("output size unknown"))?;

    let mut handles = Vec::with_capacity(inputs.len() + 1);
    let staged = inputs
        .iter()
        .map(|bytes| ctx.upload(bytes))
        .chain(std::iter::once_with(|| ctx.alloc(output_len)))
        .try_for_each(|handle| handle.map(|handle| handles.push(handle)));
    if let Err(err) = staged {
        release(ctx, &handles);
        return Err(err);
    }

    let (&output, data) = handles
        .split_last()
        .ok_or_else(|| OpError::device("output buffer was not staged"))?;
    let result = op
        .execute(ctx, data, &[output])
        .and_then(|()| ctx.read(output));
    for &handle in &handles {
        ctx.free(handle)?;
    }
    result
}

/// Frees staged buffers after a failed upload; the staging error is the one reported.
fn release<C: DeviceMemory>(ctx: &C, handles: &[DevicePtr]) {
    for &handle in handles {
        if let Err(err) = ctx.free(handle) {
            eprintln!("failed to free {handle:?}: {err}");
        }
    }
}

/// Row-major transpose of `width`-byte elements: output axis `i` reads input axis `perm[i]`.
pub fn reference_transpose(bytes: &[u8], dims: &[usize], perm: &[usize], width: usize) -> Vec<u8> {
    let out_dims: Vec<usize> = perm.iter().map(|&axis| dims[axis]).collect();
    let input_strides = compute_strides(dims);
    let count: usize = dims.iter().product();
    let mut result = vec![0u8; count * width];
    for (idx, slot) in result.chunks_exact_mut(width).enumerate() {
        let out_coord = unravel_index(idx, &out_dims);
        let in_index: usize = out_coord
            .iter()
            .enumerate()
            .map(|(out_axis, &c)| c * input_strides[perm[out_axis]])
            .sum();
        slot.copy_from_slice(&bytes[in_index * width..(in_index + 1) * width]);
    }
    result
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn random_f32_bytes(rng: &mut StdRng, count: usize) -> Vec<u8> {
    let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-4.0f32..4.0)).collect();
    f32_bytes(&values)
}

fn permuted(dims: &[usize], perm: &[usize]) -> Vec<usize> {
    perm.iter().map(|&axis| dims[axis]).collect()
}

fn f32_spec(dims: &[usize]) -> TensorSpec {
    TensorSpec::new(DType::F32, Shape::from_static(dims))
}

fn constant_node(dims: &[usize], perm: &[usize], dtype: DType) -> Node {
    let values: Vec<i64> = perm.iter().map(|&axis| axis as i64).collect();
    let literal = TensorLiteral::from_i64s(dtype, &values).expect("encode permutation");
    NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(dims))
        .constant(literal)
        .output(f32_spec(&permuted(dims, perm)))
        .finish()
}

fn runtime_node(dims: &[usize], out_dims: &[usize], perm_dtype: DType) -> Node {
    NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(dims))
        .computed(
            TensorSpec::new(perm_dtype, Shape::from_static(&[dims.len()])),
            "Concat",
        )
        .output(f32_spec(out_dims))
        .finish()
}

pub fn default_permutation_reverses_axes<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let mut rng = StdRng::seed_from_u64(42);
    let dims = [2, 3, 4, 5];
    let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&dims))
        .output(f32_spec(&[5, 4, 3, 2]))
        .finish();
    let data = random_f32_bytes(&mut rng, 120);

    let recording = RecordingContext::new(ctx);
    let out = run_node(&recording, &node, &[&data]).expect("transpose runs");
    assert_eq!(out, reference_transpose(&data, &dims, &[3, 2, 1, 0], 4));
    assert_eq!(
        recording.events(),
        vec![ContextEvent::Permute {
            output_modes: vec![3, 2, 1, 0]
        }]
    );
}

pub fn constant_permutation_skips_transfer<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let dims = [1, 2, 3];
    let node = constant_node(&dims, &[2, 0, 1], DType::Si32);
    let data = f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let perm_bytes = TensorLiteral::from_i64s(DType::Si32, &[2, 0, 1])
        .expect("encode permutation")
        .bytes;

    let recording = RecordingContext::new(ctx);
    let out = run_node(&recording, &node, &[&data, &perm_bytes]).expect("transpose runs");
    assert_eq!(out, f32_bytes(&[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]));
    assert_eq!(
        recording.events(),
        vec![ContextEvent::Permute {
            output_modes: vec![2, 0, 1]
        }]
    );
}

pub fn runtime_permutation_every_index_type<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let mut rng = StdRng::seed_from_u64(7);
    let dims = [2, 3, 4];
    let perm = [1, 2, 0];
    let out_dims = permuted(&dims, &perm);
    let data = random_f32_bytes(&mut rng, 24);
    let expected = reference_transpose(&data, &dims, &perm, 4);

    for dtype in DType::PERMUTATION_INDEX_TYPES {
        let node = runtime_node(&dims, &out_dims, dtype);
        let perm_bytes = TensorLiteral::from_i64s(dtype, &[1, 2, 0])
            .expect("encode permutation")
            .bytes;
        let width = dtype.size_in_bytes().expect("integer width");

        let recording = RecordingContext::new(ctx);
        let out = run_node(&recording, &node, &[&data, &perm_bytes])
            .unwrap_or_else(|err| panic!("{dtype:?}: {err}"));
        assert_eq!(out, expected, "{dtype:?}");
        assert_eq!(
            recording.events(),
            vec![
                ContextEvent::Download { bytes: 3 * width },
                ContextEvent::Synchronize,
                ContextEvent::Permute {
                    output_modes: vec![1, 2, 0]
                },
            ],
            "{dtype:?}"
        );
    }
}

pub fn runtime_permutation_is_read_every_call<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let dims = [2, 2];
    let node = runtime_node(&dims, &dims, DType::Si64);
    let op = create_operator(&node).expect("build transpose");
    let data = ctx
        .upload(&f32_bytes(&[1.0, 2.0, 3.0, 4.0]))
        .expect("upload data");
    let output = ctx.alloc(16).expect("alloc output");

    let recording = RecordingContext::new(ctx);
    for perm in [[1i64, 0], [0, 1]] {
        let perm_bytes = TensorLiteral::from_i64s(DType::Si64, &perm)
            .expect("encode permutation")
            .bytes;
        let perm_handle = ctx.upload(&perm_bytes).expect("upload permutation");
        op.execute(&recording, &[data, perm_handle], &[output])
            .expect("transpose runs");
        ctx.free(perm_handle).expect("free permutation");
        assert_eq!(
            recording.events(),
            vec![
                ContextEvent::Download { bytes: 16 },
                ContextEvent::Synchronize,
                ContextEvent::Permute {
                    output_modes: vec![perm[0] as i32, perm[1] as i32]
                },
            ],
            "{perm:?}"
        );
        recording.clear();
    }
    assert_eq!(
        ctx.read(output).expect("read output"),
        f32_bytes(&[1.0, 2.0, 3.0, 4.0])
    );
    ctx.free(data).expect("free data");
    ctx.free(output).expect("free output");
}

pub fn runtime_float_permutation_is_unsupported<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let dims = [2, 3];
    let node = runtime_node(&dims, &[3, 2], DType::F32);
    let data = f32_bytes(&[0.0; 6]);
    let perm_bytes = f32_bytes(&[1.0, 0.0]);

    let recording = RecordingContext::new(ctx);
    let err = run_node(&recording, &node, &[&data, &perm_bytes]).expect_err("float permutation");
    assert!(
        matches!(err, OpError::UnsupportedType { dtype: DType::F32, .. }),
        "{err}"
    );
    assert!(recording.events().is_empty());
}

pub fn runtime_permutation_is_validated<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    if !ctx.config().check_runtime_permutation {
        eprintln!("skipping runtime permutation validation: disabled by configuration");
        return;
    }
    let dims = [2, 3];
    let node = runtime_node(&dims, &[3, 2], DType::Si32);
    let data = f32_bytes(&[0.0; 6]);
    for perm in [[1i64, 1], [0, 2], [0, 1]] {
        let perm_bytes = TensorLiteral::from_i64s(DType::Si32, &perm)
            .expect("encode permutation")
            .bytes;
        let recording = RecordingContext::new(ctx);
        let err = run_node(&recording, &node, &[&data, &perm_bytes]).expect_err("bad permutation");
        assert!(
            matches!(err, OpError::InvalidPermutation { .. }),
            "{perm:?}: {err}"
        );
        assert!(!recording
            .events()
            .iter()
            .any(|event| matches!(event, ContextEvent::Permute { .. })));
    }
}

pub fn low_rank_tensors_copy_through<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let scalar = NodeBuilder::new(TRANSPOSE_OP_TYPE)
        .parameter(f32_spec(&[]))
        .output(f32_spec(&[]))
        .finish();
    let data = f32_bytes(&[3.5]);
    assert_eq!(run_node(ctx, &scalar, &[&data]).expect("rank 0"), data);

    let vector = constant_node(&[7], &[0], DType::Ui8);
    let data = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    let perm_bytes = [0u8];
    assert_eq!(
        run_node(ctx, &vector, &[&data, &perm_bytes]).expect("rank 1"),
        data
    );
}

/// A rank-0 runtime permutation is still read back, as an empty transfer.
pub fn scalar_runtime_permutation_is_empty_transfer<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let node = runtime_node(&[], &[], DType::Si32);
    let data = f32_bytes(&[-2.25]);
    let perm_bytes: [u8; 0] = [];

    let recording = RecordingContext::new(ctx);
    let out = run_node(&recording, &node, &[&data, &perm_bytes]).expect("rank 0 runtime");
    assert_eq!(out, data);
    assert_eq!(
        recording.events(),
        vec![
            ContextEvent::Download { bytes: 0 },
            ContextEvent::Synchronize,
            ContextEvent::Permute {
                output_modes: vec![]
            },
        ]
    );
}

pub fn random_shapes_match_reference<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let mut rng = StdRng::seed_from_u64(1234);
    for _ in 0..24 {
        let rank = rng.gen_range(0..=5);
        let dims: Vec<usize> = (0..rank).map(|_| rng.gen_range(1..=4)).collect();
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.shuffle(&mut rng);
        let node = constant_node(&dims, &perm, DType::Si64);
        let data = random_f32_bytes(&mut rng, dims.iter().product());
        let perm_bytes: Vec<u8> = perm
            .iter()
            .flat_map(|&axis| (axis as i64).to_le_bytes())
            .collect();

        let out = run_node(ctx, &node, &[&data, &perm_bytes])
            .unwrap_or_else(|err| panic!("dims {dims:?} perm {perm:?}: {err}"));
        assert_eq!(
            out,
            reference_transpose(&data, &dims, &perm, 4),
            "dims {dims:?} perm {perm:?}"
        );
    }
}

/// Half and double precision tensors move bit-exactly.
pub fn float_element_types_are_preserved<C: ExecutionContext + DeviceMemory>(ctx: &C) {
    let mut rng = StdRng::seed_from_u64(99);
    let dims = [3, 1, 4];
    let perm = AxisPermutation::reversed(dims.len());
    let perm_axes: Vec<usize> = perm.axes().collect();
    let out_dims = permuted(&dims, &perm_axes);
    let count: usize = dims.iter().product();

    for dtype in [DType::F16, DType::Bf16, DType::F64] {
        let data: Vec<u8> = match dtype {
            // Normal finite values in [1, 2).
            DType::F16 => (0..count)
                .flat_map(|_| rng.gen_range(0x3C00u16..0x4000).to_le_bytes())
                .collect(),
            DType::Bf16 => (0..count)
                .flat_map(|_| rng.gen_range(0x3F80u16..0x4000).to_le_bytes())
                .collect(),
            _ => (0..count)
                .flat_map(|_| rng.gen_range(-8.0f64..8.0).to_le_bytes())
                .collect(),
        };
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(TensorSpec::new(dtype, Shape::from_static(&dims)))
            .output(TensorSpec::new(dtype, Shape::from_static(&out_dims)))
            .finish();
        let width = dtype.size_in_bytes().expect("sized dtype");

        let out = run_node(ctx, &node, &[&data])
            .unwrap_or_else(|err| panic!("{dtype:?}: {err}"));
        assert_eq!(
            out,
            reference_transpose(&data, &dims, &perm_axes, width),
            "{dtype:?}"
        );
    }
}
