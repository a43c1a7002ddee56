//! Axis transpose on top of the context's permutation primitive.
//!
//! The permutation either comes from the graph (absent second input, or a
//! constant one) and is fixed at construction, or is read back from the
//! second input tensor on every call.

use smallvec::SmallVec;

use crate::device::{DevicePtr, ExecutionContext};
use crate::graph::GraphNode;
use crate::layout::{AxisPermutation, Modes, TensorLayout, INLINE_RANK};
use crate::ops::{Operator, StaticLayout, TensorBinding};
use crate::primitive::{PermutationCall, Scalar, TensorDescriptor};
use crate::registry::OperatorRegistry;
use crate::spec::{decode_integers, DType, OpError, OpResult, TensorSpec};

pub const TRANSPOSE_OP_TYPE: &str = "Transpose";

/// Where the output-axis permutation comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermutationSource {
    /// Known when the graph was built.
    Static(AxisPermutation),
    /// Read from the second input at execution time, encoded as the given dtype.
    Runtime(DType),
}

#[derive(Debug)]
pub struct TransposeOp {
    name: String,
    dtype: DType,
    input: TensorLayout,
    output: TensorLayout,
    input_modes: Modes,
    alpha: Scalar,
    source: PermutationSource,
    perm_binding: Option<TensorBinding>,
}

impl TransposeOp {
    pub fn new(node: &dyn GraphNode) -> OpResult<Self> {
        let name = node.name().to_string();
        let input_count = node.input_count();
        if !(1..=2).contains(&input_count) {
            return Err(OpError::invalid_graph(format!(
                "{TRANSPOSE_OP_TYPE} node '{name}' expects 1 or 2 inputs, got {input_count}"
            )));
        }
        if node.output_count() != 1 {
            return Err(OpError::invalid_graph(format!(
                "{TRANSPOSE_OP_TYPE} node '{name}' expects 1 output, got {}",
                node.output_count()
            )));
        }

        let data = required_spec(node.input_spec(0), &name, "input 0")?;
        let result = required_spec(node.output_spec(0), &name, "output 0")?;
        if data.dtype != result.dtype {
            return Err(OpError::invalid_graph(format!(
                "node '{name}' output dtype {:?} differs from input dtype {:?}",
                result.dtype, data.dtype
            )));
        }

        let input = TensorLayout::row_major(&data.shape)?;
        let output = TensorLayout::row_major(&result.shape)?;
        let rank = input.rank();
        if output.rank() != rank {
            return Err(OpError::invalid_graph(format!(
                "node '{name}' output rank {} differs from input rank {rank}",
                output.rank()
            )));
        }
        let alpha = Scalar::one(data.dtype)?;

        let (source, perm_binding) = if input_count == 1 {
            (PermutationSource::Static(AxisPermutation::reversed(rank)), None)
        } else {
            let spec = required_spec(node.input_spec(1), &name, "input 1")?;
            let source = permutation_source(node, spec, rank)?;
            let binding = TensorBinding {
                dtype: spec.dtype,
                layout: TensorLayout::from_extents(&[rank])?,
            };
            (source, Some(binding))
        };

        if let PermutationSource::Static(perm) = &source {
            let expected = perm.apply(input.extents());
            if expected != output.extents() {
                return Err(OpError::invalid_graph(format!(
                    "node '{name}' output extents {:?} do not match input extents {:?} permuted by {perm}",
                    output.extents(),
                    input.extents()
                )));
            }
        }

        tracing::debug!(
            node = %name,
            dtype = ?data.dtype,
            input = ?input.extents(),
            output = ?output.extents(),
            source = ?source,
            "built transpose"
        );

        Ok(Self {
            name,
            dtype: data.dtype,
            input_modes: AxisPermutation::identity(rank).into_modes(),
            input,
            output,
            alpha,
            source,
            perm_binding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.input.rank()
    }

    pub fn input_layout(&self) -> &TensorLayout {
        &self.input
    }

    pub fn output_layout(&self) -> &TensorLayout {
        &self.output
    }

    pub fn permutation_source(&self) -> &PermutationSource {
        &self.source
    }

    fn expected_inputs(&self) -> usize {
        1 + usize::from(self.perm_binding.is_some())
    }

    /// Copies the permutation tensor to the host and decodes it.
    ///
    /// Performs exactly one transfer of `rank` elements and one synchronize.
    fn read_permutation(
        &self,
        ctx: &dyn ExecutionContext,
        src: DevicePtr,
        dtype: DType,
    ) -> OpResult<Modes> {
        let width = match dtype.size_in_bytes() {
            Some(width) if dtype.is_permutation_index() => width,
            _ => {
                return Err(OpError::unsupported_type(
                    dtype,
                    "runtime permutation must be an 8, 16, 32 or 64-bit integer tensor",
                ))
            }
        };
        let rank = self.rank();
        let byte_len = rank * width;
        if src.bytes() < byte_len {
            return Err(OpError::invalid_call(format!(
                "permutation tensor holds {} bytes, need {byte_len}",
                src.bytes()
            )));
        }

        let mut raw: SmallVec<[u8; INLINE_RANK * 8]> = SmallVec::from_elem(0, byte_len);
        let stream = ctx.stream();
        stream.download(&mut raw, src)?;
        stream.synchronize()?;

        let mut values: SmallVec<[i64; INLINE_RANK]> = SmallVec::with_capacity(rank);
        decode_integers(dtype, &raw, &mut values)?;

        if !ctx.config().check_runtime_permutation {
            return values
                .iter()
                .map(|&value| {
                    i32::try_from(value).map_err(|_| {
                        OpError::invalid_permutation(&values, format!("axis {value} exceeds i32"))
                    })
                })
                .collect();
        }

        let perm = AxisPermutation::from_indices(&values, rank)?;
        let input_extents = self.input.extents();
        let mismatch = perm
            .axes()
            .zip(self.output.extents())
            .position(|(axis, &extent)| input_extents[axis] != extent);
        if let Some(axis) = mismatch {
            return Err(OpError::invalid_permutation(
                &values,
                format!(
                    "output axis {axis} has extent {} but permuted input gives {}",
                    self.output.extents()[axis],
                    input_extents[perm.as_modes()[axis] as usize]
                ),
            ));
        }
        Ok(perm.into_modes())
    }

    fn check_buffer(&self, ptr: DevicePtr, layout: &TensorLayout, role: &str) -> OpResult<()> {
        let needed = usize::try_from(layout.element_count())
            .ok()
            .zip(self.dtype.size_in_bytes())
            .and_then(|(count, width)| count.checked_mul(width));
        match needed {
            Some(needed) if ptr.bytes() >= needed => Ok(()),
            Some(needed) => Err(OpError::invalid_call(format!(
                "{role} of '{}' holds {} bytes, need {needed}",
                self.name,
                ptr.bytes()
            ))),
            None => Err(OpError::invalid_call(format!(
                "{role} of '{}' has no computable byte size",
                self.name
            ))),
        }
    }
}

fn required_spec<'a>(
    spec: Option<&'a TensorSpec>,
    node: &str,
    what: &str,
) -> OpResult<&'a TensorSpec> {
    spec.ok_or_else(|| OpError::invalid_graph(format!("node '{node}' has no spec for {what}")))
}

fn permutation_source(
    node: &dyn GraphNode,
    spec: &TensorSpec,
    rank: usize,
) -> OpResult<PermutationSource> {
    if let Some(count) = spec.element_count() {
        if count != rank {
            return Err(OpError::invalid_graph(format!(
                "node '{}' permutation has {count} elements for rank {rank}",
                node.name()
            )));
        }
    }

    let Some(literal) = node.constant_input(1) else {
        if !spec.dtype.is_permutation_index() {
            tracing::warn!(
                node = %node.name(),
                dtype = ?spec.dtype,
                "runtime permutation dtype is not an integer type; execution will fail"
            );
        }
        return Ok(PermutationSource::Runtime(spec.dtype));
    };

    if !literal.spec.dtype.is_permutation_index() {
        return Err(OpError::unsupported_type(
            literal.spec.dtype,
            "constant permutation must be an 8, 16, 32 or 64-bit integer tensor",
        ));
    }
    let values = literal.to_i64_vec()?;
    let perm = AxisPermutation::from_indices(&values, rank).map_err(|err| {
        OpError::invalid_graph(format!(
            "node '{}' has an invalid constant permutation: {err}",
            node.name()
        ))
    })?;
    Ok(PermutationSource::Static(perm))
}

impl Operator for TransposeOp {
    fn op_type(&self) -> &str {
        TRANSPOSE_OP_TYPE
    }

    fn describe(&self) -> StaticLayout {
        let data = TensorBinding {
            dtype: self.dtype,
            layout: self.input.clone(),
        };
        let mut inputs = vec![data];
        inputs.extend(self.perm_binding.clone());
        StaticLayout {
            inputs,
            outputs: vec![TensorBinding {
                dtype: self.dtype,
                layout: self.output.clone(),
            }],
        }
    }

    fn execute(
        &self,
        ctx: &dyn ExecutionContext,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
    ) -> OpResult<()> {
        if inputs.len() != self.expected_inputs() {
            return Err(OpError::invalid_call(format!(
                "'{}' expects {} inputs, got {}",
                self.name,
                self.expected_inputs(),
                inputs.len()
            )));
        }
        let &[output] = outputs else {
            return Err(OpError::invalid_call(format!(
                "'{}' expects 1 output, got {}",
                self.name,
                outputs.len()
            )));
        };
        self.check_buffer(inputs[0], &self.input, "input")?;
        self.check_buffer(output, &self.output, "output")?;

        let runtime_modes;
        let output_modes: &[i32] = match &self.source {
            PermutationSource::Static(perm) => perm.as_modes(),
            PermutationSource::Runtime(dtype) => {
                runtime_modes = self.read_permutation(ctx, inputs[1], *dtype)?;
                &runtime_modes
            }
        };

        let call = PermutationCall {
            alpha: &self.alpha,
            input: inputs[0],
            input_desc: TensorDescriptor::new(&self.input, self.dtype),
            input_modes: &self.input_modes,
            output,
            output_desc: TensorDescriptor::new(&self.output, self.dtype),
            output_modes,
            compute_type: self.dtype,
        };

        let primitive = ctx.permutation();
        tracing::trace!(
            node = %self.name,
            primitive = primitive.name(),
            modes = ?output_modes,
            "launching permutation"
        );
        primitive.permute(&call, ctx.stream()).map_err(|err| {
            tracing::warn!(node = %self.name, primitive = primitive.name(), error = %err, "permutation failed");
            OpError::from(err)
        })
    }
}

fn build_transpose(node: &dyn GraphNode) -> OpResult<Box<dyn Operator>> {
    Ok(Box::new(TransposeOp::new(node)?))
}

pub(crate) fn register(registry: &OperatorRegistry) {
    registry.register(TRANSPOSE_OP_TYPE, build_transpose);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::PluginConfig;
    use crate::device::Stream;
    use crate::graph::NodeBuilder;
    use crate::primitive::{PermutationPrimitive, PrimitiveError};
    use crate::spec::{Shape, TensorLiteral};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Download(usize),
        Synchronize,
        Permute(Vec<i32>),
    }

    /// Serves a fixed permutation buffer and records calls in order.
    struct StubContext {
        perm_bytes: Vec<u8>,
        events: Mutex<Vec<Event>>,
        status: i32,
        config: PluginConfig,
    }

    impl StubContext {
        fn new(perm_bytes: Vec<u8>) -> Self {
            Self {
                perm_bytes,
                events: Mutex::new(Vec::new()),
                status: 0,
                config: PluginConfig::default(),
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Stream for StubContext {
        fn download(&self, dst: &mut [u8], _src: DevicePtr) -> OpResult<()> {
            dst.copy_from_slice(&self.perm_bytes[..dst.len()]);
            self.events.lock().unwrap().push(Event::Download(dst.len()));
            Ok(())
        }

        fn synchronize(&self) -> OpResult<()> {
            self.events.lock().unwrap().push(Event::Synchronize);
            Ok(())
        }

        fn raw_handle(&self) -> usize {
            0
        }
    }

    impl PermutationPrimitive for StubContext {
        fn name(&self) -> &str {
            "stub"
        }

        fn permute(
            &self,
            call: &PermutationCall<'_>,
            _stream: &dyn Stream,
        ) -> Result<(), PrimitiveError> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Permute(call.output_modes.to_vec()));
            if self.status == 0 {
                Ok(())
            } else {
                Err(PrimitiveError::new(self.status, "stub failure"))
            }
        }
    }

    impl ExecutionContext for StubContext {
        fn stream(&self) -> &dyn Stream {
            self
        }

        fn permutation(&self) -> &dyn PermutationPrimitive {
            self
        }

        fn config(&self) -> &PluginConfig {
            &self.config
        }
    }

    fn f32_spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::from_static(dims))
    }

    fn buffer(dims: &[usize]) -> DevicePtr {
        DevicePtr::new(0x1000, dims.iter().product::<usize>() * 4)
    }

    #[test]
    fn default_permutation_reverses_axes() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 3, 4, 5]))
            .output(f32_spec(&[5, 4, 3, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        assert_eq!(
            op.permutation_source(),
            &PermutationSource::Static(AxisPermutation::reversed(4))
        );
        assert_eq!(op.output_layout().strides(), &[24, 6, 2, 1]);
        assert_eq!(op.describe().inputs.len(), 1);
    }

    #[test]
    fn runtime_permutation_downloads_once_before_permute() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 3]))
            .parameter(TensorSpec::new(DType::Si16, Shape::from_static(&[2])))
            .output(f32_spec(&[3, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        assert_eq!(op.permutation_source(), &PermutationSource::Runtime(DType::Si16));

        let perm = DevicePtr::new(0x2000, 4);
        let ctx = StubContext::new(vec![1, 0, 0, 0]);
        op.execute(&ctx, &[buffer(&[2, 3]), perm], &[buffer(&[3, 2])])
            .unwrap();
        assert_eq!(
            ctx.events(),
            vec![Event::Download(4), Event::Synchronize, Event::Permute(vec![1, 0])]
        );
    }

    #[test]
    fn runtime_permutation_disagreeing_with_output_is_rejected() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 3]))
            .parameter(TensorSpec::new(DType::Ui8, Shape::from_static(&[2])))
            .output(f32_spec(&[3, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        let ctx = StubContext::new(vec![0, 1]);
        let err = op
            .execute(
                &ctx,
                &[buffer(&[2, 3]), DevicePtr::new(0x2000, 2)],
                &[buffer(&[3, 2])],
            )
            .unwrap_err();
        assert!(matches!(err, OpError::InvalidPermutation { .. }), "{err}");
    }

    #[test]
    fn unchecked_runtime_permutation_is_forwarded_verbatim() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 3]))
            .parameter(TensorSpec::new(DType::Ui8, Shape::from_static(&[2])))
            .output(f32_spec(&[3, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        let mut ctx = StubContext::new(vec![0, 0]);
        ctx.config.check_runtime_permutation = false;
        op.execute(
            &ctx,
            &[buffer(&[2, 3]), DevicePtr::new(0x2000, 2)],
            &[buffer(&[3, 2])],
        )
        .unwrap();
        assert_eq!(ctx.events().last(), Some(&Event::Permute(vec![0, 0])));
    }

    #[test]
    fn primitive_status_surfaces_as_failure() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[4]))
            .output(f32_spec(&[4]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        let mut ctx = StubContext::new(Vec::new());
        ctx.status = 7;
        let err = op
            .execute(&ctx, &[buffer(&[4])], &[buffer(&[4])])
            .unwrap_err();
        match err {
            OpError::PrimitiveFailure(inner) => assert_eq!(inner.status, 7),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn execute_rejects_wrong_handle_counts() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 2]))
            .constant(TensorLiteral::from_i64s(DType::Si32, &[1, 0]).unwrap())
            .output(f32_spec(&[2, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        let ctx = StubContext::new(Vec::new());
        let data = buffer(&[2, 2]);
        assert!(matches!(
            op.execute(&ctx, &[data], &[data]),
            Err(OpError::InvalidCall(_))
        ));
        assert!(matches!(
            op.execute(&ctx, &[data, data], &[]),
            Err(OpError::InvalidCall(_))
        ));
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn undersized_output_buffer_is_rejected() {
        let node = NodeBuilder::new(TRANSPOSE_OP_TYPE)
            .parameter(f32_spec(&[2, 3]))
            .output(f32_spec(&[3, 2]))
            .finish();
        let op = TransposeOp::new(&node).unwrap();
        let ctx = StubContext::new(Vec::new());
        let err = op
            .execute(&ctx, &[buffer(&[2, 3])], &[DevicePtr::new(0x3000, 8)])
            .unwrap_err();
        assert!(matches!(err, OpError::InvalidCall(_)));
    }
}
