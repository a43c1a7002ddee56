//! Graph node contract consumed by operator constructors.
//!
//! Host frameworks expose their nodes through [`GraphNode`]; [`Node`] is a
//! plain implementation used by tests and by hosts that serialize graphs.

use serde::{Deserialize, Serialize};

use crate::spec::{OpError, OpResult, TensorLiteral, TensorSpec};

/// Identifies what produces the value feeding a node input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Producer {
    /// Compile-time constant with materialized values.
    Constant(TensorLiteral),
    /// Graph parameter bound at inference time.
    Parameter,
    /// Output of another operation.
    Operation { op_type: String },
}

impl Producer {
    pub fn as_constant(&self) -> Option<&TensorLiteral> {
        match self {
            Producer::Constant(literal) => Some(literal),
            Producer::Parameter | Producer::Operation { .. } => None,
        }
    }
}

/// Read-only view of a computation-graph node.
pub trait GraphNode {
    /// Operator tag used for registry lookup (e.g. `"Transpose"`).
    fn op_type(&self) -> &str;

    /// Human-readable node name for diagnostics.
    fn name(&self) -> &str;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn input_spec(&self, index: usize) -> Option<&TensorSpec>;

    fn output_spec(&self, index: usize) -> Option<&TensorSpec>;

    fn input_producer(&self, index: usize) -> Option<&Producer>;

    /// Returns the constant literal feeding `index`, if its producer is a constant.
    fn constant_input(&self, index: usize) -> Option<&TensorLiteral> {
        self.input_producer(index).and_then(Producer::as_constant)
    }
}

/// Single node input: declared tensor type plus producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInput {
    pub spec: TensorSpec,
    pub producer: Producer,
}

/// Owned graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<TensorSpec>,
}

impl Node {
    pub fn to_json_string(&self) -> OpResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| OpError::invalid_graph(format!("node serialization failed: {err}")))
    }

    pub fn from_json_str(src: &str) -> OpResult<Self> {
        serde_json::from_str(src)
            .map_err(|err| OpError::invalid_graph(format!("node deserialization failed: {err}")))
    }
}

impl GraphNode for Node {
    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn input_spec(&self, index: usize) -> Option<&TensorSpec> {
        self.inputs.get(index).map(|input| &input.spec)
    }

    fn output_spec(&self, index: usize) -> Option<&TensorSpec> {
        self.outputs.get(index)
    }

    fn input_producer(&self, index: usize) -> Option<&Producer> {
        self.inputs.get(index).map(|input| &input.producer)
    }
}

/// Lightweight builder for constructing nodes programmatically.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    name: String,
    op_type: String,
    inputs: Vec<NodeInput>,
    outputs: Vec<TensorSpec>,
}

impl NodeBuilder {
    pub fn new(op_type: impl Into<String>) -> Self {
        let op_type = op_type.into();
        Self {
            name: op_type.to_ascii_lowercase(),
            op_type,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn input(mut self, spec: TensorSpec, producer: Producer) -> Self {
        self.inputs.push(NodeInput { spec, producer });
        self
    }

    pub fn parameter(self, spec: TensorSpec) -> Self {
        self.input(spec, Producer::Parameter)
    }

    /// Adds a constant input whose declared spec is taken from the literal.
    pub fn constant(self, literal: TensorLiteral) -> Self {
        let spec = literal.spec.clone();
        self.input(spec, Producer::Constant(literal))
    }

    pub fn computed(self, spec: TensorSpec, op_type: impl Into<String>) -> Self {
        self.input(
            spec,
            Producer::Operation {
                op_type: op_type.into(),
            },
        )
    }

    pub fn output(mut self, spec: TensorSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn finish(self) -> Node {
        Node {
            name: self.name,
            op_type: self.op_type,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DType, Shape};

    #[test]
    fn node_round_trips_through_json() {
        let perm = TensorLiteral::from_i64s(DType::Si64, &[1, 0]).unwrap();
        let node = NodeBuilder::new("Transpose")
            .parameter(TensorSpec::new(DType::F32, Shape::from_static(&[2, 3])))
            .constant(perm.clone())
            .output(TensorSpec::new(DType::F32, Shape::from_static(&[3, 2])))
            .finish();

        let json = node.to_json_string().unwrap();
        let decoded = Node::from_json_str(&json).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.constant_input(1), Some(&perm));
        assert_eq!(decoded.constant_input(0), None);
        assert_eq!(decoded.name(), "transpose");
    }
}
