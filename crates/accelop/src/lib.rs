extern crate self as accelop;

pub use linkme;

pub mod config;
pub mod device;
pub mod graph;
pub mod layout;
pub mod ops;
pub mod primitive;
pub mod registry;
pub mod spec;

pub use config::PluginConfig;
pub use device::{DeviceMemory, DevicePtr, ExecutionContext, Stream};
pub use graph::{GraphNode, Node, NodeBuilder, Producer};
pub use layout::{AxisPermutation, TensorLayout};
pub use ops::{Operator, PermutationSource, StaticLayout, TransposeOp};
pub use primitive::{PermutationCall, PermutationPrimitive, PrimitiveError, Scalar, TensorDescriptor};
pub use registry::{create_operator, has_operator, list_operators, register_operator};
pub use spec::{DType, OpError, OpResult, Shape, TensorLiteral, TensorSpec};
