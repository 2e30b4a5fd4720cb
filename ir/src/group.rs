//! The fused operator group: the scheduler's upstream input.
//!
//! A group is a small DAG of primitive operators. Each operator has a
//! rectangular iteration domain `0 ≤ dᵢ < bounds[i]`, one affine access map
//! per input and one for its output. Dependences name which input slot of a
//! consumer is produced by which other operator of the same group; every
//! input slot without a dependence is an external input.

use std::fmt;

use smallvec::SmallVec;
use snafu::ensure;
use strata_affine::AffineMap;

use crate::error::*;

/// Dense operator id assigned by the tree builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Buffer slot of an operator. Inputs order before the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Input(usize),
    Output,
}

/// Stable key for one logical tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub op: OpId,
    pub slot: Slot,
}

impl BufferId {
    pub fn input(op: OpId, slot: usize) -> Self {
        Self { op, slot: Slot::Input(slot) }
    }

    pub fn output(op: OpId) -> Self {
        Self { op, slot: Slot::Output }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Slot::Input(i) => write!(f, "{}_in{i}", self.op),
            Slot::Output => write!(f, "{}_out", self.op),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ElemType {
    I8,
    I16,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl ElemType {
    pub const fn bytes(self) -> i64 {
        match self {
            Self::I8 => 1,
            Self::I16 | Self::F16 | Self::Bf16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// Operator bodies the scheduler knows how to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Primitive {
    Elementwise,
    Reduce,
    Matmul,
    Conv2d,
    Transpose,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Primitive(Primitive),
    /// Anything the frontend could not classify; rejected when building a tree.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDesc {
    pub name: String,
    pub dims: SmallVec<[String; 4]>,
    pub bounds: SmallVec<[i64; 4]>,
    pub inputs: SmallVec<[AffineMap; 3]>,
    pub output: AffineMap,
    pub body: Body,
    pub elem: ElemType,
}

impl OpDesc {
    /// Operator over `bounds` writing through `output`. Dimensions are named
    /// `d0, d1, ...` and elements are `f32` until overridden.
    pub fn new(name: impl Into<String>, bounds: &[i64], output: AffineMap, body: Body) -> Self {
        Self {
            name: name.into(),
            dims: (0..bounds.len()).map(|d| format!("d{d}")).collect(),
            bounds: SmallVec::from_slice(bounds),
            inputs: SmallVec::new(),
            output,
            body,
            elem: ElemType::F32,
        }
    }

    pub fn with_input(mut self, access: AffineMap) -> Self {
        self.inputs.push(access);
        self
    }

    pub fn with_dims<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.dims = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_elem(mut self, elem: ElemType) -> Self {
        self.elem = elem;
        self
    }

    pub fn num_dims(&self) -> usize {
        self.bounds.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn access(&self, slot: Slot) -> &AffineMap {
        match slot {
            Slot::Input(i) => &self.inputs[i],
            Slot::Output => &self.output,
        }
    }

    /// Input slots in order, then the output.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        (0..self.inputs.len()).map(Slot::Input).chain(std::iter::once(Slot::Output))
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.dims.len() == self.bounds.len(),
            DimNameCountSnafu { op: self.name.clone(), names: self.dims.len(), dims: self.bounds.len() }
        );
        for (dim, &bound) in self.bounds.iter().enumerate() {
            ensure!(bound > 0, NonPositiveBoundSnafu { op: self.name.clone(), dim, bound });
        }
        for (slot, access) in self.inputs.iter().chain(std::iter::once(&self.output)).enumerate() {
            ensure!(
                access.num_dims() == self.bounds.len(),
                AccessAritySnafu { op: self.name.clone(), slot, expected: self.bounds.len(), found: access.num_dims() }
            );
        }
        Ok(())
    }
}

/// `consumer`'s input `slot` is produced by `producer` (indices into [`FusedGroup::ops`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependence {
    pub producer: usize,
    pub consumer: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusedGroup {
    pub ops: Vec<OpDesc>,
    pub deps: Vec<Dependence>,
    /// Ops whose result leaves the group. Empty means every op without a consumer.
    pub outputs: Vec<usize>,
}

impl FusedGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(&mut self, op: OpDesc) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn add_dep(&mut self, producer: usize, consumer: usize, slot: usize) {
        self.deps.push(Dependence { producer, consumer, slot });
    }

    pub fn mark_output(&mut self, op: usize) {
        if !self.outputs.contains(&op) {
            self.outputs.push(op);
        }
    }

    pub fn producer_of(&self, consumer: usize, slot: usize) -> Option<usize> {
        self.deps.iter().find(|d| d.consumer == consumer && d.slot == slot).map(|d| d.producer)
    }

    pub fn consumers_of(&self, producer: usize) -> impl Iterator<Item = &Dependence> + '_ {
        self.deps.iter().filter(move |d| d.producer == producer)
    }

    pub fn is_output(&self, op: usize) -> bool {
        if self.outputs.is_empty() {
            self.consumers_of(op).next().is_none()
        } else {
            self.outputs.contains(&op)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let len = self.ops.len();
        for op in &self.ops {
            op.validate()?;
        }
        for (index, dep) in self.deps.iter().enumerate() {
            for op in [dep.producer, dep.consumer] {
                ensure!(op < len, DependenceOutOfRangeSnafu { index, op, len });
            }
            let consumer = &self.ops[dep.consumer];
            ensure!(dep.producer != dep.consumer, SelfDependenceSnafu { index, op: consumer.name.clone() });
            ensure!(
                dep.slot < consumer.num_inputs(),
                SlotOutOfRangeSnafu { index, op: consumer.name.clone(), slot: dep.slot, inputs: consumer.num_inputs() }
            );
            let fed = self.deps.iter().filter(|d| d.consumer == dep.consumer && d.slot == dep.slot).count();
            ensure!(fed == 1, SlotFedTwiceSnafu { op: consumer.name.clone(), slot: dep.slot });
            let producer = &self.ops[dep.producer];
            let (read, written) = (consumer.inputs[dep.slot].num_results(), producer.output.num_results());
            ensure!(
                read == written,
                RankMismatchSnafu { producer: producer.name.clone(), consumer: consumer.name.clone(), read, written }
            );
        }
        for &index in &self.outputs {
            ensure!(index < len, OutputOutOfRangeSnafu { index, len });
        }
        self.topo_order().map(|_| ())
    }

    /// Producers before consumers: a post-order walk over dependences,
    /// starting from ops in declaration order.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(group: &FusedGroup, op: usize, marks: &mut [Mark], order: &mut Vec<usize>) -> Result<()> {
            match marks[op] {
                Mark::Done => return Ok(()),
                Mark::Active => return DependenceCycleSnafu { op: group.ops[op].name.clone() }.fail(),
                Mark::New => {}
            }
            marks[op] = Mark::Active;
            let mut producers: SmallVec<[(usize, usize); 4]> =
                group.deps.iter().filter(|d| d.consumer == op).map(|d| (d.slot, d.producer)).collect();
            producers.sort_unstable();
            for (_, producer) in producers {
                visit(group, producer, marks, order)?;
            }
            marks[op] = Mark::Done;
            order.push(op);
            Ok(())
        }

        let mut marks = vec![Mark::New; self.ops.len()];
        let mut order = Vec::with_capacity(self.ops.len());
        for op in 0..self.ops.len() {
            visit(self, op, &mut marks, &mut order)?;
        }
        Ok(order)
    }
}
