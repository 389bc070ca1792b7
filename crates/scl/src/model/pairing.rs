//! Slot-for-slot pairing between the online and target stacks.
//!
//! burn modules expose their tensors only through visitor/mapper traversals,
//! which walk fields in declaration order. A [`ParamPairing`] records that
//! traversal once at construction (shape, element kind and dtype of every
//! parameter and running-state buffer), so slot `i` of the online stack is
//! always written into slot `i` of the target stack. Every update re-checks the
//! live structure against the recorded one before touching the target.

use burn::module::{ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::DType;

use crate::error::{Result, SclError};

/// Element family of a tensor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Float,
    Int,
    Bool,
}

/// One tensor visited during a module traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSlot {
    pub shape: Vec<usize>,
    pub kind: ElementKind,
    pub dtype: DType,
}

/// Allowlist of element types eligible for momentum blending.
///
/// Only float slots are ever blended; the policy narrows which float dtypes
/// qualify. A pair is blended only when both its online and target dtypes are
/// accepted. Everything else is left untouched by a momentum update.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendPolicy {
    dtypes: Vec<DType>,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self::new(vec![DType::F64, DType::F32, DType::F16, DType::BF16])
    }
}

impl BlendPolicy {
    pub fn new(dtypes: Vec<DType>) -> Self {
        Self { dtypes }
    }

    pub fn accepts(&self, dtype: DType) -> bool {
        self.dtypes.contains(&dtype)
    }

    pub fn dtypes(&self) -> &[DType] {
        &self.dtypes
    }
}

/// Recorded online/target traversal, validated to match slot for slot.
#[derive(Debug, Clone)]
pub struct ParamPairing {
    online: Vec<TensorSlot>,
    target: Vec<TensorSlot>,
}

impl ParamPairing {
    /// Traverse both modules and pair their slots by position.
    ///
    /// Fails with [`SclError::ShapeMismatch`] if the slot counts differ or any
    /// pair disagrees in shape or element kind.
    pub fn build<B: Backend, Mo: Module<B>>(online: &Mo, target: &Mo) -> Result<Self> {
        let online = collect_slots::<B, Mo>(online);
        let target = collect_slots::<B, Mo>(target);
        check_slots("online/target", &online, &target)?;
        Ok(Self { online, target })
    }

    /// Check that both modules still have the structure recorded at build time.
    pub fn validate<B: Backend, Mo: Module<B>>(&self, online: &Mo, target: &Mo) -> Result<()> {
        check_slots("online", &self.online, &collect_slots::<B, Mo>(online))?;
        check_slots("target", &self.target, &collect_slots::<B, Mo>(target))
    }

    /// Number of paired slots.
    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// `(online, target)` slot pairs in traversal order.
    pub fn pairs(&self) -> impl Iterator<Item = (&TensorSlot, &TensorSlot)> {
        self.online.iter().zip(self.target.iter())
    }
}

fn check_slots(what: &str, expected: &[TensorSlot], actual: &[TensorSlot]) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(SclError::ShapeMismatch(format!(
            "{what}: {} tensor slots vs {}",
            expected.len(),
            actual.len()
        )));
    }
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e.shape != a.shape || e.kind != a.kind {
            return Err(SclError::ShapeMismatch(format!(
                "{what} slot {i}: {:?} {:?} vs {:?} {:?}",
                e.kind, e.shape, a.kind, a.shape
            )));
        }
    }
    Ok(())
}

/// Visitor recording the shape and element type of every tensor.
#[derive(Default)]
struct SlotCollector {
    slots: Vec<TensorSlot>,
}

impl<B: Backend> ModuleVisitor<B> for SlotCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.slots.push(TensorSlot {
            shape: tensor.dims().to_vec(),
            kind: ElementKind::Float,
            dtype: tensor.dtype(),
        });
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D, Int>) {
        self.slots.push(TensorSlot {
            shape: tensor.dims().to_vec(),
            kind: ElementKind::Int,
            dtype: tensor.dtype(),
        });
    }

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D, Bool>) {
        self.slots.push(TensorSlot {
            shape: tensor.dims().to_vec(),
            kind: ElementKind::Bool,
            dtype: tensor.dtype(),
        });
    }
}

fn collect_slots<B: Backend, Mo: Module<B>>(module: &Mo) -> Vec<TensorSlot> {
    let mut collector = SlotCollector::default();
    module.visit(&mut collector);
    collector.slots
}

/// Flattened, detached copy of one slot's value.
#[derive(Debug, Clone)]
pub(crate) enum Captured<B: Backend> {
    Float(Tensor<B, 1>),
    Int(Tensor<B, 1, Int>),
    Bool(Tensor<B, 1, Bool>),
}

struct Snapshot<B: Backend> {
    values: Vec<Captured<B>>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        self.values
            .push(Captured::Float(tensor.clone().detach().reshape([n])));
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D, Int>) {
        let n = tensor.shape().num_elements();
        self.values.push(Captured::Int(tensor.clone().reshape([n])));
    }

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D, Bool>) {
        let n = tensor.shape().num_elements();
        self.values.push(Captured::Bool(tensor.clone().reshape([n])));
    }
}

/// Capture every slot of `module` in traversal order.
pub(crate) fn snapshot<B: Backend, Mo: Module<B>>(module: &Mo) -> Vec<Captured<B>> {
    let mut snapshot = Snapshot { values: Vec::new() };
    module.visit(&mut snapshot);
    snapshot.values
}

/// Largest absolute element-wise difference over all paired float slots.
pub(crate) fn max_abs_difference<B: Backend>(a: &[Captured<B>], b: &[Captured<B>]) -> f64 {
    a.iter()
        .zip(b)
        .filter_map(|pair| match pair {
            (Captured::Float(x), Captured::Float(y)) if x.dims()[0] > 0 => {
                let diff: f64 = (x.clone() - y.clone()).abs().max().into_scalar().elem();
                Some(diff)
            }
            _ => None,
        })
        .fold(0.0, f64::max)
}

/// How captured online values are written into the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WriteRule {
    /// Overwrite every slot, whatever its element type.
    Copy,
    /// `target ← target * momentum + online * (1 - momentum)` on eligible floats.
    Momentum(f64),
}

/// Mapper writing captured online values into the target, slot by slot.
pub(crate) struct TargetWriter<'a, B: Backend> {
    source: Vec<Captured<B>>,
    policy: &'a BlendPolicy,
    rule: WriteRule,
    cursor: usize,
    pub(crate) written: usize,
    pub(crate) skipped: usize,
}

impl<'a, B: Backend> TargetWriter<'a, B> {
    pub(crate) fn new(source: Vec<Captured<B>>, policy: &'a BlendPolicy, rule: WriteRule) -> Self {
        Self {
            source,
            policy,
            rule,
            cursor: 0,
            written: 0,
            skipped: 0,
        }
    }

    fn next_source(&mut self) -> Option<Captured<B>> {
        let value = self.source.get(self.cursor).cloned();
        self.cursor += 1;
        value
    }
}

impl<B: Backend> ModuleMapper<B> for TargetWriter<'_, B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(Captured::Float(online)) = self.next_source() else {
            self.skipped += 1;
            return tensor;
        };
        let online: Tensor<B, D> = online.reshape(tensor.dims());

        match self.rule {
            WriteRule::Copy => {
                self.written += 1;
                online
            }
            WriteRule::Momentum(momentum) => {
                if !(self.policy.accepts(tensor.dtype()) && self.policy.accepts(online.dtype())) {
                    self.skipped += 1;
                    return tensor;
                }
                self.written += 1;
                if momentum == 0.0 {
                    online
                } else {
                    tensor
                        .mul_scalar(momentum)
                        .add(online.mul_scalar(1.0 - momentum))
                        .detach()
                }
            }
        }
    }

    fn map_int<const D: usize>(
        &mut self,
        _id: ParamId,
        tensor: Tensor<B, D, Int>,
    ) -> Tensor<B, D, Int> {
        match (self.next_source(), self.rule) {
            (Some(Captured::Int(online)), WriteRule::Copy) => {
                self.written += 1;
                online.reshape(tensor.dims())
            }
            _ => {
                self.skipped += 1;
                tensor
            }
        }
    }

    fn map_bool<const D: usize>(
        &mut self,
        _id: ParamId,
        tensor: Tensor<B, D, Bool>,
    ) -> Tensor<B, D, Bool> {
        match (self.next_source(), self.rule) {
            (Some(Captured::Bool(online)), WriteRule::Copy) => {
                self.written += 1;
                online.reshape(tensor.dims())
            }
            _ => {
                self.skipped += 1;
                tensor
            }
        }
    }
}
