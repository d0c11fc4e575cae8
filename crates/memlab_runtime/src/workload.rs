//! Demo workload: a small two-layer model and its training step.

use anyhow::Result;
use memlab_core::{DType, Module, Tensor, TensorRegistry};
use memlab_env::DeviceId;
use memlab_metrics::{step, LineProbe, Routine};
use std::rc::Rc;

pub const DEVICE: DeviceId = DeviceId::new(0);

const HIDDEN: usize = 512;
const VOCAB: usize = 1024;

pub struct Model {
    pub root: Rc<Module>,
    /// Trainable parameters, each listed once.
    pub params: Vec<Rc<Tensor>>,
}

/// Embedding and output projection share one weight.
pub fn build_model(registry: &TensorRegistry) -> Result<Model> {
    let model = Module::new();

    let embedding = Module::new();
    let weight = registry.empty(&[VOCAB, HIDDEN], DType::F32, DEVICE)?;
    embedding.register_tensor("weight", Rc::clone(&weight));

    let hidden = Module::new();
    let hidden_weight = registry.empty(&[HIDDEN, HIDDEN], DType::F32, DEVICE)?;
    let hidden_bias = registry.empty(&[HIDDEN], DType::F32, DEVICE)?;
    hidden.register_tensor("weight", Rc::clone(&hidden_weight));
    hidden.register_tensor("bias", Rc::clone(&hidden_bias));

    let decoder = Module::new();
    decoder.register_tensor("weight", Rc::clone(&weight));

    model.register_module("embedding", embedding);
    model.register_module("hidden", hidden);
    model.register_module("decoder", decoder);
    Ok(Model {
        root: model,
        params: vec![weight, hidden_weight, hidden_bias],
    })
}

pub fn train_step_routine() -> Routine {
    Routine::new("train_step", file!(), TRAIN_STEP_FIRST)
        .with_line_count(TRAIN_STEP_LAST - TRAIN_STEP_FIRST)
        .with_source(include_str!("workload.rs"))
}

// Each `step!` shares its line with the statement it measures.
const TRAIN_STEP_FIRST: u32 = line!() + 2;
#[rustfmt::skip]
pub fn train_step(
    probe: &mut LineProbe<'_>,
    registry: &TensorRegistry,
    model: &Model,
    batch: usize,
) -> Result<Rc<Tensor>> {
    step!(probe); let input = registry.empty(&[batch, HIDDEN], DType::F32, DEVICE)?;
    step!(probe); let activations = registry.empty(&[batch, HIDDEN], DType::F32, DEVICE)?;
    step!(probe); let logits = registry.empty(&[batch, VOCAB], DType::F32, DEVICE)?;
    step!(probe); let flat = registry.view(&logits, &[batch * VOCAB]);
    step!(probe); drop(input);
    step!(probe); attach_grads(registry, model)?;
    step!(probe); drop(activations);
    step!(probe); drop(flat);
    step!(probe); Ok(logits)
}
const TRAIN_STEP_LAST: u32 = line!();

/// Give every parameter a gradient of its own shape, once.
fn attach_grads(registry: &TensorRegistry, model: &Model) -> Result<()> {
    for param in &model.params {
        if param.grad_tensor().is_none() {
            param.set_grad(Some(registry.empty(param.shape(), param.dtype(), DEVICE)?));
        }
    }
    Ok(())
}
