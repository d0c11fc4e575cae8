//! Memlab Runtime
//!
//! Demo binary: profiles a few training steps line by line, then reports
//! which tensors hold device memory and what the steps left behind.

mod workload;

use anyhow::Result;
use memlab_core::{MemReporter, TensorRegistry};
use memlab_env::{readable_size, CachingAllocator, DeviceMemory};
use memlab_metrics::{LineProfiler, ProfiledRoutine};
use memlab_services::Settings;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

const STEPS: usize = 3;
const BATCH: usize = 64;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Memlab v{}", memlab_core::VERSION);
    let settings = Settings::from_env()?;

    let allocator = Rc::new(CachingAllocator::new(1));
    let registry = Rc::new(TensorRegistry::new(Rc::clone(&allocator)));
    let model = workload::build_model(&registry)?;

    let reporter = MemReporter::new(allocator.clone())
        .with_live_objects(registry.clone())
        .with_options(settings.reporter.to_options());
    let before = reporter.collect(Some(&model.root.as_node()));
    println!("{}", reporter.render(&before, settings.reporter.verbose));

    let profiler = LineProfiler::new(allocator.clone())
        .with_config(settings.profiler.to_config()?)?
        .with_sink(Box::new(|report: &str| println!("{report}")));
    let mut routine = ProfiledRoutine::new(profiler, workload::train_step_routine())?;

    let mut outputs = Vec::with_capacity(STEPS);
    for _ in 0..STEPS {
        let logits = routine.call(|probe| workload::train_step(probe, &registry, &model, BATCH))?;
        outputs.push(logits);
    }
    routine.finish()?;

    let after = reporter.collect(Some(&model.root.as_node()));
    println!("{}", reporter.render(&after, settings.reporter.verbose));
    println!("{}", reporter.diff(&before, &after));

    drop(outputs);
    let released = allocator.empty_cache();
    tracing::info!(
        released = %readable_size(released),
        reserved = %readable_size(allocator.reserved_bytes(workload::DEVICE)?),
        "cache emptied"
    );

    Ok(())
}
