use serde_json::{json, Value};
use tw_executor::{Metrics, TrainableRegistry, TrialExecutor};
use tw_tune::*;
use tw_types::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Tunewell basic tuning example");

    // A function trainable: the loss shrinks faster with a larger learning rate.
    let mut registry = TrainableRegistry::new();
    registry.register_fn("quadratic", |config: &Value| {
        let lr = config.get("lr").and_then(Value::as_f64).unwrap_or(0.01);
        (1..=20).map(move |step| {
            let loss = 1.0 / (1.0 + lr * step as f64);
            Metrics::from([("loss".to_string(), loss)])
        })
    });

    let space = SearchSpace::new()
        .add_grid("lr", vec![json!(0.01), json!(0.1), json!(0.5)])
        .add_choice("batch_size", vec![json!(32), json!(64)]);
    let resources = ResourceSpec::cpu_gpu(1.0, 0.0).to_placement_group_factory()?;
    let experiment = Experiment::new("lr_grid", "quadratic", resources)
        .with_search_space(space)
        .with_stop(TRAINING_ITERATION, 10.0);

    let mut search = BasicVariantGenerator::with_seed(42);
    search.add_experiment(experiment)?;
    println!("Generated search over {} variants", search.remaining());

    let cluster = ClusterConfig::new(2.0, 0.0);
    let executor = TrialExecutor::local(
        &cluster,
        ResourceManagerKind::PlacementGroup,
        &RunnerConfig::default(),
        registry,
    )?;
    let mut runner = TrialRunner::new(executor).with_search_alg(Box::new(search));

    let steps = runner.run_until_finished(Some(1_000))?;
    println!("Finished after {steps} steps");

    for summary in runner.summary() {
        println!(
            "  {:<28} {:<10} iterations={:<3} loss={:.4}",
            summary.experiment_tag,
            summary.status.to_string(),
            summary.iterations,
            summary.last_metrics.get("loss").copied().unwrap_or(f64::NAN)
        );
    }
    Ok(())
}
