use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkerbots_core::{WalkerConfig, WalkerLab};

mod kinematic;

use kinematic::KinematicWorld;

/// Hard ceiling on simulation steps so a stalled run cannot spin forever.
const MAX_STEPS: u64 = 10_000_000;

fn main() -> Result<()> {
    init_tracing();

    let target_rounds: u64 = read_env("WALKERBOTS_ROUNDS")?.unwrap_or(5);
    let config = WalkerConfig {
        rng_seed: Some(read_env("WALKERBOTS_SEED")?.unwrap_or(0xBADD_5EED_0123_4567)),
        ..WalkerConfig::default()
    };
    info!(
        population = config.population_size,
        parallel = config.parallel_evaluations,
        rounds = target_rounds,
        "Starting walker evolution run"
    );

    let mut lab = WalkerLab::new(config)?;
    let mut world = KinematicWorld::new();
    lab.tag_ground(world.ground());

    let dt = 1.0 / 60.0;
    let mut completed = 0u64;
    let mut steps = 0u64;
    while completed < target_rounds && steps < MAX_STEPS {
        for (a, b) in world.take_contacts() {
            lab.record_contact(a, b);
        }
        let events = lab.on_step(&mut world, dt);
        for &slot in &events.started {
            debug!(slot, time = lab.simulation_time(), "Evaluation started");
        }
        for report in &events.finished {
            debug!(
                slot = report.slot,
                distance = report.distance,
                time = lab.simulation_time(),
                "Evaluation finished"
            );
        }
        if let Some(summary) = &events.round {
            completed = summary.round;
            info!(
                round = summary.round,
                best = summary.best_distance,
                mean = summary.mean_distance,
                reaped = summary.reaped,
                crossovers = summary.crossovers,
                randomized = summary.randomized,
                "Round complete"
            );
            if summary.determinism_suspect {
                warn!(
                    round = summary.round,
                    "Best fitness regressed despite untouched elites"
                );
            }
        }
        world.step(dt);
        steps += 1;
    }

    if completed < target_rounds {
        warn!(completed, "Step ceiling reached before the requested rounds");
    }

    if let Some(champion) = lab.champion() {
        info!(
            slot = champion.index(),
            distance = champion.distance(),
            best_ever = lab.best_distance(),
            "Champion after final round"
        );
        println!("{}", serde_json::to_string_pretty(champion.genome())?);
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn read_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .parse()
                .with_context(|| format!("failed to parse {name}={value}"))?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {name}")),
    }
}
