//! End-to-end scheduler and evolution tests against a scripted physics
//! backend: bodies sit wherever the test puts them, joints record the last
//! motor command, and nothing integrates on its own.

use slotmap::SlotMap;
use std::collections::HashMap;
use walkerbots_core::{
    BodyKey, BodyOwner, JointKey, PhysicsWorld, Vec3, WalkerBodyDescriptor, WalkerBodyHandles,
    WalkerConfig, WalkerLab,
};

#[derive(Debug, Clone, Copy)]
struct ScriptedBody {
    slot: usize,
    local: Vec3,
    origin: Vec3,
}

#[derive(Debug, Clone, Copy, Default)]
struct ScriptedJoint {
    angle: f32,
    target_velocity: f32,
    max_impulse: f32,
}

const GROUND_SLOT: usize = usize::MAX;

#[derive(Default)]
struct ScriptedWorld {
    bodies: SlotMap<BodyKey, ScriptedBody>,
    joints: SlotMap<JointKey, ScriptedJoint>,
    registered: HashMap<usize, WalkerBodyHandles>,
    drift: HashMap<usize, Vec3>,
}

impl ScriptedWorld {
    fn new() -> Self {
        Self::default()
    }

    fn allocate_ground(&mut self) -> BodyKey {
        self.bodies.insert(ScriptedBody {
            slot: GROUND_SLOT,
            local: Vec3::default(),
            origin: Vec3::default(),
        })
    }

    /// Displace every body of `slot` by `drift` from here on.
    fn set_drift(&mut self, slot: usize, drift: Vec3) {
        self.drift.insert(slot, drift);
    }

    fn segment_key(&self, slot: usize, segment: usize) -> BodyKey {
        self.registered[&slot].segments[segment]
    }

    fn joint_state(&self, slot: usize, joint: usize) -> ScriptedJoint {
        self.joints[self.registered[&slot].joints[joint]]
    }
}

impl PhysicsWorld for ScriptedWorld {
    fn register_walker(
        &mut self,
        slot: usize,
        descriptor: &WalkerBodyDescriptor,
    ) -> WalkerBodyHandles {
        let segments = descriptor
            .segments
            .iter()
            .map(|segment| {
                self.bodies.insert(ScriptedBody {
                    slot,
                    local: segment.local_position,
                    origin: descriptor.origin,
                })
            })
            .collect();
        let joints = descriptor
            .joints
            .iter()
            .map(|_| self.joints.insert(ScriptedJoint::default()))
            .collect();
        let handles = WalkerBodyHandles { segments, joints };
        self.registered.insert(slot, handles.clone());
        handles
    }

    fn unregister_walker(&mut self, handles: &WalkerBodyHandles) {
        for &body in &handles.segments {
            self.bodies.remove(body);
        }
        for &joint in &handles.joints {
            self.joints.remove(joint);
        }
    }

    fn body_position(&self, body: BodyKey) -> Vec3 {
        let body = self.bodies[body];
        let drift = self.drift.get(&body.slot).copied().unwrap_or_default();
        Vec3::new(
            body.origin.x + body.local.x + drift.x,
            body.origin.y + body.local.y + drift.y,
            body.origin.z + body.local.z + drift.z,
        )
    }

    fn joint_angle(&self, joint: JointKey) -> f32 {
        self.joints[joint].angle
    }

    fn set_joint_motor(&mut self, joint: JointKey, target_velocity: f32, max_impulse: f32) {
        let joint = &mut self.joints[joint];
        joint.target_velocity = target_velocity;
        joint.max_impulse = max_impulse;
    }
}

fn test_config(population: usize, parallel: usize) -> WalkerConfig {
    WalkerConfig {
        population_size: population,
        parallel_evaluations: parallel,
        evaluation_duration: 1.0,
        max_step_delta: 1.0,
        rng_seed: Some(0xC0FFEE),
        ..WalkerConfig::default()
    }
}

#[test]
fn first_step_admits_up_to_the_parallel_bound_in_slot_order() {
    let mut lab = WalkerLab::new(test_config(10, 3)).expect("lab");
    let mut world = ScriptedWorld::new();

    let events = lab.on_step(&mut world, 0.5);
    assert_eq!(events.started, vec![0, 1, 2]);
    assert!(events.finished.is_empty());
    assert!(events.round.is_none());
    assert_eq!(lab.evaluations_in_flight(), 3);
    assert!(lab.walker(2).expect("walker").is_evaluating());
    assert!(!lab.walker(3).expect("walker").is_evaluating());
}

#[test]
fn staggered_waves_run_the_whole_population() {
    let mut lab = WalkerLab::new(test_config(4, 2)).expect("lab");
    let mut world = ScriptedWorld::new();

    let step1 = lab.on_step(&mut world, 0.5);
    assert_eq!(step1.started, vec![0, 1]);

    let step2 = lab.on_step(&mut world, 0.5);
    assert!(step2.started.is_empty());
    assert!(step2.finished.is_empty());

    // The first wave crosses the 1.0 s window; the second wave is admitted
    // in the same step, after teardown.
    let step3 = lab.on_step(&mut world, 0.5);
    assert_eq!(
        step3.finished.iter().map(|report| report.slot).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(step3.started, vec![2, 3]);
    assert!(step3.round.is_none());
    assert!(!lab.walker(0).expect("walker").is_evaluating());

    let step4 = lab.on_step(&mut world, 0.5);
    assert!(step4.round.is_none());

    let step5 = lab.on_step(&mut world, 0.5);
    assert_eq!(
        step5.finished.iter().map(|report| report.slot).collect::<Vec<_>>(),
        vec![2, 3]
    );
    let summary = step5.round.expect("round completes");
    assert_eq!(summary.round, 1);
    assert_eq!(lab.evaluations_in_flight(), 0);

    // The clocks were reset, so the next step opens round two.
    let step6 = lab.on_step(&mut world, 0.5);
    assert_eq!(step6.started, vec![0, 1]);
    assert!(step6.round.is_none());
}

#[test]
fn simultaneous_finishes_hand_off_exactly_once() {
    let mut lab = WalkerLab::new(test_config(4, 4)).expect("lab");
    let mut world = ScriptedWorld::new();

    let step1 = lab.on_step(&mut world, 2.0);
    assert_eq!(step1.started, vec![0, 1, 2, 3]);

    // dt is clamped to max_step_delta, so all four cross the window here.
    let step2 = lab.on_step(&mut world, 2.0);
    assert_eq!(step2.finished.len(), 4);
    assert!(step2.round.is_some());

    let step3 = lab.on_step(&mut world, 2.0);
    assert!(step3.round.is_none());
    assert_eq!(step3.started, vec![0, 1, 2, 3]);
}

#[test]
fn round_ranks_reaps_and_sows_with_fixed_quotas() {
    let mut lab = WalkerLab::new(test_config(10, 10)).expect("lab");
    let mut world = ScriptedWorld::new();

    let step1 = lab.on_step(&mut world, 1.0);
    assert_eq!(step1.started.len(), 10);

    // Same weights everywhere: crossover children must reproduce them
    // bit-for-bit no matter which parents are drawn.
    let template = lab.walker(0).expect("walker").genome().clone();
    for slot in 0..10 {
        lab.walker_mut(slot)
            .expect("walker")
            .replace_weights_from(&template);
    }

    // Slot 0 travels farthest, slot 9 the least; ranking equals slot order.
    for slot in 0..10 {
        world.set_drift(slot, Vec3::new((10 - slot) as f32, 0.0, 0.0));
    }

    let step2 = lab.on_step(&mut world, 1.0);
    let summary = step2.round.expect("round completes");

    assert_eq!(summary.round, 1);
    assert_eq!(summary.reaped, 3);
    assert_eq!(summary.crossovers, 2);
    assert_eq!(summary.randomized, 1);
    assert_eq!(summary.mutated, 5);
    assert!(summary.reaped >= summary.crossovers);
    assert!(!summary.determinism_suspect);
    assert!((summary.best_distance - 10.0).abs() < 1e-4);
    assert!((summary.worst_distance - 1.0).abs() < 1e-4);
    assert!((summary.mean_distance - 5.5).abs() < 1e-4);
    assert!((lab.best_distance() - 10.0).abs() < 1e-4);

    let weights = |slot: usize| lab.walker(slot).expect("walker").genome().weights().to_vec();

    // Elites (ranked 0 and 1) and the zero-rate end of the mutation band
    // (ranked 2) are bit-identical.
    assert_eq!(weights(0), template.weights());
    assert_eq!(weights(1), template.weights());
    assert_eq!(weights(2), template.weights());

    // Crossover children (worst-first: ranked 9, then 8) inherit the
    // template exactly since both parents carry it.
    assert_eq!(weights(9), template.weights());
    assert_eq!(weights(8), template.weights());

    // The remaining reaped slot restarts from scratch.
    assert_ne!(weights(7), template.weights());
    assert!(
        weights(7)
            .iter()
            .all(|weight| (-1.0..=1.0).contains(weight))
    );

    // No slot stays marked once sowing is done.
    assert!(lab.walkers().iter().all(|walker| !walker.is_reaped()));
    assert_eq!(lab.walkers().len(), 10);
}

#[test]
fn best_distance_regression_is_flagged_not_fatal() {
    let mut lab = WalkerLab::new(test_config(10, 10)).expect("lab");
    let mut world = ScriptedWorld::new();

    lab.on_step(&mut world, 1.0);
    for slot in 0..10 {
        world.set_drift(slot, Vec3::new((10 - slot) as f32, 0.0, 0.0));
    }
    let first = lab.on_step(&mut world, 1.0).round.expect("round one");
    assert!(!first.determinism_suspect);

    // Round two: everyone regresses, including the untouched elites.
    lab.on_step(&mut world, 1.0);
    for slot in 0..10 {
        world.set_drift(slot, Vec3::new(0.5, 0.0, 0.0));
    }
    let second = lab.on_step(&mut world, 1.0).round.expect("round two");
    assert!(second.determinism_suspect);
    // The high-water mark survives the suspect round.
    assert!((lab.best_distance() - 10.0).abs() < 1e-4);
    assert_eq!(lab.history().count(), 2);
}

#[test]
fn contacts_route_through_owner_tags() {
    let mut lab = WalkerLab::new(test_config(4, 4)).expect("lab");
    let mut world = ScriptedWorld::new();
    lab.on_step(&mut world, 0.25);

    let ground = world.allocate_ground();
    lab.tag_ground(ground);

    let thigh_of_zero = world.segment_key(0, 1);
    let shin_of_one = world.segment_key(1, 2);
    let shin_of_zero = world.segment_key(0, 2);

    assert_eq!(lab.owner_of(ground), Some(BodyOwner::Ground));
    assert_eq!(
        lab.owner_of(thigh_of_zero),
        Some(BodyOwner::Walker { slot: 0, segment: 1 })
    );

    // Ground collides with everything; walkers only with themselves.
    assert!(lab.should_collide(thigh_of_zero, ground));
    assert!(lab.should_collide(thigh_of_zero, shin_of_zero));
    assert!(!lab.should_collide(thigh_of_zero, shin_of_one));

    lab.record_contact(thigh_of_zero, ground);
    assert!(lab.walker(0).expect("walker").touch_sensors()[1]);
    assert!(
        lab.walker(1)
            .expect("walker")
            .touch_sensors()
            .iter()
            .all(|&touching| !touching)
    );
}

#[test]
fn quiet_sensors_steer_joints_to_their_midpoint() {
    let config = WalkerConfig {
        control_frequency: 2.0,
        max_step_delta: 0.5,
        ..test_config(2, 2)
    };
    let motor_strength = config.motor_strength;
    let (lower, upper) = config.body.joint_limits(0);
    let mut lab = WalkerLab::new(config).expect("lab");
    let mut world = ScriptedWorld::new();

    lab.on_step(&mut world, 0.5);
    // Second step accumulates one full control period with no touches.
    lab.on_step(&mut world, 0.5);

    let joint = world.joint_state(0, 0);
    let midpoint = lower + 0.5 * (upper - lower);
    let expected_velocity = midpoint / 0.5;
    assert!((joint.target_velocity - expected_velocity).abs() < 1e-5);
    assert_eq!(joint.max_impulse, motor_strength);
}

#[test]
fn touches_accumulate_until_a_control_tick_consumes_them() {
    let config = WalkerConfig {
        control_frequency: 2.0,
        max_step_delta: 0.25,
        ..test_config(2, 2)
    };
    let mut lab = WalkerLab::new(config).expect("lab");
    let mut world = ScriptedWorld::new();
    lab.on_step(&mut world, 0.25);

    let shin = world.segment_key(0, 2);
    let ground = world.allocate_ground();
    lab.tag_ground(ground);
    lab.record_contact(shin, ground);

    // Quarter period elapsed: the latch must survive a non-firing tick.
    lab.on_step(&mut world, 0.25);
    assert!(lab.walker(0).expect("walker").touch_sensors()[2]);

    // The next step completes the control period and consumes the latch.
    lab.on_step(&mut world, 0.25);
    assert!(
        lab.walker(0)
            .expect("walker")
            .touch_sensors()
            .iter()
            .all(|&touching| !touching)
    );
}

#[test]
fn seeded_labs_evolve_identically() {
    fn run(rounds: usize) -> (Vec<walkerbots_core::RoundSummary>, Vec<Vec<f32>>) {
        let mut lab = WalkerLab::new(test_config(6, 6)).expect("lab");
        let mut world = ScriptedWorld::new();
        let mut completed = 0;
        let mut steps = 0;
        while completed < rounds && steps < 1_000 {
            let events = lab.on_step(&mut world, 0.5);
            for &slot in &events.started {
                world.set_drift(slot, Vec3::new(slot as f32 * 0.1 + 0.1, 0.0, 0.0));
            }
            if events.round.is_some() {
                completed += 1;
            }
            steps += 1;
        }
        assert_eq!(completed, rounds);
        let history = lab.history().cloned().collect();
        let genomes = lab
            .walkers()
            .iter()
            .map(|walker| walker.genome().weights().to_vec())
            .collect();
        (history, genomes)
    }

    let (history_a, genomes_a) = run(3);
    let (history_b, genomes_b) = run(3);
    assert_eq!(history_a, history_b);
    assert_eq!(genomes_a, genomes_b);
}
