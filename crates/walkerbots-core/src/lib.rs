//! Core types for the WalkerBots evolution loop: the walker population,
//! the evaluation scheduler, and the generational reap/sow engine.
//!
//! Physics (rigid bodies, constraints, contacts) lives behind the
//! [`PhysicsWorld`] trait; the core only describes articulations, drives
//! joint motors, and consumes contact events.

use ordered_float::OrderedFloat;
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, new_key_type};
use std::collections::VecDeque;
use std::f32::consts::{FRAC_PI_4, FRAC_PI_8, TAU};
use thiserror::Error;

new_key_type! {
    /// Stable handle for a rigid body registered with the physics backend.
    pub struct BodyKey;
}

new_key_type! {
    /// Stable handle for a hinge joint registered with the physics backend.
    pub struct JointKey;
}

/// Floor applied to the control-tick delta before dividing by it.
pub const MIN_CONTROL_DT: f32 = 1e-4;

/// Axis-aligned world-space vector (y is up).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance to `other`.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Whether every component is finite.
    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Errors raised by lab construction and configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Capsule dimensions for one body segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CapsuleShape {
    pub radius: f32,
    pub length: f32,
}

/// Fixed morphology shared by every walker in a population.
///
/// `segment_count` doubles as the sensor count: every segment carries one
/// touch sensor, and the weight matrix is sized `segment_count x joint_count`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BodyPlan {
    /// Number of legs, placed at uniform angles around the root.
    pub legs: usize,
    pub root_radius: f32,
    pub root_height: f32,
    pub thigh_radius: f32,
    pub thigh_length: f32,
    pub shin_radius: f32,
    pub shin_length: f32,
    /// Hinge limits for hip joints (root to thigh), radians.
    pub hip_limits: (f32, f32),
    /// Hinge limits for knee joints (thigh to shin), radians.
    pub knee_limits: (f32, f32),
}

impl Default for BodyPlan {
    fn default() -> Self {
        Self {
            legs: 6,
            root_radius: 0.25,
            root_height: 0.1,
            thigh_radius: 0.1,
            thigh_length: 0.45,
            shin_radius: 0.08,
            shin_length: 0.75,
            hip_limits: (-0.75 * FRAC_PI_4, FRAC_PI_8),
            knee_limits: (-FRAC_PI_8, 0.2),
        }
    }
}

impl BodyPlan {
    /// Number of body segments: one root plus thigh and shin per leg.
    #[must_use]
    pub const fn segment_count(&self) -> usize {
        2 * self.legs + 1
    }

    /// Number of hinge joints: hip and knee per leg.
    #[must_use]
    pub const fn joint_count(&self) -> usize {
        2 * self.legs
    }

    /// Hinge limits for joint `joint`. Even joints are hips, odd are knees.
    #[must_use]
    pub const fn joint_limits(&self, joint: usize) -> (f32, f32) {
        if joint % 2 == 0 {
            self.hip_limits
        } else {
            self.knee_limits
        }
    }

    /// Ensure the plan describes a buildable articulation.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.legs == 0 {
            return Err(LabError::InvalidConfig("body plan needs at least one leg"));
        }
        if self.root_radius <= 0.0
            || self.root_height <= 0.0
            || self.thigh_radius <= 0.0
            || self.thigh_length <= 0.0
            || self.shin_radius <= 0.0
            || self.shin_length <= 0.0
        {
            return Err(LabError::InvalidConfig(
                "body segment dimensions must be positive",
            ));
        }
        if self.hip_limits.0 >= self.hip_limits.1 || self.knee_limits.0 >= self.knee_limits.1 {
            return Err(LabError::InvalidConfig(
                "joint lower limits must lie below upper limits",
            ));
        }
        Ok(())
    }

    /// Build the articulation descriptor for a walker spawned at `origin`.
    ///
    /// Segment 0 is the root; leg `i` contributes thigh `1 + 2i` and shin
    /// `2 + 2i`, with hip joint `2i` and knee joint `2i + 1`. The root sits
    /// `shin_length` above the ground plane.
    #[must_use]
    pub fn descriptor(&self, origin: Vec3) -> WalkerBodyDescriptor {
        let height = self.shin_length;
        let mut segments = Vec::with_capacity(self.segment_count());
        let mut joints = Vec::with_capacity(self.joint_count());

        segments.push(SegmentDescriptor {
            segment: 0,
            shape: CapsuleShape {
                radius: self.root_radius,
                length: self.root_height,
            },
            local_position: Vec3::new(0.0, height, 0.0),
            mass: 1.0,
        });

        for leg in 0..self.legs {
            let angle = TAU * leg as f32 / self.legs as f32;
            let (ux, uz) = (angle.cos(), angle.sin());
            // Hinge axis is horizontal and perpendicular to the leg direction.
            let axis = Vec3::new(-uz, 0.0, ux);
            let thigh = 1 + 2 * leg;
            let shin = 2 + 2 * leg;
            let thigh_reach = self.root_radius + 0.5 * self.thigh_length;
            let knee_reach = self.root_radius + self.thigh_length;

            segments.push(SegmentDescriptor {
                segment: thigh,
                shape: CapsuleShape {
                    radius: self.thigh_radius,
                    length: self.thigh_length,
                },
                local_position: Vec3::new(ux * thigh_reach, height, uz * thigh_reach),
                mass: 1.0,
            });
            segments.push(SegmentDescriptor {
                segment: shin,
                shape: CapsuleShape {
                    radius: self.shin_radius,
                    length: self.shin_length,
                },
                local_position: Vec3::new(
                    ux * knee_reach,
                    height - 0.5 * self.shin_length,
                    uz * knee_reach,
                ),
                mass: 1.0,
            });

            joints.push(JointDescriptor {
                joint: 2 * leg,
                parent_segment: 0,
                child_segment: thigh,
                anchor: Vec3::new(ux * self.root_radius, height, uz * self.root_radius),
                axis,
                lower_limit: self.hip_limits.0,
                upper_limit: self.hip_limits.1,
            });
            joints.push(JointDescriptor {
                joint: 2 * leg + 1,
                parent_segment: thigh,
                child_segment: shin,
                anchor: Vec3::new(ux * knee_reach, height, uz * knee_reach),
                axis,
                lower_limit: self.knee_limits.0,
                upper_limit: self.knee_limits.1,
            });
        }

        WalkerBodyDescriptor {
            origin,
            segments,
            joints,
        }
    }
}

/// One capsule segment of a walker articulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentDescriptor {
    pub segment: usize,
    pub shape: CapsuleShape,
    /// Center-of-mass position relative to the spawn origin.
    pub local_position: Vec3,
    pub mass: f32,
}

/// One hinge joint of a walker articulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JointDescriptor {
    pub joint: usize,
    pub parent_segment: usize,
    pub child_segment: usize,
    /// Anchor position relative to the spawn origin.
    pub anchor: Vec3,
    /// Hinge axis in world space.
    pub axis: Vec3,
    pub lower_limit: f32,
    pub upper_limit: f32,
}

/// Complete articulation blueprint handed to the physics backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalkerBodyDescriptor {
    pub origin: Vec3,
    pub segments: Vec<SegmentDescriptor>,
    pub joints: Vec<JointDescriptor>,
}

/// Keys returned by the physics backend for one registered walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerBodyHandles {
    /// One body per segment, in segment order.
    pub segments: Vec<BodyKey>,
    /// One hinge per joint, in joint order.
    pub joints: Vec<JointKey>,
}

/// Owner tag stored alongside every registered body.
///
/// Replaces the classic user-pointer trick: collision filtering and contact
/// routing are resolved from this tag, never from identity of the backend's
/// internal objects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BodyOwner {
    /// Static environment; collides with everything, reports no touch.
    Ground,
    /// Body segment `segment` of the walker in population slot `slot`.
    Walker { slot: usize, segment: usize },
}

/// Abstract physics collaborator the core drives.
///
/// Implementations own the rigid bodies and constraints; the core holds only
/// [`BodyKey`]/[`JointKey`] handles. All calls are synchronous and
/// single-threaded: the backend invokes [`WalkerLab::on_step`] once per
/// simulated frame before integrating, after delivering contact events for
/// the frame.
pub trait PhysicsWorld {
    /// Build bodies and constraints for one walker articulation.
    fn register_walker(&mut self, slot: usize, descriptor: &WalkerBodyDescriptor)
    -> WalkerBodyHandles;

    /// Tear down a previously registered articulation.
    fn unregister_walker(&mut self, handles: &WalkerBodyHandles);

    /// Current center-of-mass world position of a body.
    fn body_position(&self, body: BodyKey) -> Vec3;

    /// Current hinge angle in radians.
    fn joint_angle(&self, joint: JointKey) -> f32;

    /// Command a hinge motor: chase `target_velocity` with at most
    /// `max_impulse` per solver step.
    fn set_joint_motor(&mut self, joint: JointKey, target_velocity: f32, max_impulse: f32);
}

/// Static configuration for a walker lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalkerConfig {
    /// Number of population slots; fixed for the lab's lifetime.
    pub population_size: usize,
    /// Soft bound on walkers under concurrent evaluation.
    pub parallel_evaluations: usize,
    /// Seconds each walker spends in evaluation.
    pub evaluation_duration: f32,
    /// Controller update frequency in Hz.
    pub control_frequency: f32,
    /// Upper clamp applied to per-step deltas before clocks advance.
    pub max_step_delta: f32,
    /// Maximum motor impulse handed to the physics backend.
    pub motor_strength: f32,
    /// Fraction of the population replaced each round.
    pub reap_fraction: f32,
    /// Fraction of the population recreated via crossover each round.
    pub crossover_fraction: f32,
    /// Fraction of top-ranked walkers exempt from mutation and replacement.
    pub elite_fraction: f32,
    /// Fraction of the population mutated with the linear rate ramp.
    pub mutation_fraction: f32,
    /// Probability the crossover father is drawn from the elite band.
    pub elite_parent_bias: f32,
    /// Per-weight replacement probability at the bottom of the mutation band.
    pub mutation_rate: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of round summaries retained in memory.
    pub history_capacity: usize,
    /// Shared walker morphology.
    pub body: BodyPlan,
    /// Spawn origin for every evaluation.
    pub start_position: Vec3,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            parallel_evaluations: 10,
            evaluation_duration: 10.0,
            control_frequency: 3.0,
            max_step_delta: 1.0 / 60.0,
            motor_strength: 0.5,
            reap_fraction: 0.3,
            crossover_fraction: 0.2,
            elite_fraction: 0.2,
            mutation_fraction: 0.5,
            elite_parent_bias: 0.8,
            mutation_rate: 0.5,
            rng_seed: None,
            history_capacity: 256,
            body: BodyPlan::default(),
            start_position: Vec3::default(),
        }
    }
}

impl WalkerConfig {
    /// Seconds between controller updates.
    #[must_use]
    pub fn control_period(&self) -> f32 {
        1.0 / self.control_frequency
    }

    /// Validate the configuration, failing fast on malformed values.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.population_size < 2 {
            return Err(LabError::InvalidConfig(
                "population_size must be at least 2",
            ));
        }
        if self.parallel_evaluations == 0 {
            return Err(LabError::InvalidConfig(
                "parallel_evaluations must be positive",
            ));
        }
        if self.evaluation_duration <= 0.0 {
            return Err(LabError::InvalidConfig(
                "evaluation_duration must be positive",
            ));
        }
        if self.control_frequency <= 0.0 {
            return Err(LabError::InvalidConfig(
                "control_frequency must be positive",
            ));
        }
        if self.max_step_delta <= 0.0 {
            return Err(LabError::InvalidConfig("max_step_delta must be positive"));
        }
        if self.motor_strength <= 0.0 {
            return Err(LabError::InvalidConfig("motor_strength must be positive"));
        }
        for (value, name) in [
            (self.reap_fraction, "reap_fraction must lie in [0, 1]"),
            (self.crossover_fraction, "crossover_fraction must lie in [0, 1]"),
            (self.elite_fraction, "elite_fraction must lie in [0, 1]"),
            (self.mutation_fraction, "mutation_fraction must lie in [0, 1]"),
            (self.elite_parent_bias, "elite_parent_bias must lie in [0, 1]"),
            (self.mutation_rate, "mutation_rate must lie in [0, 1]"),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LabError::InvalidConfig(name));
            }
        }
        if self.crossover_fraction > self.reap_fraction {
            return Err(LabError::InvalidConfig(
                "crossover_fraction cannot exceed reap_fraction",
            ));
        }
        let coverage = self.elite_fraction + self.mutation_fraction + self.reap_fraction;
        if (coverage - 1.0).abs() > 1e-3 {
            return Err(LabError::InvalidConfig(
                "elite, mutation, and reap fractions must cover the whole population",
            ));
        }
        if self.history_capacity == 0 {
            return Err(LabError::InvalidConfig("history_capacity must be positive"));
        }
        if !self.start_position.is_finite() {
            return Err(LabError::InvalidConfig("start_position must be finite"));
        }
        self.body.validate()
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Fixed-topology linear sensor-to-motor weight matrix.
///
/// Weights are stored row-major as `weights[sensor * joints + joint]` and
/// sampled uniformly from `[-1, 1]`. The matrix is never resized; evolution
/// only rewrites values in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorMotorGenome {
    sensors: usize,
    joints: usize,
    weights: Vec<f32>,
}

impl SensorMotorGenome {
    /// Construct a randomly initialized matrix.
    #[must_use]
    pub fn random(rng: &mut dyn RngCore, sensors: usize, joints: usize) -> Self {
        let mut genome = Self {
            sensors,
            joints,
            weights: vec![0.0; sensors * joints],
        };
        genome.randomize(rng);
        genome
    }

    /// Overwrite every weight with a fresh uniform sample from `[-1, 1]`.
    pub fn randomize(&mut self, rng: &mut dyn RngCore) {
        for weight in &mut self.weights {
            *weight = rng.random_range(-1.0..1.0);
        }
    }

    /// Per-weight mutation: each weight is replaced by a fresh uniform
    /// sample with probability `rate`.
    pub fn mutate(&mut self, rng: &mut dyn RngCore, rate: f32) {
        for weight in &mut self.weights {
            if rng.random::<f32>() < rate {
                *weight = rng.random_range(-1.0..1.0);
            }
        }
    }

    /// Uniform crossover: every position takes the mother's value on a fair
    /// coin flip, otherwise the father's.
    pub fn crossover_from(&mut self, mother: &Self, father: &Self, rng: &mut dyn RngCore) {
        debug_assert_eq!(self.weights.len(), mother.weights.len());
        debug_assert_eq!(self.weights.len(), father.weights.len());
        for (index, weight) in self.weights.iter_mut().enumerate() {
            *weight = if rng.random::<f32>() >= 0.5 {
                mother.weights[index]
            } else {
                father.weights[index]
            };
        }
    }

    /// Copy all weights from `source`; topologies must match.
    pub fn copy_from(&mut self, source: &Self) {
        debug_assert_eq!(self.sensors, source.sensors);
        debug_assert_eq!(self.joints, source.joints);
        self.weights.copy_from_slice(&source.weights);
    }

    /// Weighted sum of active sensors feeding joint `joint`.
    #[must_use]
    pub fn weighted_sum(&self, sensors: &[bool], joint: usize) -> f32 {
        let mut raw = 0.0;
        for (sensor, &touching) in sensors.iter().enumerate() {
            if touching {
                raw += self.weights[sensor * self.joints + joint];
            }
        }
        raw
    }

    /// Single weight lookup.
    #[must_use]
    pub fn weight(&self, sensor: usize, joint: usize) -> f32 {
        self.weights[sensor * self.joints + joint]
    }

    /// Flat view of the weight matrix.
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Number of sensor rows.
    #[must_use]
    pub const fn sensor_count(&self) -> usize {
        self.sensors
    }

    /// Number of joint columns.
    #[must_use]
    pub const fn joint_count(&self) -> usize {
        self.joints
    }
}

/// Squash a raw weighted sum into the `[0, 1]` joint target range.
fn activation_target(raw: f32) -> f32 {
    (raw.tanh() + 1.0) * 0.5
}

/// Average world position of a set of bodies.
fn segment_centroid(world: &dyn PhysicsWorld, segments: &[BodyKey]) -> Vec3 {
    let mut sum = Vec3::default();
    for &body in segments {
        let position = world.body_position(body);
        sum.x += position.x;
        sum.y += position.y;
        sum.z += position.z;
    }
    let count = segments.len().max(1) as f32;
    Vec3::new(sum.x / count, sum.y / count, sum.z / count)
}

/// Evaluation lifecycle of a population slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum WalkerState {
    #[default]
    Idle,
    Evaluating,
}

/// One population slot: controller weights plus evaluation bookkeeping.
///
/// The slot index is assigned at lab construction and never changes;
/// replacement rewrites the weights and respawns the physical body at the
/// same index.
#[derive(Debug)]
pub struct Walker {
    index: usize,
    genome: SensorMotorGenome,
    touch: Vec<bool>,
    state: WalkerState,
    reaped: bool,
    evaluation_time: f32,
    control_accumulator: f32,
    start_position: Vec3,
    latched_fitness: f32,
    handles: Option<WalkerBodyHandles>,
}

impl Walker {
    fn new(index: usize, rng: &mut dyn RngCore, plan: &BodyPlan) -> Self {
        Self {
            index,
            genome: SensorMotorGenome::random(rng, plan.segment_count(), plan.joint_count()),
            touch: vec![false; plan.segment_count()],
            state: WalkerState::Idle,
            reaped: false,
            evaluation_time: 0.0,
            control_accumulator: 0.0,
            start_position: Vec3::default(),
            latched_fitness: 0.0,
            handles: None,
        }
    }

    /// Spawn the physical articulation and enter evaluation.
    ///
    /// Any stale registration is torn down first, so activation doubles as
    /// the rebuild that makes freshly sown weights take physical effect.
    pub fn activate(
        &mut self,
        world: &mut dyn PhysicsWorld,
        descriptor: &WalkerBodyDescriptor,
    ) -> &WalkerBodyHandles {
        if let Some(stale) = self.handles.take() {
            world.unregister_walker(&stale);
        }
        let handles = world.register_walker(self.index, descriptor);
        self.start_position = segment_centroid(world, &handles.segments);
        self.state = WalkerState::Evaluating;
        self.reaped = false;
        self.evaluation_time = 0.0;
        self.control_accumulator = 0.0;
        self.latched_fitness = 0.0;
        self.touch.fill(false);
        self.handles.insert(handles)
    }

    /// Leave evaluation and release the physical articulation.
    ///
    /// Latches fitness first so it stays queryable until the next
    /// activation. Returns the released handles for owner-map cleanup.
    pub fn deactivate(&mut self, world: &mut dyn PhysicsWorld) -> Option<WalkerBodyHandles> {
        if self.state != WalkerState::Evaluating {
            return None;
        }
        self.state = WalkerState::Idle;
        if let Some(handles) = &self.handles {
            let centroid = segment_centroid(world, &handles.segments);
            self.latched_fitness = centroid.distance_squared(self.start_position);
            world.unregister_walker(handles);
        }
        self.handles.take()
    }

    /// Advance evaluation clocks and fire the controller at the configured
    /// frequency. No-op unless evaluating.
    pub fn tick(&mut self, world: &mut dyn PhysicsWorld, config: &WalkerConfig, dt: f32) {
        if self.state != WalkerState::Evaluating {
            return;
        }
        self.evaluation_time += dt;
        self.control_accumulator += dt;
        if self.control_accumulator >= config.control_period() {
            self.control_accumulator = 0.0;
            self.drive_joints(world, config, dt);
            self.touch.fill(false);
        }
        if let Some(handles) = &self.handles {
            let centroid = segment_centroid(world, &handles.segments);
            self.latched_fitness = centroid.distance_squared(self.start_position);
        }
    }

    /// One controller update: weighted touch sums become joint targets, and
    /// each motor chases its target within the hinge limits.
    fn drive_joints(&self, world: &mut dyn PhysicsWorld, config: &WalkerConfig, dt: f32) {
        let Some(handles) = &self.handles else {
            return;
        };
        let dt = dt.max(MIN_CONTROL_DT);
        for (joint, &key) in handles.joints.iter().enumerate() {
            let raw = self.genome.weighted_sum(&self.touch, joint);
            let target = activation_target(raw);
            let (lower, upper) = config.body.joint_limits(joint);
            let target_angle = lower + target * (upper - lower);
            let current = world.joint_angle(key);
            let desired_velocity = (target_angle - current) / dt;
            world.set_joint_motor(key, desired_velocity, config.motor_strength);
        }
    }

    /// Latch a touch sensor until the next controller update consumes it.
    /// No-op unless evaluating, because contact callbacks may still
    /// reference a walker that left evaluation mid-step.
    pub fn record_touch(&mut self, segment: usize) {
        if self.state != WalkerState::Evaluating {
            return;
        }
        if let Some(sensor) = self.touch.get_mut(segment) {
            *sensor = true;
        }
    }

    /// Overwrite the full weight matrix from `source`.
    pub fn replace_weights_from(&mut self, source: &SensorMotorGenome) {
        self.genome.copy_from(source);
    }

    /// Squared displacement of the segment centroid since activation.
    /// Pure read; stays valid after deactivation until the next activate.
    #[must_use]
    pub const fn fitness(&self) -> f32 {
        self.latched_fitness
    }

    /// Root displacement in world units, for reporting.
    #[must_use]
    pub fn distance(&self) -> f32 {
        self.latched_fitness.sqrt()
    }

    /// Stable population slot of this walker.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current evaluation lifecycle state.
    #[must_use]
    pub const fn state(&self) -> WalkerState {
        self.state
    }

    /// Whether the walker is currently under evaluation.
    #[must_use]
    pub fn is_evaluating(&self) -> bool {
        self.state == WalkerState::Evaluating
    }

    /// Whether the slot is marked for replacement this round.
    #[must_use]
    pub const fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Seconds accumulated in the current evaluation.
    #[must_use]
    pub const fn evaluation_time(&self) -> f32 {
        self.evaluation_time
    }

    /// Start position captured at the last activation.
    #[must_use]
    pub const fn start_position(&self) -> Vec3 {
        self.start_position
    }

    /// Current touch sensor latches.
    #[must_use]
    pub fn touch_sensors(&self) -> &[bool] {
        &self.touch
    }

    /// Controller weight matrix.
    #[must_use]
    pub const fn genome(&self) -> &SensorMotorGenome {
        &self.genome
    }

    fn genome_mut(&mut self) -> &mut SensorMotorGenome {
        &mut self.genome
    }

    fn set_reaped(&mut self, reaped: bool) {
        self.reaped = reaped;
    }

    fn reset_round(&mut self) {
        self.evaluation_time = 0.0;
    }
}

/// Per-slot evaluation result reported when an evaluation window closes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub slot: usize,
    /// Root displacement in world units.
    pub distance: f32,
}

/// Summary emitted when a full generation round completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundSummary {
    /// 1-based count of completed rounds.
    pub round: u64,
    pub best_distance: f32,
    pub mean_distance: f32,
    pub worst_distance: f32,
    /// Slots marked for replacement.
    pub reaped: usize,
    /// Slots refilled via crossover.
    pub crossovers: usize,
    /// Surviving walkers touched by the mutation ramp.
    pub mutated: usize,
    /// Slots re-randomized from scratch.
    pub randomized: usize,
    /// Set when the best distance regressed despite untouched elites.
    pub determinism_suspect: bool,
}

/// Events emitted by one scheduler step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepEvents {
    /// Slots that entered evaluation this step, in activation order.
    pub started: Vec<usize>,
    /// Slots whose evaluation window closed this step.
    pub finished: Vec<EvaluationReport>,
    /// Present when this step completed a generation round.
    pub round: Option<RoundSummary>,
}

/// Walker population plus the evaluation scheduler and evolution engine.
///
/// Owns the slot array exclusively; the physics backend calls
/// [`WalkerLab::record_contact`] during contact resolution and
/// [`WalkerLab::on_step`] once per frame before integrating.
pub struct WalkerLab {
    config: WalkerConfig,
    rng: SmallRng,
    walkers: Vec<Walker>,
    owners: SecondaryMap<BodyKey, BodyOwner>,
    in_flight: usize,
    round: u64,
    simulation_time: f32,
    best_distance: f32,
    history: VecDeque<RoundSummary>,
}

impl WalkerLab {
    /// Validate `config` and build an idle population of random walkers.
    pub fn new(config: WalkerConfig) -> Result<Self, LabError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let walkers = (0..config.population_size)
            .map(|index| Walker::new(index, &mut rng, &config.body))
            .collect();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            rng,
            walkers,
            owners: SecondaryMap::new(),
            in_flight: 0,
            round: 0,
            simulation_time: 0.0,
            best_distance: 0.0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Pre-step hook: advance evaluation clocks, fire controllers, tear
    /// down finished evaluations, admit waiting walkers, and hand a
    /// completed round to the evolution engine.
    pub fn on_step(&mut self, world: &mut dyn PhysicsWorld, dt: f32) -> StepEvents {
        let delta = dt.min(self.config.max_step_delta);
        self.simulation_time += delta;

        let mut events = StepEvents::default();

        // Evaluation time passes for every active walker.
        for slot in 0..self.walkers.len() {
            if !self.walkers[slot].is_evaluating() {
                continue;
            }
            self.walkers[slot].tick(world, &self.config, delta);
            if self.walkers[slot].evaluation_time() >= self.config.evaluation_duration {
                if let Some(handles) = self.walkers[slot].deactivate(world) {
                    self.release_owners(&handles);
                }
                self.in_flight -= 1;
                events.finished.push(EvaluationReport {
                    slot,
                    distance: self.walkers[slot].distance(),
                });
            }
        }

        // Admit walkers that have not run this round, in slot order.
        for slot in 0..self.walkers.len() {
            if self.in_flight >= self.config.parallel_evaluations {
                break;
            }
            let walker = &self.walkers[slot];
            if walker.is_evaluating() || walker.evaluation_time() != 0.0 {
                continue;
            }
            self.activate_slot(slot, world);
            events.started.push(slot);
        }

        // A round ends once every slot has been evaluated and none remain.
        if self.in_flight == 0
            && self
                .walkers
                .iter()
                .all(|walker| walker.evaluation_time() > 0.0)
        {
            events.round = Some(self.complete_round());
        }

        events
    }

    /// Route one contact event into touch sensors via the owner tags.
    pub fn record_contact(&mut self, a: BodyKey, b: BodyKey) {
        self.touch_from_contact(a);
        self.touch_from_contact(b);
    }

    /// Broad-phase filter rule: ground pairs always collide, walker pairs
    /// only within the same slot.
    #[must_use]
    pub fn should_collide(&self, a: BodyKey, b: BodyKey) -> bool {
        match (self.owners.get(a), self.owners.get(b)) {
            (
                Some(BodyOwner::Walker { slot: slot_a, .. }),
                Some(BodyOwner::Walker { slot: slot_b, .. }),
            ) => slot_a == slot_b,
            _ => true,
        }
    }

    /// Tag a backend-owned static body as ground.
    pub fn tag_ground(&mut self, body: BodyKey) {
        self.owners.insert(body, BodyOwner::Ground);
    }

    /// Owner tag for a registered body, if any.
    #[must_use]
    pub fn owner_of(&self, body: BodyKey) -> Option<BodyOwner> {
        self.owners.get(body).copied()
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub const fn config(&self) -> &WalkerConfig {
        &self.config
    }

    /// The full population in slot order.
    #[must_use]
    pub fn walkers(&self) -> &[Walker] {
        &self.walkers
    }

    /// One walker by slot index.
    #[must_use]
    pub fn walker(&self, slot: usize) -> Option<&Walker> {
        self.walkers.get(slot)
    }

    /// Mutable access to one walker (for weight injection and inspection).
    #[must_use]
    pub fn walker_mut(&mut self, slot: usize) -> Option<&mut Walker> {
        self.walkers.get_mut(slot)
    }

    /// Best walker of the current population by latched fitness.
    #[must_use]
    pub fn champion(&self) -> Option<&Walker> {
        self.walkers.iter().max_by(|a, b| {
            OrderedFloat(a.fitness())
                .cmp(&OrderedFloat(b.fitness()))
                .then(b.index().cmp(&a.index()))
        })
    }

    /// Number of walkers currently under evaluation.
    #[must_use]
    pub const fn evaluations_in_flight(&self) -> usize {
        self.in_flight
    }

    /// 1-based count of completed rounds.
    #[must_use]
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// Accumulated (clamped) simulation time in seconds.
    #[must_use]
    pub const fn simulation_time(&self) -> f32 {
        self.simulation_time
    }

    /// Best root displacement seen across all completed rounds.
    #[must_use]
    pub const fn best_distance(&self) -> f32 {
        self.best_distance
    }

    /// Iterate over retained round summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RoundSummary> {
        self.history.iter()
    }

    fn activate_slot(&mut self, slot: usize, world: &mut dyn PhysicsWorld) {
        let descriptor = self.config.body.descriptor(self.config.start_position);
        let handles = self.walkers[slot].activate(world, &descriptor);
        for (segment, &body) in handles.segments.iter().enumerate() {
            self.owners.insert(body, BodyOwner::Walker { slot, segment });
        }
        self.in_flight += 1;
    }

    fn release_owners(&mut self, handles: &WalkerBodyHandles) {
        for &body in &handles.segments {
            self.owners.remove(body);
        }
    }

    fn touch_from_contact(&mut self, body: BodyKey) {
        if let Some(&BodyOwner::Walker { slot, segment }) = self.owners.get(body) {
            self.walkers[slot].record_touch(segment);
        }
    }

    /// Rank, reap, and sow exactly once, then reset every evaluation clock
    /// for the next round.
    fn complete_round(&mut self) -> RoundSummary {
        self.round += 1;
        let ranked = self.rank();
        let count = self.walkers.len();

        let best = self.walkers[ranked[0]].distance();
        let worst = self.walkers[ranked[count - 1]].distance();
        let mean = self
            .walkers
            .iter()
            .map(Walker::distance)
            .sum::<f32>()
            / count as f32;

        // Elites are never mutated, so the best distance should never
        // regress while any survive; a regression points at the backend.
        let keeps_survivors =
            (count as f32 - 1.0) * (1.0 - self.config.reap_fraction) != 0.0;
        let determinism_suspect = keeps_survivors && best < self.best_distance;
        if !determinism_suspect {
            self.best_distance = best;
        }

        let reaped = self.reap(&ranked);
        let (crossovers, mutated, randomized) = self.sow(&ranked);

        for walker in &mut self.walkers {
            walker.reset_round();
        }

        let summary = RoundSummary {
            round: self.round,
            best_distance: best,
            mean_distance: mean,
            worst_distance: worst,
            reaped,
            crossovers,
            mutated,
            randomized,
            determinism_suspect,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    /// Slot indices sorted by fitness descending, slot index ascending on
    /// ties. The explicit tie-break keeps ranking deterministic between
    /// runs with fixed seeds.
    fn rank(&self) -> Vec<usize> {
        let mut ranked: Vec<usize> = (0..self.walkers.len()).collect();
        ranked.sort_by(|&a, &b| {
            OrderedFloat(self.walkers[b].fitness())
                .cmp(&OrderedFloat(self.walkers[a].fitness()))
                .then_with(|| a.cmp(&b))
        });
        ranked
    }

    /// Mark the worst-ranked fraction for replacement.
    fn reap(&mut self, ranked: &[usize]) -> usize {
        let count = ranked.len();
        let cutoff = (count as f32 - 1.0) * (1.0 - self.config.reap_fraction);
        let mut reaped = 0;
        for position in (0..count).rev() {
            if (position as f32) < cutoff {
                break;
            }
            self.walkers[ranked[position]].set_reaped(true);
            reaped += 1;
        }
        reaped
    }

    /// Refill reaped slots worst-first: crossover children up to the quota,
    /// then fresh random matrices for whatever remains. Surviving mid-band
    /// walkers get the linear mutation ramp. Elites are untouched.
    fn sow(&mut self, ranked: &[usize]) -> (usize, usize, usize) {
        let count = ranked.len();
        let count_f = count as f32;
        let mut cursor = 0usize;

        let crossover_quota = (count_f * self.config.crossover_fraction).floor() as usize;
        let mut crossovers = 0;
        for _ in 0..crossover_quota {
            let Some(slot) = next_reaped(&self.walkers, ranked, &mut cursor) else {
                break;
            };
            let mother = self.random_elite(ranked);
            let father = if self.rng.random::<f32>() < self.config.elite_parent_bias {
                self.random_elite(ranked)
            } else {
                self.random_non_elite(ranked)
            };
            let mother_genome = self.walkers[mother].genome().clone();
            let father_genome = self.walkers[father].genome().clone();
            self.walkers[slot].genome_mut().crossover_from(
                &mother_genome,
                &father_genome,
                &mut self.rng,
            );
            self.walkers[slot].set_reaped(false);
            crossovers += 1;
        }

        let band_floor = count_f * self.config.elite_fraction;
        let band_start = band_floor as usize;
        let band_end = count_f * (self.config.elite_fraction + self.config.mutation_fraction);
        let band_len = count_f * self.config.mutation_fraction;
        let mut mutated = 0;
        for position in band_start..count {
            if (position as f32) >= band_end {
                break;
            }
            let slot = ranked[position];
            if self.walkers[slot].is_reaped() {
                continue;
            }
            let offset = position as f32 - band_floor;
            let rate = if band_len > 0.0 {
                (self.config.mutation_rate * offset / band_len).max(0.0)
            } else {
                0.0
            };
            self.walkers[slot].genome_mut().mutate(&mut self.rng, rate);
            mutated += 1;
        }

        let mut randomized = 0;
        while let Some(slot) = next_reaped(&self.walkers, ranked, &mut cursor) {
            self.walkers[slot].genome_mut().randomize(&mut self.rng);
            self.walkers[slot].set_reaped(false);
            randomized += 1;
        }

        (crossovers, mutated, randomized)
    }

    /// Uniform draw from the elite band of the ranking.
    fn random_elite(&mut self, ranked: &[usize]) -> usize {
        let count = ranked.len() as f32;
        let position =
            ((count - 1.0) * self.config.elite_fraction * self.rng.random::<f32>()) as usize;
        ranked[position]
    }

    /// Uniform draw from the non-elite remainder of the ranking.
    fn random_non_elite(&mut self, ranked: &[usize]) -> usize {
        let count = ranked.len() as f32;
        let position = ((count - 1.0) * self.config.elite_fraction
            + (count - 1.0) * (1.0 - self.config.elite_fraction) * self.rng.random::<f32>())
            as usize;
        ranked[position]
    }
}

/// Worst-first scan over reaped slots; `cursor` persists across the
/// crossover and re-randomize passes so each slot is handed out once.
fn next_reaped(walkers: &[Walker], ranked: &[usize], cursor: &mut usize) -> Option<usize> {
    while *cursor < ranked.len() {
        let slot = ranked[ranked.len() - 1 - *cursor];
        *cursor += 1;
        if walkers[slot].is_reaped() {
            return Some(slot);
        }
    }
    None
}
