//! Deterministic kinematic stand-in for the physics collaborator.
//!
//! Not a physics simulation: joints integrate their motor commands within
//! the hinge limits, a knee held below its midpoint counts as a stance leg
//! touching the ground, and backward stance sweep is converted directly
//! into root drift. Good enough to close the sensor-motor loop headlessly.

use slotmap::SlotMap;
use std::collections::HashMap;
use walkerbots_core::{
    BodyKey, JointKey, PhysicsWorld, Vec3, WalkerBodyDescriptor, WalkerBodyHandles,
};

/// Achievable joint speed per unit of motor impulse.
const SPEED_PER_IMPULSE: f32 = 12.0;
/// Root drift gained per radian of backward stance sweep.
const GAIT_GAIN: f32 = 0.08;

#[derive(Debug, Clone, Copy)]
struct Body {
    local: Vec3,
    origin: Vec3,
    slot: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Joint {
    slot: usize,
    index: usize,
    angle: f32,
    lower: f32,
    upper: f32,
    target_velocity: f32,
    max_impulse: f32,
}

#[derive(Debug)]
struct Rig {
    segments: Vec<BodyKey>,
    drift: Vec3,
}

/// Scripted world shared by the runner binary.
pub struct KinematicWorld {
    bodies: SlotMap<BodyKey, Body>,
    joints: SlotMap<JointKey, Joint>,
    rigs: HashMap<usize, Rig>,
    contacts: Vec<(BodyKey, BodyKey)>,
    ground: BodyKey,
}

impl KinematicWorld {
    #[must_use]
    pub fn new() -> Self {
        let mut bodies = SlotMap::with_key();
        let ground = bodies.insert(Body {
            local: Vec3::default(),
            origin: Vec3::default(),
            slot: None,
        });
        Self {
            bodies,
            joints: SlotMap::with_key(),
            rigs: HashMap::new(),
            contacts: Vec::new(),
            ground,
        }
    }

    /// The single static ground body.
    #[must_use]
    pub fn ground(&self) -> BodyKey {
        self.ground
    }

    /// Integrate one frame: chase motor targets, detect stance legs, and
    /// queue their ground contacts for the next pre-step hook.
    pub fn step(&mut self, dt: f32) {
        self.contacts.clear();
        let mut stance: Vec<(usize, usize, f32)> = Vec::new();
        for joint in self.joints.values_mut() {
            let speed_cap = joint.max_impulse * SPEED_PER_IMPULSE;
            let applied = joint.target_velocity.clamp(-speed_cap, speed_cap);
            let previous = joint.angle;
            joint.angle = (joint.angle + applied * dt).clamp(joint.lower, joint.upper);
            // Odd joints are knees; a knee below its midpoint grounds the shin.
            if joint.index % 2 == 1 {
                let midpoint = 0.5 * (joint.lower + joint.upper);
                if joint.angle <= midpoint {
                    stance.push((joint.slot, joint.index, joint.angle - previous));
                }
            }
        }
        for (slot, index, swept) in stance {
            if let Some(rig) = self.rigs.get_mut(&slot) {
                rig.drift.x += GAIT_GAIN * (-swept).max(0.0);
                if let Some(&shin) = rig.segments.get(index + 1) {
                    self.contacts.push((shin, self.ground));
                }
            }
        }
    }

    /// Drain the contact events produced by the last integration.
    pub fn take_contacts(&mut self) -> Vec<(BodyKey, BodyKey)> {
        std::mem::take(&mut self.contacts)
    }
}

impl Default for KinematicWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld for KinematicWorld {
    fn register_walker(
        &mut self,
        slot: usize,
        descriptor: &WalkerBodyDescriptor,
    ) -> WalkerBodyHandles {
        let segments: Vec<BodyKey> = descriptor
            .segments
            .iter()
            .map(|segment| {
                self.bodies.insert(Body {
                    local: segment.local_position,
                    origin: descriptor.origin,
                    slot: Some(slot),
                })
            })
            .collect();
        let joints = descriptor
            .joints
            .iter()
            .map(|joint| {
                self.joints.insert(Joint {
                    slot,
                    index: joint.joint,
                    angle: 0.0,
                    lower: joint.lower_limit,
                    upper: joint.upper_limit,
                    target_velocity: 0.0,
                    max_impulse: 0.0,
                })
            })
            .collect();
        self.rigs.insert(
            slot,
            Rig {
                segments: segments.clone(),
                drift: Vec3::default(),
            },
        );
        WalkerBodyHandles { segments, joints }
    }

    fn unregister_walker(&mut self, handles: &WalkerBodyHandles) {
        if let Some(&first) = handles.segments.first() {
            if let Some(body) = self.bodies.get(first) {
                if let Some(slot) = body.slot {
                    self.rigs.remove(&slot);
                }
            }
        }
        for &body in &handles.segments {
            self.bodies.remove(body);
        }
        for &joint in &handles.joints {
            self.joints.remove(joint);
        }
    }

    fn body_position(&self, body: BodyKey) -> Vec3 {
        let body = self.bodies[body];
        let drift = body
            .slot
            .and_then(|slot| self.rigs.get(&slot))
            .map(|rig| rig.drift)
            .unwrap_or_default();
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
