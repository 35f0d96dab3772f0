use crate::params::Damping;
use crate::{Vector, MASS_TOLERANCE};

/// A background grid node.
///
/// All kinematic fields are per-step accumulators: they are zeroed by [`Node::initialise`] and
/// carry no meaning outside of a single step.
#[derive(Clone, Debug, PartialEq)]
pub struct Node<const D: usize> {
    pub id: usize,
    pub position: Vector<D>,
    pub mass: f64,
    pub momentum: Vector<D>,
    pub internal_force: Vector<D>,
    pub external_force: Vector<D>,
    pub velocity: Vector<D>,
    /// Velocity mapped from particles at the start of the step.
    pub mapped_velocity: Vector<D>,
    pub acceleration: Vector<D>,
    /// Displacement increment over the current step.
    pub displacement: Vector<D>,
    /// Materials of particles contributing to this node during the current step.
    pub materials: Vec<usize>,
    /// Prescribed velocity components as `(direction, velocity)` pairs.
    pub velocity_constraints: Vec<(usize, f64)>,
}

impl<const D: usize> Node<D> {
    pub fn new(id: usize, position: Vector<D>) -> Self {
        Node {
            id,
            position,
            mass: 0.0,
            momentum: Vector::zeros(),
            internal_force: Vector::zeros(),
            external_force: Vector::zeros(),
            velocity: Vector::zeros(),
            mapped_velocity: Vector::zeros(),
            acceleration: Vector::zeros(),
            displacement: Vector::zeros(),
            materials: Vec::new(),
            velocity_constraints: Vec::new(),
        }
    }

    /// Resets all per-step accumulators. Velocity constraints are kept.
    pub fn initialise(&mut self) {
        self.mass = 0.0;
        self.momentum = Vector::zeros();
        self.internal_force = Vector::zeros();
        self.external_force = Vector::zeros();
        self.velocity = Vector::zeros();
        self.mapped_velocity = Vector::zeros();
        self.acceleration = Vector::zeros();
        self.displacement = Vector::zeros();
        self.materials.clear();
    }

    pub fn is_active(&self) -> bool {
        self.mass > MASS_TOLERANCE
    }

    pub fn total_force(&self) -> Vector<D> {
        self.internal_force + self.external_force
    }

    pub fn add_material(&mut self, material_id: usize) {
        if !self.materials.contains(&material_id) {
            self.materials.push(material_id);
        }
    }

    /// Derives velocity and acceleration from the accumulated momentum and mass weighted
    /// acceleration.
    ///
    /// A node with mass below [`MASS_TOLERANCE`] is assigned zero velocity and acceleration.
    pub fn compute_velocity(&mut self) {
        if self.is_active() {
            self.velocity = self.momentum / self.mass;
            self.acceleration /= self.mass;
        } else {
            self.velocity = Vector::zeros();
            self.acceleration = Vector::zeros();
        }
        self.apply_velocity_constraints();
        self.mapped_velocity = self.velocity;
    }

    pub fn apply_velocity_constraints(&mut self) {
        for &(dir, v) in self.velocity_constraints.iter() {
            self.velocity[dir] = v;
            self.acceleration[dir] = 0.0;
        }
    }

    pub fn is_constrained(&self, dir: usize) -> bool {
        self.velocity_constraints.iter().any(|&(d, _)| d == dir)
    }

    /// Applies the damping model to an unbalanced nodal force.
    pub fn damped_force(&self, force: Vector<D>, damping: Damping) -> Vector<D> {
        match damping {
            Damping::None => force,
            Damping::Cundall(factor) => {
                let mut damped = force;
                for i in 0..D {
                    let sign = if self.velocity[i] > 0.0 {
                        1.0
                    } else if self.velocity[i] < 0.0 {
                        -1.0
                    } else {
                        0.0
                    };
                    damped[i] -= factor * force[i].abs() * sign;
                }
                damped
            }
        }
    }

    /// Newmark predictor.
    ///
    /// Computes the trial displacement and velocity from the current velocity and acceleration.
    /// The trial acceleration at the end of the step is zero.
    pub fn predict_newmark(&mut self, dt: f64, beta: f64, gamma: f64) {
        if !self.is_active() {
            return;
        }
        self.displacement = self.velocity * dt + self.acceleration * (dt * dt * (0.5 - beta));
        self.velocity += self.acceleration * ((1.0 - gamma) * dt);
        self.acceleration = Vector::zeros();
        self.apply_velocity_constraints();
    }

    /// Newmark corrector given a displacement correction.
    pub fn correct_newmark(&mut self, correction: &Vector<D>, dt: f64, beta: f64, gamma: f64) {
        if !self.is_active() {
            return;
        }
        self.displacement += correction;
        self.acceleration = correction / (beta * dt * dt);
        self.velocity += self.acceleration * (gamma * dt);
        self.apply_velocity_constraints();
    }

    /// Explicit update of acceleration, velocity and the displacement increment.
    ///
    /// The displacement uses the `gamma` weighted average of the velocities at the start and end
    /// of the step.
    pub fn update_explicit(&mut self, dt: f64, gamma: f64, damping: Damping) {
        if !self.is_active() {
            self.acceleration = Vector::zeros();
            self.velocity = Vector::zeros();
            self.displacement = Vector::zeros();
            return;
        }
        let force = self.damped_force(self.total_force(), damping);
        self.acceleration = force / self.mass;
        self.velocity += self.acceleration * dt;
        self.apply_velocity_constraints();
        self.displacement = (self.velocity - self.acceleration * ((1.0 - gamma) * dt)) * dt;
    }
}
