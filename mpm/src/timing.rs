use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Wall time spent in each phase of a step.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Timings {
    pub injection: Duration,
    pub initialise: Duration,
    pub nodal_kinematics: Duration,
    pub predictor: Duration,
    pub forces: Duration,
    pub linear_solve: Duration,
    pub corrector: Duration,
    pub particle_kinematics: Duration,
    pub stress_strain: Duration,
    pub locate: Duration,
    pub halo: Duration,
    pub load_balance: Duration,
    pub output: Duration,
    pub total: Duration,
}

impl Timings {
    pub fn clear(&mut self) {
        *self = Timings::default();
    }
}

impl AddAssign for Timings {
    fn add_assign(&mut self, rhs: Self) {
        self.injection += rhs.injection;
        self.initialise += rhs.initialise;
        self.nodal_kinematics += rhs.nodal_kinematics;
        self.predictor += rhs.predictor;
        self.forces += rhs.forces;
        self.linear_solve += rhs.linear_solve;
        self.corrector += rhs.corrector;
        self.particle_kinematics += rhs.particle_kinematics;
        self.stress_strain += rhs.stress_strain;
        self.locate += rhs.locate;
        self.halo += rhs.halo;
        self.load_balance += rhs.load_balance;
        self.output += rhs.output;
        self.total += rhs.total;
    }
}

impl Display for Timings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Timings (ms):")?;
        writeln!(f, "  Injection time:             {}", self.injection.as_millis())?;
        writeln!(f, "  Initialise time:            {}", self.initialise.as_millis())?;
        writeln!(
            f,
            "  Nodal kinematics time:      {}",
            self.nodal_kinematics.as_millis()
        )?;
        writeln!(f, "  Predictor time:             {}", self.predictor.as_millis())?;
        writeln!(f, "  Force mapping time:         {}", self.forces.as_millis())?;
        writeln!(
            f,
            "  Linear solve time:          {}",
            self.linear_solve.as_millis()
        )?;
        writeln!(f, "  Corrector time:             {}", self.corrector.as_millis())?;
        writeln!(
            f,
            "  Particle kinematics time:   {}",
            self.particle_kinematics.as_millis()
        )?;
        writeln!(
            f,
            "  Stress/strain time:         {}",
            self.stress_strain.as_millis()
        )?;
        writeln!(f, "  Locate time:                {}", self.locate.as_millis())?;
        writeln!(f, "  Halo transfer time:         {}", self.halo.as_millis())?;
        writeln!(
            f,
            "  Load balance time:          {}",
            self.load_balance.as_millis()
        )?;
        writeln!(f, "  Output time:                {}", self.output.as_millis())?;
        writeln!(f, "  Total:                      {}", self.total.as_millis())
    }
}

/// Adds the time taken by `f` to `duration`.
pub(crate) fn add_time<T>(duration: &mut Duration, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    *duration += Instant::now() - start;
    result
}
