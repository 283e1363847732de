const GAIN: f64 = 6.607_790_982_303_962_668e-4;
const A2: f64 = -0.928_627_086_124_807_266_11;
const A1: f64 = 1.925_983_969_731_885_681_04;

/// Second order low-pass Butterworth, sampled at 60 Hz with a 0.5 Hz cutoff.
///
/// Direct form II: each step shifts the intermediate state, computes a new value from the input
/// and the two previous ones, and returns `v0 + 2 v1 + v2`. DC gain is 1.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Butterworth {
    v: [f64; 3],
}

impl Butterworth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter already at rest on a constant `input`, so the first output carries no transient.
    pub fn settled(input: f64) -> Self {
        let v = GAIN * input / (1.0 - A1 - A2);
        Self { v: [v; 3] }
    }

    pub fn compute(&mut self, x: f64) -> f64 {
        self.v[0] = self.v[1];
        self.v[1] = self.v[2];
        self.v[2] = GAIN * x + A2 * self.v[0] + A1 * self.v[1];
        self.v[0] + 2.0 * self.v[1] + self.v[2]
    }
}
