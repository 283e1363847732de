pub const COEFFICIENT_COUNT: usize = 6;

/// Conversions are 24 bits wide; anything above is discarded before compensation.
pub const ADC_MASK: u32 = 0x00FF_FFFF;

/// C1..C6 as read from PROM words 1 through 6.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationCoefficients([u16; COEFFICIENT_COUNT]);

impl CalibrationCoefficients {
    pub fn new(words: [u16; COEFFICIENT_COUNT]) -> Self {
        Self(words)
    }

    /// Coefficient `n`, numbered from 1 as in the datasheet.
    pub fn c(&self, n: usize) -> i64 {
        self.0[n - 1] as i64
    }

    pub fn words(&self) -> &[u16; COEFFICIENT_COUNT] {
        &self.0
    }
}

/// Pair of 24-bit conversion results.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: u32,
    pub temperature: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Compensated {
    /// Pascal.
    pub pressure: i64,
    /// Centidegrees Celsius.
    pub temperature: i64,
}

/// First-order temperature compensation of a raw MS56xx conversion pair using the factory PROM
/// coefficients.
///
/// All intermediates are `i64`; right shifts on negative values are arithmetic and round toward
/// negative infinity. Do not replace them with division. Inputs are masked to 24 bits, which
/// keeps every product in range for any coefficient set.
pub fn compensate(raw: RawSample, coeffs: &CalibrationCoefficients) -> Compensated {
    let d_p = (raw.pressure & ADC_MASK) as i64;
    let d_t = (raw.temperature & ADC_MASK) as i64;

    let dt = d_t - (coeffs.c(5) << 8);
    let temperature = 2000 + ((dt * coeffs.c(6)) >> 23);
    let off = (coeffs.c(2) << 17) + ((dt * coeffs.c(4)) >> 6);
    let sens = (coeffs.c(1) << 16) + ((dt * coeffs.c(3)) >> 7);
    let pressure = (((d_p * sens) >> 21) - off) >> 15;

    Compensated {
        pressure,
        temperature,
    }
}
