/// Paced barometer acquisition.
///
/// The sensor converts pressure and temperature alternately; each completed conversion is read,
/// compensated against the PROM coefficients, taken relative to the zero reference and smoothed
/// before it is published as a [`BaroReading`].
use tracing::{debug, trace, warn};

use super::{
    compensate::{compensate, CalibrationCoefficients, Compensated, RawSample, COEFFICIENT_COUNT},
    filter::Butterworth,
    prom_read_command, BusError, SensorBus, ADC_RESULT_LEN, CMD_ADC_READ, CMD_CONVERT_PRESSURE,
    CMD_CONVERT_TEMPERATURE, CMD_RESET, PROM_WORD_LEN, SENSOR_ADDR,
};
use crate::{
    clock::{Micros, MonotonicClock},
    protocol::{MessageType, TelemMsg},
    Error, TNResult,
};

/// Minimum time between bus acquisitions. Longer than the ~9 ms OSR 4096 conversion, and than
/// the sensor's reset reload.
pub const ACQUISITION_PACING: Micros = Micros(15_000);

/// Compensated samples averaged into the zero reference.
pub const ZERO_REFERENCE_SAMPLES: u32 = 50;

/// Conversion currently running on the sensor. Alternates on every successful acquisition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    AwaitingPressure,
    AwaitingTemperature,
}

impl Phase {
    fn next(self) -> Phase {
        match self {
            Phase::AwaitingPressure => Phase::AwaitingTemperature,
            Phase::AwaitingTemperature => Phase::AwaitingPressure,
        }
    }

    fn conversion_command(self) -> u8 {
        match self {
            Phase::AwaitingPressure => CMD_CONVERT_PRESSURE,
            Phase::AwaitingTemperature => CMD_CONVERT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Unstarted,
    /// Reset issued, PROM not read yet.
    Resetting,
    /// First conversion was started without a temperature counterpart; its result is dropped.
    Discarding,
    ZeroReference { taken: u32, sum: i64 },
    Running,
}

/// Filtered barometric output handed to the sender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaroReading {
    /// Filtered pressure, Pa.
    pub value: i64,
    /// Latest compensated temperature, centidegrees C.
    pub temperature: i64,
    /// Time of the acquisition that produced `value`.
    pub timestamp: Micros,
    pub sequence: u32,
}

impl TelemMsg for BaroReading {
    const MSG_TYPE: MessageType = MessageType::Baro;

    fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Acquisition pipeline for one barometer.
///
/// Driven entirely by [`BaroPipeline::step`] from the node's loop: every call compares `now` with
/// the last acquisition and, once [`ACQUISITION_PACING`] has passed, performs one bus cycle.
/// Start-up (reset settle, PROM read, stale first sample, zero reference) runs through the same
/// paced steps, so nothing here ever waits.
pub struct BaroPipeline<B> {
    bus: B,
    stage: Stage,
    phase: Phase,
    coefficients: CalibrationCoefficients,
    raw: RawSample,
    last_acquisition: Micros,
    restart_pending: bool,
    zero_reference: i64,
    filter: Butterworth,
    reading: Option<BaroReading>,
    sequence: u32,
}

impl<B> BaroPipeline<B>
where
    B: SensorBus,
{
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            stage: Stage::Unstarted,
            phase: Phase::AwaitingPressure,
            coefficients: CalibrationCoefficients::default(),
            raw: RawSample::default(),
            last_acquisition: Micros::default(),
            restart_pending: false,
            zero_reference: 0,
            filter: Butterworth::new(),
            reading: None,
            sequence: 0,
        }
    }

    /// Reset the sensor. Calibration and zero reference follow on subsequent steps.
    pub fn begin(&mut self, now: Micros) -> TNResult<()> {
        self.bus.command(SENSOR_ADDR, CMD_RESET)?;
        self.stage = Stage::Resetting;
        self.phase = Phase::AwaitingPressure;
        self.raw = RawSample::default();
        self.restart_pending = false;
        self.reading = None;
        self.last_acquisition = now;
        debug!(now = now.0, "barometer reset");
        Ok(())
    }

    /// Advance the pipeline. Returns the cached reading unless a new acquisition was due, and
    /// `None` until the zero reference has been established.
    ///
    /// A failed bus transaction is returned as [`Error::Bus`]; the phase does not advance and the
    /// same conversion is restarted on the next call.
    pub fn step(&mut self, now: Micros) -> TNResult<Option<BaroReading>> {
        if self.stage == Stage::Unstarted {
            return Err(Error::NotStarted);
        }
        if now.since(self.last_acquisition) < ACQUISITION_PACING {
            return Ok(self.reading);
        }

        if self.stage == Stage::Resetting {
            self.load_calibration()?;
            self.bus.command(SENSOR_ADDR, CMD_CONVERT_PRESSURE)?;
            self.phase = Phase::AwaitingPressure;
            self.stage = Stage::Discarding;
            self.last_acquisition = now;
            return Ok(None);
        }

        if self.restart_pending {
            self.bus.command(SENSOR_ADDR, self.phase.conversion_command())?;
            debug!(phase = ?self.phase, "conversion restarted");
            self.restart_pending = false;
            self.last_acquisition = now;
            return Ok(self.reading);
        }

        let sample = match self.acquire() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(phase = ?self.phase, "acquisition failed: {}", e);
                self.restart_pending = true;
                return Err(e.into());
            }
        };
        self.last_acquisition = now;
        self.absorb(sample, now);
        Ok(self.reading)
    }

    pub fn step_with<C: MonotonicClock + ?Sized>(
        &mut self,
        clock: &C,
    ) -> TNResult<Option<BaroReading>> {
        self.step(clock.now())
    }

    pub fn reading(&self) -> Option<BaroReading> {
        self.reading
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Running
    }

    /// Baseline pressure, once established.
    pub fn zero_reference(&self) -> Option<i64> {
        self.is_ready().then_some(self.zero_reference)
    }

    pub fn coefficients(&self) -> &CalibrationCoefficients {
        &self.coefficients
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn raw(&self) -> RawSample {
        self.raw
    }

    /// Called by the consumer once it has sent the current reading.
    pub fn prepare_next(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        if let Some(reading) = self.reading.as_mut() {
            reading.sequence = self.sequence;
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> B {
        self.bus
    }

    fn load_calibration(&mut self) -> Result<(), BusError> {
        let mut words = [0u16; COEFFICIENT_COUNT];
        for (i, word) in words.iter_mut().enumerate() {
            self.bus.command(SENSOR_ADDR, prom_read_command(i as u8 + 1))?;
            *word = u16::from_be_bytes(self.bus.read_exact::<PROM_WORD_LEN>(SENSOR_ADDR)?);
        }
        self.coefficients = CalibrationCoefficients::new(words);
        debug!(coefficients = ?words, "calibration loaded");
        Ok(())
    }

    /// Read the finished conversion, start the other one, then compensate with the latest pair.
    /// State is only committed once every transaction has succeeded.
    fn acquire(&mut self) -> Result<Compensated, BusError> {
        self.bus.command(SENSOR_ADDR, CMD_ADC_READ)?;
        let [b0, b1, b2] = self.bus.read_exact::<ADC_RESULT_LEN>(SENSOR_ADDR)?;
        let value = u32::from_be_bytes([0, b0, b1, b2]);
        let next = self.phase.next();
        self.bus.command(SENSOR_ADDR, next.conversion_command())?;

        match self.phase {
            Phase::AwaitingPressure => self.raw.pressure = value,
            Phase::AwaitingTemperature => self.raw.temperature = value,
        }
        trace!(phase = ?self.phase, value, "conversion read");
        self.phase = next;
        Ok(compensate(self.raw, &self.coefficients))
    }

    fn absorb(&mut self, sample: Compensated, now: Micros) {
        match self.stage {
            Stage::Discarding => {
                trace!("stale first sample discarded");
                self.stage = Stage::ZeroReference { taken: 0, sum: 0 };
            }
            Stage::ZeroReference { taken, sum } => {
                let taken = taken + 1;
                let sum = sum + sample.pressure;
                if taken < ZERO_REFERENCE_SAMPLES {
                    self.stage = Stage::ZeroReference { taken, sum };
                    return;
                }
                self.zero_reference = sum / ZERO_REFERENCE_SAMPLES as i64;
                // readings are filtered as deviations from the baseline, which start at rest
                self.filter = Butterworth::settled(0.0);
                self.stage = Stage::Running;
                self.publish(self.zero_reference, sample.temperature, now);
                debug!(zero_reference = self.zero_reference, "zero reference established");
            }
            Stage::Running => {
                let delta = (sample.pressure - self.zero_reference) as f64;
                let filtered = self.filter.compute(delta);
                let value = (self.zero_reference as f64 + filtered) as i64;
                self.publish(value, sample.temperature, now);
            }
            Stage::Unstarted | Stage::Resetting => {}
        }
    }

    fn publish(&mut self, value: i64, temperature: i64, now: Micros) {
        self.reading = Some(BaroReading {
            value,
            temperature,
            timestamp: now,
            sequence: self.sequence,
        });
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;
    use crate::{baro::test::ScriptedBus, lazy_init_tracing};

    const PROM: [u16; 6] = [46372, 43981, 29059, 27842, 31553, 28165];
    const RAW_T: u32 = 8_077_636;
    const RAW_P: u32 = 6_465_444;

    /// ADC results for the discarded sample plus the zero reference window: pressure reads on
    /// even acquisitions, linearly increasing, temperature reads on odd ones.
    fn startup_script() -> Vec<u32> {
        (0..=ZERO_REFERENCE_SAMPLES)
            .map(|i| {
                if i % 2 == 0 {
                    RAW_P + 1_000 * (i / 2)
                } else {
                    RAW_T
                }
            })
            .collect()
    }

    /// Pipeline through begin and PROM load, ready for its first acquisition at the returned
    /// time.
    fn started(adc: Vec<u32>) -> (BaroPipeline<ScriptedBus>, Micros) {
        let mut bus = ScriptedBus::new(PROM);
        bus.adc.extend(adc);
        let mut baro = BaroPipeline::new(bus);
        baro.begin(Micros(0)).unwrap();
        assert_eq!(baro.step(ACQUISITION_PACING).unwrap(), None);
        (baro, ACQUISITION_PACING + ACQUISITION_PACING)
    }

    /// Pipeline with zero reference established. Returns the time of the last acquisition.
    fn running(steady_raw_p: u32) -> (BaroPipeline<ScriptedBus>, Micros) {
        let mut script = vec![RAW_P];
        for _ in 0..ZERO_REFERENCE_SAMPLES / 2 {
            script.extend([RAW_T, steady_raw_p]);
        }
        let (mut baro, mut t) = started(script);
        for _ in 0..=ZERO_REFERENCE_SAMPLES {
            baro.step(t).unwrap();
            t = t + ACQUISITION_PACING;
        }
        assert!(baro.is_ready());
        (baro, Micros(t.0 - ACQUISITION_PACING.0))
    }

    #[test]
    fn test_startup_command_sequence() {
        lazy_init_tracing();
        let (baro, _) = started(vec![]);
        assert_eq!(
            baro.bus().commands,
            vec![CMD_RESET, 0xA2, 0xA4, 0xA6, 0xA8, 0xAA, 0xAC, CMD_CONVERT_PRESSURE]
        );
        assert_eq!(baro.coefficients().words(), &PROM);
        assert_eq!(baro.phase(), Phase::AwaitingPressure);
    }

    #[test]
    fn test_prom_waits_for_reset() {
        let mut baro = BaroPipeline::new(ScriptedBus::new(PROM));
        baro.begin(Micros(1_000)).unwrap();
        assert_eq!(baro.step(Micros(15_999)).unwrap(), None);
        assert_eq!(baro.bus().commands, vec![CMD_RESET]);
        assert_eq!(baro.step(Micros(16_000)).unwrap(), None);
        assert_eq!(baro.bus().commands.len(), 8);
    }

    #[test]
    fn test_step_before_begin() {
        let mut baro = BaroPipeline::new(ScriptedBus::new(PROM));
        assert!(matches!(baro.step(Micros(100_000)), Err(Error::NotStarted)));

        baro.bus_mut().fail_writes = 1;
        assert!(matches!(baro.begin(Micros(0)), Err(Error::Bus(_))));
        assert!(matches!(baro.step(Micros(100_000)), Err(Error::NotStarted)));
    }

    #[test]
    fn test_zero_reference_is_truncated_mean() {
        lazy_init_tracing();
        let script = startup_script();
        let coeffs = CalibrationCoefficients::new(PROM);
        let mut raw = RawSample::default();
        let mut sum = 0i64;
        for (i, &value) in script.iter().enumerate() {
            if i % 2 == 0 {
                raw.pressure = value;
            } else {
                raw.temperature = value;
            }
            // first acquisition is stale
            if i > 0 {
                sum += compensate(raw, &coeffs).pressure;
            }
        }
        let expected = sum / 50;

        let (mut baro, mut t) = started(script);
        for i in 0..=ZERO_REFERENCE_SAMPLES {
            let out = baro.step(t).unwrap();
            if i < ZERO_REFERENCE_SAMPLES {
                assert_eq!(out, None, "reading before zero reference at {}", i);
            } else {
                let reading = out.unwrap();
                assert_eq!(reading.value, expected);
                assert_eq!(reading.timestamp, t);
            }
            t = t + ACQUISITION_PACING;
        }
        assert_eq!(baro.zero_reference(), Some(expected));
        assert!(baro.bus().adc.is_empty());
    }

    #[test]
    fn test_pacing() {
        lazy_init_tracing();
        let (mut baro, last) = running(RAW_P);
        baro.bus_mut().adc.extend([RAW_T, RAW_P + 50_000]);
        let cached = baro.reading();
        let before = baro.bus().transactions;

        for dt in [0, 1, 7_500, 14_999] {
            let out = baro.step(last + Micros(dt)).unwrap();
            assert_eq!(out, cached);
            assert_eq!(baro.bus().transactions, before);
        }

        let t = last + ACQUISITION_PACING;
        let out = baro.step(t).unwrap().unwrap();
        assert_eq!(baro.bus().transactions, before + 3);
        assert_eq!(out.timestamp, t);
        assert_eq!(baro.bus().adc.len(), 1);

        // the new cycle re-arms the pacing window
        assert_eq!(baro.step(t + Micros(14_999)).unwrap(), Some(out));
        assert_eq!(baro.bus().transactions, before + 3);
    }

    #[test]
    fn test_phases_alternate() {
        let (mut baro, last) = running(RAW_P);
        // 51 acquisitions since the first pressure conversion
        assert_eq!(baro.phase(), Phase::AwaitingTemperature);
        baro.bus_mut().adc.extend([RAW_T + 10, RAW_P + 20]);
        baro.step(last + ACQUISITION_PACING).unwrap();
        assert_eq!(baro.phase(), Phase::AwaitingPressure);
        assert_eq!(baro.raw().temperature, RAW_T + 10);
        assert_eq!(baro.bus().commands.last(), Some(&CMD_CONVERT_PRESSURE));
        baro.step(last + ACQUISITION_PACING + ACQUISITION_PACING).unwrap();
        assert_eq!(baro.phase(), Phase::AwaitingTemperature);
        assert_eq!(baro.raw().pressure, RAW_P + 20);
        assert_eq!(baro.bus().commands.last(), Some(&CMD_CONVERT_TEMPERATURE));
    }

    #[test]
    fn test_steady_pressure_stays_at_zero_reference() {
        let (mut baro, mut t) = running(RAW_P);
        let zero = baro.zero_reference().unwrap();
        for _ in 0..20 {
            baro.bus_mut().adc.extend([RAW_T, RAW_P]);
        }
        for _ in 0..40 {
            t = t + ACQUISITION_PACING;
            let reading = baro.step(t).unwrap().unwrap();
            assert!((reading.value - zero).abs() <= 1, "{} vs {}", reading.value, zero);
        }
    }

    #[test]
    fn test_pressure_step_is_filtered() {
        let (mut baro, mut t) = running(RAW_P);
        let zero = baro.zero_reference().unwrap();
        let coeffs = CalibrationCoefficients::new(PROM);
        let target = compensate(
            RawSample {
                pressure: RAW_P + 100_000,
                temperature: RAW_T,
            },
            &coeffs,
        )
        .pressure;
        assert!(target > zero + 1_000);

        for _ in 0..20 {
            baro.bus_mut().adc.extend([RAW_T, RAW_P + 100_000]);
        }
        let mut last = zero;
        for _ in 0..40 {
            t = t + ACQUISITION_PACING;
            let reading = baro.step(t).unwrap().unwrap();
            assert!(reading.value >= last);
            assert!(reading.value < target);
            last = reading.value;
        }
        assert!(last > zero);
    }

    #[test]
    fn test_bus_error_retries_same_phase() {
        lazy_init_tracing();
        let (mut baro, last) = running(RAW_P);
        let cached = baro.reading();
        let phase = baro.phase();
        let raw = baro.raw();

        // ADC read command rejected
        baro.bus_mut().fail_writes = 1;
        let t = last + ACQUISITION_PACING;
        assert!(matches!(baro.step(t), Err(Error::Bus(BusError::Transaction(_)))));
        assert_eq!(baro.phase(), phase);
        assert_eq!(baro.raw(), raw);
        assert_eq!(baro.reading(), cached);

        // next call restarts the conversion that was running, without reading
        let t = t + Micros(1);
        assert_eq!(baro.step(t).unwrap(), cached);
        assert_eq!(baro.bus().commands.last(), Some(&phase.conversion_command()));
        assert_eq!(baro.phase(), phase);

        // and the read follows one pacing window later
        baro.bus_mut().adc.push_back(RAW_T + 7);
        assert_eq!(baro.step(t + Micros(14_999)).unwrap(), cached);
        let reading = baro.step(t + ACQUISITION_PACING).unwrap().unwrap();
        assert_eq!(reading.timestamp, t + ACQUISITION_PACING);
        assert_eq!(baro.raw().temperature, RAW_T + 7);
        assert_ne!(baro.phase(), phase);
    }

    #[test]
    fn test_short_read_is_not_data() {
        let (mut baro, last) = running(RAW_P);
        let raw = baro.raw();
        let phase = baro.phase();
        baro.bus_mut().short_reads = 1;
        baro.bus_mut().adc.push_back(0xFF_FFFF);

        let err = baro.step(last + ACQUISITION_PACING).unwrap_err();
        assert!(matches!(
            err,
            Error::Bus(BusError::ShortRead {
                expected: 3,
                got: 2
            })
        ));
        assert_eq!(baro.raw(), raw);
        assert_eq!(baro.phase(), phase);
    }

    #[test]
    fn test_prepare_next_advances_sequence() {
        let (mut baro, last) = running(RAW_P);
        assert_eq!(baro.reading().unwrap().sequence, 0);
        baro.prepare_next();
        assert_eq!(baro.reading().unwrap().sequence, 1);
        assert_eq!(baro.reading().unwrap().msg_type(), MessageType::Baro);

        baro.bus_mut().adc.push_back(RAW_T);
        let reading = baro.step(last + ACQUISITION_PACING).unwrap().unwrap();
        assert_eq!(reading.sequence, 1);
    }

    #[test]
    fn test_step_with_clock() {
        struct ManualClock(Cell<u64>);
        impl MonotonicClock for ManualClock {
            fn now(&self) -> Micros {
                Micros(self.0.get())
            }
        }

        let clock = ManualClock(Cell::new(0));
        let mut baro = BaroPipeline::new(ScriptedBus::new(PROM));
        baro.begin(clock.now()).unwrap();
        clock.0.set(10_000);
        baro.step_with(&clock).unwrap();
        assert_eq!(baro.bus().commands.len(), 1);
        clock.0.set(15_000);
        baro.step_with(&clock).unwrap();
        assert_eq!(baro.bus().commands.len(), 8);
    }
}
