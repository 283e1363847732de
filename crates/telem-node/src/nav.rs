/// Navigation messages decoded from the receiver, and the store holding the latest fix for the
/// outbound sender.
use tracing::{debug, trace};

use crate::protocol::{ubx::UbxDecoder, MessageType, TelemMsg};

//  __  __
// |  \/  | ___  ___ ___  __ _  __ _  ___  ___
// | |\/| |/ _ \/ __/ __|/ _` |/ _` |/ _ \/ __|
// | |  | |  __/\__ \__ \ (_| | (_| |  __/\__ \
// |_|  |_|\___||___/___/\__,_|\__, |\___||___/
//                             |___/

/// NAV-POSLLH: geodetic position.
///
/// Angles are degrees * 10^7, heights and accuracies millimeters, `i_tow` GPS time of week in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavPosllh {
    pub i_tow: u32,
    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    pub h_msl: i32,
    pub h_acc: u32,
    pub v_acc: u32,
}

/// NAV-DOP: dilution of precision, scaled by 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavDop {
    pub i_tow: u32,
    pub g_dop: u16,
    pub p_dop: u16,
    pub t_dop: u16,
    pub v_dop: u16,
    pub h_dop: u16,
    pub n_dop: u16,
    pub e_dop: u16,
}

/// NAV-PVT: position, velocity and fix quality in one solution.
///
/// Velocities are NED mm/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavPvt {
    pub i_tow: u32,
    pub fix_type: u8,
    pub num_sv: u8,
    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    pub h_msl: i32,
    pub h_acc: u32,
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    pub s_acc: u32,
}

/// NAV-VELNED: velocity solution. Heading is degrees * 10^5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavVelned {
    pub i_tow: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    pub speed: u32,
    pub g_speed: u32,
    pub heading: i32,
    pub s_acc: u32,
    pub c_acc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationMessage {
    Posllh(NavPosllh),
    Dop(NavDop),
    Pvt(NavPvt),
    Velned(NavVelned),
    /// Valid frame whose id has no decoder. Diagnostics only.
    Unhandled { class: u8, id: u8 },
}

/// Per-variant handlers for decoded messages. Every method defaults to ignoring the message.
pub trait NavHandler {
    fn on_posllh(&mut self, _msg: &NavPosllh) {}
    fn on_dop(&mut self, _msg: &NavDop) {}
    fn on_pvt(&mut self, _msg: &NavPvt) {}
    fn on_velned(&mut self, _msg: &NavVelned) {}
    fn on_unhandled(&mut self, class: u8, id: u8) {
        trace!(class, id, "unhandled message");
    }

    fn dispatch(&mut self, msg: NavigationMessage) {
        match msg {
            NavigationMessage::Posllh(m) => self.on_posllh(&m),
            NavigationMessage::Dop(m) => self.on_dop(&m),
            NavigationMessage::Pvt(m) => self.on_pvt(&m),
            NavigationMessage::Velned(m) => self.on_velned(&m),
            NavigationMessage::Unhandled { class, id } => self.on_unhandled(class, id),
        }
    }
}

//  _____ _        ____  _
// |  ___(_)_  __ / ___|| |_ ___  _ __ ___
// | |_  | \ \/ / \___ \| __/ _ \| '__/ _ \
// |  _| | |>  <   ___) | || (_) | | |  __/
// |_|   |_/_/\_\ |____/ \__\___/|_|  \___|

/// Latitude / longitude / height marker for "no fix yet". Outside any valid range.
pub const UNKNOWN_COORD: i32 = i32::MAX;

/// Accuracy reported before the first fix, in millimeters.
pub const UNKNOWN_ACCURACY: u32 = 500_000;

/// Last PVT solution plus local bookkeeping for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationFix {
    pub fix_type: u8,
    pub num_sv: u8,
    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    pub h_msl: i32,
    pub h_acc: u32,
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    pub s_acc: u32,
    pub sequence: u32,
    pub ready: bool,
}

impl Default for NavigationFix {
    fn default() -> Self {
        Self {
            fix_type: 0,
            num_sv: 0,
            lon: UNKNOWN_COORD,
            lat: UNKNOWN_COORD,
            height: UNKNOWN_COORD,
            h_msl: UNKNOWN_COORD,
            h_acc: UNKNOWN_ACCURACY,
            v_acc: UNKNOWN_ACCURACY,
            vel_n: 0,
            vel_e: 0,
            vel_d: 0,
            s_acc: UNKNOWN_ACCURACY,
            sequence: 0,
            ready: false,
        }
    }
}

impl NavigationFix {
    pub fn has_position(&self) -> bool {
        self.lat != UNKNOWN_COORD && self.lon != UNKNOWN_COORD
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat as f64 / 1e7
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon as f64 / 1e7
    }
}

impl TelemMsg for NavigationFix {
    const MSG_TYPE: MessageType = MessageType::NavFix;

    fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Holds the latest fix. Only PVT dispatch writes the solution; only [`FixStore::prepare_next`]
/// clears `ready`.
#[derive(Debug, Default)]
pub struct FixStore {
    fix: NavigationFix,
}

impl FixStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fix(&mut self, pvt: &NavPvt) {
        let fix = &mut self.fix;
        fix.fix_type = pvt.fix_type;
        fix.num_sv = pvt.num_sv;
        fix.lon = pvt.lon;
        fix.lat = pvt.lat;
        fix.height = pvt.height;
        fix.h_msl = pvt.h_msl;
        fix.h_acc = pvt.h_acc;
        fix.v_acc = pvt.v_acc;
        fix.vel_n = pvt.vel_n;
        fix.vel_e = pvt.vel_e;
        fix.vel_d = pvt.vel_d;
        fix.s_acc = pvt.s_acc;
        fix.ready = true;
        debug!(
            fix_type = fix.fix_type,
            num_sv = fix.num_sv,
            lat = fix.lat,
            lon = fix.lon,
            h_acc = fix.h_acc,
            "fix updated"
        );
    }

    pub fn is_ready(&self) -> bool {
        self.fix.ready
    }

    /// Copy of the current fix. Does not clear `ready`.
    pub fn snapshot(&self) -> NavigationFix {
        self.fix
    }

    /// Called by the consumer once it has sent the current fix.
    pub fn prepare_next(&mut self) {
        self.fix.sequence = self.fix.sequence.wrapping_add(1);
        self.fix.ready = false;
    }
}

impl NavHandler for FixStore {
    fn on_pvt(&mut self, msg: &NavPvt) {
        self.on_fix(msg);
    }
}

/// Receiver side of the navigation link: decoder and fix store driven from the node's loop.
#[derive(Default)]
pub struct NavReceiver {
    decoder: UbxDecoder,
    store: FixStore,
    unhandled: u32,
}

impl NavReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all bytes currently available from the serial port. Returns the number of
    /// messages dispatched.
    pub fn process(&mut self, bytes: &[u8]) -> usize {
        let Self {
            decoder,
            store,
            unhandled,
        } = self;
        let mut sink = ReceiverSink { store, unhandled };
        decoder.drain(bytes, &mut sink)
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub fn snapshot(&self) -> NavigationFix {
        self.store.snapshot()
    }

    pub fn prepare_next(&mut self) {
        self.store.prepare_next();
    }

    /// Valid frames seen with no decoder for their id.
    pub fn unhandled_count(&self) -> u32 {
        self.unhandled
    }
}

struct ReceiverSink<'a> {
    store: &'a mut FixStore,
    unhandled: &'a mut u32,
}

impl NavHandler for ReceiverSink<'_> {
    fn on_pvt(&mut self, msg: &NavPvt) {
        self.store.on_fix(msg);
    }

    fn on_unhandled(&mut self, class: u8, id: u8) {
        trace!(class, id, "unhandled message");
        *self.unhandled = self.unhandled.wrapping_add(1);
    }
}
