/// UBX binary protocol framing.
///
/// A frame is a two byte preamble, class, id, little-endian payload length, payload and two
/// checksum bytes. The checksum is an 8-bit Fletcher sum over class, id, length and payload:
///
/// ```text
///  B5 62 | class | id | len_lo len_hi | payload[len] | ck_a ck_b
/// ```
///
/// The receiver output is an unframed byte stream, so [`UbxDecoder`] must find frame boundaries
/// on its own and recover from any byte offset.
use nom::{
    bytes::complete::take,
    number::complete::{le_i32, le_u16, le_u32, le_u8},
    Finish, IResult,
};
use tracing::{debug, trace, warn};

use crate::{
    nav::{NavDop, NavHandler, NavPosllh, NavPvt, NavVelned, NavigationMessage},
    Error, TNResult,
};

pub const SYNC1: u8 = 0xB5;
pub const SYNC2: u8 = 0x62;

/// Largest payload the decoder will buffer. Frames declaring more are rejected.
pub const PAYLOAD_CAPACITY: usize = 1000;

pub const CLASS_NAV: u8 = 0x01;

pub const NAV_POSLLH: u8 = 0x02;
pub const NAV_DOP: u8 = 0x04;
pub const NAV_PVT: u8 = 0x07;
pub const NAV_VELNED: u8 = 0x12;

/// Bytes outside the payload: preamble(2) + class + id + length(2) + checksum(2).
pub const FRAME_OVERHEAD: usize = 8;

/// One frame as received, with the running checksum computed over it so far.
#[derive(Debug, Default, Clone)]
pub struct Envelope {
    pub class: u8,
    pub id: u8,
    pub len: u16,
    pub payload: heapless::Vec<u8, PAYLOAD_CAPACITY>,
    pub ck_a: u8,
    pub ck_b: u8,
}

impl Envelope {
    fn start(&mut self) {
        self.class = 0;
        self.id = 0;
        self.len = 0;
        self.payload.clear();
        self.ck_a = 0;
        self.ck_b = 0;
    }

    fn add_chk(&mut self, byte: u8) {
        self.ck_a = self.ck_a.wrapping_add(byte);
        self.ck_b = self.ck_b.wrapping_add(self.ck_a);
    }

    fn payload_complete(&self) -> bool {
        self.payload.len() == self.len as usize
    }
}

/// Decoder states, each named after the last element received.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Sync1,
    Sync2,
    GotClass,
    GotId,
    GotLen1,
    /// Length known, collecting payload bytes.
    GotLen2,
    /// Payload complete, expecting `ck_a`.
    Payload,
    GotChkA,
}

/// Streaming UBX decoder, fed one byte at a time.
///
/// The preamble only starts a frame from `Idle` (or as the byte that aborted one), so a `B5`
/// inside a header or payload is taken as data. A stream that lost bytes mid-payload therefore
/// consumes the start of the next frame as payload until the checksum fails.
pub struct UbxDecoder {
    state: DecoderState,
    envelope: Envelope,
}

impl UbxDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
            envelope: Envelope::default(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Frame currently being assembled.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Consume one byte. Returns a message the instant a frame's checksum validates.
    pub fn push(&mut self, byte: u8) -> Option<NavigationMessage> {
        match self.state {
            DecoderState::Idle => {
                if byte == SYNC1 {
                    self.state = DecoderState::Sync1;
                }
            }
            DecoderState::Sync1 => {
                if byte == SYNC2 {
                    self.envelope.start();
                    self.state = DecoderState::Sync2;
                } else {
                    self.reject(byte, "preamble");
                }
            }
            DecoderState::Sync2 => {
                self.envelope.class = byte;
                self.envelope.add_chk(byte);
                self.state = DecoderState::GotClass;
            }
            DecoderState::GotClass => {
                self.envelope.id = byte;
                self.envelope.add_chk(byte);
                self.state = DecoderState::GotId;
            }
            DecoderState::GotId => {
                self.envelope.len = byte as u16;
                self.envelope.add_chk(byte);
                self.state = DecoderState::GotLen1;
            }
            DecoderState::GotLen1 => {
                self.envelope.len |= (byte as u16) << 8;
                self.envelope.add_chk(byte);
                if self.envelope.len as usize > PAYLOAD_CAPACITY {
                    debug!(
                        class = self.envelope.class,
                        id = self.envelope.id,
                        len = self.envelope.len,
                        "declared length exceeds payload capacity"
                    );
                    self.state = DecoderState::Idle;
                } else if self.envelope.len == 0 {
                    self.state = DecoderState::Payload;
                } else {
                    self.state = DecoderState::GotLen2;
                }
            }
            DecoderState::GotLen2 => {
                self.envelope.add_chk(byte);
                if self.envelope.payload.push(byte).is_err() {
                    // only reachable if the length check above is bypassed
                    self.reject(byte, "payload overflow");
                } else if self.envelope.payload_complete() {
                    self.state = DecoderState::Payload;
                }
            }
            DecoderState::Payload => {
                if byte == self.envelope.ck_a {
                    self.state = DecoderState::GotChkA;
                } else {
                    self.reject(byte, "ck_a");
                }
            }
            DecoderState::GotChkA => {
                if byte == self.envelope.ck_b {
                    self.state = DecoderState::Idle;
                    return decode(&self.envelope);
                }
                self.reject(byte, "ck_b");
            }
        }
        None
    }

    /// Feed every available byte in arrival order, handing each validated message to `handler`
    /// before the next byte is consumed.
    pub fn drain<H: NavHandler + ?Sized>(&mut self, bytes: &[u8], handler: &mut H) -> usize {
        let mut count = 0;
        for &byte in bytes {
            if let Some(msg) = self.push(byte) {
                handler.dispatch(msg);
                count += 1;
            }
        }
        count
    }

    fn reject(&mut self, byte: u8, stage: &'static str) {
        trace!(
            byte,
            stage,
            class = self.envelope.class,
            id = self.envelope.id,
            "frame dropped"
        );
        // a preamble byte aborting a frame may be the start of the next one
        self.state = if byte == SYNC1 {
            DecoderState::Sync1
        } else {
            DecoderState::Idle
        };
    }
}

impl Default for UbxDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// UBX checksum: 8-bit Fletcher over class, id, length and payload.
pub fn checksum(bytes: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &byte in bytes {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Build a complete frame around `payload`.
pub fn encode_frame(class: u8, id: u8, payload: &[u8]) -> TNResult<Vec<u8>> {
    if payload.len() > PAYLOAD_CAPACITY {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&[SYNC1, SYNC2, class, id]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    Ok(frame)
}

/// Map a validated frame to a message. Dispatch is keyed on message id alone.
fn decode(envelope: &Envelope) -> Option<NavigationMessage> {
    match decode_payload(envelope.class, envelope.id, &envelope.payload) {
        Ok(msg) => {
            trace!(class = envelope.class, id = envelope.id, len = envelope.len, "frame decoded");
            Some(msg)
        }
        Err(e) => {
            warn!(
                class = envelope.class,
                id = envelope.id,
                len = envelope.len,
                "dropping undecodable payload: {}",
                e
            );
            None
        }
    }
}

pub fn decode_payload(class: u8, id: u8, payload: &[u8]) -> TNResult<NavigationMessage> {
    let msg = match id {
        NAV_POSLLH => NavigationMessage::Posllh(finish(nav_posllh(payload))?),
        NAV_DOP => NavigationMessage::Dop(finish(nav_dop(payload))?),
        NAV_PVT => NavigationMessage::Pvt(finish(nav_pvt(payload))?),
        NAV_VELNED => NavigationMessage::Velned(finish(nav_velned(payload))?),
        _ => NavigationMessage::Unhandled { class, id },
    };
    Ok(msg)
}

fn finish<T>(res: IResult<&[u8], T>) -> TNResult<T> {
    res.finish().map(|(_, v)| v).map_err(|e| e.into())
}

fn nav_posllh(bytes: &[u8]) -> IResult<&[u8], NavPosllh> {
    let (rest, i_tow) = le_u32(bytes)?;
    let (rest, lon) = le_i32(rest)?;
    let (rest, lat) = le_i32(rest)?;
    let (rest, height) = le_i32(rest)?;
    let (rest, h_msl) = le_i32(rest)?;
    let (rest, h_acc) = le_u32(rest)?;
    let (rest, v_acc) = le_u32(rest)?;
    Ok((
        rest,
        NavPosllh {
            i_tow,
            lon,
            lat,
            height,
            h_msl,
            h_acc,
            v_acc,
        },
    ))
}

fn nav_dop(bytes: &[u8]) -> IResult<&[u8], NavDop> {
    let (rest, i_tow) = le_u32(bytes)?;
    let (rest, g_dop) = le_u16(rest)?;
    let (rest, p_dop) = le_u16(rest)?;
    let (rest, t_dop) = le_u16(rest)?;
    let (rest, v_dop) = le_u16(rest)?;
    let (rest, h_dop) = le_u16(rest)?;
    let (rest, n_dop) = le_u16(rest)?;
    let (rest, e_dop) = le_u16(rest)?;
    Ok((
        rest,
        NavDop {
            i_tow,
            g_dop,
            p_dop,
            t_dop,
            v_dop,
            h_dop,
            n_dop,
            e_dop,
        },
    ))
}

fn nav_pvt(bytes: &[u8]) -> IResult<&[u8], NavPvt> {
    let (rest, i_tow) = le_u32(bytes)?;
    // year .. tAcc, nano
    let (rest, _) = take(16usize)(rest)?;
    let (rest, fix_type) = le_u8(rest)?;
    // flags, flags2
    let (rest, _) = take(2usize)(rest)?;
    let (rest, num_sv) = le_u8(rest)?;
    let (rest, lon) = le_i32(rest)?;
    let (rest, lat) = le_i32(rest)?;
    let (rest, height) = le_i32(rest)?;
    let (rest, h_msl) = le_i32(rest)?;
    let (rest, h_acc) = le_u32(rest)?;
    let (rest, v_acc) = le_u32(rest)?;
    let (rest, vel_n) = le_i32(rest)?;
    let (rest, vel_e) = le_i32(rest)?;
    let (rest, vel_d) = le_i32(rest)?;
    // gSpeed, headMot
    let (rest, _) = take(8usize)(rest)?;
    let (rest, s_acc) = le_u32(rest)?;
    Ok((
        rest,
        NavPvt {
            i_tow,
            fix_type,
            num_sv,
            lon,
            lat,
            height,
            h_msl,
            h_acc,
            v_acc,
            vel_n,
            vel_e,
            vel_d,
            s_acc,
        },
    ))
}

fn nav_velned(bytes: &[u8]) -> IResult<&[u8], NavVelned> {
    let (rest, i_tow) = le_u32(bytes)?;
    let (rest, vel_n) = le_i32(rest)?;
    let (rest, vel_e) = le_i32(rest)?;
    let (rest, vel_d) = le_i32(rest)?;
    let (rest, speed) = le_u32(rest)?;
    let (rest, g_speed) = le_u32(rest)?;
    let (rest, heading) = le_i32(rest)?;
    let (rest, s_acc) = le_u32(rest)?;
    let (rest, c_acc) = le_u32(rest)?;
    Ok((
        rest,
        NavVelned {
            i_tow,
            vel_n,
            vel_e,
            vel_d,
            speed,
            g_speed,
            heading,
            s_acc,
            c_acc,
        },
    ))
}
